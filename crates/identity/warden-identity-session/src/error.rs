//! Session error types.

use thiserror::Error;
use warden_identity_core::{ErrorKind, IdentityError};
use warden_identity_oauth2::OAuth2Error;

use crate::cache::CacheError;
use crate::keys::KeyError;
use crate::repository::RepositoryError;

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("OAuth2 error: {0}")]
    OAuth2(#[from] OAuth2Error),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Signature was fine but the token was not issued by or for us.
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token revoked")]
    TokenRevoked,

    #[error("Invalid refresh token")]
    InvalidRefreshToken,

    /// Unknown, inactive, expired or wrong secret. Never more specific.
    #[error("invalid_client")]
    InvalidClient,

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Password hashing failed: {0}")]
    PasswordHash(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Key(err) => err.kind(),
            SessionError::OAuth2(err) => err.kind(),
            SessionError::Identity(err) => err.kind(),
            SessionError::Cache(err) => err.kind(),
            SessionError::Repository(err) => err.kind(),
            SessionError::InvalidToken(_)
            | SessionError::TokenRevoked
            | SessionError::InvalidClient => ErrorKind::Mismatch,
            SessionError::InvalidRefreshToken | SessionError::UserNotFound(_) => {
                ErrorKind::NotFound
            }
            SessionError::PasswordHash(_) => ErrorKind::Internal,
            SessionError::SerializationError(_) => ErrorKind::Malformed,
        }
    }

    /// True when the only thing wrong with a token is its age.
    pub fn is_expired(&self) -> bool {
        matches!(self, SessionError::Key(err) if err.is_expired())
    }
}
