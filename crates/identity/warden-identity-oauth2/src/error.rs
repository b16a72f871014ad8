//! OAuth2 error types.

use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use thiserror::Error;
use warden_identity_core::{ErrorKind, IdentityError};

use crate::pkce::PkceError;
use crate::state::StateError;

pub type OAuth2Result<T> = Result<T, OAuth2Error>;

#[derive(Debug, Error)]
pub enum OAuth2Error {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("PKCE verification failed: {0}")]
    Pkce(#[from] PkceError),

    #[error("Token exchange failed: {0}")]
    TokenExchangeFailed(String),

    #[error("User info request failed: {0}")]
    UserInfoFailed(String),

    #[error("Invalid token response: {0}")]
    InvalidTokenResponse(String),

    #[error("Invalid user info response: {0}")]
    InvalidUserInfoResponse(String),

    #[error("OIDC discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch { expected: String, actual: String },

    #[error("ID token rejected: {0}")]
    IdToken(#[from] jsonwebtoken::errors::Error),

    #[error("ID token signed with unsupported algorithm {0}")]
    UnsupportedAlgorithm(String),

    #[error("No signing key found for kid {0}")]
    UnknownSigningKey(String),

    #[error("Provider {0} does not issue verifiable ID tokens")]
    IdTokenUnsupported(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("Identity error: {0}")]
    IdentityError(#[from] IdentityError),
}

impl OAuth2Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OAuth2Error::HttpError(_)
            | OAuth2Error::TokenExchangeFailed(_)
            | OAuth2Error::UserInfoFailed(_)
            | OAuth2Error::DiscoveryFailed(_)
            | OAuth2Error::ProviderUnavailable(_) => ErrorKind::Unavailable,
            OAuth2Error::State(_) | OAuth2Error::IdTokenUnsupported(_) => ErrorKind::NotFound,
            OAuth2Error::Pkce(err) => err.kind(),
            OAuth2Error::IssuerMismatch { .. }
            | OAuth2Error::UnsupportedAlgorithm(_)
            | OAuth2Error::UnknownSigningKey(_) => ErrorKind::Mismatch,
            OAuth2Error::IdToken(err) => match err.kind() {
                JwtErrorKind::InvalidToken
                | JwtErrorKind::Base64(_)
                | JwtErrorKind::Json(_)
                | JwtErrorKind::Utf8(_) => ErrorKind::Malformed,
                JwtErrorKind::InvalidEcdsaKey
                | JwtErrorKind::InvalidRsaKey(_)
                | JwtErrorKind::InvalidKeyFormat
                | JwtErrorKind::Crypto(_) => ErrorKind::Internal,
                _ => ErrorKind::Mismatch,
            },
            OAuth2Error::ConfigError(_)
            | OAuth2Error::InvalidTokenResponse(_)
            | OAuth2Error::InvalidUserInfoResponse(_)
            | OAuth2Error::SerializationError(_)
            | OAuth2Error::UrlError(_) => ErrorKind::Malformed,
            OAuth2Error::IdentityError(err) => err.kind(),
        }
    }
}
