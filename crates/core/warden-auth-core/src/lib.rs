//! Bearer authentication traits for services that accept warden-issued tokens.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a bearer credential was refused.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthError {
    /// The token is malformed, badly signed, or issued for someone else.
    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    /// The token was explicitly revoked before its expiry.
    #[error("Token revoked")]
    TokenRevoked,

    #[error("Missing group membership: required {required:?}, has {has:?}")]
    MissingGroups {
        required: Vec<String>,
        has: Vec<String>,
    },

    #[error("Authentication required")]
    AuthenticationRequired,

    /// A backing store failed while the token was checked.
    #[error("Authentication error: {0}")]
    Internal(String),
}

/// The caller behind a verified bearer token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    /// Token subject: provider user id for people, client id for machines.
    pub user_id: String,

    pub email: Option<String>,

    pub name: Option<String>,

    /// Identity provider that vouched for the subject.
    pub identity_provider: Option<String>,

    pub groups: BTreeSet<String>,

    /// Token id, useful for audit trails.
    pub token_id: Option<String>,
}

impl AuthenticatedUser {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            name: None,
            identity_provider: None,
            groups: BTreeSet::new(),
            token_id: None,
        }
    }

    pub fn is_member_of(&self, group: &str) -> bool {
        self.groups.contains(group)
    }
}

pub type AuthResult<T = AuthenticatedUser> = Result<T, AuthError>;

/// Boxed future returned by [`AuthProvider::authenticate`].
pub type AuthFuture<'a, T = AuthenticatedUser> =
    Pin<Box<dyn Future<Output = AuthResult<T>> + Send + 'a>>;

/// Turns a raw bearer token into an [`AuthenticatedUser`].
///
/// Transport layers strip the `Bearer ` prefix and hand the rest over; they
/// never need to know how the token is signed or where revocations live.
pub trait AuthProvider: Send + Sync + 'static {
    /// Verifies `token` and returns the caller it represents.
    fn authenticate(&self, token: String) -> AuthFuture<'_>;

    /// Succeeds when `user` belongs to every group in `required`.
    fn check_groups(&self, user: &AuthenticatedUser, required: &[String]) -> AuthResult<()> {
        let missing = required.iter().any(|group| !user.groups.contains(group));

        if missing {
            Err(AuthError::MissingGroups {
                required: required.to_vec(),
                has: user.groups.iter().cloned().collect(),
            })
        } else {
            Ok(())
        }
    }
}

/// Extracts the token from an `Authorization` header value.
///
/// The scheme is matched case-insensitively; an empty token is treated as absent.
pub fn bearer_token(header_value: &str) -> AuthResult<&str> {
    let (scheme, token) = header_value
        .trim()
        .split_once(' ')
        .ok_or(AuthError::AuthenticationRequired)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::AuthenticationRequired);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::AuthenticationRequired);
    }
    Ok(token)
}
