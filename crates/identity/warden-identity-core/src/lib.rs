//! Canonical identity model shared by every warden identity provider.
//!
//! Providers hand back wildly different user-info payloads; [`claims`] turns
//! them into an [`Identity`] with the help of the [`path`] expression language.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod claims;
pub mod path;

pub use claims::{ClaimMappings, apply_defaults, default_claim_mappings, map_claims};
pub use path::{PathError, extract};

/// Coarse error classes shared by all warden crates.
///
/// Callers branch on these instead of matching individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Something looked up is absent. Usually not fatal.
    NotFound,
    /// Structurally broken input such as a bad JWT, PEM or PKCE value.
    Malformed,
    /// Security relevant disagreement: algorithm, issuer, audience, challenge.
    Mismatch,
    /// An upstream dependency failed. Safe to retry.
    Unavailable,
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Unavailable)
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Provider did not return a subject identifier")]
    MissingSubject,

    #[error("Claim path error: {0}")]
    Path(#[from] PathError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl IdentityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IdentityError::ProviderNotFound(_) | IdentityError::MissingSubject => {
                ErrorKind::NotFound
            }
            IdentityError::Path(err) => err.kind(),
            IdentityError::SerializationError(_) => ErrorKind::Malformed,
        }
    }
}

pub type IdentityResult<T> = Result<T, IdentityError>;

/// User claims as asserted by an identity provider after normalisation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// The provider's own user id.
    pub subject: String,
    pub email: String,
    pub email_verified: bool,
    pub name: String,
    pub given_name: String,
    pub family_name: String,
    pub picture: String,
    pub groups: Vec<String>,
    /// Id of the provider configuration that produced this identity.
    pub identity_provider: String,
}

impl Identity {
    pub fn new(identity_provider: impl Into<String>) -> Self {
        Self {
            identity_provider: identity_provider.into(),
            ..Self::default()
        }
    }

    /// Fails when no pass over the provider payloads produced a subject.
    pub fn ensure_subject(&self) -> IdentityResult<()> {
        if self.subject.is_empty() {
            Err(IdentityError::MissingSubject)
        } else {
            Ok(())
        }
    }

    /// Best human readable label: name, then email, then subject.
    pub fn display_name(&self) -> &str {
        [&self.name, &self.email, &self.subject]
            .into_iter()
            .find(|value| !value.is_empty())
            .map(String::as_str)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_falls_back_to_email_then_subject() {
        let mut identity = Identity::new("google");
        identity.subject = "1234".to_string();
        assert_eq!(identity.display_name(), "1234");

        identity.email = "jane@example.com".to_string();
        assert_eq!(identity.display_name(), "jane@example.com");

        identity.name = "Jane".to_string();
        assert_eq!(identity.display_name(), "Jane");
    }

    #[test]
    fn missing_subject_is_not_found() {
        let identity = Identity::new("github");
        let err = identity.ensure_subject().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(ErrorKind::Unavailable.is_retryable());
        assert!(!ErrorKind::Mismatch.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
    }
}
