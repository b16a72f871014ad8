//! Payload of warden-issued access tokens.

use serde::{Deserialize, Serialize};

/// Access token claims.
///
/// `sub` is the identity provider's user id (or the client id for machine
/// tokens), never the internal user key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub aud: Vec<String>,
    pub exp: i64,
    pub iat: i64,
    pub nbf: i64,
    pub jti: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Identity provider tag, `client_credentials` for machine tokens.
    #[serde(default)]
    pub idp: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Claims {
    pub fn has_audience(&self, audience: &str) -> bool {
        self.aud.iter().any(|aud| aud == audience)
    }
}
