//! OAuth2 configuration types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use warden_identity_core::ClaimMappings;

use crate::error::OAuth2Error;

pub const DEFAULT_AUTH_HEADER_FORMAT: &str = "Bearer {token}";
pub const DEFAULT_ACCEPT_HEADER: &str = "application/json";
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Which kind of deployment is running. Gates the test provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    Dev,
    Test,
    #[default]
    Production,
}

impl BuildMode {
    pub fn is_production(self) -> bool {
        self == BuildMode::Production
    }
}

impl FromStr for BuildMode {
    type Err = OAuth2Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dev" | "development" => Ok(BuildMode::Dev),
            "test" => Ok(BuildMode::Test),
            "production" | "prod" => Ok(BuildMode::Production),
            other => Err(OAuth2Error::ConfigError(format!(
                "unknown build mode '{other}'"
            ))),
        }
    }
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BuildMode::Dev => "dev",
            BuildMode::Test => "test",
            BuildMode::Production => "production",
        })
    }
}

/// One user-info endpoint and the claims it contributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfoEndpoint {
    pub url: String,
    #[serde(default)]
    pub claims: ClaimMappings,
}

impl UserInfoEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            claims: ClaimMappings::new(),
        }
    }

    pub fn with_claim(mut self, claim: impl Into<String>, path: impl Into<String>) -> Self {
        self.claims.insert(claim.into(), path.into());
        self
    }
}

/// Configuration of one upstream identity provider.
///
/// The `id` selects the provider family (`google`, `github`, `microsoft`,
/// `test`); anything else is treated as a generic OIDC provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthProviderConfig {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub client_id: String,
    pub client_secret: String,
    pub authorization_url: String,
    pub token_url: String,
    pub userinfo: Vec<UserInfoEndpoint>,
    pub issuer: String,
    pub jwks_url: String,
    pub scopes: Vec<String>,
    /// Extra query parameters on the authorization URL.
    pub additional_params: BTreeMap<String, String>,
    /// Authorization header template for user-info calls, `{token}` is replaced.
    pub auth_header_format: String,
    /// When set the code exchange sends this `Accept` header.
    pub accept_header: String,
    /// Keep the provider usable without ID token verification when discovery
    /// reports a different issuer.
    pub allow_unverified_id_tokens: bool,
}

impl Default for OAuthProviderConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            enabled: true,
            client_id: String::new(),
            client_secret: String::new(),
            authorization_url: String::new(),
            token_url: String::new(),
            userinfo: Vec::new(),
            issuer: String::new(),
            jwks_url: String::new(),
            scopes: Vec::new(),
            additional_params: BTreeMap::new(),
            auth_header_format: String::new(),
            accept_header: String::new(),
            allow_unverified_id_tokens: false,
        }
    }
}

impl OAuthProviderConfig {
    pub fn new(
        id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            ..Self::default()
        }
    }

    pub fn with_endpoints(
        mut self,
        authorization_url: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        self.authorization_url = authorization_url.into();
        self.token_url = token_url.into();
        self
    }

    pub fn with_userinfo(mut self, endpoint: UserInfoEndpoint) -> Self {
        self.userinfo.push(endpoint);
        self
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    pub fn with_jwks_url(mut self, jwks_url: impl Into<String>) -> Self {
        self.jwks_url = jwks_url.into();
        self
    }

    pub fn with_scopes(mut self, scopes: &[&str]) -> Self {
        self.scopes = scopes.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_params.insert(key.into(), value.into());
        self
    }

    pub fn with_accept_header(mut self, accept: impl Into<String>) -> Self {
        self.accept_header = accept.into();
        self
    }

    pub fn with_auth_header_format(mut self, format: impl Into<String>) -> Self {
        self.auth_header_format = format.into();
        self
    }

    pub fn allow_unverified_id_tokens(mut self, allow: bool) -> Self {
        self.allow_unverified_id_tokens = allow;
        self
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Renders the user-info `Authorization` header for `access_token`.
    pub fn authorization_header(&self, access_token: &str) -> String {
        let format = if self.auth_header_format.is_empty() {
            DEFAULT_AUTH_HEADER_FORMAT
        } else {
            &self.auth_header_format
        };
        format.replace("{token}", access_token)
    }

    pub fn accept_header_or_default(&self) -> &str {
        if self.accept_header.is_empty() {
            DEFAULT_ACCEPT_HEADER
        } else {
            &self.accept_header
        }
    }

    pub fn validate(&self) -> Result<(), OAuth2Error> {
        if self.id.is_empty() {
            return Err(OAuth2Error::ConfigError("provider id is empty".to_string()));
        }
        if self.client_id.is_empty() {
            return Err(OAuth2Error::ConfigError(format!(
                "provider '{}' has no client_id",
                self.id
            )));
        }
        Ok(())
    }
}

/// Settings shared by every provider built from configuration.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// Our own OAuth2 callback, sent as `redirect_uri`.
    pub callback_url: String,
    pub build_mode: BuildMode,
    pub http_timeout: Duration,
}

impl ProviderSettings {
    pub fn new(callback_url: impl Into<String>) -> Self {
        Self {
            callback_url: callback_url.into(),
            build_mode: BuildMode::default(),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    pub fn with_build_mode(mut self, build_mode: BuildMode) -> Self {
        self.build_mode = build_mode;
        self
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }
}
