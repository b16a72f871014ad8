//! Upstream identity providers.
//!
//! Every provider family speaks the same four operations through
//! [`Provider`]; the family itself is picked from the configured provider id
//! by [`build_provider`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};
use warden_identity_core::{Identity, IdentityError};

use crate::config::{OAuthProviderConfig, ProviderSettings, UserInfoEndpoint};
use crate::error::OAuth2Result;
use crate::types::{IdTokenClaims, TokenResponse};

mod base;
mod github;
mod oidc;
mod testing;

pub use base::BaseProvider;
pub use github::GitHubProvider;
pub use oidc::OidcProvider;
pub use testing::TestProvider;

/// One OAuth2/OIDC authorization code flow.
///
/// Network calls are bounded by the HTTP client timeout; callers that need a
/// tighter deadline wrap the returned futures in `tokio::time::timeout`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Configured provider id, e.g. `google`.
    fn id(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// URL the user agent is redirected to, carrying `state`.
    fn authorization_url(&self, state: &str) -> OAuth2Result<String>;

    async fn exchange_code(&self, code: &str) -> OAuth2Result<TokenResponse>;

    async fn user_info(&self, access_token: &str) -> OAuth2Result<Identity>;

    async fn validate_id_token(&self, id_token: &str) -> OAuth2Result<IdTokenClaims>;
}

/// Provider families with distinct protocol behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Google,
    GitHub,
    Microsoft,
    Test,
    /// Any standards compliant OIDC provider, or plain OAuth2 without an issuer.
    Oidc,
}

pub const GOOGLE_ISSUER: &str = "https://accounts.google.com";
pub const MICROSOFT_COMMON_ISSUER: &str = "https://login.microsoftonline.com/common/v2.0";
pub const GITHUB_AUTHORIZATION_URL: &str = "https://github.com/login/oauth/authorize";
pub const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
pub const GITHUB_USER_URL: &str = "https://api.github.com/user";

impl ProviderKind {
    pub fn from_id(id: &str) -> Self {
        match id {
            "google" => ProviderKind::Google,
            "github" => ProviderKind::GitHub,
            "microsoft" | "azure" | "entra" => ProviderKind::Microsoft,
            "test" => ProviderKind::Test,
            _ => ProviderKind::Oidc,
        }
    }

    /// Fills in well-known endpoints the configuration left empty.
    pub fn with_defaults(self, mut config: OAuthProviderConfig) -> OAuthProviderConfig {
        let oidc_scopes = || vec!["openid".into(), "email".into(), "profile".into()];

        match self {
            ProviderKind::Google => {
                if config.issuer.is_empty() {
                    config.issuer = GOOGLE_ISSUER.to_string();
                }
                if config.scopes.is_empty() {
                    config.scopes = oidc_scopes();
                }
            }
            ProviderKind::Microsoft => {
                if config.issuer.is_empty() {
                    config.issuer = MICROSOFT_COMMON_ISSUER.to_string();
                }
                if config.scopes.is_empty() {
                    config.scopes = oidc_scopes();
                }
            }
            ProviderKind::GitHub => {
                if config.authorization_url.is_empty() {
                    config.authorization_url = GITHUB_AUTHORIZATION_URL.to_string();
                }
                if config.token_url.is_empty() {
                    config.token_url = GITHUB_TOKEN_URL.to_string();
                }
                if config.accept_header.is_empty() {
                    config.accept_header = "application/json".to_string();
                }
                if config.scopes.is_empty() {
                    config.scopes = vec!["read:user".into(), "user:email".into()];
                }
                if config.userinfo.is_empty() {
                    config.userinfo.push(
                        UserInfoEndpoint::new(GITHUB_USER_URL)
                            .with_claim("subject_claim", "id")
                            .with_claim("name_claim", "name")
                            .with_claim("email_claim", "email")
                            .with_claim("picture_claim", "avatar_url"),
                    );
                }
            }
            ProviderKind::Test | ProviderKind::Oidc => {}
        }
        config
    }
}

pub(crate) fn http_client(timeout: Duration) -> OAuth2Result<Client> {
    let client = Client::builder()
        .timeout(timeout)
        .user_agent(concat!("warden/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

/// Builds the provider family selected by `config.id`.
///
/// OIDC families fetch their discovery document here, so construction needs
/// the network.
pub async fn build_provider(
    config: &OAuthProviderConfig,
    settings: &ProviderSettings,
) -> OAuth2Result<Arc<dyn Provider>> {
    let kind = ProviderKind::from_id(&config.id);
    let config = kind.with_defaults(config.clone());
    if kind != ProviderKind::Test {
        config.validate()?;
    }

    let provider: Arc<dyn Provider> = match kind {
        ProviderKind::Test => Arc::new(TestProvider::new(config, settings)?),
        ProviderKind::GitHub => Arc::new(GitHubProvider::new(config, settings)?),
        ProviderKind::Google | ProviderKind::Microsoft => {
            Arc::new(OidcProvider::discover(config, settings, kind).await?)
        }
        ProviderKind::Oidc if !config.issuer.is_empty() => {
            Arc::new(OidcProvider::discover(config, settings, kind).await?)
        }
        ProviderKind::Oidc => {
            info!(
                "Provider {} has no issuer, using plain OAuth2 without ID tokens",
                config.id
            );
            Arc::new(BaseProvider::new(config, settings, kind)?)
        }
    };

    Ok(provider)
}

/// Enabled providers by id.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_configs<'a>(
        configs: impl IntoIterator<Item = &'a OAuthProviderConfig>,
        settings: &ProviderSettings,
    ) -> OAuth2Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            if !config.enabled {
                debug!("Skipping disabled provider {}", config.id);
                continue;
            }
            let provider = build_provider(config, settings).await?;
            info!(
                "Registered {:?} provider {}",
                provider.kind(),
                config.display_name()
            );
            registry.register(provider);
        }
        Ok(registry)
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    pub fn get(&self, id: &str) -> OAuth2Result<Arc<dyn Provider>> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| IdentityError::ProviderNotFound(id.to_string()).into())
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
