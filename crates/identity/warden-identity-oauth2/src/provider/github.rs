//! GitHub: OAuth2 only, no ID tokens. Email comes from a second call.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};
use warden_identity_core::claims::value_to_string;
use warden_identity_core::{Identity, apply_defaults, map_claims};

use super::{BaseProvider, Provider, ProviderKind};
use crate::config::{OAuthProviderConfig, ProviderSettings};
use crate::error::{OAuth2Error, OAuth2Result};
use crate::types::{IdTokenClaims, TokenResponse};

#[derive(Debug, Clone, Deserialize)]
struct GitHubEmail {
    email: String,
    #[serde(default)]
    primary: bool,
    #[serde(default)]
    verified: bool,
}

pub struct GitHubProvider {
    base: BaseProvider,
}

impl GitHubProvider {
    pub fn new(config: OAuthProviderConfig, settings: &ProviderSettings) -> OAuth2Result<Self> {
        Ok(Self {
            base: BaseProvider::new(config, settings, ProviderKind::GitHub)?,
        })
    }

    /// Second user-info endpoint if configured, else `<profile url>/emails`.
    fn emails_url(&self) -> Option<String> {
        let userinfo = &self.base.config().userinfo;
        match userinfo.get(1) {
            Some(endpoint) => Some(endpoint.url.clone()),
            None => userinfo
                .first()
                .map(|profile| format!("{}/emails", profile.url.trim_end_matches('/'))),
        }
    }
}

/// Primary and verified wins, otherwise whatever comes first.
fn select_email(emails: &[GitHubEmail]) -> Option<&GitHubEmail> {
    emails
        .iter()
        .find(|email| email.primary && email.verified)
        .or_else(|| emails.first())
}

#[async_trait]
impl Provider for GitHubProvider {
    fn id(&self) -> &str {
        &self.base.config().id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::GitHub
    }

    fn authorization_url(&self, state: &str) -> OAuth2Result<String> {
        self.base.build_authorization_url(state)
    }

    async fn exchange_code(&self, code: &str) -> OAuth2Result<TokenResponse> {
        self.base.exchange(code).await
    }

    async fn user_info(&self, access_token: &str) -> OAuth2Result<Identity> {
        let config = self.base.config();
        let profile_endpoint = config.userinfo.first().ok_or_else(|| {
            OAuth2Error::ConfigError("github provider has no profile endpoint".to_string())
        })?;

        let profile = self
            .base
            .fetch_json(&profile_endpoint.url, access_token)
            .await?;

        let mut identity = Identity::new(&config.id);
        let mut claims = profile_endpoint.claims.clone();
        apply_defaults(&mut claims, &profile);
        map_claims(&profile, &claims, &mut identity);

        if identity.name.is_empty() {
            if let Some(login) = profile.get("login") {
                identity.name = value_to_string(login);
            }
        }

        if let Some(url) = self.emails_url() {
            match self.base.fetch_json(&url, access_token).await {
                Ok(payload) => {
                    let emails: Vec<GitHubEmail> =
                        serde_json::from_value(payload).unwrap_or_else(|e| {
                            warn!("Unexpected GitHub email list: {}", e);
                            Vec::new()
                        });
                    if let Some(chosen) = select_email(&emails) {
                        identity.email = chosen.email.clone();
                        identity.email_verified = chosen.verified;
                    }
                }
                // Tokens without the user:email scope get 404 here.
                Err(e) => warn!("Could not fetch GitHub email list: {}", e),
            }
        }

        identity.ensure_subject()?;
        debug!("Fetched GitHub identity {}", identity.subject);
        Ok(identity)
    }

    async fn validate_id_token(&self, _id_token: &str) -> OAuth2Result<IdTokenClaims> {
        Err(OAuth2Error::IdTokenUnsupported(self.base.config().id.clone()))
    }
}
