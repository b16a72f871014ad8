//! OIDC providers: Google, Microsoft and anything else with a discovery document.

use async_trait::async_trait;
use tracing::{info, warn};
use warden_identity_core::Identity;

use super::{BaseProvider, GOOGLE_ISSUER, Provider, ProviderKind, http_client};
use crate::config::{OAuthProviderConfig, ProviderSettings, UserInfoEndpoint};
use crate::error::{OAuth2Error, OAuth2Result};
use crate::oidc::{IdTokenVerifier, IssuerCheck, JwksCache, TENANT_PLACEHOLDER, discover};
use crate::types::{IdTokenClaims, TokenResponse};

pub struct OidcProvider {
    base: BaseProvider,
    /// `None` only when the operator allowed unverified ID tokens.
    verifier: Option<IdTokenVerifier>,
}

impl OidcProvider {
    /// Fetches the discovery document and sets up ID token verification.
    ///
    /// Discovered endpoints take precedence over configured ones, except for
    /// user-info endpoints and the JWKS URL which the configuration may pin.
    pub async fn discover(
        mut config: OAuthProviderConfig,
        settings: &ProviderSettings,
        kind: ProviderKind,
    ) -> OAuth2Result<Self> {
        let http = http_client(settings.http_timeout)?;
        let metadata = discover(&http, &config.issuer).await?;

        config.authorization_url = metadata.authorization_endpoint.clone();
        config.token_url = metadata.token_endpoint.clone();
        if config.userinfo.is_empty() {
            if let Some(endpoint) = &metadata.userinfo_endpoint {
                config.userinfo.push(UserInfoEndpoint::new(endpoint));
            }
        }
        let jwks_url = if config.jwks_url.is_empty() {
            metadata.jwks_uri.clone()
        } else {
            config.jwks_url.clone()
        };

        let verifier = match issuer_check(kind, &config.issuer, &metadata.issuer) {
            Some(check) => Some(IdTokenVerifier::new(
                config.client_id.clone(),
                check,
                JwksCache::new(http.clone(), jwks_url),
            )),
            None if config.allow_unverified_id_tokens => {
                warn!(
                    "Issuer mismatch for provider {} (configured {}, discovered {}); ID tokens will NOT be verified",
                    config.id, config.issuer, metadata.issuer
                );
                None
            }
            None => {
                return Err(OAuth2Error::IssuerMismatch {
                    expected: config.issuer.clone(),
                    actual: metadata.issuer.clone(),
                });
            }
        };

        info!("Discovered OIDC provider {} at {}", config.id, metadata.issuer);
        Ok(Self {
            base: BaseProvider::with_client(config, settings, kind, http),
            verifier,
        })
    }

    pub fn verifies_id_tokens(&self) -> bool {
        self.verifier.is_some()
    }
}

/// Decides how ID token issuers are checked, or `None` when the discovery
/// document disagrees with the configuration.
fn issuer_check(kind: ProviderKind, configured: &str, discovered: &str) -> Option<IssuerCheck> {
    if configured.trim_end_matches('/') == discovered.trim_end_matches('/') {
        let mut allowed = vec![discovered.to_string()];
        if kind == ProviderKind::Google && discovered == GOOGLE_ISSUER {
            // Older Google tokens omit the scheme.
            allowed.push("accounts.google.com".to_string());
        }
        return Some(IssuerCheck::OneOf(allowed));
    }

    if kind == ProviderKind::Microsoft && discovered.contains(TENANT_PLACEHOLDER) {
        return Some(IssuerCheck::TenantTemplate(discovered.to_string()));
    }

    None
}

#[async_trait]
impl Provider for OidcProvider {
    fn id(&self) -> &str {
        &self.base.config().id
    }

    fn kind(&self) -> ProviderKind {
        self.base.kind()
    }

    fn authorization_url(&self, state: &str) -> OAuth2Result<String> {
        self.base.build_authorization_url(state)
    }

    async fn exchange_code(&self, code: &str) -> OAuth2Result<TokenResponse> {
        self.base.exchange(code).await
    }

    async fn user_info(&self, access_token: &str) -> OAuth2Result<Identity> {
        self.base.fetch_identity(access_token).await
    }

    async fn validate_id_token(&self, id_token: &str) -> OAuth2Result<IdTokenClaims> {
        match &self.verifier {
            Some(verifier) => verifier.verify(id_token).await,
            None => Err(OAuth2Error::IdTokenUnsupported(self.base.config().id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_issuer_ignores_trailing_slash() {
        let check = issuer_check(
            ProviderKind::Oidc,
            "https://idp.example.com/",
            "https://idp.example.com",
        );
        assert_eq!(
            check,
            Some(IssuerCheck::OneOf(vec!["https://idp.example.com".to_string()]))
        );
    }

    #[test]
    fn google_accepts_legacy_issuer() {
        let check = issuer_check(ProviderKind::Google, GOOGLE_ISSUER, GOOGLE_ISSUER).unwrap();
        assert!(check.matches("accounts.google.com", None));
        assert!(check.matches(GOOGLE_ISSUER, None));
    }

    #[test]
    fn microsoft_multi_tenant_uses_template() {
        let check = issuer_check(
            ProviderKind::Microsoft,
            "https://login.microsoftonline.com/common/v2.0",
            "https://login.microsoftonline.com/{tenantid}/v2.0",
        );
        assert!(matches!(check, Some(IssuerCheck::TenantTemplate(_))));

        // Only Microsoft gets the template relaxation.
        let check = issuer_check(
            ProviderKind::Oidc,
            "https://login.microsoftonline.com/common/v2.0",
            "https://login.microsoftonline.com/{tenantid}/v2.0",
        );
        assert_eq!(check, None);
    }
}
