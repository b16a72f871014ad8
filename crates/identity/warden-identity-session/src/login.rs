//! Authorization code login: redirect out, callback in, tokens out.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;
use warden_identity_oauth2::pkce::{
    S256, validate_code_challenge, validate_code_challenge_format, validate_code_verifier_format,
};
use warden_identity_oauth2::{
    OAuth2Error, PkceError, ProviderRegistry, StateError, StateStore, StoredChallenge,
};

use crate::error::SessionResult;
use crate::service::{AuthService, TokenPair};

pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(600);

/// PKCE values a public client sent with its login request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientChallenge {
    pub code_challenge: String,
    pub code_challenge_method: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRedirect {
    pub state: String,
    pub authorization_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    pub provider_id: String,
    pub tokens: TokenPair,
    /// Where the client asked to land after login, if anywhere.
    pub callback_url: Option<String>,
}

/// Binds each provider redirect to its callback through a `state` value.
pub struct LoginCoordinator {
    providers: ProviderRegistry,
    states: Arc<dyn StateStore>,
    auth: Arc<AuthService>,
    state_ttl: Duration,
}

impl LoginCoordinator {
    pub fn new(
        providers: ProviderRegistry,
        states: Arc<dyn StateStore>,
        auth: Arc<AuthService>,
    ) -> Self {
        Self {
            providers,
            states,
            auth,
            state_ttl: DEFAULT_STATE_TTL,
        }
    }

    pub fn with_state_ttl(mut self, ttl: Duration) -> Self {
        self.state_ttl = ttl;
        self
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Stores a fresh `state` and returns the provider URL to redirect to.
    pub async fn begin(
        &self,
        provider_id: &str,
        callback_url: Option<&str>,
        challenge: Option<ClientChallenge>,
    ) -> SessionResult<LoginRedirect> {
        let provider = self.providers.get(provider_id)?;

        if let Some(challenge) = &challenge {
            if challenge.code_challenge_method != S256 {
                return Err(OAuth2Error::from(PkceError::UnsupportedMethod(
                    challenge.code_challenge_method.clone(),
                ))
                .into());
            }
            validate_code_challenge_format(&challenge.code_challenge)
                .map_err(OAuth2Error::from)?;
        }
        if let Some(url) = callback_url {
            Url::parse(url).map_err(OAuth2Error::from)?;
        }

        let state = Uuid::new_v4().to_string();
        self.states
            .store_state(&state, provider_id, self.state_ttl)
            .await?;
        if let Some(url) = callback_url {
            self.states
                .store_callback_url(&state, url, self.state_ttl)
                .await?;
        }
        if let Some(challenge) = challenge {
            self.states
                .store_pkce_challenge(
                    &state,
                    StoredChallenge {
                        code_challenge: challenge.code_challenge,
                        code_challenge_method: challenge.code_challenge_method,
                    },
                    self.state_ttl,
                )
                .await?;
        }

        let authorization_url = provider.authorization_url(&state)?;
        info!(provider_id = %provider_id, "Started login");
        Ok(LoginRedirect {
            state,
            authorization_url,
        })
    }

    /// Handles the provider callback.
    ///
    /// The state is consumed before the code is exchanged, so a replayed
    /// callback fails even if the first attempt did not finish.
    pub async fn complete(
        &self,
        state: &str,
        code: &str,
        code_verifier: Option<&str>,
    ) -> SessionResult<LoginOutcome> {
        let provider_id = self.states.validate_state(state).await?;
        let callback_url = self.states.get_callback_url(state).await?;
        let challenge = self.states.get_pkce_challenge(state).await?;
        self.states.delete_state(state).await?;

        if let Some(challenge) = challenge {
            let verifier = code_verifier.ok_or_else(|| {
                OAuth2Error::from(PkceError::InvalidVerifier("code_verifier is required"))
            })?;
            validate_code_verifier_format(verifier).map_err(OAuth2Error::from)?;
            validate_code_challenge(
                verifier,
                &challenge.code_challenge,
                &challenge.code_challenge_method,
            )
            .map_err(OAuth2Error::from)?;
            debug!("PKCE verifier accepted");
        }

        let provider = self.providers.get(&provider_id)?;
        let upstream = provider.exchange_code(code).await?;

        if let Some(id_token) = upstream.id_token.as_deref() {
            match provider.validate_id_token(id_token).await {
                Ok(claims) => debug!("ID token verified for {}", claims.sub),
                Err(OAuth2Error::IdTokenUnsupported(_)) => {
                    warn!(provider_id = %provider_id, "ID token not verified");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let identity = provider.user_info(&upstream.access_token).await?;
        let tokens = self.auth.complete_login(&provider_id, &identity).await?;

        info!(provider_id = %provider_id, "Login completed");
        Ok(LoginOutcome {
            provider_id,
            tokens,
            callback_url,
        })
    }

    /// Drops states whose TTL passed; the store's own sweep does the same.
    pub async fn cleanup(&self) -> SessionResult<usize> {
        Ok(self.states.cleanup_expired().await?)
    }
}

/// True when `err` means the login round-trip must start over.
pub fn is_stale_state(err: &crate::error::SessionError) -> bool {
    matches!(
        err,
        crate::error::SessionError::OAuth2(OAuth2Error::State(
            StateError::NotFound | StateError::Expired
        ))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyConfig, KeyManager};
    use crate::service::AuthSettings;
    use warden_identity_core::ErrorKind;
    use warden_identity_oauth2::pkce::compute_code_challenge;
    use warden_identity_oauth2::{
        BuildMode, InMemoryStateStore, OAuthProviderConfig, ProviderSettings,
    };

    const CALLBACK: &str = "http://localhost:8080/oauth2/callback";

    async fn coordinator() -> LoginCoordinator {
        let settings = ProviderSettings::new(CALLBACK).with_build_mode(BuildMode::Test);
        let providers = ProviderRegistry::from_configs(
            &[OAuthProviderConfig::new("test", "", "")],
            &settings,
        )
        .await
        .unwrap();
        let keys = KeyManager::new(&KeyConfig::hmac("login-test-secret")).unwrap();
        let auth = Arc::new(AuthService::in_memory(keys, AuthSettings::new(CALLBACK)));

        LoginCoordinator::new(providers, Arc::new(InMemoryStateStore::new()), auth)
    }

    #[tokio::test]
    async fn full_login_with_pkce() {
        let coordinator = coordinator().await;
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

        let redirect = coordinator
            .begin(
                "test",
                Some("http://localhost:3000/done"),
                Some(ClientChallenge {
                    code_challenge: compute_code_challenge(verifier),
                    code_challenge_method: "S256".to_string(),
                }),
            )
            .await
            .unwrap();
        assert!(redirect.authorization_url.contains(&redirect.state));

        let outcome = coordinator
            .complete(&redirect.state, "code-for-erin", Some(verifier))
            .await
            .unwrap();

        assert_eq!(outcome.provider_id, "test");
        assert_eq!(outcome.callback_url.as_deref(), Some("http://localhost:3000/done"));
        let claims = coordinator
            .auth
            .validate_token(&outcome.tokens.access_token)
            .unwrap();
        assert!(claims.sub.starts_with("testuser-"));
        assert_eq!(claims.idp, "test");

        // The state is gone after one use.
        let err = coordinator
            .complete(&redirect.state, "code-for-erin", Some(verifier))
            .await
            .unwrap_err();
        assert!(is_stale_state(&err));
    }

    #[tokio::test]
    async fn wrong_or_missing_verifier() {
        let coordinator = coordinator().await;
        let challenge = || ClientChallenge {
            code_challenge: compute_code_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            code_challenge_method: "S256".to_string(),
        };

        let redirect = coordinator.begin("test", None, Some(challenge())).await.unwrap();
        let err = coordinator
            .complete(
                &redirect.state,
                "code",
                Some("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Mismatch);

        let redirect = coordinator.begin("test", None, Some(challenge())).await.unwrap();
        let err = coordinator
            .complete(&redirect.state, "code", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }

    #[tokio::test]
    async fn plain_method_and_unknown_provider_are_refused() {
        let coordinator = coordinator().await;

        let err = coordinator
            .begin(
                "test",
                None,
                Some(ClientChallenge {
                    code_challenge: "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk".to_string(),
                    code_challenge_method: "plain".to_string(),
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Mismatch);

        let err = coordinator.begin("okta", None, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = coordinator
            .complete("never-issued", "code", None)
            .await
            .unwrap_err();
        assert!(is_stale_state(&err));
    }

    #[tokio::test]
    async fn login_without_pkce() {
        let coordinator = coordinator().await;
        let redirect = coordinator.begin("test", None, None).await.unwrap();
        let outcome = coordinator
            .complete(&redirect.state, "code", Some("ignored"))
            .await
            .unwrap();
        assert!(outcome.callback_url.is_none());
        assert!(outcome.tokens.refresh_token.is_some());
    }
}
