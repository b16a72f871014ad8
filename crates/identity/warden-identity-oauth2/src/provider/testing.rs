//! Offline provider for development and automated tests.
//!
//! It never touches the network. The user behind a login is derived from the
//! authorization code, so tests pick a user by picking a code.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use url::Url;
use warden_identity_core::Identity;

use super::{Provider, ProviderKind};
use crate::config::{OAuthProviderConfig, ProviderSettings};
use crate::error::{OAuth2Error, OAuth2Result};
use crate::types::{IdTokenClaims, TokenResponse};

pub const TEST_ACCESS_TOKEN_PREFIX: &str = "test_access_token_";
pub const TEST_EMAIL_DOMAIN: &str = "test.local";
const TEST_CLIENT_ID: &str = "warden-test-client";
const TEST_TOKEN_LIFETIME: i64 = 3600;

pub struct TestProvider {
    config: OAuthProviderConfig,
    callback_url: String,
}

impl TestProvider {
    /// Fails in production builds: this provider accepts any code.
    pub fn new(mut config: OAuthProviderConfig, settings: &ProviderSettings) -> OAuth2Result<Self> {
        if settings.build_mode.is_production() {
            return Err(OAuth2Error::ProviderUnavailable(format!(
                "provider '{}' is only available in dev and test builds",
                config.id
            )));
        }
        if config.client_id.is_empty() {
            config.client_id = TEST_CLIENT_ID.to_string();
        }
        warn!(
            "Test identity provider '{}' enabled ({} build)",
            config.id, settings.build_mode
        );

        Ok(Self {
            config,
            callback_url: settings.callback_url.clone(),
        })
    }

    fn origin(&self) -> OAuth2Result<String> {
        let callback = Url::parse(&self.callback_url)?;
        Ok(callback.origin().ascii_serialization())
    }

    fn claims_for(&self, user_number: &str) -> OAuth2Result<IdTokenClaims> {
        let now = Utc::now().timestamp();
        let username = format!("testuser-{user_number}");
        let claims = json!({
            "iss": self.origin()?,
            "sub": username,
            "aud": self.config.client_id,
            "exp": now + TEST_TOKEN_LIFETIME,
            "iat": now,
            "email": format!("{username}@{TEST_EMAIL_DOMAIN}"),
            "email_verified": true,
            "name": format!("Test User {user_number}"),
        });
        Ok(serde_json::from_value(claims)?)
    }
}

/// Eight decimal digits derived from `seed`.
fn user_number(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    let value = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    format!("{:08}", value % 100_000_000)
}

/// Unsigned three part token (`alg: none`).
fn encode_unsigned(claims: &IdTokenClaims) -> OAuth2Result<String> {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    Ok(format!("{header}.{payload}."))
}

#[async_trait]
impl Provider for TestProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Test
    }

    fn authorization_url(&self, state: &str) -> OAuth2Result<String> {
        let mut url = Url::parse(&self.origin()?)?.join("/oauth2/test/authorize")?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.callback_url)
            .append_pair("state", state);
        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str) -> OAuth2Result<TokenResponse> {
        if code.is_empty() {
            return Err(OAuth2Error::TokenExchangeFailed(
                "missing authorization code".to_string(),
            ));
        }

        let number = user_number(code);
        let claims = self.claims_for(&number)?;
        debug!("Test provider issued tokens for testuser-{}", number);

        Ok(TokenResponse {
            access_token: format!(
                "{TEST_ACCESS_TOKEN_PREFIX}{}_{number}",
                Utc::now().timestamp()
            ),
            token_type: "Bearer".to_string(),
            expires_in: Some(TEST_TOKEN_LIFETIME as u64),
            refresh_token: None,
            scope: Some("openid email profile".to_string()),
            id_token: Some(encode_unsigned(&claims)?),
        })
    }

    async fn user_info(&self, access_token: &str) -> OAuth2Result<Identity> {
        let number = access_token
            .strip_prefix(TEST_ACCESS_TOKEN_PREFIX)
            .and_then(|rest| rest.rsplit_once('_'))
            .map(|(_, number)| number)
            .filter(|number| number.len() == 8 && number.bytes().all(|b| b.is_ascii_digit()))
            .ok_or_else(|| {
                OAuth2Error::UserInfoFailed("not an access token from the test provider".to_string())
            })?;

        let username = format!("testuser-{number}");
        Ok(Identity {
            subject: username.clone(),
            email: format!("{username}@{TEST_EMAIL_DOMAIN}"),
            email_verified: true,
            name: format!("Test User {number}"),
            given_name: "Test".to_string(),
            family_name: format!("User {number}"),
            picture: String::new(),
            groups: Vec::new(),
            identity_provider: self.config.id.clone(),
        })
    }

    async fn validate_id_token(&self, id_token: &str) -> OAuth2Result<IdTokenClaims> {
        let malformed = || OAuth2Error::InvalidTokenResponse("malformed test ID token".to_string());

        let mut parts = id_token.split('.');
        let (Some(_header), Some(payload), Some(""), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };

        let bytes = URL_SAFE_NO_PAD.decode(payload).map_err(|_| malformed())?;
        let claims: IdTokenClaims = serde_json::from_slice(&bytes)?;

        if !claims.aud.contains(&self.config.client_id) {
            return Err(OAuth2Error::InvalidTokenResponse(
                "test ID token issued to another client".to_string(),
            ));
        }
        if claims.exp < Utc::now().timestamp() {
            return Err(OAuth2Error::InvalidTokenResponse(
                "test ID token expired".to_string(),
            ));
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildMode;

    fn provider() -> TestProvider {
        let settings = ProviderSettings::new("http://localhost:8080/oauth2/callback")
            .with_build_mode(BuildMode::Test);
        TestProvider::new(OAuthProviderConfig::new("test", "", ""), &settings).unwrap()
    }

    #[test]
    fn refused_in_production() {
        let settings = ProviderSettings::new("http://localhost:8080/oauth2/callback");
        let err = TestProvider::new(OAuthProviderConfig::new("test", "", ""), &settings)
            .err()
            .unwrap();
        assert!(matches!(err, OAuth2Error::ProviderUnavailable(_)));
    }

    #[test]
    fn authorization_url_points_at_local_endpoint() {
        let url = provider().authorization_url("st4te").unwrap();
        assert!(url.starts_with("http://localhost:8080/oauth2/test/authorize?"));
        assert!(url.contains("state=st4te"));
        assert!(url.contains("client_id=warden-test-client"));
    }

    #[tokio::test]
    async fn same_code_same_user() {
        let provider = provider();

        let first = provider.exchange_code("alice").await.unwrap();
        let second = provider.exchange_code("alice").await.unwrap();
        let other = provider.exchange_code("bob").await.unwrap();

        assert!(first.access_token.starts_with(TEST_ACCESS_TOKEN_PREFIX));
        let alice = provider.user_info(&first.access_token).await.unwrap();
        assert_eq!(alice, provider.user_info(&second.access_token).await.unwrap());
        assert_ne!(alice, provider.user_info(&other.access_token).await.unwrap());

        assert!(alice.subject.starts_with("testuser-"));
        assert_eq!(alice.subject.len(), "testuser-".len() + 8);
        assert!(alice.email.ends_with("@test.local"));
        assert!(alice.email_verified);
        assert_eq!(alice.identity_provider, "test");
    }

    #[tokio::test]
    async fn id_token_matches_user_info() {
        let provider = provider();
        let tokens = provider.exchange_code("carol").await.unwrap();

        let claims = provider
            .validate_id_token(tokens.id_token.as_deref().unwrap())
            .await
            .unwrap();
        let identity = provider.user_info(&tokens.access_token).await.unwrap();

        assert_eq!(claims.sub, identity.subject);
        assert_eq!(claims.email.as_deref(), Some(identity.email.as_str()));
        assert_eq!(claims.iss, "http://localhost:8080");
    }

    #[tokio::test]
    async fn rejects_foreign_tokens() {
        let provider = provider();
        assert!(provider.user_info("gho_realtoken").await.is_err());
        assert!(provider.user_info("test_access_token_123_abc").await.is_err());
        assert!(provider.validate_id_token("a.b.c").await.is_err());
        assert!(provider.validate_id_token("not-a-jwt").await.is_err());
        assert!(provider.exchange_code("").await.is_err());
    }
}
