//! Plain OAuth2 authorization code flow shared by every network provider.

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde_json::Value;
use tracing::{debug, error, info};
use url::Url;
use warden_identity_core::{Identity, apply_defaults, map_claims};

use super::{Provider, ProviderKind, http_client};
use crate::config::{OAuthProviderConfig, ProviderSettings};
use crate::error::{OAuth2Error, OAuth2Result};
use crate::types::{IdTokenClaims, TokenResponse};

/// Authorization URL, code exchange and multi-endpoint user info.
pub struct BaseProvider {
    config: OAuthProviderConfig,
    redirect_uri: String,
    kind: ProviderKind,
    http: Client,
}

impl BaseProvider {
    pub fn new(
        config: OAuthProviderConfig,
        settings: &ProviderSettings,
        kind: ProviderKind,
    ) -> OAuth2Result<Self> {
        let http = http_client(settings.http_timeout)?;
        Ok(Self::with_client(config, settings, kind, http))
    }

    pub(crate) fn with_client(
        config: OAuthProviderConfig,
        settings: &ProviderSettings,
        kind: ProviderKind,
        http: Client,
    ) -> Self {
        Self {
            config,
            redirect_uri: settings.callback_url.clone(),
            kind,
            http,
        }
    }

    pub fn config(&self) -> &OAuthProviderConfig {
        &self.config
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    pub(crate) fn build_authorization_url(&self, state: &str) -> OAuth2Result<String> {
        if self.config.authorization_url.is_empty() {
            return Err(OAuth2Error::ConfigError(format!(
                "provider '{}' has no authorization_url",
                self.config.id
            )));
        }
        let mut url = Url::parse(&self.config.authorization_url)?;

        {
            let mut params = url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &self.config.client_id);
            params.append_pair("redirect_uri", &self.redirect_uri);
            params.append_pair("state", state);

            if !self.config.scopes.is_empty() {
                params.append_pair("scope", &self.config.scopes.join(" "));
            }

            for (key, value) in &self.config.additional_params {
                params.append_pair(key, value);
            }
        }

        debug!("Generated authorization URL for provider {}", self.config.id);
        Ok(url.to_string())
    }

    pub(crate) async fn exchange(&self, code: &str) -> OAuth2Result<TokenResponse> {
        if code.is_empty() {
            return Err(OAuth2Error::TokenExchangeFailed(
                "missing authorization code".to_string(),
            ));
        }
        if self.config.token_url.is_empty() {
            return Err(OAuth2Error::ConfigError(format!(
                "provider '{}' has no token_url",
                self.config.id
            )));
        }

        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];

        let response = self
            .http
            .post(&self.config.token_url)
            .header(ACCEPT, self.config.accept_header_or_default())
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            error!(
                "Token exchange with {} failed with status {}",
                self.config.id, status
            );
            return Err(OAuth2Error::TokenExchangeFailed(format!("{status}: {body}")));
        }

        let value: Value = serde_json::from_str(&body)
            .map_err(|e| OAuth2Error::InvalidTokenResponse(e.to_string()))?;

        // GitHub reports a bad code with 200 OK and an error body.
        if let Some(code) = value.get("error").and_then(Value::as_str) {
            let description = value
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or("No description");
            error!("Provider {} rejected the code: {}", self.config.id, code);
            return Err(OAuth2Error::TokenExchangeFailed(format!(
                "{code}: {description}"
            )));
        }

        let mut tokens: TokenResponse = serde_json::from_value(value)
            .map_err(|e| OAuth2Error::InvalidTokenResponse(e.to_string()))?;
        if tokens.access_token.is_empty() {
            return Err(OAuth2Error::InvalidTokenResponse(
                "empty access_token".to_string(),
            ));
        }
        tokens.expires_in = Some(tokens.expires_in_or_default());

        info!("Successfully exchanged code for tokens with {}", self.config.id);
        Ok(tokens)
    }

    /// GETs a user-info style endpoint with the configured authorization header.
    pub(crate) async fn fetch_json(&self, url: &str, access_token: &str) -> OAuth2Result<Value> {
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, self.config.authorization_header(access_token))
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            error!("User info request to {} returned {}", url, status);
            return Err(OAuth2Error::UserInfoFailed(format!("{url} returned {status}")));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| OAuth2Error::InvalidUserInfoResponse(e.to_string()))
    }

    /// Walks every configured user-info endpoint in order. Only the first one
    /// falls back to the standard claim names.
    pub(crate) async fn fetch_identity(&self, access_token: &str) -> OAuth2Result<Identity> {
        if self.config.userinfo.is_empty() {
            return Err(OAuth2Error::ConfigError(format!(
                "provider '{}' has no userinfo endpoints",
                self.config.id
            )));
        }

        let mut identity = Identity::new(&self.config.id);
        for (index, endpoint) in self.config.userinfo.iter().enumerate() {
            let payload = self.fetch_json(&endpoint.url, access_token).await?;

            let mut claims = endpoint.claims.clone();
            if index == 0 {
                apply_defaults(&mut claims, &payload);
            }
            map_claims(&payload, &claims, &mut identity);
        }

        identity.ensure_subject()?;
        debug!(
            "Fetched identity {} from {}",
            identity.subject, self.config.id
        );
        Ok(identity)
    }
}

#[async_trait]
impl Provider for BaseProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn authorization_url(&self, state: &str) -> OAuth2Result<String> {
        self.build_authorization_url(state)
    }

    async fn exchange_code(&self, code: &str) -> OAuth2Result<TokenResponse> {
        self.exchange(code).await
    }

    async fn user_info(&self, access_token: &str) -> OAuth2Result<Identity> {
        self.fetch_identity(access_token).await
    }

    async fn validate_id_token(&self, _id_token: &str) -> OAuth2Result<IdTokenClaims> {
        Err(OAuth2Error::IdTokenUnsupported(self.config.id.clone()))
    }
}
