//! Token lifecycle: issue, validate, refresh and revoke.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;
use warden_identity_core::{Identity, IdentityError};

use crate::blacklist::TokenBlacklist;
use crate::cache::{InMemoryKeyValueStore, KeyValueStore, refresh_token_key, user_groups_key};
use crate::claims::Claims;
use crate::error::{SessionError, SessionResult};
use crate::keys::KeyManager;
use crate::repository::{
    ClientCredentialRepository, InMemoryClientCredentialRepository, InMemoryUserRepository, User,
    UserRepository,
};

pub const DEFAULT_ISSUER: &str = "http://localhost:8080";
pub const DEFAULT_ACCESS_TOKEN_TTL: Duration = Duration::from_secs(3600);
pub const REFRESH_TOKEN_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const TOKEN_TYPE: &str = "Bearer";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSettings {
    /// Our OAuth2 callback. Its origin becomes the token issuer and audience.
    pub callback_url: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self::new("")
    }
}

impl AuthSettings {
    pub fn new(callback_url: impl Into<String>) -> Self {
        Self {
            callback_url: callback_url.into(),
            access_token_ttl: DEFAULT_ACCESS_TOKEN_TTL,
            refresh_token_ttl: REFRESH_TOKEN_TTL,
        }
    }

    pub fn with_access_token_ttl(mut self, ttl: Duration) -> Self {
        self.access_token_ttl = ttl;
        self
    }

    pub fn with_refresh_token_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_token_ttl = ttl;
        self
    }

    /// Scheme, host and port of the callback URL.
    pub fn issuer(&self) -> String {
        if self.callback_url.is_empty() {
            return DEFAULT_ISSUER.to_string();
        }
        match Url::parse(&self.callback_url) {
            Ok(url) if url.has_host() => url.origin().ascii_serialization(),
            _ => self.callback_url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    /// Absent for machine tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    pub token_type: String,
}

/// Group snapshot cached at login, keyed by email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedGroups {
    pub email: String,
    pub idp: String,
    pub groups: Vec<String>,
    pub cached_at: i64,
}

/// Fields of an access token that vary per caller.
pub(crate) struct Subject<'a> {
    pub sub: &'a str,
    pub email: Option<&'a str>,
    pub email_verified: bool,
    pub name: Option<&'a str>,
    pub idp: &'a str,
    pub groups: &'a [String],
}

pub struct AuthService {
    pub(crate) keys: Arc<KeyManager>,
    pub(crate) blacklist: TokenBlacklist,
    pub(crate) cache: Arc<dyn KeyValueStore>,
    pub(crate) users: Arc<dyn UserRepository>,
    pub(crate) credentials: Arc<dyn ClientCredentialRepository>,
    pub(crate) settings: AuthSettings,
}

impl AuthService {
    pub fn new(
        keys: Arc<KeyManager>,
        cache: Arc<dyn KeyValueStore>,
        users: Arc<dyn UserRepository>,
        credentials: Arc<dyn ClientCredentialRepository>,
        settings: AuthSettings,
    ) -> Self {
        info!(
            "Auth service issuing {} tokens as {}",
            keys.signing_method(),
            settings.issuer()
        );
        Self {
            blacklist: TokenBlacklist::new(keys.clone(), cache.clone()),
            keys,
            cache,
            users,
            credentials,
            settings,
        }
    }

    /// Everything in process memory; for tests and single-node deployments.
    pub fn in_memory(keys: KeyManager, settings: AuthSettings) -> Self {
        Self::new(
            Arc::new(keys),
            Arc::new(InMemoryKeyValueStore::new()),
            Arc::new(InMemoryUserRepository::new()),
            Arc::new(InMemoryClientCredentialRepository::new()),
            settings,
        )
    }

    pub fn key_manager(&self) -> &KeyManager {
        &self.keys
    }

    pub fn blacklist(&self) -> &TokenBlacklist {
        &self.blacklist
    }

    pub fn settings(&self) -> &AuthSettings {
        &self.settings
    }

    pub fn users(&self) -> &Arc<dyn UserRepository> {
        &self.users
    }

    pub fn issuer(&self) -> String {
        self.settings.issuer()
    }

    pub(crate) fn sign_access_token(&self, subject: Subject<'_>) -> SessionResult<String> {
        let issuer = self.issuer();
        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: issuer.clone(),
            sub: subject.sub.to_string(),
            aud: vec![issuer],
            exp: now + self.settings.access_token_ttl.as_secs() as i64,
            iat: now,
            nbf: now,
            jti: Uuid::new_v4().to_string(),
            email: subject.email.filter(|e| !e.is_empty()).map(str::to_string),
            email_verified: subject.email_verified,
            name: subject.name.filter(|n| !n.is_empty()).map(str::to_string),
            idp: subject.idp.to_string(),
            groups: subject.groups.to_vec(),
        };
        Ok(self.keys.sign(&claims)?)
    }

    /// Issues an access token for `user` plus a single-use refresh token.
    pub async fn generate_tokens(&self, user: &User) -> SessionResult<TokenPair> {
        if user.provider_user_id.is_empty() {
            error!("User {} has no provider user id", user.id);
            return Err(IdentityError::MissingSubject.into());
        }

        let access_token = self.sign_access_token(Subject {
            sub: &user.provider_user_id,
            email: Some(&user.email),
            email_verified: user.email_verified,
            name: Some(&user.name),
            idp: &user.identity_provider,
            groups: &user.groups,
        })?;

        let refresh_token = Uuid::new_v4().to_string();
        self.cache
            .set(
                &refresh_token_key(&refresh_token),
                &user.id.to_string(),
                self.settings.refresh_token_ttl,
            )
            .await?;

        debug!("Issued token pair for user {}", user.id);
        Ok(TokenPair {
            access_token,
            refresh_token: Some(refresh_token),
            expires_in: self.settings.access_token_ttl.as_secs(),
            token_type: TOKEN_TYPE.to_string(),
        })
    }

    /// Verifies the signature, then checks issuer and audience against our own
    /// issuer. Revocation is checked separately, see [`TokenBlacklist`].
    pub fn validate_token(&self, token: &str) -> SessionResult<Claims> {
        let claims = self.keys.verify::<Claims>(token)?.claims;

        let expected = self.issuer();
        if claims.iss != expected {
            warn!("Token issuer {} does not match {}", claims.iss, expected);
            return Err(SessionError::InvalidToken(format!(
                "issuer: expected {expected}, got {}",
                claims.iss
            )));
        }
        if !claims.has_audience(&expected) {
            warn!("Token audience {:?} does not include {}", claims.aud, expected);
            return Err(SessionError::InvalidToken(format!(
                "audience: expected {expected}"
            )));
        }

        Ok(claims)
    }

    /// Full bearer check: not revoked, then [`validate_token`](Self::validate_token).
    pub async fn authenticate(&self, token: &str) -> SessionResult<Claims> {
        if self.blacklist.is_blacklisted(token).await? {
            debug!("Rejected blacklisted token");
            return Err(SessionError::TokenRevoked);
        }
        self.validate_token(token)
    }

    /// Redeems a refresh token for a new pair. The old refresh token is gone
    /// afterwards, whether or not issuing succeeds.
    pub async fn refresh_token(&self, refresh_token: &str) -> SessionResult<TokenPair> {
        let key = refresh_token_key(refresh_token);
        let owner = self
            .cache
            .get(&key)
            .await?
            .ok_or(SessionError::InvalidRefreshToken)?;

        if !self.cache.delete(&key).await? {
            // Lost a race with another redemption of the same token.
            return Err(SessionError::InvalidRefreshToken);
        }

        let user_id = Uuid::parse_str(&owner).map_err(|_| SessionError::InvalidRefreshToken)?;
        let mut user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| SessionError::UserNotFound(user_id.to_string()))?;

        let now = Utc::now();
        if let Err(e) = self.users.update_last_login(user.id, now).await {
            error!("Failed to update last login for {}: {}", user.id, e);
        }
        user.last_login_at = Some(now);

        info!("Refreshed tokens for user {}", user.id);
        self.generate_tokens(&user).await
    }

    /// Deletes a refresh token. Unknown tokens are fine.
    pub async fn revoke_token(&self, refresh_token: &str) -> SessionResult<()> {
        if self.cache.delete(&refresh_token_key(refresh_token)).await? {
            info!("Revoked refresh token");
        }
        Ok(())
    }

    /// RFC 7009 revocation with an optional `token_type_hint`.
    ///
    /// Without a hint the token is tried as an access token first, then as a
    /// refresh token. Unknown tokens succeed silently.
    pub async fn revoke(&self, token: &str, token_type_hint: Option<&str>) -> SessionResult<()> {
        let hint = token_type_hint.unwrap_or_default();

        if hint.is_empty() || hint == "access_token" {
            match self.validate_token(token) {
                Ok(_) => return self.blacklist.blacklist(token).await,
                Err(e) if hint == "access_token" => {
                    debug!("Ignoring revocation of unverifiable access token: {}", e);
                    return Ok(());
                }
                Err(_) => {}
            }
        }

        self.revoke_token(token).await
    }

    /// Ends a session. Each half is attempted even if the other fails, so a
    /// failure leaves at most one of the two tokens usable.
    pub async fn logout(&self, access_token: &str, refresh_token: Option<&str>) {
        if let Err(e) = self.blacklist.blacklist(access_token).await {
            warn!("Failed to blacklist access token on logout: {}", e);
        }
        if let Some(refresh_token) = refresh_token {
            if let Err(e) = self.revoke_token(refresh_token).await {
                warn!("Failed to revoke refresh token on logout: {}", e);
            }
        }
    }

    /// Finds or creates the user behind `identity`, records the login and
    /// issues a token pair.
    pub async fn complete_login(
        &self,
        provider_id: &str,
        identity: &Identity,
    ) -> SessionResult<TokenPair> {
        identity.ensure_subject()?;

        let existing = self
            .users
            .find_by_provider(provider_id, &identity.subject)
            .await?;
        let mut user = match existing {
            Some(mut user) => {
                user.merge_identity(identity);
                if let Err(e) = self.users.update(&user).await {
                    error!("Failed to update provider data for {}: {}", user.id, e);
                }
                user
            }
            None => {
                let user = self
                    .users
                    .create(User::from_identity(provider_id, identity))
                    .await?;
                info!(provider_id = %provider_id, "Created user {}", user.id);
                user
            }
        };

        let now = Utc::now();
        if let Err(e) = self.users.update_last_login(user.id, now).await {
            error!("Failed to update last login for {}: {}", user.id, e);
        }
        user.last_login_at = Some(now);

        if !user.email.is_empty() {
            if let Err(e) = self
                .cache_user_groups(&user.email, &user.identity_provider, &user.groups)
                .await
            {
                warn!("Failed to cache groups for user {}: {}", user.id, e);
            }
        }

        self.generate_tokens(&user).await
    }

    /// Caches `groups` for as long as an access token lives.
    pub async fn cache_user_groups(
        &self,
        email: &str,
        idp: &str,
        groups: &[String],
    ) -> SessionResult<()> {
        let entry = CachedGroups {
            email: email.to_string(),
            idp: idp.to_string(),
            groups: groups.to_vec(),
            cached_at: Utc::now().timestamp(),
        };
        let value = serde_json::to_string(&entry)?;
        self.cache
            .set(
                &user_groups_key(email),
                &value,
                self.settings.access_token_ttl,
            )
            .await?;
        debug!("Cached {} groups for {}", groups.len(), idp);
        Ok(())
    }

    pub async fn cached_groups(&self, email: &str) -> SessionResult<Option<CachedGroups>> {
        match self.cache.get(&user_groups_key(email)).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    pub async fn clear_user_groups(&self, email: &str) -> SessionResult<()> {
        self.cache.delete(&user_groups_key(email)).await?;
        Ok(())
    }
}
