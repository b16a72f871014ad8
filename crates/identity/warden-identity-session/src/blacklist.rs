//! Access token revocation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::cache::{KeyValueStore, blacklist_key};
use crate::claims::Claims;
use crate::error::SessionResult;
use crate::keys::KeyManager;

/// Revoked access tokens, each remembered until it would have expired anyway.
#[derive(Clone)]
pub struct TokenBlacklist {
    keys: Arc<KeyManager>,
    store: Arc<dyn KeyValueStore>,
}

impl TokenBlacklist {
    pub fn new(keys: Arc<KeyManager>, store: Arc<dyn KeyValueStore>) -> Self {
        Self { keys, store }
    }

    /// Revokes `token` for the rest of its lifetime.
    ///
    /// Tokens that fail verification are an error. Tokens that already
    /// expired are accepted and nothing is stored.
    pub async fn blacklist(&self, token: &str) -> SessionResult<()> {
        let claims = match self.keys.verify::<Claims>(token) {
            Ok(data) => data.claims,
            Err(err) if err.is_expired() => {
                debug!("Token already expired, nothing to blacklist");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let remaining_ms = claims
            .exp
            .saturating_mul(1000)
            .saturating_sub(Utc::now().timestamp_millis());
        if remaining_ms <= 0 {
            debug!("Token expires now, nothing to blacklist");
            return Ok(());
        }

        let ttl = Duration::from_millis(remaining_ms as u64);
        self.store.set(&blacklist_key(token), "1", ttl).await?;
        info!(jti = %claims.jti, "Blacklisted token for {:?}", ttl);
        Ok(())
    }

    pub async fn is_blacklisted(&self, token: &str) -> SessionResult<bool> {
        Ok(self.store.exists(&blacklist_key(token)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryKeyValueStore;
    use crate::keys::KeyConfig;
    use serde_json::json;

    fn setup() -> (TokenBlacklist, Arc<KeyManager>, Arc<InMemoryKeyValueStore>) {
        let keys = Arc::new(KeyManager::new(&KeyConfig::hmac("blacklist-test-secret")).unwrap());
        let store = Arc::new(InMemoryKeyValueStore::new());
        (TokenBlacklist::new(keys.clone(), store.clone()), keys, store)
    }

    fn token(keys: &KeyManager, lifetime: i64) -> String {
        token_expiring_at(keys, Utc::now().timestamp() + lifetime)
    }

    fn token_expiring_at(keys: &KeyManager, exp: i64) -> String {
        let now = Utc::now().timestamp();
        keys.sign(&json!({
            "iss": "http://localhost:8080",
            "sub": "user",
            "aud": ["http://localhost:8080"],
            "exp": exp,
            "iat": now,
            "nbf": now,
            "jti": "jti-1",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn blacklisted_until_natural_expiry() {
        let (blacklist, keys, _) = setup();
        let token = token(&keys, 2);

        assert!(!blacklist.is_blacklisted(&token).await.unwrap());
        blacklist.blacklist(&token).await.unwrap();
        assert!(blacklist.is_blacklisted(&token).await.unwrap());

        tokio::time::sleep(Duration::from_millis(2200)).await;
        assert!(!blacklist.is_blacklisted(&token).await.unwrap());
    }

    #[tokio::test]
    async fn far_future_expiry_is_blacklisted() {
        let (blacklist, keys, _) = setup();
        let token = token_expiring_at(&keys, i64::MAX / 10);

        blacklist.blacklist(&token).await.unwrap();
        assert!(blacklist.is_blacklisted(&token).await.unwrap());
    }

    #[tokio::test]
    async fn expired_token_is_a_no_op() {
        let (blacklist, keys, store) = setup();
        let token = token(&keys, -10);

        blacklist.blacklist(&token).await.unwrap();
        assert!(!blacklist.is_blacklisted(&token).await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn unverifiable_token_is_rejected() {
        let (blacklist, _, store) = setup();
        let foreign = KeyManager::new(&KeyConfig::hmac("someone-else")).unwrap();

        assert!(blacklist.blacklist(&token(&foreign, 60)).await.is_err());
        assert!(blacklist.blacklist("not-a-token").await.is_err());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn only_the_hash_is_stored() {
        let (blacklist, keys, store) = setup();
        let token = token(&keys, 60);
        blacklist.blacklist(&token).await.unwrap();

        assert!(!store.exists(&format!("blacklist:token:{token}")).await.unwrap());
        assert!(store.exists(&blacklist_key(&token)).await.unwrap());
    }
}
