//! Short-TTL keyed store used for refresh tokens, revocations and group caches.
//!
//! Production deployments back [`KeyValueStore`] with Redis or similar; the
//! in-memory store covers single-process setups and tests.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use warden_identity_core::ErrorKind;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache value error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::Unavailable(_) => ErrorKind::Unavailable,
            CacheError::Serialization(_) => ErrorKind::Malformed,
        }
    }
}

/// Per-key operations only; callers get no cross-key atomicity.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    async fn exists(&self, key: &str) -> CacheResult<bool>;
}

pub fn refresh_token_key(refresh_token: &str) -> String {
    format!("refresh_token:{refresh_token}")
}

/// Revocation marker key. Only the token's SHA-256 is ever stored.
pub fn blacklist_key(token: &str) -> String {
    format!("blacklist:token:{}", sha256_hex(token))
}

pub fn user_groups_key(email: &str) -> String {
    format!("user_groups:{email}")
}

pub fn sha256_hex(value: &str) -> String {
    Sha256::digest(value.as_bytes())
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Longer TTLs are clamped to this.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Expired entries are dropped lazily on access and by [`purge_expired`].
///
/// [`purge_expired`]: InMemoryKeyValueStore::purge_expired
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Purged {} expired cache entries", removed);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let mut entries = self.entries.write().await;
        if ttl.is_zero() {
            entries.remove(key);
            return Ok(());
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl.min(MAX_TTL),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        let mut entries = self.entries.write().await;
        if entries
            .get(key)
            .is_some_and(|entry| !entry.is_live(Instant::now()))
        {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let removed = self.entries.write().await.remove(key);
        Ok(removed.is_some_and(|entry| entry.is_live(Instant::now())))
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let store = InMemoryKeyValueStore::new();
        store.set("k", "v", Duration::from_secs(60)).await.unwrap();

        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.exists("k").await.unwrap());
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_ttl_is_clamped() {
        let store = InMemoryKeyValueStore::new();
        store.set("forever", "v", Duration::MAX).await.unwrap();
        assert!(store.exists("forever").await.unwrap());
    }

    #[tokio::test]
    async fn entries_expire() {
        let store = InMemoryKeyValueStore::new();
        store.set("short", "v", Duration::from_millis(30)).await.unwrap();
        store.set("long", "v", Duration::from_secs(60)).await.unwrap();
        store.set("zero", "v", Duration::ZERO).await.unwrap();

        assert!(!store.exists("zero").await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(!store.exists("short").await.unwrap());
        assert!(store.exists("long").await.unwrap());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn purge_drops_only_expired() {
        let store = InMemoryKeyValueStore::new();
        store.set("a", "1", Duration::from_millis(10)).await.unwrap();
        store.set("b", "2", Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.purge_expired().await, 0);
        assert!(!store.is_empty().await);
    }

    #[test]
    fn key_layout() {
        assert_eq!(refresh_token_key("abc"), "refresh_token:abc");
        assert_eq!(user_groups_key("a@b.c"), "user_groups:a@b.c");

        let key = blacklist_key("header.payload.signature");
        assert!(key.starts_with("blacklist:token:"));
        assert_eq!(key.len(), "blacklist:token:".len() + 64);
        assert!(!key.contains("payload"));
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
