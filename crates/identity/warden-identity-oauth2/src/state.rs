//! OAuth2 state management for CSRF protection.
//!
//! Each authorization redirect stores an opaque `state` value together with
//! caller data, the client callback URL and optionally a PKCE challenge. The
//! callback handler validates and then deletes it; single use is up to the
//! caller. Expired entries are removed by a background sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::OAuth2Result;

pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("state not found")]
    NotFound,

    #[error("state expired")]
    Expired,
}

/// PKCE challenge bound to an authorization request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChallenge {
    pub code_challenge: String,
    pub code_challenge_method: String,
}

#[derive(Debug, Clone)]
struct StateEntry {
    /// Set only by `store_state`; entries created by the attach calls never validate.
    data: Option<String>,
    callback_url: Option<String>,
    pkce: Option<StoredChallenge>,
    expires_at: DateTime<Utc>,
}

impl StateEntry {
    fn new(ttl: Duration) -> Self {
        Self {
            data: None,
            callback_url: None,
            pkce: None,
            expires_at: expiry_from_now(ttl),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

fn expiry_from_now(ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_add_signed(ttl)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Trait for OAuth2 state storage
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Stores `data` under `state`, replacing any previous entry.
    async fn store_state(&self, state: &str, data: &str, ttl: Duration) -> OAuth2Result<()>;

    /// Returns the data stored under `state` without consuming it. Only a live
    /// entry written by [`store_state`](Self::store_state) validates.
    async fn validate_state(&self, state: &str) -> OAuth2Result<String>;

    /// Attaches the client's callback URL to `state`. A missing or expired
    /// entry is started afresh, without any previous data.
    async fn store_callback_url(&self, state: &str, url: &str, ttl: Duration) -> OAuth2Result<()>;

    async fn get_callback_url(&self, state: &str) -> OAuth2Result<Option<String>>;

    async fn store_pkce_challenge(
        &self,
        state: &str,
        challenge: StoredChallenge,
        ttl: Duration,
    ) -> OAuth2Result<()>;

    async fn get_pkce_challenge(&self, state: &str) -> OAuth2Result<Option<StoredChallenge>>;

    async fn delete_pkce_challenge(&self, state: &str) -> OAuth2Result<()>;

    /// Removes `state` and everything attached to it. Unknown states are ignored.
    async fn delete_state(&self, state: &str) -> OAuth2Result<()>;

    /// Removes every expired entry and returns how many were dropped.
    async fn cleanup_expired(&self) -> OAuth2Result<usize>;
}

type Entries = Arc<RwLock<HashMap<String, StateEntry>>>;

/// In-memory implementation of [`StateStore`] with a periodic sweep task.
///
/// Must be created inside a Tokio runtime. The sweep stops when the store is
/// dropped or [`InMemoryStateStore::shutdown`] is awaited.
pub struct InMemoryStateStore {
    states: Entries,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::with_cleanup_interval(DEFAULT_CLEANUP_INTERVAL)
    }

    pub fn with_cleanup_interval(interval: Duration) -> Self {
        let states: Entries = Arc::new(RwLock::new(HashMap::new()));
        let cancel = CancellationToken::new();
        let sweeper = tokio::spawn(sweep_loop(states.clone(), cancel.clone(), interval));

        Self {
            states,
            cancel,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Stops the sweep task and waits for it to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.sweeper.lock().await.take() {
            let _ = handle.await;
        }
        info!("State store sweep stopped");
    }

    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn upsert(
        &self,
        state: &str,
        ttl: Duration,
        update: impl FnOnce(&mut StateEntry),
    ) -> OAuth2Result<()> {
        let mut states = self.states.write().await;
        let now = Utc::now();
        let entry = states
            .entry(state.to_string())
            .and_modify(|entry| {
                if entry.is_expired(now) {
                    *entry = StateEntry::new(ttl);
                }
            })
            .or_insert_with(|| StateEntry::new(ttl));
        entry.expires_at = expiry_from_now(ttl);
        update(entry);
        Ok(())
    }

    async fn live_entry(&self, state: &str) -> OAuth2Result<StateEntry> {
        let states = self.states.read().await;
        let entry = states.get(state).ok_or(StateError::NotFound)?;
        if entry.is_expired(Utc::now()) {
            return Err(StateError::Expired.into());
        }
        Ok(entry.clone())
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InMemoryStateStore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn sweep_loop(states: Entries, cancel: CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let removed = remove_expired(&states).await;
                if removed > 0 {
                    debug!("Swept {} expired OAuth2 states", removed);
                }
            }
        }
    }
}

async fn remove_expired(states: &Entries) -> usize {
    let mut states = states.write().await;
    let now = Utc::now();
    let before = states.len();
    states.retain(|_, entry| !entry.is_expired(now));
    before - states.len()
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn store_state(&self, state: &str, data: &str, ttl: Duration) -> OAuth2Result<()> {
        let mut states = self.states.write().await;
        let mut entry = StateEntry::new(ttl);
        entry.data = Some(data.to_string());
        states.insert(state.to_string(), entry);
        Ok(())
    }

    async fn validate_state(&self, state: &str) -> OAuth2Result<String> {
        self.live_entry(state)
            .await?
            .data
            .ok_or_else(|| StateError::NotFound.into())
    }

    async fn store_callback_url(&self, state: &str, url: &str, ttl: Duration) -> OAuth2Result<()> {
        self.upsert(state, ttl, |entry| entry.callback_url = Some(url.to_string()))
            .await
    }

    async fn get_callback_url(&self, state: &str) -> OAuth2Result<Option<String>> {
        Ok(self.live_entry(state).await?.callback_url)
    }

    async fn store_pkce_challenge(
        &self,
        state: &str,
        challenge: StoredChallenge,
        ttl: Duration,
    ) -> OAuth2Result<()> {
        self.upsert(state, ttl, |entry| entry.pkce = Some(challenge))
            .await
    }

    async fn get_pkce_challenge(&self, state: &str) -> OAuth2Result<Option<StoredChallenge>> {
        Ok(self.live_entry(state).await?.pkce)
    }

    async fn delete_pkce_challenge(&self, state: &str) -> OAuth2Result<()> {
        let mut states = self.states.write().await;
        if let Some(entry) = states.get_mut(state) {
            entry.pkce = None;
        }
        Ok(())
    }

    async fn delete_state(&self, state: &str) -> OAuth2Result<()> {
        self.states.write().await.remove(state);
        Ok(())
    }

    async fn cleanup_expired(&self) -> OAuth2Result<usize> {
        Ok(remove_expired(&self.states).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OAuth2Error;

    const TTL: Duration = Duration::from_secs(300);

    fn assert_state_error(result: OAuth2Result<impl std::fmt::Debug>, expected: StateError) {
        match result {
            Err(OAuth2Error::State(err)) => assert_eq!(err, expected),
            other => panic!("expected {expected:?}, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn validate_returns_stored_data_without_consuming() {
        let store = InMemoryStateStore::new();
        store.store_state("abc", "google", TTL).await.unwrap();

        assert_eq!(store.validate_state("abc").await.unwrap(), "google");
        assert_eq!(store.validate_state("abc").await.unwrap(), "google");

        store.delete_state("abc").await.unwrap();
        assert_state_error(store.validate_state("abc").await, StateError::NotFound);
    }

    #[tokio::test]
    async fn unknown_state_is_not_found() {
        let store = InMemoryStateStore::new();
        assert_state_error(store.validate_state("nope").await, StateError::NotFound);
        assert_state_error(store.get_callback_url("nope").await, StateError::NotFound);
    }

    #[tokio::test]
    async fn expired_state_reports_expired_until_swept() {
        let store = InMemoryStateStore::new();
        store
            .store_state("short", "github", Duration::from_millis(20))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_state_error(store.validate_state("short").await, StateError::Expired);

        assert_eq!(store.cleanup_expired().await.unwrap(), 1);
        assert_state_error(store.validate_state("short").await, StateError::NotFound);
    }

    #[tokio::test]
    async fn callback_url_attaches_to_existing_state() {
        let store = InMemoryStateStore::new();
        store.store_state("s1", "microsoft", TTL).await.unwrap();
        assert_eq!(store.get_callback_url("s1").await.unwrap(), None);

        store
            .store_callback_url("s1", "https://app.example.com/done", TTL)
            .await
            .unwrap();

        assert_eq!(store.validate_state("s1").await.unwrap(), "microsoft");
        assert_eq!(
            store.get_callback_url("s1").await.unwrap().as_deref(),
            Some("https://app.example.com/done")
        );
    }

    #[tokio::test]
    async fn callback_url_alone_does_not_make_a_valid_state() {
        let store = InMemoryStateStore::new();
        store
            .store_callback_url("fresh", "https://app.example.com/cb", TTL)
            .await
            .unwrap();

        assert!(store.get_callback_url("fresh").await.unwrap().is_some());
        assert_state_error(store.validate_state("fresh").await, StateError::NotFound);
    }

    fn challenge() -> StoredChallenge {
        StoredChallenge {
            code_challenge: "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM".to_string(),
            code_challenge_method: "S256".to_string(),
        }
    }

    #[tokio::test]
    async fn expired_state_is_not_revived_by_later_writes() {
        let store = InMemoryStateStore::new();
        store
            .store_state("s", "stale-provider", Duration::from_millis(10))
            .await
            .unwrap();
        store
            .store_pkce_challenge("s", challenge(), Duration::from_millis(10))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_state_error(store.validate_state("s").await, StateError::Expired);

        store
            .store_callback_url("s", "https://app.example.com/done", Duration::from_secs(600))
            .await
            .unwrap();

        assert_state_error(store.validate_state("s").await, StateError::NotFound);
        assert_eq!(store.get_pkce_challenge("s").await.unwrap(), None);
        assert_eq!(
            store.get_callback_url("s").await.unwrap().as_deref(),
            Some("https://app.example.com/done")
        );
    }

    #[tokio::test]
    async fn expired_state_is_not_revived_by_pkce_write() {
        let store = InMemoryStateStore::new();
        store
            .store_state("s", "stale-provider", Duration::from_millis(10))
            .await
            .unwrap();
        store
            .store_callback_url("s", "https://old.example.com", Duration::from_millis(10))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        store
            .store_pkce_challenge("s", challenge(), Duration::from_secs(600))
            .await
            .unwrap();

        assert_state_error(store.validate_state("s").await, StateError::NotFound);
        assert_eq!(store.get_callback_url("s").await.unwrap(), None);
        assert_eq!(store.get_pkce_challenge("s").await.unwrap(), Some(challenge()));
    }

    #[tokio::test]
    async fn attached_values_expire_with_the_state() {
        let store = InMemoryStateStore::new();
        let ttl = Duration::from_millis(20);
        store.store_state("s", "google", ttl).await.unwrap();
        store
            .store_callback_url("s", "https://app.example.com/done", ttl)
            .await
            .unwrap();
        store.store_pkce_challenge("s", challenge(), ttl).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_state_error(store.get_callback_url("s").await, StateError::Expired);
        assert_state_error(store.get_pkce_challenge("s").await, StateError::Expired);
        assert_state_error(store.validate_state("s").await, StateError::Expired);
    }

    #[tokio::test]
    async fn state_can_be_stored_again_after_expiry() {
        let store = InMemoryStateStore::new();
        store
            .store_state("s", "old", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        store.store_state("s", "new", TTL).await.unwrap();
        assert_eq!(store.validate_state("s").await.unwrap(), "new");
        assert_eq!(store.get_callback_url("s").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sweep_removes_expired_attach_only_entries() {
        let store = InMemoryStateStore::with_cleanup_interval(Duration::from_millis(25));
        store
            .store_callback_url("cb", "https://app.example.com", Duration::from_millis(10))
            .await
            .unwrap();
        store
            .store_pkce_challenge("pk", challenge(), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(store.len().await, 2);

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(store.is_empty().await);
        assert_state_error(store.get_callback_url("cb").await, StateError::NotFound);
        assert_state_error(store.get_pkce_challenge("pk").await, StateError::NotFound);

        store.shutdown().await;
    }

    #[tokio::test]
    async fn pkce_challenge_lifecycle() {
        let store = InMemoryStateStore::new();
        let challenge = StoredChallenge {
            code_challenge: "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM".to_string(),
            code_challenge_method: "S256".to_string(),
        };

        store.store_state("p1", "google", TTL).await.unwrap();
        store
            .store_pkce_challenge("p1", challenge.clone(), TTL)
            .await
            .unwrap();
        assert_eq!(
            store.get_pkce_challenge("p1").await.unwrap(),
            Some(challenge)
        );

        store.delete_pkce_challenge("p1").await.unwrap();
        assert_eq!(store.get_pkce_challenge("p1").await.unwrap(), None);
        assert_eq!(store.validate_state("p1").await.unwrap(), "google");
    }

    #[tokio::test]
    async fn sweep_removes_expired_entries() {
        let store = InMemoryStateStore::with_cleanup_interval(Duration::from_millis(25));
        store
            .store_state("old", "x", Duration::from_millis(10))
            .await
            .unwrap();
        store.store_state("live", "y", TTL).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(store.len().await, 1);
        assert_state_error(store.validate_state("old").await, StateError::NotFound);
        assert_eq!(store.validate_state("live").await.unwrap(), "y");

        store.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let store = InMemoryStateStore::new();
        store.shutdown().await;
        store.shutdown().await;

        store.store_state("after", "ok", TTL).await.unwrap();
        assert_eq!(store.validate_state("after").await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn concurrent_validations() {
        let store = Arc::new(InMemoryStateStore::new());
        store.store_state("shared", "data", TTL).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.validate_state("shared").await.unwrap() })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), "data");
        }
    }
}
