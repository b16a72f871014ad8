//! Persistent records behind the session service.
//!
//! The traits are the seam to whatever relational store the application runs;
//! the in-memory implementations back tests and single-node setups.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;
use warden_identity_core::{ErrorKind, Identity};

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    Conflict(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl RepositoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RepositoryError::NotFound(_) => ErrorKind::NotFound,
            RepositoryError::Conflict(_) => ErrorKind::Mismatch,
            RepositoryError::Backend(_) => ErrorKind::Unavailable,
        }
    }
}

/// A person who logged in through an upstream identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Internal key. Never placed in tokens.
    pub id: Uuid,
    pub provider: String,
    pub provider_user_id: String,
    pub email: String,
    pub email_verified: bool,
    pub name: String,
    pub identity_provider: String,
    pub groups: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn from_identity(provider: &str, identity: &Identity) -> Self {
        let mut user = Self {
            id: Uuid::new_v4(),
            provider: provider.to_string(),
            provider_user_id: identity.subject.clone(),
            email: String::new(),
            email_verified: false,
            name: String::new(),
            identity_provider: String::new(),
            groups: Vec::new(),
            created_at: Utc::now(),
            last_login_at: None,
        };
        user.merge_identity(identity);
        user
    }

    /// Refreshes provider-owned fields. Empty values do not clear stored ones.
    pub fn merge_identity(&mut self, identity: &Identity) {
        if !identity.email.is_empty() {
            self.email = identity.email.clone();
        }
        if !identity.name.is_empty() {
            self.name = identity.name.clone();
        } else if self.name.is_empty() {
            self.name = identity.display_name().to_string();
        }
        self.email_verified = identity.email_verified;
        self.identity_provider = identity.identity_provider.clone();
        self.groups = identity.groups.clone();
    }
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<User>>;

    async fn find_by_provider(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> RepositoryResult<Option<User>>;

    /// Fails with `Conflict` when the provider identity is already taken.
    async fn create(&self, user: User) -> RepositoryResult<User>;

    async fn update(&self, user: &User) -> RepositoryResult<()>;

    async fn update_last_login(&self, id: Uuid, at: DateTime<Utc>) -> RepositoryResult<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryUserRepository {
    users: RwLock<HashMap<Uuid, User>>,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<User>> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn find_by_provider(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> RepositoryResult<Option<User>> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|user| user.provider == provider && user.provider_user_id == provider_user_id)
            .cloned())
    }

    async fn create(&self, user: User) -> RepositoryResult<User> {
        let mut users = self.users.write().await;
        let taken = users.values().any(|existing| {
            existing.provider == user.provider
                && existing.provider_user_id == user.provider_user_id
        });
        if taken || users.contains_key(&user.id) {
            return Err(RepositoryError::Conflict(format!(
                "{}:{}",
                user.provider, user.provider_user_id
            )));
        }
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn update(&self, user: &User) -> RepositoryResult<()> {
        let mut users = self.users.write().await;
        match users.get_mut(&user.id) {
            Some(existing) => {
                *existing = user.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(user.id.to_string())),
        }
    }

    async fn update_last_login(&self, id: Uuid, at: DateTime<Utc>) -> RepositoryResult<()> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        user.last_login_at = Some(at);
        Ok(())
    }
}

/// Machine-to-machine credential owned by a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCredential {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub client_id: String,
    /// Argon2 PHC string. The plain secret is never stored.
    #[serde(skip_serializing, default)]
    pub secret_hash: String,
    pub name: String,
    pub description: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ClientCredential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

#[async_trait]
pub trait ClientCredentialRepository: Send + Sync {
    async fn create(&self, credential: ClientCredential) -> RepositoryResult<ClientCredential>;

    async fn find_by_client_id(&self, client_id: &str)
    -> RepositoryResult<Option<ClientCredential>>;

    async fn list_by_owner(&self, owner_id: Uuid) -> RepositoryResult<Vec<ClientCredential>>;

    async fn update_last_used(&self, id: Uuid, at: DateTime<Utc>) -> RepositoryResult<()>;

    /// `NotFound` unless `id` exists and belongs to `owner_id`.
    async fn deactivate(&self, id: Uuid, owner_id: Uuid) -> RepositoryResult<()>;

    /// `NotFound` unless `id` exists and belongs to `owner_id`.
    async fn delete(&self, id: Uuid, owner_id: Uuid) -> RepositoryResult<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryClientCredentialRepository {
    credentials: RwLock<HashMap<Uuid, ClientCredential>>,
}

impl InMemoryClientCredentialRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClientCredentialRepository for InMemoryClientCredentialRepository {
    async fn create(&self, credential: ClientCredential) -> RepositoryResult<ClientCredential> {
        let mut credentials = self.credentials.write().await;
        if credentials
            .values()
            .any(|existing| existing.client_id == credential.client_id)
        {
            return Err(RepositoryError::Conflict(credential.client_id));
        }
        credentials.insert(credential.id, credential.clone());
        Ok(credential)
    }

    async fn find_by_client_id(
        &self,
        client_id: &str,
    ) -> RepositoryResult<Option<ClientCredential>> {
        Ok(self
            .credentials
            .read()
            .await
            .values()
            .find(|credential| credential.client_id == client_id)
            .cloned())
    }

    async fn list_by_owner(&self, owner_id: Uuid) -> RepositoryResult<Vec<ClientCredential>> {
        let mut owned: Vec<ClientCredential> = self
            .credentials
            .read()
            .await
            .values()
            .filter(|credential| credential.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by_key(|credential| credential.created_at);
        Ok(owned)
    }

    async fn update_last_used(&self, id: Uuid, at: DateTime<Utc>) -> RepositoryResult<()> {
        let mut credentials = self.credentials.write().await;
        let credential = credentials
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        credential.last_used_at = Some(at);
        Ok(())
    }

    async fn deactivate(&self, id: Uuid, owner_id: Uuid) -> RepositoryResult<()> {
        let mut credentials = self.credentials.write().await;
        match credentials.get_mut(&id) {
            Some(credential) if credential.owner_id == owner_id => {
                credential.active = false;
                Ok(())
            }
            _ => Err(RepositoryError::NotFound(id.to_string())),
        }
    }

    async fn delete(&self, id: Uuid, owner_id: Uuid) -> RepositoryResult<()> {
        let mut credentials = self.credentials.write().await;
        match credentials.get(&id) {
            Some(credential) if credential.owner_id == owner_id => {
                credentials.remove(&id);
                Ok(())
            }
            _ => Err(RepositoryError::NotFound(id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(subject: &str) -> Identity {
        Identity {
            subject: subject.to_string(),
            email: format!("{subject}@example.com"),
            email_verified: true,
            name: "Sam".to_string(),
            groups: vec!["dev".to_string()],
            ..Identity::new("google")
        }
    }

    #[tokio::test]
    async fn users_are_unique_per_provider_identity() {
        let repo = InMemoryUserRepository::new();
        let user = repo
            .create(User::from_identity("google", &identity("1")))
            .await
            .unwrap();

        let found = repo.find_by_provider("google", "1").await.unwrap().unwrap();
        assert_eq!(found, user);
        assert!(repo.find_by_provider("github", "1").await.unwrap().is_none());

        let err = repo
            .create(User::from_identity("google", &identity("1")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Mismatch);

        repo.update_last_login(user.id, Utc::now()).await.unwrap();
        assert!(repo.find_by_id(user.id).await.unwrap().unwrap().last_login_at.is_some());
    }

    #[test]
    fn merge_keeps_fields_the_provider_left_empty() {
        let mut user = User::from_identity("google", &identity("1"));
        let sparse = Identity {
            subject: "1".to_string(),
            ..Identity::new("google")
        };
        user.merge_identity(&sparse);

        assert_eq!(user.email, "1@example.com");
        assert_eq!(user.name, "Sam");
        assert!(!user.email_verified);
        assert!(user.groups.is_empty());
    }

    #[tokio::test]
    async fn credentials_are_scoped_to_their_owner() {
        let repo = InMemoryClientCredentialRepository::new();
        let owner = Uuid::new_v4();
        let credential = ClientCredential {
            id: Uuid::new_v4(),
            owner_id: owner,
            client_id: "wdn_cc_1".to_string(),
            secret_hash: "hash".to_string(),
            name: "ci".to_string(),
            description: String::new(),
            active: true,
            created_at: Utc::now(),
            expires_at: None,
            last_used_at: None,
        };
        repo.create(credential.clone()).await.unwrap();

        assert!(repo.deactivate(credential.id, Uuid::new_v4()).await.is_err());
        assert!(repo.delete(credential.id, Uuid::new_v4()).await.is_err());

        repo.deactivate(credential.id, owner).await.unwrap();
        let stored = repo.find_by_client_id("wdn_cc_1").await.unwrap().unwrap();
        assert!(!stored.active);

        repo.delete(credential.id, owner).await.unwrap();
        assert!(repo.list_by_owner(owner).await.unwrap().is_empty());
    }

    #[test]
    fn secret_hash_is_not_serialized() {
        let credential = ClientCredential {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            client_id: "wdn_cc_1".to_string(),
            secret_hash: "$argon2id$secret".to_string(),
            name: "ci".to_string(),
            description: String::new(),
            active: true,
            created_at: Utc::now(),
            expires_at: None,
            last_used_at: None,
        };
        let json = serde_json::to_string(&credential).unwrap();
        assert!(!json.contains("argon2"));
    }
}
