//! Token issuing and verification for warden.
//!
//! [`AuthService`] signs access tokens with a [`KeyManager`], hands out
//! single-use refresh tokens, and revokes access tokens through the
//! [`TokenBlacklist`]. [`LoginCoordinator`] drives the provider redirect and
//! callback that end in a call to [`AuthService::complete_login`].
//!
//! Persistence sits behind [`KeyValueStore`], [`UserRepository`] and
//! [`ClientCredentialRepository`]; in-memory implementations are included.

pub mod bearer;
pub mod blacklist;
pub mod cache;
pub mod claims;
pub mod client_credentials;
pub mod config;
pub mod error;
pub mod keys;
pub mod login;
pub mod repository;
pub mod service;

pub use bearer::BearerAuthProvider;
pub use blacklist::TokenBlacklist;
pub use cache::{CacheError, InMemoryKeyValueStore, KeyValueStore};
pub use claims::Claims;
pub use client_credentials::IssuedClientCredential;
pub use crate::config::{ConfigError, WardenConfig};
pub use error::{SessionError, SessionResult};
pub use keys::{KeyConfig, KeyError, KeyManager, KeySource, PublicKey, SigningMethod};
pub use login::{ClientChallenge, LoginCoordinator, LoginOutcome, LoginRedirect};
pub use repository::{
    ClientCredential, ClientCredentialRepository, InMemoryClientCredentialRepository,
    InMemoryUserRepository, RepositoryError, User, UserRepository,
};
pub use service::{AuthService, AuthSettings, CachedGroups, TokenPair};
