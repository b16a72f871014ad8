//! OAuth2 and OpenID Connect identity providers for warden.
//!
//! - [`provider`]: the [`Provider`] trait and one implementation per provider
//!   family (generic OIDC, Google, GitHub, Microsoft, offline test provider)
//! - [`pkce`]: S256 verifier/challenge generation and verification
//! - [`state`]: short-lived `state` storage binding a redirect to its callback
//! - [`oidc`]: discovery documents and JWKS-backed ID token verification

pub mod config;
pub mod error;
pub mod oidc;
pub mod pkce;
pub mod provider;
pub mod state;
pub mod types;


pub use config::{BuildMode, OAuthProviderConfig, ProviderSettings, UserInfoEndpoint};
pub use error::{OAuth2Error, OAuth2Result};
pub use pkce::{PkceChallenge, PkceError};
pub use provider::{Provider, ProviderKind, ProviderRegistry, build_provider};
pub use state::{InMemoryStateStore, StateError, StateStore, StoredChallenge};
pub use types::{IdTokenClaims, TokenResponse};
