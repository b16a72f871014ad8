//! Configuration loading for warden.
//!
//! Sources, lowest precedence first:
//! - built-in defaults
//! - an optional TOML file (`WARDEN_CONFIG_FILE`, default `warden.toml`)
//! - environment variables with the `WARDEN` prefix and `__` as separator,
//!   e.g. `WARDEN__JWT__SIGNING_METHOD=RS256`
//!
//! A `.env` file is read first when present.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use warden_identity_core::ErrorKind;
use warden_identity_oauth2::{BuildMode, OAuthProviderConfig, ProviderSettings};

use crate::keys::{KeyConfig, KeyError, KeySource, SigningMethod};
use crate::service::AuthSettings;

pub const CONFIG_FILE_ENV: &str = "WARDEN_CONFIG_FILE";
pub const DEFAULT_CONFIG_FILE: &str = "warden.toml";
pub const ENV_PREFIX: &str = "WARDEN";

/// HMAC secret that ships in example configs. Refused in production.
pub const DEV_SECRET: &str = "warden-dev-secret-change-me";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid key configuration: {0}")]
    Key(#[from] KeyError),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::Load(_) | ConfigError::Invalid(_) => ErrorKind::Malformed,
            ConfigError::Key(err) => err.kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub jwt: JwtConfig,
    pub oauth: OAuthConfig,
    pub build_mode: BuildMode,
    pub state: StateConfig,
    pub http_timeout_seconds: u64,
}

/// Signing key selection. Only the fields for `signing_method` are read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    pub signing_method: String,
    pub secret: String,
    pub expiration_seconds: u64,
    pub key_id: String,
    pub rsa_private_key: String,
    pub rsa_private_key_path: Option<PathBuf>,
    pub rsa_public_key: String,
    pub rsa_public_key_path: Option<PathBuf>,
    pub ecdsa_private_key: String,
    pub ecdsa_private_key_path: Option<PathBuf>,
    pub ecdsa_public_key: String,
    pub ecdsa_public_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub callback_url: String,
    /// Keyed by provider id. An entry without `id` takes its key.
    pub providers: BTreeMap<String, OAuthProviderConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub ttl_seconds: u64,
    pub cleanup_interval_seconds: u64,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            jwt: JwtConfig::default(),
            oauth: OAuthConfig::default(),
            build_mode: BuildMode::default(),
            state: StateConfig::default(),
            http_timeout_seconds: 10,
        }
    }
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            signing_method: SigningMethod::HS256.to_string(),
            secret: String::new(),
            expiration_seconds: 3600,
            key_id: crate::keys::DEFAULT_KEY_ID.to_string(),
            rsa_private_key: String::new(),
            rsa_private_key_path: None,
            rsa_public_key: String::new(),
            rsa_public_key_path: None,
            ecdsa_private_key: String::new(),
            ecdsa_private_key_path: None,
            ecdsa_public_key: String::new(),
            ecdsa_public_key_path: None,
        }
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            callback_url: "http://localhost:8080/oauth2/callback".to_string(),
            providers: BTreeMap::new(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 600,
            cleanup_interval_seconds: 60,
        }
    }
}

fn key_source(content: &str, path: Option<&PathBuf>) -> KeySource {
    KeySource {
        content: Some(content.to_string()).filter(|c| !c.trim().is_empty()),
        path: path.cloned(),
    }
}

impl WardenConfig {
    /// Loads `.env`, the config file and the environment, then validates.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!("Loaded environment from {}", path.display());
        }

        let config_path =
            std::env::var(CONFIG_FILE_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        let mut builder = Config::builder();
        if Path::new(&config_path).exists() {
            info!("Loading configuration from {}", config_path);
            builder = builder.add_source(File::with_name(&config_path));
        } else {
            debug!("No config file found at {}, using defaults", config_path);
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Self::from_config(config)
    }

    /// Builds from a TOML document overlaid by the given environment.
    pub fn from_sources(
        toml: &str,
        env: config::Map<String, String>,
    ) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .source(Some(env)),
            )
            .build()?;
        Self::from_config(config)
    }

    fn from_config(config: Config) -> Result<Self, ConfigError> {
        let settings: WardenConfig = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let method = SigningMethod::from_str(&self.jwt.signing_method)?;

        if method == SigningMethod::HS256 {
            if self.jwt.secret.is_empty() {
                return Err(ConfigError::Invalid(
                    "jwt.secret is required for HS256".to_string(),
                ));
            }
            if self.build_mode.is_production() && self.jwt.secret == DEV_SECRET {
                return Err(ConfigError::Invalid(
                    "jwt.secret must be changed from the development default in production"
                        .to_string(),
                ));
            }
            if self.jwt.secret.len() < 32 {
                warn!("JWT secret is shorter than 32 bytes");
            }
        }

        if self.jwt.expiration_seconds == 0 {
            return Err(ConfigError::Invalid(
                "jwt.expiration_seconds must be positive".to_string(),
            ));
        }
        if self.http_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "http_timeout_seconds must be positive".to_string(),
            ));
        }
        if self.state.ttl_seconds == 0 {
            return Err(ConfigError::Invalid(
                "state.ttl_seconds must be positive".to_string(),
            ));
        }
        if self.state.cleanup_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "state.cleanup_interval_seconds must be positive".to_string(),
            ));
        }

        for provider in self.provider_configs() {
            if provider.id != "test" && provider.client_id.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "provider '{}' has no client_id",
                    provider.id
                )));
            }
        }

        Ok(())
    }

    pub fn signing_method(&self) -> Result<SigningMethod, ConfigError> {
        Ok(SigningMethod::from_str(&self.jwt.signing_method)?)
    }

    pub fn key_config(&self) -> Result<KeyConfig, ConfigError> {
        let jwt = &self.jwt;
        let config = match self.signing_method()? {
            SigningMethod::HS256 => KeyConfig::hmac(jwt.secret.clone()),
            SigningMethod::RS256 => KeyConfig::rsa(
                key_source(&jwt.rsa_private_key, jwt.rsa_private_key_path.as_ref()),
                key_source(&jwt.rsa_public_key, jwt.rsa_public_key_path.as_ref()),
            ),
            SigningMethod::ES256 => KeyConfig::ecdsa(
                key_source(&jwt.ecdsa_private_key, jwt.ecdsa_private_key_path.as_ref()),
                key_source(&jwt.ecdsa_public_key, jwt.ecdsa_public_key_path.as_ref()),
            ),
        };
        Ok(config.with_key_id(jwt.key_id.clone()))
    }

    pub fn auth_settings(&self) -> AuthSettings {
        AuthSettings::new(self.oauth.callback_url.clone())
            .with_access_token_ttl(Duration::from_secs(self.jwt.expiration_seconds))
    }

    pub fn provider_settings(&self) -> ProviderSettings {
        ProviderSettings::new(self.oauth.callback_url.clone())
            .with_build_mode(self.build_mode)
            .with_http_timeout(Duration::from_secs(self.http_timeout_seconds))
    }

    /// Provider configs in id order, each with its `id` filled in.
    pub fn provider_configs(&self) -> Vec<OAuthProviderConfig> {
        self.oauth
            .providers
            .iter()
            .map(|(key, provider)| {
                let mut provider = provider.clone();
                if provider.id.is_empty() {
                    provider.id = key.clone();
                }
                provider
            })
            .collect()
    }

    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state.ttl_seconds)
    }

    pub fn state_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.state.cleanup_interval_seconds)
    }
}
