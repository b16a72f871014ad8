//! JWT signing keys.
//!
//! A [`KeyManager`] holds exactly one algorithm and one key pair for its whole
//! lifetime. Rotating keys means building a new manager.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation, decode, decode_header,
    encode,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, warn};
use warden_identity_core::ErrorKind;

pub const DEFAULT_KEY_ID: &str = "1";

pub type KeyResult<T> = Result<T, KeyError>;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("unsupported signing method '{0}'")]
    UnsupportedMethod(String),

    #[error("missing {0}")]
    MissingKey(&'static str),

    #[error("cannot read {what} from {path}: {source}")]
    Io {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid {what}: {reason}")]
    InvalidKey { what: &'static str, reason: String },

    #[error("private and public key do not form a pair")]
    KeyPairMismatch,

    #[error("token algorithm {found:?} does not match configured {expected}")]
    AlgorithmMismatch {
        expected: SigningMethod,
        found: Algorithm,
    },

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

impl KeyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeyError::UnsupportedMethod(_)
            | KeyError::MissingKey(_)
            | KeyError::InvalidKey { .. }
            | KeyError::KeyPairMismatch => ErrorKind::Malformed,
            KeyError::Io { .. } => ErrorKind::Internal,
            KeyError::AlgorithmMismatch { .. } => ErrorKind::Mismatch,
            KeyError::Jwt(err) => match err.kind() {
                JwtErrorKind::InvalidToken
                | JwtErrorKind::Base64(_)
                | JwtErrorKind::Json(_)
                | JwtErrorKind::Utf8(_)
                | JwtErrorKind::MissingRequiredClaim(_) => ErrorKind::Malformed,
                JwtErrorKind::InvalidEcdsaKey
                | JwtErrorKind::InvalidRsaKey(_)
                | JwtErrorKind::InvalidKeyFormat
                | JwtErrorKind::Crypto(_) => ErrorKind::Internal,
                _ => ErrorKind::Mismatch,
            },
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, KeyError::Jwt(err) if matches!(err.kind(), JwtErrorKind::ExpiredSignature))
    }
}

/// Supported JWT signing algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SigningMethod {
    #[default]
    HS256,
    RS256,
    ES256,
}

impl SigningMethod {
    pub fn algorithm(self) -> Algorithm {
        match self {
            SigningMethod::HS256 => Algorithm::HS256,
            SigningMethod::RS256 => Algorithm::RS256,
            SigningMethod::ES256 => Algorithm::ES256,
        }
    }

    pub fn is_asymmetric(self) -> bool {
        !matches!(self, SigningMethod::HS256)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SigningMethod::HS256 => "HS256",
            SigningMethod::RS256 => "RS256",
            SigningMethod::ES256 => "ES256",
        }
    }
}

impl fmt::Display for SigningMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SigningMethod {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HS256" => Ok(SigningMethod::HS256),
            "RS256" => Ok(SigningMethod::RS256),
            "ES256" => Ok(SigningMethod::ES256),
            other => Err(KeyError::UnsupportedMethod(other.to_string())),
        }
    }
}

/// PEM given inline or as a file. Inline content wins when both are set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySource {
    pub content: Option<String>,
    pub path: Option<PathBuf>,
}

impl KeySource {
    pub fn inline(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            path: None,
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            content: None,
            path: Some(path.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.as_deref().is_none_or(str::is_empty) && self.path.is_none()
    }

    fn load(&self, what: &'static str) -> KeyResult<String> {
        if let Some(content) = self.content.as_deref().filter(|c| !c.trim().is_empty()) {
            return Ok(content.to_string());
        }
        match &self.path {
            Some(path) => std::fs::read_to_string(path).map_err(|source| KeyError::Io {
                what,
                path: path.clone(),
                source,
            }),
            None => Err(KeyError::MissingKey(what)),
        }
    }
}

/// Everything needed to build a [`KeyManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyConfig {
    pub signing_method: SigningMethod,
    /// HMAC secret, HS256 only.
    pub secret: Option<String>,
    pub private_key: KeySource,
    pub public_key: KeySource,
    pub key_id: String,
}

impl KeyConfig {
    pub fn hmac(secret: impl Into<String>) -> Self {
        Self {
            signing_method: SigningMethod::HS256,
            secret: Some(secret.into()),
            private_key: KeySource::default(),
            public_key: KeySource::default(),
            key_id: DEFAULT_KEY_ID.to_string(),
        }
    }

    pub fn rsa(private_key: KeySource, public_key: KeySource) -> Self {
        Self::asymmetric(SigningMethod::RS256, private_key, public_key)
    }

    pub fn ecdsa(private_key: KeySource, public_key: KeySource) -> Self {
        Self::asymmetric(SigningMethod::ES256, private_key, public_key)
    }

    fn asymmetric(method: SigningMethod, private_key: KeySource, public_key: KeySource) -> Self {
        Self {
            signing_method: method,
            secret: None,
            private_key,
            public_key,
            key_id: DEFAULT_KEY_ID.to_string(),
        }
    }

    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = key_id.into();
        self
    }
}

/// Verification key published for asymmetric methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub algorithm: SigningMethod,
    pub key_id: String,
    pub pem: String,
}

pub struct KeyManager {
    method: SigningMethod,
    key_id: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
    public_pem: Option<String>,
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("method", &self.method)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl KeyManager {
    /// Loads the key material and proves it by signing and verifying a probe
    /// token, so a mismatched pair fails here rather than on the first login.
    pub fn new(config: &KeyConfig) -> KeyResult<Self> {
        let (encoding, decoding, public_pem) = match config.signing_method {
            SigningMethod::HS256 => {
                let secret = config
                    .secret
                    .as_deref()
                    .filter(|secret| !secret.is_empty())
                    .ok_or(KeyError::MissingKey("HMAC secret"))?;
                (
                    EncodingKey::from_secret(secret.as_bytes()),
                    DecodingKey::from_secret(secret.as_bytes()),
                    None,
                )
            }
            SigningMethod::RS256 => {
                let private = config.private_key.load("RSA private key")?;
                let public = config.public_key.load("RSA public key")?;
                let encoding = EncodingKey::from_rsa_pem(private.as_bytes())
                    .map_err(invalid("RSA private key"))?;
                let decoding = DecodingKey::from_rsa_pem(public.as_bytes())
                    .map_err(invalid("RSA public key"))?;
                (encoding, decoding, Some(public))
            }
            SigningMethod::ES256 => {
                let private = config.private_key.load("ECDSA private key")?;
                let public = config.public_key.load("ECDSA public key")?;
                let encoding = ec_encoding_key(&private)?;
                let decoding = DecodingKey::from_ec_pem(public.as_bytes())
                    .map_err(invalid("ECDSA public key"))?;
                (encoding, decoding, Some(public))
            }
        };

        let manager = Self {
            method: config.signing_method,
            key_id: config.key_id.clone(),
            encoding,
            decoding,
            public_pem,
        };
        manager.self_test()?;

        info!(
            "Initialized {} key manager with key id {}",
            manager.method, manager.key_id
        );
        Ok(manager)
    }

    fn self_test(&self) -> KeyResult<()> {
        let probe = json!({
            "sub": "warden-key-check",
            "exp": Utc::now().timestamp() + 60,
        });
        let token = self.sign(&probe).map_err(|e| {
            warn!("Signing key rejected during self test: {}", e);
            KeyError::KeyPairMismatch
        })?;
        self.verify::<Value>(&token).map_err(|e| {
            warn!("Verification key rejected probe token: {}", e);
            KeyError::KeyPairMismatch
        })?;
        Ok(())
    }

    pub fn signing_method(&self) -> SigningMethod {
        self.method
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Signs `claims` with the configured algorithm; the header carries `kid`.
    pub fn sign<T: Serialize>(&self, claims: &T) -> KeyResult<String> {
        let mut header = Header::new(self.method.algorithm());
        header.kid = Some(self.key_id.clone());
        Ok(encode(&header, claims, &self.encoding)?)
    }

    /// Verifies signature and `exp` (plus `nbf` when present) with zero leeway.
    ///
    /// The header algorithm must equal the configured one exactly. Issuer and
    /// audience are left to the caller.
    pub fn verify<T: DeserializeOwned>(&self, token: &str) -> KeyResult<TokenData<T>> {
        let header = decode_header(token)?;
        let expected = self.method.algorithm();
        if header.alg != expected {
            warn!(
                "Rejected token signed with {:?}, expected {}",
                header.alg, self.method
            );
            return Err(KeyError::AlgorithmMismatch {
                expected: self.method,
                found: header.alg,
            });
        }

        let mut validation = Validation::new(expected);
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp"]);

        Ok(decode::<T>(token, &self.decoding, &validation)?)
    }

    /// `None` for HMAC: the shared secret is never published.
    pub fn public_key(&self) -> Option<PublicKey> {
        self.public_pem.as_ref().map(|pem| PublicKey {
            algorithm: self.method,
            key_id: self.key_id.clone(),
            pem: pem.clone(),
        })
    }
}

fn invalid(what: &'static str) -> impl Fn(jsonwebtoken::errors::Error) -> KeyError {
    move |err| KeyError::InvalidKey {
        what,
        reason: err.to_string(),
    }
}

const SEC1_LABEL: &str = "EC PRIVATE KEY";

/// id-ecPublicKey + prime256v1, DER encoded.
const P256_ALGORITHM_ID: [u8; 21] = [
    0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08, 0x2a, 0x86,
    0x48, 0xce, 0x3d, 0x03, 0x01, 0x07,
];

/// Accepts PKCS#8 `PRIVATE KEY` and SEC1 `EC PRIVATE KEY`; the latter is
/// rewrapped as PKCS#8 since the signer only takes that form.
fn ec_encoding_key(pem: &str) -> KeyResult<EncodingKey> {
    if !pem.contains(&format!("BEGIN {SEC1_LABEL}")) {
        return EncodingKey::from_ec_pem(pem.as_bytes()).map_err(invalid("ECDSA private key"));
    }

    let sec1 = pem_body(pem, SEC1_LABEL)?;
    Ok(EncodingKey::from_ec_der(&sec1_to_pkcs8(&sec1)))
}

fn pem_body(pem: &str, label: &str) -> KeyResult<Vec<u8>> {
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");

    let body = pem
        .split_once(&begin)
        .and_then(|(_, rest)| rest.split_once(&end))
        .map(|(body, _)| body)
        .ok_or_else(|| KeyError::InvalidKey {
            what: "ECDSA private key",
            reason: format!("no {label} block"),
        })?;

    let encoded: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD.decode(encoded).map_err(|e| KeyError::InvalidKey {
        what: "ECDSA private key",
        reason: e.to_string(),
    })
}

fn sec1_to_pkcs8(sec1: &[u8]) -> Vec<u8> {
    let mut inner = vec![0x02, 0x01, 0x00];
    inner.extend_from_slice(&P256_ALGORITHM_ID);
    inner.push(0x04);
    inner.extend(der_length(sec1.len()));
    inner.extend_from_slice(sec1);

    let mut der = vec![0x30];
    der.extend(der_length(inner.len()));
    der.extend(inner);
    der
}

fn der_length(len: usize) -> Vec<u8> {
    match len {
        0..=0x7f => vec![len as u8],
        0x80..=0xff => vec![0x81, len as u8],
        _ => vec![0x82, (len >> 8) as u8, len as u8],
    }
}
