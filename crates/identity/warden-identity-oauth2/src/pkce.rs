//! Proof Key for Code Exchange (RFC 7636), S256 only.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{RngCore, thread_rng};
use sha2::{Digest, Sha256};
use thiserror::Error;
use warden_identity_core::ErrorKind;

pub const S256: &str = "S256";

const MIN_LENGTH: usize = 43;
const MAX_LENGTH: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PkceError {
    /// Anything other than the exact string `S256`, including `plain`.
    #[error("unsupported code challenge method '{0}'")]
    UnsupportedMethod(String),

    #[error("code verifier does not match code challenge")]
    ChallengeMismatch,

    #[error("invalid code verifier: {0}")]
    InvalidVerifier(&'static str),

    #[error("invalid code challenge: {0}")]
    InvalidChallenge(&'static str),
}

impl PkceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PkceError::UnsupportedMethod(_) | PkceError::ChallengeMismatch => ErrorKind::Mismatch,
            PkceError::InvalidVerifier(_) | PkceError::InvalidChallenge(_) => ErrorKind::Malformed,
        }
    }
}

/// PKCE code challenge and verifier
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    pub code_verifier: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
}

impl Default for PkceChallenge {
    fn default() -> Self {
        Self::new()
    }
}

impl PkceChallenge {
    /// Generate a new PKCE challenge
    pub fn new() -> Self {
        let code_verifier = generate_code_verifier();
        let code_challenge = compute_code_challenge(&code_verifier);

        Self {
            code_verifier,
            code_challenge,
            code_challenge_method: S256.to_string(),
        }
    }

    pub fn verify(&self, code_verifier: &str) -> Result<(), PkceError> {
        validate_code_challenge(
            code_verifier,
            &self.code_challenge,
            &self.code_challenge_method,
        )
    }
}

/// 32 random bytes, base64url encoded: always 43 characters.
pub fn generate_code_verifier() -> String {
    let mut bytes = [0u8; 32];
    thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn compute_code_challenge(code_verifier: &str) -> String {
    let digest = Sha256::digest(code_verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Checks `code_verifier` against a stored challenge.
pub fn validate_code_challenge(
    code_verifier: &str,
    code_challenge: &str,
    method: &str,
) -> Result<(), PkceError> {
    if method != S256 {
        return Err(PkceError::UnsupportedMethod(method.to_string()));
    }

    let computed = compute_code_challenge(code_verifier);
    if constant_time_eq(computed.as_bytes(), code_challenge.as_bytes()) {
        Ok(())
    } else {
        Err(PkceError::ChallengeMismatch)
    }
}

pub fn validate_code_verifier_format(code_verifier: &str) -> Result<(), PkceError> {
    check_length(code_verifier).map_err(PkceError::InvalidVerifier)?;
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~');
    if !code_verifier.chars().all(allowed) {
        return Err(PkceError::InvalidVerifier(
            "must only contain [A-Za-z0-9-._~]",
        ));
    }
    Ok(())
}

/// Challenges are unpadded base64url, so `.` and `~` are not allowed.
pub fn validate_code_challenge_format(code_challenge: &str) -> Result<(), PkceError> {
    check_length(code_challenge).map_err(PkceError::InvalidChallenge)?;
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_');
    if !code_challenge.chars().all(allowed) {
        return Err(PkceError::InvalidChallenge("must only contain [A-Za-z0-9-_]"));
    }
    Ok(())
}

fn check_length(value: &str) -> Result<(), &'static str> {
    match value.len() {
        len if len < MIN_LENGTH => Err("shorter than 43 characters"),
        len if len > MAX_LENGTH => Err("longer than 128 characters"),
        _ => Ok(()),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
