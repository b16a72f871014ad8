//! Machine-to-machine credentials and the `client_credentials` grant.

use std::sync::OnceLock;

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
};
use chrono::{DateTime, Utc};
use rand::{RngCore, thread_rng};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SessionError, SessionResult};
use crate::repository::ClientCredential;
use crate::service::{AuthService, Subject, TOKEN_TYPE, TokenPair};

pub const CLIENT_ID_PREFIX: &str = "wdn_cc_";
pub const CLIENT_CREDENTIALS_IDP: &str = "client_credentials";

/// A freshly created credential. `client_secret` is shown exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedClientCredential {
    pub credential: ClientCredential,
    pub client_secret: String,
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn hash_secret(secret: &str) -> SessionResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| SessionError::PasswordHash(e.to_string()))
}

/// Hash checked against when the client id is unknown, so both paths cost
/// one Argon2 verification.
fn dummy_hash() -> SessionResult<&'static str> {
    static DUMMY_HASH: OnceLock<String> = OnceLock::new();
    if let Some(hash) = DUMMY_HASH.get() {
        return Ok(hash);
    }
    let hash = hash_secret(&random_hex(32))?;
    Ok(DUMMY_HASH.get_or_init(|| hash))
}

fn verify_secret(secret: &str, hash: &str) -> SessionResult<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| SessionError::PasswordHash(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(secret.as_bytes(), &parsed)
        .is_ok())
}

impl AuthService {
    pub async fn create_client_credential(
        &self,
        owner_id: Uuid,
        name: &str,
        description: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> SessionResult<IssuedClientCredential> {
        let client_secret = random_hex(32);
        let credential = ClientCredential {
            id: Uuid::new_v4(),
            owner_id,
            client_id: format!("{CLIENT_ID_PREFIX}{}", random_hex(16)),
            secret_hash: hash_secret(&client_secret)?,
            name: name.to_string(),
            description: description.to_string(),
            active: true,
            created_at: Utc::now(),
            expires_at,
            last_used_at: None,
        };

        let credential = self.credentials.create(credential).await?;
        info!(owner_id = %owner_id, "Created client credential {}", credential.client_id);

        Ok(IssuedClientCredential {
            credential,
            client_secret,
        })
    }

    /// Exchanges a client id and secret for an access token. Every failure
    /// looks the same to the caller: `invalid_client`.
    pub async fn client_credentials_grant(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> SessionResult<TokenPair> {
        let credential = self.credentials.find_by_client_id(client_id).await?;

        let hash = match &credential {
            Some(credential) => credential.secret_hash.as_str(),
            None => dummy_hash()?,
        };
        let secret_ok = verify_secret(client_secret, hash)?;

        let Some(credential) = credential.filter(|_| secret_ok) else {
            debug!("Client credentials rejected for {}", client_id);
            return Err(SessionError::InvalidClient);
        };
        let now = Utc::now();
        if !credential.active || credential.is_expired(now) {
            debug!("Client credential {} is inactive or expired", client_id);
            return Err(SessionError::InvalidClient);
        }

        if let Err(e) = self.credentials.update_last_used(credential.id, now).await {
            warn!("Failed to record use of client credential {}: {}", client_id, e);
        }

        let access_token = self.sign_access_token(Subject {
            sub: &credential.client_id,
            email: None,
            email_verified: false,
            name: Some(&credential.name),
            idp: CLIENT_CREDENTIALS_IDP,
            groups: &[],
        })?;

        info!("Issued client credentials token for {}", client_id);
        Ok(TokenPair {
            access_token,
            refresh_token: None,
            expires_in: self.settings.access_token_ttl.as_secs(),
            token_type: TOKEN_TYPE.to_string(),
        })
    }

    pub async fn list_client_credentials(
        &self,
        owner_id: Uuid,
    ) -> SessionResult<Vec<ClientCredential>> {
        Ok(self.credentials.list_by_owner(owner_id).await?)
    }

    pub async fn deactivate_client_credential(&self, id: Uuid, owner_id: Uuid) -> SessionResult<()> {
        self.credentials.deactivate(id, owner_id).await?;
        info!(owner_id = %owner_id, "Deactivated client credential {}", id);
        Ok(())
    }

    pub async fn delete_client_credential(&self, id: Uuid, owner_id: Uuid) -> SessionResult<()> {
        self.credentials.delete(id, owner_id).await?;
        info!(owner_id = %owner_id, "Deleted client credential {}", id);
        Ok(())
    }
}
