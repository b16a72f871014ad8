//! [`AuthProvider`] backed by warden-issued access tokens.

use std::sync::Arc;

use tracing::debug;
use warden_auth_core::{AuthError, AuthFuture, AuthProvider, AuthenticatedUser};

use crate::claims::Claims;
use crate::error::SessionError;
use crate::service::AuthService;

pub struct BearerAuthProvider {
    service: Arc<AuthService>,
}

impl BearerAuthProvider {
    pub fn new(service: Arc<AuthService>) -> Self {
        Self { service }
    }
}

fn to_auth_error(err: SessionError) -> AuthError {
    match err {
        SessionError::TokenRevoked => AuthError::TokenRevoked,
        err if err.is_expired() => AuthError::TokenExpired,
        SessionError::Cache(e) => AuthError::Internal(e.to_string()),
        err => {
            debug!("Bearer token rejected: {}", err);
            AuthError::InvalidToken
        }
    }
}

impl From<Claims> for AuthenticatedUser {
    fn from(claims: Claims) -> Self {
        AuthenticatedUser {
            user_id: claims.sub,
            email: claims.email,
            name: claims.name,
            identity_provider: Some(claims.idp).filter(|idp| !idp.is_empty()),
            groups: claims.groups.into_iter().collect(),
            token_id: Some(claims.jti),
        }
    }
}

impl AuthProvider for BearerAuthProvider {
    fn authenticate(&self, token: String) -> AuthFuture<'_> {
        Box::pin(async move {
            let claims = self
                .service
                .authenticate(&token)
                .await
                .map_err(to_auth_error)?;
            Ok(claims.into())
        })
    }
}
