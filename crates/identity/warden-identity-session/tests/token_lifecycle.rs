use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use warden_auth_core::{AuthError, AuthProvider};
use warden_identity_oauth2::pkce::PkceChallenge;
use warden_identity_oauth2::{InMemoryStateStore, ProviderRegistry};
use warden_identity_session::{
    AuthService, BearerAuthProvider, ClientChallenge, KeyConfig, KeyManager, KeySource,
    LoginCoordinator, SessionError, SigningMethod, WardenConfig,
};

const RSA_PRIVATE: &str = include_str!("fixtures/rsa_private_pkcs8.pem");
const RSA_PUBLIC: &str = include_str!("fixtures/rsa_public.pem");
const EC_PRIVATE_SEC1: &str = include_str!("fixtures/ec_private_sec1.pem");
const EC_PUBLIC: &str = include_str!("fixtures/ec_public.pem");

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Stack {
    auth: Arc<AuthService>,
    login: LoginCoordinator,
    bearer: BearerAuthProvider,
}

async fn stack_from_config(config: &WardenConfig) -> Stack {
    let keys = KeyManager::new(&config.key_config().unwrap()).unwrap();
    let auth = Arc::new(AuthService::in_memory(keys, config.auth_settings()));
    let providers =
        ProviderRegistry::from_configs(&config.provider_configs(), &config.provider_settings())
            .await
            .unwrap();
    let states = Arc::new(InMemoryStateStore::with_cleanup_interval(
        config.state_cleanup_interval(),
    ));
    let login = LoginCoordinator::new(providers, states, auth.clone())
        .with_state_ttl(config.state_ttl());

    Stack {
        bearer: BearerAuthProvider::new(auth.clone()),
        auth,
        login,
    }
}

#[tokio::test]
async fn rs256_login_refresh_logout() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let private_path = dir.path().join("private.pem");
    let public_path = dir.path().join("public.pem");
    std::fs::write(&private_path, RSA_PRIVATE).unwrap();
    std::fs::write(&public_path, RSA_PUBLIC).unwrap();

    let toml = format!(
        r#"
build_mode = "test"

[jwt]
signing_method = "RS256"
key_id = "rsa-2024"
rsa_private_key_path = '{}'
rsa_public_key_path = '{}'

[oauth]
callback_url = "https://auth.example.com/oauth2/callback"

[oauth.providers.test]
name = "Test"
"#,
        private_path.display(),
        public_path.display()
    );
    let config = WardenConfig::from_sources(&toml, Default::default()).unwrap();
    let stack = stack_from_config(&config).await;
    assert_eq!(stack.login.providers().ids(), vec!["test"]);

    let published = stack.auth.key_manager().public_key().unwrap();
    assert_eq!(published.algorithm, SigningMethod::RS256);
    assert_eq!(published.key_id, "rsa-2024");

    // Public client login with PKCE.
    let pkce = PkceChallenge::new();
    let redirect = stack
        .login
        .begin(
            "test",
            Some("https://app.example.com/after-login"),
            Some(ClientChallenge {
                code_challenge: pkce.code_challenge.clone(),
                code_challenge_method: pkce.code_challenge_method.clone(),
            }),
        )
        .await
        .unwrap();
    assert!(redirect
        .authorization_url
        .starts_with("https://auth.example.com/oauth2/test/authorize?"));

    let outcome = stack
        .login
        .complete(&redirect.state, "code-for-frankie", Some(&pkce.code_verifier))
        .await
        .unwrap();
    assert_eq!(
        outcome.callback_url.as_deref(),
        Some("https://app.example.com/after-login")
    );

    let first = outcome.tokens;
    let user = stack
        .bearer
        .authenticate(first.access_token.clone())
        .await
        .unwrap();
    assert!(user.user_id.starts_with("testuser-"));
    assert_eq!(user.identity_provider.as_deref(), Some("test"));
    assert!(user.email.as_deref().unwrap().ends_with("@test.local"));

    let claims = stack.auth.validate_token(&first.access_token).unwrap();
    assert_eq!(claims.iss, "https://auth.example.com");
    assert_eq!(claims.aud, vec!["https://auth.example.com"]);

    // Same code, same user: the second login reuses the stored user.
    let redirect = stack.login.begin("test", None, None).await.unwrap();
    let again = stack
        .login
        .complete(&redirect.state, "code-for-frankie", None)
        .await
        .unwrap();
    let again_claims = stack.auth.validate_token(&again.tokens.access_token).unwrap();
    assert_eq!(again_claims.sub, claims.sub);

    // Refresh rotates the refresh token.
    let first_refresh = first.refresh_token.unwrap();
    let second = stack.auth.refresh_token(&first_refresh).await.unwrap();
    assert!(matches!(
        stack.auth.refresh_token(&first_refresh).await,
        Err(SessionError::InvalidRefreshToken)
    ));

    // Logout kills the access token and the rotated refresh token.
    stack
        .auth
        .logout(&second.access_token, second.refresh_token.as_deref())
        .await;
    assert_eq!(
        stack
            .bearer
            .authenticate(second.access_token.clone())
            .await
            .unwrap_err(),
        AuthError::TokenRevoked
    );
    assert!(stack
        .auth
        .refresh_token(second.refresh_token.as_deref().unwrap())
        .await
        .is_err());

    // The first access token was never revoked.
    assert!(stack.bearer.authenticate(first.access_token).await.is_ok());
}

#[tokio::test]
async fn tokens_from_another_key_are_refused() {
    init_tracing();
    let rsa = Arc::new(AuthService::in_memory(
        KeyManager::new(&KeyConfig::rsa(
            KeySource::inline(RSA_PRIVATE),
            KeySource::inline(RSA_PUBLIC),
        ))
        .unwrap(),
        Default::default(),
    ));
    let ecdsa = Arc::new(AuthService::in_memory(
        KeyManager::new(&KeyConfig::ecdsa(
            KeySource::inline(EC_PRIVATE_SEC1),
            KeySource::inline(EC_PUBLIC),
        ))
        .unwrap(),
        Default::default(),
    ));

    let mut identity = warden_identity_core::Identity::new("google");
    identity.subject = "10769150350006150715113082367".to_string();
    identity.email = "sam@example.com".to_string();

    let from_ecdsa = ecdsa.complete_login("google", &identity).await.unwrap();
    assert_eq!(
        ecdsa.validate_token(&from_ecdsa.access_token).unwrap().iss,
        "http://localhost:8080"
    );

    let bearer = BearerAuthProvider::new(rsa.clone());
    assert_eq!(
        bearer
            .authenticate(from_ecdsa.access_token)
            .await
            .unwrap_err(),
        AuthError::InvalidToken
    );

    // Refresh tokens are bound to the service that issued them.
    assert!(rsa
        .refresh_token(from_ecdsa.refresh_token.as_deref().unwrap())
        .await
        .is_err());
}
