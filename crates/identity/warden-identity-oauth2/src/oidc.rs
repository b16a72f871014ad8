//! OpenID Connect discovery and ID token verification.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use reqwest::Client;
use reqwest::header::ACCEPT;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{OAuth2Error, OAuth2Result};
use crate::types::{IdTokenClaims, ProviderMetadata};

/// Asymmetric algorithms accepted on ID tokens. HMAC is never accepted since
/// the only shared secret would be our own client secret.
pub const ALLOWED_ID_TOKEN_ALGORITHMS: [Algorithm; 8] = [
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
];

/// Placeholder Microsoft uses in multi-tenant issuers.
pub const TENANT_PLACEHOLDER: &str = "{tenantid}";

/// Fetches `<issuer>/.well-known/openid-configuration`.
pub async fn discover(http: &Client, issuer: &str) -> OAuth2Result<ProviderMetadata> {
    let url = format!(
        "{}/.well-known/openid-configuration",
        issuer.trim_end_matches('/')
    );
    debug!("Fetching OIDC discovery document from {}", url);

    let response = http
        .get(&url)
        .header(ACCEPT, "application/json")
        .send()
        .await
        .map_err(|e| OAuth2Error::DiscoveryFailed(format!("{url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(OAuth2Error::DiscoveryFailed(format!(
            "{url} returned {status}"
        )));
    }

    response
        .json::<ProviderMetadata>()
        .await
        .map_err(|e| OAuth2Error::DiscoveryFailed(format!("{url}: {e}")))
}

/// How the `iss` claim of an ID token is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssuerCheck {
    /// `iss` must equal one of these values.
    OneOf(Vec<String>),
    /// Multi-tenant template; `{tenantid}` is replaced by the token's `tid`.
    TenantTemplate(String),
}

impl IssuerCheck {
    pub fn matches(&self, iss: &str, tid: Option<&str>) -> bool {
        match self {
            IssuerCheck::OneOf(allowed) => allowed.iter().any(|issuer| issuer == iss),
            IssuerCheck::TenantTemplate(template) => tid
                .filter(|tid| !tid.is_empty())
                .is_some_and(|tid| template.replace(TENANT_PLACEHOLDER, tid) == iss),
        }
    }
}

/// Smallest gap between two JWKS fetches triggered by unknown keys.
pub const MIN_JWKS_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Default)]
struct CachedKeys {
    by_kid: HashMap<String, Jwk>,
    unnamed: Vec<Jwk>,
    last_attempt: Option<Instant>,
}

impl CachedKeys {
    fn candidates(&self, kid: Option<&str>) -> Vec<Jwk> {
        match kid {
            Some(kid) => self.by_kid.get(kid).cloned().into_iter().collect(),
            None => self
                .by_kid
                .values()
                .chain(self.unnamed.iter())
                .cloned()
                .collect(),
        }
    }
}

/// JWKS keys cached by `kid`, reloaded when an unknown `kid` shows up.
/// Keys published without a `kid` are kept apart and only used for tokens
/// that carry no `kid` either.
pub struct JwksCache {
    http: Client,
    jwks_uri: String,
    min_refresh_interval: Duration,
    keys: RwLock<CachedKeys>,
}

impl JwksCache {
    pub fn new(http: Client, jwks_uri: impl Into<String>) -> Self {
        Self {
            http,
            jwks_uri: jwks_uri.into(),
            min_refresh_interval: MIN_JWKS_REFRESH_INTERVAL,
            keys: RwLock::new(CachedKeys::default()),
        }
    }

    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    pub fn jwks_uri(&self) -> &str {
        &self.jwks_uri
    }

    /// Replaces the cached key set with a fresh copy from the JWKS endpoint.
    pub async fn refresh(&self) -> OAuth2Result<usize> {
        self.keys.write().await.last_attempt = Some(Instant::now());
        self.fetch().await
    }

    async fn fetch(&self) -> OAuth2Result<usize> {
        let response = self
            .http
            .get(&self.jwks_uri)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| OAuth2Error::DiscoveryFailed(format!("{}: {e}", self.jwks_uri)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OAuth2Error::DiscoveryFailed(format!(
                "{} returned {status}",
                self.jwks_uri
            )));
        }

        let set: JwkSet = response
            .json()
            .await
            .map_err(|e| OAuth2Error::DiscoveryFailed(format!("{}: {e}", self.jwks_uri)))?;

        let mut by_kid = HashMap::new();
        let mut unnamed = Vec::new();
        for jwk in set.keys {
            match jwk.common.key_id.clone() {
                Some(kid) if !kid.is_empty() => {
                    by_kid.insert(kid, jwk);
                }
                _ => unnamed.push(jwk),
            }
        }
        let count = by_kid.len() + unnamed.len();

        let mut keys = self.keys.write().await;
        keys.by_kid = by_kid;
        keys.unnamed = unnamed;
        info!("Loaded {} signing keys from {}", count, self.jwks_uri);
        Ok(count)
    }

    /// Keys that may have signed a token with this `kid`. A token without a
    /// `kid` gets every cached key. A miss reloads the set unless the last
    /// attempt was less than the minimum refresh interval ago.
    pub async fn keys_for(&self, kid: Option<&str>) -> OAuth2Result<Vec<Jwk>> {
        let candidates = self.keys.read().await.candidates(kid);
        if !candidates.is_empty() {
            return Ok(candidates);
        }

        if self.claim_refresh().await {
            debug!("Signing key {:?} not cached, refreshing JWKS", kid);
            self.fetch().await?;
        } else {
            debug!("Signing key {:?} not cached, JWKS refreshed recently", kid);
        }

        let candidates = self.keys.read().await.candidates(kid);
        if candidates.is_empty() {
            return Err(OAuth2Error::UnknownSigningKey(
                kid.unwrap_or("<none>").to_string(),
            ));
        }
        Ok(candidates)
    }

    /// Records a refresh attempt, or returns false if one happened too recently.
    async fn claim_refresh(&self) -> bool {
        let mut keys = self.keys.write().await;
        let now = Instant::now();
        if keys
            .last_attempt
            .is_some_and(|last| now.duration_since(last) < self.min_refresh_interval)
        {
            return false;
        }
        keys.last_attempt = Some(now);
        true
    }
}

/// Verifies ID tokens issued to one client by one issuer.
pub struct IdTokenVerifier {
    client_id: String,
    issuer: IssuerCheck,
    jwks: JwksCache,
}

impl IdTokenVerifier {
    pub fn new(client_id: impl Into<String>, issuer: IssuerCheck, jwks: JwksCache) -> Self {
        Self {
            client_id: client_id.into(),
            issuer,
            jwks,
        }
    }

    pub fn issuer(&self) -> &IssuerCheck {
        &self.issuer
    }

    pub async fn verify(&self, id_token: &str) -> OAuth2Result<IdTokenClaims> {
        let header = decode_header(id_token)?;
        if !ALLOWED_ID_TOKEN_ALGORITHMS.contains(&header.alg) {
            warn!("Rejected ID token signed with {:?}", header.alg);
            return Err(OAuth2Error::UnsupportedAlgorithm(format!("{:?}", header.alg)));
        }

        let candidates = self.jwks.keys_for(header.kid.as_deref()).await?;

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[&self.client_id]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        if let IssuerCheck::OneOf(allowed) = &self.issuer {
            validation.set_issuer(allowed.as_slice());
        }

        let claims = decode_with_any(id_token, &candidates, &validation)?;

        if !self.issuer.matches(&claims.iss, claims.tid.as_deref()) {
            return Err(OAuth2Error::IssuerMismatch {
                expected: format!("{:?}", self.issuer),
                actual: claims.iss,
            });
        }

        debug!("Verified ID token for subject {}", claims.sub);
        Ok(claims)
    }
}

/// Tries each key in turn. Only key-specific failures move on to the next
/// key; an expired or misaddressed token fails on the first one.
fn decode_with_any(
    id_token: &str,
    candidates: &[Jwk],
    validation: &Validation,
) -> OAuth2Result<IdTokenClaims> {
    let mut last_err = None;
    for jwk in candidates {
        let attempt = DecodingKey::from_jwk(jwk)
            .and_then(|key| decode::<IdTokenClaims>(id_token, &key, validation));
        match attempt {
            Ok(data) => return Ok(data.claims),
            Err(err) if is_key_mismatch(&err) => last_err = Some(err),
            Err(err) => return Err(err.into()),
        }
    }
    Err(match last_err {
        Some(err) => err.into(),
        None => OAuth2Error::UnknownSigningKey("<none>".to_string()),
    })
}

fn is_key_mismatch(err: &jsonwebtoken::errors::Error) -> bool {
    use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
    matches!(
        err.kind(),
        JwtErrorKind::InvalidSignature
            | JwtErrorKind::InvalidAlgorithm
            | JwtErrorKind::InvalidKeyFormat
            | JwtErrorKind::InvalidRsaKey(_)
            | JwtErrorKind::InvalidEcdsaKey
            | JwtErrorKind::InvalidAlgorithmName
            | JwtErrorKind::MissingAlgorithm
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::{Value, json};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RSA_PRIVATE_KEY: &str = include_str!("../tests/fixtures/rsa_private_pkcs8.pem");
    const JWKS: &str = include_str!("../tests/fixtures/jwks.json");

    fn fixture_key() -> Value {
        let set: Value = serde_json::from_str(JWKS).unwrap();
        set["keys"][0].clone()
    }

    async fn serve_jwks(server: &MockServer, set: Value, calls: u64) {
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(set))
            .expect(calls)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn unknown_kids_refresh_at_most_once_per_interval() {
        let server = MockServer::start().await;
        serve_jwks(&server, json!({ "keys": [fixture_key()] }), 1).await;

        let cache = JwksCache::new(Client::new(), format!("{}/jwks", server.uri()));
        assert_eq!(cache.keys_for(Some("test-key-1")).await.unwrap().len(), 1);

        for kid in ["rotated-a", "rotated-b", "rotated-c"] {
            let err = cache.keys_for(Some(kid)).await.unwrap_err();
            assert!(matches!(err, OAuth2Error::UnknownSigningKey(ref k) if k == kid));
        }
        assert_eq!(cache.keys_for(Some("test-key-1")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_kid_refreshes_once_the_interval_has_passed() {
        let server = MockServer::start().await;
        serve_jwks(&server, json!({ "keys": [fixture_key()] }), 3).await;

        let cache = JwksCache::new(Client::new(), format!("{}/jwks", server.uri()))
            .with_min_refresh_interval(Duration::ZERO);
        for kid in ["rotated-a", "rotated-b", "rotated-c"] {
            assert!(cache.keys_for(Some(kid)).await.is_err());
        }
    }

    #[tokio::test]
    async fn failed_refresh_also_counts_against_the_interval() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let cache = JwksCache::new(Client::new(), format!("{}/jwks", server.uri()));
        let err = cache.keys_for(Some("test-key-1")).await.unwrap_err();
        assert!(matches!(err, OAuth2Error::DiscoveryFailed(_)));
        let err = cache.keys_for(Some("test-key-1")).await.unwrap_err();
        assert!(matches!(err, OAuth2Error::UnknownSigningKey(_)));
    }

    #[tokio::test]
    async fn keys_without_kid_are_kept_and_tried_in_turn() {
        let mut real = fixture_key();
        real.as_object_mut().unwrap().remove("kid");

        // Same shape, different modulus: parses fine but never verifies.
        let mut decoy = real.clone();
        let n = decoy["n"].as_str().unwrap().to_string();
        let mid = n.len() / 2;
        let flipped = if &n[mid..mid + 1] == "A" { "B" } else { "A" };
        decoy["n"] = json!(format!("{}{}{}", &n[..mid], flipped, &n[mid + 1..]));

        let server = MockServer::start().await;
        serve_jwks(&server, json!({ "keys": [decoy, real] }), 1).await;

        let cache = JwksCache::new(Client::new(), format!("{}/jwks", server.uri()));
        assert_eq!(cache.refresh().await.unwrap(), 2);
        assert_eq!(cache.keys_for(None).await.unwrap().len(), 2);
        assert!(matches!(
            cache.keys_for(Some("test-key-1")).await.unwrap_err(),
            OAuth2Error::UnknownSigningKey(_)
        ));

        let issuer = "https://idp.example.com";
        let verifier = IdTokenVerifier::new(
            "app",
            IssuerCheck::OneOf(vec![issuer.to_string()]),
            cache,
        );
        let now = Utc::now().timestamp();
        let token = encode(
            &Header::new(Algorithm::RS256),
            &json!({
                "iss": issuer,
                "sub": "248289761001",
                "aud": "app",
                "exp": now + 600,
                "iat": now
            }),
            &EncodingKey::from_rsa_pem(RSA_PRIVATE_KEY.as_bytes()).unwrap(),
        )
        .unwrap();

        let claims = verifier.verify(&token).await.unwrap();
        assert_eq!(claims.sub, "248289761001");
    }

    #[test]
    fn issuer_one_of() {
        let check = IssuerCheck::OneOf(vec![
            "https://accounts.google.com".to_string(),
            "accounts.google.com".to_string(),
        ]);
        assert!(check.matches("accounts.google.com", None));
        assert!(!check.matches("https://evil.example.com", None));
    }

    #[test]
    fn tenant_template_requires_matching_tid() {
        let check = IssuerCheck::TenantTemplate(
            "https://login.microsoftonline.com/{tenantid}/v2.0".to_string(),
        );
        let iss = "https://login.microsoftonline.com/9188040d-6c67-4c5b-b112-36a304b66dad/v2.0";

        assert!(check.matches(iss, Some("9188040d-6c67-4c5b-b112-36a304b66dad")));
        assert!(!check.matches(iss, Some("another-tenant")));
        assert!(!check.matches(iss, None));
        assert!(!check.matches(
            "https://login.microsoftonline.com//v2.0",
            Some("")
        ));
    }
}
