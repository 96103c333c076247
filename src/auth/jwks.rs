//! Bearer tokens verified against OpenID issuer key sets
//!
//! Each configured discovery document names a `jwks_uri` and optionally the
//! signing algorithms the issuer supports. Keys that do not declare an
//! algorithm are usable with every supported one. Key sets are fetched at
//! startup and refreshed every [`REFRESH_INTERVAL`] by a background task; a
//! failed refresh keeps the previous set.
//!
//! A token is accepted by the first (issuer, audience) pair, in configuration
//! order, whose keys verify its signature and whose audience matches.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use jsonwebtoken::jwk::Jwk;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{extract_credential, AuthError, AuthMode, Credential};
use crate::error::{Error, Result};
use crate::request::{Principal, RequestDescriptor};

/// How often key sets are refetched
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Registered audience claim
pub const DEFAULT_AUDIENCE_CLAIM: &str = "aud";

// =============================================================================
// Fetching
// =============================================================================

/// Subset of an OpenID discovery document
#[derive(Debug, Clone, Deserialize)]
pub struct Discovery {
    /// Where the issuer publishes its key set
    pub jwks_uri: String,
    /// Algorithms the issuer signs with
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,
}

/// Why a discovery document or key set could not be obtained
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Network failure or timeout
    #[error("request failed: {0}")]
    Transport(String),
    /// Non-success status
    #[error("unexpected status {0}")]
    Status(u16),
    /// Unusable document
    #[error("invalid document: {0}")]
    Decode(String),
}

/// Retrieves discovery documents and key sets
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JwksFetcher: Send + Sync {
    /// Fetch and parse a discovery document
    async fn discovery(&self, url: &str) -> std::result::Result<Discovery, FetchError>;

    /// Fetch a raw JWK set document
    async fn key_set(&self, uri: &str) -> std::result::Result<Value, FetchError>;
}

/// [`JwksFetcher`] over HTTPS
pub struct HttpJwksFetcher {
    http_client: reqwest::Client,
}

impl HttpJwksFetcher {
    /// Create a fetcher whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            http_client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> std::result::Result<T, FetchError> {
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        response
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))
    }
}

#[async_trait]
impl JwksFetcher for HttpJwksFetcher {
    async fn discovery(&self, url: &str) -> std::result::Result<Discovery, FetchError> {
        debug!(url = %url, "Fetching OIDC discovery document");
        self.get_json(url).await
    }

    async fn key_set(&self, uri: &str) -> std::result::Result<Value, FetchError> {
        debug!(uri = %uri, "Fetching JWKS");
        self.get_json(uri).await
    }
}

// =============================================================================
// Key sets
// =============================================================================

struct VerificationKey {
    kid: Option<String>,
    algorithms: Vec<Algorithm>,
    key: DecodingKey,
}

/// Decoding keys of one issuer
pub struct KeySet {
    keys: Vec<VerificationKey>,
}

impl KeySet {
    /// Parse a JWK set document
    ///
    /// Keys without an `alg` take `supported`; keys that end up without any
    /// algorithm, encryption keys and keys of unknown type are skipped.
    pub fn parse(
        document: &Value,
        supported: &[Algorithm],
    ) -> std::result::Result<Self, FetchError> {
        let entries = document
            .get("keys")
            .and_then(Value::as_array)
            .ok_or_else(|| FetchError::Decode("missing keys array".into()))?;

        let mut keys = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.get("use").and_then(Value::as_str) == Some("enc") {
                continue;
            }

            let jwk: Jwk = match serde_json::from_value(entry.clone()) {
                Ok(jwk) => jwk,
                Err(e) => {
                    debug!(error = %e, "Skipping unsupported JWK");
                    continue;
                }
            };

            let algorithms = match entry.get("alg").and_then(Value::as_str) {
                Some(alg) => match Algorithm::from_str(alg) {
                    Ok(alg) => vec![alg],
                    Err(_) => {
                        debug!(alg = %alg, "Skipping JWK with unknown algorithm");
                        continue;
                    }
                },
                None => supported.to_vec(),
            };
            if algorithms.is_empty() {
                warn!(kid = ?jwk.common.key_id, "Skipping JWK without algorithm");
                continue;
            }

            let key = match DecodingKey::from_jwk(&jwk) {
                Ok(key) => key,
                Err(e) => {
                    debug!(error = %e, "Skipping undecodable JWK");
                    continue;
                }
            };

            keys.push(VerificationKey {
                kid: jwk.common.key_id.clone(),
                algorithms,
                key,
            });
        }

        if keys.is_empty() {
            return Err(FetchError::Decode("no usable keys".into()));
        }
        Ok(Self { keys })
    }

    /// Number of usable keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set holds no keys
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn candidates<'a>(
        &'a self,
        kid: Option<&'a str>,
        alg: Algorithm,
    ) -> impl Iterator<Item = &'a VerificationKey> + 'a {
        self.keys.iter().filter(move |key| {
            key.algorithms.contains(&alg)
                && match (kid, key.kid.as_deref()) {
                    (Some(wanted), Some(have)) => wanted == have,
                    _ => true,
                }
        })
    }
}

/// Why a token was not accepted for one (issuer, audience) pair
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// No key matches the token's `kid` and `alg`
    #[error("no matching key")]
    NoMatchingKey,
    /// Signature, expiry or registered audience check failed
    #[error(transparent)]
    Token(#[from] jsonwebtoken::errors::Error),
    /// Custom audience claim missing or different
    #[error("audience claim {0} does not match")]
    Audience(String),
}

/// Verify `token` against `keys` for `audience` carried in `claim`
pub fn verify(
    token: &str,
    keys: &KeySet,
    audience: &str,
    claim: &str,
) -> std::result::Result<Map<String, Value>, VerifyError> {
    let header = decode_header(token)?;
    let mut last = VerifyError::NoMatchingKey;

    for key in keys.candidates(header.kid.as_deref(), header.alg) {
        let mut validation = Validation::new(header.alg);
        if claim == DEFAULT_AUDIENCE_CLAIM {
            // jsonwebtoken only checks `aud` when present unless it is required
            validation.set_required_spec_claims(&[DEFAULT_AUDIENCE_CLAIM]);
            validation.set_audience(&[audience]);
        } else {
            validation.required_spec_claims.clear();
            validation.validate_aud = false;
        }

        match decode::<Map<String, Value>>(token, &key.key, &validation) {
            Ok(data) => {
                if claim != DEFAULT_AUDIENCE_CLAIM
                    && !claim_contains(&data.claims, claim, audience)
                {
                    return Err(VerifyError::Audience(claim.to_string()));
                }
                return Ok(data.claims);
            }
            Err(e) => last = VerifyError::Token(e),
        }
    }

    Err(last)
}

fn claim_contains(claims: &Map<String, Value>, claim: &str, audience: &str) -> bool {
    match claims.get(claim) {
        Some(Value::String(value)) => value == audience,
        Some(Value::Array(values)) => values.iter().any(|v| v.as_str() == Some(audience)),
        _ => false,
    }
}

// =============================================================================
// Issuers
// =============================================================================

/// One trusted issuer and its current key set
pub struct Issuer {
    discovery_url: String,
    jwks_uri: String,
    supported: Vec<Algorithm>,
    fetcher: Arc<dyn JwksFetcher>,
    keys: RwLock<Option<Arc<KeySet>>>,
}

impl Issuer {
    /// Issuer publishing keys at `discovery.jwks_uri`; no keys are fetched yet
    pub fn new(
        discovery_url: impl Into<String>,
        discovery: &Discovery,
        fetcher: Arc<dyn JwksFetcher>,
    ) -> Self {
        let supported = discovery
            .id_token_signing_alg_values_supported
            .iter()
            .filter_map(|alg| Algorithm::from_str(alg).ok())
            .collect();

        Self {
            discovery_url: discovery_url.into(),
            jwks_uri: discovery.jwks_uri.clone(),
            supported,
            fetcher,
            keys: RwLock::new(None),
        }
    }

    /// Discovery document this issuer came from
    pub fn discovery_url(&self) -> &str {
        &self.discovery_url
    }

    /// Fetch the key set and make it current
    pub async fn refresh(&self) -> std::result::Result<Arc<KeySet>, FetchError> {
        let document = self.fetcher.key_set(&self.jwks_uri).await?;
        let keys = Arc::new(KeySet::parse(&document, &self.supported)?);
        *self.keys.write() = Some(Arc::clone(&keys));
        debug!(uri = %self.jwks_uri, keys = keys.len(), "Refreshed JWKS");
        Ok(keys)
    }

    /// Current key set, fetching it if none was loaded yet
    pub async fn current(&self) -> std::result::Result<Arc<KeySet>, FetchError> {
        let loaded = self.keys.read().clone();
        match loaded {
            Some(keys) => Ok(keys),
            None => self.refresh().await,
        }
    }
}

// =============================================================================
// Provider
// =============================================================================

/// Settings for [`JwksProvider`]
#[derive(Debug, Clone)]
pub struct JwksConfig {
    /// Discovery document URLs, in trust order
    pub well_known: Vec<String>,
    /// Accepted audiences, in trial order
    pub audiences: Vec<String>,
    /// Claim holding the audience
    pub audience_claim: String,
    /// Header holding the credential
    pub auth_header: String,
    /// Expected credential scheme
    pub auth_kind: String,
    /// Handling of rejected tokens
    pub mode: AuthMode,
}

/// Authenticates bearer tokens from trusted OpenID issuers
pub struct JwksProvider {
    config: JwksConfig,
    issuers: Vec<Arc<Issuer>>,
}

impl JwksProvider {
    /// Load every discovery document and its key set
    ///
    /// Issuers that cannot be loaded are skipped with a warning. Having no
    /// audiences or no usable issuer at all is a configuration error.
    pub async fn discover(config: JwksConfig, fetcher: Arc<dyn JwksFetcher>) -> Result<Self> {
        if config.audiences.is_empty() {
            return Err(Error::Config("no JWT audiences configured".into()));
        }

        let mut issuers = Vec::new();
        for url in &config.well_known {
            let discovery = match fetcher.discovery(url).await {
                Ok(discovery) => discovery,
                Err(e) => {
                    warn!(url = %url, error = %e, "Skipping issuer: discovery failed");
                    continue;
                }
            };

            let issuer = Issuer::new(url.clone(), &discovery, Arc::clone(&fetcher));
            match issuer.refresh().await {
                Ok(keys) => {
                    info!(
                        url = %url,
                        jwks_uri = %discovery.jwks_uri,
                        keys = keys.len(),
                        "Loaded issuer"
                    );
                    issuers.push(Arc::new(issuer));
                }
                Err(e) => warn!(url = %url, error = %e, "Skipping issuer: JWKS unavailable"),
            }
        }

        if issuers.is_empty() {
            return Err(Error::Config("no JWKS could be loaded".into()));
        }
        Ok(Self::new(config, issuers))
    }

    /// Provider over already constructed issuers
    pub fn new(config: JwksConfig, issuers: Vec<Arc<Issuer>>) -> Self {
        Self { config, issuers }
    }

    /// Refresh every issuer's keys on a fixed schedule until `cancel` fires
    pub fn spawn_refresh(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        self.issuers
            .iter()
            .map(|issuer| {
                let issuer = Arc::clone(issuer);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
                    // The first tick completes immediately; keys are already loaded.
                    ticker.tick().await;
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = ticker.tick() => {
                                if let Err(e) = issuer.refresh().await {
                                    warn!(
                                        url = %issuer.discovery_url(),
                                        error = %e,
                                        "JWKS refresh failed, keeping previous keys"
                                    );
                                }
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// Authenticate the request
    pub async fn authenticate(
        &self,
        descriptor: &mut RequestDescriptor,
        headers: &HeaderMap,
    ) -> std::result::Result<(), AuthError> {
        let credential =
            extract_credential(headers, &self.config.auth_header, &self.config.auth_kind);
        let token = match credential {
            Credential::Missing => return Ok(()),
            Credential::WrongScheme => {
                debug!("Rejected credential with unexpected scheme");
                return self.config.mode.reject();
            }
            Credential::Token(token) => token,
        };

        if self.issuers.is_empty() {
            return Err(AuthError::Unavailable);
        }

        let mut unavailable = false;
        for issuer in &self.issuers {
            let keys = match issuer.current().await {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(url = %issuer.discovery_url(), error = %e, "JWKS unavailable");
                    unavailable = true;
                    continue;
                }
            };

            for audience in &self.config.audiences {
                match verify(token, &keys, audience, &self.config.audience_claim) {
                    Ok(claims) => {
                        debug!(
                            url = %issuer.discovery_url(),
                            audience = %audience,
                            "Authenticated bearer token"
                        );
                        descriptor.principal = Some(Principal::Claims(claims));
                        return Ok(());
                    }
                    Err(e) => {
                        debug!(
                            url = %issuer.discovery_url(),
                            audience = %audience,
                            error = %e,
                            "Token not accepted"
                        )
                    }
                }
            }
        }

        if unavailable {
            return Err(AuthError::Unavailable);
        }
        self.config.mode.reject()
    }
}
