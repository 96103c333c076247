//! Azure AD tenant provider
//!
//! Accepts application tokens issued by one tenant. The token is decoded
//! without signature verification; trust comes from resolving the
//! application through Microsoft Graph with the caller's own token, which
//! Graph only honours for valid tokens. Resolved identities are cached for
//! [`LOOKUP_TTL`] per (application id, token).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use jsonwebtoken::{decode, DecodingKey, Validation};
use moka::future::Cache;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{extract_credential, AuthError, AuthMode, Credential};
use crate::error::{Error, Result};
use crate::request::{Principal, RequestDescriptor};

/// How long a resolved application identity is reused
pub const LOOKUP_TTL: Duration = Duration::from_secs(5 * 60);

/// Properties requested from Graph
pub const SERVICE_PRINCIPAL_FIELDS: &str =
    "id,displayName,appId,appOwnerOrganizationId,servicePrincipalType";

/// Claim carrying the calling application id
pub const APP_ID_CLAIM: &str = "appid";

/// Claim carrying the issuing tenant id
pub const TENANT_CLAIM: &str = "tid";

/// Why an application lookup did not produce an identity
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    /// Could not reach the directory or it timed out
    #[error("directory request failed: {0}")]
    Transport(String),
    /// Directory answered with a non-success status
    #[error("directory returned status {0}")]
    Status(u16),
    /// Directory answer was not a JSON object
    #[error("invalid directory response: {0}")]
    Decode(String),
}

/// Resolves an application id into its directory record
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AppLookup: Send + Sync {
    /// Look up `app_id`, authenticating with the caller's `token`
    async fn lookup(&self, app_id: &str, token: &str)
        -> std::result::Result<Map<String, Value>, LookupError>;
}

/// [`AppLookup`] against the Microsoft Graph service principal endpoint
pub struct GraphLookup {
    base_url: String,
    http_client: reqwest::Client,
}

impl GraphLookup {
    /// Create a lookup against `base_url` (e.g. `https://graph.microsoft.com/v1.0`)
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?,
        })
    }
}

#[async_trait]
impl AppLookup for GraphLookup {
    async fn lookup(
        &self,
        app_id: &str,
        token: &str,
    ) -> std::result::Result<Map<String, Value>, LookupError> {
        let url = format!("{}/servicePrincipals(appId='{}')", self.base_url, app_id);
        debug!(url = %url, "Resolving application identity");

        let response = self
            .http_client
            .get(&url)
            .query(&[("$select", SERVICE_PRINCIPAL_FIELDS)])
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| LookupError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LookupError::Status(response.status().as_u16()));
        }

        let record: Map<String, Value> = response
            .json()
            .await
            .map_err(|e| LookupError::Decode(e.to_string()))?;

        // "@odata.*" annotations describe the response, not the application
        Ok(record
            .into_iter()
            .filter(|(key, _)| !key.starts_with('@'))
            .collect())
    }
}

/// Settings for [`TenantProvider`]
#[derive(Debug, Clone)]
pub struct TenantConfig {
    /// Tenant id the token must come from
    pub tenant: String,
    /// Header holding the credential
    pub auth_header: String,
    /// Expected credential scheme
    pub auth_kind: String,
    /// Handling of rejected tokens
    pub mode: AuthMode,
}

/// Authenticates Azure AD applications of one tenant
pub struct TenantProvider {
    config: TenantConfig,
    lookup: Arc<dyn AppLookup>,
    identities: Cache<(String, String), Arc<Map<String, Value>>>,
}

impl TenantProvider {
    /// Create a provider resolving identities through `lookup`
    pub fn new(config: TenantConfig, lookup: Arc<dyn AppLookup>) -> Self {
        Self {
            config,
            lookup,
            identities: Cache::builder().time_to_live(LOOKUP_TTL).build(),
        }
    }

    /// Authenticate the request
    pub async fn authenticate(
        &self,
        descriptor: &mut RequestDescriptor,
        headers: &HeaderMap,
    ) -> std::result::Result<(), AuthError> {
        let Credential::Token(token) =
            extract_credential(headers, &self.config.auth_header, &self.config.auth_kind)
        else {
            return Ok(());
        };

        let claims = match decode_unverified(token) {
            Ok(claims) => claims,
            Err(e) => {
                debug!(error = %e, "Rejected unparsable token");
                return self.config.mode.reject();
            }
        };

        let Some(app_id) = claims.get(APP_ID_CLAIM).and_then(Value::as_str) else {
            debug!("Rejected token without application id");
            return self.config.mode.reject();
        };
        if !is_valid_app_id(app_id) {
            debug!(app_id = %app_id, "Rejected malformed application id");
            return self.config.mode.reject();
        }

        let tenant = claims.get(TENANT_CLAIM).and_then(Value::as_str);
        if !tenant.is_some_and(|t| t.eq_ignore_ascii_case(&self.config.tenant)) {
            debug!(app_id = %app_id, tenant = ?tenant, "Rejected token from foreign tenant");
            return self.config.mode.reject();
        }

        descriptor.request.id = Some(app_id.to_string());

        let key = (app_id.to_string(), token.to_string());
        let identity = self
            .identities
            .try_get_with(key, async {
                self.lookup.lookup(app_id, token).await.map(Arc::new)
            })
            .await
            .map_err(|e| {
                warn!(app_id = %app_id, error = %e, "Application lookup failed");
                AuthError::Unavailable
            })?;

        descriptor.principal = Some(Principal::Application(identity.as_ref().clone()));
        debug!(app_id = %app_id, "Authenticated application");
        Ok(())
    }
}

/// Claims of `token` without checking its signature
///
/// Expiry is still enforced when the token carries `exp`.
fn decode_unverified(token: &str) -> jsonwebtoken::errors::Result<Map<String, Value>> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    Ok(decode::<Map<String, Value>>(token, &DecodingKey::from_secret(&[]), &validation)?.claims)
}

/// Application ids are GUIDs; anything else must not reach the lookup URL
fn is_valid_app_id(app_id: &str) -> bool {
    !app_id.is_empty() && app_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}
