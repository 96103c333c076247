//! Caller authentication
//!
//! Two providers exist and one is chosen at startup:
//!
//! - [`TenantProvider`]: Azure AD application tokens, restricted to one
//!   tenant and resolved through Microsoft Graph
//! - [`JwksProvider`]: bearer tokens verified against the key sets of one or
//!   more OpenID issuers
//!
//! Both report through [`AuthError`]. A request without credentials is
//! anonymous, not an error; the policy decides what anonymous callers may do.
//! In permissive mode rejected credentials are also treated as anonymous,
//! but an unreachable identity service always yields
//! [`AuthError::Unavailable`].

pub mod jwks;
pub mod tenant;

use axum::http::HeaderMap;

use crate::request::RequestDescriptor;
pub use jwks::{JwksConfig, JwksProvider};
pub use tenant::{TenantConfig, TenantProvider};

/// Authentication outcome other than success
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Credentials were presented and rejected
    #[error("authentication failed")]
    Failed,
    /// The identity service could not be consulted
    #[error("authentication service unavailable")]
    Unavailable,
}

/// How rejected credentials are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// Reject with [`AuthError::Failed`]
    #[default]
    Strict,
    /// Continue as anonymous
    Permissive,
}

impl AuthMode {
    /// From the `--permissive-auth` flag
    pub fn from_permissive(permissive: bool) -> Self {
        if permissive {
            AuthMode::Permissive
        } else {
            AuthMode::Strict
        }
    }

    /// Outcome for credentials that failed validation
    pub fn reject(self) -> Result<(), AuthError> {
        match self {
            AuthMode::Strict => Err(AuthError::Failed),
            AuthMode::Permissive => Ok(()),
        }
    }
}

/// The configured identity provider
pub enum Authenticator {
    /// Azure AD tenant with Graph lookup
    Tenant(TenantProvider),
    /// OpenID issuers with JWKS verification
    Jwks(JwksProvider),
}

impl Authenticator {
    /// Authenticate the request, attaching the principal to `descriptor`
    ///
    /// `Ok(())` covers both anonymous and authenticated callers; check
    /// [`RequestDescriptor::is_authenticated`] to tell them apart.
    pub async fn authenticate(
        &self,
        descriptor: &mut RequestDescriptor,
        headers: &HeaderMap,
    ) -> Result<(), AuthError> {
        match self {
            Authenticator::Tenant(provider) => provider.authenticate(descriptor, headers).await,
            Authenticator::Jwks(provider) => provider.authenticate(descriptor, headers).await,
        }
    }

    /// Provider name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Authenticator::Tenant(_) => "tenant",
            Authenticator::Jwks(_) => "jwks",
        }
    }
}

/// Credential found in the auth header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential<'a> {
    /// No auth header
    Missing,
    /// Header present with another scheme or unreadable
    WrongScheme,
    /// Token following the expected scheme
    Token(&'a str),
}

/// Read the `kind` credential from `header`
///
/// The scheme comparison ignores case; the token is trimmed.
pub fn extract_credential<'a>(headers: &'a HeaderMap, header: &str, kind: &str) -> Credential<'a> {
    let Some(value) = headers.get(header) else {
        return Credential::Missing;
    };
    let Ok(value) = value.to_str() else {
        return Credential::WrongScheme;
    };

    match value.trim().split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case(kind) && !token.trim().is_empty() => {
            Credential::Token(token.trim())
        }
        _ => Credential::WrongScheme,
    }
}
