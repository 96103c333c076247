//! Command line and environment configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::{Error, Result};

/// Smallest accepted timeout in seconds
pub const MIN_TIMEOUT_SECS: u64 = 1;

/// Largest accepted timeout in seconds
pub const MAX_TIMEOUT_SECS: u64 = 600;

/// Regate - authorizing reverse proxy driven by hot-reloaded Rego policies
#[derive(Parser, Debug, Clone)]
#[command(name = "regate", version, about, long_about = None)]
pub struct Config {
    /// Raise the default log level to debug
    #[arg(short, long, env = "VERBOSE")]
    pub verbose: bool,

    /// Log every policy input, result and `print()` output
    #[arg(long, env = "DEBUG")]
    pub debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,

    /// Directory holding policy files
    #[arg(long, env = "POLICY_DIR", default_value = "./policies")]
    pub policy_dir: PathBuf,

    /// Glob selecting policy files inside the policy directory
    #[arg(long, env = "FILE_PATTERN", default_value = "*.rego")]
    pub file_pattern: String,

    /// Policy file evaluated for every request
    #[arg(long = "request-policy", env = "REQUEST", default_value = "request.rego")]
    pub request_policy: String,

    /// Proxy listen address
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8181")]
    pub listen: SocketAddr,

    /// Management (health, readiness, info) listen address
    #[arg(long, env = "MANAGEMENT", default_value = "0.0.0.0:8182")]
    pub management: SocketAddr,

    /// Azure AD tenant whose applications may call the backend
    #[arg(long, env = "AZURE_TENANT")]
    pub azure_tenant: Option<String>,

    /// Microsoft Graph base URL used to resolve application identities
    #[arg(
        long,
        env = "GRAPH_URL",
        default_value = "https://graph.microsoft.com/v1.0"
    )]
    pub graph_url: String,

    /// OpenID discovery documents trusted for bearer tokens
    #[arg(long = "well-known", env = "WELLKNOWN_OIDC", value_delimiter = ',')]
    pub well_known: Vec<String>,

    /// Audiences accepted in bearer tokens
    #[arg(long, env = "JWT_AUDIENCES", value_delimiter = ',')]
    pub audiences: Vec<String>,

    /// Claim holding the token audience
    #[arg(long, env = "JWT_AUDIENCE_CLAIM", default_value = "aud")]
    pub audience_claim: String,

    /// Header carrying client credentials
    #[arg(long, env = "AUTH_HEADER", default_value = "Authorization")]
    pub auth_header: String,

    /// Credential scheme expected in the auth header
    #[arg(long, env = "AUTH_KIND", default_value = "bearer")]
    pub auth_kind: String,

    /// Treat rejected credentials as anonymous instead of answering 401
    #[arg(long, env = "PERMISSIVE_AUTH")]
    pub permissive_auth: bool,

    /// Hand stripped reserved headers to the policy as context
    #[arg(long, env = "EXPOSE_BLOCKED_HEADERS")]
    pub expose_blocked_headers: bool,

    /// Backend scheme (http or https)
    #[arg(long, env = "BACKEND_SCHEME", default_value = "http")]
    pub backend_scheme: String,

    /// Backend host
    #[arg(long, env = "BACKEND_HOST", default_value = "localhost")]
    pub backend_host: String,

    /// Backend port
    #[arg(long, env = "BACKEND_PORT", default_value_t = 8080)]
    pub backend_port: u16,

    /// Total time allowed for a backend exchange
    #[arg(long, env = "BACKEND_TIMEOUT_SECS", default_value_t = 30)]
    pub backend_timeout_secs: u64,

    /// Time allowed to open a backend connection
    #[arg(long, env = "BACKEND_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub backend_connect_timeout_secs: u64,

    /// How long idle backend connections are kept
    #[arg(long, env = "BACKEND_IDLE_TIMEOUT_SECS", default_value_t = 90)]
    pub backend_idle_timeout_secs: u64,

    /// Time allowed for Graph lookups and JWKS fetches
    #[arg(long, env = "IDENTITY_TIMEOUT_SECS", default_value_t = 10)]
    pub identity_timeout_secs: u64,

    /// Grace period for in-flight requests on shutdown
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 60)]
    pub shutdown_timeout_secs: u64,
}

impl Config {
    /// Reject settings the gateway cannot start with
    pub fn validate(&self) -> Result<()> {
        let tenant = self.azure_tenant.as_deref().is_some_and(|t| !t.is_empty());
        let well_known = !self.well_known.is_empty();

        match (tenant, well_known) {
            (true, true) => {
                return Err(Error::Config(
                    "azure-tenant and well-known are mutually exclusive".into(),
                ))
            }
            (false, false) => {
                return Err(Error::Config(
                    "one of azure-tenant or well-known must be set".into(),
                ))
            }
            _ => {}
        }

        if well_known && self.audiences.iter().all(|a| a.is_empty()) {
            return Err(Error::Config("well-known requires audiences".into()));
        }

        for (name, value) in [
            ("auth-header", &self.auth_header),
            ("auth-kind", &self.auth_kind),
            ("request-policy", &self.request_policy),
            ("audience-claim", &self.audience_claim),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{name} must not be empty")));
            }
        }

        if !matches!(self.backend_scheme.as_str(), "http" | "https") {
            return Err(Error::Config(format!(
                "backend-scheme must be http or https, got {}",
                self.backend_scheme
            )));
        }

        for (name, secs) in [
            ("backend-timeout-secs", self.backend_timeout_secs),
            ("backend-connect-timeout-secs", self.backend_connect_timeout_secs),
            ("backend-idle-timeout-secs", self.backend_idle_timeout_secs),
            ("identity-timeout-secs", self.identity_timeout_secs),
            ("shutdown-timeout-secs", self.shutdown_timeout_secs),
        ] {
            if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&secs) {
                return Err(Error::Config(format!(
                    "{name} must be between {MIN_TIMEOUT_SECS} and {MAX_TIMEOUT_SECS}, got {secs}"
                )));
            }
        }

        Ok(())
    }

    /// Backend origin, e.g. `http://localhost:8080`
    pub fn backend_origin(&self) -> String {
        format!(
            "{}://{}:{}",
            self.backend_scheme, self.backend_host, self.backend_port
        )
    }

    /// Audiences with empty entries removed
    pub fn audiences(&self) -> Vec<String> {
        self.audiences
            .iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect()
    }

    /// Timeout for identity provider calls
    pub fn identity_timeout(&self) -> Duration {
        Duration::from_secs(self.identity_timeout_secs)
    }

    /// Grace period for shutdown
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
