//! Per-request descriptor handed to the policy as input
//!
//! Built once when a request enters the pipeline, then filled in by later
//! stages: authentication attaches the principal, authorization the policy
//! result and rewritten URL. Serialized with serde it becomes the policy
//! `input` document:
//!
//! ```text
//! {
//!   "request": {"method", "path": [..], "headers": {..}, "auth": {..}, "size", "id"},
//!   "user" | "jwt": {..},
//!   "result": {..},
//!   "blocked_headers": {..}
//! }
//! ```

use std::collections::BTreeMap;

use axum::http::request::Parts;
use axum::http::{header, HeaderMap};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;

/// Header values keyed by canonical header name
pub type HeaderValues = BTreeMap<String, HeaderEntry>;

/// One header as seen by the policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum HeaderEntry {
    /// Header sent once
    Single(String),
    /// Header sent several times, in arrival order
    Multiple(Vec<String>),
}

/// Credentials parsed from the auth header
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestAuth {
    /// Scheme, e.g. `Bearer` or `Basic`
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// Credential following the scheme (not set for Basic)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub token: String,
    /// Basic user name
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,
    /// Basic password
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
}

/// Request-line level facts
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestInfo {
    /// HTTP method
    pub method: String,
    /// Path split into segments, leading slash removed
    pub path: Vec<String>,
    /// Headers after reserved ones were stripped
    pub headers: HeaderValues,
    /// Parsed auth header, absent when none was sent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<RequestAuth>,
    /// Content length, -1 for chunked bodies
    pub size: i64,
    /// Caller identity id once authenticated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Principal {
    /// Application resolved through the directory lookup
    #[serde(rename = "user")]
    Application(Map<String, Value>),
    /// Verified bearer token claims
    #[serde(rename = "jwt")]
    Claims(Map<String, Value>),
}

/// Everything the pipeline knows about one request
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestDescriptor {
    /// Request facts
    pub request: RequestInfo,
    /// Authenticated caller, `None` for anonymous requests
    #[serde(flatten)]
    pub principal: Option<Principal>,
    /// Policy decision document
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Reserved headers stripped from the request, when exposed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_headers: Option<HeaderValues>,
    /// Path and query the backend receives, when the policy rewrote it
    #[serde(skip)]
    pub forward_url: Option<String>,
}

impl RequestDescriptor {
    /// Build the descriptor from request head, parsing `auth_header`
    pub fn from_parts(parts: &Parts, auth_header: &str) -> Self {
        let path = parts.uri.path();
        let path = path.strip_prefix('/').unwrap_or(path);

        Self {
            request: RequestInfo {
                method: parts.method.as_str().to_string(),
                path: path.split('/').map(String::from).collect(),
                headers: header_values(&parts.headers),
                auth: parts
                    .headers
                    .get(auth_header)
                    .map(|value| parse_auth(&String::from_utf8_lossy(value.as_bytes()))),
                size: content_size(&parts.headers),
                id: None,
            },
            ..Self::default()
        }
    }

    /// Whether a provider attached a principal
    pub fn is_authenticated(&self) -> bool {
        self.principal.is_some()
    }

    /// Identity id, if known
    pub fn id(&self) -> Option<&str> {
        self.request.id.as_deref()
    }

    /// Policy input document
    pub fn to_input(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Collect headers under canonical names, single values as strings
pub fn header_values(headers: &HeaderMap) -> HeaderValues {
    let mut values = HeaderValues::new();
    for name in headers.keys() {
        let mut all: Vec<String> = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect();
        let entry = if all.len() == 1 {
            HeaderEntry::Single(all.remove(0))
        } else {
            HeaderEntry::Multiple(all)
        };
        values.insert(canonical_header_name(name.as_str()), entry);
    }
    values
}

/// MIME canonical form: first letter and letters after `-` upper case
pub fn canonical_header_name(name: &str) -> String {
    let mut upper = true;
    name.chars()
        .map(|c| {
            let mapped = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            mapped
        })
        .collect()
}

/// Split an auth header into scheme and credential
///
/// A value without a space is taken as a bare token. For the Basic scheme
/// the credential is decoded into user and password; undecodable input
/// leaves both empty but keeps the scheme.
pub fn parse_auth(value: &str) -> RequestAuth {
    let value = value.trim();
    let Some((kind, credential)) = value.split_once(' ') else {
        return RequestAuth {
            token: value.to_string(),
            ..RequestAuth::default()
        };
    };

    let mut auth = RequestAuth {
        kind: kind.to_string(),
        ..RequestAuth::default()
    };
    let credential = credential.trim();

    if kind.eq_ignore_ascii_case("basic") {
        if let Some((user, password)) = STANDARD
            .decode(credential)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|decoded| {
                decoded
                    .split_once(':')
                    .map(|(u, p)| (u.to_string(), p.to_string()))
            })
        {
            auth.user = user;
            auth.password = password;
        }
    } else {
        auth.token = credential.to_string();
    }
    auth
}

fn content_size(headers: &HeaderMap) -> i64 {
    if let Some(length) = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
    {
        return length;
    }

    let chunked = headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("chunked"));
    if chunked {
        -1
    } else {
        0
    }
}
