//! Removal of client-supplied reserved headers
//!
//! Headers under [`RESERVED_PREFIX`] carry decisions from the gateway to the
//! backend, so a client must never be able to send them. They are stripped
//! before anything else looks at the request.

use axum::http::{HeaderMap, HeaderName};

use crate::request::{canonical_header_name, HeaderEntry, HeaderValues};

/// Prefix of headers only the gateway may set
pub const RESERVED_PREFIX: &str = "X-Regate-";

/// Outcome of [`strip_reserved_headers`]
#[derive(Debug, Default)]
pub struct Stripped {
    /// Number of header values removed
    pub count: usize,
    /// Removed headers, when capture was requested and anything was removed
    pub captured: Option<HeaderValues>,
}

/// Remove every header whose name starts with [`RESERVED_PREFIX`], ignoring
/// case
///
/// With `capture` set the removed values are returned so the policy can see
/// what the client tried to send; they are never forwarded.
pub fn strip_reserved_headers(headers: &mut HeaderMap, capture: bool) -> Stripped {
    let prefix = RESERVED_PREFIX.to_ascii_lowercase();
    let reserved: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with(&prefix))
        .cloned()
        .collect();

    let mut stripped = Stripped::default();
    let mut captured = HeaderValues::new();

    for name in reserved {
        let mut values: Vec<String> = headers
            .get_all(&name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect();
        headers.remove(&name);
        stripped.count += values.len();

        if capture {
            let entry = if values.len() == 1 {
                HeaderEntry::Single(values.remove(0))
            } else {
                HeaderEntry::Multiple(values)
            };
            captured.insert(canonical_header_name(name.as_str()), entry);
        }
    }

    if !captured.is_empty() {
        stripped.captured = Some(captured);
    }
    stripped
}
