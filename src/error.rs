//! Error types for the gateway

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::auth::AuthError;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for gateway operations
///
/// Every variant maps to exactly one HTTP status in [`IntoResponse`]. The
/// detail string is for logs only; response bodies carry a fixed message.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or conflicting startup configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem fault while reading a policy file
    #[error("io error on {path}: {source}")]
    Io {
        /// File the operation targeted
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Policy source could not be compiled
    #[error("policy compile error in {name}: {reason}")]
    PolicyCompile {
        /// Policy file name
        name: String,
        /// Why compilation failed
        reason: String,
    },

    /// Policy evaluation failed
    #[error("policy evaluation error: {0}")]
    PolicyEval(String),

    /// Policy returned a result that does not carry a boolean `allow`
    #[error("invalid policy result: {0}")]
    InvalidPolicyResult(String),

    /// Credentials were presented and rejected
    #[error("authentication failed")]
    Unauthorized,

    /// Policy explicitly denied the request
    #[error("access denied by policy")]
    Forbidden,

    /// Identity infrastructure could not be reached
    #[error("authentication service unavailable")]
    Unavailable,

    /// Backend could not be reached
    #[error("bad gateway: {0}")]
    BadGateway(String),

    /// Any other internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status this error is reported with
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Forbidden => StatusCode::FORBIDDEN,
            Error::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Error::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Error::Config(_)
            | Error::Io { .. }
            | Error::PolicyCompile { .. }
            | Error::PolicyEval(_)
            | Error::InvalidPolicyResult(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn public_message(&self) -> &'static str {
        match self {
            Error::Unauthorized => "invalid credentials",
            Error::Forbidden => "access denied",
            Error::Unavailable => "authentication service unavailable",
            Error::BadGateway(_) => "backend unavailable",
            Error::InvalidPolicyResult(_) => "invalid policy result",
            Error::PolicyCompile { .. } | Error::PolicyEval(_) => "policy evaluation failed",
            Error::Config(_) | Error::Io { .. } | Error::Internal(_) => "internal error",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "code": status.as_u16(),
            "message": self.public_message(),
        });

        let mut response = (status, axum::Json(body)).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Failed => Error::Unauthorized,
            AuthError::Unavailable => Error::Unavailable,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(Error::Unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            Error::BadGateway("refused".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            Error::InvalidPolicyResult("no allow".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            Error::PolicyCompile {
                name: "request.rego".into(),
                reason: "no package".into()
            }
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_auth_error_mapping() {
        assert!(matches!(Error::from(AuthError::Failed), Error::Unauthorized));
        assert!(matches!(
            Error::from(AuthError::Unavailable),
            Error::Unavailable
        ));
    }

    #[tokio::test]
    async fn test_unauthorized_sets_challenge() {
        let response = Error::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Bearer"
        );
    }

    #[tokio::test]
    async fn test_body_hides_internal_detail() {
        let response = Error::Internal("secret path /etc/x".into()).into_response();
        let body = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], 500);
        assert_eq!(json["message"], "internal error");
        assert!(!String::from_utf8_lossy(&body).contains("secret"));
    }
}
