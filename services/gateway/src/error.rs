//! HTTP-facing error taxonomy.
//!
//! Every error that can reach an agent is translated into one of the
//! documented `<kind>` values and the `{code, message, retryAfter?, details?}`
//! JSON shape. Internal error enums (`tenant::Error`, `token::Error`,
//! `upstream::Error`, ...) never leak their `Debug` representation across
//! this boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("authentication failed")]
    AuthError,

    #[error("permission denied: missing scope {0:?}")]
    PermissionDenied(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: std::time::Duration },

    #[error("circuit open")]
    CircuitOpen,

    #[error("upstream returned {status}")]
    Upstream5xx { status: u16 },

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "retryAfter")]
    retry_after: Option<u64>,
}

impl Error {
    pub fn kind(&self) -> &'static str {
        match self {
            Error::AuthError => "AUTH_ERROR",
            Error::PermissionDenied(_) => "PERMISSION_DENIED",
            Error::ValidationError(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::RateLimited { .. } => "RATE_LIMITED",
            Error::CircuitOpen => "CIRCUIT_OPEN",
            Error::Upstream5xx { .. } => "UPSTREAM_5XX",
            Error::NetworkError(_) => "NETWORK_ERROR",
            Error::Internal(_) => "INTERNAL",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::AuthError => StatusCode::UNAUTHORIZED,
            Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Error::ValidationError(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            Error::Upstream5xx { .. } => StatusCode::BAD_GATEWAY,
            Error::NetworkError(_) => StatusCode::BAD_GATEWAY,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Error::RateLimited { retry_after } => Some(retry_after.as_secs().max(1)),
            _ => None,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if self.status().is_server_error() || matches!(self, Error::RateLimited { .. } | Error::CircuitOpen) {
            crate::metrics::record_upstream_error(self.kind());
        }
        let body = ErrorBody {
            code: self.kind(),
            message: self.to_string(),
            retry_after: self.retry_after_secs(),
        };
        (self.status(), axum::Json(body)).into_response()
    }
}

impl Error {
    /// The `{code, message, retryAfter?}` shape from §6, as a bare JSON value.
    /// Used by the MCP dispatcher to embed a tool-call failure in an
    /// `isError` content block instead of an HTTP response body.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "code": self.kind(),
            "message": self.to_string(),
            "retryAfter": self.retry_after_secs(),
        })
    }

    /// True for the two kinds §6 carves out as "proper JSON-RPC errors"
    /// rather than `isError` tool-result content: transport and auth
    /// failures are failures of the MCP call itself, not of the tool.
    pub fn is_transport_or_auth(&self) -> bool {
        matches!(self, Error::AuthError | Error::NetworkError(_) | Error::Internal(_))
    }
}

/// Maps the token manager's refresh-path error enum onto the gateway
/// taxonomy, per the kind table: a suspended-tenant auto-suspend surfaces as
/// `AUTH_ERROR`, a rate-limited refresh as `RATE_LIMITED`, and so on.
impl From<token::Error> for Error {
    fn from(err: token::Error) -> Self {
        match err {
            token::Error::NoRefreshToken(_) => Error::AuthError,
            token::Error::RateLimited { retry_after } => Error::RateLimited { retry_after },
            token::Error::CircuitOpen(_) => Error::CircuitOpen,
            token::Error::Permanent { .. } => Error::AuthError,
            token::Error::Transient { tenant_id, cause } => {
                Error::NetworkError(format!("tenant {tenant_id}: {cause}"))
            }
            token::Error::Cancelled(_) => Error::Internal("refresh wait cancelled".to_string()),
            token::Error::TaskPanicked(_) => Error::Internal("refresh task panicked".to_string()),
            token::Error::Tenant(e) => e.into(),
            token::Error::Store(_) | token::Error::Crypto(_) | token::Error::RateLimitCoordinator(_) => {
                Error::Internal(err.to_string())
            }
        }
    }
}

impl From<tenant::Error> for Error {
    fn from(err: tenant::Error) -> Self {
        match err {
            tenant::Error::NotFound(id) => Error::NotFound(format!("tenant {id}")),
            tenant::Error::NameCollision(name) => Error::ValidationError(format!("tenant name {name:?} already registered")),
            tenant::Error::InvalidScopeFormat(scope) => Error::ValidationError(format!("invalid scope {scope:?}")),
            tenant::Error::RegionMismatch { region, instance_url } => {
                Error::ValidationError(format!("instance url {instance_url} does not match region {region}"))
            }
            tenant::Error::UnknownRegion(region) => Error::ValidationError(format!("unknown region {region:?}")),
            tenant::Error::DecryptError(_) => Error::Internal("credential decryption failed".to_string()),
            tenant::Error::Store(_) | tenant::Error::Crypto(_) => Error::Internal(err.to_string()),
        }
    }
}

impl From<upstream::Error> for Error {
    fn from(err: upstream::Error) -> Self {
        match err {
            upstream::Error::RateLimited { retry_after } => Error::RateLimited { retry_after },
            upstream::Error::ValidationError { body, .. } => {
                Error::ValidationError(json!(body).to_string())
            }
            upstream::Error::Upstream5xx { status } => Error::Upstream5xx { status },
            upstream::Error::Unauthorized => Error::AuthError,
            upstream::Error::Transport(msg) => Error::NetworkError(msg),
            upstream::Error::Token(e) => e.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
