//! HTTP-facing error taxonomy for a tool call against a tenant's upstream.

use serde_json::Value;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request budget exhausted, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("upstream rejected the request: {status} {body}")]
    ValidationError { status: u16, body: Value },

    #[error("upstream returned {status}")]
    Upstream5xx { status: u16 },

    #[error("upstream rejected the refreshed token")]
    Unauthorized,

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Token(#[from] token::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
