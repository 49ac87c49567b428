//! Upstream HTTP Client (C10): the only component that ever puts a tenant's
//! access token on the wire.

use std::sync::Arc;
use std::time::Duration;

use context::TenantContext;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{instrument, warn};

use crate::error::{Error, Result};

/// Wraps a `reqwest::Client` with token attachment, budget enforcement and
/// the single 401-triggered retry.
pub struct UpstreamClient {
    http: reqwest::Client,
    tokens: Arc<token::TokenManager>,
    budget: Arc<ratelimit::RequestBudget>,
}

impl UpstreamClient {
    pub fn new(http: reqwest::Client, tokens: Arc<token::TokenManager>, budget: Arc<ratelimit::RequestBudget>) -> Self {
        Self { http, tokens, budget }
    }

    /// Issues one logical call to `path` relative to the tenant's instance
    /// URL. On a 401, force-refreshes the token and retries exactly once.
    #[instrument(skip(self, ctx, body), fields(tenant_id = %ctx.tenant_id(), %path))]
    pub async fn call(&self, ctx: &TenantContext, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        match self.budget.reserve(ctx.tenant_id(), ctx.budget()).await {
            ratelimit::ReserveDecision::Allow => {}
            ratelimit::ReserveDecision::Deny { retry_after } => {
                return Err(Error::RateLimited { retry_after });
            }
        }

        let token = self.tokens.access_token(ctx).await?;
        let first = self.send(ctx, method.clone(), path, body.as_ref(), &token).await?;

        if first != StatusOutcome::Unauthorized {
            return self.interpret(first);
        }

        warn!(tenant_id = %ctx.tenant_id(), "upstream rejected token, forcing refresh for one retry");
        let refreshed = self.tokens.force_refresh(ctx).await?;
        let second = self.send(ctx, method, path, body.as_ref(), &refreshed).await?;
        match second {
            StatusOutcome::Unauthorized => Err(Error::Unauthorized),
            other => self.interpret(other),
        }
    }

    async fn send(
        &self,
        ctx: &TenantContext,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: &str,
    ) -> Result<StatusOutcome> {
        let url = format!("{}{}", ctx.instance_url().trim_end_matches('/'), path);
        let mut request = self.http.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| Error::Transport(e.to_string()))?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            return Ok(StatusOutcome::Unauthorized);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = retry_after_from_header(response.headers());
            return Ok(StatusOutcome::RateLimited { retry_after });
        }
        if status.is_success() {
            let value = response.json::<Value>().await.unwrap_or(Value::Null);
            return Ok(StatusOutcome::Success(value));
        }
        if status.is_client_error() {
            let body = response.json::<Value>().await.unwrap_or(Value::Null);
            return Ok(StatusOutcome::ValidationError { status: status.as_u16(), body });
        }
        Ok(StatusOutcome::ServerError { status: status.as_u16() })
    }

    fn interpret(&self, outcome: StatusOutcome) -> Result<Value> {
        match outcome {
            StatusOutcome::Success(value) => Ok(value),
            StatusOutcome::RateLimited { retry_after } => Err(Error::RateLimited { retry_after }),
            StatusOutcome::ValidationError { status, body } => Err(Error::ValidationError { status, body }),
            StatusOutcome::ServerError { status } => Err(Error::Upstream5xx { status }),
            StatusOutcome::Unauthorized => Err(Error::Unauthorized),
        }
    }
}

#[derive(Debug, PartialEq)]
enum StatusOutcome {
    Success(Value),
    RateLimited { retry_after: Duration },
    ValidationError { status: u16, body: Value },
    ServerError { status: u16 },
    Unauthorized,
}

fn retry_after_from_header(headers: &reqwest::header::HeaderMap) -> Duration {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(1))
}
