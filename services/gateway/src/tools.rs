//! The MCP tool surface: a thin, generic mapping onto the ITSM REST API.
//!
//! The core does not know the ITSM resource model (§1 non-goals): it
//! exposes one tool, `itsm_request`, whose arguments carry the scope to
//! check and the REST call to make verbatim. The scope check is the only
//! semantic validation performed here; the request/response bodies are
//! opaque and pass through unparsed.

use context::TenantContext;
use reqwest::Method;
use serde_json::{Value, json};
use upstream::UpstreamClient;

use crate::error::Error;

/// `tools/list` result: the one tool this gateway exposes.
pub fn tool_definitions() -> Value {
    json!([{
        "name": "itsm_request",
        "description": "Issue an authenticated call against the tenant's ITSM instance.",
        "inputSchema": {
            "type": "object",
            "properties": {
                "scope": {
                    "type": "string",
                    "description": "Required scope, e.g. \"incidents.Ticket.READ\"."
                },
                "method": {
                    "type": "string",
                    "description": "HTTP method, e.g. GET, POST, PATCH, DELETE."
                },
                "path": {
                    "type": "string",
                    "description": "Path relative to the tenant's instance URL, e.g. \"/incidents/1\"."
                },
                "body": {
                    "description": "Optional JSON request body."
                }
            },
            "required": ["scope", "method", "path"]
        }
    }])
}

/// Executes `itsm_request`. Scope format and membership are checked here;
/// everything else about the call is opaque to the core.
pub async fn call_itsm_request(
    ctx: &TenantContext,
    upstream: &UpstreamClient,
    arguments: &Value,
) -> Result<Value, Error> {
    let scope = arguments
        .get("scope")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::ValidationError("itsm_request: missing required field \"scope\"".to_string()))?;

    if !tenant::is_valid_scope(scope) {
        return Err(Error::ValidationError(format!("itsm_request: malformed scope {scope:?}")));
    }
    if !ctx.has_scope(scope) {
        return Err(Error::PermissionDenied(scope.to_string()));
    }

    let method = arguments
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::ValidationError("itsm_request: missing required field \"method\"".to_string()))?;
    let method: Method = method
        .parse()
        .map_err(|_| Error::ValidationError(format!("itsm_request: invalid HTTP method {method:?}")))?;

    let path = arguments
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::ValidationError("itsm_request: missing required field \"path\"".to_string()))?;

    let body = arguments.get("body").cloned();

    upstream.call(ctx, method, path, body).await.map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use store::{InMemoryStore, RateTier, Store};

    fn ctx_with_scopes(scopes: Vec<String>) -> TenantContext {
        TenantContext::new(
            uuid::Uuid::new_v4(),
            "acme",
            "us-east",
            "https://acme.example.com/api",
            scopes,
            RateTier::Standard,
        )
    }

    async fn upstream_harness() -> UpstreamClient {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let crypto = Arc::new(crypto::EncryptionService::new([1u8; 32]));
        let registry = Arc::new(tenant::Registry::new(
            store.clone(),
            crypto.clone(),
            std::time::Duration::from_secs(300),
            HashMap::new(),
        ));
        let identity = Arc::new(token::HttpIdentityClient::new(reqwest::Client::new()));
        let refresh_gate = Arc::new(ratelimit::RefreshCoordinator::new(ratelimit::RefreshWindowConfig::default(), None));
        let config = token::ManagerConfig {
            safety_margin: token::DEFAULT_SAFETY_MARGIN,
            retry_policy: retry::Policy::default(),
            breaker_config: breaker::Config::default(),
            region_endpoints: HashMap::new(),
            instance_id: "test".to_string(),
        };
        let tokens = Arc::new(token::TokenManager::new(store, crypto, registry, identity, refresh_gate, config));
        let budget = Arc::new(ratelimit::RequestBudget::new());
        UpstreamClient::new(reqwest::Client::new(), tokens, budget)
    }

    #[tokio::test]
    async fn rejects_missing_scope_as_validation_error() {
        let upstream = upstream_harness().await;
        let ctx = ctx_with_scopes(vec!["incidents.Ticket.READ".to_string()]);
        let args = json!({ "method": "GET", "path": "/incidents/1" });
        let err = call_itsm_request(&ctx, &upstream, &args).await.unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
    }

    #[tokio::test]
    async fn rejects_malformed_scope() {
        let upstream = upstream_harness().await;
        let ctx = ctx_with_scopes(vec!["incidents.Ticket.READ".to_string()]);
        let args = json!({ "scope": "not-a-scope", "method": "GET", "path": "/incidents/1" });
        let err = call_itsm_request(&ctx, &upstream, &args).await.unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
    }

    #[tokio::test]
    async fn rejects_scope_not_granted_to_tenant() {
        let upstream = upstream_harness().await;
        let ctx = ctx_with_scopes(vec!["incidents.Ticket.READ".to_string()]);
        let args = json!({ "scope": "incidents.Ticket.DELETE", "method": "DELETE", "path": "/incidents/1" });
        let err = call_itsm_request(&ctx, &upstream, &args).await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn rejects_invalid_http_method() {
        let upstream = upstream_harness().await;
        let ctx = ctx_with_scopes(vec!["incidents.Ticket.READ".to_string()]);
        let args = json!({ "scope": "incidents.Ticket.READ", "method": "NOT-A-METHOD", "path": "/incidents/1" });
        let err = call_itsm_request(&ctx, &upstream, &args).await.unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
    }

    #[test]
    fn tool_definitions_name_itsm_request() {
        let defs = tool_definitions();
        assert_eq!(defs[0]["name"], "itsm_request");
    }
}
