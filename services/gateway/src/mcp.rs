//! MCP JSON-RPC 2.0 envelope handling (§6).
//!
//! Unknown methods return `-32601`. Tool-invocation errors are returned as
//! `isError: true` content blocks rather than JSON-RPC `error` objects,
//! except transport/auth failures which remain proper JSON-RPC errors.

use context::TenantContext;
use serde_json::{Value, json};
use upstream::UpstreamClient;

use crate::error::Error;
use crate::tools;

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const SERVER_ERROR: i64 = -32000;

fn rpc_error(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message.into() }
    })
}

fn rpc_result(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Dispatches one JSON-RPC request or notification. Returns `None` for a
/// notification (no `id`, per spec — no response is ever emitted for it) or
/// for a request whose id could not be recovered from malformed input.
pub async fn dispatch(ctx: &TenantContext, upstream: &UpstreamClient, raw: Value) -> Option<Value> {
    let Some(obj) = raw.as_object() else {
        return Some(rpc_error(Value::Null, PARSE_ERROR, "request body must be a JSON object"));
    };

    let id = obj.get("id").cloned();
    let is_notification = id.is_none() || id == Some(Value::Null) && !obj.contains_key("id");

    let Some(method) = obj.get("method").and_then(Value::as_str) else {
        return if is_notification {
            None
        } else {
            Some(rpc_error(id.unwrap_or(Value::Null), INVALID_REQUEST, "missing required field \"method\""))
        };
    };

    let params = obj.get("params").cloned().unwrap_or(Value::Null);
    let result = route(ctx, upstream, method, &params).await;

    if is_notification {
        return None;
    }
    let id = id.unwrap_or(Value::Null);

    match result {
        Ok(value) => Some(rpc_result(id, value)),
        Err(RouteError::MethodNotFound) => {
            Some(rpc_error(id, METHOD_NOT_FOUND, format!("method not found: {method}")))
        }
        Err(RouteError::InvalidParams(msg)) => Some(rpc_error(id, INVALID_PARAMS, msg)),
        Err(RouteError::Tool(err)) if err.is_transport_or_auth() => {
            Some(rpc_error(id, SERVER_ERROR, err.to_string()))
        }
        Err(RouteError::Tool(err)) => Some(rpc_result(
            id,
            json!({
                "content": [{ "type": "text", "text": err.to_json().to_string() }],
                "isError": true,
            }),
        )),
    }
}

enum RouteError {
    MethodNotFound,
    InvalidParams(String),
    Tool(Error),
}

async fn route(ctx: &TenantContext, upstream: &UpstreamClient, method: &str, params: &Value) -> Result<Value, RouteError> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "serverInfo": { "name": "itsm-oauth-gateway", "version": env!("CARGO_PKG_VERSION") },
            "capabilities": { "tools": {} }
        })),
        "tools/list" => Ok(json!({ "tools": tools::tool_definitions() })),
        "tools/call" => {
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| RouteError::InvalidParams("tools/call: missing required field \"name\"".to_string()))?;
            if name != "itsm_request" {
                return Err(RouteError::MethodNotFound);
            }
            let empty = json!({});
            let arguments = params.get("arguments").unwrap_or(&empty);
            let result = tools::call_itsm_request(ctx, upstream, arguments)
                .await
                .map_err(RouteError::Tool)?;
            Ok(json!({ "content": [{ "type": "text", "text": result.to_string() }] }))
        }
        _ => Err(RouteError::MethodNotFound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use store::{InMemoryStore, RateTier, Store};

    async fn harness() -> (TenantContext, UpstreamClient) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let crypto = Arc::new(crypto::EncryptionService::new([4u8; 32]));
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
        let upstream = UpstreamClient::new(reqwest::Client::new(), tokens, budget);
        let ctx = TenantContext::new(
            uuid::Uuid::new_v4(),
            "acme",
            "us-east",
            "https://acme.example.com/api",
            vec!["incidents.Ticket.READ".to_string()],
            RateTier::Standard,
        );
        (ctx, upstream)
    }

    #[tokio::test]
    async fn notification_without_id_produces_no_response() {
        let (ctx, upstream) = harness().await;
        let raw = json!({ "jsonrpc": "2.0", "method": "tools/list" });
        assert!(dispatch(&ctx, &upstream, raw).await.is_none());
    }

    #[tokio::test]
    async fn unknown_method_returns_method_not_found() {
        let (ctx, upstream) = harness().await;
        let raw = json!({ "jsonrpc": "2.0", "id": 1, "method": "bogus/method" });
        let response = dispatch(&ctx, &upstream, raw).await.unwrap();
        assert_eq!(response["error"]["code"], METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn tools_list_returns_itsm_request_tool() {
        let (ctx, upstream) = harness().await;
        let raw = json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" });
        let response = dispatch(&ctx, &upstream, raw).await.unwrap();
        assert_eq!(response["result"]["tools"][0]["name"], "itsm_request");
    }

    #[tokio::test]
    async fn tools_call_with_denied_scope_returns_is_error_content_not_jsonrpc_error() {
        let (ctx, upstream) = harness().await;
        let raw = json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "tools/call",
            "params": {
                "name": "itsm_request",
                "arguments": { "scope": "incidents.Ticket.DELETE", "method": "DELETE", "path": "/incidents/1" }
            }
        });
        let response = dispatch(&ctx, &upstream, raw).await.unwrap();
        assert!(response.get("error").is_none(), "expected no top-level JSON-RPC error, got {response}");
        assert_eq!(response["result"]["isError"], true);
    }

    #[tokio::test]
    async fn tools_call_for_unknown_tool_name_is_method_not_found() {
        let (ctx, upstream) = harness().await;
        let raw = json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": { "name": "does_not_exist", "arguments": {} }
        });
        let response = dispatch(&ctx, &upstream, raw).await.unwrap();
        assert_eq!(response["error"]["code"], METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_method_field_on_request_is_invalid_request() {
        let (ctx, upstream) = harness().await;
        let raw = json!({ "jsonrpc": "2.0", "id": 3 });
        let response = dispatch(&ctx, &upstream, raw).await.unwrap();
        assert_eq!(response["error"]["code"], INVALID_REQUEST);
    }
}
