//! Upstream HTTP Client (C10): attaches a tenant's access token, enforces
//! the request budget, and retries exactly once on a 401.

mod client;
mod error;

pub use client::UpstreamClient;
pub use error::{Error, Result};

#[cfg(test)]
mod tests {
    use super::*;
    use context::TenantContext;
    use reqwest::Method;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use store::{InMemoryStore, RateTier, Store};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn harness(mock: &MockServer) -> (UpstreamClient, TenantContext) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let crypto = Arc::new(crypto::EncryptionService::new([9u8; 32]));

        let mut regions = HashMap::new();
        regions.insert("us-east".to_string(), url::Url::parse(&mock.uri()).unwrap());
        let registry = Arc::new(tenant::Registry::new(
            store.clone(),
            crypto.clone(),
            std::time::Duration::from_secs(300),
            regions,
        ));

        let tenant = registry
            .register(tenant::RegisterRequest {
                name: "Acme".to_string(),
                region: "us-east".to_string(),
                tier: RateTier::Standard,
                metadata: HashMap::new(),
                client_id: "client-1".to_string(),
                client_secret: "secret-1".to_string(),
                refresh_token: "refresh-1".to_string(),
                scopes: vec!["itsm.incidents.READ".to_string()],
                instance_url: mock.uri(),
            })
            .await
            .unwrap();

        let mut region_endpoints = HashMap::new();
        region_endpoints.insert("us-east".to_string(), format!("{}/oauth/token", mock.uri()));

        let identity = Arc::new(token::HttpIdentityClient::new(reqwest::Client::new()));
        let refresh_gate = Arc::new(ratelimit::RefreshCoordinator::new(
            ratelimit::RefreshWindowConfig::default(),
            None,
        ));
        let config = token::ManagerConfig {
            safety_margin: token::DEFAULT_SAFETY_MARGIN,
            retry_policy: retry::Policy {
                strategy: retry::Strategy::Constant,
                initial_delay: std::time::Duration::from_millis(1),
                max_delay: std::time::Duration::from_millis(5),
                factor: 1.0,
                max_attempts: 2,
                jitter: false,
            },
            breaker_config: breaker::Config::default(),
            region_endpoints,
            instance_id: "test-instance".to_string(),
        };
        let tokens = Arc::new(token::TokenManager::new(
            store.clone(),
            crypto,
            registry,
            identity,
            refresh_gate,
            config,
        ));
        let budget = Arc::new(ratelimit::RequestBudget::new());
        let client = UpstreamClient::new(reqwest::Client::new(), tokens, budget);

        let ctx = TenantContext::new(
            tenant.id,
            "Acme",
            "us-east",
            mock.uri(),
            vec!["itsm.incidents.READ".to_string()],
            RateTier::Standard,
        );
        (client, ctx)
    }

    #[tokio::test]
    async fn successful_call_attaches_bearer_token_and_returns_json() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok-abc",
                "refresh_token": "refresh-new",
                "expires_in": 3600
            })))
            .mount(&mock)
            .await;
        Mock::given(method("GET"))
            .and(path("/incidents/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1, "status": "open"})))
            .mount(&mock)
            .await;

        let (client, ctx) = harness(&mock).await;
        let result = client.call(&ctx, Method::GET, "/incidents/1", None).await.unwrap();
        assert_eq!(result["status"], "open");
    }

    #[tokio::test]
    async fn a_401_triggers_one_force_refresh_and_retry() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok-first",
                "refresh_token": "refresh-1",
                "expires_in": 3600
            })))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&mock)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok-second",
                "refresh_token": "refresh-2",
                "expires_in": 3600
            })))
            .with_priority(2)
            .mount(&mock)
            .await;
        Mock::given(method("GET"))
            .and(path("/incidents/1"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&mock)
            .await;
        Mock::given(method("GET"))
            .and(path("/incidents/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1})))
            .with_priority(2)
            .mount(&mock)
            .await;

        let (client, ctx) = harness(&mock).await;
        let result = client.call(&ctx, Method::GET, "/incidents/1", None).await.unwrap();
        assert_eq!(result["id"], 1);
    }

    #[tokio::test]
    async fn validation_error_preserves_upstream_body() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok-abc",
                "refresh_token": "refresh-new",
                "expires_in": 3600
            })))
            .mount(&mock)
            .await;
        Mock::given(method("POST"))
            .and(path("/incidents"))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({"field": "title", "message": "required"})))
            .mount(&mock)
            .await;

        let (client, ctx) = harness(&mock).await;
        let err = client
            .call(&ctx, Method::POST, "/incidents", Some(json!({})))
            .await
            .unwrap_err();
        match err {
            Error::ValidationError { status, body } => {
                assert_eq!(status, 422);
                assert_eq!(body["message"], "required");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_surfaces_as_upstream_5xx() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok-abc",
                "refresh_token": "refresh-new",
                "expires_in": 3600
            })))
            .mount(&mock)
            .await;
        Mock::given(method("GET"))
            .and(path("/incidents/1"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock)
            .await;

        let (client, ctx) = harness(&mock).await;
        let err = client.call(&ctx, Method::GET, "/incidents/1", None).await.unwrap_err();
        assert!(matches!(err, Error::Upstream5xx { status: 503 }));
    }
}
