//! SSE session multiplexer (C9): one long-lived GET /sse stream per agent
//! connection, fed by a per-session inbound channel that POST /messages
//! writes into. A single draining task per session guarantees FIFO response
//! ordering on the SSE stream regardless of inbound arrival order.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use axum::http::StatusCode;
use context::TenantContext;
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth;
use crate::error::Error;
use crate::mcp;
use crate::GatewayState;

pub type SessionId = Uuid;

/// Per-session state, keyed by a server-generated session id handed back on
/// the initial SSE `connected` event. Cheap to clone: holds only an `Arc` to
/// the shared handle.
pub struct SessionHandle {
    pub ctx: TenantContext,
    pub client_ip: IpAddr,
    pub created_at: Instant,
    last_activity: StdMutex<Instant>,
    inbound_tx: mpsc::UnboundedSender<Value>,
}

impl SessionHandle {
    fn touch(&self) {
        *self.last_activity.lock().expect("lock poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().expect("lock poisoned").elapsed()
    }
}

/// The live session table. One instance shared by the whole gateway process.
#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<SessionId, Arc<SessionHandle>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    async fn insert(&self, id: SessionId, handle: Arc<SessionHandle>) {
        self.sessions.write().await.insert(id, handle);
        crate::metrics::set_active_sessions(self.session_count().await as u64);
    }

    pub async fn remove(&self, id: SessionId) {
        self.sessions.write().await.remove(&id);
        crate::metrics::set_active_sessions(self.session_count().await as u64);
    }

    pub async fn get(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Session count broken down by client IP, for the `/sessions` admin
    /// endpoint's abuse-triage view.
    pub async fn ip_breakdown(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for handle in self.sessions.read().await.values() {
            *counts.entry(handle.client_ip.to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Removes and cancels any session idle longer than `idle_timeout`.
    /// Cancelling the context unblocks the session's writer task, which then
    /// tears down its own SSE stream.
    pub async fn sweep_idle(&self, idle_timeout: Duration) {
        let stale: Vec<SessionId> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, handle)| handle.idle_for() > idle_timeout)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in stale {
            if let Some(handle) = self.sessions.write().await.remove(&id) {
                warn!(session_id = %id, tenant = handle.ctx.tenant_name(), "sweeping idle session");
                handle.ctx.cancel();
            }
        }
        crate::metrics::set_active_sessions(self.session_count().await as u64);
    }

    /// Spawns a background task sweeping idle sessions on `interval` until
    /// the process shuts down.
    pub fn spawn_idle_sweeper(table: Arc<SessionTable>, interval: Duration, idle_timeout: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                table.sweep_idle(idle_timeout).await;
            }
        })
    }
}

/// Drops alongside the SSE response stream (client disconnect, or the
/// handler future being cancelled) and tears the session down exactly once.
struct SessionGuard {
    id: SessionId,
    ctx: TenantContext,
    table: Arc<SessionTable>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.ctx.cancel();
        let table = self.table.clone();
        let id = self.id;
        tokio::spawn(async move { table.remove(id).await });
    }
}

fn connected_event(session_id: SessionId) -> Result<Event, Infallible> {
    Ok(Event::default()
        .event("connected")
        .json_data(serde_json::json!({ "type": "connection", "sessionId": session_id }))
        .expect("serializable"))
}

/// `GET /sse`: authenticates the caller, binds the connection to a tenant,
/// and opens a long-lived event stream. The tenant-binding credentials
/// (`X-Tenant-Client-Id` / `X-Tenant-Client-Secret`) name an already
/// registered tenant by name — registering a *new* tenant is an admin-surface
/// operation, since it requires a refresh token this handshake never carries.
pub async fn sse_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Error> {
    auth::check_api_key(&headers, &state.auth_config)?;
    auth::check_ip_allow_list(addr.ip(), &state.auth_config)?;

    let creds = auth::extract_tenant_credentials(&headers)?;
    let tenant = state
        .registry
        .find_by_name(&creds.client_id)
        .await?
        .ok_or(Error::AuthError)?;

    if tenant.status != store::TenantStatus::Active {
        return Err(Error::AuthError);
    }

    let with_config = state.registry.get_tenant(tenant.id).await?;
    if !auth::secrets_match(&with_config.client_secret, &creds.client_secret) {
        return Err(Error::AuthError);
    }

    let budget = ratelimit::resolve_tier_budget(tenant.tier, &state.tier_overrides);
    let ctx = TenantContext::new(
        tenant.id,
        tenant.name.clone(),
        tenant.region.clone(),
        with_config.instance_url.clone(),
        with_config.scopes.clone(),
        tenant.tier,
    )
    .with_budget_override(budget);

    let session_id = Uuid::new_v4();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Value>();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Value>();

    let handle = Arc::new(SessionHandle {
        ctx: ctx.clone(),
        client_ip: addr.ip(),
        created_at: Instant::now(),
        last_activity: StdMutex::new(Instant::now()),
        inbound_tx,
    });
    state.sessions.insert(session_id, handle).await;

    info!(session_id = %session_id, tenant = tenant.name.as_str(), client_ip = %addr.ip(), "session opened");

    // The single writer task: drains the inbound channel in arrival order,
    // dispatches each message through the JSON-RPC router, and forwards any
    // response onto the outbound channel. Serializing all dispatch here is
    // what guarantees per-session response ordering.
    tokio::spawn(drain_session(ctx.clone(), state.upstream.clone(), inbound_rx, outbound_tx));

    let guard = SessionGuard { id: session_id, ctx: ctx.clone(), table: state.sessions.clone() };

    let stream = stream::once(async move { connected_event(session_id) }).chain(stream::unfold(
        (outbound_rx, guard),
        |(mut rx, guard)| async move {
            tokio::select! {
                biased;
                _ = guard.ctx.cancelled() => None,
                response = rx.recv() => response.map(|value| {
                    let event = Event::default().event("message").json_data(&value).expect("serializable");
                    (Ok(event), (rx, guard))
                }),
            }
        },
    ));

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)).text("keepalive")))
}

/// Drains one session's inbound JSON-RPC messages in arrival order,
/// dispatching each in turn and forwarding its response (if any) onto the
/// outbound channel. Never runs more than one message at a time for a given
/// session, which is the whole of the FIFO guarantee: whatever order
/// `POST /messages` calls land in this channel, responses leave in that
/// same order.
async fn drain_session(
    ctx: TenantContext,
    upstream: Arc<upstream::UpstreamClient>,
    mut inbound_rx: mpsc::UnboundedReceiver<Value>,
    outbound_tx: mpsc::UnboundedSender<Value>,
) {
    loop {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => break,
            message = inbound_rx.recv() => {
                let Some(message) = message else { break };
                let dispatch_ctx = ctx.clone();
                let response = context::with_context(ctx.clone(), async {
                    mcp::dispatch(&dispatch_ctx, &upstream, message).await
                })
                .await;
                if let Some(response) = response {
                    if outbound_tx.send(response).is_err() {
                        break;
                    }
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
}

/// `POST /messages?sessionId=...`: hands a JSON-RPC payload to the named
/// session's inbound channel and returns immediately. The real response, if
/// any, is delivered asynchronously on that session's SSE stream.
pub async fn messages_handler(
    State(state): State<GatewayState>,
    Query(query): Query<MessagesQuery>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<StatusCode, Error> {
    auth::check_api_key(&headers, &state.auth_config)?;

    let handle = state
        .sessions
        .get(query.session_id)
        .await
        .ok_or_else(|| Error::NotFound(format!("session {}", query.session_id)))?;

    let budget = handle.ctx.budget();
    let per_session_budget = ratelimit::TierBudget { per_minute: state.session_requests_per_minute, ..budget };
    match state.session_budget.reserve(query.session_id, per_session_budget).await {
        ratelimit::ReserveDecision::Allow => {}
        ratelimit::ReserveDecision::Deny { retry_after } => return Err(Error::RateLimited { retry_after }),
    }

    handle.touch();
    // Best-effort: a send failure means the writer task has already exited
    // (session torn down concurrently), which the next `/messages` call
    // will observe as a 404 once the table catches up.
    let _ = handle.inbound_tx.send(body);

    Ok(StatusCode::ACCEPTED)
}

/// `GET /sessions`: an operator-facing view of live session load, protected
/// by the same API key as the data plane.
pub async fn sessions_handler(State(state): State<GatewayState>, headers: HeaderMap) -> Result<Json<Value>, Error> {
    auth::check_api_key(&headers, &state.auth_config)?;
    let count = state.sessions.session_count().await;
    let by_ip = state.sessions.ip_breakdown().await;
    Ok(Json(serde_json::json!({ "sessions": count, "byIp": by_ip })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use store::{InMemoryStore, RateTier, Store};

    async fn gateway_state() -> GatewayState {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let crypto = Arc::new(crypto::EncryptionService::new([5u8; 32]));
        let registry = Arc::new(tenant::Registry::new(store.clone(), crypto.clone(), Duration::from_secs(300), HashMap::new()));
        let identity = Arc::new(token::HttpIdentityClient::new(reqwest::Client::new()));
        let refresh_gate = Arc::new(ratelimit::RefreshCoordinator::new(ratelimit::RefreshWindowConfig::default(), None));
        let config = token::ManagerConfig {
            safety_margin: token::DEFAULT_SAFETY_MARGIN,
            retry_policy: retry::Policy::default(),
            breaker_config: breaker::Config::default(),
            region_endpoints: HashMap::new(),
            instance_id: "test".to_string(),
        };
        let tokens = Arc::new(token::TokenManager::new(store, crypto, registry.clone(), identity, refresh_gate, config));
        let budget = Arc::new(ratelimit::RequestBudget::new());
        let upstream = Arc::new(upstream::UpstreamClient::new(reqwest::Client::new(), tokens, budget));
        GatewayState {
            registry,
            upstream,
            sessions: Arc::new(SessionTable::new()),
            session_budget: Arc::new(ratelimit::RequestBudget::new()),
            session_requests_per_minute: 6000,
            auth_config: Arc::new(crate::config::AuthConfig { api_keys: vec!["test-key".to_string()], ip_allow_list: vec![] }),
            tier_overrides: Arc::new(HashMap::new()),
            started_at: Instant::now(),
            requests_total: Arc::new(std::sync::atomic::AtomicU64::new(0)),
            metrics_handle: metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder().handle(),
        }
    }

    fn auth_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "test-key".parse().unwrap());
        headers
    }

    /// Stands in for the tenant-binding half of `sse_handler`: opens a
    /// session against `state` and spawns its real writer task, without
    /// going through the HTTP/SSE plumbing that a live connection needs.
    async fn open_session(state: &GatewayState) -> (SessionId, mpsc::UnboundedReceiver<Value>) {
        let ctx = TenantContext::new(
            Uuid::new_v4(),
            "acme",
            "us-east",
            "https://acme.example.com/api",
            vec!["incidents.Ticket.READ".to_string()],
            RateTier::Standard,
        );
        let session_id = Uuid::new_v4();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Value>();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Value>();
        let handle = Arc::new(SessionHandle {
            ctx: ctx.clone(),
            client_ip: "127.0.0.1".parse().unwrap(),
            created_at: Instant::now(),
            last_activity: StdMutex::new(Instant::now()),
            inbound_tx,
        });
        state.sessions.insert(session_id, handle).await;
        tokio::spawn(drain_session(ctx, state.upstream.clone(), inbound_rx, outbound_tx));
        (session_id, outbound_rx)
    }

    async fn post(state: &GatewayState, session_id: SessionId, body: Value) {
        let status = messages_handler(State(state.clone()), Query(MessagesQuery { session_id }), auth_headers(), Json(body))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    /// Property 3: responses on a session are observed in the same order the
    /// requests that produced them were posted.
    #[tokio::test]
    async fn responses_on_one_session_preserve_post_order() {
        let state = gateway_state().await;
        let (session_a, mut events_a) = open_session(&state).await;
        let (_session_b, mut events_b) = open_session(&state).await;

        for i in 0..5i64 {
            post(&state, session_a, serde_json::json!({ "jsonrpc": "2.0", "id": i, "method": "initialize" })).await;
        }

        let mut received = Vec::new();
        for _ in 0..5 {
            let response = events_a.recv().await.expect("a response for each posted message");
            received.push(response["id"].as_i64().unwrap());
        }
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
        assert!(events_b.try_recv().is_err(), "an unrelated session must not observe this session's responses");
    }

    /// Two sessions running concurrently each keep their own FIFO order and
    /// never cross streams.
    #[tokio::test]
    async fn two_sessions_each_preserve_their_own_order() {
        let state = gateway_state().await;
        let (session_a, mut events_a) = open_session(&state).await;
        let (session_b, mut events_b) = open_session(&state).await;

        for i in 0..4i64 {
            post(&state, session_a, serde_json::json!({ "jsonrpc": "2.0", "id": format!("a{i}"), "method": "initialize" })).await;
            post(&state, session_b, serde_json::json!({ "jsonrpc": "2.0", "id": format!("b{i}"), "method": "initialize" })).await;
        }

        for i in 0..4 {
            let response = events_a.recv().await.unwrap();
            assert_eq!(response["id"], serde_json::json!(format!("a{i}")));
        }
        for i in 0..4 {
            let response = events_b.recv().await.unwrap();
            assert_eq!(response["id"], serde_json::json!(format!("b{i}")));
        }
    }

    #[tokio::test]
    async fn posting_to_unknown_session_is_not_found() {
        let state = gateway_state().await;
        let err = messages_handler(
            State(state.clone()),
            Query(MessagesQuery { session_id: Uuid::new_v4() }),
            auth_headers(),
            Json(serde_json::json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize" })),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
