//! Token Manager (C7): owns the refresh path for every tenant, single-flight
//! under a per-tenant mutex, gated by the rate-limit coordinator and the
//! circuit breaker, retried per the shared backoff policy.

use std::collections::HashMap;
use std::sync::Arc;

use breaker::{CircuitBreaker, Permit};
use context::TenantContext;
use ratelimit::{RefreshCoordinator, RefreshDecision};
use store::{AuditOutcome, RefreshAudit, Store, StoredToken, TenantId, TenantStatus};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identity::{IdentityClient, IdentityError};

/// Tokens are treated as unusable this long before their real expiry, to
/// absorb clock skew and in-flight request latency.
pub const DEFAULT_SAFETY_MARGIN: time::Duration = time::Duration::seconds(60);

/// Tunables that don't belong to any one sub-component.
#[derive(Clone)]
pub struct ManagerConfig {
    pub safety_margin: time::Duration,
    pub retry_policy: retry::Policy,
    pub breaker_config: breaker::Config,
    /// Region tag → token endpoint URL, mirroring the registry's map.
    pub region_endpoints: HashMap<String, String>,
    pub instance_id: String,
}

struct Inner {
    store: Arc<dyn Store>,
    crypto: Arc<crypto::EncryptionService>,
    registry: Arc<tenant::Registry>,
    identity: Arc<dyn IdentityClient>,
    refresh_gate: Arc<RefreshCoordinator>,
    breakers: RwLock<HashMap<TenantId, Arc<CircuitBreaker>>>,
    mutexes: RwLock<HashMap<TenantId, Arc<Mutex<()>>>>,
    config: ManagerConfig,
}

/// Owns the refresh lifecycle for every tenant in this process. Cheap to
/// clone (an `Arc` around shared state); clones are handed to spawned
/// sweeper and single-flight tasks.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn Store>,
        crypto: Arc<crypto::EncryptionService>,
        registry: Arc<tenant::Registry>,
        identity: Arc<dyn IdentityClient>,
        refresh_gate: Arc<RefreshCoordinator>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                crypto,
                registry,
                identity,
                refresh_gate,
                breakers: RwLock::new(HashMap::new()),
                mutexes: RwLock::new(HashMap::new()),
                config,
            }),
        }
    }

    /// Returns a valid access token for the tenant, refreshing if needed.
    /// The refresh itself runs detached from `ctx`'s cancellation: a client
    /// disconnecting must not abort a refresh that other callers are
    /// waiting on.
    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id()))]
    pub async fn access_token(&self, ctx: &TenantContext) -> Result<String> {
        let tenant_id = ctx.tenant_id();
        if let Some(token) = self.cached_valid(tenant_id).await? {
            return Ok(token);
        }

        let mgr = self.clone();
        let handle = tokio::spawn(async move { mgr.refresh_under_mutex(tenant_id, false).await });

        tokio::select! {
            res = handle => res.map_err(|_| Error::TaskPanicked(tenant_id))?,
            _ = ctx.cancelled() => Err(Error::Cancelled(tenant_id)),
        }
    }

    /// Administrative override: bypasses the minimum-refresh-interval rule
    /// but still honours the windowed cap and the circuit breaker.
    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id()))]
    pub async fn force_refresh(&self, ctx: &TenantContext) -> Result<String> {
        let tenant_id = ctx.tenant_id();
        let mgr = self.clone();
        let handle = tokio::spawn(async move { mgr.refresh_under_mutex(tenant_id, true).await });

        tokio::select! {
            res = handle => res.map_err(|_| Error::TaskPanicked(tenant_id))?,
            _ = ctx.cancelled() => Err(Error::Cancelled(tenant_id)),
        }
    }

    /// One sweep over every active tenant whose cached token expires within
    /// `refresh_margin`. Never bypasses the gate or the breaker; a denied
    /// refresh simply waits for the next tick.
    pub async fn sweep_once(&self, refresh_margin: time::Duration) -> Result<()> {
        let tenants = self.inner.store.list_active_tenants().await?;
        let now = time::OffsetDateTime::now_utc();

        for tenant in tenants {
            let due = match self.inner.store.find_stored_token(tenant.id).await? {
                Some(token) => !token.is_valid(now, refresh_margin),
                None => true,
            };
            if !due {
                continue;
            }

            match self.refresh_under_mutex(tenant.id, false).await {
                Ok(_) => info!(tenant_id = %tenant.id, "sweeper refreshed token"),
                Err(Error::RateLimited { .. }) | Err(Error::CircuitOpen(_)) => {
                    // Deferred to the next tick; not an operational failure.
                }
                Err(err) => warn!(tenant_id = %tenant.id, error = %err, "sweeper refresh failed"),
            }
        }
        Ok(())
    }

    /// Spawns the background sweeper loop. The first tick is skipped so a
    /// freshly started process doesn't stampede every tenant's refresh at once.
    pub fn spawn_sweeper(
        &self,
        check_interval: std::time::Duration,
        refresh_margin: time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        let mgr = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = mgr.sweep_once(refresh_margin).await {
                    warn!(error = %err, "sweeper iteration failed");
                }
            }
        })
    }

    async fn cached_valid(&self, tenant_id: TenantId) -> Result<Option<String>> {
        let Some(stored) = self.inner.store.find_stored_token(tenant_id).await? else {
            return Ok(None);
        };
        let now = time::OffsetDateTime::now_utc();
        if !stored.is_valid(now, self.inner.config.safety_margin) {
            return Ok(None);
        }
        let tenant = self
            .inner
            .store
            .find_tenant_by_id(tenant_id)
            .await?
            .ok_or(Error::NoRefreshToken(tenant_id))?;
        let plaintext = self.inner.crypto.decrypt(&stored.access_enc, &tenant.name)?;
        Ok(Some(plaintext))
    }

    /// Implements the refresh state machine from `idle` through `refreshing`
    /// under the tenant's single-flight mutex.
    async fn refresh_under_mutex(&self, tenant_id: TenantId, force: bool) -> Result<String> {
        let cell = self.mutex_for(tenant_id).await;
        let _guard = cell.lock().await;

        if !force {
            if let Some(token) = self.cached_valid(tenant_id).await? {
                return Ok(token);
            }
        }

        let decision = if force {
            self.inner.refresh_gate.can_force_refresh(tenant_id).await?
        } else {
            self.inner.refresh_gate.can_refresh(tenant_id).await?
        };
        if let RefreshDecision::Deny { retry_after } = decision {
            return Err(Error::RateLimited { retry_after });
        }

        let breaker = self.breaker_for(tenant_id).await;
        if breaker.allow().await == Permit::Rejected {
            return Err(Error::CircuitOpen(tenant_id));
        }

        let tenant_cfg = self.inner.registry.get_tenant(tenant_id).await?;
        if tenant_cfg.refresh_token.is_empty() {
            return Err(Error::NoRefreshToken(tenant_id));
        }
        let token_endpoint = self
            .inner
            .config
            .region_endpoints
            .get(&tenant_cfg.tenant.region)
            .cloned()
            .ok_or_else(|| Error::NoRefreshToken(tenant_id))?;

        self.inner.refresh_gate.record_attempt(tenant_id).await;

        let identity = self.inner.identity.clone();
        let result = retry::run(
            &self.inner.config.retry_policy,
            None,
            |err: &IdentityError| retry::classify(&err.as_failure()),
            |_attempt| {
                let identity = identity.clone();
                let token_endpoint = token_endpoint.clone();
                let client_id = tenant_cfg.client_id.clone();
                let client_secret = tenant_cfg.client_secret.clone();
                let refresh_token = tenant_cfg.refresh_token.clone();
                async move {
                    identity
                        .refresh(&token_endpoint, &client_id, &client_secret, &refresh_token)
                        .await
                }
            },
        )
        .await;

        match result {
            Ok(refreshed) => {
                breaker.on_success().await;
                let access_token = refreshed.access_token.clone();
                self.persist_success(&tenant_cfg, refreshed).await?;
                Ok(access_token)
            }
            Err(retry::RetryError::Cancelled) => {
                breaker.on_failure().await;
                Err(Error::Transient { tenant_id, cause: "retry loop cancelled".to_string() })
            }
            Err(retry::RetryError::Exhausted(cause)) => {
                breaker.on_failure().await;
                let classification = retry::classify(&cause.as_failure());
                self.record_failure_audit(tenant_id, &cause).await?;
                metrics::counter!("gateway_token_refreshes_total", "tenant_id" => tenant_cfg.tenant.name.clone(), "outcome" => "failure").increment(1);

                if classification == retry::Classification::Permanent {
                    self.inner
                        .registry
                        .update_status(tenant_id, TenantStatus::Suspended)
                        .await?;
                    warn!(tenant_id = %tenant_id, cause = %cause, "tenant suspended after permanent refresh failure");
                    Err(Error::Permanent { tenant_id, cause: cause.to_string() })
                } else {
                    Err(Error::Transient { tenant_id, cause: cause.to_string() })
                }
            }
        }
    }

    async fn persist_success(
        &self,
        tenant_cfg: &tenant::TenantWithConfig,
        refreshed: crate::identity::RefreshedToken,
    ) -> Result<()> {
        let tenant_name = &tenant_cfg.tenant.name;
        let access_enc = self.inner.crypto.encrypt(&refreshed.access_token, tenant_name)?;
        let refresh_enc = self.inner.crypto.encrypt(&refreshed.refresh_token, tenant_name)?;
        let now = time::OffsetDateTime::now_utc();
        let expires_at = now + time::Duration::seconds(refreshed.expires_in as i64);
        let scopes = refreshed
            .scope
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_else(|| tenant_cfg.scopes.clone());

        let token = StoredToken {
            tenant_id: tenant_cfg.id(),
            access_enc,
            refresh_enc,
            expires_at,
            scopes,
            last_refreshed: now,
            refresh_count: 0,
        };
        let audit = RefreshAudit {
            id: Uuid::new_v4(),
            tenant_id: tenant_cfg.id(),
            at: now,
            outcome: AuditOutcome::Success,
            classification: None,
            instance_id: self.inner.config.instance_id.clone(),
        };
        self.inner.store.record_refresh(token, audit).await?;
        metrics::counter!("gateway_token_refreshes_total", "tenant_id" => tenant_cfg.tenant.name.clone(), "outcome" => "success").increment(1);
        Ok(())
    }

    async fn record_failure_audit(&self, tenant_id: TenantId, cause: &IdentityError) -> Result<()> {
        let audit = RefreshAudit {
            id: Uuid::new_v4(),
            tenant_id,
            at: time::OffsetDateTime::now_utc(),
            outcome: AuditOutcome::Failure,
            classification: Some(format!("{:?}", cause.as_failure())),
            instance_id: self.inner.config.instance_id.clone(),
        };
        self.inner.store.append_refresh_audit(audit).await?;
        Ok(())
    }

    async fn breaker_for(&self, tenant_id: TenantId) -> Arc<CircuitBreaker> {
        if let Some(b) = self.inner.breakers.read().await.get(&tenant_id) {
            return b.clone();
        }
        let mut breakers = self.inner.breakers.write().await;
        breakers
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.inner.config.breaker_config)))
            .clone()
    }

    async fn mutex_for(&self, tenant_id: TenantId) -> Arc<Mutex<()>> {
        if let Some(m) = self.inner.mutexes.read().await.get(&tenant_id) {
            return m.clone();
        }
        let mut mutexes = self.inner.mutexes.write().await;
        mutexes.entry(tenant_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RefreshedToken;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use store::InMemoryStore;

    struct FakeIdentity {
        calls: AtomicU32,
        responses: StdMutex<Vec<Result<RefreshedToken, IdentityError>>>,
    }

    #[async_trait]
    impl IdentityClient for FakeIdentity {
        async fn refresh(
            &self,
            _token_endpoint: &str,
            _client_id: &str,
            _client_secret: &str,
            _refresh_token: &str,
        ) -> Result<RefreshedToken, IdentityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(RefreshedToken {
                    access_token: "access-default".to_string(),
                    refresh_token: "refresh-default".to_string(),
                    expires_in: 3600,
                    scope: None,
                })
            } else {
                responses.remove(0)
            }
        }
    }

    fn region_endpoints() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("us-east".to_string(), "https://idp.example.com/token".to_string());
        m
    }

    async fn harness(
        responses: Vec<Result<RefreshedToken, IdentityError>>,
    ) -> (TokenManager, Arc<dyn Store>, TenantId, Arc<FakeIdentity>) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let crypto = Arc::new(crypto::EncryptionService::new([7u8; 32]));

        let mut regions = HashMap::new();
        regions.insert(
            "us-east".to_string(),
            url::Url::parse("https://acme.example.com").unwrap(),
        );
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
                tier: store::RateTier::Standard,
                metadata: HashMap::new(),
                client_id: "client-1".to_string(),
                client_secret: "secret-1".to_string(),
                refresh_token: "refresh-1".to_string(),
                scopes: vec!["itsm.incidents.READ".to_string()],
                instance_url: "https://acme.example.com/api".to_string(),
            })
            .await
            .unwrap();

        let identity = Arc::new(FakeIdentity { calls: AtomicU32::new(0), responses: StdMutex::new(responses) });
        let refresh_gate = Arc::new(RefreshCoordinator::new(ratelimit::RefreshWindowConfig::default(), None));

        let config = ManagerConfig {
            safety_margin: DEFAULT_SAFETY_MARGIN,
            retry_policy: retry::Policy {
                strategy: retry::Strategy::Constant,
                initial_delay: std::time::Duration::from_millis(1),
                max_delay: std::time::Duration::from_millis(5),
                factor: 1.0,
                max_attempts: 3,
                jitter: false,
            },
            breaker_config: breaker::Config::default(),
            region_endpoints: region_endpoints(),
            instance_id: "test-instance".to_string(),
        };

        let manager = TokenManager::new(
            store.clone(),
            crypto,
            registry,
            identity.clone(),
            refresh_gate,
            config,
        );

        (manager, store, tenant.id, identity)
    }

    #[tokio::test]
    async fn access_token_refreshes_when_nothing_cached() {
        let (manager, _store, tenant_id, identity) = harness(vec![]).await;
        let ctx = TenantContext::new(
            tenant_id,
            "Acme",
            "us-east",
            "https://acme.example.com/api",
            vec!["itsm.incidents.READ".to_string()],
            store::RateTier::Standard,
        );

        let token = manager.access_token(&ctx).await.unwrap();
        assert_eq!(token, "access-default");
        assert_eq!(identity.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn access_token_returns_cached_value_without_refreshing_again() {
        let (manager, _store, tenant_id, identity) = harness(vec![]).await;
        let ctx = TenantContext::new(
            tenant_id,
            "Acme",
            "us-east",
            "https://acme.example.com/api",
            vec!["itsm.incidents.READ".to_string()],
            store::RateTier::Standard,
        );

        manager.access_token(&ctx).await.unwrap();
        manager.access_token(&ctx).await.unwrap();
        assert_eq!(identity.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_single_flight_into_one_refresh() {
        let (manager, _store, tenant_id, identity) = harness(vec![]).await;
        let ctx = TenantContext::new(
            tenant_id,
            "Acme",
            "us-east",
            "https://acme.example.com/api",
            vec!["itsm.incidents.READ".to_string()],
            store::RateTier::Standard,
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move { manager.access_token(&ctx).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(identity.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn permanent_failure_suspends_tenant() {
        let (manager, store, tenant_id, _identity) = harness(vec![Err(IdentityError::ProviderCode(
            "invalid_grant".to_string(),
        ))])
        .await;
        let ctx = TenantContext::new(
            tenant_id,
            "Acme",
            "us-east",
            "https://acme.example.com/api",
            vec!["itsm.incidents.READ".to_string()],
            store::RateTier::Standard,
        );

        let err = manager.access_token(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::Permanent { .. }));

        let tenant = store.find_tenant_by_id(tenant_id).await.unwrap().unwrap();
        assert_eq!(tenant.status, TenantStatus::Suspended);
    }

    #[tokio::test]
    async fn rate_limited_refresh_does_not_call_identity_provider() {
        let (manager, _store, tenant_id, identity) = harness(vec![]).await;
        let ctx = TenantContext::new(
            tenant_id,
            "Acme",
            "us-east",
            "https://acme.example.com/api",
            vec!["itsm.incidents.READ".to_string()],
            store::RateTier::Standard,
        );

        manager.access_token(&ctx).await.unwrap();
        manager.inner.refresh_gate.record_attempt(tenant_id).await;
        manager
            .inner
            .store
            .upsert_stored_token(StoredToken {
                tenant_id,
                access_enc: "stale".to_string(),
                refresh_enc: "stale".to_string(),
                expires_at: time::OffsetDateTime::now_utc() - time::Duration::seconds(10),
                scopes: vec![],
                last_refreshed: time::OffsetDateTime::now_utc(),
                refresh_count: 0,
            })
            .await
            .unwrap();

        let calls_before = identity.calls.load(Ordering::SeqCst);
        let err = manager.access_token(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::RateLimited { .. }));
        assert_eq!(identity.calls.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn repeated_refresh_failures_trip_the_breaker_and_the_next_call_skips_upstream() {
        // harness() wires a retry policy with max_attempts: 3, so each
        // force_refresh call below consumes 3 failures before the breaker
        // records the single on_failure() for that call.
        let failure = || Err(IdentityError::Http { status: 500, body: "boom".to_string() });
        let responses = vec![failure(), failure(), failure(), failure(), failure(), failure()];
        let (manager, _store, tenant_id, identity) = harness(responses).await;
        manager.inner.breakers.write().await.entry(tenant_id).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(breaker::Config { failure_threshold: 2, ..Default::default() }))
        });
        let ctx = TenantContext::new(
            tenant_id,
            "Acme",
            "us-east",
            "https://acme.example.com/api",
            vec!["itsm.incidents.READ".to_string()],
            store::RateTier::Standard,
        );

        for _ in 0..2 {
            let err = manager.force_refresh(&ctx).await.unwrap_err();
            assert!(matches!(err, Error::Transient { .. }));
        }

        let calls_before = identity.calls.load(Ordering::SeqCst);
        let err = manager.force_refresh(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::CircuitOpen(_)));
        assert_eq!(identity.calls.load(Ordering::SeqCst), calls_before);
    }
}
