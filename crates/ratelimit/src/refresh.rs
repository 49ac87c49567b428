//! Per-tenant refresh gating: a hard minimum interval between refreshes plus
//! a rolling window cap, independently enforced (§4.4).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use store::{Store, TenantId};
use tokio::sync::{Mutex, RwLock};

use crate::error::Result;

/// Outcome of a refresh-gating check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshDecision {
    Allow,
    Deny { retry_after: Duration },
}

/// Tunables for the refresh coordinator. Defaults match the spec's empirical
/// values and should not be extrapolated beyond configuration overrides.
#[derive(Clone, Copy, Debug)]
pub struct RefreshWindowConfig {
    pub min_interval: Duration,
    pub window: Duration,
    pub window_cap: u32,
    /// When true, every check also consults the store's audit trail so that
    /// several process instances converge on one shared view of the window.
    pub multi_instance: bool,
}

impl Default for RefreshWindowConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(3 * 60),
            window: Duration::from_secs(10 * 60),
            window_cap: 10,
            multi_instance: false,
        }
    }
}

#[derive(Default)]
struct TenantWindow {
    /// Timestamps of refresh attempts within `window`, oldest first.
    attempts: VecDeque<Instant>,
    synced_from_store: bool,
}

/// Enforces the minimum-refresh-interval and windowed-cap rules per tenant.
pub struct RefreshCoordinator {
    config: RefreshWindowConfig,
    store: Option<Arc<dyn Store>>,
    windows: RwLock<HashMap<TenantId, Arc<Mutex<TenantWindow>>>>,
}

impl RefreshCoordinator {
    pub fn new(config: RefreshWindowConfig, store: Option<Arc<dyn Store>>) -> Self {
        Self { config, store, windows: RwLock::new(HashMap::new()) }
    }

    /// Checks whether a refresh is permitted right now, honouring the
    /// minimum interval. Does not record the attempt; call
    /// [`Self::record_attempt`] once the refresh actually proceeds.
    pub async fn can_refresh(&self, tenant_id: TenantId) -> Result<RefreshDecision> {
        self.check(tenant_id, true).await
    }

    /// As [`Self::can_refresh`], but bypasses the minimum-interval rule.
    /// Still honours the windowed cap, per the administrative-override spec.
    pub async fn can_force_refresh(&self, tenant_id: TenantId) -> Result<RefreshDecision> {
        self.check(tenant_id, false).await
    }

    /// Records a completed refresh attempt against the window.
    pub async fn record_attempt(&self, tenant_id: TenantId) {
        let cell = self.window_for(tenant_id).await;
        let mut window = cell.lock().await;
        window.attempts.push_back(Instant::now());
        self.prune(&mut window.attempts);
    }

    async fn check(&self, tenant_id: TenantId, enforce_min_interval: bool) -> Result<RefreshDecision> {
        let cell = self.window_for(tenant_id).await;
        let mut window = cell.lock().await;

        if self.config.multi_instance && !window.synced_from_store {
            self.sync_from_store(tenant_id, &mut window).await?;
        }

        self.prune(&mut window.attempts);

        if enforce_min_interval {
            if let Some(&last) = window.attempts.back() {
                let elapsed = last.elapsed();
                if elapsed < self.config.min_interval {
                    return Ok(RefreshDecision::Deny { retry_after: self.config.min_interval - elapsed });
                }
            }
        }

        if window.attempts.len() as u32 >= self.config.window_cap {
            let oldest = *window.attempts.front().expect("len >= cap > 0");
            let retry_after = self.config.window.saturating_sub(oldest.elapsed());
            return Ok(RefreshDecision::Deny { retry_after });
        }

        Ok(RefreshDecision::Allow)
    }

    /// Recovers window state from the audit trail on first touch of a tenant
    /// in this process (cold start), so a freshly started instance doesn't
    /// forget recent refreshes made by itself or a sibling instance.
    async fn sync_from_store(&self, tenant_id: TenantId, window: &mut TenantWindow) -> Result<()> {
        window.synced_from_store = true;
        let Some(store) = &self.store else { return Ok(()) };

        let now = time::OffsetDateTime::now_utc();
        let since = now - time::Duration::seconds(self.config.window.as_secs() as i64);
        let audits = store.query_refresh_audits(tenant_id, since, now).await?;

        let reference = Instant::now();
        for audit in audits {
            let age = now - audit.at;
            if age.is_negative() {
                continue;
            }
            let age = Duration::from_secs_f64(age.as_seconds_f64().max(0.0));
            if let Some(at) = reference.checked_sub(age) {
                window.attempts.push_back(at);
            }
        }
        let mut sorted: Vec<Instant> = window.attempts.drain(..).collect();
        sorted.sort();
        window.attempts = sorted.into();
        Ok(())
    }

    fn prune(&self, attempts: &mut VecDeque<Instant>) {
        let cutoff = Instant::now().checked_sub(self.config.window);
        if let Some(cutoff) = cutoff {
            while matches!(attempts.front(), Some(&t) if t < cutoff) {
                attempts.pop_front();
            }
        }
    }

    async fn window_for(&self, tenant_id: TenantId) -> Arc<Mutex<TenantWindow>> {
        if let Some(cell) = self.windows.read().await.get(&tenant_id) {
            return cell.clone();
        }
        let mut windows = self.windows.write().await;
        windows
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(Mutex::new(TenantWindow::default())))
            .clone()
    }
}
