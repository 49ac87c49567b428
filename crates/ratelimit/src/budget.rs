//! Per-tenant API request budget: two sliding counters (1-minute, 1-hour)
//! plus a token-bucket burst limiter (§4.4).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use store::TenantId;
use tokio::sync::{Mutex, RwLock};

use crate::tiers::TierBudget;

/// Outcome of a [`RequestBudget::reserve`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveDecision {
    Allow,
    Deny { retry_after: Duration },
}

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self { tokens: capacity as f64, capacity: capacity as f64, refill_per_sec, last_refill: Instant::now() }
    }

    fn try_take(&mut self) -> Result<(), Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            let wait = deficit / self.refill_per_sec.max(f64::MIN_POSITIVE);
            Err(Duration::from_secs_f64(wait))
        }
    }
}

struct TenantBudgetState {
    per_minute: VecDeque<Instant>,
    per_hour: VecDeque<Instant>,
    bucket: TokenBucket,
}

impl TenantBudgetState {
    fn new(budget: TierBudget) -> Self {
        Self {
            per_minute: VecDeque::new(),
            per_hour: VecDeque::new(),
            bucket: TokenBucket::new(budget.burst, budget.per_minute as f64 / 60.0),
        }
    }
}

/// Guards a tenant's per-minute, per-hour and burst request budgets.
pub struct RequestBudget {
    states: RwLock<HashMap<TenantId, Arc<Mutex<TenantBudgetState>>>>,
}

impl Default for RequestBudget {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestBudget {
    pub fn new() -> Self {
        Self { states: RwLock::new(HashMap::new()) }
    }

    /// Attempts to reserve one request against `tier`'s budget for `tenant_id`.
    pub async fn reserve(&self, tenant_id: TenantId, tier: TierBudget) -> ReserveDecision {
        let cell = self.state_for(tenant_id, tier).await;
        let mut state = cell.lock().await;

        prune(&mut state.per_minute, Duration::from_secs(60));
        prune(&mut state.per_hour, Duration::from_secs(3600));

        if state.per_minute.len() as u32 >= tier.per_minute {
            let retry_after = Duration::from_secs(60).saturating_sub(state.per_minute.front().unwrap().elapsed());
            return ReserveDecision::Deny { retry_after };
        }
        if state.per_hour.len() as u32 >= tier.per_hour {
            let retry_after = Duration::from_secs(3600).saturating_sub(state.per_hour.front().unwrap().elapsed());
            return ReserveDecision::Deny { retry_after };
        }
        if let Err(retry_after) = state.bucket.try_take() {
            return ReserveDecision::Deny { retry_after };
        }

        let now = Instant::now();
        state.per_minute.push_back(now);
        state.per_hour.push_back(now);
        ReserveDecision::Allow
    }

    async fn state_for(&self, tenant_id: TenantId, tier: TierBudget) -> Arc<Mutex<TenantBudgetState>> {
        if let Some(cell) = self.states.read().await.get(&tenant_id) {
            return cell.clone();
        }
        let mut states = self.states.write().await;
        states
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(Mutex::new(TenantBudgetState::new(tier))))
            .clone()
    }
}

fn prune(deque: &mut VecDeque<Instant>, window: Duration) {
    let cutoff = Instant::now().checked_sub(window);
    if let Some(cutoff) = cutoff {
        while matches!(deque.front(), Some(&t) if t < cutoff) {
            deque.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiers::tier_defaults;
    use store::RateTier;
    use uuid::Uuid;

    #[tokio::test]
    async fn allows_requests_under_the_burst_limit() {
        let budget = RequestBudget::new();
        let tier = tier_defaults(RateTier::Basic);
        let tenant = Uuid::new_v4();

        for _ in 0..tier.burst {
            assert_eq!(budget.reserve(tenant, tier).await, ReserveDecision::Allow);
        }
    }

    #[tokio::test]
    async fn denies_once_burst_exhausted() {
        let budget = RequestBudget::new();
        let tier = TierBudget { per_minute: 1000, per_hour: 100_000, burst: 3 };
        let tenant = Uuid::new_v4();

        for _ in 0..3 {
            assert_eq!(budget.reserve(tenant, tier).await, ReserveDecision::Allow);
        }
        assert!(matches!(budget.reserve(tenant, tier).await, ReserveDecision::Deny { .. }));
    }

    #[tokio::test]
    async fn denies_once_per_minute_cap_reached() {
        let budget = RequestBudget::new();
        let tier = TierBudget { per_minute: 2, per_hour: 100_000, burst: 100 };
        let tenant = Uuid::new_v4();

        assert_eq!(budget.reserve(tenant, tier).await, ReserveDecision::Allow);
        assert_eq!(budget.reserve(tenant, tier).await, ReserveDecision::Allow);
        assert!(matches!(budget.reserve(tenant, tier).await, ReserveDecision::Deny { .. }));
    }

    #[tokio::test]
    async fn tenants_have_independent_budgets() {
        let budget = RequestBudget::new();
        let tier = TierBudget { per_minute: 1, per_hour: 100_000, burst: 100 };
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert_eq!(budget.reserve(a, tier).await, ReserveDecision::Allow);
        assert!(matches!(budget.reserve(a, tier).await, ReserveDecision::Deny { .. }));
        assert_eq!(budget.reserve(b, tier).await, ReserveDecision::Allow);
    }
}
