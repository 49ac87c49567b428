//! Tenant context (C8): an ambient, read-only record carried through every
//! async call that touches a store, an upstream, or the token manager.
//!
//! A [`TenantContext`] is built once per request (or once per background
//! sweep iteration) and passed explicitly as the first argument down the
//! call chain. It is cheap to clone: the scope list is shared via `Arc<[_]>`
//! and the cancellation handle is a `tokio_util` token, itself an `Arc`.

mod ambient;

use std::sync::Arc;

use store::{RateTier, TenantId};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

pub use ambient::{current, with_context};

/// Read-only per-request tenant context.
#[derive(Debug, Clone)]
pub struct TenantContext {
    tenant_id: TenantId,
    tenant_name: Arc<str>,
    region: Arc<str>,
    instance_url: Arc<str>,
    scopes: Arc<[String]>,
    tier: RateTier,
    budget_override: Option<ratelimit::TierBudget>,
    cancel: CancellationToken,
}

impl TenantContext {
    pub fn new(
        tenant_id: TenantId,
        tenant_name: impl Into<Arc<str>>,
        region: impl Into<Arc<str>>,
        instance_url: impl Into<Arc<str>>,
        scopes: impl Into<Arc<[String]>>,
        tier: RateTier,
    ) -> Self {
        Self {
            tenant_id,
            tenant_name: tenant_name.into(),
            region: region.into(),
            instance_url: instance_url.into(),
            scopes: scopes.into(),
            tier,
            budget_override: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Overrides the tier's default request budget with a deployment-configured
    /// one. Used when the gateway's `[rate_limit.tier_overrides]` config names
    /// this tenant's tier.
    pub fn with_budget_override(mut self, budget: ratelimit::TierBudget) -> Self {
        self.budget_override = Some(budget);
        self
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn tenant_name(&self) -> &str {
        &self.tenant_name
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn instance_url(&self) -> &str {
        &self.instance_url
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn tier(&self) -> RateTier {
        self.tier
    }

    /// The request-budget numbers this tenant is entitled to: a configured
    /// override if one was supplied at construction, otherwise derived from
    /// the tier so that a tier change takes effect on the next request
    /// without invalidating any cached context.
    pub fn budget(&self) -> ratelimit::TierBudget {
        self.budget_override.unwrap_or_else(|| ratelimit::tier_defaults(self.tier))
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        tenant::is_valid_scope(scope) && (self.scopes.iter().any(|s| s == scope) || self.scopes.iter().any(|s| s == tenant::WILDCARD_SCOPE))
    }

    /// Requests cancellation of all work sharing this context's token (a
    /// session close, a client disconnect).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Derives a child context whose cancellation token is linked to this
    /// one: cancelling the parent cancels the child, but not vice versa.
    /// Used to scope a single upstream call within a longer-lived session.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    /// Derives a context carrying the same tenant data but an independent
    /// cancellation token. Work started under a detached context (the token
    /// manager's refresh path, the rate-limit sweeper) outlives the request
    /// that triggered it: a client disconnecting must not abort a refresh
    /// that other callers are waiting on.
    pub fn detached(&self) -> Self {
        Self {
            cancel: CancellationToken::new(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ctx() -> TenantContext {
        TenantContext::new(
            Uuid::new_v4(),
            "acme",
            "us",
            "https://acme.example.com",
            vec!["itsm.incidents.READ".to_string()],
            RateTier::Standard,
        )
    }

    #[test]
    fn has_scope_matches_exact_and_wildcard() {
        let c = ctx();
        assert!(c.has_scope("itsm.incidents.READ"));
        assert!(!c.has_scope("itsm.incidents.DELETE"));

        let wildcard = TenantContext::new(
            c.tenant_id(),
            "acme",
            "us",
            "https://acme.example.com",
            vec!["*".to_string()],
            RateTier::Standard,
        );
        assert!(wildcard.has_scope("itsm.incidents.DELETE"));
    }

    #[test]
    fn child_cancellation_follows_parent_but_not_reverse() {
        let parent = ctx();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn detached_context_is_independent_of_parent_cancellation() {
        let parent = ctx();
        let detached = parent.detached();
        parent.cancel();
        assert!(parent.is_cancelled());
        assert!(!detached.is_cancelled());
    }

    #[tokio::test]
    async fn ambient_scope_exposes_current_context_for_logging() {
        let c = ctx();
        let tenant_id = c.tenant_id();
        with_context(c, async {
            let got = current().expect("context set within scope");
            assert_eq!(got.tenant_id(), tenant_id);
        })
        .await;
        assert!(current().is_none());
    }
}
