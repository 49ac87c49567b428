//! Tiered numeric request-budget defaults (§4.4).

use std::collections::HashMap;

use store::RateTier;

/// Per-minute, per-hour and burst budgets for a rate tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TierBudget {
    pub per_minute: u32,
    pub per_hour: u32,
    pub burst: u32,
}

/// Illustrative defaults from the spec; overridable by deployment config.
pub fn tier_defaults(tier: RateTier) -> TierBudget {
    match tier {
        RateTier::Basic => TierBudget { per_minute: 60, per_hour: 1_000, burst: 10 },
        RateTier::Standard => TierBudget { per_minute: 120, per_hour: 3_000, burst: 20 },
        RateTier::Premium => TierBudget { per_minute: 300, per_hour: 10_000, burst: 50 },
        RateTier::Enterprise => TierBudget { per_minute: 600, per_hour: 30_000, burst: 100 },
    }
}

/// Resolves a tenant's effective budget: a deployment-configured override if
/// one is set for this tier, otherwise the built-in default.
pub fn resolve_tier_budget(tier: RateTier, overrides: &HashMap<RateTier, TierBudget>) -> TierBudget {
    overrides.get(&tier).copied().unwrap_or_else(|| tier_defaults(tier))
}

#[cfg(test)]
mod override_tests {
    use super::*;

    #[test]
    fn override_takes_precedence_over_default() {
        let mut overrides = HashMap::new();
        overrides.insert(RateTier::Basic, TierBudget { per_minute: 5, per_hour: 50, burst: 1 });
        assert_eq!(resolve_tier_budget(RateTier::Basic, &overrides).per_minute, 5);
        assert_eq!(resolve_tier_budget(RateTier::Standard, &overrides), tier_defaults(RateTier::Standard));
    }
}
