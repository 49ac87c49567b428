//! Rate-limit coordinator (C4): a hard minimum interval and rolling-window
//! cap on token refreshes, plus tiered per-tenant API request budgets.
//!
//! The two halves are independent: [`RefreshCoordinator`] gates calls into
//! the token manager's refresh path; [`RequestBudget`] gates calls into the
//! upstream HTTP client. Neither knows about the other.

mod budget;
mod error;
mod refresh;
mod tiers;

pub use budget::{ReserveDecision, RequestBudget};
pub use error::{Error, Result};
pub use refresh::{RefreshCoordinator, RefreshDecision, RefreshWindowConfig};
pub use tiers::{TierBudget, resolve_tier_budget, tier_defaults};
