//! Token Manager (C7): the central component owning per-tenant refresh,
//! proactive renewal, and the failure semantics that feed tenant suspension.

mod error;
mod identity;
mod manager;

pub use error::{Error, Result};
pub use identity::{HttpIdentityClient, IdentityClient, IdentityError, RefreshedToken};
pub use manager::{ManagerConfig, TokenManager, DEFAULT_SAFETY_MARGIN};
