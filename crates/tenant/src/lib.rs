//! Tenant registry: register/lookup tenants, decrypt credentials on demand,
//! and cache the assembled view in memory.

mod error;
mod registry;
mod scope;

pub use error::{Error, Result};
pub use registry::{RegisterRequest, Registry, TenantWithConfig};
pub use scope::{WILDCARD_SCOPE, is_valid_scope};
