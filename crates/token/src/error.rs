//! Errors surfaced by [`crate::TokenManager`], matching the refresh-path
//! failure semantics.

use store::TenantId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The tenant has no refresh token on file; re-registration required.
    #[error("tenant {0} has no refresh token on file")]
    NoRefreshToken(TenantId),

    /// C4 denied the refresh; retry after the given duration.
    #[error("refresh rate-limited, retry after {retry_after:?}")]
    RateLimited { retry_after: std::time::Duration },

    /// C5's breaker is open for this tenant.
    #[error("circuit open for tenant {0}")]
    CircuitOpen(TenantId),

    /// The identity provider rejected the refresh token outright
    /// (`invalid_grant`, `token_revoked`); the tenant has been suspended.
    #[error("refresh permanently failed for tenant {0}: {cause}")]
    Permanent { tenant_id: TenantId, cause: String },

    /// Every retry attempt was exhausted on a transient failure.
    #[error("refresh failed for tenant {tenant_id} after retries: {cause}")]
    Transient { tenant_id: TenantId, cause: String },

    /// The calling context's cancellation token fired while waiting on a
    /// refresh this call did not itself initiate.
    #[error("refresh wait cancelled for tenant {0}")]
    Cancelled(TenantId),

    #[error(transparent)]
    Tenant(#[from] tenant::Error),

    #[error(transparent)]
    Store(#[from] store::Error),

    #[error(transparent)]
    Crypto(#[from] crypto::Error),

    #[error(transparent)]
    RateLimitCoordinator(#[from] ratelimit::Error),

    #[error("refresh task panicked for tenant {0}")]
    TaskPanicked(TenantId),
}

pub type Result<T> = std::result::Result<T, Error>;
