//! Backend-agnostic persistence contract.
//!
//! All writes that span tables (tenant + oauth_config registration; token
//! upsert + audit row) must execute in one transaction in any implementation.

use crate::error::Result;
use crate::types::{
    NewTenant, OAuthConfig, RefreshAudit, StoredToken, Tenant, TenantId, TenantStatus,
    TokenStatistics,
};
use async_trait::async_trait;
use std::collections::HashMap;
use time::OffsetDateTime;

#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts a tenant and its OAuth config in one transaction.
    async fn register_tenant(&self, new: NewTenant) -> Result<Tenant>;

    async fn find_tenant_by_id(&self, id: TenantId) -> Result<Option<Tenant>>;

    /// Case-insensitive lookup by tenant name.
    async fn find_tenant_by_name(&self, name: &str) -> Result<Option<Tenant>>;

    async fn update_tenant_status(&self, id: TenantId, status: TenantStatus) -> Result<()>;

    async fn update_tenant_tier(&self, id: TenantId, tier: crate::types::RateTier) -> Result<()>;

    async fn update_tenant_metadata(
        &self,
        id: TenantId,
        metadata: HashMap<String, String>,
    ) -> Result<()>;

    async fn list_active_tenants(&self) -> Result<Vec<Tenant>>;

    /// Cascades to the tenant's oauth_config, stored_token and refresh_audits.
    async fn delete_tenant(&self, id: TenantId) -> Result<()>;

    async fn find_oauth_config(&self, tenant_id: TenantId) -> Result<Option<OAuthConfig>>;

    async fn upsert_oauth_config(&self, config: OAuthConfig) -> Result<()>;

    async fn find_stored_token(&self, tenant_id: TenantId) -> Result<Option<StoredToken>>;

    /// Returns the token only if it satisfies `expires_at > now` server-side.
    async fn find_valid_stored_token(
        &self,
        tenant_id: TenantId,
        now: OffsetDateTime,
    ) -> Result<Option<StoredToken>>;

    /// Atomically replaces the tenant's stored token, incrementing `refresh_count`.
    async fn upsert_stored_token(&self, token: StoredToken) -> Result<()>;

    async fn delete_expired_tokens(&self, older_than: OffsetDateTime) -> Result<u64>;

    async fn token_statistics(&self, now: OffsetDateTime) -> Result<TokenStatistics>;

    async fn append_refresh_audit(&self, audit: RefreshAudit) -> Result<()>;

    /// Audit rows for `tenant_id` with `at` in `[since, now]`, oldest first.
    async fn query_refresh_audits(
        &self,
        tenant_id: TenantId,
        since: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Result<Vec<RefreshAudit>>;

    /// Replaces the tenant's stored token and appends an audit row atomically.
    async fn record_refresh(&self, token: StoredToken, audit: RefreshAudit) -> Result<()> {
        self.upsert_stored_token(token).await?;
        self.append_refresh_audit(audit).await
    }
}
