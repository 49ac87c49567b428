//! In-memory [`Store`] implementation used by tests and by single-instance
//! deployments that do not need cross-process coordination.

use crate::error::{Error, Result};
use crate::traits::Store;
use crate::types::{
    NewTenant, OAuthConfig, RefreshAudit, RateTier, StoredToken, Tenant, TenantId, TenantStatus,
    TokenStatistics,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    tenants: HashMap<TenantId, Tenant>,
    oauth_configs: HashMap<TenantId, OAuthConfig>,
    stored_tokens: HashMap<TenantId, StoredToken>,
    refresh_audits: Vec<RefreshAudit>,
}

/// A process-local, lock-guarded store. Not shared across instances.
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self { inner: RwLock::new(Inner::default()) }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn register_tenant(&self, new: NewTenant) -> Result<Tenant> {
        let mut inner = self.inner.write().unwrap();

        let collides = inner.tenants.values().any(|t| t.name.eq_ignore_ascii_case(&new.name));
        if collides {
            return Err(Error::NameCollision(new.name));
        }

        let now = OffsetDateTime::now_utc();
        let tenant = Tenant {
            id: Uuid::new_v4(),
            name: new.name,
            region: new.region,
            status: TenantStatus::Active,
            tier: new.tier,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        };

        inner.oauth_configs.insert(
            tenant.id,
            OAuthConfig {
                tenant_id: tenant.id,
                client_id_enc: new.client_id_enc,
                client_secret_enc: new.client_secret_enc,
                refresh_token_enc: new.refresh_token_enc,
                scopes: new.scopes,
                instance_url: new.instance_url,
                scheme_version: new.scheme_version,
            },
        );
        inner.tenants.insert(tenant.id, tenant.clone());

        Ok(tenant)
    }

    async fn find_tenant_by_id(&self, id: TenantId) -> Result<Option<Tenant>> {
        Ok(self.inner.read().unwrap().tenants.get(&id).cloned())
    }

    async fn find_tenant_by_name(&self, name: &str) -> Result<Option<Tenant>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .tenants
            .values()
            .find(|t| t.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    async fn update_tenant_status(&self, id: TenantId, status: TenantStatus) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let tenant = inner.tenants.get_mut(&id).ok_or(Error::TenantNotFound(id))?;
        tenant.status = status;
        tenant.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn update_tenant_tier(&self, id: TenantId, tier: RateTier) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let tenant = inner.tenants.get_mut(&id).ok_or(Error::TenantNotFound(id))?;
        tenant.tier = tier;
        tenant.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn update_tenant_metadata(
        &self,
        id: TenantId,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let tenant = inner.tenants.get_mut(&id).ok_or(Error::TenantNotFound(id))?;
        tenant.metadata = metadata;
        tenant.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn list_active_tenants(&self) -> Result<Vec<Tenant>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .tenants
            .values()
            .filter(|t| t.status == TenantStatus::Active)
            .cloned()
            .collect())
    }

    async fn delete_tenant(&self, id: TenantId) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.tenants.remove(&id).is_none() {
            return Err(Error::TenantNotFound(id));
        }
        inner.oauth_configs.remove(&id);
        inner.stored_tokens.remove(&id);
        inner.refresh_audits.retain(|a| a.tenant_id != id);
        Ok(())
    }

    async fn find_oauth_config(&self, tenant_id: TenantId) -> Result<Option<OAuthConfig>> {
        Ok(self.inner.read().unwrap().oauth_configs.get(&tenant_id).cloned())
    }

    async fn upsert_oauth_config(&self, config: OAuthConfig) -> Result<()> {
        self.inner.write().unwrap().oauth_configs.insert(config.tenant_id, config);
        Ok(())
    }

    async fn find_stored_token(&self, tenant_id: TenantId) -> Result<Option<StoredToken>> {
        Ok(self.inner.read().unwrap().stored_tokens.get(&tenant_id).cloned())
    }

    async fn find_valid_stored_token(
        &self,
        tenant_id: TenantId,
        now: OffsetDateTime,
    ) -> Result<Option<StoredToken>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .stored_tokens
            .get(&tenant_id)
            .filter(|t| t.expires_at > now)
            .cloned())
    }

    async fn upsert_stored_token(&self, mut token: StoredToken) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if let Some(existing) = inner.stored_tokens.get(&token.tenant_id) {
            token.refresh_count = existing.refresh_count + 1;
        } else {
            token.refresh_count = token.refresh_count.max(1);
        }
        inner.stored_tokens.insert(token.tenant_id, token);
        Ok(())
    }

    async fn delete_expired_tokens(&self, older_than: OffsetDateTime) -> Result<u64> {
        let mut inner = self.inner.write().unwrap();
        let before = inner.stored_tokens.len();
        inner.stored_tokens.retain(|_, t| t.expires_at >= older_than);
        Ok((before - inner.stored_tokens.len()) as u64)
    }

    async fn token_statistics(&self, now: OffsetDateTime) -> Result<TokenStatistics> {
        let inner = self.inner.read().unwrap();
        let total_tokens = inner.stored_tokens.len() as u64;
        let valid_tokens = inner.stored_tokens.values().filter(|t| t.expires_at > now).count() as u64;
        Ok(TokenStatistics { total_tokens, valid_tokens, expired_tokens: total_tokens - valid_tokens })
    }

    async fn append_refresh_audit(&self, audit: RefreshAudit) -> Result<()> {
        self.inner.write().unwrap().refresh_audits.push(audit);
        Ok(())
    }

    async fn query_refresh_audits(
        &self,
        tenant_id: TenantId,
        since: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Result<Vec<RefreshAudit>> {
        let mut rows: Vec<RefreshAudit> = self
            .inner
            .read()
            .unwrap()
            .refresh_audits
            .iter()
            .filter(|a| a.tenant_id == tenant_id && a.at >= since && a.at <= now)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.at);
        Ok(rows)
    }
}
