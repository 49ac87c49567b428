//! Postgres-backed [`Store`] — the canonical multi-instance backend. A
//! single source of truth shared by every process, used whenever the
//! deployment runs more than one gateway instance (see the coordination
//! mode discussion in DESIGN.md).

use crate::error::{Error, Result};
use crate::traits::Store;
use crate::types::{
    NewTenant, OAuthConfig, RateTier, RefreshAudit, AuditOutcome, StoredToken, Tenant, TenantId,
    TenantStatus,
    TokenStatistics,
};
use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgPoolOptions};
use std::collections::HashMap;
use time::OffsetDateTime;
use uuid::Uuid;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(dsn: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(dsn)
            .await?;
        Ok(Self { pool })
    }

    /// Applies the schema from §6's semantic layout. Migrations themselves
    /// (the `.sql` files) live outside the core per the ambient-concerns split.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tenants (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                name_lower TEXT GENERATED ALWAYS AS (lower(name)) STORED,
                region TEXT NOT NULL,
                status TEXT NOT NULL,
                tier TEXT NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                UNIQUE (name_lower)
            );
            CREATE TABLE IF NOT EXISTS oauth_configs (
                tenant_id UUID PRIMARY KEY REFERENCES tenants(id) ON DELETE CASCADE,
                client_id_enc TEXT NOT NULL,
                client_secret_enc TEXT NOT NULL,
                refresh_token_enc TEXT NOT NULL,
                scopes TEXT[] NOT NULL,
                instance_url TEXT NOT NULL,
                scheme_version SMALLINT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS stored_tokens (
                tenant_id UUID PRIMARY KEY REFERENCES tenants(id) ON DELETE CASCADE,
                access_enc TEXT NOT NULL,
                refresh_enc TEXT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                scopes TEXT[] NOT NULL,
                last_refreshed TIMESTAMPTZ NOT NULL,
                refresh_count BIGINT NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS refresh_audits (
                id UUID PRIMARY KEY,
                tenant_id UUID NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                at TIMESTAMPTZ NOT NULL,
                outcome TEXT NOT NULL,
                classification TEXT,
                instance_id TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS refresh_audits_tenant_at ON refresh_audits (tenant_id, at);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_tenant(row: &sqlx::postgres::PgRow) -> Result<Tenant> {
        let status: String = row.try_get("status")?;
        let tier: String = row.try_get("tier")?;
        let metadata_json: serde_json::Value = row.try_get("metadata")?;
        Ok(Tenant {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            region: row.try_get("region")?,
            status: parse_status(&status)?,
            tier: parse_tier(&tier)?,
            metadata: serde_json::from_value(metadata_json).unwrap_or_default(),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn parse_status(s: &str) -> Result<TenantStatus> {
    match s {
        "active" => Ok(TenantStatus::Active),
        "suspended" => Ok(TenantStatus::Suspended),
        "inactive" => Ok(TenantStatus::Inactive),
        other => Err(Error::Database(format!("unknown tenant status {other:?} in row"))),
    }
}

fn status_str(s: TenantStatus) -> &'static str {
    match s {
        TenantStatus::Active => "active",
        TenantStatus::Suspended => "suspended",
        TenantStatus::Inactive => "inactive",
    }
}

fn parse_tier(s: &str) -> Result<RateTier> {
    match s {
        "basic" => Ok(RateTier::Basic),
        "standard" => Ok(RateTier::Standard),
        "premium" => Ok(RateTier::Premium),
        "enterprise" => Ok(RateTier::Enterprise),
        other => Err(Error::Database(format!("unknown rate tier {other:?} in row"))),
    }
}

fn tier_str(t: RateTier) -> &'static str {
    match t {
        RateTier::Basic => "basic",
        RateTier::Standard => "standard",
        RateTier::Premium => "premium",
        RateTier::Enterprise => "enterprise",
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn register_tenant(&self, new: NewTenant) -> Result<Tenant> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM tenants WHERE name_lower = lower($1)")
                .bind(&new.name)
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_some() {
            return Err(Error::NameCollision(new.name));
        }

        let id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        let metadata_json = serde_json::to_value(&new.metadata).unwrap_or(serde_json::json!({}));

        sqlx::query(
            "INSERT INTO tenants (id, name, region, status, tier, metadata, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(id)
        .bind(&new.name)
        .bind(&new.region)
        .bind(status_str(TenantStatus::Active))
        .bind(tier_str(new.tier))
        .bind(metadata_json)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO oauth_configs (tenant_id, client_id_enc, client_secret_enc, refresh_token_enc, scopes, instance_url, scheme_version)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(id)
        .bind(&new.client_id_enc)
        .bind(&new.client_secret_enc)
        .bind(&new.refresh_token_enc)
        .bind(&new.scopes)
        .bind(&new.instance_url)
        .bind(new.scheme_version as i16)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Tenant {
            id,
            name: new.name,
            region: new.region,
            status: TenantStatus::Active,
            tier: new.tier,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        })
    }

    async fn find_tenant_by_id(&self, id: TenantId) -> Result<Option<Tenant>> {
        let row = sqlx::query("SELECT * FROM tenants WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_tenant).transpose()
    }

    async fn find_tenant_by_name(&self, name: &str) -> Result<Option<Tenant>> {
        let row = sqlx::query("SELECT * FROM tenants WHERE name_lower = lower($1)")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_tenant).transpose()
    }

    async fn update_tenant_status(&self, id: TenantId, status: TenantStatus) -> Result<()> {
        let result = sqlx::query("UPDATE tenants SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(status_str(status))
            .bind(OffsetDateTime::now_utc())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::TenantNotFound(id));
        }
        Ok(())
    }

    async fn update_tenant_tier(&self, id: TenantId, tier: RateTier) -> Result<()> {
        let result = sqlx::query("UPDATE tenants SET tier = $1, updated_at = $2 WHERE id = $3")
            .bind(tier_str(tier))
            .bind(OffsetDateTime::now_utc())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::TenantNotFound(id));
        }
        Ok(())
    }

    async fn update_tenant_metadata(
        &self,
        id: TenantId,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        let metadata_json = serde_json::to_value(&metadata).unwrap_or(serde_json::json!({}));
        let result = sqlx::query("UPDATE tenants SET metadata = $1, updated_at = $2 WHERE id = $3")
            .bind(metadata_json)
            .bind(OffsetDateTime::now_utc())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::TenantNotFound(id));
        }
        Ok(())
    }

    async fn list_active_tenants(&self) -> Result<Vec<Tenant>> {
        let rows = sqlx::query("SELECT * FROM tenants WHERE status = 'active'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_tenant).collect()
    }

    async fn delete_tenant(&self, id: TenantId) -> Result<()> {
        let result = sqlx::query("DELETE FROM tenants WHERE id = $1").bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(Error::TenantNotFound(id));
        }
        Ok(())
    }

    async fn find_oauth_config(&self, tenant_id: TenantId) -> Result<Option<OAuthConfig>> {
        let row = sqlx::query(
            "SELECT tenant_id, client_id_enc, client_secret_enc, refresh_token_enc, scopes, instance_url, scheme_version
             FROM oauth_configs WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let scheme_version: i16 = row.try_get("scheme_version")?;
                Ok(Some(OAuthConfig {
                    tenant_id: row.try_get("tenant_id")?,
                    client_id_enc: row.try_get("client_id_enc")?,
                    client_secret_enc: row.try_get("client_secret_enc")?,
                    refresh_token_enc: row.try_get("refresh_token_enc")?,
                    scopes: row.try_get("scopes")?,
                    instance_url: row.try_get("instance_url")?,
                    scheme_version: scheme_version as u8,
                }))
            }
        }
    }

    async fn upsert_oauth_config(&self, config: OAuthConfig) -> Result<()> {
        sqlx::query(
            "INSERT INTO oauth_configs (tenant_id, client_id_enc, client_secret_enc, refresh_token_enc, scopes, instance_url, scheme_version)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (tenant_id) DO UPDATE SET
                client_id_enc = EXCLUDED.client_id_enc,
                client_secret_enc = EXCLUDED.client_secret_enc,
                refresh_token_enc = EXCLUDED.refresh_token_enc,
                scopes = EXCLUDED.scopes,
                instance_url = EXCLUDED.instance_url,
                scheme_version = EXCLUDED.scheme_version",
        )
        .bind(config.tenant_id)
        .bind(config.client_id_enc)
        .bind(config.client_secret_enc)
        .bind(config.refresh_token_enc)
        .bind(config.scopes)
        .bind(config.instance_url)
        .bind(config.scheme_version as i16)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_stored_token(&self, tenant_id: TenantId) -> Result<Option<StoredToken>> {
        self.find_valid_stored_token_internal(tenant_id, None).await
    }

    async fn find_valid_stored_token(
        &self,
        tenant_id: TenantId,
        now: OffsetDateTime,
    ) -> Result<Option<StoredToken>> {
        self.find_valid_stored_token_internal(tenant_id, Some(now)).await
    }

    async fn upsert_stored_token(&self, token: StoredToken) -> Result<()> {
        sqlx::query(
            "INSERT INTO stored_tokens (tenant_id, access_enc, refresh_enc, expires_at, scopes, last_refreshed, refresh_count)
             VALUES ($1, $2, $3, $4, $5, $6, 1)
             ON CONFLICT (tenant_id) DO UPDATE SET
                access_enc = EXCLUDED.access_enc,
                refresh_enc = EXCLUDED.refresh_enc,
                expires_at = EXCLUDED.expires_at,
                scopes = EXCLUDED.scopes,
                last_refreshed = EXCLUDED.last_refreshed,
                refresh_count = stored_tokens.refresh_count + 1",
        )
        .bind(token.tenant_id)
        .bind(token.access_enc)
        .bind(token.refresh_enc)
        .bind(token.expires_at)
        .bind(token.scopes)
        .bind(token.last_refreshed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Overrides the default two-call sequence with a single transaction, so
    /// a crash or dropped connection between the two writes can never leave
    /// a refreshed token without its audit row (or vice versa).
    async fn record_refresh(&self, token: StoredToken, audit: RefreshAudit) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO stored_tokens (tenant_id, access_enc, refresh_enc, expires_at, scopes, last_refreshed, refresh_count)
             VALUES ($1, $2, $3, $4, $5, $6, 1)
             ON CONFLICT (tenant_id) DO UPDATE SET
                access_enc = EXCLUDED.access_enc,
                refresh_enc = EXCLUDED.refresh_enc,
                expires_at = EXCLUDED.expires_at,
                scopes = EXCLUDED.scopes,
                last_refreshed = EXCLUDED.last_refreshed,
                refresh_count = stored_tokens.refresh_count + 1",
        )
        .bind(token.tenant_id)
        .bind(token.access_enc)
        .bind(token.refresh_enc)
        .bind(token.expires_at)
        .bind(token.scopes)
        .bind(token.last_refreshed)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO refresh_audits (id, tenant_id, at, outcome, classification, instance_id)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(audit.id)
        .bind(audit.tenant_id)
        .bind(audit.at)
        .bind(outcome_str(audit.outcome))
        .bind(audit.classification)
        .bind(audit.instance_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_expired_tokens(&self, older_than: OffsetDateTime) -> Result<u64> {
        let result = sqlx::query("DELETE FROM stored_tokens WHERE expires_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn token_statistics(&self, now: OffsetDateTime) -> Result<TokenStatistics> {
        let row = sqlx::query(
            "SELECT count(*) AS total, count(*) FILTER (WHERE expires_at > $1) AS valid FROM stored_tokens",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.try_get("total")?;
        let valid: i64 = row.try_get("valid")?;
        Ok(TokenStatistics {
            total_tokens: total as u64,
            valid_tokens: valid as u64,
            expired_tokens: (total - valid) as u64,
        })
    }

    async fn append_refresh_audit(&self, audit: RefreshAudit) -> Result<()> {
        sqlx::query(
            "INSERT INTO refresh_audits (id, tenant_id, at, outcome, classification, instance_id)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(audit.id)
        .bind(audit.tenant_id)
        .bind(audit.at)
        .bind(outcome_str(audit.outcome))
        .bind(audit.classification)
        .bind(audit.instance_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query_refresh_audits(
        &self,
        tenant_id: TenantId,
        since: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Result<Vec<RefreshAudit>> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, at, outcome, classification, instance_id FROM refresh_audits
             WHERE tenant_id = $1 AND at >= $2 AND at <= $3 ORDER BY at ASC",
        )
        .bind(tenant_id)
        .bind(since)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let outcome: String = row.try_get("outcome")?;
                Ok(RefreshAudit {
                    id: row.try_get("id")?,
                    tenant_id: row.try_get("tenant_id")?,
                    at: row.try_get("at")?,
                    outcome: parse_outcome(&outcome)?,
                    classification: row.try_get("classification")?,
                    instance_id: row.try_get("instance_id")?,
                })
            })
            .collect()
    }
}

impl PostgresStore {
    async fn find_valid_stored_token_internal(
        &self,
        tenant_id: TenantId,
        valid_as_of: Option<OffsetDateTime>,
    ) -> Result<Option<StoredToken>> {
        let row = sqlx::query(
            "SELECT tenant_id, access_enc, refresh_enc, expires_at, scopes, last_refreshed, refresh_count
             FROM stored_tokens WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let expires_at: OffsetDateTime = row.try_get("expires_at")?;
        if let Some(now) = valid_as_of {
            if expires_at <= now {
                return Ok(None);
            }
        }
        let refresh_count: i64 = row.try_get("refresh_count")?;
        Ok(Some(StoredToken {
            tenant_id: row.try_get("tenant_id")?,
            access_enc: row.try_get("access_enc")?,
            refresh_enc: row.try_get("refresh_enc")?,
            expires_at,
            scopes: row.try_get("scopes")?,
            last_refreshed: row.try_get("last_refreshed")?,
            refresh_count: refresh_count as u64,
        }))
    }
}

fn outcome_str(o: AuditOutcome) -> &'static str {
    match o {
        AuditOutcome::Success => "success",
        AuditOutcome::Failure => "failure",
    }
}

fn parse_outcome(s: &str) -> Result<AuditOutcome> {
    match s {
        "success" => Ok(AuditOutcome::Success),
        "failure" => Ok(AuditOutcome::Failure),
        other => Err(Error::Database(format!("unknown audit outcome {other:?} in row"))),
    }
}
