//! Persisted record shapes for tenants, OAuth configuration, stored tokens
//! and the refresh audit trail.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;
use uuid::Uuid;

pub type TenantId = Uuid;

/// Lifecycle state of a tenant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Suspended,
    Inactive,
}

/// Selects the numeric rate-limit budgets applied to a tenant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateTier {
    Basic,
    Standard,
    Premium,
    Enterprise,
}

/// A registered principal that owns one upstream ITSM account and one OAuth identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub region: String,
    pub status: TenantStatus,
    pub tier: RateTier,
    pub metadata: HashMap<String, String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Encrypted OAuth client configuration, one per tenant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub tenant_id: TenantId,
    pub client_id_enc: String,
    pub client_secret_enc: String,
    pub refresh_token_enc: String,
    pub scopes: Vec<String>,
    pub instance_url: String,
    pub scheme_version: u8,
}

/// Cached access/refresh token pair for a tenant, at most one per tenant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredToken {
    pub tenant_id: TenantId,
    pub access_enc: String,
    pub refresh_enc: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub scopes: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_refreshed: OffsetDateTime,
    pub refresh_count: u64,
}

impl StoredToken {
    /// A token is usable only once the safety margin has not yet been crossed.
    pub fn is_valid(&self, now: OffsetDateTime, safety_margin: time::Duration) -> bool {
        now + safety_margin < self.expires_at
    }
}

/// Outcome of a single refresh attempt, as recorded in the audit trail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// Append-only record of a refresh attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefreshAudit {
    pub id: Uuid,
    pub tenant_id: TenantId,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub outcome: AuditOutcome,
    pub classification: Option<String>,
    pub instance_id: String,
}

/// Fields accepted when registering a new tenant.
pub struct NewTenant {
    pub name: String,
    pub region: String,
    pub tier: RateTier,
    pub metadata: HashMap<String, String>,
    pub client_id_enc: String,
    pub client_secret_enc: String,
    pub refresh_token_enc: String,
    pub scopes: Vec<String>,
    pub instance_url: String,
    pub scheme_version: u8,
}

/// Aggregate counters returned by [`crate::Store::token_statistics`].
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct TokenStatistics {
    pub total_tokens: u64,
    pub valid_tokens: u64,
    pub expired_tokens: u64,
}
