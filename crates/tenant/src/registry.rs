//! Read-mostly facade over the [`store::Store`]: decrypts credentials on
//! demand and caches the assembled view with a configurable TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use store::{NewTenant, RateTier, Store, Tenant, TenantId, TenantStatus};
use tokio::sync::RwLock;
use url::Url;

use crate::error::{Error, Result};
use crate::scope::{WILDCARD_SCOPE, is_valid_scope};

const SCHEME_VERSION: u8 = 1;

/// An immutable, decrypted view of a tenant and its OAuth configuration.
/// Never logged and never handed to anything outside the process boundary.
#[derive(Clone)]
pub struct TenantWithConfig {
    pub tenant: Tenant,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub scopes: Vec<String>,
    pub instance_url: String,
}

impl TenantWithConfig {
    pub fn id(&self) -> TenantId {
        self.tenant.id
    }

    pub fn allows_scope(&self, required: &str) -> bool {
        self.scopes.iter().any(|s| s == WILDCARD_SCOPE || s == required)
    }
}

/// Fields accepted by [`Registry::register`]. Credentials arrive in plaintext
/// here and are encrypted once, immediately, before anything touches the store.
pub struct RegisterRequest {
    pub name: String,
    pub region: String,
    pub tier: RateTier,
    pub metadata: HashMap<String, String>,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub scopes: Vec<String>,
    pub instance_url: String,
}

struct CacheEntry {
    value: TenantWithConfig,
    inserted_at: Instant,
}

/// Tenant registry: the only component permitted to decrypt OAuth credentials.
pub struct Registry {
    store: Arc<dyn Store>,
    crypto: Arc<crypto::EncryptionService>,
    cache_ttl: Duration,
    cache: RwLock<HashMap<TenantId, CacheEntry>>,
    /// Region tag → token endpoint, used to validate an instance URL shares
    /// an origin with its region's endpoint at registration time.
    region_endpoints: HashMap<String, Url>,
}

impl Registry {
    pub fn new(
        store: Arc<dyn Store>,
        crypto: Arc<crypto::EncryptionService>,
        cache_ttl: Duration,
        region_endpoints: HashMap<String, Url>,
    ) -> Self {
        Self { store, crypto, cache_ttl, cache: RwLock::new(HashMap::new()), region_endpoints }
    }

    /// Registers a new tenant, encrypting its OAuth credentials and inserting
    /// tenant + oauth_config in one store transaction.
    pub async fn register(&self, request: RegisterRequest) -> Result<Tenant> {
        for scope in &request.scopes {
            if !is_valid_scope(scope) {
                return Err(Error::InvalidScopeFormat(scope.clone()));
            }
        }

        self.check_region_origin(&request.region, &request.instance_url)?;

        let client_id_enc = self.crypto.encrypt(&request.client_id, &request.name)?;
        let client_secret_enc = self.crypto.encrypt(&request.client_secret, &request.name)?;
        let refresh_token_enc = self.crypto.encrypt(&request.refresh_token, &request.name)?;

        let tenant = self
            .store
            .register_tenant(NewTenant {
                name: request.name,
                region: request.region,
                tier: request.tier,
                metadata: request.metadata,
                client_id_enc,
                client_secret_enc,
                refresh_token_enc,
                scopes: request.scopes,
                instance_url: request.instance_url,
                scheme_version: SCHEME_VERSION,
            })
            .await?;

        Ok(tenant)
    }

    /// Loads and decrypts a tenant's full configuration, consulting the cache first.
    pub async fn get_tenant(&self, id: TenantId) -> Result<TenantWithConfig> {
        if let Some(cached) = self.cache_lookup(id).await {
            return Ok(cached);
        }

        let tenant = self.store.find_tenant_by_id(id).await?.ok_or(Error::NotFound(id))?;
        let config = self.store.find_oauth_config(id).await?.ok_or(Error::NotFound(id))?;

        let assembled = TenantWithConfig {
            client_id: self
                .crypto
                .decrypt(&config.client_id_enc, &tenant.name)
                .map_err(|_| Error::DecryptError(id))?,
            client_secret: self
                .crypto
                .decrypt(&config.client_secret_enc, &tenant.name)
                .map_err(|_| Error::DecryptError(id))?,
            refresh_token: self
                .crypto
                .decrypt(&config.refresh_token_enc, &tenant.name)
                .map_err(|_| Error::DecryptError(id))?,
            scopes: config.scopes,
            instance_url: config.instance_url,
            tenant,
        };

        self.cache.write().await.insert(
            id,
            CacheEntry { value: assembled.clone(), inserted_at: Instant::now() },
        );

        Ok(assembled)
    }

    /// Case-insensitive lookup by tenant name, for the SSE handshake's
    /// first-time client-id binding.
    pub async fn find_by_name(&self, name: &str) -> Result<Option<Tenant>> {
        Ok(self.store.find_tenant_by_name(name).await?)
    }

    pub async fn update_status(&self, id: TenantId, status: TenantStatus) -> Result<()> {
        self.store.update_tenant_status(id, status).await?;
        self.cache.write().await.remove(&id);
        Ok(())
    }

    pub async fn update_tier(&self, id: TenantId, tier: RateTier) -> Result<()> {
        self.store.update_tenant_tier(id, tier).await?;
        self.cache.write().await.remove(&id);
        Ok(())
    }

    /// Returns `true` iff `required` is in the tenant's allowed scope set,
    /// or the admin wildcard scope is present.
    pub async fn validate_scope(&self, id: TenantId, required: &str) -> Result<bool> {
        let tenant = self.get_tenant(id).await?;
        Ok(tenant.allows_scope(required))
    }

    async fn cache_lookup(&self, id: TenantId) -> Option<TenantWithConfig> {
        let cache = self.cache.read().await;
        let entry = cache.get(&id)?;
        if entry.inserted_at.elapsed() < self.cache_ttl {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    fn check_region_origin(&self, region: &str, instance_url: &str) -> Result<()> {
        let endpoint = self
            .region_endpoints
            .get(region)
            .ok_or_else(|| Error::UnknownRegion(region.to_string()))?;

        let instance =
            Url::parse(instance_url).map_err(|_| Error::RegionMismatch {
                region: region.to_string(),
                instance_url: instance_url.to_string(),
            })?;

        let same_origin = instance.scheme() == endpoint.scheme()
            && instance.host_str() == endpoint.host_str()
            && instance.port_or_known_default() == endpoint.port_or_known_default();

        if same_origin {
            Ok(())
        } else {
            Err(Error::RegionMismatch {
                region: region.to_string(),
                instance_url: instance_url.to_string(),
            })
        }
    }
}
