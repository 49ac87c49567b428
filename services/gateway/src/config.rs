//! Configuration types and loading.
//!
//! A TOML file deserialized with `serde` + `toml` and validated eagerly at
//! startup: a misconfigured deployment should fail before it binds a
//! listener, not at the first request that needs the missing setting.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use serde::Deserialize;
use store::RateTier;

use common::Secret;

/// Root configuration, loaded from a single TOML file.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub encryption: EncryptionConfig,
    pub regions: HashMap<String, String>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub token_manager: TokenManagerConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_session_idle_timeout_ms")]
    pub session_idle_timeout_ms: u64,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    #[serde(default = "default_session_requests_per_minute")]
    pub session_requests_per_minute: u32,
}

fn default_session_idle_timeout_ms() -> u64 {
    10 * 60 * 1000
}
fn default_drain_timeout_secs() -> u64 {
    5
}
fn default_session_requests_per_minute() -> u32 {
    60
}

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    /// `memory` for the in-process backend (single instance only, used in
    /// development and tests) or a `postgres://...` DSN.
    pub dsn: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_pool_size() -> u32 {
    10
}
fn default_connect_timeout_secs() -> u64 {
    5
}

/// Source of the 32-byte envelope-encryption key. Never accepted inline in
/// the TOML file: either an env var holding base64, or a file path.
#[derive(Debug, Deserialize)]
pub struct EncryptionConfig {
    pub key_env_var: Option<String>,
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_refresh_min_interval_secs")]
    pub refresh_min_interval_secs: u64,
    #[serde(default = "default_refresh_window_secs")]
    pub refresh_window_secs: u64,
    #[serde(default = "default_refresh_window_cap")]
    pub refresh_window_cap: u32,
    #[serde(default)]
    pub multi_instance: bool,
    /// Overrides of the illustrative per-tier request budgets.
    /// Tiers not listed here keep the built-in defaults.
    #[serde(default)]
    pub tier_overrides: HashMap<String, TierOverride>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            refresh_min_interval_secs: default_refresh_min_interval_secs(),
            refresh_window_secs: default_refresh_window_secs(),
            refresh_window_cap: default_refresh_window_cap(),
            multi_instance: false,
            tier_overrides: HashMap::new(),
        }
    }
}

fn default_refresh_min_interval_secs() -> u64 {
    3 * 60
}
fn default_refresh_window_secs() -> u64 {
    10 * 60
}
fn default_refresh_window_cap() -> u32 {
    10
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TierOverride {
    pub per_minute: u32,
    pub per_hour: u32,
    pub burst: u32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    pub volume_threshold: Option<u32>,
    pub error_threshold_percentage: Option<f64>,
    #[serde(default = "default_volume_window_secs")]
    pub volume_window_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_secs: default_reset_timeout_secs(),
            half_open_max_calls: default_half_open_max_calls(),
            success_threshold: default_success_threshold(),
            volume_threshold: None,
            error_threshold_percentage: None,
            volume_window_secs: default_volume_window_secs(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_reset_timeout_secs() -> u64 {
    30
}
fn default_half_open_max_calls() -> u32 {
    1
}
fn default_success_threshold() -> u32 {
    2
}
fn default_volume_window_secs() -> u64 {
    60
}

impl CircuitBreakerConfig {
    pub fn to_breaker_config(self) -> breaker::Config {
        breaker::Config {
            failure_threshold: self.failure_threshold,
            reset_timeout: Duration::from_secs(self.reset_timeout_secs),
            half_open_max_calls: self.half_open_max_calls,
            success_threshold: self.success_threshold,
            volume_threshold: self.volume_threshold,
            error_threshold_percentage: self.error_threshold_percentage,
            volume_window: Duration::from_secs(self.volume_window_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_strategy")]
    pub strategy: RetryStrategy,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            factor: default_factor(),
            max_attempts: default_max_attempts(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    Exponential,
    Linear,
    Constant,
}

fn default_strategy() -> RetryStrategy {
    RetryStrategy::Exponential
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_factor() -> f64 {
    2.0
}
fn default_max_attempts() -> u32 {
    3
}
fn default_jitter() -> bool {
    true
}

impl RetryConfig {
    pub fn to_policy(self) -> retry::Policy {
        retry::Policy {
            strategy: match self.strategy {
                RetryStrategy::Exponential => retry::Strategy::Exponential,
                RetryStrategy::Linear => retry::Strategy::Linear,
                RetryStrategy::Constant => retry::Strategy::Constant,
            },
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            factor: self.factor,
            max_attempts: self.max_attempts,
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TokenManagerConfig {
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_refresh_margin_secs")]
    pub refresh_margin_secs: i64,
    #[serde(default = "default_safety_margin_secs")]
    pub safety_margin_secs: i64,
    #[serde(default = "default_tenant_cache_ttl_secs")]
    pub tenant_cache_ttl_secs: u64,
}

impl Default for TokenManagerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            refresh_margin_secs: default_refresh_margin_secs(),
            safety_margin_secs: default_safety_margin_secs(),
            tenant_cache_ttl_secs: default_tenant_cache_ttl_secs(),
        }
    }
}

fn default_check_interval_secs() -> u64 {
    60
}
fn default_refresh_margin_secs() -> i64 {
    5 * 60
}
fn default_safety_margin_secs() -> i64 {
    60
}
fn default_tenant_cache_ttl_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    /// Accepted `X-API-Key` values. Loaded from TOML for local development;
    /// production deployments should source these from a secret store and
    /// set the field via an env-var override before `Config::load` returns.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Optional client-IP allow-list; empty means unrestricted.
    #[serde(default)]
    pub ip_allow_list: Vec<String>,
}

impl Config {
    /// Loads and validates configuration from `path`. Fails fast: a missing
    /// region, an unreadable key source, or an empty API-key list are all
    /// rejected here rather than surfacing as a confusing runtime error on
    /// the first request.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config file {}: {e}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing config file {}: {e}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.regions.is_empty() {
            anyhow::bail!("config: [regions] must name at least one region");
        }
        for (region, endpoint) in &self.regions {
            url::Url::parse(endpoint)
                .map_err(|e| anyhow::anyhow!("config: region {region:?} endpoint is not a URL: {e}"))?;
        }
        if self.auth.api_keys.is_empty() {
            anyhow::bail!("config: [auth] api_keys must not be empty");
        }
        if self.encryption.key_env_var.is_none() && self.encryption.key_file.is_none() {
            anyhow::bail!("config: [encryption] must set key_env_var or key_file");
        }
        for name in self.rate_limit.tier_overrides.keys() {
            if parse_tier(name).is_none() {
                anyhow::bail!(
                    "config: [rate_limit.tier_overrides] names unknown tier {name:?} (expected basic, standard, premium or enterprise)"
                );
            }
        }
        Ok(())
    }

    /// Resolves the encryption key material, preferring the env var source.
    /// The returned bytes are wrapped in a [`Secret`] immediately and never
    /// logged.
    pub fn resolve_encryption_key(&self) -> anyhow::Result<Secret<[u8; 32]>> {
        let encoded = if let Some(var) = &self.encryption.key_env_var {
            std::env::var(var)
                .map_err(|_| anyhow::anyhow!("encryption key env var {var:?} is not set"))?
        } else if let Some(path) = &self.encryption.key_file {
            std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("reading encryption key file {}: {e}", path.display()))?
                .trim()
                .to_string()
        } else {
            unreachable!("validated at load time")
        };

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| anyhow::anyhow!("encryption key is not valid base64: {e}"))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| anyhow::anyhow!("encryption key must be 32 bytes, got {}", v.len()))?;
        Ok(Secret::new(key))
    }

    pub fn region_endpoints(&self) -> anyhow::Result<HashMap<String, url::Url>> {
        self.regions
            .iter()
            .map(|(region, endpoint)| Ok((region.clone(), url::Url::parse(endpoint)?)))
            .collect()
    }

    /// Region tag → token endpoint as plain strings, the shape the token
    /// manager's `ManagerConfig` expects.
    pub fn region_token_endpoints(&self) -> HashMap<String, String> {
        self.regions.clone()
    }

    /// Deployment-configured overrides of the illustrative per-tier request
    /// budgets (§4.4), keyed by tier. Tier names not present in
    /// `[rate_limit.tier_overrides]` simply have no entry here, and
    /// `ratelimit::resolve_tier_budget` falls back to the built-in default.
    /// Unrecognized tier names are rejected at `validate()` time.
    pub fn tier_budget_overrides(&self) -> HashMap<RateTier, ratelimit::TierBudget> {
        self.rate_limit
            .tier_overrides
            .iter()
            .filter_map(|(name, ov)| {
                parse_tier(name).map(|tier| {
                    (tier, ratelimit::TierBudget { per_minute: ov.per_minute, per_hour: ov.per_hour, burst: ov.burst })
                })
            })
            .collect()
    }
}

fn parse_tier(name: &str) -> Option<RateTier> {
    match name.to_ascii_lowercase().as_str() {
        "basic" => Some(RateTier::Basic),
        "standard" => Some(RateTier::Standard),
        "premium" => Some(RateTier::Premium),
        "enterprise" => Some(RateTier::Enterprise),
        _ => None,
    }
}
