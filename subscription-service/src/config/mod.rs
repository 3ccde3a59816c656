use std::time::Duration;

use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use service_core::config::{ServerConfig, load_layered};
use service_core::error::AppError;

use crate::services::plan_cache::CacheTtls;

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_true")]
    pub log_json: bool,
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub entitlements: EntitlementsConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "empty_secret")]
    pub database_url: Secret<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            database_url: empty_secret(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,
    #[serde(default = "empty_secret")]
    pub redis_url: Secret<String>,
    #[serde(default = "default_plan_ttl")]
    pub plan_ttl_secs: u64,
    #[serde(default = "default_user_plan_ttl")]
    pub user_plan_ttl_secs: u64,
    #[serde(default = "default_null_ttl")]
    pub null_ttl_secs: u64,
    #[serde(default = "default_entitlement_ttl")]
    pub entitlement_ttl_secs: u64,
}

impl CacheConfig {
    pub fn ttls(&self) -> CacheTtls {
        CacheTtls {
            plan: Duration::from_secs(self.plan_ttl_secs),
            user_plan: Duration::from_secs(self.user_plan_ttl_secs),
            null: Duration::from_secs(self.null_ttl_secs),
            entitlement: Duration::from_secs(self.entitlement_ttl_secs),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            redis_url: empty_secret(),
            plan_ttl_secs: default_plan_ttl(),
            user_plan_ttl_secs: default_user_plan_ttl(),
            null_ttl_secs: default_null_ttl(),
            entitlement_ttl_secs: default_entitlement_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_url")]
    pub base_url: String,
    #[serde(default = "empty_secret")]
    pub secret_key: Secret<String>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_gateway_timeout")]
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_url(),
            secret_key: empty_secret(),
            currency: default_currency(),
            timeout_secs: default_gateway_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Shared secret for provider signatures. Paystack signs with the
    /// account's secret key, so this usually equals `gateway.secret_key`.
    #[serde(default = "empty_secret")]
    pub secret: Secret<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: empty_secret(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_activation_timeout")]
    pub activation_timeout_secs: u64,
    #[serde(default = "default_abandoned_hours")]
    pub abandoned_payment_hours: i64,
    #[serde(default = "default_event_retention")]
    pub event_retention_days: i64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            activation_timeout_secs: default_activation_timeout(),
            abandoned_payment_hours: default_abandoned_hours(),
            event_retention_days: default_event_retention(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_expiration_interval")]
    pub expiration_interval_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            expiration_interval_secs: default_expiration_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
            lock_ttl_secs: default_lock_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntitlementsConfig {
    /// Plan served to users without an active subscription, by name.
    #[serde(default)]
    pub fallback_plan: Option<String>,
    #[serde(default = "default_true")]
    pub serialize_consumption: bool,
    #[serde(default = "default_bypass_roles")]
    pub bypass_roles: Vec<String>,
}

impl Default for EntitlementsConfig {
    fn default() -> Self {
        Self {
            fallback_plan: None,
            serialize_consumption: true,
            bypass_roles: default_bypass_roles(),
        }
    }
}

fn default_service_name() -> String {
    "subscription-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn empty_secret() -> Secret<String> {
    Secret::new(String::new())
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_plan_ttl() -> u64 {
    1800
}

fn default_user_plan_ttl() -> u64 {
    600
}

fn default_null_ttl() -> u64 {
    60
}

fn default_entitlement_ttl() -> u64 {
    3600
}

fn default_gateway_url() -> String {
    "https://api.paystack.co".to_string()
}

fn default_currency() -> String {
    "NGN".to_string()
}

fn default_gateway_timeout() -> u64 {
    15
}

fn default_activation_timeout() -> u64 {
    20
}

fn default_abandoned_hours() -> i64 {
    24
}

fn default_event_retention() -> i64 {
    7
}

fn default_expiration_interval() -> u64 {
    3600
}

fn default_cleanup_interval() -> u64 {
    21_600
}

fn default_lock_ttl() -> u64 {
    300
}

fn default_bypass_roles() -> Vec<String> {
    vec!["admin".to_string()]
}

impl SubscriptionConfig {
    /// Load from `subscription.{toml,yaml,json}` and `SUBSCRIPTION__*`
    /// environment variables.
    pub fn load() -> Result<Self, AppError> {
        let config: Self = load_layered(
            "subscription",
            "SUBSCRIPTION",
            &["entitlements.bypass_roles"],
        )?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.storage.backend == StorageBackend::Postgres
            && self.storage.database_url.expose_secret().is_empty()
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "storage.database_url is required for the postgres backend"
            )));
        }
        if self.cache.backend == CacheBackend::Redis
            && self.cache.redis_url.expose_secret().is_empty()
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "cache.redis_url is required for the redis backend"
            )));
        }
        if self.storage.min_connections > self.storage.max_connections {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "storage.min_connections exceeds storage.max_connections"
            )));
        }
        Ok(())
    }

    pub fn activation_timeout(&self) -> Duration {
        Duration::from_secs(self.lifecycle.activation_timeout_secs)
    }
}
