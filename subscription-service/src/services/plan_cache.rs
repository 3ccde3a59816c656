//! Cache-aside reads of plan configuration and user plan bindings.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use service_core::error::AppError;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::cache::{CacheKey, CacheStore};
use super::metrics::record_cache_error;
use super::repository::{BillingRepository, CatalogRepository};
use crate::models::{
    ActivePlan, Entitlement, EntitlementType, EntitlementValue, PlanEntitlementRow, PlanFeature,
    PlanWithEntitlements, Subscription,
};

#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
    pub plan: Duration,
    pub user_plan: Duration,
    /// TTL for "user has no active subscription".
    pub null: Duration,
    pub entitlement: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            plan: Duration::from_secs(1800),
            user_plan: Duration::from_secs(600),
            null: Duration::from_secs(60),
            entitlement: Duration::from_secs(3600),
        }
    }
}

#[derive(Clone)]
pub struct PlanConfigCache {
    catalog: Arc<dyn CatalogRepository>,
    billing: Arc<dyn BillingRepository>,
    cache: Arc<dyn CacheStore>,
    ttls: CacheTtls,
    fallback_plan: Option<String>,
}

impl PlanConfigCache {
    pub fn new(
        catalog: Arc<dyn CatalogRepository>,
        billing: Arc<dyn BillingRepository>,
        cache: Arc<dyn CacheStore>,
        ttls: CacheTtls,
        fallback_plan: Option<String>,
    ) -> Self {
        Self {
            catalog,
            billing,
            cache,
            ttls,
            fallback_plan,
        }
    }

    /// A plan with its typed entitlement values, or `None` if it does not
    /// exist. A stored value that does not fit its entitlement type is an
    /// error, not a silent skip.
    #[instrument(skip(self))]
    pub async fn get_plan_with_entitlements(
        &self,
        plan_id: Uuid,
    ) -> Result<Option<PlanWithEntitlements>, AppError> {
        let key = CacheKey::PlanEntitlements(plan_id);
        if let Some(hit) = self.read::<PlanWithEntitlements>(&key).await {
            return Ok(Some(hit));
        }

        let Some(plan) = self.catalog.get_plan(plan_id).await? else {
            return Ok(None);
        };
        let features = self
            .catalog
            .plan_entitlements(plan_id)
            .await?
            .into_iter()
            .map(resolve_feature)
            .collect::<Result<Vec<_>, _>>()?;

        let resolved = PlanWithEntitlements { plan, features };
        self.write(&key, &resolved, self.ttls.plan).await;
        Ok(Some(resolved))
    }

    /// The plan the user is entitled to right now: their active
    /// subscription's plan, else the fallback plan if one is configured.
    #[instrument(skip(self))]
    pub async fn get_user_active_plan(
        &self,
        user_id: Uuid,
    ) -> Result<Option<ActivePlan>, AppError> {
        let key = CacheKey::UserActivePlan(user_id);
        let binding = match self.read::<Option<Subscription>>(&key).await {
            Some(binding) => binding,
            None => {
                let active = self
                    .billing
                    .get_subscription_by_user(user_id)
                    .await?
                    .filter(Subscription::is_active);
                let ttl = if active.is_some() {
                    self.ttls.user_plan
                } else {
                    self.ttls.null
                };
                self.write(&key, &active, ttl).await;
                active
            }
        };

        if let Some(subscription) = binding {
            match self.get_plan_with_entitlements(subscription.plan_id).await? {
                Some(plan) => {
                    return Ok(Some(ActivePlan {
                        subscription: Some(subscription),
                        plan,
                    }));
                }
                None => warn!(
                    subscription_id = %subscription.subscription_id,
                    plan_id = %subscription.plan_id,
                    "Active subscription references a missing plan"
                ),
            }
        }

        self.fallback().await
    }

    async fn fallback(&self) -> Result<Option<ActivePlan>, AppError> {
        let Some(name) = self.fallback_plan.as_deref() else {
            return Ok(None);
        };
        let Some(plan) = self
            .catalog
            .find_plan_by_name(name)
            .await?
            .filter(|p| p.is_active)
        else {
            debug!(plan = name, "Fallback plan not found or inactive");
            return Ok(None);
        };

        Ok(self
            .get_plan_with_entitlements(plan.plan_id)
            .await?
            .map(|plan| ActivePlan {
                subscription: None,
                plan,
            }))
    }

    pub async fn get_entitlement(
        &self,
        entitlement_id: Uuid,
    ) -> Result<Option<Entitlement>, AppError> {
        let key = CacheKey::Entitlement(entitlement_id);
        if let Some(hit) = self.read::<Entitlement>(&key).await {
            return Ok(Some(hit));
        }

        let entitlement = self.catalog.get_entitlement(entitlement_id).await?;
        if let Some(entitlement) = &entitlement {
            self.write(&key, entitlement, self.ttls.entitlement).await;
        }
        Ok(entitlement)
    }

    pub async fn invalidate_plan(&self, plan_id: Uuid) {
        self.evict(CacheKey::PlanEntitlements(plan_id)).await;
    }

    pub async fn invalidate_user_plan(&self, user_id: Uuid) {
        self.evict(CacheKey::UserActivePlan(user_id)).await;
    }

    pub async fn invalidate_entitlement(&self, entitlement_id: Uuid) {
        self.evict(CacheKey::Entitlement(entitlement_id)).await;
    }

    async fn read<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let raw = match self.cache.get(key).await {
            Ok(raw) => raw?,
            Err(e) => {
                record_cache_error("get");
                warn!(key = %key, error = %e, "Cache read failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                record_cache_error("decode");
                warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    async fn write<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Duration) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode cache entry");
                return;
            }
        };
        if let Err(e) = self.cache.set(key, &raw, ttl).await {
            record_cache_error("set");
            warn!(key = %key, error = %e, "Cache write failed");
        }
    }

    async fn evict(&self, key: CacheKey) {
        if let Err(e) = self.cache.delete(&key).await {
            record_cache_error("delete");
            warn!(key = %key, error = %e, "Cache invalidation failed");
        }
    }
}

fn resolve_feature(row: PlanEntitlementRow) -> Result<PlanFeature, AppError> {
    let kind = EntitlementType::parse(&row.entitlement_type).ok_or_else(|| {
        AppError::InternalError(anyhow::anyhow!(
            "Entitlement '{}' has unknown type '{}'",
            row.feature_key,
            row.entitlement_type
        ))
    })?;
    let value = EntitlementValue::parse(kind, &row.value).map_err(|e| {
        AppError::InternalError(anyhow::anyhow!(
            "Plan {} has a corrupt value for '{}': {}",
            row.plan_id,
            row.feature_key,
            e
        ))
    })?;

    Ok(PlanFeature {
        entitlement_id: row.entitlement_id,
        feature_key: row.feature_key,
        name: row.name,
        value,
    })
}
