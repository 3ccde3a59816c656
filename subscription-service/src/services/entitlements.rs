//! Entitlement decisions: resolve the user's plan, fetch the usage the
//! policy needs, evaluate, and optionally consume.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::try_join_all;
use service_core::error::AppError;
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::metrics::record_authorization;
use super::plan_cache::PlanConfigCache;
use super::usage::UsageTracker;
use crate::models::{ActivePlan, EntitlementType, EntitlementValue};
use crate::policies::{PolicyContext, PolicyResult, parse_window, policy_for};

pub const NO_ACTIVE_SUBSCRIPTION: &str = "No active subscription";

/// Call-site requirements that accompany a check.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallMetadata {
    pub required_level: Option<i64>,
}

type LockKey = (Uuid, String);

#[derive(Clone)]
pub struct EntitlementEngine {
    plans: PlanConfigCache,
    usage: UsageTracker,
    serialize_consumption: bool,
    locks: Arc<DashMap<LockKey, Arc<Mutex<()>>>>,
}

impl EntitlementEngine {
    pub fn new(plans: PlanConfigCache, usage: UsageTracker, serialize_consumption: bool) -> Self {
        Self {
            plans,
            usage,
            serialize_consumption,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn plans(&self) -> &PlanConfigCache {
        &self.plans
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    /// Decide without consuming.
    #[instrument(skip(self, metadata))]
    pub async fn authorize(
        &self,
        user_id: Uuid,
        feature_key: &str,
        metadata: CallMetadata,
    ) -> Result<PolicyResult, AppError> {
        let active = self.plans.get_user_active_plan(user_id).await?;
        let (result, _) = self
            .evaluate(user_id, active.as_ref(), feature_key, metadata)
            .await?;
        record_authorization(feature_key, result.allowed);
        Ok(result)
    }

    /// Decide and, when allowed, consume `amount`. Counters are incremented,
    /// frequency features get an event; boolean and level features consume
    /// nothing.
    #[instrument(skip(self))]
    pub async fn authorize_and_consume(
        &self,
        user_id: Uuid,
        feature_key: &str,
        amount: f64,
    ) -> Result<PolicyResult, AppError> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Consumption amount must be positive"
            )));
        }

        if !self.serialize_consumption {
            return self.consume(user_id, feature_key, amount).await;
        }

        let lock_key = (user_id, feature_key.to_string());
        let lock = self.locks.entry(lock_key.clone()).or_default().clone();
        let guard = lock.lock().await;
        let outcome = self.consume(user_id, feature_key, amount).await;
        drop(guard);
        drop(lock);
        self.locks
            .remove_if(&lock_key, |_, mutex| Arc::strong_count(mutex) == 1);
        outcome
    }

    /// Evaluate several keys against one plan lookup.
    #[instrument(skip(self, feature_keys))]
    pub async fn authorize_many(
        &self,
        user_id: Uuid,
        feature_keys: &[String],
    ) -> Result<HashMap<String, PolicyResult>, AppError> {
        let active = self.plans.get_user_active_plan(user_id).await?;
        let active = active.as_ref();

        let results = try_join_all(feature_keys.iter().map(|key| async move {
            let (result, _) = self
                .evaluate(user_id, active, key, CallMetadata::default())
                .await?;
            record_authorization(key, result.allowed);
            Ok::<_, AppError>((key.clone(), result))
        }))
        .await?;

        Ok(results.into_iter().collect())
    }

    async fn consume(
        &self,
        user_id: Uuid,
        feature_key: &str,
        amount: f64,
    ) -> Result<PolicyResult, AppError> {
        let active = self.plans.get_user_active_plan(user_id).await?;
        let (mut result, kind) = self
            .evaluate(user_id, active.as_ref(), feature_key, CallMetadata::default())
            .await?;
        record_authorization(feature_key, result.allowed);

        if !result.allowed {
            return Ok(result);
        }

        match kind {
            Some(EntitlementType::Counter) => {
                self.usage
                    .increment_usage(user_id, feature_key, amount)
                    .await?;
                result.record_consumption(amount);
            }
            Some(EntitlementType::Frequency) => {
                self.usage
                    .record_event(user_id, feature_key, amount)
                    .await?;
                result.record_consumption(amount);
            }
            Some(EntitlementType::Boolean) | Some(EntitlementType::Level) | None => {}
        }

        debug!(%user_id, feature_key, amount, "Entitlement consumed");
        Ok(result)
    }

    /// The decision plus the kind of the matched feature, if any.
    async fn evaluate(
        &self,
        user_id: Uuid,
        active: Option<&ActivePlan>,
        feature_key: &str,
        metadata: CallMetadata,
    ) -> Result<(PolicyResult, Option<EntitlementType>), AppError> {
        let Some(active) = active else {
            return Ok((PolicyResult::deny(NO_ACTIVE_SUBSCRIPTION), None));
        };
        let Some(feature) = active.plan.feature(feature_key) else {
            return Ok((
                PolicyResult::deny(format!("'{}' is not included in your plan", feature_key)),
                None,
            ));
        };

        let usage = match &feature.value {
            EntitlementValue::Counter(_) => self.usage.get_usage(user_id, feature_key).await?,
            EntitlementValue::Frequency(config) => {
                let window = chrono::Duration::from_std(parse_window(&config.window))
                    .unwrap_or_else(|_| chrono::Duration::hours(1));
                let window_start = self.usage.now() - window;
                self.usage
                    .get_usage_in_window(user_id, feature_key, window_start)
                    .await?
            }
            EntitlementValue::Boolean(_) | EntitlementValue::Level(_) => 0.0,
        };

        let kind = feature.kind();
        let ctx = PolicyContext {
            value: &feature.value,
            usage,
            required_level: metadata.required_level.unwrap_or(0),
        };
        let result = policy_for(kind).evaluate(&ctx)?;

        debug!(
            %user_id,
            feature_key,
            allowed = result.allowed,
            "Entitlement evaluated"
        );
        Ok((result, Some(kind)))
    }
}
