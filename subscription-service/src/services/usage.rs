//! Per-(user, feature) consumption counters and the frequency event log.

use std::sync::Arc;

use chrono::{DateTime, Months, Utc};
use service_core::error::AppError;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::clock::Clock;
use super::repository::UsageRepository;
use crate::models::UsageRecord;

#[derive(Clone)]
pub struct UsageTracker {
    repo: Arc<dyn UsageRepository>,
    clock: Arc<dyn Clock>,
}

impl UsageTracker {
    pub fn new(repo: Arc<dyn UsageRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Counters reset one calendar month after they are armed.
    pub fn next_reset(now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_months(Months::new(1)).unwrap_or(now)
    }

    pub async fn get_usage(&self, user_id: Uuid, feature_key: &str) -> Result<f64, AppError> {
        self.repo
            .usage_value(user_id, feature_key, self.clock.now())
            .await
    }

    #[instrument(skip(self))]
    pub async fn increment_usage(
        &self,
        user_id: Uuid,
        feature_key: &str,
        amount: f64,
    ) -> Result<f64, AppError> {
        let now = self.clock.now();
        let value = self
            .repo
            .increment_usage(user_id, feature_key, amount, now, Self::next_reset(now))
            .await?;
        debug!(value, "Usage incremented");
        Ok(value)
    }

    #[instrument(skip(self))]
    pub async fn decrement_usage(
        &self,
        user_id: Uuid,
        feature_key: &str,
        amount: f64,
    ) -> Result<f64, AppError> {
        self.repo
            .decrement_usage(user_id, feature_key, amount, self.clock.now())
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "No usage recorded for '{}'",
                    feature_key
                ))
            })
    }

    pub async fn reset_usage(&self, user_id: Uuid, feature_key: &str) -> Result<(), AppError> {
        let now = self.clock.now();
        self.repo
            .reset_usage(user_id, feature_key, now, Self::next_reset(now))
            .await
    }

    /// Start a fresh period for every counter the user has.
    #[instrument(skip(self))]
    pub async fn reset_all_usage(&self, user_id: Uuid) -> Result<u64, AppError> {
        let now = self.clock.now();
        let touched = self
            .repo
            .reset_all_usage(user_id, now, Self::next_reset(now))
            .await?;
        debug!(touched, "Usage counters reset");
        Ok(touched)
    }

    pub async fn list_usage(&self, user_id: Uuid) -> Result<Vec<UsageRecord>, AppError> {
        self.repo.list_usage(user_id).await
    }

    pub async fn record_event(
        &self,
        user_id: Uuid,
        feature_key: &str,
        amount: f64,
    ) -> Result<(), AppError> {
        self.repo
            .record_event(user_id, feature_key, amount, self.clock.now())
            .await
    }

    /// Sum of consumption at or after `window_start`.
    pub async fn get_usage_in_window(
        &self,
        user_id: Uuid,
        feature_key: &str,
        window_start: DateTime<Utc>,
    ) -> Result<f64, AppError> {
        self.repo
            .sum_events_since(user_id, feature_key, window_start)
            .await
    }

    pub async fn prune_events(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        self.repo.prune_events_before(before).await
    }
}
