//! Periodic jobs, each guarded by a lock in the shared cache so only one
//! instance runs a given job at a time.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use service_core::error::AppError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::cache::{CacheKey, CacheStore};
use super::lifecycle::SubscriptionLifecycle;
use crate::config::SchedulerConfig;

pub const EXPIRE_SUBSCRIPTIONS_JOB: &str = "expire-subscriptions";
pub const CLEANUP_PAYMENTS_JOB: &str = "cleanup-payments";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed { processed: u64 },
    /// Another holder had the lock, or the lock could not be taken.
    Skipped,
}

#[derive(Clone)]
pub struct JobRunner {
    lifecycle: SubscriptionLifecycle,
    cache: Arc<dyn CacheStore>,
    lock_ttl: Duration,
}

impl JobRunner {
    pub fn new(
        lifecycle: SubscriptionLifecycle,
        cache: Arc<dyn CacheStore>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            lifecycle,
            cache,
            lock_ttl,
        }
    }

    pub async fn run_expiration(&self) -> Result<JobOutcome, AppError> {
        self.run_locked(EXPIRE_SUBSCRIPTIONS_JOB, || {
            self.lifecycle.handle_expired_subscriptions()
        })
        .await
    }

    pub async fn run_cleanup(&self) -> Result<JobOutcome, AppError> {
        self.run_locked(CLEANUP_PAYMENTS_JOB, || {
            self.lifecycle.cleanup_abandoned_payments()
        })
        .await
    }

    async fn run_locked<F, Fut>(&self, job: &'static str, run: F) -> Result<JobOutcome, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u64, AppError>>,
    {
        let key = CacheKey::JobLock(job);
        let token = Uuid::new_v4().to_string();

        match self.cache.try_lock(&key, &token, self.lock_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                info!(job, "Job is running elsewhere, skipping");
                return Ok(JobOutcome::Skipped);
            }
            Err(e) => {
                warn!(job, error = %e, "Could not take job lock, skipping");
                return Ok(JobOutcome::Skipped);
            }
        }

        let result = run().await;

        if let Err(e) = self.cache.release_lock(&key, &token).await {
            warn!(job, error = %e, "Failed to release job lock; it will lapse with its TTL");
        }

        result.map(|processed| JobOutcome::Completed { processed })
    }

    /// Start the interval loops. Each loop runs once immediately, then every
    /// interval; ticks missed while a run is slow are dropped.
    pub fn spawn(self, config: &SchedulerConfig) -> Vec<JoinHandle<()>> {
        let expiration = {
            let runner = self.clone();
            let period = Duration::from_secs(config.expiration_interval_secs.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if let Err(e) = runner.run_expiration().await {
                        error!(job = EXPIRE_SUBSCRIPTIONS_JOB, error = %e, "Scheduled job failed");
                    }
                }
            })
        };

        let cleanup = {
            let runner = self;
            let period = Duration::from_secs(config.cleanup_interval_secs.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if let Err(e) = runner.run_cleanup().await {
                        error!(job = CLEANUP_PAYMENTS_JOB, error = %e, "Scheduled job failed");
                    }
                }
            })
        };

        info!(
            expiration_interval_secs = config.expiration_interval_secs,
            cleanup_interval_secs = config.cleanup_interval_secs,
            "Scheduler started"
        );
        vec![expiration, cleanup]
    }
}
