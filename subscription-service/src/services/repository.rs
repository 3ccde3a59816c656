//! Storage ports. `Database` (Postgres) and `MemoryStore` implement all three.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{
    ActivatePayment, ActivationOutcome, CreateCheckout, CreateEntitlement, CreatePlan,
    Entitlement, Payment, Plan, PlanEntitlementRow, Subscription, UpdateEntitlement, UpdatePlan,
    UsageRecord, UserAccount,
};

#[async_trait]
pub trait UsageRepository: Send + Sync {
    /// Current counter value; zero when no record exists or its reset time
    /// has passed. Never creates a record.
    async fn usage_value(
        &self,
        user_id: Uuid,
        feature_key: &str,
        now: DateTime<Utc>,
    ) -> Result<f64, AppError>;

    /// Atomically add `amount`, creating the record with `reset_at` when
    /// absent and re-arming it when lapsed. Returns the new value.
    async fn increment_usage(
        &self,
        user_id: Uuid,
        feature_key: &str,
        amount: f64,
        now: DateTime<Utc>,
        reset_at: DateTime<Utc>,
    ) -> Result<f64, AppError>;

    /// Atomically subtract `amount`. `None` when no record exists.
    async fn decrement_usage(
        &self,
        user_id: Uuid,
        feature_key: &str,
        amount: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<f64>, AppError>;

    async fn reset_usage(
        &self,
        user_id: Uuid,
        feature_key: &str,
        now: DateTime<Utc>,
        reset_at: DateTime<Utc>,
    ) -> Result<(), AppError>;

    /// Zero every counter of a user. Returns the number of records touched.
    async fn reset_all_usage(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        reset_at: DateTime<Utc>,
    ) -> Result<u64, AppError>;

    async fn list_usage(&self, user_id: Uuid) -> Result<Vec<UsageRecord>, AppError>;

    async fn record_event(
        &self,
        user_id: Uuid,
        feature_key: &str,
        amount: f64,
        at: DateTime<Utc>,
    ) -> Result<(), AppError>;

    /// Sum of event amounts at or after `since`.
    async fn sum_events_since(
        &self,
        user_id: Uuid,
        feature_key: &str,
        since: DateTime<Utc>,
    ) -> Result<f64, AppError>;

    async fn prune_events_before(&self, before: DateTime<Utc>) -> Result<u64, AppError>;
}

#[async_trait]
pub trait CatalogRepository: Send + Sync {
    /// Cheap round trip used by readiness checks.
    async fn ping(&self) -> Result<(), AppError>;

    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, AppError>;

    async fn find_plan_by_name(&self, name: &str) -> Result<Option<Plan>, AppError>;

    async fn list_active_plans(&self) -> Result<Vec<Plan>, AppError>;

    /// Entitlement values of a plan, ordered by position.
    async fn plan_entitlements(&self, plan_id: Uuid) -> Result<Vec<PlanEntitlementRow>, AppError>;

    async fn get_entitlement(&self, entitlement_id: Uuid)
    -> Result<Option<Entitlement>, AppError>;

    async fn create_plan(&self, input: &CreatePlan) -> Result<Plan, AppError>;

    async fn update_plan(
        &self,
        plan_id: Uuid,
        input: &UpdatePlan,
    ) -> Result<Option<Plan>, AppError>;

    async fn delete_plan(&self, plan_id: Uuid) -> Result<bool, AppError>;

    /// Whether any subscription or payment references the plan.
    async fn plan_in_use(&self, plan_id: Uuid) -> Result<bool, AppError>;

    async fn create_entitlement(&self, input: &CreateEntitlement)
    -> Result<Entitlement, AppError>;

    async fn update_entitlement(
        &self,
        entitlement_id: Uuid,
        input: &UpdateEntitlement,
    ) -> Result<Option<Entitlement>, AppError>;

    /// Delete an entitlement together with every plan value for it.
    async fn delete_entitlement(&self, entitlement_id: Uuid) -> Result<bool, AppError>;

    /// Insert or replace a plan's value for an entitlement. New links are
    /// appended after the plan's existing ones.
    async fn set_plan_entitlement(
        &self,
        plan_id: Uuid,
        entitlement_id: Uuid,
        value: &Value,
    ) -> Result<(), AppError>;

    async fn remove_plan_entitlement(
        &self,
        plan_id: Uuid,
        entitlement_id: Uuid,
    ) -> Result<bool, AppError>;

    async fn plans_with_entitlement(&self, entitlement_id: Uuid) -> Result<Vec<Uuid>, AppError>;
}

#[async_trait]
pub trait BillingRepository: Send + Sync {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserAccount>, AppError>;

    async fn set_premium(&self, user_id: Uuid, is_premium: bool) -> Result<(), AppError>;

    async fn get_subscription_by_user(
        &self,
        user_id: Uuid,
    ) -> Result<Option<Subscription>, AppError>;

    /// In one transaction: create a `pending` placeholder subscription when
    /// the user has none, then record a `pending` payment linked to it.
    async fn create_checkout(
        &self,
        input: &CreateCheckout,
        now: DateTime<Utc>,
    ) -> Result<Payment, AppError>;

    async fn get_payment(&self, reference: &str) -> Result<Option<Payment>, AppError>;

    /// Move a `pending` payment to `failed`. Returns false when the payment
    /// was not pending.
    async fn mark_payment_failed(
        &self,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// The activation transaction. Locks the payment, re-checks its status
    /// and, if it is not yet `success`, marks it so, activates the user's
    /// subscription on the purchased plan, sets the premium flag and resets
    /// the user's usage counters.
    async fn activate_payment(
        &self,
        input: &ActivatePayment,
    ) -> Result<ActivationOutcome, AppError>;

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, AppError>;

    async fn schedule_plan_change(
        &self,
        subscription_id: Uuid,
        pending_plan_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, AppError>;

    /// Active subscriptions whose period ended before `now`.
    async fn find_expired_subscriptions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, AppError>;

    /// Transition one lapsed subscription to `expired` in its own transaction.
    /// Returns false when it was renewed, already expired, or locked by
    /// another worker.
    async fn expire_subscription(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Switch a lapsed subscription to its scheduled plan and start a new
    /// period.
    async fn apply_scheduled_downgrade(
        &self,
        subscription_id: Uuid,
        plan_id: Uuid,
        current_period_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Fail `pending` payments created before `cutoff` and drop placeholder
    /// subscriptions left with no pending or successful payment. Returns the
    /// number of payments failed.
    async fn expire_abandoned_payments(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError>;
}

/// The storage handles the services share.
#[derive(Clone)]
pub struct Repositories {
    pub usage: Arc<dyn UsageRepository>,
    pub catalog: Arc<dyn CatalogRepository>,
    pub billing: Arc<dyn BillingRepository>,
}

impl Repositories {
    pub fn from_store<T>(store: Arc<T>) -> Self
    where
        T: UsageRepository + CatalogRepository + BillingRepository + 'static,
    {
        Self {
            usage: store.clone(),
            catalog: store.clone(),
            billing: store,
        }
    }
}
