//! In-process implementation of the storage ports.
//!
//! Every operation runs under one mutex, which gives the same atomicity the
//! Postgres upserts and row locks give: increments never lose updates and a
//! payment reference is activated at most once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use service_core::error::AppError;
use uuid::Uuid;

use super::repository::{BillingRepository, CatalogRepository, UsageRepository};
use crate::models::{
    ActivatePayment, ActivationOutcome, CreateCheckout, CreateEntitlement, CreatePlan,
    Entitlement, Payment, PaymentStatus, Plan, PlanEntitlementRow, Subscription,
    SubscriptionStatus, UpdateEntitlement, UpdatePlan, UsageEvent, UsageRecord, UserAccount,
};

#[derive(Debug, Clone)]
struct PlanLink {
    plan_id: Uuid,
    entitlement_id: Uuid,
    value: Value,
    position: i32,
}

#[derive(Default)]
struct State {
    users: HashMap<Uuid, UserAccount>,
    plans: HashMap<Uuid, Plan>,
    entitlements: HashMap<Uuid, Entitlement>,
    links: Vec<PlanLink>,
    subscriptions: HashMap<Uuid, Subscription>,
    payments: HashMap<String, Payment>,
    usage: HashMap<(Uuid, String), UsageRecord>,
    events: Vec<UsageEvent>,
}

impl State {
    fn subscription_by_id(&mut self, subscription_id: Uuid) -> Option<&mut Subscription> {
        self.subscriptions
            .values_mut()
            .find(|s| s.subscription_id == subscription_id)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    activations: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed a user account. Accounts are owned by the identity service, so
    /// there is no port operation for this.
    pub fn insert_user(&self, user: UserAccount) {
        self.state().users.insert(user.user_id, user);
    }

    /// Number of times the activation transaction actually activated a payment.
    pub fn activation_count(&self) -> u64 {
        self.activations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UsageRepository for MemoryStore {
    async fn usage_value(
        &self,
        user_id: Uuid,
        feature_key: &str,
        now: DateTime<Utc>,
    ) -> Result<f64, AppError> {
        Ok(self
            .state()
            .usage
            .get(&(user_id, feature_key.to_string()))
            .map(|r| r.effective_value(now))
            .unwrap_or(0.0))
    }

    async fn increment_usage(
        &self,
        user_id: Uuid,
        feature_key: &str,
        amount: f64,
        now: DateTime<Utc>,
        reset_at: DateTime<Utc>,
    ) -> Result<f64, AppError> {
        let mut state = self.state();
        let record = state
            .usage
            .entry((user_id, feature_key.to_string()))
            .or_insert_with(|| UsageRecord {
                user_id,
                feature_key: feature_key.to_string(),
                value: 0.0,
                reset_at,
                created_utc: now,
                updated_utc: now,
            });

        if record.reset_at <= now {
            record.value = 0.0;
            record.reset_at = reset_at;
        }
        record.value += amount;
        record.updated_utc = now;
        Ok(record.value)
    }

    async fn decrement_usage(
        &self,
        user_id: Uuid,
        feature_key: &str,
        amount: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<f64>, AppError> {
        let mut state = self.state();
        Ok(state
            .usage
            .get_mut(&(user_id, feature_key.to_string()))
            .map(|record| {
                record.value -= amount;
                record.updated_utc = now;
                record.value
            }))
    }

    async fn reset_usage(
        &self,
        user_id: Uuid,
        feature_key: &str,
        now: DateTime<Utc>,
        reset_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut state = self.state();
        let record = state
            .usage
            .entry((user_id, feature_key.to_string()))
            .or_insert_with(|| UsageRecord {
                user_id,
                feature_key: feature_key.to_string(),
                value: 0.0,
                reset_at,
                created_utc: now,
                updated_utc: now,
            });
        record.value = 0.0;
        record.reset_at = reset_at;
        record.updated_utc = now;
        Ok(())
    }

    async fn reset_all_usage(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        reset_at: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let mut state = self.state();
        let mut touched = 0;
        for record in state.usage.values_mut().filter(|r| r.user_id == user_id) {
            record.value = 0.0;
            record.reset_at = reset_at;
            record.updated_utc = now;
            touched += 1;
        }
        Ok(touched)
    }

    async fn list_usage(&self, user_id: Uuid) -> Result<Vec<UsageRecord>, AppError> {
        let mut records: Vec<UsageRecord> = self
            .state()
            .usage
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.feature_key.cmp(&b.feature_key));
        Ok(records)
    }

    async fn record_event(
        &self,
        user_id: Uuid,
        feature_key: &str,
        amount: f64,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        self.state().events.push(UsageEvent {
            event_id: Uuid::new_v4(),
            user_id,
            feature_key: feature_key.to_string(),
            amount,
            created_utc: at,
        });
        Ok(())
    }

    async fn sum_events_since(
        &self,
        user_id: Uuid,
        feature_key: &str,
        since: DateTime<Utc>,
    ) -> Result<f64, AppError> {
        Ok(self
            .state()
            .events
            .iter()
            .filter(|e| e.user_id == user_id && e.feature_key == feature_key)
            .filter(|e| e.created_utc >= since)
            .map(|e| e.amount)
            .sum())
    }

    async fn prune_events_before(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        let mut state = self.state();
        let initial = state.events.len();
        state.events.retain(|e| e.created_utc >= before);
        Ok((initial - state.events.len()) as u64)
    }
}

#[async_trait]
impl CatalogRepository for MemoryStore {
    async fn ping(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, AppError> {
        Ok(self.state().plans.get(&plan_id).cloned())
    }

    async fn find_plan_by_name(&self, name: &str) -> Result<Option<Plan>, AppError> {
        Ok(self
            .state()
            .plans
            .values()
            .find(|p| p.name == name)
            .cloned())
    }

    async fn list_active_plans(&self) -> Result<Vec<Plan>, AppError> {
        let mut plans: Vec<Plan> = self
            .state()
            .plans
            .values()
            .filter(|p| p.is_active)
            .cloned()
            .collect();
        plans.sort_by(|a, b| a.price.cmp(&b.price).then_with(|| a.name.cmp(&b.name)));
        Ok(plans)
    }

    async fn plan_entitlements(&self, plan_id: Uuid) -> Result<Vec<PlanEntitlementRow>, AppError> {
        let state = self.state();
        let mut rows: Vec<PlanEntitlementRow> = state
            .links
            .iter()
            .filter(|l| l.plan_id == plan_id)
            .filter_map(|l| {
                state.entitlements.get(&l.entitlement_id).map(|e| PlanEntitlementRow {
                    plan_id: l.plan_id,
                    entitlement_id: e.entitlement_id,
                    feature_key: e.feature_key.clone(),
                    name: e.name.clone(),
                    entitlement_type: e.entitlement_type.clone(),
                    value: l.value.clone(),
                    position: l.position,
                })
            })
            .collect();
        rows.sort_by_key(|r| r.position);
        Ok(rows)
    }

    async fn get_entitlement(
        &self,
        entitlement_id: Uuid,
    ) -> Result<Option<Entitlement>, AppError> {
        Ok(self.state().entitlements.get(&entitlement_id).cloned())
    }

    async fn create_plan(&self, input: &CreatePlan) -> Result<Plan, AppError> {
        let mut state = self.state();
        if state.plans.values().any(|p| p.name == input.name) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Plan '{}' already exists",
                input.name
            )));
        }

        let now = Utc::now();
        let plan = Plan {
            plan_id: Uuid::new_v4(),
            name: input.name.clone(),
            description: input.description.clone(),
            price: input.price,
            currency: input.currency.clone(),
            billing_interval: input.billing_interval.as_str().to_string(),
            is_active: true,
            created_utc: now,
            updated_utc: now,
        };
        state.plans.insert(plan.plan_id, plan.clone());
        Ok(plan)
    }

    async fn update_plan(
        &self,
        plan_id: Uuid,
        input: &UpdatePlan,
    ) -> Result<Option<Plan>, AppError> {
        let mut state = self.state();
        if let Some(name) = &input.name {
            if state
                .plans
                .values()
                .any(|p| &p.name == name && p.plan_id != plan_id)
            {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Plan '{}' already exists",
                    name
                )));
            }
        }

        let Some(plan) = state.plans.get_mut(&plan_id) else {
            return Ok(None);
        };
        if let Some(name) = &input.name {
            plan.name = name.clone();
        }
        if let Some(description) = &input.description {
            plan.description = Some(description.clone());
        }
        if let Some(price) = input.price {
            plan.price = price;
        }
        if let Some(interval) = input.billing_interval {
            plan.billing_interval = interval.as_str().to_string();
        }
        if let Some(is_active) = input.is_active {
            plan.is_active = is_active;
        }
        plan.updated_utc = Utc::now();
        Ok(Some(plan.clone()))
    }

    async fn delete_plan(&self, plan_id: Uuid) -> Result<bool, AppError> {
        let mut state = self.state();
        let removed = state.plans.remove(&plan_id).is_some();
        state.links.retain(|l| l.plan_id != plan_id);
        Ok(removed)
    }

    async fn plan_in_use(&self, plan_id: Uuid) -> Result<bool, AppError> {
        let state = self.state();
        Ok(state
            .subscriptions
            .values()
            .any(|s| s.plan_id == plan_id || s.pending_plan_id == Some(plan_id))
            || state.payments.values().any(|p| p.plan_id == plan_id))
    }

    async fn create_entitlement(
        &self,
        input: &CreateEntitlement,
    ) -> Result<Entitlement, AppError> {
        let mut state = self.state();
        if state
            .entitlements
            .values()
            .any(|e| e.feature_key == input.feature_key)
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Entitlement '{}' already exists",
                input.feature_key
            )));
        }

        let now = Utc::now();
        let entitlement = Entitlement {
            entitlement_id: Uuid::new_v4(),
            feature_key: input.feature_key.clone(),
            name: input.name.clone(),
            description: input.description.clone(),
            entitlement_type: input.entitlement_type.as_str().to_string(),
            created_utc: now,
            updated_utc: now,
        };
        state
            .entitlements
            .insert(entitlement.entitlement_id, entitlement.clone());
        Ok(entitlement)
    }

    async fn update_entitlement(
        &self,
        entitlement_id: Uuid,
        input: &UpdateEntitlement,
    ) -> Result<Option<Entitlement>, AppError> {
        let mut state = self.state();
        let Some(entitlement) = state.entitlements.get_mut(&entitlement_id) else {
            return Ok(None);
        };
        if let Some(name) = &input.name {
            entitlement.name = name.clone();
        }
        if let Some(description) = &input.description {
            entitlement.description = Some(description.clone());
        }
        if let Some(kind) = input.entitlement_type {
            entitlement.entitlement_type = kind.as_str().to_string();
        }
        entitlement.updated_utc = Utc::now();
        Ok(Some(entitlement.clone()))
    }

    async fn delete_entitlement(&self, entitlement_id: Uuid) -> Result<bool, AppError> {
        let mut state = self.state();
        let removed = state.entitlements.remove(&entitlement_id).is_some();
        state.links.retain(|l| l.entitlement_id != entitlement_id);
        Ok(removed)
    }

    async fn set_plan_entitlement(
        &self,
        plan_id: Uuid,
        entitlement_id: Uuid,
        value: &Value,
    ) -> Result<(), AppError> {
        let mut state = self.state();
        if let Some(link) = state
            .links
            .iter_mut()
            .find(|l| l.plan_id == plan_id && l.entitlement_id == entitlement_id)
        {
            link.value = value.clone();
            return Ok(());
        }

        let position = state
            .links
            .iter()
            .filter(|l| l.plan_id == plan_id)
            .map(|l| l.position + 1)
            .max()
            .unwrap_or(0);
        state.links.push(PlanLink {
            plan_id,
            entitlement_id,
            value: value.clone(),
            position,
        });
        Ok(())
    }

    async fn remove_plan_entitlement(
        &self,
        plan_id: Uuid,
        entitlement_id: Uuid,
    ) -> Result<bool, AppError> {
        let mut state = self.state();
        let initial = state.links.len();
        state
            .links
            .retain(|l| !(l.plan_id == plan_id && l.entitlement_id == entitlement_id));
        Ok(state.links.len() != initial)
    }

    async fn plans_with_entitlement(&self, entitlement_id: Uuid) -> Result<Vec<Uuid>, AppError> {
        Ok(self
            .state()
            .links
            .iter()
            .filter(|l| l.entitlement_id == entitlement_id)
            .map(|l| l.plan_id)
            .collect())
    }
}

#[async_trait]
impl BillingRepository for MemoryStore {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserAccount>, AppError> {
        Ok(self.state().users.get(&user_id).cloned())
    }

    async fn set_premium(&self, user_id: Uuid, is_premium: bool) -> Result<(), AppError> {
        if let Some(user) = self.state().users.get_mut(&user_id) {
            user.is_premium = is_premium;
        }
        Ok(())
    }

    async fn get_subscription_by_user(
        &self,
        user_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        Ok(self.state().subscriptions.get(&user_id).cloned())
    }

    async fn create_checkout(
        &self,
        input: &CreateCheckout,
        now: DateTime<Utc>,
    ) -> Result<Payment, AppError> {
        let mut state = self.state();
        if state.payments.contains_key(&input.reference) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Payment reference {} already exists",
                input.reference
            )));
        }

        let subscription_id = state
            .subscriptions
            .entry(input.user_id)
            .or_insert_with(|| Subscription {
                subscription_id: Uuid::new_v4(),
                user_id: input.user_id,
                plan_id: input.plan_id,
                status: SubscriptionStatus::Pending.as_str().to_string(),
                current_period_end: None,
                cancel_at_period_end: false,
                pending_plan_id: None,
                created_utc: now,
                updated_utc: now,
            })
            .subscription_id;

        let payment = Payment {
            payment_id: Uuid::new_v4(),
            reference: input.reference.clone(),
            user_id: input.user_id,
            subscription_id: Some(subscription_id),
            plan_id: input.plan_id,
            amount: input.amount,
            currency: input.currency.clone(),
            status: PaymentStatus::Pending.as_str().to_string(),
            paid_at: None,
            created_utc: now,
            updated_utc: now,
        };
        state
            .payments
            .insert(payment.reference.clone(), payment.clone());
        Ok(payment)
    }

    async fn get_payment(&self, reference: &str) -> Result<Option<Payment>, AppError> {
        Ok(self.state().payments.get(reference).cloned())
    }

    async fn mark_payment_failed(
        &self,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut state = self.state();
        match state.payments.get_mut(reference) {
            Some(payment) if payment.status() == PaymentStatus::Pending => {
                payment.status = PaymentStatus::Failed.as_str().to_string();
                payment.updated_utc = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn activate_payment(
        &self,
        input: &ActivatePayment,
    ) -> Result<ActivationOutcome, AppError> {
        let mut state = self.state();
        let payment = state.payments.get(&input.reference).cloned().ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Payment {} not found", input.reference))
        })?;

        if payment.is_successful() {
            let subscription = state
                .subscriptions
                .get(&payment.user_id)
                .cloned()
                .ok_or_else(|| {
                    AppError::InternalError(anyhow::anyhow!(
                        "Payment {} succeeded without a subscription",
                        payment.reference
                    ))
                })?;
            return Ok(ActivationOutcome::AlreadyProcessed(subscription));
        }

        let now = input.paid_at;
        let subscription = state
            .subscriptions
            .entry(payment.user_id)
            .and_modify(|s| {
                s.plan_id = payment.plan_id;
                s.status = SubscriptionStatus::Active.as_str().to_string();
                s.current_period_end = Some(input.current_period_end);
                s.cancel_at_period_end = false;
                s.pending_plan_id = None;
                s.updated_utc = now;
            })
            .or_insert_with(|| Subscription {
                subscription_id: Uuid::new_v4(),
                user_id: payment.user_id,
                plan_id: payment.plan_id,
                status: SubscriptionStatus::Active.as_str().to_string(),
                current_period_end: Some(input.current_period_end),
                cancel_at_period_end: false,
                pending_plan_id: None,
                created_utc: now,
                updated_utc: now,
            })
            .clone();

        if let Some(stored) = state.payments.get_mut(&input.reference) {
            stored.status = PaymentStatus::Success.as_str().to_string();
            stored.paid_at = Some(input.paid_at);
            stored.subscription_id = Some(subscription.subscription_id);
            stored.updated_utc = now;
        }
        if let Some(user) = state.users.get_mut(&payment.user_id) {
            user.is_premium = true;
        }
        for record in state.usage.values_mut().filter(|r| r.user_id == payment.user_id) {
            record.value = 0.0;
            record.reset_at = input.usage_reset_at;
            record.updated_utc = now;
        }

        self.activations.fetch_add(1, Ordering::SeqCst);
        Ok(ActivationOutcome::Activated(subscription))
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, AppError> {
        let mut state = self.state();
        Ok(state.subscription_by_id(subscription_id).map(|s| {
            s.cancel_at_period_end = true;
            s.updated_utc = now;
            s.clone()
        }))
    }

    async fn schedule_plan_change(
        &self,
        subscription_id: Uuid,
        pending_plan_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, AppError> {
        let mut state = self.state();
        Ok(state.subscription_by_id(subscription_id).map(|s| {
            s.pending_plan_id = Some(pending_plan_id);
            s.updated_utc = now;
            s.clone()
        }))
    }

    async fn find_expired_subscriptions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, AppError> {
        let mut expired: Vec<Subscription> = self
            .state()
            .subscriptions
            .values()
            .filter(|s| s.is_active() && s.current_period_end.is_some_and(|end| end < now))
            .cloned()
            .collect();
        expired.sort_by_key(|s| s.current_period_end);
        Ok(expired)
    }

    async fn expire_subscription(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut state = self.state();
        match state.subscription_by_id(subscription_id) {
            Some(s) if s.is_active() && s.current_period_end.is_some_and(|end| end < now) => {
                s.status = SubscriptionStatus::Expired.as_str().to_string();
                s.pending_plan_id = None;
                s.updated_utc = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn apply_scheduled_downgrade(
        &self,
        subscription_id: Uuid,
        plan_id: Uuid,
        current_period_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut state = self.state();
        match state.subscription_by_id(subscription_id) {
            Some(s) if s.is_active() && s.pending_plan_id == Some(plan_id) => {
                s.plan_id = plan_id;
                s.pending_plan_id = None;
                s.cancel_at_period_end = false;
                s.current_period_end = Some(current_period_end);
                s.updated_utc = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_abandoned_payments(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let mut state = self.state();
        let mut expired = 0;
        for payment in state.payments.values_mut() {
            if payment.status() == PaymentStatus::Pending && payment.created_utc < cutoff {
                payment.status = PaymentStatus::Failed.as_str().to_string();
                payment.updated_utc = now;
                expired += 1;
            }
        }

        let live_users: Vec<Uuid> = state
            .payments
            .values()
            .filter(|p| p.status() != PaymentStatus::Failed)
            .map(|p| p.user_id)
            .collect();
        let orphaned: Vec<Uuid> = state
            .subscriptions
            .iter()
            .filter(|(user_id, s)| {
                s.status() == SubscriptionStatus::Pending && !live_users.contains(user_id)
            })
            .map(|(_, s)| s.subscription_id)
            .collect();
        state
            .subscriptions
            .retain(|_, s| !orphaned.contains(&s.subscription_id));
        for payment in state.payments.values_mut() {
            if payment
                .subscription_id
                .is_some_and(|id| orphaned.contains(&id))
            {
                payment.subscription_id = None;
            }
        }

        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn lapsed_counter_reads_zero_and_rearms_on_write() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let now = Utc::now();

        store
            .increment_usage(user, "quiz", 3.0, now, now + Duration::days(30))
            .await
            .unwrap();
        let later = now + Duration::days(31);
        assert_eq!(store.usage_value(user, "quiz", later).await.unwrap(), 0.0);

        let value = store
            .increment_usage(user, "quiz", 1.0, later, later + Duration::days(30))
            .await
            .unwrap();
        assert_eq!(value, 1.0);
    }

    #[tokio::test]
    async fn decrement_without_record_is_none() {
        let store = MemoryStore::new();
        let result = store
            .decrement_usage(Uuid::new_v4(), "quiz", 1.0, Utc::now())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn prunes_only_old_events() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let now = Utc::now();
        store
            .record_event(user, "chat", 1.0, now - Duration::days(10))
            .await
            .unwrap();
        store.record_event(user, "chat", 1.0, now).await.unwrap();

        assert_eq!(
            store
                .prune_events_before(now - Duration::days(7))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .sum_events_since(user, "chat", now - Duration::days(30))
                .await
                .unwrap(),
            1.0
        );
    }

    #[tokio::test]
    async fn abandoned_cleanup_unlinks_removed_placeholders() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let now = Utc::now();
        store
            .create_checkout(
                &CreateCheckout {
                    user_id: user,
                    plan_id: Uuid::new_v4(),
                    reference: "sub_stale".to_string(),
                    amount: rust_decimal::Decimal::new(2500, 0),
                    currency: "NGN".to_string(),
                },
                now - Duration::hours(30),
            )
            .await
            .unwrap();

        let expired = store
            .expire_abandoned_payments(now - Duration::hours(24), now)
            .await
            .unwrap();

        assert_eq!(expired, 1);
        assert!(store.get_subscription_by_user(user).await.unwrap().is_none());
        let payment = store.get_payment("sub_stale").await.unwrap().unwrap();
        assert_eq!(payment.status(), PaymentStatus::Failed);
        assert_eq!(payment.subscription_id, None);
    }
}
