//! Subscription lifecycle: checkout, payment activation, cancellation,
//! scheduled downgrades and the periodic sweeps.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use service_core::error::AppError;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::clock::Clock;
use super::gateway::{GatewayError, InitializeTransaction, PaymentGateway, TransactionStatus};
use super::metrics::{record_activation, record_job_items};
use super::plan_cache::PlanConfigCache;
use super::repository::{BillingRepository, CatalogRepository};
use super::usage::UsageTracker;
use crate::models::{
    ActivatePayment, ActivationOutcome, CreateCheckout, EntitlementValue, Subscription,
};

const GATEWAY_UNAVAILABLE: &str = "Payment gateway is unavailable, please try again later";

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub activation_timeout: Duration,
    pub abandoned_after: ChronoDuration,
    pub event_retention: ChronoDuration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            activation_timeout: Duration::from_secs(20),
            abandoned_after: ChronoDuration::hours(24),
            event_retention: ChronoDuration::days(7),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub authorization_url: String,
    pub reference: String,
}

#[derive(Clone)]
pub struct SubscriptionLifecycle {
    billing: Arc<dyn BillingRepository>,
    catalog: Arc<dyn CatalogRepository>,
    gateway: Arc<dyn PaymentGateway>,
    plans: PlanConfigCache,
    usage: UsageTracker,
    clock: Arc<dyn Clock>,
    settings: LifecycleSettings,
}

impl SubscriptionLifecycle {
    pub fn new(
        billing: Arc<dyn BillingRepository>,
        catalog: Arc<dyn CatalogRepository>,
        gateway: Arc<dyn PaymentGateway>,
        plans: PlanConfigCache,
        usage: UsageTracker,
        clock: Arc<dyn Clock>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            billing,
            catalog,
            gateway,
            plans,
            usage,
            clock,
            settings,
        }
    }

    /// Record a pending payment for `plan_id` and open a hosted checkout.
    #[instrument(skip(self, callback_url))]
    pub async fn checkout(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        callback_url: &str,
    ) -> Result<CheckoutSession, AppError> {
        let user = self
            .billing
            .get_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("User not found")))?;
        let plan = self
            .catalog
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Plan not found")))?;

        if !plan.is_active {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Plan '{}' is not available",
                plan.name
            )));
        }
        if plan.is_free() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Plan '{}' is free and needs no checkout",
                plan.name
            )));
        }
        plan.interval()?;
        let amount = plan.amount_in_minor_units()?;

        let reference = format!("sub_{}", Uuid::new_v4().simple());
        let payment = self
            .billing
            .create_checkout(
                &CreateCheckout {
                    user_id,
                    plan_id,
                    reference: reference.clone(),
                    amount: plan.price,
                    currency: plan.currency.clone(),
                },
                self.clock.now(),
            )
            .await?;

        let request = InitializeTransaction {
            email: user.email,
            amount,
            currency: plan.currency.clone(),
            reference: payment.reference.clone(),
            callback_url: callback_url.to_string(),
            metadata: json!({
                "user_id": user_id,
                "plan_id": plan_id,
                "payment_id": payment.payment_id,
            }),
        };

        let initialized = match self.gateway.initialize_transaction(&request).await {
            Ok(initialized) => initialized,
            Err(e) => {
                warn!(reference = %reference, error = %e, "Checkout initialization failed");
                if let Err(mark_err) = self
                    .billing
                    .mark_payment_failed(&reference, self.clock.now())
                    .await
                {
                    warn!(reference = %reference, error = %mark_err, "Failed to mark payment failed");
                }
                return Err(AppError::ServiceUnavailable(GATEWAY_UNAVAILABLE.to_string()));
            }
        };

        info!(%user_id, %plan_id, reference = %reference, "Checkout started");
        Ok(CheckoutSession {
            authorization_url: initialized.authorization_url,
            reference,
        })
    }

    /// Confirm a payment with the gateway and activate the subscription.
    ///
    /// Safe to call any number of times, concurrently, from the redirect and
    /// from webhooks: a reference activates at most once and later calls get
    /// the current subscription back. `requester`, when given, must own the
    /// payment.
    #[instrument(skip(self))]
    pub async fn verify_and_activate(
        &self,
        reference: &str,
        requester: Option<Uuid>,
    ) -> Result<Subscription, AppError> {
        let payment = self
            .billing
            .get_payment(reference)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment not found")))?;

        if let Some(requester) = requester {
            if payment.user_id != requester {
                return Err(AppError::Forbidden(anyhow::anyhow!(
                    "Payment belongs to another user"
                )));
            }
        }

        if payment.is_successful() {
            debug!(reference, "Payment already processed");
            record_activation("already_processed");
            self.plans.invalidate_user_plan(payment.user_id).await;
            return self.current_subscription(payment.user_id).await;
        }

        let verified = self
            .gateway
            .verify_transaction(reference)
            .await
            .map_err(|e| match e {
                GatewayError::Unavailable(detail) => {
                    warn!(reference, error = %detail, "Payment verification unavailable");
                    record_activation("gateway_unavailable");
                    AppError::ServiceUnavailable(GATEWAY_UNAVAILABLE.to_string())
                }
                GatewayError::Rejected(detail) => {
                    warn!(reference, error = %detail, "Gateway rejected verification");
                    record_activation("rejected");
                    AppError::BadRequest(anyhow::anyhow!("Payment could not be verified"))
                }
            })?;

        match verified.status {
            TransactionStatus::Success => {}
            TransactionStatus::Failed => {
                self.billing
                    .mark_payment_failed(reference, self.clock.now())
                    .await?;
                record_activation("failed");
                return Err(AppError::BadRequest(anyhow::anyhow!("Payment failed")));
            }
            TransactionStatus::Abandoned | TransactionStatus::Pending => {
                record_activation("incomplete");
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Payment has not been completed"
                )));
            }
        }

        let expected = payment.amount_in_minor_units().ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!(
                "Payment {} has an unrepresentable amount",
                reference
            ))
        })?;
        if verified.amount < expected || !verified.currency.eq_ignore_ascii_case(&payment.currency)
        {
            warn!(
                reference,
                expected,
                paid = verified.amount,
                currency = %verified.currency,
                "Paid amount does not cover the plan price"
            );
            record_activation("underpaid");
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Paid amount does not match the plan price"
            )));
        }

        let plan = self
            .catalog
            .get_plan(payment.plan_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Plan not found")))?;
        let now = self.clock.now();
        let current_period_end = plan.period_end_from(now)?;

        let activation = ActivatePayment {
            reference: reference.to_string(),
            paid_at: verified.paid_at.unwrap_or(now),
            current_period_end,
            usage_reset_at: UsageTracker::next_reset(now),
        };
        let outcome = tokio::time::timeout(
            self.settings.activation_timeout,
            self.billing.activate_payment(&activation),
        )
        .await
        .map_err(|_| {
            warn!(reference, "Activation timed out");
            record_activation("timeout");
            AppError::ServiceUnavailable("Activation timed out, please retry".to_string())
        })??;

        match &outcome {
            ActivationOutcome::Activated(subscription) => {
                record_activation("activated");
                info!(
                    reference,
                    user_id = %subscription.user_id,
                    subscription_id = %subscription.subscription_id,
                    plan_id = %subscription.plan_id,
                    "Subscription activated"
                );
            }
            ActivationOutcome::AlreadyProcessed(_) => {
                debug!(reference, "Payment activated concurrently");
                record_activation("already_processed");
            }
        }
        // Also reached by a retry after a commit whose reply timed out.
        self.plans.invalidate_user_plan(payment.user_id).await;

        Ok(outcome.into_subscription())
    }

    /// Fail a pending payment reported as failed by the provider. Returns
    /// false when the payment was no longer pending.
    pub async fn record_failed_payment(&self, reference: &str) -> Result<bool, AppError> {
        if self.billing.get_payment(reference).await?.is_none() {
            return Err(AppError::NotFound(anyhow::anyhow!("Payment not found")));
        }
        self.billing
            .mark_payment_failed(reference, self.clock.now())
            .await
    }

    /// Stop renewal; access continues until the period ends.
    #[instrument(skip(self))]
    pub async fn cancel_subscription(&self, user_id: Uuid) -> Result<Subscription, AppError> {
        let subscription = self.require_active(user_id).await?;
        let updated = self
            .billing
            .set_cancel_at_period_end(subscription.subscription_id, self.clock.now())
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))?;

        self.plans.invalidate_user_plan(user_id).await;
        info!(%user_id, subscription_id = %updated.subscription_id, "Subscription set to cancel at period end");
        Ok(updated)
    }

    /// Switch to `new_plan_id` at the end of the current period.
    #[instrument(skip(self))]
    pub async fn schedule_downgrade(
        &self,
        user_id: Uuid,
        new_plan_id: Uuid,
    ) -> Result<Subscription, AppError> {
        let subscription = self.require_active(user_id).await?;
        if subscription.plan_id == new_plan_id {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Subscription is already on this plan"
            )));
        }

        let target = self
            .plans
            .get_plan_with_entitlements(new_plan_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Plan not found")))?;
        if !target.plan.is_active {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Plan '{}' is not available",
                target.plan.name
            )));
        }
        // The sweep can only switch to a plan that needs no payment.
        if !target.plan.is_free() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Plan '{}' is paid and requires a new checkout",
                target.plan.name
            )));
        }

        for feature in &target.features {
            let EntitlementValue::Counter(limit) = feature.value else {
                continue;
            };
            let used = self.usage.get_usage(user_id, &feature.feature_key).await?;
            if used > limit {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Current usage of '{}' ({}) exceeds the {} plan limit of {}",
                    feature.feature_key,
                    used,
                    target.plan.name,
                    limit
                )));
            }
        }

        let updated = self
            .billing
            .schedule_plan_change(subscription.subscription_id, new_plan_id, self.clock.now())
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))?;

        self.plans.invalidate_user_plan(user_id).await;
        info!(%user_id, %new_plan_id, "Downgrade scheduled");
        Ok(updated)
    }

    /// Close out every active subscription whose period has ended. Each one
    /// is handled on its own; failures are logged and skipped. Returns how
    /// many were processed.
    #[instrument(skip(self))]
    pub async fn handle_expired_subscriptions(&self) -> Result<u64, AppError> {
        let now = self.clock.now();
        let expired = self.billing.find_expired_subscriptions(now).await?;

        let mut processed = 0;
        let mut failed = 0;
        for subscription in &expired {
            match self.close_period(subscription, now).await {
                Ok(true) => processed += 1,
                Ok(false) => debug!(
                    subscription_id = %subscription.subscription_id,
                    "Subscription changed before it could be expired"
                ),
                Err(e) => {
                    failed += 1;
                    warn!(
                        subscription_id = %subscription.subscription_id,
                        user_id = %subscription.user_id,
                        error = %e,
                        "Failed to process expired subscription"
                    );
                }
            }
        }

        record_job_items("expire_subscriptions", "processed", processed);
        record_job_items("expire_subscriptions", "failed", failed);
        info!(found = expired.len(), processed, failed, "Expiration sweep finished");
        Ok(processed)
    }

    /// Fail stale pending payments, drop orphaned placeholders and prune old
    /// frequency events. Returns the number of payments failed.
    #[instrument(skip(self))]
    pub async fn cleanup_abandoned_payments(&self) -> Result<u64, AppError> {
        let now = self.clock.now();
        let expired = self
            .billing
            .expire_abandoned_payments(now - self.settings.abandoned_after, now)
            .await?;
        let pruned = self
            .usage
            .prune_events(now - self.settings.event_retention)
            .await?;

        record_job_items("cleanup_payments", "expired", expired);
        record_job_items("cleanup_payments", "events_pruned", pruned);
        info!(expired, pruned, "Abandoned payment cleanup finished");
        Ok(expired)
    }

    async fn close_period(
        &self,
        subscription: &Subscription,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        if let Some(target_id) = subscription.pending_plan_id {
            let target = self
                .catalog
                .get_plan(target_id)
                .await?
                .filter(|plan| plan.is_active && plan.is_free());
            if let Some(plan) = target {
                let period_end = plan.period_end_from(now)?;
                let switched = self
                    .billing
                    .apply_scheduled_downgrade(
                        subscription.subscription_id,
                        plan.plan_id,
                        period_end,
                        now,
                    )
                    .await?;
                if switched {
                    info!(
                        subscription_id = %subscription.subscription_id,
                        plan_id = %plan.plan_id,
                        "Scheduled downgrade applied"
                    );
                    self.finish_paid_access(subscription.user_id).await;
                }
                return Ok(switched);
            }
        }

        let expired = self
            .billing
            .expire_subscription(subscription.subscription_id, now)
            .await?;
        if expired {
            info!(
                subscription_id = %subscription.subscription_id,
                user_id = %subscription.user_id,
                "Subscription expired"
            );
            self.finish_paid_access(subscription.user_id).await;
        }
        Ok(expired)
    }

    async fn require_active(&self, user_id: Uuid) -> Result<Subscription, AppError> {
        self.billing
            .get_subscription_by_user(user_id)
            .await?
            .filter(Subscription::is_active)
            .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("No active subscription")))
    }

    async fn current_subscription(&self, user_id: Uuid) -> Result<Subscription, AppError> {
        self.billing
            .get_subscription_by_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))
    }

    async fn finish_paid_access(&self, user_id: Uuid) {
        if let Err(e) = self.usage.reset_all_usage(user_id).await {
            warn!(%user_id, error = %e, "Failed to reset usage after expiry");
        }
        if let Err(e) = self.billing.set_premium(user_id, false).await {
            warn!(%user_id, error = %e, "Failed to clear premium flag");
        }
        self.plans.invalidate_user_plan(user_id).await;
    }
}
