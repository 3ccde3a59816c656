//! Payment model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::subscription::Subscription;

/// Payment status. `Success` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "success" => PaymentStatus::Success,
            "failed" => PaymentStatus::Failed,
            _ => PaymentStatus::Pending,
        }
    }
}

/// One checkout attempt, keyed by its gateway reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub payment_id: Uuid,
    pub reference: String,
    pub user_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub plan_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Payment {
    pub fn status(&self) -> PaymentStatus {
        PaymentStatus::from_string(&self.status)
    }

    pub fn is_successful(&self) -> bool {
        self.status() == PaymentStatus::Success
    }

    /// Expected charge in the gateway's minor currency unit.
    pub fn amount_in_minor_units(&self) -> Option<i64> {
        (self.amount * Decimal::ONE_HUNDRED).round().to_i64()
    }
}

/// Input for the checkout transaction.
#[derive(Debug, Clone)]
pub struct CreateCheckout {
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub reference: String,
    pub amount: Decimal,
    pub currency: String,
}

/// Input for the activation transaction.
#[derive(Debug, Clone)]
pub struct ActivatePayment {
    pub reference: String,
    pub paid_at: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    /// Usage counters restart in the same transaction, armed to this instant.
    pub usage_reset_at: DateTime<Utc>,
}

/// Result of the activation transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivationOutcome {
    /// This call moved the payment to `success` and activated the subscription.
    Activated(Subscription),
    /// Another call already did; the current subscription is returned.
    AlreadyProcessed(Subscription),
}

impl ActivationOutcome {
    pub fn subscription(&self) -> &Subscription {
        match self {
            ActivationOutcome::Activated(s) | ActivationOutcome::AlreadyProcessed(s) => s,
        }
    }

    pub fn into_subscription(self) -> Subscription {
        match self {
            ActivationOutcome::Activated(s) | ActivationOutcome::AlreadyProcessed(s) => s,
        }
    }
}
