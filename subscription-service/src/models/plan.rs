//! Plan model.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;
use uuid::Uuid;

use super::entitlement::{EntitlementType, EntitlementValue};
use super::subscription::Subscription;

/// Billing interval for plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Monthly,
    Yearly,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Monthly => "monthly",
            BillingInterval::Yearly => "yearly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monthly" => Some(BillingInterval::Monthly),
            "yearly" => Some(BillingInterval::Yearly),
            _ => None,
        }
    }

    /// Length of one paid period. Periods are fixed day counts, not calendar
    /// months, so renewals never drift with month length.
    pub fn period_length(&self) -> Duration {
        match self {
            BillingInterval::Monthly => Duration::days(30),
            BillingInterval::Yearly => Duration::days(365),
        }
    }
}

/// Priced bundle of entitlement values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub plan_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub currency: String,
    pub billing_interval: String,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Plan {
    /// Stored interval as an enum. Anything other than monthly/yearly is a
    /// configuration error on the plan row.
    pub fn interval(&self) -> Result<BillingInterval, AppError> {
        BillingInterval::parse(&self.billing_interval).ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!(
                "Invalid billing interval '{}' on plan {}",
                self.billing_interval,
                self.plan_id
            ))
        })
    }

    pub fn is_free(&self) -> bool {
        self.price.is_zero()
    }

    /// Price in the gateway's minor currency unit (kobo, cents).
    pub fn amount_in_minor_units(&self) -> Result<i64, AppError> {
        (self.price * Decimal::ONE_HUNDRED)
            .round()
            .to_i64()
            .ok_or_else(|| {
                AppError::BadRequest(anyhow::anyhow!(
                    "Plan price {} cannot be charged",
                    self.price
                ))
            })
    }

    pub fn period_end_from(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, AppError> {
        Ok(now + self.interval()?.period_length())
    }
}

/// One entitlement as granted by a plan, with its typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanFeature {
    pub entitlement_id: Uuid,
    pub feature_key: String,
    pub name: String,
    pub value: EntitlementValue,
}

impl PlanFeature {
    pub fn kind(&self) -> EntitlementType {
        self.value.kind()
    }
}

/// Plan plus its ordered entitlement values; the unit cached under
/// `plan:{id}:entitlements`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanWithEntitlements {
    pub plan: Plan,
    pub features: Vec<PlanFeature>,
}

impl PlanWithEntitlements {
    pub fn feature(&self, feature_key: &str) -> Option<&PlanFeature> {
        self.features.iter().find(|f| f.feature_key == feature_key)
    }
}

/// The plan a user is currently entitled to. `subscription` is `None` when
/// the user is served by the configured fallback plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivePlan {
    pub subscription: Option<Subscription>,
    pub plan: PlanWithEntitlements,
}

/// Input for creating a plan.
#[derive(Debug, Clone)]
pub struct CreatePlan {
    pub name: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub currency: String,
    pub billing_interval: BillingInterval,
}

/// Input for updating a plan.
#[derive(Debug, Clone, Default)]
pub struct UpdatePlan {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<Decimal>,
    pub billing_interval: Option<BillingInterval>,
    pub is_active: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn plan(price: &str, interval: &str) -> Plan {
        Plan {
            plan_id: Uuid::new_v4(),
            name: "Pro".into(),
            description: None,
            price: Decimal::from_str(price).unwrap(),
            currency: "NGN".into(),
            billing_interval: interval.into(),
            is_active: true,
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        }
    }

    #[test]
    fn converts_price_to_minor_units() {
        assert_eq!(plan("2500.00", "monthly").amount_in_minor_units().unwrap(), 250_000);
        assert_eq!(plan("19.995", "monthly").amount_in_minor_units().unwrap(), 2_000);
    }

    #[test]
    fn period_end_follows_interval() {
        let now = Utc::now();
        assert_eq!(
            plan("10", "monthly").period_end_from(now).unwrap(),
            now + Duration::days(30)
        );
        assert_eq!(
            plan("10", "yearly").period_end_from(now).unwrap(),
            now + Duration::days(365)
        );
    }

    #[test]
    fn unknown_interval_is_rejected() {
        let err = plan("10", "weekly").period_end_from(Utc::now()).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
