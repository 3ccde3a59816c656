use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::{EntitlementValue, PlanFeature, PlanWithEntitlements, Subscription};
use crate::policies::PolicyMetadata;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub plan_id: Uuid,

    #[validate(url(message = "callbackUrl must be a valid URL"))]
    pub callback_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub authorization_url: String,
    pub reference: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    #[validate(length(min = 1, max = 100, message = "reference is required"))]
    pub reference: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DowngradeRequest {
    pub plan_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub subscription_id: Uuid,
    pub plan_id: Uuid,
    pub status: String,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_plan_id: Option<Uuid>,
}

impl From<Subscription> for SubscriptionView {
    fn from(s: Subscription) -> Self {
        Self {
            subscription_id: s.subscription_id,
            plan_id: s.plan_id,
            status: s.status,
            current_period_end: s.current_period_end,
            cancel_at_period_end: s.cancel_at_period_end,
            pending_plan_id: s.pending_plan_id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub message: String,
    pub subscription: SubscriptionView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureView {
    pub entitlement_id: Uuid,
    pub feature_key: String,
    pub name: String,
    /// Rendered as `"type"` and `"value"`.
    #[serde(flatten)]
    pub value: EntitlementValue,
}

impl From<PlanFeature> for FeatureView {
    fn from(f: PlanFeature) -> Self {
        Self {
            entitlement_id: f.entitlement_id,
            feature_key: f.feature_key,
            name: f.name,
            value: f.value,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanView {
    pub plan_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub currency: String,
    pub billing_interval: String,
    pub is_active: bool,
    pub features: Vec<FeatureView>,
}

impl From<PlanWithEntitlements> for PlanView {
    fn from(p: PlanWithEntitlements) -> Self {
        Self {
            plan_id: p.plan.plan_id,
            name: p.plan.name,
            description: p.plan.description,
            price: p.plan.price,
            currency: p.plan.currency,
            billing_interval: p.plan.billing_interval,
            is_active: p.plan.is_active,
            features: p.features.into_iter().map(FeatureView::from).collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureUsageView {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PolicyMetadata>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentPlanResponse {
    /// Absent when the user is served by the fallback plan.
    pub subscription: Option<SubscriptionView>,
    pub plan: PlanView,
    pub usage: BTreeMap<String, FeatureUsageView>,
}
