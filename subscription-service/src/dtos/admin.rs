use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::models::{
    BillingInterval, CreateEntitlement, CreatePlan, Entitlement, EntitlementType,
    UpdateEntitlement, UpdatePlan,
};
use crate::services::PlanRemoval;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreatePlanRequest {
    #[validate(length(min = 1, max = 100, message = "Plan name is required"))]
    pub name: String,

    pub description: Option<String>,

    pub price: Decimal,

    /// Defaults to the gateway currency.
    #[validate(length(equal = 3, message = "Currency must be an ISO 4217 code"))]
    pub currency: Option<String>,

    pub billing_interval: BillingInterval,
}

impl CreatePlanRequest {
    pub fn into_input(self, default_currency: &str) -> Result<CreatePlan, AppError> {
        ensure_price(self.price)?;
        Ok(CreatePlan {
            name: self.name.trim().to_string(),
            description: self.description,
            price: self.price,
            currency: self
                .currency
                .unwrap_or_else(|| default_currency.to_string())
                .to_uppercase(),
            billing_interval: self.billing_interval,
        })
    }
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlanRequest {
    #[validate(length(min = 1, max = 100, message = "Plan name cannot be empty"))]
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<Decimal>,
    pub billing_interval: Option<BillingInterval>,
    pub is_active: Option<bool>,
}

impl UpdatePlanRequest {
    pub fn into_input(self) -> Result<UpdatePlan, AppError> {
        if let Some(price) = self.price {
            ensure_price(price)?;
        }
        Ok(UpdatePlan {
            name: self.name.map(|n| n.trim().to_string()),
            description: self.description,
            price: self.price,
            billing_interval: self.billing_interval,
            is_active: self.is_active,
        })
    }
}

fn ensure_price(price: Decimal) -> Result<(), AppError> {
    if price.is_sign_negative() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Price cannot be negative"
        )));
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRemovalResponse {
    pub plan_id: Uuid,
    pub result: PlanRemoval,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateEntitlementRequest {
    #[validate(length(min = 1, max = 100, message = "Feature key is required"))]
    pub feature_key: String,

    #[validate(length(min = 1, max = 100, message = "Name is required"))]
    pub name: String,

    pub description: Option<String>,

    #[serde(rename = "type")]
    pub entitlement_type: EntitlementType,
}

impl From<CreateEntitlementRequest> for CreateEntitlement {
    fn from(req: CreateEntitlementRequest) -> Self {
        Self {
            feature_key: req.feature_key.trim().to_string(),
            name: req.name.trim().to_string(),
            description: req.description,
            entitlement_type: req.entitlement_type,
        }
    }
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEntitlementRequest {
    #[validate(length(min = 1, max = 100, message = "Name cannot be empty"))]
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub entitlement_type: Option<EntitlementType>,
}

impl From<UpdateEntitlementRequest> for UpdateEntitlement {
    fn from(req: UpdateEntitlementRequest) -> Self {
        Self {
            name: req.name.map(|n| n.trim().to_string()),
            description: req.description,
            entitlement_type: req.entitlement_type,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementResponse {
    pub entitlement_id: Uuid,
    pub feature_key: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub entitlement_type: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl From<Entitlement> for EntitlementResponse {
    fn from(e: Entitlement) -> Self {
        Self {
            entitlement_id: e.entitlement_id,
            feature_key: e.feature_key,
            name: e.name,
            description: e.description,
            entitlement_type: e.entitlement_type,
            created_utc: e.created_utc,
            updated_utc: e.updated_utc,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SetPlanEntitlementRequest {
    /// Shape depends on the entitlement type: a number for counters, a bool,
    /// `{limit, window}` for frequency, an integer level.
    pub value: Value,
}
