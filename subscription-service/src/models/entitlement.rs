//! Entitlement model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use service_core::error::AppError;
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

/// How an entitlement's value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementType {
    Counter,
    Boolean,
    Frequency,
    Level,
}

impl EntitlementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitlementType::Counter => "counter",
            EntitlementType::Boolean => "boolean",
            EntitlementType::Frequency => "frequency",
            EntitlementType::Level => "level",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "counter" => Some(EntitlementType::Counter),
            "boolean" => Some(EntitlementType::Boolean),
            "frequency" => Some(EntitlementType::Frequency),
            "level" => Some(EntitlementType::Level),
            _ => None,
        }
    }
}

/// Catalog entry for a gated feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Entitlement {
    pub entitlement_id: Uuid,
    pub feature_key: String,
    pub name: String,
    pub description: Option<String>,
    pub entitlement_type: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Entitlement {
    /// Stored type as an enum. An unknown type string is a corrupt row.
    pub fn kind(&self) -> Result<EntitlementType, AppError> {
        EntitlementType::parse(&self.entitlement_type).ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!(
                "Entitlement {} has unknown type '{}'",
                self.feature_key,
                self.entitlement_type
            ))
        })
    }
}

/// Configured value for a frequency entitlement: `limit` events per `window`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequencyLimit {
    pub limit: u32,
    pub window: String,
}

/// A plan's value for one entitlement, typed by the entitlement kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum EntitlementValue {
    Counter(f64),
    Boolean(bool),
    Frequency(FrequencyLimit),
    Level(i64),
}

#[derive(Debug, Error)]
#[error("{kind} entitlement expects {expected}, got {actual}")]
pub struct ValueShapeError {
    pub kind: &'static str,
    pub expected: &'static str,
    pub actual: String,
}

impl From<ValueShapeError> for AppError {
    fn from(err: ValueShapeError) -> Self {
        AppError::BadRequest(anyhow::Error::new(err))
    }
}

impl EntitlementValue {
    /// Interpret a raw JSON value under the given entitlement type.
    pub fn parse(kind: EntitlementType, raw: &Value) -> Result<Self, ValueShapeError> {
        let shape_error = |expected: &'static str| ValueShapeError {
            kind: kind.as_str(),
            expected,
            actual: raw.to_string(),
        };

        match kind {
            EntitlementType::Counter => raw
                .as_f64()
                .filter(|v| v.is_finite() && *v >= 0.0)
                .map(EntitlementValue::Counter)
                .ok_or_else(|| shape_error("a non-negative number")),
            EntitlementType::Boolean => raw
                .as_bool()
                .map(EntitlementValue::Boolean)
                .ok_or_else(|| shape_error("a boolean")),
            EntitlementType::Frequency => {
                serde_json::from_value::<FrequencyLimit>(raw.clone())
                    .map(EntitlementValue::Frequency)
                    .map_err(|_| shape_error("an object {limit, window}"))
            }
            EntitlementType::Level => raw
                .as_i64()
                .map(EntitlementValue::Level)
                .ok_or_else(|| shape_error("an integer")),
        }
    }

    pub fn kind(&self) -> EntitlementType {
        match self {
            EntitlementValue::Counter(_) => EntitlementType::Counter,
            EntitlementValue::Boolean(_) => EntitlementType::Boolean,
            EntitlementValue::Frequency(_) => EntitlementType::Frequency,
            EntitlementValue::Level(_) => EntitlementType::Level,
        }
    }

    /// Storage form, as written to `plan_entitlements.value`.
    pub fn to_json(&self) -> Value {
        match self {
            EntitlementValue::Counter(limit) => json!(limit),
            EntitlementValue::Boolean(enabled) => json!(enabled),
            EntitlementValue::Frequency(f) => json!({ "limit": f.limit, "window": f.window }),
            EntitlementValue::Level(level) => json!(level),
        }
    }
}

/// Join of `plan_entitlements` with `entitlements`, in plan order.
#[derive(Debug, Clone, FromRow)]
pub struct PlanEntitlementRow {
    pub plan_id: Uuid,
    pub entitlement_id: Uuid,
    pub feature_key: String,
    pub name: String,
    pub entitlement_type: String,
    pub value: Value,
    pub position: i32,
}

/// Input for creating an entitlement.
#[derive(Debug, Clone)]
pub struct CreateEntitlement {
    pub feature_key: String,
    pub name: String,
    pub description: Option<String>,
    pub entitlement_type: EntitlementType,
}

/// Input for updating an entitlement. The type is immutable once plans
/// reference it.
#[derive(Debug, Clone, Default)]
pub struct UpdateEntitlement {
    pub name: Option<String>,
    pub description: Option<String>,
    pub entitlement_type: Option<EntitlementType>,
}
