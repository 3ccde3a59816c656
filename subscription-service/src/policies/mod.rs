//! Stateless evaluators that turn a plan value plus current usage into an
//! allow/deny decision.

mod boolean;
mod fixed_limit;
mod frequency;
mod level;

use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use thiserror::Error;

use crate::models::{EntitlementType, EntitlementValue};

pub use boolean::BooleanPolicy;
pub use fixed_limit::FixedLimitPolicy;
pub use frequency::{FrequencyPolicy, DEFAULT_WINDOW, parse_window};
pub use level::LevelPolicy;

/// Inputs to one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct PolicyContext<'a> {
    pub value: &'a EntitlementValue,
    /// Counter value or event count in the window; zero for kinds that do not
    /// meter.
    pub usage: f64,
    /// Call-site requirement for level entitlements.
    pub required_level: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyMetadata {
    pub limit: f64,
    pub used: f64,
    pub remaining: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyResult {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PolicyMetadata>,
}

impl PolicyResult {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            metadata: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: PolicyMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Reflect `amount` units consumed after the decision was made.
    pub fn record_consumption(&mut self, amount: f64) {
        if let Some(meta) = self.metadata.as_mut() {
            meta.used += amount;
            meta.remaining = (meta.limit - meta.used).max(0.0);
        }
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("{policy} policy cannot evaluate a {actual} value")]
    ValueShape {
        policy: &'static str,
        actual: &'static str,
    },
}

impl From<PolicyError> for AppError {
    fn from(err: PolicyError) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

pub trait Policy: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(&self, ctx: &PolicyContext<'_>) -> Result<PolicyResult, PolicyError>;
}

/// The policy for an entitlement kind.
pub fn policy_for(kind: EntitlementType) -> &'static dyn Policy {
    match kind {
        EntitlementType::Counter => &FixedLimitPolicy,
        EntitlementType::Boolean => &BooleanPolicy,
        EntitlementType::Frequency => &FrequencyPolicy,
        EntitlementType::Level => &LevelPolicy,
    }
}

fn shape_error(policy: &'static str, value: &EntitlementValue) -> PolicyError {
    PolicyError::ValueShape {
        policy,
        actual: value.kind().as_str(),
    }
}

/// Render a quantity without a trailing `.0` when it is whole.
pub(crate) fn format_amount(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FrequencyLimit;

    #[test]
    fn selects_policy_by_kind() {
        assert_eq!(policy_for(EntitlementType::Counter).name(), "fixed_limit");
        assert_eq!(policy_for(EntitlementType::Boolean).name(), "boolean");
        assert_eq!(policy_for(EntitlementType::Frequency).name(), "frequency");
        assert_eq!(policy_for(EntitlementType::Level).name(), "level");
    }

    #[test]
    fn mismatched_value_is_a_shape_error() {
        let value = EntitlementValue::Boolean(true);
        let ctx = PolicyContext {
            value: &value,
            usage: 0.0,
            required_level: 0,
        };
        let err = policy_for(EntitlementType::Counter).evaluate(&ctx).unwrap_err();
        assert!(matches!(err, PolicyError::ValueShape { actual: "boolean", .. }));

        let value = EntitlementValue::Frequency(FrequencyLimit {
            limit: 1,
            window: "1h".into(),
        });
        let ctx = PolicyContext { value: &value, ..ctx };
        assert!(policy_for(EntitlementType::Level).evaluate(&ctx).is_err());
    }

    #[test]
    fn consumption_updates_metadata() {
        let mut result = PolicyResult::allow().with_metadata(PolicyMetadata {
            limit: 5.0,
            used: 4.0,
            remaining: 1.0,
            window_seconds: None,
        });
        result.record_consumption(1.0);
        let meta = result.metadata.unwrap();
        assert_eq!(meta.used, 5.0);
        assert_eq!(meta.remaining, 0.0);
    }

    #[test]
    fn formats_whole_amounts_without_fraction() {
        assert_eq!(format_amount(5.0), "5");
        assert_eq!(format_amount(2.5), "2.5");
    }
}
