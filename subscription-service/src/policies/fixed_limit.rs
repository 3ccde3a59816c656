use super::{
    Policy, PolicyContext, PolicyError, PolicyMetadata, PolicyResult, format_amount, shape_error,
};
use crate::models::EntitlementValue;

/// Counter entitlements: allowed while usage is strictly below the limit.
pub struct FixedLimitPolicy;

impl Policy for FixedLimitPolicy {
    fn name(&self) -> &'static str {
        "fixed_limit"
    }

    fn evaluate(&self, ctx: &PolicyContext<'_>) -> Result<PolicyResult, PolicyError> {
        let EntitlementValue::Counter(limit) = ctx.value else {
            return Err(shape_error(self.name(), ctx.value));
        };
        let limit = *limit;
        let used = ctx.usage;

        let metadata = PolicyMetadata {
            limit,
            used,
            remaining: (limit - used).max(0.0),
            window_seconds: None,
        };

        let result = if used < limit {
            PolicyResult::allow()
        } else {
            PolicyResult::deny(format!(
                "Usage limit of {} reached",
                format_amount(limit)
            ))
        };

        Ok(result.with_metadata(metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluate(limit: f64, used: f64) -> PolicyResult {
        let value = EntitlementValue::Counter(limit);
        FixedLimitPolicy
            .evaluate(&PolicyContext {
                value: &value,
                usage: used,
                required_level: 0,
            })
            .unwrap()
    }

    #[test]
    fn allows_below_limit() {
        let result = evaluate(5.0, 4.0);
        assert!(result.allowed);
        let meta = result.metadata.unwrap();
        assert_eq!(meta.remaining, 1.0);
        assert_eq!(meta.used, 4.0);
    }

    #[test]
    fn denies_at_limit_and_names_it() {
        let result = evaluate(5.0, 5.0);
        assert!(!result.allowed);
        assert!(result.reason.unwrap().contains('5'));
        assert_eq!(result.metadata.unwrap().remaining, 0.0);
    }

    #[test]
    fn zero_limit_always_denies() {
        assert!(!evaluate(0.0, 0.0).allowed);
    }

    #[test]
    fn overshoot_reports_no_negative_remaining() {
        assert_eq!(evaluate(3.0, 7.0).metadata.unwrap().remaining, 0.0);
    }
}
