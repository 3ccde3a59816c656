use super::{Policy, PolicyContext, PolicyError, PolicyResult, shape_error};
use crate::models::EntitlementValue;

/// On/off feature flags.
pub struct BooleanPolicy;

impl Policy for BooleanPolicy {
    fn name(&self) -> &'static str {
        "boolean"
    }

    fn evaluate(&self, ctx: &PolicyContext<'_>) -> Result<PolicyResult, PolicyError> {
        match ctx.value {
            EntitlementValue::Boolean(true) => Ok(PolicyResult::allow()),
            EntitlementValue::Boolean(false) => {
                Ok(PolicyResult::deny("Feature is not enabled for your plan"))
            }
            other => Err(shape_error(self.name(), other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_flag() {
        for (flag, expected) in [(true, true), (false, false)] {
            let value = EntitlementValue::Boolean(flag);
            let result = BooleanPolicy
                .evaluate(&PolicyContext {
                    value: &value,
                    usage: 0.0,
                    required_level: 0,
                })
                .unwrap();
            assert_eq!(result.allowed, expected);
            assert!(result.metadata.is_none());
            assert_eq!(result.reason.is_some(), !expected);
        }
    }
}
