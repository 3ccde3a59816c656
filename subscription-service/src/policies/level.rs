use super::{Policy, PolicyContext, PolicyError, PolicyResult, shape_error};
use crate::models::EntitlementValue;

/// Tiered access: the plan value is the user's level, the call site states the
/// level it requires.
pub struct LevelPolicy;

impl Policy for LevelPolicy {
    fn name(&self) -> &'static str {
        "level"
    }

    fn evaluate(&self, ctx: &PolicyContext<'_>) -> Result<PolicyResult, PolicyError> {
        let EntitlementValue::Level(level) = ctx.value else {
            return Err(shape_error(self.name(), ctx.value));
        };

        if *level >= ctx.required_level {
            Ok(PolicyResult::allow())
        } else {
            Ok(PolicyResult::deny(format!(
                "Requires level {}, your plan provides level {}",
                ctx.required_level, level
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluate(level: i64, required: i64) -> PolicyResult {
        let value = EntitlementValue::Level(level);
        LevelPolicy
            .evaluate(&PolicyContext {
                value: &value,
                usage: 0.0,
                required_level: required,
            })
            .unwrap()
    }

    #[test]
    fn compares_against_required_level() {
        assert!(evaluate(2, 2).allowed);
        assert!(evaluate(3, 2).allowed);
        assert!(!evaluate(1, 2).allowed);
    }

    #[test]
    fn zero_requirement_admits_any_level() {
        assert!(evaluate(0, 0).allowed);
    }
}
