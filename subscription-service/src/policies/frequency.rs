use std::time::Duration;

use super::{
    Policy, PolicyContext, PolicyError, PolicyMetadata, PolicyResult, format_amount, shape_error,
};
use crate::models::EntitlementValue;

/// Window used when the configured one cannot be parsed.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3600);

/// Parse a compact window such as `30s`, `15m`, `1h`, `7d` or bare seconds.
/// Anything else, including zero, falls back to one hour.
pub fn parse_window(raw: &str) -> Duration {
    let raw = raw.trim();
    let (digits, unit) = match raw.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => (&raw[..idx], Some(c.to_ascii_lowercase())),
        _ => (raw, None),
    };

    let Ok(amount) = digits.parse::<u64>() else {
        return DEFAULT_WINDOW;
    };

    let multiplier = match unit {
        None | Some('s') => 1,
        Some('m') => 60,
        Some('h') => 3_600,
        Some('d') => 86_400,
        Some(_) => return DEFAULT_WINDOW,
    };

    match amount.checked_mul(multiplier) {
        Some(secs) if secs > 0 => Duration::from_secs(secs),
        _ => DEFAULT_WINDOW,
    }
}

/// Sliding-window rate limit: at most `limit` events per `window`. The caller
/// supplies the event count inside the window as usage.
pub struct FrequencyPolicy;

impl Policy for FrequencyPolicy {
    fn name(&self) -> &'static str {
        "frequency"
    }

    fn evaluate(&self, ctx: &PolicyContext<'_>) -> Result<PolicyResult, PolicyError> {
        let EntitlementValue::Frequency(config) = ctx.value else {
            return Err(shape_error(self.name(), ctx.value));
        };
        let limit = f64::from(config.limit);
        let window = parse_window(&config.window);
        let used = ctx.usage;

        let metadata = PolicyMetadata {
            limit,
            used,
            remaining: (limit - used).max(0.0),
            window_seconds: Some(window.as_secs()),
        };

        let result = if used < limit {
            PolicyResult::allow()
        } else {
            PolicyResult::deny(format!(
                "Rate limit of {} per {} reached",
                format_amount(limit),
                config.window
            ))
        };

        Ok(result.with_metadata(metadata))
    }
}
