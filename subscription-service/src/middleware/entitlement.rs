//! Route guard that checks, and optionally consumes, an entitlement before
//! the handler runs.
//!
//! ```ignore
//! let gate = EntitlementGate::new(engine, "quiz").consuming(1.0);
//! Router::new()
//!     .route("/quiz", post(generate_quiz))
//!     .route_layer(from_fn_with_state(gate, enforce_entitlement));
//! ```

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use service_core::error::AppError;
use tracing::debug;

use super::identity::{ADMIN_ROLE, UserContext};
use crate::policies::PolicyResult;
use crate::services::{CallMetadata, EntitlementEngine};

#[derive(Clone)]
pub struct EntitlementGate {
    engine: EntitlementEngine,
    pub feature_key: String,
    pub consume: bool,
    pub amount: f64,
    pub bypass_roles: Arc<Vec<String>>,
}

impl EntitlementGate {
    /// A check-only gate; admins bypass it.
    pub fn new(engine: EntitlementEngine, feature_key: impl Into<String>) -> Self {
        Self {
            engine,
            feature_key: feature_key.into(),
            consume: false,
            amount: 1.0,
            bypass_roles: Arc::new(vec![ADMIN_ROLE.to_string()]),
        }
    }

    pub fn consuming(mut self, amount: f64) -> Self {
        self.consume = true;
        self.amount = amount;
        self
    }

    pub fn with_bypass_roles(mut self, roles: Vec<String>) -> Self {
        self.bypass_roles = Arc::new(roles);
        self
    }
}

/// Deny with 403 and the policy's reason, or pass the [`PolicyResult`] on to
/// the handler through request extensions.
pub async fn enforce_entitlement(
    State(gate): State<EntitlementGate>,
    user: UserContext,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if user.has_any_role(&gate.bypass_roles) {
        debug!(user_id = %user.user_id, role = %user.role, feature_key = %gate.feature_key, "Entitlement bypassed");
        request.extensions_mut().insert(PolicyResult::allow());
        return Ok(next.run(request).await);
    }

    let result = if gate.consume {
        gate.engine
            .authorize_and_consume(user.user_id, &gate.feature_key, gate.amount)
            .await?
    } else {
        gate.engine
            .authorize(user.user_id, &gate.feature_key, CallMetadata::default())
            .await?
    };

    if !result.allowed {
        let reason = result
            .reason
            .unwrap_or_else(|| format!("Access to '{}' denied", gate.feature_key));
        return Err(AppError::Forbidden(anyhow::anyhow!(reason)));
    }

    request.extensions_mut().insert(result);
    Ok(next.run(request).await)
}
