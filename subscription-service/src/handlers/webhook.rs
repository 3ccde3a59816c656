use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde_json::json;
use service_core::error::AppError;
use tracing::{info, warn};

use crate::services::WebhookEvent;
use crate::services::webhook::SIGNATURE_HEADER;
use crate::startup::AppState;

/// Provider notifications. The signature is checked over the raw body before
/// anything is parsed; a bad one is rejected with 401.
///
/// Errors that may clear on retry are returned as 5xx so the provider
/// redelivers. Events for unknown references are acknowledged.
pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    state.verifier.verify(&body, signature)?;

    match WebhookEvent::parse(&body)? {
        WebhookEvent::ChargeSuccess { reference } => {
            match state.lifecycle.verify_and_activate(&reference, None).await {
                Ok(subscription) => {
                    info!(
                        reference = %reference,
                        subscription_id = %subscription.subscription_id,
                        "Webhook activation processed"
                    );
                }
                Err(AppError::NotFound(e)) => {
                    warn!(reference = %reference, error = %e, "Webhook for unknown payment");
                }
                Err(e) if e.is_retryable() => return Err(e),
                Err(AppError::BadRequest(e)) => {
                    warn!(reference = %reference, error = %e, "Webhook payment not activated");
                }
                Err(e) => return Err(e),
            }
        }
        WebhookEvent::ChargeFailed { reference } => {
            match state.lifecycle.record_failed_payment(&reference).await {
                Ok(changed) => info!(reference = %reference, changed, "Webhook payment failure recorded"),
                Err(AppError::NotFound(e)) => {
                    warn!(reference = %reference, error = %e, "Webhook for unknown payment");
                }
                Err(e) => return Err(e),
            }
        }
        WebhookEvent::Other(event) => {
            info!(event = %event, "Ignoring webhook event");
        }
    }

    Ok((StatusCode::OK, Json(json!({ "received": true }))))
}
