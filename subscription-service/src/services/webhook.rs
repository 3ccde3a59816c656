//! Webhook authentication and event decoding.

use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use service_core::error::AppError;
use service_core::utils::verify_payload_signature;

pub const SIGNATURE_HEADER: &str = "x-paystack-signature";

#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Secret<String>,
}

impl WebhookVerifier {
    pub fn new(secret: Secret<String>) -> Self {
        Self { secret }
    }

    /// Check the provider signature over the exact raw body. A missing
    /// signature, a bad one, or an unset secret is rejected.
    pub fn verify(&self, body: &[u8], signature: Option<&str>) -> Result<(), AppError> {
        let secret = self.secret.expose_secret();
        if secret.is_empty() {
            tracing::error!("Webhook secret is not configured; rejecting webhook");
            return Err(AppError::Unauthorized(anyhow::anyhow!(
                "Invalid webhook signature"
            )));
        }

        let Some(signature) = signature.filter(|s| !s.trim().is_empty()) else {
            tracing::warn!("Webhook received without signature");
            return Err(AppError::Unauthorized(anyhow::anyhow!(
                "Missing webhook signature"
            )));
        };

        if verify_payload_signature(secret.as_bytes(), body, signature)? {
            Ok(())
        } else {
            tracing::warn!("Webhook signature verification failed");
            Err(AppError::Unauthorized(anyhow::anyhow!(
                "Invalid webhook signature"
            )))
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    event: String,
    #[serde(default)]
    data: Option<RawEventData>,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    reference: Option<String>,
}

/// Provider events the service acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    ChargeSuccess { reference: String },
    ChargeFailed { reference: String },
    Other(String),
}

impl WebhookEvent {
    pub fn parse(body: &[u8]) -> Result<Self, AppError> {
        let raw: RawEvent = serde_json::from_slice(body)
            .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Malformed webhook body: {}", e)))?;
        let reference = raw.data.and_then(|d| d.reference);

        match (raw.event.as_str(), reference) {
            ("charge.success", Some(reference)) => Ok(WebhookEvent::ChargeSuccess { reference }),
            ("charge.failed", Some(reference)) => Ok(WebhookEvent::ChargeFailed { reference }),
            ("charge.success" | "charge.failed", None) => Err(AppError::BadRequest(
                anyhow::anyhow!("Webhook event '{}' has no reference", raw.event),
            )),
            (other, _) => Ok(WebhookEvent::Other(other.to_string())),
        }
    }
}
