//! Payment gateway port and the Paystack client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::GatewayConfig;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Transport failure, timeout or 5xx. Safe to retry.
    #[error("payment gateway unavailable: {0}")]
    Unavailable(String),
    /// The gateway answered and refused the request.
    #[error("payment gateway rejected the request: {0}")]
    Rejected(String),
}

/// Request to start a hosted checkout.
#[derive(Debug, Clone, Serialize)]
pub struct InitializeTransaction {
    pub email: String,
    /// Amount in the minor currency unit.
    pub amount: i64,
    pub currency: String,
    pub reference: String,
    pub callback_url: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitializedTransaction {
    pub authorization_url: String,
    pub access_code: String,
    pub reference: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Success,
    Failed,
    Abandoned,
    /// Anything still in flight (`ongoing`, `pending`, `processing`, ...).
    Pending,
}

impl TransactionStatus {
    pub fn from_string(s: &str) -> Self {
        match s {
            "success" => TransactionStatus::Success,
            "failed" => TransactionStatus::Failed,
            "abandoned" => TransactionStatus::Abandoned,
            _ => TransactionStatus::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifiedTransaction {
    pub reference: String,
    pub status: TransactionStatus,
    /// Amount paid in the minor currency unit.
    pub amount: i64,
    pub currency: String,
    pub paid_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initialize_transaction(
        &self,
        request: &InitializeTransaction,
    ) -> Result<InitializedTransaction, GatewayError>;

    async fn verify_transaction(&self, reference: &str)
    -> Result<VerifiedTransaction, GatewayError>;
}

/// Paystack response envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct VerifyData {
    reference: String,
    status: String,
    amount: i64,
    currency: String,
    paid_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct PaystackClient {
    client: Client,
    base_url: String,
    secret_key: Secret<String>,
}

impl PaystackClient {
    pub fn new(config: &GatewayConfig) -> Result<Self, anyhow::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            secret_key: config.secret_key.clone(),
        })
    }

    pub fn is_configured(&self) -> bool {
        !self.secret_key.expose_secret().is_empty()
    }

    async fn read_envelope<T: DeserializeOwned>(
        response: reqwest::Response,
        operation: &str,
    ) -> Result<T, GatewayError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        tracing::debug!(status = %status, operation, "Paystack response");

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            tracing::error!(status = %status, operation, "Paystack unavailable");
            return Err(GatewayError::Unavailable(format!("HTTP {}", status)));
        }

        let envelope: Envelope<T> = serde_json::from_str(&body).map_err(|e| {
            tracing::error!(status = %status, operation, error = %e, "Unreadable Paystack response");
            if status.is_success() {
                GatewayError::Unavailable(format!("unreadable response: {}", e))
            } else {
                GatewayError::Rejected(format!("HTTP {}", status))
            }
        })?;

        if !status.is_success() || !envelope.status {
            tracing::warn!(status = %status, operation, message = %envelope.message, "Paystack refused request");
            return Err(GatewayError::Rejected(envelope.message));
        }

        envelope
            .data
            .ok_or_else(|| GatewayError::Rejected(format!("{}: empty response", operation)))
    }
}

fn transport_error(e: reqwest::Error) -> GatewayError {
    tracing::error!(error = %e, "Paystack request failed");
    GatewayError::Unavailable(e.to_string())
}

#[async_trait]
impl PaymentGateway for PaystackClient {
    async fn initialize_transaction(
        &self,
        request: &InitializeTransaction,
    ) -> Result<InitializedTransaction, GatewayError> {
        if !self.is_configured() {
            return Err(GatewayError::Unavailable(
                "Paystack credentials not configured".to_string(),
            ));
        }

        let url = format!("{}/transaction/initialize", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.secret_key.expose_secret())
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;

        let initialized: InitializedTransaction =
            Self::read_envelope(response, "initialize").await?;

        tracing::info!(
            reference = %initialized.reference,
            amount = request.amount,
            currency = %request.currency,
            "Paystack transaction initialized"
        );
        Ok(initialized)
    }

    async fn verify_transaction(
        &self,
        reference: &str,
    ) -> Result<VerifiedTransaction, GatewayError> {
        if !self.is_configured() {
            return Err(GatewayError::Unavailable(
                "Paystack credentials not configured".to_string(),
            ));
        }

        let url = format!("{}/transaction/verify/{}", self.base_url, reference);
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.secret_key.expose_secret())
            .send()
            .await
            .map_err(transport_error)?;

        let data: VerifyData = Self::read_envelope(response, "verify").await?;

        Ok(VerifiedTransaction {
            status: TransactionStatus::from_string(&data.status),
            reference: data.reference,
            amount: data.amount,
            currency: data.currency,
            paid_at: data.paid_at,
        })
    }
}
