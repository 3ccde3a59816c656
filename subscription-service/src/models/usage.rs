//! Usage model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Running counter for one (user, feature) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UsageRecord {
    pub user_id: Uuid,
    pub feature_key: String,
    pub value: f64,
    pub reset_at: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl UsageRecord {
    /// Value as seen at `now`. A record past its reset time reads as zero
    /// until the next write re-arms it.
    pub fn effective_value(&self, now: DateTime<Utc>) -> f64 {
        if self.reset_at <= now { 0.0 } else { self.value }
    }
}

/// One consumption of a frequency-limited feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UsageEvent {
    pub event_id: Uuid,
    pub user_id: Uuid,
    pub feature_key: String,
    pub amount: f64,
    pub created_utc: DateTime<Utc>,
}
