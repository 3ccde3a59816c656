use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Minimal view of a user account. Profiles live elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UserAccount {
    pub user_id: Uuid,
    pub email: String,
    pub role: String,
    pub is_premium: bool,
    pub created_utc: DateTime<Utc>,
}
