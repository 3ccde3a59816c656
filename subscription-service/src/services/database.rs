//! Postgres implementation of the storage ports.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use super::metrics::DB_QUERY_DURATION;
use super::repository::{BillingRepository, CatalogRepository, UsageRepository};
use crate::models::{
    ActivatePayment, ActivationOutcome, CreateCheckout, CreateEntitlement, CreatePlan,
    Entitlement, Payment, Plan, PlanEntitlementRow, Subscription, UpdateEntitlement, UpdatePlan,
    UsageRecord, UserAccount,
};

/// Bounds for the activation transaction. A stuck row lock fails the
/// transaction instead of holding a pool connection indefinitely.
const ACTIVATION_LOCK_TIMEOUT: &str = "SET LOCAL lock_timeout = '5s'";
const ACTIVATION_STATEMENT_TIMEOUT: &str = "SET LOCAL statement_timeout = '10s'";

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

/// Unique violations become conflicts; anything else is a database error.
fn write_error(context: &str, what: &str, e: sqlx::Error) -> AppError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::Conflict(anyhow::anyhow!("{} already exists", what))
        }
        _ => db_error(context, e),
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "subscription-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| db_error("Failed to connect", e))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

// =========================================================================
// Usage Operations
// =========================================================================

#[async_trait]
impl UsageRepository for Database {
    #[instrument(skip(self))]
    async fn usage_value(
        &self,
        user_id: Uuid,
        feature_key: &str,
        now: DateTime<Utc>,
    ) -> Result<f64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["usage_value"])
            .start_timer();

        let value = sqlx::query_scalar::<_, f64>(
            r#"
            SELECT CASE WHEN reset_at <= $3 THEN 0::DOUBLE PRECISION ELSE value END
            FROM usage_records
            WHERE user_id = $1 AND feature_key = $2
            "#,
        )
        .bind(user_id)
        .bind(feature_key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to read usage", e))?;

        timer.observe_duration();
        Ok(value.unwrap_or(0.0))
    }

    #[instrument(skip(self))]
    async fn increment_usage(
        &self,
        user_id: Uuid,
        feature_key: &str,
        amount: f64,
        now: DateTime<Utc>,
        reset_at: DateTime<Utc>,
    ) -> Result<f64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["increment_usage"])
            .start_timer();

        let value = sqlx::query_scalar::<_, f64>(
            r#"
            INSERT INTO usage_records (user_id, feature_key, value, reset_at, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (user_id, feature_key) DO UPDATE SET
                value = CASE
                    WHEN usage_records.reset_at <= $5 THEN EXCLUDED.value
                    ELSE usage_records.value + EXCLUDED.value
                END,
                reset_at = CASE
                    WHEN usage_records.reset_at <= $5 THEN EXCLUDED.reset_at
                    ELSE usage_records.reset_at
                END,
                updated_utc = $5
            RETURNING value
            "#,
        )
        .bind(user_id)
        .bind(feature_key)
        .bind(amount)
        .bind(reset_at)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to increment usage", e))?;

        timer.observe_duration();
        Ok(value)
    }

    #[instrument(skip(self))]
    async fn decrement_usage(
        &self,
        user_id: Uuid,
        feature_key: &str,
        amount: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<f64>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["decrement_usage"])
            .start_timer();

        let value = sqlx::query_scalar::<_, f64>(
            r#"
            UPDATE usage_records
            SET value = value - $3, updated_utc = $4
            WHERE user_id = $1 AND feature_key = $2
            RETURNING value
            "#,
        )
        .bind(user_id)
        .bind(feature_key)
        .bind(amount)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to decrement usage", e))?;

        timer.observe_duration();
        Ok(value)
    }

    #[instrument(skip(self))]
    async fn reset_usage(
        &self,
        user_id: Uuid,
        feature_key: &str,
        now: DateTime<Utc>,
        reset_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["reset_usage"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO usage_records (user_id, feature_key, value, reset_at, created_utc, updated_utc)
            VALUES ($1, $2, 0, $3, $4, $4)
            ON CONFLICT (user_id, feature_key) DO UPDATE SET
                value = 0, reset_at = EXCLUDED.reset_at, updated_utc = EXCLUDED.updated_utc
            "#,
        )
        .bind(user_id)
        .bind(feature_key)
        .bind(reset_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to reset usage", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reset_all_usage(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        reset_at: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["reset_all_usage"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE usage_records
            SET value = 0, reset_at = $2, updated_utc = $3
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(reset_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to reset usage", e))?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn list_usage(&self, user_id: Uuid) -> Result<Vec<UsageRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_usage"])
            .start_timer();

        let records = sqlx::query_as::<_, UsageRecord>(
            r#"
            SELECT user_id, feature_key, value, reset_at, created_utc, updated_utc
            FROM usage_records
            WHERE user_id = $1
            ORDER BY feature_key
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list usage", e))?;

        timer.observe_duration();
        Ok(records)
    }

    #[instrument(skip(self))]
    async fn record_event(
        &self,
        user_id: Uuid,
        feature_key: &str,
        amount: f64,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_event"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO usage_events (event_id, user_id, feature_key, amount, created_utc)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(feature_key)
        .bind(amount)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to record usage event", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn sum_events_since(
        &self,
        user_id: Uuid,
        feature_key: &str,
        since: DateTime<Utc>,
    ) -> Result<f64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["sum_events_since"])
            .start_timer();

        let total = sqlx::query_scalar::<_, f64>(
            r#"
            SELECT COALESCE(SUM(amount), 0)::DOUBLE PRECISION
            FROM usage_events
            WHERE user_id = $1 AND feature_key = $2 AND created_utc >= $3
            "#,
        )
        .bind(user_id)
        .bind(feature_key)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to sum usage events", e))?;

        timer.observe_duration();
        Ok(total)
    }

    #[instrument(skip(self))]
    async fn prune_events_before(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["prune_events"])
            .start_timer();

        let result = sqlx::query("DELETE FROM usage_events WHERE created_utc < $1")
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to prune usage events", e))?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }
}

// =========================================================================
// Catalog Operations
// =========================================================================

#[async_trait]
impl CatalogRepository for Database {
    #[instrument(skip(self))]
    async fn ping(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Health check failed", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_plan"])
            .start_timer();

        let plan = sqlx::query_as::<_, Plan>(
            r#"
            SELECT plan_id, name, description, price, currency, billing_interval, is_active, created_utc, updated_utc
            FROM plans
            WHERE plan_id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get plan", e))?;

        timer.observe_duration();
        Ok(plan)
    }

    #[instrument(skip(self))]
    async fn find_plan_by_name(&self, name: &str) -> Result<Option<Plan>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_plan_by_name"])
            .start_timer();

        let plan = sqlx::query_as::<_, Plan>(
            r#"
            SELECT plan_id, name, description, price, currency, billing_interval, is_active, created_utc, updated_utc
            FROM plans
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to find plan", e))?;

        timer.observe_duration();
        Ok(plan)
    }

    #[instrument(skip(self))]
    async fn list_active_plans(&self) -> Result<Vec<Plan>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_active_plans"])
            .start_timer();

        let plans = sqlx::query_as::<_, Plan>(
            r#"
            SELECT plan_id, name, description, price, currency, billing_interval, is_active, created_utc, updated_utc
            FROM plans
            WHERE is_active = TRUE
            ORDER BY price, name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list plans", e))?;

        timer.observe_duration();
        Ok(plans)
    }

    #[instrument(skip(self))]
    async fn plan_entitlements(&self, plan_id: Uuid) -> Result<Vec<PlanEntitlementRow>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["plan_entitlements"])
            .start_timer();

        let rows = sqlx::query_as::<_, PlanEntitlementRow>(
            r#"
            SELECT pe.plan_id, pe.entitlement_id, e.feature_key, e.name, e.entitlement_type, pe.value, pe.position
            FROM plan_entitlements pe
            JOIN entitlements e ON e.entitlement_id = pe.entitlement_id
            WHERE pe.plan_id = $1
            ORDER BY pe.position, e.feature_key
            "#,
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load plan entitlements", e))?;

        timer.observe_duration();
        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn get_entitlement(
        &self,
        entitlement_id: Uuid,
    ) -> Result<Option<Entitlement>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_entitlement"])
            .start_timer();

        let entitlement = sqlx::query_as::<_, Entitlement>(
            r#"
            SELECT entitlement_id, feature_key, name, description, entitlement_type, created_utc, updated_utc
            FROM entitlements
            WHERE entitlement_id = $1
            "#,
        )
        .bind(entitlement_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get entitlement", e))?;

        timer.observe_duration();
        Ok(entitlement)
    }

    #[instrument(skip(self, input), fields(name = %input.name))]
    async fn create_plan(&self, input: &CreatePlan) -> Result<Plan, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_plan"])
            .start_timer();

        let plan = sqlx::query_as::<_, Plan>(
            r#"
            INSERT INTO plans (plan_id, name, description, price, currency, billing_interval)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING plan_id, name, description, price, currency, billing_interval, is_active, created_utc, updated_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.name)
        .bind(&input.description)
        .bind(input.price)
        .bind(&input.currency)
        .bind(input.billing_interval.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| write_error("Failed to create plan", &format!("Plan '{}'", input.name), e))?;

        timer.observe_duration();
        Ok(plan)
    }

    #[instrument(skip(self, input))]
    async fn update_plan(
        &self,
        plan_id: Uuid,
        input: &UpdatePlan,
    ) -> Result<Option<Plan>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_plan"])
            .start_timer();

        let plan = sqlx::query_as::<_, Plan>(
            r#"
            UPDATE plans SET
                name = COALESCE($2, name),
                description = COALESCE($3, description),
                price = COALESCE($4, price),
                billing_interval = COALESCE($5, billing_interval),
                is_active = COALESCE($6, is_active),
                updated_utc = NOW()
            WHERE plan_id = $1
            RETURNING plan_id, name, description, price, currency, billing_interval, is_active, created_utc, updated_utc
            "#,
        )
        .bind(plan_id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(input.price)
        .bind(input.billing_interval.map(|i| i.as_str()))
        .bind(input.is_active)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| write_error("Failed to update plan", "Plan name", e))?;

        timer.observe_duration();
        Ok(plan)
    }

    #[instrument(skip(self))]
    async fn delete_plan(&self, plan_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_plan"])
            .start_timer();

        let result = sqlx::query("DELETE FROM plans WHERE plan_id = $1")
            .bind(plan_id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to delete plan", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn plan_in_use(&self, plan_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["plan_in_use"])
            .start_timer();

        let in_use = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM subscriptions WHERE plan_id = $1 OR pending_plan_id = $1
            ) OR EXISTS (
                SELECT 1 FROM payments WHERE plan_id = $1
            )
            "#,
        )
        .bind(plan_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to check plan references", e))?;

        timer.observe_duration();
        Ok(in_use)
    }

    #[instrument(skip(self, input), fields(feature_key = %input.feature_key))]
    async fn create_entitlement(
        &self,
        input: &CreateEntitlement,
    ) -> Result<Entitlement, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_entitlement"])
            .start_timer();

        let entitlement = sqlx::query_as::<_, Entitlement>(
            r#"
            INSERT INTO entitlements (entitlement_id, feature_key, name, description, entitlement_type)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING entitlement_id, feature_key, name, description, entitlement_type, created_utc, updated_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.feature_key)
        .bind(&input.name)
        .bind(&input.description)
        .bind(input.entitlement_type.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            write_error(
                "Failed to create entitlement",
                &format!("Entitlement '{}'", input.feature_key),
                e,
            )
        })?;

        timer.observe_duration();
        Ok(entitlement)
    }

    #[instrument(skip(self, input))]
    async fn update_entitlement(
        &self,
        entitlement_id: Uuid,
        input: &UpdateEntitlement,
    ) -> Result<Option<Entitlement>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_entitlement"])
            .start_timer();

        let entitlement = sqlx::query_as::<_, Entitlement>(
            r#"
            UPDATE entitlements SET
                name = COALESCE($2, name),
                description = COALESCE($3, description),
                entitlement_type = COALESCE($4, entitlement_type),
                updated_utc = NOW()
            WHERE entitlement_id = $1
            RETURNING entitlement_id, feature_key, name, description, entitlement_type, created_utc, updated_utc
            "#,
        )
        .bind(entitlement_id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(input.entitlement_type.map(|t| t.as_str()))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to update entitlement", e))?;

        timer.observe_duration();
        Ok(entitlement)
    }

    #[instrument(skip(self))]
    async fn delete_entitlement(&self, entitlement_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_entitlement"])
            .start_timer();

        // plan_entitlements rows go with it (ON DELETE CASCADE).
        let result = sqlx::query("DELETE FROM entitlements WHERE entitlement_id = $1")
            .bind(entitlement_id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to delete entitlement", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, value))]
    async fn set_plan_entitlement(
        &self,
        plan_id: Uuid,
        entitlement_id: Uuid,
        value: &Value,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_plan_entitlement"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO plan_entitlements (plan_id, entitlement_id, value, position)
            VALUES (
                $1, $2, $3,
                (SELECT COALESCE(MAX(position) + 1, 0) FROM plan_entitlements WHERE plan_id = $1)
            )
            ON CONFLICT (plan_id, entitlement_id) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(plan_id)
        .bind(entitlement_id)
        .bind(sqlx::types::Json(value))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to set plan entitlement", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_plan_entitlement(
        &self,
        plan_id: Uuid,
        entitlement_id: Uuid,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["remove_plan_entitlement"])
            .start_timer();

        let result = sqlx::query(
            "DELETE FROM plan_entitlements WHERE plan_id = $1 AND entitlement_id = $2",
        )
        .bind(plan_id)
        .bind(entitlement_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to remove plan entitlement", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn plans_with_entitlement(&self, entitlement_id: Uuid) -> Result<Vec<Uuid>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["plans_with_entitlement"])
            .start_timer();

        let plan_ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT plan_id FROM plan_entitlements WHERE entitlement_id = $1",
        )
        .bind(entitlement_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list plans for entitlement", e))?;

        timer.observe_duration();
        Ok(plan_ids)
    }
}

// =========================================================================
// Billing Operations
// =========================================================================

#[async_trait]
impl BillingRepository for Database {
    #[instrument(skip(self))]
    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserAccount>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_user"])
            .start_timer();

        let user = sqlx::query_as::<_, UserAccount>(
            "SELECT user_id, email, role, is_premium, created_utc FROM users WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get user", e))?;

        timer.observe_duration();
        Ok(user)
    }

    #[instrument(skip(self))]
    async fn set_premium(&self, user_id: Uuid, is_premium: bool) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_premium"])
            .start_timer();

        sqlx::query("UPDATE users SET is_premium = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(is_premium)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to update premium flag", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_subscription_by_user(
        &self,
        user_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription_by_user"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT subscription_id, user_id, plan_id, status, current_period_end, cancel_at_period_end, pending_plan_id, created_utc, updated_utc
            FROM subscriptions
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get subscription", e))?;

        timer.observe_duration();
        Ok(subscription)
    }

    #[instrument(skip(self, input), fields(user_id = %input.user_id, reference = %input.reference))]
    async fn create_checkout(
        &self,
        input: &CreateCheckout,
        now: DateTime<Utc>,
    ) -> Result<Payment, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_checkout"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        // The no-op update makes RETURNING yield the existing row's id.
        let subscription_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO subscriptions (subscription_id, user_id, plan_id, status, created_utc, updated_utc)
            VALUES ($1, $2, $3, 'pending', $4, $4)
            ON CONFLICT (user_id) DO UPDATE SET updated_utc = subscriptions.updated_utc
            RETURNING subscription_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.user_id)
        .bind(input.plan_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to create placeholder subscription", e))?;

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments (payment_id, reference, user_id, subscription_id, plan_id, amount, currency, status, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, $8)
            RETURNING payment_id, reference, user_id, subscription_id, plan_id, amount, currency, status, paid_at, created_utc, updated_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.reference)
        .bind(input.user_id)
        .bind(subscription_id)
        .bind(input.plan_id)
        .bind(input.amount)
        .bind(&input.currency)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| write_error("Failed to create payment", "Payment reference", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit checkout", e))?;

        timer.observe_duration();
        Ok(payment)
    }

    #[instrument(skip(self))]
    async fn get_payment(&self, reference: &str) -> Result<Option<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_payment"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            SELECT payment_id, reference, user_id, subscription_id, plan_id, amount, currency, status, paid_at, created_utc, updated_utc
            FROM payments
            WHERE reference = $1
            "#,
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get payment", e))?;

        timer.observe_duration();
        Ok(payment)
    }

    #[instrument(skip(self))]
    async fn mark_payment_failed(
        &self,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_payment_failed"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE payments SET status = 'failed', updated_utc = $2
            WHERE reference = $1 AND status = 'pending'
            "#,
        )
        .bind(reference)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to mark payment failed", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, input), fields(reference = %input.reference))]
    async fn activate_payment(
        &self,
        input: &ActivatePayment,
    ) -> Result<ActivationOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["activate_payment"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        for statement in [ACTIVATION_LOCK_TIMEOUT, ACTIVATION_STATEMENT_TIMEOUT] {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("Failed to bound activation transaction", e))?;
        }

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            SELECT payment_id, reference, user_id, subscription_id, plan_id, amount, currency, status, paid_at, created_utc, updated_utc
            FROM payments
            WHERE reference = $1
            FOR UPDATE
            "#,
        )
        .bind(&input.reference)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to lock payment", e))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment {} not found", input.reference)))?;

        if payment.is_successful() {
            let subscription = sqlx::query_as::<_, Subscription>(
                r#"
                SELECT subscription_id, user_id, plan_id, status, current_period_end, cancel_at_period_end, pending_plan_id, created_utc, updated_utc
                FROM subscriptions
                WHERE user_id = $1
                "#,
            )
            .bind(payment.user_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to load subscription", e))?
            .ok_or_else(|| {
                AppError::InternalError(anyhow::anyhow!(
                    "Payment {} succeeded without a subscription",
                    payment.reference
                ))
            })?;

            tx.commit()
                .await
                .map_err(|e| db_error("Failed to commit activation", e))?;
            timer.observe_duration();
            return Ok(ActivationOutcome::AlreadyProcessed(subscription));
        }

        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions (subscription_id, user_id, plan_id, status, current_period_end, cancel_at_period_end, pending_plan_id, created_utc, updated_utc)
            VALUES ($1, $2, $3, 'active', $4, FALSE, NULL, $5, $5)
            ON CONFLICT (user_id) DO UPDATE SET
                plan_id = EXCLUDED.plan_id,
                status = 'active',
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = FALSE,
                pending_plan_id = NULL,
                updated_utc = EXCLUDED.updated_utc
            RETURNING subscription_id, user_id, plan_id, status, current_period_end, cancel_at_period_end, pending_plan_id, created_utc, updated_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(payment.user_id)
        .bind(payment.plan_id)
        .bind(input.current_period_end)
        .bind(input.paid_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to activate subscription", e))?;

        sqlx::query(
            r#"
            UPDATE payments
            SET status = 'success', paid_at = $2, subscription_id = $3, updated_utc = $2
            WHERE reference = $1
            "#,
        )
        .bind(&input.reference)
        .bind(input.paid_at)
        .bind(subscription.subscription_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to mark payment successful", e))?;

        sqlx::query("UPDATE users SET is_premium = TRUE WHERE user_id = $1")
            .bind(payment.user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to update premium flag", e))?;

        sqlx::query(
            r#"
            UPDATE usage_records
            SET value = 0, reset_at = $2, updated_utc = $3
            WHERE user_id = $1
            "#,
        )
        .bind(payment.user_id)
        .bind(input.usage_reset_at)
        .bind(input.paid_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to reset usage", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit activation", e))?;

        timer.observe_duration();
        Ok(ActivationOutcome::Activated(subscription))
    }

    #[instrument(skip(self))]
    async fn set_cancel_at_period_end(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["cancel_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions SET cancel_at_period_end = TRUE, updated_utc = $2
            WHERE subscription_id = $1
            RETURNING subscription_id, user_id, plan_id, status, current_period_end, cancel_at_period_end, pending_plan_id, created_utc, updated_utc
            "#,
        )
        .bind(subscription_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to cancel subscription", e))?;

        timer.observe_duration();
        Ok(subscription)
    }

    #[instrument(skip(self))]
    async fn schedule_plan_change(
        &self,
        subscription_id: Uuid,
        pending_plan_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["schedule_plan_change"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions SET pending_plan_id = $2, updated_utc = $3
            WHERE subscription_id = $1
            RETURNING subscription_id, user_id, plan_id, status, current_period_end, cancel_at_period_end, pending_plan_id, created_utc, updated_utc
            "#,
        )
        .bind(subscription_id)
        .bind(pending_plan_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to schedule plan change", e))?;

        timer.observe_duration();
        Ok(subscription)
    }

    #[instrument(skip(self))]
    async fn find_expired_subscriptions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_expired_subscriptions"])
            .start_timer();

        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT subscription_id, user_id, plan_id, status, current_period_end, cancel_at_period_end, pending_plan_id, created_utc, updated_utc
            FROM subscriptions
            WHERE status = 'active' AND current_period_end < $1
            ORDER BY current_period_end
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to find expired subscriptions", e))?;

        timer.observe_duration();
        Ok(subscriptions)
    }

    #[instrument(skip(self))]
    async fn expire_subscription(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["expire_subscription"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        let locked = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT subscription_id FROM subscriptions
            WHERE subscription_id = $1 AND status = 'active' AND current_period_end < $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(subscription_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to lock subscription", e))?;

        if locked.is_none() {
            tx.rollback()
                .await
                .map_err(|e| db_error("Failed to roll back", e))?;
            timer.observe_duration();
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'expired', pending_plan_id = NULL, updated_utc = $2
            WHERE subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to expire subscription", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit expiration", e))?;

        timer.observe_duration();
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn apply_scheduled_downgrade(
        &self,
        subscription_id: Uuid,
        plan_id: Uuid,
        current_period_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_scheduled_downgrade"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                plan_id = $2,
                pending_plan_id = NULL,
                cancel_at_period_end = FALSE,
                current_period_end = $3,
                updated_utc = $4
            WHERE subscription_id = $1 AND status = 'active' AND pending_plan_id = $2
            "#,
        )
        .bind(subscription_id)
        .bind(plan_id)
        .bind(current_period_end)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to apply scheduled downgrade", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn expire_abandoned_payments(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["expire_abandoned_payments"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        let expired = sqlx::query(
            r#"
            UPDATE payments SET status = 'failed', updated_utc = $2
            WHERE status = 'pending' AND created_utc < $1
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to expire abandoned payments", e))?
        .rows_affected();

        sqlx::query(
            r#"
            DELETE FROM subscriptions s
            WHERE s.status = 'pending'
              AND NOT EXISTS (
                  SELECT 1 FROM payments p
                  WHERE p.user_id = s.user_id AND p.status IN ('pending', 'success')
              )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to remove placeholder subscriptions", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit cleanup", e))?;

        timer.observe_duration();
        Ok(expired)
    }
}
