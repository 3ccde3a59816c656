//! Shared harness for subscription-service integration tests.
//!
//! Everything runs in-process: `MemoryStore` for storage, `MemoryCache` for
//! the cache port, a scripted gateway and a manual clock.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use service_core::error::AppError;
use subscription_service::config::SubscriptionConfig;
use subscription_service::models::{
    ActivatePayment, ActivationOutcome, BillingInterval, CreateCheckout, CreateEntitlement,
    CreatePlan, EntitlementType, Payment, Subscription, UserAccount,
};
use subscription_service::services::gateway::{
    GatewayError, InitializeTransaction, InitializedTransaction, PaymentGateway,
    TransactionStatus, VerifiedTransaction,
};
use subscription_service::services::{
    BillingRepository, CacheKey, CacheStore, ManualClock, MemoryCache, MemoryStore, Repositories,
};
use subscription_service::startup::AppState;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "sk_test_webhook_secret";
pub const CALLBACK_URL: &str = "https://app.example.com/billing/callback";

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub fn test_config() -> SubscriptionConfig {
    serde_json::from_value(json!({
        "storage": { "backend": "memory" },
        "cache": { "backend": "memory" },
        "webhook": { "secret": WEBHOOK_SECRET },
        "lifecycle": { "activation_timeout_secs": 1 },
        "scheduler": { "enabled": false }
    }))
    .expect("test config")
}

// ---------------------------------------------------------------------------
// Scripted gateway
// ---------------------------------------------------------------------------

/// Gateway double. Remembers what each checkout asked for and, on verify,
/// reports it as paid in full unless told otherwise.
#[derive(Default)]
pub struct MockGateway {
    initialized: Mutex<HashMap<String, InitializeTransaction>>,
    status: Mutex<Option<TransactionStatus>>,
    amount_delta: AtomicI64,
    unavailable: AtomicBool,
    pub verify_calls: AtomicUsize,
}

impl MockGateway {
    pub fn set_status(&self, status: TransactionStatus) {
        *self.status.lock().unwrap() = Some(status);
    }

    /// Report `delta` minor units more (or fewer) than requested.
    pub fn set_amount_delta(&self, delta: i64) {
        self.amount_delta.store(delta, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn initialized(&self, reference: &str) -> Option<InitializeTransaction> {
        self.initialized.lock().unwrap().get(reference).cloned()
    }

    pub fn verify_count(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn initialize_transaction(
        &self,
        request: &InitializeTransaction,
    ) -> Result<InitializedTransaction, GatewayError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("connection refused".into()));
        }
        self.initialized
            .lock()
            .unwrap()
            .insert(request.reference.clone(), request.clone());
        Ok(InitializedTransaction {
            authorization_url: format!("https://checkout.example.com/{}", request.reference),
            access_code: "access".into(),
            reference: request.reference.clone(),
        })
    }

    async fn verify_transaction(
        &self,
        reference: &str,
    ) -> Result<VerifiedTransaction, GatewayError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        // Let concurrent verifications interleave.
        tokio::task::yield_now().await;

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("timed out".into()));
        }
        let request = self
            .initialized(reference)
            .ok_or_else(|| GatewayError::Rejected("Transaction reference not found".into()))?;
        let status = self
            .status
            .lock()
            .unwrap()
            .unwrap_or(TransactionStatus::Success);

        Ok(VerifiedTransaction {
            reference: reference.to_string(),
            status,
            amount: request.amount + self.amount_delta.load(Ordering::SeqCst),
            currency: request.currency,
            paid_at: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Storage and cache doubles
// ---------------------------------------------------------------------------

/// Billing port that delays the activation transaction, before or after it
/// commits, and can fail expiry of one chosen subscription.
pub struct SlowBilling {
    inner: Arc<MemoryStore>,
    delay_ms: AtomicU64,
    delay_after_commit_ms: AtomicU64,
    failing_expiry: Mutex<Option<Uuid>>,
}

impl SlowBilling {
    pub fn new(inner: Arc<MemoryStore>, delay: Duration) -> Self {
        Self {
            inner,
            delay_ms: AtomicU64::new(delay.as_millis() as u64),
            delay_after_commit_ms: AtomicU64::new(0),
            failing_expiry: Mutex::new(None),
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_delay_after_commit(&self, delay: Duration) {
        self.delay_after_commit_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_expiry_for(&self, subscription_id: Uuid) {
        *self.failing_expiry.lock().unwrap() = Some(subscription_id);
    }
}

#[async_trait]
impl BillingRepository for SlowBilling {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserAccount>, AppError> {
        self.inner.get_user(user_id).await
    }

    async fn set_premium(&self, user_id: Uuid, is_premium: bool) -> Result<(), AppError> {
        self.inner.set_premium(user_id, is_premium).await
    }

    async fn get_subscription_by_user(
        &self,
        user_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        self.inner.get_subscription_by_user(user_id).await
    }

    async fn create_checkout(
        &self,
        input: &CreateCheckout,
        now: DateTime<Utc>,
    ) -> Result<Payment, AppError> {
        self.inner.create_checkout(input, now).await
    }

    async fn get_payment(&self, reference: &str) -> Result<Option<Payment>, AppError> {
        self.inner.get_payment(reference).await
    }

    async fn mark_payment_failed(
        &self,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        self.inner.mark_payment_failed(reference, now).await
    }

    async fn activate_payment(
        &self,
        input: &ActivatePayment,
    ) -> Result<ActivationOutcome, AppError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let outcome = self.inner.activate_payment(input).await;
        let delay = self.delay_after_commit_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        outcome
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, AppError> {
        self.inner.set_cancel_at_period_end(subscription_id, now).await
    }

    async fn schedule_plan_change(
        &self,
        subscription_id: Uuid,
        pending_plan_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, AppError> {
        self.inner
            .schedule_plan_change(subscription_id, pending_plan_id, now)
            .await
    }

    async fn find_expired_subscriptions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, AppError> {
        self.inner.find_expired_subscriptions(now).await
    }

    async fn expire_subscription(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        if *self.failing_expiry.lock().unwrap() == Some(subscription_id) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "expiry failed for {subscription_id}"
            )));
        }
        self.inner.expire_subscription(subscription_id, now).await
    }

    async fn apply_scheduled_downgrade(
        &self,
        subscription_id: Uuid,
        plan_id: Uuid,
        current_period_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        self.inner
            .apply_scheduled_downgrade(subscription_id, plan_id, current_period_end, now)
            .await
    }

    async fn expire_abandoned_payments(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        self.inner.expire_abandoned_payments(cutoff, now).await
    }
}

/// Cache whose every operation fails, as when Redis is down.
#[derive(Default)]
pub struct FailingCache;

#[async_trait]
impl CacheStore for FailingCache {
    async fn get(&self, _key: &CacheKey) -> Result<Option<String>, anyhow::Error> {
        Err(anyhow::anyhow!("cache unreachable"))
    }

    async fn set(&self, _key: &CacheKey, _value: &str, _ttl: Duration) -> Result<(), anyhow::Error> {
        Err(anyhow::anyhow!("cache unreachable"))
    }

    async fn delete(&self, _key: &CacheKey) -> Result<(), anyhow::Error> {
        Err(anyhow::anyhow!("cache unreachable"))
    }

    async fn try_lock(
        &self,
        _key: &CacheKey,
        _token: &str,
        _ttl: Duration,
    ) -> Result<bool, anyhow::Error> {
        Err(anyhow::anyhow!("cache unreachable"))
    }

    async fn release_lock(&self, _key: &CacheKey, _token: &str) -> Result<bool, anyhow::Error> {
        Err(anyhow::anyhow!("cache unreachable"))
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Err(anyhow::anyhow!("cache unreachable"))
    }
}

// ---------------------------------------------------------------------------
// Test application
// ---------------------------------------------------------------------------

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub cache: Arc<dyn CacheStore>,
    pub memory_cache: Option<Arc<MemoryCache>>,
    pub gateway: Arc<MockGateway>,
    pub clock: Arc<ManualClock>,
    entitlements: Mutex<HashMap<String, Uuid>>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: SubscriptionConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        Self::assemble(
            config,
            Repositories::from_store(store.clone()),
            store,
            cache.clone(),
            Some(cache),
        )
    }

    /// Fallback plan served to users without a subscription.
    pub fn with_fallback(plan_name: &str) -> Self {
        let mut config = test_config();
        config.entitlements.fallback_plan = Some(plan_name.to_string());
        Self::with_config(config)
    }

    pub fn with_slow_billing(delay: Duration) -> (Self, Arc<SlowBilling>) {
        let store = Arc::new(MemoryStore::new());
        let billing = Arc::new(SlowBilling::new(store.clone(), delay));
        let repos = Repositories {
            usage: store.clone(),
            catalog: store.clone(),
            billing: billing.clone(),
        };
        let cache = Arc::new(MemoryCache::new());
        let app = Self::assemble(test_config(), repos, store, cache.clone(), Some(cache));
        (app, billing)
    }

    pub fn with_failing_cache() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::assemble(
            test_config(),
            Repositories::from_store(store.clone()),
            store,
            Arc::new(FailingCache),
            None,
        )
    }

    fn assemble(
        config: SubscriptionConfig,
        repos: Repositories,
        store: Arc<MemoryStore>,
        cache: Arc<dyn CacheStore>,
        memory_cache: Option<Arc<MemoryCache>>,
    ) -> Self {
        let gateway = Arc::new(MockGateway::default());
        let clock = Arc::new(ManualClock::new(start_time()));
        let state = AppState::new(config, repos, cache.clone(), gateway.clone(), clock.clone());
        Self {
            state,
            store,
            cache,
            memory_cache,
            gateway,
            clock,
            entitlements: Mutex::new(HashMap::new()),
        }
    }

    pub fn seed_user(&self) -> Uuid {
        self.seed_user_with_role("user")
    }

    pub fn seed_user_with_role(&self, role: &str) -> Uuid {
        let user_id = Uuid::new_v4();
        self.store.insert_user(UserAccount {
            user_id,
            email: format!("{}@example.com", user_id.simple()),
            role: role.to_string(),
            is_premium: false,
            created_utc: start_time(),
        });
        user_id
    }

    /// Create the entitlement for `feature_key` on first use, then reuse it.
    pub async fn entitlement(&self, feature_key: &str, kind: EntitlementType) -> Uuid {
        if let Some(id) = self.entitlements.lock().unwrap().get(feature_key) {
            return *id;
        }
        let created = self
            .state
            .catalog
            .create_entitlement(&CreateEntitlement {
                feature_key: feature_key.to_string(),
                name: feature_key.replace('_', " "),
                description: None,
                entitlement_type: kind,
            })
            .await
            .expect("create entitlement");
        self.entitlements
            .lock()
            .unwrap()
            .insert(feature_key.to_string(), created.entitlement_id);
        created.entitlement_id
    }

    /// A monthly plan priced in major units with the given feature values.
    pub async fn seed_plan(
        &self,
        name: &str,
        price: &str,
        features: &[(&str, EntitlementType, Value)],
    ) -> Uuid {
        let plan = self
            .state
            .catalog
            .create_plan(&CreatePlan {
                name: name.to_string(),
                description: None,
                price: price.parse::<Decimal>().expect("price"),
                currency: "NGN".to_string(),
                billing_interval: BillingInterval::Monthly,
            })
            .await
            .expect("create plan");

        for (key, kind, value) in features {
            let entitlement_id = self.entitlement(key, *kind).await;
            self.state
                .catalog
                .set_plan_entitlement(plan.plan_id, entitlement_id, value)
                .await
                .expect("set plan entitlement");
        }
        plan.plan_id
    }

    /// Checkout and verify through the lifecycle, as a paying user would.
    pub async fn subscribe(&self, user_id: Uuid, plan_id: Uuid) -> Subscription {
        let session = self
            .state
            .lifecycle
            .checkout(user_id, plan_id, CALLBACK_URL)
            .await
            .expect("checkout");
        self.state
            .lifecycle
            .verify_and_activate(&session.reference, Some(user_id))
            .await
            .expect("activation")
    }

    pub async fn checkout(&self, user_id: Uuid, plan_id: Uuid) -> String {
        self.state
            .lifecycle
            .checkout(user_id, plan_id, CALLBACK_URL)
            .await
            .expect("checkout")
            .reference
    }

    pub async fn payment(&self, reference: &str) -> Payment {
        self.store
            .get_payment(reference)
            .await
            .unwrap()
            .expect("payment exists")
    }

    pub async fn subscription(&self, user_id: Uuid) -> Option<Subscription> {
        self.store.get_subscription_by_user(user_id).await.unwrap()
    }

    pub async fn user(&self, user_id: Uuid) -> UserAccount {
        self.store.get_user(user_id).await.unwrap().expect("user exists")
    }
}

pub fn counter(limit: f64) -> Value {
    json!(limit)
}

pub fn frequency(limit: u32, window: &str) -> Value {
    json!({ "limit": limit, "window": window })
}
