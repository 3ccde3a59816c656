use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    middleware::from_fn,
    routing::{get, patch, post, put},
};
use chrono::Duration as ChronoDuration;
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::{http_metrics_middleware, request_id_middleware};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{CacheBackend, StorageBackend, SubscriptionConfig};
use crate::handlers::{self, admin};
use crate::middleware::{EntitlementGate, require_admin};
use crate::services::{
    CacheStore, CatalogAdmin, Clock, Database, EntitlementEngine, JobRunner, LifecycleSettings,
    MemoryCache, MemoryStore, PaymentGateway, PaystackClient, PlanConfigCache, RedisCache,
    Repositories, SubscriptionLifecycle, SystemClock, UsageTracker, WebhookVerifier,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SubscriptionConfig>,
    pub repos: Repositories,
    pub cache: Arc<dyn CacheStore>,
    pub engine: EntitlementEngine,
    pub lifecycle: SubscriptionLifecycle,
    pub catalog: CatalogAdmin,
    pub jobs: JobRunner,
    pub verifier: WebhookVerifier,
}

impl AppState {
    /// Wire the services over the given storage, cache, gateway and clock.
    pub fn new(
        config: SubscriptionConfig,
        repos: Repositories,
        cache: Arc<dyn CacheStore>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let usage = UsageTracker::new(repos.usage.clone(), clock.clone());
        let plans = PlanConfigCache::new(
            repos.catalog.clone(),
            repos.billing.clone(),
            cache.clone(),
            config.cache.ttls(),
            config.entitlements.fallback_plan.clone(),
        );
        let engine = EntitlementEngine::new(
            plans.clone(),
            usage.clone(),
            config.entitlements.serialize_consumption,
        );

        let settings = LifecycleSettings {
            activation_timeout: config.activation_timeout(),
            abandoned_after: ChronoDuration::hours(config.lifecycle.abandoned_payment_hours),
            event_retention: ChronoDuration::days(config.lifecycle.event_retention_days),
        };
        let lifecycle = SubscriptionLifecycle::new(
            repos.billing.clone(),
            repos.catalog.clone(),
            gateway,
            plans.clone(),
            usage,
            clock,
            settings,
        );

        let catalog = CatalogAdmin::new(repos.catalog.clone(), plans);
        let jobs = JobRunner::new(
            lifecycle.clone(),
            cache.clone(),
            Duration::from_secs(config.scheduler.lock_ttl_secs),
        );
        let verifier = WebhookVerifier::new(config.webhook.secret.clone());

        Self {
            config: Arc::new(config),
            repos,
            cache,
            engine,
            lifecycle,
            catalog,
            jobs,
            verifier,
        }
    }

    /// A gate for `feature_key` honouring the configured bypass roles.
    pub fn entitlement_gate(&self, feature_key: &str) -> EntitlementGate {
        EntitlementGate::new(self.engine.clone(), feature_key)
            .with_bypass_roles(self.config.entitlements.bypass_roles.clone())
    }
}

pub fn build_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/plans", post(admin::create_plan))
        .route(
            "/plans/:plan_id",
            get(admin::get_plan)
                .patch(admin::update_plan)
                .delete(admin::delete_plan),
        )
        .route(
            "/plans/:plan_id/entitlements/:entitlement_id",
            put(admin::set_plan_entitlement).delete(admin::remove_plan_entitlement),
        )
        .route("/entitlements", post(admin::create_entitlement))
        .route(
            "/entitlements/:entitlement_id",
            patch(admin::update_entitlement).delete(admin::delete_entitlement),
        )
        .route(
            "/jobs/expire-subscriptions",
            post(admin::run_expiration_job),
        )
        .route("/jobs/cleanup-payments", post(admin::run_cleanup_job))
        .route_layer(from_fn(require_admin));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics))
        .route("/subscription/checkout", post(handlers::checkout))
        .route("/subscription/verify", post(handlers::verify))
        .route("/subscription/webhook", post(handlers::handle_webhook))
        .route("/subscription/cancel", post(handlers::cancel))
        .route("/subscription/downgrade", post(handlers::downgrade))
        .route("/subscription/plans", get(handlers::list_plans))
        .route("/subscription/current-plan", get(handlers::current_plan))
        .route("/entitlements/check", post(handlers::check_entitlements))
        .route("/entitlements/:feature_key", get(handlers::check_entitlement))
        .nest("/admin", admin_routes)
        .layer(from_fn(http_metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(request_id_middleware))
        .layer(cors)
        .with_state(state)
}

pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
    state: AppState,
    scheduler: Vec<JoinHandle<()>>,
}

impl Application {
    pub async fn build(config: SubscriptionConfig) -> Result<Self, AppError> {
        let repos = match config.storage.backend {
            StorageBackend::Postgres => {
                let db = Database::new(
                    config.storage.database_url.expose_secret(),
                    config.storage.max_connections,
                    config.storage.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!("Failed to connect to database: {}", e);
                    e
                })?;
                db.run_migrations().await?;
                Repositories::from_store(Arc::new(db))
            }
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory storage; state is lost on restart");
                Repositories::from_store(Arc::new(MemoryStore::new()))
            }
        };

        let cache: Arc<dyn CacheStore> = match config.cache.backend {
            CacheBackend::Redis => Arc::new(
                RedisCache::new(config.cache.redis_url.expose_secret())
                    .await
                    .map_err(|e| {
                        tracing::error!("Failed to connect to Redis: {}", e);
                        AppError::InternalError(e)
                    })?,
            ),
            CacheBackend::Memory => Arc::new(MemoryCache::new()),
        };

        let gateway = PaystackClient::new(&config.gateway)?;
        if !gateway.is_configured() {
            tracing::warn!("gateway.secret_key is not set; checkouts will fail");
        }

        let state = AppState::new(
            config.clone(),
            repos,
            cache,
            Arc::new(gateway),
            Arc::new(SystemClock),
        );

        let scheduler = if config.scheduler.enabled {
            state.jobs.clone().spawn(&config.scheduler)
        } else {
            tracing::info!("Scheduler disabled");
            Vec::new()
        };

        let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
            .parse()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Invalid server address: {}", e)))?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Listening on {}", port);

        Ok(Self {
            port,
            listener,
            router: build_router(state.clone()),
            state,
            scheduler,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until `shutdown` resolves, then stop the scheduler.
    pub async fn run_until_stopped<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let result = axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await;

        for handle in self.scheduler {
            handle.abort();
        }
        result
    }
}
