pub mod cache;
pub mod catalog;
pub mod clock;
pub mod database;
pub mod entitlements;
pub mod gateway;
pub mod lifecycle;
pub mod memory;
pub mod metrics;
pub mod plan_cache;
pub mod repository;
pub mod scheduler;
pub mod usage;
pub mod webhook;

pub use cache::{CacheKey, CacheStore, MemoryCache, RedisCache};
pub use catalog::{CatalogAdmin, PlanRemoval};
pub use clock::{Clock, ManualClock, SystemClock};
pub use database::Database;
pub use entitlements::{CallMetadata, EntitlementEngine, NO_ACTIVE_SUBSCRIPTION};
pub use gateway::{PaymentGateway, PaystackClient};
pub use lifecycle::{CheckoutSession, LifecycleSettings, SubscriptionLifecycle};
pub use memory::MemoryStore;
pub use plan_cache::{CacheTtls, PlanConfigCache};
pub use repository::{BillingRepository, CatalogRepository, Repositories, UsageRepository};
pub use scheduler::{JobOutcome, JobRunner};
pub use usage::UsageTracker;
pub use webhook::{WebhookEvent, WebhookVerifier};
