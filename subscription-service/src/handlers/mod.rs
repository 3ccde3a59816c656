pub mod admin;
pub mod entitlements;
pub mod health;
pub mod subscription;
pub mod webhook;

pub use entitlements::{check_entitlement, check_entitlements};
pub use health::{health_check, metrics, readiness_check};
pub use subscription::{cancel, checkout, current_plan, downgrade, list_plans, verify};
pub use webhook::handle_webhook;
