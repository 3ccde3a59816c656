//! Domain models for subscription-service.

mod entitlement;
mod payment;
mod plan;
mod subscription;
mod usage;
mod user;

pub use entitlement::{
    CreateEntitlement, Entitlement, EntitlementType, EntitlementValue, FrequencyLimit,
    PlanEntitlementRow, UpdateEntitlement, ValueShapeError,
};
pub use payment::{
    ActivatePayment, ActivationOutcome, CreateCheckout, Payment, PaymentStatus,
};
pub use plan::{
    ActivePlan, BillingInterval, CreatePlan, Plan, PlanFeature, PlanWithEntitlements, UpdatePlan,
};
pub use subscription::{Subscription, SubscriptionStatus};
pub use usage::{UsageEvent, UsageRecord};
pub use user::UserAccount;
