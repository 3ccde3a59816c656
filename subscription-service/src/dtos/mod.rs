pub mod admin;
pub mod entitlements;
pub mod subscription;

pub use admin::{
    CreateEntitlementRequest, CreatePlanRequest, EntitlementResponse, PlanRemovalResponse,
    SetPlanEntitlementRequest, UpdateEntitlementRequest, UpdatePlanRequest,
};
pub use entitlements::{CheckEntitlementsRequest, CheckEntitlementsResponse, EntitlementQuery};
pub use subscription::{
    CancelResponse, CheckoutRequest, CheckoutResponse, CurrentPlanResponse, DowngradeRequest,
    FeatureUsageView, FeatureView, PlanView, SubscriptionView, VerifyRequest,
};
