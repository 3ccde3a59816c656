pub mod entitlement;
pub mod identity;

pub use entitlement::{EntitlementGate, enforce_entitlement};
pub use identity::{ADMIN_ROLE, USER_ID_HEADER, USER_ROLE_HEADER, UserContext, require_admin};
