//! Subscription and entitlement service: decides whether a user may use a
//! feature under their plan, meters usage, and keeps subscription and payment
//! state consistent with the payment provider.

pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod policies;
pub mod services;
pub mod startup;

pub use startup::{AppState, Application, build_router};
