use std::collections::BTreeMap;

use axum::{Json, extract::State, response::IntoResponse};
use service_core::error::AppError;
use validator::Validate;

use crate::dtos::{
    CancelResponse, CheckoutRequest, CheckoutResponse, CurrentPlanResponse, DowngradeRequest,
    FeatureUsageView, PlanView, SubscriptionView, VerifyRequest,
};
use crate::middleware::UserContext;
use crate::services::NO_ACTIVE_SUBSCRIPTION;
use crate::startup::AppState;

pub async fn checkout(
    State(state): State<AppState>,
    user: UserContext,
    Json(req): Json<CheckoutRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;

    let session = state
        .lifecycle
        .checkout(user.user_id, req.plan_id, &req.callback_url)
        .await?;

    Ok(Json(CheckoutResponse {
        authorization_url: session.authorization_url,
        reference: session.reference,
    }))
}

pub async fn verify(
    State(state): State<AppState>,
    user: UserContext,
    Json(req): Json<VerifyRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;

    let subscription = state
        .lifecycle
        .verify_and_activate(req.reference.trim(), Some(user.user_id))
        .await?;

    Ok(Json(SubscriptionView::from(subscription)))
}

pub async fn cancel(
    State(state): State<AppState>,
    user: UserContext,
) -> Result<impl IntoResponse, AppError> {
    let subscription = state.lifecycle.cancel_subscription(user.user_id).await?;
    let message = match subscription.current_period_end {
        Some(end) => format!(
            "Subscription will not renew; access continues until {}",
            end.to_rfc3339()
        ),
        None => "Subscription will not renew".to_string(),
    };

    Ok(Json(CancelResponse {
        message,
        subscription: subscription.into(),
    }))
}

pub async fn downgrade(
    State(state): State<AppState>,
    user: UserContext,
    Json(req): Json<DowngradeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let subscription = state
        .lifecycle
        .schedule_downgrade(user.user_id, req.plan_id)
        .await?;
    Ok(Json(SubscriptionView::from(subscription)))
}

pub async fn list_plans(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let plans = state.catalog.list_active_plans().await?;
    Ok(Json(
        plans.into_iter().map(PlanView::from).collect::<Vec<_>>(),
    ))
}

/// The caller's plan with a live decision for every feature it grants.
pub async fn current_plan(
    State(state): State<AppState>,
    user: UserContext,
) -> Result<impl IntoResponse, AppError> {
    let active = state
        .engine
        .plans()
        .get_user_active_plan(user.user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!(NO_ACTIVE_SUBSCRIPTION)))?;

    let keys: Vec<String> = active
        .plan
        .features
        .iter()
        .map(|f| f.feature_key.clone())
        .collect();
    let usage: BTreeMap<String, FeatureUsageView> = state
        .engine
        .authorize_many(user.user_id, &keys)
        .await?
        .into_iter()
        .map(|(key, result)| {
            (
                key,
                FeatureUsageView {
                    allowed: result.allowed,
                    reason: result.reason,
                    metadata: result.metadata,
                },
            )
        })
        .collect();

    Ok(Json(CurrentPlanResponse {
        subscription: active.subscription.map(SubscriptionView::from),
        plan: active.plan.into(),
        usage,
    }))
}
