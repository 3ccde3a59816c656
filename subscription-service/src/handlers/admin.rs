use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::{
    CreateEntitlementRequest, CreatePlanRequest, EntitlementResponse, PlanRemovalResponse,
    PlanView, SetPlanEntitlementRequest, UpdateEntitlementRequest, UpdatePlanRequest,
};
use crate::startup::AppState;

pub async fn get_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let plan = state.catalog.get_plan(plan_id).await?;
    Ok(Json(PlanView::from(plan)))
}

pub async fn create_plan(
    State(state): State<AppState>,
    Json(req): Json<CreatePlanRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let input = req.into_input(&state.config.gateway.currency)?;
    let plan = state.catalog.create_plan(&input).await?;
    let plan = state.catalog.get_plan(plan.plan_id).await?;
    Ok((StatusCode::CREATED, Json(PlanView::from(plan))))
}

pub async fn update_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<Uuid>,
    Json(req): Json<UpdatePlanRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    state.catalog.update_plan(plan_id, &req.into_input()?).await?;
    let plan = state.catalog.get_plan(plan_id).await?;
    Ok(Json(PlanView::from(plan)))
}

pub async fn delete_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let result = state.catalog.delete_plan(plan_id).await?;
    Ok(Json(PlanRemovalResponse { plan_id, result }))
}

pub async fn set_plan_entitlement(
    State(state): State<AppState>,
    Path((plan_id, entitlement_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<SetPlanEntitlementRequest>,
) -> Result<impl IntoResponse, AppError> {
    let plan = state
        .catalog
        .set_plan_entitlement(plan_id, entitlement_id, &req.value)
        .await?;
    Ok(Json(PlanView::from(plan)))
}

pub async fn remove_plan_entitlement(
    State(state): State<AppState>,
    Path((plan_id, entitlement_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, AppError> {
    state
        .catalog
        .remove_plan_entitlement(plan_id, entitlement_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_entitlement(
    State(state): State<AppState>,
    Json(req): Json<CreateEntitlementRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let entitlement = state.catalog.create_entitlement(&req.into()).await?;
    Ok((
        StatusCode::CREATED,
        Json(EntitlementResponse::from(entitlement)),
    ))
}

pub async fn update_entitlement(
    State(state): State<AppState>,
    Path(entitlement_id): Path<Uuid>,
    Json(req): Json<UpdateEntitlementRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let entitlement = state
        .catalog
        .update_entitlement(entitlement_id, &req.into())
        .await?;
    Ok(Json(EntitlementResponse::from(entitlement)))
}

pub async fn delete_entitlement(
    State(state): State<AppState>,
    Path(entitlement_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state.catalog.delete_entitlement(entitlement_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn run_expiration_job(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.jobs.run_expiration().await?))
}

pub async fn run_cleanup_job(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.jobs.run_cleanup().await?))
}
