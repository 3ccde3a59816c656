use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use service_core::error::AppError;
use validator::Validate;

use crate::dtos::{CheckEntitlementsRequest, CheckEntitlementsResponse, EntitlementQuery};
use crate::middleware::UserContext;
use crate::services::CallMetadata;
use crate::startup::AppState;

pub async fn check_entitlement(
    State(state): State<AppState>,
    user: UserContext,
    Path(feature_key): Path<String>,
    Query(query): Query<EntitlementQuery>,
) -> Result<impl IntoResponse, AppError> {
    let result = state
        .engine
        .authorize(
            user.user_id,
            &feature_key,
            CallMetadata {
                required_level: query.required_level,
            },
        )
        .await?;
    Ok(Json(result))
}

pub async fn check_entitlements(
    State(state): State<AppState>,
    user: UserContext,
    Json(req): Json<CheckEntitlementsRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let results = state.engine.authorize_many(user.user_id, &req.keys).await?;
    Ok(Json(CheckEntitlementsResponse { results }))
}
