//! Event tracking and user identity routes. These endpoints mirror the
//! fire-and-forget contract of the manager: a tracking call always answers
//! with a success envelope, even while the integration is degraded.

use axum::{
    Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::Value;
use ts_rs::TS;
use utils::response::ApiResponse;

use services::services::manager::ManagerStatus;

use crate::{error::ApiError, state::AppState};

#[derive(Debug, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct TrackEventRequest {
    pub event_name: String,
    #[serde(default)]
    pub properties: Option<serde_json::Map<String, Value>>,
}

/// Track an application event. Never fails the caller.
pub async fn track_event(
    State(state): State<AppState>,
    axum::Json(request): axum::Json<TrackEventRequest>,
) -> ResponseJson<ApiResponse<()>> {
    if let Some(manager) = &state.manager {
        manager
            .track(&request.event_name, request.properties)
            .await;
    }
    ResponseJson(ApiResponse::success(()))
}

/// Associate the session with a user. Switching users resets the previous
/// session first.
pub async fn set_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    if user_id.trim().is_empty() {
        return Err(ApiError::BadRequest("user id must not be empty".into()));
    }
    if let Some(manager) = &state.manager {
        manager.set_user_id(&user_id).await;
    }
    Ok(ResponseJson(ApiResponse::success(())))
}

#[derive(Debug, Deserialize, TS)]
pub struct SetAttributesRequest {
    pub attributes: serde_json::Map<String, Value>,
}

pub async fn set_user_attributes(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    axum::Json(request): axum::Json<SetAttributesRequest>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    if user_id.trim().is_empty() {
        return Err(ApiError::BadRequest("user id must not be empty".into()));
    }
    if let Some(manager) = &state.manager {
        manager.set_user_id(&user_id).await;
        manager.set_attributes(request.attributes).await;
    }
    Ok(ResponseJson(ApiResponse::success(())))
}

/// Log the current user out and clear session state.
pub async fn logout_user(State(state): State<AppState>) -> ResponseJson<ApiResponse<()>> {
    if let Some(manager) = &state.manager {
        manager.logout_user().await;
    }
    ResponseJson(ApiResponse::success(()))
}

/// Notify the SDK of a client-side navigation so no-code actions can
/// re-evaluate against the new page.
pub async fn route_change(State(state): State<AppState>) -> ResponseJson<ApiResponse<()>> {
    if let Some(manager) = &state.manager {
        manager.register_route_change().await;
    }
    ResponseJson(ApiResponse::success(()))
}

/// Manager status snapshot, mainly for health checks and debugging.
pub async fn get_status(
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<ManagerStatus>>, ApiError> {
    let manager = state.manager.as_ref().ok_or(ApiError::FeatureDisabled)?;
    Ok(ResponseJson(ApiResponse::success(manager.status().await)))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/events", post(track_event))
        .route("/users/{user_id}", post(set_user))
        .route("/users/{user_id}/attributes", post(set_user_attributes))
        .route("/users", delete(logout_user))
        .route("/route-change", post(route_change))
        .route("/status", get(get_status))
}
