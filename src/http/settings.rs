use axum::{
    extract::State,
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use super::ErrorResponse;
use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::persistence::settings;

pub fn router() -> Router<AppState> {
    Router::<AppState>::new()
        .route(
            "/api/v1/settings/credentials",
            get(get_credentials).put(put_credentials),
        )
        .route(
            "/api/v1/settings/batch-wait",
            get(get_batch_wait).put(put_batch_wait),
        )
}

#[utoipa::path(
    get,
    path = "/api/v1/settings/credentials",
    responses((status = 200, description = "Global username and whether a password is stored"))
)]
pub(crate) async fn get_credentials(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let username = settings::get_setting(&state.db, settings::KEY_GLOBAL_USERNAME).await?;
    let configured = settings::global_credentials(&state.db).await?.is_some();
    Ok(Json(serde_json::json!({
        "username": username,
        "configured": configured,
    })))
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub(crate) struct CredentialsRequest {
    pub username: String,
    pub password: String,
}

#[utoipa::path(
    put,
    path = "/api/v1/settings/credentials",
    request_body = CredentialsRequest,
    responses(
        (status = 204, description = "Credentials stored"),
        (status = 400, description = "Empty username or password", body = ErrorResponse)
    )
)]
pub(crate) async fn put_credentials(
    State(state): State<AppState>,
    Json(body): Json<CredentialsRequest>,
) -> ApiResult<StatusCode> {
    let username = body.username.trim();
    if username.is_empty() {
        return Err(AppError::bad_request("username cannot be empty"));
    }
    if body.password.is_empty() {
        return Err(AppError::bad_request("password cannot be empty"));
    }
    settings::set_global_credentials(&state.db, username, &body.password).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/api/v1/settings/batch-wait",
    responses((status = 200, description = "Minutes to pause between rollout batches"))
)]
pub(crate) async fn get_batch_wait(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let minutes = settings::batch_wait_minutes(&state.db).await?;
    Ok(Json(serde_json::json!({ "minutes": minutes })))
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub(crate) struct BatchWaitRequest {
    pub minutes: u32,
}

#[utoipa::path(
    put,
    path = "/api/v1/settings/batch-wait",
    request_body = BatchWaitRequest,
    responses((status = 204, description = "Pause length stored"))
)]
pub(crate) async fn put_batch_wait(
    State(state): State<AppState>,
    Json(body): Json<BatchWaitRequest>,
) -> ApiResult<StatusCode> {
    settings::set_batch_wait_minutes(&state.db, body.minutes).await?;
    Ok(StatusCode::NO_CONTENT)
}
