use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use serde::Deserialize;

use super::ErrorResponse;
use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::persistence::{versions, FirmwareVersionRecord};
use crate::validation;

pub fn router() -> Router<AppState> {
    Router::<AppState>::new()
        .route(
            "/api/v1/firmware-versions",
            get(list_versions).put(put_version),
        )
        .route(
            "/api/v1/firmware-versions/{device_prefix}",
            delete(delete_version),
        )
}

#[utoipa::path(
    get,
    path = "/api/v1/firmware-versions",
    responses((status = 200, description = "The operator-maintained latest-version table"))
)]
pub(crate) async fn list_versions(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<FirmwareVersionRecord>>> {
    Ok(Json(versions::list_versions(&state.db).await?))
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub(crate) struct VersionRequest {
    pub device_prefix: String,
    pub latest_version: String,
}

#[utoipa::path(
    put,
    path = "/api/v1/firmware-versions",
    request_body = VersionRequest,
    responses(
        (status = 200, description = "Entry created or replaced"),
        (status = 400, description = "Prefix or version failed validation", body = ErrorResponse)
    )
)]
pub(crate) async fn put_version(
    State(state): State<AppState>,
    Json(body): Json<VersionRequest>,
) -> ApiResult<Json<FirmwareVersionRecord>> {
    let prefix = validation::validate_device_prefix(&body.device_prefix)?;
    let version = validation::validate_firmware_version(&prefix, &body.latest_version)?;

    versions::upsert_version(&state.db, &prefix, &version).await?;
    let record = versions::get_version(&state.db, &prefix)
        .await?
        .ok_or_else(|| anyhow::anyhow!("version upsert did not return row"))?;
    Ok(Json(record))
}

#[utoipa::path(
    delete,
    path = "/api/v1/firmware-versions/{device_prefix}",
    responses(
        (status = 204, description = "Entry removed"),
        (status = 404, description = "Unknown prefix", body = ErrorResponse)
    )
)]
pub(crate) async fn delete_version(
    State(state): State<AppState>,
    Path(device_prefix): Path<String>,
) -> ApiResult<StatusCode> {
    let deleted = versions::delete_version(&state.db, &device_prefix).await?;
    if deleted == 0 {
        return Err(AppError::not_found("unknown device prefix"));
    }
    Ok(StatusCode::NO_CONTENT)
}
