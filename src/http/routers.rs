use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::error;
use uuid::Uuid;

use super::ErrorResponse;
use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::events::SCAN_JOB_ID;
use crate::persistence::{history, routers, HistoryRecord, NewRouter, RouterRecord, RouterStatus};
use crate::services::scan;
use crate::validation;

pub fn router() -> Router<AppState> {
    Router::<AppState>::new()
        .route(
            "/api/v1/routers",
            get(list_routers).delete(delete_routers),
        )
        .route("/api/v1/routers/stats", get(router_stats))
        .route("/api/v1/routers/import", post(import_routers))
        .route("/api/v1/routers/scan", post(scan_routers))
        .route("/api/v1/routers/{router_id}/history", get(router_history))
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListQuery {
    status: Option<RouterStatus>,
}

#[utoipa::path(
    get,
    path = "/api/v1/routers",
    responses((status = 200, description = "All routers, optionally filtered by status"))
)]
pub(crate) async fn list_routers(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<RouterRecord>>> {
    let records = match query.status {
        Some(status) => routers::list_routers_by_status(&state.db, status).await?,
        None => routers::list_routers(&state.db).await?,
    };
    Ok(Json(records))
}

#[utoipa::path(
    get,
    path = "/api/v1/routers/stats",
    responses((status = 200, description = "Router counts per status"))
)]
pub(crate) async fn router_stats(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let counts = routers::count_by_status(&state.db).await?;
    let total: i64 = counts.iter().map(|(_, count)| count).sum();
    let by_status: HashMap<String, i64> = counts
        .into_iter()
        .filter_map(|(status, count)| {
            serde_json::to_value(status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .map(|key| (key, count))
        })
        .collect();
    Ok(Json(serde_json::json!({
        "total": total,
        "by_status": by_status,
    })))
}

/// One validated inventory record, as handed over by the ingest pipeline.
#[derive(Debug, Clone, Deserialize, utoipa::ToSchema)]
pub(crate) struct ImportRouter {
    pub id: Option<Uuid>,
    pub device_name: String,
    pub ip_address: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/v1/routers/import",
    request_body = Vec<ImportRouter>,
    responses(
        (status = 200, description = "Records upserted in one transaction"),
        (status = 400, description = "A record failed validation", body = ErrorResponse)
    )
)]
pub(crate) async fn import_routers(
    State(state): State<AppState>,
    Json(body): Json<Vec<ImportRouter>>,
) -> ApiResult<Json<serde_json::Value>> {
    if body.is_empty() {
        return Err(AppError::bad_request("no router records provided"));
    }

    let mut new_routers = Vec::with_capacity(body.len());
    for record in body {
        let device_name = validation::validate_device_name(&record.device_name)?;
        let ip_address = validation::validate_ip_address(&record.ip_address)?;
        new_routers.push(NewRouter {
            id: record.id.unwrap_or_else(Uuid::new_v4),
            device_name,
            ip_address,
            username: record.username.filter(|value| !value.trim().is_empty()),
            password: record.password.filter(|value| !value.is_empty()),
        });
    }

    let imported = routers::insert_routers(&state.db, &new_routers).await?;
    Ok(Json(serde_json::json!({ "imported": imported })))
}

#[utoipa::path(
    delete,
    path = "/api/v1/routers",
    responses((status = 200, description = "Inventory cleared; update history is retained"))
)]
pub(crate) async fn delete_routers(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let deleted = routers::delete_all_routers(&state.db).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub(crate) struct ScanRequest {
    #[serde(default)]
    pub router_ids: Option<Vec<Uuid>>,
}

#[utoipa::path(
    post,
    path = "/api/v1/routers/scan",
    request_body = ScanRequest,
    responses((status = 202, description = "Scan started; progress streams under job id `check`"))
)]
pub(crate) async fn scan_routers(
    State(state): State<AppState>,
    Json(body): Json<ScanRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let task_state = state.clone();
    tokio::spawn(async move {
        if let Err(err) = scan::run_scan(&task_state, body.router_ids).await {
            error!(?err, "inventory scan failed");
        }
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "job_id": SCAN_JOB_ID })),
    ))
}

#[utoipa::path(
    get,
    path = "/api/v1/routers/{router_id}/history",
    responses(
        (status = 200, description = "Update attempts for one router, newest first"),
        (status = 404, description = "Unknown router", body = ErrorResponse)
    )
)]
pub(crate) async fn router_history(
    State(state): State<AppState>,
    Path(router_id): Path<Uuid>,
) -> ApiResult<Json<Vec<HistoryRecord>>> {
    if routers::get_router(&state.db, router_id).await?.is_none() {
        return Err(AppError::not_found("router not found"));
    }
    let records = history::list_for_router(&state.db, router_id).await?;
    Ok(Json(records))
}
