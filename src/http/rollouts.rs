use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use super::ErrorResponse;
use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::persistence::{history, jobs, HistoryListRow, JobRecord};
use crate::services::rollout::{self, StartRollout};
use crate::validation;

const DEFAULT_HISTORY_LIMIT: u32 = 50;
const MAX_HISTORY_LIMIT: u32 = 500;

pub fn router() -> Router<AppState> {
    Router::<AppState>::new()
        .route("/api/v1/rollouts", post(start_rollout).get(list_rollouts))
        .route("/api/v1/rollouts/{job_id}", get(get_rollout))
        .route("/api/v1/rollouts/{job_id}/cancel", post(cancel_rollout))
        .route("/api/v1/history", get(recent_history))
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub(crate) struct StartRolloutRequest {
    #[serde(default)]
    pub router_ids: Option<Vec<Uuid>>,
    pub batch_size: u32,
    #[serde(default)]
    pub include_errors: bool,
}

#[utoipa::path(
    post,
    path = "/api/v1/rollouts",
    request_body = StartRolloutRequest,
    responses(
        (status = 202, description = "Rollout started in the background"),
        (status = 400, description = "Invalid batch size or empty candidate set", body = ErrorResponse),
        (status = 409, description = "Another rollout is already active", body = ErrorResponse)
    )
)]
pub(crate) async fn start_rollout(
    State(state): State<AppState>,
    Json(body): Json<StartRolloutRequest>,
) -> ApiResult<(StatusCode, Json<JobRecord>)> {
    let batch_size = validation::validate_batch_size(body.batch_size)?;
    let job = rollout::start_rollout(
        &state,
        StartRollout {
            router_ids: body.router_ids,
            batch_size,
            include_errors: body.include_errors,
        },
    )
    .await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

#[utoipa::path(
    get,
    path = "/api/v1/rollouts",
    responses((status = 200, description = "All rollout jobs, newest first"))
)]
pub(crate) async fn list_rollouts(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<JobRecord>>> {
    Ok(Json(jobs::list_jobs(&state.db).await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/rollouts/{job_id}",
    responses(
        (status = 200, description = "One rollout job"),
        (status = 404, description = "Unknown job", body = ErrorResponse)
    )
)]
pub(crate) async fn get_rollout(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobRecord>> {
    let job = jobs::get_job(&state.db, job_id)
        .await?
        .ok_or_else(|| AppError::not_found("rollout not found"))?;
    Ok(Json(job))
}

#[utoipa::path(
    post,
    path = "/api/v1/rollouts/{job_id}/cancel",
    responses(
        (status = 200, description = "Cancellation requested; in-flight routers finish naturally"),
        (status = 404, description = "Unknown job", body = ErrorResponse),
        (status = 409, description = "Job already finished", body = ErrorResponse)
    )
)]
pub(crate) async fn cancel_rollout(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobRecord>> {
    let job = rollout::cancel_rollout(&state, job_id).await?;
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryQuery {
    router_id: Option<Uuid>,
    limit: Option<u32>,
}

#[utoipa::path(
    get,
    path = "/api/v1/history",
    responses((status = 200, description = "Recent update attempts joined with router identity, optionally scoped to one router"))
)]
pub(crate) async fn recent_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<HistoryListRow>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    let rows = match query.router_id {
        Some(router_id) => history::list_recent_for_router(&state.db, router_id, limit).await?,
        None => history::list_recent(&state.db, limit).await?,
    };
    Ok(Json(rows))
}
