use axum::{Json, Router};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::app_state::AppState;

mod events;
mod routers;
mod rollouts;
mod settings;
mod system;
mod versions;

#[derive(Debug, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "fwfleet",
        description = "Batched firmware rollout control plane for SSH-managed router fleets"
    ),
    paths(
        system::healthz,
        routers::list_routers,
        routers::router_stats,
        routers::import_routers,
        routers::delete_routers,
        routers::scan_routers,
        routers::router_history,
        settings::get_credentials,
        settings::put_credentials,
        settings::get_batch_wait,
        settings::put_batch_wait,
        versions::list_versions,
        versions::put_version,
        versions::delete_version,
        rollouts::start_rollout,
        rollouts::list_rollouts,
        rollouts::get_rollout,
        rollouts::cancel_rollout,
        rollouts::recent_history,
    ),
    components(schemas(
        ErrorResponse,
        routers::ImportRouter,
        routers::ScanRequest,
        settings::CredentialsRequest,
        settings::BatchWaitRequest,
        versions::VersionRequest,
        rollouts::StartRolloutRequest,
    ))
)]
pub struct ApiDoc;

pub fn build_router() -> Router<AppState> {
    Router::<AppState>::new()
        .merge(system::router())
        .merge(routers::router())
        .merge(settings::router())
        .merge(versions::router())
        .merge(rollouts::router())
        .merge(events::router())
        .route(
            "/api/v1/openapi.json",
            axum::routing::get(|| async { Json(ApiDoc::openapi()) }),
        )
        .layer(TraceLayer::new_for_http())
}
