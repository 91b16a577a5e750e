#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use tower::ServiceExt;

use fwfleet::{
    app_state::AppState,
    config::{RolloutConfig, SshConfig},
    events::EventBus,
    fota::SshFirmwareProbe,
    http::build_router,
    metrics::init_metrics_recorder,
    persistence::migrations,
    services::rollout::RolloutRegistry,
};

pub async fn setup_app() -> (Router, AppState) {
    let db = migrations::init_pool("sqlite::memory:")
        .await
        .expect("test pool");
    migrations::run_migrations(&db).await.expect("migrations");

    let state = AppState {
        db,
        events: EventBus::new(),
        rollouts: RolloutRegistry::default(),
        probe: Arc::new(SshFirmwareProbe::new(SshConfig::default())),
        rollout: RolloutConfig::default(),
        metrics_handle: init_metrics_recorder(),
    };
    (build_router().with_state(state.clone()), state)
}

pub async fn request_json(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            builder
                .body(Body::from(value.to_string()))
                .expect("request")
        }
        None => builder.body(Body::empty()).expect("request"),
    };

    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

pub async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    request_json(app, "GET", uri, None).await
}
