//! Event stream gateway: forwards bus events to a subscriber over a
//! long-lived Server-Sent Events connection.
//!
//! Each event goes out as one `event: <type>` / `data: <json>` frame. The
//! subscription is scoped to a job when the client passes `job_id`, global
//! otherwise. Dropping the connection drops the subscription; clients
//! reconnect on their own (dashboards use a ~3 s backoff).

use std::convert::Infallible;

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures_util::{stream, Stream, StreamExt};
use serde::Deserialize;

use crate::app_state::AppState;

pub fn router() -> Router<AppState> {
    Router::<AppState>::new().route("/api/v1/events/stream", get(stream_events))
}

#[derive(Debug, Deserialize)]
pub(crate) struct StreamQuery {
    job_id: Option<String>,
}

pub(crate) async fn stream_events(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = match query.job_id.as_deref() {
        Some(job_id) => state.events.subscribe(job_id),
        None => state.events.subscribe_all(),
    };

    let stream = stream::unfold(subscription, |mut subscription| async move {
        subscription
            .recv()
            .await
            .map(|event| (event, subscription))
    })
    .map(|event| {
        let payload = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().event(event.event_type.as_str()).data(payload))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
