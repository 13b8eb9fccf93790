//! Publishing, replay and history endpoints.

use axum::{
    Json,
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;

use erpbus_events::EventBus;

use crate::app::dto::{LimitQuery, PublishEventRequest, ReplayRequest};
use crate::app::errors;

/// POST /events
///
/// 202 with the event id once admitted; 400/429/503 when rejected.
pub async fn publish(
    Extension(bus): Extension<EventBus>,
    Json(req): Json<PublishEventRequest>,
) -> axum::response::Response {
    let event = match req.into_event() {
        Ok(event) => event,
        Err(resp) => return resp,
    };

    match bus.try_publish(event) {
        Ok(id) => (StatusCode::ACCEPTED, Json(json!({ "id": id.to_string() }))).into_response(),
        Err(err) => errors::publish_error_to_response(err),
    }
}

/// POST /events/replay
pub async fn replay(
    Extension(bus): Extension<EventBus>,
    Json(req): Json<ReplayRequest>,
) -> axum::response::Response {
    if req.to.is_some_and(|to| to < req.from) {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_range",
            "`to` must not be earlier than `from`",
        );
    }

    let event_types = req.event_types();
    let replayed = bus.replay(req.from, req.to, event_types.as_deref());
    Json(json!({ "replayed": replayed })).into_response()
}

/// GET /events/recent?limit=50
pub async fn recent(
    Extension(bus): Extension<EventBus>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    Json(bus.recent_events(query.limit()))
}

/// GET /events/failed?limit=50
pub async fn failed(
    Extension(bus): Extension<EventBus>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    Json(bus.failed_events(query.limit()))
}

/// GET /events/processing
pub async fn processing(Extension(bus): Extension<EventBus>) -> impl IntoResponse {
    Json(bus.processing_events())
}
