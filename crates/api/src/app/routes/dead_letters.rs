use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;

use erpbus_core::EventId;
use erpbus_events::EventBus;

use crate::app::dto::{LimitQuery, parse_id};
use crate::app::errors;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list).delete(purge))
        .route("/:event_id/requeue", post(requeue))
}

/// GET /dead-letters?limit=50
pub async fn list(
    Extension(bus): Extension<EventBus>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    Json(bus.dead_letters(query.limit()))
}

/// POST /dead-letters/:event_id/requeue
pub async fn requeue(
    Extension(bus): Extension<EventBus>,
    Path(event_id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id::<EventId>("event_id", &event_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    if !bus.dead_letters(usize::MAX).iter().any(|e| e.event.id == id) {
        return errors::not_found("dead-lettered event");
    }
    if bus.requeue_dead_letter(id) {
        (StatusCode::ACCEPTED, Json(json!({ "requeued": id.to_string() }))).into_response()
    } else {
        errors::json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "requeue_failed",
            "event could not be republished",
        )
    }
}

/// DELETE /dead-letters
pub async fn purge(Extension(bus): Extension<EventBus>) -> impl IntoResponse {
    Json(json!({ "purged": bus.purge_dead_letters() }))
}
