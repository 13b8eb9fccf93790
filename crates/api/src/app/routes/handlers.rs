use axum::{
    Json, Router,
    extract::{Extension, Path},
    response::IntoResponse,
    routing::{get, put},
};

use erpbus_core::HandlerId;
use erpbus_events::EventBus;

use crate::app::dto::{SetEnabledRequest, parse_id};
use crate::app::errors;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list))
        .route("/:id", get(get_handler))
        .route("/:id/enabled", put(set_enabled))
}

/// GET /handlers
pub async fn list(Extension(bus): Extension<EventBus>) -> impl IntoResponse {
    Json(bus.handlers())
}

/// GET /handlers/:id
pub async fn get_handler(
    Extension(bus): Extension<EventBus>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id::<HandlerId>("id", &id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match bus.handler_info(id) {
        Some(info) => Json(info).into_response(),
        None => errors::not_found("handler"),
    }
}

/// PUT /handlers/:id/enabled
pub async fn set_enabled(
    Extension(bus): Extension<EventBus>,
    Path(id): Path<String>,
    Json(req): Json<SetEnabledRequest>,
) -> axum::response::Response {
    let id = match parse_id::<HandlerId>("id", &id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    if !bus.set_handler_enabled(id, req.enabled) {
        return errors::not_found("handler");
    }
    match bus.handler_info(id) {
        Some(info) => Json(info).into_response(),
        None => errors::not_found("handler"),
    }
}
