use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use erpbus_events::PublishError;

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn publish_error_to_response(err: PublishError) -> axum::response::Response {
    match &err {
        PublishError::NotRunning => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "bus_not_running", err.to_string())
        }
        PublishError::Validation(_) => {
            json_error(StatusCode::BAD_REQUEST, "validation_failed", err.to_string())
        }
        PublishError::QueueOverflow { .. } => {
            json_error(StatusCode::TOO_MANY_REQUESTS, "queue_overflow", err.to_string())
        }
    }
}

pub fn invalid_id(field: &'static str, raw: &str) -> axum::response::Response {
    json_error(
        StatusCode::BAD_REQUEST,
        "invalid_id",
        format!("{field} is not a valid id: {raw}"),
    )
}

pub fn not_found(what: &'static str) -> axum::response::Response {
    json_error(StatusCode::NOT_FOUND, "not_found", format!("{what} not found"))
}
