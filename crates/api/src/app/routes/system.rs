use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};

use erpbus_events::{EventBus, HealthStatus};

/// GET /health
///
/// 200 with the health report, or 503 when the bus is critical or stopped.
pub async fn health(Extension(bus): Extension<EventBus>) -> impl IntoResponse {
    let report = bus.health_check();
    let status = if report.status == HealthStatus::Critical || !report.running {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(report))
}

/// GET /stats
pub async fn stats(Extension(bus): Extension<EventBus>) -> impl IntoResponse {
    Json(bus.statistics())
}
