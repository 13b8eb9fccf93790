use axum::{
    Router,
    routing::{get, post},
};

pub mod dead_letters;
pub mod events;
pub mod handlers;
pub mod system;

/// Router for every endpoint.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/stats", get(system::stats))
        .route("/events", post(events::publish))
        .route("/events/replay", post(events::replay))
        .route("/events/recent", get(events::recent))
        .route("/events/failed", get(events::failed))
        .route("/events/processing", get(events::processing))
        .nest("/dead-letters", dead_letters::router())
        .nest("/handlers", handlers::router())
}
