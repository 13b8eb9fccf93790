//! HTTP API application wiring (Axum router + bus handle).
//!
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request DTOs and query parameters
//! - `errors.rs`: consistent error responses

use axum::{Extension, Router};
use tower::ServiceBuilder;

use erpbus_events::EventBus;

pub mod dto;
pub mod errors;
pub mod routes;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
///
/// The bus is shared with every handler through an `Extension`; starting and
/// stopping it stays with the caller.
pub fn build_app(bus: EventBus) -> Router {
    routes::router()
        .layer(Extension(bus))
        .layer(ServiceBuilder::new())
}
