//! HTTP API: server, routing, and request/response mapping for the event bus.

pub mod app;
