//! Health endpoints for external monitoring.
//!
//! - `GET /health` runs every probe and returns the aggregate
//! - `GET /health/:name` runs a single probe (`rabbitmq`, `smtp`)
//!
//! Responses are 200 when healthy and 503 otherwise.

pub mod handlers;

pub use handlers::{health, probe, router, AppState};
