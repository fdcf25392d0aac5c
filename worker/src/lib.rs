//! Rigforge messaging worker.
//!
//! The resilient messaging core of the Rigforge backend:
//! - `broker`: shared RabbitMQ connection and the transport seam
//! - `queue`: fire-and-forget publisher used by the request path
//! - `consumer`: background consumer with prefetch flow control
//! - `activity`: activity logging with an in-memory stash fallback
//! - `health`: broker and SMTP probes, served by `web`
//!
//! ## Architecture
//!
//! ```text
//! CRUD layer ──publish──▶ Publisher ──┐
//!                                     ├──▶ ConnectionManager ──▶ RabbitMQ
//! Consumer (background task) ─────────┘
//!
//! any failure ──▶ ActivityLogger ──▶ LogStore
//!                        └── store down ──▶ LogStash ──flush──▶ LogStore
//! ```

pub mod activity;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod health;
pub mod queue;
pub mod web;

// Re-export commonly used types
pub use activity::{ActivityLogger, LogEntry, LogStore, Severity};
pub use broker::{AmqpConnector, ConnectionManager};
pub use config::Config;
pub use consumer::{Consumer, ConsumerExit, ConsumerSettings, ConsumerState, JsonHandler};
pub use health::{BrokerProbe, HealthProbe, HealthStatus, MailProbe};
pub use queue::{Publisher, DEFAULT_QUEUE};
pub use web::AppState;
