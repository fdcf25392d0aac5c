//! Queue module for RabbitMQ publishing.
//!
//! This module provides:
//! - Queue names shared by the publisher and the background consumer
//! - A fire-and-forget publisher that degrades to activity logging
//!
//! ## Flow
//!
//! ```text
//! CRUD layer → Publisher::publish(queue, message) → defaultQueue → Consumer
//!                       └── on failure ──▶ ActivityLogger (ERROR entry)
//! ```

pub mod publisher;
pub mod types;

pub use publisher::{PublishError, Publisher};
pub use types::{DEFAULT_QUEUE, QUEUE_OPTIONS};
