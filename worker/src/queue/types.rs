//! Queue names and declaration flags.

use crate::broker::QueueOptions;

/// Queue drained by the background consumer unless configured otherwise.
pub const DEFAULT_QUEUE: &str = "defaultQueue";

/// Flags every queue is declared with by both the publisher and the consumer.
///
/// Declaring with different flags on either side makes the broker reject the
/// second declaration, so both sides share this constant.
pub const QUEUE_OPTIONS: QueueOptions = QueueOptions::transient();
