//! Activity logging with an in-memory fallback.
//!
//! Every component records faults through [`ActivityLogger`]. Entries are
//! persisted to the primary [`LogStore`]; when that store is unavailable
//! they are appended to the [`LogStash`] and written later by
//! [`ActivityLogger::flush_stashed_logs`] or the background
//! [`run_stash_flusher`] task.

pub mod entry;
pub mod logger;
pub mod stash;
pub mod store;

pub use entry::{LogEntry, Severity, SYSTEM_USER, TARGET_RABBITMQ};
pub use logger::{run_stash_flusher, ActivityLogger, FlushReport};
pub use stash::LogStash;
pub use store::{FileLogStore, LogStore, MemoryLogStore, StoreError};
