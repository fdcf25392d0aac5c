//! Activity log entry types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User id recorded for entries raised by the service itself.
pub const SYSTEM_USER: &str = "system";

/// Target type for broker related entries.
pub const TARGET_RABBITMQ: &str = "RabbitMQ";

/// Entry severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Information,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Information => "information",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// A single activity log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Acting user, or [`SYSTEM_USER`]
    pub user_id: String,
    /// What happened (e.g. "Publish", "Consume")
    pub activity_type: String,
    /// Kind of object acted on (e.g. "RabbitMQ")
    pub target_type: String,
    /// Identifier of the object acted on (e.g. a queue name)
    pub target_id: String,
    pub description: Option<String>,
    /// Source IP of the request that triggered the entry
    pub ip_address: Option<String>,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(
        user_id: impl Into<String>,
        activity_type: impl Into<String>,
        target_type: impl Into<String>,
        target_id: impl Into<String>,
        severity: Severity,
    ) -> Self {
        LogEntry {
            user_id: user_id.into(),
            activity_type: activity_type.into(),
            target_type: target_type.into(),
            target_id: target_id.into(),
            description: None,
            ip_address: None,
            severity,
            created_at: Utc::now(),
        }
    }

    /// An entry raised by the service rather than a user.
    pub fn system(
        activity_type: impl Into<String>,
        target_type: impl Into<String>,
        target_id: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self::new(SYSTEM_USER, activity_type, target_type, target_id, severity)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_ip_address(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }
}
