//! Active health probes.
//!
//! Probes are stateless, read-only and safe to run concurrently. They are
//! invoked on demand by the health endpoints in [`crate::web`].

pub mod broker;
pub mod mail;

pub use broker::BrokerProbe;
pub use mail::MailProbe;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use tracing::error;

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// The probe itself failed unexpectedly.
    Unknown,
}

/// Status plus free-text diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    pub fn healthy(description: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            description: description.into(),
            error: None,
        }
    }

    pub fn unhealthy(description: impl Into<String>, error: Option<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            description: description.into(),
            error,
        }
    }

    pub fn unknown(description: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unknown,
            description: description.into(),
            error: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// An on-demand dependency check.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Stable name used in reports and URLs.
    fn name(&self) -> &'static str;

    async fn check(&self) -> HealthReport;
}

/// One probe's report inside a [`HealthSummary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamedReport {
    pub name: &'static str,
    #[serde(flatten)]
    pub report: HealthReport,
}

/// Aggregate of several probes; `status` is the worst individual status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub status: HealthStatus,
    pub checks: Vec<NamedReport>,
}

/// Run one probe, mapping a panic to [`HealthStatus::Unknown`].
pub async fn run_probe(probe: &dyn HealthProbe) -> HealthReport {
    match AssertUnwindSafe(probe.check()).catch_unwind().await {
        Ok(report) => report,
        Err(_) => {
            error!(probe = probe.name(), "health_probe_panicked");
            HealthReport::unknown(format!("{} probe failed unexpectedly", probe.name()))
        }
    }
}

/// Run all probes concurrently.
pub async fn check_all(probes: &[Arc<dyn HealthProbe>]) -> HealthSummary {
    let reports = join_all(probes.iter().map(|probe| async move {
        NamedReport {
            name: probe.name(),
            report: run_probe(probe.as_ref()).await,
        }
    }))
    .await;

    let status = reports
        .iter()
        .map(|r| r.report.status)
        .max()
        .unwrap_or(HealthStatus::Healthy);

    HealthSummary {
        status,
        checks: reports,
    }
}
