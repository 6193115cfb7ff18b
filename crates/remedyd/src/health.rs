//! Health checks behind `GET /health`.
//!
//! Three checks:
//! - store: a round-trip to the ticket store; failing makes the service unhealthy
//! - change stream: whether the router is subscribed
//! - autopatch workspace: the repository root exists and is a directory
//!
//! The last two only degrade the service, since the poll loop and the plan
//! path keep working without them.

use crate::change_feed::FeedStatus;
use crate::metrics::MetricsSink;
use crate::store::TicketStore;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
    /// Failing this check makes the whole service unhealthy
    pub critical: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub channel_status: String,
    pub reconnects: u64,
    pub checks: Vec<CheckResult>,
    pub tickets_processed: u64,
    pub autopatch_success_rate: f64,
    pub error_rate: f64,
}

impl HealthReport {
    fn rollup(checks: &[CheckResult]) -> HealthStatus {
        if checks.iter().any(|c| c.critical && !c.ok) {
            HealthStatus::Unhealthy
        } else if checks.iter().any(|c| !c.ok) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

pub struct HealthChecker {
    store: Arc<dyn TicketStore>,
    feed: Arc<FeedStatus>,
    metrics: Arc<dyn MetricsSink>,
    workspace: PathBuf,
    store_timeout: Duration,
    started: Instant,
}

impl HealthChecker {
    pub fn new(
        store: Arc<dyn TicketStore>,
        feed: Arc<FeedStatus>,
        metrics: Arc<dyn MetricsSink>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            feed,
            metrics,
            workspace: workspace.into(),
            store_timeout: Duration::from_secs(5),
            started: Instant::now(),
        }
    }

    async fn check_store(&self) -> CheckResult {
        let (ok, detail) = match tokio::time::timeout(self.store_timeout, self.store.ping()).await {
            Ok(Ok(())) => (true, "reachable".to_string()),
            Ok(Err(e)) => (false, e.to_string()),
            Err(_) => (false, format!("no answer within {:?}", self.store_timeout)),
        };
        if !ok {
            warn!("[HEALTH] Store check failed: {}", detail);
        }
        CheckResult {
            name: "store",
            ok,
            detail,
            critical: true,
        }
    }

    fn check_change_stream(&self) -> CheckResult {
        CheckResult {
            name: "change_stream",
            ok: self.feed.is_subscribed(),
            detail: format!(
                "{} ({} reconnects, {} lagged events)",
                self.feed.channel(),
                self.feed.reconnects(),
                self.feed.lagged_events()
            ),
            critical: false,
        }
    }

    fn check_workspace(&self) -> CheckResult {
        let ok = self.workspace.is_dir();
        CheckResult {
            name: "autopatch_workspace",
            ok,
            detail: if ok {
                self.workspace.display().to_string()
            } else {
                format!("{} is not a directory", self.workspace.display())
            },
            critical: false,
        }
    }

    pub async fn report(&self) -> HealthReport {
        let checks = vec![
            self.check_store().await,
            self.check_change_stream(),
            self.check_workspace(),
        ];
        let snapshot = self.metrics.snapshot();
        HealthReport {
            status: HealthReport::rollup(&checks),
            version: remedy_common::VERSION,
            uptime_secs: self.started.elapsed().as_secs(),
            channel_status: self.feed.channel(),
            reconnects: self.feed.reconnects(),
            checks,
            tickets_processed: snapshot.tickets_processed,
            autopatch_success_rate: snapshot.autopatch_success_rate,
            error_rate: snapshot.error_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MemorySink;
    use crate::store::MemoryStore;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_unsubscribed_stream_degrades() {
        let dir = tempdir().unwrap();
        let feed = Arc::new(FeedStatus::new());
        let checker = HealthChecker::new(
            Arc::new(MemoryStore::new()),
            feed.clone(),
            Arc::new(MemorySink::new()),
            dir.path(),
        );

        let report = checker.report().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.channel_status, "unknown");

        feed.set_channel("subscribed");
        assert_eq!(checker.report().await.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_critical_failure_is_unhealthy() {
        let checks = vec![
            CheckResult {
                name: "store",
                ok: false,
                detail: "down".into(),
                critical: true,
            },
            CheckResult {
                name: "change_stream",
                ok: true,
                detail: "subscribed".into(),
                critical: false,
            },
        ];
        assert_eq!(HealthReport::rollup(&checks), HealthStatus::Unhealthy);
    }
}
