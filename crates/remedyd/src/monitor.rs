//! External change monitoring.
//!
//! Provider monitors report changes on a fixed interval (default 24h). The
//! scheduler stores new changes and forwards only low/medium impact ones to
//! the [`UpdateHandler`]; high and critical changes wait for a human.

use crate::config::{MonitorConfig, ProviderConfig};
use crate::store::TicketStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use remedy_common::error::{RemedyError, RemedyResult};
use remedy_common::event::EventKind;
use remedy_common::retry::with_timeout;
use remedy_common::ticket::{Priority, Ticket};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Changes already reported within this window are not stored again
const DUPLICATE_WINDOW_DAYS: i64 = 7;

/// Ticket category of remediation tickets opened for external changes
pub const EXTERNAL_CHANGE_CATEGORY: &str = "external_change";

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    ApiUpdate,
    VersionUpdate,
    WebhookChange,
    BreakingChange,
    Deprecation,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiUpdate => "api_update",
            Self::VersionUpdate => "version_update",
            Self::WebhookChange => "webhook_change",
            Self::BreakingChange => "breaking_change",
            Self::Deprecation => "deprecation",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "api_update" => Some(Self::ApiUpdate),
            "version_update" => Some(Self::VersionUpdate),
            "webhook_change" => Some(Self::WebhookChange),
            "breaking_change" => Some(Self::BreakingChange),
            "deprecation" => Some(Self::Deprecation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Impact {
    Low,
    Medium,
    High,
    Critical,
}

impl Impact {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Only low and medium impact changes are handled without a human
    pub fn allows_auto_update(&self) -> bool {
        matches!(self, Self::Low | Self::Medium)
    }

    fn ticket_priority(&self) -> Priority {
        match self {
            Self::Low => Priority::Low,
            Self::Medium => Priority::Normal,
            Self::High => Priority::High,
            Self::Critical => Priority::Urgent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Detected,
    InProgress,
    Updated,
    Failed,
    ManualReview,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::InProgress => "in_progress",
            Self::Updated => "updated",
            Self::Failed => "failed",
            Self::ManualReview => "manual_review",
        }
    }
}

/// A change detected at an external provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalChange {
    pub id: String,
    pub provider: String,
    pub change_type: ChangeType,
    pub title: String,
    pub description: String,
    pub impact: Impact,
    pub detected_at: DateTime<Utc>,
    pub status: ChangeStatus,
    #[serde(default)]
    pub auto_updated: bool,
    #[serde(default)]
    pub affected_services: Vec<String>,
}

impl ExternalChange {
    pub fn new(
        provider: &str,
        change_type: ChangeType,
        impact: Impact,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            provider: provider.to_string(),
            change_type,
            title: title.into(),
            description: description.into(),
            impact,
            detected_at: Utc::now(),
            status: ChangeStatus::Detected,
            auto_updated: false,
            affected_services: Vec::new(),
        }
    }
}

// ============================================================================
// Monitors
// ============================================================================

#[async_trait]
pub trait ProviderMonitor: Send + Sync {
    fn provider(&self) -> &str;

    async fn check_for_changes(&self) -> RemedyResult<Vec<ExternalChange>>;
}

/// Watches a JSON document for a version field
pub struct HttpVersionMonitor {
    config: ProviderConfig,
    client: reqwest::Client,
    timeout: Duration,
    last_seen: Mutex<Option<String>>,
}

impl HttpVersionMonitor {
    pub fn new(config: ProviderConfig, timeout: Duration) -> Self {
        let last_seen = Mutex::new(config.pinned_version.clone());
        Self {
            config,
            client: reqwest::Client::new(),
            timeout,
            last_seen,
        }
    }

    async fn fetch_version(&self) -> RemedyResult<String> {
        let response = with_timeout(self.timeout, async {
            self.client
                .get(&self.config.url)
                .send()
                .await
                .map_err(|e| RemedyError::remote(&self.config.name, e))
        })
        .await?;

        if !response.status().is_success() {
            return Err(RemedyError::remote(
                &self.config.name,
                format!("HTTP {}", response.status()),
            ));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RemedyError::remote(&self.config.name, e))?;

        body.pointer(&self.config.version_pointer)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                RemedyError::remote(
                    &self.config.name,
                    format!("no version at {}", self.config.version_pointer),
                )
            })
    }
}

#[async_trait]
impl ProviderMonitor for HttpVersionMonitor {
    fn provider(&self) -> &str {
        &self.config.name
    }

    async fn check_for_changes(&self) -> RemedyResult<Vec<ExternalChange>> {
        let latest = self.fetch_version().await?;

        let previous = {
            let mut last_seen = self
                .last_seen
                .lock()
                .map_err(|_| RemedyError::store("monitor state poisoned"))?;
            last_seen.replace(latest.clone())
        };

        let Some(previous) = previous else {
            info!("[MONITOR] {} baseline version {}", self.config.name, latest);
            return Ok(Vec::new());
        };
        if previous == latest {
            return Ok(Vec::new());
        }

        let (change_type, impact) = classify_version_change(&previous, &latest);
        let mut change = ExternalChange::new(
            &self.config.name,
            change_type,
            impact,
            format!("{} version update: {}", self.config.name, latest),
            format!(
                "New version {} is available. Current version: {}.",
                latest, previous
            ),
        );
        change.affected_services = self.config.affected_services.clone();
        Ok(vec![change])
    }
}

/// Major bumps are breaking, minor bumps medium, patch bumps low
pub fn classify_version_change(previous: &str, latest: &str) -> (ChangeType, Impact) {
    match (parse_version(previous), parse_version(latest)) {
        (Some(old), Some(new)) if new.0 != old.0 => (ChangeType::BreakingChange, Impact::High),
        (Some(old), Some(new)) if new.1 != old.1 => (ChangeType::VersionUpdate, Impact::Medium),
        (Some(_), Some(_)) => (ChangeType::VersionUpdate, Impact::Low),
        _ => (ChangeType::VersionUpdate, Impact::Medium),
    }
}

fn parse_version(version: &str) -> Option<(u32, u32, u32)> {
    let core = version.trim_start_matches('v');
    let core = core.split(['-', '+']).next()?;
    let mut nums = core.split('.').map(|s| s.parse::<u32>());
    let major = nums.next()?.ok()?;
    let minor = nums.next().and_then(|n| n.ok()).unwrap_or(0);
    let patch = nums.next().and_then(|n| n.ok()).unwrap_or(0);
    Some((major, minor, patch))
}

/// Monitor returning canned results, for tests
pub struct FakeMonitor {
    name: String,
    result: Mutex<Option<RemedyResult<Vec<ExternalChange>>>>,
}

impl FakeMonitor {
    pub fn new(name: &str, changes: Vec<ExternalChange>) -> Self {
        Self {
            name: name.to_string(),
            result: Mutex::new(Some(Ok(changes))),
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            result: Mutex::new(Some(Err(RemedyError::remote(name, "unreachable")))),
        }
    }
}

#[async_trait]
impl ProviderMonitor for FakeMonitor {
    fn provider(&self) -> &str {
        &self.name
    }

    async fn check_for_changes(&self) -> RemedyResult<Vec<ExternalChange>> {
        self.result
            .lock()
            .ok()
            .and_then(|mut r| r.take())
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

// ============================================================================
// Update handling
// ============================================================================

/// Runs a ticket through the remediation path and reports the outcome
#[async_trait]
pub trait RemediationDispatcher: Send + Sync {
    async fn dispatch_ticket(&self, ticket_id: &str) -> RemedyResult<EventKind>;
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateResult {
    pub success: bool,
    pub change_id: String,
    pub status: ChangeStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct UpdateHandler {
    store: Arc<dyn TicketStore>,
    dispatcher: Arc<dyn RemediationDispatcher>,
}

impl UpdateHandler {
    pub fn new(store: Arc<dyn TicketStore>, dispatcher: Arc<dyn RemediationDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Handle one low/medium impact change and record its final status
    pub async fn process_change(&self, change: &ExternalChange) -> UpdateResult {
        info!(
            "[MONITOR] Processing {} change {} from {}",
            change.change_type.as_str(),
            change.id,
            change.provider
        );

        let mut change = change.clone();
        let result = self.apply(&mut change).await;

        let (status, auto_updated, error) = match result {
            Ok(status) => (status, status == ChangeStatus::Updated, None),
            Err(e) => {
                error!("[MONITOR] Update for change {} failed: {}", change.id, e);
                (ChangeStatus::Failed, false, Some(e.to_string()))
            }
        };

        change.status = status;
        change.auto_updated = auto_updated;
        if let Err(e) = self.store.save_external_change(&change).await {
            error!("[MONITOR] Failed to record status of change {}: {}", change.id, e);
        }

        UpdateResult {
            success: status == ChangeStatus::Updated,
            change_id: change.id.clone(),
            status,
            updated_at: Utc::now(),
            error,
        }
    }

    async fn apply(&self, change: &mut ExternalChange) -> RemedyResult<ChangeStatus> {
        change.status = ChangeStatus::InProgress;
        self.store.save_external_change(change).await?;

        match change.change_type {
            ChangeType::ApiUpdate | ChangeType::VersionUpdate | ChangeType::WebhookChange => {
                let ticket = remediation_ticket(change);
                self.store.create_ticket(&ticket).await?;
                let outcome = self.dispatcher.dispatch_ticket(&ticket.id).await?;
                info!(
                    "[MONITOR] Change {} routed as ticket {}: {}",
                    change.id, ticket.id, outcome
                );
                Ok(match outcome {
                    EventKind::AutopatchApplied => ChangeStatus::Updated,
                    EventKind::DispatchError => ChangeStatus::Failed,
                    _ => ChangeStatus::ManualReview,
                })
            }
            ChangeType::BreakingChange | ChangeType::Deprecation => {
                warn!(
                    "[MONITOR] {} from {} needs manual review",
                    change.change_type.as_str(),
                    change.provider
                );
                Ok(ChangeStatus::ManualReview)
            }
        }
    }
}

fn remediation_ticket(change: &ExternalChange) -> Ticket {
    let mut ticket = Ticket::new(
        format!("ext-{}", change.id),
        format!("[{}] {}", change.provider, change.title),
        change.description.clone(),
    );
    ticket.priority = change.impact.ticket_priority();
    ticket.category = Some(EXTERNAL_CHANGE_CATEGORY.to_string());
    ticket.source_metadata = serde_json::json!({
        "external_change_id": change.id,
        "provider": change.provider,
        "change_type": change.change_type.as_str(),
        "affected_services": change.affected_services,
    });
    ticket
}

// ============================================================================
// Scheduler
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub new_changes: usize,
    pub forwarded: usize,
    pub manual_review: usize,
}

pub struct MonitorScheduler {
    monitors: Vec<Arc<dyn ProviderMonitor>>,
    store: Arc<dyn TicketStore>,
    handler: UpdateHandler,
    interval: Duration,
}

impl MonitorScheduler {
    pub fn new(
        monitors: Vec<Arc<dyn ProviderMonitor>>,
        store: Arc<dyn TicketStore>,
        handler: UpdateHandler,
        interval: Duration,
    ) -> Self {
        Self {
            monitors,
            store,
            handler,
            interval,
        }
    }

    /// HTTP version monitors for every configured provider
    pub fn monitors_from_config(config: &MonitorConfig, timeout: Duration) -> Vec<Arc<dyn ProviderMonitor>> {
        config
            .providers
            .iter()
            .cloned()
            .map(|p| Arc::new(HttpVersionMonitor::new(p, timeout)) as Arc<dyn ProviderMonitor>)
            .collect()
    }

    /// Run every monitor concurrently; one failing monitor does not stop the rest
    pub async fn run_checks(&self) -> CheckSummary {
        info!("[MONITOR] Running {} provider checks", self.monitors.len());

        let mut set = JoinSet::new();
        for monitor in &self.monitors {
            let monitor = Arc::clone(monitor);
            set.spawn(async move {
                let provider = monitor.provider().to_string();
                (provider, monitor.check_for_changes().await)
            });
        }

        let mut summary = CheckSummary::default();
        let mut detected = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((provider, Ok(changes))) => {
                    summary.succeeded += 1;
                    info!("[MONITOR] {}: {} change(s)", provider, changes.len());
                    detected.extend(changes);
                }
                Ok((provider, Err(e))) => {
                    summary.failed += 1;
                    error!("[MONITOR] Check for {} failed: {}", provider, e);
                }
                Err(e) => {
                    summary.failed += 1;
                    error!("[MONITOR] Monitor task panicked: {}", e);
                }
            }
        }

        let since = Utc::now() - ChronoDuration::days(DUPLICATE_WINDOW_DAYS);
        for mut change in detected {
            match self
                .store
                .external_change_exists(&change.provider, &change.title, since)
                .await
            {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!("[MONITOR] Duplicate check failed for {}: {}", change.title, e);
                    continue;
                }
            }
            summary.new_changes += 1;

            if change.impact.allows_auto_update() {
                if let Err(e) = self.store.save_external_change(&change).await {
                    error!("[MONITOR] Failed to store change {}: {}", change.id, e);
                    continue;
                }
                summary.forwarded += 1;
                self.handler.process_change(&change).await;
            } else {
                change.status = ChangeStatus::ManualReview;
                summary.manual_review += 1;
                warn!(
                    "[MONITOR] {} impact change from {} held for manual review: {}",
                    change.impact.as_str(),
                    change.provider,
                    change.title
                );
                if let Err(e) = self.store.save_external_change(&change).await {
                    error!("[MONITOR] Failed to store change {}: {}", change.id, e);
                }
            }
        }

        info!(
            "[MONITOR] Checks done: {} ok, {} failed, {} new, {} forwarded",
            summary.succeeded, summary.failed, summary.new_changes, summary.forwarded
        );
        summary
    }

    /// Check now, then every interval until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "[MONITOR] Scheduler started ({} monitors, every {}s)",
            self.monitors.len(),
            self.interval.as_secs()
        );
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_checks().await;
                }
                _ = shutdown.changed() => {
                    info!("[MONITOR] Scheduler stopping");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    struct FixedDispatcher(RemedyResult<EventKind>);

    #[async_trait]
    impl RemediationDispatcher for FixedDispatcher {
        async fn dispatch_ticket(&self, _ticket_id: &str) -> RemedyResult<EventKind> {
            match &self.0 {
                Ok(kind) => Ok(*kind),
                Err(e) => Err(RemedyError::remote("router", e)),
            }
        }
    }

    fn scheduler(
        store: Arc<MemoryStore>,
        monitors: Vec<Arc<dyn ProviderMonitor>>,
        outcome: RemedyResult<EventKind>,
    ) -> MonitorScheduler {
        let handler = UpdateHandler::new(store.clone(), Arc::new(FixedDispatcher(outcome)));
        MonitorScheduler::new(monitors, store, handler, Duration::from_secs(60))
    }

    #[test]
    fn test_version_classification() {
        assert_eq!(
            classify_version_change("v18.0", "v19.0"),
            (ChangeType::BreakingChange, Impact::High)
        );
        assert_eq!(
            classify_version_change("2.3.0", "2.4.0"),
            (ChangeType::VersionUpdate, Impact::Medium)
        );
        assert_eq!(
            classify_version_change("2.3.0", "2.3.1"),
            (ChangeType::VersionUpdate, Impact::Low)
        );
        assert_eq!(
            classify_version_change("stable", "edge"),
            (ChangeType::VersionUpdate, Impact::Medium)
        );
    }

    #[tokio::test]
    async fn test_failing_monitor_does_not_stop_others() {
        let store = Arc::new(MemoryStore::new());
        let change = ExternalChange::new("stripe", ChangeType::ApiUpdate, Impact::Low, "New field", "x");
        let monitors: Vec<Arc<dyn ProviderMonitor>> = vec![
            Arc::new(FakeMonitor::failing("meta")),
            Arc::new(FakeMonitor::new("stripe", vec![change])),
        ];
        let summary = scheduler(store.clone(), monitors, Ok(EventKind::AutopatchApplied))
            .run_checks()
            .await;
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.forwarded, 1);

        let stored = store.external_changes();
        assert_eq!(stored[0].status, ChangeStatus::Updated);
        assert!(stored[0].auto_updated);
    }

    #[tokio::test]
    async fn test_high_impact_held_for_review() {
        let store = Arc::new(MemoryStore::new());
        let change = ExternalChange::new("meta", ChangeType::VersionUpdate, Impact::Critical, "v20", "x");
        let monitors: Vec<Arc<dyn ProviderMonitor>> = vec![Arc::new(FakeMonitor::new("meta", vec![change]))];
        let summary = scheduler(store.clone(), monitors, Ok(EventKind::AutopatchApplied))
            .run_checks()
            .await;
        assert_eq!(summary.forwarded, 0);
        assert_eq!(summary.manual_review, 1);
        assert_eq!(store.external_changes()[0].status, ChangeStatus::ManualReview);
        assert!(store.list_tickets(&[remedy_common::ticket::TicketStatus::New]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_changes_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let seen = ExternalChange::new("stripe", ChangeType::ApiUpdate, Impact::Low, "New field", "x");
        store.save_external_change(&seen).await.unwrap();
        let again = ExternalChange::new("stripe", ChangeType::ApiUpdate, Impact::Low, "New field", "x");
        let monitors: Vec<Arc<dyn ProviderMonitor>> = vec![Arc::new(FakeMonitor::new("stripe", vec![again]))];
        let summary = scheduler(store.clone(), monitors, Ok(EventKind::AutopatchApplied))
            .run_checks()
            .await;
        assert_eq!(summary.new_changes, 0);
        assert_eq!(store.external_changes().len(), 1);
    }

    #[tokio::test]
    async fn test_update_handler_opens_ticket_and_records_failure() {
        let store = Arc::new(MemoryStore::new());
        let handler = UpdateHandler::new(
            store.clone(),
            Arc::new(FixedDispatcher(Err(RemedyError::remote("router", "down")))),
        );
        let change = ExternalChange::new("n8n", ChangeType::WebhookChange, Impact::Medium, "Signature header", "x");
        let result = handler.process_change(&change).await;
        assert!(!result.success);
        assert_eq!(result.status, ChangeStatus::Failed);
        assert!(result.error.is_some());

        let ticket = store.get_ticket(&format!("ext-{}", change.id)).await.unwrap().unwrap();
        assert_eq!(ticket.category.as_deref(), Some(EXTERNAL_CHANGE_CATEGORY));
        assert_eq!(ticket.priority, Priority::Normal);
    }

    #[tokio::test]
    async fn test_breaking_change_never_dispatched() {
        let store = Arc::new(MemoryStore::new());
        let handler = UpdateHandler::new(store.clone(), Arc::new(FixedDispatcher(Ok(EventKind::AutopatchApplied))));
        let change = ExternalChange::new("meta", ChangeType::Deprecation, Impact::Low, "Old endpoint", "x");
        let result = handler.process_change(&change).await;
        assert_eq!(result.status, ChangeStatus::ManualReview);
        assert!(store.get_ticket(&format!("ext-{}", change.id)).await.unwrap().is_none());
    }
}
