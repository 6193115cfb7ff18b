//! Human approval gate for high-risk fix instructions.
//!
//! Requests and decisions are `approval` rows in the automation log, linked
//! by `request_id`. A decision is spent once an `action_result` row names
//! its request, so one approval never authorizes two executions.

use crate::config::ApprovalConfig;
use crate::store::TicketStore;
use async_trait::async_trait;
use remedy_common::error::{RemedyError, RemedyResult};
use remedy_common::event::{ApprovalPayload, AutomationEvent, EventKind};
use remedy_common::patterns::AutoFixInstruction;
use remedy_common::retry::RetryPolicy;
use remedy_common::ticket::Ticket;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Field of an `action_result` payload naming the approval it used up
pub const REQUEST_ID_FIELD: &str = "approval_request_id";

#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalOutcome {
    Approved(ApprovalPayload),
    Denied(ApprovalPayload),
    /// No decision yet; the request stays open in the log
    Pending { request_id: Uuid },
}

// ============================================================================
// Notifiers
// ============================================================================

/// What an approver is told
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalNotice {
    pub ticket_id: String,
    pub ticket_title: String,
    pub request_id: Uuid,
    pub instruction_type: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, notice: &ApprovalNotice) -> RemedyResult<()>;
}

/// POSTs the notice as JSON to a webhook
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn notify(&self, notice: &ApprovalNotice) -> RemedyResult<()> {
        let response = self
            .client
            .post(&self.url)
            .json(notice)
            .send()
            .await
            .map_err(|e| RemedyError::remote("approval webhook", e))?;
        if !response.status().is_success() {
            return Err(RemedyError::remote(
                "approval webhook",
                format!("HTTP {}", response.status()),
            ));
        }
        Ok(())
    }
}

/// Used when no webhook is configured
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, notice: &ApprovalNotice) -> RemedyResult<()> {
        info!(
            "[APPROVAL] Approval needed for {} on ticket {} (request {}): {}",
            notice.instruction_type, notice.ticket_id, notice.request_id, notice.description
        );
        Ok(())
    }
}

/// Records notices; optionally fails every call
#[derive(Default)]
pub struct FakeNotifier {
    notices: Mutex<Vec<ApprovalNotice>>,
    failing: bool,
}

impl FakeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn notices(&self) -> Vec<ApprovalNotice> {
        self.notices.lock().map(|n| n.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn notify(&self, notice: &ApprovalNotice) -> RemedyResult<()> {
        if let Ok(mut notices) = self.notices.lock() {
            notices.push(notice.clone());
        }
        if self.failing {
            return Err(RemedyError::remote("fake notifier", "unreachable"));
        }
        Ok(())
    }
}

pub fn notifier_from_config(config: &ApprovalConfig) -> anyhow::Result<Arc<dyn Notifier>> {
    match &config.webhook_url {
        Some(url) => Ok(Arc::new(WebhookNotifier::new(url, config.notify_timeout())?)),
        None => Ok(Arc::new(LogNotifier)),
    }
}

// ============================================================================
// Log reading
// ============================================================================

/// Approval rows of one ticket, folded
#[derive(Debug, Default)]
pub struct ApprovalLedger {
    requests: Vec<ApprovalPayload>,
    decisions: Vec<ApprovalPayload>,
    consumed: HashSet<Uuid>,
}

impl ApprovalLedger {
    pub fn from_events(events: &[AutomationEvent]) -> Self {
        let mut ledger = Self::default();
        for event in events {
            match event.action_type {
                EventKind::Approval => {
                    if let Some(payload) = event.approval() {
                        if payload.is_unresolved() {
                            ledger.requests.push(payload);
                        } else {
                            ledger.decisions.push(payload);
                        }
                    }
                }
                EventKind::ActionResult => {
                    let used = event
                        .payload
                        .get(REQUEST_ID_FIELD)
                        .and_then(|v| v.as_str())
                        .and_then(|s| Uuid::parse_str(s).ok());
                    if let Some(id) = used {
                        ledger.consumed.insert(id);
                    }
                }
                _ => {}
            }
        }
        ledger
    }

    fn decision_for(&self, request_id: Uuid) -> Option<&ApprovalPayload> {
        self.decisions.iter().rev().find(|d| d.request_id == request_id)
    }

    pub fn request(&self, request_id: Uuid) -> Option<&ApprovalPayload> {
        self.requests.iter().find(|r| r.request_id == request_id)
    }

    /// Requests still waiting for a decision
    pub fn unresolved(&self) -> Vec<&ApprovalPayload> {
        self.requests
            .iter()
            .filter(|r| self.decision_for(r.request_id).is_none())
            .collect()
    }

    pub fn has_unresolved(&self) -> bool {
        !self.unresolved().is_empty()
    }

    /// Requests of one type not yet named by an `action_result`, newest first
    fn unspent(&self, instruction_type: &str) -> Vec<&ApprovalPayload> {
        self.requests
            .iter()
            .rev()
            .filter(|r| r.instruction_type == instruction_type)
            .filter(|r| !self.consumed.contains(&r.request_id))
            .collect()
    }

    /// Request that answers for `instruction_type` on this ticket.
    ///
    /// An undecided request of the same type blocks any new one, whatever
    /// command it names. A decided but unspent request is only reused for
    /// the exact command it was filed for.
    fn open_request(
        &self,
        instruction_type: &str,
        command: Option<&str>,
    ) -> Option<(&ApprovalPayload, Option<&ApprovalPayload>)> {
        let unspent = self.unspent(instruction_type);
        if let Some(pending) = unspent
            .iter()
            .find(|r| self.decision_for(r.request_id).is_none())
        {
            return Some((*pending, None));
        }
        unspent
            .into_iter()
            .find(|r| r.command.as_deref() == command)
            .map(|r| (r, self.decision_for(r.request_id)))
    }
}

fn outcome_of(decision: &ApprovalPayload) -> ApprovalOutcome {
    if decision.approved == Some(true) {
        ApprovalOutcome::Approved(decision.clone())
    } else {
        ApprovalOutcome::Denied(decision.clone())
    }
}

// ============================================================================
// Gateway
// ============================================================================

pub struct ApprovalGateway {
    store: Arc<dyn TicketStore>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    notify_timeout: Duration,
    poll_interval: Duration,
    wait_timeout: Duration,
    shutdown: Option<watch::Receiver<bool>>,
}

impl ApprovalGateway {
    pub fn new(
        store: Arc<dyn TicketStore>,
        notifier: Arc<dyn Notifier>,
        config: &ApprovalConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            notifier,
            retry,
            notify_timeout: config.notify_timeout(),
            poll_interval: config.poll_interval(),
            wait_timeout: config.timeout(),
            shutdown: None,
        }
    }

    /// Abort waits when `shutdown` flips to true
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Decide whether `instruction` may run on `ticket`.
    ///
    /// Reuses an unspent decision, does not re-notify for a request that is
    /// still open, and otherwise files a request and waits for an answer.
    pub async fn seek_approval(
        &self,
        ticket: &Ticket,
        instruction: &AutoFixInstruction,
    ) -> RemedyResult<ApprovalOutcome> {
        let instruction_type = instruction.type_name();
        let command = instruction.command();

        let events = self.store.list_events(&ticket.id).await?;
        let ledger = ApprovalLedger::from_events(&events);
        if let Some((request, decision)) = ledger.open_request(instruction_type, command) {
            return Ok(match decision {
                Some(decision) => {
                    info!(
                        "[APPROVAL] Using decision for request {} on ticket {} (approved={:?})",
                        request.request_id, ticket.id, decision.approved
                    );
                    outcome_of(decision)
                }
                None => {
                    debug!(
                        "[APPROVAL] Request {} on ticket {} still pending",
                        request.request_id, ticket.id
                    );
                    ApprovalOutcome::Pending {
                        request_id: request.request_id,
                    }
                }
            });
        }

        let description = instruction.describe();
        let request = ApprovalPayload::request(instruction_type, &description, command);
        let request_id = request.request_id;
        self.store
            .append_event(&AutomationEvent::new(
                &ticket.id,
                EventKind::Approval,
                serde_json::to_value(&request)?,
            ))
            .await?;
        info!(
            "[APPROVAL] Requested approval {} for {} on ticket {}",
            request_id, instruction_type, ticket.id
        );

        let notice = ApprovalNotice {
            ticket_id: ticket.id.clone(),
            ticket_title: ticket.title.clone(),
            request_id,
            instruction_type: instruction_type.to_string(),
            description,
            command: command.map(str::to_string),
        };
        let notified = self
            .retry
            .retry_with_timeout("approval notice", self.notify_timeout, || {
                self.notifier.notify(&notice)
            })
            .await;
        if let Err(e) = notified {
            warn!(
                "[APPROVAL] {} notifier failed for request {}: {}",
                self.notifier.name(),
                request_id,
                e
            );
        }

        self.wait_for_decision(&ticket.id, instruction_type, request_id).await
    }

    async fn wait_for_decision(
        &self,
        ticket_id: &str,
        instruction_type: &str,
        request_id: Uuid,
    ) -> RemedyResult<ApprovalOutcome> {
        let deadline = tokio::time::Instant::now() + self.wait_timeout;
        let mut shutdown = self.shutdown.clone();

        loop {
            let events = self.store.list_events(ticket_id).await?;
            if let Some(decision) = ApprovalLedger::from_events(&events).decision_for(request_id) {
                info!(
                    "[APPROVAL] Request {} decided (approved={:?})",
                    request_id, decision.approved
                );
                return Ok(outcome_of(decision));
            }

            if tokio::time::Instant::now() >= deadline {
                let timeout = RemedyError::ApprovalTimeout {
                    ticket_id: ticket_id.to_string(),
                    instruction_type: instruction_type.to_string(),
                };
                warn!("[APPROVAL] {}; deferring", timeout);
                return Ok(ApprovalOutcome::Pending { request_id });
            }

            let sleep = tokio::time::sleep_until(deadline.min(tokio::time::Instant::now() + self.poll_interval));
            match shutdown.as_mut() {
                Some(rx) if *rx.borrow() => return Ok(ApprovalOutcome::Pending { request_id }),
                Some(rx) => {
                    tokio::select! {
                        _ = sleep => {}
                        changed = rx.changed() => {
                            if changed.is_err() || *rx.borrow() {
                                info!("[APPROVAL] Shutdown while waiting on request {}", request_id);
                                return Ok(ApprovalOutcome::Pending { request_id });
                            }
                        }
                    }
                }
                None => sleep.await,
            }
        }
    }

    /// Record an approver's answer to an open request
    pub async fn decide(
        store: &dyn TicketStore,
        ticket_id: &str,
        request_id: Uuid,
        approved: bool,
        decided_by: Option<&str>,
    ) -> RemedyResult<ApprovalPayload> {
        let events = store.list_events(ticket_id).await?;
        let ledger = ApprovalLedger::from_events(&events);
        let request = ledger.request(request_id).ok_or_else(|| {
            RemedyError::Config(format!("no approval request {} on ticket {}", request_id, ticket_id))
        })?;
        if ledger.decision_for(request_id).is_some() {
            return Err(RemedyError::Config(format!(
                "approval request {} is already decided",
                request_id
            )));
        }

        let decision = ApprovalPayload::decision(request, approved, decided_by);
        store
            .append_event(&AutomationEvent::new(
                ticket_id,
                EventKind::Approval,
                serde_json::to_value(&decision)?,
            ))
            .await?;
        info!(
            "[APPROVAL] Request {} on ticket {} {} by {}",
            request_id,
            ticket_id,
            if approved { "approved" } else { "denied" },
            decided_by.unwrap_or("unknown")
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn restart() -> AutoFixInstruction {
        AutoFixInstruction::RemoteCommand {
            command: "pm2 restart whatsapp-bot-builder".into(),
            description: "Restart app".into(),
        }
    }

    fn gateway(store: Arc<MemoryStore>, notifier: Arc<FakeNotifier>) -> ApprovalGateway {
        let config = ApprovalConfig {
            timeout_secs: 60,
            ..ApprovalConfig::default()
        };
        ApprovalGateway::new(store, notifier, &config, RetryPolicy::new(1, 10, 20))
    }

    async fn open_request(store: &MemoryStore, ticket_id: &str) -> ApprovalPayload {
        let request = ApprovalPayload::request(
            restart().type_name(),
            "Restart app",
            Some("pm2 restart whatsapp-bot-builder"),
        );
        store
            .append_event(&AutomationEvent::new(
                ticket_id,
                EventKind::Approval,
                serde_json::to_value(&request).unwrap(),
            ))
            .await
            .unwrap();
        request
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_to_pending_after_notifying_once() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(FakeNotifier::new());
        let gateway = gateway(store.clone(), notifier.clone());
        let ticket = Ticket::new("t-1", "Server down", "restart");

        let outcome = gateway.seek_approval(&ticket, &restart()).await.unwrap();
        assert!(matches!(outcome, ApprovalOutcome::Pending { .. }));
        assert_eq!(notifier.notices().len(), 1);

        // Second pass sees the open request and does not notify again
        let again = gateway.seek_approval(&ticket, &restart()).await.unwrap();
        assert_eq!(again, outcome);
        assert_eq!(notifier.notices().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_request_blocks_other_commands_of_same_type() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(FakeNotifier::new());
        let gateway = gateway(store.clone(), notifier.clone());
        let ticket = Ticket::new("t-1", "Server down", "restart");

        let first = gateway.seek_approval(&ticket, &restart()).await.unwrap();
        let reload = AutoFixInstruction::RemoteCommand {
            command: "caddy reload".into(),
            description: "Reload proxy".into(),
        };
        let second = gateway.seek_approval(&ticket, &reload).await.unwrap();

        assert_eq!(second, first);
        assert_eq!(notifier.notices().len(), 1);
        let ledger = ApprovalLedger::from_events(&store.list_events("t-1").await.unwrap());
        assert_eq!(ledger.unresolved().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decision_is_not_reused_for_another_command() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(FakeNotifier::new());
        let gateway = gateway(store.clone(), notifier.clone());
        let ticket = Ticket::new("t-1", "Server down", "restart");

        let request = open_request(&store, "t-1").await;
        ApprovalGateway::decide(store.as_ref(), "t-1", request.request_id, true, None)
            .await
            .unwrap();

        let reload = AutoFixInstruction::RemoteCommand {
            command: "caddy reload".into(),
            description: "Reload proxy".into(),
        };
        let outcome = gateway.seek_approval(&ticket, &reload).await.unwrap();
        assert!(matches!(outcome, ApprovalOutcome::Pending { request_id } if request_id != request.request_id));
        assert_eq!(notifier.notices().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decision_arriving_during_wait_is_returned() {
        let store = Arc::new(MemoryStore::new());
        let gateway = gateway(store.clone(), Arc::new(FakeNotifier::new()));
        let ticket = Ticket::new("t-1", "Server down", "restart");

        let approver = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(12)).await;
                let events = store.list_events("t-1").await.unwrap();
                let request = events.iter().find_map(|e| e.approval()).unwrap();
                ApprovalGateway::decide(store.as_ref(), "t-1", request.request_id, true, Some("ops"))
                    .await
                    .unwrap();
            })
        };

        let outcome = gateway.seek_approval(&ticket, &restart()).await.unwrap();
        approver.await.unwrap();
        match outcome {
            ApprovalOutcome::Approved(decision) => {
                assert_eq!(decision.decided_by.as_deref(), Some("ops"))
            }
            other => panic!("expected approval, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unspent_decision_is_reused_and_spent_one_is_not() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(FakeNotifier::new());
        let gateway = gateway(store.clone(), notifier.clone());
        let ticket = Ticket::new("t-1", "Server down", "restart");

        let request = open_request(&store, "t-1").await;
        ApprovalGateway::decide(store.as_ref(), "t-1", request.request_id, false, None)
            .await
            .unwrap();

        let outcome = gateway.seek_approval(&ticket, &restart()).await.unwrap();
        assert!(matches!(outcome, ApprovalOutcome::Denied(_)));
        assert!(notifier.notices().is_empty());

        store
            .append_event(&AutomationEvent::new(
                "t-1",
                EventKind::ActionResult,
                serde_json::json!({ REQUEST_ID_FIELD: request.request_id.to_string() }),
            ))
            .await
            .unwrap();
        let ledger = ApprovalLedger::from_events(&store.list_events("t-1").await.unwrap());
        assert!(ledger.open_request(restart().type_name(), restart().command()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifier_failure_is_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(FakeNotifier::failing());
        let gateway = gateway(store.clone(), notifier.clone());
        let ticket = Ticket::new("t-1", "Server down", "restart");

        let outcome = gateway.seek_approval(&ticket, &restart()).await.unwrap();
        assert!(matches!(outcome, ApprovalOutcome::Pending { .. }));
        assert_eq!(notifier.notices().len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_wait() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = watch::channel(false);
        let gateway = gateway(store.clone(), Arc::new(FakeNotifier::new())).with_shutdown(rx);
        let ticket = Ticket::new("t-1", "Server down", "restart");

        let waiting = tokio::spawn(async move { gateway.seek_approval(&ticket, &restart()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let outcome = waiting.await.unwrap().unwrap();
        assert!(matches!(outcome, ApprovalOutcome::Pending { .. }));
    }

    #[tokio::test]
    async fn test_decide_rejects_unknown_and_repeated_decisions() {
        let store = MemoryStore::new();
        assert!(ApprovalGateway::decide(&store, "t-1", Uuid::new_v4(), true, None)
            .await
            .is_err());

        let request = open_request(&store, "t-1").await;
        ApprovalGateway::decide(&store, "t-1", request.request_id, true, None)
            .await
            .unwrap();
        assert!(ApprovalGateway::decide(&store, "t-1", request.request_id, false, None)
            .await
            .is_err());
        let ledger = ApprovalLedger::from_events(&store.list_events("t-1").await.unwrap());
        assert!(!ledger.has_unresolved());
    }
}
