//! TicketRouter - the remediation state machine.
//!
//! One dispatch run per ticket change:
//!
//! ```text
//! claim → match → verify → {plan | execute → re-verify} → outcome → release
//! ```
//!
//! Every run appends exactly one outcome event carrying the ticket
//! fingerprint. A later run over the same fingerprint is a no-op unless the
//! previous outcome was retryable (approval deferred, dispatch error).
//! Concurrent runs on one ticket are kept apart by processing claims in the
//! audit log, so several router processes can share a store.

use crate::approval::ApprovalLedger;
use crate::change_feed::{ChangeEvent, ChangeHub, FeedStatus};
use crate::dedup::EventDeduplicator;
use crate::executor::{ActionExecutor, ExecutionHalt, ExecutionReport};
use crate::interceptor::{RouterInterceptor, TracingInterceptor};
use crate::knowledge::KnowledgeBase;
use crate::metrics::{LatencyKind, MetricsSink, MetricsTracker};
use crate::monitor::RemediationDispatcher;
use crate::planner::PlanGenerator;
use crate::store::TicketStore;
use crate::verifier::{ConfirmedProblem, ProblemVerifier};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use remedy_common::agent_profiles::AgentProfile;
use remedy_common::error::{RemedyError, RemedyResult};
use remedy_common::event::{AutomationEvent, EventKind};
use remedy_common::funnel::{DetectionMethod, DiagnosisMetricsRecord};
use remedy_common::patterns::{LocalizedMessage, MatchSource, PatternMatch, PatternMatcher};
use remedy_common::plan::{ActionKind, ResolutionAction};
use remedy_common::ticket::{
    should_escalate_followup, AuthorType, EscalationEntry, Ticket, TicketMessage, TicketStatus,
};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Author name on automated support messages
pub const SUPPORT_AUTHOR: &str = "Remedy Automation";

/// Documents retrieved for a plan prompt
const PLAN_CONTEXT_DOCS: usize = 6;

// ============================================================================
// Outcomes
// ============================================================================

/// Why a dispatch did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Ticket is resolved or closed
    Terminal,
    /// Same fingerprint already reached a final outcome
    AlreadyHandled(EventKind),
    /// Another run holds the processing claim
    Claimed,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Terminal => write!(f, "ticket is terminal"),
            Self::AlreadyHandled(kind) => write!(f, "already handled ({})", kind),
            Self::Claimed => write!(f, "claimed by another run"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed(EventKind),
    Skipped(SkipReason),
}

/// Router timings
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub poll_interval: Duration,
    pub claim_ttl: Duration,
    pub shutdown_grace: Duration,
    pub dedup_ttl: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            claim_ttl: Duration::from_secs(2700),
            shutdown_grace: Duration::from_secs(30),
            dedup_ttl: Duration::from_secs(60),
        }
    }
}

/// Collaborators the router is built from
pub struct RouterParts {
    pub store: Arc<dyn TicketStore>,
    pub matcher: Arc<PatternMatcher>,
    pub verifier: Arc<ProblemVerifier>,
    pub planner: Arc<PlanGenerator>,
    pub executor: Arc<ActionExecutor>,
    pub knowledge: Arc<KnowledgeBase>,
    pub metrics: Arc<dyn MetricsSink>,
    pub hub: ChangeHub,
    pub feed: Arc<FeedStatus>,
}

/// Stable hash over the fields a customer can change.
///
/// Status and timestamps are left out: the router's own updates must not
/// make an already handled ticket look new.
pub fn ticket_fingerprint(ticket: &Ticket) -> String {
    let mut hasher = Sha256::new();
    for part in [
        ticket.id.as_str(),
        ticket.title.as_str(),
        ticket.description.as_str(),
        ticket.latest_message.as_deref().unwrap_or(""),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(&hasher.finalize()[..16])
}

/// Most recent outcome event in an oldest-first log
fn last_outcome(events: &[AutomationEvent]) -> Option<&AutomationEvent> {
    events.iter().rev().find(|e| e.action_type.is_outcome())
}

/// Oldest live claim: not released and younger than `ttl`
fn winning_claim(events: &[AutomationEvent], now: DateTime<Utc>, ttl: Duration) -> Option<Uuid> {
    let claim_id = |e: &AutomationEvent| {
        e.payload
            .get("claim_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    };
    let released: HashSet<Uuid> = events
        .iter()
        .filter(|e| e.action_type == EventKind::ProcessingReleased)
        .filter_map(claim_id)
        .collect();
    let ttl = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::hours(1));

    events
        .iter()
        .filter(|e| e.action_type == EventKind::ProcessingClaimed)
        .filter(|e| now - e.created_at < ttl)
        .filter_map(|e| claim_id(e).map(|id| (e.created_at, id)))
        .filter(|(_, id)| !released.contains(id))
        .min()
        .map(|(_, id)| id)
}

// ----------------------------------------------------------------------------
// Customer-facing texts
// ----------------------------------------------------------------------------

fn acknowledgement() -> LocalizedMessage {
    LocalizedMessage::new(
        "Danke für deine Nachricht! Wir konnten das Problem gerade nicht nachstellen und \
         schauen uns dein Ticket genauer an. Falls du weitere Details hast, antworte gern hier.",
        "Thanks for your message! We could not reproduce the problem right now and will take \
         a closer look. If you have more details, just reply here.",
    )
}

fn fix_applied() -> LocalizedMessage {
    LocalizedMessage::new(
        "Gute Nachrichten: Wir haben das Problem automatisch behoben. Bitte lade die Seite neu \
         und melde dich, falls es weiterhin auftritt.",
        "Good news: we fixed the problem automatically. Please reload the page and let us know \
         if it still happens.",
    )
}

fn handed_to_team() -> LocalizedMessage {
    LocalizedMessage::new(
        "Danke für den Hinweis! Ein Teammitglied kümmert sich jetzt persönlich um dein Ticket.",
        "Thanks for letting us know! A team member is now looking into your ticket personally.",
    )
}

fn followup_notice() -> LocalizedMessage {
    LocalizedMessage::new(
        "Danke für deine Rückmeldung! Wir haben dein Ticket wieder geöffnet und priorisiert.",
        "Thanks for getting back to us! We reopened your ticket and raised its priority.",
    )
}

/// What a finished path wants written back
struct Conclusion {
    kind: EventKind,
    status: Option<TicketStatus>,
    message: Option<String>,
    payload: serde_json::Value,
}

impl Conclusion {
    fn new(kind: EventKind, status: Option<TicketStatus>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            status,
            message: None,
            payload,
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

// ============================================================================
// Router
// ============================================================================

pub struct TicketRouter {
    store: Arc<dyn TicketStore>,
    matcher: Arc<PatternMatcher>,
    verifier: Arc<ProblemVerifier>,
    planner: Arc<PlanGenerator>,
    executor: Arc<ActionExecutor>,
    knowledge: Arc<KnowledgeBase>,
    metrics: Arc<dyn MetricsSink>,
    tracker: MetricsTracker,
    interceptor: Arc<dyn RouterInterceptor>,
    hub: ChangeHub,
    feed: Arc<FeedStatus>,
    dedup: EventDeduplicator,
    settings: RouterSettings,
    instance_id: Uuid,
}

impl TicketRouter {
    pub fn new(parts: RouterParts, settings: RouterSettings) -> Self {
        Self {
            tracker: MetricsTracker::new(parts.store.clone()),
            store: parts.store,
            matcher: parts.matcher,
            verifier: parts.verifier,
            planner: parts.planner,
            executor: parts.executor,
            knowledge: parts.knowledge,
            metrics: parts.metrics,
            interceptor: Arc::new(TracingInterceptor),
            hub: parts.hub,
            feed: parts.feed,
            dedup: EventDeduplicator::with_ttl(settings.dedup_ttl),
            settings,
            instance_id: Uuid::new_v4(),
        }
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn RouterInterceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    pub fn feed(&self) -> &Arc<FeedStatus> {
        &self.feed
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Run one ticket through the pipeline.
    ///
    /// Errors here are store failures while loading the ticket or taking
    /// the claim; anything later ends as a `dispatch_error` outcome instead.
    pub async fn dispatch(&self, ticket_id: &str) -> RemedyResult<DispatchOutcome> {
        let started = Instant::now();
        let ticket = self.load(ticket_id).await?;
        if let Some(reason) = self.skip_reason(&ticket).await? {
            return Ok(DispatchOutcome::Skipped(reason));
        }

        let Some(claim_id) = self.claim(&ticket.id).await? else {
            info!("[ROUTER] {} is being processed elsewhere", ticket.id);
            return Ok(DispatchOutcome::Skipped(SkipReason::Claimed));
        };
        self.run_claimed(ticket_id, claim_id, started).await
    }

    /// Rest of a dispatch run once `claim_id` is held; always releases it
    async fn run_claimed(
        &self,
        ticket_id: &str,
        claim_id: Uuid,
        started: Instant,
    ) -> RemedyResult<DispatchOutcome> {
        // Another run may have concluded between the first check and the claim
        let checked = match self.load(ticket_id).await {
            Ok(ticket) => match self.skip_reason(&ticket).await {
                Ok(reason) => Ok((ticket, reason)),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        let ticket = match checked {
            Ok((ticket, None)) => ticket,
            Ok((_, Some(reason))) => {
                self.release(ticket_id, claim_id).await;
                return Ok(DispatchOutcome::Skipped(reason));
            }
            Err(e) => {
                self.release(ticket_id, claim_id).await;
                return Err(e);
            }
        };

        let fingerprint = ticket_fingerprint(&ticket);
        self.interceptor.on_dispatch_start(&ticket);
        let mut record = DiagnosisMetricsRecord::new(ticket_id);

        let kind = match self.process(ticket, &fingerprint, &mut record).await {
            Ok(kind) => kind,
            Err(e) => self.record_dispatch_error(ticket_id, &fingerprint, &e).await,
        };

        record.total_processing_time_ms = started.elapsed().as_millis() as u64;
        self.tracker.track(&record).await;
        self.release(ticket_id, claim_id).await;

        self.metrics.record_ticket_processed();
        self.metrics
            .record_latency(LatencyKind::Dispatch, started.elapsed().as_secs_f64() * 1000.0);
        info!(
            "[ROUTER] {} finished with {} in {}ms",
            ticket_id, kind, record.total_processing_time_ms
        );
        Ok(DispatchOutcome::Completed(kind))
    }

    async fn load(&self, ticket_id: &str) -> RemedyResult<Ticket> {
        self.store
            .get_ticket(ticket_id)
            .await?
            .ok_or_else(|| RemedyError::DispatchException {
                ticket_id: ticket_id.to_string(),
                message: "ticket not found".to_string(),
            })
    }

    /// Why the stored state of `ticket` needs no run
    async fn skip_reason(&self, ticket: &Ticket) -> RemedyResult<Option<SkipReason>> {
        if ticket.status.is_terminal() {
            debug!("[ROUTER] {} is {}, skipping", ticket.id, ticket.status);
            return Ok(Some(SkipReason::Terminal));
        }

        let fingerprint = ticket_fingerprint(ticket);
        let events = self.store.list_events(&ticket.id).await?;
        if let Some(previous) = last_outcome(&events) {
            if previous.fingerprint() == Some(fingerprint.as_str())
                && !previous.action_type.is_retryable()
            {
                debug!(
                    "[ROUTER] {} unchanged since {}, skipping",
                    ticket.id, previous.action_type
                );
                return Ok(Some(SkipReason::AlreadyHandled(previous.action_type)));
            }
        }
        Ok(None)
    }

    async fn process(
        &self,
        mut ticket: Ticket,
        fingerprint: &str,
        record: &mut DiagnosisMetricsRecord,
    ) -> RemedyResult<EventKind> {
        if ticket.status != TicketStatus::Investigating {
            ticket.status = TicketStatus::Investigating;
            ticket.updated_at = Utc::now();
            self.store.update_ticket(&ticket).await?;
        }

        let detect_started = Instant::now();
        let matched = self.matcher.match_ticket(&ticket);
        record.detection_time_ms = detect_started.elapsed().as_millis() as u64;
        self.interceptor.on_match(&ticket, matched.as_ref());

        let conclusion = match matched {
            Some(matched) => self.pattern_path(&ticket, &matched, record).await?,
            None => {
                debug!(
                    "[ROUTER] {}: {}",
                    ticket.id,
                    RemedyError::MatchNotFound(ticket.id.clone())
                );
                self.plan_path(&mut ticket, record).await?
            }
        };
        self.conclude(&mut ticket, fingerprint, conclusion).await
    }

    /// Write message, status and the outcome event, in that order.
    ///
    /// A failed message insert leaves the stored status untouched, so the
    /// `dispatch_error` that follows still sees a ticket under investigation.
    async fn conclude(
        &self,
        ticket: &mut Ticket,
        fingerprint: &str,
        conclusion: Conclusion,
    ) -> RemedyResult<EventKind> {
        if let Some(body) = conclusion.message {
            let message = TicketMessage::support(&ticket.id, SUPPORT_AUTHOR, body)
                .with_metadata(serde_json::json!({ "automated": true, "outcome": conclusion.kind }));
            self.store.insert_message(&message).await?;
        }

        if let Some(status) = conclusion.status {
            if ticket.status != status {
                if !ticket.status.can_transition_to(status) {
                    warn!(
                        "[ROUTER] {} moving {} → {} outside the usual lifecycle",
                        ticket.id, ticket.status, status
                    );
                }
                ticket.status = status;
            }
            if status == TicketStatus::Escalated {
                self.hand_to_escalation(ticket, conclusion.kind);
            }
        }
        ticket.updated_at = Utc::now();
        self.store.update_ticket(ticket).await?;

        let mut payload = conclusion.payload;
        if let Some(map) = payload.as_object_mut() {
            map.insert("fingerprint".into(), fingerprint.into());
            map.insert("status".into(), ticket.status.as_str().into());
            map.insert("instance_id".into(), self.instance_id.to_string().into());
        }
        self.store
            .append_event(&AutomationEvent::new(&ticket.id, conclusion.kind, payload))
            .await?;
        self.interceptor.on_outcome(ticket, conclusion.kind);
        Ok(conclusion.kind)
    }

    /// No escalated ticket is left without an owner: the escalation agent
    /// takes it and the escalation path names the outcome that caused it.
    fn hand_to_escalation(&self, ticket: &mut Ticket, outcome: EventKind) {
        let agent = AgentProfile::EscalationAgent.id();
        ticket.assigned_agent = Some(agent.to_string());
        if ticket.push_escalation(EscalationEntry::new(agent, TicketStatus::Escalated.as_str(), outcome.as_str())) {
            info!("[ROUTER] {} escalated to {} after {}", ticket.id, agent, outcome);
        }
    }

    async fn record_dispatch_error(&self, ticket_id: &str, fingerprint: &str, e: &RemedyError) -> EventKind {
        error!("[ROUTER] Dispatch of {} failed: {}", ticket_id, e);
        self.interceptor.on_error(ticket_id, e);
        self.metrics.record_error("router", &e.to_string(), Some(ticket_id));

        let event = AutomationEvent::new(
            ticket_id,
            EventKind::DispatchError,
            serde_json::json!({
                "fingerprint": fingerprint,
                "code": e.code(),
                "error": e.to_string(),
                "instance_id": self.instance_id.to_string(),
            }),
        );
        if let Err(store_err) = self.store.append_event(&event).await {
            error!(
                "[ROUTER] Could not record dispatch error for {}: {}",
                ticket_id, store_err
            );
        }
        EventKind::DispatchError
    }

    // ------------------------------------------------------------------------
    // Paths
    // ------------------------------------------------------------------------

    async fn plan_path(
        &self,
        ticket: &mut Ticket,
        record: &mut DiagnosisMetricsRecord,
    ) -> RemedyResult<Conclusion> {
        let agent = AgentProfile::primary_for(ticket);
        let query = format!("{} {} {}", ticket.title, ticket.description, agent.label());
        let documents = self.knowledge.query(&query, PLAN_CONTEXT_DOCS);

        let plan_started = Instant::now();
        let plan = self.planner.generate(agent, ticket, &documents).await;
        record.fix_generation_time_ms = plan_started.elapsed().as_millis() as u64;
        if !plan.fallback {
            record.detection_method = Some(DetectionMethod::Llm);
        }

        let tier2 = AgentProfile::tier2_for_plan(ticket, &plan);
        ticket.assigned_agent = Some(agent.id().to_string());

        for (index, action) in plan.actions.iter().enumerate() {
            self.record_plan_action(ticket, agent, &tier2, index, action).await?;
        }

        info!(
            "[ROUTER] {} planned by {} ({} actions, fallback={})",
            ticket.id,
            agent.id(),
            plan.actions.len(),
            plan.fallback
        );
        Ok(Conclusion::new(
            EventKind::PlanGenerated,
            Some(plan.status.ticket_status()),
            serde_json::json!({
                "agent": agent.id(),
                "tier2_agents": tier2.iter().map(|a| a.id()).collect::<Vec<_>>(),
                "sources": documents.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
                "plan": plan,
            }),
        )
        .with_message(plan.summary.clone()))
    }

    /// One `plan_action` row per surviving action, naming who carries it out.
    ///
    /// Customer answers travel in the summary reply; everything else is
    /// queued for the first agent able to perform it. Nothing runs here:
    /// remote commands only ever run through the approval gate.
    async fn record_plan_action(
        &self,
        ticket: &Ticket,
        primary: AgentProfile,
        tier2: &[AgentProfile],
        index: usize,
        action: &ResolutionAction,
    ) -> RemedyResult<()> {
        let owner = std::iter::once(primary)
            .chain(tier2.iter().copied())
            .find(|a| a.can_perform_action(action.kind))
            .unwrap_or(primary);
        let handling = match action.kind {
            ActionKind::AnswerCustomer => "customer_reply",
            ActionKind::ManualFollowup => "internal_note",
            _ => "queued",
        };
        debug!(
            "[ROUTER] {} plan action {}: {} for {} ({})",
            ticket.id,
            index,
            action.kind,
            owner.id(),
            handling
        );
        self.store
            .append_event(&AutomationEvent::new(
                &ticket.id,
                EventKind::PlanAction,
                serde_json::json!({
                    "index": index,
                    "type": action.kind,
                    "description": action.description,
                    "payload": action.payload,
                    "owner": owner.id(),
                    "handling": handling,
                    "instance_id": self.instance_id.to_string(),
                }),
            ))
            .await
    }

    async fn pattern_path(
        &self,
        ticket: &Ticket,
        matched: &PatternMatch,
        record: &mut DiagnosisMetricsRecord,
    ) -> RemedyResult<Conclusion> {
        record.problem_detected = true;
        record.problem_type = Some(matched.pattern_id.clone());
        record.detection_method = Some(match matched.source {
            MatchSource::Signature => DetectionMethod::Signature,
            MatchSource::Keyword => DetectionMethod::Keyword,
            MatchSource::Semantic => DetectionMethod::Semantic,
        });
        let locale = ticket.locale();
        let base = serde_json::json!({
            "pattern_id": matched.pattern_id,
            "summary": matched.summary,
            "source": matched.source,
            "score": matched.score,
        });

        let verification = self.verifier.verify(ticket, matched).await;
        self.interceptor.on_verification(ticket, &verification);
        let evidence = serde_json::to_value(&verification.evidence).unwrap_or_default();

        let confirmed = match ConfirmedProblem::try_from(verification) {
            Ok(confirmed) => confirmed,
            Err(e) => {
                self.interceptor.on_error(&ticket.id, &e);
                return Ok(Conclusion::new(
                    EventKind::VerificationFailed,
                    Some(TicketStatus::WaitingCustomer),
                    merge(base, serde_json::json!({ "code": e.code(), "reason": e.to_string(), "evidence": evidence })),
                )
                .with_message(acknowledgement().for_locale(locale)));
            }
        };

        if !matched.has_instructions() {
            record.fix_generated = true;
            record.fix_type = Some("autopatch_plan".to_string());
            let plan_files = self.persist_plans(ticket, matched).await;
            let message = matched
                .customer_message
                .as_ref()
                .map(|m| m.for_locale(locale).to_string())
                .unwrap_or_else(|| handed_to_team().for_locale(locale).to_string());
            return Ok(Conclusion::new(
                EventKind::AutopatchPlanned,
                Some(TicketStatus::Escalated),
                merge(
                    base,
                    serde_json::json!({
                        "fix_name": matched.fix_name(),
                        "actions": matched.actions,
                        "plan_files": plan_files,
                        "evidence": evidence,
                    }),
                ),
            )
            .with_message(message));
        }

        record.fix_generated = true;
        record.fix_type = matched.instructions.first().map(|i| i.type_name().to_string());

        let report = self.executor.execute(ticket, &confirmed, matched).await?;
        for result in &report.results {
            self.interceptor.on_action(ticket, result);
        }
        record.fix_application_time_ms = report.duration_ms;
        self.metrics
            .record_latency(LatencyKind::Autofix, report.duration_ms as f64);

        if let Some(halt) = &report.halt {
            return Ok(self.halted(ticket, halt, &report, base));
        }

        record.fix_applied = report.any_attempted();
        let results = serde_json::to_value(&report.results).unwrap_or_default();
        if !report.all_applied() {
            self.metrics.record_autopatch(false);
            let failed: Vec<&str> = report.failures().iter().map(|r| r.detail.as_str()).collect();
            warn!("[ROUTER] Autopatch for {} failed: {}", ticket.id, failed.join("; "));
            return Ok(Conclusion::new(
                EventKind::AutopatchFailed,
                Some(TicketStatus::Escalated),
                merge(base, serde_json::json!({ "results": results, "stage": "apply" })),
            )
            .with_message(handed_to_team().for_locale(locale)));
        }

        let reverify_started = Instant::now();
        let after = self.verifier.verify(ticket, matched).await;
        self.interceptor.on_verification(ticket, &after);
        record.post_fix_verification_time_ms = reverify_started.elapsed().as_millis() as u64;
        // Evidence read from the ticket text cannot observe the fix
        let still_broken = after.live && after.problem_exists;
        record.post_fix_verification_passed = !still_broken;
        record.fix_success = !still_broken;
        self.metrics.record_autopatch(record.fix_success);

        if still_broken {
            warn!(
                "[ROUTER] {} still shows {} after the fix: {}",
                ticket.id,
                matched.pattern_id,
                after.reason()
            );
            return Ok(Conclusion::new(
                EventKind::AutopatchFailed,
                Some(TicketStatus::Escalated),
                merge(
                    base,
                    serde_json::json!({
                        "results": results,
                        "stage": "re-verification",
                        "reason": after.reason(),
                    }),
                ),
            )
            .with_message(handed_to_team().for_locale(locale)));
        }

        let message = matched
            .customer_message
            .as_ref()
            .unwrap_or(&fix_applied())
            .for_locale(locale)
            .to_string();
        Ok(Conclusion::new(
            EventKind::AutopatchApplied,
            Some(TicketStatus::Resolved),
            merge(
                base,
                serde_json::json!({
                    "results": results,
                    "files_written": report.files_written(),
                    "duration_ms": report.duration_ms,
                    "reverified_live": after.live,
                }),
            ),
        )
        .with_message(message))
    }

    /// Plan documents of a match without instructions.
    ///
    /// A failed write is logged and skipped; the ticket still escalates.
    async fn persist_plans(&self, ticket: &Ticket, matched: &PatternMatch) -> Vec<String> {
        let mut written = Vec::new();
        for action in matched.actions.iter().filter(|a| a.kind == ActionKind::AutopatchPlan) {
            match self.executor.persist_plan(ticket, action, &matched.summary).await {
                Ok(path) => written.push(path),
                Err(e) => {
                    warn!("[ROUTER] Could not write plan for {}: {}", ticket.id, e);
                    self.metrics.record_error("autopatch_plan", &e.to_string(), Some(&ticket.id));
                }
            }
        }
        written
    }

    fn halted(
        &self,
        ticket: &Ticket,
        halt: &ExecutionHalt,
        report: &ExecutionReport,
        base: serde_json::Value,
    ) -> Conclusion {
        let locale = ticket.locale();
        let results = serde_json::to_value(&report.results).unwrap_or_default();
        match halt {
            ExecutionHalt::CommandRejected { command, reason } => {
                let e = RemedyError::CommandRejected {
                    command: command.clone(),
                    reason: reason.clone(),
                };
                self.interceptor.on_error(&ticket.id, &e);
                self.metrics.record_error("whitelist", &e.to_string(), Some(&ticket.id));
                Conclusion::new(
                    EventKind::CommandRejected,
                    Some(TicketStatus::Escalated),
                    merge(base, serde_json::json!({ "command": command, "reason": reason })),
                )
                .with_message(handed_to_team().for_locale(locale))
            }
            ExecutionHalt::ApprovalPending { request_id } => {
                let e = RemedyError::ApprovalTimeout {
                    ticket_id: ticket.id.clone(),
                    instruction_type: "remote-command".to_string(),
                };
                self.interceptor.on_error(&ticket.id, &e);
                Conclusion::new(
                    EventKind::ApprovalDeferred,
                    Some(TicketStatus::Investigating),
                    merge(
                        base,
                        serde_json::json!({ "request_id": request_id, "results": results }),
                    ),
                )
            }
            ExecutionHalt::ApprovalDenied { request_id } => Conclusion::new(
                EventKind::ApprovalDenied,
                Some(TicketStatus::Escalated),
                merge(base, serde_json::json!({ "request_id": request_id, "results": results })),
            )
            .with_message(handed_to_team().for_locale(locale)),
        }
    }

    // ------------------------------------------------------------------------
    // Claims
    // ------------------------------------------------------------------------

    async fn claim(&self, ticket_id: &str) -> RemedyResult<Option<Uuid>> {
        let claim_id = Uuid::new_v4();
        self.store
            .append_event(&AutomationEvent::new(
                ticket_id,
                EventKind::ProcessingClaimed,
                serde_json::json!({
                    "claim_id": claim_id.to_string(),
                    "instance_id": self.instance_id.to_string(),
                }),
            ))
            .await?;

        let events = self.store.list_events(ticket_id).await?;
        if winning_claim(&events, Utc::now(), self.settings.claim_ttl) == Some(claim_id) {
            return Ok(Some(claim_id));
        }
        self.release(ticket_id, claim_id).await;
        Ok(None)
    }

    async fn release(&self, ticket_id: &str, claim_id: Uuid) {
        let event = AutomationEvent::new(
            ticket_id,
            EventKind::ProcessingReleased,
            serde_json::json!({ "claim_id": claim_id.to_string() }),
        );
        if let Err(e) = self.store.append_event(&event).await {
            // An unreleased claim expires after the claim TTL
            warn!("[ROUTER] Could not release claim on {}: {}", ticket_id, e);
        }
    }

    // ------------------------------------------------------------------------
    // Follow-ups and bootstrap
    // ------------------------------------------------------------------------

    /// Reopen and escalate a settled ticket after a customer reply.
    ///
    /// Returns true when the ticket was reopened.
    pub async fn handle_customer_message(&self, ticket_id: &str) -> RemedyResult<bool> {
        let Some(mut ticket) = self.store.get_ticket(ticket_id).await? else {
            return Ok(false);
        };
        if ticket.status.is_open_for_bootstrap() {
            return Ok(false);
        }
        let thread = self.store.list_messages(ticket_id).await?;
        if !should_escalate_followup(&thread) {
            return Ok(false);
        }

        let previous_status = ticket.status;
        let previous_priority = ticket.priority;
        ticket.status = TicketStatus::Investigating;
        ticket.priority = ticket.priority.escalated();
        ticket.push_escalation(EscalationEntry::customer_followup());
        ticket.updated_at = Utc::now();
        self.store.update_ticket(&ticket).await?;

        let notice = TicketMessage::support(
            ticket_id,
            SUPPORT_AUTHOR,
            followup_notice().for_locale(ticket.locale()),
        )
        .with_metadata(serde_json::json!({ "automated": true }));
        self.store.insert_message(&notice).await?;
        self.store
            .append_event(&AutomationEvent::new(
                ticket_id,
                EventKind::CustomerFollowup,
                serde_json::json!({
                    "previous_status": previous_status.as_str(),
                    "previous_priority": previous_priority.as_str(),
                    "priority": ticket.priority.as_str(),
                }),
            ))
            .await?;

        info!(
            "[ROUTER] {} reopened after customer follow-up ({} → {})",
            ticket_id, previous_priority, ticket.priority
        );
        Ok(true)
    }

    /// Tickets in `new`/`investigating` without an open approval request
    pub async fn bootstrap_candidates(&self) -> RemedyResult<Vec<String>> {
        let tickets = self
            .store
            .list_tickets(&[TicketStatus::New, TicketStatus::Investigating])
            .await?;
        let mut candidates = Vec::new();
        for ticket in tickets {
            let events = self.store.list_events(&ticket.id).await?;
            if ApprovalLedger::from_events(&events).has_unresolved() {
                debug!("[ROUTER] {} waits for an approval decision", ticket.id);
                continue;
            }
            candidates.push(ticket.id);
        }
        Ok(candidates)
    }

    /// Handle one change; errors are logged
    pub async fn handle_change(&self, event: ChangeEvent) {
        if self.dedup.is_duplicate(&event).await {
            debug!("[ROUTER] Duplicate change {}", event.dedup_key());
            return;
        }

        if let ChangeEvent::TicketInserted { at, .. } = &event {
            let waited = (Utc::now() - *at).num_milliseconds().max(0);
            self.metrics.record_latency(LatencyKind::Insert, waited as f64);
        }

        if let ChangeEvent::MessageInserted { author_type, ticket_id, .. } = &event {
            if *author_type != AuthorType::Customer {
                return;
            }
            if let Err(e) = self.handle_customer_message(ticket_id).await {
                warn!("[ROUTER] Follow-up handling for {} failed: {}", ticket_id, e);
                self.interceptor.on_error(ticket_id, &e);
            }
        }

        let ticket_id = event.ticket_id();
        if let Err(e) = self.dispatch(ticket_id).await {
            warn!("[ROUTER] Could not dispatch {}: {}", ticket_id, e);
            self.interceptor.on_error(ticket_id, &e);
            self.metrics.record_error("router", &e.to_string(), Some(ticket_id));
        }
    }

    // ------------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------------

    fn spawn_change(self: &Arc<Self>, tasks: &mut JoinSet<()>, event: ChangeEvent) {
        let router = Arc::clone(self);
        tasks.spawn(async move { router.handle_change(event).await });
    }

    fn spawn_dispatch(self: &Arc<Self>, tasks: &mut JoinSet<()>, ticket_id: String) {
        let router = Arc::clone(self);
        tasks.spawn(async move {
            if let Err(e) = router.dispatch(&ticket_id).await {
                warn!("[ROUTER] Bootstrap dispatch of {} failed: {}", ticket_id, e);
                router.interceptor.on_error(&ticket_id, &e);
            }
        });
    }

    async fn poll(self: &Arc<Self>, tasks: &mut JoinSet<()>, cursor: &mut DateTime<Utc>) {
        match self.store.changes_since(*cursor).await {
            Ok(changes) => {
                for change in changes {
                    if change.at() > *cursor {
                        *cursor = change.at();
                    }
                    self.spawn_change(tasks, change);
                }
            }
            Err(e) => warn!("[ROUTER] Change poll failed: {}", e),
        }

        match self.bootstrap_candidates().await {
            Ok(ids) => {
                if !ids.is_empty() {
                    debug!("[ROUTER] Bootstrap pass over {} tickets", ids.len());
                }
                for id in ids {
                    self.spawn_dispatch(tasks, id);
                }
            }
            Err(e) => warn!("[ROUTER] Bootstrap pass failed: {}", e),
        }

        let pruned = self.dedup.prune_expired().await;
        if pruned > 0 {
            debug!("[ROUTER] Pruned {} dedup entries", pruned);
        }
    }

    /// Consume the change stream and the poll timer until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut changes = self.hub.subscribe();
        self.feed.set_channel("subscribed");
        info!(
            "[ROUTER] Running (instance {}, poll every {:?})",
            self.instance_id, self.settings.poll_interval
        );

        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut cursor = Utc::now();
        let mut ticker = tokio::time::interval(self.settings.poll_interval);

        loop {
            tokio::select! {
                received = changes.recv() => match received {
                    Ok(event) => self.spawn_change(&mut tasks, event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("[ROUTER] Change stream lagged, {} events missed", missed);
                        self.feed.record_lag(missed);
                        // Missed changes come back through the next poll
                        ticker.reset_immediately();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("[ROUTER] Change stream closed, resubscribing");
                        self.feed.set_channel("reconnecting");
                        self.feed.record_reconnect();
                        changes = self.hub.subscribe();
                        self.feed.set_channel("subscribed");
                    }
                },
                _ = ticker.tick() => self.poll(&mut tasks, &mut cursor).await,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("[ROUTER] Dispatch task panicked: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        drop(changes);
        self.feed.set_channel("closed");
        info!("[ROUTER] Draining {} in-flight dispatches", tasks.len());
        let drained = tokio::time::timeout(self.settings.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("[ROUTER] Grace period over, aborting {} dispatches", tasks.len());
            tasks.abort_all();
        }
        info!("[ROUTER] Stopped");
    }
}

#[async_trait]
impl RemediationDispatcher for TicketRouter {
    async fn dispatch_ticket(&self, ticket_id: &str) -> RemedyResult<EventKind> {
        match self.dispatch(ticket_id).await? {
            DispatchOutcome::Completed(kind) => Ok(kind),
            DispatchOutcome::Skipped(SkipReason::AlreadyHandled(kind)) => Ok(kind),
            DispatchOutcome::Skipped(reason) => Err(RemedyError::DispatchException {
                ticket_id: ticket_id.to_string(),
                message: reason.to_string(),
            }),
        }
    }
}

fn merge(mut base: serde_json::Value, extra: serde_json::Value) -> serde_json::Value {
    if let (Some(target), serde_json::Value::Object(extra)) = (base.as_object_mut(), extra) {
        target.extend(extra);
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{ApprovalGateway, FakeNotifier};
    use crate::config::{ApprovalConfig, VerifierConfig};
    use crate::file_writer::LocalFileWriter;
    use crate::interceptor::RecordingInterceptor;
    use crate::metrics::MemorySink;
    use crate::remote_exec::FakeCommandExecutor;
    use crate::store::MemoryStore;
    use remedy_common::config_index::ConfigurationIndex;
    use remedy_common::llm_client::FakeLlmClient;
    use remedy_common::patterns::MatchSettings;
    use remedy_common::retry::RetryPolicy;
    use remedy_common::ticket::Priority;
    use tempfile::{tempdir, TempDir};

    struct Harness {
        _dir: TempDir,
        store: Arc<MemoryStore>,
        recorder: Arc<RecordingInterceptor>,
        metrics: Arc<MemorySink>,
        router: Arc<TicketRouter>,
    }

    fn harness() -> Harness {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("messages")).unwrap();
        for locale in ["de", "en", "fr", "sw"] {
            std::fs::write(
                dir.path().join(format!("messages/{}.json", locale)),
                "{\"common\":{\"save\":\"x\"}}",
            )
            .unwrap();
        }

        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(ConfigurationIndex::default());
        let approvals = Arc::new(ApprovalGateway::new(
            store.clone(),
            Arc::new(FakeNotifier::new()),
            &ApprovalConfig {
                timeout_secs: 10,
                ..ApprovalConfig::default()
            },
            RetryPolicy::no_retry(),
        ));
        let executor = Arc::new(ActionExecutor::new(
            store.clone(),
            Arc::new(LocalFileWriter),
            Arc::new(FakeCommandExecutor::new()),
            approvals,
            RetryPolicy::no_retry(),
            Duration::from_secs(5),
            dir.path(),
        ));
        let metrics = Arc::new(MemorySink::new());
        let recorder = Arc::new(RecordingInterceptor::new());
        let parts = RouterParts {
            store: store.clone(),
            matcher: Arc::new(PatternMatcher::new(ConfigurationIndex::default(), MatchSettings::default())),
            verifier: Arc::new(ProblemVerifier::new(dir.path(), index, &VerifierConfig::default())),
            planner: Arc::new(PlanGenerator::new(
                Arc::new(FakeLlmClient::unavailable()),
                RetryPolicy::no_retry(),
                Duration::from_secs(5),
            )),
            executor,
            knowledge: Arc::new(KnowledgeBase::from_documents(Vec::new())),
            metrics: metrics.clone(),
            hub: store.hub().clone(),
            feed: Arc::new(FeedStatus::new()),
        };
        let router = TicketRouter::new(parts, RouterSettings::default())
            .with_interceptor(recorder.clone());
        Harness {
            _dir: dir,
            store,
            recorder,
            metrics,
            router: Arc::new(router),
        }
    }

    fn outcomes(store: &MemoryStore, ticket_id: &str) -> Vec<EventKind> {
        store
            .all_events()
            .into_iter()
            .filter(|e| e.ticket_id == ticket_id && e.action_type.is_outcome())
            .map(|e| e.action_type)
            .collect()
    }

    #[test]
    fn test_fingerprint_ignores_status() {
        let mut ticket = Ticket::new("t-1", "Upload", "broken");
        let before = ticket_fingerprint(&ticket);
        ticket.status = TicketStatus::Escalated;
        ticket.updated_at = Utc::now() + ChronoDuration::hours(1);
        assert_eq!(ticket_fingerprint(&ticket), before);
        ticket.latest_message = Some("still broken".into());
        assert_ne!(ticket_fingerprint(&ticket), before);
    }

    #[test]
    fn test_oldest_unreleased_claim_wins() {
        let now = Utc::now();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut first = AutomationEvent::new("t", EventKind::ProcessingClaimed, serde_json::json!({"claim_id": a.to_string()}));
        first.created_at = now - ChronoDuration::seconds(5);
        let second = AutomationEvent::new("t", EventKind::ProcessingClaimed, serde_json::json!({"claim_id": b.to_string()}));
        let ttl = Duration::from_secs(60);

        assert_eq!(winning_claim(&[first.clone(), second.clone()], now, ttl), Some(a));

        let release = AutomationEvent::new("t", EventKind::ProcessingReleased, serde_json::json!({"claim_id": a.to_string()}));
        assert_eq!(winning_claim(&[first.clone(), second.clone(), release], now, ttl), Some(b));

        // A stale claim no longer blocks
        first.created_at = now - ChronoDuration::seconds(120);
        assert_eq!(winning_claim(&[first, second], now, ttl), Some(b));
    }

    #[tokio::test]
    async fn test_missing_message_is_fixed_and_resolved() {
        let h = harness();
        let mut ticket = Ticket::new("t-1", "Form text missing", "MISSING_MESSAGE: form.submit.label");
        ticket.source_metadata = serde_json::json!({ "locale": "en" });
        h.store.create_ticket(&ticket).await.unwrap();

        let outcome = h.router.dispatch("t-1").await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed(EventKind::AutopatchApplied));

        let stored = h.store.get_ticket("t-1").await.unwrap().unwrap();
        assert_eq!(stored.status, TicketStatus::Resolved);
        let en: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(h._dir.path().join("messages/en.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(en["form"]["submit"]["label"], "Add text");

        let messages = h.store.list_messages("t-1").await.unwrap();
        assert!(messages.last().unwrap().body.starts_with("Thanks"));
        assert_eq!(outcomes(&h.store, "t-1"), vec![EventKind::AutopatchApplied]);
        assert_eq!(h.metrics.snapshot().autopatch_success, 1);

        let stages = h.recorder.stages();
        assert_eq!(stages.first().unwrap(), "start:t-1");
        assert!(stages.contains(&"verify:t-1:true".to_string()));
        assert!(stages.contains(&"verify:t-1:false".to_string()));
        assert_eq!(stages.last().unwrap(), "outcome:t-1:autopatch_applied");

        let funnel = h.store.list_metrics(Utc::now() - ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(funnel.len(), 1);
        assert!(funnel[0].fix_success && funnel[0].post_fix_verification_passed);
    }

    #[tokio::test]
    async fn test_present_key_ends_in_verification_failed() {
        let h = harness();
        let ticket = Ticket::new("t-2", "Label", "MISSING_MESSAGE: common.save");
        h.store.create_ticket(&ticket).await.unwrap();

        let outcome = h.router.dispatch("t-2").await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed(EventKind::VerificationFailed));
        let stored = h.store.get_ticket("t-2").await.unwrap().unwrap();
        assert_eq!(stored.status, TicketStatus::WaitingCustomer);
        assert!(!h
            .store
            .all_events()
            .iter()
            .any(|e| e.action_type == EventKind::ActionResult));
        assert!(h.recorder.stages().contains(&"error:t-2:verification_failed".to_string()));
    }

    #[tokio::test]
    async fn test_unmatched_ticket_gets_fallback_plan() {
        let h = harness();
        let ticket = Ticket::new("t-3", "Frage zur Rechnung", "Wann kommt meine Rechnung?");
        h.store.create_ticket(&ticket).await.unwrap();

        let outcome = h.router.dispatch("t-3").await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed(EventKind::PlanGenerated));
        let stored = h.store.get_ticket("t-3").await.unwrap().unwrap();
        assert_eq!(stored.status, TicketStatus::WaitingCustomer);
        assert_eq!(stored.assigned_agent.as_deref(), Some("support-agent"));

        let event = h
            .store
            .all_events()
            .into_iter()
            .find(|e| e.action_type == EventKind::PlanGenerated)
            .unwrap();
        assert_eq!(event.payload["plan"]["fallback"], true);
        assert_eq!(event.fingerprint(), Some(ticket_fingerprint(&stored).as_str()));

        let actions: Vec<_> = h
            .store
            .all_events()
            .into_iter()
            .filter(|e| e.action_type == EventKind::PlanAction)
            .collect();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].payload["type"], "manual_followup");
        assert_eq!(actions[0].payload["owner"], "support-agent");
        assert_eq!(actions[0].payload["handling"], "internal_note");
    }

    #[tokio::test]
    async fn test_same_fingerprint_is_not_processed_twice() {
        let h = harness();
        let ticket = Ticket::new("t-4", "Upload fails", "Cannot read properties of null (reading 'file')");
        h.store.create_ticket(&ticket).await.unwrap();

        let first = h.router.dispatch("t-4").await.unwrap();
        assert_eq!(first, DispatchOutcome::Completed(EventKind::AutopatchPlanned));

        // Escalated is not terminal, but nothing changed on the ticket
        let second = h.router.dispatch("t-4").await.unwrap();
        assert_eq!(
            second,
            DispatchOutcome::Skipped(SkipReason::AlreadyHandled(EventKind::AutopatchPlanned))
        );
        assert_eq!(outcomes(&h.store, "t-4").len(), 1);
    }

    #[tokio::test]
    async fn test_escalated_outcome_gets_an_owner_and_a_plan_document() {
        let h = harness();
        let ticket = Ticket::new("t-9", "Upload fails", "Cannot read properties of null (reading 'file')");
        h.store.create_ticket(&ticket).await.unwrap();

        let outcome = h.router.dispatch("t-9").await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed(EventKind::AutopatchPlanned));
        let stored = h.store.get_ticket("t-9").await.unwrap().unwrap();
        assert_eq!(stored.status, TicketStatus::Escalated);
        assert_eq!(stored.assigned_agent.as_deref(), Some("escalation-agent"));
        assert_eq!(stored.escalation_path.len(), 1);
        assert_eq!(stored.escalation_path[0].status, "escalated");
        assert_eq!(stored.escalation_path[0].trigger, "autopatch_planned");

        let planned = h
            .store
            .all_events()
            .into_iter()
            .find(|e| e.action_type == EventKind::AutopatchPlanned)
            .unwrap();
        let path = planned.payload["plan_files"][0].as_str().unwrap().to_string();
        assert!(path.starts_with("docs/autopatches/"));
        assert!(h._dir.path().join(path).exists());
    }

    #[tokio::test]
    async fn test_terminal_ticket_is_skipped() {
        let h = harness();
        let mut ticket = Ticket::new("t-5", "Done", "nothing");
        ticket.status = TicketStatus::Closed;
        h.store.create_ticket(&ticket).await.unwrap();
        assert_eq!(
            h.router.dispatch("t-5").await.unwrap(),
            DispatchOutcome::Skipped(SkipReason::Terminal)
        );
    }

    #[tokio::test]
    async fn test_foreign_claim_blocks_dispatch() {
        let h = harness();
        h.store.create_ticket(&Ticket::new("t-6", "x", "y")).await.unwrap();
        let mut foreign = AutomationEvent::new(
            "t-6",
            EventKind::ProcessingClaimed,
            serde_json::json!({ "claim_id": Uuid::new_v4().to_string() }),
        );
        foreign.created_at = Utc::now() - ChronoDuration::seconds(10);
        h.store.append_event(&foreign).await.unwrap();

        assert_eq!(
            h.router.dispatch("t-6").await.unwrap(),
            DispatchOutcome::Skipped(SkipReason::Claimed)
        );
        assert!(outcomes(&h.store, "t-6").is_empty());
    }

    #[tokio::test]
    async fn test_ticket_is_reread_after_claim() {
        let h = harness();
        h.store.create_ticket(&Ticket::new("t-7", "Upload", "broken")).await.unwrap();
        let claim_id = h.router.claim("t-7").await.unwrap().unwrap();

        // Closed elsewhere after the pre-claim check
        let mut closed = h.store.get_ticket("t-7").await.unwrap().unwrap();
        closed.status = TicketStatus::Closed;
        h.store.update_ticket(&closed).await.unwrap();

        let outcome = h.router.run_claimed("t-7", claim_id, Instant::now()).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Skipped(SkipReason::Terminal));
        assert!(outcomes(&h.store, "t-7").is_empty());
        assert!(h.recorder.stages().is_empty());
        // The claim was released
        assert!(h.router.claim("t-7").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_reply_leaves_status_unsettled() {
        let h = harness();
        let ticket = Ticket::new("t-8", "Frage zur Rechnung", "Wann kommt meine Rechnung?");
        h.store.create_ticket(&ticket).await.unwrap();
        h.store.reject_message_inserts(true);

        let outcome = h.router.dispatch("t-8").await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed(EventKind::DispatchError));
        let stored = h.store.get_ticket("t-8").await.unwrap().unwrap();
        assert_eq!(stored.status, TicketStatus::Investigating);
        assert_eq!(outcomes(&h.store, "t-8"), vec![EventKind::DispatchError]);

        // The retryable outcome lets the next pass finish the job
        h.store.reject_message_inserts(false);
        let retry = h.router.dispatch("t-8").await.unwrap();
        assert_eq!(retry, DispatchOutcome::Completed(EventKind::PlanGenerated));
        let stored = h.store.get_ticket("t-8").await.unwrap().unwrap();
        assert_eq!(stored.status, TicketStatus::WaitingCustomer);
        assert_eq!(h.store.list_messages("t-8").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_customer_followup_reopens_and_escalates() {
        let h = harness();
        let mut ticket = Ticket::new("t-7", "Frage", "Wie geht das?");
        ticket.status = TicketStatus::Resolved;
        ticket.priority = Priority::High;
        h.store.create_ticket(&ticket).await.unwrap();
        h.store
            .insert_message(&TicketMessage::support("t-7", "Support", "Erledigt"))
            .await
            .unwrap();
        h.store
            .insert_message(&TicketMessage::customer("t-7", "Kunde", "Geht immer noch nicht"))
            .await
            .unwrap();

        assert!(h.router.handle_customer_message("t-7").await.unwrap());
        let stored = h.store.get_ticket("t-7").await.unwrap().unwrap();
        assert_eq!(stored.status, TicketStatus::Investigating);
        assert_eq!(stored.priority, Priority::Urgent);
        assert_eq!(stored.escalation_path.len(), 1);

        // Second follow-up does not duplicate the escalation entry
        let mut settled = stored.clone();
        settled.status = TicketStatus::Escalated;
        h.store.update_ticket(&settled).await.unwrap();
        assert!(h.router.handle_customer_message("t-7").await.unwrap());
        let stored = h.store.get_ticket("t-7").await.unwrap().unwrap();
        assert_eq!(stored.escalation_path.len(), 1);
        assert!(h
            .store
            .all_events()
            .iter()
            .any(|e| e.action_type == EventKind::CustomerFollowup));
    }

    #[tokio::test]
    async fn test_followup_without_support_reply_is_ignored() {
        let h = harness();
        let mut ticket = Ticket::new("t-8", "Frage", "Wie geht das?");
        ticket.status = TicketStatus::WaitingCustomer;
        h.store.create_ticket(&ticket).await.unwrap();
        h.store
            .insert_message(&TicketMessage::customer("t-8", "Kunde", "Hallo?"))
            .await
            .unwrap();
        assert!(!h.router.handle_customer_message("t-8").await.unwrap());
    }

    #[tokio::test]
    async fn test_bootstrap_skips_tickets_waiting_for_approval() {
        let h = harness();
        h.store.create_ticket(&Ticket::new("open", "a", "b")).await.unwrap();
        h.store.create_ticket(&Ticket::new("waiting", "a", "b")).await.unwrap();
        let request = remedy_common::event::ApprovalPayload::request("remote-command", "restart", Some("pm2 restart x"));
        h.store
            .append_event(&AutomationEvent::new(
                "waiting",
                EventKind::Approval,
                serde_json::to_value(&request).unwrap(),
            ))
            .await
            .unwrap();

        let candidates = h.router.bootstrap_candidates().await.unwrap();
        assert_eq!(candidates, vec!["open".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_dispatches_pushed_changes_and_drains() {
        let h = harness();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(h.router.clone().run(rx));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.router.feed().is_subscribed());

        // MemoryStore publishes the insert on the shared hub
        h.store
            .create_ticket(&Ticket::new("t-9", "Rechnung", "Frage zur Rechnung"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(outcomes(&h.store, "t-9"), vec![EventKind::PlanGenerated]);
        assert_eq!(h.router.feed().channel(), "closed");
    }
}
