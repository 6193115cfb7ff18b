//! End-to-end remediation scenarios through the public router API.
//!
//! Each scenario wires a real router over the in-memory store, a temp
//! repository root and the fake seams, then checks the audit log, the
//! ticket and the thread afterwards.

use chrono::{Duration as ChronoDuration, Utc};
use remedy_common::config_index::{ConfigurationIndex, KnowledgeDocument};
use remedy_common::event::{AutomationEvent, EventKind};
use remedy_common::llm_client::FakeLlmClient;
use remedy_common::patterns::{MatchSettings, PatternMatcher};
use remedy_common::retry::RetryPolicy;
use remedy_common::ticket::{AuthorType, Priority, Ticket, TicketMessage, TicketStatus};
use remedyd::approval::{ApprovalGateway, ApprovalLedger, FakeNotifier};
use remedyd::change_feed::{ChangeEvent, FeedStatus};
use remedyd::config::{ApprovalConfig, VerifierConfig};
use remedyd::executor::ActionExecutor;
use remedyd::file_writer::LocalFileWriter;
use remedyd::interceptor::RecordingInterceptor;
use remedyd::knowledge::KnowledgeBase;
use remedyd::metrics::{MemorySink, MetricsSink};
use remedyd::planner::PlanGenerator;
use remedyd::remote_exec::FakeCommandExecutor;
use remedyd::router::{DispatchOutcome, RouterParts, RouterSettings, TicketRouter};
use remedyd::store::{MemoryStore, TicketStore};
use remedyd::verifier::ProblemVerifier;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

struct World {
    dir: TempDir,
    store: Arc<MemoryStore>,
    notifier: Arc<FakeNotifier>,
    commands: Arc<FakeCommandExecutor>,
    metrics: Arc<MemorySink>,
    recorder: Arc<RecordingInterceptor>,
    router: TicketRouter,
}

fn deployment_doc() -> KnowledgeDocument {
    KnowledgeDocument {
        id: "docs/deployment.md".into(),
        title: "Deployment".into(),
        path: "docs/deployment.md".into(),
        content: "# Deployment\nThe bot runs as a pm2 process on the production server.".into(),
    }
}

fn world(documents: Vec<KnowledgeDocument>, llm: FakeLlmClient) -> World {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("messages")).unwrap();
    for locale in ["de", "en", "fr", "sw"] {
        std::fs::write(
            dir.path().join(format!("messages/{}.json", locale)),
            "{\"common\":{\"save\":\"Speichern\"}}",
        )
        .unwrap();
    }
    std::fs::write(dir.path().join(".env.local"), "NEXT_PUBLIC_SITE_URL=https://example.invalid\n").unwrap();

    let store = Arc::new(MemoryStore::new());
    let knowledge = KnowledgeBase::from_documents(documents);
    let index = knowledge.index();
    let notifier = Arc::new(FakeNotifier::new());
    let commands = Arc::new(FakeCommandExecutor::new());
    let metrics = Arc::new(MemorySink::new());
    let recorder = Arc::new(RecordingInterceptor::new());

    let approvals = Arc::new(ApprovalGateway::new(
        store.clone(),
        notifier.clone(),
        &ApprovalConfig {
            poll_interval_secs: 5,
            timeout_secs: 30,
            ..ApprovalConfig::default()
        },
        RetryPolicy::no_retry(),
    ));
    let executor = Arc::new(ActionExecutor::new(
        store.clone(),
        Arc::new(LocalFileWriter),
        commands.clone(),
        approvals,
        RetryPolicy::no_retry(),
        Duration::from_secs(5),
        dir.path(),
    ));

    let parts = RouterParts {
        store: store.clone(),
        matcher: Arc::new(PatternMatcher::new(index.clone(), MatchSettings::default())),
        verifier: Arc::new(ProblemVerifier::new(
            dir.path(),
            Arc::new(index),
            &VerifierConfig::default(),
        )),
        planner: Arc::new(PlanGenerator::new(
            Arc::new(llm),
            RetryPolicy::no_retry(),
            Duration::from_secs(5),
        )),
        executor,
        knowledge: Arc::new(knowledge),
        metrics: metrics.clone(),
        hub: store.hub().clone(),
        feed: Arc::new(FeedStatus::new()),
    };
    let router = TicketRouter::new(parts, RouterSettings::default()).with_interceptor(recorder.clone());

    World {
        dir,
        store,
        notifier,
        commands,
        metrics,
        recorder,
        router,
    }
}

fn events_of(store: &MemoryStore, ticket_id: &str) -> Vec<AutomationEvent> {
    store
        .all_events()
        .into_iter()
        .filter(|e| e.ticket_id == ticket_id)
        .collect()
}

fn outcomes_of(store: &MemoryStore, ticket_id: &str) -> Vec<EventKind> {
    events_of(store, ticket_id)
        .into_iter()
        .filter(|e| e.action_type.is_outcome())
        .map(|e| e.action_type)
        .collect()
}

// ============================================================================
// Signature scenarios
// ============================================================================

#[tokio::test]
async fn null_guard_ticket_is_planned_without_approval() {
    let w = world(Vec::new(), FakeLlmClient::unavailable());
    w.store
        .create_ticket(&Ticket::new(
            "t-null",
            "Upload fails",
            "Cannot read properties of null (reading 'file')",
        ))
        .await
        .unwrap();

    let outcome = w.router.dispatch("t-null").await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Completed(EventKind::AutopatchPlanned));

    let events = events_of(&w.store, "t-null");
    let planned = events
        .iter()
        .find(|e| e.action_type == EventKind::AutopatchPlanned)
        .unwrap();
    assert_eq!(planned.payload["pattern_id"], "type-error-null-guard");
    assert!(planned.payload["summary"].as_str().unwrap().contains("null-safety"));

    // Low-risk pattern: nothing executed, nobody asked
    assert!(!events.iter().any(|e| e.action_type == EventKind::Approval));
    assert!(!events.iter().any(|e| e.action_type == EventKind::ActionResult));
    assert!(w.notifier.notices().is_empty());
    assert!(w.commands.executed().is_empty());

    // The plan is kept as a document for whoever picks up the escalation
    let plan_file = "docs/autopatches/ticket-t-null-frontend-null-guard.md";
    assert_eq!(planned.payload["plan_files"], serde_json::json!([plan_file]));
    let doc = std::fs::read_to_string(w.dir.path().join(plan_file)).unwrap();
    assert!(doc.starts_with("# Autopatch plan: frontend-null-guard"));
    assert!(doc.contains("- <FILE_FROM_STACKTRACE>"));

    let ticket = w.store.get_ticket("t-null").await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Escalated);
    assert_eq!(ticket.assigned_agent.as_deref(), Some("escalation-agent"));
    assert_eq!(ticket.escalation_path.len(), 1);
    assert_eq!(ticket.escalation_path[0].trigger, "autopatch_planned");
    let thread = w.store.list_messages("t-null").await.unwrap();
    assert_eq!(thread.len(), 1);
    assert!(thread[0].body.contains("Null-Safety"));
}

#[tokio::test]
async fn missing_translation_is_written_and_ticket_resolved() {
    let w = world(Vec::new(), FakeLlmClient::unavailable());
    w.store
        .create_ticket(&Ticket::new(
            "t-i18n",
            "Leeres Label im Formular",
            "Im Formular steht MISSING_MESSAGE: checkout.form.title",
        ))
        .await
        .unwrap();

    let outcome = w.router.dispatch("t-i18n").await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Completed(EventKind::AutopatchApplied));

    for (locale, expected) in [("de", "Text hinzufügen"), ("en", "Add text")] {
        let raw = std::fs::read_to_string(w.dir.path().join(format!("messages/{}.json", locale))).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["checkout"]["form"]["title"], expected);
        assert_eq!(json["common"]["save"], "Speichern");
    }

    let ticket = w.store.get_ticket("t-i18n").await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Resolved);
    assert_eq!(outcomes_of(&w.store, "t-i18n"), vec![EventKind::AutopatchApplied]);

    // No locale in the metadata means German
    let thread = w.store.list_messages("t-i18n").await.unwrap();
    assert!(thread.last().unwrap().body.starts_with("Danke"));

    // Fix execution was preceded by a positive verification
    let stages = w.recorder.stages();
    let verified = stages.iter().position(|s| s == "verify:t-i18n:true").unwrap();
    let acted = stages.iter().position(|s| s.starts_with("action:t-i18n:")).unwrap();
    assert!(verified < acted);
}

#[tokio::test]
async fn missing_env_variable_gets_placeholder() {
    let w = world(Vec::new(), FakeLlmClient::unavailable());
    let mut ticket = Ticket::new(
        "t-env",
        "Checkout broken",
        "Server log: Missing required environment variable: STRIPE_SECRET_KEY",
    );
    ticket.source_metadata = serde_json::json!({ "locale": "en" });
    w.store.create_ticket(&ticket).await.unwrap();

    let outcome = w.router.dispatch("t-env").await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Completed(EventKind::AutopatchApplied));

    let env = std::fs::read_to_string(w.dir.path().join(".env.local")).unwrap();
    assert!(env.starts_with("NEXT_PUBLIC_SITE_URL="));
    assert!(env.contains("STRIPE_SECRET_KEY=FIXME_STRIPE_SECRET_KEY"));
    assert_eq!(w.metrics.snapshot().autopatch_success, 1);

    let funnel = w
        .store
        .list_metrics(Utc::now() - ChronoDuration::hours(1))
        .await
        .unwrap();
    assert_eq!(funnel.len(), 1);
    assert_eq!(funnel[0].problem_type.as_deref(), Some("missing-env-variable"));
    assert!(funnel[0].fix_applied && funnel[0].post_fix_verification_passed);
}

#[tokio::test]
async fn already_present_key_is_not_touched() {
    let w = world(Vec::new(), FakeLlmClient::unavailable());
    w.store
        .create_ticket(&Ticket::new("t-present", "Label", "MISSING_MESSAGE: common.save"))
        .await
        .unwrap();

    let outcome = w.router.dispatch("t-present").await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Completed(EventKind::VerificationFailed));
    assert!(!events_of(&w.store, "t-present")
        .iter()
        .any(|e| e.action_type == EventKind::ActionResult));
    let ticket = w.store.get_ticket("t-present").await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::WaitingCustomer);
}

// ============================================================================
// Plan path
// ============================================================================

#[tokio::test]
async fn unmatched_ticket_follows_llm_plan() {
    let llm = FakeLlmClient::always_valid(serde_json::json!({
        "status": "resolved",
        "summary": "Die Rechnung findest du unter Einstellungen > Abrechnung.",
        "actions": [
            { "type": "answer_customer", "description": "Point to the billing page" },
            { "type": "hetzner_command", "description": "restart", "payload": { "command": "pm2 restart whatsapp-bot-builder" } }
        ]
    }));
    let w = world(Vec::new(), llm);
    w.store
        .create_ticket(&Ticket::new("t-plan", "Rechnung", "Wo finde ich meine Rechnung?"))
        .await
        .unwrap();

    let outcome = w.router.dispatch("t-plan").await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Completed(EventKind::PlanGenerated));

    let ticket = w.store.get_ticket("t-plan").await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Resolved);
    let plan_event = events_of(&w.store, "t-plan")
        .into_iter()
        .find(|e| e.action_type == EventKind::PlanGenerated)
        .unwrap();
    assert_eq!(plan_event.payload["plan"]["fallback"], false);
    // The support agent may not run remote commands
    assert_eq!(plan_event.payload["plan"]["actions"].as_array().unwrap().len(), 1);
    assert!(w.commands.executed().is_empty());

    let recorded: Vec<_> = events_of(&w.store, "t-plan")
        .into_iter()
        .filter(|e| e.action_type == EventKind::PlanAction)
        .collect();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].payload["type"], "answer_customer");
    assert_eq!(recorded[0].payload["handling"], "customer_reply");

    let thread = w.store.list_messages("t-plan").await.unwrap();
    assert!(thread[0].body.contains("Abrechnung"));
}

// ============================================================================
// Approval-gated remote commands
// ============================================================================

#[tokio::test(start_paused = true)]
async fn remote_restart_waits_for_approval_then_runs() {
    let w = world(vec![deployment_doc()], FakeLlmClient::unavailable());
    w.store
        .create_ticket(&Ticket::new(
            "t-pm2",
            "Bot reagiert nicht",
            "Seit heute morgen reagiert der Bot nicht mehr auf Nachrichten.",
        ))
        .await
        .unwrap();

    // No decision within the wait window
    let first = w.router.dispatch("t-pm2").await.unwrap();
    assert_eq!(first, DispatchOutcome::Completed(EventKind::ApprovalDeferred));
    assert!(w.commands.executed().is_empty());
    assert_eq!(w.notifier.notices().len(), 1);
    let ticket = w.store.get_ticket("t-pm2").await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Investigating);

    // Bootstrap leaves it alone while the request is open
    assert!(w.router.bootstrap_candidates().await.unwrap().is_empty());

    // A second pass does not file another request
    let second = w.router.dispatch("t-pm2").await.unwrap();
    assert_eq!(second, DispatchOutcome::Completed(EventKind::ApprovalDeferred));
    assert_eq!(w.notifier.notices().len(), 1);

    let events = w.store.list_events("t-pm2").await.unwrap();
    let ledger = ApprovalLedger::from_events(&events);
    let open = ledger.unresolved();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].command.as_deref(), Some("pm2 restart whatsapp-bot-builder"));
    let request_id = open[0].request_id;

    ApprovalGateway::decide(w.store.as_ref(), "t-pm2", request_id, true, Some("ops"))
        .await
        .unwrap();
    assert_eq!(w.router.bootstrap_candidates().await.unwrap(), vec!["t-pm2".to_string()]);

    let third = w.router.dispatch("t-pm2").await.unwrap();
    assert_eq!(third, DispatchOutcome::Completed(EventKind::AutopatchApplied));
    assert_eq!(w.commands.executed(), vec!["pm2 restart whatsapp-bot-builder".to_string()]);
    let ticket = w.store.get_ticket("t-pm2").await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Resolved);
    assert_eq!(
        outcomes_of(&w.store, "t-pm2"),
        vec![
            EventKind::ApprovalDeferred,
            EventKind::ApprovalDeferred,
            EventKind::AutopatchApplied
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn denied_restart_escalates() {
    let w = world(vec![deployment_doc()], FakeLlmClient::unavailable());
    w.store
        .create_ticket(&Ticket::new(
            "t-deny",
            "Bot reagiert nicht",
            "Der Bot reagiert nicht mehr.",
        ))
        .await
        .unwrap();

    w.router.dispatch("t-deny").await.unwrap();
    let events = w.store.list_events("t-deny").await.unwrap();
    let request_id = ApprovalLedger::from_events(&events).unresolved()[0].request_id;
    ApprovalGateway::decide(w.store.as_ref(), "t-deny", request_id, false, Some("ops"))
        .await
        .unwrap();

    let outcome = w.router.dispatch("t-deny").await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Completed(EventKind::ApprovalDenied));
    assert!(w.commands.executed().is_empty());
    let ticket = w.store.get_ticket("t-deny").await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Escalated);
}

// ============================================================================
// Follow-ups
// ============================================================================

#[tokio::test]
async fn customer_reply_reopens_and_reprocesses() {
    let w = world(Vec::new(), FakeLlmClient::unavailable());
    let mut ticket = Ticket::new("t-follow", "Rechnung", "Wo finde ich meine Rechnung?");
    ticket.priority = Priority::Low;
    w.store.create_ticket(&ticket).await.unwrap();

    // Fallback plan answers and waits for the customer
    w.router.dispatch("t-follow").await.unwrap();
    assert_eq!(
        w.store.get_ticket("t-follow").await.unwrap().unwrap().status,
        TicketStatus::WaitingCustomer
    );

    let reply = TicketMessage::customer("t-follow", "Kunde", "Ich finde sie immer noch nicht");
    w.store.insert_message(&reply).await.unwrap();
    w.router
        .handle_change(ChangeEvent::MessageInserted {
            ticket_id: "t-follow".into(),
            author_type: AuthorType::Customer,
            at: reply.created_at,
        })
        .await;

    let ticket = w.store.get_ticket("t-follow").await.unwrap().unwrap();
    assert_eq!(ticket.priority, Priority::Normal);
    assert_eq!(ticket.escalation_path.len(), 1);
    assert_eq!(ticket.escalation_path[0].trigger, "customer_followup_after_support");
    // New latest message, new fingerprint: processed again
    assert_eq!(
        outcomes_of(&w.store, "t-follow"),
        vec![EventKind::PlanGenerated, EventKind::PlanGenerated]
    );
    assert!(events_of(&w.store, "t-follow")
        .iter()
        .any(|e| e.action_type == EventKind::CustomerFollowup));
}

#[tokio::test]
async fn index_without_documents_matches_only_signatures() {
    let matcher = PatternMatcher::new(ConfigurationIndex::default(), MatchSettings::default());
    let ticket = Ticket::new("t", "Bot reagiert nicht", "Der Bot reagiert nicht mehr.");
    assert!(matcher.match_ticket(&ticket).is_none());
}
