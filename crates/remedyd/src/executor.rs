//! Action executor: applies the fix instructions of a confirmed match.
//!
//! Runs only against a [`ConfirmedProblem`] for the same ticket and pattern.
//! Remote commands are vetted up front so a single bad command aborts the
//! run before anything is written. High-risk instructions go through the
//! approval gate; every attempted instruction leaves an `action_result` row.

use crate::approval::{ApprovalGateway, ApprovalOutcome};
use crate::autopatch_plan;
use crate::file_writer::{
    append_env_placeholder, apply_modifications, clone_locale_content, resolve_in_root, FileMutation, I18nKey,
    RemoteError,
};
use crate::remote_exec::{CommandExecutor, VettedCommand};
use crate::store::TicketStore;
use crate::verifier::ConfirmedProblem;
use remedy_common::error::{RemedyError, RemedyResult};
use remedy_common::event::{AutomationEvent, EventKind};
use remedy_common::patterns::{AutoFixInstruction, PatternMatch};
use remedy_common::plan::ResolutionAction;
use remedy_common::retry::RetryPolicy;
use remedy_common::ticket::Ticket;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Result of one instruction
#[derive(Debug, Clone, Serialize)]
pub struct InstructionResult {
    pub instruction_type: &'static str,
    pub description: String,
    pub success: bool,
    /// Nothing to do: file or key already present
    pub skipped: bool,
    pub detail: String,
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_request_id: Option<Uuid>,
}

impl InstructionResult {
    fn new(instruction: &AutoFixInstruction) -> Self {
        Self {
            instruction_type: instruction.type_name(),
            description: instruction.describe(),
            success: false,
            skipped: false,
            detail: String::new(),
            files: instruction.target_files(),
            approval_request_id: None,
        }
    }

    fn ok(mut self, detail: impl Into<String>) -> Self {
        self.success = true;
        self.detail = detail.into();
        self
    }

    fn skip(mut self, detail: impl Into<String>) -> Self {
        self.success = true;
        self.skipped = true;
        self.detail = detail.into();
        self
    }

    fn fail(mut self, detail: impl Into<String>) -> Self {
        self.success = false;
        self.detail = detail.into();
        self
    }

    /// `approval_request_id` in the payload spends the decision it names
    fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Why a run stopped before working through every instruction
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionHalt {
    CommandRejected { command: String, reason: String },
    ApprovalPending { request_id: Uuid },
    ApprovalDenied { request_id: Uuid },
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub results: Vec<InstructionResult>,
    pub halt: Option<ExecutionHalt>,
    pub duration_ms: u64,
}

impl ExecutionReport {
    /// Every instruction ran and succeeded
    pub fn all_applied(&self) -> bool {
        self.halt.is_none() && !self.results.is_empty() && self.results.iter().all(|r| r.success)
    }

    pub fn any_attempted(&self) -> bool {
        !self.results.is_empty()
    }

    pub fn failures(&self) -> Vec<&InstructionResult> {
        self.results.iter().filter(|r| !r.success).collect()
    }

    pub fn files_written(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.success && !r.skipped)
            .flat_map(|r| r.files.iter().map(String::as_str))
            .collect()
    }
}

pub struct ActionExecutor {
    store: Arc<dyn TicketStore>,
    writer: Arc<dyn FileMutation>,
    commands: Arc<dyn CommandExecutor>,
    approvals: Arc<ApprovalGateway>,
    retry: RetryPolicy,
    call_timeout: Duration,
    repository_root: PathBuf,
}

impl ActionExecutor {
    pub fn new(
        store: Arc<dyn TicketStore>,
        writer: Arc<dyn FileMutation>,
        commands: Arc<dyn CommandExecutor>,
        approvals: Arc<ApprovalGateway>,
        retry: RetryPolicy,
        call_timeout: Duration,
        repository_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            writer,
            commands,
            approvals,
            retry,
            call_timeout,
            repository_root: repository_root.into(),
        }
    }

    pub fn repository_root(&self) -> &Path {
        &self.repository_root
    }

    pub async fn execute(
        &self,
        ticket: &Ticket,
        confirmed: &ConfirmedProblem,
        matched: &PatternMatch,
    ) -> RemedyResult<ExecutionReport> {
        if confirmed.ticket_id() != ticket.id || confirmed.pattern_id() != matched.pattern_id {
            return Err(RemedyError::DispatchException {
                ticket_id: ticket.id.clone(),
                message: format!(
                    "confirmation for {}/{} does not cover {}/{}",
                    confirmed.ticket_id(),
                    confirmed.pattern_id(),
                    ticket.id,
                    matched.pattern_id
                ),
            });
        }

        let started = Instant::now();
        let mut report = ExecutionReport::default();

        let vetted = match vet_commands(&matched.instructions) {
            Ok(vetted) => vetted,
            Err(RemedyError::CommandRejected { command, reason }) => {
                warn!(
                    "[EXECUTOR] Rejected command {:?} on ticket {}: {}",
                    command, ticket.id, reason
                );
                report.halt = Some(ExecutionHalt::CommandRejected { command, reason });
                report.duration_ms = started.elapsed().as_millis() as u64;
                return Ok(report);
            }
            Err(e) => return Err(e),
        };

        info!(
            "[EXECUTOR] Applying {} instruction(s) of {} to ticket {}",
            matched.instructions.len(),
            matched.pattern_id,
            ticket.id
        );

        for instruction in &matched.instructions {
            let result = match instruction {
                AutoFixInstruction::RemoteCommand { command, .. } => {
                    let Some(vetted) = vetted.get(command.as_str()) else {
                        continue;
                    };
                    match self.approvals.seek_approval(ticket, instruction).await? {
                        ApprovalOutcome::Approved(decision) => {
                            let mut result = self.run_command(instruction, vetted).await;
                            result.approval_request_id = Some(decision.request_id);
                            result
                        }
                        ApprovalOutcome::Denied(decision) => {
                            let mut result = InstructionResult::new(instruction).fail("approval denied");
                            result.approval_request_id = Some(decision.request_id);
                            self.record(ticket, &result).await?;
                            report.results.push(result);
                            report.halt = Some(ExecutionHalt::ApprovalDenied {
                                request_id: decision.request_id,
                            });
                            break;
                        }
                        ApprovalOutcome::Pending { request_id } => {
                            report.halt = Some(ExecutionHalt::ApprovalPending { request_id });
                            break;
                        }
                    }
                }
                other => self.apply_file_instruction(other).await,
            };

            self.record(ticket, &result).await?;
            let failed = !result.success;
            report.results.push(result);
            if failed {
                warn!(
                    "[EXECUTOR] {} failed on ticket {}, stopping",
                    instruction.type_name(),
                    ticket.id
                );
                break;
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "[EXECUTOR] Ticket {}: {} result(s), halt={:?}, {} ms",
            ticket.id,
            report.results.len(),
            report.halt,
            report.duration_ms
        );
        Ok(report)
    }

    async fn record(&self, ticket: &Ticket, result: &InstructionResult) -> RemedyResult<()> {
        self.store
            .append_event(&AutomationEvent::new(&ticket.id, EventKind::ActionResult, result.payload()))
            .await
    }

    async fn run_command(&self, instruction: &AutoFixInstruction, vetted: &VettedCommand) -> InstructionResult {
        let result = InstructionResult::new(instruction);
        if !self.commands.is_configured() {
            return result.fail("remote executor is not configured");
        }
        let outcome = self
            .retry
            .retry_with_timeout("remote command", self.call_timeout, || self.commands.execute(vetted))
            .await;
        match outcome {
            Ok(output) if output.success => result.ok(output.stdout.trim().to_string()),
            Ok(output) => result.fail(format!(
                "exit {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            )),
            Err(e) => {
                error!("[EXECUTOR] {} failed: {}", vetted.as_str(), e);
                result.fail(e.to_string())
            }
        }
    }

    async fn apply_file_instruction(&self, instruction: &AutoFixInstruction) -> InstructionResult {
        let result = InstructionResult::new(instruction);
        match self.file_change(instruction).await {
            Ok(FileChange::Written(detail)) => result.ok(detail),
            Ok(FileChange::Unchanged(detail)) => result.skip(detail),
            Err(e) => {
                warn!("[EXECUTOR] {}: {}", instruction.type_name(), e);
                result.fail(e.to_string())
            }
        }
    }

    async fn file_change(&self, instruction: &AutoFixInstruction) -> RemedyResult<FileChange> {
        let root = self.repository_root.as_path();
        match instruction {
            AutoFixInstruction::I18nAddKey { key, translations } => {
                let keys = [I18nKey {
                    key: key.clone(),
                    translations: translations.clone(),
                }];
                let keys = &keys;
                let writer = &self.writer;
                let outcome = self
                    .retry
                    .retry_with_timeout("write-i18n", self.call_timeout, || async move {
                        writer.write_i18n(root, keys).await.map_err(RemedyError::from)
                    })
                    .await?;
                if !outcome.success {
                    return Err(RemoteError::Rejected(outcome.message).into());
                }
                Ok(if outcome.files_written == 0 {
                    FileChange::Unchanged(format!("{} already translated", key))
                } else {
                    FileChange::Written(format!("{} written to {} file(s)", key, outcome.files_written))
                })
            }
            AutoFixInstruction::CloneLocaleFile {
                locale,
                base_locale,
                strategy,
            } => {
                let target = resolve_in_root(root, &format!("messages/{}.json", locale))?;
                if tokio::fs::try_exists(&target).await.unwrap_or(false) {
                    return Ok(FileChange::Unchanged(format!("messages/{}.json exists", locale)));
                }
                let base_path = resolve_in_root(root, &format!("messages/{}.json", base_locale))?;
                let base = tokio::fs::read_to_string(&base_path).await?;
                self.write(&target, &clone_locale_content(&base, *strategy)).await?;
                Ok(FileChange::Written(format!("messages/{}.json created from {}", locale, base_locale)))
            }
            AutoFixInstruction::EnvAddPlaceholder {
                key,
                value,
                comment,
                file,
            } => {
                let path = resolve_in_root(root, file)?;
                let current = read_or_empty(&path).await?;
                match append_env_placeholder(&current, key, value, comment.as_deref()) {
                    Some(updated) => {
                        self.write(&path, &updated).await?;
                        Ok(FileChange::Written(format!("{} added to {}", key, file)))
                    }
                    None => Ok(FileChange::Unchanged(format!("{} already in {}", key, file))),
                }
            }
            AutoFixInstruction::CodeModify { file, modifications } => {
                let path = resolve_in_root(root, file)?;
                let current = read_or_empty(&path).await?;
                let updated = apply_modifications(&current, modifications)?;
                if updated == current {
                    return Ok(FileChange::Unchanged(format!("{} needs no change", file)));
                }
                self.write(&path, &updated).await?;
                Ok(FileChange::Written(format!("{} modification(s) applied to {}", modifications.len(), file)))
            }
            AutoFixInstruction::CreateFile { file, content, .. } => {
                let path = resolve_in_root(root, file)?;
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    return Ok(FileChange::Unchanged(format!("{} exists", file)));
                }
                self.write(&path, content).await?;
                Ok(FileChange::Written(format!("{} created", file)))
            }
            AutoFixInstruction::RemoteCommand { command, .. } => Err(RemedyError::DispatchException {
                ticket_id: String::new(),
                message: format!("remote command {:?} routed to the file writer", command),
            }),
        }
    }

    /// Write the plan document of an autopatch action; returns its relative path
    pub async fn persist_plan(
        &self,
        ticket: &Ticket,
        action: &ResolutionAction,
        summary: &str,
    ) -> RemedyResult<String> {
        let relative = autopatch_plan::plan_path(ticket, action, summary);
        let path = resolve_in_root(&self.repository_root, &relative)?;
        let body = autopatch_plan::render(ticket, action, summary, chrono::Utc::now());
        self.write(&path, &body).await?;
        info!("[EXECUTOR] Plan for {} written to {}", ticket.id, relative);
        Ok(relative)
    }

    /// Verified write; an unverified write is a failure
    async fn write(&self, path: &Path, content: &str) -> RemedyResult<()> {
        let writer = &self.writer;
        let outcome = self
            .retry
            .retry_with_timeout("write-file", self.call_timeout, || async move {
                writer.write_file(path, content, true).await.map_err(RemedyError::from)
            })
            .await?;
        if !outcome.verified {
            return Err(RemoteError::Unverified(path.display().to_string()).into());
        }
        Ok(())
    }
}

enum FileChange {
    Written(String),
    Unchanged(String),
}

async fn read_or_empty(path: &Path) -> RemedyResult<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

/// Vet every remote command, keyed by its original string
fn vet_commands(instructions: &[AutoFixInstruction]) -> RemedyResult<HashMap<&str, VettedCommand>> {
    instructions
        .iter()
        .filter_map(|i| i.command())
        .map(|command| VettedCommand::vet(command).map(|v| (command, v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{FakeNotifier, REQUEST_ID_FIELD};
    use crate::config::ApprovalConfig;
    use crate::file_writer::LocalFileWriter;
    use crate::remote_exec::FakeCommandExecutor;
    use crate::store::MemoryStore;
    use crate::verifier::{Finding, ProblemVerification, Severity};
    use chrono::Utc;
    use remedy_common::event::ApprovalPayload;
    use remedy_common::patterns::MatchSource;
    use std::collections::BTreeMap;
    use tempfile::{tempdir, TempDir};

    struct Harness {
        _dir: TempDir,
        store: Arc<MemoryStore>,
        commands: Arc<FakeCommandExecutor>,
        executor: ActionExecutor,
    }

    fn harness() -> Harness {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("messages")).unwrap();
        for locale in ["de", "en"] {
            std::fs::write(dir.path().join(format!("messages/{}.json", locale)), "{\"a\":\"x\"}").unwrap();
        }
        let store = Arc::new(MemoryStore::new());
        let commands = Arc::new(FakeCommandExecutor::new());
        let config = ApprovalConfig {
            timeout_secs: 10,
            ..ApprovalConfig::default()
        };
        let approvals = Arc::new(ApprovalGateway::new(
            store.clone(),
            Arc::new(FakeNotifier::new()),
            &config,
            RetryPolicy::no_retry(),
        ));
        let executor = ActionExecutor::new(
            store.clone(),
            Arc::new(LocalFileWriter),
            commands.clone(),
            approvals,
            RetryPolicy::no_retry(),
            Duration::from_secs(5),
            dir.path(),
        );
        Harness {
            _dir: dir,
            store,
            commands,
            executor,
        }
    }

    fn matched(instructions: Vec<AutoFixInstruction>) -> PatternMatch {
        PatternMatch {
            pattern_id: "test-pattern".into(),
            summary: "test".into(),
            actions: Vec::new(),
            instructions,
            customer_message: None,
            source: MatchSource::Signature,
            score: None,
        }
    }

    fn confirmed(ticket_id: &str) -> ConfirmedProblem {
        ConfirmedProblem::try_from(ProblemVerification {
            ticket_id: ticket_id.into(),
            pattern_id: "test-pattern".into(),
            problem_exists: true,
            severity: Severity::Medium,
            evidence: vec![Finding::problem("missing")],
            live: true,
            checked_at: Utc::now(),
        })
        .unwrap()
    }

    fn restart() -> AutoFixInstruction {
        AutoFixInstruction::RemoteCommand {
            command: "pm2 restart whatsapp-bot-builder".into(),
            description: "Restart app".into(),
        }
    }

    #[tokio::test]
    async fn test_file_instructions_apply_and_record() {
        let h = harness();
        let ticket = Ticket::new("t-1", "x", "y");
        let instructions = vec![
            AutoFixInstruction::I18nAddKey {
                key: "dashboard.title".into(),
                translations: BTreeMap::from([
                    ("de".to_string(), "Übersicht".to_string()),
                    ("en".to_string(), "Overview".to_string()),
                ]),
            },
            AutoFixInstruction::EnvAddPlaceholder {
                key: "NEXT_PUBLIC_APP_URL".into(),
                value: "https://example.invalid".into(),
                comment: None,
                file: ".env.local".into(),
            },
            AutoFixInstruction::CloneLocaleFile {
                locale: "de".into(),
                base_locale: "en".into(),
                strategy: Default::default(),
            },
        ];
        let report = h
            .executor
            .execute(&ticket, &confirmed("t-1"), &matched(instructions))
            .await
            .unwrap();

        assert!(report.all_applied());
        assert!(report.results[2].skipped);
        let env = std::fs::read_to_string(h.executor.repository_root().join(".env.local")).unwrap();
        assert!(env.contains("NEXT_PUBLIC_APP_URL="));
        let events = h.store.list_events("t-1").await.unwrap();
        assert_eq!(
            events.iter().filter(|e| e.action_type == EventKind::ActionResult).count(),
            3
        );
    }

    #[tokio::test]
    async fn test_plan_document_is_written_under_the_root() {
        let h = harness();
        let ticket = Ticket::new("t-9", "Upload", "Cannot read properties of null (reading 'file')");
        let action = ResolutionAction::new(remedy_common::plan::ActionKind::AutopatchPlan, "guard")
            .with_payload(serde_json::json!({
                "fix_name": "frontend-null-guard",
                "steps": ["add optional chaining"],
            }));

        let relative = h.executor.persist_plan(&ticket, &action, "Null access").await.unwrap();
        assert_eq!(relative, "docs/autopatches/ticket-t-9-frontend-null-guard.md");
        let doc = std::fs::read_to_string(h.executor.repository_root().join(&relative)).unwrap();
        assert!(doc.contains("1. add optional chaining"));
        assert!(doc.contains("`t-9`"));
    }

    #[tokio::test]
    async fn test_rejected_command_aborts_before_any_write() {
        let h = harness();
        let ticket = Ticket::new("t-1", "x", "y");
        let instructions = vec![
            AutoFixInstruction::CreateFile {
                file: "app/new.ts".into(),
                content: "export {}".into(),
                description: "new file".into(),
            },
            AutoFixInstruction::RemoteCommand {
                command: "pm2 restart untrusted-app".into(),
                description: "bad".into(),
            },
        ];
        let report = h
            .executor
            .execute(&ticket, &confirmed("t-1"), &matched(instructions))
            .await
            .unwrap();

        assert!(matches!(report.halt, Some(ExecutionHalt::CommandRejected { .. })));
        assert!(!report.any_attempted());
        assert!(!h.executor.repository_root().join("app/new.ts").exists());
        assert!(h.commands.executed().is_empty());
        assert!(h.store.list_events("t-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_approved_command_runs_and_spends_the_decision() {
        let h = harness();
        let ticket = Ticket::new("t-1", "x", "y");
        let request = ApprovalPayload::request("remote-command", "Restart app", restart().command());
        for payload in [
            serde_json::to_value(&request).unwrap(),
            serde_json::to_value(ApprovalPayload::decision(&request, true, Some("ops"))).unwrap(),
        ] {
            h.store
                .append_event(&AutomationEvent::new("t-1", EventKind::Approval, payload))
                .await
                .unwrap();
        }

        let report = h
            .executor
            .execute(&ticket, &confirmed("t-1"), &matched(vec![restart()]))
            .await
            .unwrap();
        assert!(report.all_applied());
        assert_eq!(h.commands.executed(), vec!["pm2 restart whatsapp-bot-builder".to_string()]);
        assert_eq!(report.results[0].approval_request_id, Some(request.request_id));

        let last = h.store.list_events("t-1").await.unwrap().pop().unwrap();
        assert_eq!(last.payload[REQUEST_ID_FIELD], request.request_id.to_string());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_approval_halts_without_running() {
        let h = harness();
        let ticket = Ticket::new("t-1", "x", "y");
        let report = h
            .executor
            .execute(&ticket, &confirmed("t-1"), &matched(vec![restart()]))
            .await
            .unwrap();
        assert!(matches!(report.halt, Some(ExecutionHalt::ApprovalPending { .. })));
        assert!(h.commands.executed().is_empty());
        assert!(!report.all_applied());
    }

    #[tokio::test]
    async fn test_confirmation_must_cover_the_ticket() {
        let h = harness();
        let ticket = Ticket::new("t-2", "x", "y");
        let result = h
            .executor
            .execute(&ticket, &confirmed("t-1"), &matched(vec![restart()]))
            .await;
        assert!(matches!(result, Err(RemedyError::DispatchException { .. })));
    }
}
