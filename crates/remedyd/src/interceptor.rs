//! Lifecycle hooks around a dispatch run.
//!
//! The router calls these at fixed points; the default implementation
//! logs through `tracing`. Tests use [`RecordingInterceptor`] to assert on
//! the sequence of stages a ticket went through.

use crate::executor::InstructionResult;
use crate::verifier::ProblemVerification;
use remedy_common::error::RemedyError;
use remedy_common::event::EventKind;
use remedy_common::patterns::PatternMatch;
use remedy_common::ticket::Ticket;
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub trait RouterInterceptor: Send + Sync {
    fn on_dispatch_start(&self, _ticket: &Ticket) {}
    fn on_match(&self, _ticket: &Ticket, _matched: Option<&PatternMatch>) {}
    fn on_verification(&self, _ticket: &Ticket, _verification: &ProblemVerification) {}
    fn on_action(&self, _ticket: &Ticket, _result: &InstructionResult) {}
    fn on_outcome(&self, _ticket: &Ticket, _outcome: EventKind) {}
    fn on_error(&self, _ticket_id: &str, _error: &RemedyError) {}
}

/// Default interceptor
pub struct TracingInterceptor;

impl RouterInterceptor for TracingInterceptor {
    fn on_dispatch_start(&self, ticket: &Ticket) {
        debug!(
            "[TRACE] dispatch start {} status={} priority={}",
            ticket.id,
            ticket.status.as_str(),
            ticket.priority.as_str()
        );
    }

    fn on_match(&self, ticket: &Ticket, matched: Option<&PatternMatch>) {
        match matched {
            Some(m) => debug!(
                "[TRACE] {} matched {} via {:?} (score {:?})",
                ticket.id, m.pattern_id, m.source, m.score
            ),
            None => debug!("[TRACE] {} matched nothing", ticket.id),
        }
    }

    fn on_verification(&self, ticket: &Ticket, verification: &ProblemVerification) {
        debug!(
            "[TRACE] {} verification of {}: exists={} live={} ({})",
            ticket.id,
            verification.pattern_id,
            verification.problem_exists,
            verification.live,
            verification.reason()
        );
    }

    fn on_action(&self, ticket: &Ticket, result: &InstructionResult) {
        debug!(
            "[TRACE] {} {} success={} {}",
            ticket.id, result.instruction_type, result.success, result.detail
        );
    }

    fn on_outcome(&self, ticket: &Ticket, outcome: EventKind) {
        if outcome.is_security_relevant() {
            warn!("[TRACE] {} outcome {} (security relevant)", ticket.id, outcome);
        } else {
            info!("[TRACE] {} outcome {}", ticket.id, outcome);
        }
    }

    fn on_error(&self, ticket_id: &str, error: &RemedyError) {
        warn!("[TRACE] {} error [{}]: {}", ticket_id, error.code(), error);
    }
}

/// Keeps `stage:ticket[:detail]` lines
#[derive(Default)]
pub struct RecordingInterceptor {
    stages: Mutex<Vec<String>>,
}

impl RecordingInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stages(&self) -> Vec<String> {
        self.stages.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn push(&self, line: String) {
        if let Ok(mut stages) = self.stages.lock() {
            stages.push(line);
        }
    }
}

impl RouterInterceptor for RecordingInterceptor {
    fn on_dispatch_start(&self, ticket: &Ticket) {
        self.push(format!("start:{}", ticket.id));
    }

    fn on_match(&self, ticket: &Ticket, matched: Option<&PatternMatch>) {
        let id = matched.map(|m| m.pattern_id.as_str()).unwrap_or("none");
        self.push(format!("match:{}:{}", ticket.id, id));
    }

    fn on_verification(&self, ticket: &Ticket, verification: &ProblemVerification) {
        self.push(format!("verify:{}:{}", ticket.id, verification.problem_exists));
    }

    fn on_action(&self, ticket: &Ticket, result: &InstructionResult) {
        self.push(format!("action:{}:{}", ticket.id, result.instruction_type));
    }

    fn on_outcome(&self, ticket: &Ticket, outcome: EventKind) {
        self.push(format!("outcome:{}:{}", ticket.id, outcome));
    }

    fn on_error(&self, ticket_id: &str, error: &RemedyError) {
        self.push(format!("error:{}:{}", ticket_id, error.code()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_interceptor_keeps_order() {
        let recorder = RecordingInterceptor::new();
        let ticket = Ticket::new("t-1", "x", "y");
        recorder.on_dispatch_start(&ticket);
        recorder.on_match(&ticket, None);
        recorder.on_outcome(&ticket, EventKind::PlanGenerated);
        recorder.on_error("t-1", &RemedyError::Timeout(5));
        assert_eq!(
            recorder.stages(),
            vec![
                "start:t-1",
                "match:t-1:none",
                "outcome:t-1:plan_generated",
                "error:t-1:timeout"
            ]
        );
    }
}
