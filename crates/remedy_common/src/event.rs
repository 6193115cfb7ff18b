//! Automation events - the append-only audit log.
//!
//! Every automated decision on a ticket lands here. The log is the single
//! source of truth for "has this been done already" questions: pending
//! approvals, processing claims and dispatch idempotency are all answered
//! by reading it back. Rows are only ever inserted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of automation event (`action_type` column)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // ------------------------------------------------------------------
    // Outcomes: exactly one per dispatch run
    // ------------------------------------------------------------------
    AutopatchApplied,
    AutopatchFailed,
    AutopatchPlanned,
    VerificationFailed,
    CommandRejected,
    ApprovalDeferred,
    ApprovalDenied,
    PlanGenerated,
    DispatchError,

    // ------------------------------------------------------------------
    // Progress
    // ------------------------------------------------------------------
    /// Approval request (approved = null) or decision (approved = bool)
    Approval,
    /// Result of one executed fix instruction
    ActionResult,
    /// Ticket claimed by a dispatch run
    ProcessingClaimed,
    /// Claim released at the end of a dispatch run
    ProcessingReleased,
    /// Customer wrote again after a support reply
    CustomerFollowup,
    /// One action of a generated plan, as handed to its owner
    PlanAction,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutopatchApplied => "autopatch_applied",
            Self::AutopatchFailed => "autopatch_failed",
            Self::AutopatchPlanned => "autopatch_planned",
            Self::VerificationFailed => "verification_failed",
            Self::CommandRejected => "command_rejected",
            Self::ApprovalDeferred => "approval_deferred",
            Self::ApprovalDenied => "approval_denied",
            Self::PlanGenerated => "plan_generated",
            Self::DispatchError => "dispatch_error",
            Self::Approval => "approval",
            Self::ActionResult => "action_result",
            Self::ProcessingClaimed => "processing_claimed",
            Self::ProcessingReleased => "processing_released",
            Self::CustomerFollowup => "customer_followup",
            Self::PlanAction => "plan_action",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        ALL_KINDS.iter().copied().find(|k| k.as_str() == value)
    }

    /// Outcome kinds close a dispatch run
    pub fn is_outcome(&self) -> bool {
        matches!(
            self,
            Self::AutopatchApplied
                | Self::AutopatchFailed
                | Self::AutopatchPlanned
                | Self::VerificationFailed
                | Self::CommandRejected
                | Self::ApprovalDeferred
                | Self::ApprovalDenied
                | Self::PlanGenerated
                | Self::DispatchError
        )
    }

    /// Outcomes that leave the ticket actionable on the next pass
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ApprovalDeferred | Self::DispatchError)
    }

    /// Outcomes worth flagging to whoever reads the audit log for security review
    pub fn is_security_relevant(&self) -> bool {
        matches!(self, Self::CommandRejected | Self::ApprovalDenied)
    }
}

const ALL_KINDS: &[EventKind] = &[
    EventKind::AutopatchApplied,
    EventKind::AutopatchFailed,
    EventKind::AutopatchPlanned,
    EventKind::VerificationFailed,
    EventKind::CommandRejected,
    EventKind::ApprovalDeferred,
    EventKind::ApprovalDenied,
    EventKind::PlanGenerated,
    EventKind::DispatchError,
    EventKind::Approval,
    EventKind::ActionResult,
    EventKind::ProcessingClaimed,
    EventKind::ProcessingReleased,
    EventKind::CustomerFollowup,
    EventKind::PlanAction,
];

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row of the audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationEvent {
    pub id: Uuid,
    pub ticket_id: String,
    pub action_type: EventKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AutomationEvent {
    pub fn new(ticket_id: &str, action_type: EventKind, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            ticket_id: ticket_id.to_string(),
            action_type,
            payload,
            created_at: Utc::now(),
        }
    }

    /// Dispatch fingerprint carried by outcome events
    pub fn fingerprint(&self) -> Option<&str> {
        self.payload.get("fingerprint").and_then(|v| v.as_str())
    }

    /// Decode the payload of an `approval` row
    pub fn approval(&self) -> Option<ApprovalPayload> {
        if self.action_type != EventKind::Approval {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// Payload of an `approval` row.
///
/// A request row has `approved = None`; the decision row written later by
/// the approval channel carries the same `request_id` and `approved = Some(_)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalPayload {
    pub request_id: Uuid,
    pub instruction_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub approved: Option<bool>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub decided_by: Option<String>,
}

impl ApprovalPayload {
    pub fn request(instruction_type: &str, description: &str, command: Option<&str>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            instruction_type: instruction_type.to_string(),
            description: Some(description.to_string()),
            command: command.map(str::to_string),
            approved: None,
            decided_at: None,
            decided_by: None,
        }
    }

    /// Decision row answering an earlier request
    pub fn decision(request: &ApprovalPayload, approved: bool, decided_by: Option<&str>) -> Self {
        Self {
            request_id: request.request_id,
            instruction_type: request.instruction_type.clone(),
            description: request.description.clone(),
            command: request.command.clone(),
            approved: Some(approved),
            decided_at: Some(Utc::now()),
            decided_by: decided_by.map(str::to_string),
        }
    }

    pub fn is_unresolved(&self) -> bool {
        self.approved.is_none()
    }
}
