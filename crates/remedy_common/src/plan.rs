//! Resolution plans and their actions.
//!
//! A plan is what the router acts on when no signature fixes the ticket:
//! a target status, a customer-facing summary and a list of follow-up
//! actions. Plans come from the LLM or from the deterministic fallback.

use crate::ticket::TicketStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Summary used when no LLM is configured
pub const FALLBACK_SUMMARY: &str = "Thank you for reporting this! Our support team is analysing \
     the problem and will get back to you shortly with an update.";

/// Summary used when the LLM call failed
pub const FAILED_ANALYSIS_SUMMARY: &str = "Your ticket has been recorded. The automatic analysis \
     did not succeed, a support agent will take over.";

/// Summary used when the LLM answered without one
pub const DEFAULT_SUMMARY: &str = "Analysis complete. A human will review the next step.";

/// Kind of follow-up action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    AnswerCustomer,
    SupabaseQuery,
    #[serde(alias = "hetzner_command")]
    RemoteCommand,
    UxUpdate,
    ManualFollowup,
    AutopatchPlan,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AnswerCustomer => "answer_customer",
            Self::SupabaseQuery => "supabase_query",
            Self::RemoteCommand => "remote_command",
            Self::UxUpdate => "ux_update",
            Self::ManualFollowup => "manual_followup",
            Self::AutopatchPlan => "autopatch_plan",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One step of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionAction {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub description: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl ResolutionAction {
    pub fn new(kind: ActionKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            payload: Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Status a plan may request for its ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Resolved,
    #[default]
    WaitingCustomer,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::WaitingCustomer => "waiting_customer",
        }
    }

    pub fn ticket_status(&self) -> TicketStatus {
        match self {
            Self::Resolved => TicketStatus::Resolved,
            Self::WaitingCustomer => TicketStatus::WaitingCustomer,
        }
    }
}

/// `{status, summary, actions[]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionPlan {
    pub status: PlanStatus,
    pub summary: String,
    pub actions: Vec<ResolutionAction>,
    /// True when this plan did not come from the LLM
    #[serde(default)]
    pub fallback: bool,
}

impl ResolutionPlan {
    /// Deterministic plan used when the LLM is not configured
    pub fn fallback() -> Self {
        Self {
            status: PlanStatus::WaitingCustomer,
            summary: FALLBACK_SUMMARY.to_string(),
            actions: vec![ResolutionAction::new(
                ActionKind::ManualFollowup,
                "Manual review required, no LLM analysis available.",
            )],
            fallback: true,
        }
    }

    /// Deterministic plan used when the LLM call failed
    pub fn failed_analysis(error: &str) -> Self {
        Self {
            status: PlanStatus::WaitingCustomer,
            summary: FAILED_ANALYSIS_SUMMARY.to_string(),
            actions: vec![ResolutionAction::new(
                ActionKind::ManualFollowup,
                "LLM analysis failed.",
            )
            .with_payload(serde_json::json!({ "error": error }))],
            fallback: true,
        }
    }

    /// Lenient decode of an LLM answer.
    ///
    /// Missing or unknown status becomes `waiting_customer`, a missing
    /// summary gets [`DEFAULT_SUMMARY`], and actions of unknown kind are
    /// dropped rather than failing the whole plan.
    pub fn from_llm_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;

        let status = object
            .get("status")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let summary = object
            .get("summary")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SUMMARY)
            .to_string();

        let actions = object
            .get("actions")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|a| serde_json::from_value(a.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            status,
            summary,
            actions,
            fallback: false,
        })
    }
}

/// Extract the outermost JSON object from free text, ignoring code fences
pub fn extract_json_object(raw: &str) -> Option<Value> {
    let cleaned = raw.replace("```json", "```").replace("```", "");
    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&cleaned[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fallback_plan_shape() {
        let plan = ResolutionPlan::fallback();
        assert_eq!(plan.status, PlanStatus::WaitingCustomer);
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].kind, ActionKind::ManualFollowup);
        assert!(plan.fallback);
    }

    #[test]
    fn test_lenient_decode_applies_defaults() {
        let plan = ResolutionPlan::from_llm_value(&json!({"status": "escalated"})).unwrap();
        assert_eq!(plan.status, PlanStatus::WaitingCustomer);
        assert_eq!(plan.summary, DEFAULT_SUMMARY);
        assert!(plan.actions.is_empty());
        assert!(!plan.fallback);
    }

    #[test]
    fn test_decode_accepts_legacy_command_kind_and_drops_unknown() {
        let plan = ResolutionPlan::from_llm_value(&json!({
            "status": "resolved",
            "summary": "Fixed",
            "actions": [
                {"type": "hetzner_command", "description": "restart", "payload": {"command": "pm2 restart all"}},
                {"type": "launch_rocket", "description": "nope"}
            ]
        }))
        .unwrap();
        assert_eq!(plan.status.ticket_status(), TicketStatus::Resolved);
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].kind, ActionKind::RemoteCommand);
    }

    #[test]
    fn test_decode_keeps_customer_answer_actions() {
        let plan = ResolutionPlan::from_llm_value(&json!({
            "status": "resolved",
            "summary": "Invoices live under Billing",
            "actions": [
                {"type": "answer_customer", "description": "Point to the billing page"},
                {"type": "manual_followup", "description": "check later"}
            ]
        }))
        .unwrap();
        assert_eq!(plan.actions.len(), 2);
        assert_eq!(plan.actions[0].kind, ActionKind::AnswerCustomer);
        assert_eq!(plan.actions[0].kind.as_str(), "answer_customer");
    }

    #[test]
    fn test_extract_json_from_fenced_text() {
        let raw = "Here you go:\n```json\n{\"status\": \"resolved\", \"summary\": \"ok\"}\n```";
        let value = extract_json_object(raw).unwrap();
        assert_eq!(value["summary"], "ok");
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("} backwards {").is_none());
    }
}
