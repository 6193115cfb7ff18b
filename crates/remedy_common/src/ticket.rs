//! Ticket types for the remediation workflow.
//!
//! Tickets are created by the support UI and move through a bounded
//! status lifecycle. Only the router and the action executor mutate them;
//! tickets are never deleted, only closed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Escalation trigger recorded when a customer writes again after a support reply
pub const FOLLOWUP_TRIGGER: &str = "customer_followup_after_support";

/// Escalation status recorded alongside [`FOLLOWUP_TRIGGER`]
pub const FOLLOWUP_STATUS: &str = "customer_followup";

/// Agent recorded on automatic follow-up escalations
pub const FOLLOWUP_AGENT: &str = "tier2-automation";

/// Ticket status in the remediation workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    /// Created by the UI, not yet picked up
    #[default]
    New,
    /// Router is working on it
    Investigating,
    /// Waiting for more input from the customer
    WaitingCustomer,
    /// Fix applied and confirmed
    Resolved,
    /// Handed to a higher tier or a human
    Escalated,
    /// Done; may be reopened by a customer follow-up
    Closed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Investigating => "investigating",
            Self::WaitingCustomer => "waiting_customer",
            Self::Resolved => "resolved",
            Self::Escalated => "escalated",
            Self::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new" => Some(Self::New),
            "investigating" => Some(Self::Investigating),
            "waiting_customer" => Some(Self::WaitingCustomer),
            "resolved" => Some(Self::Resolved),
            "escalated" => Some(Self::Escalated),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    /// Router does not dispatch tickets in these states
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Closed)
    }

    /// Picked up by the periodic bootstrap pass
    pub fn is_open_for_bootstrap(&self) -> bool {
        matches!(self, Self::New | Self::Investigating)
    }

    /// Allowed lifecycle transitions.
    ///
    /// `new → investigating → {resolved | waiting_customer | escalated} → closed`,
    /// plus the reopen edge back to `investigating` from any settled state.
    pub fn can_transition_to(&self, next: TicketStatus) -> bool {
        use TicketStatus::*;
        if *self == next {
            return true;
        }
        match (self, next) {
            (New, Investigating) => true,
            (Investigating, Resolved | WaitingCustomer | Escalated) => true,
            (Resolved | WaitingCustomer | Escalated, Closed) => true,
            (WaitingCustomer | Escalated | Resolved | Closed, Investigating) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ticket priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }

    /// One step up the ladder, capped at urgent
    pub fn escalated(&self) -> Self {
        match self {
            Self::Low => Self::Normal,
            Self::Normal => Self::High,
            Self::High | Self::Urgent => Self::Urgent,
        }
    }

    /// Escalate a raw stored priority; unknown values land on `high`
    pub fn escalate_raw(value: &str) -> Self {
        Self::parse(value)
            .map(|p| p.escalated())
            .unwrap_or(Self::High)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One step in a ticket's escalation history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationEntry {
    pub agent: String,
    pub status: String,
    pub trigger: String,
    pub timestamp: DateTime<Utc>,
}

impl EscalationEntry {
    pub fn new(agent: &str, status: &str, trigger: &str) -> Self {
        Self {
            agent: agent.to_string(),
            status: status.to_string(),
            trigger: trigger.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn customer_followup() -> Self {
        Self::new(FOLLOWUP_AGENT, FOLLOWUP_STATUS, FOLLOWUP_TRIGGER)
    }
}

/// A customer-reported issue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TicketStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub assigned_agent: Option<String>,
    /// Free-form metadata supplied by the UI (locale, page, browser, ...)
    #[serde(default)]
    pub source_metadata: serde_json::Value,
    #[serde(default)]
    pub escalation_path: Vec<EscalationEntry>,
    /// Body of the most recent customer message, if the store attached one
    #[serde(default)]
    pub latest_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    /// Create a fresh ticket in `new` state
    pub fn new(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            status: TicketStatus::New,
            priority: Priority::Normal,
            category: None,
            assigned_agent: None,
            source_metadata: serde_json::Value::Null,
            escalation_path: Vec::new(),
            latest_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Text the matcher sees: title, description and latest message
    pub fn combined_text(&self) -> String {
        let mut text = format!("{} {}", self.title, self.description);
        if let Some(msg) = &self.latest_message {
            text.push(' ');
            text.push_str(msg);
        }
        text.trim().to_string()
    }

    /// Locale from source metadata, if the UI sent one
    pub fn locale(&self) -> Option<&str> {
        self.source_metadata
            .get("locale")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Append an escalation entry unless one with the same trigger and status exists
    pub fn push_escalation(&mut self, entry: EscalationEntry) -> bool {
        let exists = self
            .escalation_path
            .iter()
            .any(|e| e.trigger == entry.trigger && e.status == entry.status);
        if exists {
            return false;
        }
        self.escalation_path.push(entry);
        true
    }
}

/// Who wrote a ticket message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorType {
    Customer,
    Support,
}

impl AuthorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Support => "support",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "customer" => Some(Self::Customer),
            "support" => Some(Self::Support),
            _ => None,
        }
    }
}

/// Append-only message on a ticket thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketMessage {
    pub ticket_id: String,
    pub author_type: AuthorType,
    pub author_name: String,
    pub body: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl TicketMessage {
    pub fn support(ticket_id: &str, author_name: &str, body: impl Into<String>) -> Self {
        Self {
            ticket_id: ticket_id.to_string(),
            author_type: AuthorType::Support,
            author_name: author_name.to_string(),
            body: body.into(),
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn customer(ticket_id: &str, author_name: &str, body: impl Into<String>) -> Self {
        Self {
            ticket_id: ticket_id.to_string(),
            author_type: AuthorType::Customer,
            author_name: author_name.to_string(),
            body: body.into(),
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Decide whether a new customer message should reopen and escalate the ticket.
///
/// Escalation requires at least one earlier support reply and at least one
/// customer message in the thread (the new message counts).
pub fn should_escalate_followup(thread: &[TicketMessage]) -> bool {
    let has_support = thread.iter().any(|m| m.author_type == AuthorType::Support);
    let customer_count = thread
        .iter()
        .filter(|m| m.author_type == AuthorType::Customer)
        .count();
    has_support && customer_count >= 1
}
