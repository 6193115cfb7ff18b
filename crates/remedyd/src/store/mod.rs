//! Ticket store - the one piece of shared state.
//!
//! Tickets, messages, the append-only automation log, funnel metrics,
//! knowledge documents, heartbeat rows and external changes all live
//! behind [`TicketStore`]. Coordination between router instances is done
//! by reading the automation log back, so implementations must never
//! update or delete automation events.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::change_feed::ChangeEvent;
use crate::monitor::ExternalChange;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use remedy_common::config_index::KnowledgeDocument;
use remedy_common::error::RemedyResult;
use remedy_common::event::AutomationEvent;
use remedy_common::funnel::DiagnosisMetricsRecord;
use remedy_common::ticket::{Ticket, TicketMessage, TicketStatus};
use serde::{Deserialize, Serialize};

/// Liveness of a service, as written by its heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Up,
    Degraded,
    Down,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Degraded => "degraded",
            Self::Down => "down",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "up" => Some(Self::Up),
            "degraded" => Some(Self::Degraded),
            "down" => Some(Self::Down),
            _ => None,
        }
    }
}

/// One heartbeat row per service, upserted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service: String,
    pub status: ServiceState,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub meta: serde_json::Value,
}

#[async_trait]
pub trait TicketStore: Send + Sync {
    // ------------------------------------------------------------------
    // Tickets and messages
    // ------------------------------------------------------------------

    /// Insert a ticket created by the UI
    async fn create_ticket(&self, ticket: &Ticket) -> RemedyResult<()>;

    /// Ticket by id, with `latest_message` set to the newest customer message
    async fn get_ticket(&self, id: &str) -> RemedyResult<Option<Ticket>>;

    /// Tickets in any of `statuses`, oldest first
    async fn list_tickets(&self, statuses: &[TicketStatus]) -> RemedyResult<Vec<Ticket>>;

    /// Overwrite the mutable fields of an existing ticket
    async fn update_ticket(&self, ticket: &Ticket) -> RemedyResult<()>;

    async fn insert_message(&self, message: &TicketMessage) -> RemedyResult<()>;

    /// Thread of a ticket, oldest first
    async fn list_messages(&self, ticket_id: &str) -> RemedyResult<Vec<TicketMessage>>;

    // ------------------------------------------------------------------
    // Automation log (insert-only)
    // ------------------------------------------------------------------

    async fn append_event(&self, event: &AutomationEvent) -> RemedyResult<()>;

    /// Events of a ticket, oldest first
    async fn list_events(&self, ticket_id: &str) -> RemedyResult<Vec<AutomationEvent>>;

    // ------------------------------------------------------------------
    // Funnel metrics (write-once)
    // ------------------------------------------------------------------

    async fn insert_metrics(&self, record: &DiagnosisMetricsRecord) -> RemedyResult<()>;

    async fn list_metrics(&self, since: DateTime<Utc>) -> RemedyResult<Vec<DiagnosisMetricsRecord>>;

    // ------------------------------------------------------------------
    // Knowledge corpus
    // ------------------------------------------------------------------

    /// Documents stored under `source`; empty when the source is unknown
    async fn load_documents(&self, source: &str) -> RemedyResult<Vec<KnowledgeDocument>>;

    async fn insert_document(&self, source: &str, document: &KnowledgeDocument) -> RemedyResult<()>;

    // ------------------------------------------------------------------
    // Heartbeat and external changes
    // ------------------------------------------------------------------

    async fn upsert_service_status(&self, status: &ServiceStatus) -> RemedyResult<()>;

    async fn get_service_status(&self, service: &str) -> RemedyResult<Option<ServiceStatus>>;

    /// Insert or replace by id
    async fn save_external_change(&self, change: &ExternalChange) -> RemedyResult<()>;

    /// Whether `provider` already reported a change titled `title` since `since`
    async fn external_change_exists(
        &self,
        provider: &str,
        title: &str,
        since: DateTime<Utc>,
    ) -> RemedyResult<bool>;

    // ------------------------------------------------------------------
    // Change polling
    // ------------------------------------------------------------------

    /// Ticket inserts and customer messages newer than `since`, oldest first
    async fn changes_since(&self, since: DateTime<Utc>) -> RemedyResult<Vec<ChangeEvent>>;

    /// Cheap round-trip used by the health check
    async fn ping(&self) -> RemedyResult<()>;
}
