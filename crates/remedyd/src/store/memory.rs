//! In-memory ticket store for tests and demos.
//!
//! Publishes ticket inserts and message inserts on its [`ChangeHub`], the
//! way the hosted database's realtime channel would.

use super::{ServiceStatus, TicketStore};
use crate::change_feed::{ChangeEvent, ChangeHub};
use crate::monitor::ExternalChange;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use remedy_common::config_index::KnowledgeDocument;
use remedy_common::error::{RemedyError, RemedyResult};
use remedy_common::event::AutomationEvent;
use remedy_common::funnel::DiagnosisMetricsRecord;
use remedy_common::ticket::{AuthorType, Ticket, TicketMessage, TicketStatus};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    tickets: BTreeMap<String, Ticket>,
    messages: Vec<TicketMessage>,
    events: Vec<AutomationEvent>,
    metrics: Vec<DiagnosisMetricsRecord>,
    documents: HashMap<String, Vec<KnowledgeDocument>>,
    services: HashMap<String, ServiceStatus>,
    changes: BTreeMap<String, ExternalChange>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    hub: ChangeHub,
    reject_messages: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_hub(ChangeHub::new())
    }

    pub fn with_hub(hub: ChangeHub) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            hub,
            reject_messages: AtomicBool::new(false),
        }
    }

    pub fn hub(&self) -> &ChangeHub {
        &self.hub
    }

    fn lock(&self) -> RemedyResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| RemedyError::store("memory store lock poisoned"))
    }

    /// Make every following message insert fail, as an unreachable database would
    pub fn reject_message_inserts(&self, reject: bool) {
        self.reject_messages.store(reject, Ordering::SeqCst);
    }

    /// Every automation event, across tickets, in insertion order
    pub fn all_events(&self) -> Vec<AutomationEvent> {
        self.lock().map(|i| i.events.clone()).unwrap_or_default()
    }

    pub fn external_changes(&self) -> Vec<ExternalChange> {
        self.lock()
            .map(|i| i.changes.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn latest_customer_message(messages: &[TicketMessage], ticket_id: &str) -> Option<String> {
    messages
        .iter()
        .filter(|m| m.ticket_id == ticket_id && m.author_type == AuthorType::Customer)
        .max_by_key(|m| m.created_at)
        .map(|m| m.body.clone())
}

fn with_latest_message(inner: &Inner, ticket: &Ticket) -> Ticket {
    let mut ticket = ticket.clone();
    ticket.latest_message = latest_customer_message(&inner.messages, &ticket.id);
    ticket
}

#[async_trait]
impl TicketStore for MemoryStore {
    async fn create_ticket(&self, ticket: &Ticket) -> RemedyResult<()> {
        {
            let mut inner = self.lock()?;
            if inner.tickets.contains_key(&ticket.id) {
                return Err(RemedyError::store(format!(
                    "ticket {} already exists",
                    ticket.id
                )));
            }
            inner.tickets.insert(ticket.id.clone(), ticket.clone());
        }
        self.hub.publish(ChangeEvent::TicketInserted {
            ticket_id: ticket.id.clone(),
            at: ticket.created_at,
        });
        Ok(())
    }

    async fn get_ticket(&self, id: &str) -> RemedyResult<Option<Ticket>> {
        let inner = self.lock()?;
        Ok(inner.tickets.get(id).map(|t| with_latest_message(&inner, t)))
    }

    async fn list_tickets(&self, statuses: &[TicketStatus]) -> RemedyResult<Vec<Ticket>> {
        let inner = self.lock()?;
        let mut tickets: Vec<Ticket> = inner
            .tickets
            .values()
            .filter(|t| statuses.contains(&t.status))
            .map(|t| with_latest_message(&inner, t))
            .collect();
        tickets.sort_by_key(|t| t.created_at);
        Ok(tickets)
    }

    async fn update_ticket(&self, ticket: &Ticket) -> RemedyResult<()> {
        let mut inner = self.lock()?;
        let stored = inner
            .tickets
            .get_mut(&ticket.id)
            .ok_or_else(|| RemedyError::store(format!("ticket {} not found", ticket.id)))?;
        let mut updated = ticket.clone();
        updated.latest_message = None;
        updated.created_at = stored.created_at;
        updated.updated_at = Utc::now();
        *stored = updated;
        Ok(())
    }

    async fn insert_message(&self, message: &TicketMessage) -> RemedyResult<()> {
        if self.reject_messages.load(Ordering::SeqCst) {
            return Err(RemedyError::store("message insert rejected"));
        }
        self.lock()?.messages.push(message.clone());
        self.hub.publish(ChangeEvent::MessageInserted {
            ticket_id: message.ticket_id.clone(),
            author_type: message.author_type,
            at: message.created_at,
        });
        Ok(())
    }

    async fn list_messages(&self, ticket_id: &str) -> RemedyResult<Vec<TicketMessage>> {
        let inner = self.lock()?;
        let mut thread: Vec<_> = inner
            .messages
            .iter()
            .filter(|m| m.ticket_id == ticket_id)
            .cloned()
            .collect();
        thread.sort_by_key(|m| m.created_at);
        Ok(thread)
    }

    async fn append_event(&self, event: &AutomationEvent) -> RemedyResult<()> {
        self.lock()?.events.push(event.clone());
        Ok(())
    }

    async fn list_events(&self, ticket_id: &str) -> RemedyResult<Vec<AutomationEvent>> {
        let inner = self.lock()?;
        let mut events: Vec<_> = inner
            .events
            .iter()
            .filter(|e| e.ticket_id == ticket_id)
            .cloned()
            .collect();
        // stable: insertion order breaks created_at ties
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }

    async fn insert_metrics(&self, record: &DiagnosisMetricsRecord) -> RemedyResult<()> {
        self.lock()?.metrics.push(record.clone());
        Ok(())
    }

    async fn list_metrics(&self, since: DateTime<Utc>) -> RemedyResult<Vec<DiagnosisMetricsRecord>> {
        Ok(self
            .lock()?
            .metrics
            .iter()
            .filter(|r| r.created_at >= since)
            .cloned()
            .collect())
    }

    async fn load_documents(&self, source: &str) -> RemedyResult<Vec<KnowledgeDocument>> {
        Ok(self
            .lock()?
            .documents
            .get(source)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_document(&self, source: &str, document: &KnowledgeDocument) -> RemedyResult<()> {
        self.lock()?
            .documents
            .entry(source.to_string())
            .or_default()
            .push(document.clone());
        Ok(())
    }

    async fn upsert_service_status(&self, status: &ServiceStatus) -> RemedyResult<()> {
        self.lock()?
            .services
            .insert(status.service.clone(), status.clone());
        Ok(())
    }

    async fn get_service_status(&self, service: &str) -> RemedyResult<Option<ServiceStatus>> {
        Ok(self.lock()?.services.get(service).cloned())
    }

    async fn save_external_change(&self, change: &ExternalChange) -> RemedyResult<()> {
        self.lock()?
            .changes
            .insert(change.id.clone(), change.clone());
        Ok(())
    }

    async fn external_change_exists(
        &self,
        provider: &str,
        title: &str,
        since: DateTime<Utc>,
    ) -> RemedyResult<bool> {
        Ok(self
            .lock()?
            .changes
            .values()
            .any(|c| c.provider == provider && c.title == title && c.detected_at >= since))
    }

    async fn changes_since(&self, since: DateTime<Utc>) -> RemedyResult<Vec<ChangeEvent>> {
        let inner = self.lock()?;
        let mut out: Vec<ChangeEvent> = inner
            .tickets
            .values()
            .filter(|t| t.created_at > since)
            .map(|t| ChangeEvent::TicketInserted {
                ticket_id: t.id.clone(),
                at: t.created_at,
            })
            .collect();
        out.extend(
            inner
                .messages
                .iter()
                .filter(|m| m.author_type == AuthorType::Customer && m.created_at > since)
                .map(|m| ChangeEvent::MessageInserted {
                    ticket_id: m.ticket_id.clone(),
                    author_type: m.author_type,
                    at: m.created_at,
                }),
        );
        out.sort_by_key(|e| e.at());
        Ok(out)
    }

    async fn ping(&self) -> RemedyResult<()> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remedy_common::event::EventKind;

    #[tokio::test]
    async fn test_create_publishes_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let mut rx = store.hub().subscribe();
        let ticket = Ticket::new("t-1", "Upload", "broken");
        store.create_ticket(&ticket).await.unwrap();
        assert!(matches!(rx.recv().await.unwrap(), ChangeEvent::TicketInserted { .. }));
        assert!(store.create_ticket(&ticket).await.is_err());
    }

    #[tokio::test]
    async fn test_latest_customer_message_is_attached() {
        let store = MemoryStore::new();
        store.create_ticket(&Ticket::new("t-1", "Form", "labels")).await.unwrap();
        store
            .insert_message(&TicketMessage::customer("t-1", "Ana", "MISSING_MESSAGE: a.b"))
            .await
            .unwrap();
        store
            .insert_message(&TicketMessage::support("t-1", "Support", "looking"))
            .await
            .unwrap();
        let ticket = store.get_ticket("t-1").await.unwrap().unwrap();
        assert_eq!(ticket.latest_message.as_deref(), Some("MISSING_MESSAGE: a.b"));
    }

    #[tokio::test]
    async fn test_update_keeps_created_at_and_bumps_updated_at() {
        let store = MemoryStore::new();
        let ticket = Ticket::new("t-1", "A", "B");
        store.create_ticket(&ticket).await.unwrap();
        let mut changed = ticket.clone();
        changed.status = TicketStatus::Investigating;
        store.update_ticket(&changed).await.unwrap();
        let stored = store.get_ticket("t-1").await.unwrap().unwrap();
        assert_eq!(stored.status, TicketStatus::Investigating);
        assert_eq!(stored.created_at, ticket.created_at);
        assert!(stored.updated_at >= ticket.updated_at);
        assert!(store.update_ticket(&Ticket::new("nope", "x", "y")).await.is_err());
    }

    #[tokio::test]
    async fn test_events_are_append_only_per_ticket() {
        let store = MemoryStore::new();
        let a = AutomationEvent::new("t-1", EventKind::ProcessingClaimed, serde_json::json!({}));
        let b = AutomationEvent::new("t-2", EventKind::ProcessingClaimed, serde_json::json!({}));
        store.append_event(&a).await.unwrap();
        store.append_event(&b).await.unwrap();
        let events = store.list_events("t-1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, a.id);
        assert_eq!(store.all_events().len(), 2);
    }

    #[tokio::test]
    async fn test_changes_since_skips_support_messages() {
        let store = MemoryStore::new();
        let before = Utc::now() - chrono::Duration::seconds(1);
        store.create_ticket(&Ticket::new("t-1", "A", "B")).await.unwrap();
        store
            .insert_message(&TicketMessage::support("t-1", "Support", "hi"))
            .await
            .unwrap();
        store
            .insert_message(&TicketMessage::customer("t-1", "Ana", "still broken"))
            .await
            .unwrap();
        let changes = store.changes_since(before).await.unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].kind(), "ticket_inserted");
        assert_eq!(changes[1].kind(), "message_inserted");
    }
}
