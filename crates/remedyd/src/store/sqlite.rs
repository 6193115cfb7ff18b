//! SQLite-backed ticket store.
//!
//! Dates are RFC3339 text, structured fields are JSON text. The
//! `automation_events` table only ever sees INSERT and SELECT.

use super::{ServiceState, ServiceStatus, TicketStore};
use crate::change_feed::ChangeEvent;
use crate::monitor::ExternalChange;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use remedy_common::config_index::KnowledgeDocument;
use remedy_common::error::{RemedyError, RemedyResult};
use remedy_common::event::{AutomationEvent, EventKind};
use remedy_common::funnel::DiagnosisMetricsRecord;
use remedy_common::ticket::{AuthorType, Priority, Ticket, TicketMessage, TicketStatus};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tickets (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    priority TEXT NOT NULL,
    category TEXT,
    assigned_agent TEXT,
    source_metadata TEXT NOT NULL DEFAULT 'null',
    escalation_path TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ticket_messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    ticket_id TEXT NOT NULL,
    author_type TEXT NOT NULL,
    author_name TEXT NOT NULL,
    body TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT 'null',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS automation_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    ticket_id TEXT NOT NULL,
    action_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS diagnosis_metrics (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    ticket_id TEXT NOT NULL,
    record TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS knowledge_documents (
    source TEXT NOT NULL,
    id TEXT NOT NULL,
    title TEXT NOT NULL,
    path TEXT NOT NULL,
    content TEXT NOT NULL,
    PRIMARY KEY (source, id)
);

CREATE TABLE IF NOT EXISTS service_status (
    service TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    last_heartbeat TEXT NOT NULL,
    meta TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS external_changes (
    id TEXT PRIMARY KEY,
    provider TEXT NOT NULL,
    title TEXT NOT NULL,
    detected_at TEXT NOT NULL,
    body TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tickets_status ON tickets(status);
CREATE INDEX IF NOT EXISTS idx_messages_ticket ON ticket_messages(ticket_id);
CREATE INDEX IF NOT EXISTS idx_events_ticket ON automation_events(ticket_id);
CREATE INDEX IF NOT EXISTS idx_metrics_created ON diagnosis_metrics(created_at);
CREATE INDEX IF NOT EXISTS idx_changes_provider ON external_changes(provider, title);
"#;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

fn db_err(e: rusqlite::Error) -> RemedyError {
    RemedyError::store(e)
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_json(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or(serde_json::Value::Null)
}

fn ticket_from_row(row: &Row<'_>) -> rusqlite::Result<Ticket> {
    let status: String = row.get(3)?;
    let priority: String = row.get(4)?;
    let escalation: String = row.get(8)?;
    Ok(Ticket {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: TicketStatus::parse(&status).unwrap_or_default(),
        priority: Priority::parse(&priority).unwrap_or_default(),
        category: row.get(5)?,
        assigned_agent: row.get(6)?,
        source_metadata: parse_json(&row.get::<_, String>(7)?),
        escalation_path: serde_json::from_str(&escalation).unwrap_or_default(),
        latest_message: row.get(11)?,
        created_at: parse_time(&row.get::<_, String>(9)?),
        updated_at: parse_time(&row.get::<_, String>(10)?),
    })
}

const TICKET_COLUMNS: &str = "t.id, t.title, t.description, t.status, t.priority, t.category, \
     t.assigned_agent, t.source_metadata, t.escalation_path, t.created_at, t.updated_at, \
     (SELECT m.body FROM ticket_messages m \
      WHERE m.ticket_id = t.id AND m.author_type = 'customer' \
      ORDER BY m.created_at DESC, m.seq DESC LIMIT 1)";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<TicketMessage> {
    let author: String = row.get(1)?;
    Ok(TicketMessage {
        ticket_id: row.get(0)?,
        author_type: AuthorType::parse(&author).unwrap_or(AuthorType::Customer),
        author_name: row.get(2)?,
        body: row.get(3)?,
        metadata: parse_json(&row.get::<_, String>(4)?),
        created_at: parse_time(&row.get::<_, String>(5)?),
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Option<AutomationEvent>> {
    let id: String = row.get(0)?;
    let kind: String = row.get(2)?;
    let Some(action_type) = EventKind::parse(&kind) else {
        return Ok(None);
    };
    Ok(Some(AutomationEvent {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
        ticket_id: row.get(1)?,
        action_type,
        payload: parse_json(&row.get::<_, String>(3)?),
        created_at: parse_time(&row.get::<_, String>(4)?),
    }))
}

impl SqliteStore {
    /// Open or create the store at `path`
    pub fn open(path: &Path) -> RemedyResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(db_err)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> RemedyResult<Self> {
        Self::from_connection(Connection::open_in_memory().map_err(db_err)?)
    }

    fn from_connection(conn: Connection) -> RemedyResult<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> RemedyResult<()> {
        self.lock()?.execute_batch(SCHEMA).map_err(db_err)
    }

    fn lock(&self) -> RemedyResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| RemedyError::store("sqlite connection lock poisoned"))
    }
}

#[async_trait]
impl TicketStore for SqliteStore {
    async fn create_ticket(&self, ticket: &Ticket) -> RemedyResult<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO tickets (id, title, description, status, priority, category,
                                 assigned_agent, source_metadata, escalation_path, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                &ticket.id,
                &ticket.title,
                &ticket.description,
                ticket.status.as_str(),
                ticket.priority.as_str(),
                &ticket.category,
                &ticket.assigned_agent,
                ticket.source_metadata.to_string(),
                serde_json::to_string(&ticket.escalation_path)?,
                ticket.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                ticket.updated_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_ticket(&self, id: &str) -> RemedyResult<Option<Ticket>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM tickets t WHERE t.id = ?", TICKET_COLUMNS),
            params![id],
            ticket_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    async fn list_tickets(&self, statuses: &[TicketStatus]) -> RemedyResult<Vec<Ticket>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let placeholders: Vec<&str> = statuses.iter().map(|_| "?").collect();
        let sql = format!(
            "SELECT {} FROM tickets t WHERE t.status IN ({}) ORDER BY t.created_at ASC",
            TICKET_COLUMNS,
            placeholders.join(",")
        );
        let values: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values), ticket_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn update_ticket(&self, ticket: &Ticket) -> RemedyResult<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                r#"
                UPDATE tickets SET
                    title = ?, description = ?, status = ?, priority = ?, category = ?,
                    assigned_agent = ?, source_metadata = ?, escalation_path = ?, updated_at = ?
                WHERE id = ?
                "#,
                params![
                    &ticket.title,
                    &ticket.description,
                    ticket.status.as_str(),
                    ticket.priority.as_str(),
                    &ticket.category,
                    &ticket.assigned_agent,
                    ticket.source_metadata.to_string(),
                    serde_json::to_string(&ticket.escalation_path)?,
                    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
                    &ticket.id,
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(RemedyError::store(format!("ticket {} not found", ticket.id)));
        }
        Ok(())
    }

    async fn insert_message(&self, message: &TicketMessage) -> RemedyResult<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO ticket_messages (ticket_id, author_type, author_name, body, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![
                &message.ticket_id,
                message.author_type.as_str(),
                &message.author_name,
                &message.body,
                message.metadata.to_string(),
                message.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_messages(&self, ticket_id: &str) -> RemedyResult<Vec<TicketMessage>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT ticket_id, author_type, author_name, body, metadata, created_at \
                 FROM ticket_messages WHERE ticket_id = ? ORDER BY created_at ASC, seq ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![ticket_id], message_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn append_event(&self, event: &AutomationEvent) -> RemedyResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO automation_events (id, ticket_id, action_type, payload, created_at) \
             VALUES (?, ?, ?, ?, ?)",
            params![
                event.id.to_string(),
                &event.ticket_id,
                event.action_type.as_str(),
                event.payload.to_string(),
                event.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_events(&self, ticket_id: &str) -> RemedyResult<Vec<AutomationEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, ticket_id, action_type, payload, created_at \
                 FROM automation_events WHERE ticket_id = ? ORDER BY created_at ASC, seq ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![ticket_id], event_from_row)
            .map_err(db_err)?;
        let mut events = Vec::new();
        for row in rows {
            // rows written by a newer build with unknown kinds are skipped
            if let Some(event) = row.map_err(db_err)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    async fn insert_metrics(&self, record: &DiagnosisMetricsRecord) -> RemedyResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO diagnosis_metrics (ticket_id, record, created_at) VALUES (?, ?, ?)",
            params![
                &record.ticket_id,
                serde_json::to_string(record)?,
                record.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_metrics(&self, since: DateTime<Utc>) -> RemedyResult<Vec<DiagnosisMetricsRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT record FROM diagnosis_metrics WHERE created_at >= ? ORDER BY seq ASC")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![since.to_rfc3339_opts(SecondsFormat::Micros, true)], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let mut records = Vec::new();
        for raw in rows {
            records.push(serde_json::from_str(&raw.map_err(db_err)?)?);
        }
        Ok(records)
    }

    async fn load_documents(&self, source: &str) -> RemedyResult<Vec<KnowledgeDocument>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, title, path, content FROM knowledge_documents WHERE source = ? ORDER BY id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![source], |row| {
                Ok(KnowledgeDocument {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    path: row.get(2)?,
                    content: row.get(3)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn insert_document(&self, source: &str, document: &KnowledgeDocument) -> RemedyResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO knowledge_documents (source, id, title, path, content) \
             VALUES (?, ?, ?, ?, ?)",
            params![source, &document.id, &document.title, &document.path, &document.content],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn upsert_service_status(&self, status: &ServiceStatus) -> RemedyResult<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO service_status (service, status, last_heartbeat, meta) VALUES (?, ?, ?, ?)
            ON CONFLICT(service) DO UPDATE SET
                status = excluded.status,
                last_heartbeat = excluded.last_heartbeat,
                meta = excluded.meta
            "#,
            params![
                &status.service,
                status.status.as_str(),
                status.last_heartbeat.to_rfc3339_opts(SecondsFormat::Micros, true),
                status.meta.to_string(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_service_status(&self, service: &str) -> RemedyResult<Option<ServiceStatus>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT service, status, last_heartbeat, meta FROM service_status WHERE service = ?",
            params![service],
            |row| {
                let state: String = row.get(1)?;
                Ok(ServiceStatus {
                    service: row.get(0)?,
                    status: ServiceState::parse(&state).unwrap_or(ServiceState::Down),
                    last_heartbeat: parse_time(&row.get::<_, String>(2)?),
                    meta: parse_json(&row.get::<_, String>(3)?),
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    async fn save_external_change(&self, change: &ExternalChange) -> RemedyResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO external_changes (id, provider, title, detected_at, body) \
             VALUES (?, ?, ?, ?, ?)",
            params![
                &change.id,
                &change.provider,
                &change.title,
                change.detected_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                serde_json::to_string(change)?,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn external_change_exists(
        &self,
        provider: &str,
        title: &str,
        since: DateTime<Utc>,
    ) -> RemedyResult<bool> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM external_changes WHERE provider = ? AND title = ? AND detected_at >= ?",
                params![provider, title, since.to_rfc3339_opts(SecondsFormat::Micros, true)],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count > 0)
    }

    async fn changes_since(&self, since: DateTime<Utc>) -> RemedyResult<Vec<ChangeEvent>> {
        let conn = self.lock()?;
        let cutoff = since.to_rfc3339_opts(SecondsFormat::Micros, true);
        let mut out = Vec::new();

        let mut stmt = conn
            .prepare("SELECT id, created_at FROM tickets WHERE created_at > ?")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![&cutoff], |row| {
                Ok(ChangeEvent::TicketInserted {
                    ticket_id: row.get(0)?,
                    at: parse_time(&row.get::<_, String>(1)?),
                })
            })
            .map_err(db_err)?;
        for row in rows {
            out.push(row.map_err(db_err)?);
        }

        let mut stmt = conn
            .prepare(
                "SELECT ticket_id, created_at FROM ticket_messages \
                 WHERE author_type = 'customer' AND created_at > ?",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![&cutoff], |row| {
                Ok(ChangeEvent::MessageInserted {
                    ticket_id: row.get(0)?,
                    author_type: AuthorType::Customer,
                    at: parse_time(&row.get::<_, String>(1)?),
                })
            })
            .map_err(db_err)?;
        for row in rows {
            out.push(row.map_err(db_err)?);
        }

        out.sort_by_key(|e| e.at());
        Ok(out)
    }

    async fn ping(&self) -> RemedyResult<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remedy_common::ticket::EscalationEntry;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_ticket_roundtrip_with_latest_message() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("remedy.db")).unwrap();

        let mut ticket = Ticket::new("t-1", "Upload fails", "Cannot read properties of null");
        ticket.source_metadata = serde_json::json!({"locale": "en"});
        ticket.push_escalation(EscalationEntry::customer_followup());
        store.create_ticket(&ticket).await.unwrap();
        store
            .insert_message(&TicketMessage::customer("t-1", "Ana", "still failing"))
            .await
            .unwrap();

        let loaded = store.get_ticket("t-1").await.unwrap().unwrap();
        assert_eq!(loaded.title, "Upload fails");
        assert_eq!(loaded.locale(), Some("en"));
        assert_eq!(loaded.escalation_path.len(), 1);
        assert_eq!(loaded.latest_message.as_deref(), Some("still failing"));
        assert!(store.get_ticket("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_by_status_and_update() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_ticket(&Ticket::new("t-1", "a", "b")).await.unwrap();
        let mut second = Ticket::new("t-2", "c", "d");
        second.status = TicketStatus::Escalated;
        store.create_ticket(&second).await.unwrap();

        let open = store.list_tickets(&[TicketStatus::New]).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "t-1");

        let mut first = open[0].clone();
        first.status = TicketStatus::Investigating;
        first.priority = Priority::Urgent;
        store.update_ticket(&first).await.unwrap();
        let reloaded = store.get_ticket("t-1").await.unwrap().unwrap();
        assert_eq!(reloaded.status, TicketStatus::Investigating);
        assert_eq!(reloaded.priority, Priority::Urgent);
    }

    #[tokio::test]
    async fn test_events_keep_insertion_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let claim = AutomationEvent::new("t-1", EventKind::ProcessingClaimed, serde_json::json!({"claim_id": "a"}));
        let mut release = AutomationEvent::new("t-1", EventKind::ProcessingReleased, serde_json::json!({"claim_id": "a"}));
        release.created_at = claim.created_at;
        store.append_event(&claim).await.unwrap();
        store.append_event(&release).await.unwrap();

        let events = store.list_events("t-1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action_type, EventKind::ProcessingClaimed);
        assert_eq!(events[1].id, release.id);
    }

    #[tokio::test]
    async fn test_metrics_and_heartbeat() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut record = DiagnosisMetricsRecord::new("t-1");
        record.problem_detected = true;
        store.insert_metrics(&record).await.unwrap();
        let since = Utc::now() - chrono::Duration::days(1);
        let records = store.list_metrics(since).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].problem_detected);

        let status = ServiceStatus {
            service: "remedyd".into(),
            status: ServiceState::Up,
            last_heartbeat: Utc::now(),
            meta: serde_json::json!({"channel_status": "subscribed"}),
        };
        store.upsert_service_status(&status).await.unwrap();
        store
            .upsert_service_status(&ServiceStatus {
                status: ServiceState::Down,
                ..status
            })
            .await
            .unwrap();
        let loaded = store.get_service_status("remedyd").await.unwrap().unwrap();
        assert_eq!(loaded.status, ServiceState::Down);
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_documents_are_scoped_by_source() {
        let store = SqliteStore::open_in_memory().unwrap();
        let doc = KnowledgeDocument {
            id: "env".into(),
            title: "Environment".into(),
            path: "docs/env.md".into(),
            content: "NEXT_PUBLIC_APP_URL".into(),
        };
        store.insert_document("knowledge_documents", &doc).await.unwrap();
        assert!(store.load_documents("support_knowledge_documents").await.unwrap().is_empty());
        assert_eq!(store.load_documents("knowledge_documents").await.unwrap().len(), 1);
    }
}
