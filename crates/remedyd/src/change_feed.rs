//! Ticket change stream.
//!
//! Changes reach the router two ways: pushed through [`ChangeHub`] (the
//! in-memory store and `POST /v1/events` publish there) and pulled by the
//! router's poll loop via `TicketStore::changes_since`. Both paths may see
//! the same change, which is what the dedup cache is for.

use chrono::{DateTime, Utc};
use remedy_common::ticket::AuthorType;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;

const HUB_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    TicketInserted {
        ticket_id: String,
        at: DateTime<Utc>,
    },
    TicketUpdated {
        ticket_id: String,
        at: DateTime<Utc>,
    },
    MessageInserted {
        ticket_id: String,
        author_type: AuthorType,
        at: DateTime<Utc>,
    },
}

impl ChangeEvent {
    pub fn ticket_id(&self) -> &str {
        match self {
            Self::TicketInserted { ticket_id, .. }
            | Self::TicketUpdated { ticket_id, .. }
            | Self::MessageInserted { ticket_id, .. } => ticket_id,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::TicketInserted { at, .. }
            | Self::TicketUpdated { at, .. }
            | Self::MessageInserted { at, .. } => *at,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::TicketInserted { .. } => "ticket_inserted",
            Self::TicketUpdated { .. } => "ticket_updated",
            Self::MessageInserted { .. } => "message_inserted",
        }
    }

    /// `kind:ticket:timestamp`
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.kind(),
            self.ticket_id(),
            self.at().timestamp_millis()
        )
    }
}

/// Fan-out of pushed change events
#[derive(Clone)]
pub struct ChangeHub {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Self { tx }
    }

    /// Number of subscribers that received the event
    pub fn publish(&self, event: ChangeEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}

impl Default for ChangeHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscription state, shared with the heartbeat and the health check
#[derive(Debug)]
pub struct FeedStatus {
    channel: Mutex<String>,
    reconnects: AtomicU64,
    lagged_events: AtomicU64,
}

impl FeedStatus {
    pub fn new() -> Self {
        Self {
            channel: Mutex::new("unknown".to_string()),
            reconnects: AtomicU64::new(0),
            lagged_events: AtomicU64::new(0),
        }
    }

    pub fn set_channel(&self, status: &str) {
        if let Ok(mut channel) = self.channel.lock() {
            *channel = status.to_string();
        }
    }

    pub fn channel(&self) -> String {
        self.channel
            .lock()
            .map(|c| c.clone())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    pub fn is_subscribed(&self) -> bool {
        self.channel() == "subscribed"
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lag(&self, missed: u64) {
        self.lagged_events.fetch_add(missed, Ordering::Relaxed);
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn lagged_events(&self) -> u64 {
        self.lagged_events.load(Ordering::Relaxed)
    }
}

impl Default for FeedStatus {
    fn default() -> Self {
        Self::new()
    }
}
