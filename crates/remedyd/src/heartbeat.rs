//! Service heartbeat: one upserted status row per service.

use crate::change_feed::FeedStatus;
use crate::metrics::MetricsSink;
use crate::store::{ServiceState, ServiceStatus, TicketStore};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

pub struct Heartbeat {
    store: Arc<dyn TicketStore>,
    service: String,
    interval: Duration,
    feed: Arc<FeedStatus>,
    metrics: Arc<dyn MetricsSink>,
}

impl Heartbeat {
    pub fn new(
        store: Arc<dyn TicketStore>,
        service: &str,
        interval: Duration,
        feed: Arc<FeedStatus>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            service: service.to_string(),
            interval,
            feed,
            metrics,
        }
    }

    fn meta(&self) -> serde_json::Value {
        let snapshot = self.metrics.snapshot();
        serde_json::json!({
            "interval_ms": self.interval.as_millis() as u64,
            "channel_status": self.feed.channel(),
            "reconnects": self.feed.reconnects(),
            "lagged_events": self.feed.lagged_events(),
            "tickets_processed": snapshot.tickets_processed,
            "error_count": snapshot.error_count,
        })
    }

    /// `degraded` while the change stream is not subscribed
    fn current_state(&self) -> ServiceState {
        if self.feed.is_subscribed() {
            ServiceState::Up
        } else {
            ServiceState::Degraded
        }
    }

    pub async fn beat(&self, status: ServiceState) {
        let row = ServiceStatus {
            service: self.service.clone(),
            status,
            last_heartbeat: Utc::now(),
            meta: self.meta(),
        };
        if let Err(e) = self.store.upsert_service_status(&row).await {
            warn!("[HEARTBEAT] Could not store heartbeat for {}: {}", self.service, e);
        }
    }

    /// Beat every interval until shutdown, then mark the service down
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "[HEARTBEAT] Starting for {} every {:?}",
            self.service, self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.beat(self.current_state()).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.beat(ServiceState::Down).await;
        info!("[HEARTBEAT] Stopped for {}", self.service);
    }
}
