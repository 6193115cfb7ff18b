//! HTTP server for remedyd

use crate::change_feed::ChangeHub;
use crate::health::HealthChecker;
use crate::metrics::{MetricsSink, MetricsTracker};
use crate::routes;
use crate::store::TicketStore;
use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
pub struct AppState {
    pub store: Arc<dyn TicketStore>,
    pub hub: ChangeHub,
    pub metrics: Arc<dyn MetricsSink>,
    pub tracker: MetricsTracker,
    pub health: HealthChecker,
}

impl AppState {
    pub fn new(
        store: Arc<dyn TicketStore>,
        hub: ChangeHub,
        metrics: Arc<dyn MetricsSink>,
        health: HealthChecker,
    ) -> Self {
        Self {
            tracker: MetricsTracker::new(store.clone()),
            store,
            hub,
            metrics,
            health,
        }
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::health_routes())
        .merge(routes::metrics_routes())
        .merge(routes::event_routes())
        .merge(routes::approval_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` flips to true
pub async fn run(state: AppState, listen: &str, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let app = app(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {}", listen))?;
    info!("[SERVER] Listening on http://{}", listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;
    info!("[SERVER] Stopped");
    Ok(())
}
