//! Remedy Daemon - automated support-ticket remediation
//!
//! Watches the ticket store, matches tickets against known failure
//! signatures, verifies and applies fixes, and serves health and metrics.

use anyhow::{Context, Result};
use clap::Parser;
use remedy_common::llm_client::{HttpLlmClient, LlmClient};
use remedy_common::patterns::PatternMatcher;
use remedyd::approval::{notifier_from_config, ApprovalGateway};
use remedyd::change_feed::{ChangeHub, FeedStatus};
use remedyd::config::Config;
use remedyd::executor::ActionExecutor;
use remedyd::file_writer::{FileMutation, HttpFileWriter, LocalFileWriter};
use remedyd::health::HealthChecker;
use remedyd::heartbeat::Heartbeat;
use remedyd::knowledge::KnowledgeBase;
use remedyd::metrics::{MetricsCollector, MetricsSink};
use remedyd::monitor::{MonitorScheduler, UpdateHandler};
use remedyd::planner::PlanGenerator;
use remedyd::remote_exec::{CommandExecutor, SshCommandExecutor};
use remedyd::router::{RouterParts, RouterSettings, TicketRouter};
use remedyd::server::{self, AppState};
use remedyd::store::{MemoryStore, SqliteStore, TicketStore};
use remedyd::verifier::ProblemVerifier;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Per-provider request timeout of the external change monitor
const MONITOR_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "remedyd", version, about = "Automated support-ticket remediation daemon")]
struct Args {
    /// Config file (default: $REMEDY_CONFIG or /etc/remedy/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    info!("Remedy Daemon v{} starting", env!("CARGO_PKG_VERSION"));

    let hub = ChangeHub::new();
    let store: Arc<dyn TicketStore> = if config.store.is_memory() {
        warn!("[REMEDYD] Using the in-memory store, nothing survives a restart");
        Arc::new(MemoryStore::with_hub(hub.clone()))
    } else {
        Arc::new(
            SqliteStore::open(Path::new(&config.store.path))
                .with_context(|| format!("Failed to open store {}", config.store.path))?,
        )
    };
    let metrics: Arc<dyn MetricsSink> =
        Arc::new(MetricsCollector::new().context("Failed to register metrics")?);
    let feed = Arc::new(FeedStatus::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Knowledge and matching
    let knowledge = Arc::new(KnowledgeBase::load(&config.knowledge, store.as_ref()).await);
    let index = knowledge.index();
    info!(
        "[REMEDYD] {} knowledge documents, {} configuration items",
        knowledge.len(),
        index.items().len()
    );
    let matcher = Arc::new(PatternMatcher::new(index.clone(), config.matching.clone()));
    let verifier = Arc::new(ProblemVerifier::new(
        config.daemon.repository_root.clone(),
        Arc::new(index),
        &config.verifier,
    ));

    // Outbound collaborators
    let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(config.llm.clone())?);
    let planner = Arc::new(PlanGenerator::new(
        llm,
        config.retry.clone(),
        Duration::from_secs(config.llm.timeout_secs),
    ));
    let approvals = Arc::new(
        ApprovalGateway::new(
            store.clone(),
            notifier_from_config(&config.approval)?,
            &config.approval,
            config.retry.clone(),
        )
        .with_shutdown(shutdown_rx.clone()),
    );
    let writer_timeout = Duration::from_secs(config.file_writer.timeout_secs);
    let writer: Arc<dyn FileMutation> = match &config.file_writer.url {
        Some(url) => Arc::new(HttpFileWriter::new(url, writer_timeout)?),
        None => Arc::new(LocalFileWriter),
    };
    let commands: Arc<dyn CommandExecutor> = Arc::new(SshCommandExecutor::new(&config.remote));
    if !commands.is_configured() {
        info!("[REMEDYD] No remote host configured, remote commands will fail");
    }
    let executor = Arc::new(ActionExecutor::new(
        store.clone(),
        writer,
        commands,
        approvals,
        config.retry.clone(),
        writer_timeout,
        config.daemon.repository_root.clone(),
    ));

    // Router
    let router = Arc::new(TicketRouter::new(
        RouterParts {
            store: store.clone(),
            matcher,
            verifier,
            planner,
            executor,
            knowledge,
            metrics: metrics.clone(),
            hub: hub.clone(),
            feed: feed.clone(),
        },
        RouterSettings {
            poll_interval: config.daemon.poll_interval(),
            claim_ttl: Duration::from_secs(config.daemon.claim_ttl_secs),
            shutdown_grace: config.daemon.shutdown_grace(),
            dedup_ttl: Duration::from_secs(config.daemon.dedup_ttl_secs),
        },
    ));

    let mut tasks: Vec<(&str, JoinHandle<()>)> = Vec::new();
    tasks.push(("router", tokio::spawn(router.clone().run(shutdown_rx.clone()))));

    let heartbeat = Arc::new(Heartbeat::new(
        store.clone(),
        &config.daemon.service_name,
        config.daemon.heartbeat_interval(),
        feed.clone(),
        metrics.clone(),
    ));
    tasks.push(("heartbeat", tokio::spawn(heartbeat.run(shutdown_rx.clone()))));

    if config.monitor.enabled {
        let scheduler = Arc::new(MonitorScheduler::new(
            MonitorScheduler::monitors_from_config(&config.monitor, MONITOR_TIMEOUT),
            store.clone(),
            UpdateHandler::new(store.clone(), router.clone()),
            Duration::from_secs(config.monitor.interval_secs),
        ));
        tasks.push(("monitor", tokio::spawn(scheduler.run(shutdown_rx.clone()))));
    }

    // HTTP surface
    let health = HealthChecker::new(
        store.clone(),
        feed,
        metrics.clone(),
        config.daemon.repository_root.clone(),
    );
    let state = AppState::new(store, hub, metrics, health);
    let listen = config.daemon.listen.clone();
    let server_rx = shutdown_rx.clone();
    tasks.push((
        "server",
        tokio::spawn(async move {
            if let Err(e) = server::run(state, &listen, server_rx).await {
                error!("[SERVER] {:#}", e);
            }
        }),
    ));

    info!("Remedy Daemon ready");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down gracefully");
    // Receivers only go away with their tasks
    let _ = shutdown_tx.send(true);

    // Router drains within its own grace period; allow a little extra on top
    let deadline = config.daemon.shutdown_grace() + Duration::from_secs(5);
    for (name, handle) in tasks {
        match tokio::time::timeout(deadline, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("[REMEDYD] {} task failed: {}", name, e),
            Err(_) => warn!("[REMEDYD] {} did not stop within {:?}", name, deadline),
        }
    }
    info!("Remedy Daemon stopped");
    Ok(())
}
