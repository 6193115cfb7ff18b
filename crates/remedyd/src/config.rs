//! Configuration management for remedyd.
//!
//! Loads settings from /etc/remedy/config.toml (or `--config`, or the
//! `REMEDY_CONFIG` environment variable). A missing file yields defaults;
//! a file that does not parse is a startup error.

use anyhow::{Context, Result};
use remedy_common::llm_client::LlmConfig;
use remedy_common::patterns::MatchSettings;
use remedy_common::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/remedy/config.toml";

/// Environment variable overriding the config path
pub const CONFIG_ENV: &str = "REMEDY_CONFIG";

// ============================================================================
// [daemon]
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Name used for the heartbeat row
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Checkout of the application the fixes are applied to
    #[serde(default = "default_repository_root")]
    pub repository_root: PathBuf,

    /// Bootstrap and change-poll interval
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// How long shutdown waits for in-flight dispatches
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Time-to-live of change-event dedup entries
    #[serde(default = "default_dedup_ttl")]
    pub dedup_ttl_secs: u64,

    /// A processing claim older than this is considered abandoned
    #[serde(default = "default_claim_ttl")]
    pub claim_ttl_secs: u64,
}

fn default_listen() -> String {
    "127.0.0.1:7870".to_string()
}

fn default_service_name() -> String {
    "remedyd".to_string()
}

fn default_repository_root() -> PathBuf {
    PathBuf::from("/var/www/whatsapp-bot-builder/frontend")
}

fn default_poll_interval() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_shutdown_grace() -> u64 {
    20
}

fn default_dedup_ttl() -> u64 {
    60
}

fn default_claim_ttl() -> u64 {
    45 * 60
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            service_name: default_service_name(),
            repository_root: default_repository_root(),
            poll_interval_secs: default_poll_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            shutdown_grace_secs: default_shutdown_grace(),
            dedup_ttl_secs: default_dedup_ttl(),
            claim_ttl_secs: default_claim_ttl(),
        }
    }
}

impl DaemonConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

// ============================================================================
// [store]
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database; empty means the in-memory store
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String {
    "/var/lib/remedy/remedy.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl StoreConfig {
    pub fn is_memory(&self) -> bool {
        self.path.trim().is_empty() || self.path == ":memory:"
    }
}

// ============================================================================
// [approval]
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Webhook receiving approval notices; unset means log only
    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default = "default_approval_poll")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_approval_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_notify_timeout")]
    pub notify_timeout_secs: u64,
}

fn default_approval_poll() -> u64 {
    5
}

fn default_approval_timeout() -> u64 {
    30 * 60
}

fn default_notify_timeout() -> u64 {
    10
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            poll_interval_secs: default_approval_poll(),
            timeout_secs: default_approval_timeout(),
            notify_timeout_secs: default_notify_timeout(),
        }
    }
}

impl ApprovalConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs.max(1))
    }
}

// ============================================================================
// [file_writer] / [remote] / [verifier]
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileWriterConfig {
    /// Base URL of the file-mutation worker; unset means write in-process
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_file_writer_timeout")]
    pub timeout_secs: u64,
}

fn default_file_writer_timeout() -> u64 {
    30
}

impl Default for FileWriterConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_file_writer_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// SSH target; unset disables remote commands
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_remote_user")]
    pub user: String,

    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,
}

fn default_remote_user() -> String {
    "root".to_string()
}

fn default_remote_timeout() -> u64 {
    60
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: None,
            user: default_remote_user(),
            timeout_secs: default_remote_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    /// URLs probed when a ticket reports network failures
    #[serde(default)]
    pub probe_urls: Vec<String>,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

fn default_probe_timeout() -> u64 {
    5
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            probe_urls: Vec::new(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

// ============================================================================
// [knowledge] / [monitor]
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    /// Directories scanned for markdown documents
    #[serde(default = "default_document_roots")]
    pub document_roots: Vec<PathBuf>,

    /// Store sources tried in order; the first non-empty one is used
    #[serde(default = "default_store_sources")]
    pub store_sources: Vec<String>,
}

fn default_document_roots() -> Vec<PathBuf> {
    vec![PathBuf::from("/var/lib/remedy/docs")]
}

fn default_store_sources() -> Vec<String> {
    vec![
        "support_knowledge_documents".to_string(),
        "knowledge_documents".to_string(),
    ]
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            document_roots: default_document_roots(),
            store_sources: default_store_sources(),
        }
    }
}

/// One provider watched by the external change monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    /// JSON document carrying the provider's current version
    pub url: String,
    /// JSON pointer to the version field, e.g. `/version`
    #[serde(default = "default_version_pointer")]
    pub version_pointer: String,
    /// Version the integration is built against; when unset, the first
    /// observed version becomes the baseline
    #[serde(default)]
    pub pinned_version: Option<String>,
    #[serde(default)]
    pub affected_services: Vec<String>,
}

fn default_version_pointer() -> String {
    "/version".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

fn default_monitor_interval() -> u64 {
    24 * 60 * 60
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_monitor_interval(),
            providers: Vec::new(),
        }
    }
}

// ============================================================================
// Top level
// ============================================================================

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub file_writer: FileWriterConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub matching: MatchSettings,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl Config {
    /// Resolve the config path: explicit flag, then env var, then default
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => PathBuf::from(CONFIG_PATH),
        }
    }

    /// Load config; a missing file means defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_path(explicit);
        if !path.exists() {
            warn!("[CONFIG] {} not found, using defaults", path.display());
            return Ok(Config::default());
        }
        Self::load_from_path(&path)
    }

    fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        info!("[CONFIG] Loaded config from {}", path.display());
        Ok(config)
    }
}
