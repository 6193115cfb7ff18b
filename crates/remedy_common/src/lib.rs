//! Remedy Common - domain types and pure logic for the remediation engine.
//!
//! Everything here is free of I/O except the LLM client: tickets and the
//! audit log model, the command whitelist, configuration extraction,
//! pattern matching, plans, agent profiles and funnel metrics.

pub mod agent_profiles;
pub mod command_whitelist;
pub mod config_index;
pub mod error;
pub mod event;
pub mod funnel;
pub mod llm_client;
pub mod patterns;
pub mod plan;
pub mod retry;
pub mod semantic;
pub mod ticket;

pub use agent_profiles::{AgentProfile, AgentTier, Capability};
pub use command_whitelist::{is_command_allowed, CommandCheck};
pub use config_index::{ConfigType, ConfigurationIndex, ConfigurationItem, KnowledgeDocument};
pub use error::{RemedyError, RemedyResult};
pub use event::{ApprovalPayload, AutomationEvent, EventKind};
pub use funnel::{DiagnosisMetricsRecord, SuccessRateMetrics};
pub use llm_client::{LlmClient, LlmConfig, LlmError};
pub use patterns::{AutoFixInstruction, MatchSettings, PatternMatch, PatternMatcher};
pub use plan::{ActionKind, ResolutionAction, ResolutionPlan};
pub use retry::RetryPolicy;
pub use ticket::{Priority, Ticket, TicketMessage, TicketStatus};

/// Crate version, reported by the daemon and CLI
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
