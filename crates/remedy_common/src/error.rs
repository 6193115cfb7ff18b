//! Error types for the remediation engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemedyError {
    /// No signature or semantic match; the ticket goes to the plan generator
    #[error("No pattern matched ticket {0}")]
    MatchNotFound(String),

    /// Matched, but live state does not show the problem
    #[error("Problem not confirmed for pattern {pattern_id}: {reason}")]
    VerificationFailed { pattern_id: String, reason: String },

    /// Whitelist violation; never forwarded to the executor
    #[error("Command rejected: {reason} ({command})")]
    CommandRejected { command: String, reason: String },

    /// No approval decision within the window; deferred, not fatal
    #[error("Approval for {instruction_type} on ticket {ticket_id} timed out")]
    ApprovalTimeout {
        ticket_id: String,
        instruction_type: String,
    },

    /// LLM, file-mutation worker, notifier or command executor unreachable
    #[error("Remote call to {service} failed: {message}")]
    RemoteCallFailure { service: String, message: String },

    /// Anything else that went wrong while processing one ticket
    #[error("Dispatch failed for ticket {ticket_id}: {message}")]
    DispatchException { ticket_id: String, message: String },

    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RemedyError {
    /// Stable code recorded in automation event payloads
    pub fn code(&self) -> &'static str {
        match self {
            RemedyError::MatchNotFound(_) => "match_not_found",
            RemedyError::VerificationFailed { .. } => "verification_failed",
            RemedyError::CommandRejected { .. } => "command_rejected",
            RemedyError::ApprovalTimeout { .. } => "approval_timeout",
            RemedyError::RemoteCallFailure { .. } => "remote_call_failure",
            RemedyError::DispatchException { .. } => "dispatch_exception",
            RemedyError::Timeout(_) => "timeout",
            RemedyError::Store(_) => "store",
            RemedyError::Config(_) => "config",
            RemedyError::Io(_) => "io",
            RemedyError::Json(_) => "json",
        }
    }

    pub fn remote(service: &str, message: impl std::fmt::Display) -> Self {
        RemedyError::RemoteCallFailure {
            service: service.to_string(),
            message: message.to_string(),
        }
    }

    pub fn store(message: impl std::fmt::Display) -> Self {
        RemedyError::Store(message.to_string())
    }

    /// Failures worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemedyError::RemoteCallFailure { .. } | RemedyError::Timeout(_) | RemedyError::Store(_)
        )
    }
}

pub type RemedyResult<T> = std::result::Result<T, RemedyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        let err = RemedyError::CommandRejected {
            command: "rm -rf /".into(),
            reason: "binary not whitelisted: rm".into(),
        };
        assert_eq!(err.code(), "command_rejected");
        assert!(err.to_string().contains("rm -rf /"));
        assert!(!err.is_transient());
        assert!(RemedyError::remote("llm", "connection refused").is_transient());
    }
}
