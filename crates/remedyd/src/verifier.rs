//! Problem verification against live repository and network state.
//!
//! A pattern match is only a hypothesis. Before any fix instruction runs,
//! the verifier looks at the files, the environment and the endpoints the
//! pattern points to. Every check here is read-only.
//!
//! The one way to obtain a [`ConfirmedProblem`] is from a verification that
//! recorded at least one [`Polarity::Problem`] finding; the action executor
//! refuses to run without one.

use crate::config::VerifierConfig;
use chrono::{DateTime, Utc};
use regex::Regex;
use remedy_common::config_index::{parse_config_pattern_id, ConfigType, ConfigurationIndex, ConfigurationItem};
use remedy_common::error::RemedyError;
use remedy_common::patterns::{AutoFixInstruction, PatternMatch, DEFAULT_LOCALE, LOCALES};
use remedy_common::ticket::Ticket;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Words that make a text-only verification treat the report as a real fault
const ERROR_KEYWORDS: &[&str] = &[
    "fehler",
    "error",
    "nicht",
    "fehlt",
    "missing",
    "cannot",
    "failed",
    "fails",
    "typeerror",
    "referenceerror",
];

static HANDLER_RE: once_cell::sync::Lazy<Regex> = once_cell::sync::Lazy::new(|| {
    Regex::new(r"export\s+(?:async\s+)?function\s+(?:GET|POST|PUT|PATCH|DELETE)\b").unwrap()
});

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// What a finding says about the problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// Positive evidence that the problem holds
    Problem,
    /// Evidence that the checked aspect is fine
    Healthy,
    /// Could not check; says nothing either way
    Note,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub polarity: Polarity,
    pub message: String,
}

impl Finding {
    pub fn problem(message: impl Into<String>) -> Self {
        Self {
            polarity: Polarity::Problem,
            message: message.into(),
        }
    }

    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            polarity: Polarity::Healthy,
            message: message.into(),
        }
    }

    pub fn note(message: impl Into<String>) -> Self {
        Self {
            polarity: Polarity::Note,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemVerification {
    pub ticket_id: String,
    pub pattern_id: String,
    /// True exactly when `evidence` holds a problem finding
    pub problem_exists: bool,
    pub severity: Severity,
    pub evidence: Vec<Finding>,
    /// Whether the checks looked at files or endpoints rather than ticket text only
    pub live: bool,
    pub checked_at: DateTime<Utc>,
}

impl ProblemVerification {
    fn from_findings(
        ticket_id: &str,
        pattern_id: &str,
        evidence: Vec<Finding>,
        severity_if_present: Severity,
        live: bool,
    ) -> Self {
        let problem_exists = evidence.iter().any(|f| f.polarity == Polarity::Problem);
        Self {
            ticket_id: ticket_id.to_string(),
            pattern_id: pattern_id.to_string(),
            problem_exists,
            severity: if problem_exists {
                severity_if_present
            } else {
                Severity::Low
            },
            evidence,
            live,
            checked_at: Utc::now(),
        }
    }

    pub fn problem_findings(&self) -> impl Iterator<Item = &Finding> {
        self.evidence.iter().filter(|f| f.polarity == Polarity::Problem)
    }

    /// Short reason for audit payloads and error messages
    pub fn reason(&self) -> String {
        let source: Vec<&str> = if self.problem_exists {
            self.problem_findings().map(|f| f.message.as_str()).collect()
        } else {
            self.evidence.iter().map(|f| f.message.as_str()).collect()
        };
        if source.is_empty() {
            "no evidence".to_string()
        } else {
            source.join("; ")
        }
    }
}

/// Proof that the latest verification for a ticket confirmed the problem
#[derive(Debug, Clone)]
pub struct ConfirmedProblem {
    verification: ProblemVerification,
}

impl ConfirmedProblem {
    pub fn ticket_id(&self) -> &str {
        &self.verification.ticket_id
    }

    pub fn pattern_id(&self) -> &str {
        &self.verification.pattern_id
    }

    pub fn verification(&self) -> &ProblemVerification {
        &self.verification
    }
}

impl TryFrom<ProblemVerification> for ConfirmedProblem {
    type Error = RemedyError;

    fn try_from(verification: ProblemVerification) -> Result<Self, Self::Error> {
        if !verification.problem_exists {
            return Err(RemedyError::VerificationFailed {
                pattern_id: verification.pattern_id.clone(),
                reason: verification.reason(),
            });
        }
        Ok(Self { verification })
    }
}

// ============================================================================
// Verifier
// ============================================================================

pub struct ProblemVerifier {
    root: PathBuf,
    index: Arc<ConfigurationIndex>,
    probe_urls: Vec<String>,
    probe_timeout: Duration,
    client: reqwest::Client,
}

impl ProblemVerifier {
    pub fn new(root: impl Into<PathBuf>, index: Arc<ConfigurationIndex>, config: &VerifierConfig) -> Self {
        Self {
            root: root.into(),
            index,
            probe_urls: config.probe_urls.clone(),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            client: reqwest::Client::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Check whether the problem behind `matched` currently holds
    pub async fn verify(&self, ticket: &Ticket, matched: &PatternMatch) -> ProblemVerification {
        let pattern_id = matched.pattern_id.as_str();
        let (evidence, severity, live) = match pattern_id {
            "missing-translation" => (self.check_translations(matched), Severity::Medium, true),
            "missing-locale-file" => (self.check_locale_files(matched), Severity::Medium, true),
            "missing-env-variable" => (self.check_env_placeholders(matched), Severity::High, true),
            "network-fetch-failed" if !self.probe_urls.is_empty() => {
                (self.probe_endpoints().await, Severity::High, true)
            }
            id if id.starts_with("config-") => self.check_configuration(ticket, matched),
            _ => (generic_findings(ticket), Severity::Medium, false),
        };

        let verification =
            ProblemVerification::from_findings(&ticket.id, pattern_id, evidence, severity, live);
        info!(
            "[VERIFY] {} on ticket {}: problem_exists={} ({} findings, live={})",
            pattern_id,
            ticket.id,
            verification.problem_exists,
            verification.evidence.len(),
            verification.live
        );
        verification
    }

    // ------------------------------------------------------------------
    // Signature checks
    // ------------------------------------------------------------------

    fn check_translations(&self, matched: &PatternMatch) -> Vec<Finding> {
        let keys: Vec<&str> = matched
            .instructions
            .iter()
            .filter_map(|i| match i {
                AutoFixInstruction::I18nAddKey { key, .. } => Some(key.as_str()),
                _ => None,
            })
            .collect();
        if keys.is_empty() {
            return vec![Finding::note("no translation key in ticket")];
        }

        let mut findings = Vec::new();
        for locale in LOCALES {
            let path = self.root.join("messages").join(format!("{}.json", locale));
            let messages = match read_json(&path) {
                Ok(value) => value,
                Err(reason) => {
                    findings.push(Finding::note(format!("{}.json unreadable: {}", locale, reason)));
                    continue;
                }
            };
            for key in &keys {
                if has_nested_key(&messages, key) {
                    findings.push(Finding::healthy(format!("key {} present in {}.json", key, locale)));
                } else {
                    findings.push(Finding::problem(format!("key {} missing in {}.json", key, locale)));
                }
            }
        }
        findings
    }

    fn check_locale_files(&self, matched: &PatternMatch) -> Vec<Finding> {
        let mut findings = Vec::new();
        for instruction in &matched.instructions {
            let AutoFixInstruction::CloneLocaleFile {
                locale, base_locale, ..
            } = instruction
            else {
                continue;
            };
            let target = self.root.join("messages").join(format!("{}.json", locale));
            if target.exists() {
                findings.push(Finding::healthy(format!("messages/{}.json exists", locale)));
            } else {
                findings.push(Finding::problem(format!("messages/{}.json does not exist", locale)));
            }
            let base = self.root.join("messages").join(format!("{}.json", base_locale));
            if !base.exists() {
                findings.push(Finding::note(format!(
                    "base locale file messages/{}.json is missing too",
                    base_locale
                )));
            }
        }
        if findings.is_empty() {
            findings.push(Finding::note(format!(
                "no locale named besides default {}",
                DEFAULT_LOCALE
            )));
        }
        findings
    }

    fn check_env_placeholders(&self, matched: &PatternMatch) -> Vec<Finding> {
        let mut findings = Vec::new();
        for instruction in &matched.instructions {
            if let AutoFixInstruction::EnvAddPlaceholder { key, file, .. } = instruction {
                findings.push(self.env_key_finding(key, file));
            }
        }
        if findings.is_empty() {
            findings.push(Finding::note("no environment variable named in ticket"));
        }
        findings
    }

    fn env_key_finding(&self, key: &str, file: &str) -> Finding {
        match std::fs::read_to_string(self.root.join(file)) {
            Ok(content) if env_defines(&content, key) => {
                Finding::healthy(format!("{} defined in {}", key, file))
            }
            Ok(_) => Finding::problem(format!("{} missing in {}", key, file)),
            // no env file means the variable cannot be set from it
            Err(_) => Finding::problem(format!("{} not readable, {} is not set", file, key)),
        }
    }

    async fn probe_endpoints(&self) -> Vec<Finding> {
        let mut findings = Vec::new();
        for url in &self.probe_urls {
            let result = tokio::time::timeout(self.probe_timeout, self.client.get(url).send()).await;
            let finding = match result {
                Ok(Ok(response)) if response.status().is_server_error() => {
                    Finding::problem(format!("{} answered {}", url, response.status()))
                }
                Ok(Ok(response)) => Finding::healthy(format!("{} answered {}", url, response.status())),
                Ok(Err(e)) => Finding::problem(format!("{} unreachable: {}", url, e)),
                Err(_) => Finding::problem(format!(
                    "{} did not answer within {}s",
                    url,
                    self.probe_timeout.as_secs()
                )),
            };
            debug!("[VERIFY] probe {}", finding.message);
            findings.push(finding);
        }
        findings
    }

    // ------------------------------------------------------------------
    // Configuration checks
    // ------------------------------------------------------------------

    fn check_configuration(&self, ticket: &Ticket, matched: &PatternMatch) -> (Vec<Finding>, Severity, bool) {
        let item = parse_config_pattern_id(&matched.pattern_id)
            .and_then(|(ty, name)| self.index.find(ty, name));
        let Some(item) = item else {
            let mut findings = vec![Finding::note(format!(
                "{} not in the configuration index",
                matched.pattern_id
            ))];
            findings.extend(generic_findings(ticket));
            return (findings, Severity::Medium, false);
        };

        let mut findings = match item.config_type {
            ConfigType::EnvVar => {
                let file = matched
                    .instructions
                    .iter()
                    .find_map(|i| match i {
                        AutoFixInstruction::EnvAddPlaceholder { file, .. } => Some(file.as_str()),
                        _ => None,
                    })
                    .unwrap_or(".env.local");
                vec![self.env_key_finding(&item.name, file)]
            }
            ConfigType::ApiEndpoint => self.check_api_route(item),
            ConfigType::FrontendConfig => self.check_repository_file(&item.location),
            ConfigType::DatabaseSetting | ConfigType::DeploymentConfig => {
                let findings = documented_issue_findings(ticket, item);
                return (findings, Severity::High, false);
            }
        };
        findings.extend(self.check_code_markers(matched));
        (findings, Severity::High, true)
    }

    fn check_api_route(&self, item: &ConfigurationItem) -> Vec<Finding> {
        let path = self.root.join(&item.location);
        match std::fs::read_to_string(&path) {
            Ok(content) if HANDLER_RE.is_match(&content) => {
                vec![Finding::healthy(format!("{} exports a handler", item.location))]
            }
            Ok(_) => vec![Finding::problem(format!(
                "{} exports no HTTP handler",
                item.location
            ))],
            Err(_) => vec![Finding::problem(format!(
                "route file {} for {} does not exist",
                item.location, item.name
            ))],
        }
    }

    fn check_repository_file(&self, location: &str) -> Vec<Finding> {
        if self.root.join(location).exists() {
            vec![Finding::healthy(format!("{} exists", location))]
        } else {
            vec![Finding::problem(format!("{} does not exist", location))]
        }
    }

    /// Code modifications only make sense while their search pattern still matches
    fn check_code_markers(&self, matched: &PatternMatch) -> Vec<Finding> {
        let mut findings = Vec::new();
        for instruction in &matched.instructions {
            let AutoFixInstruction::CodeModify { file, modifications } = instruction else {
                continue;
            };
            let Ok(content) = std::fs::read_to_string(self.root.join(file)) else {
                findings.push(Finding::note(format!("{} unreadable", file)));
                continue;
            };
            for modification in modifications {
                match Regex::new(&modification.search) {
                    Ok(re) if re.is_match(&content) => findings.push(Finding::problem(format!(
                        "{}: {} still present",
                        file, modification.description
                    ))),
                    Ok(_) => findings.push(Finding::healthy(format!(
                        "{}: nothing left for {}",
                        file, modification.description
                    ))),
                    Err(e) => findings.push(Finding::note(format!("bad search pattern: {}", e))),
                }
            }
        }
        findings
    }
}

fn documented_issue_findings(ticket: &Ticket, item: &ConfigurationItem) -> Vec<Finding> {
    let text = ticket.combined_text().to_lowercase();
    let hits: Vec<&String> = item
        .known_issues
        .iter()
        .filter(|issue| !issue.is_empty() && text.contains(&issue.to_lowercase()))
        .collect();
    if hits.is_empty() {
        let mut findings = vec![Finding::note(format!("no documented issue of {} in ticket", item.name))];
        findings.extend(generic_findings(ticket));
        findings
    } else {
        hits.into_iter()
            .map(|issue| Finding::problem(format!("documented issue of {}: {}", item.name, issue)))
            .collect()
    }
}

fn generic_findings(ticket: &Ticket) -> Vec<Finding> {
    let text = ticket.combined_text().to_lowercase();
    let hits: Vec<&str> = ERROR_KEYWORDS
        .iter()
        .copied()
        .filter(|k| text.contains(k))
        .collect();
    if hits.is_empty() {
        vec![Finding::note("no error keywords in ticket")]
    } else {
        vec![Finding::problem(format!("error keywords in ticket: {}", hits.join(", ")))]
    }
}

fn read_json(path: &Path) -> Result<serde_json::Value, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&raw).map_err(|e| e.to_string())
}

/// Dotted key lookup (`a.b.c`) in nested JSON objects
pub fn has_nested_key(value: &serde_json::Value, key: &str) -> bool {
    let mut current = value;
    for part in key.split('.') {
        match current.get(part) {
            Some(next) => current = next,
            None => return false,
        }
    }
    true
}

/// Whether an env file assigns `key`, commented lines excluded
pub fn env_defines(content: &str, key: &str) -> bool {
    content.lines().any(|line| {
        let line = line.trim_start();
        !line.starts_with('#')
            && line
                .strip_prefix("export ")
                .unwrap_or(line)
                .split_once('=')
                .map(|(k, _)| k.trim() == key)
                .unwrap_or(false)
    })
}
