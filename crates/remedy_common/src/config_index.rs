//! Configuration index built from the documentation corpus.
//!
//! Extracts typed configuration items (env vars, API endpoints, database
//! policies, frontend files, deployment tooling, PDF handling) from free-text
//! documents. Items are read-only and rebuilt whenever the corpus reloads.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A document from the knowledge corpus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub id: String,
    pub title: String,
    pub path: String,
    pub content: String,
}

impl KnowledgeDocument {
    /// Title from the first markdown heading, falling back to `fallback`
    pub fn title_from_markdown(content: &str, fallback: &str) -> String {
        content
            .lines()
            .find_map(|line| line.trim_start().strip_prefix('#'))
            .map(|rest| rest.trim_start_matches('#').trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| fallback.to_string())
    }
}

/// Kind of configuration item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigType {
    EnvVar,
    ApiEndpoint,
    DatabaseSetting,
    FrontendConfig,
    DeploymentConfig,
}

impl ConfigType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EnvVar => "env_var",
            Self::ApiEndpoint => "api_endpoint",
            Self::DatabaseSetting => "database_setting",
            Self::FrontendConfig => "frontend_config",
            Self::DeploymentConfig => "deployment_config",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "env_var" => Some(Self::EnvVar),
            "api_endpoint" => Some(Self::ApiEndpoint),
            "database_setting" => Some(Self::DatabaseSetting),
            "frontend_config" => Some(Self::FrontendConfig),
            "deployment_config" => Some(Self::DeploymentConfig),
            _ => None,
        }
    }

    /// Vocabulary that hints at this configuration type
    pub fn keywords(&self) -> &'static [&'static str] {
        match self {
            Self::EnvVar => &["env", "variable", "konfiguration", "setting", "config"],
            Self::ApiEndpoint => &["api", "endpoint", "route", "url", "request"],
            Self::DatabaseSetting => &["datenbank", "database", "db", "supabase", "rls", "policy"],
            Self::FrontendConfig => &["frontend", "ui", "komponente", "component", "seite", "page"],
            Self::DeploymentConfig => &["deployment", "server", "pm2", "caddy", "nginx"],
        }
    }
}

impl std::fmt::Display for ConfigType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A structured fact extracted from documentation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationItem {
    pub config_type: ConfigType,
    pub name: String,
    pub description: String,
    pub location: String,
    /// Phrases customers use when this item is broken
    pub known_issues: Vec<String>,
    pub fix_strategies: Vec<String>,
}

impl ConfigurationItem {
    /// Pattern id used when this item wins the semantic pass
    pub fn pattern_id(&self) -> String {
        format!("config-{}-{}", self.config_type.as_str(), self.name)
    }

    /// Lowercased `name description location`
    pub fn match_text(&self) -> String {
        format!("{} {} {}", self.name, self.description, self.location).to_lowercase()
    }
}

/// Parsed `config-<type>-<name>` pattern id
pub fn parse_config_pattern_id(pattern_id: &str) -> Option<(ConfigType, &str)> {
    let rest = pattern_id.strip_prefix("config-")?;
    for ty in ALL_TYPES {
        if let Some(name) = rest.strip_prefix(ty.as_str()).and_then(|r| r.strip_prefix('-')) {
            if !name.is_empty() {
                return Some((*ty, name));
            }
        }
    }
    None
}

const ALL_TYPES: &[ConfigType] = &[
    ConfigType::EnvVar,
    ConfigType::ApiEndpoint,
    ConfigType::DatabaseSetting,
    ConfigType::FrontendConfig,
    ConfigType::DeploymentConfig,
];

// ============================================================================
// Extraction
// ============================================================================

static ENV_VAR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:NEXT_PUBLIC_|SUPABASE_|GROQ_|HETZNER_|OPENAI_|STRIPE_|PAYPAL_)[A-Z_]+")
        .unwrap()
});
static API_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/api/[a-z0-9/-]+").unwrap());
static DB_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:RLS|Row Level Security|policy|trigger|migration)\b")
        .unwrap()
});
static FRONTEND_FILE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:app|components|lib)/[A-Za-z0-9_\[\]./-]+\.(?:tsx?|jsx?)")
        .unwrap()
});
static DEPLOY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:pm2|ecosystem|caddy|nginx|docker|deploy)")
        .unwrap()
});
static PDF_FILE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:app|components|lib)/[A-Za-z0-9_\[\]./-]*(?:pdf|Pdf|knowledge)[A-Za-z0-9_\[\]./-]*\.(?:tsx?|jsx?)")
        .unwrap()
});

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// First sentence-ish line of `content` that mentions `needle`, trimmed
fn context_line(content: &str, needle: &str) -> Option<String> {
    content
        .lines()
        .find(|line| line.contains(needle))
        .map(|line| {
            line.trim()
                .trim_start_matches(['-', '*', '#', '|', ' '])
                .trim()
                .chars()
                .take(160)
                .collect::<String>()
        })
        .filter(|line| !line.is_empty() && line != needle)
}

/// Extract configuration items from one document
pub fn extract_configurations(doc: &KnowledgeDocument) -> Vec<ConfigurationItem> {
    let content = &doc.content;
    let mut items = Vec::new();

    let env_vars: BTreeSet<&str> = ENV_VAR_RE.find_iter(content).map(|m| m.as_str()).collect();
    for var in env_vars {
        items.push(ConfigurationItem {
            config_type: ConfigType::EnvVar,
            name: var.to_string(),
            description: context_line(content, var)
                .unwrap_or_else(|| format!("Environment variable {}", var)),
            location: ".env.local".to_string(),
            known_issues: strings(&[
                "fehlt", "falsch", "ungültig", "nicht gesetzt", "undefined", "missing", "invalid",
            ]),
            fix_strategies: vec![
                format!("Check {} in .env.local", var),
                format!("Make sure {} is set correctly", var),
            ],
        });
    }

    let endpoints: BTreeSet<&str> = API_RE
        .find_iter(content)
        .map(|m| m.as_str().trim_end_matches('/'))
        .collect();
    for endpoint in endpoints {
        items.push(ConfigurationItem {
            config_type: ConfigType::ApiEndpoint,
            name: endpoint.to_string(),
            description: context_line(content, endpoint)
                .unwrap_or_else(|| format!("API endpoint {}", endpoint)),
            location: format!("app{}/route.ts", endpoint),
            known_issues: strings(&[
                "fehler", "500", "404", "funktioniert nicht", "schiefgelaufen", "error", "failed",
                "nicht erreichbar",
            ]),
            fix_strategies: vec![
                format!("Check the {} route handler", endpoint),
                "Validate request and response".to_string(),
                "Check error handling".to_string(),
            ],
        });
    }

    if DB_RE.is_match(content) {
        items.push(ConfigurationItem {
            config_type: ConfigType::DatabaseSetting,
            name: "Database RLS/Policy".to_string(),
            description: "Database row level security or policy".to_string(),
            location: "supabase/migrations".to_string(),
            known_issues: strings(&[
                "zugriff verweigert", "permission denied", "nicht autorisiert", "rls fehler",
                "access denied", "unauthorized",
            ]),
            fix_strategies: strings(&["Check RLS policies", "Validate user permissions"]),
        });
    }

    let frontend_files: BTreeSet<&str> = FRONTEND_FILE_RE
        .find_iter(content)
        .map(|m| m.as_str())
        .filter(|f| !f.starts_with("app/api/"))
        .collect();
    let pdf_files: BTreeSet<&str> = PDF_FILE_RE.find_iter(content).map(|m| m.as_str()).collect();

    for file in &frontend_files {
        if pdf_files.contains(file) {
            continue;
        }
        items.push(ConfigurationItem {
            config_type: ConfigType::FrontendConfig,
            name: file.to_string(),
            description: format!("Frontend component or configuration {}", file),
            location: file.to_string(),
            known_issues: strings(&[
                "fehler", "rendert nicht", "hydration", "build fehler", "funktioniert nicht",
            ]),
            fix_strategies: vec![
                format!("Check {} for syntax errors", file),
                "Validate props and state".to_string(),
            ],
        });
    }

    for file in pdf_files {
        if file.starts_with("app/api/") {
            continue;
        }
        items.push(ConfigurationItem {
            config_type: ConfigType::FrontendConfig,
            name: file.to_string(),
            description: format!("PDF processing configuration {}", file),
            location: file.to_string(),
            known_issues: strings(&[
                "worker nicht gefunden", "module not found", "upload fehlgeschlagen",
                "parsing fehler", "pdf upload", "pdf hochladen",
            ]),
            fix_strategies: vec![
                format!("Check {} for worker path references", file),
                "Validate the pdf-parse dependency".to_string(),
            ],
        });
    }

    if DEPLOY_RE.is_match(content) {
        items.push(ConfigurationItem {
            config_type: ConfigType::DeploymentConfig,
            name: "Deployment configuration".to_string(),
            description: "Deployment and server configuration".to_string(),
            location: "ecosystem.config.js".to_string(),
            known_issues: strings(&[
                "startet nicht", "crash", "port belegt", "permission denied",
                "deployment fehlgeschlagen", "reagiert nicht", "läuft nicht", "hängt",
                "bot reagiert nicht", "pm2 restart", "not responding",
            ]),
            fix_strategies: strings(&[
                "Check PM2 status",
                "Check deployment logs",
                "Restart the PM2 process",
            ]),
        });
    }

    items
}

/// All configuration items known from the corpus
#[derive(Debug, Clone, Default)]
pub struct ConfigurationIndex {
    items: Vec<ConfigurationItem>,
}

impl ConfigurationIndex {
    /// Build the index, deduplicating items by `(type, name)`
    pub fn build(documents: &[KnowledgeDocument]) -> Self {
        let mut seen = BTreeSet::new();
        let mut items = Vec::new();
        for doc in documents {
            for item in extract_configurations(doc) {
                if seen.insert((item.config_type, item.name.clone())) {
                    items.push(item);
                }
            }
        }
        Self { items }
    }

    pub fn from_items(items: Vec<ConfigurationItem>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[ConfigurationItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn find(&self, config_type: ConfigType, name: &str) -> Option<&ConfigurationItem> {
        self.items
            .iter()
            .find(|i| i.config_type == config_type && i.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(content: &str) -> KnowledgeDocument {
        KnowledgeDocument {
            id: "docs/test.md".into(),
            title: "Test".into(),
            path: "docs/test.md".into(),
            content: content.into(),
        }
    }

    #[test]
    fn test_extracts_env_vars_with_context() {
        let items = extract_configurations(&doc(
            "- STRIPE_SECRET_KEY: secret key for checkout\n- GROQ_API_KEY enables plans",
        ));
        let stripe = items.iter().find(|i| i.name == "STRIPE_SECRET_KEY").unwrap();
        assert_eq!(stripe.config_type, ConfigType::EnvVar);
        assert_eq!(stripe.location, ".env.local");
        assert!(stripe.description.contains("secret key"));
        assert!(items.iter().any(|i| i.name == "GROQ_API_KEY"));
    }

    #[test]
    fn test_extracts_api_endpoints_with_route_location() {
        let items = extract_configurations(&doc("Upload goes to /api/knowledge/upload for PDFs"));
        let api = items
            .iter()
            .find(|i| i.config_type == ConfigType::ApiEndpoint)
            .unwrap();
        assert_eq!(api.name, "/api/knowledge/upload");
        assert_eq!(api.location, "app/api/knowledge/upload/route.ts");
    }

    #[test]
    fn test_extracts_database_and_deployment_items() {
        let items = extract_configurations(&doc(
            "RLS policy on profiles.\nDeployed with pm2 behind caddy.",
        ));
        assert!(items.iter().any(|i| i.config_type == ConfigType::DatabaseSetting));
        assert!(items.iter().any(|i| i.config_type == ConfigType::DeploymentConfig));
    }

    #[test]
    fn test_pdf_files_are_not_duplicated_as_plain_frontend_items() {
        let items = extract_configurations(&doc(
            "Parsing lives in lib/pdf/parsePdf.ts and the page is app/[locale]/page.tsx",
        ));
        let pdf: Vec<_> = items.iter().filter(|i| i.name == "lib/pdf/parsePdf.ts").collect();
        assert_eq!(pdf.len(), 1);
        assert!(pdf[0].description.starts_with("PDF processing"));
        assert!(items.iter().any(|i| i.name == "app/[locale]/page.tsx"));
    }

    #[test]
    fn test_index_dedups_across_documents() {
        let docs = vec![doc("STRIPE_SECRET_KEY"), doc("STRIPE_SECRET_KEY again")];
        let index = ConfigurationIndex::build(&docs);
        assert_eq!(index.len(), 1);
        assert!(index.find(ConfigType::EnvVar, "STRIPE_SECRET_KEY").is_some());
    }

    #[test]
    fn test_pattern_id_roundtrip() {
        let item = ConfigurationItem {
            config_type: ConfigType::ApiEndpoint,
            name: "/api/knowledge/upload".into(),
            description: String::new(),
            location: String::new(),
            known_issues: vec![],
            fix_strategies: vec![],
        };
        let id = item.pattern_id();
        assert_eq!(id, "config-api_endpoint-/api/knowledge/upload");
        assert_eq!(
            parse_config_pattern_id(&id),
            Some((ConfigType::ApiEndpoint, "/api/knowledge/upload"))
        );
        assert_eq!(parse_config_pattern_id("missing-translation"), None);
    }

    #[test]
    fn test_title_from_markdown() {
        assert_eq!(KnowledgeDocument::title_from_markdown("intro\n## Setup Guide\n", "x"), "Setup Guide");
        assert_eq!(KnowledgeDocument::title_from_markdown("no heading", "file.md"), "file.md");
    }
}
