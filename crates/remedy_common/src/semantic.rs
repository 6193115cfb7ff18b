//! Keyword and semantic scoring of configuration items against ticket text.
//!
//! Two scores per item:
//! - keyword score: unbounded, additive (direct mentions, synonyms,
//!   known-issue phrases, word overlap, shared context groups)
//! - semantic score: bounded to 0..=20 (context-group overlap ratio,
//!   type-keyword ratio, token-overlap ratio)

use crate::config_index::ConfigurationItem;
use serde::Serialize;
use std::collections::BTreeSet;

/// Semantic results at or below this score are never returned
pub const SEMANTIC_FLOOR: f64 = 0.3;

/// Upper bound of the semantic score
pub const SEMANTIC_MAX: f64 = 20.0;

const SYNONYMS: &[(&str, &[&str])] = &[
    ("upload", &["hochladen", "einreichen", "hinzufügen", "upload", "übertragen", "senden"]),
    ("pdf", &["pdf", "dokument", "datei", "pdf-datei"]),
    (
        "fehler",
        &["fehler", "error", "problem", "schiefgelaufen", "funktioniert nicht", "geht nicht"],
    ),
    (
        "nicht möglich",
        &["nicht möglich", "geht nicht", "funktioniert nicht", "fehlgeschlagen", "schiefgelaufen"],
    ),
    ("api", &["api", "endpoint", "route", "route-handler"]),
    ("endpoint", &["endpoint", "api", "route", "url"]),
    ("konfiguration", &["konfiguration", "config", "einstellung", "setting"]),
    ("umgebungsvariable", &["umgebungsvariable", "env", "environment variable", "env var"]),
    ("datenbank", &["datenbank", "database", "db", "supabase"]),
    ("zugriff", &["zugriff", "access", "permission", "berechtigung"]),
];

const CONTEXT_GROUPS: &[(&str, &[&str])] = &[
    ("pdf-upload", &["pdf", "upload", "hochladen", "datei", "dokument", "wissensquelle", "knowledge"]),
    ("api-error", &["api", "endpoint", "route", "fehler", "500", "404", "error"]),
    ("config-missing", &["konfiguration", "env", "variable", "fehlt", "nicht gesetzt", "undefined"]),
    ("database-access", &["datenbank", "zugriff", "rls", "policy", "permission", "verweigert"]),
];

/// Which pass produced a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Keyword,
    Semantic,
}

/// One scored configuration item
#[derive(Debug, Clone, Serialize)]
pub struct ScoredMatch<'a> {
    pub config: &'a ConfigurationItem,
    pub score: f64,
    pub kind: MatchKind,
    pub matched_keywords: Vec<String>,
}

/// Stateless scorer over lowercase ticket text
#[derive(Debug, Clone, Copy, Default)]
pub struct SemanticMatcher;

impl SemanticMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Items with keyword score > 0, best first
    pub fn keyword_matches<'a>(
        &self,
        text: &str,
        items: &'a [ConfigurationItem],
    ) -> Vec<ScoredMatch<'a>> {
        let text = text.to_lowercase();
        let mut results: Vec<_> = items
            .iter()
            .filter_map(|item| {
                let score = keyword_score(&text, item);
                (score > 0.0).then(|| ScoredMatch {
                    config: item,
                    score,
                    kind: MatchKind::Keyword,
                    matched_keywords: matched_keywords(&text, item),
                })
            })
            .collect();
        sort_desc(&mut results);
        results
    }

    /// Items with semantic score above [`SEMANTIC_FLOOR`], best first
    pub fn semantic_matches<'a>(
        &self,
        text: &str,
        items: &'a [ConfigurationItem],
    ) -> Vec<ScoredMatch<'a>> {
        let text = text.to_lowercase();
        let mut results: Vec<_> = items
            .iter()
            .filter_map(|item| {
                let score = semantic_score(&text, item);
                (score > SEMANTIC_FLOOR).then(|| ScoredMatch {
                    config: item,
                    score,
                    kind: MatchKind::Semantic,
                    matched_keywords: matched_keywords(&text, item),
                })
            })
            .collect();
        sort_desc(&mut results);
        results
    }
}

fn sort_desc(results: &mut [ScoredMatch<'_>]) {
    results.sort_by(|a, b| b.score.total_cmp(&a.score));
}

fn long_words(text: &str) -> BTreeSet<&str> {
    text.split_whitespace()
        .filter(|w| w.chars().count() > 3)
        .collect()
}

/// Keyword score of `item` against already-lowercased `text`
pub fn keyword_score(text: &str, item: &ConfigurationItem) -> f64 {
    let mut score = 0.0;
    let name = item.name.to_lowercase();
    let description = item.description.to_lowercase();

    if !name.is_empty() && text.contains(&name) {
        score += 10.0;
    }
    if !description.is_empty() && text.contains(&description) {
        score += 8.0;
    }

    for (key, synonyms) in SYNONYMS {
        if name.contains(key) || synonyms.iter().any(|s| name.contains(s)) {
            score += 5.0 * synonyms.iter().filter(|s| text.contains(*s)).count() as f64;
        }
    }

    for issue in &item.known_issues {
        let issue = issue.to_lowercase();
        if text.contains(&issue) {
            score += 4.0;
        }
        for (key, synonyms) in SYNONYMS {
            if issue.contains(key) {
                score += 2.0 * synonyms.iter().filter(|s| text.contains(*s)).count() as f64;
            }
        }
    }

    let config_text = item.match_text();
    let config_words = long_words(&config_text);
    let ticket_words = long_words(text);
    let common = config_words.intersection(&ticket_words).count();
    if common >= 2 {
        score += 3.0 * common as f64;
    }

    for (_, keywords) in CONTEXT_GROUPS {
        let hits = keywords.iter().filter(|k| text.contains(*k)).count();
        if hits >= 2 && keywords.iter().any(|k| config_text.contains(k)) {
            score += 2.0 * hits as f64;
        }
    }

    score
}

/// Semantic score of `item` against already-lowercased `text`, in 0..=20
pub fn semantic_score(text: &str, item: &ConfigurationItem) -> f64 {
    let mut score = 0.0;
    let config_text = item.match_text();

    for (_, keywords) in CONTEXT_GROUPS {
        let text_hits: Vec<&str> = keywords.iter().copied().filter(|k| text.contains(k)).collect();
        let config_hits: Vec<&str> = keywords
            .iter()
            .copied()
            .filter(|k| config_text.contains(k))
            .collect();
        if !text_hits.is_empty() && !config_hits.is_empty() {
            let common = text_hits.iter().filter(|k| config_hits.contains(k)).count();
            score += common as f64 / text_hits.len().max(config_hits.len()) as f64 * 10.0;
        }
    }

    let type_keywords = item.config_type.keywords();
    let type_hits = type_keywords.iter().filter(|k| text.contains(*k)).count();
    if type_hits > 0 {
        score += type_hits as f64 / type_keywords.len() as f64 * 5.0;
    }

    let description_text = format!("{} {}", item.description, item.name).to_lowercase();
    let config_words = long_words(&description_text);
    let ticket_words = long_words(text);
    let common = config_words.intersection(&ticket_words).count();
    if common > 0 {
        score += common as f64 / config_words.len().max(ticket_words.len()) as f64 * 8.0;
    }

    score.min(SEMANTIC_MAX)
}

/// Name, description words and known-issue phrases present in `text`
fn matched_keywords(text: &str, item: &ConfigurationItem) -> Vec<String> {
    let description = item.description.to_lowercase();
    let candidates = std::iter::once(item.name.to_lowercase())
        .chain(description.split_whitespace().map(str::to_string))
        .chain(item.known_issues.iter().map(|i| i.to_lowercase()));

    let mut seen = BTreeSet::new();
    candidates
        .filter(|k| k.chars().count() > 2 && text.contains(k.as_str()))
        .filter(|k| seen.insert(k.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_index::ConfigType;

    fn item(config_type: ConfigType, name: &str, description: &str, issues: &[&str]) -> ConfigurationItem {
        ConfigurationItem {
            config_type,
            name: name.into(),
            description: description.into(),
            location: String::new(),
            known_issues: issues.iter().map(|s| s.to_string()).collect(),
            fix_strategies: vec![],
        }
    }

    #[test]
    fn test_direct_name_mention_scores_ten_plus() {
        let env = item(ConfigType::EnvVar, "STRIPE_SECRET_KEY", "stripe key", &[]);
        let score = keyword_score("stripe_secret_key is wrong", &env);
        assert!(score >= 10.0);
    }

    #[test]
    fn test_known_issue_phrase_and_synonyms() {
        let upload = item(
            ConfigType::ApiEndpoint,
            "/api/knowledge/upload",
            "PDF upload endpoint",
            &["upload fehlgeschlagen"],
        );
        let text = "pdf upload fehlgeschlagen, die datei geht nicht";
        let score = keyword_score(text, &upload);
        // name contains "upload" -> upload synonyms hit "upload" (+5)
        // issue phrase present (+4), issue contains "upload" key (+2)
        assert!(score >= 11.0);
    }

    #[test]
    fn test_unrelated_text_scores_zero() {
        let env = item(ConfigType::EnvVar, "GROQ_API_KEY", "groq key", &["missing"]);
        let matcher = SemanticMatcher::new();
        assert!(matcher.keyword_matches("hello there", std::slice::from_ref(&env)).is_empty());
    }

    #[test]
    fn test_semantic_score_is_bounded() {
        let upload = item(
            ConfigType::ApiEndpoint,
            "pdf upload api endpoint route error",
            "pdf upload hochladen datei dokument knowledge api endpoint route fehler",
            &[],
        );
        let text = "pdf upload hochladen datei dokument knowledge api endpoint route fehler 500 404 error request url";
        let score = semantic_score(text, &upload);
        assert!(score <= SEMANTIC_MAX);
        assert!(score > 10.0);
    }

    #[test]
    fn test_semantic_matches_are_sorted_descending() {
        let items = vec![
            item(ConfigType::EnvVar, "SUPABASE_URL", "database url", &[]),
            item(ConfigType::ApiEndpoint, "/api/knowledge/upload", "pdf upload endpoint", &[]),
        ];
        let matches = SemanticMatcher::new()
            .semantic_matches("PDF upload über die api geht nicht", &items);
        assert!(!matches.is_empty());
        assert_eq!(matches[0].config.name, "/api/knowledge/upload");
        for pair in matches.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn test_matched_keywords_are_unique() {
        let upload = item(ConfigType::ApiEndpoint, "upload", "upload upload endpoint", &["upload"]);
        let keywords = matched_keywords("upload endpoint", &upload);
        assert_eq!(keywords, vec!["upload".to_string(), "endpoint".to_string()]);
    }
}
