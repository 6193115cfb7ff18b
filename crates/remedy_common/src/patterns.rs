//! Pattern matching - deterministic signatures first, then scoring.
//!
//! Pass 1 walks an ordered signature table; the first hit wins and the
//! scoring passes never run. Pass 2 scores every configuration item from
//! the corpus (keyword pass, then semantic pass) and turns the best item
//! into a candidate with pattern id `config-<type>-<name>`.

use crate::config_index::{ConfigType, ConfigurationIndex, ConfigurationItem};
use crate::plan::{ActionKind, ResolutionAction};
use crate::semantic::{MatchKind, ScoredMatch, SemanticMatcher};
use crate::ticket::Ticket;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

/// Locale whose message file is the source of truth
pub const DEFAULT_LOCALE: &str = "de";

/// Locales shipped in `messages/*.json`
pub const LOCALES: &[&str] = &["de", "en", "fr", "sw"];

/// Process restarted after every frontend fix
pub const APP_PROCESS: &str = "whatsapp-bot-builder";

/// Services that run under PM2 on the host
const PM2_PROCESSES: &[&str] = &[APP_PROCESS, "support-mcp-server"];

const ROLLOUT: &[&str] = &["`npm run build`", "`pm2 restart whatsapp-bot-builder --update-env`"];

// ============================================================================
// Auto-fix instructions
// ============================================================================

/// How a missing locale file is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneStrategy {
    /// Copy the base locale verbatim
    #[default]
    Copy,
    /// Write an empty JSON object
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationAction {
    Replace,
    Remove,
    Add,
}

/// One edit inside a `code-modify` instruction.
///
/// `search` is a regex source string so the instruction stays serializable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeModification {
    pub action: ModificationAction,
    pub search: String,
    #[serde(default)]
    pub replace: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub before: Option<String>,
    pub description: String,
}

/// Typed fix step produced by a pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AutoFixInstruction {
    I18nAddKey {
        key: String,
        translations: BTreeMap<String, String>,
    },
    CloneLocaleFile {
        locale: String,
        #[serde(default = "default_base_locale")]
        base_locale: String,
        #[serde(default)]
        strategy: CloneStrategy,
    },
    EnvAddPlaceholder {
        key: String,
        value: String,
        #[serde(default)]
        comment: Option<String>,
        #[serde(default = "default_env_file")]
        file: String,
    },
    CodeModify {
        file: String,
        modifications: Vec<CodeModification>,
    },
    CreateFile {
        file: String,
        content: String,
        description: String,
    },
    #[serde(alias = "hetzner-command")]
    RemoteCommand { command: String, description: String },
}

fn default_base_locale() -> String {
    DEFAULT_LOCALE.to_string()
}

fn default_env_file() -> String {
    ".env.local".to_string()
}

impl AutoFixInstruction {
    /// Stable name, also used as the approval `instruction_type`
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::I18nAddKey { .. } => "i18n-add-key",
            Self::CloneLocaleFile { .. } => "clone-locale-file",
            Self::EnvAddPlaceholder { .. } => "env-add-placeholder",
            Self::CodeModify { .. } => "code-modify",
            Self::CreateFile { .. } => "create-file",
            Self::RemoteCommand { .. } => "remote-command",
        }
    }

    /// High-risk instructions target the remote command executor and need approval
    pub fn is_high_risk(&self) -> bool {
        matches!(self, Self::RemoteCommand { .. })
    }

    /// Repository-relative files this instruction writes
    pub fn target_files(&self) -> Vec<String> {
        match self {
            Self::I18nAddKey { .. } => LOCALES
                .iter()
                .map(|l| format!("messages/{}.json", l))
                .collect(),
            Self::CloneLocaleFile { locale, .. } => vec![format!("messages/{}.json", locale)],
            Self::EnvAddPlaceholder { file, .. } => vec![file.clone()],
            Self::CodeModify { file, .. } | Self::CreateFile { file, .. } => vec![file.clone()],
            Self::RemoteCommand { .. } => Vec::new(),
        }
    }

    /// One-line description for approval notices and audit payloads
    pub fn describe(&self) -> String {
        match self {
            Self::I18nAddKey { key, .. } => format!("Add translation key {}", key),
            Self::CloneLocaleFile {
                locale,
                base_locale,
                ..
            } => format!("Create messages/{}.json from {}", locale, base_locale),
            Self::EnvAddPlaceholder { key, file, .. } => {
                format!("Add placeholder for {} to {}", key, file)
            }
            Self::CodeModify {
                file,
                modifications,
            } => format!("Apply {} modification(s) to {}", modifications.len(), file),
            Self::CreateFile { description, .. } | Self::RemoteCommand { description, .. } => {
                description.clone()
            }
        }
    }

    pub fn command(&self) -> Option<&str> {
        match self {
            Self::RemoteCommand { command, .. } => Some(command),
            _ => None,
        }
    }
}

// ============================================================================
// Pattern match
// ============================================================================

/// Customer-facing text in German and English
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalizedMessage {
    pub de: String,
    pub en: String,
}

impl LocalizedMessage {
    pub fn new(de: impl Into<String>, en: impl Into<String>) -> Self {
        Self {
            de: de.into(),
            en: en.into(),
        }
    }

    /// German for `de*` or missing locales, English otherwise
    pub fn for_locale(&self, locale: Option<&str>) -> &str {
        match locale {
            None => &self.de,
            Some(l) if l.is_empty() || l.to_lowercase().starts_with("de") => &self.de,
            Some(_) => &self.en,
        }
    }
}

/// Which pass produced the match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    Signature,
    Keyword,
    Semantic,
}

impl From<MatchKind> for MatchSource {
    fn from(kind: MatchKind) -> Self {
        match kind {
            MatchKind::Keyword => Self::Keyword,
            MatchKind::Semantic => Self::Semantic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub pattern_id: String,
    pub summary: String,
    pub actions: Vec<ResolutionAction>,
    #[serde(default)]
    pub instructions: Vec<AutoFixInstruction>,
    #[serde(default)]
    pub customer_message: Option<LocalizedMessage>,
    pub source: MatchSource,
    #[serde(default)]
    pub score: Option<f64>,
}

impl PatternMatch {
    pub fn has_instructions(&self) -> bool {
        !self.instructions.is_empty()
    }

    pub fn requires_approval(&self) -> bool {
        self.instructions.iter().any(AutoFixInstruction::is_high_risk)
    }

    /// `fix_name` of the first autopatch plan action
    pub fn fix_name(&self) -> Option<&str> {
        self.actions
            .iter()
            .find(|a| a.kind == ActionKind::AutopatchPlan)
            .and_then(|a| a.payload.get("fix_name"))
            .and_then(|v| v.as_str())
    }
}

/// `prefix-<slug>`; the slug part is cut at 48 characters
pub fn slugify(input: &str, prefix: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;
    for c in input.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    let slug: String = slug.chars().take(48).collect();
    format!("{}-{}", prefix, slug)
}

struct PlanPayload<'a> {
    fix_name: String,
    goal: String,
    target_files: Vec<String>,
    steps: Vec<String>,
    validation: &'a [&'a str],
    rollout: &'a [&'a str],
}

impl PlanPayload<'_> {
    fn into_action(self, summary: &str) -> ResolutionAction {
        ResolutionAction::new(ActionKind::AutopatchPlan, summary).with_payload(json!({
            "fix_name": self.fix_name,
            "goal": self.goal,
            "target_files": self.target_files,
            "steps": self.steps,
            "validation": self.validation,
            "rollout": self.rollout,
        }))
    }
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn signature_match(
    pattern_id: &str,
    summary: String,
    payload: PlanPayload<'_>,
    instructions: Vec<AutoFixInstruction>,
    message: LocalizedMessage,
) -> PatternMatch {
    let action = payload.into_action(&summary);
    PatternMatch {
        pattern_id: pattern_id.to_string(),
        summary,
        actions: vec![action],
        instructions,
        customer_message: Some(message),
        source: MatchSource::Signature,
        score: None,
    }
}

// ============================================================================
// Deterministic signatures
// ============================================================================

static MISSING_MESSAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)MISSING_MESSAGE:\s*([A-Za-z0-9._-]+)").unwrap());
static NULL_ACCESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Cannot (?:read|set) (?:properties|property) of (?:undefined|null)").unwrap()
});
static REFERENCE_ERROR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)ReferenceError:\s+([A-Za-z0-9_$.]+)\s+is\s+not\s+defined").unwrap()
});
// Gateway codes only count next to HTTP/status wording or their reason phrase
static NETWORK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(Failed to fetch|NetworkError|net::ERR_FAILED|ECONNREFUSED|\b(?:HTTP(?:/\d(?:\.\d)?)?|status(?: code)?)\s*:?\s*50[24]\b|\b50[24]\s+(?:Bad Gateway|Gateway Time-?out))",
    )
    .unwrap()
});
static LOCALE_FILE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)messages/([a-z]{2}(?:-[a-z]{2})?)\.json['"]"#).unwrap()
});
static MISSING_ENV_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Missing(?: required)? environment variable[:\s]+([A-Z0-9_]+)").unwrap()
});
static UNDEFINED_ENV_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)process\.env\.([A-Z0-9_]+)\s+(?:is|was)\s+(?:undefined|not set)").unwrap()
});

type Detector = fn(&Ticket, &str) -> Option<PatternMatch>;

/// Signatures that may carry auto-fix instructions, in evaluation order
const CODE_SIGNATURES: &[(&str, Detector)] = &[
    ("missing-translation", missing_translation),
    ("type-error-null-guard", null_guard),
    ("reference-error-missing-import", missing_import),
    ("network-fetch-failed", network_fetch_failed),
    ("missing-locale-file", missing_locale_file),
    ("missing-env-variable", missing_env_variable),
];

fn missing_translation(_ticket: &Ticket, text: &str) -> Option<PatternMatch> {
    let key = MISSING_MESSAGE_RE.captures(text)?.get(1)?.as_str().to_string();
    let summary = format!("Autopatch: add translation entry \"{}\".", key);

    let translations: BTreeMap<String, String> = [
        ("de", "Text hinzufügen"),
        ("en", "Add text"),
        ("fr", "Ajouter du texte"),
        ("sw", "Ongeza maandishi"),
    ]
    .into_iter()
    .map(|(l, t)| (l.to_string(), t.to_string()))
    .collect();

    Some(signature_match(
        "missing-translation",
        summary,
        PlanPayload {
            fix_name: slugify(&key, "i18n"),
            goal: format!("Add the missing i18n key \"{}\" to every message file.", key),
            target_files: LOCALES.iter().map(|l| format!("messages/{}.json", l)).collect(),
            steps: vec![
                format!("Add \"{}\" with proper translations to every messages/*.json.", key),
                "QA: reload the affected page and check no MISSING_MESSAGE hint remains."
                    .to_string(),
            ],
            validation: &["`npm run lint`", "Manual QA of the affected form."],
            rollout: ROLLOUT,
        },
        vec![AutoFixInstruction::I18nAddKey { key, translations }],
        LocalizedMessage::new(
            "Danke für den Hinweis! Wir haben umgehend einen Fix vorbereitet, der den fehlenden \
             Text im Eingabeformular ergänzt. Sobald das Update live ist, melden wir uns erneut.",
            "Thanks for letting us know! We prepared a fix that adds the missing text to the \
             form. We will get back to you once the update is live.",
        ),
    ))
}

fn null_guard(_ticket: &Ticket, text: &str) -> Option<PatternMatch> {
    if !NULL_ACCESS_RE.is_match(text) {
        return None;
    }
    Some(signature_match(
        "type-error-null-guard",
        "Autopatch: add null-safety checks to the affected component.".to_string(),
        PlanPayload {
            fix_name: slugify("null-guard", "frontend"),
            goal: "Avoid null and undefined access in the affected component.".to_string(),
            target_files: owned(&["<FILE_FROM_STACKTRACE>"]),
            steps: owned(&[
                "Read the stack trace in the browser console or logs and locate file and line.",
                "Add null/undefined checks (optional chaining or fallback values).",
                "Replay the reproduction path from the ticket and confirm the error is gone.",
            ]),
            validation: &[
                "`npm run lint`",
                "`npm run test` (if available)",
                "Manual QA along the reproduction path.",
            ],
            rollout: ROLLOUT,
        },
        Vec::new(),
        LocalizedMessage::new(
            "Danke für das Feedback! Wir haben eine Null-Safety-Anpassung vorbereitet, damit der \
             Fehler nicht mehr auftritt. Nach dem Rollout erhältst du ein Update.",
            "Thanks for the feedback! We prepared a null-safety change so the error no longer \
             occurs. You will get an update after the rollout.",
        ),
    ))
}

fn missing_import(_ticket: &Ticket, text: &str) -> Option<PatternMatch> {
    let identifier = REFERENCE_ERROR_RE.captures(text)?.get(1)?.as_str().to_string();
    Some(signature_match(
        "reference-error-missing-import",
        format!("Autopatch: fix missing reference \"{}\".", identifier),
        PlanPayload {
            fix_name: slugify(&identifier, "missing-import"),
            goal: format!("Import or initialise \"{}\" correctly.", identifier),
            target_files: owned(&["<FILE_FROM_STACKTRACE>"]),
            steps: vec![
                "Read the stack trace and locate the file and line missing the reference."
                    .to_string(),
                format!("Add the import or definition for \"{}\".", identifier),
                "QA: call the feature again and confirm no ReferenceError remains.".to_string(),
            ],
            validation: &["`npm run lint`", "Manual QA of the reproduced flow."],
            rollout: ROLLOUT,
        },
        Vec::new(),
        LocalizedMessage::new(
            "Danke für die Meldung! Wir haben den fehlenden Import/Definition vorbereitet. Nach \
             dem Deployment informieren wir dich erneut.",
            "Thanks for the report! We prepared the missing import or definition and will \
             update you after the deployment.",
        ),
    ))
}

fn network_fetch_failed(_ticket: &Ticket, text: &str) -> Option<PatternMatch> {
    if !NETWORK_RE.is_match(text) {
        return None;
    }
    Some(signature_match(
        "network-fetch-failed",
        "Autopatch: harden network and API availability.".to_string(),
        PlanPayload {
            fix_name: slugify("api-availability", "network"),
            goal: "Stabilise API endpoints or handle their failures better.".to_string(),
            target_files: owned(&["lib/api", "app/api/*"]),
            steps: owned(&[
                "Check API status in monitoring (status pages, logs).",
                "Add fallback/retry logic to the affected fetch calls.",
                "Verify CORS and proxy configuration (Caddy/Next.js).",
                "Improve timeouts and the error UI.",
            ]),
            validation: &[
                "Monitoring: check successful requests after deployment.",
                "Manual QA: replay the affected flow.",
            ],
            rollout: ROLLOUT,
        },
        Vec::new(),
        LocalizedMessage::new(
            "Danke für den Hinweis! Wir haben die Netzwerk-/API-Überwachung aktiviert und einen \
             Fix vorbereitet. Sobald das stabil läuft, bekommst du ein Update.",
            "Thank you! We initiated an automatic fix to stabilize the network/API call and \
             will update you once it is deployed.",
        ),
    ))
}

fn missing_locale_file(_ticket: &Ticket, text: &str) -> Option<PatternMatch> {
    let locale = LOCALE_FILE_RE.captures(text)?.get(1)?.as_str().to_lowercase();
    if locale == DEFAULT_LOCALE {
        return None;
    }
    Some(signature_match(
        "missing-locale-file",
        format!("Autopatch: create locale file for \"{}\".", locale),
        PlanPayload {
            fix_name: slugify(&locale, "missing-locale"),
            goal: format!("Create a fallback message file for locale \"{}\".", locale),
            target_files: vec![format!("messages/{}.json", locale)],
            steps: vec![
                format!("Copy the default locale ({}) to \"{}\".", DEFAULT_LOCALE, locale),
                "Make sure every key is present.".to_string(),
                "QA: test the locale in the frontend (language switch, UI labels).".to_string(),
            ],
            validation: &["`npm run lint`", "`npm run build`", "Manual QA: switch language."],
            rollout: ROLLOUT,
        },
        vec![AutoFixInstruction::CloneLocaleFile {
            locale,
            base_locale: DEFAULT_LOCALE.to_string(),
            strategy: CloneStrategy::Copy,
        }],
        LocalizedMessage::new(
            "Wir haben eine Standard-Übersetzungsdatei für die gewünschte Sprache angelegt und \
             deployen den Fix. Bitte nach dem Rollout erneut testen.",
            "We created a default translation file for the requested language and are \
             deploying the fix. Please test again after the rollout.",
        ),
    ))
}

fn missing_env_variable(_ticket: &Ticket, text: &str) -> Option<PatternMatch> {
    let captures = MISSING_ENV_RE
        .captures(text)
        .or_else(|| UNDEFINED_ENV_RE.captures(text))?;
    let key = captures.get(1)?.as_str().to_string();
    Some(signature_match(
        "missing-env-variable",
        format!("Autopatch: add environment variable \"{}\".", key),
        PlanPayload {
            fix_name: slugify(&key, "missing-env"),
            goal: format!("Make sure \"{}\" is set in the server configuration.", key),
            target_files: owned(&[".env.local"]),
            steps: vec![
                format!("Add a placeholder for {} to .env.local.", key),
                "Look up the correct value in the documentation and fill it in.".to_string(),
                "Reload the PM2 environment (`pm2 restart whatsapp-bot-builder --update-env`)."
                    .to_string(),
            ],
            validation: &["`npm run build`", "Test the API/checkout flow again."],
            rollout: &[
                "Update `.env.local`",
                "`pm2 restart whatsapp-bot-builder --update-env`",
            ],
        },
        vec![AutoFixInstruction::EnvAddPlaceholder {
            value: format!("FIXME_{}", key),
            comment: Some(format!("# TODO: replace {} with a valid value.", key)),
            file: default_env_file(),
            key,
        }],
        LocalizedMessage::new(
            "Wir haben einen Platzhalter für die fehlende Systemvariable gesetzt. Bitte trage \
             danach den finalen Wert ein und gib uns kurz Bescheid, damit wir deployen können.",
            "We added a placeholder for the missing system variable. Please fill in the final \
             value and let us know so we can deploy.",
        ),
    ))
}

/// Product-specific signatures that only produce a plan
struct PlanOnlySignature {
    id: &'static str,
    trigger: &'static str,
    /// Skip when this also matches (a more specific signature owns the text)
    unless: Option<&'static str>,
    fix_prefix: &'static str,
    fix_slug: &'static str,
    summary: &'static str,
    goal: &'static str,
    target_files: &'static [&'static str],
    steps: &'static [&'static str],
    validation: &'static [&'static str],
    rollout: &'static [&'static str],
    message_de: &'static str,
    message_en: &'static str,
}

const PLAN_ONLY_SIGNATURES: &[PlanOnlySignature] = &[
    PlanOnlySignature {
        id: "whatsapp-link-button-issue",
        trigger: r"(?i)(whatsapp.*link|test.*seite|button.*öffnet|öffnet.*falsch)",
        unless: None,
        fix_prefix: "frontend",
        fix_slug: "whatsapp-link-button-fix",
        summary: "Autopatch: fix WhatsApp link and test page button URLs.",
        goal: "Correct the button URLs in EmbedCodeGenerator.tsx; WhatsApp link and test page are swapped.",
        target_files: &["components/widget/EmbedCodeGenerator.tsx"],
        steps: &[
            "Check the onClick handlers of both buttons",
            "Make sure embedUrl is generated with /de/widget/embed?botId=",
            "The test page button must open /test-widget.html?bot-id=",
            "Turn <a> into <button> where needed",
        ],
        validation: &["Manual QA: test both buttons", "Check the browser console for errors"],
        rollout: ROLLOUT,
        message_de: "Danke für den Hinweis! Wir haben einen Fix vorbereitet, der die Button-URLs korrigiert. Sobald das Update live ist, funktionieren beide Buttons korrekt.",
        message_en: "Thanks for letting us know! We prepared a fix for the button URLs. Once the update is live both buttons will work correctly.",
    },
    PlanOnlySignature {
        id: "realtime-quota-exceeded",
        trigger: r"(?i)(realtime.*quota|realtime.*message.*count|realtime.*deaktiviert|polling.*statt)",
        unless: None,
        fix_prefix: "frontend",
        fix_slug: "realtime-optimization",
        summary: "Autopatch: enable realtime only for the active ticket.",
        goal: "Subscribe to realtime for the active ticket only, not for all tickets at once.",
        target_files: &[
            "app/[locale]/support/messages/SupportMessagesClient.tsx",
            "lib/supabaseFactory.ts",
        ],
        steps: &[
            "Subscribe only when a ticket is selected",
            "Limit the channel to the current ticket's messages",
            "Remove the channel on cleanup",
            "Keep polling as fallback (every 8 seconds)",
        ],
        validation: &["Check the realtime message count", "Manual QA: ticket updates"],
        rollout: ROLLOUT,
        message_de: "Wir optimieren die Realtime-Nutzung, damit Updates schneller ankommen und die Quota nicht überschritten wird. Das Update wird in Kürze ausgerollt.",
        message_en: "We are optimising realtime usage so updates arrive faster without exceeding the quota. The update will roll out shortly.",
    },
    PlanOnlySignature {
        id: "pdf-content-not-recognized",
        trigger: r"(?i)(pdf.*wird.*nicht.*erkannt|pdf.*inhalt|llm.*erkennt.*pdf|rag.*playground.*pdf)",
        unless: None,
        fix_prefix: "api",
        fix_slug: "pdf-embedding-fix",
        summary: "Autopatch: improve PDF processing and embedding generation.",
        goal: "PDF content is processed correctly and embeddings are generated.",
        target_files: &[
            "app/api/knowledge/upload/route.ts",
            "app/api/knowledge/embeddings/route.ts",
            "app/api/knowledge/chat/route.ts",
        ],
        steps: &[
            "Check the embedding API endpoint",
            "Make sure chunkText cannot loop forever",
            "Generate embeddings right after PDF processing",
            "Fall back to hash-based embeddings when the API fails",
        ],
        validation: &["Upload a PDF and test", "Test RAG chat with PDF content"],
        rollout: ROLLOUT,
        message_de: "Wir haben einen Fix vorbereitet, der die PDF-Verarbeitung verbessert. Nach dem Update sollten PDF-Inhalte korrekt erkannt werden.",
        message_en: "We prepared a fix that improves PDF processing. After the update PDF content should be recognised correctly.",
    },
    PlanOnlySignature {
        id: "bot-builder-load-error",
        trigger: r"(?i)(bot.*builder.*lädt.*nicht|bot.*bearbeiten.*fehler|flow.*daten.*fehlen|botbuilder.*error)",
        unless: None,
        fix_prefix: "frontend",
        fix_slug: "bot-builder-load-fix",
        summary: "Autopatch: bot builder does not load flow data.",
        goal: "The bot builder loads the initial flow and sets botId on every node.",
        target_files: &["components/bot-builder/BotBuilder.tsx"],
        steps: &[
            "Check initial flow loading in useEffect",
            "Make sure botId is set on every node",
            "Check for hydration mismatches",
            "Test auto-save",
        ],
        validation: &["Create and edit a bot", "Save and reload a flow"],
        rollout: ROLLOUT,
        message_de: "Wir haben einen Fix vorbereitet, der das Laden der Bot-Daten verbessert. Nach dem Update sollte der Bot-Builder korrekt funktionieren.",
        message_en: "We prepared a fix that improves loading of bot data. After the update the bot builder should work correctly.",
    },
    PlanOnlySignature {
        id: "analytics-data-missing",
        trigger: r"(?i)(analytics.*daten.*fehlen|analytics.*zeigt.*nichts|conversations.*undefined|messages.*undefined|csv.*export.*fehler)",
        unless: None,
        fix_prefix: "frontend",
        fix_slug: "analytics-data-fix",
        summary: "Autopatch: analytics data is not loaded or displayed.",
        goal: "Analytics data is loaded and displayed correctly.",
        target_files: &[
            "app/[locale]/bots/[id]/analytics/page.tsx",
            "components/analytics/AnalyticsDashboard.tsx",
        ],
        steps: &[
            "Check the analytics, conversations and messages queries",
            "Make sure variables are defined before use",
            "Handle missing data",
            "Add empty states",
        ],
        validation: &["Open the analytics page", "Test CSV export"],
        rollout: ROLLOUT,
        message_de: "Wir haben einen Fix vorbereitet, der die Analytics-Daten korrekt lädt und anzeigt. Nach dem Update sollten alle Statistiken sichtbar sein.",
        message_en: "We prepared a fix that loads and displays analytics data correctly. After the update all statistics should be visible.",
    },
    PlanOnlySignature {
        id: "pdf-worker-module-not-found",
        trigger: r"(?i)(pdf.*worker.*module|worker.*module.*not.*found|cannot.*find.*module.*pdf|pdf\.worker\.mjs|pdf\.worker\.js|worker.*nicht.*gefunden|pdf.*upload.*fehlgeschlagen.*worker|pdf.*upload.*nicht.*möglich|pdf.*auf.*hauptseite.*upload|pdf.*hochladen.*fehler|pdf.*wird.*nicht.*hochgeladen|pdf.*upload.*funktioniert.*nicht)",
        unless: None,
        fix_prefix: "api",
        fix_slug: "pdf-worker-module-fix",
        summary: "Autopatch: PDF worker module not found, fix the pdf-parse worker path.",
        goal: "Configure the pdf-parse worker correctly.",
        target_files: &[
            "lib/pdf/parsePdf.ts",
            "app/api/knowledge/upload/route.ts",
            "package.json",
        ],
        steps: &[
            "Check that pdf-parse is listed in package.json",
            "Remove explicit worker path references from parsePdf.ts",
            "Let pdf-parse load its worker itself",
            "Add the worker path to the build configuration if needed",
            "Test PDF upload after the fix",
        ],
        validation: &[
            "Upload a PDF",
            "Check the browser console for worker errors",
            "Test RAG chat with PDF content",
        ],
        rollout: &[
            "`npm install`",
            "`npm run build`",
            "`pm2 restart whatsapp-bot-builder --update-env`",
        ],
        message_de: "Wir haben das PDF Worker-Modul-Problem erkannt und einen Fix vorbereitet. Nach dem Update sollte der PDF-Upload wieder funktionieren.",
        message_en: "We identified the PDF worker module problem and prepared a fix. After the update PDF upload should work again.",
    },
    PlanOnlySignature {
        id: "knowledge-upload-failed",
        trigger: r"(?i)(wissensquelle.*upload.*fehlgeschlagen|pdf.*upload.*fehler|pdf.*hochladen.*(fehler|schiefgelaufen|fehlgeschlagen)|knowledge.*source.*error|embedding.*generierung.*fehler|etwas.*ist.*schiefgelaufen.*pdf|fehler.*aufgetreten.*pdf|wissensquelle.*fehler|pdf.*wird.*nicht.*hochgeladen)",
        unless: Some(r"(?i)(pdf.*worker|worker.*module|cannot.*find.*module.*pdf)"),
        fix_prefix: "api",
        fix_slug: "knowledge-upload-fix",
        summary: "Autopatch: knowledge source upload or embedding generation failed.",
        goal: "Knowledge source upload and embedding generation work correctly.",
        target_files: &[
            "app/api/knowledge/upload/route.ts",
            "app/api/knowledge/embeddings/route.ts",
            "components/knowledge/KnowledgeManagement.tsx",
        ],
        steps: &[
            "Check PDF processing (chunkText, parsePdfBuffer)",
            "Check the embeddings API and its fallback",
            "Make sure status updates are written",
            "Poll only sources still processing",
        ],
        validation: &["Upload a PDF", "Check the status", "Test RAG chat"],
        rollout: ROLLOUT,
        message_de: "Wir haben einen Fix vorbereitet, der den Upload und die Verarbeitung von Wissensquellen verbessert. Nach dem Update sollten PDFs und andere Quellen korrekt verarbeitet werden.",
        message_en: "We prepared a fix that improves upload and processing of knowledge sources. After the update PDFs and other sources should be processed correctly.",
    },
    PlanOnlySignature {
        id: "embed-code-invalid",
        trigger: r"(?i)(embed.*code.*falsch|widget.*url.*fehler|bot.*einbinden.*funktioniert.*nicht|widget.*script.*lädt.*nicht)",
        unless: None,
        fix_prefix: "frontend",
        fix_slug: "embed-code-fix",
        summary: "Autopatch: embed code generates wrong URLs or the widget does not load.",
        goal: "The embed code generates correct URLs and the widget loads.",
        target_files: &[
            "components/widget/EmbedCodeGenerator.tsx",
            "app/[locale]/widget/embed/page.tsx",
            "public/widget.js",
        ],
        steps: &[
            "Check URL generation (embedUrl, widgetUrl)",
            "Check the WhatsApp link and test page buttons",
            "Check widget.js for CORS problems",
            "Test every code sample",
        ],
        validation: &["Generate embed code", "Test links", "Test the widget"],
        rollout: ROLLOUT,
        message_de: "Wir haben einen Fix vorbereitet, der die Embed-Code-Generierung korrigiert. Nach dem Update sollten alle Links und Code-Beispiele korrekt funktionieren.",
        message_en: "We prepared a fix for embed code generation. After the update all links and code samples should work correctly.",
    },
    PlanOnlySignature {
        id: "bot-settings-save-failed",
        trigger: r"(?i)(bot.*einstellungen.*speichern.*fehler|whatsapp.*setup.*fehlgeschlagen|bot.*status.*toggle.*fehler|settings.*save.*error)",
        unless: None,
        fix_prefix: "frontend",
        fix_slug: "bot-settings-fix",
        summary: "Autopatch: bot settings are not saved or WhatsApp setup failed.",
        goal: "Bot settings are saved and WhatsApp setup works.",
        target_files: &[
            "components/bots/BotDetail.tsx",
            "components/bots/WhatsAppSetupWizard.tsx",
        ],
        steps: &[
            "Check the bot status toggle",
            "Check the WhatsApp setup wizard",
            "Use optimistic updates",
            "Improve error handling",
        ],
        validation: &["Toggle the status", "Run the WhatsApp setup"],
        rollout: ROLLOUT,
        message_de: "Wir haben einen Fix vorbereitet, der das Speichern der Bot-Einstellungen verbessert. Nach dem Update sollten alle Änderungen korrekt gespeichert werden.",
        message_en: "We prepared a fix that improves saving bot settings. After the update all changes should be saved correctly.",
    },
];

static PLAN_ONLY_REGEXES: Lazy<Vec<(Regex, Option<Regex>)>> = Lazy::new(|| {
    PLAN_ONLY_SIGNATURES
        .iter()
        .map(|s| {
            (
                Regex::new(s.trigger).unwrap(),
                s.unless.map(|u| Regex::new(u).unwrap()),
            )
        })
        .collect()
});

impl PlanOnlySignature {
    fn to_match(&self) -> PatternMatch {
        signature_match(
            self.id,
            self.summary.to_string(),
            PlanPayload {
                fix_name: slugify(self.fix_slug, self.fix_prefix),
                goal: self.goal.to_string(),
                target_files: owned(self.target_files),
                steps: owned(self.steps),
                validation: self.validation,
                rollout: self.rollout,
            },
            Vec::new(),
            LocalizedMessage::new(self.message_de, self.message_en),
        )
    }
}

/// Ids of every deterministic signature, in evaluation order
pub fn signature_ids() -> Vec<&'static str> {
    CODE_SIGNATURES
        .iter()
        .map(|(id, _)| *id)
        .chain(PLAN_ONLY_SIGNATURES.iter().map(|s| s.id))
        .collect()
}

/// First deterministic signature matching the ticket
pub fn match_signature(ticket: &Ticket) -> Option<PatternMatch> {
    let text = ticket.combined_text();
    if text.is_empty() {
        return None;
    }

    for (_, detect) in CODE_SIGNATURES {
        if let Some(found) = detect(ticket, &text) {
            return Some(found);
        }
    }

    for (signature, (trigger, unless)) in PLAN_ONLY_SIGNATURES.iter().zip(PLAN_ONLY_REGEXES.iter()) {
        if !trigger.is_match(&text) {
            continue;
        }
        if unless.as_ref().is_some_and(|u| u.is_match(&text)) {
            continue;
        }
        return Some(signature.to_match());
    }

    None
}

// ============================================================================
// Configuration candidates
// ============================================================================

static SERVICE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(whatsapp-bot-builder|support-mcp-server|n8n|mcp-afrika-container)").unwrap()
});
static PM2_TROUBLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:pm2|bot|whatsapp).*?(?:reagiert nicht|läuft nicht|hängt|restart|neu starten|startet nicht|not responding)").unwrap()
});
static DOCKER_TROUBLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:docker|container).*?(?:reagiert nicht|läuft nicht|hängt|restart|neu starten)")
        .unwrap()
});
static CADDY_TROUBLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:caddy|reverse.*proxy|webserver).*?(?:reagiert nicht|läuft nicht|reload|neu laden)")
        .unwrap()
});
static SYSTEMD_TROUBLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:systemctl|systemd|service).*?(?:reagiert nicht|läuft nicht|restart|neu starten)")
        .unwrap()
});
static GENERIC_TROUBLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:reagiert nicht|läuft nicht|hängt|startet nicht)").unwrap());
static ENV_TROUBLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:env|environment|variable).*?(?:fehlt|falsch|ungültig|missing|invalid)").unwrap()
});

/// Service named in the ticket, normalised to a known process name
fn service_from_text(text: &str) -> &'static str {
    let Some(found) = SERVICE_RE.find(text) else {
        return APP_PROCESS;
    };
    let found = found.as_str().to_lowercase();
    if found.contains("support") {
        "support-mcp-server"
    } else if found.contains("afrika") {
        "mcp-afrika-container"
    } else if found.contains("n8n") {
        "n8n"
    } else {
        APP_PROCESS
    }
}

/// PM2 restart for processes PM2 manages, container restart otherwise
fn restart_instruction(service: &'static str, reason: &str) -> AutoFixInstruction {
    if PM2_PROCESSES.contains(&service) {
        AutoFixInstruction::RemoteCommand {
            command: format!("pm2 restart {}", service),
            description: format!("Restart PM2 process \"{}\", {}", service, reason),
        }
    } else {
        AutoFixInstruction::RemoteCommand {
            command: format!("docker restart {}", service),
            description: format!("Restart docker container \"{}\", {}", service, reason),
        }
    }
}

fn push_unique(out: &mut Vec<AutoFixInstruction>, instruction: AutoFixInstruction) {
    if !out.iter().any(|i| i.command() == instruction.command()) {
        out.push(instruction);
    }
}

/// Remote commands implied by a deployment-related ticket
pub fn deployment_instructions(text: &str) -> Vec<AutoFixInstruction> {
    let service = service_from_text(text);
    let mut out = Vec::new();

    if PM2_TROUBLE_RE.is_match(text) {
        push_unique(&mut out, restart_instruction(service, "service stopped responding"));
    }
    if DOCKER_TROUBLE_RE.is_match(text) {
        let container = match service {
            "n8n" | "mcp-afrika-container" => service,
            _ => APP_PROCESS,
        };
        push_unique(
            &mut out,
            AutoFixInstruction::RemoteCommand {
                command: format!("docker restart {}", container),
                description: format!("Restart docker container \"{}\"", container),
            },
        );
    }
    if CADDY_TROUBLE_RE.is_match(text) {
        out.push(AutoFixInstruction::RemoteCommand {
            command: "caddy reload".to_string(),
            description: "Reload the Caddy reverse proxy".to_string(),
        });
    }
    if SYSTEMD_TROUBLE_RE.is_match(text) {
        let unit = if service == "n8n" { "n8n" } else { "caddy" };
        out.push(AutoFixInstruction::RemoteCommand {
            command: format!("systemctl restart {}", unit),
            description: format!("Restart systemd service \"{}\"", unit),
        });
    }
    if out.is_empty() && GENERIC_TROUBLE_RE.is_match(text) {
        out.push(restart_instruction(service, "service problem detected"));
    }
    out
}

fn api_route_template(endpoint: &str, description: &str) -> String {
    format!(
        "import {{ NextResponse }} from 'next/server';\n\n\
         // {}\n\
         export async function GET() {{\n  \
           return NextResponse.json({{ ok: true, endpoint: '{}' }});\n\
         }}\n",
        description, endpoint
    )
}

fn pdf_worker_modifications(file: &str) -> AutoFixInstruction {
    let removal = |search: &str, what: &str| CodeModification {
        action: ModificationAction::Remove,
        search: search.to_string(),
        replace: None,
        after: None,
        before: None,
        description: format!("Remove explicit {} references", what),
    };
    AutoFixInstruction::CodeModify {
        file: file.to_string(),
        modifications: vec![
            removal(r#"(?:import|require|from).*pdf\.worker[^'"]*"#, "pdf worker path"),
            removal(r#"(?:import|require|from).*worker\.mjs[^'"]*"#, "worker.mjs"),
            removal(r#"(?:import|require|from).*worker\.js[^'"]*"#, "worker.js"),
        ],
    }
}

/// Instructions for a matched configuration item, derived from the ticket text
fn config_instructions(item: &ConfigurationItem, text: &str) -> Vec<AutoFixInstruction> {
    let lower = text.to_lowercase();
    match item.config_type {
        ConfigType::EnvVar if ENV_TROUBLE_RE.is_match(&lower) => {
            vec![AutoFixInstruction::EnvAddPlaceholder {
                key: item.name.clone(),
                value: format!("FIXME_{}", item.name),
                comment: Some(format!("# {}", item.description)),
                file: default_env_file(),
            }]
        }
        ConfigType::ApiEndpoint => vec![AutoFixInstruction::CreateFile {
            file: item.location.clone(),
            content: api_route_template(&item.name, &item.description),
            description: format!("Create missing API route {}", item.name),
        }],
        ConfigType::FrontendConfig
            if lower.contains("pdf")
                && (lower.contains("upload") || lower.contains("worker"))
                && item.name.to_lowercase().contains("pdf") =>
        {
            vec![pdf_worker_modifications(&item.location)]
        }
        ConfigType::DeploymentConfig => deployment_instructions(&lower),
        _ => Vec::new(),
    }
}

/// Candidate for a configuration item that won a scoring pass
pub fn config_candidate(scored: &ScoredMatch<'_>, ticket: &Ticket) -> PatternMatch {
    let item = scored.config;
    let text = ticket.combined_text();
    let issue = if scored.matched_keywords.is_empty() {
        "no explicit keywords".to_string()
    } else {
        scored.matched_keywords.join(", ")
    };

    let mut steps = vec![
        format!("Problem: {}", issue),
        format!("Check {} in {}", item.name, item.location),
        "Correct the configuration as documented".to_string(),
    ];
    steps.extend(item.fix_strategies.iter().map(|s| format!("- {}", s)));

    let summary = format!("Autopatch: correct {} configuration", item.name);
    let action = ResolutionAction::new(
        ActionKind::AutopatchPlan,
        format!("Correct {} configuration", item.name),
    )
    .with_payload(json!({
        "fix_name": format!("fix-{}", item.name),
        "goal": format!("Correct {}", item.description),
        "target_files": [item.location],
        "steps": steps,
        "validation": [format!("{} works correctly", item.name)],
        "rollout": ROLLOUT,
        "possible_errors": item.known_issues,
    }));

    PatternMatch {
        pattern_id: item.pattern_id(),
        summary,
        actions: vec![action],
        instructions: config_instructions(item, &text),
        customer_message: Some(LocalizedMessage::new(
            "Ich habe das Problem erkannt und behebe es jetzt automatisch.",
            "I have identified the problem and am fixing it automatically now.",
        )),
        source: scored.kind.into(),
        score: Some(scored.score),
    }
}

// ============================================================================
// Matcher
// ============================================================================

/// Thresholds of the scoring passes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchSettings {
    /// Minimum semantic score (0..=20) for the semantic pass
    #[serde(default = "default_semantic_threshold")]
    pub semantic_threshold: f64,
    /// Keyword scores must be strictly greater than this
    #[serde(default)]
    pub keyword_minimum: f64,
}

fn default_semantic_threshold() -> f64 {
    0.5
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            semantic_threshold: default_semantic_threshold(),
            keyword_minimum: 0.0,
        }
    }
}

/// Signature table plus scoring against the configuration index
#[derive(Debug, Clone, Default)]
pub struct PatternMatcher {
    index: ConfigurationIndex,
    scorer: SemanticMatcher,
    settings: MatchSettings,
}

impl PatternMatcher {
    pub fn new(index: ConfigurationIndex, settings: MatchSettings) -> Self {
        Self {
            index,
            scorer: SemanticMatcher::new(),
            settings,
        }
    }

    pub fn index(&self) -> &ConfigurationIndex {
        &self.index
    }

    /// Replace the index after a corpus reload
    pub fn set_index(&mut self, index: ConfigurationIndex) {
        self.index = index;
    }

    /// Signatures first, then keyword and semantic passes
    pub fn match_ticket(&self, ticket: &Ticket) -> Option<PatternMatch> {
        if let Some(found) = match_signature(ticket) {
            return Some(found);
        }

        let text = ticket.combined_text();
        if text.is_empty() || self.index.is_empty() {
            return None;
        }

        let keyword = self.scorer.keyword_matches(&text, self.index.items());
        if let Some(best) = keyword
            .first()
            .filter(|m| m.score > self.settings.keyword_minimum)
        {
            return Some(config_candidate(best, ticket));
        }

        let semantic = self.scorer.semantic_matches(&text, self.index.items());
        semantic
            .first()
            .filter(|m| m.score >= self.settings.semantic_threshold)
            .map(|best| config_candidate(best, ticket))
    }
}
