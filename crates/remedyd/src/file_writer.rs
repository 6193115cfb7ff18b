//! File mutation: where source-level fixes land.
//!
//! The executor computes new file contents from the repository checkout and
//! hands them to a [`FileMutation`] backend: the remote file-writer worker
//! over HTTP, or [`LocalFileWriter`] when no worker is configured. Either
//! way a write only counts once it has been read back and compared.

use async_trait::async_trait;
use regex::Regex;
use remedy_common::error::RemedyError;
use remedy_common::patterns::{CloneStrategy, CodeModification, ModificationAction};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("file writer timed out after {0}s")]
    Timeout(u64),

    #[error("file writer HTTP error: {0}")]
    Http(String),

    #[error("file writer rejected the write: {0}")]
    Rejected(String),

    #[error("write to {0} could not be verified")]
    Unverified(String),
}

impl From<RemoteError> for RemedyError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Timeout(secs) => RemedyError::Timeout(secs * 1000),
            other => RemedyError::remote("file writer", other),
        }
    }
}

/// `{success, verified}` of a single write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub success: bool,
    #[serde(default)]
    pub verified: bool,
}

/// `{success, filesWritten}` of a translation batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct I18nOutcome {
    pub success: bool,
    pub files_written: usize,
    #[serde(default)]
    pub message: String,
}

/// One translation key to add in every locale it names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "i18n-add-key")]
pub struct I18nKey {
    pub key: String,
    pub translations: BTreeMap<String, String>,
}

#[async_trait]
pub trait FileMutation: Send + Sync {
    fn name(&self) -> &'static str;

    /// Write `content` to `path`; with `verify`, read it back and compare
    async fn write_file(&self, path: &Path, content: &str, verify: bool) -> Result<WriteOutcome, RemoteError>;

    /// Set each key in `<root>/messages/<locale>.json`
    async fn write_i18n(&self, repository_root: &Path, keys: &[I18nKey]) -> Result<I18nOutcome, RemoteError>;
}

/// Join a repository-relative path, refusing anything that escapes the root
pub fn resolve_in_root(root: &Path, relative: &str) -> Result<PathBuf, RemoteError> {
    let rel = Path::new(relative);
    let escapes = rel.is_absolute()
        || rel
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if escapes || relative.trim().is_empty() {
        return Err(RemoteError::Rejected(format!("path {} is outside the repository", relative)));
    }
    Ok(root.join(rel))
}

// ============================================================================
// Content transforms
// ============================================================================

/// Set a dotted key in a JSON object, creating intermediate objects
pub fn set_nested_key(root: &mut serde_json::Value, key: &str, value: &str) {
    let segments: Vec<&str> = key.split('.').collect();
    let mut current = root;
    for (i, segment) in segments.iter().enumerate() {
        if !current.is_object() {
            *current = serde_json::Value::Object(serde_json::Map::new());
        }
        let Some(map) = current.as_object_mut() else {
            return;
        };
        if i == segments.len() - 1 {
            map.insert(segment.to_string(), serde_json::Value::String(value.to_string()));
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    }
}

pub fn get_nested_key<'a>(root: &'a serde_json::Value, key: &str) -> Option<&'a serde_json::Value> {
    key.split('.').try_fold(root, |acc, segment| acc.get(segment))
}

/// Pretty JSON with a trailing newline, the layout of the locale files
pub fn render_json(value: &serde_json::Value) -> Result<String, RemedyError> {
    Ok(format!("{}\n", serde_json::to_string_pretty(value)?))
}

/// Content of a new locale file cloned from `base`
pub fn clone_locale_content(base: &str, strategy: CloneStrategy) -> String {
    match strategy {
        CloneStrategy::Copy => base.to_string(),
        CloneStrategy::Empty => match serde_json::from_str::<serde_json::Value>(base) {
            Ok(serde_json::Value::Object(map)) => {
                let emptied: serde_json::Map<String, serde_json::Value> = map
                    .keys()
                    .map(|k| (k.clone(), serde_json::Value::String(String::new())))
                    .collect();
                serde_json::to_string_pretty(&serde_json::Value::Object(emptied))
                    .map(|s| format!("{}\n", s))
                    .unwrap_or_else(|_| base.to_string())
            }
            _ => {
                warn!("[WRITER] Base locale is not a JSON object, copying instead");
                base.to_string()
            }
        },
    }
}

/// `None` when `key` is already defined
pub fn append_env_placeholder(content: &str, key: &str, value: &str, comment: Option<&str>) -> Option<String> {
    let prefix = format!("{}=", key);
    if content.lines().any(|l| l.trim().starts_with(&prefix)) {
        return None;
    }
    let mut out = content.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    if let Some(comment) = comment {
        out.push_str(comment);
        out.push('\n');
    }
    out.push_str(&prefix);
    out.push_str(value);
    out.push('\n');
    Some(out)
}

/// Apply `code-modify` edits in order
pub fn apply_modifications(content: &str, modifications: &[CodeModification]) -> Result<String, RemoteError> {
    let mut out = content.to_string();
    for m in modifications {
        debug!("[WRITER] {:?}: {}", m.action, m.description);
        match m.action {
            ModificationAction::Replace => {
                let re = compile(&m.search)?;
                let replacement = m.replace.as_deref().unwrap_or("");
                out = re.replace_all(&out, replacement).into_owned();
            }
            ModificationAction::Remove => {
                let re = compile(&m.search)?;
                out = re.replace_all(&out, "").into_owned();
            }
            ModificationAction::Add => {
                let addition = m.replace.as_deref().unwrap_or("");
                if let Some(anchor) = m.after.as_deref().filter(|a| out.contains(a)) {
                    out = out.replacen(anchor, &format!("{}\n{}", anchor, addition), 1);
                } else if let Some(anchor) = m.before.as_deref().filter(|a| out.contains(a)) {
                    out = out.replacen(anchor, &format!("{}\n{}", addition, anchor), 1);
                } else {
                    if !out.ends_with('\n') && !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(addition);
                    out.push('\n');
                }
            }
        }
    }
    Ok(out)
}

fn compile(pattern: &str) -> Result<Regex, RemoteError> {
    Regex::new(pattern).map_err(|e| RemoteError::Rejected(format!("invalid search pattern: {}", e)))
}

fn digest(content: &[u8]) -> [u8; 32] {
    Sha256::digest(content).into()
}

// ============================================================================
// In-process writer
// ============================================================================

/// Writes straight to the local checkout
#[derive(Debug, Default, Clone)]
pub struct LocalFileWriter;

impl LocalFileWriter {
    async fn write_verified(path: &Path, content: &str) -> Result<bool, RemoteError> {
        tokio::fs::write(path, content)
            .await
            .map_err(|e| RemoteError::Rejected(format!("{}: {}", path.display(), e)))?;
        let written = tokio::fs::read(path)
            .await
            .map_err(|e| RemoteError::Rejected(format!("{}: {}", path.display(), e)))?;
        Ok(digest(&written) == digest(content.as_bytes()))
    }

    async fn write_locale(file: &Path, entry: &I18nKey, value: &str) -> Result<bool, String> {
        let raw = tokio::fs::read_to_string(file)
            .await
            .map_err(|e| format!("{}: {}", file.display(), e))?;
        let mut json: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| format!("{}: {}", file.display(), e))?;

        if get_nested_key(&json, &entry.key).and_then(|v| v.as_str()) == Some(value) {
            return Ok(false);
        }
        set_nested_key(&mut json, &entry.key, value);
        let rendered = render_json(&json).map_err(|e| e.to_string())?;
        tokio::fs::write(file, rendered)
            .await
            .map_err(|e| format!("{}: {}", file.display(), e))?;

        let check = tokio::fs::read_to_string(file)
            .await
            .map_err(|e| format!("{}: {}", file.display(), e))?;
        let check: serde_json::Value =
            serde_json::from_str(&check).map_err(|e| format!("{}: {}", file.display(), e))?;
        if get_nested_key(&check, &entry.key).and_then(|v| v.as_str()) != Some(value) {
            return Err(format!("{}: value for {} did not persist", file.display(), entry.key));
        }
        Ok(true)
    }
}

#[async_trait]
impl FileMutation for LocalFileWriter {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn write_file(&self, path: &Path, content: &str, verify: bool) -> Result<WriteOutcome, RemoteError> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| RemoteError::Rejected(format!("{}: {}", dir.display(), e)))?;
        }
        let matches = Self::write_verified(path, content).await?;
        if verify && !matches {
            return Err(RemoteError::Unverified(path.display().to_string()));
        }
        info!("[WRITER] Wrote {} ({} bytes)", path.display(), content.len());
        Ok(WriteOutcome {
            success: true,
            verified: verify && matches,
        })
    }

    async fn write_i18n(&self, repository_root: &Path, keys: &[I18nKey]) -> Result<I18nOutcome, RemoteError> {
        let mut files_written = 0;
        let mut errors = Vec::new();

        for entry in keys {
            for (locale, value) in &entry.translations {
                let file = repository_root.join("messages").join(format!("{}.json", locale));
                match Self::write_locale(&file, entry, value).await {
                    Ok(true) => files_written += 1,
                    Ok(false) => debug!("[WRITER] {} already has {}", file.display(), entry.key),
                    Err(e) => errors.push(e),
                }
            }
        }

        if errors.is_empty() {
            info!("[WRITER] Translation batch wrote {} file(s)", files_written);
            Ok(I18nOutcome {
                success: true,
                files_written,
                message: format!("{} file(s) written", files_written),
            })
        } else {
            warn!("[WRITER] Translation batch failed for {} file(s)", errors.len());
            Ok(I18nOutcome {
                success: false,
                files_written,
                message: errors.join("; "),
            })
        }
    }
}

// ============================================================================
// Remote worker
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WriteFileRequest<'a> {
    file_path: String,
    content: &'a str,
    verify: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WriteI18nRequest<'a> {
    repository_root: String,
    instructions: &'a [I18nKey],
}

#[derive(Deserialize)]
struct WorkerReply {
    success: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    verified: bool,
    #[serde(default, rename = "filesWritten")]
    files_written: usize,
}

/// Client of the file-writer worker (`/write-file`, `/write-i18n`)
pub struct HttpFileWriter {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpFileWriter {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    async fn post<B: Serialize + Sync>(&self, route: &str, body: &B) -> Result<WorkerReply, RemoteError> {
        let url = format!("{}{}", self.base_url, route);
        let response = self.client.post(&url).json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                RemoteError::Timeout(self.timeout.as_secs())
            } else {
                RemoteError::Http(e.to_string())
            }
        })?;
        let status = response.status();
        match response.json::<WorkerReply>().await {
            Ok(reply) => Ok(reply),
            Err(_) if !status.is_success() => Err(RemoteError::Http(format!("{} returned {}", route, status))),
            Err(e) => Err(RemoteError::Http(format!("{}: invalid reply: {}", route, e))),
        }
    }
}

#[async_trait]
impl FileMutation for HttpFileWriter {
    fn name(&self) -> &'static str {
        "worker"
    }

    async fn write_file(&self, path: &Path, content: &str, verify: bool) -> Result<WriteOutcome, RemoteError> {
        let body = WriteFileRequest {
            file_path: path.display().to_string(),
            content,
            verify,
        };
        let reply = self.post("/write-file", &body).await?;
        if !reply.success {
            return Err(RemoteError::Rejected(reply.message));
        }
        if verify && !reply.verified {
            return Err(RemoteError::Unverified(path.display().to_string()));
        }
        Ok(WriteOutcome {
            success: true,
            verified: reply.verified,
        })
    }

    async fn write_i18n(&self, repository_root: &Path, keys: &[I18nKey]) -> Result<I18nOutcome, RemoteError> {
        let body = WriteI18nRequest {
            repository_root: repository_root.display().to_string(),
            instructions: keys,
        };
        let reply = self.post("/write-i18n", &body).await?;
        Ok(I18nOutcome {
            success: reply.success,
            files_written: reply.files_written,
            message: reply.message,
        })
    }
}
