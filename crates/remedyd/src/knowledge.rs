//! Knowledge base: markdown documents plus one store-backed source.
//!
//! Documents feed two consumers: the configuration index the matcher
//! scores against, and prompt context for the plan generator.

use crate::config::KnowledgeConfig;
use crate::store::TicketStore;
use remedy_common::config_index::{ConfigurationIndex, KnowledgeDocument};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Only the head of each document is scored during retrieval
const SCORED_PREFIX_CHARS: usize = 4000;

#[derive(Debug, Clone, Default)]
pub struct KnowledgeBase {
    documents: Vec<KnowledgeDocument>,
}

impl KnowledgeBase {
    pub fn from_documents(documents: Vec<KnowledgeDocument>) -> Self {
        Self { documents }
    }

    /// Load markdown files from every root, then the first non-empty store source
    pub async fn load(config: &KnowledgeConfig, store: &dyn TicketStore) -> Self {
        let started = Instant::now();

        let mut paths = BTreeSet::new();
        for root in &config.document_roots {
            paths.extend(markdown_files(root));
        }
        let mut documents: Vec<KnowledgeDocument> =
            paths.iter().filter_map(|p| read_document(p)).collect();
        let from_files = documents.len();

        let mut from_store = 0;
        for source in &config.store_sources {
            match store.load_documents(source).await {
                Ok(docs) if !docs.is_empty() => {
                    from_store = docs.len();
                    info!("[KNOWLEDGE] {} documents from store source {}", from_store, source);
                    documents.extend(docs.into_iter().filter(|d| !d.content.is_empty()));
                    break;
                }
                Ok(_) => debug!("[KNOWLEDGE] Store source {} is empty", source),
                Err(e) => warn!("[KNOWLEDGE] Store source {} failed: {}", source, e),
            }
        }

        info!(
            "[KNOWLEDGE] Loaded {} documents ({} files, {} from store) in {} ms",
            documents.len(),
            from_files,
            from_store,
            started.elapsed().as_millis()
        );
        Self { documents }
    }

    pub fn documents(&self) -> &[KnowledgeDocument] {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn index(&self) -> ConfigurationIndex {
        ConfigurationIndex::build(&self.documents)
    }

    /// Best `limit` documents by token overlap with `query`
    pub fn query(&self, query: &str, limit: usize) -> Vec<&KnowledgeDocument> {
        let normalized = query.to_lowercase();
        let mut scored: Vec<(usize, &KnowledgeDocument)> = self
            .documents
            .iter()
            .map(|doc| (score_document(doc, &normalized), doc))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().take(limit).map(|(_, doc)| doc).collect()
    }
}

fn markdown_files(root: &Path) -> Vec<PathBuf> {
    if !root.exists() {
        debug!("[KNOWLEDGE] Skipping missing root {}", root.display());
        return Vec::new();
    }
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().map(|ext| ext == "md").unwrap_or(false))
        .collect()
}

fn read_document(path: &Path) -> Option<KnowledgeDocument> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let fallback = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Some(KnowledgeDocument {
                id: path.to_string_lossy().into_owned(),
                title: KnowledgeDocument::title_from_markdown(&content, &fallback),
                path: path.to_string_lossy().into_owned(),
                content,
            })
        }
        Err(e) => {
            warn!("[KNOWLEDGE] Cannot read {}: {}", path.display(), e);
            None
        }
    }
}

fn score_document(doc: &KnowledgeDocument, query: &str) -> usize {
    let head: String = doc.content.chars().take(SCORED_PREFIX_CHARS).collect();
    let haystack = format!("{} {}", doc.title, head).to_lowercase();
    query
        .split_whitespace()
        .filter(|token| haystack.contains(token))
        .map(|token| token.chars().count())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tempfile::tempdir;

    fn doc(id: &str, title: &str, content: &str) -> KnowledgeDocument {
        KnowledgeDocument {
            id: id.into(),
            title: title.into(),
            path: id.into(),
            content: content.into(),
        }
    }

    #[tokio::test]
    async fn test_load_files_and_first_nonempty_source() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("env.md"), "# Environment\nNEXT_PUBLIC_APP_URL").unwrap();
        std::fs::write(dir.path().join("nested/upload.md"), "# Upload\nPDF upload").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = MemoryStore::new();
        store
            .insert_document("second", &doc("s-1", "From store", "realtime quota"))
            .await
            .unwrap();
        store
            .insert_document("third", &doc("s-2", "Never loaded", "x"))
            .await
            .unwrap();

        let config = KnowledgeConfig {
            document_roots: vec![dir.path().to_path_buf(), dir.path().join("missing")],
            store_sources: vec!["first".into(), "second".into(), "third".into()],
        };
        let kb = KnowledgeBase::load(&config, &store).await;
        assert_eq!(kb.len(), 3);
        assert!(kb.documents().iter().any(|d| d.title == "Environment"));
        assert!(!kb.documents().iter().any(|d| d.id == "s-2"));
    }

    #[test]
    fn test_query_ranks_by_token_overlap() {
        let kb = KnowledgeBase::from_documents(vec![
            doc("a", "Upload", "pdf upload worker module"),
            doc("b", "Billing", "invoices"),
            doc("c", "Widget", "upload button"),
        ]);
        let hits = kb.query("PDF upload", 5);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert!(kb.query("nothing relevant", 5).is_empty());
    }
}
