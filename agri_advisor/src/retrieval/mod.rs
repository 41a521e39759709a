//! Knowledge retrieval over named document collections.
//!
//! Each collection is an independent partition of embedded documents. Queries
//! run per collection; [`KnowledgeRetriever::retrieve`] merges several
//! collections into one ranked pool and renders it as prompt context.

pub mod embedding;
mod ingest;

pub use embedding::{cosine, CachedEmbedder, Embedder, HashEmbedder, HttpEmbedder};

use dashmap::DashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::RetrievalError;
use crate::settings::SettingsHandle;

/// A passage stored in a collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeDocument {
    pub id: String,
    pub collection: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl KnowledgeDocument {
    /// Label used for `[Source: ...]` attribution.
    pub fn source_label(&self) -> &str {
        self.metadata
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or(&self.collection)
    }

    /// Short title from the first descriptive metadata field.
    pub fn title(&self) -> Option<&str> {
        ["name", "title", "crop", "category", "commodity"]
            .iter()
            .find_map(|key| self.metadata.get(*key).and_then(Value::as_str))
    }
}

/// Input for ingestion. Documents without an id get a fresh one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewDocument {
    pub id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl NewDocument {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), ..Default::default() }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredDocument {
    pub document: KnowledgeDocument,
    pub score: f32,
}

/// Rendered context plus the passages it was built from.
#[derive(Debug, Clone, Default)]
pub struct RetrievedContext {
    pub text: String,
    /// Collections that contributed, in rank order, without repeats.
    pub sources: Vec<String>,
    pub passages: Vec<ScoredDocument>,
}

impl RetrievedContext {
    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CollectionStats {
    pub name: String,
    pub documents: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDocument {
    document: KnowledgeDocument,
    embedding: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    dimension: usize,
    collections: BTreeMap<String, Vec<StoredDocument>>,
}

type Collection = BTreeMap<String, StoredDocument>;

#[derive(Debug)]
pub struct KnowledgeRetriever {
    embedder: Arc<dyn Embedder>,
    settings: SettingsHandle,
    collections: DashMap<String, Collection>,
}

impl KnowledgeRetriever {
    /// Create a retriever with every configured collection present and empty.
    pub fn new(settings: SettingsHandle, embedder: Arc<dyn Embedder>) -> Self {
        let collections = DashMap::new();
        for name in settings.read(|s| s.retrieval.collections.clone()) {
            collections.insert(name, Collection::new());
        }
        Self { embedder, settings, collections }
    }

    /// Collection names, sorted.
    pub fn list_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    pub fn delete_collection(&self, name: &str) -> Result<(), RetrievalError> {
        match self.collections.remove(name) {
            Some((_, docs)) => {
                info!(collection = name, documents = docs.len(), "Deleted collection");
                Ok(())
            }
            None => Err(RetrievalError::CollectionNotFound(name.to_string())),
        }
    }

    pub fn document_count(&self, name: &str) -> Result<usize, RetrievalError> {
        self.collections
            .get(name)
            .map(|c| c.len())
            .ok_or_else(|| RetrievalError::CollectionNotFound(name.to_string()))
    }

    pub fn collection_stats(&self) -> Vec<CollectionStats> {
        let mut stats: Vec<CollectionStats> = self
            .collections
            .iter()
            .map(|e| CollectionStats { name: e.key().clone(), documents: e.value().len() })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Embed and upsert documents, creating the collection if needed.
    ///
    /// The batch is validated and embedded before anything is written, so a
    /// malformed document leaves the collection untouched.
    #[instrument(skip(self, documents), fields(count = documents.len()))]
    pub async fn add_documents(
        &self,
        collection: &str,
        documents: Vec<NewDocument>,
    ) -> Result<Vec<String>, RetrievalError> {
        validate_collection_name(collection)?;
        if let Some(index) = documents.iter().position(|d| d.text.trim().is_empty()) {
            return Err(RetrievalError::Ingestion(format!(
                "document {index} for '{collection}' has no text"
            )));
        }

        let embeddings = futures::future::try_join_all(
            documents.iter().map(|d| self.embedder.embed(&d.text)),
        )
        .await
        .map_err(|e| RetrievalError::Ingestion(format!("failed to embed document: {e}")))?;

        let dimension = self.embedder.dimension();
        if let Some(bad) = embeddings.iter().find(|e| e.len() != dimension) {
            return Err(RetrievalError::Ingestion(format!(
                "embedding dimension mismatch: expected {dimension}, got {}",
                bad.len()
            )));
        }

        let mut ids = Vec::with_capacity(documents.len());
        let mut target = self.collections.entry(collection.to_string()).or_default();
        for (doc, embedding) in documents.into_iter().zip(embeddings) {
            let id = doc.id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let document = KnowledgeDocument {
                id: id.clone(),
                collection: collection.to_string(),
                text: doc.text,
                metadata: doc.metadata,
            };
            target.insert(id.clone(), StoredDocument { document, embedding });
            ids.push(id);
        }
        debug!(collection, total = target.len(), "Documents added");
        Ok(ids)
    }

    pub async fn add_text(
        &self,
        collection: &str,
        text: &str,
        metadata: Map<String, Value>,
    ) -> Result<String, RetrievalError> {
        let doc = NewDocument { id: None, text: text.to_string(), metadata };
        let mut ids = self.add_documents(collection, vec![doc]).await?;
        ids.pop()
            .ok_or_else(|| RetrievalError::Ingestion("no document stored".into()))
    }

    /// Rank one collection against `query_text`.
    #[instrument(skip(self), level = "debug")]
    pub async fn query(
        &self,
        collection: &str,
        query_text: &str,
        k: usize,
    ) -> Result<Vec<ScoredDocument>, RetrievalError> {
        let empty = self
            .collections
            .get(collection)
            .map(|c| c.is_empty())
            .ok_or_else(|| RetrievalError::CollectionNotFound(collection.to_string()))?;
        if empty || k == 0 || query_text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let query_embedding = self.embedder.embed(query_text).await?;

        let Some(docs) = self.collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<ScoredDocument> = docs
            .values()
            .collect::<Vec<_>>()
            .par_iter()
            .map(|stored| ScoredDocument {
                document: stored.document.clone(),
                score: cosine(&query_embedding, &stored.embedding),
            })
            .collect();
        drop(docs);

        sort_by_score(&mut scored);
        scored.truncate(k);
        Ok(scored)
    }

    /// Formatted context over `collections` (all active when `None`).
    pub async fn get_relevant_context(
        &self,
        query_text: &str,
        collections: Option<&[String]>,
        k: usize,
    ) -> Result<String, RetrievalError> {
        Ok(self.retrieve(query_text, collections, k).await?.text)
    }

    /// Query each collection, keep the aggregate top `k` and render them.
    ///
    /// Explicitly named collections must exist. When `None`, the configured
    /// active collections are used and missing ones are skipped.
    #[instrument(skip(self, collections))]
    pub async fn retrieve(
        &self,
        query_text: &str,
        collections: Option<&[String]>,
        k: usize,
    ) -> Result<RetrievedContext, RetrievalError> {
        let (names, explicit) = match collections {
            Some(names) => (names.to_vec(), true),
            None => (self.settings.read(|s| s.retrieval.collections.clone()), false),
        };

        let mut pool = Vec::new();
        for name in &names {
            match self.query(name, query_text, k).await {
                Ok(hits) => pool.extend(hits),
                Err(RetrievalError::CollectionNotFound(missing)) if !explicit => {
                    warn!(collection = %missing, "Active collection is missing, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        sort_by_score(&mut pool);
        pool.truncate(k);

        let max_chars = self.settings.read(|s| s.retrieval.max_context_chars);
        Ok(render(pool, max_chars))
    }

    /// Write every collection with its embeddings as JSON.
    pub async fn save_snapshot(&self, path: &Path) -> Result<(), RetrievalError> {
        let collections: BTreeMap<String, Vec<StoredDocument>> = self
            .collections
            .iter()
            .map(|e| (e.key().clone(), e.value().values().cloned().collect()))
            .collect();
        let snapshot = Snapshot { dimension: self.embedder.dimension(), collections };
        let json = serde_json::to_vec(&snapshot)
            .map_err(|e| RetrievalError::Snapshot(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, json).await?;
        info!(path = %path.display(), "Knowledge snapshot saved");
        Ok(())
    }

    /// Replace the loaded collections with a snapshot. Returns the document count.
    pub async fn load_snapshot(&self, path: &Path) -> Result<usize, RetrievalError> {
        let bytes = tokio::fs::read(path).await?;
        let snapshot: Snapshot =
            serde_json::from_slice(&bytes).map_err(|e| RetrievalError::Snapshot(e.to_string()))?;
        if snapshot.dimension != self.embedder.dimension() {
            return Err(RetrievalError::Snapshot(format!(
                "snapshot dimension {} does not match embedder dimension {}",
                snapshot.dimension,
                self.embedder.dimension()
            )));
        }

        let mut total = 0;
        for (name, docs) in snapshot.collections {
            total += docs.len();
            let collection: Collection = docs
                .into_iter()
                .map(|stored| (stored.document.id.clone(), stored))
                .collect();
            self.collections.insert(name, collection);
        }
        info!(path = %path.display(), documents = total, "Knowledge snapshot loaded");
        Ok(total)
    }
}

fn validate_collection_name(name: &str) -> Result<(), RetrievalError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(RetrievalError::Ingestion(format!("invalid collection name '{name}'")))
    }
}

fn sort_by_score(docs: &mut [ScoredDocument]) {
    docs.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.document.collection.cmp(&b.document.collection))
            .then_with(|| a.document.id.cmp(&b.document.id))
    });
}

/// Render ranked passages as `[Source: label]` blocks within `max_chars`.
fn render(passages: Vec<ScoredDocument>, max_chars: usize) -> RetrievedContext {
    const SEPARATOR: &str = "\n\n---\n\n";

    let mut text = String::new();
    let mut kept = Vec::new();
    let mut sources: Vec<String> = Vec::new();

    for passage in passages {
        let block = format!("[Source: {}]\n{}", passage.document.source_label(), passage.document.text);
        let extra = if text.is_empty() { 0 } else { SEPARATOR.len() };
        let remaining = max_chars.saturating_sub(text.chars().count() + extra);

        if block.chars().count() > remaining {
            // Always keep at least a truncated first passage.
            if text.is_empty() && remaining > 0 {
                text = block.chars().take(remaining).collect();
            } else {
                break;
            }
        } else {
            if !text.is_empty() {
                text.push_str(SEPARATOR);
            }
            text.push_str(&block);
        }

        if !sources.contains(&passage.document.collection) {
            sources.push(passage.document.collection.clone());
        }
        kept.push(passage);
    }

    RetrievedContext { text, sources, passages: kept }
}
