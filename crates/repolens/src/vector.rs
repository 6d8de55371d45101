//! Vector store interface and a deterministic in-memory implementation.
//!
//! The embedding model and similarity algorithm belong to the store. The
//! in-memory store ranks by lexical distance (1 - Jaccard similarity of the
//! lowercase word sets) so the retrieval pipeline runs without an external
//! index.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;
use tracing::debug;

/// Boxed future returned by [`VectorStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// What a stored document holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Summary,
    Chunk,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Repository-relative path of the source file.
    pub path: String,
    pub kind: DocumentKind,
    /// Position of a chunk within its file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub text: String,
    pub metadata: DocumentMetadata,
}

impl Document {
    pub fn summary(path: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: DocumentMetadata {
                path: path.into(),
                kind: DocumentKind::Summary,
                chunk_index: None,
            },
        }
    }

    pub fn chunk(path: impl Into<String>, index: usize, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: DocumentMetadata {
                path: path.into(),
                kind: DocumentKind::Chunk,
                chunk_index: Some(index),
            },
        }
    }

    /// Stable id: `summary:<path>` or `chunk:<path>:<index>`.
    pub fn default_id(&self) -> String {
        match (self.metadata.kind, self.metadata.chunk_index) {
            (DocumentKind::Summary, _) => format!("summary:{}", self.metadata.path),
            (DocumentKind::Chunk, Some(i)) => format!("chunk:{}:{i}", self.metadata.path),
            (DocumentKind::Chunk, None) => format!("chunk:{}", self.metadata.path),
        }
    }
}

/// A store of documents ranked by distance to a query text.
pub trait VectorStore: Send + Sync {
    /// Add (or replace by id) documents. `documents` and `ids` must have the
    /// same length.
    fn add(&self, documents: Vec<Document>, ids: Vec<String>) -> StoreFuture<'_, ()>;

    /// Up to `k` documents ranked by ascending distance.
    fn query<'a>(&'a self, text: &'a str, k: usize) -> StoreFuture<'a, Vec<(Document, f32)>>;

    /// Remove every document.
    fn clear(&self) -> StoreFuture<'_, ()>;

    /// Number of stored documents.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── In-memory store ────────────────────────────────────────────────

struct Entry {
    id: String,
    document: Document,
    words: BTreeSet<String>,
}

/// Documents in insertion order with lexical ranking.
#[derive(Default)]
pub struct InMemoryVectorStore {
    entries: RwLock<Vec<Entry>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from persisted `(id, document)` pairs.
    pub fn from_documents(documents: Vec<(String, Document)>) -> Self {
        let store = Self::new();
        store.insert_all(documents);
        store
    }

    fn insert_all(&self, documents: Vec<(String, Document)>) {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        for (id, document) in documents {
            let words = word_set(&document.text);
            let entry = Entry {
                id,
                document,
                words,
            };
            match entries.iter_mut().find(|e| e.id == entry.id) {
                Some(existing) => *existing = entry,
                None => entries.push(entry),
            }
        }
    }
}

impl VectorStore for InMemoryVectorStore {
    fn add(&self, documents: Vec<Document>, ids: Vec<String>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            if documents.len() != ids.len() {
                return Err(Error::InvalidInput(format!(
                    "{} documents but {} ids",
                    documents.len(),
                    ids.len()
                )));
            }
            debug!("Adding {} documents to the in-memory store", documents.len());
            self.insert_all(ids.into_iter().zip(documents).collect());
            Ok(())
        })
    }

    fn query<'a>(&'a self, text: &'a str, k: usize) -> StoreFuture<'a, Vec<(Document, f32)>> {
        Box::pin(async move {
            let query_words = word_set(text);
            let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
            let mut ranked: Vec<(Document, f32)> = entries
                .iter()
                .map(|e| (e.document.clone(), lexical_distance(&query_words, &e.words)))
                .collect();
            // Stable: equal distances keep insertion order.
            ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
            ranked.truncate(k);
            Ok(ranked)
        })
    }

    fn clear(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.entries
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .clear();
            Ok(())
        })
    }

    fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }
}

fn word_set(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn lexical_distance(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 1.0;
    }
    let shared = a.intersection(b).count();
    1.0 - shared as f32 / union as f32
}
