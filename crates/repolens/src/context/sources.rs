//! Context source providers: where candidate blocks come from.
//!
//! Each provider turns one kind of project knowledge into measured
//! [`ContextBlock`]s for the current query. The assembler decides which of
//! them fit.

use super::block::{BlockKind, ContextBlock, ContextMode};
use super::tokens::TokenCounter;
use crate::Result;
use crate::repository::RepositoryProvider;
use crate::vector::{DocumentKind, VectorStore};
use futures::StreamExt;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Boxed future returned by [`ContextSourceProvider::blocks`].
pub type SourceFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<ContextBlock>>> + Send + 'a>>;

/// Files fetched concurrently by [`WholeFileSource`].
const FETCH_CONCURRENCY: usize = 8;

/// Produces candidate context blocks for a query.
pub trait ContextSourceProvider: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Candidate blocks for `query` in the given mode, measured with
    /// `counter`. Providers that do not apply to `mode` return nothing.
    fn blocks<'a>(
        &'a self,
        query: &'a str,
        mode: ContextMode,
        counter: &'a dyn TokenCounter,
    ) -> SourceFuture<'a>;
}

// ── Tree ───────────────────────────────────────────────────────────

/// The rendered project file tree, offered in every mode.
pub struct TreeSource {
    project: String,
    tree: String,
}

impl TreeSource {
    pub fn new(project: impl Into<String>, tree: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            tree: tree.into(),
        }
    }
}

impl ContextSourceProvider for TreeSource {
    fn name(&self) -> &str {
        "tree"
    }

    fn blocks<'a>(
        &'a self,
        _query: &'a str,
        mode: ContextMode,
        counter: &'a dyn TokenCounter,
    ) -> SourceFuture<'a> {
        Box::pin(async move {
            if self.tree.trim().is_empty() {
                return Ok(Vec::new());
            }
            let block =
                ContextBlock::measure(BlockKind::Tree, "", self.tree.as_str(), mode, counter)
                    .await?;
            debug!("Tree block for {}: {} tokens", self.project, block.token_count());
            Ok(vec![block])
        })
    }
}

// ── Summaries ──────────────────────────────────────────────────────

/// Every file summary, offered in whole-file mode. In retrieval mode
/// summaries arrive through [`RetrievalSource`] instead.
pub struct SummarySource {
    summaries: BTreeMap<String, String>,
}

impl SummarySource {
    pub fn new(summaries: BTreeMap<String, String>) -> Self {
        Self { summaries }
    }
}

impl ContextSourceProvider for SummarySource {
    fn name(&self) -> &str {
        "summaries"
    }

    fn blocks<'a>(
        &'a self,
        _query: &'a str,
        mode: ContextMode,
        counter: &'a dyn TokenCounter,
    ) -> SourceFuture<'a> {
        Box::pin(async move {
            if mode != ContextMode::WholeFile {
                return Ok(Vec::new());
            }
            let mut blocks = Vec::with_capacity(self.summaries.len());
            for (path, summary) in &self.summaries {
                blocks.push(
                    ContextBlock::measure(
                        BlockKind::Summary,
                        path.as_str(),
                        summary.as_str(),
                        mode,
                        counter,
                    )
                    .await?,
                );
            }
            Ok(blocks)
        })
    }
}

// ── Retrieval ──────────────────────────────────────────────────────

/// The `k` stored documents nearest to the query, offered in retrieval
/// mode. Results are ordered by ascending distance and deduplicated by text.
pub struct RetrievalSource {
    store: Arc<dyn VectorStore>,
    k: usize,
}

impl RetrievalSource {
    pub fn new(store: Arc<dyn VectorStore>, k: usize) -> Self {
        Self { store, k }
    }
}

impl ContextSourceProvider for RetrievalSource {
    fn name(&self) -> &str {
        "retrieval"
    }

    fn blocks<'a>(
        &'a self,
        query: &'a str,
        mode: ContextMode,
        counter: &'a dyn TokenCounter,
    ) -> SourceFuture<'a> {
        Box::pin(async move {
            if mode != ContextMode::Retrieval || self.store.is_empty() {
                return Ok(Vec::new());
            }
            let mut hits = self.store.query(query, self.k).await?;
            hits.sort_by(|a, b| a.1.total_cmp(&b.1));

            let mut seen = HashSet::new();
            let mut blocks = Vec::new();
            for (i, (doc, distance)) in hits.into_iter().enumerate() {
                debug!(
                    "{}. file='{}', kind={:?}, distance={distance:.4}",
                    i + 1,
                    doc.metadata.path,
                    doc.metadata.kind
                );
                if !seen.insert(doc.text.clone()) {
                    continue;
                }
                let kind = match doc.metadata.kind {
                    DocumentKind::Summary => BlockKind::Summary,
                    DocumentKind::Chunk => BlockKind::Chunk,
                };
                blocks.push(
                    ContextBlock::measure(kind, doc.metadata.path, doc.text, mode, counter).await?,
                );
            }
            Ok(blocks)
        })
    }
}

// ── Whole files ────────────────────────────────────────────────────

/// The full content of every analyzed file, offered in whole-file mode.
/// Contents are fetched once and cached.
pub struct WholeFileSource {
    repo: Arc<dyn RepositoryProvider>,
    reference: Option<String>,
    paths: Vec<String>,
    cache: Mutex<BTreeMap<String, String>>,
}

impl WholeFileSource {
    pub fn new(
        repo: Arc<dyn RepositoryProvider>,
        reference: Option<String>,
        paths: Vec<String>,
    ) -> Self {
        Self {
            repo,
            reference,
            paths,
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    async fn contents(&self) -> Vec<(String, String)> {
        let missing: Vec<String> = {
            let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            self.paths
                .iter()
                .filter(|p| !cache.contains_key(*p))
                .cloned()
                .collect()
        };

        let fetched: Vec<(String, Option<String>)> = futures::stream::iter(missing)
            .map(|path| async move {
                let content = self
                    .repo
                    .get_file_content(&path, self.reference.as_deref())
                    .await;
                match content {
                    Ok(text) => (path, Some(text)),
                    Err(e) => {
                        warn!("Skipping '{path}' in whole-file context: {e}");
                        (path, None)
                    }
                }
            })
            .buffered(FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        for (path, text) in fetched {
            if let Some(text) = text {
                cache.insert(path, text);
            }
        }
        self.paths
            .iter()
            .filter_map(|p| cache.get(p).map(|t| (p.clone(), t.clone())))
            .collect()
    }
}

impl ContextSourceProvider for WholeFileSource {
    fn name(&self) -> &str {
        "whole-file"
    }

    fn blocks<'a>(
        &'a self,
        _query: &'a str,
        mode: ContextMode,
        counter: &'a dyn TokenCounter,
    ) -> SourceFuture<'a> {
        Box::pin(async move {
            if mode != ContextMode::WholeFile {
                return Ok(Vec::new());
            }
            let mut blocks = Vec::new();
            for (path, text) in self.contents().await {
                blocks.push(
                    ContextBlock::measure(BlockKind::FullFile, path, text, mode, counter).await?,
                );
            }
            Ok(blocks)
        })
    }
}

// ── Collection ─────────────────────────────────────────────────────

/// The ordered set of providers consulted for each round.
#[derive(Default, Clone)]
pub struct ContextSources {
    providers: Vec<Arc<dyn ContextSourceProvider>>,
}

impl ContextSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: impl ContextSourceProvider + 'static) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    pub fn push(&mut self, provider: Arc<dyn ContextSourceProvider>) {
        self.providers.push(provider);
    }

    pub fn clear(&mut self) {
        self.providers.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Blocks from every provider, in provider order. A failing provider is
    /// logged and skipped.
    pub async fn collect(
        &self,
        query: &str,
        mode: ContextMode,
        counter: &dyn TokenCounter,
    ) -> Vec<ContextBlock> {
        let mut blocks = Vec::new();
        for provider in &self.providers {
            match provider.blocks(query, mode, counter).await {
                Ok(mut b) => {
                    debug!("Source '{}' offered {} block(s)", provider.name(), b.len());
                    blocks.append(&mut b);
                }
                Err(e) => warn!("Context source '{}' failed: {e}", provider.name()),
            }
        }
        blocks
    }
}
