//! Repository analysis: one pass over the eligible files that produces the
//! file tree text, a short summary per file, and the documents the vector
//! store ranks for retrieval.
//!
//! Files are processed one at a time. Cancellation is checked before each
//! file; a cancelled or rate-limited run stops early and keeps what it has
//! produced so far ([`AnalysisReport::stopped`]).

pub mod code_splitter;
pub mod splitter;

pub use code_splitter::{CodeLanguage, CodeSplitter};
pub use splitter::RecursiveCharacterSplitter;

use crate::api::LlmClient;
use crate::config::AssistantConfig;
use crate::context::render_tree;
use crate::conversation::events::{ConversationEvent, EventHandler};
use crate::conversation::guard::CancellationFlag;
use crate::repository::{FetchError, RepositoryProvider, select_files};
use crate::vector::{Document, VectorStore};
use crate::{Error, PromptPart, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Output limit for one summary.
const SUMMARY_MAX_OUTPUT_TOKENS: u32 = 1024;

/// Summary recorded for a file with no content.
pub const EMPTY_FILE_SUMMARY: &str = "(empty file)";

/// The prompt asking for a 2–4 sentence summary of one file.
pub fn summarization_prompt(path: &str, content: &str) -> String {
    format!(
        "Analyze the contents of this file:\n\n\
         --- START OF FILE: {path} ---\n\
         {content}\n\
         --- END OF FILE ---\n\n\
         Create a brief but comprehensive summary (2-4 sentences) for it.\n\
         In the summary, be sure to reflect:\n\
         1. The main purpose of the file (what it does, what it is responsible for).\n\
         2. Key classes, functions, or components defined in it.\n\
         3. Its main dependencies on other parts of the project, if they are evident from the code.\n\n\
         The response should be only the summary text, without any extra phrases or introductions."
    )
}

/// Why an analysis ended before the last file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisStop {
    Cancelled,
    /// The model quota ran out. Carries the provider message.
    RateLimited(String),
}

impl AnalysisStop {
    pub fn into_error(self) -> Error {
        match self {
            AnalysisStop::Cancelled => Error::Cancelled,
            AnalysisStop::RateLimited(msg) => Error::RateLimited(msg),
        }
    }
}

/// What an analysis produced.
#[derive(Debug, Clone, Default)]
pub struct AnalysisReport {
    /// Rendered tree of every listed file.
    pub file_tree: String,
    pub summaries: BTreeMap<String, String>,
    /// Files that were summarized, in processing order.
    pub analyzed_paths: Vec<String>,
    /// Notes about files left out for size.
    pub skipped: Vec<String>,
    /// Files whose summary is an error placeholder.
    pub failed: Vec<String>,
    /// Documents handed to the vector store.
    pub documents_added: usize,
    pub stopped: Option<AnalysisStop>,
}

/// Runs the analysis pipeline against one repository.
pub struct Analyzer {
    llm: Arc<dyn LlmClient>,
    repo: Arc<dyn RepositoryProvider>,
    store: Option<Arc<dyn VectorStore>>,
    reference: Option<String>,
    extensions: Vec<String>,
    listing_limit: u64,
    splitter: CodeSplitter,
}

impl Analyzer {
    pub fn new(llm: Arc<dyn LlmClient>, repo: Arc<dyn RepositoryProvider>) -> Self {
        Self::from_config(llm, repo, &AssistantConfig::default())
    }

    /// Take extensions, ceilings and chunking from `config`.
    pub fn from_config(
        llm: Arc<dyn LlmClient>,
        repo: Arc<dyn RepositoryProvider>,
        config: &AssistantConfig,
    ) -> Self {
        Self {
            llm,
            repo,
            store: None,
            reference: None,
            extensions: config.extensions.clone(),
            listing_limit: config.listing_limit,
            splitter: CodeSplitter::new(RecursiveCharacterSplitter::new(
                config.chunk_size,
                config.chunk_overlap,
            )),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Branch or commit to analyze. `None` uses the default branch.
    pub fn with_reference(mut self, reference: Option<String>) -> Self {
        self.reference = reference;
        self
    }

    /// Analyze the repository.
    ///
    /// Fails only when the repository cannot be listed or becomes
    /// unreachable, or when the vector store rejects documents. Per-file
    /// failures are logged and skipped.
    pub async fn run(
        &self,
        handler: &dyn EventHandler,
        cancel: &CancellationFlag,
    ) -> Result<AnalysisReport> {
        let reference = self.reference.as_deref();
        info!(
            "Analyzing {} ({})",
            self.repo.source(),
            reference.unwrap_or("default branch")
        );
        handler.on_event(&ConversationEvent::Status("Listing repository files..."));

        let files = self.repo.list_files(reference).await?;
        let mut report = AnalysisReport {
            file_tree: render_tree(self.repo.name(), files.iter().map(|f| f.path.as_str())),
            ..Default::default()
        };

        let (selected, skipped) = select_files(&files, &self.extensions, self.listing_limit);
        for note in &skipped {
            handler.on_event(&ConversationEvent::Status(note));
        }
        report.skipped = skipped;

        if let Some(store) = &self.store {
            store.clear().await?;
        }

        let total = selected.len();
        info!("{total} of {} file(s) selected for analysis", files.len());
        for (i, file) in selected.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!("Analysis cancelled after {i} of {total} file(s)");
                report.stopped = Some(AnalysisStop::Cancelled);
                break;
            }

            match self.analyze_file(&file.path, &mut report, handler).await {
                Ok(()) => {}
                Err(Error::RateLimited(msg)) => {
                    warn!("Quota exhausted while analyzing '{}'; stopping", file.path);
                    report.stopped = Some(AnalysisStop::RateLimited(msg));
                    break;
                }
                Err(Error::Cancelled) => {
                    report.stopped = Some(AnalysisStop::Cancelled);
                    break;
                }
                Err(e) => return Err(e),
            }

            handler.on_event(&ConversationEvent::Progress {
                message: &file.path,
                current: i + 1,
                total,
            });
        }

        info!(
            "Analysis finished: {} summarized, {} failed, {} document(s) stored",
            report.analyzed_paths.len(),
            report.failed.len(),
            report.documents_added
        );
        Ok(report)
    }

    async fn analyze_file(
        &self,
        path: &str,
        report: &mut AnalysisReport,
        handler: &dyn EventHandler,
    ) -> Result<()> {
        debug!("Analyzing file: {path}");
        let content = match self
            .repo
            .get_file_content(path, self.reference.as_deref())
            .await
        {
            Ok(content) => content,
            Err(e @ (FetchError::RateLimited(_) | FetchError::Unavailable(_))) => {
                return Err(e.into_error(path));
            }
            Err(e) => {
                warn!("Skipping analysis of '{path}': {e}");
                return Ok(());
            }
        };

        let summary = match self.summarize(path, &content).await {
            Ok(summary) => summary,
            Err(e @ (Error::RateLimited(_) | Error::Cancelled)) => return Err(e),
            Err(e) => {
                warn!("Summarization failed for '{path}': {e}");
                handler.on_event(&ConversationEvent::Status(&format!(
                    "Summarization failed for '{path}'; a placeholder was recorded."
                )));
                report.failed.push(path.to_string());
                format!("(summarization error: {e})")
            }
        };

        let mut documents = vec![Document::summary(path, summary.as_str())];
        if !content.trim().is_empty() {
            let chunks = self.splitter.split(path, &content);
            debug!("'{path}' split into {} chunk(s)", chunks.len());
            documents.extend(
                chunks
                    .into_iter()
                    .enumerate()
                    .map(|(i, chunk)| Document::chunk(path, i + 1, chunk)),
            );
        }

        if let Some(store) = &self.store {
            let ids = documents.iter().map(Document::default_id).collect();
            report.documents_added += documents.len();
            store.add(documents, ids).await?;
        }

        report.summaries.insert(path.to_string(), summary);
        report.analyzed_paths.push(path.to_string());
        Ok(())
    }

    async fn summarize(&self, path: &str, content: &str) -> Result<String> {
        if content.trim().is_empty() {
            return Ok(EMPTY_FILE_SUMMARY.to_string());
        }
        let prompt = [PromptPart::user(summarization_prompt(path, content))];
        let generation = self
            .llm
            .generate(&prompt, SUMMARY_MAX_OUTPUT_TOKENS)
            .await?;
        info!("Summarized '{path}'");
        Ok(generation.text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::events::{FnEventHandler, NoopHandler};
    use crate::testing::{MemoryRepository, ScriptedLlm};
    use crate::vector::InMemoryVectorStore;
    use std::sync::Mutex;

    fn repo() -> Arc<MemoryRepository> {
        Arc::new(
            MemoryRepository::new("demo")
                .with_file("src/a.py", "def a():\n    return 1\n")
                .with_file("src/b.py", "def b():\n    return 2\n")
                .with_file("README.txt", "")
                .with_file("logo.png", "binary"),
        )
    }

    #[tokio::test]
    async fn summarizes_selected_files_and_fills_the_store() {
        // Files are processed in path order: README.txt, src/a.py, src/b.py.
        let llm = Arc::new(ScriptedLlm::new(vec!["Defines a.", "Defines b."]));
        let store = Arc::new(InMemoryVectorStore::new());
        let progress = Arc::new(Mutex::new(Vec::new()));
        let seen = progress.clone();
        let handler = FnEventHandler::new(move |event| {
            if let ConversationEvent::Progress { current, total, .. } = event {
                seen.lock().unwrap().push((*current, *total));
            }
        });

        let report = Analyzer::new(llm.clone(), repo())
            .with_store(store.clone())
            .run(&handler, &CancellationFlag::new())
            .await
            .unwrap();

        assert_eq!(report.analyzed_paths, vec!["README.txt", "src/a.py", "src/b.py"]);
        assert_eq!(report.summaries["README.txt"], EMPTY_FILE_SUMMARY);
        assert_eq!(report.summaries["src/a.py"], "Defines a.");
        assert_eq!(report.summaries["src/b.py"], "Defines b.");
        assert!(report.file_tree.contains("logo.png"));
        assert_eq!(llm.generate_calls(), 2);
        // 3 summaries + one chunk for each non-empty file.
        assert_eq!(report.documents_added, 5);
        assert_eq!(store.len(), 5);
        assert_eq!(*progress.lock().unwrap(), vec![(1, 3), (2, 3), (3, 3)]);
        assert!(report.stopped.is_none());
    }

    #[tokio::test]
    async fn generation_error_records_placeholder_and_continues() {
        let llm = Arc::new(
            ScriptedLlm::new(vec![])
                .then_error(Error::Api("boom".into()))
                .then_reply("Defines b."),
        );
        let report = Analyzer::new(llm, repo())
            .run(&NoopHandler, &CancellationFlag::new())
            .await
            .unwrap();
        assert!(report.summaries["src/a.py"].starts_with("(summarization error:"));
        assert_eq!(report.summaries["src/b.py"], "Defines b.");
        assert_eq!(report.failed, vec!["src/a.py"]);
    }

    #[tokio::test]
    async fn rate_limit_stops_and_keeps_partial_results() {
        let llm = Arc::new(ScriptedLlm::new(vec![]).then_error(Error::RateLimited("quota".into())));
        let report = Analyzer::new(llm.clone(), repo())
            .run(&NoopHandler, &CancellationFlag::new())
            .await
            .unwrap();
        assert_eq!(report.analyzed_paths, vec!["README.txt"]);
        assert_eq!(
            report.stopped,
            Some(AnalysisStop::RateLimited("quota".into()))
        );
        assert_eq!(llm.generate_calls(), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_processes_nothing() {
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let report = Analyzer::new(llm.clone(), repo())
            .run(&NoopHandler, &cancel)
            .await
            .unwrap();
        assert!(report.analyzed_paths.is_empty());
        assert_eq!(report.stopped, Some(AnalysisStop::Cancelled));
        assert_eq!(llm.generate_calls(), 0);
    }

    #[tokio::test]
    async fn unavailable_repository_is_fatal() {
        let repo = Arc::new(MemoryRepository::new("demo").unavailable());
        let err = Analyzer::new(Arc::new(ScriptedLlm::new(vec![])), repo)
            .run(&NoopHandler, &CancellationFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RepositoryUnavailable(_)));
    }

    #[test]
    fn prompt_embeds_path_and_content() {
        let prompt = summarization_prompt("src/a.py", "x = 1");
        assert!(prompt.contains("--- START OF FILE: src/a.py ---\nx = 1\n--- END OF FILE ---"));
        assert!(prompt.contains("2-4 sentences"));
    }
}
