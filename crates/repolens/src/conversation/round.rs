//! The round driver.
//!
//! A [`Conversation`] owns one session: the turn log, the project context
//! produced by analysis, and the in-flight guard. [`Conversation::send`] runs
//! one round end to end:
//!
//! 1. take an immutable history snapshot and collect candidate blocks,
//! 2. assemble a prompt under the budget and call the model,
//! 3. feed the reply through the file-request machine, fetching and
//!    injecting files until the model answers or the hop limit is reached,
//! 4. commit the user turn (and the answer, if any) to the history.
//!
//! Nothing is committed before step 4, so a failed or cancelled round
//! leaves the history exactly as it was.

use super::events::{ConversationEvent, EventHandler};
use super::file_request::{
    Action, FileRequestMachine, FileRequestState, FsmInput, PendingFileRequest, RoundOutcome,
};
use super::guard::{CancellationFlag, RoundGuard};
use super::history::{HistoryManager, Turn, TurnId};
use super::prompt;
use crate::analysis::{AnalysisReport, Analyzer};
use crate::api::{Generation, LlmClient};
use crate::config::AssistantConfig;
use crate::context::sources::{RetrievalSource, SummarySource, TreeSource, WholeFileSource};
use crate::context::{
    AssembledPrompt, AssemblyRequest, BlockKind, Budget, ContextBlock, ContextSources,
    ExclusionNotice, FallbackCounter, PromptAssembler, RemoteCounter, TokenCounter,
};
use crate::error::FileFetchFailure;
use crate::repository::RepositoryProvider;
use crate::session::{RepoBinding, SESSION_VERSION, SessionSettings, SessionState};
use crate::vector::{Document, VectorStore};
use crate::{Error, PromptPart, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

/// Tier given to a file the model asked for, ahead of everything else.
const REQUESTED_FILE_TIER: u8 = 0;

/// A file request that ended without the file reaching the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedFileRequest {
    pub path: String,
    pub failure: FileFetchFailure,
}

/// What one round did.
#[derive(Debug, Clone, Default)]
pub struct RoundReport {
    /// The model's answer. `None` when a file request failed or hit the hop
    /// limit; the question is kept in the history for a manual follow-up.
    pub answer: Option<String>,
    /// Exclusion notices from every assembly in the round, deduplicated.
    pub notices: Vec<ExclusionNotice>,
    /// Paths fetched on the model's request, in order.
    pub file_requests: Vec<String>,
    pub failed_request: Option<FailedFileRequest>,
    pub model_calls: u32,
    /// Size of the last prompt sent.
    pub prompt_tokens: usize,
    /// Whether any count fell back to the local estimate.
    pub degraded_counting: bool,
}

#[derive(Default)]
struct ProjectContext {
    file_tree: Option<String>,
    summaries: BTreeMap<String, String>,
    analyzed_paths: Vec<String>,
    sources: ContextSources,
}

/// One conversation about one repository.
pub struct Conversation {
    llm: Arc<dyn LlmClient>,
    counter: Arc<dyn TokenCounter>,
    config: AssistantConfig,
    repository: Option<Arc<dyn RepositoryProvider>>,
    branch: Option<String>,
    store: Option<Arc<dyn VectorStore>>,
    history: Mutex<HistoryManager>,
    project: RwLock<ProjectContext>,
    in_flight: Arc<AtomicBool>,
    cancel: CancellationFlag,
}

impl Conversation {
    /// Create a conversation. Tokens are counted through `llm` unless
    /// [`with_counter`](Self::with_counter) installs another counter.
    pub fn new(llm: Arc<dyn LlmClient>, config: AssistantConfig) -> Self {
        llm.set_model(&config.model);
        Self {
            counter: Arc::new(RemoteCounter::new(llm.clone())),
            llm,
            config,
            repository: None,
            branch: None,
            store: None,
            history: Mutex::new(HistoryManager::new()),
            project: RwLock::new(ProjectContext::default()),
            in_flight: Arc::new(AtomicBool::new(false)),
            cancel: CancellationFlag::new(),
        }
    }

    pub fn with_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn RepositoryProvider>) -> Self {
        self.repository = Some(repository);
        self.rebuild_sources();
        self
    }

    /// Branch or commit used for listing and fetching.
    pub fn with_branch(mut self, branch: Option<String>) -> Self {
        self.branch = branch;
        self.rebuild_sources();
        self
    }

    pub fn with_vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.store = Some(store);
        self.rebuild_sources();
        self
    }

    // ── Accessors ─────────────────────────────────────────────────

    pub fn config(&self) -> &AssistantConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: AssistantConfig) {
        self.llm.set_model(&config.model);
        self.config = config;
        self.rebuild_sources();
    }

    pub fn repository(&self) -> Option<&Arc<dyn RepositoryProvider>> {
        self.repository.as_ref()
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    /// Whether a round or an analysis is running.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// A handle that cancels whatever is running on this conversation.
    pub fn cancellation_flag(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    /// Cancel the running round or analysis. The in-flight model call is
    /// aborted; the operation resolves to [`Error::Cancelled`].
    pub fn cancel(&self) {
        info!("Cancellation requested");
        self.cancel.cancel();
        self.llm.cancel();
    }

    pub fn file_tree(&self) -> Option<String> {
        self.read_project().file_tree.clone()
    }

    pub fn summaries(&self) -> BTreeMap<String, String> {
        self.read_project().summaries.clone()
    }

    // ── History ───────────────────────────────────────────────────

    pub fn turns(&self) -> Vec<Turn> {
        self.lock_history().turns().to_vec()
    }

    pub fn set_turn_included(&self, id: TurnId, included: bool) -> Result<()> {
        self.lock_history().set_included(id, included)
    }

    pub fn toggle_turn(&self, id: TurnId) -> Result<bool> {
        self.lock_history().toggle_included(id)
    }

    /// The question of the last round, e.g. to retry after a failed file
    /// request.
    pub fn last_question(&self) -> Option<String> {
        self.lock_history().last_user_text().map(str::to_string)
    }

    pub fn clear_history(&self) {
        self.lock_history().clear();
    }

    // ── Project binding ───────────────────────────────────────────

    /// Switch to another repository. Analysis results are discarded.
    pub async fn set_repository(
        &mut self,
        repository: Option<Arc<dyn RepositoryProvider>>,
        branch: Option<String>,
    ) -> Result<()> {
        self.repository = repository;
        self.branch = branch;
        self.invalidate_context().await
    }

    /// Switch branches. Analysis results are discarded when it changes.
    pub async fn set_branch(&mut self, branch: Option<String>) -> Result<()> {
        if self.branch == branch {
            return Ok(());
        }
        info!(
            "Branch changed to {}; analysis results invalidated",
            branch.as_deref().unwrap_or("default")
        );
        self.branch = branch;
        self.invalidate_context().await
    }

    /// Drop the file tree, summaries and stored documents.
    pub async fn invalidate_context(&self) -> Result<()> {
        {
            let mut project = self.write_project();
            project.file_tree = None;
            project.summaries.clear();
            project.analyzed_paths.clear();
        }
        if let Some(store) = &self.store {
            store.clear().await?;
        }
        self.rebuild_sources();
        Ok(())
    }

    /// Analyze the bound repository and replace the project context.
    ///
    /// Results of a cancelled or rate-limited run are kept, and the
    /// corresponding error is returned afterwards.
    pub async fn analyze(&self, handler: &dyn EventHandler) -> Result<AnalysisReport> {
        let repo = self
            .repository
            .clone()
            .ok_or_else(|| Error::RepositoryUnavailable("no repository is loaded".into()))?;
        let _guard = RoundGuard::acquire(&self.in_flight)?;
        self.cancel.reset();

        let mut analyzer = Analyzer::from_config(self.llm.clone(), repo, &self.config)
            .with_reference(self.branch.clone());
        if let Some(store) = &self.store {
            analyzer = analyzer.with_store(store.clone());
        }
        let report = analyzer.run(handler, &self.cancel).await?;

        {
            let mut project = self.write_project();
            project.file_tree = Some(report.file_tree.clone());
            project.summaries = report.summaries.clone();
            project.analyzed_paths = report.analyzed_paths.clone();
        }
        self.rebuild_sources();

        match report.stopped.clone() {
            Some(stop) => Err(stop.into_error()),
            None => Ok(report),
        }
    }

    // ── Rounds ────────────────────────────────────────────────────

    /// Ask a question and run the round to completion.
    ///
    /// Fails with [`Error::Busy`] while another round or analysis is
    /// running, [`Error::PromptTooLarge`] when the instructions and the
    /// question alone exceed the budget, and
    /// [`Error::RepositoryUnavailable`] when the model requests a file and
    /// no repository is loaded.
    pub async fn send(&self, query: &str, handler: &dyn EventHandler) -> Result<RoundReport> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::EmptyQuery);
        }
        if !self.llm.is_configured() {
            return Err(Error::Configuration("no API key is configured".into()));
        }
        let _guard = RoundGuard::acquire(&self.in_flight)?;
        self.cancel.reset();

        let preview: String = query.chars().take(80).collect();
        info!("Round started: {preview}");

        // Round-local copies: nothing below touches the shared history
        // until the round resolves.
        let mut round_history = self.lock_history().clone();
        let sources = self.read_project().sources.clone();

        let mode = self.config.context_mode;
        let budget = self.config.budget();
        let instructions =
            prompt::system_instructions(&self.config.instructions, &self.config.response_language);
        let assembler = PromptAssembler::new(self.counter.clone());
        let counter = FallbackCounter::new(self.counter.clone());

        let mut report = RoundReport::default();
        let mut blocks = sources.collect(query, mode, &counter).await;
        debug!("{} candidate block(s) for this round", blocks.len());

        let repo_name = self
            .repository
            .as_ref()
            .map(|r| r.name().to_string())
            .unwrap_or_default();
        let mut machine = FileRequestMachine::new(self.config.max_file_hops, repo_name);
        let mut measured: Vec<(TurnId, usize)> = Vec::new();
        let mut injected: Vec<(usize, PendingFileRequest)> = Vec::new();
        let mut state = FileRequestState::Idle;
        let mut input = FsmInput::Begin;

        let outcome = loop {
            self.cancel.check()?;
            let (next, action) = machine.transition(state, input)?;
            state = next;
            input = match action {
                Action::CallModel => {
                    let snapshot = round_history.snapshot_for_prompt();
                    let assembled = assembler
                        .assemble(AssemblyRequest {
                            instructions: &instructions,
                            blocks: &blocks,
                            history: &snapshot,
                            query,
                            budget,
                        })
                        .await?;
                    // Estimates stand in for this prompt only; caching them
                    // would pin them on the turns for good.
                    if !assembled.degraded_counting {
                        for &(id, tokens) in &assembled.measured_turns {
                            round_history.record_token_count(id, tokens);
                        }
                        measured.extend(assembled.measured_turns.iter().copied());
                    }
                    report_assembly(&assembled, budget, handler, &mut report);

                    // The synthetic exchange claims the file is attached.
                    // Never send it without the file.
                    if let Some((index, request)) = injected
                        .iter()
                        .find(|(i, _)| assembled.excluded_blocks.contains(i))
                    {
                        let tokens = blocks.get(*index).map_or(0, ContextBlock::token_count);
                        warn!(
                            "Requested file '{}' ({tokens} tokens) was left out of the prompt",
                            request.path
                        );
                        break RoundOutcome::ExceedsBudget {
                            request: request.clone(),
                            tokens,
                        };
                    }

                    let generation = self.generate(&assembled.parts, handler).await?;
                    report.model_calls += 1;
                    FsmInput::Response(generation.text)
                }
                Action::Parse => FsmInput::Advance,
                Action::Fetch(request) => {
                    let repo = self.repository.as_ref().ok_or_else(|| {
                        Error::RepositoryUnavailable(format!(
                            "the model requested '{}' but no repository is loaded",
                            request.path
                        ))
                    })?;
                    handler.on_event(&ConversationEvent::FileRequested {
                        path: &request.path,
                    });
                    report.file_requests.push(request.path.clone());
                    FsmInput::Fetched(
                        repo.get_file_content(&request.path, self.branch.as_deref())
                            .await,
                    )
                }
                Action::Inject { request, content } => {
                    let block = ContextBlock::measure(
                        BlockKind::FullFile,
                        request.path.as_str(),
                        content,
                        mode,
                        &counter,
                    )
                    .await?
                    .with_priority_tier(REQUESTED_FILE_TIER);
                    injected.push((blocks.len(), request.clone()));
                    blocks.push(block);
                    round_history.append(Turn::user(prompt::file_attached(&request.path)));
                    round_history.append(Turn::model(prompt::file_attached_ack(&request.path)));
                    handler.on_event(&ConversationEvent::Status(&format!(
                        "File '{}' received; asking again...",
                        request.path
                    )));
                    FsmInput::Advance
                }
                Action::Finish(outcome) => break outcome,
            };
        };

        if counter.is_degraded() && !report.degraded_counting {
            report.degraded_counting = true;
            handler.on_event(&ConversationEvent::CountingDegraded);
        }

        match outcome {
            RoundOutcome::Answer(text) => {
                handler.on_event(&ConversationEvent::Answer(&text));
                self.commit(query, Some(&text), &measured);
                report.answer = Some(text);
            }
            RoundOutcome::FetchFailed { request, error } => {
                match error.into_error(&request.path) {
                    Error::FileRequestFailed { path, failure } => {
                        report_failure(path, failure, handler, &mut report);
                        self.commit(query, None, &measured);
                    }
                    fatal => return Err(fatal),
                }
            }
            RoundOutcome::ExceedsBudget { request, tokens } => {
                let failure = FileFetchFailure::ExceedsBudget { tokens };
                report_failure(request.path, failure, handler, &mut report);
                self.commit(query, None, &measured);
            }
            RoundOutcome::HopLimit { request } => {
                let failure = FileFetchFailure::HopLimit {
                    max_hops: machine.max_hops(),
                };
                report_failure(request.path, failure, handler, &mut report);
                self.commit(query, None, &measured);
            }
        }

        info!(
            "Round finished: {} model call(s), {} file request(s), answer={}",
            report.model_calls,
            report.file_requests.len(),
            report.answer.is_some()
        );
        Ok(report)
    }

    async fn generate(&self, parts: &[PromptPart], handler: &dyn EventHandler) -> Result<Generation> {
        let max = self.config.max_output_tokens;
        let generation = if self.config.streaming {
            let on_chunk = |delta: &str| handler.on_event(&ConversationEvent::TextDelta(delta));
            self.llm.generate_stream(parts, max, &on_chunk).await?
        } else {
            self.llm.generate(parts, max).await?
        };
        if let Some(usage) = &generation.usage {
            handler.on_event(&ConversationEvent::TokenUsage {
                prompt_tokens: usage.prompt_tokens.unwrap_or(0),
                completion_tokens: usage.completion_tokens.unwrap_or(0),
            });
        }
        Ok(generation)
    }

    /// Record the round in the shared history. Measured counts are applied
    /// first: ids of round-local synthetic turns never exist in the shared
    /// log at that point.
    fn commit(&self, query: &str, answer: Option<&str>, measured: &[(TurnId, usize)]) {
        let mut history = self.lock_history();
        for &(id, tokens) in measured {
            history.record_token_count(id, tokens);
        }
        history.append(Turn::user(query));
        if let Some(answer) = answer {
            history.append(Turn::model(answer));
        }
    }

    // ── Sessions ──────────────────────────────────────────────────

    /// Snapshot everything needed to resume this conversation.
    pub fn to_state(&self) -> SessionState {
        let project = self.read_project();
        SessionState {
            version: SESSION_VERSION,
            saved_at: chrono::Utc::now(),
            repository: self.repository.as_ref().map(|r| RepoBinding {
                source: r.source(),
                branch: self.branch.clone(),
            }),
            file_tree: project.file_tree.clone(),
            summaries: project.summaries.clone(),
            analyzed_paths: project.analyzed_paths.clone(),
            turns: self.lock_history().turns().to_vec(),
            settings: SessionSettings {
                model: self.config.model.clone(),
                max_output_tokens: self.config.max_output_tokens,
                extensions: self.config.extensions.clone(),
                instructions: self.config.instructions.clone(),
                context_mode: self.config.context_mode,
            },
        }
    }

    /// Resume from a saved state.
    ///
    /// The repository provider itself is not rebuilt here: bind it with
    /// [`with_repository`](Self::with_repository) from
    /// [`SessionState::repository`] first. Saved summaries are re-added to
    /// the vector store so retrieval works without a new analysis.
    pub async fn restore(&mut self, state: SessionState) -> Result<()> {
        let SessionState {
            repository,
            file_tree,
            summaries,
            analyzed_paths,
            turns,
            settings,
            ..
        } = state;

        let mut config = self.config.clone();
        config.model = settings.model;
        config.max_output_tokens = settings.max_output_tokens;
        config.extensions = settings.extensions;
        config.instructions = settings.instructions;
        config.context_mode = settings.context_mode;
        self.llm.set_model(&config.model);
        self.config = config;

        if let Some(binding) = repository {
            self.branch = binding.branch;
        }

        let turn_count = turns.len();
        *self.history.get_mut().unwrap_or_else(|p| p.into_inner()) =
            HistoryManager::from_turns(turns);

        if let Some(store) = &self.store {
            store.clear().await?;
            if !summaries.is_empty() {
                let documents: Vec<Document> = summaries
                    .iter()
                    .map(|(path, summary)| Document::summary(path.as_str(), summary.as_str()))
                    .collect();
                let ids = documents.iter().map(Document::default_id).collect();
                store.add(documents, ids).await?;
            }
        }

        {
            let project = self.project.get_mut().unwrap_or_else(|p| p.into_inner());
            project.file_tree = file_tree;
            project.summaries = summaries;
            project.analyzed_paths = analyzed_paths;
        }
        self.rebuild_sources();
        info!("Session restored ({turn_count} turn(s))");
        Ok(())
    }

    // ── Internals ─────────────────────────────────────────────────

    fn lock_history(&self) -> MutexGuard<'_, HistoryManager> {
        self.history.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn read_project(&self) -> RwLockReadGuard<'_, ProjectContext> {
        self.project.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_project(&self) -> std::sync::RwLockWriteGuard<'_, ProjectContext> {
        self.project.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Rebuild the providers from the current project context.
    fn rebuild_sources(&self) {
        let mut project = self.write_project();
        let name = self
            .repository
            .as_ref()
            .map(|r| r.name().to_string())
            .unwrap_or_else(|| "project".to_string());

        let mut sources = ContextSources::new();
        if let Some(tree) = &project.file_tree {
            sources.push(Arc::new(TreeSource::new(name, tree.clone())));
        }
        if !project.summaries.is_empty() {
            sources.push(Arc::new(SummarySource::new(project.summaries.clone())));
        }
        if let Some(store) = &self.store {
            sources.push(Arc::new(RetrievalSource::new(
                store.clone(),
                self.config.retrieval_k,
            )));
        }
        if let Some(repo) = &self.repository
            && !project.analyzed_paths.is_empty()
        {
            sources.push(Arc::new(WholeFileSource::new(
                repo.clone(),
                self.branch.clone(),
                project.analyzed_paths.clone(),
            )));
        }
        project.sources = sources;
    }
}

fn report_assembly(
    assembled: &AssembledPrompt,
    budget: Budget,
    handler: &dyn EventHandler,
    report: &mut RoundReport,
) {
    for notice in &assembled.notices {
        if !report.notices.contains(notice) {
            handler.on_event(&ConversationEvent::Excluded(notice));
            report.notices.push(notice.clone());
        }
    }
    if assembled.degraded_counting && !report.degraded_counting {
        report.degraded_counting = true;
        handler.on_event(&ConversationEvent::CountingDegraded);
    }
    handler.on_event(&ConversationEvent::PromptAssembled {
        usage: &assembled.usage,
        blocks_included: assembled.included_blocks.len(),
        blocks_excluded: assembled.excluded_blocks.len(),
    });
    if let Some(advice) = budget.advisory(assembled.total_tokens) {
        handler.on_event(&ConversationEvent::Status(&advice));
    }
    report.prompt_tokens = assembled.total_tokens;
}

fn report_failure(
    path: String,
    failure: FileFetchFailure,
    handler: &dyn EventHandler,
    report: &mut RoundReport,
) {
    warn!("File request for '{path}' not fulfilled: {failure}");
    handler.on_event(&ConversationEvent::FileRequestFailed {
        path: &path,
        reason: &failure.to_string(),
    });
    report.failed_request = Some(FailedFileRequest { path, failure });
}
