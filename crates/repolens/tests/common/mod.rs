//! Fakes shared by the integration tests.

#![allow(dead_code)]

use repolens::api::{Generation, LlmClient, LlmFuture};
use repolens::context::tokens::CountFuture;
use repolens::context::{HeuristicCounter, TokenCounter};
use repolens::conversation::{ConversationEvent, EventHandler};
use repolens::repository::{FetchError, FetchFuture, RepoFile, RepoFuture, RepositoryProvider};
use repolens::{Error, PromptPart, Result, Role};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

// ── LLM ────────────────────────────────────────────────────────────

/// Returns scripted replies in order; counts with the heuristic.
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<Vec<PromptPart>>>,
    fail_first_count: AtomicBool,
    count_calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedLlm {
    pub fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
            fail_first_count: AtomicBool::new(false),
            count_calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn rate_limited_first_count(self) -> Self {
        self.fail_first_count.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn count_calls(&self) -> usize {
        self.count_calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<Vec<PromptPart>> {
        self.prompts.lock().unwrap().clone()
    }
}

impl LlmClient for ScriptedLlm {
    fn configure(&self, _api_key: &str) -> Result<()> {
        Ok(())
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn list_models(&self) -> LlmFuture<'_, Vec<String>> {
        Box::pin(async { Ok(vec!["scripted".to_string()]) })
    }

    fn count_tokens<'a>(&'a self, parts: &'a [PromptPart]) -> LlmFuture<'a, usize> {
        Box::pin(async move {
            self.count_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first_count.swap(false, Ordering::SeqCst) {
                return Err(Error::RateLimited("quota exceeded".into()));
            }
            Ok(HeuristicCounter::default().estimate(parts))
        })
    }

    fn generate<'a>(
        &'a self,
        parts: &'a [PromptPart],
        _max_output_tokens: u32,
    ) -> LlmFuture<'a, Generation> {
        Box::pin(async move {
            self.prompts.lock().unwrap().push(parts.to_vec());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let reply = self.replies.lock().unwrap().pop_front();
            reply
                .map(Generation::text)
                .ok_or_else(|| Error::Api("script exhausted".into()))
        })
    }

    fn cancel(&self) {}
}

// ── Counter ────────────────────────────────────────────────────────

/// Counts each part by the first marker it contains. Parts without a marker
/// and model acknowledgments (`OK.` prefix) cost nothing.
#[derive(Default)]
pub struct TableCounter {
    table: Vec<(String, usize)>,
}

impl TableCounter {
    pub fn with(mut self, marker: &str, tokens: usize) -> Self {
        self.table.push((marker.to_string(), tokens));
        self
    }
}

impl TokenCounter for TableCounter {
    fn count<'a>(&'a self, parts: &'a [PromptPart]) -> CountFuture<'a> {
        Box::pin(async move {
            Ok(parts
                .iter()
                .filter(|p| !(p.role == Role::Model && p.text.starts_with("OK.")))
                .map(|p| {
                    self.table
                        .iter()
                        .find(|(m, _)| p.text.contains(m.as_str()))
                        .map_or(0, |(_, n)| *n)
                })
                .sum())
        })
    }
}

// ── Repository ─────────────────────────────────────────────────────

pub struct MemoryRepository {
    files: BTreeMap<String, String>,
    fetches: Mutex<Vec<String>>,
}

impl MemoryRepository {
    pub fn new(files: &[(&str, &str)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
            fetches: Mutex::new(Vec::new()),
        }
    }

    pub fn fetches(&self) -> Vec<String> {
        self.fetches.lock().unwrap().clone()
    }
}

impl RepositoryProvider for MemoryRepository {
    fn name(&self) -> &str {
        "demo"
    }

    fn source(&self) -> String {
        "memory://demo".to_string()
    }

    fn list_files<'a>(&'a self, _reference: Option<&'a str>) -> RepoFuture<'a, Vec<RepoFile>> {
        Box::pin(async move {
            Ok(self
                .files
                .iter()
                .map(|(path, content)| RepoFile {
                    path: path.clone(),
                    size: content.len() as u64,
                })
                .collect())
        })
    }

    fn get_file_content<'a>(
        &'a self,
        path: &'a str,
        _reference: Option<&'a str>,
    ) -> FetchFuture<'a> {
        Box::pin(async move {
            self.fetches.lock().unwrap().push(path.to_string());
            self.files.get(path).cloned().ok_or(FetchError::NotFound)
        })
    }
}

// ── Events ─────────────────────────────────────────────────────────

/// Records a one-line description of every event.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<String>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl EventHandler for RecordingHandler {
    fn on_event(&self, event: &ConversationEvent<'_>) {
        let line = match event {
            ConversationEvent::Excluded(notice) => format!("excluded: {notice}"),
            ConversationEvent::FileRequested { path } => format!("requested: {path}"),
            ConversationEvent::FileRequestFailed { path, reason } => {
                format!("failed: {path}: {reason}")
            }
            ConversationEvent::Answer(text) => format!("answer: {text}"),
            ConversationEvent::CountingDegraded => "degraded".to_string(),
            _ => return,
        };
        self.events.lock().unwrap().push(line);
    }
}
