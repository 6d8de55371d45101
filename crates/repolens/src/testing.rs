//! Test doubles shared by the unit tests.

use crate::api::{Generation, LlmClient, LlmFuture};
use crate::context::tokens::{CountFuture, HeuristicCounter, TokenCounter};
use crate::repository::{
    DEFAULT_FETCH_LIMIT, DEFAULT_IGNORED_DIRS, FetchError, FetchFuture, RepoFile, RepoFuture,
    RepositoryProvider, is_ignored_path,
};
use crate::{DEFAULT_MODEL, Error, PromptPart, Result, Role};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

// ── LLM ────────────────────────────────────────────────────────────

/// Replies with scripted answers in order. Counts tokens with the
/// heuristic unless told to fail.
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<Result<String>>>,
    prompts: Mutex<Vec<Vec<PromptPart>>>,
    configured: AtomicBool,
    count_error_once: AtomicBool,
    count_calls: AtomicUsize,
    generate_calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<&str>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.to_string())).collect()),
            prompts: Mutex::new(Vec::new()),
            configured: AtomicBool::new(true),
            count_error_once: AtomicBool::new(false),
            count_calls: AtomicUsize::new(0),
            generate_calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn then_reply(self, reply: &str) -> Self {
        self.replies.lock().unwrap().push_back(Ok(reply.to_string()));
        self
    }

    pub fn then_error(self, error: Error) -> Self {
        self.replies.lock().unwrap().push_back(Err(error));
        self
    }

    /// The first `count_tokens` call fails with a rate limit.
    pub fn with_count_error_once(self) -> Self {
        self.count_error_once.store(true, Ordering::SeqCst);
        self
    }

    /// Every generation waits this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn unconfigured(self) -> Self {
        self.configured.store(false, Ordering::SeqCst);
        self
    }

    pub fn count_calls(&self) -> usize {
        self.count_calls.load(Ordering::SeqCst)
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<Vec<PromptPart>> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

impl LlmClient for ScriptedLlm {
    fn configure(&self, _api_key: &str) -> Result<()> {
        self.configured.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_configured(&self) -> bool {
        self.configured.load(Ordering::SeqCst)
    }

    fn list_models(&self) -> LlmFuture<'_, Vec<String>> {
        Box::pin(async { Ok(vec![DEFAULT_MODEL.to_string()]) })
    }

    fn count_tokens<'a>(&'a self, parts: &'a [PromptPart]) -> LlmFuture<'a, usize> {
        Box::pin(async move {
            self.count_calls.fetch_add(1, Ordering::SeqCst);
            if self.count_error_once.swap(false, Ordering::SeqCst) {
                return Err(Error::RateLimited("token counting quota".into()));
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
            self.generate_calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(parts.to_vec());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let reply = self.replies.lock().unwrap().pop_front();
            match reply {
                Some(Ok(text)) => Ok(Generation::text(text)),
                Some(Err(e)) => Err(e),
                None => Err(Error::Api("no scripted reply left".into())),
            }
        })
    }

    fn cancel(&self) {}
}

// ── Counters ───────────────────────────────────────────────────────

/// Counts each part by the first marker its text contains; unknown text is
/// free. Model acknowledgments (text starting with `OK.`) are free too.
#[derive(Default)]
pub struct TableCounter {
    table: Vec<(String, usize)>,
}

impl TableCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, marker: &str, tokens: usize) -> Self {
        self.table.push((marker.to_string(), tokens));
        self
    }

    fn part_tokens(&self, part: &PromptPart) -> usize {
        if part.role == Role::Model && part.text.starts_with("OK.") {
            return 0;
        }
        self.table
            .iter()
            .find(|(marker, _)| part.text.contains(marker.as_str()))
            .map(|(_, tokens)| *tokens)
            .unwrap_or(0)
    }
}

impl TokenCounter for TableCounter {
    fn count<'a>(&'a self, parts: &'a [PromptPart]) -> CountFuture<'a> {
        Box::pin(async move { Ok(parts.iter().map(|p| self.part_tokens(p)).sum()) })
    }
}

/// Always fails, like a remote counter that is rate limited.
pub struct FailingCounter;

impl TokenCounter for FailingCounter {
    fn count<'a>(&'a self, _parts: &'a [PromptPart]) -> CountFuture<'a> {
        Box::pin(async { Err(Error::CountingUnavailable("rate limited".into())) })
    }
}

/// Heuristic counts, or failures while switched off.
#[derive(Default)]
pub struct SwitchableCounter {
    failing: AtomicBool,
    inner: HeuristicCounter,
}

impl SwitchableCounter {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl TokenCounter for SwitchableCounter {
    fn count<'a>(&'a self, parts: &'a [PromptPart]) -> CountFuture<'a> {
        if self.failing.load(Ordering::SeqCst) {
            return Box::pin(async { Err(Error::CountingUnavailable("rate limited".into())) });
        }
        self.inner.count(parts)
    }
}

// ── Repository ─────────────────────────────────────────────────────

/// Files held in memory.
pub struct MemoryRepository {
    name: String,
    files: BTreeMap<String, String>,
    fetch_limit: usize,
    unavailable: bool,
    fetches: Mutex<Vec<String>>,
}

impl MemoryRepository {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            files: BTreeMap::new(),
            fetch_limit: DEFAULT_FETCH_LIMIT,
            unavailable: false,
            fetches: Mutex::new(Vec::new()),
        }
    }

    pub fn with_file(mut self, path: &str, content: &str) -> Self {
        self.files.insert(path.to_string(), content.to_string());
        self
    }

    pub fn with_fetch_limit(mut self, bytes: usize) -> Self {
        self.fetch_limit = bytes;
        self
    }

    /// Every call fails as if the backend were unreachable.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Paths passed to `get_file_content`, in call order.
    pub fn fetches(&self) -> Vec<String> {
        self.fetches.lock().unwrap().clone()
    }
}

impl RepositoryProvider for MemoryRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> String {
        format!("memory://{}", self.name)
    }

    fn list_files<'a>(&'a self, _reference: Option<&'a str>) -> RepoFuture<'a, Vec<RepoFile>> {
        Box::pin(async move {
            if self.unavailable {
                return Err(Error::RepositoryUnavailable(format!("{} is offline", self.name)));
            }
            Ok(self
                .files
                .iter()
                .filter(|(path, _)| !is_ignored_path(path, DEFAULT_IGNORED_DIRS))
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
            if self.unavailable {
                return Err(FetchError::Unavailable(format!("{} is offline", self.name)));
            }
            let content = self.files.get(path).ok_or(FetchError::NotFound)?;
            if content.len() > self.fetch_limit {
                return Err(FetchError::TooLarge {
                    size: content.len(),
                    limit: self.fetch_limit,
                });
            }
            Ok(content.clone())
        })
    }
}
