//! Settings for a conversation and its analysis pipeline.

use crate::context::{Budget, ContextMode};
use crate::conversation::file_request::DEFAULT_MAX_HOPS;
use crate::repository::{DEFAULT_FETCH_LIMIT, DEFAULT_LISTING_LIMIT};
use crate::{CONTEXT_WINDOW_LIMIT, DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_MODEL, Error, Result};

/// Environment variable holding the Gemini API key.
pub const GEMINI_API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Environment variable holding an optional GitHub token.
pub const GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";

/// Extensions analyzed when the caller does not choose any.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    ".py", ".txt", ".md", ".json", ".html", ".css", ".js", ".yaml", ".yml",
];

/// Configuration for a [`Conversation`](crate::conversation::Conversation).
///
/// # Example
///
/// ```ignore
/// let config = AssistantConfig::default()
///     .with_model("gemini-1.5-pro-latest")
///     .with_context_mode(ContextMode::WholeFile)
///     .with_max_file_hops(2);
/// ```
#[derive(Debug, Clone)]
pub struct AssistantConfig {
    /// Model identifier.
    pub model: String,
    /// Context window of the model, in tokens.
    pub context_window_tokens: usize,
    /// Maximum tokens per model response. Also reserved out of the window.
    pub max_output_tokens: u32,
    /// Tokens kept free on top of the response reserve. `None` uses 1% of
    /// the window, at least 256.
    pub safety_margin: Option<usize>,
    /// File extensions considered during analysis. Empty accepts all files.
    pub extensions: Vec<String>,
    /// Extra instructions appended to the built-in ones.
    pub instructions: String,
    /// Language the model is asked to answer in.
    pub response_language: String,
    pub context_mode: ContextMode,
    /// Documents retrieved per query in retrieval mode.
    pub retrieval_k: usize,
    /// Automatic file fetches per question.
    pub max_file_hops: u32,
    /// Ceiling for a file fetched on the model's request, in bytes.
    pub fetch_limit: usize,
    /// Ceiling for a file to be analyzed, in bytes.
    pub listing_limit: u64,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Deliver answers incrementally as `TextDelta` events.
    pub streaming: bool,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            context_window_tokens: CONTEXT_WINDOW_LIMIT,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            safety_margin: None,
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            instructions: String::new(),
            response_language: "English".to_string(),
            context_mode: ContextMode::default(),
            retrieval_k: 30,
            max_file_hops: DEFAULT_MAX_HOPS,
            fetch_limit: DEFAULT_FETCH_LIMIT,
            listing_limit: DEFAULT_LISTING_LIMIT,
            chunk_size: 1000,
            chunk_overlap: 150,
            streaming: false,
        }
    }
}

impl AssistantConfig {
    // ── Builder methods ───────────────────────────────────────────

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window_tokens = tokens;
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    pub fn with_safety_margin(mut self, tokens: usize) -> Self {
        self.safety_margin = Some(tokens);
        self
    }

    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_response_language(mut self, language: impl Into<String>) -> Self {
        self.response_language = language.into();
        self
    }

    pub fn with_context_mode(mut self, mode: ContextMode) -> Self {
        self.context_mode = mode;
        self
    }

    pub fn with_retrieval_k(mut self, k: usize) -> Self {
        self.retrieval_k = k;
        self
    }

    /// Set the automatic file-fetch limit per question. `0` disables
    /// fetching entirely.
    pub fn with_max_file_hops(mut self, hops: u32) -> Self {
        self.max_file_hops = hops;
        self
    }

    pub fn with_fetch_limit(mut self, bytes: usize) -> Self {
        self.fetch_limit = bytes;
        self
    }

    pub fn with_chunking(mut self, size: usize, overlap: usize) -> Self {
        self.chunk_size = size;
        self.chunk_overlap = overlap;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// The token budget every prompt must fit.
    pub fn budget(&self) -> Budget {
        let budget = Budget::for_window(self.context_window_tokens, self.max_output_tokens as usize);
        match self.safety_margin {
            Some(margin) => budget.with_safety_margin(margin),
            None => budget,
        }
    }

    /// Reject settings no prompt could ever satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(Error::Configuration("model name is empty".into()));
        }
        if self.max_output_tokens == 0 {
            return Err(Error::Configuration("max output tokens must be positive".into()));
        }
        if self.budget().usable() == 0 {
            return Err(Error::Configuration(format!(
                "context window of {} tokens leaves no room for a prompt after reserving {} for the response",
                self.context_window_tokens, self.max_output_tokens
            )));
        }
        if self.chunk_size == 0 || self.chunk_overlap >= self.chunk_size {
            return Err(Error::Configuration(format!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Read the Gemini API key from the environment.
pub fn gemini_api_key() -> Result<String> {
    std::env::var(GEMINI_API_KEY_ENV)
        .ok()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| Error::Configuration(format!("{GEMINI_API_KEY_ENV} is not set")))
}

/// Read an optional GitHub token from the environment.
pub fn github_token() -> Option<String> {
    std::env::var(GITHUB_TOKEN_ENV)
        .ok()
        .filter(|t| !t.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = AssistantConfig::default();
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.max_file_hops, 1);
        assert_eq!(config.retrieval_k, 30);
        assert_eq!((config.chunk_size, config.chunk_overlap), (1000, 150));
        assert_eq!(config.context_mode, ContextMode::Retrieval);
        config.validate().unwrap();
    }

    #[test]
    fn budget_reserves_output_and_margin() {
        let config = AssistantConfig::default()
            .with_context_window(10_000)
            .with_max_output_tokens(2_000)
            .with_safety_margin(500);
        let budget = config.budget();
        assert_eq!(budget.usable(), 7_500);
    }

    #[test]
    fn default_margin_is_one_percent_with_floor() {
        let budget = AssistantConfig::default()
            .with_context_window(10_000)
            .with_max_output_tokens(1_000)
            .budget();
        assert_eq!(budget.safety_margin, 256);
    }

    #[test]
    fn validate_rejects_impossible_settings() {
        let config = AssistantConfig::default()
            .with_context_window(1_000)
            .with_max_output_tokens(1_000);
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let config = AssistantConfig::default().with_chunking(100, 100);
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }
}
