//! Error types for repolens.
//!
//! Soft budget overflows (context or history truncation) are not errors: the
//! assembler recovers from them and reports
//! [`ExclusionNotice`](crate::context::assembler::ExclusionNotice)s instead.

use thiserror::Error;

/// Result type alias using the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Why a requested file could not be delivered to the model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FileFetchFailure {
    #[error("file is too large ({size} bytes, limit {limit} bytes)")]
    TooLarge { size: usize, limit: usize },
    #[error("file not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("automatic file request limit reached ({max_hops} per question)")]
    HopLimit { max_hops: u32 },
    #[error("file ({tokens} tokens) does not fit the remaining prompt budget")]
    ExceedsBudget { tokens: usize },
}

#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid credentials. Blocks sending.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The non-droppable parts of the prompt alone exceed the usable budget.
    #[error(
        "Prompt too large: {required} tokens required but only {usable} available. \
         Shorten the instructions or the question."
    )]
    PromptTooLarge { required: usize, usable: usize },

    /// The remote token counter failed. Callers substitute a heuristic.
    #[error("Token counting unavailable: {0}")]
    CountingUnavailable(String),

    #[error("Could not fetch requested file '{path}': {failure}")]
    FileRequestFailed {
        path: String,
        failure: FileFetchFailure,
    },

    /// Fatal for the analysis, update or fetch in progress.
    #[error("Repository unavailable: {0}")]
    RepositoryUnavailable(String),

    #[error("Rate limited: {0}. Try again later.")]
    RateLimited(String),

    #[error("A request is already in progress. Wait for it to finish.")]
    Busy,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Enter a question first.")]
    EmptyQuery,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Any other generation failure reported by the model API.
    #[error("LLM API error: {0}")]
    Api(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the conversation can carry on after this error without user
    /// intervention beyond reading a notice.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::CountingUnavailable(_) | Error::FileRequestFailed { .. }
        )
    }

    /// Whether the same request may succeed later unchanged.
    pub fn is_retry_later(&self) -> bool {
        matches!(self, Error::RateLimited(_) | Error::Busy)
    }
}
