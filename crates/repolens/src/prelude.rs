//! Convenience re-exports for common `repolens` types.
//!
//! Meant to be glob-imported by applications:
//!
//! ```ignore
//! use repolens::prelude::*;
//! ```
//!
//! Covers the client, the repository providers, configuration, the
//! conversation and its event handlers, and session persistence. Assembly
//! internals (sources, notices, the file-request machine) are left to
//! their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{
    DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_MODEL, Error, PromptPart, Result, Role,
};

// ── Model API ───────────────────────────────────────────────────────
pub use crate::api::{GeminiClient, Generation, LlmClient};

// ── Configuration ───────────────────────────────────────────────────
pub use crate::config::{AssistantConfig, gemini_api_key, github_token};

// ── Context management ──────────────────────────────────────────────
pub use crate::context::{Budget, ContextMode, ContextUsage, HeuristicCounter, TokenCounter};

// ── Conversation ────────────────────────────────────────────────────
pub use crate::conversation::{
    CancellationFlag, CompositeEventHandler, Conversation, ConversationEvent, EventHandler,
    FnEventHandler, LoggingHandler, NoopHandler, RoundReport, Turn, TurnId,
};

// ── Repositories and analysis ───────────────────────────────────────
pub use crate::analysis::{AnalysisReport, Analyzer};
pub use crate::repository::{GitHubRepository, LocalRepository, RepositoryProvider};
pub use crate::vector::{InMemoryVectorStore, VectorStore};

// ── Sessions ────────────────────────────────────────────────────────
pub use crate::session::{JsonSessionStore, SessionState, SessionStore};
