//! Context assembly and token budgeting for conversations about a codebase.
//!
//! `repolens` lets a user talk to a large-language model about a repository
//! (a GitHub repository or a local folder). Every user turn goes through the
//! same pipeline: the conversation history is normalized, project context
//! (file tree, per-file summaries, retrieved chunks or whole files) competes
//! for the model's fixed token window, the prompt is assembled under a hard
//! budget, and the model's reply is inspected for a file request before it is
//! accepted as the answer.
//!
//! The core abstraction is the [`Conversation`](conversation::Conversation):
//! one per session, at most one round in flight at a time.
//!
//! # Getting started
//!
//! ```ignore
//! use repolens::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> repolens::Result<()> {
//!     let llm = Arc::new(GeminiClient::new(gemini_api_key()?)?);
//!     let repo = Arc::new(LocalRepository::new("/path/to/project")?);
//!     let store = Arc::new(InMemoryVectorStore::new());
//!
//!     let config = AssistantConfig::default().with_max_output_tokens(8192);
//!     let conversation = Conversation::new(llm, config)
//!         .with_repository(repo)
//!         .with_vector_store(store);
//!
//!     conversation.analyze(&LoggingHandler).await?;
//!     let report = conversation.send("Where is the HTTP client built?", &LoggingHandler).await?;
//!     println!("{}", report.answer.unwrap_or_default());
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Token counting:** [`TokenCounter`](context::tokens::TokenCounter) with
//!   the network-free [`HeuristicCounter`](context::tokens::HeuristicCounter)
//!   and the degrading [`FallbackCounter`](context::tokens::FallbackCounter).
//! - **Budget allocation:** [`PromptAssembler`](context::assembler::PromptAssembler)
//!   and [`Budget`](context::budget::Budget).
//! - **Project context:** [`ContextBlock`](context::block::ContextBlock) and the
//!   providers in [`context::sources`].
//! - **History:** [`HistoryManager`](conversation::history::HistoryManager) and
//!   the [`collapse_same_role_runs`](conversation::history::collapse_same_role_runs) pass.
//! - **File requests:** [`conversation::file_request`], an explicit state
//!   machine with a configurable hop limit.
//! - **Observing a round:** implement [`EventHandler`](conversation::events::EventHandler).
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`api`] | Gemini client, SSE streaming, HTTP error classification |
//! | [`context`] | Token counting, budgets, context blocks and providers, prompt assembly |
//! | [`conversation`] | History, file-request protocol, events, the round driver |
//! | [`repository`] | Local folder and GitHub repository providers |
//! | [`analysis`] | Repository analysis: summaries, chunking, vector ingestion |
//! | [`vector`] | Vector store interface and an in-memory implementation |
//! | [`session`] | Session state and JSON persistence |

pub mod analysis;
pub mod api;
pub mod config;
pub mod context;
pub mod conversation;
pub mod error;
pub mod prelude;
pub mod repository;
pub mod session;
pub mod vector;

#[cfg(test)]
pub(crate) mod testing;

use serde::{Deserialize, Serialize};

pub use error::{Error, Result};

// ── Constants ──────────────────────────────────────────────────────

/// Default model for all LLM calls.
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash-latest";

/// Context window of the default model family, in tokens.
pub const CONTEXT_WINDOW_LIMIT: usize = 1_048_576;

/// Default per-response output token limit.
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 65_536;

// ── Prompt types ───────────────────────────────────────────────────

/// Role of a turn or prompt part.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Model => write!(f, "model"),
            Role::System => write!(f, "system"),
        }
    }
}

/// One role-tagged piece of a prompt, as sent to the model or the counter.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PromptPart {
    pub role: Role,
    pub text: String,
}

impl PromptPart {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            text: text.into(),
        }
    }

    /// Character length of the text (not bytes).
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}
