//! Context window management: token counting, budgets, context blocks and
//! prompt assembly.
//!
//! The model's context window is fixed; everything a round wants to send
//! competes for it. This module provides the pieces that decide what fits:
//!
//! 1. **[`tokens`]**: the [`TokenCounter`] capability with a remote counter,
//!    a network-free heuristic, and a fallback wrapper that never fails.
//!
//! 2. **[`budget`]**: [`Budget`] turns the window, the response reserve and
//!    a safety margin into the usable prompt size.
//!
//! 3. **[`block`]** and **[`sources`]**: candidate [`ContextBlock`]s (file
//!    tree, summaries, retrieved chunks, whole files), each measured once and
//!    tagged with a priority tier.
//!
//! 4. **[`assembler`]**: [`PromptAssembler`] allocates the budget greedily
//!    and deterministically, reporting [`ExclusionNotice`]s for whatever was
//!    left out.
//!
//! [`tree`] renders the project file tree offered as the highest-priority
//! block.

pub mod assembler;
pub mod block;
pub mod budget;
pub mod sources;
pub mod tokens;
pub mod tree;

pub use assembler::{AssembledPrompt, AssemblyRequest, ExclusionNotice, NoticeKind, PromptAssembler};
pub use block::{BlockKind, ContextBlock, ContextMode};
pub use budget::{Budget, ContextUsage};
pub use sources::{ContextSourceProvider, ContextSources};
pub use tokens::{
    DEFAULT_CHARS_PER_TOKEN, FallbackCounter, HeuristicCounter, RemoteCounter, TokenCounter,
};
pub use tree::render_tree;
