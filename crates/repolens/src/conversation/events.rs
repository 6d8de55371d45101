//! Events and handlers for observing a conversation.
//!
//! The [`Conversation`](super::Conversation) reports everything the
//! surrounding application may want to show (analysis progress, exclusion
//! warnings, file requests, streamed text, the final answer) as
//! [`ConversationEvent`]s. Callers implement [`EventHandler`] to render them.
//!
//! # Choosing an event handler
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget calls |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |
//! | Custom `impl EventHandler` | Full control (UI, metrics) |

use crate::context::{ContextUsage, ExclusionNotice};
use tracing::{debug, info, trace, warn};

// ── Events ─────────────────────────────────────────────────────────

/// Events emitted during analysis and conversation rounds.
#[derive(Debug)]
pub enum ConversationEvent<'a> {
    /// Progress of a long-running operation.
    Progress {
        message: &'a str,
        current: usize,
        total: usize,
    },
    /// A free-text status line.
    Status(&'a str),
    /// Something was left out of the prompt.
    Excluded(&'a ExclusionNotice),
    /// A prompt was assembled and is about to be sent.
    PromptAssembled {
        usage: &'a ContextUsage,
        blocks_included: usize,
        blocks_excluded: usize,
    },
    /// Token counting fell back to the local estimate this round.
    CountingDegraded,
    /// The model asked for a file; it is being fetched.
    FileRequested { path: &'a str },
    /// A requested file could not be delivered.
    FileRequestFailed { path: &'a str, reason: &'a str },
    /// Incremental answer text (streaming mode only).
    TextDelta(&'a str),
    /// The final answer of a round.
    Answer(&'a str),
    /// Token usage reported by the API for one model call.
    TokenUsage {
        prompt_tokens: u32,
        completion_tokens: u32,
    },
}

impl ConversationEvent<'_> {
    /// Total tokens of a `TokenUsage` event.
    pub fn total_tokens(&self) -> Option<u64> {
        if let ConversationEvent::TokenUsage {
            prompt_tokens,
            completion_tokens,
        } = self
        {
            Some(*prompt_tokens as u64 + *completion_tokens as u64)
        } else {
            None
        }
    }
}

/// Handler for conversation events.
///
/// # Example
///
/// ```ignore
/// struct Printer;
///
/// impl EventHandler for Printer {
///     fn on_event(&self, event: &ConversationEvent<'_>) {
///         match event {
///             ConversationEvent::Excluded(notice) => eprintln!("warning: {notice}"),
///             ConversationEvent::Answer(text) => println!("{text}"),
///             _ => {}
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &ConversationEvent<'_>) {
        let _ = event;
    }
}

/// Ignores every event.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if let ConversationEvent::TextDelta(delta) = event {
///         print!("{delta}");
///     }
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&ConversationEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&ConversationEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&ConversationEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &ConversationEvent<'_>) {
        (self.0)(event)
    }
}

/// Dispatches every event to several handlers in registration order.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with(my_ui_handler);
/// ```
#[derive(Default)]
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Add a handler only when `condition` holds, keeping the builder chain.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &ConversationEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// Logs events via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &ConversationEvent<'_>) {
        match event {
            ConversationEvent::Progress {
                message,
                current,
                total,
            } => {
                info!("[{current}/{total}] {message}");
            }
            ConversationEvent::Status(message) => info!("{message}"),
            ConversationEvent::Excluded(notice) => warn!("{notice}"),
            ConversationEvent::PromptAssembled {
                usage,
                blocks_included,
                blocks_excluded,
            } => {
                info!(
                    "{} (blocks: {blocks_included} in, {blocks_excluded} out)",
                    usage.to_log_string()
                );
            }
            ConversationEvent::CountingDegraded => {
                warn!("Token counting unavailable; using local estimates");
            }
            ConversationEvent::FileRequested { path } => {
                info!("Model requested file: {path}");
            }
            ConversationEvent::FileRequestFailed { path, reason } => {
                warn!("Could not deliver '{path}': {reason}");
            }
            ConversationEvent::TextDelta(delta) => {
                let preview: String = delta.chars().take(80).collect();
                trace!("Stream text delta: {preview}");
            }
            ConversationEvent::Answer(text) => {
                let preview: String = text.chars().take(200).collect();
                debug!(
                    "Answer: {preview}{}",
                    if text.chars().count() > 200 { "..." } else { "" }
                );
            }
            ConversationEvent::TokenUsage {
                prompt_tokens,
                completion_tokens,
            } => {
                debug!("Tokens: prompt={prompt_tokens}, completion={completion_tokens}");
            }
        }
    }
}
