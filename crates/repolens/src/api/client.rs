//! The [`LlmClient`] trait: everything the conversation needs from a model
//! provider.

use crate::{PromptPart, Result};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by [`LlmClient`] methods.
///
/// Type alias to keep trait signatures and implementations readable.
pub type LlmFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Token usage statistics reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

/// A completed generation.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub text: String,
    pub usage: Option<UsageInfo>,
    pub finish_reason: Option<String>,
}

impl Generation {
    /// A generation carrying only text (no usage or finish reason).
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// A model provider.
///
/// Implementations must map provider failures onto crate errors:
/// rate limits to [`Error::RateLimited`](crate::Error::RateLimited), missing
/// or rejected credentials to [`Error::Configuration`](crate::Error::Configuration),
/// counting failures to [`Error::CountingUnavailable`](crate::Error::CountingUnavailable),
/// and an aborted in-flight call to [`Error::Cancelled`](crate::Error::Cancelled).
///
/// Uses boxed futures so that the trait is dyn-compatible.
pub trait LlmClient: Send + Sync {
    /// Install (or replace) the API key.
    fn configure(&self, api_key: &str) -> Result<()>;

    /// Select the model used for counting and generation. Providers with a
    /// single model ignore this.
    fn set_model(&self, model: &str) {
        let _ = model;
    }

    /// Whether an API key is installed.
    fn is_configured(&self) -> bool;

    /// Names of the models that support text generation.
    fn list_models(&self) -> LlmFuture<'_, Vec<String>>;

    /// Count the tokens of a role-tagged sequence.
    fn count_tokens<'a>(&'a self, parts: &'a [PromptPart]) -> LlmFuture<'a, usize>;

    /// Generate a reply to `parts`.
    fn generate<'a>(
        &'a self,
        parts: &'a [PromptPart],
        max_output_tokens: u32,
    ) -> LlmFuture<'a, Generation>;

    /// Generate a reply, calling `on_chunk` with each text delta as it
    /// arrives. The default implementation delivers the whole reply as a
    /// single chunk.
    fn generate_stream<'a>(
        &'a self,
        parts: &'a [PromptPart],
        max_output_tokens: u32,
        on_chunk: &'a (dyn Fn(&str) + Send + Sync),
    ) -> LlmFuture<'a, Generation> {
        Box::pin(async move {
            let generation = self.generate(parts, max_output_tokens).await?;
            on_chunk(&generation.text);
            Ok(generation)
        })
    }

    /// Abort the in-flight generation, if any. Cooperative: the call in
    /// progress resolves to `Error::Cancelled`.
    fn cancel(&self);
}
