//! Token counting behind a small capability trait.
//!
//! The remote counter is a fallible network call. Counting degradation is
//! never fatal: [`FallbackCounter`] substitutes the deterministic
//! [`HeuristicCounter`] estimate whenever the primary counter fails, and
//! records that it did so.

use crate::api::LlmClient;
use crate::{Error, PromptPart, Result, Role};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{trace, warn};

/// Default characters per token (conservative estimate for English text and
/// code). Most tokenizers average 3-4 chars per token.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Boxed future returned by [`TokenCounter::count`].
pub type CountFuture<'a> = Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>>;

/// Counts the tokens of a role-tagged sequence.
pub trait TokenCounter: Send + Sync {
    fn count<'a>(&'a self, parts: &'a [PromptPart]) -> CountFuture<'a>;
}

impl<T: TokenCounter + ?Sized> TokenCounter for &T {
    fn count<'a>(&'a self, parts: &'a [PromptPart]) -> CountFuture<'a> {
        (**self).count(parts)
    }
}

impl<T: TokenCounter + ?Sized> TokenCounter for Arc<T> {
    fn count<'a>(&'a self, parts: &'a [PromptPart]) -> CountFuture<'a> {
        (**self).count(parts)
    }
}

// ── Heuristic ──────────────────────────────────────────────────────

/// Network-free estimate: `ceil(chars / chars_per_token)` per part.
#[derive(Debug, Clone, Copy)]
pub struct HeuristicCounter {
    chars_per_token: f64,
}

impl Default for HeuristicCounter {
    fn default() -> Self {
        Self {
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

impl HeuristicCounter {
    /// Use a calibrated ratio. Non-positive ratios fall back to the default.
    pub fn with_ratio(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token > 0.0 {
            chars_per_token
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        Self { chars_per_token }
    }

    pub fn estimate(&self, parts: &[PromptPart]) -> usize {
        parts
            .iter()
            .map(|p| (p.char_len() as f64 / self.chars_per_token).ceil() as usize)
            .sum()
    }
}

impl TokenCounter for HeuristicCounter {
    fn count<'a>(&'a self, parts: &'a [PromptPart]) -> CountFuture<'a> {
        let n = self.estimate(parts);
        Box::pin(async move { Ok(n) })
    }
}

// ── Remote ─────────────────────────────────────────────────────────

/// Check the counting API's precondition: system parts only as a leading
/// prefix, and no two consecutive parts with the same conversational role.
pub fn validate_alternation(parts: &[PromptPart]) -> Result<()> {
    let mut prev: Option<Role> = None;
    for (i, part) in parts.iter().enumerate() {
        match (prev, part.role) {
            (Some(Role::User | Role::Model), Role::System) => {
                return Err(Error::CountingUnavailable(format!(
                    "system part at position {i} follows conversation parts"
                )));
            }
            (Some(a), b) if a == b && b != Role::System => {
                return Err(Error::CountingUnavailable(format!(
                    "consecutive {b} parts at position {i}"
                )));
            }
            _ => {}
        }
        prev = Some(part.role);
    }
    Ok(())
}

/// Counts through the model provider's token-counting endpoint.
pub struct RemoteCounter {
    client: Arc<dyn LlmClient>,
}

impl RemoteCounter {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }
}

impl TokenCounter for RemoteCounter {
    fn count<'a>(&'a self, parts: &'a [PromptPart]) -> CountFuture<'a> {
        Box::pin(async move {
            validate_alternation(parts)?;
            self.client.count_tokens(parts).await.map_err(|e| match e {
                Error::CountingUnavailable(_) => e,
                other => Error::CountingUnavailable(other.to_string()),
            })
        })
    }
}

// ── Fallback ───────────────────────────────────────────────────────

/// Wraps a primary counter and falls back to a heuristic estimate on any
/// failure. Never errors and never retries.
pub struct FallbackCounter<C> {
    primary: C,
    heuristic: HeuristicCounter,
    degraded: AtomicUsize,
}

impl<C: TokenCounter> FallbackCounter<C> {
    pub fn new(primary: C) -> Self {
        Self::with_heuristic(primary, HeuristicCounter::default())
    }

    pub fn with_heuristic(primary: C, heuristic: HeuristicCounter) -> Self {
        Self {
            primary,
            heuristic,
            degraded: AtomicUsize::new(0),
        }
    }

    /// Count with the primary counter, or estimate if it fails.
    pub async fn count_or_estimate(&self, parts: &[PromptPart]) -> usize {
        match self.primary.count(parts).await {
            Ok(n) => {
                trace!("counted {n} tokens over {} part(s)", parts.len());
                n
            }
            Err(e) => {
                let estimate = self.heuristic.estimate(parts);
                self.degraded.fetch_add(1, Ordering::Relaxed);
                warn!("Token counting degraded ({e}); using heuristic estimate of {estimate}");
                estimate
            }
        }
    }

    /// Number of counts that fell back to the heuristic.
    pub fn degraded_count(&self) -> usize {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded_count() > 0
    }
}

impl<C: TokenCounter> TokenCounter for FallbackCounter<C> {
    fn count<'a>(&'a self, parts: &'a [PromptPart]) -> CountFuture<'a> {
        Box::pin(async move { Ok(self.count_or_estimate(parts).await) })
    }
}
