//! Prompt token budget: the model's hard window minus what must stay free.
//!
//! `usable = hard_limit - reserved_for_response - safety_margin`, saturating
//! at zero. Every assembled prompt must fit inside `usable`.

use serde::{Deserialize, Serialize};

/// Threshold fractions of the usable budget at which a round reports that
/// the window is filling up.
const WARNING_THRESHOLD: f64 = 0.60;
const CRITICAL_THRESHOLD: f64 = 0.80;

/// Token budget for one assembled prompt.
///
/// # Example
///
/// ```ignore
/// let budget = Budget::new(1_048_576, 65_536).with_safety_margin(2048);
/// assert_eq!(budget.usable(), 1_048_576 - 65_536 - 2048);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// The model's context window in tokens.
    pub hard_limit: usize,
    /// Tokens kept free for the model's reply.
    pub reserved_for_response: usize,
    /// Tokens kept free to absorb counting error.
    pub safety_margin: usize,
}

impl Budget {
    /// A budget with no safety margin.
    pub fn new(hard_limit: usize, reserved_for_response: usize) -> Self {
        Self {
            hard_limit,
            reserved_for_response,
            safety_margin: 0,
        }
    }

    /// A budget for a model window with the default safety margin (1% of the
    /// window, at least 256 tokens, never more than the window).
    pub fn for_window(hard_limit: usize, reserved_for_response: usize) -> Self {
        Self::new(hard_limit, reserved_for_response)
            .with_safety_margin(default_safety_margin(hard_limit))
    }

    pub fn with_safety_margin(mut self, tokens: usize) -> Self {
        self.safety_margin = tokens;
        self
    }

    /// Tokens available to the prompt.
    pub fn usable(&self) -> usize {
        self.hard_limit
            .saturating_sub(self.reserved_for_response)
            .saturating_sub(self.safety_margin)
    }

    /// Whether a prompt of `tokens` fits.
    pub fn fits(&self, tokens: usize) -> bool {
        tokens <= self.usable()
    }

    /// Snapshot of how much of the usable budget `tokens` consumes.
    pub fn usage(&self, tokens: usize) -> ContextUsage {
        let usable = self.usable();
        let usage_pct = if usable > 0 {
            tokens as f64 / usable as f64
        } else {
            1.0
        };
        ContextUsage {
            prompt_tokens: tokens,
            usable_tokens: usable,
            usage_pct,
        }
    }

    /// A short notice when `tokens` crosses 60% or 80% of the usable budget.
    pub fn advisory(&self, tokens: usize) -> Option<String> {
        let usage = self.usage(tokens);
        if usage.usage_pct >= CRITICAL_THRESHOLD {
            Some(format!(
                "Context window nearly full: ~{:.0}% used ({} of {} tokens). \
                 Older messages will be dropped first.",
                usage.usage_pct * 100.0,
                usage.prompt_tokens,
                usage.usable_tokens,
            ))
        } else if usage.usage_pct >= WARNING_THRESHOLD {
            Some(format!(
                "Context window ~{:.0}% used.",
                usage.usage_pct * 100.0
            ))
        } else {
            None
        }
    }
}

fn default_safety_margin(hard_limit: usize) -> usize {
    (hard_limit / 100).max(256).min(hard_limit)
}

/// Snapshot of budget usage for one prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextUsage {
    pub prompt_tokens: usize,
    pub usable_tokens: usize,
    /// Usage as a fraction (0.0 to 1.0).
    pub usage_pct: f64,
}

impl ContextUsage {
    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "context: {} tokens ({:.0}% of {})",
            self.prompt_tokens,
            self.usage_pct * 100.0,
            self.usable_tokens,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_subtracts_reserve_and_margin() {
        let budget = Budget::new(200_000, 4096).with_safety_margin(1000);
        assert_eq!(budget.usable(), 200_000 - 4096 - 1000);
    }

    #[test]
    fn usable_saturates_at_zero() {
        let budget = Budget::new(1000, 800).with_safety_margin(500);
        assert_eq!(budget.usable(), 0);
        assert!(budget.fits(0));
        assert!(!budget.fits(1));
    }

    #[test]
    fn default_margin_is_one_percent_with_floor() {
        assert_eq!(Budget::for_window(1_048_576, 0).safety_margin, 10_485);
        assert_eq!(Budget::for_window(10_000, 0).safety_margin, 256);
        assert_eq!(Budget::for_window(100, 0).safety_margin, 100);
    }

    #[test]
    fn fits_is_inclusive() {
        let budget = Budget::new(1000, 0);
        assert!(budget.fits(1000));
        assert!(!budget.fits(1001));
    }

    #[test]
    fn advisory_thresholds() {
        let budget = Budget::new(1000, 0);
        assert!(budget.advisory(500).is_none());
        assert!(budget.advisory(650).unwrap().contains("65%"));
        assert!(budget.advisory(870).unwrap().contains("nearly full"));
    }

    #[test]
    fn usage_log_string_format() {
        let log = Budget::new(1000, 0).usage(870).to_log_string();
        assert_eq!(log, "context: 870 tokens (87% of 1000)");
    }
}
