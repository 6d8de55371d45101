//! The budget allocator.
//!
//! [`PromptAssembler::assemble`] combines the instructions, candidate context
//! blocks, a history snapshot and the new query into one role-alternating
//! prompt that fits the [`Budget`]. Allocation is greedy and deterministic:
//!
//! 1. The instructions pair and the query are mandatory. If they alone
//!    exceed the usable budget the round fails with
//!    [`Error::PromptTooLarge`].
//! 2. Blocks are walked by priority tier (stable within a tier). Each block
//!    is accepted whole if it still fits, otherwise skipped; later, smaller
//!    blocks may still be accepted.
//! 3. History is walked newest first. The first turn that does not fit ends
//!    the walk: it and everything older are left out.
//! 4. The finished sequence is counted again as a whole. While it is over
//!    budget the oldest history is dropped; with no history left the round
//!    fails with [`Error::PromptTooLarge`].
//!
//! Final layout:
//!
//! ```text
//! USER  instructions        MODEL ack
//! USER  block (per block)   MODEL ack
//! USER/MODEL history, oldest first, starting with USER and ending with MODEL
//! USER  query
//! ```

use super::block::ContextBlock;
use super::budget::{Budget, ContextUsage};
use super::tokens::{FallbackCounter, TokenCounter};
use crate::conversation::history::{HistorySnapshot, Turn, TurnId};
use crate::{Error, PromptPart, Result, Role};
use std::sync::Arc;
use tracing::{debug, info};

/// Acknowledgment the model "gives" to the instructions pair.
pub const INSTRUCTIONS_ACK: &str =
    "OK. I'm ready. I accept the file request rules and the response language.";

/// Kind of a non-fatal exclusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// A context block did not fit.
    ContextTruncated,
    /// Older history did not fit.
    HistoryTruncated,
}

/// A human-readable note about something left out of the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionNotice {
    pub kind: NoticeKind,
    pub message: String,
}

impl std::fmt::Display for ExclusionNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Everything the assembler needs for one prompt.
#[derive(Debug, Clone, Copy)]
pub struct AssemblyRequest<'a> {
    pub instructions: &'a str,
    pub blocks: &'a [ContextBlock],
    pub history: &'a HistorySnapshot,
    pub query: &'a str,
    pub budget: Budget,
}

/// A prompt that fits its budget.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledPrompt {
    /// Role-alternating sequence to send.
    pub parts: Vec<PromptPart>,
    /// Count of the whole sequence.
    pub total_tokens: usize,
    /// Indices into the request's blocks, in prompt order.
    pub included_blocks: Vec<usize>,
    /// Indices of blocks left out, in the order they were considered.
    pub excluded_blocks: Vec<usize>,
    /// History turns in the prompt, oldest first.
    pub included_turns: Vec<TurnId>,
    /// History turns left out.
    pub excluded_turns: Vec<TurnId>,
    /// Token counts measured for history turns that had none cached.
    pub measured_turns: Vec<(TurnId, usize)>,
    pub notices: Vec<ExclusionNotice>,
    /// Whether any count fell back to the heuristic.
    pub degraded_counting: bool,
    pub usage: ContextUsage,
}

/// Combines instructions, context, history and query under a budget.
#[derive(Clone)]
pub struct PromptAssembler {
    counter: Arc<dyn TokenCounter>,
}

struct Window<'a> {
    turn: &'a Turn,
    tokens: usize,
}

impl PromptAssembler {
    pub fn new(counter: Arc<dyn TokenCounter>) -> Self {
        Self { counter }
    }

    /// The instructions pair that opens every prompt.
    pub fn instructions_pair(instructions: &str) -> [PromptPart; 2] {
        [
            PromptPart::user(instructions),
            PromptPart::model(INSTRUCTIONS_ACK),
        ]
    }

    pub async fn assemble(&self, req: AssemblyRequest<'_>) -> Result<AssembledPrompt> {
        let counter = FallbackCounter::new(self.counter.as_ref());
        let usable = req.budget.usable();

        // Leading system turns from the history join the instructions.
        let instructions = merge_instructions(req.instructions, req.history.system_prefix());
        let head = Self::instructions_pair(&instructions);
        let query = PromptPart::user(req.query);

        // 1. Mandatory parts.
        let mandatory = counter.count_or_estimate(&head).await
            + counter.count_or_estimate(std::slice::from_ref(&query)).await;
        if mandatory > usable {
            return Err(Error::PromptTooLarge {
                required: mandatory,
                usable,
            });
        }
        let mut total = mandatory;
        let mut notices = Vec::new();

        // 2. Context blocks by tier, stable within a tier.
        let mut order: Vec<usize> = (0..req.blocks.len()).collect();
        order.sort_by_key(|&i| req.blocks[i].priority_tier());
        let mut included_blocks = Vec::new();
        let mut excluded_blocks = Vec::new();
        for i in order {
            let block = &req.blocks[i];
            let remaining = usable - total;
            if block.token_count() <= remaining {
                total += block.token_count();
                included_blocks.push(i);
            } else {
                debug!(
                    "Excluding {} ({} tokens, {remaining} remaining)",
                    block.label(),
                    block.token_count()
                );
                excluded_blocks.push(i);
                notices.push(ExclusionNotice {
                    kind: NoticeKind::ContextTruncated,
                    message: format!(
                        "Context {} ({} tokens) left out: only {remaining} tokens remained.",
                        block.label(),
                        block.token_count()
                    ),
                });
            }
        }

        // 3. History, newest first, stopping at the first turn that does not fit.
        let history = req.history.conversational();
        let mut measured_turns = Vec::new();
        let mut window: Vec<Window<'_>> = Vec::new();
        let mut excluded_turns = Vec::new();
        let mut budget_cut = 0usize;
        let mut exhausted = false;
        for turn in history.iter().rev() {
            if exhausted {
                excluded_turns.push(turn.id());
                budget_cut += 1;
                continue;
            }
            let tokens = match turn.token_count() {
                Some(n) => n,
                None => {
                    let n = counter
                        .count_or_estimate(std::slice::from_ref(&turn.to_part()))
                        .await;
                    measured_turns.push((turn.id(), n));
                    n
                }
            };
            if total + tokens <= usable {
                total += tokens;
                window.push(Window { turn, tokens });
            } else {
                exhausted = true;
                excluded_turns.push(turn.id());
                budget_cut += 1;
            }
        }
        window.reverse();

        // Keep the sequence alternating around the window: the block pairs
        // end with MODEL and the query is USER.
        while window.first().is_some_and(|w| w.turn.role != Role::User) {
            let w = window.remove(0);
            debug!("Dropping leading {} turn {} for alternation", w.turn.role, w.turn.id());
            total -= w.tokens;
            excluded_turns.push(w.turn.id());
        }
        while window.last().is_some_and(|w| w.turn.role != Role::Model) {
            if let Some(w) = window.pop() {
                debug!("Dropping trailing {} turn {} for alternation", w.turn.role, w.turn.id());
                total -= w.tokens;
                excluded_turns.push(w.turn.id());
            }
        }

        // 4. Recount the whole sequence and trim history if still over.
        let mut parts = build_parts(&head, req.blocks, &included_blocks, &window, &query);
        let mut final_total = counter.count_or_estimate(&parts).await;
        while final_total > usable {
            if window.is_empty() {
                return Err(Error::PromptTooLarge {
                    required: final_total,
                    usable,
                });
            }
            // Drop the oldest exchange (user + model) so alternation holds.
            for w in window.drain(..2.min(window.len())) {
                excluded_turns.push(w.turn.id());
                budget_cut += 1;
            }
            parts = build_parts(&head, req.blocks, &included_blocks, &window, &query);
            final_total = counter.count_or_estimate(&parts).await;
        }
        if final_total != total {
            debug!("Incremental total {total} vs recount {final_total}");
        }

        if budget_cut > 0 {
            notices.push(ExclusionNotice {
                kind: NoticeKind::HistoryTruncated,
                message: format!(
                    "{budget_cut} older message(s) left out of the prompt to fit the token budget."
                ),
            });
        }

        let usage = req.budget.usage(final_total);
        info!("Prompt assembled: {}", usage.to_log_string());

        Ok(AssembledPrompt {
            parts,
            total_tokens: final_total,
            included_blocks,
            excluded_blocks,
            included_turns: window.iter().map(|w| w.turn.id()).collect(),
            excluded_turns,
            measured_turns,
            notices,
            degraded_counting: counter.is_degraded(),
            usage,
        })
    }
}

fn merge_instructions(instructions: &str, system: &[Turn]) -> String {
    let mut out = instructions.trim().to_string();
    for turn in system {
        let text = turn.text().trim();
        if text.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(text);
    }
    out
}

fn build_parts(
    head: &[PromptPart; 2],
    blocks: &[ContextBlock],
    included: &[usize],
    window: &[Window<'_>],
    query: &PromptPart,
) -> Vec<PromptPart> {
    let mut parts = Vec::with_capacity(3 + included.len() * 2 + window.len());
    parts.extend(head.iter().cloned());
    for &i in included {
        parts.extend(blocks[i].framed());
    }
    parts.extend(window.iter().map(|w| w.turn.to_part()));
    parts.push(query.clone());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::block::BlockKind;
    use crate::context::tokens::{CountFuture, HeuristicCounter, TokenCounter, validate_alternation};
    use crate::testing::{FailingCounter, TableCounter};

    fn block(text: &str, tokens: usize, tier: u8) -> ContextBlock {
        ContextBlock::with_token_count(BlockKind::Chunk, text, text, tokens, tier)
    }

    fn table() -> Arc<TableCounter> {
        Arc::new(
            TableCounter::new()
                .with("RULES", 50)
                .with("QUERY", 20)
                .with("block-", 400)
                .with("old-", 30),
        )
    }

    /// Adds a fixed cost to whole-sequence counts (more than three parts),
    /// like the framing a remote tokenizer charges beyond the sum of parts.
    struct SequenceOverhead {
        inner: TableCounter,
        extra: usize,
    }

    impl TokenCounter for SequenceOverhead {
        fn count<'a>(&'a self, parts: &'a [PromptPart]) -> CountFuture<'a> {
            let extra = if parts.len() > 3 { self.extra } else { 0 };
            let inner = self.inner.count(parts);
            Box::pin(async move { Ok(inner.await? + extra) })
        }
    }

    fn overhead(extra: usize, table: TableCounter) -> Arc<SequenceOverhead> {
        Arc::new(SequenceOverhead { inner: table, extra })
    }

    fn request<'a>(
        blocks: &'a [ContextBlock],
        history: &'a HistorySnapshot,
        budget: Budget,
    ) -> AssemblyRequest<'a> {
        AssemblyRequest {
            instructions: "RULES",
            blocks,
            history,
            query: "QUERY",
            budget,
        }
    }

    #[tokio::test]
    async fn fills_blocks_in_priority_order_and_skips_overflow() {
        let blocks = vec![
            block("block-1", 400, 1),
            block("block-2", 400, 1),
            block("block-3", 400, 2),
        ];
        let history = HistorySnapshot::default();
        let assembler = PromptAssembler::new(table());
        let out = assembler
            .assemble(request(&blocks, &history, Budget::new(1000, 0)))
            .await
            .unwrap();

        assert_eq!(out.total_tokens, 870);
        assert_eq!(out.included_blocks, vec![0, 1]);
        assert_eq!(out.excluded_blocks, vec![2]);
        assert_eq!(out.notices.len(), 1);
        assert_eq!(out.notices[0].kind, NoticeKind::ContextTruncated);
        assert!(!out.degraded_counting);
        validate_alternation(&out.parts).unwrap();
    }

    #[tokio::test]
    async fn smaller_later_block_still_fits_after_a_skip() {
        let blocks = vec![block("block-big", 2000, 0), block("tiny", 0, 1)];
        let history = HistorySnapshot::default();
        let out = PromptAssembler::new(table())
            .assemble(request(&blocks, &history, Budget::new(1000, 0)))
            .await
            .unwrap();
        assert_eq!(out.excluded_blocks, vec![0]);
        assert_eq!(out.included_blocks, vec![1]);
    }

    #[tokio::test]
    async fn tier_sort_is_stable() {
        let blocks = vec![block("a", 1, 2), block("b", 1, 0), block("c", 1, 2), block("d", 1, 0)];
        let history = HistorySnapshot::default();
        let out = PromptAssembler::new(table())
            .assemble(request(&blocks, &history, Budget::new(1000, 0)))
            .await
            .unwrap();
        assert_eq!(out.included_blocks, vec![1, 3, 0, 2]);
    }

    #[tokio::test]
    async fn mandatory_overflow_is_prompt_too_large() {
        let history = HistorySnapshot::default();
        let err = PromptAssembler::new(table())
            .assemble(request(&[], &history, Budget::new(60, 0)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::PromptTooLarge {
                required: 70,
                usable: 60
            }
        ));
    }

    #[tokio::test]
    async fn history_keeps_newest_and_stops_at_first_misfit() {
        let turns = vec![
            Turn::user("old-q1"),
            Turn::model("old-a1"),
            Turn::user("old-q2"),
            Turn::model("old-a2"),
        ];
        let manager = crate::conversation::history::HistoryManager::from_turns(turns);
        let history = manager.snapshot_for_prompt();
        // 70 mandatory + room for two 30-token turns.
        let out = PromptAssembler::new(table())
            .assemble(request(&[], &history, Budget::new(130, 0)))
            .await
            .unwrap();
        let kept: Vec<&str> = out
            .included_turns
            .iter()
            .map(|id| manager.get(*id).unwrap().text())
            .collect();
        assert_eq!(kept, vec!["old-q2", "old-a2"]);
        assert_eq!(out.total_tokens, 130);
        assert!(
            out.notices
                .iter()
                .any(|n| n.kind == NoticeKind::HistoryTruncated)
        );
        assert_eq!(out.measured_turns.len(), 3);
        validate_alternation(&out.parts).unwrap();
    }

    #[tokio::test]
    async fn recount_overflow_drops_the_oldest_exchange() {
        let manager = crate::conversation::history::HistoryManager::from_turns(vec![
            Turn::user("old-q1"),
            Turn::model("old-a1"),
            Turn::user("old-q2"),
            Turn::model("old-a2"),
        ]);
        let history = manager.snapshot_for_prompt();
        let counter = overhead(
            25,
            TableCounter::new().with("RULES", 10).with("QUERY", 10).with("old-", 10),
        );
        // The per-part sum is 60, but the full sequence counts 85.
        let out = PromptAssembler::new(counter)
            .assemble(request(&[], &history, Budget::new(80, 0)))
            .await
            .unwrap();

        let kept: Vec<&str> = out
            .included_turns
            .iter()
            .map(|id| manager.get(*id).unwrap().text())
            .collect();
        assert_eq!(kept, vec!["old-q2", "old-a2"]);
        assert_eq!(out.excluded_turns.len(), 2);
        assert_eq!(out.total_tokens, 65);
        assert!(
            out.notices
                .iter()
                .any(|n| n.kind == NoticeKind::HistoryTruncated && n.message.starts_with("2 "))
        );
        validate_alternation(&out.parts).unwrap();
    }

    #[tokio::test]
    async fn recount_overflow_without_history_is_prompt_too_large() {
        let blocks = vec![block("block-1", 40, 1)];
        let history = HistorySnapshot::default();
        let counter = overhead(
            25,
            TableCounter::new().with("RULES", 10).with("QUERY", 10).with("block-", 40),
        );
        let err = PromptAssembler::new(counter)
            .assemble(request(&blocks, &history, Budget::new(80, 0)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::PromptTooLarge {
                required: 85,
                usable: 80
            }
        ));
    }

    #[tokio::test]
    async fn dangling_user_turn_is_dropped_before_query() {
        let manager = crate::conversation::history::HistoryManager::from_turns(vec![
            Turn::user("old-q1"),
            Turn::model("old-a1"),
            Turn::user("old-unanswered"),
        ]);
        let history = manager.snapshot_for_prompt();
        let out = PromptAssembler::new(table())
            .assemble(request(&[], &history, Budget::new(1000, 0)))
            .await
            .unwrap();
        assert_eq!(out.included_turns.len(), 2);
        assert_eq!(out.parts.last().unwrap().text, "QUERY");
        validate_alternation(&out.parts).unwrap();
    }

    #[tokio::test]
    async fn system_prefix_joins_the_instructions() {
        let manager = crate::conversation::history::HistoryManager::from_turns(vec![
            Turn::system("Prefer short answers."),
            Turn::user("q"),
            Turn::model("a"),
        ]);
        let history = manager.snapshot_for_prompt();
        let out = PromptAssembler::new(Arc::new(HeuristicCounter::default()))
            .assemble(request(&[], &history, Budget::new(10_000, 0)))
            .await
            .unwrap();
        assert!(out.parts[0].text.contains("Prefer short answers."));
        assert!(out.parts.iter().all(|p| p.role != Role::System));
    }

    #[tokio::test]
    async fn failing_counter_degrades_to_heuristic() {
        let blocks = vec![ContextBlock::with_token_count(
            BlockKind::Summary,
            "a.rs",
            "summary",
            10,
            1,
        )];
        let history = HistorySnapshot::default();
        let out = PromptAssembler::new(Arc::new(FailingCounter))
            .assemble(request(&blocks, &history, Budget::new(10_000, 0)))
            .await
            .unwrap();
        assert!(out.degraded_counting);
        assert!(!out.parts.is_empty());
        assert!(out.total_tokens <= 10_000);
    }

    #[tokio::test]
    async fn assembly_is_deterministic() {
        let blocks = vec![
            block("block-1", 400, 2),
            block("block-2", 400, 1),
            block("block-3", 400, 0),
        ];
        let history = HistorySnapshot::default();
        let assembler = PromptAssembler::new(table());
        let a = assembler
            .assemble(request(&blocks, &history, Budget::new(1000, 0)))
            .await
            .unwrap();
        let b = assembler
            .assemble(request(&blocks, &history, Budget::new(1000, 0)))
            .await
            .unwrap();
        assert_eq!(a.included_blocks, b.included_blocks);
        assert_eq!(a.excluded_blocks, b.excluded_blocks);
        assert_eq!(a.parts, b.parts);
    }

    #[tokio::test]
    async fn reserve_and_margin_shrink_the_usable_budget() {
        let blocks = vec![block("block-1", 400, 1)];
        let history = HistorySnapshot::default();
        let budget = Budget::new(1000, 400).with_safety_margin(200);
        let out = PromptAssembler::new(table())
            .assemble(request(&blocks, &history, budget))
            .await
            .unwrap();
        assert_eq!(out.excluded_blocks, vec![0]);
        assert!(out.total_tokens + budget.reserved_for_response <= budget.hard_limit);
    }
}
