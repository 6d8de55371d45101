//! The conversation turn log and its normalization for prompting.
//!
//! Turns are append-only: their text never changes after creation. Only the
//! `included` flag and the cached token count can be updated. Before every
//! round the log is turned into an immutable [`HistorySnapshot`] by
//! [`collapse_same_role_runs`], which guarantees that the conversational
//! part strictly alternates between user and model.

use crate::{Error, Result, Role};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Stable identifier of a turn within one [`HistoryManager`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TurnId(pub u64);

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

fn included_default() -> bool {
    true
}

/// One message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Assigned on append; not persisted.
    #[serde(skip)]
    id: TurnId,
    pub role: Role,
    text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_count: Option<usize>,
    #[serde(default = "included_default")]
    pub included: bool,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: TurnId::default(),
            role,
            text: text.into(),
            token_count: None,
            included: true,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::new(Role::Model, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn id(&self) -> TurnId {
        self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Token count measured by an earlier round, if any.
    pub fn token_count(&self) -> Option<usize> {
        self.token_count
    }

    pub fn to_part(&self) -> crate::PromptPart {
        crate::PromptPart {
            role: self.role,
            text: self.text.clone(),
        }
    }
}

// ── Normalization ──────────────────────────────────────────────────

/// Why the normalization pass dropped a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// A later user turn followed without a model reply in between.
    SupersededUser,
    /// A model turn followed another model turn.
    RepeatedModel,
    /// A system turn appeared after the conversation started.
    LateSystem,
}

/// A turn removed by [`collapse_same_role_runs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscardedTurn {
    pub id: TurnId,
    pub role: Role,
    pub reason: DiscardReason,
}

/// Normalize included turns for prompting.
///
/// Excluded turns are skipped first. Of consecutive user turns only the
/// latest is kept; of consecutive model turns only the earliest is kept.
/// System turns survive only as a leading prefix.
pub fn collapse_same_role_runs(turns: &[Turn]) -> (Vec<Turn>, Vec<DiscardedTurn>) {
    let mut cleaned: Vec<Turn> = Vec::with_capacity(turns.len());
    let mut discarded = Vec::new();
    let mut conversation_started = false;

    for turn in turns.iter().filter(|t| t.included) {
        match turn.role {
            Role::System if conversation_started => {
                discarded.push(discard(turn, DiscardReason::LateSystem));
            }
            Role::System => cleaned.push(turn.clone()),
            Role::User => {
                conversation_started = true;
                if let Some(last) = cleaned.last_mut()
                    && last.role == Role::User
                {
                    discarded.push(discard(last, DiscardReason::SupersededUser));
                    *last = turn.clone();
                } else {
                    cleaned.push(turn.clone());
                }
            }
            Role::Model => {
                conversation_started = true;
                if cleaned.last().is_some_and(|t| t.role == Role::Model) {
                    discarded.push(discard(turn, DiscardReason::RepeatedModel));
                } else {
                    cleaned.push(turn.clone());
                }
            }
        }
    }

    for d in &discarded {
        debug!("History cleanup dropped {} turn {} ({:?})", d.role, d.id, d.reason);
    }
    (cleaned, discarded)
}

fn discard(turn: &Turn, reason: DiscardReason) -> DiscardedTurn {
    DiscardedTurn {
        id: turn.id,
        role: turn.role,
        reason,
    }
}

/// An immutable, normalized view of the history taken at round start.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistorySnapshot {
    system: Vec<Turn>,
    turns: Vec<Turn>,
    discarded: Vec<DiscardedTurn>,
}

impl HistorySnapshot {
    /// Normalize `turns` into a snapshot.
    pub fn from_turns(turns: &[Turn]) -> Self {
        let (cleaned, discarded) = collapse_same_role_runs(turns);
        let split = cleaned
            .iter()
            .position(|t| t.role != Role::System)
            .unwrap_or(cleaned.len());
        let mut system = cleaned;
        let turns = system.split_off(split);
        Self {
            system,
            turns,
            discarded,
        }
    }

    /// Leading system turns.
    pub fn system_prefix(&self) -> &[Turn] {
        &self.system
    }

    /// Alternating user/model turns, oldest first.
    pub fn conversational(&self) -> &[Turn] {
        &self.turns
    }

    pub fn discarded(&self) -> &[DiscardedTurn] {
        &self.discarded
    }

    pub fn is_empty(&self) -> bool {
        self.system.is_empty() && self.turns.is_empty()
    }
}

// ── Manager ────────────────────────────────────────────────────────

/// Owns the ordered turn log of one conversation.
#[derive(Debug, Clone, Default)]
pub struct HistoryManager {
    turns: Vec<Turn>,
    next_id: u64,
}

impl HistoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted turns. Ids are assigned afresh.
    pub fn from_turns(turns: Vec<Turn>) -> Self {
        let mut history = Self::new();
        for turn in turns {
            history.append(turn);
        }
        history
    }

    /// Append a turn and return its id.
    pub fn append(&mut self, mut turn: Turn) -> TurnId {
        let id = TurnId(self.next_id);
        self.next_id += 1;
        turn.id = id;
        self.turns.push(turn);
        id
    }

    pub fn set_included(&mut self, id: TurnId, included: bool) -> Result<()> {
        let turn = self.get_mut(id)?;
        turn.included = included;
        debug!("Turn {id} included={included}");
        Ok(())
    }

    /// Flip a turn's inclusion and return the new value.
    pub fn toggle_included(&mut self, id: TurnId) -> Result<bool> {
        let turn = self.get_mut(id)?;
        turn.included = !turn.included;
        Ok(turn.included)
    }

    /// Cache a measured token count. The text is untouched.
    pub fn record_token_count(&mut self, id: TurnId, tokens: usize) {
        if let Ok(turn) = self.get_mut(id) {
            turn.token_count = Some(tokens);
        }
    }

    pub fn get(&self, id: TurnId) -> Option<&Turn> {
        self.turns.iter().find(|t| t.id == id)
    }

    fn get_mut(&mut self, id: TurnId) -> Result<&mut Turn> {
        self.turns
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| Error::InvalidInput(format!("no turn with id {id}")))
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Text of the most recent user turn.
    pub fn last_user_text(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.text())
    }

    pub fn snapshot_for_prompt(&self) -> HistorySnapshot {
        HistorySnapshot::from_turns(&self.turns)
    }
}
