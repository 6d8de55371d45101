//! Context blocks: the units of project context that compete for the
//! prompt budget.

use super::tokens::TokenCounter;
use crate::{PromptPart, Result};
use serde::{Deserialize, Serialize};

/// What a block contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Rendered project file tree.
    Tree,
    /// One file's summary.
    Summary,
    /// A retrieved fragment of a file.
    Chunk,
    /// A complete file.
    FullFile,
}

impl BlockKind {
    pub fn label(self) -> &'static str {
        match self {
            BlockKind::Tree => "file tree",
            BlockKind::Summary => "summary",
            BlockKind::Chunk => "fragment",
            BlockKind::FullFile => "file",
        }
    }
}

/// How project context reaches the prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    /// Tree, then retrieved summaries, then retrieved chunks.
    #[default]
    Retrieval,
    /// Tree, then whole files, then summaries.
    WholeFile,
}

impl ContextMode {
    /// Priority tier for a block kind. Lower is more important.
    pub fn tier(self, kind: BlockKind) -> u8 {
        match (self, kind) {
            (_, BlockKind::Tree) => 0,
            (ContextMode::Retrieval, BlockKind::Summary) => 1,
            (ContextMode::Retrieval, BlockKind::Chunk | BlockKind::FullFile) => 2,
            (ContextMode::WholeFile, BlockKind::FullFile | BlockKind::Chunk) => 1,
            (ContextMode::WholeFile, BlockKind::Summary) => 2,
        }
    }
}

/// One candidate piece of project context with its measured size.
///
/// The token count is measured once, over the framed user/model pair the
/// block becomes in the prompt, and cannot change afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextBlock {
    kind: BlockKind,
    source_path: String,
    text: String,
    token_count: usize,
    priority_tier: u8,
}

impl ContextBlock {
    /// Build a block and measure its framed size through `counter`.
    pub async fn measure<C: TokenCounter + ?Sized>(
        kind: BlockKind,
        source_path: impl Into<String>,
        text: impl Into<String>,
        mode: ContextMode,
        counter: &C,
    ) -> Result<Self> {
        let source_path = source_path.into();
        let text = text.into();
        let framed = frame(kind, &source_path, &text);
        let token_count = counter.count(&framed).await?;
        Ok(Self {
            kind,
            source_path,
            text,
            token_count,
            priority_tier: mode.tier(kind),
        })
    }

    /// Build a block whose size is already known.
    pub fn with_token_count(
        kind: BlockKind,
        source_path: impl Into<String>,
        text: impl Into<String>,
        token_count: usize,
        priority_tier: u8,
    ) -> Self {
        Self {
            kind,
            source_path: source_path.into(),
            text: text.into(),
            token_count,
            priority_tier,
        }
    }

    /// Override the tier. The measured size is kept.
    pub fn with_priority_tier(mut self, tier: u8) -> Self {
        self.priority_tier = tier;
        self
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn priority_tier(&self) -> u8 {
        self.priority_tier
    }

    /// Short human-readable name, e.g. `summary of src/app.py`.
    pub fn label(&self) -> String {
        if self.source_path.is_empty() {
            self.kind.label().to_string()
        } else {
            format!("{} {}", self.kind.label(), self.source_path)
        }
    }

    /// The user/model pair this block occupies in the prompt.
    pub fn framed(&self) -> [PromptPart; 2] {
        frame(self.kind, &self.source_path, &self.text)
    }
}

fn frame(kind: BlockKind, path: &str, text: &str) -> [PromptPart; 2] {
    let (body, ack) = match kind {
        BlockKind::Tree => (
            format!("**Project file tree:**\n```\n{text}\n```"),
            "OK. Project file tree received.".to_string(),
        ),
        BlockKind::Summary => (
            format!("**Summary of file `{path}`:**\n{text}"),
            format!("OK. Summary of `{path}` received."),
        ),
        BlockKind::Chunk => (
            format!("**Fragment from file `{path}`:**\n```\n{text}\n```"),
            format!("OK. Fragment of `{path}` received."),
        ),
        BlockKind::FullFile => (
            format!("**Content of file `{path}`:**\n```\n{text}\n```"),
            format!("OK. File `{path}` received."),
        ),
    };
    [PromptPart::user(body), PromptPart::model(ack)]
}
