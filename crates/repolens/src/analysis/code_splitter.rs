//! Syntax-aware chunking with tree-sitter.
//!
//! For a supported language the file is parsed and cut at top-level
//! definitions (functions, classes, impls and the like). Code between
//! definitions becomes its own chunk. A definition still much larger than
//! the chunk size is split again by the character splitter. Unsupported
//! files, files that fail to parse and files without any definition go to
//! the character splitter directly.

use super::splitter::RecursiveCharacterSplitter;
use std::path::Path;
use tracing::debug;
use tree_sitter::{Node, Parser};

/// How deep below the root definitions are looked for.
const MAX_DEPTH: usize = 4;

/// Languages with a bundled grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeLanguage {
    Rust,
    Python,
    JavaScript,
    TypeScript,
}

impl CodeLanguage {
    /// Detect the language from a file extension (case insensitive).
    pub fn from_path(path: &str) -> Option<Self> {
        let ext = Path::new(path).extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "rs" => Some(CodeLanguage::Rust),
            "py" | "pyw" => Some(CodeLanguage::Python),
            "js" | "mjs" | "cjs" => Some(CodeLanguage::JavaScript),
            "ts" => Some(CodeLanguage::TypeScript),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CodeLanguage::Rust => "rust",
            CodeLanguage::Python => "python",
            CodeLanguage::JavaScript => "javascript",
            CodeLanguage::TypeScript => "typescript",
        }
    }

    fn grammar(self) -> tree_sitter::Language {
        match self {
            CodeLanguage::Rust => tree_sitter_rust::LANGUAGE.into(),
            CodeLanguage::Python => tree_sitter_python::LANGUAGE.into(),
            CodeLanguage::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
            CodeLanguage::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
        }
    }

    /// Node kinds a file is cut at.
    fn split_kinds(self) -> &'static [&'static str] {
        match self {
            CodeLanguage::Rust => &["function_item", "struct_item", "enum_item", "impl_item"],
            CodeLanguage::Python => &[
                "function_definition",
                "class_definition",
                "decorated_definition",
            ],
            CodeLanguage::JavaScript => &[
                "function_declaration",
                "class_declaration",
                "method_definition",
            ],
            CodeLanguage::TypeScript => &[
                "function_declaration",
                "class_declaration",
                "method_definition",
                "interface_declaration",
            ],
        }
    }
}

/// Picks syntax-aware or character chunking per file.
#[derive(Debug, Clone, Default)]
pub struct CodeSplitter {
    fallback: RecursiveCharacterSplitter,
}

impl CodeSplitter {
    pub fn new(fallback: RecursiveCharacterSplitter) -> Self {
        Self { fallback }
    }

    /// Chunk the content of the file at `path`.
    pub fn split(&self, path: &str, text: &str) -> Vec<String> {
        let Some(language) = CodeLanguage::from_path(path) else {
            return self.fallback.split_text(text);
        };
        match self.split_code(language, text) {
            Some(chunks) => {
                debug!("'{path}' split by {} syntax", language.as_str());
                chunks
            }
            None => {
                debug!(
                    "No {} definitions found in '{path}'; using character chunks",
                    language.as_str()
                );
                self.fallback.split_text(text)
            }
        }
    }

    fn split_code(&self, language: CodeLanguage, text: &str) -> Option<Vec<String>> {
        let mut parser = Parser::new();
        parser.set_language(&language.grammar()).ok()?;
        let tree = parser.parse(text, None)?;

        let mut spans = Vec::new();
        collect_spans(tree.root_node(), language.split_kinds(), 0, &mut spans);
        if spans.is_empty() {
            return None;
        }
        spans.sort_unstable();

        let mut pieces = Vec::new();
        let mut last_end = 0;
        for (start, end) in spans {
            if start < last_end {
                continue;
            }
            push_trimmed(&mut pieces, text.get(last_end..start));
            push_trimmed(&mut pieces, text.get(start..end));
            last_end = end;
        }
        push_trimmed(&mut pieces, text.get(last_end..));

        // A little slack before a definition is cut further.
        let limit = self.fallback.chunk_size() * 6 / 5;
        let mut chunks = Vec::with_capacity(pieces.len());
        for piece in pieces {
            if piece.chars().count() > limit {
                chunks.extend(self.fallback.split_text(&piece));
            } else {
                chunks.push(piece);
            }
        }
        Some(chunks)
    }
}

/// Byte spans of the outermost nodes of `kinds` under `node`.
fn collect_spans(node: Node<'_>, kinds: &[&str], depth: usize, out: &mut Vec<(usize, usize)>) {
    if depth > MAX_DEPTH {
        return;
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if kinds.contains(&child.kind()) {
            out.push((child.start_byte(), child.end_byte()));
        } else {
            collect_spans(child, kinds, depth + 1, out);
        }
    }
}

fn push_trimmed(pieces: &mut Vec<String>, text: Option<&str>) {
    if let Some(text) = text.map(str::trim)
        && !text.is_empty()
    {
        pieces.push(text.to_string());
    }
}
