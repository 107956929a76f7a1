//! Engine-native document tree.
//!
//! The stored form is a list of block nodes, each carrying text leaves:
//!
//! ```json
//! [{ "type": "paragraph", "children": [{ "text": "hello" }] }]
//! ```
//!
//! The loader is lenient: stored content may arrive already parsed or as a
//! JSON-encoded string, and bare leaves (`{ "text": "hello" }`) are accepted
//! as one-leaf paragraphs. Anything absent, empty or malformed falls back to
//! a single empty paragraph.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PARAGRAPH: &str = "paragraph";

/// A run of text inside a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leaf {
    pub text: String,
}

/// A block-level node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    #[serde(rename = "type")]
    pub kind: String,
    pub children: Vec<Leaf>,
}

impl Block {
    pub fn paragraph(text: impl Into<String>) -> Self {
        Self {
            kind: PARAGRAPH.to_string(),
            children: vec![Leaf { text: text.into() }],
        }
    }

    /// Concatenated text of all leaves.
    pub fn text(&self) -> String {
        self.children.iter().map(|l| l.text.as_str()).collect()
    }
}

/// Whole-document content as written to durable storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentContent {
    blocks: Vec<Block>,
}

impl Default for DocumentContent {
    fn default() -> Self {
        Self::empty()
    }
}

impl DocumentContent {
    /// The starter document: one empty paragraph.
    pub fn empty() -> Self {
        Self {
            blocks: vec![Block::paragraph("")],
        }
    }

    pub fn from_blocks(blocks: Vec<Block>) -> Self {
        if blocks.is_empty() {
            return Self::empty();
        }
        Self { blocks }
    }

    /// Build from flat text, one paragraph per line.
    pub fn from_text(text: &str) -> Self {
        Self::from_blocks(text.split('\n').map(Block::paragraph).collect())
    }

    /// Flatten to text, paragraphs separated by `\n`.
    pub fn to_text(&self) -> String {
        self.blocks
            .iter()
            .map(Block::text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// True for the starter document (no text anywhere).
    pub fn is_blank(&self) -> bool {
        self.blocks.iter().all(|b| b.children.iter().all(|l| l.text.is_empty()))
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Array(Vec::new()))
    }

    /// Parse stored content, falling back to [`DocumentContent::empty`].
    ///
    /// Accepts a parsed array, a JSON-encoded string holding an array, or
    /// nothing at all.
    pub fn from_stored(content: Option<&Value>) -> Self {
        match content {
            None | Some(Value::Null) => {
                log::debug!("No stored content, using starter document");
                Self::empty()
            }
            Some(Value::String(encoded)) => match serde_json::from_str::<Value>(encoded) {
                Ok(parsed) => Self::from_value(&parsed),
                Err(e) => {
                    log::warn!("Stored content is not valid JSON, using starter document: {e}");
                    Self::empty()
                }
            },
            Some(value) => Self::from_value(value),
        }
    }

    fn from_value(value: &Value) -> Self {
        let nodes = match value.as_array() {
            Some(nodes) if !nodes.is_empty() => nodes,
            _ => {
                log::warn!("Stored content is empty or not an array, using starter document");
                return Self::empty();
            }
        };

        let mut blocks = Vec::with_capacity(nodes.len());
        for node in nodes {
            match block_from_node(node) {
                Some(block) => blocks.push(block),
                None => {
                    log::warn!("Stored content has a malformed node, using starter document");
                    return Self::empty();
                }
            }
        }
        Self::from_blocks(blocks)
    }
}

/// Either `{ type?, children: [...] }` or a bare `{ text }` leaf.
fn block_from_node(node: &Value) -> Option<Block> {
    let obj = node.as_object()?;

    if let Some(children) = obj.get("children").and_then(Value::as_array) {
        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or(PARAGRAPH)
            .to_string();
        let mut text = String::new();
        for child in children {
            collect_text(child, &mut text)?;
        }
        return Some(Block {
            kind,
            children: vec![Leaf { text }],
        });
    }

    obj.get("text")
        .and_then(Value::as_str)
        .map(Block::paragraph)
}

/// Leaves contribute their text; nested elements are flattened.
fn collect_text(node: &Value, out: &mut String) -> Option<()> {
    let obj = node.as_object()?;
    if let Some(text) = obj.get("text").and_then(Value::as_str) {
        out.push_str(text);
        return Some(());
    }
    for child in obj.get("children")?.as_array()? {
        collect_text(child, out)?;
    }
    Some(())
}
