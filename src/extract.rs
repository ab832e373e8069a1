//! Source extraction from free-form model output.
//!
//! Model responses usually wrap the program in a fenced block, sometimes with
//! prose around it, sometimes several blocks, sometimes no fence at all. The
//! extractor never fails: it returns its best guess and leaves rejecting an
//! empty result to the validator.
//!
//! Block selection is a heuristic. When a response holds several blocks, the
//! first non-empty one that contains an entry marker (`function main`,
//! `dispatch(`, `(module`, ...) wins; otherwise the first non-empty one does.
//! A response that shows an example snippet containing `dispatch(` ahead of
//! the real program will pick the snippet.

use pulldown_cmark::{CodeBlockKind, Event, Parser, Tag, TagEnd};

/// Markers that suggest a block is the runnable program.
pub const DEFAULT_ENTRY_MARKERS: &[&str] =
    &["function main", "dispatch(", "(module", "def main", "fn main"];

/// Result of extracting a program from a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedSource {
    /// Program text, exactly as it appeared between the fences
    pub source: String,
    /// Info string of the chosen fence (`js`, `wat`, ...)
    pub language_tag: Option<String>,
    /// Whether the source came from a fenced block
    pub fenced: bool,
}

#[derive(Debug)]
struct FencedBlock {
    tag: Option<String>,
    body: String,
}

impl FencedBlock {
    fn is_empty(&self) -> bool {
        self.body.trim().is_empty()
    }
}

/// Pulls a candidate program out of model output.
#[derive(Debug, Clone)]
pub struct SourceExtractor {
    entry_markers: Vec<String>,
}

impl Default for SourceExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_ENTRY_MARKERS.iter().map(|m| m.to_string()).collect())
    }
}

impl SourceExtractor {
    pub fn new(entry_markers: Vec<String>) -> Self {
        Self { entry_markers }
    }

    pub fn entry_markers(&self) -> &[String] {
        &self.entry_markers
    }

    pub fn extract(&self, raw: &str) -> ExtractedSource {
        let blocks = scan_blocks(raw);
        if blocks.is_empty() {
            return ExtractedSource {
                source: raw.trim().to_string(),
                language_tag: None,
                fenced: false,
            };
        }

        let chosen = blocks
            .iter()
            .filter(|b| !b.is_empty())
            .find(|b| self.entry_markers.iter().any(|m| b.body.contains(m.as_str())))
            .or_else(|| blocks.iter().find(|b| !b.is_empty()));

        match chosen {
            Some(block) => ExtractedSource {
                source: block.body.clone(),
                language_tag: block.tag.clone(),
                fenced: true,
            },
            None => ExtractedSource {
                source: String::new(),
                language_tag: None,
                fenced: true,
            },
        }
    }
}

/// Extract with the default entry markers.
pub fn extract_source(raw: &str) -> String {
    SourceExtractor::default().extract(raw).source
}

/// Fenced code blocks in document order. Indented blocks are ignored: an
/// indented snippet in prose is rarely the program.
fn scan_blocks(raw: &str) -> Vec<FencedBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<FencedBlock> = None;

    for event in Parser::new(raw) {
        match event {
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(info))) => {
                let tag = info
                    .split_whitespace()
                    .next()
                    .map(|t| t.to_ascii_lowercase());
                current = Some(FencedBlock {
                    tag,
                    body: String::new(),
                });
            }
            Event::Text(text) => {
                if let Some(block) = current.as_mut() {
                    block.body.push_str(&text);
                }
            }
            Event::End(TagEnd::CodeBlock) => {
                if let Some(mut block) = current.take() {
                    block.body = normalize_body(&block.body);
                    blocks.push(block);
                }
            }
            _ => {}
        }
    }

    blocks
}

/// Block text comes back with its final line terminator; keep the lines only.
fn normalize_body(text: &str) -> String {
    let text = text.replace("\r\n", "\n");
    text.strip_suffix('\n').unwrap_or(&text).to_string()
}
