//! Heading-aware Markdown node parser.
//!
//! Splits a [`Document`] into [`Node`]s along ATX headings (`#` … `######`),
//! keeping the stack of enclosing headings as each node's heading path so
//! that `Class → Method` structure survives chunking. Headings inside
//! fenced code blocks are ignored.
//!
//! Sections longer than `max_tokens` are further split on paragraph
//! boundaries (`\n\n`); a single oversized paragraph is hard-split at the
//! nearest newline or space.
//!
//! # Identity
//!
//! Node ids are UUIDv5 values over `source_path`, the heading path and an
//! ordinal counting repeated heading paths within the document. Re-parsing
//! unchanged Markdown yields the same ids. The content hash is the SHA-256
//! of the node text.
//!
//! # Example
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use docfusion_core::chunk::parse_markdown_nodes;
//! use docfusion_core::models::Document;
//!
//! let doc = Document {
//!     source_path: "sdk.md".to_string(),
//!     text: "# CarWrapper\n\nA car.\n\n## GetVelocity\n\nReturns velocity.".to_string(),
//!     metadata: BTreeMap::new(),
//! };
//! let nodes = parse_markdown_nodes(&doc, 1024);
//! assert_eq!(nodes.len(), 2);
//! assert_eq!(nodes[1].heading_path, vec!["CarWrapper", "GetVelocity"]);
//! ```

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{Document, Node};

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Parse a document into hierarchical nodes.
///
/// `max_tokens == 0` disables size-based splitting. Sections that are empty
/// after trimming (e.g. blank preamble) produce no node.
pub fn parse_markdown_nodes(doc: &Document, max_tokens: usize) -> Vec<Node> {
    let max_chars = max_tokens.saturating_mul(CHARS_PER_TOKEN);
    let mut nodes = Vec::new();
    let mut ordinals: HashMap<String, usize> = HashMap::new();

    for section in split_sections(&doc.text) {
        let body = section.lines.join("\n");
        let body = body.trim();
        if body.is_empty() {
            continue;
        }

        let pieces = if max_chars == 0 {
            vec![body.to_string()]
        } else {
            split_paragraphs(body, max_chars)
        };

        let key = format!("{}#{}", doc.source_path, section.heading_path.join("\u{1f}"));
        for piece in pieces {
            let ordinal = ordinals.entry(key.clone()).or_insert(0);
            let id = node_id(&key, *ordinal);
            *ordinal += 1;

            nodes.push(Node {
                id,
                source_path: doc.source_path.clone(),
                heading_path: section.heading_path.clone(),
                content_hash: content_hash(&piece),
                text: piece,
                embedding: None,
            });
        }
    }

    nodes
}

/// SHA-256 hex digest of a node's text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn node_id(key: &str, ordinal: usize) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("{}#{}", key, ordinal).as_bytes()).to_string()
}

struct Section<'a> {
    heading_path: Vec<String>,
    lines: Vec<&'a str>,
}

fn split_sections(text: &str) -> Vec<Section<'_>> {
    let mut sections = Vec::new();
    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut current = Section {
        heading_path: Vec::new(),
        lines: Vec::new(),
    };
    let mut in_fence = false;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            current.lines.push(line);
            continue;
        }

        if !in_fence {
            if let Some((level, title)) = parse_heading(line) {
                let finished = std::mem::replace(
                    &mut current,
                    Section {
                        heading_path: Vec::new(),
                        lines: Vec::new(),
                    },
                );
                sections.push(finished);

                while stack.last().is_some_and(|(l, _)| *l >= level) {
                    stack.pop();
                }
                stack.push((level, title));
                current.heading_path = stack.iter().map(|(_, t)| t.clone()).collect();
                current.lines.push(line);
                continue;
            }
        }

        current.lines.push(line);
    }

    sections.push(current);
    sections
}

/// Recognise an ATX heading: up to three leading spaces, 1–6 `#`, then a
/// space or end of line. Closing `#`s are stripped.
fn parse_heading(line: &str) -> Option<(usize, String)> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        return None;
    }
    let rest = &line[indent..];
    let level = rest.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let after = &rest[level..];
    if !after.is_empty() && !after.starts_with(' ') && !after.starts_with('\t') {
        return None;
    }
    let title = after.trim().trim_end_matches('#').trim().to_string();
    if title.is_empty() {
        return None;
    }
    Some((level, title))
}

/// Split text on paragraph boundaries so each piece fits `max_chars`.
fn split_paragraphs(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current_buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            pieces.push(std::mem::take(&mut current_buf));
        }

        if trimmed.len() > max_chars {
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let mut split_at = remaining.len().min(max_chars);
                while !remaining.is_char_boundary(split_at) {
                    split_at -= 1;
                }
                let actual_split = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                let piece = remaining[..actual_split].trim();
                if !piece.is_empty() {
                    pieces.push(piece.to_string());
                }
                remaining = &remaining[actual_split..];
            }
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        pieces.push(current_buf);
    }

    pieces
}
