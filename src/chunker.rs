//! Structure-aware chunking of parsed markdown
//!
//! Documents are split along the markdown header hierarchy into parent
//! segments, then each parent is split into smaller child segments that get
//! embedded. Children keep a back-reference to their parent so retrieval can
//! widen a child hit into its surrounding context.

use crate::config::RetrievalConfig;
use std::collections::BTreeMap;

/// Separator priority for recursive splitting
const SEPARATORS: [&str; 6] = ["\n\n\n", "\n\n", "\n", ".", " ", ""];

/// Header levels that open a new parent segment
const MAX_HEADER_LEVEL: usize = 3;

/// A chunk of text before persistence; ids are assigned by the coordinator
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub content: String,
    /// Header trail inherited from the enclosing sections ("h1" -> text, ...)
    pub headers: BTreeMap<String, String>,
    pub page: u32,
}

impl Segment {
    fn new(content: String, headers: BTreeMap<String, String>) -> Self {
        Self {
            content,
            headers,
            page: 0,
        }
    }
}

/// Output of a chunking pass
#[derive(Debug, Clone, Default)]
pub struct ChunkSet {
    pub parents: Vec<Segment>,
    pub children: Vec<Segment>,
    /// (child index, parent index)
    pub edges: Vec<(usize, usize)>,
}

impl ChunkSet {
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

/// Character splitter that tries coarse separators first and only falls back
/// to finer ones for pieces that are still over budget
pub struct RecursiveSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl RecursiveSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
        }
    }

    /// Split `text` into chunks of at most `chunk_size` bytes, overlapping
    /// adjacent chunks by roughly `chunk_overlap` bytes
    pub fn split(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        if text.len() <= self.chunk_size {
            return vec![text.to_string()];
        }

        let pieces = self.decompose(text, 0);
        self.merge(pieces)
    }

    /// Break text into pieces no larger than the budget, preferring the
    /// coarsest separator that still occurs in the text
    fn decompose(&self, text: &str, sep_idx: usize) -> Vec<String> {
        let sep = SEPARATORS[sep_idx..]
            .iter()
            .find(|s| s.is_empty() || text.contains(**s))
            .copied()
            .unwrap_or("");
        let next_idx = SEPARATORS
            .iter()
            .position(|s| *s == sep)
            .map(|i| i + 1)
            .unwrap_or(SEPARATORS.len());

        let raw: Vec<String> = if sep.is_empty() {
            // Last resort: hard cut at the size budget
            hard_cut(text, self.chunk_size)
        } else {
            split_keep_separator(text, sep)
        };

        let mut pieces = Vec::new();
        for piece in raw {
            if piece.len() > self.chunk_size && next_idx < SEPARATORS.len() {
                pieces.extend(self.decompose(&piece, next_idx));
            } else if !piece.is_empty() {
                pieces.push(piece);
            }
        }
        pieces
    }

    /// Greedily merge pieces back together up to the size budget, seeding
    /// each new chunk with the tail of the previous one
    fn merge(&self, pieces: Vec<String>) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current = String::new();
        // Bytes of `current` that are only the overlap seed; a chunk must
        // carry fresh content before it can be flushed
        let mut seed_len = 0usize;

        for piece in pieces {
            if current.len() > seed_len && current.len() + piece.len() > self.chunk_size {
                let finished = current.trim().to_string();
                let overlap = tail(&current, self.chunk_overlap);
                if !finished.is_empty() {
                    chunks.push(finished);
                }
                seed_len = overlap.len();
                current = overlap;
            }
            current.push_str(&piece);
        }

        if current.len() > seed_len {
            let finished = current.trim().to_string();
            if !finished.is_empty() {
                chunks.push(finished);
            }
        }
        chunks
    }
}

/// Split keeping the separator attached to the end of each piece
fn split_keep_separator(text: &str, sep: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find(sep) {
        let end = pos + sep.len();
        out.push(rest[..end].to_string());
        rest = &rest[end..];
    }
    if !rest.is_empty() {
        out.push(rest.to_string());
    }
    out
}

/// Cut at the byte budget, backing off to a char boundary
fn hard_cut(text: &str, size: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = text;
    while rest.len() > size {
        let cut = floor_char_boundary(rest, size);
        if cut == 0 {
            break;
        }
        out.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    if !rest.is_empty() {
        out.push(rest.to_string());
    }
    out
}

/// Last `n` bytes of `s`, aligned down to a char boundary
fn tail(s: &str, n: usize) -> String {
    if n == 0 || s.len() <= n {
        return if n == 0 { String::new() } else { s.to_string() };
    }
    let mut start = s.len() - n;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// A markdown section delimited by headers of level 1-3
struct HeaderSection {
    headers: BTreeMap<String, String>,
    content: String,
}

/// Split along the markdown header hierarchy, keeping headers in the payload
fn split_by_headers(markdown: &str) -> Vec<HeaderSection> {
    let mut sections: Vec<HeaderSection> = Vec::new();
    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    let mut current = String::new();

    let flush = |sections: &mut Vec<HeaderSection>,
                 headers: &BTreeMap<String, String>,
                 current: &mut String| {
        if !current.trim().is_empty() {
            sections.push(HeaderSection {
                headers: headers.clone(),
                content: current.trim_end().to_string(),
            });
        }
        current.clear();
    };

    for line in markdown.lines() {
        if let Some((level, title)) = header_line(line) {
            flush(&mut sections, &headers, &mut current);
            // A new header closes every deeper or equal level
            headers.retain(|key, _| {
                key.strip_prefix('h')
                    .and_then(|d| d.parse::<usize>().ok())
                    .map(|existing| existing < level)
                    .unwrap_or(false)
            });
            headers.insert(format!("h{}", level), title.to_string());
            current.push_str(line);
            current.push('\n');
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    flush(&mut sections, &headers, &mut current);
    sections
}

fn header_line(line: &str) -> Option<(usize, &str)> {
    let trimmed = line.trim_start();
    let hashes = trimmed.bytes().take_while(|b| *b == b'#').count();
    if hashes == 0 || hashes > MAX_HEADER_LEVEL {
        return None;
    }
    let rest = &trimmed[hashes..];
    rest.strip_prefix(' ').map(|title| (hashes, title.trim()))
}

/// Hierarchical chunker producing parent and child segments plus edges
pub struct HierarchicalChunker {
    parent_splitter: RecursiveSplitter,
    child_splitter: RecursiveSplitter,
    parent_size: usize,
}

impl HierarchicalChunker {
    pub fn new(config: &RetrievalConfig) -> Self {
        Self {
            parent_splitter: RecursiveSplitter::new(
                config.parent_chunk_size,
                config.parent_chunk_overlap,
            ),
            child_splitter: RecursiveSplitter::new(
                config.child_chunk_size,
                config.child_chunk_overlap,
            ),
            parent_size: config.parent_chunk_size,
        }
    }

    /// Split along headers into parents, then each parent into children
    pub fn chunk(&self, markdown: &str) -> ChunkSet {
        let mut set = ChunkSet::default();

        for section in split_by_headers(markdown) {
            let parent_texts = if section.content.len() > self.parent_size {
                self.parent_splitter.split(&section.content)
            } else {
                vec![section.content.clone()]
            };

            for parent_text in parent_texts {
                let parent_idx = set.parents.len();
                set.parents
                    .push(Segment::new(parent_text.clone(), section.headers.clone()));

                for child_text in self.child_splitter.split(&parent_text) {
                    let child_idx = set.children.len();
                    set.children
                        .push(Segment::new(child_text, section.headers.clone()));
                    set.edges.push((child_idx, parent_idx));
                }
            }
        }
        set
    }

    /// Flat mode: a single child-sized stream, no parents or edges
    pub fn chunk_flat(&self, markdown: &str) -> ChunkSet {
        let mut set = ChunkSet::default();
        for text in self.child_splitter.split(markdown) {
            set.children.push(Segment::new(text, BTreeMap::new()));
        }
        set
    }
}

/// Sizing presets tuned for common document families
pub fn preset_for(doc_type: &str) -> RetrievalConfig {
    let base = RetrievalConfig::default();
    match doc_type.to_lowercase().as_str() {
        "technical" => RetrievalConfig {
            parent_chunk_size: 2500,
            parent_chunk_overlap: 250,
            child_chunk_size: 500,
            child_chunk_overlap: 50,
            similarity_threshold: 0.35,
            ..base
        },
        "legal" => RetrievalConfig {
            parent_chunk_size: 3000,
            parent_chunk_overlap: 300,
            child_chunk_size: 400,
            child_chunk_overlap: 40,
            ..base
        },
        "news" => RetrievalConfig {
            parent_chunk_size: 1500,
            parent_chunk_overlap: 150,
            child_chunk_size: 300,
            child_chunk_overlap: 30,
            similarity_threshold: 0.45,
            ..base
        },
        "faq" => RetrievalConfig {
            parent_chunk_size: 1000,
            parent_chunk_overlap: 100,
            child_chunk_size: 200,
            child_chunk_overlap: 20,
            similarity_threshold: 0.5,
            ..base
        },
        "research" => RetrievalConfig {
            parent_chunk_size: 2800,
            parent_chunk_overlap: 280,
            child_chunk_size: 600,
            child_chunk_overlap: 60,
            similarity_threshold: 0.35,
            ..base
        },
        "handbook" => RetrievalConfig {
            parent_chunk_size: 2200,
            parent_chunk_overlap: 220,
            child_chunk_size: 450,
            child_chunk_overlap: 45,
            ..base
        },
        "conversation" => RetrievalConfig {
            parent_chunk_size: 1200,
            parent_chunk_overlap: 120,
            child_chunk_size: 250,
            child_chunk_overlap: 25,
            similarity_threshold: 0.5,
            use_parent_retrieval: false,
            ..base
        },
        _ => base,
    }
}
