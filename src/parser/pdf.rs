//! PDF complexity scoring and text extraction
//!
//! Cheap structural signals decide whether a PDF can go through the fast
//! text extractor or needs the slower layout-preserving path. The score sums
//! per-document and per-page contributions and is averaged over the sampled
//! pages; documents at or above [`MODERATE_THRESHOLD`] take the layout path.

use crate::error::{ParseError, Result};
use lopdf::content::Content;
use lopdf::{Document, Object};
use std::collections::HashSet;
use tracing::debug;

/// Pages sampled for scoring
const SAMPLE_PAGES: usize = 5;

/// Score at or above which the layout-preserving path is used
pub const MODERATE_THRESHOLD: f32 = 7.0;

// Scoring weights
const UNTAGGED_SCORE: f32 = 1.0;
const COMPLEX_PRODUCER_SCORE: f32 = 2.0;
const SCAN_SCORE: f32 = 5.0;
const TABLE_COLUMN_SCORE: f32 = 3.0;
const DENSE_PAGE_SCORE: f32 = 2.0;

// Detection thresholds
const MIN_TEXT_LENGTH: usize = 50;
const ALIGNMENT_DUPLICATES_THRESHOLD: usize = 5;
const DENSE_BLOCK_THRESHOLD: usize = 50;

/// Parse PDF bytes into markdown-ish text
pub fn parse_pdf(bytes: &[u8]) -> Result<String> {
    let doc = Document::load_mem(bytes)
        .map_err(|e| ParseError::ParseFailure(format!("failed to open PDF: {}", e)))?;

    let score = complexity_score(&doc);
    debug!(score, "scored PDF complexity");

    if score < MODERATE_THRESHOLD {
        fast_extract(bytes)
    } else {
        layout_extract(&doc)
    }
}

/// Average per-page complexity over the first [`SAMPLE_PAGES`] pages
pub fn complexity_score(doc: &Document) -> f32 {
    let mut score: f32 = 0.0;

    // Tagged-PDF check: a structural tree usually means clean reading order
    match doc.catalog() {
        Ok(catalog) if catalog.has(b"StructTreeRoot") => {}
        _ => score += UNTAGGED_SCORE,
    }

    // Producer analysis: layout-heavy authoring tools raise the score
    let (producer, creator) = document_info(doc);
    let origin = format!("{} {}", producer, creator).to_lowercase();
    if ["indesign", "latex", "tex"].iter().any(|t| origin.contains(t)) {
        score += COMPLEX_PRODUCER_SCORE;
    } else if origin.contains("word") {
        score = (score - 1.0).max(0.0);
    }

    let pages: Vec<_> = doc.get_pages().into_iter().take(SAMPLE_PAGES).collect();
    if pages.is_empty() {
        return 0.0;
    }

    for (page_number, page_id) in &pages {
        let text_len = doc
            .extract_text(&[*page_number])
            .map(|t| t.trim().len())
            .unwrap_or(0);
        let signals = page_signals(doc, *page_id);

        // A near-empty page with images is almost certainly a scan
        if text_len < MIN_TEXT_LENGTH && signals.image_count > 0 {
            score += SCAN_SCORE;
        }

        // Many blocks sharing a Y coordinate indicates tables or columns
        if signals.duplicate_y > ALIGNMENT_DUPLICATES_THRESHOLD {
            score += TABLE_COLUMN_SCORE;
        }

        if signals.text_blocks > DENSE_BLOCK_THRESHOLD {
            score += DENSE_PAGE_SCORE;
        }
    }

    score / pages.len() as f32
}

fn document_info(doc: &Document) -> (String, String) {
    let info = doc
        .trailer
        .get(b"Info")
        .ok()
        .and_then(|obj| resolve(doc, obj))
        .and_then(|obj| obj.as_dict().ok());

    let read = |key: &[u8]| -> String {
        info.and_then(|dict| dict.get(key).ok())
            .and_then(|obj| resolve(doc, obj))
            .and_then(|obj| obj.as_str().ok())
            .map(|bytes| String::from_utf8_lossy(bytes).to_string())
            .unwrap_or_default()
    };

    (read(b"Producer"), read(b"Creator"))
}

struct PageSignals {
    text_blocks: usize,
    duplicate_y: usize,
    image_count: usize,
}

/// Structural signals from one page's content stream and resources
fn page_signals(doc: &Document, page_id: (u32, u16)) -> PageSignals {
    let mut text_blocks = 0usize;
    let mut y_coords: Vec<i64> = Vec::new();

    if let Ok(data) = doc.get_page_content(page_id) {
        if let Ok(content) = Content::decode(&data) {
            for op in &content.operations {
                match op.operator.as_str() {
                    "BT" => text_blocks += 1,
                    // Text positioning: Td/TD carry (tx, ty), Tm carries a
                    // full matrix with ty in the last operand
                    "Td" | "TD" => {
                        if let Some(y) = op.operands.get(1).and_then(as_number) {
                            y_coords.push((y * 10.0).round() as i64);
                        }
                    }
                    "Tm" => {
                        if let Some(y) = op.operands.get(5).and_then(as_number) {
                            y_coords.push((y * 10.0).round() as i64);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    let unique: HashSet<i64> = y_coords.iter().copied().collect();
    let duplicate_y = y_coords.len() - unique.len();

    PageSignals {
        text_blocks,
        duplicate_y,
        image_count: count_page_images(doc, page_id),
    }
}

fn count_page_images(doc: &Document, page_id: (u32, u16)) -> usize {
    let Some(resources) = doc
        .get_dictionary(page_id)
        .ok()
        .and_then(|page| page.get(b"Resources").ok())
        .and_then(|obj| resolve(doc, obj))
        .and_then(|obj| obj.as_dict().ok())
    else {
        return 0;
    };

    let Some(xobjects) = resources
        .get(b"XObject")
        .ok()
        .and_then(|obj| resolve(doc, obj))
        .and_then(|obj| obj.as_dict().ok())
    else {
        return 0;
    };

    xobjects
        .iter()
        .filter(|(_, obj)| {
            resolve(doc, obj)
                .and_then(|obj| obj.as_stream().ok())
                .and_then(|stream| stream.dict.get(b"Subtype").ok())
                .and_then(|sub| sub.as_name().ok())
                .map(|name| name == b"Image")
                .unwrap_or(false)
        })
        .count()
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Object> {
    match obj {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    }
}

fn as_number(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(*r as f64),
        _ => None,
    }
}

/// Fast path: plain text extraction, paragraphs separated by blank lines
fn fast_extract(bytes: &[u8]) -> Result<String> {
    let text = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| ParseError::ParseFailure(format!("PDF text extraction failed: {}", e)))?;
    if text.trim().is_empty() {
        return Err(ParseError::ParseFailure("PDF contains no extractable text".into()).into());
    }
    Ok(text)
}

/// Layout path: reassemble text blocks per page in top-down reading order
fn layout_extract(doc: &Document) -> Result<String> {
    let mut pages_out = Vec::new();

    for (page_number, page_id) in doc.get_pages() {
        let data = doc.get_page_content(page_id).map_err(|e| {
            ParseError::ParseFailure(format!("failed to read page {}: {}", page_number, e))
        })?;
        let content = Content::decode(&data).map_err(|e| {
            ParseError::ParseFailure(format!("failed to decode page {}: {}", page_number, e))
        })?;

        // Collect (y, text) per BT..ET block, then sort top-down
        let mut blocks: Vec<(i64, String)> = Vec::new();
        let mut current = String::new();
        let mut current_y: i64 = 0;
        let mut in_block = false;

        for op in &content.operations {
            match op.operator.as_str() {
                "BT" => {
                    in_block = true;
                    current.clear();
                    current_y = 0;
                }
                "ET" => {
                    if in_block && !current.trim().is_empty() {
                        blocks.push((current_y, current.trim().to_string()));
                    }
                    in_block = false;
                }
                "Td" | "TD" => {
                    if let Some(y) = op.operands.get(1).and_then(as_number) {
                        if current.trim().is_empty() {
                            current_y = (y * 10.0).round() as i64;
                        }
                    }
                }
                "Tm" => {
                    if let Some(y) = op.operands.get(5).and_then(as_number) {
                        if current.trim().is_empty() {
                            current_y = (y * 10.0).round() as i64;
                        }
                    }
                }
                "Tj" | "'" => {
                    if let Some(text) = op.operands.first().and_then(|o| o.as_str().ok()) {
                        current.push_str(&String::from_utf8_lossy(text));
                        current.push(' ');
                    }
                }
                "TJ" => {
                    if let Some(Object::Array(items)) = op.operands.first() {
                        for item in items {
                            if let Ok(text) = item.as_str() {
                                current.push_str(&String::from_utf8_lossy(text));
                            }
                        }
                        current.push(' ');
                    }
                }
                _ => {}
            }
        }

        // PDF origin is bottom-left, so higher Y comes first
        blocks.sort_by(|a, b| b.0.cmp(&a.0));
        let page_text: Vec<String> = blocks.into_iter().map(|(_, t)| t).collect();
        if !page_text.is_empty() {
            pages_out.push(page_text.join("\n\n"));
        }
    }

    if pages_out.is_empty() {
        return Err(ParseError::ParseFailure("PDF contains no extractable text".into()).into());
    }
    Ok(pages_out.join("\n\n"))
}
