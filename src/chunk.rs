//! Structure-aware chunker.
//!
//! Splits document content into [`Chunk`]s bounded by a soft `max_tokens`
//! cap. The content is first cut into structural units, which are then
//! packed greedily into chunks:
//!
//! - **Markdown / text**: ATX headings open sections, blank lines separate
//!   paragraphs, fenced code blocks are atomic units. Units are packed within
//!   their section only, so a chunk never spans two headings.
//! - **Code**: column-zero declarations (`fn`, `struct`, `def`, `class`,
//!   `function`, ...) start units. Doc comments, attributes and decorators
//!   directly above a declaration stay with it.
//! - **Fallback**: a unit larger than the cap is cut into fixed-size
//!   windows overlapping by `overlap_tokens`. A windowed unit keeps its
//!   structural tag; [`StructuralTag::Window`] is only used when the content
//!   has no structure at all.
//!
//! Chunk ids are derived from the document path, ordinal and text hash, so
//! identical content always yields identical chunks.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::config::ChunkingConfig;
use crate::error::{Result, SearchError};
use crate::models::{Chunk, SourceDocument, StructuralTag};

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

const CODE_TYPES: &[&str] = &[
    "rs", "py", "js", "jsx", "ts", "tsx", "go", "java", "kt", "swift", "c", "h", "cpp", "hpp",
    "rb", "sh",
];

/// Chunk size bounds in characters.
#[derive(Debug, Clone, Copy)]
pub struct ChunkOptions {
    pub max_chars: usize,
    pub min_chars: usize,
    pub overlap_chars: usize,
}

impl ChunkOptions {
    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self {
            max_chars: config.max_tokens * CHARS_PER_TOKEN,
            min_chars: config.min_tokens * CHARS_PER_TOKEN,
            overlap_chars: config.overlap_tokens * CHARS_PER_TOKEN,
        }
    }
}

/// A byte range of the source with its structural role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    tag: StructuralTag,
    start: usize,
    end: usize,
}

impl Span {
    fn len(&self) -> usize {
        self.end - self.start
    }
}

/// Units belonging to one heading (or to the preamble before any heading).
struct Section {
    heading: Option<u8>,
    units: Vec<Span>,
}

pub fn is_code_type(file_type: &str) -> bool {
    CODE_TYPES.contains(&file_type)
}

/// Decode raw file bytes and chunk them.
///
/// Content with NUL bytes or invalid UTF-8 is rejected with
/// [`SearchError::Chunking`]; the indexing run skips such documents.
pub fn chunk_document(
    doc: &SourceDocument,
    content: &[u8],
    options: &ChunkOptions,
) -> Result<Vec<Chunk>> {
    if content.contains(&0) {
        return Err(SearchError::Chunking {
            path: doc.path.clone(),
            message: "content looks binary (NUL byte)".to_string(),
        });
    }
    let text = std::str::from_utf8(content).map_err(|e| SearchError::Chunking {
        path: doc.path.clone(),
        message: format!("invalid UTF-8: {}", e),
    })?;
    Ok(chunk_text(&doc.key(), text, &doc.file_type, options))
}

/// Split `text` into ordered chunks. Empty or whitespace-only text yields none.
pub fn chunk_text(
    document_path: &str,
    text: &str,
    file_type: &str,
    options: &ChunkOptions,
) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let max_chars = options.max_chars.max(CHARS_PER_TOKEN);
    let overlap = options.overlap_chars.min(max_chars / 2);

    let sections = if is_code_type(file_type) {
        code_sections(text)
    } else {
        markdown_sections(text)
    };

    let mut spans = Vec::new();
    for section in &sections {
        spans.extend(pack_section(text, section, max_chars, overlap));
    }
    let spans = merge_small(spans, options.min_chars, max_chars);

    spans
        .iter()
        .enumerate()
        .map(|(i, span)| make_chunk(document_path, i as i64, text, span))
        .collect()
}

// ============ Structural parsing ============

fn heading_level(line: &str) -> Option<u8> {
    let hashes = line.bytes().take_while(|b| *b == b'#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    match line.as_bytes().get(hashes) {
        None | Some(b' ') | Some(b'\t') => Some(hashes as u8),
        _ => None,
    }
}

fn fence_marker(line: &str) -> Option<&'static str> {
    let t = line.trim_start();
    if t.starts_with("```") {
        Some("```")
    } else if t.starts_with("~~~") {
        Some("~~~")
    } else {
        None
    }
}

/// Iterate `(start, line_without_newline)` over the content.
fn lines_with_offsets(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut pos = 0;
    text.split_inclusive('\n').map(move |raw| {
        let start = pos;
        pos += raw.len();
        (start, raw.trim_end_matches(['\n', '\r']))
    })
}

fn markdown_sections(text: &str) -> Vec<Section> {
    let mut sections = vec![Section {
        heading: None,
        units: Vec::new(),
    }];
    let mut para: Option<(usize, usize)> = None;
    let mut fence: Option<(&'static str, usize)> = None;

    fn flush(para: &mut Option<(usize, usize)>, sections: &mut [Section]) {
        if let Some((start, end)) = para.take() {
            if let Some(section) = sections.last_mut() {
                section.units.push(Span {
                    tag: StructuralTag::Paragraph,
                    start,
                    end,
                });
            }
        }
    }

    for (start, line) in lines_with_offsets(text) {
        let end = start + line.len();

        if let Some((marker, fence_start)) = fence {
            if line.trim_start().starts_with(marker) {
                if let Some(section) = sections.last_mut() {
                    section.units.push(Span {
                        tag: StructuralTag::CodeBlock,
                        start: fence_start,
                        end,
                    });
                }
                fence = None;
            }
            continue;
        }

        if let Some(marker) = fence_marker(line) {
            flush(&mut para, &mut sections);
            fence = Some((marker, start));
            continue;
        }

        if let Some(level) = heading_level(line) {
            flush(&mut para, &mut sections);
            sections.push(Section {
                heading: Some(level),
                units: vec![Span {
                    tag: StructuralTag::Heading(level),
                    start,
                    end,
                }],
            });
            continue;
        }

        if line.trim().is_empty() {
            flush(&mut para, &mut sections);
            continue;
        }

        para = match para {
            Some((s, _)) => Some((s, end)),
            None => Some((start, end)),
        };
    }

    // An unterminated fence runs to the end of the document.
    if let Some((_, fence_start)) = fence {
        if let Some(section) = sections.last_mut() {
            section.units.push(Span {
                tag: StructuralTag::CodeBlock,
                start: fence_start,
                end: text.trim_end().len(),
            });
        }
    }
    flush(&mut para, &mut sections);

    sections.retain(|s| !s.units.is_empty());
    sections
}

fn declaration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:pub(?:\([^)]*\))?\s+)?(?:export\s+)?(?:default\s+)?(?:async\s+)?(?:unsafe\s+)?(?:fn|struct|enum|trait|impl|mod|type|const|static|macro_rules!|def|class|function|interface|func)\b",
        )
        .expect("static declaration regex is valid")
    })
}

fn is_decoration(line: &str) -> bool {
    let t = line.trim_start();
    !t.is_empty()
        && (t.starts_with("#[")
            || t.starts_with("//")
            || t.starts_with('#')
            || t.starts_with('@')
            || t.starts_with("/*")
            || t.starts_with('*'))
}

fn code_sections(text: &str) -> Vec<Section> {
    let lines: Vec<(usize, &str)> = lines_with_offsets(text).collect();
    let re = declaration_regex();

    let mut boundaries: Vec<usize> = Vec::new();
    for (i, (_, line)) in lines.iter().enumerate() {
        if !re.is_match(line) {
            continue;
        }
        let mut first = i;
        while first > 0 && is_decoration(lines[first - 1].1) {
            first -= 1;
        }
        let offset = lines[first].0;
        if boundaries.last() != Some(&offset) {
            boundaries.push(offset);
        }
    }

    let mut units = Vec::new();
    if boundaries.is_empty() {
        units.push(Span {
            tag: StructuralTag::CodeBlock,
            start: 0,
            end: text.len(),
        });
    } else {
        if boundaries[0] > 0 {
            units.push(Span {
                tag: StructuralTag::CodeBlock,
                start: 0,
                end: boundaries[0],
            });
        }
        for (i, start) in boundaries.iter().enumerate() {
            let end = boundaries.get(i + 1).copied().unwrap_or(text.len());
            units.push(Span {
                tag: StructuralTag::Declaration,
                start: *start,
                end,
            });
        }
    }

    let units = units
        .into_iter()
        .filter_map(|u| trim_span(text, u))
        .collect();
    vec![Section {
        heading: None,
        units,
    }]
}

// ============ Packing ============

fn pack_section(text: &str, section: &Section, max_chars: usize, overlap: usize) -> Vec<Span> {
    let structured = section.heading.is_some() || section.units.len() > 1;
    let mut out = Vec::new();
    let mut current: Option<Span> = None;

    let packed_tag = |tags: &[StructuralTag]| match section.heading {
        Some(level) => StructuralTag::Heading(level),
        None if tags.len() == 1 => tags[0],
        None if tags.contains(&StructuralTag::Declaration) => StructuralTag::Declaration,
        None => StructuralTag::Paragraph,
    };

    for unit in &section.units {
        if unit.len() > max_chars {
            if let Some(c) = current.take() {
                out.push(c);
            }
            let tag = match (section.heading, unit.tag) {
                (Some(level), StructuralTag::Paragraph) => StructuralTag::Heading(level),
                (None, StructuralTag::Paragraph) if !structured => StructuralTag::Window,
                (None, StructuralTag::CodeBlock) if !structured => StructuralTag::Window,
                (_, tag) => tag,
            };
            for (start, end) in windows(text, unit.start, unit.end, max_chars, overlap) {
                if let Some(span) = trim_span(text, Span { tag, start, end }) {
                    out.push(span);
                }
            }
            continue;
        }

        current = match current {
            None => Some(Span {
                tag: packed_tag(&[unit.tag]),
                ..*unit
            }),
            Some(c) if unit.end - c.start > max_chars => {
                out.push(c);
                Some(Span {
                    tag: packed_tag(&[unit.tag]),
                    ..*unit
                })
            }
            Some(c) => Some(Span {
                tag: packed_tag(&[c.tag, unit.tag]),
                start: c.start,
                end: unit.end,
            }),
        };
    }

    if let Some(c) = current {
        out.push(c);
    }
    out
}

/// Fold spans shorter than `min_chars` into a neighbour when the result
/// stays within `max_chars + min_chars`.
fn merge_small(spans: Vec<Span>, min_chars: usize, max_chars: usize) -> Vec<Span> {
    if min_chars == 0 || spans.len() < 2 {
        return spans;
    }
    let limit = max_chars + min_chars;
    let mut out: Vec<Span> = Vec::with_capacity(spans.len());
    let mut carry: Option<Span> = None;

    for span in spans {
        let span = match carry.take() {
            Some(small) if span.end - small.start <= limit => Span {
                tag: small.tag,
                start: small.start,
                end: span.end,
            },
            Some(small) => {
                out.push(small);
                span
            }
            None => span,
        };
        if span.len() < min_chars {
            carry = Some(span);
        } else {
            out.push(span);
        }
    }

    if let Some(small) = carry {
        match out.last_mut() {
            Some(prev) if small.end - prev.start <= limit => prev.end = small.end,
            _ => out.push(small),
        }
    }
    out
}

/// Fixed-size windows over `[start, end)` with `overlap` bytes of overlap.
/// Window ends prefer a whitespace break in the second half of the window.
fn windows(text: &str, start: usize, end: usize, max_chars: usize, overlap: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut s = start;
    while s < end {
        if end - s <= max_chars {
            out.push((s, end));
            break;
        }
        let mut e = snap_to_char_boundary(text, s + max_chars);
        if e <= s {
            e = next_char_boundary(text, s);
        }
        if let Some((pos, ch)) = text[s..e]
            .char_indices()
            .rev()
            .find(|(_, c)| c.is_whitespace())
        {
            if pos > (e - s) / 2 {
                e = s + pos + ch.len_utf8();
            }
        }
        out.push((s, e));

        let mut next = snap_to_char_boundary(text, e.saturating_sub(overlap));
        if next <= s {
            next = e;
        }
        s = next;
    }
    out
}

fn trim_span(text: &str, span: Span) -> Option<Span> {
    let slice = &text[span.start..span.end];
    let lead = slice.len() - slice.trim_start().len();
    let trimmed = slice.trim();
    if trimmed.is_empty() {
        return None;
    }
    let start = span.start + lead;
    Some(Span {
        tag: span.tag,
        start,
        end: start + trimmed.len(),
    })
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn next_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index + 1;
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i.min(s.len())
}

/// SHA-256 hex digest of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Deterministic chunk id: first 128 bits of SHA-256(path, ordinal, text hash).
pub fn chunk_id(document_path: &str, ordinal: i64, text_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_path.as_bytes());
    hasher.update([0u8]);
    hasher.update(ordinal.to_le_bytes());
    hasher.update([0u8]);
    hasher.update(text_hash.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

fn make_chunk(document_path: &str, ordinal: i64, text: &str, span: &Span) -> Chunk {
    let body = &text[span.start..span.end];
    let hash = sha256_hex(body.as_bytes());
    Chunk {
        id: chunk_id(document_path, ordinal, &hash),
        document_path: document_path.to_string(),
        ordinal,
        text: body.to_string(),
        tag: span.tag,
        start_byte: span.start,
        end_byte: span.end,
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(max_tokens: usize) -> ChunkOptions {
        ChunkOptions {
            max_chars: max_tokens * CHARS_PER_TOKEN,
            min_chars: 0,
            overlap_chars: 0,
        }
    }

    fn normalize(s: &str) -> String {
        s.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_empty_and_whitespace_yield_no_chunks() {
        assert!(chunk_text("a.md", "", "md", &opts(100)).is_empty());
        assert!(chunk_text("a.md", " \n\n\t \n", "md", &opts(100)).is_empty());
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("a.md", "Hello, world!", "md", &opts(700));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].ordinal, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].tag, StructuralTag::Paragraph);
        assert_eq!((chunks[0].start_byte, chunks[0].end_byte), (0, 13));
    }

    #[test]
    fn test_headings_split_sections() {
        let text = "# Monday\n\nStandup notes.\n\n## Tasks\n\n- ship it\n- test it\n\n# Tuesday\n\nRetro.";
        let chunks = chunk_text("j.md", text, "md", &opts(700));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].tag, StructuralTag::Heading(1));
        assert!(chunks[0].text.starts_with("# Monday"));
        assert_eq!(chunks[1].tag, StructuralTag::Heading(2));
        assert!(chunks[2].text.contains("Retro."));
    }

    #[test]
    fn test_offsets_index_source() {
        let text = "# Title\n\nFirst para.\n\n## Sub\n\nSecond para.\n";
        for c in chunk_text("a.md", text, "md", &opts(3)) {
            assert_eq!(&text[c.start_byte..c.end_byte], c.text);
        }
    }

    #[test]
    fn test_chunks_ordered_and_reconstruct_source() {
        let text = (0..40)
            .map(|i| format!("Paragraph number {} with some words.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_text("a.md", &text, "md", &opts(20));
        assert!(chunks.len() > 1);
        for (i, pair) in chunks.windows(2).enumerate() {
            assert_eq!(pair[0].ordinal, i as i64);
            assert!(pair[0].end_byte <= pair[1].start_byte);
        }
        let joined = chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(normalize(&joined), normalize(&text));
    }

    #[test]
    fn test_fenced_code_is_atomic() {
        let text = "Intro.\n\n```rust\n# not a heading\nfn main() {}\n```\n\nOutro.";
        let chunks = chunk_text("a.md", text, "md", &opts(11));
        assert_eq!(chunks.len(), 3);
        let code: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| c.tag == StructuralTag::CodeBlock)
            .collect();
        assert_eq!(code.len(), 1);
        assert!(code[0].text.contains("# not a heading"));
        assert!(code[0].text.ends_with("```"));
    }

    #[test]
    fn test_unstructured_text_uses_overlapping_windows() {
        let text = "word ".repeat(200);
        let options = ChunkOptions {
            max_chars: 100,
            min_chars: 0,
            overlap_chars: 20,
        };
        let chunks = chunk_text("a.txt", &text, "txt", &options);
        assert!(chunks.len() > 5);
        assert!(chunks.iter().all(|c| c.tag == StructuralTag::Window));
        assert!(chunks.iter().all(|c| c.text.len() <= 100));
        // consecutive windows share the overlap region
        assert!(chunks[1].start_byte < chunks[0].end_byte);
        for pair in chunks.windows(2) {
            assert!(pair[0].start_byte < pair[1].start_byte);
        }
    }

    #[test]
    fn test_code_splits_on_declarations() {
        let text = "use std::io;\n\n/// Adds.\nfn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n\n#[derive(Debug)]\npub struct Point {\n    x: i32,\n}\n";
        let chunks = chunk_text("lib.rs", text, "rs", &opts(16));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].tag, StructuralTag::CodeBlock);
        assert!(chunks[1].text.starts_with("/// Adds."));
        assert_eq!(chunks[1].tag, StructuralTag::Declaration);
        assert!(chunks[2].text.starts_with("#[derive(Debug)]"));
    }

    #[test]
    fn test_python_declarations() {
        let text = "import os\n\n@cache\ndef load():\n    return 1\n\nclass Store:\n    pass\n";
        let chunks = chunk_text("s.py", text, "py", &opts(10));
        assert!(chunks.iter().any(|c| c.text.starts_with("@cache\ndef load")));
        assert!(chunks.iter().any(|c| c.text.starts_with("class Store")));
    }

    #[test]
    fn test_small_sections_merge_forward() {
        let text = "# Week 23\n\n## Monday\n\nA long enough paragraph about what happened on Monday morning.";
        let options = ChunkOptions {
            max_chars: 400,
            min_chars: 20,
            overlap_chars: 0,
        };
        let chunks = chunk_text("w.md", text, "md", &options);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].tag, StructuralTag::Heading(1));
        assert!(chunks[0].text.starts_with("# Week 23"));
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘";
        let chunks = chunk_text("a.txt", text, "txt", &opts(3));
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(!c.text.is_empty());
            assert_eq!(&text[c.start_byte..c.end_byte], c.text);
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "# A\n\nAlpha\n\nBeta\n\n# B\n\nGamma\n\nDelta";
        let c1 = chunk_text("doc.md", text, "md", &opts(2));
        let c2 = chunk_text("doc.md", text, "md", &opts(2));
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_chunk_ids_depend_on_path() {
        let a = chunk_text("a.md", "same text", "md", &opts(100));
        let b = chunk_text("b.md", "same text", "md", &opts(100));
        assert_ne!(a[0].id, b[0].id);
        assert_eq!(a[0].hash, b[0].hash);
        assert_eq!(a[0].id.len(), 32);
    }

    #[test]
    fn test_binary_content_rejected() {
        let doc = SourceDocument {
            path: "/tmp/x.md".into(),
            file_type: "md".into(),
            modified_at: chrono::Utc::now(),
            size: 3,
            revision: None,
            doc_date: chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        };
        let err = chunk_document(&doc, &[b'a', 0, b'b'], &opts(10)).unwrap_err();
        assert!(matches!(err, SearchError::Chunking { .. }));
    }
}
