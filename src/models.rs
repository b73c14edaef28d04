//! Core data models used throughout semsearch.
//!
//! These types are the only things the pipeline stages hand to each other:
//! documents and chunks on the indexing side, queries, evidence and answers
//! on the query side.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// A file discovered by the scanner. Content is read later by the chunker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    /// Absolute path; the document identity.
    pub path: PathBuf,
    /// Lowercased extension without the dot (`md`, `rs`, ...).
    pub file_type: String,
    pub modified_at: DateTime<Utc>,
    pub size: u64,
    /// Last version-control revision touching the file, when recorded.
    pub revision: Option<String>,
    /// Calendar date the document belongs to (path date or local mtime date).
    pub doc_date: NaiveDate,
}

impl SourceDocument {
    /// Path as stored in the metadata store.
    pub fn key(&self) -> String {
        self.path.to_string_lossy().to_string()
    }
}

/// Structural role of a chunk inside its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuralTag {
    /// Section introduced by a heading of the given level (1-6).
    Heading(u8),
    Paragraph,
    CodeBlock,
    /// Top-level declaration in a source file.
    Declaration,
    /// Fixed-size window used when no structure applies.
    Window,
}

impl StructuralTag {
    pub fn as_db_str(&self) -> String {
        match self {
            StructuralTag::Heading(level) => format!("h{}", level),
            StructuralTag::Paragraph => "paragraph".to_string(),
            StructuralTag::CodeBlock => "code".to_string(),
            StructuralTag::Declaration => "declaration".to_string(),
            StructuralTag::Window => "window".to_string(),
        }
    }

    pub fn from_db_str(s: &str) -> Self {
        match s {
            "paragraph" => StructuralTag::Paragraph,
            "code" => StructuralTag::CodeBlock,
            "declaration" => StructuralTag::Declaration,
            "window" => StructuralTag::Window,
            other => other
                .strip_prefix('h')
                .and_then(|l| l.parse::<u8>().ok())
                .map(StructuralTag::Heading)
                .unwrap_or(StructuralTag::Paragraph),
        }
    }
}

/// A retrieval unit cut from one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: String,
    pub document_path: String,
    pub ordinal: i64,
    pub text: String,
    pub tag: StructuralTag,
    /// Byte range `[start_byte, end_byte)` in the source content.
    pub start_byte: usize,
    pub end_byte: usize,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// A chunk id paired with its vector and the model that produced it.
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub model: String,
}

/// Denormalized document + chunk row as served by the metadata store.
#[derive(Debug, Clone, Serialize)]
pub struct MetadataRecord {
    pub chunk_id: String,
    pub document_path: String,
    pub file_type: String,
    pub doc_date: NaiveDate,
    pub modified_at: i64,
    pub revision: Option<String>,
    pub ordinal: i64,
    pub tag: StructuralTag,
    pub start_byte: i64,
    pub end_byte: i64,
    pub text: String,
}

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Builds a range, swapping the bounds if they arrive reversed.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    pub fn single(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        day >= self.start && day <= self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}..{}", self.start, self.end)
        }
    }
}

/// Query category chosen by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Direct,
    Temporal,
    Advisory,
}

impl QueryType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Some(QueryType::Direct),
            "temporal" => Some(QueryType::Temporal),
            "advisory" => Some(QueryType::Advisory),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Direct => "direct",
            QueryType::Temporal => "temporal",
            QueryType::Advisory => "advisory",
        }
    }
}

/// Explicit caller-supplied narrowing for a query.
#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    pub date_range: Option<DateRange>,
    /// Only documents whose path starts with this prefix.
    pub path_prefix: Option<String>,
    /// Only these file types (extensions without dot).
    pub file_types: Vec<String>,
    /// Bypasses classification when set.
    pub query_type: Option<QueryType>,
}

impl QueryFilters {
    pub fn is_empty(&self) -> bool {
        self.date_range.is_none() && self.path_prefix.is_none() && self.file_types.is_empty()
    }
}

/// Turn a user-typed path prefix into the form documents are stored under:
/// absolute, relative to `cwd`, with symlinks resolved.
///
/// The prefix need not name an existing file (`notes/2024-06` narrows to
/// June entries), so only its longest existing ancestor is canonicalized.
pub fn resolve_path_prefix(prefix: &str, cwd: &Path) -> String {
    let absolute = cwd.join(prefix);
    let mut existing = absolute.as_path();
    let mut rest = Vec::new();
    let mut resolved = loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut out = canonical;
            out.extend(rest.iter().rev());
            break out;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name);
                existing = parent;
            }
            _ => break absolute.clone(),
        }
    }
    .to_string_lossy()
    .to_string();

    // keep "notes/work/" from matching "notes/workshop"
    if prefix.ends_with(std::path::is_separator) && !resolved.ends_with(std::path::is_separator) {
        resolved.push(std::path::MAIN_SEPARATOR);
    }
    resolved
}

/// Where the answer goes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OutputMode {
    #[default]
    Conversational,
    /// Write a Markdown answer to this file.
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Query {
    pub text: String,
    pub filters: QueryFilters,
    pub output: OutputMode,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            filters: QueryFilters::default(),
            output: OutputMode::Conversational,
        }
    }

    pub fn with_filters(mut self, filters: QueryFilters) -> Self {
        self.filters = filters;
        self
    }
}

/// Which retrieval strategy produced an evidence item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    DirectSimilarity,
    TemporalMapper,
    AgentOrchestrator,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::DirectSimilarity => "direct_similarity",
            StrategyKind::TemporalMapper => "temporal_mapper",
            StrategyKind::AgentOrchestrator => "agent_orchestrator",
        }
    }
}

/// A retrieved chunk with its relevance for one query.
#[derive(Debug, Clone, Serialize)]
pub struct EvidenceItem {
    pub record: MetadataRecord,
    pub score: f64,
    pub strategy: StrategyKind,
}

impl EvidenceItem {
    pub fn chunk_id(&self) -> &str {
        &self.record.chunk_id
    }
}

/// Sort evidence by score descending, chunk id ascending on ties.
pub fn sort_evidence(items: &mut [EvidenceItem]) {
    items.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.record.chunk_id.cmp(&b.record.chunk_id))
    });
}

/// Error attached to an answer instead of failing the query.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorDescriptor {
    pub kind: String,
    pub message: String,
}

impl From<&crate::error::SearchError> for ErrorDescriptor {
    fn from(err: &crate::error::SearchError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// The result of a query.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    /// Identifier of the inference backend that produced `text`.
    pub backend: Option<String>,
    /// Grounding trail, ordered as used.
    pub evidence: Vec<EvidenceItem>,
    pub query_type: QueryType,
    pub strategy: StrategyKind,
    /// Retrieval rounds performed (1 unless the agent orchestrator ran).
    pub rounds: usize,
    /// Set when the query failed after classification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDescriptor>,
    /// File the answer was written to, for file output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub written_to: Option<PathBuf>,
}

/// One document that failed during an indexing run.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentFailure {
    pub path: String,
    pub stage: String,
    pub kind: String,
    pub message: String,
}

/// A filesystem entry the scanner skipped.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedEntry {
    pub path: PathBuf,
    pub reason: String,
}

/// Summary of one indexing run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexingReport {
    pub run_id: String,
    pub documents_scanned: u64,
    pub documents_updated: u64,
    pub documents_unchanged: u64,
    pub documents_removed: u64,
    pub documents_failed: u64,
    pub chunks_written: u64,
    /// Chunk ids found in only one of the two stores and repaired.
    pub inconsistencies_repaired: u64,
    pub failures: Vec<DocumentFailure>,
    pub skipped: Vec<SkippedEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_path_prefix() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("notes").join("work")).unwrap();
        let notes = tmp.path().join("notes").canonicalize().unwrap();

        assert_eq!(
            resolve_path_prefix("notes/work", tmp.path()),
            notes.join("work").to_string_lossy()
        );
        assert_eq!(
            resolve_path_prefix("notes/2024-06", tmp.path()),
            notes.join("2024-06").to_string_lossy()
        );
        assert!(resolve_path_prefix("notes/work/", tmp.path()).ends_with("work/"));

        let absolute = notes.join("work").to_string_lossy().to_string();
        assert_eq!(resolve_path_prefix(&absolute, Path::new("/elsewhere")), absolute);
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_path_prefix_through_symlink() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("notes").join("work")).unwrap();
        std::os::unix::fs::symlink(tmp.path().join("notes"), tmp.path().join("link")).unwrap();

        let expected = tmp.path().join("notes").join("work").canonicalize().unwrap();
        assert_eq!(
            resolve_path_prefix("link/work", tmp.path()),
            expected.to_string_lossy()
        );
    }

    #[test]
    fn test_tag_db_roundtrip() {
        for tag in [
            StructuralTag::Heading(2),
            StructuralTag::Paragraph,
            StructuralTag::CodeBlock,
            StructuralTag::Declaration,
            StructuralTag::Window,
        ] {
            assert_eq!(StructuralTag::from_db_str(&tag.as_db_str()), tag);
        }
    }

    #[test]
    fn test_date_range_swaps_bounds() {
        let a = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let b = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let range = DateRange::new(a, b);
        assert_eq!(range.start, b);
        assert!(range.contains(NaiveDate::from_ymd_opt(2024, 6, 5).unwrap()));
        assert_eq!(range.to_string(), "2024-06-01..2024-06-10");
    }
}
