//! Error taxonomy for indexing and querying.
//!
//! [`SearchError`] is the domain error carried through the pipelines. The
//! indexing run uses [`SearchError::is_systemic`] to decide between skipping
//! one document and aborting the whole run; the query pipeline uses
//! [`SearchError::kind`] to build the error descriptor attached to an
//! [`Answer`](crate::models::Answer).
//!
//! Command-level code (CLI, config loading) keeps using `anyhow`, and
//! `SearchError` converts into `anyhow::Error` through `?`.

use std::path::PathBuf;

/// Result alias for domain operations.
pub type Result<T> = std::result::Result<T, SearchError>;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// The scan root (or a directory below it) could not be read.
    #[error("scan failed at {path}: {message}")]
    Scan { path: PathBuf, message: String },

    /// A document's content could not be split into chunks.
    #[error("chunking failed for {path}: {message}")]
    Chunking { path: PathBuf, message: String },

    #[error("embedding backend '{backend}' unavailable{}: {message}", timeout_suffix(.timed_out))]
    EmbeddingUnavailable {
        backend: String,
        message: String,
        timed_out: bool,
    },

    #[error("inference backend '{backend}' unavailable{}: {message}", timeout_suffix(.timed_out))]
    InferenceUnavailable {
        backend: String,
        message: String,
        timed_out: bool,
    },

    /// Vector dimensionality or model identity differs from the index.
    #[error("dimension mismatch: index expects {expected} dims ({model}), got {actual}")]
    DimensionMismatch {
        expected: usize,
        actual: usize,
        model: String,
    },

    /// Vector index and metadata store disagree about a set of chunks.
    #[error("store inconsistency: {message} ({} chunk(s) affected)", .chunk_ids.len())]
    StoreInconsistency {
        message: String,
        chunk_ids: Vec<String>,
    },

    /// The classifier saw conflicting markers. Never fatal.
    #[error("query classification ambiguous: {0}")]
    ClassificationAmbiguous(String),

    #[error("metadata store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

fn timeout_suffix(timed_out: &bool) -> &'static str {
    if *timed_out {
        " (timed out)"
    } else {
        ""
    }
}

impl SearchError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SearchError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn embedding(backend: &str, message: impl Into<String>) -> Self {
        SearchError::EmbeddingUnavailable {
            backend: backend.to_string(),
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn embedding_timeout(backend: &str, secs: u64) -> Self {
        SearchError::EmbeddingUnavailable {
            backend: backend.to_string(),
            message: format!("no response within {}s", secs),
            timed_out: true,
        }
    }

    pub fn inference(backend: &str, message: impl Into<String>) -> Self {
        SearchError::InferenceUnavailable {
            backend: backend.to_string(),
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn inference_timeout(backend: &str, secs: u64) -> Self {
        SearchError::InferenceUnavailable {
            backend: backend.to_string(),
            message: format!("no response within {}s", secs),
            timed_out: true,
        }
    }

    /// Systemic errors abort an indexing run; everything else is recorded
    /// against the one document that produced it.
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            SearchError::Store(_)
                | SearchError::DimensionMismatch { .. }
                | SearchError::StoreInconsistency { .. }
                | SearchError::Config(_)
        )
    }

    /// True for timeout-kind failures of a network backend.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SearchError::EmbeddingUnavailable {
                timed_out: true,
                ..
            } | SearchError::InferenceUnavailable {
                timed_out: true,
                ..
            }
        )
    }

    /// Stable snake_case tag for error descriptors and JSON output.
    pub fn kind(&self) -> &'static str {
        match self {
            SearchError::Scan { .. } => "scan_error",
            SearchError::Chunking { .. } => "chunking_error",
            SearchError::EmbeddingUnavailable { .. } => "embedding_unavailable",
            SearchError::InferenceUnavailable { .. } => "inference_unavailable",
            SearchError::DimensionMismatch { .. } => "dimension_mismatch",
            SearchError::StoreInconsistency { .. } => "store_inconsistency",
            SearchError::ClassificationAmbiguous(_) => "classification_ambiguous",
            SearchError::Store(_) => "store_error",
            SearchError::Io { .. } => "io_error",
            SearchError::Config(_) => "config_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_systemic_split() {
        assert!(SearchError::DimensionMismatch {
            expected: 4,
            actual: 3,
            model: "m".into()
        }
        .is_systemic());
        assert!(!SearchError::embedding("ollama", "connection refused").is_systemic());
        assert!(!SearchError::Chunking {
            path: "a.md".into(),
            message: "binary".into()
        }
        .is_systemic());
    }

    #[test]
    fn test_timeout_message() {
        let err = SearchError::inference_timeout("ollama:llama3", 30);
        assert!(err.is_timeout());
        assert_eq!(err.kind(), "inference_unavailable");
        assert!(err.to_string().contains("(timed out)"));
    }
}
