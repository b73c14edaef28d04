//! Persisted vector index with exact cosine search.
//!
//! All vectors share one model identifier and dimensionality, fixed when the
//! index is created. Entries are kept ordered by chunk id, so persisting the
//! same contents always produces the same file and reloading reproduces
//! search results exactly.
//!
//! # File format
//!
//! ```text
//! {"format":1,"model":"...","dims":256,"run_id":"...","count":N}\n
//! N × ( u16 LE id length | id bytes | dims × f32 LE )
//! ```
//!
//! The header's `run_id` names the indexing run whose state the file holds;
//! the metadata store uses it to decide which generation of rows is visible.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::embedding::cosine_similarity;
use crate::error::{Result, SearchError};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct IndexHeader {
    format: u32,
    model: String,
    dims: usize,
    run_id: Option<String>,
    count: usize,
}

/// One search result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk_id: String,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    model: String,
    dims: usize,
    run_id: Option<String>,
    entries: BTreeMap<String, Vec<f32>>,
}

impl VectorIndex {
    pub fn new(model: &str, dims: usize) -> Self {
        Self {
            model: model.to_string(),
            dims,
            run_id: None,
            entries: BTreeMap::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Run id recorded by the last persist (or load).
    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.entries.contains_key(chunk_id)
    }

    pub fn chunk_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Fails with `DimensionMismatch` unless the index was built by `model`
    /// with `dims`-wide vectors.
    pub fn ensure_compatible(&self, model: &str, dims: usize) -> Result<()> {
        if self.dims != dims || self.model != model {
            return Err(SearchError::DimensionMismatch {
                expected: self.dims,
                actual: dims,
                model: format!("index built with '{}', embedder is '{}'", self.model, model),
            });
        }
        Ok(())
    }

    /// Insert or replace the vector for `chunk_id`.
    pub fn upsert(&mut self, chunk_id: &str, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dims {
            return Err(SearchError::DimensionMismatch {
                expected: self.dims,
                actual: vector.len(),
                model: self.model.clone(),
            });
        }
        self.entries.insert(chunk_id.to_string(), vector);
        Ok(())
    }

    /// Remove an entry. Returns whether it existed.
    pub fn delete(&mut self, chunk_id: &str) -> bool {
        self.entries.remove(chunk_id).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// The `k` most similar entries, restricted to `filter` when given.
    ///
    /// Ordered by similarity descending, then chunk id ascending. Returns an
    /// empty list for `k == 0` or an empty index.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&HashSet<String>>,
    ) -> Result<Vec<SearchHit>> {
        if query.len() != self.dims {
            return Err(SearchError::DimensionMismatch {
                expected: self.dims,
                actual: query.len(),
                model: self.model.clone(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut hits: Vec<SearchHit> = self
            .entries
            .iter()
            .filter(|(id, _)| filter.map_or(true, |f| f.contains(id.as_str())))
            .map(|(id, vector)| SearchHit {
                chunk_id: id.clone(),
                score: cosine_similarity(query, vector),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Write the index to `path` stamped with `run_id`.
    ///
    /// The file is written to a sibling temp file, synced and renamed over
    /// `path`, so readers see either the old or the new index.
    pub fn persist(&mut self, path: &Path, run_id: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| SearchError::io(parent, e))?;
            }
        }

        let header = IndexHeader {
            format: FORMAT_VERSION,
            model: self.model.clone(),
            dims: self.dims,
            run_id: Some(run_id.to_string()),
            count: self.entries.len(),
        };
        let tmp = tmp_path(path);

        let write = || -> std::io::Result<()> {
            let file = File::create(&tmp)?;
            let mut out = BufWriter::new(file);
            serde_json::to_writer(&mut out, &header)?;
            out.write_all(b"\n")?;
            for (id, vector) in &self.entries {
                let id_bytes = id.as_bytes();
                out.write_all(&(id_bytes.len() as u16).to_le_bytes())?;
                out.write_all(id_bytes)?;
                for v in vector {
                    out.write_all(&v.to_le_bytes())?;
                }
            }
            let file = out.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
            Ok(())
        };
        write().map_err(|e| SearchError::io(&tmp, e))?;

        fs::rename(&tmp, path).map_err(|e| SearchError::io(path, e))?;
        self.run_id = Some(run_id.to_string());
        Ok(())
    }

    /// Load a persisted index.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| SearchError::io(path, e))?;
        let corrupt = |message: &str| SearchError::StoreInconsistency {
            message: format!("vector index {} is corrupt: {}", path.display(), message),
            chunk_ids: Vec::new(),
        };

        let newline = bytes
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| corrupt("missing header"))?;
        let header: IndexHeader =
            serde_json::from_slice(&bytes[..newline]).map_err(|e| corrupt(&e.to_string()))?;
        if header.format != FORMAT_VERSION {
            return Err(corrupt(&format!("unsupported format {}", header.format)));
        }

        let mut entries = BTreeMap::new();
        let mut pos = newline + 1;
        let record = header.dims * 4;
        for _ in 0..header.count {
            let len_bytes = bytes
                .get(pos..pos + 2)
                .ok_or_else(|| corrupt("truncated record"))?;
            let id_len = u16::from_le_bytes([len_bytes[0], len_bytes[1]]) as usize;
            pos += 2;
            let id = bytes
                .get(pos..pos + id_len)
                .ok_or_else(|| corrupt("truncated id"))?;
            let id = String::from_utf8(id.to_vec()).map_err(|e| corrupt(&e.to_string()))?;
            pos += id_len;
            let raw = bytes
                .get(pos..pos + record)
                .ok_or_else(|| corrupt("truncated vector"))?;
            pos += record;
            entries.insert(id, crate::embedding::blob_to_vec(raw));
        }
        if pos != bytes.len() {
            return Err(corrupt("trailing bytes"));
        }

        Ok(Self {
            model: header.model,
            dims: header.dims,
            run_id: header.run_id,
            entries,
        })
    }

    /// Load `path` if it exists.
    pub fn load_if_exists(path: &Path) -> Result<Option<Self>> {
        if path.exists() {
            Self::load(path).map(Some)
        } else {
            Ok(None)
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn index() -> VectorIndex {
        let mut idx = VectorIndex::new("test-model", 3);
        idx.upsert("c", vec![1.0, 0.0, 0.0]).unwrap();
        idx.upsert("a", vec![0.0, 1.0, 0.0]).unwrap();
        idx.upsert("b", vec![1.0, 0.0, 0.0]).unwrap();
        idx.upsert("d", vec![0.7, 0.7, 0.0]).unwrap();
        idx
    }

    #[test]
    fn test_search_ranks_and_breaks_ties_by_id() {
        let hits = index().search(&[1.0, 0.0, 0.0], 3, None).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "d"]);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_search_k_zero_and_empty_index() {
        assert!(index().search(&[1.0, 0.0, 0.0], 0, None).unwrap().is_empty());
        let empty = VectorIndex::new("m", 3);
        assert!(empty.search(&[1.0, 0.0, 0.0], 5, None).unwrap().is_empty());
    }

    #[test]
    fn test_search_respects_filter() {
        let allowed: HashSet<String> = ["a".to_string(), "d".to_string()].into();
        let hits = index().search(&[1.0, 0.0, 0.0], 10, Some(&allowed)).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["d", "a"]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut idx = VectorIndex::new("m", 3);
        let err = idx.upsert("x", vec![1.0, 2.0]).unwrap_err();
        assert!(matches!(
            err,
            SearchError::DimensionMismatch {
                expected: 3,
                actual: 2,
                ..
            }
        ));
        assert!(idx.search(&[1.0], 1, None).is_err());
        assert!(idx.ensure_compatible("other", 3).is_err());
        assert!(idx.ensure_compatible("m", 3).is_ok());
    }

    #[test]
    fn test_persist_and_reload_identical() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/vectors.index");
        let mut idx = index();
        idx.persist(&path, "run-1").unwrap();
        assert!(!tmp_path(&path).exists());

        let loaded = VectorIndex::load(&path).unwrap();
        assert_eq!(loaded.run_id(), Some("run-1"));
        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded.model(), "test-model");

        let q = [0.3, 0.9, 0.1];
        assert_eq!(
            idx.search(&q, 4, None).unwrap(),
            loaded.search(&q, 4, None).unwrap()
        );

        let mut again = loaded.clone();
        let second = tmp.path().join("second.index");
        again.persist(&second, "run-1").unwrap();
        assert_eq!(fs::read(&path).unwrap(), fs::read(&second).unwrap());
    }

    #[test]
    fn test_delete_and_missing_file() {
        let mut idx = index();
        assert!(idx.delete("a"));
        assert!(!idx.delete("a"));
        assert_eq!(idx.len(), 3);

        let tmp = TempDir::new().unwrap();
        assert!(VectorIndex::load_if_exists(&tmp.path().join("none"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("v.index");
        index().persist(&path, "r").unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        assert!(matches!(
            VectorIndex::load(&path),
            Err(SearchError::StoreInconsistency { .. })
        ));
    }
}
