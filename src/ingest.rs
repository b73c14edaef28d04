//! Indexing pipeline.
//!
//! Drives one indexing run through explicit stages:
//!
//! ```text
//! Scanning → Filtering → (Chunking → Embedding → Committing)* → Done
//!                                                            ↘ Failed
//! ```
//!
//! Each stage implements [`Stage`]: it owns its typed input and returns a
//! typed output that becomes the next stage's only input. The vector index
//! is handed to the commit stage and handed back. Changed documents flow
//! through chunk/embed/commit in batches so memory stays bounded on large
//! trees.
//!
//! A failure confined to one document (unreadable file, binary content,
//! embedding backend down after retries) is recorded in the report and the
//! run continues. A systemic failure (metadata store, dimension mismatch)
//! rolls back everything the run staged and fails the run; the previously
//! committed generation stays intact.
//!
//! Commit order: per document, one store transaction stages the new rows;
//! once all documents are staged, the vector index is persisted atomically
//! with the run id; finally the store promotes the staged rows.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chunk::{chunk_document, sha256_hex, ChunkOptions};
use crate::config::Config;
use crate::embedding::{check_batch, create_embedder, Embedder};
use crate::error::{Result, SearchError};
use crate::models::{Chunk, DocumentFailure, IndexingReport, SkippedEntry, SourceDocument};
use crate::progress::{IndexProgressEvent, IndexProgressReporter, NoProgress};
use crate::scanner::{scan, ScanItem, ScanOptions};
use crate::store::{MetadataStore, Recovery, StoreView};
use crate::vector_index::VectorIndex;

/// Changed documents per chunk/embed/commit cycle.
const DOCUMENT_BATCH: usize = 64;

/// Backoff exponent cap: delays stop growing at `base × 2^5`.
const MAX_BACKOFF_EXPONENT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Scanning,
    Filtering,
    Chunking,
    Embedding,
    Committing,
    Done,
    Failed,
}

impl IndexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexState::Scanning => "scanning",
            IndexState::Filtering => "filtering",
            IndexState::Chunking => "chunking",
            IndexState::Embedding => "embedding",
            IndexState::Committing => "committing",
            IndexState::Done => "done",
            IndexState::Failed => "failed",
        }
    }
}

/// Turn a per-document error into a report entry, or propagate it when
/// systemic.
fn document_failure(state: IndexState, path: &str, err: SearchError) -> Result<DocumentFailure> {
    if err.is_systemic() {
        return Err(err);
    }
    warn!(path, stage = state.as_str(), error = %err, "document skipped");
    Ok(DocumentFailure {
        path: path.to_string(),
        stage: state.as_str().to_string(),
        kind: err.kind().to_string(),
        message: err.to_string(),
    })
}

/// One step of the indexing state machine. Stages own their input and hand
/// their whole result to the next stage; nothing else is shared.
#[async_trait]
pub trait Stage: Send + Sync {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn state(&self) -> IndexState;

    async fn run(&self, input: Self::Input) -> Result<Self::Output>;
}

// ============ Stage payloads ============

/// Items that made it through a stage plus the documents that did not.
pub struct Outcome<T> {
    pub items: Vec<T>,
    pub failures: Vec<DocumentFailure>,
}

pub struct ScanOutput {
    pub root: PathBuf,
    pub documents: Vec<SourceDocument>,
    pub skipped: Vec<SkippedEntry>,
}

pub struct FilterOutput {
    pub changed: Vec<SourceDocument>,
    pub unchanged: u64,
    /// Indexed documents under the root that no longer exist.
    pub removed: Vec<String>,
    pub failures: Vec<DocumentFailure>,
}

pub struct ChunkedDocument {
    pub doc: SourceDocument,
    pub content_hash: String,
    pub chunks: Vec<Chunk>,
}

pub struct EmbeddedDocument {
    pub doc: SourceDocument,
    pub content_hash: String,
    pub chunks: Vec<Chunk>,
    pub vectors: Vec<Vec<f32>>,
}

pub struct CommitInput {
    pub run_id: String,
    pub index: VectorIndex,
    pub documents: Vec<EmbeddedDocument>,
    /// Document paths whose rows and vectors are retired.
    pub retire: Vec<String>,
}

pub struct CommitOutput {
    pub index: VectorIndex,
    pub committed: u64,
    pub chunks_written: u64,
    pub retired: u64,
}

// ============ Stages ============

pub struct ScanStage {
    options: ScanOptions,
}

#[async_trait]
impl Stage for ScanStage {
    type Input = ();
    type Output = ScanOutput;

    fn state(&self) -> IndexState {
        IndexState::Scanning
    }

    async fn run(&self, _input: ()) -> Result<ScanOutput> {
        let stream = scan(&self.options)?;
        let root = stream.root().to_path_buf();

        let items = tokio::task::spawn_blocking(move || stream.collect::<Vec<ScanItem>>())
            .await
            .map_err(|e| SearchError::Scan {
                path: root.clone(),
                message: e.to_string(),
            })?;

        let mut documents = Vec::new();
        let mut skipped = Vec::new();
        for item in items {
            match item {
                ScanItem::Document(doc) => documents.push(doc),
                ScanItem::Skipped(entry) => {
                    debug!(path = %entry.path.display(), reason = %entry.reason, "skipped");
                    skipped.push(entry);
                }
            }
        }

        info!(documents = documents.len(), skipped = skipped.len(), "scan complete");
        Ok(ScanOutput {
            root,
            documents,
            skipped,
        })
    }
}

/// Drops documents whose content matches the committed one and finds
/// documents that disappeared from the tree.
///
/// A document whose size and mtime equal the committed stat is not read. A
/// full rebuild treats every scanned document as changed and every stored
/// document outside the scan as removed, whatever root it came from.
pub struct FilterStage {
    store: MetadataStore,
    full: bool,
    workers: usize,
}

impl FilterStage {
    /// Whether `doc` still matches its committed generation.
    async fn is_unchanged(&self, doc: &SourceDocument) -> Result<bool> {
        let Some(fingerprint) = self.store.document_fingerprint(&doc.key()).await? else {
            return Ok(false);
        };
        if fingerprint.stat_matches(doc) {
            return Ok(true);
        }
        let hash = sha256_hex(&read_content(&doc.path).await?);
        if hash != fingerprint.content_hash {
            return Ok(false);
        }
        self.store.refresh_document_stat(doc).await?;
        Ok(true)
    }
}

#[async_trait]
impl Stage for FilterStage {
    type Input = ScanOutput;
    type Output = FilterOutput;

    fn state(&self) -> IndexState {
        IndexState::Filtering
    }

    async fn run(&self, input: ScanOutput) -> Result<FilterOutput> {
        let scanned: HashSet<String> = input.documents.iter().map(|d| d.key()).collect();

        let checked: Vec<(SourceDocument, Result<bool>)> = if self.full {
            input.documents.into_iter().map(|d| (d, Ok(false))).collect()
        } else {
            stream::iter(input.documents)
                .map(|doc| async move {
                    let unchanged = self.is_unchanged(&doc).await;
                    (doc, unchanged)
                })
                .buffered(self.workers)
                .collect()
                .await
        };

        let mut changed = Vec::new();
        let mut unchanged = 0;
        let mut failures = Vec::new();
        for (doc, result) in checked {
            match result {
                Ok(true) => unchanged += 1,
                Ok(false) => changed.push(doc),
                Err(e) => failures.push(document_failure(self.state(), &doc.key(), e)?),
            }
        }

        let stored = if self.full {
            self.store.all_document_paths().await?
        } else {
            self.store.list_document_paths(&input.root).await?
        };
        let removed: Vec<String> = stored.into_iter().filter(|p| !scanned.contains(p)).collect();

        info!(
            changed = changed.len(),
            unchanged,
            removed = removed.len(),
            "filter complete"
        );
        Ok(FilterOutput {
            changed,
            unchanged,
            removed,
            failures,
        })
    }
}

pub struct ChunkStage {
    options: ChunkOptions,
    workers: usize,
}

#[async_trait]
impl Stage for ChunkStage {
    type Input = Vec<SourceDocument>;
    type Output = Outcome<ChunkedDocument>;

    fn state(&self) -> IndexState {
        IndexState::Chunking
    }

    async fn run(&self, docs: Vec<SourceDocument>) -> Result<Outcome<ChunkedDocument>> {
        let options = self.options;
        let results: Vec<(String, Result<ChunkedDocument>)> = stream::iter(docs)
            .map(|doc| async move {
                let key = doc.key();
                let chunked = read_content(&doc.path).await.and_then(|bytes| {
                    let chunks = chunk_document(&doc, &bytes, &options)?;
                    Ok(ChunkedDocument {
                        content_hash: sha256_hex(&bytes),
                        chunks,
                        doc,
                    })
                });
                (key, chunked)
            })
            .buffered(self.workers)
            .collect()
            .await;

        let mut outcome = Outcome {
            items: Vec::with_capacity(results.len()),
            failures: Vec::new(),
        };
        for (key, result) in results {
            match result {
                Ok(chunked) => outcome.items.push(chunked),
                Err(e) => outcome
                    .failures
                    .push(document_failure(self.state(), &key, e)?),
            }
        }
        Ok(outcome)
    }
}

pub struct EmbedStage {
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    max_retries: u32,
    retry_base: Duration,
    workers: usize,
}

impl EmbedStage {
    async fn embed_document(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            vectors.extend(self.embed_with_retry(&texts).await?);
        }
        Ok(vectors)
    }

    /// One call plus up to `max_retries` retries with exponential backoff.
    async fn embed_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self.embedder.model_id();
        let mut attempt: u32 = 0;
        loop {
            let result = self
                .embedder
                .embed(texts)
                .await
                .and_then(|v| check_batch(model, model, self.embedder.dims(), texts.len(), v));
            match result {
                Ok(v) => return Ok(v),
                Err(e) if !e.is_systemic() && attempt < self.max_retries => {
                    let delay = backoff_delay(self.retry_base, attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "embedding failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// `base × 2^attempt`, with the exponent capped.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * (1u32 << attempt.min(MAX_BACKOFF_EXPONENT))
}

#[async_trait]
impl Stage for EmbedStage {
    type Input = Vec<ChunkedDocument>;
    type Output = Outcome<EmbeddedDocument>;

    fn state(&self) -> IndexState {
        IndexState::Embedding
    }

    async fn run(&self, docs: Vec<ChunkedDocument>) -> Result<Outcome<EmbeddedDocument>> {
        let results: Vec<(ChunkedDocument, Result<Vec<Vec<f32>>>)> = stream::iter(docs)
            .map(|doc| async move {
                let vectors = self.embed_document(&doc.chunks).await;
                (doc, vectors)
            })
            .buffered(self.workers)
            .collect()
            .await;

        let mut outcome = Outcome {
            items: Vec::with_capacity(results.len()),
            failures: Vec::new(),
        };
        for (doc, vectors) in results {
            match vectors {
                Ok(vectors) => outcome.items.push(EmbeddedDocument {
                    doc: doc.doc,
                    content_hash: doc.content_hash,
                    chunks: doc.chunks,
                    vectors,
                }),
                Err(e) => outcome
                    .failures
                    .push(document_failure(self.state(), &doc.doc.key(), e)?),
            }
        }
        Ok(outcome)
    }
}

/// Stages each document in the metadata store and applies its vectors to
/// the index it was handed. Nothing becomes visible until the run finalizes.
pub struct CommitStage {
    store: MetadataStore,
}

#[async_trait]
impl Stage for CommitStage {
    type Input = CommitInput;
    type Output = CommitOutput;

    fn state(&self) -> IndexState {
        IndexState::Committing
    }

    async fn run(&self, input: CommitInput) -> Result<CommitOutput> {
        let CommitInput {
            run_id,
            mut index,
            documents,
            retire,
        } = input;
        let mut out = CommitOutput {
            index: VectorIndex::new(index.model(), index.dims()),
            committed: 0,
            chunks_written: 0,
            retired: 0,
        };

        for doc in documents {
            let previous = self
                .store
                .commit_document(&run_id, &doc.doc, &doc.content_hash, &doc.chunks)
                .await?;

            let current: HashSet<&str> = doc.chunks.iter().map(|c| c.id.as_str()).collect();
            for id in previous.iter().filter(|id| !current.contains(id.as_str())) {
                index.delete(id);
            }
            for (chunk, vector) in doc.chunks.iter().zip(doc.vectors) {
                index.upsert(&chunk.id, vector)?;
            }
            out.committed += 1;
            out.chunks_written += doc.chunks.len() as u64;
        }

        for path in &retire {
            let ids = self.store.remove_document(&run_id, path).await?;
            for id in &ids {
                index.delete(id);
            }
            out.retired += 1;
            info!(path = %path, chunks = ids.len(), "document retired");
        }

        out.index = index;
        Ok(out)
    }
}

// ============ Pipeline ============

pub struct IndexingPipeline {
    config: Config,
    store: MetadataStore,
    embedder: Arc<dyn Embedder>,
    progress: Arc<dyn IndexProgressReporter>,
    full: bool,
    retry_base: Duration,
}

/// Result of [`IndexingPipeline::execute`]: the index to persist and the report.
struct Executed {
    index: VectorIndex,
    report: IndexingReport,
    index_changed: bool,
}

impl IndexingPipeline {
    /// Open the configured store and embedding backend.
    pub async fn open(config: &Config) -> Result<Self> {
        let store = MetadataStore::open(&config.db.path).await?;
        let embedder = create_embedder(&config.embedding)?;
        Ok(Self::new(config, store, embedder))
    }

    pub fn new(config: &Config, store: MetadataStore, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            config: config.clone(),
            store,
            embedder,
            progress: Arc::new(NoProgress),
            full: false,
            retry_base: Duration::from_secs(1),
        }
    }

    /// Re-index everything and rebuild the vector index from scratch.
    pub fn full_rebuild(mut self, full: bool) -> Self {
        self.full = full;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn IndexProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Base delay of the embedding retry backoff.
    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    fn transition(&self, run_id: &str, state: &mut IndexState, next: IndexState) {
        debug!(run_id, from = state.as_str(), to = next.as_str(), "state transition");
        *state = next;
    }

    /// Index `root`, returning the run report.
    pub async fn run(&self, root: &Path) -> Result<IndexingReport> {
        let index_path = &self.config.index.path;
        let existing = VectorIndex::load_if_exists(index_path)?;

        match self
            .store
            .recover(existing.as_ref().and_then(|i| i.run_id()))
            .await?
        {
            Some(Recovery::RolledForward(run)) => {
                info!(run_id = %run, "recovered interrupted run (rolled forward)")
            }
            Some(Recovery::RolledBack(run)) => {
                warn!(run_id = %run, "recovered interrupted run (rolled back)")
            }
            None => {}
        }

        let model = self.embedder.model_id().to_string();
        let dims = self.embedder.dims();
        let index = match existing {
            Some(index) if !self.full => {
                index.ensure_compatible(&model, dims)?;
                index
            }
            _ => VectorIndex::new(&model, dims),
        };

        let (index, repaired) = if self.full {
            (index, 0)
        } else {
            self.repair(index).await?
        };

        let run_id = Uuid::new_v4().to_string();
        self.store.begin_run(&run_id, self.full).await?;
        info!(run_id = %run_id, root = %root.display(), full = self.full, model = %model, "indexing run started");

        let mut state = IndexState::Scanning;
        let executed = match self.execute(&run_id, &mut state, index, root).await {
            Ok(executed) => executed,
            Err(e) => {
                self.fail(&run_id, &mut state, &e).await;
                return Err(e);
            }
        };
        let Executed {
            mut index,
            mut report,
            index_changed,
        } = executed;
        report.inconsistencies_repaired = repaired;

        if index_changed || repaired > 0 || self.full {
            if let Err(e) = index.persist(index_path, &run_id) {
                self.fail(&run_id, &mut state, &e).await;
                return Err(e);
            }
        }
        // The run is durable from here: a crash before finalize is rolled
        // forward by the next open.
        let report_json = serde_json::to_string(&report).ok();
        self.store
            .finalize_run(&run_id, report_json.as_deref())
            .await?;
        self.transition(&run_id, &mut state, IndexState::Done);

        self.progress.report(IndexProgressEvent::Finished {
            updated: report.documents_updated,
            unchanged: report.documents_unchanged,
            removed: report.documents_removed,
            failed: report.documents_failed,
        });
        info!(
            run_id = %run_id,
            scanned = report.documents_scanned,
            updated = report.documents_updated,
            unchanged = report.documents_unchanged,
            removed = report.documents_removed,
            failed = report.documents_failed,
            chunks = report.chunks_written,
            "indexing run complete"
        );
        Ok(report)
    }

    async fn fail(&self, run_id: &str, state: &mut IndexState, err: &SearchError) {
        error!(run_id, stage = state.as_str(), error = %err, "indexing run failed");
        self.transition(run_id, state, IndexState::Failed);
        if let Err(rollback_err) = self.store.rollback_run(run_id).await {
            error!(run_id, error = %rollback_err, "rollback failed; will retry on next open");
        }
    }

    async fn execute(
        &self,
        run_id: &str,
        state: &mut IndexState,
        mut index: VectorIndex,
        root: &Path,
    ) -> Result<Executed> {
        let workers = self.config.indexing.workers.max(1);
        let scan_stage = ScanStage {
            options: ScanOptions::from_config(&self.config.scanner, root),
        };
        let filter_stage = FilterStage {
            store: self.store.clone(),
            full: self.full,
            workers,
        };
        let chunk_stage = ChunkStage {
            options: ChunkOptions::from_config(&self.config.chunking),
            workers,
        };
        let embed_stage = EmbedStage {
            embedder: Arc::clone(&self.embedder),
            batch_size: self.config.embedding.batch_size,
            max_retries: self.config.embedding.max_retries,
            retry_base: self.retry_base,
            workers,
        };
        let commit_stage = CommitStage {
            store: self.store.clone(),
        };

        let mut report = IndexingReport {
            run_id: run_id.to_string(),
            ..IndexingReport::default()
        };

        self.transition(run_id, state, scan_stage.state());
        let scanned = scan_stage.run(()).await?;
        report.documents_scanned = scanned.documents.len() as u64;
        self.progress.report(IndexProgressEvent::Scanning {
            root: scanned.root.display().to_string(),
            found: report.documents_scanned,
        });
        report.skipped = scanned.skipped.clone();

        self.transition(run_id, state, filter_stage.state());
        let filtered = filter_stage.run(scanned).await?;
        report.documents_unchanged = filtered.unchanged;
        report.failures.extend(filtered.failures);

        let total = filtered.changed.len() as u64;
        let mut done = 0u64;
        let mut index_changed = false;
        let mut pending = filtered.changed;
        while !pending.is_empty() {
            let rest = pending.split_off(pending.len().min(DOCUMENT_BATCH));
            let batch = std::mem::replace(&mut pending, rest);
            let batch_len = batch.len() as u64;

            self.transition(run_id, state, chunk_stage.state());
            let chunked = chunk_stage.run(batch).await?;
            report.failures.extend(chunked.failures);

            self.transition(run_id, state, embed_stage.state());
            let embedded = embed_stage.run(chunked.items).await?;
            report.failures.extend(embedded.failures);

            self.transition(run_id, state, commit_stage.state());
            let committed = commit_stage
                .run(CommitInput {
                    run_id: run_id.to_string(),
                    index,
                    documents: embedded.items,
                    retire: Vec::new(),
                })
                .await?;
            index = committed.index;
            index_changed |= committed.committed > 0;
            report.documents_updated += committed.committed;
            report.chunks_written += committed.chunks_written;

            done += batch_len;
            self.progress.report(IndexProgressEvent::Processing {
                state: *state,
                done,
                total,
            });
        }

        // A full rebuild starts from an empty vector index, so documents that
        // failed this time must not keep rows that have no vector.
        let mut retire = filtered.removed.clone();
        if self.full {
            retire.extend(report.failures.iter().map(|f| f.path.clone()));
        }
        if !retire.is_empty() {
            self.transition(run_id, state, commit_stage.state());
            let committed = commit_stage
                .run(CommitInput {
                    run_id: run_id.to_string(),
                    index,
                    documents: Vec::new(),
                    retire,
                })
                .await?;
            index = committed.index;
            index_changed = true;
        }
        report.documents_removed = filtered.removed.len() as u64;
        report.documents_failed = report.failures.len() as u64;

        Ok(Executed {
            index,
            report,
            index_changed,
        })
    }

    /// Reconcile the committed store generation with the loaded index.
    ///
    /// Vectors without a row are dropped; documents with rows but missing
    /// vectors lose their committed hash so this run re-indexes them.
    async fn repair(&self, mut index: VectorIndex) -> Result<(VectorIndex, u64)> {
        let stored = self.store.all_chunk_ids(StoreView::Committed).await?;
        let indexed: HashSet<String> = index.chunk_ids().map(str::to_string).collect();

        let mut orphan_vectors: Vec<String> = indexed.difference(&stored).cloned().collect();
        let mut missing_vectors: Vec<String> = stored.difference(&indexed).cloned().collect();
        if orphan_vectors.is_empty() && missing_vectors.is_empty() {
            return Ok((index, 0));
        }
        orphan_vectors.sort();
        missing_vectors.sort();

        for id in &orphan_vectors {
            index.delete(id);
        }
        let documents = self.store.documents_for_chunks(&missing_vectors).await?;
        self.store.invalidate_documents(&documents).await?;

        let repaired = (orphan_vectors.len() + missing_vectors.len()) as u64;
        let err = SearchError::StoreInconsistency {
            message: format!(
                "{} vector(s) without metadata, {} chunk(s) without vectors across {} document(s)",
                orphan_vectors.len(),
                missing_vectors.len(),
                documents.len()
            ),
            chunk_ids: orphan_vectors.into_iter().chain(missing_vectors).collect(),
        };
        warn!(error = %err, "repairing stores");
        Ok((index, repaired))
    }
}

async fn read_content(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| SearchError::io(path, e))
}

/// Index `root` with the configured store and embedding backend.
pub async fn run_indexing(root: &Path, config: &Config) -> Result<IndexingReport> {
    let pipeline = IndexingPipeline::open(config).await?;
    let report = pipeline.run(root).await;
    pipeline.store().close().await;
    report
}
