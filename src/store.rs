//! SQLite metadata store.
//!
//! Holds document bookkeeping (content hashes) and one row per chunk with the
//! metadata the query side filters on. Chunk rows move through three states:
//!
//! ```text
//! pending ──finalize──▶ active ──commit of a newer version──▶ retiring ──finalize──▶ (deleted)
//!    └──────rollback──▶ (deleted)           retiring ──rollback──▶ active
//! ```
//!
//! An indexing run writes `pending` rows and marks replaced rows `retiring`
//! document by document, persists the vector index stamped with its run id,
//! then calls [`MetadataStore::finalize_run`]. Readers choose the generation
//! through a [`StoreView`] derived from the run id of the vector index they
//! loaded, so the rows they see always match the vectors they search.

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::error::{Result, SearchError};
use crate::models::{Chunk, DateRange, MetadataRecord, QueryFilters, SourceDocument, StructuralTag};

const RECORD_COLUMNS: &str = "id, document_path, file_type, doc_date, modified_at, revision, \
                              ordinal, tag, start_byte, end_byte, text";

/// Which generation of chunk rows a reader sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreView {
    /// Rows of the last finalized run (`active` plus `retiring`).
    Committed,
    /// Rows of the run in progress (`active` plus `pending`). Used when the
    /// vector index on disk was already persisted by that run.
    Pending,
}

impl StoreView {
    fn states(&self) -> &'static str {
        match self {
            StoreView::Committed => "('active', 'retiring')",
            StoreView::Pending => "('active', 'pending')",
        }
    }
}

/// What [`MetadataStore::recover`] did with an unfinished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    RolledForward(String),
    RolledBack(String),
}

/// Committed content hash of a document plus the file stat seen when it was
/// indexed. The stat is absent for rows written before it was recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentFingerprint {
    pub content_hash: String,
    pub size: Option<i64>,
    pub modified_us: Option<i64>,
}

impl DocumentFingerprint {
    pub fn stat_matches(&self, doc: &SourceDocument) -> bool {
        self.size == Some(doc.size as i64)
            && self.modified_us == Some(doc.modified_at.timestamp_micros())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub documents: i64,
    pub chunks: i64,
    pub pending_chunks: i64,
    pub oldest_doc_date: Option<String>,
    pub newest_doc_date: Option<String>,
    pub last_run: Option<RunSummary>,
}

#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Open (creating if needed) the store at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| SearchError::io(parent, e))?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                path TEXT PRIMARY KEY,
                content_hash TEXT,
                pending_hash TEXT,
                pending_run TEXT,
                pending_op TEXT,
                indexed_at INTEGER,
                size INTEGER,
                modified_us INTEGER,
                pending_size INTEGER,
                pending_modified_us INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Databases created before stat columns existed.
        let columns: Vec<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info('documents')")
                .fetch_all(&self.pool)
                .await?;
        for column in ["size", "modified_us", "pending_size", "pending_modified_us"] {
            if !columns.iter().any(|c| c == column) {
                sqlx::query(&format!("ALTER TABLE documents ADD COLUMN {} INTEGER", column))
                    .execute(&self.pool)
                    .await?;
            }
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT NOT NULL,
                document_path TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                text TEXT NOT NULL,
                hash TEXT NOT NULL,
                tag TEXT NOT NULL,
                start_byte INTEGER NOT NULL,
                end_byte INTEGER NOT NULL,
                file_type TEXT NOT NULL,
                doc_date TEXT NOT NULL,
                modified_at INTEGER NOT NULL,
                revision TEXT,
                state TEXT NOT NULL,
                run_id TEXT NOT NULL,
                retired_by TEXT,
                PRIMARY KEY (id, state)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS index_runs (
                run_id TEXT PRIMARY KEY,
                started_at INTEGER NOT NULL,
                finished_at INTEGER,
                status TEXT NOT NULL,
                full_rebuild INTEGER NOT NULL DEFAULT 0,
                report_json TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for stmt in [
            "CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_path)",
            "CREATE INDEX IF NOT EXISTS idx_chunks_doc_date ON chunks(doc_date)",
            "CREATE INDEX IF NOT EXISTS idx_chunks_state ON chunks(state, run_id)",
        ] {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ============ Run lifecycle ============

    pub async fn begin_run(&self, run_id: &str, full_rebuild: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO index_runs (run_id, started_at, status, full_rebuild) VALUES (?, ?, 'running', ?)",
        )
        .bind(run_id)
        .bind(Utc::now().timestamp())
        .bind(full_rebuild)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The run id of an unfinished run, if any.
    pub async fn unfinished_run(&self) -> Result<Option<String>> {
        let run: Option<String> = sqlx::query_scalar(
            "SELECT run_id FROM index_runs WHERE status = 'running' ORDER BY started_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(run)
    }

    /// Replace a document's chunks as one transaction.
    ///
    /// Active rows become `retiring`, `chunks` are inserted as `pending`,
    /// and `content_hash` is staged. Returns the ids that were active before.
    pub async fn commit_document(
        &self,
        run_id: &str,
        doc: &SourceDocument,
        content_hash: &str,
        chunks: &[Chunk],
    ) -> Result<Vec<String>> {
        let path = doc.key();
        let mut tx = self.pool.begin().await?;

        let previous: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM chunks WHERE document_path = ? AND state = 'active'",
        )
        .bind(&path)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE chunks SET state = 'retiring', retired_by = ? WHERE document_path = ? AND state = 'active'",
        )
        .bind(run_id)
        .bind(&path)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks WHERE document_path = ? AND state = 'pending' AND run_id = ?")
            .bind(&path)
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        let doc_date = doc.doc_date.format("%Y-%m-%d").to_string();
        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_path, ordinal, text, hash, tag, start_byte, end_byte,
                                    file_type, doc_date, modified_at, revision, state, run_id)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&path)
            .bind(chunk.ordinal)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .bind(chunk.tag.as_db_str())
            .bind(chunk.start_byte as i64)
            .bind(chunk.end_byte as i64)
            .bind(&doc.file_type)
            .bind(&doc_date)
            .bind(doc.modified_at.timestamp())
            .bind(&doc.revision)
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO documents (path, pending_hash, pending_run, pending_op,
                                   pending_size, pending_modified_us)
            VALUES (?, ?, ?, 'update', ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                pending_hash = excluded.pending_hash,
                pending_run = excluded.pending_run,
                pending_op = 'update',
                pending_size = excluded.pending_size,
                pending_modified_us = excluded.pending_modified_us
            "#,
        )
        .bind(&path)
        .bind(content_hash)
        .bind(run_id)
        .bind(doc.size as i64)
        .bind(doc.modified_at.timestamp_micros())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(path = %path, chunks = chunks.len(), retired = previous.len(), "document staged");
        Ok(previous)
    }

    /// Stage removal of a document. Returns the chunk ids it had.
    pub async fn remove_document(&self, run_id: &str, path: &str) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;

        let previous: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM chunks WHERE document_path = ? AND state = 'active'",
        )
        .bind(path)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE chunks SET state = 'retiring', retired_by = ? WHERE document_path = ? AND state = 'active'",
        )
        .bind(run_id)
        .bind(path)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE documents SET pending_hash = NULL, pending_run = ?, pending_op = 'remove' WHERE path = ?",
        )
        .bind(run_id)
        .bind(path)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(previous)
    }

    /// Make everything staged by `run_id` the committed generation.
    ///
    /// Must run only after the vector index has been persisted with `run_id`.
    pub async fn finalize_run(&self, run_id: &str, report_json: Option<&str>) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE state = 'retiring' AND retired_by = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE chunks SET state = 'active' WHERE state = 'pending' AND run_id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE pending_run = ? AND pending_op = 'remove'")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            UPDATE documents SET content_hash = pending_hash, pending_hash = NULL,
                size = pending_size, modified_us = pending_modified_us,
                pending_size = NULL, pending_modified_us = NULL,
                pending_run = NULL, pending_op = NULL, indexed_at = ?
            WHERE pending_run = ?
            "#,
        )
        .bind(now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE index_runs SET status = 'completed', finished_at = ?, report_json = COALESCE(?, report_json) WHERE run_id = ?",
        )
        .bind(now)
        .bind(report_json)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(run_id, "run finalized");
        Ok(())
    }

    /// Undo everything staged by `run_id`, restoring the previous generation.
    pub async fn rollback_run(&self, run_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE state = 'pending' AND run_id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE chunks SET state = 'active', retired_by = NULL WHERE state = 'retiring' AND retired_by = ?",
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            UPDATE documents SET pending_hash = NULL, pending_run = NULL, pending_op = NULL,
                pending_size = NULL, pending_modified_us = NULL
            WHERE pending_run = ?
            "#,
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            DELETE FROM documents WHERE content_hash IS NULL
              AND path NOT IN (SELECT DISTINCT document_path FROM chunks)
            "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE index_runs SET status = 'rolled_back', finished_at = ? WHERE run_id = ?")
            .bind(Utc::now().timestamp())
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        warn!(run_id, "run rolled back");
        Ok(())
    }

    /// Resolve an unfinished run left by a crash.
    ///
    /// `index_run_id` is the run id found in the persisted vector index. If
    /// the unfinished run got as far as persisting the index it is rolled
    /// forward, otherwise it is rolled back.
    pub async fn recover(&self, index_run_id: Option<&str>) -> Result<Option<Recovery>> {
        let Some(run_id) = self.unfinished_run().await? else {
            return Ok(None);
        };
        if index_run_id == Some(run_id.as_str()) {
            self.finalize_run(&run_id, None).await?;
            Ok(Some(Recovery::RolledForward(run_id)))
        } else {
            self.rollback_run(&run_id).await?;
            Ok(Some(Recovery::RolledBack(run_id)))
        }
    }

    /// The view matching a vector index persisted with `index_run_id`.
    pub async fn view_for(&self, index_run_id: Option<&str>) -> Result<StoreView> {
        match (self.unfinished_run().await?, index_run_id) {
            (Some(pending), Some(index)) if pending == index => Ok(StoreView::Pending),
            _ => Ok(StoreView::Committed),
        }
    }

    // ============ Documents ============

    /// Committed content hash of a document.
    pub async fn document_hash(&self, path: &str) -> Result<Option<String>> {
        let hash: Option<Option<String>> =
            sqlx::query_scalar("SELECT content_hash FROM documents WHERE path = ?")
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;
        Ok(hash.flatten())
    }

    /// Committed hash and file stat of a document.
    pub async fn document_fingerprint(&self, path: &str) -> Result<Option<DocumentFingerprint>> {
        let row: Option<(Option<String>, Option<i64>, Option<i64>)> = sqlx::query_as(
            "SELECT content_hash, size, modified_us FROM documents WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(hash, size, modified_us)| {
            hash.map(|content_hash| DocumentFingerprint {
                content_hash,
                size,
                modified_us,
            })
        }))
    }

    /// Record a new stat for a committed document whose content is unchanged.
    pub async fn refresh_document_stat(&self, doc: &SourceDocument) -> Result<()> {
        sqlx::query(
            "UPDATE documents SET size = ?, modified_us = ? WHERE path = ? AND content_hash IS NOT NULL",
        )
        .bind(doc.size as i64)
        .bind(doc.modified_at.timestamp_micros())
        .bind(doc.key())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Indexed document paths located under `root`.
    pub async fn list_document_paths(&self, root: &Path) -> Result<Vec<String>> {
        Ok(self
            .all_document_paths()
            .await?
            .into_iter()
            .filter(|p| Path::new(p).starts_with(root))
            .collect())
    }

    /// Every indexed document path, whatever root it was indexed from.
    pub async fn all_document_paths(&self) -> Result<Vec<String>> {
        let paths: Vec<String> = sqlx::query_scalar("SELECT path FROM documents ORDER BY path")
            .fetch_all(&self.pool)
            .await?;
        Ok(paths)
    }

    /// Forget the committed hash of `paths` so the next run re-indexes them.
    pub async fn invalidate_documents(&self, paths: &[String]) -> Result<()> {
        for path in paths {
            sqlx::query("UPDATE documents SET content_hash = NULL WHERE path = ?")
                .bind(path)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Document paths owning any of `chunk_ids`.
    pub async fn documents_for_chunks(&self, chunk_ids: &[String]) -> Result<Vec<String>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT DISTINCT document_path FROM chunks WHERE id IN (");
        let mut sep = qb.separated(", ");
        for id in chunk_ids {
            sep.push_bind(id.clone());
        }
        qb.push(") ORDER BY document_path");
        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(|r| r.get::<String, _>(0)).collect())
    }

    // ============ Chunk records ============

    pub async fn all_chunk_ids(&self, view: StoreView) -> Result<HashSet<String>> {
        let sql = format!("SELECT id FROM chunks WHERE state IN {}", view.states());
        let ids: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;
        Ok(ids.into_iter().collect())
    }

    pub async fn get(&self, view: StoreView, chunk_id: &str) -> Result<Option<MetadataRecord>> {
        let sql = format!(
            "SELECT {} FROM chunks WHERE id = ? AND state IN {}",
            RECORD_COLUMNS,
            view.states()
        );
        let row = sqlx::query(&sql)
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(record_from_row))
    }

    /// Records for `chunk_ids`, in the same order. Unknown ids are skipped.
    pub async fn get_many(&self, view: StoreView, chunk_ids: &[String]) -> Result<Vec<MetadataRecord>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM chunks WHERE state IN {} AND id IN (",
            RECORD_COLUMNS,
            view.states()
        ));
        let mut sep = qb.separated(", ");
        for id in chunk_ids {
            sep.push_bind(id.clone());
        }
        qb.push(")");
        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut by_id: std::collections::HashMap<String, MetadataRecord> = rows
            .iter()
            .map(record_from_row)
            .map(|r| (r.chunk_id.clone(), r))
            .collect();
        Ok(chunk_ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// Records matching every filter that is set, newest date first, then
    /// by path and ordinal.
    pub async fn query_records(
        &self,
        view: StoreView,
        filters: &QueryFilters,
    ) -> Result<Vec<MetadataRecord>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM chunks WHERE state IN {}",
            RECORD_COLUMNS,
            view.states()
        ));
        push_filters(&mut qb, filters);
        qb.push(" ORDER BY doc_date DESC, document_path ASC, ordinal ASC");
        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(record_from_row).collect())
    }

    /// Chunk ids matching the filters; used to narrow vector search.
    pub async fn chunk_ids_matching(
        &self,
        view: StoreView,
        filters: &QueryFilters,
    ) -> Result<HashSet<String>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT id FROM chunks WHERE state IN {}",
            view.states()
        ));
        push_filters(&mut qb, filters);
        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(|r| r.get::<String, _>(0)).collect())
    }

    pub async fn query_by_date_range(
        &self,
        view: StoreView,
        range: DateRange,
    ) -> Result<Vec<MetadataRecord>> {
        let filters = QueryFilters {
            date_range: Some(range),
            ..QueryFilters::default()
        };
        self.query_records(view, &filters).await
    }

    pub async fn query_by_path_prefix(
        &self,
        view: StoreView,
        prefix: &str,
    ) -> Result<Vec<MetadataRecord>> {
        let filters = QueryFilters {
            path_prefix: Some(prefix.to_string()),
            ..QueryFilters::default()
        };
        self.query_records(view, &filters).await
    }

    pub async fn query_by_file_type(
        &self,
        view: StoreView,
        file_type: &str,
    ) -> Result<Vec<MetadataRecord>> {
        let filters = QueryFilters {
            file_types: vec![file_type.to_string()],
            ..QueryFilters::default()
        };
        self.query_records(view, &filters).await
    }

    // ============ Stats ============

    pub async fn stats(&self) -> Result<StoreStats> {
        let documents: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM documents WHERE content_hash IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE state = 'active'")
            .fetch_one(&self.pool)
            .await?;
        let pending_chunks: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE state = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        let (oldest_doc_date, newest_doc_date): (Option<String>, Option<String>) =
            sqlx::query_as("SELECT MIN(doc_date), MAX(doc_date) FROM chunks WHERE state = 'active'")
                .fetch_one(&self.pool)
                .await?;

        let last_run = sqlx::query(
            "SELECT run_id, status, started_at, finished_at FROM index_runs ORDER BY started_at DESC, rowid DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?
        .map(|row| RunSummary {
            run_id: row.get("run_id"),
            status: row.get("status"),
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
        });

        Ok(StoreStats {
            documents,
            chunks,
            pending_chunks,
            oldest_doc_date,
            newest_doc_date,
            last_run,
        })
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filters: &QueryFilters) {
    if let Some(range) = filters.date_range {
        qb.push(" AND doc_date >= ")
            .push_bind(range.start.format("%Y-%m-%d").to_string())
            .push(" AND doc_date <= ")
            .push_bind(range.end.format("%Y-%m-%d").to_string());
    }
    if let Some(prefix) = &filters.path_prefix {
        // substr comparison avoids LIKE wildcard escaping
        qb.push(" AND substr(document_path, 1, ")
            .push_bind(prefix.len() as i64)
            .push(") = ")
            .push_bind(prefix.clone());
    }
    if !filters.file_types.is_empty() {
        qb.push(" AND file_type IN (");
        let mut sep = qb.separated(", ");
        for ft in &filters.file_types {
            sep.push_bind(ft.trim_start_matches('.').to_ascii_lowercase());
        }
        qb.push(")");
    }
}

fn record_from_row(row: &SqliteRow) -> MetadataRecord {
    let doc_date: String = row.get("doc_date");
    let tag: String = row.get("tag");
    MetadataRecord {
        chunk_id: row.get("id"),
        document_path: row.get("document_path"),
        file_type: row.get("file_type"),
        doc_date: NaiveDate::parse_from_str(&doc_date, "%Y-%m-%d").unwrap_or(NaiveDate::MIN),
        modified_at: row.get("modified_at"),
        revision: row.get("revision"),
        ordinal: row.get("ordinal"),
        tag: StructuralTag::from_db_str(&tag),
        start_byte: row.get("start_byte"),
        end_byte: row.get("end_byte"),
        text: row.get("text"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_text, ChunkOptions};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn doc(path: &str, date: (i32, u32, u32)) -> SourceDocument {
        SourceDocument {
            path: path.into(),
            file_type: "md".into(),
            modified_at: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
            size: 10,
            revision: None,
            doc_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
        }
    }

    fn chunks(path: &str, text: &str) -> Vec<Chunk> {
        let opts = ChunkOptions {
            max_chars: 40,
            min_chars: 0,
            overlap_chars: 0,
        };
        chunk_text(path, text, "md", &opts)
    }

    async fn store(tmp: &TempDir) -> MetadataStore {
        MetadataStore::open(&tmp.path().join("meta.sqlite")).await.unwrap()
    }

    #[tokio::test]
    async fn test_commit_is_invisible_until_finalized() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let d = doc("/notes/a.md", (2024, 6, 1));
        let c = chunks("/notes/a.md", "First paragraph.\n\nSecond paragraph here.");

        store.begin_run("r1", false).await.unwrap();
        store.commit_document("r1", &d, "h1", &c).await.unwrap();

        assert!(store.all_chunk_ids(StoreView::Committed).await.unwrap().is_empty());
        assert_eq!(store.all_chunk_ids(StoreView::Pending).await.unwrap().len(), c.len());
        assert_eq!(store.document_hash("/notes/a.md").await.unwrap(), None);
        assert_eq!(store.view_for(Some("r1")).await.unwrap(), StoreView::Pending);
        assert_eq!(store.view_for(None).await.unwrap(), StoreView::Committed);

        store.finalize_run("r1", None).await.unwrap();
        assert_eq!(store.all_chunk_ids(StoreView::Committed).await.unwrap().len(), c.len());
        assert_eq!(
            store.document_hash("/notes/a.md").await.unwrap().as_deref(),
            Some("h1")
        );
        assert!(store.unfinished_run().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fingerprint_tracks_committed_stat() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let mut d = doc("/notes/a.md", (2024, 6, 1));

        store.begin_run("r1", false).await.unwrap();
        store
            .commit_document("r1", &d, "h1", &chunks("/notes/a.md", "Hello."))
            .await
            .unwrap();
        assert_eq!(store.document_fingerprint("/notes/a.md").await.unwrap(), None);
        store.finalize_run("r1", None).await.unwrap();

        let fp = store.document_fingerprint("/notes/a.md").await.unwrap().unwrap();
        assert_eq!(fp.content_hash, "h1");
        assert!(fp.stat_matches(&d));

        d.modified_at = Utc.with_ymd_and_hms(2024, 6, 2, 8, 0, 0).unwrap();
        assert!(!fp.stat_matches(&d));
        store.refresh_document_stat(&d).await.unwrap();
        let fp = store.document_fingerprint("/notes/a.md").await.unwrap().unwrap();
        assert!(fp.stat_matches(&d));
        assert_eq!(fp.content_hash, "h1");

        store.invalidate_documents(&["/notes/a.md".to_string()]).await.unwrap();
        assert_eq!(store.document_fingerprint("/notes/a.md").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_all_document_paths_spans_roots() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        store.begin_run("r1", false).await.unwrap();
        for path in ["/notes/a.md", "/work/b.md"] {
            store
                .commit_document("r1", &doc(path, (2024, 6, 1)), "h", &chunks(path, "Hello."))
                .await
                .unwrap();
        }
        store.finalize_run("r1", None).await.unwrap();

        assert_eq!(
            store.list_document_paths(Path::new("/notes")).await.unwrap(),
            vec!["/notes/a.md".to_string()]
        );
        assert_eq!(
            store.all_document_paths().await.unwrap(),
            vec!["/notes/a.md".to_string(), "/work/b.md".to_string()]
        );
    }

    #[tokio::test]
    async fn test_rollback_restores_previous_generation() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let d = doc("/notes/a.md", (2024, 6, 1));
        let old = chunks("/notes/a.md", "Old text.");
        let new = chunks("/notes/a.md", "New text, rather different.");

        store.begin_run("r1", false).await.unwrap();
        store.commit_document("r1", &d, "h1", &old).await.unwrap();
        store.finalize_run("r1", None).await.unwrap();

        store.begin_run("r2", false).await.unwrap();
        let retired = store.commit_document("r2", &d, "h2", &new).await.unwrap();
        assert_eq!(retired, vec![old[0].id.clone()]);
        // readers of the committed generation still see the old row
        let rec = store.get(StoreView::Committed, &old[0].id).await.unwrap();
        assert_eq!(rec.unwrap().text, "Old text.");

        store.rollback_run("r2").await.unwrap();
        let ids = store.all_chunk_ids(StoreView::Committed).await.unwrap();
        assert_eq!(ids, HashSet::from([old[0].id.clone()]));
        assert_eq!(
            store.document_hash("/notes/a.md").await.unwrap().as_deref(),
            Some("h1")
        );
    }

    #[tokio::test]
    async fn test_recover_rolls_forward_when_index_persisted() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let d = doc("/notes/a.md", (2024, 6, 1));
        store.begin_run("r1", false).await.unwrap();
        store
            .commit_document("r1", &d, "h1", &chunks("/notes/a.md", "Hello."))
            .await
            .unwrap();

        let action = store.recover(Some("r1")).await.unwrap();
        assert_eq!(action, Some(Recovery::RolledForward("r1".into())));
        assert_eq!(store.all_chunk_ids(StoreView::Committed).await.unwrap().len(), 1);
        assert_eq!(store.recover(Some("r1")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_recover_rolls_back_new_documents() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let d = doc("/notes/a.md", (2024, 6, 1));
        store.begin_run("r1", false).await.unwrap();
        store
            .commit_document("r1", &d, "h1", &chunks("/notes/a.md", "Hello."))
            .await
            .unwrap();

        let action = store.recover(None).await.unwrap();
        assert_eq!(action, Some(Recovery::RolledBack("r1".into())));
        assert!(store.all_chunk_ids(StoreView::Pending).await.unwrap().is_empty());
        assert!(store
            .list_document_paths(Path::new("/notes"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_remove_document() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let d = doc("/notes/a.md", (2024, 6, 1));
        store.begin_run("r1", false).await.unwrap();
        store
            .commit_document("r1", &d, "h1", &chunks("/notes/a.md", "Hello."))
            .await
            .unwrap();
        store.finalize_run("r1", None).await.unwrap();

        store.begin_run("r2", false).await.unwrap();
        let gone = store.remove_document("r2", "/notes/a.md").await.unwrap();
        assert_eq!(gone.len(), 1);
        store.finalize_run("r2", None).await.unwrap();

        assert!(store.all_chunk_ids(StoreView::Committed).await.unwrap().is_empty());
        assert!(store
            .list_document_paths(Path::new("/notes"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_filters_and_ordering() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        store.begin_run("r1", false).await.unwrap();
        for (path, date) in [
            ("/j/2024-06-01.md", (2024, 6, 1)),
            ("/j/2024-06-03.md", (2024, 6, 3)),
            ("/other/2024-06-02.md", (2024, 6, 2)),
        ] {
            store
                .commit_document("r1", &doc(path, date), "h", &chunks(path, "Entry text."))
                .await
                .unwrap();
        }
        store.finalize_run("r1", None).await.unwrap();

        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 6, 2).unwrap(),
            NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
        );
        let recs = store
            .query_by_date_range(StoreView::Committed, range)
            .await
            .unwrap();
        let paths: Vec<&str> = recs.iter().map(|r| r.document_path.as_str()).collect();
        assert_eq!(paths, vec!["/j/2024-06-03.md", "/other/2024-06-02.md"]);

        let recs = store
            .query_by_path_prefix(StoreView::Committed, "/j/")
            .await
            .unwrap();
        assert_eq!(recs.len(), 2);

        assert_eq!(
            store
                .query_by_file_type(StoreView::Committed, "md")
                .await
                .unwrap()
                .len(),
            3
        );
        assert!(store
            .query_by_file_type(StoreView::Committed, "rs")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_get_many_preserves_order() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let c = chunks(
            "/a.md",
            "First paragraph number one.\n\nSecond paragraph number two.\n\nThird paragraph number three.",
        );
        assert_eq!(c.len(), 3);
        store.begin_run("r1", false).await.unwrap();
        store
            .commit_document("r1", &doc("/a.md", (2024, 1, 1)), "h", &c)
            .await
            .unwrap();
        store.finalize_run("r1", None).await.unwrap();

        let ids = vec![c[2].id.clone(), "missing".to_string(), c[0].id.clone()];
        let recs = store.get_many(StoreView::Committed, &ids).await.unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].ordinal, 2);
        assert_eq!(recs[1].ordinal, 0);
        assert_eq!(recs[0].tag, StructuralTag::Paragraph);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.chunks, 3);
        assert_eq!(stats.last_run.unwrap().status, "completed");
    }
}
