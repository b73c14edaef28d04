//! Index statistics and health overview.
//!
//! Summarizes what is indexed: committed documents and chunks, the date
//! span they cover, the vector index's model and run id, and the last
//! indexing run. Used by `semsearch stats` to confirm the two stores agree.

use anyhow::Result;
use serde::Serialize;

use crate::config::Config;
use crate::store::{MetadataStore, StoreStats};
use crate::vector_index::VectorIndex;

/// Vector index header as seen on disk.
#[derive(Debug, Clone, Serialize)]
pub struct IndexInfo {
    pub model: String,
    pub dims: usize,
    pub vectors: usize,
    pub run_id: Option<String>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub store: StoreStats,
    pub index: Option<IndexInfo>,
    pub db_size_bytes: u64,
}

impl Overview {
    /// Vector count equals committed chunk count.
    pub fn consistent(&self) -> bool {
        let vectors = self.index.as_ref().map_or(0, |i| i.vectors) as i64;
        vectors == self.store.chunks
    }
}

pub async fn collect(config: &Config) -> Result<Overview> {
    let store = MetadataStore::open(&config.db.path).await?;
    let stats = store.stats().await;
    store.close().await;

    let index = VectorIndex::load_if_exists(&config.index.path)?.map(|index| IndexInfo {
        model: index.model().to_string(),
        dims: index.dims(),
        vectors: index.len(),
        run_id: index.run_id().map(str::to_string),
        size_bytes: file_size(&config.index.path),
    });

    Ok(Overview {
        store: stats?,
        index,
        db_size_bytes: file_size(&config.db.path),
    })
}

fn file_size(path: &std::path::Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Run the stats command and print a summary.
pub async fn run_stats(config: &Config, json: bool) -> Result<()> {
    let overview = collect(config).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&overview)?);
        return Ok(());
    }

    let s = &overview.store;
    println!("semsearch stats");
    println!("===============");
    println!();
    println!("  Metadata:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(overview.db_size_bytes));
    println!("  Documents:   {}", s.documents);
    println!("  Chunks:      {}", s.chunks);
    if s.pending_chunks > 0 {
        println!("  Pending:     {} (unfinished run)", s.pending_chunks);
    }
    if let (Some(oldest), Some(newest)) = (&s.oldest_doc_date, &s.newest_doc_date) {
        println!("  Dates:       {} .. {}", oldest, newest);
    }

    println!();
    match &overview.index {
        Some(index) => {
            println!("  Index:       {}", config.index.path.display());
            println!("  Size:        {}", format_bytes(index.size_bytes));
            println!("  Model:       {} ({} dims)", index.model, index.dims);
            println!("  Vectors:     {}", index.vectors);
            println!(
                "  Run:         {}",
                index.run_id.as_deref().unwrap_or("(none)")
            );
        }
        None => println!("  Index:       (not built yet)"),
    }

    if let Some(run) = &s.last_run {
        println!();
        println!(
            "  Last run:    {} {} ({})",
            run.run_id,
            run.status,
            format_ts_relative(run.finished_at.unwrap_or(run.started_at))
        );
    }

    println!();
    if overview.consistent() {
        println!("  Stores consistent.");
    } else {
        println!("  Stores disagree; the next `semsearch index` run repairs them.");
    }
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::run_indexing;
    use std::fs;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_format_ts_relative_recent() {
        assert_eq!(format_ts_relative(chrono::Utc::now().timestamp()), "just now");
    }

    #[tokio::test]
    async fn test_overview_after_index() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path().join("notes");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("2024-06-01.md"), "# Day\n\nShipped the parser.").unwrap();
        let config = Config::minimal_in(&tmp.path().join("data"));

        let empty = collect(&config).await.unwrap();
        assert!(empty.index.is_none());
        assert!(empty.consistent());

        let report = run_indexing(&root, &config).await.unwrap();
        let overview = collect(&config).await.unwrap();
        assert_eq!(overview.store.documents, 1);
        assert!(overview.consistent());
        assert_eq!(
            overview.index.as_ref().and_then(|i| i.run_id.clone()),
            Some(report.run_id)
        );
    }
}
