//! Chunk retrieval by id.
//!
//! Fetches one metadata record from the generation matching the vector
//! index on disk. Used by `semsearch get` to inspect evidence cited in an
//! answer.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::models::MetadataRecord;
use crate::store::MetadataStore;
use crate::vector_index::VectorIndex;

/// Core get function returning the record.
pub async fn get_chunk(config: &Config, chunk_id: &str) -> Result<MetadataRecord> {
    let index_run = VectorIndex::load_if_exists(&config.index.path)?
        .and_then(|index| index.run_id().map(str::to_string));

    let store = MetadataStore::open(&config.db.path).await?;
    let view = store.view_for(index_run.as_deref()).await?;
    let record = store.get(view, chunk_id).await;
    store.close().await;

    match record? {
        Some(record) => Ok(record),
        None => bail!("chunk not found: {}", chunk_id),
    }
}

/// CLI entry point: print the record to stdout.
pub async fn run_get(config: &Config, chunk_id: &str, json: bool) -> Result<()> {
    let record = get_chunk(config, chunk_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!("--- Chunk ---");
    println!("id:        {}", record.chunk_id);
    println!("document:  {}", record.document_path);
    println!("type:      {}", record.file_type);
    println!("date:      {}", record.doc_date);
    if let Some(ref rev) = record.revision {
        println!("revision:  {}", rev);
    }
    println!("ordinal:   {}", record.ordinal);
    println!("tag:       {}", record.tag.as_db_str());
    println!("bytes:     {}..{}", record.start_byte, record.end_byte);
    println!();
    println!("{}", record.text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::run_indexing;
    use crate::store::StoreView;
    use std::fs;

    #[tokio::test]
    async fn test_get_indexed_chunk() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path().join("notes");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("2024-06-01.md"), "Shipped the parser today.").unwrap();
        let config = Config::minimal_in(&tmp.path().join("data"));
        run_indexing(&root, &config).await.unwrap();

        let store = MetadataStore::open(&config.db.path).await.unwrap();
        let ids = store.all_chunk_ids(StoreView::Committed).await.unwrap();
        store.close().await;
        let id = ids.into_iter().next().unwrap();

        let record = get_chunk(&config, &id).await.unwrap();
        assert_eq!(record.text, "Shipped the parser today.");
        assert_eq!(record.doc_date.to_string(), "2024-06-01");

        assert!(get_chunk(&config, "missing").await.is_err());
    }
}
