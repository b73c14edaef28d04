//! # semsearch CLI
//!
//! The `semsearch` binary indexes a document tree and answers questions
//! about it.
//!
//! ## Usage
//!
//! ```bash
//! semsearch --config ./config/semsearch.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `semsearch init` | Create the metadata store schema |
//! | `semsearch index [ROOT]` | Incrementally index a document tree |
//! | `semsearch ask "<question>"` | Classify, retrieve and answer |
//! | `semsearch search "<query>"` | Direct similarity evidence only |
//! | `semsearch get <chunk-id>` | Print one metadata record |
//! | `semsearch stats` | Counts, index header and last run |
//! | `semsearch config` | Print the effective configuration |
//!
//! ## Examples
//!
//! ```bash
//! # Index the journal, showing progress
//! semsearch index ~/journal --progress human
//!
//! # Rebuild after changing the embedding model
//! semsearch index ~/journal --full
//!
//! # Temporal question, answered from yesterday's notes
//! semsearch ask "what happened yesterday"
//!
//! # Advisory question, written to a Markdown file
//! semsearch ask "should I move the backups to S3?" --output answer.md
//! ```

use anyhow::{bail, Context};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use semsearch::config::{self, Config};
use semsearch::ingest::IndexingPipeline;
use semsearch::models::{
    resolve_path_prefix, DateRange, OutputMode, Query, QueryFilters, QueryType,
};
use semsearch::progress::ProgressMode;
use semsearch::query::QueryEngine;
use semsearch::store::MetadataStore;
use semsearch::{get, stats};

const DEFAULT_CONFIG: &str = "./config/semsearch.toml";

/// semsearch: local-first semantic search over your notes and code.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Without one, defaults are used and data lives under `./data`.
#[derive(Parser)]
#[command(
    name = "semsearch",
    about = "Local-first semantic search with grounded answers",
    version,
    long_about = "semsearch incrementally indexes a document tree into a vector index and a \
    metadata store, then answers questions with direct, temporal or multi-round retrieval \
    and a local-first inference router."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the metadata store schema.
    ///
    /// Idempotent: running it again leaves existing data untouched.
    Init,

    /// Index a document tree.
    ///
    /// Only documents whose content changed since the last run are chunked
    /// and embedded again. Documents removed from the tree are retired.
    Index {
        /// Root directory; defaults to `[scanner].root` from the config.
        root: Option<PathBuf>,

        /// Re-index everything and rebuild the vector index from scratch.
        #[arg(long)]
        full: bool,

        /// Progress output on stderr: `human`, `json` or `off`.
        /// Defaults to `human` when stderr is a terminal.
        #[arg(long)]
        progress: Option<String>,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Ask a question and get an answer grounded in the index.
    Ask {
        question: String,

        /// Only use documents dated on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Only use documents dated on or before this date (YYYY-MM-DD).
        #[arg(long)]
        until: Option<String>,

        /// Only use documents under this path prefix.
        #[arg(long)]
        path: Option<String>,

        /// Only use documents with this extension (repeatable).
        #[arg(long = "type")]
        file_types: Vec<String>,

        /// Skip classification: `direct`, `temporal` or `advisory`.
        #[arg(long)]
        mode: Option<String>,

        /// Write the answer as Markdown to this file.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Print the full answer as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the chunks most similar to a query, without inference.
    Search {
        query: String,

        /// Number of results.
        #[arg(long)]
        k: Option<usize>,

        /// Only search documents under this path prefix.
        #[arg(long)]
        path: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Print one chunk's metadata record.
    Get {
        chunk_id: String,

        #[arg(long)]
        json: bool,
    },

    /// Show index statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML.
    Config,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("semsearch=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load the config file, or defaults when the default path does not exist.
fn load(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else if path == Path::new(DEFAULT_CONFIG) {
        info!("no config file at {}, using defaults", path.display());
        Ok(Config::minimal())
    } else {
        bail!("config file not found: {}", path.display())
    }
}

fn parse_date(flag: &str, value: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("--{} expects YYYY-MM-DD, got '{}'", flag, value))
}

fn date_filter(since: Option<String>, until: Option<String>) -> anyhow::Result<Option<DateRange>> {
    let since = since.map(|s| parse_date("since", &s)).transpose()?;
    let until = until.map(|s| parse_date("until", &s)).transpose()?;
    let earliest = NaiveDate::from_ymd_opt(1, 1, 1).unwrap_or(NaiveDate::MIN);
    Ok(match (since, until) {
        (None, None) => None,
        (Some(start), None) => Some(DateRange::new(start, Local::now().date_naive())),
        (None, Some(end)) => Some(DateRange::new(earliest, end)),
        (Some(start), Some(end)) => Some(DateRange::new(start, end)),
    })
}

fn path_filter(path: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(prefix) = path else {
        return Ok(None);
    };
    let cwd = std::env::current_dir()
        .context("cannot resolve --path against the current directory")?;
    Ok(Some(resolve_path_prefix(&prefix, &cwd)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = load(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let store = MetadataStore::open(&cfg.db.path).await?;
            store.close().await;
            println!("Metadata store initialized at {}.", cfg.db.path.display());
        }
        Commands::Index {
            root,
            full,
            progress,
            json,
        } => {
            let root = match root.or_else(|| cfg.scanner.root.clone()) {
                Some(root) => root,
                None => bail!("no root given and [scanner].root is not set"),
            };
            let mode = match progress.as_deref() {
                Some(p) => match ProgressMode::parse(p) {
                    Some(m) => m,
                    None => bail!("--progress must be human, json or off"),
                },
                None => ProgressMode::default_for_tty(),
            };

            let pipeline = IndexingPipeline::open(&cfg)
                .await?
                .full_rebuild(full)
                .with_progress(mode.reporter());
            let report = pipeline.run(&root).await;
            pipeline.store().close().await;
            let report = report?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "Indexed {}: {} scanned, {} updated, {} unchanged, {} removed, {} failed ({} chunks written)",
                    root.display(),
                    report.documents_scanned,
                    report.documents_updated,
                    report.documents_unchanged,
                    report.documents_removed,
                    report.documents_failed,
                    report.chunks_written
                );
                for failure in &report.failures {
                    println!(
                        "  failed: {} [{} during {}] {}",
                        failure.path, failure.kind, failure.stage, failure.message
                    );
                }
            }
        }
        Commands::Ask {
            question,
            since,
            until,
            path,
            file_types,
            mode,
            output,
            json,
        } => {
            let query_type = match mode.as_deref() {
                Some(m) => match QueryType::parse(m) {
                    Some(t) => Some(t),
                    None => bail!("--mode must be direct, temporal or advisory"),
                },
                None => None,
            };
            let filters = QueryFilters {
                date_range: date_filter(since, until)?,
                path_prefix: path_filter(path)?,
                file_types,
                query_type,
            };
            let query = Query {
                text: question,
                filters,
                output: output.map(OutputMode::File).unwrap_or_default(),
            };

            let engine = QueryEngine::open(&cfg).await?;
            let answer = engine.ask(&query).await;
            engine.store().close().await;
            let answer = answer?;

            if json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else if let Some(err) = &answer.error {
                bail!("{}: {}", err.kind, err.message);
            } else {
                println!("{}", answer.text);
                if !answer.evidence.is_empty() {
                    println!();
                    println!("Sources:");
                    for (i, item) in answer.evidence.iter().enumerate() {
                        println!(
                            "  [{}] {} ({}) {:.3}",
                            i + 1,
                            item.record.document_path,
                            item.record.doc_date,
                            item.score
                        );
                    }
                }
                if let Some(path) = &answer.written_to {
                    println!();
                    println!("Answer written to {}", path.display());
                }
            }
        }
        Commands::Search { query, k, path, json } => {
            let filters = QueryFilters {
                path_prefix: path_filter(path)?,
                ..QueryFilters::default()
            };
            let engine = QueryEngine::open(&cfg).await?;
            let results = engine
                .search(&query, &filters, k.unwrap_or(cfg.retrieval.k))
                .await;
            engine.store().close().await;
            let results = results?;

            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if results.is_empty() {
                println!("No results.");
            } else {
                for (i, item) in results.iter().enumerate() {
                    let snippet: String = item.record.text.chars().take(160).collect();
                    println!(
                        "{}. [{:.3}] {} ({})",
                        i + 1,
                        item.score,
                        item.record.document_path,
                        item.record.doc_date
                    );
                    println!("    id: {}", item.record.chunk_id);
                    println!("    {}", snippet.replace('\n', " "));
                }
            }
        }
        Commands::Get { chunk_id, json } => {
            get::run_get(&cfg, &chunk_id, json).await?;
        }
        Commands::Stats { json } => {
            stats::run_stats(&cfg, json).await?;
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&cfg)?);
        }
    }

    Ok(())
}
