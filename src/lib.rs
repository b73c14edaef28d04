//! # semsearch
//!
//! Local-first semantic search over a personal document tree.
//!
//! semsearch incrementally indexes notes and source files into a vector
//! index plus a metadata store, then answers questions with one of three
//! retrieval strategies and a local-first inference router.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐  ┌─────────┐  ┌──────────┐  ┌─────────────────────────┐
//! │ Scanner │─▶│ Chunker │─▶│ Embedder │─▶│ VectorIndex + Metadata  │
//! └─────────┘  └─────────┘  └──────────┘  │ (one atomic commit/run) │
//!                                         └───────────┬─────────────┘
//!                                                     │
//!   Query ─▶ Classifier ─▶ Strategy ─▶ Retriever ◀────┘
//!                                        │
//!                                        ▼
//!                          Synthesizer ─▶ InferenceRouter ─▶ Answer
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! semsearch init
//! semsearch index ~/journal
//! semsearch ask "what happened yesterday"
//! semsearch ask "should I switch the backup job to S3?"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`scanner`] | Document discovery |
//! | [`chunk`] | Structure-aware chunking |
//! | [`embedding`] | Embedding backends |
//! | [`vector_index`] | Persisted exact vector index |
//! | [`store`] | SQLite metadata store with staged runs |
//! | [`ingest`] | Indexing pipeline state machine |
//! | [`progress`] | Indexing progress reporting |
//! | [`classify`] | Query classification and date parsing |
//! | [`retrieval`] | Retrieval strategies |
//! | [`inference`] | Inference backends and router |
//! | [`synthesize`] | Prompt building and answer synthesis |
//! | [`query`] | Query pipeline |
//! | [`get`] | Chunk lookup |
//! | [`stats`] | Index statistics |

pub mod chunk;
pub mod classify;
pub mod config;
pub mod embedding;
pub mod error;
pub mod get;
pub mod inference;
pub mod ingest;
pub mod models;
pub mod progress;
pub mod query;
pub mod retrieval;
pub mod scanner;
pub mod stats;
pub mod store;
pub mod synthesize;
pub mod vector_index;

pub use error::{Result, SearchError};
pub use ingest::run_indexing;
pub use query::run_query;
