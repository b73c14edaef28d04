//! Query pipeline.
//!
//! ```text
//! Query → classify → Strategy → Retriever → Synthesizer → Answer
//! ```
//!
//! Every query loads the vector index from disk and reads the metadata
//! store through the view matching that index's run id, so an indexing run
//! in progress is never observed half-applied.
//!
//! Failure policy: an error after classification is attached to the
//! [`Answer`] as an [`ErrorDescriptor`], except `InferenceUnavailable`
//! (all routed backends failed), which is returned as `Err` because no
//! answer can be produced at all.

use chrono::{Local, NaiveDate};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::classify::{classify, Classification};
use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::error::{Result, SearchError};
use crate::inference::InferenceRouter;
use crate::models::{
    Answer, ErrorDescriptor, EvidenceItem, OutputMode, Query, QueryFilters, StrategyKind,
};
use crate::retrieval::{LlmPlanner, Retrieval, RetrievalPlanner, Retriever, Strategy};
use crate::store::{MetadataStore, StoreView};
use crate::synthesize::{SynthesisRequest, Synthesizer};
use crate::vector_index::VectorIndex;

pub struct QueryEngine {
    config: Config,
    store: MetadataStore,
    embedder: Arc<dyn Embedder>,
    synthesizer: Synthesizer,
    planner: Arc<dyn RetrievalPlanner>,
    today: Option<NaiveDate>,
}

impl QueryEngine {
    /// Open the configured store, embedder and inference backends.
    pub async fn open(config: &Config) -> Result<Self> {
        let store = MetadataStore::open(&config.db.path).await?;
        let embedder = create_embedder(&config.embedding)?;
        let router = Arc::new(InferenceRouter::from_config(&config.inference)?);
        Ok(Self::new(config, store, embedder, router))
    }

    pub fn new(
        config: &Config,
        store: MetadataStore,
        embedder: Arc<dyn Embedder>,
        router: Arc<InferenceRouter>,
    ) -> Self {
        Self {
            synthesizer: Synthesizer::new(
                Arc::clone(&router),
                config.retrieval.prompt_budget_chars,
                config.retrieval.reduce_fan_in,
            ),
            planner: Arc::new(LlmPlanner::new(router)),
            config: config.clone(),
            store,
            embedder,
            today: None,
        }
    }

    /// Replace the agent orchestrator's planner.
    pub fn with_planner(mut self, planner: Arc<dyn RetrievalPlanner>) -> Self {
        self.planner = planner;
        self
    }

    /// Resolve relative dates against `today` instead of the local date.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Local::now().date_naive())
    }

    fn load_index(&self) -> Result<VectorIndex> {
        let model = self.embedder.model_id();
        let dims = self.embedder.dims();
        match VectorIndex::load_if_exists(&self.config.index.path)? {
            Some(index) => {
                index.ensure_compatible(model, dims)?;
                Ok(index)
            }
            None => Ok(VectorIndex::new(model, dims)),
        }
    }

    /// Answer one query.
    pub async fn ask(&self, query: &Query) -> Result<Answer> {
        let classification = classify(
            &query.text,
            &query.filters,
            self.today(),
            self.config.retrieval.temporal_default_days,
        );
        let strategy = Strategy::for_query(&classification, &self.config.retrieval);
        info!(
            query_type = classification.query_type.as_str(),
            strategy = strategy.kind().as_str(),
            ambiguous = classification.ambiguous,
            "query classified"
        );

        let mut answer = match self.answer(query, &classification, &strategy).await {
            Ok(answer) => answer,
            Err(e @ SearchError::InferenceUnavailable { .. }) => return Err(e),
            Err(e) => {
                warn!(error = %e, "query failed");
                error_answer(&classification, strategy.kind(), &e)
            }
        };

        if let OutputMode::File(path) = &query.output {
            match write_markdown(path, &query.text, &answer) {
                Ok(()) => answer.written_to = Some(path.clone()),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "writing answer file failed");
                    answer.error = Some(ErrorDescriptor::from(&e));
                }
            }
        }
        Ok(answer)
    }

    async fn answer(
        &self,
        query: &Query,
        classification: &Classification,
        strategy: &Strategy,
    ) -> Result<Answer> {
        let Retrieval { evidence, rounds } = self
            .retrieve(strategy, &query.text, &query.filters)
            .await?;

        let synthesis = self
            .synthesizer
            .synthesize(&SynthesisRequest {
                question: &query.text,
                query_type: classification.query_type,
                strategy: strategy.kind(),
                date_range: classification.date_range,
                evidence: &evidence,
            })
            .await?;

        Ok(Answer {
            text: synthesis.text,
            backend: synthesis.backend,
            evidence,
            query_type: classification.query_type,
            strategy: strategy.kind(),
            rounds,
            error: None,
            written_to: None,
        })
    }

    fn retriever<'a>(&'a self, index: &'a VectorIndex, view: StoreView) -> Retriever<'a> {
        Retriever {
            store: &self.store,
            view,
            index,
            embedder: self.embedder.as_ref(),
            planner: self.planner.as_ref(),
            config: &self.config.retrieval,
        }
    }

    async fn retrieve(
        &self,
        strategy: &Strategy,
        text: &str,
        filters: &QueryFilters,
    ) -> Result<Retrieval> {
        let index = self.load_index()?;
        let view = self.store.view_for(index.run_id()).await?;
        self.retriever(&index, view)
            .retrieve(strategy, text, filters)
            .await
    }

    /// Direct similarity evidence only, without inference.
    pub async fn search(
        &self,
        text: &str,
        filters: &QueryFilters,
        k: usize,
    ) -> Result<Vec<EvidenceItem>> {
        let index = self.load_index()?;
        let view = self.store.view_for(index.run_id()).await?;
        self.retriever(&index, view).direct(text, filters, k).await
    }
}

fn error_answer(
    classification: &Classification,
    strategy: StrategyKind,
    err: &SearchError,
) -> Answer {
    Answer {
        text: String::new(),
        backend: None,
        evidence: Vec::new(),
        query_type: classification.query_type,
        strategy,
        rounds: 0,
        error: Some(ErrorDescriptor::from(err)),
        written_to: None,
    }
}

/// Render an answer as Markdown with a numbered Sources section.
pub fn render_markdown(question: &str, answer: &Answer) -> String {
    let mut out = format!("# {}\n\n", question.trim());
    match &answer.error {
        Some(err) => out.push_str(&format!("**Error ({})**: {}\n", err.kind, err.message)),
        None => {
            out.push_str(answer.text.trim());
            out.push('\n');
        }
    }
    if !answer.evidence.is_empty() {
        out.push_str("\n## Sources\n\n");
        for (i, item) in answer.evidence.iter().enumerate() {
            out.push_str(&format!(
                "{}. `{}` ({}, chunk {}, score {:.3})\n",
                i + 1,
                item.record.document_path,
                item.record.doc_date,
                item.record.chunk_id,
                item.score
            ));
        }
    }
    out.push_str(&format!(
        "\n---\n_{} query, {} strategy, backend {}_\n",
        answer.query_type.as_str(),
        answer.strategy.as_str(),
        answer.backend.as_deref().unwrap_or("none")
    ));
    out
}

fn write_markdown(path: &Path, question: &str, answer: &Answer) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| SearchError::io(parent, e))?;
        }
    }
    std::fs::write(path, render_markdown(question, answer)).map_err(|e| SearchError::io(path, e))
}

/// Answer `text` with the configured store, index and backends.
pub async fn run_query(
    config: &Config,
    text: &str,
    filters: QueryFilters,
    output: OutputMode,
) -> Result<Answer> {
    let engine = QueryEngine::open(config).await?;
    let query = Query {
        text: text.to_string(),
        filters,
        output,
    };
    let answer = engine.ask(&query).await;
    engine.store().close().await;
    answer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MetadataRecord, QueryType, StructuralTag};

    #[test]
    fn test_render_markdown_sources() {
        let answer = Answer {
            text: "Use the staging bucket.".to_string(),
            backend: Some("ollama:llama3".to_string()),
            evidence: vec![EvidenceItem {
                record: MetadataRecord {
                    chunk_id: "abc123".to_string(),
                    document_path: "/notes/2024-06-01.md".to_string(),
                    file_type: "md".to_string(),
                    doc_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
                    modified_at: 0,
                    revision: None,
                    ordinal: 0,
                    tag: StructuralTag::Paragraph,
                    start_byte: 0,
                    end_byte: 10,
                    text: "staging".to_string(),
                },
                score: 0.8,
                strategy: StrategyKind::DirectSimilarity,
            }],
            query_type: QueryType::Direct,
            strategy: StrategyKind::DirectSimilarity,
            rounds: 1,
            error: None,
            written_to: None,
        };
        let md = render_markdown("where do uploads go?", &answer);
        assert!(md.starts_with("# where do uploads go?\n\nUse the staging bucket.\n"));
        assert!(md.contains("## Sources"));
        assert!(md.contains("1. `/notes/2024-06-01.md` (2024-06-01, chunk abc123, score 0.800)"));
        assert!(md.contains("backend ollama:llama3"));
    }
}
