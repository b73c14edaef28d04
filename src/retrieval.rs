//! Retrieval strategies.
//!
//! [`Strategy`] is a closed set: direct similarity, the temporal mapper and
//! the agent orchestrator. All three read through a [`Retriever`], which
//! pairs one loaded vector index with the metadata store view matching it.
//!
//! The agent orchestrator runs an explicit loop over [`AgentState`]: one
//! search per round, then a [`RetrievalPlanner`] decides whether another
//! sub-query is worth running. `max_rounds` bounds the number of searches;
//! a planner that errors or declines ends the loop early.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::classify::Classification;
use crate::config::RetrievalConfig;
use crate::embedding::{embed_query, Embedder};
use crate::error::Result;
use crate::inference::InferenceRouter;
use crate::models::{
    sort_evidence, DateRange, EvidenceItem, MetadataRecord, QueryFilters, QueryType, StrategyKind,
};
use crate::store::{MetadataStore, StoreView};
use crate::synthesize::clean_response;
use crate::vector_index::VectorIndex;

/// Weight of recency against similarity when ranking temporal results.
const RECENCY_WEIGHT: f64 = 0.6;

/// Evidence text shown to the planner per item.
const PLANNER_SNIPPET_CHARS: usize = 240;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    DirectSimilarity,
    TemporalMapper { range: DateRange },
    AgentOrchestrator { max_rounds: usize },
}

impl Strategy {
    pub fn for_query(classification: &Classification, config: &RetrievalConfig) -> Self {
        match (classification.query_type, classification.date_range) {
            (QueryType::Temporal, Some(range)) => Strategy::TemporalMapper { range },
            (QueryType::Advisory, _) => Strategy::AgentOrchestrator {
                max_rounds: config.agent_max_rounds.max(1),
            },
            _ => Strategy::DirectSimilarity,
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::DirectSimilarity => StrategyKind::DirectSimilarity,
            Strategy::TemporalMapper { .. } => StrategyKind::TemporalMapper,
            Strategy::AgentOrchestrator { .. } => StrategyKind::AgentOrchestrator,
        }
    }
}

/// Evidence from one strategy run.
#[derive(Debug, Clone)]
pub struct Retrieval {
    pub evidence: Vec<EvidenceItem>,
    pub rounds: usize,
}

// ============ Agent loop ============

/// Accumulator threaded through the agent orchestrator's rounds.
#[derive(Debug, Clone, Default)]
pub struct AgentState {
    /// Searches performed so far.
    pub round: usize,
    /// Next sub-query to search, if any.
    pub pending_query: Option<String>,
    /// Every sub-query already searched, in order.
    pub queries: Vec<String>,
    /// Deduplicated evidence keyed by chunk id.
    pub evidence: BTreeMap<String, EvidenceItem>,
}

impl AgentState {
    pub fn new(question: &str) -> Self {
        Self {
            pending_query: Some(question.to_string()),
            ..Self::default()
        }
    }

    /// Merge one round's hits, keeping the best score per chunk.
    pub fn absorb(&mut self, items: Vec<EvidenceItem>) {
        for mut item in items {
            item.strategy = StrategyKind::AgentOrchestrator;
            match self.evidence.get(item.chunk_id()) {
                Some(existing) if existing.score >= item.score => {}
                _ => {
                    self.evidence.insert(item.chunk_id().to_string(), item);
                }
            }
        }
    }

    /// Evidence ranked by score.
    pub fn ranked(&self) -> Vec<EvidenceItem> {
        let mut items: Vec<EvidenceItem> = self.evidence.values().cloned().collect();
        sort_evidence(&mut items);
        items
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannerDecision {
    Search(String),
    Done,
}

/// Decides the agent orchestrator's next sub-query.
#[async_trait]
pub trait RetrievalPlanner: Send + Sync {
    async fn next_query(&self, question: &str, state: &AgentState) -> Result<PlannerDecision>;
}

/// Planner backed by the inference router. Expects `SEARCH: <query>` or
/// `DONE`; anything else ends the loop.
pub struct LlmPlanner {
    router: Arc<InferenceRouter>,
}

impl LlmPlanner {
    pub fn new(router: Arc<InferenceRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl RetrievalPlanner for LlmPlanner {
    async fn next_query(&self, question: &str, state: &AgentState) -> Result<PlannerDecision> {
        let prompt = planner_prompt(question, state);
        let generation = self.router.generate(&prompt, QueryType::Advisory).await?;
        Ok(parse_planner_reply(&generation.text))
    }
}

fn planner_prompt(question: &str, state: &AgentState) -> String {
    let searched = state
        .queries
        .iter()
        .map(|q| format!("- {}", q))
        .collect::<Vec<_>>()
        .join("\n");
    let found = state
        .ranked()
        .iter()
        .map(|e| {
            let snippet: String = e.record.text.chars().take(PLANNER_SNIPPET_CHARS).collect();
            format!("- {}: {}", e.record.document_path, snippet.replace('\n', " "))
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "You are gathering notes to answer a question.\n\nQuestion: {}\n\n\
         Searches done:\n{}\n\nNotes found:\n{}\n\n\
         If another search would find missing information, reply with one line \
         `SEARCH: <search terms>`. Otherwise reply `DONE`.",
        question, searched, found
    )
}

pub fn parse_planner_reply(reply: &str) -> PlannerDecision {
    let cleaned = clean_response(reply);
    for line in cleaned.lines() {
        let line = line.trim().trim_matches('`');
        if let Some(prefix) = line.get(..7) {
            if prefix.eq_ignore_ascii_case("search:") {
                let query = line[7..].trim();
                if !query.is_empty() {
                    return PlannerDecision::Search(query.to_string());
                }
            }
        }
        if line.eq_ignore_ascii_case("done") {
            return PlannerDecision::Done;
        }
    }
    debug!(reply = %cleaned, "planner reply not understood");
    PlannerDecision::Done
}

// ============ Retriever ============

/// Read access to one consistent pair of stores.
pub struct Retriever<'a> {
    pub store: &'a MetadataStore,
    pub view: StoreView,
    pub index: &'a VectorIndex,
    pub embedder: &'a dyn Embedder,
    pub planner: &'a dyn RetrievalPlanner,
    pub config: &'a RetrievalConfig,
}

impl<'a> Retriever<'a> {
    pub async fn retrieve(
        &self,
        strategy: &Strategy,
        question: &str,
        filters: &QueryFilters,
    ) -> Result<Retrieval> {
        match strategy {
            Strategy::DirectSimilarity => Ok(Retrieval {
                evidence: self.direct(question, filters, self.config.k).await?,
                rounds: 1,
            }),
            Strategy::TemporalMapper { range } => Ok(Retrieval {
                evidence: self.temporal(question, filters, *range).await?,
                rounds: 1,
            }),
            Strategy::AgentOrchestrator { max_rounds } => {
                self.agent(question, filters, *max_rounds).await
            }
        }
    }

    /// Top `k` chunks by cosine similarity, narrowed by any filters set.
    pub async fn direct(
        &self,
        text: &str,
        filters: &QueryFilters,
        k: usize,
    ) -> Result<Vec<EvidenceItem>> {
        if self.index.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let query_vec = embed_query(self.embedder, text).await?;
        let allowed = if filters.is_empty() {
            None
        } else {
            Some(self.store.chunk_ids_matching(self.view, filters).await?)
        };
        let hits = self.index.search(&query_vec, k, allowed.as_ref())?;

        let ids: Vec<String> = hits.iter().map(|h| h.chunk_id.clone()).collect();
        let mut records: HashMap<String, MetadataRecord> = self
            .store
            .get_many(self.view, &ids)
            .await?
            .into_iter()
            .map(|r| (r.chunk_id.clone(), r))
            .collect();

        let mut evidence = Vec::with_capacity(hits.len());
        for hit in hits {
            match records.remove(&hit.chunk_id) {
                Some(record) => evidence.push(EvidenceItem {
                    record,
                    score: f64::from(hit.score),
                    strategy: StrategyKind::DirectSimilarity,
                }),
                None => debug!(chunk_id = %hit.chunk_id, "vector without visible metadata"),
            }
        }
        Ok(evidence)
    }

    /// Chunks dated within `range`, ranked by recency blended with
    /// similarity, at most `temporal_chunks_per_document` per document and
    /// `temporal_max_documents` documents.
    pub async fn temporal(
        &self,
        text: &str,
        filters: &QueryFilters,
        range: DateRange,
    ) -> Result<Vec<EvidenceItem>> {
        let scoped = QueryFilters {
            date_range: Some(range),
            ..filters.clone()
        };
        let records = self.store.query_records(self.view, &scoped).await?;
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let similarity = self.similarities(text, &records).await?;
        let span_days = (range.end - range.start).num_days().max(1) as f64;

        let mut by_doc: BTreeMap<String, Vec<EvidenceItem>> = BTreeMap::new();
        for record in records {
            let age = (range.end - record.doc_date).num_days().max(0) as f64;
            let recency = (1.0 - age / span_days).clamp(0.0, 1.0);
            let sim = similarity.get(&record.chunk_id).copied().unwrap_or(0.0);
            let score = RECENCY_WEIGHT * recency + (1.0 - RECENCY_WEIGHT) * sim;
            by_doc
                .entry(record.document_path.clone())
                .or_default()
                .push(EvidenceItem {
                    record,
                    score,
                    strategy: StrategyKind::TemporalMapper,
                });
        }

        let mut documents: Vec<Vec<EvidenceItem>> = by_doc
            .into_values()
            .map(|mut items| {
                sort_evidence(&mut items);
                items.truncate(self.config.temporal_chunks_per_document.max(1));
                items
            })
            .collect();
        documents.sort_by(|a, b| {
            let best_a = a.first().map_or(0.0, |e| e.score);
            let best_b = b.first().map_or(0.0, |e| e.score);
            best_b
                .partial_cmp(&best_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let path_a = a.first().map(|e| e.record.document_path.as_str());
                    let path_b = b.first().map(|e| e.record.document_path.as_str());
                    path_a.cmp(&path_b)
                })
        });
        documents.truncate(self.config.temporal_max_documents.max(1));

        let mut evidence: Vec<EvidenceItem> = documents.into_iter().flatten().collect();
        sort_evidence(&mut evidence);
        info!(range = %range, chunks = evidence.len(), "temporal evidence selected");
        Ok(evidence)
    }

    /// Min-max normalized similarity of each record to `text`. Empty when
    /// the embedding backend is down, so ranking falls back to recency.
    async fn similarities(
        &self,
        text: &str,
        records: &[MetadataRecord],
    ) -> Result<HashMap<String, f64>> {
        if self.index.is_empty() {
            return Ok(HashMap::new());
        }
        let query_vec = match embed_query(self.embedder, text).await {
            Ok(v) => v,
            Err(e) if !e.is_systemic() => {
                warn!(error = %e, "query embedding failed; ranking by recency only");
                return Ok(HashMap::new());
            }
            Err(e) => return Err(e),
        };
        let ids: HashSet<String> = records.iter().map(|r| r.chunk_id.clone()).collect();
        let hits = self.index.search(&query_vec, ids.len(), Some(&ids))?;
        let scores: Vec<(String, f64)> = hits
            .into_iter()
            .map(|h| (h.chunk_id, f64::from(h.score)))
            .collect();
        Ok(normalize_scores(&scores).into_iter().collect())
    }

    async fn agent(
        &self,
        question: &str,
        filters: &QueryFilters,
        max_rounds: usize,
    ) -> Result<Retrieval> {
        let mut state = AgentState::new(question);

        while let Some(query) = state.pending_query.take() {
            let hits = self.direct(&query, filters, self.config.k).await?;
            state.round += 1;
            debug!(round = state.round, query = %query, hits = hits.len(), "agent search");
            state.absorb(hits);
            state.queries.push(query);

            if state.round >= max_rounds {
                break;
            }
            match self.planner.next_query(question, &state).await {
                Ok(PlannerDecision::Search(next)) => state.pending_query = Some(next),
                Ok(PlannerDecision::Done) => {}
                Err(e) => warn!(round = state.round, error = %e, "planner failed; ending search"),
            }
        }

        info!(
            rounds = state.round,
            evidence = state.evidence.len(),
            "agent retrieval finished"
        );
        Ok(Retrieval {
            evidence: state.ranked(),
            rounds: state.round,
        })
    }
}

/// Min-max normalize scores into `[0, 1]`; all-equal scores map to 1.0.
pub fn normalize_scores(scores: &[(String, f64)]) -> Vec<(String, f64)> {
    if scores.is_empty() {
        return Vec::new();
    }
    let min = scores.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
    let max = scores
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    scores
        .iter()
        .map(|(id, s)| {
            let norm = if range == 0.0 { 1.0 } else { (s - min) / range };
            (id.clone(), norm)
        })
        .collect()
}
