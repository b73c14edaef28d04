//! Answer synthesis.
//!
//! Builds a bounded prompt from ranked evidence and asks the
//! [`InferenceRouter`] for the answer. Evidence that does not fit the
//! character budget is truncated longest-first: every block is capped at
//! the largest length that lets the total fit, so short blocks are kept
//! whole and long ones lose their tails.
//!
//! Temporal results covering many documents go through a reduce pass
//! first: each document is summarized on its own, then summaries are
//! merged in groups of `reduce_fan_in` until one group remains. The final
//! prompt therefore stays bounded no matter how many documents matched.

use futures::stream::{self, StreamExt};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

use crate::error::Result;
use crate::inference::InferenceRouter;
use crate::models::{DateRange, EvidenceItem, QueryType, StrategyKind};

/// Concurrent summarization calls during the reduce pass.
const MAP_CONCURRENCY: usize = 4;

/// Reply used when retrieval found nothing to ground an answer on.
pub const NO_EVIDENCE_ANSWER: &str = "No matching notes were found for this question.";

pub struct SynthesisRequest<'a> {
    pub question: &'a str,
    pub query_type: QueryType,
    pub strategy: StrategyKind,
    pub date_range: Option<DateRange>,
    pub evidence: &'a [EvidenceItem],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Synthesis {
    pub text: String,
    /// Backend of the final generation; `None` when no call was made.
    pub backend: Option<String>,
}

pub struct Synthesizer {
    router: Arc<InferenceRouter>,
    budget_chars: usize,
    fan_in: usize,
}

impl Synthesizer {
    pub fn new(router: Arc<InferenceRouter>, budget_chars: usize, fan_in: usize) -> Self {
        Self {
            router,
            budget_chars,
            fan_in: fan_in.max(2),
        }
    }

    pub async fn synthesize(&self, req: &SynthesisRequest<'_>) -> Result<Synthesis> {
        if req.evidence.is_empty() {
            return Ok(Synthesis {
                text: NO_EVIDENCE_ANSWER.to_string(),
                backend: None,
            });
        }

        let blocks: Vec<String> = if self.needs_reduce(req) {
            self.reduce(req).await?
        } else {
            req.evidence.iter().map(evidence_block).collect()
        };

        let prompt = answer_prompt(req, &fit_to_budget(blocks, self.budget_chars));
        debug!(chars = prompt.len(), "synthesis prompt built");
        let generation = self.router.generate(&prompt, req.query_type).await?;
        Ok(Synthesis {
            text: clean_response(&generation.text),
            backend: Some(generation.backend),
        })
    }

    fn needs_reduce(&self, req: &SynthesisRequest<'_>) -> bool {
        if req.strategy != StrategyKind::TemporalMapper {
            return false;
        }
        let documents = group_by_document(req.evidence).len();
        let total: usize = req.evidence.iter().map(|e| e.record.text.chars().count()).sum();
        documents > self.fan_in || (documents > 1 && total > self.budget_chars)
    }

    /// Per-document summaries, then summaries of summaries, until at most
    /// `fan_in` remain.
    async fn reduce(&self, req: &SynthesisRequest<'_>) -> Result<Vec<String>> {
        let groups = group_by_document(req.evidence);
        info!(documents = groups.len(), fan_in = self.fan_in, "reducing temporal evidence");

        let per_doc_budget = self.budget_chars;
        let map_prompts: Vec<String> = groups
            .iter()
            .map(|(path, items)| {
                let texts = items.iter().map(|e| e.record.text.clone()).collect();
                let blocks = fit_to_budget(texts, per_doc_budget);
                let date = items
                    .first()
                    .map(|e| e.record.doc_date.to_string())
                    .unwrap_or_default();
                summarize_prompt(req.question, &format!("{} ({})", path, date), &blocks)
            })
            .collect();
        let mut summaries = self.summarize_all(map_prompts, req.query_type).await?;

        let mut level = 1;
        while summaries.len() > self.fan_in {
            let prompts: Vec<String> = summaries
                .chunks(self.fan_in)
                .map(|group| {
                    summarize_prompt(
                        req.question,
                        &format!("summaries (level {})", level),
                        &fit_to_budget(group.to_vec(), per_doc_budget),
                    )
                })
                .collect();
            summaries = self.summarize_all(prompts, req.query_type).await?;
            level += 1;
        }
        Ok(summaries)
    }

    async fn summarize_all(&self, prompts: Vec<String>, query_type: QueryType) -> Result<Vec<String>> {
        let results: Vec<Result<String>> = stream::iter(prompts)
            .map(|prompt| async move {
                self.router
                    .generate(&prompt, query_type)
                    .await
                    .map(|g| clean_response(&g.text))
            })
            .buffered(MAP_CONCURRENCY)
            .collect()
            .await;
        results.into_iter().collect()
    }
}

/// Evidence grouped by document, newest document first, chunks in order.
fn group_by_document(evidence: &[EvidenceItem]) -> Vec<(String, Vec<&EvidenceItem>)> {
    let mut by_doc: BTreeMap<&str, Vec<&EvidenceItem>> = BTreeMap::new();
    for item in evidence {
        by_doc
            .entry(item.record.document_path.as_str())
            .or_default()
            .push(item);
    }
    let mut groups: Vec<(String, Vec<&EvidenceItem>)> = by_doc
        .into_iter()
        .map(|(path, mut items)| {
            items.sort_by_key(|e| e.record.ordinal);
            (path.to_string(), items)
        })
        .collect();
    groups.sort_by(|a, b| {
        let da = a.1.first().map(|e| e.record.doc_date);
        let db = b.1.first().map(|e| e.record.doc_date);
        db.cmp(&da).then_with(|| a.0.cmp(&b.0))
    });
    groups
}

fn evidence_block(item: &EvidenceItem) -> String {
    format!(
        "{} ({})\n{}",
        item.record.document_path, item.record.doc_date, item.record.text
    )
}

/// Truncate `blocks` so their total length in chars fits `budget`.
///
/// Finds the largest cap `c` with `Σ min(len_i, c) ≤ budget` and cuts every
/// longer block to `c` chars. Order is preserved.
pub fn fit_to_budget(blocks: Vec<String>, budget: usize) -> Vec<String> {
    let lengths: Vec<usize> = blocks.iter().map(|b| b.chars().count()).collect();
    if lengths.iter().sum::<usize>() <= budget {
        return blocks;
    }

    let mut sorted = lengths.clone();
    sorted.sort_unstable();
    let mut remaining = budget;
    let mut cap = 0;
    for (i, len) in sorted.iter().enumerate() {
        let left = sorted.len() - i;
        if len * left <= remaining {
            remaining -= len;
        } else {
            cap = remaining / left;
            break;
        }
    }

    blocks
        .into_iter()
        .zip(lengths)
        .map(|(block, len)| {
            if len > cap {
                block.chars().take(cap).collect()
            } else {
                block
            }
        })
        .collect()
}

fn numbered(blocks: &[String]) -> String {
    blocks
        .iter()
        .enumerate()
        .map(|(i, b)| format!("[{}] {}", i + 1, b))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn answer_prompt(req: &SynthesisRequest<'_>, blocks: &[String]) -> String {
    let guidance = match req.query_type {
        QueryType::Direct => "Answer the question directly.".to_string(),
        QueryType::Temporal => match req.date_range {
            Some(range) => format!(
                "The notes cover {}. Describe what happened in chronological order.",
                range
            ),
            None => "Describe what happened in chronological order.".to_string(),
        },
        QueryType::Advisory => {
            "Weigh what the notes say and give a clear recommendation with its reasons."
                .to_string()
        }
    };
    format!(
        "You answer questions using only the notes below. Cite notes by their [number]. \
         If the notes do not contain the answer, say so.\n{}\n\nNotes:\n{}\n\nQuestion: {}\nAnswer:",
        guidance,
        numbered(blocks),
        req.question
    )
}

fn summarize_prompt(question: &str, label: &str, blocks: &[String]) -> String {
    format!(
        "Summarize the following {} in a few sentences, keeping details relevant to: {}\n\n{}\n\nSummary:",
        label,
        question,
        numbered(blocks)
    )
}

/// Strip reasoning blocks and a leading answer label from model output.
pub fn clean_response(text: &str) -> String {
    static THINK_RE: OnceLock<Regex> = OnceLock::new();
    let think = THINK_RE.get_or_init(|| {
        Regex::new(r"(?is)<think>.*?(</think>|$)").expect("static think regex is valid")
    });
    let stripped = think.replace_all(text, "");
    let trimmed = stripped.trim();

    static LABEL_RE: OnceLock<Regex> = OnceLock::new();
    let label = LABEL_RE
        .get_or_init(|| Regex::new(r"(?i)^answer\s*:\s*").expect("static label regex is valid"));
    label.replace(trimmed, "").trim().to_string()
}
