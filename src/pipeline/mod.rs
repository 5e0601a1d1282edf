//! The question-answering pipeline.
//!
//! A question flows through query decomposition, carryover reload, the
//! hybrid search fan-out, reference expansion, and a bounded sufficiency
//! loop, then an answer is generated over the assembled context with one
//! optional retry for gaps the answer itself reports.

pub mod answer;
pub mod carryover;
pub mod decompose;
pub mod enrich;
pub mod evaluate;

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::{PipelineError, Stage};
use crate::llm::{sanitize_for_prompt, truncate_on_boundary, Completion, LlmClient};
use crate::models::{
    AskRequest, AskResponse, ChatMessage, ChunkId, PipelineTrace, Provenance, SearchResult, Source,
};
use crate::pipeline::decompose::{LlmDecomposer, QueryDecomposer};
use crate::pipeline::evaluate::{ContextJudge, LlmJudge};
use crate::search::hybrid::{append_unseen, merge_results, sort_by_effective, SearchContext};
use crate::search::sparse::VocabularySet;
use crate::store::qdrant::QdrantClient;

/// Most chunks ever shown to the model in one answer call.
pub(crate) const MAX_CHUNKS_TO_MODEL: usize = 25;
/// Slightly wider cap for the single gap-filling retry.
pub(crate) const NEED_RETRY_CAP: usize = MAX_CHUNKS_TO_MODEL + 5;
const MAX_MESSAGE_CHARS: usize = 2000;
const MAX_SOURCES: usize = 15;

/// The assembled pipeline with its injected collaborators.
pub struct Pipeline {
    search: SearchContext,
    decomposer: Arc<dyn QueryDecomposer>,
    judge: Arc<dyn ContextJudge>,
    llm: Arc<dyn Completion>,
}

impl Pipeline {
    pub fn new(
        search: SearchContext,
        decomposer: Arc<dyn QueryDecomposer>,
        judge: Arc<dyn ContextJudge>,
        llm: Arc<dyn Completion>,
    ) -> Self {
        Self {
            search,
            decomposer,
            judge,
            llm,
        }
    }

    /// Wire the real collaborators from configuration: one shared HTTP
    /// client, the vector store, the LLM, and the vocabulary artifacts.
    pub fn from_config(config: Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to build HTTP client")?;

        let vocabs = Arc::new(VocabularySet::load(&config.vocab_dir));
        let llm = Arc::new(LlmClient::new(client.clone(), config.llm.clone()));
        let store = Arc::new(QdrantClient::new(client, &config));
        let config = Arc::new(config);

        let search = SearchContext {
            store,
            embedder: llm.clone(),
            vocabs,
            config,
        };

        Ok(Self {
            search,
            decomposer: Arc::new(LlmDecomposer::new(llm.clone())),
            judge: Arc::new(LlmJudge::new(llm.clone())),
            llm,
        })
    }

    /// Answer one question.
    ///
    /// Fatal failures carry the stage that caused them; partial failures
    /// degrade to smaller context and show up only in logs and the trace.
    pub async fn ask(&self, request: AskRequest) -> Result<AskResponse, PipelineError> {
        let question = clean_text(&request.question);
        let history: Vec<ChatMessage> = request
            .conversation_tail
            .iter()
            .filter(|m| m.role == "user" || m.role == "assistant")
            .map(|m| ChatMessage::new(m.role.clone(), clean_text(&m.content)))
            .collect();

        let mut trace = PipelineTrace::default();
        let config = &self.search.config;

        // Stage 1: decomposition.
        let has_carryover = !request.previous_context_ids.is_empty();
        let follow_up = has_carryover && !history.is_empty();
        let queries = self
            .decomposer
            .decompose(&question, &history, follow_up)
            .await;
        tracing::info!("Decomposed into {} queries: {queries:?}", queries.len());
        trace.expanded_queries = queries.clone();

        // Carryover reload.
        let carryover = carryover::load(
            self.search.store.as_ref(),
            &request.previous_context_ids,
            &config.primary_collection,
        )
        .await;
        if has_carryover {
            tracing::info!(
                "Loaded {} of {} carryover chunks",
                carryover.len(),
                request.previous_context_ids.len()
            );
        }

        // Stages 2-4: the search fan-out, skipped for pure continuations.
        let skip_search =
            queries.is_empty() || (queries.len() == 1 && queries[0].trim().is_empty());
        let search_results = if skip_search {
            tracing::info!("No new queries, running on carryover alone");
            Vec::new()
        } else {
            let outcome = self
                .search
                .search_all(&queries)
                .await
                .map_err(|e| PipelineError::new(Stage::Search, format!("{e:#}")))?;
            trace.search_detail = outcome.debug;
            outcome.results
        };
        trace.search_results = search_results.len();

        // Merge into one working set; on an ID collision the
        // higher-scored instance wins.
        let mut working: Vec<SearchResult> = Vec::new();
        let mut index: HashMap<ChunkId, usize> = HashMap::new();
        merge_results(&mut working, &mut index, carryover);
        merge_results(&mut working, &mut index, search_results);
        let mut seen: HashSet<ChunkId> = index.into_keys().collect();

        // Stage 5b: reference expansion, best-effort.
        match enrich::expand_references(
            self.search.store.as_ref(),
            &working,
            &config.primary_collection,
        )
        .await
        {
            Ok((refs, refs_found)) => {
                trace.refs_found = refs_found;
                trace.refs_added = refs.len();
                append_unseen(&mut working, &mut seen, refs);
            }
            Err(e) => tracing::warn!("Reference expansion failed, skipping: {e:#}"),
        }

        let merged_candidates = working.len();
        rerank_and_cap(&mut working, &mut seen, MAX_CHUNKS_TO_MODEL);
        tracing::info!(
            "Working set: {merged_candidates} candidates, {} kept for the model",
            working.len()
        );

        // Sufficiency loop.
        evaluate::run(
            &self.search,
            self.judge.as_ref(),
            &question,
            &mut working,
            &mut seen,
            &mut trace,
        )
        .await;

        // Stage 5: answer over the assembled context.
        let context = answer::build_context(&working);
        let (mut answer_text, mut meta) = answer::generate(self.llm.as_ref(), &context, &history)
            .await
            .map_err(|e| PipelineError::new(Stage::Answer, format!("{e:#}")))?;
        tracing::info!(
            "Answer: used={}, drop={}, need={}",
            meta.used.len(),
            meta.drop.len(),
            meta.need.len()
        );

        // One retry when the answer reports gaps. The regenerated answer
        // and its annotations replace the first ones outright.
        let mut retry_added = 0;
        if !meta.need.is_empty() {
            trace.need_requests = meta.need.len();
            tracing::info!("Resolving {} reported gaps", meta.need.len());

            let mut fetched: Vec<SearchResult> = Vec::new();
            for need in &meta.need {
                match need {
                    answer::Need::Article { article, law } => {
                        fetched.extend(self.search.fetch_by_article(article, law).await);
                    }
                    answer::Need::Query(query) => {
                        match self.search.search_all(std::slice::from_ref(query)).await {
                            Ok(outcome) => fetched.extend(outcome.results),
                            Err(e) => tracing::warn!("Gap search failed: {e:#}"),
                        }
                    }
                }
            }

            retry_added = append_unseen(&mut working, &mut seen, fetched);
            rerank_and_cap(&mut working, &mut seen, NEED_RETRY_CAP);

            let retry_context = answer::build_context(&working);
            let (retry_answer, retry_meta) =
                answer::generate(self.llm.as_ref(), &retry_context, &history)
                    .await
                    .map_err(|e| PipelineError::new(Stage::NeedsRetry, format!("{e:#}")))?;
            answer_text = retry_answer;
            meta = retry_meta;
            tracing::info!(
                "Retry answer: +{retry_added} chunks, used={}, drop={}",
                meta.used.len(),
                meta.drop.len()
            );
        }

        // Outputs: next-turn carryover, cited sources, diagnostics.
        let context_ids = carryover::surviving_ids(&working, &meta.drop);
        let sources = build_sources(&working, &meta.used);
        trace.used_indices = meta.used.clone();
        trace.drop_indices = meta.drop.clone();
        trace.total_candidates = merged_candidates + trace.eval_added + retry_added;

        Ok(AskResponse {
            answer: answer_text,
            sources,
            context_ids,
            trace,
        })
    }
}

/// Strip control tokens and clamp length before text enters any prompt.
fn clean_text(text: &str) -> String {
    let sanitized = sanitize_for_prompt(text);
    truncate_on_boundary(sanitized.trim(), MAX_MESSAGE_CHARS).to_string()
}

/// Resolve unresolved final scores, re-rank, cap, and rebuild the seen set
/// to mirror the kept entries.
pub(crate) fn rerank_and_cap(
    working: &mut Vec<SearchResult>,
    seen: &mut HashSet<ChunkId>,
    cap: usize,
) {
    for result in working.iter_mut() {
        if result.final_score == 0.0 {
            result.final_score = if result.weighted_score > 0.0 {
                result.weighted_score
            } else {
                result.score
            };
        }
    }
    sort_by_effective(working);
    working.truncate(cap);
    seen.clear();
    seen.extend(working.iter().map(|r| r.chunk.id.clone()));
}

/// Project the final context into the cited-sources list: USED entries only
/// (every entry when USED is empty), deduplicated by law and section.
fn build_sources(results: &[SearchResult], used: &[usize]) -> Vec<Source> {
    let mut seen = HashSet::new();
    results
        .iter()
        .enumerate()
        .filter(|(i, _)| used.is_empty() || used.contains(i))
        .map(|(_, r)| Source {
            id: r.chunk.id.clone(),
            law: r.chunk.law.clone().unwrap_or_default(),
            section: r.chunk.section.clone().unwrap_or_default(),
            chapter: r.chunk.chapter.clone().unwrap_or_default(),
            collection: r.collection.clone(),
            carryover: r.provenance == Provenance::Carryover,
        })
        .filter(|s| seen.insert(format!("{}|{}", s.law, s.section).to_lowercase()))
        .take(MAX_SOURCES)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;

    fn result(id: u64, law: &str, section: &str, weighted: f32) -> SearchResult {
        let chunk = Chunk {
            id: ChunkId::Int(id),
            law: Some(law.to_string()),
            section: Some(section.to_string()),
            ..Chunk::default()
        };
        let mut r = SearchResult::new(chunk, "normativa", weighted);
        r.weighted_score = weighted;
        r
    }

    #[test]
    fn test_rerank_resolves_and_caps() {
        let mut working = vec![
            result(1, "ET", "Artículo 1", 0.3),
            result(2, "ET", "Artículo 2", 0.9),
            result(3, "ET", "Artículo 3", 0.6),
        ];
        let mut seen = HashSet::new();

        rerank_and_cap(&mut working, &mut seen, 2);

        assert_eq!(working.len(), 2);
        assert_eq!(working[0].chunk.id, ChunkId::Int(2));
        assert!((working[0].final_score - 0.9).abs() < 1e-6);
        assert_eq!(seen.len(), 2);
        assert!(!seen.contains(&ChunkId::Int(1)));
    }

    #[test]
    fn test_rerank_keeps_resolved_final_scores() {
        let mut fixed = result(1, "ET", "Artículo 1", 0.3);
        fixed.final_score = 0.95;
        let mut working = vec![fixed, result(2, "ET", "Artículo 2", 0.9)];
        let mut seen = HashSet::new();

        rerank_and_cap(&mut working, &mut seen, 10);

        // An already-resolved score is not recomputed and still ranks first.
        assert_eq!(working[0].chunk.id, ChunkId::Int(1));
        assert!((working[0].final_score - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_sources_follow_used_indices() {
        let results = vec![
            result(1, "ET", "Artículo 38", 0.9),
            result(2, "LGSS", "Artículo 267", 0.8),
            result(3, "LPRL", "Artículo 14", 0.7),
        ];
        let sources = build_sources(&results, &[0, 2]);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].law, "ET");
        assert_eq!(sources[1].law, "LPRL");
    }

    #[test]
    fn test_sources_keep_everything_when_used_is_empty() {
        let results = vec![
            result(1, "ET", "Artículo 38", 0.9),
            result(2, "LGSS", "Artículo 267", 0.8),
        ];
        assert_eq!(build_sources(&results, &[]).len(), 2);
    }

    #[test]
    fn test_sources_dedup_same_law_and_section() {
        let results = vec![
            result(1, "ET", "Artículo 38", 0.9),
            result(2, "et", "artículo 38", 0.8),
            result(3, "ET", "Artículo 39", 0.7),
        ];
        let sources = build_sources(&results, &[]);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].id, ChunkId::Int(1));
    }

    #[test]
    fn test_sources_flag_carryover() {
        let mut carried = result(1, "ET", "Artículo 38", 0.5);
        carried.provenance = Provenance::Carryover;
        let sources = build_sources(&[carried], &[]);
        assert!(sources[0].carryover);
    }

    #[test]
    fn test_clean_text_strips_and_clamps() {
        let cleaned = clean_text("  <|im_start|>hola<|im_end|>  ");
        assert_eq!(cleaned, "hola");

        let long = "á".repeat(1500);
        let cleaned = clean_text(&long);
        assert!(cleaned.len() <= MAX_MESSAGE_CHARS);
        assert!(cleaned.chars().all(|c| c == 'á'));
    }
}
