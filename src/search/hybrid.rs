use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::Config;
use crate::llm::{truncate_on_boundary, Embedder};
use crate::models::{ChunkId, Provenance, SearchDebugEntry, SearchResult};
use crate::search::sparse::VocabularySet;
use crate::store::VectorStore;

const SINGLE_QUERY_RESULTS: usize = 10;
const MULTI_QUERY_TOTAL_RESULTS: usize = 16;
const MULTI_QUERY_MIN_PER_QUERY: usize = 3;

/// Results fetched for an article the judge or answer model asked for.
const ARTICLE_FETCH_LIMIT: usize = 5;

/// Per-query and total result caps for a fan-out of `query_count` queries.
/// A single query keeps the full budget; multiple queries split it, with a
/// floor so every query still contributes.
fn search_budget(query_count: usize) -> (usize, usize) {
    if query_count <= 1 {
        return (SINGLE_QUERY_RESULTS, SINGLE_QUERY_RESULTS);
    }
    let per_query = (MULTI_QUERY_TOTAL_RESULTS / query_count).max(MULTI_QUERY_MIN_PER_QUERY);
    (per_query, per_query * query_count)
}

/// Merged results plus per-query debug info from one search fan-out.
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    pub debug: Vec<SearchDebugEntry>,
}

/// Shared handles for the search side of the pipeline. Cheap to clone into
/// spawned tasks.
#[derive(Clone)]
pub struct SearchContext {
    pub store: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub vocabs: Arc<VocabularySet>,
    pub config: Arc<Config>,
}

impl SearchContext {
    /// Run every query in parallel and merge into one deduplicated list
    /// capped by the fan-out budget. A failing query is logged and dropped
    /// from the merge; the call fails only when every query failed.
    pub async fn search_all(&self, queries: &[String]) -> Result<SearchOutcome> {
        let (per_query_limit, total_limit) = search_budget(queries.len());
        tracing::debug!(
            "Search budget: {} queries, {per_query_limit} per query, cap {total_limit}",
            queries.len()
        );

        let semaphore = Arc::new(tokio::sync::Semaphore::new(
            self.config.max_concurrent_searches,
        ));
        let mut handles = Vec::new();

        for query in queries {
            let ctx = self.clone();
            let query = query.clone();
            let sem = semaphore.clone();

            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire().await;
                ctx.search_one(&query, per_query_limit).await
            }));
        }

        let mut merged: Vec<SearchResult> = Vec::new();
        let mut index: HashMap<ChunkId, usize> = HashMap::new();
        let mut debug = Vec::new();
        let mut failures = 0usize;

        for (qi, handle) in handles.into_iter().enumerate() {
            let results = match handle.await {
                Ok(Ok(results)) => results,
                Ok(Err(e)) => {
                    tracing::warn!("Query [{qi}] failed: {e:#}");
                    failures += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Query [{qi}] task panicked: {e}");
                    failures += 1;
                    continue;
                }
            };

            debug.push(SearchDebugEntry {
                query_index: qi,
                query: truncate_on_boundary(&queries[qi], 100).to_string(),
                count: results.len(),
                top_ids: results.iter().take(5).map(|r| r.chunk.id.clone()).collect(),
            });

            merge_results(&mut merged, &mut index, results);
        }

        if failures > 0 && failures == queries.len() {
            anyhow::bail!("All {failures} search queries failed");
        }

        sort_by_effective(&mut merged);
        let unique = merged.len();
        merged.truncate(total_limit);
        tracing::debug!("Merged {unique} unique results, kept {}", merged.len());

        Ok(SearchOutcome {
            results: merged,
            debug,
        })
    }

    /// Hybrid search for one query across every configured collection, with
    /// per-collection sparse vectors and weighted scores. A collection that
    /// fails or does not exist contributes nothing.
    async fn search_one(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let dense = self
            .embedder
            .embed(query)
            .await
            .context("Failed to embed query")?;

        let per_collection = limit.clamp(5, 10);

        let dense = &dense;
        let fetches = self.config.collections.iter().map(|col| async move {
            let sparse = self.vocabs.build(&col.name, query);
            let outcome = self
                .store
                .hybrid_query(&col.name, dense, sparse.as_ref(), per_collection)
                .await;
            (col, outcome)
        });

        let mut results = Vec::new();
        for (col, outcome) in futures_util::future::join_all(fetches).await {
            match outcome {
                Ok(hits) => {
                    for hit in hits {
                        let mut result = SearchResult::new(hit.chunk, col.name.clone(), hit.score);
                        result.weighted_score = hit.score * col.weight;
                        results.push(result);
                    }
                }
                Err(e) => tracing::warn!("Search in {} failed: {e:#}", col.name),
            }
        }

        sort_by_effective(&mut results);
        results.truncate(limit);
        Ok(results)
    }

    /// Locate an article two ways: a metadata scroll on its section heading
    /// within the law, plus a law-filtered semantic query. Both are
    /// best-effort; the union is returned deduplicated by ID.
    pub async fn fetch_by_article(&self, article: &str, law: &str) -> Vec<SearchResult> {
        let article_base = article.split('.').next().unwrap_or(article);
        let law_words = clean_law_name(law);
        let lookup = format!("Artículo {article} {law}");
        let reason = format!("Solicitado: Artículo {article} {law}");

        let mut results: Vec<SearchResult> = Vec::new();
        let mut seen: HashSet<ChunkId> = HashSet::new();

        // Strategy 1: metadata filter on section heading + law words.
        match self
            .store
            .scroll_article(article_base, &law_words, ARTICLE_FETCH_LIMIT)
            .await
        {
            Ok(chunks) => {
                tracing::debug!(
                    "Article filter found {} for Artículo {article_base} ({law_words})",
                    chunks.len()
                );
                for chunk in chunks {
                    if seen.insert(chunk.id.clone()) {
                        results.push(self.article_result(chunk, 0.5, &reason));
                    }
                }
            }
            Err(e) => tracing::debug!("Article filter failed: {e:#}"),
        }

        // Strategy 2: semantic lookup narrowed to the law's first keyword.
        match self.embedder.embed(&lookup).await {
            Ok(dense) => {
                let sparse = self.vocabs.build(&self.config.primary_collection, &lookup);
                let keyword = law_words.split_whitespace().next();
                match self
                    .store
                    .article_query(&dense, sparse.as_ref(), keyword, ARTICLE_FETCH_LIMIT)
                    .await
                {
                    Ok(hits) => {
                        tracing::debug!("Semantic lookup found {} for \"{lookup}\"", hits.len());
                        for hit in hits {
                            if seen.insert(hit.chunk.id.clone()) {
                                let score = if hit.score > 0.0 { hit.score } else { 0.5 };
                                results.push(self.article_result(hit.chunk, score, &reason));
                            }
                        }
                    }
                    Err(e) => tracing::debug!("Semantic article lookup failed: {e:#}"),
                }
            }
            Err(e) => tracing::debug!("Failed to embed article lookup: {e:#}"),
        }

        results
    }

    fn article_result(
        &self,
        chunk: crate::models::Chunk,
        score: f32,
        reason: &str,
    ) -> SearchResult {
        let mut result =
            SearchResult::new(chunk, self.config.primary_collection.clone(), score);
        result.provenance = Provenance::Evaluator;
        result.ref_reason = Some(reason.to_string());
        result
    }
}

/// Merge `incoming` into `merged`, deduplicating by chunk ID. A duplicate
/// replaces the incumbent only when it carries a strictly higher effective
/// score, so ties keep the earlier entry.
pub fn merge_results(
    merged: &mut Vec<SearchResult>,
    index: &mut HashMap<ChunkId, usize>,
    incoming: Vec<SearchResult>,
) {
    for result in incoming {
        match index.get(&result.chunk.id) {
            Some(&slot) => {
                if result.effective_score() > merged[slot].effective_score() {
                    merged[slot] = result;
                }
            }
            None => {
                index.insert(result.chunk.id.clone(), merged.len());
                merged.push(result);
            }
        }
    }
}

/// Append results whose IDs are not yet in `seen`, marking them seen.
/// Returns how many were appended.
pub fn append_unseen(
    results: &mut Vec<SearchResult>,
    seen: &mut HashSet<ChunkId>,
    incoming: Vec<SearchResult>,
) -> usize {
    let mut added = 0;
    for result in incoming {
        if seen.insert(result.chunk.id.clone()) {
            results.push(result);
            added += 1;
        }
    }
    added
}

/// Sort descending by effective score. The sort is stable, so equal scores
/// keep their insertion order.
pub fn sort_by_effective(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.effective_score()
            .partial_cmp(&a.effective_score())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Reduce a law name to its distinctive words: strip the "Texto refundido
/// de la Ley de(l)" boilerplate, then keep the first two words longer than
/// three characters.
pub fn clean_law_name(law: &str) -> String {
    strip_refundido_prefix(law)
        .split_whitespace()
        .filter(|w| w.chars().count() > 3)
        .take(2)
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_refundido_prefix(law: &str) -> String {
    const PATTERN: &str = "texto refundido de la ley de";

    let lower = law.to_lowercase();
    // Byte offsets in `lower` only map back onto `law` when lowercasing
    // kept every char the same width.
    if lower.len() != law.len() {
        return law.to_string();
    }

    let mut out = String::new();
    let mut pos = 0;
    while let Some(found) = lower[pos..].find(PATTERN) {
        let start = pos + found;
        let mut end = start + PATTERN.len();
        if lower.as_bytes().get(end) == Some(&b'l') {
            end += 1;
        }
        while lower
            .as_bytes()
            .get(end)
            .is_some_and(|b| b.is_ascii_whitespace())
        {
            end += 1;
        }
        if !law.is_char_boundary(start) || !law.is_char_boundary(end) {
            return law.to_string();
        }
        out.push_str(&law[pos..start]);
        pos = end;
    }
    out.push_str(&law[pos..]);
    out
}
