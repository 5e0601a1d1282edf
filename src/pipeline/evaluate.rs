use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use crate::models::{ChatMessage, ChunkId, PipelineTrace, SearchResult};
use crate::pipeline::answer::{self, Need};
use crate::search::hybrid::{append_unseen, SearchContext};

const MAX_EVAL_ITERATIONS: usize = 2;
const MAX_NEEDS_PER_ROUND: usize = 3;

/// Literal reply meaning the judge found the context sufficient.
pub const SUFFICIENT_TOKEN: &str = "CONTEXTO_SUFICIENTE";

const JUDGE_PROMPT: &str = r#"Eres un evaluador de contexto para un asistente experto en legislación laboral y de Seguridad Social española.
Recibes la PREGUNTA del usuario y los FRAGMENTOS de normativa recuperados, numerados desde 0.

Tu tarea es decidir si los fragmentos bastan para responder la pregunta con rigor.

- Si el contexto es suficiente, responde EXACTAMENTE: CONTEXTO_SUFICIENTE
- Si falta información o hay fragmentos irrelevantes, responde SOLO con líneas en este formato:

NEED|número_artículo|nombre_ley (si sabes el artículo exacto; la ley es OBLIGATORIA)
NEED|palabras clave de búsqueda (si no sabes el artículo)
DROP|índices de fragmentos irrelevantes (separados por comas)

Reglas:
- Máximo 3 líneas NEED.
- Una sola línea DROP como máximo.
- Sin explicaciones, sin markdown, sin backticks."#;

/// What one judge round decided about the working set.
#[derive(Debug, Clone, Default)]
pub struct EvaluationVerdict {
    pub sufficient: bool,
    pub needs: Vec<Need>,
    pub drops: Vec<usize>,
}

impl EvaluationVerdict {
    fn sufficient() -> Self {
        Self {
            sufficient: true,
            ..Self::default()
        }
    }
}

/// Judges whether the assembled context can answer the question.
#[async_trait]
pub trait ContextJudge: Send + Sync {
    async fn judge(&self, question: &str, context: &str) -> Result<EvaluationVerdict>;
}

/// Judge backed by a chat completion model.
pub struct LlmJudge {
    llm: Arc<dyn crate::llm::Completion>,
}

impl LlmJudge {
    pub fn new(llm: Arc<dyn crate::llm::Completion>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl ContextJudge for LlmJudge {
    async fn judge(&self, question: &str, context: &str) -> Result<EvaluationVerdict> {
        let messages = vec![
            ChatMessage::new("system", JUDGE_PROMPT),
            ChatMessage::new(
                "user",
                format!("PREGUNTA: {question}\n\nFRAGMENTOS:\n\n{context}"),
            ),
        ];
        let reply = self
            .llm
            .complete(&messages)
            .await
            .context("Context judge call failed")?;
        Ok(parse_verdict(&reply))
    }
}

/// Parse a judge reply. Anything unrecognizable counts as sufficient, so a
/// confused judge never stalls the pipeline.
pub fn parse_verdict(raw: &str) -> EvaluationVerdict {
    if raw.contains(SUFFICIENT_TOKEN) {
        return EvaluationVerdict::sufficient();
    }

    let mut needs = Vec::new();
    let mut drops = Vec::new();
    let mut drop_seen = false;

    for line in raw.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("NEED|") {
            if needs.len() < MAX_NEEDS_PER_ROUND {
                if let Some(need) = answer::parse_need(rest) {
                    needs.push(need);
                }
            }
        } else if let Some(rest) = trimmed.strip_prefix("DROP|") {
            if !drop_seen {
                drops = answer::parse_index_list(rest);
                drop_seen = true;
            }
        }
    }

    if needs.is_empty() && drops.is_empty() {
        return EvaluationVerdict::sufficient();
    }

    EvaluationVerdict {
        sufficient: false,
        needs,
        drops,
    }
}

/// Bounded sufficiency loop over the working set.
///
/// Each round asks the judge, applies its drops against that round's
/// numbering, then resolves its needs through article lookup or a fresh
/// search. Stops on sufficiency, on judge failure, or when a round adds
/// nothing new.
pub async fn run(
    search: &SearchContext,
    judge: &dyn ContextJudge,
    question: &str,
    working: &mut Vec<SearchResult>,
    seen: &mut HashSet<ChunkId>,
    trace: &mut PipelineTrace,
) {
    for round in 0..MAX_EVAL_ITERATIONS {
        if working.is_empty() {
            break;
        }

        let context = answer::build_context(working);
        let verdict = match judge.judge(question, &context).await {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::warn!("Context judge failed, keeping set as-is: {e:#}");
                break;
            }
        };
        trace.eval_iterations += 1;

        if verdict.sufficient {
            tracing::debug!("Context sufficient after {round} enrichment round(s)");
            break;
        }

        // Drops first, against this round's numbering.
        let mut drop_list: Vec<usize> = verdict
            .drops
            .iter()
            .copied()
            .filter(|&i| i < working.len())
            .collect();
        drop_list.sort_unstable();
        drop_list.dedup();
        for &i in drop_list.iter().rev() {
            working.remove(i);
        }
        if !drop_list.is_empty() {
            seen.clear();
            seen.extend(working.iter().map(|r| r.chunk.id.clone()));
            trace.eval_dropped += drop_list.len();
            tracing::info!("Judge dropped {} chunk(s)", drop_list.len());
        }

        // Then resolve the needs.
        let mut fetched: Vec<SearchResult> = Vec::new();
        for need in &verdict.needs {
            match need {
                Need::Article { article, law } => {
                    fetched.extend(search.fetch_by_article(article, law).await);
                }
                Need::Query(query) => {
                    match search.search_all(std::slice::from_ref(query)).await {
                        Ok(outcome) => fetched.extend(outcome.results),
                        Err(e) => tracing::warn!("Judge-requested search failed: {e:#}"),
                    }
                }
            }
        }

        let added = append_unseen(working, seen, fetched);
        trace.eval_added += added;
        tracing::info!(
            "Evaluation round {}: +{added} chunk(s), -{} dropped",
            round + 1,
            drop_list.len()
        );

        if added == 0 {
            break;
        }
        super::rerank_and_cap(working, seen, super::MAX_CHUNKS_TO_MODEL);
    }
}
