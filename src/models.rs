use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable chunk identifier as issued by the vector store.
///
/// Statute points carry integer IDs; case-law and administrative-criteria
/// points carry UUID strings. Both forms round-trip untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChunkId {
    Int(u64),
    Str(String),
}

impl Default for ChunkId {
    fn default() -> Self {
        ChunkId::Int(0)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkId::Int(n) => write!(f, "{n}"),
            ChunkId::Str(s) => f.write_str(s),
        }
    }
}

impl From<u64> for ChunkId {
    fn from(n: u64) -> Self {
        ChunkId::Int(n)
    }
}

impl From<&str> for ChunkId {
    fn from(s: &str) -> Self {
        ChunkId::Str(s.to_string())
    }
}

/// One corpus fragment with its citation metadata
///
/// Field renames follow the store payload keys, so a point payload
/// deserializes straight into this. The ID travels beside the payload and is
/// filled in by the store client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Chunk {
    #[serde(default)]
    pub id: ChunkId,
    #[serde(default)]
    pub law: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub chapter: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    /// Plain-language summary produced at index time
    #[serde(rename = "resumen", default)]
    pub summary: Option<String>,
    #[serde(rename = "palabras_clave", default)]
    pub keywords: Vec<String>,
    /// Outgoing citation targets, precomputed offline
    #[serde(default)]
    pub refs: Vec<ChunkId>,
}

/// How a result entered the working set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Fresh hybrid-search hit
    #[default]
    Search,
    /// Carried over from the previous turn
    Carryover,
    /// Pulled in by the reference expander
    Reference,
    /// Fetched on request of the judge or the answer model
    Evaluator,
}

/// A chunk inside the pipeline's working set, with its scores and origin
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub chunk: Chunk,
    pub collection: String,
    /// Raw store score
    pub score: f32,
    /// Score after the collection weight
    pub weighted_score: f32,
    /// Explicit ordering override; 0.0 until resolved
    pub final_score: f32,
    pub provenance: Provenance,
    /// Why a non-search chunk is here ("sibling", "upward", a lookup tag)
    pub ref_reason: Option<String>,
}

impl SearchResult {
    pub fn new(chunk: Chunk, collection: impl Into<String>, score: f32) -> Self {
        Self {
            chunk,
            collection: collection.into(),
            score,
            weighted_score: score,
            final_score: 0.0,
            provenance: Provenance::Search,
            ref_reason: None,
        }
    }

    /// Score used for ordering: the resolved final score when set, else the
    /// weighted score, else the raw score.
    pub fn effective_score(&self) -> f32 {
        if self.final_score != 0.0 {
            self.final_score
        } else if self.weighted_score > 0.0 {
            self.weighted_score
        } else {
            self.score
        }
    }
}

/// Parallel arrays of vocabulary indices and BM25 term weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

/// A single chat turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Ask request: a question plus the caller-held conversational state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskRequest {
    pub question: String,
    /// Prior turns, oldest first; the current question is not among them
    #[serde(default)]
    pub conversation_tail: Vec<ChatMessage>,
    /// Context chunk IDs that survived the previous turn
    #[serde(default)]
    pub previous_context_ids: Vec<ChunkId>,
}

/// Ask response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AskResponse {
    pub answer: String,
    pub sources: Vec<Source>,
    /// Carryover payload for the caller's next request
    pub context_ids: Vec<ChunkId>,
    pub trace: PipelineTrace,
}

/// One cited source in a response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: ChunkId,
    pub law: String,
    pub section: String,
    pub chapter: String,
    pub collection: String,
    pub carryover: bool,
}

/// Per-query search diagnostics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchDebugEntry {
    pub query_index: usize,
    pub query: String,
    pub count: usize,
    pub top_ids: Vec<ChunkId>,
}

/// Diagnostic counters accumulated across the pipeline stages
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineTrace {
    pub expanded_queries: Vec<String>,
    pub search_results: usize,
    pub search_detail: Vec<SearchDebugEntry>,
    pub refs_found: usize,
    pub refs_added: usize,
    pub eval_iterations: usize,
    pub eval_added: usize,
    pub eval_dropped: usize,
    pub used_indices: Vec<usize>,
    pub drop_indices: Vec<usize>,
    pub need_requests: usize,
    pub total_candidates: usize,
}
