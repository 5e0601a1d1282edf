use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::models::{Chunk, ChunkId, SparseVector};
use crate::store::{ScoredChunk, VectorStore};

/// Per-branch candidate pool for the server-side rank fusion.
const PREFETCH_LIMIT: usize = 20;
/// Smaller pool for article lookups, which are already law-filtered.
const ARTICLE_PREFETCH_LIMIT: usize = 10;

/// Qdrant client over the raw REST Query API. The hybrid
/// prefetch/fusion/named-vector endpoints are not covered by SDK crates,
/// so requests are built by hand.
pub struct QdrantClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    primary_collection: String,
}

impl QdrantClient {
    pub fn new(client: reqwest::Client, config: &Config) -> Self {
        Self {
            client,
            base_url: config.qdrant_url.trim_end_matches('/').to_string(),
            api_key: config.qdrant_api_key.clone(),
            primary_collection: config.primary_collection.clone(),
        }
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.post(format!("{}{path}", self.base_url));
        if let Some(key) = &self.api_key {
            req = req.header("api-key", key);
        }
        req
    }

    /// POST a JSON body and decode the response. `None` means the collection
    /// does not exist (404); callers treat that as an empty result.
    async fn read_json<B, R>(&self, path: &str, body: &B) -> Result<Option<R>>
    where
        B: Serialize,
        R: DeserializeOwned,
    {
        let resp = self
            .request(path)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach Qdrant at {path}"))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!("Qdrant returned 404 for {path}");
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Qdrant {path} returned {status}: {body}");
        }

        let parsed = resp
            .json::<R>()
            .await
            .with_context(|| format!("Failed to parse Qdrant response from {path}"))?;
        Ok(Some(parsed))
    }
}

#[async_trait]
impl VectorStore for QdrantClient {
    async fn hybrid_query(
        &self,
        collection: &str,
        dense: &[f32],
        sparse: Option<&SparseVector>,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let body = QueryRequest {
            prefetch: build_prefetch(dense, sparse, PREFETCH_LIMIT),
            query: FusionQuery { fusion: "rrf" },
            filter: None,
            limit,
            with_payload: true,
        };
        let path = format!("/collections/{collection}/points/query");
        let resp: Option<QueryResponse> = self.read_json(&path, &body).await?;
        Ok(into_scored(resp))
    }

    async fn article_query(
        &self,
        dense: &[f32],
        sparse: Option<&SparseVector>,
        law_keyword: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let filter = law_keyword.filter(|k| !k.is_empty()).map(|keyword| Filter {
            must: vec![Condition {
                key: "law",
                r#match: MatchText { text: keyword },
            }],
        });
        let body = QueryRequest {
            prefetch: build_prefetch(dense, sparse, ARTICLE_PREFETCH_LIMIT),
            query: FusionQuery { fusion: "rrf" },
            filter,
            limit,
            with_payload: true,
        };
        let path = format!("/collections/{}/points/query", self.primary_collection);
        let resp: Option<QueryResponse> = self.read_json(&path, &body).await?;
        Ok(into_scored(resp))
    }

    async fn retrieve(&self, ids: &[ChunkId]) -> Result<Vec<Chunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let body = FetchRequest {
            ids,
            with_payload: true,
            with_vector: false,
        };
        let path = format!("/collections/{}/points", self.primary_collection);
        let resp: Option<FetchResponse> = self.read_json(&path, &body).await?;
        Ok(resp
            .map(|r| r.result.into_iter().map(into_chunk).collect())
            .unwrap_or_default())
    }

    async fn scroll_article(
        &self,
        article_base: &str,
        law_words: &str,
        limit: usize,
    ) -> Result<Vec<Chunk>> {
        let section = format!("Artículo {article_base}");
        let body = ScrollRequest {
            filter: Filter {
                must: vec![
                    Condition {
                        key: "section",
                        r#match: MatchText { text: &section },
                    },
                    Condition {
                        key: "law",
                        r#match: MatchText { text: law_words },
                    },
                ],
            },
            limit,
            with_payload: true,
        };
        let path = format!("/collections/{}/points/scroll", self.primary_collection);
        let resp: Option<QueryResponse> = self.read_json(&path, &body).await?;
        Ok(resp
            .map(|r| r.result.points.into_iter().map(into_chunk).collect())
            .unwrap_or_default())
    }
}

fn build_prefetch<'a>(
    dense: &'a [f32],
    sparse: Option<&'a SparseVector>,
    limit: usize,
) -> Vec<Prefetch<'a>> {
    let mut prefetch = vec![Prefetch {
        query: PrefetchQuery::Dense(dense),
        using: "text-dense",
        limit,
    }];
    if let Some(sv) = sparse {
        prefetch.push(Prefetch {
            query: PrefetchQuery::Sparse(sv),
            using: "text-sparse",
            limit,
        });
    }
    prefetch
}

fn into_scored(resp: Option<QueryResponse>) -> Vec<ScoredChunk> {
    resp.map(|r| {
        r.result
            .points
            .into_iter()
            .map(|p| {
                let score = p.score;
                ScoredChunk {
                    chunk: into_chunk(p),
                    score,
                }
            })
            .collect()
    })
    .unwrap_or_default()
}

fn into_chunk(p: ScoredPoint) -> Chunk {
    let mut chunk = p.payload.unwrap_or_default();
    chunk.id = p.id;
    chunk
}

// ─── Wire DTOs ───────────────────────────────────────────

#[derive(Serialize)]
struct QueryRequest<'a> {
    prefetch: Vec<Prefetch<'a>>,
    query: FusionQuery,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<Filter<'a>>,
    limit: usize,
    with_payload: bool,
}

#[derive(Serialize)]
struct Prefetch<'a> {
    query: PrefetchQuery<'a>,
    using: &'a str,
    limit: usize,
}

#[derive(Serialize)]
#[serde(untagged)]
enum PrefetchQuery<'a> {
    Dense(&'a [f32]),
    Sparse(&'a SparseVector),
}

#[derive(Serialize)]
struct FusionQuery {
    fusion: &'static str,
}

#[derive(Serialize)]
struct Filter<'a> {
    must: Vec<Condition<'a>>,
}

#[derive(Serialize)]
struct Condition<'a> {
    key: &'a str,
    r#match: MatchText<'a>,
}

#[derive(Serialize)]
struct MatchText<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct ScrollRequest<'a> {
    filter: Filter<'a>,
    limit: usize,
    with_payload: bool,
}

#[derive(Serialize)]
struct FetchRequest<'a> {
    ids: &'a [ChunkId],
    with_payload: bool,
    with_vector: bool,
}

#[derive(Deserialize)]
struct QueryResponse {
    result: QueryResult,
}

#[derive(Deserialize)]
struct QueryResult {
    #[serde(default)]
    points: Vec<ScoredPoint>,
}

#[derive(Deserialize)]
struct FetchResponse {
    #[serde(default)]
    result: Vec<ScoredPoint>,
}

/// Point as returned by query, scroll, and fetch endpoints. Scroll and
/// fetch points carry no score and default to 0.
#[derive(Deserialize)]
struct ScoredPoint {
    id: ChunkId,
    #[serde(default)]
    score: f32,
    payload: Option<Chunk>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_request_wire_shape() {
        let dense = vec![0.1_f32, 0.2];
        let sparse = SparseVector {
            indices: vec![3, 7],
            values: vec![0.5839, 1.4747],
        };
        let body = QueryRequest {
            prefetch: build_prefetch(&dense, Some(&sparse), PREFETCH_LIMIT),
            query: FusionQuery { fusion: "rrf" },
            filter: None,
            limit: 10,
            with_payload: true,
        };

        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["query"]["fusion"], "rrf");
        assert_eq!(v["limit"], 10);
        assert_eq!(v["with_payload"], true);
        assert_eq!(v["prefetch"][0]["using"], "text-dense");
        assert_eq!(v["prefetch"][0]["limit"], 20);
        assert_eq!(v["prefetch"][1]["using"], "text-sparse");
        assert_eq!(v["prefetch"][1]["query"]["indices"], serde_json::json!([3, 7]));
        assert!(v.get("filter").is_none());
    }

    #[test]
    fn test_dense_only_request_has_single_prefetch() {
        let dense = vec![0.1_f32];
        let prefetch = build_prefetch(&dense, None, PREFETCH_LIMIT);
        assert_eq!(prefetch.len(), 1);
    }

    #[test]
    fn test_filter_serializes_text_match() {
        let filter = Filter {
            must: vec![Condition {
                key: "law",
                r#match: MatchText { text: "Estatuto" },
            }],
        };
        let v = serde_json::to_value(&filter).unwrap();
        assert_eq!(v["must"][0]["key"], "law");
        assert_eq!(v["must"][0]["match"]["text"], "Estatuto");
    }

    #[test]
    fn test_fetch_request_carries_mixed_ids() {
        let ids = vec![ChunkId::Int(42), ChunkId::from("norm-7")];
        let body = FetchRequest {
            ids: &ids,
            with_payload: true,
            with_vector: false,
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["ids"], serde_json::json!([42, "norm-7"]));
        assert_eq!(v["with_vector"], false);
    }

    #[test]
    fn test_parses_query_response() {
        let raw = r#"{"result":{"points":[
            {"id":42,"score":0.83,"payload":{"law":"Ley de Prevención de Riesgos Laborales","section":"Artículo 15"}},
            {"id":"uuid-1","payload":{}}
        ]}}"#;
        let resp: QueryResponse = serde_json::from_str(raw).unwrap();
        let scored = into_scored(Some(resp));

        assert_eq!(scored.len(), 2);
        assert_eq!(scored[0].chunk.id, ChunkId::Int(42));
        assert!((scored[0].score - 0.83).abs() < 1e-6);
        assert_eq!(
            scored[0].chunk.section.as_deref(),
            Some("Artículo 15")
        );
        // Scroll-style point without a score defaults to zero.
        assert_eq!(scored[1].score, 0.0);
        assert_eq!(scored[1].chunk.id, ChunkId::from("uuid-1"));
    }

    #[test]
    fn test_missing_payload_yields_empty_chunk() {
        let raw = r#"{"result":{"points":[{"id":7,"score":0.5}]}}"#;
        let resp: QueryResponse = serde_json::from_str(raw).unwrap();
        let scored = into_scored(Some(resp));
        assert_eq!(scored[0].chunk.id, ChunkId::Int(7));
        assert!(scored[0].chunk.law.is_none());
    }
}
