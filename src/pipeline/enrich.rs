use anyhow::Result;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use crate::llm::truncate_on_boundary;
use crate::models::{Chunk, ChunkId, Provenance, SearchResult};
use crate::store::VectorStore;

const MAX_REFS_PER_CHUNK: usize = 3;
const MAX_TOTAL_REFS: usize = 15;
const REF_SCORE_FACTOR: f32 = 0.8;

/// Normative rank per law, lower is higher authority. Names are compared
/// lowercased against these keys.
const LAW_RANK: &[(&str, u8)] = &[
    ("constitución española [parcial]", 1),
    ("ley orgánica de libertad sindical", 1),
    ("texto refundido de la ley del estatuto de los trabajadores", 2),
    ("texto refundido de la ley general de la seguridad social", 2),
    ("ley del estatuto del trabajo autónomo", 2),
    (
        "texto refundido de la ley sobre infracciones y sanciones en el orden social",
        2,
    ),
    ("ley reguladora de la jurisdicción social", 2),
    ("ley de prevención de riesgos laborales", 2),
    ("ley de empleo [parcial]", 2),
    ("ley de trabajo a distancia [parcial]", 2),
    (
        "ley de protección social de las personas trabajadoras del sector marítimo-pesquero",
        2,
    ),
];

fn law_rank(law: Option<&str>) -> u8 {
    let Some(law) = law.filter(|l| !l.is_empty()) else {
        return 99;
    };
    let lower = law.to_lowercase();

    if let Some((_, rank)) = LAW_RANK.iter().find(|(name, _)| *name == lower) {
        return *rank;
    }
    if let Some(rest) = lower.strip_prefix("ley") {
        let boundary = rest
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric() && c != '_');
        if boundary {
            return 2;
        }
    }
    if lower.contains("reglamento general") {
        return 3;
    }
    if lower.contains("real decreto") {
        return 4;
    }
    5
}

/// Base article token of an "Artículo N [bis|ter|quater|quinquies] ..."
/// section heading, lowercased. None when the heading has another shape.
fn article_base(section: &str) -> Option<String> {
    let lower = section.to_lowercase();
    let rest = lower
        .strip_prefix("artículo")
        .or_else(|| lower.strip_prefix("articulo"))?;

    let after_ws = rest.trim_start();
    if after_ws.len() == rest.len() {
        return None;
    }

    let digits_len = after_ws
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(after_ws.len());
    if digits_len == 0 {
        return None;
    }
    let (digits, tail) = after_ws.split_at(digits_len);

    let trimmed_tail = tail.trim_start();
    let gap = &tail[..tail.len() - trimmed_tail.len()];
    for suffix in ["bis", "ter", "quater", "quinquies"] {
        if trimmed_tail.starts_with(suffix) {
            return Some(format!("{digits}{gap}{suffix}"));
        }
    }

    Some(digits.to_string())
}

/// Two chunks are siblings when they sit under the same base article of the
/// same law but are different points, e.g. Artículo 48.2 alongside
/// Artículo 48.5. A "bis"/"ter" variant counts as its own article.
fn is_sibling(source: &Chunk, target: &Chunk) -> bool {
    let (Some(src_sec), Some(tgt_sec)) = (source.section.as_deref(), target.section.as_deref())
    else {
        return false;
    };
    if src_sec.is_empty() || tgt_sec.is_empty() || source.law != target.law || source.id == target.id
    {
        return false;
    }

    matches!(
        (article_base(src_sec), article_base(tgt_sec)),
        (Some(a), Some(b)) if a == b
    )
}

/// One-hop expansion of the precomputed citation graph.
///
/// Fetches every referenced-but-unretrieved chunk, keeps a reference only
/// when it points upward or sideways in the law hierarchy (target rank ≤
/// source rank, or sibling article), and scores kept chunks from their
/// best parent. Returns the new results and how many candidate refs the
/// working set carried.
pub async fn expand_references(
    store: &dyn VectorStore,
    results: &[SearchResult],
    collection: &str,
) -> Result<(Vec<SearchResult>, usize)> {
    let existing: HashSet<ChunkId> = results.iter().map(|r| r.chunk.id.clone()).collect();

    let mut candidates: Vec<ChunkId> = Vec::new();
    let mut candidate_set: HashSet<ChunkId> = HashSet::new();
    for result in results {
        for ref_id in &result.chunk.refs {
            if !existing.contains(ref_id) && candidate_set.insert(ref_id.clone()) {
                candidates.push(ref_id.clone());
            }
        }
    }

    let refs_found = candidates.len();
    if refs_found == 0 {
        tracing::debug!("No precomputed references to fetch");
        return Ok((Vec::new(), 0));
    }

    tracing::debug!("Fetching {refs_found} candidate refs to filter");
    let fetched = store.retrieve(&candidates).await?;
    let fetched_map: HashMap<ChunkId, Chunk> = fetched
        .into_iter()
        .map(|chunk| (chunk.id.clone(), chunk))
        .collect();

    // Second pass over the sources, in ranking order: the first chunk to
    // claim a reference keeps it.
    let mut claimed: HashMap<ChunkId, f32> = HashMap::new();
    let mut claim_order: Vec<(ChunkId, &'static str)> = Vec::new();

    for result in results {
        if result.chunk.refs.is_empty() {
            continue;
        }

        let src_rank = law_rank(result.chunk.law.as_deref());
        let mut kept: Vec<(ChunkId, &'static str)> = Vec::new();
        let mut skipped = 0usize;

        for ref_id in &result.chunk.refs {
            if existing.contains(ref_id) || claimed.contains_key(ref_id) {
                continue;
            }
            let Some(target) = fetched_map.get(ref_id) else {
                continue;
            };

            let sibling = is_sibling(&result.chunk, target);
            if sibling || law_rank(target.law.as_deref()) <= src_rank {
                kept.push((ref_id.clone(), if sibling { "sibling" } else { "upward" }));
            } else {
                skipped += 1;
            }
        }

        kept.truncate(MAX_REFS_PER_CHUNK);

        if !kept.is_empty() || skipped > 0 {
            tracing::debug!(
                "id={} ({}) refs: {} kept, {skipped} filtered out",
                result.chunk.id,
                truncate_on_boundary(result.chunk.section.as_deref().unwrap_or("?"), 40),
                kept.len()
            );
        }

        let parent = if result.weighted_score > 0.0 {
            result.weighted_score
        } else {
            result.score
        };
        for (id, reason) in kept {
            let inherited = parent * REF_SCORE_FACTOR;
            match claimed.entry(id.clone()) {
                Entry::Occupied(mut entry) => {
                    if inherited > *entry.get() {
                        entry.insert(inherited);
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(inherited);
                    claim_order.push((id, reason));
                }
            }
        }
    }

    let mut added: Vec<SearchResult> = claim_order
        .into_iter()
        .filter_map(|(id, reason)| {
            let chunk = fetched_map.get(&id)?.clone();
            let mut result = SearchResult::new(chunk, collection, 0.0);
            result.final_score = claimed[&id];
            result.provenance = Provenance::Reference;
            result.ref_reason = Some(reason.to_string());
            Some(result)
        })
        .collect();

    added.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    if added.len() > MAX_TOTAL_REFS {
        tracing::info!(
            "Reference cap: {} → {MAX_TOTAL_REFS}, cut lowest-scored",
            added.len()
        );
        added.truncate(MAX_TOTAL_REFS);
    }

    if added.is_empty() {
        tracing::info!("All {refs_found} candidate refs filtered out");
    } else {
        tracing::info!("Added {} referenced chunks ({refs_found} candidates)", added.len());
        for r in &added {
            tracing::debug!(
                "  + id={} [{}] score={:.4} {} > {}",
                r.chunk.id,
                r.ref_reason.as_deref().unwrap_or(""),
                r.final_score,
                r.chunk.law.as_deref().unwrap_or("?"),
                truncate_on_boundary(r.chunk.section.as_deref().unwrap_or("?"), 60)
            );
        }
    }

    Ok((added, refs_found))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: u64, law: &str, section: &str) -> Chunk {
        Chunk {
            id: ChunkId::Int(id),
            law: Some(law.to_string()),
            section: Some(section.to_string()),
            ..Chunk::default()
        }
    }

    #[test]
    fn test_law_rank_table_entries() {
        assert_eq!(law_rank(Some("Constitución Española [parcial]")), 1);
        assert_eq!(
            law_rank(Some("Texto refundido de la Ley del Estatuto de los Trabajadores")),
            2
        );
        // Lookup ignores case.
        assert_eq!(law_rank(Some("LEY DE PREVENCIÓN DE RIESGOS LABORALES")), 2);
    }

    #[test]
    fn test_law_rank_fallbacks() {
        assert_eq!(law_rank(Some("Ley 31/1995 de algo")), 2);
        assert_eq!(law_rank(Some("Leyenda urbana")), 5);
        assert_eq!(law_rank(Some("Reglamento General de Cotización")), 3);
        assert_eq!(law_rank(Some("Real Decreto 1620/2011")), 4);
        assert_eq!(law_rank(Some("Orden TAS/1234")), 5);
        assert_eq!(law_rank(None), 99);
        assert_eq!(law_rank(Some("")), 99);
    }

    #[test]
    fn test_article_base_parsing() {
        assert_eq!(article_base("Artículo 48. Suspensión"), Some("48".to_string()));
        assert_eq!(article_base("Artículo 48 bis"), Some("48 bis".to_string()));
        assert_eq!(article_base("artículo 12ter extra"), Some("12ter".to_string()));
        assert_eq!(article_base("Disposición adicional primera"), None);
        assert_eq!(article_base("Artículo sin número"), None);
    }

    #[test]
    fn test_siblings_share_base_article() {
        let a = chunk(1, "ET", "Artículo 48. Suspensión con reserva");
        let b = chunk(2, "ET", "Artículo 48.4 Nacimiento y cuidado");
        let c = chunk(3, "ET", "Artículo 49. Extinción");
        let d = chunk(4, "LGSS", "Artículo 48");
        let e = chunk(5, "ET", "Artículo 48 bis");

        assert!(is_sibling(&a, &b));
        assert!(!is_sibling(&a, &c));
        // Different law, same number: not a sibling.
        assert!(!is_sibling(&a, &d));
        // "48 bis" is a distinct article, not part of 48.
        assert!(!is_sibling(&a, &e));
        // A chunk is never its own sibling.
        assert!(!is_sibling(&a, &a));
    }

    struct FakeStore {
        chunks: Vec<Chunk>,
    }

    #[async_trait::async_trait]
    impl VectorStore for FakeStore {
        async fn hybrid_query(
            &self,
            _collection: &str,
            _dense: &[f32],
            _sparse: Option<&crate::models::SparseVector>,
            _limit: usize,
        ) -> Result<Vec<crate::store::ScoredChunk>> {
            Ok(Vec::new())
        }

        async fn article_query(
            &self,
            _dense: &[f32],
            _sparse: Option<&crate::models::SparseVector>,
            _law_keyword: Option<&str>,
            _limit: usize,
        ) -> Result<Vec<crate::store::ScoredChunk>> {
            Ok(Vec::new())
        }

        async fn retrieve(&self, ids: &[ChunkId]) -> Result<Vec<Chunk>> {
            Ok(self
                .chunks
                .iter()
                .filter(|c| ids.contains(&c.id))
                .cloned()
                .collect())
        }

        async fn scroll_article(
            &self,
            _article_base: &str,
            _law_words: &str,
            _limit: usize,
        ) -> Result<Vec<Chunk>> {
            Ok(Vec::new())
        }
    }

    fn source(id: u64, law: &str, section: &str, refs: Vec<u64>, weighted: f32) -> SearchResult {
        let mut c = chunk(id, law, section);
        c.refs = refs.into_iter().map(ChunkId::Int).collect();
        let mut r = SearchResult::new(c, "normativa", weighted);
        r.weighted_score = weighted;
        r
    }

    #[tokio::test]
    async fn test_expand_keeps_upward_and_sibling_refs() {
        let et = "Texto refundido de la Ley del Estatuto de los Trabajadores";
        let store = FakeStore {
            chunks: vec![
                chunk(10, "Constitución Española [parcial]", "Artículo 35"),
                chunk(11, "Real Decreto 1620/2011", "Artículo 2"),
                chunk(12, et, "Artículo 48.4 Nacimiento"),
            ],
        };
        let sources = vec![source(1, et, "Artículo 48. Suspensión", vec![10, 11, 12], 0.9)];

        let (added, refs_found) = expand_references(&store, &sources, "normativa")
            .await
            .unwrap();

        assert_eq!(refs_found, 3);
        assert_eq!(added.len(), 2);
        assert_eq!(added[0].chunk.id, ChunkId::Int(10));
        assert_eq!(added[0].ref_reason.as_deref(), Some("upward"));
        assert_eq!(added[1].chunk.id, ChunkId::Int(12));
        assert_eq!(added[1].ref_reason.as_deref(), Some("sibling"));

        for r in &added {
            assert_eq!(r.provenance, Provenance::Reference);
            assert!((r.final_score - 0.9 * 0.8).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn test_expand_skips_already_present_ids() {
        let store = FakeStore {
            chunks: vec![chunk(10, "Ley de Empleo [parcial]", "Artículo 1")],
        };
        let sources = vec![
            source(1, "Ley de Empleo [parcial]", "Artículo 2", vec![10], 0.9),
            source(10, "Ley de Empleo [parcial]", "Artículo 1", vec![], 0.4),
        ];

        let (added, refs_found) = expand_references(&store, &sources, "normativa")
            .await
            .unwrap();
        assert_eq!(refs_found, 0);
        assert!(added.is_empty());
    }

    #[tokio::test]
    async fn test_expand_first_claimant_wins() {
        let store = FakeStore {
            chunks: vec![chunk(10, "Ley reguladora de la jurisdicción social", "Artículo 1")],
        };
        let sources = vec![
            source(1, "Ley de Prevención de Riesgos Laborales", "Artículo 5", vec![10], 0.6),
            source(2, "Ley de Prevención de Riesgos Laborales", "Artículo 6", vec![10], 0.9),
        ];

        let (added, _) = expand_references(&store, &sources, "normativa")
            .await
            .unwrap();
        assert_eq!(added.len(), 1);
        // Claimed by the first source; its score applies.
        assert!((added[0].final_score - 0.6 * 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_expand_caps_per_chunk() {
        let law = "Ley reguladora de la jurisdicción social";
        let store = FakeStore {
            chunks: (10..20).map(|i| chunk(i, law, "Artículo 9")).collect(),
        };
        let sources = vec![source(1, law, "Artículo 1", (10..20).collect(), 0.9)];

        let (added, refs_found) = expand_references(&store, &sources, "normativa")
            .await
            .unwrap();
        assert_eq!(refs_found, 10);
        assert_eq!(added.len(), MAX_REFS_PER_CHUNK);
    }
}
