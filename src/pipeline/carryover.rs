use std::collections::HashSet;

use crate::models::{ChunkId, Provenance, SearchResult};
use crate::store::VectorStore;

/// Fixed score for chunks carried over from the previous turn: present but
/// not favored over fresh hits.
pub(crate) const CARRYOVER_SCORE: f32 = 0.5;

/// Fetch the chunks the caller kept from the previous turn and tag them.
/// A failed fetch degrades to starting the turn without carryover.
pub async fn load(
    store: &dyn VectorStore,
    ids: &[ChunkId],
    collection: &str,
) -> Vec<SearchResult> {
    if ids.is_empty() {
        return Vec::new();
    }

    let chunks = match store.retrieve(ids).await {
        Ok(chunks) => chunks,
        Err(e) => {
            tracing::warn!("Carryover fetch failed, continuing without: {e:#}");
            return Vec::new();
        }
    };

    chunks
        .into_iter()
        .map(|chunk| {
            let mut result = SearchResult::new(chunk, collection, CARRYOVER_SCORE);
            result.final_score = CARRYOVER_SCORE;
            result.provenance = Provenance::Carryover;
            result
        })
        .collect()
}

/// IDs of every chunk in the final context the answer did not drop. This is
/// the carryover payload the caller hands back on its next request.
pub fn surviving_ids(results: &[SearchResult], drops: &[usize]) -> Vec<ChunkId> {
    let drop_set: HashSet<usize> = drops.iter().copied().collect();
    results
        .iter()
        .enumerate()
        .filter(|(i, _)| !drop_set.contains(i))
        .map(|(_, r)| r.chunk.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;

    fn result(id: u64) -> SearchResult {
        SearchResult::new(
            Chunk {
                id: ChunkId::Int(id),
                ..Chunk::default()
            },
            "normativa",
            0.5,
        )
    }

    #[test]
    fn test_surviving_ids_exclude_drops() {
        let results = vec![result(1), result(2), result(3), result(4)];
        let ids = surviving_ids(&results, &[1, 3]);
        assert_eq!(ids, vec![ChunkId::Int(1), ChunkId::Int(3)]);
    }

    #[test]
    fn test_surviving_ids_ignore_out_of_range_drops() {
        let results = vec![result(1), result(2)];
        let ids = surviving_ids(&results, &[7, 99]);
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_surviving_ids_empty_set() {
        assert!(surviving_ids(&[], &[0]).is_empty());
    }
}
