//! Query-side retrieval: Spanish tokenization, BM25 sparse vectors built
//! from the indexer's vocabularies, and the multi-query hybrid fan-out.

pub mod hybrid;
pub mod sparse;
pub mod tokenize;
