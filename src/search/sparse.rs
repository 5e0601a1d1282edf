use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::models::SparseVector;
use crate::search::tokenize::tokenize;

/// Collection name → vocabulary artifact produced by the offline indexer.
const VOCAB_FILES: &[(&str, &str)] = &[
    ("normativa", "tfidf_vocabulary.json"),
    ("sentencias", "tfidf_vocabulary_sentencias.json"),
    ("criterios_inss", "tfidf_vocabulary_criterios.json"),
];

/// Terms scoring at or below this contribute nothing and are dropped.
const MIN_TERM_SCORE: f64 = 0.01;

#[derive(Debug, Deserialize)]
pub struct TermEntry {
    pub idx: u32,
    pub idf: f64,
}

/// BM25 vocabulary for one collection, loaded from the indexer's JSON dump.
#[derive(Debug, Deserialize)]
pub struct Vocabulary {
    #[serde(default)]
    pub num_docs: u64,
    #[serde(default)]
    pub num_terms: u64,
    pub avg_doc_length: f64,
    pub bm25_k1: f64,
    pub bm25_b: f64,
    pub terms: HashMap<String, TermEntry>,
}

impl Vocabulary {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read vocabulary file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse vocabulary file {}", path.display()))
    }

    /// Build a BM25-weighted sparse vector for query text. Returns `None`
    /// when no token survives tokenization or scores above the floor, in
    /// which case the caller falls back to dense-only search.
    pub fn build_sparse_vector(&self, text: &str) -> Option<SparseVector> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return None;
        }

        let mut tf: HashMap<&str, usize> = HashMap::new();
        for token in &tokens {
            *tf.entry(token.as_str()).or_insert(0) += 1;
        }

        let doc_len = tokens.len() as f64;
        let mut pairs: Vec<(u32, f32)> = Vec::new();
        for (term, count) in &tf {
            if let Some(entry) = self.terms.get(*term) {
                let count = *count as f64;
                let saturation = self.bm25_k1
                    * (1.0 - self.bm25_b + self.bm25_b * doc_len / self.avg_doc_length);
                let score = count / (count + saturation) * entry.idf;
                if score > MIN_TERM_SCORE {
                    pairs.push((entry.idx, round4(score)));
                }
            }
        }

        if pairs.is_empty() {
            return None;
        }

        // Sort by index so repeated calls produce identical vectors.
        pairs.sort_by_key(|(idx, _)| *idx);
        let (indices, values) = pairs.into_iter().unzip();
        Some(SparseVector { indices, values })
    }
}

fn round4(score: f64) -> f32 {
    ((score * 10_000.0).round() / 10_000.0) as f32
}

/// The vocabularies for all collections that have one on disk.
#[derive(Debug, Default)]
pub struct VocabularySet {
    vocabs: HashMap<String, Vocabulary>,
}

impl VocabularySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every known vocabulary file under `dir`. A missing or unreadable
    /// file disables sparse queries for that collection only.
    pub fn load(dir: &Path) -> Self {
        let mut set = Self::new();
        for (collection, filename) in VOCAB_FILES {
            let path = dir.join(filename);
            if !path.exists() {
                tracing::warn!(
                    "Vocabulary file {} not found, sparse queries disabled for {collection}",
                    path.display()
                );
                continue;
            }
            match Vocabulary::load(&path) {
                Ok(vocab) => {
                    tracing::info!(
                        "Sparse vocabulary [{collection}] loaded: {} terms, {} docs",
                        vocab.terms.len(),
                        vocab.num_docs
                    );
                    set.vocabs.insert((*collection).to_string(), vocab);
                }
                Err(e) => tracing::warn!("Failed to load vocabulary {filename}: {e:#}"),
            }
        }
        if set.vocabs.is_empty() {
            tracing::warn!("No sparse vocabularies loaded, all queries will run dense-only");
        }
        set
    }

    pub fn insert(&mut self, collection: impl Into<String>, vocab: Vocabulary) {
        self.vocabs.insert(collection.into(), vocab);
    }

    pub fn get(&self, collection: &str) -> Option<&Vocabulary> {
        self.vocabs.get(collection)
    }

    /// Sparse vector for `text` under the named collection's vocabulary, or
    /// `None` when that collection has no vocabulary loaded.
    pub fn build(&self, collection: &str, text: &str) -> Option<SparseVector> {
        self.vocabs.get(collection)?.build_sparse_vector(text)
    }
}
