use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Qdrant base URL
    pub qdrant_url: String,
    /// Qdrant API key, sent as the `api-key` header when set
    pub qdrant_api_key: Option<String>,
    /// LLM provider configuration
    pub llm: LlmConfig,
    /// Directory holding the per-collection vocabulary artifacts
    pub vocab_dir: PathBuf,
    /// Searched collections with their score weights, in search order
    pub collections: Vec<CollectionWeight>,
    /// Collection holding statute chunks; point lookups, the reference
    /// graph and article scans all resolve against it
    pub primary_collection: String,
    /// Maximum decomposed queries searched concurrently
    pub max_concurrent_searches: usize,
}

/// One searched collection and the weight applied to its scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionWeight {
    pub name: String,
    pub weight: f32,
}

impl CollectionWeight {
    pub fn new(name: impl Into<String>, weight: f32) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// "ollama" or "openai"
    pub provider: String,
    /// Base URL for the LLM API
    pub base_url: String,
    /// Model name for chat completions
    pub chat_model: String,
    /// Model name for embeddings
    pub embedding_model: String,
    /// API key (only needed for cloud providers)
    pub api_key: Option<String>,
    /// Embedding vector dimension
    pub embedding_dim: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            qdrant_url: "http://localhost:6333".to_string(),
            qdrant_api_key: None,
            llm: LlmConfig::default(),
            vocab_dir: PathBuf::from("./data/vocab"),
            collections: vec![
                CollectionWeight::new("normativa", 1.0),
                CollectionWeight::new("sentencias", 0.8),
                CollectionWeight::new("criterios_inss", 0.9),
            ],
            primary_collection: "normativa".to_string(),
            max_concurrent_searches: 4,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            base_url: "http://localhost:11434".to_string(),
            chat_model: "llama3.1".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            api_key: None,
            embedding_dim: 768,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("QDRANT_URL") {
            config.qdrant_url = url;
        }
        if let Ok(key) = std::env::var("QDRANT_API_KEY") {
            config.qdrant_api_key = Some(key);
        }
        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            config.llm.provider = provider;
        }
        if let Ok(url) = std::env::var("LLM_BASE_URL") {
            config.llm.base_url = url;
        }
        if let Ok(model) = std::env::var("LLM_CHAT_MODEL") {
            config.llm.chat_model = model;
        }
        if let Ok(model) = std::env::var("LLM_EMBEDDING_MODEL") {
            config.llm.embedding_model = model;
        }
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            config.llm.api_key = Some(key);
        }
        if let Ok(dim) = std::env::var("LLM_EMBEDDING_DIM") {
            if let Ok(d) = dim.parse() {
                config.llm.embedding_dim = d;
            }
        }
        if let Ok(dir) = std::env::var("NORMA_RAG_VOCAB_DIR") {
            config.vocab_dir = PathBuf::from(dir);
        }
        if let Ok(val) = std::env::var("NORMA_RAG_MAX_CONCURRENT_SEARCHES") {
            if let Ok(v) = val.parse() {
                config.max_concurrent_searches = v;
            }
        }

        config
    }

    /// Weight for one collection; unknown collections count fully.
    pub fn collection_weight(&self, name: &str) -> f32 {
        self.collections
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.weight)
            .unwrap_or(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_collections_and_weights() {
        let config = Config::default();
        assert_eq!(config.collections.len(), 3);
        assert_eq!(config.collections[0].name, "normativa");
        assert_eq!(config.collection_weight("sentencias"), 0.8);
        assert_eq!(config.collection_weight("criterios_inss"), 0.9);
        assert_eq!(config.collection_weight("desconocida"), 1.0);
    }

    #[test]
    fn test_primary_collection_is_weighted_fully() {
        let config = Config::default();
        assert_eq!(config.collection_weight(&config.primary_collection), 1.0);
    }
}
