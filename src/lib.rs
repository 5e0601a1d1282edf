//! # norma-rag
//!
//! Retrieval-augmented question answering over Spanish labor and
//! social-security law: dense plus sparse search across weighted Qdrant
//! collections, with LLM-driven query decomposition, context judging, and
//! grounded answers that cite their sources.
//!
//! ## Architecture
//!
//! A question moves through a fixed sequence of stages:
//!
//! ```text
//!                         ┌──────────────┐
//!                         │   Question   │
//!                         └──────┬───────┘
//!                                │ + conversation tail, carryover IDs
//!                                ▼
//!                  ┌─────────────────────────┐
//!                  │   Query Decomposition   │
//!                  │  (LLM: up to 4 queries) │
//!                  └────────────┬────────────┘
//!            ┌──────────────────┼──────────────────┐
//!            ▼                  ▼                  ▼
//!     ┌─────────────┐    ┌─────────────┐    ┌─────────────┐
//!     │   Query 1   │    │   Query 2   │    │   Query N   │
//!     │ dense+sparse│    │ dense+sparse│    │ dense+sparse│
//!     └──────┬──────┘    └──────┬──────┘    └──────┬──────┘
//!            │   per collection, weighted scores   │
//!            └──────────────────┼──────────────────┘
//!                               │
//!                               ▼
//!                  ┌───────────────────────┐
//!                  │  Merge + carryover    │
//!                  │  Reference expansion  │
//!                  │  Keep top 25          │
//!                  └───────────┬───────────┘
//!                              │
//!                              ▼
//!                  ┌───────────────────────┐
//!                  │  Sufficiency judge    │
//!                  │  ≤2 rounds:           │
//!                  │  drop noise, fetch    │
//!                  │  missing articles     │
//!                  └───────────┬───────────┘
//!                              │
//!                              ▼
//!                  ┌───────────────────────┐
//!                  │  Answer generation    │
//!                  │  USED / DROP / NEED   │
//!                  │  one retry on NEED    │
//!                  └───────────┬───────────┘
//!                              │
//!                              ▼
//!                  ┌───────────────────────┐
//!                  │  Answer + sources +   │
//!                  │  carryover IDs        │
//!                  └───────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`config`] - Environment-based configuration for Qdrant, collections, and LLM settings
//! - [`error`] - The stage-tagged pipeline error type
//! - [`llm`] - Query embeddings and chat completions via Ollama or OpenAI-compatible APIs
//! - [`models`] - Shared data types: `Chunk`, `SearchResult`, request/response types
//! - [`pipeline`] - The ask pipeline: decomposition, carryover, enrichment, judging, answering
//! - [`search::tokenize`] - Spanish analyzer: lowercasing, diacritic folding, stopwords, stemming
//! - [`search::sparse`] - Vocabulary-backed BM25 query vectors for sparse search
//! - [`search::hybrid`] - Concurrent multi-query fan-out over weighted collections
//! - [`store`] - Qdrant HTTP client: hybrid queries, point retrieval, article scans

pub mod config;
pub mod error;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod search;
pub mod store;
