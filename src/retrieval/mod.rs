//! Multi-knowledge-base retrieval
//!
//! A query is embedded once, searched against every registered index in
//! parallel, de-duplicated, optionally narrowed per source, and reranked into
//! the final top-k.

mod deduplication;
mod factory;
mod fanout;
mod hierarchy;
mod pipeline;
mod reranker;

pub use deduplication::deduplicate_hits;
pub use factory::PipelineFactory;
pub use fanout::{initial_k, FanOutSearcher};
pub use hierarchy::{group_by_source, select_hierarchical, HierarchyParams, Selection, SourceGroup};
pub use pipeline::{PipelineSettings, RetrievalPipeline};
pub use reranker::{RerankDecision, RerankOutcome, Reranker, RerankerSettings};

use crate::embedding::EmbeddingError;
use crate::recovery::truncate_chars;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Stands in for a missing or blank source
pub const UNKNOWN_SOURCE: &str = "unknown";

/// Separates the knowledge-base id from the original source
pub const KB_SEPARATOR: char = ':';

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Embedding generation failed: {0}")]
    EmbeddingError(#[from] EmbeddingError),

    #[error("All {attempted} knowledge-base indexes failed or timed out")]
    AllIndexesUnavailable { attempted: usize },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

/// A unit of retrievable text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub content: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    pub fn new(content: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source: source.into(),
            embedding: None,
        }
    }
}

/// A chunk returned by a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub content: String,
    pub source: String,
    /// Index distance, lower is closer
    pub distance: f32,
    /// `1 / (1 + max(distance, 0))`
    pub score: f32,
}

impl Hit {
    pub fn new(content: impl Into<String>, source: impl Into<String>, distance: f32) -> Self {
        Self {
            content: content.into(),
            source: source.into(),
            distance,
            score: distance_to_score(distance),
        }
    }
}

/// Map a distance onto a (0, 1] similarity score
pub fn distance_to_score(distance: f32) -> f32 {
    if distance.is_nan() {
        return 0.0;
    }
    1.0 / (1.0 + distance.max(0.0))
}

/// Sort hits ascending by distance, keeping the relative order of ties
pub fn sort_by_distance(hits: &mut [Hit]) {
    hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
}

/// Trim and cap text at `max_chars` characters, marking the cut with `...`
pub fn truncate_snippet(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    let cut = truncate_chars(text, max_chars);
    if cut.len() == text.len() {
        return text.to_string();
    }
    format!("{}...", cut.trim_end())
}

/// Trimmed source, or `UNKNOWN_SOURCE` when blank
pub fn normalize_source(source: &str) -> &str {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        UNKNOWN_SOURCE
    } else {
        trimmed
    }
}

/// Source prefix owned by a knowledge base: `"{kb_id}:"`
pub fn kb_prefix(kb_id: &str) -> String {
    format!("{}{}", kb_id, KB_SEPARATOR)
}

/// Tag a source with its knowledge base: `"{kb_id}:{source}"`
pub fn tag_source(kb_id: &str, source: &str) -> String {
    format!("{}{}", kb_prefix(kb_id), source)
}

/// One index that produced no hits for a query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of fanning a query out to every index
#[derive(Debug, Clone)]
pub enum SearchOutcome {
    /// Every index answered
    Complete(Vec<Hit>),
    /// Some indexes failed or timed out; hits come from the rest
    Partial {
        hits: Vec<Hit>,
        failures: Vec<IndexFailure>,
    },
}

impl SearchOutcome {
    pub fn hits(&self) -> &[Hit] {
        match self {
            Self::Complete(hits) | Self::Partial { hits, .. } => hits,
        }
    }

    pub fn into_hits(self) -> Vec<Hit> {
        match self {
            Self::Complete(hits) | Self::Partial { hits, .. } => hits,
        }
    }

    pub fn failures(&self) -> &[IndexFailure] {
        match self {
            Self::Complete(_) => &[],
            Self::Partial { failures, .. } => failures,
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Partial { .. })
    }
}
