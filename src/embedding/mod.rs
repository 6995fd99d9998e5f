/// Embedding & vector indexing
///
/// - EmbeddingProvider trait for abstraction
/// - FastEmbedProvider for local embedding (all-MiniLM-L6-v2, 384-dim)
/// - VectorIndex: HNSW over L2 distance, persisted as an index file plus a
///   metadata file per knowledge-base directory
mod provider;
mod vector_index;

pub use provider::{EmbeddingError, EmbeddingProvider, FastEmbedProvider};
pub use vector_index::{
    IndexedChunk, SearchResult, VectorIndex, VectorIndexError, INDEX_FILE, METADATA_FILE,
};

use crate::config::IndexingConfig;
use serde::{Deserialize, Serialize};

/// HNSW parameters applied to every knowledge-base index
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IndexParams {
    /// Number of connections per layer
    pub m: usize,
    /// Construction beam width (higher = better recall, slower build)
    pub ef_construction: usize,
    /// Search beam width, raised to k when k is larger
    pub ef_search: usize,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

impl From<&IndexingConfig> for IndexParams {
    fn from(config: &IndexingConfig) -> Self {
        Self {
            m: config.hnsw_m,
            ef_construction: config.hnsw_ef_construction,
            ef_search: config.hnsw_ef_search,
        }
    }
}
