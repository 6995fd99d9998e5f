/// HNSW vector index for similarity search, persisted per knowledge base
use super::IndexParams;
use crate::retrieval::normalize_source;
use hnsw_rs::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Presence of this file marks a directory as an initialized index
pub const INDEX_FILE: &str = "index.bin";
/// Chunk contents and sources, parallel to the vectors in `INDEX_FILE`
pub const METADATA_FILE: &str = "metadata.json";

const MAX_LAYERS: usize = 16;
const MIN_CAPACITY: usize = 1024;
const ZSTD_LEVEL: i32 = 3;

#[derive(Error, Debug)]
pub enum VectorIndexError {
    #[error("Index not found: {0:?}")]
    IndexNotFound(PathBuf),

    #[error("Corrupt index at {path:?}: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Chunk at position {0} has no embedding")]
    MissingEmbedding(usize),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// A stored chunk together with its embedding
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedChunk {
    pub content: String,
    pub source: String,
    pub vector: Vec<f32>,
}

/// Nearest-neighbour result (L2 distance, lower is closer)
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub content: String,
    pub source: String,
    pub distance: f32,
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    dimension: usize,
    vectors: Vec<Vec<f32>>,
}

#[derive(Serialize, Deserialize)]
struct MetadataFile {
    contents: Vec<String>,
    sources: Vec<String>,
}

/// HNSW vector index wrapper
///
/// HNSW ids are positions in `chunks`. Removal rebuilds the graph so ids stay
/// dense.
pub struct VectorIndex {
    graph: Hnsw<'static, f32, DistL2>,
    chunks: Vec<IndexedChunk>,
    dimension: usize,
    params: IndexParams,
}

impl VectorIndex {
    /// Create an empty index
    pub fn new(dimension: usize, params: IndexParams) -> Self {
        Self {
            graph: Self::build_graph(&[], &params),
            chunks: Vec::new(),
            dimension,
            params,
        }
    }

    fn build_graph(chunks: &[IndexedChunk], params: &IndexParams) -> Hnsw<'static, f32, DistL2> {
        let capacity = (chunks.len() * 2).max(MIN_CAPACITY);
        let graph = Hnsw::<f32, DistL2>::new(
            params.m,
            capacity,
            MAX_LAYERS,
            params.ef_construction,
            DistL2,
        );
        for (id, chunk) in chunks.iter().enumerate() {
            graph.insert((&chunk.vector, id));
        }
        graph
    }

    /// Whether `dir` holds a persisted index
    pub fn exists(dir: &Path) -> bool {
        dir.join(INDEX_FILE).is_file()
    }

    /// Load a persisted index from `dir`
    ///
    /// The returned index carries the dimension it was built with, which may
    /// differ from the active embedder's.
    pub fn load(dir: &Path, params: IndexParams) -> Result<Self, VectorIndexError> {
        let index_path = dir.join(INDEX_FILE);
        if !index_path.is_file() {
            return Err(VectorIndexError::IndexNotFound(dir.to_path_buf()));
        }

        let compressed = std::fs::read(&index_path)?;
        let raw = zstd::decode_all(&compressed[..])?;
        let index_file: IndexFile = serde_json::from_slice(&raw)
            .map_err(|e| VectorIndexError::SerializationError(e.to_string()))?;

        let metadata_path = dir.join(METADATA_FILE);
        let metadata_raw = std::fs::read_to_string(&metadata_path).map_err(|e| {
            VectorIndexError::Corrupt {
                path: dir.to_path_buf(),
                message: format!("cannot read {}: {}", METADATA_FILE, e),
            }
        })?;
        let metadata: MetadataFile = serde_json::from_str(&metadata_raw)
            .map_err(|e| VectorIndexError::SerializationError(e.to_string()))?;

        let count = index_file.vectors.len();
        if metadata.contents.len() != count || metadata.sources.len() != count {
            return Err(VectorIndexError::Corrupt {
                path: dir.to_path_buf(),
                message: format!(
                    "{} vectors but {} contents and {} sources",
                    count,
                    metadata.contents.len(),
                    metadata.sources.len()
                ),
            });
        }

        if let Some(bad) = index_file
            .vectors
            .iter()
            .find(|v| v.len() != index_file.dimension)
        {
            return Err(VectorIndexError::Corrupt {
                path: dir.to_path_buf(),
                message: format!(
                    "vector of length {} in a {}-dimensional index",
                    bad.len(),
                    index_file.dimension
                ),
            });
        }

        let chunks: Vec<IndexedChunk> = index_file
            .vectors
            .into_iter()
            .zip(metadata.contents)
            .zip(metadata.sources)
            .map(|((vector, content), source)| IndexedChunk {
                content,
                source,
                vector,
            })
            .collect();

        Ok(Self {
            graph: Self::build_graph(&chunks, &params),
            chunks,
            dimension: index_file.dimension,
            params,
        })
    }

    /// Persist the index into `dir`, creating it if needed
    ///
    /// The metadata file is written before the index file so a crash never
    /// leaves an index file without its metadata.
    pub fn save(&self, dir: &Path) -> Result<(), VectorIndexError> {
        std::fs::create_dir_all(dir)?;

        let metadata = MetadataFile {
            contents: self.chunks.iter().map(|c| c.content.clone()).collect(),
            sources: self.chunks.iter().map(|c| c.source.clone()).collect(),
        };
        let metadata_raw = serde_json::to_vec(&metadata)
            .map_err(|e| VectorIndexError::SerializationError(e.to_string()))?;
        write_atomically(&dir.join(METADATA_FILE), &metadata_raw)?;

        let index_file = IndexFile {
            dimension: self.dimension,
            vectors: self.chunks.iter().map(|c| c.vector.clone()).collect(),
        };
        let raw = serde_json::to_vec(&index_file)
            .map_err(|e| VectorIndexError::SerializationError(e.to_string()))?;
        let compressed = zstd::encode_all(&raw[..], ZSTD_LEVEL)?;
        write_atomically(&dir.join(INDEX_FILE), &compressed)?;

        Ok(())
    }

    /// Delete the persisted files in `dir`, leaving the directory itself
    pub fn remove_files(dir: &Path) -> Result<(), VectorIndexError> {
        for name in [INDEX_FILE, METADATA_FILE] {
            let path = dir.join(name);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Append chunks. Either every chunk is added or none is.
    pub fn add(&mut self, chunks: Vec<IndexedChunk>) -> Result<usize, VectorIndexError> {
        if let Some(bad) = chunks.iter().find(|c| c.vector.len() != self.dimension) {
            return Err(VectorIndexError::InvalidDimension {
                expected: self.dimension,
                actual: bad.vector.len(),
            });
        }

        let added = chunks.len();
        for chunk in chunks {
            let id = self.chunks.len();
            self.graph.insert((&chunk.vector, id));
            self.chunks.push(chunk);
        }
        Ok(added)
    }

    /// Search for the k nearest chunks, closest first
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>, VectorIndexError> {
        if query.len() != self.dimension {
            return Err(VectorIndexError::InvalidDimension {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if self.chunks.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let ef_search = self.params.ef_search.max(k);
        let mut results: Vec<SearchResult> = self
            .graph
            .search(query, k, ef_search)
            .into_iter()
            .filter_map(|neighbour| {
                self.chunks.get(neighbour.d_id).map(|chunk| SearchResult {
                    content: chunk.content.clone(),
                    source: chunk.source.clone(),
                    distance: neighbour.distance,
                })
            })
            .collect();

        results.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        Ok(results)
    }

    /// Remove every chunk whose normalized source starts with `prefix`
    pub fn remove_by_prefix(&mut self, prefix: &str) -> usize {
        let before = self.chunks.len();
        self.chunks
            .retain(|chunk| !normalize_source(&chunk.source).starts_with(prefix));
        let removed = before - self.chunks.len();

        if removed > 0 {
            self.graph = Self::build_graph(&self.chunks, &self.params);
        }
        removed
    }

    pub fn chunks(&self) -> &[IndexedChunk] {
        &self.chunks
    }

    /// Get the number of vectors in the index
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Check if index is empty
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Get vector dimension
    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}
