//! Knowledge-base index registry
//!
//! One `VectorIndex` per configured directory. The set of indexes is held
//! behind an `Arc` that `reload` swaps in one step, so searches that already
//! took a snapshot finish against the indexes they started with.

use crate::embedding::{IndexParams, IndexedChunk, VectorIndex, VectorIndexError};
use crate::retrieval::{kb_prefix, IndexFailure};
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// A vector index bound to its storage directory
///
/// `writer` serializes writes to the directory. The index lock is held
/// exclusively only while the in-memory index changes; files are written
/// under a downgraded read guard so searches keep running.
pub struct KnowledgeBaseIndex {
    path: PathBuf,
    index: RwLock<VectorIndex>,
    writer: Mutex<()>,
}

impl KnowledgeBaseIndex {
    pub fn new(path: PathBuf, index: VectorIndex) -> Self {
        Self {
            path,
            index: RwLock::new(index),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index(&self) -> &RwLock<VectorIndex> {
        &self.index
    }

    /// Append and persist. Must run on a blocking thread.
    fn add_and_persist(&self, chunks: &[IndexedChunk]) -> Result<usize, VectorIndexError> {
        let _writer = self.writer.blocking_lock();
        let mut index = self.index.blocking_write();
        let added = index.add(chunks.to_vec())?;

        // A failed save keeps the in-memory add
        let index = index.downgrade();
        index.save(&self.path)?;
        Ok(added)
    }

    /// Remove by prefix and persist. Must run on a blocking thread.
    ///
    /// The count is returned even when persisting fails; the chunks are gone
    /// from memory either way.
    fn remove_and_persist(&self, prefix: &str) -> (usize, Result<(), VectorIndexError>) {
        let _writer = self.writer.blocking_lock();
        let mut index = self.index.blocking_write();
        let removed = index.remove_by_prefix(prefix);
        if removed == 0 {
            return (0, Ok(()));
        }

        let index = index.downgrade();
        let persisted = if index.is_empty() {
            VectorIndex::remove_files(&self.path)
        } else {
            index.save(&self.path)
        };
        (removed, persisted)
    }
}

/// Outcome of appending chunks to every index
#[derive(Debug, Default)]
pub struct WriteReport {
    /// Chunks appended to each index
    pub chunks: usize,
    pub persisted: Vec<PathBuf>,
    pub failures: Vec<IndexFailure>,
}

impl WriteReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of a prefix deletion across every index
#[derive(Debug, Default)]
pub struct RemovalReport {
    /// Chunks removed, summed over all indexes
    pub removed: usize,
    pub failures: Vec<IndexFailure>,
}

/// Set of knowledge-base indexes sharing one embedding dimension
pub struct IndexRegistry {
    paths: Vec<PathBuf>,
    dimension: usize,
    params: IndexParams,
    indexes: RwLock<Arc<Vec<Arc<KnowledgeBaseIndex>>>>,
}

impl IndexRegistry {
    /// Open every path, loading what exists and initializing the rest empty
    ///
    /// Never fails: unreadable or stale indexes are replaced by empty ones.
    pub fn open(paths: Vec<PathBuf>, dimension: usize, params: IndexParams) -> Self {
        let indexes = Self::open_all(&paths, dimension, params);
        tracing::info!(
            "Opened {} knowledge-base index(es), {} chunks total",
            indexes.len(),
            indexes.iter().map(|(_, count)| count).sum::<usize>()
        );

        Self {
            paths,
            dimension,
            params,
            indexes: RwLock::new(Arc::new(indexes.into_iter().map(|(kb, _)| kb).collect())),
        }
    }

    fn open_all(
        paths: &[PathBuf],
        dimension: usize,
        params: IndexParams,
    ) -> Vec<(Arc<KnowledgeBaseIndex>, usize)> {
        paths
            .iter()
            .map(|path| {
                let index = open_index(path, dimension, params);
                let count = index.len();
                (Arc::new(KnowledgeBaseIndex::new(path.clone(), index)), count)
            })
            .collect()
    }

    /// Re-open every path and swap the whole set in at once
    pub async fn reload(&self) -> crate::error::Result<()> {
        let paths = self.paths.clone();
        let (dimension, params) = (self.dimension, self.params);

        let fresh = tokio::task::spawn_blocking(move || Self::open_all(&paths, dimension, params))
            .await
            .map_err(|e| anyhow::anyhow!("Index reload task failed: {}", e))?;

        let fresh: Vec<_> = fresh.into_iter().map(|(kb, _)| kb).collect();
        let count = fresh.len();
        *self.indexes.write().await = Arc::new(fresh);

        tracing::info!("Reloaded {} knowledge-base index(es)", count);
        Ok(())
    }

    /// Current set of indexes; unaffected by later reloads
    pub async fn snapshot(&self) -> Arc<Vec<Arc<KnowledgeBaseIndex>>> {
        Arc::clone(&*self.indexes.read().await)
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Whether every index holds zero chunks
    ///
    /// Never waits on a writer: an index that is locked counts as non-empty
    /// and is left to the deadline-bound search.
    pub async fn is_empty(&self) -> bool {
        self.snapshot()
            .await
            .iter()
            .all(|kb| match kb.index().try_read() {
                Ok(index) => index.is_empty(),
                Err(_) => false,
            })
    }

    /// Append the same chunks to every index and persist each one
    ///
    /// A failure on one index is reported and does not stop the others.
    pub async fn add(&self, chunks: Vec<IndexedChunk>) -> WriteReport {
        let mut report = WriteReport {
            chunks: chunks.len(),
            ..WriteReport::default()
        };
        if chunks.is_empty() {
            return report;
        }

        let snapshot = self.snapshot().await;
        let chunks = Arc::new(chunks);
        let tasks = snapshot.iter().map(|kb| {
            let kb = Arc::clone(kb);
            let chunks = Arc::clone(&chunks);
            async move {
                let path = kb.path().to_path_buf();
                let result = tokio::task::spawn_blocking(move || kb.add_and_persist(&chunks))
                    .await
                    .map_err(|e| e.to_string())
                    .and_then(|r| r.map_err(|e| e.to_string()));
                (path, result)
            }
        });

        for (path, result) in join_all(tasks).await {
            match result {
                Ok(added) => {
                    tracing::info!("Added {} chunks to knowledge base at {:?}", added, path);
                    report.persisted.push(path);
                }
                Err(reason) => {
                    tracing::warn!("Failed to add chunks to {:?}: {}", path, reason);
                    report.failures.push(IndexFailure { path, reason });
                }
            }
        }
        report
    }

    /// Delete every chunk whose source starts with `"{kb_id}:"`
    ///
    /// A blank id removes nothing. Indexes left empty have their files deleted.
    pub async fn remove_by_prefix(&self, kb_id: &str) -> RemovalReport {
        let mut report = RemovalReport::default();
        if kb_id.trim().is_empty() {
            return report;
        }

        let prefix = Arc::new(kb_prefix(kb_id));
        let snapshot = self.snapshot().await;
        let tasks = snapshot.iter().map(|kb| {
            let kb = Arc::clone(kb);
            let prefix = Arc::clone(&prefix);
            async move {
                let path = kb.path().to_path_buf();
                let task = tokio::task::spawn_blocking(move || kb.remove_and_persist(&prefix));
                let result = match task.await {
                    Ok((removed, persisted)) => (removed, persisted.map_err(|e| e.to_string())),
                    Err(e) => (0, Err(e.to_string())),
                };
                (path, result)
            }
        });

        for (path, (removed, persisted)) in join_all(tasks).await {
            if removed > 0 {
                tracing::info!("Removed {} chunks of {:?} from {:?}", removed, kb_id, path);
            }
            report.removed += removed;

            if let Err(reason) = persisted {
                tracing::warn!("Failed to persist removal of {:?} in {:?}: {}", kb_id, path, reason);
                report.failures.push(IndexFailure { path, reason });
            }
        }
        report
    }
}

/// Load the index at `path`, or fall back to an empty one
fn open_index(path: &Path, dimension: usize, params: IndexParams) -> VectorIndex {
    if !VectorIndex::exists(path) {
        if let Err(e) = std::fs::create_dir_all(path) {
            tracing::warn!("Cannot create index directory {:?}: {}", path, e);
        }
        tracing::info!("No index found in {:?}, initialized empty", path);
        return VectorIndex::new(dimension, params);
    }

    match VectorIndex::load(path, params) {
        Ok(index) if index.dimension() != dimension => {
            tracing::warn!(
                "Index at {:?} has dimension {} but the embedder produces {}; discarding it",
                path,
                index.dimension(),
                dimension
            );
            if let Err(e) = discard_directory(path) {
                tracing::warn!("Failed to clear stale index at {:?}: {}", path, e);
            }
            VectorIndex::new(dimension, params)
        }
        Ok(index) => {
            tracing::info!("Loaded index from {:?} ({} chunks)", path, index.len());
            index
        }
        Err(e) => {
            tracing::warn!("Load failed for {:?}: {}. Using empty index.", path, e);
            VectorIndex::new(dimension, params)
        }
    }
}

fn discard_directory(path: &Path) -> std::io::Result<()> {
    std::fs::remove_dir_all(path)?;
    std::fs::create_dir_all(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{INDEX_FILE, METADATA_FILE};
    use std::time::Duration;
    use tempfile::TempDir;

    fn chunk(content: &str, source: &str, vector: Vec<f32>) -> IndexedChunk {
        IndexedChunk {
            content: content.to_string(),
            source: source.to_string(),
            vector,
        }
    }

    #[test]
    fn test_open_missing_path_creates_directory_only() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("kb").join("vector_db");

        let registry = IndexRegistry::open(vec![path.clone()], 3, IndexParams::default());
        assert!(path.is_dir());
        assert!(!path.join(INDEX_FILE).exists());
        assert_eq!(registry.paths().len(), 1);
    }

    #[test]
    fn test_dimension_mismatch_discards_index() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().to_path_buf();

        let mut stale = VectorIndex::new(4, IndexParams::default());
        stale
            .add(vec![chunk("old", "kb:old.pdf", vec![0.5; 4])])
            .unwrap();
        stale.save(&path).unwrap();

        let index = open_index(&path, 3, IndexParams::default());
        assert_eq!(index.dimension(), 3);
        assert!(index.is_empty());
        assert!(!path.join(INDEX_FILE).exists());
        assert!(!path.join(METADATA_FILE).exists());
    }

    #[test]
    fn test_corrupt_index_falls_back_to_empty() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(INDEX_FILE), b"not zstd").unwrap();

        let index = open_index(temp.path(), 3, IndexParams::default());
        assert!(index.is_empty());
        assert_eq!(index.dimension(), 3);
    }

    #[tokio::test]
    async fn test_add_writes_every_index() {
        let temp = TempDir::new().unwrap();
        let paths = vec![temp.path().join("a"), temp.path().join("b")];
        let registry = IndexRegistry::open(paths.clone(), 2, IndexParams::default());

        let report = registry
            .add(vec![chunk("text", "kb1:x.pdf", vec![1.0, 0.0])])
            .await;
        assert!(report.is_complete());
        assert_eq!(report.persisted.len(), 2);

        for path in &paths {
            assert!(VectorIndex::exists(path));
        }
        assert!(!registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_add_rejects_wrong_dimension() {
        let temp = TempDir::new().unwrap();
        let registry =
            IndexRegistry::open(vec![temp.path().to_path_buf()], 2, IndexParams::default());

        let report = registry.add(vec![chunk("text", "s", vec![1.0; 5])]).await;
        assert_eq!(report.failures.len(), 1);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_by_prefix_deletes_files_when_emptied() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().to_path_buf();
        let registry = IndexRegistry::open(vec![path.clone()], 2, IndexParams::default());

        registry
            .add(vec![
                chunk("a", "A:one.pdf", vec![1.0, 0.0]),
                chunk("b", "B:two.pdf", vec![0.0, 1.0]),
            ])
            .await;

        assert_eq!(registry.remove_by_prefix("").await.removed, 0);

        let report = registry.remove_by_prefix("A").await;
        assert_eq!(report.removed, 1);
        assert!(VectorIndex::exists(&path));

        let report = registry.remove_by_prefix("B").await;
        assert_eq!(report.removed, 1);
        assert!(!VectorIndex::exists(&path));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_removal_count_survives_persist_failure() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().to_path_buf();
        let registry = IndexRegistry::open(vec![path.clone()], 2, IndexParams::default());
        registry
            .add(vec![
                chunk("a", "A:one.pdf", vec![1.0, 0.0]),
                chunk("b", "A:two.pdf", vec![0.0, 1.0]),
            ])
            .await;

        // Deleting the emptied index fails when its file is a directory
        std::fs::remove_file(path.join(INDEX_FILE)).unwrap();
        std::fs::create_dir(path.join(INDEX_FILE)).unwrap();

        let report = registry.remove_by_prefix("A").await;
        assert_eq!(report.removed, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, path);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_is_empty_does_not_wait_for_writers() {
        let temp = TempDir::new().unwrap();
        let registry = IndexRegistry::open(
            vec![temp.path().to_path_buf()],
            2,
            IndexParams::default(),
        );
        assert!(registry.is_empty().await);

        let snapshot = registry.snapshot().await;
        let guard = snapshot[0].index().write().await;
        let locked = tokio::time::timeout(Duration::from_millis(500), registry.is_empty())
            .await
            .unwrap();
        assert!(!locked);
        drop(guard);
    }

    #[tokio::test]
    async fn test_reload_keeps_old_snapshot_alive() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().to_path_buf();
        let registry = IndexRegistry::open(vec![path.clone()], 2, IndexParams::default());
        registry
            .add(vec![chunk("kept", "kb:a.pdf", vec![1.0, 0.0])])
            .await;

        let before = registry.snapshot().await;
        registry.reload().await.unwrap();
        let after = registry.snapshot().await;

        assert!(!Arc::ptr_eq(&before[0], &after[0]));
        assert_eq!(before[0].index().read().await.len(), 1);
        assert_eq!(after[0].index().read().await.len(), 1);
    }
}
