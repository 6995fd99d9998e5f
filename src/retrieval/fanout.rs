//! Parallel search across every knowledge-base index

use crate::index::KnowledgeBaseIndex;
use crate::retrieval::{Hit, IndexFailure, SearchError, SearchOutcome};
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Number of neighbours requested from each index
///
/// `max(top_k, recall_min, ceil(top_k * multiplier))`
pub fn initial_k(top_k: usize, recall_min: usize, multiplier: f64) -> usize {
    let scaled = (top_k as f64 * multiplier.max(1.0)).ceil() as usize;
    top_k.max(recall_min).max(scaled)
}

/// Runs one query against every index concurrently
///
/// Each index gets its own deadline. An index that errors or misses the
/// deadline contributes no hits; only when every index fails is the search
/// an error.
pub struct FanOutSearcher {
    timeout: Duration,
}

impl FanOutSearcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn search(
        &self,
        indexes: &[Arc<KnowledgeBaseIndex>],
        query: Arc<Vec<f32>>,
        k: usize,
    ) -> Result<SearchOutcome, SearchError> {
        if indexes.is_empty() {
            return Ok(SearchOutcome::Complete(Vec::new()));
        }

        let tasks = indexes
            .iter()
            .map(|kb| self.search_one(Arc::clone(kb), Arc::clone(&query), k));

        let mut hits = Vec::new();
        let mut failures = Vec::new();
        for (path, result) in join_all(tasks).await {
            match result {
                Ok(mut index_hits) => {
                    tracing::debug!("{} hits from {:?}", index_hits.len(), path);
                    hits.append(&mut index_hits);
                }
                Err(reason) => {
                    tracing::warn!("Search skipped index {:?}: {}", path, reason);
                    failures.push(IndexFailure { path, reason });
                }
            }
        }

        if failures.len() == indexes.len() {
            return Err(SearchError::AllIndexesUnavailable {
                attempted: indexes.len(),
            });
        }

        Ok(if failures.is_empty() {
            SearchOutcome::Complete(hits)
        } else {
            SearchOutcome::Partial { hits, failures }
        })
    }

    async fn search_one(
        &self,
        kb: Arc<KnowledgeBaseIndex>,
        query: Arc<Vec<f32>>,
        k: usize,
    ) -> (PathBuf, Result<Vec<Hit>, String>) {
        let path = kb.path().to_path_buf();
        let fallback_source = path.display().to_string();

        let task = tokio::task::spawn_blocking(move || {
            let index = kb.index().blocking_read();
            index.search(&query, k).map(|results| {
                results
                    .into_iter()
                    .map(|r| {
                        let source = if r.source.trim().is_empty() {
                            fallback_source.clone()
                        } else {
                            r.source
                        };
                        Hit::new(r.content, source, r.distance)
                    })
                    .collect::<Vec<_>>()
            })
        });

        let result = match tokio::time::timeout(self.timeout, task).await {
            Err(_) => Err(format!("timed out after {:?}", self.timeout)),
            Ok(Err(join_error)) => Err(format!("search task failed: {}", join_error)),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Ok(Ok(hits))) => Ok(hits),
        };
        (path, result)
    }
}
