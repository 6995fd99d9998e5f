//! End-to-end retrieval: fan-out, refinement, reranking

use crate::answer::{Answer, AnswerAssembler};
use crate::config::{Config, RetrievalConfig};
use crate::embedding::{EmbeddingError, EmbeddingProvider, IndexParams, IndexedChunk};
use crate::error::Result;
use crate::generation::TextGenerator;
use crate::index::{IndexRegistry, RemovalReport, WriteReport};
use crate::recovery::JsonRecovery;
use crate::retrieval::{
    deduplicate_hits, initial_k, kb_prefix, select_hierarchical, sort_by_distance, Chunk,
    FanOutSearcher, HierarchyParams, Hit, Reranker, RerankerSettings, SearchError, Selection,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Retrieval knobs outside the reranker
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub recall_multiplier: f64,
    pub recall_min: usize,
    pub hierarchical_enabled: bool,
    pub hierarchy: HierarchyParams,
    pub kb_filter_multiplier: usize,
    pub index_timeout: Duration,
}

impl From<&RetrievalConfig> for PipelineSettings {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            recall_multiplier: config.initial_recall_multiplier,
            recall_min: config.initial_recall_min,
            hierarchical_enabled: config.hierarchical_enabled,
            hierarchy: HierarchyParams::from(config),
            kb_filter_multiplier: config.kb_filter_multiplier.max(1),
            index_timeout: Duration::from_millis(config.index_timeout_ms),
        }
    }
}

pub struct RetrievalPipeline {
    settings: PipelineSettings,
    embedder: Arc<dyn EmbeddingProvider>,
    registry: IndexRegistry,
    fanout: FanOutSearcher,
    reranker: Reranker,
    answers: AnswerAssembler,
}

impl RetrievalPipeline {
    pub fn new(
        settings: PipelineSettings,
        embedder: Arc<dyn EmbeddingProvider>,
        registry: IndexRegistry,
        reranker: Reranker,
        answers: AnswerAssembler,
    ) -> Self {
        let fanout = FanOutSearcher::new(settings.index_timeout);
        Self {
            settings,
            embedder,
            registry,
            fanout,
            reranker,
            answers,
        }
    }

    /// Wire a pipeline over `paths` from configuration
    ///
    /// Opens (and possibly resets) the index directories, so call it off the
    /// async executor.
    pub fn from_config(
        config: &Config,
        paths: Vec<PathBuf>,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn TextGenerator>,
    ) -> Result<Self> {
        let llm_timeout = Duration::from_secs(config.llm.request_timeout_secs);

        let registry = IndexRegistry::open(
            paths,
            embedder.dimension(),
            IndexParams::from(&config.indexing),
        );
        let recovery = JsonRecovery::new(&config.recovery)?
            .with_generator(Arc::clone(&generator), llm_timeout);
        let reranker = Reranker::new(
            RerankerSettings::from(config),
            Arc::clone(&generator),
            Arc::new(recovery),
        )?;
        let answers = AnswerAssembler::new(config.answer.clone(), generator, llm_timeout);

        Ok(Self::new(
            PipelineSettings::from(&config.retrieval),
            embedder,
            registry,
            reranker,
            answers,
        ))
    }

    pub fn registry(&self) -> &IndexRegistry {
        &self.registry
    }

    /// Top hits for `query`, optionally restricted to one knowledge base
    ///
    /// With a `kb_id`, `top_k * kb_filter_multiplier` hits are retrieved and
    /// those outside `"{kb_id}:"` dropped before truncating to `top_k`.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        kb_id: Option<&str>,
    ) -> std::result::Result<Vec<Hit>, SearchError> {
        let Some(kb_id) = kb_id.map(str::trim).filter(|id| !id.is_empty()) else {
            return self.search_all(query, top_k).await;
        };

        let fetch = top_k.saturating_mul(self.settings.kb_filter_multiplier);
        let prefix = kb_prefix(kb_id);
        let mut hits = self.search_all(query, fetch).await?;
        hits.retain(|hit| hit.source.starts_with(&prefix));
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Top hits for `query` across every knowledge base
    pub async fn search_all(
        &self,
        query: &str,
        top_k: usize,
    ) -> std::result::Result<Vec<Hit>, SearchError> {
        if query.trim().is_empty() {
            return Err(SearchError::InvalidQuery(
                "Query text cannot be empty".to_string(),
            ));
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let request_id = Uuid::new_v4();
        if self.registry.is_empty().await {
            tracing::info!(%request_id, "Knowledge bases are empty, returning no hits");
            return Ok(Vec::new());
        }

        let text = query.to_string();
        let query_vector = self
            .embed_blocking(move |embedder| embedder.embed(&text))
            .await?;
        let k = initial_k(top_k, self.settings.recall_min, self.settings.recall_multiplier);

        let indexes = self.registry.snapshot().await;
        let outcome = self
            .fanout
            .search(&indexes, Arc::new(query_vector), k)
            .await?;
        if outcome.is_partial() {
            tracing::warn!(
                %request_id,
                "{} of {} indexes did not answer",
                outcome.failures().len(),
                indexes.len()
            );
        }

        let raw = outcome.into_hits();
        if raw.is_empty() {
            tracing::info!(%request_id, "No matches found for query");
            return Ok(Vec::new());
        }

        let deduped = deduplicate_hits(raw);
        let candidates = self.refine(deduped, top_k);
        let candidate_count = candidates.len();

        let ranked = self.reranker.rerank(query, candidates, top_k).await;
        let mut results = deduplicate_hits(ranked.into_hits());
        results.truncate(top_k);

        tracing::info!(
            %request_id,
            "Searched {} knowledge base(s) (initial_k={}, candidates={}, final={})",
            indexes.len(),
            k,
            candidate_count,
            results.len()
        );
        Ok(results)
    }

    /// Deduplicated hits in distance order, narrowed per source when there
    /// are more than `top_k`
    fn refine(&self, deduped: Vec<Hit>, top_k: usize) -> Vec<Hit> {
        if !self.settings.hierarchical_enabled || deduped.len() <= top_k {
            let mut candidates = deduped;
            sort_by_distance(&mut candidates);
            return candidates;
        }

        let hierarchy = &self.settings.hierarchy;
        let hierarchical_k = top_k.max(hierarchy.source_k * hierarchy.chunks_per_source);
        let selection = select_hierarchical(deduped, hierarchical_k, hierarchy);
        if let Selection::Starved(_) = selection {
            tracing::warn!("Hierarchical selection starved; using deduplicated hits");
        }

        let mut candidates = deduplicate_hits(selection.into_hits());
        sort_by_distance(&mut candidates);
        candidates
    }

    /// Embed and append chunks to every knowledge base
    ///
    /// Chunks that already carry an embedding are stored as given. Blank
    /// chunks are skipped.
    pub async fn add_chunks(
        &self,
        chunks: Vec<Chunk>,
    ) -> std::result::Result<WriteReport, EmbeddingError> {
        let (chunks, blank): (Vec<Chunk>, Vec<Chunk>) = chunks
            .into_iter()
            .partition(|c| !c.content.trim().is_empty());
        if !blank.is_empty() {
            tracing::warn!("Skipping {} blank chunk(s)", blank.len());
        }

        let missing: Vec<String> = chunks
            .iter()
            .filter(|c| c.embedding.is_none())
            .map(|c| c.content.clone())
            .collect();
        let fresh = if missing.is_empty() {
            Vec::new()
        } else {
            self.embed_blocking(move |embedder| embedder.embed_batch(&missing))
                .await?
        };
        let mut fresh = fresh.into_iter();

        let mut indexed = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let vector = match chunk.embedding {
                Some(vector) => vector,
                None => fresh.next().ok_or_else(|| {
                    EmbeddingError::GenerationError("Embedding batch came back short".to_string())
                })?,
            };
            indexed.push(IndexedChunk {
                content: chunk.content,
                source: chunk.source,
                vector,
            });
        }

        Ok(self.registry.add(indexed).await)
    }

    /// Run model inference on the blocking pool
    async fn embed_blocking<T, F>(&self, job: F) -> std::result::Result<T, EmbeddingError>
    where
        F: FnOnce(&dyn EmbeddingProvider) -> std::result::Result<T, EmbeddingError>
            + Send
            + 'static,
        T: Send + 'static,
    {
        let embedder = Arc::clone(&self.embedder);
        tokio::task::spawn_blocking(move || job(embedder.as_ref()))
            .await
            .map_err(|e| EmbeddingError::GenerationError(format!("Embedding task failed: {}", e)))?
    }

    /// Remove every chunk tagged with `kb_id` from every index
    pub async fn delete_knowledge_base(&self, kb_id: &str) -> RemovalReport {
        let report = self.registry.remove_by_prefix(kb_id).await;
        tracing::info!("Deleted {} chunk(s) of knowledge base {:?}", report.removed, kb_id);
        report
    }

    /// Re-open every index from disk
    pub async fn reload(&self) -> Result<()> {
        self.registry.reload().await
    }

    /// Retrieve for `question` and answer with numbered references
    pub async fn answer_question(
        &self,
        question: &str,
        top_k: usize,
        kb_id: Option<&str>,
    ) -> Result<Answer> {
        let hits = self.search(question, top_k, kb_id).await?;
        Ok(self.answers.assemble(question, &hits).await?)
    }
}
