//! Shared and per-caller pipelines

use crate::config::{expand_path, Config};
use crate::embedding::EmbeddingProvider;
use crate::error::{KbsiftError, Result};
use crate::generation::TextGenerator;
use crate::retrieval::RetrievalPipeline;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Owns the default pipeline and lazily builds one per caller
///
/// Caller pipelines live under `<data_dir>/callers/<id>/vector_db` and share
/// the embedder and generator with the default one.
pub struct PipelineFactory {
    config: Arc<Config>,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn TextGenerator>,
    default: Arc<RetrievalPipeline>,
    callers: Mutex<HashMap<String, Arc<RetrievalPipeline>>>,
}

impl PipelineFactory {
    pub async fn new(
        config: Config,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn TextGenerator>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let paths = config.resolved_index_paths()?;
        let default = build_pipeline(
            Arc::clone(&config),
            paths,
            Arc::clone(&embedder),
            Arc::clone(&generator),
        )
        .await?;

        Ok(Self {
            config,
            embedder,
            generator,
            default,
            callers: Mutex::new(HashMap::new()),
        })
    }

    pub fn default_pipeline(&self) -> Arc<RetrievalPipeline> {
        Arc::clone(&self.default)
    }

    /// Pipeline for `caller`, or the default one when `None`
    pub async fn get(&self, caller: Option<&str>) -> Result<Arc<RetrievalPipeline>> {
        let Some(caller) = caller else {
            return Ok(self.default_pipeline());
        };
        let path = self.caller_index_path(caller)?;

        // Held across the build so concurrent first requests share one pipeline
        let mut callers = self.callers.lock().await;
        if let Some(pipeline) = callers.get(caller) {
            return Ok(Arc::clone(pipeline));
        }

        tracing::info!("Creating pipeline for caller {:?} at {:?}", caller, path);
        let pipeline = build_pipeline(
            Arc::clone(&self.config),
            vec![path],
            Arc::clone(&self.embedder),
            Arc::clone(&self.generator),
        )
        .await?;
        callers.insert(caller.to_string(), Arc::clone(&pipeline));
        Ok(pipeline)
    }

    /// Drop a caller's pipeline; its files stay on disk
    pub async fn evict(&self, caller: &str) -> bool {
        self.callers.lock().await.remove(caller).is_some()
    }

    /// Reload the default pipeline and every live caller pipeline
    pub async fn reload_all(&self) -> Result<()> {
        self.default.reload().await?;
        let callers: Vec<_> = self.callers.lock().await.values().cloned().collect();
        for pipeline in callers {
            pipeline.reload().await?;
        }
        Ok(())
    }

    /// Index directory for a caller: `<data_dir>/callers/<id>/vector_db`
    pub fn caller_index_path(&self, caller: &str) -> Result<PathBuf> {
        validate_caller(caller)?;
        Ok(expand_path(&self.config.storage.data_dir)?
            .join("callers")
            .join(caller)
            .join("vector_db"))
    }
}

async fn build_pipeline(
    config: Arc<Config>,
    paths: Vec<PathBuf>,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn TextGenerator>,
) -> Result<Arc<RetrievalPipeline>> {
    let pipeline = tokio::task::spawn_blocking(move || {
        RetrievalPipeline::from_config(&config, paths, embedder, generator)
    })
    .await
    .map_err(|e| anyhow::anyhow!("Pipeline construction task failed: {}", e))??;
    Ok(Arc::new(pipeline))
}

/// Caller ids become a single directory name
fn validate_caller(caller: &str) -> Result<()> {
    let valid = !caller.is_empty()
        && caller != "."
        && caller != ".."
        && caller
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(KbsiftError::InvalidCaller(caller.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingError;
    use crate::generation::DisabledGenerator;
    use tempfile::TempDir;

    struct FlatEmbedder;

    impl EmbeddingProvider for FlatEmbedder {
        fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
            Ok(vec![1.0, 0.0])
        }

        fn embed_batch(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }

        fn dimension(&self) -> usize {
            2
        }

        fn model_name(&self) -> &str {
            "flat"
        }
    }

    async fn factory(temp: &TempDir) -> PipelineFactory {
        let mut config = Config::default();
        config.storage.data_dir = temp.path().to_path_buf();
        PipelineFactory::new(config, Arc::new(FlatEmbedder), Arc::new(DisabledGenerator))
            .await
            .unwrap()
    }

    #[test]
    fn test_validate_caller() {
        assert!(validate_caller("user-42").is_ok());
        assert!(validate_caller("team_a.v2").is_ok());
        assert!(validate_caller("").is_err());
        assert!(validate_caller("..").is_err());
        assert!(validate_caller("a/b").is_err());
        assert!(validate_caller("a\\b").is_err());
    }

    #[tokio::test]
    async fn test_default_pipeline_uses_data_dir() {
        let temp = TempDir::new().unwrap();
        let factory = factory(&temp).await;

        let pipeline = factory.get(None).await.unwrap();
        assert_eq!(pipeline.registry().paths(), &[temp.path().join("vector_db")]);
        assert!(temp.path().join("vector_db").is_dir());
    }

    #[tokio::test]
    async fn test_caller_pipelines_are_cached_and_evictable() {
        let temp = TempDir::new().unwrap();
        let factory = factory(&temp).await;

        let first = factory.get(Some("alice")).await.unwrap();
        let again = factory.get(Some("alice")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(temp.path().join("callers/alice/vector_db").is_dir());

        assert!(factory.evict("alice").await);
        assert!(!factory.evict("alice").await);

        let rebuilt = factory.get(Some("alice")).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &rebuilt));

        assert!(matches!(
            factory.get(Some("../escape")).await,
            Err(KbsiftError::InvalidCaller(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_all() {
        let temp = TempDir::new().unwrap();
        let factory = factory(&temp).await;
        factory.get(Some("bob")).await.unwrap();
        factory.reload_all().await.unwrap();
    }
}
