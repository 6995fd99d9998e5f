//! Writing, deleting and reopening knowledge bases on disk

mod common;

use common::{config_for, seed_index, KeywordEmbedder, ScriptedGenerator};
use kbsift::config::RerankMethod;
use kbsift::embedding::{IndexParams, IndexedChunk, VectorIndex, INDEX_FILE, METADATA_FILE};
use kbsift::retrieval::{tag_source, Chunk, PipelineFactory, RetrievalPipeline};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

fn pipeline(temp: &TempDir, paths: Vec<PathBuf>) -> RetrievalPipeline {
    let mut config = config_for(temp.path(), paths.clone());
    config.retrieval.reranker_method = RerankMethod::Distance;
    RetrievalPipeline::from_config(
        &config,
        paths,
        Arc::new(KeywordEmbedder),
        Arc::new(ScriptedGenerator::new()),
    )
    .unwrap()
}

#[tokio::test]
async fn test_added_chunks_are_persisted_to_every_index() {
    let temp = TempDir::new().unwrap();
    let paths = vec![temp.path().join("primary"), temp.path().join("mirror")];
    let pipeline = pipeline(&temp, paths.clone());

    let report = pipeline
        .add_chunks(vec![
            Chunk::new("Photosynthesis happens in chloroplasts.", tag_source("bio", "leaf.pdf")),
            Chunk::new("   ", tag_source("bio", "blank.pdf")),
            Chunk::new("Mitochondria respire.", tag_source("cell", "cell.pdf")),
        ])
        .await
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.chunks, 2);
    assert_eq!(report.persisted.len(), 2);

    for path in &paths {
        assert!(path.join(INDEX_FILE).exists());
        assert!(path.join(METADATA_FILE).exists());
        let index = VectorIndex::load(path, IndexParams::default()).unwrap();
        assert_eq!(index.len(), 2);
    }

    // Reopening sees the same data
    let reopened = self::pipeline(&temp, paths);
    let hits = reopened.search("photosynthesis", 1, None).await.unwrap();
    assert_eq!(hits[0].source, "bio:leaf.pdf");
}

#[tokio::test]
async fn test_deleting_a_knowledge_base_leaves_others() {
    let temp = TempDir::new().unwrap();
    let shared = temp.path().join("shared");
    seed_index(
        &shared,
        &[
            ("Photosynthesis in leaves.", "bio:leaf.pdf"),
            ("Chlorophyll is green.", "bio:pigment.pdf"),
            ("Mitochondria respire.", "biology:cell.pdf"),
        ],
    );
    let other = temp.path().join("other");
    seed_index(&other, &[("Photosynthesis, revisited.", "bio:review.pdf")]);

    let pipeline = pipeline(&temp, vec![shared.clone(), other.clone()]);
    let report = pipeline.delete_knowledge_base("bio").await;

    assert!(report.failures.is_empty());
    assert_eq!(report.removed, 3);

    let hits = pipeline.search("photosynthesis", 5, None).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].source, "biology:cell.pdf");

    // The removal was written back
    let reloaded = VectorIndex::load(&shared, IndexParams::default()).unwrap();
    assert_eq!(reloaded.len(), 1);
    assert!(!VectorIndex::exists(&other));
    assert!(other.is_dir());

    // Blank ids never match everything
    assert_eq!(pipeline.delete_knowledge_base("  ").await.removed, 0);
}

#[tokio::test]
async fn test_dimension_mismatch_resets_the_index() {
    let temp = TempDir::new().unwrap();
    let stale = temp.path().join("stale");

    let mut index = VectorIndex::new(2, IndexParams::default());
    index
        .add(vec![IndexedChunk {
            content: "Photosynthesis from an older model".to_string(),
            source: "bio:old.pdf".to_string(),
            vector: vec![0.5, 0.5],
        }])
        .unwrap();
    index.save(&stale).unwrap();

    let pipeline = pipeline(&temp, vec![stale.clone()]);

    assert!(stale.is_dir());
    assert!(!stale.join(INDEX_FILE).exists());
    assert!(pipeline.registry().is_empty().await);
    assert!(pipeline.search("photosynthesis", 3, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reload_picks_up_external_writes() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("kb");
    let pipeline = pipeline(&temp, vec![path.clone()]);
    assert!(pipeline.registry().is_empty().await);

    seed_index(&path, &[("Chlorophyll absorbs light.", "plant:pigment.pdf")]);
    pipeline.reload().await.unwrap();

    let hits = pipeline.search("chlorophyll", 1, None).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].source, "plant:pigment.pdf");
}

#[tokio::test]
async fn test_caller_pipelines_are_isolated() {
    let temp = TempDir::new().unwrap();
    let mut config = config_for(temp.path(), Vec::new());
    config.retrieval.reranker_method = RerankMethod::Distance;

    let factory = PipelineFactory::new(
        config,
        Arc::new(KeywordEmbedder),
        Arc::new(ScriptedGenerator::new()),
    )
    .await
    .unwrap();

    let alice = factory.get(Some("alice")).await.unwrap();
    alice
        .add_chunks(vec![Chunk::new("Mitochondria respire.", "notes:cell.txt")])
        .await
        .unwrap();

    assert!(temp
        .path()
        .join("callers/alice/vector_db")
        .join(INDEX_FILE)
        .exists());

    let shared = factory.get(None).await.unwrap();
    assert!(shared.search("mitochondria", 3, None).await.unwrap().is_empty());

    let bob = factory.get(Some("bob")).await.unwrap();
    assert!(bob.search("mitochondria", 3, None).await.unwrap().is_empty());

    let hits = alice.search("mitochondria", 3, None).await.unwrap();
    assert_eq!(hits.len(), 1);
}
