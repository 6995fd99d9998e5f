//! Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use kbsift::config::Config;
use kbsift::embedding::{
    EmbeddingError, EmbeddingProvider, IndexParams, IndexedChunk, VectorIndex,
};
use kbsift::generation::{ChatMessage, GenerationError, Purpose, TextGenerator};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread::ThreadId;

const KEYWORDS: [&str; 3] = ["photosynth", "mitochond", "chlorophyll"];

/// Deterministic embedder: one axis per keyword plus a constant bias axis
pub struct KeywordEmbedder;

impl KeywordEmbedder {
    pub fn vector(text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let mut vector: Vec<f32> = KEYWORDS
            .iter()
            .map(|k| if lower.contains(k) { 1.0 } else { 0.0 })
            .collect();
        vector.push(0.1);
        vector
    }
}

impl EmbeddingProvider for KeywordEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(Self::vector(text))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }

    fn dimension(&self) -> usize {
        KEYWORDS.len() + 1
    }

    fn model_name(&self) -> &str {
        "keyword-test"
    }
}

/// Replies with a fixed text per purpose and records every call
pub struct ScriptedGenerator {
    replies: Vec<(Purpose, Result<String, ()>)>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<(Purpose, String)>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            replies: Vec::new(),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(mut self, purpose: Purpose, text: &str) -> Self {
        self.replies.push((purpose, Ok(text.to_string())));
        self
    }

    pub fn fail(mut self, purpose: Purpose) -> Self {
        self.replies.push((purpose, Err(())));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self, purpose: Purpose) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| *p == purpose)
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        purpose: Purpose,
    ) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.prompts.lock().unwrap().push((purpose, prompt));

        match self.replies.iter().find(|(p, _)| *p == purpose) {
            Some((_, Ok(text))) => Ok(text.clone()),
            Some((_, Err(()))) => Err(GenerationError::Http("connection refused".to_string())),
            None => Err(GenerationError::Disabled),
        }
    }
}

/// Write a persisted index at `dir` holding `(content, source)` pairs
pub fn seed_index(dir: &Path, chunks: &[(&str, &str)]) {
    let mut index = VectorIndex::new(KeywordEmbedder.dimension(), IndexParams::default());
    index
        .add(
            chunks
                .iter()
                .map(|(content, source)| IndexedChunk {
                    content: content.to_string(),
                    source: source.to_string(),
                    vector: KeywordEmbedder::vector(content),
                })
                .collect(),
        )
        .unwrap();
    index.save(dir).unwrap();
}

/// Write a persisted index at `dir` with explicit vectors
pub fn seed_vectors(dir: &Path, chunks: &[(&str, &str, Vec<f32>)]) {
    let mut index = VectorIndex::new(KeywordEmbedder.dimension(), IndexParams::default());
    index
        .add(
            chunks
                .iter()
                .map(|(content, source, vector)| IndexedChunk {
                    content: content.to_string(),
                    source: source.to_string(),
                    vector: vector.clone(),
                })
                .collect(),
        )
        .unwrap();
    index.save(dir).unwrap();
}

/// Keyword embedder that records the threads it ran on
pub struct ThreadRecordingEmbedder {
    threads: Mutex<Vec<ThreadId>>,
}

impl ThreadRecordingEmbedder {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn threads(&self) -> Vec<ThreadId> {
        self.threads.lock().unwrap().clone()
    }

    fn record(&self) {
        self.threads.lock().unwrap().push(std::thread::current().id());
    }
}

impl EmbeddingProvider for ThreadRecordingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.record();
        KeywordEmbedder.embed(text)
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.record();
        KeywordEmbedder.embed_batch(texts)
    }

    fn dimension(&self) -> usize {
        KeywordEmbedder.dimension()
    }

    fn model_name(&self) -> &str {
        "thread-recording"
    }
}

/// Configuration rooted at `data_dir` searching `index_paths`
pub fn config_for(data_dir: &Path, index_paths: Vec<PathBuf>) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = data_dir.to_path_buf();
    config.storage.index_paths = index_paths;
    config.llm.enabled = true;
    config.llm.request_timeout_secs = 5;
    config
}
