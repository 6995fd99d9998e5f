//! Text generation
//!
//! The rest of the crate talks to a `TextGenerator`; the concrete client is an
//! OpenAI-compatible chat-completions endpoint.

mod openai;
mod purpose;

pub use openai::OpenAiCompatibleGenerator;
pub use purpose::{Purpose, NO_INFORMATION_PHRASE};

use crate::config::LlmConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Text generation is disabled")]
    Disabled,

    #[error("API key environment variable {0} is not set")]
    MissingApiKey(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Generator returned no content")]
    EmptyResponse,

    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A single-round-trip chat completion
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        purpose: Purpose,
    ) -> Result<String, GenerationError>;
}

/// Stand-in used when `llm.enabled` is false
pub struct DisabledGenerator;

#[async_trait]
impl TextGenerator for DisabledGenerator {
    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _purpose: Purpose,
    ) -> Result<String, GenerationError> {
        Err(GenerationError::Disabled)
    }
}

/// Build the generator described by the `llm` config section
pub fn from_config(config: &LlmConfig) -> Result<Arc<dyn TextGenerator>, GenerationError> {
    if !config.enabled {
        tracing::info!("LLM disabled; reranking and repair fall back to local behaviour");
        return Ok(Arc::new(DisabledGenerator));
    }
    Ok(Arc::new(OpenAiCompatibleGenerator::from_config(config)?))
}

/// `complete` bounded by a request-level deadline. No retries.
pub async fn complete_with_timeout(
    generator: &dyn TextGenerator,
    messages: &[ChatMessage],
    purpose: Purpose,
    timeout: Duration,
) -> Result<String, GenerationError> {
    tokio::time::timeout(timeout, generator.complete(messages, purpose))
        .await
        .map_err(|_| GenerationError::Timeout(timeout))?
}
