//! OpenAI-compatible chat-completions client

use super::{ChatMessage, GenerationError, Purpose, Role, TextGenerator};
use crate::config::LlmConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

/// Works against OpenAI, Groq, DeepSeek, Ollama and other servers exposing
/// `POST {base_url}/chat/completions`
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleGenerator {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    purpose_models: HashMap<String, String>,
    temperature: f32,
    timeout: Duration,
}

impl OpenAiCompatibleGenerator {
    pub fn from_config(config: &LlmConfig) -> Result<Self, GenerationError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.is_empty());
        if api_key.is_none() && config.provider != "ollama" {
            return Err(GenerationError::MissingApiKey(config.api_key_env.clone()));
        }

        let timeout = Duration::from_secs(config.request_timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::Http(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            purpose_models: config.purpose_models.clone(),
            temperature: config.temperature,
            timeout,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Model for a purpose, from `purpose_models` or the default model
    pub fn model_for(&self, purpose: Purpose) -> &str {
        self.purpose_models
            .get(purpose.tag())
            .map(String::as_str)
            .unwrap_or(&self.model)
    }
}

/// Prepend the purpose's system template unless the caller supplied one
fn with_system_prompt(messages: &[ChatMessage], purpose: Purpose) -> Vec<ChatMessage> {
    if messages.iter().any(|m| m.role == Role::System) {
        return messages.to_vec();
    }
    let mut full = Vec::with_capacity(messages.len() + 1);
    full.push(ChatMessage::system(purpose.system_prompt()));
    full.extend_from_slice(messages);
    full
}

#[async_trait]
impl TextGenerator for OpenAiCompatibleGenerator {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        purpose: Purpose,
    ) -> Result<String, GenerationError> {
        let model = self.model_for(purpose);
        let payload = json!({
            "model": model,
            "messages": with_system_prompt(messages, purpose),
            "temperature": self.temperature,
        });

        tracing::debug!("Chat completion ({}) with model {}", purpose, model);

        let mut request = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json")
            .json(&payload);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GenerationError::Timeout(self.timeout)
            } else {
                GenerationError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Http(e.to_string()))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(GenerationError::EmptyResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn config_with_key(env_var: &str) -> LlmConfig {
        std::env::set_var(env_var, "sk-test");
        let mut config = Config::default().llm;
        config.enabled = true;
        config.api_key_env = env_var.to_string();
        config.base_url = "http://localhost:8080/v1/".to_string();
        config
    }

    #[test]
    fn test_missing_api_key() {
        let mut config = Config::default().llm;
        config.enabled = true;
        config.api_key_env = "KBS_TEST_KEY_THAT_IS_NEVER_SET".to_string();

        let result = OpenAiCompatibleGenerator::from_config(&config);
        assert!(matches!(result, Err(GenerationError::MissingApiKey(_))));

        // Local servers run without a key
        config.provider = "ollama".to_string();
        assert!(OpenAiCompatibleGenerator::from_config(&config).is_ok());
    }

    #[test]
    fn test_endpoint_and_purpose_models() {
        let mut config = config_with_key("KBS_TEST_PURPOSE_MODELS_KEY");
        config
            .purpose_models
            .insert("rag_rerank".to_string(), "small-judge".to_string());

        let generator = OpenAiCompatibleGenerator::from_config(&config).unwrap();
        assert_eq!(generator.endpoint(), "http://localhost:8080/v1/chat/completions");
        assert_eq!(generator.model_for(Purpose::Rerank), "small-judge");
        assert_eq!(generator.model_for(Purpose::KnowledgeQa), "gpt-4o-mini");
    }

    #[test]
    fn test_system_prompt_is_prepended_once() {
        let messages = vec![ChatMessage::user("question")];
        let full = with_system_prompt(&messages, Purpose::JsonRepair);
        assert_eq!(full.len(), 2);
        assert_eq!(full[0].role, Role::System);
        assert_eq!(full[0].content, Purpose::JsonRepair.system_prompt());

        let again = with_system_prompt(&full, Purpose::JsonRepair);
        assert_eq!(again.len(), 2);
    }
}
