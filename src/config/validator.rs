use crate::config::Config;
use crate::error::{KbsiftError, Result, ValidationError};

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_storage(config, &mut errors);
        Self::validate_embedding(config, &mut errors);
        Self::validate_indexing(config, &mut errors);
        Self::validate_llm(config, &mut errors);
        Self::validate_retrieval(config, &mut errors);
        Self::validate_recovery(config, &mut errors);
        Self::validate_answer(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(KbsiftError::ConfigValidation { errors })
        }
    }

    fn validate_schema_version(config: &Config, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != "1.0.0" {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_storage(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.storage.data_dir.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.data_dir",
                "Data directory cannot be empty",
            ));
        }

        for (i, path) in config.storage.index_paths.iter().enumerate() {
            if path.as_os_str().is_empty() {
                errors.push(ValidationError::new(
                    format!("storage.index_paths[{}]", i),
                    "Index path cannot be empty",
                ));
            }
        }
    }

    fn validate_embedding(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.embedding.batch_size == 0 {
            errors.push(ValidationError::new(
                "embedding.batch_size",
                "Batch size must be greater than 0",
            ));
        }

        if config.embedding.model.is_empty() {
            errors.push(ValidationError::new(
                "embedding.model",
                "Model name cannot be empty",
            ));
        }
    }

    fn validate_indexing(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.indexing.hnsw_ef_construction == 0 {
            errors.push(ValidationError::new(
                "indexing.hnsw_ef_construction",
                "HNSW ef_construction must be greater than 0",
            ));
        }

        if config.indexing.hnsw_ef_search == 0 {
            errors.push(ValidationError::new(
                "indexing.hnsw_ef_search",
                "HNSW ef_search must be greater than 0",
            ));
        }

        if config.indexing.hnsw_m == 0 {
            errors.push(ValidationError::new(
                "indexing.hnsw_m",
                "HNSW M must be greater than 0",
            ));
        }
    }

    fn validate_llm(config: &Config, errors: &mut Vec<ValidationError>) {
        let provider = &config.llm.provider;
        let valid_providers = ["openai", "groq", "deepseek", "ollama", "custom"];
        if !valid_providers.contains(&provider.as_str()) {
            errors.push(ValidationError::new(
                "llm.provider",
                format!(
                    "Provider must be one of {:?}, got '{}'",
                    valid_providers, provider
                ),
            ));
        }

        // Local providers run without a key
        if config.llm.enabled && provider != "ollama" {
            let env_var = &config.llm.api_key_env;
            match std::env::var(env_var) {
                Ok(key) if key.is_empty() => errors.push(ValidationError::new(
                    "llm.api_key_env",
                    format!("Environment variable {} is empty", env_var),
                )),
                Ok(_) => {}
                Err(_) => errors.push(ValidationError::new(
                    "llm.api_key_env",
                    format!("Environment variable {} is not set", env_var),
                )),
            }
        }

        if config.llm.base_url.trim().is_empty() {
            errors.push(ValidationError::new(
                "llm.base_url",
                "Base URL cannot be empty",
            ));
        }

        let temp = config.llm.temperature;
        if !(0.0..=2.0).contains(&temp) {
            errors.push(ValidationError::new(
                "llm.temperature",
                format!("Temperature must be between 0.0 and 2.0, got {}", temp),
            ));
        }

        if config.llm.request_timeout_secs == 0 {
            errors.push(ValidationError::new(
                "llm.request_timeout_secs",
                "Request timeout must be greater than 0",
            ));
        }
    }

    fn validate_retrieval(config: &Config, errors: &mut Vec<ValidationError>) {
        let retrieval = &config.retrieval;

        if !(retrieval.initial_recall_multiplier >= 1.0) {
            errors.push(ValidationError::new(
                "retrieval.initial_recall_multiplier",
                format!(
                    "Recall multiplier must be at least 1.0, got {}",
                    retrieval.initial_recall_multiplier
                ),
            ));
        }

        if retrieval.initial_recall_min < 4 {
            errors.push(ValidationError::new(
                "retrieval.initial_recall_min",
                format!(
                    "Recall minimum must be at least 4, got {}",
                    retrieval.initial_recall_min
                ),
            ));
        }

        if retrieval.rerank_max_chars < 120 {
            errors.push(ValidationError::new(
                "retrieval.rerank_max_chars",
                format!(
                    "Rerank document cap must be at least 120 characters, got {}",
                    retrieval.rerank_max_chars
                ),
            ));
        }

        if retrieval.hierarchy_source_k == 0 {
            errors.push(ValidationError::new(
                "retrieval.hierarchy_source_k",
                "Hierarchy source count must be greater than 0",
            ));
        }

        if retrieval.hierarchy_chunks_per_source == 0 {
            errors.push(ValidationError::new(
                "retrieval.hierarchy_chunks_per_source",
                "Chunks per source must be greater than 0",
            ));
        }

        if !retrieval.hierarchy_source_bonus.is_finite() {
            errors.push(ValidationError::new(
                "retrieval.hierarchy_source_bonus",
                "Source bonus must be a finite number",
            ));
        }

        if retrieval.index_timeout_ms == 0 {
            errors.push(ValidationError::new(
                "retrieval.index_timeout_ms",
                "Per-index timeout must be greater than 0",
            ));
        }

        if retrieval.kb_filter_multiplier == 0 {
            errors.push(ValidationError::new(
                "retrieval.kb_filter_multiplier",
                "Knowledge-base filter multiplier must be greater than 0",
            ));
        }
    }

    fn validate_recovery(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.recovery.repair_max_chars == 0 {
            errors.push(ValidationError::new(
                "recovery.repair_max_chars",
                "Repair budget must be greater than 0",
            ));
        }
    }

    fn validate_answer(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.answer.context_chars == 0 {
            errors.push(ValidationError::new(
                "answer.context_chars",
                "Context budget must be greater than 0",
            ));
        }
    }
}
