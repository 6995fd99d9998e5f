//! Configuration management for kbsift
//!
//! Configuration is loaded from a TOML file, then environment overrides of the
//! form `KBSIFT_SECTION__KEY=value` are applied, then the whole document is
//! validated in one pass so every problem is reported at once.

use crate::error::{KbsiftError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

mod validator;

pub use validator::ConfigValidator;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "_meta")]
    pub meta: MetaConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub indexing: IndexingConfig,
    pub llm: LlmConfig,
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub answer: AnswerConfig,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileOverrides>,
}

/// Metadata about the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
    #[serde(default = "current_timestamp")]
    pub last_modified: String,
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Knowledge-base index directories. Empty means `<data_dir>/vector_db`.
    #[serde(default)]
    pub index_paths: Vec<PathBuf>,
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub model: String,
    pub batch_size: usize,
}

/// HNSW parameters shared by every knowledge-base index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    pub hnsw_m: usize,
    pub hnsw_ef_construction: usize,
    pub hnsw_ef_search: usize,
}

/// LLM configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub enabled: bool,
    pub provider: String,
    pub base_url: String,
    pub api_key_env: String,
    pub model: String,
    pub temperature: f32,
    pub request_timeout_secs: u64,
    /// Model overrides keyed by purpose tag (e.g. `rag_rerank`, `json_fix`)
    #[serde(default)]
    pub purpose_models: HashMap<String, String>,
}

/// How the candidate pool is ordered before truncation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RerankMethod {
    /// Ask the text generator for a relevance judgment
    Llm,
    /// Keep the index distance order
    Distance,
}

impl FromStr for RerankMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "llm" => Ok(Self::Llm),
            "distance" | "none" => Ok(Self::Distance),
            other => Err(format!("unknown rerank method '{}'", other)),
        }
    }
}

/// Retrieval pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub initial_recall_multiplier: f64,
    pub initial_recall_min: usize,
    pub reranker_enabled: bool,
    pub reranker_method: RerankMethod,
    pub rerank_max_chars: usize,
    pub hierarchical_enabled: bool,
    pub hierarchy_source_k: usize,
    pub hierarchy_chunks_per_source: usize,
    /// Weight of the `ln(group_size + 1)` coverage bonus. Tunable heuristic:
    /// it is subtracted from a raw distance without any scale normalization.
    pub hierarchy_source_bonus: f32,
    pub index_timeout_ms: u64,
    pub kb_filter_multiplier: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            initial_recall_multiplier: 3.0,
            initial_recall_min: 8,
            reranker_enabled: true,
            reranker_method: RerankMethod::Llm,
            rerank_max_chars: 480,
            hierarchical_enabled: true,
            hierarchy_source_k: 4,
            hierarchy_chunks_per_source: 2,
            hierarchy_source_bonus: 0.1,
            index_timeout_ms: 2000,
            kb_filter_multiplier: 3,
        }
    }
}

/// Structured-output recovery limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub repair_max_chars: usize,
    pub error_prefix_chars: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            repair_max_chars: 6000,
            error_prefix_chars: 200,
        }
    }
}

/// Answer assembly limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerConfig {
    pub context_chars: usize,
    pub include_reference_content: bool,
    pub max_fallback_sources: usize,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            context_chars: 500,
            include_reference_content: false,
            max_fallback_sources: 5,
        }
    }
}

/// Profile-specific configuration overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reranker_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hierarchical_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(KbsiftError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| KbsiftError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides();

        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Load `path`, or fall back to defaults when it does not exist
    ///
    /// The fallback still gets environment overrides and validation.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        tracing::warn!(
            "Config file {:?} not found, using defaults. Run 'kbsift config init' to create one.",
            path
        );
        Self::defaults_with_overrides(std::env::vars())
    }

    /// Defaults with `KBSIFT_*` overrides applied, then validated
    pub fn defaults_with_overrides<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = Self::default();
        config.apply_overrides(vars);
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| KbsiftError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Load configuration with a specific profile applied
    pub fn load_with_profile(path: &Path, profile: &str) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_profile(profile)?;
        Ok(config)
    }

    /// Apply a profile's overrides to the configuration
    pub fn apply_profile(&mut self, profile: &str) -> Result<()> {
        let overrides = self
            .profiles
            .get(profile)
            .cloned()
            .ok_or_else(|| KbsiftError::Config(format!("Unknown profile: {}", profile)))?;

        if let Some(enabled) = overrides.reranker_enabled {
            self.retrieval.reranker_enabled = enabled;
        }
        if let Some(enabled) = overrides.hierarchical_enabled {
            self.retrieval.hierarchical_enabled = enabled;
        }
        if let Some(enabled) = overrides.llm_enabled {
            self.llm.enabled = enabled;
        }
        if let Some(model) = overrides.llm_model {
            self.llm.model = model;
        }
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: KBSIFT_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(std::env::vars());
    }

    /// Apply `KBSIFT_`-prefixed pairs; other keys are ignored
    pub fn apply_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if let Some(config_key) = key.strip_prefix("KBSIFT_") {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "LLM__ENABLED" => self.llm.enabled = parse_env(path, value)?,
            "LLM__MODEL" => self.llm.model = value.to_string(),
            "LLM__BASE_URL" => self.llm.base_url = value.to_string(),
            "LLM__REQUEST_TIMEOUT_SECS" => self.llm.request_timeout_secs = parse_env(path, value)?,
            "EMBEDDING__MODEL" => self.embedding.model = value.to_string(),
            "RETRIEVAL__INITIAL_RECALL_MULTIPLIER" => {
                self.retrieval.initial_recall_multiplier = parse_env(path, value)?
            }
            "RETRIEVAL__INITIAL_RECALL_MIN" => {
                self.retrieval.initial_recall_min = parse_env(path, value)?
            }
            "RETRIEVAL__RERANKER_ENABLED" => {
                self.retrieval.reranker_enabled = parse_env(path, value)?
            }
            "RETRIEVAL__RERANKER_METHOD" => {
                self.retrieval.reranker_method = parse_env(path, value)?
            }
            "RETRIEVAL__RERANK_MAX_CHARS" => {
                self.retrieval.rerank_max_chars = parse_env(path, value)?
            }
            "RETRIEVAL__HIERARCHICAL_ENABLED" => {
                self.retrieval.hierarchical_enabled = parse_env(path, value)?
            }
            "RETRIEVAL__HIERARCHY_SOURCE_K" => {
                self.retrieval.hierarchy_source_k = parse_env(path, value)?
            }
            "RETRIEVAL__HIERARCHY_CHUNKS_PER_SOURCE" => {
                self.retrieval.hierarchy_chunks_per_source = parse_env(path, value)?
            }
            "RETRIEVAL__HIERARCHY_SOURCE_BONUS" => {
                self.retrieval.hierarchy_source_bonus = parse_env(path, value)?
            }
            "RETRIEVAL__INDEX_TIMEOUT_MS" => {
                self.retrieval.index_timeout_ms = parse_env(path, value)?
            }
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Knowledge-base directories for the shared pipeline, with `~` expanded
    pub fn resolved_index_paths(&self) -> Result<Vec<PathBuf>> {
        if self.storage.index_paths.is_empty() {
            return Ok(vec![expand_path(&self.storage.data_dir)?.join("vector_db")]);
        }
        self.storage
            .index_paths
            .iter()
            .map(|p| expand_path(p))
            .collect()
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| KbsiftError::Config("Cannot determine config directory".to_string()))?;

        Ok(config_dir.join("kbsift").join("config.toml"))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            meta: MetaConfig {
                schema_version: "1.0.0".to_string(),
                created_at: current_timestamp(),
                last_modified: current_timestamp(),
            },
            storage: StorageConfig {
                data_dir: PathBuf::from("~/.kbsift"),
                index_paths: Vec::new(),
            },
            embedding: EmbeddingConfig {
                model: "all-MiniLM-L6-v2".to_string(),
                batch_size: 32,
            },
            indexing: IndexingConfig {
                hnsw_m: 16,
                hnsw_ef_construction: 200,
                hnsw_ef_search: 64,
            },
            llm: LlmConfig {
                enabled: false,
                provider: "openai".to_string(),
                base_url: "https://api.openai.com/v1".to_string(),
                api_key_env: "OPENAI_API_KEY".to_string(),
                model: "gpt-4o-mini".to_string(),
                temperature: 0.1,
                request_timeout_secs: 60,
                purpose_models: HashMap::new(),
            },
            retrieval: RetrievalConfig::default(),
            recovery: RecoveryConfig::default(),
            answer: AnswerConfig::default(),
            profiles: HashMap::new(),
        }
    }
}

fn parse_env<T: FromStr>(path: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| KbsiftError::InvalidConfigValue {
        path: path.to_string(),
        message: format!("Cannot parse '{}'", value),
    })
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &Path) -> Result<PathBuf> {
    let path_str = path
        .to_str()
        .ok_or_else(|| KbsiftError::Config("Invalid path encoding".to_string()))?;

    if let Some(stripped) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| KbsiftError::Config("Cannot determine home directory".to_string()))?;
        Ok(home.join(stripped))
    } else {
        Ok(path.to_path_buf())
    }
}
