//! Configuration loading, validation, and management for ciq.
//!
//! Loads configuration from `~/.ciq/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.ciq/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Generation API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Generation transport settings
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Embedding client settings
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Retrieval strategies and fusion
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Conversation history compaction
    #[serde(default)]
    pub history: HistoryConfig,

    /// Prompt assembly
    #[serde(default)]
    pub prompt: PromptConfig,

    /// Query analysis
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Follow-up question generation
    #[serde(default)]
    pub followups: FollowupConfig,

    /// Session store
    #[serde(default)]
    pub sessions: SessionConfig,

    /// Pre-built corpus
    #[serde(default)]
    pub corpus: CorpusConfig,

    /// Per-owner memory files the model can read and write
    #[serde(default)]
    pub memory: MemoryToolConfig,
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("generation", &self.generation)
            .field("embedding", &self.embedding)
            .field("retrieval", &self.retrieval)
            .field("history", &self.history)
            .field("prompt", &self.prompt)
            .field("analysis", &self.analysis)
            .field("followups", &self.followups)
            .field("sessions", &self.sessions)
            .field("corpus", &self.corpus)
            .field("memory", &self.memory)
            .finish()
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_model")]
    pub model: String,

    /// Lower-cost model forced by fast mode
    #[serde(default = "default_fast_model")]
    pub fast_model: String,

    /// Model for analysis, HyDE, sub-query and follow-up calls (defaults to `fast_model`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auxiliary_model: Option<String>,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    #[serde(default = "default_fast_max_output_tokens")]
    pub fast_max_output_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Overall generation timeout
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,

    /// Extended-reasoning budget when reasoning is enabled
    #[serde(default = "default_thinking_budget")]
    pub thinking_budget_tokens: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Attach the server-side web search tool
    #[serde(default)]
    pub web_search: bool,
}

fn default_model() -> String {
    "claude-sonnet-4-6".into()
}
fn default_fast_model() -> String {
    "claude-haiku-4-5-20251001".into()
}
fn default_max_output_tokens() -> u32 {
    16000
}
fn default_fast_max_output_tokens() -> u32 {
    8000
}
fn default_temperature() -> f32 {
    0.15
}
fn default_generation_timeout() -> u64 {
    300
}
fn default_thinking_budget() -> u32 {
    8000
}

impl GenerationConfig {
    /// The model used for short auxiliary calls.
    pub fn auxiliary_model(&self) -> &str {
        self.auxiliary_model.as_deref().unwrap_or(&self.fast_model)
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            fast_model: default_fast_model(),
            auxiliary_model: None,
            max_output_tokens: default_max_output_tokens(),
            fast_max_output_tokens: default_fast_max_output_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_generation_timeout(),
            thinking_budget_tokens: default_thinking_budget(),
            base_url: None,
            web_search: false,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_embedding_url")]
    pub api_url: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,
}

fn default_embedding_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}

impl std::fmt::Debug for EmbeddingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .finish()
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: default_embedding_url(),
            model: default_embedding_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Embed the raw query
    #[serde(default = "default_true")]
    pub direct: bool,

    /// Embed a hypothetical answer (HyDE)
    #[serde(default = "default_true")]
    pub hypothetical: bool,

    /// Embed decomposed sub-questions
    #[serde(default = "default_true")]
    pub sub_query: bool,

    /// Candidates requested from each similarity search
    #[serde(default = "default_per_strategy_top_k")]
    pub per_strategy_top_k: usize,

    /// Individual timeout per strategy
    #[serde(default = "default_strategy_timeout")]
    pub strategy_timeout_ms: u64,

    /// Reciprocal rank fusion constant
    #[serde(default = "default_rrf_k")]
    pub rrf_k: u32,

    /// Fused results returned when the caller does not say
    #[serde(default = "default_result_count")]
    pub default_result_count: usize,

    #[serde(default = "default_max_sub_queries")]
    pub max_sub_queries: usize,
}

fn default_per_strategy_top_k() -> usize {
    10
}
fn default_strategy_timeout() -> u64 {
    8000
}
fn default_rrf_k() -> u32 {
    60
}
fn default_result_count() -> usize {
    12
}
fn default_max_sub_queries() -> usize {
    3
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            direct: true,
            hypothetical: true,
            sub_query: true,
            per_strategy_top_k: default_per_strategy_top_k(),
            strategy_timeout_ms: default_strategy_timeout(),
            rrf_k: default_rrf_k(),
            default_result_count: default_result_count(),
            max_sub_queries: default_max_sub_queries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_budget")]
    pub budget_tokens: usize,

    /// How many recent turns are considered at all
    #[serde(default = "default_history_turns")]
    pub max_turns: usize,

    /// Token estimator ratio
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: f32,
}

fn default_history_budget() -> usize {
    4000
}
fn default_history_turns() -> usize {
    10
}
fn default_chars_per_token() -> f32 {
    4.0
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            budget_tokens: default_history_budget(),
            max_turns: default_history_turns(),
            chars_per_token: default_chars_per_token(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Budget for history + passages + user text
    #[serde(default = "default_prompt_budget")]
    pub total_budget_tokens: usize,

    /// Extra persona instructions appended to the system text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,

    /// Allow the model to supplement sources with its own knowledge
    #[serde(default)]
    pub use_llm_knowledge: bool,
}

fn default_prompt_budget() -> usize {
    60000
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            total_budget_tokens: default_prompt_budget(),
            persona: None,
            use_llm_knowledge: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Use detected competitors as the default competitor filter
    #[serde(default = "default_true")]
    pub apply_detected_filters: bool,

    #[serde(default = "default_aux_timeout")]
    pub timeout_ms: u64,
}

fn default_aux_timeout() -> u64 {
    8000
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            apply_detected_filters: true,
            timeout_ms: default_aux_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_followup_count")]
    pub count: usize,

    #[serde(default = "default_aux_timeout")]
    pub timeout_ms: u64,
}

fn default_followup_count() -> usize {
    3
}

impl Default for FollowupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            count: default_followup_count(),
            timeout_ms: default_aux_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// "sqlite" or "memory"
    #[serde(default = "default_session_backend")]
    pub backend: String,

    /// SQLite database path (defaults to `~/.ciq/sessions.db`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Owner name used by the CLI
    #[serde(default = "default_owner")]
    pub owner: String,
}

fn default_session_backend() -> String {
    "sqlite".into()
}
fn default_owner() -> String {
    "local".into()
}

impl SessionConfig {
    pub fn database_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("sessions.db"))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: default_session_backend(),
            path: None,
            owner: default_owner(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorpusConfig {
    /// JSONL file of pre-embedded passages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryToolConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Root of the per-owner memory directories (defaults to `~/.ciq/memories`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,

    #[serde(default = "default_memory_max_files")]
    pub max_files: usize,

    /// Largest file the model may create, in characters
    #[serde(default = "default_memory_max_file_chars")]
    pub max_file_chars: usize,

    /// Generation calls per query, tool continuations included
    #[serde(default = "default_memory_max_rounds")]
    pub max_rounds: usize,
}

fn default_memory_max_files() -> usize {
    100
}
fn default_memory_max_file_chars() -> usize {
    10_000
}
fn default_memory_max_rounds() -> usize {
    5
}

impl MemoryToolConfig {
    pub fn root(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("memories"))
    }
}

impl Default for MemoryToolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            max_files: default_memory_max_files(),
            max_file_chars: default_memory_max_file_chars(),
            max_rounds: default_memory_max_rounds(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.ciq/config.toml).
    ///
    /// Environment variables override the file:
    /// - `CIQ_API_KEY`, then `ANTHROPIC_API_KEY` (generation key)
    /// - `CIQ_EMBEDDING_API_KEY`, then `OPENAI_API_KEY` (embedding key)
    /// - `CIQ_MODEL`, `CIQ_CORPUS`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through a lookup function.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if self.api_key.is_none() {
            self.api_key = var("CIQ_API_KEY").or_else(|| var("ANTHROPIC_API_KEY"));
        }
        if self.embedding.api_key.is_none() {
            self.embedding.api_key = var("CIQ_EMBEDDING_API_KEY").or_else(|| var("OPENAI_API_KEY"));
        }
        if let Some(model) = var("CIQ_MODEL") {
            self.generation.model = model;
        }
        if let Some(corpus) = var("CIQ_CORPUS") {
            self.corpus.path = Some(PathBuf::from(corpus));
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".ciq")
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(ConfigError::ValidationError(
                "generation.temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if self.retrieval.rrf_k == 0 {
            return Err(ConfigError::ValidationError(
                "retrieval.rrf_k must be > 0".into(),
            ));
        }
        if !(self.retrieval.direct || self.retrieval.hypothetical || self.retrieval.sub_query) {
            return Err(ConfigError::ValidationError(
                "at least one retrieval strategy must be enabled".into(),
            ));
        }
        if self.history.chars_per_token <= 0.0 {
            return Err(ConfigError::ValidationError(
                "history.chars_per_token must be > 0".into(),
            ));
        }
        if self.history.budget_tokens > self.prompt.total_budget_tokens {
            return Err(ConfigError::ValidationError(
                "history.budget_tokens cannot exceed prompt.total_budget_tokens".into(),
            ));
        }
        if self.memory.enabled && self.memory.max_rounds == 0 {
            return Err(ConfigError::ValidationError(
                "memory.max_rounds must be > 0 when the memory tool is enabled".into(),
            ));
        }
        if !matches!(self.sessions.backend.as_str(), "sqlite" | "memory") {
            return Err(ConfigError::ValidationError(format!(
                "unknown sessions.backend '{}' (expected sqlite or memory)",
                self.sessions.backend
            )));
        }
        Ok(())
    }

    /// Check if a generation API key is available.
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            generation: GenerationConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            history: HistoryConfig::default(),
            prompt: PromptConfig::default(),
            analysis: AnalysisConfig::default(),
            followups: FollowupConfig::default(),
            sessions: SessionConfig::default(),
            corpus: CorpusConfig::default(),
            memory: MemoryToolConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retrieval.rrf_k, 60);
        assert_eq!(config.history.budget_tokens, 4000);
        assert_eq!(config.retrieval.default_result_count, 12);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.generation.model, config.generation.model);
        assert_eq!(parsed.history.max_turns, config.history.max_turns);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let mut config = AppConfig::default();
        config.generation.temperature = 5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn all_strategies_disabled_rejected() {
        let mut config = AppConfig::default();
        config.retrieval.direct = false;
        config.retrieval.hypothetical = false;
        config.retrieval.sub_query = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn history_budget_must_fit_prompt_budget() {
        let mut config = AppConfig::default();
        config.prompt.total_budget_tokens = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn memory_tool_is_off_by_default() {
        let config: AppConfig = toml::from_str("[memory]\nenabled = true\n").unwrap();
        assert!(config.memory.enabled);
        assert_eq!(config.memory.max_files, 100);
        assert_eq!(config.memory.max_rounds, 5);
        assert!(config.memory.root().ends_with("memories"));
        assert!(!AppConfig::default().memory.enabled);
    }

    #[test]
    fn memory_tool_needs_a_round() {
        let mut config = AppConfig::default();
        config.memory.enabled = true;
        config.memory.max_rounds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_session_backend_rejected() {
        let mut config = AppConfig::default();
        config.sessions.backend = "redis".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = AppConfig::load_from(Path::new("/nonexistent/config.toml"));
        let config = result.unwrap();
        assert_eq!(config.generation.fast_model, "claude-haiku-4-5-20251001");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[retrieval]
hypothetical = false
rrf_k = 30

[history]
budget_tokens = 2000
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert!(!config.retrieval.hypothetical);
        assert!(config.retrieval.direct);
        assert_eq!(config.retrieval.rrf_k, 30);
        assert_eq!(config.history.budget_tokens, 2000);
        assert_eq!(config.history.max_turns, 10);
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("ANTHROPIC_API_KEY", "sk-ant"),
            ("OPENAI_API_KEY", "sk-oai"),
            ("CIQ_MODEL", "claude-opus-4-1"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_env(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.api_key.as_deref(), Some("sk-ant"));
        assert_eq!(config.embedding.api_key.as_deref(), Some("sk-oai"));
        assert_eq!(config.generation.model, "claude-opus-4-1");
    }

    #[test]
    fn debug_redacts_keys() {
        let mut config = AppConfig::default();
        config.api_key = Some("sk-secret".into());
        config.embedding.api_key = Some("sk-other".into());
        let dbg = format!("{config:?}");
        assert!(!dbg.contains("sk-secret"));
        assert!(!dbg.contains("sk-other"));
        assert!(dbg.contains("[REDACTED]"));
    }

    #[test]
    fn auxiliary_model_defaults_to_fast_model() {
        let mut gen_cfg = GenerationConfig::default();
        assert_eq!(gen_cfg.auxiliary_model(), gen_cfg.fast_model);
        gen_cfg.auxiliary_model = Some("claude-sonnet-4-6".into());
        assert_eq!(gen_cfg.auxiliary_model(), "claude-sonnet-4-6");
    }
}
