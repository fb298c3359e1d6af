//! IIRA configuration loader.
//!
//! TOML file, then `.env` / process environment overrides, then validation.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IiraConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector_index: VectorIndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_database_path() -> PathBuf {
    default_data_dir().join("iira.db")
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub plan_model: String,
    #[serde(default = "default_model")]
    pub params_model: String,
    #[serde(default = "default_model")]
    pub hyde_model: String,
    #[serde(default = "default_llm_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            plan_model: default_model(),
            params_model: default_model(),
            hyde_model: default_model(),
            timeout_seconds: default_llm_timeout_seconds(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl LlmConfig {
    pub fn retry_policy(&self) -> iira_llm::RetryPolicy {
        iira_llm::RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "llama3:latest".to_string()
}

fn default_llm_timeout_seconds() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
        }
    }
}

fn default_embedding_model() -> String {
    "all-minilm".to_string()
}

fn default_embedding_dimension() -> usize {
    384
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    #[default]
    Qdrant,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VectorIndexConfig {
    #[serde(default)]
    pub backend: VectorBackend,
    #[serde(default = "default_qdrant_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_procedure_collection")]
    pub procedure_collection: String,
    #[serde(default = "default_script_collection")]
    pub script_collection: String,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            backend: VectorBackend::default(),
            url: default_qdrant_url(),
            api_key: None,
            procedure_collection: default_procedure_collection(),
            script_collection: default_script_collection(),
        }
    }
}

fn default_qdrant_url() -> String {
    "http://localhost:6334".to_string()
}

fn default_procedure_collection() -> String {
    "sop_documents".to_string()
}

fn default_script_collection() -> String {
    "script_index".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_fetch_k")]
    pub fetch_k: usize,
    #[serde(default = "default_initial_threshold")]
    pub initial_threshold: f32,
    #[serde(default = "default_hyde_threshold")]
    pub hyde_threshold: f32,
    /// Minimum description similarity for semantic script matching.
    #[serde(default = "default_script_match_threshold")]
    pub script_match_threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            fetch_k: default_fetch_k(),
            initial_threshold: default_initial_threshold(),
            hyde_threshold: default_hyde_threshold(),
            script_match_threshold: default_script_match_threshold(),
        }
    }
}

fn default_top_k() -> usize {
    3
}

fn default_fetch_k() -> usize {
    10
}

fn default_initial_threshold() -> f32 {
    0.55
}

fn default_hyde_threshold() -> f32 {
    0.50
}

fn default_script_match_threshold() -> f32 {
    0.5
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackConfig {
    /// Net vote count a candidate must exceed before it is boosted or penalized.
    #[serde(default = "default_confirmation_margin")]
    pub confirmation_margin: i64,
    #[serde(default = "default_boost")]
    pub boost: f32,
    #[serde(default = "default_penalty")]
    pub penalty: f32,
    #[serde(default = "default_feedback_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "default_warm_confidence_threshold")]
    pub warm_confidence_threshold: i64,
    #[serde(default = "default_warm_ttl_seconds")]
    pub warm_ttl_seconds: u64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            confirmation_margin: default_confirmation_margin(),
            boost: default_boost(),
            penalty: default_penalty(),
            ttl_seconds: default_feedback_ttl_seconds(),
            warm_confidence_threshold: default_warm_confidence_threshold(),
            warm_ttl_seconds: default_warm_ttl_seconds(),
        }
    }
}

fn default_confirmation_margin() -> i64 {
    1
}

fn default_boost() -> f32 {
    0.15
}

fn default_penalty() -> f32 {
    0.15
}

fn default_feedback_ttl_seconds() -> u64 {
    60 * 60 * 24 * 7
}

fn default_warm_confidence_threshold() -> i64 {
    3
}

fn default_warm_ttl_seconds() -> u64 {
    60 * 60 * 24 * 30
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            match_threshold: default_match_threshold(),
        }
    }
}

fn default_match_threshold() -> f64 {
    0.5
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// `0` disables the limit.
    #[serde(default = "default_execution_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_execution_timeout_seconds(),
            scratch_dir: None,
        }
    }
}

impl ExecutionConfig {
    pub fn shell_policy(&self) -> iira_tools::ShellPolicy {
        iira_tools::ShellPolicy {
            timeout: (self.timeout_seconds > 0).then(|| Duration::from_secs(self.timeout_seconds)),
            scratch_dir: self
                .scratch_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
        }
    }
}

fn default_execution_timeout_seconds() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_enabled")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: default_monitor_enabled(),
            poll_interval_seconds: default_poll_interval_seconds(),
        }
    }
}

fn default_monitor_enabled() -> bool {
    true
}

fn default_poll_interval_seconds() -> u64 {
    60
}

impl IiraConfig {
    /// Load from `path` (or the default location). A missing file at the
    /// default location yields the built-in defaults; an explicit path must exist.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);
        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::parse(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file; using defaults");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("IIRA_DATABASE_PATH") {
            if !v.trim().is_empty() {
                self.general.database_path = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("OLLAMA_API_URL") {
            if !v.trim().is_empty() {
                self.llm.base_url = v;
            }
        }
        if let Ok(v) = std::env::var("IIRA_MODEL_PLAN") {
            if !v.trim().is_empty() {
                self.llm.plan_model = v;
            }
        }
        if let Ok(v) = std::env::var("IIRA_MODEL_PARAMS") {
            if !v.trim().is_empty() {
                self.llm.params_model = v;
            }
        }
        if let Ok(v) = std::env::var("QDRANT_URL") {
            if !v.trim().is_empty() {
                self.vector_index.url = v;
            }
        }
        if let Ok(v) = std::env::var("QDRANT_API_KEY") {
            if !v.trim().is_empty() {
                self.vector_index.api_key = Some(v);
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (key, model) in [
            ("llm.plan_model", &self.llm.plan_model),
            ("llm.params_model", &self.llm.params_model),
            ("llm.hyde_model", &self.llm.hyde_model),
            ("embedding.model", &self.embedding.model),
        ] {
            if model.trim().is_empty() {
                return Err(anyhow::anyhow!("{key} is required"));
            }
        }
        if self.embedding.dimension == 0 {
            return Err(anyhow::anyhow!("embedding.dimension must be > 0"));
        }
        if self.retrieval.top_k == 0 {
            return Err(anyhow::anyhow!("retrieval.top_k must be >= 1"));
        }
        if self.retrieval.fetch_k < self.retrieval.top_k {
            return Err(anyhow::anyhow!(
                "retrieval.fetch_k ({}) must be >= retrieval.top_k ({})",
                self.retrieval.fetch_k,
                self.retrieval.top_k
            ));
        }
        for (key, v) in [
            ("retrieval.initial_threshold", self.retrieval.initial_threshold),
            ("retrieval.hyde_threshold", self.retrieval.hyde_threshold),
            ("retrieval.script_match_threshold", self.retrieval.script_match_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(anyhow::anyhow!("{key} must be within [0, 1], got {v}"));
            }
        }
        if !(0.0..=1.0).contains(&self.resolver.match_threshold) {
            return Err(anyhow::anyhow!("resolver.match_threshold must be within [0, 1]"));
        }
        if self.feedback.boost < 0.0 || self.feedback.penalty < 0.0 {
            return Err(anyhow::anyhow!("feedback.boost and feedback.penalty must be >= 0"));
        }
        if self.monitor.enabled && self.monitor.poll_interval_seconds == 0 {
            return Err(anyhow::anyhow!("monitor.poll_interval_seconds must be > 0"));
        }
        Ok(())
    }
}

pub fn default_config_path() -> PathBuf {
    iira_home().join("config.toml")
}

pub fn default_data_dir() -> PathBuf {
    iira_home().join("data")
}

fn iira_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".iira")
}
