//! Layered configuration with environment variable support, validation and
//! runtime reload.

use anyhow::{anyhow, Result};
use config::{Config, Environment};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::llm::ModelRole;

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Ordered model lists, one per role.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleChains {
    pub classifier: Vec<String>,
    pub agent: Vec<String>,
    pub synthesis: Vec<String>,
}

impl RoleChains {
    pub fn for_role(&self, role: ModelRole) -> &[String] {
        match role {
            ModelRole::Classifier => &self.classifier,
            ModelRole::Agent => &self.agent,
            ModelRole::Synthesis => &self.synthesis,
        }
    }
}

/// Primary backend with a fallback chain per role
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub name: String,
    pub base_url: String,
    pub api_key_env: Option<String>,
    pub models: RoleChains,
}

impl BackendConfig {
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty())
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        let chain = |models: &[&str]| models.iter().map(|m| m.to_string()).collect::<Vec<_>>();
        Self {
            name: "groq".to_string(),
            base_url: "https://api.groq.com/openai/v1".to_string(),
            api_key_env: Some("GROQ_API_KEY".to_string()),
            models: RoleChains {
                classifier: chain(&["llama-3.1-8b-instant", "llama-3.3-70b-versatile"]),
                agent: chain(&["llama-3.3-70b-versatile", "llama-3.1-8b-instant"]),
                synthesis: chain(&["llama-3.1-8b-instant", "llama-3.3-70b-versatile"]),
            },
        }
    }
}

/// Last-resort backend, a single fixed model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecondaryBackendConfig {
    pub name: String,
    pub base_url: String,
    pub api_key_env: Option<String>,
    pub model: String,
}

impl SecondaryBackendConfig {
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty())
    }
}

impl Default for SecondaryBackendConfig {
    fn default() -> Self {
        Self {
            name: "gemini".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
            api_key_env: Some("GEMINI_API_KEY".to_string()),
            model: "gemini-2.0-flash".to_string(),
        }
    }
}

/// LLM gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub primary: BackendConfig,
    pub secondary: Option<SecondaryBackendConfig>,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub request_timeout_seconds: u64,
    pub cache_capacity: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            primary: BackendConfig::default(),
            secondary: Some(SecondaryBackendConfig::default()),
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            request_timeout_seconds: 60,
            cache_capacity: 1_024,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_output_tokens: u32,
}

/// Admin-tunable generation parameters per role
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub classifier: GenerationParams,
    pub agent: GenerationParams,
    pub synthesis: GenerationParams,
}

impl GenerationConfig {
    pub fn for_role(&self, role: ModelRole) -> GenerationParams {
        match role {
            ModelRole::Classifier => self.classifier,
            ModelRole::Agent => self.agent,
            ModelRole::Synthesis => self.synthesis,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            classifier: GenerationParams { temperature: 0.0, max_output_tokens: 512 },
            agent: GenerationParams { temperature: 0.3, max_output_tokens: 2_048 },
            synthesis: GenerationParams { temperature: 0.3, max_output_tokens: 2_048 },
        }
    }
}

/// Embedding model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String, // "hash" or "http"
    pub dimension: usize,
    pub model: String,
    pub base_url: String,
    pub api_key_env: Option<String>,
    /// Embeddings kept in the content-hash cache.
    pub cache_capacity: usize,
}

impl EmbeddingConfig {
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty())
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hash".to_string(),
            dimension: 384,
            model: "text-embedding-3-small".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            cache_capacity: 4_096,
        }
    }
}

/// Knowledge retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub collections: Vec<String>,
    pub embedding: EmbeddingConfig,
    pub top_k: usize,
    pub max_context_chars: usize,
    pub snapshot_path: Option<PathBuf>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            collections: [
                "crop_diseases",
                "farming_practices",
                "government_schemes",
                "market_data",
                "soil_data",
            ]
            .iter()
            .map(|c| c.to_string())
            .collect(),
            embedding: EmbeddingConfig::default(),
            top_k: 5,
            max_context_chars: 4_000,
            snapshot_path: None,
        }
    }
}

/// Long-term memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub dedup_threshold: f32,
    pub llm_dedup_floor: f32,
    pub max_injected: usize,
    pub decay_days: i64,
    pub short_term_turns: usize,
    pub extraction_char_limit: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dedup_threshold: 0.88,
            llm_dedup_floor: 0.75,
            max_injected: 12,
            decay_days: 90,
            short_term_turns: 20,
            extraction_char_limit: 1_500,
        }
    }
}

/// Supervisor timeouts and fallback text
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub agent_timeout_ms: u64,
    pub query_timeout_ms: u64,
    pub fallback_response: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            agent_timeout_ms: 45_000,
            query_timeout_ms: 120_000,
            fallback_response: "Sorry, I could not find relevant information at this time. \
                Please try rephrasing your question."
                .to_string(),
        }
    }
}

/// Content filter applied to every synthesized answer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    pub blocked_patterns: Vec<String>,
    pub replacement: String,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            blocked_patterns: vec![
                r"(?i)\b(endosulfan|monocrotophos|methyl parathion|phorate)\b".to_string(),
                r"(?i)\b(suicide|kill (yourself|myself)|drink(ing)? (the )?(pesticide|poison))\b"
                    .to_string(),
            ],
            replacement: "I can't give a safe recommendation for this question. Please contact \
                your local agriculture extension officer or Kisan Call Centre (1800-180-1551) \
                for guidance on approved products and safe handling."
                .to_string(),
        }
    }
}

/// Main settings structure with all configuration sections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub logging: LoggingConfig,
    pub llm: LlmConfig,
    pub generation: GenerationConfig,
    pub retrieval: RetrievalConfig,
    pub memory: MemoryConfig,
    pub supervisor: SupervisorConfig,
    pub guardrail: GuardrailConfig,
}

impl Settings {
    /// Load settings from the embedded defaults, a local file and environment variables
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::with_name("agri_advisor").required(false))
            .add_source(
                Environment::with_prefix("AGRI")
                    .separator("__")
                    .list_separator(",")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;

        Self::apply_env_overrides(&mut settings)?;
        settings.validate()?;

        Ok(settings)
    }

    /// Apply environment variable overrides for the most common knobs
    fn apply_env_overrides(settings: &mut Settings) -> Result<()> {
        if let Ok(level) = std::env::var("AGRI_LOG_LEVEL") {
            settings.logging.level = level;
        }
        if let Ok(url) = std::env::var("AGRI_PRIMARY_BASE_URL") {
            settings.llm.primary.base_url = url;
        }
        if let Ok(retries) = std::env::var("AGRI_LLM_MAX_RETRIES") {
            settings.llm.max_retries = retries.parse()?;
        }
        if let Ok(path) = std::env::var("AGRI_SNAPSHOT_PATH") {
            settings.retrieval.snapshot_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Validate settings for consistency
    pub fn validate(&self) -> Result<()> {
        for role in ModelRole::ALL {
            if self.llm.primary.models.for_role(role).is_empty() {
                return Err(anyhow!("No models configured for role '{}'", role));
            }
        }
        if let Some(secondary) = &self.llm.secondary {
            if secondary.model.trim().is_empty() {
                return Err(anyhow!("Secondary backend '{}' has no model", secondary.name));
            }
        }
        if self.llm.max_retries == 0 {
            return Err(anyhow!("llm.max_retries must be at least 1"));
        }

        if self.retrieval.top_k == 0 {
            return Err(anyhow!("retrieval.top_k cannot be 0"));
        }
        if self.retrieval.embedding.dimension == 0 {
            return Err(anyhow!("retrieval.embedding.dimension cannot be 0"));
        }
        if !matches!(self.retrieval.embedding.provider.as_str(), "hash" | "http") {
            return Err(anyhow!(
                "Unknown embedding provider '{}'",
                self.retrieval.embedding.provider
            ));
        }

        let threshold = self.memory.dedup_threshold;
        if !(0.0..=1.0).contains(&threshold) || threshold == 0.0 {
            return Err(anyhow!("memory.dedup_threshold must be in (0, 1]"));
        }
        if self.memory.llm_dedup_floor > threshold {
            warn!(
                "memory.llm_dedup_floor ({}) is above dedup_threshold ({}); adjudication disabled",
                self.memory.llm_dedup_floor, threshold
            );
        }

        if self.supervisor.agent_timeout_ms == 0 || self.supervisor.query_timeout_ms == 0 {
            return Err(anyhow!("Supervisor timeouts must be positive"));
        }

        for pattern in &self.guardrail.blocked_patterns {
            regex::Regex::new(pattern)
                .map_err(|e| anyhow!("Invalid guardrail pattern '{}': {}", pattern, e))?;
        }

        Ok(())
    }
}

/// Shared, reloadable view of the settings.
///
/// Components hold a handle and read a fresh snapshot on every call, so
/// admin changes apply without a restart.
#[derive(Debug, Clone, Default)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Settings>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn snapshot(&self) -> Settings {
        self.inner.read().clone()
    }

    /// Borrow the current settings for the duration of `f`.
    pub fn read<R>(&self, f: impl FnOnce(&Settings) -> R) -> R {
        f(&self.inner.read())
    }

    /// Swap in a new validated configuration.
    pub fn replace(&self, settings: Settings) -> Result<()> {
        settings.validate()?;
        *self.inner.write() = settings;
        Ok(())
    }

    /// Apply an in-place edit; rejected edits leave the current settings untouched.
    pub fn update(&self, edit: impl FnOnce(&mut Settings)) -> Result<()> {
        let mut next = self.snapshot();
        edit(&mut next);
        self.replace(next)
    }

    /// Re-read configuration sources.
    pub fn reload(&self) -> Result<()> {
        let settings = Settings::load()?;
        self.replace(settings)?;
        info!("Settings reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_defaults_parse_and_validate() {
        let config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.toml"),
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let settings: Settings = config.try_deserialize().unwrap();

        settings.validate().unwrap();
        assert_eq!(settings.llm.primary.models.classifier.len(), 3);
        assert_eq!(settings.retrieval.collections.len(), 5);
        assert_eq!(settings.llm.secondary.as_ref().unwrap().model, "gemini-2.0-flash");
    }

    #[test]
    fn empty_role_chain_is_rejected() {
        let mut settings = Settings::default();
        settings.llm.primary.models.synthesis.clear();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("synthesis"));
    }

    #[test]
    fn bad_guardrail_pattern_is_rejected() {
        let mut settings = Settings::default();
        settings.guardrail.blocked_patterns.push("(unclosed".to_string());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn handle_update_is_visible_to_readers() {
        let handle = SettingsHandle::new(Settings::default());
        let reader = handle.clone();

        handle.update(|s| s.retrieval.top_k = 9).unwrap();
        assert_eq!(reader.read(|s| s.retrieval.top_k), 9);

        // invalid edits are discarded
        assert!(handle.update(|s| s.retrieval.top_k = 0).is_err());
        assert_eq!(reader.read(|s| s.retrieval.top_k), 9);
    }
}
