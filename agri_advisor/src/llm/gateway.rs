use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::{CompletionRequest, ModelBackend, ModelRole, OpenAiCompatibleBackend};
use crate::cache::{CacheStats, ResponseCache};
use crate::error::{BackendError, GenerationError};
use crate::settings::SettingsHandle;

/// A gateway call. Temperature and token limit default to the role's
/// configured generation parameters.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub role: ModelRole,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub use_cache: bool,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, role: ModelRole) -> Self {
        Self {
            prompt: prompt.into(),
            role,
            temperature: None,
            max_output_tokens: None,
            use_cache: true,
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = Some(max_output_tokens);
        self
    }

    /// Skip both cache lookup and cache store.
    pub fn uncached(mut self) -> Self {
        self.use_cache = false;
        self
    }
}

/// Snapshot of the chain configuration taken at the start of each call.
struct ChainPlan {
    models: Vec<String>,
    secondary_model: Option<String>,
    max_retries: u32,
    base_delay_ms: u64,
    temperature: f32,
    max_output_tokens: u32,
}

/// Single point of access to model inference.
#[derive(Debug)]
pub struct LlmGateway {
    primary: Arc<dyn ModelBackend>,
    secondary: Option<Arc<dyn ModelBackend>>,
    settings: SettingsHandle,
    cache: ResponseCache,
    blocked: DashSet<String>,
}

impl LlmGateway {
    pub fn new(
        settings: SettingsHandle,
        primary: Arc<dyn ModelBackend>,
        secondary: Option<Arc<dyn ModelBackend>>,
    ) -> Self {
        let capacity = settings.read(|s| s.llm.cache_capacity);
        Self {
            primary,
            secondary,
            settings,
            cache: ResponseCache::new(capacity),
            blocked: DashSet::new(),
        }
    }

    /// Build HTTP backends from the `llm` settings section.
    pub fn from_settings(settings: SettingsHandle) -> anyhow::Result<Self> {
        let llm = settings.read(|s| s.llm.clone());
        let primary = OpenAiCompatibleBackend::new(
            &llm.primary.name,
            &llm.primary.base_url,
            llm.primary.api_key(),
            llm.request_timeout_seconds,
        )?;
        let secondary = match &llm.secondary {
            Some(cfg) => Some(Arc::new(OpenAiCompatibleBackend::new(
                &cfg.name,
                &cfg.base_url,
                cfg.api_key(),
                llm.request_timeout_seconds,
            )?) as Arc<dyn ModelBackend>),
            None => None,
        };
        Ok(Self::new(settings, Arc::new(primary), secondary))
    }

    pub async fn generate(
        &self,
        prompt: &str,
        role: ModelRole,
        temperature: f32,
        max_output_tokens: u32,
    ) -> Result<String, GenerationError> {
        self.generate_with(
            GenerationRequest::new(prompt, role)
                .temperature(temperature)
                .max_output_tokens(max_output_tokens),
        )
        .await
    }

    #[instrument(skip(self, request), fields(role = %request.role, prompt_len = request.prompt.len()))]
    pub async fn generate_with(&self, request: GenerationRequest) -> Result<String, GenerationError> {
        let plan = self.plan(&request);
        let key = ResponseCache::key(&request.prompt, request.role, plan.temperature);

        if request.use_cache {
            if let Some(text) = self.cache.get(&key) {
                debug!("Cache hit");
                return Ok(text);
            }
        }

        let mut attempts = 0usize;
        let mut last_error: Option<BackendError> = None;

        for model in &plan.models {
            match self
                .try_model(self.primary.as_ref(), model, &request.prompt, &plan, &mut attempts)
                .await
            {
                Ok(text) => {
                    info!(backend = self.primary.name(), model = %model, role = %request.role, "Request served");
                    return Ok(self.store(request.use_cache, key, text));
                }
                Err(Some(e)) => last_error = Some(e),
                Err(None) => {}
            }
        }

        if let (Some(backend), Some(model)) = (&self.secondary, &plan.secondary_model) {
            warn!(role = %request.role, backend = backend.name(), model = %model, "Primary chain exhausted, using secondary backend");
            let single = ChainPlan { max_retries: 1, ..self.plan(&request) };
            match self
                .try_model(backend.as_ref(), model, &request.prompt, &single, &mut attempts)
                .await
            {
                Ok(text) => {
                    info!(backend = backend.name(), model = %model, role = %request.role, "Request served");
                    return Ok(self.store(request.use_cache, key, text));
                }
                Err(Some(e)) => last_error = Some(e),
                Err(None) => {}
            }
        }

        let error = GenerationError {
            role: request.role,
            attempts,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no usable model configured".to_string()),
        };
        warn!(%error, "Generation failed");
        Err(error)
    }

    /// Run one model with bounded retries. `Err(None)` means the model was skipped.
    async fn try_model(
        &self,
        backend: &dyn ModelBackend,
        model: &str,
        prompt: &str,
        plan: &ChainPlan,
        attempts: &mut usize,
    ) -> Result<String, Option<BackendError>> {
        let block_key = format!("{}:{}", backend.name(), model);
        if self.blocked.contains(&block_key) {
            debug!(model = %block_key, "Skipping hard-blocked model");
            return Err(None);
        }

        let completion = CompletionRequest {
            model: model.to_string(),
            prompt: prompt.to_string(),
            temperature: plan.temperature,
            max_output_tokens: plan.max_output_tokens,
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            *attempts += 1;
            let error = match backend.complete(&completion).await {
                Ok(text) if !text.trim().is_empty() => return Ok(text),
                Ok(_) => BackendError::Rejected("empty completion".to_string()),
                Err(e) => e,
            };

            if let BackendError::HardBlocked(_) = &error {
                warn!(model = %block_key, "Model has no quota, blocking until reload");
                self.blocked.insert(block_key);
                return Err(Some(error));
            }

            if error.is_transient() && attempt < plan.max_retries {
                let delay = backoff(plan.base_delay_ms, attempt);
                warn!(model = %block_key, attempt, delay_ms = delay.as_millis() as u64, %error, "Transient error, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }

            debug!(model = %block_key, %error, "Advancing to next model");
            return Err(Some(error));
        }
    }

    fn plan(&self, request: &GenerationRequest) -> ChainPlan {
        self.settings.read(|s| {
            let params = s.generation.for_role(request.role);
            ChainPlan {
                models: s.llm.primary.models.for_role(request.role).to_vec(),
                secondary_model: s.llm.secondary.as_ref().map(|c| c.model.clone()),
                max_retries: s.llm.max_retries.max(1),
                base_delay_ms: s.llm.retry_base_delay_ms,
                temperature: request.temperature.unwrap_or(params.temperature),
                max_output_tokens: request.max_output_tokens.unwrap_or(params.max_output_tokens),
            }
        })
    }

    fn store(&self, use_cache: bool, key: String, text: String) -> String {
        if use_cache {
            self.cache.insert(key, text.clone());
        }
        text
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Models currently skipped because of an exhausted quota.
    pub fn blocked_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.blocked.iter().map(|m| m.key().clone()).collect();
        models.sort();
        models
    }

    /// Apply the current role assignments: unblock models and resize the cache.
    pub fn reload(&self) {
        let capacity = self.settings.read(|s| s.llm.cache_capacity);
        self.blocked.clear();
        self.cache.resize(capacity);
        info!(capacity, "Gateway configuration reloaded");
    }
}

fn backoff(base_delay_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis(base_delay_ms.saturating_mul(factor))
}
