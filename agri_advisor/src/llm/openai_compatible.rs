//! Chat-completions backend for any OpenAI-compatible endpoint
//! (Groq, Gemini's compatibility layer, local servers).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use super::{CompletionRequest, ModelBackend};
use crate::error::BackendError;

#[derive(Debug, Clone)]
pub struct OpenAiCompatibleBackend {
    name: String,
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleBackend {
    /// `base_url` is the API root, e.g. `https://api.groq.com/openai/v1`.
    pub fn new(
        name: &str,
        base_url: &str,
        api_key: Option<String>,
        timeout_seconds: u64,
    ) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| BackendError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            name: name.to_string(),
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
        })
    }
}

#[async_trait]
impl ModelBackend for OpenAiCompatibleBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError> {
        let payload = ChatCompletionRequest {
            model: &request.model,
            messages: vec![Message { role: "user", content: &request.prompt }],
            temperature: request.temperature,
            max_tokens: request.max_output_tokens,
        };

        debug!(backend = %self.name, model = %request.model, "Sending completion request");

        let mut req = self.client.post(&self.endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout
            } else {
                BackendError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let parsed = response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|e| BackendError::Rejected(format!("failed to parse response body: {e}")))?;
        trace!(choices = parsed.choices.len(), "Completion received");

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BackendError::Rejected("empty or missing content in response".into()))
    }
}

/// Map a non-success HTTP status onto the retry taxonomy.
fn classify_status(status: u16, body: &str) -> BackendError {
    let message: String = body.chars().take(300).collect();
    match status {
        429 if body.contains("limit: 0") => BackendError::HardBlocked(message),
        429 => BackendError::RateLimited(message),
        408 | 504 => BackendError::Timeout,
        500..=599 => BackendError::Server { status, message },
        _ => BackendError::Rejected(format!("HTTP {status}: {message}")),
    }
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}
