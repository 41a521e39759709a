//! Language model access.
//!
//! Every inference in the crate goes through [`LlmGateway`], which walks the
//! configured per-role model chain of the primary backend, retries transient
//! failures with exponential back-off, and falls back to a single model on a
//! secondary backend as the last resort. Backends are plain
//! [`ModelBackend`] implementations so tests can script them.

mod gateway;
mod openai_compatible;
mod scripted;

pub use gateway::{GenerationRequest, LlmGateway};
pub use openai_compatible::OpenAiCompatibleBackend;
pub use scripted::ScriptedBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::BackendError;

/// Purpose of a model call; selects the model chain and generation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    Classifier,
    Agent,
    Synthesis,
}

impl ModelRole {
    pub const ALL: [ModelRole; 3] = [ModelRole::Classifier, ModelRole::Agent, ModelRole::Synthesis];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelRole::Classifier => "classifier",
            ModelRole::Agent => "agent",
            ModelRole::Synthesis => "synthesis",
        }
    }
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One completion against one concrete model.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

/// A provider able to run a prompt against a named model.
#[async_trait]
pub trait ModelBackend: Send + Sync + fmt::Debug {
    /// Stable name used in logs and in hard-block keys.
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError>;
}
