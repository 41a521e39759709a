//! Error taxonomy for the advisory core.

use thiserror::Error;
use uuid::Uuid;

use crate::llm::ModelRole;

/// A single failed call against one model of one backend.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("request timed out")]
    Timeout,

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    /// The account has no quota for this model; retrying will not help.
    #[error("quota exhausted: {0}")]
    HardBlocked(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl BackendError {
    /// Errors worth retrying on the same model.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Timeout | Self::Server { .. } | Self::Transport(_)
        )
    }
}

/// Every model of every backend failed for a role.
#[derive(Debug, Clone, Error)]
#[error("all models exhausted for role '{role}' after {attempts} attempts (last error: {last_error})")]
pub struct GenerationError {
    pub role: ModelRole,
    pub attempts: usize,
    pub last_error: String,
}

#[derive(Debug, Clone, Error)]
pub enum EmbeddingError {
    #[error("cannot embed empty text")]
    EmptyInput,

    #[error("embedding request failed: {0}")]
    Request(String),

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("ingestion error: {0}")]
    Ingestion(String),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory {id} not found for user '{user_id}'")]
    NotFound { user_id: String, id: Uuid },

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
}

/// Failure of one specialist for one turn.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("retrieval failed: {0}")]
    Retrieval(#[from] RetrievalError),
}

/// External collaborator failures. Always recoverable for the caller.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("service timed out")]
    Timeout,
}
