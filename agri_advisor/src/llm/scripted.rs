//! Offline backend driven by a closure. Used by tests and dry runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{CompletionRequest, ModelBackend};
use crate::error::BackendError;

type Script = dyn Fn(&CompletionRequest) -> Result<String, BackendError> + Send + Sync;

pub struct ScriptedBackend {
    name: String,
    script: Box<Script>,
    calls: AtomicUsize,
    models: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new<F>(name: &str, script: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<String, BackendError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            script: Box::new(script),
            calls: AtomicUsize::new(0),
            models: Mutex::new(Vec::new()),
        }
    }

    /// Answers every prompt with the same text.
    pub fn always(name: &str, text: &str) -> Self {
        let text = text.to_string();
        Self::new(name, move |_| Ok(text.clone()))
    }

    /// Fails every prompt with the same error.
    pub fn failing(name: &str, error: BackendError) -> Self {
        Self::new(name, move |_| Err(error.clone()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Models requested so far, in call order.
    pub fn models_called(&self) -> Vec<String> {
        self.models.lock().clone()
    }
}

impl fmt::Debug for ScriptedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedBackend")
            .field("name", &self.name)
            .field("calls", &self.calls())
            .finish()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.models.lock().push(request.model.clone());
        (self.script)(request)
    }
}
