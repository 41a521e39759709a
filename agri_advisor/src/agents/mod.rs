//! Domain specialists.
//!
//! Every specialist follows the same recipe: retrieve from its own fixed
//! collections, optionally consult one external collaborator, then make a
//! single `agent`-role model call. Collaborator failures are noted in the
//! response instead of failing the turn; gateway failures are returned as
//! [`AgentError`] for the supervisor to handle.

mod crop_doctor;
mod market;
mod prompt;
mod scheme;
mod soil;
mod weather;

pub use crop_doctor::CropDoctor;
pub use market::MarketAgent;
pub use scheme::SchemeAgent;
pub use soil::{fertilizer_plan, FertilizerPlan, SoilAgent};
pub use weather::WeatherAgent;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::llm::{GenerationRequest, LlmGateway, ModelRole};
use crate::retrieval::{KnowledgeRetriever, RetrievedContext};
use crate::services::Services;
use crate::settings::SettingsHandle;

/// The closed set of specialists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialistKind {
    CropDoctor,
    Weather,
    Market,
    Scheme,
    Soil,
}

impl SpecialistKind {
    pub const ALL: [SpecialistKind; 5] = [
        SpecialistKind::CropDoctor,
        SpecialistKind::Weather,
        SpecialistKind::Market,
        SpecialistKind::Scheme,
        SpecialistKind::Soil,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SpecialistKind::CropDoctor => "crop_doctor",
            SpecialistKind::Weather => "weather",
            SpecialistKind::Market => "market",
            SpecialistKind::Scheme => "scheme",
            SpecialistKind::Soil => "soil",
        }
    }
}

impl fmt::Display for SpecialistKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sub-query handed to one specialist.
#[derive(Debug, Clone, Default)]
pub struct SpecialistRequest {
    pub query: String,
    pub entities: BTreeMap<String, String>,
    pub memory_context: String,
    pub location: Option<String>,
    pub image: Option<Arc<[u8]>>,
}

impl SpecialistRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self { query: query.into(), ..Default::default() }
    }

    pub fn entity(&self, key: &str) -> Option<&str> {
        self.entities.get(key).map(String::as_str).filter(|v| !v.trim().is_empty())
    }

    /// Explicit location, else a `location` entity.
    pub fn location(&self) -> Option<&str> {
        self.location
            .as_deref()
            .filter(|l| !l.trim().is_empty())
            .or_else(|| self.entity("location"))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SpecialistResponse {
    pub agent: SpecialistKind,
    pub text: String,
    /// Collections used, in rank order.
    pub sources: Vec<String>,
    pub metadata: Value,
    /// Set when a collaborator was unavailable and the answer is knowledge-base only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

/// Specialist health information
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AgentHealth {
    pub status: String,
    pub uptime_seconds: u64,
    pub total_requests: u64,
    pub error_count: u64,
    pub average_response_time_ms: f64,
}

#[async_trait]
pub trait Specialist: Send + Sync + fmt::Debug {
    fn kind(&self) -> SpecialistKind;

    /// Collections this specialist is allowed to read.
    fn collections(&self) -> &'static [&'static str];

    async fn handle(&self, request: &SpecialistRequest) -> Result<SpecialistResponse, AgentError>;

    fn health(&self) -> AgentHealth;
}

/// Shared collaborators injected into every specialist.
#[derive(Debug, Clone)]
pub struct AgentDeps {
    pub gateway: Arc<LlmGateway>,
    pub retriever: Arc<KnowledgeRetriever>,
    pub services: Services,
    pub settings: SettingsHandle,
}

/// All five specialists, keyed by kind.
pub fn build_specialists(deps: &AgentDeps) -> HashMap<SpecialistKind, Arc<dyn Specialist>> {
    let specialists: [Arc<dyn Specialist>; 5] = [
        Arc::new(CropDoctor::new(deps.clone())),
        Arc::new(WeatherAgent::new(deps.clone())),
        Arc::new(MarketAgent::new(deps.clone())),
        Arc::new(SchemeAgent::new(deps.clone())),
        Arc::new(SoilAgent::new(deps.clone())),
    ];
    specialists.into_iter().map(|s| (s.kind(), s)).collect()
}

#[derive(Debug)]
struct HealthCounters {
    requests: AtomicU64,
    errors: AtomicU64,
    total_latency_ms: AtomicU64,
    started: Instant,
}

impl HealthCounters {
    fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    fn snapshot(&self) -> AgentHealth {
        let requests = self.requests.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let latency = self.total_latency_ms.load(Ordering::Relaxed);
        let status = if requests > 0 && errors * 2 > requests { "degraded" } else { "healthy" };
        AgentHealth {
            status: status.to_string(),
            uptime_seconds: self.started.elapsed().as_secs(),
            total_requests: requests,
            error_count: errors,
            average_response_time_ms: if requests == 0 { 0.0 } else { latency as f64 / requests as f64 },
        }
    }
}

/// Plumbing common to all specialists.
#[derive(Debug)]
pub(crate) struct SpecialistCore {
    kind: SpecialistKind,
    deps: AgentDeps,
    counters: HealthCounters,
}

impl SpecialistCore {
    pub(crate) fn new(kind: SpecialistKind, deps: AgentDeps) -> Self {
        Self { kind, deps, counters: HealthCounters::new() }
    }

    pub(crate) fn services(&self) -> &Services {
        &self.deps.services
    }

    pub(crate) fn health(&self) -> AgentHealth {
        self.counters.snapshot()
    }

    /// Run one request, recording latency and failures.
    pub(crate) async fn track<F>(&self, work: F) -> Result<SpecialistResponse, AgentError>
    where
        F: Future<Output = Result<SpecialistResponse, AgentError>>,
    {
        let started = Instant::now();
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let result = work.await;
        self.counters
            .total_latency_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        if let Err(e) = &result {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            warn!(agent = %self.kind, error = %e, "Specialist failed");
        }
        result
    }

    /// Retrieve from the allowed collections that are active and present.
    pub(crate) async fn knowledge(
        &self,
        query: &str,
        allowed: &[&str],
    ) -> Result<RetrievedContext, AgentError> {
        let (active, top_k) = self
            .deps
            .settings
            .read(|s| (s.retrieval.collections.clone(), s.retrieval.top_k));
        let names: Vec<String> = allowed
            .iter()
            .filter(|name| active.iter().any(|a| a.as_str() == **name))
            .filter(|name| self.deps.retriever.has_collection(name))
            .map(|name| name.to_string())
            .collect();
        if names.len() < allowed.len() {
            debug!(agent = %self.kind, ?names, "Some collections are inactive or missing");
        }
        if names.is_empty() {
            return Ok(RetrievedContext::default());
        }
        Ok(self.deps.retriever.retrieve(query, Some(names.as_slice()), top_k).await?)
    }

    pub(crate) async fn generate(&self, prompt: String) -> Result<String, AgentError> {
        let request = GenerationRequest::new(prompt, ModelRole::Agent);
        Ok(self.deps.gateway.generate_with(request).await?)
    }

    /// Final assembly shared by every specialist.
    pub(crate) fn respond(
        &self,
        text: String,
        context: &RetrievedContext,
        metadata: Value,
        degraded: Option<String>,
    ) -> SpecialistResponse {
        SpecialistResponse {
            agent: self.kind,
            text,
            sources: context.sources.clone(),
            metadata,
            degraded,
        }
    }
}

/// `collection: title` labels for the passages, without repeats.
pub(crate) fn references(context: &RetrievedContext) -> Vec<String> {
    let mut refs: Vec<String> = Vec::new();
    for passage in &context.passages {
        let doc = &passage.document;
        let label = match doc.title() {
            Some(title) => format!("{}: {}", doc.collection, title),
            None => doc.collection.clone(),
        };
        if !refs.contains(&label) {
            refs.push(label);
        }
    }
    refs
}
