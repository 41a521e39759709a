//! Supervisor: classifies a query, routes it to specialists, synthesizes one
//! answer and applies the guardrail.
//!
//! Every path ends in an answer. Failures that would leave the farmer with
//! nothing are replaced by the configured fallback response and recorded as
//! the `Failed` state. An unusable classification also ends `Failed`, but the
//! turn still answers as a general question. Memory and conversation-log
//! updates run in the background after the answer is produced.

pub mod guardrail;
pub mod intent;
pub mod routing;

pub use guardrail::{Guardrail, Verdict};
pub use intent::{Intent, IntentClassification};
pub use routing::{route, Route};

use anyhow::Context;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::any::Any;
use std::fmt::Write;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::agents::{
    build_specialists, AgentDeps, AgentHealth, Specialist, SpecialistKind, SpecialistRequest,
    SpecialistResponse,
};
use crate::llm::{GenerationRequest, LlmGateway, ModelRole};
use crate::memory::MemoryStore;
use crate::retrieval::{embedding, KnowledgeRetriever};
use crate::services::{ConversationLog, LoggedTurn, Services};
use crate::settings::SettingsHandle;

/// One farmer turn.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub text: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub location: Option<String>,
    pub image: Option<Arc<[u8]>>,
    /// Pre-rendered memory. When absent the supervisor asks the memory store.
    pub memory_context: Option<String>,
}

impl Query {
    pub fn new(text: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self { text: text.into(), user_id: user_id.into(), ..Default::default() }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<Arc<[u8]>>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_memory_context(mut self, memory_context: impl Into<String>) -> Self {
        self.memory_context = Some(memory_context.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    Received,
    Classified,
    Routed,
    SingleDispatch,
    MultiDispatch,
    Synthesized,
    Guarded,
    Done,
    Failed,
}

/// What happened to one dispatched specialist.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentOutcome {
    Success(SpecialistResponse),
    Failed { error: String },
}

impl AgentOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AgentOutcome::Success(_))
    }
}

/// Recoverable problems observed during one turn.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    ClassificationFailure { attempts: usize },
    ClassifierUnavailable { error: String },
    SpecialistFailure { agent: SpecialistKind, error: String },
    AllSpecialistsFailure,
    DirectAnswerFailure { error: String },
    SynthesisFallback { error: String },
    GuardrailReplaced { pattern: String },
    QueryTimeout { after_ms: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct SynthesizedAnswer {
    pub response: String,
    pub intent: IntentClassification,
    pub sources: BTreeSet<String>,
    pub agent_responses: BTreeMap<String, AgentOutcome>,
    pub state: QueryState,
    pub trace: Vec<QueryState>,
    pub diagnostics: Vec<Diagnostic>,
}

impl SynthesizedAnswer {
    pub fn is_failed(&self) -> bool {
        self.state == QueryState::Failed
    }
}

/// Mutable bookkeeping for one turn. Survives cancellation of the pipeline.
struct Turn {
    intent: IntentClassification,
    agent_responses: BTreeMap<String, AgentOutcome>,
    sources: BTreeSet<String>,
    trace: Vec<QueryState>,
    diagnostics: Vec<Diagnostic>,
    /// The classifier never produced usable output.
    misclassified: bool,
}

impl Turn {
    fn new() -> Self {
        Self {
            intent: IntentClassification::general(),
            agent_responses: BTreeMap::new(),
            sources: BTreeSet::new(),
            trace: vec![QueryState::Received],
            diagnostics: Vec::new(),
            misclassified: false,
        }
    }

    fn advance(&mut self, state: QueryState) {
        debug!(?state, "Query state");
        self.trace.push(state);
    }

    fn finish(mut self, response: String, state: QueryState) -> SynthesizedAnswer {
        if self.trace.last() != Some(&state) {
            self.advance(state);
        }
        SynthesizedAnswer {
            response,
            intent: self.intent,
            sources: self.sources,
            agent_responses: self.agent_responses,
            state,
            trace: self.trace,
            diagnostics: self.diagnostics,
        }
    }
}

/// Why the pipeline gave up and the fallback answer is used.
enum Abort {
    Classifier,
    AllSpecialists,
    Direct,
}

pub struct Supervisor {
    gateway: Arc<LlmGateway>,
    retriever: Arc<KnowledgeRetriever>,
    memory: Option<Arc<MemoryStore>>,
    conversation_log: Option<Arc<dyn ConversationLog>>,
    specialists: RwLock<HashMap<SpecialistKind, Arc<dyn Specialist>>>,
    settings: SettingsHandle,
    background: TaskTracker,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("specialists", &self.specialists.read().keys().collect::<Vec<_>>())
            .field("memory", &self.memory.is_some())
            .field("conversation_log", &self.conversation_log.is_some())
            .finish()
    }
}

impl Supervisor {
    /// A supervisor with the five built-in specialists.
    pub fn new(deps: AgentDeps) -> Self {
        let specialists = build_specialists(&deps);
        Self {
            gateway: deps.gateway,
            retriever: deps.retriever,
            memory: None,
            conversation_log: None,
            specialists: RwLock::new(specialists),
            settings: deps.settings,
            background: TaskTracker::new(),
        }
    }

    /// Wire every component from settings: HTTP backends, the configured
    /// embedder, the knowledge snapshot when present, and a memory store.
    pub async fn from_settings(settings: SettingsHandle, services: Services) -> anyhow::Result<Self> {
        let gateway = Arc::new(LlmGateway::from_settings(settings.clone())?);
        let (embedding_config, timeout, snapshot) = settings.read(|s| {
            (
                s.retrieval.embedding.clone(),
                s.llm.request_timeout_seconds,
                s.retrieval.snapshot_path.clone(),
            )
        });
        let embedder = embedding::from_settings(&embedding_config, timeout)
            .context("failed to build embedder")?;

        let retriever = Arc::new(KnowledgeRetriever::new(settings.clone(), embedder.clone()));
        if let Some(path) = snapshot {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                let documents = retriever
                    .load_snapshot(&path)
                    .await
                    .with_context(|| format!("failed to load snapshot {}", path.display()))?;
                info!(documents, path = %path.display(), "Knowledge base loaded");
            }
        }

        let memory = Arc::new(MemoryStore::new(gateway.clone(), embedder, settings.clone()));
        let deps = AgentDeps { gateway, retriever, services, settings };
        Ok(Self::new(deps).with_memory(memory))
    }

    pub fn with_memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_conversation_log(mut self, log: Arc<dyn ConversationLog>) -> Self {
        self.conversation_log = Some(log);
        self
    }

    pub fn gateway(&self) -> &Arc<LlmGateway> {
        &self.gateway
    }

    pub fn retriever(&self) -> &Arc<KnowledgeRetriever> {
        &self.retriever
    }

    pub fn memory(&self) -> Option<&Arc<MemoryStore>> {
        self.memory.as_ref()
    }

    /// Replace the specialist for its kind.
    pub fn register_specialist(&self, specialist: Arc<dyn Specialist>) {
        let kind = specialist.kind();
        info!(agent = %kind, "Registering specialist");
        self.specialists.write().insert(kind, specialist);
    }

    pub fn agent_health(&self) -> BTreeMap<SpecialistKind, AgentHealth> {
        self.specialists
            .read()
            .iter()
            .map(|(kind, s)| (*kind, s.health()))
            .collect()
    }

    /// Wait for background memory and log updates to finish.
    pub async fn flush_background(&self) {
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
    }

    /// Answer one query. Never fails: problems are reported in the answer's
    /// state and diagnostics.
    #[instrument(skip(self, query), fields(user = %query.user_id, query_len = query.text.len()))]
    pub async fn process_query(&self, query: Query) -> SynthesizedAnswer {
        let (query_timeout, fallback) = self.settings.read(|s| {
            (
                Duration::from_millis(s.supervisor.query_timeout_ms),
                s.supervisor.fallback_response.clone(),
            )
        });

        let mut turn = Turn::new();
        let outcome = tokio::time::timeout(query_timeout, self.run(&query, &mut turn)).await;

        let answer = match outcome {
            Ok(Ok(response)) if turn.misclassified => {
                warn!("Answered as general after classification failed");
                turn.finish(response, QueryState::Failed)
            }
            Ok(Ok(response)) => turn.finish(response, QueryState::Done),
            Ok(Err(abort)) => {
                let reason = match abort {
                    Abort::Classifier => "classifier unavailable",
                    Abort::AllSpecialists => "all specialists failed",
                    Abort::Direct => "direct answer failed",
                };
                warn!(reason, "Query failed, returning fallback answer");
                turn.finish(fallback, QueryState::Failed)
            }
            Err(_) => {
                let after_ms = query_timeout.as_millis() as u64;
                warn!(after_ms, "Query timed out, returning fallback answer");
                turn.diagnostics.push(Diagnostic::QueryTimeout { after_ms });
                turn.agent_responses.clear();
                turn.sources.clear();
                turn.finish(fallback, QueryState::Failed)
            }
        };

        self.spawn_background(&query, &answer);
        info!(state = ?answer.state, intent = %answer.intent.primary_intent, "Query answered");
        answer
    }

    async fn memory_context(&self, query: &Query) -> String {
        match (&query.memory_context, &self.memory) {
            (Some(context), _) => context.clone(),
            (None, Some(memory)) => {
                let max = self.settings.read(|s| s.memory.max_injected);
                memory.get_memory_context(&query.user_id, &query.text, max).await
            }
            (None, None) => String::new(),
        }
    }

    async fn run(&self, query: &Query, turn: &mut Turn) -> Result<String, Abort> {
        let memory_context = self.memory_context(query).await;
        turn.intent = self.classify(&query.text, turn).await?;
        turn.advance(QueryState::Classified);

        let route = route(&turn.intent);
        turn.advance(QueryState::Routed);
        debug!(?route, "Routed");

        let request = SpecialistRequest {
            query: query.text.clone(),
            entities: turn.intent.entities.clone(),
            memory_context,
            location: query.location.clone(),
            image: query.image.clone(),
        };

        let draft = match route {
            Route::Direct => self.answer_directly(&request, turn).await?,
            Route::Single(kind) => {
                turn.advance(QueryState::SingleDispatch);
                self.dispatch(vec![kind], &request, turn).await;
                self.synthesize(&query.text, turn).await?
            }
            Route::Multi(kinds) => {
                turn.advance(QueryState::MultiDispatch);
                self.dispatch(kinds, &request, turn).await;
                self.synthesize(&query.text, turn).await?
            }
        };

        let guardrail = self.settings.read(|s| Guardrail::from_config(&s.guardrail));
        let (response, verdict) = guardrail.apply(draft);
        if let Verdict::Replaced { pattern } = verdict {
            warn!(%pattern, "Answer replaced by guardrail");
            turn.diagnostics.push(Diagnostic::GuardrailReplaced { pattern });
        }
        turn.advance(QueryState::Guarded);
        Ok(response)
    }

    /// Classify with one stricter retry. Unusable output degrades to
    /// `general`; an exhausted model chain aborts the turn.
    async fn classify(&self, text: &str, turn: &mut Turn) -> Result<IntentClassification, Abort> {
        let prompts = [intent::classification_prompt(text), intent::strict_classification_prompt(text)];
        for (attempt, prompt) in prompts.into_iter().enumerate() {
            let output = match self
                .gateway
                .generate_with(GenerationRequest::new(prompt, ModelRole::Classifier))
                .await
            {
                Ok(output) => output,
                Err(e) => {
                    error!(error = %e, "Classifier unavailable");
                    turn.diagnostics.push(Diagnostic::ClassifierUnavailable { error: e.to_string() });
                    return Err(Abort::Classifier);
                }
            };

            if let Some(mut classification) = intent::parse_classification(&output) {
                if !classification.entities.contains_key("crop") {
                    if let Some(crop) = intent::crop_hint(text) {
                        classification.entities.insert("crop".into(), crop.into());
                    }
                }
                info!(
                    primary = %classification.primary_intent,
                    secondary = ?classification.secondary_intent,
                    confidence = classification.confidence,
                    "Query classified"
                );
                return Ok(classification);
            }
            warn!(attempt = attempt + 1, "Classifier output unparsable");
        }

        turn.diagnostics.push(Diagnostic::ClassificationFailure { attempts: 2 });
        turn.misclassified = true;
        let mut fallback = IntentClassification::general();
        if let Some(crop) = intent::crop_hint(text) {
            fallback.entities.insert("crop".into(), crop.into());
        }
        Ok(fallback)
    }

    /// Run the specialists concurrently, each under the per-agent timeout,
    /// and wait for all of them. A panicking specialist counts as failed.
    async fn dispatch(&self, kinds: Vec<SpecialistKind>, request: &SpecialistRequest, turn: &mut Turn) {
        let agent_timeout =
            Duration::from_millis(self.settings.read(|s| s.supervisor.agent_timeout_ms));

        let mut tasks = JoinSet::new();
        for kind in kinds {
            let specialist = self.specialists.read().get(&kind).cloned();
            let Some(specialist) = specialist else {
                warn!(agent = %kind, "No specialist registered");
                record_failure(turn, kind, "no specialist registered".into());
                continue;
            };
            let request = request.clone();
            tasks.spawn(async move {
                let work = AssertUnwindSafe(specialist.handle(&request)).catch_unwind();
                let outcome = tokio::time::timeout(agent_timeout, work).await;
                (kind, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((kind, Ok(Ok(Ok(response))))) => {
                    turn.sources.extend(response.sources.iter().cloned());
                    turn.agent_responses
                        .insert(kind.as_str().to_string(), AgentOutcome::Success(response));
                }
                Ok((kind, Ok(Ok(Err(e))))) => record_failure(turn, kind, e.to_string()),
                Ok((kind, Ok(Err(panic)))) => {
                    let error = format!("task panicked: {}", panic_message(panic.as_ref()));
                    record_failure(turn, kind, error);
                }
                Ok((kind, Err(_))) => {
                    let error = format!("timed out after {} ms", agent_timeout.as_millis());
                    record_failure(turn, kind, error);
                }
                Err(e) => error!(error = %e, "Specialist task panicked or was cancelled"),
            }
        }
    }

    /// One synthesis call over the successful responses. Falls back to the
    /// responses themselves when synthesis is unavailable.
    async fn synthesize(&self, question: &str, turn: &mut Turn) -> Result<String, Abort> {
        let successes: Vec<&SpecialistResponse> = turn
            .agent_responses
            .values()
            .filter_map(|outcome| match outcome {
                AgentOutcome::Success(response) => Some(response),
                AgentOutcome::Failed { .. } => None,
            })
            .collect();

        if successes.is_empty() {
            turn.diagnostics.push(Diagnostic::AllSpecialistsFailure);
            return Err(Abort::AllSpecialists);
        }

        let prompt = synthesis_prompt(question, &successes);
        let joined = successes
            .iter()
            .map(|r| r.text.trim())
            .collect::<Vec<_>>()
            .join("\n\n");

        let text = match self
            .gateway
            .generate_with(GenerationRequest::new(prompt, ModelRole::Synthesis))
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                turn.diagnostics.push(Diagnostic::SynthesisFallback { error: "empty synthesis".into() });
                joined
            }
            Err(e) => {
                warn!(error = %e, "Synthesis failed, joining specialist answers");
                turn.diagnostics.push(Diagnostic::SynthesisFallback { error: e.to_string() });
                joined
            }
        };
        turn.advance(QueryState::Synthesized);
        Ok(text)
    }

    /// General questions: one agent-role call over all active collections.
    async fn answer_directly(&self, request: &SpecialistRequest, turn: &mut Turn) -> Result<String, Abort> {
        let top_k = self.settings.read(|s| s.retrieval.top_k);
        let context = match self.retriever.retrieve(&request.query, None, top_k).await {
            Ok(context) => context,
            Err(e) => {
                warn!(error = %e, "Retrieval for direct answer failed");
                Default::default()
            }
        };
        turn.sources.extend(context.sources.iter().cloned());

        let mut prompt = String::from(
            "You are a friendly agricultural advisor for smallholder farmers in Telangana, India. \
             Answer the farmer's question simply and practically.\n",
        );
        if !request.memory_context.is_empty() {
            let _ = write!(prompt, "\nWhat we know about this farmer:\n{}\n", request.memory_context);
        }
        if !context.is_empty() {
            let _ = write!(prompt, "\nRelevant information:\n{}\n", context.text);
        }
        let _ = write!(prompt, "\nFarmer's question: {}", request.query);

        match self
            .gateway
            .generate_with(GenerationRequest::new(prompt, ModelRole::Agent))
            .await
        {
            Ok(text) => {
                turn.advance(QueryState::Synthesized);
                Ok(text.trim().to_string())
            }
            Err(e) => {
                turn.diagnostics.push(Diagnostic::DirectAnswerFailure { error: e.to_string() });
                Err(Abort::Direct)
            }
        }
    }

    fn spawn_background(&self, query: &Query, answer: &SynthesizedAnswer) {
        if answer.state == QueryState::Done {
            if let Some(memory) = self.memory.clone() {
                let user = query.user_id.clone();
                let text = query.text.clone();
                let response = answer.response.clone();
                self.background.spawn(async move {
                    memory.record_exchange(&user, &text, &response);
                    let stored = memory.add_from_conversation(&user, &text, &response).await;
                    debug!(user = %user, stored = stored.len(), "Memory updated");
                });
            }
        }

        if let Some(log) = self.conversation_log.clone() {
            let turn = LoggedTurn {
                user_id: query.user_id.clone(),
                session_id: query.session_id.clone(),
                query: query.text.clone(),
                response: answer.response.clone(),
                sources: answer.sources.iter().cloned().collect(),
                at: Utc::now(),
            };
            self.background.spawn(async move {
                if let Err(e) = log.save_turn(turn).await {
                    warn!(error = %e, "Failed to save conversation turn");
                }
            });
        }
    }
}

fn record_failure(turn: &mut Turn, kind: SpecialistKind, error: String) {
    warn!(agent = %kind, %error, "Specialist excluded from synthesis");
    turn.diagnostics.push(Diagnostic::SpecialistFailure { agent: kind, error: error.clone() });
    turn.agent_responses
        .insert(kind.as_str().to_string(), AgentOutcome::Failed { error });
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn synthesis_prompt(question: &str, responses: &[&SpecialistResponse]) -> String {
    let mut prompt = String::from(
        "You are the lead advisor of an agricultural assistant. Combine the specialist answers \
         below into one clear, farmer-friendly reply.\n\
         Rules:\n\
         1. Safety and weather constraints come first. If any specialist advises against \
         spraying or field work because of rain, wind or humidity, say clearly that the farmer \
         should not spray now and when to do it instead, even if another specialist recommends \
         treatment urgently.\n\
         2. Keep every concrete step, dose and warning. Remove repetition.\n\
         3. Keep source citations like [Source: ...].\n\
         4. If a specialist noted that live data was unavailable, mention it briefly.\n\n",
    );
    for response in responses {
        let _ = write!(prompt, "--- {} ---\n{}\n", response.agent, response.text.trim());
        if let Some(note) = &response.degraded {
            let _ = writeln!(prompt, "(note: {note})");
        }
        prompt.push('\n');
    }
    let _ = write!(prompt, "Farmer's question: {question}");
    prompt
}
