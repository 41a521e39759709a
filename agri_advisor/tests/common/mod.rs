//! Shared doubles for the integration tests.
#![allow(dead_code)]

use agri_advisor::agents::{
    AgentDeps, AgentHealth, Specialist, SpecialistKind, SpecialistRequest, SpecialistResponse,
};
use agri_advisor::error::{AgentError, BackendError, EmbeddingError, GenerationError, ServiceError};
use agri_advisor::llm::{CompletionRequest, LlmGateway, ModelRole, ScriptedBackend};
use agri_advisor::retrieval::{Embedder, KnowledgeRetriever, NewDocument};
use agri_advisor::services::{Forecast, MandiPrice, MarketService, Services, WeatherService};
use agri_advisor::settings::{Settings, SettingsHandle};
use agri_advisor::orchestrator::Supervisor;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Words mapped to shared dimensions so paraphrases embed close together.
const CONCEPTS: &[&[&str]] = &[
    &["rice", "paddy"],
    &["nalgonda"],
    &["cotton"],
    &["warangal"],
    &["tomato", "tomatoes"],
    &["whitefly", "whiteflies", "white", "fly", "flies"],
    &["spray", "spraying"],
    &["rain", "rainfall", "shower"],
    &["npk", "fertilizer", "nitrogen", "urea"],
    &["soil", "soils"],
    &["price", "prices", "mandi", "market"],
    &["scheme", "subsidy"],
];

const NOISE_DIMS: usize = 48;

/// Deterministic embedder: concept words dominate, other words add a little noise.
#[derive(Debug, Default)]
pub struct ConceptEmbedder;

impl ConceptEmbedder {
    fn dimension_of(word: &str) -> (usize, f32) {
        match CONCEPTS.iter().position(|group| group.contains(&word)) {
            Some(i) => (i, 1.0),
            None => {
                let hash = word.bytes().fold(7usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize));
                (CONCEPTS.len() + hash % NOISE_DIMS, 0.1)
            }
        }
    }
}

#[async_trait]
impl Embedder for ConceptEmbedder {
    fn dimension(&self) -> usize {
        CONCEPTS.len() + NOISE_DIMS
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vector = vec![0.0f32; self.dimension()];
        let lower = text.to_lowercase();
        let words = lower.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty());
        let mut any = false;
        for word in words {
            let (dim, weight) = Self::dimension_of(word);
            vector[dim] = weight.max(vector[dim]);
            any = true;
        }
        if !any {
            return Err(EmbeddingError::EmptyInput);
        }
        Ok(vector)
    }
}

/// Fast retries, short timeouts.
pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.llm.retry_base_delay_ms = 1;
    settings.llm.max_retries = 1;
    settings.supervisor.agent_timeout_ms = 2_000;
    settings.supervisor.query_timeout_ms = 5_000;
    settings
}

#[derive(Debug)]
pub struct FixedWeather {
    pub summary: &'static str,
}

#[async_trait]
impl WeatherService for FixedWeather {
    async fn get_forecast(&self, location: &str) -> Result<Forecast, ServiceError> {
        Ok(Forecast {
            location: location.to_string(),
            summary: self.summary.to_string(),
            temperature_c: 29.0,
            humidity_pct: 65.0,
            wind_speed_ms: 2.5,
        })
    }
}

#[derive(Debug)]
pub struct DownWeather;

#[async_trait]
impl WeatherService for DownWeather {
    async fn get_forecast(&self, _location: &str) -> Result<Forecast, ServiceError> {
        Err(ServiceError::Unavailable("upstream 503".into()))
    }
}

#[derive(Debug)]
pub struct FixedMarket;

#[async_trait]
impl MarketService for FixedMarket {
    async fn get_prices(&self, crop: &str, _market: Option<&str>) -> Result<Vec<MandiPrice>, ServiceError> {
        Ok(vec![
            MandiPrice {
                market: "Warangal".into(),
                crop: crop.to_string(),
                min_price: 6_800.0,
                max_price: 7_250.0,
                modal_price: 7_050.0,
            },
            MandiPrice {
                market: "Khammam".into(),
                crop: crop.to_string(),
                min_price: 6_900.0,
                max_price: 7_400.0,
                modal_price: 7_100.0,
            },
        ])
    }
}

/// Specialist double that sleeps before answering or fails outright.
#[derive(Debug)]
pub struct StubSpecialist {
    pub kind: SpecialistKind,
    pub delay: Duration,
    pub fail: bool,
}

#[async_trait]
impl Specialist for StubSpecialist {
    fn kind(&self) -> SpecialistKind {
        self.kind
    }

    fn collections(&self) -> &'static [&'static str] {
        &[]
    }

    async fn handle(&self, _request: &SpecialistRequest) -> Result<SpecialistResponse, AgentError> {
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(AgentError::Generation(GenerationError {
                role: ModelRole::Agent,
                attempts: 3,
                last_error: "stubbed failure".into(),
            }));
        }
        Ok(SpecialistResponse {
            agent: self.kind,
            text: format!("{} says hello", self.kind),
            sources: vec![],
            metadata: json!({}),
            degraded: None,
        })
    }

    fn health(&self) -> AgentHealth {
        AgentHealth {
            status: "healthy".into(),
            uptime_seconds: 0,
            total_requests: 0,
            error_count: 0,
            average_response_time_ms: 0.0,
        }
    }
}

/// Specialist whose handler panics.
#[derive(Debug)]
pub struct PanickingSpecialist {
    pub kind: SpecialistKind,
}

#[async_trait]
impl Specialist for PanickingSpecialist {
    fn kind(&self) -> SpecialistKind {
        self.kind
    }

    fn collections(&self) -> &'static [&'static str] {
        &[]
    }

    async fn handle(&self, _request: &SpecialistRequest) -> Result<SpecialistResponse, AgentError> {
        panic!("sensor table corrupted")
    }

    fn health(&self) -> AgentHealth {
        AgentHealth {
            status: "healthy".into(),
            uptime_seconds: 0,
            total_requests: 0,
            error_count: 0,
            average_response_time_ms: 0.0,
        }
    }
}

/// `ConceptEmbedder` behind a fixed delay.
#[derive(Debug)]
pub struct SlowEmbedder {
    pub delay: Duration,
}

#[async_trait]
impl Embedder for SlowEmbedder {
    fn dimension(&self) -> usize {
        ConceptEmbedder.dimension()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        tokio::time::sleep(self.delay).await;
        ConceptEmbedder.embed(text).await
    }
}

pub fn classification(primary: &str, secondary: Option<&str>, crop: &str) -> String {
    json!({
        "primary_intent": primary,
        "secondary_intent": secondary,
        "entities": {"crop": crop},
        "language_detected": "en",
        "confidence": 0.9,
    })
    .to_string()
}

/// Marker phrases identifying each prompt kind.
pub fn is_classifier(prompt: &str) -> bool {
    prompt.contains("Classify the farmer's question") || prompt.starts_with("Return ONLY a single JSON object")
}

pub fn is_extraction(prompt: &str) -> bool {
    prompt.starts_with("You extract durable facts")
}

pub fn is_synthesis(prompt: &str) -> bool {
    prompt.starts_with("You are the lead advisor")
}

/// A backend answering each prompt kind through `route`; extraction returns `[]`.
pub fn advisor_backend<F>(route: F) -> Arc<ScriptedBackend>
where
    F: Fn(&str) -> Result<String, BackendError> + Send + Sync + 'static,
{
    Arc::new(ScriptedBackend::new("scripted", move |req: &CompletionRequest| {
        if is_extraction(&req.prompt) {
            return Ok("[]".into());
        }
        route(&req.prompt)
    }))
}

pub struct Harness {
    pub settings: SettingsHandle,
    pub gateway: Arc<LlmGateway>,
    pub retriever: Arc<KnowledgeRetriever>,
    pub embedder: Arc<ConceptEmbedder>,
}

impl Harness {
    pub fn new(settings: Settings, primary: Arc<ScriptedBackend>, secondary: Option<Arc<ScriptedBackend>>) -> Self {
        let settings = SettingsHandle::new(settings);
        let secondary = secondary.map(|s| s as Arc<dyn agri_advisor::llm::ModelBackend>);
        let gateway = Arc::new(LlmGateway::new(settings.clone(), primary, secondary));
        let embedder = Arc::new(ConceptEmbedder);
        let retriever = Arc::new(KnowledgeRetriever::new(settings.clone(), embedder.clone()));
        Self { settings, gateway, retriever, embedder }
    }

    pub async fn seed_knowledge(&self) {
        self.retriever
            .add_documents(
                "crop_diseases",
                vec![
                    NewDocument::new(
                        "Whitefly on tomato: leaves turn yellow and sticky. Spray neem oil 5 ml per \
                         litre of water and put up yellow sticky traps.",
                    )
                    .with_id("whitefly")
                    .with_metadata("name", "Whitefly")
                    .with_metadata("source", "crop_diseases.json"),
                    NewDocument::new("Blast in paddy: spindle shaped spots on rice leaves.")
                        .with_id("blast")
                        .with_metadata("name", "Rice blast"),
                ],
            )
            .await
            .expect("seed crop_diseases");
        self.retriever
            .add_documents(
                "farming_practices",
                vec![NewDocument::new(
                    "Spraying practice: never spray when rain is expected within 24 hours.",
                )
                .with_id("spray-timing")
                .with_metadata("title", "Spray timing")],
            )
            .await
            .expect("seed farming_practices");
    }

    pub fn deps(&self, services: Services) -> AgentDeps {
        AgentDeps {
            gateway: self.gateway.clone(),
            retriever: self.retriever.clone(),
            services,
            settings: self.settings.clone(),
        }
    }

    pub fn supervisor(&self, services: Services) -> Supervisor {
        Supervisor::new(self.deps(services))
    }
}
