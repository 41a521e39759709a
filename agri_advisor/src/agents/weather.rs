use async_trait::async_trait;
use serde_json::json;
use tracing::{instrument, warn};

use super::prompt::{compose, PromptParts};
use super::{
    references, AgentDeps, AgentHealth, Specialist, SpecialistCore, SpecialistKind,
    SpecialistRequest, SpecialistResponse,
};
use crate::error::AgentError;
use crate::services::{check_spray_conditions, Forecast, SprayAdvice};

const COLLECTIONS: &[&str] = &["farming_practices"];

const INSTRUCTIONS: &[&str] = &[
    "Explain what the forecast means for field work in the next 24-48 hours.",
    "State plainly whether spraying, irrigation or harvesting should happen now or wait.",
    "Suggest protective steps for crops and stored produce.",
];

/// Forecast interpretation and field-operation timing.
#[derive(Debug)]
pub struct WeatherAgent {
    core: SpecialistCore,
}

fn describe(forecast: &Forecast, advice: &SprayAdvice) -> String {
    let verdict = if advice.suitable {
        "Spraying conditions: suitable now.".to_string()
    } else {
        format!("Spraying conditions: do not spray now. {}.", advice.reasons.join("; "))
    };
    format!(
        "{}: {}, {:.1}°C, humidity {:.0}%, wind {:.1} m/s\n{}",
        forecast.location,
        forecast.summary,
        forecast.temperature_c,
        forecast.humidity_pct,
        forecast.wind_speed_ms,
        verdict
    )
}

impl WeatherAgent {
    pub fn new(deps: AgentDeps) -> Self {
        Self { core: SpecialistCore::new(SpecialistKind::Weather, deps) }
    }

    async fn forecast(&self, request: &SpecialistRequest) -> Result<Forecast, String> {
        let Some(location) = request.location() else {
            return Err("no location was given, so no live forecast was used".into());
        };
        let Some(weather) = self.core.services().weather.clone() else {
            return Err("the weather service is not available, advice is general".into());
        };
        weather.get_forecast(location).await.map_err(|e| {
            warn!(location, error = %e, "Forecast lookup failed");
            "the live forecast could not be fetched, advice is general".to_string()
        })
    }

    async fn answer(&self, request: &SpecialistRequest) -> Result<SpecialistResponse, AgentError> {
        let knowledge = self.core.knowledge(&request.query, self.collections()).await?;

        let (forecast, degraded) = match self.forecast(request).await {
            Ok(forecast) => (Some(forecast), None),
            Err(note) => (None, Some(note)),
        };
        let spray = forecast.as_ref().map(check_spray_conditions);

        let mut external = Vec::new();
        if let (Some(forecast), Some(advice)) = (&forecast, &spray) {
            external.push(("Current forecast".to_string(), describe(forecast, advice)));
        }

        let prompt = compose(&PromptParts {
            persona: "an agricultural weather advisor",
            instructions: INSTRUCTIONS,
            query: &request.query,
            entities: &request.entities,
            memory: &request.memory_context,
            knowledge: &knowledge,
            external,
            degraded: degraded.as_deref(),
        });
        let text = self.core.generate(prompt).await?;

        let metadata = json!({
            "forecast": forecast,
            "spray": spray,
            "references": references(&knowledge),
        });
        Ok(self.core.respond(text, &knowledge, metadata, degraded))
    }
}

#[async_trait]
impl Specialist for WeatherAgent {
    fn kind(&self) -> SpecialistKind {
        SpecialistKind::Weather
    }

    fn collections(&self) -> &'static [&'static str] {
        COLLECTIONS
    }

    #[instrument(skip_all, fields(agent = "weather"))]
    async fn handle(&self, request: &SpecialistRequest) -> Result<SpecialistResponse, AgentError> {
        self.core.track(self.answer(request)).await
    }

    fn health(&self) -> AgentHealth {
        self.core.health()
    }
}
