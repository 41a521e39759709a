use async_trait::async_trait;
use serde_json::json;
use tracing::{info, instrument, warn};

use super::prompt::{compose, PromptParts};
use super::{
    references, AgentDeps, AgentHealth, Specialist, SpecialistCore, SpecialistKind,
    SpecialistRequest, SpecialistResponse,
};
use crate::error::AgentError;
use crate::services::ImageDiagnosis;

const COLLECTIONS: &[&str] = &["crop_diseases", "farming_practices"];

const INSTRUCTIONS: &[&str] = &[
    "Identify the most likely pest or disease from the symptoms described.",
    "Recommend treatment: organic options first, then chemical with dose per litre of water.",
    "Give prevention tips for the next season.",
    "Say when the farmer should contact the local agriculture officer.",
];

/// Pest and disease diagnosis, optionally from a leaf photo.
#[derive(Debug)]
pub struct CropDoctor {
    core: SpecialistCore,
}

impl CropDoctor {
    pub fn new(deps: AgentDeps) -> Self {
        Self { core: SpecialistCore::new(SpecialistKind::CropDoctor, deps) }
    }

    async fn diagnose(&self, request: &SpecialistRequest) -> (Option<ImageDiagnosis>, Option<String>) {
        let Some(image) = request.image.as_deref() else {
            return (None, None);
        };
        let Some(vision) = self.core.services().vision.clone() else {
            return (None, Some("image analysis is not available, diagnosis is from the description only".into()));
        };
        match vision.analyze_image(image).await {
            Ok(diagnosis) => {
                info!(label = %diagnosis.label, confidence = diagnosis.confidence, "Image diagnosed");
                (Some(diagnosis), None)
            }
            Err(e) => {
                warn!(error = %e, "Image analysis failed");
                (None, Some("image analysis failed, diagnosis is from the description only".into()))
            }
        }
    }

    async fn answer(&self, request: &SpecialistRequest) -> Result<SpecialistResponse, AgentError> {
        let (diagnosis, degraded) = self.diagnose(request).await;

        let search = match &diagnosis {
            Some(d) => format!("{} {}", request.query, d.label),
            None => request.query.clone(),
        };
        let knowledge = self.core.knowledge(&search, self.collections()).await?;

        let mut external = Vec::new();
        if let Some(d) = &diagnosis {
            external.push((
                "Image analysis".to_string(),
                format!("{} (confidence {:.0}%)", d.label, d.confidence * 100.0),
            ));
        }

        let prompt = compose(&PromptParts {
            persona: "Dr. Krishi, an expert plant pathologist",
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
            "diagnosis": diagnosis,
            "references": references(&knowledge),
        });
        Ok(self.core.respond(text, &knowledge, metadata, degraded))
    }
}

#[async_trait]
impl Specialist for CropDoctor {
    fn kind(&self) -> SpecialistKind {
        SpecialistKind::CropDoctor
    }

    fn collections(&self) -> &'static [&'static str] {
        COLLECTIONS
    }

    #[instrument(skip_all, fields(agent = "crop_doctor"))]
    async fn handle(&self, request: &SpecialistRequest) -> Result<SpecialistResponse, AgentError> {
        self.core.track(self.answer(request)).await
    }

    fn health(&self) -> AgentHealth {
        self.core.health()
    }
}
