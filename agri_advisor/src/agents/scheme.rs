use async_trait::async_trait;
use serde_json::json;
use tracing::instrument;

use super::prompt::{compose, PromptParts};
use super::{
    references, AgentDeps, AgentHealth, Specialist, SpecialistCore, SpecialistKind,
    SpecialistRequest, SpecialistResponse,
};
use crate::error::AgentError;

const COLLECTIONS: &[&str] = &["government_schemes"];

const INSTRUCTIONS: &[&str] = &[
    "List the schemes the farmer is likely eligible for, with the benefit amount.",
    "Explain eligibility and the documents needed.",
    "Give the application steps and where to apply (online portal, Rythu Vedika, bank).",
];

/// Government scheme eligibility and application guidance.
#[derive(Debug)]
pub struct SchemeAgent {
    core: SpecialistCore,
}

impl SchemeAgent {
    pub fn new(deps: AgentDeps) -> Self {
        Self { core: SpecialistCore::new(SpecialistKind::Scheme, deps) }
    }

    async fn answer(&self, request: &SpecialistRequest) -> Result<SpecialistResponse, AgentError> {
        let knowledge = self.core.knowledge(&request.query, self.collections()).await?;

        let prompt = compose(&PromptParts {
            persona: "a government scheme advisor for farmers",
            instructions: INSTRUCTIONS,
            query: &request.query,
            entities: &request.entities,
            memory: &request.memory_context,
            knowledge: &knowledge,
            external: Vec::new(),
            degraded: None,
        });
        let text = self.core.generate(prompt).await?;

        let metadata = json!({ "references": references(&knowledge) });
        Ok(self.core.respond(text, &knowledge, metadata, None))
    }
}

#[async_trait]
impl Specialist for SchemeAgent {
    fn kind(&self) -> SpecialistKind {
        SpecialistKind::Scheme
    }

    fn collections(&self) -> &'static [&'static str] {
        COLLECTIONS
    }

    #[instrument(skip_all, fields(agent = "scheme"))]
    async fn handle(&self, request: &SpecialistRequest) -> Result<SpecialistResponse, AgentError> {
        self.core.track(self.answer(request)).await
    }

    fn health(&self) -> AgentHealth {
        self.core.health()
    }
}
