use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, instrument};

use super::prompt::{compose, PromptParts};
use super::{
    references, AgentDeps, AgentHealth, Specialist, SpecialistCore, SpecialistKind,
    SpecialistRequest, SpecialistResponse,
};
use crate::error::AgentError;

const COLLECTIONS: &[&str] = &["soil_data", "farming_practices"];

const INSTRUCTIONS: &[&str] = &[
    "Assess soil health from the details given and the knowledge base.",
    "Recommend fertilizer doses (N, P, K) per acre with timing of application.",
    "Suggest organic amendments and a suitable crop rotation.",
    "Recommend a soil test at the nearest soil testing lab when values are unknown.",
];

// Nutrient content of the straight fertilizers used for the plan.
const UREA_N: f64 = 0.46;
const DAP_P: f64 = 0.46;
const MOP_K: f64 = 0.60;

// Subsidised retail prices, INR per kg.
const UREA_PRICE: f64 = 7.5;
const DAP_PRICE: f64 = 27.0;
const MOP_PRICE: f64 = 18.0;

/// Recommended N, P2O5, K2O in kg per acre.
fn npk_per_acre(crop: &str) -> (f64, f64, f64) {
    match crop.trim().to_lowercase().as_str() {
        "wheat" => (60.0, 30.0, 20.0),
        "rice" | "paddy" => (80.0, 40.0, 40.0),
        "maize" | "corn" => (90.0, 40.0, 30.0),
        "cotton" => (60.0, 30.0, 30.0),
        _ => (50.0, 25.0, 20.0),
    }
}

fn rotation_for(crop: &str) -> &'static str {
    match crop.trim().to_lowercase().as_str() {
        "rice" | "paddy" => "Rice → pulses (green gram or black gram) → rice, to restore nitrogen",
        "cotton" => "Cotton → groundnut or chickpea → jowar",
        "maize" | "corn" => "Maize → chickpea → vegetables",
        "chilli" | "chili" => "Chilli → maize or jowar; avoid tomato and brinjal on the same plot",
        _ => "Alternate cereals with pulses or oilseeds every season",
    }
}

/// Straight-fertilizer quantities for one crop and area.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FertilizerPlan {
    pub crop: String,
    pub acres: f64,
    pub nitrogen_kg: f64,
    pub phosphorus_kg: f64,
    pub potassium_kg: f64,
    pub urea_kg: f64,
    pub dap_kg: f64,
    pub mop_kg: f64,
    pub estimated_cost_inr: f64,
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub fn fertilizer_plan(crop: &str, acres: f64) -> FertilizerPlan {
    let acres = acres.max(0.0);
    let (n, p, k) = npk_per_acre(crop);
    let urea = n / UREA_N * acres;
    let dap = p / DAP_P * acres;
    let mop = k / MOP_K * acres;
    FertilizerPlan {
        crop: crop.trim().to_lowercase(),
        acres,
        nitrogen_kg: round1(n * acres),
        phosphorus_kg: round1(p * acres),
        potassium_kg: round1(k * acres),
        urea_kg: round1(urea),
        dap_kg: round1(dap),
        mop_kg: round1(mop),
        estimated_cost_inr: (urea * UREA_PRICE + dap * DAP_PRICE + mop * MOP_PRICE).round(),
    }
}

/// Leading number of a land size entity such as "2.5 acres".
fn parse_acres(value: &str) -> Option<f64> {
    let number: String = value
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    number.parse::<f64>().ok().filter(|a| *a > 0.0)
}

fn describe(plan: &FertilizerPlan) -> String {
    format!(
        "For {} acre(s) of {}: N {} kg, P2O5 {} kg, K2O {} kg. \
         That is about {} kg urea, {} kg DAP and {} kg MOP, costing roughly ₹{:.0}.",
        plan.acres,
        plan.crop,
        plan.nitrogen_kg,
        plan.phosphorus_kg,
        plan.potassium_kg,
        plan.urea_kg,
        plan.dap_kg,
        plan.mop_kg,
        plan.estimated_cost_inr
    )
}

/// Soil health, fertilizer dosing and rotation.
#[derive(Debug)]
pub struct SoilAgent {
    core: SpecialistCore,
}

impl SoilAgent {
    pub fn new(deps: AgentDeps) -> Self {
        Self { core: SpecialistCore::new(SpecialistKind::Soil, deps) }
    }

    async fn answer(&self, request: &SpecialistRequest) -> Result<SpecialistResponse, AgentError> {
        let knowledge = self.core.knowledge(&request.query, self.collections()).await?;

        let crop = request.entity("crop");
        let acres = request
            .entity("land_size")
            .or_else(|| request.entity("acres"))
            .and_then(parse_acres);
        let plan = match (crop, acres) {
            (Some(crop), Some(acres)) => Some(fertilizer_plan(crop, acres)),
            _ => None,
        };
        debug!(?crop, ?acres, planned = plan.is_some(), "Soil request");

        let mut external = Vec::new();
        if let Some(plan) = &plan {
            external.push(("Calculated fertilizer requirement".to_string(), describe(plan)));
        }
        if let Some(crop) = crop {
            external.push(("Suggested rotation".to_string(), rotation_for(crop).to_string()));
        }

        let prompt = compose(&PromptParts {
            persona: "a soil scientist",
            instructions: INSTRUCTIONS,
            query: &request.query,
            entities: &request.entities,
            memory: &request.memory_context,
            knowledge: &knowledge,
            external,
            degraded: None,
        });
        let text = self.core.generate(prompt).await?;

        let metadata = json!({
            "fertilizer_plan": plan,
            "rotation": crop.map(rotation_for),
            "references": references(&knowledge),
        });
        Ok(self.core.respond(text, &knowledge, metadata, None))
    }
}

#[async_trait]
impl Specialist for SoilAgent {
    fn kind(&self) -> SpecialistKind {
        SpecialistKind::Soil
    }

    fn collections(&self) -> &'static [&'static str] {
        COLLECTIONS
    }

    #[instrument(skip_all, fields(agent = "soil"))]
    async fn handle(&self, request: &SpecialistRequest) -> Result<SpecialistResponse, AgentError> {
        self.core.track(self.answer(request)).await
    }

    fn health(&self) -> AgentHealth {
        self.core.health()
    }
}
