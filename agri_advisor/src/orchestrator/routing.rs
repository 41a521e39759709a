//! Intent to specialist mapping. A pure function of the classification.

use super::intent::{Intent, IntentClassification};
use crate::agents::SpecialistKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Answered by the supervisor itself.
    Direct,
    Single(SpecialistKind),
    /// Distinct specialists, primary first.
    Multi(Vec<SpecialistKind>),
}

impl Route {
    pub fn specialists(&self) -> Vec<SpecialistKind> {
        match self {
            Route::Direct => Vec::new(),
            Route::Single(kind) => vec![*kind],
            Route::Multi(kinds) => kinds.clone(),
        }
    }
}

pub fn specialist_for(intent: Intent) -> Option<SpecialistKind> {
    match intent {
        Intent::CropDisease => Some(SpecialistKind::CropDoctor),
        Intent::MarketPrice => Some(SpecialistKind::Market),
        Intent::GovernmentScheme => Some(SpecialistKind::Scheme),
        Intent::Weather => Some(SpecialistKind::Weather),
        Intent::SoilHealth => Some(SpecialistKind::Soil),
        Intent::General => None,
    }
}

pub fn route(classification: &IntentClassification) -> Route {
    let mut kinds = Vec::with_capacity(2);
    let intents = std::iter::once(classification.primary_intent).chain(classification.secondary_intent);
    for kind in intents.filter_map(specialist_for) {
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    match kinds.len() {
        0 => Route::Direct,
        1 => Route::Single(kinds[0]),
        _ => Route::Multi(kinds),
    }
}
