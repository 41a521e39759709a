//! Prompts for fact extraction and duplicate adjudication, and validation of
//! what the model sends back.

use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

use super::MemoryCategory;
use crate::parsing;

/// A fact proposed by the model, already validated.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateFact {
    pub fact: String,
    pub category: MemoryCategory,
    pub importance: u8,
}

impl CandidateFact {
    pub fn new(fact: impl Into<String>, category: MemoryCategory, importance: u8) -> Self {
        Self {
            fact: fact.into(),
            category,
            importance: importance.clamp(1, 10),
        }
    }
}

/// Outcome of asking the model about a near-duplicate.
#[derive(Debug, Clone, PartialEq)]
pub enum DedupDecision {
    New,
    Duplicate,
    Update { id: Uuid, merged: String },
}

fn truncate(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

pub fn extraction_prompt(user_message: &str, assistant_message: &str, char_limit: usize) -> String {
    let categories = MemoryCategory::ALL
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "You extract durable facts about a farmer from one conversation turn.\n\
         Only keep facts about the farmer themselves: land, crops, location, equipment, \
         livestock, soil, preferences, past experience or finances. Skip questions, greetings \
         and general advice given by the assistant.\n\n\
         Return ONLY a JSON array. Each item must be \
         {{\"fact\": \"<short statement>\", \"category\": \"<one of: {categories}>\", \
         \"importance\": <integer 1-10>}}.\n\
         Return [] when nothing is worth remembering.\n\n\
         Farmer: {}\n\
         Assistant: {}",
        truncate(user_message, char_limit),
        truncate(assistant_message, char_limit),
    )
}

pub fn dedup_prompt(new_fact: &str, existing: &[(Uuid, String)]) -> String {
    let listing = existing
        .iter()
        .map(|(id, content)| format!("[{id}] {content}"))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Decide whether a new fact about a farmer repeats one of the existing facts.\n\n\
         Existing facts:\n{listing}\n\n\
         New fact: {new_fact}\n\n\
         Reply with ONLY a JSON object: {{\"action\": \"new\" | \"duplicate\" | \"update\", \
         \"update_id\": \"<id of the matching existing fact>\", \
         \"merged_fact\": \"<combined statement when action is update>\"}}"
    )
}

fn importance_of(value: Option<&Value>) -> u8 {
    let raw = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    raw.map(|v| v.round().clamp(1.0, 10.0) as u8).unwrap_or(5)
}

/// Validate extraction output. Anything malformed yields no facts.
pub fn parse_candidates(text: &str) -> Vec<CandidateFact> {
    let Some(items) = parsing::extract_array(text) else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let fact = obj
                .get("fact")
                .or_else(|| obj.get("content"))
                .and_then(Value::as_str)?
                .trim();
            if fact.is_empty() || !seen.insert(fact.to_lowercase()) {
                return None;
            }
            let category = obj
                .get("category")
                .and_then(Value::as_str)
                .and_then(MemoryCategory::parse)
                .unwrap_or(MemoryCategory::Personal);
            Some(CandidateFact::new(fact, category, importance_of(obj.get("importance"))))
        })
        .collect()
}

/// Validate adjudication output. Unusable answers mean "new".
pub fn parse_dedup(text: &str, known: &[Uuid]) -> DedupDecision {
    let Some(obj) = parsing::extract_object(text) else {
        return DedupDecision::New;
    };
    let action = obj
        .get("action")
        .and_then(Value::as_str)
        .map(|a| a.trim().to_lowercase());

    match action.as_deref() {
        Some("duplicate") => DedupDecision::Duplicate,
        Some("update") => {
            let id = obj
                .get("update_id")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s.trim().trim_matches(['[', ']'])).ok())
                .filter(|id| known.contains(id));
            let merged = obj
                .get("merged_fact")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|m| !m.is_empty());
            match (id, merged) {
                (Some(id), Some(merged)) => DedupDecision::Update { id, merged: merged.to_string() },
                _ => DedupDecision::New,
            }
        }
        _ => DedupDecision::New,
    }
}
