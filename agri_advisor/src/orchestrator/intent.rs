//! Intent labels, classifier prompts and validation of classifier output.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::parsing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    CropDisease,
    MarketPrice,
    GovernmentScheme,
    Weather,
    SoilHealth,
    General,
}

impl Intent {
    pub const ALL: [Intent; 6] = [
        Intent::CropDisease,
        Intent::MarketPrice,
        Intent::GovernmentScheme,
        Intent::Weather,
        Intent::SoilHealth,
        Intent::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::CropDisease => "crop_disease",
            Intent::MarketPrice => "market_price",
            Intent::GovernmentScheme => "government_scheme",
            Intent::Weather => "weather",
            Intent::SoilHealth => "soil_health",
            Intent::General => "general",
        }
    }

    /// Lenient label parsing: case, spaces and hyphens are ignored.
    pub fn parse(label: &str) -> Option<Self> {
        let normalized = label.trim().to_lowercase().replace([' ', '-'], "_");
        Self::ALL.into_iter().find(|i| i.as_str() == normalized)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentClassification {
    pub primary_intent: Intent,
    pub secondary_intent: Option<Intent>,
    pub entities: BTreeMap<String, String>,
    /// In `[0, 1]`.
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_detected: Option<String>,
}

impl IntentClassification {
    /// The degraded result used when the classifier cannot be understood.
    pub fn general() -> Self {
        Self {
            primary_intent: Intent::General,
            secondary_intent: None,
            entities: BTreeMap::new(),
            confidence: 0.0,
            language_detected: None,
        }
    }
}

const KNOWN_CROPS: &[&str] = &[
    "rice", "paddy", "wheat", "maize", "corn", "cotton", "chilli", "chili", "tomato", "onion",
    "potato", "groundnut", "soybean", "sugarcane", "turmeric", "brinjal", "mango", "banana",
    "jowar", "bajra", "ragi", "redgram", "chickpea", "mustard", "sunflower",
];

/// First known crop mentioned in the text.
pub fn crop_hint(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    words.iter().find_map(|w| {
        KNOWN_CROPS
            .iter()
            .copied()
            .find(|crop| *w == *crop || w.strip_suffix('s') == Some(*crop) || w.strip_suffix("es") == Some(*crop))
    })
}

fn categories() -> String {
    Intent::ALL.iter().map(|i| i.as_str()).collect::<Vec<_>>().join(", ")
}

pub fn classification_prompt(query: &str) -> String {
    format!(
        "You are the supervisor of an agricultural advisory assistant for farmers in Telangana.\n\n\
         Your job:\n\
         1. Classify the farmer's question into a primary category and, when the question \
         clearly covers a second topic, a secondary category.\n\
         2. Extract key entities such as crop, location, symptoms, land_size, market.\n\
         3. Return structured JSON with routing information.\n\n\
         Categories: {}\n\n\
         Respond in JSON with keys: primary_intent, secondary_intent (or null), entities \
         (object of strings), language_detected, confidence (0 to 1).\n\n\
         Farmer's question: {query}",
        categories()
    )
}

/// Stricter retry after unparsable output.
pub fn strict_classification_prompt(query: &str) -> String {
    format!(
        "Return ONLY a single JSON object and nothing else. No markdown, no explanation.\n\
         Schema: {{\"primary_intent\": one of [{}], \"secondary_intent\": one of the same or null, \
         \"entities\": {{\"<name>\": \"<value>\"}}, \"language_detected\": \"<code>\", \
         \"confidence\": <number 0-1>}}\n\n\
         Question: {query}",
        categories()
    )
}

fn entity_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(entity_text)
            .collect::<Vec<_>>()
            .join(", "),
        Value::Null | Value::Object(_) => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Validate classifier output. `None` means the output was unusable.
pub fn parse_classification(text: &str) -> Option<IntentClassification> {
    let value = parsing::extract_object(text)?;
    let obj = value.as_object()?;

    let primary = obj.get("primary_intent").and_then(Value::as_str).and_then(Intent::parse)?;
    let secondary = obj
        .get("secondary_intent")
        .and_then(Value::as_str)
        .and_then(Intent::parse)
        .filter(|s| *s != primary);

    let entities = obj
        .get("entities")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| Some((k.trim().to_lowercase(), entity_text(v)?)))
                .collect()
        })
        .unwrap_or_default();

    let confidence = match obj.get("confidence") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|c| c.is_finite())
    .map(|c| c.clamp(0.0, 1.0) as f32)
    .unwrap_or(0.0);

    let language_detected = obj
        .get("language_detected")
        .and_then(Value::as_str)
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty());

    Some(IntentClassification {
        primary_intent: primary,
        secondary_intent: secondary,
        entities,
        confidence,
        language_detected,
    })
}
