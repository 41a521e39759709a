//! Tolerant extraction of JSON from model output.
//!
//! Model text is untrusted: it may be wrapped in markdown fences or prose.
//! These helpers return `None` instead of failing so callers can degrade.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn fence_pattern() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").ok())
        .as_ref()
}

/// The body of the first fenced block, or the trimmed text when unfenced.
pub fn strip_code_fences(text: &str) -> &str {
    fence_pattern()
        .and_then(|re| re.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .unwrap_or_else(|| text.trim())
}

fn between<'a>(text: &'a str, open: char, close: char) -> Option<&'a str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

/// First JSON object in `text`: the whole text, else first `{` to last `}`.
pub fn extract_object(text: &str) -> Option<Value> {
    let body = strip_code_fences(text);
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(body) {
        return Some(value);
    }
    match serde_json::from_str::<Value>(between(body, '{', '}')?) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// A JSON array in `text`, also accepting `{"facts": [...]}` style wrappers.
pub fn extract_array(text: &str) -> Option<Vec<Value>> {
    let body = strip_code_fences(text);
    let parsed = serde_json::from_str::<Value>(body)
        .ok()
        .or_else(|| serde_json::from_str::<Value>(between(body, '[', ']')?).ok())?;

    match parsed {
        Value::Array(items) => Some(items),
        Value::Object(map) => map.into_iter().find_map(|(_, v)| match v {
            Value::Array(items) => Some(items),
            _ => None,
        }),
        _ => None,
    }
}
