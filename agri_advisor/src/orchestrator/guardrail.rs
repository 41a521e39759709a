use regex::Regex;
use tracing::warn;

use crate::settings::GuardrailConfig;

/// Keyword filter over the final answer. Flagged answers are replaced, not blocked.
#[derive(Debug, Clone)]
pub struct Guardrail {
    patterns: Vec<Regex>,
    replacement: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Pass,
    Replaced { pattern: String },
}

impl Guardrail {
    /// Invalid patterns are skipped with a warning; settings validation rejects them earlier.
    pub fn from_config(config: &GuardrailConfig) -> Self {
        let patterns = config
            .blocked_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "Skipping invalid guardrail pattern");
                    None
                }
            })
            .collect();
        Self { patterns, replacement: config.replacement.clone() }
    }

    pub fn check(&self, text: &str) -> Verdict {
        match self.patterns.iter().find(|re| re.is_match(text)) {
            Some(re) => Verdict::Replaced { pattern: re.as_str().to_string() },
            None => Verdict::Pass,
        }
    }

    /// The text to return and whether it was replaced.
    pub fn apply(&self, text: String) -> (String, Verdict) {
        match self.check(&text) {
            Verdict::Pass => (text, Verdict::Pass),
            verdict => (self.replacement.clone(), verdict),
        }
    }
}
