use std::collections::BTreeMap;
use std::fmt::Write;

use crate::retrieval::RetrievedContext;

/// Pieces of a specialist prompt. Empty sections are left out.
pub(crate) struct PromptParts<'a> {
    pub persona: &'a str,
    pub instructions: &'a [&'a str],
    pub query: &'a str,
    pub entities: &'a BTreeMap<String, String>,
    pub memory: &'a str,
    pub knowledge: &'a RetrievedContext,
    pub external: Vec<(String, String)>,
    pub degraded: Option<&'a str>,
}

pub(crate) fn compose(parts: &PromptParts<'_>) -> String {
    let mut prompt = format!(
        "You are {}, advising smallholder farmers in Telangana, India.\n\n",
        parts.persona
    );

    for (i, line) in parts.instructions.iter().enumerate() {
        let _ = writeln!(prompt, "{}. {}", i + 1, line);
    }
    prompt.push_str(
        "Keep the language simple and practical. Give quantities per acre and costs in INR \
         where relevant.\n",
    );

    if !parts.memory.trim().is_empty() {
        let _ = write!(
            prompt,
            "\nWhat we know about this farmer (use it to personalise, do not repeat it back):\n{}\n",
            parts.memory.trim()
        );
    }

    if parts.knowledge.is_empty() {
        prompt.push_str("\nNo matching knowledge base entries were found; rely on general agronomy.\n");
    } else {
        let _ = write!(
            prompt,
            "\nRelevant knowledge base information. Cite it as [Source: <source name>] when used.\n{}\n",
            parts.knowledge.text
        );
    }

    for (label, body) in &parts.external {
        let _ = write!(prompt, "\n{label}:\n{body}\n");
    }

    if let Some(note) = parts.degraded {
        let _ = write!(prompt, "\nNote: {note}. Say so briefly in the answer.\n");
    }

    if !parts.entities.is_empty() {
        let listed = parts
            .entities
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = write!(prompt, "\nDetected details: {listed}\n");
    }

    let _ = write!(prompt, "\nFarmer's question: {}", parts.query);
    prompt
}
