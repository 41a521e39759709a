//! Bulk ingestion of JSON knowledge files.
//!
//! A knowledge file holds either a bare array of records or an object with
//! the records under a root key. Each record is flattened into
//! `Label: value` lines so the embedding sees every field.

use serde_json::{Map, Value};
use std::path::Path;
use tracing::{info, warn};

use super::{KnowledgeRetriever, NewDocument};
use crate::error::RetrievalError;

/// Known file stems and the root key their records live under.
const ROOT_KEYS: &[(&str, &str)] = &[
    ("crop_diseases", "crop_diseases"),
    ("farming_practices", "farming_practices"),
    ("government_schemes", "schemes"),
    ("market_data", "market_data"),
    ("soil_data", "soils"),
];

/// Scalar fields copied into document metadata for filtering and titles.
const METADATA_FIELDS: &[&str] = &[
    "name", "title", "crop", "category", "state", "commodity", "market", "soil_type",
];

impl KnowledgeRetriever {
    /// Flatten and upsert a batch of JSON records into `collection`.
    pub async fn ingest_records(
        &self,
        collection: &str,
        source: &str,
        records: &[Value],
    ) -> Result<usize, RetrievalError> {
        let mut documents = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            let Value::Object(fields) = record else {
                return Err(RetrievalError::Ingestion(format!(
                    "record {index} in '{source}' is not an object"
                )));
            };
            let text = flatten_record(fields);
            if text.is_empty() {
                warn!(source, index, "Skipping empty record");
                continue;
            }

            let record_id = record_id(fields).unwrap_or_else(|| format!("{collection}_{index}"));
            let mut doc = NewDocument::new(text)
                .with_id(record_id.clone())
                .with_metadata("source", source)
                .with_metadata("record_id", record_id);
            for field in METADATA_FIELDS {
                if let Some(value) = fields.get(*field).filter(|v| v.is_string() || v.is_number()) {
                    doc = doc.with_metadata(field, value.clone());
                }
            }
            documents.push(doc);
        }

        let count = documents.len();
        if count > 0 {
            self.add_documents(collection, documents).await?;
        }
        info!(collection, source, count, "Ingested records");
        Ok(count)
    }

    /// Ingest one knowledge file; the collection is the file stem.
    pub async fn ingest_file(&self, path: &Path) -> Result<(String, usize), RetrievalError> {
        let collection = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase())
            .ok_or_else(|| {
                RetrievalError::Ingestion(format!("invalid file name: {}", path.display()))
            })?;
        let source = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(&collection)
            .to_string();

        let bytes = tokio::fs::read(path).await?;
        let root: Value = serde_json::from_slice(&bytes)
            .map_err(|e| RetrievalError::Ingestion(format!("{source}: {e}")))?;
        let records = records_of(&collection, root).ok_or_else(|| {
            RetrievalError::Ingestion(format!("{source}: no record array found"))
        })?;

        let count = self.ingest_records(&collection, &source, &records).await?;
        Ok((collection, count))
    }

    /// Ingest every `*.json` file in `dir`, in file name order.
    pub async fn ingest_directory(&self, dir: &Path) -> Result<Vec<(String, usize)>, RetrievalError> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut results = Vec::with_capacity(paths.len());
        for path in paths {
            results.push(self.ingest_file(&path).await?);
        }
        Ok(results)
    }
}

fn records_of(collection: &str, root: Value) -> Option<Vec<Value>> {
    match root {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => {
            let known = ROOT_KEYS
                .iter()
                .find(|(stem, _)| *stem == collection)
                .map(|(_, key)| *key)
                .unwrap_or(collection);
            match map.remove(known) {
                Some(Value::Array(items)) => Some(items),
                _ => map.into_iter().find_map(|(_, v)| match v {
                    Value::Array(items) => Some(items),
                    _ => None,
                }),
            }
        }
        _ => None,
    }
}

fn record_id(fields: &Map<String, Value>) -> Option<String> {
    match fields.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `crop_name` becomes `Crop Name`.
fn label(key: &str) -> String {
    key.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(render_value).collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        Value::Object(map) => {
            let parts: Vec<String> = map
                .iter()
                .filter_map(|(k, v)| render_value(v).map(|v| format!("{k}: {v}")))
                .collect();
            (!parts.is_empty()).then(|| parts.join("; "))
        }
        other => scalar(other).filter(|s| !s.trim().is_empty()),
    }
}

/// One `Label: value` line per non-empty field, `id` excluded.
pub(crate) fn flatten_record(fields: &Map<String, Value>) -> String {
    fields
        .iter()
        .filter(|(key, _)| key.as_str() != "id")
        .filter_map(|(key, value)| render_value(value).map(|v| format!("{}: {}", label(key), v)))
        .collect::<Vec<_>>()
        .join("\n")
}
