//! Per-user long-term memory.
//!
//! Facts are extracted from conversation turns by the classifier model,
//! deduplicated semantically against the user's existing records and ranked
//! by relevance, importance and recency when injected into prompts. A short
//! rolling buffer of recent turns is kept beside the long-term records.

mod extraction;

pub use extraction::{CandidateFact, DedupDecision};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::MemoryError;
use crate::llm::{GenerationRequest, LlmGateway, ModelRole};
use crate::retrieval::{cosine, Embedder};
use crate::settings::SettingsHandle;

/// Number of recent messages rendered in the memory context.
const RECENT_MESSAGES: usize = 6;
const RECENT_MESSAGE_CHARS: usize = 200;
/// Passed-over records below this similarity are unrelated and left alone.
const RELEVANCE_FLOOR: f32 = 0.3;
const MIN_IMPORTANCE: u8 = 1;
const MAX_IMPORTANCE: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCategory {
    Personal,
    Location,
    Farming,
    Crops,
    Equipment,
    Livestock,
    Soil,
    Preferences,
    Experience,
    Financial,
}

impl MemoryCategory {
    pub const ALL: [MemoryCategory; 10] = [
        MemoryCategory::Personal,
        MemoryCategory::Location,
        MemoryCategory::Farming,
        MemoryCategory::Crops,
        MemoryCategory::Equipment,
        MemoryCategory::Livestock,
        MemoryCategory::Soil,
        MemoryCategory::Preferences,
        MemoryCategory::Experience,
        MemoryCategory::Financial,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::Personal => "personal",
            MemoryCategory::Location => "location",
            MemoryCategory::Farming => "farming",
            MemoryCategory::Crops => "crops",
            MemoryCategory::Equipment => "equipment",
            MemoryCategory::Livestock => "livestock",
            MemoryCategory::Soil => "soil",
            MemoryCategory::Preferences => "preferences",
            MemoryCategory::Experience => "experience",
            MemoryCategory::Financial => "financial",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_lowercase();
        Self::ALL.into_iter().find(|c| c.as_str() == value)
    }
}

impl fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable fact about one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub user_id: String,
    pub content: String,
    pub category: MemoryCategory,
    pub importance: u8,
    pub access_count: u64,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryRecord {
    fn new(user_id: &str, fact: CandidateFact, embedding: Vec<f32>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            content: fact.fact,
            category: fact.category,
            importance: fact.importance,
            access_count: 0,
            embedding,
            created_at: now,
            updated_at: now,
        }
    }

    /// Retrieved for a prompt: counts the access, refreshes recency and
    /// raises importance by one step.
    pub fn access(&mut self) {
        self.access_count += 1;
        self.importance = (self.importance + 1).min(MAX_IMPORTANCE);
        self.updated_at = Utc::now();
    }

    /// Relevant but outranked: importance drops by one step.
    pub fn fade(&mut self) {
        self.importance = self.importance.saturating_sub(1).max(MIN_IMPORTANCE);
    }

    /// Relevance, importance, recency and usage blended into one score.
    fn score(&self, similarity: f32, now: DateTime<Utc>, decay_days: i64) -> f32 {
        let days = (now - self.updated_at).num_days().max(0) as f32;
        let decay = (1.0 - days / decay_days.max(1) as f32 * 0.5).max(0.3);
        let usage = (self.access_count as f32 / 20.0).min(0.2);
        similarity * 0.6 + f32::from(self.importance) / 10.0 * 0.25 + decay * 0.15 + usage
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Farmer,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub speaker: Speaker,
    pub content: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct MemoryStats {
    pub total: usize,
    pub by_category: BTreeMap<String, usize>,
    pub recent_turns: usize,
}

/// What happened to one candidate fact.
enum Placement {
    Inserted(MemoryRecord),
    Updated(MemoryRecord),
    Skipped,
}

#[derive(Debug)]
pub struct MemoryStore {
    gateway: Arc<LlmGateway>,
    embedder: Arc<dyn Embedder>,
    settings: SettingsHandle,
    records: DashMap<String, Vec<MemoryRecord>>,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
    recent: DashMap<String, VecDeque<ConversationTurn>>,
}

impl MemoryStore {
    pub fn new(gateway: Arc<LlmGateway>, embedder: Arc<dyn Embedder>, settings: SettingsHandle) -> Self {
        Self {
            gateway,
            embedder,
            settings,
            records: DashMap::new(),
            write_locks: DashMap::new(),
            recent: DashMap::new(),
        }
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.write_locks.entry(user_id.to_string()).or_default().clone()
    }

    /// Extract facts from one exchange and store the ones that are new.
    ///
    /// Returns inserted records and records whose content was updated in
    /// place. Extraction failures of any kind yield an empty list.
    #[instrument(skip(self, user_message, assistant_message))]
    pub async fn add_from_conversation(
        &self,
        user_id: &str,
        user_message: &str,
        assistant_message: &str,
    ) -> Vec<MemoryRecord> {
        let char_limit = self.settings.read(|s| s.memory.extraction_char_limit);
        let prompt = extraction::extraction_prompt(user_message, assistant_message, char_limit);
        let request = GenerationRequest::new(prompt, ModelRole::Classifier)
            .temperature(0.1)
            .uncached();

        let output = match self.gateway.generate_with(request).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Fact extraction failed");
                return Vec::new();
            }
        };

        let candidates = extraction::parse_candidates(&output);
        if candidates.is_empty() {
            debug!("No facts extracted");
            return Vec::new();
        }
        self.store_candidates(user_id, candidates).await
    }

    /// Drop the user's write lock when no writer holds or awaits it.
    fn release_user_lock(&self, user_id: &str) {
        self.write_locks.remove_if(user_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Store already-extracted facts under the deduplication rules.
    pub async fn store_candidates(&self, user_id: &str, candidates: Vec<CandidateFact>) -> Vec<MemoryRecord> {
        let lock = self.user_lock(user_id);
        let guard = lock.lock().await;
        let stored = self.place_all(user_id, candidates).await;
        drop(guard);
        drop(lock);
        self.release_user_lock(user_id);
        stored
    }

    async fn place_all(&self, user_id: &str, candidates: Vec<CandidateFact>) -> Vec<MemoryRecord> {
        let mut stored = Vec::new();
        for candidate in candidates {
            match self.place(user_id, candidate).await {
                Ok(Placement::Inserted(record)) => {
                    info!(user_id, category = %record.category, "Stored new memory");
                    stored.push(record);
                }
                Ok(Placement::Updated(record)) => {
                    info!(user_id, id = %record.id, "Updated existing memory");
                    stored.push(record);
                }
                Ok(Placement::Skipped) => debug!(user_id, "Duplicate memory skipped"),
                Err(e) => warn!(user_id, error = %e, "Could not embed fact, skipping"),
            }
        }
        stored
    }

    /// Dedup and write one candidate. Caller holds the user's write lock.
    async fn place(&self, user_id: &str, candidate: CandidateFact) -> Result<Placement, MemoryError> {
        let (threshold, floor) = self.settings.read(|s| (s.memory.dedup_threshold, s.memory.llm_dedup_floor));
        let embedding = self.embedder.embed(&candidate.fact).await?;

        let mut neighbours: Vec<(Uuid, String, u8, f32)> = self
            .records
            .get(user_id)
            .map(|records| {
                records
                    .iter()
                    .map(|r| (r.id, r.content.clone(), r.importance, cosine(&embedding, &r.embedding)))
                    .collect()
            })
            .unwrap_or_default();
        neighbours.sort_by(|a, b| b.3.partial_cmp(&a.3).unwrap_or(std::cmp::Ordering::Equal));

        if let Some((id, _, importance, similarity)) = neighbours.first().cloned() {
            if similarity >= threshold {
                if candidate.importance > importance {
                    return Ok(self
                        .update(user_id, id, threshold, |r| {
                            r.content = candidate.fact;
                            r.importance = candidate.importance;
                            r.embedding = embedding;
                        })
                        .map_or(Placement::Skipped, Placement::Updated));
                }
                return Ok(Placement::Skipped);
            }

            if similarity >= floor {
                let band: Vec<(Uuid, String)> = neighbours
                    .iter()
                    .take_while(|n| n.3 >= floor)
                    .take(5)
                    .map(|n| (n.0, n.1.clone()))
                    .collect();
                match self.adjudicate(&candidate.fact, &band).await {
                    DedupDecision::Duplicate => return Ok(Placement::Skipped),
                    DedupDecision::Update { id, merged } => {
                        let merged_embedding = self.embedder.embed(&merged).await?;
                        return Ok(self
                            .update(user_id, id, threshold, |r| {
                                r.content = merged;
                                r.importance = r.importance.max(candidate.importance);
                                r.embedding = merged_embedding;
                            })
                            .map_or(Placement::Skipped, Placement::Updated));
                    }
                    DedupDecision::New => {}
                }
            }
        }

        let record = MemoryRecord::new(user_id, candidate, embedding);
        self.records
            .entry(user_id.to_string())
            .or_default()
            .push(record.clone());
        Ok(Placement::Inserted(record))
    }

    async fn adjudicate(&self, fact: &str, existing: &[(Uuid, String)]) -> DedupDecision {
        let prompt = extraction::dedup_prompt(fact, existing);
        let request = GenerationRequest::new(prompt, ModelRole::Classifier)
            .temperature(0.0)
            .uncached();
        match self.gateway.generate_with(request).await {
            Ok(text) => {
                let known: Vec<Uuid> = existing.iter().map(|(id, _)| *id).collect();
                extraction::parse_dedup(&text, &known)
            }
            Err(e) => {
                warn!(error = %e, "Duplicate adjudication failed, treating fact as new");
                DedupDecision::New
            }
        }
    }

    /// Edit one record in place, then fold in any other record of the user
    /// the new content now duplicates.
    fn update(
        &self,
        user_id: &str,
        id: Uuid,
        threshold: f32,
        edit: impl FnOnce(&mut MemoryRecord),
    ) -> Option<MemoryRecord> {
        let mut records = self.records.get_mut(user_id)?;
        let record = records.iter_mut().find(|r| r.id == id)?;
        edit(record);
        record.updated_at = Utc::now();
        let embedding = record.embedding.clone();

        let (absorbed, kept): (Vec<MemoryRecord>, Vec<MemoryRecord>) = std::mem::take(&mut *records)
            .into_iter()
            .partition(|r| r.id != id && cosine(&embedding, &r.embedding) >= threshold);
        *records = kept;

        let record = records.iter_mut().find(|r| r.id == id)?;
        for other in absorbed {
            debug!(user_id, kept = %id, absorbed = %other.id, "Merged duplicate memory");
            record.importance = record.importance.max(other.importance);
            record.access_count += other.access_count;
            record.created_at = record.created_at.min(other.created_at);
        }
        Some(record.clone())
    }

    /// Score every record of the user against `query_text`, best first.
    /// Each entry is `(id, score, similarity)`.
    async fn rank(&self, user_id: &str, query_text: &str) -> Vec<(Uuid, f32, f32)> {
        let query_embedding = match self.embedder.embed(query_text).await {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(error = %e, "Query not embeddable, using keyword match");
                None
            }
        };
        let decay_days = self.settings.read(|s| s.memory.decay_days);
        let now = Utc::now();

        let Some(records) = self.records.get(user_id) else {
            return Vec::new();
        };
        let mut scored: Vec<(Uuid, f32, f32)> = records
            .iter()
            .map(|r| {
                let similarity = match &query_embedding {
                    Some(q) => cosine(q, &r.embedding),
                    None => keyword_overlap(query_text, &r.content),
                };
                (r.id, r.score(similarity, now, decay_days), similarity)
            })
            .collect();
        drop(records);

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
    }

    /// Top facts for prompt injection, plus the recent conversation.
    ///
    /// Every returned record is accessed: its count and importance go up
    /// and its recency is refreshed. Relevant records that did not make the
    /// cut fade by one importance step. Returns an empty string when there
    /// is nothing to inject.
    #[instrument(skip(self, query_text))]
    pub async fn get_memory_context(&self, user_id: &str, query_text: &str, max_memories: usize) -> String {
        let mut ranked = self.rank(user_id, query_text).await;
        let passed_over: Vec<Uuid> = ranked
            .iter()
            .skip(max_memories)
            .filter(|(_, _, similarity)| *similarity >= RELEVANCE_FLOOR)
            .map(|(id, _, _)| *id)
            .collect();
        ranked.truncate(max_memories);

        let mut facts = Vec::with_capacity(ranked.len());
        if let Some(mut records) = self.records.get_mut(user_id) {
            for (id, _, _) in &ranked {
                if let Some(record) = records.iter_mut().find(|r| r.id == *id) {
                    record.access();
                    facts.push(format!("  - [{}] {}", record.category, record.content));
                }
            }
            for record in records.iter_mut().filter(|r| passed_over.contains(&r.id)) {
                record.fade();
            }
        }

        let recent: Vec<String> = self
            .recent_turns(user_id)
            .iter()
            .rev()
            .take(RECENT_MESSAGES)
            .rev()
            .map(|turn| {
                let who = match turn.speaker {
                    Speaker::Farmer => "Farmer",
                    Speaker::Assistant => "Assistant",
                };
                let content: String = turn.content.chars().take(RECENT_MESSAGE_CHARS).collect();
                format!("  {who}: {content}")
            })
            .collect();

        if facts.is_empty() && recent.is_empty() {
            return String::new();
        }

        let mut out = String::from("--- FARMER MEMORY ---\n");
        if !facts.is_empty() {
            out.push_str("Known facts about this farmer:\n");
            out.push_str(&facts.join("\n"));
            out.push('\n');
        }
        if !recent.is_empty() {
            out.push_str("Recent conversation:\n");
            out.push_str(&recent.join("\n"));
            out.push('\n');
        }
        out.push_str("--- END MEMORY ---");
        out
    }

    /// Ranked records with scores. Does not count as an access.
    pub async fn search(&self, user_id: &str, query_text: &str, limit: usize) -> Vec<(MemoryRecord, f32)> {
        let ranked = self.rank(user_id, query_text).await;
        let Some(records) = self.records.get(user_id) else {
            return Vec::new();
        };
        ranked
            .into_iter()
            .take(limit)
            .filter_map(|(id, score, _)| records.iter().find(|r| r.id == id).map(|r| (r.clone(), score)))
            .collect()
    }

    /// All records of the user, newest first.
    pub fn get_all(&self, user_id: &str) -> Vec<MemoryRecord> {
        let mut all = self.records.get(user_id).map(|r| r.clone()).unwrap_or_default();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Records in one category, most important first.
    pub fn get_by_category(&self, user_id: &str, category: MemoryCategory) -> Vec<MemoryRecord> {
        let mut matching: Vec<MemoryRecord> = self
            .records
            .get(user_id)
            .map(|records| records.iter().filter(|r| r.category == category).cloned().collect())
            .unwrap_or_default();
        matching.sort_by(|a, b| b.importance.cmp(&a.importance));
        matching
    }

    /// Delete one record. Ids belonging to other users are not found.
    pub fn delete(&self, user_id: &str, id: Uuid) -> Result<MemoryRecord, MemoryError> {
        let not_found = || MemoryError::NotFound { user_id: user_id.to_string(), id };
        let mut records = self.records.get_mut(user_id).ok_or_else(not_found)?;
        let index = records.iter().position(|r| r.id == id).ok_or_else(not_found)?;
        Ok(records.remove(index))
    }

    /// Remove every record and recent turn of the user.
    pub fn clear_all(&self, user_id: &str) -> usize {
        self.recent.remove(user_id);
        self.records.remove(user_id).map(|(_, r)| r.len()).unwrap_or(0)
    }

    pub fn stats(&self, user_id: &str) -> MemoryStats {
        let mut stats = MemoryStats {
            recent_turns: self.recent.get(user_id).map(|r| r.len()).unwrap_or(0),
            ..Default::default()
        };
        if let Some(records) = self.records.get(user_id) {
            stats.total = records.len();
            for record in records.iter() {
                *stats.by_category.entry(record.category.to_string()).or_default() += 1;
            }
        }
        stats
    }

    /// Append one exchange to the short-term buffer.
    pub fn record_exchange(&self, user_id: &str, user_message: &str, assistant_message: &str) {
        let limit = self.settings.read(|s| s.memory.short_term_turns).max(2);
        let now = Utc::now();
        let mut buffer = self.recent.entry(user_id.to_string()).or_default();
        buffer.push_back(ConversationTurn { speaker: Speaker::Farmer, content: user_message.to_string(), at: now });
        buffer.push_back(ConversationTurn {
            speaker: Speaker::Assistant,
            content: assistant_message.to_string(),
            at: now,
        });
        while buffer.len() > limit {
            buffer.pop_front();
        }
    }

    pub fn recent_turns(&self, user_id: &str) -> Vec<ConversationTurn> {
        self.recent
            .get(user_id)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Share of meaningful query words present in `content`.
fn keyword_overlap(query: &str, content: &str) -> f32 {
    let content = content.to_lowercase();
    let words: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(|w| w.to_lowercase())
        .collect();
    if words.is_empty() {
        return 0.0;
    }
    let hits = words.iter().filter(|w| content.contains(w.as_str())).count();
    hits as f32 / words.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedBackend;
    use crate::retrieval::HashEmbedder;
    use crate::settings::Settings;

    fn store_with(reply: &'static str) -> (MemoryStore, Arc<ScriptedBackend>) {
        let settings = SettingsHandle::new(Settings::default());
        let backend = Arc::new(ScriptedBackend::always("scripted", reply));
        let gateway = Arc::new(LlmGateway::new(settings.clone(), backend.clone(), None));
        let store = MemoryStore::new(gateway, Arc::new(HashEmbedder::new(256)), settings);
        (store, backend)
    }

    #[test]
    fn categories_parse_case_insensitively() {
        assert_eq!(MemoryCategory::parse(" Livestock "), Some(MemoryCategory::Livestock));
        assert_eq!(MemoryCategory::parse("weather"), None);
        assert_eq!(MemoryCategory::ALL.len(), 10);
    }

    #[test]
    fn score_prefers_relevant_and_important() {
        let now = Utc::now();
        let fact = CandidateFact::new("a", MemoryCategory::Crops, 9);
        let important = MemoryRecord::new("u", fact, vec![]);
        let fact = CandidateFact::new("b", MemoryCategory::Crops, 2);
        let minor = MemoryRecord::new("u", fact, vec![]);

        assert!(important.score(0.5, now, 90) > minor.score(0.5, now, 90));
        assert!(minor.score(0.9, now, 90) > minor.score(0.1, now, 90));
    }

    #[tokio::test]
    async fn extraction_stores_facts() {
        let (store, _) = store_with(
            r#"[{"fact": "Has 5 acres of black soil", "category": "soil", "importance": 7}]"#,
        );
        let stored = store.add_from_conversation("u1", "I have 5 acres of black soil", "Noted").await;

        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].category, MemoryCategory::Soil);
        assert_eq!(store.stats("u1").total, 1);
        assert_eq!(store.stats("u1").by_category.get("soil"), Some(&1));
    }

    #[tokio::test]
    async fn unparsable_extraction_stores_nothing() {
        let (store, _) = store_with("Sorry, I cannot help with that.");
        assert!(store.add_from_conversation("u1", "hello", "hi").await.is_empty());
        assert!(store.get_all("u1").is_empty());
    }

    #[tokio::test]
    async fn identical_fact_is_skipped_or_upgraded() {
        let (store, _) = store_with("[]");
        let fact = |importance| vec![CandidateFact::new("Grows cotton in Warangal", MemoryCategory::Crops, importance)];

        assert_eq!(store.store_candidates("u1", fact(5)).await.len(), 1);
        assert!(store.store_candidates("u1", fact(5)).await.is_empty());
        assert!(store.store_candidates("u1", fact(3)).await.is_empty());

        let updated = store.store_candidates("u1", fact(8)).await;
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].importance, 8);

        let all = store.get_all("u1");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].importance, 8);
    }

    #[tokio::test]
    async fn context_counts_accesses_and_search_does_not() {
        let (store, _) = store_with("[]");
        store
            .store_candidates(
                "u1",
                vec![
                    CandidateFact::new("Grows paddy near Nalgonda", MemoryCategory::Crops, 8),
                    CandidateFact::new("Owns two buffaloes", MemoryCategory::Livestock, 4),
                ],
            )
            .await;

        let context = store.get_memory_context("u1", "paddy fertilizer", 1).await;
        assert!(context.starts_with("--- FARMER MEMORY ---"));
        assert!(context.contains("[crops] Grows paddy near Nalgonda"));
        assert!(!context.contains("buffaloes"));

        let paddy = store.get_by_category("u1", MemoryCategory::Crops);
        assert_eq!(paddy[0].access_count, 1);

        store.search("u1", "paddy", 5).await;
        assert_eq!(store.get_by_category("u1", MemoryCategory::Crops)[0].access_count, 1);
    }

    #[tokio::test]
    async fn delete_is_scoped_to_the_owner() {
        let (store, _) = store_with("[]");
        let stored = store
            .store_candidates("alice", vec![CandidateFact::new("Keeps bees", MemoryCategory::Livestock, 6)])
            .await;
        let id = stored[0].id;

        assert!(matches!(store.delete("bob", id), Err(MemoryError::NotFound { .. })));
        assert_eq!(store.get_all("alice").len(), 1);

        store.delete("alice", id).unwrap();
        assert!(matches!(store.delete("alice", id), Err(MemoryError::NotFound { .. })));
    }

    #[tokio::test]
    async fn short_term_buffer_is_bounded_and_rendered() {
        let (store, _) = store_with("[]");
        store.settings.update(|s| s.memory.short_term_turns = 4).unwrap();
        for i in 0..5 {
            store.record_exchange("u1", &format!("question {i}"), &format!("answer {i}"));
        }

        let turns = store.recent_turns("u1");
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[0].content, "question 3");

        let context = store.get_memory_context("u1", "anything", 5).await;
        assert!(context.contains("Recent conversation:"));
        assert!(context.contains("Farmer: question 4"));

        assert_eq!(store.clear_all("u1"), 0);
        assert!(store.get_memory_context("u1", "anything", 5).await.is_empty());
    }

    #[tokio::test]
    async fn write_locks_are_released_after_storing() {
        let (store, _) = store_with("[]");
        store
            .store_candidates("u1", vec![CandidateFact::new("Keeps goats", MemoryCategory::Livestock, 5)])
            .await;
        assert!(store.write_locks.is_empty());

        let held = store.user_lock("u2");
        store.release_user_lock("u2");
        assert!(store.write_locks.contains_key("u2"));
        drop(held);
        store.release_user_lock("u2");
        assert!(store.write_locks.is_empty());
    }

    #[test]
    fn access_and_fade_stay_within_bounds() {
        let fact = CandidateFact::new("Owns a tractor", MemoryCategory::Equipment, 9);
        let mut record = MemoryRecord::new("u", fact, vec![]);
        let before = record.updated_at;
        record.access();
        record.access();
        assert_eq!(record.importance, 10);
        assert_eq!(record.access_count, 2);
        assert!(record.updated_at >= before);

        for _ in 0..12 {
            record.fade();
        }
        assert_eq!(record.importance, 1);
    }

    #[test]
    fn keyword_overlap_ignores_short_words() {
        assert_eq!(keyword_overlap("is it ok", "anything"), 0.0);
        assert!((keyword_overlap("rice nalgonda", "Grows rice in Nalgonda") - 1.0).abs() < 1e-6);
    }
}
