//! Agricultural advisory assistant - core library
//!
//! A supervisor classifies each farmer query, routes it to one or two domain
//! specialists that answer from a knowledge base, and synthesizes a single
//! reply. Model access goes through a fallback-chain gateway with a response
//! cache; a per-user memory store keeps durable facts about each farmer.

pub mod agents;
pub mod cache;
pub mod cli;
pub mod error;
pub mod llm;
pub mod memory;
pub mod orchestrator;
pub mod parsing;
pub mod retrieval;
pub mod services;
pub mod settings;
pub mod telemetry;

pub use agents::{Specialist, SpecialistKind, SpecialistRequest, SpecialistResponse};
pub use llm::{LlmGateway, ModelRole};
pub use memory::MemoryStore;
pub use orchestrator::{Query, Supervisor, SynthesizedAnswer};
pub use retrieval::KnowledgeRetriever;
pub use settings::{Settings, SettingsHandle};
