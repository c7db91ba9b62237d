//! Priority aggregation and clinical escalation for post-operative symptom monitoring.
//!
//! [`engine::MonitorEngine`] keeps a live, ranked view of one clinician's roster.
//! [`escalation::EscalationPipeline`] turns repeated symptom reports into deduplicated
//! clinician summaries.

pub mod config;
pub mod db;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod llm;
pub mod memory;
pub mod models;
pub mod ranker;
pub mod report;
pub mod risk;
pub mod state;
pub mod store;
pub mod streak;
pub mod subscriptions;
pub mod summary;

pub use config::{EngineConfig, GeneratorConfig};
pub use engine::{Clock, EngineHandle, FixedClock, MonitorEngine, SystemClock};
pub use error::{EngineError, GenerationError, StoreError};
pub use escalation::{EscalationOutcome, EscalationPipeline};
pub use memory::MemoryStore;
pub use models::{CompositeScore, Patient, RankedPatient, RiskTier, SymptomEntry, SymptomLog, Urgency};
pub use store::{RecordStore, StreamKind};
