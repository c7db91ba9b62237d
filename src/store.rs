//! Record-store collaborator interface.
//!
//! Every subscription yields full snapshots, never deltas. Dropping the returned stream
//! cancels the underlying listener.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use uuid::Uuid;

use crate::dedup::DedupKey;
use crate::error::StoreError;
use crate::models::{EscalationSummary, NewEscalationSummary, NewNotification, Patient, SymptomLog};

pub type RecordStream<T> = BoxStream<'static, Result<T, StoreError>>;

/// The per-patient streams the engine keeps open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamKind {
    Logs,
    Summaries,
    UnreadMessages,
}

impl StreamKind {
    pub const ALL: [StreamKind; 3] = [
        StreamKind::Logs,
        StreamKind::Summaries,
        StreamKind::UnreadMessages,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Logs => "logs",
            StreamKind::Summaries => "summaries",
            StreamKind::UnreadMessages => "unread_messages",
        }
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Patients assigned to `clinician_id`.
    async fn subscribe_roster(
        &self,
        clinician_id: Uuid,
    ) -> Result<RecordStream<Vec<Patient>>, StoreError>;

    /// All logs for a patient, newest first.
    async fn subscribe_logs(
        &self,
        patient_id: Uuid,
    ) -> Result<RecordStream<Vec<SymptomLog>>, StoreError>;

    /// Summaries for a (patient, clinician) pair, newest first.
    async fn subscribe_summaries(
        &self,
        patient_id: Uuid,
        clinician_id: Uuid,
    ) -> Result<RecordStream<Vec<EscalationSummary>>, StoreError>;

    /// Unread direct messages from the patient to the clinician.
    async fn subscribe_unread_messages(
        &self,
        patient_id: Uuid,
        clinician_id: Uuid,
    ) -> Result<RecordStream<u32>, StoreError>;

    async fn recent_logs(
        &self,
        patient_id: Uuid,
        limit: usize,
    ) -> Result<Vec<SymptomLog>, StoreError>;

    async fn summary_exists(&self, key: &DedupKey) -> Result<bool, StoreError>;

    /// Conditional write keyed by (patient, symptom, streak length).
    /// Returns `None` when a summary for that tuple already exists.
    async fn insert_summary_if_absent(
        &self,
        summary: NewEscalationSummary,
    ) -> Result<Option<Uuid>, StoreError>;

    /// Marks a summary as reviewed, which clears it from the unread-alert factor.
    async fn mark_summary_read(&self, summary_id: Uuid) -> Result<(), StoreError>;

    async fn insert_notification(
        &self,
        clinician_id: Uuid,
        notification: NewNotification,
    ) -> Result<Uuid, StoreError>;

    async fn insert_log(&self, log: &SymptomLog) -> Result<(), StoreError>;
}
