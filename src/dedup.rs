//! At-most-one escalation summary per (patient, symptom, streak length).
//!
//! The existence read is only a pre-check that saves a text-generation call. The
//! conditional insert in [`claim`] is what enforces uniqueness, so two overlapping
//! submissions that reach the same streak length produce a single summary.

use uuid::Uuid;

use crate::error::StoreError;
use crate::models::NewEscalationSummary;
use crate::store::RecordStore;
use crate::streak::StreakCandidate;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub patient_id: Uuid,
    pub symptom_name: String,
    pub streak_length: u32,
}

impl DedupKey {
    pub fn new(patient_id: Uuid, symptom_name: impl Into<String>, streak_length: u32) -> Self {
        Self {
            patient_id,
            symptom_name: symptom_name.into(),
            streak_length,
        }
    }

    pub fn for_candidate(patient_id: Uuid, candidate: &StreakCandidate) -> Self {
        Self::new(patient_id, candidate.symptom_name.clone(), candidate.streak_length)
    }

    pub fn for_summary(summary: &NewEscalationSummary) -> Self {
        Self::new(
            summary.patient_id,
            summary.symptom_name.clone(),
            summary.streak_length,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    Authorized,
    AlreadyEscalated,
    /// The existence check failed. Nothing is generated.
    CheckFailed,
}

pub async fn authorize(store: &dyn RecordStore, key: &DedupKey) -> Authorization {
    match store.summary_exists(key).await {
        Ok(false) => Authorization::Authorized,
        Ok(true) => {
            tracing::debug!(
                patient_id = %key.patient_id,
                symptom = %key.symptom_name,
                streak = key.streak_length,
                "Escalation already issued for this streak"
            );
            Authorization::AlreadyEscalated
        }
        Err(e) => {
            tracing::warn!(
                patient_id = %key.patient_id,
                symptom = %key.symptom_name,
                streak = key.streak_length,
                error = %e,
                "Escalation existence check failed, skipping generation"
            );
            Authorization::CheckFailed
        }
    }
}

/// Persists the summary unless another writer already claimed the same tuple.
pub async fn claim(
    store: &dyn RecordStore,
    summary: NewEscalationSummary,
) -> Result<Option<Uuid>, StoreError> {
    let key = DedupKey::for_summary(&summary);
    let inserted = store.insert_summary_if_absent(summary).await?;
    if inserted.is_none() {
        tracing::info!(
            patient_id = %key.patient_id,
            symptom = %key.symptom_name,
            streak = key.streak_length,
            "Concurrent escalation won the write, discarding duplicate"
        );
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::models::Urgency;
    use chrono::Utc;

    fn new_summary(patient_id: Uuid, symptom: &str, streak_length: u32) -> NewEscalationSummary {
        NewEscalationSummary {
            patient_id,
            clinician_id: Uuid::new_v4(),
            patient_name: "Ananya Rao".to_string(),
            symptom_name: symptom.to_string(),
            streak_length,
            severity_sequence: vec![6; streak_length as usize],
            prompt: "prompt".to_string(),
            generated_text: "text".to_string(),
            urgency: Urgency::Soon,
            generated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn authorizes_until_a_summary_exists() {
        let store = MemoryStore::new();
        let patient_id = Uuid::new_v4();
        let key = DedupKey::new(patient_id, "Fatigue", 3);

        assert_eq!(authorize(&store, &key).await, Authorization::Authorized);
        let id = claim(&store, new_summary(patient_id, "Fatigue", 3)).await.unwrap();
        assert!(id.is_some());
        assert_eq!(authorize(&store, &key).await, Authorization::AlreadyEscalated);

        let longer = DedupKey::new(patient_id, "Fatigue", 6);
        assert_eq!(authorize(&store, &longer).await, Authorization::Authorized);
    }

    #[tokio::test]
    async fn second_claim_for_same_tuple_writes_nothing() {
        let store = MemoryStore::new();
        let patient_id = Uuid::new_v4();

        let first = claim(&store, new_summary(patient_id, "Pain", 6)).await.unwrap();
        let second = claim(&store, new_summary(patient_id, "Pain", 6)).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(store.summary_write_count(), 1);
    }

    #[tokio::test]
    async fn failed_check_does_not_authorize() {
        let store = MemoryStore::new();
        store.fail_existence_checks(true);
        let key = DedupKey::new(Uuid::new_v4(), "Fever", 3);
        assert_eq!(authorize(&store, &key).await, Authorization::CheckFailed);
    }
}
