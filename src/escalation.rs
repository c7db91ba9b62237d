//! Symptom-streak escalation for newly submitted logs.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::dedup::{self, Authorization, DedupKey};
use crate::error::StoreError;
use crate::models::{
    NewEscalationSummary, NewNotification, NotificationKind, Patient, SymptomLog, Urgency,
};
use crate::store::RecordStore;
use crate::streak::{detect_streaks, StreakCandidate};
use crate::summary::{DraftSummary, SummaryGenerator, SummarySource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationOutcome {
    Created {
        symptom_name: String,
        streak_length: u32,
        summary_id: Uuid,
        urgency: Urgency,
        source: SummarySource,
    },
    /// A summary for this exact streak already exists.
    Duplicate {
        symptom_name: String,
        streak_length: u32,
    },
    /// The existence check failed.
    Skipped {
        symptom_name: String,
        streak_length: u32,
    },
    Failed {
        symptom_name: String,
        streak_length: u32,
        error: String,
    },
}

pub struct EscalationPipeline {
    store: Arc<dyn RecordStore>,
    summaries: SummaryGenerator,
    history_limit: usize,
}

impl EscalationPipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        summaries: SummaryGenerator,
        history_limit: usize,
    ) -> Self {
        Self {
            store,
            summaries,
            history_limit: history_limit.max(1),
        }
    }

    /// Stores a new log, notifies the clinician, then checks it for escalations.
    pub async fn submit_log(
        &self,
        patient: &Patient,
        clinician_id: Uuid,
        log: SymptomLog,
    ) -> Result<Vec<EscalationOutcome>, StoreError> {
        self.store.insert_log(&log).await?;
        if let Err(e) = self
            .store
            .insert_notification(clinician_id, submission_notification(patient, &log))
            .await
        {
            tracing::warn!(
                patient_id = %patient.id,
                error = %e,
                "Failed to notify clinician of new log"
            );
        }
        self.process_submission(patient, clinician_id, &log).await
    }

    /// Runs streak detection for `new_log` against the patient's recent history.
    pub async fn process_submission(
        &self,
        patient: &Patient,
        clinician_id: Uuid,
        new_log: &SymptomLog,
    ) -> Result<Vec<EscalationOutcome>, StoreError> {
        let mut history = self
            .store
            .recent_logs(patient.id, self.history_limit)
            .await?;
        history.retain(|log| log.id != new_log.id);
        history.insert(0, new_log.clone());
        history.truncate(self.history_limit);

        let candidates = detect_streaks(&history);
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut outcomes = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            outcomes.push(self.escalate(patient, clinician_id, candidate).await);
        }
        Ok(outcomes)
    }

    async fn escalate(
        &self,
        patient: &Patient,
        clinician_id: Uuid,
        candidate: StreakCandidate,
    ) -> EscalationOutcome {
        let key = DedupKey::for_candidate(patient.id, &candidate);
        let symptom_name = candidate.symptom_name.clone();
        let streak_length = candidate.streak_length;

        match dedup::authorize(self.store.as_ref(), &key).await {
            Authorization::Authorized => {}
            Authorization::AlreadyEscalated => {
                return EscalationOutcome::Duplicate {
                    symptom_name,
                    streak_length,
                }
            }
            Authorization::CheckFailed => {
                return EscalationOutcome::Skipped {
                    symptom_name,
                    streak_length,
                }
            }
        }

        let draft = self.summaries.generate(patient, &candidate).await;
        let urgency = draft.urgency;
        let source = draft.source;
        let summary = new_summary(patient, clinician_id, &candidate, draft);

        let summary_id = match dedup::claim(self.store.as_ref(), summary).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                return EscalationOutcome::Duplicate {
                    symptom_name,
                    streak_length,
                }
            }
            Err(e) => {
                tracing::error!(
                    patient_id = %patient.id,
                    symptom = %symptom_name,
                    streak = streak_length,
                    error = %e,
                    "Failed to persist escalation summary"
                );
                return EscalationOutcome::Failed {
                    symptom_name,
                    streak_length,
                    error: e.to_string(),
                };
            }
        };

        let notification = escalation_notification(patient, &candidate, summary_id, urgency);
        if let Err(e) = self
            .store
            .insert_notification(clinician_id, notification)
            .await
        {
            tracing::warn!(
                patient_id = %patient.id,
                summary_id = %summary_id,
                error = %e,
                "Escalation summary stored but clinician notification failed"
            );
        }

        tracing::info!(
            patient_id = %patient.id,
            symptom = %symptom_name,
            streak = streak_length,
            urgency = %urgency,
            "Escalation summary created"
        );

        EscalationOutcome::Created {
            symptom_name,
            streak_length,
            summary_id,
            urgency,
            source,
        }
    }
}

fn new_summary(
    patient: &Patient,
    clinician_id: Uuid,
    candidate: &StreakCandidate,
    draft: DraftSummary,
) -> NewEscalationSummary {
    NewEscalationSummary {
        patient_id: patient.id,
        clinician_id,
        patient_name: patient.name.clone(),
        symptom_name: candidate.symptom_name.clone(),
        streak_length: candidate.streak_length,
        severity_sequence: candidate.severities(),
        prompt: draft.prompt,
        generated_text: draft.text,
        urgency: draft.urgency,
        generated_at: Utc::now(),
    }
}

pub fn escalation_notification(
    patient: &Patient,
    candidate: &StreakCandidate,
    summary_id: Uuid,
    urgency: Urgency,
) -> NewNotification {
    NewNotification {
        kind: NotificationKind::Escalation,
        patient_id: patient.id,
        summary_id: Some(summary_id),
        log_id: None,
        urgency: Some(urgency),
        title: "AI Clinical Alert".to_string(),
        message: format!(
            "AI Alert: {} has reported {} in {} consecutive log submissions. Review suggested.",
            patient.name, candidate.symptom_name, candidate.streak_length
        ),
        read: false,
    }
}

/// The notice a clinician gets for every submitted log, escalated when it is flagged.
pub fn submission_notification(patient: &Patient, log: &SymptomLog) -> NewNotification {
    let (kind, title, message) = if log.flagged {
        (
            NotificationKind::CriticalAlert,
            "Critical Alert",
            format!("{} logged severity 8 or higher. Immediate review needed.", patient.name),
        )
    } else {
        (
            NotificationKind::LogSubmitted,
            "New Symptom Log",
            format!("{} submitted their daily symptom log.", patient.name),
        )
    };
    NewNotification {
        kind,
        patient_id: patient.id,
        summary_id: None,
        log_id: Some(log.id),
        urgency: None,
        title: title.to_string(),
        message,
        read: false,
    }
}
