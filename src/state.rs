//! Keyed per-patient state, mutated only through [`RosterState::apply`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{CompositeScore, EscalationSummary, Patient, SymptomLog};
use crate::risk::{score_patient, ScoreInputs};
use crate::store::StreamKind;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    Logs(Vec<SymptomLog>),
    Summaries(Vec<EscalationSummary>),
    UnreadMessages(u32),
    /// The store closed the stream. Carries no data.
    Ended(StreamKind),
}

impl StreamUpdate {
    pub fn kind(&self) -> StreamKind {
        match self {
            StreamUpdate::Logs(_) => StreamKind::Logs,
            StreamUpdate::Summaries(_) => StreamKind::Summaries,
            StreamUpdate::UnreadMessages(_) => StreamKind::UnreadMessages,
            StreamUpdate::Ended(kind) => *kind,
        }
    }
}

/// A snapshot from one patient stream, tagged with the subscription epoch it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub patient_id: Uuid,
    pub epoch: u64,
    pub update: StreamUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Updated,
    /// Patient no longer tracked, or the event predates its current subscriptions.
    Ignored,
}

#[derive(Debug, Clone)]
pub struct PatientState {
    pub patient: Patient,
    pub epoch: u64,
    /// Newest first.
    pub logs: Vec<SymptomLog>,
    /// Newest first.
    pub summaries: Vec<EscalationSummary>,
    pub unread_messages: u32,
}

impl PatientState {
    fn new(patient: Patient, epoch: u64) -> Self {
        Self {
            patient,
            epoch,
            logs: Vec::new(),
            summaries: Vec::new(),
            unread_messages: 0,
        }
    }

    pub fn score(&self, now: DateTime<Utc>) -> CompositeScore {
        score_patient(
            &ScoreInputs {
                patient_id: self.patient.id,
                risk: self.patient.risk,
                logs: &self.logs,
                summaries: &self.summaries,
                unread_messages: self.unread_messages,
            },
            now,
        )
    }
}

#[derive(Debug, Default)]
pub struct RosterState {
    patients: HashMap<Uuid, PatientState>,
}

impl RosterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a patient with empty cached inputs.
    pub fn track(&mut self, patient: Patient, epoch: u64) {
        self.patients
            .insert(patient.id, PatientState::new(patient, epoch));
    }

    /// Replaces roster attributes (risk tier, profile) without touching stream data.
    /// Returns true when anything changed.
    pub fn refresh_patient(&mut self, patient: &Patient) -> bool {
        match self.patients.get_mut(&patient.id) {
            Some(state) if state.patient != *patient => {
                state.patient = patient.clone();
                true
            }
            _ => false,
        }
    }

    pub fn forget(&mut self, patient_id: &Uuid) -> Option<PatientState> {
        self.patients.remove(patient_id)
    }

    pub fn get(&self, patient_id: &Uuid) -> Option<&PatientState> {
        self.patients.get(patient_id)
    }

    pub fn is_empty(&self) -> bool {
        self.patients.is_empty()
    }

    pub fn apply(&mut self, event: StreamEvent) -> Applied {
        let Some(state) = self.patients.get_mut(&event.patient_id) else {
            return Applied::Ignored;
        };
        if state.epoch != event.epoch {
            return Applied::Ignored;
        }

        match event.update {
            StreamUpdate::Logs(mut logs) => {
                logs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
                state.logs = logs;
            }
            StreamUpdate::Summaries(mut summaries) => {
                summaries.sort_by(|a, b| b.generated_at.cmp(&a.generated_at));
                state.summaries = summaries;
            }
            StreamUpdate::UnreadMessages(count) => state.unread_messages = count,
            StreamUpdate::Ended(_) => return Applied::Ignored,
        }
        Applied::Updated
    }

    pub fn score(&self, patient_id: &Uuid, now: DateTime<Utc>) -> Option<CompositeScore> {
        self.patients.get(patient_id).map(|state| state.score(now))
    }

    pub fn score_all(&self, now: DateTime<Utc>) -> Vec<(&Patient, CompositeScore)> {
        self.patients
            .values()
            .map(|state| (&state.patient, state.score(now)))
            .collect()
    }
}
