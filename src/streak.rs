//! Consecutive-submission streak detection.
//!
//! A streak is the contiguous run of logs, counted back from the newest one, that all
//! report the same symptom. Only streaks whose length is a positive multiple of three
//! (3, 6, 9, ...) become escalation candidates.

use std::collections::HashSet;

use chrono::NaiveDate;

use crate::models::SymptomLog;

/// Most logs ever consulted for one detection pass.
pub const STREAK_HISTORY: usize = 10;
pub const ESCALATION_STEP: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreakObservation {
    pub date: NaiveDate,
    pub severity: u8,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreakCandidate {
    pub symptom_name: String,
    pub streak_length: u32,
    /// Newest first, one entry per log in the streak.
    pub observations: Vec<StreakObservation>,
}

impl StreakCandidate {
    pub fn severities(&self) -> Vec<u8> {
        self.observations.iter().map(|obs| obs.severity).collect()
    }

    pub fn max_severity(&self) -> u8 {
        self.observations.iter().map(|obs| obs.severity).max().unwrap_or(0)
    }

    pub fn min_severity(&self) -> u8 {
        self.observations.iter().map(|obs| obs.severity).min().unwrap_or(0)
    }

    pub fn mean_severity(&self) -> f64 {
        if self.observations.is_empty() {
            return 0.0;
        }
        let total: u32 = self.observations.iter().map(|obs| u32::from(obs.severity)).sum();
        total as f64 / self.observations.len() as f64
    }
}

pub fn is_escalation_length(streak_length: u32) -> bool {
    streak_length >= ESCALATION_STEP && streak_length % ESCALATION_STEP == 0
}

/// `logs` must be newest first with the just-submitted log at index 0.
pub fn detect_streaks(logs: &[SymptomLog]) -> Vec<StreakCandidate> {
    let window = &logs[..logs.len().min(STREAK_HISTORY)];
    let Some(newest) = window.first() else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    for entry in &newest.symptoms {
        if !seen.insert(entry.name.as_str()) {
            continue;
        }
        let observations = collect_streak(window, &entry.name);
        let streak_length = observations.len() as u32;
        if is_escalation_length(streak_length) {
            candidates.push(StreakCandidate {
                symptom_name: entry.name.clone(),
                streak_length,
                observations,
            });
        }
    }

    candidates
}

/// Raw streak length for `symptom`, whether or not it would escalate.
pub fn streak_length_for(logs: &[SymptomLog], symptom: &str) -> u32 {
    let window = &logs[..logs.len().min(STREAK_HISTORY)];
    collect_streak(window, symptom).len() as u32
}

fn collect_streak(window: &[SymptomLog], symptom: &str) -> Vec<StreakObservation> {
    window
        .iter()
        .map_while(|log| {
            log.find_symptom(symptom).map(|entry| StreakObservation {
                date: log.date,
                severity: entry.severity_or_zero(),
                note: entry.note.clone().filter(|note| !note.trim().is_empty()),
            })
        })
        .collect()
}
