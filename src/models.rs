use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity at or above which a single symptom flags the whole log.
pub const FLAG_SEVERITY: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Low => "low",
            RiskTier::Medium => "medium",
            RiskTier::High => "high",
            RiskTier::Critical => "critical",
        }
    }

    /// Unrecognised labels fall back to `Medium`.
    pub fn parse_lenient(label: &str) -> RiskTier {
        match label.trim().to_ascii_lowercase().as_str() {
            "low" => RiskTier::Low,
            "medium" => RiskTier::Medium,
            "high" => RiskTier::High,
            "critical" => RiskTier::Critical,
            other => {
                tracing::debug!(label = other, "unknown risk tier, treating as medium");
                RiskTier::Medium
            }
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Medication {
    pub name: String,
    pub dosage: String,
    pub frequency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub id: Uuid,
    pub name: String,
    pub age: Option<u32>,
    pub diagnosis: Option<String>,
    pub risk: RiskTier,
    pub assigned_clinician_id: Option<Uuid>,
    pub medications: Vec<Medication>,
    pub retired: bool,
}

impl Patient {
    pub fn new(id: Uuid, name: impl Into<String>, risk: RiskTier) -> Self {
        Self {
            id,
            name: name.into(),
            age: None,
            diagnosis: None,
            risk,
            assigned_clinician_id: None,
            medications: Vec::new(),
            retired: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymptomEntry {
    pub name: String,
    /// 1-10. `None` marks a malformed entry and counts as zero.
    pub severity: Option<u8>,
    pub note: Option<String>,
}

impl SymptomEntry {
    pub fn new(name: impl Into<String>, severity: u8) -> Self {
        Self {
            name: name.into(),
            severity: Some(severity),
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn severity_or_zero(&self) -> u8 {
        self.severity.unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymptomLog {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub submitted_at: DateTime<Utc>,
    pub date: NaiveDate,
    pub symptoms: Vec<SymptomEntry>,
    pub flagged: bool,
}

impl SymptomLog {
    pub fn new(patient_id: Uuid, submitted_at: DateTime<Utc>, symptoms: Vec<SymptomEntry>) -> Self {
        let flagged = symptoms
            .iter()
            .any(|entry| entry.severity_or_zero() >= FLAG_SEVERITY);
        Self {
            id: Uuid::new_v4(),
            patient_id,
            submitted_at,
            date: submitted_at.date_naive(),
            symptoms,
            flagged,
        }
    }

    /// Mean severity across entries, `None` when the log lists no symptoms.
    pub fn mean_severity(&self) -> Option<f64> {
        if self.symptoms.is_empty() {
            return None;
        }
        let total: u32 = self
            .symptoms
            .iter()
            .map(|entry| u32::from(entry.severity_or_zero()))
            .sum();
        Some(total as f64 / self.symptoms.len() as f64)
    }

    pub fn find_symptom(&self, name: &str) -> Option<&SymptomEntry> {
        self.symptoms.iter().find(|entry| entry.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Urgency {
    Routine,
    Soon,
    Urgent,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Routine => "Routine",
            Urgency::Soon => "Soon",
            Urgency::Urgent => "Urgent",
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Urgency {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "routine" => Ok(Urgency::Routine),
            "soon" => Ok(Urgency::Soon),
            "urgent" => Ok(Urgency::Urgent),
            other => Err(format!("unknown urgency level: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationSummary {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub clinician_id: Uuid,
    pub patient_name: String,
    pub symptom_name: String,
    pub streak_length: u32,
    pub severity_sequence: Vec<u8>,
    pub prompt: String,
    pub generated_text: String,
    pub urgency: Urgency,
    pub read: bool,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEscalationSummary {
    pub patient_id: Uuid,
    pub clinician_id: Uuid,
    pub patient_name: String,
    pub symptom_name: String,
    pub streak_length: u32,
    pub severity_sequence: Vec<u8>,
    pub prompt: String,
    pub generated_text: String,
    pub urgency: Urgency,
    pub generated_at: DateTime<Utc>,
}

impl NewEscalationSummary {
    pub fn into_summary(self, id: Uuid) -> EscalationSummary {
        EscalationSummary {
            id,
            patient_id: self.patient_id,
            clinician_id: self.clinician_id,
            patient_name: self.patient_name,
            symptom_name: self.symptom_name,
            streak_length: self.streak_length,
            severity_sequence: self.severity_sequence,
            prompt: self.prompt,
            generated_text: self.generated_text,
            urgency: self.urgency,
            read: false,
            generated_at: self.generated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Escalation,
    CriticalAlert,
    LogSubmitted,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Escalation => "escalation",
            NotificationKind::CriticalAlert => "critical_alert",
            NotificationKind::LogSubmitted => "log_submitted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNotification {
    pub kind: NotificationKind,
    pub patient_id: Uuid,
    pub summary_id: Option<Uuid>,
    pub log_id: Option<Uuid>,
    pub urgency: Option<Urgency>,
    pub title: String,
    pub message: String,
    pub read: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScoreFactor {
    pub label: String,
    pub points: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompositeScore {
    pub patient_id: Uuid,
    pub score: u8,
    pub breakdown: Vec<ScoreFactor>,
}

/// `"Label: Npts"` entries joined with `" | "`.
pub fn breakdown_text(factors: &[ScoreFactor]) -> String {
    factors
        .iter()
        .map(|factor| format!("{}: {}pts", factor.label, factor.points))
        .collect::<Vec<_>>()
        .join(" | ")
}

impl CompositeScore {
    pub fn breakdown_text(&self) -> String {
        breakdown_text(&self.breakdown)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedPatient {
    pub patient_id: Uuid,
    pub name: String,
    pub risk: RiskTier,
    pub score: u8,
    pub breakdown: Vec<ScoreFactor>,
}

impl RankedPatient {
    pub fn breakdown_text(&self) -> String {
        breakdown_text(&self.breakdown)
    }
}
