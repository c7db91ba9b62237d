//! Clinical summary generation for escalation candidates.

use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use crate::error::GenerationError;
use crate::llm::TextGenerator;
use crate::models::{Patient, Urgency};
use crate::streak::StreakCandidate;

pub const DISCLAIMER: &str = "Final medical decision rests with the treating physician.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarySource {
    Collaborator,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftSummary {
    pub prompt: String,
    pub text: String,
    pub urgency: Urgency,
    pub source: SummarySource,
}

pub struct SummaryGenerator {
    generator: Arc<dyn TextGenerator>,
    timeout: Duration,
}

impl SummaryGenerator {
    pub fn new(generator: Arc<dyn TextGenerator>, timeout: Duration) -> Self {
        Self { generator, timeout }
    }

    pub async fn generate(&self, patient: &Patient, candidate: &StreakCandidate) -> DraftSummary {
        let prompt = build_prompt(patient, candidate);

        match self.call_collaborator(&prompt).await {
            Ok(text) => {
                let urgency = classify_generated_urgency(&text);
                DraftSummary {
                    prompt,
                    text: with_disclaimer(text),
                    urgency,
                    source: SummarySource::Collaborator,
                }
            }
            Err(e) => {
                tracing::warn!(
                    patient_id = %patient.id,
                    symptom = %candidate.symptom_name,
                    generator = self.generator.name(),
                    error = %e,
                    "Text generation unavailable, synthesizing fallback summary"
                );
                let urgency = classify_streak_urgency(candidate);
                DraftSummary {
                    prompt,
                    text: fallback_summary(patient, candidate, urgency),
                    urgency,
                    source: SummarySource::Fallback,
                }
            }
        }
    }

    async fn call_collaborator(&self, prompt: &str) -> Result<String, GenerationError> {
        let text = tokio::time::timeout(self.timeout, self.generator.generate(prompt))
            .await
            .map_err(|_| GenerationError::Timeout(self.timeout.as_secs()))??;
        if text.trim().is_empty() {
            return Err(GenerationError::Empty);
        }
        Ok(text)
    }
}

pub fn build_prompt(patient: &Patient, candidate: &StreakCandidate) -> String {
    let medications = if patient.medications.is_empty() {
        "None recorded".to_string()
    } else {
        patient
            .medications
            .iter()
            .map(|m| format!("{} {} ({})", m.name, m.dosage, m.frequency))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let age = patient
        .age
        .map(|age| age.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let mut prompt = String::new();
    let _ = writeln!(
        prompt,
        "You are a clinical decision support assistant helping a doctor review a post-discharge patient's recovery."
    );
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "Patient Details:");
    let _ = writeln!(prompt, "- Name: {}", patient.name);
    let _ = writeln!(prompt, "- Age: {age}");
    let _ = writeln!(
        prompt,
        "- Condition: {}",
        patient.diagnosis.as_deref().unwrap_or("unknown")
    );
    let _ = writeln!(prompt, "- Current Medications: {medications}");
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "Symptom Pattern Detected:");
    let _ = writeln!(prompt, "- Symptom: {}", candidate.symptom_name);
    let _ = writeln!(
        prompt,
        "- Reported in {} consecutive log submissions",
        candidate.streak_length
    );
    let _ = writeln!(prompt, "- Severity scores (most recent first):");
    for (idx, obs) in candidate.observations.iter().enumerate() {
        let _ = write!(prompt, "Submission {} ({}): {}/10", idx + 1, obs.date, obs.severity);
        if let Some(note) = &obs.note {
            let _ = write!(prompt, " - \"{note}\"");
        }
        let _ = writeln!(prompt);
    }
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "Task:");
    let _ = writeln!(
        prompt,
        "1. Write a brief clinical summary (3-4 sentences) explaining the pattern for the doctor."
    );
    let _ = writeln!(
        prompt,
        "2. Suggest 2-3 possible medication adjustments or interventions appropriate for this symptom and the patient's current condition. Label them as suggestions for the doctor to evaluate, not prescriptions."
    );
    let _ = writeln!(
        prompt,
        "3. Indicate urgency level: Routine / Soon / Urgent based on severity trend."
    );
    let _ = writeln!(prompt);
    let _ = write!(
        prompt,
        "Keep the tone clinical, concise, and factual. Always end with: \"{DISCLAIMER}\""
    );
    prompt
}

/// Urgent if any severity reached 8, Soon if the mean is at least 6.
pub fn classify_streak_urgency(candidate: &StreakCandidate) -> Urgency {
    if candidate.max_severity() >= 8 {
        Urgency::Urgent
    } else if candidate.mean_severity() >= 6.0 {
        Urgency::Soon
    } else {
        Urgency::Routine
    }
}

pub fn classify_generated_urgency(text: &str) -> Urgency {
    let lowered = text.to_lowercase();
    if lowered.contains("urgent") {
        Urgency::Urgent
    } else if lowered.contains("soon") {
        Urgency::Soon
    } else {
        Urgency::Routine
    }
}

/// Escalating when the newest severity is at least the oldest one in the streak.
pub fn streak_trend(candidate: &StreakCandidate) -> &'static str {
    let newest = candidate.observations.first().map(|obs| obs.severity);
    let oldest = candidate.observations.last().map(|obs| obs.severity);
    match (newest, oldest) {
        (Some(newest), Some(oldest)) if newest < oldest => "improving",
        _ => "escalating",
    }
}

pub fn fallback_summary(patient: &Patient, candidate: &StreakCandidate, urgency: Urgency) -> String {
    let trend = streak_trend(candidate);
    let max = candidate.max_severity();
    let follow_up_window = if max >= 7 { "24-48" } else { "72" };
    let context = patient
        .diagnosis
        .as_deref()
        .unwrap_or("post-discharge recovery");

    let mut text = String::new();
    let _ = write!(
        text,
        "The patient {} has reported {} in {} consecutive symptom log submissions, with severity scores ranging from {} to {} out of 10. ",
        patient.name,
        candidate.symptom_name,
        candidate.streak_length,
        candidate.min_severity(),
        max
    );
    let _ = write!(
        text,
        "The {trend} severity pattern is clinically notable in the context of {context}. "
    );
    let _ = writeln!(
        text,
        "This warrants evaluation to rule out complications or inadequate symptom management."
    );
    let _ = writeln!(text);
    let _ = writeln!(text, "Suggested Interventions (for physician evaluation):");
    let _ = writeln!(
        text,
        "- Review current analgesic or symptomatic management and assess dosage adequacy given the {trend} pattern."
    );
    let _ = writeln!(
        text,
        "- Consider an unplanned follow-up assessment within {follow_up_window} hours if {} persists.",
        candidate.symptom_name.to_lowercase()
    );
    let _ = writeln!(
        text,
        "- Evaluate for secondary causes such as infection, procedural complication, or medication side-effect."
    );
    let _ = writeln!(text);
    let _ = write!(text, "Urgency: {urgency}. {DISCLAIMER}");
    text
}

const TRAILING_MARKS: &[char] = &[
    '"', '\'', '\u{201C}', '\u{201D}', '\u{2019}', '*', '_', '`', '.', '!', ')',
];

fn with_disclaimer(text: String) -> String {
    let trimmed = text.trim_end();
    if ends_with_disclaimer(trimmed) {
        trimmed.to_string()
    } else {
        format!("{trimmed}\n\n{DISCLAIMER}")
    }
}

/// Ignores quotes, emphasis markers and punctuation wrapped around the closing disclaimer.
fn ends_with_disclaimer(text: &str) -> bool {
    let core = DISCLAIMER.trim_end_matches('.').to_lowercase();
    text.trim_end_matches(|c: char| c.is_whitespace() || TRAILING_MARKS.contains(&c))
        .to_lowercase()
        .ends_with(&core)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::UnavailableGenerator;
    use crate::models::{Medication, RiskTier};
    use crate::streak::StreakObservation;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use uuid::Uuid;

    struct FixedText(&'static str);

    #[async_trait]
    impl TextGenerator for FixedText {
        async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
            Ok(self.0.to_string())
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    struct Stalled;

    #[async_trait]
    impl TextGenerator for Stalled {
        async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("too late".to_string())
        }

        fn name(&self) -> &str {
            "stalled"
        }
    }

    fn patient() -> Patient {
        let mut patient = Patient::new(Uuid::new_v4(), "Arjun Nair", RiskTier::High);
        patient.age = Some(58);
        patient.diagnosis = Some("total knee replacement".to_string());
        patient.medications = vec![Medication {
            name: "Paracetamol".to_string(),
            dosage: "500mg".to_string(),
            frequency: "twice daily".to_string(),
        }];
        patient
    }

    fn candidate(severities: &[u8]) -> StreakCandidate {
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        StreakCandidate {
            symptom_name: "Swelling".to_string(),
            streak_length: severities.len() as u32,
            observations: severities
                .iter()
                .map(|severity| StreakObservation {
                    date,
                    severity: *severity,
                    note: Some("around the incision".to_string()),
                })
                .collect(),
        }
    }

    fn generator(backend: impl TextGenerator + 'static) -> SummaryGenerator {
        SummaryGenerator::new(Arc::new(backend), Duration::from_secs(5))
    }

    #[test]
    fn prompt_lists_patient_context_and_observations() {
        let prompt = build_prompt(&patient(), &candidate(&[7, 5, 4]));
        assert!(prompt.contains("- Name: Arjun Nair"));
        assert!(prompt.contains("- Age: 58"));
        assert!(prompt.contains("total knee replacement"));
        assert!(prompt.contains("Paracetamol 500mg (twice daily)"));
        assert!(prompt.contains("Reported in 3 consecutive log submissions"));
        assert!(prompt.contains("Submission 1 (2026-03-02): 7/10 - \"around the incision\""));
        assert!(prompt.contains("Submission 3 (2026-03-02): 4/10"));
    }

    #[tokio::test]
    async fn fallback_mentions_symptom_streak_and_disclaimer() {
        let draft = generator(UnavailableGenerator)
            .generate(&patient(), &candidate(&[9, 6, 5]))
            .await;
        assert_eq!(draft.source, SummarySource::Fallback);
        assert!(!draft.text.is_empty());
        assert!(draft.text.contains("Swelling"));
        assert!(draft.text.contains("3 consecutive"));
        assert!(draft.text.contains("ranging from 5 to 9"));
        assert!(draft.text.contains("escalating"));
        assert!(draft.text.contains("24-48 hours"));
        assert!(draft.text.ends_with(DISCLAIMER));
        assert_eq!(draft.urgency, Urgency::Urgent);
    }

    #[test]
    fn streak_urgency_thresholds() {
        assert_eq!(classify_streak_urgency(&candidate(&[3, 8, 2])), Urgency::Urgent);
        assert_eq!(classify_streak_urgency(&candidate(&[6, 7, 5])), Urgency::Soon);
        assert_eq!(classify_streak_urgency(&candidate(&[2, 3, 4])), Urgency::Routine);
    }

    #[test]
    fn improving_when_newest_is_below_oldest() {
        assert_eq!(streak_trend(&candidate(&[3, 5, 7])), "improving");
        assert_eq!(streak_trend(&candidate(&[5, 5, 5])), "escalating");
        let text = fallback_summary(&patient(), &candidate(&[3, 5, 4]), Urgency::Routine);
        assert!(text.contains("improving"));
        assert!(text.contains("within 72 hours"));
    }

    #[tokio::test]
    async fn collaborator_text_gets_disclaimer_and_urgency() {
        let draft = generator(FixedText("Pattern suggests review soon."))
            .generate(&patient(), &candidate(&[9, 9, 9]))
            .await;
        assert_eq!(draft.source, SummarySource::Collaborator);
        assert_eq!(draft.urgency, Urgency::Soon);
        assert!(draft.text.starts_with("Pattern suggests review soon."));
        assert!(draft.text.ends_with(DISCLAIMER));
    }

    #[test]
    fn wrapped_disclaimer_is_not_repeated() {
        for ending in [
            "\"Final medical decision rests with the treating physician.\"",
            "**Final medical decision rests with the treating physician.**",
            "Final medical decision rests with the treating physician!",
            "_final medical decision rests with the treating physician_ \n",
        ] {
            let text = with_disclaimer(format!("Pain persists.\n\n{ending}"));
            assert_eq!(text.to_lowercase().matches("final medical decision").count(), 1, "{ending}");
        }

        let text = with_disclaimer("Pain persists.".to_string());
        assert!(text.ends_with(DISCLAIMER));
    }

    #[tokio::test]
    async fn blank_collaborator_output_falls_back() {
        let draft = generator(FixedText("   "))
            .generate(&patient(), &candidate(&[4, 4, 4]))
            .await;
        assert_eq!(draft.source, SummarySource::Fallback);
        assert_eq!(draft.urgency, Urgency::Routine);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_collaborator_times_out_into_fallback() {
        let draft = generator(Stalled)
            .generate(&patient(), &candidate(&[6, 6, 6]))
            .await;
        assert_eq!(draft.source, SummarySource::Fallback);
        assert_eq!(draft.urgency, Urgency::Soon);
    }
}
