use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::models::{EscalationSummary, RankedPatient, Urgency};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrgencyCount {
    pub urgency: Urgency,
    pub count: usize,
    pub unread: usize,
}

/// Most urgent first.
pub fn summarize_by_urgency(summaries: &[EscalationSummary]) -> Vec<UrgencyCount> {
    let mut map: BTreeMap<Urgency, (usize, usize)> = BTreeMap::new();

    for summary in summaries {
        let entry = map.entry(summary.urgency).or_insert((0, 0));
        entry.0 += 1;
        if !summary.read {
            entry.1 += 1;
        }
    }

    map.into_iter()
        .rev()
        .map(|(urgency, (count, unread))| UrgencyCount {
            urgency,
            count,
            unread,
        })
        .collect()
}

pub fn build_report(
    clinician_label: &str,
    generated_at: DateTime<Utc>,
    rankings: &[RankedPatient],
    summaries: &[EscalationSummary],
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Post-Op Priority Report");
    let _ = writeln!(
        output,
        "Generated for {} at {}",
        clinician_label,
        generated_at.format("%Y-%m-%d %H:%M UTC")
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Patients by Priority");

    if rankings.is_empty() {
        let _ = writeln!(output, "No patients assigned.");
    } else {
        for (position, patient) in rankings.iter().enumerate() {
            let _ = writeln!(
                output,
                "{}. {} ({}) score {}: {}",
                position + 1,
                patient.name,
                patient.risk,
                patient.score,
                patient.breakdown_text()
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Urgency Mix");

    let mix = summarize_by_urgency(summaries);
    if mix.is_empty() {
        let _ = writeln!(output, "No escalations recorded.");
    } else {
        for entry in &mix {
            let _ = writeln!(
                output,
                "- {}: {} summaries ({} unread)",
                entry.urgency, entry.count, entry.unread
            );
        }
    }

    let mut recent = summaries.to_vec();
    recent.sort_by(|a, b| b.generated_at.cmp(&a.generated_at));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Escalations");

    if recent.is_empty() {
        let _ = writeln!(output, "No escalations recorded.");
    } else {
        for summary in recent.iter().take(5) {
            let _ = writeln!(
                output,
                "- {} ({}, {} consecutive logs, {}) on {}: {}",
                summary.patient_name,
                summary.symptom_name,
                summary.streak_length,
                summary.urgency,
                summary.generated_at.format("%Y-%m-%d"),
                summary.generated_text.lines().next().unwrap_or_default()
            );
        }
    }

    output
}
