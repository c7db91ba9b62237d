use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{CompositeScore, EscalationSummary, RiskTier, ScoreFactor, SymptomLog};

const MAX_SCORE: i32 = 100;
const TREND_WINDOW: usize = 5;
const TREND_MARGIN: f64 = 0.5;

/// Everything the aggregator needs for one patient. Logs and summaries are newest first.
#[derive(Debug, Clone, Copy)]
pub struct ScoreInputs<'a> {
    pub patient_id: Uuid,
    pub risk: RiskTier,
    pub logs: &'a [SymptomLog],
    pub summaries: &'a [EscalationSummary],
    pub unread_messages: u32,
}

pub fn score_patient(inputs: &ScoreInputs<'_>, now: DateTime<Utc>) -> CompositeScore {
    let mut breakdown = Vec::new();
    let mut total = 0i32;

    let mut push = |label: String, points: i32, always: bool| {
        total += points;
        if always || points != 0 {
            breakdown.push(ScoreFactor { label, points });
        }
    };

    push(
        format!("Risk ({})", inputs.risk),
        risk_points(inputs.risk),
        true,
    );
    push(
        "Severity".to_string(),
        severity_points(inputs.logs.first()),
        true,
    );
    push(
        "Streak".to_string(),
        streak_points(inputs.summaries.first().map(|s| s.streak_length)),
        false,
    );
    push(
        "Unread Alerts".to_string(),
        unread_alert_points(inputs.summaries),
        false,
    );

    let hours = hours_since_last_log(inputs.logs, now);
    let inactive = inactivity_points(hours);
    push(inactivity_label(inactive).to_string(), inactive, false);

    let trend = trend_points(inputs.logs);
    let trend_label = if trend > 0 {
        "Worsening Trend"
    } else {
        "Improving Trend"
    };
    push(trend_label.to_string(), trend, false);

    push(
        "Unread Msgs".to_string(),
        unread_message_points(inputs.unread_messages),
        false,
    );

    CompositeScore {
        patient_id: inputs.patient_id,
        score: total.clamp(0, MAX_SCORE) as u8,
        breakdown,
    }
}

pub fn risk_points(risk: RiskTier) -> i32 {
    match risk {
        RiskTier::Critical => 40,
        RiskTier::High => 30,
        RiskTier::Medium => 20,
        RiskTier::Low => 10,
    }
}

pub fn severity_points(latest: Option<&SymptomLog>) -> i32 {
    match latest.and_then(SymptomLog::mean_severity) {
        Some(mean) => (mean / 10.0 * 20.0).round() as i32,
        None => 0,
    }
}

pub fn streak_points(streak_length: Option<u32>) -> i32 {
    match streak_length.unwrap_or(0) {
        n if n >= 9 => 20,
        n if n >= 6 => 15,
        n if n >= 3 => 10,
        _ => 0,
    }
}

pub fn unread_alert_points(summaries: &[EscalationSummary]) -> i32 {
    let unread = summaries.iter().filter(|summary| !summary.read).count() as i32;
    (unread * 5).min(15)
}

/// `None` means the patient has never submitted a log.
pub fn hours_since_last_log(logs: &[SymptomLog], now: DateTime<Utc>) -> Option<f64> {
    logs.first()
        .map(|log| (now - log.submitted_at).num_seconds() as f64 / 3600.0)
}

pub fn inactivity_points(hours_since: Option<f64>) -> i32 {
    match hours_since {
        None => 15,
        Some(hours) if hours >= 72.0 => 15,
        Some(hours) if hours >= 48.0 => 10,
        Some(hours) if hours >= 24.0 => 5,
        Some(_) => 0,
    }
}

fn inactivity_label(points: i32) -> &'static str {
    match points {
        15 => "Inactive 72hrs+",
        10 => "Inactive 48hrs",
        _ => "Inactive 24hrs",
    }
}

/// Compares the newest log against the oldest of the newest five.
pub fn trend_points(logs: &[SymptomLog]) -> i32 {
    let window = &logs[..logs.len().min(TREND_WINDOW)];
    if window.len() < 2 {
        return 0;
    }
    let newest = window[0].mean_severity().unwrap_or(0.0);
    let oldest = window[window.len() - 1].mean_severity().unwrap_or(0.0);

    if newest > oldest + TREND_MARGIN {
        10
    } else if newest < oldest - TREND_MARGIN {
        -5
    } else {
        0
    }
}

pub fn unread_message_points(unread_messages: u32) -> i32 {
    (unread_messages.min(3) * 2) as i32
}
