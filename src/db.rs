//! Postgres record store.
//!
//! Subscriptions poll their query on a fixed interval and yield only when the snapshot
//! changes. A failed poll yields an `Err` item and polling carries on.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::StreamExt;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::dedup::DedupKey;
use crate::error::StoreError;
use crate::models::{
    EscalationSummary, Medication, NewEscalationSummary, NewNotification, Patient, RiskTier,
    SymptomEntry, SymptomLog, Urgency,
};
use crate::store::{RecordStore, RecordStream};

pub const DEMO_CLINICIAN_ID: &str = "6b1f0c3e-8f7a-4c5d-9a2e-1d4b7e9f0a11";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    poll_interval: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool, poll_interval: Duration) -> Self {
        Self {
            pool,
            poll_interval,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs `fetch` once up front so open failures surface to the caller, then polls.
    async fn open_polling<T, F, Fut>(&self, fetch: F) -> Result<RecordStream<T>, StoreError>
    where
        T: Clone + PartialEq + Send + 'static,
        F: Fn(PgPool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, StoreError>> + Send + 'static,
    {
        let initial = fetch(self.pool.clone()).await?;
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let seed = PollState {
            pool: self.pool.clone(),
            fetch,
            ticker,
            last: None,
            pending: Some(initial),
        };
        let stream = futures_util::stream::unfold(seed, |mut poll| async move {
            if let Some(snapshot) = poll.pending.take() {
                poll.last = Some(snapshot.clone());
                return Some((Ok(snapshot), poll));
            }
            loop {
                poll.ticker.tick().await;
                match (poll.fetch)(poll.pool.clone()).await {
                    Ok(snapshot) if poll.last.as_ref() == Some(&snapshot) => continue,
                    Ok(snapshot) => {
                        poll.last = Some(snapshot.clone());
                        return Some((Ok(snapshot), poll));
                    }
                    Err(e) => return Some((Err(e), poll)),
                }
            }
        });
        Ok(stream.boxed())
    }
}

struct PollState<T, F> {
    pool: PgPool,
    fetch: F,
    ticker: tokio::time::Interval,
    last: Option<T>,
    pending: Option<T>,
}

#[async_trait]
impl RecordStore for PgStore {
    async fn subscribe_roster(
        &self,
        clinician_id: Uuid,
    ) -> Result<RecordStream<Vec<Patient>>, StoreError> {
        self.open_polling(move |pool| async move { fetch_roster(&pool, clinician_id).await })
            .await
    }

    async fn subscribe_logs(
        &self,
        patient_id: Uuid,
    ) -> Result<RecordStream<Vec<SymptomLog>>, StoreError> {
        self.open_polling(move |pool| async move { fetch_logs(&pool, patient_id, None).await })
            .await
    }

    async fn subscribe_summaries(
        &self,
        patient_id: Uuid,
        clinician_id: Uuid,
    ) -> Result<RecordStream<Vec<EscalationSummary>>, StoreError> {
        self.open_polling(move |pool| async move {
            fetch_summaries(&pool, Some(patient_id), clinician_id).await
        })
        .await
    }

    async fn subscribe_unread_messages(
        &self,
        patient_id: Uuid,
        clinician_id: Uuid,
    ) -> Result<RecordStream<u32>, StoreError> {
        self.open_polling(move |pool| async move {
            count_unread_messages(&pool, patient_id, clinician_id).await
        })
        .await
    }

    async fn recent_logs(
        &self,
        patient_id: Uuid,
        limit: usize,
    ) -> Result<Vec<SymptomLog>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        fetch_logs(&self.pool, patient_id, Some(limit)).await
    }

    async fn summary_exists(&self, key: &DedupKey) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM postop_monitor.escalation_summaries
                WHERE patient_id = $1 AND symptom_name = $2 AND streak_length = $3
            )
            "#,
        )
        .bind(key.patient_id)
        .bind(&key.symptom_name)
        .bind(to_i32(key.streak_length))
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_summary_if_absent(
        &self,
        summary: NewEscalationSummary,
    ) -> Result<Option<Uuid>, StoreError> {
        let sequence: Vec<i32> = summary
            .severity_sequence
            .iter()
            .map(|&severity| i32::from(severity))
            .collect();

        let row = sqlx::query(
            r#"
            INSERT INTO postop_monitor.escalation_summaries
            (id, patient_id, clinician_id, patient_name, symptom_name, streak_length,
             severity_sequence, prompt, generated_text, urgency, read, generated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, FALSE, $11)
            ON CONFLICT (patient_id, symptom_name, streak_length) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(summary.patient_id)
        .bind(summary.clinician_id)
        .bind(&summary.patient_name)
        .bind(&summary.symptom_name)
        .bind(to_i32(summary.streak_length))
        .bind(sequence)
        .bind(&summary.prompt)
        .bind(&summary.generated_text)
        .bind(summary.urgency.as_str())
        .bind(summary.generated_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| row.get("id")))
    }

    async fn mark_summary_read(&self, summary_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE postop_monitor.escalation_summaries
            SET read = TRUE
            WHERE id = $1
            "#,
        )
        .bind(summary_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("summary {summary_id}")));
        }
        Ok(())
    }

    async fn insert_notification(
        &self,
        clinician_id: Uuid,
        notification: NewNotification,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO postop_monitor.notifications
            (id, clinician_id, patient_id, kind, summary_id, log_id, urgency, title, message, read)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(id)
        .bind(clinician_id)
        .bind(notification.patient_id)
        .bind(notification.kind.as_str())
        .bind(notification.summary_id)
        .bind(notification.log_id)
        .bind(notification.urgency.map(|urgency| urgency.as_str()))
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(notification.read)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn insert_log(&self, log: &SymptomLog) -> Result<(), StoreError> {
        insert_log_row(&self.pool, log, None).await?;
        Ok(())
    }
}

pub async fn fetch_patient(pool: &PgPool, patient_id: Uuid) -> Result<Patient, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT id, full_name, age, diagnosis, risk_level, assigned_clinician_id, retired
        FROM postop_monitor.patients
        WHERE id = $1
        "#,
    )
    .bind(patient_id)
    .fetch_all(pool)
    .await?;

    patients_with_medications(pool, rows)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| StoreError::NotFound(format!("patient {patient_id}")))
}

async fn fetch_roster(pool: &PgPool, clinician_id: Uuid) -> Result<Vec<Patient>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT id, full_name, age, diagnosis, risk_level, assigned_clinician_id, retired
        FROM postop_monitor.patients
        WHERE assigned_clinician_id = $1 AND NOT retired
        ORDER BY created_at, full_name
        "#,
    )
    .bind(clinician_id)
    .fetch_all(pool)
    .await?;

    patients_with_medications(pool, rows).await
}

async fn patients_with_medications(
    pool: &PgPool,
    rows: Vec<PgRow>,
) -> Result<Vec<Patient>, StoreError> {
    let mut patients = Vec::with_capacity(rows.len());
    for row in rows {
        patients.push(patient_from_row(&row)?);
    }
    if patients.is_empty() {
        return Ok(patients);
    }

    let ids: Vec<Uuid> = patients.iter().map(|p| p.id).collect();
    let medication_rows = sqlx::query(
        r#"
        SELECT patient_id, name, dosage, frequency
        FROM postop_monitor.medications
        WHERE patient_id = ANY($1)
        ORDER BY name
        "#,
    )
    .bind(&ids)
    .fetch_all(pool)
    .await?;

    let mut medications: HashMap<Uuid, Vec<Medication>> = HashMap::new();
    for row in medication_rows {
        medications
            .entry(row.try_get("patient_id")?)
            .or_default()
            .push(Medication {
                name: row.try_get("name")?,
                dosage: row.try_get("dosage")?,
                frequency: row.try_get("frequency")?,
            });
    }

    for patient in &mut patients {
        patient.medications = medications.remove(&patient.id).unwrap_or_default();
    }
    Ok(patients)
}

fn patient_from_row(row: &PgRow) -> Result<Patient, StoreError> {
    let age: Option<i32> = row.try_get("age")?;
    let risk_label: String = row.try_get("risk_level")?;
    Ok(Patient {
        id: row.try_get("id")?,
        name: row.try_get("full_name")?,
        age: age.and_then(|age| u32::try_from(age).ok()),
        diagnosis: row.try_get("diagnosis")?,
        risk: RiskTier::parse_lenient(&risk_label),
        assigned_clinician_id: row.try_get("assigned_clinician_id")?,
        medications: Vec::new(),
        retired: row.try_get("retired")?,
    })
}

/// `limit = None` returns the full history.
async fn fetch_logs(
    pool: &PgPool,
    patient_id: Uuid,
    limit: Option<i64>,
) -> Result<Vec<SymptomLog>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT id, patient_id, submitted_at, log_date, symptoms, flagged
        FROM postop_monitor.symptom_logs
        WHERE patient_id = $1
        ORDER BY submitted_at DESC
        LIMIT $2
        "#,
    )
    .bind(patient_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut logs = Vec::with_capacity(rows.len());
    for row in rows {
        let symptoms: Json<Value> = row.try_get("symptoms")?;
        logs.push(SymptomLog {
            id: row.try_get("id")?,
            patient_id: row.try_get("patient_id")?,
            submitted_at: row.try_get("submitted_at")?,
            date: row.try_get("log_date")?,
            symptoms: entries_from_json(&symptoms.0),
            flagged: row.try_get("flagged")?,
        });
    }
    Ok(logs)
}

/// `patient_id = None` returns every summary addressed to the clinician.
pub async fn fetch_summaries(
    pool: &PgPool,
    patient_id: Option<Uuid>,
    clinician_id: Uuid,
) -> Result<Vec<EscalationSummary>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT id, patient_id, clinician_id, patient_name, symptom_name, streak_length,
               severity_sequence, prompt, generated_text, urgency, read, generated_at
        FROM postop_monitor.escalation_summaries
        WHERE clinician_id = $1 AND ($2::uuid IS NULL OR patient_id = $2)
        ORDER BY generated_at DESC
        "#,
    )
    .bind(clinician_id)
    .bind(patient_id)
    .fetch_all(pool)
    .await?;

    let mut summaries = Vec::with_capacity(rows.len());
    for row in rows {
        let streak_length: i32 = row.try_get("streak_length")?;
        let sequence: Vec<i32> = row.try_get("severity_sequence")?;
        let urgency: String = row.try_get("urgency")?;
        summaries.push(EscalationSummary {
            id: row.try_get("id")?,
            patient_id: row.try_get("patient_id")?,
            clinician_id: row.try_get("clinician_id")?,
            patient_name: row.try_get("patient_name")?,
            symptom_name: row.try_get("symptom_name")?,
            streak_length: u32::try_from(streak_length).unwrap_or(0),
            severity_sequence: sequence
                .into_iter()
                .map(|severity| severity_from_i64(i64::from(severity)).unwrap_or(0))
                .collect(),
            prompt: row.try_get("prompt")?,
            generated_text: row.try_get("generated_text")?,
            urgency: urgency.parse().unwrap_or(Urgency::Routine),
            read: row.try_get("read")?,
            generated_at: row.try_get("generated_at")?,
        });
    }
    Ok(summaries)
}

async fn count_unread_messages(
    pool: &PgPool,
    patient_id: Uuid,
    clinician_id: Uuid,
) -> Result<u32, StoreError> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM postop_monitor.messages
        WHERE sender_id = $1 AND recipient_id = $2 AND NOT read
        "#,
    )
    .bind(patient_id)
    .bind(clinician_id)
    .fetch_one(pool)
    .await?;
    Ok(u32::try_from(count).unwrap_or(u32::MAX))
}

/// Returns false when a log with the same id or source key already exists.
async fn insert_log_row(
    pool: &PgPool,
    log: &SymptomLog,
    source_key: Option<&str>,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO postop_monitor.symptom_logs
        (id, patient_id, submitted_at, log_date, symptoms, flagged, source_key)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(log.id)
    .bind(log.patient_id)
    .bind(log.submitted_at)
    .bind(log.date)
    .bind(Json(&log.symptoms))
    .bind(log.flagged)
    .bind(source_key)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Lenient decode of a stored symptom array. Unusable severities become `None`.
pub fn entries_from_json(value: &Value) -> Vec<SymptomEntry> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let name = item.get("name")?.as_str()?.trim();
            if name.is_empty() {
                return None;
            }
            let severity = match item.get("severity") {
                Some(Value::Number(n)) => n
                    .as_i64()
                    .or_else(|| n.as_f64().map(|f| f.round() as i64))
                    .and_then(severity_from_i64),
                Some(Value::String(s)) => s.trim().parse::<i64>().ok().and_then(severity_from_i64),
                _ => None,
            };
            let note = item
                .get("note")
                .and_then(Value::as_str)
                .map(str::to_string);
            Some(SymptomEntry {
                name: name.to_string(),
                severity,
                note,
            })
        })
        .collect()
}

pub fn severity_from_i64(value: i64) -> Option<u8> {
    match value {
        0..=10 => u8::try_from(value).ok(),
        _ => None,
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let clinician_id = Uuid::parse_str(DEMO_CLINICIAN_ID)?;
    let patients = vec![
        (
            Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?,
            "Ananya Rao",
            64,
            "Total knee replacement",
            "high",
        ),
        (
            Uuid::parse_str("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")?,
            "Rohan Mehta",
            52,
            "Laparoscopic cholecystectomy",
            "medium",
        ),
        (
            Uuid::parse_str("d5a0a1a2-2a3c-44c2-8f73-60b7897a9dd2")?,
            "Farah Khan",
            71,
            "Coronary artery bypass graft",
            "critical",
        ),
    ];

    for (id, name, age, diagnosis, risk) in &patients {
        sqlx::query(
            r#"
            INSERT INTO postop_monitor.patients
            (id, full_name, age, diagnosis, risk_level, assigned_clinician_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET full_name = EXCLUDED.full_name,
                age = EXCLUDED.age,
                diagnosis = EXCLUDED.diagnosis,
                risk_level = EXCLUDED.risk_level,
                assigned_clinician_id = EXCLUDED.assigned_clinician_id
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(age)
        .bind(diagnosis)
        .bind(risk)
        .bind(clinician_id)
        .execute(pool)
        .await?;
    }

    let medications = vec![
        (patients[0].0, "Paracetamol", "1 g", "every 6 hours"),
        (patients[0].0, "Enoxaparin", "40 mg", "once daily"),
        (patients[1].0, "Ibuprofen", "400 mg", "every 8 hours"),
        (patients[2].0, "Aspirin", "75 mg", "once daily"),
        (patients[2].0, "Metoprolol", "25 mg", "twice daily"),
    ];

    for (patient_id, name, dosage, frequency) in medications {
        sqlx::query(
            r#"
            INSERT INTO postop_monitor.medications (id, patient_id, name, dosage, frequency)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (patient_id, name) DO UPDATE
            SET dosage = EXCLUDED.dosage, frequency = EXCLUDED.frequency
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(patient_id)
        .bind(name)
        .bind(dosage)
        .bind(frequency)
        .execute(pool)
        .await?;
    }

    let now = Utc::now();
    let logs = vec![
        (
            "seed-001",
            patients[0].0,
            now - ChronoDuration::hours(30),
            vec![
                SymptomEntry::new("Pain", 6),
                SymptomEntry::new("Fatigue", 5).with_note("Tired after physio"),
            ],
        ),
        (
            "seed-002",
            patients[0].0,
            now - ChronoDuration::hours(6),
            vec![SymptomEntry::new("Pain", 7), SymptomEntry::new("Fatigue", 6)],
        ),
        (
            "seed-003",
            patients[1].0,
            now - ChronoDuration::hours(50),
            vec![SymptomEntry::new("Nausea", 3)],
        ),
        (
            "seed-004",
            patients[2].0,
            now - ChronoDuration::hours(2),
            vec![
                SymptomEntry::new("Chest tightness", 8),
                SymptomEntry::new("Shortness of breath", 7),
            ],
        ),
    ];

    for (source_key, patient_id, submitted_at, symptoms) in logs {
        let log = SymptomLog::new(patient_id, submitted_at, symptoms);
        insert_log_row(pool, &log, Some(source_key)).await?;
    }

    sqlx::query(
        r#"
        INSERT INTO postop_monitor.messages (id, sender_id, recipient_id, body)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(Uuid::parse_str("a4c3e2b1-7d6f-4e5a-8b9c-0d1e2f3a4b5c")?)
    .bind(patients[2].0)
    .bind(clinician_id)
    .bind("Is it normal to feel breathless on the stairs?")
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CsvRow {
    pub patient_id: Uuid,
    pub full_name: String,
    pub risk: String,
    pub clinician_id: Uuid,
    pub submitted_at: DateTime<Utc>,
    pub symptom: String,
    pub severity: Option<i64>,
    pub note: Option<String>,
    pub source_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImportedLog {
    pub full_name: String,
    pub risk: RiskTier,
    pub clinician_id: Uuid,
    pub source_key: String,
    pub log: SymptomLog,
}

/// Rows sharing a patient and timestamp become one log, in file order.
pub fn group_import_rows(rows: Vec<CsvRow>) -> Vec<ImportedLog> {
    let mut order: Vec<(Uuid, DateTime<Utc>)> = Vec::new();
    let mut grouped: HashMap<(Uuid, DateTime<Utc>), Vec<CsvRow>> = HashMap::new();

    for row in rows {
        let key = (row.patient_id, row.submitted_at);
        if !grouped.contains_key(&key) {
            order.push(key);
        }
        grouped.entry(key).or_default().push(row);
    }

    order
        .into_iter()
        .filter_map(|key| grouped.remove(&key))
        .filter_map(|rows| {
            let first = rows.first()?.clone();
            let source_key = rows
                .iter()
                .filter_map(|row| row.source_key.as_deref())
                .map(str::trim)
                .find(|key| !key.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| {
                    format!(
                        "import-{}-{}",
                        first.patient_id,
                        first.submitted_at.timestamp()
                    )
                });
            let symptoms = rows
                .into_iter()
                .filter(|row| !row.symptom.trim().is_empty())
                .map(|row| SymptomEntry {
                    name: row.symptom.trim().to_string(),
                    severity: row.severity.and_then(severity_from_i64),
                    note: row.note.filter(|note| !note.trim().is_empty()),
                })
                .collect();
            Some(ImportedLog {
                full_name: first.full_name,
                risk: RiskTier::parse_lenient(&first.risk),
                clinician_id: first.clinician_id,
                source_key,
                log: SymptomLog::new(first.patient_id, first.submitted_at, symptoms),
            })
        })
        .collect()
}

/// Imports historical logs. Imported logs do not trigger escalation.
pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut rows = Vec::new();
    for result in reader.deserialize::<CsvRow>() {
        rows.push(result?);
    }

    let mut inserted = 0usize;
    for imported in group_import_rows(rows) {
        sqlx::query(
            r#"
            INSERT INTO postop_monitor.patients
            (id, full_name, risk_level, assigned_clinician_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET full_name = EXCLUDED.full_name,
                risk_level = EXCLUDED.risk_level,
                assigned_clinician_id = EXCLUDED.assigned_clinician_id
            "#,
        )
        .bind(imported.log.patient_id)
        .bind(&imported.full_name)
        .bind(imported.risk.as_str())
        .bind(imported.clinician_id)
        .execute(pool)
        .await?;

        if insert_log_row(pool, &imported.log, Some(&imported.source_key)).await? {
            inserted += 1;
        }
    }

    Ok(inserted)
}
