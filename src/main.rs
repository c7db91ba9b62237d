use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use postop_priority_engine::config::{EngineConfig, DEFAULT_LOG_FILTER};
use postop_priority_engine::db::{self, PgStore};
use postop_priority_engine::engine::{snapshot_roster, MonitorEngine};
use postop_priority_engine::escalation::{EscalationOutcome, EscalationPipeline};
use postop_priority_engine::llm::generator_from_config;
use postop_priority_engine::models::{RankedPatient, SymptomEntry, SymptomLog};
use postop_priority_engine::report;
use postop_priority_engine::store::RecordStore;
use postop_priority_engine::summary::SummaryGenerator;

#[derive(Parser)]
#[command(name = "postop-priority")]
#[command(about = "Post-operative patient prioritization and clinical escalation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a demo roster
    Seed,
    /// Import historical symptom logs from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Rank a clinician's patients once
    Score {
        #[arg(long, default_value = db::DEMO_CLINICIAN_ID)]
        clinician: Uuid,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Generate a markdown report
    Report {
        #[arg(long, default_value = db::DEMO_CLINICIAN_ID)]
        clinician: Uuid,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Submit a symptom log and run escalation checks
    Submit {
        #[arg(long)]
        patient: Uuid,
        /// Repeatable, as `Name=severity` or `Name=severity:note`
        #[arg(long = "symptom", required = true, value_parser = parse_symptom)]
        symptoms: Vec<SymptomEntry>,
    },
    /// Mark an escalation summary as reviewed
    Ack {
        #[arg(long)]
        summary: Uuid,
    },
    /// Keep a live ranking and print it whenever it changes
    Watch {
        #[arg(long, default_value = db::DEMO_CLINICIAN_ID)]
        clinician: Uuid,
    },
}

fn parse_symptom(raw: &str) -> Result<SymptomEntry, String> {
    let (name, rest) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected Name=severity, got `{raw}`"))?;
    let (severity, note) = match rest.split_once(':') {
        Some((severity, note)) => (severity, Some(note.trim())),
        None => (rest, None),
    };
    let severity: u8 = severity
        .trim()
        .parse()
        .map_err(|_| format!("invalid severity in `{raw}`"))?;
    if !(1..=10).contains(&severity) {
        return Err(format!("severity must be between 1 and 10 in `{raw}`"));
    }
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing symptom name in `{raw}`"));
    }

    let entry = SymptomEntry::new(name, severity);
    Ok(match note.filter(|note| !note.is_empty()) {
        Some(note) => entry.with_note(note),
        None => entry,
    })
}

fn print_rankings(rankings: &[RankedPatient], limit: usize) {
    if rankings.is_empty() {
        println!("No patients assigned.");
        return;
    }
    for (position, patient) in rankings.iter().take(limit).enumerate() {
        println!(
            "{:>2}. {} ({}) score {} [{}]",
            position + 1,
            patient.name,
            patient.risk,
            patient.score,
            patient.breakdown_text()
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = Arc::new(PgStore::new(pool.clone(), config.poll_interval));

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted for clinician {}.", db::DEMO_CLINICIAN_ID);
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(&pool, &csv).await?;
            println!("Inserted {inserted} symptom logs from {}.", csv.display());
        }
        Commands::Score { clinician, limit } => {
            let snapshot = snapshot_roster(store.as_ref(), clinician, Utc::now())
                .await
                .context("failed to read roster")?;
            println!("Patients by priority:");
            print_rankings(&snapshot.rankings, limit);
        }
        Commands::Report { clinician, out } => {
            let now = Utc::now();
            let snapshot = snapshot_roster(store.as_ref(), clinician, now)
                .await
                .context("failed to read roster")?;
            let report = report::build_report(
                &clinician.to_string(),
                now,
                &snapshot.rankings,
                &snapshot.summaries,
            );
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
        Commands::Submit { patient, symptoms } => {
            let patient = db::fetch_patient(&pool, patient)
                .await
                .context("failed to load patient")?;
            let clinician_id = patient
                .assigned_clinician_id
                .with_context(|| format!("{} has no assigned clinician", patient.name))?;

            let generator = generator_from_config(&config.generator);
            let pipeline = EscalationPipeline::new(
                store.clone() as Arc<dyn RecordStore>,
                SummaryGenerator::new(generator, config.generator.timeout),
                config.history_limit,
            );
            let log = SymptomLog::new(patient.id, Utc::now(), symptoms);
            let outcomes = pipeline.submit_log(&patient, clinician_id, log).await?;

            println!("Log recorded for {}.", patient.name);
            for outcome in outcomes {
                match outcome {
                    EscalationOutcome::Created {
                        symptom_name,
                        streak_length,
                        urgency,
                        ..
                    } => println!(
                        "Escalated {symptom_name} after {streak_length} consecutive logs ({urgency})."
                    ),
                    EscalationOutcome::Duplicate {
                        symptom_name,
                        streak_length,
                    } => println!(
                        "{symptom_name} streak of {streak_length} was already escalated."
                    ),
                    EscalationOutcome::Skipped {
                        symptom_name,
                        streak_length,
                    } => println!(
                        "Skipped {symptom_name} streak of {streak_length}: existence check failed."
                    ),
                    EscalationOutcome::Failed {
                        symptom_name,
                        error,
                        ..
                    } => println!("Could not escalate {symptom_name}: {error}"),
                }
            }
        }
        Commands::Ack { summary } => {
            store
                .mark_summary_read(summary)
                .await
                .with_context(|| format!("failed to mark summary {summary} as reviewed"))?;
            println!("Summary {summary} marked as reviewed.");
        }
        Commands::Watch { clinician } => {
            let engine = MonitorEngine::new(store.clone(), clinician, config.clone())
                .spawn()
                .await
                .context("failed to start priority engine")?;
            let mut updates = WatchStream::from_changes(engine.rankings());

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    update = updates.next() => match update {
                        Some(current) => {
                            println!("--- {} ---", Utc::now().format("%H:%M:%S"));
                            print_rankings(&current, usize::MAX);
                        }
                        None => break,
                    },
                }
            }

            engine.shutdown().await;
            println!("Stopped watching.");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_symptom_arguments() {
        let entry = parse_symptom("Pain=7").unwrap();
        assert_eq!(entry.name, "Pain");
        assert_eq!(entry.severity, Some(7));

        let entry = parse_symptom("Fatigue = 5 : after walking").unwrap();
        assert_eq!(entry.name, "Fatigue");
        assert_eq!(entry.note.as_deref(), Some("after walking"));

        assert!(parse_symptom("Pain").is_err());
        assert!(parse_symptom("Pain=11").is_err());
        assert!(parse_symptom("=4").is_err());
    }
}
