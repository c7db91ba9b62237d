//! The live priority engine for one clinician's roster.
//!
//! A single task owns the subscription registry, the per-patient state and the ranker.
//! Roster snapshots, stream events and the refresh timer are handled one at a time in
//! that task, so per-patient state is never mutated concurrently.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, StoreError};
use crate::models::{EscalationSummary, Patient, RankedPatient};
use crate::ranker::Ranker;
use crate::state::{RosterState, StreamEvent, StreamUpdate};
use crate::store::{RecordStore, RecordStream};
use crate::subscriptions::SubscriptionManager;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for deterministic scoring.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct MonitorEngine {
    store: Arc<dyn RecordStore>,
    clinician_id: Uuid,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
}

impl MonitorEngine {
    pub fn new(store: Arc<dyn RecordStore>, clinician_id: Uuid, config: EngineConfig) -> Self {
        Self {
            store,
            clinician_id,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Subscribes to the roster and starts the event loop on its own task.
    pub async fn spawn(self) -> Result<EngineHandle, EngineError> {
        let roster = self.store.subscribe_roster(self.clinician_id).await?;
        let (subscriptions, events) =
            SubscriptionManager::new(Arc::clone(&self.store), self.clinician_id);
        let ranker = Ranker::new();
        let rankings = ranker.subscribe();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tracing::info!(
            clinician_id = %self.clinician_id,
            refresh_secs = self.config.refresh_interval.as_secs(),
            "Priority engine starting"
        );

        let event_loop = EventLoop {
            clinician_id: self.clinician_id,
            clock: self.clock,
            subscriptions,
            ranker,
        };
        let task = tokio::spawn(event_loop.run(
            roster,
            events,
            shutdown_rx,
            self.config.refresh_interval,
            self.config.retry_interval,
        ));

        Ok(EngineHandle {
            shutdown: Some(shutdown_tx),
            rankings,
            task,
        })
    }
}

/// Controls a running engine. Dropping the handle also stops the engine.
pub struct EngineHandle {
    shutdown: Option<oneshot::Sender<()>>,
    rankings: watch::Receiver<Vec<RankedPatient>>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    pub fn rankings(&self) -> watch::Receiver<Vec<RankedPatient>> {
        self.rankings.clone()
    }

    pub fn latest(&self) -> Vec<RankedPatient> {
        self.rankings.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels every subscription and waits for the loop to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            if !e.is_cancelled() {
                tracing::error!(error = %e, "Priority engine task failed");
            }
        }
    }
}

struct EventLoop {
    clinician_id: Uuid,
    clock: Arc<dyn Clock>,
    subscriptions: SubscriptionManager,
    ranker: Ranker,
}

impl EventLoop {
    async fn run(
        mut self,
        mut roster: RecordStream<Vec<Patient>>,
        mut events: mpsc::Receiver<StreamEvent>,
        mut shutdown: oneshot::Receiver<()>,
        refresh_interval: std::time::Duration,
        retry_interval: std::time::Duration,
    ) {
        let mut refresh = tokio::time::interval(refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        refresh.tick().await;
        let mut retry = tokio::time::interval(retry_interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        retry.tick().await;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(clinician_id = %self.clinician_id, "Priority engine shutting down");
                    break;
                }
                update = roster.next() => match update {
                    Some(Ok(patients)) => self.on_roster(&patients).await,
                    Some(Err(e)) => {
                        tracing::warn!(
                            clinician_id = %self.clinician_id,
                            error = %e,
                            "Roster stream error, keeping current subscriptions"
                        );
                    }
                    None => {
                        tracing::info!(clinician_id = %self.clinician_id, "Roster stream ended");
                        break;
                    }
                },
                Some(event) = events.recv() => self.on_event(event),
                _ = refresh.tick() => self.on_refresh(),
                _ = retry.tick() => self.on_retry().await,
            }
        }

        self.subscriptions.shutdown();
        self.ranker.publish();
    }

    async fn on_roster(&mut self, patients: &[Patient]) {
        let report = self.subscriptions.reconcile(patients).await;
        for patient_id in &report.closed {
            self.ranker.remove(patient_id);
        }

        let now = self.clock.now();
        for patient_id in report.opened.iter().chain(&report.refreshed) {
            if let Some((patient, score)) = self.subscriptions.score(patient_id, now) {
                self.ranker.update(patient, score);
            }
        }
        self.ranker.publish();
    }

    fn on_event(&mut self, event: StreamEvent) {
        let now = self.clock.now();
        if let Some((patient, score)) = self.subscriptions.handle_event(event, now) {
            self.ranker.update(patient, score);
            self.ranker.publish();
        }
    }

    /// Reopens streams that failed to open or were closed by the store.
    async fn on_retry(&mut self) {
        if self.subscriptions.has_missing_streams() {
            self.subscriptions.retry_failed_opens().await;
        }
    }

    fn on_refresh(&mut self) {
        let now = self.clock.now();
        for (patient, score) in self.subscriptions.score_all(now) {
            self.ranker.update(patient, score);
        }
        if self.ranker.publish() {
            tracing::debug!(clinician_id = %self.clinician_id, "Periodic rescore changed ranking");
        }
    }
}

/// One-shot view of a roster: current rankings plus every escalation summary.
#[derive(Debug, Clone, Default)]
pub struct RosterSnapshot {
    pub rankings: Vec<RankedPatient>,
    /// Newest first across all patients.
    pub summaries: Vec<EscalationSummary>,
}

/// Reads the first snapshot of every stream and scores it, without keeping anything open.
pub async fn snapshot_roster(
    store: &dyn RecordStore,
    clinician_id: Uuid,
    now: DateTime<Utc>,
) -> Result<RosterSnapshot, StoreError> {
    let patients = first_item(store.subscribe_roster(clinician_id).await?).await?;

    let mut state = RosterState::new();
    let mut ranker = Ranker::new();
    let mut summaries = Vec::new();

    for patient in patients.iter().filter(|p| !p.retired) {
        state.track(patient.clone(), 0);
        let logs = first_item(store.subscribe_logs(patient.id).await?).await?;
        let patient_summaries =
            first_item(store.subscribe_summaries(patient.id, clinician_id).await?).await?;
        let unread =
            first_item(store.subscribe_unread_messages(patient.id, clinician_id).await?).await?;

        summaries.extend(patient_summaries.iter().cloned());
        for update in [
            StreamUpdate::Logs(logs),
            StreamUpdate::Summaries(patient_summaries),
            StreamUpdate::UnreadMessages(unread),
        ] {
            state.apply(StreamEvent {
                patient_id: patient.id,
                epoch: 0,
                update,
            });
        }
        if let Some(score) = state.score(&patient.id, now) {
            ranker.update(patient, score);
        }
    }

    summaries.sort_by(|a, b| b.generated_at.cmp(&a.generated_at));
    Ok(RosterSnapshot {
        rankings: ranker.ranked(),
        summaries,
    })
}

async fn first_item<T>(mut stream: RecordStream<T>) -> Result<T, StoreError> {
    stream.next().await.unwrap_or(Err(StoreError::Closed))
}
