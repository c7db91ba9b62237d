//! Per-patient stream registry reconciled against roster membership.
//!
//! The registry is the sole owner of every cancellation handle. A patient leaving the
//! roster has all of its forwarders aborted and its cached state dropped in the same
//! step; anything a forwarder had already queued is discarded by the epoch check in
//! [`RosterState::apply`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{CompositeScore, Patient};
use crate::state::{Applied, RosterState, StreamEvent, StreamUpdate};
use crate::store::{RecordStore, RecordStream, StreamKind};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

struct PatientSubscriptions {
    epoch: u64,
    handles: HashMap<StreamKind, AbortHandle>,
}

impl PatientSubscriptions {
    fn cancel_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.abort();
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub opened: Vec<Uuid>,
    pub closed: Vec<Uuid>,
    pub retained: Vec<Uuid>,
    /// Retained patients whose roster attributes changed.
    pub refreshed: Vec<Uuid>,
    pub failed_opens: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.opened.is_empty() && self.closed.is_empty() && self.refreshed.is_empty()
    }
}

pub struct SubscriptionManager {
    store: Arc<dyn RecordStore>,
    clinician_id: Uuid,
    events: mpsc::Sender<StreamEvent>,
    registry: HashMap<Uuid, PatientSubscriptions>,
    state: RosterState,
    next_epoch: u64,
}

impl SubscriptionManager {
    /// Returns the manager and the receiver every stream event is delivered to.
    pub fn new(
        store: Arc<dyn RecordStore>,
        clinician_id: Uuid,
    ) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let manager = Self {
            store,
            clinician_id,
            events,
            registry: HashMap::new(),
            state: RosterState::new(),
            next_epoch: 1,
        };
        (manager, rx)
    }

    pub async fn reconcile(&mut self, roster: &[Patient]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let desired: HashSet<Uuid> = roster
            .iter()
            .filter(|p| !p.retired)
            .map(|p| p.id)
            .collect();

        let leaving: Vec<Uuid> = self
            .registry
            .keys()
            .filter(|id| !desired.contains(id))
            .copied()
            .collect();
        for patient_id in leaving {
            self.close(&patient_id);
            report.closed.push(patient_id);
        }

        let mut seen = HashSet::new();
        for patient in roster.iter().filter(|p| !p.retired) {
            if !seen.insert(patient.id) {
                continue;
            }

            let epoch = match self.registry.get(&patient.id) {
                Some(existing) => {
                    if self.state.refresh_patient(patient) {
                        report.refreshed.push(patient.id);
                    }
                    report.retained.push(patient.id);
                    existing.epoch
                }
                None => {
                    let epoch = self.next_epoch;
                    self.next_epoch += 1;
                    self.registry.insert(
                        patient.id,
                        PatientSubscriptions {
                            epoch,
                            handles: HashMap::new(),
                        },
                    );
                    self.state.track(patient.clone(), epoch);
                    report.opened.push(patient.id);
                    epoch
                }
            };

            report.failed_opens += self.open_missing(patient.id, epoch).await;
        }

        if !report.is_noop() {
            tracing::info!(
                clinician_id = %self.clinician_id,
                opened = report.opened.len(),
                closed = report.closed.len(),
                retained = report.retained.len(),
                failed_opens = report.failed_opens,
                "Roster reconciled"
            );
        }
        report
    }

    /// Reopens streams that failed to open or were ended by the store, for every
    /// tracked patient. Returns the number that failed again.
    pub async fn retry_failed_opens(&mut self) -> usize {
        let missing: Vec<(Uuid, u64)> = self
            .registry
            .iter()
            .filter(|(_, subs)| subs.handles.len() < StreamKind::ALL.len())
            .map(|(id, subs)| (*id, subs.epoch))
            .collect();
        if missing.is_empty() {
            return 0;
        }

        let mut failures = 0;
        for (patient_id, epoch) in &missing {
            failures += self.open_missing(*patient_id, *epoch).await;
        }
        tracing::info!(
            clinician_id = %self.clinician_id,
            patients = missing.len(),
            failed_opens = failures,
            "Retried missing patient streams"
        );
        failures
    }

    pub fn has_missing_streams(&self) -> bool {
        self.registry
            .values()
            .any(|subs| subs.handles.len() < StreamKind::ALL.len())
    }

    /// Opens whichever stream kinds the patient is missing. Returns the number that failed.
    async fn open_missing(&mut self, patient_id: Uuid, epoch: u64) -> usize {
        let mut failures = 0;
        for kind in StreamKind::ALL {
            let already_open = self
                .registry
                .get(&patient_id)
                .is_some_and(|subs| subs.handles.contains_key(&kind));
            if already_open {
                continue;
            }

            match self.open(patient_id, epoch, kind).await {
                Ok(handle) => {
                    if let Some(subs) = self.registry.get_mut(&patient_id) {
                        subs.handles.insert(kind, handle);
                    } else {
                        handle.abort();
                    }
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        patient_id = %patient_id,
                        stream = kind.as_str(),
                        error = %e,
                        "Failed to open patient stream"
                    );
                }
            }
        }
        failures
    }

    async fn open(
        &self,
        patient_id: Uuid,
        epoch: u64,
        kind: StreamKind,
    ) -> Result<AbortHandle, StoreError> {
        let tx = self.events.clone();
        let handle = match kind {
            StreamKind::Logs => {
                let stream = self.store.subscribe_logs(patient_id).await?;
                spawn_forwarder(stream, tx, patient_id, epoch, kind, StreamUpdate::Logs)
            }
            StreamKind::Summaries => {
                let stream = self
                    .store
                    .subscribe_summaries(patient_id, self.clinician_id)
                    .await?;
                spawn_forwarder(stream, tx, patient_id, epoch, kind, StreamUpdate::Summaries)
            }
            StreamKind::UnreadMessages => {
                let stream = self
                    .store
                    .subscribe_unread_messages(patient_id, self.clinician_id)
                    .await?;
                spawn_forwarder(
                    stream,
                    tx,
                    patient_id,
                    epoch,
                    kind,
                    StreamUpdate::UnreadMessages,
                )
            }
        };
        tracing::debug!(patient_id = %patient_id, stream = kind.as_str(), "Patient stream opened");
        Ok(handle)
    }

    fn close(&mut self, patient_id: &Uuid) {
        if let Some(mut subs) = self.registry.remove(patient_id) {
            subs.cancel_all();
        }
        self.state.forget(patient_id);
        tracing::debug!(patient_id = %patient_id, "Patient streams closed");
    }

    /// Applies one stream event and rescores the patient it belongs to.
    pub fn handle_event(
        &mut self,
        event: StreamEvent,
        now: DateTime<Utc>,
    ) -> Option<(&Patient, CompositeScore)> {
        let patient_id = event.patient_id;
        let kind = event.update.kind();
        if let StreamUpdate::Ended(_) = event.update {
            self.stream_ended(patient_id, event.epoch, kind);
            return None;
        }
        match self.state.apply(event) {
            Applied::Updated => {
                let state = self.state.get(&patient_id)?;
                let score = state.score(now);
                tracing::debug!(
                    patient_id = %patient_id,
                    stream = kind.as_str(),
                    score = score.score,
                    "Patient rescored"
                );
                Some((&state.patient, score))
            }
            Applied::Ignored => {
                tracing::trace!(
                    patient_id = %patient_id,
                    stream = kind.as_str(),
                    "Dropped event for untracked subscription"
                );
                None
            }
        }
    }

    /// Forgets the handle of a stream the store closed so the next retry reopens it.
    fn stream_ended(&mut self, patient_id: Uuid, epoch: u64, kind: StreamKind) {
        let Some(subs) = self.registry.get_mut(&patient_id) else {
            return;
        };
        if subs.epoch != epoch {
            return;
        }
        if subs.handles.remove(&kind).is_some() {
            tracing::warn!(
                patient_id = %patient_id,
                stream = kind.as_str(),
                "Patient stream ended, will reopen"
            );
        }
    }

    pub fn score(
        &self,
        patient_id: &Uuid,
        now: DateTime<Utc>,
    ) -> Option<(&Patient, CompositeScore)> {
        self.state
            .get(patient_id)
            .map(|state| (&state.patient, state.score(now)))
    }

    pub fn score_all(&self, now: DateTime<Utc>) -> Vec<(&Patient, CompositeScore)> {
        self.state.score_all(now)
    }

    pub fn is_tracking(&self, patient_id: &Uuid) -> bool {
        self.registry.contains_key(patient_id)
    }

    pub fn tracked_patients(&self) -> usize {
        self.registry.len()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.registry.values().map(|subs| subs.handles.len()).sum()
    }

    /// Cancels every open stream and forgets all cached state.
    pub fn shutdown(&mut self) {
        let ids: Vec<Uuid> = self.registry.keys().copied().collect();
        for patient_id in &ids {
            self.close(patient_id);
        }
        if !ids.is_empty() {
            tracing::info!(
                clinician_id = %self.clinician_id,
                patients = ids.len(),
                "All patient streams cancelled"
            );
        }
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        for subs in self.registry.values_mut() {
            subs.cancel_all();
        }
    }
}

fn spawn_forwarder<T, F>(
    mut stream: RecordStream<T>,
    tx: mpsc::Sender<StreamEvent>,
    patient_id: Uuid,
    epoch: u64,
    kind: StreamKind,
    wrap: F,
) -> AbortHandle
where
    T: Send + 'static,
    F: Fn(T) -> StreamUpdate + Send + 'static,
{
    let task = tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(value) => {
                    let event = StreamEvent {
                        patient_id,
                        epoch,
                        update: wrap(value),
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        patient_id = %patient_id,
                        stream = kind.as_str(),
                        error = %e,
                        "Patient stream error, keeping last known state"
                    );
                }
            }
        }
        tracing::debug!(patient_id = %patient_id, stream = kind.as_str(), "Patient stream ended");
        let ended = StreamEvent {
            patient_id,
            epoch,
            update: StreamUpdate::Ended(kind),
        };
        let _ = tx.send(ended).await;
    });
    task.abort_handle()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::models::RiskTier;

    fn roster_patient(name: &str, clinician: Uuid) -> Patient {
        let mut patient = Patient::new(Uuid::new_v4(), name, RiskTier::Medium);
        patient.assigned_clinician_id = Some(clinician);
        patient
    }

    /// Lets aborted forwarders finish unwinding.
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn manager(
        store: &MemoryStore,
        clinician: Uuid,
    ) -> (SubscriptionManager, mpsc::Receiver<StreamEvent>) {
        SubscriptionManager::new(Arc::new(store.clone()), clinician)
    }

    #[tokio::test]
    async fn opens_one_subscription_per_stream_and_is_idempotent() {
        let store = MemoryStore::new();
        let clinician = Uuid::new_v4();
        let (mut subs, _rx) = manager(&store, clinician);
        let roster = vec![
            roster_patient("Farah", clinician),
            roster_patient("Gautam", clinician),
        ];

        let first = subs.reconcile(&roster).await;
        assert_eq!(first.opened.len(), 2);
        assert_eq!(subs.active_subscriptions(), 6);
        assert_eq!(store.subscriptions_opened(), 6);

        let second = subs.reconcile(&roster).await;
        assert!(second.is_noop());
        assert_eq!(second.retained.len(), 2);
        assert_eq!(subs.active_subscriptions(), 6);
        assert_eq!(store.subscriptions_opened(), 6);
    }

    #[tokio::test]
    async fn removal_cancels_streams_and_discards_state() {
        let store = MemoryStore::new();
        let clinician = Uuid::new_v4();
        let (mut subs, _rx) = manager(&store, clinician);
        let staying = roster_patient("Hina", clinician);
        let leaving = roster_patient("Imran", clinician);

        subs.reconcile(&[staying.clone(), leaving.clone()]).await;
        let report = subs.reconcile(&[staying.clone()]).await;

        assert_eq!(report.closed, vec![leaving.id]);
        assert!(!subs.is_tracking(&leaving.id));
        assert!(subs.score(&leaving.id, Utc::now()).is_none());
        assert_eq!(subs.active_subscriptions(), 3);

        settle().await;
        assert_eq!(store.open_streams(), 3);
    }

    #[tokio::test]
    async fn open_failure_is_isolated_and_retried_on_next_roster() {
        let store = MemoryStore::new();
        let clinician = Uuid::new_v4();
        let (mut subs, _rx) = manager(&store, clinician);
        let flaky = roster_patient("Jaya", clinician);
        let healthy = roster_patient("Karan", clinician);
        store.fail_next_subscribe(StreamKind::Summaries, flaky.id);

        let report = subs.reconcile(&[flaky.clone(), healthy.clone()]).await;
        assert_eq!(report.failed_opens, 1);
        assert_eq!(subs.active_subscriptions(), 5);
        assert!(subs.is_tracking(&flaky.id));

        let retry = subs.reconcile(&[flaky, healthy]).await;
        assert_eq!(retry.failed_opens, 0);
        assert_eq!(subs.active_subscriptions(), 6);
    }

    #[tokio::test]
    async fn failed_opens_are_retried_without_a_roster_change() {
        let store = MemoryStore::new();
        let clinician = Uuid::new_v4();
        let (mut subs, _rx) = manager(&store, clinician);
        let flaky = roster_patient("Jaya", clinician);
        store.fail_next_subscribe(StreamKind::Summaries, flaky.id);

        subs.reconcile(&[flaky.clone()]).await;
        assert!(subs.has_missing_streams());
        assert_eq!(subs.active_subscriptions(), 2);

        assert_eq!(subs.retry_failed_opens().await, 0);
        assert!(!subs.has_missing_streams());
        assert_eq!(subs.active_subscriptions(), 3);
        assert_eq!(subs.retry_failed_opens().await, 0);
        assert_eq!(store.subscriptions_opened(), 3);
    }

    #[tokio::test]
    async fn ended_stream_is_reopened_on_retry() {
        let store = MemoryStore::new();
        let clinician = Uuid::new_v4();
        let (mut subs, mut rx) = manager(&store, clinician);
        let patient = roster_patient("Lalit", clinician);
        subs.reconcile(&[patient.clone()]).await;

        store.end_streams(StreamKind::Logs, patient.id);
        loop {
            let event = rx.recv().await.unwrap();
            let ended = matches!(event.update, StreamUpdate::Ended(StreamKind::Logs));
            subs.handle_event(event, Utc::now());
            if ended {
                break;
            }
        }
        assert!(subs.has_missing_streams());
        assert_eq!(subs.active_subscriptions(), 2);

        subs.retry_failed_opens().await;
        assert_eq!(subs.active_subscriptions(), 3);
        assert_eq!(store.subscriptions_opened(), 4);
    }

    #[tokio::test]
    async fn late_events_for_removed_patients_are_dropped() {
        let store = MemoryStore::new();
        let clinician = Uuid::new_v4();
        let (mut subs, mut rx) = manager(&store, clinician);
        let patient = roster_patient("Lata", clinician);

        subs.reconcile(&[patient.clone()]).await;
        let event = rx.recv().await.unwrap();
        subs.reconcile(&[]).await;

        assert!(subs.handle_event(event, Utc::now()).is_none());
    }

    #[tokio::test]
    async fn risk_change_refreshes_without_resubscribing() {
        let store = MemoryStore::new();
        let clinician = Uuid::new_v4();
        let (mut subs, _rx) = manager(&store, clinician);
        let mut patient = roster_patient("Manav", clinician);

        subs.reconcile(&[patient.clone()]).await;
        patient.risk = RiskTier::Critical;
        let report = subs.reconcile(&[patient.clone()]).await;

        assert_eq!(report.refreshed, vec![patient.id]);
        assert_eq!(store.subscriptions_opened(), 3);
        let (_, score) = subs.score(&patient.id, Utc::now()).unwrap();
        assert_eq!(score.breakdown[0].points, 40);
    }

    #[tokio::test]
    async fn shutdown_cancels_everything() {
        let store = MemoryStore::new();
        let clinician = Uuid::new_v4();
        let (mut subs, _rx) = manager(&store, clinician);
        subs.reconcile(&[roster_patient("Nisha", clinician)]).await;

        subs.shutdown();
        assert_eq!(subs.active_subscriptions(), 0);
        assert_eq!(subs.tracked_patients(), 0);
        settle().await;
        assert_eq!(store.open_streams(), 0);
    }
}
