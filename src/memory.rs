//! In-process record store.
//!
//! Backs tests and offline demos. Every mutation bumps a revision on a `watch` channel;
//! open subscriptions re-read their snapshot on each bump and yield only when it changed,
//! which matches how the Postgres store's polling streams behave.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::watch;
use uuid::Uuid;

use crate::dedup::DedupKey;
use crate::error::StoreError;
use crate::models::{
    EscalationSummary, NewEscalationSummary, NewNotification, Patient, SymptomLog,
};
use crate::store::{RecordStore, RecordStream, StreamKind};

#[derive(Debug, Clone)]
pub struct StoredNotification {
    pub id: Uuid,
    pub clinician_id: Uuid,
    pub notification: NewNotification,
}

#[derive(Default)]
struct State {
    patients: Vec<Patient>,
    logs: HashMap<Uuid, Vec<SymptomLog>>,
    summaries: Vec<EscalationSummary>,
    unread: HashMap<(Uuid, Uuid), u32>,
    notifications: Vec<StoredNotification>,
    failing_subscribes: HashSet<(StreamKind, Uuid)>,
    pending_stream_errors: Vec<(StreamKind, Uuid)>,
    pending_stream_ends: HashSet<(StreamKind, Uuid)>,
    fail_existence_checks: bool,
}

struct Shared {
    state: Mutex<State>,
    revision: watch::Sender<u64>,
    subscriptions_opened: AtomicUsize,
    open_streams: Arc<AtomicUsize>,
    summary_writes: AtomicUsize,
}

#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the open-stream gauge when a subscription is dropped.
struct StreamGuard(Arc<AtomicUsize>);

impl StreamGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0u64);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                revision,
                subscriptions_opened: AtomicUsize::new(0),
                open_streams: Arc::new(AtomicUsize::new(0)),
                summary_writes: AtomicUsize::new(0),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let result = {
            let mut state = self.state();
            f(&mut state)
        };
        self.shared.revision.send_modify(|rev| *rev += 1);
        result
    }

    /// Inserts or replaces a patient, keeping the original roster position.
    pub fn put_patient(&self, patient: Patient) {
        self.mutate(|state| {
            match state.patients.iter_mut().find(|p| p.id == patient.id) {
                Some(existing) => *existing = patient,
                None => state.patients.push(patient),
            }
        });
    }

    pub fn remove_patient(&self, patient_id: Uuid) {
        self.mutate(|state| state.patients.retain(|p| p.id != patient_id));
    }

    /// Adds a log without going through the escalation flow.
    pub fn push_log(&self, log: SymptomLog) {
        self.mutate(|state| insert_newest_first(state.logs.entry(log.patient_id).or_default(), log));
    }

    pub fn set_unread_messages(&self, patient_id: Uuid, clinician_id: Uuid, count: u32) {
        self.mutate(|state| {
            state.unread.insert((patient_id, clinician_id), count);
        });
    }

    /// The next subscription of `kind` for `patient_id` fails to open.
    pub fn fail_next_subscribe(&self, kind: StreamKind, patient_id: Uuid) {
        self.state().failing_subscribes.insert((kind, patient_id));
    }

    /// Delivers one `Err` item on the matching open stream.
    pub fn inject_stream_error(&self, kind: StreamKind, patient_id: Uuid) {
        self.mutate(|state| state.pending_stream_errors.push((kind, patient_id)));
    }

    /// Ends the matching open stream as if the store had closed it.
    pub fn end_streams(&self, kind: StreamKind, patient_id: Uuid) {
        self.mutate(|state| {
            state.pending_stream_ends.insert((kind, patient_id));
        });
    }

    pub fn fail_existence_checks(&self, fail: bool) {
        self.state().fail_existence_checks = fail;
    }

    pub fn summaries(&self) -> Vec<EscalationSummary> {
        self.state().summaries.clone()
    }

    pub fn notifications(&self) -> Vec<StoredNotification> {
        self.state().notifications.clone()
    }

    pub fn summary_write_count(&self) -> usize {
        self.shared.summary_writes.load(Ordering::SeqCst)
    }

    pub fn subscriptions_opened(&self) -> usize {
        self.shared.subscriptions_opened.load(Ordering::SeqCst)
    }

    /// Streams currently alive, i.e. opened and not yet dropped.
    pub fn open_streams(&self) -> usize {
        self.shared.open_streams.load(Ordering::SeqCst)
    }

    fn open_snapshot_stream<T, F>(
        &self,
        kind: Option<(StreamKind, Uuid)>,
        query: F,
    ) -> Result<RecordStream<T>, StoreError>
    where
        T: Clone + PartialEq + Send + 'static,
        F: Fn(&State) -> T + Send + Sync + 'static,
    {
        if let Some(target) = kind {
            if self.state().failing_subscribes.remove(&target) {
                return Err(StoreError::Unavailable(format!(
                    "cannot open {} stream for {}",
                    target.0.as_str(),
                    target.1
                )));
            }
        }

        self.shared.subscriptions_opened.fetch_add(1, Ordering::SeqCst);
        let guard = StreamGuard::new(&self.shared.open_streams);
        let rx = self.shared.revision.subscribe();
        let store = self.clone();
        let seed = (store, rx, None::<T>, query, guard);

        let stream = futures_util::stream::unfold(
            seed,
            move |(store, mut rx, last, query, guard)| async move {
                loop {
                    if let Some(target) = kind {
                        if store.state().pending_stream_ends.remove(&target) {
                            return None;
                        }
                        let injected = {
                            let mut state = store.state();
                            let position = state
                                .pending_stream_errors
                                .iter()
                                .position(|pending| *pending == target);
                            position.map(|idx| state.pending_stream_errors.remove(idx))
                        };
                        if injected.is_some() {
                            let err = StoreError::Unavailable(format!(
                                "injected {} stream error",
                                target.0.as_str()
                            ));
                            return Some((Err(err), (store, rx, last, query, guard)));
                        }
                    }

                    let current = {
                        let state = store.state();
                        query(&*state)
                    };
                    if last.as_ref() != Some(&current) {
                        let item = current.clone();
                        return Some((Ok(item), (store, rx, Some(current), query, guard)));
                    }

                    if rx.changed().await.is_err() {
                        return None;
                    }
                }
            },
        );

        Ok(stream.boxed())
    }
}

fn insert_newest_first(logs: &mut Vec<SymptomLog>, log: SymptomLog) {
    let position = logs
        .iter()
        .position(|existing| existing.submitted_at <= log.submitted_at)
        .unwrap_or(logs.len());
    logs.insert(position, log);
}

fn summaries_for(state: &State, patient_id: Uuid, clinician_id: Uuid) -> Vec<EscalationSummary> {
    let mut summaries: Vec<EscalationSummary> = state
        .summaries
        .iter()
        .rev()
        .filter(|s| s.patient_id == patient_id && s.clinician_id == clinician_id)
        .cloned()
        .collect();
    summaries.sort_by(|a, b| b.generated_at.cmp(&a.generated_at));
    summaries
}

fn summary_matches(summary: &EscalationSummary, key: &DedupKey) -> bool {
    summary.patient_id == key.patient_id
        && summary.symptom_name == key.symptom_name
        && summary.streak_length == key.streak_length
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn subscribe_roster(
        &self,
        clinician_id: Uuid,
    ) -> Result<RecordStream<Vec<Patient>>, StoreError> {
        self.open_snapshot_stream(None, move |state| {
            state
                .patients
                .iter()
                .filter(|p| p.assigned_clinician_id == Some(clinician_id) && !p.retired)
                .cloned()
                .collect()
        })
    }

    async fn subscribe_logs(
        &self,
        patient_id: Uuid,
    ) -> Result<RecordStream<Vec<SymptomLog>>, StoreError> {
        self.open_snapshot_stream(Some((StreamKind::Logs, patient_id)), move |state| {
            state.logs.get(&patient_id).cloned().unwrap_or_default()
        })
    }

    async fn subscribe_summaries(
        &self,
        patient_id: Uuid,
        clinician_id: Uuid,
    ) -> Result<RecordStream<Vec<EscalationSummary>>, StoreError> {
        self.open_snapshot_stream(Some((StreamKind::Summaries, patient_id)), move |state| {
            summaries_for(state, patient_id, clinician_id)
        })
    }

    async fn subscribe_unread_messages(
        &self,
        patient_id: Uuid,
        clinician_id: Uuid,
    ) -> Result<RecordStream<u32>, StoreError> {
        self.open_snapshot_stream(
            Some((StreamKind::UnreadMessages, patient_id)),
            move |state| {
                state
                    .unread
                    .get(&(patient_id, clinician_id))
                    .copied()
                    .unwrap_or(0)
            },
        )
    }

    async fn recent_logs(
        &self,
        patient_id: Uuid,
        limit: usize,
    ) -> Result<Vec<SymptomLog>, StoreError> {
        let state = self.state();
        Ok(state
            .logs
            .get(&patient_id)
            .map(|logs| logs.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn summary_exists(&self, key: &DedupKey) -> Result<bool, StoreError> {
        let state = self.state();
        if state.fail_existence_checks {
            return Err(StoreError::Unavailable("existence check failed".to_string()));
        }
        Ok(state.summaries.iter().any(|s| summary_matches(s, key)))
    }

    async fn insert_summary_if_absent(
        &self,
        summary: NewEscalationSummary,
    ) -> Result<Option<Uuid>, StoreError> {
        let key = DedupKey::for_summary(&summary);
        let inserted = self.mutate(|state| {
            if state.summaries.iter().any(|s| summary_matches(s, &key)) {
                return None;
            }
            let id = Uuid::new_v4();
            state.summaries.push(summary.into_summary(id));
            Some(id)
        });
        if inserted.is_some() {
            self.shared.summary_writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(inserted)
    }

    async fn mark_summary_read(&self, summary_id: Uuid) -> Result<(), StoreError> {
        let found = self.mutate(|state| {
            match state.summaries.iter_mut().find(|s| s.id == summary_id) {
                Some(summary) => {
                    summary.read = true;
                    true
                }
                None => false,
            }
        });
        if found {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("summary {summary_id}")))
        }
    }

    async fn insert_notification(
        &self,
        clinician_id: Uuid,
        notification: NewNotification,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        self.mutate(|state| {
            state.notifications.push(StoredNotification {
                id,
                clinician_id,
                notification,
            })
        });
        Ok(id)
    }

    async fn insert_log(&self, log: &SymptomLog) -> Result<(), StoreError> {
        self.push_log(log.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RiskTier, SymptomEntry};
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn log_stream_yields_snapshots_on_change_only() {
        let store = MemoryStore::new();
        let patient_id = Uuid::new_v4();
        let mut logs = store.subscribe_logs(patient_id).await.unwrap();

        let first = logs.next().await.unwrap().unwrap();
        assert!(first.is_empty());

        let older = SymptomLog::new(
            patient_id,
            Utc::now() - Duration::hours(5),
            vec![SymptomEntry::new("Pain", 4)],
        );
        let newer = SymptomLog::new(patient_id, Utc::now(), vec![SymptomEntry::new("Pain", 6)]);
        store.push_log(newer.clone());
        let snapshot = logs.next().await.unwrap().unwrap();
        assert_eq!(snapshot, vec![newer.clone()]);

        store.push_log(older.clone());
        let snapshot = logs.next().await.unwrap().unwrap();
        assert_eq!(snapshot, vec![newer, older]);
    }

    #[tokio::test]
    async fn roster_excludes_other_clinicians_and_retired_patients() {
        let store = MemoryStore::new();
        let clinician = Uuid::new_v4();

        let mut mine = Patient::new(Uuid::new_v4(), "Meera Iyer", RiskTier::High);
        mine.assigned_clinician_id = Some(clinician);
        let mut retired = Patient::new(Uuid::new_v4(), "Kabir Shah", RiskTier::Low);
        retired.assigned_clinician_id = Some(clinician);
        retired.retired = true;
        let other = Patient::new(Uuid::new_v4(), "Zoya Khan", RiskTier::Critical);

        store.put_patient(mine.clone());
        store.put_patient(retired);
        store.put_patient(other);

        let mut roster = store.subscribe_roster(clinician).await.unwrap();
        assert_eq!(roster.next().await.unwrap().unwrap(), vec![mine]);
    }

    #[tokio::test]
    async fn dropping_a_stream_releases_it() {
        let store = MemoryStore::new();
        let stream = store.subscribe_unread_messages(Uuid::new_v4(), Uuid::new_v4()).await.unwrap();
        assert_eq!(store.open_streams(), 1);
        drop(stream);
        assert_eq!(store.open_streams(), 0);
        assert_eq!(store.subscriptions_opened(), 1);
    }

    #[tokio::test]
    async fn ended_stream_yields_none() {
        let store = MemoryStore::new();
        let patient_id = Uuid::new_v4();
        let mut logs = store.subscribe_logs(patient_id).await.unwrap();
        assert!(logs.next().await.unwrap().is_ok());

        store.end_streams(StreamKind::Logs, patient_id);
        assert!(logs.next().await.is_none());
        drop(logs);
        assert_eq!(store.open_streams(), 0);
    }

    #[tokio::test]
    async fn marking_unknown_summary_is_not_found() {
        let store = MemoryStore::new();
        let err = store.mark_summary_read(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn injected_failures_are_one_shot() {
        let store = MemoryStore::new();
        let patient_id = Uuid::new_v4();
        store.fail_next_subscribe(StreamKind::Logs, patient_id);
        assert!(store.subscribe_logs(patient_id).await.is_err());

        let mut logs = store.subscribe_logs(patient_id).await.unwrap();
        assert!(logs.next().await.unwrap().is_ok());
        store.inject_stream_error(StreamKind::Logs, patient_id);
        assert!(logs.next().await.unwrap().is_err());

        store.push_log(SymptomLog::new(patient_id, Utc::now(), vec![SymptomEntry::new("Pain", 3)]));
        assert_eq!(logs.next().await.unwrap().unwrap().len(), 1);
    }
}
