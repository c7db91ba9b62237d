use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use postop_priority_engine::escalation::EscalationPipeline;
use postop_priority_engine::llm::UnavailableGenerator;
use postop_priority_engine::summary::SummaryGenerator;
use postop_priority_engine::{
    Clock, EngineConfig, EngineHandle, FixedClock, MemoryStore, MonitorEngine, Patient, RankedPatient,
    RecordStore, RiskTier, StreamKind, SymptomEntry, SymptomLog,
};

struct Harness {
    store: MemoryStore,
    clinician: Uuid,
    clock: Arc<FixedClock>,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: MemoryStore::new(),
            clinician: Uuid::new_v4(),
            clock: Arc::new(FixedClock::new(Utc::now())),
        }
    }

    fn admit(&self, name: &str, risk: RiskTier) -> Patient {
        let mut patient = Patient::new(Uuid::new_v4(), name, risk);
        patient.assigned_clinician_id = Some(self.clinician);
        self.store.put_patient(patient.clone());
        patient
    }

    fn log(&self, patient: &Patient, hours_ago: i64, symptoms: &[(&str, u8)]) -> SymptomLog {
        SymptomLog::new(
            patient.id,
            self.clock.now() - ChronoDuration::hours(hours_ago),
            symptoms
                .iter()
                .map(|(name, severity)| SymptomEntry::new(*name, *severity))
                .collect(),
        )
    }

    fn pipeline(&self) -> EscalationPipeline {
        EscalationPipeline::new(
            Arc::new(self.store.clone()),
            SummaryGenerator::new(Arc::new(UnavailableGenerator), Duration::from_secs(30)),
            10,
        )
    }

    async fn start(&self) -> EngineHandle {
        MonitorEngine::new(
            Arc::new(self.store.clone()),
            self.clinician,
            EngineConfig::default(),
        )
        .with_clock(self.clock.clone())
        .spawn()
        .await
        .unwrap()
    }
}

async fn wait_for_ranking(
    rx: &mut watch::Receiver<Vec<RankedPatient>>,
    predicate: impl FnMut(&Vec<RankedPatient>) -> bool,
) -> Vec<RankedPatient> {
    let ranked = tokio::time::timeout(Duration::from_secs(60), rx.wait_for(predicate))
        .await
        .expect("ranking did not settle")
        .expect("engine stopped");
    ranked.clone()
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::task::yield_now().await;
    }
    check()
}

fn scores(ranked: &[RankedPatient]) -> Vec<u8> {
    ranked.iter().map(|r| r.score).collect()
}

#[tokio::test(start_paused = true)]
async fn roster_is_ranked_by_composite_score() {
    let h = Harness::new();
    let quiet = h.admit("Rhea Kapoor", RiskTier::Low);
    let steady = h.admit("Vikram Joshi", RiskTier::Medium);
    let acute = h.admit("Farah Khan", RiskTier::Critical);
    h.store.push_log(h.log(&steady, 0, &[("Pain", 5)]));
    h.store.push_log(h.log(&acute, 0, &[("Pain", 9), ("Fever", 8)]));

    let engine = h.start().await;
    let mut rx = engine.rankings();
    let ranked = wait_for_ranking(&mut rx, |r| scores(r) == vec![57, 30, 25]).await;

    assert_eq!(ranked[0].patient_id, acute.id);
    assert_eq!(ranked[0].breakdown_text(), "Risk (critical): 40pts | Severity: 17pts");
    assert_eq!(ranked[1].patient_id, steady.id);
    assert_eq!(ranked[2].patient_id, quiet.id);
    assert!(ranked[2].breakdown_text().contains("Inactive 72hrs+: 15pts"));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn removed_patient_stops_being_scored() {
    let h = Harness::new();
    let staying = h.admit("Meera Iyer", RiskTier::High);
    let leaving = h.admit("Kabir Shah", RiskTier::Medium);
    h.store.push_log(h.log(&staying, 0, &[("Pain", 4)]));

    let engine = h.start().await;
    let mut rx = engine.rankings();
    wait_for_ranking(&mut rx, |r| r.len() == 2).await;
    assert!(eventually(|| h.store.open_streams() == 7).await);

    h.store.remove_patient(leaving.id);
    let ranked = wait_for_ranking(&mut rx, |r| r.len() == 1).await;
    assert_eq!(ranked[0].patient_id, staying.id);
    assert!(eventually(|| h.store.open_streams() == 4).await);

    h.store.push_log(h.log(&leaving, 0, &[("Pain", 10)]));
    h.store.set_unread_messages(leaving.id, h.clinician, 3);
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert!(engine.latest().iter().all(|r| r.patient_id != leaving.id));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn refresh_timer_applies_inactivity() {
    let h = Harness::new();
    let patient = h.admit("Ananya Rao", RiskTier::Medium);
    h.store.push_log(h.log(&patient, 0, &[("Pain", 4)]));

    let engine = h.start().await;
    let mut rx = engine.rankings();
    wait_for_ranking(&mut rx, |r| scores(r) == vec![28]).await;

    // No store traffic from here on; only the periodic rescore can notice the gap.
    h.clock.advance(ChronoDuration::hours(49));
    let ranked = tokio::time::timeout(
        Duration::from_secs(2 * 60 * 60),
        rx.wait_for(|r| scores(r) == vec![38]),
    )
    .await
    .expect("refresh never fired")
    .expect("engine stopped")
    .clone();
    assert!(ranked[0].breakdown_text().contains("Inactive 48hrs: 10pts"));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn escalation_summary_feeds_back_into_score() {
    let h = Harness::new();
    let patient = h.admit("Rohan Mehta", RiskTier::Medium);

    let engine = h.start().await;
    let mut rx = engine.rankings();
    wait_for_ranking(&mut rx, |r| scores(r) == vec![35]).await;

    let pipeline = h.pipeline();
    for hours_ago in [2, 1, 0] {
        let log = h.log(&patient, hours_ago, &[("Fatigue", 6)]);
        pipeline.submit_log(&patient, h.clinician, log).await.unwrap();
    }
    assert_eq!(h.store.summaries().len(), 1);

    let ranked = wait_for_ranking(&mut rx, |r| scores(r) == vec![47]).await;
    assert_eq!(
        ranked[0].breakdown_text(),
        "Risk (medium): 20pts | Severity: 12pts | Streak: 10pts | Unread Alerts: 5pts"
    );

    h.store
        .mark_summary_read(h.store.summaries()[0].id)
        .await
        .unwrap();
    wait_for_ranking(&mut rx, |r| scores(r) == vec![42]).await;

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stream_failures_stay_isolated() {
    let h = Harness::new();
    let flaky = h.admit("Isha Verma", RiskTier::High);
    let healthy = h.admit("Dev Malhotra", RiskTier::Low);
    h.store.fail_next_subscribe(StreamKind::Summaries, flaky.id);

    let engine = h.start().await;
    let mut rx = engine.rankings();
    wait_for_ranking(&mut rx, |r| r.len() == 2).await;
    assert!(eventually(|| h.store.open_streams() == 6).await);

    h.store.inject_stream_error(StreamKind::Logs, flaky.id);
    h.store.push_log(h.log(&healthy, 0, &[("Swelling", 5)]));
    let ranked = wait_for_ranking(&mut rx, |r| {
        r.iter().any(|p| p.patient_id == healthy.id && p.score == 20)
    })
    .await;
    assert_eq!(ranked.len(), 2);
    assert!(!engine.is_finished());

    // The next roster change retries the stream that failed to open.
    h.admit("Nikhil Bose", RiskTier::Medium);
    wait_for_ranking(&mut rx, |r| r.len() == 3).await;
    assert!(eventually(|| h.store.open_streams() == 10).await);

    h.store.push_log(h.log(&flaky, 0, &[("Pain", 7)]));
    wait_for_ranking(&mut rx, |r| {
        r.iter().any(|p| p.patient_id == flaky.id && p.score == 44)
    })
    .await;

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_stream_reopens_without_roster_change() {
    let h = Harness::new();
    let patient = h.admit("Sana Qureshi", RiskTier::Medium);
    h.store.fail_next_subscribe(StreamKind::Summaries, patient.id);

    let engine = h.start().await;
    let mut rx = engine.rankings();
    wait_for_ranking(&mut rx, |r| scores(r) == vec![35]).await;
    assert!(eventually(|| h.store.open_streams() == 3).await);

    let pipeline = h.pipeline();
    for hours_ago in [2, 1, 0] {
        let log = h.log(&patient, hours_ago, &[("Fatigue", 6)]);
        pipeline.submit_log(&patient, h.clinician, log).await.unwrap();
    }
    assert_eq!(h.store.summaries().len(), 1);

    // The roster never changes; only the retry timer can reopen the summaries stream.
    let ranked = wait_for_ranking(&mut rx, |r| scores(r) == vec![47]).await;
    assert!(ranked[0].breakdown_text().contains("Unread Alerts: 5pts"));
    assert_eq!(h.store.open_streams(), 4);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn ended_stream_is_reopened() {
    let h = Harness::new();
    let patient = h.admit("Yash Kulkarni", RiskTier::Medium);
    h.store.push_log(h.log(&patient, 0, &[("Pain", 4)]));

    let engine = h.start().await;
    let mut rx = engine.rankings();
    wait_for_ranking(&mut rx, |r| scores(r) == vec![28]).await;
    assert!(eventually(|| h.store.open_streams() == 4).await);

    h.store.end_streams(StreamKind::UnreadMessages, patient.id);
    assert!(eventually(|| h.store.open_streams() == 3).await);
    h.store.set_unread_messages(patient.id, h.clinician, 2);

    let ranked = wait_for_ranking(&mut rx, |r| scores(r) == vec![32]).await;
    assert!(ranked[0].breakdown_text().contains("Unread Msgs: 4pts"));
    assert_eq!(h.store.open_streams(), 4);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_every_stream() {
    let h = Harness::new();
    h.admit("Tara Sen", RiskTier::Medium);
    h.admit("Arjun Das", RiskTier::High);

    let engine = h.start().await;
    let mut rx = engine.rankings();
    wait_for_ranking(&mut rx, |r| r.len() == 2).await;
    assert!(eventually(|| h.store.open_streams() == 7).await);

    engine.shutdown().await;
    assert!(eventually(|| h.store.open_streams() == 0).await);
}
