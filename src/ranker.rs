use std::collections::HashMap;

use tokio::sync::watch;
use uuid::Uuid;

use crate::models::{CompositeScore, Patient, RankedPatient, RiskTier};

#[derive(Debug, Clone)]
struct RankEntry {
    seq: u64,
    name: String,
    risk: RiskTier,
    score: CompositeScore,
}

/// Latest composite score per patient, ordered by score with insertion order breaking ties.
pub struct Ranker {
    entries: HashMap<Uuid, RankEntry>,
    next_seq: u64,
    published: watch::Sender<Vec<RankedPatient>>,
}

impl Default for Ranker {
    fn default() -> Self {
        Self::new()
    }
}

impl Ranker {
    pub fn new() -> Self {
        let (published, _) = watch::channel(Vec::new());
        Self {
            entries: HashMap::new(),
            next_seq: 0,
            published,
        }
    }

    /// Replaces the patient's score. A patient keeps its original insertion slot.
    pub fn update(&mut self, patient: &Patient, score: CompositeScore) {
        match self.entries.get_mut(&patient.id) {
            Some(entry) => {
                entry.name = patient.name.clone();
                entry.risk = patient.risk;
                entry.score = score;
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.entries.insert(
                    patient.id,
                    RankEntry {
                        seq,
                        name: patient.name.clone(),
                        risk: patient.risk,
                        score,
                    },
                );
            }
        }
    }

    pub fn remove(&mut self, patient_id: &Uuid) -> bool {
        self.entries.remove(patient_id).is_some()
    }

    pub fn ranked(&self) -> Vec<RankedPatient> {
        let mut entries: Vec<(&Uuid, &RankEntry)> = self.entries.iter().collect();
        entries.sort_by(|(_, a), (_, b)| {
            b.score
                .score
                .cmp(&a.score.score)
                .then_with(|| a.seq.cmp(&b.seq))
        });
        entries
            .into_iter()
            .map(|(id, entry)| RankedPatient {
                patient_id: *id,
                name: entry.name.clone(),
                risk: entry.risk,
                score: entry.score.score,
                breakdown: entry.score.breakdown.clone(),
            })
            .collect()
    }

    /// Pushes the current ranking to subscribers if it differs from the last one.
    pub fn publish(&self) -> bool {
        let ranked = self.ranked();
        self.published.send_if_modified(|current| {
            if *current == ranked {
                false
            } else {
                *current = ranked;
                true
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<RankedPatient>> {
        self.published.subscribe()
    }
}
