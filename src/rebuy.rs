//! Repurchase scorer: recency-decayed per-(user, item) affinity.
//!
//! Each purchase contributes `exp(-days / tau)` where `days` counts whole
//! days between the purchase and the user's own most recent event, never
//! wall-clock time. Items bought both often and recently score highest;
//! other users never influence the score.

use ahash::AHashMap;
use rayon::prelude::*;

use crate::events::UserSequences;
use crate::params::RecallParams;

const SECS_PER_DAY: i64 = 86_400;

/// Per-user repurchase affinities.
#[derive(Debug, Clone, Default)]
pub struct RebuyScores {
    /// user → (item, score), score descending.
    by_user: AHashMap<i64, Vec<(i64, f64)>>,
}

impl RebuyScores {
    pub fn build(sequences: &UserSequences, params: &RecallParams) -> Self {
        let tau = params.tau_days;
        let scored: Vec<(i64, Vec<(i64, f64)>)> = sequences
            .users()
            .par_iter()
            .map(|uid| {
                let seq = sequences.get(*uid).unwrap_or(&[]);
                let reference = seq.iter().map(|e| e.timestamp).max().unwrap_or(0);

                let mut per_item: AHashMap<i64, f64> = AHashMap::new();
                for event in seq {
                    // Whole elapsed days, clipped at zero.
                    let days = ((reference - event.timestamp).max(0) / SECS_PER_DAY) as f64;
                    *per_item.entry(event.item_id).or_insert(0.0) += (-days / tau).exp();
                }

                let mut items: Vec<(i64, f64)> = per_item.into_iter().collect();
                items.sort_by(|a, b| {
                    b.1.partial_cmp(&a.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.0.cmp(&b.0))
                });
                (*uid, items)
            })
            .collect();

        RebuyScores {
            by_user: scored.into_iter().collect(),
        }
    }

    /// (item, score) rows for a user, score descending. Empty when unknown.
    pub fn for_user(&self, user_id: i64) -> &[(i64, f64)] {
        self.by_user
            .get(&user_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn score(&self, user_id: i64, item_id: i64) -> Option<f64> {
        self.for_user(user_id)
            .iter()
            .find(|(item, _)| *item == item_id)
            .map(|(_, s)| *s)
    }
}
