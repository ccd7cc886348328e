//! Leave-one-out evaluation: split validation plus HR/MRR/NDCG scoring.
//!
//! Validation fails fast on a broken split (unknown label user, zero item
//! overlap, duplicate labels, temporal leak). A partial item miss is normal
//! when evaluating against a sampled-down training set and is only reported.
//! Scoring walks each evaluable user's ranked candidates once per cutoff.

use std::collections::BTreeMap;

use ahash::{AHashMap, AHashSet};
use serde::Serialize;

use crate::error::PipelineError;
use crate::events::{EventLog, LabelTable};
use crate::merge::CandidateTable;

/// Default cutoffs, matching the offline report.
pub const DEFAULT_CUTOFFS: &[usize] = &[10, 20, 50];

/// Composite weights over (HR, MRR, NDCG) at the largest cutoff.
const COMPOSITE_WEIGHTS: (f64, f64, f64) = (0.6, 0.25, 0.15);

/// Outcome of split validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SplitReport {
    pub label_users: usize,
    pub label_items: usize,
    /// Label items that also appear in the training item universe.
    pub common_items: usize,
    /// Share of label items absent from training; tolerated, not fatal.
    pub missing_item_rate: f64,
}

/// Validate the leave-one-out preconditions; runs before any scoring.
pub fn validate_split(train: &EventLog, labels: &LabelTable) -> Result<SplitReport, PipelineError> {
    let mut train_users: AHashSet<i64> = AHashSet::new();
    let mut train_items: AHashSet<i64> = AHashSet::new();
    let mut max_ts: AHashMap<i64, i64> = AHashMap::new();
    for event in train.events() {
        train_users.insert(event.user_id);
        train_items.insert(event.item_id);
        let ts = max_ts.entry(event.user_id).or_insert(i64::MIN);
        *ts = (*ts).max(event.timestamp);
    }

    // Every label user must have training history.
    for label in labels.rows() {
        if !train_users.contains(&label.user_id) {
            return Err(PipelineError::InvalidSplit {
                user_id: label.user_id,
            });
        }
    }

    // Item overlap: fatal only when nothing overlaps at all.
    let label_items: AHashSet<i64> = labels.rows().iter().map(|l| l.item_id).collect();
    let common = label_items
        .iter()
        .filter(|item| train_items.contains(item))
        .count();
    if common == 0 && !label_items.is_empty() {
        return Err(PipelineError::DegenerateLabels {
            label_items: label_items.len(),
        });
    }

    // Exactly one label row per user.
    let mut per_user: AHashMap<i64, usize> = AHashMap::new();
    for label in labels.rows() {
        *per_user.entry(label.user_id).or_insert(0) += 1;
    }
    let mut dup_users: Vec<(i64, usize)> = per_user
        .iter()
        .filter(|(_, &count)| count > 1)
        .map(|(&uid, &count)| (uid, count))
        .collect();
    dup_users.sort_unstable();
    if let Some(&(user_id, count)) = dup_users.first() {
        return Err(PipelineError::DuplicateLabel { user_id, count });
    }

    // Label time must strictly exceed the user's training horizon.
    for label in labels.rows() {
        if let Some(label_ts) = label.timestamp {
            let train_max_ts = max_ts.get(&label.user_id).copied().unwrap_or(i64::MIN);
            if label_ts <= train_max_ts {
                return Err(PipelineError::TemporalLeak {
                    user_id: label.user_id,
                    label_ts,
                    train_max_ts,
                });
            }
        }
    }

    let missing = label_items.len() - common;
    Ok(SplitReport {
        label_users: per_user.len(),
        label_items: label_items.len(),
        common_items: common,
        missing_item_rate: if label_items.is_empty() {
            0.0
        } else {
            missing as f64 / label_items.len() as f64
        },
    })
}

/// Metrics at one cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CutoffMetrics {
    pub hr: f64,
    pub mrr: f64,
    pub ndcg: f64,
}

/// Full evaluation record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalReport {
    pub by_cutoff: BTreeMap<usize, CutoffMetrics>,
    /// 0.6·HR + 0.25·MRR + 0.15·NDCG at the largest cutoff.
    pub composite: f64,
    /// Users present in both the candidate and the label tables.
    pub evaluated_users: usize,
    pub total_candidates: usize,
    pub avg_candidates_per_user: f64,
}

impl EvalReport {
    /// Flatten to a `"metric@K" → value` record for export.
    pub fn to_record(&self) -> BTreeMap<String, f64> {
        let mut record = BTreeMap::new();
        for (k, m) in &self.by_cutoff {
            record.insert(format!("hr@{k}"), m.hr);
            record.insert(format!("mrr@{k}"), m.mrr);
            record.insert(format!("ndcg@{k}"), m.ndcg);
        }
        record.insert("composite".to_string(), self.composite);
        record
    }
}

/// Score the candidate table against the held-out labels.
///
/// Evaluable users are those present in both tables; users missing from the
/// candidate table are skipped, never an error. Empty inputs yield all-zero
/// metrics.
pub fn evaluate(candidates: &CandidateTable, labels: &LabelTable, cutoffs: &[usize]) -> EvalReport {
    let label_of: AHashMap<i64, i64> = labels
        .rows()
        .iter()
        .map(|l| (l.user_id, l.item_id))
        .collect();

    let max_k = cutoffs.iter().copied().max().unwrap_or(0);

    // rank (1-based) of each user's label within its top-max_k candidates.
    let mut ranks: Vec<Option<usize>> = Vec::new();
    for uid in candidates.users() {
        let Some(&target) = label_of.get(&uid) else {
            continue;
        };
        let top = candidates.top_items(uid, max_k);
        ranks.push(top.iter().position(|&item| item == target).map(|p| p + 1));
    }

    let evaluated = ranks.len();
    let mut by_cutoff = BTreeMap::new();
    for &k in cutoffs {
        by_cutoff.insert(k, metrics_at(&ranks, k, evaluated));
    }

    let composite = by_cutoff
        .get(&max_k)
        .map(|m| {
            COMPOSITE_WEIGHTS.0 * m.hr + COMPOSITE_WEIGHTS.1 * m.mrr + COMPOSITE_WEIGHTS.2 * m.ndcg
        })
        .unwrap_or(0.0);

    let total_candidates = candidates.row_count();
    EvalReport {
        by_cutoff,
        composite,
        evaluated_users: evaluated,
        total_candidates,
        // Per label user, not per candidate-table user.
        avg_candidates_per_user: if label_of.is_empty() {
            0.0
        } else {
            total_candidates as f64 / label_of.len() as f64
        },
    }
}

fn metrics_at(ranks: &[Option<usize>], k: usize, evaluated: usize) -> CutoffMetrics {
    if evaluated == 0 {
        return CutoffMetrics {
            hr: 0.0,
            mrr: 0.0,
            ndcg: 0.0,
        };
    }
    let mut hits = 0_usize;
    let mut rr_sum = 0.0;
    let mut dcg_sum = 0.0;
    for rank in ranks.iter().flatten() {
        if *rank <= k {
            hits += 1;
            rr_sum += 1.0 / *rank as f64;
            // IDCG is 1 for a single relevant item.
            dcg_sum += 1.0 / ((*rank as f64) + 1.0).log2();
        }
    }
    let n = evaluated as f64;
    CutoffMetrics {
        hr: hits as f64 / n,
        mrr: rr_sum / n,
        ndcg: dcg_sum / n,
    }
}
