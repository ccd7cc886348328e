//! Co-visitation graph: short-range sequential co-occurrence between items.
//!
//! For every user sequence, each ordered pair of items up to `covisit_window`
//! positions apart contributes `1/lag` to the directed edge between them.
//! Edges are summed across all users and the neighbor list of each source
//! item is capped at `covisit_top_per_a`.
//!
//! Per-user emission runs in parallel; the cross-user aggregation folds
//! sequentially in ascending user order so the floating-point edge weights
//! are bit-identical across runs.

use ahash::AHashMap;
use rayon::prelude::*;

use crate::events::UserSequences;
use crate::params::RecallParams;

/// Directed, weight-capped item→item neighbor table.
#[derive(Debug, Clone, Default)]
pub struct CovisitGraph {
    /// item_a → neighbors sorted by weight descending.
    neighbors: AHashMap<i64, Vec<(i64, f64)>>,
}

impl CovisitGraph {
    /// Build the graph from normalized user sequences.
    pub fn build(sequences: &UserSequences, params: &RecallParams) -> Self {
        let window = params.covisit_window;

        // Emit (a, b, 1/lag) triples per user in parallel; the ordered
        // collect keeps the user order stable for the fold below.
        let per_user: Vec<Vec<(i64, i64, f64)>> = sequences
            .users()
            .par_iter()
            .map(|uid| {
                let seq = sequences.get(*uid).unwrap_or(&[]);
                let mut edges = Vec::new();
                for i in 0..seq.len() {
                    let a = seq[i].item_id;
                    let max_lag = window.min(seq.len() - 1 - i);
                    for lag in 1..=max_lag {
                        let b = seq[i + lag].item_id;
                        if a != b {
                            edges.push((a, b, 1.0 / lag as f64));
                        }
                    }
                }
                edges
            })
            .collect();

        // Sequential aggregation. The insertion counter records when an
        // edge was first seen, breaking weight ties deterministically.
        let mut weights: AHashMap<(i64, i64), (f64, u64)> = AHashMap::new();
        let mut insertion: u64 = 0;
        for edges in per_user {
            for (a, b, w) in edges {
                let entry = weights.entry((a, b)).or_insert_with(|| {
                    insertion += 1;
                    (0.0, insertion)
                });
                entry.0 += w;
            }
        }

        let mut grouped: AHashMap<i64, Vec<(i64, f64, u64)>> = AHashMap::new();
        for ((a, b), (w, seen)) in weights {
            grouped.entry(a).or_default().push((b, w, seen));
        }

        let mut neighbors: AHashMap<i64, Vec<(i64, f64)>> =
            AHashMap::with_capacity(grouped.len());
        for (a, mut list) in grouped {
            list.sort_by(|x, y| {
                y.1.partial_cmp(&x.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(x.2.cmp(&y.2))
            });
            list.truncate(params.covisit_top_per_a);
            neighbors.insert(a, list.into_iter().map(|(b, w, _)| (b, w)).collect());
        }

        CovisitGraph { neighbors }
    }

    /// Neighbors of `item_id`, weight descending. Empty when unknown.
    pub fn neighbors_of(&self, item_id: i64) -> &[(i64, f64)] {
        self.neighbors
            .get(&item_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Aggregated weight of the directed edge (a, b), if retained.
    pub fn weight(&self, a: i64, b: i64) -> Option<f64> {
        self.neighbors_of(a)
            .iter()
            .find(|(item, _)| *item == b)
            .map(|(_, w)| *w)
    }

    /// Number of source items with at least one retained neighbor.
    pub fn source_count(&self) -> usize {
        self.neighbors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{event, EventLog};

    const DAY: i64 = 86_400;

    fn sequences(rows: Vec<crate::events::Event>) -> UserSequences {
        UserSequences::build(&EventLog::new(rows))
    }

    fn params_with_window(window: usize) -> RecallParams {
        RecallParams {
            covisit_window: window,
            ..RecallParams::fast_mode()
        }
    }

    #[test]
    fn weights_are_inverse_lag_sums() {
        // One user buying 1, 2, 3 one day apart with window 2.
        let seqs = sequences(vec![
            event(1, 1, 0),
            event(1, 2, DAY),
            event(1, 3, 2 * DAY),
        ]);
        let graph = CovisitGraph::build(&seqs, &params_with_window(2));

        assert_eq!(graph.weight(1, 2), Some(1.0));
        assert_eq!(graph.weight(1, 3), Some(0.5));
        assert_eq!(graph.weight(2, 3), Some(1.0));
        assert_eq!(graph.weight(3, 1), None);
    }

    #[test]
    fn edges_aggregate_across_users() {
        // Three identical users triple every weight.
        let mut rows = Vec::new();
        for uid in 1..=3 {
            rows.push(event(uid, 1, 0));
            rows.push(event(uid, 2, DAY));
            rows.push(event(uid, 3, 2 * DAY));
        }
        let graph = CovisitGraph::build(&sequences(rows), &params_with_window(2));

        assert_eq!(graph.weight(1, 2), Some(3.0));
        assert_eq!(graph.weight(1, 3), Some(1.5));
        assert_eq!(graph.weight(2, 3), Some(3.0));
    }

    #[test]
    fn self_pairs_never_emit() {
        let seqs = sequences(vec![
            event(1, 5, 0),
            event(1, 5, DAY),
            event(1, 6, 2 * DAY),
        ]);
        let graph = CovisitGraph::build(&seqs, &params_with_window(3));
        assert_eq!(graph.weight(5, 5), None);
        assert!(graph.weight(5, 6).is_some());
    }

    #[test]
    fn neighbor_list_respects_cap() {
        let mut rows = vec![event(1, 100, 0)];
        for i in 0..10 {
            rows.push(event(1, i, (i + 1) as i64 * DAY));
        }
        let params = RecallParams {
            covisit_window: 20,
            covisit_top_per_a: 4,
            ..RecallParams::fast_mode()
        };
        let graph = CovisitGraph::build(&sequences(rows), &params);
        assert_eq!(graph.neighbors_of(100).len(), 4);
        // Closest successors have the largest 1/lag weights.
        let kept: Vec<i64> = graph.neighbors_of(100).iter().map(|(b, _)| *b).collect();
        assert_eq!(kept, vec![0, 1, 2, 3]);
    }

    #[test]
    fn rebuilds_are_identical() {
        let rows = vec![
            event(1, 1, 0),
            event(1, 2, DAY),
            event(2, 2, 0),
            event(2, 1, DAY),
            event(2, 3, 2 * DAY),
        ];
        let a = CovisitGraph::build(&sequences(rows.clone()), &params_with_window(2));
        let b = CovisitGraph::build(&sequences(rows), &params_with_window(2));
        for item in [1_i64, 2, 3] {
            assert_eq!(a.neighbors_of(item), b.neighbors_of(item));
        }
    }
}
