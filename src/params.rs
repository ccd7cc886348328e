//! Immutable parameter records.
//!
//! Every component takes its knobs from one of these structs; there is no
//! process-wide configuration state. The two presets mirror the tuned
//! development and production settings the pipeline shipped with.

use serde::{Deserialize, Serialize};

/// Parameters for candidate generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallParams {
    /// Sequential co-occurrence window W: pairs up to W positions apart.
    pub covisit_window: usize,
    /// Neighbors retained per source item in the co-visitation graph.
    pub covisit_top_per_a: usize,
    /// How many of the user's most recent items seed covisit lookups.
    pub recent_k: usize,
    /// Neighbors pulled per recent item during merging.
    pub cand_per_recent: usize,
    /// Repurchase decay constant, in days.
    pub tau_days: f64,
    /// Top categories per user feeding the category pool.
    pub user_top_cates: usize,
    /// Top stores per user feeding the store pool.
    pub user_top_stores: usize,
    /// Items retained per category pool.
    pub per_cate_pool: usize,
    /// Items retained per store pool.
    pub per_store_pool: usize,
    /// Items retained in the global popularity pool.
    pub pop_pool: usize,
    /// Maximum candidates per user.
    pub recall_cap: usize,
    /// Per-user work granularity hint for batched callers.
    pub batch_size: usize,
}

impl RecallParams {
    /// Development preset: smaller pools and caps for fast iteration runs.
    pub fn fast_mode() -> Self {
        RecallParams {
            covisit_window: 2,
            covisit_top_per_a: 100,
            recent_k: 3,
            cand_per_recent: 20,
            tau_days: 14.0,
            user_top_cates: 3,
            user_top_stores: 3,
            per_cate_pool: 50,
            per_store_pool: 40,
            pop_pool: 1000,
            recall_cap: 300,
            batch_size: 1000,
        }
    }
}

impl Default for RecallParams {
    /// Production preset.
    fn default() -> Self {
        RecallParams {
            covisit_window: 3,
            covisit_top_per_a: 200,
            recent_k: 5,
            cand_per_recent: 40,
            tau_days: 14.0,
            user_top_cates: 3,
            user_top_stores: 3,
            per_cate_pool: 80,
            per_store_pool: 60,
            pop_pool: 2000,
            recall_cap: 600,
            batch_size: 2000,
        }
    }
}

/// Parameters for the stratified sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Requested number of sampled users.
    pub target_users: usize,
    /// Base seed; all per-stratum sub-seeds derive from it.
    pub base_seed: u64,
    /// Minimum quota per stratum. 0 means `max(1, target/100)`.
    pub min_per_stratum: usize,
    /// Maximum quota per stratum. 0 means `target/2`.
    pub max_per_stratum: usize,
}

impl SamplerConfig {
    pub fn new(target_users: usize, base_seed: u64) -> Self {
        SamplerConfig {
            target_users,
            base_seed,
            min_per_stratum: 0,
            max_per_stratum: 0,
        }
    }

    pub(crate) fn effective_min(&self) -> usize {
        if self.min_per_stratum > 0 {
            self.min_per_stratum
        } else {
            (self.target_users / 100).max(1)
        }
    }

    pub(crate) fn effective_max(&self) -> usize {
        if self.max_per_stratum > 0 {
            self.max_per_stratum
        } else {
            (self.target_users / 2).max(1)
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig::new(10_000, 42)
    }
}
