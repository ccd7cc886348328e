//! Distribution-preserving stratified user sampling.
//!
//! Shrinks a large interaction log to a target user count whose
//! purchase-count and item-diversity distributions resemble the full
//! population, so fast-iteration runs of the recall pipeline stay
//! representative. Users are crossed into (purchase tier × diversity tier ×
//! time tier) strata, quotas are waterfilled, and every per-stratum draw is
//! seeded by a stable function of (stratum key, base seed) — identical
//! inputs reproduce an identical user set across processes.
//!
//! The quality gate at the end is advisory: it reports pass/fail per check
//! and never errors.

use std::collections::BTreeMap;

use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, Datelike};
use rayon::prelude::*;
use serde::Serialize;

use crate::events::EventLog;
use crate::params::SamplerConfig;

const SECS_PER_DAY: i64 = 86_400;

// ---------------------------------------------------------------------------
// Deterministic RNG
// ---------------------------------------------------------------------------

/// xoshiro256** seeded through SplitMix64. Deterministic for a given seed on
/// every platform, which is all the sampler needs.
struct SeededRng {
    s: [u64; 4],
}

impl SeededRng {
    fn new(seed: u64) -> Self {
        let mut state = seed;
        let mut s = [0u64; 4];
        for slot in &mut s {
            state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
            let mut z = state;
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            *slot = z ^ (z >> 31);
        }
        SeededRng { s }
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        let result = (self.s[1].wrapping_mul(5)).rotate_left(7).wrapping_mul(9);
        let t = self.s[1] << 17;
        self.s[2] ^= self.s[0];
        self.s[3] ^= self.s[1];
        self.s[1] ^= self.s[2];
        self.s[0] ^= self.s[3];
        self.s[2] ^= t;
        self.s[3] = self.s[3].rotate_left(45);
        result
    }

    /// Uniform in [0, bound) via Lemire reduction.
    #[inline]
    fn next_bounded(&mut self, bound: u64) -> u64 {
        ((self.next_u64() as u128 * bound as u128) >> 64) as u64
    }
}

/// Stable sub-seed from key parts: FNV-1a over the joined key folded into
/// the base seed. Same parts and base seed give the same value in any
/// process or run order.
fn stable_subseed(parts: &[&str], base_seed: u64) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    let mut feed = |bytes: &[u8], hash: &mut u64| {
        for &b in bytes {
            *hash ^= b as u64;
            *hash = hash.wrapping_mul(FNV_PRIME);
        }
    };
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            feed(b"||", &mut hash);
        }
        feed(part.as_bytes(), &mut hash);
    }
    base_seed ^ hash
}

/// Take `take` distinct elements from `pool` by partial Fisher-Yates.
/// The pool must arrive in a deterministic order.
fn draw_without_replacement(mut pool: Vec<i64>, take: usize, seed: u64) -> Vec<i64> {
    let take = take.min(pool.len());
    let mut rng = SeededRng::new(seed);
    for i in 0..take {
        let j = i + rng.next_bounded((pool.len() - i) as u64) as usize;
        pool.swap(i, j);
    }
    pool.truncate(take);
    pool
}

// ---------------------------------------------------------------------------
// User features and strata
// ---------------------------------------------------------------------------

/// Per-user behavior summary driving stratification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UserStats {
    pub user_id: i64,
    pub purchase_count: usize,
    pub unique_items: usize,
    pub first_purchase: i64,
    pub last_purchase: i64,
    pub span_days: i64,
    pub avg_purchase_interval: f64,
    pub purchase_frequency: f64,
}

impl UserStats {
    /// Summarize every user in the log, ascending by user id.
    pub fn build(log: &EventLog) -> Vec<UserStats> {
        let mut per_user: AHashMap<i64, Vec<(i64, i64)>> = AHashMap::new();
        for event in log.events() {
            per_user
                .entry(event.user_id)
                .or_default()
                .push((event.item_id, event.timestamp));
        }
        let mut users: Vec<i64> = per_user.keys().copied().collect();
        users.sort_unstable();

        users
            .par_iter()
            .map(|uid| {
                let rows = &per_user[uid];
                let purchase_count = rows.len();
                let unique_items = rows
                    .iter()
                    .map(|(item, _)| *item)
                    .collect::<AHashSet<i64>>()
                    .len();
                let first = rows.iter().map(|(_, ts)| *ts).min().unwrap_or(0);
                let last = rows.iter().map(|(_, ts)| *ts).max().unwrap_or(0);
                let span_days = (last - first) / SECS_PER_DAY + 1;
                UserStats {
                    user_id: *uid,
                    purchase_count,
                    unique_items,
                    first_purchase: first,
                    last_purchase: last,
                    span_days,
                    avg_purchase_interval: span_days as f64 / purchase_count as f64,
                    purchase_frequency: purchase_count as f64 / unique_items as f64,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl Tier {
    fn label(self) -> &'static str {
        match self {
            Tier::VeryLow => "very_low",
            Tier::Low => "low",
            Tier::Medium => "medium",
            Tier::High => "high",
            Tier::VeryHigh => "very_high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeTier {
    EarlyMonth,
    MidMonth,
    LateMonth,
}

impl TimeTier {
    fn label(self) -> &'static str {
        match self {
            TimeTier::EarlyMonth => "early_month",
            TimeTier::MidMonth => "mid_month",
            TimeTier::LateMonth => "late_month",
        }
    }
}

/// (purchase tier, diversity tier, time tier) cross.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct StratumKey {
    pub purchase: Tier,
    pub diversity: Tier,
    pub time: TimeTier,
}

impl StratumKey {
    fn subseed(&self, base_seed: u64) -> u64 {
        stable_subseed(
            &[
                self.purchase.label(),
                self.diversity.label(),
                self.time.label(),
            ],
            base_seed,
        )
    }
}

/// Quantile with linear interpolation over an ascending-sorted slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = pos - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

/// The 25/50/75/90th percentile cut points for one feature.
#[derive(Debug, Clone, Copy, Serialize)]
struct TierCuts {
    q25: f64,
    q50: f64,
    q75: f64,
    q90: f64,
}

impl TierCuts {
    fn from_values(values: &mut Vec<f64>) -> Self {
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        TierCuts {
            q25: quantile(values, 0.25),
            q50: quantile(values, 0.50),
            q75: quantile(values, 0.75),
            q90: quantile(values, 0.90),
        }
    }

    fn tier_of(&self, value: f64) -> Tier {
        if value <= self.q25 {
            Tier::VeryLow
        } else if value <= self.q50 {
            Tier::Low
        } else if value <= self.q75 {
            Tier::Medium
        } else if value <= self.q90 {
            Tier::High
        } else {
            Tier::VeryHigh
        }
    }
}

fn time_tier_of(first_purchase: i64) -> TimeTier {
    let day = DateTime::from_timestamp(first_purchase, 0)
        .map(|dt| dt.day())
        .unwrap_or(1);
    if day <= 10 {
        TimeTier::EarlyMonth
    } else if day <= 20 {
        TimeTier::MidMonth
    } else {
        TimeTier::LateMonth
    }
}

fn stratum_of(stats: &UserStats, purchase_cuts: &TierCuts, diversity_cuts: &TierCuts) -> StratumKey {
    StratumKey {
        purchase: purchase_cuts.tier_of(stats.purchase_count as f64),
        diversity: diversity_cuts.tier_of(stats.unique_items as f64),
        time: time_tier_of(stats.first_purchase),
    }
}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

/// Proportional targets: `target × proportion` bounded to `[min, max]`,
/// rescaled toward the target when the bounded total drifts, re-bounded.
fn proportional_allocation(
    populations: &BTreeMap<StratumKey, usize>,
    target: usize,
    min_per: usize,
    max_per: usize,
) -> BTreeMap<StratumKey, usize> {
    let total: usize = populations.values().sum();
    if total == 0 {
        return BTreeMap::new();
    }
    // max/min rather than `clamp`: inverted bounds (min > max) degrade to
    // the minimum instead of panicking on the clamp precondition.
    let bound = |x: usize| min_per.max(max_per.min(x));
    let mut alloc: BTreeMap<StratumKey, usize> = populations
        .iter()
        .map(|(key, &pop)| {
            let share = pop as f64 / total as f64;
            (*key, bound((target as f64 * share) as usize))
        })
        .collect();

    let allocated: usize = alloc.values().sum();
    if allocated != target && allocated > 0 {
        let factor = target as f64 / allocated as f64;
        for quota in alloc.values_mut() {
            *quota = bound((*quota as f64 * factor) as usize);
        }
    }
    alloc
}

/// Waterfill: satisfy every stratum's minimum quota first (bounded by its
/// population and the remaining budget), then spread what is left
/// proportionally to spare capacity, iterating until the budget is gone or
/// nothing has spare capacity.
fn waterfill_allocation(
    populations: &BTreeMap<StratumKey, usize>,
    target: usize,
    min_per: usize,
    max_per: usize,
) -> BTreeMap<StratumKey, usize> {
    let mut alloc: BTreeMap<StratumKey, usize> = BTreeMap::new();
    let mut remaining = target;

    for (key, &pop) in populations {
        let take = min_per.min(pop).min(remaining);
        alloc.insert(*key, take);
        remaining -= take;
        if remaining == 0 {
            break;
        }
    }

    while remaining > 0 {
        let spare: BTreeMap<StratumKey, usize> = populations
            .iter()
            .map(|(key, &pop)| {
                let cap = max_per.min(pop);
                let used = alloc.get(key).copied().unwrap_or(0);
                (*key, cap.saturating_sub(used))
            })
            .filter(|(_, s)| *s > 0)
            .collect();
        let total_spare: usize = spare.values().sum();
        if total_spare == 0 {
            break;
        }

        let budget = remaining;
        let mut moved = 0;
        for (key, &s) in &spare {
            let add = ((budget as f64 * s as f64 / total_spare as f64) as usize)
                .min(s)
                .min(remaining);
            if add > 0 {
                *alloc.entry(*key).or_insert(0) += add;
                remaining -= add;
                moved += add;
            }
            if remaining == 0 {
                break;
            }
        }

        // Integer shares can all round to zero; push one unit into the
        // stratum with the most headroom to guarantee progress.
        if moved == 0 {
            if let Some((key, _)) = spare.iter().max_by_key(|(key, s)| (**s, std::cmp::Reverse(**key)))
            {
                *alloc.entry(*key).or_insert(0) += 1;
                remaining -= 1;
            }
        }
    }

    alloc
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Target and realized allocation for one stratum.
#[derive(Debug, Clone, Serialize)]
pub struct StratumReport {
    pub key: StratumKey,
    pub population: usize,
    pub proportion: f64,
    pub proportional_target: usize,
    pub allocated: usize,
    pub sampled: usize,
}

/// Sampling outcome plus quality scores.
#[derive(Debug, Clone, Serialize)]
pub struct SamplingReport {
    pub original_users: usize,
    pub sampled_users: usize,
    pub original_records: usize,
    pub sampled_records: usize,
    pub user_sampling_ratio: f64,
    pub record_sampling_ratio: f64,
    /// 1 − KL divergence of the sampled purchase-count distribution from the
    /// original, restricted to common support.
    pub purchase_preservation: f64,
    pub diversity_preservation: f64,
    /// 1 − mean relative error of mean and std, floored at 0.
    pub purchase_stat_similarity: f64,
    pub diversity_stat_similarity: f64,
    pub overall_quality: f64,
    pub avg_purchase_original: f64,
    pub avg_purchase_sampled: f64,
    pub avg_diversity_original: f64,
    pub avg_diversity_sampled: f64,
    pub std_purchase_original: f64,
    pub std_purchase_sampled: f64,
    pub std_diversity_original: f64,
    pub std_diversity_sampled: f64,
    pub strata: Vec<StratumReport>,
    /// Sampled user ids, ascending.
    pub sampled_user_ids: Vec<i64>,
}

/// One advisory quality check.
#[derive(Debug, Clone, Serialize)]
pub struct QualityCheck {
    pub name: &'static str,
    pub value: f64,
    pub passed: bool,
}

/// Outcome of the advisory quality gate.
#[derive(Debug, Clone, Serialize)]
pub struct QualityGate {
    pub checks: Vec<QualityCheck>,
    pub passed: bool,
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

/// Draw a distribution-preserving user subset and return the shrunk log
/// together with the sampling report.
pub fn stratified_sample(log: &EventLog, config: &SamplerConfig) -> (EventLog, SamplingReport) {
    let stats = UserStats::build(log);
    if stats.is_empty() {
        return (EventLog::default(), empty_report());
    }

    let mut purchase_values: Vec<f64> = stats.iter().map(|s| s.purchase_count as f64).collect();
    let mut diversity_values: Vec<f64> = stats.iter().map(|s| s.unique_items as f64).collect();
    let purchase_cuts = TierCuts::from_values(&mut purchase_values);
    let diversity_cuts = TierCuts::from_values(&mut diversity_values);

    // Stratify. BTreeMap keeps key order stable for allocation and seeding.
    let mut members: BTreeMap<StratumKey, Vec<i64>> = BTreeMap::new();
    for s in &stats {
        members
            .entry(stratum_of(s, &purchase_cuts, &diversity_cuts))
            .or_default()
            .push(s.user_id);
    }
    for pool in members.values_mut() {
        pool.sort_unstable();
    }
    let populations: BTreeMap<StratumKey, usize> =
        members.iter().map(|(k, v)| (*k, v.len())).collect();
    let population_total: usize = populations.values().sum();

    let target = config.target_users;
    let min_per = config.effective_min();
    let max_per = config.effective_max();
    let proportional = proportional_allocation(&populations, target, min_per, max_per);
    let allocation = waterfill_allocation(&populations, target, min_per, max_per);

    // Per-stratum draws, each under its own key-derived seed.
    let mut selected: Vec<i64> = Vec::with_capacity(target);
    let mut sampled_per_stratum: BTreeMap<StratumKey, usize> = BTreeMap::new();
    for (key, pool) in &members {
        let quota = allocation.get(key).copied().unwrap_or(0);
        if quota == 0 {
            continue;
        }
        let drawn = draw_without_replacement(pool.clone(), quota, key.subseed(config.base_seed));
        sampled_per_stratum.insert(*key, drawn.len());
        selected.extend(drawn);
    }

    // Pad a shortfall from not-yet-selected users, trim an overshoot; both
    // under their own deterministic sub-seeds.
    if selected.len() < target {
        let chosen: AHashSet<i64> = selected.iter().copied().collect();
        let mut remaining: Vec<i64> = stats
            .iter()
            .map(|s| s.user_id)
            .filter(|uid| !chosen.contains(uid))
            .collect();
        remaining.sort_unstable();
        let needed = target - selected.len();
        selected.extend(draw_without_replacement(
            remaining,
            needed,
            stable_subseed(&["pad"], config.base_seed),
        ));
    } else if selected.len() > target {
        selected.sort_unstable();
        selected = draw_without_replacement(
            selected,
            target,
            stable_subseed(&["trim"], config.base_seed),
        );
    }
    selected.sort_unstable();

    let selected_set: AHashSet<i64> = selected.iter().copied().collect();
    let sampled_log = log.filter_users(&selected_set);

    let strata = members
        .iter()
        .map(|(key, pool)| StratumReport {
            key: *key,
            population: pool.len(),
            proportion: pool.len() as f64 / population_total as f64,
            proportional_target: proportional.get(key).copied().unwrap_or(0),
            allocated: allocation.get(key).copied().unwrap_or(0),
            sampled: sampled_per_stratum.get(key).copied().unwrap_or(0),
        })
        .collect();

    let report = build_report(log, &sampled_log, &stats, &selected_set, selected, strata);
    (sampled_log, report)
}

/// Advisory quality gate: pass/fail per check, never an error.
pub fn validate_quality(report: &SamplingReport, config: &SamplerConfig) -> QualityGate {
    let target = config.target_users as f64;
    let checks = vec![
        QualityCheck {
            name: "sampled_user_count_in_range",
            value: report.sampled_users as f64,
            passed: (target * 0.5..=target * 1.5).contains(&(report.sampled_users as f64)),
        },
        QualityCheck {
            name: "sampled_record_count",
            value: report.sampled_records as f64,
            passed: report.sampled_records >= config.target_users,
        },
        QualityCheck {
            name: "purchase_preservation",
            value: report.purchase_preservation,
            passed: report.purchase_preservation >= 0.6,
        },
        QualityCheck {
            name: "diversity_preservation",
            value: report.diversity_preservation,
            passed: report.diversity_preservation >= 0.6,
        },
        QualityCheck {
            name: "purchase_stat_similarity",
            value: report.purchase_stat_similarity,
            passed: report.purchase_stat_similarity >= 0.7,
        },
        QualityCheck {
            name: "diversity_stat_similarity",
            value: report.diversity_stat_similarity,
            passed: report.diversity_stat_similarity >= 0.7,
        },
        QualityCheck {
            name: "overall_quality",
            value: report.overall_quality,
            passed: report.overall_quality >= 0.65,
        },
    ];
    let passed = checks.iter().all(|c| c.passed);
    QualityGate { checks, passed }
}

fn empty_report() -> SamplingReport {
    SamplingReport {
        original_users: 0,
        sampled_users: 0,
        original_records: 0,
        sampled_records: 0,
        user_sampling_ratio: 0.0,
        record_sampling_ratio: 0.0,
        purchase_preservation: 0.0,
        diversity_preservation: 0.0,
        purchase_stat_similarity: 0.0,
        diversity_stat_similarity: 0.0,
        overall_quality: 0.0,
        avg_purchase_original: 0.0,
        avg_purchase_sampled: 0.0,
        avg_diversity_original: 0.0,
        avg_diversity_sampled: 0.0,
        std_purchase_original: 0.0,
        std_purchase_sampled: 0.0,
        std_diversity_original: 0.0,
        std_diversity_sampled: 0.0,
        strata: Vec::new(),
        sampled_user_ids: Vec::new(),
    }
}

fn build_report(
    original: &EventLog,
    sampled: &EventLog,
    stats: &[UserStats],
    selected: &AHashSet<i64>,
    selected_sorted: Vec<i64>,
    strata: Vec<StratumReport>,
) -> SamplingReport {
    let sampled_stats: Vec<&UserStats> = stats
        .iter()
        .filter(|s| selected.contains(&s.user_id))
        .collect();

    let orig_purchase: Vec<f64> = stats.iter().map(|s| s.purchase_count as f64).collect();
    let samp_purchase: Vec<f64> = sampled_stats
        .iter()
        .map(|s| s.purchase_count as f64)
        .collect();
    let orig_diversity: Vec<f64> = stats.iter().map(|s| s.unique_items as f64).collect();
    let samp_diversity: Vec<f64> = sampled_stats
        .iter()
        .map(|s| s.unique_items as f64)
        .collect();

    let purchase_preservation = distribution_preservation(&orig_purchase, &samp_purchase);
    let diversity_preservation = distribution_preservation(&orig_diversity, &samp_diversity);
    let purchase_stat_similarity = statistical_similarity(&orig_purchase, &samp_purchase);
    let diversity_stat_similarity = statistical_similarity(&orig_diversity, &samp_diversity);

    let original_users = stats.len();
    let sampled_users = sampled_stats.len();
    SamplingReport {
        original_users,
        sampled_users,
        original_records: original.len(),
        sampled_records: sampled.len(),
        user_sampling_ratio: ratio(sampled_users, original_users),
        record_sampling_ratio: ratio(sampled.len(), original.len()),
        purchase_preservation,
        diversity_preservation,
        purchase_stat_similarity,
        diversity_stat_similarity,
        overall_quality: (purchase_preservation
            + diversity_preservation
            + purchase_stat_similarity
            + diversity_stat_similarity)
            / 4.0,
        avg_purchase_original: mean(&orig_purchase),
        avg_purchase_sampled: mean(&samp_purchase),
        avg_diversity_original: mean(&orig_diversity),
        avg_diversity_sampled: mean(&samp_diversity),
        std_purchase_original: sample_std(&orig_purchase),
        std_purchase_sampled: sample_std(&samp_purchase),
        std_diversity_original: sample_std(&orig_diversity),
        std_diversity_sampled: sample_std(&samp_diversity),
        strata,
        sampled_user_ids: selected_sorted,
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// 1 − KL(sampled‖original) over the common support of the two
/// value-frequency distributions. Higher is better; 0 when nothing is shared.
fn distribution_preservation(original: &[f64], sampled: &[f64]) -> f64 {
    let orig_counts = value_counts(original);
    let samp_counts = value_counts(sampled);

    let common: Vec<i64> = orig_counts
        .keys()
        .filter(|v| samp_counts.contains_key(*v))
        .copied()
        .collect();
    if common.is_empty() {
        return 0.0;
    }

    let orig_total: f64 = common.iter().map(|v| orig_counts[v] as f64).sum();
    let samp_total: f64 = common.iter().map(|v| samp_counts[v] as f64).sum();
    let mut kl = 0.0;
    for v in &common {
        let p = samp_counts[v] as f64 / samp_total;
        let q = orig_counts[v] as f64 / orig_total;
        if p > 0.0 && q > 0.0 {
            kl += p * (p / q).ln();
        }
    }
    1.0 - kl
}

fn value_counts(values: &[f64]) -> BTreeMap<i64, usize> {
    let mut counts = BTreeMap::new();
    for &v in values {
        *counts.entry(v.round() as i64).or_insert(0) += 1;
    }
    counts
}

/// 1 − average relative error of mean and standard deviation, floored at 0.
fn statistical_similarity(original: &[f64], sampled: &[f64]) -> f64 {
    let orig_mean = mean(original);
    let samp_mean = mean(sampled);
    let orig_std = sample_std(original);
    let samp_std = sample_std(sampled);

    let mean_error = if orig_mean > 0.0 {
        (orig_mean - samp_mean).abs() / orig_mean
    } else {
        0.0
    };
    let std_error = if orig_std > 0.0 {
        (orig_std - samp_std).abs() / orig_std
    } else {
        0.0
    };
    (1.0 - (mean_error + std_error) / 2.0).max(0.0)
}
