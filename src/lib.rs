//! Multi-source candidate recall with offline evaluation and sampling.
//!
//! Batch components for a purchase-log recommender, single-pass and
//! deterministic:
//!   - sequence normalization: per-user chronological event ordering
//!   - co-visitation graph: short-range sequential item co-occurrence
//!   - repurchase scoring: recency-decayed per-(user, item) affinity
//!   - popularity pools: global / per-category / per-store top-N rankings
//!   - candidate merging: four signals fused into one capped list per user
//!   - leave-one-out evaluation: split validation plus HR/MRR/NDCG@K
//!   - stratified sampling: distribution-preserving log reduction for
//!     fast-iteration runs
//!
//! The caller supplies already-loaded tables (`EventLog`, `ItemAttrs`,
//! `LabelTable`) and an immutable parameter record; outputs are the
//! candidate table, a metrics record, and the sampled log with its quality
//! report. There is no IO, serving, or training here.

pub mod covisit;
pub mod error;
pub mod eval;
pub mod events;
pub mod merge;
pub mod params;
pub mod popularity;
pub mod rebuy;
pub mod sampling;

pub use covisit::CovisitGraph;
pub use error::PipelineError;
pub use eval::{evaluate, validate_split, EvalReport, SplitReport, DEFAULT_CUTOFFS};
pub use events::{Event, EventLog, ItemAttrs, Label, LabelTable, UserSequences};
pub use merge::{build_candidates, Candidate, CandidateTable, Source};
pub use params::{RecallParams, SamplerConfig};
pub use popularity::PopularityPools;
pub use rebuy::RebuyScores;
pub use sampling::{stratified_sample, validate_quality, SamplingReport, UserStats};

/// Everything the recall stage produced, for inspection and evaluation.
#[derive(Debug)]
pub struct RecallArtifacts {
    pub candidates: CandidateTable,
    pub rebuy: RebuyScores,
    pub covisit: CovisitGraph,
    pub pools: PopularityPools,
    pub params: RecallParams,
}

/// Run the full recall stage: normalize the log, build the three signal
/// tables, and merge them into per-user candidate lists.
pub fn run_recall(log: &EventLog, attrs: &ItemAttrs, params: &RecallParams) -> RecallArtifacts {
    let sequences = UserSequences::build(log);
    let rebuy = RebuyScores::build(&sequences, params);
    let covisit = CovisitGraph::build(&sequences, params);
    let pools = PopularityPools::build(log, attrs, params);
    let candidates = build_candidates(&sequences, &rebuy, &covisit, &pools, attrs, params);
    RecallArtifacts {
        candidates,
        rebuy,
        covisit,
        pools,
        params: params.clone(),
    }
}
