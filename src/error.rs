//! Error taxonomy for the recall pipeline.
//!
//! Schema and split violations are fatal and carry enough context (user id,
//! column name, counts) for the caller to act. Soft quality thresholds never
//! surface here; the sampler reports those as advisory diagnostics instead.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PipelineError {
    /// A required input column is absent or its length disagrees with the rest.
    #[error("schema violation on column `{column}`: {reason}")]
    Schema { column: &'static str, reason: String },

    /// A label user does not exist in the training log.
    #[error("invalid split: label user {user_id} has no training events")]
    InvalidSplit { user_id: i64 },

    /// A user appears more than once in the label table.
    #[error("duplicate label: user {user_id} has {count} label rows, expected exactly 1")]
    DuplicateLabel { user_id: i64, count: usize },

    /// A label timestamp does not strictly exceed the user's training horizon.
    #[error(
        "temporal leak: user {user_id} label at {label_ts} is not after its last training event at {train_max_ts}"
    )]
    TemporalLeak {
        user_id: i64,
        label_ts: i64,
        train_max_ts: i64,
    },

    /// No label item appears anywhere in the training item universe.
    #[error("degenerate labels: none of the {label_items} label items appear in training")]
    DegenerateLabels { label_items: usize },
}
