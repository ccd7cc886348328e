//! Event log, item attributes, labels, and the sequence normalizer.
//!
//! The caller hands over already-loaded tabular inputs: a training event
//! table (columnar), an optional item→category/store attribute table, and an
//! optional held-out label table. Everything downstream works from the
//! per-user chronological sequences built here.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// One purchase event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub user_id: i64,
    pub item_id: i64,
    /// Unix seconds.
    pub timestamp: i64,
    /// Explicit tie-break order for events sharing a timestamp.
    pub order_rank: Option<i64>,
}

/// Validated, immutable collection of training events.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<Event>,
}

impl EventLog {
    pub fn new(events: Vec<Event>) -> Self {
        EventLog { events }
    }

    /// Build from parallel columns, validating the schema.
    ///
    /// The timestamp column is mandatory: without a genuine temporal column
    /// no downstream ordering is defined. Column lengths must all match
    /// `user_ids`.
    pub fn from_columns(
        user_ids: Vec<i64>,
        item_ids: Vec<i64>,
        timestamps: Option<Vec<i64>>,
        order_ranks: Option<Vec<i64>>,
    ) -> Result<Self, PipelineError> {
        let n = user_ids.len();
        let timestamps = timestamps.ok_or(PipelineError::Schema {
            column: "timestamp",
            reason: "required temporal column is absent".to_string(),
        })?;
        check_len("item_id", item_ids.len(), n)?;
        check_len("timestamp", timestamps.len(), n)?;
        if let Some(ranks) = &order_ranks {
            check_len("order_rank", ranks.len(), n)?;
        }

        let events = (0..n)
            .map(|i| Event {
                user_id: user_ids[i],
                item_id: item_ids[i],
                timestamp: timestamps[i],
                order_rank: order_ranks.as_ref().map(|r| r[i]),
            })
            .collect();
        Ok(EventLog { events })
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Restrict the log to the given users, preserving input order.
    pub fn filter_users(&self, users: &ahash::AHashSet<i64>) -> EventLog {
        EventLog {
            events: self
                .events
                .iter()
                .filter(|e| users.contains(&e.user_id))
                .copied()
                .collect(),
        }
    }
}

fn check_len(column: &'static str, got: usize, want: usize) -> Result<(), PipelineError> {
    if got != want {
        return Err(PipelineError::Schema {
            column,
            reason: format!("length {got} does not match user_id length {want}"),
        });
    }
    Ok(())
}

/// Item → category/store attribute join, optional on both sides.
#[derive(Debug, Clone, Default)]
pub struct ItemAttrs {
    pub cate_of: AHashMap<i64, i64>,
    pub store_of: AHashMap<i64, i64>,
}

impl ItemAttrs {
    pub fn new(cate_of: AHashMap<i64, i64>, store_of: AHashMap<i64, i64>) -> Self {
        ItemAttrs { cate_of, store_of }
    }

    /// No attribute table available: category/store pools degenerate to empty.
    pub fn empty() -> Self {
        ItemAttrs::default()
    }
}

/// One held-out label: the user's next purchase after the training horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub user_id: i64,
    pub item_id: i64,
    /// Unix seconds; `None` when the label table carries no timestamps.
    pub timestamp: Option<i64>,
}

/// Raw label rows; split validation runs in `eval::validate_split`.
#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    rows: Vec<Label>,
}

impl LabelTable {
    pub fn new(rows: Vec<Label>) -> Self {
        LabelTable { rows }
    }

    pub fn rows(&self) -> &[Label] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Per-user chronological sequences, the normalized view of the log.
#[derive(Debug, Clone, Default)]
pub struct UserSequences {
    by_user: AHashMap<i64, Vec<Event>>,
    /// User ids in ascending order, for deterministic iteration.
    users: Vec<i64>,
}

impl UserSequences {
    /// Group events by user and stable-sort each group by
    /// `(timestamp, order_rank)` ascending.
    ///
    /// With no `order_rank`, equal timestamps keep their input order (the
    /// sort is stable), so a rerun on identical input yields an identical
    /// order.
    pub fn build(log: &EventLog) -> Self {
        let mut by_user: AHashMap<i64, Vec<Event>> = AHashMap::new();
        for event in log.events() {
            by_user.entry(event.user_id).or_default().push(*event);
        }
        for seq in by_user.values_mut() {
            seq.sort_by_key(|e| (e.timestamp, e.order_rank));
        }
        let mut users: Vec<i64> = by_user.keys().copied().collect();
        users.sort_unstable();
        UserSequences { by_user, users }
    }

    pub fn get(&self, user_id: i64) -> Option<&[Event]> {
        self.by_user.get(&user_id).map(Vec::as_slice)
    }

    /// Ascending user ids.
    pub fn users(&self) -> &[i64] {
        &self.users
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Sequences in ascending user order.
    pub fn iter(&self) -> impl Iterator<Item = (i64, &[Event])> {
        self.users
            .iter()
            .map(move |uid| (*uid, self.by_user[uid].as_slice()))
    }

    /// The user's last `k` item ids, oldest first.
    pub fn recent_items(&self, user_id: i64, k: usize) -> Vec<i64> {
        match self.get(user_id) {
            Some(seq) => {
                let start = seq.len().saturating_sub(k);
                seq[start..].iter().map(|e| e.item_id).collect()
            }
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
pub(crate) fn event(user_id: i64, item_id: i64, timestamp: i64) -> Event {
    Event {
        user_id,
        item_id,
        timestamp,
        order_rank: None,
    }
}
