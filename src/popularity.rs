//! Popularity pools: global, per-category, and per-store top-N rankings.
//!
//! Raw frequency counts over the training log, ranked (count descending,
//! item id ascending) so that ties resolve identically across runs. When no
//! item-attribute table is available the category/store pools are empty,
//! which downstream reads as "no personalized pool for this user".

use ahash::AHashMap;

use crate::events::{EventLog, ItemAttrs};
use crate::params::RecallParams;

#[derive(Debug, Clone, Default)]
pub struct PopularityPools {
    /// Top `pop_pool` items overall.
    global: Vec<i64>,
    /// cate_id → top `per_cate_pool` items within the category.
    by_cate: AHashMap<i64, Vec<i64>>,
    /// store_id → top `per_store_pool` items within the store.
    by_store: AHashMap<i64, Vec<i64>>,
}

impl PopularityPools {
    pub fn build(log: &EventLog, attrs: &ItemAttrs, params: &RecallParams) -> Self {
        let mut item_count: AHashMap<i64, u64> = AHashMap::new();
        let mut cate_count: AHashMap<(i64, i64), u64> = AHashMap::new();
        let mut store_count: AHashMap<(i64, i64), u64> = AHashMap::new();

        for event in log.events() {
            *item_count.entry(event.item_id).or_insert(0) += 1;
            if let Some(&cate) = attrs.cate_of.get(&event.item_id) {
                *cate_count.entry((cate, event.item_id)).or_insert(0) += 1;
            }
            if let Some(&store) = attrs.store_of.get(&event.item_id) {
                *store_count.entry((store, event.item_id)).or_insert(0) += 1;
            }
        }

        PopularityPools {
            global: ranked(item_count, params.pop_pool),
            by_cate: ranked_grouped(cate_count, params.per_cate_pool),
            by_store: ranked_grouped(store_count, params.per_store_pool),
        }
    }

    pub fn global(&self) -> &[i64] {
        &self.global
    }

    pub fn cate_pool(&self, cate_id: i64) -> &[i64] {
        self.by_cate.get(&cate_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn store_pool(&self, store_id: i64) -> &[i64] {
        self.by_store
            .get(&store_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn ranked(counts: AHashMap<i64, u64>, cap: usize) -> Vec<i64> {
    let mut items: Vec<(i64, u64)> = counts.into_iter().collect();
    items.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    items.truncate(cap);
    items.into_iter().map(|(item, _)| item).collect()
}

fn ranked_grouped(counts: AHashMap<(i64, i64), u64>, cap: usize) -> AHashMap<i64, Vec<i64>> {
    let mut grouped: AHashMap<i64, Vec<(i64, u64)>> = AHashMap::new();
    for ((scope, item), count) in counts {
        grouped.entry(scope).or_default().push((item, count));
    }
    grouped
        .into_iter()
        .map(|(scope, mut items)| {
            items.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
            items.truncate(cap);
            (scope, items.into_iter().map(|(item, _)| item).collect())
        })
        .collect()
}
