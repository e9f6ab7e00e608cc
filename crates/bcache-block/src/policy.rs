//! Victim selection.
//!
//! Selection never looks at the `locked` bit; the cache engine re-runs it
//! after waiting when the chosen slot is locked.

use crate::slot::SlotTable;
use bcache_types::{ReplacementPolicy, SlotIndex};

/// Pick the slot to reclaim from a full table.
///
/// FIFO and LRU take the recency-list tail. LFU takes the occupied slot with
/// the smallest access count, lowest index on ties.
pub(crate) fn select_victim(table: &SlotTable, policy: ReplacementPolicy) -> Option<SlotIndex> {
    match policy {
        ReplacementPolicy::Fifo | ReplacementPolicy::Lru => table.tail(),
        ReplacementPolicy::Lfu => table
            .iter()
            .filter(|(_, slot)| slot.is_occupied())
            .min_by_key(|(idx, slot)| (slot.access_count, *idx))
            .map(|(idx, _)| idx),
    }
}
