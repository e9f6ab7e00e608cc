//! Per-cache counters.
//!
//! Counters are plain integers mutated under the cache lock; there is no
//! separate atomic path and no reset.

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CacheStats {
    pub(crate) hits: u64,
    pub(crate) misses: u64,
    pub(crate) evictions: u64,
    pub(crate) write_backs: u64,
}

/// Point-in-time snapshot of cache counters and occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheMetrics {
    /// `read_block` calls served from a resident slot.
    pub hits: u64,
    /// `read_block` calls that had to place the block.
    pub misses: u64,
    /// Slots reclaimed from a previous occupant.
    pub evictions: u64,
    /// Dirty blocks persisted, on eviction or by a flush sweep.
    pub write_backs: u64,
    pub dirty_blocks: usize,
    pub resident_blocks: usize,
    pub capacity: usize,
}

impl CacheMetrics {
    /// Fraction of reads served from the cache, 0.0 before any read.
    #[must_use]
    #[expect(clippy::cast_precision_loss)] // counters stay far below 2^52
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_ratio_handles_idle_cache() {
        let metrics = CacheMetrics {
            hits: 0,
            misses: 0,
            evictions: 0,
            write_backs: 0,
            dirty_blocks: 0,
            resident_blocks: 0,
            capacity: 4,
        };
        assert!(metrics.hit_ratio().abs() < f64::EPSILON);

        let busy = CacheMetrics {
            hits: 3,
            misses: 1,
            ..metrics
        };
        assert!((busy.hit_ratio() - 0.75).abs() < f64::EPSILON);
    }
}
