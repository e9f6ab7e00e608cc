//! Cache engine: slot lookup, victim selection, write-back and disk I/O
//! under one mutual-exclusion domain.

use crate::policy::select_victim;
use crate::slot::SlotTable;
use crate::stats::{CacheMetrics, CacheStats};
use crate::{BlockBuf, BlockDevice};
use bcache_error::{CacheError, Result};
use bcache_types::{
    BlockNumber, DEFAULT_CACHE_CAPACITY, DEFAULT_EVICTION_WAIT, ReplacementPolicy, SlotIndex,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Construction-time cache parameters. Nothing here can change afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of slots.
    pub capacity: usize,
    pub policy: ReplacementPolicy,
    /// Longest single wait on a locked victim before selection is re-run.
    pub eviction_wait: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
            policy: ReplacementPolicy::default(),
            eviction_wait: DEFAULT_EVICTION_WAIT,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn new(capacity: usize, policy: ReplacementPolicy) -> Self {
        Self {
            capacity,
            policy,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub(crate) struct CacheState {
    pub(crate) table: SlotTable,
    pub(crate) stats: CacheStats,
}

/// Where a requested block ends up.
#[derive(Debug, Clone, Copy)]
enum Placement {
    /// Already cached (possibly loaded by another caller while we waited).
    Resident(SlotIndex),
    Free(SlotIndex),
    /// Unlocked occupied slot chosen by the policy.
    Victim(SlotIndex),
}

#[derive(Debug, Clone, Copy)]
enum Fill<'a> {
    FromDisk,
    Payload(&'a [u8]),
}

/// Result of one pass over the slot table writing back dirty slots.
#[derive(Debug, Default)]
pub(crate) struct SweepOutcome {
    pub(crate) written: usize,
    pub(crate) failed: usize,
    pub(crate) first_error: Option<CacheError>,
}

/// Fixed-capacity write-back cache in front of a [`BlockDevice`].
///
/// All slot state sits behind one lock. Reads and writes of blocks that
/// are not resident claim a free slot or evict a victim chosen by the
/// configured [`ReplacementPolicy`]; a dirty victim is written back before
/// its slot is reused. Writes never touch the device for the written block
/// itself; that happens on eviction, on an explicit flush, or from the
/// [`FlushDaemon`](crate::FlushDaemon).
///
/// A victim whose `locked` bit is set (flush write-back in flight) is never
/// reclaimed: the caller waits on a condition variable signalled by the
/// flusher, bounded by `eviction_wait` per round, and then re-runs victim
/// selection from scratch. There is no retry limit.
#[derive(Debug)]
pub struct BlockCache<D: BlockDevice> {
    device: D,
    policy: ReplacementPolicy,
    eviction_wait: Duration,
    capacity: usize,
    block_len: usize,
    state: Mutex<CacheState>,
    slot_unlocked: Condvar,
    /// Set while a flush daemon owns this cache.
    pub(crate) daemon_running: AtomicBool,
}

impl<D: BlockDevice> BlockCache<D> {
    pub fn new(device: D, config: CacheConfig) -> Result<Self> {
        if config.capacity == 0 {
            return Err(CacheError::InvalidConfig(
                "cache capacity must be > 0".to_owned(),
            ));
        }
        if config.eviction_wait.is_zero() {
            return Err(CacheError::InvalidConfig(
                "eviction wait must be > 0".to_owned(),
            ));
        }
        let block_size = device.block_size();
        if block_size == 0 {
            return Err(CacheError::InvalidConfig(
                "device block size must be > 0".to_owned(),
            ));
        }
        let block_len = usize::try_from(block_size)
            .map_err(|_| CacheError::InvalidConfig("block size does not fit usize".to_owned()))?;

        debug!(
            capacity = config.capacity,
            policy = %config.policy,
            block_size,
            block_count = device.block_count(),
            "block cache created"
        );
        Ok(Self {
            device,
            policy: config.policy,
            eviction_wait: config.eviction_wait,
            capacity: config.capacity,
            block_len,
            state: Mutex::new(CacheState {
                table: SlotTable::new(config.capacity, block_len),
                stats: CacheStats::default(),
            }),
            slot_unlocked: Condvar::new(),
            daemon_running: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    #[must_use]
    pub fn policy(&self) -> ReplacementPolicy {
        self.policy
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.device.block_size()
    }

    /// Read a block, returning a copy of its contents.
    pub fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        self.read_block_with(block, |bytes| BlockBuf::new(bytes.to_vec()))
    }

    /// Read a block and hand its cached bytes to `f`.
    ///
    /// `f` runs with the cache lock held, so the slice cannot change under
    /// it; keep it short.
    pub fn read_block_with<R>(&self, block: BlockNumber, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.check_block(block)?;
        let mut state = self.state.lock();

        if let Some(idx) = state.table.find(block) {
            state.stats.hits += 1;
            self.touch(&mut state, idx);
            trace!(block = block.0, slot = idx.0, "cache hit");
            return Ok(f(state.table.slot(idx).data()));
        }

        state.stats.misses += 1;
        trace!(block = block.0, "cache miss");
        let idx = match self.place(&mut state, block) {
            Placement::Resident(idx) => {
                self.touch(&mut state, idx);
                idx
            }
            Placement::Free(idx) => {
                self.claim(&mut state, idx, false, block, Fill::FromDisk)?;
                idx
            }
            Placement::Victim(idx) => {
                self.claim(&mut state, idx, true, block, Fill::FromDisk)?;
                idx
            }
        };
        Ok(f(state.table.slot(idx).data()))
    }

    /// Cache new contents for `block` and mark it dirty.
    ///
    /// The block is not read from the device: a resident slot is
    /// overwritten, otherwise a slot is claimed the same way a read miss
    /// claims one. Persisting happens later.
    pub fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        self.check_block(block)?;
        if data.len() != self.block_len {
            return Err(CacheError::BufferSize {
                got: data.len(),
                expected: self.block_len,
            });
        }

        let mut state = self.state.lock();
        loop {
            match self.place(&mut state, block) {
                Placement::Resident(idx) if state.table.slot(idx).locked => {
                    trace!(block = block.0, slot = idx.0, "write waits for write-back");
                    self.wait_for_unlock(&mut state);
                }
                Placement::Resident(idx) => {
                    let slot = state.table.slot_mut(idx);
                    slot.overwrite(data);
                    slot.access_count += 1;
                    if self.policy.promotes_on_hit() {
                        state.table.move_to_front(idx);
                    }
                    trace!(block = block.0, slot = idx.0, "write hit");
                    return Ok(());
                }
                Placement::Free(idx) => {
                    return self.claim(&mut state, idx, false, block, Fill::Payload(data));
                }
                Placement::Victim(idx) => {
                    return self.claim(&mut state, idx, true, block, Fill::Payload(data));
                }
            }
        }
    }

    #[must_use]
    pub fn hit_count(&self) -> u64 {
        self.state.lock().stats.hits
    }

    #[must_use]
    pub fn miss_count(&self) -> u64 {
        self.state.lock().stats.misses
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        let state = self.state.lock();
        CacheMetrics {
            hits: state.stats.hits,
            misses: state.stats.misses,
            evictions: state.stats.evictions,
            write_backs: state.stats.write_backs,
            dirty_blocks: state.table.dirty_count(),
            resident_blocks: state.table.resident_count(),
            capacity: self.capacity,
        }
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.state.lock().table.dirty_count()
    }

    /// Resident block numbers in ascending order.
    #[must_use]
    pub fn resident_blocks(&self) -> Vec<BlockNumber> {
        self.state.lock().table.resident_blocks()
    }

    /// Recency list from head (next to survive) to tail (next victim).
    /// Empty under LFU.
    #[must_use]
    pub fn recency_order(&self) -> Vec<BlockNumber> {
        self.state.lock().table.recency_order()
    }

    #[must_use]
    pub fn contains(&self, block: BlockNumber) -> bool {
        self.state.lock().table.find(block).is_some()
    }

    /// Write back every dirty, unlocked slot now.
    ///
    /// Returns the number of blocks written, or the first device error after
    /// the whole table has been visited.
    pub fn flush_dirty(&self) -> Result<usize> {
        let outcome = self.sweep_dirty();
        match outcome.first_error {
            Some(err) => Err(err),
            None => Ok(outcome.written),
        }
    }

    /// [`flush_dirty`](Self::flush_dirty) followed by a device sync.
    pub fn sync(&self) -> Result<()> {
        let _ = self.flush_dirty()?;
        self.device.sync()
    }

    /// One pass over the slot table in index order.
    ///
    /// Each dirty, unlocked slot is locked, its bytes copied, and the cache
    /// lock released for the duration of the device write. Locked slots are
    /// neither evicted nor overwritten meanwhile, so the copy stays current.
    pub(crate) fn sweep_dirty(&self) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let mut state = self.state.lock();

        for i in 0..self.capacity {
            let idx = SlotIndex(i);
            let slot = state.table.slot(idx);
            let Some(block) = slot.block else {
                continue;
            };
            if !slot.dirty || slot.locked {
                continue;
            }
            let snapshot = slot.data().to_vec();
            state.table.slot_mut(idx).locked = true;

            let result =
                MutexGuard::unlocked(&mut state, || self.device.write_block(block, &snapshot));

            let st = &mut *state;
            let slot = st.table.slot_mut(idx);
            slot.locked = false;
            match result {
                Ok(()) => {
                    slot.dirty = false;
                    st.stats.write_backs += 1;
                    outcome.written += 1;
                }
                Err(err) => {
                    warn!(block = block.0, slot = i, error = %err, "flush write-back failed");
                    outcome.failed += 1;
                    if outcome.first_error.is_none() {
                        outcome.first_error = Some(err);
                    }
                }
            }
            self.slot_unlocked.notify_all();
        }
        drop(state);
        outcome
    }

    fn check_block(&self, block: BlockNumber) -> Result<()> {
        let block_count = self.device.block_count();
        if block.0 >= block_count {
            return Err(CacheError::InvalidBlockNumber {
                block: block.0,
                block_count,
            });
        }
        Ok(())
    }

    /// Hit bookkeeping: bump the access count, promote under LRU.
    fn touch(&self, state: &mut CacheState, idx: SlotIndex) {
        state.table.slot_mut(idx).access_count += 1;
        if self.policy.promotes_on_hit() {
            state.table.move_to_front(idx);
        }
    }

    fn wait_for_unlock(&self, state: &mut MutexGuard<'_, CacheState>) {
        let _ = self.slot_unlocked.wait_for(state, self.eviction_wait);
    }

    /// Find the slot `block` should occupy, waiting out locked victims.
    fn place(&self, state: &mut MutexGuard<'_, CacheState>, block: BlockNumber) -> Placement {
        loop {
            if let Some(idx) = state.table.find(block) {
                return Placement::Resident(idx);
            }
            if let Some(idx) = state.table.free_slot() {
                return Placement::Free(idx);
            }
            match select_victim(&state.table, self.policy) {
                Some(idx) if !state.table.slot(idx).locked => return Placement::Victim(idx),
                victim => {
                    trace!(
                        block = block.0,
                        victim = ?victim.map(|idx| idx.0),
                        "victim locked, waiting"
                    );
                    self.wait_for_unlock(state);
                }
            }
        }
    }

    /// Install `block` into `idx`, evicting the current occupant when
    /// `evict` is set.
    ///
    /// Every fallible step runs before the table is touched, so on error
    /// the slot keeps its previous occupant (clean if its write-back already
    /// went through).
    fn claim(
        &self,
        state: &mut CacheState,
        idx: SlotIndex,
        evict: bool,
        block: BlockNumber,
        fill: Fill<'_>,
    ) -> Result<()> {
        if evict {
            self.write_back_victim(state, idx)?;
        }

        let loaded;
        let (bytes, dirty) = match fill {
            Fill::FromDisk => {
                loaded = self.device.read_block(block)?;
                if loaded.len() != self.block_len {
                    return Err(CacheError::Device(format!(
                        "device returned {} bytes for block {block}, expected {}",
                        loaded.len(),
                        self.block_len
                    )));
                }
                (loaded.as_slice(), false)
            }
            Fill::Payload(data) => (data, true),
        };

        if evict {
            let old = state.table.release(idx);
            state.stats.evictions += 1;
            debug!(
                slot = idx.0,
                evicted = ?old.map(|b| b.0),
                incoming = block.0,
                policy = %self.policy,
                "evicted slot"
            );
        }
        state.table.install(idx, block, bytes, dirty);
        if self.policy.uses_recency_list() {
            state.table.push_front(idx);
        }
        Ok(())
    }

    fn write_back_victim(&self, state: &mut CacheState, idx: SlotIndex) -> Result<()> {
        let slot = state.table.slot(idx);
        let Some(block) = slot.block else {
            return Ok(());
        };
        if !slot.dirty {
            return Ok(());
        }
        self.device.write_block(block, slot.data())?;
        state.table.slot_mut(idx).dirty = false;
        state.stats.write_backs += 1;
        debug!(block = block.0, slot = idx.0, "wrote back dirty victim");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_locked(&self, block: BlockNumber, locked: bool) {
        let mut state = self.state.lock();
        if let Some(idx) = state.table.find(block) {
            state.table.slot_mut(idx).locked = locked;
        }
        drop(state);
        if !locked {
            self.slot_unlocked.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ByteBlockDevice, MemByteDevice};
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    const BS: u32 = 64;

    /// Block device that records writes and can be told to fail.
    #[derive(Debug)]
    struct FlakyDevice {
        inner: ByteBlockDevice<MemByteDevice>,
        reads: AtomicUsize,
        writes: parking_lot::Mutex<Vec<BlockNumber>>,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
    }

    impl FlakyDevice {
        fn new(blocks: usize) -> Self {
            Self {
                inner: ByteBlockDevice::new(MemByteDevice::new(BS as usize * blocks), BS)
                    .expect("device"),
                reads: AtomicUsize::new(0),
                writes: parking_lot::Mutex::new(Vec::new()),
                fail_reads: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
            }
        }

        fn writes(&self) -> Vec<u64> {
            self.writes.lock().iter().map(|b| b.0).collect()
        }
    }

    impl BlockDevice for FlakyDevice {
        fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(CacheError::Io(std::io::Error::other("injected read failure")));
            }
            self.inner.read_block(block)
        }

        fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(CacheError::Io(std::io::Error::other("injected write failure")));
            }
            self.writes.lock().push(block);
            self.inner.write_block(block, data)
        }

        fn block_size(&self) -> u32 {
            self.inner.block_size()
        }

        fn block_count(&self) -> u64 {
            self.inner.block_count()
        }

        fn sync(&self) -> Result<()> {
            Ok(())
        }
    }

    fn cache(capacity: usize, policy: ReplacementPolicy) -> BlockCache<FlakyDevice> {
        BlockCache::new(FlakyDevice::new(32), CacheConfig::new(capacity, policy)).expect("cache")
    }

    fn payload(byte: u8) -> Vec<u8> {
        vec![byte; BS as usize]
    }

    fn blocks(cache: &BlockCache<FlakyDevice>) -> Vec<u64> {
        cache.resident_blocks().into_iter().map(|b| b.0).collect()
    }

    #[test]
    fn rejects_zero_capacity() {
        let err = BlockCache::new(FlakyDevice::new(4), CacheConfig::new(0, ReplacementPolicy::Lru))
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidConfig(_)));
    }

    #[test]
    fn invalid_block_number_leaves_state_untouched() {
        let cache = cache(2, ReplacementPolicy::Lru);
        let err = cache.read_block(BlockNumber(32)).unwrap_err();
        assert!(matches!(
            err,
            CacheError::InvalidBlockNumber {
                block: 32,
                block_count: 32
            }
        ));
        let err = cache.write_block(BlockNumber(99), &payload(1)).unwrap_err();
        assert!(matches!(err, CacheError::InvalidBlockNumber { .. }));
        assert_eq!(cache.miss_count(), 0);
        assert_eq!(cache.device().reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn write_rejects_wrong_length() {
        let cache = cache(2, ReplacementPolicy::Lru);
        let err = cache.write_block(BlockNumber(1), &[0_u8; 3]).unwrap_err();
        assert!(matches!(err, CacheError::BufferSize { got: 3, expected: 64 }));
        assert!(cache.resident_blocks().is_empty());
    }

    #[test]
    fn lru_scenario_evicts_true_least_recent() {
        let cache = cache(2, ReplacementPolicy::Lru);
        for b in [1, 2, 1, 3] {
            let _ = cache.read_block(BlockNumber(b)).expect("read");
        }
        assert_eq!(cache.miss_count(), 3);
        assert_eq!(cache.hit_count(), 1);
        assert_eq!(blocks(&cache), vec![1, 3]);
        assert_eq!(cache.recency_order(), vec![BlockNumber(3), BlockNumber(1)]);
    }

    #[test]
    fn fifo_does_not_reorder_on_hit() {
        let cache = cache(2, ReplacementPolicy::Fifo);
        for b in [1, 2, 1, 3] {
            let _ = cache.read_block(BlockNumber(b)).expect("read");
        }
        assert_eq!(cache.hit_count(), 1);
        assert_eq!(blocks(&cache), vec![2, 3]);
    }

    #[test]
    fn lfu_evicts_least_frequent() {
        let cache = cache(3, ReplacementPolicy::Lfu);
        for b in [1, 1, 1, 2, 3, 3] {
            let _ = cache.read_block(BlockNumber(b)).expect("read");
        }
        let _ = cache.read_block(BlockNumber(4)).expect("read");
        assert_eq!(blocks(&cache), vec![1, 3, 4]);
        assert!(cache.recency_order().is_empty());
    }

    #[test]
    fn write_then_read_returns_written_bytes_without_disk_io() {
        let cache = cache(2, ReplacementPolicy::Lru);
        cache.write_block(BlockNumber(5), &payload(0x58)).expect("write");
        assert_eq!(cache.device().reads.load(Ordering::SeqCst), 0);
        assert!(cache.device().writes().is_empty());

        let read = cache.read_block(BlockNumber(5)).expect("read");
        assert_eq!(read.as_slice(), payload(0x58).as_slice());
        assert_eq!(cache.hit_count(), 1);
        assert_eq!(cache.dirty_count(), 1);
    }

    #[test]
    fn dirty_victim_written_back_exactly_once_before_reuse() {
        let cache = cache(2, ReplacementPolicy::Lru);
        cache.write_block(BlockNumber(5), &payload(b'X')).expect("write");
        let _ = cache.read_block(BlockNumber(6)).expect("read");
        let _ = cache.read_block(BlockNumber(7)).expect("read");
        assert_eq!(cache.device().writes(), vec![5]);
        assert!(!cache.contains(BlockNumber(5)));

        let _ = cache.read_block(BlockNumber(8)).expect("read");
        assert_eq!(cache.device().writes(), vec![5]);
        assert_eq!(
            cache.device().inner.read_block(BlockNumber(5)).expect("disk").as_slice(),
            payload(b'X').as_slice()
        );
        assert_eq!(cache.metrics().evictions, 2);
    }

    #[test]
    fn failed_write_back_keeps_victim_intact() {
        let cache = cache(1, ReplacementPolicy::Lru);
        cache.write_block(BlockNumber(3), &payload(9)).expect("write");
        cache.device().fail_writes.store(true, Ordering::SeqCst);

        let err = cache.read_block(BlockNumber(4)).unwrap_err();
        assert!(err.is_disk_failure());
        assert_eq!(blocks(&cache), vec![3]);
        assert_eq!(cache.dirty_count(), 1);
        assert_eq!(cache.device().reads.load(Ordering::SeqCst), 0);

        cache.device().fail_writes.store(false, Ordering::SeqCst);
        let _ = cache.read_block(BlockNumber(4)).expect("read after recovery");
        assert_eq!(cache.device().writes(), vec![3]);
    }

    #[test]
    fn failed_read_keeps_previous_occupant() {
        let cache = cache(1, ReplacementPolicy::Lfu);
        cache.write_block(BlockNumber(1), &payload(4)).expect("write");
        cache.device().fail_reads.store(true, Ordering::SeqCst);

        let err = cache.read_block(BlockNumber(2)).unwrap_err();
        assert!(err.is_disk_failure());
        assert_eq!(blocks(&cache), vec![1]);
        assert_eq!(cache.dirty_count(), 0, "write-back already completed");
        assert_eq!(
            cache.read_block(BlockNumber(1)).expect("still cached").as_slice(),
            payload(4).as_slice()
        );
    }

    #[test]
    fn flush_dirty_clears_every_dirty_slot() {
        let cache = cache(4, ReplacementPolicy::Fifo);
        for b in 0..4_u8 {
            cache.write_block(BlockNumber(u64::from(b)), &payload(b)).expect("write");
        }
        assert_eq!(cache.flush_dirty().expect("flush"), 4);
        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(cache.flush_dirty().expect("flush"), 0);
        assert_eq!(cache.metrics().write_backs, 4);
    }

    #[test]
    fn flush_dirty_reports_failure_and_keeps_dirty() {
        let cache = cache(2, ReplacementPolicy::Lru);
        cache.write_block(BlockNumber(1), &payload(1)).expect("write");
        cache.device().fail_writes.store(true, Ordering::SeqCst);
        assert!(cache.flush_dirty().is_err());
        assert_eq!(cache.dirty_count(), 1);
    }

    #[test]
    fn locked_victim_blocks_until_unlocked() {
        let cache = Arc::new(cache(1, ReplacementPolicy::Lru));
        cache.write_block(BlockNumber(1), &payload(1)).expect("write");
        cache.set_locked(BlockNumber(1), true);

        let reader = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.read_block(BlockNumber(2)).map(|_| Instant::now()))
        };

        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.contains(BlockNumber(1)), "locked slot must not be evicted");
        let released = Instant::now();
        cache.set_locked(BlockNumber(1), false);

        let done = reader.join().expect("join").expect("read");
        assert!(done >= released);
        assert_eq!(blocks(&cache), vec![2]);
        assert_eq!(cache.device().writes(), vec![1]);
    }

    #[test]
    fn write_to_locked_slot_waits() {
        let cache = Arc::new(cache(2, ReplacementPolicy::Lru));
        cache.write_block(BlockNumber(1), &payload(1)).expect("write");
        cache.set_locked(BlockNumber(1), true);

        let writer = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.write_block(BlockNumber(1), &payload(2)))
        };
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(
            cache.read_block(BlockNumber(1)).expect("read").as_slice(),
            payload(1).as_slice()
        );
        cache.set_locked(BlockNumber(1), false);
        writer.join().expect("join").expect("write");
        assert_eq!(
            cache.read_block(BlockNumber(1)).expect("read").as_slice(),
            payload(2).as_slice()
        );
    }

    #[test]
    fn waiting_readers_share_one_load_of_the_same_block() {
        let cache = Arc::new(cache(1, ReplacementPolicy::Lru));
        cache.write_block(BlockNumber(1), &payload(1)).expect("write");
        cache.set_locked(BlockNumber(1), true);

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.read_block(BlockNumber(2)))
            })
            .collect();

        // Every reader has missed and is parked behind the locked victim.
        let deadline = Instant::now() + Duration::from_secs(2);
        while cache.miss_count() < 4 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        std::thread::sleep(Duration::from_millis(30));
        cache.set_locked(BlockNumber(1), false);

        for reader in readers {
            let buf = reader.join().expect("join").expect("read");
            assert_eq!(buf.as_slice(), &[0_u8; BS as usize]);
        }
        assert_eq!(cache.device().reads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.device().writes(), vec![1]);
        assert_eq!(blocks(&cache), vec![2]);
        assert_eq!((cache.hit_count(), cache.miss_count()), (0, 4));
        assert_eq!(cache.metrics().evictions, 1);
    }

    #[test]
    fn capacity_reads_without_the_cache_lock() {
        let cache = cache(3, ReplacementPolicy::Lru);
        let guard = cache.state.lock();
        assert_eq!(cache.capacity(), 3);
        drop(guard);
        assert_eq!(cache.metrics().capacity, 3);
    }

    #[test]
    fn rejects_zero_eviction_wait() {
        let config = CacheConfig {
            eviction_wait: Duration::ZERO,
            ..CacheConfig::new(2, ReplacementPolicy::Fifo)
        };
        let err = BlockCache::new(FlakyDevice::new(4), config).unwrap_err();
        assert!(matches!(err, CacheError::InvalidConfig(_)));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"capacity": 64, "policy": "lfu"}"#).expect("config");
        assert_eq!(config.capacity, 64);
        assert_eq!(config.policy, ReplacementPolicy::Lfu);
        assert_eq!(config.eviction_wait, DEFAULT_EVICTION_WAIT);
        assert_eq!(CacheConfig::default().capacity, DEFAULT_CACHE_CAPACITY);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Read(u64),
        Write(u64, u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0_u64..12).prop_map(Op::Read),
            (0_u64..12, any::<u8>()).prop_map(|(b, v)| Op::Write(b, v)),
        ]
    }

    fn policy_strategy() -> impl Strategy<Value = ReplacementPolicy> {
        prop_oneof![
            Just(ReplacementPolicy::Fifo),
            Just(ReplacementPolicy::Lru),
            Just(ReplacementPolicy::Lfu),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn random_workloads_preserve_cache_invariants(
            policy in policy_strategy(),
            capacity in 1_usize..6,
            ops in proptest::collection::vec(op_strategy(), 1..120),
        ) {
            let cache = cache(capacity, policy);
            let mut model: HashMap<u64, u8> = HashMap::new();
            let mut reads = 0_u64;

            for op in ops {
                match op {
                    Op::Read(b) => {
                        reads += 1;
                        let got = cache.read_block(BlockNumber(b)).unwrap();
                        let want = model.get(&b).copied().unwrap_or(0);
                        prop_assert!(got.as_slice().iter().all(|byte| *byte == want));
                    }
                    Op::Write(b, v) => {
                        cache.write_block(BlockNumber(b), &payload(v)).unwrap();
                        model.insert(b, v);
                    }
                }
                let metrics = cache.metrics();
                prop_assert!(metrics.resident_blocks <= capacity);
                prop_assert!(metrics.dirty_blocks <= metrics.resident_blocks);
                prop_assert_eq!(metrics.hits + metrics.misses, reads);
                if policy.uses_recency_list() {
                    prop_assert_eq!(cache.recency_order().len(), metrics.resident_blocks);
                }
            }

            let _ = cache.flush_dirty().unwrap();
            for (b, v) in &model {
                let on_disk = cache.device().inner.read_block(BlockNumber(*b)).unwrap();
                prop_assert!(on_disk.as_slice().iter().all(|byte| byte == v));
            }
        }

        #[test]
        fn lfu_always_evicts_global_minimum(
            extra_hits in proptest::collection::vec(0_usize..6, 4),
        ) {
            let cache = cache(4, ReplacementPolicy::Lfu);
            for b in 0..4_u64 {
                let _ = cache.read_block(BlockNumber(b)).unwrap();
            }
            for (b, hits) in extra_hits.iter().enumerate() {
                for _ in 0..*hits {
                    let _ = cache.read_block(BlockNumber(b as u64)).unwrap();
                }
            }
            let min = extra_hits.iter().copied().min().unwrap();
            let expected_victim = extra_hits.iter().position(|h| *h == min).unwrap() as u64;

            let _ = cache.read_block(BlockNumber(10)).unwrap();
            prop_assert!(!cache.contains(BlockNumber(expected_victim)));
            prop_assert_eq!(cache.resident_blocks().len(), 4);
        }
    }
}
