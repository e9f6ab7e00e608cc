//! Fixed slot table with an index-linked recency list.
//!
//! Every slot lives in one `Vec` for the lifetime of the cache. The recency
//! list threads through the slots by index (`prev`/`next`), head being the
//! most recently used (LRU) or most recently inserted (FIFO) slot and tail
//! the next eviction candidate.

use bcache_types::{BlockNumber, SlotIndex};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub(crate) block: Option<BlockNumber>,
    data: Vec<u8>,
    pub(crate) dirty: bool,
    /// Write-back in progress; the slot must not be evicted or overwritten.
    pub(crate) locked: bool,
    pub(crate) access_count: u64,
    prev: Option<SlotIndex>,
    next: Option<SlotIndex>,
}

impl Slot {
    fn empty(block_size: usize) -> Self {
        Self {
            block: None,
            data: vec![0_u8; block_size],
            dirty: false,
            locked: false,
            access_count: 0,
            prev: None,
            next: None,
        }
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn is_occupied(&self) -> bool {
        self.block.is_some()
    }

    /// Overwrite the contents in place, marking the slot dirty.
    pub(crate) fn overwrite(&mut self, bytes: &[u8]) {
        self.data.copy_from_slice(bytes);
        self.dirty = true;
    }
}

#[derive(Debug)]
pub(crate) struct SlotTable {
    slots: Vec<Slot>,
    index: HashMap<BlockNumber, SlotIndex>,
    head: Option<SlotIndex>,
    tail: Option<SlotIndex>,
}

impl SlotTable {
    pub(crate) fn new(capacity: usize, block_size: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::empty(block_size)).collect(),
            index: HashMap::with_capacity(capacity),
            head: None,
            tail: None,
        }
    }

    pub(crate) fn slot(&self, idx: SlotIndex) -> &Slot {
        &self.slots[idx.0]
    }

    pub(crate) fn slot_mut(&mut self, idx: SlotIndex) -> &mut Slot {
        &mut self.slots[idx.0]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (SlotIndex, &Slot)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (SlotIndex(i), slot))
    }

    pub(crate) fn tail(&self) -> Option<SlotIndex> {
        self.tail
    }

    pub(crate) fn find(&self, block: BlockNumber) -> Option<SlotIndex> {
        self.index.get(&block).copied()
    }

    /// First unoccupied slot in index order.
    pub(crate) fn free_slot(&self) -> Option<SlotIndex> {
        self.slots
            .iter()
            .position(|slot| !slot.is_occupied())
            .map(SlotIndex)
    }

    pub(crate) fn resident_count(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn dirty_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.dirty).count()
    }

    pub(crate) fn resident_blocks(&self) -> Vec<BlockNumber> {
        let mut blocks: Vec<BlockNumber> = self.index.keys().copied().collect();
        blocks.sort_unstable();
        blocks
    }

    /// Blocks on the recency list from head to tail.
    pub(crate) fn recency_order(&self) -> Vec<BlockNumber> {
        let mut out = Vec::with_capacity(self.slots.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let slot = self.slot(idx);
            out.extend(slot.block);
            cursor = slot.next;
        }
        out
    }

    /// Put `block` into the empty slot `idx`.
    ///
    /// The caller has already released any previous occupant.
    pub(crate) fn install(
        &mut self,
        idx: SlotIndex,
        block: BlockNumber,
        bytes: &[u8],
        dirty: bool,
    ) {
        debug_assert!(!self.slot(idx).is_occupied());
        debug_assert!(!self.index.contains_key(&block));
        let slot = self.slot_mut(idx);
        slot.data.copy_from_slice(bytes);
        slot.block = Some(block);
        slot.dirty = dirty;
        slot.locked = false;
        slot.access_count = 1;
        self.index.insert(block, idx);
    }

    /// Drop the occupant of `idx`, unlinking it from the recency list.
    ///
    /// Returns the block that was resident.
    pub(crate) fn release(&mut self, idx: SlotIndex) -> Option<BlockNumber> {
        self.unlink(idx);
        let slot = self.slot_mut(idx);
        let old = slot.block.take();
        slot.dirty = false;
        slot.locked = false;
        slot.access_count = 0;
        if let Some(block) = old {
            let _ = self.index.remove(&block);
        }
        old
    }

    pub(crate) fn push_front(&mut self, idx: SlotIndex) {
        let old_head = self.head;
        {
            let slot = self.slot_mut(idx);
            slot.prev = None;
            slot.next = old_head;
        }
        if let Some(head) = old_head {
            self.slot_mut(head).prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    pub(crate) fn move_to_front(&mut self, idx: SlotIndex) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    fn unlink(&mut self, idx: SlotIndex) {
        let (prev, next) = {
            let slot = self.slot(idx);
            (slot.prev, slot.next)
        };
        let linked = prev.is_some() || next.is_some() || self.head == Some(idx);
        if !linked {
            return;
        }
        match prev {
            Some(p) => self.slot_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slot_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let slot = self.slot_mut(idx);
        slot.prev = None;
        slot.next = None;
    }
}
