//! 4 KiB writeback buffer cache: open-chained hash table over a fixed slot
//! arena, keyed by `(device, block_no)`, with an intrusive LRU list threaded
//! through the same arena by index rather than by pointer.
//!
//! No precedent for a generic block cache exists in the retrieved corpus.
//! The arena-of-indices shape mirrors how this core's other fixed-capacity
//! tables are built (`task::scheduler`'s `[Thread; MAX_THREADS]`,
//! `memory::pfa`'s region table): a `no_std` environment without an
//! allocator-backed doubly linked list reaches for indices into a flat
//! array instead of `Box`/`Rc` links. The LRU bookkeeping itself
//! (`LruList`) is kept free of any I/O or hashing concerns so it can be
//! exercised on its own, the same way `task::scheduler::pick_next` isolates
//! round-robin selection from context switching.
//!
//! Buffers are pinned/unpinned rather than copied in and out: `get` hands
//! back a `Buffer` handle holding a reference count on the slot, and the
//! slot is not eligible for eviction while any handle is outstanding.

use super::{BlockDevice, BLOCK_SIZE};
use crate::error::{KernelError, KernelResult};

pub const CACHE_SLOTS: usize = 64;
const HASH_BUCKETS: usize = 37;

/// Pure recency bookkeeping over `N` slot indices. Knows nothing about what
/// the slots hold; `touch`/`remove`/`pop_lru_matching` just maintain a
/// doubly linked list of indices with `head` as most-recently-used.
struct LruList<const N: usize> {
    prev: [Option<usize>; N],
    next: [Option<usize>; N],
    linked: [bool; N],
    head: Option<usize>,
    tail: Option<usize>,
}

impl<const N: usize> LruList<N> {
    fn new() -> Self {
        LruList {
            prev: [None; N],
            next: [None; N],
            linked: [false; N],
            head: None,
            tail: None,
        }
    }

    fn unlink(&mut self, idx: usize) {
        if !self.linked[idx] {
            return;
        }
        let p = self.prev[idx];
        let n = self.next[idx];
        match p {
            Some(p) => self.next[p] = n,
            None => self.head = n,
        }
        match n {
            Some(n) => self.prev[n] = p,
            None => self.tail = p,
        }
        self.prev[idx] = None;
        self.next[idx] = None;
        self.linked[idx] = false;
    }

    fn push_front(&mut self, idx: usize) {
        self.prev[idx] = None;
        self.next[idx] = self.head;
        if let Some(h) = self.head {
            self.prev[h] = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
        self.linked[idx] = true;
    }

    /// Moves `idx` to the most-recently-used position, inserting it if it
    /// wasn't already tracked.
    fn touch(&mut self, idx: usize) {
        self.unlink(idx);
        self.push_front(idx);
    }

    fn remove(&mut self, idx: usize) {
        self.unlink(idx);
    }

    /// Walks from the least-recently-used end and evicts the first index
    /// for which `pred` holds, skipping over (but not disturbing the order
    /// of) everything it rejects. Returns `None` if nothing matches.
    fn pop_lru_matching(&mut self, mut pred: impl FnMut(usize) -> bool) -> Option<usize> {
        let mut cur = self.tail;
        while let Some(idx) = cur {
            cur = self.prev[idx];
            if pred(idx) {
                self.unlink(idx);
                return Some(idx);
            }
        }
        None
    }
}

#[derive(Clone, Copy)]
struct Slot {
    valid: bool,
    dirty: bool,
    refcnt: u32,
    dev: BlockDevice,
    block_no: u64,
    hash_next: Option<usize>,
    data: [u8; BLOCK_SIZE],
}

impl Slot {
    fn empty() -> Self {
        Slot {
            valid: false,
            dirty: false,
            refcnt: 0,
            dev: BlockDevice::whole_disk(),
            block_no: 0,
            hash_next: None,
            data: [0u8; BLOCK_SIZE],
        }
    }
}

fn hash_key(dev: BlockDevice, block_no: u64) -> usize {
    let tag = dev.dev_tag().wrapping_mul(1_000_003) ^ block_no;
    (tag % HASH_BUCKETS as u64) as usize
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub dirty_marks: u64,
}

/// A pin on a resident slot, checked out by `get` and released by `put`.
/// Holding one guarantees the slot isn't evicted; it carries no data of its
/// own, so reads and writes go through `BufferCache::data`/`data_mut`.
pub struct Buffer {
    idx: usize,
}

/// A fixed-capacity writeback cache shared across every `BlockDevice` in the
/// system (the whole disk and any number of partitions), keyed by
/// `(device, block_no)`. Writes land in a slot and are marked dirty; they
/// only reach the device on eviction, `sync_dev`, or `sync_all`. A crash
/// between a dirty write and a sync loses that write — there is no journal.
pub struct BufferCache {
    slots: [Slot; CACHE_SLOTS],
    buckets: [Option<usize>; HASH_BUCKETS],
    lru: LruList<CACHE_SLOTS>,
    stats: CacheStats,
}

impl BufferCache {
    pub fn new() -> Self {
        BufferCache {
            slots: [Slot::empty(); CACHE_SLOTS],
            buckets: [None; HASH_BUCKETS],
            lru: LruList::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn find_slot(&self, dev: BlockDevice, block_no: u64) -> Option<usize> {
        let mut cur = self.buckets[hash_key(dev, block_no)];
        while let Some(idx) = cur {
            let slot = &self.slots[idx];
            if slot.valid && slot.dev == dev && slot.block_no == block_no {
                return Some(idx);
            }
            cur = slot.hash_next;
        }
        None
    }

    fn hash_insert(&mut self, dev: BlockDevice, block_no: u64, idx: usize) {
        let bucket = hash_key(dev, block_no);
        self.slots[idx].hash_next = self.buckets[bucket];
        self.buckets[bucket] = Some(idx);
    }

    fn hash_remove(&mut self, dev: BlockDevice, block_no: u64, idx: usize) {
        let bucket = hash_key(dev, block_no);
        let mut cur = self.buckets[bucket];
        let mut prev: Option<usize> = None;
        while let Some(cur_idx) = cur {
            if cur_idx == idx {
                let next = self.slots[idx].hash_next;
                match prev {
                    Some(p) => self.slots[p].hash_next = next,
                    None => self.buckets[bucket] = next,
                }
                self.slots[idx].hash_next = None;
                return;
            }
            prev = Some(cur_idx);
            cur = self.slots[cur_idx].hash_next;
        }
    }

    /// Finds a slot to hold a newly loaded buffer: an unused slot if one
    /// exists, otherwise the least-recently-used *unpinned* (`refcnt == 0`)
    /// resident slot, which is written back first if dirty. A fully pinned
    /// cache (every resident slot checked out) fails with `DeviceError`
    /// rather than evicting something still in use.
    fn evict_one(&mut self) -> KernelResult<usize> {
        if let Some(idx) = self.slots.iter().position(|s| !s.valid) {
            return Ok(idx);
        }

        let slots = &self.slots;
        let idx = self
            .lru
            .pop_lru_matching(|i| slots[i].refcnt == 0)
            .ok_or(KernelError::DeviceError)?;

        let dev = self.slots[idx].dev;
        let block_no = self.slots[idx].block_no;
        if self.slots[idx].dirty {
            let data = self.slots[idx].data;
            dev.write_block(block_no, &data)?;
        }
        self.stats.evictions += 1;
        self.hash_remove(dev, block_no, idx);
        self.slots[idx] = Slot::empty();
        Ok(idx)
    }

    fn load(&mut self, dev: BlockDevice, block_no: u64) -> KernelResult<usize> {
        if let Some(idx) = self.find_slot(dev, block_no) {
            self.stats.hits += 1;
            self.lru.touch(idx);
            return Ok(idx);
        }
        self.stats.misses += 1;

        let idx = self.evict_one()?;
        let mut data = [0u8; BLOCK_SIZE];
        dev.read_block(block_no, &mut data)?;

        let slot = &mut self.slots[idx];
        slot.valid = true;
        slot.dirty = false;
        slot.refcnt = 0;
        slot.dev = dev;
        slot.block_no = block_no;
        slot.data = data;

        self.hash_insert(dev, block_no, idx);
        self.lru.touch(idx);
        Ok(idx)
    }

    /// Checks out the buffer for `(dev, block_no)`, loading it from the
    /// device on a miss. Bumps the slot's `refcnt`; the returned `Buffer`
    /// must be released with `put` once the caller is done with it.
    pub fn get(&mut self, dev: BlockDevice, block_no: u64) -> KernelResult<Buffer> {
        let idx = self.load(dev, block_no)?;
        self.slots[idx].refcnt += 1;
        Ok(Buffer { idx })
    }

    /// Releases a pin taken by `get`. Once `refcnt` reaches zero the slot is
    /// eligible for eviction again.
    pub fn put(&mut self, buf: Buffer) {
        let slot = &mut self.slots[buf.idx];
        if slot.refcnt > 0 {
            slot.refcnt -= 1;
        }
    }

    pub fn data(&self, buf: &Buffer) -> &[u8; BLOCK_SIZE] {
        &self.slots[buf.idx].data
    }

    pub fn data_mut(&mut self, buf: &Buffer) -> &mut [u8; BLOCK_SIZE] {
        &mut self.slots[buf.idx].data
    }

    /// Flags the buffer dirty so it reaches the device on the next
    /// eviction, `sync_dev`, or `sync_all`. A no-op on an already-dirty
    /// buffer; the dirty counter only bumps on the clean-to-dirty edge.
    pub fn mark_dirty(&mut self, buf: &Buffer) {
        let slot = &mut self.slots[buf.idx];
        if slot.valid && !slot.dirty {
            slot.dirty = true;
            self.stats.dirty_marks += 1;
        }
    }

    /// Writes back every dirty resident buffer belonging to `dev` without
    /// evicting it, then issues a device-level flush. Buffers belonging to
    /// other devices are untouched. Calling this twice in a row with no
    /// writes in between performs zero writebacks the second time.
    pub fn sync_dev(&mut self, dev: BlockDevice) -> KernelResult<()> {
        for idx in 0..CACHE_SLOTS {
            let slot = &self.slots[idx];
            if slot.valid && slot.dirty && slot.dev == dev {
                let block_no = slot.block_no;
                let data = slot.data;
                dev.write_block(block_no, &data)?;
                self.slots[idx].dirty = false;
            }
        }
        dev.flush()
    }

    /// Writes back every dirty resident buffer across every device, without
    /// evicting any of them and without issuing a device flush (unlike
    /// `sync_dev`, which flushes the one device it targets).
    pub fn sync_all(&mut self) -> KernelResult<()> {
        for idx in 0..CACHE_SLOTS {
            let slot = &self.slots[idx];
            if slot.valid && slot.dirty {
                let dev = slot.dev;
                let block_no = slot.block_no;
                let data = slot.data;
                dev.write_block(block_no, &data)?;
                self.slots[idx].dirty = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod cache_tests {
    use super::*;

    #[test_case]
    fn lru_touch_reorders_to_front() {
        let mut lru: LruList<4> = LruList::new();
        lru.touch(0);
        lru.touch(1);
        lru.touch(2);
        // order is now 2,1,0 (head..tail)
        lru.touch(0);
        // touching the tail moves it to the front: 0,2,1
        assert_eq!(lru.pop_lru_matching(|_| true), Some(1));
        assert_eq!(lru.pop_lru_matching(|_| true), Some(2));
        assert_eq!(lru.pop_lru_matching(|_| true), Some(0));
        assert_eq!(lru.pop_lru_matching(|_| true), None);
    }

    #[test_case]
    fn lru_remove_drops_a_slot_without_evicting_it() {
        let mut lru: LruList<4> = LruList::new();
        lru.touch(0);
        lru.touch(1);
        lru.touch(2);
        lru.remove(1);
        assert_eq!(lru.pop_lru_matching(|_| true), Some(0));
        assert_eq!(lru.pop_lru_matching(|_| true), Some(2));
        assert_eq!(lru.pop_lru_matching(|_| true), None);
    }

    #[test_case]
    fn pop_lru_matching_skips_pinned_entries_without_reordering_them() {
        let mut lru: LruList<4> = LruList::new();
        lru.touch(0);
        lru.touch(1);
        lru.touch(2);
        // order is now 2,1,0 (head..tail); pretend 0 is pinned (refcnt>0)
        let pinned = [0usize];
        assert_eq!(lru.pop_lru_matching(|i| !pinned.contains(&i)), Some(1));
        assert_eq!(lru.pop_lru_matching(|i| !pinned.contains(&i)), Some(2));
        assert_eq!(lru.pop_lru_matching(|i| !pinned.contains(&i)), None);
        assert_eq!(lru.pop_lru_matching(|_| true), Some(0));
    }

    #[test_case]
    fn hash_block_distributes_sequential_numbers() {
        let dev = BlockDevice::whole_disk();
        let h0 = hash_key(dev, 0);
        let h1 = hash_key(dev, 1);
        assert_ne!(h0, h1);
        assert_eq!(hash_key(dev, HASH_BUCKETS as u64), h0);
    }

    #[test_case]
    fn hash_key_distinguishes_same_block_no_on_different_devices() {
        let whole = BlockDevice::whole_disk();
        let part = BlockDevice::partition(2048, 1024);
        assert_ne!(whole.dev_tag(), part.dev_tag());
    }
}
