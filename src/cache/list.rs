//! The pair index: a power-of-two open hash table keyed by
//! `(file, block)`, one intrusive circular clock list threading every pair
//! (walked by the evictor and the cleaner through two independent
//! cursors), and one singly-linked pending list for checkpoint.
//!
//! Pairs live in an arena of slots addressed by stable `PairId` handles;
//! all linkage is stored in the slots as ids rather than pointers.
//! Structure (buckets, arena, clock links) is mutated only under the write
//! list lock. The cursors and pending links are atomics: the single
//! evictor, cleaner and checkpoint drainers advance them under the read
//! list lock, which the rwlock keeps exclusive from structural writers.

use crate::cache::callbacks::CacheClient;
use crate::cache::file::CacheFile;
use crate::cache::pair::{BlockNum, INVALID_ID, Pair, PairId};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

const INITIAL_TABLE_SIZE: u32 = 4;

struct Slot<C: CacheClient> {
    pair: Option<Arc<Pair<C>>>,
    hash_chain: PairId,
    clock_next: PairId,
    clock_prev: PairId,
    pending_next: AtomicU32,
    pending_prev: AtomicU32,
    next_free: PairId,
}

impl<C: CacheClient> Slot<C> {
    #[inline]
    fn vacant() -> Self {
        Slot {
            pair: None,
            hash_chain: INVALID_ID,
            clock_next: INVALID_ID,
            clock_prev: INVALID_ID,
            pending_next: AtomicU32::new(INVALID_ID),
            pending_prev: AtomicU32::new(INVALID_ID),
            next_free: INVALID_ID,
        }
    }
}

pub(crate) struct Table<C: CacheClient> {
    buckets: Vec<PairId>,
    slots: Vec<Slot<C>>,
    free_head: PairId,
    n_in_table: u32,
    clock_head: AtomicU32,
    cleaner_head: AtomicU32,
    pending_head: AtomicU32,
}

impl<C: CacheClient> Table<C> {
    fn new() -> Self {
        Table {
            buckets: vec![INVALID_ID; INITIAL_TABLE_SIZE as usize],
            slots: Vec::new(),
            free_head: INVALID_ID,
            n_in_table: 0,
            clock_head: AtomicU32::new(INVALID_ID),
            cleaner_head: AtomicU32::new(INVALID_ID),
            pending_head: AtomicU32::new(INVALID_ID),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> u32 {
        self.n_in_table
    }

    #[inline]
    pub(crate) fn table_size(&self) -> u32 {
        self.buckets.len() as u32
    }

    #[inline]
    fn mask(&self) -> u32 {
        self.table_size() - 1
    }

    #[inline]
    fn pair_of(&self, id: PairId) -> &Arc<Pair<C>> {
        self.slots[id as usize]
            .pair
            .as_ref()
            .expect("slot holds no pair")
    }

    /// Looks up a pair by identity. Requires at least the read lock.
    pub(crate) fn find(
        &self,
        file: &Arc<CacheFile<C>>,
        key: BlockNum,
        fullhash: u32,
    ) -> Option<Arc<Pair<C>>> {
        let mut id = self.buckets[(fullhash & self.mask()) as usize];
        while id != INVALID_ID {
            let slot = &self.slots[id as usize];
            let pair = slot.pair.as_ref().expect("hash chain references vacant slot");
            if pair.key == key && Arc::ptr_eq(&pair.file, file) {
                return Some(Arc::clone(pair));
            }
            id = slot.hash_chain;
        }
        None
    }

    /// Inserts a pair absent from the table. Requires the write lock.
    pub(crate) fn put(&mut self, pair: &Arc<Pair<C>>) {
        debug_assert!(self.find(&pair.file, pair.key, pair.fullhash).is_none());
        let id = self.alloc_slot(pair);
        pair.set_id(id);
        self.add_to_clock(id);
        let h = (pair.fullhash & self.mask()) as usize;
        self.slots[id as usize].hash_chain = self.buckets[h];
        self.buckets[h] = id;
        self.n_in_table += 1;
        if self.n_in_table > self.table_size() {
            let new_size = self.table_size() * 2;
            self.rehash(new_size);
        }
    }

    /// Removes a pair from all three structures. Requires the write lock.
    pub(crate) fn evict(&mut self, pair: &Arc<Pair<C>>) {
        let id = pair.id();
        debug_assert!(Arc::ptr_eq(self.pair_of(id), pair));
        self.clock_remove(id);
        self.pending_remove(id);

        assert!(self.n_in_table > 0);
        self.n_in_table -= 1;

        let h = (pair.fullhash & self.mask()) as usize;
        let mut curr = self.buckets[h];
        if curr == id {
            self.buckets[h] = self.slots[id as usize].hash_chain;
        } else {
            while curr != INVALID_ID {
                let next = self.slots[curr as usize].hash_chain;
                if next == id {
                    self.slots[curr as usize].hash_chain = self.slots[id as usize].hash_chain;
                    break;
                }
                curr = next;
            }
            assert!(curr != INVALID_ID, "pair missing from its hash chain");
        }
        self.free_slot(id);

        if 4 * self.n_in_table < self.table_size() && self.table_size() > INITIAL_TABLE_SIZE {
            let new_size = self.table_size() / 2;
            self.rehash(new_size);
        }
    }

    fn rehash(&mut self, new_size: u32) {
        assert!(new_size >= INITIAL_TABLE_SIZE && new_size.is_power_of_two());
        let old = std::mem::replace(&mut self.buckets, vec![INVALID_ID; new_size as usize]);
        let mask = new_size - 1;
        for mut id in old {
            while id != INVALID_ID {
                let next = self.slots[id as usize].hash_chain;
                let h = (self.pair_of(id).fullhash & mask) as usize;
                self.slots[id as usize].hash_chain = self.buckets[h];
                self.buckets[h] = id;
                id = next;
            }
        }
    }

    fn alloc_slot(&mut self, pair: &Arc<Pair<C>>) -> PairId {
        if self.free_head != INVALID_ID {
            let id = self.free_head;
            self.free_head = self.slots[id as usize].next_free;
            let slot = &mut self.slots[id as usize];
            *slot = Slot::vacant();
            slot.pair = Some(Arc::clone(pair));
            id
        } else {
            let id = self.slots.len() as PairId;
            let mut slot = Slot::vacant();
            slot.pair = Some(Arc::clone(pair));
            self.slots.push(slot);
            id
        }
    }

    fn free_slot(&mut self, id: PairId) {
        let slot = &mut self.slots[id as usize];
        slot.pair = None;
        slot.next_free = self.free_head;
        self.free_head = id;
    }

    /// Links a new pair into the clock list at the tail, i.e. just before
    /// `clock_head`.
    fn add_to_clock(&mut self, id: PairId) {
        let head = self.clock_head.load(Ordering::Relaxed);
        if head == INVALID_ID {
            let slot = &mut self.slots[id as usize];
            slot.clock_next = id;
            slot.clock_prev = id;
            self.clock_head.store(id, Ordering::Relaxed);
            self.cleaner_head.store(id, Ordering::Relaxed);
        } else {
            let prev = self.slots[head as usize].clock_prev;
            self.slots[id as usize].clock_next = head;
            self.slots[id as usize].clock_prev = prev;
            self.slots[prev as usize].clock_next = id;
            self.slots[head as usize].clock_prev = id;
        }
    }

    /// Unlinks a pair from the clock list, fixing both cursors if they
    /// point at it.
    fn clock_remove(&mut self, id: PairId) {
        let (next, prev) = {
            let slot = &self.slots[id as usize];
            (slot.clock_next, slot.clock_prev)
        };
        if prev == id {
            // last member of the list
            assert!(self.clock_head.load(Ordering::Relaxed) == id);
            assert!(next == id);
            self.clock_head.store(INVALID_ID, Ordering::Relaxed);
            self.cleaner_head.store(INVALID_ID, Ordering::Relaxed);
        } else {
            if self.clock_head.load(Ordering::Relaxed) == id {
                self.clock_head.store(next, Ordering::Relaxed);
            }
            if self.cleaner_head.load(Ordering::Relaxed) == id {
                self.cleaner_head.store(next, Ordering::Relaxed);
            }
            self.slots[prev as usize].clock_next = next;
            self.slots[next as usize].clock_prev = prev;
        }
    }

    /// Returns the pair under the evictor cursor.
    pub(crate) fn clock_head_pair(&self) -> Option<Arc<Pair<C>>> {
        let head = self.clock_head.load(Ordering::Acquire);
        if head == INVALID_ID {
            return None;
        }
        Some(Arc::clone(self.pair_of(head)))
    }

    /// Advances the evictor cursor past `pair` if the cursor still points
    /// at it. Full eviction moves the cursor by itself, in which case this
    /// is a no-op.
    pub(crate) fn advance_clock_head(&self, pair: &Arc<Pair<C>>) {
        let head = self.clock_head.load(Ordering::Acquire);
        if head == INVALID_ID {
            return;
        }
        let slot = &self.slots[head as usize];
        match &slot.pair {
            Some(p) if Arc::ptr_eq(p, pair) => {
                self.clock_head.store(slot.clock_next, Ordering::Release);
            }
            _ => {}
        }
    }

    /// Returns the pair under the cleaner cursor and advances the cursor.
    pub(crate) fn cleaner_step(&self) -> Option<Arc<Pair<C>>> {
        let head = self.cleaner_head.load(Ordering::Acquire);
        if head == INVALID_ID {
            return None;
        }
        let slot = &self.slots[head as usize];
        let pair = Arc::clone(slot.pair.as_ref().expect("cleaner cursor on vacant slot"));
        self.cleaner_head.store(slot.clock_next, Ordering::Release);
        Some(pair)
    }

    #[inline]
    pub(crate) fn cleaner_head_id(&self) -> PairId {
        self.cleaner_head.load(Ordering::Acquire)
    }

    /// Splices a pair onto the pending list head. Caller holds the read
    /// list lock and the pending-cheap write lock.
    pub(crate) fn pending_push(&self, id: PairId) {
        let head = self.pending_head.load(Ordering::Acquire);
        self.slots[id as usize].pending_next.store(head, Ordering::Release);
        self.slots[id as usize]
            .pending_prev
            .store(INVALID_ID, Ordering::Release);
        if head != INVALID_ID {
            self.slots[head as usize].pending_prev.store(id, Ordering::Release);
        }
        self.pending_head.store(id, Ordering::Release);
    }

    /// Pops the pending head. Only the checkpointer calls this, under the
    /// read list lock; writers that also touch pending links hold the
    /// write list lock and are therefore excluded.
    pub(crate) fn pop_pending(&self) -> Option<Arc<Pair<C>>> {
        let head = self.pending_head.load(Ordering::Acquire);
        if head == INVALID_ID {
            return None;
        }
        let slot = &self.slots[head as usize];
        let pair = Arc::clone(slot.pair.as_ref().expect("pending list references vacant slot"));
        let next = slot.pending_next.load(Ordering::Acquire);
        self.pending_head.store(next, Ordering::Release);
        if next != INVALID_ID {
            self.slots[next as usize]
                .pending_prev
                .store(INVALID_ID, Ordering::Release);
        }
        slot.pending_next.store(INVALID_ID, Ordering::Release);
        slot.pending_prev.store(INVALID_ID, Ordering::Release);
        Some(pair)
    }

    /// Unlinks a pair from the pending list if it is on it.
    fn pending_remove(&self, id: PairId) {
        let slot = &self.slots[id as usize];
        let next = slot.pending_next.load(Ordering::Acquire);
        let prev = slot.pending_prev.load(Ordering::Acquire);
        if next != INVALID_ID {
            self.slots[next as usize].pending_prev.store(prev, Ordering::Release);
        }
        if prev != INVALID_ID {
            self.slots[prev as usize].pending_next.store(next, Ordering::Release);
        } else if self.pending_head.load(Ordering::Acquire) == id {
            self.pending_head.store(next, Ordering::Release);
        }
        slot.pending_next.store(INVALID_ID, Ordering::Release);
        slot.pending_prev.store(INVALID_ID, Ordering::Release);
    }

    #[inline]
    pub(crate) fn pending_is_empty(&self) -> bool {
        self.pending_head.load(Ordering::Acquire) == INVALID_ID
    }

    /// Iterates every pair in the table in bucket order.
    pub(crate) fn for_each(&self, mut f: impl FnMut(PairId, &Arc<Pair<C>>)) {
        for &head in &self.buckets {
            let mut id = head;
            while id != INVALID_ID {
                let slot = &self.slots[id as usize];
                f(id, slot.pair.as_ref().expect("hash chain references vacant slot"));
                id = slot.hash_chain;
            }
        }
    }

    /// Checks that the hash chains and the clock list agree on membership.
    /// Requires the write lock.
    pub(crate) fn verify(&self) {
        let mut num_found = 0u32;
        for &head in &self.buckets {
            let mut id = head;
            while id != INVALID_ID {
                num_found += 1;
                id = self.slots[id as usize].hash_chain;
            }
        }
        assert_eq!(num_found, self.n_in_table);

        let mut num_in_clock = 0u32;
        let head = self.clock_head.load(Ordering::Relaxed);
        if head != INVALID_ID {
            let mut id = head;
            loop {
                let pair = self.pair_of(id);
                assert!(
                    self.find(&pair.file, pair.key, pair.fullhash).is_some(),
                    "clock member is not hashed"
                );
                num_in_clock += 1;
                id = self.slots[id as usize].clock_next;
                if id == head {
                    break;
                }
            }
        }
        assert_eq!(num_in_clock, self.n_in_table);
    }
}

/// The index of pairs plus its three locks.
///
/// `pending_expensive` and `pending_cheap` separate cheap pending-bit flips
/// from the expensive mark-and-enqueue section of begin-checkpoint: any
/// thread clearing a pair's pending bit holds the pair mutex and
/// `pending_cheap` in read mode, while the checkpointer sets bits under the
/// `pending_cheap` write lock.
pub(crate) struct PairList<C: CacheClient> {
    pub(crate) list: RwLock<Table<C>>,
    pub(crate) pending_expensive: RwLock<()>,
    pub(crate) pending_cheap: RwLock<()>,
}

impl<C: CacheClient> PairList<C> {
    pub(crate) fn new() -> Self {
        PairList {
            list: RwLock::new(Table::new()),
            pending_expensive: RwLock::new(()),
            pending_cheap: RwLock::new(()),
        }
    }
}
