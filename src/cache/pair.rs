use crate::cache::attr::{Dirty, PairAttr};
use crate::cache::callbacks::{CacheClient, PairCallbacks};
use crate::cache::file::CacheFile;
use crate::latch::NbMutex;
use parking_lot::{Mutex, MutexGuard};
use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// 64-bit block number identifying a page within its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockNum(pub u64);

/// Clock counter saturation point.
pub(crate) const CLOCK_SATURATION: u8 = 15;
/// Clock counter assigned to pairs inserted via `put`.
pub(crate) const CLOCK_INITIAL_COUNT: u8 = 3;

/// Arena handle of a pair inside the pair list.
pub(crate) type PairId = u32;
pub(crate) const INVALID_ID: PairId = u32::MAX;

/// Mutable pair fields protected by the pair's own short-held mutex.
pub(crate) struct PairState {
    pub(crate) dirty: Dirty,
    pub(crate) attr: PairAttr,
    /// 4-bit-saturating clock counter. Zero is reserved as "never pick me"
    /// for the cleaner.
    pub(crate) count: u8,
    pub(crate) size_evicting_estimate: i64,
}

/// Opaque payloads, guarded by the value and disk exclusion locks rather
/// than the pair mutex.
pub(crate) struct PairData<C: CacheClient> {
    pub(crate) value: Option<C::Value>,
    pub(crate) disk: Option<C::Disk>,
    pub(crate) cloned_value: Option<C::Value>,
    pub(crate) cloned_value_size: i64,
}

/// A single cached page record.
///
/// Identity is `(cachefile, key)`; `fullhash` buckets it. The two
/// non-blocking locks cooperate with `state`: `value_lock` is "who
/// currently owns the page value", `disk_lock` serializes I/O on the page
/// and guards the clone slot. A pair may be pinned concurrently with a
/// disk-side operation only while a clone is being written out.
pub struct Pair<C: CacheClient> {
    pub(crate) file: Arc<CacheFile<C>>,
    pub(crate) key: BlockNum,
    pub(crate) fullhash: u32,
    pub(crate) callbacks: Arc<dyn PairCallbacks<C>>,
    /// Slot handle inside the pair list, assigned at insert.
    pub(crate) id: AtomicU32,
    /// Set only under the pending-cheap write lock; cleared only under the
    /// pair mutex plus the pending-cheap read lock.
    pub(crate) checkpoint_pending: AtomicBool,
    pub(crate) state: Mutex<PairState>,
    pub(crate) value_lock: NbMutex,
    pub(crate) disk_lock: NbMutex,
    data: UnsafeCell<PairData<C>>,
}

// The UnsafeCell payload is only reached while the corresponding exclusion
// lock is held, so the pair as a whole is safe to share.
unsafe impl<C: CacheClient> Send for Pair<C> {}
unsafe impl<C: CacheClient> Sync for Pair<C> {}

impl<C: CacheClient> Pair<C> {
    pub(crate) fn new(
        file: Arc<CacheFile<C>>,
        key: BlockNum,
        fullhash: u32,
        value: Option<C::Value>,
        attr: PairAttr,
        dirty: Dirty,
        callbacks: Arc<dyn PairCallbacks<C>>,
    ) -> Arc<Pair<C>> {
        Arc::new(Pair {
            file,
            key,
            fullhash,
            callbacks,
            id: AtomicU32::new(INVALID_ID),
            checkpoint_pending: AtomicBool::new(false),
            state: Mutex::new(PairState {
                dirty,
                attr,
                count: 0,
                size_evicting_estimate: 0,
            }),
            value_lock: NbMutex::new(),
            disk_lock: NbMutex::new(),
            data: UnsafeCell::new(PairData {
                value,
                disk: None,
                cloned_value: None,
                cloned_value_size: 0,
            }),
        })
    }

    #[inline]
    pub fn key(&self) -> BlockNum {
        self.key
    }

    #[inline]
    pub fn fullhash(&self) -> u32 {
        self.fullhash
    }

    #[inline]
    pub fn file(&self) -> &Arc<CacheFile<C>> {
        &self.file
    }

    #[inline]
    pub(crate) fn id(&self) -> PairId {
        self.id.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_id(&self, id: PairId) {
        self.id.store(id, Ordering::Release);
    }

    /// Access to the opaque payloads.
    ///
    /// SAFETY: the caller must hold the exclusion lock covering the fields
    /// it touches: `value_lock` for `value`, `disk_lock` for `disk`,
    /// `cloned_value` and `cloned_value_size`.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub(crate) unsafe fn data_mut(&self) -> &mut PairData<C> {
        unsafe { &mut *self.data.get() }
    }

    /// Saturating clock-counter bump applied on every successful pin.
    #[inline]
    pub(crate) fn touch(st: &mut MutexGuard<'_, PairState>) {
        if st.count < CLOCK_SATURATION {
            st.count += 1;
        }
    }
}

/// An exclusively pinned pair.
///
/// The holder owns the pair's value lock and may read and mutate the page
/// value. Release it through `CacheTable::unpin` (reporting dirtiness and
/// the new attribute) or `unpin_and_remove`; dropping the pin releases the
/// lock without updating either.
pub struct PairPin<C: CacheClient> {
    pub(crate) pair: Arc<Pair<C>>,
}

impl<C: CacheClient> PairPin<C> {
    #[inline]
    pub(crate) fn new(pair: Arc<Pair<C>>) -> Self {
        debug_assert!(pair.value_lock.writers() > 0);
        PairPin { pair }
    }

    /// Consumes the pin without releasing the value lock. The caller takes
    /// over responsibility for unlocking.
    #[inline]
    pub(crate) fn into_pair(self) -> Arc<Pair<C>> {
        let pair = Arc::clone(&self.pair);
        std::mem::forget(self);
        pair
    }

    #[inline]
    pub fn key(&self) -> BlockNum {
        self.pair.key
    }

    #[inline]
    pub fn fullhash(&self) -> u32 {
        self.pair.fullhash
    }

    #[inline]
    pub fn file(&self) -> &Arc<CacheFile<C>> {
        &self.pair.file
    }

    #[inline]
    pub fn attr(&self) -> PairAttr {
        self.pair.state.lock().attr
    }

    #[inline]
    pub fn value(&self) -> &C::Value {
        // SAFETY: the pin holds the value lock exclusively.
        unsafe { self.pair.data_mut().value.as_ref().expect("pinned pair has no value") }
    }

    #[inline]
    pub fn value_mut(&mut self) -> &mut C::Value {
        // SAFETY: the pin holds the value lock exclusively.
        unsafe { self.pair.data_mut().value.as_mut().expect("pinned pair has no value") }
    }
}

impl<C: CacheClient> Drop for PairPin<C> {
    #[inline]
    fn drop(&mut self) {
        let mut st = self.pair.state.lock();
        self.pair.value_lock.unlock(&mut st);
    }
}
