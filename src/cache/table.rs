//! The cachetable: public pin/unpin operations, cachefile lifecycle and
//! the glue between the pair index, the evictor, the cleaner and the
//! checkpointer.

use crate::cache::attr::{Dirty, PairAttr};
use crate::cache::callbacks::{
    CacheClient, CheckpointLogger, FetchCallbacks, FetchedValue, FlushArgs, FlushValue, Lsn,
    PairCallbacks,
};
use crate::cache::checkpointer::Checkpointer;
use crate::cache::cleaner::Cleaner;
use crate::cache::evictor::Evictor;
use crate::cache::file::{CacheFile, CacheFileList, FileNum, construct_full_name, file_id_of};
use crate::cache::list::{PairList, Table};
use crate::cache::pair::{
    BlockNum, CLOCK_INITIAL_COUNT, Pair, PairData, PairPin, PairState,
};
use crate::error::{Error, Result};
use crate::hash;
use crate::jobs::{BackgroundJobManager, WorkerPool};
use parking_lot::{MutexGuard, RwLockReadGuard};
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// An already-pinned pair the caller declares as a dependency of the pin
/// in progress. Its pending bit is collected and resolved in the same
/// critical section as the primary pair's.
pub struct DepPair<'a, C: CacheClient> {
    pub pin: &'a PairPin<C>,
    pub dirty: Dirty,
}

/// Caller-provided chain of release functions for the non-blocking pin.
///
/// When the required pair is not immediately obtainable, the core invokes
/// the chain in order (while holding the list lock) so the caller's
/// root-to-leaf pins are released before the core blocks or retries.
/// Clients must be prepared for spurious invocations.
pub struct UnlockerChain<'a> {
    entries: Vec<Box<dyn FnMut() + 'a>>,
    ran: bool,
}

impl<'a> UnlockerChain<'a> {
    #[inline]
    pub fn new() -> Self {
        UnlockerChain {
            entries: Vec::new(),
            ran: false,
        }
    }

    #[inline]
    pub fn push(&mut self, f: impl FnMut() + 'a) {
        self.entries.push(Box::new(f));
    }

    /// Whether the chain was invoked.
    #[inline]
    pub fn ran(&self) -> bool {
        self.ran
    }

    pub(crate) fn run(&mut self) {
        if self.ran {
            return;
        }
        self.ran = true;
        for f in &mut self.entries {
            f();
        }
    }
}

impl Default for UnlockerChain<'_> {
    #[inline]
    fn default() -> Self {
        UnlockerChain::new()
    }
}

#[derive(Default)]
pub(crate) struct StatsInner {
    misses: AtomicU64,
    miss_time_us: AtomicU64,
    puts: AtomicU64,
    prefetches: AtomicU64,
    evictions: AtomicU64,
    pub(crate) cleaner_executions: AtomicU64,
}

/// Point-in-time snapshot of the per-instance status counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheTableStats {
    pub misses: u64,
    /// Time spent waiting for disk reads.
    pub miss_time: Duration,
    pub puts: u64,
    pub prefetches: u64,
    pub evictions: u64,
    pub cleaner_executions: u64,
}

/// The page cache. Holds in-memory representations of page-sized objects
/// keyed by `(file, block-number)`, enforces per-pair reader/writer
/// exclusion and coordinates client access, background eviction, periodic
/// checkpointing and the background cleaner.
pub struct CacheTable<C: CacheClient> {
    pub(crate) list: PairList<C>,
    pub(crate) cf_list: CacheFileList<C>,
    pub(crate) ev: Evictor,
    pub(crate) cp: Checkpointer,
    pub(crate) cl: Cleaner,
    /// Pool for client-submitted background work.
    pub(crate) client_pool: WorkerPool,
    /// Pool for the cachetable's own writers and readers.
    pub(crate) ct_pool: WorkerPool,
    /// Pool dedicated to checkpoint clone write-back.
    pub(crate) checkpoint_pool: WorkerPool,
    pub(crate) logger: Option<Arc<dyn CheckpointLogger>>,
    pub(crate) env_dir: PathBuf,
    pub(crate) stats: StatsInner,
    self_ref: Weak<CacheTable<C>>,
}

impl<C: CacheClient> CacheTable<C> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_cyclic(
        size_limit: i64,
        eviction_period: Duration,
        env_dir: PathBuf,
        logger: Option<Arc<dyn CheckpointLogger>>,
        client_workers: usize,
        ct_workers: usize,
        checkpoint_workers: usize,
        cleaner_iterations: u32,
    ) -> Arc<CacheTable<C>> {
        Arc::new_cyclic(|weak| CacheTable {
            list: PairList::new(),
            cf_list: CacheFileList::new(),
            ev: Evictor::new(size_limit, eviction_period),
            cp: Checkpointer::new(),
            cl: Cleaner::new(cleaner_iterations),
            client_pool: WorkerPool::new("CacheClientWorker", client_workers),
            ct_pool: WorkerPool::new("CacheTableWorker", ct_workers),
            checkpoint_pool: WorkerPool::new("CheckpointCloneWorker", checkpoint_workers),
            logger,
            env_dir,
            stats: StatsInner::default(),
            self_ref: weak.clone(),
        })
    }

    #[inline]
    pub(crate) fn self_ref(&self) -> Weak<CacheTable<C>> {
        self.self_ref.clone()
    }

    /// Full hash of `(file, key)`, suitable for bitmasking against a
    /// power-of-two bucket count.
    #[inline]
    pub fn hash(file: &Arc<CacheFile<C>>, key: BlockNum) -> u32 {
        hash::fullhash(file.filenum().0, key.0)
    }

    // ==================================================================
    // cachefile lifecycle

    fn full_path_of(&self, fname_in_env: &str) -> PathBuf {
        construct_full_name([self.env_dir.as_path(), fname_in_env.as_ref()])
    }

    /// Opens (creating if absent) the file at `env_dir/fname_in_env`.
    pub fn open_file(&self, fname_in_env: &str) -> Result<Arc<CacheFile<C>>> {
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.full_path_of(fname_in_env))?;
        self.open_fd(fd, fname_in_env)
    }

    pub fn open_fd(&self, fd: File, fname_in_env: &str) -> Result<Arc<CacheFile<C>>> {
        let filenum = self.cf_list.reserve_filenum();
        self.open_fd_with_filenum(fd, fname_in_env, filenum)
    }

    /// Registers an open descriptor, normalizing by OS file identity: a
    /// second open of the same file returns the extant handle and drops
    /// the new descriptor.
    pub fn open_fd_with_filenum(
        &self,
        fd: File,
        fname_in_env: &str,
        filenum: FileNum,
    ) -> Result<Arc<CacheFile<C>>> {
        let fileid = file_id_of(&fd)?;
        self.cf_list.insert_or_reuse(
            move || Arc::new(CacheFile::new(fd, fileid, filenum, fname_in_env)),
            fileid,
            filenum,
        )
    }

    #[inline]
    pub fn reserve_filenum(&self) -> FileNum {
        self.cf_list.reserve_filenum()
    }

    #[inline]
    pub fn file_of_filenum(&self, filenum: FileNum) -> Result<Arc<CacheFile<C>>> {
        self.cf_list.find_by_filenum(filenum)
    }

    #[inline]
    pub fn file_of_iname(&self, iname_in_env: &str) -> Result<Arc<CacheFile<C>>> {
        self.cf_list.find_by_iname(iname_in_env)
    }

    /// Writes out and discards every pair of the file, then closes it.
    /// Waits for all background jobs on the file first. Returns the close
    /// callback's error if it reported one.
    pub fn close_file(&self, cf: Arc<CacheFile<C>>) -> Result<()> {
        cf.bjm.wait_for_jobs();
        // Clients are notified through note_pin_by_checkpoint that the
        // file participates in a checkpoint; closing it then is a bug.
        assert!(!cf.is_for_checkpoint());
        self.flush_cachefile(Some(&cf));
        let close_error = match cf.userdata() {
            Some(ud) => ud.close(&cf).err(),
            None => None,
        };
        self.cf_list.remove(&cf);
        cf.fsync()?;
        if cf.is_unlink_on_close() {
            std::fs::remove_file(self.full_path_of(cf.fname_in_env()))?;
        }
        match close_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Writes out and discards every pair of the file without closing it.
    pub fn flush_file(&self, cf: &Arc<CacheFile<C>>) {
        cf.bjm.wait_for_jobs();
        self.flush_cachefile(Some(cf));
    }

    /// Runs a client job on the client pool, holding a background job on
    /// the file so it cannot close underneath the work.
    pub fn run_background_job(
        &self,
        cf: &Arc<CacheFile<C>>,
        job: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        cf.bjm.add_background_job()?;
        let cf = Arc::clone(cf);
        self.client_pool.execute(move || {
            job();
            cf.bjm.remove_background_job();
        })
    }

    // ==================================================================
    // put

    /// Inserts a freshly created page. The new pair starts dirty with a
    /// saturated-enough clock count and is returned pinned.
    pub fn put(
        &self,
        file: &Arc<CacheFile<C>>,
        key: BlockNum,
        fullhash: u32,
        value: C::Value,
        attr: PairAttr,
        callbacks: &Arc<dyn PairCallbacks<C>>,
    ) -> Result<PairPin<C>> {
        if self.ev.should_client_thread_sleep() {
            self.ev.wait_for_cache_pressure_to_subside();
        }
        if self.ev.should_client_wake_eviction_thread() {
            self.ev.signal_eviction_thread();
        }
        let mut w = self.list.list.write();
        if let Some(extant) = w.find(file, key, fullhash) {
            // In practice a duplicate put must carry the same callbacks.
            assert!(std::ptr::addr_eq(
                Arc::as_ptr(&extant.callbacks),
                Arc::as_ptr(callbacks)
            ));
            return Err(Error::AlreadyPresent);
        }
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        let p = self.insert_pair(
            &mut w,
            file,
            key,
            fullhash,
            Some(value),
            attr,
            Dirty::Dirty,
            callbacks,
            CLOCK_INITIAL_COUNT,
        );
        let mut st = p.state.lock();
        p.value_lock.lock(&mut st);
        drop(st);
        drop(w);
        Ok(PairPin::new(p))
    }

    /// `put` for a key allocated under the list write lock, so the block
    /// allocation cannot straddle a begin-checkpoint. The dependent
    /// pairs' pending bits are resolved before the insert becomes
    /// visible to a checkpoint.
    pub fn put_with_dep_pairs(
        &self,
        file: &Arc<CacheFile<C>>,
        get_key_and_fullhash: impl FnOnce() -> (BlockNum, u32),
        value: C::Value,
        attr: PairAttr,
        callbacks: &Arc<dyn PairCallbacks<C>>,
        deps: &[DepPair<'_, C>],
    ) -> Result<(PairPin<C>, BlockNum)> {
        if self.ev.should_client_thread_sleep() {
            self.ev.wait_for_cache_pressure_to_subside();
        }
        if self.ev.should_client_wake_eviction_thread() {
            self.ev.signal_eviction_thread();
        }
        let mut w = self.list.list.write();
        let (key, fullhash) = get_key_and_fullhash();
        if w.find(file, key, fullhash).is_some() {
            return Err(Error::AlreadyPresent);
        }
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        let p = self.insert_pair(
            &mut w,
            file,
            key,
            fullhash,
            Some(value),
            attr,
            Dirty::Dirty,
            callbacks,
            CLOCK_INITIAL_COUNT,
        );
        let mut st = p.state.lock();
        p.value_lock.lock(&mut st);
        drop(st);
        let dep_pending = {
            let _cheap = self.list.pending_cheap.read();
            debug_assert!(!p.checkpoint_pending.load(Ordering::Acquire));
            self.collect_dep_pending(deps)
        };
        drop(w);
        self.checkpoint_dependent_pairs(deps, &dep_pending);
        Ok((PairPin::new(p), key))
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_pair(
        &self,
        w: &mut Table<C>,
        file: &Arc<CacheFile<C>>,
        key: BlockNum,
        fullhash: u32,
        value: Option<C::Value>,
        attr: PairAttr,
        dirty: Dirty,
        callbacks: &Arc<dyn PairCallbacks<C>>,
        count: u8,
    ) -> Arc<Pair<C>> {
        let p = Pair::new(
            Arc::clone(file),
            key,
            fullhash,
            value,
            attr,
            dirty,
            Arc::clone(callbacks),
        );
        p.state.lock().count = count;
        w.put(&p);
        self.ev.add_pair_attr(attr);
        p
    }

    // ==================================================================
    // get_and_pin

    pub fn get_and_pin(
        &self,
        file: &Arc<CacheFile<C>>,
        key: BlockNum,
        fullhash: u32,
        write_callbacks: &Arc<dyn PairCallbacks<C>>,
        fetch_callbacks: &Arc<dyn FetchCallbacks<C>>,
        may_modify_value: bool,
    ) -> Result<PairPin<C>> {
        self.get_and_pin_with_dep_pairs(
            file,
            key,
            fullhash,
            write_callbacks,
            fetch_callbacks,
            may_modify_value,
            &[],
        )
    }

    /// Finds and pins a pair, fetching it on a miss. When
    /// `may_modify_value` is set, a pending checkpoint of this pair and
    /// of every declared dependent pair is resolved before the pin is
    /// returned, so the checkpoint sees the pre-modification value.
    pub fn get_and_pin_with_dep_pairs(
        &self,
        file: &Arc<CacheFile<C>>,
        key: BlockNum,
        fullhash: u32,
        write_callbacks: &Arc<dyn PairCallbacks<C>>,
        fetch_callbacks: &Arc<dyn FetchCallbacks<C>>,
        may_modify_value: bool,
        deps: &[DepPair<'_, C>],
    ) -> Result<PairPin<C>> {
        for d in deps {
            assert!(d.pin.pair.value_lock.writers() > 0);
        }
        let mut wait = false;
        loop {
            // Adding data under pressure first waits for the evictor to
            // bring memory back down, then retries from the top.
            if wait {
                self.ev.wait_for_cache_pressure_to_subside();
                wait = false;
            }

            let hit = {
                let list = self.list.list.read();
                match list.find(file, key, fullhash) {
                    Some(p) => {
                        let st = p.state.lock();
                        Some(self.try_pin_pair(
                            Some(list),
                            &p,
                            st,
                            file,
                            fetch_callbacks.as_ref(),
                            may_modify_value,
                            deps,
                        )?)
                    }
                    None => None,
                }
            };
            match hit {
                Some(Some(pin)) => return Ok(pin),
                Some(None) => {
                    wait = true;
                    continue;
                }
                None => {}
            }

            if self.ev.should_client_thread_sleep() {
                wait = true;
                continue;
            }
            if self.ev.should_client_wake_eviction_thread() {
                self.ev.signal_eviction_thread();
            }

            let mut w = self.list.list.write();
            if let Some(p) = w.find(file, key, fullhash) {
                // Another thread inserted the pair in the window between
                // our read and write lock acquisitions.
                let st = p.state.lock();
                drop(w);
                match self.try_pin_pair(
                    None,
                    &p,
                    st,
                    file,
                    fetch_callbacks.as_ref(),
                    may_modify_value,
                    deps,
                )? {
                    Some(pin) => return Ok(pin),
                    None => {
                        wait = true;
                        continue;
                    }
                }
            }

            // Genuine miss: insert a blank clean pair, pinned, and fetch.
            let p = self.insert_pair(
                &mut w,
                file,
                key,
                fullhash,
                None,
                PairAttr::zero(),
                Dirty::Clean,
                write_callbacks,
                0,
            );
            let mut st = p.state.lock();
            p.value_lock.lock(&mut st);
            drop(st);
            let dep_pending = if may_modify_value {
                let _cheap = self.list.pending_cheap.read();
                debug_assert!(!p.checkpoint_pending.load(Ordering::Acquire));
                self.collect_dep_pending(deps)
            } else {
                Vec::new()
            };
            drop(w);
            if may_modify_value {
                self.checkpoint_dependent_pairs(deps, &dep_pending);
            }

            let t0 = Instant::now();
            // A checkpoint beginning during the fetch marks the locked
            // pair pending even though it is clean; that is resolved on a
            // later pin.
            self.fetch_pair(file, &p, fetch_callbacks.as_ref(), true)?;
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            self.stats
                .miss_time_us
                .fetch_add(t0.elapsed().as_micros() as u64, Ordering::Relaxed);
            return Ok(PairPin::new(p));
        }
    }

    /// Pins a present pair. Returns `None` if a retry (after waiting for
    /// cache pressure) is required.
    fn try_pin_pair<'a>(
        &self,
        list: Option<RwLockReadGuard<'_, Table<C>>>,
        p: &'a Arc<Pair<C>>,
        mut st: MutexGuard<'a, PairState>,
        file: &Arc<CacheFile<C>>,
        fetch_callbacks: &dyn FetchCallbacks<C>,
        may_modify_value: bool,
        deps: &[DepPair<'_, C>],
    ) -> Result<Option<PairPin<C>>> {
        // The pair mutex is held from lookup until we are registered as a
        // waiter, which keeps the evictor off the pair; the list lock is
        // not needed for that and is released before a possibly long wait.
        drop(list);
        p.value_lock.lock(&mut st);
        Pair::<C>::touch(&mut st);
        drop(st);

        if may_modify_value {
            let (self_pending, dep_pending) = {
                let _cheap = self.list.pending_cheap.read();
                let self_pending = p.checkpoint_pending.swap(false, Ordering::AcqRel);
                (self_pending, self.collect_dep_pending(deps))
            };
            // With all the relevant value locks held, a checkpoint cannot
            // complete until each collected bit is resolved here.
            self.write_pair_for_checkpoint(p, self_pending);
            self.checkpoint_dependent_pairs(deps, &dep_pending);
        }

        // SAFETY: value lock held.
        let value = unsafe {
            (*p).data_mut()
                .value
                .as_ref()
                .expect("cached pair has no value")
        };
        if !fetch_callbacks.partial_fetch_required(value) {
            return Ok(Some(PairPin::new(Arc::clone(p))));
        }
        if self.ev.should_client_thread_sleep() {
            let mut st = p.state.lock();
            p.value_lock.unlock(&mut st);
            return Ok(None);
        }
        if self.ev.should_client_wake_eviction_thread() {
            self.ev.signal_eviction_thread();
        }
        // Only clean pairs may have pieces missing.
        debug_assert!(p.state.lock().dirty == Dirty::Clean);
        self.do_partial_fetch(file, p, fetch_callbacks, true)?;
        Ok(Some(PairPin::new(Arc::clone(p))))
    }

    /// Non-blocking pin used by traversal code holding a root-to-leaf
    /// chain of pins. If the pair cannot be obtained without waiting for
    /// I/O or a slow checkpoint write, the unlocker chain is invoked (so
    /// the caller's pins release) and `Error::TryAgain` is returned; the
    /// caller restarts its search from the root.
    ///
    /// The caller must not already hold a value lock this call could
    /// need.
    pub fn get_and_pin_nonblocking(
        &self,
        file: &Arc<CacheFile<C>>,
        key: BlockNum,
        fullhash: u32,
        write_callbacks: &Arc<dyn PairCallbacks<C>>,
        fetch_callbacks: &Arc<dyn FetchCallbacks<C>>,
        may_modify_value: bool,
        unlockers: &mut UnlockerChain<'_>,
    ) -> Result<PairPin<C>> {
        loop {
            let list = self.list.list.read();
            let found = list.find(file, key, fullhash);
            let p = match found {
                None => {
                    drop(list);
                    let mut w = self.list.list.write();
                    if w.find(file, key, fullhash).is_some() {
                        // Another thread snuck the pair in while we
                        // traded locks; restart from the top.
                        drop(w);
                        continue;
                    }
                    let p = self.insert_pair(
                        &mut w,
                        file,
                        key,
                        fullhash,
                        None,
                        PairAttr::zero(),
                        Dirty::Clean,
                        write_callbacks,
                        0,
                    );
                    let mut st = p.state.lock();
                    p.value_lock.lock(&mut st);
                    drop(st);
                    unlockers.run();
                    drop(w);

                    // The fetch runs on a background reader; the caller
                    // retries from the root and finds the value then.
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    if file.bjm.add_background_job().is_ok() {
                        let weak = self.self_ref();
                        let p2 = Arc::clone(&p);
                        let f2 = Arc::clone(file);
                        let cbs = Arc::clone(fetch_callbacks);
                        self.ct_pool
                            .execute(move || {
                                if let Some(t) = weak.upgrade() {
                                    let t0 = Instant::now();
                                    t.fetch_pair(&f2, &p2, cbs.as_ref(), false)
                                        .expect("background fetch failed");
                                    t.stats.miss_time_us.fetch_add(
                                        t0.elapsed().as_micros() as u64,
                                        Ordering::Relaxed,
                                    );
                                }
                                f2.bjm.remove_background_job();
                            })
                            .expect("cachetable worker pool closed");
                    } else {
                        self.fetch_pair(file, &p, fetch_callbacks.as_ref(), false)?;
                    }

                    if self.ev.should_client_thread_sleep() {
                        self.ev.wait_for_cache_pressure_to_subside();
                    }
                    if self.ev.should_client_wake_eviction_thread() {
                        self.ev.signal_eviction_thread();
                    }
                    return Err(Error::TryAgain);
                }
                Some(p) => p,
            };

            let mut st = p.state.lock();
            if p.value_lock.writers() > 0 {
                // Some expensive operation (read, write-back, flush) owns
                // the pair. Release the caller's chain, wait it out, and
                // let the caller retry.
                unlockers.run();
                drop(list);
                p.value_lock.lock(&mut st);
                drop(st);
                if may_modify_value {
                    let pending = self.get_checkpoint_pending(&p);
                    self.write_pair_for_checkpoint(&p, pending);
                }
                let mut st = p.state.lock();
                p.value_lock.unlock(&mut st);
                return Err(Error::TryAgain);
            }
            p.value_lock.lock(&mut st);
            Pair::<C>::touch(&mut st);
            drop(st);

            if may_modify_value {
                let pending = self.get_checkpoint_pending(&p);
                // Checkpointing is fast when nothing is pending, the pair
                // is clean, or a clone callback shifts the write to a
                // background thread. Otherwise the synchronous write below
                // would stall the caller, so its chain is released first.
                let fast = !(pending
                    && p.state.lock().dirty == Dirty::Dirty
                    && !p.callbacks.can_clone());
                if !fast {
                    unlockers.run();
                }
                self.write_pair_for_checkpoint(&p, pending);
                if !fast {
                    let mut st = p.state.lock();
                    p.value_lock.unlock(&mut st);
                    return Err(Error::TryAgain);
                }
            }

            // SAFETY: value lock held.
            let value = unsafe {
                p.data_mut()
                    .value
                    .as_ref()
                    .expect("cached pair has no value")
            };
            if fetch_callbacks.partial_fetch_required(value) {
                unlockers.run();
                drop(list);
                self.do_partial_fetch(file, &p, fetch_callbacks.as_ref(), false)?;
                if self.ev.should_client_thread_sleep() {
                    self.ev.wait_for_cache_pressure_to_subside();
                }
                if self.ev.should_client_wake_eviction_thread() {
                    self.ev.signal_eviction_thread();
                }
                return Err(Error::TryAgain);
            }
            return Ok(PairPin::new(p));
        }
    }

    /// Non-blocking try-pin that succeeds only for a present, idle, dirty
    /// pair with no pending checkpoint. Used to avoid gratuitously
    /// dirtying a clean page.
    pub fn maybe_get_and_pin(
        &self,
        file: &Arc<CacheFile<C>>,
        key: BlockNum,
        fullhash: u32,
    ) -> Option<PairPin<C>> {
        self.maybe_get_and_pin_internal(file, key, fullhash, true)
    }

    /// Like `maybe_get_and_pin` without the dirtiness requirement.
    pub fn maybe_get_and_pin_clean(
        &self,
        file: &Arc<CacheFile<C>>,
        key: BlockNum,
        fullhash: u32,
    ) -> Option<PairPin<C>> {
        self.maybe_get_and_pin_internal(file, key, fullhash, false)
    }

    fn maybe_get_and_pin_internal(
        &self,
        file: &Arc<CacheFile<C>>,
        key: BlockNum,
        fullhash: u32,
        require_dirty: bool,
    ) -> Option<PairPin<C>> {
        let list = self.list.list.read();
        let p = list.find(file, key, fullhash)?;
        let mut st = p.state.lock();
        drop(list);
        if (require_dirty && st.dirty != Dirty::Dirty) || p.value_lock.users() > 0 {
            return None;
        }
        // users is zero, so this cannot wait
        p.value_lock.lock(&mut st);
        drop(st);
        let pending = {
            let _cheap = self.list.pending_cheap.read();
            p.checkpoint_pending.load(Ordering::Acquire)
        };
        if pending {
            // Returning the pair would make the caller responsible for
            // the checkpoint write; refuse instead.
            let mut st = p.state.lock();
            p.value_lock.unlock(&mut st);
            None
        } else {
            Some(PairPin::new(p))
        }
    }

    // ==================================================================
    // unpin

    /// Releases a pin, recording dirtiness and the new attribute. May
    /// block on flow control if the page grew.
    pub fn unpin(&self, pin: PairPin<C>, dirty: Dirty, attr: PairAttr) {
        self.unpin_internal(pin, dirty, attr, true);
    }

    /// `unpin` without flow control, for release paths that already hold
    /// list locks (unlocker chains in particular).
    pub fn unpin_no_flush(&self, pin: PairPin<C>, dirty: Dirty, attr: PairAttr) {
        self.unpin_internal(pin, dirty, attr, false);
    }

    fn unpin_internal(&self, pin: PairPin<C>, dirty: Dirty, attr: PairAttr, flush: bool) {
        let p = pin.into_pair();
        let mut st = p.state.lock();
        assert!(p.value_lock.writers() > 0);
        if dirty == Dirty::Dirty {
            st.dirty = Dirty::Dirty;
        }
        let old_attr = st.attr;
        if attr.is_valid {
            st.attr = attr;
        }
        p.value_lock.unlock(&mut st);
        drop(st);
        if attr.is_valid {
            self.ev.change_pair_attr(old_attr, attr);
            if flush && attr.size > old_attr.size {
                if self.ev.should_client_thread_sleep() {
                    self.ev.wait_for_cache_pressure_to_subside();
                }
                if self.ev.should_client_wake_eviction_thread() {
                    self.ev.signal_eviction_thread();
                }
            }
        }
    }

    /// Removes a pinned pair from the cache entirely. After this returns,
    /// no lookup for the key sees the old value. The remove-key callback
    /// runs while the pair is still locked so the upper layer can free
    /// block ids atomically with the removal.
    pub fn unpin_and_remove<F>(&self, pin: PairPin<C>, remove_key: Option<F>) -> Result<()>
    where
        F: FnOnce(BlockNum, bool),
    {
        let p = pin.into_pair();
        {
            let mut st = p.state.lock();
            assert!(p.value_lock.writers() > 0);
            // We are only removing the page; it no longer needs writing.
            st.dirty = Dirty::Clean;
            // Taking the disk lock waits out any background thread still
            // writing a cloned value.
            p.disk_lock.lock(&mut st);
        }
        // SAFETY: disk lock held.
        debug_assert!(unsafe { p.data_mut() }.cloned_value.is_none());

        let mut w = self.list.list.write();
        {
            let _cheap = self.list.pending_cheap.read();
            let mut st = p.state.lock();
            let for_checkpoint = p.checkpoint_pending.swap(false, Ordering::AcqRel);
            st.dirty = Dirty::Clean;
            // Zero cache pressure so the cleaner cannot target the pair
            // once locks are dropped below.
            st.attr.cache_pressure_size = 0;
            drop(st);
            if let Some(f) = remove_key {
                f(p.key(), for_checkpoint);
            }
        }
        let mut st = p.state.lock();
        p.value_lock.unlock(&mut st);
        p.disk_lock.unlock(&mut st);
        // Remove from the table before releasing the write lock so no new
        // thread can find the pair. Threads already blocked on the value
        // lock observe the cleared flags and do nothing.
        w.evict(&p);
        self.ev.remove_pair_attr(st.attr);
        drop(w);
        if p.value_lock.blocked_writers() > 0 {
            p.value_lock.wait_for_users(&mut st);
            assert!(!p.checkpoint_pending.load(Ordering::Acquire));
            assert_eq!(st.attr.cache_pressure_size, 0);
        }
        assert_eq!(p.disk_lock.users(), 0);
        drop(st);
        self.free_pair(&p);
        Ok(())
    }

    // ==================================================================
    // prefetch

    /// Starts fetching a pair in the background. Refuses silently when
    /// memory is over the high watermark. Returns whether a prefetch (or
    /// partial prefetch) was actually dispatched.
    pub fn prefetch(
        &self,
        file: &Arc<CacheFile<C>>,
        key: BlockNum,
        fullhash: u32,
        write_callbacks: &Arc<dyn PairCallbacks<C>>,
        fetch_callbacks: &Arc<dyn FetchCallbacks<C>>,
    ) -> Result<bool> {
        if self.ev.should_client_thread_sleep() {
            return Ok(false);
        }
        let list = self.list.list.read();
        let found = list.find(file, key, fullhash);
        match found {
            None => {
                drop(list);
                let mut w = self.list.list.write();
                if let Some(p) = w.find(file, key, fullhash) {
                    drop(w);
                    return self.maybe_partial_prefetch(file, p, fetch_callbacks);
                }
                self.stats.prefetches.fetch_add(1, Ordering::Relaxed);
                file.bjm.add_background_job()?;
                let p = self.insert_pair(
                    &mut w,
                    file,
                    key,
                    fullhash,
                    None,
                    PairAttr::zero(),
                    Dirty::Clean,
                    write_callbacks,
                    0,
                );
                let mut st = p.state.lock();
                p.value_lock.lock(&mut st);
                drop(st);
                drop(w);
                let weak = self.self_ref();
                let f2 = Arc::clone(file);
                let cbs = Arc::clone(fetch_callbacks);
                self.ct_pool
                    .execute(move || {
                        if let Some(t) = weak.upgrade() {
                            t.fetch_pair(&f2, &p, cbs.as_ref(), false)
                                .expect("background fetch failed");
                        }
                        f2.bjm.remove_background_job();
                    })
                    .expect("cachetable worker pool closed");
                Ok(true)
            }
            Some(p) => {
                drop(list);
                self.maybe_partial_prefetch(file, p, fetch_callbacks)
            }
        }
    }

    /// For a present, idle pair: dispatch a partial fetch if one is
    /// required.
    fn maybe_partial_prefetch(
        &self,
        file: &Arc<CacheFile<C>>,
        p: Arc<Pair<C>>,
        fetch_callbacks: &Arc<dyn FetchCallbacks<C>>,
    ) -> Result<bool> {
        let mut st = p.state.lock();
        if p.value_lock.users() > 0 {
            return Ok(false);
        }
        p.value_lock.lock(&mut st);
        drop(st);
        // SAFETY: value lock held.
        let value = unsafe {
            p.data_mut()
                .value
                .as_ref()
                .expect("cached pair has no value")
        };
        if fetch_callbacks.partial_fetch_required(value) {
            file.bjm.add_background_job()?;
            let weak = self.self_ref();
            let f2 = Arc::clone(file);
            let cbs = Arc::clone(fetch_callbacks);
            self.ct_pool
                .execute(move || {
                    if let Some(t) = weak.upgrade() {
                        t.do_partial_fetch(&f2, &p, cbs.as_ref(), false)
                            .expect("background partial fetch failed");
                    }
                    f2.bjm.remove_background_job();
                })
                .expect("cachetable worker pool closed");
            Ok(true)
        } else {
            let mut st = p.state.lock();
            p.value_lock.unlock(&mut st);
            Ok(false)
        }
    }

    // ==================================================================
    // fetch / write-back internals

    fn fetch_pair(
        &self,
        file: &Arc<CacheFile<C>>,
        p: &Arc<Pair<C>>,
        fetch_callbacks: &dyn FetchCallbacks<C>,
        keep_pair_pinned: bool,
    ) -> Result<()> {
        {
            let mut st = p.state.lock();
            p.disk_lock.lock(&mut st);
        }
        match fetch_callbacks.fetch(file, p.key(), p.fullhash()) {
            Ok(FetchedValue {
                value,
                disk,
                attr,
                dirty,
            }) => {
                // SAFETY: value and disk locks held.
                let data = unsafe { p.data_mut() };
                data.value = Some(value);
                data.disk = disk;
                {
                    let mut st = p.state.lock();
                    if dirty == Dirty::Dirty {
                        st.dirty = Dirty::Dirty;
                    }
                    st.attr = attr;
                }
                self.ev.add_pair_attr(attr);
                let mut st = p.state.lock();
                p.disk_lock.unlock(&mut st);
                if !keep_pair_pinned {
                    p.value_lock.unlock(&mut st);
                }
                Ok(())
            }
            Err(e) => {
                // The pair never materialized; take it back out. An I/O
                // error is fatal for the pair.
                let mut w = self.list.list.write();
                let mut st = p.state.lock();
                p.disk_lock.unlock(&mut st);
                p.value_lock.unlock(&mut st);
                assert_eq!(
                    p.value_lock.users(),
                    0,
                    "fetch failed with concurrent waiters on the pair"
                );
                w.evict(p);
                self.ev.remove_pair_attr(st.attr);
                drop(st);
                drop(w);
                Err(e)
            }
        }
    }

    fn do_partial_fetch(
        &self,
        file: &Arc<CacheFile<C>>,
        p: &Arc<Pair<C>>,
        fetch_callbacks: &dyn FetchCallbacks<C>,
        keep_pair_pinned: bool,
    ) -> Result<()> {
        let old_attr = {
            let st = p.state.lock();
            // a dirty pair is never partially missing
            debug_assert!(st.dirty == Dirty::Clean);
            st.attr
        };
        {
            let mut st = p.state.lock();
            p.disk_lock.lock(&mut st);
        }
        // SAFETY: value and disk locks held.
        let data = unsafe { p.data_mut() };
        let PairData { value, disk, .. } = data;
        let res = fetch_callbacks.partial_fetch(
            file,
            value.as_mut().expect("cached pair has no value"),
            disk,
        );
        let mut st = p.state.lock();
        match res {
            Ok(new_attr) => {
                st.attr = new_attr;
                p.disk_lock.unlock(&mut st);
                if !keep_pair_pinned {
                    p.value_lock.unlock(&mut st);
                }
                drop(st);
                self.ev.change_pair_attr(old_attr, new_attr);
                Ok(())
            }
            Err(e) => {
                p.disk_lock.unlock(&mut st);
                if !keep_pair_pinned {
                    p.value_lock.unlock(&mut st);
                }
                Err(e)
            }
        }
    }

    /// Reads and clears the pair's pending bit under the cheap pending
    /// lock.
    pub(crate) fn get_checkpoint_pending(&self, p: &Arc<Pair<C>>) -> bool {
        let _cheap = self.list.pending_cheap.read();
        p.checkpoint_pending.swap(false, Ordering::AcqRel)
    }

    fn collect_dep_pending(&self, deps: &[DepPair<'_, C>]) -> Vec<bool> {
        deps.iter()
            .map(|d| d.pin.pair.checkpoint_pending.swap(false, Ordering::AcqRel))
            .collect()
    }

    /// Propagates client dirtiness to dependent pairs and writes out
    /// those with a collected pending bit.
    fn checkpoint_dependent_pairs(&self, deps: &[DepPair<'_, C>], pending: &[bool]) {
        for (d, &pend) in deps.iter().zip(pending) {
            if d.dirty == Dirty::Dirty {
                d.pin.pair.state.lock().dirty = Dirty::Dirty;
            }
            if pend {
                self.write_pair_for_checkpoint(&d.pin.pair, true);
            }
        }
    }

    /// Resolves a pending checkpoint on a pair whose value lock the
    /// caller holds: cloneable pairs are cloned and written on a
    /// background thread (the caller keeps the pin and may mutate);
    /// otherwise the pair is written synchronously under the pin.
    pub(crate) fn write_pair_for_checkpoint(&self, p: &Arc<Pair<C>>, checkpoint_pending: bool) {
        let dirty = p.state.lock().dirty;
        if !(checkpoint_pending && dirty == Dirty::Dirty) {
            return;
        }
        if p.callbacks.can_clone() {
            {
                let mut st = p.state.lock();
                p.disk_lock.lock(&mut st);
            }
            // SAFETY: disk lock held.
            debug_assert!(unsafe { p.data_mut() }.cloned_value.is_none());
            self.clone_pair(p);
            self.cp
                .clones_bjm
                .add_background_job()
                .expect("checkpoint clone manager closed mid-checkpoint");
            let weak = self.self_ref();
            let p2 = Arc::clone(p);
            self.checkpoint_pool
                .execute(move || {
                    let t = weak
                        .upgrade()
                        .expect("cachetable dropped with checkpoint in progress");
                    t.write_locked_data(&p2, true, true);
                    let mut st = p2.state.lock();
                    p2.disk_lock.unlock(&mut st);
                    drop(st);
                    t.cp.clones_bjm.remove_background_job();
                })
                .expect("checkpoint pool closed");
        } else {
            self.write_locked_pair(p, true);
        }
    }

    /// Checkpoint-thread variant: pins the pair itself, resolves the
    /// pending bit, and releases the value lock as early as possible (in
    /// the clone case, before the clone is written).
    pub(crate) fn write_pair_for_checkpoint_thread(&self, p: &Arc<Pair<C>>) {
        let mut st = p.state.lock();
        p.value_lock.lock(&mut st);
        if st.dirty == Dirty::Dirty && p.checkpoint_pending.load(Ordering::Acquire) {
            let cloned = p.callbacks.can_clone();
            if cloned {
                p.disk_lock.lock(&mut st);
                drop(st);
                // SAFETY: disk lock held.
                debug_assert!(unsafe { p.data_mut() }.cloned_value.is_none());
                self.clone_pair(p);
                st = p.state.lock();
            } else {
                drop(st);
                self.write_locked_pair(p, true);
                st = p.state.lock();
            }
            p.checkpoint_pending.store(false, Ordering::Release);
            // Release the value lock before writing the clone so clients
            // may mutate the live value meanwhile.
            p.value_lock.unlock(&mut st);
            if cloned {
                drop(st);
                self.write_locked_data(p, true, true);
                let mut st = p.state.lock();
                p.disk_lock.unlock(&mut st);
            }
        } else {
            p.checkpoint_pending.store(false, Ordering::Release);
            p.value_lock.unlock(&mut st);
        }
    }

    /// Produces the checkpoint clone of a pinned dirty pair. Value and
    /// disk locks are held by the caller.
    fn clone_pair(&self, p: &Arc<Pair<C>>) {
        let old_attr = p.state.lock().attr;
        // SAFETY: value and disk locks held.
        let data = unsafe { p.data_mut() };
        let (clone, new_attr) = p
            .callbacks
            .clone_for_checkpoint(data.value.as_mut().expect("cached pair has no value"));
        data.cloned_value = Some(clone);
        // The clone stands in for the write, so the pair is clean from
        // here on.
        let cloned_size;
        {
            let mut st = p.state.lock();
            st.dirty = Dirty::Clean;
            if new_attr.is_valid {
                st.attr = new_attr;
                self.ev.change_pair_attr(old_attr, new_attr);
            }
            cloned_size = st.attr.size;
        }
        data.cloned_value_size = cloned_size;
        self.ev.add_to_size_current(cloned_size);
    }

    /// Writes a pair the current thread has pinned: takes the disk lock,
    /// writes if dirty, updates the attribute and marks the pair clean.
    pub(crate) fn write_locked_pair(&self, p: &Arc<Pair<C>>, for_checkpoint: bool) {
        // Taking the disk lock here waits out any clone write-back still
        // in flight; evicting a pair mid-clone-write would be unsound.
        {
            let mut st = p.state.lock();
            p.disk_lock.lock(&mut st);
        }
        // SAFETY: disk lock held.
        debug_assert!(unsafe { p.data_mut() }.cloned_value.is_none());
        let dirty = p.state.lock().dirty;
        if dirty == Dirty::Dirty {
            let old_attr = p.state.lock().attr;
            if let Some(new_attr) = self.write_locked_data(p, for_checkpoint, false) {
                if new_attr.is_valid {
                    p.state.lock().attr = new_attr;
                    self.ev.change_pair_attr(old_attr, new_attr);
                }
            }
        }
        let mut st = p.state.lock();
        st.dirty = Dirty::Clean;
        p.disk_lock.unlock(&mut st);
    }

    /// Invokes the flush callback with `write=true` for either the live
    /// value or the clone. Touches no pair state other than the clone
    /// slot accounting.
    pub(crate) fn write_locked_data(
        &self,
        p: &Arc<Pair<C>>,
        for_checkpoint: bool,
        is_clone: bool,
    ) -> Option<PairAttr> {
        // SAFETY: disk lock held by the caller; the live value is
        // additionally covered by the caller's value lock when
        // `is_clone` is false.
        let data = unsafe { p.data_mut() };
        let PairData {
            value,
            disk,
            cloned_value,
            cloned_value_size,
        } = data;
        let (flush_value, old_attr) = if is_clone {
            (
                FlushValue::Evict(cloned_value.take().expect("no cloned value to write")),
                PairAttr::new(*cloned_value_size),
            )
        } else {
            (
                FlushValue::Keep(value.as_mut().expect("cached pair has no value")),
                p.state.lock().attr,
            )
        };
        let new_attr = p.callbacks.flush(FlushArgs {
            file: Some(&p.file),
            key: p.key(),
            fullhash: p.fullhash(),
            value: flush_value,
            disk,
            old_attr,
            write: true,
            for_checkpoint,
            is_clone,
        });
        if is_clone {
            self.ev.remove_from_size_current(*cloned_value_size);
            *cloned_value_size = 0;
        }
        new_attr
    }

    /// Fully evicts a pair the current thread has pinned: writes it out
    /// if dirty, removes it from all indices and frees it (unless other
    /// threads hold an interest, in which case they own the cleanup
    /// no-op).
    pub(crate) fn evict_pair_now(&self, p: &Arc<Pair<C>>, for_checkpoint: bool) {
        let dirty = p.state.lock().dirty;
        if dirty == Dirty::Dirty {
            self.write_locked_pair(p, for_checkpoint);
        }
        let estimate = p.state.lock().size_evicting_estimate;
        self.ev.decrease_size_evicting(estimate);
        {
            let mut st = p.state.lock();
            p.disk_lock.lock(&mut st);
        }
        let mut w = self.list.list.write();
        let mut st = p.state.lock();
        p.value_lock.unlock(&mut st);
        p.disk_lock.unlock(&mut st);
        if p.value_lock.users() == 0 {
            // No disk user and no clone can exist once the last interest
            // in the value is gone.
            assert_eq!(p.disk_lock.users(), 0);
            w.evict(p);
            self.ev.remove_pair_attr(st.attr);
            drop(st);
            drop(w);
            self.free_pair(p);
        }
    }

    /// Releases the value of a pair already removed from the table.
    pub(crate) fn free_pair(&self, p: &Arc<Pair<C>>) {
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        let attr = p.state.lock().attr;
        // SAFETY: the pair is out of the table with no users left.
        let data = unsafe { p.data_mut() };
        debug_assert!(data.cloned_value.is_none());
        let PairData { value, disk, .. } = data;
        if let Some(value) = value.take() {
            // write=false, keep=false: the callback's only job is to
            // release the value. The file handle may already be closing,
            // so it is not passed.
            p.callbacks.flush(FlushArgs {
                file: None,
                key: p.key(),
                fullhash: p.fullhash(),
                value: FlushValue::Evict(value),
                disk,
                old_attr: attr,
                write: false,
                for_checkpoint: true,
                is_clone: false,
            });
        }
    }

    // ==================================================================
    // flush / close

    /// Writes out all dirty pairs belonging to `cf` (or every pair when
    /// `None`), then frees them. Assumes no client touches the affected
    /// pairs concurrently.
    pub(crate) fn flush_cachefile(&self, cf: Option<&Arc<CacheFile<C>>>) {
        let mut pairs = Vec::new();
        {
            let list = self.list.list.read();
            list.for_each(|_, p| {
                if cf.is_none_or(|cf| Arc::ptr_eq(p.file(), cf)) {
                    pairs.push(Arc::clone(p));
                }
            });
        }

        // First write out the dirty pairs on the worker pool.
        let bjm = Arc::new(BackgroundJobManager::new());
        for p in &pairs {
            let st = p.state.lock();
            assert_eq!(p.value_lock.users(), 0);
            assert_eq!(p.disk_lock.users(), 0);
            if st.dirty == Dirty::Dirty {
                bjm.add_background_job().unwrap();
                let weak = self.self_ref();
                let p2 = Arc::clone(p);
                let bjm2 = Arc::clone(&bjm);
                self.ct_pool
                    .execute(move || {
                        if let Some(t) = weak.upgrade() {
                            t.write_locked_data(&p2, false, false);
                            p2.state.lock().dirty = Dirty::Clean;
                        }
                        bjm2.remove_background_job();
                    })
                    .expect("cachetable worker pool closed");
            }
        }
        bjm.wait_for_jobs();

        // Now everything is clean; free it all under the write lock.
        let mut w = self.list.list.write();
        for p in &pairs {
            let st = p.state.lock();
            assert_eq!(p.value_lock.users(), 0);
            assert_eq!(p.disk_lock.users(), 0);
            assert!(st.dirty == Dirty::Clean);
            w.evict(p);
            self.ev.remove_pair_attr(st.attr);
            drop(st);
            self.free_pair(p);
        }
        if let Some(cf) = cf {
            w.for_each(|_, p| {
                assert!(!Arc::ptr_eq(p.file(), cf), "cachefile still has pairs after flush");
            });
        }
        drop(w);
        if let Some(cf) = cf {
            cf.bjm.reset();
        }
    }

    /// Shuts down the background threads, flushes everything and stops
    /// the worker pools. The table must not be used afterwards.
    pub fn close(&self) -> Result<()> {
        self.cp.destroy();
        self.cl.destroy();
        // Drain outstanding background jobs so no worker still holds a
        // pair lock when the flush below asserts quiescence. Draining
        // also stops admission, which keeps the evictor from starting
        // new work on these files.
        for cf in self.cf_list.all() {
            cf.bjm.wait_for_jobs();
        }
        self.flush_cachefile(None);
        self.ev.destroy();
        {
            let w = self.list.list.write();
            if w.len() != 0 {
                return Err(Error::InvalidState);
            }
        }
        self.client_pool.shutdown();
        self.ct_pool.shutdown();
        self.checkpoint_pool.shutdown();
        Ok(())
    }

    // ==================================================================
    // checkpoint / evictor surface

    /// Durably persists a consistent snapshot of all dirty pages.
    pub fn checkpoint(&self) -> Result<()> {
        self.begin_checkpoint()?;
        self.end_checkpoint()
    }

    #[inline]
    pub fn begin_checkpoint(&self) -> Result<Lsn> {
        self.cp.begin_checkpoint(self)
    }

    #[inline]
    pub fn end_checkpoint(&self) -> Result<()> {
        self.cp.end_checkpoint(self)
    }

    /// Nudges the evictor without waiting.
    #[inline]
    pub fn maybe_flush_some(&self) {
        self.ev.signal_eviction_thread();
    }

    /// Carves a fraction out of the reservable memory pool.
    #[inline]
    pub fn reserve_memory(&self, fraction: f64) -> u64 {
        self.ev.reserve_memory(fraction)
    }

    #[inline]
    pub fn release_reserved_memory(&self, reserved: u64) {
        self.ev.release_reserved_memory(reserved);
    }

    // ==================================================================
    // introspection

    pub fn stats(&self) -> CacheTableStats {
        CacheTableStats {
            misses: self.stats.misses.load(Ordering::Relaxed),
            miss_time: Duration::from_micros(self.stats.miss_time_us.load(Ordering::Relaxed)),
            puts: self.stats.puts.load(Ordering::Relaxed),
            prefetches: self.stats.prefetches.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            cleaner_executions: self.stats.cleaner_executions.load(Ordering::Relaxed),
        }
    }

    /// `(num_entries, hash_size, size_current, size_limit)`.
    pub fn get_state(&self) -> (u32, u32, i64, i64) {
        let list = self.list.list.read();
        (
            list.len(),
            list.table_size(),
            self.ev.size_current(),
            self.ev.size_limit(),
        )
    }

    /// Verifies agreement between the hash chains and the clock list.
    pub fn verify(&self) {
        let w = self.list.list.write();
        w.verify();
    }

    /// Asserts that no pair is currently pinned.
    pub fn assert_all_unpinned(&self) {
        let list = self.list.list.read();
        list.for_each(|_, p| {
            assert_eq!(p.value_lock.users(), 0);
            assert_eq!(p.disk_lock.users(), 0);
        });
    }

    // periodic-task tunables

    #[inline]
    pub fn set_checkpoint_period(&self, period: Duration) {
        self.cp.set_period(period);
    }

    #[inline]
    pub fn checkpoint_period(&self) -> Duration {
        self.cp.period()
    }

    #[inline]
    pub fn set_cleaner_period(&self, period: Duration) {
        self.cl.set_period(period);
    }

    #[inline]
    pub fn cleaner_period(&self) -> Duration {
        self.cl.period()
    }

    #[inline]
    pub fn set_cleaner_iterations(&self, iterations: u32) {
        self.cl.set_iterations(iterations);
    }

    #[inline]
    pub fn cleaner_iterations(&self) -> u32 {
        self.cl.iterations()
    }

    /// Runs one cleaner pass on the calling thread.
    #[inline]
    pub fn run_cleaner(&self) -> Result<()> {
        self.cl.run_cleaner(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testutil::*;
    use std::thread;

    #[test]
    fn test_miss_then_hit_fetches_once() {
        let h = harness(1 << 20);
        let (_cbs, cbs) = dyn_callbacks(TestCallbacks::default());
        let fetch = TestFetch::new("A", 100, Dirty::Clean);
        let fetch_dyn = dyn_fetch(&fetch);
        let key = BlockNum(7);
        let fullhash = CacheTable::hash(&h.file, key);

        let pin = h
            .table
            .get_and_pin(&h.file, key, fullhash, &cbs, &fetch_dyn, false)
            .unwrap();
        assert_eq!(pin.value().tag, "A");
        let serial = pin.value().serial;
        h.table.unpin(pin, Dirty::Clean, PairAttr::new(100));

        let pin = h
            .table
            .get_and_pin(&h.file, key, fullhash, &cbs, &fetch_dyn, false)
            .unwrap();
        // second pin is a pure hit: same materialization, no new fetch
        assert_eq!(fetch.fetches(), 1);
        assert_eq!(pin.value().serial, serial);
        assert_eq!(h.table.stats().misses, 1);
        h.table.unpin(pin, Dirty::Clean, PairAttr::new(100));
        h.close();
    }

    #[test]
    fn test_put_then_get_returns_value() {
        let h = harness(1 << 20);
        let (_cbs, cbs) = dyn_callbacks(TestCallbacks::default());
        let fetch = TestFetch::new("should-not-run", 1, Dirty::Clean);
        let fetch_dyn = dyn_fetch(&fetch);
        let key = BlockNum(11);
        let fullhash = CacheTable::hash(&h.file, key);

        let value = TestValue::new("V", 64);
        let serial = value.serial;
        let pin = h
            .table
            .put(&h.file, key, fullhash, value, PairAttr::new(64), &cbs)
            .unwrap();
        h.table.unpin(pin, Dirty::Dirty, PairAttr::new(64));

        let pin = h
            .table
            .get_and_pin(&h.file, key, fullhash, &cbs, &fetch_dyn, false)
            .unwrap();
        assert_eq!(pin.value().serial, serial);
        assert_eq!(fetch.fetches(), 0);
        assert_eq!(h.table.stats().puts, 1);
        h.table.unpin(pin, Dirty::Clean, PairAttr::new(64));

        // a duplicate put is a sentinel error, not an abort
        let r = h
            .table
            .put(&h.file, key, fullhash, TestValue::new("W", 64), PairAttr::new(64), &cbs);
        assert!(matches!(r, Err(Error::AlreadyPresent)));
        h.close();
    }

    #[test]
    fn test_nonblocking_miss_runs_unlockers_once_and_tries_again() {
        let h = harness(1 << 20);
        let (_cbs, cbs) = dyn_callbacks(TestCallbacks::default());
        let fetch = TestFetch::new("A", 100, Dirty::Clean);
        let fetch_dyn = dyn_fetch(&fetch);
        let key = BlockNum(3);
        let fullhash = CacheTable::hash(&h.file, key);

        let mut runs = 0usize;
        let mut unlockers = UnlockerChain::new();
        unlockers.push(|| runs += 1);
        let r = h.table.get_and_pin_nonblocking(
            &h.file,
            key,
            fullhash,
            &cbs,
            &fetch_dyn,
            false,
            &mut unlockers,
        );
        assert!(matches!(r, Err(Error::TryAgain)));
        assert!(unlockers.ran());
        drop(unlockers);
        assert_eq!(runs, 1);

        // the fetch was kicked off in the background; a blocking pin
        // waits for it and sees the fetched value
        let pin = h
            .table
            .get_and_pin(&h.file, key, fullhash, &cbs, &fetch_dyn, false)
            .unwrap();
        assert_eq!(pin.value().tag, "A");
        assert_eq!(fetch.fetches(), 1);
        h.table.unpin(pin, Dirty::Clean, PairAttr::new(100));
        h.close();
    }

    #[test]
    fn test_maybe_get_and_pin_rules() {
        let h = harness(1 << 20);
        let (_cbs, cbs) = dyn_callbacks(TestCallbacks::default());
        let key = BlockNum(21);
        let fullhash = CacheTable::hash(&h.file, key);

        // absent: both variants refuse
        assert!(h.table.maybe_get_and_pin(&h.file, key, fullhash).is_none());
        assert!(h.table.maybe_get_and_pin_clean(&h.file, key, fullhash).is_none());

        let pin = h
            .table
            .put(&h.file, key, fullhash, TestValue::new("V", 10), PairAttr::new(10), &cbs)
            .unwrap();
        // pinned by us: contended, refuse
        assert!(h.table.maybe_get_and_pin(&h.file, key, fullhash).is_none());
        h.table.unpin(pin, Dirty::Dirty, PairAttr::new(10));

        // idle and dirty: both succeed
        let pin = h.table.maybe_get_and_pin(&h.file, key, fullhash).unwrap();
        h.table.unpin(pin, Dirty::Dirty, PairAttr::invalid());
        let pin = h.table.maybe_get_and_pin_clean(&h.file, key, fullhash).unwrap();
        h.table.unpin(pin, Dirty::Clean, PairAttr::invalid());

        // pending a checkpoint: refuse rather than take on the write
        h.table.begin_checkpoint().unwrap();
        assert!(h.table.maybe_get_and_pin(&h.file, key, fullhash).is_none());
        h.table.end_checkpoint().unwrap();
        h.close();
    }

    #[test]
    fn test_unpin_and_remove_makes_key_absent() {
        let h = harness(1 << 20);
        let (cbs_c, cbs) = dyn_callbacks(TestCallbacks::default());
        let key = BlockNum(9);
        let fullhash = CacheTable::hash(&h.file, key);

        let pin = h
            .table
            .put(&h.file, key, fullhash, TestValue::new("V", 10), PairAttr::new(10), &cbs)
            .unwrap();
        let mut removed = Vec::new();
        h.table
            .unpin_and_remove(pin, Some(|k: BlockNum, for_checkpoint: bool| {
                removed.push((k, for_checkpoint));
            }))
            .unwrap();
        assert_eq!(removed, vec![(key, false)]);
        assert!(h.table.maybe_get_and_pin_clean(&h.file, key, fullhash).is_none());
        let (num_entries, _, _, _) = h.table.get_state();
        assert_eq!(num_entries, 0);
        // the value was released without a write
        let frees = cbs_c.frees();
        assert_eq!(frees.len(), 1);
        assert_eq!(frees[0].key, key);
        h.close();
    }

    #[test]
    fn test_unpin_and_remove_racing_nonblocking_reader() {
        let h = harness(1 << 20);
        let (_cbs, cbs) = dyn_callbacks(TestCallbacks::default());
        let fetch = TestFetch::new("fresh", 10, Dirty::Clean);
        let fetch_dyn = dyn_fetch(&fetch);
        let key = BlockNum(9);
        let fullhash = CacheTable::hash(&h.file, key);

        let pin = h
            .table
            .put(&h.file, key, fullhash, TestValue::new("old", 10), PairAttr::new(10), &cbs)
            .unwrap();
        let old_serial = pin.value().serial;

        let table = Arc::clone(&h.table);
        let file = Arc::clone(&h.file);
        let cbs2 = Arc::clone(&cbs);
        let reader = thread::spawn(move || {
            // B must either observe try-again or miss-and-refetch; it must
            // never see the removed value.
            loop {
                let mut unlockers = UnlockerChain::new();
                match table.get_and_pin_nonblocking(
                    &file,
                    key,
                    fullhash,
                    &cbs2,
                    &fetch_dyn,
                    false,
                    &mut unlockers,
                ) {
                    Ok(pin) => {
                        let serial = pin.value().serial;
                        table.unpin(pin, Dirty::Clean, PairAttr::invalid());
                        return serial;
                    }
                    Err(Error::TryAgain) => {
                        thread::sleep(std::time::Duration::from_millis(1));
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        });

        thread::sleep(std::time::Duration::from_millis(20));
        h.table
            .unpin_and_remove(pin, None::<fn(BlockNum, bool)>)
            .unwrap();
        let seen = reader.join().unwrap();
        assert_ne!(seen, old_serial);
        h.close();
    }

    #[test]
    fn test_prefetch_dispatches_background_fetch() {
        let h = harness(1 << 20);
        let (_cbs, cbs) = dyn_callbacks(TestCallbacks::default());
        let fetch = TestFetch::new("P", 50, Dirty::Clean);
        let fetch_dyn = dyn_fetch(&fetch);
        let key = BlockNum(30);
        let fullhash = CacheTable::hash(&h.file, key);

        let doing = h
            .table
            .prefetch(&h.file, key, fullhash, &cbs, &fetch_dyn)
            .unwrap();
        assert!(doing);
        let deadline = Instant::now() + Duration::from_secs(5);
        while fetch.fetches() == 0 {
            assert!(Instant::now() < deadline, "prefetch never completed");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(h.table.stats().prefetches, 1);

        // wait for the reader to release the pair, then pin it for free
        let deadline = Instant::now() + Duration::from_secs(5);
        let pin = loop {
            if let Some(pin) = h.table.maybe_get_and_pin_clean(&h.file, key, fullhash) {
                break pin;
            }
            assert!(Instant::now() < deadline, "prefetched pair stayed pinned");
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(pin.value().tag, "P");
        h.table.unpin(pin, Dirty::Clean, PairAttr::invalid());

        // present and whole: nothing to prefetch
        let doing = h
            .table
            .prefetch(&h.file, key, fullhash, &cbs, &fetch_dyn)
            .unwrap();
        assert!(!doing);
        h.close();
    }

    #[test]
    fn test_hash_table_grows_and_shrinks() {
        let h = harness(1 << 20);
        let (_cbs, cbs) = dyn_callbacks(TestCallbacks::default());
        for i in 0..40u64 {
            let key = BlockNum(i);
            let fullhash = CacheTable::hash(&h.file, key);
            let pin = h
                .table
                .put(&h.file, key, fullhash, TestValue::new("n", 8), PairAttr::new(8), &cbs)
                .unwrap();
            h.table.unpin(pin, Dirty::Dirty, PairAttr::invalid());
        }
        h.table.verify();
        let (num_entries, hash_size, _, _) = h.table.get_state();
        assert_eq!(num_entries, 40);
        assert_eq!(hash_size, 64);

        for i in 0..40u64 {
            let key = BlockNum(i);
            let fullhash = CacheTable::hash(&h.file, key);
            let pin = h.table.maybe_get_and_pin(&h.file, key, fullhash).unwrap();
            h.table
                .unpin_and_remove(pin, None::<fn(BlockNum, bool)>)
                .unwrap();
        }
        h.table.verify();
        let (num_entries, hash_size, _, _) = h.table.get_state();
        assert_eq!(num_entries, 0);
        assert_eq!(hash_size, 4);
        h.close();
    }

    #[test]
    fn test_dependent_pair_dirtied_on_pin() {
        let h = harness(1 << 20);
        let (cbs_c, cbs) = dyn_callbacks(TestCallbacks::default());
        let fetch = TestFetch::new("A", 10, Dirty::Clean);
        let fetch_dyn = dyn_fetch(&fetch);

        let parent_key = BlockNum(1);
        let parent_hash = CacheTable::hash(&h.file, parent_key);
        let parent = h
            .table
            .put(&h.file, parent_key, parent_hash, TestValue::new("parent", 10), PairAttr::new(10), &cbs)
            .unwrap();

        // pin a child declaring the parent as a dirty dependent
        let child_key = BlockNum(2);
        let child_hash = CacheTable::hash(&h.file, child_key);
        let deps = [DepPair { pin: &parent, dirty: Dirty::Dirty }];
        let child = h
            .table
            .get_and_pin_with_dep_pairs(&h.file, child_key, child_hash, &cbs, &fetch_dyn, true, &deps)
            .unwrap();
        h.table.unpin(child, Dirty::Dirty, PairAttr::invalid());
        h.table.unpin(parent, Dirty::Clean, PairAttr::invalid());

        // the parent stayed dirty, so closing writes both pairs
        h.close();
        let writes = cbs_c.writes();
        assert!(writes.iter().any(|r| r.key == parent_key));
        assert!(writes.iter().any(|r| r.key == child_key));
    }

    #[test]
    fn test_concurrent_pin_unpin_smoke() {
        use rand::Rng;
        let h = harness(1024);
        let (_cbs, cbs) = dyn_callbacks(TestCallbacks::default());
        let mut handles = vec![];
        for _ in 0..4 {
            let table = Arc::clone(&h.table);
            let file = Arc::clone(&h.file);
            let cbs = Arc::clone(&cbs);
            handles.push(thread::spawn(move || {
                let fetch = TestFetch::new("smoke", 64, Dirty::Clean);
                let fetch_dyn = dyn_fetch(&fetch);
                let mut rng = rand::rng();
                for _ in 0..100 {
                    let key = BlockNum(rng.random_range(0..32u64));
                    let fullhash = CacheTable::hash(&file, key);
                    let may_modify = rng.random_bool(0.5);
                    let pin = table
                        .get_and_pin(&file, key, fullhash, &cbs, &fetch_dyn, may_modify)
                        .unwrap();
                    assert_eq!(pin.value().tag, "smoke");
                    let dirty = if may_modify { Dirty::Dirty } else { Dirty::Clean };
                    table.unpin(pin, dirty, PairAttr::new(64));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        // let in-flight eviction work drain before asserting quiescence
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let mut busy = h.table.ev.size_evicting() != 0;
            {
                let list = h.table.list.list.read();
                list.for_each(|_, p| {
                    if p.value_lock.users() > 0 || p.disk_lock.users() > 0 {
                        busy = true;
                    }
                });
            }
            if !busy {
                break;
            }
            assert!(Instant::now() < deadline, "background work never drained");
            thread::sleep(Duration::from_millis(10));
        }
        h.table.assert_all_unpinned();
        h.table.verify();
        h.close();
    }
}
