//! Periodic checkpointer: marks all live pairs pending, then ensures each
//! is durably written (directly or via a clone) before any subsequent
//! mutation, so the version of every dirty page at begin-checkpoint is
//! the version persisted.

use crate::cache::callbacks::{CacheClient, Lsn};
use crate::cache::table::CacheTable;
use crate::error::Result;
use crate::jobs::BackgroundJobManager;
use crate::thread::Minicron;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[derive(Default)]
struct CpState {
    lsn_of_checkpoint_in_progress: Lsn,
    num_files: u64,
    num_txns: u64,
}

pub(crate) struct Checkpointer {
    /// Barrier for in-flight clone write-backs of the current checkpoint.
    pub(crate) clones_bjm: BackgroundJobManager,
    state: Mutex<CpState>,
    cron: Minicron,
}

impl Checkpointer {
    pub(crate) fn new() -> Self {
        Checkpointer {
            clones_bjm: BackgroundJobManager::new(),
            state: Mutex::new(CpState::default()),
            cron: Minicron::new(),
        }
    }

    pub(crate) fn start<C: CacheClient>(table: &Arc<CacheTable<C>>, period: Duration) {
        let t = Arc::clone(table);
        table.cp.cron.start("Checkpointer", period, move || {
            // A failed checkpoint leaves no way to reason about
            // durability; give up loudly.
            t.checkpoint().expect("checkpoint failed");
        });
    }

    pub(crate) fn destroy(&self) {
        self.cron.shutdown();
    }

    #[inline]
    pub(crate) fn period(&self) -> Duration {
        self.cron.period()
    }

    #[inline]
    pub(crate) fn set_period(&self, period: Duration) {
        self.cron.change_period(period);
    }

    /// Marks every pair of every open file as checkpoint-pending and
    /// snapshots the file set. The caller serializes checkpoints: a new
    /// begin must not run before the previous end completes.
    pub(crate) fn begin_checkpoint<C: CacheClient>(&self, table: &CacheTable<C>) -> Result<Lsn> {
        // 1. Snapshot the file list and pin each file into the checkpoint.
        let mut num_files = 0u64;
        for cf in table.cf_list.all() {
            if let Some(ud) = cf.userdata() {
                ud.note_pin_by_checkpoint(&cf)?;
            }
            cf.for_checkpoint.store(true, Ordering::Release);
            num_files += 1;
        }

        // 2. Log the begin record, the open dictionaries, the live
        //    transactions, and the suppressed-rollback dictionaries.
        let mut lsn = Lsn::default();
        let mut num_txns = 0u64;
        if let Some(logger) = &table.logger {
            lsn = logger.begin_checkpoint()?;
            for cf in table.cf_list.all() {
                if let Some(ud) = cf.userdata() {
                    ud.log_fassociate(&cf)?;
                }
            }
            num_txns = logger.log_live_transactions()?;
            for cf in table.cf_list.all() {
                if let Some(ud) = cf.userdata() {
                    ud.log_suppress_rollback(&cf)?;
                }
            }
        }
        {
            let mut cps = self.state.lock();
            cps.lsn_of_checkpoint_in_progress = lsn;
            cps.num_files = num_files;
            cps.num_txns = num_txns;
        }
        self.clones_bjm.reset();

        // 3. Turn on the pending bits. Lock order: pending-expensive
        //    (write), list (read), cachefile-list (read), pending-cheap
        //    (write).
        {
            let _exp = table.list.pending_expensive.write();
            let list = table.list.list.read();
            let files = table.cf_list.read();
            let _cheap = table.list.pending_cheap.write();
            list.for_each(|id, p| {
                assert!(!p.checkpoint_pending.load(Ordering::Acquire));
                // only pairs of participating files
                if !p.file().for_checkpoint.load(Ordering::Acquire) {
                    return;
                }
                p.checkpoint_pending.store(true, Ordering::Release);
                list.pending_push(id);
            });
            for cf in &files.files {
                if cf.for_checkpoint.load(Ordering::Acquire) {
                    if let Some(ud) = cf.userdata() {
                        ud.begin_checkpoint(lsn, cf)?;
                    }
                }
            }
        }
        Ok(lsn)
    }

    /// Drains the pending list, waits for clone write-backs, writes the
    /// per-file headers, logs the end record and releases the files.
    pub(crate) fn end_checkpoint<C: CacheClient>(&self, table: &CacheTable<C>) -> Result<()> {
        // 1. Materialize the participating files.
        let checkpoint_cfs: Vec<_> = table
            .cf_list
            .all()
            .into_iter()
            .filter(|cf| cf.for_checkpoint.load(Ordering::Acquire))
            .collect();

        // 2. Write every pending pair, releasing the read list lock
        //    around each write.
        loop {
            let p = {
                let list = table.list.list.read();
                list.pop_pending()
            };
            match p {
                Some(p) => table.write_pair_for_checkpoint_thread(&p),
                None => break,
            }
        }
        debug_assert!(table.list.list.read().pending_is_empty());

        // 3. Wait for the clone writers.
        self.clones_bjm.wait_for_jobs();

        // 4. Headers and translations.
        for cf in &checkpoint_cfs {
            if let Some(ud) = cf.userdata() {
                ud.checkpoint(cf)?;
            }
        }

        // 5. END_CHECKPOINT, fsync'd, then notify the logger.
        let (lsn, num_files, num_txns) = {
            let cps = self.state.lock();
            (
                cps.lsn_of_checkpoint_in_progress,
                cps.num_files,
                cps.num_txns,
            )
        };
        if let Some(logger) = &table.logger {
            logger.end_checkpoint(lsn, num_files, num_txns)?;
            logger.note_checkpoint(lsn);
        }

        // 6. Free obsolete blocks.
        for cf in &checkpoint_cfs {
            if let Some(ud) = cf.userdata() {
                ud.end_checkpoint(cf)?;
            }
        }

        // 7. Release the files. The first unpin error aborts the walk and
        //    is returned.
        for cf in &checkpoint_cfs {
            cf.for_checkpoint.store(false, Ordering::Release);
            if let Some(ud) = cf.userdata() {
                ud.note_unpin_by_checkpoint(cf)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::attr::{Dirty, PairAttr};
    use crate::cache::pair::BlockNum;
    use crate::cache::table::CacheTable;
    use crate::cache::testutil::*;

    #[test]
    fn test_end_checkpoint_writes_pending_dirty_pair() {
        let h = harness(1 << 20);
        let (cbs_c, cbs) = dyn_callbacks(TestCallbacks::default());
        let key = BlockNum(5);
        let fullhash = CacheTable::hash(&h.file, key);
        let pin = h
            .table
            .put(&h.file, key, fullhash, TestValue::new("X", 100), PairAttr::new(100), &cbs)
            .unwrap();
        h.table.unpin(pin, Dirty::Dirty, PairAttr::new(100));

        h.table.checkpoint().unwrap();
        let writes = cbs_c.writes();
        assert!(writes.iter().any(|r| r.key == key && r.for_checkpoint && !r.is_clone));

        // a second checkpoint has nothing dirty to write
        let before = cbs_c.writes().len();
        h.table.checkpoint().unwrap();
        assert_eq!(cbs_c.writes().len(), before);
        h.close();
    }

    #[test]
    fn test_client_pin_writes_pre_image_before_mutating() {
        let h = harness(1 << 20);
        let (cbs_c, cbs) = dyn_callbacks(TestCallbacks::default());
        let fetch = TestFetch::new("unused", 1, Dirty::Clean);
        let fetch_dyn = dyn_fetch(&fetch);
        let key = BlockNum(5);
        let fullhash = CacheTable::hash(&h.file, key);
        let pin = h
            .table
            .put(&h.file, key, fullhash, TestValue::new("X", 100), PairAttr::new(100), &cbs)
            .unwrap();
        h.table.unpin(pin, Dirty::Dirty, PairAttr::new(100));

        h.table.begin_checkpoint().unwrap();
        // pinning for write resolves the pending bit synchronously, so
        // the checkpoint sees the pre-modification value
        let mut pin = h
            .table
            .get_and_pin(&h.file, key, fullhash, &cbs, &fetch_dyn, true)
            .unwrap();
        {
            let writes = cbs_c.writes();
            assert!(writes.iter().any(|r| r.tag == "X" && r.for_checkpoint && !r.is_clone));
        }
        pin.value_mut().tag = "Y".to_string();
        h.table.unpin(pin, Dirty::Dirty, PairAttr::new(100));
        h.table.end_checkpoint().unwrap();

        // nothing checkpoint-wrote the mutated value
        assert!(!cbs_c.writes().iter().any(|r| r.tag == "Y" && r.for_checkpoint));
        h.close();
    }

    #[test]
    fn test_cloneable_pair_checkpoints_through_clone() {
        let h = harness(1 << 20);
        let (cbs_c, cbs) = dyn_callbacks(TestCallbacks {
            clone_supported: true,
            ..TestCallbacks::default()
        });
        let fetch = TestFetch::new("unused", 1, Dirty::Clean);
        let fetch_dyn = dyn_fetch(&fetch);
        let key = BlockNum(6);
        let fullhash = CacheTable::hash(&h.file, key);
        let pin = h
            .table
            .put(&h.file, key, fullhash, TestValue::new("X", 100), PairAttr::new(100), &cbs)
            .unwrap();
        h.table.unpin(pin, Dirty::Dirty, PairAttr::new(100));

        h.table.begin_checkpoint().unwrap();
        // a cloneable pair never stalls the client: the pre-image goes
        // to a background writer while the client mutates
        let mut pin = h
            .table
            .get_and_pin(&h.file, key, fullhash, &cbs, &fetch_dyn, true)
            .unwrap();
        pin.value_mut().tag = "Y".to_string();
        h.table.unpin(pin, Dirty::Dirty, PairAttr::new(100));
        h.table.end_checkpoint().unwrap();

        let writes = cbs_c.writes();
        assert!(writes.iter().any(|r| r.is_clone && r.tag == "X" && r.for_checkpoint));
        assert!(!writes.iter().any(|r| r.tag == "Y" && r.for_checkpoint));
        h.close();
    }

    #[test]
    fn test_checkpoint_thread_clone_drain() {
        let h = harness(1 << 20);
        let (cbs_c, cbs) = dyn_callbacks(TestCallbacks {
            clone_supported: true,
            ..TestCallbacks::default()
        });
        let key = BlockNum(8);
        let fullhash = CacheTable::hash(&h.file, key);
        let pin = h
            .table
            .put(&h.file, key, fullhash, TestValue::new("X", 100), PairAttr::new(100), &cbs)
            .unwrap();
        h.table.unpin(pin, Dirty::Dirty, PairAttr::new(100));

        // no client touches the pair; the checkpoint thread itself clones
        // and writes it during the drain
        h.table.checkpoint().unwrap();
        let writes = cbs_c.writes();
        assert!(writes.iter().any(|r| r.key == key && r.is_clone && r.for_checkpoint));
        h.close();
    }
}
