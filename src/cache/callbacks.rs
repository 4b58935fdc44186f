//! Capability interfaces at the seams between the cache core and its
//! collaborators: the index layer above, per-file user data, and the
//! write-ahead logger.
//!
//! The core is byte/structure-agnostic. It only tracks a value handle per
//! pair and reaches the index layer through these traits.

use crate::cache::attr::{Dirty, PairAttr, PartialEvictionCost};
use crate::cache::file::CacheFile;
use crate::cache::pair::{BlockNum, PairPin};
use crate::cache::table::CacheTable;
use crate::error::Result;
use std::sync::Arc;

/// Log sequence number handed out by the logger for a checkpoint begin
/// record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Lsn(pub u64);

/// Client types cached by a table: the materialized page value and its
/// optional disk-side companion.
pub trait CacheClient: Send + Sync + 'static {
    type Value: Send + 'static;
    type Disk: Send + 'static;
}

/// How the flush callback receives the page value.
pub enum FlushValue<'a, C: CacheClient> {
    /// The pair stays cached; write-back paths hand out a borrow.
    Keep(&'a mut C::Value),
    /// The pair (or a checkpoint clone) is leaving the cache; the callback
    /// owns the value and drops it.
    Evict(C::Value),
}

/// Arguments of a single flush invocation.
///
/// `file` is absent when the pair has already been removed from the table
/// and only needs its value released.
pub struct FlushArgs<'a, C: CacheClient> {
    pub file: Option<&'a Arc<CacheFile<C>>>,
    pub key: BlockNum,
    pub fullhash: u32,
    pub value: FlushValue<'a, C>,
    pub disk: &'a mut Option<C::Disk>,
    pub old_attr: PairAttr,
    /// Write the page out before (possibly) releasing it.
    pub write: bool,
    pub for_checkpoint: bool,
    pub is_clone: bool,
}

/// Per-pair callback family installed at insert time.
///
/// One handle serves flush, partial eviction, cleaning and cloning for the
/// lifetime of the pair.
pub trait PairCallbacks<C: CacheClient>: Send + Sync {
    /// Writes and/or frees the page. Returns the new attribute when the
    /// write changed it.
    fn flush(&self, args: FlushArgs<'_, C>) -> Option<PairAttr>;

    /// Estimates how many bytes a partial eviction would free and how
    /// expensive applying it would be.
    fn partial_eviction_estimate(
        &self,
        value: &C::Value,
        disk: Option<&C::Disk>,
    ) -> (i64, PartialEvictionCost);

    /// Sheds sub-page regions in place. Returns the new attribute.
    fn partial_eviction(&self, value: &mut C::Value, old_attr: PairAttr) -> PairAttr;

    /// Performs per-pair maintenance. The pin must be released by this
    /// callback (dropping it or passing it to `unpin` both qualify).
    fn cleaner(&self, _table: &CacheTable<C>, pin: PairPin<C>) -> Result<()> {
        drop(pin);
        Ok(())
    }

    /// Whether this pair supports checkpoint clones. Pairs that do never
    /// block clients on a slow checkpoint write.
    fn can_clone(&self) -> bool {
        false
    }

    /// Produces a detached pre-image the checkpointer can write while the
    /// live value keeps mutating. Only called when `can_clone` is true.
    fn clone_for_checkpoint(&self, _value: &mut C::Value) -> (C::Value, PairAttr) {
        unreachable!("pair without a clone callback was asked to clone")
    }
}

/// Result of a successful full fetch.
pub struct FetchedValue<C: CacheClient> {
    pub value: C::Value,
    pub disk: Option<C::Disk>,
    pub attr: PairAttr,
    pub dirty: Dirty,
}

/// Read-side callback family passed to the pin and prefetch operations.
pub trait FetchCallbacks<C: CacheClient>: Send + Sync {
    /// Reads the page from disk on a miss.
    fn fetch(
        &self,
        file: &Arc<CacheFile<C>>,
        key: BlockNum,
        fullhash: u32,
    ) -> Result<FetchedValue<C>>;

    /// Whether the cached value is missing pieces the caller requires.
    fn partial_fetch_required(&self, _value: &C::Value) -> bool {
        false
    }

    /// Loads the missing pieces. Returns the new attribute.
    fn partial_fetch(
        &self,
        _file: &Arc<CacheFile<C>>,
        _value: &mut C::Value,
        _disk: &mut Option<C::Disk>,
    ) -> Result<PairAttr> {
        unreachable!("partial fetch requested but not implemented")
    }
}

/// Per-file hooks invoked around close and checkpoint.
///
/// Every method defaults to a no-op so clients override only what they
/// participate in.
pub trait FileUserdata<C: CacheClient>: Send + Sync {
    fn log_fassociate(&self, _file: &Arc<CacheFile<C>>) -> Result<()> {
        Ok(())
    }

    fn log_suppress_rollback(&self, _file: &Arc<CacheFile<C>>) -> Result<()> {
        Ok(())
    }

    /// Invoked while the file closes, before its descriptor goes away.
    fn close(&self, _file: &Arc<CacheFile<C>>) -> Result<()> {
        Ok(())
    }

    fn note_pin_by_checkpoint(&self, _file: &Arc<CacheFile<C>>) -> Result<()> {
        Ok(())
    }

    fn note_unpin_by_checkpoint(&self, _file: &Arc<CacheFile<C>>) -> Result<()> {
        Ok(())
    }

    /// Runs inside the begin-checkpoint critical section.
    fn begin_checkpoint(&self, _lsn: Lsn, _file: &Arc<CacheFile<C>>) -> Result<()> {
        Ok(())
    }

    /// Writes the file's header/translation after all data blocks.
    fn checkpoint(&self, _file: &Arc<CacheFile<C>>) -> Result<()> {
        Ok(())
    }

    /// Frees blocks made obsolete by the checkpoint that just ended.
    fn end_checkpoint(&self, _file: &Arc<CacheFile<C>>) -> Result<()> {
        Ok(())
    }
}

/// Injected write-ahead logger. The core only produces the checkpoint
/// record families; the log is consumed elsewhere.
pub trait CheckpointLogger: Send + Sync {
    /// Logs `BEGIN_CHECKPOINT` and returns its LSN.
    fn begin_checkpoint(&self) -> Result<Lsn>;

    /// Writes one `xstillopen`/`xstillopenprepared` record per live
    /// transaction and returns how many were written.
    fn log_live_transactions(&self) -> Result<u64>;

    /// Logs the fsync'd `END_CHECKPOINT` record.
    fn end_checkpoint(&self, begin_lsn: Lsn, num_files: u64, num_txns: u64) -> Result<()>;

    /// Tells the logger the checkpoint is durable.
    fn note_checkpoint(&self, lsn: Lsn);
}
