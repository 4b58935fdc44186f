use crate::cache::callbacks::{CacheClient, CheckpointLogger};
use crate::cache::checkpointer::Checkpointer;
use crate::cache::cleaner::Cleaner;
use crate::cache::evictor::Evictor;
use crate::cache::table::CacheTable;
use crate::error::Result;
use byte_unit::Byte;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_SIZE_LIMIT: Byte = Byte::from_u64(128 * 1024 * 1024); // 128 MiB
pub const DEFAULT_EVICTION_PERIOD_SECS: u32 = 1;
pub const DEFAULT_CLEANER_ITERATIONS: u32 = 1;

/// Configuration of a cachetable instance.
///
/// Periods are in seconds; a period of zero disables the corresponding
/// background task until it is changed at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTableConfig {
    // Memory budget for cached pair values. Fixes the eviction
    // watermarks.
    pub size_limit: Byte,
    // How often the checkpointer produces a crash-consistent snapshot.
    pub checkpoint_period_secs: u32,
    // How often the cleaner probes for high-pressure pairs.
    pub cleaner_period_secs: u32,
    // Probes per cleaner run.
    pub cleaner_iterations: u32,
    // Background sleep period of the evictor.
    pub eviction_period_secs: u32,
    // Directory prefixed to relative inames.
    pub env_dir: String,
}

impl Default for CacheTableConfig {
    #[inline]
    fn default() -> Self {
        CacheTableConfig {
            size_limit: DEFAULT_SIZE_LIMIT,
            checkpoint_period_secs: 0,
            cleaner_period_secs: 0,
            cleaner_iterations: DEFAULT_CLEANER_ITERATIONS,
            eviction_period_secs: DEFAULT_EVICTION_PERIOD_SECS,
            env_dir: String::from("."),
        }
    }
}

impl CacheTableConfig {
    #[inline]
    pub fn size_limit<T>(mut self, size_limit: T) -> Self
    where
        Byte: From<T>,
    {
        self.size_limit = Byte::from(size_limit);
        self
    }

    #[inline]
    pub fn checkpoint_period_secs(mut self, secs: u32) -> Self {
        self.checkpoint_period_secs = secs;
        self
    }

    #[inline]
    pub fn cleaner_period_secs(mut self, secs: u32) -> Self {
        self.cleaner_period_secs = secs;
        self
    }

    #[inline]
    pub fn cleaner_iterations(mut self, iterations: u32) -> Self {
        self.cleaner_iterations = iterations;
        self
    }

    #[inline]
    pub fn eviction_period_secs(mut self, secs: u32) -> Self {
        self.eviction_period_secs = secs;
        self
    }

    #[inline]
    pub fn env_dir(mut self, env_dir: impl Into<String>) -> Self {
        self.env_dir = env_dir.into();
        self
    }

    /// Builds the cachetable and starts its background threads.
    pub fn build<C: CacheClient>(
        self,
        logger: Option<Arc<dyn CheckpointLogger>>,
    ) -> Result<Arc<CacheTable<C>>> {
        let mut size_limit = self.size_limit.as_u64() as i64;
        if size_limit == 0 {
            size_limit = DEFAULT_SIZE_LIMIT.as_u64() as i64;
        }
        let nproc = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let table = CacheTable::new_cyclic(
            size_limit,
            Duration::from_secs(self.eviction_period_secs as u64),
            PathBuf::from(self.env_dir),
            logger,
            nproc,
            2 * nproc,
            (nproc / 4).max(1),
            self.cleaner_iterations,
        );
        Evictor::start_thread(&table);
        Checkpointer::start(&table, Duration::from_secs(self.checkpoint_period_secs as u64));
        Cleaner::start(&table, Duration::from_secs(self.cleaner_period_secs as u64));
        Ok(table)
    }
}
