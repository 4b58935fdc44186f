pub mod attr;
pub mod callbacks;
mod checkpointer;
mod cleaner;
pub mod config;
mod evictor;
pub mod file;
mod list;
pub mod pair;
pub mod table;

#[cfg(test)]
pub(crate) mod testutil;

pub use attr::{Dirty, PairAttr, PartialEvictionCost};
pub use callbacks::{
    CacheClient, CheckpointLogger, FetchCallbacks, FetchedValue, FileUserdata, FlushArgs,
    FlushValue, Lsn, PairCallbacks,
};
pub use config::CacheTableConfig;
pub use file::{CacheFile, FileId, FileNum, construct_full_name};
pub use pair::{BlockNum, Pair, PairPin};
pub use table::{CacheTable, CacheTableStats, DepPair, UnlockerChain};
