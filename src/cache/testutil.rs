//! Shared in-memory test client used by the scenario tests.

use crate::cache::attr::{Dirty, PairAttr, PartialEvictionCost};
use crate::cache::callbacks::{
    CacheClient, FetchCallbacks, FetchedValue, FlushArgs, FlushValue, PairCallbacks,
};
use crate::cache::config::CacheTableConfig;
use crate::cache::file::CacheFile;
use crate::cache::pair::{BlockNum, PairPin};
use crate::cache::table::CacheTable;
use crate::error::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::TempDir;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

pub(crate) struct TestClient;

impl CacheClient for TestClient {
    type Value = TestValue;
    type Disk = ();
}

pub(crate) struct TestValue {
    pub tag: String,
    pub size: i64,
    /// Unique per materialization, so tests can tell a cached hit from a
    /// re-fetch.
    pub serial: u64,
}

impl TestValue {
    pub(crate) fn new(tag: &str, size: i64) -> Self {
        TestValue {
            tag: tag.to_string(),
            size,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FlushRecord {
    pub key: BlockNum,
    pub tag: String,
    pub write: bool,
    pub keep: bool,
    pub for_checkpoint: bool,
    pub is_clone: bool,
}

/// Per-pair callbacks that record every flush and clean invocation.
pub(crate) struct TestCallbacks {
    pub flushes: Mutex<Vec<FlushRecord>>,
    pub cleaned: Mutex<Vec<BlockNum>>,
    pub pe_cost: PartialEvictionCost,
    pub pe_estimate: i64,
    /// When set, a partial eviction halves the attribute size.
    pub pe_shrink: bool,
    pub clone_supported: bool,
}

impl Default for TestCallbacks {
    fn default() -> Self {
        TestCallbacks {
            flushes: Mutex::new(Vec::new()),
            cleaned: Mutex::new(Vec::new()),
            pe_cost: PartialEvictionCost::Expensive,
            pe_estimate: 0,
            pe_shrink: false,
            clone_supported: false,
        }
    }
}

impl TestCallbacks {
    pub(crate) fn writes(&self) -> Vec<FlushRecord> {
        self.flushes.lock().iter().filter(|r| r.write).cloned().collect()
    }

    pub(crate) fn frees(&self) -> Vec<FlushRecord> {
        self.flushes
            .lock()
            .iter()
            .filter(|r| !r.write && !r.keep)
            .cloned()
            .collect()
    }
}

impl PairCallbacks<TestClient> for TestCallbacks {
    fn flush(&self, args: FlushArgs<'_, TestClient>) -> Option<PairAttr> {
        let (tag, keep) = match &args.value {
            FlushValue::Keep(v) => (v.tag.clone(), true),
            FlushValue::Evict(v) => (v.tag.clone(), false),
        };
        self.flushes.lock().push(FlushRecord {
            key: args.key,
            tag,
            write: args.write,
            keep,
            for_checkpoint: args.for_checkpoint,
            is_clone: args.is_clone,
        });
        None
    }

    fn partial_eviction_estimate(
        &self,
        _value: &TestValue,
        _disk: Option<&()>,
    ) -> (i64, PartialEvictionCost) {
        (self.pe_estimate, self.pe_cost)
    }

    fn partial_eviction(&self, value: &mut TestValue, old_attr: PairAttr) -> PairAttr {
        if self.pe_shrink {
            value.size = old_attr.size / 2;
            PairAttr::new(value.size)
        } else {
            old_attr
        }
    }

    fn cleaner(
        &self,
        table: &CacheTable<TestClient>,
        pin: PairPin<TestClient>,
    ) -> Result<()> {
        self.cleaned.lock().push(pin.key());
        // cleaning resolves the pressure
        let mut attr = pin.attr();
        attr.cache_pressure_size = 0;
        table.unpin_no_flush(pin, Dirty::Clean, attr);
        Ok(())
    }

    fn can_clone(&self) -> bool {
        self.clone_supported
    }

    fn clone_for_checkpoint(&self, value: &mut TestValue) -> (TestValue, PairAttr) {
        (
            TestValue::new(&value.tag, value.size),
            PairAttr::new(value.size),
        )
    }
}

/// Fetch callbacks producing a fixed payload, counting invocations.
pub(crate) struct TestFetch {
    pub tag: String,
    pub size: i64,
    pub dirty: Dirty,
    pub fetch_count: AtomicU64,
    pub partial_fetch_count: AtomicU64,
}

impl TestFetch {
    pub(crate) fn new(tag: &str, size: i64, dirty: Dirty) -> Arc<Self> {
        Arc::new(TestFetch {
            tag: tag.to_string(),
            size,
            dirty,
            fetch_count: AtomicU64::new(0),
            partial_fetch_count: AtomicU64::new(0),
        })
    }

    pub(crate) fn fetches(&self) -> u64 {
        self.fetch_count.load(Ordering::Relaxed)
    }
}

impl FetchCallbacks<TestClient> for TestFetch {
    fn fetch(
        &self,
        _file: &Arc<CacheFile<TestClient>>,
        _key: BlockNum,
        _fullhash: u32,
    ) -> Result<FetchedValue<TestClient>> {
        self.fetch_count.fetch_add(1, Ordering::Relaxed);
        Ok(FetchedValue {
            value: TestValue::new(&self.tag, self.size),
            disk: None,
            attr: PairAttr::new(self.size),
            dirty: self.dirty,
        })
    }
}

pub(crate) struct TestHarness {
    pub table: Arc<CacheTable<TestClient>>,
    pub file: Arc<CacheFile<TestClient>>,
    _dir: TempDir,
}

impl TestHarness {
    pub(crate) fn close(self) {
        self.table.close().unwrap();
    }
}

pub(crate) fn harness(size_limit: u64) -> TestHarness {
    let dir = TempDir::new().unwrap();
    let table = CacheTableConfig::default()
        .size_limit(size_limit)
        .env_dir(dir.path().to_string_lossy().to_string())
        .build::<TestClient>(None)
        .unwrap();
    let file = table.open_file("test.db").unwrap();
    TestHarness {
        table,
        file,
        _dir: dir,
    }
}

pub(crate) fn dyn_callbacks(cbs: TestCallbacks) -> (Arc<TestCallbacks>, Arc<dyn PairCallbacks<TestClient>>) {
    let concrete = Arc::new(cbs);
    let erased: Arc<dyn PairCallbacks<TestClient>> = Arc::clone(&concrete) as _;
    (concrete, erased)
}

pub(crate) fn dyn_fetch(fetch: &Arc<TestFetch>) -> Arc<dyn FetchCallbacks<TestClient>> {
    Arc::clone(fetch) as _
}
