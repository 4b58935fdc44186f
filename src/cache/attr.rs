/// Whether a cached page has been modified since it was last written.
///
/// A dirty pair must be whole; only clean pairs may have partial data
/// missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dirty {
    Clean,
    Dirty,
}

/// Cost class reported by the partial-eviction estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialEvictionCost {
    /// Applied synchronously on the evictor thread.
    Cheap,
    /// Dispatched to a worker; only attempted when the estimate is
    /// positive.
    Expensive,
}

/// Size attributes of a cached pair, accounted by the evictor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairAttr {
    pub size: i64,
    pub nonleaf_size: i64,
    pub leaf_size: i64,
    pub rollback_size: i64,
    /// Metric chosen by the upper layer; the cleaner prefers pairs with
    /// the largest values and never picks a pair at zero.
    pub cache_pressure_size: i64,
    pub is_valid: bool,
}

impl PairAttr {
    /// An attribute carrying only a total size.
    #[inline]
    pub fn new(size: i64) -> Self {
        PairAttr {
            size,
            nonleaf_size: 0,
            leaf_size: 0,
            rollback_size: 0,
            cache_pressure_size: 0,
            is_valid: true,
        }
    }

    /// Placeholder attribute for a pair inserted blank before its fetch.
    #[inline]
    pub fn zero() -> Self {
        PairAttr::new(0)
    }

    /// An attribute the accounting code must ignore.
    #[inline]
    pub fn invalid() -> Self {
        PairAttr {
            is_valid: false,
            ..PairAttr::new(0)
        }
    }

    #[inline]
    pub fn cache_pressure(mut self, cache_pressure_size: i64) -> Self {
        self.cache_pressure_size = cache_pressure_size;
        self
    }
}
