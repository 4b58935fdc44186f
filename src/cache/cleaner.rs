//! Background cleaner: periodically selects high-cache-pressure pairs and
//! invokes their cleaner callback.

use crate::cache::callbacks::CacheClient;
use crate::cache::pair::{INVALID_ID, Pair, PairPin};
use crate::cache::table::CacheTable;
use crate::error::Result;
use crate::thread::Minicron;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Pairs examined per probe before committing to the best candidate.
const CLEANER_N_TO_CHECK: usize = 8;

pub(crate) struct Cleaner {
    iterations: AtomicU32,
    cron: Minicron,
}

impl Cleaner {
    pub(crate) fn new(iterations: u32) -> Self {
        Cleaner {
            iterations: AtomicU32::new(iterations),
            cron: Minicron::new(),
        }
    }

    pub(crate) fn start<C: CacheClient>(table: &Arc<CacheTable<C>>, period: Duration) {
        let t = Arc::clone(table);
        table.cl.cron.start("CacheCleaner", period, move || {
            t.cl.run_cleaner(&t).expect("cleaner callback failed");
        });
    }

    pub(crate) fn destroy(&self) {
        self.cron.shutdown();
    }

    #[inline]
    pub(crate) fn iterations(&self) -> u32 {
        self.iterations.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_iterations(&self, iterations: u32) {
        self.iterations.store(iterations, Ordering::Release);
    }

    #[inline]
    pub(crate) fn period(&self) -> Duration {
        self.cron.period()
    }

    #[inline]
    pub(crate) fn set_period(&self, period: Duration) {
        self.cron.change_period(period);
    }

    /// One cleaner run: `iterations` probes, each scanning up to
    /// `CLEANER_N_TO_CHECK` pairs from the cleaner cursor and cleaning
    /// the one with the greatest cache pressure.
    pub(crate) fn run_cleaner<C: CacheClient>(&self, table: &CacheTable<C>) -> Result<()> {
        let num_iterations = self.iterations();
        for _ in 0..num_iterations {
            table
                .stats
                .cleaner_executions
                .fetch_add(1, Ordering::Relaxed);

            let best: Option<Arc<Pair<C>>> = {
                let list = table.list.list.read();
                let first = list.cleaner_head_id();
                if first == INVALID_ID {
                    // nothing in the cachetable
                    return Ok(());
                }
                let mut best: Option<(Arc<Pair<C>>, i64)> = None;
                let mut n_seen = 0usize;
                loop {
                    let p = match list.cleaner_step() {
                        Some(p) => p,
                        None => break,
                    };
                    {
                        let st = p.state.lock();
                        // Skip pairs in use. A pair at zero pressure must
                        // never be picked: rollback and leaf nodes keep
                        // themselves out that way, and unpin_and_remove
                        // zeroes the field to fend the cleaner off.
                        if p.value_lock.users() == 0 {
                            n_seen += 1;
                            let score = st.attr.cache_pressure_size;
                            let best_score = best.as_ref().map(|(_, s)| *s).unwrap_or(0);
                            if score > best_score {
                                best = Some((Arc::clone(&p), score));
                            }
                        }
                    }
                    if list.cleaner_head_id() == first || n_seen >= CLEANER_N_TO_CHECK {
                        break;
                    }
                }
                best.map(|(p, _)| p)
            };

            let best = match best {
                Some(best) => best,
                // An empty round now will likely be an empty round again;
                // wait for the next cron firing.
                None => return Ok(()),
            };

            let cf = Arc::clone(best.file());
            // A rejected job means the cachefile is flushing; this
            // iteration becomes a no-op.
            if cf.bjm.add_background_job().is_err() {
                continue;
            }
            {
                let mut st = best.state.lock();
                if best.value_lock.users() > 0 {
                    // pinned since the scan; stay non-blocking
                    drop(st);
                    cf.bjm.remove_background_job();
                    continue;
                }
                best.value_lock.lock(&mut st);
            }
            let pending = table.get_checkpoint_pending(&best);
            if pending {
                table.write_pair_for_checkpoint(&best, true);
            }

            // Writing for checkpoint (or a concurrent removal) may have
            // taken the pressure to zero, in which case there is nothing
            // left to do.
            let still_pressured = best.state.lock().attr.cache_pressure_size > 0;
            if still_pressured {
                let pin = PairPin::new(Arc::clone(&best));
                // the callback owns the pin and must release it
                let res = best.callbacks.cleaner(table, pin);
                cf.bjm.remove_background_job();
                res?;
            } else {
                let mut st = best.state.lock();
                best.value_lock.unlock(&mut st);
                drop(st);
                cf.bjm.remove_background_job();
            }
        }
        Ok(())
    }
}
