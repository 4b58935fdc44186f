use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[inline]
pub fn spawn_named<S, F>(name: S, f: F) -> JoinHandle<()>
where
    String: From<S>,
    F: FnOnce() + Send + 'static,
{
    let thread_name = String::from(name);
    thread::Builder::new()
        .name(thread_name)
        .spawn(|| {
            let thd = thread::current();
            eprintln!(
                "thread[{:?}:{}] started",
                thd.id(),
                thd.name().unwrap_or("unknown")
            );
            f();
            eprintln!(
                "thread[{:?}:{}] finished",
                thd.id(),
                thd.name().unwrap_or("unknown")
            );
        })
        .unwrap()
}

struct CronState {
    period: Duration,
    shutdown: bool,
}

/// Periodic background thread driver shared by the cleaner and the
/// checkpointer.
///
/// The job runs once per period. A zero period parks the thread until the
/// period is changed or the cron is shut down; changing the period takes
/// effect at the next wakeup.
pub struct Minicron {
    state: Arc<(Mutex<CronState>, Condvar)>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Minicron {
    #[inline]
    pub fn new() -> Self {
        Minicron {
            state: Arc::new((
                Mutex::new(CronState {
                    period: Duration::ZERO,
                    shutdown: false,
                }),
                Condvar::new(),
            )),
            handle: Mutex::new(None),
        }
    }

    /// Starts the cron thread. Must be called at most once.
    pub fn start<F>(&self, name: &'static str, period: Duration, mut job: F)
    where
        F: FnMut() + Send + 'static,
    {
        {
            let mut g = self.state.0.lock();
            g.period = period;
        }
        let state = Arc::clone(&self.state);
        let handle = spawn_named(name, move || {
            let (mu, cond) = &*state;
            let mut g = mu.lock();
            loop {
                if g.shutdown {
                    return;
                }
                if g.period.is_zero() {
                    cond.wait(&mut g);
                    continue;
                }
                let deadline = Instant::now() + g.period;
                let timed_out = cond.wait_until(&mut g, deadline).timed_out();
                if g.shutdown {
                    return;
                }
                // Signals only adjust the schedule; the job runs on timeout.
                if timed_out {
                    drop(g);
                    job();
                    g = mu.lock();
                }
            }
        });
        let mut h = self.handle.lock();
        debug_assert!(h.is_none());
        *h = Some(handle);
    }

    #[inline]
    pub fn period(&self) -> Duration {
        self.state.0.lock().period
    }

    #[inline]
    pub fn change_period(&self, period: Duration) {
        let mut g = self.state.0.lock();
        g.period = period;
        self.state.1.notify_one();
    }

    #[inline]
    pub fn has_been_shutdown(&self) -> bool {
        self.state.0.lock().shutdown
    }

    /// Stops the cron thread and joins it. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut g = self.state.0.lock();
            g.shutdown = true;
            self.state.1.notify_one();
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.join().unwrap();
        }
    }
}

impl Default for Minicron {
    #[inline]
    fn default() -> Self {
        Minicron::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_minicron_fires_periodically() {
        let count = Arc::new(AtomicUsize::new(0));
        let cron = Minicron::new();
        let c = Arc::clone(&count);
        cron.start("TestCron", Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        std::thread::sleep(Duration::from_millis(120));
        cron.shutdown();
        assert!(count.load(Ordering::Relaxed) >= 2);
        assert!(cron.has_been_shutdown());
    }

    #[test]
    fn test_minicron_zero_period_parks() {
        let count = Arc::new(AtomicUsize::new(0));
        let cron = Minicron::new();
        let c = Arc::clone(&count);
        cron.start("ParkedCron", Duration::ZERO, move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::Relaxed), 0);
        // Enabling a period wakes the thread up.
        cron.change_period(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(60));
        cron.shutdown();
        assert!(count.load(Ordering::Relaxed) >= 1);
    }
}
