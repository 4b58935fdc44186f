//! Worker pools and the per-file background-job barrier.

use crate::error::{Error, Result};
use crate::thread;
use event_listener::{Event, Listener};
use parking_lot::Mutex;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of named worker threads draining a shared queue.
///
/// Jobs are boxed closures. Shutdown closes the queue, lets the workers
/// drain whatever is already enqueued and joins them.
pub struct WorkerPool {
    tx: Mutex<Option<flume::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: &'static str, n_workers: usize) -> Self {
        let n_workers = n_workers.max(1);
        let (tx, rx) = flume::unbounded::<Job>();
        let mut workers = Vec::with_capacity(n_workers);
        for _ in 0..n_workers {
            let rx = rx.clone();
            workers.push(thread::spawn_named(name, move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            }));
        }
        WorkerPool {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    #[inline]
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let g = self.tx.lock();
        match &*g {
            Some(tx) => tx.send(Box::new(job)).map_err(|_| Error::SendError),
            None => Err(Error::SendError),
        }
    }

    /// Closes the queue and joins all workers. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut g = self.tx.lock();
            *g = None;
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            handle.join().unwrap();
        }
    }
}

struct BjmState {
    num_jobs: u64,
    accepting: bool,
}

/// Reference count with a drain condition, used as a barrier for safe
/// cachefile close and for checkpoint clone write-back.
///
/// `add_background_job` fails once `wait_for_jobs` has started draining;
/// `reset` re-enables admission after a flush cycle.
pub struct BackgroundJobManager {
    state: Mutex<BjmState>,
    drained: Event,
}

impl BackgroundJobManager {
    #[inline]
    pub fn new() -> Self {
        BackgroundJobManager {
            state: Mutex::new(BjmState {
                num_jobs: 0,
                accepting: true,
            }),
            drained: Event::new(),
        }
    }

    #[inline]
    pub fn add_background_job(&self) -> Result<()> {
        let mut g = self.state.lock();
        if !g.accepting {
            return Err(Error::FileClosing);
        }
        g.num_jobs += 1;
        Ok(())
    }

    #[inline]
    pub fn remove_background_job(&self) {
        let mut g = self.state.lock();
        assert!(g.num_jobs > 0);
        g.num_jobs -= 1;
        if g.num_jobs == 0 {
            self.drained.notify(usize::MAX);
        }
    }

    /// Stops admission and blocks until all outstanding jobs complete.
    pub fn wait_for_jobs(&self) {
        loop {
            let listener = {
                let mut g = self.state.lock();
                g.accepting = false;
                if g.num_jobs == 0 {
                    return;
                }
                self.drained.listen()
            };
            listener.wait();
        }
    }

    /// Re-enables admission. Requires no jobs outstanding.
    #[inline]
    pub fn reset(&self) {
        let mut g = self.state.lock();
        assert!(g.num_jobs == 0);
        g.accepting = true;
    }

    #[inline]
    pub fn num_jobs(&self) -> u64 {
        self.state.lock().num_jobs
    }
}

impl Default for BackgroundJobManager {
    #[inline]
    fn default() -> Self {
        BackgroundJobManager::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_worker_pool_runs_jobs() {
        let pool = WorkerPool::new("TestWorker", 4);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let c = Arc::clone(&count);
            pool.execute(move || {
                c.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(count.load(Ordering::Relaxed), 100);
        assert!(pool.execute(|| {}).is_err());
    }

    #[test]
    fn test_bjm_wait_for_jobs_drains() {
        let bjm = Arc::new(BackgroundJobManager::new());
        bjm.add_background_job().unwrap();
        bjm.add_background_job().unwrap();
        let bjm2 = Arc::clone(&bjm);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            bjm2.remove_background_job();
            std::thread::sleep(Duration::from_millis(20));
            bjm2.remove_background_job();
        });
        bjm.wait_for_jobs();
        assert_eq!(bjm.num_jobs(), 0);
        // Draining closed the manager for new jobs.
        assert!(bjm.add_background_job().is_err());
        bjm.reset();
        assert!(bjm.add_background_job().is_ok());
        bjm.remove_background_job();
        handle.join().unwrap();
    }
}
