use parking_lot::{Condvar, MutexGuard};
use std::sync::atomic::{AtomicU32, Ordering};

/// Counted single-writer exclusion cooperating with an external companion
/// mutex.
///
/// This is an exclusive lock plus a monitored waiter count and a completion
/// condition. The owner count (`writers`, 0 or 1) and waiter count
/// (`blocked_writers`) are externally inspectable without taking any lock;
/// `users = writers + blocked_writers`. All state transitions happen while
/// the caller holds the companion mutex, whose guard is threaded through
/// `lock`/`unlock`/`wait_for_users`; the condvar waits release and reacquire
/// that same mutex.
///
/// The counters are atomics only so that unsynchronized readers (fast-path
/// contention checks) see a consistent value; they are never used for
/// lock-free transitions.
pub struct NbMutex {
    users: AtomicU32,
    blocked_writers: AtomicU32,
    cond: Condvar,
}

impl NbMutex {
    #[inline]
    pub fn new() -> Self {
        NbMutex {
            users: AtomicU32::new(0),
            blocked_writers: AtomicU32::new(0),
            cond: Condvar::new(),
        }
    }

    /// Total interest in the lock: current owner plus blocked writers.
    #[inline]
    pub fn users(&self) -> u32 {
        self.users.load(Ordering::Acquire)
    }

    /// Number of writers currently holding the lock (0 or 1).
    #[inline]
    pub fn writers(&self) -> u32 {
        self.users() - self.blocked_writers()
    }

    #[inline]
    pub fn blocked_writers(&self) -> u32 {
        self.blocked_writers.load(Ordering::Acquire)
    }

    /// Acquires the lock, blocking on the companion mutex condvar while
    /// another writer owns it. The guard is released and reacquired across
    /// each wait.
    pub fn lock<T>(&self, guard: &mut MutexGuard<'_, T>) {
        self.users.fetch_add(1, Ordering::AcqRel);
        self.blocked_writers.fetch_add(1, Ordering::AcqRel);
        while self.writers() > 0 {
            self.cond.wait(guard);
        }
        // Claim happens with the companion mutex held, so at most one
        // waiter can pass the check before the others re-evaluate it.
        self.blocked_writers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Acquires the lock only if it has no users at all.
    #[inline]
    pub fn try_lock<T>(&self, _guard: &mut MutexGuard<'_, T>) -> bool {
        if self.users() == 0 {
            self.users.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// Releases the lock. Requires the companion mutex to be held.
    #[inline]
    pub fn unlock<T>(&self, _guard: &mut MutexGuard<'_, T>) {
        let prev = self.users.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > self.blocked_writers());
        self.cond.notify_all();
    }

    /// Blocks until nobody owns or waits for the lock.
    pub fn wait_for_users<T>(&self, guard: &mut MutexGuard<'_, T>) {
        while self.users() > 0 {
            self.cond.wait(guard);
        }
    }
}

impl Default for NbMutex {
    #[inline]
    fn default() -> Self {
        NbMutex::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    struct Counter {
        mu: Mutex<()>,
        lock: NbMutex,
        val: std::cell::UnsafeCell<usize>,
    }
    unsafe impl Send for Counter {}
    unsafe impl Sync for Counter {}

    impl Counter {
        fn new() -> Self {
            Counter {
                mu: Mutex::new(()),
                lock: NbMutex::new(),
                val: std::cell::UnsafeCell::new(0),
            }
        }

        fn inc(&self) {
            let mut g = self.mu.lock();
            self.lock.lock(&mut g);
            drop(g);
            // exclusive section, companion mutex released
            unsafe {
                *self.val.get() += 1;
            }
            let mut g = self.mu.lock();
            self.lock.unlock(&mut g);
        }
    }

    #[test]
    fn test_nb_mutex_exclusion() {
        let counter = Arc::new(Counter::new());
        let mut threads = vec![];
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            threads.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    counter.inc();
                }
            }));
        }
        for th in threads {
            th.join().unwrap();
        }
        assert_eq!(unsafe { *counter.val.get() }, 800);
        assert_eq!(counter.lock.users(), 0);
    }

    #[test]
    fn test_nb_mutex_counts_and_try_lock() {
        let counter = Counter::new();
        let mut g = counter.mu.lock();
        assert!(counter.lock.try_lock(&mut g));
        assert_eq!(counter.lock.users(), 1);
        assert_eq!(counter.lock.writers(), 1);
        assert_eq!(counter.lock.blocked_writers(), 0);
        assert!(!counter.lock.try_lock(&mut g));
        counter.lock.unlock(&mut g);
        assert_eq!(counter.lock.users(), 0);
    }

    #[test]
    fn test_nb_mutex_wait_for_users() {
        let counter = Arc::new(Counter::new());
        {
            let mut g = counter.mu.lock();
            assert!(counter.lock.try_lock(&mut g));
        }
        let c2 = Arc::clone(&counter);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            let mut g = c2.mu.lock();
            c2.lock.unlock(&mut g);
        });
        let mut g = counter.mu.lock();
        counter.lock.wait_for_users(&mut g);
        assert_eq!(counter.lock.users(), 0);
        drop(g);
        handle.join().unwrap();
    }
}
