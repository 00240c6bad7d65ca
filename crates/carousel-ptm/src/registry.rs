//! Thread registry: small dense ids for per-thread engine arrays.
//!
//! Every thread that enters a transaction is assigned the lowest free id in
//! `0..MAX_THREADS`. The id indexes the engine's announce/enqueue arrays and
//! the flat-combining scoreboards, so ids must stay dense and small. A
//! thread-local guard deregisters the id automatically at thread exit,
//! after which it may be reused.
//!
//! The registry is process-wide: ids only ever bound scans of per-engine
//! arrays, so sharing one id space between engines is harmless and keeps
//! registration a single thread-local lookup.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use carousel_error::{PtmError, PtmResult};

/// Hard cap on concurrently registered threads. Must fit the ticket's
/// tid field and the per-slot scoreboard arrays.
pub const MAX_THREADS: usize = 64;

struct Registry {
    used: [AtomicBool; MAX_THREADS],
    /// High-water mark of `id + 1` over all registrations, bounding scans.
    max_threads: AtomicUsize,
}

static REGISTRY: Registry = Registry {
    used: [const { AtomicBool::new(false) }; MAX_THREADS],
    max_threads: AtomicUsize::new(0),
};

impl Registry {
    fn register(&self) -> PtmResult<usize> {
        for tid in 0..MAX_THREADS {
            if self.used[tid]
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.max_threads.fetch_max(tid + 1, Ordering::AcqRel);
                return Ok(tid);
            }
        }
        Err(PtmError::TooManyThreads { cap: MAX_THREADS })
    }

    fn deregister(&self, tid: usize) {
        self.used[tid].store(false, Ordering::Release);
    }
}

/// High-water mark of concurrently registered ids. Per-thread scans iterate
/// `0..max_threads()` instead of `0..MAX_THREADS`.
#[must_use]
pub fn max_threads() -> usize {
    REGISTRY.max_threads.load(Ordering::Acquire)
}

struct TidGuard {
    tid: Cell<Option<usize>>,
}

impl Drop for TidGuard {
    fn drop(&mut self) {
        if let Some(tid) = self.tid.get() {
            REGISTRY.deregister(tid);
        }
    }
}

thread_local! {
    static TID: TidGuard = const { TidGuard { tid: Cell::new(None) } };
}

/// The calling thread's dense id, registering it on first use.
/// Idempotent per live thread; the id is released at thread exit.
pub fn current_tid() -> PtmResult<usize> {
    TID.with(|guard| match guard.tid.get() {
        Some(tid) => Ok(tid),
        None => {
            let tid = REGISTRY.register()?;
            guard.tid.set(Some(tid));
            Ok(tid)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn same_thread_gets_same_id() {
        let a = current_tid().unwrap();
        let b = current_tid().unwrap();
        assert_eq!(a, b);
        assert!(max_threads() > a);
    }

    #[test]
    fn exited_threads_release_their_ids() {
        // The registry is process-wide and other tests register
        // concurrently, so exact id reuse cannot be asserted. Instead,
        // spawn-and-join a full cap's worth of threads sequentially: each
        // must register, which is only possible if exited threads' ids are
        // recycled rather than leaked.
        for _ in 0..MAX_THREADS {
            let tid = thread::spawn(|| current_tid().unwrap()).join().unwrap();
            assert!(tid < MAX_THREADS);
        }
    }

    #[test]
    fn concurrent_registrations_are_distinct() {
        let ids: Vec<usize> = {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    thread::spawn(|| {
                        let tid = current_tid().unwrap();
                        // Hold the id long enough to overlap with peers.
                        thread::sleep(std::time::Duration::from_millis(50));
                        tid
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        };
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), ids.len(), "ids must be unique while live");
    }
}
