//! Reader-indicator shared/exclusive try-lock, one per replica.
//!
//! Each replica carries one of these. Readers mark a per-thread indicator
//! (no shared cache line between readers); a writer claims an owner word
//! and then waits for every indicator to drain. Every acquisition is a
//! *try*: the engine treats contention as "pick another replica / retry",
//! never as blocking, so there is no wait queue.
//!
//! Two extra operations exist for the publication handover (and for seeding
//! the current replica at open): [`RiLock::set_read_lock`] marks the lock
//! shared on behalf of "the readership" without a thread id, and
//! [`RiLock::set_read_unlock`] releases that mark. The publishing writer
//! downgrades its exclusive hold to exactly that state before the header
//! CAS, so readers can pile onto the new current replica immediately while
//! the superseded replica is released once its own mark is lifted.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::registry::MAX_THREADS;

/// Owner word value when no writer holds the lock.
const NO_WRITER: u64 = u64::MAX;

/// Padded per-thread reader indicator (avoids false sharing between
/// reader threads on adjacent indicators).
#[repr(align(128))]
struct Indicator(AtomicU64);

/// Index of the indicator used by `set_read_lock` / `set_read_unlock`.
/// It is past every real thread id, so it never collides.
const HANDOVER: usize = MAX_THREADS;

pub struct RiLock {
    readers: Box<[Indicator]>,
    /// Thread id of the exclusive holder, or `NO_WRITER`.
    writer: AtomicU64,
}

impl RiLock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            readers: (0..=MAX_THREADS).map(|_| Indicator(AtomicU64::new(0))).collect(),
            writer: AtomicU64::new(NO_WRITER),
        }
    }

    /// Try to acquire in shared mode for thread `tid`.
    ///
    /// Strong semantics: the indicator is raised *before* checking for a
    /// writer, so a writer that observed zero readers cannot race past a
    /// reader that observed no writer.
    pub fn shared_try_lock(&self, tid: usize) -> bool {
        self.readers[tid].0.store(1, Ordering::SeqCst);
        if self.writer.load(Ordering::SeqCst) != NO_WRITER {
            self.readers[tid].0.store(0, Ordering::Release);
            return false;
        }
        true
    }

    pub fn shared_unlock(&self, tid: usize) {
        self.readers[tid].0.store(0, Ordering::Release);
    }

    /// Try to acquire exclusively for thread `tid`. Fails if any shared
    /// holder (including the handover mark) or another writer is present.
    pub fn exclusive_try_lock(&self, tid: usize) -> bool {
        if self
            .writer
            .compare_exchange(NO_WRITER, tid as u64, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        for r in self.readers.iter() {
            if r.0.load(Ordering::SeqCst) != 0 {
                self.writer.store(NO_WRITER, Ordering::Release);
                return false;
            }
        }
        true
    }

    pub fn exclusive_unlock(&self) {
        self.writer.store(NO_WRITER, Ordering::Release);
    }

    /// Downgrade an exclusive hold to the shared handover mark.
    pub fn downgrade(&self) {
        self.readers[HANDOVER].0.store(1, Ordering::SeqCst);
        self.writer.store(NO_WRITER, Ordering::Release);
    }

    /// Raise the handover mark directly (used when seeding the current
    /// replica at open, which starts life shared, never exclusive).
    pub fn set_read_lock(&self) {
        self.readers[HANDOVER].0.store(1, Ordering::SeqCst);
    }

    /// Lift the handover mark of a superseded replica.
    pub fn set_read_unlock(&self) {
        self.readers[HANDOVER].0.store(0, Ordering::Release);
    }
}

impl Default for RiLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn shared_excludes_exclusive() {
        let l = RiLock::new();
        assert!(l.shared_try_lock(0));
        assert!(l.shared_try_lock(1), "readers overlap freely");
        assert!(!l.exclusive_try_lock(2));
        l.shared_unlock(0);
        assert!(!l.exclusive_try_lock(2));
        l.shared_unlock(1);
        assert!(l.exclusive_try_lock(2));
        assert!(!l.shared_try_lock(0));
        l.exclusive_unlock();
        assert!(l.shared_try_lock(0));
        l.shared_unlock(0);
    }

    #[test]
    fn downgrade_admits_readers_blocks_writers() {
        let l = RiLock::new();
        assert!(l.exclusive_try_lock(3));
        l.downgrade();
        assert!(l.shared_try_lock(0));
        assert!(!l.exclusive_try_lock(4));
        l.shared_unlock(0);
        l.set_read_unlock();
        assert!(l.exclusive_try_lock(4));
        l.exclusive_unlock();
    }

    #[test]
    fn contended_exclusive_is_single_winner() {
        let l = Arc::new(RiLock::new());
        let mut handles = Vec::new();
        for tid in 0..8 {
            let l = Arc::clone(&l);
            handles.push(thread::spawn(move || u32::from(l.exclusive_try_lock(tid))));
        }
        let winners: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(winners, 1);
    }
}
