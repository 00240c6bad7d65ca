//! Hazard-pointer reclamation for in-flight mutation records.
//!
//! A write transaction publishes its boxed closure in a per-thread announce
//! slot; any combiner may pick it up and execute it on the announcing
//! thread's behalf. The announcing thread later replaces the slot with its
//! next closure, at which point the old box must not be freed while some
//! combiner still holds a reference — the classic reclamation race. This
//! module keeps the protect/retire/scan discipline in one named place
//! instead of ad hoc pointer games inside the engine.
//!
//! Protocol per the original hazard-pointer scheme:
//!
//! - A combiner calls [`HazardDomain::protect`] with the pointer it loaded,
//!   then re-reads the source slot; if unchanged, the object cannot be freed
//!   while the hazard slot holds it.
//! - The owner calls [`HazardDomain::retire`] when unlinking; retirement
//!   scans every thread's hazard slot and frees only unprotected objects,
//!   parking the rest on a per-thread list retried on later retirements.
//! - [`HazardDomain::clear`] drops a thread's protections (wait-free).

use std::sync::atomic::{AtomicPtr, Ordering};

use parking_lot::Mutex;

use crate::registry::MAX_THREADS;

/// One hazard slot per thread is enough for the engine: a combiner protects
/// a single mutation at a time.
#[repr(align(128))]
struct HazardSlot<T>(AtomicPtr<T>);

/// A reclamation domain for objects of type `T` handed around as raw boxes.
pub struct HazardDomain<T> {
    slots: Box<[HazardSlot<T>]>,
    retired: Box<[Mutex<Vec<*mut T>>]>,
}

// Raw pointers to heap boxes are moved between threads only through the
// protect/retire protocol above.
unsafe impl<T: Send> Send for HazardDomain<T> {}
unsafe impl<T: Send> Sync for HazardDomain<T> {}

impl<T> HazardDomain<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_THREADS)
                .map(|_| HazardSlot(AtomicPtr::new(std::ptr::null_mut())))
                .collect(),
            retired: (0..MAX_THREADS).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    /// Publish `ptr` as protected by thread `tid` and return it.
    /// The caller must re-validate its source before dereferencing.
    pub fn protect(&self, tid: usize, ptr: *mut T) -> *mut T {
        self.slots[tid].0.store(ptr, Ordering::SeqCst);
        ptr
    }

    /// Drop thread `tid`'s protection.
    pub fn clear(&self, tid: usize) {
        self.slots[tid].0.store(std::ptr::null_mut(), Ordering::Release);
    }

    /// Retire `ptr`: free it now if no thread protects it, otherwise park it
    /// and retry on the next retirement by this thread.
    pub fn retire(&self, tid: usize, ptr: *mut T) {
        let mut list = self.retired[tid].lock();
        list.push(ptr);
        let mut i = 0;
        while i < list.len() {
            let candidate = list[i];
            if self.is_protected(candidate) {
                i += 1;
            } else {
                list.swap_remove(i);
                // Retired pointers came from Box::into_raw and are unlinked.
                drop(unsafe { Box::from_raw(candidate) });
            }
        }
    }

    fn is_protected(&self, ptr: *mut T) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.0.load(Ordering::SeqCst) == ptr)
    }

    /// Free everything still parked. Only sound once no thread can protect
    /// or dereference domain objects anymore (engine teardown).
    pub fn drain(&self) {
        for list in self.retired.iter() {
            for ptr in list.lock().drain(..) {
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

impl<T> Default for HazardDomain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for HazardDomain<T> {
    fn drop(&mut self) {
        self.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    struct Counted(Arc<AtomicUsize>);
    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn unprotected_retire_frees_immediately() {
        let drops = Arc::new(AtomicUsize::new(0));
        let dom: HazardDomain<Counted> = HazardDomain::new();
        let p = Box::into_raw(Box::new(Counted(Arc::clone(&drops))));
        dom.retire(0, p);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn protection_defers_reclamation() {
        let drops = Arc::new(AtomicUsize::new(0));
        let dom: HazardDomain<Counted> = HazardDomain::new();
        let p = Box::into_raw(Box::new(Counted(Arc::clone(&drops))));

        dom.protect(1, p);
        dom.retire(0, p);
        assert_eq!(drops.load(Ordering::SeqCst), 0, "still protected");

        dom.clear(1);
        // Parked object is retried on the next retirement by thread 0.
        let q = Box::into_raw(Box::new(Counted(Arc::clone(&drops))));
        dom.retire(0, q);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn drain_frees_parked_objects() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let dom: HazardDomain<Counted> = HazardDomain::new();
            let p = Box::into_raw(Box::new(Counted(Arc::clone(&drops))));
            dom.protect(2, p);
            dom.retire(0, p);
            assert_eq!(drops.load(Ordering::SeqCst), 0);
            dom.clear(2);
            // Dropping the domain drains the parked list.
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
