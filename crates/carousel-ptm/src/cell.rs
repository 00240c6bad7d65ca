//! Typed storage cells over replica-relative offsets.
//!
//! Persistent values are never raw machine pointers. A location in the
//! persistent heap is a [`HeapOffset`] relative to *whichever replica the
//! active transaction is bound to*; the translation to a mapped address
//! happens in exactly one place (the transaction scope's [`WordAccess`]
//! implementation). That makes the synthetic-pointer rebase an explicit,
//! testable operation: a value stored while one replica was current reads
//! back correctly through any other replica, because only offsets persist.
//!
//! - [`PWord`]: values codable as one 64-bit word.
//! - [`PPtr<T>`]: a typed synthetic pointer (offset of a heap allocation).
//! - [`PCell<T>`]: a typed view of one word at a fixed heap offset; every
//!   `store` is interposed by the active write transaction (logged into its
//!   redo log, coalesced, and write-back deferred), every `load` is
//!   redirected to the bound replica.

use std::marker::PhantomData;

/// A byte offset inside a replica heap.
pub type HeapOffset = u64;

/// Word-granular access to the heap of the replica a transaction is bound
/// to. Implemented by the engine's transaction scope (logged stores) and by
/// plain test heaps.
pub trait WordAccess {
    /// Read the 8-byte word at `off`.
    fn load_word(&self, off: HeapOffset) -> u64;
    /// Write the 8-byte word at `off`. Write transactions interpose this
    /// with redo logging; read transactions must not be asked to store.
    fn store_word(&self, off: HeapOffset, val: u64);
    /// Bytes in one replica heap.
    fn heap_size(&self) -> u64;
}

/// Values representable as a single persistent word.
pub trait PWord: Copy {
    fn to_word(self) -> u64;
    fn from_word(word: u64) -> Self;
}

impl PWord for u64 {
    fn to_word(self) -> u64 {
        self
    }
    fn from_word(word: u64) -> Self {
        word
    }
}

impl PWord for i64 {
    fn to_word(self) -> u64 {
        self as u64
    }
    fn from_word(word: u64) -> Self {
        word as i64
    }
}

impl PWord for bool {
    fn to_word(self) -> u64 {
        u64::from(self)
    }
    fn from_word(word: u64) -> Self {
        word != 0
    }
}

// ---------------------------------------------------------------------------
// PPtr
// ---------------------------------------------------------------------------

/// A typed synthetic pointer: the heap offset of an allocation's user data,
/// or null (offset 0 — the allocator never hands out offset 0, it is the
/// pool-top word).
pub struct PPtr<T> {
    off: HeapOffset,
    _marker: PhantomData<*const T>,
}

// PhantomData<*const T> suppresses auto-derive; a PPtr is just an offset.
impl<T> Clone for PPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for PPtr<T> {}
impl<T> PartialEq for PPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.off == other.off
    }
}
impl<T> Eq for PPtr<T> {}
impl<T> std::fmt::Debug for PPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PPtr({:#x})", self.off)
    }
}

unsafe impl<T> Send for PPtr<T> {}
unsafe impl<T> Sync for PPtr<T> {}

impl<T> PPtr<T> {
    /// The null pointer.
    #[must_use]
    pub const fn null() -> Self {
        Self {
            off: 0,
            _marker: PhantomData,
        }
    }

    /// Wrap a user-data offset returned by the allocator.
    #[must_use]
    pub const fn from_offset(off: HeapOffset) -> Self {
        Self {
            off,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub const fn offset(self) -> HeapOffset {
        self.off
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.off == 0
    }

    /// Typed view of the `index`-th word of the pointee.
    #[must_use]
    pub const fn word<V: PWord>(self, index: u64) -> PCell<V> {
        PCell::at(self.off + index * 8)
    }
}

impl<T> PWord for PPtr<T> {
    fn to_word(self) -> u64 {
        self.off
    }
    fn from_word(word: u64) -> Self {
        Self::from_offset(word)
    }
}

// ---------------------------------------------------------------------------
// PCell
// ---------------------------------------------------------------------------

/// A typed view of one persistent word.
pub struct PCell<T: PWord> {
    off: HeapOffset,
    _marker: PhantomData<*const T>,
}

impl<T: PWord> Clone for PCell<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: PWord> Copy for PCell<T> {}

unsafe impl<T: PWord> Send for PCell<T> {}
unsafe impl<T: PWord> Sync for PCell<T> {}

impl<T: PWord> PCell<T> {
    /// A cell at a fixed heap offset (must be 8-aligned).
    #[must_use]
    pub const fn at(off: HeapOffset) -> Self {
        Self {
            off,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub const fn offset(self) -> HeapOffset {
        self.off
    }

    /// Load through the transaction's bound replica.
    #[must_use]
    pub fn load(self, tx: &impl WordAccess) -> T {
        T::from_word(tx.load_word(self.off))
    }

    /// Store through the transaction: logged, coalesced, flush-deferred.
    pub fn store(self, tx: &impl WordAccess, val: T) {
        tx.store_word(self.off, val.to_word());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;

    /// A plain in-memory heap for unit-testing word consumers.
    pub(crate) struct VecHeap(pub RefCell<Vec<u64>>);

    impl VecHeap {
        pub(crate) fn new(words: usize) -> Self {
            Self(RefCell::new(vec![0; words]))
        }
    }

    impl WordAccess for VecHeap {
        fn load_word(&self, off: HeapOffset) -> u64 {
            self.0.borrow()[(off / 8) as usize]
        }
        fn store_word(&self, off: HeapOffset, val: u64) {
            self.0.borrow_mut()[(off / 8) as usize] = val;
        }
        fn heap_size(&self) -> u64 {
            (self.0.borrow().len() * 8) as u64
        }
    }

    #[test]
    fn cells_roundtrip_words() {
        let heap = VecHeap::new(16);
        let a: PCell<u64> = PCell::at(0);
        let b: PCell<i64> = PCell::at(8);
        let c: PCell<bool> = PCell::at(16);
        a.store(&heap, 0xFEED);
        b.store(&heap, -5);
        c.store(&heap, true);
        assert_eq!(a.load(&heap), 0xFEED);
        assert_eq!(b.load(&heap), -5);
        assert!(c.load(&heap));
    }

    #[test]
    fn pointers_are_offsets() {
        struct Node;
        let heap = VecHeap::new(16);
        let p: PPtr<Node> = PPtr::from_offset(32);
        assert!(!p.is_null());
        assert!(PPtr::<Node>::null().is_null());

        // Store a pointer in a cell and chase it.
        let link: PCell<PPtr<Node>> = PCell::at(0);
        link.store(&heap, p);
        let chased = link.load(&heap);
        assert_eq!(chased, p);
        chased.word::<u64>(2).store(&heap, 77);
        assert_eq!(heap.load_word(32 + 16), 77);
    }
}
