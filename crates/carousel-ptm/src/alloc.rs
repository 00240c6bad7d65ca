//! Power-of-two free-list allocator living *inside* each replica heap.
//!
//! All allocator state — the pool top, the free-list heads, the root-pointer
//! directory — is stored in the replica heap itself, at fixed offsets below
//! [`ALLOC_START`]. Every mutation goes through the transaction's
//! [`WordAccess`], so allocation and free are transactional like any other
//! store: an aborted transaction rolls its allocator effects back with its
//! redo-log suffix, and a published transaction carries them to the other
//! replicas through the log like everything else.
//!
//! Layout of the metadata region (byte offsets into the replica heap):
//!
//! | offset               | contents                                      |
//! |----------------------|-----------------------------------------------|
//! | 0                    | pool top (first never-allocated byte)         |
//! | 8                    | free-list heads, one word per size class      |
//! | [`ROOTS_OFF`]        | root-pointer directory, [`ROOT_SLOTS`] words  |
//! | [`ALLOC_START`]      | first allocatable byte (64-aligned)           |
//!
//! Blocks are sized in powers of two from 2^[`CLASS_MIN`] (32 bytes) up to
//! 2^[`CLASS_MAX`]. Each block starts with a 16-byte header
//! `{ next_free_block, class_exponent }`; the offset handed to callers is
//! the first byte past the header, so user data is always 16-aligned and
//! never at offset 0 — offset 0 stays a valid null.
//!
//! Freed blocks are pushed onto the head of their class list and reused
//! exactly at their size; there is no splitting or coalescing of classes,
//! so the pool top is a stable high-water mark: a workload that frees what
//! it allocates never grows the used prefix.

use carousel_error::TxAbort;

use crate::cell::{HeapOffset, WordAccess};

/// Smallest size class, as an exponent: 2^5 = 32 bytes (16-byte header plus
/// at least two user words).
pub const CLASS_MIN: u32 = 5;
/// Largest size class exponent.
pub const CLASS_MAX: u32 = 52;
/// Number of size classes.
pub const NUM_CLASSES: usize = (CLASS_MAX - CLASS_MIN + 1) as usize;

/// Byte offset of the pool-top word.
pub const TOP_OFF: HeapOffset = 0;
/// Byte offset of the first free-list head word.
pub const FREELISTS_OFF: HeapOffset = 8;
/// Byte offset of the root-pointer directory.
pub const ROOTS_OFF: HeapOffset = FREELISTS_OFF + 8 * NUM_CLASSES as u64;
/// Number of root-pointer slots.
pub const ROOT_SLOTS: usize = 64;
/// First allocatable byte. 64-aligned so the first block header starts on
/// a cache line.
pub const ALLOC_START: HeapOffset = (ROOTS_OFF + 8 * ROOT_SLOTS as u64).next_multiple_of(64);

/// Bytes of per-block header preceding user data.
const HEADER_BYTES: u64 = 16;

const _: () = assert!(ROOTS_OFF == 392);
const _: () = assert!(ALLOC_START == 960);

/// Zero the allocator metadata and point the pool top at [`ALLOC_START`].
/// Runs once, inside the bootstrap transaction of a fresh store.
pub fn init(tx: &impl WordAccess) {
    tx.store_word(TOP_OFF, ALLOC_START);
    for class in 0..NUM_CLASSES {
        tx.store_word(FREELISTS_OFF + 8 * class as u64, 0);
    }
    for slot in 0..ROOT_SLOTS {
        tx.store_word(ROOTS_OFF + 8 * slot as u64, 0);
    }
}

/// Size class exponent for a request of `bytes` of user data.
fn class_for(bytes: u64) -> Option<u32> {
    let total = bytes.checked_add(HEADER_BYTES)?;
    let exp = if total <= 1 {
        1
    } else {
        64 - (total - 1).leading_zeros()
    };
    let exp = exp.max(CLASS_MIN);
    (exp <= CLASS_MAX).then_some(exp)
}

/// Allocate `bytes` of user data, returning its heap offset.
///
/// Reuses the head of the matching free list when one is available,
/// otherwise bumps the pool top. Fails with [`TxAbort::HeapExhausted`] when
/// the request is unserviceable or the heap is full; the engine undoes the
/// transaction's logged effects, so a failed allocation leaks nothing.
pub fn alloc(tx: &impl WordAccess, bytes: u64) -> Result<HeapOffset, TxAbort> {
    let exp = class_for(bytes).ok_or(TxAbort::HeapExhausted)?;
    let list = FREELISTS_OFF + 8 * (exp - CLASS_MIN) as u64;

    let head = tx.load_word(list);
    if head != 0 {
        // Pop: the block header's first word is the next-free link.
        tx.store_word(list, tx.load_word(head));
        return Ok(head + HEADER_BYTES);
    }

    let top = tx.load_word(TOP_OFF);
    let size = 1u64 << exp;
    if top + size > tx.heap_size() {
        return Err(TxAbort::HeapExhausted);
    }
    tx.store_word(TOP_OFF, top + size);
    tx.store_word(top, 0);
    tx.store_word(top + 8, u64::from(exp));
    Ok(top + HEADER_BYTES)
}

/// Return the allocation at user offset `off` to its size-class free list.
///
/// Panics on an offset that cannot be a live allocation (below the pool,
/// unaligned, or with a mangled block header); the engine reports the
/// transaction as panicked and rolls it back.
pub fn free(tx: &impl WordAccess, off: HeapOffset) {
    assert!(
        off >= ALLOC_START + HEADER_BYTES && off % 8 == 0,
        "freeing a non-block at {off:#x}"
    );
    let block = off - HEADER_BYTES;
    let exp = tx.load_word(block + 8) as u32;
    assert!((CLASS_MIN..=CLASS_MAX).contains(&exp), "freeing a non-block");
    let list = FREELISTS_OFF + 8 * (exp - CLASS_MIN) as u64;
    tx.store_word(block, tx.load_word(list));
    tx.store_word(list, block);
}

/// Bytes of the heap ever touched by the allocator: the prefix `[0, top)`.
/// Replica copies move exactly this much.
#[must_use]
pub fn used_bytes(tx: &impl WordAccess) -> u64 {
    tx.load_word(TOP_OFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::tests::VecHeap;

    fn heap() -> VecHeap {
        let h = VecHeap::new(1024);
        init(&h);
        h
    }

    #[test]
    fn classes_round_up_to_powers_of_two() {
        assert_eq!(class_for(0), Some(CLASS_MIN));
        assert_eq!(class_for(16), Some(CLASS_MIN)); // 16 + header = 32
        assert_eq!(class_for(17), Some(6));
        assert_eq!(class_for(48), Some(6));
        assert_eq!(class_for(49), Some(7));
        assert_eq!(class_for(u64::MAX), None);
        assert_eq!(class_for(1 << 53), None);
    }

    #[test]
    fn fresh_allocations_bump_the_top() {
        let h = heap();
        let a = alloc(&h, 8).unwrap();
        let b = alloc(&h, 8).unwrap();
        assert_eq!(a, ALLOC_START + HEADER_BYTES);
        assert_eq!(b, a + 32);
        assert_eq!(used_bytes(&h), ALLOC_START + 64);
    }

    #[test]
    fn free_then_alloc_reuses_the_block() {
        let h = heap();
        let a = alloc(&h, 100).unwrap();
        let watermark = used_bytes(&h);
        free(&h, a);
        let b = alloc(&h, 100).unwrap();
        assert_eq!(b, a, "same class reuses the freed block");
        assert_eq!(used_bytes(&h), watermark, "high-water mark is stable");
    }

    #[test]
    fn free_list_is_per_class() {
        let h = heap();
        let small = alloc(&h, 8).unwrap();
        free(&h, small);
        // A bigger request must not land on the small block.
        let big = alloc(&h, 200).unwrap();
        assert_ne!(big, small);
        let again = alloc(&h, 8).unwrap();
        assert_eq!(again, small);
    }

    #[test]
    fn churn_does_not_grow_the_heap() {
        let h = heap();
        let first = alloc(&h, 40).unwrap();
        free(&h, first);
        let watermark = used_bytes(&h);
        for _ in 0..1000 {
            let p = alloc(&h, 40).unwrap();
            free(&h, p);
        }
        assert_eq!(used_bytes(&h), watermark);
    }

    #[test]
    #[should_panic(expected = "non-block")]
    fn freeing_below_the_pool_is_refused() {
        let h = heap();
        // Would underflow into the allocator metadata if unchecked.
        free(&h, 8);
    }

    #[test]
    #[should_panic(expected = "non-block")]
    fn freeing_a_mangled_header_is_refused() {
        let h = heap();
        let p = alloc(&h, 8).unwrap();
        h.store_word(p - 8, 0); // stomp the class exponent
        free(&h, p);
    }

    #[test]
    fn exhaustion_aborts() {
        let h = heap(); // 8 KiB heap
        let mut got = Vec::new();
        loop {
            match alloc(&h, 1000) {
                Ok(p) => got.push(p),
                Err(e) => {
                    assert!(matches!(e, TxAbort::HeapExhausted));
                    break;
                }
            }
        }
        assert!(!got.is_empty());
        // Everything freed is allocatable again.
        for p in got.drain(..) {
            free(&h, p);
        }
        assert!(alloc(&h, 1000).is_ok());
    }
}
