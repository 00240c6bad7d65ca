//! Packed commit tickets and the bounded commit ring.
//!
//! Every committed write transaction is identified by a [`Ticket`]: one
//! machine word packing a monotonically increasing sequence number, the
//! committing thread id, and the index of the transaction slot holding that
//! commit's redo log. The sequence component totally orders commits; the
//! (tid, slot) components let a stale replica locate the redo log it is
//! missing.
//!
//! The header's published current-replica word reuses the same packing with
//! one twist: its index field holds the *replica index* the commit made
//! current, not a slot. The slot-bearing form of the same commit lives in
//! the ring and in the replica's head.
//!
//! ## Ring
//!
//! `CommitRing` maps `sequence % RING_SIZE` to the ticket that committed
//! that sequence. Writers advance it best-effort with a CAS after
//! publishing (Michael-&-Scott style: if the CAS is lost, a newer entry
//! already recorded it). Catch-up replayers walk the ring to find, for each
//! missed sequence, the slot whose log to replay; a miss (entry evicted by
//! wrap-around) demotes the replayer to a full replica copy.

use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// Packing layout
// ---------------------------------------------------------------------------

/// Bits for the commit sequence. 2^44 commits before wrap.
const SEQ_BITS: u32 = 44;
/// Bits for the committing thread id.
const TID_BITS: u32 = 8;
/// Bits for the transaction-slot index.
const IDX_BITS: u32 = 12;

const _: () = assert!(SEQ_BITS + TID_BITS + IDX_BITS == 64);

/// Capacity of the commit ring. Must be addressable by `IDX_BITS`-sized
/// history; a sequence older than `RING_SIZE` commits is unrecoverable by
/// replay and forces a copy.
pub const RING_SIZE: usize = 4096;

/// A packed `sequence : thread id : slot index` commit token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(pub u64);

impl Ticket {
    /// The all-zero ticket: sequence 0, thread 0, slot 0. This is the value
    /// of the header's current-replica word in a freshly initialized region.
    pub const ZERO: Ticket = Ticket(0);

    /// Sentinel stored in a replica's head meaning "never initialized,
    /// requires a full copy before use". Encoded as (seq 0, tid 1, slot 0),
    /// which no real commit can produce: real tickets start at sequence 1.
    pub const NEEDS_COPY: Ticket = Ticket::pack(0, 1, 0);

    /// Pack the three components into one word.
    #[must_use]
    pub const fn pack(seq: u64, tid: usize, slot: usize) -> Ticket {
        Ticket((seq << (TID_BITS + IDX_BITS)) | ((tid as u64) << IDX_BITS) | slot as u64)
    }

    /// The commit sequence number.
    #[must_use]
    pub const fn seq(self) -> u64 {
        self.0 >> (TID_BITS + IDX_BITS)
    }

    /// The committing thread id.
    #[must_use]
    pub const fn tid(self) -> usize {
        ((self.0 >> IDX_BITS) & ((1 << TID_BITS) - 1)) as usize
    }

    /// The transaction-slot index within the committing thread's slot array.
    #[must_use]
    pub const fn slot(self) -> usize {
        (self.0 & ((1 << IDX_BITS) - 1)) as usize
    }
}

// ---------------------------------------------------------------------------
// CommitRing
// ---------------------------------------------------------------------------

/// Bounded ring of the most recent `RING_SIZE` commit tickets.
pub struct CommitRing {
    slots: Box<[AtomicU64]>,
}

impl CommitRing {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: (0..RING_SIZE).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Ticket recorded for `seq`, which is only meaningful if its sequence
    /// component equals `seq` (otherwise the entry was evicted or not yet
    /// advanced).
    #[must_use]
    pub fn get(&self, seq: u64) -> Ticket {
        Ticket(self.slots[(seq as usize) % RING_SIZE].load(Ordering::Acquire))
    }

    /// Best-effort advance: record `ticket` as the commit for its own
    /// sequence, expecting to replace `prev`. Losing the race is fine — the
    /// winner recorded a ticket for the same or a newer sequence.
    pub fn advance(&self, prev: Ticket, ticket: Ticket) {
        let _ = self.slots[(ticket.seq() as usize) % RING_SIZE].compare_exchange(
            prev.0,
            ticket.0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

impl Default for CommitRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_roundtrip() {
        let t = Ticket::pack(123_456, 37, 1029);
        assert_eq!(t.seq(), 123_456);
        assert_eq!(t.tid(), 37);
        assert_eq!(t.slot(), 1029);
    }

    #[test]
    fn sequences_order_tickets() {
        // Sequence occupies the high bits, so the natural u64 order on
        // tickets is sequence-major.
        let lo = Ticket::pack(5, 255, 4095);
        let hi = Ticket::pack(6, 0, 0);
        assert!(lo < hi);
    }

    #[test]
    fn needs_copy_is_not_a_real_ticket() {
        assert_eq!(Ticket::NEEDS_COPY.seq(), 0);
        assert_ne!(Ticket::NEEDS_COPY, Ticket::ZERO);
    }

    #[test]
    fn ring_advance_is_best_effort() {
        let ring = CommitRing::new();
        let a = Ticket::pack(1, 2, 3);
        ring.advance(Ticket::ZERO, a);
        assert_eq!(ring.get(1), a);

        // A stale CAS (wrong expected value) leaves the winner in place.
        let b = Ticket::pack(1, 9, 9);
        ring.advance(Ticket::ZERO, b);
        assert_eq!(ring.get(1), a);

        // Wrap-around: seq 1 + RING_SIZE lands on the same slot.
        let c = Ticket::pack(1 + RING_SIZE as u64, 4, 5);
        ring.advance(a, c);
        assert_eq!(ring.get(1 + RING_SIZE as u64), c);
        // The old sequence is now unrecoverable.
        assert_ne!(ring.get(1).seq(), 1);
    }
}
