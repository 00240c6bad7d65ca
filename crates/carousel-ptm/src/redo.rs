//! Per-transaction redo logs and the slot scoreboards that publish them.
//!
//! A committing writer records every distinct heap word it (or a closure it
//! combined) modified as a `(address, old, new)` entry. Entries live in
//! fixed-capacity chunks linked into a list that only ever grows; chunks are
//! recycled with the slot, never unlinked, so a concurrent catch-up copier
//! can always walk the chain. Repeated stores to one address are coalesced
//! by a bounded backward scan, so the log grows with distinct modified
//! addresses, not with store count. The scan never crosses the active
//! closure's floor: entries below it belong to other closures combined into
//! the same commit, and an aborting closure's suffix undo must still find
//! them intact.
//!
//! ## Slots
//!
//! Each thread owns [`SLOTS_PER_THREAD`] recyclable [`TxSlot`]s. A slot
//! carries the ticket it will claim, the redo log, and the flat-combining
//! scoreboard: `applied[tid]` / `aborted[tid]` / `results[tid]` for every
//! thread whose announced mutation this commit may absorb. Once the final
//! `log_size` is published the log is immutable for that generation; a
//! catch-up copier validates the slot's ticket before and after copying to
//! detect recycling.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8, Ordering};

use crate::registry::MAX_THREADS;
use crate::ticket::Ticket;

/// Entries per log chunk.
pub const LOG_CHUNK: usize = 64;

/// Recyclable transaction slots per thread. With the commit ring holding
/// `RING_SIZE` tickets, a slot generation is safely reusable long before the
/// ring wraps.
pub const SLOTS_PER_THREAD: usize = 32;

/// How many most-recent entries the coalescing scan inspects. Bounded so a
/// store is O(1); older duplicates merely cost a redundant entry, which
/// replay tolerates (last-value-wins).
const COALESCE_SCAN: usize = 32;

// ---------------------------------------------------------------------------
// Log storage
// ---------------------------------------------------------------------------

/// One logged word store. Fields are atomics so a catch-up copier may read
/// them racily; torn reads are rejected by the ticket re-validation.
struct LogEntry {
    addr: AtomicU64,
    old: AtomicU64,
    new: AtomicU64,
}

impl LogEntry {
    const fn empty() -> Self {
        Self {
            addr: AtomicU64::new(0),
            old: AtomicU64::new(0),
            new: AtomicU64::new(0),
        }
    }
}

struct LogNode {
    entries: [LogEntry; LOG_CHUNK],
    next: AtomicPtr<LogNode>,
    /// Owner-only back link for the bounded coalescing scan and reverse
    /// undo. Never read by copiers (they walk `next`).
    prev: *mut LogNode,
}

impl LogNode {
    fn boxed(prev: *mut LogNode) -> Box<LogNode> {
        Box::new(LogNode {
            entries: [const { LogEntry::empty() }; LOG_CHUNK],
            next: AtomicPtr::new(std::ptr::null_mut()),
            prev,
        })
    }
}

// ---------------------------------------------------------------------------
// TxSlot
// ---------------------------------------------------------------------------

/// A recyclable per-(thread, generation) transaction slot.
pub struct TxSlot {
    /// Ticket this generation will claim. Re-stored at `begin`; copiers
    /// compare it before and after reading the log.
    pub ticket: AtomicU64,
    /// Flat-combining scoreboard: has thread `i`'s announced mutation been
    /// executed as of this commit?
    pub applied: [AtomicBool; MAX_THREADS],
    /// Abort discriminant per thread (0 = completed normally).
    pub aborted: [AtomicU8; MAX_THREADS],
    /// Result word per thread.
    pub results: [AtomicU64; MAX_THREADS],
    /// Final entry count, published at commit. Zero while filling.
    pub log_size: AtomicU64,

    head: LogNode,
    /// Owner-only tail cache; points at `head` or a chained node.
    tail: AtomicPtr<LogNode>,
    /// Owner-only fill count for the current generation.
    len: AtomicU64,
    /// Log index of the active closure's first entry. Coalescing never
    /// reaches below it; entries there belong to earlier closures in the
    /// same combining pass and must survive this closure's suffix undo.
    floor: AtomicU64,
}

// Slots are shared across threads through the scoreboard protocol; the
// owner-only fields are mutated exclusively by the combiner that holds the
// generation.
unsafe impl Send for TxSlot {}
unsafe impl Sync for TxSlot {}

impl TxSlot {
    pub(crate) fn new() -> Self {
        Self {
            ticket: AtomicU64::new(0),
            applied: [const { AtomicBool::new(false) }; MAX_THREADS],
            aborted: [const { AtomicU8::new(0) }; MAX_THREADS],
            results: [const { AtomicU64::new(0) }; MAX_THREADS],
            log_size: AtomicU64::new(0),
            head: LogNode {
                entries: [const { LogEntry::empty() }; LOG_CHUNK],
                next: AtomicPtr::new(std::ptr::null_mut()),
                prev: std::ptr::null_mut(),
            },
            tail: AtomicPtr::new(std::ptr::null_mut()),
            len: AtomicU64::new(0),
            floor: AtomicU64::new(0),
        }
    }

    fn head_ptr(&self) -> *mut LogNode {
        std::ptr::addr_of!(self.head).cast_mut()
    }

    /// Start a new generation: claim `ticket`, reset the log, and inherit
    /// the scoreboard of the commit this one will extend.
    pub fn begin(&self, ticket: Ticket, inherit_from: &TxSlot) {
        self.ticket.store(ticket.0, Ordering::SeqCst);
        self.log_size.store(0, Ordering::SeqCst);
        self.len.store(0, Ordering::Relaxed);
        self.floor.store(0, Ordering::Relaxed);
        self.tail.store(self.head_ptr(), Ordering::Relaxed);
        std::sync::atomic::fence(Ordering::SeqCst);
        for i in 0..MAX_THREADS {
            self.applied[i].store(
                inherit_from.applied[i].load(Ordering::Relaxed),
                Ordering::Relaxed,
            );
            self.aborted[i].store(
                inherit_from.aborted[i].load(Ordering::Relaxed),
                Ordering::Relaxed,
            );
            self.results[i].store(
                inherit_from.results[i].load(Ordering::Relaxed),
                Ordering::Relaxed,
            );
        }
    }

    /// Current fill count (owner view).
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the start of a combined closure's entries: coalescing will not
    /// reach below index `floor`, so an abort of that closure can undo and
    /// truncate exactly its own suffix.
    pub fn set_floor(&self, floor: u64) {
        debug_assert!(floor <= self.len());
        self.floor.store(floor, Ordering::Relaxed);
    }

    /// Append `(addr, old, new)`, coalescing against the most recent
    /// [`COALESCE_SCAN`] entries at or above the floor. Returns `true` if
    /// the containing cache line was already present in the scanned window
    /// (the caller may then skip deferring another write-back for it).
    pub fn append(&self, addr: u64, old: u64, new: u64) -> bool {
        let line = crate::pwb::line_of(addr as usize) as u64;
        let mut line_seen = false;

        // Backward scan over the last few entries, stopping at the floor.
        // A repeated address below the floor costs a duplicate entry, which
        // replay tolerates (last-value-wins in append order).
        let len = self.len();
        let floor = self.floor.load(Ordering::Relaxed);
        if len > floor {
            let mut node = self.tail.load(Ordering::Relaxed);
            let mut in_node = (len as usize) % LOG_CHUNK;
            if in_node == 0 {
                in_node = LOG_CHUNK;
            }
            let mut scanned = 0;
            let mut index = len;
            'scan: while !node.is_null() && scanned < COALESCE_SCAN {
                let entries = unsafe { &(*node).entries };
                for i in (0..in_node).rev() {
                    index -= 1;
                    if index < floor {
                        break 'scan;
                    }
                    let eaddr = entries[i].addr.load(Ordering::Relaxed);
                    if eaddr == addr {
                        entries[i].new.store(new, Ordering::Relaxed);
                        return true;
                    }
                    if crate::pwb::line_of(eaddr as usize) as u64 == line {
                        line_seen = true;
                    }
                    scanned += 1;
                    if scanned >= COALESCE_SCAN {
                        break 'scan;
                    }
                }
                node = unsafe { (*node).prev };
                in_node = LOG_CHUNK;
            }
        }

        // No coalescible entry: append at the tail, growing a chunk if the
        // current one is full.
        let mut tail = self.tail.load(Ordering::Relaxed);
        if tail.is_null() {
            tail = self.head_ptr();
            self.tail.store(tail, Ordering::Relaxed);
        }
        let pos = (len as usize) % LOG_CHUNK;
        if pos == 0 && len > 0 {
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            let next = if next.is_null() {
                let fresh = Box::into_raw(LogNode::boxed(tail));
                unsafe { (*tail).next.store(fresh, Ordering::Release) };
                fresh
            } else {
                next
            };
            self.tail.store(next, Ordering::Relaxed);
            tail = next;
        }
        let entry = unsafe { &(*tail).entries[pos] };
        entry.addr.store(addr, Ordering::Relaxed);
        entry.old.store(old, Ordering::Relaxed);
        entry.new.store(new, Ordering::Release);
        self.len.store(len + 1, Ordering::Release);
        line_seen
    }

    /// Copy the first `count` entries, in append order, into `out` as
    /// `(addr, new)` pairs. Used by catch-up replay; the caller must
    /// re-validate the slot ticket afterwards.
    pub fn copy_log(&self, count: u64, out: &mut Vec<(u64, u64)>) {
        out.clear();
        out.reserve(count as usize);
        let mut node: *const LogNode = &self.head;
        let mut copied = 0u64;
        while copied < count && !node.is_null() {
            let entries = unsafe { &(*node).entries };
            let take = ((count - copied) as usize).min(LOG_CHUNK);
            for e in entries.iter().take(take) {
                out.push((
                    e.addr.load(Ordering::Relaxed),
                    e.new.load(Ordering::Relaxed),
                ));
            }
            copied += take as u64;
            node = unsafe { (*node).next.load(Ordering::Acquire) };
        }
    }

    /// Visit the current generation's entries in reverse append order as
    /// `(addr, old)` pairs. Owner-only; used to undo a failed or lost
    /// attempt, and to roll back an aborted closure's suffix (`from`
    /// bounds the walk to entries at index >= `from`).
    pub fn for_each_rev(&self, from: u64, mut f: impl FnMut(u64, u64)) {
        let len = self.len();
        if len <= from {
            return;
        }
        let mut node = self.tail.load(Ordering::Relaxed);
        let mut in_node = (len as usize) % LOG_CHUNK;
        if in_node == 0 && len > 0 {
            in_node = LOG_CHUNK;
        }
        let mut index = len;
        while !node.is_null() && index > from {
            let entries = unsafe { &(*node).entries };
            for i in (0..in_node).rev() {
                index -= 1;
                if index < from {
                    return;
                }
                f(
                    entries[i].addr.load(Ordering::Relaxed),
                    entries[i].old.load(Ordering::Relaxed),
                );
            }
            node = unsafe { (*node).prev };
            in_node = LOG_CHUNK;
        }
    }

    /// Truncate the current generation back to `len` entries (after undoing
    /// an aborted closure's suffix).
    pub fn truncate(&self, len: u64) {
        debug_assert!(len <= self.len());
        self.len.store(len, Ordering::Release);
        // Reposition the owner tail cache.
        let mut node = self.head_ptr();
        let mut remaining = len as usize;
        while remaining > LOG_CHUNK {
            node = unsafe { (*node).next.load(Ordering::Acquire) };
            remaining -= LOG_CHUNK;
        }
        self.tail.store(node, Ordering::Relaxed);
    }

    /// Publish the final log size; the log is immutable for this generation
    /// from here on.
    pub fn seal(&self) {
        self.log_size.store(self.len(), Ordering::Release);
    }
}

impl Drop for TxSlot {
    fn drop(&mut self) {
        let mut node = self.head.next.load(Ordering::Relaxed);
        while !node.is_null() {
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next.load(Ordering::Relaxed);
        }
    }
}

// ---------------------------------------------------------------------------
// ThreadSlots
// ---------------------------------------------------------------------------

/// One thread's cyclic slot array.
pub struct ThreadSlots {
    pub slots: Box<[TxSlot]>,
    /// Index of the slot the next write attempt will use. Owner-only.
    last: AtomicU64,
}

impl ThreadSlots {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: (0..SLOTS_PER_THREAD).map(|_| TxSlot::new()).collect(),
            // Slot 0 of thread 0 doubles as the ticket-zero slot the
            // bootstrap commit extends; every thread starts claiming at 1.
            last: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn current_index(&self) -> usize {
        self.last.load(Ordering::Relaxed) as usize
    }

    /// Advance to the next slot after a successful publication.
    pub fn bump(&self) {
        let next = (self.last.load(Ordering::Relaxed) + 1) % SLOTS_PER_THREAD as u64;
        self.last.store(next, Ordering::Relaxed);
    }
}

impl Default for ThreadSlots {
    fn default() -> Self {
        Self::new()
    }
}
