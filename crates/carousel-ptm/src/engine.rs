//! The transaction engine: ticket issuance, replica rotation, flat
//! combining, durability fencing, and publication.
//!
//! ## Protocol
//!
//! A write transaction:
//!
//! 1. publishes its boxed closure in the calling thread's enqueue slot and
//!    flips that thread's announce parity;
//! 2. reads the header's published ticket; if the latest commit's scoreboard
//!    already shows the closure applied (a peer combined it), returns the
//!    recorded result;
//! 3. otherwise claims its next transaction slot with ticket `cur.seq + 1`,
//!    inheriting the latest commit's scoreboard;
//! 4. acquires a non-current replica exclusively and brings it to `cur` —
//!    by replaying the redo logs it missed (located through the commit
//!    ring), or by a chunked full copy from the current replica when replay
//!    is impossible or implausibly expensive;
//! 5. runs a combining pass: every thread whose announce parity differs
//!    from the inherited applied parity has its closure executed against
//!    the replica, its stores redo-logged, its result and abort state
//!    recorded; an aborting or panicking closure has its log suffix undone
//!    in reverse, leaving the other combined work intact;
//! 6. writes back every dirtied cache line, fences, seals the log, stores
//!    the replica's new head ticket, downgrades the exclusive hold to the
//!    shared handover mark, and CASes the header's published word from
//!    `cur` to `(seq+1, tid, replica)`;
//! 7. on success flushes the header line, drains, advances the ring, and
//!    releases the superseded replica's handover mark; on failure undoes
//!    its whole log, restores the head, releases, and retries.
//!
//! Read transactions take a shared lock on the current replica, re-validate
//! currency, and run the closure in place; past a bounded number of
//! attempts the reader enqueues itself as a pseudo-write so some writer's
//! combining pass produces its result.
//!
//! Recovery is "trust the header": every published commit flushed and
//! fenced its replica first, so on reopen the recorded current replica is
//! authoritative. The other replicas' in-memory heads are unknown after a
//! restart, so they are marked with the needs-full-copy sentinel.

use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, info};

use carousel_error::{PtmError, PtmResult, TxAbort};

use crate::alloc;
use crate::cell::{HeapOffset, PPtr, PWord, WordAccess};
use crate::config::PtmConfig;
use crate::hazard::HazardDomain;
use crate::pwb::{self, PwbLog};
use crate::redo::{ThreadSlots, TxSlot};
use crate::region::{Opened, Region};
use crate::registry::{self, MAX_THREADS};
use crate::rilock::RiLock;
use crate::ticket::{CommitRing, Ticket};

/// An announced mutation. Boxed twice so the box itself can travel through
/// an `AtomicPtr` and be reclaimed by the hazard domain.
type MutationFn = dyn Fn(&TxScope<'_>) -> Result<u64, TxAbort> + Send + Sync;
type Mutation = Box<MutationFn>;

/// `aborted[]` discriminant for a panicked closure (1 and 2 belong to
/// [`TxAbort`], 0 means completed).
const ABORT_PANICKED: u8 = 3;

/// Bytes copied per chunk during a full replica copy; the header is
/// re-validated between chunks.
const COPY_CHUNK: u64 = 64 * 1024;

struct ReplicaState {
    /// Slot-bearing ticket of the last commit applied to this replica, or
    /// [`Ticket::NEEDS_COPY`].
    head: AtomicU64,
    lock: RiLock,
}

impl ReplicaState {
    fn new() -> Self {
        Self {
            head: AtomicU64::new(Ticket::NEEDS_COPY.0),
            lock: RiLock::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Default)]
struct EngineMetrics {
    commits: AtomicU64,
    combined: AtomicU64,
    catch_ups: AtomicU64,
    full_copies: AtomicU64,
    publish_retries: AtomicU64,
    read_fast: AtomicU64,
    read_demoted: AtomicU64,
    aborts: AtomicU64,
    panics: AtomicU64,
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Serialize)]
pub struct EngineMetricsSnapshot {
    /// Published commits.
    pub commits: u64,
    /// Closures executed on behalf of *other* threads.
    pub combined: u64,
    /// Replica acquisitions served by redo-log replay.
    pub catch_ups: u64,
    /// Replica acquisitions that fell back to a full copy.
    pub full_copies: u64,
    /// Write attempts abandoned before publication (lost CAS, moved header).
    pub publish_retries: u64,
    /// Read transactions served on the fast path.
    pub read_fast: u64,
    /// Read transactions demoted to enqueued pseudo-writes.
    pub read_demoted: u64,
    /// Closures that aborted.
    pub aborts: u64,
    /// Closures that panicked while combined.
    pub panics: u64,
}

// ---------------------------------------------------------------------------
// Nested-transaction guard
// ---------------------------------------------------------------------------

thread_local! {
    static IN_TX: Cell<bool> = const { Cell::new(false) };
}

struct TxGuard;

impl TxGuard {
    fn enter() -> PtmResult<TxGuard> {
        IN_TX.with(|flag| {
            if flag.get() {
                return Err(PtmError::NestedTransaction);
            }
            flag.set(true);
            Ok(TxGuard)
        })
    }
}

impl Drop for TxGuard {
    fn drop(&mut self) {
        IN_TX.with(|flag| flag.set(false));
    }
}

// ---------------------------------------------------------------------------
// TxScope
// ---------------------------------------------------------------------------

/// Per-transaction context handed to closures: the replica the transaction
/// is bound to, the redo log collecting its stores, and the deferred
/// write-back batch. Read transactions carry no log and must not store.
pub struct TxScope<'p> {
    ptm: &'p Ptm,
    replica: usize,
    slot: Option<&'p TxSlot>,
    pwbs: RefCell<PwbLog>,
}

impl WordAccess for TxScope<'_> {
    fn load_word(&self, off: HeapOffset) -> u64 {
        self.check_offset(off);
        self.ptm.region.read_word(self.replica, off)
    }

    fn store_word(&self, off: HeapOffset, val: u64) {
        self.check_offset(off);
        let Some(slot) = self.slot else {
            panic!("store inside a read transaction");
        };
        let old = self.ptm.region.read_word(self.replica, off);
        let line_seen = slot.append(off, old, val);
        self.ptm.region.write_word(self.replica, off, val);
        if !line_seen {
            self.pwbs
                .borrow_mut()
                .defer(self.ptm.region.word_addr(self.replica, off));
        }
    }

    fn heap_size(&self) -> u64 {
        self.ptm.region.heap_size()
    }
}

impl TxScope<'_> {
    /// Every word access funnels through here; a wild offset must never
    /// reach the raw mapping, where it would land in a neighbor replica or
    /// off the map entirely.
    fn check_offset(&self, off: HeapOffset) {
        let size = self.ptm.region.heap_size();
        assert!(
            off % 8 == 0 && off <= size - 8,
            "heap offset {off:#x} unaligned or out of bounds"
        );
    }

    /// Whether stores are permitted (write transaction or combined write).
    #[must_use]
    pub fn is_writer(&self) -> bool {
        self.slot.is_some()
    }

    /// Allocate `bytes` of persistent user data.
    ///
    /// Write transactions only. The allocation is transactional: if the
    /// closure aborts or the attempt is abandoned, it is rolled back with
    /// the rest of the redo log.
    pub fn alloc<T>(&self, bytes: u64) -> Result<PPtr<T>, TxAbort> {
        assert!(self.is_writer(), "allocation inside a read transaction");
        alloc::alloc(self, bytes).map(PPtr::from_offset)
    }

    /// Return an allocation to its free list. Write transactions only.
    pub fn free<T>(&self, ptr: PPtr<T>) {
        assert!(self.is_writer(), "free inside a read transaction");
        assert!(!ptr.is_null(), "freeing the null pointer");
        alloc::free(self, ptr.offset());
    }

    /// Read root-directory slot `idx`.
    #[must_use]
    pub fn root<T>(&self, idx: usize) -> PPtr<T> {
        assert!(idx < alloc::ROOT_SLOTS, "root index out of range");
        PPtr::from_word(self.load_word(alloc::ROOTS_OFF + 8 * idx as u64))
    }

    /// Point root-directory slot `idx` at `ptr`. Write transactions only;
    /// crash-atomic with the enclosing transaction.
    pub fn set_root<T>(&self, idx: usize, ptr: PPtr<T>) {
        assert!(idx < alloc::ROOT_SLOTS, "root index out of range");
        self.store_word(alloc::ROOTS_OFF + 8 * idx as u64, ptr.to_word());
    }
}

// ---------------------------------------------------------------------------
// Ptm
// ---------------------------------------------------------------------------

/// A persistent transactional memory over one mapped region.
pub struct Ptm {
    region: Region,
    replicas: Box<[ReplicaState]>,
    states: Box<[ThreadSlots]>,
    ring: CommitRing,
    enqueuers: Box<[AtomicPtr<Mutation>]>,
    announce: Box<[AtomicBool]>,
    hazard: HazardDomain<Mutation>,
    /// Pristine scoreboard inherited by the first commit after open, when
    /// the recovered sequence has no locatable slot.
    baseline: TxSlot,
    /// Sequence recorded in the header at open (0 for a fresh region).
    base_seq: u64,
    read_tries: u32,
    metrics: EngineMetrics,
}

impl Ptm {
    /// Map the backing file and recover or bootstrap.
    ///
    /// A file with a valid header resumes from its recorded current
    /// replica. Anything else is initialized from scratch: the allocator
    /// metadata and root directory are written by a bootstrap transaction
    /// through the normal commit machinery, then the header is sealed.
    pub fn open(config: PtmConfig) -> PtmResult<Ptm> {
        config.validate()?;
        let (region, opened) = Region::map(&config.path, config.region_size, config.replicas)?;
        let base_seq = match opened {
            Opened::Fresh => 0,
            Opened::Existing => region.cur_comb().seq(),
        };
        let ptm = Ptm {
            region,
            replicas: (0..config.replicas).map(|_| ReplicaState::new()).collect(),
            states: (0..MAX_THREADS).map(|_| ThreadSlots::new()).collect(),
            ring: CommitRing::new(),
            enqueuers: (0..MAX_THREADS)
                .map(|_| AtomicPtr::new(std::ptr::null_mut()))
                .collect(),
            announce: (0..MAX_THREADS).map(|_| AtomicBool::new(false)).collect(),
            hazard: HazardDomain::new(),
            baseline: TxSlot::new(),
            base_seq,
            read_tries: config.read_tries.max(1),
            metrics: EngineMetrics::default(),
        };

        match opened {
            Opened::Fresh => {
                ptm.replicas[0].head.store(Ticket::ZERO.0, Ordering::SeqCst);
                ptm.replicas[0].lock.set_read_lock();
                ptm.write(|tx| {
                    alloc::init(tx);
                    Ok(0)
                })?;
                ptm.region.seal();
                info!(target: "carousel.engine", "bootstrapped fresh region");
            }
            Opened::Existing => {
                let cur = ptm.region.cur_comb();
                let cur_idx = cur.slot();
                // The on-file current replica is authoritative; every other
                // replica's last-applied state is unknowable after restart.
                ptm.replicas[cur_idx]
                    .head
                    .store(Ticket::pack(cur.seq(), cur.tid(), 0).0, Ordering::SeqCst);
                ptm.replicas[cur_idx].lock.set_read_lock();
                info!(
                    target: "carousel.engine",
                    seq = cur.seq(),
                    replica = cur_idx,
                    "recovered from sealed header"
                );
            }
        }
        Ok(ptm)
    }

    /// Run `mutation` as an atomic durable write transaction.
    ///
    /// The closure may run on another thread (a combiner executes announced
    /// mutations on their owners' behalf) and may run more than once across
    /// abandoned attempts, but its effects reach the published history
    /// exactly once. All side effects must go through the [`TxScope`].
    pub fn write<F>(&self, mutation: F) -> PtmResult<u64>
    where
        F: Fn(&TxScope<'_>) -> Result<u64, TxAbort> + Send + Sync + 'static,
    {
        let _guard = TxGuard::enter()?;
        let tid = registry::current_tid()?;
        self.write_inner(tid, Box::new(mutation))
    }

    /// Run `closure` against a consistent committed snapshot.
    ///
    /// Wait-free toward writers: a reader never holds anything a writer
    /// must wait for. Past `read_tries` failed attempts the closure is
    /// enqueued as a pseudo-write and executed by some writer's combining
    /// pass. The closure must not store.
    pub fn read<F>(&self, closure: F) -> PtmResult<u64>
    where
        F: Fn(&TxScope<'_>) -> Result<u64, TxAbort> + Send + Sync + 'static,
    {
        {
            let _guard = TxGuard::enter()?;
            let tid = registry::current_tid()?;
            for _ in 0..self.read_tries {
                let cur = self.region.cur_comb();
                let idx = cur.slot();
                if !self.replicas[idx].lock.shared_try_lock(tid) {
                    continue;
                }
                if self.region.cur_comb() != cur {
                    self.replicas[idx].lock.shared_unlock(tid);
                    continue;
                }
                let scope = TxScope {
                    ptm: self,
                    replica: idx,
                    slot: None,
                    pwbs: RefCell::new(PwbLog::new()),
                };
                let out = catch_unwind(AssertUnwindSafe(|| closure(&scope)));
                self.replicas[idx].lock.shared_unlock(tid);
                self.metrics.read_fast.fetch_add(1, Ordering::Relaxed);
                return match out {
                    Ok(result) => result.map_err(PtmError::Aborted),
                    Err(panic) => resume_unwind(panic),
                };
            }
        }
        self.metrics.read_demoted.fetch_add(1, Ordering::Relaxed);
        self.write(closure)
    }

    /// Current engine counters.
    #[must_use]
    pub fn metrics(&self) -> EngineMetricsSnapshot {
        let m = &self.metrics;
        EngineMetricsSnapshot {
            commits: m.commits.load(Ordering::Relaxed),
            combined: m.combined.load(Ordering::Relaxed),
            catch_ups: m.catch_ups.load(Ordering::Relaxed),
            full_copies: m.full_copies.load(Ordering::Relaxed),
            publish_retries: m.publish_retries.load(Ordering::Relaxed),
            read_fast: m.read_fast.load(Ordering::Relaxed),
            read_demoted: m.read_demoted.load(Ordering::Relaxed),
            aborts: m.aborts.load(Ordering::Relaxed),
            panics: m.panics.load(Ordering::Relaxed),
        }
    }

    // -- write attempt -----------------------------------------------------

    fn write_inner(&self, tid: usize, mutation: Mutation) -> PtmResult<u64> {
        // Publish the closure, then flip the announce parity so combiners
        // see it pending.
        let raw = Box::into_raw(Box::new(mutation));
        let prev = self.enqueuers[tid].swap(raw, Ordering::SeqCst);
        if !prev.is_null() {
            self.hazard.retire(tid, prev);
        }
        let want = !self.announce[tid].load(Ordering::SeqCst);
        self.announce[tid].store(want, Ordering::SeqCst);

        let init_seq = self.region.cur_comb().seq();
        let mut scratch = Vec::new();
        loop {
            let cur = self.region.cur_comb();

            // Did a peer's combining pass already run this mutation?
            if let Some((t, latest)) = self.commit_slot(cur.seq(), Some(cur.slot())) {
                if latest.applied[tid].load(Ordering::SeqCst) == want {
                    let out = self.decode(latest, tid);
                    // The result is only trustworthy if the slot was not
                    // recycled while we read it.
                    if latest.ticket.load(Ordering::SeqCst) == t.0 {
                        return out;
                    }
                    continue;
                }
            }
            if cur.seq() >= init_seq + 2 {
                // Two commits passed since announcing: ours rode one of
                // them. Poll until the latest scoreboard is locatable.
                std::hint::spin_loop();
                continue;
            }

            // Claim this thread's next slot, inheriting the scoreboard of
            // the commit this one extends.
            let slot_idx = self.states[tid].current_index();
            let my_slot = &self.states[tid].slots[slot_idx];
            let ring_ticket = Ticket::pack(cur.seq() + 1, tid, slot_idx);
            let (inherit_ticket, inherit) = match self.commit_slot(cur.seq(), Some(cur.slot())) {
                Some((t, slot)) => (Some(t), slot),
                None if cur.seq() == self.base_seq => (None, &self.baseline),
                None => continue,
            };
            my_slot.begin(ring_ticket, inherit);
            // The inherited scoreboard is only trustworthy if its slot was
            // not recycled while `begin` copied it.
            if let Some(t) = inherit_ticket {
                if inherit.ticket.load(Ordering::SeqCst) != t.0 {
                    continue;
                }
            }

            let Some(target) = self.acquire_replica(tid, cur, &mut scratch) else {
                self.metrics.publish_retries.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            // Flat-combining pass: one physical writer, many logical
            // commits.
            let scope = TxScope {
                ptm: self,
                replica: target,
                slot: Some(my_slot),
                pwbs: RefCell::new(PwbLog::new()),
            };
            for thread in 0..registry::max_threads() {
                let want_t = self.announce[thread].load(Ordering::SeqCst);
                if my_slot.applied[thread].load(Ordering::SeqCst) == want_t {
                    continue;
                }
                let mut ptr = self.enqueuers[thread].load(Ordering::SeqCst);
                loop {
                    self.hazard.protect(tid, ptr);
                    let again = self.enqueuers[thread].load(Ordering::SeqCst);
                    if again == ptr {
                        break;
                    }
                    ptr = again;
                }
                if ptr.is_null() {
                    self.hazard.clear(tid);
                    continue;
                }
                let m: &Mutation = unsafe { &*ptr };
                self.run_combined(&scope, my_slot, thread, want_t, m);
                self.hazard.clear(tid);
                if thread != tid {
                    self.metrics.combined.fetch_add(1, Ordering::Relaxed);
                }
            }

            // Durability before visibility.
            scope.pwbs.borrow_mut().flush();
            pwb::pfence();
            my_slot.seal();

            let prev_head = self.replicas[target].head.load(Ordering::SeqCst);
            self.replicas[target].head.store(ring_ticket.0, Ordering::SeqCst);
            self.replicas[target].lock.downgrade();
            let published = Ticket::pack(cur.seq() + 1, tid, target);
            if self.region.cas_cur_comb(cur, published) {
                self.region.flush_cur_comb();
                pwb::psync();
                self.ring.advance(self.ring.get(ring_ticket.seq()), ring_ticket);
                self.replicas[cur.slot()].lock.set_read_unlock();
                self.states[tid].bump();
                self.metrics.commits.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "carousel.engine",
                    seq = ring_ticket.seq(),
                    replica = target,
                    entries = my_slot.len(),
                    "published commit"
                );
                return self.decode(my_slot, tid);
            }

            // Lost the publication race. Nobody reads this replica (the
            // header never pointed here and the handover mark blocks
            // writers), so revert it in place and retry.
            self.undo_suffix(target, my_slot, 0);
            self.replicas[target].head.store(prev_head, Ordering::SeqCst);
            self.replicas[target].lock.set_read_unlock();
            self.metrics.publish_retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Execute one announced mutation against the combining pass's replica,
    /// recording result or abort and flipping the applied parity to
    /// `want`. Abort and panic roll back the closure's own log suffix.
    fn run_combined(
        &self,
        scope: &TxScope<'_>,
        slot: &TxSlot,
        thread: usize,
        want: bool,
        m: &Mutation,
    ) {
        let watermark = slot.len();
        // Entries below the watermark belong to closures already combined
        // into this commit; fencing coalescing off from them keeps the
        // suffix undo below sufficient.
        slot.set_floor(watermark);
        match catch_unwind(AssertUnwindSafe(|| m(scope))) {
            Ok(Ok(value)) => {
                slot.aborted[thread].store(0, Ordering::Relaxed);
                slot.results[thread].store(value, Ordering::Relaxed);
            }
            Ok(Err(abort)) => {
                self.undo_suffix(scope.replica, slot, watermark);
                slot.aborted[thread].store(abort.kind(), Ordering::Relaxed);
                slot.results[thread].store(abort.code(), Ordering::Relaxed);
                self.metrics.aborts.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.undo_suffix(scope.replica, slot, watermark);
                slot.aborted[thread].store(ABORT_PANICKED, Ordering::Relaxed);
                slot.results[thread].store(0, Ordering::Relaxed);
                self.metrics.panics.fetch_add(1, Ordering::Relaxed);
            }
        }
        slot.applied[thread].store(want, Ordering::Release);
    }

    /// Apply old values in reverse for every log entry at index >= `from`,
    /// then truncate the log back to `from`.
    fn undo_suffix(&self, replica: usize, slot: &TxSlot, from: u64) {
        slot.for_each_rev(from, |addr, old| self.region.write_word(replica, addr, old));
        slot.truncate(from);
    }

    /// Result recorded for `tid` in `slot`, decoded from the
    /// aborted/results word pair.
    fn decode(&self, slot: &TxSlot, tid: usize) -> PtmResult<u64> {
        let kind = slot.aborted[tid].load(Ordering::Acquire);
        let word = slot.results[tid].load(Ordering::Acquire);
        if kind == 0 {
            return Ok(word);
        }
        match TxAbort::from_parts(kind, word) {
            Some(abort) => Err(PtmError::Aborted(abort)),
            None => Err(PtmError::ClosurePanicked),
        }
    }

    /// Ring-validated transaction slot of the commit with sequence `seq`.
    ///
    /// When the ring entry was lost (the committer's best-effort advance
    /// never landed), `cur_replica` allows a Michael-&-Scott-style repair
    /// from that replica's head, which carries the same slot-bearing
    /// ticket.
    fn commit_slot(&self, seq: u64, cur_replica: Option<usize>) -> Option<(Ticket, &TxSlot)> {
        let mut t = self.ring.get(seq);
        if t.seq() != seq {
            let idx = cur_replica?;
            let head = Ticket(self.replicas[idx].head.load(Ordering::SeqCst));
            if head.seq() != seq || head == Ticket::NEEDS_COPY {
                return None;
            }
            self.ring.advance(t, head);
            t = head;
        }
        let slot = &self.states[t.tid()].slots[t.slot()];
        (slot.ticket.load(Ordering::SeqCst) == t.0).then_some((t, slot))
    }

    // -- replica acquisition -----------------------------------------------

    /// Exclusively lock a non-current replica and bring it to `cur`, by
    /// catch-up replay or full copy. `None` means the attempt should
    /// re-read the header and retry.
    fn acquire_replica(
        &self,
        tid: usize,
        cur: Ticket,
        scratch: &mut Vec<(u64, u64)>,
    ) -> Option<usize> {
        let cur_idx = cur.slot();
        for idx in 0..self.replicas.len() {
            if idx == cur_idx || !self.replicas[idx].lock.exclusive_try_lock(tid) {
                continue;
            }
            if self.region.cur_comb() != cur {
                self.replicas[idx].lock.exclusive_unlock();
                return None;
            }
            if self.catch_up(idx, cur, scratch) {
                self.metrics.catch_ups.fetch_add(1, Ordering::Relaxed);
                return Some(idx);
            }
            if self.make_copy(cur_idx, idx, tid, cur) {
                self.metrics.full_copies.fetch_add(1, Ordering::Relaxed);
                return Some(idx);
            }
            self.replicas[idx].lock.exclusive_unlock();
            return None;
        }
        None
    }

    /// Replay the redo logs `dst` missed, from its head up to `cur`.
    /// Returns `false` when replay is impossible (unknown head, evicted or
    /// recycled log) or implausibly expensive next to a straight copy.
    fn catch_up(&self, dst: usize, cur: Ticket, scratch: &mut Vec<(u64, u64)>) -> bool {
        let mut head = Ticket(self.replicas[dst].head.load(Ordering::SeqCst));
        if head == Ticket::NEEDS_COPY || head.seq() > cur.seq() {
            return false;
        }
        let used = self.region.read_word(dst, alloc::TOP_OFF).min(self.region.heap_size());
        // Past this many entries a copy of the used prefix is cheaper.
        let budget = (used / 16).max(1024);
        let mut replayed = 0u64;
        for seq in head.seq() + 1..=cur.seq() {
            let Some((t, slot)) = self.commit_slot(seq, None) else {
                return false;
            };
            let size = slot.log_size.load(Ordering::Acquire);
            replayed += size;
            if replayed > budget {
                debug!(
                    target: "carousel.engine",
                    replica = dst,
                    replayed,
                    budget,
                    "catch-up over budget, copying instead"
                );
                return false;
            }
            slot.copy_log(size, scratch);
            // Entries are only trustworthy if the slot was not recycled
            // while we read them.
            if slot.ticket.load(Ordering::SeqCst) != t.0 {
                return false;
            }
            for &(addr, val) in scratch.iter() {
                if addr % 8 != 0 || addr + 8 > self.region.heap_size() {
                    return false;
                }
                self.region.write_word(dst, addr, val);
                self.region.flush_heap_range(dst, addr, 8);
            }
            head = t;
        }
        self.replicas[dst].head.store(head.0, Ordering::SeqCst);
        true
    }

    /// Chunked full copy of the used prefix of replica `src` (the current
    /// replica) into `dst`, re-validating the header between chunks.
    fn make_copy(&self, src: usize, dst: usize, tid: usize, cur: Ticket) -> bool {
        if !self.replicas[src].lock.shared_try_lock(tid) {
            return false;
        }
        let mut ok = true;
        let used = self.region.read_word(src, alloc::TOP_OFF).min(self.region.heap_size());
        let mut off = 0;
        while off < used {
            let len = COPY_CHUNK.min(used - off);
            self.region.copy_bytes(src, dst, off, len);
            self.region.flush_heap_range(dst, off, len);
            off += len;
            if self.region.cur_comb() != cur {
                // Superseded mid-copy: the bytes moved so far are a mix of
                // states, but the head was not advanced, so a later
                // acquisition repairs this replica before use.
                ok = false;
                break;
            }
        }
        if ok {
            self.replicas[dst]
                .head
                .store(self.replicas[src].head.load(Ordering::SeqCst), Ordering::SeqCst);
        }
        self.replicas[src].lock.shared_unlock(tid);
        ok
    }
}

impl Drop for Ptm {
    fn drop(&mut self) {
        // Live announced closures; retired ones drain with the hazard
        // domain.
        for enqueuer in self.enqueuers.iter() {
            let ptr = enqueuer.swap(std::ptr::null_mut(), Ordering::SeqCst);
            if !ptr.is_null() {
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::PCell;

    fn open_tmp() -> (tempfile::TempDir, Ptm) {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = PtmConfig::new(dir.path().join("engine.ptm"))
            .region_size(crate::region::HEADER_BYTES + 4 * 256 * 1024)
            .replicas(4);
        let ptm = Ptm::open(cfg).expect("open");
        (dir, ptm)
    }

    #[test]
    fn write_commits_and_read_observes() {
        let (_dir, ptm) = open_tmp();
        let written = ptm
            .write(|tx| {
                let p = tx.alloc::<u64>(8)?;
                p.word::<u64>(0).store(tx, 4242);
                tx.set_root(0, p);
                Ok(p.offset())
            })
            .unwrap();
        let seen = ptm
            .read(move |tx| {
                let p = tx.root::<u64>(0);
                assert_eq!(p.offset(), written);
                Ok(p.word::<u64>(0).load(tx))
            })
            .unwrap();
        assert_eq!(seen, 4242);
        assert!(ptm.metrics().commits >= 2, "bootstrap plus the write");
    }

    #[test]
    fn user_abort_rolls_back_and_propagates() {
        let (_dir, ptm) = open_tmp();
        ptm.write(|tx| {
            let p = tx.alloc::<u64>(8)?;
            tx.set_root(1, p);
            Ok(0)
        })
        .unwrap();
        let err = ptm.write(|tx| {
            let p = tx.root::<u64>(1);
            p.word::<u64>(0).store(tx, 777);
            Err(TxAbort::User(9))
        });
        assert!(matches!(err, Err(PtmError::Aborted(TxAbort::User(9)))));
        // The aborted store never became visible.
        let v = ptm
            .read(|tx| Ok(tx.root::<u64>(1).word::<u64>(0).load(tx)))
            .unwrap();
        assert_eq!(v, 0);
    }

    #[test]
    fn panicking_closure_reports_and_leaves_state_intact() {
        let (_dir, ptm) = open_tmp();
        ptm.write(|tx| {
            let p = tx.alloc::<u64>(8)?;
            p.word::<u64>(0).store(tx, 5);
            tx.set_root(2, p);
            Ok(0)
        })
        .unwrap();
        let err = ptm.write(|tx| {
            tx.root::<u64>(2).word::<u64>(0).store(tx, 99);
            panic!("boom");
        });
        assert!(matches!(err, Err(PtmError::ClosurePanicked)));
        let v = ptm
            .read(|tx| Ok(tx.root::<u64>(2).word::<u64>(0).load(tx)))
            .unwrap();
        assert_eq!(v, 5);
    }

    #[test]
    fn nested_transactions_are_refused() {
        let (_dir, ptm) = open_tmp();
        let ptm = std::sync::Arc::new(ptm);
        let inner = std::sync::Arc::clone(&ptm);
        let err = ptm.write(move |_tx| {
            match inner.read(|_| Ok(0)) {
                Err(PtmError::NestedTransaction) => Ok(1),
                other => panic!("expected NestedTransaction, got {other:?}"),
            }
        });
        assert_eq!(err.unwrap(), 1);
    }

    #[test]
    fn heap_exhaustion_aborts_the_transaction() {
        let (_dir, ptm) = open_tmp();
        let err = ptm.write(|tx| {
            loop {
                let p = tx.alloc::<u64>(16 * 1024)?;
                let _ = p;
            }
        });
        assert!(matches!(
            err,
            Err(PtmError::Aborted(TxAbort::HeapExhausted))
        ));
        // The engine is still usable and the heap was rolled back.
        ptm.write(|tx| {
            let p = tx.alloc::<u64>(64)?;
            tx.free(p);
            Ok(0)
        })
        .unwrap();
    }

    #[test]
    fn out_of_bounds_offsets_never_reach_the_mapping() {
        let (_dir, ptm) = open_tmp();
        // Past the replica heap.
        let err = ptm.write(|tx| {
            let wild: PCell<u64> = PCell::at(u64::MAX - 63);
            wild.store(tx, 1);
            Ok(0)
        });
        assert!(matches!(err, Err(PtmError::ClosurePanicked)));
        // Unaligned.
        let err = ptm.write(|tx| Ok(tx.load_word(12)));
        assert!(matches!(err, Err(PtmError::ClosurePanicked)));
        // The engine survives both.
        ptm.write(|tx| {
            let p = tx.alloc::<u64>(8)?;
            tx.free(p);
            Ok(0)
        })
        .unwrap();
    }

    #[test]
    fn freeing_a_wild_pointer_is_refused() {
        let (_dir, ptm) = open_tmp();
        let err = ptm.write(|tx| {
            tx.free(PPtr::<u64>::from_offset(8));
            Ok(0)
        });
        assert!(matches!(err, Err(PtmError::ClosurePanicked)));
    }

    #[test]
    fn stores_in_read_transactions_panic() {
        let (_dir, ptm) = open_tmp();
        let cell: PCell<u64> = PCell::at(alloc::ROOTS_OFF);
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = ptm.read(move |tx| {
                cell.store(tx, 1);
                Ok(0)
            });
        }));
        assert!(result.is_err());
    }
}
