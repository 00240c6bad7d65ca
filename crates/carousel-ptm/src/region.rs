//! The memory-mapped persistent region: header + N replica heaps.
//!
//! File layout: a single page-sized header followed by `replicas` equal
//! heaps. The header carries the magic bytes, a layout version, the region
//! geometry, an xxh3_64 checksum over the immutable fields, and — on its
//! own cache line — the atomic current-replica ticket that a commit's final
//! CAS publishes.
//!
//! Byte-level access uses explicit offsets; the only reinterpret cast is
//! the aligned `AtomicU64` view of the current-ticket word.
//!
//! ## Aliasing discipline
//!
//! Replica heap bytes are touched through raw pointers only, under the
//! engine's lock protocol: a replica's bytes are written only by the thread
//! holding its exclusive lock, and read (by transaction closures or copy
//! sources) only under its shared lock. The header ticket word is a proper
//! atomic. No `&`/`&mut` references to mapped bytes are ever formed.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::MmapMut;
use tracing::info;
use xxhash_rust::xxh3::xxh3_64;

use carousel_error::{PtmError, PtmResult};

use crate::pwb;
use crate::ticket::Ticket;

// ---------------------------------------------------------------------------
// Header wire format
// ---------------------------------------------------------------------------

/// Byte offsets of the header fields.
mod offsets {
    /// `[u8;8]` — `"CRSLPTM\0"`.
    pub const MAGIC: usize = 0;
    /// `u32` — layout version.
    pub const VERSION: usize = 8;
    /// `u32` — alignment padding (always 0).
    pub const _ALIGN0: usize = 12;
    /// `u64` — bytes per replica heap.
    pub const HEAP_SIZE: usize = 16;
    /// `u64` — replica count.
    pub const REPLICAS: usize = 24;
    /// `u64` — root-directory slot count.
    pub const ROOT_SLOTS: usize = 32;
    /// `u64` — xxh3_64 over bytes `[HEAP_SIZE, CHECKSUM)`.
    pub const CHECKSUM: usize = 40;
    /// `u64` — current-replica ticket (atomic; own cache line).
    pub const CUR_COMB: usize = 64;
}

/// Magic bytes identifying an initialized Carousel region.
const MAGIC: [u8; 8] = *b"CRSLPTM\0";

/// Current layout version.
const LAYOUT_VERSION: u32 = 1;

/// Header size; replica 0 starts here.
pub const HEADER_BYTES: u64 = 4096;

/// Root-directory slots (fixed array inside every replica heap).
pub const ROOT_SLOTS: usize = 64;

/// Outcome of mapping the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opened {
    /// No valid header: the caller must bootstrap, then [`Region::seal`].
    Fresh,
    /// Valid header: the recorded current replica is authoritative.
    Existing,
}

// ---------------------------------------------------------------------------
// Region
// ---------------------------------------------------------------------------

pub struct Region {
    map: MmapMut,
    path: PathBuf,
    heap_size: u64,
    replicas: usize,
}

// All mutation of mapped bytes goes through the engine's lock protocol; the
// ticket word is atomic.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Map `path`, sizing it to `region_bytes` if freshly created. A file
    /// with a valid header is re-opened in place; anything else (absent,
    /// empty, torn before seal) is treated as never initialized.
    pub fn map(path: &Path, region_bytes: u64, replicas: usize) -> PtmResult<(Region, Opened)> {
        // Heaps are cache-line aligned so a heap offset and its mapped
        // address agree on cache-line boundaries.
        let heap_size = ((region_bytes - HEADER_BYTES) / replicas as u64) & !(pwb::CACHE_LINE as u64 - 1);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let existing_len = file.metadata()?.len();
        if existing_len < region_bytes {
            file.set_len(region_bytes)?;
        }
        // The mapping stays valid for the life of `Region`; the file handle
        // may close (the kernel keeps the mapping alive).
        let map = unsafe { MmapMut::map_mut(&file)? };

        let region = Region {
            map,
            path: path.to_path_buf(),
            heap_size,
            replicas,
        };

        if region.header_bytes(offsets::MAGIC, 8) == MAGIC {
            region.validate_existing(existing_len)?;
            info!(
                target: "carousel.region",
                path = %region.path.display(),
                heap_size,
                replicas,
                cur = region.cur_comb().0,
                "reopened persistent region"
            );
            Ok((region, Opened::Existing))
        } else {
            region.init_geometry();
            info!(
                target: "carousel.region",
                path = %region.path.display(),
                heap_size,
                replicas,
                "initializing fresh persistent region"
            );
            Ok((region, Opened::Fresh))
        }
    }

    fn validate_existing(&self, file_len: u64) -> PtmResult<()> {
        let corrupt = |detail: String| PtmError::HeaderCorrupt {
            path: self.path.clone(),
            detail,
        };
        let version = self.read_u32(offsets::VERSION);
        if version != LAYOUT_VERSION {
            return Err(corrupt(format!("layout version {version}")));
        }
        let checksum = self.read_u64(offsets::CHECKSUM);
        let computed = self.immutable_checksum();
        if checksum != computed {
            return Err(corrupt(format!(
                "checksum mismatch: stored {checksum:#x}, computed {computed:#x}"
            )));
        }
        let heap = self.read_u64(offsets::HEAP_SIZE);
        let reps = self.read_u64(offsets::REPLICAS);
        if HEADER_BYTES + heap * reps > file_len {
            return Err(corrupt(format!(
                "geometry {heap}x{reps} exceeds file length {file_len}"
            )));
        }
        if heap != self.heap_size || reps != self.replicas as u64 {
            return Err(PtmError::ConfigMismatch {
                detail: format!(
                    "region holds {reps} replicas of {heap} bytes, \
                     configuration asked for {} of {}",
                    self.replicas, self.heap_size
                ),
            });
        }
        // The published word's low field holds the current replica index.
        let cur = self.cur_comb();
        if cur.slot() >= self.replicas || cur.tid() >= crate::registry::MAX_THREADS {
            return Err(corrupt(format!("current ticket {:#x} out of range", cur.0)));
        }
        Ok(())
    }

    fn init_geometry(&self) {
        self.write_u64(offsets::HEAP_SIZE, self.heap_size);
        self.write_u64(offsets::REPLICAS, self.replicas as u64);
        self.write_u64(offsets::ROOT_SLOTS, ROOT_SLOTS as u64);
        self.cur_comb_atomic().store(0, Ordering::SeqCst);
    }

    /// Make the region recognizable as initialized: checksum, version, then
    /// magic, each ordered by a fence so a crash can never leave valid
    /// magic over unsealed contents.
    pub fn seal(&self) {
        self.write_u64(offsets::CHECKSUM, self.immutable_checksum());
        self.write_u32(offsets::VERSION, LAYOUT_VERSION);
        unsafe { pwb::flush_range(self.base().add(offsets::VERSION), 48) };
        pwb::pfence();
        self.header_bytes_mut(offsets::MAGIC, 8).copy_from_slice(&MAGIC);
        unsafe { pwb::pwb(self.base()) };
        pwb::psync();
    }

    fn immutable_checksum(&self) -> u64 {
        xxh3_64(&self.map[offsets::HEAP_SIZE..offsets::CHECKSUM])
    }

    // -- accessors ---------------------------------------------------------

    #[must_use]
    pub fn heap_size(&self) -> u64 {
        self.heap_size
    }

    fn base(&self) -> *mut u8 {
        self.map.as_ptr().cast_mut()
    }

    fn header_bytes(&self, off: usize, len: usize) -> &[u8] {
        &self.map[off..off + len]
    }

    #[allow(clippy::mut_from_ref)]
    fn header_bytes_mut(&self, off: usize, len: usize) -> &mut [u8] {
        // Header scalar fields are written single-threaded (bootstrap/seal).
        unsafe { std::slice::from_raw_parts_mut(self.base().add(off), len) }
    }

    fn read_u32(&self, off: usize) -> u32 {
        u32::from_le_bytes(self.header_bytes(off, 4).try_into().expect("4 bytes"))
    }

    fn write_u32(&self, off: usize, val: u32) {
        self.header_bytes_mut(off, 4).copy_from_slice(&val.to_le_bytes());
    }

    fn read_u64(&self, off: usize) -> u64 {
        u64::from_le_bytes(self.header_bytes(off, 8).try_into().expect("8 bytes"))
    }

    fn write_u64(&self, off: usize, val: u64) {
        self.header_bytes_mut(off, 8).copy_from_slice(&val.to_le_bytes());
    }

    // -- current-replica ticket -------------------------------------------

    fn cur_comb_atomic(&self) -> &AtomicU64 {
        // The word at CUR_COMB is 8-aligned (the mapping is page-aligned).
        unsafe { &*self.base().add(offsets::CUR_COMB).cast::<AtomicU64>() }
    }

    /// The header's current-replica ticket.
    #[must_use]
    pub fn cur_comb(&self) -> Ticket {
        Ticket(self.cur_comb_atomic().load(Ordering::SeqCst))
    }

    /// Publication CAS on the current-replica ticket.
    pub fn cas_cur_comb(&self, old: Ticket, new: Ticket) -> bool {
        self.cur_comb_atomic()
            .compare_exchange(old.0, new.0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Write back the header line holding the current ticket.
    pub fn flush_cur_comb(&self) {
        unsafe { pwb::pwb(self.base().add(offsets::CUR_COMB)) };
    }

    // -- replica heap access ----------------------------------------------

    fn replica_base(&self, idx: usize) -> *mut u8 {
        debug_assert!(idx < self.replicas);
        unsafe {
            self.base()
                .add(HEADER_BYTES as usize + idx * self.heap_size as usize)
        }
    }

    /// Raw mapped address of the word at `off` in replica `idx` (for
    /// deferred write-back bookkeeping).
    #[must_use]
    pub fn word_addr(&self, idx: usize, off: u64) -> usize {
        debug_assert!(off + 8 <= self.heap_size);
        self.replica_base(idx) as usize + off as usize
    }

    /// Read the word at heap offset `off` in replica `idx`.
    ///
    /// Caller holds the replica shared or exclusive per the lock protocol.
    #[must_use]
    pub fn read_word(&self, idx: usize, off: u64) -> u64 {
        debug_assert!(off % 8 == 0 && off + 8 <= self.heap_size);
        unsafe { self.replica_base(idx).add(off as usize).cast::<u64>().read() }
    }

    /// Write the word at heap offset `off` in replica `idx`.
    ///
    /// Caller holds the replica exclusively.
    pub fn write_word(&self, idx: usize, off: u64, val: u64) {
        debug_assert!(off % 8 == 0 && off + 8 <= self.heap_size);
        unsafe {
            self.replica_base(idx)
                .add(off as usize)
                .cast::<u64>()
                .write(val);
        }
    }

    /// Copy `len` bytes at `off` from replica `src` to replica `dst`.
    /// Caller holds `src` shared and `dst` exclusive; `src != dst`.
    pub fn copy_bytes(&self, src: usize, dst: usize, off: u64, len: u64) {
        debug_assert_ne!(src, dst);
        debug_assert!(off + len <= self.heap_size);
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.replica_base(src).add(off as usize),
                self.replica_base(dst).add(off as usize),
                len as usize,
            );
        }
    }

    /// Flush every cache line of `[off, off+len)` in replica `idx`.
    pub fn flush_heap_range(&self, idx: usize, off: u64, len: u64) {
        unsafe {
            pwb::flush_range(self.replica_base(idx).add(off as usize), len as usize);
        }
    }
}
