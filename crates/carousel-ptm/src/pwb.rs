//! Persistent write-back and fencing primitives.
//!
//! Naming follows "Preserving Happens-before in Persistent Memory"
//! (Izraelevitz, Mendes, Scott): `pwb` writes a cache line back toward the
//! persistence domain, `pfence` orders preceding `pwb`s before subsequent
//! stores, `psync` additionally waits for completion.
//!
//! On x86_64 `pwb` is `clflush` (ordered, universally available — the
//! conservative choice) and the fences are `sfence`. On other targets the
//! mapped file gives process-crash persistency without explicit write-back,
//! so `pwb` is a no-op and the fences degrade to compiler/memory fences.
//!
//! ## Deferred flushes
//!
//! A write attempt batches the cache lines it dirties in a [`PwbLog`] and
//! flushes them once, immediately before publication. Entries are
//! deduplicated at insertion against the most recent line (repeated stores
//! to one line are the common case); residual duplicates only cost an extra
//! flush.

/// Cache line size assumed for flush granularity.
pub const CACHE_LINE: usize = 64;

/// Round an address down to its cache line.
#[inline]
#[must_use]
pub fn line_of(addr: usize) -> usize {
    addr & !(CACHE_LINE - 1)
}

/// Write the cache line containing `addr` back to the persistence domain.
///
/// # Safety
///
/// `addr` must point into a live mapping.
#[inline]
pub unsafe fn pwb(addr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_mm_clflush(addr);
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = addr;
    }
}

/// Order preceding write-backs before subsequent stores.
#[inline]
pub fn pfence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_mm_sfence();
    }
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Drain: all preceding write-backs are durable when this returns.
#[inline]
pub fn psync() {
    pfence();
}

/// Flush every cache line in `[addr, addr + len)`.
///
/// # Safety
///
/// The whole range must lie inside a live mapping.
pub unsafe fn flush_range(addr: *const u8, len: usize) {
    let start = line_of(addr as usize);
    let end = addr as usize + len;
    let mut line = start;
    while line < end {
        unsafe { pwb(line as *const u8) };
        line += CACHE_LINE;
    }
}

// ---------------------------------------------------------------------------
// PwbLog
// ---------------------------------------------------------------------------

/// Per-attempt batch of cache lines awaiting write-back.
#[derive(Default)]
pub struct PwbLog {
    lines: Vec<usize>,
}

impl PwbLog {
    #[must_use]
    pub fn new() -> Self {
        Self { lines: Vec::with_capacity(256) }
    }

    /// Record the line containing `addr`. Consecutive stores to one line
    /// collapse to one entry.
    #[inline]
    pub fn defer(&mut self, addr: usize) {
        let line = line_of(addr);
        if self.lines.last() != Some(&line) {
            self.lines.push(line);
        }
    }

    /// Flush every deferred line and reset.
    pub fn flush(&mut self) {
        for &line in &self.lines {
            // Lines were recorded from live mapping addresses.
            unsafe { pwb(line as *const u8) };
        }
        self.lines.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_rounding() {
        assert_eq!(line_of(0), 0);
        assert_eq!(line_of(63), 0);
        assert_eq!(line_of(64), 64);
        assert_eq!(line_of(130), 128);
    }

    #[test]
    fn deferred_lines_dedup_consecutive() {
        let buf = vec![0u8; 256];
        let base = buf.as_ptr() as usize;
        let mut log = PwbLog::new();
        log.defer(base);
        log.defer(base + 8);
        log.defer(base + 16);
        log.defer(base + CACHE_LINE);
        assert_eq!(log.lines.len(), 2);
        log.flush();
        assert!(log.is_empty());
    }

    #[test]
    fn flush_range_covers_partial_lines() {
        let buf = vec![7u8; 1024];
        // Start mid-line, end mid-line: must not fault and must terminate.
        unsafe { flush_range(buf.as_ptr().add(10), 700) };
        pfence();
        psync();
    }
}
