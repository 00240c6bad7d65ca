//! Error taxonomy for the Carousel persistent transactional memory.
//!
//! Two kinds of failure flow through the engine and they are kept as
//! separate types on purpose:
//!
//! - [`PtmError`] — engine-level failures surfaced to the caller of
//!   `Ptm::open` / `Ptm::write` / `Ptm::read`. Some are fatal invariant
//!   breaks (a present-but-corrupt header), most are local conditions.
//! - [`TxAbort`] — the reason a *mutation closure* gave up. A combined
//!   closure that aborts has its partial redo-log effects undone and its
//!   abort code recorded in the transaction slot; other threads' combined
//!   work in the same commit is unaffected.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used across the workspace.
pub type PtmResult<T> = Result<T, PtmError>;

/// Primary error type for Carousel operations.
#[derive(Error, Debug)]
pub enum PtmError {
    /// File I/O error while creating, sizing, or mapping the backing file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configured region cannot hold the header plus one replica heap.
    #[error("region too small: {region_bytes} bytes for {replicas} replicas")]
    RegionTooSmall { region_bytes: u64, replicas: usize },

    /// Replica count outside the supported range.
    #[error("invalid replica count {replicas} (need 2..={max})")]
    InvalidReplicaCount { replicas: usize, max: usize },

    /// Header magic is valid but the recorded geometry disagrees with the
    /// file or the configuration. Continuing would interpret one layout
    /// through another, so this is fatal.
    #[error("persistent header corrupt: {detail} ('{path}')")]
    HeaderCorrupt { path: PathBuf, detail: String },

    /// An existing mapping was opened with a mismatched configuration.
    #[error("configuration mismatch: {detail}")]
    ConfigMismatch { detail: String },

    /// A transaction closure aborted; the transaction's effects were undone.
    #[error("transaction aborted: {0}")]
    Aborted(TxAbort),

    /// A transaction closure panicked while being combined. The closure's
    /// partial effects were rolled back; the commit it rode on is intact.
    #[error("transaction closure panicked")]
    ClosurePanicked,

    /// `Ptm::write` / `Ptm::read` was re-entered from inside a transaction
    /// closure on the same thread.
    #[error("cannot start a transaction within a transaction")]
    NestedTransaction,

    /// Thread registration beyond the compiled-in capacity. This is a
    /// configuration limit, not a transient condition.
    #[error("too many concurrent threads (cap {cap})")]
    TooManyThreads { cap: usize },
}

/// Why a mutation closure gave up.
///
/// `TxAbort` is deliberately small and `Copy`: it crosses threads through a
/// transaction slot's scoreboard, packed next to the closure's result word.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAbort {
    /// The in-heap allocator could not satisfy a request.
    #[error("persistent heap exhausted")]
    HeapExhausted,

    /// User-defined abort with an application code.
    #[error("user abort (code {0})")]
    User(u64),
}

impl TxAbort {
    /// Pack for transport through a slot's `aborted`/`results` word pair.
    #[must_use]
    pub fn code(self) -> u64 {
        match self {
            TxAbort::HeapExhausted => 0,
            TxAbort::User(c) => c,
        }
    }

    /// Inverse of [`code`](Self::code) given the discriminant byte.
    #[must_use]
    pub fn from_parts(kind: u8, code: u64) -> Option<Self> {
        match kind {
            1 => Some(TxAbort::HeapExhausted),
            2 => Some(TxAbort::User(code)),
            _ => None,
        }
    }

    /// Discriminant byte for the slot scoreboard. Zero means "not aborted".
    #[must_use]
    pub fn kind(self) -> u8 {
        match self {
            TxAbort::HeapExhausted => 1,
            TxAbort::User(_) => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_roundtrips_through_parts() {
        for abort in [TxAbort::HeapExhausted, TxAbort::User(7), TxAbort::User(0)] {
            let rebuilt = TxAbort::from_parts(abort.kind(), abort.code()).unwrap();
            assert_eq!(rebuilt, abort);
        }
        assert_eq!(TxAbort::from_parts(0, 0), None);
    }

    #[test]
    fn errors_render() {
        let e = PtmError::RegionTooSmall {
            region_bytes: 4096,
            replicas: 4,
        };
        assert!(e.to_string().contains("region too small"));
        let e = PtmError::Aborted(TxAbort::User(3));
        assert!(e.to_string().contains("user abort"));
    }
}
