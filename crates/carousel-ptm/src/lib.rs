//! Carousel: a persistent transactional memory over a memory-mapped file.
//!
//! Many threads apply atomic, durable mutations to data structures living
//! inside a mapped region; after a crash and remap the region reflects
//! exactly the committed transactions and nothing else. The engine keeps a
//! rotating pool of full-heap replicas: a committing writer prepares a
//! non-current replica (replaying the redo logs it missed, or copying),
//! executes its own and other threads' announced mutations in one flat
//! combining pass, flushes and fences every dirtied line, and publishes the
//! replica with a single header CAS. Readers run wait-free against whichever
//! replica is current.
//!
//! ```no_run
//! use carousel_ptm::{Ptm, PtmConfig};
//!
//! # fn main() -> Result<(), carousel_error::PtmError> {
//! let ptm = Ptm::open(PtmConfig::new("/tmp/demo.ptm"))?;
//! ptm.write(|tx| {
//!     let counter = tx.alloc::<u64>(8)?;
//!     counter.word::<u64>(0).store(tx, 1);
//!     tx.set_root(0, counter);
//!     Ok(0)
//! })?;
//! let value = ptm.read(|tx| Ok(tx.root::<u64>(0).word::<u64>(0).load(tx)))?;
//! assert_eq!(value, 1);
//! # Ok(())
//! # }
//! ```

pub mod alloc;
pub mod cell;
pub mod config;
pub mod engine;
pub mod hazard;
pub mod pwb;
pub mod redo;
pub mod region;
pub mod registry;
pub mod rilock;
pub mod ticket;

pub use carousel_error::{PtmError, PtmResult, TxAbort};

pub use cell::{HeapOffset, PCell, PPtr, PWord, WordAccess};
pub use config::PtmConfig;
pub use engine::{EngineMetricsSnapshot, Ptm, TxScope};
