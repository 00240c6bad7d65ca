//! Engine configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use carousel_error::{PtmError, PtmResult};

use crate::alloc::ALLOC_START;
use crate::region::HEADER_BYTES;

/// Default total region size: 128 MiB.
pub const DEFAULT_REGION_SIZE: u64 = 128 * 1024 * 1024;

/// Default replica count.
pub const DEFAULT_REPLICAS: usize = 4;

/// Default read-transaction fast-path attempts before a reader demotes
/// itself to an enqueued pseudo-write. An empirical knob, not a correctness
/// requirement.
pub const DEFAULT_READ_TRIES: u32 = 10;

/// Most replicas the engine will rotate. More replicas trade memory for
/// less copy pressure under writer churn.
pub const MAX_REPLICAS: usize = 32;

/// Smallest useful replica heap: the allocator metadata plus one page of
/// allocatable space.
const MIN_HEAP: u64 = ALLOC_START + 4096;

/// How to open a persistent region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtmConfig {
    /// Backing file. Created and sized on first open.
    pub path: PathBuf,
    /// Total file size: header plus `replicas` equal heaps.
    pub region_size: u64,
    /// Full-heap replicas to rotate through.
    pub replicas: usize,
    /// Read fast-path attempts before enqueueing as a pseudo-write.
    pub read_tries: u32,
}

impl PtmConfig {
    /// Configuration with defaults for everything but the path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            region_size: DEFAULT_REGION_SIZE,
            replicas: DEFAULT_REPLICAS,
            read_tries: DEFAULT_READ_TRIES,
        }
    }

    #[must_use]
    pub fn region_size(mut self, bytes: u64) -> Self {
        self.region_size = bytes;
        self
    }

    #[must_use]
    pub fn replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    #[must_use]
    pub fn read_tries(mut self, tries: u32) -> Self {
        self.read_tries = tries.max(1);
        self
    }

    pub(crate) fn validate(&self) -> PtmResult<()> {
        if !(2..=MAX_REPLICAS).contains(&self.replicas) {
            return Err(PtmError::InvalidReplicaCount {
                replicas: self.replicas,
                max: MAX_REPLICAS,
            });
        }
        let needed = HEADER_BYTES + self.replicas as u64 * MIN_HEAP;
        if self.region_size < needed {
            return Err(PtmError::RegionTooSmall {
                region_bytes: self.region_size,
                replicas: self.replicas,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(PtmConfig::new("/tmp/x.ptm").validate().is_ok());
    }

    #[test]
    fn replica_bounds() {
        let one = PtmConfig::new("/tmp/x.ptm").replicas(1);
        assert!(matches!(
            one.validate(),
            Err(PtmError::InvalidReplicaCount { replicas: 1, .. })
        ));
        let many = PtmConfig::new("/tmp/x.ptm").replicas(MAX_REPLICAS + 1);
        assert!(many.validate().is_err());
    }

    #[test]
    fn region_must_fit_every_heap() {
        let cfg = PtmConfig::new("/tmp/x.ptm").replicas(4).region_size(8192);
        assert!(matches!(cfg.validate(), Err(PtmError::RegionTooSmall { .. })));
    }
}
