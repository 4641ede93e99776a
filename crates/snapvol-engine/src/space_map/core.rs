//! In-memory space map.
//!
//! A plain array of counts. Used for the block manager's own
//! bookkeeping, as the bootstrap map while building an on-disk map,
//! and in tests as the baseline oracle. `commit` is a no-op.

use parking_lot::Mutex;
use snapvol_common::{Result, SnapError};

use crate::block::BlockLocation;

use super::SpaceMap;

struct CoreInner {
    counts: Vec<u32>,
    nr_free: u64,
    /// Lower bound for the free-block scan. Never points past a free
    /// block; only advances past blocks known non-free.
    maybe_first_free: u64,
}

pub struct CoreSpaceMap {
    inner: Mutex<CoreInner>,
}

impl CoreSpaceMap {
    pub fn new(nr_blocks: u64) -> Self {
        Self {
            inner: Mutex::new(CoreInner {
                counts: vec![0; nr_blocks as usize],
                nr_free: nr_blocks,
                maybe_first_free: 0,
            }),
        }
    }
}

impl CoreInner {
    fn check(&self, b: BlockLocation) -> Result<()> {
        if b as usize >= self.counts.len() {
            return Err(SnapError::InvalidArgument(format!(
                "block {b} out of space map range"
            )));
        }
        Ok(())
    }

    fn scan_free(&self, low: u64, high: u64) -> Result<BlockLocation> {
        let low = low.max(self.maybe_first_free);
        let high = high.min(self.counts.len() as u64);

        for b in low..high {
            if self.counts[b as usize] == 0 {
                return Ok(b);
            }
        }
        Err(SnapError::OutOfSpace)
    }
}

impl SpaceMap for CoreSpaceMap {
    fn nr_blocks(&self) -> u64 {
        self.inner.lock().counts.len() as u64
    }

    fn nr_free(&self) -> u64 {
        self.inner.lock().nr_free
    }

    fn new_block(&self) -> Result<BlockLocation> {
        let mut inner = self.inner.lock();
        let b = inner.scan_free(0, u64::MAX)?;
        inner.counts[b as usize] = 1;
        inner.maybe_first_free = b + 1;
        inner.nr_free -= 1;
        Ok(b)
    }

    fn get_free(&self) -> Result<BlockLocation> {
        self.inner.lock().scan_free(0, u64::MAX)
    }

    fn get_free_in_range(
        &self,
        low: BlockLocation,
        high: BlockLocation,
    ) -> Result<BlockLocation> {
        self.inner.lock().scan_free(low, high)
    }

    fn inc_block(&self, b: BlockLocation) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check(b)?;
        if inner.counts[b as usize] == 0 {
            inner.nr_free -= 1;
        }
        inner.counts[b as usize] += 1;
        Ok(())
    }

    fn dec_block(&self, b: BlockLocation) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check(b)?;
        if inner.counts[b as usize] == 0 {
            return Err(SnapError::InvalidArgument(format!(
                "refcount underflow for block {b}"
            )));
        }

        inner.counts[b as usize] -= 1;
        if inner.counts[b as usize] == 0 {
            inner.nr_free += 1;
            if inner.maybe_first_free > b {
                inner.maybe_first_free = b;
            }
        }
        Ok(())
    }

    fn get_count(&self, b: BlockLocation) -> Result<u32> {
        let inner = self.inner.lock();
        inner.check(b)?;
        Ok(inner.counts[b as usize])
    }

    fn set_count(&self, b: BlockLocation, count: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check(b)?;

        let old = inner.counts[b as usize];
        if old == 0 && count > 0 {
            inner.nr_free -= 1;
        } else if old > 0 && count == 0 {
            inner.nr_free += 1;
            if inner.maybe_first_free > b {
                inner.maybe_first_free = b;
            }
        }

        inner.counts[b as usize] = count;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        Ok(())
    }
}

// Tests
