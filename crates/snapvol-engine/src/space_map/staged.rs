//! Staged space map: an in-memory overlay over another map.
//!
//! Batches count changes so the wrapped map only moves at commit, and
//! breaks the recursion of the on-disk map: updating a count there
//! shadows tree nodes, which allocates and frees more blocks, and
//! those land back in this overlay. Commit drains the overlay until
//! it stops refilling.
//!
//! A block freed in this transaction but still counted on disk is not
//! handed out again before commit; the committed state still
//! references it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use snapvol_common::{Result, SnapError};
use tracing::debug;

use crate::block::BlockLocation;

use super::SpaceMap;

struct StagedState {
    /// Block -> effective count, for blocks touched this transaction.
    pending: BTreeMap<BlockLocation, u32>,
    /// Blocks whose deferred free is landing in the wrapped map right
    /// now. Not allocatable until the drain finishes: the previous
    /// root still references them, and the root write has not
    /// happened yet. Empty outside [`StagedSpaceMap::commit`].
    held: BTreeSet<BlockLocation>,
    nr_free: u64,
    maybe_first_free: u64,
}

pub struct StagedSpaceMap {
    inner: Arc<dyn SpaceMap>,
    state: Mutex<StagedState>,
}

impl StagedSpaceMap {
    pub fn new(inner: Arc<dyn SpaceMap>) -> Self {
        let nr_free = inner.nr_free();
        Self {
            inner,
            state: Mutex::new(StagedState {
                pending: BTreeMap::new(),
                held: BTreeSet::new(),
                nr_free,
                maybe_first_free: 0,
            }),
        }
    }

    /// Account for growth of the wrapped map. The caller extends the
    /// inner map first; this just keeps the cached free count honest.
    pub fn extend(&self, extra_blocks: u64) {
        self.state.lock().nr_free += extra_blocks;
    }

    /// Effective count plus the wrapped map's committed count. A block
    /// is only allocatable when both are zero.
    fn probe(&self, state: &StagedState, b: BlockLocation) -> Result<(u32, u32)> {
        let committed = self.inner.get_count(b)?;
        let effective = state.pending.get(&b).copied().unwrap_or(committed);
        Ok((effective, committed))
    }

    fn scan_free(&self, low: u64, high: u64) -> Result<BlockLocation> {
        let state = self.state.lock();
        let low = low.max(state.maybe_first_free);
        let high = high.min(self.inner.nr_blocks());

        for b in low..high {
            let (effective, committed) = self.probe(&state, b)?;
            if effective == 0 && committed == 0 && !state.held.contains(&b) {
                return Ok(b);
            }
        }
        Err(SnapError::OutOfSpace)
    }
}

impl SpaceMap for StagedSpaceMap {
    fn nr_blocks(&self) -> u64 {
        self.inner.nr_blocks()
    }

    fn nr_free(&self) -> u64 {
        self.state.lock().nr_free
    }

    fn new_block(&self) -> Result<BlockLocation> {
        let mut state = self.state.lock();
        let low = state.maybe_first_free;
        let high = self.inner.nr_blocks();

        for b in low..high {
            let (effective, committed) = self.probe(&state, b)?;
            if effective == 0 && committed == 0 && !state.held.contains(&b) {
                state.pending.insert(b, 1);
                state.nr_free -= 1;
                state.maybe_first_free = b + 1;
                return Ok(b);
            }
        }
        Err(SnapError::OutOfSpace)
    }

    fn get_free(&self) -> Result<BlockLocation> {
        self.scan_free(0, u64::MAX)
    }

    fn get_free_in_range(
        &self,
        low: BlockLocation,
        high: BlockLocation,
    ) -> Result<BlockLocation> {
        self.scan_free(low, high)
    }

    fn inc_block(&self, b: BlockLocation) -> Result<()> {
        let mut state = self.state.lock();
        let (effective, committed) = self.probe(&state, b)?;

        if effective == 0 && committed == 0 {
            state.nr_free -= 1;
        }
        state.pending.insert(b, effective + 1);
        Ok(())
    }

    fn dec_block(&self, b: BlockLocation) -> Result<()> {
        let mut state = self.state.lock();
        let (effective, committed) = self.probe(&state, b)?;

        if effective == 0 {
            return Err(SnapError::InvalidArgument(format!(
                "refcount underflow for block {b}"
            )));
        }

        state.pending.insert(b, effective - 1);
        if effective == 1 && committed == 0 {
            // Allocated and released within this transaction; free for
            // reuse right away.
            state.nr_free += 1;
            if state.maybe_first_free > b {
                state.maybe_first_free = b;
            }
        }
        Ok(())
    }

    fn get_count(&self, b: BlockLocation) -> Result<u32> {
        let state = self.state.lock();
        Ok(self.probe(&state, b)?.0)
    }

    fn set_count(&self, b: BlockLocation, count: u32) -> Result<()> {
        let mut state = self.state.lock();
        let (effective, committed) = self.probe(&state, b)?;

        if committed == 0 {
            if effective == 0 && count > 0 {
                state.nr_free -= 1;
            } else if effective > 0 && count == 0 {
                state.nr_free += 1;
                if state.maybe_first_free > b {
                    state.maybe_first_free = b;
                }
            }
        }
        state.pending.insert(b, count);
        Ok(())
    }

    /// Drain the overlay into the wrapped map. Applying a count may
    /// push further entries back into the overlay (tree shadowing), so
    /// drain rounds repeat until one comes up empty.
    ///
    /// Frees go last in each round and the freed blocks are held out
    /// of allocation for the rest of the drain. Otherwise an in-drain
    /// allocation could overwrite a block the previous root still
    /// references, and a crash before the root write would expose it.
    fn commit(&self) -> Result<()> {
        let mut rounds = 0usize;
        loop {
            // The state lock cannot be held while applying: the
            // wrapped map's updates allocate through this map.
            let batch: Vec<(BlockLocation, u32)> = {
                let mut state = self.state.lock();
                if state.pending.is_empty() {
                    break;
                }
                std::mem::take(&mut state.pending).into_iter().collect()
            };

            rounds += 1;
            let (frees, counts): (Vec<_>, Vec<_>) =
                batch.into_iter().partition(|&(_, count)| count == 0);
            for (b, count) in counts {
                self.inner.set_count(b, count)?;
            }
            for (b, _) in frees {
                self.state.lock().held.insert(b);
                self.inner.set_count(b, 0)?;
            }
        }
        debug!(rounds, "space map overlay drained");

        self.inner.commit()?;

        let mut state = self.state.lock();
        state.held.clear();
        state.nr_free = self.inner.nr_free();
        state.maybe_first_free = 0;
        Ok(())
    }
}

// Tests
