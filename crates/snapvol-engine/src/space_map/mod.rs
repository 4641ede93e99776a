//! Space maps: one reference count per block.
//!
//! The space map is both the free-block allocator and the sharing
//! detector: a count of zero means free, a count above one means the
//! block is referenced from more than one place. Variants share one
//! operation table: an in-memory map, an on-disk map persisted as a
//! COW B+-tree, and a staged decorator that batches mutations so the
//! bookkeeping commits atomically with the rest of a transaction.

mod core;
mod disk;
mod staged;

use snapvol_common::Result;

use crate::block::BlockLocation;

pub use self::core::CoreSpaceMap;
pub use self::disk::{DiskSpaceMap, SM_ROOT_SIZE};
pub use self::staged::StagedSpaceMap;

/// Reference-count tracking per block.
///
/// Implementations use interior mutability; callers serialize writes
/// (single-writer-per-transaction discipline).
pub trait SpaceMap: Send + Sync {
    fn nr_blocks(&self) -> u64;

    fn nr_free(&self) -> u64;

    /// Allocate the lowest-indexed free block and set its count to 1.
    fn new_block(&self) -> Result<BlockLocation>;

    /// Find a free block without allocating it.
    fn get_free(&self) -> Result<BlockLocation>;

    /// Find a free block in `[low, high)` without allocating it.
    fn get_free_in_range(&self, low: BlockLocation, high: BlockLocation)
    -> Result<BlockLocation>;

    fn inc_block(&self, b: BlockLocation) -> Result<()>;

    /// Decrement a block's count. Underflow is a programmer error and
    /// is reported, never masked.
    fn dec_block(&self, b: BlockLocation) -> Result<()>;

    fn get_count(&self, b: BlockLocation) -> Result<u32>;

    fn set_count(&self, b: BlockLocation, count: u32) -> Result<()>;

    /// Flush any pending state.
    fn commit(&self) -> Result<()>;
}
