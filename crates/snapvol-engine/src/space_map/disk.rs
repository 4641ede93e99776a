//! On-disk space map: reference counts stored in a COW B+-tree.
//!
//! Keyed by block location, valued by a u32 count; a missing key
//! means zero. Because the tree is shadowed through the transaction
//! manager, count updates allocate metadata blocks themselves, so
//! this map is never used directly as a transaction manager's
//! allocator; it is always wrapped in a
//! [`StagedSpaceMap`](super::StagedSpaceMap) which absorbs the
//! recursion.
//!
//! Its persistent root is a small byte string the caller stows in the
//! superblock.

use std::sync::Arc;

use parking_lot::Mutex;
use snapvol_common::{Result, SnapError};

use crate::block::BlockLocation;
use crate::btree::{self, BTreeInfo};
use crate::transaction::TransactionManager;

use super::SpaceMap;

/// Size of the serialized root, as stored in the superblock.
pub const SM_ROOT_SIZE: usize = 24;

struct DiskInner {
    root: BlockLocation,
    nr_blocks: u64,
    nr_free: u64,
    maybe_first_free: u64,
}

pub struct DiskSpaceMap {
    info: BTreeInfo<u32>,
    inner: Mutex<DiskInner>,
}

impl DiskSpaceMap {
    /// Create a fresh map covering `nr_blocks`, all free. Allocates
    /// the tree root through `tm`.
    pub fn create(tm: Arc<TransactionManager>, nr_blocks: u64) -> Result<Self> {
        let info = BTreeInfo::new(tm, 1);
        let root = btree::empty(&info)?;
        Ok(Self {
            info,
            inner: Mutex::new(DiskInner {
                root,
                nr_blocks,
                nr_free: nr_blocks,
                maybe_first_free: 0,
            }),
        })
    }

    /// Reopen from a serialized root.
    pub fn open(tm: Arc<TransactionManager>, bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SM_ROOT_SIZE {
            return Err(SnapError::Corrupt {
                location: "space map root".into(),
                details: "serialized root too short".into(),
            });
        }

        let word = |i: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            u64::from_le_bytes(w)
        };

        Ok(Self {
            info: BTreeInfo::new(tm, 1),
            inner: Mutex::new(DiskInner {
                root: word(0),
                nr_blocks: word(1),
                nr_free: word(2),
                maybe_first_free: 0,
            }),
        })
    }

    pub fn root_size() -> usize {
        SM_ROOT_SIZE
    }

    /// Serialize the root for the superblock. Only meaningful after
    /// the wrapping staged map has committed.
    pub fn copy_root(&self) -> [u8; SM_ROOT_SIZE] {
        let inner = self.inner.lock();
        let mut out = [0u8; SM_ROOT_SIZE];
        out[0..8].copy_from_slice(&inner.root.to_le_bytes());
        out[8..16].copy_from_slice(&inner.nr_blocks.to_le_bytes());
        out[16..24].copy_from_slice(&inner.nr_free.to_le_bytes());
        out
    }

    /// Grow the managed range. New blocks start free (no tree entry).
    pub fn extend(&self, extra_blocks: u64) {
        let mut inner = self.inner.lock();
        inner.nr_blocks += extra_blocks;
        inner.nr_free += extra_blocks;
    }

    fn check(&self, b: BlockLocation) -> Result<()> {
        if b >= self.inner.lock().nr_blocks {
            return Err(SnapError::InvalidArgument(format!(
                "block {b} out of space map range"
            )));
        }
        Ok(())
    }

    /// Free-block scan. Each probe is a tree lookup; the cursor keeps
    /// it from re-walking the allocated prefix.
    fn scan_free(&self, low: u64, high: u64) -> Result<BlockLocation> {
        let (low, high) = {
            let inner = self.inner.lock();
            (
                low.max(inner.maybe_first_free),
                high.min(inner.nr_blocks),
            )
        };

        for b in low..high {
            if self.get_count(b)? == 0 {
                return Ok(b);
            }
        }
        Err(SnapError::OutOfSpace)
    }
}

impl SpaceMap for DiskSpaceMap {
    fn nr_blocks(&self) -> u64 {
        self.inner.lock().nr_blocks
    }

    fn nr_free(&self) -> u64 {
        self.inner.lock().nr_free
    }

    fn new_block(&self) -> Result<BlockLocation> {
        let b = self.scan_free(0, u64::MAX)?;
        self.set_count(b, 1)?;
        self.inner.lock().maybe_first_free = b + 1;
        Ok(b)
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
        let count = self.get_count(b)?;
        self.set_count(b, count + 1)
    }

    fn dec_block(&self, b: BlockLocation) -> Result<()> {
        let count = self.get_count(b)?;
        if count == 0 {
            return Err(SnapError::InvalidArgument(format!(
                "refcount underflow for block {b}"
            )));
        }
        self.set_count(b, count - 1)
    }

    fn get_count(&self, b: BlockLocation) -> Result<u32> {
        self.check(b)?;
        // The inner lock is not held across tree reads; mid-update
        // queries for other blocks see the previous root, which is
        // correct because their counts did not move.
        let root = self.inner.lock().root;
        match btree::lookup_equal(&self.info, root, &[b]) {
            Ok(count) => Ok(count),
            Err(SnapError::NotFound(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn set_count(&self, b: BlockLocation, count: u32) -> Result<()> {
        self.check(b)?;

        let old = self.get_count(b)?;
        if old == count {
            return Ok(());
        }

        let root = self.inner.lock().root;
        let new_root = btree::insert(&self.info, root, &[b], count)?;

        let mut inner = self.inner.lock();
        inner.root = new_root;
        if old == 0 {
            inner.nr_free -= 1;
        } else if count == 0 {
            inner.nr_free += 1;
            if inner.maybe_first_free > b {
                inner.maybe_first_free = b;
            }
        }
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        Ok(())
    }
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockManager;
    use crate::device::{DeviceConfig, FileBlockDevice};
    use crate::space_map::{CoreSpaceMap, StagedSpaceMap};
    use tempfile::tempdir;

    const NR_BLOCKS: u64 = 256;
    const CACHE_SIZE: usize = 16;

    fn mk_tm(dir: &std::path::Path) -> (Arc<TransactionManager>, Arc<CoreSpaceMap>) {
        let config = DeviceConfig {
            nr_blocks: NR_BLOCKS,
            ..Default::default()
        };
        let dev = Arc::new(FileBlockDevice::open(dir.join("dev"), config).unwrap());
        let bm = Arc::new(BlockManager::new(dev, CACHE_SIZE).unwrap());
        let core = Arc::new(CoreSpaceMap::new(NR_BLOCKS));
        core.inc_block(0).unwrap(); // reserved root block
        let tm = Arc::new(TransactionManager::new(
            bm,
            Arc::clone(&core) as Arc<dyn SpaceMap>,
        ));
        tm.begin(0).unwrap();
        (tm, core)
    }

    #[test]
    fn test_counts_live_in_the_tree() {
        let dir = tempdir().unwrap();
        let (tm, _) = mk_tm(dir.path());
        let sm = DiskSpaceMap::create(tm, 100).unwrap();

        assert_eq!(sm.nr_blocks(), 100);
        assert_eq!(sm.nr_free(), 100);

        let a = sm.new_block().unwrap();
        let b = sm.new_block().unwrap();
        assert_ne!(a, b);
        sm.inc_block(a).unwrap();
        assert_eq!(sm.get_count(a).unwrap(), 2);
        sm.dec_block(a).unwrap();
        assert_eq!(sm.get_count(a).unwrap(), 1);

        sm.set_count(50, 3).unwrap();
        assert_eq!(sm.get_count(50).unwrap(), 3);
        assert_eq!(sm.get_count(99).unwrap(), 0);
        assert_eq!(sm.nr_free(), 97);

        assert!(matches!(
            sm.get_count(100),
            Err(SnapError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_reopen_from_root_does_not_double_allocate() {
        let dir = tempdir().unwrap();
        let (tm, _) = mk_tm(dir.path());

        let sm = DiskSpaceMap::create(Arc::clone(&tm), 100).unwrap();
        let a = sm.new_block().unwrap();
        let b = sm.new_block().unwrap();
        sm.set_count(50, 3).unwrap();

        let root = sm.copy_root();
        assert_eq!(root.len(), DiskSpaceMap::root_size());

        let back = DiskSpaceMap::open(tm, &root).unwrap();
        assert_eq!(back.nr_blocks(), 100);
        assert_eq!(back.nr_free(), sm.nr_free());
        assert_eq!(back.get_count(a).unwrap(), 1);
        assert_eq!(back.get_count(50).unwrap(), 3);

        let c = back.new_block().unwrap();
        assert!(c != a && c != b && c != 50);
    }

    /// The bootstrap wiring: the transaction manager starts on a core
    /// map, the disk map's counts land in a staged overlay, and the
    /// staged map takes over. Draining then re-enters this map for
    /// every tree update.
    #[test]
    fn test_staged_commit_drains_through_the_tree() {
        let dir = tempdir().unwrap();
        let (tm, core) = mk_tm(dir.path());

        let disk = Arc::new(DiskSpaceMap::create(Arc::clone(&tm), NR_BLOCKS).unwrap());
        let staged = Arc::new(StagedSpaceMap::new(
            Arc::clone(&disk) as Arc<dyn SpaceMap>
        ));
        for b in 0..NR_BLOCKS {
            let count = core.get_count(b).unwrap();
            if count > 0 {
                staged.set_count(b, count).unwrap();
            }
        }
        tm.set_space_map(Arc::clone(&staged) as Arc<dyn SpaceMap>);

        staged.commit().unwrap();
        assert_eq!(disk.get_count(0).unwrap(), 1);

        let x = staged.new_block().unwrap();
        staged.commit().unwrap();
        assert_eq!(disk.get_count(x).unwrap(), 1);

        // The serialized root sees the same allocations.
        let back = DiskSpaceMap::open(Arc::clone(&tm), &disk.copy_root()).unwrap();
        assert_eq!(back.get_count(x).unwrap(), 1);
        assert_ne!(back.get_free().unwrap(), x);
    }

    #[test]
    fn test_extend_grows_the_range() {
        let dir = tempdir().unwrap();
        let (tm, _) = mk_tm(dir.path());
        let sm = DiskSpaceMap::create(tm, 10).unwrap();

        for _ in 0..10 {
            sm.new_block().unwrap();
        }
        assert!(matches!(sm.new_block(), Err(SnapError::OutOfSpace)));

        sm.extend(5);
        assert_eq!(sm.nr_blocks(), 15);
        assert_eq!(sm.new_block().unwrap(), 10);
    }
}
