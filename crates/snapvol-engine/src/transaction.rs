//! Transaction manager: copy-on-write shadowing over the block cache.
//!
//! Mutations never touch committed blocks in place. A block is
//! "shadowed" (copied to a freshly allocated block) the first time a
//! transaction writes it, and all further writes within the
//! transaction hit the shadow directly. Commit makes the whole
//! transaction visible by writing a single root block last; a crash
//! before that write leaves the previous committed state intact.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use snapvol_common::{Result, SnapError};
use tracing::debug;

use crate::block::{BlockLocation, BlockManager, ReadGuard, WriteGuard};
use crate::space_map::SpaceMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Open,
    PreCommitted,
}

struct TmState {
    phase: Phase,
    root: BlockLocation,
    /// Committed location -> shadow location, for this transaction.
    shadows: HashMap<BlockLocation, BlockLocation>,
    /// Blocks created or shadowed this transaction. Writing these
    /// again needs no further copy.
    private: HashSet<BlockLocation>,
}

pub struct TransactionManager {
    bm: Arc<BlockManager>,
    /// Swappable so an on-disk space map can be bootstrapped through a
    /// transient in-memory one.
    sm: RwLock<Arc<dyn SpaceMap>>,
    state: Mutex<TmState>,
}

impl TransactionManager {
    pub fn new(bm: Arc<BlockManager>, sm: Arc<dyn SpaceMap>) -> Self {
        Self {
            bm,
            sm: RwLock::new(sm),
            state: Mutex::new(TmState {
                phase: Phase::Idle,
                root: 0,
                shadows: HashMap::new(),
                private: HashSet::new(),
            }),
        }
    }

    pub fn block_manager(&self) -> Arc<BlockManager> {
        Arc::clone(&self.bm)
    }

    pub fn space_map(&self) -> Arc<dyn SpaceMap> {
        Arc::clone(&self.sm.read())
    }

    /// Replace the space map. Used once, after bootstrap; the caller
    /// is responsible for having migrated the counts across.
    pub fn set_space_map(&self, sm: Arc<dyn SpaceMap>) {
        *self.sm.write() = sm;
    }

    /// Open a transaction rooted at `root`. The root block is the one
    /// whose eventual rewrite commits everything else.
    pub fn begin(&self, root: BlockLocation) -> Result<()> {
        let mut state = self.state.lock();
        if state.phase != Phase::Idle {
            return Err(SnapError::InvalidArgument("transaction already open".into()));
        }

        state.phase = Phase::Open;
        state.root = root;
        state.shadows.clear();
        state.private.clear();
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        let state = self.state.lock();
        if state.phase != Phase::Open {
            return Err(SnapError::InvalidArgument("no open transaction".into()));
        }
        Ok(())
    }

    /// Allocate a zeroed block private to this transaction. The
    /// returned guard holds it write-locked; its count is already 1.
    pub fn new_block(&self) -> Result<WriteGuard> {
        self.check_open()?;

        let loc = self.sm.read().new_block()?;
        let guard = self.bm.write_lock_zero(loc)?;

        self.state.lock().private.insert(loc);
        Ok(guard)
    }

    /// Get a writeable version of `loc`.
    ///
    /// A block this transaction created or shadowed, and still holds
    /// exclusively, is locked in place. Otherwise its contents are
    /// copied to a fresh block, the original's count is dropped, and
    /// the copy is returned. The second element is true when the
    /// caller must increment everything the original referenced: the
    /// original survives (it was shared), so its references now have
    /// one more holder. Only the caller knows the block's
    /// interpretation, so only the caller can do those increments.
    ///
    /// A private block whose count has risen above one (a snapshot was
    /// taken of an uncommitted root) is copied again; writing it in
    /// place would leak this transaction's later changes into the
    /// snapshot.
    pub fn shadow(&self, loc: BlockLocation) -> Result<(WriteGuard, bool)> {
        self.check_open()?;

        // Follow shadows made earlier this transaction.
        let mut loc = loc;
        loop {
            match self.state.lock().shadows.get(&loc) {
                Some(&s) => loc = s,
                None => break,
            }
        }

        let sm = self.space_map();
        let count = sm.get_count(loc)?;
        let is_private = self.state.lock().private.contains(&loc);

        // The count of a private block can read as zero transiently
        // while a staged space map drains; the private set is
        // authoritative for blocks this transaction owns.
        if is_private && count <= 1 {
            return Ok((self.bm.write_lock(loc)?, false));
        }

        if count == 0 {
            return Err(SnapError::InvalidArgument(format!(
                "shadowing unallocated block {loc}"
            )));
        }

        let new_loc = sm.new_block()?;
        let new_guard = self.bm.write_lock_zero(new_loc)?;
        {
            let old_guard = self.bm.read_lock(loc)?;
            new_guard.data_mut().copy_from_slice(&old_guard.data());
        }
        sm.dec_block(loc)?;

        debug!(old = loc, new = new_loc, count, "shadowed block");

        let mut state = self.state.lock();
        state.shadows.insert(loc, new_loc);
        state.private.remove(&loc);
        state.private.insert(new_loc);

        // count > 1: the original stays live under other referents, so
        // the shadow is a second holder of everything it points at.
        Ok((new_guard, count > 1))
    }

    pub fn read_lock(&self, loc: BlockLocation) -> Result<ReadGuard> {
        self.bm.read_lock(loc)
    }

    pub fn inc(&self, loc: BlockLocation) -> Result<()> {
        self.sm.read().inc_block(loc)
    }

    pub fn dec(&self, loc: BlockLocation) -> Result<()> {
        self.sm.read().dec_block(loc)
    }

    pub fn ref_count(&self, loc: BlockLocation) -> Result<u32> {
        self.sm.read().get_count(loc)
    }

    /// First half of commit: push the space map's pending state down
    /// and flush every dirty block except those still write-locked
    /// (the root, which the caller holds). After this only the root
    /// write remains.
    pub fn pre_commit(&self) -> Result<()> {
        self.check_open()?;

        // The space map commit may allocate and shadow more metadata
        // blocks, which re-enters this manager; no lock of ours may be
        // held across it.
        let sm = self.space_map();
        sm.commit()?;
        self.bm.flush(true)?;

        self.state.lock().phase = Phase::PreCommitted;
        Ok(())
    }

    /// Second half of commit: write the root block and release it.
    /// Once the root is on stable storage the transaction is durable.
    pub fn commit(&self, root: WriteGuard) -> Result<()> {
        {
            let state = self.state.lock();
            if state.phase != Phase::PreCommitted {
                return Err(SnapError::InvalidArgument("commit without pre-commit".into()));
            }
            if root.location() != state.root {
                return Err(SnapError::InvalidArgument(format!(
                    "commit with wrong root block {} (expected {})",
                    root.location(),
                    state.root
                )));
            }
        }

        let loc = root.location();
        self.bm.flush_block(loc)?;
        drop(root);

        let mut state = self.state.lock();
        debug!(
            root = loc,
            shadows = state.shadows.len(),
            "committed transaction"
        );
        state.phase = Phase::Idle;
        state.shadows.clear();
        state.private.clear();
        Ok(())
    }

    /// Throw away the transaction's bookkeeping after a failure. The
    /// on-disk committed state is untouched; blocks allocated this
    /// transaction are simply leaked until the map is rebuilt.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.phase = Phase::Idle;
        state.shadows.clear();
        state.private.clear();
    }
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceConfig, FileBlockDevice};
    use crate::space_map::CoreSpaceMap;
    use tempfile::tempdir;

    const NR_BLOCKS: u64 = 1024;
    const CACHE_SIZE: usize = 16;

    fn mk_tm(dir: &std::path::Path) -> TransactionManager {
        let config = DeviceConfig {
            nr_blocks: NR_BLOCKS,
            ..Default::default()
        };
        let dev = Arc::new(FileBlockDevice::open(dir.join("dev"), config).unwrap());
        let bm = Arc::new(BlockManager::new(dev, CACHE_SIZE).unwrap());
        let sm = Arc::new(CoreSpaceMap::new(NR_BLOCKS));
        // Block 0 is reserved for the root.
        sm.inc_block(0).unwrap();
        TransactionManager::new(bm, sm)
    }

    fn commit(tm: &TransactionManager, root: WriteGuard) {
        tm.pre_commit().unwrap();
        tm.commit(root).unwrap();
    }

    #[test]
    fn test_commit_cycle() {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());
        let bm = tm.block_manager();

        // The root block is rewritten in place, never shadowed.
        for i in 0..4u8 {
            tm.begin(0).unwrap();
            let root = bm.write_lock(0).unwrap();
            root.data_mut()[0] = i;
            commit(&tm, root);
        }

        let guard = bm.read_lock(0).unwrap();
        assert_eq!(guard.data()[0], 3);
    }

    #[test]
    fn test_shadow_of_unshared_block_needs_no_child_inc() {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());

        tm.begin(0).unwrap();
        let loc = {
            let guard = tm.new_block().unwrap();
            guard.location()
        };
        tm.abort();

        tm.begin(0).unwrap();
        let (_guard, inc_children) = tm.shadow(loc).unwrap();
        assert!(!inc_children);
    }

    #[test]
    fn test_shadow_of_shared_block_requests_child_inc() {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());

        tm.begin(0).unwrap();
        let loc = {
            let guard = tm.new_block().unwrap();
            guard.location()
        };
        tm.inc(loc).unwrap();
        tm.abort();

        tm.begin(0).unwrap();
        let (_guard, inc_children) = tm.shadow(loc).unwrap();
        assert!(inc_children);
        // The original lost one referent to the shadow.
        assert_eq!(tm.ref_count(loc).unwrap(), 1);
    }

    #[test]
    fn test_shadow_recopies_private_block_that_gained_a_referent() {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());

        tm.begin(0).unwrap();
        let loc = {
            let guard = tm.new_block().unwrap();
            guard.data_mut().fill(0x5a);
            guard.location()
        };

        // A second referent appears mid-transaction (a snapshot of an
        // uncommitted root). Writing in place would leak into it.
        tm.inc(loc).unwrap();

        let (guard, inc_children) = tm.shadow(loc).unwrap();
        assert_ne!(guard.location(), loc);
        assert!(inc_children);
        assert!(guard.data().iter().all(|b| *b == 0x5a));
        assert_eq!(tm.ref_count(loc).unwrap(), 1);
    }

    #[test]
    fn test_shadowing_twice_reuses_the_shadow() {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());

        tm.begin(0).unwrap();
        let loc = {
            let guard = tm.new_block().unwrap();
            guard.location()
        };
        tm.abort();

        tm.begin(0).unwrap();
        let first = {
            let (guard, _) = tm.shadow(loc).unwrap();
            guard.location()
        };
        let second = {
            let (guard, _) = tm.shadow(loc).unwrap();
            guard.location()
        };
        assert_eq!(first, second);
    }

    #[test]
    fn test_shadow_preserves_contents() {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());

        tm.begin(0).unwrap();
        let loc = {
            let guard = tm.new_block().unwrap();
            guard.data_mut().fill(0xab);
            guard.location()
        };
        tm.abort();

        tm.begin(0).unwrap();
        let (guard, _) = tm.shadow(loc).unwrap();
        assert_ne!(guard.location(), loc);
        assert!(guard.data().iter().all(|b| *b == 0xab));
    }

    #[test]
    fn test_new_block_outside_transaction_fails() {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());

        assert!(matches!(tm.new_block(), Err(SnapError::InvalidArgument(_))));
    }

    #[test]
    fn test_double_begin_fails() {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());

        tm.begin(0).unwrap();
        assert!(matches!(tm.begin(0), Err(SnapError::InvalidArgument(_))));
    }

    #[test]
    fn test_commit_requires_pre_commit() {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());

        tm.begin(0).unwrap();
        let (root, _) = tm.shadow(0).unwrap();
        assert!(matches!(tm.commit(root), Err(SnapError::InvalidArgument(_))));
    }
}
