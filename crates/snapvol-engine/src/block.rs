//! Block manager: per-block locking over a bounded block cache.
//!
//! Hands out read (shared) and write (exclusive) locks on fixed-size
//! blocks, caching them in a clock-sweep pool. Locks are RAII guards.
//! Re-locking a block that is already held in either mode fails with
//! `AlreadyLocked`; recursive locking is not supported.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use snapvol_common::{Result, SnapError};
use tracing::debug;

use crate::device::FileBlockDevice;

/// 64-bit block index on the metadata device.
pub type BlockLocation = u64;

// Frames

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Unlocked,
    Read,
    Write,
}

/// A cached block. The buffer is the authoritative in-cache copy;
/// mutations are visible to every later lock holder but reach the
/// device only on flush.
struct Frame {
    loc: BlockLocation,
    data: RwLock<Vec<u8>>,
    mode: Mutex<LockMode>,
    dirty: AtomicBool,
    referenced: AtomicBool,
}

impl Frame {
    fn new(loc: BlockLocation, data: Vec<u8>) -> Self {
        Self {
            loc,
            data: RwLock::new(data),
            mode: Mutex::new(LockMode::Unlocked),
            dirty: AtomicBool::new(false),
            referenced: AtomicBool::new(true),
        }
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

// Clock-sweep replacer

/// Approximate LRU over the frames currently in the cache. A frame is
/// a valid victim only while unlocked.
struct ClockReplacer {
    frames: Vec<BlockLocation>,
    hand: usize,
    capacity: usize,
}

impl ClockReplacer {
    fn new(capacity: usize) -> Self {
        Self {
            frames: Vec::with_capacity(capacity),
            hand: 0,
            capacity,
        }
    }

    fn add(&mut self, loc: BlockLocation) {
        if self.frames.len() < self.capacity {
            self.frames.push(loc);
        }
    }

    fn remove(&mut self, loc: BlockLocation) {
        if let Some(pos) = self.frames.iter().position(|&l| l == loc) {
            self.frames.remove(pos);
            if pos < self.hand && self.hand > 0 {
                self.hand -= 1;
            }
        }
    }

    /// Find a victim, clearing reference bits as the hand sweeps.
    fn find_victim<F>(&mut self, is_victim: F) -> Option<BlockLocation>
    where
        F: Fn(BlockLocation) -> (bool, bool), // (evictable, referenced)
    {
        if self.frames.is_empty() {
            return None;
        }

        let len = self.frames.len();
        let start = self.hand % len;
        let mut pos = start;
        let mut rounds = 0;

        // Two full rotations: the first clears reference bits.
        while rounds < 2 {
            let loc = self.frames[pos];
            let (evictable, referenced) = is_victim(loc);

            if evictable && !referenced {
                self.hand = (pos + 1) % len;
                return Some(loc);
            }

            pos = (pos + 1) % len;
            if pos == start {
                rounds += 1;
            }
        }

        None
    }
}

// Lock guards

/// Shared lock on a block, released on drop.
pub struct ReadGuard {
    frame: Arc<Frame>,
    locks_held: Arc<AtomicUsize>,
}

impl ReadGuard {
    pub fn location(&self) -> BlockLocation {
        self.frame.loc
    }

    pub fn data(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.frame.data.read()
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        *self.frame.mode.lock() = LockMode::Unlocked;
        self.locks_held.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Exclusive lock on a block, released on drop. Mutating the data
/// marks the frame dirty.
pub struct WriteGuard {
    frame: Arc<Frame>,
    locks_held: Arc<AtomicUsize>,
}

impl WriteGuard {
    pub fn location(&self) -> BlockLocation {
        self.frame.loc
    }

    pub fn data(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.frame.data.read()
    }

    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.frame.dirty.store(true, Ordering::Release);
        self.frame.data.write()
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        *self.frame.mode.lock() = LockMode::Unlocked;
        self.locks_held.fetch_sub(1, Ordering::AcqRel);
    }
}

// Block manager

/// Cached, lock-mediated access to a block device.
pub struct BlockManager {
    device: Arc<FileBlockDevice>,
    frames: DashMap<BlockLocation, Arc<Frame>>,
    replacer: Mutex<ClockReplacer>,
    capacity: usize,
    locks_held: Arc<AtomicUsize>,
    evictions: AtomicU64,
}

impl BlockManager {
    pub fn new(device: Arc<FileBlockDevice>, cache_capacity: usize) -> Result<Self> {
        if cache_capacity == 0 {
            return Err(SnapError::InvalidArgument(
                "cache capacity must be > 0".into(),
            ));
        }

        Ok(Self {
            device,
            frames: DashMap::with_capacity(cache_capacity),
            replacer: Mutex::new(ClockReplacer::new(cache_capacity)),
            capacity: cache_capacity,
            locks_held: Arc::new(AtomicUsize::new(0)),
            evictions: AtomicU64::new(0),
        })
    }

    pub fn block_size(&self) -> usize {
        self.device.block_size()
    }

    pub fn nr_blocks(&self) -> u64 {
        self.device.nr_blocks()
    }

    /// Number of locks currently held across all blocks.
    pub fn held_lock_count(&self) -> usize {
        self.locks_held.load(Ordering::Acquire)
    }

    /// Write a frame's buffer back to the device.
    fn write_back(&self, frame: &Frame) -> Result<()> {
        let data = frame.data.read();
        self.device.write(frame.loc, &data)?;
        drop(data);
        frame.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Make room for one more frame. Only unlocked frames are
    /// candidates; a dirty victim is written back first.
    fn maybe_evict(&self) -> Result<()> {
        while self.frames.len() >= self.capacity {
            let victim = {
                let mut replacer = self.replacer.lock();
                replacer.find_victim(|loc| {
                    if let Some(frame) = self.frames.get(&loc) {
                        let evictable = *frame.mode.lock() == LockMode::Unlocked;
                        let referenced = frame.referenced.swap(false, Ordering::AcqRel);
                        (evictable, referenced)
                    } else {
                        (false, false)
                    }
                })
            };

            let Some(victim) = victim else {
                return Err(SnapError::Busy(
                    "block cache exhausted by held locks".into(),
                ));
            };

            if let Some(frame) = self.frames.get(&victim)
                && frame.is_dirty()
            {
                self.write_back(&frame)?;
            }

            self.frames.remove(&victim);
            self.replacer.lock().remove(victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(block = victim, "evicted block");
        }

        Ok(())
    }

    /// Fetch a frame, reading from the device on first touch.
    fn get_frame(&self, loc: BlockLocation, zero: bool) -> Result<Arc<Frame>> {
        if loc >= self.device.nr_blocks() {
            return Err(SnapError::InvalidArgument(format!(
                "block {loc} out of range"
            )));
        }

        if let Some(frame) = self.frames.get(&loc) {
            frame.referenced.store(true, Ordering::Release);
            return Ok(frame.clone());
        }

        self.maybe_evict()?;

        let mut data = vec![0u8; self.device.block_size()];
        if !zero {
            self.device.read(loc, &mut data)?;
        }

        let frame = Arc::new(Frame::new(loc, data));
        self.frames.insert(loc, frame.clone());
        self.replacer.lock().add(loc);
        Ok(frame)
    }

    fn lock_frame(&self, frame: Arc<Frame>, mode: LockMode) -> Result<Arc<Frame>> {
        let mut held = frame.mode.lock();
        if *held != LockMode::Unlocked {
            return Err(SnapError::AlreadyLocked(frame.loc));
        }
        *held = mode;
        drop(held);
        self.locks_held.fetch_add(1, Ordering::AcqRel);
        Ok(frame)
    }

    /// Take a shared lock on a block.
    pub fn read_lock(&self, loc: BlockLocation) -> Result<ReadGuard> {
        let frame = self.lock_frame(self.get_frame(loc, false)?, LockMode::Read)?;
        Ok(ReadGuard {
            frame,
            locks_held: self.locks_held.clone(),
        })
    }

    /// Take an exclusive lock on a block.
    pub fn write_lock(&self, loc: BlockLocation) -> Result<WriteGuard> {
        let frame = self.lock_frame(self.get_frame(loc, false)?, LockMode::Write)?;
        Ok(WriteGuard {
            frame,
            locks_held: self.locks_held.clone(),
        })
    }

    /// Take an exclusive lock without reading the device; the buffer
    /// comes back zero-filled. For freshly allocated blocks whose old
    /// contents are garbage anyway.
    pub fn write_lock_zero(&self, loc: BlockLocation) -> Result<WriteGuard> {
        let frame = self.lock_frame(self.get_frame(loc, true)?, LockMode::Write)?;
        {
            let mut data = frame.data.write();
            data.fill(0);
        }
        frame.dirty.store(true, Ordering::Release);
        Ok(WriteGuard {
            frame,
            locks_held: self.locks_held.clone(),
        })
    }

    /// Write back every dirty frame that is not currently
    /// write-locked (a write-locked frame belongs to its holder and is
    /// flushed explicitly, see [`Self::flush_block`]). Optionally
    /// syncs the device afterwards.
    pub fn flush(&self, sync: bool) -> Result<()> {
        for entry in self.frames.iter() {
            let frame = entry.value();
            if !frame.is_dirty() {
                continue;
            }
            if *frame.mode.lock() == LockMode::Write {
                continue;
            }
            self.write_back(frame)?;
        }

        if sync {
            self.device.sync()?;
        }
        Ok(())
    }

    /// Force one frame to the device regardless of its lock state,
    /// then sync. Used by the commit path for the transaction root.
    pub fn flush_block(&self, loc: BlockLocation) -> Result<()> {
        if let Some(frame) = self.frames.get(&loc) {
            self.write_back(&frame)?;
        }
        self.device.sync()
    }
}

// Tests
