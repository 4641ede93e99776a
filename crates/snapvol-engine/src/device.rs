//! Raw block device backed by a file.
//!
//! Fixed-size synchronous block I/O with memory-mapped reads and
//! standard file writes. Blocks are assumed to fail atomically: a
//! write either lands whole or not at all, never torn within one
//! block. No atomicity is promised across blocks.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use parking_lot::RwLock;
use snapvol_common::{Result, SnapError};

/// Configuration for a file-backed block device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Block size in bytes. Must be a power of two.
    pub block_size: usize,
    /// Total number of blocks on the device.
    pub nr_blocks: u64,
    /// Use memory mapping for reads (default: true).
    pub use_mmap: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            nr_blocks: 1024,
            use_mmap: true,
        }
    }
}

/// A file posing as a raw block device of `nr_blocks` fixed-size blocks.
pub struct FileBlockDevice {
    path: PathBuf,
    file: RwLock<File>,
    mmap: RwLock<Option<Mmap>>,
    block_size: usize,
    nr_blocks: u64,
}

impl FileBlockDevice {
    /// Create or open the backing file. The file is grown to
    /// `nr_blocks * block_size` bytes if smaller (new bytes read back
    /// as zero) but never shrunk: an existing file larger than the
    /// configured geometry keeps its size, and the device covers all
    /// of it.
    pub fn open<P: AsRef<Path>>(path: P, config: DeviceConfig) -> Result<Self> {
        if config.block_size == 0 || !config.block_size.is_power_of_two() {
            return Err(SnapError::InvalidArgument(format!(
                "block size {} is not a power of two",
                config.block_size
            )));
        }
        if config.nr_blocks == 0 {
            return Err(SnapError::InvalidArgument("device has no blocks".into()));
        }

        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let wanted = config.nr_blocks * config.block_size as u64;
        let existing = file.metadata()?.len();
        if existing < wanted {
            file.set_len(wanted)?;
        }
        let nr_blocks = config
            .nr_blocks
            .max(existing / config.block_size as u64);

        let device = Self {
            path,
            file: RwLock::new(file),
            mmap: RwLock::new(None),
            block_size: config.block_size,
            nr_blocks,
        };

        if config.use_mmap {
            device.remap()?;
        }

        Ok(device)
    }

    /// Re-create the read mapping.
    fn remap(&self) -> Result<()> {
        let file = self.file.read();
        let mmap = unsafe { Mmap::map(&*file) }
            .map_err(|e| SnapError::Io(format!("failed to map device: {e}")))?;
        *self.mmap.write() = Some(mmap);
        Ok(())
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn nr_blocks(&self) -> u64 {
        self.nr_blocks
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_bounds(&self, loc: u64) -> Result<u64> {
        if loc >= self.nr_blocks {
            return Err(SnapError::InvalidArgument(format!(
                "block {loc} out of range (device has {} blocks)",
                self.nr_blocks
            )));
        }
        Ok(loc * self.block_size as u64)
    }

    /// Read one block into `buf`. `buf.len()` must equal the block size.
    pub fn read(&self, loc: u64, buf: &mut [u8]) -> Result<()> {
        let offset = self.check_bounds(loc)?;
        debug_assert_eq!(buf.len(), self.block_size);

        if let Some(mmap) = self.mmap.read().as_ref() {
            let start = offset as usize;
            buf.copy_from_slice(&mmap[start..start + self.block_size]);
            return Ok(());
        }

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Write one block. `data.len()` must equal the block size.
    pub fn write(&self, loc: u64, data: &[u8]) -> Result<()> {
        let offset = self.check_bounds(loc)?;
        if data.len() != self.block_size {
            return Err(SnapError::InvalidArgument(format!(
                "block data must be {} bytes, got {}",
                self.block_size,
                data.len()
            )));
        }

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Flush everything to stable storage.
    pub fn sync(&self) -> Result<()> {
        let file = self.file.read();
        file.sync_all()?;
        Ok(())
    }
}

// Tests
