//! Superblock: block 0 of the metadata device.
//!
//! The single root everything else hangs off. Rewriting it (last, and
//! alone) is what commits a transaction, so it carries the directory
//! tree root and both space map roots. The checksum covers the whole
//! block after the checksum field; an all-zero block 0 means the
//! device has never been formatted.

use snapvol_common::{Result, SnapError};

use crate::block::BlockLocation;

const SUPERBLOCK_MAGIC: u32 = 0x53_56_53_42;
const SUPERBLOCK_VERSION: u32 = 1;

/// Space map roots are stored inline with room to grow.
const MAX_SM_ROOT: usize = 128;

const OFF_MAGIC: usize = 4;
const OFF_VERSION: usize = 8;
const OFF_FLAGS: usize = 12;
const OFF_TXN_ID: usize = 16;
const OFF_DATA_BLOCK_SIZE: usize = 24;
const OFF_DATA_DEV_SIZE: usize = 32;
const OFF_DIRECTORY_ROOT: usize = 40;
const OFF_METADATA_SM_ROOT: usize = 48;
const OFF_DATA_SM_ROOT: usize = OFF_METADATA_SM_ROOT + 4 + MAX_SM_ROOT;

#[derive(Debug, Clone, Default)]
pub struct Superblock {
    pub flags: u32,
    pub transaction_id: u64,
    /// Size of one data block, in bytes.
    pub data_block_size: u64,
    /// Size of the data device, in data blocks.
    pub data_dev_size: u64,
    pub directory_root: BlockLocation,
    pub metadata_sm_root: Vec<u8>,
    pub data_sm_root: Vec<u8>,
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(word)
}

impl Superblock {
    /// True when block 0 has never been written: the device wants
    /// formatting rather than opening.
    pub fn is_unformatted(buf: &[u8]) -> bool {
        buf.iter().all(|b| *b == 0)
    }

    /// Serialize into a full block image, checksum last.
    pub fn pack_into(&self, buf: &mut [u8]) -> Result<()> {
        if self.metadata_sm_root.len() > MAX_SM_ROOT
            || self.data_sm_root.len() > MAX_SM_ROOT
        {
            return Err(SnapError::InvalidArgument(
                "space map root too large for superblock".into(),
            ));
        }

        buf.fill(0);
        buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&SUPERBLOCK_MAGIC.to_le_bytes());
        buf[OFF_VERSION..OFF_VERSION + 4]
            .copy_from_slice(&SUPERBLOCK_VERSION.to_le_bytes());
        buf[OFF_FLAGS..OFF_FLAGS + 4].copy_from_slice(&self.flags.to_le_bytes());
        buf[OFF_TXN_ID..OFF_TXN_ID + 8]
            .copy_from_slice(&self.transaction_id.to_le_bytes());
        buf[OFF_DATA_BLOCK_SIZE..OFF_DATA_BLOCK_SIZE + 8]
            .copy_from_slice(&self.data_block_size.to_le_bytes());
        buf[OFF_DATA_DEV_SIZE..OFF_DATA_DEV_SIZE + 8]
            .copy_from_slice(&self.data_dev_size.to_le_bytes());
        buf[OFF_DIRECTORY_ROOT..OFF_DIRECTORY_ROOT + 8]
            .copy_from_slice(&self.directory_root.to_le_bytes());

        let mut off = OFF_METADATA_SM_ROOT;
        buf[off..off + 4]
            .copy_from_slice(&(self.metadata_sm_root.len() as u32).to_le_bytes());
        buf[off + 4..off + 4 + self.metadata_sm_root.len()]
            .copy_from_slice(&self.metadata_sm_root);

        off = OFF_DATA_SM_ROOT;
        buf[off..off + 4].copy_from_slice(&(self.data_sm_root.len() as u32).to_le_bytes());
        buf[off + 4..off + 4 + self.data_sm_root.len()].copy_from_slice(&self.data_sm_root);

        let csum = crc32fast::hash(&buf[4..]);
        buf[0..4].copy_from_slice(&csum.to_le_bytes());
        Ok(())
    }

    pub fn unpack(buf: &[u8]) -> Result<Self> {
        if buf.len() < OFF_DATA_SM_ROOT + 4 + MAX_SM_ROOT {
            return Err(SnapError::Corrupt {
                location: "superblock".into(),
                details: "block too small".into(),
            });
        }

        let stored = read_u32(buf, 0);
        let actual = crc32fast::hash(&buf[4..]);
        if stored != actual {
            return Err(SnapError::ChecksumMismatch {
                expected: stored,
                actual,
            });
        }

        let magic = read_u32(buf, OFF_MAGIC);
        if magic != SUPERBLOCK_MAGIC {
            return Err(SnapError::Corrupt {
                location: "superblock".into(),
                details: format!("bad magic {magic:#x}"),
            });
        }

        let version = read_u32(buf, OFF_VERSION);
        if version != SUPERBLOCK_VERSION {
            return Err(SnapError::Corrupt {
                location: "superblock".into(),
                details: format!("unsupported version {version}"),
            });
        }

        let meta_len = read_u32(buf, OFF_METADATA_SM_ROOT) as usize;
        let data_len = read_u32(buf, OFF_DATA_SM_ROOT) as usize;
        if meta_len > MAX_SM_ROOT || data_len > MAX_SM_ROOT {
            return Err(SnapError::Corrupt {
                location: "superblock".into(),
                details: "space map root length out of range".into(),
            });
        }

        Ok(Self {
            flags: read_u32(buf, OFF_FLAGS),
            transaction_id: read_u64(buf, OFF_TXN_ID),
            data_block_size: read_u64(buf, OFF_DATA_BLOCK_SIZE),
            data_dev_size: read_u64(buf, OFF_DATA_DEV_SIZE),
            directory_root: read_u64(buf, OFF_DIRECTORY_ROOT),
            metadata_sm_root: buf[OFF_METADATA_SM_ROOT + 4..OFF_METADATA_SM_ROOT + 4 + meta_len]
                .to_vec(),
            data_sm_root: buf[OFF_DATA_SM_ROOT + 4..OFF_DATA_SM_ROOT + 4 + data_len].to_vec(),
        })
    }
}

// Tests
