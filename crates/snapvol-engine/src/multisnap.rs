//! Snapshot mapping layer.
//!
//! Presents thin devices that share underlying data blocks
//! copy-on-write. Each device owns a mapping tree (logical block ->
//! data block); a snapshot is a second directory entry whose tree
//! root gets its refcount bumped. Nothing is walked at snapshot time:
//! sharing is discovered lazily at write time and broken by shadowing
//! the lookup path and allocating a fresh data block.
//!
//! [`ThinDevice::map`] only resolves locations; copying data between
//! blocks is the caller's job.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use snapvol_common::{Result, SnapError};
use tracing::{debug, warn};

use crate::block::{BlockLocation, BlockManager};
use crate::btree::{self, BTreeInfo, Pack, ValueOps};
use crate::device::{DeviceConfig, FileBlockDevice};
use crate::space_map::{CoreSpaceMap, DiskSpaceMap, SpaceMap, StagedSpaceMap};
use crate::superblock::Superblock;
use crate::transaction::TransactionManager;

/// Location of the superblock on the metadata device.
const SUPERBLOCK_LOCATION: BlockLocation = 0;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Metadata device geometry.
    pub metadata_block_size: usize,
    pub nr_metadata_blocks: u64,
    pub cache_capacity: usize,
    pub use_mmap: bool,
    /// Data device geometry; only consulted when formatting.
    pub data_block_size: u64,
    pub data_dev_size: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            metadata_block_size: 4096,
            nr_metadata_blocks: 4096,
            cache_capacity: 64,
            use_mmap: true,
            data_block_size: 4096,
            data_dev_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapDirection {
    Read,
    Write,
}

/// Outcome of a map operation. When `need_copy` is set the caller
/// must copy data block `origin` to `dest` before letting the write
/// land; otherwise `origin == dest` and the block can be used as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub origin: u64,
    pub dest: u64,
    pub need_copy: bool,
}

/// Directory entry for one thin device.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DeviceDetails {
    mapping_root: BlockLocation,
    mapped_blocks: u64,
    /// Transaction in which the device was created.
    transaction_id: u64,
    highest_mapped: u64,
}

impl Pack for DeviceDetails {
    fn packed_size() -> usize {
        32
    }

    fn pack(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.mapping_root.to_le_bytes());
        out.extend_from_slice(&self.mapped_blocks.to_le_bytes());
        out.extend_from_slice(&self.transaction_id.to_le_bytes());
        out.extend_from_slice(&self.highest_mapped.to_le_bytes());
    }

    fn unpack(buf: &[u8]) -> Result<Self> {
        if buf.len() < 32 {
            return Err(SnapError::Corrupt {
                location: "device details".into(),
                details: "truncated entry".into(),
            });
        }
        let word = |i: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&buf[i * 8..i * 8 + 8]);
            u64::from_le_bytes(w)
        };
        Ok(Self {
            mapping_root: word(0),
            mapped_blocks: word(1),
            transaction_id: word(2),
            highest_mapped: word(3),
        })
    }
}

struct MetaInner {
    details_root: BlockLocation,
    transaction_id: u64,
    data_dev_size: u64,
    open_devices: HashSet<u64>,
}

/// The metadata store for a set of thin devices and snapshots.
pub struct MultisnapMetadata {
    tm: Arc<TransactionManager>,
    /// Disk layers, kept for root serialization and growth.
    metadata_sm: Arc<DiskSpaceMap>,
    data_sm_disk: Arc<DiskSpaceMap>,
    /// Allocation front for data blocks.
    data_sm: Arc<StagedSpaceMap>,
    details_info: BTreeInfo<DeviceDetails>,
    mapping_info: BTreeInfo<u64>,
    data_block_size: u64,
    inner: Mutex<MetaInner>,
}

/// Mapping-tree value hooks: leaf values are data block locations, so
/// duplicating or dropping a leaf moves data block refcounts.
fn mapping_info(tm: Arc<TransactionManager>, data_sm: Arc<dyn SpaceMap>) -> BTreeInfo<u64> {
    let inc_sm = Arc::clone(&data_sm);
    let dec_sm = data_sm;
    BTreeInfo::with_ops(
        tm,
        1,
        ValueOps {
            inc: Some(Arc::new(move |b: &u64| inc_sm.inc_block(*b))),
            dec: Some(Arc::new(move |b: &u64| dec_sm.dec_block(*b))),
            equal: Some(Arc::new(|a: &u64, b: &u64| a == b)),
        },
    )
}

impl MultisnapMetadata {
    /// Open a metadata store, formatting the device first if block 0
    /// has never been written.
    pub fn open<P: AsRef<Path>>(path: P, config: EngineConfig) -> Result<Self> {
        let device = FileBlockDevice::open(
            path,
            DeviceConfig {
                block_size: config.metadata_block_size,
                nr_blocks: config.nr_metadata_blocks,
                use_mmap: config.use_mmap,
            },
        )?;
        let bm = Arc::new(BlockManager::new(Arc::new(device), config.cache_capacity)?);

        let formatted = {
            let guard = bm.read_lock(SUPERBLOCK_LOCATION)?;
            !Superblock::is_unformatted(&guard.data())
        };

        if formatted {
            Self::reopen(bm, &config)
        } else {
            Self::format(bm, &config)
        }
    }

    /// Build a fresh store. The on-disk metadata space map cannot
    /// allocate its own tree nodes, so the transaction manager starts
    /// on an in-memory map; once the disk map exists, the in-memory
    /// counts are seeded into its staged overlay and it takes over.
    fn format(bm: Arc<BlockManager>, config: &EngineConfig) -> Result<Self> {
        debug!(
            nr_metadata_blocks = config.nr_metadata_blocks,
            data_dev_size = config.data_dev_size,
            "formatting metadata store"
        );

        let bootstrap = Arc::new(CoreSpaceMap::new(config.nr_metadata_blocks));
        bootstrap.inc_block(SUPERBLOCK_LOCATION)?;

        let tm = Arc::new(TransactionManager::new(
            bm,
            Arc::clone(&bootstrap) as Arc<dyn SpaceMap>,
        ));
        tm.begin(SUPERBLOCK_LOCATION)?;

        let metadata_sm = Arc::new(DiskSpaceMap::create(
            Arc::clone(&tm),
            config.nr_metadata_blocks,
        )?);
        let data_sm_disk = Arc::new(DiskSpaceMap::create(Arc::clone(&tm), config.data_dev_size)?);

        let details_info: BTreeInfo<DeviceDetails> = BTreeInfo::new(Arc::clone(&tm), 1);
        let details_root = btree::empty(&details_info)?;

        // Swap the bootstrap map out for the real one.
        let metadata_staged = Arc::new(StagedSpaceMap::new(
            Arc::clone(&metadata_sm) as Arc<dyn SpaceMap>
        ));
        for b in 0..config.nr_metadata_blocks {
            let count = bootstrap.get_count(b)?;
            if count > 0 {
                metadata_staged.set_count(b, count)?;
            }
        }
        tm.set_space_map(Arc::clone(&metadata_staged) as Arc<dyn SpaceMap>);

        let data_sm = Arc::new(StagedSpaceMap::new(
            Arc::clone(&data_sm_disk) as Arc<dyn SpaceMap>
        ));

        let meta = Self {
            mapping_info: mapping_info(
                Arc::clone(&tm),
                Arc::clone(&data_sm) as Arc<dyn SpaceMap>,
            ),
            details_info,
            tm,
            metadata_sm,
            data_sm_disk,
            data_sm,
            data_block_size: config.data_block_size,
            inner: Mutex::new(MetaInner {
                details_root,
                transaction_id: 0,
                data_dev_size: config.data_dev_size,
                open_devices: HashSet::new(),
            }),
        };

        // First commit puts a valid superblock on disk.
        meta.commit()?;
        Ok(meta)
    }

    fn reopen(bm: Arc<BlockManager>, config: &EngineConfig) -> Result<Self> {
        let sb = {
            let guard = bm.read_lock(SUPERBLOCK_LOCATION)?;
            Superblock::unpack(&guard.data()).inspect_err(|e| {
                warn!(error = %e, "superblock validation failed");
            })?
        };
        debug!(
            transaction_id = sb.transaction_id,
            data_dev_size = sb.data_dev_size,
            "reopening metadata store"
        );

        // Placeholder allocator; nothing allocates before the swap.
        let placeholder = Arc::new(CoreSpaceMap::new(config.nr_metadata_blocks));
        let tm = Arc::new(TransactionManager::new(bm, placeholder as Arc<dyn SpaceMap>));

        let metadata_sm = Arc::new(DiskSpaceMap::open(Arc::clone(&tm), &sb.metadata_sm_root)?);
        let data_sm_disk = Arc::new(DiskSpaceMap::open(Arc::clone(&tm), &sb.data_sm_root)?);

        let metadata_staged = Arc::new(StagedSpaceMap::new(
            Arc::clone(&metadata_sm) as Arc<dyn SpaceMap>
        ));
        tm.set_space_map(metadata_staged as Arc<dyn SpaceMap>);

        let data_sm = Arc::new(StagedSpaceMap::new(
            Arc::clone(&data_sm_disk) as Arc<dyn SpaceMap>
        ));

        tm.begin(SUPERBLOCK_LOCATION)?;

        Ok(Self {
            mapping_info: mapping_info(
                Arc::clone(&tm),
                Arc::clone(&data_sm) as Arc<dyn SpaceMap>,
            ),
            details_info: BTreeInfo::new(Arc::clone(&tm), 1),
            tm,
            metadata_sm,
            data_sm_disk,
            data_sm,
            data_block_size: sb.data_block_size,
            inner: Mutex::new(MetaInner {
                details_root: sb.directory_root,
                transaction_id: sb.transaction_id,
                data_dev_size: sb.data_dev_size,
                open_devices: HashSet::new(),
            }),
        })
    }

    fn get_details(&self, id: u64) -> Result<DeviceDetails> {
        let root = self.inner.lock().details_root;
        btree::lookup_equal(&self.details_info, root, &[id])
            .map_err(|e| match e {
                SnapError::NotFound(_) => SnapError::NotFound(format!("no device {id}")),
                other => other,
            })
    }

    fn put_details(&self, id: u64, details: DeviceDetails) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.details_root =
            btree::insert(&self.details_info, inner.details_root, &[id], details)?;
        Ok(())
    }

    /// Create an empty thin device.
    pub fn create_thin(&self, id: u64) -> Result<()> {
        if self.get_details(id).is_ok() {
            return Err(SnapError::InvalidArgument(format!(
                "device {id} already exists"
            )));
        }

        let mapping_root = btree::empty(&self.mapping_info)?;
        let transaction_id = self.inner.lock().transaction_id;
        self.put_details(
            id,
            DeviceDetails {
                mapping_root,
                mapped_blocks: 0,
                transaction_id,
                highest_mapped: 0,
            },
        )?;
        debug!(id, "created thin device");
        Ok(())
    }

    /// Snapshot an existing device. The two devices share one mapping
    /// tree from here on; the tree is never walked, its root just
    /// gains a referent.
    pub fn create_snap(&self, id: u64, origin: u64) -> Result<()> {
        if self.get_details(id).is_ok() {
            return Err(SnapError::InvalidArgument(format!(
                "device {id} already exists"
            )));
        }
        let origin_details = self.get_details(origin)?;

        self.tm.inc(origin_details.mapping_root)?;
        let transaction_id = self.inner.lock().transaction_id;
        self.put_details(
            id,
            DeviceDetails {
                transaction_id,
                ..origin_details
            },
        )?;
        debug!(id, origin, "created snapshot");
        Ok(())
    }

    /// Remove a device and release its mapping tree.
    pub fn delete_device(&self, id: u64) -> Result<()> {
        if self.inner.lock().open_devices.contains(&id) {
            return Err(SnapError::Busy(format!("device {id} is open")));
        }

        let details = self.get_details(id)?;
        btree::del(&self.mapping_info, details.mapping_root)?;

        let mut inner = self.inner.lock();
        inner.details_root = btree::remove(&self.details_info, inner.details_root, &[id])?;
        debug!(id, "deleted device");
        Ok(())
    }

    /// Take the (single) handle to a device.
    pub fn open_device(&self, id: u64) -> Result<ThinDevice<'_>> {
        self.get_details(id)?;

        let mut inner = self.inner.lock();
        if !inner.open_devices.insert(id) {
            return Err(SnapError::Busy(format!("device {id} is already open")));
        }
        Ok(ThinDevice { meta: self, id })
    }

    pub fn data_block_size(&self) -> u64 {
        self.data_block_size
    }

    pub fn data_dev_size(&self) -> u64 {
        self.inner.lock().data_dev_size
    }

    /// Data blocks currently backing some mapping.
    pub fn provisioned_blocks(&self) -> u64 {
        self.data_sm.nr_blocks() - self.data_sm.nr_free()
    }

    /// Grow the data device. Shrinking would orphan mappings and is
    /// refused.
    pub fn resize_data_dev(&self, new_size: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if new_size < inner.data_dev_size {
            return Err(SnapError::InvalidArgument(format!(
                "cannot shrink data device from {} to {new_size} blocks",
                inner.data_dev_size
            )));
        }

        let extra = new_size - inner.data_dev_size;
        self.data_sm_disk.extend(extra);
        self.data_sm.extend(extra);
        inner.data_dev_size = new_size;
        Ok(())
    }

    /// Make everything since the last commit durable: flush the trees
    /// and space maps, then write the superblock last. A new
    /// transaction opens immediately.
    pub fn commit(&self) -> Result<()> {
        let sb_guard = self.tm.block_manager().write_lock(SUPERBLOCK_LOCATION)?;

        // Data counts drain first; doing so dirties metadata, which
        // the transaction manager's own pre-commit then drains.
        self.data_sm.commit()?;
        self.tm.pre_commit()?;

        {
            let mut inner = self.inner.lock();
            inner.transaction_id += 1;
            let sb = Superblock {
                flags: 0,
                transaction_id: inner.transaction_id,
                data_block_size: self.data_block_size,
                data_dev_size: inner.data_dev_size,
                directory_root: inner.details_root,
                metadata_sm_root: self.metadata_sm.copy_root().to_vec(),
                data_sm_root: self.data_sm_disk.copy_root().to_vec(),
            };
            let mut data = sb_guard.data_mut();
            sb.pack_into(&mut data)?;
        }

        self.tm.commit(sb_guard)?;
        self.tm.begin(SUPERBLOCK_LOCATION)?;

        debug!("committed metadata");
        Ok(())
    }

    /// Commit and tear down.
    pub fn close(self) -> Result<()> {
        self.commit()
    }
}

/// The exclusive handle to one thin device.
pub struct ThinDevice<'a> {
    meta: &'a MultisnapMetadata,
    id: u64,
}

impl ThinDevice<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mapped_blocks(&self) -> Result<u64> {
        Ok(self.meta.get_details(self.id)?.mapped_blocks)
    }

    pub fn highest_mapped(&self) -> Result<u64> {
        Ok(self.meta.get_details(self.id)?.highest_mapped)
    }

    /// Resolve one logical block.
    ///
    /// Reads never change anything. Writes provision unmapped blocks,
    /// and break sharing when the mapped data block is reachable from
    /// any other device: either its own count is above one, or a node
    /// on the lookup path is. Snapshots only bump the root, so sharing
    /// of data blocks surfaces lazily while shadowing the path.
    pub fn map(&self, logical: u64, direction: MapDirection) -> Result<Mapping> {
        let meta = self.meta;
        let mut details = meta.get_details(self.id)?;

        let found =
            match btree::lookup_with_sharing(&meta.mapping_info, details.mapping_root, &[logical])
            {
                Ok(hit) => Some(hit),
                Err(SnapError::NotFound(_)) => None,
                Err(e) => return Err(e),
            };

        match (found, direction) {
            (None, MapDirection::Read) => Err(SnapError::NotFound(format!(
                "block {logical} not provisioned on device {}",
                self.id
            ))),

            (None, MapDirection::Write) => {
                let dest = meta.data_sm.new_block()?;
                details.mapping_root =
                    btree::insert(&meta.mapping_info, details.mapping_root, &[logical], dest)?;
                details.mapped_blocks += 1;
                details.highest_mapped = details.highest_mapped.max(logical);
                meta.put_details(self.id, details)?;

                Ok(Mapping {
                    origin: dest,
                    dest,
                    need_copy: false,
                })
            }

            (Some((dest, _)), MapDirection::Read) => Ok(Mapping {
                origin: dest,
                dest,
                need_copy: false,
            }),

            (Some((old, path_shared)), MapDirection::Write) => {
                let shared = path_shared || meta.data_sm.get_count(old)? > 1;
                if !shared {
                    return Ok(Mapping {
                        origin: old,
                        dest: old,
                        need_copy: false,
                    });
                }

                // Break sharing: fresh data block, shadowed mapping
                // path. Shadowing a shared leaf bumps every data block
                // it references; overwriting then drops the old one,
                // leaving it owned solely by the other tree version.
                let dest = meta.data_sm.new_block()?;
                details.mapping_root =
                    btree::insert(&meta.mapping_info, details.mapping_root, &[logical], dest)?;
                meta.put_details(self.id, details)?;

                Ok(Mapping {
                    origin: old,
                    dest,
                    need_copy: true,
                })
            }
        }
    }
}

impl Drop for ThinDevice<'_> {
    fn drop(&mut self) {
        self.meta.inner.lock().open_devices.remove(&self.id);
    }
}

// Tests
