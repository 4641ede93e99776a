//! Transactional, copy-on-write metadata engine for a snapshotting
//! volume manager.
//!
//! The stack, leaves first: a raw [`device::FileBlockDevice`], the
//! [`block::BlockManager`] (per-block locking plus a bounded cache),
//! reference-counting [`space_map`] allocators, the
//! [`transaction::TransactionManager`] (copy-on-write shadowing with
//! atomic, root-last commit), a COW [`btree`] used as the on-disk
//! index, and the [`multisnap`] layer that composes these into
//! independently snapshottable virtual devices.

pub mod block;
pub mod btree;
pub mod device;
pub mod multisnap;
pub mod space_map;
pub mod superblock;
pub mod transaction;

// Re-exports
pub use block::{BlockLocation, BlockManager, ReadGuard, WriteGuard};
pub use device::{DeviceConfig, FileBlockDevice};
pub use multisnap::{EngineConfig, Mapping, MapDirection, MultisnapMetadata, ThinDevice};
pub use space_map::{CoreSpaceMap, DiskSpaceMap, SpaceMap, StagedSpaceMap};
pub use transaction::TransactionManager;
