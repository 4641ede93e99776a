//! On-disk B+-tree node format.
//!
//! One node per metadata block. Layout: a checksummed header, then
//! `nr_entries` composite keys (`levels` little-endian u64 words
//! each), then the payload: packed values for a leaf, child block
//! locations for an internal node. Internal nodes carry one child per
//! key; each key is the lowest key reachable through its child, which
//! keeps splits and merges symmetric between the two node kinds.

use snapvol_common::{Result, SnapError};

use crate::block::BlockLocation;

use super::Pack;

pub(crate) const NODE_HEADER_SIZE: usize = 24;

const NODE_MAGIC: u32 = 0x53_56_42_54;
const KIND_INTERNAL: u8 = 1;
const KIND_LEAF: u8 = 2;

/// In-memory representation of a tree node.
#[derive(Debug, Clone)]
pub(crate) struct Node<V> {
    pub is_leaf: bool,
    /// Composite keys, `levels` words each, sorted lexicographically.
    pub keys: Vec<Vec<u64>>,
    /// Leaf payload; empty for internal nodes.
    pub values: Vec<V>,
    /// Internal payload; empty for leaves. Same length as `keys`.
    pub children: Vec<BlockLocation>,
}

impl<V: Pack> Node<V> {
    pub fn new_leaf() -> Self {
        Self {
            is_leaf: true,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn new_internal() -> Self {
        Self {
            is_leaf: false,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn nr_entries(&self) -> usize {
        self.keys.len()
    }

    /// Entries that fit in one block of `block_size` bytes.
    pub fn max_entries(levels: usize, is_leaf: bool, block_size: usize) -> usize {
        let payload = if is_leaf { V::packed_size() } else { 8 };
        (block_size - NODE_HEADER_SIZE) / (levels * 8 + payload)
    }

    pub fn is_full(&self, levels: usize, block_size: usize) -> bool {
        self.nr_entries() >= Self::max_entries(levels, self.is_leaf, block_size)
    }

    /// Serialize into a full block image, checksum included.
    pub fn pack(&self, levels: usize, block_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; block_size];

        buf[4..8].copy_from_slice(&NODE_MAGIC.to_le_bytes());
        buf[8] = if self.is_leaf { KIND_LEAF } else { KIND_INTERNAL };
        buf[10..12].copy_from_slice(&(levels as u16).to_le_bytes());
        buf[12..16].copy_from_slice(&(V::packed_size() as u32).to_le_bytes());
        buf[16..20].copy_from_slice(&(self.nr_entries() as u32).to_le_bytes());

        let mut off = NODE_HEADER_SIZE;
        for key in &self.keys {
            for word in key {
                buf[off..off + 8].copy_from_slice(&word.to_le_bytes());
                off += 8;
            }
        }

        if self.is_leaf {
            let mut tmp = Vec::with_capacity(V::packed_size());
            for value in &self.values {
                tmp.clear();
                value.pack(&mut tmp);
                buf[off..off + tmp.len()].copy_from_slice(&tmp);
                off += tmp.len();
            }
        } else {
            for child in &self.children {
                buf[off..off + 8].copy_from_slice(&child.to_le_bytes());
                off += 8;
            }
        }

        let csum = crc32fast::hash(&buf[4..]);
        buf[0..4].copy_from_slice(&csum.to_le_bytes());
        buf
    }

    pub fn unpack(buf: &[u8], levels: usize) -> Result<Self> {
        if buf.len() < NODE_HEADER_SIZE {
            return Err(SnapError::Corrupt {
                location: "tree node".into(),
                details: "block too small for a node header".into(),
            });
        }

        let stored = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let actual = crc32fast::hash(&buf[4..]);
        if stored != actual {
            return Err(SnapError::ChecksumMismatch {
                expected: stored,
                actual,
            });
        }

        let magic = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if magic != NODE_MAGIC {
            return Err(SnapError::Corrupt {
                location: "tree node".into(),
                details: format!("bad magic {magic:#x}"),
            });
        }

        let is_leaf = match buf[8] {
            KIND_LEAF => true,
            KIND_INTERNAL => false,
            k => {
                return Err(SnapError::Corrupt {
                    location: "tree node".into(),
                    details: format!("bad kind {k}"),
                });
            }
        };

        let stored_levels = u16::from_le_bytes([buf[10], buf[11]]) as usize;
        if stored_levels != levels {
            return Err(SnapError::Corrupt {
                location: "tree node".into(),
                details: format!("key arity {stored_levels}, expected {levels}"),
            });
        }

        let value_size = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]) as usize;
        if value_size != V::packed_size() {
            return Err(SnapError::Corrupt {
                location: "tree node".into(),
                details: format!(
                    "value size {value_size}, expected {}",
                    V::packed_size()
                ),
            });
        }

        let nr = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]) as usize;
        let payload = if is_leaf { value_size } else { 8 };
        if NODE_HEADER_SIZE + nr * (levels * 8 + payload) > buf.len() {
            return Err(SnapError::Corrupt {
                location: "tree node".into(),
                details: format!("entry count {nr} exceeds block"),
            });
        }

        let mut off = NODE_HEADER_SIZE;
        let mut keys = Vec::with_capacity(nr);
        for _ in 0..nr {
            let mut key = Vec::with_capacity(levels);
            for _ in 0..levels {
                let mut word = [0u8; 8];
                word.copy_from_slice(&buf[off..off + 8]);
                key.push(u64::from_le_bytes(word));
                off += 8;
            }
            keys.push(key);
        }

        let mut values = Vec::new();
        let mut children = Vec::new();
        if is_leaf {
            values.reserve(nr);
            for _ in 0..nr {
                values.push(V::unpack(&buf[off..off + value_size])?);
                off += value_size;
            }
        } else {
            children.reserve(nr);
            for _ in 0..nr {
                let mut word = [0u8; 8];
                word.copy_from_slice(&buf[off..off + 8]);
                children.push(u64::from_le_bytes(word));
                off += 8;
            }
        }

        Ok(Self {
            is_leaf,
            keys,
            values,
            children,
        })
    }
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK_SIZE: usize = 4096;

    #[test]
    fn test_leaf_round_trip() {
        let mut node: Node<u64> = Node::new_leaf();
        for i in 0..10u64 {
            node.keys.push(vec![i * 3]);
            node.values.push(i * 1000);
        }

        let buf = node.pack(1, BLOCK_SIZE);
        let back: Node<u64> = Node::unpack(&buf, 1).unwrap();
        assert!(back.is_leaf);
        assert_eq!(back.keys, node.keys);
        assert_eq!(back.values, node.values);
    }

    #[test]
    fn test_internal_round_trip() {
        let mut node: Node<u64> = Node::new_internal();
        for i in 0..5u64 {
            node.keys.push(vec![i, i + 1]);
            node.children.push(100 + i);
        }

        let buf = node.pack(2, BLOCK_SIZE);
        let back: Node<u64> = Node::unpack(&buf, 2).unwrap();
        assert!(!back.is_leaf);
        assert_eq!(back.keys, node.keys);
        assert_eq!(back.children, node.children);
    }

    #[test]
    fn test_corruption_detected() {
        let node: Node<u64> = Node::new_leaf();
        let mut buf = node.pack(1, BLOCK_SIZE);
        buf[100] ^= 1;

        assert!(matches!(
            Node::<u64>::unpack(&buf, 1),
            Err(SnapError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_wrong_arity_rejected() {
        let node: Node<u64> = Node::new_leaf();
        let buf = node.pack(1, BLOCK_SIZE);

        assert!(matches!(
            Node::<u64>::unpack(&buf, 2),
            Err(SnapError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_max_entries() {
        // 4096 - 24 = 4072; a single-level u64 leaf entry is 16 bytes.
        assert_eq!(Node::<u64>::max_entries(1, true, BLOCK_SIZE), 254);
        assert_eq!(Node::<u32>::max_entries(1, true, BLOCK_SIZE), 339);
    }
}
