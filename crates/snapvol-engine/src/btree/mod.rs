//! Copy-on-write B+-tree.
//!
//! The on-disk index used for every persistent structure in the
//! engine: block mappings, the device directory, and the disk space
//! map's counts. Keys are fixed-arity tuples of u64s, values are any
//! [`Pack`] type. All mutation goes through the transaction manager's
//! shadowing, so a tree root returned by [`insert`] or [`remove`]
//! describes a new version; the version behind the previous root is
//! untouched and both may be kept alive via reference counts.
//!
//! Writers descend top-down, splitting full nodes (or refilling
//! near-empty ones) on the way so no ancestor ever needs revisiting.
//! At most three node locks are held at once.

mod node;

use std::sync::Arc;

use snapvol_common::{Result, SnapError};
use tracing::trace;

use crate::block::{BlockLocation, WriteGuard};
use crate::transaction::TransactionManager;

use node::Node;

/// A fixed-size value that can live in a tree leaf.
pub trait Pack: Clone + Send + Sync + 'static {
    fn packed_size() -> usize;
    fn pack(&self, out: &mut Vec<u8>);
    fn unpack(buf: &[u8]) -> Result<Self>;
}

impl Pack for u64 {
    fn packed_size() -> usize {
        8
    }

    fn pack(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn unpack(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(SnapError::Corrupt {
                location: "tree value".into(),
                details: "truncated u64".into(),
            });
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&buf[..8]);
        Ok(u64::from_le_bytes(word))
    }
}

impl Pack for u32 {
    fn packed_size() -> usize {
        4
    }

    fn pack(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn unpack(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(SnapError::Corrupt {
                location: "tree value".into(),
                details: "truncated u32".into(),
            });
        }
        Ok(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
    }
}

pub type ValueHook<V> = Arc<dyn Fn(&V) -> Result<()> + Send + Sync>;
pub type ValueEq<V> = Arc<dyn Fn(&V, &V) -> bool + Send + Sync>;

/// Reference-count hooks for values that point at other blocks.
///
/// When a shared leaf is shadowed, every value in it gains a holder;
/// when a value is overwritten or removed, it loses one. Trees whose
/// values are plain data leave these unset.
pub struct ValueOps<V> {
    pub inc: Option<ValueHook<V>>,
    pub dec: Option<ValueHook<V>>,
    pub equal: Option<ValueEq<V>>,
}

impl<V> Default for ValueOps<V> {
    fn default() -> Self {
        Self {
            inc: None,
            dec: None,
            equal: None,
        }
    }
}

impl<V> Clone for ValueOps<V> {
    fn clone(&self) -> Self {
        Self {
            inc: self.inc.clone(),
            dec: self.dec.clone(),
            equal: self.equal.clone(),
        }
    }
}

/// Everything needed to operate on one tree: the transaction manager,
/// the key arity, and the value hooks.
pub struct BTreeInfo<V: Pack> {
    pub tm: Arc<TransactionManager>,
    pub levels: usize,
    pub ops: ValueOps<V>,
}

impl<V: Pack> BTreeInfo<V> {
    pub fn new(tm: Arc<TransactionManager>, levels: usize) -> Self {
        Self {
            tm,
            levels,
            ops: ValueOps::default(),
        }
    }

    pub fn with_ops(tm: Arc<TransactionManager>, levels: usize, ops: ValueOps<V>) -> Self {
        Self { tm, levels, ops }
    }

    fn block_size(&self) -> usize {
        self.tm.block_manager().block_size()
    }

    fn check_key(&self, key: &[u64]) -> Result<()> {
        if key.len() != self.levels {
            return Err(SnapError::InvalidArgument(format!(
                "key arity {} does not match tree arity {}",
                key.len(),
                self.levels
            )));
        }
        Ok(())
    }
}

fn read_node<V: Pack>(info: &BTreeInfo<V>, loc: BlockLocation) -> Result<Node<V>> {
    let guard = info.tm.read_lock(loc)?;
    Node::unpack(&guard.data(), info.levels)
}

fn write_node<V: Pack>(info: &BTreeInfo<V>, guard: &WriteGuard, node: &Node<V>) {
    let bytes = node.pack(info.levels, info.block_size());
    guard.data_mut().copy_from_slice(&bytes);
}

/// Shadow a node, performing the child increments the transaction
/// manager asks for: the old node survives under another referent, so
/// everything it points at has one holder more.
fn shadow_node<V: Pack>(
    info: &BTreeInfo<V>,
    loc: BlockLocation,
) -> Result<(WriteGuard, Node<V>)> {
    let (guard, inc_children) = info.tm.shadow(loc)?;
    let node = Node::unpack(&guard.data(), info.levels)?;

    if inc_children {
        if node.is_leaf {
            if let Some(inc) = &info.ops.inc {
                for value in &node.values {
                    inc(value)?;
                }
            }
        } else {
            for child in &node.children {
                info.tm.inc(*child)?;
            }
        }
    }

    Ok((guard, node))
}

fn dec_value<V: Pack>(info: &BTreeInfo<V>, value: &V) -> Result<()> {
    if let Some(dec) = &info.ops.dec {
        dec(value)?;
    }
    Ok(())
}

/// Create an empty tree, returning its root.
pub fn empty<V: Pack>(info: &BTreeInfo<V>) -> Result<BlockLocation> {
    let guard = info.tm.new_block()?;
    write_node(info, &guard, &Node::<V>::new_leaf());
    Ok(guard.location())
}

/// Exact-match lookup. A plain descent that touches nothing but the
/// nodes themselves; in particular it never consults the space map,
/// so the space map's own count tree can be read through it without
/// recursing.
pub fn lookup_equal<V: Pack>(
    info: &BTreeInfo<V>,
    root: BlockLocation,
    key: &[u64],
) -> Result<V> {
    info.check_key(key)?;

    let mut loc = root;
    loop {
        let node: Node<V> = read_node(info, loc)?;
        if node.is_leaf {
            let idx = node.keys.partition_point(|k| k.as_slice() < key);
            if idx < node.nr_entries() && node.keys[idx] == key {
                return Ok(node.values[idx].clone());
            }
            return Err(SnapError::NotFound(format!("key {key:?} not in tree")));
        }

        let idx = node.keys.partition_point(|k| k.as_slice() <= key);
        if idx == 0 {
            return Err(SnapError::NotFound(format!("key {key:?} not in tree")));
        }
        loc = node.children[idx - 1];
    }
}

/// Exact-match lookup that also reports whether any node on the path
/// has more than one referent. A shared path means the leaf entry is
/// reachable from another tree version, so the caller must not mutate
/// what the value points at in place.
///
/// Each step asks the space map for a refcount, so this walk is for
/// mapping trees only; never use it on the tree a space map stores
/// its own counts in.
pub fn lookup_with_sharing<V: Pack>(
    info: &BTreeInfo<V>,
    root: BlockLocation,
    key: &[u64],
) -> Result<(V, bool)> {
    info.check_key(key)?;

    let mut loc = root;
    let mut shared = false;
    loop {
        if info.tm.ref_count(loc)? > 1 {
            shared = true;
        }

        let node: Node<V> = read_node(info, loc)?;
        if node.is_leaf {
            let idx = node.keys.partition_point(|k| k.as_slice() < key);
            if idx < node.nr_entries() && node.keys[idx] == key {
                return Ok((node.values[idx].clone(), shared));
            }
            return Err(SnapError::NotFound(format!("key {key:?} not in tree")));
        }

        let idx = node.keys.partition_point(|k| k.as_slice() <= key);
        if idx == 0 {
            return Err(SnapError::NotFound(format!("key {key:?} not in tree")));
        }
        loc = node.children[idx - 1];
    }
}

/// Insert or overwrite one entry, returning the new root.
pub fn insert<V: Pack>(
    info: &BTreeInfo<V>,
    root: BlockLocation,
    key: &[u64],
    value: V,
) -> Result<BlockLocation> {
    info.check_key(key)?;
    let bs = info.block_size();

    let (mut guard, mut node) = shadow_node(info, root)?;
    let mut new_root = guard.location();

    if node.is_full(info.levels, bs) {
        // Grow a level: a fresh root holding only the old one, then
        // split beneath it.
        let top_guard = info.tm.new_block()?;
        let mut top: Node<V> = Node::new_internal();
        // The new root's bound must already cover the incoming key;
        // the descent below starts beneath it and will not revisit.
        if key < node.keys[0].as_slice() {
            top.keys.push(key.to_vec());
        } else {
            top.keys.push(node.keys[0].clone());
        }
        top.children.push(guard.location());
        new_root = top_guard.location();
        trace!(root = new_root, "tree grew a level");

        let (g, n) = split_child(info, &top_guard, &mut top, 0, guard, node, key)?;
        guard = g;
        node = n;
    }

    loop {
        if node.is_leaf {
            let idx = node.keys.partition_point(|k| k.as_slice() < key);
            if idx < node.nr_entries() && node.keys[idx] == key {
                let same = info
                    .ops
                    .equal
                    .as_ref()
                    .is_some_and(|eq| eq(&node.values[idx], &value));
                if !same {
                    dec_value(info, &node.values[idx])?;
                    node.values[idx] = value;
                }
            } else {
                node.keys.insert(idx, key.to_vec());
                node.values.insert(idx, value);
            }
            write_node(info, &guard, &node);
            return Ok(new_root);
        }

        let mut pp = node.keys.partition_point(|k| k.as_slice() <= key);
        if pp == 0 {
            // New smallest key in the tree; lower the bound and route
            // through the leftmost child.
            node.keys[0] = key.to_vec();
            pp = 1;
        }
        let idx = pp - 1;

        let (cguard, cnode) = shadow_node(info, node.children[idx])?;
        node.children[idx] = cguard.location();

        if cnode.is_full(info.levels, bs) {
            let (g, n) = split_child(info, &guard, &mut node, idx, cguard, cnode, key)?;
            drop(guard);
            guard = g;
            node = n;
        } else {
            write_node(info, &guard, &node);
            drop(guard);
            guard = cguard;
            node = cnode;
        }
    }
}

/// Split a full child in half, registering the new sibling with the
/// parent, and return whichever half covers `key`. Writes all three
/// nodes.
fn split_child<V: Pack>(
    info: &BTreeInfo<V>,
    parent_guard: &WriteGuard,
    parent: &mut Node<V>,
    idx: usize,
    child_guard: WriteGuard,
    mut child: Node<V>,
    key: &[u64],
) -> Result<(WriteGuard, Node<V>)> {
    let sib_guard = info.tm.new_block()?;
    let mid = child.nr_entries() / 2;

    let mut sibling = if child.is_leaf {
        Node::new_leaf()
    } else {
        Node::new_internal()
    };
    sibling.keys = child.keys.split_off(mid);
    if child.is_leaf {
        sibling.values = child.values.split_off(mid);
    } else {
        sibling.children = child.children.split_off(mid);
    }

    parent.keys.insert(idx + 1, sibling.keys[0].clone());
    parent.children.insert(idx + 1, sib_guard.location());

    write_node(info, parent_guard, parent);
    write_node(info, &child_guard, &child);
    write_node(info, &sib_guard, &sibling);

    if key >= sibling.keys[0].as_slice() {
        Ok((sib_guard, sibling))
    } else {
        Ok((child_guard, child))
    }
}

/// Remove one entry, returning the new root.
///
/// The key is located read-only first, so a missing key fails cleanly
/// with nothing shadowed.
pub fn remove<V: Pack>(
    info: &BTreeInfo<V>,
    root: BlockLocation,
    key: &[u64],
) -> Result<BlockLocation> {
    lookup_equal(info, root, key)?;
    let bs = info.block_size();

    let (mut guard, mut node) = shadow_node(info, root)?;
    let mut new_root = guard.location();

    loop {
        if node.is_leaf {
            let idx = node.keys.partition_point(|k| k.as_slice() < key);
            if idx >= node.nr_entries() || node.keys[idx] != key {
                return Err(SnapError::Corrupt {
                    location: format!("block {}", guard.location()),
                    details: format!("key {key:?} vanished during removal"),
                });
            }
            node.keys.remove(idx);
            let value = node.values.remove(idx);
            dec_value(info, &value)?;
            write_node(info, &guard, &node);
            return Ok(new_root);
        }

        let pp = node.keys.partition_point(|k| k.as_slice() <= key);
        if pp == 0 {
            return Err(SnapError::Corrupt {
                location: format!("block {}", guard.location()),
                details: format!("key {key:?} vanished during removal"),
            });
        }
        let idx = pp - 1;

        let (mut cguard, mut cnode) = shadow_node(info, node.children[idx])?;
        node.children[idx] = cguard.location();

        let min = Node::<V>::max_entries(info.levels, cnode.is_leaf, bs) / 3;
        if cnode.nr_entries() <= min {
            let (g, n) = rebalance(info, &guard, &mut node, idx, cguard, cnode)?;
            cguard = g;
            cnode = n;
        } else {
            write_node(info, &guard, &node);
        }

        // A root left with a single child is a wasted level.
        if guard.location() == new_root && node.nr_entries() == 1 {
            trace!(root = new_root, "tree shrank a level");
            new_root = cguard.location();
            info.tm.dec(guard.location())?;
        }

        drop(guard);
        guard = cguard;
        node = cnode;
    }
}

/// Refill a near-empty child from a sibling, either by merging the
/// two or by shifting one entry over. Returns the node now covering
/// the child's key range.
fn rebalance<V: Pack>(
    info: &BTreeInfo<V>,
    parent_guard: &WriteGuard,
    parent: &mut Node<V>,
    idx: usize,
    child_guard: WriteGuard,
    child: Node<V>,
) -> Result<(WriteGuard, Node<V>)> {
    let bs = info.block_size();

    // Pair up with the left sibling when there is one.
    let (li, sib_idx, child_is_left) = if idx > 0 {
        (idx - 1, idx - 1, false)
    } else {
        (idx, idx + 1, true)
    };

    let (sguard, snode) = shadow_node(info, parent.children[sib_idx])?;
    parent.children[sib_idx] = sguard.location();

    let (lguard, mut lnode, rguard, mut rnode) = if child_is_left {
        (child_guard, child, sguard, snode)
    } else {
        (sguard, snode, child_guard, child)
    };

    let max = Node::<V>::max_entries(info.levels, lnode.is_leaf, bs);
    if lnode.nr_entries() + rnode.nr_entries() <= max {
        // Merge right into left.
        lnode.keys.append(&mut rnode.keys);
        if lnode.is_leaf {
            lnode.values.append(&mut rnode.values);
        } else {
            lnode.children.append(&mut rnode.children);
        }
        parent.keys.remove(li + 1);
        parent.children.remove(li + 1);

        info.tm.dec(rguard.location())?;
        drop(rguard);

        write_node(info, parent_guard, parent);
        write_node(info, &lguard, &lnode);
        return Ok((lguard, lnode));
    }

    // Shift one entry toward the needy side.
    if child_is_left {
        lnode.keys.push(rnode.keys.remove(0));
        if lnode.is_leaf {
            lnode.values.push(rnode.values.remove(0));
        } else {
            lnode.children.push(rnode.children.remove(0));
        }
        parent.keys[li + 1] = rnode.keys[0].clone();
    } else {
        let last = lnode.nr_entries() - 1;
        rnode.keys.insert(0, lnode.keys.remove(last));
        if rnode.is_leaf {
            rnode.values.insert(0, lnode.values.remove(last));
        } else {
            rnode.children.insert(0, lnode.children.remove(last));
        }
        parent.keys[li + 1] = rnode.keys[0].clone();
    }

    write_node(info, parent_guard, parent);
    write_node(info, &lguard, &lnode);
    write_node(info, &rguard, &rnode);

    if child_is_left {
        drop(rguard);
        Ok((lguard, lnode))
    } else {
        drop(lguard);
        Ok((rguard, rnode))
    }
}

/// Release a whole tree version: walk it and drop one reference from
/// every node, recursing only into nodes this was the last referent
/// of. Leaf values lose a holder via the dec hook.
pub fn del<V: Pack>(info: &BTreeInfo<V>, root: BlockLocation) -> Result<()> {
    if info.tm.ref_count(root)? > 1 {
        return info.tm.dec(root);
    }

    let node: Node<V> = read_node(info, root)?;
    if node.is_leaf {
        if let Some(dec) = &info.ops.dec {
            for value in &node.values {
                dec(value)?;
            }
        }
    } else {
        for child in &node.children {
            del(info, *child)?;
        }
    }

    info.tm.dec(root)
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockManager;
    use crate::device::{DeviceConfig, FileBlockDevice};
    use crate::space_map::{CoreSpaceMap, SpaceMap};
    use parking_lot::Mutex;
    use tempfile::tempdir;

    const NR_BLOCKS: u64 = 1024;
    const CACHE_SIZE: usize = 16;

    fn mk_tm(dir: &std::path::Path) -> Arc<TransactionManager> {
        let config = DeviceConfig {
            nr_blocks: NR_BLOCKS,
            ..Default::default()
        };
        let dev = Arc::new(FileBlockDevice::open(dir.join("dev"), config).unwrap());
        let bm = Arc::new(BlockManager::new(dev, CACHE_SIZE).unwrap());
        let sm = Arc::new(CoreSpaceMap::new(NR_BLOCKS));
        sm.inc_block(0).unwrap(); // reserved root block
        let tm = Arc::new(TransactionManager::new(bm, sm));
        tm.begin(0).unwrap();
        tm
    }

    fn commit_cycle(tm: &TransactionManager) {
        tm.pre_commit().unwrap();
        let root = tm.block_manager().write_lock(0).unwrap();
        tm.commit(root).unwrap();
        tm.begin(0).unwrap();
    }

    #[test]
    fn test_empty_tree_lookup_fails() {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());
        let info: BTreeInfo<u64> = BTreeInfo::new(tm, 1);

        let root = empty(&info).unwrap();
        assert!(matches!(
            lookup_equal(&info, root, &[42]),
            Err(SnapError::NotFound(_))
        ));
    }

    #[test]
    fn test_insert_and_lookup() {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());
        let info: BTreeInfo<u64> = BTreeInfo::new(tm, 1);

        let mut root = empty(&info).unwrap();
        for i in 0..100u64 {
            root = insert(&info, root, &[i], i * 10).unwrap();
        }
        for i in 0..100u64 {
            assert_eq!(lookup_equal(&info, root, &[i]).unwrap(), i * 10);
        }
        assert!(lookup_equal(&info, root, &[100]).is_err());
    }

    #[test]
    fn test_overwrite() {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());
        let info: BTreeInfo<u64> = BTreeInfo::new(tm, 1);

        let mut root = empty(&info).unwrap();
        root = insert(&info, root, &[7], 1).unwrap();
        root = insert(&info, root, &[7], 2).unwrap();
        assert_eq!(lookup_equal(&info, root, &[7]).unwrap(), 2);
    }

    #[test]
    fn test_insert_lots_with_commits() {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());
        let info: BTreeInfo<u64> = BTreeInfo::new(Arc::clone(&tm), 1);

        let mut root = empty(&info).unwrap();
        let mut oracle = std::collections::HashMap::new();

        // Pseudo-random keys, duplicates included.
        let mut v: u64 = 57;
        for i in 0..5000u64 {
            let key = v % 100_000;
            root = insert(&info, root, &[key], v).unwrap();
            oracle.insert(key, v);
            v = v.wrapping_mul(274_177).wrapping_add(1);

            if (i + 1) % 100 == 0 {
                commit_cycle(&tm);
            }
        }
        commit_cycle(&tm);

        for (key, val) in &oracle {
            assert_eq!(lookup_equal(&info, root, &[*key]).unwrap(), *val);
        }
    }

    #[test]
    fn test_insert_lots_single_commit() {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());
        let info: BTreeInfo<u64> = BTreeInfo::new(Arc::clone(&tm), 1);

        let mut root = empty(&info).unwrap();
        let mut oracle = std::collections::HashMap::new();

        let mut v: u64 = 57;
        for _ in 0..5000u64 {
            let key = v % 100_000;
            root = insert(&info, root, &[key], v).unwrap();
            oracle.insert(key, v);
            v = v.wrapping_mul(274_177).wrapping_add(1);
        }
        commit_cycle(&tm);

        for (key, val) in &oracle {
            assert_eq!(lookup_equal(&info, root, &[*key]).unwrap(), *val);
        }
    }

    #[test]
    fn test_descending_inserts() {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());
        let info: BTreeInfo<u64> = BTreeInfo::new(tm, 1);

        let mut root = empty(&info).unwrap();
        for i in (0..1000u64).rev() {
            root = insert(&info, root, &[i], i).unwrap();
        }
        for i in 0..1000u64 {
            assert_eq!(lookup_equal(&info, root, &[i]).unwrap(), i);
        }
    }

    #[test]
    fn test_composite_keys() {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());
        let info: BTreeInfo<u64> = BTreeInfo::new(tm, 2);

        let mut root = empty(&info).unwrap();
        for dev in 0..10u64 {
            for blk in 0..20u64 {
                root = insert(&info, root, &[dev, blk], dev * 1000 + blk).unwrap();
            }
        }

        assert_eq!(lookup_equal(&info, root, &[3, 7]).unwrap(), 3007);
        assert_eq!(lookup_equal(&info, root, &[9, 19]).unwrap(), 9019);
        assert!(lookup_equal(&info, root, &[10, 0]).is_err());

        // Arity is enforced.
        assert!(matches!(
            lookup_equal(&info, root, &[3]),
            Err(SnapError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_hierarchical_keys() {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());
        let info: BTreeInfo<u64> = BTreeInfo::new(Arc::clone(&tm), 4);

        let mut root = empty(&info).unwrap();
        for a in 0..3u64 {
            for b in 0..3u64 {
                for c in 0..3u64 {
                    for d in 0..5u64 {
                        let v = a * 1000 + b * 100 + c * 10 + d;
                        root = insert(&info, root, &[a, b, c, d], v).unwrap();
                    }
                }
            }
        }
        commit_cycle(&tm);

        // Overwrite one subtree's values in a later transaction.
        for d in 0..5u64 {
            root = insert(&info, root, &[1, 2, 0, d], 7000 + d).unwrap();
        }
        commit_cycle(&tm);

        for d in 0..5u64 {
            assert_eq!(lookup_equal(&info, root, &[1, 2, 0, d]).unwrap(), 7000 + d);
        }
        // Neighbouring subtrees are untouched.
        assert_eq!(lookup_equal(&info, root, &[1, 1, 2, 4]).unwrap(), 1124);
        assert_eq!(lookup_equal(&info, root, &[2, 0, 0, 0]).unwrap(), 2000);
        assert!(lookup_equal(&info, root, &[1, 2, 3, 0]).is_err());
    }

    fn remove_in_order(order: impl Iterator<Item = u64> + Clone) {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());
        let info: BTreeInfo<u64> = BTreeInfo::new(Arc::clone(&tm), 1);

        let mut root = empty(&info).unwrap();
        for i in 0..500u64 {
            root = insert(&info, root, &[i], i).unwrap();
        }
        commit_cycle(&tm);

        let mut remaining: std::collections::HashSet<u64> = (0..500).collect();
        for (n, key) in order.enumerate() {
            root = remove(&info, root, &[key]).unwrap();
            remaining.remove(&key);

            assert!(lookup_equal(&info, root, &[key]).is_err());
            if n % 97 == 0 {
                for other in remaining.iter().take(5) {
                    assert_eq!(lookup_equal(&info, root, &[*other]).unwrap(), *other);
                }
                commit_cycle(&tm);
            }
        }
        assert!(remaining.is_empty());
    }

    #[test]
    fn test_remove_ascending() {
        remove_in_order(0..500);
    }

    #[test]
    fn test_remove_descending() {
        remove_in_order((0..500).rev());
    }

    #[test]
    fn test_remove_shuffled() {
        // A fixed permutation of 0..500 via a coprime stride.
        remove_in_order((0..500u64).map(|i| (i * 269) % 500));
    }

    #[test]
    fn test_remove_from_center_out() {
        remove_in_order((0..500u64).map(|i| {
            if i % 2 == 0 {
                250 + i / 2
            } else {
                249 - i / 2
            }
        }));
    }

    #[test]
    fn test_remove_missing_key_fails_cleanly() {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());
        let info: BTreeInfo<u64> = BTreeInfo::new(tm, 1);

        let mut root = empty(&info).unwrap();
        root = insert(&info, root, &[1], 1).unwrap();

        let sm = info.tm.space_map();
        let free_before = sm.nr_free();
        assert!(matches!(
            remove(&info, root, &[2]),
            Err(SnapError::NotFound(_))
        ));
        // Nothing was shadowed on the failed path.
        assert_eq!(sm.nr_free(), free_before);
        assert_eq!(lookup_equal(&info, root, &[1]).unwrap(), 1);
    }

    #[test]
    fn test_remove_to_empty_and_reuse() {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());
        let info: BTreeInfo<u64> = BTreeInfo::new(Arc::clone(&tm), 1);

        let mut root = empty(&info).unwrap();
        for i in 0..300u64 {
            root = insert(&info, root, &[i], i).unwrap();
        }
        commit_cycle(&tm);
        for i in 0..300u64 {
            root = remove(&info, root, &[i]).unwrap();
        }
        commit_cycle(&tm);

        // Removing again is a clean miss.
        assert!(matches!(
            remove(&info, root, &[0]),
            Err(SnapError::NotFound(_))
        ));

        // Tree shrank back to a single leaf; it still works.
        root = insert(&info, root, &[9], 9).unwrap();
        assert_eq!(lookup_equal(&info, root, &[9]).unwrap(), 9);
    }

    #[test]
    fn test_shared_root_detected() {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());
        let info: BTreeInfo<u64> = BTreeInfo::new(Arc::clone(&tm), 1);

        let mut root = empty(&info).unwrap();
        for i in 0..10u64 {
            root = insert(&info, root, &[i], i).unwrap();
        }
        commit_cycle(&tm);

        let (_, shared) = lookup_with_sharing(&info, root, &[3]).unwrap();
        assert!(!shared);

        // Another referent appears (a snapshot of the tree).
        tm.inc(root).unwrap();
        let (_, shared) = lookup_with_sharing(&info, root, &[3]).unwrap();
        assert!(shared);
    }

    #[test]
    fn test_cow_keeps_old_version_intact() {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());
        let info: BTreeInfo<u64> = BTreeInfo::new(Arc::clone(&tm), 1);

        let mut root = empty(&info).unwrap();
        for i in 0..200u64 {
            root = insert(&info, root, &[i], i).unwrap();
        }
        commit_cycle(&tm);

        // Snapshot the tree, then mutate the live version.
        tm.inc(root).unwrap();
        let snap = root;
        for i in 0..200u64 {
            root = insert(&info, root, &[i], i + 1000).unwrap();
        }

        for i in 0..200u64 {
            assert_eq!(lookup_equal(&info, snap, &[i]).unwrap(), i);
            assert_eq!(lookup_equal(&info, root, &[i]).unwrap(), i + 1000);
        }
    }

    #[test]
    fn test_value_hooks_fire() {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());

        let live = Arc::new(Mutex::new(0i64));
        let ops = ValueOps {
            inc: Some({
                let live = Arc::clone(&live);
                Arc::new(move |_: &u64| {
                    *live.lock() += 1;
                    Ok(())
                })
            }),
            dec: Some({
                let live = Arc::clone(&live);
                Arc::new(move |_: &u64| {
                    *live.lock() -= 1;
                    Ok(())
                })
            }),
            equal: Some(Arc::new(|a: &u64, b: &u64| a == b)),
        };
        let info = BTreeInfo::with_ops(Arc::clone(&tm), 1, ops);

        let mut root = empty(&info).unwrap();
        root = insert(&info, root, &[1], 10).unwrap();
        root = insert(&info, root, &[2], 20).unwrap();
        assert_eq!(*live.lock(), 0);

        // Overwrite with a different value releases the old one.
        root = insert(&info, root, &[1], 11).unwrap();
        assert_eq!(*live.lock(), -1);

        // Overwrite with an equal value is a no-op.
        root = insert(&info, root, &[1], 11).unwrap();
        assert_eq!(*live.lock(), -1);

        // Removal releases.
        root = remove(&info, root, &[2]).unwrap();
        assert_eq!(*live.lock(), -2);

        let _ = root;
    }

    #[test]
    fn test_del_releases_whole_tree() {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());
        let info: BTreeInfo<u64> = BTreeInfo::new(Arc::clone(&tm), 1);

        let sm = tm.space_map();
        let free_before = sm.nr_free();

        let mut root = empty(&info).unwrap();
        for i in 0..2000u64 {
            root = insert(&info, root, &[i], i).unwrap();
        }
        commit_cycle(&tm);
        assert!(sm.nr_free() < free_before);

        del(&info, root).unwrap();
        assert_eq!(sm.nr_free(), free_before);
    }

    #[test]
    fn test_del_of_shared_tree_only_drops_a_reference() {
        let dir = tempdir().unwrap();
        let tm = mk_tm(dir.path());
        let info: BTreeInfo<u64> = BTreeInfo::new(Arc::clone(&tm), 1);

        let mut root = empty(&info).unwrap();
        for i in 0..50u64 {
            root = insert(&info, root, &[i], i).unwrap();
        }
        commit_cycle(&tm);

        tm.inc(root).unwrap();
        del(&info, root).unwrap();

        // The surviving referent still reads everything.
        for i in 0..50u64 {
            assert_eq!(lookup_equal(&info, root, &[i]).unwrap(), i);
        }
    }
}
