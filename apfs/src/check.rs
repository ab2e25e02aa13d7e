//! Recursive top-down structural check: key ordering, leaf uniqueness,
//! interior child-oid agreement, and the maximum-depth bound.

use byteorder::{LittleEndian, ReadBytesExt};
use std::cmp::Ordering;
use std::io::{Cursor, Read, Seek};

use crate::error::{ApfsError, Result};
use crate::keys::{self, Key, TreeKind};
use crate::node::{self, Node};
use crate::omap;

const MAX_DEPTH: u32 = 12;

/// Running totals accumulated across one or more `check_subtree` calls, for
/// the final report a caller (the `Checker`) prints on success.
#[derive(Debug, Default, Clone, Copy)]
pub struct CheckStats {
    pub nodes_visited: u64,
    pub max_depth: u32,
}

/// Walk `node` and its descendants in pre-order, verifying invariants 2-7 of
/// the node data model. `last_key` is the greatest key seen so far on the
/// path from the root (the parent's separator when descending into a
/// child); pass [`Key::Floor`] for the initial call at the tree root.
/// `omap_root` is `None` while walking the object map itself (child ids
/// there are physical block numbers); `Some(root_block)` while walking a
/// volume's catalog (child ids are oids resolved through that omap).
pub fn check_subtree<R: Read + Seek>(
    reader: &mut R,
    node: &Node,
    block_size: u32,
    omap_root: Option<u64>,
    depth: u32,
    mut last_key: Key,
    stats: &mut CheckStats,
) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(ApfsError::DepthOverflow);
    }
    stats.nodes_visited += 1;
    stats.max_depth = stats.max_depth.max(depth);

    let kind = if omap_root.is_none() { TreeKind::Omap } else { TreeKind::Catalog };

    for i in 0..node.record_count as i64 {
        let (ko, kl) = node::locate_key(node, i)?;
        let curr = keys::decode_key(kind, &node.raw()[ko..ko + kl])?;

        if keys::compare_keys(last_key, curr) == Ordering::Greater {
            return Err(ApfsError::OutOfOrder { block_nr: node.block_nr });
        }
        if i > 0 && node.is_leaf() && keys::compare_keys(last_key, curr) == Ordering::Equal {
            return Err(ApfsError::DuplicateLeafKey { block_nr: node.block_nr });
        }
        last_key = curr;

        if node.is_leaf() {
            continue;
        }

        let (vo, vl) = node::locate_value(node, i)?;
        if vl != 8 {
            return Err(ApfsError::WrongValueSize { block_nr: node.block_nr, index: i });
        }
        let mut cursor = Cursor::new(&node.raw()[vo..vo + 8]);
        let child_id = cursor.read_u64::<LittleEndian>()?;

        let child_bno = match omap_root {
            None => child_id,
            Some(root) => omap::omap_lookup(reader, root, block_size, child_id)?,
        };

        let child = node::load_node(reader, child_bno, block_size)?;
        if child.object_id != child_id {
            return Err(ApfsError::WrongChildOid { expected: child_id, actual: child.object_id });
        }

        check_subtree(reader, &child, block_size, omap_root, depth + 1, last_key, stats)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fletcher;
    use crate::node::{BTN_FIXED_KV_SIZE, BTN_LEAF};
    use crate::object::ObjectHeader;

    fn build_omap_leaf(block_size: usize, oid: u64, records: &[(u64, u64, u64)]) -> Vec<u8> {
        let mut block = vec![0u8; block_size];
        block[8..16].copy_from_slice(&oid.to_le_bytes());
        let flags: u16 = BTN_LEAF | BTN_FIXED_KV_SIZE;
        block[32..34].copy_from_slice(&flags.to_le_bytes());
        block[36..40].copy_from_slice(&(records.len() as u32).to_le_bytes());

        let table_space_len = (records.len() * 4) as u16;
        block[42..44].copy_from_slice(&table_space_len.to_le_bytes());

        let header_size = ObjectHeader::SIZE + 24;
        let table_start = header_size;
        let key_area_start = table_start + table_space_len as usize;

        for (i, (k_oid, k_xid, paddr)) in records.iter().enumerate() {
            let key_off = i * 16;
            let val_off_from_end = (i + 1) * 16;

            let toc_off = table_start + i * 4;
            block[toc_off..toc_off + 2].copy_from_slice(&(key_off as u16).to_le_bytes());
            block[toc_off + 2..toc_off + 4].copy_from_slice(&(val_off_from_end as u16).to_le_bytes());

            let kstart = key_area_start + key_off;
            block[kstart..kstart + 8].copy_from_slice(&k_oid.to_le_bytes());
            block[kstart + 8..kstart + 16].copy_from_slice(&k_xid.to_le_bytes());

            let vstart = block_size - val_off_from_end;
            block[vstart..vstart + 4].copy_from_slice(&0u32.to_le_bytes());
            block[vstart + 4..vstart + 8].copy_from_slice(&0u32.to_le_bytes());
            block[vstart + 8..vstart + 16].copy_from_slice(&paddr.to_le_bytes());
        }

        let checksum = fletcher::fletcher64(&block[8..]);
        block[0..8].copy_from_slice(&checksum.to_le_bytes());
        block
    }

    #[test]
    fn accepts_ordered_leaf() {
        let block = build_omap_leaf(4096, 1, &[(1, 1, 10), (2, 1, 20), (3, 1, 30)]);
        let mut cursor = Cursor::new(block);
        let node = node::load_node(&mut cursor, 0, 4096).unwrap();
        let mut stats = CheckStats::default();
        check_subtree(&mut cursor, &node, 4096, None, 0, Key::Floor, &mut stats).unwrap();
        assert_eq!(stats.nodes_visited, 1);
        assert_eq!(stats.max_depth, 0);
    }

    #[test]
    fn rejects_out_of_order_keys() {
        let block = build_omap_leaf(4096, 1, &[(5, 1, 10), (2, 1, 20)]);
        let mut cursor = Cursor::new(block);
        let node = node::load_node(&mut cursor, 0, 4096).unwrap();
        let mut stats = CheckStats::default();
        let result = check_subtree(&mut cursor, &node, 4096, None, 0, Key::Floor, &mut stats);
        assert!(matches!(result, Err(ApfsError::OutOfOrder { .. })));
    }

    #[test]
    fn rejects_duplicate_leaf_keys() {
        let block = build_omap_leaf(4096, 1, &[(2, 1, 10), (2, 1, 20)]);
        let mut cursor = Cursor::new(block);
        let node = node::load_node(&mut cursor, 0, 4096).unwrap();
        let mut stats = CheckStats::default();
        let result = check_subtree(&mut cursor, &node, 4096, None, 0, Key::Floor, &mut stats);
        assert!(matches!(result, Err(ApfsError::DuplicateLeafKey { .. })));
    }

    #[test]
    fn rejects_depth_beyond_twelve() {
        let block = build_omap_leaf(4096, 1, &[(1, 1, 10)]);
        let mut cursor = Cursor::new(block);
        let node = node::load_node(&mut cursor, 0, 4096).unwrap();
        let mut stats = CheckStats::default();
        let result = check_subtree(&mut cursor, &node, 4096, None, 13, Key::Floor, &mut stats);
        assert!(matches!(result, Err(ApfsError::DepthOverflow)));
    }

    #[test]
    fn accepts_depth_exactly_twelve() {
        let block = build_omap_leaf(4096, 1, &[(1, 1, 10)]);
        let mut cursor = Cursor::new(block);
        let node = node::load_node(&mut cursor, 0, 4096).unwrap();
        let mut stats = CheckStats::default();
        let result = check_subtree(&mut cursor, &node, 4096, None, 12, Key::Floor, &mut stats);
        assert!(result.is_ok());
        assert_eq!(stats.max_depth, 12);
    }
}
