//! Object map lookup: resolving a virtual object id to the physical block
//! that currently holds it.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek};

use crate::error::{ApfsError, Result};
use crate::keys::{self, Key};
use crate::node;
use crate::object::{self, ObjectHeader};
use crate::query::{self, TREE_OMAP};

/// Read the omap-phys object at `omap_block`, verify its checksum and that
/// its declared object type is `OMAP`, and return the physical block
/// number of the omap B-tree's root node.
pub fn read_omap_tree_root<R: Read + Seek>(
    reader: &mut R,
    omap_block: u64,
    block_size: u32,
) -> Result<u64> {
    let block = object::read_block_view(reader, omap_block, block_size)?;
    if !crate::fletcher::verify_object(&block.bytes) {
        return Err(ApfsError::ChecksumMismatch { block_nr: omap_block });
    }

    let header = ObjectHeader::parse(&block.bytes)?;
    if header.object_type() != object::OBJECT_TYPE_OMAP {
        return Err(ApfsError::WrongObjectType {
            block_nr: omap_block,
            expected: object::OBJECT_TYPE_OMAP,
            found: header.object_type(),
        });
    }

    // omap_phys_t layout after obj_phys_t (32 bytes):
    //   om_flags, om_snap_count, om_tree_type, om_snapshot_tree_type: u32 each
    //   om_tree_oid: u64 — the B-tree root's physical block number
    let mut cursor = Cursor::new(&block.bytes[ObjectHeader::SIZE..]);
    let _om_flags = cursor.read_u32::<LittleEndian>()?;
    let _om_snap_count = cursor.read_u32::<LittleEndian>()?;
    let _om_tree_type = cursor.read_u32::<LittleEndian>()?;
    let _om_snapshot_tree_type = cursor.read_u32::<LittleEndian>()?;
    let om_tree_oid = cursor.read_u64::<LittleEndian>()?;

    Ok(om_tree_oid)
}

/// Resolve `target_oid` to its current physical block through the omap
/// rooted at `omap_tree_root`. Builds a sentinel key `(target_oid,
/// u64::MAX)` so the engine's "greatest key ≤ target" bisection convention
/// lands directly on the highest-xid mapping for that oid.
///
/// Deliberately does not set `EXACT`: that flag demands the leaf key
/// equal the query key outright, which the sentinel never does (a real
/// xid is never `u64::MAX`). Oid equality is checked explicitly below
/// instead, which is the only part of an exact match that matters here.
pub fn omap_lookup<R: Read + Seek>(
    reader: &mut R,
    omap_tree_root: u64,
    block_size: u32,
    target_oid: u64,
) -> Result<u64> {
    let root = node::load_node(reader, omap_tree_root, block_size)?;
    let key = Key::Omap(keys::make_omap_key(target_oid));
    let q = query::new_query(root, key, TREE_OMAP, None);

    let found = query::execute_query(reader, q, block_size, None)?
        .ok_or(ApfsError::OmapLookupFailed { oid: target_oid })?;

    if found.len != 16 {
        return Err(ApfsError::WrongValueSize { block_nr: found.node.block_nr, index: found.index });
    }
    let value = keys::decode_omap_value(&found.node.raw()[found.off..found.off + found.len])?;

    // The sentinel can only match a record whose oid is truly target_oid,
    // since it sorts after every real xid for that oid and before any
    // larger oid — but a tree with no entry for target_oid could still
    // bisect onto the nearest smaller oid. Guard explicitly.
    let (ko, kl) = node::locate_key(&found.node, found.index)?;
    let matched = keys::decode_omap_key(&found.node.raw()[ko..ko + kl])?;
    if matched.oid != target_oid {
        return Err(ApfsError::OmapLookupFailed { oid: target_oid });
    }

    Ok(value.paddr)
}
