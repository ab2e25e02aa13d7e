//! Node Loader and Record Locator.
//!
//! `load_node` turns a raw block into a validated [`Node`]; `locate_key` and
//! `locate_value` are the only sanctioned way any other component reaches
//! into a node's key or value bytes.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek};

use crate::error::{ApfsError, Result};
use crate::object::{self, ObjectHeader};

// B-tree node flags (btn_flags)
pub const BTN_ROOT: u16 = 0x0001;
pub const BTN_LEAF: u16 = 0x0002;
pub const BTN_FIXED_KV_SIZE: u16 = 0x0004;

/// Size of the trailing `tree_info` footer carried by root nodes.
pub const TREE_INFO_SIZE: usize = 40;

/// B-tree node header, 24 bytes immediately after the 32-byte object header.
struct NodeHeader {
    flags: u16,
    #[allow(dead_code)]
    level: u16,
    record_count: u32,
    table_space_off: u16,
    table_space_len: u16,
    free_space_off: u16,
    free_space_len: u16,
}

impl NodeHeader {
    const SIZE: usize = 24;

    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ApfsError::Malformed("btree node header too short".into()));
        }
        let mut cursor = Cursor::new(data);
        let flags = cursor.read_u16::<LittleEndian>()?;
        let level = cursor.read_u16::<LittleEndian>()?;
        let record_count = cursor.read_u32::<LittleEndian>()?;
        let table_space_off = cursor.read_u16::<LittleEndian>()?;
        let table_space_len = cursor.read_u16::<LittleEndian>()?;
        let free_space_off = cursor.read_u16::<LittleEndian>()?;
        let free_space_len = cursor.read_u16::<LittleEndian>()?;
        // two key/value free-list heads, read and discarded: not needed for
        // read-only traversal/consistency checking.
        let mut _rest = [0u8; 8];
        std::io::Read::read_exact(&mut cursor, &mut _rest)?;

        Ok(NodeHeader {
            flags,
            level,
            record_count,
            table_space_off,
            table_space_len,
            free_space_off,
            free_space_len,
        })
    }
}

/// A record-locator table entry, normalized across the fixed/variable layouts.
#[derive(Clone, Copy)]
struct TocEntry {
    key_off: u16,
    key_len: u16, // unused (0) in fixed layout
    val_off: u16,
    val_len: u16, // unused (0) in fixed layout
}

/// A validated, in-memory B-tree node.
pub struct Node {
    pub flags: u16,
    pub record_count: u32,
    pub table_end: usize,
    pub free_start: usize,
    pub data_start: usize,
    pub object_id: u64,
    pub block_nr: u64,
    raw: Vec<u8>,
    toc: Vec<TocEntry>,
}

impl Node {
    pub fn is_root(&self) -> bool {
        self.flags & BTN_ROOT != 0
    }

    pub fn is_leaf(&self) -> bool {
        self.flags & BTN_LEAF != 0
    }

    pub fn is_fixed_kv(&self) -> bool {
        self.flags & BTN_FIXED_KV_SIZE != 0
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    fn entry_size(&self) -> usize {
        if self.is_fixed_kv() { 4 } else { 8 }
    }
}

/// Parse a block into a validated [`Node`]. Verifies the object checksum,
/// the record count, and that the record-locator table fits where the
/// header says it does. Does not yet validate individual key/value spans —
/// that happens lazily in `locate_key`/`locate_value`, which are the only
/// operations that ever read record bytes.
pub fn load_node<R: Read + Seek>(reader: &mut R, block_nr: u64, block_size: u32) -> Result<Node> {
    let block = object::read_block_view(reader, block_nr, block_size)?;
    if !crate::fletcher::verify_object(&block.bytes) {
        return Err(ApfsError::ChecksumMismatch { block_nr });
    }

    let header = ObjectHeader::parse(&block.bytes)?;
    let node_header = NodeHeader::parse(&block.bytes[ObjectHeader::SIZE..])?;

    if node_header.record_count == 0 {
        return Err(ApfsError::EmptyNode { block_nr });
    }

    let header_size = ObjectHeader::SIZE + NodeHeader::SIZE;
    let table_end = header_size
        + node_header.table_space_off as usize
        + node_header.table_space_len as usize;
    let block_size = block_size as usize;

    if table_end > block_size {
        return Err(ApfsError::TableOverflow { block_nr });
    }

    let entry_size: usize = if node_header.flags & BTN_FIXED_KV_SIZE != 0 { 4 } else { 8 };
    let table_bytes = node_header.record_count as usize * entry_size;
    if table_bytes > node_header.table_space_len as usize {
        return Err(ApfsError::TableOverflow { block_nr });
    }

    let free_start = table_end + node_header.free_space_off as usize;
    let data_start = free_start + node_header.free_space_len as usize;
    if free_start < table_end || data_start < free_start || data_start > block_size {
        return Err(ApfsError::TableOverflow { block_nr });
    }

    // Parse the record-locator table, immediately after the node header,
    // at table_space_off (normally zero).
    let table_start = header_size + node_header.table_space_off as usize;
    let mut cursor = Cursor::new(&block.bytes[table_start..]);
    let mut toc = Vec::with_capacity(node_header.record_count as usize);
    let fixed = node_header.flags & BTN_FIXED_KV_SIZE != 0;
    for _ in 0..node_header.record_count {
        if fixed {
            let key_off = cursor.read_u16::<LittleEndian>()?;
            let val_off = cursor.read_u16::<LittleEndian>()?;
            toc.push(TocEntry { key_off, key_len: 0, val_off, val_len: 0 });
        } else {
            let key_off = cursor.read_u16::<LittleEndian>()?;
            let key_len = cursor.read_u16::<LittleEndian>()?;
            let val_off = cursor.read_u16::<LittleEndian>()?;
            let val_len = cursor.read_u16::<LittleEndian>()?;
            toc.push(TocEntry { key_off, key_len, val_off, val_len });
        }
    }

    Ok(Node {
        flags: node_header.flags,
        record_count: node_header.record_count,
        table_end,
        free_start,
        data_start,
        object_id: header.oid,
        block_nr,
        raw: block.bytes,
        toc,
    })
}

/// Locate the `(offset, length)` span of the key at `index` within `node`'s block.
pub fn locate_key(node: &Node, index: i64) -> Result<(usize, usize)> {
    if index < 0 || index as u32 >= node.record_count {
        return Err(ApfsError::LocatorOutOfBounds { block_nr: node.block_nr, index });
    }
    let entry = &node.toc[index as usize];

    let (off, len) = if node.is_fixed_kv() {
        (node.table_end + entry.key_off as usize, 16usize)
    } else {
        (node.table_end + entry.key_off as usize, entry.key_len as usize)
    };

    let in_bounds = matches!(off.checked_add(len), Some(end) if end <= node.raw.len());
    if !in_bounds {
        return Err(ApfsError::LocatorOutOfBounds { block_nr: node.block_nr, index });
    }
    Ok((off, len))
}

/// Locate the `(offset, length)` span of the value at `index` within `node`'s block.
pub fn locate_value(node: &Node, index: i64) -> Result<(usize, usize)> {
    if index < 0 || index as u32 >= node.record_count {
        return Err(ApfsError::LocatorOutOfBounds { block_nr: node.block_nr, index });
    }
    let entry = &node.toc[index as usize];

    let len = if node.is_fixed_kv() {
        if node.is_leaf() { 16usize } else { 8usize }
    } else {
        entry.val_len as usize
    };

    let footer = if node.is_root() { TREE_INFO_SIZE } else { 0 };
    let base = node.raw.len().checked_sub(footer)
        .ok_or(ApfsError::LocatorOutOfBounds { block_nr: node.block_nr, index })?;
    let off = base.checked_sub(entry.val_off as usize)
        .ok_or(ApfsError::LocatorOutOfBounds { block_nr: node.block_nr, index })?;

    let in_bounds = matches!(off.checked_add(len), Some(end) if end <= node.raw.len());
    if !in_bounds || off < node.table_end {
        return Err(ApfsError::LocatorOutOfBounds { block_nr: node.block_nr, index });
    }
    Ok((off, len))
}
