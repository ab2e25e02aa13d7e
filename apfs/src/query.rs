//! Bisection search within a node, range-cursor advancement, and the
//! iterative top-down descent that ties them together across tree levels.

use byteorder::{LittleEndian, ReadBytesExt};
use std::cmp::Ordering;
use std::io::{Cursor, Read, Seek};

use crate::error::{ApfsError, Result};
use crate::keys::{self, Key, TreeKind};
use crate::node::{self, Node};
use crate::omap;

pub const TREE_CAT: u32 = 1 << 0;
pub const TREE_OMAP: u32 = 1 << 1;
pub const EXACT: u32 = 1 << 2;
pub const MULTIPLE: u32 = 1 << 3;
pub const NEXT: u32 = 1 << 4;
pub const DONE: u32 = 1 << 5;

/// An active search cursor at one tree level, linked to its ancestor via `parent`.
pub struct Query {
    pub node: Node,
    pub parent: Option<Box<Query>>,
    pub key: Key,
    pub index: i64,
    pub depth: u32,
    pub flags: u32,
    pub key_off: usize,
    pub key_len: usize,
    pub off: usize,
    pub len: usize,
}

pub fn new_query(node: Node, key: Key, flags: u32, parent: Option<Box<Query>>) -> Query {
    let depth = parent.as_ref().map(|p| p.depth + 1).unwrap_or(0);
    let index = node.record_count as i64;
    Query {
        node,
        parent,
        key,
        index,
        depth,
        flags: flags & !(DONE | NEXT),
        key_off: 0,
        key_len: 0,
        off: 0,
        len: 0,
    }
}

fn tree_kind_of(flags: u32) -> TreeKind {
    if flags & TREE_OMAP != 0 { TreeKind::Omap } else { TreeKind::Catalog }
}

fn decode_for(kind: TreeKind, bytes: &[u8], strip: bool) -> Result<Key> {
    let key = keys::decode_key(kind, bytes)?;
    if !strip {
        return Ok(key);
    }
    Ok(match key {
        Key::Cat(k) => Key::Cat(keys::strip_disambiguator(k)),
        other => other,
    })
}

/// Find the greatest index in `query.node` whose key is ≤ `query.key`.
/// Returns `true` (and fills in `query.{key_off,key_len,off,len}`) on a
/// usable candidate, `false` for NOT_FOUND.
pub fn search_node(query: &mut Query) -> Result<bool> {
    let kind = tree_kind_of(query.flags);
    let multiple = query.flags & MULTIPLE != 0;
    let block_nr = query.node.block_nr;

    let mut cmp: i32 = 1;
    let mut left: i64 = 0;
    let mut right: i64 = query.index - 1;

    loop {
        if cmp > 0 {
            right = query.index - 1;
            if right < left {
                return Ok(false);
            }
            query.index = (left + right) / 2;
        } else {
            left = query.index;
            query.index = (left + right + 1) / 2; // ceil
        }

        let (key_off, key_len) = node::locate_key(&query.node, query.index)?;
        let curr = decode_for(kind, &query.node.raw()[key_off..key_off + key_len], multiple)?;
        // query.key is constructed by the caller with any disambiguator
        // already stripped for MULTIPLE queries, so it needs no decoding here.
        cmp = match keys::compare_keys(curr, query.key) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        };
        query.key_off = key_off;
        query.key_len = key_len;

        if cmp == 0 && !multiple {
            break;
        }
        if left == right {
            break;
        }
    }

    if cmp > 0 {
        return Ok(false);
    }
    if query.node.is_leaf() && query.flags & EXACT != 0 && cmp != 0 {
        return Ok(false);
    }
    if multiple {
        query.flags |= NEXT;
        if cmp != 0 {
            query.flags |= DONE;
        }
    }

    let (off, len) = node::locate_value(&query.node, query.index)?;
    if len == 0 {
        return Err(ApfsError::WrongValueSize { block_nr, index: query.index });
    }
    query.off = off;
    query.len = len;
    Ok(true)
}

pub enum AdvanceResult {
    Found,
    NotFound,
    TryAnotherBranch,
}

/// Step a `MULTIPLE` cursor to the previous record within the same node.
pub fn advance_node(query: &mut Query) -> Result<AdvanceResult> {
    let kind = tree_kind_of(query.flags);
    let block_nr = query.node.block_nr;

    if query.flags & DONE != 0 {
        return Ok(AdvanceResult::NotFound);
    }
    if query.index == 0 {
        return Ok(AdvanceResult::TryAnotherBranch);
    }

    query.index -= 1;
    let (key_off, key_len) = node::locate_key(&query.node, query.index)?;
    let curr = decode_for(kind, &query.node.raw()[key_off..key_off + key_len], true)?;
    let cmp = keys::compare_keys(curr, query.key);
    if cmp == Ordering::Greater {
        return Err(ApfsError::OutOfOrder { block_nr });
    }
    if query.node.is_leaf() && query.flags & EXACT != 0 && cmp != Ordering::Equal {
        return Ok(AdvanceResult::NotFound);
    }

    query.key_off = key_off;
    query.key_len = key_len;
    let (off, len) = node::locate_value(&query.node, query.index)?;
    if len == 0 {
        return Err(ApfsError::WrongValueSize { block_nr, index: query.index });
    }
    query.off = off;
    query.len = len;
    if cmp != Ordering::Equal {
        query.flags |= DONE;
    }
    Ok(AdvanceResult::Found)
}

/// Drive a query from its current level to a leaf match, descending through
/// interior nodes (resolving child ids through the object map when the tree
/// being walked is a catalog) and backtracking across node boundaries when a
/// `MULTIPLE` cursor runs out of candidates in the current subtree.
pub fn execute_query<R: Read + Seek>(
    reader: &mut R,
    mut query: Query,
    block_size: u32,
    omap_root: Option<u64>,
) -> Result<Option<Query>> {
    loop {
        if query.depth >= 12 {
            return Err(ApfsError::DepthOverflow);
        }

        let found = if query.flags & NEXT != 0 {
            match advance_node(&mut query)? {
                AdvanceResult::Found => true,
                AdvanceResult::NotFound => false,
                AdvanceResult::TryAnotherBranch => match query.parent.take() {
                    Some(parent) => {
                        query = *parent;
                        continue;
                    }
                    None => return Ok(None),
                },
            }
        } else {
            search_node(&mut query)?
        };

        if !found {
            return Ok(None);
        }

        if query.node.is_leaf() {
            return Ok(Some(query));
        }

        if query.len != 8 {
            return Err(ApfsError::WrongValueSize { block_nr: query.node.block_nr, index: query.index });
        }
        let mut cursor = Cursor::new(&query.node.raw()[query.off..query.off + 8]);
        let child_id = cursor.read_u64::<LittleEndian>()?;

        let child_bno = if query.flags & TREE_OMAP != 0 {
            child_id
        } else {
            let root = omap_root.ok_or(ApfsError::MissingOmapRoot)?;
            omap::omap_lookup(reader, root, block_size, child_id)?
        };

        let child = node::load_node(reader, child_bno, block_size)?;
        if child.object_id != child_id {
            return Err(ApfsError::WrongChildOid { expected: child_id, actual: child.object_id });
        }

        if query.flags & MULTIPLE != 0 {
            let child_key = query.key;
            let flags = query.flags;
            query = new_query(child, child_key, flags, Some(Box::new(query)));
        } else {
            query.node = child;
            query.index = query.node.record_count as i64;
            query.depth += 1;
            query.flags &= !(DONE | NEXT);
        }
    }
}
