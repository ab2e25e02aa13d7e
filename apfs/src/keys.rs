//! Key decoding and ordering for the two B-tree kinds this checker walks:
//! the object map (omap) and a volume's catalog tree.
//!
//! The catalog holds several record kinds (inode, dirrec, extent, ...)
//! multiplexed by a tag in the high bits of the object id. Decoding full
//! record values is out of scope here; only what the query engine and the
//! structural checker need is kept: the primary key, and for catalog
//! dirrec keys, the name hash used as MULTIPLE's disambiguator.

use byteorder::{LittleEndian, ReadBytesExt};
use std::cmp::Ordering;
use std::io::Cursor;

use crate::error::{ApfsError, Result};

/// Which tree a key belongs to, so the comparator knows how to decode it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    Omap,
    Catalog,
}

// Catalog object-id tag, upper 8 bits of the 64-bit catalog key's oid field.
pub const OBJ_TYPE_INODE: u8 = 3;
pub const OBJ_TYPE_XATTR: u8 = 4;
pub const OBJ_TYPE_DIR_REC: u8 = 9;
pub const OBJ_TYPE_FILE_EXTENT: u8 = 8;

const OBJ_ID_MASK: u64 = 0x0FFF_FFFF_FFFF_FFFF;
const OBJ_TYPE_SHIFT: u32 = 60;

/// Omap key: `(object_id, xid)`, ordered lexicographically on object_id then xid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OmapKey {
    pub oid: u64,
    pub xid: u64,
}

/// Omap leaf value: a physical block number and flags, size checked by the caller.
#[derive(Debug, Clone, Copy)]
pub struct OmapValue {
    pub flags: u32,
    pub size: u32,
    pub paddr: u64,
}

/// Catalog key: the tagged object id plus an optional type-specific
/// disambiguator (name hash for dirrec, logical offset for file extents).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatKey {
    pub oid: u64,
    pub obj_type: u8,
    pub disambiguator: u64,
}

/// A decoded key from either tree, plus `Floor`: a sentinel that compares
/// less than any real key, used to seed a pre-order walk. Never constructed
/// from on-disk bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Omap(OmapKey),
    Cat(CatKey),
    Floor,
}

pub fn decode_omap_key(data: &[u8]) -> Result<OmapKey> {
    if data.len() < 16 {
        return Err(ApfsError::Malformed(format!("omap key too short: {} bytes", data.len())));
    }
    let mut cursor = Cursor::new(data);
    let oid = cursor.read_u64::<LittleEndian>()?;
    let xid = cursor.read_u64::<LittleEndian>()?;
    Ok(OmapKey { oid, xid })
}

pub fn decode_omap_value(data: &[u8]) -> Result<OmapValue> {
    if data.len() < 16 {
        return Err(ApfsError::Malformed(format!("omap value too short: {} bytes", data.len())));
    }
    let mut cursor = Cursor::new(data);
    let flags = cursor.read_u32::<LittleEndian>()?;
    let size = cursor.read_u32::<LittleEndian>()?;
    let paddr = cursor.read_u64::<LittleEndian>()?;
    Ok(OmapValue { flags, size, paddr })
}

/// Build the sentinel key used to look up the current (highest xid) mapping
/// for `oid`: the omap orders by `(oid, xid)`, so pairing `oid` with
/// `u64::MAX` makes an EXACT, non-MULTIPLE bisection land on the greatest
/// existing xid for that object in a single pass.
pub fn make_omap_key(oid: u64) -> OmapKey {
    OmapKey { oid, xid: u64::MAX }
}

/// Decode a catalog key. The object id's top 4 bits are the record type tag;
/// the remainder, plus any type-specific trailing bytes, form the rest of
/// the key.
pub fn decode_catalog_key(data: &[u8]) -> Result<CatKey> {
    if data.len() < 8 {
        return Err(ApfsError::Malformed(format!("catalog key too short: {} bytes", data.len())));
    }
    let mut cursor = Cursor::new(data);
    let tagged = cursor.read_u64::<LittleEndian>()?;
    let oid = tagged & OBJ_ID_MASK;
    let obj_type = (tagged >> OBJ_TYPE_SHIFT) as u8;

    let disambiguator = match obj_type {
        OBJ_TYPE_DIR_REC => {
            // dirrec keys carry a variable-length name followed by a
            // 2-byte hash; only the hash matters for ordering/dedup here.
            if data.len() < 2 {
                return Err(ApfsError::Malformed("dirrec key missing name hash".into()));
            }
            let hash_bytes = &data[data.len() - 2..];
            u16::from_le_bytes([hash_bytes[0], hash_bytes[1]]) as u64
        }
        OBJ_TYPE_FILE_EXTENT => {
            if data.len() < 16 {
                return Err(ApfsError::Malformed("file extent key too short".into()));
            }
            cursor.read_u64::<LittleEndian>()? // logical offset
        }
        _ => 0,
    };

    Ok(CatKey { oid, obj_type, disambiguator })
}

/// Strip a catalog key's disambiguator, producing the key a MULTIPLE query
/// uses once it has matched a primary key and wants every following record
/// that shares it.
pub fn strip_disambiguator(key: CatKey) -> CatKey {
    CatKey { disambiguator: 0, ..key }
}

fn cmp_omap(a: OmapKey, b: OmapKey) -> Ordering {
    a.oid.cmp(&b.oid).then(a.xid.cmp(&b.xid))
}

fn cmp_cat(a: CatKey, b: CatKey) -> Ordering {
    a.oid
        .cmp(&b.oid)
        .then(a.obj_type.cmp(&b.obj_type))
        .then(a.disambiguator.cmp(&b.disambiguator))
}

/// Compare two decoded keys of the same kind. `Floor` compares less than
/// anything and is never compared against another `Floor`. Any other
/// mismatch panics: it would indicate a caller bug (comparing across trees
/// never happens in a correctly driven query).
pub fn compare_keys(a: Key, b: Key) -> Ordering {
    match (a, b) {
        (Key::Floor, Key::Floor) => panic!("compare_keys: Floor has no defined order against itself"),
        (Key::Floor, _) => Ordering::Less,
        (_, Key::Floor) => Ordering::Greater,
        (Key::Omap(a), Key::Omap(b)) => cmp_omap(a, b),
        (Key::Cat(a), Key::Cat(b)) => cmp_cat(a, b),
        _ => panic!("compare_keys: mismatched key kinds"),
    }
}

pub fn decode_key(kind: TreeKind, data: &[u8]) -> Result<Key> {
    match kind {
        TreeKind::Omap => Ok(Key::Omap(decode_omap_key(data)?)),
        TreeKind::Catalog => Ok(Key::Cat(decode_catalog_key(data)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omap_key_orders_by_oid_then_xid() {
        let a = OmapKey { oid: 1, xid: 5 };
        let b = OmapKey { oid: 1, xid: 9 };
        let c = OmapKey { oid: 2, xid: 0 };
        assert_eq!(cmp_omap(a, b), Ordering::Less);
        assert_eq!(cmp_omap(b, c), Ordering::Less);
    }

    #[test]
    fn make_omap_key_sentinel_sorts_last_for_oid() {
        let sentinel = make_omap_key(7);
        let real = OmapKey { oid: 7, xid: 12345 };
        assert_eq!(cmp_omap(real, sentinel), Ordering::Less);
    }

    #[test]
    fn decode_catalog_key_extracts_tag_and_oid() {
        let oid: u64 = 0x42;
        let tagged = oid | ((OBJ_TYPE_INODE as u64) << OBJ_TYPE_SHIFT);
        let data = tagged.to_le_bytes();
        let key = decode_catalog_key(&data).unwrap();
        assert_eq!(key.oid, oid);
        assert_eq!(key.obj_type, OBJ_TYPE_INODE);
        assert_eq!(key.disambiguator, 0);
    }

    #[test]
    fn decode_catalog_key_dirrec_extracts_name_hash() {
        let oid: u64 = 0x10;
        let tagged = oid | ((OBJ_TYPE_DIR_REC as u64) << OBJ_TYPE_SHIFT);
        let mut data = tagged.to_le_bytes().to_vec();
        data.extend_from_slice(b"hello");
        let hash: u16 = 0xBEEF;
        data.extend_from_slice(&hash.to_le_bytes());
        let key = decode_catalog_key(&data).unwrap();
        assert_eq!(key.obj_type, OBJ_TYPE_DIR_REC);
        assert_eq!(key.disambiguator, hash as u64);
    }

    #[test]
    fn strip_disambiguator_zeroes_it() {
        let key = CatKey { oid: 1, obj_type: OBJ_TYPE_DIR_REC, disambiguator: 99 };
        assert_eq!(strip_disambiguator(key).disambiguator, 0);
    }
}
