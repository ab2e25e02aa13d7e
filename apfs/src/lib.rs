pub mod check;
pub mod error;
pub mod fletcher;
pub mod keys;
pub mod node;
pub mod object;
pub mod omap;
pub mod query;
pub mod superblock;

pub use error::{ApfsError, Result};

use std::io::{Read, Seek};

use check::CheckStats;
use keys::Key;
use node::Node;

/// Read the omap-phys object at `omap_block`, load its B-tree root, and walk
/// the whole tree checking the structural invariants. Returns the root node
/// so a caller (typically the `Checker`, or `parse_cat_btree` below) can
/// resolve further oids through it.
pub fn parse_omap_btree<R: Read + Seek>(
    reader: &mut R,
    omap_block: u64,
    block_size: u32,
) -> Result<Node> {
    let root_block = omap::read_omap_tree_root(reader, omap_block, block_size)?;
    let root = node::load_node(reader, root_block, block_size)?;
    let mut stats = CheckStats::default();
    check::check_subtree(reader, &root, block_size, None, 0, Key::Floor, &mut stats)?;
    Ok(root)
}

/// Resolve `oid` through `omap_root_block`, load the resulting B-tree root,
/// and walk it checking the structural invariants, resolving every interior
/// child id through the same omap.
pub fn parse_cat_btree<R: Read + Seek>(
    reader: &mut R,
    oid: u64,
    omap_root_block: u64,
    block_size: u32,
) -> Result<Node> {
    let root_block = omap::omap_lookup(reader, omap_root_block, block_size, oid)?;
    let root = node::load_node(reader, root_block, block_size)?;
    let mut stats = CheckStats::default();
    check::check_subtree(reader, &root, block_size, Some(omap_root_block), 0, Key::Floor, &mut stats)?;
    Ok(root)
}

/// Summary of one end-to-end check run, for the CLI to report on success.
#[derive(Debug, Default, Clone)]
pub struct CheckReport {
    pub volumes_checked: usize,
    pub nodes_visited: u64,
    pub max_depth: u32,
}

/// Drives a full container check: container superblock → container omap →
/// every non-zero volume → that volume's omap → that volume's catalog.
pub struct Checker<R: Read + Seek> {
    reader: R,
}

impl<R: Read + Seek> Checker<R> {
    pub fn new(reader: R) -> Self {
        Checker { reader }
    }

    /// Run the full check. Any fatal condition aborts immediately with the
    /// specific error that caused it; there is no partial/best-effort mode.
    pub fn run(&mut self) -> Result<CheckReport> {
        let nxsb = superblock::read_nxsb(&mut self.reader)?;
        let nxsb = superblock::find_latest_nxsb(&mut self.reader, &nxsb)?;
        let block_size = nxsb.block_size;

        let container_omap_root_block = omap::read_omap_tree_root(&mut self.reader, nxsb.omap_oid, block_size)?;
        let container_omap_root = node::load_node(&mut self.reader, container_omap_root_block, block_size)?;
        let mut stats = CheckStats::default();
        check::check_subtree(&mut self.reader, &container_omap_root, block_size, None, 0, Key::Floor, &mut stats)?;

        let volume_oids: Vec<u64> = nxsb.fs_oids.iter().copied().filter(|&o| o != 0).collect();
        if volume_oids.is_empty() {
            return Err(ApfsError::NoVolume);
        }

        for vol_oid in volume_oids.iter().copied() {
            let vol_block = omap::omap_lookup(&mut self.reader, container_omap_root_block, block_size, vol_oid)?;
            let vol_data = object::read_block(&mut self.reader, vol_block, block_size)?;
            let vol_sb = superblock::ApfsSuperblock::parse(&vol_data)?;

            let vol_omap_root_block = omap::read_omap_tree_root(&mut self.reader, vol_sb.omap_oid, block_size)?;
            let vol_omap_root = node::load_node(&mut self.reader, vol_omap_root_block, block_size)?;
            check::check_subtree(&mut self.reader, &vol_omap_root, block_size, None, 0, Key::Floor, &mut stats)?;

            let cat_root_block =
                omap::omap_lookup(&mut self.reader, vol_omap_root_block, block_size, vol_sb.root_tree_oid)?;
            let cat_root = node::load_node(&mut self.reader, cat_root_block, block_size)?;
            check::check_subtree(
                &mut self.reader,
                &cat_root,
                block_size,
                Some(vol_omap_root_block),
                0,
                Key::Floor,
                &mut stats,
            )?;
        }

        Ok(CheckReport {
            volumes_checked: volume_oids.len(),
            nodes_visited: stats.nodes_visited,
            max_depth: stats.max_depth,
        })
    }
}
