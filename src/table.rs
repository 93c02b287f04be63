//! Generic meta-block-indexed table.
//!
//! The id table, fragment table, and export table all share the same
//! on-disk shape: the records themselves live packed into metadata blocks
//! somewhere in the image, and a flat array of 8-byte absolute block
//! offsets (the "index") lives at a location the superblock points to.
//! This mirrors how `id_table.c`/`export_table.c` in the original are both
//! thin wrappers around the same "array of records, chunked into meta
//! blocks, indexed by a block-offset array" pattern.

use std::sync::Arc;

use deku::prelude::*;

use crate::error::SquashfsError;
use crate::metadata::{MetadataReader, MetadataRef, MetadataWriter, SQFS_META_BLOCK_SIZE};
use crate::traits::Codec;

/// Writes `records` (each `record_size` bytes once serialized) into meta
/// blocks, then returns `(table_bytes, index_block_offsets)` where
/// `index_block_offsets` is the array that must itself be written
/// immediately after `table_bytes` in the image and pointed to from the
/// superblock.
pub fn build_indexed_table(
    codec: Arc<dyn Codec>,
    records: &[Vec<u8>],
    records_per_block_hint: usize,
) -> Result<(Vec<u8>, Vec<u64>), SquashfsError> {
    let mut writer = MetadataWriter::new(codec);
    let mut index = Vec::new();
    let per_block = records_per_block_hint.max(1);

    for (i, rec) in records.iter().enumerate() {
        if i % per_block == 0 {
            index.push(writer.position().block_start);
        }
        writer.write_bytes(rec)?;
    }
    let bytes = writer.finish()?;
    Ok((bytes, index))
}

/// Reads back a table built by [`build_indexed_table`]: `index` is the flat
/// array of meta-block start offsets (relative to `area`'s start), `count`
/// is the total record count, `decode` parses one record out of the
/// metadata stream.
pub fn read_indexed_table<T>(
    codec: Arc<dyn Codec>,
    area: &[u8],
    index: &[u64],
    count: usize,
    records_per_block: usize,
    mut decode: impl FnMut(&mut MetadataReader) -> Result<T, SquashfsError>,
) -> Result<Vec<T>, SquashfsError> {
    let mut out = Vec::with_capacity(count);
    let mut reader = MetadataReader::new(codec, area);
    for i in 0..count {
        if i % records_per_block.max(1) == 0 {
            let block = index[i / records_per_block.max(1)];
            reader.seek(MetadataRef::new(block, 0))?;
        }
        out.push(decode(&mut reader)?);
    }
    Ok(out)
}

/// One entry of the NFS export table: `inode_number - 1` indexes this
/// array, and the value is the packed [`MetadataRef`] of that inode.
/// Gaps (an inode number that was never assigned, e.g. a collapsed hard
/// link) are filled with `0xFFFFFFFFFFFFFFFF`, matching
/// `add_export_table_entry`'s `memset(...,0xff,...)` gap-fill.
pub const EXPORT_TABLE_GAP: u64 = u64::MAX;

#[derive(Debug, Clone, Default)]
pub struct ExportTable {
    pub inode_refs: Vec<u64>,
}

impl ExportTable {
    pub fn set(&mut self, inode_number: u32, inode_ref: u64) {
        let idx = inode_number as usize - 1;
        if idx >= self.inode_refs.len() {
            self.inode_refs.resize(idx + 1, EXPORT_TABLE_GAP);
        }
        self.inode_refs[idx] = inode_ref;
    }

    pub fn get(&self, inode_number: u32) -> Option<u64> {
        self.inode_refs
            .get(inode_number as usize - 1)
            .copied()
            .filter(|&r| r != EXPORT_TABLE_GAP)
    }
}
