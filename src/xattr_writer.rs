//! Xattr interning and the writer side of the two-level xattr tables.
//!
//! Grounded on `original_source/lib/sqfs/xattr/xattr_writer_record.c` (key/
//! value interning, kv-block content dedup) and `xattr_writer_flush.c`
//! (on-disk layout: a run of kv pairs per inode, out-of-line hoisting for
//! values referenced more than once, then an id table pointing at each
//! run). One [`XattrWriter`] is shared across the whole image; each
//! inode that carries xattrs calls [`begin`](XattrWriter::begin),
//! [`add`](XattrWriter::add) for each pair, then
//! [`end`](XattrWriter::end) to get its `xattr_index`.

use std::collections::HashMap;

use crate::error::SquashfsError;
use crate::metadata::{MetadataRef, MetadataWriter};
use crate::traits::Codec;
use crate::xattr::{XattrIdEntry, XattrIdTable, XattrKey, XattrPrefix, XattrValue};

const NO_XATTRS: u32 = 0xffff_ffff;
/// Out-of-line hoisting pays off once a value is referenced more than
/// once and is bigger than the 8-byte back-reference it would be
/// replaced with at every use beyond the first.
const OOL_MIN_SIZE: usize = 8;

struct KvBlock {
    start: usize,
    count: usize,
}

#[derive(Default)]
struct Interner {
    index: HashMap<Vec<u8>, u32>,
    strings: Vec<Vec<u8>>,
    refcount: Vec<u32>,
}

impl Interner {
    fn get_or_insert(&mut self, s: &[u8]) -> u32 {
        if let Some(&i) = self.index.get(s) {
            return i;
        }
        let i = self.strings.len() as u32;
        self.strings.push(s.to_vec());
        self.refcount.push(0);
        self.index.insert(s.to_vec(), i);
        i
    }
}

pub struct XattrWriter {
    keys: Interner,
    values: Interner,
    pairs: Vec<(u32, u32)>,
    kv_start: usize,
    blocks: Vec<KvBlock>,
}

impl XattrWriter {
    pub fn new() -> Self {
        Self {
            keys: Interner::default(),
            values: Interner::default(),
            pairs: Vec::new(),
            kv_start: 0,
            blocks: Vec::new(),
        }
    }

    pub fn begin(&mut self) {
        self.kv_start = self.pairs.len();
    }

    /// `full_name` is the user-facing name (`user.foo`); `value` is the
    /// raw attribute payload.
    pub fn add(&mut self, full_name: &str, value: &[u8]) -> Result<(), SquashfsError> {
        let (prefix, rest) = XattrPrefix::split(full_name)?;
        let mut key_bytes = prefix.as_str().as_bytes().to_vec();
        key_bytes.push(b'.');
        key_bytes.extend_from_slice(rest.as_bytes());

        let key_index = self.keys.get_or_insert(&key_bytes);
        let value_index = self.values.get_or_insert(value);

        for pair in &mut self.pairs[self.kv_start..] {
            if *pair == (key_index, value_index) {
                return Ok(());
            }
            if pair.0 == key_index {
                self.values.refcount[pair.1 as usize] -= 1;
                self.values.refcount[value_index as usize] += 1;
                *pair = (key_index, value_index);
                return Ok(());
            }
        }
        self.values.refcount[value_index as usize] += 1;
        self.pairs.push((key_index, value_index));
        Ok(())
    }

    /// Finalizes the current inode's pair group: dedups it against
    /// earlier groups by exact content match and returns the
    /// `xattr_index` to store in the inode. `0xffffffff` means "no
    /// xattrs" and is returned for an empty group.
    pub fn end(&mut self) -> u32 {
        let count = self.pairs.len() - self.kv_start;
        if count == 0 {
            return NO_XATTRS;
        }

        self.pairs[self.kv_start..].sort_unstable();

        for (index, blk) in self.blocks.iter().enumerate() {
            if blk.count == count
                && self.pairs[blk.start..blk.start + blk.count]
                    == self.pairs[self.kv_start..self.kv_start + count]
            {
                self.pairs.truncate(self.kv_start);
                return index as u32;
            }
        }

        let index = self.blocks.len() as u32;
        self.blocks.push(KvBlock {
            start: self.kv_start,
            count,
        });
        index
    }

    fn should_store_ool(value: &[u8], refcount: u32) -> bool {
        refcount >= 2 && value.len() > OOL_MIN_SIZE
    }

    /// Serializes every distinct kv block, hoisting repeatedly-referenced
    /// values out-of-line, then the id table pointing at each block.
    /// Returns the finished areas plus enough bookkeeping for the caller
    /// (typically `squashfs.rs`) to place them in the image and fill in
    /// the superblock's `xattr_id_table_start`.
    #[tracing::instrument(skip_all)]
    pub fn flush(&self, codec: std::sync::Arc<dyn Codec>) -> Result<FlushedXattrs, SquashfsError> {
        if self.blocks.is_empty() {
            return Ok(FlushedXattrs {
                kv_area: Vec::new(),
                id_area: Vec::new(),
                num_ids: 0,
            });
        }

        let mut ool_locations = vec![None; self.values.strings.len()];
        let mut kv_writer = MetadataWriter::new(codec.clone());
        let mut block_refs = Vec::with_capacity(self.blocks.len());
        let mut block_sizes = Vec::with_capacity(self.blocks.len());

        for blk in &self.blocks {
            let start_ref = kv_writer.position();
            let mut size = 0u32;
            for &(key_idx, val_idx) in &self.pairs[blk.start..blk.start + blk.count] {
                let key_bytes = &self.keys.strings[key_idx as usize];
                let (prefix, rest) = XattrPrefix::split(&String::from_utf8_lossy(key_bytes))?;

                if let Some(loc) = ool_locations[val_idx as usize] {
                    let key = XattrKey::new(prefix, rest, true);
                    size += write_record(&mut kv_writer, &key.to_bytes().map_err(SquashfsError::Deku)?)?;
                    let vent = XattrValue {
                        size: 8,
                        value: MetadataRef::pack(loc).to_le_bytes().to_vec(),
                    };
                    size += write_record(&mut kv_writer, &vent.to_bytes().map_err(SquashfsError::Deku)?)?;
                } else {
                    let key = XattrKey::new(prefix, rest, false);
                    size += write_record(&mut kv_writer, &key.to_bytes().map_err(SquashfsError::Deku)?)?;

                    let value_ref = kv_writer.position();
                    let value_bytes = &self.values.strings[val_idx as usize];
                    let vent = XattrValue {
                        size: value_bytes.len() as u32,
                        value: value_bytes.clone(),
                    };
                    size += write_record(&mut kv_writer, &vent.to_bytes().map_err(SquashfsError::Deku)?)?;

                    if Self::should_store_ool(value_bytes, self.values.refcount[val_idx as usize]) {
                        ool_locations[val_idx as usize] = Some(value_ref);
                    }
                }
            }
            block_refs.push(start_ref);
            block_sizes.push(size);
        }

        let kv_area = kv_writer.finish()?;

        let mut id_writer = MetadataWriter::new(codec);
        for (blk, (start_ref, size)) in self.blocks.iter().zip(block_refs.iter().zip(block_sizes.iter())) {
            let entry = XattrIdEntry {
                xattr: start_ref.pack(),
                count: blk.count as u32,
                size: *size,
            };
            id_writer.write_bytes(&entry.to_bytes().map_err(SquashfsError::Deku)?)?;
        }
        let id_area = id_writer.finish()?;

        Ok(FlushedXattrs {
            kv_area,
            id_area,
            num_ids: self.blocks.len() as u32,
        })
    }
}

impl Default for XattrWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn write_record(writer: &mut MetadataWriter, bytes: &[u8]) -> Result<u32, SquashfsError> {
    writer.write_bytes(bytes)?;
    Ok(bytes.len() as u32)
}

/// The two framed areas produced by [`XattrWriter::flush`]. The caller
/// places `kv_area` then `id_area` consecutively in the image, then
/// writes an [`XattrIdTable`] header (`xattr_table_start` = the absolute
/// offset `kv_area` was placed at) followed by one relative-to-absolute
/// corrected `u64` per distinct meta-block `id_area` spans, matching
/// `write_location_table` in the original.
pub struct FlushedXattrs {
    pub kv_area: Vec<u8>,
    pub id_area: Vec<u8>,
    pub num_ids: u32,
}

impl FlushedXattrs {
    pub fn is_empty(&self) -> bool {
        self.num_ids == 0
    }

    /// Block-start offsets (relative to the start of `id_area`) the
    /// id-table meta-blocks begin at — one location table entry per
    /// block, per `sqfs_xattr_id_table_t`'s trailing array.
    pub fn id_block_starts(&self) -> Vec<u64> {
        let mut starts = vec![0u64];
        let mut offset = 0usize;
        while offset < self.id_area.len() {
            let header = u16::from_le_bytes([self.id_area[offset], self.id_area[offset + 1]]);
            let len = crate::metadata::payload_len(header) as usize;
            offset += 2 + len;
            if offset < self.id_area.len() {
                starts.push(offset as u64);
            }
        }
        starts
    }

    pub fn header(&self, kv_start_abs: u64) -> XattrIdTable {
        XattrIdTable {
            xattr_table_start: kv_start_abs,
            xattr_ids: self.num_ids,
            unused: 0,
        }
    }
}
