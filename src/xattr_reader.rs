//! Xattr reader: resolves an inode's `xattr_index` into its list of
//! `(name, value)` pairs.
//!
//! Grounded on `original_source/lib/sqfs/xattr_reader.c`. The id table is
//! addressed the same way the export table is (`idx * entry_size`, split
//! into a meta-block and an in-block offset via `id_block_starts`); the
//! kv pairs themselves are read straight out of the kv area, following
//! one out-of-line indirection when a key's [`XattrKey::is_out_of_line`]
//! bit is set.

use crate::error::SquashfsError;
use crate::metadata::{MetadataReader, MetadataRef};
use crate::traits::Codec;
use crate::xattr::{XattrIdEntry, XATTR_ID_ENTRY_SIZE};

pub const NO_XATTRS: u32 = 0xffff_ffff;
const SQFS_META_BLOCK_SIZE: usize = crate::metadata::SQFS_META_BLOCK_SIZE;

pub struct XattrReader<'a> {
    id_reader: MetadataReader<'a>,
    kv_reader: MetadataReader<'a>,
    id_block_starts: Vec<u64>,
    num_ids: u32,
}

impl<'a> XattrReader<'a> {
    pub fn new(
        codec: std::sync::Arc<dyn Codec>,
        id_area: &'a [u8],
        kv_area: &'a [u8],
        id_block_starts: Vec<u64>,
        num_ids: u32,
    ) -> Self {
        Self {
            id_reader: MetadataReader::new(codec.clone(), id_area),
            kv_reader: MetadataReader::new(codec, kv_area),
            id_block_starts,
            num_ids,
        }
    }

    fn get_desc(&mut self, idx: u32) -> Result<XattrIdEntry, SquashfsError> {
        if idx >= self.num_ids {
            return Err(SquashfsError::OutOfBounds);
        }
        let block = (idx as usize * XATTR_ID_ENTRY_SIZE) / SQFS_META_BLOCK_SIZE;
        let offset = (idx as usize * XATTR_ID_ENTRY_SIZE) % SQFS_META_BLOCK_SIZE;
        let block_start = *self
            .id_block_starts
            .get(block)
            .ok_or(SquashfsError::OutOfBounds)?;
        self.id_reader
            .seek(MetadataRef::new(block_start, offset as u16))?;
        let mut buf = [0u8; XATTR_ID_ENTRY_SIZE];
        self.id_reader.read(&mut buf)?;
        let (_, entry) = XattrIdEntry::from_bytes((&buf, 0)).map_err(SquashfsError::Deku)?;
        Ok(entry)
    }

    fn read_record(&mut self) -> Result<Vec<u8>, SquashfsError> {
        let mut size_buf = [0u8; 4];
        self.kv_reader.read(&mut size_buf)?;
        let size = u32::from_le_bytes(size_buf) as usize;
        let mut value = vec![0u8; size];
        self.kv_reader.read(&mut value)?;
        Ok(value)
    }

    fn read_one(&mut self) -> Result<(String, Vec<u8>), SquashfsError> {
        let mut prefix_buf = [0u8; 4];
        self.kv_reader.read(&mut prefix_buf)?;
        let xattr_type = u16::from_le_bytes([prefix_buf[0], prefix_buf[1]]);
        let name_size = u16::from_le_bytes([prefix_buf[2], prefix_buf[3]]) as usize;
        let mut name = vec![0u8; name_size];
        self.kv_reader.read(&mut name)?;

        let out_of_line = xattr_type & 0x0100 != 0;
        let prefix = crate::xattr::XattrPrefix::from_id(xattr_type & 0x00ff)?;
        let name = String::from_utf8(name)?;
        let full_name = format!("{}.{}", prefix.as_str(), name);

        let raw = self.read_record()?;
        let value = if out_of_line {
            if raw.len() != 8 {
                return Err(SquashfsError::Corrupted("out-of-line xattr value ref"));
            }
            let loc = MetadataRef::unpack(u64::from_le_bytes(raw.try_into().unwrap()));
            let saved = self.kv_reader.position();
            self.kv_reader.seek(loc)?;
            let value = self.read_record()?;
            self.kv_reader.seek(saved)?;
            value
        } else {
            raw
        };

        Ok((full_name, value))
    }

    /// Returns every `(name, value)` pair attached via `xattr_index`.
    /// `0xffffffff` (no xattrs) yields an empty list.
    #[tracing::instrument(skip_all)]
    pub fn attributes(&mut self, xattr_index: u32) -> Result<Vec<(String, Vec<u8>)>, SquashfsError> {
        if xattr_index == NO_XATTRS {
            return Ok(Vec::new());
        }
        let desc = self.get_desc(xattr_index)?;
        self.kv_reader.seek(MetadataRef::unpack(desc.xattr))?;

        let mut out = Vec::with_capacity(desc.count as usize);
        for _ in 0..desc.count {
            out.push(self.read_one()?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::StoreCodec;
    use crate::xattr_writer::XattrWriter;
    use std::sync::Arc;

    #[test]
    fn round_trips_inline_value() {
        let mut w = XattrWriter::new();
        w.begin();
        w.add("user.comment", b"hello").unwrap();
        let idx = w.end();

        let codec: Arc<dyn Codec> = Arc::new(StoreCodec);
        let flushed = w.flush(codec.clone()).unwrap();
        let id_starts = flushed.id_block_starts();

        let mut reader = XattrReader::new(
            codec,
            &flushed.id_area,
            &flushed.kv_area,
            id_starts,
            flushed.num_ids,
        );
        let attrs = reader.attributes(idx).unwrap();
        assert_eq!(attrs, vec![("user.comment".to_string(), b"hello".to_vec())]);
    }

    #[test]
    fn no_xattrs_yields_empty_list() {
        let codec: Arc<dyn Codec> = Arc::new(StoreCodec);
        let mut reader = XattrReader::new(codec, &[], &[], vec![0], 0);
        assert_eq!(reader.attributes(NO_XATTRS).unwrap(), Vec::new());
    }

    #[test]
    fn repeated_large_value_is_hoisted_out_of_line() {
        let mut w = XattrWriter::new();
        let big = vec![0x42u8; 64];

        w.begin();
        w.add("user.a", &big).unwrap();
        let i1 = w.end();

        w.begin();
        w.add("user.b", &big).unwrap();
        let i2 = w.end();

        let codec: Arc<dyn Codec> = Arc::new(StoreCodec);
        let flushed = w.flush(codec.clone()).unwrap();
        let id_starts = flushed.id_block_starts();

        let mut reader = XattrReader::new(
            codec,
            &flushed.id_area,
            &flushed.kv_area,
            id_starts,
            flushed.num_ids,
        );
        assert_eq!(reader.attributes(i1).unwrap()[0].1, big);
        assert_eq!(reader.attributes(i2).unwrap()[0].1, big);
    }
}
