//! Directory listing writer: groups entries into header-delimited runs
//! and, for large directories, emits an index for fast lookup.
//!
//! Grounded on `original_source/lib/sqfs/dir_writer.c`. A run breaks when
//! any of these stop holding for the candidate next entry:
//! - it shares the running header's inode-table meta-block
//!   (`inode_ref >> 16`)
//! - the signed delta from the header's `inode_number` fits in 16 bits
//!   (`-32768..=32767`, checked as `> 32767 || < -32767` in the original)
//! - the run has fewer than 256 entries so far
//! - header + entries-so-far + this entry still fit in one 8 KiB
//!   metadata block

use crate::dir::{DirEntry, DirHeader, DirectoryIndex};
use crate::error::SquashfsError;
use crate::metadata::{MetadataRef, MetadataWriter};
use crate::table::ExportTable;

const MAX_DIR_ENTRIES: usize = 256;
const META_BLOCK_SIZE: usize = crate::metadata::SQFS_META_BLOCK_SIZE;

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub name: Vec<u8>,
    pub inode_ref: u64,
    pub inode_number: u32,
    pub inode_type: u16,
}

pub struct DirectoryWriter {
    entries: Vec<PendingEntry>,
}

/// Result of writing one directory's listing: enough to fill in the
/// owning inode's `block_index`/`block_offset`/`file_size` (and, if the
/// index grew large enough to need one, an `ExtendedDirectory`'s
/// `dir_index`).
pub struct WrittenDirectory {
    pub start: MetadataRef,
    pub size: u32,
    pub index: Vec<DirectoryIndex>,
}

impl DirectoryWriter {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn add_entry(&mut self, name: Vec<u8>, inode_ref: u64, inode_number: u32, inode_type: u16) {
        self.entries.push(PendingEntry {
            name,
            inode_ref,
            inode_number,
            inode_type,
        });
    }

    /// `writer_offset` is the directory meta-writer's current within-block
    /// byte offset at `start` — the run's header and entries are written
    /// starting there, so the 8 KiB boundary check has to account for
    /// whatever is already in the current block, not just this run's own
    /// bytes (`get_conseq_entry_count` seeds its `size` from
    /// `sqfs_meta_writer_get_position` the same way).
    fn run_len(&self, start: usize, writer_offset: usize) -> usize {
        if self.entries.is_empty() {
            return 0;
        }
        let head = &self.entries[start];
        let head_block = head.inode_ref >> 16;
        let mut size = writer_offset + std::mem::size_of::<DirHeader>();
        let mut count = 0usize;
        for e in &self.entries[start..] {
            if count >= MAX_DIR_ENTRIES {
                break;
            }
            if (e.inode_ref >> 16) != head_block {
                break;
            }
            let diff = e.inode_number as i64 - head.inode_number as i64;
            if diff > 32767 || diff < -32767 {
                break;
            }
            let entry_size = 8 + e.name.len();
            if count > 0 && size + entry_size > META_BLOCK_SIZE {
                break;
            }
            size += entry_size;
            count += 1;
        }
        count.max(1)
    }

    #[tracing::instrument(skip_all)]
    pub fn finish(
        mut self,
        writer: &mut MetadataWriter,
        export: Option<&mut ExportTable>,
    ) -> Result<WrittenDirectory, SquashfsError> {
        let start = writer.position();
        if self.entries.is_empty() {
            return Ok(WrittenDirectory {
                start,
                size: 3,
                index: Vec::new(),
            });
        }

        // sort for deterministic, name-ordered output like mksquashfs
        self.entries.sort_by(|a, b| a.name.cmp(&b.name));

        let mut size = 0u32;
        let mut index = Vec::new();
        let mut export = export;
        let mut i = 0;
        while i < self.entries.len() {
            let header_pos = writer.position();
            let run_len = self.run_len(i, header_pos.byte_offset as usize);
            let head = &self.entries[i];

            index.push(DirectoryIndex {
                index: size,
                start: header_pos.block_start as u32,
                name_size: head.name.len() as u32 - 1,
                name: head.name.clone(),
            });

            let header = DirHeader {
                count: run_len as u32 - 1,
                start_block: (head.inode_ref >> 16) as u32,
                inode_number: head.inode_number,
            };
            let bytes = header.to_bytes().map_err(SquashfsError::Deku)?;
            writer.write_bytes(&bytes)?;
            size += bytes.len() as u32;

            for e in &self.entries[i..i + run_len] {
                let ent = DirEntry {
                    offset: (e.inode_ref & 0xffff) as u16,
                    inode_offset: (e.inode_number as i64 - head.inode_number as i64) as i16,
                    inode_type: e.inode_type,
                    name_size: e.name.len() as u16 - 1,
                    name: e.name.clone(),
                };
                let bytes = ent.to_bytes().map_err(SquashfsError::Deku)?;
                writer.write_bytes(&bytes)?;
                size += bytes.len() as u32;
                if let Some(export) = export.as_deref_mut() {
                    export.set(e.inode_number, e.inode_ref);
                }
            }
            i += run_len;
        }

        Ok(WrittenDirectory {
            start,
            size: size + 3,
            index,
        })
    }
}

impl Default for DirectoryWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::StoreCodec;
    use std::sync::Arc;

    #[test]
    fn single_entry_round_trip() {
        let mut dw = DirectoryWriter::new();
        dw.add_entry(b"a.txt".to_vec(), (1u64) << 16 | 4, 2, 2);
        let codec: Arc<dyn crate::traits::Codec> = Arc::new(StoreCodec);
        let mut mw = MetadataWriter::new(codec);
        let written = dw.finish(&mut mw, None).unwrap();
        assert_eq!(written.index.len(), 1);
        assert!(written.size > 3);
    }

    #[test]
    fn breaks_run_on_large_inode_delta() {
        let mut dw = DirectoryWriter::new();
        dw.add_entry(b"a".to_vec(), 0, 1, 2);
        dw.add_entry(b"b".to_vec(), 0, 1 + 40000, 2);
        assert_eq!(dw.run_len(0, 0), 1);
    }

    #[test]
    fn breaks_run_on_differing_meta_block() {
        let mut dw = DirectoryWriter::new();
        dw.add_entry(b"a".to_vec(), 0u64 << 16, 1, 2);
        dw.add_entry(b"b".to_vec(), 1u64 << 16, 2, 2);
        assert_eq!(dw.run_len(0, 0), 1);
    }

    #[test]
    fn breaks_run_on_live_writer_offset_near_block_boundary() {
        let mut dw = DirectoryWriter::new();
        // Each entry costs 8 + name.len() bytes; with a writer offset
        // already most of the way through an 8 KiB block, a second entry
        // must not be folded into this run if it would cross the boundary.
        let near_full_offset = META_BLOCK_SIZE - std::mem::size_of::<DirHeader>() - 8 - 1 - 4;
        dw.add_entry(b"a".to_vec(), 0, 1, 2);
        dw.add_entry(b"b".to_vec(), 0, 2, 2);
        assert_eq!(dw.run_len(0, near_full_offset), 1);
        assert_eq!(dw.run_len(0, 0), 2);
    }
}
