//! Lazy directory listing reader: a small state machine that yields `.`
//! and `..` before the real entries, matching `sqfs_dir_reader_read`'s
//! `DIR_STATE_*` progression in the original (`None` → `Opened` → `Dot` →
//! `DotDot` → `Entries`). Real entries are only decoded on demand, one
//! [`DirHeader`] run at a time.

use crate::dir::{DirEntry, DirHeader};
use crate::error::SquashfsError;
use crate::metadata::{MetadataReader, MetadataRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirState {
    Opened,
    Dot,
    DotDot,
    Entries,
    Done,
}

/// One yielded directory entry, with the synthetic `.`/`..` pair folded
/// into the same shape the real on-disk entries produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryOut {
    pub name: String,
    /// packed `MetadataRef` of the inode this entry names
    pub inode_ref: u64,
    pub inode_number: u32,
    pub inode_type: u16,
}

pub struct DirectoryReader<'a> {
    meta: MetadataReader<'a>,
    state: DirState,
    size_remaining: i64,
    entries_left: u32,
    header: Option<DirHeader>,
    this_inode_num: u32,
    this_ref: u64,
    parent_inode_num: u32,
    parent_ref: u64,
    emit_dot_entries: bool,
}

impl<'a> DirectoryReader<'a> {
    /// `listing_start`/`size` describe where in the directory table this
    /// directory's listing lives (taken from the owning inode's
    /// `block_index`/`block_offset`/`file_size`, per spec §3's inode
    /// layout). `size <= 3` means an empty directory (just the 3-byte
    /// trailing count mksquashfs always leaves) with no runs to read.
    pub fn open(
        mut meta: MetadataReader<'a>,
        listing_start: MetadataRef,
        size: u32,
        this_inode_num: u32,
        this_ref: u64,
        parent_inode_num: u32,
        parent_ref: u64,
        emit_dot_entries: bool,
    ) -> Result<Self, SquashfsError> {
        if size as i64 > 3 {
            meta.seek(listing_start)?;
        }
        Ok(Self {
            meta,
            state: if emit_dot_entries {
                DirState::Opened
            } else {
                DirState::Entries
            },
            size_remaining: size as i64 - 3,
            entries_left: 0,
            header: None,
            this_inode_num,
            this_ref,
            parent_inode_num,
            parent_ref,
            emit_dot_entries,
        })
    }

    fn next_header(&mut self) -> Result<Option<DirHeader>, SquashfsError> {
        if self.size_remaining <= 0 {
            return Ok(None);
        }
        let mut buf = [0u8; 12];
        self.meta.read(&mut buf)?;
        let (_, hdr) = DirHeader::from_bytes((&buf, 0)).map_err(SquashfsError::Deku)?;
        self.size_remaining -= 12;
        Ok(Some(hdr))
    }

    fn next_entry(&mut self) -> Result<DirEntry, SquashfsError> {
        // name_size is the 4th u16 field; read the fixed prefix first so
        // we know how many trailing name bytes to pull.
        let mut prefix = [0u8; 8];
        self.meta.read(&mut prefix)?;
        let name_size = u16::from_le_bytes([prefix[6], prefix[7]]) as usize + 1;
        let mut name = vec![0u8; name_size];
        self.meta.read(&mut name)?;
        self.size_remaining -= (8 + name_size) as i64;
        let mut full = prefix.to_vec();
        full.extend(name);
        let (_, ent) = DirEntry::from_bytes((&full, 0)).map_err(SquashfsError::Deku)?;
        Ok(ent)
    }
}

impl<'a> Iterator for DirectoryReader<'a> {
    type Item = Result<DirEntryOut, SquashfsError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.state {
            DirState::Opened => {
                self.state = DirState::Dot;
                Some(Ok(DirEntryOut {
                    name: ".".to_string(),
                    inode_ref: self.this_ref,
                    inode_number: self.this_inode_num,
                    inode_type: 1,
                }))
            }
            DirState::Dot => {
                self.state = DirState::DotDot;
                Some(Ok(DirEntryOut {
                    name: "..".to_string(),
                    inode_ref: self.parent_ref,
                    inode_number: self.parent_inode_num,
                    inode_type: 1,
                }))
            }
            DirState::DotDot => {
                self.state = DirState::Entries;
                self.next()
            }
            DirState::Entries => {
                if self.entries_left == 0 {
                    match self.next_header() {
                        Ok(Some(hdr)) => {
                            self.entries_left = hdr.count + 1;
                            self.header = Some(hdr);
                        }
                        Ok(None) => {
                            self.state = DirState::Done;
                            return None;
                        }
                        Err(e) => {
                            self.state = DirState::Done;
                            return Some(Err(e));
                        }
                    }
                }
                let hdr = self.header.expect("header set above");
                match self.next_entry() {
                    Ok(ent) => {
                        self.entries_left -= 1;
                        let inode_number = (hdr.inode_number as i64 + ent.inode_offset as i64) as u32;
                        let inode_ref = ((hdr.start_block as u64) << 16) | ent.offset as u64;
                        Some(Ok(DirEntryOut {
                            name: ent.name(),
                            inode_ref,
                            inode_number,
                            inode_type: ent.inode_type,
                        }))
                    }
                    Err(e) => {
                        self.state = DirState::Done;
                        Some(Err(e))
                    }
                }
            }
            DirState::Done => None,
        }
    }
}

/// Small bounded cache mapping an inode number to the packed [`MetadataRef`]
/// it was last seen at, so a caller jumping straight to a subdirectory (e.g.
/// `find_by_path`) doesn't have to re-walk from the root to resolve `..`.
/// Capacity defaults to 8; insertion evicts the least-recently-used entry.
pub struct DirCache {
    capacity: usize,
    entries: Vec<(u32, u64)>,
}

impl DirCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Vec::new(),
        }
    }

    pub fn get(&mut self, inode_number: u32) -> Option<u64> {
        let pos = self.entries.iter().position(|(n, _)| *n == inode_number)?;
        let (_, r) = self.entries.remove(pos);
        self.entries.push((inode_number, r));
        Some(r)
    }

    pub fn insert(&mut self, inode_number: u32, inode_ref: u64) {
        if let Some(pos) = self.entries.iter().position(|(n, _)| *n == inode_number) {
            self.entries.remove(pos);
        } else if self.entries.len() >= self.capacity {
            self.entries.remove(0);
        }
        self.entries.push((inode_number, inode_ref));
    }
}

impl Default for DirCache {
    fn default() -> Self {
        Self::new(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::StoreCodec;
    use crate::dir::DirEntry as RawEntry;
    use crate::metadata::MetadataWriter;
    use std::sync::Arc;

    #[test]
    fn dot_and_dotdot_come_first() {
        let codec: Arc<dyn crate::traits::Codec> = Arc::new(StoreCodec);
        let area = MetadataWriter::new(codec.clone()).finish().unwrap();
        let meta = MetadataReader::new(codec, &area);
        let reader = DirectoryReader::open(meta, MetadataRef::new(0, 0), 3, 5, 5 << 16, 1, 1 << 16, true)
            .unwrap();
        let names: Vec<_> = reader.map(|e| e.unwrap().name).collect();
        assert_eq!(names, vec![".", ".."]);
    }

    #[test]
    fn reads_one_run() {
        let codec: Arc<dyn crate::traits::Codec> = Arc::new(StoreCodec);
        let mut w = MetadataWriter::new(codec.clone());
        let start = w.position();
        let hdr = DirHeader {
            count: 0,
            start_block: 0,
            inode_number: 10,
        };
        w.write_bytes(&hdr.to_bytes().unwrap()).unwrap();
        let ent = RawEntry {
            offset: 0,
            inode_offset: 0,
            inode_type: 2,
            name_size: 3,
            name: b"file".to_vec(),
        };
        w.write_bytes(&ent.to_bytes().unwrap()).unwrap();
        let area = w.finish().unwrap();
        let meta = MetadataReader::new(codec, &area);
        let size = 12 + 8 + 4 + 3;
        let reader =
            DirectoryReader::open(meta, start, size, 9, 9 << 16, 1, 1 << 16, false).unwrap();
        let entries: Vec<_> = reader.map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "file");
        assert_eq!(entries[0].inode_number, 10);
    }

    #[test]
    fn dir_cache_evicts_least_recently_used() {
        let mut cache = DirCache::new(2);
        cache.insert(1, 100);
        cache.insert(2, 200);
        assert_eq!(cache.get(1), Some(100));
        cache.insert(3, 300);
        assert_eq!(cache.get(2), None);
        assert_eq!(cache.get(1), Some(100));
        assert_eq!(cache.get(3), Some(300));
    }
}
