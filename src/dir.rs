//! On-disk directory listing records: header, entry, and index.
//!
//! A directory's listing is a sequence of runs, each a [`DirHeader`]
//! followed by `count + 1` [`DirEntry`] records. Entries within a run
//! share the header's `start_block` (the inode table meta-block they
//! live in) and store only the delta from the header's `inode_number`.

use deku::prelude::*;

#[derive(Debug, DekuRead, DekuWrite, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct DirHeader {
    /// entries in this run, minus one
    pub count: u32,
    /// inode table meta-block all entries in this run share
    pub start_block: u32,
    pub inode_number: u32,
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct DirEntry {
    /// byte offset into `start_block`
    pub offset: u16,
    /// signed delta from the owning header's `inode_number`
    pub inode_offset: i16,
    pub inode_type: u16,
    /// name length minus one
    pub name_size: u16,
    #[deku(count = "*name_size as usize + 1")]
    pub name: Vec<u8>,
}

impl DirEntry {
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// An entry in an extended directory's index, used to binary-search
/// large directories without reading every preceding header.
#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct DirectoryIndex {
    /// byte offset into the directory listing this index entry covers
    pub index: u32,
    /// directory-table meta-block start for the header at `index`
    pub start: u32,
    /// name length minus one, of the first entry in that header's run
    pub name_size: u32,
    #[deku(count = "*name_size as usize + 1")]
    pub name: Vec<u8>,
}
