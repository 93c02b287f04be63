//! Fragment table: one entry per fragment block, packing tail-end data
//! from many small files together.

use deku::prelude::*;

use crate::inode::DataSize;

pub const FRAGMENT_ENTRY_SIZE: usize = 16;

/// `size`'s high bit mirrors the compressed-data-block convention: clear
/// means compressed, set means stored raw.
const FRAGMENT_UNCOMPRESSED: u32 = 1 << 24;

#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct Fragment {
    pub start: u64,
    pub size: u32,
    pub unused: u32,
}

impl Fragment {
    /// Builds a fragment-table entry from the block writer's on-disk size
    /// record for the block the fragment was packed into; shares the same
    /// bit-24-is-uncompressed convention as a regular data block.
    pub fn new(start: u64, size: DataSize) -> Self {
        Self {
            start,
            size: size.0,
            unused: 0,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.size & FRAGMENT_UNCOMPRESSED == 0
    }

    pub fn on_disk_len(&self) -> u32 {
        self.size & !FRAGMENT_UNCOMPRESSED
    }
}
