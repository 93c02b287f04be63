//! The 96-byte fixed super-block at the start of every image.

use deku::prelude::*;

use crate::compressor::Compressor;

/// First four bytes of a little-endian image.
pub const MAGIC: [u8; 4] = *b"hsqs";

/// Sentinel for "this table does not exist in the image".
pub const NOT_SET: u64 = 0xffff_ffff_ffff_ffff;

/// 128 KiB, the default and most common data block size.
pub const DEFAULT_BLOCK_SIZE: u32 = 0x20000;
/// log2 of [`DEFAULT_BLOCK_SIZE`].
pub const DEFAULT_BLOCK_LOG: u16 = 0x11;
/// 4 KiB, padding granularity mksquashfs-compatible images are trimmed to.
pub const DEFAULT_PAD_LEN: u32 = 0x1000;
/// 1 MiB, largest legal block size.
pub const MAX_BLOCK_SIZE: u32 = 1024 * 1024;
/// 4 KiB, smallest legal block size.
pub const MIN_BLOCK_SIZE: u32 = 4096;

/// Bitwise-OR'd into [`SuperBlock::flags`].
#[repr(u16)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SuperBlockFlags {
    InodesStoredUncompressed = 0b0000_0000_0000_0001,
    DataBlockStoredUncompressed = 0b0000_0000_0000_0010,
    Unused = 0b0000_0000_0000_0100,
    FragmentsStoredUncompressed = 0b0000_0000_0000_1000,
    FragmentsAreNotUsed = 0b0000_0000_0001_0000,
    FragmentsAreAlwaysGenerated = 0b0000_0000_0010_0000,
    DataHasBeenDeduplicated = 0b0000_0000_0100_0000,
    NFSExportTableExists = 0b0000_0000_1000_0000,
    XattrsAreStoredUncompressed = 0b0000_0001_0000_0000,
    NoXattrsInArchive = 0b0000_0010_0000_0000,
    CompressorOptionsArePresent = 0b0000_0100_0000_0000,
}

/// Contains the location of every other table and enough metadata to
/// validate and decode them. The layout is fixed at 96 bytes and every
/// multi-byte field is little-endian.
#[derive(Debug, Copy, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct SuperBlock {
    #[deku(assert_eq = "MAGIC")]
    pub magic: [u8; 4],
    pub inode_count: u32,
    pub mod_time: u32,
    pub block_size: u32,
    pub frag_count: u32,
    pub compressor: Compressor,
    pub block_log: u16,
    pub flags: u16,
    pub id_count: u16,
    #[deku(assert_eq = "4u16")]
    pub version_major: u16,
    #[deku(assert_eq = "0u16")]
    pub version_minor: u16,
    pub root_inode: u64,
    pub bytes_used: u64,
    pub id_table: u64,
    pub xattr_table: u64,
    pub inode_table: u64,
    pub dir_table: u64,
    pub frag_table: u64,
    pub export_table: u64,
}

impl SuperBlock {
    pub const SIZE: usize = 96;

    pub fn new(compressor: Compressor) -> Self {
        Self {
            magic: MAGIC,
            inode_count: 0,
            mod_time: 0,
            block_size: DEFAULT_BLOCK_SIZE,
            frag_count: 0,
            compressor,
            block_log: DEFAULT_BLOCK_LOG,
            flags: 0,
            id_count: 0,
            version_major: 4,
            version_minor: 0,
            root_inode: 0,
            bytes_used: 0,
            id_table: NOT_SET,
            xattr_table: NOT_SET,
            inode_table: NOT_SET,
            dir_table: NOT_SET,
            frag_table: NOT_SET,
            export_table: NOT_SET,
        }
    }

    fn flag(&self, f: SuperBlockFlags) -> bool {
        self.flags & (f as u16) != 0
    }

    fn set_flag(&mut self, f: SuperBlockFlags, on: bool) {
        if on {
            self.flags |= f as u16;
        } else {
            self.flags &= !(f as u16);
        }
    }

    pub fn inodes_uncompressed(&self) -> bool {
        self.flag(SuperBlockFlags::InodesStoredUncompressed)
    }

    pub fn data_block_stored_uncompressed(&self) -> bool {
        self.flag(SuperBlockFlags::DataBlockStoredUncompressed)
    }

    pub fn fragments_stored_uncompressed(&self) -> bool {
        self.flag(SuperBlockFlags::FragmentsStoredUncompressed)
    }

    pub fn fragments_are_not_used(&self) -> bool {
        self.flag(SuperBlockFlags::FragmentsAreNotUsed)
    }

    pub fn fragments_are_always_generated(&self) -> bool {
        self.flag(SuperBlockFlags::FragmentsAreAlwaysGenerated)
    }

    pub fn duplicate_data_removed(&self) -> bool {
        self.flag(SuperBlockFlags::DataHasBeenDeduplicated)
    }

    pub fn nfs_export_table_exists(&self) -> bool {
        self.flag(SuperBlockFlags::NFSExportTableExists)
    }

    pub fn xattrs_are_stored_uncompressed(&self) -> bool {
        self.flag(SuperBlockFlags::XattrsAreStoredUncompressed)
    }

    pub fn no_xattrs_in_archive(&self) -> bool {
        self.flag(SuperBlockFlags::NoXattrsInArchive)
    }

    pub fn compressor_options_are_present(&self) -> bool {
        self.flag(SuperBlockFlags::CompressorOptionsArePresent)
    }

    pub fn set_duplicate_data_removed(&mut self, on: bool) {
        self.set_flag(SuperBlockFlags::DataHasBeenDeduplicated, on);
    }

    pub fn set_nfs_export_table_exists(&mut self, on: bool) {
        self.set_flag(SuperBlockFlags::NFSExportTableExists, on);
    }

    pub fn set_no_xattrs_in_archive(&mut self, on: bool) {
        self.set_flag(SuperBlockFlags::NoXattrsInArchive, on);
    }

    pub fn set_compressor_options_are_present(&mut self, on: bool) {
        self.set_flag(SuperBlockFlags::CompressorOptionsArePresent, on);
    }

    pub fn set_inodes_uncompressed(&mut self, on: bool) {
        self.set_flag(SuperBlockFlags::InodesStoredUncompressed, on);
    }

    pub fn set_data_block_stored_uncompressed(&mut self, on: bool) {
        self.set_flag(SuperBlockFlags::DataBlockStoredUncompressed, on);
    }

    pub fn set_fragments_stored_uncompressed(&mut self, on: bool) {
        self.set_flag(SuperBlockFlags::FragmentsStoredUncompressed, on);
    }

    pub fn set_fragments_are_not_used(&mut self, on: bool) {
        self.set_flag(SuperBlockFlags::FragmentsAreNotUsed, on);
    }

    pub fn set_fragments_are_always_generated(&mut self, on: bool) {
        self.set_flag(SuperBlockFlags::FragmentsAreAlwaysGenerated, on);
    }

    pub fn set_xattrs_are_stored_uncompressed(&mut self, on: bool) {
        self.set_flag(SuperBlockFlags::XattrsAreStoredUncompressed, on);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let sb = SuperBlock::new(Compressor::Xz);
        let bytes = sb.to_bytes().unwrap();
        assert_eq!(bytes.len(), SuperBlock::SIZE);
        let (_, back) = SuperBlock::from_bytes((&bytes, 0)).unwrap();
        assert_eq!(sb, back);
    }

    #[test]
    fn flags_round_trip() {
        let mut sb = SuperBlock::new(Compressor::Gzip);
        assert!(!sb.duplicate_data_removed());
        sb.set_duplicate_data_removed(true);
        assert!(sb.duplicate_data_removed());
        sb.set_duplicate_data_removed(false);
        assert!(!sb.duplicate_data_removed());
    }
}
