//! On-disk compressor id and compressor-options records.
//!
//! The actual (de)compression work lives behind the [`crate::traits::Codec`]
//! trait, implemented for each backend in [`crate::codec`]. This module
//! only describes the bytes the superblock and compressor-options block
//! carry, matching the on-disk layout bit for bit.

use deku::prelude::*;

#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, DekuWrite, Default)]
#[deku(endian = "little", type = "u16")]
#[rustfmt::skip]
pub enum Compressor {
    None = 0,
    Gzip = 1,
    Lzma = 2,
    Lzo  = 3,
    #[default]
    Xz   = 4,
    Lz4  = 5,
    Zstd = 6,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "little", ctx = "compressor: Compressor", id = "compressor")]
pub enum CompressionOptions {
    #[deku(id = "Compressor::Gzip")]
    Gzip(Gzip),
    #[deku(id = "Compressor::Lzo")]
    Lzo(Lzo),
    #[deku(id = "Compressor::Xz")]
    Xz(Xz),
    #[deku(id = "Compressor::Lz4")]
    Lz4(Lz4),
    #[deku(id = "Compressor::Zstd")]
    Zstd(Zstd),
    #[deku(id = "Compressor::Lzma")]
    Lzma,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "little")]
pub struct Gzip {
    pub compression_level: u32,
    pub window_size: u16,
    pub strategies: u16,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "little")]
pub struct Lzo {
    pub algorithm: u32,
    pub compression_level: u32,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "little")]
pub struct Xz {
    pub dictionary_size: u32,
    pub filters: u32,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "little")]
pub struct Lz4 {
    pub version: u32,
    pub flags: u32,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "little")]
pub struct Zstd {
    pub compression_level: u32,
}
