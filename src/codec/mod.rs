//! Default [`crate::traits::Codec`] implementations, feature-gated.
//!
//! None of this is part of the hard core: a consumer that only needs the
//! abstract contract can disable default features and supply their own.

#[cfg(feature = "gzip")]
mod gzip;
#[cfg(feature = "xz")]
mod xz;
#[cfg(feature = "zstd")]
mod zstd_codec;

#[cfg(feature = "gzip")]
pub use gzip::GzipCodec;
#[cfg(feature = "xz")]
pub use xz::XzCodec;
#[cfg(feature = "zstd")]
pub use zstd_codec::ZstdCodec;

use crate::compressor::Compressor;
use crate::error::SquashfsError;
use crate::traits::Codec;

/// Looks up the default [`Codec`] implementation for a superblock's
/// declared `compressor` id, among whichever codec features are compiled
/// in. Used by [`crate::squashfs::Squashfs::open`] to decompress an image
/// it didn't write itself.
pub fn for_compressor(id: Compressor) -> Result<std::sync::Arc<dyn Codec>, SquashfsError> {
    use std::sync::Arc;
    match id {
        Compressor::None => Ok(Arc::new(StoreCodec)),
        #[cfg(feature = "gzip")]
        Compressor::Gzip => Ok(Arc::new(GzipCodec::default())),
        #[cfg(feature = "xz")]
        Compressor::Xz => Ok(Arc::new(XzCodec::default())),
        #[cfg(feature = "zstd")]
        Compressor::Zstd => Ok(Arc::new(ZstdCodec::default())),
        other => Err(SquashfsError::Unsupported(
            match other {
                Compressor::Lzo => "lzo compressor",
                Compressor::Lzma => "lzma compressor",
                Compressor::Lz4 => "lz4 compressor",
                #[cfg(not(feature = "gzip"))]
                Compressor::Gzip => "gzip compressor (feature disabled)",
                #[cfg(not(feature = "xz"))]
                Compressor::Xz => "xz compressor (feature disabled)",
                #[cfg(not(feature = "zstd"))]
                Compressor::Zstd => "zstd compressor (feature disabled)",
                _ => "compressor",
            },
        )),
    }
}

/// Passthrough codec: `compress` always declines (stores raw), `decompress`
/// is the identity. Always available, used by tests and as a safe default
/// when no compression feature is enabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct StoreCodec;

impl Codec for StoreCodec {
    fn compress(&self, _bytes: &[u8]) -> Result<Option<Vec<u8>>, SquashfsError> {
        Ok(None)
    }

    fn decompress(&self, bytes: &[u8], _out_size_hint: usize) -> Result<Vec<u8>, SquashfsError> {
        Ok(bytes.to_vec())
    }

    fn id(&self) -> Compressor {
        Compressor::None
    }
}
