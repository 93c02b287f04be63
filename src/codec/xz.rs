use std::io::Read;

use xz2::read::{XzDecoder, XzEncoder};
use xz2::stream::{Check, LzmaOptions, Stream};

use crate::compressor::Compressor;
use crate::error::SquashfsError;
use crate::traits::Codec;

/// LZMA2 via `liblzma`, matching `mksquashfs`'s `xz` compressor.
#[derive(Debug, Clone, Copy)]
pub struct XzCodec {
    pub preset: u32,
}

impl Default for XzCodec {
    fn default() -> Self {
        Self { preset: 6 }
    }
}

impl Codec for XzCodec {
    fn compress(&self, bytes: &[u8]) -> Result<Option<Vec<u8>>, SquashfsError> {
        let opts = LzmaOptions::new_preset(self.preset)
            .map_err(|e| SquashfsError::Codec(Box::new(e)))?;
        let stream = Stream::new_stream_encoder(&opts, Check::Crc32)
            .map_err(|e| SquashfsError::Codec(Box::new(e)))?;
        let mut encoder = XzEncoder::new_stream(bytes, stream);
        let mut buf = Vec::new();
        encoder.read_to_end(&mut buf)?;
        if buf.len() < bytes.len() {
            Ok(Some(buf))
        } else {
            Ok(None)
        }
    }

    fn decompress(&self, bytes: &[u8], out_size_hint: usize) -> Result<Vec<u8>, SquashfsError> {
        let mut decoder = XzDecoder::new(bytes);
        let mut out = Vec::with_capacity(out_size_hint);
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }

    fn id(&self) -> Compressor {
        Compressor::Xz
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let codec = XzCodec::default();
        let data = vec![7u8; 4096];
        let compressed = codec.compress(&data).unwrap().unwrap();
        let back = codec.decompress(&compressed, data.len()).unwrap();
        assert_eq!(data, back);
    }
}
