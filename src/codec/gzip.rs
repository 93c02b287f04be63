use std::io::Read;

use flate2::read::ZlibEncoder;
use flate2::Compression;

use crate::compressor::Compressor;
use crate::error::SquashfsError;
use crate::traits::Codec;

/// zlib/deflate, matching `mksquashfs`'s default `gzip` compressor.
#[derive(Debug, Clone, Copy)]
pub struct GzipCodec {
    pub level: u32,
}

impl Default for GzipCodec {
    fn default() -> Self {
        Self { level: 9 }
    }
}

impl Codec for GzipCodec {
    fn compress(&self, bytes: &[u8]) -> Result<Option<Vec<u8>>, SquashfsError> {
        let mut encoder = ZlibEncoder::new(bytes, Compression::new(self.level));
        let mut buf = Vec::new();
        encoder.read_to_end(&mut buf)?;
        if buf.len() < bytes.len() {
            Ok(Some(buf))
        } else {
            Ok(None)
        }
    }

    fn decompress(&self, bytes: &[u8], out_size_hint: usize) -> Result<Vec<u8>, SquashfsError> {
        let mut decoder = flate2::read::ZlibDecoder::new(bytes);
        let mut out = Vec::with_capacity(out_size_hint);
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }

    fn id(&self) -> Compressor {
        Compressor::Gzip
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let codec = GzipCodec::default();
        let data = b"hello hello hello hello hello hello".to_vec();
        let compressed = codec.compress(&data).unwrap().unwrap();
        let back = codec.decompress(&compressed, data.len()).unwrap();
        assert_eq!(data, back);
    }
}
