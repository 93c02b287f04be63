use crate::compressor::Compressor;
use crate::error::SquashfsError;
use crate::traits::Codec;

#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    pub level: i32,
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self { level: 3 }
    }
}

impl Codec for ZstdCodec {
    fn compress(&self, bytes: &[u8]) -> Result<Option<Vec<u8>>, SquashfsError> {
        let mut encoder =
            zstd::bulk::Compressor::new(self.level).map_err(|e| SquashfsError::Codec(Box::new(e)))?;
        let buffer_len = zstd_safe::compress_bound(bytes.len());
        let mut buf = Vec::with_capacity(buffer_len);
        encoder
            .compress_to_buffer(bytes, &mut buf)
            .map_err(|e| SquashfsError::Codec(Box::new(e)))?;
        if buf.len() < bytes.len() {
            Ok(Some(buf))
        } else {
            Ok(None)
        }
    }

    fn decompress(&self, bytes: &[u8], out_size_hint: usize) -> Result<Vec<u8>, SquashfsError> {
        let mut decoder =
            zstd::bulk::Decompressor::new().map_err(|e| SquashfsError::Codec(Box::new(e)))?;
        let mut out = Vec::with_capacity(out_size_hint.max(bytes.len() * 4).max(4096));
        decoder
            .decompress_to_buffer(bytes, &mut out)
            .map_err(|e| SquashfsError::Codec(Box::new(e)))?;
        Ok(out)
    }

    fn id(&self) -> Compressor {
        Compressor::Zstd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let codec = ZstdCodec::default();
        let data = vec![9u8; 8192];
        let compressed = codec.compress(&data).unwrap().unwrap();
        let back = codec.decompress(&compressed, data.len()).unwrap();
        assert_eq!(data, back);
    }
}
