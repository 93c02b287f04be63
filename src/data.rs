//! Data reader: turns a file's block list + optional fragment tail into a
//! byte stream, with a one-block and one-fragment-block cache so reading
//! sequentially through many small files sharing a fragment block doesn't
//! re-decompress it per file.
//!
//! Grounded on `original_source/lib/sqfs/data_reader.c`'s `get_block`/
//! `precache_data_block`/`precache_fragment_block`.

use std::io;
use std::sync::Arc;

use crate::error::SquashfsError;
use crate::fragment::Fragment;
use crate::inode::DataSize;
use crate::traits::{Codec, File};

const SPARSE_HOLE: u32 = 0;

pub struct DataReader {
    file: Arc<dyn File>,
    codec: Arc<dyn Codec>,
    block_size: u32,
    data_block_cache: Option<(u64, Vec<u8>)>,
    frag_block_cache: Option<(u64, Vec<u8>)>,
}

impl DataReader {
    pub fn new(file: Arc<dyn File>, codec: Arc<dyn Codec>, block_size: u32) -> Self {
        Self {
            file,
            codec,
            block_size,
            data_block_cache: None,
            frag_block_cache: None,
        }
    }

    fn get_block(&self, location: u64, size: DataSize) -> Result<Vec<u8>, SquashfsError> {
        if size.len() == SPARSE_HOLE {
            return Ok(vec![0u8; self.block_size as usize]);
        }
        let mut raw = vec![0u8; size.len() as usize];
        self.file.read_at(location, &mut raw)?;
        if size.is_compressed() {
            self.codec.decompress(&raw, self.block_size as usize)
        } else {
            Ok(raw)
        }
    }

    /// Reads one full data block, reusing the last decompressed block if
    /// `location` matches (the common case: reading a file's blocks in
    /// order touches each location exactly once, but random access or
    /// re-reading the same block benefits from the cache).
    pub fn read_data_block(&mut self, location: u64, size: DataSize) -> Result<&[u8], SquashfsError> {
        if self.data_block_cache.as_ref().map(|(l, _)| *l) != Some(location) {
            let block = self.get_block(location, size)?;
            self.data_block_cache = Some((location, block));
        }
        Ok(&self.data_block_cache.as_ref().unwrap().1)
    }

    /// Reads one fragment block in full; callers slice out their file's
    /// own `block_offset..block_offset+len` range.
    pub fn read_fragment_block(&mut self, frag: &Fragment) -> Result<&[u8], SquashfsError> {
        if self.frag_block_cache.as_ref().map(|(l, _)| *l) != Some(frag.start) {
            let size = DataSize::new(frag.on_disk_len(), frag.is_compressed());
            let block = self.get_block(frag.start, size)?;
            self.frag_block_cache = Some((frag.start, block));
        }
        Ok(&self.frag_block_cache.as_ref().unwrap().1)
    }
}

/// A regular file's block list plus its optional fragment tail, resolved
/// once from an inode so random-access reads don't have to re-derive where
/// each block lives on every call.
#[derive(Debug, Clone)]
pub struct FileHandle {
    block_sizes: Vec<DataSize>,
    block_offsets: Vec<u64>,
    file_size: u64,
    block_size: u32,
    /// `(fragment entry, byte offset of this file's tail within the
    /// fragment's packed block)`.
    fragment: Option<(Fragment, u32)>,
}

impl FileHandle {
    pub fn new(
        blocks_start: u64,
        block_sizes: Vec<DataSize>,
        file_size: u64,
        block_size: u32,
        fragment: Option<(Fragment, u32)>,
    ) -> Self {
        let mut block_offsets = Vec::with_capacity(block_sizes.len());
        let mut at = blocks_start;
        for size in &block_sizes {
            block_offsets.push(at);
            at += size.len() as u64;
        }
        Self {
            block_sizes,
            block_offsets,
            file_size,
            block_size,
            fragment,
        }
    }

    pub fn len(&self) -> u64 {
        self.file_size
    }

    pub fn is_empty(&self) -> bool {
        self.file_size == 0
    }

    /// Random-access read: fills `buf` starting at `offset`, crossing block
    /// (and, at the tail, fragment) boundaries transparently. Returns the
    /// number of bytes actually filled, which is less than `buf.len()` only
    /// when `offset + buf.len()` runs past the end of the file.
    pub fn read(&self, data: &mut DataReader, offset: u64, buf: &mut [u8]) -> Result<usize, SquashfsError> {
        if offset >= self.file_size {
            return Ok(0);
        }
        let want = buf.len().min((self.file_size - offset) as usize);
        let tail_file_offset = self.block_sizes.len() as u64 * self.block_size as u64;

        let mut filled = 0;
        while filled < want {
            let pos = offset + filled as u64;
            let block_index = (pos / self.block_size as u64) as usize;

            if block_index < self.block_sizes.len() {
                let in_block = (pos % self.block_size as u64) as usize;
                let block = data.read_data_block(self.block_offsets[block_index], self.block_sizes[block_index])?;
                let take = (block.len() - in_block).min(want - filled);
                buf[filled..filled + take].copy_from_slice(&block[in_block..in_block + take]);
                filled += take;
            } else if let Some((frag, frag_offset)) = &self.fragment {
                let within_tail = (pos - tail_file_offset) as usize;
                let start = *frag_offset as usize + within_tail;
                let block = data.read_fragment_block(frag)?;
                let take = (block.len() - start).min(want - filled);
                buf[filled..filled + take].copy_from_slice(&block[start..start + take]);
                filled += take;
            } else {
                return Err(SquashfsError::Corrupted("file position past its last block with no fragment tail"));
            }
        }
        Ok(filled)
    }
}

/// Sequential view over a [`FileHandle`], reading through a borrowed
/// [`DataReader`] with single-EOF semantics: once the fragment tail (or
/// last block) is drained, every further `read` call returns `Ok(0)`.
pub struct FileStream<'a> {
    data: &'a mut DataReader,
    handle: FileHandle,
    pos: u64,
}

impl<'a> FileStream<'a> {
    pub fn new(data: &'a mut DataReader, handle: FileHandle) -> Self {
        Self { data, handle, pos: 0 }
    }
}

impl<'a> io::Read for FileStream<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self
            .handle
            .read(self.data, self.pos, buf)
            .map_err(io::Error::from)?;
        self.pos += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::StoreCodec;
    use std::sync::Mutex;

    struct MemFile(Mutex<Vec<u8>>);
    impl File for MemFile {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SquashfsError> {
            let data = self.0.lock().unwrap();
            let start = offset as usize;
            buf.copy_from_slice(&data[start..start + buf.len()]);
            Ok(buf.len())
        }
        fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize, SquashfsError> {
            let mut data = self.0.lock().unwrap();
            let end = offset as usize + buf.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[offset as usize..end].copy_from_slice(buf);
            Ok(buf.len())
        }
        fn get_size(&self) -> Result<u64, SquashfsError> {
            Ok(self.0.lock().unwrap().len() as u64)
        }
        fn truncate(&mut self, size: u64) -> Result<(), SquashfsError> {
            self.0.lock().unwrap().resize(size as usize, 0);
            Ok(())
        }
    }

    #[test]
    fn reads_stored_block() {
        let data = b"0123456789".to_vec();
        let file: Arc<dyn File> = Arc::new(MemFile(Mutex::new(data.clone())));
        let codec: Arc<dyn Codec> = Arc::new(StoreCodec);
        let mut r = DataReader::new(file, codec, 10);
        let size = DataSize::new(10, false);
        let block = r.read_data_block(0, size).unwrap();
        assert_eq!(block, data);
    }

    #[test]
    fn sparse_block_is_zero_filled() {
        let file: Arc<dyn File> = Arc::new(MemFile(Mutex::new(vec![0u8; 16])));
        let codec: Arc<dyn Codec> = Arc::new(StoreCodec);
        let mut r = DataReader::new(file, codec, 16);
        let size = DataSize::new(0, true);
        let block = r.read_data_block(0, size).unwrap();
        assert_eq!(block.len(), 16);
        assert!(block.iter().all(|&b| b == 0));
    }
}
