//! Abstract collaborators: the backing store and the compressor.
//!
//! The core never assumes it is backed by a `std::fs::File` or a particular
//! compression library. It only needs two small contracts, each modeled
//! after the corresponding C vtable in squashfs-tools-ng: `sqfs_file_t` for
//! the backing store and the `cmp->do_block` pattern used throughout
//! `meta_writer.c`/`meta_reader.c`/`data_reader.c` for compression.

use crate::error::SquashfsError;

/// A random-access backing store.
///
/// Mirrors `sqfs_file_t` (`include/sqfs/io.h`): absolute-offset reads and
/// writes, a size query, and truncation. No implicit seek position is
/// carried between calls.
pub trait File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SquashfsError>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize, SquashfsError>;
    fn get_size(&self) -> Result<u64, SquashfsError>;
    fn truncate(&mut self, size: u64) -> Result<(), SquashfsError>;

    /// Human-readable name used only in diagnostics; not part of any
    /// on-disk format.
    fn get_filename(&self) -> String {
        String::from("<anonymous>")
    }
}

impl File for std::fs::File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SquashfsError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            Ok(FileExt::read_at(self, buf, offset)?)
        }
        #[cfg(not(unix))]
        {
            use std::io::{Read, Seek, SeekFrom};
            let mut this = self.try_clone()?;
            this.seek(SeekFrom::Start(offset))?;
            Ok(this.read(buf)?)
        }
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize, SquashfsError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            FileExt::write_at(self, buf, offset)?;
            Ok(buf.len())
        }
        #[cfg(not(unix))]
        {
            use std::io::{Seek, SeekFrom, Write};
            self.seek(SeekFrom::Start(offset))?;
            self.write_all(buf)?;
            Ok(buf.len())
        }
    }

    fn get_size(&self) -> Result<u64, SquashfsError> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, size: u64) -> Result<(), SquashfsError> {
        Ok(self.set_len(size)?)
    }
}

/// A block (de)compressor.
///
/// `do_block` covers both directions, mirroring `cmp->do_block` in the
/// original: on compress it returns `Ok(Some(bytes))` with the compressed
/// form, or `Ok(None)` when compressing would not shrink the block (the
/// caller then stores it raw, same as `meta_writer.c`'s fallback to the
/// uncompressed header form). On decompress it always returns
/// `Ok(Some(bytes))`.
pub trait Codec: Send + Sync {
    fn compress(&self, bytes: &[u8]) -> Result<Option<Vec<u8>>, SquashfsError>;
    fn decompress(&self, bytes: &[u8], out_size_hint: usize) -> Result<Vec<u8>, SquashfsError>;

    /// Compressor id as stored in the superblock's `compression_id` field.
    fn id(&self) -> crate::compressor::Compressor;

    /// Optional compressor-specific options blob stored right after the
    /// superblock when `COMPRESSOR_OPTIONS` is set.
    fn options(&self) -> Option<Vec<u8>> {
        None
    }
}

/// One entry produced while walking a source tree to build an image.
///
/// Mirrors `sqfs_dir_entry_t`: enough to place the object in the image
/// without yet having opened it (a regular file's content is only read
/// via [`DirIterator::open_file_ro`] when the tree builder actually needs
/// its bytes).
#[derive(Debug, Clone)]
pub struct SourceDirEntry {
    /// path relative to the scan root, using `/` separators regardless of
    /// host platform
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
    /// `st_rdev` for block/character device entries; ignored otherwise.
    pub rdev: u32,
    /// `(dev, inode)` on platforms that expose one; used to detect hard
    /// links. `None` on platforms without a stable inode number.
    pub dev_ino: Option<(u64, u64)>,
    pub is_mount_point: bool,
    /// Set by [`crate::tree_iterator::HardLinkFilter`] when this entry's
    /// `(dev, inode)` was already seen: names the first occurrence's path
    /// instead of this being read as its own file.
    pub hard_link_target: Option<String>,
}

/// An in-memory backing store, for building an image without a real file
/// on disk (used by [`crate::squashfs`]'s in-memory builders and by
/// tests).
#[derive(Debug, Default)]
pub struct VecFile(std::sync::Mutex<Vec<u8>>);

impl VecFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl From<Vec<u8>> for VecFile {
    fn from(bytes: Vec<u8>) -> Self {
        Self(std::sync::Mutex::new(bytes))
    }
}

impl File for VecFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SquashfsError> {
        let data = self.0.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(SquashfsError::OutOfBounds);
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(buf.len())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize, SquashfsError> {
        let mut data = self.0.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn get_size(&self) -> Result<u64, SquashfsError> {
        Ok(self.0.lock().unwrap().len() as u64)
    }

    fn truncate(&mut self, size: u64) -> Result<(), SquashfsError> {
        self.0.lock().unwrap().resize(size as usize, 0);
        Ok(())
    }

    fn get_filename(&self) -> String {
        "<memory>".to_string()
    }
}

/// A source-side directory walker, mirroring `sqfs_dir_iterator_t`.
///
/// Implementations recurse depth-first; [`ignore_subdir`](Self::ignore_subdir)
/// lets a filtering wrapper (type-mask exclusion, `--one-file-system`) skip
/// an already-yielded directory's children without consuming them.
pub trait DirIterator {
    /// Yields the next entry, or `Ok(None)` once the walk is exhausted.
    fn next(&mut self) -> Result<Option<SourceDirEntry>, SquashfsError>;

    /// Reads a symlink's target. Only valid right after `next` yielded a
    /// symlink entry.
    fn read_link(&mut self) -> Result<String, SquashfsError>;

    /// Skip the children of the directory `next` just yielded.
    fn ignore_subdir(&mut self);

    /// Opens the regular file `next` just yielded for reading its content.
    fn open_file_ro(&mut self) -> Result<Box<dyn std::io::Read>, SquashfsError>;

    /// Reads the xattrs attached to the entry `next` just yielded.
    fn read_xattr(&mut self) -> Result<Vec<(String, Vec<u8>)>, SquashfsError> {
        Ok(Vec::new())
    }
}
