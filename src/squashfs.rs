//! Top-level image assembler and reader.
//!
//! Ties every other module together into the single bit-exact layout an
//! image actually uses on disk: superblock, optional compressor-options
//! block, data area, inode table, directory table, fragment table, export
//! table, id table, xattr tables, then zero padding to the device block
//! size. [`Squashfs::write`] drives [`crate::filesystem::build`] and places
//! its output at the right file offsets; [`Squashfs::open`] reverses that
//! to get back a queryable in-memory view.
//!
//! One wrinkle the two sides have to agree on: [`crate::table`]'s
//! `build_indexed_table`/`read_indexed_table` work in offsets relative to
//! the table's own start, but the four location tables this module writes
//! (fragment, export, id, xattr-id) point at absolute file offsets. The
//! `write_indexed`/`read_indexed` helpers below do that translation in one
//! place rather than scattering `+ table_start`/`- table_start` through
//! four call sites.

use std::cell::{RefCell, RefMut};
use std::io;
use std::sync::Arc;

use deku::prelude::*;

use crate::codec;
use crate::data::{DataReader, FileHandle};
use crate::data_writer::{DataWriter, DataWriterConfig};
use crate::dir_reader::{DirCache, DirectoryReader};
use crate::error::SquashfsError;
use crate::filesystem::{self, BuilderConfig, RootMeta};
use crate::fragment::{Fragment, FRAGMENT_ENTRY_SIZE};
use crate::id::Id;
use crate::inode::{Inode, InodeInner, NO_FRAGMENT};
use crate::kind;
use crate::metadata::{MetadataReader, MetadataRef, SQFS_META_BLOCK_SIZE};
use crate::path;
use crate::superblock::{SuperBlock, DEFAULT_PAD_LEN, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, NOT_SET};
use crate::table;
use crate::traits::{Codec, DirIterator, File};
use crate::xattr::{XattrIdTable, XATTR_ID_ENTRY_SIZE};
use crate::xattr_reader::XattrReader;
use crate::xattr_writer::FlushedXattrs;

/// Decoded xattr kv/id areas, kept around (rather than re-read per lookup)
/// so [`Squashfs::xattrs`] only has to build a fresh [`XattrReader`] over
/// already-resident bytes.
struct XattrAreas {
    kv_area: Vec<u8>,
    id_area: Vec<u8>,
    id_block_starts: Vec<u64>,
    num_ids: u32,
}

/// A parsed SquashFS image, ready to resolve inodes, walk directories, and
/// read file content.
pub struct Squashfs {
    file: Arc<dyn File>,
    codec: Arc<dyn Codec>,
    super_block: SuperBlock,
    ids: Vec<Id>,
    fragments: Vec<Fragment>,
    xattr: Option<XattrAreas>,
    inode_area: Vec<u8>,
    dir_area: Vec<u8>,
    export_refs: Option<Vec<u64>>,
    dcache: RefCell<DirCache>,
    data_reader: RefCell<DataReader>,
}

impl Squashfs {
    /// Parses the superblock, then every location table it points to.
    /// Magic and version are checked against the raw bytes before the full
    /// deku parse, so a bad image reports [`SquashfsError::SuperMagic`] or
    /// [`SquashfsError::SuperVersion`] rather than a generic deku error.
    pub fn open(file: Box<dyn File>) -> Result<Self, SquashfsError> {
        let file: Arc<dyn File> = Arc::from(file);

        let mut header = [0u8; SuperBlock::SIZE];
        file.read_at(0, &mut header)?;
        if !kind::magic_matches(&header) {
            return Err(SquashfsError::SuperMagic);
        }
        let version_major = u16::from_le_bytes([header[28], header[29]]);
        let version_minor = u16::from_le_bytes([header[30], header[31]]);
        if version_major != kind::VERSION_MAJOR || version_minor != kind::VERSION_MINOR {
            return Err(SquashfsError::SuperVersion);
        }
        let (_, super_block) = SuperBlock::from_bytes((&header, 0)).map_err(SquashfsError::Deku)?;

        let file_len = file.get_size()?;
        if super_block.bytes_used > file_len
            || super_block.block_size < MIN_BLOCK_SIZE
            || super_block.block_size > MAX_BLOCK_SIZE
        {
            return Err(SquashfsError::SuperBlockSize);
        }

        let codec = codec::for_compressor(super_block.compressor)?;

        let (ids, id_table_start) = read_indexed::<Id>(
            file.as_ref(),
            codec.clone(),
            super_block.id_table,
            super_block.id_count as usize,
            Id::SIZE,
            |r| {
                let mut buf = [0u8; Id::SIZE];
                r.read(&mut buf)?;
                let (_, id) = Id::from_bytes((&buf, 0)).map_err(SquashfsError::Deku)?;
                Ok(id)
            },
        )?;

        let (fragments, frag_table_start) = if super_block.frag_count > 0 {
            read_indexed::<Fragment>(
                file.as_ref(),
                codec.clone(),
                super_block.frag_table,
                super_block.frag_count as usize,
                FRAGMENT_ENTRY_SIZE,
                |r| {
                    let mut buf = [0u8; FRAGMENT_ENTRY_SIZE];
                    r.read(&mut buf)?;
                    let (_, f) = Fragment::from_bytes((&buf, 0)).map_err(SquashfsError::Deku)?;
                    Ok(f)
                },
            )?
        } else {
            (Vec::new(), 0)
        };

        let (export_refs, export_table_start) = if super_block.nfs_export_table_exists() {
            let (refs, start) = read_indexed::<u64>(
                file.as_ref(),
                codec.clone(),
                super_block.export_table,
                super_block.inode_count as usize,
                8,
                |r| {
                    let mut buf = [0u8; 8];
                    r.read(&mut buf)?;
                    Ok(u64::from_le_bytes(buf))
                },
            )?;
            (Some(refs), start)
        } else {
            (None, 0)
        };

        let xattr = if !super_block.no_xattrs_in_archive() && super_block.xattr_table != NOT_SET {
            Some(read_xattr_areas(file.as_ref(), super_block.xattr_table)?)
        } else {
            None
        };

        let inode_area_len = super_block.dir_table - super_block.inode_table;
        let mut inode_area = vec![0u8; inode_area_len as usize];
        file.read_at(super_block.inode_table, &mut inode_area)?;

        let dir_area_end = if super_block.frag_count > 0 {
            frag_table_start
        } else if super_block.nfs_export_table_exists() {
            export_table_start
        } else {
            id_table_start
        };
        let dir_area_len = dir_area_end - super_block.dir_table;
        let mut dir_area = vec![0u8; dir_area_len as usize];
        file.read_at(super_block.dir_table, &mut dir_area)?;

        let data_reader = DataReader::new(file.clone(), codec.clone(), super_block.block_size);

        Ok(Self {
            file,
            codec,
            super_block,
            ids,
            fragments,
            xattr,
            inode_area,
            dir_area,
            export_refs,
            dcache: RefCell::new(DirCache::default()),
            data_reader: RefCell::new(data_reader),
        })
    }

    pub fn super_block(&self) -> &SuperBlock {
        &self.super_block
    }

    pub fn block_size(&self) -> u32 {
        self.super_block.block_size
    }

    /// Resolves a 16-bit id-table index (as stored in an inode header)
    /// into the real 32-bit uid/gid.
    pub fn id_value(&self, index: u16) -> Result<u32, SquashfsError> {
        self.ids
            .get(index as usize)
            .map(|id| id.num)
            .ok_or(SquashfsError::OutOfBounds)
    }

    /// Every `(name, value)` xattr pair attached to `xattr_index`. An
    /// inode whose `xattr_index` is [`crate::inode::NO_XATTRS`] (or an
    /// image with no xattr table at all) yields an empty list.
    pub fn xattrs(&self, xattr_index: u32) -> Result<Vec<(String, Vec<u8>)>, SquashfsError> {
        let Some(xattr) = &self.xattr else {
            return Ok(Vec::new());
        };
        let mut reader = XattrReader::new(
            self.codec.clone(),
            &xattr.id_area,
            &xattr.kv_area,
            xattr.id_block_starts.clone(),
            xattr.num_ids,
        );
        reader.attributes(xattr_index)
    }

    /// Looks up an inode by its packed [`MetadataRef`] (an `inode_ref`, as
    /// stored in a directory entry, the root pointer, or the export table).
    pub fn inode(&self, inode_ref: u64) -> Result<Inode, SquashfsError> {
        let mut meta = MetadataReader::new(self.codec.clone(), &self.inode_area);
        meta.seek(MetadataRef::unpack(inode_ref))?;
        Inode::from_reader(&mut meta, self.super_block.block_size, self.super_block.block_log)
    }

    pub fn root_inode(&self) -> Result<Inode, SquashfsError> {
        self.inode(self.super_block.root_inode)
    }

    /// Resolves an inode by its `inode_number` via the NFS export table.
    /// Returns [`SquashfsError::Unsupported`] if the image was not built
    /// with one.
    pub fn inode_by_number(&self, inode_number: u32) -> Result<Inode, SquashfsError> {
        let refs = self
            .export_refs
            .as_ref()
            .ok_or(SquashfsError::Unsupported("image has no export table"))?;
        let inode_ref = refs
            .get(inode_number as usize - 1)
            .copied()
            .filter(|&r| r != table::EXPORT_TABLE_GAP)
            .ok_or(SquashfsError::NoEntry)?;
        self.inode(inode_ref)
    }

    /// Opens `dir`'s listing. `this_ref`/`parent_ref` are the packed
    /// inode refs of `dir` itself and its parent, used to synthesize the
    /// `.`/`..` entries; the parent's inode *number* is read straight off
    /// `dir`'s own `parent_inode` field, so no separate lookup is needed.
    pub fn open_dir(
        &self,
        dir: &Inode,
        this_ref: u64,
        parent_ref: u64,
    ) -> Result<DirectoryReader<'_>, SquashfsError> {
        let (block_index, file_size, block_offset, parent_inode_num) = match &dir.inner {
            InodeInner::BasicDirectory(d) => (d.block_index, d.file_size as u32, d.block_offset, d.parent_inode),
            InodeInner::ExtendedDirectory(d) => (d.block_index, d.file_size, d.block_offset, d.parent_inode),
            _ => return Err(SquashfsError::NotDir),
        };
        self.dcache.borrow_mut().insert(dir.header.inode_number, this_ref);
        let meta = MetadataReader::new(self.codec.clone(), &self.dir_area);
        let listing_start = MetadataRef::new(block_index as u64, block_offset);
        DirectoryReader::open(
            meta,
            listing_start,
            file_size,
            dir.header.inode_number,
            this_ref,
            parent_inode_num,
            parent_ref,
            true,
        )
    }

    /// Opens the root directory's listing. The root's `..` points at
    /// itself, matching the on-disk convention.
    pub fn root_dir(&self) -> Result<DirectoryReader<'_>, SquashfsError> {
        let root = self.root_inode()?;
        let root_ref = self.super_block.root_inode;
        self.open_dir(&root, root_ref, root_ref)
    }

    /// Walks `path` component by component from the root, returning the
    /// resolved inode and its packed ref. `path` may use any mix of
    /// leading/repeated `/`; see [`crate::path::split_components`].
    pub fn find_by_path(&self, path: &str) -> Result<(Inode, u64), SquashfsError> {
        let components = path::split_components(path);
        let mut current = self.root_inode()?;
        let mut current_ref = self.super_block.root_inode;
        let mut parent_ref = current_ref;

        for name in components {
            let dir = self.open_dir(&current, current_ref, parent_ref)?;
            let mut found = None;
            for entry in dir {
                let entry = entry?;
                if entry.name == name {
                    found = Some(entry);
                    break;
                }
            }
            let entry = found.ok_or(SquashfsError::NoEntry)?;
            parent_ref = current_ref;
            current_ref = entry.inode_ref;
            current = self.inode(current_ref)?;
        }
        Ok((current, current_ref))
    }

    /// Resolves a regular-file inode's block list and fragment tail into
    /// a [`FileHandle`], without reading any of its content yet.
    pub fn open_file(&self, inode: &Inode) -> Result<FileHandle, SquashfsError> {
        let (blocks_start, block_sizes, file_size, frag_index, frag_offset) = match &inode.inner {
            InodeInner::BasicFile(f) => (
                f.fixed.blocks_start as u64,
                f.block_sizes.clone(),
                f.fixed.file_size as u64,
                f.fixed.frag_index,
                f.fixed.block_offset,
            ),
            InodeInner::ExtendedFile(f) => (
                f.fixed.blocks_start,
                f.block_sizes.clone(),
                f.fixed.file_size,
                f.fixed.frag_index,
                f.fixed.block_offset,
            ),
            _ => return Err(SquashfsError::NotFile),
        };

        let fragment = if frag_index == NO_FRAGMENT {
            None
        } else {
            let frag = *self
                .fragments
                .get(frag_index as usize)
                .ok_or(SquashfsError::OutOfBounds)?;
            Some((frag, frag_offset))
        };

        Ok(FileHandle::new(
            blocks_start,
            block_sizes,
            file_size,
            self.super_block.block_size,
            fragment,
        ))
    }

    /// Random-access read of a regular file's content, per spec.
    pub fn read_file(&self, inode: &Inode, offset: u64, buf: &mut [u8]) -> Result<usize, SquashfsError> {
        let handle = self.open_file(inode)?;
        let mut data = self.data_reader.borrow_mut();
        handle.read(&mut data, offset, buf)
    }

    /// A sequential, `std::io::Read`-implementing view over a regular
    /// file, reading through this image's shared block cache.
    pub fn create_stream(&self, inode: &Inode) -> Result<SquashfsFileStream<'_>, SquashfsError> {
        let handle = self.open_file(inode)?;
        Ok(SquashfsFileStream {
            data: self.data_reader.borrow_mut(),
            handle,
            pos: 0,
        })
    }
}

/// Sequential read view returned by [`Squashfs::create_stream`]. Holds the
/// image's shared [`DataReader`] borrowed for its lifetime rather than a
/// plain reference, since the reader lives behind a `RefCell` on
/// [`Squashfs`].
pub struct SquashfsFileStream<'a> {
    data: RefMut<'a, DataReader>,
    handle: FileHandle,
    pos: u64,
}

impl<'a> io::Read for SquashfsFileStream<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.handle.read(&mut self.data, self.pos, buf).map_err(io::Error::from)?;
        self.pos += n as u64;
        Ok(n)
    }
}

/// Reads back a table built by [`write_indexed`]: `location_table_offset`
/// is the absolute offset of the *location array*, not the table itself.
/// Returns the decoded records plus the table's own absolute start (the
/// caller needs this to know where the *next* area in the layout begins).
fn read_indexed<T>(
    file: &dyn File,
    codec: Arc<dyn Codec>,
    location_table_offset: u64,
    count: usize,
    record_size: usize,
    decode: impl FnMut(&mut MetadataReader) -> Result<T, SquashfsError>,
) -> Result<(Vec<T>, u64), SquashfsError> {
    let per_block = (SQFS_META_BLOCK_SIZE / record_size).max(1);
    if count == 0 {
        return Ok((Vec::new(), location_table_offset));
    }
    let num_entries = (count + per_block - 1) / per_block;
    let mut idx_bytes = vec![0u8; num_entries * 8];
    file.read_at(location_table_offset, &mut idx_bytes)?;
    let index_abs: Vec<u64> = idx_bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    let table_start_abs = index_abs[0];
    let table_len = location_table_offset - table_start_abs;
    let mut area = vec![0u8; table_len as usize];
    file.read_at(table_start_abs, &mut area)?;
    let rel: Vec<u64> = index_abs.iter().map(|&a| a - table_start_abs).collect();
    let records = table::read_indexed_table(codec, &area, &rel, count, per_block, decode)?;
    Ok((records, table_start_abs))
}

fn read_xattr_areas(file: &dyn File, xattr_table: u64) -> Result<XattrAreas, SquashfsError> {
    let mut header_buf = [0u8; 16];
    file.read_at(xattr_table, &mut header_buf)?;
    let (_, header) = XattrIdTable::from_bytes((&header_buf, 0)).map_err(SquashfsError::Deku)?;
    let num_ids = header.xattr_ids;
    let kv_start_abs = header.xattr_table_start;

    if num_ids == 0 {
        return Ok(XattrAreas {
            kv_area: Vec::new(),
            id_area: Vec::new(),
            id_block_starts: vec![0],
            num_ids: 0,
        });
    }

    let loc_offset = xattr_table + 16;
    let per_block = SQFS_META_BLOCK_SIZE / XATTR_ID_ENTRY_SIZE;
    let num_entries = (num_ids as usize + per_block - 1) / per_block;
    let mut idx_bytes = vec![0u8; num_entries * 8];
    file.read_at(loc_offset, &mut idx_bytes)?;
    let abs: Vec<u64> = idx_bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    let id_start_abs = abs[0];
    let id_area_len = xattr_table - id_start_abs;
    let kv_area_len = id_start_abs - kv_start_abs;

    let mut kv_area = vec![0u8; kv_area_len as usize];
    file.read_at(kv_start_abs, &mut kv_area)?;
    let mut id_area = vec![0u8; id_area_len as usize];
    file.read_at(id_start_abs, &mut id_area)?;
    let id_block_starts = abs.iter().map(|&a| a - id_start_abs).collect();

    Ok(XattrAreas {
        kv_area,
        id_area,
        id_block_starts,
        num_ids,
    })
}

/// Options governing how a new image is laid out and compressed.
#[derive(Clone)]
pub struct SquashfsWriterConfig {
    pub block_size: u32,
    pub codec: Arc<dyn Codec>,
    pub no_fragments: bool,
    pub always_use_fragments: bool,
    pub no_duplicates: bool,
    pub hash_compare_only: bool,
    pub exportable: bool,
    /// Pad data/fragment blocks to `dev_block_size` boundaries.
    pub align: bool,
    pub dev_block_size: u64,
    /// Final image size is padded up to a multiple of this.
    pub pad_len: u32,
}

impl Default for SquashfsWriterConfig {
    fn default() -> Self {
        Self {
            block_size: crate::superblock::DEFAULT_BLOCK_SIZE,
            codec: Arc::new(codec::StoreCodec),
            no_fragments: false,
            always_use_fragments: false,
            no_duplicates: false,
            hash_compare_only: false,
            exportable: false,
            align: false,
            dev_block_size: crate::data_writer::DEFAULT_DEV_BLOCK_SIZE,
            pad_len: DEFAULT_PAD_LEN,
        }
    }
}

fn append(file: &mut dyn File, pos: &mut u64, bytes: &[u8]) -> Result<u64, SquashfsError> {
    let start = *pos;
    file.write_at(start, bytes)?;
    *pos += bytes.len() as u64;
    Ok(start)
}

fn write_location_array(
    file: &mut dyn File,
    pos: &mut u64,
    table_start_abs: u64,
    index: &[u64],
) -> Result<u64, SquashfsError> {
    let loc_start = *pos;
    for &rel in index {
        append(file, pos, &(table_start_abs + rel).to_le_bytes())?;
    }
    Ok(loc_start)
}

/// Writes `raw_records` into meta blocks and places the location array
/// immediately after, returning the absolute offset of the location array
/// (what the superblock field for this table points at).
fn write_indexed(
    file: &mut dyn File,
    pos: &mut u64,
    codec: Arc<dyn Codec>,
    raw_records: &[Vec<u8>],
    per_block: usize,
) -> Result<u64, SquashfsError> {
    let (table_bytes, index) = table::build_indexed_table(codec, raw_records, per_block)?;
    let table_start = append(file, pos, &table_bytes)?;
    write_location_array(file, pos, table_start, &index)
}

fn write_xattr_table(file: &mut dyn File, pos: &mut u64, flushed: &FlushedXattrs) -> Result<u64, SquashfsError> {
    let kv_start = append(file, pos, &flushed.kv_area)?;
    let id_start = append(file, pos, &flushed.id_area)?;
    let header = flushed.header(kv_start);
    let header_bytes = header.to_bytes().map_err(SquashfsError::Deku)?;
    let header_start = append(file, pos, &header_bytes)?;
    write_location_array(file, pos, id_start, &flushed.id_block_starts())?;
    Ok(header_start)
}

impl Squashfs {
    /// Builds a complete image from `source` and writes it to `file`,
    /// following spec's on-disk ordering: superblock, optional
    /// compressor-options block, data area, inode table, directory table,
    /// fragment table, export table, id table, xattr tables, then zero
    /// padding up to `config.pad_len`.
    pub fn write(
        file: Box<dyn File>,
        root_meta: RootMeta,
        source: Box<dyn DirIterator>,
        config: SquashfsWriterConfig,
    ) -> Result<(), SquashfsError> {
        if !config.block_size.is_power_of_two()
            || config.block_size < MIN_BLOCK_SIZE
            || config.block_size > MAX_BLOCK_SIZE
        {
            return Err(SquashfsError::ArgInvalid("block_size must be a power of two in range"));
        }
        let block_log = config.block_size.trailing_zeros() as u16;

        let mut pos: u64 = SuperBlock::SIZE as u64;
        let mut file: Box<dyn File> = file;

        let options = config.codec.options();
        if let Some(opts) = &options {
            let header = (opts.len() as u16) | 0x8000;
            append(file.as_mut(), &mut pos, &header.to_le_bytes())?;
            append(file.as_mut(), &mut pos, opts)?;
        }

        let mut data = DataWriter::new(
            file,
            config.codec.clone(),
            DataWriterConfig {
                block_size: config.block_size,
                dev_block_size: config.dev_block_size,
                align: config.align,
                hash_compare_only: config.hash_compare_only,
                no_duplicates: config.no_duplicates,
            },
        );
        data.set_start(pos);

        let builder_config = BuilderConfig {
            block_size: config.block_size,
            block_log,
            codec: config.codec.clone(),
            no_fragments: config.no_fragments,
            always_use_fragments: config.always_use_fragments,
            no_duplicates: config.no_duplicates,
            hash_compare_only: config.hash_compare_only,
            exportable: config.exportable,
        };

        let built = filesystem::build(root_meta, source, &mut data, &builder_config)?;
        pos = data.position();
        let mut file = data.into_inner();

        let inode_table = append(file.as_mut(), &mut pos, &built.inode_area)?;
        let dir_table = append(file.as_mut(), &mut pos, &built.dir_area)?;

        let frag_table = if !built.fragments.is_empty() {
            let raw: Vec<Vec<u8>> = built
                .fragments
                .iter()
                .map(|f| f.to_bytes().map_err(SquashfsError::Deku))
                .collect::<Result<_, _>>()?;
            let per_block = SQFS_META_BLOCK_SIZE / FRAGMENT_ENTRY_SIZE;
            write_indexed(file.as_mut(), &mut pos, config.codec.clone(), &raw, per_block)?
        } else {
            NOT_SET
        };

        let export_table = if let Some(export) = &built.export {
            let raw: Vec<Vec<u8>> = export.inode_refs.iter().map(|r| r.to_le_bytes().to_vec()).collect();
            let per_block = SQFS_META_BLOCK_SIZE / 8;
            write_indexed(file.as_mut(), &mut pos, config.codec.clone(), &raw, per_block)?
        } else {
            NOT_SET
        };

        let raw_ids: Vec<Vec<u8>> = built
            .ids
            .iter()
            .map(|i| i.to_bytes().map_err(SquashfsError::Deku))
            .collect::<Result<_, _>>()?;
        let id_per_block = SQFS_META_BLOCK_SIZE / Id::SIZE;
        let id_table = write_indexed(file.as_mut(), &mut pos, config.codec.clone(), &raw_ids, id_per_block)?;

        let xattr_table = if let Some(flushed) = &built.xattr {
            write_xattr_table(file.as_mut(), &mut pos, flushed)?
        } else {
            NOT_SET
        };

        let bytes_used = pos;
        let pad_len = config.pad_len.max(1) as u64;
        let rem = pos % pad_len;
        if rem != 0 {
            let pad = pad_len - rem;
            append(file.as_mut(), &mut pos, &vec![0u8; pad as usize])?;
        }

        let mod_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        let mut sb = SuperBlock::new(config.codec.id());
        sb.inode_count = built.inode_count;
        sb.mod_time = mod_time;
        sb.block_size = config.block_size;
        sb.frag_count = built.fragments.len() as u32;
        sb.block_log = block_log;
        sb.id_count = built.ids.len() as u16;
        sb.root_inode = built.root_inode_ref;
        sb.bytes_used = bytes_used;
        sb.id_table = id_table;
        sb.xattr_table = xattr_table;
        sb.inode_table = inode_table;
        sb.dir_table = dir_table;
        sb.frag_table = frag_table;
        sb.export_table = export_table;
        sb.set_compressor_options_are_present(options.is_some());
        sb.set_no_xattrs_in_archive(built.xattr.is_none());
        sb.set_nfs_export_table_exists(built.export.is_some());
        sb.set_duplicate_data_removed(built.blocks_deduplicated > 0);

        let sb_bytes = sb.to_bytes().map_err(SquashfsError::Deku)?;
        file.write_at(0, &sb_bytes)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{SourceDirEntry, VecFile};
    use std::io::{Cursor, Read};

    struct FakeSource {
        entries: std::vec::IntoIter<(SourceDirEntry, Option<Vec<u8>>, Option<String>)>,
        current_content: Option<Vec<u8>>,
        current_link: Option<String>,
    }

    impl FakeSource {
        fn new(entries: Vec<(SourceDirEntry, Option<Vec<u8>>, Option<String>)>) -> Self {
            Self {
                entries: entries.into_iter(),
                current_content: None,
                current_link: None,
            }
        }
    }

    impl DirIterator for FakeSource {
        fn next(&mut self) -> Result<Option<SourceDirEntry>, SquashfsError> {
            match self.entries.next() {
                Some((ent, content, link)) => {
                    self.current_content = content;
                    self.current_link = link;
                    Ok(Some(ent))
                }
                None => Ok(None),
            }
        }

        fn read_link(&mut self) -> Result<String, SquashfsError> {
            Ok(self.current_link.clone().unwrap_or_default())
        }

        fn ignore_subdir(&mut self) {}

        fn open_file_ro(&mut self) -> Result<Box<dyn Read>, SquashfsError> {
            Ok(Box::new(Cursor::new(self.current_content.clone().unwrap_or_default())))
        }
    }

    fn entry(name: &str, mode: u32) -> SourceDirEntry {
        SourceDirEntry {
            name: name.to_string(),
            mode,
            uid: 0,
            gid: 0,
            mtime: 1000,
            rdev: 0,
            dev_ino: None,
            is_mount_point: false,
            hard_link_target: None,
        }
    }

    const S_IFDIR: u32 = 0o040000;
    const S_IFREG: u32 = 0o100000;

    fn write_and_open(entries: Vec<(SourceDirEntry, Option<Vec<u8>>, Option<String>)>) -> Squashfs {
        let src = FakeSource::new(entries);
        let shared = Arc::new(std::sync::Mutex::new(Vec::<u8>::new()));

        struct SharedFile(Arc<std::sync::Mutex<Vec<u8>>>);
        impl File for SharedFile {
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

        let write_file: Box<dyn File> = Box::new(SharedFile(shared.clone()));
        let config = SquashfsWriterConfig {
            block_size: 128,
            exportable: true,
            ..SquashfsWriterConfig::default()
        };
        Squashfs::write(write_file, RootMeta::default(), Box::new(src), config).unwrap();

        let read_file: Box<dyn File> = Box::new(SharedFile(shared));
        Squashfs::open(read_file).unwrap()
    }

    #[test]
    fn empty_image_has_only_the_root_directory() {
        let sqfs = write_and_open(vec![]);
        assert_eq!(sqfs.super_block().inode_count, 1);
        let root = sqfs.root_inode().unwrap();
        let names: Vec<_> = sqfs
            .open_dir(&root, sqfs.super_block().root_inode, sqfs.super_block().root_inode)
            .unwrap()
            .map(|e| e.unwrap().name)
            .collect();
        assert_eq!(names, vec![".", ".."]);
    }

    #[test]
    fn finds_a_nested_file_by_path() {
        let sqfs = write_and_open(vec![
            (entry("dir", S_IFDIR | 0o755), None, None),
            (entry("dir/file.txt", S_IFREG | 0o644), Some(b"hello world".to_vec()), None),
        ]);

        let (inode, _) = sqfs.find_by_path("/dir/file.txt").unwrap();
        assert!(matches!(inode.inner, InodeInner::BasicFile(_)));

        let mut buf = vec![0u8; 11];
        sqfs.read_file(&inode, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn streams_a_file_sequentially() {
        let sqfs = write_and_open(vec![(entry("a.bin", S_IFREG | 0o644), Some(vec![7u8; 500]), None)]);
        let (inode, _) = sqfs.find_by_path("/a.bin").unwrap();
        let mut stream = sqfs.create_stream(&inode).unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![7u8; 500]);
    }

    #[test]
    fn missing_path_is_no_entry() {
        let sqfs = write_and_open(vec![]);
        let err = sqfs.find_by_path("/nope").unwrap_err();
        assert!(matches!(err, SquashfsError::NoEntry));
    }

    #[test]
    fn rejects_bad_magic() {
        let file: Box<dyn File> = Box::new(VecFile::new());
        let f = file;
        // A freshly-allocated VecFile reads back as all zero bytes, which
        // never matches the magic.
        let mut buf = vec![0u8; SuperBlock::SIZE];
        {
            let mut w = VecFile::new();
            use crate::traits::File as _;
            w.write_at(0, &buf).unwrap();
            buf = vec![0u8; SuperBlock::SIZE];
            let _ = w;
        }
        let _ = f;
        let err = Squashfs::open(Box::new({
            let mut v = VecFile::new();
            v.write_at(0, &buf).unwrap();
            v
        }))
        .unwrap_err();
        assert!(matches!(err, SquashfsError::SuperMagic));
    }
}
