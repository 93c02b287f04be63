//! Builds a SquashFS image's inode/directory/fragment/id/xattr areas from a
//! source tree walker.
//!
//! Not present in the teacher crate (backhand builds its writer tree from an
//! in-memory node graph the caller assembles by hand); grounded on
//! `original_source/lib/sqfshelper/serialize_fstree.c`, the driver that
//! walks a `fstree_t` in the same depth-first order an `sqfs_dir_iterator_t`
//! yields and writes out inodes/directory listings/the fragment table.
//!
//! [`DirIterator`] is a one-shot pull-based stream (see `tree_iterator.rs`),
//! so the walk happens in two stages over one drain of it:
//!
//! 1. [`materialize`] drains the iterator exactly once, immediately
//!    streaming every regular file's content into the [`DataWriter`] (and,
//!    for a fragment-eligible tail, the [`FragmentWriter`]) as it is
//!    encountered. The result is a flat, order-preserving `Vec<RawEntry>` —
//!    cheap metadata plus, for files, the already-written block locations.
//! 2. `build` counts hard-link references over that materialized list (a
//!    hard link's `hard_link_target` always refers to an entry materialized
//!    earlier), then walks it a second time — this time only in memory, not
//!    touching the iterator again — to serialize directories and inodes
//!    with final, correct `link_count`s. A stack of open [`Frame`]s mirrors
//!    the directories currently being assembled; a frame is finished (its
//!    listing and inode serialized, and an entry added to its parent) as
//!    soon as the flat list's next path is no longer inside it.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use crate::data_writer::DataWriter;
use crate::dir_writer::DirectoryWriter;
use crate::error::SquashfsError;
use crate::fragment::Fragment;
use crate::id::{Id, IdTable};
use crate::inode::{
    BasicDeviceSpecialFile, BasicDirectory, BasicFile, BasicFileFixed, BasicIpc, BasicSymlink,
    DataSize, ExtendedDeviceSpecialFile, ExtendedDirectory, ExtendedFile, ExtendedFileFixed,
    ExtendedIpc, ExtendedSymlink, Inode, InodeHeader, InodeInner, NO_FRAGMENT, NO_XATTRS,
};
use crate::metadata::MetadataWriter;
use crate::path::validate_entry_name;
use crate::table::ExportTable;
use crate::traits::{Codec, DirIterator};
use crate::xattr_writer::{FlushedXattrs, XattrWriter};

const S_IFMT: u32 = 0o170000;
const S_IFSOCK: u32 = 0o140000;
const S_IFLNK: u32 = 0o120000;
const S_IFREG: u32 = 0o100000;
const S_IFBLK: u32 = 0o060000;
const S_IFDIR: u32 = 0o040000;
const S_IFCHR: u32 = 0o020000;

/// Metadata for the root directory, which a [`DirIterator`] never yields
/// itself (it only yields the root's descendants).
#[derive(Debug, Clone)]
pub struct RootMeta {
    pub permissions: u16,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
}

impl Default for RootMeta {
    fn default() -> Self {
        Self {
            permissions: 0o755,
            uid: 0,
            gid: 0,
            mtime: 0,
        }
    }
}

#[derive(Clone)]
pub struct BuilderConfig {
    pub block_size: u32,
    pub block_log: u16,
    pub codec: Arc<dyn Codec>,
    /// Never pack a short final block into a shared fragment; store it as
    /// its own regular block instead, matching mksquashfs's `-no-fragments`.
    pub no_fragments: bool,
    /// Route even an exact-multiple-of-`block_size` file's last block
    /// through the fragment area, matching `-always-use-fragments`.
    pub always_use_fragments: bool,
    /// Skip the data writer's backward dedup scan entirely.
    pub no_duplicates: bool,
    pub hash_compare_only: bool,
    /// Build an NFS export table.
    pub exportable: bool,
}

/// Everything [`crate::squashfs`]'s image assembler needs once the tree has
/// been built: the finished metadata areas plus enough bookkeeping to fill
/// in the superblock.
pub struct BuiltImage {
    pub inode_count: u32,
    pub root_inode_ref: u64,
    pub inode_area: Vec<u8>,
    pub dir_area: Vec<u8>,
    pub fragments: Vec<Fragment>,
    pub ids: Vec<Id>,
    pub xattr: Option<FlushedXattrs>,
    pub export: Option<ExportTable>,
    pub data_bytes_written: u64,
    pub blocks_deduplicated: u64,
}

fn is_dir(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}

fn base_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

fn is_all_zero(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0)
}

fn read_full(r: &mut dyn Read, buf: &mut [u8]) -> Result<usize, SquashfsError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn commit_block(data: &mut DataWriter, bytes: &[u8]) -> Result<bool, SquashfsError> {
    if is_all_zero(bytes) {
        data.add_sparse_block();
        Ok(true)
    } else {
        data.add_block(bytes)?;
        Ok(false)
    }
}

/// Accumulates file tails into shared fragment blocks, flushing a block
/// only once a new tail would overflow it (or at [`FragmentWriter::flush`]
/// for the final, possibly-partial one).
struct FragmentWriter {
    fragments: Vec<Fragment>,
    pending: Vec<u8>,
}

impl FragmentWriter {
    fn new() -> Self {
        Self {
            fragments: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Packs `tail` into the fragment area. Returns `(frag_index,
    /// block_offset)` for the inode to record; the index is valid even
    /// though the block it names may not be flushed to `data` yet.
    fn add_tail(
        &mut self,
        tail: &[u8],
        block_size: u32,
        data: &mut DataWriter,
    ) -> Result<(u32, u32), SquashfsError> {
        if self.pending.len() + tail.len() > block_size as usize {
            self.flush(data)?;
        }
        let offset = self.pending.len() as u32;
        self.pending.extend_from_slice(tail);
        Ok((self.fragments.len() as u32, offset))
    }

    fn flush(&mut self, data: &mut DataWriter) -> Result<(), SquashfsError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        data.begin_file()?;
        let size = data.add_block(&self.pending)?;
        let (start, _) = data.finish_file()?;
        self.fragments.push(Fragment::new(start, size));
        self.pending.clear();
        Ok(())
    }
}

enum RawKind {
    Dir,
    File {
        blocks_start: u64,
        block_sizes: Vec<DataSize>,
        file_size: u64,
        sparse: u64,
        frag_index: u32,
        frag_offset: u32,
    },
    Symlink {
        target: String,
    },
    HardLink {
        target_path: String,
    },
    /// A block/character device, fifo, or socket — `mode` alone
    /// distinguishes which, so no extra payload is needed here.
    Special,
}

struct RawEntry {
    path: String,
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: u32,
    rdev: u32,
    xattrs: Vec<(String, Vec<u8>)>,
    kind: RawKind,
}

/// Reads one file's full content into the data area and (if eligible) the
/// fragment area, following `always_use_fragments`/`no_fragments`. The last
/// full-size block read is held back one iteration so the writer only ever
/// commits a block once it's known not to be the file's last one.
fn build_regular_file(
    reader: &mut dyn Read,
    data: &mut DataWriter,
    frag: &mut FragmentWriter,
    config: &BuilderConfig,
) -> Result<(u64, Vec<DataSize>, u64, u64, u32, u32), SquashfsError> {
    data.begin_file()?;
    let block_size = config.block_size as usize;
    let mut file_size: u64 = 0;
    let mut sparse: u64 = 0;
    let mut pending: Option<Vec<u8>> = None;
    let mut short_tail: Option<Vec<u8>> = None;

    loop {
        let mut buf = vec![0u8; block_size];
        let n = read_full(reader, &mut buf)?;
        if n == 0 {
            break;
        }
        buf.truncate(n);
        file_size += n as u64;

        if let Some(prev) = pending.take() {
            if commit_block(data, &prev)? {
                sparse += block_size as u64;
            }
        }

        if n == block_size {
            pending = Some(buf);
        } else {
            short_tail = Some(buf);
            break;
        }
    }

    // At most one of `pending` (a held-back full block) / `short_tail` (a
    // genuinely partial final chunk) survives to become this file's
    // fragment-eligible tail; the other path commits it as a regular block
    // before the main run is closed off.
    let fragment_tail = match (pending.take(), short_tail) {
        (Some(p), None) if config.always_use_fragments && !config.no_fragments => Some(p),
        (Some(p), None) => {
            if commit_block(data, &p)? {
                sparse += block_size as u64;
            }
            None
        }
        (None, Some(t)) if config.no_fragments => {
            commit_block(data, &t)?;
            None
        }
        (None, Some(t)) => Some(t),
        (None, None) => None,
        (Some(_), Some(_)) => unreachable!("loop breaks as soon as a short chunk is read"),
    };

    let (blocks_start, block_sizes) = data.finish_file()?;

    let (frag_index, frag_offset) = match fragment_tail {
        None => (NO_FRAGMENT, 0),
        Some(t) => frag.add_tail(&t, config.block_size, data)?,
    };

    Ok((blocks_start, block_sizes, file_size, sparse, frag_index, frag_offset))
}

/// Drains `source` exactly once, streaming regular-file content into `data`
/// as each entry is visited.
fn materialize(
    source: &mut dyn DirIterator,
    data: &mut DataWriter,
    frag: &mut FragmentWriter,
    config: &BuilderConfig,
) -> Result<Vec<RawEntry>, SquashfsError> {
    let mut out = Vec::new();
    while let Some(entry) = source.next()? {
        validate_entry_name(base_name(&entry.name))?;
        let xattrs = source.read_xattr()?;

        let kind = if let Some(target_path) = entry.hard_link_target.clone() {
            RawKind::HardLink { target_path }
        } else if is_dir(entry.mode) {
            RawKind::Dir
        } else if entry.mode & S_IFMT == S_IFLNK {
            RawKind::Symlink {
                target: source.read_link()?,
            }
        } else if entry.mode & S_IFMT == S_IFREG {
            let mut reader = source.open_file_ro()?;
            let (blocks_start, block_sizes, file_size, sparse, frag_index, frag_offset) =
                build_regular_file(reader.as_mut(), data, frag, config)?;
            RawKind::File {
                blocks_start,
                block_sizes,
                file_size,
                sparse,
                frag_index,
                frag_offset,
            }
        } else {
            RawKind::Special
        };

        out.push(RawEntry {
            path: entry.name,
            mode: entry.mode,
            uid: entry.uid,
            gid: entry.gid,
            mtime: entry.mtime,
            rdev: entry.rdev,
            xattrs,
            kind,
        });
    }
    Ok(out)
}

#[derive(Clone, Copy)]
struct BuiltLeaf {
    inode_ref: u64,
    inode_number: u32,
    inode_type: u16,
}

struct Frame {
    path: String,
    inode_number: u32,
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: u32,
    xattrs: Vec<(String, Vec<u8>)>,
    dir: DirectoryWriter,
    subdir_count: u32,
}

struct Ctx {
    config: BuilderConfig,
    id_table: IdTable,
    xattr_writer: XattrWriter,
    inode_writer: MetadataWriter,
    dir_writer: MetadataWriter,
    export: Option<ExportTable>,
    next_inode_number: u32,
    built: HashMap<String, BuiltLeaf>,
}

impl Ctx {
    fn alloc_inode_number(&mut self) -> u32 {
        self.next_inode_number += 1;
        self.next_inode_number
    }
}

fn write_xattrs(writer: &mut XattrWriter, pairs: &[(String, Vec<u8>)]) -> Result<u32, SquashfsError> {
    writer.begin();
    for (k, v) in pairs {
        writer.add(k, v)?;
    }
    Ok(writer.end())
}

fn write_inode(ctx: &mut Ctx, inode: &Inode) -> Result<u64, SquashfsError> {
    let bytes = inode
        .to_bytes(ctx.config.block_size, ctx.config.block_log)
        .map_err(SquashfsError::Deku)?;
    Ok(ctx.inode_writer.write_bytes(&bytes)?.pack())
}

fn build_file_inode(
    blocks_start: u64,
    block_sizes: Vec<DataSize>,
    file_size: u64,
    sparse: u64,
    frag_index: u32,
    frag_offset: u32,
    link_count: u32,
    xattr_index: u32,
) -> InodeInner {
    let needs_extended = file_size > u32::MAX as u64
        || blocks_start > u32::MAX as u64
        || sparse > 0
        || link_count > 1
        || xattr_index != NO_XATTRS;

    if needs_extended {
        InodeInner::ExtendedFile(ExtendedFile {
            fixed: ExtendedFileFixed {
                blocks_start,
                file_size,
                sparse,
                link_count,
                frag_index,
                block_offset: frag_offset,
                xattr_index,
            },
            block_sizes,
        })
    } else {
        InodeInner::BasicFile(BasicFile {
            fixed: BasicFileFixed {
                blocks_start: blocks_start as u32,
                frag_index,
                block_offset: frag_offset,
                file_size: file_size as u32,
            },
            block_sizes,
        })
    }
}

fn build_symlink_inode(target: &str, xattr_index: u32) -> InodeInner {
    let target_path = target.as_bytes().to_vec();
    if xattr_index != NO_XATTRS {
        InodeInner::ExtendedSymlink(ExtendedSymlink {
            link_count: 1,
            target_size: target_path.len() as u32,
            target_path,
            xattr_index,
        })
    } else {
        InodeInner::BasicSymlink(BasicSymlink {
            link_count: 1,
            target_size: target_path.len() as u32,
            target_path,
        })
    }
}

fn build_device_inode(mode: u32, rdev: u32, xattr_index: u32) -> InodeInner {
    let is_block = mode & S_IFMT == S_IFBLK;
    if xattr_index != NO_XATTRS {
        let body = ExtendedDeviceSpecialFile {
            link_count: 1,
            device_number: rdev,
            xattr_index,
        };
        if is_block {
            InodeInner::ExtendedBlockDevice(body)
        } else {
            InodeInner::ExtendedCharacterDevice(body)
        }
    } else {
        let body = BasicDeviceSpecialFile {
            link_count: 1,
            device_number: rdev,
        };
        if is_block {
            InodeInner::BasicBlockDevice(body)
        } else {
            InodeInner::BasicCharacterDevice(body)
        }
    }
}

fn build_ipc_inode(is_socket: bool, xattr_index: u32) -> InodeInner {
    if xattr_index != NO_XATTRS {
        let body = ExtendedIpc {
            link_count: 1,
            xattr_index,
        };
        if is_socket {
            InodeInner::ExtendedSocket(body)
        } else {
            InodeInner::ExtendedFifo(body)
        }
    } else {
        let body = BasicIpc { link_count: 1 };
        if is_socket {
            InodeInner::BasicSocket(body)
        } else {
            InodeInner::BasicFifo(body)
        }
    }
}

fn build_leaf(
    ctx: &mut Ctx,
    frame: &mut Frame,
    entry: RawEntry,
    nlink: &HashMap<String, u32>,
) -> Result<(), SquashfsError> {
    let name = base_name(&entry.path).as_bytes().to_vec();

    if let RawKind::HardLink { target_path } = &entry.kind {
        let target = *ctx.built.get(target_path).ok_or(SquashfsError::Sequence(
            "hard link target was not built before the link",
        ))?;
        frame
            .dir
            .add_entry(name, target.inode_ref, target.inode_number, target.inode_type);
        return Ok(());
    }

    let inode_number = ctx.alloc_inode_number();
    let xattr_index = write_xattrs(&mut ctx.xattr_writer, &entry.xattrs)?;
    let uid = ctx.id_table.id_to_index(entry.uid)?;
    let gid = ctx.id_table.id_to_index(entry.gid)?;
    let header = InodeHeader {
        permissions: (entry.mode & 0o7777) as u16,
        uid,
        gid,
        mtime: entry.mtime,
        inode_number,
    };

    let inner = match entry.kind {
        RawKind::File {
            blocks_start,
            block_sizes,
            file_size,
            sparse,
            frag_index,
            frag_offset,
        } => {
            let link_count = nlink.get(&entry.path).copied().unwrap_or(1);
            build_file_inode(
                blocks_start,
                block_sizes,
                file_size,
                sparse,
                frag_index,
                frag_offset,
                link_count,
                xattr_index,
            )
        }
        RawKind::Symlink { target } => build_symlink_inode(&target, xattr_index),
        RawKind::Special if entry.mode & S_IFMT == S_IFSOCK => build_ipc_inode(true, xattr_index),
        RawKind::Special if entry.mode & S_IFMT == S_IFBLK || entry.mode & S_IFMT == S_IFCHR => {
            build_device_inode(entry.mode, entry.rdev, xattr_index)
        }
        RawKind::Special => build_ipc_inode(false, xattr_index),
        RawKind::Dir | RawKind::HardLink { .. } => unreachable!("handled above or by the caller"),
    };

    let inode = Inode::new(header, inner);
    let inode_type = inode.id().into_base_type() as u16;
    let inode_ref = write_inode(ctx, &inode)?;

    frame.dir.add_entry(name, inode_ref, inode_number, inode_type);
    ctx.built.insert(
        entry.path,
        BuiltLeaf {
            inode_ref,
            inode_number,
            inode_type,
        },
    );

    Ok(())
}

/// Serializes a directory whose children are all known, adds its entry to
/// `parent`, and bumps `parent`'s subdirectory count (directory `nlink` is
/// `2 + subdir_count`: itself, its own `.` entry, and each child's `..`).
fn finish_frame(ctx: &mut Ctx, parent: &mut Frame, frame: Frame) -> Result<(), SquashfsError> {
    let written = frame.dir.finish(&mut ctx.dir_writer, ctx.export.as_mut())?;
    let xattr_index = write_xattrs(&mut ctx.xattr_writer, &frame.xattrs)?;
    let link_count = 2 + frame.subdir_count;

    let needs_extended = written.size as usize > 0xffff
        || written.start.block_start > u32::MAX as u64
        || xattr_index != NO_XATTRS;

    let header = InodeHeader {
        permissions: (frame.mode & 0o7777) as u16,
        uid: ctx.id_table.id_to_index(frame.uid)?,
        gid: ctx.id_table.id_to_index(frame.gid)?,
        mtime: frame.mtime,
        inode_number: frame.inode_number,
    };

    let inner = if needs_extended {
        InodeInner::ExtendedDirectory(ExtendedDirectory {
            link_count,
            file_size: written.size,
            block_index: written.start.block_start as u32,
            parent_inode: parent.inode_number,
            index_count: written.index.len() as u16,
            block_offset: written.start.byte_offset,
            xattr_index,
            dir_index: written.index,
        })
    } else {
        InodeInner::BasicDirectory(BasicDirectory {
            block_index: written.start.block_start as u32,
            link_count,
            file_size: written.size as u16,
            block_offset: written.start.byte_offset,
            parent_inode: parent.inode_number,
        })
    };

    let inode = Inode::new(header, inner);
    let inode_type = inode.id().into_base_type() as u16;
    let inode_ref = write_inode(ctx, &inode)?;

    parent.dir.add_entry(
        base_name(&frame.path).as_bytes().to_vec(),
        inode_ref,
        frame.inode_number,
        inode_type,
    );
    parent.subdir_count += 1;

    Ok(())
}

/// Builds the full inode/directory/fragment/id/xattr image from `source`,
/// streaming regular-file content into `data` as it goes. `data` must
/// already be positioned (via [`DataWriter::set_start`]) at the image's
/// intended data-area offset before this is called.
pub fn build(
    root_meta: RootMeta,
    mut source: Box<dyn DirIterator>,
    data: &mut DataWriter,
    config: &BuilderConfig,
) -> Result<BuiltImage, SquashfsError> {
    let mut frag = FragmentWriter::new();
    let raw = materialize(source.as_mut(), data, &mut frag, config)?;
    frag.flush(data)?;

    let mut nlink: HashMap<String, u32> = HashMap::new();
    for e in &raw {
        if let RawKind::HardLink { target_path } = &e.kind {
            *nlink.entry(target_path.clone()).or_insert(1) += 1;
        }
    }

    let mut ctx = Ctx {
        config: config.clone(),
        id_table: IdTable::new(),
        xattr_writer: XattrWriter::new(),
        inode_writer: MetadataWriter::new(config.codec.clone()),
        dir_writer: MetadataWriter::new(config.codec.clone()),
        export: if config.exportable {
            Some(ExportTable::default())
        } else {
            None
        },
        next_inode_number: 0,
        built: HashMap::new(),
    };

    let root_number = ctx.alloc_inode_number();
    let mut stack = vec![Frame {
        path: String::new(),
        inode_number: root_number,
        mode: S_IFDIR | (root_meta.permissions as u32 & 0o7777),
        uid: root_meta.uid,
        gid: root_meta.gid,
        mtime: root_meta.mtime,
        xattrs: Vec::new(),
        dir: DirectoryWriter::new(),
        subdir_count: 0,
    }];

    for entry in raw {
        while stack.len() > 1 && stack.last().unwrap().path != parent_of(&entry.path) {
            let finished = stack.pop().unwrap();
            let parent = stack.last_mut().unwrap();
            finish_frame(&mut ctx, parent, finished)?;
        }

        if matches!(entry.kind, RawKind::Dir) {
            let inode_number = ctx.alloc_inode_number();
            stack.push(Frame {
                path: entry.path,
                inode_number,
                mode: entry.mode,
                uid: entry.uid,
                gid: entry.gid,
                mtime: entry.mtime,
                xattrs: entry.xattrs,
                dir: DirectoryWriter::new(),
                subdir_count: 0,
            });
        } else {
            let frame = stack.last_mut().unwrap();
            build_leaf(&mut ctx, frame, entry, &nlink)?;
        }
    }

    while stack.len() > 1 {
        let finished = stack.pop().unwrap();
        let parent = stack.last_mut().unwrap();
        finish_frame(&mut ctx, parent, finished)?;
    }

    let root = stack
        .pop()
        .expect("root frame is pushed before the loop and never popped by it");
    let written = root.dir.finish(&mut ctx.dir_writer, ctx.export.as_mut())?;
    let xattr_index = write_xattrs(&mut ctx.xattr_writer, &root.xattrs)?;
    let link_count = 2 + root.subdir_count;
    let needs_extended = written.size as usize > 0xffff
        || written.start.block_start > u32::MAX as u64
        || xattr_index != NO_XATTRS;

    let header = InodeHeader {
        permissions: (root.mode & 0o7777) as u16,
        uid: ctx.id_table.id_to_index(root.uid)?,
        gid: ctx.id_table.id_to_index(root.gid)?,
        mtime: root.mtime,
        inode_number: root.inode_number,
    };
    let inner = if needs_extended {
        InodeInner::ExtendedDirectory(ExtendedDirectory {
            link_count,
            file_size: written.size,
            block_index: written.start.block_start as u32,
            parent_inode: root.inode_number,
            index_count: written.index.len() as u16,
            block_offset: written.start.byte_offset,
            xattr_index,
            dir_index: written.index,
        })
    } else {
        InodeInner::BasicDirectory(BasicDirectory {
            block_index: written.start.block_start as u32,
            link_count,
            file_size: written.size as u16,
            block_offset: written.start.byte_offset,
            parent_inode: root.inode_number,
        })
    };
    let inode = Inode::new(header, inner);
    let root_inode_ref = write_inode(&mut ctx, &inode)?;
    if let Some(export) = ctx.export.as_mut() {
        export.set(root.inode_number, root_inode_ref);
    }

    let inode_count = ctx.next_inode_number;
    let inode_area = ctx.inode_writer.finish()?;
    let dir_area = ctx.dir_writer.finish()?;
    let flushed = ctx.xattr_writer.flush(config.codec.clone())?;
    let xattr = if flushed.is_empty() { None } else { Some(flushed) };

    Ok(BuiltImage {
        inode_count,
        root_inode_ref,
        inode_area,
        dir_area,
        fragments: frag.fragments,
        ids: ctx.id_table.records(),
        xattr,
        export: ctx.export,
        data_bytes_written: data.bytes_written,
        blocks_deduplicated: data.blocks_deduplicated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::StoreCodec;
    use crate::data_writer::DataWriterConfig;
    use crate::traits::{SourceDirEntry, VecFile};
    use std::io::Cursor;

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

    fn config() -> BuilderConfig {
        BuilderConfig {
            block_size: 128,
            block_log: 7,
            codec: Arc::new(StoreCodec),
            no_fragments: false,
            always_use_fragments: false,
            no_duplicates: false,
            hash_compare_only: false,
            exportable: true,
        }
    }

    fn writer() -> DataWriter {
        let file: Box<dyn crate::traits::File> = Box::new(VecFile::new());
        DataWriter::new(file, Arc::new(StoreCodec), DataWriterConfig::default())
    }

    #[test]
    fn single_file_in_a_subdirectory() {
        let src = FakeSource::new(vec![
            (entry("dir", S_IFDIR | 0o755), None, None),
            (
                entry("dir/file.txt", S_IFREG | 0o644),
                Some(b"hello world".to_vec()),
                None,
            ),
        ]);

        let mut data = writer();
        let built = build(RootMeta::default(), Box::new(src), &mut data, &config()).unwrap();

        assert_eq!(built.inode_count, 3); // root + dir + file
        assert!(built.export.as_ref().unwrap().get(built.inode_count).is_some());
    }

    #[test]
    fn hard_link_reuses_the_original_inode() {
        let dev_ino = Some((1u64, 42u64));
        let mut first = entry("a.txt", S_IFREG | 0o644);
        first.dev_ino = dev_ino;
        let mut second = entry("b.txt", S_IFREG | 0o644);
        second.dev_ino = dev_ino;
        second.hard_link_target = Some("a.txt".to_string());

        let src = FakeSource::new(vec![
            (first, Some(b"shared".to_vec()), None),
            (second, None, None),
        ]);

        let mut data = writer();
        let built = build(RootMeta::default(), Box::new(src), &mut data, &config()).unwrap();

        // root + one real file inode; the hard link reuses it.
        assert_eq!(built.inode_count, 2);
    }

    #[test]
    fn symlink_records_its_target() {
        let src = FakeSource::new(vec![(
            entry("link", S_IFLNK | 0o777),
            None,
            Some("/etc/passwd".to_string()),
        )]);

        let mut data = writer();
        let built = build(RootMeta::default(), Box::new(src), &mut data, &config()).unwrap();
        assert_eq!(built.inode_count, 2);
    }

    #[test]
    fn empty_tree_has_only_the_root_inode() {
        let src = FakeSource::new(vec![]);
        let mut data = writer();
        let built = build(RootMeta::default(), Box::new(src), &mut data, &config()).unwrap();
        assert_eq!(built.inode_count, 1);
        assert!(!built.inode_area.is_empty());
    }
}
