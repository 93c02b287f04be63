//! Source-side tree walking: a filtering wrapper around a raw
//! [`DirIterator`] plus a hard-link detector, composed the same way the
//! original chains `dir_tree_iterator` in front of `hard_link_filter`.
//!
//! Grounded on `original_source/lib/common/src/dir_tree_iterator.c`
//! (`should_skip`'s type mask, `DIR_SCAN_ONE_FILESYSTEM` mount-point skip,
//! `apply_changes`'s metadata overrides) and
//! `original_source/lib/sqfs/src/io/dir_hl.c` (the `(dev, inode)`-keyed
//! table that turns a repeat visit into a hard-link reference instead of
//! reading the file again). Not present in backhand, which builds its
//! writer tree directly from an in-memory `FilesystemWriter` API rather
//! than streaming a live filesystem.

use std::collections::HashMap;
use std::ops::{BitOr, BitOrAssign};

use crate::error::SquashfsError;
use crate::traits::{DirIterator, SourceDirEntry};

/// Scan behavior flags, named after `DIR_SCAN_*` in the original. A plain
/// bitset over `u32`, in the same hand-rolled style as
/// [`crate::superblock::SuperBlockFlags`] rather than a derive macro.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ScanFlags(u32);

impl ScanFlags {
    pub const NO_RECURSION: ScanFlags = ScanFlags(0x0001);
    pub const NO_SOCK: ScanFlags = ScanFlags(0x0002);
    pub const NO_SLINK: ScanFlags = ScanFlags(0x0004);
    pub const NO_FILE: ScanFlags = ScanFlags(0x0008);
    pub const NO_BLK: ScanFlags = ScanFlags(0x0010);
    pub const NO_CHR: ScanFlags = ScanFlags(0x0020);
    pub const NO_FIFO: ScanFlags = ScanFlags(0x0040);
    pub const NO_DIR: ScanFlags = ScanFlags(0x0080);
    pub const ONE_FILESYSTEM: ScanFlags = ScanFlags(0x0100);
    pub const KEEP_TIME: ScanFlags = ScanFlags(0x0200);
    pub const KEEP_UID: ScanFlags = ScanFlags(0x0400);
    pub const KEEP_GID: ScanFlags = ScanFlags(0x0800);
    pub const KEEP_MODE: ScanFlags = ScanFlags(0x1000);
    pub const NO_HARDLINKS: ScanFlags = ScanFlags(0x2000);

    pub const fn empty() -> Self {
        ScanFlags(0)
    }

    pub fn contains(self, other: ScanFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: ScanFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for ScanFlags {
    type Output = ScanFlags;
    fn bitor(self, rhs: ScanFlags) -> ScanFlags {
        ScanFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ScanFlags {
    fn bitor_assign(&mut self, rhs: ScanFlags) {
        self.0 |= rhs.0;
    }
}

#[derive(Clone, Default)]
pub struct ScanConfig {
    pub flags: ScanFlags,
    pub prefix: Option<String>,
    pub def_mtime: u32,
    pub def_uid: u32,
    pub def_gid: u32,
    pub def_mode: u32,
}

const S_IFMT: u32 = 0o170000;
const S_IFSOCK: u32 = 0o140000;
const S_IFLNK: u32 = 0o120000;
const S_IFREG: u32 = 0o100000;
const S_IFBLK: u32 = 0o060000;
const S_IFDIR: u32 = 0o040000;
const S_IFCHR: u32 = 0o020000;
const S_IFIFO: u32 = 0o010000;

fn is_dir(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

/// Wraps a raw source walker with type-mask filtering, mount-boundary
/// skipping, path-prefix expansion, and metadata overrides.
pub struct TreeIterator {
    inner: Box<dyn DirIterator>,
    cfg: ScanConfig,
}

impl TreeIterator {
    pub fn new(inner: Box<dyn DirIterator>, cfg: ScanConfig) -> Self {
        Self { inner, cfg }
    }

    fn should_skip(&self, ent: &SourceDirEntry) -> bool {
        if self.cfg.flags.contains(ScanFlags::ONE_FILESYSTEM) && ent.is_mount_point {
            return true;
        }
        let type_mask = match ent.mode & S_IFMT {
            S_IFSOCK => ScanFlags::NO_SOCK,
            S_IFLNK => ScanFlags::NO_SLINK,
            S_IFREG => ScanFlags::NO_FILE,
            S_IFBLK => ScanFlags::NO_BLK,
            S_IFCHR => ScanFlags::NO_CHR,
            S_IFIFO => ScanFlags::NO_FIFO,
            _ => ScanFlags::empty(),
        };
        self.cfg.flags.intersects(type_mask)
    }

    fn expand_path(&self, ent: &mut SourceDirEntry) {
        if let Some(prefix) = self.cfg.prefix.as_deref().filter(|p| !p.is_empty()) {
            ent.name = format!("{prefix}/{}", ent.name);
        }
    }

    fn apply_overrides(&self, ent: &mut SourceDirEntry) {
        if !self.cfg.flags.contains(ScanFlags::KEEP_TIME) {
            ent.mtime = self.cfg.def_mtime;
        }
        if !self.cfg.flags.contains(ScanFlags::KEEP_UID) {
            ent.uid = self.cfg.def_uid;
        }
        if !self.cfg.flags.contains(ScanFlags::KEEP_GID) {
            ent.gid = self.cfg.def_gid;
        }
        if !self.cfg.flags.contains(ScanFlags::KEEP_MODE) {
            ent.mode = (ent.mode & !0o7777) | (self.cfg.def_mode & 0o7777);
        }
    }
}

impl DirIterator for TreeIterator {
    fn next(&mut self) -> Result<Option<SourceDirEntry>, SquashfsError> {
        loop {
            let Some(mut ent) = self.inner.next()? else {
                return Ok(None);
            };

            if self.should_skip(&ent) {
                if is_dir(ent.mode) {
                    self.inner.ignore_subdir();
                }
                continue;
            }

            self.expand_path(&mut ent);
            self.apply_overrides(&mut ent);

            if is_dir(ent.mode) {
                if self.cfg.flags.contains(ScanFlags::NO_RECURSION) {
                    self.inner.ignore_subdir();
                }
                if self.cfg.flags.contains(ScanFlags::NO_DIR) {
                    continue;
                }
            }

            return Ok(Some(ent));
        }
    }

    fn read_link(&mut self) -> Result<String, SquashfsError> {
        self.inner.read_link()
    }

    fn ignore_subdir(&mut self) {
        self.inner.ignore_subdir()
    }

    fn open_file_ro(&mut self) -> Result<Box<dyn std::io::Read>, SquashfsError> {
        self.inner.open_file_ro()
    }

    fn read_xattr(&mut self) -> Result<Vec<(String, Vec<u8>)>, SquashfsError> {
        self.inner.read_xattr()
    }
}

/// Rewrites repeat visits of the same `(dev, inode)` pair into a
/// hard-link reference instead of a second independent file, so the tree
/// builder stores the data once and every other name points at it.
pub struct HardLinkFilter {
    inner: Box<dyn DirIterator>,
    seen: HashMap<(u64, u64), String>,
    last_was_link: bool,
    last_link_target: Option<String>,
}

impl HardLinkFilter {
    pub fn new(inner: Box<dyn DirIterator>) -> Self {
        Self {
            inner,
            seen: HashMap::new(),
            last_was_link: false,
            last_link_target: None,
        }
    }
}

impl DirIterator for HardLinkFilter {
    fn next(&mut self) -> Result<Option<SourceDirEntry>, SquashfsError> {
        let Some(mut ent) = self.inner.next()? else {
            self.last_was_link = false;
            return Ok(None);
        };

        if is_dir(ent.mode) {
            self.last_was_link = false;
            return Ok(Some(ent));
        }

        match ent.dev_ino.and_then(|key| self.seen.get(&key).cloned()) {
            Some(target) => {
                ent.hard_link_target = Some(target.clone());
                self.last_was_link = true;
                self.last_link_target = Some(target);
            }
            None => {
                if let Some(key) = ent.dev_ino {
                    self.seen.insert(key, ent.name.clone());
                }
                self.last_was_link = false;
                self.last_link_target = None;
            }
        }

        Ok(Some(ent))
    }

    /// A hard-link entry's `read_link` returns the stored first-seen path,
    /// the same as a real symlink's target would be read, so the tree
    /// builder can treat both uniformly.
    fn read_link(&mut self) -> Result<String, SquashfsError> {
        if self.last_was_link {
            return self
                .last_link_target
                .clone()
                .ok_or(SquashfsError::Sequence("hard-link entry missing its target"));
        }
        self.inner.read_link()
    }

    fn ignore_subdir(&mut self) {
        self.inner.ignore_subdir()
    }

    fn open_file_ro(&mut self) -> Result<Box<dyn std::io::Read>, SquashfsError> {
        if self.last_was_link {
            return Err(SquashfsError::NotFile);
        }
        self.inner.open_file_ro()
    }

    fn read_xattr(&mut self) -> Result<Vec<(String, Vec<u8>)>, SquashfsError> {
        if self.last_was_link {
            return Ok(Vec::new());
        }
        self.inner.read_xattr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct StaticSource {
        entries: std::vec::IntoIter<SourceDirEntry>,
    }

    impl DirIterator for StaticSource {
        fn next(&mut self) -> Result<Option<SourceDirEntry>, SquashfsError> {
            Ok(self.entries.next())
        }
        fn read_link(&mut self) -> Result<String, SquashfsError> {
            Ok(String::new())
        }
        fn ignore_subdir(&mut self) {}
        fn open_file_ro(&mut self) -> Result<Box<dyn std::io::Read>, SquashfsError> {
            Ok(Box::new(Cursor::new(Vec::new())))
        }
    }

    fn entry(name: &str, mode: u32, dev_ino: Option<(u64, u64)>) -> SourceDirEntry {
        SourceDirEntry {
            name: name.to_string(),
            mode,
            uid: 0,
            gid: 0,
            mtime: 0,
            rdev: 0,
            dev_ino,
            is_mount_point: false,
            hard_link_target: None,
        }
    }

    #[test]
    fn skips_sockets_when_masked() {
        let src = StaticSource {
            entries: vec![
                entry("a", S_IFREG, None),
                entry("s", S_IFSOCK, None),
            ]
            .into_iter(),
        };
        let mut cfg = ScanConfig::default();
        cfg.flags = ScanFlags::NO_SOCK;
        let mut it = TreeIterator::new(Box::new(src), cfg);

        assert_eq!(it.next().unwrap().unwrap().name, "a");
        assert!(it.next().unwrap().is_none());
    }

    #[test]
    fn repeated_inode_becomes_a_hard_link() {
        let src = StaticSource {
            entries: vec![
                entry("first", S_IFREG, Some((1, 100))),
                entry("second", S_IFREG, Some((1, 100))),
            ]
            .into_iter(),
        };
        let mut hl = HardLinkFilter::new(Box::new(src));

        let a = hl.next().unwrap().unwrap();
        assert_eq!(a.hard_link_target, None);

        let b = hl.next().unwrap().unwrap();
        assert_eq!(b.hard_link_target.as_deref(), Some("first"));
        assert_eq!(hl.read_link().unwrap(), "first");
    }

    #[test]
    fn directories_are_never_linked() {
        let src = StaticSource {
            entries: vec![
                entry("d1", S_IFDIR, Some((1, 5))),
                entry("d2", S_IFDIR, Some((1, 5))),
            ]
            .into_iter(),
        };
        let mut hl = HardLinkFilter::new(Box::new(src));
        assert_eq!(hl.next().unwrap().unwrap().hard_link_target, None);
        assert_eq!(hl.next().unwrap().unwrap().hard_link_target, None);
    }
}
