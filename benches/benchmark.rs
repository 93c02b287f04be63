//! Read/write throughput benchmarks over synthetic in-memory images.
//!
//! Unlike the teacher's benches, these don't fetch fixtures over the
//! network or shell out to a CLI: everything is generated and round-tripped
//! through [`VecFile`] so the benchmark has no external dependencies.

use std::io::Read;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion, SamplingMode};

use squashfs_core::filesystem::RootMeta;
use squashfs_core::squashfs::{Squashfs, SquashfsWriterConfig};
use squashfs_core::traits::{DirIterator, File, SourceDirEntry, VecFile};
use squashfs_core::tree::{self, TreeFilterFlags};

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

type RawEntry = (SourceDirEntry, Option<Vec<u8>>, Option<String>);

fn dir_entry(name: &str) -> SourceDirEntry {
    SourceDirEntry {
        name: name.to_string(),
        mode: S_IFDIR | 0o755,
        uid: 0,
        gid: 0,
        mtime: 0,
        rdev: 0,
        dev_ino: None,
        is_mount_point: false,
        hard_link_target: None,
    }
}

fn file_entry(name: &str) -> SourceDirEntry {
    SourceDirEntry {
        name: name.to_string(),
        mode: S_IFREG | 0o644,
        uid: 0,
        gid: 0,
        mtime: 0,
        rdev: 0,
        dev_ino: None,
        is_mount_point: false,
        hard_link_target: None,
    }
}

/// A flat directory of `count` files, each `file_size` bytes of
/// pseudo-random (but deterministic) content.
fn generate_source(count: usize, file_size: usize) -> Vec<RawEntry> {
    let mut out = vec![(dir_entry("files"), None, None)];
    for i in 0..count {
        let mut content = vec![0u8; file_size];
        for (j, b) in content.iter_mut().enumerate() {
            *b = ((i * 2654435761 + j) % 256) as u8;
        }
        out.push((file_entry(&format!("files/f{i}.bin")), Some(content), None));
    }
    out
}

struct GenSource {
    entries: std::vec::IntoIter<RawEntry>,
    current_content: Option<Vec<u8>>,
}

impl GenSource {
    fn new(entries: Vec<RawEntry>) -> Self {
        Self {
            entries: entries.into_iter(),
            current_content: None,
        }
    }
}

impl DirIterator for GenSource {
    fn next(&mut self) -> Result<Option<SourceDirEntry>, squashfs_core::SquashfsError> {
        match self.entries.next() {
            Some((ent, content, _link)) => {
                self.current_content = content;
                Ok(Some(ent))
            }
            None => Ok(None),
        }
    }

    fn read_link(&mut self) -> Result<String, squashfs_core::SquashfsError> {
        Ok(String::new())
    }

    fn ignore_subdir(&mut self) {}

    fn open_file_ro(&mut self) -> Result<Box<dyn Read>, squashfs_core::SquashfsError> {
        Ok(Box::new(std::io::Cursor::new(
            self.current_content.clone().unwrap_or_default(),
        )))
    }
}

/// `Squashfs::write` consumes its `file`, so the bytes are captured by
/// wrapping the backing store in a handle that survives past the call.
fn build_and_capture(entries: Vec<RawEntry>) -> Vec<u8> {
    let src = GenSource::new(entries);
    let shared = Arc::new(std::sync::Mutex::new(Vec::<u8>::new()));

    struct SharedFile(Arc<std::sync::Mutex<Vec<u8>>>);
    impl File for SharedFile {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, squashfs_core::SquashfsError> {
            let data = self.0.lock().unwrap();
            let start = offset as usize;
            buf.copy_from_slice(&data[start..start + buf.len()]);
            Ok(buf.len())
        }
        fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize, squashfs_core::SquashfsError> {
            let mut data = self.0.lock().unwrap();
            let end = offset as usize + buf.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[offset as usize..end].copy_from_slice(buf);
            Ok(buf.len())
        }
        fn get_size(&self) -> Result<u64, squashfs_core::SquashfsError> {
            Ok(self.0.lock().unwrap().len() as u64)
        }
        fn truncate(&mut self, size: u64) -> Result<(), squashfs_core::SquashfsError> {
            self.0.lock().unwrap().resize(size as usize, 0);
            Ok(())
        }
    }

    let file: Box<dyn File> = Box::new(SharedFile(shared.clone()));
    let config = SquashfsWriterConfig {
        block_size: 0x20000,
        ..SquashfsWriterConfig::default()
    };
    Squashfs::write(file, RootMeta::default(), Box::new(src), config).unwrap();
    Arc::try_unwrap(shared).unwrap().into_inner().unwrap()
}

fn bench_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("write");
    group.sampling_mode(SamplingMode::Flat);
    group.sample_size(10);

    let entries = generate_source(64, 8192);
    group.bench_function("64_files_8k", |b| {
        b.iter(|| std::hint::black_box(build_and_capture(entries.clone())))
    });

    group.finish();
}

fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("read");
    group.sampling_mode(SamplingMode::Flat);
    group.sample_size(10);

    let bytes = build_and_capture(generate_source(64, 8192));
    group.bench_function("open_and_walk", |b| {
        b.iter(|| {
            let file: Box<dyn File> = Box::new(VecFile::from(bytes.clone()));
            let sqfs = Squashfs::open(file).unwrap();
            let root = tree::deserialize(&sqfs, None, TreeFilterFlags::empty()).unwrap();
            std::hint::black_box(tree::get_path(&root).unwrap());
        })
    });

    group.finish();
}

criterion_group!(benches, bench_write, bench_read);
criterion_main!(benches);
