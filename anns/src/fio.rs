//! File and mapping primitives shared by every on-disk component.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::ops::Deref;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::path::Path;

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::error::{Error, Result};

/// Create a file of exactly `len` bytes, truncating any previous content.
pub fn create_sized<P: AsRef<Path>>(path: P, len: u64) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(len)?;
    Ok(file)
}

/// Open read-write with an exclusive advisory lock; a second writer fails
/// fast with `Busy`. `direct` bypasses the page cache.
pub fn open_rw<P: AsRef<Path>>(path: P, create: bool, direct: bool) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(create);
    if direct {
        options.custom_flags(libc::O_DIRECT);
    }
    let file = options.open(&path)?;
    try_lock_exclusive(&file, path.as_ref())?;
    Ok(file)
}

pub fn open_ro<P: AsRef<Path>>(path: P) -> Result<File> {
    Ok(File::open(path)?)
}

pub fn try_lock_exclusive(file: &File, path: &Path) -> Result<()> {
    fs2::FileExt::try_lock_exclusive(file).map_err(|err| {
        if err.kind() == fs2::lock_contended_error().kind() {
            Error::Busy(format!("{} is locked by another writer", path.display()))
        } else {
            Error::Io(err)
        }
    })
}

pub fn try_lock_shared(file: &File, path: &Path) -> Result<()> {
    fs2::FileExt::try_lock_shared(file).map_err(|err| {
        if err.kind() == fs2::lock_contended_error().kind() {
            Error::Busy(format!("{} is locked exclusively", path.display()))
        } else {
            Error::Io(err)
        }
    })
}

pub fn unlock(file: &File) -> Result<()> {
    file.unlock()?;
    Ok(())
}

pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    file.read_exact_at(buf, offset)?;
    Ok(())
}

pub fn write_all_at(file: &File, buf: &[u8], offset: u64) -> Result<()> {
    file.write_all_at(buf, offset)?;
    Ok(())
}

pub fn truncate(file: &File, len: u64) -> Result<()> {
    file.set_len(len)?;
    Ok(())
}

pub fn fsync(file: &File) -> Result<()> {
    file.sync_all()?;
    Ok(())
}

/// Map a file read-only. `populate` prefaults the pages at map time,
/// `warm` additionally walks the mapping to force residency before
/// returning.
pub fn map_ro(file: &File, populate: bool, warm: bool) -> Result<Mmap> {
    let mut options = MmapOptions::new();
    if populate {
        options.populate();
    }
    let map = unsafe { options.map(file)? };
    if warm {
        warmup(&map);
    }
    Ok(map)
}

pub fn map_rw(file: &File) -> Result<MmapMut> {
    let map = unsafe { MmapMut::map_mut(file)? };
    Ok(map)
}

/// Pin a mapping into RAM (best effort; not all environments allow it).
pub fn lock_in_ram(map: &Mmap) -> Result<()> {
    map.lock()?;
    Ok(())
}

/// Touch one byte per page so the kernel faults the region in.
pub fn warmup(data: &[u8]) {
    const PAGE: usize = 4096;
    let mut acc = 0u8;
    let mut offset = 0;
    while offset < data.len() {
        acc ^= data[offset];
        offset += PAGE;
    }
    std::hint::black_box(acc);
}

/// Atomically replace `path` with `content` (write-to-temp, rename, sync).
pub fn rewrite_atomic<P: AsRef<Path>>(path: P, content: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let parent = path
        .parent()
        .ok_or_else(|| Error::InvalidArgument(format!("{} has no parent", path.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| Error::Io(err.error))?;
    fsync_dir(parent)
}

/// Rename and make the move durable by syncing the destination's parent.
pub fn atomic_rename<P: AsRef<Path>, Q: AsRef<Path>>(src: P, dst: Q) -> Result<()> {
    fs::rename(&src, &dst)?;
    if let Some(parent) = dst.as_ref().parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}

pub fn fsync_dir<P: AsRef<Path>>(path: P) -> Result<()> {
    let dir = File::open(path.as_ref())?;
    dir.sync_all()?;
    Ok(())
}

pub fn mkdir_all<P: AsRef<Path>>(path: P) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn rmdir_all<P: AsRef<Path>>(path: P) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::Io(err)),
    }
}

/// Whether two paths resolve to the same inode.
pub fn same_file<P: AsRef<Path>, Q: AsRef<Path>>(a: P, b: Q) -> Result<bool> {
    let (ma, mb) = (fs::metadata(a)?, fs::metadata(b)?);
    Ok(ma.dev() == mb.dev() && ma.ino() == mb.ino())
}

/// Read-only bytes, either mapped or heap-resident.
///
/// Empty files come back heap-resident: a zero-length mmap is an error on
/// most platforms.
pub enum Blob {
    Mapped(Mmap),
    Heap(Vec<u8>),
}

impl Blob {
    pub fn load<P: AsRef<Path>>(path: P, use_mmap: bool, warm: bool) -> Result<Blob> {
        if !use_mmap {
            return Ok(Blob::Heap(fs::read(path)?));
        }
        let file = open_ro(&path)?;
        if file.metadata()?.len() == 0 {
            return Ok(Blob::Heap(Vec::new()));
        }
        Ok(Blob::Mapped(map_ro(&file, false, warm)?))
    }

    pub fn len(&self) -> usize {
        self.deref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Deref for Blob {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Blob::Mapped(map) => map,
            Blob::Heap(vec) => vec,
        }
    }
}
