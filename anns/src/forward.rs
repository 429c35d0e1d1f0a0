//! Forward store: doc id -> (primary key, lsn, attribute values).
//!
//! Two files per segment: `fwd.data` is the append-only concatenation of
//! compressed records, `fwd.idx` the fixed-width offset array giving O(1)
//! random reads. While the segment is writing, offsets live in memory and
//! reads go through positional I/O; once persisted both files are mapped
//! (or heap-loaded) and a fetch is slice arithmetic.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fio::{self, Blob};
use crate::meta::{FwdValue, Lsn, PrimaryKey};

pub const DATA_FILE: &str = "fwd.data";
pub const IDX_FILE: &str = "fwd.idx";

const ZSTD_LEVEL: i32 = 2;

/// The stored row: forward attributes plus the identity fields needed to
/// rebuild the primary-key map and answer queries with per-row LSNs.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ForwardRecord {
    pub primary_key: PrimaryKey,
    pub lsn: Lsn,
    pub values: Vec<FwdValue>,
}

pub struct ForwardStore {
    /// Rows readable right now; published with release ordering after the
    /// offset array is updated.
    visible: AtomicU32,
    inner: RwLock<ForwardInner>,
}

enum ForwardInner {
    Writing(WritingForward),
    Persist(PersistForward),
}

struct WritingForward {
    file: File,
    offsets: Vec<u64>,
    tail: u64,
}

struct PersistForward {
    data: Blob,
    idx: Blob,
    count: u32,
}

impl ForwardStore {
    /// Start an empty store under a segment's building directory.
    pub fn create_writing<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let file = fio::open_rw(dir.as_ref().join(DATA_FILE), true, false)?;
        fio::truncate(&file, 0)?;
        Ok(Self {
            visible: AtomicU32::new(0),
            inner: RwLock::new(ForwardInner::Writing(WritingForward {
                file,
                offsets: Vec::new(),
                tail: 0,
            })),
        })
    }

    pub fn open_persist<P: AsRef<Path>>(dir: P, use_mmap: bool, warm: bool) -> Result<Self> {
        let persist = PersistForward::open(dir.as_ref(), use_mmap, warm)?;
        let count = persist.count;
        Ok(Self {
            visible: AtomicU32::new(count),
            inner: RwLock::new(ForwardInner::Persist(persist)),
        })
    }

    pub fn count(&self) -> u32 {
        self.visible.load(Ordering::Acquire)
    }

    /// Append one record; single-writer. Returns the local doc offset.
    pub fn append(&self, record: &ForwardRecord) -> Result<u32> {
        let mut inner = self.inner.write().expect("forward lock poisoned");
        let writing = match &mut *inner {
            ForwardInner::Writing(w) => w,
            ForwardInner::Persist(_) => {
                return Err(Error::Internal("append to a persisted forward store".to_string()))
            }
        };
        let encoded = encode_record(record)?;
        fio::write_all_at(&writing.file, &encoded, writing.tail)?;
        writing.offsets.push(writing.tail);
        writing.tail += encoded.len() as u64;
        let visible = writing.offsets.len() as u32;
        drop(inner);
        self.visible.store(visible, Ordering::Release);
        Ok(visible - 1)
    }

    /// `None` when `local` is not yet visible.
    pub fn fetch(&self, local: u32) -> Result<Option<ForwardRecord>> {
        if local >= self.visible.load(Ordering::Acquire) {
            return Ok(None);
        }
        let inner = self.inner.read().expect("forward lock poisoned");
        match &*inner {
            ForwardInner::Writing(w) => {
                let start = w.offsets[local as usize];
                let end = w
                    .offsets
                    .get(local as usize + 1)
                    .copied()
                    .unwrap_or(w.tail);
                let mut buf = vec![0u8; (end - start) as usize];
                fio::read_exact_at(&w.file, &mut buf, start)?;
                Ok(Some(decode_record(&buf)?))
            }
            ForwardInner::Persist(p) => p.fetch(local).map(Some),
        }
    }

    /// Fsync the data file and write the offset index next to it.
    /// Returns `(data_len, idx_len)` for the segment manifest.
    pub fn seal_to_disk<P: AsRef<Path>>(&self, dir: P) -> Result<(u64, u64)> {
        let inner = self.inner.read().expect("forward lock poisoned");
        let writing = match &*inner {
            ForwardInner::Writing(w) => w,
            ForwardInner::Persist(_) => {
                return Err(Error::Internal("sealing a persisted forward store".to_string()))
            }
        };
        fio::fsync(&writing.file)?;

        let mut idx = vec![0u8; writing.offsets.len() * 8];
        for (i, offset) in writing.offsets.iter().enumerate() {
            LittleEndian::write_u64(&mut idx[i * 8..], *offset);
        }
        let idx_file = fio::create_sized(dir.as_ref().join(IDX_FILE), 0)?;
        fio::write_all_at(&idx_file, &idx, 0)?;
        fio::fsync(&idx_file)?;
        Ok((writing.tail, idx.len() as u64))
    }

    /// Swap to the persisted representation under `dir` (post-rename path),
    /// releasing the writing-side file and offsets.
    pub fn promote<P: AsRef<Path>>(&self, dir: P, use_mmap: bool, warm: bool) -> Result<()> {
        let persist = PersistForward::open(dir.as_ref(), use_mmap, warm)?;
        let mut inner = self.inner.write().expect("forward lock poisoned");
        if persist.count != self.visible.load(Ordering::Acquire) {
            return Err(Error::Integrity(format!(
                "forward promote count mismatch: {} on disk, {} in memory",
                persist.count,
                self.visible.load(Ordering::Acquire)
            )));
        }
        *inner = ForwardInner::Persist(persist);
        Ok(())
    }
}

impl PersistForward {
    fn open(dir: &Path, use_mmap: bool, warm: bool) -> Result<Self> {
        let data = Blob::load(dir.join(DATA_FILE), use_mmap, warm)?;
        let idx = Blob::load(dir.join(IDX_FILE), use_mmap, warm)?;
        if idx.len() % 8 != 0 {
            return Err(Error::Integrity(format!(
                "forward index in {} has a ragged length {}",
                dir.display(),
                idx.len()
            )));
        }
        Ok(Self {
            count: (idx.len() / 8) as u32,
            data,
            idx,
        })
    }

    fn fetch(&self, local: u32) -> Result<ForwardRecord> {
        let start = LittleEndian::read_u64(&self.idx[local as usize * 8..]) as usize;
        let end = if local + 1 < self.count {
            LittleEndian::read_u64(&self.idx[(local as usize + 1) * 8..]) as usize
        } else {
            self.data.len()
        };
        if start > end || end > self.data.len() {
            return Err(Error::Integrity(format!(
                "forward offsets out of bounds for doc {local}"
            )));
        }
        decode_record(&self.data[start..end])
    }
}

fn encode_record(record: &ForwardRecord) -> Result<Vec<u8>> {
    let plain = bincode::serialize(record)?;
    Ok(zstd::stream::encode_all(plain.as_slice(), ZSTD_LEVEL)?)
}

fn decode_record(buf: &[u8]) -> Result<ForwardRecord> {
    let plain = zstd::stream::decode_all(buf)?;
    Ok(bincode::deserialize(&plain)?)
}

/// Scan every record of a persisted store, oldest first. Used to rebuild
/// the primary-key map at open.
pub fn scan_all(store: &ForwardStore) -> Result<Vec<ForwardRecord>> {
    let mut records = Vec::with_capacity(store.count() as usize);
    for local in 0..store.count() {
        match store.fetch(local)? {
            Some(record) => records.push(record),
            None => {
                return Err(Error::Integrity(format!(
                    "forward record {local} vanished during scan"
                )))
            }
        }
    }
    Ok(records)
}
