//! Per-segment tombstone bitset.
//!
//! Bits are sticky: once a doc id is marked deleted it never comes back.
//! The writing-segment variant lives on the heap and grows in 64 Ki-bit
//! buckets; after a segment is persisted the bitset is mapped read-write
//! from its file and bits keep being flipped in place.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::MmapMut;
use serde::{Deserialize, Serialize};

use crate::codec::{self, BlockKind};
use crate::error::{Error, Result};
use crate::fio;

const BUCKET_BITS: u32 = 64 * 1024;
const WORD_BITS: u32 = 64;

/// Word data starts at a fixed offset past the meta block so the mapped
/// `u64` words stay 8-byte aligned.
const DATA_OFFSET: usize = 64;

#[derive(Serialize, Deserialize)]
struct MapMeta {
    bits: u32,
    words: u32,
}

pub enum DeleteMap {
    Mem(MemDeleteMap),
    Mapped(MappedDeleteMap),
}

impl DeleteMap {
    pub fn new_mem() -> Self {
        DeleteMap::Mem(MemDeleteMap::new())
    }

    pub fn test(&self, bit: u32) -> bool {
        match self {
            DeleteMap::Mem(map) => map.test(bit),
            DeleteMap::Mapped(map) => map.test(bit),
        }
    }

    /// Mark `bit` deleted; `Ok(true)` when this call flipped it.
    pub fn set(&self, bit: u32) -> Result<bool> {
        match self {
            DeleteMap::Mem(map) => map.set(bit),
            DeleteMap::Mapped(map) => map.set(bit),
        }
    }

    pub fn cardinality(&self) -> u32 {
        match self {
            DeleteMap::Mem(map) => map.set_count.load(Ordering::Relaxed),
            DeleteMap::Mapped(map) => map.set_count.load(Ordering::Relaxed),
        }
    }

    pub fn capacity(&self) -> u32 {
        match self {
            DeleteMap::Mem(map) => map.capacity(),
            DeleteMap::Mapped(map) => map.bits,
        }
    }

    pub fn flush(&self) -> Result<()> {
        match self {
            DeleteMap::Mem(_) => Ok(()),
            DeleteMap::Mapped(map) => map.flush(),
        }
    }
}

pub struct MemDeleteMap {
    words: Vec<AtomicU64>,
    set_count: AtomicU32,
}

impl MemDeleteMap {
    pub fn new() -> Self {
        Self {
            words: Vec::new(),
            set_count: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.words.len() as u32 * WORD_BITS
    }

    /// Grow to cover `bits`; whole buckets at a time.
    pub fn ensure_capacity(&mut self, bits: u32) {
        if bits <= self.capacity() {
            return;
        }
        let buckets = bits.div_ceil(BUCKET_BITS);
        let words = (buckets * BUCKET_BITS / WORD_BITS) as usize;
        self.words.resize_with(words, || AtomicU64::new(0));
    }

    pub fn test(&self, bit: u32) -> bool {
        let word = (bit / WORD_BITS) as usize;
        match self.words.get(word) {
            Some(w) => w.load(Ordering::Relaxed) & (1u64 << (bit % WORD_BITS)) != 0,
            None => false,
        }
    }

    pub fn set(&self, bit: u32) -> Result<bool> {
        let word = (bit / WORD_BITS) as usize;
        let mask = 1u64 << (bit % WORD_BITS);
        let slot = self
            .words
            .get(word)
            .ok_or_else(|| Error::Internal(format!("delete bit {bit} beyond capacity")))?;
        let prev = slot.fetch_or(mask, Ordering::Relaxed);
        let newly = prev & mask == 0;
        if newly {
            self.set_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(newly)
    }

    /// Write the bitset to `path` (meta block + raw LE words) and fsync.
    ///
    /// The CRC covers only the meta block: word data legitimately keeps
    /// changing after persist, as deletes land in PERSIST segments.
    pub fn persist<P: AsRef<Path>>(&self, path: P) -> Result<u64> {
        let mut header = Vec::with_capacity(DATA_OFFSET);
        codec::write_bincode_block(
            &mut header,
            BlockKind::DeleteMap,
            &MapMeta {
                bits: self.capacity(),
                words: self.words.len() as u32,
            },
        )?;
        if header.len() > DATA_OFFSET {
            return Err(Error::Internal("oversized delete map header".to_string()));
        }
        header.resize(DATA_OFFSET, 0);

        let mut body = vec![0u8; self.words.len() * 8];
        for (i, word) in self.words.iter().enumerate() {
            LittleEndian::write_u64(&mut body[i * 8..], word.load(Ordering::Relaxed));
        }

        let len = (DATA_OFFSET + body.len()) as u64;
        let file = fio::create_sized(&path, len)?;
        fio::write_all_at(&file, &header, 0)?;
        fio::write_all_at(&file, &body, DATA_OFFSET as u64)?;
        fio::fsync(&file)?;
        Ok(len)
    }
}

pub struct MappedDeleteMap {
    // Keeps the exclusive flock alive for the mapping's lifetime.
    _file: File,
    map: MmapMut,
    bits: u32,
    set_count: AtomicU32,
}

impl MappedDeleteMap {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = fio::open_rw(&path, false, false)?;
        let map = fio::map_rw(&file)?;
        if map.len() < DATA_OFFSET {
            return Err(Error::Integrity(format!(
                "delete map {} is shorter than its header",
                path.as_ref().display()
            )));
        }
        let meta: MapMeta = codec::read_bincode_block(&map[..DATA_OFFSET], BlockKind::DeleteMap)?;
        let expected = DATA_OFFSET + meta.words as usize * 8;
        if map.len() != expected {
            return Err(Error::Integrity(format!(
                "delete map {} is {} bytes, expected {expected}",
                path.as_ref().display(),
                map.len()
            )));
        }
        let mut set_count = 0u32;
        for word in 0..meta.words as usize {
            let raw = LittleEndian::read_u64(&map[DATA_OFFSET + word * 8..]);
            set_count += raw.count_ones();
        }
        Ok(Self {
            _file: file,
            map,
            bits: meta.bits,
            set_count: AtomicU32::new(set_count),
        })
    }

    fn word(&self, index: usize) -> &AtomicU64 {
        // The mapping is 8-byte aligned at DATA_OFFSET and lives as long
        // as `self`; atomic ops on it are the whole point of mapping rw.
        unsafe { &*(self.map.as_ptr().add(DATA_OFFSET + index * 8) as *const AtomicU64) }
    }

    pub fn test(&self, bit: u32) -> bool {
        if bit >= self.bits {
            return false;
        }
        let word = self.word((bit / WORD_BITS) as usize);
        word.load(Ordering::Relaxed) & (1u64 << (bit % WORD_BITS)) != 0
    }

    pub fn set(&self, bit: u32) -> Result<bool> {
        if bit >= self.bits {
            return Err(Error::Internal(format!(
                "delete bit {bit} beyond mapped capacity {}",
                self.bits
            )));
        }
        let mask = 1u64 << (bit % WORD_BITS);
        let prev = self
            .word((bit / WORD_BITS) as usize)
            .fetch_or(mask, Ordering::Relaxed);
        let newly = prev & mask == 0;
        if newly {
            self.set_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(newly)
    }

    /// msync the mapping; sets become durable once this returns.
    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn set_is_sticky_and_idempotent() {
        let mut map = MemDeleteMap::new();
        map.ensure_capacity(100);
        assert_eq!(map.capacity(), BUCKET_BITS);
        assert!(!map.test(42));
        assert!(map.set(42).unwrap());
        assert!(!map.set(42).unwrap());
        assert!(map.test(42));
        assert_eq!(map.set_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn growth_keeps_existing_bits() {
        let mut map = MemDeleteMap::new();
        map.ensure_capacity(10);
        map.set(7).unwrap();
        map.ensure_capacity(BUCKET_BITS * 2 + 5);
        assert!(map.test(7));
        assert_eq!(map.capacity(), BUCKET_BITS * 3);
    }

    #[test]
    fn out_of_range_set_is_an_error() {
        let map = MemDeleteMap::new();
        assert!(matches!(map.set(0), Err(Error::Internal(_))));
    }

    #[test]
    fn persist_then_map_preserves_cardinality() {
        let dir = TempDir::new("dmap").unwrap();
        let path = dir.path().join("delete.map");

        let mut mem = MemDeleteMap::new();
        mem.ensure_capacity(1000);
        for bit in (0..1000).step_by(3) {
            mem.set(bit).unwrap();
        }
        let before = mem.set_count.load(Ordering::Relaxed);
        mem.persist(&path).unwrap();

        let mapped = MappedDeleteMap::open(&path).unwrap();
        assert_eq!(mapped.set_count.load(Ordering::Relaxed), before);
        assert!(mapped.test(0));
        assert!(mapped.test(999));
        assert!(!mapped.test(1));
    }

    #[test]
    fn mapped_sets_survive_reopen() {
        let dir = TempDir::new("dmap").unwrap();
        let path = dir.path().join("delete.map");

        let mut mem = MemDeleteMap::new();
        mem.ensure_capacity(64);
        mem.persist(&path).unwrap();

        {
            let mapped = MappedDeleteMap::open(&path).unwrap();
            assert!(mapped.set(13).unwrap());
            assert!(!mapped.set(13).unwrap());
            mapped.flush().unwrap();
        }

        let reopened = MappedDeleteMap::open(&path).unwrap();
        assert!(reopened.test(13));
        assert_eq!(reopened.set_count.load(Ordering::Relaxed), 1);
    }
}
