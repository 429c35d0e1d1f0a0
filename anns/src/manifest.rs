//! Collection manifest: schema snapshot, per-collection epoch magic and
//! the persisted-segment index, replaced atomically on every change.
//!
//! A sibling lock file enforces the single-writer-per-collection rule for
//! the lifetime of an open handle; the manifest itself is swapped by
//! rename, so the lock cannot live on its inode.

use std::collections::hash_map::DefaultHasher;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::codec::{self, BlockKind};
use crate::error::{Error, Result};
use crate::fio;
use crate::meta::CollectionSchema;

pub const MANIFEST_FILE: &str = "manifest";
pub const LOCK_FILE: &str = "manifest.lock";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    /// Anti-misrouting epoch minted when the collection was created;
    /// write batches must echo it.
    pub magic: u64,
    pub schema: CollectionSchema,
    pub next_segment_id: u64,
    pub next_min_doc_id: u32,
    /// Ids of fully persisted segments, in creation order.
    pub persisted_segments: Vec<u64>,
}

impl Manifest {
    pub fn new(magic: u64, schema: CollectionSchema) -> Self {
        Self {
            magic,
            schema,
            next_segment_id: 0,
            next_min_doc_id: 0,
            persisted_segments: Vec::new(),
        }
    }
}

/// Open handle on a collection's manifest; holds the writer lock.
pub struct ManifestFile {
    dir: PathBuf,
    _lock: File,
}

impl ManifestFile {
    pub fn create(dir: &Path, manifest: &Manifest) -> Result<Self> {
        if dir.join(MANIFEST_FILE).exists() {
            return Err(Error::AlreadyExists(format!(
                "collection at {} already has a manifest",
                dir.display()
            )));
        }
        let lock = fio::open_rw(dir.join(LOCK_FILE), true, false)?;
        let handle = Self {
            dir: dir.to_path_buf(),
            _lock: lock,
        };
        handle.store(manifest)?;
        Ok(handle)
    }

    pub fn open(dir: &Path) -> Result<(Self, Manifest)> {
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "no manifest under {}",
                dir.display()
            )));
        }
        let lock = fio::open_rw(dir.join(LOCK_FILE), true, false)?;
        let buf = std::fs::read(&path)?;
        let manifest: Manifest = codec::read_bincode_block(&buf, BlockKind::Manifest)?;
        Ok((
            Self {
                dir: dir.to_path_buf(),
                _lock: lock,
            },
            manifest,
        ))
    }

    pub fn store(&self, manifest: &Manifest) -> Result<()> {
        let mut buf = Vec::new();
        codec::write_bincode_block(&mut buf, BlockKind::Manifest, manifest)?;
        fio::rewrite_atomic(self.dir.join(MANIFEST_FILE), &buf)
    }
}

/// Per-collection epoch: creation time folded with the collection name.
pub fn mint_magic(name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    hasher.finish() ^ nanos
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{IndexColumnSpec, MetricKind, VectorType};
    use tempdir::TempDir;

    fn schema() -> CollectionSchema {
        CollectionSchema {
            name: "faces".to_string(),
            revision: 0,
            max_docs_per_segment: 900,
            forward_columns: Vec::new(),
            index_columns: vec![IndexColumnSpec::graph(
                "face",
                VectorType::Fp32,
                16,
                MetricKind::SquaredEuclidean,
            )],
        }
    }

    #[test]
    fn create_store_open_round_trip() {
        let dir = TempDir::new("manifest").unwrap();
        let magic = mint_magic("faces");
        let mut manifest = Manifest::new(magic, schema());

        let handle = ManifestFile::create(dir.path(), &manifest).unwrap();
        manifest.persisted_segments.push(0);
        manifest.next_segment_id = 1;
        manifest.next_min_doc_id = 1800;
        handle.store(&manifest).unwrap();
        drop(handle);

        let (_handle, loaded) = ManifestFile::open(dir.path()).unwrap();
        assert_eq!(loaded.magic, magic);
        assert_eq!(loaded.persisted_segments, vec![0]);
        assert_eq!(loaded.next_min_doc_id, 1800);
        assert_eq!(loaded.schema, schema());
    }

    #[test]
    fn create_refuses_existing_collection() {
        let dir = TempDir::new("manifest").unwrap();
        let manifest = Manifest::new(1, schema());
        let handle = ManifestFile::create(dir.path(), &manifest).unwrap();
        drop(handle);
        assert!(matches!(
            ManifestFile::create(dir.path(), &manifest),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn second_writer_is_locked_out() {
        let dir = TempDir::new("manifest").unwrap();
        let manifest = Manifest::new(1, schema());
        let _handle = ManifestFile::create(dir.path(), &manifest).unwrap();
        assert!(matches!(
            ManifestFile::open(dir.path()),
            Err(Error::Busy(_))
        ));
    }

    #[test]
    fn magic_is_name_and_time_dependent() {
        assert_ne!(mint_magic("a"), mint_magic("b"));
    }
}
