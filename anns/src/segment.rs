//! Segment: one contiguous doc-id range of a collection, bundling the
//! delete map, the forward store and one vector index per column.
//!
//! Lifecycle: WRITING (in-memory builders, forwards streamed under
//! `building/`) -> DUMPING (background flush builds the persisted files)
//! -> PERSIST (immutable apart from delete bits). Deletes land in the
//! owning segment's delete map in any state.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::codec::{self, BlockKind};
use crate::column::{self, ColumnIndexer};
use crate::delete_map::DeleteMap;
use crate::error::{Error, Result};
use crate::fio;
use crate::forward::{ForwardRecord, ForwardStore};
use crate::meta::{CollectionSchema, DocId, FwdValue, Lsn, PrimaryKey};
use crate::records::{QueryParams, QueryResult};

pub const SEGMENT_META_FILE: &str = "segment.meta";
pub const DELETE_MAP_FILE: &str = "delete.map";
pub const BUILDING_DIR: &str = "building";

pub fn segment_dir_name(id: u64) -> String {
    format!("seg-{id}")
}

pub fn column_file_name(column: &str) -> String {
    format!("col-{column}.idx")
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum SegmentState {
    Writing,
    Dumping,
    Persist,
    Faulted,
}

const STATE_WRITING: u8 = 0;
const STATE_DUMPING: u8 = 1;
const STATE_PERSIST: u8 = 2;
const STATE_FAULTED: u8 = 3;

fn state_from_u8(raw: u8) -> SegmentState {
    match raw {
        STATE_WRITING => SegmentState::Writing,
        STATE_DUMPING => SegmentState::Dumping,
        STATE_PERSIST => SegmentState::Persist,
        _ => SegmentState::Faulted,
    }
}

/// Durable per-segment metadata, one `segment.meta` block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub segment_id: u64,
    pub min_doc_id: DocId,
    pub doc_count: u32,
    pub min_lsn: Lsn,
    pub max_lsn: Lsn,
    pub min_primary_key: PrimaryKey,
    pub max_primary_key: PrimaryKey,
    pub index_files: Vec<(String, u64)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SegmentStats {
    pub segment_id: u64,
    pub state: SegmentState,
    pub doc_count: u32,
    pub delete_count: u32,
    pub min_doc_id: DocId,
    pub max_doc_id: DocId,
    pub min_primary_key: PrimaryKey,
    pub max_primary_key: PrimaryKey,
    pub min_lsn: Lsn,
    pub max_lsn: Lsn,
    pub index_file_count: usize,
    pub index_file_size: u64,
    pub error: Option<String>,
}

struct ColumnSlot {
    spec: crate::meta::IndexColumnSpec,
    index: RwLock<ColumnIndexer>,
}

pub struct Segment {
    collection: String,
    id: u64,
    schema: Arc<CollectionSchema>,
    min_doc_id: DocId,
    state: AtomicU8,
    doc_count: AtomicU32,
    min_lsn: AtomicU64,
    max_lsn: AtomicU64,
    min_pk: AtomicU64,
    max_pk: AtomicU64,
    deletes: RwLock<DeleteMap>,
    forward: ForwardStore,
    columns: Vec<ColumnSlot>,
    index_files: RwLock<Vec<(String, u64)>>,
    fault: RwLock<Option<String>>,
    dir: RwLock<PathBuf>,
}

impl Segment {
    /// Start an empty WRITING segment under `<root>/building/seg-<id>`.
    pub fn create_writing(
        root: &Path,
        collection: &str,
        id: u64,
        min_doc_id: DocId,
        schema: Arc<CollectionSchema>,
    ) -> Result<Arc<Segment>> {
        let dir = root.join(BUILDING_DIR).join(segment_dir_name(id));
        fio::mkdir_all(&dir)?;
        let forward = ForwardStore::create_writing(&dir)?;
        let mut columns = Vec::with_capacity(schema.index_columns.len());
        for spec in &schema.index_columns {
            columns.push(ColumnSlot {
                spec: spec.clone(),
                index: RwLock::new(ColumnIndexer::new(spec)?),
            });
        }
        log::debug!("collection {collection}: segment {id} writing from doc {min_doc_id}");
        Ok(Arc::new(Segment {
            collection: collection.to_string(),
            id,
            schema,
            min_doc_id,
            state: AtomicU8::new(STATE_WRITING),
            doc_count: AtomicU32::new(0),
            min_lsn: AtomicU64::new(u64::MAX),
            max_lsn: AtomicU64::new(0),
            min_pk: AtomicU64::new(u64::MAX),
            max_pk: AtomicU64::new(0),
            deletes: RwLock::new(DeleteMap::new_mem()),
            forward,
            columns,
            index_files: RwLock::new(Vec::new()),
            fault: RwLock::new(None),
            dir: RwLock::new(dir),
        }))
    }

    /// Open a persisted segment directory.
    pub fn open_persist(
        root: &Path,
        collection: &str,
        schema: Arc<CollectionSchema>,
        id: u64,
        use_mmap: bool,
        warm: bool,
    ) -> Result<Arc<Segment>> {
        let dir = root.join(segment_dir_name(id));
        let meta_buf = std::fs::read(dir.join(SEGMENT_META_FILE))?;
        let meta: SegmentMeta = codec::read_bincode_block(&meta_buf, BlockKind::SegmentMeta)?;
        if meta.segment_id != id {
            return Err(Error::Integrity(format!(
                "segment dir {} holds meta for segment {}",
                dir.display(),
                meta.segment_id
            )));
        }

        let forward = ForwardStore::open_persist(&dir, use_mmap, warm)?;
        if forward.count() != meta.doc_count {
            return Err(Error::Integrity(format!(
                "segment {id}: forward store has {} rows, meta says {}",
                forward.count(),
                meta.doc_count
            )));
        }

        let mut columns = Vec::with_capacity(schema.index_columns.len());
        for spec in &schema.index_columns {
            let blob = std::fs::read(dir.join(column_file_name(&spec.name)))?;
            let indexer = ColumnIndexer::load(spec, &blob)?;
            if indexer.len() != meta.doc_count as usize {
                return Err(Error::Integrity(format!(
                    "segment {id}: column {} indexes {} rows, meta says {}",
                    spec.name,
                    indexer.len(),
                    meta.doc_count
                )));
            }
            columns.push(ColumnSlot {
                spec: spec.clone(),
                index: RwLock::new(indexer),
            });
        }

        let deletes = crate::delete_map::MappedDeleteMap::open(dir.join(DELETE_MAP_FILE))?;

        Ok(Arc::new(Segment {
            collection: collection.to_string(),
            id,
            schema,
            min_doc_id: meta.min_doc_id,
            state: AtomicU8::new(STATE_PERSIST),
            doc_count: AtomicU32::new(meta.doc_count),
            min_lsn: AtomicU64::new(meta.min_lsn),
            max_lsn: AtomicU64::new(meta.max_lsn),
            min_pk: AtomicU64::new(meta.min_primary_key),
            max_pk: AtomicU64::new(meta.max_primary_key),
            deletes: RwLock::new(DeleteMap::Mapped(deletes)),
            forward,
            columns,
            index_files: RwLock::new(meta.index_files),
            fault: RwLock::new(None),
            dir: RwLock::new(dir),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Schema snapshot this segment was built against.
    pub fn schema(&self) -> Arc<CollectionSchema> {
        Arc::clone(&self.schema)
    }

    pub fn state(&self) -> SegmentState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn doc_count(&self) -> u32 {
        self.doc_count.load(Ordering::Acquire)
    }

    pub fn delete_count(&self) -> u32 {
        self.deletes
            .read()
            .expect("delete map lock poisoned")
            .cardinality()
    }

    pub fn min_doc_id(&self) -> DocId {
        self.min_doc_id
    }

    /// Highest assigned doc id; equals `min_doc_id` while empty.
    pub fn max_doc_id(&self) -> DocId {
        self.min_doc_id + self.doc_count().saturating_sub(1)
    }

    pub fn max_lsn(&self) -> Lsn {
        self.max_lsn.load(Ordering::Relaxed)
    }

    /// Whether `doc_id` falls in this segment's assigned range.
    pub fn owns_doc(&self, doc_id: DocId) -> bool {
        doc_id >= self.min_doc_id && doc_id < self.min_doc_id + self.doc_count()
    }

    /// Append one row; single-writer, vectors already decoded and
    /// validated. Returns the assigned doc id.
    pub fn append_row(
        &self,
        primary_key: PrimaryKey,
        lsn: Lsn,
        values: Vec<FwdValue>,
        vectors: &[Vec<f32>],
    ) -> Result<DocId> {
        if self.state.load(Ordering::Acquire) != STATE_WRITING {
            return Err(Error::Internal(format!(
                "append to segment {} in state {:?}",
                self.id,
                self.state()
            )));
        }
        if vectors.len() != self.columns.len() {
            return Err(Error::Internal(format!(
                "row carries {} vectors for {} columns",
                vectors.len(),
                self.columns.len()
            )));
        }

        let local = self.doc_count.load(Ordering::Relaxed);
        {
            let mut deletes = self.deletes.write().expect("delete map lock poisoned");
            if let DeleteMap::Mem(mem) = &mut *deletes {
                mem.ensure_capacity(local + 1);
            }
        }

        let appended = self.forward.append(&ForwardRecord {
            primary_key,
            lsn,
            values,
        })?;
        if appended != local {
            return Err(Error::Internal(format!(
                "forward offset {appended} diverged from doc count {local}"
            )));
        }
        for (slot, vector) in self.columns.iter().zip(vectors) {
            slot.index
                .write()
                .expect("column lock poisoned")
                .add(local, vector)?;
        }

        self.min_lsn.fetch_min(lsn, Ordering::Relaxed);
        self.max_lsn.fetch_max(lsn, Ordering::Relaxed);
        self.min_pk.fetch_min(primary_key, Ordering::Relaxed);
        self.max_pk.fetch_max(primary_key, Ordering::Relaxed);
        self.doc_count.store(local + 1, Ordering::Release);
        Ok(self.min_doc_id + local)
    }

    /// Tombstone `doc_id`, in any state. `Ok(true)` when the bit flipped.
    pub fn delete_doc(&self, doc_id: DocId, lsn: Lsn) -> Result<bool> {
        if !self.owns_doc(doc_id) {
            return Err(Error::Internal(format!(
                "segment {} does not own doc {doc_id}",
                self.id
            )));
        }
        let newly = self
            .deletes
            .read()
            .expect("delete map lock poisoned")
            .set(doc_id - self.min_doc_id)?;
        self.max_lsn.fetch_max(lsn, Ordering::Relaxed);
        Ok(newly)
    }

    pub fn is_deleted(&self, doc_id: DocId) -> bool {
        if !self.owns_doc(doc_id) {
            return false;
        }
        self.deletes
            .read()
            .expect("delete map lock poisoned")
            .test(doc_id - self.min_doc_id)
    }

    /// Flip WRITING -> DUMPING and freeze the column builders.
    pub fn seal(&self) -> Result<()> {
        self.state
            .compare_exchange(
                STATE_WRITING,
                STATE_DUMPING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|actual| {
                Error::Internal(format!(
                    "sealing segment {} in state {:?}",
                    self.id,
                    state_from_u8(actual)
                ))
            })?;
        for slot in &self.columns {
            slot.index.write().expect("column lock poisoned").seal();
        }
        log::debug!(
            "collection {}: segment {} sealed with {} docs",
            self.collection,
            self.id,
            self.doc_count()
        );
        Ok(())
    }

    /// Build the persisted files, atomically promote the directory and
    /// swap the in-memory representations. Runs on a pool worker; safe to
    /// retry after a failed attempt.
    pub fn dump(&self, root: &Path, use_mmap: bool, warm: bool) -> Result<Vec<(String, u64)>> {
        if self.state.load(Ordering::Acquire) != STATE_DUMPING {
            return Err(Error::Internal(format!(
                "dump of segment {} in state {:?}",
                self.id,
                self.state()
            )));
        }
        let building_dir = self.dir.read().expect("dir lock poisoned").clone();
        let final_dir = root.join(segment_dir_name(self.id));

        if building_dir.exists() {
            self.write_building_files(&building_dir)?;
            // Bits set between persist and the mapped swap must not be
            // lost, so the whole promotion happens under the write lock.
            let mut deletes = self.deletes.write().expect("delete map lock poisoned");
            match &*deletes {
                DeleteMap::Mem(mem) => {
                    mem.persist(building_dir.join(DELETE_MAP_FILE))?;
                }
                DeleteMap::Mapped(_) => {
                    return Err(Error::Internal(format!(
                        "segment {} delete map already mapped before rename",
                        self.id
                    )))
                }
            }
            fio::atomic_rename(&building_dir, &final_dir)?;
            let mapped =
                crate::delete_map::MappedDeleteMap::open(final_dir.join(DELETE_MAP_FILE))?;
            *deletes = DeleteMap::Mapped(mapped);
        } else {
            // Retry resumed past the rename. The in-memory map holds a
            // superset of the renamed file's bits; rewrite it before the
            // swap so nothing set in between goes missing.
            let mut deletes = self.deletes.write().expect("delete map lock poisoned");
            if let DeleteMap::Mem(mem) = &*deletes {
                mem.persist(final_dir.join(DELETE_MAP_FILE))?;
                let mapped =
                    crate::delete_map::MappedDeleteMap::open(final_dir.join(DELETE_MAP_FILE))?;
                *deletes = DeleteMap::Mapped(mapped);
            }
        }

        self.forward.promote(&final_dir, use_mmap, warm)?;
        for slot in &self.columns {
            let blob = std::fs::read(final_dir.join(column_file_name(&slot.spec.name)))?;
            let loaded = ColumnIndexer::load(&slot.spec, &blob)?;
            *slot.index.write().expect("column lock poisoned") = loaded;
        }

        let meta_buf = std::fs::read(final_dir.join(SEGMENT_META_FILE))?;
        let meta: SegmentMeta = codec::read_bincode_block(&meta_buf, BlockKind::SegmentMeta)?;
        let files = meta.index_files.clone();
        *self.index_files.write().expect("index files lock poisoned") = files.clone();
        *self.dir.write().expect("dir lock poisoned") = final_dir;
        self.state.store(STATE_PERSIST, Ordering::Release);
        log::debug!(
            "collection {}: segment {} persisted ({} docs)",
            self.collection,
            self.id,
            self.doc_count()
        );
        Ok(files)
    }

    fn write_building_files(&self, building_dir: &Path) -> Result<Vec<(String, u64)>> {
        self.forward.seal_to_disk(building_dir)?;

        let mut files = Vec::with_capacity(self.columns.len());
        for slot in &self.columns {
            let name = column_file_name(&slot.spec.name);
            let file = fio::create_sized(building_dir.join(&name), 0)?;
            let mut writer = std::io::BufWriter::new(&file);
            let size = slot
                .index
                .read()
                .expect("column lock poisoned")
                .write_to(&mut writer)?;
            std::io::Write::flush(&mut writer)?;
            drop(writer);
            fio::fsync(&file)?;
            files.push((name, size));
        }

        let meta = SegmentMeta {
            segment_id: self.id,
            min_doc_id: self.min_doc_id,
            doc_count: self.doc_count(),
            min_lsn: self.min_lsn.load(Ordering::Relaxed),
            max_lsn: self.max_lsn.load(Ordering::Relaxed),
            min_primary_key: self.min_pk.load(Ordering::Relaxed),
            max_primary_key: self.max_pk.load(Ordering::Relaxed),
            index_files: files.clone(),
        };
        let mut buf = Vec::new();
        codec::write_bincode_block(&mut buf, BlockKind::SegmentMeta, &meta)?;
        let meta_file = fio::create_sized(building_dir.join(SEGMENT_META_FILE), 0)?;
        fio::write_all_at(&meta_file, &buf, 0)?;
        fio::fsync(&meta_file)?;

        fio::fsync_dir(building_dir)?;
        Ok(files)
    }

    /// Search one column; delete-filtered, forwards resolved, best first.
    pub fn knn_search(
        &self,
        column_name: &str,
        query_bytes: &[u8],
        params: &QueryParams,
    ) -> Result<Vec<QueryResult>> {
        let slot = self
            .columns
            .iter()
            .find(|slot| slot.spec.name == column_name)
            .ok_or_else(|| Error::UnknownColumn(column_name.to_string()))?;
        let query = column::decode_query(&slot.spec, params, query_bytes)?;
        if params.topk == 0 {
            return Ok(Vec::new());
        }
        let visible = self.doc_count();
        if visible == 0 {
            return Ok(Vec::new());
        }

        // Oversample by the current tombstone count so filtering still
        // leaves topk live candidates when enough exist.
        let deleted = self.delete_count();
        let fetch = (params.topk as usize + deleted as usize).min(visible as usize);
        let ef = params.ef_search.map(|ef| ef as usize);
        let candidates = slot
            .index
            .read()
            .expect("column lock poisoned")
            .search(&query, fetch, ef)?;

        let deletes = self.deletes.read().expect("delete map lock poisoned");
        let mut results = Vec::with_capacity(params.topk as usize);
        for (label, score) in candidates {
            if results.len() == params.topk as usize {
                break;
            }
            if deletes.test(label) {
                continue;
            }
            let Some(record) = self.forward.fetch(label)? else {
                continue;
            };
            results.push(QueryResult {
                primary_key: record.primary_key,
                score,
                lsn: record.lsn,
                forward_values: record.values,
            });
        }
        Ok(results)
    }

    /// Fetch the stored record for a doc id this segment owns.
    pub fn fetch_forward(&self, doc_id: DocId) -> Result<Option<ForwardRecord>> {
        if !self.owns_doc(doc_id) {
            return Ok(None);
        }
        self.forward.fetch(doc_id - self.min_doc_id)
    }

    pub fn forward_store(&self) -> &ForwardStore {
        &self.forward
    }

    /// Mark the segment observer-only after dump retries are exhausted.
    pub fn fault(&self, message: String) {
        log::error!(
            "collection {}: segment {} faulted: {message}",
            self.collection,
            self.id
        );
        *self.fault.write().expect("fault lock poisoned") = Some(message);
        self.state.store(STATE_FAULTED, Ordering::Release);
    }

    /// msync outstanding delete bits (PERSIST segments).
    pub fn flush_deletes(&self) -> Result<()> {
        self.deletes
            .read()
            .expect("delete map lock poisoned")
            .flush()
    }

    pub fn stats(&self) -> SegmentStats {
        let doc_count = self.doc_count();
        let (min_lsn, min_pk) = if doc_count == 0 {
            (0, 0)
        } else {
            (
                self.min_lsn.load(Ordering::Relaxed),
                self.min_pk.load(Ordering::Relaxed),
            )
        };
        let index_files = self
            .index_files
            .read()
            .expect("index files lock poisoned")
            .clone();
        SegmentStats {
            segment_id: self.id,
            state: self.state(),
            doc_count,
            delete_count: self.delete_count(),
            min_doc_id: self.min_doc_id,
            max_doc_id: self.max_doc_id(),
            min_primary_key: min_pk,
            max_primary_key: self.max_pk.load(Ordering::Relaxed),
            min_lsn,
            max_lsn: self.max_lsn.load(Ordering::Relaxed),
            index_file_count: index_files.len(),
            index_file_size: index_files.iter().map(|(_, size)| size).sum(),
            error: self.fault.read().expect("fault lock poisoned").clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{ForwardColumnSpec, IndexColumnSpec, LogicalType, MetricKind, VectorType};
    use bytes::Bytes;
    use tempdir::TempDir;

    fn schema() -> Arc<CollectionSchema> {
        Arc::new(CollectionSchema {
            name: "faces".to_string(),
            revision: 0,
            max_docs_per_segment: 0,
            forward_columns: vec![ForwardColumnSpec {
                name: "note".to_string(),
                logical_type: LogicalType::Bytes,
            }],
            index_columns: vec![IndexColumnSpec::graph(
                "face",
                VectorType::Fp32,
                16,
                MetricKind::SquaredEuclidean,
            )],
        })
    }

    fn note(text: &str) -> Vec<FwdValue> {
        vec![FwdValue::Bytes(Bytes::copy_from_slice(text.as_bytes()))]
    }

    fn vector(i: u32) -> Vec<f32> {
        vec![i as f32; 16]
    }

    fn query_bytes(i: u32) -> Vec<u8> {
        vector(i).iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn params(topk: u32) -> QueryParams {
        QueryParams::new(topk, VectorType::Fp32, 16)
    }

    fn fill(segment: &Segment, n: u32) {
        for i in 0..n {
            let doc = segment
                .append_row(i as u64, i as u64, note("hello"), &[vector(i)])
                .unwrap();
            assert_eq!(doc, segment.min_doc_id() + i);
        }
    }

    #[test]
    fn write_and_search_in_memory() {
        let dir = TempDir::new("seg").unwrap();
        let segment = Segment::create_writing(dir.path(), "faces", 0, 0, schema()).unwrap();
        fill(&segment, 300);

        assert_eq!(segment.state(), SegmentState::Writing);
        assert_eq!(segment.doc_count(), 300);
        assert_eq!(segment.max_doc_id(), 299);

        let results = segment
            .knn_search("face", &query_bytes(123), &params(10))
            .unwrap();
        assert_eq!(results.len(), 10);
        assert_eq!(results[0].primary_key, 123);
        assert_eq!(results[0].score, 0.0);
        assert_eq!(results[0].lsn, 123);
        assert_eq!(results[0].forward_values, note("hello"));
    }

    #[test]
    fn unknown_column_and_zero_topk() {
        let dir = TempDir::new("seg").unwrap();
        let segment = Segment::create_writing(dir.path(), "faces", 0, 0, schema()).unwrap();
        fill(&segment, 10);

        assert!(matches!(
            segment.knn_search("nose", &query_bytes(1), &params(5)),
            Err(Error::UnknownColumn(_))
        ));
        assert!(segment
            .knn_search("face", &query_bytes(1), &params(0))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn topk_above_live_count_returns_live_only() {
        let dir = TempDir::new("seg").unwrap();
        let segment = Segment::create_writing(dir.path(), "faces", 0, 0, schema()).unwrap();
        fill(&segment, 20);
        for doc in 0..5 {
            segment.delete_doc(doc, 100).unwrap();
        }
        let results = segment
            .knn_search("face", &query_bytes(0), &params(100))
            .unwrap();
        assert_eq!(results.len(), 15);
        assert!(results.iter().all(|r| r.primary_key >= 5));
    }

    #[test]
    fn dump_preserves_content_and_filters_deletes() {
        let dir = TempDir::new("seg").unwrap();
        let segment = Segment::create_writing(dir.path(), "faces", 0, 0, schema()).unwrap();
        fill(&segment, 200);
        segment.delete_doc(7, 500).unwrap();

        let before = segment
            .knn_search("face", &query_bytes(42), &params(5))
            .unwrap();

        segment.seal().unwrap();
        assert_eq!(segment.state(), SegmentState::Dumping);
        // Still searchable while dumping.
        assert_eq!(
            segment
                .knn_search("face", &query_bytes(42), &params(5))
                .unwrap(),
            before
        );

        let files = segment.dump(dir.path(), true, false).unwrap();
        assert_eq!(segment.state(), SegmentState::Persist);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "col-face.idx");

        let after = segment
            .knn_search("face", &query_bytes(42), &params(5))
            .unwrap();
        assert_eq!(after, before);

        // Doc 7 stays tombstoned (the forward record itself is untouched),
        // and new deletes land in the mapped bitmap.
        assert!(segment.is_deleted(7));
        assert_eq!(segment.fetch_forward(7).unwrap().unwrap().primary_key, 7);
        segment.delete_doc(8, 501).unwrap();
        assert_eq!(segment.delete_count(), 2);
        let results = segment
            .knn_search("face", &query_bytes(8), &params(3))
            .unwrap();
        assert!(results.iter().all(|r| r.primary_key != 8));
    }

    #[test]
    fn reopen_matches_dumped_segment() {
        let dir = TempDir::new("seg").unwrap();
        let segment = Segment::create_writing(dir.path(), "faces", 3, 1800, schema()).unwrap();
        for i in 0..50u32 {
            segment
                .append_row(900 + i as u64, i as u64, note("hello"), &[vector(i)])
                .unwrap();
        }
        segment.seal().unwrap();
        segment.dump(dir.path(), true, false).unwrap();
        let stats = segment.stats();
        drop(segment);

        let reopened =
            Segment::open_persist(dir.path(), "faces", schema(), 3, true, false).unwrap();
        assert_eq!(reopened.stats(), stats);
        assert_eq!(reopened.min_doc_id(), 1800);
        assert_eq!(reopened.max_doc_id(), 1849);

        let results = reopened
            .knn_search("face", &query_bytes(10), &params(1))
            .unwrap();
        assert_eq!(results[0].primary_key, 910);
        assert_eq!(results[0].score, 0.0);
    }

    #[test]
    fn sealed_segment_rejects_appends() {
        let dir = TempDir::new("seg").unwrap();
        let segment = Segment::create_writing(dir.path(), "faces", 0, 0, schema()).unwrap();
        fill(&segment, 3);
        segment.seal().unwrap();
        assert!(matches!(
            segment.append_row(99, 99, note("x"), &[vector(99)]),
            Err(Error::Internal(_))
        ));
        assert!(matches!(segment.seal(), Err(Error::Internal(_))));
    }

    #[test]
    fn stats_for_empty_segment_are_zeroed() {
        let dir = TempDir::new("seg").unwrap();
        let segment = Segment::create_writing(dir.path(), "faces", 0, 0, schema()).unwrap();
        let stats = segment.stats();
        assert_eq!(stats.doc_count, 0);
        assert_eq!(stats.min_primary_key, 0);
        assert_eq!(stats.min_lsn, 0);
        assert_eq!(stats.max_lsn, 0);
    }
}
