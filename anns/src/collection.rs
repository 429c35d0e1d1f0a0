//! Collection manager: owns one collection's segments, routes writes,
//! orchestrates background dumps and fans queries out across segments.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use hashbrown::HashMap;

use crate::column;
use crate::error::{Error, Result};
use crate::fio;
use crate::forward;
use crate::lsn::{LsnLog, LSN_LOG_FILE};
use crate::manifest::{mint_magic, Manifest, ManifestFile};
use crate::meta::{CollectionSchema, DocId, Lsn, PrimaryKey};
use crate::pool::{TaskGroup, ThreadPool};
use crate::records::{KnnQuery, OpKind, QueryResult, RowData, RowMeta, WriteBatch, WriteFailure};
use crate::segment::{Segment, SegmentState, SegmentStats, BUILDING_DIR};

const DUMP_ATTEMPTS: u32 = 5;
const DUMP_BACKOFF_BASE: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug)]
pub struct ReadOptions {
    pub use_mmap: bool,
    pub create_new: bool,
    pub warmup: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            use_mmap: true,
            create_new: false,
            warmup: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CollectionStats {
    pub total_doc_count: u64,
    pub delete_doc_count: u64,
    pub total_segment_count: usize,
    pub total_index_file_count: usize,
    pub total_index_file_size: u64,
    pub segments: Vec<SegmentStats>,
}

#[derive(Clone, Copy, Debug)]
struct PkEntry {
    segment_id: u64,
    doc_id: DocId,
    lsn: Lsn,
}

struct ManifestState {
    file: ManifestFile,
    data: Manifest,
}

/// Row-meta column positions reordered to schema order.
struct ColumnMapping {
    forward: Vec<usize>,
    index: Vec<usize>,
}

pub struct Collection {
    name: String,
    root: PathBuf,
    magic: u64,
    options: ReadOptions,
    pool: Arc<ThreadPool>,
    schema: RwLock<Arc<CollectionSchema>>,
    segments: RwLock<Vec<Arc<Segment>>>,
    active: RwLock<Arc<Segment>>,
    pk_map: RwLock<HashMap<PrimaryKey, PkEntry>>,
    lsn_log: LsnLog,
    write_mutex: Mutex<()>,
    manifest: Mutex<ManifestState>,
    dump_group: TaskGroup,
    closed: AtomicBool,
}

impl Collection {
    /// Open (or create, per `options.create_new`) the collection named by
    /// `schema` under `index_dir`. On reopen the manifest's schema
    /// snapshot is authoritative.
    pub fn open(
        index_dir: &Path,
        schema: CollectionSchema,
        options: ReadOptions,
        pool: Arc<ThreadPool>,
    ) -> Result<Arc<Collection>> {
        let name = schema.name.clone();
        let root = index_dir.join(&name);

        let (manifest_file, mut data) = if options.create_new {
            schema.validate()?;
            fio::mkdir_all(&root)?;
            let manifest = Manifest::new(mint_magic(&name), schema);
            let file = ManifestFile::create(&root, &manifest)?;
            (file, manifest)
        } else {
            if !root.exists() {
                return Err(Error::NotFound(format!("collection {name}")));
            }
            let (file, manifest) = ManifestFile::open(&root)?;
            // Building leftovers are from a crash; the source re-sends
            // everything past the durable LSN checkpoint.
            fio::rmdir_all(root.join(BUILDING_DIR))?;
            (file, manifest)
        };
        fio::mkdir_all(root.join(BUILDING_DIR))?;

        let schema_arc = Arc::new(data.schema.clone());
        let lsn_log = LsnLog::open(root.join(LSN_LOG_FILE))?;

        let mut segments: Vec<Arc<Segment>> = Vec::new();
        let mut pk_map: HashMap<PrimaryKey, PkEntry> = HashMap::new();
        for &id in &data.persisted_segments {
            let segment = Segment::open_persist(
                &root,
                &name,
                Arc::clone(&schema_arc),
                id,
                options.use_mmap,
                options.warmup,
            )?;
            for (local, record) in forward::scan_all(segment.forward_store())?
                .into_iter()
                .enumerate()
            {
                let doc_id = segment.min_doc_id() + local as u32;
                if segment.is_deleted(doc_id) {
                    continue;
                }
                pk_map.insert(
                    record.primary_key,
                    PkEntry {
                        segment_id: id,
                        doc_id,
                        lsn: record.lsn,
                    },
                );
            }
            segments.push(segment);
        }

        let active = Segment::create_writing(
            &root,
            &name,
            data.next_segment_id,
            data.next_min_doc_id,
            Arc::clone(&schema_arc),
        )?;
        data.next_segment_id += 1;
        segments.push(Arc::clone(&active));

        let magic = data.magic;
        log::debug!(
            "collection {name}: opened with {} persisted segments, magic {magic:#x}",
            segments.len() - 1
        );
        Ok(Arc::new(Collection {
            name,
            root,
            magic,
            options,
            dump_group: pool.make_group(),
            pool,
            schema: RwLock::new(schema_arc),
            segments: RwLock::new(segments),
            active: RwLock::new(active),
            pk_map: RwLock::new(pk_map),
            lsn_log,
            write_mutex: Mutex::new(()),
            manifest: Mutex::new(ManifestState {
                file: manifest_file,
                data,
            }),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The per-collection epoch every write batch must echo.
    pub fn magic(&self) -> u64 {
        self.magic
    }

    pub fn schema(&self) -> Arc<CollectionSchema> {
        Arc::clone(&self.schema.read().expect("schema lock poisoned"))
    }

    /// Apply a batch in row order. The first failing row truncates the
    /// batch: earlier rows stay applied, the failure names the row.
    pub fn write_records(
        self: &Arc<Self>,
        batch: &WriteBatch,
    ) -> std::result::Result<(), WriteFailure> {
        let fail = |row_index: u32, error: Error| WriteFailure { row_index, error };

        if self.closed.load(Ordering::Acquire) {
            return Err(fail(0, Error::Busy(format!("collection {} is closed", self.name))));
        }
        if batch.collection != self.name {
            return Err(fail(
                0,
                Error::NotFound(format!("collection {}", batch.collection)),
            ));
        }
        let schema = self.schema();
        if batch.schema_revision != schema.revision {
            return Err(fail(
                0,
                Error::MismatchedSchema {
                    batch: batch.schema_revision,
                    current: schema.revision,
                },
            ));
        }
        if batch.magic != self.magic {
            return Err(fail(
                0,
                Error::MismatchedMagic {
                    batch: batch.magic,
                    current: self.magic,
                },
            ));
        }

        let needs_columns = batch
            .rows
            .iter()
            .any(|row| matches!(row.op, OpKind::Insert | OpKind::Update));
        let mapping = if needs_columns {
            Some(build_mapping(&schema, &batch.row_meta).map_err(|err| fail(0, err))?)
        } else {
            None
        };

        let _guard = self.write_mutex.lock().expect("write mutex poisoned");
        let mut prev_lsn: Option<Lsn> = None;
        for (i, row) in batch.rows.iter().enumerate() {
            if let Some(previous) = prev_lsn {
                if row.lsn < previous {
                    return Err(fail(
                        i as u32,
                        Error::NonMonotonicLsn {
                            lsn: row.lsn,
                            previous,
                        },
                    ));
                }
            }
            self.apply_row(&schema, mapping.as_ref(), row)
                .map_err(|err| fail(i as u32, err))?;
            self.lsn_log
                .append(row.lsn, &row.lsn_context)
                .map_err(|err| fail(i as u32, err))?;
            prev_lsn = Some(row.lsn);
        }
        self.lsn_log
            .flush()
            .map_err(|err| fail(batch.rows.len() as u32, err))?;

        if schema.max_docs_per_segment > 0 {
            let active = self.active_segment();
            if active.doc_count() >= schema.max_docs_per_segment {
                self.rotate_active(&schema)
                    .map_err(|err| fail(batch.rows.len() as u32, err))?;
            }
        }
        Ok(())
    }

    fn apply_row(
        &self,
        schema: &CollectionSchema,
        mapping: Option<&ColumnMapping>,
        row: &RowData,
    ) -> Result<()> {
        match row.op {
            OpKind::Delete => {
                let removed = self
                    .pk_map
                    .write()
                    .expect("pk map lock poisoned")
                    .remove(&row.primary_key);
                // Deleting an unknown primary key is an idempotent no-op.
                if let Some(entry) = removed {
                    self.tombstone(&entry, row.lsn)?;
                }
                Ok(())
            }
            OpKind::Insert | OpKind::Update => {
                let mapping = mapping
                    .ok_or_else(|| Error::Internal("missing column mapping".to_string()))?;

                // Decode and validate everything before touching state.
                let mut vectors = Vec::with_capacity(schema.index_columns.len());
                for (spec, &pos) in schema.index_columns.iter().zip(&mapping.index) {
                    let raw = row.index_values.get(pos).ok_or_else(|| {
                        Error::InvalidArgument(format!("row missing vector for column {}", spec.name))
                    })?;
                    vectors.push(column::decode_vector(spec, raw)?);
                }
                let mut values = Vec::with_capacity(schema.forward_columns.len());
                for (spec, &pos) in schema.forward_columns.iter().zip(&mapping.forward) {
                    let value = row.forward_values.get(pos).ok_or_else(|| {
                        Error::InvalidArgument(format!("row missing value for column {}", spec.name))
                    })?;
                    if value.logical_type() != spec.logical_type {
                        return Err(Error::InvalidArgument(format!(
                            "column {} expects {:?}, row carries {:?}",
                            spec.name,
                            spec.logical_type,
                            value.logical_type()
                        )));
                    }
                    values.push(value.clone());
                }

                let existing = self
                    .pk_map
                    .read()
                    .expect("pk map lock poisoned")
                    .get(&row.primary_key)
                    .copied();
                if let Some(entry) = existing {
                    if row.lsn_check && entry.lsn >= row.lsn {
                        return Err(Error::StaleWrite {
                            primary_key: row.primary_key,
                            stored: entry.lsn,
                            incoming: row.lsn,
                        });
                    }
                    // The replaced doc is tombstoned wherever it lives;
                    // primary keys stay unique.
                    self.tombstone(&entry, row.lsn)?;
                }

                let active = self.active_segment();
                let doc_id = active.append_row(row.primary_key, row.lsn, values, &vectors)?;
                self.pk_map.write().expect("pk map lock poisoned").insert(
                    row.primary_key,
                    PkEntry {
                        segment_id: active.id(),
                        doc_id,
                        lsn: row.lsn,
                    },
                );
                Ok(())
            }
        }
    }

    fn tombstone(&self, entry: &PkEntry, lsn: Lsn) -> Result<()> {
        let segments = self.segments.read().expect("segments lock poisoned");
        let segment = segments
            .iter()
            .find(|s| s.id() == entry.segment_id)
            .ok_or_else(|| {
                Error::Internal(format!("pk map points at unknown segment {}", entry.segment_id))
            })?;
        segment.delete_doc(entry.doc_id, lsn)?;
        Ok(())
    }

    fn active_segment(&self) -> Arc<Segment> {
        Arc::clone(&self.active.read().expect("active lock poisoned"))
    }

    /// Seal the active segment, start a fresh one after its doc-id
    /// window, and hand the sealed one to the pool. Runs under the write
    /// mutex.
    fn rotate_active(self: &Arc<Self>, schema: &CollectionSchema) -> Result<()> {
        let sealed = self.active_segment();
        sealed.seal()?;

        let (next_id, next_min) = {
            let mut manifest = self.manifest.lock().expect("manifest lock poisoned");
            let window_end = sealed.min_doc_id() + 2 * schema.max_docs_per_segment;
            manifest.data.next_min_doc_id = manifest.data.next_min_doc_id.max(window_end);
            let id = manifest.data.next_segment_id;
            manifest.data.next_segment_id += 1;
            (id, manifest.data.next_min_doc_id)
        };

        let fresh = Segment::create_writing(
            &self.root,
            &self.name,
            next_id,
            next_min,
            self.schema(),
        )?;
        self.segments
            .write()
            .expect("segments lock poisoned")
            .push(Arc::clone(&fresh));
        *self.active.write().expect("active lock poisoned") = fresh;

        self.schedule_dump(sealed);
        Ok(())
    }

    fn schedule_dump(self: &Arc<Self>, segment: Arc<Segment>) {
        let this = Arc::clone(self);
        let for_task = Arc::clone(&segment);
        if !self.dump_group.submit(move || this.run_dump(for_task)) {
            segment.fault("thread pool rejected the dump task".to_string());
        }
    }

    fn run_dump(&self, segment: Arc<Segment>) {
        for attempt in 1..=DUMP_ATTEMPTS {
            let outcome = segment
                .dump(&self.root, self.options.use_mmap, self.options.warmup)
                .and_then(|_| self.commit_dump(&segment));
            match outcome {
                Ok(()) => return,
                Err(err) if attempt < DUMP_ATTEMPTS => {
                    log::warn!(
                        "collection {}: dump of segment {} failed (attempt {attempt}): {err}",
                        self.name,
                        segment.id()
                    );
                    std::thread::sleep(DUMP_BACKOFF_BASE * (1u32 << attempt.min(6)));
                }
                Err(err) => {
                    segment.fault(format!("dump failed after {DUMP_ATTEMPTS} attempts: {err}"));
                }
            }
        }
    }

    fn commit_dump(&self, segment: &Segment) -> Result<()> {
        let mut manifest = self.manifest.lock().expect("manifest lock poisoned");
        if !manifest.data.persisted_segments.contains(&segment.id()) {
            manifest.data.persisted_segments.push(segment.id());
            manifest.data.persisted_segments.sort_unstable();
        }
        manifest.data.next_segment_id = manifest.data.next_segment_id.max(segment.id() + 1);
        let schema = self.schema();
        let window_end = if schema.max_docs_per_segment > 0 {
            segment.min_doc_id() + 2 * schema.max_docs_per_segment
        } else {
            segment.min_doc_id() + segment.doc_count()
        };
        manifest.data.next_min_doc_id = manifest.data.next_min_doc_id.max(window_end);
        let data = manifest.data.clone();
        manifest.file.store(&data)
    }

    /// Snapshot of the segment list; searches run against the snapshot
    /// without holding the lock.
    pub fn get_segments(&self) -> Vec<Arc<Segment>> {
        self.segments
            .read()
            .expect("segments lock poisoned")
            .clone()
    }

    /// Fan each query out across the segment snapshot and merge top-k.
    pub fn knn_search(&self, queries: &[KnnQuery]) -> Result<Vec<Vec<QueryResult>>> {
        let segments = self.get_segments();
        let mut out = Vec::with_capacity(queries.len());
        for query in queries {
            if query.params.topk == 0 {
                out.push(Vec::new());
                continue;
            }
            let results = Arc::new(Mutex::new(Vec::new()));
            let failures = Arc::new(Mutex::new(Vec::new()));
            let group = self.pool.make_group();
            let mut refused = false;
            for segment in &segments {
                if segment.state() == SegmentState::Faulted {
                    continue;
                }
                let segment = Arc::clone(segment);
                let query = query.clone();
                let results = Arc::clone(&results);
                let failures = Arc::clone(&failures);
                refused |= !group.submit(move || {
                    match segment.knn_search(&query.column, &query.query, &query.params) {
                        Ok(found) => results.lock().expect("results lock poisoned").push(found),
                        Err(err) => failures.lock().expect("failures lock poisoned").push(err),
                    }
                });
            }
            group.wait_finish();
            if refused {
                return Err(Error::Busy("thread pool is shut down".to_string()));
            }
            if let Some(err) = failures.lock().expect("failures lock poisoned").pop() {
                return Err(err);
            }
            let mut merged: Vec<QueryResult> = results
                .lock()
                .expect("results lock poisoned")
                .drain(..)
                .flatten()
                .collect();
            merged.sort_by(|a, b| {
                a.score
                    .total_cmp(&b.score)
                    .then(a.primary_key.cmp(&b.primary_key))
            });
            merged.truncate(query.params.topk as usize);
            out.push(merged);
        }
        Ok(out)
    }

    pub fn get_latest_lsn(&self) -> Option<(Lsn, Bytes)> {
        self.lsn_log.latest()
    }

    pub fn get_stats(&self) -> CollectionStats {
        let segments = self.get_segments();
        let mut stats = CollectionStats {
            total_segment_count: segments.len(),
            ..CollectionStats::default()
        };
        for segment in &segments {
            let s = segment.stats();
            stats.total_doc_count += s.doc_count as u64;
            stats.delete_doc_count += s.delete_count as u64;
            stats.total_index_file_count += s.index_file_count;
            stats.total_index_file_size += s.index_file_size;
            stats.segments.push(s);
        }
        stats
    }

    /// Accept a schema whose revision moves forward; only
    /// `max_docs_per_segment` may change in this version.
    pub fn update_schema(&self, new_schema: CollectionSchema) -> Result<()> {
        let current = self.schema();
        current.validate_update(&new_schema)?;
        {
            let mut manifest = self.manifest.lock().expect("manifest lock poisoned");
            manifest.data.schema = new_schema.clone();
            let data = manifest.data.clone();
            manifest.file.store(&data)?;
        }
        *self.schema.write().expect("schema lock poisoned") = Arc::new(new_schema);
        log::debug!("collection {}: schema advanced", self.name);
        Ok(())
    }

    /// Wait until every scheduled dump has finished (or faulted).
    pub fn wait_pending_dumps(&self) {
        self.dump_group.wait_finish();
    }

    /// Seal and dump the active segment, drain background work, sync
    /// everything durable. Idempotent.
    pub fn close(self: &Arc<Self>) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        {
            let _guard = self.write_mutex.lock().expect("write mutex poisoned");
            let active = self.active_segment();
            if active.doc_count() > 0 && active.state() == SegmentState::Writing {
                active.seal()?;
                self.schedule_dump(active);
            }
        }
        self.dump_group.wait_finish();
        self.lsn_log.flush()?;
        for segment in self.get_segments() {
            if segment.state() == SegmentState::Persist {
                segment.flush_deletes()?;
            }
        }
        let manifest = self.manifest.lock().expect("manifest lock poisoned");
        let data = manifest.data.clone();
        manifest.file.store(&data)?;
        log::debug!("collection {} closed", self.name);
        Ok(())
    }
}

fn build_mapping(schema: &CollectionSchema, row_meta: &RowMeta) -> Result<ColumnMapping> {
    for name in &row_meta.forward_columns {
        if !schema.forward_columns.iter().any(|c| &c.name == name) {
            return Err(Error::UnknownColumn(name.clone()));
        }
    }
    for name in &row_meta.index_columns {
        if schema.index_column(name).is_none() {
            return Err(Error::UnknownColumn(name.clone()));
        }
    }
    let forward = schema
        .forward_columns
        .iter()
        .map(|spec| {
            row_meta
                .forward_columns
                .iter()
                .position(|n| n == &spec.name)
                .ok_or_else(|| {
                    Error::InvalidArgument(format!("batch misses forward column {}", spec.name))
                })
        })
        .collect::<Result<Vec<_>>>()?;
    let index = schema
        .index_columns
        .iter()
        .map(|spec| {
            row_meta
                .index_columns
                .iter()
                .position(|n| n == &spec.name)
                .ok_or_else(|| {
                    Error::InvalidArgument(format!("batch misses index column {}", spec.name))
                })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(ColumnMapping { forward, index })
}
