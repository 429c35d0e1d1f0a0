//! End-to-end tests driving a collection the way the ingestion and query
//! layers do: insert/update/delete batches, segment dumps, reopen.

use std::sync::Arc;

use bytes::Bytes;
use smallvec::smallvec;
use tempdir::TempDir;

use anns::{
    Collection, CollectionSchema, Error, ForwardColumnSpec, FwdValue, IndexColumnSpec, KnnQuery,
    LogicalType, MetricKind, OpKind, QueryParams, QueryResult, ReadOptions, RowData, RowMeta,
    SegmentState, ThreadPool, VectorType, WriteBatch,
};

const DIM: u32 = 16;

fn schema(max_docs_per_segment: u32) -> CollectionSchema {
    CollectionSchema {
        name: "faces".to_string(),
        revision: 0,
        max_docs_per_segment,
        forward_columns: vec![ForwardColumnSpec {
            name: "note".to_string(),
            logical_type: LogicalType::Bytes,
        }],
        index_columns: vec![IndexColumnSpec::graph(
            "face",
            VectorType::Fp32,
            DIM,
            MetricKind::SquaredEuclidean,
        )],
    }
}

fn open_new(dir: &TempDir, max_docs: u32, pool: Arc<ThreadPool>) -> Arc<Collection> {
    Collection::open(
        dir.path(),
        schema(max_docs),
        ReadOptions {
            use_mmap: true,
            create_new: true,
            warmup: false,
        },
        pool,
    )
    .unwrap()
}

fn vec_bytes(i: u64) -> Bytes {
    let raw: Vec<u8> = std::iter::repeat(i as f32)
        .take(DIM as usize)
        .flat_map(|v| v.to_le_bytes())
        .collect();
    Bytes::from(raw)
}

fn row_meta() -> RowMeta {
    RowMeta {
        forward_columns: vec!["note".to_string()],
        index_columns: vec!["face".to_string()],
    }
}

fn upsert_row(op: OpKind, pk: u64, lsn: u64, note: &str, lsn_check: bool) -> RowData {
    let mut row = RowData::new(pk, op, lsn);
    row.lsn_check = lsn_check;
    row.lsn_context = Bytes::from(format!("binlog:{lsn}"));
    row.forward_values = smallvec![FwdValue::Bytes(Bytes::copy_from_slice(note.as_bytes()))];
    row.index_values = smallvec![vec_bytes(pk)];
    row
}

fn batch_of(collection: &Collection, rows: Vec<RowData>) -> WriteBatch {
    let mut batch = WriteBatch::new(
        collection.name(),
        collection.schema().revision,
        collection.magic(),
    );
    batch.row_meta = row_meta();
    batch.rows = rows;
    batch
}

fn insert_many(collection: &Arc<Collection>, range: std::ops::Range<u64>, lsn_check: bool) {
    for i in range {
        let batch = batch_of(
            collection,
            vec![upsert_row(OpKind::Insert, i, i, "hello", lsn_check)],
        );
        collection.write_records(&batch).unwrap();
    }
}

fn search_one(collection: &Arc<Collection>, i: u64, topk: u32) -> Vec<QueryResult> {
    let mut results = collection
        .knn_search(&[KnnQuery {
            column: "face".to_string(),
            query: vec_bytes(i),
            params: QueryParams::new(topk, VectorType::Fp32, DIM),
        }])
        .unwrap();
    results.remove(0)
}

#[test]
fn insert_and_search_round_trip() {
    let dir = TempDir::new("anns").unwrap();
    let pool = ThreadPool::new(4, false);
    let collection = open_new(&dir, 0, pool);

    insert_many(&collection, 0..1000, false);
    assert_eq!(collection.get_latest_lsn().unwrap().0, 999);

    let segments = collection.get_segments();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].collection(), "faces");
    assert_eq!(segments[0].id(), 0);
    assert_eq!(segments[0].doc_count(), 1000);

    for i in [0u64, 1, 499, 500, 777, 999] {
        let results = search_one(&collection, i, 10);
        assert_eq!(results.len(), 10);
        assert_eq!(results[0].primary_key, i);
        assert_eq!(results[0].score, 0.0);
        assert_eq!(results[0].lsn, i);
        assert_eq!(
            results[0].forward_values,
            vec![FwdValue::Bytes(Bytes::from_static(b"hello"))]
        );
    }

    collection.close().unwrap();
}

#[test]
fn segment_dump_windows_and_stats() {
    let dir = TempDir::new("anns").unwrap();
    let pool = ThreadPool::new(4, false);
    let collection = open_new(&dir, 900, pool);

    insert_many(&collection, 0..2000, false);
    collection.wait_pending_dumps();

    let stats = collection.get_stats();
    assert_eq!(stats.total_doc_count, 2000);
    assert_eq!(stats.delete_doc_count, 0);
    assert_eq!(stats.total_segment_count, 3);
    assert_eq!(stats.segments.len(), 3);

    let seg0 = &stats.segments[0];
    assert_eq!(seg0.segment_id, 0);
    assert_eq!(seg0.state, SegmentState::Persist);
    assert_eq!(seg0.doc_count, 900);
    assert_eq!((seg0.min_doc_id, seg0.max_doc_id), (0, 899));
    assert_eq!((seg0.min_primary_key, seg0.max_primary_key), (0, 899));
    assert_eq!((seg0.min_lsn, seg0.max_lsn), (0, 899));
    assert_eq!(seg0.index_file_count, 1);
    assert!(seg0.index_file_size > 0);

    let seg1 = &stats.segments[1];
    assert_eq!(seg1.segment_id, 1);
    assert_eq!(seg1.state, SegmentState::Persist);
    assert_eq!(seg1.doc_count, 900);
    assert_eq!((seg1.min_doc_id, seg1.max_doc_id), (1800, 2699));
    assert_eq!((seg1.min_primary_key, seg1.max_primary_key), (900, 1799));
    assert_eq!((seg1.min_lsn, seg1.max_lsn), (900, 1799));

    let seg2 = &stats.segments[2];
    assert_eq!(seg2.segment_id, 2);
    assert_eq!(seg2.state, SegmentState::Writing);
    assert_eq!(seg2.doc_count, 200);
    assert_eq!((seg2.min_doc_id, seg2.max_doc_id), (3600, 3799));
    assert_eq!((seg2.min_primary_key, seg2.max_primary_key), (1800, 1999));
    assert_eq!((seg2.min_lsn, seg2.max_lsn), (1800, 1999));

    for i in [0u64, 450, 899, 900, 1799, 1800, 1999] {
        let results = search_one(&collection, i, 10);
        assert_eq!(results[0].primary_key, i);
        assert_eq!(results[0].score, 0.0);
        assert_eq!(results[0].lsn, i);
    }

    collection.close().unwrap();
}

#[test]
fn delete_then_search() {
    let dir = TempDir::new("anns").unwrap();
    let pool = ThreadPool::new(4, false);
    let collection = open_new(&dir, 0, pool);

    insert_many(&collection, 0..1000, false);

    let deletes: Vec<RowData> = (0..500u64)
        .map(|i| {
            let mut row = RowData::new(i, OpKind::Delete, 1000 + i);
            row.lsn_context = Bytes::from(format!("binlog:{}", 1000 + i));
            row
        })
        .collect();
    collection.write_records(&batch_of(&collection, deletes)).unwrap();

    let stats = collection.get_stats();
    assert_eq!(stats.total_doc_count, 1000);
    assert_eq!(stats.delete_doc_count, 500);

    for i in (0..500u64).step_by(50) {
        let results = search_one(&collection, i, 10);
        assert!(results.iter().all(|r| r.primary_key != i));
        assert!(results.iter().all(|r| r.score != 0.0));
    }
    for i in (500..1000u64).step_by(50) {
        let results = search_one(&collection, i, 10);
        assert_eq!(results[0].primary_key, i);
        assert_eq!(results[0].score, 0.0);
    }

    // Deleting an unknown key is a no-op.
    let again: Vec<RowData> = vec![RowData::new(3, OpKind::Delete, 2000)];
    collection.write_records(&batch_of(&collection, again)).unwrap();
    assert_eq!(collection.get_stats().delete_doc_count, 500);

    collection.close().unwrap();
}

#[test]
fn update_with_lsn_check() {
    let dir = TempDir::new("anns").unwrap();
    let pool = ThreadPool::new(4, false);
    let collection = open_new(&dir, 0, pool);

    insert_many(&collection, 0..1000, true);
    assert_eq!(collection.get_latest_lsn().unwrap().0, 999);

    // Same LSN as stored: every row must be refused as stale.
    for i in 0..1000u64 {
        let batch = batch_of(
            &collection,
            vec![upsert_row(OpKind::Update, i, i, "hello_update", true)],
        );
        let failure = collection.write_records(&batch).unwrap_err();
        assert_eq!(failure.row_index, 0);
        assert!(matches!(failure.error, Error::StaleWrite { .. }));
    }
    // Nothing moved.
    assert_eq!(collection.get_latest_lsn().unwrap().0, 999);
    assert_eq!(collection.get_stats().delete_doc_count, 0);

    // One LSN ahead: accepted, old doc tombstoned.
    for i in 0..1000u64 {
        let batch = batch_of(
            &collection,
            vec![upsert_row(OpKind::Update, i, i + 1, "hello_update", true)],
        );
        collection.write_records(&batch).unwrap();
    }
    assert_eq!(collection.get_latest_lsn().unwrap().0, 1000);

    let segments = collection.get_segments();
    assert_eq!(segments.len(), 1);
    let stats = collection.get_stats();
    assert_eq!(stats.total_doc_count, 2000);
    assert_eq!(stats.delete_doc_count, 1000);

    for i in (0..1000u64).step_by(97) {
        let results = search_one(&collection, i, 10);
        assert_eq!(results[0].primary_key, i);
        assert_eq!(results[0].score, 0.0);
        assert_eq!(results[0].lsn, i + 1);
        assert_eq!(
            results[0].forward_values,
            vec![FwdValue::Bytes(Bytes::from_static(b"hello_update"))]
        );
    }

    collection.close().unwrap();
}

#[test]
fn close_and_reopen_preserves_everything() {
    let dir = TempDir::new("anns").unwrap();
    let pool = ThreadPool::new(4, false);
    let collection = open_new(&dir, 900, Arc::clone(&pool));

    insert_many(&collection, 0..2000, false);
    collection.wait_pending_dumps();

    let probes = [0u64, 450, 899, 1234, 1800, 1999];
    let before_stats = collection.get_stats();
    let before_top1: Vec<QueryResult> = probes
        .iter()
        .map(|&i| search_one(&collection, i, 1).remove(0))
        .collect();

    collection.close().unwrap();
    drop(collection);

    let reopened = Collection::open(
        dir.path(),
        schema(900),
        ReadOptions {
            use_mmap: true,
            create_new: false,
            warmup: true,
        },
        Arc::clone(&pool),
    )
    .unwrap();

    let after_stats = reopened.get_stats();
    assert_eq!(after_stats.total_doc_count, before_stats.total_doc_count);
    assert_eq!(after_stats.delete_doc_count, before_stats.delete_doc_count);
    // The writing segment was dumped at close; a fresh empty one opens.
    assert_eq!(after_stats.total_segment_count, 4);
    assert_eq!(after_stats.segments[0], before_stats.segments[0]);
    assert_eq!(after_stats.segments[1], before_stats.segments[1]);
    let seg2 = &after_stats.segments[2];
    assert_eq!(seg2.state, SegmentState::Persist);
    assert_eq!(seg2.doc_count, before_stats.segments[2].doc_count);
    assert_eq!(seg2.min_doc_id, before_stats.segments[2].min_doc_id);
    let seg3 = &after_stats.segments[3];
    assert_eq!(seg3.state, SegmentState::Writing);
    assert_eq!(seg3.doc_count, 0);
    assert_eq!(seg3.min_doc_id, 5400);

    assert_eq!(reopened.get_latest_lsn().unwrap().0, 1999);

    let after_top1: Vec<QueryResult> = probes
        .iter()
        .map(|&i| search_one(&reopened, i, 1).remove(0))
        .collect();
    assert_eq!(after_top1, before_top1);

    // The rebuilt primary-key map routes updates correctly.
    let batch = batch_of(
        &reopened,
        vec![upsert_row(OpKind::Update, 42, 5000, "rewritten", false)],
    );
    reopened.write_records(&batch).unwrap();
    let results = search_one(&reopened, 42, 1);
    assert_eq!(results[0].primary_key, 42);
    assert_eq!(results[0].lsn, 5000);
    assert_eq!(
        results[0].forward_values,
        vec![FwdValue::Bytes(Bytes::from_static(b"rewritten"))]
    );

    reopened.close().unwrap();
}

#[test]
fn schema_update_rejected_then_accepted() {
    let dir = TempDir::new("anns").unwrap();
    let pool = ThreadPool::new(2, false);
    let collection = open_new(&dir, 0, pool);

    // Same revision: refused outright.
    let mut same_revision = schema(900);
    same_revision.revision = 0;
    assert!(matches!(
        collection.update_schema(same_revision),
        Err(Error::InvalidArgument(_))
    ));

    // New revision but a different index column: unsupported.
    let mut new_column = schema(900);
    new_column.revision = 1;
    new_column.index_columns[0].name = "face1".to_string();
    assert!(matches!(
        collection.update_schema(new_column),
        Err(Error::UnsupportedSchemaChange(_))
    ));

    // New revision, only max_docs_per_segment changed: accepted.
    let mut ok = schema(900);
    ok.revision = 1;
    collection.update_schema(ok).unwrap();

    // Batches built against the old revision are now refused.
    let mut stale = batch_of(&collection, vec![upsert_row(OpKind::Insert, 0, 0, "x", false)]);
    stale.schema_revision = 0;
    let failure = collection.write_records(&stale).unwrap_err();
    assert!(matches!(failure.error, Error::MismatchedSchema { .. }));

    let fresh = batch_of(&collection, vec![upsert_row(OpKind::Insert, 0, 0, "x", false)]);
    collection.write_records(&fresh).unwrap();

    collection.close().unwrap();
}

#[test]
fn batch_validation_and_row_truncation() {
    let dir = TempDir::new("anns").unwrap();
    let pool = ThreadPool::new(2, false);
    let collection = open_new(&dir, 0, pool);

    // Wrong magic: refused before any row applies.
    let mut wrong_magic = batch_of(&collection, vec![upsert_row(OpKind::Insert, 0, 0, "x", false)]);
    wrong_magic.magic ^= 1;
    let failure = collection.write_records(&wrong_magic).unwrap_err();
    assert!(matches!(failure.error, Error::MismatchedMagic { .. }));

    // Unknown column in the batch layout.
    let mut unknown = batch_of(&collection, vec![upsert_row(OpKind::Insert, 0, 0, "x", false)]);
    unknown.row_meta.index_columns = vec!["fingerprint".to_string()];
    let failure = collection.write_records(&unknown).unwrap_err();
    assert!(matches!(failure.error, Error::UnknownColumn(_)));

    // Row 1 carries a short vector: row 0 stays applied, row 1 fails.
    let mut bad_row = upsert_row(OpKind::Insert, 11, 11, "x", false);
    bad_row.index_values = smallvec![Bytes::from_static(b"\x00\x01")];
    let batch = batch_of(
        &collection,
        vec![upsert_row(OpKind::Insert, 10, 10, "x", false), bad_row],
    );
    let failure = collection.write_records(&batch).unwrap_err();
    assert_eq!(failure.row_index, 1);
    assert!(matches!(failure.error, Error::InvalidVector(_)));
    assert_eq!(collection.get_stats().total_doc_count, 1);
    assert_eq!(collection.get_latest_lsn().unwrap().0, 10);

    // LSNs inside one batch must be non-decreasing.
    let batch = batch_of(
        &collection,
        vec![
            upsert_row(OpKind::Insert, 20, 20, "x", false),
            upsert_row(OpKind::Insert, 21, 19, "x", false),
        ],
    );
    let failure = collection.write_records(&batch).unwrap_err();
    assert_eq!(failure.row_index, 1);
    assert!(matches!(failure.error, Error::NonMonotonicLsn { .. }));
    assert_eq!(collection.get_latest_lsn().unwrap().0, 20);

    // Query-side validation.
    let err = collection
        .knn_search(&[KnnQuery {
            column: "nose".to_string(),
            query: vec_bytes(0),
            params: QueryParams::new(5, VectorType::Fp32, DIM),
        }])
        .unwrap_err();
    assert!(matches!(err, Error::UnknownColumn(_)));

    let err = collection
        .knn_search(&[KnnQuery {
            column: "face".to_string(),
            query: vec_bytes(0),
            params: QueryParams::new(5, VectorType::Fp32, DIM + 1),
        }])
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    // topk 0 is an empty result, topk beyond the live count caps there.
    assert!(search_one(&collection, 0, 0).is_empty());
    assert_eq!(search_one(&collection, 0, 100).len(), 2);

    collection.close().unwrap();
}

#[test]
fn concurrent_ingest_delete_and_search() {
    let dir = TempDir::new("anns").unwrap();
    let pool = ThreadPool::new(8, false);
    let collection = open_new(&dir, 0, Arc::clone(&pool));

    // The pool isolates task panics, so outcomes are collected and
    // asserted back on this thread.
    let failed = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let group = pool.make_group();
    for i in 0..1000u64 {
        let c = Arc::clone(&collection);
        let failed = Arc::clone(&failed);
        group.submit(move || {
            let batch = batch_of(&c, vec![upsert_row(OpKind::Insert, i, i, "hello", false)]);
            if c.write_records(&batch).is_err() {
                failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        });
    }
    group.wait_finish();
    assert_eq!(failed.load(std::sync::atomic::Ordering::Relaxed), 0);
    assert_eq!(collection.get_stats().total_doc_count, 1000);
    assert_eq!(collection.get_latest_lsn().unwrap().0, 999);

    for i in 0..500u64 {
        let c = Arc::clone(&collection);
        let failed = Arc::clone(&failed);
        group.submit(move || {
            let row = RowData::new(i, OpKind::Delete, 1000 + i);
            let batch = batch_of(&c, vec![row]);
            if c.write_records(&batch).is_err() {
                failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        });
    }
    group.wait_finish();
    assert_eq!(failed.load(std::sync::atomic::Ordering::Relaxed), 0);

    let stats = collection.get_stats();
    assert_eq!(stats.total_doc_count, 1000);
    assert_eq!(stats.delete_doc_count, 500);

    // Parallel segment-level searches over the settled collection.
    // (Collection::knn_search fans out through the pool itself, so the
    // workers search the segment snapshot directly.)
    let segments = collection.get_segments();
    assert_eq!(segments.len(), 1);
    let hits = Arc::new(std::sync::Mutex::new(Vec::new()));
    for i in (500..1000u64).step_by(25) {
        let segment = Arc::clone(&segments[0]);
        let hits = Arc::clone(&hits);
        group.submit(move || {
            let top = segment
                .knn_search(
                    "face",
                    &vec_bytes(i),
                    &QueryParams::new(5, VectorType::Fp32, DIM),
                )
                .ok()
                .and_then(|results| results.first().map(|r| (r.primary_key, r.score)));
            hits.lock().unwrap().push((i, top));
        });
    }
    group.wait_finish();
    for (i, top) in hits.lock().unwrap().iter() {
        assert_eq!(*top, Some((*i, 0.0)));
    }

    collection.close().unwrap();
}
