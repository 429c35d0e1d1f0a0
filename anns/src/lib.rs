//! Collection storage and ANN indexing engine.
//!
//! A collection ingests rows (primary key, forward attributes, vectors)
//! ordered by LSN and answers approximate nearest-neighbor queries over
//! them. Rows land in a writing segment; full segments are sealed and
//! dumped to immutable on-disk segments in the background while queries
//! fan out across the whole set.

pub mod codec;
pub mod collection;
pub mod column;
pub mod delete_map;
pub mod error;
pub mod fio;
pub mod forward;
pub mod lsn;
pub mod manifest;
pub mod meta;
pub mod pool;
pub mod records;
pub mod segment;

pub use collection::{Collection, CollectionStats, ReadOptions};
pub use error::{Error, Result};
pub use meta::{
    CollectionSchema, DocId, ForwardColumnSpec, FwdValue, IndexColumnSpec, IndexKind, LogicalType,
    Lsn, MetricKind, PrimaryKey, VectorType,
};
pub use pool::{TaskGroup, ThreadPool};
pub use records::{
    KnnQuery, OpKind, QueryParams, QueryResult, RowData, RowMeta, WriteBatch, WriteFailure,
};
pub use segment::{Segment, SegmentState, SegmentStats};
