//! Request/response message shapes the engine exchanges with its callers.
//!
//! Wire encoding belongs to the transport layer; the engine consumes these
//! decoded structs directly.

use bytes::Bytes;
use smallvec::SmallVec;

use crate::error::Error;
use crate::meta::{FwdValue, Lsn, PrimaryKey, VectorType};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

#[derive(Clone, Debug)]
pub struct RowData {
    pub primary_key: PrimaryKey,
    pub op: OpKind,
    pub lsn: Lsn,
    /// When set, the write is refused if the stored LSN for this primary
    /// key is not older than `lsn`.
    pub lsn_check: bool,
    /// Opaque resume token the ingestion source associates with `lsn`.
    pub lsn_context: Bytes,
    /// Aligned to `RowMeta::forward_columns`.
    pub forward_values: SmallVec<[FwdValue; 4]>,
    /// Aligned to `RowMeta::index_columns`; raw vector bytes.
    pub index_values: SmallVec<[Bytes; 1]>,
}

impl RowData {
    pub fn new(primary_key: PrimaryKey, op: OpKind, lsn: Lsn) -> Self {
        Self {
            primary_key,
            op,
            lsn,
            lsn_check: false,
            lsn_context: Bytes::new(),
            forward_values: SmallVec::new(),
            index_values: SmallVec::new(),
        }
    }
}

/// Column layout shared by every row of one batch.
#[derive(Clone, Debug, Default)]
pub struct RowMeta {
    pub forward_columns: Vec<String>,
    pub index_columns: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct WriteBatch {
    pub collection: String,
    pub schema_revision: u64,
    pub magic: u64,
    pub request_id: u64,
    pub row_meta: RowMeta,
    pub rows: Vec<RowData>,
}

impl WriteBatch {
    pub fn new(collection: &str, schema_revision: u64, magic: u64) -> Self {
        Self {
            collection: collection.to_string(),
            schema_revision,
            magic,
            request_id: 0,
            row_meta: RowMeta::default(),
            rows: Vec::new(),
        }
    }
}

/// A rejected batch: everything before `row_index` was applied and stays.
#[derive(Debug)]
pub struct WriteFailure {
    pub row_index: u32,
    pub error: Error,
}

impl std::fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "row {}: {}", self.row_index, self.error)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct QueryParams {
    pub topk: u32,
    pub data_type: VectorType,
    pub dimension: u32,
    /// Beam width override for graph backends.
    pub ef_search: Option<u32>,
}

impl QueryParams {
    pub fn new(topk: u32, data_type: VectorType, dimension: u32) -> Self {
        Self {
            topk,
            data_type,
            dimension,
            ef_search: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct KnnQuery {
    pub column: String,
    pub query: Bytes,
    pub params: QueryParams,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryResult {
    pub primary_key: PrimaryKey,
    /// Metric score, smaller is better.
    pub score: f32,
    pub lsn: Lsn,
    pub forward_values: Vec<FwdValue>,
}
