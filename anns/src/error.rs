use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("schema revision mismatch: batch has {batch}, collection has {current}")]
    MismatchedSchema { batch: u64, current: u64 },
    #[error("collection magic mismatch: batch has {batch:#x}, collection has {current:#x}")]
    MismatchedMagic { batch: u64, current: u64 },
    #[error("stale write for primary key {primary_key}: stored lsn {stored} >= incoming {incoming}")]
    StaleWrite {
        primary_key: u64,
        stored: u64,
        incoming: u64,
    },
    #[error("non-monotonic lsn {lsn} after {previous}")]
    NonMonotonicLsn { lsn: u64, previous: u64 },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid vector: {0}")]
    InvalidVector(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("unsupported schema change: {0}")]
    UnsupportedSchemaChange(String),
    #[error("integrity check failed: {0}")]
    Integrity(String),
    #[error("incompatible format: found major version {found}, this build reads {supported}")]
    IncompatibleFormat { found: u16, supported: u16 },
    #[error("io error")]
    Io(#[from] io::Error),
    #[error("codec error")]
    Codec(#[from] bincode::Error),
    #[error("resource busy: {0}")]
    Busy(String),
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl From<graphidx::GraphError> for Error {
    fn from(err: graphidx::GraphError) -> Self {
        match err {
            graphidx::GraphError::Dimension { expected, got } => Error::InvalidVector(format!(
                "dimension mismatch: expected {expected}, got {got}"
            )),
            graphidx::GraphError::NonFinite => {
                Error::InvalidVector("non-finite vector component".to_string())
            }
            graphidx::GraphError::Sealed => {
                Error::Internal("add against a sealed graph index".to_string())
            }
            graphidx::GraphError::Codec(err) => Error::Codec(err),
        }
    }
}
