//! Collection schema and the closed set of forward value types.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Dense internal row identifier, scoped to one collection.
pub type DocId = u32;

/// Caller-supplied row identity.
pub type PrimaryKey = u64;

/// Monotonic write sequence number supplied with every row.
pub type Lsn = u64;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum VectorType {
    Fp32,
    Fp16,
    Int8,
    Binary,
}

impl VectorType {
    /// Encoded byte length of one vector of `dimension`.
    pub fn byte_len(&self, dimension: u32) -> usize {
        match self {
            VectorType::Fp32 => dimension as usize * 4,
            VectorType::Fp16 => dimension as usize * 2,
            VectorType::Int8 => dimension as usize,
            VectorType::Binary => dimension as usize / 8,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum MetricKind {
    SquaredEuclidean,
    InnerProduct,
    Hamming,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum IndexKind {
    Graph,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum LogicalType {
    I32,
    I64,
    F32,
    F64,
    Bool,
    Bytes,
}

/// One forward attribute value. A closed sum: unknown types are rejected
/// at schema validation, so no type erasure is needed at runtime.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum FwdValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Bytes(Bytes),
}

impl FwdValue {
    pub fn logical_type(&self) -> LogicalType {
        match self {
            FwdValue::I32(_) => LogicalType::I32,
            FwdValue::I64(_) => LogicalType::I64,
            FwdValue::F32(_) => LogicalType::F32,
            FwdValue::F64(_) => LogicalType::F64,
            FwdValue::Bool(_) => LogicalType::Bool,
            FwdValue::Bytes(_) => LogicalType::Bytes,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ForwardColumnSpec {
    pub name: String,
    pub logical_type: LogicalType,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct IndexColumnSpec {
    pub name: String,
    pub index_kind: IndexKind,
    pub data_type: VectorType,
    pub dimension: u32,
    pub metric: MetricKind,
    /// Opaque builder knobs, e.g. `m` / `ef_construction` for graph kinds.
    pub builder_params: BTreeMap<String, String>,
}

impl IndexColumnSpec {
    pub fn graph(name: &str, data_type: VectorType, dimension: u32, metric: MetricKind) -> Self {
        Self {
            name: name.to_string(),
            index_kind: IndexKind::Graph,
            data_type,
            dimension,
            metric,
            builder_params: BTreeMap::new(),
        }
    }

    pub fn param_usize(&self, key: &str) -> Result<Option<usize>> {
        match self.builder_params.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<usize>().map(Some).map_err(|_| {
                Error::InvalidArgument(format!(
                    "builder param {key}={raw} for column {} is not an integer",
                    self.name
                ))
            }),
        }
    }
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    pub revision: u64,
    /// 0 means the writing segment is never sealed on size.
    pub max_docs_per_segment: u32,
    pub forward_columns: Vec<ForwardColumnSpec>,
    pub index_columns: Vec<IndexColumnSpec>,
}

impl CollectionSchema {
    pub fn index_column(&self, name: &str) -> Option<&IndexColumnSpec> {
        self.index_columns.iter().find(|c| c.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidArgument("empty collection name".to_string()));
        }
        if self.index_columns.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "collection {} declares no index columns",
                self.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for column in self
            .forward_columns
            .iter()
            .map(|c| &c.name)
            .chain(self.index_columns.iter().map(|c| &c.name))
        {
            if !seen.insert(column.as_str()) {
                return Err(Error::InvalidArgument(format!(
                    "duplicate column name {column}"
                )));
            }
        }
        for column in &self.index_columns {
            if column.dimension == 0 {
                return Err(Error::InvalidArgument(format!(
                    "column {} has zero dimension",
                    column.name
                )));
            }
            match (column.data_type, column.metric) {
                (VectorType::Binary, MetricKind::Hamming) => {
                    if column.dimension % 8 != 0 {
                        return Err(Error::InvalidArgument(format!(
                            "binary column {} needs a dimension divisible by 8",
                            column.name
                        )));
                    }
                }
                (VectorType::Binary, other) => {
                    return Err(Error::InvalidArgument(format!(
                        "binary column {} only supports the hamming metric, got {other:?}",
                        column.name
                    )));
                }
                (_, MetricKind::Hamming) => {
                    return Err(Error::InvalidArgument(format!(
                        "hamming metric on column {} requires binary vectors",
                        column.name
                    )));
                }
                _ => {}
            }
            let _ = column.param_usize("m")?;
            let _ = column.param_usize("ef_construction")?;
            let _ = column.param_usize("ef_search")?;
        }
        Ok(())
    }

    /// Gate for `update_schema`: the revision must move forward and only
    /// `max_docs_per_segment` may differ.
    pub fn validate_update(&self, new: &CollectionSchema) -> Result<()> {
        if new.revision <= self.revision {
            return Err(Error::InvalidArgument(format!(
                "schema revision must increase: {} -> {}",
                self.revision, new.revision
            )));
        }
        if new.name != self.name {
            return Err(Error::UnsupportedSchemaChange(format!(
                "collection rename {} -> {}",
                self.name, new.name
            )));
        }
        if new.forward_columns != self.forward_columns {
            return Err(Error::UnsupportedSchemaChange(
                "forward column changes".to_string(),
            ));
        }
        if new.index_columns != self.index_columns {
            return Err(Error::UnsupportedSchemaChange(
                "index column changes".to_string(),
            ));
        }
        new.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> CollectionSchema {
        CollectionSchema {
            name: "people".to_string(),
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
        }
    }

    #[test]
    fn valid_schema_passes() {
        schema().validate().unwrap();
    }

    #[test]
    fn duplicate_column_names_fail() {
        let mut bad = schema();
        bad.forward_columns.push(ForwardColumnSpec {
            name: "face".to_string(),
            logical_type: LogicalType::I64,
        });
        assert!(matches!(bad.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn hamming_requires_binary() {
        let mut bad = schema();
        bad.index_columns[0].metric = MetricKind::Hamming;
        assert!(matches!(bad.validate(), Err(Error::InvalidArgument(_))));

        let mut good = schema();
        good.index_columns[0].data_type = VectorType::Binary;
        good.index_columns[0].metric = MetricKind::Hamming;
        good.validate().unwrap();
    }

    #[test]
    fn update_gate() {
        let current = schema();

        let mut same_revision = schema();
        same_revision.max_docs_per_segment = 900;
        assert!(matches!(
            current.validate_update(&same_revision),
            Err(Error::InvalidArgument(_))
        ));

        let mut new_column = schema();
        new_column.revision = 1;
        new_column.index_columns[0].name = "face1".to_string();
        assert!(matches!(
            current.validate_update(&new_column),
            Err(Error::UnsupportedSchemaChange(_))
        ));

        let mut ok = schema();
        ok.revision = 1;
        ok.max_docs_per_segment = 900;
        current.validate_update(&ok).unwrap();
    }
}
