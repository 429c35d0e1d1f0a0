//! Per-column vector index adapter.
//!
//! The engine talks to ANN backends through the [`VectorIndex`] capability
//! trait; the adapter owns element-type conversion and the on-disk framing,
//! so a backend only ever sees `f32` slices and raw blobs.

use std::io::Write;

use graphidx::{BuildParams, GraphIndex, Metric};
use half::f16;

use crate::codec::{self, BlockKind};
use crate::error::{Error, Result};
use crate::meta::{IndexColumnSpec, IndexKind, MetricKind, VectorType};
use crate::records::QueryParams;

const DEFAULT_EF_SEARCH: usize = 64;

/// Capability contract every ANN backend satisfies.
pub trait VectorIndex: Send + Sync {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Append an indexable vector under a dense local label.
    fn add(&mut self, label: u32, vector: &[f32]) -> Result<()>;
    /// No more `add`; finalize in-memory structures.
    fn seal(&mut self);
    /// Write a self-describing blob (framed by the caller).
    fn serialize(&self, writer: &mut dyn Write) -> Result<()>;
    /// Best-first `(label, score)`, deterministic tie-break on label.
    fn search(&self, query: &[f32], k: usize, ef: Option<usize>) -> Result<Vec<(u32, f32)>>;
}

struct GraphBackend {
    index: GraphIndex,
    ef_search: usize,
}

impl VectorIndex for GraphBackend {
    fn len(&self) -> usize {
        self.index.len()
    }

    fn add(&mut self, label: u32, vector: &[f32]) -> Result<()> {
        self.index.add(label, vector)?;
        Ok(())
    }

    fn seal(&mut self) {
        self.index.seal();
    }

    fn serialize(&self, writer: &mut dyn Write) -> Result<()> {
        self.index.serialize_into(writer)?;
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize, ef: Option<usize>) -> Result<Vec<(u32, f32)>> {
        let ef = ef.unwrap_or(self.ef_search);
        Ok(self.index.search(query, k, ef)?)
    }
}

fn graph_metric(metric: MetricKind) -> Metric {
    match metric {
        MetricKind::SquaredEuclidean => Metric::SquaredEuclidean,
        MetricKind::InnerProduct => Metric::InnerProduct,
        // Binary vectors are widened to 0/1 components, where squared L2
        // equals the Hamming distance.
        MetricKind::Hamming => Metric::SquaredEuclidean,
    }
}

fn graph_params(spec: &IndexColumnSpec) -> Result<BuildParams> {
    let defaults = BuildParams::default();
    Ok(BuildParams {
        m: spec.param_usize("m")?.unwrap_or(defaults.m),
        ef_construction: spec
            .param_usize("ef_construction")?
            .unwrap_or(defaults.ef_construction),
    })
}

/// One column's index plus its spec; the unit a segment owns per column.
pub struct ColumnIndexer {
    spec: IndexColumnSpec,
    index: Box<dyn VectorIndex>,
}

impl ColumnIndexer {
    /// Fresh builder for a writing segment.
    pub fn new(spec: &IndexColumnSpec) -> Result<Self> {
        let index: Box<dyn VectorIndex> = match spec.index_kind {
            IndexKind::Graph => Box::new(GraphBackend {
                index: GraphIndex::new(
                    spec.dimension as usize,
                    graph_metric(spec.metric),
                    graph_params(spec)?,
                ),
                ef_search: spec.param_usize("ef_search")?.unwrap_or(DEFAULT_EF_SEARCH),
            }),
        };
        Ok(Self {
            spec: spec.clone(),
            index,
        })
    }

    /// Restore from the framed blob of a `col-<name>.idx` file.
    pub fn load(spec: &IndexColumnSpec, blob: &[u8]) -> Result<Self> {
        let (kind, payload, _) = codec::block_at(blob, 0)?
            .ok_or_else(|| Error::Integrity(format!("empty index file for {}", spec.name)))?;
        if kind != BlockKind::VectorIndex {
            return Err(Error::Integrity(format!(
                "column {} index file holds a {kind:?} block",
                spec.name
            )));
        }
        let index: Box<dyn VectorIndex> = match spec.index_kind {
            IndexKind::Graph => Box::new(GraphBackend {
                index: GraphIndex::deserialize_from(payload)?,
                ef_search: spec.param_usize("ef_search")?.unwrap_or(DEFAULT_EF_SEARCH),
            }),
        };
        Ok(Self {
            spec: spec.clone(),
            index,
        })
    }

    pub fn spec(&self) -> &IndexColumnSpec {
        &self.spec
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn add(&mut self, label: u32, vector: &[f32]) -> Result<()> {
        self.index.add(label, vector)
    }

    pub fn seal(&mut self) {
        self.index.seal();
    }

    /// Frame the backend blob as a C2 block; returns bytes written.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<u64> {
        let mut payload = Vec::new();
        self.index.serialize(&mut payload)?;
        let written = codec::write_block(writer, BlockKind::VectorIndex, &payload)?;
        Ok(written as u64)
    }

    pub fn search(&self, query: &[f32], k: usize, ef: Option<usize>) -> Result<Vec<(u32, f32)>> {
        self.index.search(query, k, ef)
    }
}

/// Decode raw column bytes into the backend's `f32` representation.
pub fn decode_vector(spec: &IndexColumnSpec, raw: &[u8]) -> Result<Vec<f32>> {
    let expected = spec.data_type.byte_len(spec.dimension);
    if raw.len() != expected {
        return Err(Error::InvalidVector(format!(
            "column {}: got {} bytes, expected {expected}",
            spec.name,
            raw.len()
        )));
    }
    let dim = spec.dimension as usize;
    let mut out = Vec::with_capacity(dim);
    match spec.data_type {
        VectorType::Fp32 => {
            for chunk in raw.chunks_exact(4) {
                out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
            }
        }
        VectorType::Fp16 => {
            for chunk in raw.chunks_exact(2) {
                out.push(f16::from_le_bytes([chunk[0], chunk[1]]).to_f32());
            }
        }
        VectorType::Int8 => {
            for &byte in raw {
                out.push(byte as i8 as f32);
            }
        }
        VectorType::Binary => {
            for bit in 0..dim {
                let set = raw[bit / 8] >> (bit % 8) & 1;
                out.push(set as f32);
            }
        }
    }
    if out.iter().any(|v| !v.is_finite()) {
        return Err(Error::InvalidVector(format!(
            "column {}: non-finite component",
            spec.name
        )));
    }
    Ok(out)
}

/// Validate query params against the column spec, then decode the query.
pub fn decode_query(spec: &IndexColumnSpec, params: &QueryParams, raw: &[u8]) -> Result<Vec<f32>> {
    if params.data_type != spec.data_type {
        return Err(Error::InvalidArgument(format!(
            "column {} holds {:?} vectors, query sent {:?}",
            spec.name, spec.data_type, params.data_type
        )));
    }
    if params.dimension != spec.dimension {
        return Err(Error::InvalidArgument(format!(
            "column {} has dimension {}, query sent {}",
            spec.name, spec.dimension, params.dimension
        )));
    }
    decode_vector(spec, raw)
}
