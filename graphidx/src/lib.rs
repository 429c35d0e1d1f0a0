//! Navigable small-world graph index over dense `f32` vectors.
//!
//! The graph is built incrementally and stays searchable while it grows.
//! Layer assignment is derived from the insertion ordinal instead of an RNG,
//! so rebuilding an index from the same insertion sequence yields an
//! identical graph and identical search results.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

/// External label attached to a node, assigned by the caller.
pub type Label = u32;

pub type GraphResult<T> = std::result::Result<T, GraphError>;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("dimension mismatch: expected {expected}, got {got}")]
    Dimension { expected: usize, got: usize },
    #[error("vector contains a non-finite component")]
    NonFinite,
    #[error("graph is sealed")]
    Sealed,
    #[error("graph codec error")]
    Codec(#[from] bincode::Error),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Metric {
    /// Squared L2 distance, smaller is better.
    SquaredEuclidean,
    /// Negated dot product, so that smaller is still better.
    InnerProduct,
}

/// Construction knobs, in the usual HNSW sense.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BuildParams {
    /// Max links per node on upper layers (2x on the base layer).
    pub m: usize,
    /// Beam width while inserting.
    pub ef_construction: usize,
}

impl Default for BuildParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 128,
        }
    }
}

type LinkList = SmallVec<[u32; 24]>;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct NodeLinks {
    /// One link list per layer, `0..=level`.
    links: Vec<LinkList>,
}

impl NodeLinks {
    fn with_level(level: usize) -> Self {
        Self {
            links: vec![LinkList::new(); level + 1],
        }
    }

    fn level(&self) -> usize {
        self.links.len() - 1
    }
}

/// Search frontier entry ordered by `(distance, node)`.
///
/// The node id tiebreak is what makes equal-score results come back in
/// ascending label order.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Candidate {
    dist: f32,
    node: u32,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then(self.node.cmp(&other.node))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphIndex {
    dim: usize,
    metric: Metric,
    params: BuildParams,
    /// Flat vector storage, `len = node_count * dim`.
    vectors: Vec<f32>,
    labels: Vec<Label>,
    nodes: Vec<NodeLinks>,
    entry: Option<u32>,
    max_level: usize,
    sealed: bool,
}

impl GraphIndex {
    pub fn new(dim: usize, metric: Metric, params: BuildParams) -> Self {
        Self {
            dim,
            metric,
            params,
            vectors: Vec::new(),
            labels: Vec::new(),
            nodes: Vec::new(),
            entry: None,
            max_level: 0,
            sealed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// No further `add` is accepted after sealing. Searches are unaffected.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Insert a vector under `label`.
    ///
    /// Labels are expected to arrive in ascending order; the ordering of
    /// equal-distance results follows insertion order.
    pub fn add(&mut self, label: Label, vector: &[f32]) -> GraphResult<()> {
        if self.sealed {
            return Err(GraphError::Sealed);
        }
        self.check_vector(vector)?;

        let node = self.nodes.len() as u32;
        let level = level_for(node, self.params.m);
        self.vectors.extend_from_slice(vector);
        self.labels.push(label);
        self.nodes.push(NodeLinks::with_level(level));

        let Some(mut ep) = self.entry else {
            self.entry = Some(node);
            self.max_level = level;
            return Ok(());
        };

        // Greedy descent through the layers above the new node's level.
        let mut layer = self.max_level;
        while layer > level {
            ep = self.greedy_closest(vector, ep, layer);
            layer -= 1;
        }

        // Connect on every shared layer, top-down.
        let top = level.min(self.max_level);
        for l in (0..=top).rev() {
            let nearest = self.search_layer(vector, ep, self.params.ef_construction, l);
            let selected: LinkList = nearest
                .iter()
                .take(self.max_links(l))
                .map(|c| c.node)
                .collect();
            if let Some(best) = nearest.first() {
                ep = best.node;
            }
            for &neighbor in &selected {
                self.link(neighbor, node, l);
            }
            self.nodes[node as usize].links[l] = selected;
        }

        if level > self.max_level {
            self.entry = Some(node);
            self.max_level = level;
        }
        Ok(())
    }

    /// Return up to `k` nearest labels, best first, ties by ascending label.
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> GraphResult<Vec<(Label, f32)>> {
        self.check_vector(query)?;
        let Some(mut ep) = self.entry else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        for layer in (1..=self.max_level).rev() {
            ep = self.greedy_closest(query, ep, layer);
        }
        let beam = ef.max(k);
        let found = self.search_layer(query, ep, beam, 0);
        Ok(found
            .into_iter()
            .take(k)
            .map(|c| (self.labels[c.node as usize], c.dist))
            .collect())
    }

    pub fn serialize_into<W: Write>(&self, writer: W) -> GraphResult<()> {
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    /// Restore a graph previously written by [`serialize_into`].
    ///
    /// Loaded graphs come back sealed.
    pub fn deserialize_from<R: Read>(reader: R) -> GraphResult<Self> {
        let mut index: GraphIndex = bincode::deserialize_from(reader)?;
        index.sealed = true;
        Ok(index)
    }

    fn check_vector(&self, vector: &[f32]) -> GraphResult<()> {
        if vector.len() != self.dim {
            return Err(GraphError::Dimension {
                expected: self.dim,
                got: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(GraphError::NonFinite);
        }
        Ok(())
    }

    fn vector(&self, node: u32) -> &[f32] {
        let start = node as usize * self.dim;
        &self.vectors[start..start + self.dim]
    }

    fn distance_to(&self, query: &[f32], node: u32) -> f32 {
        distance(self.metric, query, self.vector(node))
    }

    fn max_links(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m * 2
        } else {
            self.params.m
        }
    }

    /// Attach `node` to `neighbor` on `layer`, pruning back to the nearest
    /// `max_links` when the list overflows.
    fn link(&mut self, neighbor: u32, node: u32, layer: usize) {
        let cap = self.max_links(layer);
        let list = &self.nodes[neighbor as usize].links[layer];
        if list.len() < cap {
            self.nodes[neighbor as usize].links[layer].push(node);
            return;
        }

        let base = self.vector(neighbor).to_vec();
        let mut ranked: Vec<Candidate> = list
            .iter()
            .chain(std::iter::once(&node))
            .map(|&n| Candidate {
                dist: distance(self.metric, &base, self.vector(n)),
                node: n,
            })
            .collect();
        ranked.sort_unstable();
        ranked.truncate(cap);
        self.nodes[neighbor as usize].links[layer] = ranked.into_iter().map(|c| c.node).collect();
    }

    fn greedy_closest(&self, query: &[f32], entry: u32, layer: usize) -> u32 {
        let mut current = entry;
        let mut current_dist = self.distance_to(query, current);
        loop {
            let mut improved = false;
            for &neighbor in &self.nodes[current as usize].links[layer] {
                let d = self.distance_to(query, neighbor);
                if d < current_dist {
                    current = neighbor;
                    current_dist = d;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Beam search on one layer; returns candidates sorted best first.
    fn search_layer(&self, query: &[f32], entry: u32, ef: usize, layer: usize) -> Vec<Candidate> {
        let ef = ef.max(1);
        let mut visited = vec![false; self.nodes.len()];
        visited[entry as usize] = true;

        let start = Candidate {
            dist: self.distance_to(query, entry),
            node: entry,
        };
        // Min-heap frontier, max-heap of the best `ef` found so far.
        let mut frontier = BinaryHeap::new();
        frontier.push(Reverse(start));
        let mut found = BinaryHeap::new();
        found.push(start);

        while let Some(Reverse(current)) = frontier.pop() {
            let worst = found.peek().expect("found is never empty").dist;
            if found.len() >= ef && current.dist > worst {
                break;
            }
            for &neighbor in &self.nodes[current.node as usize].links[layer] {
                if visited[neighbor as usize] {
                    continue;
                }
                visited[neighbor as usize] = true;
                let candidate = Candidate {
                    dist: self.distance_to(query, neighbor),
                    node: neighbor,
                };
                let worst = found.peek().expect("found is never empty");
                if found.len() < ef || candidate < *worst {
                    frontier.push(Reverse(candidate));
                    found.push(candidate);
                    if found.len() > ef {
                        found.pop();
                    }
                }
            }
        }

        let mut results = found.into_vec();
        results.sort_unstable();
        results
    }
}

/// Deterministic layer assignment: the ordinal's multiplicity in base `m`
/// yields the same geometric layer distribution an RNG would.
fn level_for(ordinal: u32, m: usize) -> usize {
    let m = m.max(2) as u64;
    let mut n = ordinal as u64 + 1;
    let mut level = 0;
    while n % m == 0 {
        level += 1;
        n /= m;
    }
    level
}

fn distance(metric: Metric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        Metric::SquaredEuclidean => a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| {
                let d = x - y;
                d * d
            })
            .sum(),
        Metric::InnerProduct => -a.iter().zip(b.iter()).map(|(x, y)| x * y).sum::<f32>(),
    }
}
