//! Exact k-nearest-neighbour graph over a vector column.
//!
//! Each row's neighbour list holds the `degree` closest other rows. The graph
//! need not be connected, so search ranks every vector against the query and
//! keeps the best `k` in a bounded heap.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::{Metric, SimilarityIndexConfig};
use crate::types::{PenumbraError, Result};

pub(crate) fn l2(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        let diff = x - y;
        sum += diff * diff;
    }
    sum.sqrt()
}

pub(crate) fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let norm_product = (norm_a * norm_b).sqrt();
    if norm_product == 0.0 {
        return 1.0;
    }
    1.0 - (dot / norm_product)
}

impl Metric {
    /// Distance between two vectors of equal length; smaller is closer.
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::L2 => l2(a, b),
            Metric::Cosine => cosine(a, b),
        }
    }
}

/// A search hit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Neighbor {
    /// Row position in the indexed table
    pub row: u64,
    /// Distance to the query
    pub distance: f32,
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    node: usize,
    distance: f32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Min-heap on distance.
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .distance
            .partial_cmp(&self.distance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.node.cmp(&self.node))
    }
}

// Max-heap on distance, so the worst kept result sits on top.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Furthest(Candidate);

impl PartialOrd for Furthest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Furthest {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.cmp(&self.0)
    }
}

/// In-memory materialization of a similarity index.
#[derive(Debug)]
pub struct SimilarityIndex {
    config: SimilarityIndexConfig,
    dimension: usize,
    rows: Vec<u64>,
    vectors: Vec<Vec<f32>>,
    neighbors: Vec<Vec<u32>>,
}

impl SimilarityIndex {
    /// Builds the graph from `(row, vector)` pairs; rows with null vectors
    /// are simply absent from the input.
    pub fn build(
        config: SimilarityIndexConfig,
        dimension: usize,
        input: Vec<(u64, Vec<f32>)>,
    ) -> Result<Self> {
        if let Some((row, v)) = input.iter().find(|(_, v)| v.len() != dimension) {
            return Err(PenumbraError::InvalidOwned(format!(
                "row {row} has a vector of dimension {}, index expects {dimension}",
                v.len()
            )));
        }
        let (rows, vectors): (Vec<u64>, Vec<Vec<f32>>) = input.into_iter().unzip();
        let degree = config.degree as usize;
        let mut neighbors = Vec::with_capacity(vectors.len());
        for (i, v) in vectors.iter().enumerate() {
            let mut dists: Vec<Candidate> = vectors
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(j, w)| Candidate {
                    node: j,
                    distance: config.metric.distance(v, w),
                })
                .collect();
            dists.sort_by(|a, b| {
                a.distance
                    .partial_cmp(&b.distance)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.node.cmp(&b.node))
            });
            dists.truncate(degree);
            neighbors.push(dists.into_iter().map(|c| c.node as u32).collect());
        }
        Ok(Self {
            config,
            dimension,
            rows,
            vectors,
            neighbors,
        })
    }

    /// Index definition.
    pub fn config(&self) -> &SimilarityIndexConfig {
        &self.config
    }

    /// Number of indexed vectors.
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    /// Returns true when no vector was indexed.
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Neighbour list of the `node`-th indexed vector.
    pub fn neighbors_of(&self, node: usize) -> Option<&[u32]> {
        self.neighbors.get(node).map(Vec::as_slice)
    }

    /// Returns the `k` closest rows to `query`, closest first.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if query.len() != self.dimension {
            return Err(PenumbraError::InvalidOwned(format!(
                "query has dimension {}, index expects {}",
                query.len(),
                self.dimension
            )));
        }
        if k == 0 || self.vectors.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .top_k(query, k)
            .into_iter()
            .map(|c| Neighbor {
                row: self.rows[c.node],
                distance: c.distance,
            })
            .collect())
    }

    fn distance_to(&self, query: &[f32], node: usize) -> Candidate {
        Candidate {
            node,
            distance: self.config.metric.distance(query, &self.vectors[node]),
        }
    }

    fn top_k(&self, query: &[f32], k: usize) -> Vec<Candidate> {
        let mut results: BinaryHeap<Furthest> = BinaryHeap::with_capacity(k + 1);
        for node in 0..self.vectors.len() {
            let cand = Furthest(self.distance_to(query, node));
            if results.len() < k {
                results.push(cand);
            } else if results.peek().is_some_and(|worst| cand < *worst) {
                results.pop();
                results.push(cand);
            }
        }
        let mut out: Vec<Candidate> = results.into_iter().map(|f| f.0).collect();
        out.sort_by(|a, b| b.cmp(a));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(metric: Metric, degree: u32) -> SimilarityIndexConfig {
        SimilarityIndexConfig {
            column: "emb".into(),
            metric,
            degree,
        }
    }

    #[test]
    fn distances() {
        assert_eq!(l2(&[0.0, 0.0], &[3.0, 4.0]), 5.0);
        assert!(cosine(&[1.0, 0.0], &[1.0, 0.0]).abs() < 1e-6);
        assert!((cosine(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
    }

    #[test]
    fn graph_holds_closest_neighbours() -> Result<()> {
        let input = vec![
            (10, vec![0.0, 0.0]),
            (11, vec![1.0, 0.0]),
            (12, vec![5.0, 0.0]),
            (13, vec![6.0, 0.0]),
        ];
        let index = SimilarityIndex::build(config(Metric::L2, 1), 2, input)?;
        assert_eq!(index.neighbors_of(0), Some(&[1u32][..]));
        assert_eq!(index.neighbors_of(3), Some(&[2u32][..]));
        Ok(())
    }

    #[test]
    fn search_returns_closest_first() -> Result<()> {
        let input = (0..20u64).map(|i| (i, vec![i as f32, 0.0])).collect();
        let index = SimilarityIndex::build(config(Metric::L2, 4), 2, input)?;
        let hits = index.search(&[7.2, 0.0], 3)?;
        let rows: Vec<u64> = hits.iter().map(|h| h.row).collect();
        assert_eq!(rows, vec![7, 8, 6]);
        Ok(())
    }

    #[test]
    fn large_input_is_ranked_exactly() -> Result<()> {
        let input = (0..200u64).map(|i| (i, vec![i as f32])).collect();
        let index = SimilarityIndex::build(config(Metric::L2, 4), 1, input)?;
        let hits = index.search(&[150.1], 2)?;
        assert_eq!(hits[0].row, 150);
        assert_eq!(hits[1].row, 151);
        Ok(())
    }

    #[test]
    fn search_reaches_every_cluster() -> Result<()> {
        let near = (0..100u64).map(|i| (i, vec![i as f32]));
        let far = (0..100u64).map(|i| (100 + i, vec![100_000.0 + i as f32]));
        let index = SimilarityIndex::build(config(Metric::L2, 4), 1, near.chain(far).collect())?;
        // No neighbour list crosses between the clusters.
        assert!((0..100).all(|n| index.neighbors_of(n).is_some_and(|l| l.iter().all(|&m| m < 100))));

        let hits = index.search(&[100_050.0], 3)?;
        let rows: Vec<u64> = hits.iter().map(|h| h.row).collect();
        assert_eq!(rows, vec![150, 149, 151]);
        assert_eq!(hits[0].distance, 0.0);

        let hits = index.search(&[3.0], 1)?;
        assert_eq!(hits[0].row, 3);
        Ok(())
    }

    #[test]
    fn ties_keep_the_lower_row() -> Result<()> {
        let input = vec![(0, vec![1.0]), (1, vec![-1.0]), (2, vec![5.0])];
        let index = SimilarityIndex::build(config(Metric::L2, 1), 1, input)?;
        let rows: Vec<u64> = index.search(&[0.0], 2)?.iter().map(|h| h.row).collect();
        assert_eq!(rows, vec![0, 1]);
        Ok(())
    }

    #[test]
    fn dimension_mismatch_is_rejected() -> Result<()> {
        assert!(SimilarityIndex::build(config(Metric::L2, 2), 2, vec![(0, vec![1.0])]).is_err());
        let index = SimilarityIndex::build(config(Metric::Cosine, 2), 2, vec![(0, vec![1.0, 1.0])])?;
        assert!(index.search(&[1.0], 1).is_err());
        assert!(index.search(&[1.0, 1.0], 0)?.is_empty());
        Ok(())
    }
}
