//! Derived similarity indexes and the registry of materialized ones.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::primitives::bytes::{ByteReader, ByteWriter};
use crate::types::{IndexId, PenumbraError, Result};

pub mod similarity;

pub use similarity::{Neighbor, SimilarityIndex};

/// Distance used by a similarity index.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Metric {
    /// Euclidean distance
    L2,
    /// One minus cosine similarity
    Cosine,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::L2 => f.write_str("l2"),
            Metric::Cosine => f.write_str("cosine"),
        }
    }
}

impl std::str::FromStr for Metric {
    type Err = PenumbraError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "l2" => Ok(Metric::L2),
            "cosine" => Ok(Metric::Cosine),
            _ => Err(PenumbraError::InvalidOwned(format!("unknown metric {s}"))),
        }
    }
}

/// Definition of a similarity index, persisted as the catalog entry's
/// auxiliary buffer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SimilarityIndexConfig {
    /// Indexed `FloatVector` column
    pub column: String,
    /// Distance metric
    pub metric: Metric,
    /// Neighbours kept per vector
    pub degree: u32,
}

const AUX_VERSION: u8 = 1;

impl SimilarityIndexConfig {
    /// Creates a config.
    pub fn new(column: impl Into<String>, metric: Metric, degree: u32) -> Self {
        Self {
            column: column.into(),
            metric,
            degree,
        }
    }

    /// Encodes the auxiliary buffer.
    pub fn to_aux_buffer(&self) -> Vec<u8> {
        let mut out = ByteWriter::new();
        out.put_u8(AUX_VERSION);
        out.put_str(&self.column);
        out.put_u8(match self.metric {
            Metric::L2 => 0,
            Metric::Cosine => 1,
        });
        out.put_u32(self.degree);
        out.into_inner()
    }

    /// Decodes an auxiliary buffer.
    pub fn from_aux_buffer(buf: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(buf);
        let version = r.get_u8()?;
        if version != AUX_VERSION {
            return Err(PenumbraError::Serialization(format!(
                "unsupported similarity index info version {version}"
            )));
        }
        let column = r.get_str()?;
        let metric = match r.get_u8()? {
            0 => Metric::L2,
            1 => Metric::Cosine,
            other => {
                return Err(PenumbraError::Serialization(format!(
                    "unknown metric tag {other}"
                )))
            }
        };
        let degree = r.get_u32()?;
        r.expect_end()?;
        Ok(Self {
            column,
            metric,
            degree,
        })
    }
}

/// Materialized indexes keyed by catalog id.
#[derive(Default)]
pub struct IndexRegistry {
    indexes: RwLock<HashMap<IndexId, Arc<SimilarityIndex>>>,
}

impl IndexRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Materialized index `id`, if any.
    pub fn get(&self, id: IndexId) -> Option<Arc<SimilarityIndex>> {
        self.indexes.read().get(&id).cloned()
    }

    /// Stores a materialized index, replacing an older one.
    pub fn insert(&self, id: IndexId, index: SimilarityIndex) -> Arc<SimilarityIndex> {
        let index = Arc::new(index);
        self.indexes.write().insert(id, Arc::clone(&index));
        index
    }

    /// Drops index `id`; returns whether it was materialized.
    pub fn remove(&self, id: IndexId) -> bool {
        self.indexes.write().remove(&id).is_some()
    }

    /// Number of materialized indexes.
    pub fn len(&self) -> usize {
        self.indexes.read().len()
    }

    /// Returns true when nothing is materialized.
    pub fn is_empty(&self) -> bool {
        self.indexes.read().is_empty()
    }
}
