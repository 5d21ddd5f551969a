//! Embedded table store with shadow-page checkpoints, WAL recovery and
//! background-loaded similarity indexes.

#![warn(missing_docs)]

pub mod admin;
pub mod catalog;
pub mod db;
pub mod index;
pub mod loader;
pub mod primitives;
pub mod storage;
pub mod transaction;
pub mod types;

pub use catalog::Catalog;
pub use db::{Database, DatabaseLayout, DbIoStats, LifecycleState, SystemConfig};
pub use index::{Metric, Neighbor, SimilarityIndexConfig};
pub use loader::LoadStatus;
pub use storage::table::{Column, ColumnType, Value};
pub use storage::{CheckpointOutcome, SkipReason};
pub use transaction::{Transaction, TransactionKind};
pub use types::{FailPoint, PenumbraError, Result};
