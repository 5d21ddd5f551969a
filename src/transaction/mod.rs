//! Transactions, their logical operation log and their private row buffers.
//!
//! A write transaction validates every operation against a scratch copy of
//! the catalog, so nothing it commits can fail to apply. Committed state only
//! changes inside [`Transaction::commit`].

use std::collections::HashMap;

use parking_lot::{MutexGuard, RwLock};
use tracing::debug;

use crate::catalog::Catalog;
use crate::db::DbInner;
use crate::index::SimilarityIndexConfig;
use crate::primitives::bytes::{ByteReader, ByteWriter};
use crate::storage::table::{validate_row, Column, ColumnType, Value};
use crate::types::{PenumbraError, Result, TxnId};

const OP_CREATE_TABLE: u8 = 1;
const OP_DROP_TABLE: u8 = 2;
const OP_CREATE_INDEX: u8 = 3;
const OP_DROP_INDEX: u8 = 4;
const OP_INSERT: u8 = 5;

/// What a transaction may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Reads committed state only
    ReadOnly,
    /// Holds the writer lock and may change schema and data
    Write,
    /// Replays a WAL commit record during open
    Recovery,
}

/// The state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting operations
    Active,
    /// Changes are durable and applied
    Committed,
    /// Changes were discarded
    RolledBack,
}

/// A logical operation recorded in the WAL.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Create a table
    CreateTable {
        /// Table name
        name: String,
        /// Column definitions
        columns: Vec<Column>,
    },
    /// Drop a table and its indexes
    DropTable {
        /// Table name
        name: String,
    },
    /// Create a similarity index
    CreateIndex {
        /// Index name
        name: String,
        /// Indexed table
        table: String,
        /// Index definition
        config: SimilarityIndexConfig,
    },
    /// Drop an index
    DropIndex {
        /// Index name
        name: String,
    },
    /// Append rows to a table
    Insert {
        /// Table name
        table: String,
        /// Rows in column order
        rows: Vec<Vec<Value>>,
    },
}

impl Op {
    pub(crate) fn encode(&self, out: &mut ByteWriter) {
        match self {
            Op::CreateTable { name, columns } => {
                out.put_u8(OP_CREATE_TABLE);
                out.put_str(name);
                out.put_u16(columns.len() as u16);
                for column in columns {
                    out.put_str(&column.name);
                    column.ty.encode(out);
                }
            }
            Op::DropTable { name } => {
                out.put_u8(OP_DROP_TABLE);
                out.put_str(name);
            }
            Op::CreateIndex {
                name,
                table,
                config,
            } => {
                out.put_u8(OP_CREATE_INDEX);
                out.put_str(name);
                out.put_str(table);
                out.put_bytes(&config.to_aux_buffer());
            }
            Op::DropIndex { name } => {
                out.put_u8(OP_DROP_INDEX);
                out.put_str(name);
            }
            Op::Insert { table, rows } => {
                out.put_u8(OP_INSERT);
                out.put_str(table);
                out.put_u32(rows.len() as u32);
                for row in rows {
                    out.put_u16(row.len() as u16);
                    for value in row {
                        value.encode(out);
                    }
                }
            }
        }
    }

    pub(crate) fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let op = match r.get_u8()? {
            OP_CREATE_TABLE => {
                let name = r.get_str()?;
                let count = r.get_u16()? as usize;
                let mut columns = Vec::with_capacity(count);
                for _ in 0..count {
                    let column_name = r.get_str()?;
                    columns.push(Column::new(column_name, ColumnType::decode(r)?));
                }
                Op::CreateTable { name, columns }
            }
            OP_DROP_TABLE => Op::DropTable { name: r.get_str()? },
            OP_CREATE_INDEX => Op::CreateIndex {
                name: r.get_str()?,
                table: r.get_str()?,
                config: SimilarityIndexConfig::from_aux_buffer(r.get_bytes()?)?,
            },
            OP_DROP_INDEX => Op::DropIndex { name: r.get_str()? },
            OP_INSERT => {
                let table = r.get_str()?;
                let count = r.get_u32()? as usize;
                let mut rows = Vec::with_capacity(count.min(r.remaining()));
                for _ in 0..count {
                    let width = r.get_u16()? as usize;
                    let mut row = Vec::with_capacity(width);
                    for _ in 0..width {
                        row.push(Value::decode(r)?);
                    }
                    rows.push(row);
                }
                Op::Insert { table, rows }
            }
            other => {
                return Err(PenumbraError::Serialization(format!(
                    "unknown operation tag {other}"
                )))
            }
        };
        Ok(op)
    }
}

/// A decoded WAL commit record.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRecord {
    /// Committing transaction
    pub txn_id: TxnId,
    /// Operations in execution order
    pub ops: Vec<Op>,
}

impl CommitRecord {
    /// Decodes a commit payload written by [`LocalWal::payload`].
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(payload);
        let txn_id = TxnId(r.get_u64()?);
        let count = r.get_u32()? as usize;
        let mut ops = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            ops.push(Op::decode(&mut r)?);
        }
        r.expect_end()?;
        Ok(Self { txn_id, ops })
    }
}

/// Operations a transaction has logged but not yet committed.
#[derive(Debug, Default)]
pub struct LocalWal {
    ops: Vec<Op>,
    encoded: ByteWriter,
}

impl LocalWal {
    fn append(&mut self, op: Op) {
        op.encode(&mut self.encoded);
        self.ops.push(op);
    }

    /// Encoded size of the pending operations in bytes.
    pub fn size(&self) -> u64 {
        self.encoded.len() as u64
    }

    /// Returns true when nothing was logged.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Pending operations in execution order.
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// The WAL commit payload for these operations.
    pub fn payload(&self, txn_id: TxnId) -> Vec<u8> {
        let mut out = ByteWriter::new();
        out.put_u64(txn_id.0);
        out.put_u32(self.ops.len() as u32);
        out.put_raw(self.encoded.as_slice());
        out.into_inner()
    }
}

/// Rows a transaction inserted, keyed by table name.
#[derive(Debug, Default)]
pub struct LocalStorage {
    rows: RwLock<HashMap<String, Vec<Vec<Value>>>>,
}

impl LocalStorage {
    fn append(&self, table: &str, rows: &[Vec<Value>]) {
        self.rows
            .write()
            .entry(table.to_string())
            .or_default()
            .extend_from_slice(rows);
    }

    fn drop_table(&self, table: &str) {
        self.rows.write().remove(table);
    }

    /// Pending rows of `table`.
    pub fn rows(&self, table: &str) -> Vec<Vec<Value>> {
        self.rows.read().get(table).cloned().unwrap_or_default()
    }

    /// Total pending rows across tables.
    pub fn num_rows(&self) -> usize {
        self.rows.read().values().map(Vec::len).sum()
    }
}

/// A unit of reads and writes against one database.
///
/// Write transactions hold the database's writer lock until they are
/// committed, rolled back or dropped. Dropping an active transaction rolls
/// it back.
///
/// # Example
///
/// ```rust
/// use penumbra::{Column, ColumnType, Database, Value};
///
/// let db = Database::open_in_memory()?;
/// let mut txn = db.begin_write()?;
/// txn.create_table("docs", vec![Column::new("id", ColumnType::Int64)])?;
/// txn.insert("docs", vec![vec![Value::Int(1)]])?;
/// txn.commit()?;
/// assert_eq!(db.table_rows("docs")?.len(), 1);
/// # Ok::<(), penumbra::PenumbraError>(())
/// ```
pub struct Transaction<'db> {
    db: &'db DbInner,
    id: TxnId,
    kind: TransactionKind,
    state: TxState,
    scratch: Option<Catalog>,
    local_wal: LocalWal,
    local_storage: LocalStorage,
    _writer: Option<MutexGuard<'db, ()>>,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(
        db: &'db DbInner,
        id: TxnId,
        kind: TransactionKind,
        writer: Option<MutexGuard<'db, ()>>,
    ) -> Self {
        let scratch = match kind {
            TransactionKind::ReadOnly => None,
            TransactionKind::Write | TransactionKind::Recovery => Some(db.catalog_snapshot()),
        };
        debug!(txn = %id, ?kind, "txn.begin");
        Self {
            db,
            id,
            kind,
            state: TxState::Active,
            scratch,
            local_wal: LocalWal::default(),
            local_storage: LocalStorage::default(),
            _writer: writer,
        }
    }

    /// Transaction id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Transaction kind.
    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    /// Current state.
    pub fn state(&self) -> TxState {
        self.state
    }

    /// True for transactions replaying the WAL at open.
    pub fn is_recovery(&self) -> bool {
        self.kind == TransactionKind::Recovery
    }

    /// Operations logged so far.
    pub fn local_wal(&self) -> &LocalWal {
        &self.local_wal
    }

    /// Rows inserted so far.
    pub fn local_storage(&self) -> &LocalStorage {
        &self.local_storage
    }

    fn scratch(&mut self) -> Result<&mut Catalog> {
        if self.state != TxState::Active {
            return Err(PenumbraError::Invalid("transaction is no longer active"));
        }
        self.scratch
            .as_mut()
            .ok_or(PenumbraError::Invalid("read-only transaction cannot write"))
    }

    /// Creates a table.
    pub fn create_table(&mut self, name: &str, columns: Vec<Column>) -> Result<()> {
        self.scratch()?.create_table(name, columns.clone())?;
        self.local_wal.append(Op::CreateTable {
            name: name.to_string(),
            columns,
        });
        Ok(())
    }

    /// Drops a table together with its indexes.
    pub fn drop_table(&mut self, name: &str) -> Result<()> {
        self.scratch()?.drop_table(name)?;
        self.local_storage.drop_table(name);
        self.local_wal.append(Op::DropTable {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Creates a similarity index over a vector column of `table`. The index
    /// is materialized lazily.
    pub fn create_index(
        &mut self,
        name: &str,
        table: &str,
        config: SimilarityIndexConfig,
    ) -> Result<()> {
        self.scratch()?.create_index(name, table, config.clone())?;
        self.local_wal.append(Op::CreateIndex {
            name: name.to_string(),
            table: table.to_string(),
            config,
        });
        Ok(())
    }

    /// Drops an index.
    pub fn drop_index(&mut self, name: &str) -> Result<()> {
        self.scratch()?.drop_index(name)?;
        self.local_wal.append(Op::DropIndex {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Appends rows to `table`.
    pub fn insert(&mut self, table: &str, rows: Vec<Vec<Value>>) -> Result<()> {
        let catalog = self.scratch()?;
        let entry = catalog
            .table_by_name(table)
            .ok_or_else(|| PenumbraError::InvalidOwned(format!("table {table} does not exist")))?;
        for row in &rows {
            validate_row(&entry.columns, row)?;
        }
        if rows.is_empty() {
            return Ok(());
        }
        self.local_storage.append(table, &rows);
        self.local_wal.append(Op::Insert {
            table: table.to_string(),
            rows,
        });
        Ok(())
    }

    /// Committed rows of `table` followed by this transaction's own inserts.
    pub fn scan(&self, table: &str) -> Result<Vec<Vec<Value>>> {
        let mut rows = match &self.scratch {
            Some(catalog) => {
                let entry = catalog.table_by_name(table).ok_or(PenumbraError::NotFound)?;
                self.db.committed_rows(entry.id)?
            }
            None => self.db.committed_rows_by_name(table)?,
        };
        rows.extend(self.local_storage.rows(table));
        Ok(rows)
    }

    pub(crate) fn apply_replayed(&mut self, op: Op) -> Result<()> {
        match op {
            Op::CreateTable { name, columns } => self.create_table(&name, columns),
            Op::DropTable { name } => self.drop_table(&name),
            Op::CreateIndex {
                name,
                table,
                config,
            } => self.create_index(&name, &table, config),
            Op::DropIndex { name } => self.drop_index(&name),
            Op::Insert { table, rows } => self.insert(&table, rows),
        }
    }

    /// Makes the transaction's changes durable and visible.
    pub fn commit(mut self) -> Result<()> {
        if self.state != TxState::Active {
            return Err(PenumbraError::Invalid("transaction is no longer active"));
        }
        self.db.commit(&self)?;
        self.state = TxState::Committed;
        debug!(txn = %self.id, ops = self.local_wal.ops.len(), "txn.commit");
        Ok(())
    }

    /// Discards the transaction's changes.
    pub fn rollback(mut self) {
        self.state = TxState::RolledBack;
        debug!(
            txn = %self.id,
            ops = self.local_wal.ops.len(),
            rows = self.local_storage.num_rows(),
            "txn.rollback"
        );
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == TxState::Active && !self.local_wal.is_empty() {
            debug!(txn = %self.id, ops = self.local_wal.ops.len(), "txn.rollback.on_drop");
        }
    }
}
