use std::fmt;

use tracing::debug;

use crate::primitives::bytes::{tag, ByteReader, ByteWriter};
use crate::primitives::io::FileIo;
use crate::storage::buffer::BufferManager;
use crate::storage::file_writer::{BufferedFileReader, InMemFileWriter};
use crate::storage::overflow::{OverflowRef, OverflowStorageInfo, OverflowStore};
use crate::storage::page_manager::PageManager;
use crate::storage::shadow::ShadowFile;
use crate::types::{PageRange, PenumbraError, Result, TableId};

const ROWS_TAG: u32 = tag(*b"ROWS");

const CELL_NULL: u8 = 0;
const CELL_INT: u8 = 1;
const CELL_FLOAT: u8 = 2;
const CELL_STR: u8 = 3;
const CELL_SPILLED: u8 = 4;
const CELL_VECTOR: u8 = 5;

/// Logical type of a column.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ColumnType {
    /// 64-bit signed integer
    Int64,
    /// 64-bit float
    Float64,
    /// UTF-8 string; long values spill to the overflow store
    String,
    /// Fixed-dimension `f32` vector
    FloatVector(u32),
}

impl ColumnType {
    pub(crate) fn encode(&self, out: &mut ByteWriter) {
        match self {
            ColumnType::Int64 => out.put_u8(0),
            ColumnType::Float64 => out.put_u8(1),
            ColumnType::String => out.put_u8(2),
            ColumnType::FloatVector(dim) => {
                out.put_u8(3);
                out.put_u32(*dim);
            }
        }
    }

    pub(crate) fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(match r.get_u8()? {
            0 => ColumnType::Int64,
            1 => ColumnType::Float64,
            2 => ColumnType::String,
            3 => ColumnType::FloatVector(r.get_u32()?),
            other => {
                return Err(PenumbraError::Serialization(format!(
                    "unknown column type tag {other}"
                )))
            }
        })
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Int64 => f.write_str("INT64"),
            ColumnType::Float64 => f.write_str("DOUBLE"),
            ColumnType::String => f.write_str("STRING"),
            ColumnType::FloatVector(dim) => write!(f, "FLOAT[{dim}]"),
        }
    }
}

/// Named, typed column of a table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Column {
    /// Column name, unique within its table
    pub name: String,
    /// Column type
    pub ty: ColumnType,
}

impl Column {
    /// Creates a column definition.
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// A cell value as seen by callers.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Missing value, allowed in every column
    Null,
    /// `Int64` value
    Int(i64),
    /// `Float64` value
    Float(f64),
    /// `String` value
    Str(String),
    /// `FloatVector` value
    Vector(Vec<f32>),
}

impl Value {
    pub(crate) fn encode(&self, out: &mut ByteWriter) {
        match self {
            Value::Null => out.put_u8(CELL_NULL),
            Value::Int(v) => {
                out.put_u8(CELL_INT);
                out.put_i64(*v);
            }
            Value::Float(v) => {
                out.put_u8(CELL_FLOAT);
                out.put_f64(*v);
            }
            Value::Str(s) => {
                out.put_u8(CELL_STR);
                out.put_str(s);
            }
            Value::Vector(v) => {
                out.put_u8(CELL_VECTOR);
                put_vector(out, v);
            }
        }
    }

    pub(crate) fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(match r.get_u8()? {
            CELL_NULL => Value::Null,
            CELL_INT => Value::Int(r.get_i64()?),
            CELL_FLOAT => Value::Float(r.get_f64()?),
            CELL_STR => Value::Str(r.get_str()?),
            CELL_VECTOR => Value::Vector(get_vector(r)?),
            other => {
                return Err(PenumbraError::Serialization(format!(
                    "unknown value tag {other}"
                )))
            }
        })
    }
}

fn put_vector(out: &mut ByteWriter, v: &[f32]) {
    out.put_u32(v.len() as u32);
    for x in v {
        out.put_f32(*x);
    }
}

fn get_vector(r: &mut ByteReader<'_>) -> Result<Vec<f32>> {
    let dim = r.get_u32()? as usize;
    if dim > r.remaining() / 4 {
        return Err(PenumbraError::Serialization("vector length exceeds input".into()));
    }
    (0..dim).map(|_| r.get_f32()).collect()
}

/// Checks `row` against the table schema.
pub fn validate_row(columns: &[Column], row: &[Value]) -> Result<()> {
    if row.len() != columns.len() {
        return Err(PenumbraError::InvalidOwned(format!(
            "row has {} values, table has {} columns",
            row.len(),
            columns.len()
        )));
    }
    for (column, value) in columns.iter().zip(row) {
        let ok = match (&column.ty, value) {
            (_, Value::Null) => true,
            (ColumnType::Int64, Value::Int(_)) => true,
            (ColumnType::Float64, Value::Float(_)) => true,
            (ColumnType::String, Value::Str(_)) => true,
            (ColumnType::FloatVector(dim), Value::Vector(v)) => v.len() == *dim as usize,
            _ => false,
        };
        if !ok {
            return Err(PenumbraError::InvalidOwned(format!(
                "value {value:?} does not fit column {} of type {}",
                column.name, column.ty
            )));
        }
    }
    Ok(())
}

/// Persisted location of a table's rows. `num_rows == 0` exactly when
/// `rows_range` is the sentinel; the overflow info follows its own pairing.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TableStorageInfo {
    /// Rows stored in `rows_range`
    pub num_rows: u64,
    /// Pages holding the encoded rows
    pub rows_range: PageRange,
    /// The table's overflow store
    pub overflow: OverflowStorageInfo,
}

impl TableStorageInfo {
    /// Info of a table that never persisted a row.
    pub const EMPTY: TableStorageInfo = TableStorageInfo {
        num_rows: 0,
        rows_range: PageRange::INVALID,
        overflow: OverflowStorageInfo::ABSENT,
    };

    /// Checks every sentinel pairing the info must obey.
    pub fn check_pairing(&self) -> Result<()> {
        if (self.num_rows == 0) == self.rows_range.is_valid() {
            return Err(PenumbraError::Corruption(
                "table row count and rows range disagree on presence",
            ));
        }
        self.overflow.check_pairing()?;
        if self.num_rows == 0 && !self.overflow.is_absent() {
            return Err(PenumbraError::Corruption("empty table owns overflow pages"));
        }
        Ok(())
    }

    pub(crate) fn encode(&self, out: &mut ByteWriter) {
        out.put_u64(self.num_rows);
        out.put_page_range(&self.rows_range);
        self.overflow.encode(out);
    }

    pub(crate) fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let info = Self {
            num_rows: r.get_u64()?,
            rows_range: r.get_page_range()?,
            overflow: OverflowStorageInfo::decode(r)?,
        };
        info.check_pairing()?;
        Ok(info)
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Cell {
    Value(Value),
    Spilled(OverflowRef),
}

/// Rows of one table plus the overflow store its long strings spill into.
#[derive(Clone, Debug)]
pub struct NodeTable {
    id: TableId,
    columns: Vec<Column>,
    rows: Vec<Vec<Cell>>,
    overflow: OverflowStore,
    info: TableStorageInfo,
    inline_limit: usize,
    changed: bool,
}

impl NodeTable {
    /// Empty table.
    pub fn new(id: TableId, columns: Vec<Column>, inline_limit: usize) -> Self {
        Self {
            id,
            columns,
            rows: Vec::new(),
            overflow: OverflowStore::new(),
            info: TableStorageInfo::EMPTY,
            inline_limit,
            changed: false,
        }
    }

    /// Table id.
    pub fn id(&self) -> TableId {
        self.id
    }

    /// Schema.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Position of the column named `name`.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Live row count.
    pub fn num_rows(&self) -> u64 {
        self.rows.len() as u64
    }

    /// On-disk location as of the last checkpoint.
    pub fn storage_info(&self) -> TableStorageInfo {
        self.info
    }

    /// The table's overflow store.
    pub fn overflow(&self) -> &OverflowStore {
        &self.overflow
    }

    /// True when rows arrived since the last checkpoint.
    pub fn has_changes(&self) -> bool {
        self.changed || self.overflow.has_changes()
    }

    /// Appends one row. Strings longer than the inline limit go to the
    /// overflow store.
    pub fn insert(&mut self, row: Vec<Value>) -> Result<()> {
        validate_row(&self.columns, &row)?;
        let mut cells = Vec::with_capacity(row.len());
        for value in row {
            let cell = match value {
                Value::Str(s) if s.len() > self.inline_limit => {
                    Cell::Spilled(self.overflow.spill(&s)?)
                }
                other => Cell::Value(other),
            };
            cells.push(cell);
        }
        self.rows.push(cells);
        self.changed = true;
        Ok(())
    }

    /// Row `idx` with spilled strings resolved.
    pub fn row(&self, idx: usize) -> Result<Vec<Value>> {
        let cells = self.rows.get(idx).ok_or(PenumbraError::NotFound)?;
        cells.iter().map(|cell| self.resolve(cell)).collect()
    }

    /// Every row in insertion order.
    pub fn scan(&self) -> Result<Vec<Vec<Value>>> {
        (0..self.rows.len()).map(|i| self.row(i)).collect()
    }

    /// Values of one column, `None` for nulls.
    pub fn vector_column(&self, col: usize) -> Result<Vec<Option<Vec<f32>>>> {
        self.rows
            .iter()
            .map(|cells| match cells.get(col) {
                Some(Cell::Value(Value::Vector(v))) => Ok(Some(v.clone())),
                Some(Cell::Value(Value::Null)) => Ok(None),
                _ => Err(PenumbraError::Invalid("column does not hold vectors")),
            })
            .collect()
    }

    fn resolve(&self, cell: &Cell) -> Result<Value> {
        match cell {
            Cell::Value(v) => Ok(v.clone()),
            Cell::Spilled(r) => Ok(Value::Str(self.overflow.read(*r)?)),
        }
    }

    /// Writes rows and overflow data if either changed. Returns whether
    /// anything was written.
    pub fn checkpoint(
        &mut self,
        page_manager: &mut PageManager,
        shadow: &mut ShadowFile,
        main: &dyn FileIo,
        page_size: u32,
    ) -> Result<bool> {
        let mut wrote = self
            .overflow
            .checkpoint(page_manager, shadow, main, page_size)?;
        if self.changed {
            page_manager.free(self.info.rows_range)?;
            let mut writer = InMemFileWriter::new(page_size);
            let mut body = ByteWriter::new();
            self.encode_rows(&mut body);
            writer.writer().put_section(ROWS_TAG, body.as_slice());
            let rows_range = if self.rows.is_empty() {
                PageRange::INVALID
            } else {
                writer.flush(page_manager, shadow, main)?
            };
            self.info.rows_range = rows_range;
            self.info.num_rows = self.num_rows();
            self.changed = false;
            wrote = true;
            debug!(
                table = self.id.0,
                rows = self.info.num_rows,
                pages = rows_range.num_pages,
                "table.checkpoint"
            );
        }
        self.info.overflow = self.overflow.info();
        Ok(wrote)
    }

    fn encode_rows(&self, out: &mut ByteWriter) {
        out.put_u64(self.rows.len() as u64);
        out.put_u16(self.columns.len() as u16);
        for cells in &self.rows {
            for cell in cells {
                match cell {
                    Cell::Value(v) => v.encode(out),
                    Cell::Spilled(r) => {
                        out.put_u8(CELL_SPILLED);
                        out.put_u64(r.offset);
                        out.put_u32(r.len);
                    }
                }
            }
        }
    }

    /// Loads a table persisted at `info`.
    pub fn load(
        id: TableId,
        columns: Vec<Column>,
        info: TableStorageInfo,
        inline_limit: usize,
        main: &dyn FileIo,
        buffer: &BufferManager,
        verify_checksums: bool,
    ) -> Result<Self> {
        info.check_pairing()?;
        let overflow = OverflowStore::load(info.overflow, main, buffer, verify_checksums)?;
        let mut table = NodeTable::new(id, columns, inline_limit);
        table.overflow = overflow;
        table.info = info;
        if info.num_rows == 0 {
            return Ok(table);
        }
        let mut reader = BufferedFileReader::new(main, buffer);
        reader.seek_to_range(info.rows_range)?;
        let section = reader.read_section()?;
        let mut r = ByteReader::new(&section);
        let body = r.get_section(ROWS_TAG, verify_checksums)?;
        let mut r = ByteReader::new(body);
        let num_rows = r.get_u64()?;
        let num_cols = r.get_u16()? as usize;
        if num_rows != info.num_rows || num_cols != table.columns.len() {
            return Err(PenumbraError::Corruption(
                "table rows disagree with storage metadata",
            ));
        }
        for _ in 0..num_rows {
            let mut cells = Vec::with_capacity(num_cols);
            for _ in 0..num_cols {
                let cell = if r.peek_u8()? == CELL_SPILLED {
                    r.get_u8()?;
                    Cell::Spilled(OverflowRef {
                        offset: r.get_u64()?,
                        len: r.get_u32()?,
                    })
                } else {
                    Cell::Value(Value::decode(&mut r)?)
                };
                cells.push(cell);
            }
            table.rows.push(cells);
        }
        r.expect_end()?;
        for i in 0..table.rows.len() {
            let row = table.row(i)?;
            validate_row(&table.columns, &row)
                .map_err(|_| PenumbraError::Corruption("persisted row does not match schema"))?;
        }
        Ok(table)
    }

    /// Releases every page the table owns.
    pub fn free_pages(&mut self, page_manager: &mut PageManager) -> Result<()> {
        page_manager.free(self.info.rows_range)?;
        self.overflow.free_pages(page_manager)?;
        self.info = TableStorageInfo::EMPTY;
        Ok(())
    }

    pub(crate) fn checkpoint_snapshot(&self) -> (TableStorageInfo, bool, bool) {
        (self.info, self.changed, self.overflow.has_changes())
    }

    pub(crate) fn restore(&mut self, snapshot: (TableStorageInfo, bool, bool)) {
        let (info, changed, overflow_changed) = snapshot;
        self.info = info;
        self.changed = changed;
        self.overflow.restore(info.overflow, overflow_changed);
    }
}
