#![forbid(unsafe_code)]

//! Schema of tables and derived indexes.
//!
//! Entries live in id-keyed arenas; indexes refer to their table by
//! [`TableId`]. Only DDL raises the change flag: materializing an index flips
//! [`IndexCatalogEntry::is_loaded`] without making the catalog dirty.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use tracing::trace;

use crate::index::SimilarityIndexConfig;
use crate::primitives::bytes::{tag, ByteReader, ByteWriter};
use crate::storage::table::{Column, ColumnType};
use crate::types::{IndexId, PenumbraError, Result, TableId};

const CATALOG_TAG: u32 = tag(*b"CTLG");

/// Schema of one table.
#[derive(Clone, Debug, PartialEq)]
pub struct TableCatalogEntry {
    /// Arena id
    pub id: TableId,
    /// Unique table name
    pub name: String,
    /// Column definitions
    pub columns: Vec<Column>,
}

/// A derived index over a table.
#[derive(Clone, Debug)]
pub struct IndexCatalogEntry {
    /// Arena id
    pub id: IndexId,
    /// Unique index name
    pub name: String,
    /// Indexed table
    pub table: TableId,
    aux_buffer: Vec<u8>,
    aux_info: OnceLock<SimilarityIndexConfig>,
    is_loaded: bool,
}

impl IndexCatalogEntry {
    /// Serialized index definition.
    pub fn aux_buffer(&self) -> &[u8] {
        &self.aux_buffer
    }

    /// Index definition, decoded from the auxiliary buffer on first use.
    pub fn aux_info(&self) -> Result<&SimilarityIndexConfig> {
        if let Some(info) = self.aux_info.get() {
            return Ok(info);
        }
        let decoded = SimilarityIndexConfig::from_aux_buffer(&self.aux_buffer)?;
        Ok(self.aux_info.get_or_init(|| decoded))
    }

    /// True when an in-memory index currently backs this entry.
    pub fn is_loaded(&self) -> bool {
        self.is_loaded
    }

    /// True when the auxiliary buffer has already been decoded.
    pub fn is_aux_info_decoded(&self) -> bool {
        self.aux_info.get().is_some()
    }
}

impl PartialEq for IndexCatalogEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.table == other.table
            && self.aux_buffer == other.aux_buffer
    }
}

/// In-memory catalog.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    tables: BTreeMap<TableId, TableCatalogEntry>,
    indexes: BTreeMap<IndexId, IndexCatalogEntry>,
    next_table_id: u32,
    next_index_id: u32,
    changed: bool,
    version: u64,
}

impl PartialEq for Catalog {
    fn eq(&self, other: &Self) -> bool {
        self.tables == other.tables
            && self.indexes == other.indexes
            && self.next_table_id == other.next_table_id
            && self.next_index_id == other.next_index_id
    }
}

impl Catalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table.
    pub fn create_table(&mut self, name: &str, columns: Vec<Column>) -> Result<TableId> {
        if name.is_empty() {
            return Err(PenumbraError::Invalid("table name must not be empty"));
        }
        if self.table_by_name(name).is_some() {
            return Err(PenumbraError::InvalidOwned(format!(
                "table {name} already exists"
            )));
        }
        if columns.is_empty() {
            return Err(PenumbraError::Invalid("table needs at least one column"));
        }
        for (i, column) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.name == column.name) {
                return Err(PenumbraError::InvalidOwned(format!(
                    "duplicate column {} in table {name}",
                    column.name
                )));
            }
            if matches!(column.ty, ColumnType::FloatVector(0)) {
                return Err(PenumbraError::Invalid("vector columns need a dimension"));
            }
        }
        let id = TableId(self.next_table_id);
        self.next_table_id += 1;
        self.tables.insert(
            id,
            TableCatalogEntry {
                id,
                name: name.to_owned(),
                columns,
            },
        );
        self.changed = true;
        trace!(table = id.0, name, "catalog.create_table");
        Ok(id)
    }

    /// Removes a table and every index on it. Returns the ids removed.
    pub fn drop_table(&mut self, name: &str) -> Result<(TableId, Vec<IndexId>)> {
        let id = self
            .table_by_name(name)
            .map(|t| t.id)
            .ok_or_else(|| PenumbraError::InvalidOwned(format!("table {name} does not exist")))?;
        let dropped: Vec<IndexId> = self.indexes_on(id).map(|e| e.id).collect();
        for index in &dropped {
            self.indexes.remove(index);
        }
        self.tables.remove(&id);
        self.changed = true;
        Ok((id, dropped))
    }

    /// Adds a similarity index over a vector column of `table`.
    pub fn create_index(
        &mut self,
        name: &str,
        table: &str,
        config: SimilarityIndexConfig,
    ) -> Result<IndexId> {
        if name.is_empty() {
            return Err(PenumbraError::Invalid("index name must not be empty"));
        }
        if self.index_by_name(name).is_some() {
            return Err(PenumbraError::InvalidOwned(format!(
                "index {name} already exists"
            )));
        }
        let entry = self
            .table_by_name(table)
            .ok_or_else(|| PenumbraError::InvalidOwned(format!("table {table} does not exist")))?;
        match entry.columns.iter().find(|c| c.name == config.column) {
            Some(Column {
                ty: ColumnType::FloatVector(_),
                ..
            }) => {}
            Some(_) => {
                return Err(PenumbraError::InvalidOwned(format!(
                    "column {} of table {table} is not a vector column",
                    config.column
                )))
            }
            None => {
                return Err(PenumbraError::InvalidOwned(format!(
                    "table {table} has no column {}",
                    config.column
                )))
            }
        }
        if config.degree == 0 {
            return Err(PenumbraError::Invalid("index degree must be positive"));
        }
        let table_id = entry.id;
        let id = IndexId(self.next_index_id);
        self.next_index_id += 1;
        let aux_info = OnceLock::new();
        let aux_buffer = config.to_aux_buffer();
        let _ = aux_info.set(config);
        self.indexes.insert(
            id,
            IndexCatalogEntry {
                id,
                name: name.to_owned(),
                table: table_id,
                aux_buffer,
                aux_info,
                is_loaded: false,
            },
        );
        self.changed = true;
        trace!(index = id.0, name, "catalog.create_index");
        Ok(id)
    }

    /// Removes an index.
    pub fn drop_index(&mut self, name: &str) -> Result<IndexId> {
        let id = self
            .index_by_name(name)
            .map(|e| e.id)
            .ok_or_else(|| PenumbraError::InvalidOwned(format!("index {name} does not exist")))?;
        self.indexes.remove(&id);
        self.changed = true;
        Ok(id)
    }

    /// Table `id`.
    pub fn table(&self, id: TableId) -> Option<&TableCatalogEntry> {
        self.tables.get(&id)
    }

    /// Table named `name`.
    pub fn table_by_name(&self, name: &str) -> Option<&TableCatalogEntry> {
        self.tables.values().find(|t| t.name == name)
    }

    /// Index `id`.
    pub fn index(&self, id: IndexId) -> Option<&IndexCatalogEntry> {
        self.indexes.get(&id)
    }

    /// Index named `name`.
    pub fn index_by_name(&self, name: &str) -> Option<&IndexCatalogEntry> {
        self.indexes.values().find(|e| e.name == name)
    }

    /// Tables in id order.
    pub fn tables(&self) -> impl Iterator<Item = &TableCatalogEntry> {
        self.tables.values()
    }

    /// Indexes in id order.
    pub fn indexes(&self) -> impl Iterator<Item = &IndexCatalogEntry> {
        self.indexes.values()
    }

    /// Indexes over `table`.
    pub fn indexes_on(&self, table: TableId) -> impl Iterator<Item = &IndexCatalogEntry> {
        self.indexes.values().filter(move |e| e.table == table)
    }

    /// Indexes present in the catalog but not materialized.
    pub fn unloaded_indexes(&self) -> Vec<IndexId> {
        self.indexes
            .values()
            .filter(|e| !e.is_loaded)
            .map(|e| e.id)
            .collect()
    }

    /// Records whether index `id` is materialized. Does not dirty the catalog.
    pub fn set_index_loaded(&mut self, id: IndexId, loaded: bool) -> Result<()> {
        let entry = self.indexes.get_mut(&id).ok_or(PenumbraError::NotFound)?;
        entry.is_loaded = loaded;
        Ok(())
    }

    /// True when DDL ran since the last checkpoint.
    pub fn changed_since_last_checkpoint(&self) -> bool {
        self.changed
    }

    /// Clears the change flag after a successful checkpoint.
    pub fn reset_version(&mut self) {
        self.changed = false;
        self.version += 1;
    }

    /// Number of successful checkpoints observed.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Appends the catalog as one framed section.
    pub fn serialize(&self, out: &mut ByteWriter) {
        let mut body = ByteWriter::new();
        body.put_u32(self.next_table_id);
        body.put_u32(self.next_index_id);
        body.put_u32(self.tables.len() as u32);
        for table in self.tables.values() {
            body.put_u32(table.id.0);
            body.put_str(&table.name);
            body.put_u16(table.columns.len() as u16);
            for column in &table.columns {
                body.put_str(&column.name);
                column.ty.encode(&mut body);
            }
        }
        body.put_u32(self.indexes.len() as u32);
        for index in self.indexes.values() {
            body.put_u32(index.id.0);
            body.put_str(&index.name);
            body.put_u32(index.table.0);
            body.put_bytes(&index.aux_buffer);
        }
        out.put_section(CATALOG_TAG, body.as_slice());
    }

    /// Reads a catalog written by [`Catalog::serialize`]. Auxiliary buffers
    /// stay encoded and every index starts unloaded.
    pub fn deserialize(reader: &mut ByteReader<'_>, verify_checksums: bool) -> Result<Self> {
        let body = reader.get_section(CATALOG_TAG, verify_checksums)?;
        let mut r = ByteReader::new(body);
        let next_table_id = r.get_u32()?;
        let next_index_id = r.get_u32()?;
        let mut catalog = Catalog {
            next_table_id,
            next_index_id,
            ..Catalog::default()
        };
        let num_tables = r.get_u32()?;
        for _ in 0..num_tables {
            let id = TableId(r.get_u32()?);
            let name = r.get_str()?;
            let num_columns = r.get_u16()?;
            let mut columns = Vec::with_capacity(num_columns as usize);
            for _ in 0..num_columns {
                let name = r.get_str()?;
                let ty = ColumnType::decode(&mut r)?;
                columns.push(Column { name, ty });
            }
            if id.0 >= next_table_id || catalog.tables.contains_key(&id) {
                return Err(PenumbraError::Corruption("catalog table id out of sequence"));
            }
            catalog.tables.insert(id, TableCatalogEntry { id, name, columns });
        }
        let num_indexes = r.get_u32()?;
        for _ in 0..num_indexes {
            let id = IndexId(r.get_u32()?);
            let name = r.get_str()?;
            let table = TableId(r.get_u32()?);
            let aux_buffer = r.get_bytes()?.to_vec();
            if id.0 >= next_index_id || catalog.indexes.contains_key(&id) {
                return Err(PenumbraError::Corruption("catalog index id out of sequence"));
            }
            if !catalog.tables.contains_key(&table) {
                return Err(PenumbraError::Corruption("catalog index refers to missing table"));
            }
            catalog.indexes.insert(
                id,
                IndexCatalogEntry {
                    id,
                    name,
                    table,
                    aux_buffer,
                    aux_info: OnceLock::new(),
                    is_loaded: false,
                },
            );
        }
        r.expect_end()?;
        Ok(catalog)
    }
}
