use std::collections::BTreeMap;

use tracing::debug;

use crate::catalog::Catalog;
use crate::primitives::bytes::{tag, ByteReader, ByteWriter};
use crate::primitives::io::FileIo;
use crate::storage::buffer::BufferManager;
use crate::storage::page_manager::PageManager;
use crate::storage::shadow::ShadowFile;
use crate::storage::table::{Column, NodeTable, TableStorageInfo, Value};
use crate::types::{PenumbraError, Result, TableId};

const STORAGE_METADATA_TAG: u32 = tag(*b"STMD");

/// Owns the tables' data and writes it out at checkpoints.
#[derive(Debug)]
pub struct StorageManager {
    page_size: u32,
    inline_limit: usize,
    tables: BTreeMap<TableId, NodeTable>,
    snapshot: Option<BTreeMap<TableId, (TableStorageInfo, bool, bool)>>,
}

impl StorageManager {
    /// Storage with no tables.
    pub fn new(page_size: u32, inline_limit: usize) -> Self {
        Self {
            page_size,
            inline_limit,
            tables: BTreeMap::new(),
            snapshot: None,
        }
    }

    /// Adds empty storage for a new table.
    pub fn create_table(&mut self, id: TableId, columns: Vec<Column>) {
        self.tables
            .insert(id, NodeTable::new(id, columns, self.inline_limit));
    }

    /// Removes a table and frees its pages; the frees land with the next
    /// checkpoint.
    pub fn drop_table(&mut self, id: TableId, page_manager: &mut PageManager) -> Result<()> {
        let mut table = self.tables.remove(&id).ok_or(PenumbraError::NotFound)?;
        table.free_pages(page_manager)
    }

    /// Table `id`.
    pub fn table(&self, id: TableId) -> Result<&NodeTable> {
        self.tables.get(&id).ok_or(PenumbraError::NotFound)
    }

    /// Tables in id order.
    pub fn tables(&self) -> impl Iterator<Item = &NodeTable> {
        self.tables.values()
    }

    /// Appends rows to table `id`.
    pub fn insert(&mut self, id: TableId, rows: Vec<Vec<Value>>) -> Result<()> {
        let table = self.tables.get_mut(&id).ok_or(PenumbraError::NotFound)?;
        for row in rows {
            table.insert(row)?;
        }
        Ok(())
    }

    /// True when any table or overflow store has unwritten content.
    pub fn has_changes(&self) -> bool {
        self.tables.values().any(NodeTable::has_changes)
    }

    /// Records the state a failed checkpoint rolls back to.
    pub fn begin_checkpoint(&mut self) {
        self.snapshot = Some(
            self.tables
                .iter()
                .map(|(id, t)| (*id, t.checkpoint_snapshot()))
                .collect(),
        );
    }

    /// Writes every changed table. Returns whether anything was written.
    pub fn checkpoint(
        &mut self,
        page_manager: &mut PageManager,
        shadow: &mut ShadowFile,
        main: &dyn FileIo,
    ) -> Result<bool> {
        let mut wrote = false;
        for table in self.tables.values_mut() {
            wrote |= table.checkpoint(page_manager, shadow, main, self.page_size)?;
        }
        Ok(wrote)
    }

    /// Restores table storage infos and change flags saved by
    /// [`StorageManager::begin_checkpoint`].
    pub fn rollback_checkpoint(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            for (id, state) in snapshot {
                if let Some(table) = self.tables.get_mut(&id) {
                    table.restore(state);
                }
            }
        }
    }

    /// Forgets the rollback snapshot.
    pub fn finalize_checkpoint(&mut self) {
        self.snapshot = None;
    }

    /// Appends the storage metadata section listing every table's infos.
    pub fn serialize(&self, out: &mut ByteWriter) {
        let mut body = ByteWriter::new();
        body.put_u32(self.tables.len() as u32);
        for (id, table) in &self.tables {
            body.put_u32(id.0);
            table.storage_info().encode(&mut body);
        }
        out.put_section(STORAGE_METADATA_TAG, body.as_slice());
    }

    /// Reads the storage metadata section and loads each table's pages. The
    /// table set must match the catalog exactly.
    #[allow(clippy::too_many_arguments)]
    pub fn deserialize(
        reader: &mut ByteReader<'_>,
        catalog: &Catalog,
        page_size: u32,
        inline_limit: usize,
        main: &dyn FileIo,
        buffer: &BufferManager,
        verify_checksums: bool,
    ) -> Result<Self> {
        let body = reader.get_section(STORAGE_METADATA_TAG, verify_checksums)?;
        let mut r = ByteReader::new(body);
        let count = r.get_u32()? as usize;
        let mut storage = StorageManager::new(page_size, inline_limit);
        for _ in 0..count {
            let id = TableId(r.get_u32()?);
            let info = TableStorageInfo::decode(&mut r)?;
            let entry = catalog
                .table(id)
                .ok_or(PenumbraError::Corruption("storage metadata names unknown table"))?;
            let table = NodeTable::load(
                id,
                entry.columns.clone(),
                info,
                inline_limit,
                main,
                buffer,
                verify_checksums,
            )?;
            if storage.tables.insert(id, table).is_some() {
                return Err(PenumbraError::Corruption("storage metadata lists a table twice"));
            }
        }
        r.expect_end()?;
        if storage.tables.len() != catalog.tables().count() {
            return Err(PenumbraError::Corruption(
                "storage metadata is missing catalog tables",
            ));
        }
        debug!(tables = storage.tables.len(), "storage.deserialize");
        Ok(storage)
    }

    /// Decodes only the per-table infos, without loading pages.
    pub fn read_storage_infos(
        reader: &mut ByteReader<'_>,
        verify_checksums: bool,
    ) -> Result<Vec<(TableId, TableStorageInfo)>> {
        let body = reader.get_section(STORAGE_METADATA_TAG, verify_checksums)?;
        let mut r = ByteReader::new(body);
        let count = r.get_u32()? as usize;
        let mut out = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            let id = TableId(r.get_u32()?);
            out.push((id, TableStorageInfo::decode(&mut r)?));
        }
        r.expect_end()?;
        Ok(out)
    }
}
