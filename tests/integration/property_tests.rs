#![allow(missing_docs)]

use penumbra::primitives::bytes::{ByteReader, ByteWriter};
use penumbra::storage::page_manager::PageManager;
use penumbra::{
    Catalog, Column, ColumnType, Database, Metric, SimilarityIndexConfig, SystemConfig, Value,
};
use proptest::prelude::*;

fn arb_column_type() -> impl Strategy<Value = ColumnType> {
    prop_oneof![
        Just(ColumnType::Int64),
        Just(ColumnType::Float64),
        Just(ColumnType::String),
        (1u32..=8).prop_map(ColumnType::FloatVector),
    ]
}

fn arb_columns() -> impl Strategy<Value = Vec<Column>> {
    prop::collection::btree_map("[a-z]{1,8}", arb_column_type(), 1..=5).prop_map(|columns| {
        columns
            .into_iter()
            .map(|(name, ty)| Column::new(name, ty))
            .collect()
    })
}

#[derive(Debug, Clone)]
enum PageOp {
    Allocate(u32),
    Free(usize),
    Checkpoint,
}

fn arb_page_op() -> impl Strategy<Value = PageOp> {
    prop_oneof![
        (1u32..=16).prop_map(PageOp::Allocate),
        any::<usize>().prop_map(PageOp::Free),
        Just(PageOp::Checkpoint),
    ]
}

fn string_row(id: i64, len: usize) -> Vec<Value> {
    vec![Value::Int(id), Value::Str("x".repeat(len))]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn catalog_round_trips(
        tables in prop::collection::btree_map("[a-z]{1,10}", arb_columns(), 0..6),
        degree in 1u32..=16,
    ) {
        let mut catalog = Catalog::new();
        for (name, columns) in &tables {
            catalog.create_table(name, columns.clone()).unwrap();
            if let Some(vector) = columns
                .iter()
                .find(|c| matches!(c.ty, ColumnType::FloatVector(_)))
            {
                let config = SimilarityIndexConfig::new(vector.name.clone(), Metric::L2, degree);
                catalog.create_index(&format!("{name}_idx"), name, config).unwrap();
            }
        }
        if let Some(first) = tables.keys().next() {
            catalog.drop_table(first).unwrap();
        }

        let mut out = ByteWriter::new();
        catalog.serialize(&mut out);
        let mut reader = ByteReader::new(out.as_slice());
        let decoded = Catalog::deserialize(&mut reader, true).unwrap();
        prop_assert_eq!(&decoded, &catalog);
        prop_assert!(decoded.indexes().all(|index| !index.is_loaded()));
        for index in decoded.indexes() {
            prop_assert_eq!(index.aux_info().unwrap().degree, degree);
        }
    }

    #[test]
    fn page_manager_round_trips(ops in prop::collection::vec(arb_page_op(), 1..64)) {
        let mut manager = PageManager::new();
        let mut live = Vec::new();
        for op in ops {
            match op {
                PageOp::Allocate(n) => live.push(manager.allocate_range(n).unwrap()),
                PageOp::Free(pick) if !live.is_empty() => {
                    let range = live.swap_remove(pick % live.len());
                    manager.free(range).unwrap();
                }
                PageOp::Free(_) => {}
                PageOp::Checkpoint => {
                    manager.begin_checkpoint();
                    manager.finalize_checkpoint();
                    manager.reset_version();
                }
            }
        }

        let mut out = ByteWriter::new();
        manager.serialize(&mut out);
        prop_assert!(
            out.len() as u32 <= manager.estimate_pages_needed_for_serialize(4096) * 4096
        );
        let decoded = PageManager::deserialize(&mut ByteReader::new(out.as_slice()), true).unwrap();
        prop_assert_eq!(decoded.image(), manager.image());
        for range in &live {
            prop_assert!(!decoded.free_list().overlaps(range));
        }
    }

    #[test]
    fn table_storage_keeps_its_sentinels_paired(
        batches in prop::collection::vec(prop::collection::vec(0usize..=120, 0..12), 1..4),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairing.penumbra");
        let config = SystemConfig {
            background_index_load: false,
            ..SystemConfig::default()
        };
        let limit = config.overflow_inline_limit;
        let db = Database::open(&path, config.clone()).unwrap();
        let mut txn = db.begin_write().unwrap();
        txn.create_table(
            "notes",
            vec![
                Column::new("id", ColumnType::Int64),
                Column::new("body", ColumnType::String),
            ],
        )
        .unwrap();
        txn.commit().unwrap();

        let mut expected = Vec::new();
        for batch in &batches {
            let mut txn = db.begin_write().unwrap();
            let base = expected.len();
            let rows: Vec<Vec<Value>> = batch
                .iter()
                .enumerate()
                .map(|(offset, len)| string_row((base + offset) as i64, *len))
                .collect();
            expected.extend(rows.iter().cloned());
            txn.insert("notes", rows).unwrap();
            txn.commit().unwrap();
            db.checkpoint().unwrap();

            let layout = db.layout();
            for (_, _, info) in &layout.tables {
                prop_assert!(info.check_pairing().is_ok(), "{:?}", info);
            }
            let spilled = expected.iter().any(|row| {
                matches!(&row[1], Value::Str(s) if s.len() > limit)
            });
            let info = &layout.tables[0].2;
            prop_assert_eq!(info.num_rows as usize, expected.len());
            prop_assert_eq!(!info.overflow.is_absent(), spilled);
        }
        db.close().unwrap();

        let db = Database::open(&path, config).unwrap();
        prop_assert_eq!(db.table_rows("notes").unwrap(), expected);
    }
}
