//! Retrieval over an indexed workbook.

use sheetflow_common::{CancelToken, Rect};
use sheetflow_rag::{
    HashEmbedder, InMemoryVectorStore, IndexOptions, RawCell, RegionRef, SearchOptions, Sheet,
    Workbook, index_workbook, search_workbook_rag,
};

const DIM: usize = 128;

fn workbook() -> Workbook {
    let mut wb = Workbook::new("wb");
    wb.sheets.push(Sheet::dense(
        "Finance",
        vec![
            vec![RawCell::value("Region"), RawCell::value("Revenue")],
            vec![RawCell::value("North"), RawCell::value(1200)],
            vec![RawCell::value("South"), RawCell::value(900)],
        ],
    ));
    wb.sheets.push(Sheet::dense(
        "Inventory",
        vec![
            vec![RawCell::value("Product"), RawCell::value("Stock")],
            vec![RawCell::value("Widget"), RawCell::value(42)],
        ],
    ));
    wb.tables.push(RegionRef {
        name: "RevenueByRegion".into(),
        sheet_name: "Finance".into(),
        rect: Rect::new(0, 0, 2, 1),
    });
    wb.tables.push(RegionRef {
        name: "StockLevels".into(),
        sheet_name: "Inventory".into(),
        rect: Rect::new(0, 0, 1, 1),
    });
    wb
}

#[test]
fn query_surfaces_the_matching_table_first() {
    let store = InMemoryVectorStore::new(DIM);
    let embedder = HashEmbedder::new(DIM);
    index_workbook(&workbook(), &store, &embedder, &IndexOptions::default()).unwrap();

    let hits = search_workbook_rag(
        "revenue by region",
        "wb",
        &store,
        &embedder,
        &SearchOptions::default(),
        &CancelToken::new(),
    )
    .unwrap();
    assert!(!hits.is_empty());
    assert!(hits[0].record.id.contains("RevenueByRegion"), "{}", hits[0].record.id);
}

#[test]
fn top_k_zero_returns_nothing() {
    let store = InMemoryVectorStore::new(DIM);
    let embedder = HashEmbedder::new(DIM);
    index_workbook(&workbook(), &store, &embedder, &IndexOptions::default()).unwrap();

    let hits = search_workbook_rag(
        "stock",
        "wb",
        &store,
        &embedder,
        &SearchOptions {
            top_k: 0.0,
            ..SearchOptions::default()
        },
        &CancelToken::new(),
    )
    .unwrap();
    assert!(hits.is_empty());
}

#[test]
fn workbook_filter_excludes_other_workbooks() {
    let store = InMemoryVectorStore::new(DIM);
    let embedder = HashEmbedder::new(DIM);
    index_workbook(&workbook(), &store, &embedder, &IndexOptions::default()).unwrap();

    let hits = search_workbook_rag(
        "revenue",
        "some-other-workbook",
        &store,
        &embedder,
        &SearchOptions::default(),
        &CancelToken::new(),
    )
    .unwrap();
    assert!(hits.is_empty());
}
