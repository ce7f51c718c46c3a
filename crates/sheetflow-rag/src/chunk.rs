//! Chunking: explicit tables, named ranges, and detected regions become
//! a deduplicated list of extractable chunks.

use sheetflow_common::{CancelToken, FlowError, Rect};
use tracing::debug;

use crate::detect::{DetectOptions, detect_regions, is_formula, is_non_empty};
use crate::normalize::{NormalizedCell, SheetReader};
use crate::workbook::Workbook;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkKind {
    Table,
    NamedRange,
    DataRegion,
    FormulaRegion,
}

impl ChunkKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Table => "TABLE",
            Self::NamedRange => "NAMED RANGE",
            Self::DataRegion => "DATA REGION",
            Self::FormulaRegion => "FORMULA REGION",
        }
    }

    /// Stable id component.
    pub fn id_tag(&self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::NamedRange => "namedRange",
            Self::DataRegion => "dataRegion",
            Self::FormulaRegion => "formulaRegion",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkMeta {
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub workbook_id: String,
    pub sheet_name: String,
    pub kind: ChunkKind,
    pub title: String,
    pub rect: Rect,
    /// Extracted cells, capped at `max_rows × max_cols`.
    pub cells: Vec<Vec<NormalizedCell>>,
    pub meta: ChunkMeta,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkerOptions {
    pub max_rows: usize,
    pub max_cols: usize,
    pub detect: DetectOptions,
    /// Detected regions overlapping an earlier chunk beyond this ratio
    /// are suppressed.
    pub overlap_suppression: f64,
}

impl Default for ChunkerOptions {
    fn default() -> Self {
        Self {
            max_rows: 50,
            max_cols: 40,
            detect: DetectOptions::default(),
            overlap_suppression: 0.8,
        }
    }
}

/// Escape a chunk-id component so `::` inside a name can never collide
/// with the id delimiter: `%` first, then `:`.
pub fn encode_id_component(component: &str) -> String {
    component.replace('%', "%25").replace(':', "%3A")
}

pub fn chunk_id(workbook_id: &str, sheet: &str, kind: ChunkKind, discriminator: &str) -> String {
    [
        encode_id_component(workbook_id),
        encode_id_component(sheet),
        kind.id_tag().to_string(),
        encode_id_component(discriminator),
    ]
    .join("::")
}

/// Produce chunks in stable order: explicit tables, named ranges,
/// detected data regions, then detected formula regions.
pub fn chunk_workbook(
    workbook: &Workbook,
    opts: &ChunkerOptions,
    cancel: &CancelToken,
) -> Result<Vec<Chunk>, FlowError> {
    let mut chunks: Vec<Chunk> = Vec::new();

    for table in &workbook.tables {
        cancel.check()?;
        if let Some(sheet) = workbook.sheet(&table.sheet_name) {
            let reader = SheetReader::new(sheet);
            chunks.push(build_chunk(
                workbook,
                &reader,
                ChunkKind::Table,
                &table.name,
                &table.name,
                table.rect,
                false,
                opts,
                cancel,
            )?);
        }
    }
    for range in &workbook.named_ranges {
        cancel.check()?;
        if let Some(sheet) = workbook.sheet(&range.sheet_name) {
            let reader = SheetReader::new(sheet);
            chunks.push(build_chunk(
                workbook,
                &reader,
                ChunkKind::NamedRange,
                &range.name,
                &range.name,
                range.rect,
                false,
                opts,
                cancel,
            )?);
        }
    }

    for (kind, predicate) in [
        (ChunkKind::DataRegion, is_non_empty as fn(&NormalizedCell) -> bool),
        (ChunkKind::FormulaRegion, is_formula as fn(&NormalizedCell) -> bool),
    ] {
        for sheet in &workbook.sheets {
            let reader = SheetReader::new(sheet);
            let regions = detect_regions(&reader, predicate, &opts.detect, cancel)?;
            for (i, region) in regions.into_iter().enumerate() {
                let suppressed = chunks.iter().any(|existing| {
                    existing.sheet_name == sheet.name
                        && existing.rect.overlap_ratio(&region.rect) > opts.overlap_suppression
                });
                if suppressed {
                    debug!(sheet = %sheet.name, rect = %region.rect, "region suppressed by overlap");
                    continue;
                }
                let discriminator = format!("{}-{}", region.rect.to_a1(), i);
                let title = format!("{} {}", kind.label(), region.rect.to_a1());
                chunks.push(build_chunk(
                    workbook,
                    &reader,
                    kind,
                    &title,
                    &discriminator,
                    region.rect,
                    region.truncated,
                    opts,
                    cancel,
                )?);
            }
        }
    }

    Ok(chunks)
}

#[allow(clippy::too_many_arguments)]
fn build_chunk(
    workbook: &Workbook,
    reader: &SheetReader<'_>,
    kind: ChunkKind,
    title: &str,
    discriminator: &str,
    rect: Rect,
    truncated: bool,
    opts: &ChunkerOptions,
    cancel: &CancelToken,
) -> Result<Chunk, FlowError> {
    let rows = (rect.rows() as usize).min(opts.max_rows);
    let cols = (rect.cols() as usize).min(opts.max_cols);
    let mut cells = Vec::with_capacity(rows);
    let mut scanned = 0usize;
    for r in 0..rows {
        let mut row = Vec::with_capacity(cols);
        for c in 0..cols {
            scanned += 1;
            if scanned % 2048 == 0 {
                cancel.check()?;
            }
            row.push(reader.get(rect.r0 + r as u64, rect.c0 + c as u64));
        }
        cells.push(row);
    }
    Ok(Chunk {
        id: chunk_id(&workbook.id, reader.sheet_name(), kind, discriminator),
        workbook_id: workbook.id.clone(),
        sheet_name: reader.sheet_name().to_string(),
        kind,
        title: title.to_string(),
        rect,
        cells,
        meta: ChunkMeta { truncated },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workbook::{RawCell, RegionRef, Sheet};

    fn grid_sheet(name: &str, rows: &[&[&str]]) -> Sheet {
        Sheet::dense(
            name,
            rows.iter()
                .map(|r| {
                    r.iter()
                        .map(|v| {
                            if v.is_empty() {
                                RawCell::Empty
                            } else {
                                RawCell::value(*v)
                            }
                        })
                        .collect()
                })
                .collect(),
        )
    }

    #[test]
    fn id_components_never_collide_on_delimiters() {
        let a = chunk_id("wb", "A", ChunkKind::Table, "B::table::C");
        let b = chunk_id("wb", "A::table::B", ChunkKind::Table, "C");
        assert_ne!(a, b);
    }

    #[test]
    fn explicit_tables_come_before_detected_regions() {
        let mut wb = Workbook::new("wb");
        wb.sheets.push(grid_sheet(
            "S",
            &[&["h1", "h2"], &["a", "b"], &["c", "d"]],
        ));
        wb.tables.push(RegionRef {
            name: "Orders".into(),
            sheet_name: "S".into(),
            rect: Rect::new(0, 0, 2, 1),
        });
        let chunks = chunk_workbook(&wb, &ChunkerOptions::default(), &CancelToken::new()).unwrap();
        // The detected data region fully overlaps the explicit table
        // and is suppressed.
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, ChunkKind::Table);
        assert_eq!(chunks[0].title, "Orders");
    }

    #[test]
    fn disjoint_regions_are_kept() {
        let mut wb = Workbook::new("wb");
        wb.sheets.push(grid_sheet(
            "S",
            &[
                &["a", "b", "", "", "x", "y"],
                &["c", "d", "", "", "z", "w"],
            ],
        ));
        let chunks = chunk_workbook(&wb, &ChunkerOptions::default(), &CancelToken::new()).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.kind == ChunkKind::DataRegion));
    }

    #[test]
    fn extraction_caps_at_max_rows_and_cols() {
        let rows: Vec<Vec<RawCell>> = (0..10)
            .map(|r| (0..10).map(|c| RawCell::value(format!("{r},{c}"))).collect())
            .collect();
        let mut wb = Workbook::new("wb");
        wb.sheets.push(Sheet::dense("S", rows));
        let opts = ChunkerOptions {
            max_rows: 3,
            max_cols: 2,
            ..ChunkerOptions::default()
        };
        let chunks = chunk_workbook(&wb, &opts, &CancelToken::new()).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].cells.len(), 3);
        assert_eq!(chunks[0].cells[0].len(), 2);
        // The rect still reports the full detected extent.
        assert_eq!(chunks[0].rect, Rect::new(0, 0, 9, 9));
    }
}
