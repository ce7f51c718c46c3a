//! The abstract workbook consumed by the indexing pipeline.
//!
//! Sheets carry their cells in whichever shape the host has: a dense
//! matrix (possibly jagged), a sparse `"row,col"` string-keyed map, or
//! a `get_cell(row, col)` callback. The normalizer levels all of them
//! into one reader.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use sheetflow_common::{Rect, Value};

/// A raw cell as the host supplies it, before normalization.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RawCell {
    #[default]
    Empty,
    /// A bare scalar.
    Scalar(Value),
    /// The `{v, f}` object form: value and/or formula text.
    Cell {
        v: Option<Value>,
        f: Option<String>,
    },
}

impl RawCell {
    pub fn value(v: impl Into<Value>) -> Self {
        RawCell::Scalar(v.into())
    }

    pub fn formula(f: impl Into<String>) -> Self {
        RawCell::Cell {
            v: None,
            f: Some(f.into()),
        }
    }

    pub fn formula_with_value(f: impl Into<String>, v: impl Into<Value>) -> Self {
        RawCell::Cell {
            v: Some(v.into()),
            f: Some(f.into()),
        }
    }
}

/// Callback-shaped cell access, with optional bounds so detection can
/// scan it.
pub trait CellSource: Send + Sync {
    fn get_cell(&self, row: u64, col: u64) -> RawCell;

    /// The rectangle that may contain cells, when known.
    fn bounds(&self) -> Option<Rect> {
        None
    }
}

/// The three cell layouts a sheet may arrive in. Sparse keys must be
/// strings of the form `"row,col"` or `"row:col"`; anything else is
/// ignored rather than coerced.
pub enum SheetCells {
    Dense(Vec<Vec<RawCell>>),
    Sparse(FxHashMap<String, RawCell>),
    Source(Arc<dyn CellSource>),
}

pub struct Sheet {
    pub name: String,
    pub cells: SheetCells,
    /// Origin offset translating absolute rect coordinates into local
    /// matrix coordinates for dense data.
    pub origin: Option<(u64, u64)>,
}

impl Sheet {
    pub fn dense(name: impl Into<String>, cells: Vec<Vec<RawCell>>) -> Self {
        Self {
            name: name.into(),
            cells: SheetCells::Dense(cells),
            origin: None,
        }
    }

    pub fn sparse(name: impl Into<String>, cells: FxHashMap<String, RawCell>) -> Self {
        Self {
            name: name.into(),
            cells: SheetCells::Sparse(cells),
            origin: None,
        }
    }
}

/// Explicit table metadata and named ranges share one shape.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionRef {
    pub name: String,
    pub sheet_name: String,
    pub rect: Rect,
}

pub struct Workbook {
    pub id: String,
    pub sheets: Vec<Sheet>,
    pub tables: Vec<RegionRef>,
    pub named_ranges: Vec<RegionRef>,
}

impl Workbook {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sheets: Vec::new(),
            tables: Vec::new(),
            named_ranges: Vec::new(),
        }
    }

    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.name == name)
    }
}
