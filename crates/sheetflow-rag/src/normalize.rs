//! Uniform cell reading over heterogeneous sheet shapes.

use sheetflow_common::Value;

use crate::workbook::{RawCell, Sheet, SheetCells};

/// A normalized cell: optional value, optional formula. Formulas are
/// trimmed and always begin with `=`; empty or whitespace formula text
/// normalizes to no formula at all.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NormalizedCell {
    pub v: Option<Value>,
    pub f: Option<String>,
}

impl NormalizedCell {
    pub fn is_empty(&self) -> bool {
        self.v.is_none() && self.f.is_none()
    }

    pub fn is_non_empty(&self) -> bool {
        !self.is_empty()
    }

    pub fn has_formula(&self) -> bool {
        self.f.is_some()
    }
}

fn normalize_value(v: Option<Value>) -> Option<Value> {
    match v {
        None | Some(Value::Null) => None,
        Some(Value::Text(s)) if s.is_empty() => None,
        other => other,
    }
}

fn normalize_formula(f: Option<String>) -> Option<String> {
    let f = f?;
    let trimmed = f.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('=') {
        Some(trimmed.to_string())
    } else {
        Some(format!("={trimmed}"))
    }
}

pub fn normalize_raw(raw: &RawCell) -> NormalizedCell {
    match raw {
        RawCell::Empty => NormalizedCell::default(),
        RawCell::Scalar(v) => NormalizedCell {
            v: normalize_value(Some(v.clone())),
            f: None,
        },
        RawCell::Cell { v, f } => NormalizedCell {
            v: normalize_value(v.clone()),
            f: normalize_formula(f.clone()),
        },
    }
}

/// Sparse map keys are `"row,col"` or `"row:col"` strings; anything
/// else is rejected (never coerced).
pub fn parse_sparse_key(key: &str) -> Option<(u64, u64)> {
    let (r, c) = key.split_once(',').or_else(|| key.split_once(':'))?;
    let row = r.trim().parse::<u64>().ok()?;
    let col = c.trim().parse::<u64>().ok()?;
    Some((row, col))
}

/// Uniform `get(row, col)` over a sheet, in absolute coordinates.
pub struct SheetReader<'a> {
    sheet: &'a Sheet,
}

impl<'a> SheetReader<'a> {
    pub fn new(sheet: &'a Sheet) -> Self {
        Self { sheet }
    }

    pub fn sheet_name(&self) -> &str {
        &self.sheet.name
    }

    /// Normalized cell at absolute coordinates. The sheet's origin
    /// offset translates absolute coordinates into local matrix ones.
    pub fn get(&self, row: u64, col: u64) -> NormalizedCell {
        let (or, oc) = self.sheet.origin.unwrap_or((0, 0));
        if row < or || col < oc {
            return NormalizedCell::default();
        }
        let (lr, lc) = (row - or, col - oc);
        match &self.sheet.cells {
            SheetCells::Dense(matrix) => matrix
                .get(lr as usize)
                .and_then(|r| r.get(lc as usize))
                .map(normalize_raw)
                .unwrap_or_default(),
            SheetCells::Sparse(map) => {
                let cell = map
                    .get(&format!("{lr},{lc}"))
                    .or_else(|| map.get(&format!("{lr}:{lc}")));
                cell.map(normalize_raw).unwrap_or_default()
            }
            SheetCells::Source(source) => normalize_raw(&source.get_cell(lr, lc)),
        }
    }

    /// Coordinates of every candidate (possibly non-empty) cell, in
    /// absolute coordinates and deterministic order. Never materializes
    /// a dense grid for sparse input.
    pub fn candidate_cells(&self) -> Vec<(u64, u64)> {
        let (or, oc) = self.sheet.origin.unwrap_or((0, 0));
        let mut out: Vec<(u64, u64)> = match &self.sheet.cells {
            SheetCells::Dense(matrix) => matrix
                .iter()
                .enumerate()
                .flat_map(|(r, row)| {
                    row.iter()
                        .enumerate()
                        .filter(|(_, cell)| !matches!(cell, RawCell::Empty))
                        .map(move |(c, _)| (r as u64 + or, c as u64 + oc))
                })
                .collect(),
            SheetCells::Sparse(map) => map
                .keys()
                .filter_map(|k| parse_sparse_key(k))
                .map(|(r, c)| (r + or, c + oc))
                .collect(),
            SheetCells::Source(source) => match source.bounds() {
                None => Vec::new(),
                Some(b) => {
                    let mut cells = Vec::new();
                    for r in b.r0..=b.r1 {
                        for c in b.c0..=b.c1 {
                            if normalize_raw(&source.get_cell(r, c)).is_non_empty() {
                                cells.push((r + or, c + oc));
                            }
                        }
                    }
                    cells
                }
            },
        };
        out.sort_unstable();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    #[test]
    fn formula_text_is_trimmed_and_prefixed() {
        let cell = normalize_raw(&RawCell::Cell {
            v: None,
            f: Some("  SUM(A1:A2)  ".into()),
        });
        assert_eq!(cell.f.as_deref(), Some("=SUM(A1:A2)"));

        let blank = normalize_raw(&RawCell::Cell {
            v: None,
            f: Some("   ".into()),
        });
        assert!(blank.is_empty());
    }

    #[test]
    fn empty_object_and_empty_text_are_empty() {
        assert!(normalize_raw(&RawCell::Cell { v: None, f: None }).is_empty());
        assert!(normalize_raw(&RawCell::Scalar(Value::Text(String::new()))).is_empty());
        assert!(normalize_raw(&RawCell::Scalar(Value::Null)).is_empty());
    }

    #[test]
    fn sparse_keys_accept_both_separators_and_reject_garbage() {
        assert_eq!(parse_sparse_key("3,4"), Some((3, 4)));
        assert_eq!(parse_sparse_key("3:4"), Some((3, 4)));
        assert_eq!(parse_sparse_key("9000000000,1"), Some((9_000_000_000, 1)));
        assert_eq!(parse_sparse_key("x,y"), None);
        assert_eq!(parse_sparse_key("34"), None);
    }

    #[test]
    fn origin_offset_translates_absolute_reads() {
        let mut sheet = Sheet::dense(
            "S",
            vec![vec![RawCell::value("a"), RawCell::value("b")]],
        );
        sheet.origin = Some((10, 5));
        let reader = SheetReader::new(&sheet);
        assert_eq!(reader.get(10, 6).v, Some(Value::Text("b".into())));
        assert!(reader.get(0, 0).is_empty());
        assert_eq!(reader.candidate_cells(), vec![(10, 5), (10, 6)]);
    }

    #[test]
    fn date_values_survive_normalization() {
        let d = chrono::NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let cell = normalize_raw(&RawCell::Scalar(Value::Date(d)));
        assert_eq!(cell.v, Some(Value::Date(d)));
    }

    #[test]
    fn sparse_reader_reads_with_either_separator() {
        let mut map = FxHashMap::default();
        map.insert("0,0".to_string(), RawCell::value(1));
        map.insert("0:1".to_string(), RawCell::value(2));
        let sheet = Sheet::sparse("S", map);
        let reader = SheetReader::new(&sheet);
        assert_eq!(reader.get(0, 0).v, Some(Value::Int(1)));
        assert_eq!(reader.get(0, 1).v, Some(Value::Int(2)));
    }
}
