//! The in-memory columnar table value.
//!
//! Tables are immutable after construction; every operation returns a
//! new table. Column names are unique and non-empty; duplicates are an
//! error at construction time. The only place header uniquing happens is
//! [`Table::from_grid`], which turns raw grids (with or without a header
//! row) into tables.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::FlowError;
use crate::value::Value;

/// Declared type of a column. `Any` admits every value kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Any,
    #[serde(rename = "string")]
    Text,
    Number,
    Boolean,
    Date,
    #[serde(rename = "datetime")]
    DateTime,
    Time,
    Duration,
    Decimal,
    Binary,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Any => "any",
            Self::Text => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::DateTime => "datetime",
            Self::Time => "time",
            Self::Duration => "duration",
            Self::Decimal => "decimal",
            Self::Binary => "binary",
        })
    }
}

impl DataType {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.trim().to_ascii_lowercase().as_str() {
            "" | "any" => Self::Any,
            "string" | "text" => Self::Text,
            "number" => Self::Number,
            "boolean" | "logical" => Self::Boolean,
            "date" => Self::Date,
            "datetime" => Self::DateTime,
            "time" => Self::Time,
            "duration" => Self::Duration,
            "decimal" => Self::Decimal,
            "binary" => Self::Binary,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: DataType,
}

impl Column {
    pub fn new<S: Into<String>>(name: S, ty: DataType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    pub fn any<S: Into<String>>(name: S) -> Self {
        Self::new(name, DataType::Any)
    }
}

/// Options for [`Table::from_grid`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FromGridOptions {
    pub has_headers: bool,
    pub infer_types: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    /// Build a table from explicit columns and rows.
    ///
    /// Column names must be unique and non-empty. Rows narrower than the
    /// column list are padded with `Null`; wider rows are an error.
    pub fn new(columns: Vec<Column>, rows: Vec<Vec<Value>>) -> Result<Self, FlowError> {
        let mut seen = rustc_hash::FxHashSet::default();
        for col in &columns {
            if col.name.is_empty() {
                return Err(FlowError::invalid_argument("columns", "empty column name"));
            }
            if !seen.insert(col.name.as_str()) {
                return Err(FlowError::invalid_argument(
                    "columns",
                    format!("duplicate column name '{}'", col.name),
                ));
            }
        }
        let width = columns.len();
        let mut fixed = Vec::with_capacity(rows.len());
        for mut row in rows {
            if row.len() > width {
                return Err(FlowError::invalid_argument(
                    "rows",
                    format!("row has {} cells, table has {} columns", row.len(), width),
                ));
            }
            row.resize(width, Value::Null);
            fixed.push(row);
        }
        Ok(Self {
            columns,
            rows: fixed,
        })
    }

    pub fn empty(columns: Vec<Column>) -> Result<Self, FlowError> {
        Self::new(columns, Vec::new())
    }

    /// Build from a raw grid. With `has_headers`, the first row supplies
    /// column names, uniqued the standard way: empty names become
    /// `Column1, Column2, …`; duplicates get `.1`, `.2` suffixes.
    pub fn from_grid(grid: Vec<Vec<Value>>, opts: FromGridOptions) -> Result<Self, FlowError> {
        let width = grid.iter().map(|r| r.len()).max().unwrap_or(0);
        let (header, body) = if opts.has_headers && !grid.is_empty() {
            let mut it = grid.into_iter();
            let h = it.next().unwrap_or_default();
            (Some(h), it.collect::<Vec<_>>())
        } else {
            (None, grid)
        };

        let raw_names: Vec<String> = (0..width)
            .map(|i| {
                header
                    .as_ref()
                    .and_then(|h| h.get(i))
                    .map(|v| match v {
                        Value::Null => String::new(),
                        other => other.to_string(),
                    })
                    .unwrap_or_default()
            })
            .collect();
        let names = unique_headers(&raw_names);

        let columns: Vec<Column> = names.into_iter().map(Column::any).collect();
        let mut table = Self::new(columns, body)?;

        if opts.infer_types {
            for i in 0..table.columns.len() {
                table.columns[i].ty = infer_column_type(&table.rows, i);
            }
        }
        Ok(table)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Result<usize, FlowError> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| FlowError::unknown_column(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column_vector(&self, index: usize) -> impl Iterator<Item = &Value> {
        self.rows.iter().map(move |r| &r[index])
    }

    pub fn cell(&self, row: usize, col: usize) -> &Value {
        &self.rows[row][col]
    }

    pub fn row(&self, row: usize) -> &[Value] {
        &self.rows[row]
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[Value]> {
        self.rows.iter().map(|r| r.as_slice())
    }

    pub fn into_rows(self) -> Vec<Vec<Value>> {
        self.rows
    }

    pub fn to_grid(&self, include_header: bool) -> Vec<Vec<Value>> {
        let mut out = Vec::with_capacity(self.rows.len() + 1);
        if include_header {
            out.push(
                self.columns
                    .iter()
                    .map(|c| Value::Text(c.name.clone()))
                    .collect(),
            );
        }
        out.extend(self.rows.iter().cloned());
        out
    }

    pub fn head(&self, n: usize) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }

    /// Internal constructor for operations that already guarantee the
    /// invariants (unique names, uniform width).
    pub fn from_parts_unchecked(columns: Vec<Column>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }
}

/// Unique the raw header names the `from_grid` way.
pub fn unique_headers(raw: &[String]) -> Vec<String> {
    let mut taken: rustc_hash::FxHashSet<String> = rustc_hash::FxHashSet::default();
    let mut out = Vec::with_capacity(raw.len());
    for (i, name) in raw.iter().enumerate() {
        let base = if name.trim().is_empty() {
            format!("Column{}", i + 1)
        } else {
            name.trim().to_string()
        };
        let mut candidate = base.clone();
        let mut suffix = 1usize;
        while !taken.insert(candidate.clone()) {
            candidate = format!("{base}.{suffix}");
            suffix += 1;
        }
        out.push(candidate);
    }
    out
}

fn infer_column_type(rows: &[Vec<Value>], col: usize) -> DataType {
    let mut seen: Option<DataType> = None;
    for row in rows {
        let v = &row[col];
        if v.is_null() {
            continue;
        }
        let ty = v.type_of();
        if ty == DataType::Any {
            return DataType::Any;
        }
        match seen {
            None => seen = Some(ty),
            Some(prev) if prev == ty => {}
            Some(_) => return DataType::Any,
        }
    }
    seen.unwrap_or(DataType::Any)
}

/* ─────────────────────────── streaming view ───────────────────────── */

/// A reader that yields the same cells as a materialized table, in
/// fixed-size row batches. The engine's streaming mode consumes this;
/// small tables and stream-backed sources expose the identical surface.
pub trait RowStream {
    fn columns(&self) -> &[Column];
    /// Next batch of rows, or `None` when exhausted. Batches are
    /// non-empty except possibly the stream's sole batch.
    fn next_batch(&mut self) -> Option<Vec<Vec<Value>>>;
}

/// Row-backed stream over a materialized table.
pub struct TableStream {
    table: Arc<Table>,
    batch_size: usize,
    cursor: usize,
}

impl TableStream {
    pub fn new(table: Arc<Table>, batch_size: usize) -> Self {
        Self {
            table,
            batch_size: batch_size.max(1),
            cursor: 0,
        }
    }
}

impl RowStream for TableStream {
    fn columns(&self) -> &[Column] {
        self.table.columns()
    }

    fn next_batch(&mut self) -> Option<Vec<Vec<Value>>> {
        if self.cursor >= self.table.row_count() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.table.row_count());
        let batch = (self.cursor..end)
            .map(|r| self.table.row(r).to_vec())
            .collect();
        self.cursor = end;
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlowErrorKind;

    fn grid(cells: &[&[&str]]) -> Vec<Vec<Value>> {
        cells
            .iter()
            .map(|r| r.iter().map(|c| Value::from(*c)).collect())
            .collect()
    }

    #[test]
    fn from_grid_uniques_headers() {
        let t = Table::from_grid(
            grid(&[&["A", "", "A", "A"], &["1", "2", "3", "4"]]),
            FromGridOptions {
                has_headers: true,
                infer_types: false,
            },
        )
        .unwrap();
        let names: Vec<&str> = t.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["A", "Column2", "A.1", "A.2"]);
        assert_eq!(t.row_count(), 1);
    }

    #[test]
    fn duplicate_columns_rejected_at_construction() {
        let err = Table::new(vec![Column::any("X"), Column::any("X")], vec![]).unwrap_err();
        assert_eq!(err.kind, FlowErrorKind::InvalidArgument);
    }

    #[test]
    fn short_rows_pad_with_null() {
        let t = Table::new(
            vec![Column::any("A"), Column::any("B")],
            vec![vec![Value::Int(1)]],
        )
        .unwrap();
        assert_eq!(t.cell(0, 1), &Value::Null);
    }

    #[test]
    fn type_inference_mixed_is_any() {
        let t = Table::from_grid(
            vec![
                vec![Value::Text("A".into()), Value::Text("B".into())],
                vec![Value::Int(1), Value::Text("x".into())],
                vec![Value::Number(2.5), Value::Text("y".into())],
                vec![Value::Text("z".into()), Value::Null],
            ],
            FromGridOptions {
                has_headers: true,
                infer_types: true,
            },
        )
        .unwrap();
        assert_eq!(t.columns()[0].ty, DataType::Any);
        assert_eq!(t.columns()[1].ty, DataType::Text);
    }

    #[test]
    fn stream_batches_cover_all_rows() {
        let t = Table::new(
            vec![Column::any("A")],
            (0..7).map(|i| vec![Value::Int(i)]).collect(),
        )
        .unwrap();
        let mut s = TableStream::new(Arc::new(t), 3);
        let sizes: Vec<usize> = std::iter::from_fn(|| s.next_batch().map(|b| b.len())).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }
}
