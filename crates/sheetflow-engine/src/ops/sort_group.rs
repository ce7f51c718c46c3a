//! Ordering and aggregation: stable sort, group-by, distinct, pivot and
//! unpivot.

use rustc_hash::{FxHashMap, FxHashSet};
use sheetflow_common::{Column, DataType, FlowError, Table, Value, table::unique_headers};
use sheetflow_parse::query::{AggregateOp, Aggregation, NullsOrder, SortDirection, SortKey};
use std::cmp::Ordering;

pub fn sort_rows(table: Table, sort_by: &[SortKey]) -> Result<Table, FlowError> {
    let indices = sort_by
        .iter()
        .map(|k| table.column_index(&k.column))
        .collect::<Result<Vec<_>, _>>()?;

    let columns = table.columns().to_vec();
    let mut rows = table.into_rows();
    // Vec::sort_by is stable; ties keep their original order.
    rows.sort_by(|a, b| {
        for (key, &idx) in sort_by.iter().zip(&indices) {
            let ord = compare_with_policy(&a[idx], &b[idx], key);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(Table::from_parts_unchecked(columns, rows))
}

/// Nulls obey the key's nulls policy in the *final* order; direction
/// only flips comparisons between two non-null values.
fn compare_with_policy(a: &Value, b: &Value, key: &SortKey) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => match key.nulls {
            NullsOrder::First => Ordering::Less,
            NullsOrder::Last => Ordering::Greater,
        },
        (false, true) => match key.nulls {
            NullsOrder::First => Ordering::Greater,
            NullsOrder::Last => Ordering::Less,
        },
        (false, false) => {
            let ord = a.compare(b);
            match key.direction {
                SortDirection::Ascending => ord,
                SortDirection::Descending => ord.reverse(),
            }
        }
    }
}

/* ────────────────────────────── group by ──────────────────────────── */

struct Accumulator {
    op: AggregateOp,
    sum: f64,
    saw_number: bool,
    count: i64,
    best: Option<Value>,
    distinct: FxHashSet<Value>,
}

impl Accumulator {
    fn new(op: AggregateOp) -> Self {
        Self {
            op,
            sum: 0.0,
            saw_number: false,
            count: 0,
            best: None,
            distinct: FxHashSet::default(),
        }
    }

    fn push(&mut self, v: &Value) {
        if v.is_null() {
            return;
        }
        self.count += 1;
        match self.op {
            AggregateOp::Sum | AggregateOp::Average => {
                if let Some(n) = v.as_number() {
                    self.sum += n;
                    self.saw_number = true;
                }
            }
            AggregateOp::Min => {
                if self.best.as_ref().is_none_or(|b| v.compare(b).is_lt()) {
                    self.best = Some(v.clone());
                }
            }
            AggregateOp::Max => {
                if self.best.as_ref().is_none_or(|b| v.compare(b).is_gt()) {
                    self.best = Some(v.clone());
                }
            }
            AggregateOp::CountDistinct => {
                self.distinct.insert(v.clone());
            }
            AggregateOp::Count => {}
        }
    }

    fn finish(self) -> Value {
        match self.op {
            AggregateOp::Sum => {
                if self.saw_number {
                    Value::Number(self.sum)
                } else {
                    Value::Null
                }
            }
            AggregateOp::Average => {
                if self.saw_number && self.count > 0 {
                    Value::Number(self.sum / self.count as f64)
                } else {
                    Value::Null
                }
            }
            AggregateOp::Count => Value::Int(self.count),
            AggregateOp::Min | AggregateOp::Max => self.best.unwrap_or(Value::Null),
            AggregateOp::CountDistinct => Value::Int(self.distinct.len() as i64),
        }
    }
}

pub fn group_by(
    table: Table,
    keys: &[String],
    aggregations: &[Aggregation],
) -> Result<Table, FlowError> {
    let key_idx = keys
        .iter()
        .map(|k| table.column_index(k))
        .collect::<Result<Vec<_>, _>>()?;
    let agg_idx = aggregations
        .iter()
        .map(|a| table.column_index(&a.column))
        .collect::<Result<Vec<_>, _>>()?;

    // Groups appear in first-encountered order.
    let mut order: Vec<Vec<Value>> = Vec::new();
    let mut groups: FxHashMap<Vec<Value>, usize> = FxHashMap::default();
    let mut accs: Vec<Vec<Accumulator>> = Vec::new();

    for row in table.iter_rows() {
        let key: Vec<Value> = key_idx.iter().map(|&i| row[i].clone()).collect();
        let slot = *groups.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            accs.push(aggregations.iter().map(|a| Accumulator::new(a.op)).collect());
            order.len() - 1
        });
        for (acc, &i) in accs[slot].iter_mut().zip(&agg_idx) {
            acc.push(&row[i]);
        }
    }

    let mut columns: Vec<Column> = key_idx
        .iter()
        .map(|&i| table.columns()[i].clone())
        .collect();
    for agg in aggregations {
        let ty = match agg.op {
            AggregateOp::Count | AggregateOp::CountDistinct => DataType::Number,
            AggregateOp::Sum | AggregateOp::Average => DataType::Number,
            AggregateOp::Min | AggregateOp::Max => table.columns()[table.column_index(&agg.column)?].ty,
        };
        columns.push(Column::new(agg.output_name(), ty));
    }

    let rows = order
        .into_iter()
        .zip(accs)
        .map(|(mut key, accs)| {
            key.extend(accs.into_iter().map(Accumulator::finish));
            key
        })
        .collect();
    Table::new(columns, rows)
}

/* ───────────────────────────── distinct ───────────────────────────── */

pub fn distinct_rows(table: Table, columns: Option<&[String]>) -> Result<Table, FlowError> {
    let indices: Vec<usize> = match columns {
        Some(names) => names
            .iter()
            .map(|n| table.column_index(n))
            .collect::<Result<Vec<_>, _>>()?,
        None => (0..table.column_count()).collect(),
    };
    let cols = table.columns().to_vec();
    let mut seen: FxHashSet<Vec<Value>> = FxHashSet::default();
    let mut rows = Vec::new();
    for row in table.iter_rows() {
        let key: Vec<Value> = indices.iter().map(|&i| row[i].clone()).collect();
        // First occurrence wins, preserving its representation.
        if seen.insert(key) {
            rows.push(row.to_vec());
        }
    }
    Ok(Table::from_parts_unchecked(cols, rows))
}

/* ─────────────────────────── pivot / unpivot ──────────────────────── */

pub fn pivot(
    table: Table,
    column: &str,
    value_column: &str,
    aggregation: AggregateOp,
) -> Result<Table, FlowError> {
    let pivot_idx = table.column_index(column)?;
    let value_idx = table.column_index(value_column)?;
    let group_idx: Vec<usize> = (0..table.column_count())
        .filter(|&i| i != pivot_idx && i != value_idx)
        .collect();

    // New column headers are the pivot column's distinct values, in
    // first-seen order.
    let mut header_order: Vec<Value> = Vec::new();
    let mut header_slots: FxHashMap<Value, usize> = FxHashMap::default();
    for row in table.iter_rows() {
        let v = &row[pivot_idx];
        if !header_slots.contains_key(v) {
            header_slots.insert(v.clone(), header_order.len());
            header_order.push(v.clone());
        }
    }

    let mut group_order: Vec<Vec<Value>> = Vec::new();
    let mut groups: FxHashMap<Vec<Value>, usize> = FxHashMap::default();
    let mut cells: Vec<Vec<Accumulator>> = Vec::new();
    for row in table.iter_rows() {
        let key: Vec<Value> = group_idx.iter().map(|&i| row[i].clone()).collect();
        let slot = *groups.entry(key.clone()).or_insert_with(|| {
            group_order.push(key);
            cells.push(header_order.iter().map(|_| Accumulator::new(aggregation)).collect());
            group_order.len() - 1
        });
        let header = header_slots[&row[pivot_idx]];
        cells[slot][header].push(&row[value_idx]);
    }

    let raw_names: Vec<String> = group_idx
        .iter()
        .map(|&i| table.columns()[i].name.clone())
        .chain(header_order.iter().map(|v| match v {
            Value::Null => String::new(),
            other => other.to_string(),
        }))
        .collect();
    let names = unique_headers(&raw_names);
    let columns: Vec<Column> = names
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let ty = group_idx
                .get(i)
                .map(|&g| table.columns()[g].ty)
                .unwrap_or(DataType::Any);
            Column::new(name, ty)
        })
        .collect();

    let rows = group_order
        .into_iter()
        .zip(cells)
        .map(|(mut key, accs)| {
            key.extend(accs.into_iter().map(|acc| {
                if acc.count == 0 && acc.distinct.is_empty() && !acc.saw_number {
                    Value::Null
                } else {
                    acc.finish()
                }
            }));
            key
        })
        .collect();
    Table::new(columns, rows)
}

pub fn unpivot(
    table: Table,
    columns: &[String],
    name_column: &str,
    value_column: &str,
) -> Result<Table, FlowError> {
    let unpivot_idx = columns
        .iter()
        .map(|n| table.column_index(n))
        .collect::<Result<Vec<_>, _>>()?;
    let keep_idx: Vec<usize> = (0..table.column_count())
        .filter(|i| !unpivot_idx.contains(i))
        .collect();

    let mut out_columns: Vec<Column> = keep_idx
        .iter()
        .map(|&i| table.columns()[i].clone())
        .collect();
    out_columns.push(Column::new(name_column, DataType::Text));
    out_columns.push(Column::any(value_column));

    let mut rows = Vec::new();
    for row in table.iter_rows() {
        for &u in &unpivot_idx {
            // Null cells do not produce attribute rows.
            if row[u].is_null() {
                continue;
            }
            let mut out: Vec<Value> = keep_idx.iter().map(|&i| row[i].clone()).collect();
            out.push(Value::Text(table.columns()[u].name.clone()));
            out.push(row[u].clone());
            rows.push(out);
        }
    }
    Table::new(out_columns, rows)
}
