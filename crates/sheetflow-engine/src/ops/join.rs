//! Merge (flat and nested), append, and nested-table expansion.
//!
//! Join keys are matched by structural value equality, with `null`
//! equal to `null`. Per-key comparers may relax text matching to
//! case-insensitive.

use rustc_hash::{FxHashMap, FxHashSet};
use sheetflow_common::{Column, DataType, FlowError, Table, Value, table::unique_headers};
use sheetflow_parse::query::{JoinMode, JoinType, KeyComparer};

pub struct MergeSpec<'a> {
    pub left_keys: &'a [String],
    pub right_keys: &'a [String],
    pub join_type: JoinType,
    pub join_mode: JoinMode,
    pub new_column_name: &'a str,
    pub comparers: Option<&'a [KeyComparer]>,
}

pub fn merge(left: Table, right: Table, spec: MergeSpec<'_>) -> Result<Table, FlowError> {
    if spec.left_keys.len() != spec.right_keys.len() {
        return Err(FlowError::invalid_argument(
            "merge",
            "left and right key lists must have the same length",
        ));
    }
    if spec.left_keys.is_empty() {
        return Err(FlowError::invalid_argument("merge", "at least one join key required"));
    }
    if let Some(comparers) = spec.comparers {
        if comparers.len() != spec.left_keys.len() {
            return Err(FlowError::invalid_argument(
                "comparers",
                "comparer list length must equal the key count",
            ));
        }
    }
    let left_idx = spec
        .left_keys
        .iter()
        .map(|k| left.column_index(k))
        .collect::<Result<Vec<_>, _>>()?;
    let right_idx = spec
        .right_keys
        .iter()
        .map(|k| right.column_index(k))
        .collect::<Result<Vec<_>, _>>()?;

    let key_of = |row: &[Value], idx: &[usize]| -> Vec<Value> {
        idx.iter()
            .enumerate()
            .map(|(k, &i)| normalize_key(&row[i], spec.comparers.map(|c| c[k])))
            .collect()
    };

    // Hash index over the smaller, right-hand side.
    let mut index: FxHashMap<Vec<Value>, Vec<usize>> = FxHashMap::default();
    for (r, row) in right.iter_rows().enumerate() {
        index.entry(key_of(row, &right_idx)).or_default().push(r);
    }

    match spec.join_mode {
        JoinMode::Flat => merge_flat(left, right, spec.join_type, &left_idx, index, key_of),
        JoinMode::Nested => merge_nested(
            left,
            right,
            spec.join_type,
            spec.new_column_name,
            &left_idx,
            index,
            key_of,
        ),
    }
}

fn normalize_key(v: &Value, comparer: Option<KeyComparer>) -> Value {
    match (comparer, v) {
        (Some(KeyComparer::CaseInsensitive), Value::Text(s)) => Value::Text(s.to_lowercase()),
        _ => v.clone(),
    }
}

fn merge_flat(
    left: Table,
    right: Table,
    join_type: JoinType,
    left_idx: &[usize],
    index: FxHashMap<Vec<Value>, Vec<usize>>,
    key_of: impl Fn(&[Value], &[usize]) -> Vec<Value>,
) -> Result<Table, FlowError> {
    // Right-side columns are appended, deduped against the left names.
    let raw_names: Vec<String> = left
        .columns()
        .iter()
        .chain(right.columns())
        .map(|c| c.name.clone())
        .collect();
    let names = unique_headers(&raw_names);
    let columns: Vec<Column> = left
        .columns()
        .iter()
        .chain(right.columns())
        .zip(names)
        .map(|(c, name)| Column::new(name, c.ty))
        .collect();

    let left_width = left.column_count();
    let right_width = right.column_count();
    let mut matched_right: FxHashSet<usize> = FxHashSet::default();
    let mut rows: Vec<Vec<Value>> = Vec::new();

    let left_key_cols: Vec<usize> = left_idx.to_vec();
    for row in left.iter_rows() {
        let key = key_of(row, &left_key_cols);
        match index.get(&key) {
            Some(matches) => {
                for &r in matches {
                    matched_right.insert(r);
                    let mut out = row.to_vec();
                    out.extend(right.row(r).iter().cloned());
                    rows.push(out);
                }
            }
            None => match join_type {
                JoinType::Left | JoinType::Full => {
                    let mut out = row.to_vec();
                    out.extend(std::iter::repeat_n(Value::Null, right_width));
                    rows.push(out);
                }
                JoinType::Inner | JoinType::Right => {}
            },
        }
    }
    if matches!(join_type, JoinType::Right | JoinType::Full) {
        for (r, row) in right.iter_rows().enumerate() {
            if !matched_right.contains(&r) {
                let mut out = vec![Value::Null; left_width];
                out.extend(row.iter().cloned());
                rows.push(out);
            }
        }
    }
    Ok(Table::from_parts_unchecked(columns, rows))
}

fn merge_nested(
    left: Table,
    right: Table,
    join_type: JoinType,
    new_column_name: &str,
    left_idx: &[usize],
    index: FxHashMap<Vec<Value>, Vec<usize>>,
    key_of: impl Fn(&[Value], &[usize]) -> Vec<Value>,
) -> Result<Table, FlowError> {
    let raw_names: Vec<String> = left
        .columns()
        .iter()
        .map(|c| c.name.clone())
        .chain([new_column_name.to_string()])
        .collect();
    let names = unique_headers(&raw_names);
    let columns: Vec<Column> = left
        .columns()
        .iter()
        .map(|c| (c.name.clone(), c.ty))
        .chain([(new_column_name.to_string(), DataType::Any)])
        .zip(names)
        .map(|((_, ty), name)| Column::new(name, ty))
        .collect();

    let nested_of = |rows_idx: &[usize]| -> Value {
        let nested_rows: Vec<Vec<Value>> = rows_idx
            .iter()
            .map(|&r| right.row(r).to_vec())
            .collect();
        Value::Table(Box::new(Table::from_parts_unchecked(
            right.columns().to_vec(),
            nested_rows,
        )))
    };

    let mut matched_right: FxHashSet<usize> = FxHashSet::default();
    let mut rows: Vec<Vec<Value>> = Vec::new();
    for row in left.iter_rows() {
        let key = key_of(row, left_idx);
        let matches = index.get(&key).map(Vec::as_slice).unwrap_or(&[]);
        matched_right.extend(matches.iter().copied());
        if matches.is_empty() && join_type == JoinType::Inner {
            continue;
        }
        let mut out = row.to_vec();
        out.push(nested_of(matches));
        rows.push(out);
    }
    if matches!(join_type, JoinType::Right | JoinType::Full) {
        let left_width = left.column_count();
        for (r, _) in right.iter_rows().enumerate() {
            if !matched_right.contains(&r) {
                let mut out = vec![Value::Null; left_width];
                out.push(nested_of(&[r]));
                rows.push(out);
            }
        }
    }
    Ok(Table::from_parts_unchecked(columns, rows))
}

/* ────────────────────────────── append ────────────────────────────── */

/// Vertical stack: columns are unioned in appearance order; cells a
/// table lacks come out `null`.
pub fn append(first: Table, others: Vec<Table>) -> Result<Table, FlowError> {
    let mut tables = vec![first];
    tables.extend(others);

    let mut columns: Vec<Column> = Vec::new();
    for t in &tables {
        for col in t.columns() {
            match columns.iter_mut().find(|c| c.name == col.name) {
                None => columns.push(col.clone()),
                Some(existing) => {
                    if existing.ty != col.ty {
                        existing.ty = DataType::Any;
                    }
                }
            }
        }
    }

    let mut rows = Vec::new();
    for t in &tables {
        let mapping: Vec<Option<usize>> = columns
            .iter()
            .map(|c| t.columns().iter().position(|tc| tc.name == c.name))
            .collect();
        for row in t.iter_rows() {
            rows.push(
                mapping
                    .iter()
                    .map(|m| m.map(|i| row[i].clone()).unwrap_or(Value::Null))
                    .collect(),
            );
        }
    }
    Table::new(columns, rows)
}

/* ─────────────────────── nested-table expansion ───────────────────── */

/// Flatten a nested-table column. Rows whose nested table is empty (or
/// null) keep the left row once with `null` expanded cells.
pub fn expand_table_column(
    table: Table,
    column: &str,
    expand: &[String],
) -> Result<Table, FlowError> {
    let idx = table.column_index(column)?;
    if expand.is_empty() {
        return Err(FlowError::invalid_argument(
            "expandTableColumn",
            "no columns to expand",
        ));
    }

    let raw_names: Vec<String> = table
        .columns()
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != idx)
        .map(|(_, c)| c.name.clone())
        .collect();
    // Expanded names are deduped against the remaining columns.
    let mut all = raw_names.clone();
    all.extend(expand.iter().cloned());
    let uniqued = unique_headers(&all);
    let expanded_names = &uniqued[raw_names.len()..];

    let mut columns: Vec<Column> = Vec::with_capacity(table.column_count() - 1 + expand.len());
    let mut kept = 0usize;
    for (i, c) in table.columns().iter().enumerate() {
        if i == idx {
            // Expanded columns take the nested column's position.
            for name in expanded_names {
                columns.push(Column::any(name.clone()));
            }
        } else {
            columns.push(Column::new(uniqued[kept].clone(), c.ty));
            kept += 1;
        }
    }

    let mut rows = Vec::new();
    for row in table.iter_rows() {
        let nested = match &row[idx] {
            Value::Table(t) => Some(t.as_ref()),
            Value::Null => None,
            _ => {
                return Err(FlowError::invalid_argument(
                    "expandTableColumn",
                    format!("column '{column}' does not hold nested tables"),
                ));
            }
        };
        let emit = |rows: &mut Vec<Vec<Value>>, expanded: Vec<Value>| {
            let mut out = Vec::with_capacity(columns.len());
            for (i, cell) in row.iter().enumerate() {
                if i == idx {
                    out.extend(expanded.iter().cloned());
                } else {
                    out.push(cell.clone());
                }
            }
            rows.push(out);
        };
        match nested {
            None => emit(&mut rows, vec![Value::Null; expand.len()]),
            Some(t) if t.row_count() == 0 => emit(&mut rows, vec![Value::Null; expand.len()]),
            Some(t) => {
                let src: Vec<Option<usize>> = expand
                    .iter()
                    .map(|name| t.columns().iter().position(|c| &c.name == name))
                    .collect();
                for nested_row in t.iter_rows() {
                    emit(
                        &mut rows,
                        src.iter()
                            .map(|m| m.map(|i| nested_row[i].clone()).unwrap_or(Value::Null))
                            .collect(),
                    );
                }
            }
        }
    }
    Table::new(columns, rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(cols: &[&str], rows: Vec<Vec<Value>>) -> Table {
        Table::new(cols.iter().map(|c| Column::any(*c)).collect(), rows).unwrap()
    }

    fn spec<'a>(
        left: &'a [String],
        right: &'a [String],
        join_type: JoinType,
        join_mode: JoinMode,
    ) -> MergeSpec<'a> {
        MergeSpec {
            left_keys: left,
            right_keys: right,
            join_type,
            join_mode,
            new_column_name: "Nested",
            comparers: None,
        }
    }

    #[test]
    fn left_join_with_null_keys_matching() {
        let left = t(
            &["Id", "Region", "Sales"],
            vec![
                vec![Value::Int(1), "East".into(), Value::Int(100)],
                vec![Value::Int(1), "West".into(), Value::Int(200)],
                vec![Value::Int(2), "East".into(), Value::Int(300)],
                vec![Value::Int(3), Value::Null, Value::Int(400)],
            ],
        );
        let right = t(
            &["Id", "Region", "Code"],
            vec![
                vec![Value::Int(1), "East".into(), "A".into()],
                vec![Value::Int(1), "West".into(), "B".into()],
                vec![Value::Int(3), Value::Null, "C".into()],
            ],
        );
        let keys = vec!["Id".to_string(), "Region".to_string()];
        let out = merge(left, right, spec(&keys, &keys, JoinType::Left, JoinMode::Flat)).unwrap();
        assert_eq!(out.row_count(), 4);
        let code_idx = out.column_index("Code").unwrap();
        let codes: Vec<Value> = (0..4).map(|r| out.cell(r, code_idx).clone()).collect();
        assert_eq!(
            codes,
            vec!["A".into(), "B".into(), Value::Null, "C".into()]
        );
        // Right key columns got deduped names.
        assert!(out.has_column("Id.1"));
        assert!(out.has_column("Region.1"));
    }

    #[test]
    fn nested_join_then_expand_matches_flat_left_join() {
        let left = t(
            &["K", "V"],
            vec![
                vec![Value::Int(1), "a".into()],
                vec![Value::Int(2), "b".into()],
            ],
        );
        let right = t(
            &["K", "W"],
            vec![
                vec![Value::Int(1), "x".into()],
                vec![Value::Int(1), "y".into()],
            ],
        );
        let keys = vec!["K".to_string()];
        let nested = merge(
            left.clone(),
            right.clone(),
            spec(&keys, &keys, JoinType::Left, JoinMode::Nested),
        )
        .unwrap();
        let expanded = expand_table_column(nested, "Nested", &["W".to_string()]).unwrap();

        // Left-outer preservation: unmatched K=2 keeps one row with null.
        assert_eq!(expanded.row_count(), 3);
        let w = expanded.column_index("W").unwrap();
        assert_eq!(expanded.cell(2, w), &Value::Null);
    }

    #[test]
    fn full_join_appends_unmatched_right_rows() {
        let left = t(&["K"], vec![vec![Value::Int(1)]]);
        let right = t(&["K"], vec![vec![Value::Int(2)]]);
        let keys = vec!["K".to_string()];
        let out = merge(left, right, spec(&keys, &keys, JoinType::Full, JoinMode::Flat)).unwrap();
        assert_eq!(out.row_count(), 2);
        assert_eq!(out.cell(1, 0), &Value::Null);
        assert_eq!(out.cell(1, 1), &Value::Int(2));
    }

    #[test]
    fn comparer_list_length_must_match() {
        let left = t(&["K"], vec![]);
        let right = t(&["K"], vec![]);
        let keys = vec!["K".to_string()];
        let mut s = spec(&keys, &keys, JoinType::Inner, JoinMode::Flat);
        let comparers = vec![KeyComparer::Exact, KeyComparer::CaseInsensitive];
        s.comparers = Some(&comparers);
        assert!(merge(left, right, s).is_err());
    }

    #[test]
    fn case_insensitive_comparer_joins_across_case() {
        let left = t(&["K"], vec![vec!["abc".into()]]);
        let right = t(&["K", "V"], vec![vec!["ABC".into(), Value::Int(1)]]);
        let keys = vec!["K".to_string()];
        let mut s = spec(&keys, &keys, JoinType::Inner, JoinMode::Flat);
        let comparers = vec![KeyComparer::CaseInsensitive];
        s.comparers = Some(&comparers);
        let out = merge(left, right, s).unwrap();
        assert_eq!(out.row_count(), 1);
    }

    #[test]
    fn append_unions_columns_in_appearance_order() {
        let a = t(&["X", "Y"], vec![vec![Value::Int(1), Value::Int(2)]]);
        let b = t(&["Y", "Z"], vec![vec![Value::Int(3), Value::Int(4)]]);
        let out = append(a, vec![b]).unwrap();
        let names: Vec<&str> = out.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["X", "Y", "Z"]);
        assert_eq!(out.cell(0, 2), &Value::Null);
        assert_eq!(out.cell(1, 0), &Value::Null);
        assert_eq!(out.cell(1, 1), &Value::Int(3));
    }
}
