//! Row-expression columns and cell-level reshaping.

use sheetflow_common::{Column, DataType, FlowError, FlowErrorKind, Table, Value};
use sheetflow_parse::ast::Expr;
use sheetflow_parse::query::ColumnTransform;

use crate::interp::{self, RowCtx};

/// Evaluate a row formula, mapping evaluation failures to `Null`.
/// Unknown-column references are schema errors and abort instead.
fn eval_cell(expr: &Expr, ctx: &RowCtx<'_>) -> Result<Value, FlowError> {
    match interp::evaluate(expr, ctx) {
        Ok(v) => Ok(v),
        Err(e) if e.kind == FlowErrorKind::UnknownColumn => Err(e),
        Err(_) => Ok(Value::Null),
    }
}

pub fn add_column(table: Table, name: &str, formula: &Expr) -> Result<Table, FlowError> {
    if table.has_column(name) {
        return Err(FlowError::invalid_argument(
            "addColumn",
            format!("column '{name}' already exists"),
        ));
    }
    let mut columns = table.columns().to_vec();
    columns.push(Column::any(name));
    let src_columns = table.columns().to_vec();
    let rows = table
        .iter_rows()
        .map(|row| {
            let v = eval_cell(formula, &RowCtx::new(&src_columns, row))?;
            let mut out = row.to_vec();
            out.push(v);
            Ok(out)
        })
        .collect::<Result<Vec<_>, FlowError>>()?;
    Table::new(columns, rows)
}

pub fn transform_columns(table: Table, transforms: &[ColumnTransform]) -> Result<Table, FlowError> {
    let indices = transforms
        .iter()
        .map(|t| table.column_index(&t.column))
        .collect::<Result<Vec<_>, _>>()?;

    let mut columns = table.columns().to_vec();
    for (t, &i) in transforms.iter().zip(&indices) {
        if let Some(ty) = t.new_type {
            columns[i].ty = ty;
        }
    }
    let src_columns = table.columns().to_vec();
    let rows = table
        .iter_rows()
        .map(|row| {
            let mut out = row.to_vec();
            // Transforms see the original row, not each other's output.
            let ctx = RowCtx::new(&src_columns, row);
            for (t, &i) in transforms.iter().zip(&indices) {
                let mut v = eval_cell(&t.formula, &ctx)?;
                if let Some(ty) = t.new_type {
                    v = v.coerce(ty).unwrap_or(Value::Null);
                }
                out[i] = v;
            }
            Ok(out)
        })
        .collect::<Result<Vec<_>, FlowError>>()?;
    Table::new(columns, rows)
}

pub fn fill_down(table: Table, column_names: &[String]) -> Result<Table, FlowError> {
    let indices = column_names
        .iter()
        .map(|n| table.column_index(n))
        .collect::<Result<Vec<_>, _>>()?;
    let columns = table.columns().to_vec();
    let mut last: Vec<Option<Value>> = vec![None; indices.len()];
    let rows = table
        .iter_rows()
        .map(|row| {
            let mut out = row.to_vec();
            for (slot, &i) in indices.iter().enumerate() {
                if out[i].is_null() {
                    if let Some(v) = &last[slot] {
                        out[i] = v.clone();
                    }
                } else {
                    last[slot] = Some(out[i].clone());
                }
            }
            out
        })
        .collect();
    Ok(Table::from_parts_unchecked(columns, rows))
}

pub fn replace_values(
    table: Table,
    column: &str,
    find: &Value,
    replace: &Value,
) -> Result<Table, FlowError> {
    let idx = table.column_index(column)?;
    let columns = table.columns().to_vec();
    let rows = table
        .iter_rows()
        .map(|row| {
            let mut out = row.to_vec();
            if &out[idx] == find {
                out[idx] = replace.clone();
            }
            out
        })
        .collect();
    Ok(Table::from_parts_unchecked(columns, rows))
}

pub fn split_column(
    table: Table,
    column: &str,
    delimiter: &str,
    count: Option<usize>,
    names: Option<&[String]>,
) -> Result<Table, FlowError> {
    let idx = table.column_index(column)?;
    if delimiter.is_empty() {
        return Err(FlowError::invalid_argument("splitColumn", "empty delimiter"));
    }

    let split_cell = |v: &Value| -> Option<Vec<String>> {
        match v {
            Value::Null => None,
            other => Some(
                other
                    .to_string()
                    .split(delimiter)
                    .map(str::to_string)
                    .collect(),
            ),
        }
    };

    // Output width: explicit names, explicit count, or the widest split.
    let width = match (names, count) {
        (Some(names), _) => names.len(),
        (None, Some(n)) => n,
        (None, None) => table
            .iter_rows()
            .filter_map(|row| split_cell(&row[idx]).map(|p| p.len()))
            .max()
            .unwrap_or(1),
    }
    .max(1);

    let new_names: Vec<String> = match names {
        Some(names) => names.to_vec(),
        None => (1..=width).map(|i| format!("{column}.{i}")).collect(),
    };

    let mut columns: Vec<Column> = Vec::with_capacity(table.column_count() - 1 + width);
    for (i, c) in table.columns().iter().enumerate() {
        if i == idx {
            for name in &new_names {
                columns.push(Column::new(name.clone(), DataType::Text));
            }
        } else {
            columns.push(c.clone());
        }
    }

    let rows = table
        .iter_rows()
        .map(|row| {
            let parts = split_cell(&row[idx]);
            let mut out = Vec::with_capacity(columns.len());
            for (i, cell) in row.iter().enumerate() {
                if i == idx {
                    for slot in 0..width {
                        out.push(match &parts {
                            None => Value::Null,
                            Some(p) => p
                                .get(slot)
                                .map(|s| Value::Text(s.clone()))
                                .unwrap_or(Value::Null),
                        });
                    }
                } else {
                    out.push(cell.clone());
                }
            }
            out
        })
        .collect();
    Table::new(columns, rows)
}

pub fn combine_columns(
    table: Table,
    column_names: &[String],
    separator: &str,
    new_name: &str,
) -> Result<Table, FlowError> {
    let indices = column_names
        .iter()
        .map(|n| table.column_index(n))
        .collect::<Result<Vec<_>, _>>()?;
    if indices.is_empty() {
        return Err(FlowError::invalid_argument("combineColumns", "no columns given"));
    }
    let first = indices[0];

    let survives = |i: usize| !indices.contains(&i);
    if table
        .columns()
        .iter()
        .enumerate()
        .any(|(i, c)| survives(i) && c.name == new_name)
    {
        return Err(FlowError::invalid_argument(
            "combineColumns",
            format!("column '{new_name}' already exists"),
        ));
    }

    // The combined column lands at the first source column's position.
    let mut columns: Vec<Column> = Vec::with_capacity(table.column_count() - indices.len() + 1);
    for (i, c) in table.columns().iter().enumerate() {
        if i == first {
            columns.push(Column::new(new_name, DataType::Text));
        } else if survives(i) {
            columns.push(c.clone());
        }
    }

    let rows = table
        .iter_rows()
        .map(|row| {
            let combined = indices
                .iter()
                .map(|&i| match &row[i] {
                    Value::Null => String::new(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(separator);
            let mut out = Vec::with_capacity(columns.len());
            for (i, cell) in row.iter().enumerate() {
                if i == first {
                    out.push(Value::Text(combined.clone()));
                } else if survives(i) {
                    out.push(cell.clone());
                }
            }
            out
        })
        .collect();
    Table::new(columns, rows)
}
