//! Single-operation application.
//!
//! Each function takes an owned table and returns a new one; tables are
//! never mutated in place. Operations that pull in other queries
//! (`merge`, `append`) resolve them through [`RightTableResolver`].

mod filter;
mod join;
mod reshape;
mod sort_group;

pub use filter::eval_predicate;

use sheetflow_common::{Column, DataType, FlowError, Table, Value, table::unique_headers};
use sheetflow_parse::query::{NameTransform, Operation};

/// Supplies the materialized table of another query by id.
pub trait RightTableResolver {
    fn resolve(&mut self, id: &str) -> Result<Table, FlowError>;
}

/// Resolver for pipelines that never reference other queries.
pub struct NoQueries;

impl RightTableResolver for NoQueries {
    fn resolve(&mut self, id: &str) -> Result<Table, FlowError> {
        Err(FlowError::invalid_argument(
            "query",
            format!("no query '{id}' in context"),
        ))
    }
}

pub fn apply_operation(
    table: Table,
    op: &Operation,
    resolver: &mut dyn RightTableResolver,
) -> Result<Table, FlowError> {
    match op {
        Operation::SelectColumns { columns } => select_columns(table, columns),
        Operation::RemoveColumns { columns } => remove_columns(table, columns),
        Operation::FilterRows { predicate } => filter::filter_rows(table, predicate),
        Operation::SortRows { sort_by } => sort_group::sort_rows(table, sort_by),
        Operation::GroupBy { keys, aggregations } => sort_group::group_by(table, keys, aggregations),
        Operation::AddColumn { name, formula } => reshape::add_column(table, name, formula),
        Operation::TransformColumns { transforms } => reshape::transform_columns(table, transforms),
        Operation::RenameColumn { from, to } => rename_column(table, from, to),
        Operation::ChangeType { column, new_type } => change_type(table, column, *new_type),
        Operation::Take { count } => Ok(take(table, *count)),
        Operation::Skip { count } => Ok(skip(table, *count)),
        Operation::DistinctRows { columns } => sort_group::distinct_rows(table, columns.as_deref()),
        Operation::Pivot {
            column,
            value_column,
            aggregation,
        } => sort_group::pivot(table, column, value_column, *aggregation),
        Operation::Unpivot {
            columns,
            name_column,
            value_column,
        } => sort_group::unpivot(table, columns, name_column, value_column),
        Operation::Merge {
            left_keys,
            right_query,
            right_keys,
            join_type,
            join_mode,
            new_column_name,
            comparers,
            join_algorithm: _,
        } => {
            let right = resolver.resolve(right_query)?;
            join::merge(
                table,
                right,
                join::MergeSpec {
                    left_keys,
                    right_keys,
                    join_type: *join_type,
                    join_mode: *join_mode,
                    new_column_name: new_column_name.as_deref().unwrap_or(right_query),
                    comparers: comparers.as_deref(),
                },
            )
        }
        Operation::Append { queries } => {
            let mut others = Vec::with_capacity(queries.len());
            for id in queries {
                others.push(resolver.resolve(id)?);
            }
            join::append(table, others)
        }
        Operation::ExpandTableColumn { column, columns } => {
            join::expand_table_column(table, column, columns)
        }
        Operation::FillDown { columns } => reshape::fill_down(table, columns),
        Operation::ReplaceValues {
            column,
            find,
            replace,
        } => reshape::replace_values(table, column, find, replace),
        Operation::SplitColumn {
            column,
            delimiter,
            count,
            names,
        } => reshape::split_column(table, column, delimiter, *count, names.as_deref()),
        Operation::CombineColumns {
            columns,
            separator,
            new_name,
        } => reshape::combine_columns(table, columns, separator, new_name),
        Operation::AddIndexColumn {
            name,
            start,
            increment,
        } => add_index_column(table, name, *start, *increment),
        Operation::PromoteHeaders => promote_headers(table),
        Operation::DemoteHeaders => Ok(demote_headers(table)),
        Operation::TransformColumnNames { transform } => {
            Ok(transform_column_names(table, *transform))
        }
    }
}

/* ────────────────────────── column shaping ────────────────────────── */

fn select_columns(table: Table, names: &[String]) -> Result<Table, FlowError> {
    let indices = names
        .iter()
        .map(|n| table.column_index(n))
        .collect::<Result<Vec<_>, _>>()?;
    let columns: Vec<Column> = indices.iter().map(|&i| table.columns()[i].clone()).collect();
    let rows = table
        .iter_rows()
        .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
        .collect();
    Table::new(columns, rows)
}

fn remove_columns(table: Table, names: &[String]) -> Result<Table, FlowError> {
    for n in names {
        table.column_index(n)?;
    }
    let keep: Vec<usize> = (0..table.column_count())
        .filter(|&i| !names.iter().any(|n| n == &table.columns()[i].name))
        .collect();
    let columns: Vec<Column> = keep.iter().map(|&i| table.columns()[i].clone()).collect();
    let rows = table
        .iter_rows()
        .map(|row| keep.iter().map(|&i| row[i].clone()).collect())
        .collect();
    Table::new(columns, rows)
}

fn rename_column(table: Table, from: &str, to: &str) -> Result<Table, FlowError> {
    let idx = table.column_index(from)?;
    if table.has_column(to) {
        return Err(FlowError::invalid_argument(
            "renameColumn",
            format!("column '{to}' already exists"),
        ));
    }
    let mut columns = table.columns().to_vec();
    columns[idx].name = to.to_string();
    let rows = table.iter_rows().map(<[Value]>::to_vec).collect();
    Table::new(columns, rows)
}

fn change_type(table: Table, column: &str, new_type: DataType) -> Result<Table, FlowError> {
    let idx = table.column_index(column)?;
    let mut columns = table.columns().to_vec();
    columns[idx].ty = new_type;
    let rows = table
        .iter_rows()
        .map(|row| {
            let mut out = row.to_vec();
            // Unparseable cells become null, never an error.
            out[idx] = out[idx].coerce(new_type).unwrap_or(Value::Null);
            out
        })
        .collect();
    Table::new(columns, rows)
}

fn clamp_count(count: i64) -> usize {
    count.max(0) as usize
}

fn take(table: Table, count: i64) -> Table {
    let n = clamp_count(count);
    let columns = table.columns().to_vec();
    let rows: Vec<Vec<Value>> = table.into_rows().into_iter().take(n).collect();
    Table::from_parts_unchecked(columns, rows)
}

fn skip(table: Table, count: i64) -> Table {
    let n = clamp_count(count);
    let columns = table.columns().to_vec();
    let rows: Vec<Vec<Value>> = table.into_rows().into_iter().skip(n).collect();
    Table::from_parts_unchecked(columns, rows)
}

fn add_index_column(table: Table, name: &str, start: i64, increment: i64) -> Result<Table, FlowError> {
    if table.has_column(name) {
        return Err(FlowError::invalid_argument(
            "addIndexColumn",
            format!("column '{name}' already exists"),
        ));
    }
    let mut columns = table.columns().to_vec();
    columns.push(Column::new(name, DataType::Number));
    let rows = table
        .iter_rows()
        .enumerate()
        .map(|(i, row)| {
            let mut out = row.to_vec();
            out.push(Value::Int(start + i as i64 * increment));
            out
        })
        .collect();
    Table::new(columns, rows)
}

fn promote_headers(table: Table) -> Result<Table, FlowError> {
    if table.row_count() == 0 {
        return Ok(table);
    }
    let raw: Vec<String> = table
        .row(0)
        .iter()
        .map(|v| match v {
            Value::Null => String::new(),
            other => other.to_string(),
        })
        .collect();
    let names = unique_headers(&raw);
    let columns: Vec<Column> = names.into_iter().map(Column::any).collect();
    let rows = table.iter_rows().skip(1).map(<[Value]>::to_vec).collect();
    Table::new(columns, rows)
}

fn demote_headers(table: Table) -> Table {
    let width = table.column_count();
    let header_row: Vec<Value> = table
        .columns()
        .iter()
        .map(|c| Value::Text(c.name.clone()))
        .collect();
    let columns: Vec<Column> = (0..width)
        .map(|i| Column::any(format!("Column{}", i + 1)))
        .collect();
    let mut rows = Vec::with_capacity(table.row_count() + 1);
    rows.push(header_row);
    rows.extend(table.iter_rows().map(<[Value]>::to_vec));
    Table::from_parts_unchecked(columns, rows)
}

fn transform_column_names(table: Table, transform: NameTransform) -> Table {
    let raw: Vec<String> = table
        .columns()
        .iter()
        .map(|c| match transform {
            NameTransform::Uppercase => c.name.to_uppercase(),
            NameTransform::Lowercase => c.name.to_lowercase(),
            NameTransform::Trim => c.name.trim().to_string(),
            NameTransform::Capitalize => {
                let mut chars = c.name.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                }
            }
        })
        .collect();
    // Transforms can collide (two names differing only in case); re-unique.
    let names = unique_headers(&raw);
    let columns: Vec<Column> = table
        .columns()
        .iter()
        .zip(names)
        .map(|(c, name)| Column::new(name, c.ty))
        .collect();
    let rows = table.iter_rows().map(<[Value]>::to_vec).collect();
    Table::from_parts_unchecked(columns, rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(cols: &[&str], rows: Vec<Vec<Value>>) -> Table {
        Table::new(cols.iter().map(|c| Column::any(*c)).collect(), rows).unwrap()
    }

    #[test]
    fn select_is_order_preserving_and_idempotent() {
        let table = t(
            &["A", "B", "C"],
            vec![vec![1.into(), 2.into(), 3.into()]],
        );
        let names = vec!["C".to_string(), "A".to_string()];
        let once = select_columns(table, &names).unwrap();
        let twice = select_columns(once.clone(), &names).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once.columns()[0].name, "C");
        assert_eq!(once.cell(0, 0), &Value::Int(3));
    }

    #[test]
    fn select_missing_column_errors() {
        let table = t(&["A"], vec![]);
        assert!(select_columns(table, &["Z".to_string()]).is_err());
    }

    #[test]
    fn take_and_skip_clamp_negatives() {
        let table = t(&["A"], (0..5).map(|i| vec![Value::Int(i)]).collect());
        assert_eq!(take(table.clone(), -3).row_count(), 0);
        assert_eq!(skip(table, -3).row_count(), 5);
    }

    #[test]
    fn change_type_unparseable_becomes_null() {
        let table = t(
            &["A"],
            vec![vec!["12".into()], vec!["x".into()], vec![Value::Null]],
        );
        let out = change_type(table, "A", DataType::Number).unwrap();
        assert_eq!(out.cell(0, 0), &Value::Number(12.0));
        assert_eq!(out.cell(1, 0), &Value::Null);
        assert_eq!(out.cell(2, 0), &Value::Null);
    }

    #[test]
    fn promote_then_demote_round_trips_shape() {
        let table = t(
            &["Column1", "Column2"],
            vec![
                vec!["h1".into(), "h2".into()],
                vec![1.into(), 2.into()],
            ],
        );
        let promoted = promote_headers(table).unwrap();
        assert_eq!(promoted.columns()[0].name, "h1");
        let demoted = demote_headers(promoted);
        assert_eq!(demoted.row_count(), 2);
        assert_eq!(demoted.cell(0, 1), &Value::Text("h2".into()));
    }

    #[test]
    fn name_transform_collisions_are_reuniqued() {
        let table = t(&["a", "A"], vec![]);
        let out = transform_column_names(table, NameTransform::Uppercase);
        assert_eq!(out.columns()[0].name, "A");
        assert_eq!(out.columns()[1].name, "A.1");
    }
}
