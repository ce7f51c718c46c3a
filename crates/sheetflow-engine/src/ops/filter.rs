//! Row filtering over the structured predicate tree.

use sheetflow_common::{FlowError, FlowErrorKind, Table, Value};
use sheetflow_parse::query::{CompareOp, FilterPredicate};

use crate::interp::{self, RowCtx};

pub fn filter_rows(table: Table, predicate: &FilterPredicate) -> Result<Table, FlowError> {
    validate(predicate, &table)?;
    let columns = table.columns().to_vec();
    let mut rows = Vec::new();
    for row in table.iter_rows() {
        if eval_predicate(predicate, &RowCtx::new(&columns, row))? {
            rows.push(row.to_vec());
        }
    }
    Ok(Table::from_parts_unchecked(columns, rows))
}

/// Missing columns are a schema error and abort before any row runs.
fn validate(predicate: &FilterPredicate, table: &Table) -> Result<(), FlowError> {
    match predicate {
        FilterPredicate::Comparison { column, .. } => table.column_index(column).map(|_| ()),
        FilterPredicate::And { predicates } | FilterPredicate::Or { predicates } => {
            predicates.iter().try_for_each(|p| validate(p, table))
        }
        FilterPredicate::Not { predicate } => validate(predicate, table),
        FilterPredicate::Expression { .. } => Ok(()),
    }
}

pub fn eval_predicate(predicate: &FilterPredicate, ctx: &RowCtx<'_>) -> Result<bool, FlowError> {
    match predicate {
        FilterPredicate::And { predicates } => {
            for p in predicates {
                if !eval_predicate(p, ctx)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        FilterPredicate::Or { predicates } => {
            for p in predicates {
                if eval_predicate(p, ctx)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        FilterPredicate::Not { predicate } => Ok(!eval_predicate(predicate, ctx)?),
        FilterPredicate::Expression { expr } => match interp::evaluate(expr, ctx) {
            Ok(v) => Ok(v.is_truthy()),
            // Schema errors surface; per-row evaluation failures drop the row.
            Err(e) if e.kind == FlowErrorKind::UnknownColumn => Err(e),
            Err(_) => Ok(false),
        },
        FilterPredicate::Comparison {
            column,
            op,
            value,
            case_sensitive,
        } => {
            let cell = ctx
                .columns
                .iter()
                .position(|c| c.name == *column)
                .map(|i| &ctx.row[i])
                .ok_or_else(|| FlowError::unknown_column(column))?;
            Ok(compare(cell, *op, value.as_ref(), case_sensitive.unwrap_or(true)))
        }
    }
}

fn compare(cell: &Value, op: CompareOp, value: Option<&Value>, case_sensitive: bool) -> bool {
    match op {
        CompareOp::IsNull => return cell.is_null(),
        CompareOp::IsNotNull => return !cell.is_null(),
        _ => {}
    }
    let Some(value) = value else {
        return false;
    };
    match op {
        CompareOp::Equals => eq(cell, value, case_sensitive),
        CompareOp::NotEquals => !eq(cell, value, case_sensitive),
        CompareOp::GreaterThan
        | CompareOp::GreaterThanOrEqual
        | CompareOp::LessThan
        | CompareOp::LessThanOrEqual => {
            if cell.is_null() || value.is_null() {
                return false;
            }
            let ord = cell.compare(value);
            match op {
                CompareOp::GreaterThan => ord.is_gt(),
                CompareOp::GreaterThanOrEqual => ord.is_ge(),
                CompareOp::LessThan => ord.is_lt(),
                CompareOp::LessThanOrEqual => ord.is_le(),
                _ => unreachable!(),
            }
        }
        CompareOp::Contains | CompareOp::StartsWith | CompareOp::EndsWith => {
            if cell.is_null() {
                return false;
            }
            let mut hay = cell.to_string();
            let mut needle = value.to_string();
            if !case_sensitive {
                hay = hay.to_lowercase();
                needle = needle.to_lowercase();
            }
            match op {
                CompareOp::Contains => hay.contains(&needle),
                CompareOp::StartsWith => hay.starts_with(&needle),
                CompareOp::EndsWith => hay.ends_with(&needle),
                _ => unreachable!(),
            }
        }
        CompareOp::IsNull | CompareOp::IsNotNull => unreachable!(),
    }
}

fn eq(cell: &Value, value: &Value, case_sensitive: bool) -> bool {
    if !case_sensitive {
        if let (Value::Text(a), Value::Text(b)) = (cell, value) {
            return a.to_lowercase() == b.to_lowercase();
        }
    }
    cell == value
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetflow_common::Column;

    fn table() -> Table {
        Table::new(
            vec![Column::any("Name"), Column::any("Score")],
            vec![
                vec!["Ada".into(), Value::Int(90)],
                vec!["bob".into(), Value::Int(70)],
                vec![Value::Null, Value::Int(50)],
            ],
        )
        .unwrap()
    }

    fn cmp(column: &str, op: CompareOp, value: Option<Value>) -> FilterPredicate {
        FilterPredicate::Comparison {
            column: column.into(),
            op,
            value,
            case_sensitive: None,
        }
    }

    #[test]
    fn comparison_and_null_handling() {
        let out = filter_rows(
            table(),
            &cmp("Score", CompareOp::GreaterThanOrEqual, Some(Value::Int(70))),
        )
        .unwrap();
        assert_eq!(out.row_count(), 2);

        let nulls = filter_rows(table(), &cmp("Name", CompareOp::IsNull, None)).unwrap();
        assert_eq!(nulls.row_count(), 1);
    }

    #[test]
    fn case_sensitivity_defaults_to_true() {
        let strict = filter_rows(
            table(),
            &cmp("Name", CompareOp::Equals, Some("BOB".into())),
        )
        .unwrap();
        assert_eq!(strict.row_count(), 0);

        let loose = filter_rows(
            table(),
            &FilterPredicate::Comparison {
                column: "Name".into(),
                op: CompareOp::Equals,
                value: Some("BOB".into()),
                case_sensitive: Some(false),
            },
        )
        .unwrap();
        assert_eq!(loose.row_count(), 1);
    }

    #[test]
    fn missing_column_is_schema_error() {
        let err = filter_rows(table(), &cmp("Nope", CompareOp::IsNull, None)).unwrap_err();
        assert_eq!(err.kind, FlowErrorKind::UnknownColumn);
    }

    #[test]
    fn boolean_combinators() {
        let p = FilterPredicate::And {
            predicates: vec![
                cmp("Score", CompareOp::GreaterThan, Some(Value::Int(40))),
                FilterPredicate::Not {
                    predicate: Box::new(cmp("Name", CompareOp::Equals, Some("bob".into()))),
                },
            ],
        };
        let out = filter_rows(table(), &p).unwrap();
        assert_eq!(out.row_count(), 2);
    }
}
