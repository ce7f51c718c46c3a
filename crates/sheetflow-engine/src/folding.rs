//! Source folding: rewrite a prefix of pipeline steps into a
//! source-native request.
//!
//! Folding is advisory. The planner scans steps from index 0 until it
//! hits something the source cannot express, then returns the rewritten
//! source plus the residual step list; the engine runs the residual
//! steps normally, so visible semantics never change. Unsupported
//! constructs raise the internal `Folding.Unsupported` signal, which is
//! caught here and never surfaced.

use sheetflow_common::{DataType, FlowError, FlowErrorKind, Value};
use sheetflow_parse::query::{
    CompareOp, FilterPredicate, NullsOrder, Operation, SortDirection, SourceSpec, Step,
};
use tracing::debug;

use crate::source::LoadHints;
use crate::source::odata::{ODataQuery, compose_url};

#[derive(Debug, Clone)]
pub struct FoldPlan {
    /// Source to load, possibly rewritten.
    pub source: SourceSpec,
    /// Steps still to run after the source load.
    pub residual: Vec<Step>,
    /// Reader hints (parquet projection and row limit).
    pub hints: LoadHints,
    /// How many leading steps were folded away.
    pub folded_steps: usize,
    /// Human-readable folded request (SQL text or URL) for meta.
    pub folded_request: Option<String>,
}

impl FoldPlan {
    fn unfolded(source: &SourceSpec, steps: &[Step]) -> Self {
        Self {
            source: source.clone(),
            residual: steps.to_vec(),
            hints: LoadHints::default(),
            folded_steps: 0,
            folded_request: None,
        }
    }
}

fn unsupported(what: impl Into<String>) -> FlowError {
    FlowError::new(FlowErrorKind::FoldingUnsupported).with_message(what.into())
}

pub fn plan_folding(source: &SourceSpec, steps: &[Step]) -> FoldPlan {
    match source {
        SourceSpec::Database {
            connection,
            table: Some(table),
            query: None,
            columns,
        } if !columns.is_empty() => fold_sql(connection, table, columns, source, steps),
        SourceSpec::OData { url } => fold_odata(url, source, steps),
        SourceSpec::Parquet { .. } => fold_parquet(source, steps),
        _ => FoldPlan::unfolded(source, steps),
    }
}

/* ─────────────────────────────── SQL ──────────────────────────────── */

struct SqlState {
    /// Output column name → physical SELECT expression.
    exprs: Vec<(String, String)>,
    wheres: Vec<String>,
    order_by: Vec<String>,
    limit: Option<u64>,
}

impl SqlState {
    fn expr_of(&self, name: &str) -> Result<&str, FlowError> {
        self.exprs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, e)| e.as_str())
            .ok_or_else(|| unsupported(format!("column '{name}' not in projection")))
    }

    /// Filters are only folded against raw physical columns.
    fn raw_column_of(&self, name: &str) -> Result<&str, FlowError> {
        let expr = self.expr_of(name)?;
        if expr.contains('(') {
            return Err(unsupported(format!("column '{name}' is computed")));
        }
        Ok(expr)
    }
}

fn fold_sql(
    connection: &str,
    table: &str,
    columns: &[String],
    source: &SourceSpec,
    steps: &[Step],
) -> FoldPlan {
    let mut state = SqlState {
        exprs: columns.iter().map(|c| (c.clone(), c.clone())).collect(),
        wheres: Vec::new(),
        order_by: Vec::new(),
        limit: None,
    };

    let mut folded = 0usize;
    for step in steps {
        match try_fold_sql_step(&mut state, &step.operation) {
            Ok(()) => folded += 1,
            Err(e) => {
                debug!(step = step.operation.name(), reason = %e, "sql folding stopped");
                break;
            }
        }
    }
    if folded == 0 {
        return FoldPlan::unfolded(source, steps);
    }

    let projection = state
        .exprs
        .iter()
        .map(|(name, expr)| {
            if name == expr {
                quote_ident(name)
            } else {
                format!("{} AS {}", expr, quote_ident(name))
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!("SELECT {projection} FROM {}", quote_ident(table));
    if !state.wheres.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&state.wheres.join(" AND "));
    }
    if !state.order_by.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&state.order_by.join(", "));
    }
    if let Some(limit) = state.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    FoldPlan {
        source: SourceSpec::Database {
            connection: connection.to_string(),
            table: None,
            query: Some(sql.clone()),
            columns: state.exprs.iter().map(|(n, _)| n.clone()).collect(),
        },
        residual: steps[folded..].to_vec(),
        hints: LoadHints::default(),
        folded_steps: folded,
        folded_request: Some(sql),
    }
}

fn try_fold_sql_step(state: &mut SqlState, op: &Operation) -> Result<(), FlowError> {
    match op {
        Operation::SelectColumns { columns } => {
            let picked = columns
                .iter()
                .map(|c| state.expr_of(c).map(|e| (c.clone(), e.to_string())))
                .collect::<Result<Vec<_>, _>>()?;
            state.exprs = picked;
            Ok(())
        }
        Operation::RenameColumn { from, to } => {
            let expr = state.expr_of(from)?.to_string();
            if state.exprs.iter().any(|(n, _)| n == to) {
                return Err(unsupported("rename target collides"));
            }
            for (name, e) in &mut state.exprs {
                if name == from {
                    *name = to.clone();
                    *e = expr;
                    break;
                }
            }
            Ok(())
        }
        Operation::ChangeType { column, new_type } => {
            let sql_ty = sql_type(*new_type).ok_or_else(|| unsupported("type has no SQL cast"))?;
            let expr = state.expr_of(column)?.to_string();
            for (name, e) in &mut state.exprs {
                if name == column {
                    *e = format!("CAST({expr} AS {sql_ty})");
                    break;
                }
            }
            Ok(())
        }
        Operation::FilterRows { predicate } => {
            if state.limit.is_some() {
                return Err(unsupported("filter after limit"));
            }
            let clause = sql_predicate(state, predicate)?;
            state.wheres.push(clause);
            Ok(())
        }
        Operation::SortRows { sort_by } => {
            if state.limit.is_some() {
                return Err(unsupported("sort after limit"));
            }
            let mut rendered = Vec::with_capacity(sort_by.len());
            for key in sort_by {
                if key.nulls != NullsOrder::First {
                    return Err(unsupported("nulls-last has no portable SQL rendering"));
                }
                let col = state.raw_column_of(&key.column)?;
                let dir = match key.direction {
                    SortDirection::Ascending => "ASC",
                    SortDirection::Descending => "DESC",
                };
                rendered.push(format!("{} {dir}", quote_ident(col)));
            }
            // A later sort dominates; earlier keys become tie-breakers.
            rendered.extend(state.order_by.drain(..));
            state.order_by = rendered;
            Ok(())
        }
        Operation::Take { count } => {
            let n = (*count).max(0) as u64;
            state.limit = Some(state.limit.map_or(n, |l| l.min(n)));
            Ok(())
        }
        other => Err(unsupported(format!("{} is not foldable to SQL", other.name()))),
    }
}

fn sql_predicate(state: &SqlState, predicate: &FilterPredicate) -> Result<String, FlowError> {
    match predicate {
        FilterPredicate::And { predicates } => combine_sql(state, predicates, "AND"),
        FilterPredicate::Or { predicates } => combine_sql(state, predicates, "OR"),
        FilterPredicate::Not { predicate } => {
            Ok(format!("NOT ({})", sql_predicate(state, predicate)?))
        }
        FilterPredicate::Expression { .. } => Err(unsupported("expression predicate")),
        FilterPredicate::Comparison {
            column,
            op,
            value,
            case_sensitive,
        } => {
            if case_sensitive == &Some(false) {
                return Err(unsupported("case-insensitive comparison"));
            }
            let col = quote_ident(state.raw_column_of(column)?);
            match op {
                CompareOp::IsNull => return Ok(format!("{col} IS NULL")),
                CompareOp::IsNotNull => return Ok(format!("{col} IS NOT NULL")),
                _ => {}
            }
            let value = value
                .as_ref()
                .ok_or_else(|| unsupported("comparison without a value"))?;
            let rendered = sql_literal(value)?;
            let sym = match op {
                CompareOp::Equals => "=",
                CompareOp::NotEquals => "<>",
                CompareOp::GreaterThan => ">",
                CompareOp::GreaterThanOrEqual => ">=",
                CompareOp::LessThan => "<",
                CompareOp::LessThanOrEqual => "<=",
                _ => return Err(unsupported("text-match operator")),
            };
            Ok(format!("{col} {sym} {rendered}"))
        }
    }
}

fn combine_sql(
    state: &SqlState,
    predicates: &[FilterPredicate],
    joiner: &str,
) -> Result<String, FlowError> {
    let parts = predicates
        .iter()
        .map(|p| sql_predicate(state, p).map(|s| format!("({s})")))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join(&format!(" {joiner} ")))
}

fn sql_literal(value: &Value) -> Result<String, FlowError> {
    Ok(match value {
        Value::Int(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Decimal(d) => d.to_string(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Date(d) => format!("DATE '{}'", d.format("%Y-%m-%d")),
        Value::DateTime(dt) => format!("TIMESTAMP '{}'", dt.format("%Y-%m-%d %H:%M:%S")),
        _ => return Err(unsupported("literal kind not expressible in SQL")),
    })
}

fn sql_type(ty: DataType) -> Option<&'static str> {
    Some(match ty {
        DataType::Text => "VARCHAR",
        DataType::Number => "DOUBLE",
        DataType::Boolean => "BOOLEAN",
        DataType::Date => "DATE",
        DataType::DateTime => "TIMESTAMP",
        DataType::Decimal => "DECIMAL",
        _ => return None,
    })
}

fn quote_ident(name: &str) -> String {
    if name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.is_empty()
    {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/* ────────────────────────────── OData ─────────────────────────────── */

fn fold_odata(url: &str, source: &SourceSpec, steps: &[Step]) -> FoldPlan {
    let mut query = ODataQuery::default();
    let mut folded = 0usize;
    for step in steps {
        match try_fold_odata_step(&mut query, &step.operation) {
            Ok(()) => folded += 1,
            Err(e) => {
                debug!(step = step.operation.name(), reason = %e, "odata folding stopped");
                break;
            }
        }
    }
    if folded == 0 {
        return FoldPlan::unfolded(source, steps);
    }
    let composed = compose_url(url, &query);
    FoldPlan {
        source: SourceSpec::OData {
            url: composed.clone(),
        },
        residual: steps[folded..].to_vec(),
        hints: LoadHints::default(),
        folded_steps: folded,
        folded_request: Some(composed),
    }
}

fn try_fold_odata_step(query: &mut ODataQuery, op: &Operation) -> Result<(), FlowError> {
    let sliced = query.skip.is_some() || query.top.is_some();
    match op {
        Operation::SelectColumns { columns } => {
            // Column order in $select mirrors the operation's order.
            if let Some(select) = &query.select {
                if columns.iter().any(|c| !select.contains(c)) {
                    return Err(unsupported("select widens a previous $select"));
                }
            }
            query.select = Some(columns.clone());
            Ok(())
        }
        Operation::RemoveColumns { columns } => {
            // Only foldable by subtracting from an explicit $select.
            let Some(select) = &mut query.select else {
                return Err(unsupported("remove without an explicit $select"));
            };
            if columns.iter().any(|c| !select.contains(c)) {
                return Err(unsupported("removed column not in $select"));
            }
            select.retain(|c| !columns.contains(c));
            Ok(())
        }
        Operation::FilterRows { predicate } => {
            if sliced {
                return Err(unsupported("filter after $top/$skip"));
            }
            let rendered = odata_predicate(predicate)?;
            query.filter = Some(match query.filter.take() {
                None => rendered,
                Some(existing) => format!("({existing}) and ({rendered})"),
            });
            Ok(())
        }
        Operation::SortRows { sort_by } => {
            if sliced {
                return Err(unsupported("sort after $top/$skip"));
            }
            let mut rendered = Vec::with_capacity(sort_by.len());
            for key in sort_by {
                if key.nulls != NullsOrder::First {
                    return Err(unsupported("nulls policy not expressible in $orderby"));
                }
                rendered.push(match key.direction {
                    SortDirection::Ascending => key.column.clone(),
                    SortDirection::Descending => format!("{} desc", key.column),
                });
            }
            rendered.extend(query.orderby.take().unwrap_or_default());
            query.orderby = Some(rendered);
            Ok(())
        }
        Operation::Take { count } => {
            let n = (*count).max(0) as u64;
            query.top = Some(query.top.map_or(n, |t| t.min(n)));
            Ok(())
        }
        Operation::Skip { count } => {
            let n = (*count).max(0) as u64;
            query.skip = Some(query.skip.unwrap_or(0) + n);
            // Skipping eats into a previously folded $top window.
            if let Some(top) = query.top {
                query.top = Some(top.saturating_sub(n));
            }
            Ok(())
        }
        other => Err(unsupported(format!("{} is not foldable to OData", other.name()))),
    }
}

fn odata_predicate(predicate: &FilterPredicate) -> Result<String, FlowError> {
    match predicate {
        FilterPredicate::And { predicates } => combine_odata(predicates, "and"),
        FilterPredicate::Or { predicates } => combine_odata(predicates, "or"),
        FilterPredicate::Not { predicate } => Ok(format!("not ({})", odata_predicate(predicate)?)),
        FilterPredicate::Expression { .. } => Err(unsupported("expression predicate")),
        FilterPredicate::Comparison {
            column,
            op,
            value,
            case_sensitive,
        } => {
            if case_sensitive == &Some(false) {
                return Err(unsupported("case-insensitive comparison"));
            }
            match op {
                CompareOp::IsNull => return Ok(format!("{column} eq null")),
                CompareOp::IsNotNull => return Ok(format!("{column} ne null")),
                _ => {}
            }
            let value = value
                .as_ref()
                .ok_or_else(|| unsupported("comparison without a value"))?;
            let rendered = odata_literal(value)?;
            let sym = match op {
                CompareOp::Equals => "eq",
                CompareOp::NotEquals => "ne",
                CompareOp::GreaterThan => "gt",
                CompareOp::GreaterThanOrEqual => "ge",
                CompareOp::LessThan => "lt",
                CompareOp::LessThanOrEqual => "le",
                _ => return Err(unsupported("text-match operator")),
            };
            Ok(format!("{column} {sym} {rendered}"))
        }
    }
}

fn combine_odata(predicates: &[FilterPredicate], joiner: &str) -> Result<String, FlowError> {
    // A single comparison needs no parentheses.
    if predicates.len() == 1 {
        return odata_predicate(&predicates[0]);
    }
    let parts = predicates
        .iter()
        .map(|p| odata_predicate(p).map(|s| format!("({s})")))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join(&format!(" {joiner} ")))
}

fn odata_literal(value: &Value) -> Result<String, FlowError> {
    Ok(match value {
        Value::Int(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Decimal(d) => d.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Date(d) => d.format("%Y-%m-%d").to_string(),
        Value::DateTime(dt) => dt.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        _ => return Err(unsupported("literal kind not expressible in OData")),
    })
}

/* ────────────────────────────── Parquet ───────────────────────────── */

fn fold_parquet(source: &SourceSpec, steps: &[Step]) -> FoldPlan {
    let hints = LoadHints {
        parquet_projection: compute_parquet_projection_columns(steps),
        parquet_row_limit: compute_parquet_row_limit(steps),
    };
    // The reader hints narrow the scan; every step still runs.
    FoldPlan {
        source: source.clone(),
        residual: steps.to_vec(),
        hints,
        folded_steps: 0,
        folded_request: None,
    }
}

/// Physical columns the reader must produce, only when the pipeline
/// contains an explicit projection (selectColumns or groupBy); `None`
/// reads everything.
pub fn compute_parquet_projection_columns(steps: &[Step]) -> Option<Vec<String>> {
    let mut referenced: Vec<String> = Vec::new();
    let mut note = |name: &str| {
        if !referenced.iter().any(|n| n == name) {
            referenced.push(name.to_string());
        }
    };
    for step in steps {
        match &step.operation {
            Operation::SelectColumns { columns } => {
                for c in columns {
                    note(c);
                }
                return Some(referenced);
            }
            Operation::GroupBy { keys, aggregations } => {
                for k in keys {
                    note(k);
                }
                for a in aggregations {
                    note(&a.column);
                }
                return Some(referenced);
            }
            Operation::FilterRows { predicate } => {
                if !note_predicate_columns(predicate, &mut note) {
                    return None;
                }
            }
            Operation::SortRows { sort_by } => {
                for key in sort_by {
                    note(&key.column);
                }
            }
            Operation::Take { .. } | Operation::Skip { .. } => {}
            Operation::DistinctRows { columns: Some(cols) } => {
                for c in cols {
                    note(c);
                }
            }
            // Anything that could touch arbitrary columns ends the scan.
            _ => return None,
        }
    }
    None
}

fn note_predicate_columns(predicate: &FilterPredicate, note: &mut impl FnMut(&str)) -> bool {
    match predicate {
        FilterPredicate::Comparison { column, .. } => {
            note(column);
            true
        }
        FilterPredicate::And { predicates } | FilterPredicate::Or { predicates } => predicates
            .iter()
            .all(|p| note_predicate_columns(p, note)),
        FilterPredicate::Not { predicate } => note_predicate_columns(predicate, note),
        FilterPredicate::Expression { .. } => false,
    }
}

/// A safe scan row limit, only when no row-reordering or row-dropping
/// operation precedes the `take`.
pub fn compute_parquet_row_limit(steps: &[Step]) -> Option<usize> {
    let mut skipped: usize = 0;
    for step in steps {
        match &step.operation {
            Operation::Take { count } => {
                return Some(skipped + (*count).max(0) as usize);
            }
            Operation::Skip { count } => {
                skipped += (*count).max(0) as usize;
            }
            // Row-wise shaping keeps row identity and order.
            Operation::SelectColumns { .. }
            | Operation::RemoveColumns { .. }
            | Operation::RenameColumn { .. }
            | Operation::ChangeType { .. }
            | Operation::AddColumn { .. }
            | Operation::TransformColumns { .. }
            | Operation::CombineColumns { .. }
            | Operation::SplitColumn { .. }
            | Operation::AddIndexColumn { .. }
            | Operation::TransformColumnNames { .. }
            | Operation::ReplaceValues { .. }
            | Operation::FillDown { .. } => {}
            _ => return None,
        }
    }
    None
}
