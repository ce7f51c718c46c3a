//! Compiler from the M-script subset to the query IR.
//!
//! Handles `let … in step`, step bindings (bare or `#"quoted"` names),
//! record and list literals, `each` lambdas, `if/then/else`, constant
//! references (`JoinKind.*`, `Order.*`, `Comparer.*`, `QuoteStyle.*`,
//! `Occurrence.*`, and their numeric forms), and the `Table.*` /
//! `Range.FromValues` surface. Each `let` binding becomes one step;
//! bindings whose surface call carries several column pairs (renames,
//! type changes) expand to one step per pair.

use sheetflow_common::{DataType, Value};

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::parser::{Parser, ParserError};
use crate::query::{
    AggregateOp, Aggregation, ColumnTransform, CompareOp, FilterPredicate, JoinAlgorithm,
    JoinMode, JoinType, KeyComparer, NameTransform, Operation, Query, SortDirection, SortKey,
    SourceSpec, Step,
};
use crate::tokenizer::tokenize;

/// Compile an M script into a query with the given id and display name.
pub fn compile_script(id: &str, name: &str, src: &str) -> Result<Query, ParserError> {
    let tokens = tokenize(src)?;
    let mut p = Parser::new(tokens);

    p.expect_keyword("let")?;
    let mut bindings: Vec<(String, Expr)> = Vec::new();
    loop {
        let step_name = p.expect_ident()?;
        p.expect_punct("=")?;
        let expr = p.parse_expr()?;
        bindings.push((step_name, expr));
        if !p.eat_punct(",") {
            break;
        }
    }
    p.expect_keyword("in")?;
    let result = p.expect_ident()?;
    if !p.at_end() {
        return Err(ParserError::new("trailing input after 'in' result", None));
    }
    if bindings.last().map(|(n, _)| n.as_str()) != Some(result.as_str()) {
        return Err(ParserError::new(
            format!("'in {result}' must name the final step"),
            None,
        ));
    }

    let mut bindings = bindings.into_iter();
    let (first_name, first_expr) = bindings
        .next()
        .ok_or_else(|| ParserError::new("script has no steps", None))?;
    let source = lower_source(&first_expr)?;

    let mut query = Query::new(id, name, source);
    let mut prev = first_name;
    for (step_name, expr) in bindings {
        let ops = lower_operation(&expr, &prev)?;
        let multi = ops.len() > 1;
        for (i, operation) in ops.into_iter().enumerate() {
            let label = if multi {
                format!("{step_name}.{}", i + 1)
            } else {
                step_name.clone()
            };
            query.steps.push(Step {
                name: Some(label),
                operation,
            });
        }
        prev = step_name;
    }
    Ok(query)
}

/* ───────────────────────────── helpers ────────────────────────────── */

fn err(msg: impl Into<String>) -> ParserError {
    ParserError::new(msg, None)
}

fn expect_str(e: &Expr, what: &str) -> Result<String, ParserError> {
    e.as_str()
        .map(str::to_string)
        .ok_or_else(|| err(format!("expected a string for {what}")))
}

fn expect_str_list(e: &Expr, what: &str) -> Result<Vec<String>, ParserError> {
    match e {
        Expr::List(items) => items.iter().map(|i| expect_str(i, what)).collect(),
        // A lone string is accepted where a singleton list is meant.
        Expr::Literal(Value::Text(s)) => Ok(vec![s.clone()]),
        _ => Err(err(format!("expected a list of strings for {what}"))),
    }
}

fn expect_int(e: &Expr, what: &str) -> Result<i64, ParserError> {
    match e {
        Expr::Literal(Value::Int(i)) => Ok(*i),
        Expr::Literal(Value::Number(n)) if n.fract() == 0.0 => Ok(*n as i64),
        _ => Err(err(format!("expected an integer for {what}"))),
    }
}

fn expect_each(e: &Expr, what: &str) -> Result<Expr, ParserError> {
    match e {
        Expr::Each(body) => Ok(fold_intrinsics((**body).clone())),
        _ => Err(err(format!("expected an 'each' lambda for {what}"))),
    }
}

fn literal_value(e: &Expr, what: &str) -> Result<Value, ParserError> {
    match fold_intrinsics(e.clone()) {
        Expr::Literal(v) => Ok(v),
        Expr::Unary {
            op: UnaryOp::Neg,
            expr,
        } => match *expr {
            Expr::Literal(Value::Int(i)) => Ok(Value::Int(-i)),
            Expr::Literal(Value::Number(n)) => Ok(Value::Number(-n)),
            _ => Err(err(format!("expected a literal for {what}"))),
        },
        _ => Err(err(format!("expected a literal for {what}"))),
    }
}

/// Fold `#date`/`#datetime`/`#time`/`#duration` calls with literal
/// arguments into value literals.
pub fn fold_intrinsics(e: Expr) -> Expr {
    match e {
        Expr::Call { name, args } => {
            let args: Vec<Expr> = args.into_iter().map(fold_intrinsics).collect();
            let ints: Option<Vec<i64>> = args
                .iter()
                .map(|a| match a {
                    Expr::Literal(Value::Int(i)) => Some(*i),
                    _ => None,
                })
                .collect();
            if let Some(ints) = ints {
                match (name.as_str(), ints.as_slice()) {
                    ("#date", [y, m, d]) => {
                        if let Some(date) =
                            chrono::NaiveDate::from_ymd_opt(*y as i32, *m as u32, *d as u32)
                        {
                            return Expr::Literal(Value::Date(date));
                        }
                    }
                    ("#datetime", [y, m, d, h, mi, s]) => {
                        if let Some(dt) =
                            chrono::NaiveDate::from_ymd_opt(*y as i32, *m as u32, *d as u32)
                                .and_then(|d0| d0.and_hms_opt(*h as u32, *mi as u32, *s as u32))
                        {
                            return Expr::Literal(Value::DateTime(dt));
                        }
                    }
                    ("#time", [h, mi, s]) => {
                        if let Some(t) =
                            chrono::NaiveTime::from_hms_opt(*h as u32, *mi as u32, *s as u32)
                        {
                            return Expr::Literal(Value::Time(t));
                        }
                    }
                    ("#duration", [d, h, mi, s]) => {
                        let dur = chrono::Duration::days(*d)
                            + chrono::Duration::hours(*h)
                            + chrono::Duration::minutes(*mi)
                            + chrono::Duration::seconds(*s);
                        return Expr::Literal(Value::Duration(dur));
                    }
                    _ => {}
                }
            }
            Expr::Call { name, args }
        }
        Expr::Unary { op, expr } => Expr::Unary {
            op,
            expr: Box::new(fold_intrinsics(*expr)),
        },
        Expr::Binary { op, left, right } => Expr::Binary {
            op,
            left: Box::new(fold_intrinsics(*left)),
            right: Box::new(fold_intrinsics(*right)),
        },
        Expr::If {
            cond,
            then,
            otherwise,
        } => Expr::If {
            cond: Box::new(fold_intrinsics(*cond)),
            then: Box::new(fold_intrinsics(*then)),
            otherwise: Box::new(fold_intrinsics(*otherwise)),
        },
        Expr::Each(body) => Expr::Each(Box::new(fold_intrinsics(*body))),
        Expr::List(items) => Expr::List(items.into_iter().map(fold_intrinsics).collect()),
        Expr::RecordLit(fields) => Expr::RecordLit(
            fields
                .into_iter()
                .map(|(k, v)| (k, fold_intrinsics(v)))
                .collect(),
        ),
        other => other,
    }
}

fn record_field<'a>(fields: &'a [(String, Expr)], key: &str) -> Option<&'a Expr> {
    fields
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

fn record_bool(e: Option<&Expr>, key: &str, default: bool) -> Result<bool, ParserError> {
    let Some(Expr::RecordLit(fields)) = e else {
        return Ok(default);
    };
    match record_field(fields, key) {
        None => Ok(default),
        Some(Expr::Literal(Value::Bool(b))) => Ok(*b),
        Some(_) => Err(err(format!("option {key} must be true or false"))),
    }
}

/* ─────────────────────────── constants ────────────────────────────── */

fn join_type_of(e: &Expr) -> Result<JoinType, ParserError> {
    match e {
        Expr::Ident(name) => match name.as_str() {
            "JoinKind.Inner" => Ok(JoinType::Inner),
            "JoinKind.LeftOuter" => Ok(JoinType::Left),
            "JoinKind.RightOuter" => Ok(JoinType::Right),
            "JoinKind.FullOuter" => Ok(JoinType::Full),
            other => Err(err(format!("unknown join kind '{other}'"))),
        },
        Expr::Literal(Value::Int(n)) => match n {
            0 => Ok(JoinType::Inner),
            1 => Ok(JoinType::Left),
            2 => Ok(JoinType::Right),
            3 => Ok(JoinType::Full),
            other => Err(err(format!("unknown numeric join kind {other}"))),
        },
        _ => Err(err("expected a JoinKind constant")),
    }
}

fn sort_direction_of(e: &Expr) -> Result<SortDirection, ParserError> {
    match e {
        Expr::Ident(name) => match name.as_str() {
            "Order.Ascending" => Ok(SortDirection::Ascending),
            "Order.Descending" => Ok(SortDirection::Descending),
            other => Err(err(format!("unknown sort order '{other}'"))),
        },
        Expr::Literal(Value::Int(0)) => Ok(SortDirection::Ascending),
        Expr::Literal(Value::Int(1)) => Ok(SortDirection::Descending),
        _ => Err(err("expected an Order constant")),
    }
}

fn aggregate_op_of(e: &Expr) -> Result<AggregateOp, ParserError> {
    let name = match e {
        Expr::Ident(name) => name.as_str(),
        Expr::Literal(Value::Text(s)) => s.as_str(),
        _ => return Err(err("expected an aggregation function")),
    };
    match name {
        "List.Sum" | "sum" => Ok(AggregateOp::Sum),
        "List.Count" | "count" => Ok(AggregateOp::Count),
        "List.Average" | "average" => Ok(AggregateOp::Average),
        "List.Min" | "min" => Ok(AggregateOp::Min),
        "List.Max" | "max" => Ok(AggregateOp::Max),
        "List.CountDistinct" | "countDistinct" => Ok(AggregateOp::CountDistinct),
        other => Err(err(format!("unknown aggregation '{other}'"))),
    }
}

fn data_type_of(e: &Expr) -> Result<DataType, ParserError> {
    match e {
        Expr::Ident(name) => {
            let short = name
                .strip_prefix("type ")
                .or_else(|| name.strip_suffix(".Type").map(|_| ""))
                .unwrap_or(name);
            let mapped = match short {
                "" => Some(match name.as_str() {
                    "Int64.Type" | "Int32.Type" | "Number.Type" | "Percentage.Type" => {
                        DataType::Number
                    }
                    "Currency.Type" | "Decimal.Type" => DataType::Decimal,
                    _ => return Err(err(format!("unknown type '{name}'"))),
                }),
                other => DataType::parse(other),
            };
            mapped.ok_or_else(|| err(format!("unknown type '{name}'")))
        }
        _ => Err(err("expected a type reference")),
    }
}

fn key_comparer_of(e: &Expr) -> Result<KeyComparer, ParserError> {
    match e {
        Expr::Ident(name) => match name.as_str() {
            "Comparer.Ordinal" => Ok(KeyComparer::Exact),
            "Comparer.OrdinalIgnoreCase" => Ok(KeyComparer::CaseInsensitive),
            other => Err(err(format!("unknown comparer '{other}'"))),
        },
        _ => Err(err("expected a Comparer constant")),
    }
}

fn name_transform_of(e: &Expr) -> Result<NameTransform, ParserError> {
    match e {
        Expr::Ident(name) => match name.as_str() {
            "Text.Upper" => Ok(NameTransform::Uppercase),
            "Text.Lower" => Ok(NameTransform::Lowercase),
            "Text.Trim" => Ok(NameTransform::Trim),
            "Text.Proper" => Ok(NameTransform::Capitalize),
            other => Err(err(format!("unknown name transform '{other}'"))),
        },
        _ => Err(err("expected a Text.* transform reference")),
    }
}

/// A separator may be a plain string or a `Combiner.CombineTextByDelimiter`
/// / `Splitter.SplitTextByDelimiter` call whose first arg is the string.
fn delimiter_of(e: &Expr) -> Result<String, ParserError> {
    match e {
        Expr::Literal(Value::Text(s)) => Ok(s.clone()),
        Expr::Call { name, args }
            if name == "Splitter.SplitTextByDelimiter"
                || name == "Combiner.CombineTextByDelimiter" =>
        {
            // A trailing QuoteStyle.* argument is accepted and ignored.
            args.first()
                .ok_or_else(|| err("delimiter call needs an argument"))
                .and_then(|a| expect_str(a, "delimiter"))
        }
        _ => Err(err("expected a delimiter")),
    }
}

fn query_ref_of(e: &Expr) -> Result<String, ParserError> {
    match e {
        Expr::Call { name, args } if name == "Query.Reference" => {
            expect_str(args.first().ok_or_else(|| err("Query.Reference needs an id"))?, "query id")
        }
        Expr::Ident(name) => Ok(name.clone()),
        _ => Err(err("expected a query reference")),
    }
}

/* ───────────────────────────── sources ────────────────────────────── */

fn lower_source(e: &Expr) -> Result<SourceSpec, ParserError> {
    let folded = fold_intrinsics(e.clone());
    let Expr::Call { name, args } = &folded else {
        if let Ok(id) = query_ref_of(&folded) {
            return Ok(SourceSpec::QueryRef { id });
        }
        return Err(err("first step must construct a source"));
    };
    match name.as_str() {
        "Range.FromValues" => {
            let grid = args.first().ok_or_else(|| err("Range.FromValues needs a grid"))?;
            let Expr::List(rows) = grid else {
                return Err(err("Range.FromValues expects a list of rows"));
            };
            let mut values = Vec::with_capacity(rows.len());
            for row in rows {
                let Expr::List(cells) = row else {
                    return Err(err("Range.FromValues rows must be lists"));
                };
                let mut out = Vec::with_capacity(cells.len());
                for cell in cells {
                    out.push(literal_value(cell, "range cell")?);
                }
                values.push(out);
            }
            let has_headers = record_bool(args.get(1), "HasHeaders", false)?;
            Ok(SourceSpec::Range { values, has_headers })
        }
        "Table.FromName" => Ok(SourceSpec::Table {
            name: expect_str(args.first().ok_or_else(|| err("Table.FromName needs a name"))?, "table name")?,
            version: None,
        }),
        "Csv.Document" => Ok(SourceSpec::Csv {
            path: expect_str(args.first().ok_or_else(|| err("Csv.Document needs a path"))?, "path")?,
            has_headers: record_bool(args.get(1), "HasHeaders", true)?,
        }),
        "Json.Document" => Ok(SourceSpec::Json {
            path: expect_str(args.first().ok_or_else(|| err("Json.Document needs a path"))?, "path")?,
        }),
        "Sql.Query" => Ok(SourceSpec::Database {
            connection: expect_str(args.first().ok_or_else(|| err("Sql.Query needs a connection"))?, "connection")?,
            table: None,
            query: Some(expect_str(args.get(1).ok_or_else(|| err("Sql.Query needs a query"))?, "sql")?),
            columns: Vec::new(),
        }),
        "Sql.Table" => Ok(SourceSpec::Database {
            connection: expect_str(args.first().ok_or_else(|| err("Sql.Table needs a connection"))?, "connection")?,
            table: Some(expect_str(args.get(1).ok_or_else(|| err("Sql.Table needs a table"))?, "table")?),
            query: None,
            columns: args
                .get(2)
                .map(|a| expect_str_list(a, "columns"))
                .transpose()?
                .unwrap_or_default(),
        }),
        "OData.Feed" => Ok(SourceSpec::OData {
            url: expect_str(args.first().ok_or_else(|| err("OData.Feed needs a url"))?, "url")?,
        }),
        "Parquet.Document" => Ok(SourceSpec::Parquet {
            path: expect_str(args.first().ok_or_else(|| err("Parquet.Document needs a path"))?, "path")?,
        }),
        "Folder.Files" => Ok(SourceSpec::Folder {
            path: expect_str(args.first().ok_or_else(|| err("Folder.Files needs a path"))?, "path")?,
            recursive: record_bool(args.get(1), "Recursive", false)?,
        }),
        "Web.FetchTable" => Ok(SourceSpec::Api {
            url: expect_str(args.first().ok_or_else(|| err("Web.FetchTable needs a url"))?, "url")?,
            method: None,
            headers: Vec::new(),
        }),
        "Query.Reference" => Ok(SourceSpec::QueryRef {
            id: expect_str(args.first().ok_or_else(|| err("Query.Reference needs an id"))?, "query id")?,
        }),
        other => Err(err(format!("unknown source constructor '{other}'"))),
    }
}

/* ──────────────────────────── operations ──────────────────────────── */

fn expect_prev(args: &[Expr], prev: &str, func: &str) -> Result<(), ParserError> {
    match args.first() {
        Some(Expr::Ident(name)) if name == prev => Ok(()),
        Some(Expr::Ident(name)) => Err(err(format!(
            "{func} must consume the preceding step '{prev}', found '{name}'"
        ))),
        _ => Err(err(format!("{func} must reference the preceding step"))),
    }
}

fn lower_operation(e: &Expr, prev: &str) -> Result<Vec<Operation>, ParserError> {
    let folded = fold_intrinsics(e.clone());
    let Expr::Call { name, args } = &folded else {
        return Err(err("each step must be a Table.* call"));
    };

    // Table.Combine takes its inputs as a list rather than a leading ref.
    if name == "Table.Combine" {
        let Some(Expr::List(items)) = args.first() else {
            return Err(err("Table.Combine expects a list of tables"));
        };
        let mut it = items.iter();
        match it.next() {
            Some(Expr::Ident(n)) if n == prev => {}
            _ => return Err(err("Table.Combine must start with the preceding step")),
        }
        let queries = it.map(query_ref_of).collect::<Result<Vec<_>, _>>()?;
        return Ok(vec![Operation::Append { queries }]);
    }

    expect_prev(args, prev, name)?;
    let rest = &args[1..];

    let single = |op: Operation| Ok(vec![op]);
    match name.as_str() {
        "Table.SelectColumns" => single(Operation::SelectColumns {
            columns: expect_str_list(arg(rest, 0, name)?, "columns")?,
        }),
        "Table.RemoveColumns" => single(Operation::RemoveColumns {
            columns: expect_str_list(arg(rest, 0, name)?, "columns")?,
        }),
        "Table.SelectRows" => {
            let body = expect_each(arg(rest, 0, name)?, "row predicate")?;
            single(Operation::FilterRows {
                predicate: lower_predicate(&body),
            })
        }
        "Table.Sort" => {
            let Expr::List(specs) = arg(rest, 0, name)? else {
                return Err(err("Table.Sort expects a list of sort specs"));
            };
            let mut sort_by = Vec::with_capacity(specs.len());
            for spec in specs {
                match spec {
                    Expr::Literal(Value::Text(col)) => sort_by.push(SortKey::asc(col.clone())),
                    Expr::List(pair) if pair.len() == 2 => {
                        let column = expect_str(&pair[0], "sort column")?;
                        let direction = sort_direction_of(&pair[1])?;
                        sort_by.push(SortKey {
                            column,
                            direction,
                            nulls: Default::default(),
                        });
                    }
                    _ => return Err(err("bad sort spec")),
                }
            }
            single(Operation::SortRows { sort_by })
        }
        "Table.Group" => {
            let keys = expect_str_list(arg(rest, 0, name)?, "group keys")?;
            let Expr::List(specs) = arg(rest, 1, name)? else {
                return Err(err("Table.Group expects a list of aggregations"));
            };
            let mut aggregations = Vec::with_capacity(specs.len());
            for spec in specs {
                let Expr::List(triple) = spec else {
                    return Err(err("aggregation spec must be {name, op, column}"));
                };
                if triple.len() != 3 {
                    return Err(err("aggregation spec must be {name, op, column}"));
                }
                let rename = expect_str(&triple[0], "aggregation name")?;
                let op = aggregate_op_of(&triple[1])?;
                let column = expect_str(&triple[2], "aggregation column")?;
                aggregations.push(Aggregation {
                    column,
                    op,
                    rename: Some(rename),
                });
            }
            single(Operation::GroupBy { keys, aggregations })
        }
        "Table.AddColumn" => {
            let col = expect_str(arg(rest, 0, name)?, "column name")?;
            let formula = expect_each(arg(rest, 1, name)?, "column formula")?;
            single(Operation::AddColumn { name: col, formula })
        }
        "Table.TransformColumns" => {
            let Expr::List(specs) = arg(rest, 0, name)? else {
                return Err(err("Table.TransformColumns expects a list"));
            };
            let mut transforms = Vec::with_capacity(specs.len());
            for spec in specs {
                let Expr::List(parts) = spec else {
                    return Err(err("transform spec must be {column, each expr [, type]}"));
                };
                if parts.len() < 2 || parts.len() > 3 {
                    return Err(err("transform spec must be {column, each expr [, type]}"));
                }
                transforms.push(ColumnTransform {
                    column: expect_str(&parts[0], "transform column")?,
                    formula: expect_each(&parts[1], "transform formula")?,
                    new_type: parts.get(2).map(data_type_of).transpose()?,
                });
            }
            single(Operation::TransformColumns { transforms })
        }
        "Table.RenameColumns" => {
            let pairs = column_pairs(arg(rest, 0, name)?)?;
            Ok(pairs
                .into_iter()
                .map(|(from, to)| Operation::RenameColumn { from, to })
                .collect())
        }
        "Table.TransformColumnTypes" => {
            let Expr::List(specs) = arg(rest, 0, name)? else {
                return Err(err("Table.TransformColumnTypes expects a list"));
            };
            let mut ops = Vec::with_capacity(specs.len());
            for spec in specs {
                let Expr::List(pair) = spec else {
                    return Err(err("type spec must be {column, type}"));
                };
                if pair.len() != 2 {
                    return Err(err("type spec must be {column, type}"));
                }
                ops.push(Operation::ChangeType {
                    column: expect_str(&pair[0], "column")?,
                    new_type: data_type_of(&pair[1])?,
                });
            }
            Ok(ops)
        }
        "Table.FirstN" => single(Operation::Take {
            count: expect_int(arg(rest, 0, name)?, "count")?,
        }),
        "Table.Skip" => single(Operation::Skip {
            count: expect_int(arg(rest, 0, name)?, "count")?,
        }),
        "Table.Distinct" => single(Operation::DistinctRows {
            columns: rest
                .first()
                .map(|a| expect_str_list(a, "columns"))
                .transpose()?,
        }),
        "Table.Pivot" => single(Operation::Pivot {
            column: expect_str(arg(rest, 0, name)?, "pivot column")?,
            value_column: expect_str(arg(rest, 1, name)?, "value column")?,
            aggregation: rest
                .get(2)
                .map(aggregate_op_of)
                .transpose()?
                .unwrap_or(AggregateOp::Sum),
        }),
        "Table.Unpivot" => single(Operation::Unpivot {
            columns: expect_str_list(arg(rest, 0, name)?, "columns")?,
            name_column: expect_str(arg(rest, 1, name)?, "name column")?,
            value_column: expect_str(arg(rest, 2, name)?, "value column")?,
        }),
        "Table.Join" => {
            let left_keys = expect_str_list(arg(rest, 0, name)?, "left keys")?;
            let right_query = query_ref_of(arg(rest, 1, name)?)?;
            let right_keys = expect_str_list(arg(rest, 2, name)?, "right keys")?;
            let join_type = rest.get(3).map(join_type_of).transpose()?.unwrap_or_default();
            // One Comparer constant applies to every key pair.
            let comparers = rest
                .get(4)
                .map(key_comparer_of)
                .transpose()?
                .map(|c| vec![c; left_keys.len()]);
            single(Operation::Merge {
                left_keys,
                right_query,
                right_keys,
                join_type,
                join_mode: JoinMode::Flat,
                new_column_name: None,
                comparers,
                join_algorithm: JoinAlgorithm::Dynamic,
            })
        }
        "Table.NestedJoin" | "Table.AddJoinColumn" => {
            let left_keys = expect_str_list(arg(rest, 0, name)?, "left keys")?;
            let right_query = query_ref_of(arg(rest, 1, name)?)?;
            let right_keys = expect_str_list(arg(rest, 2, name)?, "right keys")?;
            let new_column_name = Some(expect_str(arg(rest, 3, name)?, "new column")?);
            let join_type = rest.get(4).map(join_type_of).transpose()?.unwrap_or(JoinType::Left);
            single(Operation::Merge {
                left_keys,
                right_query,
                right_keys,
                join_type,
                join_mode: JoinMode::Nested,
                new_column_name,
                comparers: None,
                join_algorithm: JoinAlgorithm::Dynamic,
            })
        }
        "Table.ExpandTableColumn" => single(Operation::ExpandTableColumn {
            column: expect_str(arg(rest, 0, name)?, "column")?,
            columns: expect_str_list(arg(rest, 1, name)?, "expand columns")?,
        }),
        "Table.FillDown" => single(Operation::FillDown {
            columns: expect_str_list(arg(rest, 0, name)?, "columns")?,
        }),
        "Table.ReplaceValue" => {
            let find = literal_value(arg(rest, 0, name)?, "find value")?;
            let replace = literal_value(arg(rest, 1, name)?, "replacement")?;
            // rest[2] is the Replacer.* constant; accepted and ignored.
            let columns = expect_str_list(arg(rest, 3, name)?, "columns")?;
            Ok(columns
                .into_iter()
                .map(|column| Operation::ReplaceValues {
                    column,
                    find: find.clone(),
                    replace: replace.clone(),
                })
                .collect())
        }
        "Table.SplitColumn" => {
            let column = expect_str(arg(rest, 0, name)?, "column")?;
            let delimiter = delimiter_of(arg(rest, 1, name)?)?;
            let (count, names) = match rest.get(2) {
                None => (None, None),
                Some(Expr::List(_)) => (
                    None,
                    Some(expect_str_list(&rest[2], "split names")?),
                ),
                Some(other) => (Some(expect_int(other, "split count")? as usize), None),
            };
            single(Operation::SplitColumn {
                column,
                delimiter,
                count,
                names,
            })
        }
        "Table.CombineColumns" => single(Operation::CombineColumns {
            columns: expect_str_list(arg(rest, 0, name)?, "columns")?,
            separator: delimiter_of(arg(rest, 1, name)?)?,
            new_name: expect_str(arg(rest, 2, name)?, "new column")?,
        }),
        "Table.AddIndexColumn" => single(Operation::AddIndexColumn {
            name: expect_str(arg(rest, 0, name)?, "index column")?,
            start: rest.get(1).map(|a| expect_int(a, "start")).transpose()?.unwrap_or(0),
            increment: rest
                .get(2)
                .map(|a| expect_int(a, "increment"))
                .transpose()?
                .unwrap_or(1),
        }),
        "Table.PromoteHeaders" => single(Operation::PromoteHeaders),
        "Table.DemoteHeaders" => single(Operation::DemoteHeaders),
        "Table.TransformColumnNames" => single(Operation::TransformColumnNames {
            transform: name_transform_of(arg(rest, 0, name)?)?,
        }),
        other => Err(err(format!("unknown table function '{other}'"))),
    }
}

fn arg<'a>(args: &'a [Expr], i: usize, func: &str) -> Result<&'a Expr, ParserError> {
    args.get(i)
        .ok_or_else(|| err(format!("{func} is missing argument {}", i + 2)))
}

fn column_pairs(e: &Expr) -> Result<Vec<(String, String)>, ParserError> {
    let Expr::List(items) = e else {
        return Err(err("expected a list of {old, new} pairs"));
    };
    // Accept both a single pair and a list of pairs.
    if items.len() == 2 && items.iter().all(|i| i.as_str().is_some()) {
        return Ok(vec![(
            expect_str(&items[0], "old name")?,
            expect_str(&items[1], "new name")?,
        )]);
    }
    items
        .iter()
        .map(|item| {
            let Expr::List(pair) = item else {
                return Err(err("expected a {old, new} pair"));
            };
            if pair.len() != 2 {
                return Err(err("expected a {old, new} pair"));
            }
            Ok((
                expect_str(&pair[0], "old name")?,
                expect_str(&pair[1], "new name")?,
            ))
        })
        .collect()
}

/* ─────────────────────── predicate lowering ───────────────────────── */

/// Lower an `each` body into the structured predicate tree when its
/// shape allows, falling back to an opaque expression predicate.
/// Only structured comparisons participate in source folding.
pub fn lower_predicate(e: &Expr) -> FilterPredicate {
    match e {
        Expr::Binary { op, left, right } if *op == BinaryOp::And => FilterPredicate::And {
            predicates: vec![lower_predicate(left), lower_predicate(right)],
        },
        Expr::Binary { op, left, right } if *op == BinaryOp::Or => FilterPredicate::Or {
            predicates: vec![lower_predicate(left), lower_predicate(right)],
        },
        Expr::Unary {
            op: UnaryOp::Not,
            expr,
        } => FilterPredicate::Not {
            predicate: Box::new(lower_predicate(expr)),
        },
        Expr::Binary { op, left, right } if op.is_comparison() => {
            comparison_predicate(*op, left, right)
                .unwrap_or_else(|| FilterPredicate::Expression { expr: e.clone() })
        }
        Expr::Call { name, args } if args.len() == 2 => {
            let text_op = match name.as_str() {
                "Text.Contains" => Some(CompareOp::Contains),
                "Text.StartsWith" => Some(CompareOp::StartsWith),
                "Text.EndsWith" => Some(CompareOp::EndsWith),
                _ => None,
            };
            match (text_op, &args[0], &args[1]) {
                (Some(op), Expr::Column(column), Expr::Literal(v)) => {
                    FilterPredicate::Comparison {
                        column: column.clone(),
                        op,
                        value: Some(v.clone()),
                        case_sensitive: None,
                    }
                }
                _ => FilterPredicate::Expression { expr: e.clone() },
            }
        }
        _ => FilterPredicate::Expression { expr: e.clone() },
    }
}

fn comparison_predicate(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
) -> Option<FilterPredicate> {
    let (column, value, op) = match (left, right) {
        (Expr::Column(c), Expr::Literal(v)) => (c.clone(), v.clone(), op),
        // Column on the right: flip the relational direction.
        (Expr::Literal(v), Expr::Column(c)) => (c.clone(), v.clone(), flip(op)),
        _ => return None,
    };
    let cmp = match (op, &value) {
        (BinaryOp::Eq, Value::Null) => {
            return Some(FilterPredicate::Comparison {
                column,
                op: CompareOp::IsNull,
                value: None,
                case_sensitive: None,
            });
        }
        (BinaryOp::Ne, Value::Null) => {
            return Some(FilterPredicate::Comparison {
                column,
                op: CompareOp::IsNotNull,
                value: None,
                case_sensitive: None,
            });
        }
        (BinaryOp::Eq, _) => CompareOp::Equals,
        (BinaryOp::Ne, _) => CompareOp::NotEquals,
        (BinaryOp::Lt, _) => CompareOp::LessThan,
        (BinaryOp::Le, _) => CompareOp::LessThanOrEqual,
        (BinaryOp::Gt, _) => CompareOp::GreaterThan,
        (BinaryOp::Ge, _) => CompareOp::GreaterThanOrEqual,
        _ => return None,
    };
    Some(FilterPredicate::Comparison {
        column,
        op: cmp,
        value: Some(value),
        case_sensitive: None,
    })
}

fn flip(op: BinaryOp) -> BinaryOp {
    match op {
        BinaryOp::Lt => BinaryOp::Gt,
        BinaryOp::Le => BinaryOp::Ge,
        BinaryOp::Gt => BinaryOp::Lt,
        BinaryOp::Ge => BinaryOp::Le,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_filter_group_sort_pipeline() {
        let src = r#"
            let
                Source = Range.FromValues({{"Region", "Sales"}, {"East", 100}, {"West", 200}}, [HasHeaders = true]),
                Filtered = Table.SelectRows(Source, each [Region] = "East" and [Sales] >= 50),
                Grouped = Table.Group(Filtered, {"Region"}, {{"Total Sales", List.Sum, "Sales"}}),
                Sorted = Table.Sort(Grouped, {{"Total Sales", Order.Descending}})
            in
                Sorted
        "#;
        let q = compile_script("q1", "sales", src).unwrap();
        assert!(matches!(q.source, SourceSpec::Range { ref values, has_headers: true } if values.len() == 3));
        assert_eq!(q.steps.len(), 3);
        match &q.steps[0].operation {
            Operation::FilterRows {
                predicate: FilterPredicate::And { predicates },
            } => assert_eq!(predicates.len(), 2),
            other => panic!("expected filterRows, got {other:?}"),
        }
        match &q.steps[2].operation {
            Operation::SortRows { sort_by } => {
                assert_eq!(sort_by[0].direction, SortDirection::Descending);
            }
            other => panic!("expected sortRows, got {other:?}"),
        }
    }

    #[test]
    fn nested_join_maps_to_nested_merge() {
        let src = r#"
            let
                Source = Table.FromName("Orders"),
                Joined = Table.NestedJoin(Source, {"Id"}, Query.Reference("customers"), {"Id"}, "Customer", JoinKind.LeftOuter)
            in
                Joined
        "#;
        let q = compile_script("q", "orders", src).unwrap();
        match &q.steps[0].operation {
            Operation::Merge {
                join_mode,
                join_type,
                right_query,
                new_column_name,
                ..
            } => {
                assert_eq!(*join_mode, JoinMode::Nested);
                assert_eq!(*join_type, JoinType::Left);
                assert_eq!(right_query, "customers");
                assert_eq!(new_column_name.as_deref(), Some("Customer"));
            }
            other => panic!("expected merge, got {other:?}"),
        }
    }

    #[test]
    fn combine_maps_to_append() {
        let src = r#"
            let
                Source = Table.FromName("T1"),
                All = Table.Combine({Source, Query.Reference("q2"), Query.Reference("q3")})
            in
                All
        "#;
        let q = compile_script("q", "all", src).unwrap();
        assert_eq!(
            q.steps[0].operation,
            Operation::Append {
                queries: vec!["q2".into(), "q3".into()]
            }
        );
    }

    #[test]
    fn rename_pairs_expand_to_steps() {
        let src = r#"
            let
                Source = Table.FromName("T"),
                Renamed = Table.RenameColumns(Source, {{"a", "x"}, {"b", "y"}})
            in
                Renamed
        "#;
        let q = compile_script("q", "t", src).unwrap();
        assert_eq!(q.steps.len(), 2);
        assert_eq!(q.steps[0].name.as_deref(), Some("Renamed.1"));
    }

    #[test]
    fn date_literals_fold_in_predicates() {
        let src = r#"
            let
                Source = Table.FromName("T"),
                Filtered = Table.SelectRows(Source, each [When] >= #date(2024, 1, 2))
            in
                Filtered
        "#;
        let q = compile_script("q", "t", src).unwrap();
        match &q.steps[0].operation {
            Operation::FilterRows {
                predicate:
                    FilterPredicate::Comparison {
                        op: CompareOp::GreaterThanOrEqual,
                        value: Some(Value::Date(d)),
                        ..
                    },
            } => assert_eq!(d.to_string(), "2024-01-02"),
            other => panic!("expected folded date comparison, got {other:?}"),
        }
    }

    #[test]
    fn unknown_table_function_is_an_error() {
        let src = r#"
            let
                Source = Table.FromName("T"),
                X = Table.Explode(Source)
            in
                X
        "#;
        let e = compile_script("q", "t", src).unwrap_err();
        assert!(e.message.contains("Table.Explode"));
    }

    #[test]
    fn quoted_step_names_round_trip() {
        let src = r#"
            let
                Source = Table.FromName("T"),
                #"Kept Columns" = Table.SelectColumns(Source, {"A"})
            in
                #"Kept Columns"
        "#;
        let q = compile_script("q", "t", src).unwrap();
        assert_eq!(q.steps[0].name.as_deref(), Some("Kept Columns"));
    }
}
