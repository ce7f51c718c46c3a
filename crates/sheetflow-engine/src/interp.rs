//! Row-expression interpreter.
//!
//! A stateless tree-walker with an enumerated function table. There is
//! no environment lookup of any kind: an identifier that is not in the
//! table fails with an unsupported-identifier error, which the operation
//! layer converts to `Null` for the affected row.

use chrono::{Datelike, Duration};
use sheetflow_common::{FlowError, Value, value};
use sheetflow_parse::ast::{BinaryOp, Expr, UnaryOp};
use sheetflow_common::table::Column;

/// One row bound as `_`, with `[Col]` accessors.
#[derive(Clone, Copy)]
pub struct RowCtx<'a> {
    pub columns: &'a [Column],
    pub row: &'a [Value],
}

impl<'a> RowCtx<'a> {
    pub fn new(columns: &'a [Column], row: &'a [Value]) -> Self {
        Self { columns, row }
    }

    fn get(&self, name: &str) -> Result<&'a Value, FlowError> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .map(|i| &self.row[i])
            .ok_or_else(|| FlowError::unknown_column(name))
    }
}

fn unsupported(name: &str) -> FlowError {
    FlowError::invalid_argument("identifier", format!("unsupported identifier '{name}'"))
}

pub fn evaluate(expr: &Expr, ctx: &RowCtx<'_>) -> Result<Value, FlowError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Column(name) => ctx.get(name).cloned(),
        Expr::Row => Ok(Value::Record(
            ctx.columns
                .iter()
                .zip(ctx.row.iter())
                .map(|(c, v)| (c.name.clone(), v.clone()))
                .collect(),
        )),
        Expr::Ident(name) => Err(unsupported(name)),
        Expr::Each(body) => evaluate(body, ctx),
        Expr::Unary { op, expr } => eval_unary(*op, expr, ctx),
        Expr::Binary { op, left, right } => eval_binary(*op, left, right, ctx),
        Expr::If {
            cond,
            then,
            otherwise,
        } => {
            if evaluate(cond, ctx)?.is_truthy() {
                evaluate(then, ctx)
            } else {
                evaluate(otherwise, ctx)
            }
        }
        Expr::Call { name, args } => eval_call(name, args, ctx),
        Expr::List(_) => Err(FlowError::invalid_argument(
            "expression",
            "a list is only valid as a List.* argument",
        )),
        Expr::RecordLit(fields) => {
            let mut out = Vec::with_capacity(fields.len());
            for (k, e) in fields {
                out.push((k.clone(), evaluate(e, ctx)?));
            }
            Ok(Value::Record(out))
        }
    }
}

/* ───────────────────────── operators ──────────────────────────────── */

fn eval_unary(op: UnaryOp, expr: &Expr, ctx: &RowCtx<'_>) -> Result<Value, FlowError> {
    let v = evaluate(expr, ctx)?;
    match op {
        UnaryOp::Not => Ok(Value::Bool(!v.is_truthy())),
        UnaryOp::Plus | UnaryOp::Neg => {
            if v.is_null() {
                return Ok(Value::Null);
            }
            let n = v
                .as_number()
                .ok_or_else(|| FlowError::invalid_argument("operand", "expected a number"))?;
            Ok(Value::Number(if op == UnaryOp::Neg { -n } else { n }))
        }
    }
}

fn eval_binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    ctx: &RowCtx<'_>,
) -> Result<Value, FlowError> {
    // Logic short-circuits before the right side is touched.
    match op {
        BinaryOp::And => {
            let l = evaluate(left, ctx)?;
            if !l.is_truthy() {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Bool(evaluate(right, ctx)?.is_truthy()));
        }
        BinaryOp::Or => {
            let l = evaluate(left, ctx)?;
            if l.is_truthy() {
                return Ok(Value::Bool(true));
            }
            return Ok(Value::Bool(evaluate(right, ctx)?.is_truthy()));
        }
        _ => {}
    }

    let l = evaluate(left, ctx)?;
    let r = evaluate(right, ctx)?;

    if op.is_comparison() {
        return compare(op, &l, &r);
    }

    match op {
        BinaryOp::Concat => {
            let ls = if l.is_null() { String::new() } else { l.to_string() };
            let rs = if r.is_null() { String::new() } else { r.to_string() };
            Ok(Value::Text(ls + &rs))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
            // Date arithmetic: date ± duration stays a date-kind value.
            if let Some(v) = date_arithmetic(op, &l, &r) {
                return Ok(v);
            }
            if l.is_null() || r.is_null() {
                return Ok(Value::Null);
            }
            let (a, b) = match (l.as_number(), r.as_number()) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(FlowError::invalid_argument(
                        "operand",
                        "arithmetic requires numbers",
                    ));
                }
            };
            let out = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => {
                    if b == 0.0 {
                        return Err(FlowError::invalid_argument("operand", "division by zero"));
                    }
                    a / b
                }
                _ => unreachable!(),
            };
            Ok(Value::Number(out))
        }
        _ => unreachable!(),
    }
}

fn date_arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Option<Value> {
    match (op, l, r) {
        (BinaryOp::Add, Value::Date(d), Value::Duration(dur))
        | (BinaryOp::Add, Value::Duration(dur), Value::Date(d)) => {
            Some(Value::Date(*d + *dur))
        }
        (BinaryOp::Sub, Value::Date(d), Value::Duration(dur)) => Some(Value::Date(*d - *dur)),
        (BinaryOp::Sub, Value::Date(a), Value::Date(b)) => {
            Some(Value::Duration(*a - *b))
        }
        (BinaryOp::Add, Value::DateTime(dt), Value::Duration(dur)) => {
            Some(Value::DateTime(*dt + *dur))
        }
        (BinaryOp::Sub, Value::DateTime(dt), Value::Duration(dur)) => {
            Some(Value::DateTime(*dt - *dur))
        }
        _ => None,
    }
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, FlowError> {
    let out = match op {
        BinaryOp::Eq => l == r,
        BinaryOp::Ne => l != r,
        _ => {
            if l.is_null() || r.is_null() {
                return Ok(Value::Bool(false));
            }
            let ord = l.compare(r);
            match op {
                BinaryOp::Lt => ord.is_lt(),
                BinaryOp::Le => ord.is_le(),
                BinaryOp::Gt => ord.is_gt(),
                BinaryOp::Ge => ord.is_ge(),
                _ => unreachable!(),
            }
        }
    };
    Ok(Value::Bool(out))
}

/* ───────────────────────── function table ─────────────────────────── */

fn eval_call(name: &str, args: &[Expr], ctx: &RowCtx<'_>) -> Result<Value, FlowError> {
    // List.* functions take their list argument as a special form.
    if let Some(op) = name.strip_prefix("List.") {
        return eval_list_fn(op, args, ctx);
    }

    let mut vals = Vec::with_capacity(args.len());
    for a in args {
        vals.push(evaluate(a, ctx)?);
    }
    let arg = |i: usize| -> Result<&Value, FlowError> {
        vals.get(i)
            .ok_or_else(|| FlowError::invalid_argument(name, format!("missing argument {}", i + 1)))
    };
    let text = |i: usize| -> Result<String, FlowError> {
        let v = arg(i)?;
        Ok(if v.is_null() {
            String::new()
        } else {
            v.to_string()
        })
    };
    let number = |i: usize| -> Result<f64, FlowError> {
        arg(i)?
            .as_number()
            .ok_or_else(|| FlowError::invalid_argument(name, "expected a number"))
    };

    match name {
        "Text.Upper" => Ok(Value::Text(text(0)?.to_uppercase())),
        "Text.Lower" => Ok(Value::Text(text(0)?.to_lowercase())),
        "Text.Trim" => Ok(Value::Text(text(0)?.trim().to_string())),
        "Text.Length" => Ok(Value::Int(text(0)?.chars().count() as i64)),
        "Text.Contains" => Ok(Value::Bool(text(0)?.contains(&text(1)?))),
        "Text.StartsWith" => Ok(Value::Bool(text(0)?.starts_with(&text(1)?))),
        "Text.EndsWith" => Ok(Value::Bool(text(0)?.ends_with(&text(1)?))),
        "Text.Start" => {
            let s = text(0)?;
            let n = number(1)?.max(0.0) as usize;
            Ok(Value::Text(s.chars().take(n).collect()))
        }
        "Text.End" => {
            let s = text(0)?;
            let n = number(1)?.max(0.0) as usize;
            let count = s.chars().count();
            Ok(Value::Text(s.chars().skip(count.saturating_sub(n)).collect()))
        }
        "Text.Replace" => Ok(Value::Text(text(0)?.replace(&text(1)?, &text(2)?))),
        "Number.Abs" => Ok(Value::Number(number(0)?.abs())),
        "Number.Round" => {
            let n = number(0)?;
            let digits = if vals.len() > 1 { number(1)? as i32 } else { 0 };
            let factor = 10f64.powi(digits);
            Ok(Value::Number((n * factor).round() / factor))
        }
        "Number.From" => match arg(0)? {
            Value::Text(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Number)
                .map_err(|_| FlowError::invalid_argument(name, "unparseable number")),
            other => other
                .as_number()
                .map(Value::Number)
                .ok_or_else(|| FlowError::invalid_argument(name, "expected a number")),
        },
        "Date.FromText" => value::parse_date(&text(0)?)
            .map(Value::Date)
            .ok_or_else(|| FlowError::invalid_argument(name, "unparseable date")),
        "Date.AddDays" => match arg(0)? {
            Value::Date(d) => Ok(Value::Date(*d + Duration::days(number(1)? as i64))),
            Value::DateTime(dt) => Ok(Value::DateTime(*dt + Duration::days(number(1)? as i64))),
            _ => Err(FlowError::invalid_argument(name, "expected a date")),
        },
        "Date.Year" => date_part(arg(0)?, |d| d.year() as i64).map(Value::Int),
        "Date.Month" => date_part(arg(0)?, |d| d.month() as i64).map(Value::Int),
        "Date.Day" => date_part(arg(0)?, |d| d.day() as i64).map(Value::Int),
        "#date" => {
            let (y, m, d) = (number(0)? as i32, number(1)? as u32, number(2)? as u32);
            chrono::NaiveDate::from_ymd_opt(y, m, d)
                .map(Value::Date)
                .ok_or_else(|| FlowError::invalid_argument(name, "invalid date"))
        }
        "#time" => {
            let (h, mi, s) = (number(0)? as u32, number(1)? as u32, number(2)? as u32);
            chrono::NaiveTime::from_hms_opt(h, mi, s)
                .map(Value::Time)
                .ok_or_else(|| FlowError::invalid_argument(name, "invalid time"))
        }
        "#duration" => {
            let (d, h, mi, s) = (number(0)?, number(1)?, number(2)?, number(3)?);
            Ok(Value::Duration(
                Duration::days(d as i64)
                    + Duration::hours(h as i64)
                    + Duration::minutes(mi as i64)
                    + Duration::seconds(s as i64),
            ))
        }
        other => Err(unsupported(other)),
    }
}

fn date_part<F: Fn(&chrono::NaiveDate) -> i64>(v: &Value, f: F) -> Result<i64, FlowError> {
    match v {
        Value::Date(d) => Ok(f(d)),
        Value::DateTime(dt) => Ok(f(&dt.date())),
        _ => Err(FlowError::invalid_argument("date", "expected a date")),
    }
}

fn eval_list_fn(op: &str, args: &[Expr], ctx: &RowCtx<'_>) -> Result<Value, FlowError> {
    let Some(items) = args.first().and_then(Expr::as_list) else {
        return Err(FlowError::invalid_argument(
            "List",
            "List.* functions take a literal list",
        ));
    };
    let mut nums = Vec::with_capacity(items.len());
    let mut count = 0i64;
    for item in items {
        let v = evaluate(item, ctx)?;
        if v.is_null() {
            continue;
        }
        count += 1;
        if let Some(n) = v.as_number() {
            nums.push(n);
        }
    }
    match op {
        "Count" => Ok(Value::Int(count)),
        "Sum" => Ok(Value::Number(nums.iter().sum())),
        "Average" => {
            if nums.is_empty() {
                Ok(Value::Null)
            } else {
                Ok(Value::Number(nums.iter().sum::<f64>() / nums.len() as f64))
            }
        }
        "Min" => Ok(nums
            .iter()
            .copied()
            .fold(None::<f64>, |acc, n| Some(acc.map_or(n, |a| a.min(n))))
            .map_or(Value::Null, Value::Number)),
        "Max" => Ok(nums
            .iter()
            .copied()
            .fold(None::<f64>, |acc, n| Some(acc.map_or(n, |a| a.max(n))))
            .map_or(Value::Null, Value::Number)),
        other => Err(unsupported(&format!("List.{other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetflow_parse::parse_expression;

    fn ctx_row() -> (Vec<Column>, Vec<Value>) {
        (
            vec![Column::any("Name"), Column::any("Price"), Column::any("Qty")],
            vec![Value::from("widget"), Value::Number(2.5), Value::Int(4)],
        )
    }

    fn eval(src: &str) -> Result<Value, FlowError> {
        let (cols, row) = ctx_row();
        let expr = parse_expression(src).unwrap();
        evaluate(&expr, &RowCtx::new(&cols, &row))
    }

    #[test]
    fn arithmetic_over_columns() {
        assert_eq!(eval("[Price] * [Qty]").unwrap(), Value::Number(10.0));
    }

    #[test]
    fn whitelisted_functions() {
        assert_eq!(
            eval("Text.Upper([Name])").unwrap(),
            Value::Text("WIDGET".into())
        );
        assert_eq!(eval("Text.Length([Name])").unwrap(), Value::Int(6));
        assert_eq!(eval("Number.Round(2.567, 2)").unwrap(), Value::Number(2.57));
    }

    #[test]
    fn non_whitelisted_identifier_is_rejected() {
        for src in ["globalThis", "Function(1)", "eval(\"x\")"] {
            let e = eval(src).unwrap_err();
            assert!(e.to_string().contains("unsupported identifier"), "{src}");
        }
    }

    #[test]
    fn if_then_else_branches() {
        assert_eq!(
            eval(r#"if [Qty] > 2 then "big" else "small""#).unwrap(),
            Value::Text("big".into())
        );
    }

    #[test]
    fn null_arithmetic_propagates_null() {
        let cols = vec![Column::any("A")];
        let row = vec![Value::Null];
        let expr = parse_expression("[A] + 1").unwrap();
        assert_eq!(
            evaluate(&expr, &RowCtx::new(&cols, &row)).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn list_functions_aggregate() {
        assert_eq!(eval("List.Sum({1, 2, 3})").unwrap(), Value::Number(6.0));
        assert_eq!(eval("List.Count({1, null, 3})").unwrap(), Value::Int(2));
    }

    #[test]
    fn row_binds_as_record() {
        match eval("_").unwrap() {
            Value::Record(fields) => assert_eq!(fields.len(), 3),
            other => panic!("expected record, got {other:?}"),
        }
    }
}
