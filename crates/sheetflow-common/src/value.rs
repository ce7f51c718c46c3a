//! First-class domain values for table cells.
//!
//! The engine compares values **structurally** everywhere the same way:
//! `=` / `<>` in expressions, filter `equals`, replace-match, distinct
//! rows, and join keys all go through [`Value::eq`]. Numerics compare by
//! numeric value across `Int` / `Number` / `Decimal`; records compare
//! insertion-order-independently and recursively; hashing is consistent
//! with equality.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::table::{DataType, Table};

/// `chrono::Duration` has no serde support of its own; persist it as
/// whole milliseconds.
mod duration_millis {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.num_milliseconds().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = i64::deserialize(d)?;
        Ok(Duration::milliseconds(ms))
    }
}

/// A single cell value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Text(String),
    Int(i64),
    Number(f64),
    Bool(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Time(NaiveTime),
    #[serde(with = "duration_millis")]
    Duration(Duration),
    Decimal(Decimal),
    Binary(Vec<u8>),
    /// Ordered key→value mapping. Equality ignores insertion order.
    Record(Vec<(String, Value)>),
    /// Nested table (the right side of a nested join).
    Table(Box<Table>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}
impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}
impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/* ───────────────────────── equality & hashing ─────────────────────── */

/// Canonical bit pattern for a numeric value. `-0.0` folds to `+0.0`
/// and every NaN folds to one canonical NaN so equal values share bits.
fn canonical_bits(n: f64) -> u64 {
    if n.is_nan() {
        f64::NAN.to_bits()
    } else if n == 0.0 {
        0.0f64.to_bits()
    } else {
        n.to_bits()
    }
}

impl Value {
    /// Numeric view used for cross-representation comparison, when the
    /// value is numeric at all.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Number(n) => Some(*n),
            Value::Decimal(d) => d.to_f64(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn record_get<'a>(fields: &'a [(String, Value)], key: &str) -> Option<&'a Value> {
        fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Time(a), Value::Time(b)) => a == b,
            (Value::Duration(a), Value::Duration(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| {
                        Value::record_get(b, k).map(|w| v == w).unwrap_or(false)
                    })
            }
            // Cross-representation numerics compare by numeric value.
            (a, b) => match (a.as_number(), b.as_number()) {
                (Some(x), Some(y)) => canonical_bits(x) == canonical_bits(y),
                _ => false,
            },
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => state.write_u8(0),
            Value::Text(s) => {
                state.write_u8(1);
                s.hash(state);
            }
            Value::Bool(b) => {
                state.write_u8(2);
                b.hash(state);
            }
            // All numerics hash through the canonical f64 key so that
            // Int(1), Number(1.0) and Decimal("1.0") land together.
            Value::Int(_) | Value::Number(_) | Value::Decimal(_) => {
                state.write_u8(3);
                let n = self.as_number().unwrap_or(f64::NAN);
                state.write_u64(canonical_bits(n));
            }
            Value::Date(d) => {
                state.write_u8(4);
                d.hash(state);
            }
            Value::DateTime(dt) => {
                state.write_u8(5);
                dt.hash(state);
            }
            Value::Time(t) => {
                state.write_u8(6);
                t.hash(state);
            }
            Value::Duration(d) => {
                state.write_u8(7);
                d.num_milliseconds().hash(state);
            }
            Value::Binary(b) => {
                state.write_u8(8);
                b.hash(state);
            }
            Value::Record(fields) => {
                state.write_u8(9);
                state.write_usize(fields.len());
                // Order-independent fold: combine per-entry digests with
                // wrapping addition so permuted records hash equal.
                let mut acc: u64 = 0;
                for (k, v) in fields {
                    let mut h = rustc_hash::FxHasher::default();
                    k.hash(&mut h);
                    v.hash(&mut h);
                    acc = acc.wrapping_add(h.finish());
                }
                state.write_u64(acc);
            }
            Value::Table(t) => {
                state.write_u8(10);
                for col in t.columns() {
                    col.name.hash(state);
                }
                for row in t.iter_rows() {
                    for cell in row {
                        cell.hash(state);
                    }
                }
            }
        }
    }
}

/* ───────────────────────────── ordering ───────────────────────────── */

fn kind_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Int(_) | Value::Number(_) | Value::Decimal(_) => 1,
        Value::Text(_) => 2,
        Value::Bool(_) => 3,
        Value::Date(_) => 4,
        Value::DateTime(_) => 5,
        Value::Time(_) => 6,
        Value::Duration(_) => 7,
        Value::Binary(_) => 8,
        Value::Record(_) => 9,
        Value::Table(_) => 10,
    }
}

impl Value {
    /// Total order used by stable sorts. Nulls order first here; the
    /// sort operation applies its own nulls-first/last policy on top.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::Time(a), Value::Time(b)) => a.cmp(b),
            (Value::Duration(a), Value::Duration(b)) => a.cmp(b),
            (Value::Binary(a), Value::Binary(b)) => a.cmp(b),
            _ => match (self.as_number(), other.as_number()) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => kind_rank(self).cmp(&kind_rank(other)),
            },
        }
    }
}

/* ──────────────────────────── rendering ───────────────────────────── */

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Text(s) => write!(f, "{s}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{n}")
                }
            }
            Value::Bool(b) => write!(f, "{}", if *b { "true" } else { "false" }),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S")),
            Value::Time(t) => write!(f, "{}", t.format("%H:%M:%S")),
            Value::Duration(d) => {
                let total = d.num_seconds();
                let days = total / 86_400;
                let rem = total.rem_euclid(86_400);
                write!(f, "{days}.{:02}:{:02}:{:02}", rem / 3600, (rem % 3600) / 60, rem % 60)
            }
            // Decimal keeps its input scale when stringified.
            Value::Decimal(d) => write!(f, "{d}"),
            Value::Binary(b) => write!(f, "[Binary {} bytes]", b.len()),
            Value::Record(fields) => {
                write!(f, "[")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}={v}")?;
                }
                write!(f, "]")
            }
            Value::Table(t) => write!(f, "[Table {}x{}]", t.row_count(), t.column_count()),
        }
    }
}

/* ──────────────────────────── coercion ────────────────────────────── */

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%m/%d/%Y"))
        .ok()
}

pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .ok()
}

pub fn parse_time(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

impl Value {
    pub fn type_of(&self) -> DataType {
        match self {
            Value::Null => DataType::Any,
            Value::Text(_) => DataType::Text,
            Value::Int(_) | Value::Number(_) => DataType::Number,
            Value::Bool(_) => DataType::Boolean,
            Value::Date(_) => DataType::Date,
            Value::DateTime(_) => DataType::DateTime,
            Value::Time(_) => DataType::Time,
            Value::Duration(_) => DataType::Duration,
            Value::Decimal(_) => DataType::Decimal,
            Value::Binary(_) => DataType::Binary,
            Value::Record(_) | Value::Table(_) => DataType::Any,
        }
    }

    /// Coerce to `target`. Returns `None` for unparseable input; a
    /// failed coercion of one cell becomes `Null` and never aborts the
    /// surrounding operation.
    pub fn coerce(&self, target: DataType) -> Option<Value> {
        if self.is_null() {
            return Some(Value::Null);
        }
        match target {
            DataType::Any => Some(self.clone()),
            DataType::Text => Some(Value::Text(self.to_string())),
            DataType::Number => match self {
                Value::Text(s) => s.trim().parse::<f64>().ok().map(Value::Number),
                Value::Bool(b) => Some(Value::Number(if *b { 1.0 } else { 0.0 })),
                _ => self.as_number().map(Value::Number),
            },
            DataType::Boolean => match self {
                Value::Bool(b) => Some(Value::Bool(*b)),
                Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" => Some(Value::Bool(true)),
                    "false" => Some(Value::Bool(false)),
                    _ => None,
                },
                _ => self.as_number().map(|n| Value::Bool(n != 0.0)),
            },
            DataType::Date => match self {
                Value::Date(d) => Some(Value::Date(*d)),
                Value::DateTime(dt) => Some(Value::Date(dt.date())),
                Value::Text(s) => parse_date(s).map(Value::Date),
                _ => None,
            },
            DataType::DateTime => match self {
                Value::DateTime(dt) => Some(Value::DateTime(*dt)),
                Value::Date(d) => d.and_hms_opt(0, 0, 0).map(Value::DateTime),
                Value::Text(s) => parse_datetime(s)
                    .or_else(|| parse_date(s).and_then(|d| d.and_hms_opt(0, 0, 0)))
                    .map(Value::DateTime),
                _ => None,
            },
            DataType::Time => match self {
                Value::Time(t) => Some(Value::Time(*t)),
                Value::DateTime(dt) => Some(Value::Time(dt.time())),
                Value::Text(s) => parse_time(s).map(Value::Time),
                _ => None,
            },
            DataType::Duration => match self {
                Value::Duration(d) => Some(Value::Duration(*d)),
                _ => self
                    .as_number()
                    .map(|n| Value::Duration(Duration::seconds(n as i64))),
            },
            DataType::Decimal => match self {
                Value::Decimal(d) => Some(Value::Decimal(*d)),
                Value::Int(i) => Some(Value::Decimal(Decimal::from(*i))),
                Value::Number(n) => Decimal::from_f64_retain(*n).map(Value::Decimal),
                Value::Text(s) => s.trim().parse::<Decimal>().ok().map(Value::Decimal),
                _ => None,
            },
            DataType::Binary => match self {
                Value::Binary(b) => Some(Value::Binary(b.clone())),
                _ => None,
            },
        }
    }

    /// Truthiness used by filter predicates and `if` expressions.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Number(n) => *n != 0.0,
            Value::Decimal(d) => !d.is_zero(),
            Value::Text(s) => !s.is_empty(),
            Value::Null => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHasher;

    fn hash_of(v: &Value) -> u64 {
        let mut h = FxHasher::default();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn numerics_compare_across_representations() {
        assert_eq!(Value::Int(1), Value::Number(1.0));
        assert_eq!(Value::Decimal("1.0".parse().unwrap()), Value::Number(1.0));
        assert_eq!(Value::Decimal("1.0".parse().unwrap()), Value::Int(1));
        assert_ne!(Value::Int(1), Value::Number(1.5));
        assert_eq!(hash_of(&Value::Int(1)), hash_of(&Value::Number(1.0)));
        assert_eq!(
            hash_of(&Value::Decimal("2.50".parse().unwrap())),
            hash_of(&Value::Number(2.5))
        );
    }

    #[test]
    fn record_equality_ignores_insertion_order() {
        let a = Value::Record(vec![
            ("x".into(), Value::Int(1)),
            ("y".into(), Value::Text("q".into())),
        ]);
        let b = Value::Record(vec![
            ("y".into(), Value::Text("q".into())),
            ("x".into(), Value::Number(1.0)),
        ]);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn decimal_display_preserves_scale() {
        let d = Value::Decimal("1.500".parse().unwrap());
        assert_eq!(d.to_string(), "1.500");
    }

    #[test]
    fn coercion_failures_yield_none() {
        assert_eq!(Value::Text("abc".into()).coerce(DataType::Number), None);
        assert_eq!(
            Value::Text("2024-01-02".into()).coerce(DataType::Date),
            Some(Value::Date(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()))
        );
        assert_eq!(Value::Null.coerce(DataType::Number), Some(Value::Null));
    }

    #[test]
    fn negative_zero_folds_into_zero() {
        assert_eq!(Value::Number(-0.0), Value::Number(0.0));
        assert_eq!(hash_of(&Value::Number(-0.0)), hash_of(&Value::Number(0.0)));
    }
}
