//! Expression AST shared by the row-formula evaluator and the M-script
//! compiler.
//!
//! The language is deliberately tiny: literals, column refs `[Name]`,
//! the row ref `_`, arithmetic/comparison/logic, `if … then … else …`,
//! list and record literals, and calls against a whitelisted function
//! set. Identifiers resolve only through that whitelist (or, inside a
//! script, through step names); there is no global environment.

use serde::{Deserialize, Serialize};
use sheetflow_common::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Value),
    /// `[Name]`: a field of the current row.
    Column(String),
    /// `_`: the current row as a record.
    Row,
    /// A bare identifier: a whitelisted constant (`Order.Descending`),
    /// a step reference inside a script, or an error at evaluation.
    Ident(String),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    If {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    /// `{a, b, c}`
    List(Vec<Expr>),
    /// `[a = 1, b = 2]`
    RecordLit(Vec<(String, Expr)>),
    /// `each <body>`; the body sees `_` and `[Col]`.
    Each(Box<Expr>),
}

impl Expr {
    pub fn literal(v: impl Into<Value>) -> Self {
        Expr::Literal(v.into())
    }

    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column(name.into())
    }

    /// The string contents when this is a string literal.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Expr::Literal(Value::Text(s)) => Some(s),
            _ => None,
        }
    }

    /// The list elements when this is a list literal.
    pub fn as_list(&self) -> Option<&[Expr]> {
        match self {
            Expr::List(items) => Some(items),
            _ => None,
        }
    }
}
