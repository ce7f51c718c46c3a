//! Recursive-descent parser for the expression language.
//!
//! Precedence, loosest first: `each` / `if` / `or` / `and` / `not` /
//! comparison / `&` / additive / multiplicative / unary / primary.

use std::error::Error;
use std::fmt::{self, Display};

use sheetflow_common::Value;

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::tokenizer::{Token, TokenKind, TokenizerError, tokenize};

/// A custom error type for the parser.
#[derive(Debug)]
pub struct ParserError {
    pub message: String,
    pub position: Option<usize>,
}

impl ParserError {
    pub fn new(message: impl Into<String>, position: Option<usize>) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }
}

impl Display for ParserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(pos) = self.position {
            write!(f, "ParserError at position {}: {}", pos, self.message)
        } else {
            write!(f, "ParserError: {}", self.message)
        }
    }
}

impl Error for ParserError {}

impl From<TokenizerError> for ParserError {
    fn from(e: TokenizerError) -> Self {
        ParserError::new(e.message, Some(e.pos))
    }
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    pub fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, off: usize) -> Option<&Token> {
        self.tokens.get(self.pos + off)
    }

    pub fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn err_here(&self, msg: impl Into<String>) -> ParserError {
        ParserError::new(msg, self.peek().map(|t| t.pos))
    }

    pub fn is_punct(&self, p: &str) -> bool {
        self.peek()
            .is_some_and(|t| t.kind == TokenKind::Punct && t.text == p)
    }

    fn is_keyword(&self, k: &str) -> bool {
        self.peek()
            .is_some_and(|t| t.kind == TokenKind::Keyword && t.text == k && !t.quoted)
    }

    pub fn eat_punct(&mut self, p: &str) -> bool {
        if self.is_punct(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn eat_keyword(&mut self, k: &str) -> bool {
        if self.is_keyword(k) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn expect_punct(&mut self, p: &str) -> Result<(), ParserError> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(self.err_here(format!("expected '{p}'")))
        }
    }

    pub fn expect_keyword(&mut self, k: &str) -> Result<(), ParserError> {
        if self.eat_keyword(k) {
            Ok(())
        } else {
            Err(self.err_here(format!("expected '{k}'")))
        }
    }

    /// Identifier token (bare, dotted, or `#"quoted"`), as its text.
    pub fn expect_ident(&mut self) -> Result<String, ParserError> {
        match self.peek() {
            Some(t) if t.kind == TokenKind::Ident => {
                let text = t.text.clone();
                self.pos += 1;
                Ok(text)
            }
            _ => Err(self.err_here("expected identifier")),
        }
    }

    /* ─────────────────────── expression grammar ───────────────────── */

    pub fn parse_expr(&mut self) -> Result<Expr, ParserError> {
        if self.eat_keyword("each") {
            let body = self.parse_expr()?;
            return Ok(Expr::Each(Box::new(body)));
        }
        if self.eat_keyword("if") {
            let cond = self.parse_expr()?;
            self.expect_keyword("then")?;
            let then = self.parse_expr()?;
            self.expect_keyword("else")?;
            let otherwise = self.parse_expr()?;
            return Ok(Expr::If {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            });
        }
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ParserError> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("or") {
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParserError> {
        let mut left = self.parse_not()?;
        while self.eat_keyword("and") {
            let right = self.parse_not()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ParserError> {
        if self.eat_keyword("not") {
            let expr = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParserError> {
        let left = self.parse_concat()?;
        let op = match self.peek() {
            Some(t) if t.kind == TokenKind::Punct => match t.text.as_str() {
                "=" => Some(BinaryOp::Eq),
                "<>" => Some(BinaryOp::Ne),
                "<" => Some(BinaryOp::Lt),
                "<=" => Some(BinaryOp::Le),
                ">" => Some(BinaryOp::Gt),
                ">=" => Some(BinaryOp::Ge),
                _ => None,
            },
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let right = self.parse_concat()?;
            return Ok(Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            });
        }
        Ok(left)
    }

    fn parse_concat(&mut self) -> Result<Expr, ParserError> {
        let mut left = self.parse_additive()?;
        while self.eat_punct("&") {
            let right = self.parse_additive()?;
            left = Expr::Binary {
                op: BinaryOp::Concat,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParserError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = if self.is_punct("+") {
                BinaryOp::Add
            } else if self.is_punct("-") {
                BinaryOp::Sub
            } else {
                break;
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParserError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.is_punct("*") {
                BinaryOp::Mul
            } else if self.is_punct("/") {
                BinaryOp::Div
            } else {
                break;
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParserError> {
        if self.is_punct("-") {
            self.pos += 1;
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(expr),
            });
        }
        if self.is_punct("+") {
            self.pos += 1;
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Plus,
                expr: Box::new(expr),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParserError> {
        let Some(tok) = self.peek().cloned() else {
            return Err(self.err_here("unexpected end of expression"));
        };
        match tok.kind {
            TokenKind::Number => {
                self.pos += 1;
                let v = if tok.text.contains(['.', 'e', 'E']) {
                    tok.text
                        .parse::<f64>()
                        .map(Value::Number)
                        .map_err(|_| self.err_here("invalid number literal"))?
                } else {
                    tok.text
                        .parse::<i64>()
                        .map(Value::Int)
                        .or_else(|_| tok.text.parse::<f64>().map(Value::Number))
                        .map_err(|_| self.err_here("invalid number literal"))?
                };
                Ok(Expr::Literal(v))
            }
            TokenKind::Str => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Text(tok.text)))
            }
            TokenKind::Keyword if tok.text == "true" => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Bool(true)))
            }
            TokenKind::Keyword if tok.text == "false" => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Bool(false)))
            }
            TokenKind::Keyword if tok.text == "null" => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Null))
            }
            TokenKind::Keyword if tok.text == "type" => {
                // `type text`: keep as an identifier for the compiler.
                self.pos += 1;
                let name = self.expect_ident()?;
                Ok(Expr::Ident(format!("type {name}")))
            }
            TokenKind::Ident => {
                self.pos += 1;
                if tok.text == "_" && !self.is_punct("(") {
                    return Ok(Expr::Row);
                }
                if self.eat_punct("(") {
                    let mut args = Vec::new();
                    if !self.is_punct(")") {
                        loop {
                            args.push(self.parse_expr()?);
                            if !self.eat_punct(",") {
                                break;
                            }
                        }
                    }
                    self.expect_punct(")")?;
                    return Ok(Expr::Call {
                        name: tok.text,
                        args,
                    });
                }
                Ok(Expr::Ident(tok.text))
            }
            TokenKind::Punct => match tok.text.as_str() {
                "(" => {
                    self.pos += 1;
                    let inner = self.parse_expr()?;
                    self.expect_punct(")")?;
                    Ok(inner)
                }
                "{" => {
                    self.pos += 1;
                    let mut items = Vec::new();
                    if !self.is_punct("}") {
                        loop {
                            items.push(self.parse_expr()?);
                            if !self.eat_punct(",") {
                                break;
                            }
                        }
                    }
                    self.expect_punct("}")?;
                    Ok(Expr::List(items))
                }
                "[" => self.parse_bracketed(),
                other => Err(self.err_here(format!("unexpected token '{other}'"))),
            },
            _ => Err(self.err_here(format!("unexpected token '{}'", tok.text))),
        }
    }

    /// `[Name]` is a column ref; `[a = 1, b = 2]` is a record literal.
    /// The distinction is the `=` after the first identifier.
    fn parse_bracketed(&mut self) -> Result<Expr, ParserError> {
        self.expect_punct("[")?;
        if self.is_punct("]") {
            return Err(self.err_here("empty brackets"));
        }
        let is_record = self
            .peek()
            .is_some_and(|t| t.kind == TokenKind::Ident)
            && self
                .peek_at(1)
                .is_some_and(|t| t.kind == TokenKind::Punct && t.text == "=");
        if is_record {
            let mut fields = Vec::new();
            loop {
                let key = self.expect_ident()?;
                self.expect_punct("=")?;
                let value = self.parse_expr()?;
                fields.push((key, value));
                if !self.eat_punct(",") {
                    break;
                }
            }
            self.expect_punct("]")?;
            return Ok(Expr::RecordLit(fields));
        }
        let name = self.expect_ident()?;
        self.expect_punct("]")?;
        Ok(Expr::Column(name))
    }
}

/// Parse a standalone expression (a row formula).
pub fn parse_expression(src: &str) -> Result<Expr, ParserError> {
    let tokens = tokenize(src)?;
    let mut p = Parser::new(tokens);
    let expr = p.parse_expr()?;
    if !p.at_end() {
        return Err(ParserError::new(
            "trailing input after expression",
            p.peek().map(|t| t.pos),
        ));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_and_column_refs() {
        let e = parse_expression("[Price] * [Qty] + 1").unwrap();
        match e {
            Expr::Binary {
                op: BinaryOp::Add,
                left,
                ..
            } => match *left {
                Expr::Binary {
                    op: BinaryOp::Mul, ..
                } => {}
                other => panic!("expected Mul on the left, got {other:?}"),
            },
            other => panic!("expected Add at the top, got {other:?}"),
        }
    }

    #[test]
    fn if_then_else() {
        let e = parse_expression(r#"if [x] > 2 then "hi" else Text.Upper([y])"#).unwrap();
        assert!(matches!(e, Expr::If { .. }));
    }

    #[test]
    fn record_vs_column_brackets() {
        assert!(matches!(
            parse_expression("[Sales]").unwrap(),
            Expr::Column(_)
        ));
        assert!(matches!(
            parse_expression("[a = 1, b = 2]").unwrap(),
            Expr::RecordLit(_)
        ));
    }

    #[test]
    fn each_wraps_body() {
        let e = parse_expression("each [a] + 1").unwrap();
        assert!(matches!(e, Expr::Each(_)));
    }

    #[test]
    fn comparison_is_non_associative() {
        assert!(parse_expression("1 = 2 = 3").is_err());
    }

    #[test]
    fn string_and_number_literals() {
        assert_eq!(
            parse_expression("42").unwrap(),
            Expr::Literal(Value::Int(42))
        );
        assert_eq!(
            parse_expression("4.5").unwrap(),
            Expr::Literal(Value::Number(4.5))
        );
        assert_eq!(
            parse_expression(r#""x""#).unwrap(),
            Expr::Literal(Value::Text("x".into()))
        );
    }
}
