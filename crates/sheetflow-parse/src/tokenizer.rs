//! Tokenizer for the expression language and the M-script subset.

use std::error::Error;
use std::fmt::{self, Display};

/// A custom error type for the tokenizer.
#[derive(Debug)]
pub struct TokenizerError {
    pub message: String,
    pub pos: usize,
}

impl fmt::Display for TokenizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenizerError at {}: {}", self.pos, self.message)
    }
}

impl Error for TokenizerError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Number,
    Str,
    /// Bare or dotted identifier (`Sales`, `Text.Upper`, `#date`), or a
    /// `#"quoted name"` identifier.
    Ident,
    Keyword,
    /// Single punctuation or operator: `( ) { } [ ] , = <> <= >= < > + - * / &`.
    Punct,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub pos: usize,
    /// Set for `#"…"` identifiers, which never collide with keywords.
    pub quoted: bool,
}

impl Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{:?} {}>", self.kind, self.text)
    }
}

impl Token {
    fn new(kind: TokenKind, text: impl Into<String>, pos: usize) -> Self {
        Token {
            kind,
            text: text.into(),
            pos,
            quoted: false,
        }
    }
}

const KEYWORDS: &[&str] = &[
    "let", "in", "each", "if", "then", "else", "and", "or", "not", "true", "false", "null", "type",
];

pub fn is_keyword(s: &str) -> bool {
    KEYWORDS.contains(&s)
}

pub struct Tokenizer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, TokenizerError> {
        let mut out = Vec::new();
        while let Some(tok) = self.next_token()? {
            out.push(tok);
        }
        Ok(out)
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, off: usize) -> Option<u8> {
        self.src.get(self.pos + off).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn err(&self, message: impl Into<String>) -> TokenizerError {
        TokenizerError {
            message: message.into(),
            pos: self.pos,
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_ascii_whitespace() => {
                    self.pos += 1;
                }
                // // line comment
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>, TokenizerError> {
        self.skip_trivia();
        let start = self.pos;
        let Some(c) = self.peek() else {
            return Ok(None);
        };

        if c.is_ascii_digit() {
            return self.lex_number(start).map(Some);
        }
        if c == b'"' {
            return self.lex_string(start).map(Some);
        }
        if c == b'#' {
            return self.lex_hash(start).map(Some);
        }
        if c.is_ascii_alphabetic() || c == b'_' {
            return Ok(Some(self.lex_ident(start)));
        }

        // Multi-byte operators first.
        for op in ["<=", ">=", "<>"] {
            if self.src[self.pos..].starts_with(op.as_bytes()) {
                self.pos += 2;
                return Ok(Some(Token::new(TokenKind::Punct, op, start)));
            }
        }
        match c {
            b'(' | b')' | b'{' | b'}' | b'[' | b']' | b',' | b'=' | b'<' | b'>' | b'+' | b'-'
            | b'*' | b'/' | b'&' => {
                self.bump();
                return Ok(Some(Token::new(
                    TokenKind::Punct,
                    (c as char).to_string(),
                    start,
                )));
            }
            _ => {}
        }
        Err(self.err(format!("unexpected character '{}'", c as char)))
    }

    fn lex_number(&mut self, start: usize) -> Result<Token, TokenizerError> {
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek() == Some(b'.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            let mut ahead = 1;
            if matches!(self.peek_at(1), Some(b'+') | Some(b'-')) {
                ahead = 2;
            }
            if self.peek_at(ahead).is_some_and(|c| c.is_ascii_digit()) {
                self.pos += ahead;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.err("invalid utf-8 in number"))?;
        Ok(Token::new(TokenKind::Number, text, start))
    }

    /// Double-quoted string; `""` escapes a quote.
    fn lex_string(&mut self, start: usize) -> Result<Token, TokenizerError> {
        self.bump();
        let mut text = String::new();
        loop {
            match self.bump() {
                None => return Err(self.err("unterminated string literal")),
                Some(b'"') => {
                    if self.peek() == Some(b'"') {
                        self.bump();
                        text.push('"');
                    } else {
                        break;
                    }
                }
                Some(c) => {
                    // Re-assemble multi-byte UTF-8 sequences untouched.
                    text.push(c as char);
                    if c >= 0x80 {
                        text.pop();
                        let mut seq = vec![c];
                        while self.peek().is_some_and(|b| b & 0xC0 == 0x80) {
                            seq.push(self.bump().unwrap_or_default());
                        }
                        text.push_str(std::str::from_utf8(&seq).unwrap_or("\u{FFFD}"));
                    }
                }
            }
        }
        Ok(Token::new(TokenKind::Str, text, start))
    }

    /// `#date`-style intrinsic names and `#"quoted step names"`.
    fn lex_hash(&mut self, start: usize) -> Result<Token, TokenizerError> {
        self.bump();
        if self.peek() == Some(b'"') {
            let inner = self.lex_string(self.pos)?;
            let mut tok = Token::new(TokenKind::Ident, inner.text, start);
            tok.quoted = true;
            return Ok(tok);
        }
        if !self.peek().is_some_and(|c| c.is_ascii_alphabetic()) {
            return Err(self.err("expected identifier after '#'"));
        }
        while self.peek().is_some_and(|c| c.is_ascii_alphanumeric()) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.err("invalid utf-8 in identifier"))?;
        Ok(Token::new(TokenKind::Ident, text, start))
    }

    fn lex_ident(&mut self, start: usize) -> Token {
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_')
        {
            self.pos += 1;
        }
        // Dotted paths (`Text.Upper`, `JoinKind.LeftOuter`) are one token.
        while self.peek() == Some(b'.')
            && self.peek_at(1).is_some_and(|c| c.is_ascii_alphabetic())
        {
            self.pos += 1;
            while self
                .peek()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_')
            {
                self.pos += 1;
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or_default();
        let kind = if is_keyword(text) {
            TokenKind::Keyword
        } else {
            TokenKind::Ident
        };
        Token::new(kind, text, start)
    }
}

pub fn tokenize(src: &str) -> Result<Vec<Token>, TokenizerError> {
    Tokenizer::new(src).tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<(TokenKind, String)> {
        tokenize(src)
            .unwrap()
            .into_iter()
            .map(|t| (t.kind, t.text))
            .collect()
    }

    #[test]
    fn dotted_identifiers_are_single_tokens() {
        let toks = kinds("Text.Upper([Name])");
        assert_eq!(toks[0], (TokenKind::Ident, "Text.Upper".to_string()));
        assert_eq!(toks[1], (TokenKind::Punct, "(".to_string()));
        assert_eq!(toks[2], (TokenKind::Punct, "[".to_string()));
    }

    #[test]
    fn quoted_step_names() {
        let toks = tokenize(r#"#"Filtered Rows""#).unwrap();
        assert_eq!(toks.len(), 1);
        assert_eq!(toks[0].text, "Filtered Rows");
        assert!(toks[0].quoted);
    }

    #[test]
    fn string_escapes_double_quote() {
        let toks = tokenize(r#""he said ""hi""""#).unwrap();
        assert_eq!(toks[0].text, "he said \"hi\"");
    }

    #[test]
    fn comparison_operators() {
        let toks = kinds("a <= b <> c");
        assert_eq!(toks[1].1, "<=");
        assert_eq!(toks[3].1, "<>");
    }

    #[test]
    fn keywords_are_tagged() {
        let toks = kinds("if x then 1 else 2");
        assert_eq!(toks[0].0, TokenKind::Keyword);
        assert_eq!(toks[2].0, TokenKind::Keyword);
    }
}
