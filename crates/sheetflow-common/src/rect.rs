//! Rectangles and A1 addressing for workbook regions.
//!
//! Coordinates are absolute and zero-based. Row indices are `u64`
//! because sparse sheets can legitimately carry cells at row indices in
//! the billions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// `{r0,c0,r1,c1}` with `r0 <= r1`, `c0 <= c1`, zero-based inclusive.
///
/// The alternate `{startRow,startCol,endRow,endCol}` field spelling is
/// accepted on deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    #[serde(alias = "startRow")]
    pub r0: u64,
    #[serde(alias = "startCol")]
    pub c0: u64,
    #[serde(alias = "endRow")]
    pub r1: u64,
    #[serde(alias = "endCol")]
    pub c1: u64,
}

impl Rect {
    pub fn new(r0: u64, c0: u64, r1: u64, c1: u64) -> Self {
        Self { r0, c0, r1, c1 }
    }

    pub fn single(row: u64, col: u64) -> Self {
        Self::new(row, col, row, col)
    }

    pub fn rows(&self) -> u64 {
        self.r1 - self.r0 + 1
    }

    pub fn cols(&self) -> u64 {
        self.c1 - self.c0 + 1
    }

    pub fn area(&self) -> u128 {
        self.rows() as u128 * self.cols() as u128
    }

    pub fn contains(&self, row: u64, col: u64) -> bool {
        row >= self.r0 && row <= self.r1 && col >= self.c0 && col <= self.c1
    }

    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let r0 = self.r0.max(other.r0);
        let c0 = self.c0.max(other.c0);
        let r1 = self.r1.min(other.r1);
        let c1 = self.c1.min(other.c1);
        (r0 <= r1 && c0 <= c1).then_some(Rect::new(r0, c0, r1, c1))
    }

    /// Intersection area divided by the smaller of the two areas. Used
    /// by the chunker's overlap suppression.
    pub fn overlap_ratio(&self, other: &Rect) -> f64 {
        match self.intersection(other) {
            None => 0.0,
            Some(i) => i.area() as f64 / self.area().min(other.area()) as f64,
        }
    }

    pub fn grow_to_include(&mut self, row: u64, col: u64) {
        self.r0 = self.r0.min(row);
        self.c0 = self.c0.min(col);
        self.r1 = self.r1.max(row);
        self.c1 = self.c1.max(col);
    }

    /// `A1:B3`-style address for this rect alone.
    pub fn to_a1(&self) -> String {
        let start = cell_a1(self.r0, self.c0);
        if self.r0 == self.r1 && self.c0 == self.c1 {
            start
        } else {
            format!("{start}:{}", cell_a1(self.r1, self.c1))
        }
    }

    /// Full address with a sheet prefix, quoting the sheet name when it
    /// needs it: `'Bob''s Sheet'!A1:B2`.
    pub fn to_a1_on(&self, sheet: &str) -> String {
        format!("{}!{}", quote_sheet_name(sheet), self.to_a1())
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_a1())
    }
}

/// Zero-based column index to `A`, `Z`, `AA`, … letters.
pub fn col_letters(col: u64) -> String {
    let mut n = col + 1;
    let mut out = Vec::new();
    while n > 0 {
        let rem = ((n - 1) % 26) as u8;
        out.push(b'A' + rem);
        n = (n - 1) / 26;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Zero-based (row, col) to a 1-based A1 cell address.
pub fn cell_a1(row: u64, col: u64) -> String {
    format!("{}{}", col_letters(col), row + 1)
}

fn sheet_needs_quoting(name: &str) -> bool {
    name.is_empty()
        || name.chars().next().is_some_and(|c| c.is_ascii_digit())
        || name
            .chars()
            .any(|c| !(c.is_alphanumeric() || c == '_' || c == '.'))
}

/// Quote a sheet name for use in an address when it contains spaces,
/// quotes (doubled inside), or reserved punctuation.
pub fn quote_sheet_name(name: &str) -> String {
    if sheet_needs_quoting(name) {
        format!("'{}'", name.replace('\'', "''"))
    } else {
        name.to_string()
    }
}
