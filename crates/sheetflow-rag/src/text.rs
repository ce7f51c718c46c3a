//! Canonical chunk text rendering.
//!
//! The rendered string is the embedding input and the content-hash
//! basis, so every branch here must be deterministic. Formatting is
//! hardcoded per concrete value kind; cell values never get to supply
//! their own stringification.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as Json;
use sheetflow_common::{Value, cell_a1};

use crate::chunk::{Chunk, ChunkKind};
use crate::normalize::NormalizedCell;

#[derive(Debug, Clone, Copy)]
pub struct TextOptions {
    pub sample_rows: usize,
    pub max_columns_for_schema: usize,
    pub max_formula_samples: usize,
    /// Cell text beyond this many characters is cut with a `...` suffix.
    pub max_cell_chars: usize,
    pub max_pre_header_rows: usize,
}

impl Default for TextOptions {
    fn default() -> Self {
        Self {
            sample_rows: 5,
            max_columns_for_schema: 16,
            max_formula_samples: 12,
            max_cell_chars: 60,
            max_pre_header_rows: 2,
        }
    }
}

static TITLE_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(summary|report|overview|dashboard|analysis|results|totals)\b").unwrap()
});

/* ─────────────────────────── value rendering ──────────────────────── */

fn clip(s: String, max: usize) -> String {
    if s.chars().count() <= max {
        s
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}

/// `|` would break the rendered grammar; swap it for a broken bar.
fn escape_pipes(s: String) -> String {
    if s.contains('|') {
        s.replace('|', "\u{00A6}")
    } else {
        s
    }
}

fn value_to_json(v: &Value) -> Json {
    match v {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::from(*i),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::Text(s) => Json::String(s.clone()),
        Value::Date(d) => Json::String(d.format("%Y-%m-%d").to_string()),
        Value::DateTime(dt) => Json::String(dt.format("%Y-%m-%dT%H:%M:%S").to_string()),
        Value::Time(t) => Json::String(t.format("%H:%M:%S").to_string()),
        Value::Duration(_) | Value::Decimal(_) => Json::String(v.to_string()),
        Value::Binary(_) => Json::String("[Binary]".to_string()),
        Value::Record(fields) => Json::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), value_to_json(v)))
                .collect(),
        ),
        Value::Table(t) => Json::String(format!("[Table {}x{}]", t.row_count(), t.column_count())),
    }
}

/// Deterministic display for one cell value inside the rendered text.
pub fn format_cell_value(v: &Value, opts: &TextOptions) -> String {
    let rendered = match v {
        Value::Record(fields) => {
            // Prefer a `text` field when it is a string.
            match fields.iter().find(|(k, _)| k == "text") {
                Some((_, Value::Text(s))) => s.clone(),
                _ => image_envelope_alt(fields)
                    .unwrap_or_else(|| value_to_json(v).to_string()),
            }
        }
        Value::Binary(_) => "[Binary]".to_string(),
        other => other.to_string(),
    };
    clip(escape_pipes(rendered), opts.max_cell_chars)
}

/// `{type:"image", value:{imageId, altText?}}` → alt text or `[Image]`.
fn image_envelope_alt(fields: &[(String, Value)]) -> Option<String> {
    let ty = fields.iter().find(|(k, _)| k == "type")?;
    if !matches!(&ty.1, Value::Text(s) if s == "image") {
        return None;
    }
    let alt = fields.iter().find_map(|(k, v)| match (k.as_str(), v) {
        ("value", Value::Record(inner)) => inner.iter().find_map(|(ik, iv)| {
            match (ik.as_str(), iv) {
                ("altText", Value::Text(s)) if !s.is_empty() => Some(s.clone()),
                _ => None,
            }
        }),
        _ => None,
    });
    Some(alt.unwrap_or_else(|| "[Image]".to_string()))
}

/* ─────────────────────────── header analysis ──────────────────────── */

fn cell_text(cell: &NormalizedCell) -> Option<String> {
    cell.v.as_ref().map(|v| v.to_string()).filter(|s| !s.is_empty())
}

fn non_empty_count(row: &[NormalizedCell]) -> usize {
    row.iter().filter(|c| c.is_non_empty()).count()
}

fn stringish_ratio(row: &[NormalizedCell]) -> f64 {
    let non_empty: Vec<&NormalizedCell> = row.iter().filter(|c| c.is_non_empty()).collect();
    if non_empty.is_empty() {
        return 0.0;
    }
    let stringish = non_empty
        .iter()
        .filter(|c| matches!(&c.v, Some(Value::Text(_)) | None))
        .count();
    stringish as f64 / non_empty.len() as f64
}

fn is_header_row(row: &[NormalizedCell]) -> bool {
    non_empty_count(row) >= 2 && stringish_ratio(row) >= 0.6
}

/// A title row is a single long / punctuated / multi-word label (or a
/// recognized keyword) sitting above the actual headers.
fn is_title_row(row: &[NormalizedCell]) -> bool {
    if non_empty_count(row) != 1 {
        return false;
    }
    let Some(text) = row.iter().find_map(cell_text) else {
        return false;
    };
    TITLE_KEYWORDS.is_match(&text)
        || text.chars().count() > 20
        || text.split_whitespace().count() >= 3
        || text.contains(':')
}

struct HeaderLayout {
    /// Rows above the header that render as PRE-HEADER ROWS.
    pre_header_rows: usize,
    /// Index of the header row in the extracted cells, when present.
    header_row: Option<usize>,
}

fn detect_header_layout(cells: &[Vec<NormalizedCell>]) -> HeaderLayout {
    let scan = cells.len().min(5);
    for idx in 0..scan {
        if is_header_row(&cells[idx]) {
            let titles_above = cells[..idx].iter().all(|r| is_title_row(r));
            if idx == 0 || titles_above {
                return HeaderLayout {
                    pre_header_rows: idx,
                    header_row: Some(idx),
                };
            }
            break;
        }
    }
    HeaderLayout {
        pre_header_rows: 0,
        header_row: None,
    }
}

/// Dedup headers the schema-line way: `x, x_2, x_3`; empty becomes
/// `Column<N>`; `=` is rewritten to `≡` so formula markers can't leak.
fn schema_headers(raw: &[Option<String>]) -> Vec<String> {
    let mut taken: rustc_hash::FxHashMap<String, usize> = rustc_hash::FxHashMap::default();
    let mut out = Vec::with_capacity(raw.len());
    for (i, name) in raw.iter().enumerate() {
        let base = name
            .clone()
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.replace('=', "\u{2261}"))
            .unwrap_or_else(|| format!("Column{}", i + 1));
        let n = taken.entry(base.clone()).or_insert(0);
        *n += 1;
        out.push(if *n == 1 {
            base
        } else {
            format!("{base}_{n}")
        });
    }
    out
}

fn column_type(cells: &[Vec<NormalizedCell>], body_start: usize, col: usize) -> &'static str {
    let mut seen: Option<&'static str> = None;
    for row in cells.iter().skip(body_start) {
        let Some(cell) = row.get(col) else { continue };
        let Some(v) = &cell.v else { continue };
        let ty = match v {
            Value::Text(_) => "string",
            Value::Int(_) | Value::Number(_) | Value::Decimal(_) => "number",
            Value::Bool(_) => "boolean",
            Value::Date(_) => "date",
            Value::DateTime(_) => "datetime",
            Value::Time(_) => "time",
            Value::Duration(_) => "duration",
            Value::Binary(_) => "binary",
            _ => "any",
        };
        match seen {
            None => seen = Some(ty),
            Some(prev) if prev == ty => {}
            Some(_) => return "any",
        }
    }
    seen.unwrap_or("any")
}

/* ─────────────────────────────── render ───────────────────────────── */

pub fn chunk_to_text(chunk: &Chunk, opts: &TextOptions) -> String {
    let extracted_rows = chunk.cells.len();
    let extracted_cols = chunk.cells.iter().map(Vec::len).max().unwrap_or(0);
    let full_rows = chunk.rect.rows();
    let full_cols = chunk.rect.cols();

    let formula_count: usize = chunk
        .cells
        .iter()
        .flatten()
        .filter(|c| c.has_formula())
        .count();

    let mut lines: Vec<String> = Vec::new();
    lines.push(format!(
        "{}: {} (sheet=\"{}\", range=\"{}\", size={}x{}, formulas\u{2248}{})",
        chunk.kind.label(),
        escape_pipes(chunk.title.clone()),
        chunk.sheet_name,
        chunk.rect.to_a1(),
        full_rows,
        full_cols,
        formula_count,
    ));

    let sampled = (extracted_rows as u64) < full_rows || (extracted_cols as u64) < full_cols;
    if sampled {
        lines.push(format!(
            "NOTE: embedding uses a {extracted_rows}x{extracted_cols} cell sample (full range is {full_rows}x{full_cols})."
        ));
    }

    let layout = detect_header_layout(&chunk.cells);

    // COLUMNS
    let header_texts: Vec<Option<String>> = match layout.header_row {
        Some(h) => (0..extracted_cols)
            .map(|c| chunk.cells[h].get(c).and_then(cell_text))
            .collect(),
        None => vec![None; extracted_cols],
    };
    let headers = schema_headers(&header_texts);
    let body_start = layout.header_row.map(|h| h + 1).unwrap_or(0);

    let shown_cols = headers.len().min(opts.max_columns_for_schema);
    if shown_cols > 0 {
        let mut parts: Vec<String> = (0..shown_cols)
            .map(|c| format!("{} ({})", headers[c], column_type(&chunk.cells, body_start, c)))
            .collect();
        // The hidden-column count is measured against the full rect.
        if (full_cols as usize) > shown_cols {
            parts.push(format!("\u{2026} (+{} more columns)", full_cols as usize - shown_cols));
        }
        lines.push(format!("COLUMNS: {}", parts.join(" | ")));
    }

    // PRE-HEADER ROWS
    if layout.pre_header_rows > 0 {
        lines.push("PRE-HEADER ROWS:".to_string());
        let emit = layout.pre_header_rows.min(opts.max_pre_header_rows);
        for row in &chunk.cells[..emit] {
            let keys: Vec<String> = row
                .iter()
                .filter_map(|c| cell_text(c).map(|s| clip(escape_pipes(s), opts.max_cell_chars)))
                .collect();
            lines.push(keys.join(" | "));
        }
        if layout.pre_header_rows > emit {
            lines.push(format!(
                "\u{2026} (+{} more pre-header rows)",
                layout.pre_header_rows - emit
            ));
        }
    }

    if chunk.kind == ChunkKind::FormulaRegion {
        render_formulas(chunk, opts, &mut lines);
    } else {
        render_sample_rows(chunk, opts, &headers, body_start, shown_cols, &mut lines);
    }

    lines.join("\n")
}

fn render_sample_rows(
    chunk: &Chunk,
    opts: &TextOptions,
    headers: &[String],
    body_start: usize,
    shown_cols: usize,
    lines: &mut Vec<String>,
) {
    let body = &chunk.cells[body_start.min(chunk.cells.len())..];
    if body.is_empty() || shown_cols == 0 {
        return;
    }
    lines.push("SAMPLE ROWS:".to_string());
    let emit = body.len().min(opts.sample_rows);
    for row in &body[..emit] {
        let mut parts: Vec<String> = Vec::with_capacity(shown_cols);
        for c in 0..shown_cols {
            let header = &headers[c];
            let cell = row.get(c).cloned().unwrap_or_default();
            let part = match (&cell.f, &cell.v) {
                (Some(f), Some(v)) => format!(
                    "{header}({})={}",
                    clip(escape_pipes(f.clone()), opts.max_cell_chars),
                    format_cell_value(v, opts)
                ),
                // No computed value: the trailing `=` is omitted.
                (Some(f), None) => {
                    format!("{header}({})", clip(escape_pipes(f.clone()), opts.max_cell_chars))
                }
                (None, Some(v)) => format!("{header}={}", format_cell_value(v, opts)),
                (None, None) => format!("{header}="),
            };
            parts.push(part);
        }
        lines.push(parts.join(" | "));
    }

    // Unsampled rows are measured against the full rect height.
    let total_body_rows = chunk.rect.rows().saturating_sub(body_start as u64) as usize;
    if total_body_rows > emit {
        lines.push(format!("\u{2026} (+{} more rows)", total_body_rows - emit));
    }
}

fn render_formulas(chunk: &Chunk, opts: &TextOptions, lines: &mut Vec<String>) {
    let mut samples: Vec<String> = Vec::new();
    let mut total = 0usize;
    for (r, row) in chunk.cells.iter().enumerate() {
        for (c, cell) in row.iter().enumerate() {
            let Some(f) = &cell.f else { continue };
            total += 1;
            if samples.len() >= opts.max_formula_samples {
                continue;
            }
            let addr = cell_a1(chunk.rect.r0 + r as u64, chunk.rect.c0 + c as u64);
            let formula = clip(escape_pipes(f.clone()), opts.max_cell_chars);
            let rendered = match &cell.v {
                Some(v) => format!("{addr}:{formula}={}", format_cell_value(v, opts)),
                None => format!("{addr}:{formula}"),
            };
            samples.push(rendered);
        }
    }
    if samples.is_empty() {
        return;
    }
    let mut line = format!("FORMULAS: {}", samples.join(" | "));
    if total > samples.len() {
        line.push_str(&format!(" \u{2026} (+{} more formulas)", total - samples.len()));
    }
    lines.push(line);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkMeta, chunk_id};
    use crate::normalize::normalize_raw;
    use crate::workbook::RawCell;
    use sheetflow_common::Rect;

    fn cells_of(rows: &[&[RawCell]]) -> Vec<Vec<NormalizedCell>> {
        rows.iter()
            .map(|r| r.iter().map(normalize_raw).collect())
            .collect()
    }

    fn chunk(kind: ChunkKind, rect: Rect, cells: Vec<Vec<NormalizedCell>>) -> Chunk {
        Chunk {
            id: chunk_id("wb", "S", kind, "t"),
            workbook_id: "wb".into(),
            sheet_name: "S".into(),
            kind,
            title: "T".into(),
            rect,
            cells,
            meta: ChunkMeta::default(),
        }
    }

    #[test]
    fn sample_rows_render_header_value_pairs() {
        let cells = cells_of(&[
            &[
                RawCell::value("Region"),
                RawCell::value("Revenue"),
                RawCell::value("Units"),
            ],
            &[
                RawCell::value("North"),
                RawCell::value(1200),
                RawCell::value(10),
            ],
        ]);
        let c = chunk(ChunkKind::Table, Rect::new(0, 0, 1, 2), cells);
        let text = chunk_to_text(
            &c,
            &TextOptions {
                sample_rows: 1,
                ..TextOptions::default()
            },
        );
        assert!(text.contains("Region=North"), "{text}");
        assert!(text.contains("Revenue=1200"), "{text}");
        assert!(text.contains("Units=10"), "{text}");
        assert!(!text.contains("PRE-HEADER ROWS:"), "{text}");
        assert!(text.contains("COLUMNS: Region (string) | Revenue (number) | Units (number)"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let cells = cells_of(&[
            &[RawCell::value("A"), RawCell::value("B")],
            &[RawCell::value(1), RawCell::value(2)],
        ]);
        let c = chunk(ChunkKind::Table, Rect::new(0, 0, 1, 1), cells);
        let opts = TextOptions::default();
        assert_eq!(chunk_to_text(&c, &opts), chunk_to_text(&c, &opts));
    }

    #[test]
    fn title_row_becomes_pre_header() {
        let cells = cells_of(&[
            &[RawCell::value("Quarterly Sales Summary"), RawCell::Empty],
            &[RawCell::value("Region"), RawCell::value("Total")],
            &[RawCell::value("North"), RawCell::value(5)],
        ]);
        let c = chunk(ChunkKind::DataRegion, Rect::new(0, 0, 2, 1), cells);
        let text = chunk_to_text(&c, &TextOptions::default());
        assert!(text.contains("PRE-HEADER ROWS:"), "{text}");
        assert!(text.contains("Quarterly Sales Summary"), "{text}");
        assert!(text.contains("COLUMNS: Region (string) | Total (number)"));
    }

    #[test]
    fn formula_chunks_render_addresses_and_values() {
        let cells = cells_of(&[&[
            RawCell::formula_with_value("SUM(B2:B3)", 300),
            RawCell::formula("A1*2"),
        ]]);
        let c = chunk(ChunkKind::FormulaRegion, Rect::new(0, 0, 0, 1), cells);
        let text = chunk_to_text(&c, &TextOptions::default());
        assert!(text.contains("FORMULAS: A1:=SUM(B2:B3)=300 | B1:=A1*2"), "{text}");
    }

    #[test]
    fn pipes_in_cells_are_replaced() {
        let cells = cells_of(&[
            &[RawCell::value("H1"), RawCell::value("H2")],
            &[RawCell::value("a|b"), RawCell::value("c")],
        ]);
        let c = chunk(ChunkKind::Table, Rect::new(0, 0, 1, 1), cells);
        let text = chunk_to_text(&c, &TextOptions::default());
        assert!(!text.contains("a|b"), "{text}");
        assert!(text.contains("a\u{00A6}b"), "{text}");
    }

    #[test]
    fn note_line_reports_sampling() {
        let cells = cells_of(&[
            &[RawCell::value("A"), RawCell::value("B")],
            &[RawCell::value(1), RawCell::value(2)],
        ]);
        // Full rect is much larger than the extracted sample.
        let c = chunk(ChunkKind::Table, Rect::new(0, 0, 99, 9), cells);
        let text = chunk_to_text(&c, &TextOptions::default());
        assert!(
            text.contains("NOTE: embedding uses a 2x2 cell sample (full range is 100x10)."),
            "{text}"
        );
    }

    #[test]
    fn headers_dedupe_and_escape_equals() {
        let raw = vec![
            Some("x".to_string()),
            Some("x".to_string()),
            None,
            Some("a=b".to_string()),
        ];
        assert_eq!(
            schema_headers(&raw),
            vec!["x", "x_2", "Column3", "a\u{2261}b"]
        );
    }

    #[test]
    fn hidden_columns_count_against_full_rect_width() {
        let header: Vec<RawCell> = (0..6).map(|i| RawCell::value(format!("H{i}"))).collect();
        let body: Vec<RawCell> = (0..6).map(|i| RawCell::value(i)).collect();
        let cells = cells_of(&[&header, &body]);
        // Rect is 30 columns wide even though only 6 were extracted.
        let c = chunk(ChunkKind::Table, Rect::new(0, 0, 1, 29), cells);
        let text = chunk_to_text(
            &c,
            &TextOptions {
                max_columns_for_schema: 4,
                ..TextOptions::default()
            },
        );
        assert!(text.contains("\u{2026} (+26 more columns)"), "{text}");
    }
}
