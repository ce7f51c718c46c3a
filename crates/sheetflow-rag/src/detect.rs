//! 4-neighbor connected-component region detection.
//!
//! Works identically over dense and sparse sheets and never allocates a
//! `rows × cols` visited grid: membership and the visited set are hash
//! sets of packed coordinates. Coordinates outside the packable range
//! degrade deterministically to string keys; the key kind is derived
//! per-cell from its coordinates, so components connect across the
//! representation boundary.

use rustc_hash::{FxHashMap, FxHashSet};
use sheetflow_common::{CancelToken, FlowError, Rect};
use tracing::debug;

use crate::normalize::{NormalizedCell, SheetReader};

/// 21 bits of column index; rows keep the remaining 42 bits of a
/// packed `u64`.
const PACK_COL_BITS: u32 = 21;
const PACK_COL_LIMIT: u64 = 1 << PACK_COL_BITS;
const PACK_ROW_LIMIT: u64 = 1 << (63 - PACK_COL_BITS);

/// Cell key: packed integer within range, string beyond it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CellKey {
    Packed(u64),
    Text(Box<str>),
}

pub fn cell_key(row: u64, col: u64) -> CellKey {
    if row < PACK_ROW_LIMIT && col < PACK_COL_LIMIT {
        CellKey::Packed((row << PACK_COL_BITS) | col)
    } else {
        CellKey::Text(format!("{row}:{col}").into_boxed_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedRegion {
    pub rect: Rect,
    pub cell_count: usize,
    /// Set on the synthesized fallback region when the candidate cell
    /// count exceeded the detection limit.
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct DetectOptions {
    /// Above this many candidate cells, detection degrades to a single
    /// synthesized bounding region flagged `truncated`.
    pub cell_limit: usize,
    /// Hard cap on regions reported per sheet.
    pub max_regions_per_sheet: usize,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            cell_limit: 200_000,
            max_regions_per_sheet: 64,
        }
    }
}

pub fn is_non_empty(cell: &NormalizedCell) -> bool {
    cell.is_non_empty()
}

pub fn is_formula(cell: &NormalizedCell) -> bool {
    cell.has_formula()
}

/// Connected components of predicate-matching cells, as rects in
/// deterministic `(r0, c0, r1, c1)` lexicographic order. Trivial
/// single-cell components are dropped.
pub fn detect_regions(
    reader: &SheetReader<'_>,
    predicate: fn(&NormalizedCell) -> bool,
    opts: &DetectOptions,
    cancel: &CancelToken,
) -> Result<Vec<DetectedRegion>, FlowError> {
    let mut members: FxHashMap<CellKey, (u64, u64)> = FxHashMap::default();
    let mut checked = 0usize;
    for (row, col) in reader.candidate_cells() {
        checked += 1;
        if checked % 4096 == 0 {
            cancel.check()?;
        }
        if predicate(&reader.get(row, col)) {
            members.insert(cell_key(row, col), (row, col));
        }
    }

    if members.len() > opts.cell_limit {
        debug!(
            cells = members.len(),
            limit = opts.cell_limit,
            "cell limit exceeded, synthesizing bounding region"
        );
        let mut rect: Option<Rect> = None;
        for &(row, col) in members.values() {
            match &mut rect {
                None => rect = Some(Rect::single(row, col)),
                Some(r) => r.grow_to_include(row, col),
            }
        }
        return Ok(rect
            .map(|rect| DetectedRegion {
                rect,
                cell_count: members.len(),
                truncated: true,
            })
            .into_iter()
            .collect());
    }

    let mut ordered: Vec<(u64, u64)> = members.values().copied().collect();
    ordered.sort_unstable();

    let mut visited: FxHashSet<CellKey> = FxHashSet::default();
    let mut regions: Vec<DetectedRegion> = Vec::new();
    let mut stack: Vec<(u64, u64)> = Vec::new();

    for &(row, col) in &ordered {
        if visited.contains(&cell_key(row, col)) {
            continue;
        }
        cancel.check()?;
        let mut rect = Rect::single(row, col);
        let mut count = 0usize;
        stack.push((row, col));
        visited.insert(cell_key(row, col));
        while let Some((r, c)) = stack.pop() {
            count += 1;
            rect.grow_to_include(r, c);
            let neighbors = [
                (r.wrapping_sub(1), c),
                (r + 1, c),
                (r, c.wrapping_sub(1)),
                (r, c + 1),
            ];
            for (nr, nc) in neighbors {
                if nr == u64::MAX || nc == u64::MAX {
                    continue;
                }
                let key = cell_key(nr, nc);
                if members.contains_key(&key) && visited.insert(key) {
                    stack.push((nr, nc));
                }
            }
        }
        if count > 1 {
            regions.push(DetectedRegion {
                rect,
                cell_count: count,
                truncated: false,
            });
        }
    }

    regions.sort_by_key(|r| (r.rect.r0, r.rect.c0, r.rect.r1, r.rect.c1));
    regions.truncate(opts.max_regions_per_sheet);
    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workbook::{RawCell, Sheet};
    use rustc_hash::FxHashMap;

    fn sparse(cells: &[((u64, u64), &str)]) -> Sheet {
        let mut map = FxHashMap::default();
        for ((r, c), v) in cells {
            map.insert(format!("{r},{c}"), RawCell::value(*v));
        }
        Sheet::sparse("S", map)
    }

    fn detect(sheet: &Sheet) -> Vec<DetectedRegion> {
        detect_regions(
            &SheetReader::new(sheet),
            is_non_empty,
            &DetectOptions::default(),
            &CancelToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn separate_components_yield_separate_regions() {
        let sheet = sparse(&[
            ((0, 0), "a"),
            ((0, 1), "b"),
            ((1, 0), "c"),
            ((10, 10), "x"),
            ((10, 11), "y"),
        ]);
        let regions = detect(&sheet);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].rect, Rect::new(0, 0, 1, 1));
        assert_eq!(regions[1].rect, Rect::new(10, 10, 10, 11));
    }

    #[test]
    fn single_cell_components_are_dropped() {
        let sheet = sparse(&[((5, 5), "lonely"), ((0, 0), "a"), ((0, 1), "b")]);
        let regions = detect(&sheet);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].rect, Rect::new(0, 0, 0, 1));
    }

    #[test]
    fn huge_row_indices_stay_sparse() {
        // Two adjacent cells at row nine billion; a dense visited grid
        // would be hopeless here.
        let sheet = sparse(&[((9_000_000_000, 0), "A"), ((9_000_000_000, 1), "B")]);
        let regions = detect(&sheet);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].rect, Rect::new(9_000_000_000, 0, 9_000_000_000, 1));
        assert_eq!(regions[0].cell_count, 2);
    }

    #[test]
    fn components_connect_across_the_key_representation_boundary() {
        let row = PACK_ROW_LIMIT - 1;
        let sheet = sparse(&[((row, 0), "a"), ((row + 1, 0), "b")]);
        assert!(matches!(cell_key(row, 0), CellKey::Packed(_)));
        assert!(matches!(cell_key(row + 1, 0), CellKey::Text(_)));
        let regions = detect(&sheet);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].rect, Rect::new(row, 0, row + 1, 0));
    }

    #[test]
    fn cell_limit_synthesizes_truncated_region() {
        let cells: Vec<((u64, u64), &str)> =
            (0..50).map(|i| ((i / 10, i % 10), "x")).collect();
        let sheet = sparse(&cells);
        let regions = detect_regions(
            &SheetReader::new(&sheet),
            is_non_empty,
            &DetectOptions {
                cell_limit: 10,
                max_regions_per_sheet: 64,
            },
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(regions.len(), 1);
        assert!(regions[0].truncated);
        assert_eq!(regions[0].rect, Rect::new(0, 0, 4, 9));
    }

    #[test]
    fn formula_predicate_selects_formula_cells_only() {
        let mut map = FxHashMap::default();
        map.insert("0,0".to_string(), RawCell::value(1));
        map.insert("0,1".to_string(), RawCell::formula("=A1"));
        map.insert("0,2".to_string(), RawCell::formula("=A1*2"));
        let sheet = Sheet::sparse("S", map);
        let regions = detect_regions(
            &SheetReader::new(&sheet),
            is_formula,
            &DetectOptions::default(),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].rect, Rect::new(0, 1, 0, 2));
    }
}
