//! Property tests for the operation algebra.

use proptest::prelude::*;
use sheetflow_common::{Column, Table, Value};
use sheetflow_engine::{NoQueries, apply_operation};
use sheetflow_parse::query::{Operation, SortKey};

fn small_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        (0i64..5).prop_map(Value::Int),
        (0i64..5).prop_map(|i| Value::Number(i as f64)),
        "[a-c]{1,2}".prop_map(Value::Text),
    ]
}

fn small_table() -> impl Strategy<Value = Table> {
    proptest::collection::vec(
        proptest::collection::vec(small_value(), 2..=2),
        0..12,
    )
    .prop_map(|rows| {
        Table::new(vec![Column::any("A"), Column::any("B")], rows).unwrap()
    })
}

fn apply(table: Table, op: Operation) -> Table {
    apply_operation(table, &op, &mut NoQueries).unwrap()
}

fn distinct() -> Operation {
    Operation::DistinctRows { columns: None }
}

fn sort_a() -> Operation {
    Operation::SortRows {
        sort_by: vec![SortKey::asc("A")],
    }
}

fn multiset(table: &Table) -> Vec<Vec<Value>> {
    let mut rows: Vec<Vec<Value>> = table.iter_rows().map(<[Value]>::to_vec).collect();
    rows.sort_by(|a, b| {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| x.compare(y))
            .find(|o| !o.is_eq())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    rows
}

proptest! {
    /// distinctRows of any permutation yields the same row multiset.
    #[test]
    fn distinct_is_permutation_invariant(table in small_table(), seed in any::<u64>()) {
        let mut rows: Vec<Vec<Value>> = table.iter_rows().map(<[Value]>::to_vec).collect();
        // Cheap deterministic shuffle.
        let n = rows.len();
        if n > 1 {
            for i in 0..n {
                let j = (seed as usize).wrapping_mul(31).wrapping_add(i * 7) % n;
                rows.swap(i, j);
            }
        }
        let permuted = Table::new(table.columns().to_vec(), rows).unwrap();

        let d1 = apply(table, distinct());
        let d2 = apply(permuted, distinct());
        prop_assert_eq!(multiset(&d1), multiset(&d2));
    }

    /// selectColumns is idempotent.
    #[test]
    fn select_columns_is_idempotent(table in small_table()) {
        let cols = vec!["B".to_string(), "A".to_string()];
        let once = apply(table, Operation::SelectColumns { columns: cols.clone() });
        let twice = apply(once.clone(), Operation::SelectColumns { columns: cols });
        prop_assert_eq!(once, twice);
    }

    /// Stable sort applied twice equals applied once.
    #[test]
    fn sort_is_idempotent(table in small_table()) {
        let once = apply(table, sort_a());
        let twice = apply(once.clone(), sort_a());
        prop_assert_eq!(once, twice);
    }

    /// Equal-key rows preserve their original relative order.
    #[test]
    fn sort_is_stable(keys in proptest::collection::vec(0i64..3, 0..20)) {
        let table = Table::new(
            vec![Column::any("A"), Column::any("Seq")],
            keys.iter()
                .enumerate()
                .map(|(i, a)| vec![Value::Int(*a), Value::Int(i as i64)])
                .collect(),
        ).unwrap();
        let sorted = apply(table, sort_a());
        // Within each key, the original sequence numbers stay increasing.
        let mut last_seq_per_key = std::collections::BTreeMap::new();
        for row in sorted.iter_rows() {
            let (Value::Int(a), Value::Int(s)) = (&row[0], &row[1]) else { unreachable!() };
            if let Some(prev) = last_seq_per_key.insert(*a, *s) {
                prop_assert!(prev < *s);
            }
        }
    }

    /// append row count is the sum; missing columns read null.
    #[test]
    fn append_row_counts_add(a in small_table(), b in small_table()) {
        let out = apply_operation(
            a.clone(),
            &Operation::Append { queries: vec!["b".into()] },
            &mut SingleTable(b.clone()),
        ).unwrap();
        prop_assert_eq!(out.row_count(), a.row_count() + b.row_count());
    }
}

struct SingleTable(Table);

impl sheetflow_engine::RightTableResolver for SingleTable {
    fn resolve(&mut self, _id: &str) -> Result<Table, sheetflow_engine::FlowError> {
        Ok(self.0.clone())
    }
}
