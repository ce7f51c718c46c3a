//! End-to-end pipeline scenarios through the public engine surface.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde_json::json;
use sheetflow_common::{CancelToken, FlowErrorKind, Value};
use sheetflow_engine::{
    Adapters, ApiAdapter, ApiRequest, ExecuteOptions, ExecutionContext, FlowError, QueryEngine,
    StreamOptions, Table,
};
use sheetflow_parse::query::{
    AggregateOp, Aggregation, CompareOp, FilterPredicate, JoinMode, JoinType, Operation, Query,
    SortKey, SourceSpec, Step,
};

fn range_source(values: Vec<Vec<Value>>) -> SourceSpec {
    SourceSpec::Range {
        values,
        has_headers: true,
    }
}

fn step(op: Operation) -> Step {
    Step::new(op)
}

fn date(y: i32, m: u32, d: u32) -> Value {
    Value::Date(chrono::NaiveDate::from_ymd_opt(y, m, d).unwrap())
}

#[test]
fn filter_group_sort_scenario() {
    let mut query = Query::new(
        "q1",
        "sales by region",
        range_source(vec![
            vec!["Region".into(), "Sales".into(), "Date".into()],
            vec!["East".into(), Value::Int(100), date(2024, 1, 1)],
            vec!["East".into(), Value::Int(150), date(2024, 1, 2)],
            vec!["West".into(), Value::Int(200), date(2024, 1, 3)],
        ]),
    );
    query.steps = vec![
        step(Operation::FilterRows {
            predicate: FilterPredicate::And {
                predicates: vec![
                    FilterPredicate::Comparison {
                        column: "Region".into(),
                        op: CompareOp::Equals,
                        value: Some("East".into()),
                        case_sensitive: None,
                    },
                    FilterPredicate::Comparison {
                        column: "Date".into(),
                        op: CompareOp::GreaterThanOrEqual,
                        value: Some(date(2024, 1, 2)),
                        case_sensitive: None,
                    },
                ],
            },
        }),
        step(Operation::GroupBy {
            keys: vec!["Region".into()],
            aggregations: vec![Aggregation {
                column: "Sales".into(),
                op: AggregateOp::Sum,
                rename: Some("Total Sales".into()),
            }],
        }),
        step(Operation::SortRows {
            sort_by: vec![SortKey::desc("Total Sales")],
        }),
    ];

    let engine = QueryEngine::new();
    let ctx = ExecutionContext::default();
    let table = engine
        .execute_query(&query, &ctx, &ExecuteOptions::default())
        .unwrap();

    let grid = table.to_grid(true);
    assert_eq!(
        grid,
        vec![
            vec![Value::Text("Region".into()), Value::Text("Total Sales".into())],
            vec![Value::Text("East".into()), Value::Number(150.0)],
        ]
    );
}

#[test]
fn merge_with_null_keys_scenario() {
    let right = Query::new(
        "codes",
        "codes",
        range_source(vec![
            vec!["Id".into(), "Region".into(), "Code".into()],
            vec![Value::Int(1), "East".into(), "A".into()],
            vec![Value::Int(1), "West".into(), "B".into()],
            vec![Value::Int(3), Value::Null, "C".into()],
        ]),
    );
    let mut left = Query::new(
        "sales",
        "sales",
        range_source(vec![
            vec!["Id".into(), "Region".into(), "Sales".into()],
            vec![Value::Int(1), "East".into(), Value::Int(100)],
            vec![Value::Int(1), "West".into(), Value::Int(200)],
            vec![Value::Int(2), "East".into(), Value::Int(300)],
            vec![Value::Int(3), Value::Null, Value::Int(400)],
        ]),
    );
    left.steps = vec![step(Operation::Merge {
        left_keys: vec!["Id".into(), "Region".into()],
        right_query: "codes".into(),
        right_keys: vec!["Id".into(), "Region".into()],
        join_type: JoinType::Left,
        join_mode: JoinMode::Flat,
        new_column_name: None,
        comparers: None,
        join_algorithm: Default::default(),
    })];

    let engine = QueryEngine::new();
    let mut ctx = ExecutionContext::default();
    ctx.add_query(right);

    let table = engine
        .execute_query(&left, &ctx, &ExecuteOptions::default())
        .unwrap();
    assert_eq!(table.row_count(), 4);
    let code = table.column_index("Code").unwrap();
    let codes: Vec<Value> = (0..4).map(|r| table.cell(r, code).clone()).collect();
    assert_eq!(
        codes,
        vec!["A".into(), "B".into(), Value::Null, "C".into()]
    );
}

/* ─────────────────────────── OData folding ────────────────────────── */

struct RecordingApi {
    urls: Mutex<Vec<String>>,
}

impl ApiAdapter for RecordingApi {
    fn fetch_table(&self, _request: &ApiRequest) -> Result<Table, FlowError> {
        unreachable!("odata goes through fetch_json")
    }

    fn fetch_json(&self, url: &str) -> Result<serde_json::Value, FlowError> {
        self.urls.lock().push(url.to_string());
        Ok(json!({
            "value": [
                { "Id": 1, "Name": "Widget" },
                { "Id": 2, "Name": "Gadget" },
            ]
        }))
    }
}

#[test]
fn odata_folding_issues_exact_url() {
    let api = Arc::new(RecordingApi {
        urls: Mutex::new(Vec::new()),
    });
    let mut ctx = ExecutionContext::default();
    ctx.adapters = Adapters {
        api: Some(api.clone()),
        ..Adapters::default()
    };

    let mut query = Query::new(
        "q",
        "products",
        SourceSpec::OData {
            url: "https://svc/products".into(),
        },
    );
    query.steps = vec![
        step(Operation::SelectColumns {
            columns: vec!["Id".into(), "Name".into()],
        }),
        step(Operation::FilterRows {
            predicate: FilterPredicate::Comparison {
                column: "Price".into(),
                op: CompareOp::GreaterThan,
                value: Some(Value::Int(20)),
                case_sensitive: None,
            },
        }),
    ];

    let engine = QueryEngine::new();
    let (table, meta) = engine
        .execute_query_with_meta(&query, &ctx, &ExecuteOptions::default())
        .unwrap();

    assert_eq!(meta.folded_steps, 2);
    assert_eq!(
        api.urls.lock().as_slice(),
        ["https://svc/products?$select=Id,Name&$filter=Price%20gt%2020"]
    );
    assert_eq!(table.row_count(), 2);
}

/* ──────────────────────── cancellation / misc ─────────────────────── */

#[test]
fn tripped_cancel_token_aborts_before_load() {
    let query = Query::new(
        "q",
        "q",
        range_source(vec![vec!["A".into()], vec![Value::Int(1)]]),
    );
    let cancel = CancelToken::new();
    cancel.cancel();
    let opts = ExecuteOptions {
        cancel,
        ..ExecuteOptions::default()
    };
    let err = QueryEngine::new()
        .execute_query(&query, &ExecutionContext::default(), &opts)
        .unwrap_err();
    assert_eq!(err.kind, FlowErrorKind::Abort);
}

#[test]
fn streaming_batches_cover_all_rows_in_order() {
    let mut rows = vec![vec!["N".into()]];
    rows.extend((0..10).map(|i| vec![Value::Int(i)]));
    let query = Query::new("q", "q", range_source(rows));

    let batches = AtomicUsize::new(0);
    let mut seen: Vec<i64> = Vec::new();
    let mut stream = StreamOptions {
        batch_size: 4,
        materialize: false,
        on_batch: &mut |batch| {
            batches.fetch_add(1, Ordering::SeqCst);
            for row in batch {
                if let Value::Int(i) = &row[0] {
                    seen.push(*i);
                }
            }
            Ok(())
        },
    };
    let out = QueryEngine::new()
        .execute_query_streaming(
            &query,
            &ExecutionContext::default(),
            &ExecuteOptions::default(),
            &mut stream,
        )
        .unwrap();
    drop(stream);
    assert_eq!(out.row_count(), 0);
    assert_eq!(batches.load(Ordering::SeqCst), 3);
    assert_eq!(seen, (0..10).collect::<Vec<i64>>());
}

#[test]
fn self_referencing_query_is_rejected() {
    let query = Query::new("loop", "loop", SourceSpec::QueryRef { id: "loop".into() });
    let mut ctx = ExecutionContext::default();
    ctx.add_query(query.clone());
    let err = QueryEngine::new()
        .execute_query(&query, &ctx, &ExecuteOptions::default())
        .unwrap_err();
    assert_eq!(err.kind, FlowErrorKind::InvalidArgument);
}

#[test]
fn unknown_column_error_names_the_step() {
    let mut query = Query::new(
        "q",
        "q",
        range_source(vec![vec!["A".into()], vec![Value::Int(1)]]),
    );
    query.steps = vec![Step {
        name: Some("Kept Columns".into()),
        operation: Operation::SelectColumns {
            columns: vec!["Missing".into()],
        },
    }];
    let err = QueryEngine::new()
        .execute_query(&query, &ExecutionContext::default(), &ExecuteOptions::default())
        .unwrap_err();
    assert_eq!(err.kind, FlowErrorKind::UnknownColumn);
    assert!(err.to_string().contains("Kept Columns"));
}
