//! The declarative query IR the engine executes.
//!
//! A query is a source plus an ordered list of steps; each step holds
//! exactly one operation. References to other queries are by id and are
//! resolved through the execution context's `queryId → Query` map; the
//! pipeline is a linear list, never a cyclic graph.

use serde::{Deserialize, Serialize};
use sheetflow_common::{DataType, Value};

use crate::ast::Expr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub id: String,
    pub name: String,
    pub source: SourceSpec,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Optional cron refresh schedule (5-field expression).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
}

impl Query {
    pub fn new(id: impl Into<String>, name: impl Into<String>, source: SourceSpec) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            source,
            steps: Vec::new(),
            refresh: None,
        }
    }

    pub fn with_step(mut self, operation: Operation) -> Self {
        let name = format!("Step{}", self.steps.len() + 1);
        self.steps.push(Step {
            name: Some(name),
            operation,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub operation: Operation,
}

impl Step {
    pub fn new(operation: Operation) -> Self {
        Self {
            name: None,
            operation,
        }
    }
}

/* ───────────────────────────── sources ────────────────────────────── */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SourceSpec {
    /// Inline grid of values.
    Range {
        values: Vec<Vec<Value>>,
        #[serde(default)]
        has_headers: bool,
    },
    /// A workbook table resolved by name through the table adapter.
    Table {
        name: String,
        /// Version hint; cache keys require it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    Csv {
        path: String,
        #[serde(default)]
        has_headers: bool,
    },
    Json {
        path: String,
    },
    /// SQL database source. A known column list makes it foldable.
    Database {
        connection: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        table: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query: Option<String>,
        #[serde(default)]
        columns: Vec<String>,
    },
    Api {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        #[serde(default)]
        headers: Vec<(String, String)>,
    },
    #[serde(rename = "odata")]
    OData {
        url: String,
    },
    Parquet {
        path: String,
    },
    Folder {
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    QueryRef {
        id: String,
    },
}

/* ──────────────────────────── predicates ──────────────────────────── */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompareOp {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    StartsWith,
    EndsWith,
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FilterPredicate {
    Comparison {
        column: String,
        op: CompareOp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        /// String comparisons are case-sensitive unless this says no.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        case_sensitive: Option<bool>,
    },
    And {
        predicates: Vec<FilterPredicate>,
    },
    Or {
        predicates: Vec<FilterPredicate>,
    },
    Not {
        predicate: Box<FilterPredicate>,
    },
    /// Arbitrary row expression; never foldable.
    Expression {
        expr: Expr,
    },
}

/* ───────────────────────── sort / aggregate ───────────────────────── */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NullsOrder {
    #[default]
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub column: String,
    #[serde(default)]
    pub direction: SortDirection,
    #[serde(default)]
    pub nulls: NullsOrder,
}

impl SortKey {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Ascending,
            nulls: NullsOrder::First,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Descending,
            nulls: NullsOrder::First,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AggregateOp {
    Sum,
    Count,
    Average,
    Min,
    Max,
    CountDistinct,
}

impl AggregateOp {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Average => "average",
            Self::Min => "min",
            Self::Max => "max",
            Self::CountDistinct => "countDistinct",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub column: String,
    pub op: AggregateOp,
    /// Output column name; defaults to `"<op> of <column>"`.
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub rename: Option<String>,
}

impl Aggregation {
    pub fn output_name(&self) -> String {
        self.rename
            .clone()
            .unwrap_or_else(|| format!("{} of {}", self.op.label(), self.column))
    }
}

/* ─────────────────────────────── joins ────────────────────────────── */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JoinType {
    #[default]
    Inner,
    Left,
    Right,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JoinMode {
    #[default]
    Flat,
    Nested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyComparer {
    #[default]
    Exact,
    CaseInsensitive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JoinAlgorithm {
    #[default]
    Dynamic,
    LeftHash,
    RightHash,
}

/* ───────────────────────────── transforms ─────────────────────────── */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnTransform {
    pub column: String,
    pub formula: Expr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_type: Option<DataType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NameTransform {
    Uppercase,
    Lowercase,
    Trim,
    Capitalize,
}

/* ──────────────────────────── operations ──────────────────────────── */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Operation {
    SelectColumns {
        columns: Vec<String>,
    },
    RemoveColumns {
        columns: Vec<String>,
    },
    FilterRows {
        predicate: FilterPredicate,
    },
    SortRows {
        sort_by: Vec<SortKey>,
    },
    GroupBy {
        keys: Vec<String>,
        aggregations: Vec<Aggregation>,
    },
    AddColumn {
        name: String,
        formula: Expr,
    },
    TransformColumns {
        transforms: Vec<ColumnTransform>,
    },
    RenameColumn {
        from: String,
        to: String,
    },
    ChangeType {
        column: String,
        new_type: DataType,
    },
    Take {
        count: i64,
    },
    Skip {
        count: i64,
    },
    DistinctRows {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        columns: Option<Vec<String>>,
    },
    Pivot {
        column: String,
        value_column: String,
        aggregation: AggregateOp,
    },
    Unpivot {
        columns: Vec<String>,
        name_column: String,
        value_column: String,
    },
    Merge {
        left_keys: Vec<String>,
        right_query: String,
        right_keys: Vec<String>,
        #[serde(default)]
        join_type: JoinType,
        #[serde(default)]
        join_mode: JoinMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_column_name: Option<String>,
        /// Per-key comparers; when present the length must equal the
        /// key count.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comparers: Option<Vec<KeyComparer>>,
        #[serde(default)]
        join_algorithm: JoinAlgorithm,
    },
    Append {
        queries: Vec<String>,
    },
    ExpandTableColumn {
        column: String,
        columns: Vec<String>,
    },
    FillDown {
        columns: Vec<String>,
    },
    ReplaceValues {
        column: String,
        find: Value,
        replace: Value,
    },
    SplitColumn {
        column: String,
        delimiter: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        names: Option<Vec<String>>,
    },
    CombineColumns {
        columns: Vec<String>,
        separator: String,
        new_name: String,
    },
    AddIndexColumn {
        name: String,
        #[serde(default)]
        start: i64,
        #[serde(default = "one")]
        increment: i64,
    },
    PromoteHeaders,
    DemoteHeaders,
    TransformColumnNames {
        transform: NameTransform,
    },
}

fn one() -> i64 {
    1
}

impl Operation {
    /// Short name used in step labels and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SelectColumns { .. } => "selectColumns",
            Self::RemoveColumns { .. } => "removeColumns",
            Self::FilterRows { .. } => "filterRows",
            Self::SortRows { .. } => "sortRows",
            Self::GroupBy { .. } => "groupBy",
            Self::AddColumn { .. } => "addColumn",
            Self::TransformColumns { .. } => "transformColumns",
            Self::RenameColumn { .. } => "renameColumn",
            Self::ChangeType { .. } => "changeType",
            Self::Take { .. } => "take",
            Self::Skip { .. } => "skip",
            Self::DistinctRows { .. } => "distinctRows",
            Self::Pivot { .. } => "pivot",
            Self::Unpivot { .. } => "unpivot",
            Self::Merge { .. } => "merge",
            Self::Append { .. } => "append",
            Self::ExpandTableColumn { .. } => "expandTableColumn",
            Self::FillDown { .. } => "fillDown",
            Self::ReplaceValues { .. } => "replaceValues",
            Self::SplitColumn { .. } => "splitColumn",
            Self::CombineColumns { .. } => "combineColumns",
            Self::AddIndexColumn { .. } => "addIndexColumn",
            Self::PromoteHeaders => "promoteHeaders",
            Self::DemoteHeaders => "demoteHeaders",
            Self::TransformColumnNames { .. } => "transformColumnNames",
        }
    }

    /// Ids of other queries this operation pulls in.
    pub fn referenced_queries(&self) -> Vec<&str> {
        match self {
            Self::Merge { right_query, .. } => vec![right_query.as_str()],
            Self::Append { queries } => queries.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_serde_is_tagged_camel_case() {
        let op = Operation::SelectColumns {
            columns: vec!["Id".into(), "Name".into()],
        };
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains(r#""op":"selectColumns""#));
        let back: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn aggregation_default_output_name() {
        let agg = Aggregation {
            column: "Sales".into(),
            op: AggregateOp::Sum,
            rename: None,
        };
        assert_eq!(agg.output_name(), "sum of Sales");
    }

    #[test]
    fn referenced_queries_for_merge_and_append() {
        let m = Operation::Merge {
            left_keys: vec!["k".into()],
            right_query: "q2".into(),
            right_keys: vec!["k".into()],
            join_type: JoinType::Left,
            join_mode: JoinMode::Flat,
            new_column_name: None,
            comparers: None,
            join_algorithm: JoinAlgorithm::Dynamic,
        };
        assert_eq!(m.referenced_queries(), vec!["q2"]);
        let a = Operation::Append {
            queries: vec!["a".into(), "b".into()],
        };
        assert_eq!(a.referenced_queries(), vec!["a", "b"]);
    }
}
