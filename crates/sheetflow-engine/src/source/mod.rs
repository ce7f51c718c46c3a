//! Source loading behind adapter seams.
//!
//! The engine never touches the filesystem, network, or a database
//! driver directly; everything goes through the adapter traits here so
//! hosts can supply their own I/O. Loaders turn a [`SourceSpec`] into
//! the pipeline's initial table.

pub mod odata;

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use sheetflow_common::{
    CancelToken, Column, DataType, FlowError, FlowErrorKind, FromGridOptions, Table, Value,
};
use sheetflow_parse::query::SourceSpec;
use tracing::debug;

/* ─────────────────────────── adapter traits ───────────────────────── */

#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub mtime_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub mtime_ms: i64,
    pub size: u64,
}

pub trait FileAdapter: Send + Sync {
    fn read_text(&self, path: &str) -> Result<String, FlowError>;

    fn read_binary(&self, path: &str) -> Result<Vec<u8>, FlowError>;

    /// Chunked binary reading for large files. The default materializes
    /// once and re-chunks; adapters with real streaming override it.
    fn read_binary_stream(
        &self,
        path: &str,
        chunk_size: usize,
    ) -> Result<Box<dyn Iterator<Item = Vec<u8>> + Send>, FlowError> {
        let data = self.read_binary(path)?;
        let chunk_size = chunk_size.max(1);
        let chunks: Vec<Vec<u8>> = data.chunks(chunk_size).map(<[u8]>::to_vec).collect();
        Ok(Box::new(chunks.into_iter()))
    }

    fn list_dir(&self, path: &str, recursive: bool) -> Result<Vec<FileEntry>, FlowError>;

    fn stat(&self, path: &str) -> Result<FileStat, FlowError>;

    /// Fallback Parquet reader. `projection` and `row_limit` come from
    /// the folding planner; `None` means read everything.
    fn read_parquet_table(
        &self,
        path: &str,
        projection: Option<&[String]>,
        row_limit: Option<usize>,
    ) -> Result<Table, FlowError> {
        let _ = (projection, row_limit);
        Err(FlowError::new(FlowErrorKind::SourceNotFound)
            .with_message(format!("no parquet reader available for '{path}'")))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApiRequest {
    pub url: String,
    pub method: Option<String>,
    pub headers: Vec<(String, String)>,
}

pub trait ApiAdapter: Send + Sync {
    fn fetch_table(&self, request: &ApiRequest) -> Result<Table, FlowError>;

    /// Raw JSON fetch used by paginating connectors (OData).
    fn fetch_json(&self, url: &str) -> Result<Json, FlowError>;

    /// ETag for cache signatures, when the remote exposes one.
    fn etag(&self, url: &str) -> Result<Option<String>, FlowError> {
        let _ = url;
        Ok(None)
    }
}

pub trait DatabaseAdapter: Send + Sync {
    fn query_sql(&self, connection: &str, sql: &str) -> Result<Table, FlowError>;
}

pub trait TableAdapter: Send + Sync {
    fn get_table(&self, name: &str) -> Result<Table, FlowError>;

    /// Version hint used by cache signatures; `None` bypasses the cache.
    fn table_version(&self, name: &str) -> Option<String> {
        let _ = name;
        None
    }
}

/* ────────────────────────── connector registry ────────────────────── */

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceState {
    pub etag: Option<String>,
    pub source_timestamp: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectorMeta {
    pub refreshed_at: Option<String>,
    pub schema: Vec<Column>,
    pub row_count: usize,
    pub provenance: Option<String>,
}

pub struct ConnectorResult {
    pub table: Table,
    pub meta: ConnectorMeta,
}

pub trait Connector: Send + Sync {
    fn id(&self) -> &str;

    fn permission_kind(&self) -> &str;

    /// Cache key component for a request, `None` to bypass caching.
    fn cache_key(&self, request: &Json) -> Option<String>;

    fn execute(&self, request: &Json, cancel: &CancelToken) -> Result<ConnectorResult, FlowError>;

    fn source_state(
        &self,
        request: &Json,
        known: Option<&SourceState>,
    ) -> Result<SourceState, FlowError> {
        let _ = (request, known);
        Ok(SourceState::default())
    }
}

#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: FxHashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors.insert(connector.id().to_string(), connector);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(id).cloned()
    }
}

/// Everything the loader may need, all optional; using a source whose
/// adapter is missing is a `Source.NotFound` error.
#[derive(Default)]
pub struct Adapters {
    pub file: Option<Arc<dyn FileAdapter>>,
    pub api: Option<Arc<dyn ApiAdapter>>,
    pub database: Option<Arc<dyn DatabaseAdapter>>,
    pub table: Option<Arc<dyn TableAdapter>>,
    pub connectors: ConnectorRegistry,
}

impl Adapters {
    fn file(&self) -> Result<&Arc<dyn FileAdapter>, FlowError> {
        self.file
            .as_ref()
            .ok_or_else(|| missing_adapter("file"))
    }

    fn api(&self) -> Result<&Arc<dyn ApiAdapter>, FlowError> {
        self.api.as_ref().ok_or_else(|| missing_adapter("api"))
    }

    fn database(&self) -> Result<&Arc<dyn DatabaseAdapter>, FlowError> {
        self.database
            .as_ref()
            .ok_or_else(|| missing_adapter("database"))
    }

    fn table(&self) -> Result<&Arc<dyn TableAdapter>, FlowError> {
        self.table.as_ref().ok_or_else(|| missing_adapter("table"))
    }
}

fn missing_adapter(kind: &str) -> FlowError {
    FlowError::new(FlowErrorKind::SourceNotFound)
        .with_message(format!("no {kind} adapter configured"))
}

/* ─────────────────────────────── loaders ──────────────────────────── */

/// Extra load parameters produced by the folding planner.
#[derive(Debug, Clone, Default)]
pub struct LoadHints {
    pub parquet_projection: Option<Vec<String>>,
    pub parquet_row_limit: Option<usize>,
}

pub fn load_source(
    spec: &SourceSpec,
    adapters: &Adapters,
    hints: &LoadHints,
    cancel: &CancelToken,
) -> Result<Table, FlowError> {
    cancel.check()?;
    debug!(source = ?source_label(spec), "loading source");
    match spec {
        SourceSpec::Range {
            values,
            has_headers,
        } => Table::from_grid(
            values.clone(),
            FromGridOptions {
                has_headers: *has_headers,
                infer_types: true,
            },
        ),
        SourceSpec::Table { name, .. } => adapters.table()?.get_table(name),
        SourceSpec::Csv { path, has_headers } => {
            let text = adapters.file()?.read_text(path)?;
            parse_csv(&text, *has_headers)
        }
        SourceSpec::Json { path } => {
            let text = adapters.file()?.read_text(path)?;
            parse_json_table(&text)
        }
        SourceSpec::Database {
            connection,
            table,
            query,
            columns,
        } => {
            let sql = match (query, table) {
                (Some(q), _) => q.clone(),
                (None, Some(t)) => {
                    let projection = if columns.is_empty() {
                        "*".to_string()
                    } else {
                        columns.join(", ")
                    };
                    format!("SELECT {projection} FROM {t}")
                }
                (None, None) => {
                    return Err(FlowError::invalid_argument(
                        "database",
                        "either a table or a query is required",
                    ));
                }
            };
            adapters.database()?.query_sql(connection, &sql)
        }
        SourceSpec::Api {
            url,
            method,
            headers,
        } => adapters.api()?.fetch_table(&ApiRequest {
            url: url.clone(),
            method: method.clone(),
            headers: headers.clone(),
        }),
        SourceSpec::OData { url } => {
            // A registered connector takes precedence; the built-in one
            // wraps the api adapter.
            let connector: Arc<dyn Connector> = match adapters.connectors.get("odata") {
                Some(c) => c,
                None => Arc::new(odata::ODataConnector::new(Arc::clone(adapters.api()?))),
            };
            let request = serde_json::json!({ "url": url });
            connector.execute(&request, cancel).map(|r| r.table)
        }
        SourceSpec::Parquet { path } => adapters.file()?.read_parquet_table(
            path,
            hints.parquet_projection.as_deref(),
            hints.parquet_row_limit,
        ),
        SourceSpec::Folder { path, recursive } => {
            let entries = adapters.file()?.list_dir(path, *recursive)?;
            Ok(folder_table(path, entries))
        }
        SourceSpec::QueryRef { id } => Err(FlowError::invalid_argument(
            "source",
            format!("query reference '{id}' must be resolved by the engine"),
        )),
    }
}

pub fn source_label(spec: &SourceSpec) -> String {
    match spec {
        SourceSpec::Range { .. } => "range".into(),
        SourceSpec::Table { name, .. } => format!("table:{name}"),
        SourceSpec::Csv { path, .. } => format!("csv:{path}"),
        SourceSpec::Json { path } => format!("json:{path}"),
        SourceSpec::Database { connection, .. } => format!("db:{connection}"),
        SourceSpec::Api { url, .. } => format!("api:{url}"),
        SourceSpec::OData { url } => format!("odata:{url}"),
        SourceSpec::Parquet { path } => format!("parquet:{path}"),
        SourceSpec::Folder { path, .. } => format!("folder:{path}"),
        SourceSpec::QueryRef { id } => format!("query:{id}"),
    }
}

fn parse_csv(text: &str, has_headers: bool) -> Result<Table, FlowError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut grid: Vec<Vec<Value>> = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| {
            FlowError::new(FlowErrorKind::Parse).with_message(format!("csv: {e}"))
        })?;
        grid.push(record.iter().map(infer_scalar).collect());
    }
    Table::from_grid(
        grid,
        FromGridOptions {
            has_headers,
            infer_types: true,
        },
    )
}

/// Scalar inference for text sources: ints, floats, booleans, the rest
/// stays text. Dates are left alone; `changeType` is the explicit path.
fn infer_scalar(s: &str) -> Value {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(n) = trimmed.parse::<f64>() {
        return Value::Number(n);
    }
    match trimmed {
        "true" | "TRUE" | "True" => Value::Bool(true),
        "false" | "FALSE" | "False" => Value::Bool(false),
        _ => Value::Text(s.to_string()),
    }
}

pub fn json_to_value(v: &Json) -> Value {
    match v {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Number(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(s) => Value::Text(s.clone()),
        Json::Object(map) => Value::Record(
            map.iter().map(|(k, v)| (k.clone(), json_to_value(v))).collect(),
        ),
        Json::Array(_) => Value::Text(v.to_string()),
    }
}

/// Accepts an array of objects (columns unioned in appearance order) or
/// an array of arrays (`Column1…`).
pub fn parse_json_table(text: &str) -> Result<Table, FlowError> {
    let parsed: Json = serde_json::from_str(text)
        .map_err(|e| FlowError::new(FlowErrorKind::Parse).with_message(format!("json: {e}")))?;
    let Json::Array(items) = &parsed else {
        return Err(FlowError::new(FlowErrorKind::Parse)
            .with_message("json source must be a top-level array"));
    };

    if items.iter().all(|i| matches!(i, Json::Array(_))) {
        let grid: Vec<Vec<Value>> = items
            .iter()
            .map(|row| match row {
                Json::Array(cells) => cells.iter().map(json_to_value).collect(),
                _ => unreachable!(),
            })
            .collect();
        return Table::from_grid(
            grid,
            FromGridOptions {
                has_headers: false,
                infer_types: true,
            },
        );
    }

    let mut names: Vec<String> = Vec::new();
    for item in items {
        if let Json::Object(map) = item {
            for key in map.keys() {
                if !names.iter().any(|n| n == key) {
                    names.push(key.clone());
                }
            }
        } else {
            return Err(FlowError::new(FlowErrorKind::Parse)
                .with_message("json rows must be all objects or all arrays"));
        }
    }
    let columns: Vec<Column> = names.iter().map(Column::any).collect();
    let rows: Vec<Vec<Value>> = items
        .iter()
        .map(|item| match item {
            Json::Object(map) => names
                .iter()
                .map(|n| map.get(n).map(json_to_value).unwrap_or(Value::Null))
                .collect(),
            _ => unreachable!(),
        })
        .collect();
    Table::new(columns, rows)
}

fn folder_table(root: &str, entries: Vec<FileEntry>) -> Table {
    let columns = vec![
        Column::new("Name", DataType::Text),
        Column::new("Extension", DataType::Text),
        Column::new("Folder Path", DataType::Text),
        Column::new("Date modified", DataType::DateTime),
        Column::new("Size", DataType::Number),
    ];
    let rows = entries
        .into_iter()
        .map(|e| {
            let ext = e
                .name
                .rsplit_once('.')
                .map(|(_, ext)| format!(".{ext}"))
                .unwrap_or_default();
            let folder = e
                .path
                .rsplit_once('/')
                .map(|(dir, _)| dir.to_string())
                .unwrap_or_else(|| root.to_string());
            let modified = chrono::DateTime::from_timestamp_millis(e.mtime_ms)
                .map(|dt| Value::DateTime(dt.naive_utc()))
                .unwrap_or(Value::Null);
            vec![
                Value::Text(e.name),
                Value::Text(ext),
                Value::Text(folder),
                modified,
                Value::Int(e.size as i64),
            ]
        })
        .collect();
    Table::from_parts_unchecked(columns, rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_parses_with_type_inference() {
        let t = parse_csv("Name,Score\nAda,90\nBob,81.5\n", true).unwrap();
        assert_eq!(t.columns()[0].name, "Name");
        assert_eq!(t.cell(0, 1), &Value::Int(90));
        assert_eq!(t.cell(1, 1), &Value::Number(81.5));
    }

    #[test]
    fn json_objects_union_columns_in_order() {
        let t = parse_json_table(r#"[{"a":1},{"b":"x","a":2}]"#).unwrap();
        let names: Vec<&str> = t.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(t.cell(0, 1), &Value::Null);
    }

    #[test]
    fn folder_rows_synthesize_metadata_columns() {
        let t = folder_table(
            "/data",
            vec![FileEntry {
                path: "/data/report.csv".into(),
                name: "report.csv".into(),
                size: 120,
                mtime_ms: 1_700_000_000_000,
            }],
        );
        assert_eq!(t.cell(0, 0), &Value::Text("report.csv".into()));
        assert_eq!(t.cell(0, 1), &Value::Text(".csv".into()));
        assert_eq!(t.cell(0, 2), &Value::Text("/data".into()));
        assert_eq!(t.cell(0, 4), &Value::Int(120));
    }
}
