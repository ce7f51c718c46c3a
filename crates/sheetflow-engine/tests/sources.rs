//! File-backed source loading through a real filesystem adapter.

use std::fs;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use sheetflow_common::Value;
use sheetflow_engine::{
    Adapters, CacheManager, ExecuteOptions, ExecutionContext, FileAdapter, FileEntry, FileStat,
    FlowError, FlowErrorKind, QueryEngine,
};
use sheetflow_parse::query::{Operation, Query, SourceSpec};

struct FsAdapter;

fn io_err(e: std::io::Error) -> FlowError {
    sheetflow_common::FlowError::new(FlowErrorKind::SourceNotFound).with_message(e.to_string())
}

impl FileAdapter for FsAdapter {
    fn read_text(&self, path: &str) -> Result<String, FlowError> {
        fs::read_to_string(path).map_err(io_err)
    }

    fn read_binary(&self, path: &str) -> Result<Vec<u8>, FlowError> {
        fs::read(path).map_err(io_err)
    }

    fn list_dir(&self, path: &str, recursive: bool) -> Result<Vec<FileEntry>, FlowError> {
        let mut out = Vec::new();
        let mut pending = vec![path.to_string()];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir).map_err(io_err)? {
                let entry = entry.map_err(io_err)?;
                let meta = entry.metadata().map_err(io_err)?;
                let full = entry.path().to_string_lossy().to_string();
                if meta.is_dir() {
                    if recursive {
                        pending.push(full);
                    }
                    continue;
                }
                out.push(FileEntry {
                    name: entry.file_name().to_string_lossy().to_string(),
                    path: full,
                    size: meta.len(),
                    mtime_ms: meta
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                        .map(|d| d.as_millis() as i64)
                        .unwrap_or(0),
                });
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    fn stat(&self, path: &str) -> Result<FileStat, FlowError> {
        let meta = fs::metadata(path).map_err(io_err)?;
        Ok(FileStat {
            size: meta.len(),
            mtime_ms: meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0),
        })
    }
}

fn ctx_with_fs() -> ExecutionContext {
    let mut ctx = ExecutionContext::default();
    ctx.adapters = Adapters {
        file: Some(Arc::new(FsAdapter)),
        ..Adapters::default()
    };
    ctx
}

#[test]
fn csv_file_source_loads_and_transforms() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sales.csv");
    fs::write(&path, "Region,Sales\nEast,100\nWest,200\nEast,50\n").unwrap();

    let mut query = Query::new(
        "q",
        "sales",
        SourceSpec::Csv {
            path: path.to_string_lossy().to_string(),
            has_headers: true,
        },
    );
    query.steps = vec![sheetflow_parse::query::Step::new(Operation::Take { count: 2 })];

    let table = QueryEngine::new()
        .execute_query(&query, &ctx_with_fs(), &ExecuteOptions::default())
        .unwrap();
    assert_eq!(table.row_count(), 2);
    assert_eq!(table.cell(0, 1), &Value::Int(100));
}

#[test]
fn folder_source_lists_entries_with_metadata_columns() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.csv"), "x").unwrap();
    fs::write(dir.path().join("b.json"), "[]").unwrap();

    let query = Query::new(
        "q",
        "files",
        SourceSpec::Folder {
            path: dir.path().to_string_lossy().to_string(),
            recursive: false,
        },
    );
    let table = QueryEngine::new()
        .execute_query(&query, &ctx_with_fs(), &ExecuteOptions::default())
        .unwrap();
    assert_eq!(table.row_count(), 2);
    let names: Vec<&str> = table.columns().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["Name", "Extension", "Folder Path", "Date modified", "Size"]
    );
    assert_eq!(table.cell(0, 1), &Value::Text(".csv".into()));
}

#[test]
fn file_cache_key_reacts_to_mtime_and_size() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.csv");
    fs::write(&path, "A\n1\n").unwrap();

    let mut ctx = ctx_with_fs();
    ctx.cache = Some(CacheManager::with_default_store());

    let query = Query::new(
        "q",
        "data",
        SourceSpec::Csv {
            path: path.to_string_lossy().to_string(),
            has_headers: true,
        },
    );
    let engine = QueryEngine::new();
    let opts = ExecuteOptions::default();

    let (_, first) = engine.execute_query_with_meta(&query, &ctx, &opts).unwrap();
    assert!(!first.cache_hit);
    let (_, second) = engine.execute_query_with_meta(&query, &ctx, &opts).unwrap();
    assert!(second.cache_hit);

    // Grow the file; the signature moves and the cache misses.
    fs::write(&path, "A\n1\n2\n3\n").unwrap();
    let (table, third) = engine.execute_query_with_meta(&query, &ctx, &opts).unwrap();
    assert!(!third.cache_hit);
    assert_eq!(table.row_count(), 3);
}
