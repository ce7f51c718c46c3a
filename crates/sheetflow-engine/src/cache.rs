//! Query result cache.
//!
//! Keys are SHA-256 over canonical JSON of `{querySignature,
//! sourceSignature, contextSignature, operationsHash, folding?}`.
//! A missing signature (a table source with no version hint, an HTTP
//! source with no ETag) yields no key at all and the cache is bypassed.
//! Builds are serialized per key: concurrent callers for the same key
//! join the in-flight build instead of duplicating it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use serde_json::{Value as Json, json};
use sheetflow_common::{FlowError, Table, hash_canonical};
use sheetflow_parse::query::{Query, SourceSpec};
use tracing::debug;

use crate::source::{Adapters, source_label};

/* ───────────────────────────── cache keys ─────────────────────────── */

/// Versioning token that makes keys react to underlying data changes.
/// `None` means the source cannot be fingerprinted and caching must be
/// bypassed.
pub fn source_signature(spec: &SourceSpec, adapters: &Adapters) -> Option<Json> {
    match spec {
        // Inline data is its own signature.
        SourceSpec::Range { values, .. } => {
            Some(json!({ "kind": "range", "hash": hash_canonical(values).ok()? }))
        }
        SourceSpec::Table { name, version } => {
            let version = version.clone().or_else(|| {
                adapters
                    .table
                    .as_ref()
                    .and_then(|t| t.table_version(name))
            })?;
            Some(json!({ "kind": "table", "name": name, "version": version }))
        }
        SourceSpec::Csv { path, .. }
        | SourceSpec::Json { path }
        | SourceSpec::Parquet { path }
        | SourceSpec::Folder { path, .. } => {
            let stat = adapters.file.as_ref()?.stat(path).ok()?;
            Some(json!({
                "kind": "file",
                "path": path,
                "mtimeMs": stat.mtime_ms,
                "size": stat.size,
            }))
        }
        SourceSpec::Api { url, .. } | SourceSpec::OData { url } => {
            let etag = adapters.api.as_ref()?.etag(url).ok()??;
            Some(json!({ "kind": "http", "url": url, "etag": etag }))
        }
        // Nothing stable to fingerprint.
        SourceSpec::Database { .. } | SourceSpec::QueryRef { .. } => None,
    }
}

pub fn cache_key(
    query: &Query,
    source_sig: &Json,
    context_sig: &Json,
    folding: Option<&str>,
) -> Option<String> {
    let operations_hash = hash_canonical(&query.steps).ok()?;
    let payload = json!({
        "querySignature": { "id": query.id, "source": source_label(&query.source) },
        "sourceSignature": source_sig,
        "contextSignature": context_sig,
        "operationsHash": operations_hash,
        "folding": folding,
    });
    hash_canonical(&payload).ok()
}

/* ───────────────────────────── the store ──────────────────────────── */

pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Arc<Table>>;
    fn put(&self, key: &str, table: Arc<Table>);
}

struct MemoryEntry {
    table: Arc<Table>,
    inserted: Instant,
    last_used: u64,
}

/// In-memory store with LRU capacity and optional TTL eviction.
pub struct MemoryCacheStore {
    entries: Mutex<FxHashMap<String, MemoryEntry>>,
    clock: Mutex<u64>,
    capacity: usize,
    ttl: Option<Duration>,
}

impl MemoryCacheStore {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
            clock: Mutex::new(0),
            capacity: capacity.max(1),
            ttl,
        }
    }

    fn tick(&self) -> u64 {
        let mut clock = self.clock.lock();
        *clock += 1;
        *clock
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &str) -> Option<Arc<Table>> {
        let stamp = self.tick();
        let mut entries = self.entries.lock();
        if let Some(ttl) = self.ttl {
            if entries.get(key).is_some_and(|e| e.inserted.elapsed() > ttl) {
                entries.remove(key);
                return None;
            }
        }
        let entry = entries.get_mut(key)?;
        entry.last_used = stamp;
        Some(Arc::clone(&entry.table))
    }

    fn put(&self, key: &str, table: Arc<Table>) {
        let stamp = self.tick();
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            MemoryEntry {
                table,
                inserted: Instant::now(),
                last_used: stamp,
            },
        );
        while entries.len() > self.capacity {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
    }
}

/* ─────────────────────────── build joining ────────────────────────── */

enum Inflight {
    Building,
    Done(Result<Arc<Table>, FlowError>),
}

type Slot = Arc<(Mutex<Inflight>, Condvar)>;

pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    inflight: Mutex<FxHashMap<String, Slot>>,
}

impl CacheManager {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            inflight: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn with_default_store() -> Self {
        Self::new(Arc::new(MemoryCacheStore::new(64, None)))
    }

    /// At most one concurrent build per key. The winner runs `build`
    /// and publishes; losers block on the winner's slot and share its
    /// outcome (including its error).
    pub fn get_or_build(
        &self,
        key: &str,
        build: impl FnOnce() -> Result<Table, FlowError>,
    ) -> Result<(Arc<Table>, bool), FlowError> {
        if let Some(hit) = self.store.get(key) {
            debug!(key, "cache hit");
            return Ok((hit, true));
        }

        let (slot, is_builder) = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some(slot) => (Arc::clone(slot), false),
                None => {
                    let slot: Slot = Arc::new((Mutex::new(Inflight::Building), Condvar::new()));
                    inflight.insert(key.to_string(), Arc::clone(&slot));
                    (slot, true)
                }
            }
        };

        if !is_builder {
            let (lock, cvar) = &*slot;
            let mut state = lock.lock();
            while matches!(*state, Inflight::Building) {
                cvar.wait(&mut state);
            }
            return match &*state {
                Inflight::Done(Ok(table)) => Ok((Arc::clone(table), true)),
                Inflight::Done(Err(e)) => Err(e.clone()),
                Inflight::Building => unreachable!(),
            };
        }

        debug!(key, "cache miss, building");
        let result = build().map(Arc::new);
        if let Ok(table) = &result {
            self.store.put(key, Arc::clone(table));
        }

        let (lock, cvar) = &*slot;
        *lock.lock() = Inflight::Done(result.clone());
        cvar.notify_all();
        self.inflight.lock().remove(key);

        result.map(|t| (t, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetflow_common::Column;
    use sheetflow_parse::query::Operation;

    fn table() -> Table {
        Table::new(vec![Column::any("A")], vec![]).unwrap()
    }

    #[test]
    fn key_reacts_to_steps_and_signature() {
        let q1 = Query::new(
            "q",
            "q",
            SourceSpec::Csv {
                path: "/a.csv".into(),
                has_headers: true,
            },
        );
        let mut q2 = q1.clone();
        q2.steps.push(sheetflow_parse::query::Step::new(Operation::Take { count: 1 }));

        let sig_a = json!({"mtimeMs": 1, "size": 10});
        let sig_b = json!({"mtimeMs": 2, "size": 10});
        let ctx = Json::Null;

        let k1 = cache_key(&q1, &sig_a, &ctx, None).unwrap();
        assert_eq!(k1, cache_key(&q1, &sig_a, &ctx, None).unwrap());
        assert_ne!(k1, cache_key(&q2, &sig_a, &ctx, None).unwrap());
        assert_ne!(k1, cache_key(&q1, &sig_b, &ctx, None).unwrap());
    }

    #[test]
    fn no_signature_bypasses_caching() {
        let spec = SourceSpec::Table {
            name: "T".into(),
            version: None,
        };
        assert!(source_signature(&spec, &Adapters::default()).is_none());
    }

    #[test]
    fn second_caller_reuses_published_result() {
        let mgr = CacheManager::with_default_store();
        let mut builds = 0;
        let (_, hit1) = mgr
            .get_or_build("k", || {
                builds += 1;
                Ok(table())
            })
            .unwrap();
        assert!(!hit1);
        let (_, hit2) = mgr
            .get_or_build("k", || {
                builds += 1;
                Ok(table())
            })
            .unwrap();
        assert!(hit2);
        assert_eq!(builds, 1);
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let store = MemoryCacheStore::new(2, None);
        store.put("a", Arc::new(table()));
        store.put("b", Arc::new(table()));
        let _ = store.get("a");
        store.put("c", Arc::new(table()));
        assert!(store.get("b").is_none());
        assert!(store.get("a").is_some());
        assert!(store.get("c").is_some());
    }
}
