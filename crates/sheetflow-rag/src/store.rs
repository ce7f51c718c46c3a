//! Vector store interface and the two reference implementations.
//!
//! The persisted store serializes to a versioned binary blob through a
//! `BinaryStorage` capability. Ids and content/metadata hashes live in
//! an index section separate from the metadata JSON, so
//! `list_content_hashes` never deserializes full metadata.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use sheetflow_common::{CancelToken, FlowError, FlowErrorKind, Rect};
use tracing::warn;

use crate::chunk::ChunkKind;
use crate::embed::cosine;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub workbook_id: String,
    pub sheet_name: String,
    pub kind: String,
    pub title: String,
    pub rect: Rect,
    pub text: String,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_hash: Option<String>,
    pub token_count: usize,
    pub embedder: String,
    /// Caller extensions, hashed into `metadata_hash`.
    #[serde(default)]
    pub extra: Map<String, Json>,
}

impl RecordMetadata {
    pub fn kind_of(&self) -> Option<ChunkKind> {
        match self.kind.as_str() {
            "table" => Some(ChunkKind::Table),
            "namedRange" => Some(ChunkKind::NamedRange),
            "dataRegion" => Some(ChunkKind::DataRegion),
            "formulaRegion" => Some(ChunkKind::FormulaRegion),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: RecordMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HashEntry {
    pub id: String,
    pub content_hash: String,
    pub metadata_hash: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub workbook_id: Option<String>,
    pub include_vector: bool,
}

#[derive(Debug, Clone)]
pub struct QueryHit {
    pub record: VectorRecord,
    pub score: f32,
}

pub trait VectorStore: Send + Sync {
    fn dimension(&self) -> usize;

    /// Atomic per record: inserts or replaces by id.
    fn upsert(&self, records: &[VectorRecord], cancel: &CancelToken) -> Result<(), FlowError>;

    /// Metadata-only path; must not require vectors.
    fn update_metadata(
        &self,
        items: &[(String, RecordMetadata)],
        cancel: &CancelToken,
    ) -> Result<(), FlowError>;

    fn get(&self, id: &str) -> Result<Option<VectorRecord>, FlowError>;

    fn list(&self, filter: &ListFilter, cancel: &CancelToken)
    -> Result<Vec<VectorRecord>, FlowError>;

    /// Hash columns only, without touching full metadata.
    fn list_content_hashes(
        &self,
        workbook_id: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<Vec<HashEntry>, FlowError>;

    fn delete(&self, ids: &[String], cancel: &CancelToken) -> Result<(), FlowError>;

    /// Top-K by cosine similarity. Non-finite `top_k` errors; zero or
    /// negative yields nothing; fractional floors.
    fn query(
        &self,
        vector: &[f32],
        top_k: f64,
        filter: &ListFilter,
        cancel: &CancelToken,
    ) -> Result<Vec<QueryHit>, FlowError>;
}

fn check_dimension(expected: usize, vector: &[f32]) -> Result<(), FlowError> {
    if vector.len() != expected {
        return Err(FlowError::new(FlowErrorKind::VectorDimensionMismatch).with_message(format!(
            "store dimension is {expected}, vector has {}",
            vector.len()
        )));
    }
    Ok(())
}

fn normalize_top_k(top_k: f64) -> Result<usize, FlowError> {
    if !top_k.is_finite() {
        return Err(FlowError::invalid_argument("topK", "must be finite"));
    }
    if top_k <= 0.0 {
        return Ok(0);
    }
    Ok(top_k.floor() as usize)
}

fn rank(
    records: impl Iterator<Item = VectorRecord>,
    vector: &[f32],
    k: usize,
) -> Vec<QueryHit> {
    let mut hits: Vec<QueryHit> = records
        .map(|record| {
            let score = cosine(vector, &record.vector);
            QueryHit { record, score }
        })
        .collect();
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
    hits.truncate(k);
    hits
}

/* ─────────────────────────── in-memory store ──────────────────────── */

pub struct InMemoryVectorStore {
    dim: usize,
    records: RwLock<FxHashMap<String, VectorRecord>>,
}

impl InMemoryVectorStore {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            records: RwLock::new(FxHashMap::default()),
        }
    }
}

impl VectorStore for InMemoryVectorStore {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn upsert(&self, records: &[VectorRecord], cancel: &CancelToken) -> Result<(), FlowError> {
        for r in records {
            check_dimension(self.dim, &r.vector)?;
        }
        // The write itself is not interruptible: either every record in
        // the batch lands or the error above fired before any did.
        let mut map = self.records.write();
        for r in records {
            map.insert(r.id.clone(), r.clone());
        }
        drop(map);
        cancel.check()
    }

    fn update_metadata(
        &self,
        items: &[(String, RecordMetadata)],
        cancel: &CancelToken,
    ) -> Result<(), FlowError> {
        let mut map = self.records.write();
        for (id, metadata) in items {
            if let Some(record) = map.get_mut(id) {
                record.metadata = metadata.clone();
            }
        }
        drop(map);
        cancel.check()
    }

    fn get(&self, id: &str) -> Result<Option<VectorRecord>, FlowError> {
        Ok(self.records.read().get(id).cloned())
    }

    fn list(
        &self,
        filter: &ListFilter,
        cancel: &CancelToken,
    ) -> Result<Vec<VectorRecord>, FlowError> {
        cancel.check()?;
        let mut out: Vec<VectorRecord> = self
            .records
            .read()
            .values()
            .filter(|r| {
                filter
                    .workbook_id
                    .as_deref()
                    .is_none_or(|wb| r.metadata.workbook_id == wb)
            })
            .cloned()
            .map(|mut r| {
                if !filter.include_vector {
                    r.vector = Vec::new();
                }
                r
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    fn list_content_hashes(
        &self,
        workbook_id: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<Vec<HashEntry>, FlowError> {
        cancel.check()?;
        let mut out: Vec<HashEntry> = self
            .records
            .read()
            .values()
            .filter(|r| workbook_id.is_none_or(|wb| r.metadata.workbook_id == wb))
            .map(|r| HashEntry {
                id: r.id.clone(),
                content_hash: r.metadata.content_hash.clone(),
                metadata_hash: r.metadata.metadata_hash.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    fn delete(&self, ids: &[String], cancel: &CancelToken) -> Result<(), FlowError> {
        let mut map = self.records.write();
        for id in ids {
            map.remove(id);
        }
        drop(map);
        cancel.check()
    }

    fn query(
        &self,
        vector: &[f32],
        top_k: f64,
        filter: &ListFilter,
        cancel: &CancelToken,
    ) -> Result<Vec<QueryHit>, FlowError> {
        cancel.check()?;
        check_dimension(self.dim, vector)?;
        let k = normalize_top_k(top_k)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let records = self.records.read();
        Ok(rank(
            records
                .values()
                .filter(|r| {
                    filter
                        .workbook_id
                        .as_deref()
                        .is_none_or(|wb| r.metadata.workbook_id == wb)
                })
                .cloned(),
            vector,
            k,
        ))
    }
}

/* ─────────────────────────── persisted store ──────────────────────── */

/// Host capability for persisting one opaque blob.
pub trait BinaryStorage: Send + Sync {
    fn read(&self) -> Result<Option<Vec<u8>>, FlowError>;
    fn write(&self, data: &[u8]) -> Result<(), FlowError>;
}

/// In-memory `BinaryStorage`, the unit-test double.
#[derive(Default)]
pub struct MemoryBlob {
    data: parking_lot::Mutex<Option<Vec<u8>>>,
}

impl BinaryStorage for MemoryBlob {
    fn read(&self) -> Result<Option<Vec<u8>>, FlowError> {
        Ok(self.data.lock().clone())
    }

    fn write(&self, data: &[u8]) -> Result<(), FlowError> {
        *self.data.lock() = Some(data.to_vec());
        Ok(())
    }
}

const BLOB_MAGIC: &[u8; 4] = b"SFVS";
const BLOB_VERSION: u32 = 1;

/// On-disk layout: magic, version, dimension, count, then an index
/// section (id + hashes + body offsets per record) and a body section
/// (vector bytes and metadata JSON). Listing hashes touches only the
/// index section.
#[derive(Serialize, Deserialize)]
struct BlobIndexEntry {
    id: String,
    content_hash: String,
    metadata_hash: Option<String>,
    vector_len: u32,
    metadata_len: u32,
}

pub struct PersistedVectorStore {
    dim: usize,
    storage: Arc<dyn BinaryStorage>,
    reset_on_corrupt: bool,
    inner: RwLock<FxHashMap<String, VectorRecord>>,
}

impl PersistedVectorStore {
    pub fn open(
        storage: Arc<dyn BinaryStorage>,
        dim: usize,
        reset_on_corrupt: bool,
    ) -> Result<Self, FlowError> {
        let records = match storage.read()? {
            None => FxHashMap::default(),
            Some(blob) => match decode_blob(&blob, dim) {
                Ok(records) => records,
                Err(e) if reset_on_corrupt => {
                    warn!(error = %e, "vector store blob corrupt, resetting");
                    FxHashMap::default()
                }
                Err(e) => return Err(e),
            },
        };
        Ok(Self {
            dim,
            storage,
            reset_on_corrupt,
            inner: RwLock::new(records),
        })
    }

    pub fn reset_on_corrupt(&self) -> bool {
        self.reset_on_corrupt
    }

    /// Serialize the whole state and hand it to storage. One write per
    /// mutating call keeps the blob consistent at every suspension
    /// point.
    fn persist(&self) -> Result<(), FlowError> {
        let records = self.inner.read();
        let blob = encode_blob(&records, self.dim);
        self.storage.write(&blob)
    }
}

fn encode_blob(records: &FxHashMap<String, VectorRecord>, dim: usize) -> Vec<u8> {
    let mut ids: Vec<&String> = records.keys().collect();
    ids.sort();

    let mut index: Vec<BlobIndexEntry> = Vec::with_capacity(ids.len());
    let mut body: Vec<u8> = Vec::new();
    for id in &ids {
        let record = &records[*id];
        let metadata =
            serde_json::to_vec(&record.metadata).unwrap_or_else(|_| b"{}".to_vec());
        index.push(BlobIndexEntry {
            id: record.id.clone(),
            content_hash: record.metadata.content_hash.clone(),
            metadata_hash: record.metadata.metadata_hash.clone(),
            vector_len: record.vector.len() as u32,
            metadata_len: metadata.len() as u32,
        });
        for x in &record.vector {
            body.extend_from_slice(&x.to_le_bytes());
        }
        body.extend_from_slice(&metadata);
    }
    let index_bytes = serde_json::to_vec(&index).unwrap_or_default();

    let mut out = Vec::with_capacity(16 + index_bytes.len() + body.len());
    out.extend_from_slice(BLOB_MAGIC);
    out.extend_from_slice(&BLOB_VERSION.to_le_bytes());
    out.extend_from_slice(&(dim as u32).to_le_bytes());
    out.extend_from_slice(&(index_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&index_bytes);
    out.extend_from_slice(&body);
    out
}

fn corrupt(msg: &str) -> FlowError {
    FlowError::new(FlowErrorKind::Storage).with_message(format!("vector store blob: {msg}"))
}

fn decode_blob(blob: &[u8], dim: usize) -> Result<FxHashMap<String, VectorRecord>, FlowError> {
    if blob.len() < 16 || &blob[0..4] != BLOB_MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = u32::from_le_bytes(blob[4..8].try_into().unwrap_or_default());
    if version != BLOB_VERSION {
        return Err(corrupt("unknown version"));
    }
    let stored_dim = u32::from_le_bytes(blob[8..12].try_into().unwrap_or_default()) as usize;
    if stored_dim != dim {
        return Err(FlowError::new(FlowErrorKind::VectorDimensionMismatch)
            .with_message(format!("blob dimension {stored_dim}, store expects {dim}")));
    }
    let index_len = u32::from_le_bytes(blob[12..16].try_into().unwrap_or_default()) as usize;
    let index_end = 16usize.checked_add(index_len).ok_or_else(|| corrupt("index length"))?;
    if blob.len() < index_end {
        return Err(corrupt("truncated index"));
    }
    let index: Vec<BlobIndexEntry> =
        serde_json::from_slice(&blob[16..index_end]).map_err(|_| corrupt("index json"))?;

    let mut records = FxHashMap::default();
    let mut cursor = index_end;
    for entry in index {
        let vec_bytes = entry.vector_len as usize * 4;
        let meta_end = cursor
            .checked_add(vec_bytes)
            .and_then(|v| v.checked_add(entry.metadata_len as usize))
            .ok_or_else(|| corrupt("body offsets"))?;
        if blob.len() < meta_end {
            return Err(corrupt("truncated body"));
        }
        let mut vector = Vec::with_capacity(entry.vector_len as usize);
        for chunk in blob[cursor..cursor + vec_bytes].chunks_exact(4) {
            vector.push(f32::from_le_bytes(chunk.try_into().unwrap_or_default()));
        }
        let metadata: RecordMetadata =
            serde_json::from_slice(&blob[cursor + vec_bytes..meta_end])
                .map_err(|_| corrupt("metadata json"))?;
        records.insert(
            entry.id.clone(),
            VectorRecord {
                id: entry.id,
                vector,
                metadata,
            },
        );
        cursor = meta_end;
    }
    Ok(records)
}

impl VectorStore for PersistedVectorStore {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn upsert(&self, records: &[VectorRecord], cancel: &CancelToken) -> Result<(), FlowError> {
        for r in records {
            check_dimension(self.dim, &r.vector)?;
        }
        {
            let mut map = self.inner.write();
            for r in records {
                map.insert(r.id.clone(), r.clone());
            }
        }
        self.persist()?;
        cancel.check()
    }

    fn update_metadata(
        &self,
        items: &[(String, RecordMetadata)],
        cancel: &CancelToken,
    ) -> Result<(), FlowError> {
        {
            let mut map = self.inner.write();
            for (id, metadata) in items {
                if let Some(record) = map.get_mut(id) {
                    record.metadata = metadata.clone();
                }
            }
        }
        self.persist()?;
        cancel.check()
    }

    fn get(&self, id: &str) -> Result<Option<VectorRecord>, FlowError> {
        Ok(self.inner.read().get(id).cloned())
    }

    fn list(
        &self,
        filter: &ListFilter,
        cancel: &CancelToken,
    ) -> Result<Vec<VectorRecord>, FlowError> {
        cancel.check()?;
        let mut out: Vec<VectorRecord> = self
            .inner
            .read()
            .values()
            .filter(|r| {
                filter
                    .workbook_id
                    .as_deref()
                    .is_none_or(|wb| r.metadata.workbook_id == wb)
            })
            .cloned()
            .map(|mut r| {
                if !filter.include_vector {
                    r.vector = Vec::new();
                }
                r
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    fn list_content_hashes(
        &self,
        workbook_id: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<Vec<HashEntry>, FlowError> {
        cancel.check()?;
        // The blob keeps hashes in the index section for exactly this
        // call; the in-memory mirror reads the same columns.
        let mut out: Vec<HashEntry> = self
            .inner
            .read()
            .values()
            .filter(|r| workbook_id.is_none_or(|wb| r.metadata.workbook_id == wb))
            .map(|r| HashEntry {
                id: r.id.clone(),
                content_hash: r.metadata.content_hash.clone(),
                metadata_hash: r.metadata.metadata_hash.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    fn delete(&self, ids: &[String], cancel: &CancelToken) -> Result<(), FlowError> {
        {
            let mut map = self.inner.write();
            for id in ids {
                map.remove(id);
            }
        }
        self.persist()?;
        cancel.check()
    }

    fn query(
        &self,
        vector: &[f32],
        top_k: f64,
        filter: &ListFilter,
        cancel: &CancelToken,
    ) -> Result<Vec<QueryHit>, FlowError> {
        cancel.check()?;
        check_dimension(self.dim, vector)?;
        let k = normalize_top_k(top_k)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let records = self.inner.read();
        Ok(rank(
            records
                .values()
                .filter(|r| {
                    filter
                        .workbook_id
                        .as_deref()
                        .is_none_or(|wb| r.metadata.workbook_id == wb)
                })
                .cloned(),
            vector,
            k,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, wb: &str, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            vector,
            metadata: RecordMetadata {
                workbook_id: wb.to_string(),
                sheet_name: "S".into(),
                kind: "table".into(),
                title: id.to_string(),
                rect: Rect::new(0, 0, 1, 1),
                text: format!("text {id}"),
                content_hash: format!("hash-{id}"),
                metadata_hash: None,
                token_count: 2,
                embedder: "hash:v2:4".into(),
                extra: Map::new(),
            },
        }
    }

    #[test]
    fn upsert_get_delete_roundtrip() {
        let store = InMemoryVectorStore::new(4);
        let cancel = CancelToken::new();
        store
            .upsert(&[record("a", "wb", vec![1.0, 0.0, 0.0, 0.0])], &cancel)
            .unwrap();
        assert!(store.get("a").unwrap().is_some());
        store.delete(&["a".to_string()], &cancel).unwrap();
        assert!(store.get("a").unwrap().is_none());
    }

    #[test]
    fn dimension_mismatch_is_rejected_before_any_write() {
        let store = InMemoryVectorStore::new(4);
        let cancel = CancelToken::new();
        let err = store
            .upsert(
                &[
                    record("ok", "wb", vec![1.0, 0.0, 0.0, 0.0]),
                    record("bad", "wb", vec![1.0]),
                ],
                &cancel,
            )
            .unwrap_err();
        assert_eq!(err.kind, FlowErrorKind::VectorDimensionMismatch);
        assert!(store.get("ok").unwrap().is_none());
    }

    #[test]
    fn query_top_k_contract() {
        let store = InMemoryVectorStore::new(2);
        let cancel = CancelToken::new();
        store
            .upsert(
                &[
                    record("x", "wb", vec![1.0, 0.0]),
                    record("y", "wb", vec![0.0, 1.0]),
                    record("z", "wb", vec![0.7, 0.7]),
                ],
                &cancel,
            )
            .unwrap();
        let filter = ListFilter::default();
        assert!(store.query(&[1.0, 0.0], f64::NAN, &filter, &cancel).is_err());
        assert!(store
            .query(&[1.0, 0.0], -3.0, &filter, &cancel)
            .unwrap()
            .is_empty());
        let hits = store.query(&[1.0, 0.0], 2.9, &filter, &cancel).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.id, "x");
    }

    #[test]
    fn persisted_store_round_trips_through_blob() {
        let blob = Arc::new(MemoryBlob::default());
        let cancel = CancelToken::new();
        {
            let store = PersistedVectorStore::open(blob.clone(), 4, false).unwrap();
            store
                .upsert(
                    &[
                        record("a", "wb1", vec![1.0, 0.0, 0.0, 0.0]),
                        record("b", "wb2", vec![0.0, 1.0, 0.0, 0.0]),
                    ],
                    &cancel,
                )
                .unwrap();
        }
        let reopened = PersistedVectorStore::open(blob, 4, false).unwrap();
        let hashes = reopened.list_content_hashes(Some("wb1"), &cancel).unwrap();
        assert_eq!(hashes.len(), 1);
        assert_eq!(hashes[0].content_hash, "hash-a");
        let rec = reopened.get("b").unwrap().unwrap();
        assert_eq!(rec.vector, vec![0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn corrupt_blob_resets_when_allowed_and_errors_otherwise() {
        let blob = Arc::new(MemoryBlob::default());
        blob.write(b"garbage data").unwrap();
        assert!(PersistedVectorStore::open(blob.clone(), 4, false).is_err());
        let store = PersistedVectorStore::open(blob, 4, true).unwrap();
        assert_eq!(
            store
                .list(&ListFilter::default(), &CancelToken::new())
                .unwrap()
                .len(),
            0
        );
    }
}
