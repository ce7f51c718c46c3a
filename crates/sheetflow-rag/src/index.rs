//! Incremental workbook indexing.
//!
//! Chunks are diffed against the store's content hashes so an unchanged
//! workbook re-indexes as a no-op. Embedding output is validated
//! strictly before anything is written: a bad batch aborts the whole
//! pass with no writes at all. Stale records for the workbook are
//! deleted on every full pass.

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Map;
use sheetflow_common::{CancelToken, FlowError, FlowErrorKind, sha256_hex};
use tracing::debug;

use crate::chunk::{Chunk, ChunkerOptions, chunk_workbook};
use crate::embed::{Embedder, tokenize};
use crate::store::{HashEntry, RecordMetadata, VectorRecord, VectorStore};
use crate::text::{TextOptions, chunk_to_text};
use crate::workbook::Workbook;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPhase {
    Chunk,
    Hash,
    Embed,
    Upsert,
    Delete,
}

impl IndexPhase {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Chunk => "chunk",
            Self::Hash => "hash",
            Self::Embed => "embed",
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IndexProgress {
    pub phase: IndexPhase,
    pub processed: usize,
    pub total: Option<usize>,
}

pub type MetadataTransform<'a> = &'a dyn Fn(&Chunk, RecordMetadata) -> RecordMetadata;
pub type ProgressSink<'a> = &'a dyn Fn(IndexProgress);

#[derive(Default)]
pub struct IndexOptions<'a> {
    pub chunker: ChunkerOptions,
    pub text: TextOptions,
    /// Embedding batch size; `None` embeds everything in one call.
    pub embed_batch_size: Option<usize>,
    /// Caller hook enriching metadata; its extra fields feed
    /// `metadata_hash`.
    pub transform: Option<MetadataTransform<'a>>,
    pub on_progress: Option<ProgressSink<'a>>,
    pub cancel: CancelToken,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexSummary {
    pub total_chunks: usize,
    pub upserted: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub metadata_updated: usize,
}

fn emit(opts: &IndexOptions<'_>, phase: IndexPhase, processed: usize, total: Option<usize>) {
    if let Some(sink) = opts.on_progress {
        sink(IndexProgress {
            phase,
            processed,
            total,
        });
    }
}

fn metadata_hash_of(extra: &Map<String, serde_json::Value>) -> Option<String> {
    if extra.is_empty() {
        return None;
    }
    sheetflow_common::hash_canonical(extra).ok()
}

/// Validate one embedding batch: exact count, exact dimension, all
/// finite. Any violation aborts with `EmbedderMismatch` before any
/// store write happens.
fn validate_batch(
    batch_len: usize,
    dimension: usize,
    vectors: &[Vec<f32>],
) -> Result<(), FlowError> {
    if vectors.len() != batch_len {
        return Err(FlowError::new(FlowErrorKind::EmbedderMismatch).with_message(format!(
            "embedder returned {} vectors for a batch of {batch_len}",
            vectors.len()
        )));
    }
    for (i, vector) in vectors.iter().enumerate() {
        if vector.len() != dimension {
            return Err(FlowError::new(FlowErrorKind::EmbedderMismatch).with_message(format!(
                "vector {i} has length {}, expected {dimension}",
                vector.len()
            )));
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(FlowError::new(FlowErrorKind::EmbedderMismatch)
                .with_message(format!("vector {i} contains a non-finite component")));
        }
    }
    Ok(())
}

pub fn index_workbook(
    workbook: &Workbook,
    store: &dyn VectorStore,
    embedder: &dyn Embedder,
    opts: &IndexOptions<'_>,
) -> Result<IndexSummary, FlowError> {
    let cancel = &opts.cancel;

    // 1. Chunk.
    let chunks = chunk_workbook(workbook, &opts.chunker, cancel)?;
    emit(opts, IndexPhase::Chunk, chunks.len(), Some(chunks.len()));
    cancel.check()?;

    // 2. Render + hash.
    let mut prepared: Vec<(Chunk, RecordMetadata)> = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.into_iter().enumerate() {
        let text = chunk_to_text(&chunk, &opts.text);
        let content_hash = sha256_hex(text.as_bytes());
        let mut metadata = RecordMetadata {
            workbook_id: chunk.workbook_id.clone(),
            sheet_name: chunk.sheet_name.clone(),
            kind: chunk.kind.id_tag().to_string(),
            title: chunk.title.clone(),
            rect: chunk.rect,
            token_count: tokenize(&text).len(),
            text,
            content_hash,
            metadata_hash: None,
            embedder: embedder.name().to_string(),
            extra: Map::new(),
        };
        if let Some(transform) = opts.transform {
            metadata = transform(&chunk, metadata);
        }
        metadata.metadata_hash = metadata_hash_of(&metadata.extra);
        prepared.push((chunk, metadata));
        emit(opts, IndexPhase::Hash, i + 1, None);
    }
    cancel.check()?;

    // 3. Existing state for this workbook.
    let existing: Vec<HashEntry> = store.list_content_hashes(Some(&workbook.id), cancel)?;
    let existing_by_id: FxHashMap<&str, &HashEntry> =
        existing.iter().map(|e| (e.id.as_str(), e)).collect();

    // An identity change invalidates every stored vector even when the
    // content hashes still match.
    let identity_changed = existing
        .first()
        .and_then(|e| store.get(&e.id).ok().flatten())
        .is_some_and(|r| r.metadata.embedder != embedder.name());
    if identity_changed {
        debug!(
            embedder = embedder.name(),
            "embedder identity changed, re-embedding workbook"
        );
    }

    // 4. Classify: unchanged / metadata-only / upsert.
    let mut summary = IndexSummary {
        total_chunks: prepared.len(),
        ..IndexSummary::default()
    };
    let current_ids: FxHashSet<String> = prepared.iter().map(|(c, _)| c.id.clone()).collect();
    let mut to_upsert: Vec<(Chunk, RecordMetadata)> = Vec::new();
    let mut metadata_only: Vec<(String, RecordMetadata)> = Vec::new();
    for (chunk, metadata) in prepared {
        match existing_by_id.get(chunk.id.as_str()) {
            Some(entry) if !identity_changed && entry.content_hash == metadata.content_hash => {
                if entry.metadata_hash == metadata.metadata_hash {
                    summary.skipped += 1;
                } else {
                    metadata_only.push((chunk.id.clone(), metadata));
                }
            }
            _ => to_upsert.push((chunk, metadata)),
        }
    }

    // 5. Embed everything that needs it, with strict validation:
    // before the first write, so a bad batch leaves the store alone.
    let batch_size = opts.embed_batch_size.unwrap_or(usize::MAX).max(1);
    let texts: Vec<String> = to_upsert.iter().map(|(_, m)| m.text.clone()).collect();
    let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size) {
        cancel.check()?;
        let produced = embedder.embed_texts(batch, cancel)?;
        validate_batch(batch.len(), store.dimension(), &produced)?;
        vectors.extend(produced);
        emit(opts, IndexPhase::Embed, vectors.len(), Some(texts.len()));
    }

    // 6. Persist. Store calls are atomic; the cancel token is observed
    // only after a write has fully completed.
    let records: Vec<VectorRecord> = to_upsert
        .into_iter()
        .zip(vectors)
        .map(|((chunk, metadata), vector)| VectorRecord {
            id: chunk.id,
            vector,
            metadata,
        })
        .collect();
    summary.upserted = records.len();
    let mut written = 0usize;
    for batch in records.chunks(batch_size.min(64)) {
        // Abort is observed between writes, never inside one: a batch
        // already handed to the store completes before AbortError
        // surfaces, so no call leaves a partial batch behind.
        cancel.check()?;
        store.upsert(batch, cancel)?;
        written += batch.len();
        emit(opts, IndexPhase::Upsert, written, Some(records.len()));
    }

    if !metadata_only.is_empty() {
        cancel.check()?;
        store.update_metadata(&metadata_only, cancel)?;
        summary.metadata_updated = metadata_only.len();
    }

    // 7. Delete stale records: present in the store, absent from the
    // current chunk list.
    let stale: Vec<String> = existing
        .iter()
        .filter(|e| !current_ids.contains(&e.id))
        .map(|e| e.id.clone())
        .collect();
    summary.deleted = stale.len();
    if !stale.is_empty() {
        cancel.check()?;
        store.delete(&stale, cancel)?;
        emit(opts, IndexPhase::Delete, stale.len(), Some(stale.len()));
    }

    Ok(summary)
}
