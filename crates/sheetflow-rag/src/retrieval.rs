//! Retrieval over an indexed workbook: embed the query, rank by cosine
//! similarity, optionally boost lexically and deduplicate overlapping
//! regions.

use sheetflow_common::{CancelToken, FlowError};

use crate::embed::{Embedder, tokenize};
use crate::store::{ListFilter, QueryHit, VectorStore};

#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    pub top_k: f64,
    /// Lexical boost against the stored chunk text.
    pub rerank: bool,
    /// Drop hits whose rect mostly overlaps a better hit on the same
    /// sheet.
    pub dedupe: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 8.0,
            rerank: true,
            dedupe: true,
        }
    }
}

/// Fraction of distinct query tokens present in the candidate text.
fn lexical_overlap(query_tokens: &[String], text: &str) -> f32 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let candidate: rustc_hash::FxHashSet<String> = tokenize(text).into_iter().collect();
    let present = query_tokens
        .iter()
        .filter(|t| candidate.contains(*t))
        .count();
    present as f32 / query_tokens.len() as f32
}

pub fn search_workbook_rag(
    query_text: &str,
    workbook_id: &str,
    store: &dyn VectorStore,
    embedder: &dyn Embedder,
    opts: &SearchOptions,
    cancel: &CancelToken,
) -> Result<Vec<QueryHit>, FlowError> {
    let vectors = embedder.embed_texts(&[query_text.to_string()], cancel)?;
    let vector = vectors.into_iter().next().unwrap_or_default();

    // Over-fetch when post-processing may drop candidates.
    let fetch = if opts.rerank || opts.dedupe {
        opts.top_k * 2.0
    } else {
        opts.top_k
    };
    let filter = ListFilter {
        workbook_id: Some(workbook_id.to_string()),
        include_vector: true,
    };
    let mut hits = store.query(&vector, fetch, &filter, cancel)?;

    if opts.rerank {
        let query_tokens: Vec<String> = {
            let mut t = tokenize(query_text);
            t.sort_unstable();
            t.dedup();
            t
        };
        for hit in &mut hits {
            hit.score += 0.2 * lexical_overlap(&query_tokens, &hit.record.metadata.text);
        }
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
    }

    if opts.dedupe {
        let mut kept: Vec<QueryHit> = Vec::new();
        for hit in hits {
            let overlaps = kept.iter().any(|k| {
                k.record.metadata.sheet_name == hit.record.metadata.sheet_name
                    && k.record
                        .metadata
                        .rect
                        .overlap_ratio(&hit.record.metadata.rect)
                        >= 0.8
            });
            if !overlaps {
                kept.push(hit);
            }
        }
        hits = kept;
    }

    if opts.top_k.is_finite() && opts.top_k > 0.0 {
        hits.truncate(opts.top_k.floor() as usize);
    }
    Ok(hits)
}
