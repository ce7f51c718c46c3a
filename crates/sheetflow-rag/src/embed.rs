//! Deterministic, offline token-hash embedder.
//!
//! Tokenization splits camelCase and acronym boundaries, digit
//! boundaries, underscores, and ASCII non-word characters; everything
//! lowercases and non-ASCII is a separator. Each distinct token hashes
//! with FNV-1a 32-bit into a dimension slot with a sign bit; weights
//! are `sqrt(tf)` and the vector is L2-normalized. The same input
//! always produces the same vector across instances and processes.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use sheetflow_common::{CancelToken, FlowError};

/// Batch text embedding seam. Identity (`name`) participates in cache
/// keys and stored metadata; an improved embedder must carry a
/// distinct identity even when the method signature is unchanged.
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    fn dimension(&self) -> usize;

    fn embed_texts(&self, texts: &[String], cancel: &CancelToken)
    -> Result<Vec<Vec<f32>>, FlowError>;
}

/// Split into lowercase tokens. Never fails, whatever the input.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut prev: Option<char> = None;
    let mut flush = |current: &mut String, tokens: &mut Vec<String>| {
        if !current.is_empty() {
            tokens.push(std::mem::take(current));
        }
    };

    for ch in text.chars() {
        if !ch.is_ascii_alphanumeric() {
            // Underscores, punctuation, whitespace, and all non-ASCII
            // act as separators.
            flush(&mut current, &mut tokens);
            prev = None;
            continue;
        }
        if let Some(p) = prev {
            let camel = p.is_ascii_lowercase() && ch.is_ascii_uppercase();
            // Acronym boundary: "RAGIndex" splits before "Index".
            let acronym_end = p.is_ascii_uppercase()
                && ch.is_ascii_lowercase()
                && current.chars().count() > 1;
            let digit_boundary = p.is_ascii_digit() != ch.is_ascii_digit();
            if camel || digit_boundary {
                flush(&mut current, &mut tokens);
            } else if acronym_end {
                let last = current.pop();
                flush(&mut current, &mut tokens);
                if let Some(last) = last {
                    current.push(last);
                }
            }
        }
        current.push(ch.to_ascii_lowercase());
        prev = Some(ch);
    }
    flush(&mut current, &mut tokens);
    tokens
}

fn fnv1a32(token: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in token.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

pub struct HashEmbedder {
    dim: usize,
    identity: String,
    /// token → (slot, sign) memo, cleared when it fills up.
    cache: Mutex<FxHashMap<String, (usize, f32)>>,
    cache_size: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim: dim.max(1),
            identity: format!("hash:v2:{}", dim.max(1)),
            cache: Mutex::new(FxHashMap::default()),
            cache_size: 65_536,
        }
    }

    fn slot_of(&self, token: &str) -> (usize, f32) {
        {
            let cache = self.cache.lock();
            if let Some(hit) = cache.get(token) {
                return *hit;
            }
        }
        let hash = fnv1a32(token);
        let idx = (hash as usize) % self.dim;
        let sign = if hash & 0x8000_0000 == 0 { 1.0 } else { -1.0 };
        let mut cache = self.cache.lock();
        if cache.len() >= self.cache_size {
            cache.clear();
        }
        cache.insert(token.to_string(), (idx, sign));
        (idx, sign)
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dim];
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return vector;
        }
        let mut tf: FxHashMap<String, usize> = FxHashMap::default();
        for token in tokens {
            *tf.entry(token).or_insert(0) += 1;
        }
        for (token, count) in &tf {
            let (idx, sign) = self.slot_of(token);
            vector[idx] += sign * (*count as f32).sqrt();
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        &self.identity
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn embed_texts(
        &self,
        texts: &[String],
        cancel: &CancelToken,
    ) -> Result<Vec<Vec<f32>>, FlowError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            cancel.check()?;
            out.push(self.embed_one(text));
        }
        Ok(out)
    }
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenization_splits_case_digits_and_underscores() {
        assert_eq!(tokenize("RevenueByRegion"), vec!["revenue", "by", "region"]);
        assert_eq!(tokenize("total_2024sales"), vec!["total", "2024", "sales"]);
        assert_eq!(tokenize("RAGIndex"), vec!["rag", "index"]);
        assert_eq!(tokenize("  \u{00e9}\u{00e9}  "), Vec::<String>::new());
        assert_eq!(tokenize(""), Vec::<String>::new());
    }

    #[test]
    fn identical_input_identical_vectors_across_instances() {
        let a = HashEmbedder::new(128);
        let b = HashEmbedder::new(128);
        assert_eq!(a.embed_one("quarterly revenue"), b.embed_one("quarterly revenue"));
        assert_eq!(a.name(), "hash:v2:128");
    }

    #[test]
    fn vectors_are_l2_normalized_and_empty_is_zero() {
        let e = HashEmbedder::new(64);
        let v = e.embed_one("alpha beta gamma");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(e.embed_one("   ").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn casing_variants_are_close_and_beat_unrelated_text() {
        let e = HashEmbedder::new(256);
        let a = e.embed_one("revenue by region");
        let b = e.embed_one("RevenueByRegion");
        let unrelated = e.embed_one("penguin habitat temperature");
        let close = cosine(&a, &b);
        let far = cosine(&a, &unrelated);
        assert!(close > 0.8, "close={close}");
        assert!(close > far + 0.2, "close={close} far={far}");
    }
}
