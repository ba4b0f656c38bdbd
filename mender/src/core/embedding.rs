//! Text embeddings for episodic memory search.
//!
//! The default embedder is a deterministic feature-hashing bag of words. It
//! needs no model files and gives stable vectors across processes, which lets
//! the memory store persist documents only and re-embed them on load.

/// Maps text to a fixed-size vector.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f64>;
}

/// Signed feature hashing over lowercase word tokens, L2-normalized.
#[derive(Debug, Clone, Copy)]
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub const DEFAULT_DIM: usize = 256;

    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIM)
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Vec<f64> {
        let mut acc = vec![0.0f64; self.dim];
        if self.dim == 0 {
            return acc;
        }
        for token in tokens(text) {
            let hash = fnv1a(token.as_bytes());
            let bucket = (hash % self.dim as u64) as usize;
            // High bit picks the sign so unrelated collisions tend to cancel.
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            acc[bucket] += sign;
        }
        let norm: f64 = acc.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 1e-9 {
            acc.iter_mut().for_each(|v| *v /= norm);
        }
        acc
    }
}

/// Cosine similarity in `[-1, 1]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a: f64 = a.iter().map(|v| v * v).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|v| v * v).sum::<f64>().sqrt();
    if mag_a < 1e-9 || mag_b < 1e-9 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(-1.0, 1.0)
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
