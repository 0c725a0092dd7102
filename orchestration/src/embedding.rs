//! Deterministic capability embeddings and similarity scoring
//!
//! Workers and tasks are compared in a shared 64-dimensional space. The
//! embedding is intentionally cheap and deterministic — each capability (or
//! description token) contributes a hash-derived ±0.1 pattern, and the sum is
//! L2-normalized. It is a routing heuristic, not a learned representation.

/// Dimensionality of capability and task embeddings
pub const EMBEDDING_DIM: usize = 64;

/// Per-dimension contribution magnitude before normalization
const BIT_WEIGHT: f32 = 0.1;

/// Stable 32-bit hash of a string (first four bytes of its BLAKE3 digest)
fn hash32(text: &str) -> u32 {
    let digest = blake3::hash(text.as_bytes());
    let bytes = digest.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Accumulate one hashed token into an embedding
///
/// Dimension `d` gains +0.1 when bit `d mod 32` of the hash is set, −0.1
/// otherwise.
fn accumulate(embedding: &mut [f32], hash: u32) {
    for (dim, slot) in embedding.iter_mut().enumerate() {
        let bit = (dim % 32) as u32;
        if (hash >> bit) & 1 == 1 {
            *slot += BIT_WEIGHT;
        } else {
            *slot -= BIT_WEIGHT;
        }
    }
}

fn l2_normalize(embedding: &mut [f32]) {
    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for slot in embedding.iter_mut() {
            *slot /= norm;
        }
    }
}

/// Derive a worker's default specialization embedding from its capabilities
///
/// Returns the zero vector when no capabilities are declared.
pub fn capability_embedding(capabilities: &[String]) -> Vec<f32> {
    let mut embedding = vec![0.0f32; EMBEDDING_DIM];
    if capabilities.is_empty() {
        return embedding;
    }
    for capability in capabilities {
        accumulate(&mut embedding, hash32(&capability.to_lowercase()));
    }
    l2_normalize(&mut embedding);
    embedding
}

/// Maximum number of description tokens folded into a task embedding
const TASK_TOKEN_LIMIT: usize = 32;

/// Derive a task embedding from its type tag and description tokens
pub fn task_embedding(task_type: &str, description: &str) -> Vec<f32> {
    let mut embedding = vec![0.0f32; EMBEDDING_DIM];
    accumulate(&mut embedding, hash32(&task_type.to_lowercase()));
    for token in description
        .split_whitespace()
        .take(TASK_TOKEN_LIMIT)
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|t| !t.is_empty())
    {
        accumulate(&mut embedding, hash32(&token));
    }
    l2_normalize(&mut embedding);
    embedding
}

/// Cosine similarity between two vectors
///
/// Mismatched lengths are truncated to the shorter vector rather than
/// zero-padded or rejected; callers comparing embeddings of different
/// dimensionality get a similarity over the shared prefix. Empty or
/// zero-norm input yields 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    if len == 0 {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for i in 0..len {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }

    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
