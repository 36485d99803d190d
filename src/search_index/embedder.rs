//! Embedding of skill metadata into dense vectors.

use crate::skill_store::VersionRecord;
use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

const EMBEDDING_DIM: usize = 256;

/// Produces a dense vector for a piece of text.
///
/// Implementations may call out to an external model and are allowed to
/// fail; the coordinator retries and degrades gracefully.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// The document text a skill is indexed under: name, description and tags.
/// Content bytes are deliberately excluded, search targets metadata.
pub fn embed_document(record: &VersionRecord) -> String {
    let mut doc = format!("{}\n{}", record.name, record.description);
    if !record.tags.is_empty() {
        doc.push('\n');
        doc.push_str(&record.tags.join(" "));
    }
    doc
}

/// Deterministic feature-hashing embedder.
///
/// Each token is hashed into one of [`EMBEDDING_DIM`] buckets with a signed
/// weight, then the vector is L2-normalized. No external service, fully
/// reproducible, good enough for keyword-ish similarity.
#[derive(Default)]
pub struct HashEmbedder;

impl HashEmbedder {
    pub fn new() -> Self {
        Self
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; EMBEDDING_DIM];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u16::from_be_bytes([digest[0], digest[1]]) as usize % EMBEDDING_DIM;
            // The next digest byte picks the sign, which keeps unrelated
            // tokens from accumulating into the same direction.
            let sign = if digest[2] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}
