//! Text-to-vector embedding.
//!
//! The vault itself takes vectors from callers; this provider exists so the
//! CLI can produce them locally with all-MiniLM-L6-v2 (384 dimensions,
//! L2-normalized).

use std::sync::Mutex;

use anyhow::Result;
use ort::session::Session;
use tokenizers::Tokenizer;

use super::{load_model, EncodedBatch, ModelFiles, ModelKind};
use crate::config::EmbeddingConfig;

/// Number of dimensions in the embedding vectors (all-MiniLM-L6-v2).
pub const EMBEDDING_DIM: usize = 384;

/// Maximum sequence length for all-MiniLM-L6-v2 (trained at 256).
const MAX_SEQ_LEN: usize = 256;

/// Trait for embedding text into vectors.
///
/// Synchronous; async callers should use `tokio::task::spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// Create an embedding provider from config. Only `"local"` is supported.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "local" => Ok(Box::new(LocalEmbeddingProvider::new(config)?)),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: local"),
    }
}

pub struct LocalEmbeddingProvider {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
}

// Safety: Tokenizer is Send+Sync. Session is behind a Mutex.
unsafe impl Send for LocalEmbeddingProvider {}
unsafe impl Sync for LocalEmbeddingProvider {}

impl LocalEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let files = ModelFiles::in_dir(&config.cache_dir);
        let (session, tokenizer) = load_model(&files, ModelKind::Embedding, MAX_SEQ_LEN)?;
        Ok(Self { session, tokenizer })
    }
}

impl EmbeddingProvider for LocalEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text])?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("embedding batch returned no vectors"))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow::anyhow!("tokenization failed: {e}"))?;
        let batch = EncodedBatch::from_encodings(&encodings);

        // Token embeddings: [batch, seq_len, 384]
        let (dims, data) = batch.run(&self.session, &["token_embeddings", "last_hidden_state"])?;
        anyhow::ensure!(
            dims.len() == 3 && dims[2] == EMBEDDING_DIM as i64,
            "unexpected token_embeddings shape: {dims:?}, expected [batch, seq, {EMBEDDING_DIM}]"
        );
        let hidden_dim = dims[2] as usize;
        let actual_seq_len = dims[1] as usize;

        // Mean pooling with attention mask, then L2 normalize
        let mut results = Vec::with_capacity(batch.batch_size);
        for b in 0..batch.batch_size {
            let mut sum = vec![0.0f32; hidden_dim];
            let mut count = 0.0f32;
            for s in 0..actual_seq_len {
                let mask = batch.attention_mask[b * batch.seq_len + s] as f32;
                if mask > 0.0 {
                    let offset = (b * actual_seq_len + s) * hidden_dim;
                    for (d, acc) in sum.iter_mut().enumerate() {
                        *acc += data[offset + d] * mask;
                    }
                    count += mask;
                }
            }
            if count > 0.0 {
                sum.iter_mut().for_each(|v| *v /= count);
            }
            results.push(l2_normalize(&sum));
        }
        Ok(results)
    }
}

/// L2-normalize a vector. Returns a zero vector if the input norm is zero.
pub fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}
