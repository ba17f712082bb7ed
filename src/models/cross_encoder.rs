use std::sync::Mutex;
use std::time::Instant;

use anyhow::Result;
use ort::session::Session;
use tokenizers::Tokenizer;

use super::{load_model, EncodedBatch, ModelFiles, ModelKind};
use crate::config::RerankConfig;
use crate::rerank::{CrossEncoder, DeadlineExceeded};

const MAX_SEQ_LEN: usize = 512;
/// Pairs scored per inference call; the deadline is checked between batches.
const BATCH_SIZE: usize = 8;

/// ms-marco-MiniLM-L-6-v2 cross-encoder. Emits one relevance logit per
/// `(query, passage)` pair, squashed through a sigmoid.
pub struct LocalCrossEncoder {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    name: String,
}

// Safety: Tokenizer is Send+Sync. Session is behind a Mutex.
unsafe impl Send for LocalCrossEncoder {}
unsafe impl Sync for LocalCrossEncoder {}

impl LocalCrossEncoder {
    pub fn new(config: &RerankConfig) -> Result<Self> {
        let files = ModelFiles::in_dir(&config.cache_dir);
        let (session, tokenizer) = load_model(&files, ModelKind::CrossEncoder, MAX_SEQ_LEN)?;
        Ok(Self {
            session,
            tokenizer,
            name: config.model.clone(),
        })
    }

    fn score_batch(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        let pairs: Vec<(&str, &str)> = passages.iter().map(|p| (query, p.as_str())).collect();
        let encodings = self
            .tokenizer
            .encode_batch(pairs, true)
            .map_err(|e| anyhow::anyhow!("tokenization failed: {e}"))?;
        let batch = EncodedBatch::from_encodings(&encodings);

        // Logits: [batch, 1]
        let (dims, data) = batch.run(&self.session, &["logits"])?;
        anyhow::ensure!(
            dims.first() == Some(&(passages.len() as i64)) && data.len() >= passages.len(),
            "unexpected logits shape: {dims:?}"
        );
        let stride = data.len() / passages.len();
        Ok((0..passages.len()).map(|i| sigmoid(data[i * stride])).collect())
    }
}

impl CrossEncoder for LocalCrossEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn score(&self, query: &str, passages: &[String], deadline: Instant) -> Result<Vec<f32>> {
        let mut scores = Vec::with_capacity(passages.len());
        for chunk in passages.chunks(BATCH_SIZE) {
            if Instant::now() >= deadline {
                return Err(DeadlineExceeded.into());
            }
            scores.extend(self.score_batch(query, chunk)?);
        }
        Ok(scores)
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
