//! Local ONNX models: the embedding provider and the cross-encoder.
//!
//! Both are MiniLM-style BERT encoders loaded through `ort` with a HuggingFace
//! `tokenizers` tokenizer, so they share session loading, tensor building and
//! download plumbing here.

pub mod cross_encoder;
pub mod embedding;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::{Encoding, Tokenizer};
use tokio::io::AsyncWriteExt;

pub use cross_encoder::LocalCrossEncoder;
pub use embedding::{create_provider, EmbeddingProvider, LocalEmbeddingProvider, EMBEDDING_DIM};

/// Which model a download or load refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Embedding,
    CrossEncoder,
}

impl ModelKind {
    fn urls(&self) -> (&'static str, &'static str) {
        match self {
            Self::Embedding => (
                "https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main/onnx/model.onnx",
                "https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main/tokenizer.json",
            ),
            Self::CrossEncoder => (
                "https://huggingface.co/cross-encoder/ms-marco-MiniLM-L-6-v2/resolve/main/onnx/model.onnx",
                "https://huggingface.co/cross-encoder/ms-marco-MiniLM-L-6-v2/resolve/main/tokenizer.json",
            ),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Embedding => "embedding model",
            Self::CrossEncoder => "cross-encoder",
        }
    }
}

/// On-disk layout of a downloaded model.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub model: PathBuf,
    pub tokenizer: PathBuf,
}

impl ModelFiles {
    pub fn in_dir(cache_dir: &str) -> Self {
        let dir = crate::config::expand_tilde(cache_dir);
        Self {
            model: dir.join("model.onnx"),
            tokenizer: dir.join("tokenizer.json"),
        }
    }

    pub fn exist(&self) -> bool {
        self.model.exists() && self.tokenizer.exists()
    }

    fn ensure_present(&self, kind: ModelKind) -> Result<()> {
        anyhow::ensure!(
            self.model.exists(),
            "{} not found at {}. Run `strongroom model download` first.",
            kind.label(),
            self.model.display()
        );
        anyhow::ensure!(
            self.tokenizer.exists(),
            "tokenizer not found at {}. Run `strongroom model download` first.",
            self.tokenizer.display()
        );
        Ok(())
    }
}

/// Load an ONNX session and a tokenizer truncating at `max_len`, padded per batch.
pub(crate) fn load_model(
    files: &ModelFiles,
    kind: ModelKind,
    max_len: usize,
) -> Result<(Mutex<Session>, Tokenizer)> {
    files.ensure_present(kind)?;

    let session = Session::builder()?
        .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?
        .commit_from_file(&files.model)
        .with_context(|| format!("failed to load {}", kind.label()))?;
    tracing::info!(model = %files.model.display(), kind = kind.label(), "ONNX model loaded");

    let mut tokenizer = Tokenizer::from_file(&files.tokenizer)
        .map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;
    tokenizer
        .with_truncation(Some(tokenizers::TruncationParams {
            max_length: max_len,
            ..Default::default()
        }))
        .map_err(|e| anyhow::anyhow!("failed to set truncation: {e}"))?;
    tokenizer.with_padding(Some(tokenizers::PaddingParams {
        strategy: tokenizers::PaddingStrategy::BatchLongest,
        ..Default::default()
    }));

    Ok((Mutex::new(session), tokenizer))
}

/// Flattened `[batch, seq]` BERT inputs.
pub(crate) struct EncodedBatch {
    pub batch_size: usize,
    pub seq_len: usize,
    pub input_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
    pub token_type_ids: Vec<i64>,
}

impl EncodedBatch {
    pub fn from_encodings(encodings: &[Encoding]) -> Self {
        let batch_size = encodings.len();
        let seq_len = encodings.first().map(|e| e.get_ids().len()).unwrap_or(0);
        let mut batch = Self {
            batch_size,
            seq_len,
            input_ids: Vec::with_capacity(batch_size * seq_len),
            attention_mask: Vec::with_capacity(batch_size * seq_len),
            token_type_ids: Vec::with_capacity(batch_size * seq_len),
        };
        for encoding in encodings {
            batch.input_ids.extend(encoding.get_ids().iter().map(|&id| id as i64));
            batch
                .attention_mask
                .extend(encoding.get_attention_mask().iter().map(|&m| m as i64));
            batch
                .token_type_ids
                .extend(encoding.get_type_ids().iter().map(|&t| t as i64));
        }
        batch
    }

    /// Run the session and return the first matching output as `(shape, data)`.
    pub fn run(&self, session: &Mutex<Session>, output_names: &[&str]) -> Result<(Vec<i64>, Vec<f32>)> {
        let shape = vec![self.batch_size as i64, self.seq_len as i64];
        let input_ids = Tensor::from_array((shape.clone(), self.input_ids.clone().into_boxed_slice()))?;
        let attention_mask =
            Tensor::from_array((shape.clone(), self.attention_mask.clone().into_boxed_slice()))?;
        let token_type_ids =
            Tensor::from_array((shape, self.token_type_ids.clone().into_boxed_slice()))?;

        let mut session = session
            .lock()
            .map_err(|e| anyhow::anyhow!("session lock poisoned: {e}"))?;
        let outputs = session.run(ort::inputs! {
            "input_ids" => input_ids,
            "attention_mask" => attention_mask,
            "token_type_ids" => token_type_ids,
        })?;

        // The output name varies by ONNX export. Try known names, fall back to index 0.
        let value = output_names
            .iter()
            .find_map(|name| outputs.get(*name))
            .unwrap_or_else(|| &outputs[0]);
        let (shape, data) = value
            .try_extract_tensor::<f32>()
            .context("failed to extract output tensor")?;
        let dims: &[i64] = &shape;
        Ok((dims.to_vec(), data.to_vec()))
    }
}

/// Download a model and its tokenizer into `cache_dir`.
pub async fn download_model(kind: ModelKind, cache_dir: &str) -> Result<()> {
    let files = ModelFiles::in_dir(cache_dir);
    if let Some(dir) = files.model.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create cache dir: {}", dir.display()))?;
    }
    let (model_url, tokenizer_url) = kind.urls();

    if files.model.exists() {
        println!("{} already exists at {}", kind.label(), files.model.display());
    } else {
        println!("Downloading {} (~90MB)...", kind.label());
        download_file(model_url, &files.model).await?;
        println!("Saved to {}", files.model.display());
    }

    if files.tokenizer.exists() {
        println!("Tokenizer already exists at {}", files.tokenizer.display());
    } else {
        println!("Downloading tokenizer.json...");
        download_file(tokenizer_url, &files.tokenizer).await?;
        println!("Tokenizer saved to {}", files.tokenizer.display());
    }
    Ok(())
}

/// Download a file from a URL with progress bar. Uses atomic write (tmp + rename).
async fn download_file(url: &str, dest: &Path) -> Result<()> {
    let mut response = reqwest::get(url)
        .await
        .with_context(|| format!("HTTP request failed for {url}"))?;

    anyhow::ensure!(
        response.status().is_success(),
        "download failed with HTTP {}",
        response.status()
    );

    let pb = match response.content_length() {
        Some(size) => {
            let pb = ProgressBar::new(size);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("  {bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})")
                    .context("invalid progress template")?
                    .progress_chars("##-"),
            );
            pb
        }
        None => ProgressBar::new_spinner(),
    };

    let tmp_path = dest.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;

    while let Some(chunk) = response.chunk().await.context("error reading response")? {
        file.write_all(&chunk).await.context("error writing to file")?;
        pb.inc(chunk.len() as u64);
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, dest)
        .await
        .context("failed to rename temp file")?;

    pb.finish_and_clear();
    Ok(())
}
