pub mod doctor;
pub mod init;
pub mod ops;

use std::sync::Arc;

use anyhow::{Context, Result};

use strongroom::config::StrongroomConfig;
use strongroom::models::{self, LocalCrossEncoder, ModelFiles, ModelKind};
use strongroom::rerank::CrossEncoder;
use strongroom::MemoryVault;

/// Download the ONNX embedding model and cross-encoder to their cache directories.
pub async fn model_download(config: &StrongroomConfig) -> Result<()> {
    models::download_model(ModelKind::Embedding, &config.embedding.cache_dir).await?;
    models::download_model(ModelKind::CrossEncoder, &config.rerank.cache_dir).await?;
    println!("Model download complete. Ready for use.");
    Ok(())
}

/// Open the vault, loading the cross-encoder when reranking is enabled and
/// the model is present.
pub fn open_vault(config: &StrongroomConfig) -> Result<MemoryVault> {
    let encoder: Option<Arc<dyn CrossEncoder>> = if !config.rerank.enabled {
        None
    } else if !ModelFiles::in_dir(&config.rerank.cache_dir).exist() {
        tracing::warn!("cross-encoder not downloaded, reranking disabled");
        None
    } else {
        Some(Arc::new(
            LocalCrossEncoder::new(&config.rerank).context("failed to load cross-encoder")?,
        ))
    };
    MemoryVault::open(config, encoder).context("failed to open vault")
}
