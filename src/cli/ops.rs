//! CLI wrappers over the vault operations. Results print as JSON on stdout;
//! rejections print their wire body on stderr.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use strongroom::config::StrongroomConfig;
use strongroom::models::{create_provider, EmbeddingProvider};
use strongroom::storage::SourceKind;
use strongroom::vault::{IndexRequest, QueryRequest};
use strongroom::Rejection;

use super::open_vault;

pub struct IndexArgs {
    pub tenant: String,
    pub document: String,
    pub source: SourceKind,
    pub metadata: Option<serde_json::Value>,
    pub chunk_index: Option<u32>,
    pub ttl: Option<u64>,
    pub text: String,
}

async fn embed(config: &StrongroomConfig, text: &str) -> Result<Vec<f32>> {
    let provider: Arc<dyn EmbeddingProvider> = Arc::from(create_provider(&config.embedding)?);
    anyhow::ensure!(
        provider.dimensions() == config.index.dimensions,
        "embedding model produces {} dimensions but index.dimensions = {}",
        provider.dimensions(),
        config.index.dimensions
    );
    let text = text.to_string();
    tokio::task::spawn_blocking(move || provider.embed(&text)).await?
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn rejected(rejection: Rejection) -> anyhow::Error {
    match serde_json::to_string(&rejection.body()) {
        Ok(body) => eprintln!("{body}"),
        Err(e) => eprintln!("{rejection} ({e})"),
    }
    anyhow::Error::new(rejection)
}

pub async fn index(config: &StrongroomConfig, args: IndexArgs) -> Result<()> {
    let vector = embed(config, &args.text).await?;
    let vault = open_vault(config)?;
    let response = vault
        .index(IndexRequest {
            tenant_id: args.tenant,
            document_id: args.document,
            source_kind: args.source,
            text: args.text,
            vector,
            metadata: args.metadata,
            chunk_index: args.chunk_index,
            ttl_secs: args.ttl,
        })
        .await
        .map_err(rejected)?;
    print_json(&response)
}

pub async fn query(config: &StrongroomConfig, tenant: &str, text: &str, k: usize, rerank: bool) -> Result<()> {
    let vector = embed(config, text).await?;
    let vault = open_vault(config)?;
    let response = vault
        .query(QueryRequest {
            tenant_id: tenant.to_string(),
            query_text: Some(text.to_string()),
            vector,
            k,
            rerank,
        })
        .await
        .map_err(rejected)?;
    print_json(&response)
}

pub async fn summarize(config: &StrongroomConfig, tenant: &str, document: &str) -> Result<()> {
    let vault = open_vault(config)?;
    let response = vault.summarize(tenant, document).await.map_err(rejected)?;
    println!("{}", response.text);
    Ok(())
}

pub async fn entities(config: &StrongroomConfig, tenant: &str, document: &str) -> Result<()> {
    let vault = open_vault(config)?;
    let response = vault.entities(tenant, document).await.map_err(rejected)?;
    print_json(&response)
}

pub async fn delete(config: &StrongroomConfig, tenant: &str, chunk_id: &str) -> Result<()> {
    let vault = open_vault(config)?;
    let response = vault.delete(tenant, chunk_id).await.map_err(rejected)?;
    print_json(&response)
}

pub async fn audit(config: &StrongroomConfig, tenant: &str, limit: usize) -> Result<()> {
    let vault = open_vault(config)?;
    let trail = vault.audit_trail(tenant, limit).await.map_err(rejected)?;
    print_json(&trail)
}

pub async fn purge(config: &StrongroomConfig) -> Result<()> {
    let vault = open_vault(config)?;
    let report = vault.purge_expired().await.map_err(rejected)?;
    print_json(&report)
}

pub async fn verify(config: &StrongroomConfig, tenant: &str) -> Result<()> {
    let vault = open_vault(config)?;
    let report = vault.verify_vectors(tenant).await.map_err(rejected)?;
    print_json(&report)?;
    anyhow::ensure!(report.is_clean(), "vector backups disagree with stored vectors");
    Ok(())
}
