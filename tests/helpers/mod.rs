#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use strongroom::access::connection_bypasses_policies;
use strongroom::config::{AccessRole, IsolationMode, StrongroomConfig};
use strongroom::crypto::generate_keys;
use strongroom::db::schema::partition_table;
use strongroom::rerank::CrossEncoder;
use strongroom::storage::{partition_for, SourceKind};
use strongroom::vault::{IndexRequest, IndexResponse, QueryRequest, QueryResponse};
use strongroom::MemoryVault;
use tempfile::TempDir;

/// Vector width used by the integration tests.
pub const DIMS: usize = 16;

/// An open vault on a temp database. Keeps the directory alive.
pub struct TestVault {
    pub vault: MemoryVault,
    pub config: StrongroomConfig,
    _dir: TempDir,
}

impl TestVault {
    /// A bypassing connection for inspecting and tampering with raw rows.
    pub fn maintenance(&self) -> Connection {
        self.vault.database().maintenance_connection().unwrap()
    }

    /// Physical table holding `tenant_id`'s chunks.
    pub fn table_for(&self, tenant_id: &str) -> String {
        let token = self.vault.tenant_token(tenant_id).unwrap();
        partition_table(partition_for(&token, self.config.storage.partitions))
    }
}

/// Config for a fresh vault under `dir` with random keys and reranking off.
pub fn test_config(dir: &Path, isolation: IsolationMode) -> StrongroomConfig {
    let (encryption_key, tenant_secret) = generate_keys();
    let mut config = StrongroomConfig::default();
    config.storage.db_path = dir.join("vault.db").to_string_lossy().into_owned();
    config.storage.isolation = isolation;
    config.storage.pool_size = 4;
    config.crypto.encryption_key = encryption_key;
    config.crypto.tenant_secret = tenant_secret;
    config.index.dimensions = DIMS;
    config.index.max_elements = 1_000;
    config.rerank.enabled = false;
    config
}

pub fn open_vault(isolation: IsolationMode) -> TestVault {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), isolation);
    open_with(dir, config, None)
}

/// Open with a tweaked config and an optional cross-encoder.
pub fn open_configured(
    isolation: IsolationMode,
    configure: impl FnOnce(&mut StrongroomConfig),
    encoder: Option<Arc<dyn CrossEncoder>>,
) -> TestVault {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), isolation);
    configure(&mut config);
    open_with(dir, config, encoder)
}

fn open_with(dir: TempDir, config: StrongroomConfig, encoder: Option<Arc<dyn CrossEncoder>>) -> TestVault {
    let vault = MemoryVault::open(&config, encoder).unwrap();
    assert_not_bypass(&vault);
    TestVault {
        vault,
        config,
        _dir: dir,
    }
}

/// The harness must never run tenant traffic on a bypassing connection.
pub fn assert_not_bypass(vault: &MemoryVault) {
    assert_eq!(vault.database().role(), AccessRole::Application);
    let conn = vault.database().pool().get().unwrap();
    assert!(
        !connection_bypasses_policies(&conn).unwrap(),
        "pooled connections bypass row policies"
    );
}

/// Deterministic vector with a spike at `seed` over a small shared floor.
/// Distinct seeds are far apart; the same seed is identical.
pub fn test_vector(seed: u8) -> Vec<f32> {
    let mut v = vec![0.01f32; DIMS];
    v[seed as usize % DIMS] = 1.0;
    v
}

/// A vector close to `test_vector(seed)`.
pub fn near_vector(seed: u8) -> Vec<f32> {
    let mut v = test_vector(seed);
    v[(seed as usize + 1) % DIMS] += 0.1;
    v
}

pub fn index_request(tenant: &str, document: &str, text: &str, vector: Vec<f32>) -> IndexRequest {
    IndexRequest {
        tenant_id: tenant.into(),
        document_id: document.into(),
        source_kind: SourceKind::Upload,
        text: text.into(),
        vector,
        metadata: None,
        chunk_index: None,
        ttl_secs: None,
    }
}

pub async fn index_text(vault: &MemoryVault, tenant: &str, document: &str, text: &str, vector: Vec<f32>) -> IndexResponse {
    vault
        .index(index_request(tenant, document, text, vector))
        .await
        .unwrap()
}

pub fn query_request(tenant: &str, vector: Vec<f32>, k: usize) -> QueryRequest {
    QueryRequest {
        tenant_id: tenant.into(),
        query_text: None,
        vector,
        k,
        rerank: false,
    }
}

pub async fn query(vault: &MemoryVault, tenant: &str, vector: Vec<f32>, k: usize) -> QueryResponse {
    vault.query(query_request(tenant, vector, k)).await.unwrap()
}

/// Audit rows for a raw token value, counted through a bypassing connection.
pub fn audit_rows_for(conn: &Connection, token: &str) -> i64 {
    conn.query_row(
        "SELECT COUNT(*) FROM audit_log WHERE tenant_token = ?1",
        [token],
        |row| row.get(0),
    )
    .unwrap()
}
