//! The memory vault: tenant-isolated index, query, summarize, delete.
//!
//! [`MemoryVault`] wires the layers together. Every public operation gets a
//! fresh request id, runs its database work on `spawn_blocking` with its own
//! [`TenantSession`], and writes audit rows for both outcomes. Errors come back
//! as a [`Rejection`] carrying the request id.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::access::TenantSession;
use crate::audit::{self, AuditEvent, AuditOperation, AuditRecord};
use crate::config::StrongroomConfig;
use crate::crypto::{chunk_aad, SealedField, TenantCrypto, TenantToken};
use crate::db::{open_database, Database, HealthReport};
use crate::entities::{extract_entities, Entity};
use crate::error::{DecryptFault, Error, Rejection, Result};
use crate::index::AnnIndex;
use crate::rerank::{CrossEncoder, RerankMetrics, RerankOutcome, Reranker};
use crate::search::{validate_vector, QueryCache, SearchStats, Searcher};
use crate::storage::{
    backend_for, bytes_to_vector, format_timestamp, partition_for, purge_expired_rows,
    vector_to_bytes, ChunkBackend, ChunkRecord, NewChunk, PurgedChunk, SourceKind,
};

/// Upper bound on audit rows returned by one `audit_trail` call.
pub const MAX_AUDIT_LIMIT: usize = 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct IndexRequest {
    pub tenant_id: String,
    pub document_id: String,
    pub source_kind: SourceKind,
    pub text: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// Assigned as the next free index for the document when omitted.
    #[serde(default)]
    pub chunk_index: Option<u32>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexResponse {
    pub request_id: String,
    pub chunk_id: String,
    pub chunk_index: u32,
    pub partition: u32,
    pub expires_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub tenant_id: String,
    /// Required when `rerank` is set.
    #[serde(default)]
    pub query_text: Option<String>,
    pub vector: Vec<f32>,
    pub k: usize,
    #[serde(default)]
    pub rerank: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryHit {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: u32,
    pub score: f32,
    pub rerank_score: Option<f32>,
    pub text: String,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub request_id: String,
    pub results: Vec<QueryHit>,
    /// `None` when reranking was not requested.
    pub rerank: Option<RerankOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryResponse {
    pub request_id: String,
    pub document_id: String,
    pub chunk_count: usize,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntitiesResponse {
    pub request_id: String,
    pub document_id: String,
    pub entities: Vec<Entity>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteResponse {
    pub request_id: String,
    pub chunk_id: String,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditTrail {
    pub request_id: String,
    pub records: Vec<AuditRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub request_id: String,
    pub checked: usize,
    /// Backup decrypted but differs from the stored plaintext vector.
    pub mismatched: Vec<String>,
    /// Backup envelope failed authentication.
    pub undecryptable: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.mismatched.is_empty() && self.undecryptable.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PurgeReport {
    pub request_id: String,
    pub purged: usize,
    /// Purged rows per partition.
    pub partitions: Vec<usize>,
}

/// Cheaply cloneable handle to an open vault.
#[derive(Clone)]
pub struct MemoryVault {
    inner: Arc<VaultInner>,
}

impl std::fmt::Debug for MemoryVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryVault")
            .field("db", &self.inner.db)
            .field("index", &self.inner.index)
            .finish_non_exhaustive()
    }
}

struct VaultInner {
    db: Database,
    crypto: TenantCrypto,
    backend: Box<dyn ChunkBackend>,
    index: Arc<AnnIndex>,
    searcher: Searcher,
    reranker: Reranker,
    rerank_candidates: usize,
    max_k: usize,
}

/// Chunk the failing step was working on, for the failure audit row.
#[derive(Default)]
struct Attempt {
    chunk_id: Option<String>,
}

fn new_request_id() -> String {
    Uuid::now_v7().to_string()
}

impl MemoryVault {
    /// Open the vault: validate config, open the database, check isolation and
    /// load the ANN graphs from stored vectors.
    ///
    /// Refuses to start when pooled connections would bypass row policies or
    /// when row policies are configured but missing.
    pub fn open(config: &StrongroomConfig, encoder: Option<Arc<dyn CrossEncoder>>) -> Result<Self> {
        config.validate()?;
        let crypto = TenantCrypto::from_config(&config.crypto)?;
        let db = open_database(&config.storage, config.resolved_db_path())?;
        db.verify_isolation()?;
        db.bind_embedding_model(&config.embedding.model)?;

        let index = Arc::new(AnnIndex::new(&config.index, db.partitions()));
        {
            let conn = db.maintenance_connection()?;
            index.rebuild(&conn)?;
        }

        let searcher = Searcher::new(
            Arc::clone(&index),
            QueryCache::new(&config.cache),
            &config.index,
        );
        let reranker = Reranker::new(encoder, &config.rerank);

        info!(
            isolation = db.isolation().as_str(),
            partitions = db.partitions(),
            role = db.role().as_str(),
            embedding_model = %config.embedding.model,
            cross_encoder = reranker.encoder_name().unwrap_or("none"),
            rerank = reranker.is_enabled(),
            "vault opened"
        );

        Ok(Self {
            inner: Arc::new(VaultInner {
                backend: backend_for(db.isolation()),
                db,
                crypto,
                index,
                searcher,
                reranker,
                rerank_candidates: config.rerank.candidate_limit,
                max_k: config.index.max_k,
            }),
        })
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    /// Tenant token for a user identifier.
    pub fn tenant_token(&self, tenant_id: &str) -> Result<TenantToken> {
        self.inner.crypto.derive_tenant_token(tenant_id)
    }

    pub fn search_stats(&self) -> SearchStats {
        self.inner.searcher.stats()
    }

    pub fn rerank_metrics(&self) -> RerankMetrics {
        self.inner.reranker.metrics()
    }

    pub fn health(&self) -> Result<HealthReport> {
        self.inner.db.health()
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&VaultInner) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || work(inner.as_ref())).await?
    }

    /// Seal and store one chunk.
    pub async fn index(&self, request: IndexRequest) -> Result<IndexResponse, Rejection> {
        let request_id = new_request_id();
        let rid = request_id.clone();
        self.blocking(move |inner| inner.index(&rid, request))
            .await
            .map_err(|e| Rejection::new(request_id, e))
    }

    /// Up to `k` chunks nearest to the query vector, decrypted. Fails closed
    /// if any candidate fails authentication.
    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse, Rejection> {
        let request_id = new_request_id();
        self.query_inner(&request_id, request)
            .await
            .map_err(|e| Rejection::new(request_id, e))
    }

    async fn query_inner(&self, request_id: &str, request: QueryRequest) -> Result<QueryResponse> {
        let k = request.k;
        let widen = request.rerank && self.inner.reranker.is_enabled();
        let fetch_k = if widen {
            k.max(self.inner.rerank_candidates).min(self.inner.max_k)
        } else {
            k
        };

        let rid = request_id.to_string();
        let tenant_id = request.tenant_id.clone();
        let vector = request.vector.clone();
        let needs_text = request.rerank;
        let has_text = request
            .query_text
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty());
        let (token, mut hits) = self
            .blocking(move |inner| {
                inner.scoped(&tenant_id, AuditOperation::Query, &rid, |session, token, attempt| {
                    if needs_text && !has_text {
                        return Err(Error::Validation("rerank requires query text".into()));
                    }
                    inner.searcher.validate_query(&vector, k)?;
                    let hits = inner.candidates(session, token, attempt, &vector, fetch_k)?;
                    Ok((token.clone(), hits))
                })
            })
            .await?;

        let outcome = match request.query_text.filter(|_| request.rerank) {
            Some(query_text) => {
                let passages: Vec<String> = hits.iter().map(|h| h.text.clone()).collect();
                let reranked = self.inner.reranker.rerank(&query_text, passages).await;
                // Anything short of a completed pass keeps the ANN order.
                if reranked.outcome.reordered() {
                    let mut slots: Vec<Option<QueryHit>> = hits.into_iter().map(Some).collect();
                    hits = reranked
                        .order
                        .iter()
                        .filter_map(|&i| {
                            let mut hit = slots.get_mut(i)?.take()?;
                            hit.rerank_score = reranked.scores.as_ref().and_then(|s| s.get(i).copied());
                            Some(hit)
                        })
                        .collect();
                }
                Some(reranked.outcome)
            }
            None => None,
        };
        hits.truncate(k);

        let rid = request_id.to_string();
        let returned: Vec<String> = hits.iter().map(|h| h.chunk_id.clone()).collect();
        self.blocking(move |inner| inner.record_reads(&token, AuditOperation::Query, &rid, &returned))
            .await?;

        debug!(request_id, results = hits.len(), rerank = ?outcome, "query served");
        Ok(QueryResponse {
            request_id: request_id.to_string(),
            results: hits,
            rerank: outcome,
        })
    }

    /// A document's visible chunks in order, joined by blank lines.
    pub async fn summarize(&self, tenant_id: &str, document_id: &str) -> Result<SummaryResponse, Rejection> {
        let request_id = new_request_id();
        let (rid, tenant_id, document_id) =
            (request_id.clone(), tenant_id.to_string(), document_id.to_string());
        self.blocking(move |inner| {
            let texts = inner.read_document(&tenant_id, &document_id, AuditOperation::Summarize, &rid)?;
            Ok(SummaryResponse {
                request_id: rid,
                chunk_count: texts.len(),
                text: texts.join("\n\n"),
                document_id,
            })
        })
        .await
        .map_err(|e| Rejection::new(request_id, e))
    }

    /// Reference numbers, dates, emails and names found in a document.
    pub async fn entities(&self, tenant_id: &str, document_id: &str) -> Result<EntitiesResponse, Rejection> {
        let request_id = new_request_id();
        let (rid, tenant_id, document_id) =
            (request_id.clone(), tenant_id.to_string(), document_id.to_string());
        self.blocking(move |inner| {
            let texts = inner.read_document(&tenant_id, &document_id, AuditOperation::Entities, &rid)?;
            Ok(EntitiesResponse {
                request_id: rid,
                entities: extract_entities(&texts),
                document_id,
            })
        })
        .await
        .map_err(|e| Rejection::new(request_id, e))
    }

    /// Delete one of the tenant's chunks. Absent chunks and other tenants'
    /// chunks are both `NotFound`.
    pub async fn delete(&self, tenant_id: &str, chunk_id: &str) -> Result<DeleteResponse, Rejection> {
        let request_id = new_request_id();
        let (rid, tenant_id, chunk_id) =
            (request_id.clone(), tenant_id.to_string(), chunk_id.to_string());
        self.blocking(move |inner| inner.delete(&rid, &tenant_id, &chunk_id))
            .await
            .map_err(|e| Rejection::new(request_id, e))
    }

    /// The tenant's audit rows, newest first.
    pub async fn audit_trail(&self, tenant_id: &str, limit: usize) -> Result<AuditTrail, Rejection> {
        let request_id = new_request_id();
        let (rid, tenant_id) = (request_id.clone(), tenant_id.to_string());
        self.blocking(move |inner| {
            let records = inner.scoped(&tenant_id, AuditOperation::Audit, &rid, |session, token, _| {
                if limit == 0 || limit > MAX_AUDIT_LIMIT {
                    return Err(Error::Validation(format!(
                        "limit must be within 1..={MAX_AUDIT_LIMIT}"
                    )));
                }
                let records = audit::list_for_tenant(session.conn(), inner.db.isolation(), token, limit)?;
                audit::record(
                    session.conn(),
                    &AuditEvent::success(token.as_str(), AuditOperation::Audit, &rid),
                )?;
                Ok(records)
            })?;
            Ok(AuditTrail {
                request_id: rid,
                records,
            })
        })
        .await
        .map_err(|e| Rejection::new(request_id, e))
    }

    /// Open every vector backup of the tenant and compare it with the stored
    /// plaintext vector.
    pub async fn verify_vectors(&self, tenant_id: &str) -> Result<VerifyReport, Rejection> {
        let request_id = new_request_id();
        let (rid, tenant_id) = (request_id.clone(), tenant_id.to_string());
        self.blocking(move |inner| inner.verify_vectors(&rid, &tenant_id))
            .await
            .map_err(|e| Rejection::new(request_id, e))
    }

    /// Delete expired rows across all tenants.
    pub async fn purge_expired(&self) -> Result<PurgeReport, Rejection> {
        let request_id = new_request_id();
        let rid = request_id.clone();
        self.blocking(move |inner| inner.purge_expired(&rid))
            .await
            .map_err(|e| Rejection::new(request_id, e))
    }
}

impl VaultInner {
    fn partition(&self, token: &TenantToken) -> u32 {
        partition_for(token, self.db.partitions())
    }

    /// Derive the token, pin a session and run `work`. Failures are audited on
    /// the same session; unresolvable tenants are audited with the empty token.
    fn scoped<T>(
        &self,
        tenant_id: &str,
        operation: AuditOperation,
        request_id: &str,
        work: impl FnOnce(&mut TenantSession, &TenantToken, &mut Attempt) -> Result<T>,
    ) -> Result<T> {
        let token = match self.crypto.derive_tenant_token(tenant_id) {
            Ok(token) => token,
            Err(e) => {
                self.audit_unscoped_failure(operation, request_id, &e);
                return Err(e);
            }
        };
        let mut session = TenantSession::begin(self.db.pool(), &token).inspect_err(|e| {
            warn!(request_id, operation = operation.as_str(), error = %e, "could not start tenant session");
        })?;

        let mut attempt = Attempt::default();
        match work(&mut session, &token, &mut attempt) {
            Ok(value) => Ok(value),
            Err(e) => {
                let detail = e.audit_detail();
                let event = AuditEvent {
                    chunk_id: attempt.chunk_id.as_deref(),
                    ..AuditEvent::failure(token.as_str(), operation, request_id, e.code(), &detail)
                };
                if let Err(audit_err) = audit::record(session.conn(), &event) {
                    warn!(request_id, error = %audit_err, "failed to audit rejected request");
                }
                warn!(
                    request_id,
                    tenant = token.short(),
                    operation = operation.as_str(),
                    code = %e.code(),
                    "request rejected"
                );
                Err(e)
            }
        }
    }

    fn audit_unscoped_failure(&self, operation: AuditOperation, request_id: &str, error: &Error) {
        let detail = error.audit_detail();
        let recorded = TenantSession::unscoped(self.db.pool()).and_then(|session| {
            audit::record(
                session.conn(),
                &AuditEvent::failure("", operation, request_id, error.code(), &detail),
            )
        });
        if let Err(e) = recorded {
            warn!(request_id, error = %e, "failed to audit unscoped request");
        }
        warn!(request_id, operation = operation.as_str(), code = %error.code(), "request without tenant rejected");
    }

    /// One success row per returned chunk, or a single row when nothing was returned.
    fn record_reads(
        &self,
        token: &TenantToken,
        operation: AuditOperation,
        request_id: &str,
        chunk_ids: &[String],
    ) -> Result<()> {
        let mut session = TenantSession::begin(self.db.pool(), token)?;
        let tx = session.transaction()?;
        write_read_rows(&tx, token, operation, request_id, chunk_ids)?;
        tx.commit()?;
        Ok(())
    }

    fn open_text(&self, token: &TenantToken, record: &ChunkRecord) -> Result<String> {
        let bytes = self.crypto.open_sealed(
            &record.cipher_text,
            &chunk_aad(token, &record.id, SealedField::Text),
        )?;
        String::from_utf8(bytes).map_err(|_| Error::DecryptionFailure(DecryptFault::NotUtf8))
    }

    fn open_metadata(&self, token: &TenantToken, record: &ChunkRecord) -> Result<Option<serde_json::Value>> {
        let Some(sealed) = &record.cipher_metadata else {
            return Ok(None);
        };
        let bytes = self
            .crypto
            .open_sealed(sealed, &chunk_aad(token, &record.id, SealedField::Metadata))?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|_| Error::DecryptionFailure(DecryptFault::NotJson))
    }

    fn index(&self, request_id: &str, request: IndexRequest) -> Result<IndexResponse> {
        self.scoped(&request.tenant_id, AuditOperation::Index, request_id, |session, token, attempt| {
            if request.document_id.trim().is_empty() {
                return Err(Error::Validation("document_id must not be empty".into()));
            }
            if request.text.is_empty() {
                return Err(Error::Validation("text must not be empty".into()));
            }
            self.index.check_dimensions(&request.vector)?;
            validate_vector(&request.vector)?;
            let expires_at = request.ttl_secs.map(expiry_after).transpose()?;

            let partition = self.partition(token);
            let chunk_id = Uuid::now_v7().to_string();
            attempt.chunk_id = Some(chunk_id.clone());

            let cipher_text = self.crypto.seal(
                request.text.as_bytes(),
                &chunk_aad(token, &chunk_id, SealedField::Text),
            )?;
            let cipher_metadata = match &request.metadata {
                Some(metadata) => Some(self.crypto.seal(
                    &serde_json::to_vec(metadata)?,
                    &chunk_aad(token, &chunk_id, SealedField::Metadata),
                )?),
                None => None,
            };
            let cipher_vector_backup = self.crypto.seal(
                &vector_to_bytes(&request.vector),
                &chunk_aad(token, &chunk_id, SealedField::Vector),
            )?;

            let tx = session.transaction()?;
            let chunk_index = match request.chunk_index {
                Some(index) => index,
                None => self
                    .backend
                    .next_chunk_index(&tx, token, partition, &request.document_id)?,
            };
            let chunk = NewChunk {
                id: chunk_id.clone(),
                document_id: request.document_id.clone(),
                source_kind: request.source_kind,
                chunk_index,
                plaintext_vector: request.vector.clone(),
                cipher_text,
                cipher_metadata,
                cipher_vector_backup,
                expires_at: expires_at.clone(),
            };
            self.backend.insert(&tx, token, partition, &chunk)?;
            audit::record(
                &tx,
                &AuditEvent::success(token.as_str(), AuditOperation::Index, request_id).with_chunk(&chunk_id),
            )?;
            tx.commit()?;

            // The row is committed; a graph miss is covered by the exact fallback.
            if let Err(e) = self.index.insert(partition, &chunk_id, &request.vector) {
                warn!(request_id, chunk_id = %chunk_id, error = %e, "chunk stored but not added to ANN graph");
            }
            self.searcher.cache().invalidate_tenant(token.as_str());

            info!(
                request_id,
                chunk_id = %chunk_id,
                partition,
                chunk_index,
                text_len = request.text.len(),
                "chunk indexed"
            );
            Ok(IndexResponse {
                request_id: request_id.to_string(),
                chunk_id,
                chunk_index,
                partition,
                expires_at,
            })
        })
    }

    /// Search, hydrate and decrypt up to `fetch_k` candidates in score order.
    fn candidates(
        &self,
        session: &TenantSession,
        token: &TenantToken,
        attempt: &mut Attempt,
        vector: &[f32],
        fetch_k: usize,
    ) -> Result<Vec<QueryHit>> {
        let partition = self.partition(token);
        let hits = self
            .searcher
            .search(session, self.backend.as_ref(), partition, vector, fetch_k)?;
        let ids: Vec<String> = hits.iter().map(|h| h.chunk_id.clone()).collect();
        let mut records: HashMap<String, ChunkRecord> = self
            .backend
            .fetch_by_ids(session.conn(), token, partition, &ids)?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        let mut out = Vec::with_capacity(hits.len());
        for hit in hits {
            // Expired between search and hydration.
            let Some(record) = records.remove(&hit.chunk_id) else {
                continue;
            };
            attempt.chunk_id = Some(record.id.clone());
            let text = self.open_text(token, &record)?;
            let metadata = self.open_metadata(token, &record)?;
            out.push(QueryHit {
                chunk_id: record.id,
                document_id: record.document_id,
                chunk_index: record.chunk_index,
                score: hit.score,
                rerank_score: None,
                text,
                metadata,
            });
        }
        attempt.chunk_id = None;
        Ok(out)
    }

    /// Decrypted text of every visible chunk of a document, in order.
    fn read_document(
        &self,
        tenant_id: &str,
        document_id: &str,
        operation: AuditOperation,
        request_id: &str,
    ) -> Result<Vec<String>> {
        self.scoped(tenant_id, operation, request_id, |session, token, attempt| {
            if document_id.trim().is_empty() {
                return Err(Error::Validation("document_id must not be empty".into()));
            }
            let partition = self.partition(token);
            let records = self
                .backend
                .fetch_document(session.conn(), token, partition, document_id)?;
            if records.is_empty() {
                return Err(Error::NotFound("document".into()));
            }

            let mut texts = Vec::with_capacity(records.len());
            for record in &records {
                attempt.chunk_id = Some(record.id.clone());
                texts.push(self.open_text(token, record)?);
            }
            attempt.chunk_id = None;

            let ids: Vec<String> = records.into_iter().map(|r| r.id).collect();
            let tx = session.transaction()?;
            write_read_rows(&tx, token, operation, request_id, &ids)?;
            tx.commit()?;
            debug!(request_id, operation = operation.as_str(), chunks = texts.len(), "document read");
            Ok(texts)
        })
    }

    fn delete(&self, request_id: &str, tenant_id: &str, chunk_id: &str) -> Result<DeleteResponse> {
        self.scoped(tenant_id, AuditOperation::Delete, request_id, |session, token, attempt| {
            if chunk_id.trim().is_empty() {
                return Err(Error::Validation("chunk_id must not be empty".into()));
            }
            attempt.chunk_id = Some(chunk_id.to_string());
            let partition = self.partition(token);

            let tx = session.transaction()?;
            let visible = self
                .backend
                .fetch_by_ids(&tx, token, partition, &[chunk_id.to_string()])?;
            if visible.is_empty() || !self.backend.delete(&tx, token, partition, chunk_id)? {
                return Err(Error::NotFound("chunk".into()));
            }
            audit::record(
                &tx,
                &AuditEvent::success(token.as_str(), AuditOperation::Delete, request_id).with_chunk(chunk_id),
            )?;
            tx.commit()?;

            self.index.remove(partition, chunk_id);
            self.searcher.cache().invalidate_tenant(token.as_str());
            info!(request_id, chunk_id, partition, "chunk deleted");
            Ok(DeleteResponse {
                request_id: request_id.to_string(),
                chunk_id: chunk_id.to_string(),
                deleted: true,
            })
        })
    }

    fn verify_vectors(&self, request_id: &str, tenant_id: &str) -> Result<VerifyReport> {
        self.scoped(tenant_id, AuditOperation::Verify, request_id, |session, token, _| {
            let partition = self.partition(token);
            let records = self.backend.fetch_all(session.conn(), token, partition)?;

            let mut mismatched = Vec::new();
            let mut undecryptable = Vec::new();
            for record in &records {
                let aad = chunk_aad(token, &record.id, SealedField::Vector);
                match self.crypto.open_sealed(&record.cipher_vector_backup, &aad) {
                    Ok(bytes) => {
                        let matches = bytes_to_vector(&bytes)
                            .map(|backup| same_bits(&backup, &record.plaintext_vector))
                            .unwrap_or(false);
                        if !matches {
                            mismatched.push(record.id.clone());
                        }
                    }
                    Err(_) => undecryptable.push(record.id.clone()),
                }
            }

            let detail = format!(
                "checked={} mismatched={} undecryptable={}",
                records.len(),
                mismatched.len(),
                undecryptable.len()
            );
            audit::record(
                session.conn(),
                &AuditEvent {
                    detail: Some(&detail),
                    ..AuditEvent::success(token.as_str(), AuditOperation::Verify, request_id)
                },
            )?;
            if !mismatched.is_empty() || !undecryptable.is_empty() {
                warn!(request_id, tenant = token.short(), %detail, "vector backups disagree with stored vectors");
            }
            Ok(VerifyReport {
                request_id: request_id.to_string(),
                checked: records.len(),
                mismatched,
                undecryptable,
            })
        })
    }

    fn purge_expired(&self, request_id: &str) -> Result<PurgeReport> {
        let mut conn = self.db.maintenance_connection()?;
        let now = crate::storage::now_timestamp();

        let mut partitions = Vec::with_capacity(self.db.partitions() as usize);
        let mut purged: Vec<PurgedChunk> = Vec::new();
        for partition in 0..self.db.partitions() {
            let swept = match purge_partition(&mut conn, partition, &now, request_id) {
                Ok(swept) => swept,
                Err(e) => {
                    let detail = e.audit_detail();
                    let event = AuditEvent::failure("", AuditOperation::Purge, request_id, e.code(), &detail);
                    if let Err(audit_err) = audit::record(&conn, &event) {
                        warn!(request_id, error = %audit_err, "failed to audit purge failure");
                    }
                    warn!(request_id, partition, error = %e, "expiry sweep failed");
                    return Err(e);
                }
            };
            partitions.push(swept.len());
            purged.extend(swept);
        }

        for chunk in &purged {
            self.index.remove(chunk.partition, &chunk.id);
        }
        self.searcher.cache().clear();

        info!(request_id, purged = purged.len(), "expired chunks purged");
        Ok(PurgeReport {
            request_id: request_id.to_string(),
            purged: purged.len(),
            partitions,
        })
    }
}

fn purge_partition(
    conn: &mut rusqlite::Connection,
    partition: u32,
    now: &str,
    request_id: &str,
) -> Result<Vec<PurgedChunk>> {
    let tx = conn.transaction()?;
    let swept = purge_expired_rows(&tx, partition, now)?;
    for chunk in &swept {
        audit::record(
            &tx,
            &AuditEvent::success(chunk.tenant_token.as_str(), AuditOperation::Purge, request_id)
                .with_chunk(&chunk.id),
        )?;
    }
    tx.commit()?;
    Ok(swept)
}

fn write_read_rows(
    conn: &rusqlite::Connection,
    token: &TenantToken,
    operation: AuditOperation,
    request_id: &str,
    chunk_ids: &[String],
) -> Result<()> {
    if chunk_ids.is_empty() {
        return audit::record(conn, &AuditEvent::success(token.as_str(), operation, request_id));
    }
    for chunk_id in chunk_ids {
        audit::record(
            conn,
            &AuditEvent::success(token.as_str(), operation, request_id).with_chunk(chunk_id),
        )?;
    }
    Ok(())
}

fn expiry_after(ttl_secs: u64) -> Result<String> {
    if ttl_secs == 0 {
        return Err(Error::Validation("ttl_secs must be greater than zero".into()));
    }
    i64::try_from(ttl_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|ttl| chrono::Utc::now().checked_add_signed(ttl))
        .map(format_timestamp)
        .ok_or_else(|| Error::Validation("ttl_secs is out of range".into()))
}

fn same_bits(a: &[f32], b: &[f32]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
}
