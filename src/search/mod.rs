//! Tenant-scoped similarity search.
//!
//! A query first consults the [`QueryCache`]. On a miss it walks the
//! partition's HNSW graph, widening the candidate window until `k` candidates
//! survive the tenant visibility filter or the graph runs out, and falls back
//! to an exact sqlite-vec scan when the graph under-delivers.

pub mod cache;

pub use cache::{query_hash, CacheKey, Generation, QueryCache};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::access::TenantSession;
use crate::config::IndexConfig;
use crate::error::{Error, Result};
use crate::index::AnnIndex;
use crate::storage::ChunkBackend;

/// One candidate chunk. Holds no plaintext.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub partition: u32,
    /// Cosine similarity, higher is closer.
    pub score: f32,
}

/// Counters for observability and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SearchStats {
    /// Searches that went past the cache.
    pub index_searches: u64,
    pub cache_hits: u64,
    pub exact_fallbacks: u64,
}

#[derive(Default)]
struct Counters {
    index_searches: AtomicU64,
    cache_hits: AtomicU64,
    exact_fallbacks: AtomicU64,
}

pub struct Searcher {
    index: Arc<AnnIndex>,
    cache: QueryCache,
    oversample: usize,
    max_k: usize,
    counters: Counters,
}

impl Searcher {
    pub fn new(index: Arc<AnnIndex>, cache: QueryCache, config: &IndexConfig) -> Self {
        Self {
            index,
            cache,
            oversample: config.oversample.max(1),
            max_k: config.max_k,
            counters: Counters::default(),
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn stats(&self) -> SearchStats {
        SearchStats {
            index_searches: self.counters.index_searches.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            exact_fallbacks: self.counters.exact_fallbacks.load(Ordering::Relaxed),
        }
    }

    /// Reject query vectors that cannot be compared.
    pub fn validate_query(&self, query: &[f32], k: usize) -> Result<()> {
        if k == 0 || k > self.max_k {
            return Err(Error::Validation(format!("k must be within 1..={}", self.max_k)));
        }
        self.index.check_dimensions(query)?;
        validate_vector(query)
    }

    /// Up to `k` hits visible to the session's tenant, best first.
    pub fn search(
        &self,
        session: &TenantSession,
        backend: &dyn ChunkBackend,
        partition: u32,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        self.validate_query(query, k)?;
        let token = session.token()?;
        let key = CacheKey::new(token.as_str(), query, k);

        if let Some(hits) = self.cache.get(&key, k) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(tenant = token.short(), hits = hits.len(), "query cache hit");
            return Ok(hits);
        }

        // Observed before reading so a write that commits mid-search wins.
        let generation = self.cache.generation(token.as_str());
        self.counters.index_searches.fetch_add(1, Ordering::Relaxed);
        let hits = self.search_uncached(session, backend, partition, query, k)?;
        self.cache.put(key, hits.clone(), generation);
        Ok(hits)
    }

    fn search_uncached(
        &self,
        session: &TenantSession,
        backend: &dyn ChunkBackend,
        partition: u32,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        let token = session.token()?;
        let conn = session.conn();
        let live = self.index.live_len(partition);

        // ── ANN pass with tenant post-filter ──
        let mut fetch = k.saturating_mul(self.oversample);
        let mut hits: Vec<SearchHit>;
        loop {
            let candidates = self.index.search(partition, query, fetch)?;
            let ids: Vec<String> = candidates.iter().map(|(id, _)| id.clone()).collect();
            let visible = backend.visible_ids(conn, token, partition, &ids)?;
            hits = candidates
                .into_iter()
                .filter(|(id, _)| visible.contains(id))
                .take(k)
                .map(|(chunk_id, score)| SearchHit {
                    chunk_id,
                    partition,
                    score,
                })
                .collect();

            let exhausted = ids.len() < fetch || fetch >= live;
            if hits.len() >= k || exhausted {
                break;
            }
            fetch = fetch.saturating_mul(2);
        }

        // ── Exact fallback ──
        if hits.len() < k {
            let total = backend.count(conn, token, partition)?;
            if total as usize > hits.len() {
                self.counters.exact_fallbacks.fetch_add(1, Ordering::Relaxed);
                debug!(
                    tenant = token.short(),
                    partition,
                    ann_hits = hits.len(),
                    visible = total,
                    "ANN under-delivered, falling back to exact scan"
                );
                hits = backend
                    .exact_neighbors(conn, token, partition, query, k)?
                    .into_iter()
                    .map(|(chunk_id, score)| SearchHit {
                        chunk_id,
                        partition,
                        score,
                    })
                    .collect();
            }
        }

        Ok(hits)
    }
}

/// Vectors must be finite and non-zero for cosine distance to be defined.
pub fn validate_vector(vector: &[f32]) -> Result<()> {
    if vector.is_empty() {
        return Err(Error::Validation("vector must not be empty".into()));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(Error::Validation("vector contains non-finite values".into()));
    }
    if vector.iter().all(|v| *v == 0.0) {
        return Err(Error::Validation("vector must not be all zeros".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_validation() {
        assert!(validate_vector(&[0.1, 0.2]).is_ok());
        assert!(validate_vector(&[]).is_err());
        assert!(validate_vector(&[0.0, 0.0]).is_err());
        assert!(validate_vector(&[f32::NAN, 1.0]).is_err());
        assert!(validate_vector(&[f32::INFINITY]).is_err());
    }
}
