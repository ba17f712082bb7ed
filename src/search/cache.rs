//! Short-lived query result cache.
//!
//! Entries are keyed by `(tenant_token, query_hash)` and hold only chunk ids and
//! scores, never plaintext. Invalid entries (expired, non-finite scores, more
//! hits than requested) are treated as misses and removed.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use super::SearchHit;
use crate::config::CacheConfig;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub tenant_token: String,
    pub query_hash: String,
}

impl CacheKey {
    pub fn new(tenant_token: &str, query: &[f32], k: usize) -> Self {
        Self {
            tenant_token: tenant_token.to_string(),
            query_hash: query_hash(query, k),
        }
    }
}

/// SHA-256 over the little-endian query floats followed by `k`.
pub fn query_hash(query: &[f32], k: usize) -> String {
    let mut hasher = Sha256::new();
    for v in query {
        hasher.update(v.to_le_bytes());
    }
    hasher.update((k as u64).to_le_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
struct CacheEntry {
    hits: Vec<SearchHit>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_valid(&self, now: Instant, k: usize) -> bool {
        now < self.expires_at
            && self.hits.len() <= k
            && self.hits.iter().all(|h| h.score.is_finite())
    }
}

/// Write generation of one tenant's cached results, observed before a search.
///
/// [`QueryCache::put`] drops results observed under an older generation, so a
/// search that raced a write cannot repopulate the cache with pre-write hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation {
    epoch: u64,
    tenant: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Bumped per tenant by `invalidate_tenant`.
    tenants: HashMap<String, u64>,
    /// Bumped by `clear`.
    epoch: u64,
}

impl CacheState {
    fn generation(&self, tenant_token: &str) -> Generation {
        Generation {
            epoch: self.epoch,
            tenant: self.tenants.get(tenant_token).copied().unwrap_or(0),
        }
    }
}

pub struct QueryCache {
    state: RwLock<CacheState>,
    ttl: Duration,
    max_entries: usize,
    enabled: bool,
}

impl QueryCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_ttl(Duration::from_secs(config.ttl_secs), config.max_entries, config.enabled)
    }

    pub fn with_ttl(ttl: Duration, max_entries: usize, enabled: bool) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            ttl,
            max_entries,
            enabled,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached hits for `key`, if present and valid for a request of `k` results.
    pub fn get(&self, key: &CacheKey, k: usize) -> Option<Vec<SearchHit>> {
        if !self.enabled {
            return None;
        }
        let now = Instant::now();
        {
            let state = self.read();
            match state.entries.get(key) {
                None => return None,
                Some(entry) if entry.is_valid(now, k) => return Some(entry.hits.clone()),
                Some(_) => {}
            }
        }
        // Stale or malformed; drop it lazily.
        let mut state = self.write();
        if state.entries.get(key).is_some_and(|e| !e.is_valid(now, k)) {
            state.entries.remove(key);
        }
        None
    }

    /// Current generation for a tenant. Read it before searching and hand it
    /// to [`put`](Self::put).
    pub fn generation(&self, tenant_token: &str) -> Generation {
        self.read().generation(tenant_token)
    }

    /// Store hits observed at `observed`. Returns false, storing nothing, when
    /// the tenant was invalidated since. Concurrent writers for the same key
    /// and generation: last write wins.
    pub fn put(&self, key: CacheKey, hits: Vec<SearchHit>, observed: Generation) -> bool {
        if !self.enabled {
            return false;
        }
        let now = Instant::now();
        let mut state = self.write();
        if state.generation(&key.tenant_token) != observed {
            tracing::debug!("query cache fill dropped, tenant written during search");
            return false;
        }
        if state.entries.len() >= self.max_entries && !state.entries.contains_key(&key) {
            state.entries.retain(|_, e| now < e.expires_at);
            if state.entries.len() >= self.max_entries {
                // Still full: evict the entry closest to expiry.
                if let Some(oldest) = state
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.expires_at)
                    .map(|(k, _)| k.clone())
                {
                    state.entries.remove(&oldest);
                }
            }
        }
        state.entries.insert(
            key,
            CacheEntry {
                hits,
                expires_at: now + self.ttl,
            },
        );
        true
    }

    /// Drop every entry for a tenant and advance its generation. Returns how
    /// many entries were removed.
    pub fn invalidate_tenant(&self, tenant_token: &str) -> usize {
        let mut state = self.write();
        *state.tenants.entry(tenant_token.to_string()).or_insert(0) += 1;
        let before = state.entries.len();
        state.entries.retain(|key, _| key.tenant_token != tenant_token);
        before - state.entries.len()
    }

    /// Drop everything and advance every tenant's generation.
    pub fn clear(&self) {
        let mut state = self.write();
        state.epoch += 1;
        state.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, score: f32) -> SearchHit {
        SearchHit {
            chunk_id: id.to_string(),
            partition: 0,
            score,
        }
    }

    fn cache() -> QueryCache {
        QueryCache::with_ttl(Duration::from_secs(60), 10, true)
    }

    #[test]
    fn hash_depends_on_vector_and_k() {
        let a = query_hash(&[1.0, 2.0], 5);
        assert_eq!(a, query_hash(&[1.0, 2.0], 5));
        assert_ne!(a, query_hash(&[1.0, 2.0], 6));
        assert_ne!(a, query_hash(&[2.0, 1.0], 5));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn entries_are_scoped_by_tenant() {
        let cache = cache();
        let alice = CacheKey::new("alice", &[1.0], 1);
        let bob = CacheKey::new("bob", &[1.0], 1);
        cache.put(alice.clone(), vec![hit("c1", 0.9)], cache.generation(&alice.tenant_token));

        assert_eq!(cache.get(&alice, 1).unwrap()[0].chunk_id, "c1");
        assert!(cache.get(&bob, 1).is_none());
    }

    #[test]
    fn expired_entries_are_misses_and_removed() {
        let cache = QueryCache::with_ttl(Duration::ZERO, 10, true);
        let key = CacheKey::new("alice", &[1.0], 1);
        cache.put(key.clone(), vec![hit("c1", 0.9)], cache.generation(&key.tenant_token));
        assert!(cache.get(&key, 1).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn malformed_entries_are_misses() {
        let cache = cache();
        let nan = CacheKey::new("alice", &[1.0], 1);
        cache.put(nan.clone(), vec![hit("c1", f32::NAN)], cache.generation(&nan.tenant_token));
        assert!(cache.get(&nan, 1).is_none());

        let too_many = CacheKey::new("alice", &[2.0], 1);
        let observed = cache.generation("alice");
        cache.put(too_many.clone(), vec![hit("c1", 0.5), hit("c2", 0.4)], observed);
        assert!(cache.get(&too_many, 1).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_only_touches_one_tenant() {
        let cache = cache();
        cache.put(CacheKey::new("alice", &[1.0], 1), vec![], cache.generation("alice"));
        cache.put(CacheKey::new("alice", &[2.0], 1), vec![], cache.generation("alice"));
        cache.put(CacheKey::new("bob", &[1.0], 1), vec![], cache.generation("bob"));
        assert_eq!(cache.invalidate_tenant("alice"), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn capacity_is_bounded() {
        let cache = QueryCache::with_ttl(Duration::from_secs(60), 3, true);
        for i in 0..10 {
            cache.put(CacheKey::new("alice", &[i as f32], 1), vec![], cache.generation("alice"));
        }
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn disabled_cache_never_hits() {
        let cache = QueryCache::with_ttl(Duration::from_secs(60), 10, false);
        let key = CacheKey::new("alice", &[1.0], 1);
        cache.put(key.clone(), vec![hit("c1", 0.9)], cache.generation(&key.tenant_token));
        assert!(cache.get(&key, 1).is_none());
    }

    #[test]
    fn fill_observed_before_an_invalidation_is_dropped() {
        let cache = cache();
        let key = CacheKey::new("alice", &[1.0], 1);

        // A search observes the generation, then a write lands before it fills.
        let observed = cache.generation("alice");
        cache.invalidate_tenant("alice");
        assert!(!cache.put(key.clone(), vec![hit("deleted", 0.9)], observed));
        assert!(cache.get(&key, 1).is_none());

        // Other tenants are unaffected.
        let bob = CacheKey::new("bob", &[1.0], 1);
        let observed = cache.generation("bob");
        cache.invalidate_tenant("alice");
        assert!(cache.put(bob.clone(), vec![hit("b1", 0.9)], observed));

        // A fresh observation fills normally.
        assert!(cache.put(key.clone(), vec![hit("c2", 0.8)], cache.generation("alice")));
        assert_eq!(cache.get(&key, 1).unwrap()[0].chunk_id, "c2");
    }

    #[test]
    fn clear_invalidates_in_flight_fills_for_every_tenant() {
        let cache = cache();
        let observed = cache.generation("alice");
        cache.clear();
        assert!(!cache.put(CacheKey::new("alice", &[1.0], 1), vec![], observed));
        assert!(cache.is_empty());
    }
}
