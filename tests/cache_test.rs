mod helpers;

use helpers::{index_text, near_vector, open_configured, open_vault, query, test_vector};
use strongroom::config::IsolationMode;

#[tokio::test]
async fn repeated_query_is_served_from_cache() {
    let t = open_vault(IsolationMode::RowPolicy);
    index_text(&t.vault, "alice", "doc", "cached", test_vector(1)).await;

    let first = query(&t.vault, "alice", test_vector(1), 1).await;
    let searches = t.vault.search_stats().index_searches;
    let second = query(&t.vault, "alice", test_vector(1), 1).await;

    let stats = t.vault.search_stats();
    assert_eq!(stats.index_searches, searches, "second query re-ran the search");
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(first.results[0].chunk_id, second.results[0].chunk_id);
    assert_eq!(second.results[0].text, "cached");
}

#[tokio::test]
async fn cache_is_scoped_by_tenant_and_k() {
    let t = open_vault(IsolationMode::RowPolicy);
    index_text(&t.vault, "alice", "doc", "one", test_vector(1)).await;
    index_text(&t.vault, "alice", "doc", "two", test_vector(2)).await;

    query(&t.vault, "alice", test_vector(1), 1).await;
    let bob = query(&t.vault, "bob", test_vector(1), 1).await;
    assert!(bob.results.is_empty());
    let wider = query(&t.vault, "alice", test_vector(1), 2).await;
    assert_eq!(wider.results.len(), 2);

    let stats = t.vault.search_stats();
    assert_eq!(stats.cache_hits, 0);
    assert_eq!(stats.index_searches, 3);
}

#[tokio::test]
async fn writes_invalidate_the_tenants_entries() {
    let t = open_vault(IsolationMode::RowPolicy);
    index_text(&t.vault, "alice", "doc", "old", test_vector(1)).await;
    query(&t.vault, "alice", test_vector(1), 2).await;

    index_text(&t.vault, "alice", "doc", "new", test_vector(1)).await;
    let after = query(&t.vault, "alice", test_vector(1), 2).await;
    assert_eq!(after.results.len(), 2, "new chunk hidden by a stale cache entry");
    assert_eq!(t.vault.search_stats().index_searches, 2);
}

#[tokio::test]
async fn disabled_cache_always_searches() {
    let t = open_configured(IsolationMode::RowPolicy, |c| c.cache.enabled = false, None);
    index_text(&t.vault, "alice", "doc", "uncached", test_vector(1)).await;
    for _ in 0..3 {
        query(&t.vault, "alice", test_vector(1), 1).await;
    }
    let stats = t.vault.search_stats();
    assert_eq!(stats.index_searches, 3);
    assert_eq!(stats.cache_hits, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_queries_never_pin_a_stale_result() {
    const CHUNKS: u8 = 12;
    let t = open_vault(IsolationMode::RowPolicy);

    let writer = {
        let vault = t.vault.clone();
        tokio::spawn(async move {
            for i in 0..CHUNKS {
                index_text(&vault, "alice", "doc", &format!("chunk {i}"), near_vector(i)).await;
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let vault = t.vault.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    query(&vault, "alice", test_vector(0), 32).await;
                }
            })
        })
        .collect();

    writer.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }

    // Every fill that raced a write must have been dropped.
    let settled = query(&t.vault, "alice", test_vector(0), 32).await;
    assert_eq!(settled.results.len(), CHUNKS as usize);
    let again = query(&t.vault, "alice", test_vector(0), 32).await;
    assert_eq!(again.results.len(), CHUNKS as usize);
}
