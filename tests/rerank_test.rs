mod helpers;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use helpers::{index_text, open_configured, test_vector};
use strongroom::config::{IsolationMode, RerankConfig};
use strongroom::rerank::{BreakerState, CrossEncoder, RerankOutcome, Reranker, SkipReason};
use strongroom::vault::QueryRequest;

/// Ignores its deadline and sleeps.
struct Sluggish(Duration);

impl CrossEncoder for Sluggish {
    fn name(&self) -> &str {
        "sluggish"
    }

    fn score(&self, _query: &str, passages: &[String], _deadline: Instant) -> anyhow::Result<Vec<f32>> {
        std::thread::sleep(self.0);
        Ok(vec![1.0; passages.len()])
    }
}

/// Scores a passage by how many query words it contains.
struct WordOverlap;

impl CrossEncoder for WordOverlap {
    fn name(&self) -> &str {
        "word-overlap"
    }

    fn score(&self, query: &str, passages: &[String], _deadline: Instant) -> anyhow::Result<Vec<f32>> {
        Ok(passages
            .iter()
            .map(|p| query.split_whitespace().filter(|w| p.contains(w)).count() as f32)
            .collect())
    }
}

struct Broken(AtomicUsize);

impl CrossEncoder for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    fn score(&self, _query: &str, _passages: &[String], _deadline: Instant) -> anyhow::Result<Vec<f32>> {
        self.0.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("model crashed")
    }
}

/// Fails until switched healthy, then scores every passage after `delay`.
struct Recovering {
    healthy: AtomicBool,
    delay: Duration,
}

impl CrossEncoder for Recovering {
    fn name(&self) -> &str {
        "recovering"
    }

    fn score(&self, _query: &str, passages: &[String], _deadline: Instant) -> anyhow::Result<Vec<f32>> {
        if !self.healthy.load(Ordering::SeqCst) {
            anyhow::bail!("model not loaded");
        }
        std::thread::sleep(self.delay);
        Ok((0..passages.len()).map(|i| i as f32).collect())
    }
}

fn config(timeout_ms: u64) -> RerankConfig {
    RerankConfig {
        enabled: true,
        timeout_ms,
        failure_threshold: 2,
        cooldown_ms: 60_000,
        ..RerankConfig::default()
    }
}

fn passages() -> Vec<String> {
    vec!["alpha".into(), "beta".into(), "gamma".into()]
}

#[tokio::test]
async fn slow_encoder_returns_original_order_within_timeout() {
    let reranker = Reranker::new(Some(Arc::new(Sluggish(Duration::from_millis(800)))), &config(100));

    let started = Instant::now();
    let reranked = reranker.rerank("query", passages()).await;
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_millis(100 + 300), "took {elapsed:?}");
    assert_eq!(reranked.outcome, RerankOutcome::TimedOut);
    assert_eq!(reranked.order, vec![0, 1, 2]);
    assert!(reranked.scores.is_none());

    let metrics = reranker.metrics();
    assert_eq!(metrics.skipped, 1);
    assert_eq!(metrics.timeouts, 1);
    assert_eq!(metrics.completed, 0);
}

#[tokio::test]
async fn failures_open_the_breaker_and_calls_are_skipped() {
    let encoder = Arc::new(Broken(AtomicUsize::new(0)));
    let reranker = Reranker::new(Some(encoder.clone()), &config(500));

    for _ in 0..2 {
        let reranked = reranker.rerank("query", passages()).await;
        assert_eq!(reranked.outcome, RerankOutcome::Failed);
        assert_eq!(reranked.order, vec![0, 1, 2]);
    }
    assert!(matches!(reranker.breaker_state(), BreakerState::Open { .. }));

    let reranked = reranker.rerank("query", passages()).await;
    assert_eq!(reranked.outcome, RerankOutcome::Skipped(SkipReason::BreakerOpen));
    assert_eq!(encoder.0.load(Ordering::SeqCst), 2, "encoder called while open");

    let metrics = reranker.metrics();
    assert_eq!(metrics.failed, 2);
    assert_eq!(metrics.skipped, 1);
}

#[tokio::test]
async fn cancelled_half_open_call_does_not_wedge_the_breaker() {
    let encoder = Arc::new(Recovering {
        healthy: AtomicBool::new(false),
        delay: Duration::from_millis(200),
    });
    let reranker = Reranker::new(
        Some(encoder.clone()),
        &RerankConfig {
            enabled: true,
            timeout_ms: 1_000,
            failure_threshold: 1,
            cooldown_ms: 50,
            ..RerankConfig::default()
        },
    );

    let reranked = reranker.rerank("query", passages()).await;
    assert_eq!(reranked.outcome, RerankOutcome::Failed);
    assert!(matches!(reranker.breaker_state(), BreakerState::Open { .. }));

    tokio::time::sleep(Duration::from_millis(100)).await;
    encoder.healthy.store(true, Ordering::SeqCst);

    // The caller gives up while its call holds the half-open slot.
    let cancelled =
        tokio::time::timeout(Duration::from_millis(20), reranker.rerank("query", passages())).await;
    assert!(cancelled.is_err());
    assert_ne!(reranker.breaker_state(), BreakerState::HalfOpen);

    let reranked = reranker.rerank("query", passages()).await;
    assert_eq!(reranked.outcome, RerankOutcome::Completed);
    assert_eq!(reranked.order, vec![2, 1, 0]);
    assert_eq!(reranker.breaker_state(), BreakerState::Closed);
    assert_eq!(reranker.metrics().failed, 1);
    assert_eq!(reranker.encoder_name(), Some("recovering"));
}

#[tokio::test]
async fn vault_query_reranks_decrypted_candidates() {
    let t = open_configured(
        IsolationMode::RowPolicy,
        |c| {
            c.rerank = config(2_000);
            c.rerank.candidate_limit = 10;
        },
        Some(Arc::new(WordOverlap)),
    );
    // The ANN favourite shares no words with the query text.
    index_text(&t.vault, "alice", "doc", "closest vector, unrelated words", test_vector(1)).await;
    index_text(&t.vault, "alice", "doc", "invoice #42 due March 1", test_vector(2)).await;
    index_text(&t.vault, "alice", "doc", "lunch menu", test_vector(3)).await;

    let response = t
        .vault
        .query(QueryRequest {
            tenant_id: "alice".into(),
            query_text: Some("invoice due".into()),
            vector: test_vector(1),
            k: 1,
            rerank: true,
        })
        .await
        .unwrap();

    assert_eq!(response.rerank, Some(RerankOutcome::Completed));
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].text, "invoice #42 due March 1");
    assert_eq!(response.results[0].rerank_score, Some(2.0));
    assert_eq!(t.vault.rerank_metrics().completed, 1);
}

#[tokio::test]
async fn vault_query_falls_back_to_ann_order_on_timeout() {
    let t = open_configured(
        IsolationMode::RowPolicy,
        |c| c.rerank = config(50),
        Some(Arc::new(Sluggish(Duration::from_millis(500)))),
    );
    index_text(&t.vault, "alice", "doc", "nearest", test_vector(1)).await;
    index_text(&t.vault, "alice", "doc", "farther", test_vector(2)).await;

    let response = t
        .vault
        .query(QueryRequest {
            tenant_id: "alice".into(),
            query_text: Some("anything".into()),
            vector: test_vector(1),
            k: 2,
            rerank: true,
        })
        .await
        .unwrap();

    assert_eq!(response.rerank, Some(RerankOutcome::TimedOut));
    let texts: Vec<&str> = response.results.iter().map(|r| r.text.as_str()).collect();
    assert_eq!(texts, vec!["nearest", "farther"]);
    assert!(response.results.iter().all(|r| r.rerank_score.is_none()));
    assert_eq!(t.vault.rerank_metrics().skipped, 1);
}

#[tokio::test]
async fn disabled_reranker_passes_through() {
    let t = open_configured(IsolationMode::RowPolicy, |_| {}, Some(Arc::new(WordOverlap)));
    index_text(&t.vault, "alice", "doc", "only chunk", test_vector(1)).await;

    let response = t
        .vault
        .query(QueryRequest {
            tenant_id: "alice".into(),
            query_text: Some("chunk".into()),
            vector: test_vector(1),
            k: 1,
            rerank: true,
        })
        .await
        .unwrap();
    assert_eq!(response.rerank, Some(RerankOutcome::Skipped(SkipReason::Disabled)));
    assert_eq!(response.results.len(), 1);
}
