//! Fail-open cross-encoder reranking.
//!
//! [`Reranker::rerank`] never errors. Each call moves through
//! `idle → scoring → {completed | timed-out} → returned`; anything other than a
//! completed scoring pass returns the candidates in their original order and is
//! counted in [`RerankMetrics`]. A [`CircuitBreaker`] stops calling an encoder
//! that keeps failing.

pub mod breaker;

pub use breaker::{BreakerState, CircuitBreaker};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::RerankConfig;

/// Scores `(query, passage)` pairs. Higher is more relevant.
///
/// Implementations run on a blocking worker and should return
/// [`DeadlineExceeded`] once `deadline` has passed rather than finish the batch.
pub trait CrossEncoder: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn score(&self, query: &str, passages: &[String], deadline: Instant) -> anyhow::Result<Vec<f32>>;
}

/// Returned by a [`CrossEncoder`] that gave up at its deadline.
#[derive(Debug, thiserror::Error)]
#[error("rerank deadline exceeded")]
pub struct DeadlineExceeded;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    BreakerOpen,
    NoCandidates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum RerankOutcome {
    Completed,
    TimedOut,
    Skipped(SkipReason),
    Failed,
}

impl RerankOutcome {
    pub fn reordered(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Result of a rerank call: a permutation of the input plus scores when the
/// encoder completed.
#[derive(Debug, Clone)]
pub struct Reranked {
    /// Input positions, best first.
    pub order: Vec<usize>,
    /// Encoder score per input position, when completed.
    pub scores: Option<Vec<f32>>,
    pub outcome: RerankOutcome,
}

impl Reranked {
    fn original(len: usize, outcome: RerankOutcome) -> Self {
        Self {
            order: (0..len).collect(),
            scores: None,
            outcome,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RerankMetrics {
    pub completed: u64,
    /// Timeouts plus calls skipped while the breaker was open.
    pub skipped: u64,
    pub timeouts: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    skipped: AtomicU64,
    timeouts: AtomicU64,
    failed: AtomicU64,
}

pub struct Reranker {
    encoder: Option<Arc<dyn CrossEncoder>>,
    enabled: bool,
    timeout: Duration,
    breaker: Mutex<CircuitBreaker>,
    counters: Counters,
}

impl Reranker {
    pub fn new(encoder: Option<Arc<dyn CrossEncoder>>, config: &RerankConfig) -> Self {
        Self {
            enabled: config.enabled && encoder.is_some(),
            encoder,
            timeout: Duration::from_millis(config.timeout_ms),
            breaker: Mutex::new(CircuitBreaker::new(
                config.failure_threshold,
                Duration::from_millis(config.cooldown_ms),
            )),
            counters: Counters::default(),
        }
    }

    /// A reranker that always passes candidates through.
    pub fn disabled() -> Self {
        Self::new(
            None,
            &RerankConfig {
                enabled: false,
                ..RerankConfig::default()
            },
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn encoder_name(&self) -> Option<&str> {
        self.encoder.as_deref().map(|e| e.name())
    }

    pub fn metrics(&self) -> RerankMetrics {
        RerankMetrics {
            completed: self.counters.completed.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        lock(&self.breaker).state()
    }

    /// Re-score `passages` against `query` within the configured timeout.
    pub async fn rerank(&self, query: &str, passages: Vec<String>) -> Reranked {
        let len = passages.len();
        let encoder = match (&self.encoder, self.enabled) {
            (Some(encoder), true) => Arc::clone(encoder),
            _ => return Reranked::original(len, RerankOutcome::Skipped(SkipReason::Disabled)),
        };
        if len == 0 {
            return Reranked::original(0, RerankOutcome::Skipped(SkipReason::NoCandidates));
        }
        let Some(permit) = Permit::acquire(&self.breaker) else {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            debug!(candidates = len, "rerank skipped: breaker open");
            return Reranked::original(len, RerankOutcome::Skipped(SkipReason::BreakerOpen));
        };

        let started = Instant::now();
        let deadline = started + self.timeout;
        let query = query.to_string();
        let worker =
            tokio::task::spawn_blocking(move || encoder.score(&query, &passages, deadline));

        let outcome = match tokio::time::timeout(self.timeout, worker).await {
            Err(_) => Err(RerankOutcome::TimedOut),
            Ok(Err(join)) => {
                warn!(error = %join, "rerank worker panicked");
                Err(RerankOutcome::Failed)
            }
            Ok(Ok(Err(e))) if e.downcast_ref::<DeadlineExceeded>().is_some() => {
                Err(RerankOutcome::TimedOut)
            }
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "cross-encoder failed");
                Err(RerankOutcome::Failed)
            }
            Ok(Ok(Ok(scores))) if scores.len() != len || scores.iter().any(|s| !s.is_finite()) => {
                warn!(expected = len, got = scores.len(), "cross-encoder returned unusable scores");
                Err(RerankOutcome::Failed)
            }
            Ok(Ok(Ok(scores))) => Ok(scores),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(scores) => {
                permit.succeeded();
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                let mut order: Vec<usize> = (0..len).collect();
                order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
                debug!(candidates = len, elapsed_ms, "rerank completed");
                Reranked {
                    order,
                    scores: Some(scores),
                    outcome: RerankOutcome::Completed,
                }
            }
            Err(outcome) => {
                permit.failed();
                if outcome == RerankOutcome::TimedOut {
                    self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    debug!(candidates = len, elapsed_ms, "rerank timed out, keeping ANN order");
                } else {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                }
                Reranked::original(len, outcome)
            }
        }
    }
}

fn lock(breaker: &Mutex<CircuitBreaker>) -> std::sync::MutexGuard<'_, CircuitBreaker> {
    breaker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Admission through the breaker for one call. Must report back through
/// [`succeeded`](Self::succeeded) or [`failed`](Self::failed); dropped
/// unreported (the caller's future was cancelled) it abandons the trial call.
struct Permit<'a> {
    breaker: &'a Mutex<CircuitBreaker>,
    reported: bool,
}

impl<'a> Permit<'a> {
    fn acquire(breaker: &'a Mutex<CircuitBreaker>) -> Option<Self> {
        lock(breaker).try_acquire(Instant::now()).then_some(Self {
            breaker,
            reported: false,
        })
    }

    fn succeeded(mut self) {
        self.reported = true;
        lock(self.breaker).record_success();
    }

    fn failed(mut self) {
        self.reported = true;
        lock(self.breaker).record_failure(Instant::now());
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.reported {
            debug!("rerank call cancelled before reporting to the breaker");
            lock(self.breaker).abandon(Instant::now());
        }
    }
}
