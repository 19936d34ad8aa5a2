//! Metrics and observability for soma_chroma

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

/// Per-engine counters. Monotonic for the engine's lifetime.
pub struct Metrics {
    /// Contexts admitted past the cache and dedup checks
    pub extractions: AtomicU64,
    pub processed: AtomicU64,
    pub errors: AtomicU64,
    pub cache_hits: AtomicU64,
    pub dedup_hits: AtomicU64,
    pub dropped_contexts: AtomicU64,
    pub timeouts: AtomicU64,
    pub fallbacks: AtomicU64,
    pub total_latency_us: AtomicU64,

    // Per-stage failure counters
    pub strategy_runs: AtomicU64,
    pub strategy_failures: AtomicU64,
    pub selection_failures: AtomicU64,
    pub coordination_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_extraction(&self) {
        self.extractions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dedup_hit(&self) {
        self.dedup_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped_contexts.fetch_add(1, Ordering::Relaxed);
    }

    /// A completed cycle, whether it produced a real result or the fallback
    pub fn record_cycle(&self, latency_ms: f64, fallback: bool) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add((latency_ms.max(0.0) * 1000.0) as u64, Ordering::Relaxed);
        if fallback {
            self.fallbacks.fetch_add(1, Ordering::Relaxed);
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_strategy(&self, success: bool) {
        self.strategy_runs.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.strategy_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_selection_failure(&self) {
        self.selection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coordination_failure(&self) {
        self.coordination_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let fallbacks = self.fallbacks.load(Ordering::Relaxed);
        let timeouts = self.timeouts.load(Ordering::Relaxed);
        let total_latency_us = self.total_latency_us.load(Ordering::Relaxed);
        let attempts = processed + timeouts;

        MetricsSnapshot {
            extraction_count: self.extractions.load(Ordering::Relaxed),
            processed_count: processed,
            error_count: self.errors.load(Ordering::Relaxed),
            cache_hit_count: self.cache_hits.load(Ordering::Relaxed),
            dedup_hit_count: self.dedup_hits.load(Ordering::Relaxed),
            dropped_count: self.dropped_contexts.load(Ordering::Relaxed),
            timeout_count: timeouts,
            fallback_count: fallbacks,
            average_latency_ms: if processed > 0 {
                total_latency_us as f64 / processed as f64 / 1000.0
            } else {
                0.0
            },
            success_rate: if attempts > 0 {
                processed.saturating_sub(fallbacks) as f64 / attempts as f64
            } else {
                1.0
            },
            stages: StageMetrics {
                strategy_runs: self.strategy_runs.load(Ordering::Relaxed),
                strategy_failures: self.strategy_failures.load(Ordering::Relaxed),
                selection_failures: self.selection_failures.load(Ordering::Relaxed),
                coordination_failures: self.coordination_failures.load(Ordering::Relaxed),
            },
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            extractions: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            dedup_hits: AtomicU64::new(0),
            dropped_contexts: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            strategy_runs: AtomicU64::new(0),
            strategy_failures: AtomicU64::new(0),
            selection_failures: AtomicU64::new(0),
            coordination_failures: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub extraction_count: u64,
    pub processed_count: u64,
    pub error_count: u64,
    pub cache_hit_count: u64,
    pub dedup_hit_count: u64,
    pub dropped_count: u64,
    pub timeout_count: u64,
    pub fallback_count: u64,
    pub average_latency_ms: f64,
    pub success_rate: f64,
    pub stages: StageMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageMetrics {
    pub strategy_runs: u64,
    pub strategy_failures: u64,
    pub selection_failures: u64,
    pub coordination_failures: u64,
}

/// Timer for tracking stage latency
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
