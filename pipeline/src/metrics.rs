//! Pipeline metrics: per-stage throughput, latency and category counters.
//!
//! All counters are lock-free atomics;
//! the snapshot methods read them relaxed,
//! which is fine for monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::job::{JobCategory, PipelineStage, CATEGORY_COUNT, STAGE_COUNT};

/// Latency bucket upper bounds in microseconds;
/// the last bucket is unbounded.
pub const LATENCY_BUCKET_BOUNDS_US: [u64; 10] =
    [50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 50_000, 100_000];

const BUCKET_COUNT: usize = LATENCY_BUCKET_BOUNDS_US.len() + 1;

/// A fixed-bucket latency histogram.
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; BUCKET_COUNT],
    count: AtomicU64,
    total_us: AtomicU64,
}

impl LatencyHistogram {
    pub fn record(&self, latency: Duration) {
        let us = latency.as_micros() as u64;
        let bucket = LATENCY_BUCKET_BOUNDS_US
            .iter()
            .position(|&bound| us <= bound)
            .unwrap_or(BUCKET_COUNT - 1);
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            buckets: std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed)),
            count: self.count.load(Ordering::Relaxed),
            total_us: self.total_us.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
        self.count.store(0, Ordering::Relaxed);
        self.total_us.store(0, Ordering::Relaxed);
    }
}

/// A point-in-time copy of a latency histogram.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LatencySnapshot {
    pub buckets: [u64; BUCKET_COUNT],
    pub count: u64,
    pub total_us: u64,
}

impl LatencySnapshot {
    /// The mean queue-to-completion latency in microseconds.
    pub fn mean_us(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_us as f64 / self.count as f64
        }
    }
}

/// Counters for one stage.
#[derive(Debug, Default)]
pub(crate) struct StageMetrics {
    pub(crate) jobs_processed: AtomicU64,
    pub(crate) jobs_failed: AtomicU64,
    pub(crate) jobs_dropped: AtomicU64,
    pub(crate) per_category: [AtomicU64; CATEGORY_COUNT],
    pub(crate) latency: LatencyHistogram,
}

impl StageMetrics {
    fn reset(&self) {
        self.jobs_processed.store(0, Ordering::Relaxed);
        self.jobs_failed.store(0, Ordering::Relaxed);
        self.jobs_dropped.store(0, Ordering::Relaxed);
        for counter in &self.per_category {
            counter.store(0, Ordering::Relaxed);
        }
        self.latency.reset();
    }
}

/// The process-wide pipeline metrics collector.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    stages: [StageMetrics; STAGE_COUNT],
}

impl PipelineMetrics {
    pub(crate) fn record_processed(
        &self,
        stage: PipelineStage,
        category: JobCategory,
        queue_latency: Duration,
        success: bool,
    ) {
        let metrics = &self.stages[stage.index()];
        metrics.jobs_processed.fetch_add(1, Ordering::Relaxed);
        if !success {
            metrics.jobs_failed.fetch_add(1, Ordering::Relaxed);
        }
        metrics.per_category[category.index()].fetch_add(1, Ordering::Relaxed);
        metrics.latency.record(queue_latency);
    }

    pub(crate) fn record_dropped(&self, stage: PipelineStage) {
        self.stages[stage.index()]
            .jobs_dropped
            .fetch_add(1, Ordering::Relaxed);
    }

    /// A point-in-time copy of one stage's counters.
    pub fn stage_snapshot(&self, stage: PipelineStage) -> StageMetricsSnapshot {
        let metrics = &self.stages[stage.index()];
        StageMetricsSnapshot {
            stage,
            jobs_processed: metrics.jobs_processed.load(Ordering::Relaxed),
            jobs_failed: metrics.jobs_failed.load(Ordering::Relaxed),
            jobs_dropped: metrics.jobs_dropped.load(Ordering::Relaxed),
            per_category: std::array::from_fn(|i| {
                metrics.per_category[i].load(Ordering::Relaxed)
            }),
            latency: metrics.latency.snapshot(),
            queue_depth: 0,
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for stage in &self.stages {
            stage.reset();
        }
    }
}

/// A point-in-time copy of one stage's counters.
#[derive(Debug, Clone, Default)]
pub struct StageMetricsSnapshot {
    pub stage: PipelineStage,
    pub jobs_processed: u64,
    pub jobs_failed: u64,
    pub jobs_dropped: u64,
    pub per_category: [u64; CATEGORY_COUNT],
    pub latency: LatencySnapshot,
    /// Filled in by the coordinator, which owns the queues
    pub queue_depth: usize,
}

/// A point-in-time copy of all stages.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub stages: Vec<StageMetricsSnapshot>,
}

impl MetricsSnapshot {
    /// Total jobs processed across all stages.
    pub fn total_processed(&self) -> u64 {
        self.stages.iter().map(|s| s.jobs_processed).sum()
    }
}
