//! The pipeline coordinator: per-stage worker pools,
//! job submission and routing, backpressure and graceful shutdown.
//!
//! Sessions are pinned to one worker per stage
//! (by session id), so jobs of one association
//! are processed in submission order at every stage
//! while other associations proceed in parallel on their own workers.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cancel::CancelRegistry;
use crate::job::{FnJob, Job, JobContext, PipelineStage, STAGE_COUNT};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::{NotRunningSnafu, QueueFullSnafu, Result};

/// Callback invoked when a stage's queue depth crosses the threshold.
pub type BackpressureCallback = Box<dyn Fn(PipelineStage, usize) + Send + Sync>;

/// Callback invoked when any job completes, with its success flag.
pub type JobCompletionCallback = Box<dyn Fn(&JobContext, bool) + Send + Sync>;

/// Configuration options for the pipeline coordinator.
///
/// The defaults are tuned for a typical PACS workload
/// with balanced throughput and latency.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Workers for the network I/O stages (1 and 6)
    pub net_io_workers: usize,
    /// Workers for the protocol stages (2 and 3)
    pub protocol_workers: usize,
    /// Workers for the execution stage (4), where blocking is allowed
    pub execution_workers: usize,
    /// Workers for the response encoding stage (5)
    pub encode_workers: usize,
    /// Queue depth per stage at which backpressure kicks in
    pub max_queue_depth: usize,
    /// How long `stop` waits for queued jobs to drain
    pub shutdown_timeout: Duration,
    /// Whether to collect metrics
    pub enable_metrics: bool,
    /// Thread name prefix, for logging
    pub name_prefix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            net_io_workers: 4,
            protocol_workers: 2,
            execution_workers: 8,
            encode_workers: 2,
            max_queue_depth: 10_000,
            shutdown_timeout: Duration::from_millis(500),
            enable_metrics: true,
            name_prefix: "pipeline".to_string(),
        }
    }
}

impl PipelineConfig {
    /// The number of workers configured for a stage.
    pub fn workers_for_stage(&self, stage: PipelineStage) -> usize {
        let workers = match stage {
            PipelineStage::NetworkReceive | PipelineStage::NetworkSend => self.net_io_workers,
            PipelineStage::PduDecode | PipelineStage::DimseProcess => self.protocol_workers,
            PipelineStage::StorageQueryExec => self.execution_workers,
            PipelineStage::ResponseEncode => self.encode_workers,
        };
        workers.max(1)
    }
}

/// One worker's queue within a stage.
struct WorkerQueue {
    sender: Mutex<Option<mpsc::Sender<Box<dyn Job>>>>,
    depth: Arc<AtomicUsize>,
}

struct StageQueues {
    workers: Vec<WorkerQueue>,
}

impl StageQueues {
    fn depth(&self) -> usize {
        self.workers
            .iter()
            .map(|w| w.depth.load(Ordering::Relaxed))
            .sum()
    }
}

struct Inner {
    config: PipelineConfig,
    stages: Vec<StageQueues>,
    running: AtomicBool,
    /// set when the drain deadline passed; remaining queued jobs are dropped
    discard: AtomicBool,
    next_job_id: AtomicU64,
    metrics: PipelineMetrics,
    cancels: Arc<CancelRegistry>,
    backpressure_callback: Mutex<Option<BackpressureCallback>>,
    completion_callback: Mutex<Option<JobCompletionCallback>>,
    worker_handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// Coordinates the six-stage DICOM I/O pipeline.
///
/// The coordinator is a cheap handle; clone it freely.
/// Stop the pipeline with [`stop`](Self::stop) before dropping
/// the last handle, otherwise the worker threads keep waiting
/// for work that will never come.
#[derive(Clone)]
pub struct PipelineCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PipelineCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCoordinator")
            .field("running", &self.is_running())
            .field("total_pending", &self.total_pending_jobs())
            .finish_non_exhaustive()
    }
}

impl PipelineCoordinator {
    /// Start the pipeline with the default configuration.
    pub fn start() -> PipelineCoordinator {
        Self::start_with_config(PipelineConfig::default())
    }

    /// Start the pipeline, spawning every stage's worker pool.
    pub fn start_with_config(config: PipelineConfig) -> PipelineCoordinator {
        let mut stages = Vec::with_capacity(STAGE_COUNT);
        let mut receivers: Vec<Vec<mpsc::Receiver<Box<dyn Job>>>> =
            Vec::with_capacity(STAGE_COUNT);

        for stage in PipelineStage::ALL {
            let worker_count = config.workers_for_stage(stage);
            let mut workers = Vec::with_capacity(worker_count);
            let mut stage_receivers = Vec::with_capacity(worker_count);
            for _ in 0..worker_count {
                let (sender, receiver) = mpsc::channel();
                workers.push(WorkerQueue {
                    sender: Mutex::new(Some(sender)),
                    depth: Arc::new(AtomicUsize::new(0)),
                });
                stage_receivers.push(receiver);
            }
            stages.push(StageQueues { workers });
            receivers.push(stage_receivers);
        }

        let inner = Arc::new(Inner {
            config,
            stages,
            running: AtomicBool::new(true),
            discard: AtomicBool::new(false),
            next_job_id: AtomicU64::new(1),
            metrics: PipelineMetrics::default(),
            cancels: Arc::new(CancelRegistry::new()),
            backpressure_callback: Mutex::new(None),
            completion_callback: Mutex::new(None),
            worker_handles: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::new();
        for (stage, stage_receivers) in PipelineStage::ALL.into_iter().zip(receivers) {
            for (worker_index, receiver) in stage_receivers.into_iter().enumerate() {
                let inner = Arc::clone(&inner);
                let depth =
                    Arc::clone(&inner.stages[stage.index()].workers[worker_index].depth);
                let name = format!(
                    "{}-{}-{}",
                    inner.config.name_prefix,
                    stage.name(),
                    worker_index
                );
                let handle = thread::Builder::new()
                    .name(name)
                    .spawn(move || worker_loop(inner, stage, receiver, depth))
                    .expect("failed to spawn pipeline worker");
                handles.push(handle);
            }
        }
        *inner.worker_handles.lock().expect("worker handle lock") = handles;

        info!(
            "pipeline started with {} workers across {} stages",
            inner
                .stages
                .iter()
                .map(|s| s.workers.len())
                .sum::<usize>(),
            STAGE_COUNT
        );

        PipelineCoordinator { inner }
    }

    /// Whether the pipeline accepts submissions.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Generate a monotonically increasing job id.
    pub fn generate_job_id(&self) -> u64 {
        self.inner.next_job_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Submit a job to a stage.
    ///
    /// The job runs on the worker its session is pinned to,
    /// preserving per-session submission order.
    /// Fails with [`QueueFull`](crate::Error::QueueFull)
    /// when the stage is saturated
    /// and with [`NotRunning`](crate::Error::NotRunning) after `stop`.
    pub fn submit_to_stage(&self, stage: PipelineStage, job: Box<dyn Job>) -> Result<()> {
        if !self.is_running() {
            return NotRunningSnafu.fail();
        }

        let queues = &self.inner.stages[stage.index()];
        let depth = queues.depth();
        if depth >= self.inner.config.max_queue_depth {
            self.fire_backpressure(stage, depth);
            return QueueFullSnafu { stage, depth }.fail();
        }

        let worker =
            (job.context().session_id % queues.workers.len() as u64) as usize;
        let queue = &queues.workers[worker];

        let sender = queue.sender.lock().expect("stage sender lock poisoned");
        match sender.as_ref() {
            Some(sender) => {
                queue.depth.fetch_add(1, Ordering::Relaxed);
                if sender.send(job).is_err() {
                    queue.depth.fetch_sub(1, Ordering::Relaxed);
                    return NotRunningSnafu.fail();
                }
                Ok(())
            }
            None => NotRunningSnafu.fail(),
        }
    }

    /// Submit a closure to a stage, the common handoff shape.
    pub fn submit_task(
        &self,
        stage: PipelineStage,
        context: JobContext,
        name: &'static str,
        task: impl FnOnce(&PipelineCoordinator) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        let context = context.for_stage(stage);
        self.submit_to_stage(stage, Box::new(FnJob::new(context, name, task)))
    }

    /// The number of jobs queued on one stage.
    pub fn queue_depth(&self, stage: PipelineStage) -> usize {
        self.inner.stages[stage.index()].depth()
    }

    /// Whether a stage's queue depth has crossed the threshold.
    pub fn is_backpressure_active(&self, stage: PipelineStage) -> bool {
        self.queue_depth(stage) >= self.inner.config.max_queue_depth
    }

    /// Total worker threads across all stages.
    pub fn total_worker_count(&self) -> usize {
        self.inner.stages.iter().map(|s| s.workers.len()).sum()
    }

    /// Total queued jobs across all stages.
    pub fn total_pending_jobs(&self) -> usize {
        self.inner.stages.iter().map(|s| s.depth()).sum()
    }

    /// The pipeline configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// The cancellation registry shared by all sessions.
    pub fn cancels(&self) -> &Arc<CancelRegistry> {
        &self.inner.cancels
    }

    /// The metrics collector.
    pub fn metrics(&self) -> &PipelineMetrics {
        &self.inner.metrics
    }

    /// A point-in-time snapshot of all stages,
    /// with live queue depths filled in.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            stages: PipelineStage::ALL
                .into_iter()
                .map(|stage| {
                    let mut snapshot = self.inner.metrics.stage_snapshot(stage);
                    snapshot.queue_depth = self.queue_depth(stage);
                    snapshot
                })
                .collect(),
        }
    }

    /// Zero all metrics counters.
    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
    }

    /// Install the backpressure callback.
    pub fn set_backpressure_callback(
        &self,
        callback: impl Fn(PipelineStage, usize) + Send + Sync + 'static,
    ) {
        *self
            .inner
            .backpressure_callback
            .lock()
            .expect("backpressure callback lock") = Some(Box::new(callback));
    }

    /// Install the job completion callback.
    pub fn set_job_completion_callback(
        &self,
        callback: impl Fn(&JobContext, bool) + Send + Sync + 'static,
    ) {
        *self
            .inner
            .completion_callback
            .lock()
            .expect("completion callback lock") = Some(Box::new(callback));
    }

    /// Stop the pipeline gracefully.
    ///
    /// New submissions are refused immediately;
    /// queued jobs get up to the configured shutdown timeout to drain,
    /// then whatever is still queued is dropped
    /// and the worker threads are joined.
    /// Returns the number of dropped jobs.
    pub fn stop(&self) -> usize {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            // already stopped
            return 0;
        }

        let deadline = Instant::now() + self.inner.config.shutdown_timeout;
        while self.total_pending_jobs() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        let dropped = self.total_pending_jobs();
        if dropped > 0 {
            warn!("shutdown timeout reached, dropping {} queued jobs", dropped);
            self.inner.discard.store(true, Ordering::Release);
        }

        // closing the channels lets the workers run dry and exit
        for stage in &self.inner.stages {
            for worker in &stage.workers {
                worker.sender.lock().expect("stage sender lock").take();
            }
        }

        let handles = std::mem::take(
            &mut *self
                .inner
                .worker_handles
                .lock()
                .expect("worker handle lock"),
        );
        for handle in handles {
            let _ = handle.join();
        }

        info!("pipeline stopped ({} jobs dropped)", dropped);
        dropped
    }

    fn fire_backpressure(&self, stage: PipelineStage, depth: usize) {
        if let Some(callback) = self
            .inner
            .backpressure_callback
            .lock()
            .expect("backpressure callback lock")
            .as_ref()
        {
            callback(stage, depth);
        }
    }
}

fn worker_loop(
    inner: Arc<Inner>,
    stage: PipelineStage,
    receiver: mpsc::Receiver<Box<dyn Job>>,
    depth: Arc<AtomicUsize>,
) {
    let coordinator = PipelineCoordinator {
        inner: Arc::clone(&inner),
    };

    while let Ok(job) = receiver.recv() {
        depth.fetch_sub(1, Ordering::Relaxed);

        if inner.discard.load(Ordering::Acquire) {
            inner.metrics.record_dropped(stage);
            continue;
        }

        let context = job.context().clone();
        let queue_latency = context.enqueued_at.elapsed();
        let name = job.name().to_string();

        let result = job.execute(&coordinator);
        let success = result.is_ok();

        if inner.config.enable_metrics {
            inner
                .metrics
                .record_processed(stage, context.category, queue_latency, success);
        }
        if let Err(error) = &result {
            warn!(
                "job `{}` (id {}) failed on {}: {}",
                name, context.job_id, stage, error
            );
        }
        if let Some(callback) = inner
            .completion_callback
            .lock()
            .expect("completion callback lock")
            .as_ref()
        {
            callback(&context, success);
        }
    }

    debug!("worker for {} shutting down", stage);
}
