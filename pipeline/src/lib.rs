//! Six-stage I/O pipeline for DICOM operations.
//!
//! Work moves through the pipeline as queued jobs,
//! not shared memory:
//! each stage owns a pool of worker threads
//! sized for its workload profile,
//! and a job running on one stage hands off to the next
//! by submitting a follow-up job.
//!
//! ```text
//! Stage 1: network_receive     (network I/O workers)
//! Stage 2: pdu_decode          (protocol workers)
//! Stage 3: dimse_process       (protocol workers)
//! Stage 4: storage_query_exec  (execution workers, blocking allowed)
//! Stage 5: response_encode     (encode workers)
//! Stage 6: network_send        (network I/O workers)
//! ```
//!
//! Within one session, jobs are processed in submission order
//! at every stage; across sessions there is no ordering.
//! Backpressure is signalled, not enforced by blocking:
//! when a stage's queue depth reaches the configured maximum,
//! submissions fail with [`Error::QueueFull`]
//! and the backpressure callback fires.

pub mod cancel;
pub mod coordinator;
pub mod job;
pub mod metrics;

pub use cancel::CancelRegistry;
pub use coordinator::{PipelineConfig, PipelineCoordinator};
pub use job::{Job, JobCategory, JobContext, PipelineStage};
pub use metrics::{MetricsSnapshot, PipelineMetrics, StageMetricsSnapshot};

use snafu::{Backtrace, Snafu};

/// An error from the pipeline.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("stage {} queue is full ({} jobs queued)", stage.name(), depth))]
    QueueFull {
        stage: PipelineStage,
        depth: usize,
        backtrace: Backtrace,
    },

    /// the pipeline is not running
    NotRunning { backtrace: Backtrace },

    #[snafu(display("job failed: {}", message))]
    JobFailed {
        message: String,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
