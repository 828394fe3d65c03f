//! Job types for the six pipeline stages.

use std::time::Instant;

use crate::coordinator::PipelineCoordinator;
use crate::Result;

/// Identifies the six stages of the DICOM I/O pipeline.
///
/// Each stage has dedicated worker threads:
/// the network stages are low latency and non-blocking,
/// the protocol stages are CPU bound,
/// and only `StorageQueryExec` may block on I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PipelineStage {
    /// Stage 1: receive raw PDU bytes from the network
    NetworkReceive = 0,
    /// Stage 2: decode PDU bytes into structured data
    PduDecode = 1,
    /// Stage 3: process DIMSE messages and route requests
    DimseProcess = 2,
    /// Stage 4: execute storage and query operations (blocking allowed)
    StorageQueryExec = 3,
    /// Stage 5: encode responses into PDU bytes
    ResponseEncode = 4,
    /// Stage 6: send PDU bytes to the network
    NetworkSend = 5,
}

/// The number of pipeline stages.
pub const STAGE_COUNT: usize = 6;

impl PipelineStage {
    /// All stages, in pipeline order.
    pub const ALL: [PipelineStage; STAGE_COUNT] = [
        PipelineStage::NetworkReceive,
        PipelineStage::PduDecode,
        PipelineStage::DimseProcess,
        PipelineStage::StorageQueryExec,
        PipelineStage::ResponseEncode,
        PipelineStage::NetworkSend,
    ];

    /// The human readable stage name.
    pub fn name(self) -> &'static str {
        match self {
            PipelineStage::NetworkReceive => "network_receive",
            PipelineStage::PduDecode => "pdu_decode",
            PipelineStage::DimseProcess => "dimse_process",
            PipelineStage::StorageQueryExec => "storage_query_exec",
            PipelineStage::ResponseEncode => "response_encode",
            PipelineStage::NetworkSend => "network_send",
        }
    }

    /// Whether blocking operations are allowed on this stage.
    pub fn is_blocking(self) -> bool {
        self == PipelineStage::StorageQueryExec
    }

    /// Whether this stage handles network I/O.
    pub fn is_network_io(self) -> bool {
        matches!(
            self,
            PipelineStage::NetworkReceive | PipelineStage::NetworkSend
        )
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Default for PipelineStage {
    fn default() -> Self {
        PipelineStage::NetworkReceive
    }
}

/// Categories for pipeline jobs, used in metrics and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum JobCategory {
    /// C-ECHO verification
    Echo = 0,
    /// C-STORE storage
    Store = 1,
    /// C-FIND query
    Find = 2,
    /// C-GET retrieve
    Get = 3,
    /// C-MOVE move
    Move = 4,
    /// Association management (A-ASSOCIATE, A-RELEASE, A-ABORT)
    Association = 5,
    /// Internal pipeline control messages
    Control = 6,
    /// Anything else
    Other = 7,
}

/// The number of job categories.
pub const CATEGORY_COUNT: usize = 8;

impl JobCategory {
    pub fn name(self) -> &'static str {
        match self {
            JobCategory::Echo => "echo",
            JobCategory::Store => "store",
            JobCategory::Find => "find",
            JobCategory::Get => "get",
            JobCategory::Move => "move",
            JobCategory::Association => "association",
            JobCategory::Control => "control",
            JobCategory::Other => "other",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for JobCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The default job priority (0 is highest).
pub const DEFAULT_PRIORITY: u8 = 128;

/// Context attached to a job for tracking and metrics,
/// carried through all stages of one DICOM operation.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Unique identifier for this job, monotonically increasing
    pub job_id: u64,
    /// Session (association) identifier
    pub session_id: u64,
    /// Message ID from the DIMSE command, if applicable
    pub message_id: u16,
    /// Current pipeline stage
    pub stage: PipelineStage,
    /// Job category for metrics
    pub category: JobCategory,
    /// When the job entered the current stage queue
    pub enqueued_at: Instant,
    /// Sequence number for ordering within the session
    pub sequence_number: u32,
    /// Priority (lower is higher, 0 is highest)
    pub priority: u8,
}

impl JobContext {
    /// Create a context for a job entering the pipeline.
    pub fn new(job_id: u64, session_id: u64, category: JobCategory) -> JobContext {
        JobContext {
            job_id,
            session_id,
            message_id: 0,
            stage: PipelineStage::NetworkReceive,
            category,
            enqueued_at: Instant::now(),
            sequence_number: 0,
            priority: DEFAULT_PRIORITY,
        }
    }

    /// Derive the context for a follow-up job on the next stage,
    /// keeping the identifiers and refreshing the queue timestamp.
    pub fn for_stage(&self, stage: PipelineStage) -> JobContext {
        JobContext {
            stage,
            enqueued_at: Instant::now(),
            ..self.clone()
        }
    }

    pub fn with_message_id(mut self, message_id: u16) -> JobContext {
        self.message_id = message_id;
        self
    }

    pub fn with_sequence_number(mut self, sequence_number: u32) -> JobContext {
        self.sequence_number = sequence_number;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> JobContext {
        self.priority = priority;
        self
    }
}

/// A unit of work executed by a stage's worker pool.
///
/// Implementations perform the stage-specific work and may submit
/// follow-up jobs to the next stage through the coordinator.
pub trait Job: Send + 'static {
    /// Execute the job on its stage's worker pool.
    fn execute(self: Box<Self>, pipeline: &PipelineCoordinator) -> Result<()>;

    /// The job context, for tracking and metrics.
    fn context(&self) -> &JobContext;

    /// The job name, for logging.
    fn name(&self) -> &str {
        "job"
    }
}

/// A job wrapping a closure,
/// the common case for stage handoffs.
pub struct FnJob {
    context: JobContext,
    name: &'static str,
    f: Box<dyn FnOnce(&PipelineCoordinator) -> Result<()> + Send + 'static>,
}

impl FnJob {
    pub fn new(
        context: JobContext,
        name: &'static str,
        f: impl FnOnce(&PipelineCoordinator) -> Result<()> + Send + 'static,
    ) -> FnJob {
        FnJob {
            context,
            name,
            f: Box::new(f),
        }
    }
}

impl Job for FnJob {
    fn execute(self: Box<Self>, pipeline: &PipelineCoordinator) -> Result<()> {
        (self.f)(pipeline)
    }

    fn context(&self) -> &JobContext {
        &self.context
    }

    fn name(&self) -> &str {
        self.name
    }
}
