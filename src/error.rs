/// Error taxonomy for grid launches.
///
/// Configuration and usage errors are raised close to the violation and abort
/// the whole launch. The host only sees the first one; peers that were aborted
/// because of it report `Aborted`, which is never surfaced as the launch result.
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SimError>;

#[derive(Debug, Clone, Error)]
pub enum SimError {
    #[error("invalid {what} dimensions ({x},{y},{z}): every dimension must be non-zero and their product must fit in u32")]
    InvalidDimensions {
        what: &'static str,
        x: u32,
        y: u32,
        z: u32,
    },

    #[error("invalid pool limits: resident_group_limit={resident_group_limit}, parallel_thread_limit={parallel_thread_limit}")]
    InvalidLimits {
        resident_group_limit: u32,
        parallel_thread_limit: u32,
    },

    #[error("group of {group_size} lanes exceeds platform maximum of {max}")]
    GroupTooLarge { group_size: u32, max: u32 },

    #[error("parallel thread limit {thread_limit} cannot hold one group of {group_size} lanes")]
    ThreadLimitBelowGroupSize { thread_limit: u32, group_size: u32 },

    #[error("named barrier id {id} out of range (limit {limit})")]
    BarrierIdOutOfRange { id: usize, limit: usize },

    #[error("named barrier {id} configured for {expected_producers} producers / {expected_consumers} consumers, lane {lane} signaled {producers} / {consumers}")]
    NamedBarrierMismatch {
        id: usize,
        lane: usize,
        expected_producers: u32,
        expected_consumers: u32,
        producers: u32,
        consumers: u32,
    },

    #[error("named barrier {id}: {reason}")]
    NamedBarrierUsage { id: usize, reason: String },

    #[error("shared local memory used before slm_init")]
    SlmNotInitialized,

    #[error("shared local memory request of {requested} bytes exceeds capacity {capacity}")]
    SlmCapacityExceeded { requested: usize, capacity: usize },

    #[error("shared local memory already holds a {existing}-byte allocation, got request for {requested}")]
    SlmSizeConflict { existing: usize, requested: usize },

    #[error("shared local memory capacity is fixed at {capacity} bytes once allocated, got resize to {requested}")]
    SlmCapacityConflict { capacity: usize, requested: usize },

    #[error("shared local memory access [{offset}, {offset}+{len}) outside allocation of {size} bytes")]
    SlmOutOfBounds { offset: usize, len: usize, size: usize },

    #[error("broadcast payload of {len} bytes exceeds per-lane stride {stride}")]
    BroadcastTooLarge { len: usize, stride: usize },

    #[error("kernel '{kernel}' failed in group {group}, lane {lane}: {message}")]
    KernelFailed {
        kernel: String,
        group: usize,
        lane: usize,
        message: String,
    },

    #[error("kernel '{kernel}' panicked in group {group}, lane {lane}: {message}")]
    KernelPanicked {
        kernel: String,
        group: usize,
        lane: usize,
        message: String,
    },

    #[error("launch aborted")]
    Aborted,

    #[error("no forward progress for {millis} ms, launch aborted")]
    Timeout { millis: u64 },

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),

    #[error("platform config: {0}")]
    Config(String),
}

impl SimError {
    /// Build a kernel-side failure with a free-form message. Kernels return this
    /// from their body to fail the launch.
    pub fn kernel(message: impl Into<String>) -> Self {
        SimError::KernelFailed {
            kernel: String::new(),
            group: 0,
            lane: 0,
            message: message.into(),
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, SimError::Aborted)
    }
}

impl From<std::io::Error> for SimError {
    fn from(e: std::io::Error) -> Self {
        SimError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for SimError {
    fn from(e: serde_json::Error) -> Self {
        SimError::Config(e.to_string())
    }
}
