use thiserror::Error;

/// Store faults and programming errors.
///
/// Losing a claim race is not an error: contended operations return
/// `Ok(None)` and never produce one of these.
#[derive(Debug, Error)]
pub enum QueueError {
    /// An insert collided with an existing job id.
    #[error("Duplicate job id: {id}")]
    DuplicateKey { id: String },

    /// The store could not be reached or rejected the operation
    /// (busy past the timeout, I/O failure, closed connection…).
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] rusqlite::Error),

    /// A payload could not be encoded for, or decoded from, the store.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A status invariant was broken (e.g. `None` headed for the store, an
    /// invalid edge requested, an unreadable status read back). Not recoverable.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// A pooled worker task panicked or was cancelled.
    #[error("Worker task failed: {0}")]
    WorkerTask(String),

    #[error(transparent)]
    Config(#[from] pls_core::CoreError),
}

impl QueueError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::DuplicateKey { .. } => "DUPLICATE_KEY",
            QueueError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            QueueError::Serialization(_) => "SERIALIZATION_ERROR",
            QueueError::InvariantViolation(_) => "INVARIANT_VIOLATION",
            QueueError::WorkerTask(_) => "WORKER_TASK_FAILED",
            QueueError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Faults raised while executing a job.
///
/// The worker loop absorbs every one of these into a `Failed` transition.
#[derive(Debug, Error)]
pub enum JobError {
    /// The stored payload does not decode into the registered variant.
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    /// No variant is registered for the record's discriminator.
    #[error("no job variant registered for kind '{kind}'")]
    UnknownKind { kind: String },

    /// The variant's execute behaviour reported an error.
    #[error("execution failed: {0}")]
    Execution(String),

    /// The variant's execute behaviour panicked.
    #[error("execution panicked: {0}")]
    Panicked(String),
}

impl JobError {
    pub fn execution(msg: impl Into<String>) -> Self {
        JobError::Execution(msg.into())
    }
}
