//! Crate-wide error taxonomy.
//!
//! Each component boundary gets its own `thiserror` enum carrying enough
//! structured data to reconstruct the error kind without string matching.
//! [`Error`] composes them for code that threads errors across boundaries
//! (the scheduler calling into the job manager, for instance).

use crate::jobs::JobId;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error, composing every component's error enum.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Job(#[from] JobManagerError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Errors surfaced by the Job Manager port.
#[derive(Debug, Clone, Error)]
pub enum JobManagerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("duplicate job id: {0}")]
    Duplicate(JobId),

    #[error("job {0} is already in a terminal state")]
    AlreadyTerminal(JobId),

    #[error("pending queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("export method unavailable: {0:?}")]
    MethodUnavailable(crate::capability::ExportMethod),

    #[error("job {job_id} failed: {message}")]
    Fatal { job_id: JobId, message: String },
}

impl JobManagerError {
    pub fn is_validation(&self) -> bool {
        matches!(self, JobManagerError::Validation(_))
    }
}

/// Errors surfaced by the Cron Scheduler port.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("schedule not found: {0}")]
    NotFound(uuid::Uuid),

    #[error("duplicate schedule id: {0}")]
    Duplicate(uuid::Uuid),

    #[error("invalid time window: {0}")]
    InvalidTimeWindow(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Errors surfaced by the Connection Pool.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("failed to create pooled session: {0}")]
    CreateFailed(String),

    #[error("acquire cancelled before a session became available")]
    AcquireCancelled,

    #[error("pool is closed")]
    Closed,
}

/// Errors surfaced by the Webhook Notifier. These are always absorbed
/// internally (Transient, per the error taxonomy) and never propagated
/// to a Job Manager caller; the type exists for logging and tests.
#[derive(Debug, Clone, Error)]
pub enum WebhookError {
    #[error("delivery to {url} failed: {reason}")]
    DeliveryFailed { url: String, reason: String },

    #[error("subscriber {0} not found")]
    SubscriberNotFound(uuid::Uuid),
}

/// Errors surfaced by the Persistence Port.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    #[error("schedule not found: {0}")]
    NotFound(uuid::Uuid),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Errors surfaced by the Capability Detector / Exporter Factory. Probe
/// timeouts are Transient per the error taxonomy: the detector logs and
/// falls back to `version="unknown"` rather than constructing this.
#[derive(Debug, Clone, Error)]
pub enum CapabilityError {
    #[error("probe for {0:?} timed out")]
    ProbeTimeout(crate::capability::ExportMethod),
}
