//! Error types for the supervisor domain.

use std::fmt::{Display, Formatter};

use crate::config::JobId;

/// Errors raised by registry, configuration and worker lookups.
///
/// None of these are fatal to the supervisor loop: callers log them and
/// treat the failed operation as a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    /// Operation referenced a job id the registry does not know.
    UnknownJob(JobId),
    /// A job entry failed validation.
    InvalidConfig { job_id: JobId, message: String },
    /// No worker constructor is registered under this name.
    UnknownWorker(String),
    /// A worker constructor rejected the job's fields.
    InvalidWorkerConfig { worker: String, message: String },
}

impl Display for SupervisorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownJob(id) => write!(f, "unknown job: {}", id),
            Self::InvalidConfig { job_id, message } => {
                write!(f, "invalid config for job {}: {}", job_id, message)
            }
            Self::UnknownWorker(name) => write!(f, "unknown worker type: {}", name),
            Self::InvalidWorkerConfig { worker, message } => {
                write!(f, "{} worker {}", worker, message)
            }
        }
    }
}

impl std::error::Error for SupervisorError {}
