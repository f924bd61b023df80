use thiserror::Error;

use crate::admission::AdmissionError;
use crate::config::ConfigError;
use crate::job::JobStatus;
use crate::store::StoreError;
use crate::supervisor::WorkerError;

pub mod codes;

pub use codes::{describe_error_code, ErrorCode};

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// The unified error type returned by the coordinator's public operations
///
/// Errors that stop a job from *starting* come back to the submitter through
/// this type. Failures that happen while a job runs never surface here; they
/// become a terminal event plus an `error` status on the job instead.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("[E{:04}] Job not found: {}", ErrorCode::JOB_NOT_FOUND, .0)]
    JobNotFound(String),

    #[error("[E{:04}] Job already exists: {}", ErrorCode::JOB_ALREADY_EXISTS, .0)]
    JobAlreadyExists(String),

    #[error("[E{:04}] Job {} is still running", ErrorCode::JOB_STILL_RUNNING, .0)]
    JobStillRunning(String),

    #[error("[E{:04}] Job {job_id} is {status}, not running", ErrorCode::JOB_NOT_RUNNING)]
    JobNotRunning { job_id: String, status: JobStatus },

    #[error("[E{:04}] Job {job_id} does not belong to the caller", ErrorCode::JOB_PERMISSION_DENIED)]
    NotOwner { job_id: String },

    #[error("[E{:04}] Invalid job request: {}", ErrorCode::VALIDATION_GENERIC, .0)]
    InvalidRequest(String),

    #[error("[E{:04}] {}", .0.code(), .0)]
    Admission(#[from] AdmissionError),

    #[error("[E{:04}] {}", .0.code(), .0)]
    Worker(#[from] WorkerError),

    #[error("[E{:04}] {}", .0.code(), .0)]
    Store(#[from] StoreError),

    #[error("[E{:04}] {}", ErrorCode::CONFIG_GENERIC, .0)]
    Config(#[from] ConfigError),

    #[error("[E{:04}] Internal error: {}", ErrorCode::OTHER_INTERNAL_ERROR, .0)]
    Internal(String),
}

impl CoordinatorError {
    /// Numeric code of this error, see [`ErrorCode`]
    pub fn code(&self) -> u16 {
        match self {
            Self::JobNotFound(_) => ErrorCode::JOB_NOT_FOUND,
            Self::JobAlreadyExists(_) => ErrorCode::JOB_ALREADY_EXISTS,
            Self::JobStillRunning(_) => ErrorCode::JOB_STILL_RUNNING,
            Self::JobNotRunning { .. } => ErrorCode::JOB_NOT_RUNNING,
            Self::NotOwner { .. } => ErrorCode::JOB_PERMISSION_DENIED,
            Self::InvalidRequest(_) => ErrorCode::VALIDATION_GENERIC,
            Self::Admission(err) => err.code(),
            Self::Worker(err) => err.code(),
            Self::Store(err) => err.code(),
            Self::Config(_) => ErrorCode::CONFIG_GENERIC,
            Self::Internal(_) => ErrorCode::OTHER_INTERNAL_ERROR,
        }
    }

    /// Human-readable description of the error category
    pub fn describe(&self) -> &'static str {
        describe_error_code(self.code())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::JobNotFound(_))
    }
}
