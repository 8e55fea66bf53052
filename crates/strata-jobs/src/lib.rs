//! Debounced recompute queue for structural inference.
//!
//! Jobs move `queued -> running -> succeeded | failed` exactly once. A job
//! that fails records a bounded error string and is never requeued; a later
//! dispatch creates a fresh job.

use chrono::{DateTime, Duration, Utc};
use strata_core::JobStatus;
use strata_inference::InferenceError;
use strata_storage::StorageError;
use thiserror::Error;

mod dispatch;
mod processor;
mod runner;

pub use dispatch::{dispatch_structure_recompute, DispatchOutcome, RecomputeRequest};
pub use processor::{truncate_error, StructureJobProcessor};
pub use runner::{drain_queue, sweep_stale_jobs, DrainConfig, DrainReport, JobOutcome};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("structure job {job_id} not found")]
    NotFound { job_id: String },
    #[error("structure job {job_id} is {status}, expected {expected}")]
    InvalidState {
        job_id: String,
        status: JobStatus,
        expected: JobStatus,
    },
    #[error("missing thinking time: {0}")]
    MissingThinkingTime(String),
    #[error("inference error: {0}")]
    Inference(InferenceError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<InferenceError> for JobError {
    /// Collector failures are input-data defects and keep their own class.
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::Signal(err) => JobError::MissingThinkingTime(err.to_string()),
            other => JobError::Inference(other),
        }
    }
}

/// Source of job timestamps. Claims and completions each read it, so a job's
/// `started_at` and `finished_at` reflect when that job actually ran.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl<F> Clock for F
where
    F: Fn() -> DateTime<Utc>,
{
    fn now(&self) -> DateTime<Utc> {
        self()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    pub debounce_window: Duration,
    pub max_error_chars: usize,
    pub stale_after: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::seconds(60),
            max_error_chars: 1_000,
            stale_after: Duration::minutes(15),
        }
    }
}
