use crate::{Clock, JobConfig, JobError};
use strata_core::JobStatus;
use strata_inference::{InferenceConfig, InferenceReport, StructureInferenceEngine};
use strata_storage::StructureStore;
use tracing::{info, warn};

/// Runs one queued job end to end on the privileged store.
pub struct StructureJobProcessor {
    engine: StructureInferenceEngine,
    config: JobConfig,
}

impl StructureJobProcessor {
    pub fn new(inference: InferenceConfig, config: JobConfig) -> Self {
        Self {
            engine: StructureInferenceEngine::new(inference),
            config,
        }
    }

    /// Claims `job_id`, runs the pipeline and records the terminal status.
    ///
    /// The pipeline and the `succeeded` transition commit together. If the
    /// job stopped being `running` meanwhile (a stale sweep failed it), the
    /// structural writes roll back and `InvalidState` is returned. Any other
    /// failure marks the job `failed` with the truncated message and is
    /// returned to the caller.
    pub fn process<C: Clock + ?Sized>(
        &self,
        store: &StructureStore,
        job_id: &str,
        clock: &C,
    ) -> Result<InferenceReport, JobError> {
        let job = store
            .structure_job(job_id)?
            .ok_or_else(|| JobError::NotFound {
                job_id: job_id.to_string(),
            })?;
        if !job.status.can_transition_to(JobStatus::Running) {
            return Err(JobError::InvalidState {
                job_id: job.id,
                status: job.status,
                expected: JobStatus::Queued,
            });
        }

        if !store.claim_job(&job.id, clock.now())? {
            let status = current_status(store, &job.id, job.status)?;
            return Err(JobError::InvalidState {
                job_id: job.id,
                status,
                expected: JobStatus::Queued,
            });
        }
        info!(
            event = "structure_job_started",
            job_id = %job.id,
            user_id = %job.user_id,
            scope = %job.scope
        );

        let run_at = clock.now();
        let outcome = store.atomically(|store| {
            let report = self.engine.run(store, &job.user_id, &job.scope, run_at)?;
            if !store.complete_job(&job.id, clock.now())? {
                return Err(JobError::InvalidState {
                    job_id: job.id.clone(),
                    status: current_status(store, &job.id, JobStatus::Running)?,
                    expected: JobStatus::Running,
                });
            }
            Ok(report)
        });

        match outcome {
            Ok(report) => {
                info!(
                    event = "structure_job_succeeded",
                    job_id = %job.id,
                    user_id = %job.user_id,
                    signals = report.signals,
                    arcs = report.arcs,
                    phases = report.phases,
                    snapshot_written = report.snapshot_written(),
                    state_hash = %report.state_hash
                );
                Ok(report)
            }
            Err(err @ JobError::InvalidState { .. }) => {
                warn!(
                    event = "structure_job_superseded",
                    job_id = %job.id,
                    user_id = %job.user_id,
                    error = %err
                );
                Err(err)
            }
            Err(err) => {
                let message = truncate_error(&err.to_string(), self.config.max_error_chars);
                match store.fail_job(&job.id, clock.now(), &message) {
                    Ok(true) => {}
                    Ok(false) => warn!(
                        event = "structure_job_failure_unrecorded",
                        job_id = %job.id,
                        reason = "job no longer running"
                    ),
                    Err(store_err) => warn!(
                        event = "structure_job_failure_unrecorded",
                        job_id = %job.id,
                        error = %store_err
                    ),
                }
                warn!(
                    event = "structure_job_failed",
                    job_id = %job.id,
                    user_id = %job.user_id,
                    error = %err
                );
                Err(err)
            }
        }
    }
}

fn current_status(
    store: &StructureStore,
    job_id: &str,
    fallback: JobStatus,
) -> Result<JobStatus, JobError> {
    Ok(store
        .structure_job(job_id)?
        .map(|current| current.status)
        .unwrap_or(fallback))
}

/// First `max_chars` characters of `message`.
pub fn truncate_error(message: &str, max_chars: usize) -> String {
    message.chars().take(max_chars).collect()
}
