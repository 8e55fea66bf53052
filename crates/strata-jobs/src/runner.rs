use crate::processor::truncate_error;
use crate::{Clock, JobConfig, JobError, StructureJobProcessor};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use strata_core::JobStatus;
use strata_inference::InferenceConfig;
use strata_storage::StructureStore;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct DrainConfig {
    pub batch_size: usize,
    /// When set, a drain only runs while holding an exclusive lock on this
    /// file, so one host runs at most one drain loop at a time.
    pub lock_path: Option<PathBuf>,
    pub job: JobConfig,
    pub inference: InferenceConfig,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            lock_path: None,
            job: JobConfig::default(),
            inference: InferenceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub user_id: String,
    pub status: JobStatus,
    pub snapshot_written: bool,
    pub error: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub lock_conflict: bool,
    pub swept: Vec<String>,
    pub jobs_claimed: usize,
    pub jobs_succeeded: usize,
    pub jobs_failed: usize,
    pub jobs_skipped: usize,
    pub outcomes: Vec<JobOutcome>,
}

/// Fails `running` jobs that started longer than `stale_after` ago. They are
/// not requeued; the next dispatch creates a fresh job.
pub fn sweep_stale_jobs(
    store: &StructureStore,
    config: &JobConfig,
    now: DateTime<Utc>,
) -> Result<Vec<String>, JobError> {
    let message = truncate_error(
        &format!(
            "stale: running longer than {}s",
            config.stale_after.num_seconds()
        ),
        config.max_error_chars,
    );
    let swept = store.fail_stale_running_jobs(now - config.stale_after, now, &message)?;
    for job_id in &swept {
        warn!(event = "structure_job_stale", job_id = %job_id);
    }
    Ok(swept)
}

/// Sweeps stale jobs, then processes up to `batch_size` queued jobs oldest
/// first. Each job succeeds or fails on its own; only queue-level errors
/// abort the drain. Every job reads `clock` when it is claimed and when it
/// finishes.
pub fn drain_queue<C: Clock + ?Sized>(
    store: &StructureStore,
    config: &DrainConfig,
    clock: &C,
) -> Result<DrainReport, JobError> {
    let mut report = DrainReport::default();
    let now = clock.now();

    let _lock = match config.lock_path.as_deref() {
        Some(path) => match DrainLock::try_acquire(path, now)? {
            Some(lock) => Some(lock),
            None => {
                report.lock_conflict = true;
                info!(event = "structure_drain_lock_busy", path = %path.display());
                return Ok(report);
            }
        },
        None => None,
    };

    report.swept = sweep_stale_jobs(store, &config.job, now)?;

    let processor = StructureJobProcessor::new(config.inference.clone(), config.job.clone());
    for job in store.queued_jobs(config.batch_size.max(1))? {
        match processor.process(store, &job.id, clock) {
            Ok(run) => {
                report.jobs_claimed += 1;
                report.jobs_succeeded += 1;
                report.outcomes.push(JobOutcome {
                    job_id: job.id,
                    user_id: job.user_id,
                    status: JobStatus::Succeeded,
                    snapshot_written: run.snapshot_written(),
                    error: None,
                });
            }
            // Another worker claimed it between listing and claiming.
            Err(JobError::NotFound { .. })
            | Err(JobError::InvalidState {
                expected: JobStatus::Queued,
                ..
            }) => {
                report.jobs_skipped += 1;
            }
            Err(err) => {
                let status = store
                    .structure_job(&job.id)?
                    .map(|current| current.status)
                    .unwrap_or(JobStatus::Failed);
                if status == JobStatus::Failed {
                    report.jobs_claimed += 1;
                    report.jobs_failed += 1;
                }
                report.outcomes.push(JobOutcome {
                    job_id: job.id,
                    user_id: job.user_id,
                    status,
                    snapshot_written: false,
                    error: Some(truncate_error(&err.to_string(), config.job.max_error_chars)),
                });
            }
        }
    }

    info!(
        event = "structure_drain_finished",
        swept = report.swept.len(),
        claimed = report.jobs_claimed,
        succeeded = report.jobs_succeeded,
        failed = report.jobs_failed,
        skipped = report.jobs_skipped
    );
    Ok(report)
}

struct DrainLock {
    file: File,
}

impl DrainLock {
    fn try_acquire(path: &Path, now: DateTime<Utc>) -> Result<Option<Self>, std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }

        let metadata = format!(
            "owner_pid={}\nacquired_at={}\n",
            std::process::id(),
            now.to_rfc3339()
        );
        file.set_len(0)?;
        file.write_all(metadata.as_bytes())?;
        file.flush()?;

        Ok(Some(Self { file }))
    }
}

impl Drop for DrainLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::cell::Cell;
    use strata_storage::NewStructureJob;
    use tempfile::tempdir;

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 5, 8, 0, 0)
            .single()
            .expect("valid timestamp")
            + Duration::minutes(minute)
    }

    fn queue(store: &StructureStore, id: &str, user: &str, queued_at: DateTime<Utc>) {
        store
            .enqueue_job_if_not_debounced(
                &NewStructureJob {
                    id: id.to_string(),
                    user_id: user.to_string(),
                    scope: "user".to_string(),
                    job_type: "structure_recompute".to_string(),
                    payload: serde_json::json!({ "reason": "backfill" }),
                    debounce_key: format!("user:{id}"),
                    queued_at,
                },
                queued_at,
            )
            .expect("enqueue");
    }

    #[test]
    fn drain_processes_oldest_first_up_to_batch_size() {
        let store = StructureStore::open_in_memory().expect("open db");
        queue(&store, "job-c", "u-3", at(2));
        queue(&store, "job-a", "u-1", at(0));
        queue(&store, "job-b", "u-2", at(1));

        let config = DrainConfig {
            batch_size: 2,
            ..DrainConfig::default()
        };
        let report = drain_queue(&store, &config, &|| at(5)).expect("drain");
        assert_eq!(report.jobs_succeeded, 2);
        let processed = report
            .outcomes
            .iter()
            .map(|outcome| outcome.job_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(processed, vec!["job-a", "job-b"]);
        assert_eq!(store.queued_jobs(10).expect("queued").len(), 1);
    }

    #[test]
    fn each_job_in_a_batch_is_stamped_when_it_runs() {
        let store = StructureStore::open_in_memory().expect("open db");
        for (index, id) in ["job-a", "job-b", "job-c"].into_iter().enumerate() {
            queue(&store, id, &format!("u-{index}"), at(0));
        }

        let ticks = Cell::new(0);
        let clock = || {
            let tick = ticks.get();
            ticks.set(tick + 1);
            at(1) + Duration::seconds(10) * tick
        };
        let report = drain_queue(&store, &DrainConfig::default(), &clock).expect("drain");
        assert_eq!(report.jobs_succeeded, 3);

        let mut previous_finish = at(0);
        for id in ["job-a", "job-b", "job-c"] {
            let job = store.structure_job(id).expect("load").expect("job");
            let started_at = job.started_at.expect("started");
            let finished_at = job.finished_at.expect("finished");
            assert!(started_at > previous_finish, "{id} started before its predecessor ended");
            assert!(finished_at > started_at, "{id} finished when it started");
            previous_finish = finished_at;
        }
    }

    #[test]
    fn sweep_fails_stuck_jobs_before_draining() {
        let store = StructureStore::open_in_memory().expect("open db");
        queue(&store, "job-stuck", "u-1", at(0));
        assert!(store.claim_job("job-stuck", at(1)).expect("claim"));

        let report = drain_queue(&store, &DrainConfig::default(), &|| at(30)).expect("drain");
        assert_eq!(report.swept, vec!["job-stuck".to_string()]);

        let job = store
            .structure_job("job-stuck")
            .expect("load")
            .expect("job");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.error.as_deref(),
            Some("stale: running longer than 900s")
        );
    }

    #[test]
    fn busy_lock_reports_conflict_without_touching_the_queue() {
        let store = StructureStore::open_in_memory().expect("open db");
        queue(&store, "job-a", "u-1", at(0));
        let dir = tempdir().expect("temp dir");
        let lock_path = dir.path().join("locks").join("drain.lock");

        let held = DrainLock::try_acquire(&lock_path, at(0))
            .expect("lock io")
            .expect("lock acquired");
        let config = DrainConfig {
            lock_path: Some(lock_path.clone()),
            ..DrainConfig::default()
        };
        let report = drain_queue(&store, &config, &|| at(1)).expect("drain");
        assert!(report.lock_conflict);
        assert_eq!(store.queued_jobs(10).expect("queued").len(), 1);

        drop(held);
        let report = drain_queue(&store, &config, &|| at(2)).expect("drain");
        assert!(!report.lock_conflict);
        assert_eq!(report.jobs_succeeded, 1);
    }
}
