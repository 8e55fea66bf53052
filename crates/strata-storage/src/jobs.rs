//! `structure_jobs` queue rows.
//!
//! Every transition is a conditional update on the expected current status,
//! so two workers can never both move the same job forward.

use crate::{
    conversion_failure, invalid_column, opt_ts_column, ts_column, StorageError, StructureStore,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;
use strata_core::{format_timestamp, JobStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct NewStructureJob {
    pub id: String,
    pub user_id: String,
    pub scope: String,
    pub job_type: String,
    pub payload: Value,
    pub debounce_key: String,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructureJob {
    pub id: String,
    pub user_id: String,
    pub scope: String,
    pub job_type: String,
    pub status: JobStatus,
    pub payload: Value,
    pub debounce_key: String,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

const JOB_COLUMNS: &str = "
    SELECT id, user_id, scope, job_type, status, payload_json, debounce_key,
           queued_at, started_at, finished_at, error
    FROM structure_jobs";

impl StructureStore {
    /// Inserts `job` as `queued` unless an in-flight job for the same user and
    /// debounce key was queued at or after `debounce_cutoff`. The check and
    /// the insert are one statement.
    ///
    /// Returns `false` when the insert was debounced.
    pub fn enqueue_job_if_not_debounced(
        &self,
        job: &NewStructureJob,
        debounce_cutoff: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let payload_json = serde_json::to_string(&job.payload)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        let inserted = self.conn.execute(
            "
            INSERT INTO structure_jobs (
                id,
                user_id,
                scope,
                job_type,
                status,
                payload_json,
                debounce_key,
                queued_at,
                started_at,
                finished_at,
                error
            )
            SELECT ?1, ?2, ?3, ?4, 'queued', ?5, ?6, ?7, NULL, NULL, NULL
            WHERE NOT EXISTS (
                SELECT 1
                FROM structure_jobs
                WHERE user_id = ?2
                  AND debounce_key = ?6
                  AND status IN ('queued', 'running')
                  AND queued_at >= ?8
            )
            ",
            params![
                job.id,
                job.user_id,
                job.scope,
                job.job_type,
                payload_json,
                job.debounce_key,
                format_timestamp(job.queued_at),
                format_timestamp(debounce_cutoff),
            ],
        )?;
        Ok(inserted == 1)
    }

    /// Most recently queued in-flight job for the debounce key inside the
    /// window, if any.
    pub fn in_flight_job(
        &self,
        user_id: &str,
        debounce_key: &str,
        debounce_cutoff: DateTime<Utc>,
    ) -> Result<Option<StructureJob>, StorageError> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "{JOB_COLUMNS}
                    WHERE user_id = ?1
                      AND debounce_key = ?2
                      AND status IN ('queued', 'running')
                      AND queued_at >= ?3
                    ORDER BY queued_at DESC, id DESC
                    LIMIT 1"
                ),
                params![user_id, debounce_key, format_timestamp(debounce_cutoff)],
                job_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn structure_job(&self, job_id: &str) -> Result<Option<StructureJob>, StorageError> {
        let row = self
            .conn
            .query_row(
                &format!("{JOB_COLUMNS} WHERE id = ?1"),
                [job_id],
                job_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// `queued -> running`. Returns `false` when the job was not queued.
    pub fn claim_job(&self, job_id: &str, now: DateTime<Utc>) -> Result<bool, StorageError> {
        let updated = self.conn.execute(
            "
            UPDATE structure_jobs
            SET status = 'running', started_at = ?2
            WHERE id = ?1 AND status = 'queued'
            ",
            params![job_id, format_timestamp(now)],
        )?;
        Ok(updated == 1)
    }

    /// `running -> succeeded`, clearing any error.
    pub fn complete_job(&self, job_id: &str, now: DateTime<Utc>) -> Result<bool, StorageError> {
        let updated = self.conn.execute(
            "
            UPDATE structure_jobs
            SET status = 'succeeded', finished_at = ?2, error = NULL
            WHERE id = ?1 AND status = 'running'
            ",
            params![job_id, format_timestamp(now)],
        )?;
        Ok(updated == 1)
    }

    /// `running -> failed`. The caller bounds the error length.
    pub fn fail_job(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, StorageError> {
        let updated = self.conn.execute(
            "
            UPDATE structure_jobs
            SET status = 'failed', finished_at = ?2, error = ?3
            WHERE id = ?1 AND status = 'running'
            ",
            params![job_id, format_timestamp(now), error],
        )?;
        Ok(updated == 1)
    }

    /// Oldest queued jobs first.
    pub fn queued_jobs(&self, limit: usize) -> Result<Vec<StructureJob>, StorageError> {
        let mut statement = self.conn.prepare(&format!(
            "{JOB_COLUMNS}
            WHERE status = 'queued'
            ORDER BY queued_at ASC, id ASC
            LIMIT ?1"
        ))?;
        let rows = statement.query_map([limit as i64], job_from_row)?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    /// Marks `running` jobs started before `started_before` (or never stamped)
    /// as failed. Returns the ids that were swept.
    pub fn fail_stale_running_jobs(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
        error: &str,
    ) -> Result<Vec<String>, StorageError> {
        self.atomically(|store| {
            let mut statement = store.conn.prepare(
                "
                SELECT id
                FROM structure_jobs
                WHERE status = 'running'
                  AND (started_at IS NULL OR started_at < ?1)
                ORDER BY id ASC
                ",
            )?;
            let rows = statement.query_map([format_timestamp(started_before)], |row| {
                row.get::<_, String>(0)
            })?;
            let mut candidates = Vec::new();
            for row in rows {
                candidates.push(row?);
            }

            let mut swept = Vec::new();
            for job_id in candidates {
                if store.fail_job(&job_id, now, error)? {
                    swept.push(job_id);
                }
            }
            Ok(swept)
        })
    }

    pub fn jobs_for_user(&self, user_id: &str) -> Result<Vec<StructureJob>, StorageError> {
        let mut statement = self.conn.prepare(&format!(
            "{JOB_COLUMNS} WHERE user_id = ?1 ORDER BY queued_at ASC, id ASC"
        ))?;
        let rows = statement.query_map([user_id], job_from_row)?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<StructureJob> {
    let status_raw: String = row.get(4)?;
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| invalid_column(4, format!("unknown job status: {status_raw}")))?;
    let payload_raw: String = row.get(5)?;
    let payload = serde_json::from_str(&payload_raw).map_err(|err| conversion_failure(5, err))?;

    Ok(StructureJob {
        id: row.get(0)?,
        user_id: row.get(1)?,
        scope: row.get(2)?,
        job_type: row.get(3)?,
        status,
        payload,
        debounce_key: row.get(6)?,
        queued_at: ts_column(row, 7)?,
        started_at: opt_ts_column(row, 8)?,
        finished_at: opt_ts_column(row, 9)?,
        error: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn at(minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 2, 10, minute, second)
            .single()
            .expect("valid timestamp")
    }

    fn new_job(id: &str, queued_at: DateTime<Utc>) -> NewStructureJob {
        NewStructureJob {
            id: id.to_string(),
            user_id: "u-1".to_string(),
            scope: "user".to_string(),
            job_type: "structure_recompute".to_string(),
            payload: json!({ "reason": "ingestion" }),
            debounce_key: "user:ingestion".to_string(),
            queued_at,
        }
    }

    #[test]
    fn enqueue_is_debounced_inside_the_window_only() {
        let db = StructureStore::open_in_memory().expect("open db");
        let window = Duration::seconds(60);

        assert!(db
            .enqueue_job_if_not_debounced(&new_job("job-1", at(0, 0)), at(0, 0) - window)
            .expect("first enqueue"));
        assert!(!db
            .enqueue_job_if_not_debounced(&new_job("job-2", at(0, 30)), at(0, 30) - window)
            .expect("debounced enqueue"));

        let existing = db
            .in_flight_job("u-1", "user:ingestion", at(0, 30) - window)
            .expect("lookup")
            .expect("in flight");
        assert_eq!(existing.id, "job-1");

        assert!(db
            .enqueue_job_if_not_debounced(&new_job("job-3", at(1, 1)), at(1, 1) - window)
            .expect("after window"));
        assert_eq!(db.jobs_for_user("u-1").expect("jobs").len(), 2);
    }

    #[test]
    fn finished_jobs_do_not_debounce() {
        let db = StructureStore::open_in_memory().expect("open db");
        let window = Duration::seconds(60);
        db.enqueue_job_if_not_debounced(&new_job("job-1", at(0, 0)), at(0, 0) - window)
            .expect("enqueue");
        assert!(db.claim_job("job-1", at(0, 1)).expect("claim"));
        assert!(db.complete_job("job-1", at(0, 2)).expect("complete"));

        assert!(db
            .enqueue_job_if_not_debounced(&new_job("job-2", at(0, 10)), at(0, 10) - window)
            .expect("enqueue after finish"));
    }

    #[test]
    fn transitions_only_move_forward() {
        let db = StructureStore::open_in_memory().expect("open db");
        db.enqueue_job_if_not_debounced(&new_job("job-1", at(0, 0)), at(0, 0))
            .expect("enqueue");

        assert!(!db.complete_job("job-1", at(0, 1)).expect("complete queued"));
        assert!(db.claim_job("job-1", at(0, 1)).expect("claim"));
        assert!(!db.claim_job("job-1", at(0, 2)).expect("double claim"));
        assert!(db.fail_job("job-1", at(0, 3), "boom").expect("fail"));
        assert!(!db.complete_job("job-1", at(0, 4)).expect("complete failed"));

        let job = db
            .structure_job("job-1")
            .expect("load")
            .expect("job exists");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.started_at, Some(at(0, 1)));
        assert_eq!(job.finished_at, Some(at(0, 3)));
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert_eq!(job.payload, json!({ "reason": "ingestion" }));
    }

    #[test]
    fn stale_sweep_fails_only_old_running_jobs() {
        let db = StructureStore::open_in_memory().expect("open db");
        for (id, queued) in [
            ("job-old", at(0, 0)),
            ("job-new", at(0, 1)),
            ("job-idle", at(0, 2)),
        ] {
            let mut job = new_job(id, queued);
            job.debounce_key = id.to_string();
            db.enqueue_job_if_not_debounced(&job, queued)
                .expect("enqueue");
        }
        db.claim_job("job-old", at(1, 0)).expect("claim old");
        db.claim_job("job-new", at(20, 0)).expect("claim new");

        let swept = db
            .fail_stale_running_jobs(at(10, 0), at(25, 0), "stale")
            .expect("sweep");
        assert_eq!(swept, vec!["job-old".to_string()]);

        let statuses = db
            .jobs_for_user("u-1")
            .expect("jobs")
            .into_iter()
            .map(|job| (job.id, job.status))
            .collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![
                ("job-old".to_string(), JobStatus::Failed),
                ("job-new".to_string(), JobStatus::Running),
                ("job-idle".to_string(), JobStatus::Queued),
            ]
        );

        let queued = db.queued_jobs(10).expect("queued");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, "job-idle");
    }
}
