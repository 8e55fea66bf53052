use crate::{JobConfig, JobError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use strata_core::{default_debounce_key, RecomputeReason, DEFAULT_SCOPE, STRUCTURE_JOB_TYPE};
use strata_storage::{NewStructureJob, StructureStore};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecomputeRequest {
    pub user_id: String,
    pub scope: String,
    pub reason: RecomputeReason,
    /// Defaults to `"{scope}:{reason}"`.
    pub debounce_key: Option<String>,
}

impl RecomputeRequest {
    pub fn new(user_id: impl Into<String>, reason: RecomputeReason) -> Self {
        Self {
            user_id: user_id.into(),
            scope: DEFAULT_SCOPE.to_string(),
            reason,
            debounce_key: None,
        }
    }

    pub fn debounce_key(&self) -> String {
        self.debounce_key
            .clone()
            .unwrap_or_else(|| default_debounce_key(&self.scope, self.reason))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Enqueued {
        job_id: String,
    },
    /// Not an error. `existing_job_id` is `None` only when the job that
    /// blocked the insert finished before it could be looked up.
    Debounced {
        existing_job_id: Option<String>,
    },
}

impl DispatchOutcome {
    pub fn is_enqueued(&self) -> bool {
        matches!(self, DispatchOutcome::Enqueued { .. })
    }
}

/// Enqueues a recompute unless an in-flight job with the same user and
/// debounce key was queued within the debounce window.
pub fn dispatch_structure_recompute(
    store: &StructureStore,
    request: &RecomputeRequest,
    config: &JobConfig,
    now: DateTime<Utc>,
) -> Result<DispatchOutcome, JobError> {
    let debounce_key = request.debounce_key();
    let cutoff = now - config.debounce_window;
    let job = NewStructureJob {
        id: Uuid::new_v4().to_string(),
        user_id: request.user_id.clone(),
        scope: request.scope.clone(),
        job_type: STRUCTURE_JOB_TYPE.to_string(),
        payload: json!({ "reason": request.reason.as_str() }),
        debounce_key: debounce_key.clone(),
        queued_at: now,
    };

    if store.enqueue_job_if_not_debounced(&job, cutoff)? {
        info!(
            event = "structure_job_enqueued",
            job_id = %job.id,
            user_id = %job.user_id,
            scope = %job.scope,
            debounce_key = %debounce_key
        );
        return Ok(DispatchOutcome::Enqueued { job_id: job.id });
    }

    let existing_job_id = store
        .in_flight_job(&request.user_id, &debounce_key, cutoff)?
        .map(|existing| existing.id);
    debug!(
        event = "structure_job_debounced",
        user_id = %request.user_id,
        debounce_key = %debounce_key,
        existing_job_id = existing_job_id.as_deref().unwrap_or("none")
    );
    Ok(DispatchOutcome::Debounced { existing_job_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use strata_core::JobStatus;

    fn at(second: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 1, 9, 0, 0)
            .single()
            .expect("valid timestamp")
            + Duration::seconds(second)
    }

    #[test]
    fn second_dispatch_within_window_is_debounced() {
        let store = StructureStore::open_in_memory().expect("open db");
        let config = JobConfig::default();
        let request = RecomputeRequest::new("u-1", RecomputeReason::Ingestion);

        let first = dispatch_structure_recompute(&store, &request, &config, at(0))
            .expect("first dispatch");
        let job_id = match first {
            DispatchOutcome::Enqueued { job_id } => job_id,
            other => panic!("expected enqueue, got {other:?}"),
        };

        let second = dispatch_structure_recompute(&store, &request, &config, at(59))
            .expect("second dispatch");
        assert_eq!(
            second,
            DispatchOutcome::Debounced {
                existing_job_id: Some(job_id.clone())
            }
        );

        let job = store
            .structure_job(&job_id)
            .expect("load")
            .expect("job exists");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.debounce_key, "user:ingestion");
        assert_eq!(job.job_type, STRUCTURE_JOB_TYPE);
        assert_eq!(job.payload, json!({ "reason": "ingestion" }));
    }

    #[test]
    fn different_reasons_do_not_debounce_each_other() {
        let store = StructureStore::open_in_memory().expect("open db");
        let config = JobConfig::default();

        let ingestion = RecomputeRequest::new("u-1", RecomputeReason::Ingestion);
        let manual = RecomputeRequest::new("u-1", RecomputeReason::Manual);
        assert!(dispatch_structure_recompute(&store, &ingestion, &config, at(0))
            .expect("ingestion")
            .is_enqueued());
        assert!(dispatch_structure_recompute(&store, &manual, &config, at(1))
            .expect("manual")
            .is_enqueued());

        let mut custom = RecomputeRequest::new("u-1", RecomputeReason::Manual);
        custom.debounce_key = Some("user:ingestion".to_string());
        assert!(!dispatch_structure_recompute(&store, &custom, &config, at(2))
            .expect("custom key")
            .is_enqueued());
    }

    #[test]
    fn queued_job_older_than_the_window_no_longer_debounces() {
        let store = StructureStore::open_in_memory().expect("open db");
        let config = JobConfig::default();
        let request = RecomputeRequest::new("u-1", RecomputeReason::DecisionChange);

        dispatch_structure_recompute(&store, &request, &config, at(0)).expect("first");
        let late = dispatch_structure_recompute(&store, &request, &config, at(61))
            .expect("late dispatch");
        assert!(late.is_enqueued());
        assert_eq!(store.jobs_for_user("u-1").expect("jobs").len(), 2);
    }
}
