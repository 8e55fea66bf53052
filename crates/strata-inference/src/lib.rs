//! Structural inference: signals in, Arcs/Phases/Snapshot/Pulses out.
//!
//! `StructureInferenceEngine::run` executes the whole pipeline for one user
//! inside a single savepoint. Re-running it on unchanged input writes no new
//! rows and reproduces the same state hash.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use strata_core::{
    ContractError, PulseType, SignalKind, ARC_ACTIVE_DAYS, ARC_GAP_DAYS, PHASE_ACTIVE_DAYS,
    PHASE_GAP_DAYS,
};
use strata_storage::{StorageError, StructureStore};
use thiserror::Error;

pub mod arcs;
pub mod density;
pub mod phases;
pub mod projection;
pub mod segmentation;
pub mod signals;
pub mod snapshot;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("cannot place {kind} {source_id} in time: no thinking window and no fallback timestamp")]
    MissingThinkingTime { kind: SignalKind, source_id: String },
    #[error("{kind} {source_id} references missing {parent}")]
    UnjoinableParent {
        kind: SignalKind,
        source_id: String,
        parent: String,
    },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("signal collection failed: {0}")]
    Signal(#[from] SignalError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceConfig {
    pub arc_gap: Duration,
    pub arc_active_window: Duration,
    pub phase_gap: Duration,
    pub phase_active_window: Duration,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            arc_gap: Duration::days(ARC_GAP_DAYS),
            arc_active_window: Duration::days(ARC_ACTIVE_DAYS),
            phase_gap: Duration::days(PHASE_GAP_DAYS),
            phase_active_window: Duration::days(PHASE_ACTIVE_DAYS),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct InferenceReport {
    pub user_id: String,
    pub scope: String,
    pub signals: usize,
    pub arcs: usize,
    pub arcs_created: usize,
    pub phases: usize,
    pub phases_created: usize,
    pub links_added: usize,
    pub links_removed: usize,
    /// Persisted rows whose status flipped on this run, including Arcs and
    /// Phases that segmentation no longer produces.
    pub statuses_refreshed: usize,
    pub state_hash: String,
    pub snapshot_id: Option<String>,
    pub pulses: Vec<PulseType>,
}

impl InferenceReport {
    pub fn snapshot_written(&self) -> bool {
        self.snapshot_id.is_some()
    }
}

pub struct StructureInferenceEngine {
    config: InferenceConfig,
}

impl StructureInferenceEngine {
    pub fn new(config: InferenceConfig) -> Self {
        Self { config }
    }

    /// Collect, segment, upsert, hash and, when the hash moved, snapshot.
    /// Any error rolls back every structural write made by this call.
    pub fn run(
        &self,
        store: &StructureStore,
        user_id: &str,
        scope: &str,
        now: DateTime<Utc>,
    ) -> Result<InferenceReport, InferenceError> {
        store.atomically(|store| self.run_in_place(store, user_id, scope, now))
    }

    fn run_in_place(
        &self,
        store: &StructureStore,
        user_id: &str,
        scope: &str,
        now: DateTime<Utc>,
    ) -> Result<InferenceReport, InferenceError> {
        let mut collected = signals::collect_signals(store, user_id)?;
        signals::sort_signals(&mut collected);

        let arc_segments = arcs::segment_arcs(user_id, &collected, &self.config);
        let persisted_arcs =
            arcs::upsert_arc_segments(store, user_id, &arc_segments, &self.config, now)?;

        let mut persisted_phases = Vec::new();
        for arc in &persisted_arcs {
            let phase_segments =
                phases::segment_phases(user_id, &arc.id, &arc.segment, &collected, &self.config);
            persisted_phases.extend(phases::upsert_phase_segments(
                store,
                user_id,
                &arc.id,
                &phase_segments,
                &self.config,
                now,
            )?);
        }

        let statuses_refreshed = store.refresh_statuses(
            user_id,
            now - self.config.arc_active_window,
            now - self.config.phase_active_window,
            now,
        )?;

        let density = density::compute_density(&arc_segments)?;
        let payload = snapshot::build_payload(&persisted_arcs, &persisted_phases, &density);
        let outcome = snapshot::persist_snapshot(store, user_id, scope, payload, now)?;

        Ok(InferenceReport {
            user_id: user_id.to_string(),
            scope: scope.to_string(),
            signals: collected.len(),
            arcs: persisted_arcs.len(),
            arcs_created: persisted_arcs.iter().filter(|arc| arc.created).count(),
            phases: persisted_phases.len(),
            phases_created: persisted_phases.iter().filter(|phase| phase.created).count(),
            links_added: persisted_arcs.iter().map(|arc| arc.links.added.len()).sum(),
            links_removed: persisted_arcs.iter().map(|arc| arc.links.removed.len()).sum(),
            statuses_refreshed,
            state_hash: outcome.state_hash,
            snapshot_id: outcome.snapshot_id,
            pulses: outcome.pulses,
        })
    }
}
