//! Payload assembly, shift detection and the hash-gated snapshot write.

use crate::arcs::PersistedArc;
use crate::density::DensityBuckets;
use crate::phases::PersistedPhase;
use crate::InferenceError;
use chrono::{DateTime, Utc};
use strata_core::{
    compute_state_hash, day_bucket, hour_bucket, normalize_payload, ContractError, PhaseStatus,
    PulseType, StructuralStatePayload,
};
use strata_storage::{SnapshotWrite, StructureStore};

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotOutcome {
    pub state_hash: String,
    pub snapshot_id: Option<String>,
    pub pulses: Vec<PulseType>,
}

/// Builds the un-normalized payload for this run's Arcs and Phases.
/// `pulse_types` is left empty; see [`with_transition`].
pub fn build_payload(
    arcs: &[PersistedArc],
    phases: &[PersistedPhase],
    density: &DensityBuckets,
) -> StructuralStatePayload {
    let mut payload = StructuralStatePayload {
        decision_density_bucket: density.decision_density_bucket,
        result_density_bucket: density.result_density_bucket,
        ..StructuralStatePayload::default()
    };

    for arc in arcs {
        payload.arc_ids.push(arc.id.clone());
        if arc.status.is_active() {
            payload.active_arc_ids.push(arc.id.clone());
        }
        payload.arc_status.insert(arc.id.clone(), arc.status);
        payload
            .arc_last_signal_buckets
            .insert(arc.id.clone(), hour_bucket(arc.segment.last_signal_at));
        payload
            .arc_start_buckets
            .insert(arc.id.clone(), day_bucket(arc.segment.start_at));
    }

    for phase in phases {
        payload.phase_ids.push(phase.id.clone());
        if phase.status == PhaseStatus::Active {
            payload.active_phase_ids.push(phase.id.clone());
        }
        payload.phase_status.insert(phase.id.clone(), phase.status);
    }

    payload
}

/// The two closed pulse rules: active Arc membership changed, or either
/// density bucket changed. Both payloads must be normalized.
pub fn detect_shifts(
    previous: &StructuralStatePayload,
    current: &StructuralStatePayload,
) -> Vec<PulseType> {
    let mut shifts = Vec::new();
    if previous.active_arc_ids != current.active_arc_ids {
        shifts.push(PulseType::ArcShift);
    }
    if previous.decision_density_bucket != current.decision_density_bucket
        || previous.result_density_bucket != current.result_density_bucket
    {
        shifts.push(PulseType::StructuralThreshold);
    }
    shifts
}

/// Pulses for the transition into `current`. The first snapshot emits none.
pub fn generate_pulses(
    previous: Option<&StructuralStatePayload>,
    current: &StructuralStatePayload,
) -> Vec<PulseType> {
    previous
        .map(|previous| detect_shifts(previous, current))
        .unwrap_or_default()
}

/// Normalizes `payload` and records the pulses of the transition from
/// `previous` in it. An unchanged structure keeps the previous `pulse_types`,
/// so its hash matches the stored one.
pub fn with_transition(
    previous: Option<&StructuralStatePayload>,
    payload: StructuralStatePayload,
) -> Result<StructuralStatePayload, ContractError> {
    let mut current = normalize_payload(&payload)?;
    current.pulse_types = match previous {
        Some(previous) if previous.same_structure(&current) => previous.pulse_types.clone(),
        _ => generate_pulses(previous, &current),
    };
    normalize_payload(&current)
}

/// Loads the latest snapshot, applies the transition, and writes a new
/// snapshot with its pulses only when the state hash moved.
pub fn persist_snapshot(
    store: &StructureStore,
    user_id: &str,
    scope: &str,
    payload: StructuralStatePayload,
    now: DateTime<Utc>,
) -> Result<SnapshotOutcome, InferenceError> {
    let previous = store.latest_snapshot(user_id, scope)?;
    let previous_payload = previous.as_ref().map(|snapshot| &snapshot.payload);
    let current = with_transition(previous_payload, payload)?;
    let state_hash = compute_state_hash(&current)?;

    if previous
        .as_ref()
        .is_some_and(|snapshot| snapshot.state_hash == state_hash)
    {
        return Ok(SnapshotOutcome {
            state_hash,
            snapshot_id: None,
            pulses: Vec::new(),
        });
    }

    let written = store.write_snapshot_if_changed(&SnapshotWrite {
        user_id: user_id.to_string(),
        scope: scope.to_string(),
        payload: current.clone(),
        generated_at: now,
    })?;

    Ok(match written {
        Some(record) => SnapshotOutcome {
            state_hash: record.state_hash,
            snapshot_id: Some(record.id),
            pulses: current.pulse_types,
        },
        // Another writer stored the same hash first.
        None => SnapshotOutcome {
            state_hash,
            snapshot_id: None,
            pulses: Vec::new(),
        },
    })
}
