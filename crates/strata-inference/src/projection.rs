//! Read-only views of stored payloads for external consumers.

use crate::snapshot::generate_pulses;
use serde::Serialize;
use strata_core::{PulseType, StructuralStatePayload};
use strata_storage::{StorageError, StructureStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Direction {
    pub active_containers: usize,
    pub active_direction_units: usize,
    pub density_level: f64,
    /// Latest hour bucket across all Arcs.
    pub last_structural_change_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Shifts {
    pub shifted: bool,
    pub shift_types: Vec<PulseType>,
}

pub fn project_direction(payload: &StructuralStatePayload) -> Direction {
    Direction {
        active_containers: payload.active_arc_ids.len(),
        active_direction_units: payload.active_phase_ids.len(),
        density_level: payload.decision_density_bucket,
        last_structural_change_at: payload.arc_last_signal_buckets.values().max().cloned(),
    }
}

/// Same rules as pulse generation, so a shift is reported exactly when a
/// pulse would be emitted.
pub fn project_shifts(
    previous: Option<&StructuralStatePayload>,
    current: &StructuralStatePayload,
) -> Shifts {
    let shift_types = generate_pulses(previous, current);
    Shifts {
        shifted: !shift_types.is_empty(),
        shift_types,
    }
}

pub fn load_direction(
    store: &StructureStore,
    user_id: &str,
    scope: &str,
) -> Result<Option<Direction>, StorageError> {
    Ok(store
        .latest_snapshot(user_id, scope)?
        .map(|snapshot| project_direction(&snapshot.payload)))
}

/// Shifts between the two latest snapshots; `None` before the first one.
pub fn load_shifts(
    store: &StructureStore,
    user_id: &str,
    scope: &str,
) -> Result<Option<Shifts>, StorageError> {
    let mut latest = store.latest_snapshots(user_id, scope, 2)?.into_iter();
    let Some(current) = latest.next() else {
        return Ok(None);
    };
    let previous = latest.next();
    Ok(Some(project_shifts(
        previous.as_ref().map(|snapshot| &snapshot.payload),
        &current.payload,
    )))
}
