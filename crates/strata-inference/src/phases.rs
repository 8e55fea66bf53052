use crate::segmentation::{segment_signals, segment_status};
use crate::InferenceConfig;
use chrono::{DateTime, Utc};
use strata_core::{phase_stable_key, PhaseStatus, Segment, StructuralSignal};
use strata_storage::{PhaseUpsert, StorageError, StructureStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedPhase {
    pub id: String,
    pub arc_id: String,
    pub segment: Segment,
    pub status: PhaseStatus,
    pub created: bool,
}

/// Segments the signals that belong to `arc` into Phases. Membership is
/// decided by the Arc's window and recorded signal ids, not by position in
/// `signals`.
pub fn segment_phases(
    user_id: &str,
    arc_id: &str,
    arc: &Segment,
    signals: &[StructuralSignal],
    config: &InferenceConfig,
) -> Vec<Segment> {
    let members = signals
        .iter()
        .filter(|signal| arc.contains(signal))
        .cloned()
        .collect::<Vec<_>>();

    segment_signals(&members, config.phase_gap, |start_at| {
        phase_stable_key(user_id, arc_id, start_at)
    })
}

pub fn phase_status(
    last_signal_at: DateTime<Utc>,
    now: DateTime<Utc>,
    config: &InferenceConfig,
) -> PhaseStatus {
    PhaseStatus::from(segment_status(
        last_signal_at,
        now,
        config.phase_active_window,
    ))
}

pub fn upsert_phase_segments(
    store: &StructureStore,
    user_id: &str,
    arc_id: &str,
    segments: &[Segment],
    config: &InferenceConfig,
    now: DateTime<Utc>,
) -> Result<Vec<PersistedPhase>, StorageError> {
    let mut persisted = Vec::with_capacity(segments.len());

    for segment in segments {
        let status = phase_status(segment.last_signal_at, now, config);
        let outcome = store.upsert_phase(
            &PhaseUpsert {
                arc_id: arc_id.to_string(),
                user_id: user_id.to_string(),
                stable_key: segment.segment_key.clone(),
                status,
                start_at: segment.start_at,
                end_at: segment.end_at,
                last_signal_at: segment.last_signal_at,
                decision_count: segment.decision_count,
                result_count: segment.result_count,
            },
            now,
        )?;

        persisted.push(PersistedPhase {
            id: outcome.id,
            arc_id: arc_id.to_string(),
            segment: segment.clone(),
            status,
            created: outcome.created,
        });
    }

    Ok(persisted)
}
