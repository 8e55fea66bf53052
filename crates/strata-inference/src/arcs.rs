use crate::segmentation::{segment_signals, segment_status};
use crate::InferenceConfig;
use chrono::{DateTime, Utc};
use strata_core::{arc_stable_key, Segment, SegmentStatus, StructuralSignal};
use strata_storage::{ArcUpsert, LinkDiff, StorageError, StructureStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedArc {
    pub id: String,
    pub segment: Segment,
    pub status: SegmentStatus,
    pub created: bool,
    pub links: LinkDiff,
}

pub fn segment_arcs(
    user_id: &str,
    signals: &[StructuralSignal],
    config: &InferenceConfig,
) -> Vec<Segment> {
    segment_signals(signals, config.arc_gap, |start_at| {
        arc_stable_key(user_id, start_at)
    })
}

pub fn arc_status(
    last_signal_at: DateTime<Utc>,
    now: DateTime<Utc>,
    config: &InferenceConfig,
) -> SegmentStatus {
    segment_status(last_signal_at, now, config.arc_active_window)
}

/// Writes each segment as an Arc keyed by its segment key and reconciles the
/// Arc's project links against the segment's projects.
pub fn upsert_arc_segments(
    store: &StructureStore,
    user_id: &str,
    segments: &[Segment],
    config: &InferenceConfig,
    now: DateTime<Utc>,
) -> Result<Vec<PersistedArc>, StorageError> {
    let mut persisted = Vec::with_capacity(segments.len());

    for segment in segments {
        let status = arc_status(segment.last_signal_at, now, config);
        let outcome = store.upsert_arc(
            &ArcUpsert {
                user_id: user_id.to_string(),
                stable_key: segment.segment_key.clone(),
                status,
                scope: segment.scope(),
                start_at: segment.start_at,
                end_at: segment.end_at,
                last_signal_at: segment.last_signal_at,
                decision_count: segment.decision_count,
                result_count: segment.result_count,
            },
            now,
        )?;
        let links = store.reconcile_arc_project_links(&outcome.id, &segment.project_ids, now)?;

        persisted.push(PersistedArc {
            id: outcome.id,
            segment: segment.clone(),
            status,
            created: outcome.created,
            links,
        });
    }

    Ok(persisted)
}
