//! Gap-based segmentation shared by Arcs and Phases.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use strata_core::{exceeds_gap, Segment, SegmentStatus, SignalKind, StructuralSignal};

/// Splits sorted `signals` wherever the distance from the running segment's
/// last signal to the next one is strictly greater than `gap`.
///
/// `key_for` derives the segment key from its start instant.
pub fn segment_signals<F>(signals: &[StructuralSignal], gap: Duration, key_for: F) -> Vec<Segment>
where
    F: Fn(DateTime<Utc>) -> String,
{
    let mut segments = Vec::new();
    let mut current: Option<SegmentBuilder> = None;

    for signal in signals {
        match current.as_mut() {
            Some(builder) if !exceeds_gap(builder.last_signal_at, signal.occurred_at, gap) => {
                builder.push(signal);
            }
            _ => {
                if let Some(builder) = current.take() {
                    segments.push(builder.finish(&key_for));
                }
                current = Some(SegmentBuilder::start(signal));
            }
        }
    }

    if let Some(builder) = current {
        segments.push(builder.finish(&key_for));
    }
    segments
}

/// `active` while `now - last_signal_at <= active_window`.
pub fn segment_status(
    last_signal_at: DateTime<Utc>,
    now: DateTime<Utc>,
    active_window: Duration,
) -> SegmentStatus {
    if now - last_signal_at <= active_window {
        SegmentStatus::Active
    } else {
        SegmentStatus::Compressed
    }
}

struct SegmentBuilder {
    start_at: DateTime<Utc>,
    last_signal_at: DateTime<Utc>,
    project_ids: BTreeSet<String>,
    decision_count: u32,
    result_count: u32,
    signal_ids: BTreeSet<String>,
}

impl SegmentBuilder {
    fn start(signal: &StructuralSignal) -> Self {
        let mut builder = Self {
            start_at: signal.occurred_at,
            last_signal_at: signal.occurred_at,
            project_ids: BTreeSet::new(),
            decision_count: 0,
            result_count: 0,
            signal_ids: BTreeSet::new(),
        };
        builder.push(signal);
        builder
    }

    fn push(&mut self, signal: &StructuralSignal) {
        if signal.occurred_at > self.last_signal_at {
            self.last_signal_at = signal.occurred_at;
        }
        match signal.kind {
            SignalKind::Decision => self.decision_count += 1,
            SignalKind::Result => self.result_count += 1,
            SignalKind::ProjectReactivated => {}
        }
        if let Some(project_id) = &signal.project_id {
            self.project_ids.insert(project_id.clone());
        }
        self.signal_ids.insert(signal.id.clone());
    }

    fn finish<F>(self, key_for: &F) -> Segment
    where
        F: Fn(DateTime<Utc>) -> String,
    {
        Segment {
            segment_key: key_for(self.start_at),
            start_at: self.start_at,
            end_at: self.last_signal_at,
            last_signal_at: self.last_signal_at,
            project_ids: self.project_ids.into_iter().collect(),
            decision_count: self.decision_count,
            result_count: self.result_count,
            signal_ids: self.signal_ids.into_iter().collect(),
        }
    }
}
