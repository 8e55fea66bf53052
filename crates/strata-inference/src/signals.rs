//! Signal collection from the upstream source tables.
//!
//! Every active decision and result becomes exactly one signal placed at its
//! thinking time. Rows that cannot be placed fail the run instead of being
//! dropped, since a missing signal silently changes structure.

use crate::SignalError;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use strata_core::{SignalKind, StructuralSignal};
use strata_storage::{ConversationRow, StructureStore};

pub fn collect_signals(
    store: &StructureStore,
    user_id: &str,
) -> Result<Vec<StructuralSignal>, SignalError> {
    let mut conversations = ConversationCache::new(store);
    let mut signals = Vec::new();

    for decision in store.active_decisions_for_user(user_id)? {
        let occurred_at = conversations.thinking_time(
            SignalKind::Decision,
            &decision.id,
            decision.conversation_id.as_deref(),
            decision.decided_at,
        )?;
        signals.push(StructuralSignal::new(
            user_id,
            SignalKind::Decision,
            occurred_at,
            decision.project_id,
            Some(decision.id),
        ));
    }

    for result in store.active_results_for_user(user_id)? {
        let parent_project = match result.decision_id.as_deref() {
            Some(decision_id) => {
                let parent = store.decision(decision_id)?.ok_or_else(|| {
                    SignalError::UnjoinableParent {
                        kind: SignalKind::Result,
                        source_id: result.id.clone(),
                        parent: format!("decision {decision_id}"),
                    }
                })?;
                parent.project_id
            }
            None => None,
        };
        let occurred_at = conversations.thinking_time(
            SignalKind::Result,
            &result.id,
            result.conversation_id.as_deref(),
            result.recorded_at,
        )?;
        signals.push(StructuralSignal::new(
            user_id,
            SignalKind::Result,
            occurred_at,
            result.project_id.or(parent_project),
            Some(result.id),
        ));
    }

    for project in store.reactivated_projects_for_user(user_id)? {
        if let Some(reactivated_at) = project.reactivated_at {
            signals.push(StructuralSignal::new(
                user_id,
                SignalKind::ProjectReactivated,
                reactivated_at,
                Some(project.id.clone()),
                Some(project.id),
            ));
        }
    }

    Ok(signals)
}

/// Total order: time, then kind, then id. Stable and deterministic.
pub fn sort_signals(signals: &mut [StructuralSignal]) {
    signals.sort_by(|left, right| {
        left.occurred_at
            .cmp(&right.occurred_at)
            .then_with(|| left.kind.as_str().cmp(right.kind.as_str()))
            .then_with(|| left.id.cmp(&right.id))
    });
}

/// Midpoint of the thinking window, or whichever bound is known.
pub fn window_midpoint(
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (started_at, ended_at) {
        (Some(start), Some(end)) => Some(start + (end - start) / 2),
        (Some(bound), None) | (None, Some(bound)) => Some(bound),
        (None, None) => None,
    }
}

struct ConversationCache<'a> {
    store: &'a StructureStore,
    loaded: BTreeMap<String, Option<ConversationRow>>,
}

impl<'a> ConversationCache<'a> {
    fn new(store: &'a StructureStore) -> Self {
        Self {
            store,
            loaded: BTreeMap::new(),
        }
    }

    fn thinking_time(
        &mut self,
        kind: SignalKind,
        source_id: &str,
        conversation_id: Option<&str>,
        fallback: Option<DateTime<Utc>>,
    ) -> Result<DateTime<Utc>, SignalError> {
        let window = match conversation_id {
            Some(conversation_id) => {
                let conversation = self.get(conversation_id)?.ok_or_else(|| {
                    SignalError::UnjoinableParent {
                        kind,
                        source_id: source_id.to_string(),
                        parent: format!("conversation {conversation_id}"),
                    }
                })?;
                window_midpoint(
                    conversation.thinking_started_at,
                    conversation.thinking_ended_at,
                )
            }
            None => None,
        };

        window
            .or(fallback)
            .ok_or_else(|| SignalError::MissingThinkingTime {
                kind,
                source_id: source_id.to_string(),
            })
    }

    fn get(&mut self, conversation_id: &str) -> Result<Option<&ConversationRow>, SignalError> {
        if !self.loaded.contains_key(conversation_id) {
            let row = self.store.conversation(conversation_id)?;
            self.loaded.insert(conversation_id.to_string(), row);
        }
        Ok(self
            .loaded
            .get(conversation_id)
            .and_then(|row| row.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use strata_storage::{DecisionRow, ProjectRow, ResultRow};

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn decision(
        id: &str,
        conversation: Option<&str>,
        decided_at: Option<DateTime<Utc>>,
    ) -> DecisionRow {
        DecisionRow {
            id: id.to_string(),
            user_id: "u-1".to_string(),
            conversation_id: conversation.map(str::to_string),
            project_id: Some("p-1".to_string()),
            active: true,
            decided_at,
        }
    }

    fn conversation(
        id: &str,
        started: Option<DateTime<Utc>>,
        ended: Option<DateTime<Utc>>,
    ) -> ConversationRow {
        ConversationRow {
            id: id.to_string(),
            user_id: "u-1".to_string(),
            thinking_started_at: started,
            thinking_ended_at: ended,
        }
    }

    #[test]
    fn decision_is_placed_at_the_window_midpoint() {
        let store = StructureStore::open_in_memory().expect("open db");
        store
            .upsert_conversation(&conversation("c-1", Some(ts(2, 8)), Some(ts(2, 12))))
            .expect("conversation");
        store
            .upsert_decision(&decision("d-1", Some("c-1"), Some(ts(9, 0))))
            .expect("decision");

        let signals = collect_signals(&store, "u-1").expect("collect");
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].occurred_at, ts(2, 10));
        assert_eq!(signals[0].kind, SignalKind::Decision);
        assert_eq!(signals[0].source_id.as_deref(), Some("d-1"));
    }

    #[test]
    fn single_bound_and_row_timestamp_are_fallbacks() {
        let store = StructureStore::open_in_memory().expect("open db");
        store
            .upsert_conversation(&conversation("c-open", Some(ts(3, 7)), None))
            .expect("open window");
        store
            .upsert_conversation(&conversation("c-empty", None, None))
            .expect("empty window");
        store
            .upsert_decision(&decision("d-open", Some("c-open"), None))
            .expect("d-open");
        store
            .upsert_decision(&decision("d-empty", Some("c-empty"), Some(ts(4, 9))))
            .expect("d-empty");
        store
            .upsert_decision(&decision("d-bare", None, Some(ts(5, 6))))
            .expect("d-bare");

        let mut signals = collect_signals(&store, "u-1").expect("collect");
        sort_signals(&mut signals);
        let placed = signals
            .iter()
            .map(|signal| (signal.source_id.clone().unwrap_or_default(), signal.occurred_at))
            .collect::<Vec<_>>();
        assert_eq!(
            placed,
            vec![
                ("d-open".to_string(), ts(3, 7)),
                ("d-empty".to_string(), ts(4, 9)),
                ("d-bare".to_string(), ts(5, 6)),
            ]
        );
    }

    #[test]
    fn unplaceable_decision_fails_loudly() {
        let store = StructureStore::open_in_memory().expect("open db");
        store
            .upsert_decision(&decision("d-lost", None, None))
            .expect("decision");

        let err = collect_signals(&store, "u-1").expect_err("must fail");
        match err {
            SignalError::MissingThinkingTime { kind, source_id } => {
                assert_eq!(kind, SignalKind::Decision);
                assert_eq!(source_id, "d-lost");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_conversation_is_unjoinable() {
        let store = StructureStore::open_in_memory().expect("open db");
        store
            .upsert_decision(&decision("d-1", Some("c-gone"), Some(ts(1, 0))))
            .expect("decision");

        assert!(matches!(
            collect_signals(&store, "u-1"),
            Err(SignalError::UnjoinableParent { .. })
        ));
    }

    #[test]
    fn result_inherits_parent_project_and_reactivations_are_signals() {
        let store = StructureStore::open_in_memory().expect("open db");
        store
            .upsert_decision(&decision("d-1", None, Some(ts(1, 0))))
            .expect("decision");
        store
            .upsert_result(&ResultRow {
                id: "r-1".to_string(),
                user_id: "u-1".to_string(),
                conversation_id: None,
                decision_id: Some("d-1".to_string()),
                project_id: None,
                active: true,
                recorded_at: Some(ts(2, 0)),
            })
            .expect("result");
        store
            .upsert_project(&ProjectRow {
                id: "p-9".to_string(),
                user_id: "u-1".to_string(),
                name: "revived".to_string(),
                reactivated_at: Some(ts(6, 0)),
            })
            .expect("project");

        let mut signals = collect_signals(&store, "u-1").expect("collect");
        sort_signals(&mut signals);
        assert_eq!(signals.len(), 3);
        assert_eq!(signals[1].kind, SignalKind::Result);
        assert_eq!(signals[1].project_id.as_deref(), Some("p-1"));
        assert_eq!(signals[2].kind, SignalKind::ProjectReactivated);
        assert_eq!(signals[2].project_id.as_deref(), Some("p-9"));
    }

    #[test]
    fn sort_breaks_time_ties_by_kind_then_id() {
        let at = ts(10, 12);
        let mut signals = vec![
            StructuralSignal::new("u-1", SignalKind::Result, at, None, Some("r-1".to_string())),
            StructuralSignal::new("u-1", SignalKind::Decision, at, None, Some("d-2".to_string())),
            StructuralSignal::new(
                "u-1",
                SignalKind::Decision,
                at - Duration::minutes(1),
                None,
                Some("d-0".to_string()),
            ),
            StructuralSignal::new("u-1", SignalKind::Decision, at, None, Some("d-1".to_string())),
        ];
        let mut reversed = signals.clone();
        reversed.reverse();

        sort_signals(&mut signals);
        sort_signals(&mut reversed);
        assert_eq!(signals, reversed);
        assert_eq!(signals[0].source_id.as_deref(), Some("d-0"));
        assert_eq!(signals[3].kind, SignalKind::Result);
        assert!(signals[1].id < signals[2].id);
    }
}
