//! Canonical, hashable description of a user's structure.
//!
//! The payload holds identifiers, status vocabularies, hour/day buckets and
//! rounded densities only. Normalizing twice yields the same value, and the
//! hash of a normalized payload does not depend on insertion order.

use crate::structure_contracts::{
    canonical_payload_hash, round_bucket, sorted_unique, ContractError, PhaseStatus, PulseType,
    SegmentStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Reserved for cross-arc tension detection; always empty today.
pub type TensionEdge = [String; 2];

const REQUIRED_FIELDS: [&str; 13] = [
    "active_arc_ids",
    "active_phase_ids",
    "arc_ids",
    "arc_last_signal_buckets",
    "arc_start_buckets",
    "arc_status",
    "decision_density_bucket",
    "phase_ids",
    "phase_status",
    "pulse_types",
    "result_density_bucket",
    "tension_edges",
    "schema",
];

pub const PAYLOAD_SCHEMA: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StructuralStatePayload {
    pub schema: u32,
    pub arc_ids: Vec<String>,
    pub active_arc_ids: Vec<String>,
    pub phase_ids: Vec<String>,
    pub active_phase_ids: Vec<String>,
    pub arc_status: BTreeMap<String, SegmentStatus>,
    pub phase_status: BTreeMap<String, PhaseStatus>,
    pub arc_last_signal_buckets: BTreeMap<String, String>,
    pub arc_start_buckets: BTreeMap<String, String>,
    pub tension_edges: Vec<TensionEdge>,
    pub decision_density_bucket: f64,
    pub result_density_bucket: f64,
    pub pulse_types: Vec<PulseType>,
}

impl Default for StructuralStatePayload {
    fn default() -> Self {
        Self {
            schema: PAYLOAD_SCHEMA,
            arc_ids: Vec::new(),
            active_arc_ids: Vec::new(),
            phase_ids: Vec::new(),
            active_phase_ids: Vec::new(),
            arc_status: BTreeMap::new(),
            phase_status: BTreeMap::new(),
            arc_last_signal_buckets: BTreeMap::new(),
            arc_start_buckets: BTreeMap::new(),
            tension_edges: Vec::new(),
            decision_density_bucket: 0.0,
            result_density_bucket: 0.0,
            pulse_types: Vec::new(),
        }
    }
}

impl StructuralStatePayload {
    /// Equality over everything except `pulse_types`, which describe the
    /// transition into a state rather than the state itself.
    pub fn same_structure(&self, other: &StructuralStatePayload) -> bool {
        let mut left = self.clone();
        let mut right = other.clone();
        left.pulse_types.clear();
        right.pulse_types.clear();
        left == right
    }
}

pub fn normalize_payload(
    payload: &StructuralStatePayload,
) -> Result<StructuralStatePayload, ContractError> {
    if payload.schema != PAYLOAD_SCHEMA {
        return Err(ContractError::InvalidPayload {
            reason: format!("unsupported payload schema {}", payload.schema),
        });
    }

    let arc_ids = normalize_ids("arc_ids", &payload.arc_ids)?;
    let active_arc_ids = normalize_ids("active_arc_ids", &payload.active_arc_ids)?;
    let phase_ids = normalize_ids("phase_ids", &payload.phase_ids)?;
    let active_phase_ids = normalize_ids("active_phase_ids", &payload.active_phase_ids)?;

    ensure_subset("active_arc_ids", &active_arc_ids, &arc_ids)?;
    ensure_subset("active_phase_ids", &active_phase_ids, &phase_ids)?;

    validate_keys("arc_status", payload.arc_status.keys())?;
    validate_keys("phase_status", payload.phase_status.keys())?;
    validate_keys(
        "arc_last_signal_buckets",
        payload.arc_last_signal_buckets.keys(),
    )?;
    validate_keys("arc_start_buckets", payload.arc_start_buckets.keys())?;
    validate_bucket_values(
        "arc_last_signal_buckets",
        payload.arc_last_signal_buckets.values(),
    )?;
    validate_bucket_values("arc_start_buckets", payload.arc_start_buckets.values())?;

    let mut tension_edges = Vec::with_capacity(payload.tension_edges.len());
    for [left, right] in &payload.tension_edges {
        if left.trim().is_empty() || right.trim().is_empty() {
            return Err(ContractError::EmptyIdentifier {
                field: "tension_edges",
            });
        }
        let mut edge = [left.clone(), right.clone()];
        edge.sort();
        tension_edges.push(edge);
    }
    tension_edges.sort();
    tension_edges.dedup();

    let pulse_types = payload
        .pulse_types
        .iter()
        .copied()
        .collect::<BTreeSet<PulseType>>()
        .into_iter()
        .collect();

    Ok(StructuralStatePayload {
        schema: payload.schema,
        arc_ids,
        active_arc_ids,
        phase_ids,
        active_phase_ids,
        arc_status: payload.arc_status.clone(),
        phase_status: payload.phase_status.clone(),
        arc_last_signal_buckets: payload.arc_last_signal_buckets.clone(),
        arc_start_buckets: payload.arc_start_buckets.clone(),
        tension_edges,
        decision_density_bucket: round_bucket(
            "decision_density_bucket",
            payload.decision_density_bucket,
        )?,
        result_density_bucket: round_bucket(
            "result_density_bucket",
            payload.result_density_bucket,
        )?,
        pulse_types,
    })
}

/// Validates an untyped payload (as read back from storage) field by field
/// before normalizing it.
pub fn normalize_payload_value(value: Value) -> Result<StructuralStatePayload, ContractError> {
    let Value::Object(object) = &value else {
        return Err(ContractError::InvalidPayload {
            reason: "payload must be a JSON object".to_string(),
        });
    };

    for field in REQUIRED_FIELDS {
        match object.get(field) {
            None | Some(Value::Null) => return Err(ContractError::MissingField { field }),
            Some(_) => {}
        }
    }

    for field in ["decision_density_bucket", "result_density_bucket"] {
        if !object.get(field).is_some_and(Value::is_number) {
            return Err(ContractError::InvalidPayload {
                reason: format!("{field} must be a number"),
            });
        }
    }

    let payload: StructuralStatePayload =
        serde_json::from_value(value).map_err(|err| ContractError::InvalidPayload {
            reason: err.to_string(),
        })?;
    normalize_payload(&payload)
}

pub fn compute_state_hash(payload: &StructuralStatePayload) -> Result<String, ContractError> {
    let normalized = normalize_payload(payload)?;
    canonical_payload_hash(&normalized)
}

fn normalize_ids(field: &'static str, ids: &[String]) -> Result<Vec<String>, ContractError> {
    if ids.iter().any(|id| id.trim().is_empty()) {
        return Err(ContractError::EmptyIdentifier { field });
    }
    Ok(sorted_unique(ids.iter().cloned()))
}

fn ensure_subset(
    field: &'static str,
    subset: &[String],
    superset: &[String],
) -> Result<(), ContractError> {
    if let Some(missing) = subset
        .iter()
        .find(|id| superset.binary_search(id).is_err())
    {
        return Err(ContractError::InvalidPayload {
            reason: format!("{field} references unknown id {missing}"),
        });
    }
    Ok(())
}

fn validate_keys<'a>(
    field: &'static str,
    mut keys: impl Iterator<Item = &'a String>,
) -> Result<(), ContractError> {
    if keys.any(|key| key.trim().is_empty()) {
        return Err(ContractError::EmptyIdentifier { field });
    }
    Ok(())
}

fn validate_bucket_values<'a>(
    field: &'static str,
    mut values: impl Iterator<Item = &'a String>,
) -> Result<(), ContractError> {
    if values.any(|value| value.trim().is_empty()) {
        return Err(ContractError::InvalidPayload {
            reason: format!("{field} contains an empty bucket"),
        });
    }
    Ok(())
}
