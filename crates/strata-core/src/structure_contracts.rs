use chrono::{DateTime, Duration, SecondsFormat, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use thiserror::Error;

pub const DEFAULT_SCOPE: &str = "user";
pub const STRUCTURE_JOB_TYPE: &str = "structure_recompute";
pub const ARC_GAP_DAYS: i64 = 14;
pub const ARC_ACTIVE_DAYS: i64 = 45;
pub const PHASE_GAP_DAYS: i64 = 7;
pub const PHASE_ACTIVE_DAYS: i64 = 21;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("non-finite numeric value for {field}: {value}")]
    NonFinite { field: &'static str, value: f64 },
    #[error("payload field missing: {field}")]
    MissingField { field: &'static str },
    #[error("empty identifier in {field}")]
    EmptyIdentifier { field: &'static str },
    #[error("invalid structural payload: {reason}")]
    InvalidPayload { reason: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Decision,
    ProjectReactivated,
    Result,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Decision => "decision",
            SignalKind::ProjectReactivated => "project_reactivated",
            SignalKind::Result => "result",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "decision" => Some(SignalKind::Decision),
            "project_reactivated" => Some(SignalKind::ProjectReactivated),
            "result" => Some(SignalKind::Result),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Editorial-free fact derived from a source row. Rebuilt on every run, never
/// stored on its own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StructuralSignal {
    pub id: String,
    pub user_id: String,
    pub kind: SignalKind,
    pub occurred_at: DateTime<Utc>,
    pub project_id: Option<String>,
    pub source_id: Option<String>,
}

impl StructuralSignal {
    pub fn new(
        user_id: impl Into<String>,
        kind: SignalKind,
        occurred_at: DateTime<Utc>,
        project_id: Option<String>,
        source_id: Option<String>,
    ) -> Self {
        let id = signal_id(
            kind,
            source_id.as_deref(),
            occurred_at,
            project_id.as_deref(),
        );
        Self {
            id,
            user_id: user_id.into(),
            kind,
            occurred_at,
            project_id,
            source_id,
        }
    }
}

pub fn signal_id(
    kind: SignalKind,
    source_id: Option<&str>,
    occurred_at: DateTime<Utc>,
    project_id: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(source_id.unwrap_or_default().as_bytes());
    hasher.update(b"|");
    hasher.update(format_timestamp(occurred_at).as_bytes());
    hasher.update(b"|");
    hasher.update(project_id.unwrap_or_default().as_bytes());
    hex_digest(hasher)
}

/// Contiguous run of signals with no gap larger than the segmenter's
/// threshold. Used for both Arcs and Phases before persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub segment_key: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub last_signal_at: DateTime<Utc>,
    pub project_ids: Vec<String>,
    pub decision_count: u32,
    pub result_count: u32,
    pub signal_ids: Vec<String>,
}

impl Segment {
    pub fn scope(&self) -> ArcScope {
        ArcScope::from_project_count(self.project_ids.len())
    }

    pub fn contains(&self, signal: &StructuralSignal) -> bool {
        signal.occurred_at >= self.start_at
            && signal.occurred_at <= self.end_at
            && self.signal_ids.binary_search(&signal.id).is_ok()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    Active,
    Compressed,
}

impl SegmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SegmentStatus::Active => "active",
            SegmentStatus::Compressed => "compressed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SegmentStatus::Active),
            "compressed" => Some(SegmentStatus::Compressed),
            _ => None,
        }
    }

    pub fn is_active(self) -> bool {
        self == SegmentStatus::Active
    }
}

/// Persisted phase vocabulary. Internally a phase is `compressed` like an
/// arc; the phase table calls that state `dormant`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Active,
    Dormant,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Active => "active",
            PhaseStatus::Dormant => "dormant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(PhaseStatus::Active),
            "dormant" => Some(PhaseStatus::Dormant),
            _ => None,
        }
    }
}

impl From<SegmentStatus> for PhaseStatus {
    fn from(status: SegmentStatus) -> Self {
        match status {
            SegmentStatus::Active => PhaseStatus::Active,
            SegmentStatus::Compressed => PhaseStatus::Dormant,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArcScope {
    Personal,
    ProjectSpanning,
}

impl ArcScope {
    pub fn from_project_count(count: usize) -> Self {
        if count > 1 {
            ArcScope::ProjectSpanning
        } else {
            ArcScope::Personal
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ArcScope::Personal => "personal",
            ArcScope::ProjectSpanning => "project_spanning",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "personal" => Some(ArcScope::Personal),
            "project_spanning" => Some(ArcScope::ProjectSpanning),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PulseType {
    ArcShift,
    StructuralThreshold,
}

impl PulseType {
    pub fn as_str(self) -> &'static str {
        match self {
            PulseType::ArcShift => "arc_shift",
            PulseType::StructuralThreshold => "structural_threshold",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "arc_shift" => Some(PulseType::ArcShift),
            "structural_threshold" => Some(PulseType::StructuralThreshold),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Transitions are one-way: `queued -> running -> succeeded | failed`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecomputeReason {
    Ingestion,
    DecisionChange,
    Manual,
    Backfill,
}

impl RecomputeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RecomputeReason::Ingestion => "ingestion",
            RecomputeReason::DecisionChange => "decision_change",
            RecomputeReason::Manual => "manual",
            RecomputeReason::Backfill => "backfill",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ingestion" => Some(RecomputeReason::Ingestion),
            "decision_change" => Some(RecomputeReason::DecisionChange),
            "manual" => Some(RecomputeReason::Manual),
            "backfill" => Some(RecomputeReason::Backfill),
            _ => None,
        }
    }
}

impl std::str::FromStr for RecomputeReason {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value.trim()).ok_or_else(|| format!("unknown recompute reason: {value}"))
    }
}

pub fn default_debounce_key(scope: &str, reason: RecomputeReason) -> String {
    format!("{scope}:{}", reason.as_str())
}

/// RFC 3339, UTC, millisecond precision. Lexical order of the output equals
/// chronological order, which the SQL window comparisons rely on.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|ts| ts.with_timezone(&Utc))
}

pub fn day_bucket(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}

pub fn hour_bucket(ts: DateTime<Utc>) -> String {
    format!("{}T{:02}:00Z", day_bucket(ts), ts.hour())
}

/// Fractional number of days from `start` to `end`.
pub fn span_days(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / MILLIS_PER_DAY
}

pub fn exceeds_gap(previous: DateTime<Utc>, next: DateTime<Utc>, gap: Duration) -> bool {
    next - previous > gap
}

/// Two-decimal bucket shared by density and payload normalization.
pub fn round_bucket(field: &'static str, value: f64) -> Result<f64, ContractError> {
    if !value.is_finite() {
        return Err(ContractError::NonFinite { field, value });
    }
    let rounded = (value * 100.0).round() / 100.0;
    // -0.0 and 0.0 must serialize identically.
    if rounded == 0.0 {
        return Ok(0.0);
    }
    Ok(rounded)
}

pub fn sorted_unique<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    values
        .into_iter()
        .map(Into::into)
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_digest(hasher)
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let json =
        serde_json::to_value(value).map_err(|err| ContractError::Serialization(err.to_string()))?;
    let canonical = canonicalize_value(json);
    serde_json::to_string(&canonical).map_err(|err| ContractError::Serialization(err.to_string()))
}

pub fn canonical_payload_hash<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let rendered = canonical_json(value)?;
    Ok(sha256_hex(rendered.as_bytes()))
}

pub fn canonicalize_value(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries: Vec<(String, Value)> = object.into_iter().collect();
            entries.sort_by(|left, right| left.0.cmp(&right.0));

            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize_value(value));
            }
            Value::Object(sorted)
        }
        Value::Array(values) => Value::Array(values.into_iter().map(canonicalize_value).collect()),
        scalar => scalar,
    }
}

pub fn arc_stable_key(user_id: &str, start_at: DateTime<Utc>) -> String {
    sha256_hex(format!("{user_id}:{}", day_bucket(start_at)).as_bytes())
}

pub fn phase_stable_key(user_id: &str, arc_id: &str, start_at: DateTime<Utc>) -> String {
    sha256_hex(format!("{user_id}:{arc_id}:{}", day_bucket(start_at)).as_bytes())
}

/// Row identity derived from the stable key, so concurrent writers agree on
/// the id without a find-or-create round trip.
pub fn deterministic_row_id(prefix: &str, owner_id: &str, stable_key: &str) -> String {
    let digest = sha256_hex(format!("{owner_id}|{stable_key}").as_bytes());
    format!("{prefix}_{}", &digest[..32])
}
