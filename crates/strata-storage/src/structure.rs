use crate::{invalid_column, ts_column, StorageError, StructureStore};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::collections::BTreeSet;
use strata_core::{deterministic_row_id, format_timestamp, ArcScope, PhaseStatus, SegmentStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArcUpsert {
    pub user_id: String,
    pub stable_key: String,
    pub status: SegmentStatus,
    pub scope: ArcScope,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub last_signal_at: DateTime<Utc>,
    pub decision_count: u32,
    pub result_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArcRecord {
    pub id: String,
    pub user_id: String,
    pub stable_key: String,
    pub status: SegmentStatus,
    pub scope: ArcScope,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub last_signal_at: DateTime<Utc>,
    pub decision_count: u32,
    pub result_count: u32,
    /// Editorial field owned by a separate writer; never set here.
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseUpsert {
    pub arc_id: String,
    pub user_id: String,
    pub stable_key: String,
    pub status: PhaseStatus,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub last_signal_at: DateTime<Utc>,
    pub decision_count: u32,
    pub result_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseRecord {
    pub id: String,
    pub arc_id: String,
    pub user_id: String,
    pub stable_key: String,
    pub phase_index: u32,
    pub status: PhaseStatus,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub last_signal_at: DateTime<Utc>,
    pub decision_count: u32,
    pub result_count: u32,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: String,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArcProjectLink {
    pub arc_id: String,
    pub project_id: String,
    pub last_linked_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LinkDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl LinkDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl StructureStore {
    /// Insert-or-update keyed by `(user_id, stable_key)`. The row id is derived
    /// from the same key, so concurrent writers converge on one row.
    pub fn upsert_arc(
        &self,
        arc: &ArcUpsert,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StorageError> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM arcs WHERE user_id = ?1 AND stable_key = ?2",
                params![arc.user_id, arc.stable_key],
                |row| row.get(0),
            )
            .optional()?;
        let id = existing
            .clone()
            .unwrap_or_else(|| deterministic_row_id("arc", &arc.user_id, &arc.stable_key));
        let now = format_timestamp(now);

        self.conn.execute(
            "
            INSERT INTO arcs (
                id,
                user_id,
                stable_key,
                status,
                scope,
                start_at,
                end_at,
                last_signal_at,
                decision_count,
                result_count,
                summary,
                created_at,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, ?11, ?11)
            ON CONFLICT(user_id, stable_key) DO UPDATE SET
                status=excluded.status,
                scope=excluded.scope,
                start_at=excluded.start_at,
                end_at=excluded.end_at,
                last_signal_at=excluded.last_signal_at,
                decision_count=excluded.decision_count,
                result_count=excluded.result_count,
                stable_key=excluded.stable_key,
                updated_at=excluded.updated_at
            ",
            params![
                id,
                arc.user_id,
                arc.stable_key,
                arc.status.as_str(),
                arc.scope.as_str(),
                format_timestamp(arc.start_at),
                format_timestamp(arc.end_at),
                format_timestamp(arc.last_signal_at),
                i64::from(arc.decision_count),
                i64::from(arc.result_count),
                now,
            ],
        )?;

        Ok(UpsertOutcome {
            id,
            created: existing.is_none(),
        })
    }

    pub fn arc_by_key(
        &self,
        user_id: &str,
        stable_key: &str,
    ) -> Result<Option<ArcRecord>, StorageError> {
        let row = self
            .conn
            .query_row(
                &format!("{ARC_COLUMNS} WHERE user_id = ?1 AND stable_key = ?2"),
                params![user_id, stable_key],
                arc_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn arcs_for_user(&self, user_id: &str) -> Result<Vec<ArcRecord>, StorageError> {
        let mut statement = self.conn.prepare(&format!(
            "{ARC_COLUMNS} WHERE user_id = ?1 ORDER BY start_at ASC, id ASC"
        ))?;
        let rows = statement.query_map([user_id], arc_from_row)?;

        let mut arcs = Vec::new();
        for row in rows {
            arcs.push(row?);
        }
        Ok(arcs)
    }

    pub fn arc_count(&self, user_id: &str) -> Result<i64, StorageError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM arcs WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )?)
    }

    pub fn arc_project_links(&self, arc_id: &str) -> Result<Vec<ArcProjectLink>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT arc_id, project_id, last_linked_at
            FROM arc_project_links
            WHERE arc_id = ?1
            ORDER BY project_id ASC
            ",
        )?;
        let rows = statement.query_map([arc_id], |row| {
            Ok(ArcProjectLink {
                arc_id: row.get(0)?,
                project_id: row.get(1)?,
                last_linked_at: ts_column(row, 2)?,
            })
        })?;

        let mut links = Vec::new();
        for row in rows {
            links.push(row?);
        }
        Ok(links)
    }

    /// Brings the arc's links in line with `project_ids` by inserting only the
    /// additions and deleting only the removals. Unchanged links keep their
    /// `last_linked_at`.
    pub fn reconcile_arc_project_links(
        &self,
        arc_id: &str,
        project_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<LinkDiff, StorageError> {
        let existing = self
            .arc_project_links(arc_id)?
            .into_iter()
            .map(|link| link.project_id)
            .collect::<BTreeSet<String>>();
        let desired = project_ids.iter().cloned().collect::<BTreeSet<String>>();

        let diff = LinkDiff {
            added: desired.difference(&existing).cloned().collect(),
            removed: existing.difference(&desired).cloned().collect(),
        };

        for project_id in &diff.added {
            self.conn.execute(
                "
                INSERT INTO arc_project_links (arc_id, project_id, last_linked_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(arc_id, project_id) DO NOTHING
                ",
                params![arc_id, project_id, format_timestamp(now)],
            )?;
        }

        for project_id in &diff.removed {
            self.conn.execute(
                "DELETE FROM arc_project_links WHERE arc_id = ?1 AND project_id = ?2",
                params![arc_id, project_id],
            )?;
        }

        Ok(diff)
    }

    /// Insert-or-update keyed by `(arc_id, stable_key)`. `phase_index` is
    /// assigned once, on first insert, as one past the arc's current maximum.
    pub fn upsert_phase(
        &self,
        phase: &PhaseUpsert,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StorageError> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM phases WHERE arc_id = ?1 AND stable_key = ?2",
                params![phase.arc_id, phase.stable_key],
                |row| row.get(0),
            )
            .optional()?;
        let id = existing
            .clone()
            .unwrap_or_else(|| deterministic_row_id("phase", &phase.arc_id, &phase.stable_key));
        let now = format_timestamp(now);

        self.conn.execute(
            "
            INSERT INTO phases (
                id,
                arc_id,
                user_id,
                stable_key,
                phase_index,
                status,
                start_at,
                end_at,
                last_signal_at,
                decision_count,
                result_count,
                summary,
                created_at,
                updated_at
            ) VALUES (
                ?1,
                ?2,
                ?3,
                ?4,
                (SELECT COALESCE(MAX(phase_index), 0) + 1 FROM phases WHERE arc_id = ?2),
                ?5,
                ?6,
                ?7,
                ?8,
                ?9,
                ?10,
                NULL,
                ?11,
                ?11
            )
            ON CONFLICT(arc_id, stable_key) DO UPDATE SET
                status=excluded.status,
                start_at=excluded.start_at,
                end_at=excluded.end_at,
                last_signal_at=excluded.last_signal_at,
                decision_count=excluded.decision_count,
                result_count=excluded.result_count,
                stable_key=excluded.stable_key,
                updated_at=excluded.updated_at
            ",
            params![
                id,
                phase.arc_id,
                phase.user_id,
                phase.stable_key,
                phase.status.as_str(),
                format_timestamp(phase.start_at),
                format_timestamp(phase.end_at),
                format_timestamp(phase.last_signal_at),
                i64::from(phase.decision_count),
                i64::from(phase.result_count),
                now,
            ],
        )?;

        Ok(UpsertOutcome {
            id,
            created: existing.is_none(),
        })
    }

    pub fn phases_for_arc(&self, arc_id: &str) -> Result<Vec<PhaseRecord>, StorageError> {
        let mut statement = self.conn.prepare(&format!(
            "{PHASE_COLUMNS} WHERE arc_id = ?1 ORDER BY phase_index ASC, id ASC"
        ))?;
        let rows = statement.query_map([arc_id], phase_from_row)?;

        let mut phases = Vec::new();
        for row in rows {
            phases.push(row?);
        }
        Ok(phases)
    }

    pub fn phase_count(&self, user_id: &str) -> Result<i64, StorageError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM phases WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )?)
    }

    /// Re-derives the status of every persisted Arc and Phase of the user from
    /// its `last_signal_at`, including rows whose key no longer comes out of
    /// segmentation. Rows last signalled at or after the cutoff are active.
    /// Returns how many rows changed.
    pub fn refresh_statuses(
        &self,
        user_id: &str,
        arc_active_since: DateTime<Utc>,
        phase_active_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let now = format_timestamp(now);
        let arcs = self.conn.execute(
            "
            UPDATE arcs
            SET status = CASE WHEN last_signal_at >= ?2 THEN ?3 ELSE ?4 END,
                updated_at = ?5
            WHERE user_id = ?1
              AND status <> CASE WHEN last_signal_at >= ?2 THEN ?3 ELSE ?4 END
            ",
            params![
                user_id,
                format_timestamp(arc_active_since),
                SegmentStatus::Active.as_str(),
                SegmentStatus::Compressed.as_str(),
                now,
            ],
        )?;
        let phases = self.conn.execute(
            "
            UPDATE phases
            SET status = CASE WHEN last_signal_at >= ?2 THEN ?3 ELSE ?4 END,
                updated_at = ?5
            WHERE user_id = ?1
              AND status <> CASE WHEN last_signal_at >= ?2 THEN ?3 ELSE ?4 END
            ",
            params![
                user_id,
                format_timestamp(phase_active_since),
                PhaseStatus::Active.as_str(),
                PhaseStatus::Dormant.as_str(),
                now,
            ],
        )?;
        Ok(arcs + phases)
    }
}

const ARC_COLUMNS: &str = "
    SELECT id, user_id, stable_key, status, scope, start_at, end_at, last_signal_at,
           decision_count, result_count, summary, created_at, updated_at
    FROM arcs";

const PHASE_COLUMNS: &str = "
    SELECT id, arc_id, user_id, stable_key, phase_index, status, start_at, end_at,
           last_signal_at, decision_count, result_count, summary, created_at, updated_at
    FROM phases";

fn arc_from_row(row: &Row<'_>) -> rusqlite::Result<ArcRecord> {
    let status_raw: String = row.get(3)?;
    let status = SegmentStatus::parse(&status_raw)
        .ok_or_else(|| invalid_column(3, format!("unknown arc status: {status_raw}")))?;
    let scope_raw: String = row.get(4)?;
    let scope = ArcScope::parse(&scope_raw)
        .ok_or_else(|| invalid_column(4, format!("unknown arc scope: {scope_raw}")))?;

    Ok(ArcRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        stable_key: row.get(2)?,
        status,
        scope,
        start_at: ts_column(row, 5)?,
        end_at: ts_column(row, 6)?,
        last_signal_at: ts_column(row, 7)?,
        decision_count: row.get::<_, i64>(8)? as u32,
        result_count: row.get::<_, i64>(9)? as u32,
        summary: row.get(10)?,
        created_at: ts_column(row, 11)?,
        updated_at: ts_column(row, 12)?,
    })
}

fn phase_from_row(row: &Row<'_>) -> rusqlite::Result<PhaseRecord> {
    let status_raw: String = row.get(5)?;
    let status = PhaseStatus::parse(&status_raw)
        .ok_or_else(|| invalid_column(5, format!("unknown phase status: {status_raw}")))?;

    Ok(PhaseRecord {
        id: row.get(0)?,
        arc_id: row.get(1)?,
        user_id: row.get(2)?,
        stable_key: row.get(3)?,
        phase_index: row.get::<_, i64>(4)? as u32,
        status,
        start_at: ts_column(row, 6)?,
        end_at: ts_column(row, 7)?,
        last_signal_at: ts_column(row, 8)?,
        decision_count: row.get::<_, i64>(9)? as u32,
        result_count: row.get::<_, i64>(10)? as u32,
        summary: row.get(11)?,
        created_at: ts_column(row, 12)?,
        updated_at: ts_column(row, 13)?,
    })
}
