//! Upstream decision/result/conversation/project rows.
//!
//! The engine only reads these. The writers exist for the ingestion
//! collaborator and for fixtures.

use crate::{opt_ts_column, StorageError, StructureStore};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use strata_core::format_timestamp;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub reactivated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRow {
    pub id: String,
    pub user_id: String,
    pub thinking_started_at: Option<DateTime<Utc>>,
    pub thinking_ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionRow {
    pub id: String,
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub project_id: Option<String>,
    pub active: bool,
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRow {
    pub id: String,
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub decision_id: Option<String>,
    pub project_id: Option<String>,
    pub active: bool,
    pub recorded_at: Option<DateTime<Utc>>,
}

impl StructureStore {
    pub fn upsert_project(&self, project: &ProjectRow) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO projects (id, user_id, name, reactivated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                user_id=excluded.user_id,
                name=excluded.name,
                reactivated_at=excluded.reactivated_at
            ",
            params![
                project.id,
                project.user_id,
                project.name,
                project.reactivated_at.map(format_timestamp),
            ],
        )?;
        Ok(())
    }

    pub fn upsert_conversation(&self, conversation: &ConversationRow) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO conversations (id, user_id, thinking_started_at, thinking_ended_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                user_id=excluded.user_id,
                thinking_started_at=excluded.thinking_started_at,
                thinking_ended_at=excluded.thinking_ended_at
            ",
            params![
                conversation.id,
                conversation.user_id,
                conversation.thinking_started_at.map(format_timestamp),
                conversation.thinking_ended_at.map(format_timestamp),
            ],
        )?;
        Ok(())
    }

    pub fn upsert_decision(&self, decision: &DecisionRow) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO decisions (id, user_id, conversation_id, project_id, active, decided_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                user_id=excluded.user_id,
                conversation_id=excluded.conversation_id,
                project_id=excluded.project_id,
                active=excluded.active,
                decided_at=excluded.decided_at
            ",
            params![
                decision.id,
                decision.user_id,
                decision.conversation_id,
                decision.project_id,
                decision.active,
                decision.decided_at.map(format_timestamp),
            ],
        )?;
        Ok(())
    }

    pub fn upsert_result(&self, result: &ResultRow) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO results (
                id,
                user_id,
                conversation_id,
                decision_id,
                project_id,
                active,
                recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                user_id=excluded.user_id,
                conversation_id=excluded.conversation_id,
                decision_id=excluded.decision_id,
                project_id=excluded.project_id,
                active=excluded.active,
                recorded_at=excluded.recorded_at
            ",
            params![
                result.id,
                result.user_id,
                result.conversation_id,
                result.decision_id,
                result.project_id,
                result.active,
                result.recorded_at.map(format_timestamp),
            ],
        )?;
        Ok(())
    }

    pub fn project(&self, project_id: &str) -> Result<Option<ProjectRow>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, user_id, name, reactivated_at FROM projects WHERE id = ?1",
                [project_id],
                project_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn reactivated_projects_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<ProjectRow>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT id, user_id, name, reactivated_at
            FROM projects
            WHERE user_id = ?1 AND reactivated_at IS NOT NULL
            ORDER BY id ASC
            ",
        )?;
        let rows = statement.query_map([user_id], project_from_row)?;

        let mut projects = Vec::new();
        for row in rows {
            projects.push(row?);
        }
        Ok(projects)
    }

    pub fn conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationRow>, StorageError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT id, user_id, thinking_started_at, thinking_ended_at
                FROM conversations
                WHERE id = ?1
                ",
                [conversation_id],
                |row| {
                    Ok(ConversationRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        thinking_started_at: opt_ts_column(row, 2)?,
                        thinking_ended_at: opt_ts_column(row, 3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn decision(&self, decision_id: &str) -> Result<Option<DecisionRow>, StorageError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT id, user_id, conversation_id, project_id, active, decided_at
                FROM decisions
                WHERE id = ?1
                ",
                [decision_id],
                decision_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn active_decisions_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<DecisionRow>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT id, user_id, conversation_id, project_id, active, decided_at
            FROM decisions
            WHERE user_id = ?1 AND active = 1
            ORDER BY id ASC
            ",
        )?;
        let rows = statement.query_map([user_id], decision_from_row)?;

        let mut decisions = Vec::new();
        for row in rows {
            decisions.push(row?);
        }
        Ok(decisions)
    }

    pub fn active_results_for_user(&self, user_id: &str) -> Result<Vec<ResultRow>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT id, user_id, conversation_id, decision_id, project_id, active, recorded_at
            FROM results
            WHERE user_id = ?1 AND active = 1
            ORDER BY id ASC
            ",
        )?;
        let rows = statement.query_map([user_id], |row| {
            Ok(ResultRow {
                id: row.get(0)?,
                user_id: row.get(1)?,
                conversation_id: row.get(2)?,
                decision_id: row.get(3)?,
                project_id: row.get(4)?,
                active: row.get(5)?,
                recorded_at: opt_ts_column(row, 6)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Users with at least one active decision or result, for backfills.
    pub fn users_with_sources(&self) -> Result<Vec<String>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT user_id FROM decisions WHERE active = 1
            UNION
            SELECT user_id FROM results WHERE active = 1
            ORDER BY 1 ASC
            ",
        )?;
        let rows = statement.query_map([], |row| row.get::<_, String>(0))?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<ProjectRow> {
    Ok(ProjectRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        reactivated_at: opt_ts_column(row, 3)?,
    })
}

fn decision_from_row(row: &Row<'_>) -> rusqlite::Result<DecisionRow> {
    Ok(DecisionRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        conversation_id: row.get(2)?,
        project_id: row.get(3)?,
        active: row.get(4)?,
        decided_at: opt_ts_column(row, 5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, day, 14, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn active_decisions_exclude_inactive_rows_and_other_users() {
        let db = StructureStore::open_in_memory().expect("open db");
        for (id, user, active) in [("d-1", "u-1", true), ("d-2", "u-1", false), ("d-3", "u-2", true)]
        {
            db.upsert_decision(&DecisionRow {
                id: id.to_string(),
                user_id: user.to_string(),
                conversation_id: None,
                project_id: Some("p-1".to_string()),
                active,
                decided_at: Some(ts(3)),
            })
            .expect("insert decision");
        }

        let decisions = db.active_decisions_for_user("u-1").expect("decisions");
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].id, "d-1");
        assert_eq!(decisions[0].decided_at, Some(ts(3)));
        assert_eq!(
            db.users_with_sources().expect("users"),
            vec!["u-1".to_string(), "u-2".to_string()]
        );
    }

    #[test]
    fn conversation_roundtrip_preserves_optional_bounds() {
        let db = StructureStore::open_in_memory().expect("open db");
        db.upsert_conversation(&ConversationRow {
            id: "c-1".to_string(),
            user_id: "u-1".to_string(),
            thinking_started_at: Some(ts(1)),
            thinking_ended_at: None,
        })
        .expect("insert conversation");

        let loaded = db
            .conversation("c-1")
            .expect("query")
            .expect("conversation exists");
        assert_eq!(loaded.thinking_started_at, Some(ts(1)));
        assert_eq!(loaded.thinking_ended_at, None);
        assert!(db.conversation("c-missing").expect("query").is_none());
    }

    #[test]
    fn results_and_reactivated_projects_are_listed_per_user() {
        let db = StructureStore::open_in_memory().expect("open db");
        db.upsert_result(&ResultRow {
            id: "r-1".to_string(),
            user_id: "u-1".to_string(),
            conversation_id: Some("c-1".to_string()),
            decision_id: Some("d-1".to_string()),
            project_id: None,
            active: true,
            recorded_at: None,
        })
        .expect("insert result");
        db.upsert_project(&ProjectRow {
            id: "p-quiet".to_string(),
            user_id: "u-1".to_string(),
            name: "quiet".to_string(),
            reactivated_at: None,
        })
        .expect("insert quiet project");
        db.upsert_project(&ProjectRow {
            id: "p-back".to_string(),
            user_id: "u-1".to_string(),
            name: "back".to_string(),
            reactivated_at: Some(ts(9)),
        })
        .expect("insert reactivated project");

        let results = db.active_results_for_user("u-1").expect("results");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].decision_id.as_deref(), Some("d-1"));

        let projects = db.reactivated_projects_for_user("u-1").expect("projects");
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].id, "p-back");
        assert_eq!(projects[0].reactivated_at, Some(ts(9)));
    }
}
