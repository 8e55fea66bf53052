//! SQLite persistence for the structural engine.
//!
//! `StructureStore` is the privileged storage client: it reads the upstream
//! source tables without per-request authorization and owns every write to
//! the structure tables. It is handed to the job processor, never to
//! request-scoped code.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use std::path::Path;
use strata_core::{parse_timestamp, ContractError};
use thiserror::Error;

mod jobs;
mod snapshots;
mod source;
mod structure;

pub use jobs::{NewStructureJob, StructureJob};
pub use snapshots::{PulseRecord, SnapshotRecord, SnapshotWrite};
pub use source::{ConversationRow, DecisionRow, ProjectRow, ResultRow};
pub use structure::{
    ArcProjectLink, ArcRecord, ArcUpsert, LinkDiff, PhaseRecord, PhaseUpsert, UpsertOutcome,
};

pub const STRUCTURE_SCHEMA_VERSION: i64 = 2;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("invalid value in {column}: {value}")]
    InvalidValue { column: &'static str, value: String },
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

pub struct StructureStore {
    conn: Connection,
}

impl StructureStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let mut current = self.schema_version()?;
        if current > STRUCTURE_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: STRUCTURE_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_structural_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
            current = 1;
        }

        if current < 2 {
            let sql = include_str!("../migrations/0002_structure_jobs.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 2", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Runs `work` inside a savepoint. Everything it wrote is rolled back when
    /// it returns an error. Savepoints nest, so callers may already be inside
    /// one.
    pub fn atomically<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<StorageError>,
    {
        self.conn
            .execute_batch("SAVEPOINT strata_atomic")
            .map_err(|err| E::from(StorageError::from(err)))?;

        match work(self) {
            Ok(value) => {
                self.conn
                    .execute_batch("RELEASE strata_atomic")
                    .map_err(|err| E::from(StorageError::from(err)))?;
                Ok(value)
            }
            Err(err) => {
                // A failed rollback leaves the connection in an unknown
                // state; surface the original error regardless.
                let _ = self
                    .conn
                    .execute_batch("ROLLBACK TO strata_atomic; RELEASE strata_atomic");
                Err(err)
            }
        }
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

fn conversion_failure(
    index: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
}

fn invalid_column(index: usize, message: String) -> rusqlite::Error {
    conversion_failure(
        index,
        std::io::Error::new(std::io::ErrorKind::InvalidData, message),
    )
}

fn ts_column(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    parse_timestamp(&raw).map_err(|err| conversion_failure(index, err))
}

fn opt_ts_column(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(index)?
        .map(|raw| parse_timestamp(&raw).map_err(|err| conversion_failure(index, err)))
        .transpose()
}
