use crate::{
    conversion_failure, invalid_column, opt_ts_column, ts_column, StorageError, StructureStore,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use strata_core::{
    canonical_json, compute_state_hash, format_timestamp, normalize_payload,
    normalize_payload_value, sha256_hex, PulseType, StructuralStatePayload,
};
use uuid::Uuid;

/// Tie-break shared by the engine and every read loader: rows without a
/// `generated_at` sort last, then newest first, then insertion order.
const LATEST_ORDER: &str = "generated_at IS NULL ASC, generated_at DESC, seq DESC";

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotWrite {
    pub user_id: String,
    pub scope: String,
    pub payload: StructuralStatePayload,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    pub seq: i64,
    pub id: String,
    pub user_id: String,
    pub scope: String,
    pub state_hash: String,
    pub payload: StructuralStatePayload,
    pub generated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulseRecord {
    pub id: String,
    pub snapshot_id: String,
    pub user_id: String,
    pub scope: String,
    pub pulse_type: PulseType,
    pub state_hash: String,
    pub occurred_at: DateTime<Utc>,
    pub headline: Option<String>,
}

impl StructureStore {
    /// Appends a snapshot unless the latest one for `(user_id, scope)` already
    /// carries the same hash. Pulses named in the payload's `pulse_types` are
    /// written with it in the same savepoint.
    ///
    /// Returns the new row, or `None` when the write was gated by the hash.
    pub fn write_snapshot_if_changed(
        &self,
        write: &SnapshotWrite,
    ) -> Result<Option<SnapshotRecord>, StorageError> {
        let payload = normalize_payload(&write.payload)?;
        let state_hash = compute_state_hash(&payload)?;
        let payload_json = canonical_json(&payload)?;
        let snapshot_id = format!("snap_{}", Uuid::new_v4().simple());
        let generated_at = format_timestamp(write.generated_at);

        self.atomically(|store| {
            let inserted = store.conn.execute(
                &format!(
                    "
                    INSERT INTO snapshot_state (
                        id,
                        user_id,
                        scope,
                        state_hash,
                        state_payload_json,
                        generated_at
                    )
                    SELECT ?1, ?2, ?3, ?4, ?5, ?6
                    WHERE NOT EXISTS (
                        SELECT 1
                        FROM (
                            SELECT state_hash
                            FROM snapshot_state
                            WHERE user_id = ?2 AND scope = ?3
                            ORDER BY {LATEST_ORDER}
                            LIMIT 1
                        ) latest
                        WHERE latest.state_hash = ?4
                    )
                    "
                ),
                params![
                    snapshot_id,
                    write.user_id,
                    write.scope,
                    state_hash,
                    payload_json,
                    generated_at,
                ],
            )?;
            if inserted == 0 {
                return Ok(None);
            }
            let seq = store.conn.last_insert_rowid();

            for pulse_type in &payload.pulse_types {
                store.conn.execute(
                    "
                    INSERT INTO pulses (
                        id,
                        snapshot_id,
                        user_id,
                        scope,
                        pulse_type,
                        state_hash,
                        occurred_at,
                        headline
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)
                    ",
                    params![
                        pulse_id(&snapshot_id, *pulse_type),
                        snapshot_id,
                        write.user_id,
                        write.scope,
                        pulse_type.as_str(),
                        state_hash,
                        generated_at,
                    ],
                )?;
            }

            Ok(Some(SnapshotRecord {
                seq,
                id: snapshot_id.clone(),
                user_id: write.user_id.clone(),
                scope: write.scope.clone(),
                state_hash: state_hash.clone(),
                payload: payload.clone(),
                generated_at: Some(write.generated_at),
            }))
        })
    }

    pub fn latest_snapshot(
        &self,
        user_id: &str,
        scope: &str,
    ) -> Result<Option<SnapshotRecord>, StorageError> {
        Ok(self.latest_snapshots(user_id, scope, 1)?.into_iter().next())
    }

    /// Newest-first, using the same ordering as the hash gate.
    pub fn latest_snapshots(
        &self,
        user_id: &str,
        scope: &str,
        limit: usize,
    ) -> Result<Vec<SnapshotRecord>, StorageError> {
        let mut statement = self.conn.prepare(&format!(
            "
            SELECT seq, id, user_id, scope, state_hash, state_payload_json, generated_at
            FROM snapshot_state
            WHERE user_id = ?1 AND scope = ?2
            ORDER BY {LATEST_ORDER}
            LIMIT ?3
            "
        ))?;
        let rows = statement.query_map(
            params![user_id, scope, limit as i64],
            snapshot_from_row,
        )?;

        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(row?);
        }
        Ok(snapshots)
    }

    pub fn snapshot_count(&self, user_id: &str, scope: &str) -> Result<i64, StorageError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM snapshot_state WHERE user_id = ?1 AND scope = ?2",
            params![user_id, scope],
            |row| row.get(0),
        )?)
    }

    pub fn pulses_for_user(
        &self,
        user_id: &str,
        scope: &str,
    ) -> Result<Vec<PulseRecord>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT id, snapshot_id, user_id, scope, pulse_type, state_hash, occurred_at, headline
            FROM pulses
            WHERE user_id = ?1 AND scope = ?2
            ORDER BY occurred_at ASC, pulse_type ASC, id ASC
            ",
        )?;
        let rows = statement.query_map(params![user_id, scope], |row| {
            let pulse_raw: String = row.get(4)?;
            let pulse_type = PulseType::parse(&pulse_raw)
                .ok_or_else(|| invalid_column(4, format!("unknown pulse type: {pulse_raw}")))?;
            Ok(PulseRecord {
                id: row.get(0)?,
                snapshot_id: row.get(1)?,
                user_id: row.get(2)?,
                scope: row.get(3)?,
                pulse_type,
                state_hash: row.get(5)?,
                occurred_at: ts_column(row, 6)?,
                headline: row.get(7)?,
            })
        })?;

        let mut pulses = Vec::new();
        for row in rows {
            pulses.push(row?);
        }
        Ok(pulses)
    }
}

fn pulse_id(snapshot_id: &str, pulse_type: PulseType) -> String {
    let digest = sha256_hex(format!("{snapshot_id}|{}", pulse_type.as_str()).as_bytes());
    format!("pulse_{}", &digest[..32])
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<SnapshotRecord> {
    let raw_payload: String = row.get(5)?;
    let value: serde_json::Value =
        serde_json::from_str(&raw_payload).map_err(|err| conversion_failure(5, err))?;
    let payload = normalize_payload_value(value).map_err(|err| conversion_failure(5, err))?;

    Ok(SnapshotRecord {
        seq: row.get(0)?,
        id: row.get(1)?,
        user_id: row.get(2)?,
        scope: row.get(3)?,
        state_hash: row.get(4)?,
        payload,
        generated_at: opt_ts_column(row, 6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use strata_core::SegmentStatus;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, day, 9, 30, 0)
            .single()
            .expect("valid timestamp")
    }

    fn payload(arc_ids: &[&str], pulse_types: Vec<PulseType>) -> StructuralStatePayload {
        let mut payload = StructuralStatePayload::default();
        for id in arc_ids {
            payload.arc_ids.push((*id).to_string());
            payload.active_arc_ids.push((*id).to_string());
            payload
                .arc_status
                .insert((*id).to_string(), SegmentStatus::Active);
        }
        payload.decision_density_bucket = 0.25;
        payload.pulse_types = pulse_types;
        payload
    }

    fn write(payload: StructuralStatePayload, at: DateTime<Utc>) -> SnapshotWrite {
        SnapshotWrite {
            user_id: "u-1".to_string(),
            scope: "user".to_string(),
            payload,
            generated_at: at,
        }
    }

    #[test]
    fn identical_hash_is_not_written_twice() {
        let db = StructureStore::open_in_memory().expect("open db");

        let first = db
            .write_snapshot_if_changed(&write(payload(&["arc_a"], Vec::new()), ts(1)))
            .expect("first write");
        assert!(first.is_some());

        let second = db
            .write_snapshot_if_changed(&write(payload(&["arc_a"], Vec::new()), ts(2)))
            .expect("second write");
        assert!(second.is_none());
        assert_eq!(db.snapshot_count("u-1", "user").expect("count"), 1);
    }

    #[test]
    fn pulses_are_written_with_their_snapshot() {
        let db = StructureStore::open_in_memory().expect("open db");
        db.write_snapshot_if_changed(&write(payload(&["arc_a"], Vec::new()), ts(1)))
            .expect("baseline");

        let written = db
            .write_snapshot_if_changed(&write(
                payload(
                    &["arc_a", "arc_b"],
                    vec![PulseType::StructuralThreshold, PulseType::ArcShift],
                ),
                ts(3),
            ))
            .expect("changed write")
            .expect("row written");

        let pulses = db.pulses_for_user("u-1", "user").expect("pulses");
        assert_eq!(pulses.len(), 2);
        assert_eq!(pulses[0].pulse_type, PulseType::ArcShift);
        assert_eq!(pulses[1].pulse_type, PulseType::StructuralThreshold);
        for pulse in &pulses {
            assert_eq!(pulse.snapshot_id, written.id);
            assert_eq!(pulse.state_hash, written.state_hash);
            assert_eq!(pulse.occurred_at, ts(3));
            assert_eq!(pulse.headline, None);
        }
    }

    #[test]
    fn stored_payload_reads_back_normalized() {
        let db = StructureStore::open_in_memory().expect("open db");
        let written = db
            .write_snapshot_if_changed(&write(
                payload(&["arc_z", "arc_a", "arc_z"], Vec::new()),
                ts(1),
            ))
            .expect("write")
            .expect("row written");

        let latest = db
            .latest_snapshot("u-1", "user")
            .expect("load")
            .expect("snapshot exists");
        assert_eq!(latest.id, written.id);
        assert_eq!(latest.payload.arc_ids, vec!["arc_a".to_string(), "arc_z".to_string()]);
        assert_eq!(
            compute_state_hash(&latest.payload).expect("hash"),
            latest.state_hash
        );
    }

    #[test]
    fn loader_orders_null_generated_at_last_and_breaks_ties_by_seq() {
        let db = StructureStore::open_in_memory().expect("open db");
        let insert = |id: &str, hash: &str, generated_at: Option<&str>| {
            let json = canonical_json(&payload(&["arc_a"], Vec::new())).expect("json");
            db.conn
                .execute(
                    "
                    INSERT INTO snapshot_state (id, user_id, scope, state_hash, state_payload_json, generated_at)
                    VALUES (?1, 'u-1', 'user', ?2, ?3, ?4)
                    ",
                    params![id, hash, json, generated_at],
                )
                .expect("insert snapshot");
        };
        let same_instant = format_timestamp(ts(5));
        insert("snap_null", "h0", None);
        insert("snap_old", "h1", Some(format_timestamp(ts(1)).as_str()));
        insert("snap_tie_a", "h2", Some(same_instant.as_str()));
        insert("snap_tie_b", "h3", Some(same_instant.as_str()));

        let ordered = db
            .latest_snapshots("u-1", "user", 10)
            .expect("load")
            .into_iter()
            .map(|snapshot| snapshot.id)
            .collect::<Vec<_>>();
        assert_eq!(
            ordered,
            vec!["snap_tie_b", "snap_tie_a", "snap_old", "snap_null"]
        );

        let latest_two = db.latest_snapshots("u-1", "user", 2).expect("load two");
        assert_eq!(latest_two.len(), 2);
        assert_eq!(latest_two[0].state_hash, "h3");
    }
}
