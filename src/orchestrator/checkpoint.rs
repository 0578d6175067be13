//! Durable orchestration progress
//!
//! One row per submission, last write wins. A missing row means a fresh run.
//! No cross-process lock is taken: two orchestrators must never work the same
//! submission id at once.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::core::{Checkpoint, Step, StoreError, SubmissionState};

pub trait CheckpointStore: Send + Sync {
    fn save(&self, state: &SubmissionState) -> Result<(), StoreError>;

    fn load(&self, submission_id: &str) -> Result<Option<SubmissionState>, StoreError> {
        Ok(self.load_checkpoint(submission_id)?.map(|c| c.state))
    }

    fn load_checkpoint(&self, submission_id: &str) -> Result<Option<Checkpoint>, StoreError>;
}

/// SQLite-backed checkpoint table
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store for tests
    pub fn open_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                submission_id TEXT PRIMARY KEY,
                current_step TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_checkpoints_step ON checkpoints(current_step);
            "#,
        )?;
        Ok(())
    }

    /// Ids currently parked at a given step
    pub fn ids_at(&self, step: Step) -> Result<Vec<String>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT submission_id FROM checkpoints WHERE current_step = ?1 ORDER BY updated_at")?;
        let ids = stmt
            .query_map(params![step.as_str()], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn save(&self, state: &SubmissionState) -> Result<(), StoreError> {
        let json = serde_json::to_string(state)?;
        self.conn().execute(
            r#"INSERT INTO checkpoints (submission_id, current_step, state, updated_at)
               VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT(submission_id) DO UPDATE SET
                   current_step = excluded.current_step,
                   state = excluded.state,
                   updated_at = excluded.updated_at"#,
            params![state.submission_id, state.current_step.as_str(), json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn load_checkpoint(&self, submission_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let row: Option<(String, String)> = self
            .conn()
            .query_row(
                "SELECT state, updated_at FROM checkpoints WHERE submission_id = ?1",
                params![submission_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((json, updated_at)) = row else {
            return Ok(None);
        };
        let state: SubmissionState = serde_json::from_str(&json)?;
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(state.updated_at);

        Ok(Some(Checkpoint {
            submission_id: state.submission_id.clone(),
            current_step: state.current_step,
            state,
            updated_at,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::keys;
    use crate::core::request::sample_request;

    #[test]
    fn test_missing_is_fresh_run() {
        let store = SqliteCheckpointStore::open_memory().unwrap();
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn test_round_trip_is_deep_equal() {
        let store = SqliteCheckpointStore::open_memory().unwrap();
        let mut state = SubmissionState::new(sample_request("cp-1"));
        state.advance(Step::PermitType);
        state.set(keys::RECORD_NUMBER, "TMP-0042");
        state.screenshots.push("/tmp/a.png".into());
        state.record_error("flaky overlay");

        store.save(&state).unwrap();
        assert_eq!(store.load("cp-1").unwrap(), Some(state));
    }

    #[test]
    fn test_upsert_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCheckpointStore::open(dir.path().join("db").join("cp.db")).unwrap();
        let mut state = SubmissionState::new(sample_request("cp-2"));
        store.save(&state).unwrap();
        state.advance(Step::PermitType);
        store.save(&state).unwrap();

        let cp = store.load_checkpoint("cp-2").unwrap().unwrap();
        assert_eq!(cp.current_step, Step::PermitType);
        assert_eq!(store.ids_at(Step::PermitType).unwrap(), vec!["cp-2".to_string()]);
        assert!(store.ids_at(Step::StartApplication).unwrap().is_empty());
    }
}
