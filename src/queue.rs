//! Submission queue - SQLite backend
//!
//! The caller-side work list. The orchestrator never reads it; the batch
//! runner takes pending rows, runs them and writes the outcome back.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::core::{Outcome, StoreError, SubmissionRequest, SubmissionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    AwaitingPayment,
    PaymentReceived,
    Submitted,
    Failed,
    ManualReview,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::AwaitingPayment => "awaiting_payment",
            QueueStatus::PaymentReceived => "payment_received",
            QueueStatus::Submitted => "submitted",
            QueueStatus::Failed => "failed",
            QueueStatus::ManualReview => "manual_review",
        }
    }

    fn parse(s: &str) -> QueueStatus {
        match s {
            "awaiting_payment" => QueueStatus::AwaitingPayment,
            "payment_received" => QueueStatus::PaymentReceived,
            "submitted" => QueueStatus::Submitted,
            "failed" => QueueStatus::Failed,
            "manual_review" => QueueStatus::ManualReview,
            _ => QueueStatus::Queued,
        }
    }

    /// Statuses the batch runner picks up
    pub fn is_pending(&self) -> bool {
        matches!(self, QueueStatus::Queued | QueueStatus::PaymentReceived | QueueStatus::Failed)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub request: SubmissionRequest,
    pub status: QueueStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub error_kind: Option<String>,
    pub permit_number: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct SubmissionQueue {
    conn: Mutex<Connection>,
}

impl SubmissionQueue {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let queue = Self { conn: Mutex::new(Connection::open(path)?) };
        queue.init_schema()?;
        Ok(queue)
    }

    pub fn open_memory() -> Result<Self, StoreError> {
        let queue = Self { conn: Mutex::new(Connection::open_in_memory()?) };
        queue.init_schema()?;
        Ok(queue)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS submissions (
                id TEXT PRIMARY KEY,
                request TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                error_kind TEXT,
                permit_number TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_submissions_status ON submissions(status);
            "#,
        )?;
        Ok(())
    }

    /// Add a request; a blank id gets a fresh UUID. Returns the id and
    /// whether a new row was written (existing ids are left alone).
    pub fn enqueue(&self, request: SubmissionRequest) -> Result<(String, bool), StoreError> {
        let request = request.with_generated_id();
        let json = serde_json::to_string(&request)?;
        let now = Utc::now().to_rfc3339();
        let inserted = self.conn().execute(
            r#"INSERT INTO submissions (id, request, status, attempts, created_at, updated_at)
               VALUES (?1, ?2, 'queued', 0, ?3, ?3)
               ON CONFLICT(id) DO NOTHING"#,
            params![request.submission_id, json, now],
        )?;
        Ok((request.submission_id, inserted > 0))
    }

    /// Oldest pending items first. Failed rows count only while they are
    /// under `max_attempts`.
    pub fn pending(&self, limit: usize, max_attempts: u32) -> Result<Vec<QueueItem>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"SELECT id, request, status, attempts, last_error, error_kind, permit_number, created_at, updated_at
               FROM submissions
               WHERE status IN ('queued', 'payment_received')
                  OR (status = 'failed' AND attempts < ?2)
               ORDER BY created_at, id
               LIMIT ?1"#,
        )?;
        let items = stmt
            .query_map(params![limit as i64, max_attempts], raw_row)?
            .map(|r| r.map_err(StoreError::from).and_then(RawItem::into_item))
            .collect::<Result<Vec<_>, _>>();
        items
    }

    pub fn get(&self, id: &str) -> Result<Option<QueueItem>, StoreError> {
        let raw = self
            .conn()
            .query_row(
                r#"SELECT id, request, status, attempts, last_error, error_kind, permit_number, created_at, updated_at
                   FROM submissions WHERE id = ?1"#,
                params![id],
                raw_row,
            )
            .optional()?;
        raw.map(RawItem::into_item).transpose()
    }

    /// Bump the attempt counter; returns the new count
    pub fn record_attempt(&self, id: &str) -> Result<u32, StoreError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE submissions SET attempts = attempts + 1, updated_at = ?2 WHERE id = ?1",
            params![id, Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let attempts: i64 = conn.query_row("SELECT attempts FROM submissions WHERE id = ?1", params![id], |r| r.get(0))?;
        Ok(attempts as u32)
    }

    pub fn set_status(&self, id: &str, status: QueueStatus, error: Option<&str>) -> Result<(), StoreError> {
        let changed = self.conn().execute(
            "UPDATE submissions SET status = ?2, last_error = COALESCE(?3, last_error), updated_at = ?4 WHERE id = ?1",
            params![id, status.as_str(), error, Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Write a run's result back to the row
    /// Map a run's outcome onto the row. Reaching the payment pause resets
    /// the attempt counter: the post-payment run gets its own budget.
    pub fn record_outcome(&self, result: &SubmissionResult) -> Result<QueueStatus, StoreError> {
        let status = match result.outcome {
            Outcome::Complete => QueueStatus::Submitted,
            Outcome::PendingPayment => QueueStatus::AwaitingPayment,
            Outcome::Failed => QueueStatus::Failed,
        };
        let changed = self.conn().execute(
            r#"UPDATE submissions SET
                   status = ?2,
                   attempts = CASE WHEN ?2 = 'awaiting_payment' THEN 0 ELSE attempts END,
                   last_error = ?3,
                   error_kind = ?4,
                   permit_number = COALESCE(?5, permit_number),
                   updated_at = ?6
               WHERE id = ?1"#,
            params![
                result.submission_id,
                status.as_str(),
                result.error,
                result.error_kind.map(|k| k.to_string()),
                result.permit_number,
                Utc::now().to_rfc3339()
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(result.submission_id.clone()));
        }
        Ok(status)
    }

    /// Count of rows per status, for the status report
    pub fn counts(&self) -> Result<Vec<(QueueStatus, u32)>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM submissions GROUP BY status ORDER BY status")?;
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((QueueStatus::parse(&status), count as u32))
        })?;
        let counts = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(counts)
    }
}

struct RawItem {
    id: String,
    request: String,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    error_kind: Option<String>,
    permit_number: Option<String>,
    created_at: String,
    updated_at: String,
}

fn raw_row(row: &Row<'_>) -> rusqlite::Result<RawItem> {
    Ok(RawItem {
        id: row.get(0)?,
        request: row.get(1)?,
        status: row.get(2)?,
        attempts: row.get(3)?,
        last_error: row.get(4)?,
        error_kind: row.get(5)?,
        permit_number: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

impl RawItem {
    fn into_item(self) -> Result<QueueItem, StoreError> {
        Ok(QueueItem {
            request: serde_json::from_str(&self.request)?,
            status: QueueStatus::parse(&self.status),
            attempts: self.attempts.max(0) as u32,
            created_at: parse_time(&self.created_at),
            updated_at: parse_time(&self.updated_at),
            id: self.id,
            last_error: self.last_error,
            error_kind: self.error_kind,
            permit_number: self.permit_number,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::request::sample_request;
    use crate::core::{ErrorKind, Step, SubmissionState};

    #[test]
    fn test_enqueue_and_pending() {
        let queue = SubmissionQueue::open_memory().unwrap();
        let (id, inserted) = queue.enqueue(sample_request("q-1")).unwrap();
        assert_eq!(id, "q-1");
        assert!(inserted);
        assert!(!queue.enqueue(sample_request("q-1")).unwrap().1);

        let (generated, _) = queue.enqueue(sample_request("")).unwrap();
        assert!(uuid::Uuid::parse_str(&generated).is_ok());

        let pending = queue.pending(10, 3).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].status, QueueStatus::Queued);
        assert_eq!(queue.pending(1, 3).unwrap().len(), 1);
    }

    #[test]
    fn test_attempts_and_status() {
        let queue = SubmissionQueue::open_memory().unwrap();
        queue.enqueue(sample_request("q-2")).unwrap();
        assert_eq!(queue.record_attempt("q-2").unwrap(), 1);
        assert_eq!(queue.record_attempt("q-2").unwrap(), 2);
        assert!(matches!(queue.record_attempt("nope"), Err(StoreError::NotFound(_))));

        queue.set_status("q-2", QueueStatus::ManualReview, Some("exceeded 3 attempts")).unwrap();
        let item = queue.get("q-2").unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::ManualReview);
        assert_eq!(item.attempts, 2);
        assert_eq!(item.last_error.as_deref(), Some("exceeded 3 attempts"));
        assert!(queue.pending(10, 3).unwrap().is_empty());
    }

    #[test]
    fn test_record_outcome_maps_status() {
        let queue = SubmissionQueue::open_memory().unwrap();
        queue.enqueue(sample_request("q-3")).unwrap();

        let mut state = SubmissionState::new(sample_request("q-3"));
        state.current_step = Step::AwaitingPayment;
        let pending = SubmissionResult::from_state(&state, vec![], vec![], None);
        assert_eq!(queue.record_outcome(&pending).unwrap(), QueueStatus::AwaitingPayment);
        assert!(queue.pending(10, 3).unwrap().is_empty());

        let err = crate::core::PortalError::SessionExpired("login page".into());
        let failed = SubmissionResult::from_state(&state, vec![], vec![], Some(&err));
        assert_eq!(queue.record_outcome(&failed).unwrap(), QueueStatus::Failed);
        let item = queue.get("q-3").unwrap().unwrap();
        assert_eq!(item.error_kind.as_deref(), Some(ErrorKind::SessionExpired.to_string().as_str()));
        assert_eq!(queue.counts().unwrap(), vec![(QueueStatus::Failed, 1)]);
    }

    #[test]
    fn test_failed_rows_at_the_cap_are_not_pending() {
        let queue = SubmissionQueue::open_memory().unwrap();
        queue.enqueue(sample_request("q-4")).unwrap();
        queue.record_attempt("q-4").unwrap();
        queue.record_attempt("q-4").unwrap();
        queue.set_status("q-4", QueueStatus::Failed, Some("Element not found")).unwrap();

        assert_eq!(queue.pending(10, 3).unwrap().len(), 1);
        assert!(queue.pending(10, 2).unwrap().is_empty());
    }

    #[test]
    fn test_payment_pause_resets_attempts() {
        let queue = SubmissionQueue::open_memory().unwrap();
        queue.enqueue(sample_request("q-5")).unwrap();
        queue.record_attempt("q-5").unwrap();
        queue.record_attempt("q-5").unwrap();

        let mut state = SubmissionState::new(sample_request("q-5"));
        state.current_step = Step::AwaitingPayment;
        queue.record_outcome(&SubmissionResult::from_state(&state, vec![], vec![], None)).unwrap();
        assert_eq!(queue.get("q-5").unwrap().unwrap().attempts, 0);

        // Failures keep counting
        queue.record_attempt("q-5").unwrap();
        let err = crate::core::PortalError::SessionExpired("login page".into());
        queue.record_outcome(&SubmissionResult::from_state(&state, vec![], vec![], Some(&err))).unwrap();
        assert_eq!(queue.get("q-5").unwrap().unwrap().attempts, 1);
    }
}
