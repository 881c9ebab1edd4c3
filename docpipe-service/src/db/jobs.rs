//! Durable task queue storage.
//!
//! Jobs live in the same database as the entities they touch, so an
//! orchestrator can enqueue its chunk jobs in the same unit of work that
//! creates the chunks.

use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use uuid::Uuid;

use super::models::parse_column;
use super::{UnitOfWork, now_rfc3339};
use crate::error::{DatabaseError, ServiceResult};
use crate::queue::JobSpec;

/// Queue status of a job
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    /// Finished with a success payload
    Succeeded,
    /// Finished as a no-op because the entity was already handled
    Skipped,
    /// Finished because the entity no longer exists
    NotFound,
    /// Out of attempts, or failed permanently
    Failed,
}

/// A job row
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub spec: JobSpec,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Unix milliseconds before which the job is not eligible
    pub run_after: i64,
    pub claimed_by: Option<String>,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl JobRecord {
    const COLUMNS: &'static str =
        "id, payload, status, attempts, max_attempts, run_after, claimed_by, last_error, result";

    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let payload: String = row.get(1)?;
        let result: Option<String> = row.get(8)?;
        let spec = serde_json::from_str(&payload).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(Self {
            id: row.get(0)?,
            spec,
            status: parse_column(row, 2)?,
            attempts: row.get(3)?,
            max_attempts: row.get(4)?,
            run_after: row.get(5)?,
            claimed_by: row.get(6)?,
            last_error: row.get(7)?,
            result: result.and_then(|s| serde_json::from_str(&s).ok()),
        })
    }

    /// Whether another attempt is allowed after the current one fails
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

impl UnitOfWork<'_> {
    /// Enqueue a job, eligible immediately. Returns the job id.
    pub fn enqueue_job(&self, spec: &JobSpec, max_attempts: u32) -> ServiceResult<String> {
        let id = Uuid::new_v4().to_string();
        let payload = serde_json::to_string(spec).map_err(DatabaseError::Serialization)?;
        let now = now_rfc3339();

        self.execute(
            r#"
            INSERT INTO jobs (id, kind, payload, status, attempts, max_attempts, run_after, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?7)
            "#,
            params![
                id,
                spec.kind(),
                payload,
                JobStatus::Queued.to_string(),
                max_attempts,
                chrono::Utc::now().timestamp_millis(),
                now
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(id)
    }

    /// Claim the oldest eligible job for a worker, counting the attempt.
    pub fn claim_next_job(&self, worker_id: &str, now_ms: i64) -> ServiceResult<Option<JobRecord>> {
        self.require_lease()?;

        let id: Option<String> = self
            .query_row(
                "SELECT id FROM jobs WHERE status = ?1 AND run_after <= ?2 ORDER BY run_after, created_at LIMIT 1",
                params![JobStatus::Queued.to_string(), now_ms],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        let Some(id) = id else {
            return Ok(None);
        };

        self.execute(
            r#"
            UPDATE jobs SET status = ?1, attempts = attempts + 1, claimed_by = ?2, updated_at = ?3
            WHERE id = ?4
            "#,
            params![JobStatus::Running.to_string(), worker_id, now_rfc3339(), id],
        )
        .map_err(DatabaseError::Query)?;

        self.get_job(&id)
    }

    pub fn get_job(&self, id: &str) -> ServiceResult<Option<JobRecord>> {
        let job = self
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JobRecord::COLUMNS),
                params![id],
                JobRecord::from_row,
            )
            .optional()
            .map_err(DatabaseError::Query)?;
        Ok(job)
    }

    /// Jobs in a given status, oldest first
    pub fn list_jobs(&self, status: JobStatus) -> ServiceResult<Vec<JobRecord>> {
        let mut stmt = self
            .prepare(&format!(
                "SELECT {} FROM jobs WHERE status = ?1 ORDER BY created_at, id",
                JobRecord::COLUMNS
            ))
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map(params![status.to_string()], JobRecord::from_row)
            .map_err(DatabaseError::Query)?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.map_err(DatabaseError::Query)?);
        }
        Ok(jobs)
    }

    /// Record a terminal outcome
    pub fn finish_job(
        &self,
        id: &str,
        status: JobStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> ServiceResult<()> {
        let result_json = result.map(|r| r.to_string());
        self.execute(
            r#"
            UPDATE jobs SET status = ?1, result = ?2, last_error = COALESCE(?3, last_error),
                            claimed_by = NULL, updated_at = ?4
            WHERE id = ?5
            "#,
            params![status.to_string(), result_json, error, now_rfc3339(), id],
        )
        .map_err(DatabaseError::Query)?;
        Ok(())
    }

    /// Put a failed job back in the queue, eligible at `run_after_ms`
    pub fn reschedule_job(&self, id: &str, run_after_ms: i64, error: &str) -> ServiceResult<()> {
        self.execute(
            r#"
            UPDATE jobs SET status = ?1, run_after = ?2, last_error = ?3, claimed_by = NULL,
                            updated_at = ?4
            WHERE id = ?5
            "#,
            params![
                JobStatus::Queued.to_string(),
                run_after_ms,
                error,
                now_rfc3339(),
                id
            ],
        )
        .map_err(DatabaseError::Query)?;
        Ok(())
    }

    /// Requeue jobs left `running` by a worker that died mid-job
    pub fn requeue_running_jobs(&self) -> ServiceResult<usize> {
        let rows = self
            .execute(
                "UPDATE jobs SET status = ?1, claimed_by = NULL, updated_at = ?2 WHERE status = ?3",
                params![
                    JobStatus::Queued.to_string(),
                    now_rfc3339(),
                    JobStatus::Running.to_string()
                ],
            )
            .map_err(DatabaseError::Query)?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_database;

    #[test]
    fn test_claim_respects_run_after_and_counts_attempts() {
        let (_dir, db) = temp_database();
        let mut session = db.session().unwrap();
        let uow = session.unit_of_work().unwrap();

        let spec = JobSpec::ProcessChunk {
            chunk_id: "c1".to_string(),
        };
        let id = uow.enqueue_job(&spec, 3).unwrap();

        let now = chrono::Utc::now().timestamp_millis();
        let job = uow.claim_next_job("w1", now + 1).unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.claimed_by.as_deref(), Some("w1"));
        assert!(matches!(job.spec, JobSpec::ProcessChunk { ref chunk_id } if chunk_id == "c1"));

        // Running jobs are not handed out twice
        assert!(uow.claim_next_job("w2", now + 1).unwrap().is_none());

        uow.reschedule_job(&id, now + 60_000, "timeout").unwrap();
        assert!(uow.claim_next_job("w2", now + 1).unwrap().is_none());
        let job = uow.claim_next_job("w2", now + 60_000).unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(job.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_requeue_running_jobs() {
        let (_dir, db) = temp_database();
        let mut session = db.session().unwrap();
        let uow = session.unit_of_work().unwrap();
        let spec = JobSpec::IngestDocument {
            project_id: "p1".to_string(),
            document_id: "d1".to_string(),
        };
        uow.enqueue_job(&spec, 3).unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        uow.claim_next_job("w1", now + 1).unwrap().unwrap();

        assert_eq!(uow.requeue_running_jobs().unwrap(), 1);
        assert_eq!(uow.list_jobs(JobStatus::Queued).unwrap().len(), 1);
    }

    #[test]
    fn test_finish_job_keeps_result() {
        let (_dir, db) = temp_database();
        let mut session = db.session().unwrap();
        let uow = session.unit_of_work().unwrap();
        let spec = JobSpec::ProcessChunk {
            chunk_id: "c9".to_string(),
        };
        let id = uow.enqueue_job(&spec, 1).unwrap();
        let result = serde_json::json!({ "chunk_id": "c9" });
        uow.finish_job(&id, JobStatus::Succeeded, Some(&result), None)
            .unwrap();

        let job = uow.get_job(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.result, Some(result));
        assert!(!job.has_attempts_left() || job.attempts == 0);
    }
}
