//! Durable task queue and worker pool.
//!
//! Jobs are rows in the `jobs` table. A worker claims the oldest eligible job
//! inside an exclusive unit of work, runs it through the [`Pipeline`], and
//! settles the row according to the [`JobOutcome`]. Delivery is at least
//! once: a job left `running` by a crashed process is requeued at startup.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::db::{Database, DocumentStatus, JobRecord, JobStatus, Session};
use crate::error::ServiceResult;
use crate::pipeline::{JobOutcome, Pipeline};

/// A unit of work for the queue. Identifiers travel as strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSpec {
    IngestDocument {
        project_id: String,
        document_id: String,
    },
    ProcessChunk {
        chunk_id: String,
    },
}

impl JobSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            JobSpec::IngestDocument { .. } => "ingest_document",
            JobSpec::ProcessChunk { .. } => "process_chunk",
        }
    }
}

/// Worker pool over the jobs table
pub struct TaskQueue {
    db: Arc<Database>,
    pipeline: Arc<Pipeline>,
    config: QueueConfig,
}

impl TaskQueue {
    pub fn new(db: Arc<Database>, pipeline: Arc<Pipeline>, config: QueueConfig) -> Self {
        Self {
            db,
            pipeline,
            config,
        }
    }

    /// Requeue jobs a previous process left `running`.
    ///
    /// An ingestion cut off mid-parse leaves its document in `chunking`, which
    /// refuses a new ingestion. Such documents are failed first so the
    /// requeued job (or a later trigger) can ingest them again.
    pub fn recover(&self) -> ServiceResult<usize> {
        let mut session = self.db.session()?;
        let uow = session.unit_of_work()?;

        for job in uow.list_jobs(JobStatus::Running)? {
            let JobSpec::IngestDocument { document_id, .. } = &job.spec else {
                continue;
            };
            let Some(document) = uow.lease_document(document_id)? else {
                continue;
            };
            if document.status == DocumentStatus::Chunking {
                let message = "Ingestion interrupted before chunks were stored";
                if uow.mark_document_failed(document_id, message)? {
                    info!(doc_id = %document_id, job_id = %job.id, "Released document left in chunking");
                }
            }
        }

        let requeued = uow.requeue_running_jobs()?;
        uow.commit()?;

        if requeued > 0 {
            warn!(requeued, "Requeued jobs interrupted by a previous shutdown");
        }
        Ok(requeued)
    }

    /// Spawn the configured number of workers. They stop when `cancel` fires.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|n| {
                let queue = Arc::clone(&self);
                let cancel = cancel.clone();
                let worker_id = format!("worker-{n}");
                tokio::spawn(async move { queue.run_worker(worker_id, cancel).await })
            })
            .collect()
    }

    async fn run_worker(&self, worker_id: String, cancel: CancellationToken) {
        info!(worker = %worker_id, "Queue worker started");
        loop {
            let idle = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.process_next(&worker_id) => match result {
                    Ok(Some(_)) => None,
                    Ok(None) => Some(self.config.poll_interval()),
                    Err(e) => {
                        error!(worker = %worker_id, error = %e, "Failed to claim or settle a job");
                        Some(self.config.poll_interval() * 5)
                    }
                },
            };

            if let Some(delay) = idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        info!(worker = %worker_id, "Queue worker stopped");
    }

    /// Claim, run and settle one job. `None` when nothing is eligible.
    pub async fn process_next(
        &self,
        worker_id: &str,
    ) -> ServiceResult<Option<(JobRecord, JobOutcome)>> {
        let Some(job) = self.claim(worker_id).await? else {
            return Ok(None);
        };

        debug!(job_id = %job.id, kind = job.spec.kind(), attempt = job.attempts, "Running job");
        let outcome = self.pipeline.execute(&job.spec).await;
        self.settle(&job, &outcome).await?;

        Ok(Some((job, outcome)))
    }

    async fn claim(&self, worker_id: &str) -> ServiceResult<Option<JobRecord>> {
        let worker_id = worker_id.to_string();
        self.db
            .run(move |session| {
                let uow = session.unit_of_work()?;
                let job = uow.claim_next_job(&worker_id, chrono::Utc::now().timestamp_millis())?;
                uow.commit()?;
                Ok(job)
            })
            .await
    }

    async fn settle(&self, job: &JobRecord, outcome: &JobOutcome) -> ServiceResult<()> {
        let (job, outcome, config) = (job.clone(), outcome.clone(), self.config.clone());
        self.db
            .run(move |session| settle_job(session, &job, &outcome, &config))
            .await
    }
}

/// Write the row transition a job outcome calls for
fn settle_job(
    session: &mut Session,
    job: &JobRecord,
    outcome: &JobOutcome,
    config: &QueueConfig,
) -> ServiceResult<()> {
    let uow = session.unit_of_work()?;

    match outcome {
        JobOutcome::Success(result) => {
            uow.finish_job(&job.id, JobStatus::Succeeded, Some(result), None)?;
        }
        JobOutcome::AlreadyHandled => {
            uow.finish_job(&job.id, JobStatus::Skipped, None, None)?;
        }
        JobOutcome::NotFound => {
            uow.finish_job(&job.id, JobStatus::NotFound, None, None)?;
        }
        JobOutcome::Failed(failure) if failure.retryable && job.has_attempts_left() => {
            let delay = backoff_delay(
                job.attempts,
                Duration::from_secs(config.backoff_base_secs),
                Duration::from_secs(config.backoff_max_secs),
            ) + jitter(config.backoff_base_secs);
            let run_after = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;
            uow.reschedule_job(&job.id, run_after, &failure.message)?;
            warn!(
                job_id = %job.id,
                kind = job.spec.kind(),
                attempt = job.attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %failure.message,
                "Job failed, retrying"
            );
        }
        JobOutcome::Failed(failure) => {
            uow.finish_job(&job.id, JobStatus::Failed, None, Some(&failure.message))?;
            error!(
                job_id = %job.id,
                kind = job.spec.kind(),
                attempt = job.attempts,
                retryable = failure.retryable,
                error = %failure.message,
                "Job failed permanently"
            );
        }
    }

    uow.commit()
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max`
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// Random extra delay up to half the base, so retries of sibling jobs spread out
fn jitter(base_secs: u64) -> Duration {
    let ceiling_ms = base_secs * 500;
    if ceiling_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
}
