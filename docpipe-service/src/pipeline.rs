//! Ingestion and enrichment pipeline.
//!
//! Two job handlers ([`Pipeline::ingest_document`] and
//! [`Pipeline::process_chunk`]) plus the trigger operations that feed them.
//! Each handler splits its database work into short units of work, each run
//! on the blocking pool through [`Database::run`]; no unit is ever open while
//! a collaborator call is awaited.

mod chunk;
mod ingest;
mod rollup;
mod trigger;

#[cfg(test)]
pub(crate) mod testing;

pub use rollup::{RollupOutcome, project_complete};
pub use trigger::{DocumentProgress, ProcessSummary, ProjectProgress};

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use crate::config::{AppConfig, ProjectFailurePolicy};
use crate::db::{Database, DocumentStatus, ProjectStatus, Session, UnitOfWork};
use crate::error::{ServiceError, ServiceResult, format_error_chain_ref};
use crate::inference::Inference;
use crate::parsing::DocumentParser;
use crate::queue::JobSpec;
use crate::storage::ObjectStore;

const DISCARD_CONCURRENCY: usize = 8;

/// Behaviour switches the handlers need from configuration
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Attempt ceiling written into every job this pipeline enqueues
    pub max_attempts: u32,
    pub presign_ttl: Duration,
    pub summarize_without_images: bool,
    pub project_failure_policy: ProjectFailurePolicy,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.queue.max_attempts,
            presign_ttl: config.storage.presign_ttl(),
            summarize_without_images: config.pipeline.summarize_without_images,
            project_failure_policy: config.pipeline.project_failure_policy,
        }
    }
}

/// How a job ended
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success(serde_json::Value),
    /// The entity was already past the point this job would move it to
    AlreadyHandled,
    /// The entity vanished between enqueue and execution
    NotFound,
    Failed(JobFailure),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub message: String,
    pub retryable: bool,
}

impl JobOutcome {
    pub(crate) fn failed(error: &ServiceError) -> Self {
        JobOutcome::Failed(JobFailure {
            message: format_error_chain_ref(error),
            retryable: error.is_retryable(),
        })
    }
}

/// The pipeline and its collaborators
pub struct Pipeline {
    db: Arc<Database>,
    parser: Arc<dyn DocumentParser>,
    store: Arc<dyn ObjectStore>,
    inference: Arc<dyn Inference>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        db: Arc<Database>,
        parser: Arc<dyn DocumentParser>,
        store: Arc<dyn ObjectStore>,
        inference: Arc<dyn Inference>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            db,
            parser,
            store,
            inference,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn inference(&self) -> &Arc<dyn Inference> {
        &self.inference
    }

    /// Run a queued job
    pub async fn execute(&self, spec: &JobSpec) -> JobOutcome {
        match spec {
            JobSpec::IngestDocument {
                project_id,
                document_id,
            } => self.ingest_document(project_id, document_id).await,
            JobSpec::ProcessChunk { chunk_id } => self.process_chunk(chunk_id).await,
        }
    }

    /// Delete blobs that no row references any more. Failures are logged only.
    async fn discard_objects(&self, keys: &[String]) {
        stream::iter(keys)
            .for_each_concurrent(DISCARD_CONCURRENCY, |key| async move {
                if let Err(e) = self.store.delete(key).await {
                    warn!(key = %key, error = %e, "Failed to delete orphaned object");
                }
            })
            .await;
    }

    /// Record a document failure in a fresh unit of work
    async fn record_document_failure(&self, document_id: &str, message: &str) {
        let policy = self.settings.project_failure_policy;
        let (id, message) = (document_id.to_string(), message.to_string());
        let result = self
            .db
            .run(move |session| mark_document_failed(session, &id, &message, policy))
            .await;
        if let Err(e) = result {
            error!(doc_id = %document_id, error = %e, "Failed to mark document as failed");
        }
    }

    /// Record a chunk failure, and its document's, in a fresh unit of work
    async fn record_chunk_failure(&self, chunk_id: &str, message: &str) {
        let policy = self.settings.project_failure_policy;
        let (id, message) = (chunk_id.to_string(), message.to_string());
        let result = self
            .db
            .run(move |session| mark_chunk_failed(session, &id, &message, policy))
            .await;
        if let Err(e) = result {
            error!(chunk_id = %chunk_id, error = %e, "Failed to mark chunk as failed");
        }
    }
}

fn mark_document_failed(
    session: &mut Session,
    document_id: &str,
    message: &str,
    policy: ProjectFailurePolicy,
) -> ServiceResult<()> {
    let uow = session.unit_of_work()?;
    if let Some(doc) = uow.lease_document(document_id)? {
        if uow.mark_document_failed(document_id, message)? {
            apply_failure_policy(&uow, &doc.project_id, policy)?;
        }
    }
    uow.commit()
}

fn mark_chunk_failed(
    session: &mut Session,
    chunk_id: &str,
    message: &str,
    policy: ProjectFailurePolicy,
) -> ServiceResult<()> {
    let uow = session.unit_of_work()?;
    let Some(chunk) = uow.lease_chunk(chunk_id)? else {
        return Ok(());
    };
    // An embedded chunk keeps its result
    if !uow.mark_chunk_failed(chunk_id)? {
        return Ok(());
    }

    if let Some(doc) = uow.lease_document(&chunk.document_id)? {
        // A chunk of an ingestion that is being redone has no say
        if doc.status != DocumentStatus::Chunking && uow.mark_document_failed(&doc.id, message)? {
            apply_failure_policy(&uow, &doc.project_id, policy)?;
        }
    }
    uow.commit()
}

fn apply_failure_policy(
    uow: &UnitOfWork<'_>,
    project_id: &str,
    policy: ProjectFailurePolicy,
) -> ServiceResult<()> {
    if policy != ProjectFailurePolicy::MarkFailed {
        return Ok(());
    }
    if let Some(project) = uow.lease_project(project_id)? {
        if project.status != ProjectStatus::Ready {
            uow.set_project_status(project_id, ProjectStatus::Failed)?;
            warn!(project_id = %project_id, "Project marked failed after a document failure");
        }
    }
    Ok(())
}
