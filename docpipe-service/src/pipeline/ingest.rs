//! Ingestion orchestrator: one document in, chunk rows and chunk jobs out.

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::rollup::{RollupOutcome, rollup_project};
use super::{JobOutcome, Pipeline};
use crate::db::{Document, DocumentStatus, Session, new_chunk};
use crate::error::{ProcessingError, ServiceResult};
use crate::parsing::ChunkDescriptor;
use crate::queue::JobSpec;
use crate::storage::{ImageOwner, ImageUpload};

/// A chunk whose images are already in the object store
struct PlannedChunk {
    id: String,
    descriptor: ChunkDescriptor,
    image_keys: Vec<String>,
}

enum Claim {
    Claimed(Document),
    NotFound,
    AlreadyHandled(DocumentStatus),
}

enum Persisted {
    Chunked {
        chunks: usize,
        stale_keys: Vec<String>,
        rollup: Option<RollupOutcome>,
    },
    /// Deleted while we were parsing
    Vanished,
    /// Someone else moved the document on while we were parsing
    Superseded(DocumentStatus),
}

impl Pipeline {
    /// Parse a document into chunks and fan out one chunk job per chunk.
    pub async fn ingest_document(&self, project_id: &str, document_id: &str) -> JobOutcome {
        let (project, document) = (project_id.to_string(), document_id.to_string());
        let claim = self
            .db
            .run(move |session| claim_for_chunking(session, &project, &document))
            .await;

        let document = match claim {
            Ok(Claim::Claimed(document)) => document,
            Ok(Claim::NotFound) => {
                warn!(doc_id = %document_id, project_id = %project_id, "Document not found for ingestion");
                return JobOutcome::NotFound;
            }
            Ok(Claim::AlreadyHandled(status)) => {
                info!(doc_id = %document_id, status = %status, "Document already being handled, skipping");
                return JobOutcome::AlreadyHandled;
            }
            Err(e) => return JobOutcome::failed(&e),
        };

        info!(doc_id = %document.id, filename = %document.filename, "Chunking document");

        match self.chunk_document(&document).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(doc_id = %document.id, error = %e, "Document ingestion failed");
                let message = crate::error::format_error_chain_ref(&e);
                self.record_document_failure(&document.id, &message).await;
                JobOutcome::failed(&e)
            }
        }
    }

    async fn chunk_document(&self, document: &Document) -> ServiceResult<JobOutcome> {
        let key = document
            .storage_key
            .as_deref()
            .ok_or_else(|| ProcessingError::MissingSource {
                document_id: document.id.clone(),
            })?;

        let bytes = self.store.read(key).await?;
        let descriptors = self.parser.parse(document, bytes).await?;
        debug!(doc_id = %document.id, descriptors = descriptors.len(), "Document parsed");

        let planned = self.upload_images(document, descriptors).await?;
        let uploaded: Vec<String> = planned
            .iter()
            .flat_map(|p| p.image_keys.iter().cloned())
            .collect();

        let document_id = document.id.clone();
        let max_attempts = self.settings.max_attempts;
        let persisted = self
            .db
            .run(move |session| persist_chunks(session, &document_id, &planned, max_attempts))
            .await;
        match persisted {
            Ok(Persisted::Chunked {
                chunks,
                stale_keys,
                rollup,
            }) => {
                self.discard_objects(&stale_keys).await;
                info!(
                    doc_id = %document.id,
                    chunks,
                    images = uploaded.len(),
                    "Document chunked, chunk jobs enqueued"
                );
                if let Some(rollup) = rollup {
                    debug!(doc_id = %document.id, ?rollup, "Empty document rolled up");
                }
                Ok(JobOutcome::Success(serde_json::json!({
                    "document_id": document.id,
                    "chunks": chunks,
                })))
            }
            Ok(Persisted::Vanished) => {
                self.discard_objects(&uploaded).await;
                Ok(JobOutcome::NotFound)
            }
            Ok(Persisted::Superseded(status)) => {
                info!(doc_id = %document.id, status = %status, "Document changed during chunking, discarding results");
                self.discard_objects(&uploaded).await;
                Ok(JobOutcome::AlreadyHandled)
            }
            Err(e) => {
                self.discard_objects(&uploaded).await;
                Err(e)
            }
        }
    }

    /// Allocate chunk ids and upload every image. Any failed upload aborts the
    /// document and removes what this attempt already uploaded.
    async fn upload_images(
        &self,
        document: &Document,
        descriptors: Vec<ChunkDescriptor>,
    ) -> ServiceResult<Vec<PlannedChunk>> {
        let mut planned = Vec::with_capacity(descriptors.len());
        let mut uploaded = Vec::new();

        for descriptor in descriptors {
            let chunk_id = Uuid::new_v4().to_string();
            let owner = ImageOwner {
                project_id: document.project_id.clone(),
                document_id: document.id.clone(),
                chunk_id: chunk_id.clone(),
            };

            let mut image_keys = Vec::with_capacity(descriptor.images.len());
            for path in &descriptor.images {
                match self.store.write_image(path, &owner).await {
                    ImageUpload::Uploaded { key } => {
                        uploaded.push(key.clone());
                        image_keys.push(key);
                    }
                    ImageUpload::Error { message } => {
                        self.discard_objects(&uploaded).await;
                        return Err(ProcessingError::ImageUpload {
                            path: path.display().to_string(),
                            message,
                        }
                        .into());
                    }
                }
            }

            planned.push(PlannedChunk {
                id: chunk_id,
                descriptor,
                image_keys,
            });
        }

        Ok(planned)
    }
}

/// Lease the document and move it to `chunking` if it may be (re)ingested.
fn claim_for_chunking(
    session: &mut Session,
    project_id: &str,
    document_id: &str,
) -> ServiceResult<Claim> {
    let uow = session.unit_of_work()?;
    let document = match uow.lease_document(document_id)? {
        Some(doc) if doc.project_id == project_id => doc,
        _ => return Ok(Claim::NotFound),
    };
    if !document.status.accepts_ingestion() {
        return Ok(Claim::AlreadyHandled(document.status));
    }

    uow.mark_document_chunking(document_id)?;
    uow.commit()?;

    Ok(Claim::Claimed(Document {
        status: DocumentStatus::Chunking,
        total_chunks: None,
        chunks_summarized: 0,
        chunks_embedded: 0,
        last_error: None,
        ..document
    }))
}

/// Write chunks, images and chunk jobs in one unit of work.
fn persist_chunks(
    session: &mut Session,
    document_id: &str,
    planned: &[PlannedChunk],
    max_attempts: u32,
) -> ServiceResult<Persisted> {
    let uow = session.unit_of_work()?;
    let Some(document) = uow.lease_document(document_id)? else {
        return Ok(Persisted::Vanished);
    };
    if document.status != DocumentStatus::Chunking {
        return Ok(Persisted::Superseded(document.status));
    }

    // Rows from an earlier ingestion of this document
    let stale_keys = uow.delete_document_chunks(document_id)?;

    for (index, chunk) in planned.iter().enumerate() {
        let row = new_chunk(
            chunk.id.clone(),
            document_id,
            index as u32,
            chunk.descriptor.content.clone(),
            chunk.descriptor.kinds,
            chunk.descriptor.page_number,
        );
        uow.insert_chunk(&row)?;
        for key in &chunk.image_keys {
            uow.insert_image(&Uuid::new_v4().to_string(), &chunk.id, key)?;
        }
    }

    uow.finish_chunking(document_id, planned.len() as u32)?;

    let rollup = if planned.is_empty() {
        uow.set_document_status(document_id, DocumentStatus::Ready)?;
        Some(rollup_project(&uow, &document.project_id)?)
    } else {
        for chunk in planned {
            let spec = JobSpec::ProcessChunk {
                chunk_id: chunk.id.clone(),
            };
            uow.enqueue_job(&spec, max_attempts)?;
        }
        None
    };

    uow.commit()?;

    Ok(Persisted::Chunked {
        chunks: planned.len(),
        stale_keys,
        rollup,
    })
}
