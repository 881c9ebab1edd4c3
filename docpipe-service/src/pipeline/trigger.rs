//! Trigger layer: project creation, uploads, the processing trigger,
//! deletion and progress reporting.

use bytes::Bytes;
use serde::Serialize;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

use super::Pipeline;
use super::rollup::rollup_project;
use crate::db::{Document, DocumentStatus, Project, ProjectStatus, Session};
use crate::error::{ProcessingError, ServiceError, ServiceResult};
use crate::queue::JobSpec;
use crate::storage::upload_key;

/// File types the upload flow accepts
const ALLOWED_EXTENSIONS: &[&str] = &["pdf", "txt", "md", "doc", "docx"];

/// Result of the processing trigger
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSummary {
    pub project_id: String,
    /// Documents an ingestion job was enqueued for
    pub enqueued: usize,
    /// Documents left alone because they are already chunking, processing or ready
    pub skipped: usize,
}

/// Per-document progress
#[derive(Debug, Clone, Serialize)]
pub struct DocumentProgress {
    pub id: String,
    pub project_id: String,
    pub filename: String,
    pub status: DocumentStatus,
    pub total_chunks: Option<u32>,
    pub chunks_summarized: u32,
    pub chunks_embedded: u32,
}

impl From<Document> for DocumentProgress {
    fn from(doc: Document) -> Self {
        Self {
            id: doc.id,
            project_id: doc.project_id,
            filename: doc.filename,
            status: doc.status,
            total_chunks: doc.total_chunks,
            chunks_summarized: doc.chunks_summarized,
            chunks_embedded: doc.chunks_embedded,
        }
    }
}

/// Project progress report
#[derive(Debug, Clone, Serialize)]
pub struct ProjectProgress {
    pub status: ProjectStatus,
    pub total_documents: usize,
    pub documents_processed: usize,
    pub documents: Vec<DocumentProgress>,
}

impl Pipeline {
    pub async fn create_project(&self, name: &str) -> ServiceResult<Project> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(ServiceError::InvalidRequest {
                message: "Project name must not be empty".to_string(),
            });
        }

        let project = self
            .db
            .run(move |session| {
                let uow = session.unit_of_work()?;
                let project = uow.insert_project(&Uuid::new_v4().to_string(), &name)?;
                uow.commit()?;
                Ok(project)
            })
            .await?;

        info!(project_id = %project.id, name = %project.name, "Project created");
        Ok(project)
    }

    /// Store an upload and register it as an `uploaded` document.
    pub async fn register_document(
        &self,
        project_id: &str,
        filename: &str,
        content: Bytes,
    ) -> ServiceResult<Document> {
        let filename = filename.trim();
        let extension = Path::new(filename)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(ProcessingError::UnsupportedFormat {
                format: if extension.is_empty() {
                    filename.to_string()
                } else {
                    format!(".{extension}")
                },
            }
            .into());
        }

        // Fail fast before writing the blob
        let id = project_id.to_string();
        let exists = self
            .db
            .run(move |session| Ok(session.snapshot()?.get_project(&id)?.is_some()))
            .await?;
        if !exists {
            return Err(ServiceError::ProjectNotFound {
                project_id: project_id.to_string(),
            });
        }

        let key = upload_key(project_id, filename);
        let size = content.len();
        self.store.write(&key, content).await?;

        let document_id = Uuid::new_v4().to_string();
        let (id, name, stored_key) = (project_id.to_string(), filename.to_string(), key.clone());
        let inserted = self
            .db
            .run(move |session| insert_uploaded(session, &id, &document_id, &name, &stored_key))
            .await;
        match inserted {
            Ok(document) => {
                info!(doc_id = %document.id, project_id = %project_id, filename = %filename, size, "Document uploaded");
                Ok(document)
            }
            Err(e) => {
                self.discard_objects(&[key]).await;
                Err(e)
            }
        }
    }

    /// The external trigger: move the project to `processing` and enqueue one
    /// ingestion job per document that is `uploaded` or `failed`.
    pub async fn process_project(&self, project_id: &str) -> ServiceResult<ProcessSummary> {
        let id = project_id.to_string();
        let max_attempts = self.settings.max_attempts;
        let summary = self
            .db
            .run(move |session| enqueue_ingestion(session, &id, max_attempts))
            .await?;

        info!(
            project_id = %project_id,
            enqueued = summary.enqueued,
            skipped = summary.skipped,
            "Project processing triggered"
        );
        Ok(summary)
    }

    /// Delete a document with its chunks, images and blobs.
    pub async fn delete_document(&self, project_id: &str, document_id: &str) -> ServiceResult<()> {
        let (project, document) = (project_id.to_string(), document_id.to_string());
        let keys = self
            .db
            .run(move |session| remove_document(session, &project, &document))
            .await?;

        self.discard_objects(&keys).await;
        info!(doc_id = %document_id, objects = keys.len(), "Document deleted");
        Ok(())
    }

    pub async fn project_progress(&self, project_id: &str) -> ServiceResult<ProjectProgress> {
        let id = project_id.to_string();
        self.db.run(move |session| load_progress(session, &id)).await
    }
}

/// Move the project to `processing` and enqueue its ingestions in one unit of work.
fn enqueue_ingestion(
    session: &mut Session,
    project_id: &str,
    max_attempts: u32,
) -> ServiceResult<ProcessSummary> {
    let uow = session.unit_of_work()?;

    if uow.lease_project(project_id)?.is_none() {
        return Err(ServiceError::ProjectNotFound {
            project_id: project_id.to_string(),
        });
    }
    let documents = uow.list_project_documents(project_id)?;
    if documents.is_empty() {
        return Err(ServiceError::InvalidRequest {
            message: "Project has no documents to process".to_string(),
        });
    }

    uow.set_project_status(project_id, ProjectStatus::Processing)?;

    let mut enqueued = 0;
    for doc in documents.iter().filter(|d| d.status.accepts_ingestion()) {
        let spec = JobSpec::IngestDocument {
            project_id: project_id.to_string(),
            document_id: doc.id.clone(),
        };
        uow.enqueue_job(&spec, max_attempts)?;
        enqueued += 1;
    }

    // Nothing left to ingest: the project may already be complete
    if enqueued == 0 {
        rollup_project(&uow, project_id)?;
    }
    uow.commit()?;

    Ok(ProcessSummary {
        project_id: project_id.to_string(),
        enqueued,
        skipped: documents.len() - enqueued,
    })
}

fn load_progress(session: &mut Session, project_id: &str) -> ServiceResult<ProjectProgress> {
    let snapshot = session.snapshot()?;

    let project = snapshot
        .get_project(project_id)?
        .ok_or_else(|| ServiceError::ProjectNotFound {
            project_id: project_id.to_string(),
        })?;
    let documents = snapshot.list_project_documents(project_id)?;

    let documents_processed = documents
        .iter()
        .filter(|d| d.status == DocumentStatus::Ready)
        .count();

    Ok(ProjectProgress {
        status: project.status,
        total_documents: documents.len(),
        documents_processed,
        documents: documents.into_iter().map(DocumentProgress::from).collect(),
    })
}

fn insert_uploaded(
    session: &mut Session,
    project_id: &str,
    document_id: &str,
    filename: &str,
    key: &str,
) -> ServiceResult<Document> {
    let uow = session.unit_of_work()?;
    let Some(project) = uow.lease_project(project_id)? else {
        return Err(ServiceError::ProjectNotFound {
            project_id: project_id.to_string(),
        });
    };

    uow.insert_document(document_id, project_id, filename, Some(key))?;
    // A settled project has unprocessed work again
    if matches!(
        project.status,
        ProjectStatus::Created | ProjectStatus::Ready | ProjectStatus::Failed
    ) {
        uow.set_project_status(project_id, ProjectStatus::Uploaded)?;
    }
    let document = uow
        .get_document(document_id)?
        .ok_or_else(|| ServiceError::DocumentNotFound {
            document_id: document_id.to_string(),
        })?;
    uow.commit()?;
    Ok(document)
}

/// Delete the rows in one unit of work and return the blob keys to remove.
fn remove_document(
    session: &mut Session,
    project_id: &str,
    document_id: &str,
) -> ServiceResult<Vec<String>> {
    let uow = session.unit_of_work()?;
    let document = match uow.lease_document(document_id)? {
        Some(doc) if doc.project_id == project_id => doc,
        _ => {
            return Err(ServiceError::DocumentNotFound {
                document_id: document_id.to_string(),
            });
        }
    };

    let mut keys = uow.list_document_image_keys(document_id)?;
    keys.extend(document.storage_key);
    uow.delete_document(document_id)?;

    // The deleted document may have been the last one holding the project back
    if let Some(project) = uow.lease_project(project_id)? {
        if project.status == ProjectStatus::Processing {
            rollup_project(&uow, project_id)?;
        }
    }

    uow.commit()?;
    Ok(keys)
}
