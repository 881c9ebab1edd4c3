//! Document operations.
//!
//! Counter updates are guarded in SQL so that `chunks_summarized` and
//! `chunks_embedded` can never run past `total_chunks`, even if a caller
//! forgets to check first.

use rusqlite::{OptionalExtension, params};

use super::models::{Document, DocumentStatus};
use super::{UnitOfWork, now_rfc3339};
use crate::error::{DatabaseError, ProcessingError, ServiceError, ServiceResult};

impl UnitOfWork<'_> {
    /// Insert a new document in `uploaded` state
    pub fn insert_document(
        &self,
        id: &str,
        project_id: &str,
        filename: &str,
        storage_key: Option<&str>,
    ) -> ServiceResult<()> {
        let now = now_rfc3339();
        self.execute(
            r#"
            INSERT INTO documents (id, project_id, filename, storage_key, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            "#,
            params![
                id,
                project_id,
                filename,
                storage_key,
                DocumentStatus::Uploaded.to_string(),
                now
            ],
        )
        .map_err(DatabaseError::Query)?;
        Ok(())
    }

    /// Get a document by ID without taking a lease
    pub fn get_document(&self, id: &str) -> ServiceResult<Option<Document>> {
        let doc = self
            .query_row(
                &format!("SELECT {} FROM documents WHERE id = ?1", Document::COLUMNS),
                params![id],
                Document::from_row,
            )
            .optional()
            .map_err(DatabaseError::Query)?;
        Ok(doc)
    }

    /// Get a document under the exclusive lease of this unit of work
    pub fn lease_document(&self, id: &str) -> ServiceResult<Option<Document>> {
        self.require_lease()?;
        self.get_document(id)
    }

    /// All documents of a project, oldest first
    pub fn list_project_documents(&self, project_id: &str) -> ServiceResult<Vec<Document>> {
        let mut stmt = self
            .prepare(&format!(
                "SELECT {} FROM documents WHERE project_id = ?1 ORDER BY created_at, id",
                Document::COLUMNS
            ))
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map(params![project_id], Document::from_row)
            .map_err(DatabaseError::Query)?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(row.map_err(DatabaseError::Query)?);
        }
        Ok(docs)
    }

    /// Claim a document for chunking. Clears any totals from an earlier ingestion.
    pub fn mark_document_chunking(&self, id: &str) -> ServiceResult<bool> {
        let rows = self
            .execute(
                r#"
                UPDATE documents
                SET status = ?1, total_chunks = NULL, chunks_summarized = 0, chunks_embedded = 0,
                    last_error = NULL, updated_at = ?2
                WHERE id = ?3
                "#,
                params![DocumentStatus::Chunking.to_string(), now_rfc3339(), id],
            )
            .map_err(DatabaseError::Query)?;
        Ok(rows > 0)
    }

    /// Record the chunk total and move the document into `processing`.
    pub fn finish_chunking(&self, id: &str, total_chunks: u32) -> ServiceResult<bool> {
        let rows = self
            .execute(
                r#"
                UPDATE documents
                SET status = ?1, total_chunks = ?2, chunks_summarized = 0, chunks_embedded = 0,
                    updated_at = ?3
                WHERE id = ?4
                "#,
                params![
                    DocumentStatus::Processing.to_string(),
                    total_chunks,
                    now_rfc3339(),
                    id
                ],
            )
            .map_err(DatabaseError::Query)?;
        Ok(rows > 0)
    }

    pub fn set_document_status(&self, id: &str, status: DocumentStatus) -> ServiceResult<bool> {
        let rows = self
            .execute(
                "UPDATE documents SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.to_string(), now_rfc3339(), id],
            )
            .map_err(DatabaseError::Query)?;
        Ok(rows > 0)
    }

    /// Mark a document failed. A document that already reached `ready` stays ready.
    pub fn mark_document_failed(&self, id: &str, error: &str) -> ServiceResult<bool> {
        let rows = self
            .execute(
                "UPDATE documents SET status = ?1, last_error = ?2, updated_at = ?3 WHERE id = ?4 AND status != ?5",
                params![
                    DocumentStatus::Failed.to_string(),
                    error,
                    now_rfc3339(),
                    id,
                    DocumentStatus::Ready.to_string()
                ],
            )
            .map_err(DatabaseError::Query)?;
        Ok(rows > 0)
    }

    /// Bump `chunks_summarized`, refusing to pass `total_chunks`
    pub fn increment_chunks_summarized(&self, id: &str) -> ServiceResult<()> {
        let rows = self
            .execute(
                r#"
                UPDATE documents SET chunks_summarized = chunks_summarized + 1, updated_at = ?1
                WHERE id = ?2 AND total_chunks IS NOT NULL AND chunks_summarized < total_chunks
                "#,
                params![now_rfc3339(), id],
            )
            .map_err(DatabaseError::Query)?;
        if rows == 0 {
            return Err(counter_conflict(id, "chunks_summarized already at total_chunks"));
        }
        Ok(())
    }

    /// Bump `chunks_embedded`, refusing to pass `total_chunks`. Returns the
    /// updated document so callers can check for saturation.
    pub fn increment_chunks_embedded(&self, id: &str) -> ServiceResult<Document> {
        let rows = self
            .execute(
                r#"
                UPDATE documents SET chunks_embedded = chunks_embedded + 1, updated_at = ?1
                WHERE id = ?2 AND total_chunks IS NOT NULL AND chunks_embedded < total_chunks
                "#,
                params![now_rfc3339(), id],
            )
            .map_err(DatabaseError::Query)?;
        if rows == 0 {
            return Err(counter_conflict(id, "chunks_embedded already at total_chunks"));
        }
        self.get_document(id)?
            .ok_or_else(|| ServiceError::DocumentNotFound {
                document_id: id.to_string(),
            })
    }

    /// Delete a document; chunks and images cascade
    pub fn delete_document(&self, id: &str) -> ServiceResult<bool> {
        let rows = self
            .execute("DELETE FROM documents WHERE id = ?1", params![id])
            .map_err(DatabaseError::Query)?;
        Ok(rows > 0)
    }
}

fn counter_conflict(document_id: &str, message: &str) -> ServiceError {
    ServiceError::Processing(ProcessingError::CounterConflict {
        document_id: document_id.to_string(),
        message: message.to_string(),
    })
}
