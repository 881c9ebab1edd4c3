//! Chunk operations: insert, lease, enrichment writes and failure marking.

use rusqlite::{OptionalExtension, params};

use super::models::{Chunk, ChunkStatus, embedding_to_bytes};
use super::{UnitOfWork, now_rfc3339};
use crate::error::{DatabaseError, ServiceResult};

impl UnitOfWork<'_> {
    /// Insert a chunk
    pub fn insert_chunk(&self, chunk: &Chunk) -> ServiceResult<()> {
        self.execute(
            r#"
            INSERT INTO chunks (id, document_id, chunk_index, content, summarized_content, status,
                                has_text, has_image, has_table, page_number, embedding, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                chunk.id,
                chunk.document_id,
                chunk.chunk_index,
                chunk.content,
                chunk.summarized_content,
                chunk.status.to_string(),
                chunk.kinds.has_text,
                chunk.kinds.has_image,
                chunk.kinds.has_table,
                chunk.page_number,
                chunk.embedding.as_deref().map(embedding_to_bytes),
                chunk.created_at.to_rfc3339(),
            ],
        )
        .map_err(DatabaseError::Query)?;
        Ok(())
    }

    pub fn get_chunk(&self, id: &str) -> ServiceResult<Option<Chunk>> {
        let chunk = self
            .query_row(
                &format!("SELECT {} FROM chunks WHERE id = ?1", Chunk::COLUMNS),
                params![id],
                Chunk::from_row,
            )
            .optional()
            .map_err(DatabaseError::Query)?;
        Ok(chunk)
    }

    /// Get a chunk under the exclusive lease of this unit of work
    pub fn lease_chunk(&self, id: &str) -> ServiceResult<Option<Chunk>> {
        self.require_lease()?;
        self.get_chunk(id)
    }

    /// Chunks of a document in parser order
    pub fn list_document_chunks(&self, document_id: &str) -> ServiceResult<Vec<Chunk>> {
        let mut stmt = self
            .prepare(&format!(
                "SELECT {} FROM chunks WHERE document_id = ?1 ORDER BY chunk_index",
                Chunk::COLUMNS
            ))
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map(params![document_id], Chunk::from_row)
            .map_err(DatabaseError::Query)?;

        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row.map_err(DatabaseError::Query)?);
        }
        Ok(chunks)
    }

    /// Store the summary and move the chunk to `summarized`
    pub fn store_chunk_summary(&self, id: &str, summary: &str) -> ServiceResult<bool> {
        let rows = self
            .execute(
                "UPDATE chunks SET summarized_content = ?1, status = ?2 WHERE id = ?3",
                params![summary, ChunkStatus::Summarized.to_string(), id],
            )
            .map_err(DatabaseError::Query)?;
        Ok(rows > 0)
    }

    /// Store the embedding and move the chunk to `embedded`
    pub fn store_chunk_embedding(&self, id: &str, embedding: &[f32]) -> ServiceResult<bool> {
        let rows = self
            .execute(
                "UPDATE chunks SET embedding = ?1, status = ?2 WHERE id = ?3",
                params![
                    embedding_to_bytes(embedding),
                    ChunkStatus::Embedded.to_string(),
                    id
                ],
            )
            .map_err(DatabaseError::Query)?;
        Ok(rows > 0)
    }

    /// Mark a chunk failed. An embedded chunk is never downgraded.
    pub fn mark_chunk_failed(&self, id: &str) -> ServiceResult<bool> {
        let rows = self
            .execute(
                "UPDATE chunks SET status = ?1 WHERE id = ?2 AND status != ?3",
                params![
                    ChunkStatus::Failed.to_string(),
                    id,
                    ChunkStatus::Embedded.to_string()
                ],
            )
            .map_err(DatabaseError::Query)?;
        Ok(rows > 0)
    }

    /// Remove every chunk of a document (images cascade). Returns the storage
    /// keys of the removed images so the caller can delete the blobs.
    pub fn delete_document_chunks(&self, document_id: &str) -> ServiceResult<Vec<String>> {
        let image_keys = self.list_document_image_keys(document_id)?;
        self.execute(
            "DELETE FROM chunks WHERE document_id = ?1",
            params![document_id],
        )
        .map_err(DatabaseError::Query)?;
        Ok(image_keys)
    }
}

/// Build a fresh chunk row as the orchestrator creates it
pub(crate) fn new_chunk(
    id: String,
    document_id: &str,
    chunk_index: u32,
    content: String,
    kinds: super::ContentKinds,
    page_number: u32,
) -> Chunk {
    Chunk {
        id,
        document_id: document_id.to_string(),
        chunk_index,
        content,
        summarized_content: None,
        status: ChunkStatus::Created,
        kinds,
        page_number,
        embedding: None,
        created_at: chrono::Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::new_chunk;
    use crate::db::test_support::temp_database;
    use crate::db::{ChunkStatus, ContentKinds};

    #[test]
    fn test_enrichment_writes() {
        let (_dir, db) = temp_database();
        let mut session = db.session().unwrap();
        let uow = session.unit_of_work().unwrap();
        uow.insert_project("p1", "Project").unwrap();
        uow.insert_document("d1", "p1", "a.txt", None).unwrap();

        let kinds = ContentKinds {
            has_text: true,
            has_image: false,
            has_table: true,
        };
        uow.insert_chunk(&new_chunk("c1".into(), "d1", 0, "hello".into(), kinds, 3))
            .unwrap();

        let chunk = uow.lease_chunk("c1").unwrap().unwrap();
        assert_eq!(chunk.status, ChunkStatus::Created);
        assert_eq!(chunk.kinds, kinds);
        assert_eq!(chunk.page_number, 3);
        assert!(chunk.embedding.is_none());

        uow.store_chunk_summary("c1", "greeting").unwrap();
        uow.store_chunk_embedding("c1", &[0.5, 0.25]).unwrap();
        let chunk = uow.get_chunk("c1").unwrap().unwrap();
        assert_eq!(chunk.status, ChunkStatus::Embedded);
        assert_eq!(chunk.summarized_content.as_deref(), Some("greeting"));
        assert_eq!(chunk.embedding, Some(vec![0.5, 0.25]));

        // Embedded chunks are terminal
        assert!(!uow.mark_chunk_failed("c1").unwrap());
        let chunks = uow.list_document_chunks("d1").unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].status, ChunkStatus::Embedded);
    }

    #[test]
    fn test_delete_document_chunks_returns_image_keys() {
        let (_dir, db) = temp_database();
        let mut session = db.session().unwrap();
        let uow = session.unit_of_work().unwrap();
        uow.insert_project("p1", "Project").unwrap();
        uow.insert_document("d1", "p1", "a.txt", None).unwrap();
        uow.insert_chunk(&new_chunk(
            "c1".into(),
            "d1",
            0,
            "x".into(),
            ContentKinds::default(),
            1,
        ))
        .unwrap();
        uow.insert_image("i1", "c1", "images/p1/d1/c1/a.png").unwrap();

        let keys = uow.delete_document_chunks("d1").unwrap();
        assert_eq!(keys, vec!["images/p1/d1/c1/a.png".to_string()]);
        assert!(uow.list_document_chunks("d1").unwrap().is_empty());
        assert!(uow.list_chunk_images("c1").unwrap().is_empty());
    }
}
