//! Image operations.

use rusqlite::params;

use super::models::Image;
use super::{UnitOfWork, now_rfc3339};
use crate::error::{DatabaseError, ServiceResult};

impl UnitOfWork<'_> {
    /// Insert an image row linked to a chunk
    pub fn insert_image(&self, id: &str, chunk_id: &str, storage_key: &str) -> ServiceResult<()> {
        self.execute(
            "INSERT INTO images (id, chunk_id, storage_key, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, chunk_id, storage_key, now_rfc3339()],
        )
        .map_err(DatabaseError::Query)?;
        Ok(())
    }

    pub fn list_chunk_images(&self, chunk_id: &str) -> ServiceResult<Vec<Image>> {
        let mut stmt = self
            .prepare(
                "SELECT id, chunk_id, storage_key, created_at FROM images WHERE chunk_id = ?1 ORDER BY created_at, id",
            )
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map(params![chunk_id], Image::from_row)
            .map_err(DatabaseError::Query)?;

        let mut images = Vec::new();
        for row in rows {
            images.push(row.map_err(DatabaseError::Query)?);
        }
        Ok(images)
    }

    /// Storage keys of every image under a document
    pub fn list_document_image_keys(&self, document_id: &str) -> ServiceResult<Vec<String>> {
        let mut stmt = self
            .prepare(
                r#"
                SELECT i.storage_key FROM images i
                JOIN chunks c ON i.chunk_id = c.id
                WHERE c.document_id = ?1
                ORDER BY c.chunk_index, i.id
                "#,
            )
            .map_err(DatabaseError::Query)?;

        let keys = stmt
            .query_map(params![document_id], |row| row.get(0))
            .map_err(DatabaseError::Query)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(DatabaseError::Query)?;
        Ok(keys)
    }
}
