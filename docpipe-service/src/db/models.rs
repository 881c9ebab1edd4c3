//! Database model structs.
//!
//! This module contains the data structures for database records.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use rusqlite::types::Type;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum::{Display, EnumString, IntoStaticStr};

/// Project lifecycle status
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProjectStatus {
    Created,
    Uploaded,
    Processing,
    Ready,
    Failed,
}

/// Document lifecycle status
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DocumentStatus {
    /// Raw bytes stored, waiting for ingestion
    Uploaded,
    /// An orchestrator holds the document and is producing chunks
    Chunking,
    /// Chunks exist, enrichment jobs are in flight
    Processing,
    Ready,
    Failed,
}

impl DocumentStatus {
    /// Statuses from which an ingestion job may (re)start
    pub fn accepts_ingestion(self) -> bool {
        matches!(self, DocumentStatus::Uploaded | DocumentStatus::Failed)
    }
}

/// Chunk lifecycle status
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChunkStatus {
    Created,
    Summarized,
    Embedded,
    Failed,
}

/// Content kinds detected by the parser for a chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentKinds {
    pub has_text: bool,
    pub has_image: bool,
    pub has_table: bool,
}

/// Project record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            status: parse_column(row, 2)?,
            created_at: parse_timestamp(&row.get::<_, String>(3)?),
        })
    }
}

/// Document record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub project_id: String,
    pub filename: String,
    pub storage_key: Option<String>,
    pub status: DocumentStatus,
    /// Unset until chunking finishes
    pub total_chunks: Option<u32>,
    pub chunks_summarized: u32,
    pub chunks_embedded: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub(crate) const COLUMNS: &'static str = "id, project_id, filename, storage_key, status, \
         total_chunks, chunks_summarized, chunks_embedded, last_error, created_at, updated_at";

    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            filename: row.get(2)?,
            storage_key: row.get(3)?,
            status: parse_column(row, 4)?,
            total_chunks: row.get(5)?,
            chunks_summarized: row.get(6)?,
            chunks_embedded: row.get(7)?,
            last_error: row.get(8)?,
            created_at: parse_timestamp(&row.get::<_, String>(9)?),
            updated_at: parse_timestamp(&row.get::<_, String>(10)?),
        })
    }

    /// All chunks are embedded and the counters agree with the chunk total.
    pub fn counters_saturated(&self) -> bool {
        matches!(self.total_chunks, Some(total) if self.chunks_embedded == total)
    }
}

/// Chunk record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: u32,
    pub content: String,
    pub summarized_content: Option<String>,
    pub status: ChunkStatus,
    pub kinds: ContentKinds,
    pub page_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    pub(crate) const COLUMNS: &'static str = "id, document_id, chunk_index, content, \
         summarized_content, status, has_text, has_image, has_table, page_number, embedding, \
         created_at";

    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let embedding_bytes: Option<Vec<u8>> = row.get(10)?;

        Ok(Self {
            id: row.get(0)?,
            document_id: row.get(1)?,
            chunk_index: row.get(2)?,
            content: row.get(3)?,
            summarized_content: row.get(4)?,
            status: parse_column(row, 5)?,
            kinds: ContentKinds {
                has_text: row.get(6)?,
                has_image: row.get(7)?,
                has_table: row.get(8)?,
            },
            page_number: row.get(9)?,
            embedding: embedding_bytes.map(|bytes| embedding_from_bytes(&bytes)),
            created_at: parse_timestamp(&row.get::<_, String>(11)?),
        })
    }
}

/// Image record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub chunk_id: String,
    pub storage_key: String,
    pub created_at: DateTime<Utc>,
}

impl Image {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get(0)?,
            chunk_id: row.get(1)?,
            storage_key: row.get(2)?,
            created_at: parse_timestamp(&row.get::<_, String>(3)?),
        })
    }
}

pub(crate) fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub(crate) fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Parse a TEXT status column into its enum, surfacing unknown values as a
/// conversion error instead of silently picking a default.
pub(crate) fn parse_column<T>(row: &Row<'_>, idx: usize) -> Result<T, rusqlite::Error>
where
    T: FromStr<Err = strum::ParseError>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(DocumentStatus::Chunking.to_string(), "chunking");
        assert_eq!(
            "processing".parse::<DocumentStatus>().unwrap(),
            DocumentStatus::Processing
        );
        assert!("done".parse::<ChunkStatus>().is_err());
        let s: &'static str = ProjectStatus::Ready.into();
        assert_eq!(s, "ready");
    }

    #[test]
    fn test_accepts_ingestion() {
        assert!(DocumentStatus::Uploaded.accepts_ingestion());
        assert!(DocumentStatus::Failed.accepts_ingestion());
        assert!(!DocumentStatus::Chunking.accepts_ingestion());
        assert!(!DocumentStatus::Processing.accepts_ingestion());
        assert!(!DocumentStatus::Ready.accepts_ingestion());
    }

    #[test]
    fn test_embedding_bytes() {
        let embedding = vec![0.25_f32, -1.5, 3.0];
        let bytes = embedding_to_bytes(&embedding);
        assert_eq!(bytes.len(), 12);
        assert_eq!(embedding_from_bytes(&bytes), embedding);
    }
}
