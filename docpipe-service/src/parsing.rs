//! Document parsing collaborators.
//!
//! A parser turns a document's raw bytes into an ordered list of chunk
//! descriptors. Whatever the parser sends back is validated exactly once,
//! here, and converted to [`ChunkDescriptor`]; nothing downstream touches the
//! loosely typed wire shape.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::ParserConfig;
use crate::db::{ContentKinds, Document};
use crate::error::{ProcessingError, ServiceError, ServiceResult};

/// A validated chunk descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub content: String,
    pub page_number: u32,
    pub kinds: ContentKinds,
    /// Local files holding images embedded in this chunk
    pub images: Vec<PathBuf>,
}

/// A chunk descriptor as a parser reports it
#[derive(Debug, Clone, Deserialize)]
pub struct RawChunkDescriptor {
    pub content: String,
    #[serde(default)]
    pub page_number: Option<i64>,
    #[serde(default, rename = "type")]
    pub kinds: RawKinds,
    #[serde(default)]
    pub images: Vec<String>,
}

/// Content kinds on the wire: `"text,image"` or `["text", "image"]`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawKinds {
    Joined(String),
    List(Vec<String>),
}

impl Default for RawKinds {
    fn default() -> Self {
        RawKinds::List(Vec::new())
    }
}

impl RawKinds {
    fn names(&self) -> Vec<&str> {
        match self {
            RawKinds::Joined(s) => s.split(',').map(str::trim).filter(|s| !s.is_empty()).collect(),
            RawKinds::List(items) => items.iter().map(|s| s.trim()).collect(),
        }
    }
}

impl TryFrom<(usize, RawChunkDescriptor)> for ChunkDescriptor {
    type Error = ProcessingError;

    fn try_from((index, raw): (usize, RawChunkDescriptor)) -> Result<Self, Self::Error> {
        let invalid = |message: String| ProcessingError::InvalidDescriptor { index, message };

        let page_number = match raw.page_number {
            None => 1,
            Some(n) => u32::try_from(n).map_err(|_| invalid(format!("page number {n} out of range")))?,
        };

        let mut kinds = ContentKinds::default();
        for name in raw.kinds.names() {
            match name {
                "text" => kinds.has_text = true,
                "image" => kinds.has_image = true,
                "table" => kinds.has_table = true,
                other => return Err(invalid(format!("unknown content type '{other}'"))),
            }
        }

        let mut images = Vec::with_capacity(raw.images.len());
        for path in raw.images {
            if path.trim().is_empty() {
                return Err(invalid("empty image path".to_string()));
            }
            images.push(PathBuf::from(path));
        }

        Ok(Self {
            content: raw.content,
            page_number,
            kinds,
            images,
        })
    }
}

/// Validate a parser response in order, failing on the first bad entry.
pub fn validate_descriptors(raw: Vec<RawChunkDescriptor>) -> ServiceResult<Vec<ChunkDescriptor>> {
    raw.into_iter()
        .enumerate()
        .map(|entry| ChunkDescriptor::try_from(entry).map_err(ServiceError::from))
        .collect()
}

/// Parsing collaborator
#[async_trait]
pub trait DocumentParser: Send + Sync {
    async fn parse(&self, document: &Document, bytes: Bytes) -> ServiceResult<Vec<ChunkDescriptor>>;
}

/// Build the parser selected by configuration
pub fn build_parser(config: &ParserConfig) -> ServiceResult<Box<dyn DocumentParser>> {
    match config.kind {
        crate::config::ParserKind::PlainText => {
            Ok(Box::new(PlainTextParser::new(config.max_chunk_chars)))
        }
        crate::config::ParserKind::Http => Ok(Box::new(HttpParser::new(config)?)),
    }
}

/// Remote parsing service: `POST {base_url}/parse` with the raw bytes
pub struct HttpParser {
    client: Client,
    base_url: String,
    api_token: Option<String>,
    timeout: Duration,
}

impl HttpParser {
    pub fn new(config: &ParserConfig) -> ServiceResult<Self> {
        let client = Client::builder().build().map_err(|e| {
            ServiceError::Processing(ProcessingError::Parser {
                message: format!("cannot build HTTP client: {e}"),
            })
        })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }
}

#[async_trait]
impl DocumentParser for HttpParser {
    async fn parse(&self, document: &Document, bytes: Bytes) -> ServiceResult<Vec<ChunkDescriptor>> {
        let url = format!("{}/parse", self.base_url);
        let parser_error = |message: String| ProcessingError::Parser { message };

        let mut request = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .header("X-Document-Filename", &document.filename)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| parser_error(format!("request to {url} failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(parser_error(format!("parser returned {status}: {body}")).into());
        }

        let raw: Vec<RawChunkDescriptor> = response
            .json()
            .await
            .map_err(|e| parser_error(format!("unreadable parser response: {e}")))?;

        debug!(doc_id = %document.id, descriptors = raw.len(), "Parser responded");
        validate_descriptors(raw)
    }
}

/// Built-in parser for text and markdown uploads.
///
/// Pages are separated by form feeds. Within a page, paragraphs are packed
/// into chunks of at most `max_chunk_chars` characters; a single oversized
/// paragraph becomes its own chunk. Paragraphs made of `|` rows count as
/// tables.
pub struct PlainTextParser {
    max_chunk_chars: usize,
}

impl PlainTextParser {
    pub fn new(max_chunk_chars: usize) -> Self {
        Self {
            max_chunk_chars: max_chunk_chars.max(1),
        }
    }

    pub fn split(&self, text: &str) -> Vec<ChunkDescriptor> {
        let mut chunks = Vec::new();

        for (page_index, page) in text.split('\x0c').enumerate() {
            let page_number = page_index as u32 + 1;
            let mut current = String::new();
            let mut kinds = ContentKinds::default();

            for paragraph in page.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
                let paragraph_len = paragraph.chars().count();
                let current_len = current.chars().count();
                if !current.is_empty() && current_len + 2 + paragraph_len > self.max_chunk_chars {
                    chunks.push(text_chunk(std::mem::take(&mut current), page_number, kinds));
                    kinds = ContentKinds::default();
                }

                if is_table(paragraph) {
                    kinds.has_table = true;
                } else {
                    kinds.has_text = true;
                }
                if !current.is_empty() {
                    current.push_str("\n\n");
                }
                current.push_str(paragraph);
            }

            if !current.is_empty() {
                chunks.push(text_chunk(current, page_number, kinds));
            }
        }

        chunks
    }
}

#[async_trait]
impl DocumentParser for PlainTextParser {
    async fn parse(&self, document: &Document, bytes: Bytes) -> ServiceResult<Vec<ChunkDescriptor>> {
        let extension = std::path::Path::new(&document.filename)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if !matches!(extension.as_str(), "txt" | "md") {
            return Err(ProcessingError::UnsupportedFormat { format: extension }.into());
        }

        let text = String::from_utf8_lossy(&bytes);
        let chunks = self.split(&text);
        info!(doc_id = %document.id, chunks = chunks.len(), "Split text document");
        Ok(chunks)
    }
}

fn is_table(paragraph: &str) -> bool {
    paragraph.lines().all(|line| line.trim_start().starts_with('|'))
}

fn text_chunk(content: String, page_number: u32, kinds: ContentKinds) -> ChunkDescriptor {
    ChunkDescriptor {
        content,
        page_number,
        kinds,
        images: Vec::new(),
    }
}
