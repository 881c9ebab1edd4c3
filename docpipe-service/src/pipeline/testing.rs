//! In-process fakes and a harness wiring them into a real pipeline over a
//! temporary database and object store.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

use super::{Pipeline, PipelineSettings};
use crate::config::ProjectFailurePolicy;
use crate::db::{Chunk, ContentKinds, Database, Document, DocumentStatus, Project};
use crate::error::{InferenceError, ProcessingError, ServiceResult};
use crate::inference::Inference;
use crate::parsing::{ChunkDescriptor, DocumentParser};
use crate::storage::LocalObjectStore;

/// 1x1 transparent PNG
const PNG_PIXEL: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f,
    0x15, 0xc4, 0x89, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0d, 0x0a, 0x2d, 0xb4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

#[derive(Default)]
struct ParserState {
    descriptors: Vec<ChunkDescriptor>,
    pending_failure: Option<String>,
    calls: usize,
}

/// Parser returning whatever descriptors the test configured
#[derive(Default)]
pub struct FakeParser {
    state: Mutex<ParserState>,
}

impl FakeParser {
    /// Descriptors returned by every following parse
    pub fn set(&self, descriptors: Vec<ChunkDescriptor>) {
        self.state.lock().unwrap().descriptors = descriptors;
    }

    /// Make the next parse fail with a retryable error
    pub fn fail_next(&self, message: &str) {
        self.state.lock().unwrap().pending_failure = Some(message.to_string());
    }

    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }
}

#[async_trait]
impl DocumentParser for FakeParser {
    async fn parse(&self, _document: &Document, _bytes: Bytes) -> ServiceResult<Vec<ChunkDescriptor>> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        if let Some(message) = state.pending_failure.take() {
            return Err(ProcessingError::Parser { message }.into());
        }
        Ok(state.descriptors.clone())
    }
}

/// Deterministic summarizer and embedder
#[derive(Default)]
pub struct FakeInference {
    fail_embeddings: AtomicBool,
    summarize_calls: AtomicUsize,
    embed_calls: AtomicUsize,
    last_image_count: Mutex<Option<usize>>,
}

impl FakeInference {
    pub fn fail_embeddings(&self, fail: bool) {
        self.fail_embeddings.store(fail, Ordering::SeqCst);
    }

    pub fn summarize_calls(&self) -> usize {
        self.summarize_calls.load(Ordering::SeqCst)
    }

    /// Successful embeddings only
    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    pub fn last_image_count(&self) -> Option<usize> {
        *self.last_image_count.lock().unwrap()
    }
}

#[async_trait]
impl Inference for FakeInference {
    async fn summarize(&self, text: &str, image_urls: &[String]) -> ServiceResult<String> {
        self.summarize_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_image_count.lock().unwrap() = Some(image_urls.len());
        Ok(format!("summary of {} ({} images)", text, image_urls.len()))
    }

    async fn embed(&self, text: &str) -> ServiceResult<Vec<f32>> {
        if self.fail_embeddings.load(Ordering::SeqCst) {
            return Err(InferenceError::Timeout {
                url: "http://inference.test/embed".to_string(),
            }
            .into());
        }
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        let len = text.len() as f32;
        Ok(vec![len, 1.0, 0.5, 0.25])
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub db: Arc<Database>,
    pub pipeline: Arc<Pipeline>,
    pub parser: Arc<FakeParser>,
    pub inference: Arc<FakeInference>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(adjust: impl FnOnce(&mut PipelineSettings)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(
            Database::open(&dir.path().join("pipeline.db"), Duration::from_secs(30)).unwrap(),
        );
        let store = LocalObjectStore::new(
            dir.path().join("objects"),
            "http://files.test",
            Some("test-secret"),
        )
        .unwrap();
        let parser = Arc::new(FakeParser::default());
        let inference = Arc::new(FakeInference::default());

        let mut settings = PipelineSettings {
            max_attempts: 3,
            presign_ttl: Duration::from_secs(600),
            summarize_without_images: false,
            project_failure_policy: ProjectFailurePolicy::Ignore,
        };
        adjust(&mut settings);

        let pipeline = Arc::new(Pipeline::new(
            db.clone(),
            parser.clone(),
            Arc::new(store),
            inference.clone(),
            settings,
        ));

        Self {
            dir,
            db,
            pipeline,
            parser,
            inference,
        }
    }

    pub async fn upload(&self, project_id: &str, filename: &str) -> Document {
        let content = Bytes::from(format!("content of {filename}"));
        self.pipeline
            .register_document(project_id, filename, content)
            .await
            .unwrap()
    }

    /// A fresh project with one uploaded document
    pub async fn project_with_document(&self, filename: &str) -> (String, Document) {
        let project_id = self.pipeline.create_project("Test project").await.unwrap().id;
        let document = self.upload(&project_id, filename).await;
        (project_id, document)
    }

    /// A processing project whose only document has been chunked
    pub async fn ingested_project(&self, filename: &str) -> (String, Document) {
        let (project_id, document) = self.project_with_document(filename).await;
        self.pipeline.process_project(&project_id).await.unwrap();
        self.pipeline.ingest_document(&project_id, &document.id).await;
        let document = self.document(&document.id);
        (project_id, document)
    }

    /// Chunk ids in chunk order
    pub fn chunk_ids(&self, document_id: &str) -> Vec<String> {
        let mut session = self.db.session().unwrap();
        let snapshot = session.snapshot().unwrap();
        snapshot
            .list_document_chunks(document_id)
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect()
    }

    pub fn document(&self, id: &str) -> Document {
        let mut session = self.db.session().unwrap();
        let snapshot = session.snapshot().unwrap();
        snapshot.get_document(id).unwrap().unwrap()
    }

    pub fn project(&self, id: &str) -> Project {
        let mut session = self.db.session().unwrap();
        let snapshot = session.snapshot().unwrap();
        snapshot.get_project(id).unwrap().unwrap()
    }

    pub fn chunk(&self, id: &str) -> Chunk {
        let mut session = self.db.session().unwrap();
        let snapshot = session.snapshot().unwrap();
        snapshot.get_chunk(id).unwrap().unwrap()
    }

    pub fn set_document_status(&self, id: &str, status: DocumentStatus) {
        let mut session = self.db.session().unwrap();
        let uow = session.unit_of_work().unwrap();
        uow.set_document_status(id, status).unwrap();
        uow.commit().unwrap();
    }

    pub fn insert_document_without_source(&self, project_id: &str, id: &str) {
        let mut session = self.db.session().unwrap();
        let uow = session.unit_of_work().unwrap();
        uow.insert_document(id, project_id, "lost.txt", None).unwrap();
        uow.commit().unwrap();
    }

    /// Number of image objects currently in the store
    pub fn stored_images(&self) -> usize {
        count_files(&self.dir.path().join("objects").join("images"))
    }
}

fn count_files(dir: &std::path::Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() { count_files(&path) } else { 1 }
        })
        .sum()
}

pub fn text_descriptor(content: &str) -> ChunkDescriptor {
    ChunkDescriptor {
        content: content.to_string(),
        page_number: 1,
        kinds: ContentKinds {
            has_text: true,
            ..ContentKinds::default()
        },
        images: Vec::new(),
    }
}

/// A descriptor carrying one real image file written below the harness dir
pub fn image_descriptor(harness: &Harness, content: &str, with_table: bool) -> ChunkDescriptor {
    let source_dir = harness.dir.path().join("parsed");
    std::fs::create_dir_all(&source_dir).unwrap();
    let path: PathBuf = source_dir.join(format!("figure-{}.png", Uuid::new_v4().simple()));
    std::fs::write(&path, PNG_PIXEL).unwrap();

    ChunkDescriptor {
        content: content.to_string(),
        page_number: 2,
        kinds: ContentKinds {
            has_text: true,
            has_image: true,
            has_table: with_table,
        },
        images: vec![path],
    }
}
