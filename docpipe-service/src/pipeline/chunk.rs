//! Chunk worker: summarize, embed and count one chunk.

use tracing::{debug, error, info, warn};

use super::rollup::{RollupOutcome, rollup_project};
use super::{JobOutcome, Pipeline};
use crate::db::{ChunkStatus, DocumentStatus, Session};
use crate::error::{ServiceResult, format_error_chain_ref};

/// What the worker needs to know about a chunk before calling inference
struct ChunkWork {
    chunk_id: String,
    document_id: String,
    content: String,
    image_keys: Vec<String>,
}

struct Enrichment {
    summary: String,
    embedding: Vec<f32>,
}

enum Loaded {
    Work(ChunkWork),
    Missing,
    Embedded,
}

enum Stored {
    Counted {
        document_ready: bool,
        rollup: Option<RollupOutcome>,
    },
    Missing,
    /// Another delivery of this job finished first
    Duplicate,
    /// The document is being re-ingested; this chunk is on its way out
    Stale,
}

impl Pipeline {
    /// Enrich one chunk and advance its document's counters.
    pub async fn process_chunk(&self, chunk_id: &str) -> JobOutcome {
        let id = chunk_id.to_string();
        let loaded = self.db.run(move |session| load_chunk(session, &id)).await;

        let work = match loaded {
            Ok(Loaded::Work(work)) => work,
            Ok(Loaded::Missing) => {
                warn!(chunk_id = %chunk_id, "Chunk not found");
                return JobOutcome::NotFound;
            }
            Ok(Loaded::Embedded) => {
                debug!(chunk_id = %chunk_id, "Chunk already embedded, skipping");
                return JobOutcome::AlreadyHandled;
            }
            Err(e) => return self.chunk_failed(chunk_id, &e).await,
        };

        let enrichment = match self.enrich(&work).await {
            Ok(enrichment) => enrichment,
            Err(e) => return self.chunk_failed(chunk_id, &e).await,
        };

        let id = work.chunk_id.clone();
        let stored = self
            .db
            .run(move |session| store_enrichment(session, &id, &enrichment))
            .await;

        match stored {
            Ok(Stored::Counted {
                document_ready,
                rollup,
            }) => {
                if document_ready {
                    info!(doc_id = %work.document_id, "All chunks embedded, document ready");
                }
                if let Some(rollup) = rollup {
                    debug!(doc_id = %work.document_id, ?rollup, "Project rollup evaluated");
                }
                JobOutcome::Success(serde_json::json!({
                    "chunk_id": work.chunk_id,
                    "document_id": work.document_id,
                    "document_ready": document_ready,
                    "project_ready": matches!(rollup, Some(RollupOutcome::Promoted)),
                }))
            }
            Ok(Stored::Missing) => JobOutcome::NotFound,
            Ok(Stored::Duplicate) | Ok(Stored::Stale) => JobOutcome::AlreadyHandled,
            Err(e) => self.chunk_failed(chunk_id, &e).await,
        }
    }

    async fn enrich(&self, work: &ChunkWork) -> ServiceResult<Enrichment> {
        let summary = if !work.image_keys.is_empty() {
            let urls = self
                .store
                .presign(&work.image_keys, self.settings.presign_ttl)?;
            self.inference.summarize(&work.content, &urls).await?
        } else if self.settings.summarize_without_images {
            self.inference.summarize(&work.content, &[]).await?
        } else {
            work.content.clone()
        };

        let embedding = self.inference.embed(&summary).await?;
        debug!(
            chunk_id = %work.chunk_id,
            images = work.image_keys.len(),
            dimensions = embedding.len(),
            "Chunk enriched"
        );

        Ok(Enrichment { summary, embedding })
    }

    async fn chunk_failed(&self, chunk_id: &str, error: &crate::error::ServiceError) -> JobOutcome {
        error!(chunk_id = %chunk_id, error = %error, "Chunk processing failed");
        self.record_chunk_failure(chunk_id, &format_error_chain_ref(error))
            .await;
        JobOutcome::failed(error)
    }
}

/// Lease the chunk long enough to read it. The lease ends before any
/// inference call is made.
fn load_chunk(session: &mut Session, chunk_id: &str) -> ServiceResult<Loaded> {
    let uow = session.unit_of_work()?;
    let Some(chunk) = uow.lease_chunk(chunk_id)? else {
        return Ok(Loaded::Missing);
    };
    if chunk.status == ChunkStatus::Embedded {
        return Ok(Loaded::Embedded);
    }

    let image_keys = uow
        .list_chunk_images(chunk_id)?
        .into_iter()
        .map(|image| image.storage_key)
        .collect();

    Ok(Loaded::Work(ChunkWork {
        chunk_id: chunk.id,
        document_id: chunk.document_id,
        content: chunk.content,
        image_keys,
    }))
}

/// Persist summary, embedding and both counter bumps as one unit, promoting
/// the document (and possibly its project) when the last chunk lands.
fn store_enrichment(
    session: &mut Session,
    chunk_id: &str,
    enrichment: &Enrichment,
) -> ServiceResult<Stored> {
    let uow = session.unit_of_work()?;
    let Some(chunk) = uow.lease_chunk(chunk_id)? else {
        return Ok(Stored::Missing);
    };
    if chunk.status == ChunkStatus::Embedded {
        return Ok(Stored::Duplicate);
    }
    let Some(document) = uow.lease_document(&chunk.document_id)? else {
        return Ok(Stored::Missing);
    };
    if document.status == DocumentStatus::Chunking {
        return Ok(Stored::Stale);
    }

    uow.store_chunk_summary(chunk_id, &enrichment.summary)?;
    uow.increment_chunks_summarized(&document.id)?;
    uow.store_chunk_embedding(chunk_id, &enrichment.embedding)?;
    let document = uow.increment_chunks_embedded(&document.id)?;

    let mut rollup = None;
    if document.counters_saturated() {
        uow.set_document_status(&document.id, DocumentStatus::Ready)?;
        rollup = Some(rollup_project(&uow, &document.project_id)?);
    }

    uow.commit()?;

    Ok(Stored::Counted {
        document_ready: rollup.is_some(),
        rollup,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::ProjectFailurePolicy;
    use crate::db::{ChunkStatus, DocumentStatus, ProjectStatus};
    use crate::pipeline::JobOutcome;
    use crate::pipeline::testing::{Harness, image_descriptor, text_descriptor};

    #[tokio::test]
    async fn test_chunks_complete_document_and_project() {
        let harness = Harness::new();
        harness.parser.set(vec![
            text_descriptor("one"),
            image_descriptor(&harness, "two", false),
            image_descriptor(&harness, "three", true),
        ]);
        let (project_id, doc) = harness.ingested_project("doc.txt").await;
        let chunks = harness.chunk_ids(&doc.id);

        for (i, chunk_id) in chunks.iter().enumerate() {
            let outcome = harness.pipeline.process_chunk(chunk_id).await;
            let JobOutcome::Success(result) = outcome else {
                panic!("chunk {i} failed: {outcome:?}");
            };
            let last = i == chunks.len() - 1;
            assert_eq!(result["document_ready"], last);
            assert_eq!(result["project_ready"], last);

            let stored = harness.document(&doc.id);
            assert_eq!(stored.chunks_embedded as usize, i + 1);
            assert!(stored.chunks_embedded <= stored.total_chunks.unwrap());
        }

        let stored = harness.document(&doc.id);
        assert_eq!(stored.status, DocumentStatus::Ready);
        assert_eq!(stored.chunks_summarized, 3);
        assert_eq!(harness.project(&project_id).status, ProjectStatus::Ready);

        // Only chunks with images were sent to the summarizer
        assert_eq!(harness.inference.summarize_calls(), 2);
        assert_eq!(harness.inference.embed_calls(), 3);

        let mut session = harness.db.session().unwrap();
        let snapshot = session.snapshot().unwrap();
        let first = snapshot.get_chunk(&chunks[0]).unwrap().unwrap();
        assert_eq!(first.summarized_content.as_deref(), Some("one"));
        assert_eq!(first.embedding.as_ref().map(Vec::len), Some(4));
        let second = snapshot.get_chunk(&chunks[1]).unwrap().unwrap();
        assert_eq!(second.summarized_content.as_deref(), Some("summary of two (1 images)"));
    }

    #[tokio::test]
    async fn test_summarize_without_images_policy() {
        let harness = Harness::with_settings(|s| s.summarize_without_images = true);
        harness.parser.set(vec![text_descriptor("plain")]);
        let (_project_id, doc) = harness.ingested_project("doc.txt").await;
        let chunk_id = harness.chunk_ids(&doc.id).remove(0);

        harness.pipeline.process_chunk(&chunk_id).await;
        assert_eq!(harness.inference.summarize_calls(), 1);
        assert_eq!(harness.inference.last_image_count(), Some(0));
    }

    #[tokio::test]
    async fn test_second_delivery_is_a_no_op() {
        let harness = Harness::new();
        harness.parser.set(vec![text_descriptor("a"), text_descriptor("b")]);
        let (_project_id, doc) = harness.ingested_project("doc.txt").await;
        let chunk_id = harness.chunk_ids(&doc.id).remove(0);

        assert!(matches!(
            harness.pipeline.process_chunk(&chunk_id).await,
            JobOutcome::Success(_)
        ));
        assert_eq!(
            harness.pipeline.process_chunk(&chunk_id).await,
            JobOutcome::AlreadyHandled
        );

        let stored = harness.document(&doc.id);
        assert_eq!(stored.chunks_embedded, 1);
        assert_eq!(stored.chunks_summarized, 1);
        assert_eq!(harness.inference.embed_calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_chunk() {
        let harness = Harness::new();
        assert_eq!(
            harness.pipeline.process_chunk("missing").await,
            JobOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_inference_failure_marks_chunk_and_document_failed() {
        let harness = Harness::new();
        harness.parser.set(vec![text_descriptor("a"), text_descriptor("b")]);
        let (project_id, doc) = harness.ingested_project("doc.txt").await;
        let chunks = harness.chunk_ids(&doc.id);

        assert!(matches!(
            harness.pipeline.process_chunk(&chunks[0]).await,
            JobOutcome::Success(_)
        ));

        harness.inference.fail_embeddings(true);
        let outcome = harness.pipeline.process_chunk(&chunks[1]).await;
        assert!(matches!(outcome, JobOutcome::Failed(ref f) if f.retryable));

        assert_eq!(harness.chunk(&chunks[0]).status, ChunkStatus::Embedded);
        assert_eq!(harness.chunk(&chunks[1]).status, ChunkStatus::Failed);
        let stored = harness.document(&doc.id);
        assert_eq!(stored.status, DocumentStatus::Failed);
        assert_eq!(stored.chunks_embedded, 1);
        assert!(stored.last_error.unwrap().contains("timed out"));
        // Default policy leaves the project in processing
        assert_eq!(harness.project(&project_id).status, ProjectStatus::Processing);
    }

    #[tokio::test]
    async fn test_retry_after_failure_completes_document() {
        let harness = Harness::new();
        harness.parser.set(vec![text_descriptor("a")]);
        let (project_id, doc) = harness.ingested_project("doc.txt").await;
        let chunk_id = harness.chunk_ids(&doc.id).remove(0);

        harness.inference.fail_embeddings(true);
        assert!(matches!(
            harness.pipeline.process_chunk(&chunk_id).await,
            JobOutcome::Failed(_)
        ));
        assert_eq!(harness.document(&doc.id).status, DocumentStatus::Failed);

        harness.inference.fail_embeddings(false);
        assert!(matches!(
            harness.pipeline.process_chunk(&chunk_id).await,
            JobOutcome::Success(_)
        ));
        assert_eq!(harness.document(&doc.id).status, DocumentStatus::Ready);
        assert_eq!(harness.project(&project_id).status, ProjectStatus::Ready);
    }

    #[tokio::test]
    async fn test_mark_failed_policy_fails_project() {
        let harness =
            Harness::with_settings(|s| s.project_failure_policy = ProjectFailurePolicy::MarkFailed);
        harness.parser.set(vec![text_descriptor("a")]);
        let (project_id, doc) = harness.ingested_project("doc.txt").await;
        let chunk_id = harness.chunk_ids(&doc.id).remove(0);

        harness.inference.fail_embeddings(true);
        harness.pipeline.process_chunk(&chunk_id).await;
        assert_eq!(harness.project(&project_id).status, ProjectStatus::Failed);
    }

    #[tokio::test]
    async fn test_late_failure_on_embedded_chunk_is_ignored() {
        let harness =
            Harness::with_settings(|s| s.project_failure_policy = ProjectFailurePolicy::MarkFailed);
        harness.parser.set(vec![text_descriptor("a"), text_descriptor("b")]);
        let (project_id, doc) = harness.ingested_project("doc.txt").await;
        let chunks = harness.chunk_ids(&doc.id);
        harness.pipeline.process_chunk(&chunks[0]).await;

        // A stale delivery of the same chunk fails after the first one embedded it
        harness
            .pipeline
            .record_chunk_failure(&chunks[0], "late failure")
            .await;

        assert_eq!(harness.chunk(&chunks[0]).status, ChunkStatus::Embedded);
        let stored = harness.document(&doc.id);
        assert_eq!(stored.status, DocumentStatus::Processing);
        assert!(stored.last_error.is_none());
        assert_eq!(harness.project(&project_id).status, ProjectStatus::Processing);
    }

    #[tokio::test]
    async fn test_project_waits_for_every_document() {
        let harness = Harness::new();
        harness.parser.set(vec![text_descriptor("a")]);
        let project_id = harness.pipeline.create_project("Two docs").await.unwrap().id;
        let first = harness.upload(&project_id, "one.txt").await;
        let second = harness.upload(&project_id, "two.txt").await;
        harness.pipeline.process_project(&project_id).await.unwrap();
        harness.pipeline.ingest_document(&project_id, &first.id).await;
        harness.pipeline.ingest_document(&project_id, &second.id).await;

        let first_chunk = harness.chunk_ids(&first.id).remove(0);
        harness.pipeline.process_chunk(&first_chunk).await;
        assert_eq!(harness.document(&first.id).status, DocumentStatus::Ready);
        assert_eq!(harness.project(&project_id).status, ProjectStatus::Processing);

        let second_chunk = harness.chunk_ids(&second.id).remove(0);
        harness.pipeline.process_chunk(&second_chunk).await;
        assert_eq!(harness.project(&project_id).status, ProjectStatus::Ready);
    }

    #[tokio::test]
    async fn test_permanent_failure_keeps_project_from_ready() {
        let harness = Harness::new();
        harness.parser.set(vec![text_descriptor("a"), text_descriptor("b")]);
        let (project_id, doc) = harness.ingested_project("doc.txt").await;
        let chunks = harness.chunk_ids(&doc.id);

        harness.pipeline.process_chunk(&chunks[0]).await;
        harness.inference.fail_embeddings(true);
        for _ in 0..3 {
            harness.pipeline.process_chunk(&chunks[1]).await;
        }

        assert_eq!(harness.chunk(&chunks[0]).status, ChunkStatus::Embedded);
        assert_eq!(harness.chunk(&chunks[1]).status, ChunkStatus::Failed);
        assert_eq!(harness.document(&doc.id).status, DocumentStatus::Failed);
        assert_ne!(harness.project(&project_id).status, ProjectStatus::Ready);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_chunks_do_not_lose_updates() {
        let harness = Arc::new(Harness::new());
        let descriptors = (0..8).map(|i| text_descriptor(&format!("chunk {i}"))).collect();
        harness.parser.set(descriptors);
        let (project_id, doc) = harness.ingested_project("doc.txt").await;

        let handles: Vec<_> = harness
            .chunk_ids(&doc.id)
            .into_iter()
            .flat_map(|chunk_id| {
                // Every chunk delivered twice
                [chunk_id.clone(), chunk_id]
            })
            .map(|chunk_id| {
                let harness = Arc::clone(&harness);
                tokio::spawn(async move { harness.pipeline.process_chunk(&chunk_id).await })
            })
            .collect();

        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                JobOutcome::Success(_) => successes += 1,
                JobOutcome::AlreadyHandled => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(successes, 8);

        let stored = harness.document(&doc.id);
        assert_eq!(stored.chunks_embedded, 8);
        assert_eq!(stored.chunks_summarized, 8);
        assert_eq!(stored.status, DocumentStatus::Ready);
        assert_eq!(harness.project(&project_id).status, ProjectStatus::Ready);
    }
}
