//! Embedding fan-out: one job, many chunks, bounded concurrency.
//!
//! Each chunk is an independent sub-task: idempotency check, embedding call,
//! then an insert in its own transaction. At most `concurrency` sub-tasks are
//! in flight at once across the whole job. Any failed chunk fails the job;
//! the retry re-skips chunks that already have a record.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use hearth_core::{
    defaults, new_v7, ChunkInput, CreateEmbeddingsArgs, EmbeddingBackend, EmbeddingRecord,
    EmbeddingRepository, JobKind, Result,
};

use crate::handler::{JobContext, JobHandler, JobResult, TransactionScope};

/// What happened to one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkOutcome {
    Embedded,
    /// A record with this `document_id` already existed.
    Skipped,
}

/// Handler for [`JobKind::CreateEmbeddings`].
pub struct CreateEmbeddingsHandler {
    repo: Arc<dyn EmbeddingRepository>,
    backend: Arc<dyn EmbeddingBackend>,
    concurrency: usize,
}

impl CreateEmbeddingsHandler {
    pub fn new(repo: Arc<dyn EmbeddingRepository>, backend: Arc<dyn EmbeddingBackend>) -> Self {
        Self {
            repo,
            backend,
            concurrency: defaults::EMBED_FANOUT_CONCURRENCY,
        }
    }

    /// Override the in-flight sub-task ceiling (minimum 1).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}

#[async_trait]
impl JobHandler for CreateEmbeddingsHandler {
    fn kind(&self) -> JobKind {
        JobKind::CreateEmbeddings
    }

    // Each chunk commits on its own.
    fn transaction_scope(&self) -> TransactionScope {
        TransactionScope::Handler
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let args: CreateEmbeddingsArgs = match ctx.args() {
            Ok(args) => args,
            Err(e) => return e.into(),
        };
        let total = args.chunks.len();
        debug!(
            subsystem = "jobs",
            component = "embeddings",
            job_id = %ctx.job_id(),
            attachment_id = %args.attachment_id,
            chunk_count = total,
            model = self.backend.model_name(),
            "Embedding fan-out started"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut interrupted = false;

        for chunk in args.chunks {
            if ctx.is_cancelled() {
                interrupted = true;
                break;
            }
            // Wait for a slot before spawning so in-flight work never exceeds the ceiling.
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    interrupted = true;
                    break;
                }
            };
            let repo = self.repo.clone();
            let backend = self.backend.clone();
            let (user_id, attachment_id) = (args.user_id, args.attachment_id);
            tasks.spawn(async move {
                let _permit = permit;
                embed_chunk(repo.as_ref(), backend.as_ref(), user_id, attachment_id, chunk).await
            });
        }

        let mut embedded = 0usize;
        let mut skipped = 0usize;
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(ChunkOutcome::Embedded)) => embedded += 1,
                Ok(Ok(ChunkOutcome::Skipped)) => skipped += 1,
                Ok(Err(e)) => failures.push(e.to_string()),
                Err(e) => failures.push(format!("sub-task crashed: {e}")),
            }
        }

        if !failures.is_empty() {
            warn!(
                subsystem = "jobs",
                component = "embeddings",
                job_id = %ctx.job_id(),
                failed = failures.len(),
                embedded,
                skipped,
                "Embedding fan-out had failures"
            );
            return JobResult::Retry(format!(
                "{} of {} chunks failed: {}",
                failures.len(),
                total,
                failures.join("; ")
            ));
        }
        if interrupted {
            return JobResult::Cancelled(format!(
                "interrupted by shutdown after {} of {} chunks",
                embedded + skipped,
                total
            ));
        }

        info!(
            subsystem = "jobs",
            component = "embeddings",
            job_id = %ctx.job_id(),
            embedded,
            skipped,
            "Embedding fan-out finished"
        );
        JobResult::Success(Some(json!({ "embedded": embedded, "skipped": skipped })))
    }
}

/// Embed one chunk unless its pre-assigned id already has a record.
async fn embed_chunk(
    repo: &dyn EmbeddingRepository,
    backend: &dyn EmbeddingBackend,
    user_id: Uuid,
    attachment_id: Uuid,
    chunk: ChunkInput,
) -> Result<ChunkOutcome> {
    // Chunks without an id are always new; only pre-identified ones dedupe.
    let document_id = match chunk.document_id {
        Some(id) => {
            if repo.exists(id).await? {
                trace!(document_id = %id, "Chunk already embedded, skipping");
                return Ok(ChunkOutcome::Skipped);
            }
            id
        }
        None => new_v7(),
    };

    let vector = backend.embed_text(&chunk.text).await?;
    let metadata = match chunk.metadata {
        JsonValue::Null => json!({}),
        other => other,
    };

    let inserted = repo
        .insert(EmbeddingRecord {
            document_id,
            user_id,
            attachment_id,
            text: chunk.text,
            vector,
            metadata,
        })
        .await?;

    trace!(document_id = %document_id, inserted, "Chunk embedded");
    Ok(if inserted {
        ChunkOutcome::Embedded
    } else {
        ChunkOutcome::Skipped
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hearth_core::{Job, JobState};
    use hearth_db::MemoryEmbeddingRepository;
    use hearth_inference::mock::MockEmbeddingBackend;

    fn job_for(args: &CreateEmbeddingsArgs) -> Job {
        Job {
            id: new_v7(),
            kind: JobKind::CreateEmbeddings.as_str().into(),
            queue: defaults::EMBED_QUEUE.into(),
            args: serde_json::to_value(args).unwrap(),
            state: JobState::Running,
            scheduled_at: Utc::now(),
            attempt: 1,
            max_attempts: 5,
            last_error: None,
            created_at: Utc::now(),
            attempted_at: Some(Utc::now()),
            finalized_at: None,
        }
    }

    fn args_with(chunks: Vec<ChunkInput>) -> CreateEmbeddingsArgs {
        CreateEmbeddingsArgs {
            user_id: Uuid::new_v4(),
            attachment_id: Uuid::new_v4(),
            chunks,
        }
    }

    #[tokio::test]
    async fn test_empty_chunk_list_succeeds() {
        let handler = CreateEmbeddingsHandler::new(
            Arc::new(MemoryEmbeddingRepository::new()),
            Arc::new(MockEmbeddingBackend::new()),
        );
        let args = args_with(Vec::new());
        let result = handler.execute(JobContext::new(job_for(&args))).await;
        assert_eq!(
            result,
            JobResult::Success(Some(json!({"embedded": 0, "skipped": 0})))
        );
    }

    #[tokio::test]
    async fn test_null_metadata_stored_as_empty_object() {
        let repo = MemoryEmbeddingRepository::new();
        let backend = MockEmbeddingBackend::new();
        let id = new_v7();
        let attachment_id = Uuid::new_v4();
        let chunk = ChunkInput::new("hello").with_document_id(id);

        let outcome = embed_chunk(&repo, &backend, Uuid::new_v4(), attachment_id, chunk)
            .await
            .unwrap();
        assert_eq!(outcome, ChunkOutcome::Embedded);

        let records = repo.list_for_attachment(attachment_id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].document_id, id);
        assert_eq!(records[0].metadata, json!({}));
    }

    #[tokio::test]
    async fn test_existing_document_skips_embedding_call() {
        let repo = MemoryEmbeddingRepository::new();
        let backend = MockEmbeddingBackend::new();
        let id = new_v7();

        embed_chunk(&repo, &backend, Uuid::new_v4(), Uuid::new_v4(), ChunkInput::new("a").with_document_id(id))
            .await
            .unwrap();
        let outcome = embed_chunk(&repo, &backend, Uuid::new_v4(), Uuid::new_v4(), ChunkInput::new("a").with_document_id(id))
            .await
            .unwrap();

        assert_eq!(outcome, ChunkOutcome::Skipped);
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_chunks_without_id_are_never_deduplicated() {
        let repo = MemoryEmbeddingRepository::new();
        let handler = CreateEmbeddingsHandler::new(
            Arc::new(repo.clone()),
            Arc::new(MockEmbeddingBackend::new()),
        );
        let args = args_with(vec![ChunkInput::new("same"), ChunkInput::new("same")]);

        handler.execute(JobContext::new(job_for(&args))).await;
        handler.execute(JobContext::new(job_for(&args))).await;
        assert_eq!(repo.len().await, 4);
    }

    #[tokio::test]
    async fn test_failed_chunk_fails_job_with_count() {
        let repo = MemoryEmbeddingRepository::new();
        let handler = CreateEmbeddingsHandler::new(
            Arc::new(repo.clone()),
            Arc::new(MockEmbeddingBackend::new().failing_on("bad")),
        );
        let args = args_with(vec![
            ChunkInput::new("good").with_document_id(new_v7()),
            ChunkInput::new("bad").with_document_id(new_v7()),
            ChunkInput::new("fine").with_document_id(new_v7()),
        ]);

        match handler.execute(JobContext::new(job_for(&args))).await {
            JobResult::Retry(msg) => assert!(msg.starts_with("1 of 3 chunks failed"), "{msg}"),
            other => panic!("expected retry, got {other:?}"),
        }
        // Partial progress is kept.
        assert_eq!(repo.len().await, 2);
    }

    #[tokio::test]
    async fn test_cancelled_context_stops_before_embedding() {
        let repo = MemoryEmbeddingRepository::new();
        let backend = MockEmbeddingBackend::new();
        let handler = CreateEmbeddingsHandler::new(Arc::new(repo.clone()), Arc::new(backend.clone()));
        let args = args_with(vec![ChunkInput::new("a"), ChunkInput::new("b")]);

        let (_stop, stopped) = tokio::sync::watch::channel(true);
        let ctx = JobContext::new(job_for(&args)).with_shutdown(stopped);
        match handler.execute(ctx).await {
            JobResult::Cancelled(msg) => assert!(msg.contains("after 0 of 2 chunks"), "{msg}"),
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(backend.call_count(), 0);
        assert_eq!(repo.len().await, 0);
    }

    #[tokio::test]
    async fn test_wrong_kind_is_discarded() {
        let handler = CreateEmbeddingsHandler::new(
            Arc::new(MemoryEmbeddingRepository::new()),
            Arc::new(MockEmbeddingBackend::new()),
        );
        let mut job = job_for(&args_with(Vec::new()));
        job.kind = "send_email".into();
        assert!(matches!(
            handler.execute(JobContext::new(job)).await,
            JobResult::Discard(_)
        ));
    }

    #[test]
    fn test_concurrency_floor() {
        let handler = CreateEmbeddingsHandler::new(
            Arc::new(MemoryEmbeddingRepository::new()),
            Arc::new(MockEmbeddingBackend::new()),
        );
        assert_eq!(handler.concurrency(), 10);
        assert_eq!(handler.with_concurrency(0).concurrency(), 1);
    }
}
