//! Embedding fan-out behaviour.
//!
//! This test suite validates:
//! - 50 chunks never have more than 10 embedding calls in flight
//! - Re-running the same job yields one record per document id
//! - A partially failed run is completed by its retry without duplicates
//! - The fan-out runs end to end through the engine

use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use hearth_db::{MemoryEmbeddingRepository, MemoryJobRepository};
use hearth_inference::mock::MockEmbeddingBackend;
use hearth_jobs::{
    new_v7, ChunkInput, CreateEmbeddingsArgs, CreateEmbeddingsHandler, EmbeddingRepository,
    InsertOpts, Job, JobClient, JobContext, JobHandler, JobRepository, JobResult, JobState,
    QueueConfig, WorkerBuilder, WorkerConfig,
};
use serde_json::json;

fn chunks_with_ids(n: usize) -> Vec<ChunkInput> {
    (0..n)
        .map(|i| {
            ChunkInput::new(format!("chunk number {i}"))
                .with_document_id(new_v7())
                .with_metadata(json!({ "index": i }))
        })
        .collect()
}

/// Insert and claim a job so handlers see it exactly as the engine would.
async fn claimed_job(args: &CreateEmbeddingsArgs) -> Job {
    let repo = MemoryJobRepository::new();
    let job = JobClient::new(Arc::new(repo.clone()))
        .insert(args, InsertOpts::new())
        .await
        .unwrap();
    let mut claimed = repo
        .claim(&job.queue, 1, chrono::Utc::now())
        .await
        .unwrap();
    claimed.remove(0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fanout_concurrency_never_exceeds_ceiling() {
    let repo = MemoryEmbeddingRepository::new();
    let backend = MockEmbeddingBackend::new().with_latency_ms(20);
    let handler = CreateEmbeddingsHandler::new(Arc::new(repo.clone()), Arc::new(backend.clone()));

    let args = CreateEmbeddingsArgs {
        user_id: Uuid::new_v4(),
        attachment_id: Uuid::new_v4(),
        chunks: chunks_with_ids(50),
    };
    let result = handler.execute(JobContext::new(claimed_job(&args).await)).await;

    assert_eq!(
        result,
        JobResult::Success(Some(json!({ "embedded": 50, "skipped": 0 })))
    );
    assert_eq!(backend.call_count(), 50);
    let peak = backend.peak_in_flight();
    assert!(peak <= 10, "peak in-flight {peak} exceeded 10");
    assert!(peak > 1, "sub-tasks should overlap");
    assert_eq!(repo.len().await, 50);
}

#[tokio::test]
async fn test_rerun_yields_one_record_per_document() {
    let repo = MemoryEmbeddingRepository::new();
    let backend = MockEmbeddingBackend::new();
    let handler = CreateEmbeddingsHandler::new(Arc::new(repo.clone()), Arc::new(backend.clone()));

    let args = CreateEmbeddingsArgs {
        user_id: Uuid::new_v4(),
        attachment_id: Uuid::new_v4(),
        chunks: chunks_with_ids(20),
    };
    let job = claimed_job(&args).await;

    let first = handler.execute(JobContext::new(job.clone())).await;
    let second = handler.execute(JobContext::new(job)).await;

    assert_eq!(first, JobResult::Success(Some(json!({ "embedded": 20, "skipped": 0 }))));
    assert_eq!(second, JobResult::Success(Some(json!({ "embedded": 0, "skipped": 20 }))));
    assert_eq!(backend.call_count(), 20, "second run makes no embedding calls");

    let records = repo.list_for_attachment(args.attachment_id).await.unwrap();
    assert_eq!(records.len(), 20);
    let mut ids: Vec<Uuid> = records.iter().map(|r| r.document_id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 20);
}

#[tokio::test]
async fn test_partial_failure_completed_by_retry() {
    let repo = MemoryEmbeddingRepository::new();
    let args = CreateEmbeddingsArgs {
        user_id: Uuid::new_v4(),
        attachment_id: Uuid::new_v4(),
        chunks: chunks_with_ids(10),
    };
    let job = claimed_job(&args).await;

    // First attempt: the embedding API rejects two chunks.
    let flaky = CreateEmbeddingsHandler::new(
        Arc::new(repo.clone()),
        Arc::new(
            MockEmbeddingBackend::new()
                .failing_on("chunk number 3")
                .failing_on("chunk number 7"),
        ),
    );
    match flaky.execute(JobContext::new(job.clone())).await {
        JobResult::Retry(msg) => assert!(msg.starts_with("2 of 10 chunks failed"), "{msg}"),
        other => panic!("expected retry, got {other:?}"),
    }
    assert_eq!(repo.len().await, 8);

    // Retry with a healthy API embeds only what is missing.
    let healthy_backend = MockEmbeddingBackend::new();
    let healthy = CreateEmbeddingsHandler::new(Arc::new(repo.clone()), Arc::new(healthy_backend.clone()));
    let result = healthy.execute(JobContext::new(job)).await;

    assert_eq!(result, JobResult::Success(Some(json!({ "embedded": 2, "skipped": 8 }))));
    assert_eq!(healthy_backend.call_count(), 2);
    assert_eq!(repo.len().await, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fanout_through_engine() {
    let jobs = MemoryJobRepository::new();
    let embeddings = MemoryEmbeddingRepository::new();
    let worker = WorkerBuilder::new(Arc::new(jobs.clone()))
        .with_config(
            WorkerConfig::default()
                .with_poll_interval(Duration::from_millis(10))
                .with_queues(vec![QueueConfig::new("embeddings", 2)]),
        )
        .with_handler(CreateEmbeddingsHandler::new(
            Arc::new(embeddings.clone()),
            Arc::new(MockEmbeddingBackend::new().with_latency_ms(2)),
        ))
        .build()
        .unwrap();
    let handle = worker.start().await.unwrap();

    let attachment_id = Uuid::new_v4();
    let job = JobClient::new(Arc::new(jobs.clone()))
        .insert(
            &CreateEmbeddingsArgs {
                user_id: Uuid::new_v4(),
                attachment_id,
                chunks: chunks_with_ids(25),
            },
            InsertOpts::new(),
        )
        .await
        .unwrap();
    assert_eq!(job.queue, "embeddings");

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let state = jobs.get(job.id).await.unwrap().unwrap().state;
        if state == JobState::Completed {
            break;
        }
        assert!(Instant::now() < deadline, "job stuck in {state}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(
        embeddings.list_for_attachment(attachment_id).await.unwrap().len(),
        25
    );
    handle.stop().await.unwrap();
}
