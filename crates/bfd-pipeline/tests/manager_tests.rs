//! Pipeline manager behaviour across the store, the volunteer loop and the
//! scheduler loop.

mod common;

use bfd_pipeline::jobs::{
    JobArguments, JobContext, JobOutcome, JobRecordStore, JobSchedule, JobState, JobType,
    PipelineJob, PipelineManager,
};
use bfd_pipeline::JobError;
use common::{eventually, fast_manager_config, init_test_tracing, CountingJob, GatedJob};
use std::sync::Arc;
use std::time::Duration;

const GATED: JobType = JobType::new("Gated");
const COUNTING: JobType = JobType::new("Counting");

fn manager(worker_slots: usize) -> PipelineManager {
    PipelineManager::new(
        Arc::new(JobRecordStore::new()),
        fast_manager_config(worker_slots),
    )
}

#[tokio::test]
async fn test_open_slots_follow_running_jobs() {
    init_test_tracing();
    let manager = manager(4);
    let job = Arc::new(GatedJob::new(GATED, true));
    manager.register_job(job.clone()).await.unwrap();
    assert_eq!(manager.open_slots(), 4);

    let mut ids = Vec::new();
    for _ in 0..4 {
        let record = manager
            .store()
            .submit(GATED, JobArguments::None, None)
            .await;
        assert!(manager.enqueue(&record).await.unwrap());
        ids.push(record.id);
    }
    assert_eq!(manager.open_slots(), 0);
    eventually(Duration::from_secs(2), || async { job.started() == 4 }).await;

    job.release(1);
    let store = Arc::clone(manager.store());
    eventually(Duration::from_secs(2), || {
        let store = Arc::clone(&store);
        async move {
            store
                .records()
                .await
                .iter()
                .any(|r| r.state == JobState::Completed)
        }
    })
    .await;
    assert!(manager.open_slots() >= 1);

    job.release(3);
    for id in ids {
        let record = manager.store().wait_for_completion(id).await.unwrap();
        assert_eq!(record.outcome, Some(JobOutcome::WorkDone));
    }
    assert_eq!(manager.open_slots(), 4);
}

#[tokio::test]
async fn test_enqueue_beyond_capacity_waits_for_a_slot() {
    init_test_tracing();
    let manager = manager(3);
    let job = Arc::new(GatedJob::new(GATED, true));
    manager.register_job(job.clone()).await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..5 {
        let record = manager
            .store()
            .submit(GATED, JobArguments::None, None)
            .await;
        assert!(manager.enqueue(&record).await.unwrap());
        ids.push(record.id);
    }
    eventually(Duration::from_secs(2), || async { job.started() == 3 }).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(job.started(), 3);

    job.release(5);
    for id in ids {
        let record = manager.store().wait_for_completion(id).await.unwrap();
        assert_eq!(record.state, JobState::Completed);
    }
    assert_eq!(job.started(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_enqueues_start_a_record_once() {
    let manager = manager(3);
    let job = Arc::new(CountingJob::new(COUNTING));
    manager.register_job(job.clone()).await.unwrap();

    let record = manager
        .store()
        .submit(COUNTING, JobArguments::None, None)
        .await;
    let barrier = Arc::new(tokio::sync::Barrier::new(16));
    let attempts: Vec<_> = (0..16)
        .map(|_| {
            let manager = manager.clone();
            let record = record.clone();
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                manager.enqueue(&record).await.unwrap()
            })
        })
        .collect();

    let mut accepted = 0;
    for attempt in attempts {
        if attempt.await.unwrap() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1);

    let finished = manager.store().wait_for_completion(record.id).await.unwrap();
    assert_eq!(finished.state, JobState::Completed);
    assert_eq!(job.runs(), 1);
}

#[tokio::test]
async fn test_unknown_job_type_fails_the_record() {
    let manager = manager(3);
    let record = manager
        .store()
        .submit(JobType::new("Nobody"), JobArguments::None, None)
        .await;
    assert!(manager.enqueue(&record).await.is_err());

    let failed = manager.store().get(record.id).await.unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert!(failed.failure.unwrap().contains("Nobody"));
    assert!(manager.store().find_pending_jobs(10).await.is_empty());
}

#[tokio::test]
async fn test_unknown_job_type_does_not_block_the_queue() {
    init_test_tracing();
    let manager = manager(3);
    let job = Arc::new(CountingJob::new(COUNTING));
    manager.register_job(job.clone()).await.unwrap();

    let unknown = manager
        .store()
        .submit(JobType::new("Nobody"), JobArguments::None, None)
        .await;
    let runnable = manager
        .store()
        .submit(COUNTING, JobArguments::None, None)
        .await;
    manager.start().await.unwrap();

    let finished = tokio::time::timeout(
        Duration::from_secs(5),
        manager.store().wait_for_completion(runnable.id),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(finished.state, JobState::Completed);
    assert_eq!(job.runs(), 1);
    assert_eq!(
        manager.store().get(unknown.id).await.unwrap().state,
        JobState::Failed
    );

    manager.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_volunteer_runs_submitted_records() {
    init_test_tracing();
    let manager = manager(3);
    let job = Arc::new(CountingJob::new(COUNTING));
    manager.register_job(job.clone()).await.unwrap();
    manager.start().await.unwrap();

    let mut ids = Vec::new();
    for n in 0..5 {
        let record = manager
            .store()
            .submit(COUNTING, JobArguments::Json(serde_json::json!({ "n": n })), None)
            .await;
        ids.push(record.id);
    }

    for id in ids {
        let record = tokio::time::timeout(
            Duration::from_secs(5),
            manager.store().wait_for_completion(id),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(record.outcome, Some(JobOutcome::WorkDone));
        assert!(record.claimed_at.is_some() && record.started_at.is_some());
    }
    assert_eq!(job.runs(), 5);

    manager.stop(Duration::from_secs(1)).await;
    assert!(manager.is_stopping());
}

#[tokio::test]
async fn test_recurring_job_never_overlaps_itself() {
    init_test_tracing();

    struct Recurring(CountingJob);

    #[async_trait::async_trait]
    impl PipelineJob for Recurring {
        fn job_type(&self) -> JobType {
            self.0.job_type()
        }

        fn schedule(&self) -> Option<JobSchedule> {
            Some(JobSchedule::every(Duration::ZERO))
        }

        async fn call(&self, ctx: &JobContext) -> Result<JobOutcome, JobError> {
            self.0.call(ctx).await
        }
    }

    let manager = manager(4);
    let job = Arc::new(Recurring(CountingJob::new(COUNTING)));
    manager.register_job(job.clone()).await.unwrap();
    manager.start().await.unwrap();

    let store = Arc::clone(manager.store());
    eventually(Duration::from_secs(5), || async { job.0.runs() >= 3 }).await;

    let outstanding = store
        .records()
        .await
        .into_iter()
        .filter(|r| r.job_type == COUNTING && r.state.is_outstanding())
        .count();
    assert!(outstanding <= 1);

    manager.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_stop_cancels_interruptible_and_aborts_the_rest() {
    init_test_tracing();
    let manager = manager(4);
    let polite = Arc::new(GatedJob::new(GATED, true));
    let stubborn = Arc::new(GatedJob::new(JobType::new("Stubborn"), false));
    manager.register_job(polite.clone()).await.unwrap();
    manager.register_job(stubborn.clone()).await.unwrap();

    let polite_record = manager
        .store()
        .submit(GATED, JobArguments::None, None)
        .await;
    let stubborn_record = manager
        .store()
        .submit(JobType::new("Stubborn"), JobArguments::None, None)
        .await;
    manager.enqueue(&polite_record).await.unwrap();
    manager.enqueue(&stubborn_record).await.unwrap();
    eventually(Duration::from_secs(2), || async {
        polite.started() == 1 && stubborn.started() == 1
    })
    .await;

    manager.stop(Duration::from_millis(100)).await;

    for id in [polite_record.id, stubborn_record.id] {
        let record = manager.store().get(id).await.unwrap();
        assert_eq!(record.state, JobState::Cancelled);
        assert!(record.completed_at.is_some());
    }
    assert_eq!(manager.open_slots(), 4);

    // nothing new is accepted once stopping
    let late = manager
        .store()
        .submit(GATED, JobArguments::None, None)
        .await;
    assert!(!manager.enqueue(&late).await.unwrap());
}

#[tokio::test]
async fn test_start_twice_is_an_error() {
    let manager = manager(3);
    manager.start().await.unwrap();
    assert!(manager.start().await.is_err());
    manager.stop(Duration::from_secs(1)).await;
}
