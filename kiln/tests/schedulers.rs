//! Delayed and recurring scheduler integration tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiln::recurring::{CURRENT_VERSION, MAX_SUPPORTED_VERSION, RECURRING_JOB_ID_PARAMETER};
use kiln::state::{ENQUEUED, FAILED};
use kiln::storage::{score_of, RECURRING_JOBS_SET, SCHEDULE_SET};
use kiln::{
    DelayedJobScheduler, DelayedSchedulerOptions, Error, InMemoryStorage, InvocationData,
    MisfireHandling, ProcessContext, RecurringJobEntity, RecurringJobManager,
    RecurringJobOptions, RecurringJobScheduler, RecurringSchedulerOptions, ServerId,
    ServerTokens, StateChanger, StorageCapabilities, StorageConnection,
};
use kiln_testkit::{init_tracing, process_context, schedule, FlakyStorage, TestJob};
use tokio::time::timeout;

const EVERY_MINUTE: &str = "0 * * * * *";

fn delayed(options: DelayedSchedulerOptions) -> DelayedJobScheduler {
    DelayedJobScheduler::new(options, StateChanger::default())
}

fn recurring() -> RecurringJobScheduler {
    RecurringJobScheduler::new(RecurringSchedulerOptions::default(), StateChanger::default())
}

fn definition(id: &str, last_execution: DateTime<Utc>) -> RecurringJobEntity {
    RecurringJobEntity {
        id: id.to_string(),
        cron: EVERY_MINUTE.to_string(),
        time_zone: "UTC".to_string(),
        queue: "default".to_string(),
        invocation: InvocationData::new("Reports", "build"),
        created_at: last_execution,
        last_execution: Some(last_execution),
        next_execution: Some(last_execution),
        last_job_id: None,
        retry_attempt: 0,
        enabled: true,
        error: None,
        version: CURRENT_VERSION,
        misfire: MisfireHandling::Relaxed,
    }
}

async fn store(storage: &InMemoryStorage, entity: RecurringJobEntity, score: DateTime<Utc>) {
    let connection = storage.open();
    let mut transaction = connection.create_write_transaction();
    transaction.add_to_set(RECURRING_JOBS_SET, &entity.id, score_of(score));
    transaction.set_recurring_job(entity);
    transaction.commit().await.unwrap();
}

#[tokio::test]
async fn due_scheduled_job_moves_into_its_queue() {
    init_tracing();
    let storage = InMemoryStorage::default();
    let due = schedule(
        &storage,
        TestJob::simple("due"),
        "critical",
        Utc::now() - chrono::Duration::seconds(1),
    )
    .await;
    let later = schedule(
        &storage,
        TestJob::simple("later"),
        "critical",
        Utc::now() + chrono::Duration::hours(1),
    )
    .await;

    let processed = delayed(DelayedSchedulerOptions::default())
        .enqueue_next_batch(&process_context(&storage))
        .await
        .unwrap();

    assert_eq!(processed, 1);
    let state = storage.job_state(&due).unwrap();
    assert_eq!(state.name, ENQUEUED);
    assert_eq!(state.queue(), Some("critical"));
    assert_eq!(storage.queue_len("critical"), 1);
    assert!(storage.set_score(SCHEDULE_SET, due.as_str()).is_none());
    assert!(storage.set_score(SCHEDULE_SET, later.as_str()).is_some());
}

#[tokio::test]
async fn entry_without_job_is_dropped_from_schedule() {
    let storage = InMemoryStorage::default();
    let connection = storage.open();
    let mut transaction = connection.create_write_transaction();
    transaction.add_to_set(SCHEDULE_SET, "ghost", 0.0);
    transaction.commit().await.unwrap();

    let scheduler = delayed(DelayedSchedulerOptions::default());
    let ctx = process_context(&storage);
    assert_eq!(scheduler.enqueue_next_batch(&ctx).await.unwrap(), 1);
    assert_eq!(storage.set_len(SCHEDULE_SET), 0);
    assert_eq!(scheduler.enqueue_next_batch(&ctx).await.unwrap(), 0);
}

#[tokio::test]
async fn parallel_pass_without_transactions_enqueues_everything() {
    let memory = InMemoryStorage::default();
    let past = Utc::now() - chrono::Duration::seconds(5);
    let mut jobs = Vec::new();
    for name in ["a", "b", "c", "d"] {
        jobs.push(schedule(&memory, TestJob::simple(name), "default", past).await);
    }
    let storage = FlakyStorage::new(memory.clone()).with_capabilities(StorageCapabilities {
        batched_reads: true,
        transactional_state_moves: false,
    });
    let ctx = ProcessContext::new(
        ServerId::from("parallel"),
        Arc::new(storage),
        ServerTokens::new(),
    );

    let processed = delayed(DelayedSchedulerOptions::default().with_max_degree_of_parallelism(3))
        .enqueue_next_batch(&ctx)
        .await
        .unwrap();

    assert_eq!(processed, 4);
    for job_id in &jobs {
        assert_eq!(memory.job_state(job_id).unwrap().name, ENQUEUED);
    }
    assert_eq!(memory.set_len(SCHEDULE_SET), 0);
    assert_eq!(memory.queue_len("default"), 4);
}

#[tokio::test(start_paused = true)]
async fn scheduled_job_that_cannot_be_enqueued_is_failed() {
    let memory = InMemoryStorage::default();
    let job_id = schedule(
        &memory,
        TestJob::simple("stuck"),
        "default",
        Utc::now() - chrono::Duration::seconds(1),
    )
    .await;
    let storage = FlakyStorage::new(memory.clone());
    storage.fail_state_locks(2);
    let ctx = ProcessContext::new(ServerId::from("flaky"), Arc::new(storage), ServerTokens::new());

    timeout(
        Duration::from_secs(30),
        delayed(DelayedSchedulerOptions::default().with_max_state_change_attempts(2))
            .enqueue_next_batch(&ctx),
    )
    .await
    .expect("pass should finish")
    .unwrap();

    let state = memory.job_state(&job_id).unwrap();
    assert_eq!(state.name, FAILED);
    assert!(state.reason.unwrap().contains("2 retry attempt(s)"));
    assert_eq!(memory.set_len(SCHEDULE_SET), 0);
    assert_eq!(memory.queue_len("default"), 0);
}

#[tokio::test]
async fn missed_minutes_fire_once_and_advance_last_execution() {
    init_tracing();
    let storage = InMemoryStorage::default();
    let three_ago = Utc::now() - chrono::Duration::minutes(3);
    store(&storage, definition("report", three_ago), three_ago).await;
    let before = Utc::now();

    let processed = recurring()
        .schedule_next_batch(&process_context(&storage))
        .await
        .unwrap();

    assert_eq!(processed, 1);
    assert_eq!(storage.job_count(), 1);
    assert_eq!(storage.queue_len("default"), 1);

    let stored = storage.recurring_job("report").unwrap();
    let last = stored.last_execution.unwrap();
    assert!(last >= before, "last execution {last} should be at least {before}");
    assert!(last - before < chrono::Duration::seconds(30));
    assert!(stored.next_execution.unwrap() > before);
    let job_id = stored.last_job_id.unwrap();
    let recurring_id = storage
        .open()
        .get_job_parameter(&job_id, RECURRING_JOB_ID_PARAMETER)
        .await
        .unwrap();
    assert_eq!(recurring_id.as_deref(), Some("report"));
}

#[tokio::test]
async fn repeated_passes_do_not_fire_twice() {
    let storage = InMemoryStorage::default();
    let past = Utc::now() - chrono::Duration::minutes(3);
    store(&storage, definition("report", past), past).await;
    let scheduler = recurring();
    let ctx = process_context(&storage);

    scheduler.schedule_next_batch(&ctx).await.unwrap();
    scheduler.schedule_next_batch(&ctx).await.unwrap();

    assert_eq!(storage.job_count(), 1);
    let score = storage.set_score(RECURRING_JOBS_SET, "report").unwrap();
    assert!(score > score_of(Utc::now()));
}

#[tokio::test]
async fn entry_without_definition_is_dropped() {
    let storage = InMemoryStorage::default();
    let connection = storage.open();
    let mut transaction = connection.create_write_transaction();
    transaction.add_to_set(RECURRING_JOBS_SET, "ghost", 0.0);
    transaction.commit().await.unwrap();

    recurring()
        .schedule_next_batch(&process_context(&storage))
        .await
        .unwrap();

    assert_eq!(storage.set_len(RECURRING_JOBS_SET), 0);
    assert_eq!(storage.job_count(), 0);
}

#[tokio::test]
async fn definitions_from_newer_versions_are_left_alone() {
    let storage = InMemoryStorage::default();
    let past = Utc::now() - chrono::Duration::minutes(3);
    let mut future = definition("future", past);
    future.version = MAX_SUPPORTED_VERSION + 1;
    store(&storage, future.clone(), past).await;

    recurring()
        .schedule_next_batch(&process_context(&storage))
        .await
        .unwrap();
    assert_eq!(storage.recurring_job("future").unwrap(), future);
    assert_eq!(storage.job_count(), 0);

    let manager = RecurringJobManager::new(Arc::new(storage.clone()), StateChanger::default());
    let error = manager
        .add_or_update(
            "future",
            InvocationData::new("Reports", "build"),
            EVERY_MINUTE,
            RecurringJobOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Config(_)));
    assert_eq!(storage.recurring_job("future").unwrap(), future);
}

#[tokio::test]
async fn manager_saves_triggers_and_removes_definitions() {
    let storage = InMemoryStorage::default();
    let manager = RecurringJobManager::new(Arc::new(storage.clone()), StateChanger::default());

    manager
        .add_or_update(
            "cleanup",
            TestJob::simple("cleanup").invocation(),
            EVERY_MINUTE,
            RecurringJobOptions::default().with_queue("maintenance"),
        )
        .await
        .unwrap();
    let saved = storage.recurring_job("cleanup").unwrap();
    assert!(saved.next_execution.unwrap() > Utc::now());
    assert!(storage.set_score(RECURRING_JOBS_SET, "cleanup").is_some());

    // Nothing is owed yet, so a pass right away fires nothing.
    recurring()
        .schedule_next_batch(&process_context(&storage))
        .await
        .unwrap();
    assert_eq!(storage.job_count(), 0);

    let job_id = manager.trigger("cleanup").await.unwrap().unwrap();
    assert_eq!(storage.job_state(&job_id).unwrap().name, ENQUEUED);
    assert_eq!(storage.queue_len("maintenance"), 1);
    assert_eq!(storage.recurring_job("cleanup").unwrap().last_job_id, Some(job_id));

    assert!(manager.trigger("missing").await.unwrap().is_none());

    manager.remove_if_exists("cleanup").await.unwrap();
    assert!(storage.recurring_job("cleanup").is_none());
    assert_eq!(storage.set_len(RECURRING_JOBS_SET), 0);
}

#[tokio::test]
async fn invalid_cron_is_rejected_by_manager() {
    let storage = InMemoryStorage::default();
    let manager = RecurringJobManager::new(Arc::new(storage.clone()), StateChanger::default());
    let error = manager
        .add_or_update(
            "bad",
            InvocationData::new("Reports", "build"),
            "every now and then",
            RecurringJobOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, Error::InvalidCron { .. }));
    assert!(storage.recurring_job("bad").is_none());
}

#[tokio::test]
async fn invalid_queue_is_rejected_by_manager() {
    let storage = InMemoryStorage::default();
    let manager = RecurringJobManager::new(Arc::new(storage.clone()), StateChanger::default());
    let error = manager
        .add_or_update(
            "report",
            InvocationData::new("Reports", "build"),
            EVERY_MINUTE,
            RecurringJobOptions::default().with_queue("Reports Queue"),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Config(_)));
    assert!(storage.recurring_job("report").is_none());
    assert_eq!(storage.set_len(RECURRING_JOBS_SET), 0);
}
