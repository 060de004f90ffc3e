//! Worker integration tests: claim, perform, settle, abort and shutdown.

use std::sync::Arc;
use std::time::Duration;

use kiln::state::{DELETED, ENQUEUED, FAILED, PROCESSING, SUCCEEDED};
use kiln::{
    BackgroundJobPerformer, BackgroundJobServer, BackgroundJobServerBuilder, BackgroundProcess,
    ChangeStateRequest, ExecutionId, FilterPipeline, InMemoryStorage, JobState,
    LeaseTokenRegistry, ProcessContext, ServerEventPayload, ServerId, ServerOptions,
    ServerTokens, StateChanger, Worker, WorkerOptions,
};
use kiln_testkit::{
    enqueue, init_tracing, wait_until, Behavior, FlakyStorage, MockPerformer, RecordingFilter,
    TestJob,
};
use tokio::time::timeout;

fn fast_options() -> ServerOptions {
    ServerOptions::default()
        .with_server_name("worker-test")
        .with_worker_count(2)
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_cancellation_check_interval(Duration::from_millis(20))
        .with_schedule_polling_interval(Duration::from_millis(50))
        .with_shutdown_timeout(Duration::from_millis(500))
        .with_last_chance_timeout(Duration::from_millis(200))
}

fn server(storage: &InMemoryStorage, performer: &MockPerformer) -> BackgroundJobServer {
    BackgroundJobServerBuilder::new(fast_options())
        .with_storage(Arc::new(storage.clone()))
        .with_performer(Arc::new(performer.clone()))
        .build()
        .expect("server should build")
}

fn worker(performer: &MockPerformer, options: WorkerOptions) -> Worker {
    Worker::new(
        vec!["default".to_string()],
        1,
        options,
        StateChanger::default(),
        BackgroundJobPerformer::new(Arc::new(performer.clone()), FilterPipeline::default()),
        LeaseTokenRegistry::new(),
    )
}

fn state_name(storage: &InMemoryStorage, job_id: &kiln::JobId) -> Option<String> {
    storage.job_state(job_id).map(|state| state.name)
}

#[tokio::test]
async fn enqueued_job_is_performed_and_succeeds() {
    init_tracing();
    let storage = InMemoryStorage::default();
    let performer = MockPerformer::new();
    let server = server(&storage, &performer);
    let mut events = server.subscribe();
    server.start();

    let job_id = enqueue(&storage, TestJob::simple("hello"), "default").await;

    let settled = timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let ServerEventPayload::JobSettled { job_id: settled, state } = event.payload {
                        if settled == job_id {
                            return state;
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(error) => panic!("event bus closed: {error}"),
            }
        }
    })
    .await
    .expect("job should settle");

    assert_eq!(settled, SUCCEEDED);
    let history: Vec<String> = storage
        .state_history(&job_id)
        .into_iter()
        .map(|state| state.name)
        .collect();
    assert_eq!(history, ["Enqueued", "Processing", "Succeeded"]);
    assert_eq!(storage.queue_len("default"), 0);
    performer.assert_perform_count_eq(1);

    assert!(server.stop().await);
}

#[tokio::test(start_paused = true)]
async fn claim_failing_ten_times_forces_failed_state() {
    init_tracing();
    let memory = InMemoryStorage::default();
    let job_id = enqueue(&memory, TestJob::simple("doomed"), "default").await;
    let storage = FlakyStorage::new(memory.clone());
    storage.fail_state_locks(10);

    let performer = MockPerformer::new();
    let worker = worker(&performer, WorkerOptions::default());
    let ctx = ProcessContext::new(
        ServerId::from("flaky-server"),
        Arc::new(storage.clone()),
        ServerTokens::new(),
    );

    timeout(Duration::from_secs(120), worker.execute(&ctx))
        .await
        .expect("worker pass should finish")
        .expect("worker pass should succeed");

    let state = memory.job_state(&job_id).unwrap();
    assert_eq!(state.name, FAILED);
    assert!(
        state.reason.as_deref().unwrap_or_default().contains("10 retry attempt(s)"),
        "unexpected reason: {:?}",
        state.reason
    );
    assert_eq!(storage.injected(), 10);
    assert_eq!(memory.queue_len("default"), 0);
    performer.assert_perform_count_eq(0);
}

#[tokio::test]
async fn claim_outlasting_initialization_timeout_returns_job_to_queue() {
    init_tracing();
    let memory = InMemoryStorage::default();
    let job_id = enqueue(&memory, TestJob::simple("slow-claim"), "default").await;
    let storage = FlakyStorage::new(memory.clone());
    storage.fail_state_locks(3);

    let performer = MockPerformer::new();
    let worker = worker(
        &performer,
        WorkerOptions::default().with_job_initialization_timeout(Duration::from_millis(2500)),
    );
    let ctx = ProcessContext::new(
        ServerId::from("slow-server"),
        Arc::new(storage.clone()),
        ServerTokens::new(),
    );

    let error = timeout(Duration::from_secs(10), worker.execute(&ctx))
        .await
        .expect("worker pass should finish")
        .unwrap_err();
    assert!(!error.is_cancellation());
    assert!(error.to_string().contains("initialization timed out"), "{error}");
    assert_eq!(storage.injected(), 3);
    assert_eq!(state_name(&memory, &job_id).as_deref(), Some(ENQUEUED));
    assert_eq!(memory.queue_len("default"), 1);
    performer.assert_perform_count_eq(0);

    // The entry was released, not left invisible, so the next pass picks it up.
    timeout(Duration::from_secs(5), worker.execute(&ctx))
        .await
        .expect("job should be fetchable again")
        .unwrap();
    assert_eq!(state_name(&memory, &job_id).as_deref(), Some(SUCCEEDED));
    performer.assert_perform_count_eq(1);
}

#[tokio::test]
async fn failing_job_is_retried_by_automatic_retry() {
    init_tracing();
    let storage = InMemoryStorage::default();
    let performer = MockPerformer::with_behavior(Behavior::Fail("boom".into()));
    let filter = RecordingFilter::new();
    let server = BackgroundJobServerBuilder::new(fast_options())
        .with_storage(Arc::new(storage.clone()))
        .with_performer(Arc::new(performer.clone()))
        .with_elect_filter(Arc::new(filter.clone()))
        .build()
        .unwrap();
    server.start();

    let job_id = server
        .client()
        .enqueue(TestJob::simple("retry-me").invocation(), "default")
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || async { performer.performed(&job_id) == 1 }).await
    );
    assert!(
        wait_until(Duration::from_secs(5), || async {
            state_name(&storage, &job_id).as_deref() == Some("Scheduled")
        })
        .await,
        "failed job should be rescheduled, got {:?}",
        state_name(&storage, &job_id)
    );

    let state = storage.job_state(&job_id).unwrap();
    assert!(state
        .reason
        .as_deref()
        .unwrap_or_default()
        .starts_with("Retry attempt 1 of"));
    assert_eq!(filter.elections(&job_id), ["Enqueued", "Processing", "Scheduled"]);

    assert!(server.stop().await);
}

#[tokio::test]
async fn job_changed_behind_the_worker_is_aborted() {
    init_tracing();
    let storage = InMemoryStorage::default();
    let performer = MockPerformer::with_behavior(Behavior::Hang);
    let server = server(&storage, &performer);
    server.start();

    let job_id = enqueue(&storage, TestJob::simple("hanging"), "default").await;
    assert!(wait_until(Duration::from_secs(5), || async { performer.perform_count() == 1 }).await);
    assert_eq!(state_name(&storage, &job_id).as_deref(), Some(PROCESSING));

    assert!(server.client().delete(&job_id).await.unwrap());

    assert!(
        wait_until(Duration::from_secs(5), || async { performer.finished_count() == 1 }).await,
        "watcher should abort the hanging job"
    );
    assert!(wait_until(Duration::from_secs(5), || async { storage.queue_len("default") == 0 }).await);
    assert_eq!(state_name(&storage, &job_id).as_deref(), Some(DELETED));

    assert!(server.stop().await);
}

#[tokio::test]
async fn job_cancelled_by_stop_is_requeued_and_finished_by_next_server() {
    init_tracing();
    let storage = InMemoryStorage::default();
    let performer = MockPerformer::with_behavior(Behavior::Hang);
    let first = server(&storage, &performer);
    first.start();

    let job_id = enqueue(&storage, TestJob::simple("interrupted"), "default").await;
    assert!(wait_until(Duration::from_secs(5), || async { performer.perform_count() == 1 }).await);

    assert!(first.stop().await);
    assert_eq!(state_name(&storage, &job_id).as_deref(), Some(PROCESSING));
    assert_eq!(storage.queue_len("default"), 1);

    performer.set_behavior(Behavior::Succeed(None));
    let second = server(&storage, &performer);
    second.start();

    assert!(
        wait_until(Duration::from_secs(5), || async {
            state_name(&storage, &job_id).as_deref() == Some(SUCCEEDED)
        })
        .await
    );
    assert_eq!(performer.performed(&job_id), 2);
    assert!(second.stop().await);
}

#[tokio::test]
async fn settlement_by_a_stale_owner_is_refused() {
    let storage = InMemoryStorage::default();
    let job_id = enqueue(&storage, TestJob::simple("contested"), "default").await;
    let changer = StateChanger::default();
    let connection = storage.open();
    let server_id = ServerId::from("server-a");
    let stale = ExecutionId::new();
    let current = ExecutionId::new();

    for worker_id in [stale, current] {
        let claimed = changer
            .change_state(
                &connection,
                ChangeStateRequest::new(
                    job_id.clone(),
                    JobState::processing(server_id.clone(), worker_id),
                ),
            )
            .await
            .unwrap();
        assert_eq!(claimed.as_deref(), Some(PROCESSING));
    }

    let refused = changer
        .change_state(
            &connection,
            ChangeStateRequest::new(
                job_id.clone(),
                JobState::succeeded(None, Duration::ZERO, Duration::ZERO),
            )
            .expecting(&[PROCESSING])
            .owned_by(server_id.clone(), stale),
        )
        .await
        .unwrap();
    assert!(refused.is_none());

    let settled = changer
        .change_state(
            &connection,
            ChangeStateRequest::new(
                job_id.clone(),
                JobState::succeeded(None, Duration::ZERO, Duration::ZERO),
            )
            .expecting(&[PROCESSING])
            .owned_by(server_id, current),
        )
        .await
        .unwrap();
    assert_eq!(settled.as_deref(), Some(SUCCEEDED));
}
