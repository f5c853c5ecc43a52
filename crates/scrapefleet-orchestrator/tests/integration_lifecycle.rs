//! Integration tests for end-to-end task lifecycle scenarios.

mod common;

use common::{
    fixtures::{ConnectedWorker, TaskBuilder},
    TestOrchestrator,
};
use scrapefleet_orchestrator::config::DispatchConfig;
use scrapefleet_orchestrator::{ErrorKind, RetryConfig};
use scrapefleet_proto::{FailureSignal, TaskFailure, TaskResult};
use std::time::Duration;
use tokio::time::sleep;

#[tokio::test]
async fn captcha_retry_rotates_proxy_then_completes() {
    let orch = TestOrchestrator::with_instant_retries();
    let mut worker = ConnectedWorker::connect(&orch.registry, &orch.dispatcher, "worker-1");

    let task_id = orch.store.enqueue(TaskBuilder::new("bot-1").build());

    // First attempt: no rotation demanded
    orch.dispatcher.tick().await;
    let first = worker.next_dispatch();
    assert_eq!(first.task_id, task_id);
    assert_eq!(first.proxy_hint, None);

    // Worker hits a CAPTCHA
    orch.dispatcher
        .handle_failure(
            &worker.id,
            TaskFailure {
                task_id,
                signal: FailureSignal::new("reCAPTCHA challenge displayed"),
            },
        )
        .await;

    let snapshot = orch.store.get(task_id).unwrap();
    assert_eq!(snapshot.status, "pending");
    assert_eq!(snapshot.attempts, 1);
    assert_eq!(snapshot.last_error.as_ref().unwrap().0, ErrorKind::Captcha);

    // Second attempt must carry a proxy hint
    orch.dispatcher.tick().await;
    let second = worker.next_dispatch();
    assert_eq!(second.task_id, task_id);
    assert!(second.proxy_hint.is_some());

    // This time the scrape succeeds
    orch.dispatcher
        .handle_success(
            &worker.id,
            TaskResult {
                task_id,
                payload: br#"{"items": [{"price": "9.99"}]}"#.to_vec(),
            },
        )
        .await;

    let snapshot = orch.store.get(task_id).unwrap();
    assert_eq!(snapshot.status, "completed");
    assert_eq!(snapshot.attempts, 2);
    assert!(snapshot.result_id.is_some());
    assert_eq!(orch.sink.result_count(), 1);
}

#[tokio::test]
async fn repeated_parse_errors_fail_permanently() {
    let orch = TestOrchestrator::with_instant_retries();
    let mut worker = ConnectedWorker::connect(&orch.registry, &orch.dispatcher, "worker-1");

    let task_id = orch.store.enqueue(TaskBuilder::new("bot-1").build());

    for _ in 0..2 {
        orch.dispatcher.tick().await;
        worker.next_dispatch();
        orch.dispatcher
            .handle_failure(
                &worker.id,
                TaskFailure {
                    task_id,
                    signal: FailureSignal::new("price selector matched no elements"),
                },
            )
            .await;
    }

    let snapshot = orch.store.get(task_id).unwrap();
    assert_eq!(snapshot.status, "permanently_failed");
    assert_eq!(snapshot.attempts, 2);
    assert_eq!(snapshot.last_error.as_ref().unwrap().0, ErrorKind::ParseError);

    // Failure surfaced to the sink, nothing more dispatched
    assert_eq!(orch.sink.failure_count(), 1);
    orch.dispatcher.tick().await;
    assert!(worker.queue_empty());
}

#[tokio::test]
async fn global_attempt_ceiling_gives_up() {
    let orch = TestOrchestrator::with_instant_retries();
    let mut worker = ConnectedWorker::connect(&orch.registry, &orch.dispatcher, "worker-1");

    let task_id = orch.store.enqueue(TaskBuilder::new("bot-1").build());

    // Default ceiling is five attempts
    for attempt in 1..=5u32 {
        orch.dispatcher.tick().await;
        worker.next_dispatch();
        orch.dispatcher
            .handle_failure(
                &worker.id,
                TaskFailure {
                    task_id,
                    signal: FailureSignal::with_status("too many requests", 429),
                },
            )
            .await;
        assert_eq!(orch.store.get(task_id).unwrap().attempts, attempt);
    }

    let snapshot = orch.store.get(task_id).unwrap();
    assert_eq!(snapshot.status, "permanently_failed");
    assert_eq!(snapshot.last_error.as_ref().unwrap().0, ErrorKind::Throttled);
    assert_eq!(orch.sink.failure_count(), 1);
}

#[tokio::test]
async fn backoff_delay_embargoes_redispatch() {
    // Real backoff delays, fast ticks
    let orch = TestOrchestrator::with_config(
        RetryConfig::default(),
        DispatchConfig {
            tick_interval: Duration::from_millis(10),
            result_timeout: Duration::from_secs(30),
        },
    );
    let mut worker = ConnectedWorker::connect(&orch.registry, &orch.dispatcher, "worker-1");

    let task_id = orch.store.enqueue(TaskBuilder::new("bot-1").build());
    orch.dispatcher.tick().await;
    worker.next_dispatch();

    orch.dispatcher
        .handle_failure(
            &worker.id,
            TaskFailure {
                task_id,
                signal: FailureSignal::with_status("slow down", 429),
            },
        )
        .await;

    // Task is pending but embargoed for the base delay; ticks must not
    // redispatch it
    assert_eq!(orch.store.get(task_id).unwrap().status, "pending");
    orch.dispatcher.tick().await;
    orch.dispatcher.tick().await;
    assert!(worker.queue_empty());
    assert_eq!(orch.store.get(task_id).unwrap().attempts, 1);
}

#[tokio::test]
async fn disconnect_mid_flight_releases_and_redispatches() {
    let orch = TestOrchestrator::with_instant_retries();
    let mut worker = ConnectedWorker::connect(&orch.registry, &orch.dispatcher, "worker-1");

    let task_id = orch.store.enqueue(TaskBuilder::new("bot-1").build());
    orch.dispatcher.tick().await;
    worker.next_dispatch();
    assert_eq!(orch.store.get(task_id).unwrap().attempts, 1);

    // Connection drops mid-scrape: release without counting an attempt
    orch.dispatcher.handle_disconnect(&worker.id);
    let snapshot = orch.store.get(task_id).unwrap();
    assert_eq!(snapshot.status, "pending");
    assert_eq!(snapshot.attempts, 1);

    // Another worker picks it up; the dispatch counts as attempt two
    let mut replacement = ConnectedWorker::connect(&orch.registry, &orch.dispatcher, "worker-2");
    orch.dispatcher.tick().await;
    let request = replacement.next_dispatch();
    assert_eq!(request.task_id, task_id);
    assert_eq!(orch.store.get(task_id).unwrap().attempts, 2);
}

#[tokio::test]
async fn late_report_from_previous_holder_is_dropped() {
    let orch = TestOrchestrator::with_instant_retries();
    let mut worker = ConnectedWorker::connect(&orch.registry, &orch.dispatcher, "worker-1");

    let task_id = orch.store.enqueue(TaskBuilder::new("bot-1").build());
    orch.dispatcher.tick().await;
    worker.next_dispatch();

    orch.dispatcher.handle_disconnect(&worker.id);
    let mut replacement = ConnectedWorker::connect(&orch.registry, &orch.dispatcher, "worker-2");
    orch.dispatcher.tick().await;
    replacement.next_dispatch();

    // The old worker's report arrives after reassignment
    orch.dispatcher
        .handle_failure(
            &worker.id,
            TaskFailure {
                task_id,
                signal: FailureSignal::new("connection reset"),
            },
        )
        .await;

    // Still assigned to the replacement, attempt count untouched
    let snapshot = orch.store.get(task_id).unwrap();
    assert_eq!(snapshot.status, "in_progress");
    assert_eq!(snapshot.assigned_worker.as_deref(), Some("worker-2"));
    assert_eq!(snapshot.attempts, 2);
}

#[tokio::test]
async fn stale_report_leaves_replacement_timer_armed() {
    let orch = TestOrchestrator::with_instant_retries();
    let mut worker = ConnectedWorker::connect(&orch.registry, &orch.dispatcher, "worker-1");

    let task_id = orch.store.enqueue(TaskBuilder::new("bot-1").build());
    orch.dispatcher.tick().await;
    worker.next_dispatch();

    orch.dispatcher.handle_disconnect(&worker.id);
    let mut replacement = ConnectedWorker::connect(&orch.registry, &orch.dispatcher, "worker-2");
    orch.dispatcher.tick().await;
    replacement.next_dispatch();

    // Late success from the previous holder: must not reach the sink and
    // must not disarm the replacement dispatch's result timer
    orch.dispatcher
        .handle_success(
            &worker.id,
            TaskResult {
                task_id,
                payload: b"stale".to_vec(),
            },
        )
        .await;
    assert_eq!(orch.sink.result_count(), 0);
    assert_eq!(orch.store.get(task_id).unwrap().status, "in_progress");

    // The replacement never reports; the timer must still fire
    sleep(Duration::from_millis(300)).await;
    let snapshot = orch.store.get(task_id).unwrap();
    assert_eq!(snapshot.status, "pending");
    assert_eq!(snapshot.last_error.as_ref().unwrap().0, ErrorKind::Timeout);
}

#[tokio::test]
async fn stale_success_does_not_block_genuine_success() {
    let orch = TestOrchestrator::with_instant_retries();
    let mut worker = ConnectedWorker::connect(&orch.registry, &orch.dispatcher, "worker-1");

    let task_id = orch.store.enqueue(TaskBuilder::new("bot-1").build());
    orch.dispatcher.tick().await;
    worker.next_dispatch();

    orch.dispatcher.handle_disconnect(&worker.id);
    let mut replacement = ConnectedWorker::connect(&orch.registry, &orch.dispatcher, "worker-2");
    orch.dispatcher.tick().await;
    replacement.next_dispatch();

    orch.dispatcher
        .handle_success(
            &worker.id,
            TaskResult {
                task_id,
                payload: b"stale".to_vec(),
            },
        )
        .await;

    // The genuine holder's report completes the task normally
    orch.dispatcher
        .handle_success(
            &replacement.id,
            TaskResult {
                task_id,
                payload: b"genuine".to_vec(),
            },
        )
        .await;

    let snapshot = orch.store.get(task_id).unwrap();
    assert_eq!(snapshot.status, "completed");
    assert!(snapshot.result_id.is_some());
    assert_eq!(orch.sink.result_count(), 1);
    assert_eq!(
        orch.sink.result(task_id).unwrap().payload,
        b"genuine".to_vec()
    );
}

#[tokio::test]
async fn stale_failure_report_leaves_replacement_timer_armed() {
    let orch = TestOrchestrator::with_instant_retries();
    let mut worker = ConnectedWorker::connect(&orch.registry, &orch.dispatcher, "worker-1");

    let task_id = orch.store.enqueue(TaskBuilder::new("bot-1").build());
    orch.dispatcher.tick().await;
    worker.next_dispatch();

    orch.dispatcher.handle_disconnect(&worker.id);
    let mut replacement = ConnectedWorker::connect(&orch.registry, &orch.dispatcher, "worker-2");
    orch.dispatcher.tick().await;
    replacement.next_dispatch();

    orch.dispatcher
        .handle_failure(
            &worker.id,
            TaskFailure {
                task_id,
                signal: FailureSignal::new("connection reset"),
            },
        )
        .await;
    assert_eq!(orch.store.get(task_id).unwrap().status, "in_progress");

    sleep(Duration::from_millis(300)).await;
    let snapshot = orch.store.get(task_id).unwrap();
    assert_eq!(snapshot.status, "pending");
    assert_eq!(snapshot.last_error.as_ref().unwrap().0, ErrorKind::Timeout);
}

#[tokio::test]
async fn duplicate_success_report_is_idempotent() {
    let orch = TestOrchestrator::with_instant_retries();
    let mut worker = ConnectedWorker::connect(&orch.registry, &orch.dispatcher, "worker-1");

    let task_id = orch.store.enqueue(TaskBuilder::new("bot-1").build());
    orch.dispatcher.tick().await;
    worker.next_dispatch();

    for _ in 0..2 {
        orch.dispatcher
            .handle_success(
                &worker.id,
                TaskResult {
                    task_id,
                    payload: b"payload".to_vec(),
                },
            )
            .await;
    }

    assert_eq!(orch.store.get(task_id).unwrap().status, "completed");
    assert_eq!(orch.sink.result_count(), 1);
}

#[tokio::test]
async fn token_regeneration_severs_old_credential() {
    let orch = TestOrchestrator::new();

    let old_token = orch.registry.issue_token("worker-1");
    orch.registry.authenticate("worker-1", &old_token).unwrap();

    let new_token = orch.registry.regenerate_token("worker-1").unwrap();
    assert_ne!(old_token, new_token);

    // The live session's next message fails the revocation check
    assert!(orch.registry.verify_token("worker-1", &old_token).is_err());
    assert!(orch.registry.verify_token("worker-1", &new_token).is_ok());

    // Reconnecting with the old token is denied
    assert!(orch.registry.authenticate("worker-1", &old_token).is_err());
    assert!(orch.registry.authenticate("worker-1", &new_token).is_ok());
}

#[tokio::test]
async fn blocked_notice_defers_until_task_finishes() {
    let orch = TestOrchestrator::with_instant_retries();
    let mut worker = ConnectedWorker::connect(&orch.registry, &orch.dispatcher, "worker-1");

    let task_id = orch.store.enqueue(TaskBuilder::new("bot-1").build());
    orch.dispatcher.tick().await;
    worker.next_dispatch();

    // Worker reports network-level blocking while mid-task
    orch.registry
        .mark_blocked(&worker.id, Duration::from_secs(300))
        .unwrap();
    assert_eq!(orch.registry.get(&worker.id).unwrap().status, "busy");

    // The block applies once the task finishes
    orch.dispatcher
        .handle_success(
            &worker.id,
            TaskResult {
                task_id,
                payload: b"payload".to_vec(),
            },
        )
        .await;
    assert_eq!(orch.registry.get(&worker.id).unwrap().status, "blocked");

    // A blocked worker receives no new work
    orch.store.enqueue(TaskBuilder::new("bot-1").build());
    orch.dispatcher.tick().await;
    assert!(worker.queue_empty());
}

#[tokio::test]
async fn heartbeat_timeout_sweep_releases_held_task() {
    let orch = TestOrchestrator::with_instant_retries();
    let mut worker = ConnectedWorker::connect(&orch.registry, &orch.dispatcher, "worker-1");

    let task_id = orch.store.enqueue(TaskBuilder::new("bot-1").build());
    orch.dispatcher.tick().await;
    worker.next_dispatch();

    // No heartbeat arrives within the timeout
    sleep(Duration::from_millis(20)).await;
    orch.dispatcher.sweep(Duration::from_millis(5));

    assert_eq!(orch.registry.get(&worker.id).unwrap().status, "disconnected");
    let snapshot = orch.store.get(task_id).unwrap();
    assert_eq!(snapshot.status, "pending");
    assert_eq!(snapshot.attempts, 1);
}

#[tokio::test]
async fn longest_idle_worker_is_preferred() {
    let orch = TestOrchestrator::with_instant_retries();
    let mut first = ConnectedWorker::connect(&orch.registry, &orch.dispatcher, "worker-1");
    sleep(Duration::from_millis(5)).await;
    let mut second = ConnectedWorker::connect(&orch.registry, &orch.dispatcher, "worker-2");

    let task_id = orch.store.enqueue(TaskBuilder::new("bot-1").build());
    orch.dispatcher.tick().await;

    // worker-1 has been idle longer, so it gets the task
    assert_eq!(first.next_dispatch().task_id, task_id);
    assert!(second.queue_empty());
}
