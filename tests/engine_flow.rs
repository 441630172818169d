//! End-to-end orchestration scenarios against the in-process mock runner.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use common::{test_engine, wait_for_status, wait_until};
use sitemedic::config::EngineConfig;
use sitemedic::engine::SubmitOptions;
use sitemedic::error::EngineError;
use sitemedic::model::{ExecutionStatus, FailureKind, TestType};

fn seo_config(marker: &str) -> serde_json::Value {
    json!({ "target_url": format!("https://example.com/{}", marker) })
}

fn submit_opts(priority: i32) -> SubmitOptions {
    SubmitOptions {
        priority,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_submit_then_status_round_trip() {
    let (engine, _runner, mut jobs) = test_engine(EngineConfig::default());

    let id = engine
        .submit(TestType::Seo, seo_config("round-trip"), SubmitOptions::default())
        .unwrap();

    // get_status immediately after submit always finds a record in
    // pending or running.
    let exec = engine.get_status(id).expect("record exists right away");
    assert!(matches!(
        exec.status,
        ExecutionStatus::Pending | ExecutionStatus::Running
    ));

    let job = jobs.recv().await.unwrap();
    wait_for_status(&engine, id, ExecutionStatus::Running).await;

    job.progress(50, "auditing");
    wait_until(
        || engine.get_status(id).map(|e| e.progress) == Some(50),
        "progress to reach 50",
    )
    .await;

    job.complete(json!({ "score": 88 }));
    wait_for_status(&engine, id, ExecutionStatus::Completed).await;

    let exec = engine.get_status(id).unwrap();
    assert_eq!(exec.result, Some(json!({ "score": 88 })));
    assert!(exec.error.is_none());
    assert!(exec.ended_at.is_some());
    assert_eq!(engine.list_results().len(), 1);
    assert!(engine.list_active().is_empty());
}

#[tokio::test]
async fn test_validation_error_is_synchronous_and_leaves_no_record() {
    let (engine, _runner, _jobs) = test_engine(EngineConfig::default());

    let result = engine.submit(TestType::Api, json!({}), SubmitOptions::default());
    assert!(matches!(result, Err(EngineError::Validation { .. })));

    assert!(engine.list_active().is_empty());
    assert!(engine.list_results().is_empty());
    assert_eq!(engine.stats().executions.pending, 0);
}

#[tokio::test]
async fn test_concurrency_cap_admits_two_of_five_stress_tests() {
    let mut config = EngineConfig::default();
    config.max_concurrent_per_type.insert(TestType::Stress, 2);
    let (engine, _runner, mut jobs) = test_engine(config);

    let ids: Vec<_> = (0..5)
        .map(|i| {
            engine
                .submit(
                    TestType::Stress,
                    json!({ "target_url": format!("https://example.com/{}", i) }),
                    SubmitOptions::default(),
                )
                .unwrap()
        })
        .collect();

    // exactly two jobs reach the runner
    let first = jobs.recv().await.unwrap();
    let _second = jobs.recv().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(jobs.try_recv().is_err(), "third job admitted early");

    wait_until(
        || engine.stats().executions.running == 2,
        "two running executions",
    )
    .await;
    assert_eq!(engine.stats().executions.pending, 3);
    assert_eq!(engine.stats().queue_depth, 3);

    // queued executions expose their position
    assert_eq!(engine.queue_position(ids[2]), Some(0));
    assert_eq!(engine.queue_position(ids[3]), Some(1));
    assert_eq!(engine.queue_position(ids[4]), Some(2));

    // finishing one admits exactly one more, FIFO
    first.complete(json!(null));
    let third = jobs.recv().await.unwrap();
    assert_eq!(third.config, json!({ "target_url": "https://example.com/2" }));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(jobs.try_recv().is_err(), "more than one admission");
    assert_eq!(engine.stats().queue_depth, 2);
}

#[tokio::test]
async fn test_priority_dequeues_before_fifo() {
    let config = EngineConfig {
        max_concurrent: Some(1),
        ..Default::default()
    };
    let (engine, _runner, mut jobs) = test_engine(config);

    engine
        .submit(TestType::Seo, seo_config("blocker"), submit_opts(0))
        .unwrap();
    let blocker = jobs.recv().await.unwrap();

    engine
        .submit(TestType::Seo, seo_config("low-a"), submit_opts(0))
        .unwrap();
    engine
        .submit(TestType::Seo, seo_config("high"), submit_opts(5))
        .unwrap();
    engine
        .submit(TestType::Seo, seo_config("low-b"), submit_opts(0))
        .unwrap();

    blocker.complete(json!(null));
    let next = jobs.recv().await.unwrap();
    assert_eq!(next.config, seo_config("high"));

    next.complete(json!(null));
    let next = jobs.recv().await.unwrap();
    assert_eq!(next.config, seo_config("low-a"));

    next.complete(json!(null));
    let next = jobs.recv().await.unwrap();
    assert_eq!(next.config, seo_config("low-b"));
}

#[tokio::test]
async fn test_cancel_running_is_idempotent_and_reaches_the_runner() {
    let (engine, runner, mut jobs) = test_engine(EngineConfig::default());

    let id = engine
        .submit(TestType::Performance, seo_config("cancel-me"), SubmitOptions::default())
        .unwrap();
    let job = jobs.recv().await.unwrap();
    wait_for_status(&engine, id, ExecutionStatus::Running).await;

    assert!(engine.cancel(id));
    let exec = engine.get_status(id).unwrap();
    assert_eq!(exec.status, ExecutionStatus::Cancelled);
    assert!(exec.ended_at.is_some());
    assert!(exec.result.is_none());
    assert!(exec.error.is_none());

    // second cancel is a no-op, never an error
    assert!(!engine.cancel(id));

    // the abort propagates to the runner
    let remote = job.remote_id.clone();
    wait_until(
        || runner.cancelled_ids().contains(&remote),
        "backend cancel call",
    )
    .await;

    // late events for the cancelled id are silently discarded
    let ended_at = exec.ended_at;
    let _ = job.events.send(Ok(sitemedic::backend::RunnerEvent::Completed {
        result: json!({ "late": true }),
    }));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let after = engine.get_status(id).unwrap();
    assert_eq!(after.status, ExecutionStatus::Cancelled);
    assert_eq!(after.ended_at, ended_at);
    assert!(after.result.is_none());
}

#[tokio::test]
async fn test_cancel_queued_never_engages_transport() {
    let config = EngineConfig {
        max_concurrent: Some(1),
        ..Default::default()
    };
    let (engine, runner, mut jobs) = test_engine(config);

    engine
        .submit(TestType::Seo, seo_config("runs"), SubmitOptions::default())
        .unwrap();
    let running = jobs.recv().await.unwrap();

    let queued = engine
        .submit(TestType::Seo, seo_config("waits"), SubmitOptions::default())
        .unwrap();
    assert_eq!(engine.queue_position(queued), Some(0));

    assert!(engine.cancel(queued));
    assert_eq!(
        engine.get_status(queued).unwrap().status,
        ExecutionStatus::Cancelled
    );
    assert_eq!(engine.stats().queue_depth, 0);
    assert!(runner.cancelled_ids().is_empty());

    // finishing the running one must not resurrect the cancelled waiter
    running.complete(json!(null));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(jobs.try_recv().is_err());
}

#[tokio::test]
async fn test_two_observers_see_the_same_ordered_events() {
    let (engine, _runner, mut jobs) = test_engine(EngineConfig::default());

    let id = engine
        .submit(TestType::Seo, seo_config("observed"), SubmitOptions::default())
        .unwrap();
    let job = jobs.recv().await.unwrap();
    wait_for_status(&engine, id, ExecutionStatus::Running).await;

    fn recording(
        log: Arc<Mutex<Vec<String>>>,
    ) -> (
        sitemedic::engine::bus::ObserverFn,
        sitemedic::engine::bus::ObserverFn,
        sitemedic::engine::bus::ObserverFn,
    ) {
        let progress_log = log.clone();
        let complete_log = log.clone();
        (
            Box::new(move |e| progress_log.lock().unwrap().push(format!("p{}", e.progress))),
            Box::new(move |_| complete_log.lock().unwrap().push("done".to_string())),
            Box::new(move |_| log.lock().unwrap().push("err".to_string())),
        )
    }

    let log_a = Arc::new(Mutex::new(Vec::new()));
    let log_b = Arc::new(Mutex::new(Vec::new()));
    let (pa, ca, ea) = recording(log_a.clone());
    let (pb, cb, eb) = recording(log_b.clone());
    let sub_a = engine.subscribe(id, pa, ca, ea).unwrap();
    let _sub_b = engine.subscribe(id, pb, cb, eb).unwrap();

    job.progress(10, "warmup");
    job.progress(60, "load");
    wait_until(
        || log_b.lock().unwrap().len() >= 3, // replay + two progress events
        "observer B to see three events",
    )
    .await;

    // both observers saw the same relative order
    assert_eq!(*log_a.lock().unwrap(), *log_b.lock().unwrap());

    // one unsubscribing does not affect the other
    sub_a.unsubscribe();
    job.complete(json!(null));
    wait_until(
        || log_b.lock().unwrap().last() == Some(&"done".to_string()),
        "observer B terminal event",
    )
    .await;
    assert!(!log_a.lock().unwrap().contains(&"done".to_string()));
}

#[tokio::test]
async fn test_late_subscriber_immediately_sees_the_outcome() {
    let (engine, _runner, mut jobs) = test_engine(EngineConfig::default());

    let id = engine
        .submit(TestType::Seo, seo_config("finished"), SubmitOptions::default())
        .unwrap();
    jobs.recv().await.unwrap().complete(json!({ "score": 75 }));
    wait_for_status(&engine, id, ExecutionStatus::Completed).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let on_complete = seen.clone();
    let _sub = engine
        .subscribe(
            id,
            Box::new(|_| panic!("no progress expected after completion")),
            Box::new(move |e| on_complete.lock().unwrap().push(e.status)),
            Box::new(|_| panic!("no error expected")),
        )
        .unwrap();

    // replay is synchronous
    assert_eq!(*seen.lock().unwrap(), vec![ExecutionStatus::Completed]);
}

#[tokio::test]
async fn test_runner_failure_surfaces_via_on_error_exactly_once() {
    let (engine, _runner, mut jobs) = test_engine(EngineConfig::default());

    let id = engine
        .submit(TestType::Security, seo_config("doomed"), SubmitOptions::default())
        .unwrap();
    let job = jobs.recv().await.unwrap();
    wait_for_status(&engine, id, ExecutionStatus::Running).await;

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let _sub = engine
        .subscribe(
            id,
            Box::new(|_| {}),
            Box::new(|_| {}),
            Box::new(move |e| sink.lock().unwrap().push(e.error.clone())),
        )
        .unwrap();

    job.fail("tls handshake rejected");
    wait_for_status(&engine, id, ExecutionStatus::Failed).await;

    let exec = engine.get_status(id).unwrap();
    let failure = exec.error.expect("failure recorded");
    assert_eq!(failure.kind, FailureKind::Execution);
    assert!(failure.message.contains("tls handshake"));
    assert!(exec.result.is_none());

    // delivered once, not re-delivered on later noise
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_start_timeout_marks_the_execution_failed() {
    let (engine, runner, _jobs) = test_engine(EngineConfig::default());
    runner.hang_submits();

    let id = engine
        .submit(
            TestType::Seo,
            seo_config("stuck"),
            SubmitOptions {
                start_timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        )
        .unwrap();

    wait_for_status(&engine, id, ExecutionStatus::Failed).await;
    let failure = engine.get_status(id).unwrap().error.unwrap();
    assert_eq!(failure.kind, FailureKind::Timeout);
}

#[tokio::test]
async fn test_stale_progress_is_discarded_and_retry_resets() {
    let (engine, _runner, mut jobs) = test_engine(EngineConfig::default());

    let id = engine
        .submit(TestType::Seo, seo_config("monotonic"), SubmitOptions::default())
        .unwrap();
    let job = jobs.recv().await.unwrap();
    wait_for_status(&engine, id, ExecutionStatus::Running).await;

    job.progress(70, "deep-crawl");
    wait_until(
        || engine.get_status(id).map(|e| e.progress) == Some(70),
        "progress 70",
    )
    .await;

    // duplicate/out-of-order frame: lower value, same attempt
    job.progress(30, "deep-crawl");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.get_status(id).unwrap().progress, 70);

    // a fresh retry resets progress
    job.events
        .send(Ok(sitemedic::backend::RunnerEvent::Progress {
            percent: 0,
            step: Some("retrying".to_string()),
            retry: 1,
        }))
        .unwrap();
    wait_until(
        || {
            engine
                .get_status(id)
                .map(|e| e.progress == 0 && e.retry_count == 1)
                .unwrap_or(false)
        },
        "retry reset",
    )
    .await;
}

#[tokio::test]
async fn test_poll_fallback_finishes_the_job_after_channel_loss() {
    let (engine, runner, mut jobs) = test_engine(EngineConfig::default());

    let id = engine
        .submit(TestType::Seo, seo_config("flaky-channel"), SubmitOptions::default())
        .unwrap();
    let job = jobs.recv().await.unwrap();
    wait_for_status(&engine, id, ExecutionStatus::Running).await;

    // the poll path will see a completed snapshot
    runner.set_snapshot(
        &job.remote_id,
        serde_json::from_value(json!({
            "status": "completed",
            "result": { "score": 64 }
        }))
        .unwrap(),
    );

    // kill the push channel; the adapter must fall back to polling
    drop(job);

    wait_for_status(&engine, id, ExecutionStatus::Completed).await;
    assert_eq!(
        engine.get_status(id).unwrap().result,
        Some(json!({ "score": 64 }))
    );
}

#[tokio::test]
async fn test_clear_completed_only_sweeps_terminal_records() {
    let (engine, _runner, mut jobs) = test_engine(EngineConfig::default());

    let done = engine
        .submit(TestType::Seo, seo_config("done"), SubmitOptions::default())
        .unwrap();
    jobs.recv().await.unwrap().complete(json!(null));
    wait_for_status(&engine, done, ExecutionStatus::Completed).await;

    let live = engine
        .submit(TestType::Seo, seo_config("live"), SubmitOptions::default())
        .unwrap();
    jobs.recv().await.unwrap();
    wait_for_status(&engine, live, ExecutionStatus::Running).await;

    assert_eq!(engine.clear_completed(), 1);
    assert!(engine.get_status(done).is_none());
    assert!(engine.get_status(live).is_some());
}
