//! Shared test harness: a scriptable in-process runner backend.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use sitemedic::backend::{EventStream, RunnerBackend, RunnerEvent, StatusSnapshot};
use sitemedic::config::{Config, EngineConfig};
use sitemedic::engine::Orchestrator;
use sitemedic::error::TransportError;
use sitemedic::model::{ExecutionStatus, TestType};

/// One job the engine submitted to the mock runner. The test drives it by
/// sending frames (or transport errors) through `events`.
pub struct Job {
    pub remote_id: String,
    pub test_type: TestType,
    pub config: Value,
    pub events: UnboundedSender<Result<RunnerEvent, TransportError>>,
}

impl Job {
    pub fn progress(&self, percent: u8, step: &str) {
        self.events
            .send(Ok(RunnerEvent::Progress {
                percent,
                step: Some(step.to_string()),
                retry: 0,
            }))
            .unwrap();
    }

    pub fn complete(&self, result: Value) {
        self.events
            .send(Ok(RunnerEvent::Completed { result }))
            .unwrap();
    }

    pub fn fail(&self, message: &str) {
        self.events
            .send(Ok(RunnerEvent::Failed {
                message: message.to_string(),
            }))
            .unwrap();
    }
}

#[derive(Default)]
struct RunnerState {
    counter: u64,
    pending_streams: HashMap<String, UnboundedReceiver<Result<RunnerEvent, TransportError>>>,
    snapshots: HashMap<String, StatusSnapshot>,
    cancelled: Vec<String>,
}

/// In-process runner. Each submit hands the test a [`Job`] through the
/// channel passed to [`MockRunner::new`].
pub struct MockRunner {
    state: Mutex<RunnerState>,
    jobs: UnboundedSender<Job>,
    hang_submits: AtomicBool,
}

impl MockRunner {
    pub fn new() -> (Arc<Self>, UnboundedReceiver<Job>) {
        let (jobs, rx) = unbounded_channel();
        (
            Arc::new(Self {
                state: Mutex::new(RunnerState::default()),
                jobs,
                hang_submits: AtomicBool::new(false),
            }),
            rx,
        )
    }

    /// Make every subsequent submit block forever (start-timeout tests).
    pub fn hang_submits(&self) {
        self.hang_submits.store(true, Ordering::SeqCst);
    }

    pub fn cancelled_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }

    /// Script the snapshot the poll fallback will see for a job.
    pub fn set_snapshot(&self, remote_id: &str, snapshot: StatusSnapshot) {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .insert(remote_id.to_string(), snapshot);
    }
}

#[async_trait::async_trait]
impl RunnerBackend for MockRunner {
    async fn submit(&self, test_type: TestType, config: &Value) -> Result<String, TransportError> {
        if self.hang_submits.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        let (events, stream_rx) = unbounded_channel();
        let remote_id = {
            let mut state = self.state.lock().unwrap();
            state.counter += 1;
            let remote_id = format!("job-{}", state.counter);
            state.pending_streams.insert(remote_id.clone(), stream_rx);
            remote_id
        };
        self.jobs
            .send(Job {
                remote_id: remote_id.clone(),
                test_type,
                config: config.clone(),
                events,
            })
            .map_err(|_| TransportError::Connect("job sink closed".to_string()))?;
        Ok(remote_id)
    }

    async fn cancel(&self, remote_id: &str) -> Result<(), TransportError> {
        self.state
            .lock()
            .unwrap()
            .cancelled
            .push(remote_id.to_string());
        Ok(())
    }

    async fn fetch_status(&self, remote_id: &str) -> Result<StatusSnapshot, TransportError> {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .get(remote_id)
            .cloned()
            .ok_or_else(|| TransportError::Request("no snapshot scripted".to_string()))
    }

    async fn open_events(&self, remote_id: &str) -> Result<EventStream, TransportError> {
        let rx = self
            .state
            .lock()
            .unwrap()
            .pending_streams
            .remove(remote_id)
            .ok_or(TransportError::ChannelClosed)?;
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Box::pin(stream))
    }
}

/// Engine wired to a mock runner, with fast transport tuning for tests.
pub fn test_engine(engine_config: EngineConfig) -> (Orchestrator, Arc<MockRunner>, UnboundedReceiver<Job>) {
    let (runner, jobs) = MockRunner::new();
    let mut config = Config::default();
    config.engine = engine_config;
    config.transport.poll_interval_ms = 20;
    config.transport.backoff_base_ms = 5;
    config.transport.backoff_cap_ms = 50;
    let engine = Orchestrator::new(
        runner.clone(),
        &config.engine,
        &config.transport,
        &config.retry,
    );
    (engine, runner, jobs)
}

/// Poll until `check` passes or the deadline hits.
pub async fn wait_until<F: Fn() -> bool>(check: F, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait for an execution to reach `status`.
pub async fn wait_for_status(engine: &Orchestrator, id: uuid::Uuid, status: ExecutionStatus) {
    wait_until(
        || engine.get_status(id).map(|e| e.status) == Some(status),
        &format!("execution {} to reach {}", id, status),
    )
    .await;
}
