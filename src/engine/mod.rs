//! Orchestration engine -- the public entry point for submitting,
//! tracking, cancelling, and observing test executions.
//!
//! The engine coordinates the execution registry, the subscription bus,
//! the admission controller, and the transport layer. One spawned drive
//! task owns each admitted execution from backend submission to terminal
//! state; every state change flows through the registry's validation and
//! is fanned out to subscribers.

pub mod admission;
pub mod bus;
pub mod registry;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{RunnerBackend, RunnerEvent};
use crate::config::{EngineConfig, RetryPolicy, TransportConfig};
use crate::error::{EngineError, TransportError};
use crate::model::{
    ExecutionEvent, ExecutionFailure, FailureKind, TestExecution, TestType,
};
use crate::transport::backoff::Backoff;
use crate::transport::{HealthView, TransportAdapter};
use crate::validate::validate_config;

use self::admission::{Admission, AdmissionController, ConcurrencyLimits};
use self::bus::{ObserverFn, Subscription, SubscriptionBus};
use self::registry::{ExecutionRegistry, StatusCounts};

/// Caller-facing submit options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Queue ordering hint; higher values dequeue first.
    pub priority: i32,
    pub tags: Vec<String>,
    /// Overrides the configured wait for the running transition.
    pub start_timeout: Option<Duration>,
}

/// Read-only statistics view, computed from the registry and admission
/// controller rather than stored separately.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStats {
    pub executions: StatusCounts,
    pub queue_depth: usize,
    pub connection: HealthView,
}

struct DriveControl {
    token: CancellationToken,
    start_timeout: Duration,
}

enum AttemptOutcome {
    Completed,
    Cancelled,
    Failed(ExecutionFailure),
}

struct EngineInner {
    registry: ExecutionRegistry,
    bus: Arc<SubscriptionBus>,
    admission: AdmissionController,
    transport: TransportAdapter,
    backend: Arc<dyn RunnerBackend>,
    transport_config: TransportConfig,
    retry: RetryPolicy,
    default_start_timeout: Duration,
    controls: Mutex<HashMap<Uuid, DriveControl>>,
}

/// Cloneable handle to one engine instance.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<EngineInner>,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn RunnerBackend>,
        engine: &EngineConfig,
        transport: &TransportConfig,
        retry: &RetryPolicy,
    ) -> Self {
        let limits = ConcurrencyLimits {
            global: engine.max_concurrent,
            per_type: engine.max_concurrent_per_type.clone(),
        };
        Self {
            inner: Arc::new(EngineInner {
                registry: ExecutionRegistry::new(),
                bus: Arc::new(SubscriptionBus::new()),
                admission: AdmissionController::new(limits),
                transport: TransportAdapter::new(backend.clone(), transport.clone()),
                backend,
                transport_config: transport.clone(),
                retry: retry.clone(),
                default_start_timeout: engine.start_timeout(),
                controls: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Submit a test for execution.
    ///
    /// Config validation happens here, synchronously, before any queue or
    /// network interaction. On success the returned id refers to a
    /// `pending` record; the actual start happens asynchronously once the
    /// admission controller grants a slot.
    pub fn submit(
        &self,
        test_type: TestType,
        config: Value,
        options: SubmitOptions,
    ) -> Result<Uuid, EngineError> {
        validate_config(test_type, &config)?;

        let exec = TestExecution::new(test_type, config, options.priority, options.tags);
        let id = exec.id;
        self.inner.registry.insert(exec);
        self.inner.controls.lock().unwrap().insert(
            id,
            DriveControl {
                token: CancellationToken::new(),
                start_timeout: options.start_timeout.unwrap_or(self.inner.default_start_timeout),
            },
        );

        match self.inner.admission.try_admit(id, test_type, options.priority) {
            Admission::Admitted => {
                debug!(execution = %id, %test_type, "admitted");
                self.spawn_drive(id, test_type);
            }
            Admission::Queued { position } => {
                info!(execution = %id, %test_type, position, "queued, no free slot");
            }
        }
        Ok(id)
    }

    /// Request cancellation. Returns false for unknown or already-terminal
    /// executions; calling twice is safe.
    pub fn cancel(&self, id: Uuid) -> bool {
        let Some(exec) = self.inner.registry.get(id) else {
            return false;
        };
        if exec.status.is_terminal() {
            return false;
        }

        // A queued execution just leaves the queue; no transport was ever
        // engaged for it.
        let was_queued = self.inner.admission.remove_queued(id);

        let Some(snapshot) = self.inner.registry.apply(id, ExecutionEvent::Cancelled) else {
            return false;
        };
        self.inner.bus.notify(&snapshot);

        if let Some(control) = self.inner.controls.lock().unwrap().remove(&id) {
            // The drive task aborts its transport work and releases the
            // slot; for queued items there is no drive task to wake.
            control.token.cancel();
        }
        info!(execution = %id, was_queued, "cancelled");
        true
    }

    /// Pure registry read; never touches the network.
    pub fn get_status(&self, id: Uuid) -> Option<TestExecution> {
        self.inner.registry.get(id)
    }

    pub fn list_active(&self) -> Vec<TestExecution> {
        self.inner.registry.list_active()
    }

    pub fn list_results(&self) -> Vec<TestExecution> {
        self.inner.registry.list_results()
    }

    /// Sweep terminal records out of the registry.
    pub fn clear_completed(&self) -> usize {
        self.inner.registry.clear_completed()
    }

    /// Queue position hint for a pending, not-yet-admitted execution.
    pub fn queue_position(&self, id: Uuid) -> Option<usize> {
        self.inner.admission.queue_position(id)
    }

    /// Register an observer. The current state is delivered immediately,
    /// so a subscriber arriving after completion still sees the outcome.
    pub fn subscribe(
        &self,
        id: Uuid,
        on_progress: ObserverFn,
        on_complete: ObserverFn,
        on_error: ObserverFn,
    ) -> Result<Subscription, EngineError> {
        // Register before reading so nothing emitted in between is lost.
        let subscription = self
            .inner
            .bus
            .subscribe(id, on_progress, on_complete, on_error);
        match self.inner.registry.get(id) {
            Some(current) => {
                self.inner.bus.replay_to(&subscription, &current);
                Ok(subscription)
            }
            None => {
                subscription.unsubscribe();
                Err(EngineError::UnknownExecution(id))
            }
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            executions: self.inner.registry.counts(),
            queue_depth: self.inner.admission.stats().queue_depth,
            connection: self.inner.transport.health().view(),
        }
    }

    fn apply_event(&self, id: Uuid, event: ExecutionEvent) {
        if let Some(snapshot) = self.inner.registry.apply(id, event) {
            self.inner.bus.notify(&snapshot);
        }
    }

    fn spawn_drive(&self, id: Uuid, test_type: TestType) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.drive(id, test_type).await;
        });
    }

    /// Own one admitted execution until it is terminal, then free its slot
    /// and admit the next eligible waiters.
    async fn drive(self, id: Uuid, test_type: TestType) {
        let Some(exec) = self.inner.registry.get(id) else {
            warn!(execution = %id, "admitted execution vanished from registry");
            self.finish(test_type);
            return;
        };

        if exec.status.is_terminal() {
            // Cancelled between admission and task start.
            self.finish(test_type);
            return;
        }

        let Some((token, start_timeout)) = self
            .inner
            .controls
            .lock()
            .unwrap()
            .get(&id)
            .map(|c| (c.token.clone(), c.start_timeout))
        else {
            self.finish(test_type);
            return;
        };

        let config = exec.config.clone();
        let mut outcome = self
            .run_attempt(id, test_type, &config, &token, start_timeout)
            .await;

        let mut retries = 0u32;
        while let AttemptOutcome::Failed(failure) = &outcome {
            if !self.inner.retry.auto || retries >= self.inner.retry.max_retries {
                break;
            }
            retries += 1;
            warn!(execution = %id, attempt = retries, kind = ?failure.kind, "retrying execution");

            let retry_count = self
                .inner
                .registry
                .get(id)
                .map(|e| e.retry_count)
                .unwrap_or(0);
            self.apply_event(
                id,
                ExecutionEvent::Progress {
                    percent: 0,
                    step: "retrying".to_string(),
                    retry: retry_count + 1,
                },
            );

            if token.is_cancelled() {
                outcome = AttemptOutcome::Cancelled;
                break;
            }
            outcome = self
                .run_attempt(id, test_type, &config, &token, start_timeout)
                .await;
        }

        if let AttemptOutcome::Failed(failure) = outcome {
            self.apply_event(id, ExecutionEvent::Failed { failure });
        }

        self.inner.controls.lock().unwrap().remove(&id);
        self.finish(test_type);
    }

    /// One full attempt: backend submission, running transition, event
    /// stream until terminal.
    async fn run_attempt(
        &self,
        id: Uuid,
        test_type: TestType,
        config: &Value,
        token: &CancellationToken,
        start_timeout: Duration,
    ) -> AttemptOutcome {
        let submit = self.submit_with_retries(test_type, config);
        let remote_id = tokio::select! {
            _ = token.cancelled() => return AttemptOutcome::Cancelled,
            result = tokio::time::timeout(start_timeout, submit) => match result {
                Err(_) => {
                    return AttemptOutcome::Failed(ExecutionFailure::new(
                        FailureKind::Timeout,
                        format!("no running transition within {}s", start_timeout.as_secs()),
                    ));
                }
                Ok(Err(TransportError::Rejected(message))) => {
                    return AttemptOutcome::Failed(ExecutionFailure::new(FailureKind::Execution, message));
                }
                Ok(Err(e)) => {
                    return AttemptOutcome::Failed(ExecutionFailure::new(FailureKind::Transport, e.to_string()));
                }
                Ok(Ok(remote_id)) => remote_id,
            },
        };

        self.apply_event(id, ExecutionEvent::Started { step: "starting".to_string() });

        let mut channel = self.inner.transport.open(&remote_id);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    if let Err(e) = self.inner.backend.cancel(&remote_id).await {
                        debug!(execution = %id, error = %e, "backend cancel failed");
                    }
                    return AttemptOutcome::Cancelled;
                }
                event = channel.next_event() => match event {
                    Ok(RunnerEvent::Started { step }) => {
                        self.apply_event(
                            id,
                            ExecutionEvent::Started {
                                step: step.unwrap_or_else(|| "starting".to_string()),
                            },
                        );
                    }
                    Ok(RunnerEvent::Progress { percent, step, retry }) => {
                        self.apply_event(
                            id,
                            ExecutionEvent::Progress {
                                percent,
                                step: step.unwrap_or_else(|| "running".to_string()),
                                retry,
                            },
                        );
                    }
                    Ok(RunnerEvent::Completed { result }) => {
                        self.apply_event(id, ExecutionEvent::Completed { result });
                        return AttemptOutcome::Completed;
                    }
                    Ok(RunnerEvent::Failed { message }) => {
                        return AttemptOutcome::Failed(ExecutionFailure::new(FailureKind::Execution, message));
                    }
                    Err(e) => {
                        return AttemptOutcome::Failed(ExecutionFailure::new(FailureKind::Transport, e.to_string()));
                    }
                },
            }
        }
    }

    /// Backend submission with its own bounded backoff; the overall wait
    /// is capped by the caller's start timeout.
    async fn submit_with_retries(
        &self,
        test_type: TestType,
        config: &Value,
    ) -> Result<String, TransportError> {
        let mut backoff = Backoff::new(
            Duration::from_millis(self.inner.transport_config.backoff_base_ms),
            Duration::from_millis(self.inner.transport_config.backoff_cap_ms),
        );
        let mut attempts = 0u32;
        loop {
            match self.inner.backend.submit(test_type, config).await {
                Ok(remote_id) => return Ok(remote_id),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.inner.transport_config.max_attempts {
                        return Err(TransportError::Exhausted {
                            attempts,
                            last: e.to_string(),
                        });
                    }
                    debug!(%test_type, attempts, error = %e, "submission failed, backing off");
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
    }

    /// Free the finished execution's slot and start everything the
    /// admission controller now allows.
    fn finish(&self, test_type: TestType) {
        let admitted = self.inner.admission.release(test_type);
        for item in admitted {
            info!(execution = %item.id, test_type = %item.test_type, "admitted from queue");
            self.spawn_drive(item.id, item.test_type);
        }
    }
}
