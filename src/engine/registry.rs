//! Execution registry -- the single source of truth for what is running
//! or finished, and the state machine that guards every mutation.
//!
//! All inbound events pass through [`ExecutionRegistry::apply`], which
//! performs the check-then-set atomically under one lock acquisition.
//! Late or duplicate events for terminal executions are silently dropped.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::model::{ExecutionEvent, ExecutionStatus, TestExecution};

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Process-wide map from execution id to record.
///
/// Constructed once per engine instance and shared by reference; tests get
/// isolated registries by building isolated engines.
pub struct ExecutionRegistry {
    inner: Mutex<HashMap<Uuid, TestExecution>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, exec: TestExecution) {
        self.inner.lock().unwrap().insert(exec.id, exec);
    }

    pub fn get(&self, id: Uuid) -> Option<TestExecution> {
        self.inner.lock().unwrap().get(&id).cloned()
    }

    pub fn list_active(&self) -> Vec<TestExecution> {
        let mut active: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .values()
            .filter(|e| !e.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|e| e.submitted_at);
        active
    }

    pub fn list_results(&self) -> Vec<TestExecution> {
        let mut results: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.status.is_terminal())
            .cloned()
            .collect();
        results.sort_by_key(|e| e.ended_at);
        results
    }

    /// Remove all terminal records. Pending/running records are untouched.
    pub fn clear_completed(&self) -> usize {
        let mut map = self.inner.lock().unwrap();
        let before = map.len();
        map.retain(|_, e| !e.status.is_terminal());
        before - map.len()
    }

    pub fn counts(&self) -> StatusCounts {
        let map = self.inner.lock().unwrap();
        let mut counts = StatusCounts::default();
        for exec in map.values() {
            match exec.status {
                ExecutionStatus::Pending => counts.pending += 1,
                ExecutionStatus::Running => counts.running += 1,
                ExecutionStatus::Completed => counts.completed += 1,
                ExecutionStatus::Failed => counts.failed += 1,
                ExecutionStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// Validate an event against the state machine and apply it.
    ///
    /// Returns the updated record when the event was accepted, `None` when
    /// it was discarded (unknown id, terminal record, or stale progress).
    pub fn apply(&self, id: Uuid, event: ExecutionEvent) -> Option<TestExecution> {
        let mut map = self.inner.lock().unwrap();
        let exec = match map.get_mut(&id) {
            Some(e) => e,
            None => {
                debug!(execution = %id, "event for unknown execution discarded");
                return None;
            }
        };

        if exec.status.is_terminal() {
            debug!(execution = %id, status = %exec.status, "late event for terminal execution discarded");
            return None;
        }

        match event {
            ExecutionEvent::Started { step } => {
                if exec.status != ExecutionStatus::Pending {
                    return None;
                }
                exec.status = ExecutionStatus::Running;
                exec.started_at = Some(Utc::now());
                exec.current_step = step;
            }
            ExecutionEvent::Progress { percent, step, retry } => {
                // First progress for a queued record implies the runner
                // started it.
                if exec.status == ExecutionStatus::Pending {
                    exec.status = ExecutionStatus::Running;
                    exec.started_at = Some(Utc::now());
                }
                let percent = percent.min(100);
                if retry > exec.retry_count {
                    // Fresh attempt: progress restarts.
                    exec.retry_count = retry;
                    exec.progress = percent;
                } else if percent < exec.progress {
                    debug!(execution = %id, percent, recorded = exec.progress, "stale progress discarded");
                    return None;
                } else {
                    exec.progress = percent;
                }
                exec.current_step = step;
            }
            ExecutionEvent::Completed { result } => {
                exec.status = ExecutionStatus::Completed;
                exec.progress = 100;
                exec.ended_at = Some(Utc::now());
                exec.result = Some(result);
            }
            ExecutionEvent::Failed { failure } => {
                exec.status = ExecutionStatus::Failed;
                exec.ended_at = Some(Utc::now());
                exec.error = Some(failure);
            }
            ExecutionEvent::Cancelled => {
                exec.status = ExecutionStatus::Cancelled;
                exec.ended_at = Some(Utc::now());
            }
        }

        Some(exec.clone())
    }
}

impl Default for ExecutionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
