//! Runner backend boundary.
//!
//! The engine consumes, but does not implement, the test runner: a job
//! submission endpoint, a per-execution event source (push channel or
//! pollable status), and a cancellation endpoint. Everything behind this
//! trait is someone else's service.

pub mod http;

use std::pin::Pin;

use futures::Stream;
use serde::Deserialize;
use serde_json::Value;

use crate::error::TransportError;
use crate::model::TestType;

pub use self::http::HttpRunnerBackend;

/// A raw event frame from the runner, before state-machine validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerEvent {
    Started {
        #[serde(default)]
        step: Option<String>,
    },
    Progress {
        percent: u8,
        #[serde(default)]
        step: Option<String>,
        #[serde(default)]
        retry: u32,
    },
    Completed {
        result: Value,
    },
    Failed {
        message: String,
    },
}

/// Pollable status snapshot, the same `TestExecution`-shaped payload the
/// push channel describes incrementally.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusSnapshot {
    pub status: RemoteStatus,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub step: Option<String>,
    #[serde(default)]
    pub retry: u32,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl StatusSnapshot {
    /// Flatten a snapshot into the event it implies.
    pub fn into_event(self) -> RunnerEvent {
        match self.status {
            RemoteStatus::Queued | RemoteStatus::Running => RunnerEvent::Progress {
                percent: self.progress,
                step: self.step,
                retry: self.retry,
            },
            RemoteStatus::Completed => RunnerEvent::Completed {
                result: self.result.unwrap_or(Value::Null),
            },
            RemoteStatus::Failed => RunnerEvent::Failed {
                message: self.error.unwrap_or_else(|| "runner reported failure".to_string()),
            },
        }
    }
}

/// Boxed stream of push-channel frames for one execution.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<RunnerEvent, TransportError>> + Send>>;

/// Client side of the runner service.
#[async_trait::async_trait]
pub trait RunnerBackend: Send + Sync {
    /// Submit a job; returns the runner's id for it.
    async fn submit(&self, test_type: TestType, config: &Value) -> Result<String, TransportError>;

    /// Request cancellation of a running job. Best effort.
    async fn cancel(&self, remote_id: &str) -> Result<(), TransportError>;

    /// Fetch the current status snapshot (poll fallback path).
    async fn fetch_status(&self, remote_id: &str) -> Result<StatusSnapshot, TransportError>;

    /// Open the push event channel for a job.
    async fn open_events(&self, remote_id: &str) -> Result<EventStream, TransportError>;
}
