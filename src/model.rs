//! Core data model -- test types, execution records, and inbound events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kinds of website quality tests the runner backend knows how to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    Stress,
    Security,
    Api,
    Performance,
    Seo,
    Compatibility,
}

impl std::fmt::Display for TestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestType::Stress => write!(f, "stress"),
            TestType::Security => write!(f, "security"),
            TestType::Api => write!(f, "api"),
            TestType::Performance => write!(f, "performance"),
            TestType::Seo => write!(f, "seo"),
            TestType::Compatibility => write!(f, "compatibility"),
        }
    }
}

impl std::str::FromStr for TestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stress" => Ok(TestType::Stress),
            "security" => Ok(TestType::Security),
            "api" => Ok(TestType::Api),
            "performance" => Ok(TestType::Performance),
            "seo" => Ok(TestType::Seo),
            "compatibility" => Ok(TestType::Compatibility),
            other => Err(format!("unknown test type '{}'", other)),
        }
    }
}

/// Lifecycle state of an execution.
///
/// Legal transitions: pending -> running -> {completed | failed | cancelled},
/// plus pending -> cancelled (cancel while still queued). Terminal states
/// are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "pending"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Classification of a terminal failure, recorded on the execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// The runner reported the test itself failed.
    Execution,
    /// No running transition (or no progress) within the allowed window.
    Timeout,
    /// Channel/poll failures exhausted the retry budget.
    Transport,
}

/// Structured error payload present only on `failed` executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ExecutionFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// One attempted run of a test, tracked end-to-end by the engine.
///
/// The registry owns these records for their entire lifetime; they are
/// removed only by an explicit clear-completed sweep.
#[derive(Debug, Clone, Serialize)]
pub struct TestExecution {
    pub id: Uuid,
    pub test_type: TestType,
    /// Opaque configuration payload. Validated at the submit boundary,
    /// never reinterpreted by the engine.
    pub config: serde_json::Value,
    pub status: ExecutionStatus,
    /// 0-100, monotonically non-decreasing while running. Meaningless once
    /// the status is terminal.
    pub progress: u8,
    pub current_step: String,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<ExecutionFailure>,
    pub retry_count: u32,
    pub priority: i32,
    pub tags: Vec<String>,
}

impl TestExecution {
    pub fn new(test_type: TestType, config: serde_json::Value, priority: i32, tags: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            test_type,
            config,
            status: ExecutionStatus::Pending,
            progress: 0,
            current_step: "queued".to_string(),
            submitted_at: Utc::now(),
            started_at: None,
            ended_at: None,
            result: None,
            error: None,
            retry_count: 0,
            priority,
            tags,
        }
    }
}

/// A validated inbound event for one execution.
///
/// Produced by the transport layer (push frame or poll snapshot diff) and
/// by the engine itself (cancel, timeout). The registry is the only place
/// these are applied to state.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// The runner acknowledged the job; pending -> running.
    Started { step: String },
    /// Progress while running. A percent below the recorded value is stale
    /// unless `retry` is higher than the recorded retry count, in which
    /// case progress restarts from that value.
    Progress { percent: u8, step: String, retry: u32 },
    Completed { result: serde_json::Value },
    Failed { failure: ExecutionFailure },
    Cancelled,
}
