//! Error taxonomy for the orchestration engine.

use uuid::Uuid;

use crate::model::TestType;

/// Errors surfaced by the engine's public operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Bad config, rejected synchronously before anything is queued or sent.
    #[error("invalid {test_type} config: {reason}")]
    Validation { test_type: TestType, reason: String },

    /// The execution id is not (or no longer) in the registry.
    #[error("unknown execution {0}")]
    UnknownExecution(Uuid),
}

/// Channel or poll failure between this process and the runner backend.
///
/// Handled inside the transport layer (reconnect, fallback, backoff) and
/// escalated onto the owning execution only once the retry budget is gone.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("event channel closed")]
    ChannelClosed,

    #[error("malformed frame: {0}")]
    Decode(String),

    #[error("runner rejected submission: {0}")]
    Rejected(String),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl TransportError {
    /// Whether the transport layer should keep retrying after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Rejected(_) | TransportError::Exhausted { .. })
    }
}
