//! Polling strategy: fixed-interval status fetches while the push channel
//! is unavailable. Snapshots are flattened into events; the registry's
//! state machine discards the duplicates polling inevitably produces.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::{RunnerBackend, RunnerEvent};
use crate::error::TransportError;

pub struct PollChannel {
    backend: Arc<dyn RunnerBackend>,
    remote_id: String,
    interval: Duration,
}

impl PollChannel {
    pub fn new(backend: Arc<dyn RunnerBackend>, remote_id: &str, interval: Duration) -> Self {
        Self {
            backend,
            remote_id: remote_id.to_string(),
            interval,
        }
    }

    /// Sleep one interval, then fetch and flatten the current snapshot.
    pub async fn next_event(&mut self) -> Result<RunnerEvent, TransportError> {
        tokio::time::sleep(self.interval).await;
        let snapshot = self.backend.fetch_status(&self.remote_id).await?;
        Ok(snapshot.into_event())
    }
}
