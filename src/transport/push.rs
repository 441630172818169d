//! Push-channel strategy: a persistent event stream from the runner.

use std::sync::Arc;

use futures::StreamExt;

use crate::backend::{EventStream, RunnerBackend, RunnerEvent};
use crate::error::TransportError;

pub struct PushChannel {
    stream: EventStream,
}

impl PushChannel {
    /// Open the push channel for one execution.
    pub async fn open(
        backend: &Arc<dyn RunnerBackend>,
        remote_id: &str,
    ) -> Result<Self, TransportError> {
        let stream = backend.open_events(remote_id).await?;
        Ok(Self { stream })
    }

    /// Next frame. `ChannelClosed` when the server ends the stream.
    pub async fn next_event(&mut self) -> Result<RunnerEvent, TransportError> {
        match self.stream.next().await {
            Some(Ok(ev)) => Ok(ev),
            Some(Err(e)) => Err(e),
            None => Err(TransportError::ChannelClosed),
        }
    }
}
