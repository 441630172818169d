//! Transport layer -- delivers runner events to the engine regardless of
//! mechanism.
//!
//! Preferred mode is the persistent push channel; on channel loss the
//! adapter falls back to interval polling and keeps attempting a push
//! reconnect with bounded exponential backoff. While disconnected, the
//! last known execution state is kept and reported as stale, never
//! invalidated.

pub mod backoff;
pub mod poll;
pub mod push;

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::{RunnerBackend, RunnerEvent};
use crate::config::TransportConfig;
use crate::error::TransportError;

use self::backoff::Backoff;
use self::poll::PollChannel;
use self::push::PushChannel;

/// How updates currently reach this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Push channel healthy.
    Push,
    /// Push channel down, polling the status endpoint.
    Polling,
    /// Neither path is currently delivering events.
    Reconnecting,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthView {
    pub status: ConnectionStatus,
    /// Set while no events are arriving; observers render "last updated T
    /// ago" off this rather than treating the state as invalid.
    pub stale_since: Option<DateTime<Utc>>,
}

/// Shared connection-health indicator, read by the stats view.
pub struct ConnectionHealth {
    inner: Mutex<HealthView>,
}

impl ConnectionHealth {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HealthView {
                status: ConnectionStatus::Push,
                stale_since: None,
            }),
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        let mut view = self.inner.lock().unwrap();
        view.status = status;
        match status {
            ConnectionStatus::Push | ConnectionStatus::Polling => view.stale_since = None,
            ConnectionStatus::Reconnecting => {
                if view.stale_since.is_none() {
                    view.stale_since = Some(Utc::now());
                }
            }
        }
    }

    pub fn view(&self) -> HealthView {
        self.inner.lock().unwrap().clone()
    }
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Factory for per-execution event channels, sharing one health indicator.
pub struct TransportAdapter {
    backend: Arc<dyn RunnerBackend>,
    config: TransportConfig,
    health: Arc<ConnectionHealth>,
}

impl TransportAdapter {
    pub fn new(backend: Arc<dyn RunnerBackend>, config: TransportConfig) -> Self {
        Self {
            backend,
            config,
            health: Arc::new(ConnectionHealth::new()),
        }
    }

    pub fn health(&self) -> Arc<ConnectionHealth> {
        self.health.clone()
    }

    pub fn open(&self, remote_id: &str) -> ExecutionChannel {
        ExecutionChannel {
            backend: self.backend.clone(),
            config: self.config.clone(),
            health: self.health.clone(),
            remote_id: remote_id.to_string(),
            mode: Mode::Connecting,
            backoff: Backoff::new(
                Duration::from_millis(self.config.backoff_base_ms),
                Duration::from_millis(self.config.backoff_cap_ms),
            ),
            failures: 0,
            last_error: None,
            retry_push_at: None,
        }
    }
}

enum Mode {
    Connecting,
    Push(PushChannel),
    Poll(PollChannel),
}

/// Event source for a single execution, switching between push and poll as
/// connection health dictates.
pub struct ExecutionChannel {
    backend: Arc<dyn RunnerBackend>,
    config: TransportConfig,
    health: Arc<ConnectionHealth>,
    remote_id: String,
    mode: Mode,
    backoff: Backoff,
    /// Consecutive failures with no event delivered on either path.
    failures: u32,
    last_error: Option<TransportError>,
    retry_push_at: Option<Instant>,
}

impl ExecutionChannel {
    /// Next validated-shape event for this execution.
    ///
    /// Handles push-channel loss, poll fallback, and reconnection
    /// internally; the only error it ever returns is `Exhausted`, once the
    /// per-execution retry budget is spent.
    pub async fn next_event(&mut self) -> Result<RunnerEvent, TransportError> {
        loop {
            // While polling, periodically try to restore the push channel.
            if matches!(self.mode, Mode::Poll(_)) && self.push_retry_due() {
                match PushChannel::open(&self.backend, &self.remote_id).await {
                    Ok(restored) => {
                        self.on_push_connected();
                        self.mode = Mode::Push(restored);
                    }
                    Err(e) => {
                        debug!(execution = %self.remote_id, error = %e, "push reconnect failed");
                        let delay = self.backoff.next_delay();
                        self.retry_push_at = Some(Instant::now() + delay);
                    }
                }
            }

            match &mut self.mode {
                Mode::Connecting => match PushChannel::open(&self.backend, &self.remote_id).await {
                    Ok(channel) => {
                        self.on_push_connected();
                        self.mode = Mode::Push(channel);
                    }
                    Err(e) => {
                        debug!(execution = %self.remote_id, error = %e, "push channel unavailable, polling");
                        self.note_failure(e)?;
                        self.fall_back_to_poll();
                    }
                },
                Mode::Push(channel) => match channel.next_event().await {
                    Ok(ev) => {
                        self.on_event();
                        return Ok(ev);
                    }
                    Err(e) => {
                        warn!(execution = %self.remote_id, error = %e, "push channel lost");
                        self.note_failure(e)?;
                        self.fall_back_to_poll();
                    }
                },
                Mode::Poll(channel) => match channel.next_event().await {
                    Ok(ev) => {
                        self.failures = 0;
                        self.health.set_status(ConnectionStatus::Polling);
                        return Ok(ev);
                    }
                    Err(e) => {
                        warn!(execution = %self.remote_id, error = %e, "status poll failed");
                        self.health.set_status(ConnectionStatus::Reconnecting);
                        self.note_failure(e)?;
                    }
                },
            }
        }
    }

    fn on_push_connected(&mut self) {
        self.failures = 0;
        self.backoff.reset();
        self.retry_push_at = None;
        self.health.set_status(ConnectionStatus::Push);
    }

    fn on_event(&mut self) {
        self.failures = 0;
        self.health.set_status(ConnectionStatus::Push);
    }

    fn fall_back_to_poll(&mut self) {
        self.retry_push_at = Some(Instant::now() + self.backoff.next_delay());
        self.mode = Mode::Poll(PollChannel::new(
            self.backend.clone(),
            &self.remote_id,
            self.config.poll_interval(),
        ));
    }

    fn push_retry_due(&self) -> bool {
        self.retry_push_at.is_some_and(|at| Instant::now() >= at)
    }

    /// Count a failure against the budget; error out once it is spent.
    fn note_failure(&mut self, error: TransportError) -> Result<(), TransportError> {
        if !error.is_retryable() {
            return Err(error);
        }
        self.failures += 1;
        self.last_error = Some(error);
        if self.failures >= self.config.max_attempts {
            let last = self
                .last_error
                .take()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(TransportError::Exhausted {
                attempts: self.failures,
                last,
            });
        }
        Ok(())
    }
}
