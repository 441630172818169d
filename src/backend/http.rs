//! HTTP implementation of the runner backend.
//!
//! Endpoints:
//!   POST {base}/api/v1/tests            -> { "execution_id": "..." }
//!   POST {base}/api/v1/cancel/{id}
//!   GET  {base}/api/v1/status/{id}      -> StatusSnapshot
//!   GET  {base}/api/v1/events/{id}      -> newline-delimited JSON frames

use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use super::{EventStream, RunnerBackend, RunnerEvent, StatusSnapshot};
use crate::error::TransportError;
use crate::model::TestType;

pub struct HttpRunnerBackend {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct SubmitResponse {
    execution_id: String,
}

impl HttpRunnerBackend {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path)
    }
}

#[async_trait::async_trait]
impl RunnerBackend for HttpRunnerBackend {
    async fn submit(&self, test_type: TestType, config: &Value) -> Result<String, TransportError> {
        let resp = self
            .client
            .post(self.url("tests"))
            .json(&serde_json::json!({ "test_type": test_type, "config": config }))
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        if resp.status().is_client_error() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Rejected(body));
        }
        let resp = resp
            .error_for_status()
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let parsed: SubmitResponse = resp
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        Ok(parsed.execution_id)
    }

    async fn cancel(&self, remote_id: &str) -> Result<(), TransportError> {
        self.client
            .post(self.url(&format!("cancel/{}", remote_id)))
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?
            .error_for_status()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(())
    }

    async fn fetch_status(&self, remote_id: &str) -> Result<StatusSnapshot, TransportError> {
        let resp = self
            .client
            .get(self.url(&format!("status/{}", remote_id)))
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?
            .error_for_status()
            .map_err(|e| TransportError::Request(e.to_string()))?;

        resp.json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn open_events(&self, remote_id: &str) -> Result<EventStream, TransportError> {
        // The events endpoint holds the response open and writes one JSON
        // frame per line for the life of the execution.
        let resp = self
            .client
            .get(self.url(&format!("events/{}", remote_id)))
            .timeout(Duration::from_secs(24 * 3600))
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?
            .error_for_status()
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let byte_stream = resp.bytes_stream();
        let stream = futures::stream::unfold(
            (byte_stream, BytesMut::new()),
            |(mut bytes, mut buf)| async move {
                loop {
                    // Drain any complete line already buffered.
                    if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                        let line = buf.split_to(pos + 1);
                        let line = String::from_utf8_lossy(&line[..pos]);
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let item = serde_json::from_str::<RunnerEvent>(line)
                            .map_err(|e| TransportError::Decode(e.to_string()));
                        return Some((item, (bytes, buf)));
                    }

                    match bytes.next().await {
                        Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                        Some(Err(e)) => {
                            return Some((
                                Err(TransportError::Request(e.to_string())),
                                (bytes, buf),
                            ))
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}
