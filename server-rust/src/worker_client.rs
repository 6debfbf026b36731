use fleet_protocol::{WorkerAssignment, WorkerGenerateRequest};
use std::time::Duration;

use crate::error::{FleetError, Result};

const REQUEST_SOURCE: &str = "fleet-coordinator";

/// HTTP client for the generation endpoint every worker exposes
#[derive(Clone)]
pub struct WorkerClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl WorkerClient {
    pub fn new(timeout: Duration) -> Self {
        Self { http: reqwest::Client::new(), timeout }
    }

    /// POST the job to `http://{ip}:{port}/generate` and return the audio bytes.
    ///
    /// Connection failures, timeouts and non-2xx answers all come back as
    /// [`FleetError::TransientWorker`].
    pub async fn generate(
        &self,
        worker: &WorkerAssignment,
        request: &WorkerGenerateRequest,
    ) -> Result<Vec<u8>> {
        let url = format!("http://{}/generate", worker.address());
        let transient = |reason: String| FleetError::TransientWorker {
            worker_id: worker.worker_id.clone(),
            reason,
        };

        let resp = self
            .http
            .post(&url)
            .header("X-Request-Source", REQUEST_SOURCE)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| transient(describe(&e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(transient(format!("HTTP {status}")));
        }
        let body = resp.bytes().await.map_err(|e| transient(describe(&e)))?;
        if body.is_empty() {
            return Err(transient("empty response body".into()));
        }
        Ok(body.to_vec())
    }
}

fn describe(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "request timed out".into()
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        err.to_string()
    }
}
