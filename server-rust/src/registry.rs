//! Worker registry
//!
//! Owns worker identity, lifecycle status, resource snapshots and rolling
//! request statistics. All state sits behind one `RwLock`, so every status
//! transition is a single guarded write and the idle → busy transition can be
//! a true compare-and-set.

use chrono::{DateTime, Utc};
use fleet_protocol::{
    CapabilitySet, GpuSnapshot, HeartbeatReport, RegisterRequest, RegisterResponse,
    RegistrationStatus, WorkerId, WorkerStatus, HEARTBEAT_INTERVAL_SECS,
};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{FleetError, Result};
use crate::models::Worker;

const DEFAULT_WORKER_PORT: u16 = 8001;

/// Thread-safe collection of registered workers
#[derive(Clone)]
pub struct WorkerRegistry {
    workers: Arc<RwLock<HashMap<WorkerId, Worker>>>,
    idle_threshold_secs: u64,
}

impl WorkerRegistry {
    pub fn new(idle_threshold_secs: u64) -> Self {
        Self {
            workers: Arc::new(RwLock::new(HashMap::new())),
            idle_threshold_secs,
        }
    }

    /// Create or refresh a worker and hand it a new session token.
    ///
    /// Re-registration keeps the same row, including its statistics.
    pub async fn register(&self, req: RegisterRequest) -> Result<RegisterResponse> {
        let worker_id = req
            .worker_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| FleetError::Validation("worker_id is required".into()))?
            .to_string();
        let gpu = req
            .gpu_info
            .filter(|g| !g.is_empty())
            .ok_or_else(|| FleetError::Validation("gpu_info is required".into()))?;
        let capabilities = req
            .capabilities
            .map(CapabilitySet::from_tags)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| FleetError::Validation("capabilities are required".into()))?;
        let ip_address = req
            .ip_address
            .filter(|ip| !ip.trim().is_empty())
            .ok_or_else(|| FleetError::Validation("ip_address is required".into()))?;
        let port = req.port.unwrap_or(DEFAULT_WORKER_PORT);

        let session_token = new_session_token();
        let now = Utc::now();
        let mut workers = self.workers.write().await;

        let status = match workers.get_mut(&worker_id) {
            Some(existing) => {
                existing.worker_name = req.worker_name.or(existing.worker_name.take());
                existing.ip_address = ip_address;
                existing.port = port;
                existing.gpu = gpu;
                existing.capabilities = capabilities;
                existing.docker_image_hash = req.docker_image_hash;
                existing.session_token = session_token.clone();
                existing.status = WorkerStatus::Idle;
                existing.last_heartbeat = now;
                tracing::info!(worker_id = %worker_id, "Worker re-registered");
                RegistrationStatus::Updated
            }
            None => {
                let mut worker = Worker {
                    worker_id: worker_id.clone(),
                    worker_name: req.worker_name,
                    ip_address,
                    port,
                    session_token: session_token.clone(),
                    status: WorkerStatus::Registering,
                    capabilities,
                    gpu,
                    docker_image_hash: req.docker_image_hash,
                    total_requests: 0,
                    successful_requests: 0,
                    failed_requests: 0,
                    avg_response_time: 0.0,
                    performance_score: 100.0,
                    registered_at: now,
                    last_heartbeat: now,
                };
                worker.performance_score = performance_score(None, None, Some(&worker.gpu));
                worker.status = WorkerStatus::Idle;
                workers.insert(worker_id.clone(), worker);
                tracing::info!(worker_id = %worker_id, "New worker registered");
                RegistrationStatus::Registered
            }
        };

        Ok(RegisterResponse {
            worker_id,
            session_token,
            status,
            heartbeat_interval: HEARTBEAT_INTERVAL_SECS,
        })
    }

    /// Apply a worker's status report.
    ///
    /// When `session_token` is given it must match the worker's current token.
    /// Self-reported success rate and latency take precedence over the
    /// coordinator's own counters when scoring.
    ///
    /// An offline worker has to register again. A report never releases a
    /// busy reservation; without a status the current one is kept.
    pub async fn heartbeat(&self, report: HeartbeatReport, session_token: Option<&str>) -> Result<()> {
        let mut workers = self.workers.write().await;
        let Some(worker) = workers.get_mut(&report.worker_id) else {
            tracing::warn!(worker_id = %report.worker_id, "Heartbeat from unknown worker");
            return Err(FleetError::NotFound(format!("worker {}", report.worker_id)));
        };
        if let Some(token) = session_token {
            if !tokens_match(&worker.session_token, token) {
                return Err(FleetError::Unauthorized("invalid worker session token".into()));
            }
        }
        if worker.status == WorkerStatus::Offline {
            tracing::warn!(worker_id = %report.worker_id, "Heartbeat from offline worker, re-registration required");
            return Err(FleetError::NotFound(format!("worker {} is offline, register again", report.worker_id)));
        }

        let success_rate = report
            .success_rate
            .or_else(|| (worker.total_requests > 0).then(|| worker.success_rate()));
        let avg_response_time = report
            .avg_response_time
            .or_else(|| (worker.total_requests > 0).then_some(worker.avg_response_time));

        worker.status = match (worker.status, report.status) {
            (WorkerStatus::Busy, Some(WorkerStatus::Idle)) | (_, None) => worker.status,
            (_, Some(reported)) => reported,
        };
        worker.gpu = report.gpu;
        worker.performance_score = performance_score(success_rate, avg_response_time, Some(&worker.gpu));
        worker.last_heartbeat = Utc::now();

        tracing::debug!(
            worker_id = %worker.worker_id,
            status = %worker.status,
            score = worker.performance_score,
            "Heartbeat processed"
        );
        Ok(())
    }

    /// Authenticated voluntary departure; the worker goes offline
    pub async fn unregister(&self, worker_id: &str, session_token: &str) -> Result<()> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| FleetError::NotFound(format!("worker {worker_id}")))?;
        if !tokens_match(&worker.session_token, session_token) {
            return Err(FleetError::Unauthorized("invalid authorization token".into()));
        }
        worker.status = WorkerStatus::Offline;
        worker.last_heartbeat = Utc::now();
        tracing::info!(worker_id = %worker_id, "Worker unregistered");
        Ok(())
    }

    /// Fold one request outcome into the worker's rolling statistics
    pub async fn record_outcome(&self, worker_id: &str, success: bool, response_time_ms: u64) -> Result<()> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| FleetError::NotFound(format!("worker {worker_id}")))?;

        let previous_total = worker.total_requests as f64;
        worker.total_requests += 1;
        if success {
            worker.successful_requests += 1;
        } else {
            worker.failed_requests += 1;
        }
        worker.avg_response_time = (worker.avg_response_time * previous_total
            + response_time_ms as f64)
            / worker.total_requests as f64;
        worker.performance_score = performance_score(
            Some(worker.success_rate()),
            Some(worker.avg_response_time),
            Some(&worker.gpu),
        );

        tracing::debug!(
            worker_id = %worker_id,
            success,
            response_time_ms,
            score = worker.performance_score,
            "Updated worker stats"
        );
        Ok(())
    }

    /// Move a worker to error in one guarded write. Also ends a busy
    /// reservation, so a failed dispatch never passes through idle.
    pub async fn mark_error(&self, worker_id: &str) -> Result<()> {
        self.set_status(worker_id, WorkerStatus::Error).await
    }

    /// Unconditional transition back to idle
    pub async fn mark_idle(&self, worker_id: &str) -> Result<()> {
        self.set_status(worker_id, WorkerStatus::Idle).await
    }

    async fn set_status(&self, worker_id: &str, status: WorkerStatus) -> Result<()> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| FleetError::NotFound(format!("worker {worker_id}")))?;
        if worker.status != status {
            tracing::debug!(worker_id = %worker_id, from = %worker.status, to = %status, "Worker status changed");
        }
        worker.status = status;
        Ok(())
    }

    /// Compare-and-set idle → busy. Returns `false` when the worker was no
    /// longer idle at the time of the write.
    pub async fn try_mark_busy(&self, worker_id: &str) -> Result<bool> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| FleetError::NotFound(format!("worker {worker_id}")))?;
        if worker.status != WorkerStatus::Idle {
            return Ok(false);
        }
        worker.status = WorkerStatus::Busy;
        Ok(true)
    }

    /// Move every non-offline worker whose heartbeat is older than
    /// `threshold_secs` to offline. Returns how many were moved.
    pub async fn sweep_offline(&self, threshold_secs: u64) -> usize {
        self.sweep_offline_at(Utc::now(), threshold_secs).await
    }

    async fn sweep_offline_at(&self, now: DateTime<Utc>, threshold_secs: u64) -> usize {
        let mut workers = self.workers.write().await;
        let mut swept = 0;
        for worker in workers.values_mut() {
            if worker.status != WorkerStatus::Offline
                && worker.heartbeat_age_secs(now) > threshold_secs as i64
            {
                tracing::info!(worker_id = %worker.worker_id, "Worker heartbeat timed out, marking offline");
                worker.status = WorkerStatus::Offline;
                swept += 1;
            }
        }
        if swept > 0 {
            tracing::info!(swept, "Marked workers offline");
        }
        swept
    }

    /// Online workers that are idle or busy, best score first, then fastest
    pub async fn list_available(&self) -> Vec<Worker> {
        let now = Utc::now();
        let workers = self.workers.read().await;
        let mut available: Vec<Worker> = workers
            .values()
            .filter(|w| w.is_online(now, self.idle_threshold_secs))
            .filter(|w| matches!(w.status, WorkerStatus::Idle | WorkerStatus::Busy))
            .cloned()
            .collect();
        available.sort_by(|a, b| {
            b.performance_score
                .total_cmp(&a.performance_score)
                .then(a.avg_response_time.total_cmp(&b.avg_response_time))
        });
        available
    }

    pub async fn get(&self, worker_id: &str) -> Option<Worker> {
        self.workers.read().await.get(worker_id).cloned()
    }

    /// Every known worker, in no particular order
    pub async fn snapshot(&self) -> Vec<Worker> {
        self.workers.read().await.values().cloned().collect()
    }

    /// Replace the registry contents, used when loading persisted state
    pub async fn restore(&self, workers: Vec<Worker>) {
        let mut map = self.workers.write().await;
        map.clear();
        for w in workers {
            map.insert(w.worker_id.clone(), w);
        }
    }

    pub async fn count(&self) -> usize {
        self.workers.read().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn with_worker<F: FnOnce(&mut Worker)>(&self, worker_id: &str, f: F) {
        if let Some(w) = self.workers.write().await.get_mut(worker_id) {
            f(w);
        }
    }
}

/// Score in [0, 100]: success rate (percent) scaled down exponentially by
/// latency, with a 20% penalty above 90% GPU memory use. Rounded to 2 dp.
pub fn performance_score(
    success_rate: Option<f64>,
    avg_response_time_ms: Option<f64>,
    gpu: Option<&GpuSnapshot>,
) -> f64 {
    let mut score = 100.0;
    if let Some(rate) = success_rate {
        score *= rate / 100.0;
    }
    if let Some(avg) = avg_response_time_ms.filter(|avg| *avg > 0.0) {
        score *= (-avg / 10_000.0).exp();
    }
    if gpu.and_then(GpuSnapshot::memory_utilization).is_some_and(|u| u > 0.9) {
        score *= 0.8;
    }
    (score.clamp(0.0, 100.0) * 100.0).round() / 100.0
}

fn new_session_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Token comparison whose running time does not depend on where the inputs differ
pub(crate) fn tokens_match(expected: &str, provided: &str) -> bool {
    let (a, b) = (expected.as_bytes(), provided.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
