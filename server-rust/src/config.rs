use std::path::PathBuf;
use std::time::Duration;

use crate::error::{FleetError, Result};

/// Maximum drift allowed when checking that revenue ratios sum to one
pub const RATIO_EPSILON: f64 = 0.001;

/// How donation revenue is split. Validated once at construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RevenueConfig {
    worker_share: f64,
    platform_maintenance: f64,
    development_fund: f64,
}

impl RevenueConfig {
    pub fn new(worker_share: f64, platform_maintenance: f64, development_fund: f64) -> Result<Self> {
        let ratios = [worker_share, platform_maintenance, development_fund];
        if ratios.iter().any(|r| !r.is_finite() || *r < 0.0) {
            return Err(FleetError::Config(format!(
                "revenue ratios must be non-negative, got {ratios:?}"
            )));
        }
        let total: f64 = ratios.iter().sum();
        if (total - 1.0).abs() > RATIO_EPSILON {
            return Err(FleetError::Config(format!(
                "revenue distribution ratios must sum to 1.0, got {total}"
            )));
        }
        Ok(Self { worker_share, platform_maintenance, development_fund })
    }

    pub fn worker_share(&self) -> f64 {
        self.worker_share
    }

    pub fn platform_maintenance(&self) -> f64 {
        self.platform_maintenance
    }

    pub fn development_fund(&self) -> f64 {
        self.development_fund
    }
}

impl Default for RevenueConfig {
    fn default() -> Self {
        Self { worker_share: 0.75, platform_maintenance: 0.15, development_fund: 0.10 }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Heartbeat age after which a worker counts as offline
    pub idle_threshold_secs: u64,
    /// Fleet idle ratio under which busy workers become eligible
    pub high_load_idle_ratio: f64,
    pub min_performance_score: f64,
    /// Selection re-runs after losing the busy transition to another caller
    pub max_selection_attempts: usize,
    /// Timeout for each remote generation call
    pub worker_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            idle_threshold_secs: 300,
            high_load_idle_ratio: 0.2,
            min_performance_score: 20.0,
            max_selection_attempts: 3,
            worker_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttestationConfig {
    pub key_dir: PathBuf,
    pub ledger_path: PathBuf,
    pub public_ledger_path: PathBuf,
}

impl AttestationConfig {
    /// Keys under `<data_dir>/keys`, ledgers alongside the other snapshots
    pub fn under(data_dir: &str) -> Self {
        let dir = PathBuf::from(data_dir);
        Self {
            key_dir: dir.join("keys"),
            ledger_path: dir.join("certificates.jsonl"),
            public_ledger_path: dir.join("public").join("ledger.json"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Bearer token for administrative endpoints
    pub admin_token: String,
    pub data_dir: String,
    pub sweep_interval: Duration,
    pub dispatch: DispatchConfig,
    pub revenue: RevenueConfig,
    pub attestation: AttestationConfig,
}
