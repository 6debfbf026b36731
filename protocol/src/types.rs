use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Externally chosen, stable worker identifier
pub type WorkerId = String;

/// Capability every generation worker must advertise
pub const CAP_STABLE_AUDIO: &str = "stable-audio-open";
/// Prompt rewriting model, required alongside audio generation
pub const CAP_LLM: &str = "llm";
/// Needed when the caller asks for stem separation
pub const CAP_STEMS: &str = "stems-extraction";

/// How often workers are told to heartbeat (seconds)
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Lifecycle status of a worker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Registering,
    Idle,
    Busy,
    Error,
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Registering => "registering",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Error => "error",
            WorkerStatus::Offline => "offline",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unordered set of capability tags a worker advertises
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<String>);

impl CapabilitySet {
    /// Build a set from raw tags, trimming whitespace and dropping blanks
    pub fn from_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            tags.into_iter()
                .map(|t| t.as_ref().trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        )
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    pub fn contains_all<'a>(&self, required: impl IntoIterator<Item = &'a str>) -> bool {
        required.into_iter().all(|tag| self.contains(tag))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// GPU resource snapshot reported at registration and on each heartbeat.
///
/// Memory figures are in GB. Any fields a worker sends beyond the known ones
/// are kept as diagnostics and echoed back in status views.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_name: Option<String>,
    #[serde(default)]
    pub gpu_memory_total: f64,
    #[serde(default)]
    pub gpu_memory_used: f64,
    #[serde(default)]
    pub queue_size: u32,
    #[serde(flatten)]
    pub diagnostics: serde_json::Map<String, serde_json::Value>,
}

impl GpuSnapshot {
    /// True when the worker reported nothing usable
    pub fn is_empty(&self) -> bool {
        self.gpu_name.is_none()
            && self.gpu_memory_total <= 0.0
            && self.gpu_memory_used <= 0.0
            && self.queue_size == 0
            && self.diagnostics.is_empty()
    }

    pub fn free_memory(&self) -> f64 {
        self.gpu_memory_total - self.gpu_memory_used
    }

    /// Used / total, or `None` when the total is unknown
    pub fn memory_utilization(&self) -> Option<f64> {
        (self.gpu_memory_total > 0.0).then(|| self.gpu_memory_used / self.gpu_memory_total)
    }
}

// --- Worker registration ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub worker_name: Option<String>,
    #[serde(default)]
    pub gpu_info: Option<GpuSnapshot>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
    #[serde(default)]
    pub docker_image_hash: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default, alias = "worker_port")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Registered,
    Updated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub worker_id: WorkerId,
    pub session_token: String,
    pub status: RegistrationStatus,
    pub heartbeat_interval: u64,
}

/// Periodic status report from a worker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub worker_id: WorkerId,
    #[serde(default)]
    pub status: Option<WorkerStatus>,
    /// Self-reported success rate in percent
    #[serde(default)]
    pub success_rate: Option<f64>,
    /// Self-reported average response time in ms
    #[serde(default)]
    pub avg_response_time: Option<f64>,
    #[serde(flatten)]
    pub gpu: GpuSnapshot,
}

// --- Dispatch ---

/// Worker selection strategy
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    Performance,
    RoundRobin,
    LeastLoaded,
    Random,
}

impl SelectionStrategy {
    /// Parse a strategy name; unknown names fall back to `Performance`
    pub fn parse_lenient(name: &str) -> Self {
        match name {
            "round_robin" => SelectionStrategy::RoundRobin,
            "least_loaded" => SelectionStrategy::LeastLoaded,
            "random" => SelectionStrategy::Random,
            _ => SelectionStrategy::Performance,
        }
    }
}

/// What a generation request needs from a worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchRequirements {
    /// Seconds of audio to generate
    #[serde(default = "default_duration")]
    pub generation_duration: f64,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default)]
    pub preferred_stems: Vec<String>,
}

fn default_duration() -> f64 { 6.0 }
fn default_sample_rate() -> u32 { 48_000 }

impl Default for DispatchRequirements {
    fn default() -> Self {
        Self {
            generation_duration: default_duration(),
            sample_rate: default_sample_rate(),
            preferred_stems: vec![],
        }
    }
}

impl DispatchRequirements {
    pub fn wants_stems(&self) -> bool {
        !self.preferred_stems.is_empty()
    }
}

/// A reserved worker and how to reach it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerAssignment {
    pub worker_id: WorkerId,
    pub ip_address: String,
    pub port: u16,
    pub performance_score: f64,
}

impl WorkerAssignment {
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip_address, self.port)
    }
}

// --- Generation ---

/// Inbound generation request, already authenticated by the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub user_id: String,
    pub username: String,
    pub prompt: String,
    pub bpm: f64,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub measures: Option<u32>,
    #[serde(default)]
    pub generation_duration: Option<f64>,
    #[serde(default)]
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub preferred_stems: Option<Vec<String>>,
    #[serde(default)]
    pub strategy: Option<String>,
}

/// Body posted to a worker's `/generate` endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerGenerateRequest {
    pub request_id: String,
    pub prompt: String,
    pub bpm: f64,
    pub key: Option<String>,
    pub measures: u32,
    pub preferred_stems: Option<Vec<String>>,
    pub generation_duration: f64,
    pub sample_rate: u32,
    /// sha256(user_id || request_id), so workers never see the real user id
    pub anonymized_user_id: String,
}

/// Fleet-wide load summary
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FleetLoad {
    pub total_workers: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub avg_performance: f64,
    pub avg_response_time: f64,
}

impl FleetLoad {
    pub fn idle_ratio(&self) -> f64 {
        if self.total_workers == 0 {
            0.0
        } else {
            self.idle_workers as f64 / self.total_workers as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub health_score: f64,
    pub load: FleetLoad,
    pub removed_offline_workers: usize,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_set_normalizes_tags() {
        let caps = CapabilitySet::from_tags([" llm ", "stable-audio-open", "", "llm"]);
        assert_eq!(caps.len(), 2);
        assert!(caps.contains_all([CAP_LLM, CAP_STABLE_AUDIO]));
        assert!(!caps.contains(CAP_STEMS));
    }

    #[test]
    fn test_gpu_snapshot_keeps_unknown_fields() {
        let json = r#"{"gpu_memory_total": 24.0, "gpu_memory_used": 6.0, "temperature": 71}"#;
        let gpu: GpuSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(gpu.free_memory(), 18.0);
        assert_eq!(gpu.memory_utilization(), Some(0.25));
        assert_eq!(gpu.diagnostics.get("temperature"), Some(&serde_json::json!(71)));
        assert!(!gpu.is_empty());
        assert!(GpuSnapshot::default().is_empty());
    }

    #[test]
    fn test_heartbeat_report_flattens_gpu_fields() {
        let json = r#"{"worker_id": "w1", "status": "busy", "gpu_memory_total": 16, "queue_size": 2}"#;
        let report: HeartbeatReport = serde_json::from_str(json).unwrap();
        assert_eq!(report.status, Some(WorkerStatus::Busy));
        assert_eq!(report.gpu.gpu_memory_total, 16.0);
        assert_eq!(report.gpu.queue_size, 2);
        assert!(report.gpu.diagnostics.is_empty());
    }

    #[test]
    fn test_strategy_parse_falls_back_to_performance() {
        assert_eq!(SelectionStrategy::parse_lenient("round_robin"), SelectionStrategy::RoundRobin);
        assert_eq!(SelectionStrategy::parse_lenient("fastest"), SelectionStrategy::Performance);
    }
}
