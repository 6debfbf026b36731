use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use fleet_protocol::{CapabilitySet, GpuSnapshot, WorkerId, WorkerStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::FleetError;
use crate::money::Cents;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: WorkerId,
    #[serde(default)]
    pub worker_name: Option<String>,
    pub ip_address: String,
    pub port: u16,
    /// Never serialized into API responses, see [`WorkerView`]
    pub session_token: String,
    pub status: WorkerStatus,
    pub capabilities: CapabilitySet,
    pub gpu: GpuSnapshot,
    #[serde(default)]
    pub docker_image_hash: Option<String>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Cumulative mean of every recorded response time, in ms
    pub avg_response_time: f64,
    pub performance_score: f64,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Worker {
    pub fn heartbeat_age_secs(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.last_heartbeat).num_seconds()
    }

    pub fn is_online(&self, now: DateTime<Utc>, idle_threshold_secs: u64) -> bool {
        self.status != WorkerStatus::Offline
            && self.heartbeat_age_secs(now) <= idle_threshold_secs as i64
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64 * 100.0
        }
    }

    pub fn view(&self) -> WorkerView {
        WorkerView {
            worker_id: self.worker_id.clone(),
            worker_name: self.worker_name.clone(),
            status: self.status,
            capabilities: self.capabilities.clone(),
            performance_score: self.performance_score,
            avg_response_time: self.avg_response_time,
            total_requests: self.total_requests,
            success_rate: (self.success_rate() * 10.0).round() / 10.0,
            gpu_memory_used: self.gpu.gpu_memory_used,
            gpu_memory_total: self.gpu.gpu_memory_total,
            last_heartbeat: self.last_heartbeat,
        }
    }
}

/// Worker summary safe to expose publicly
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerView {
    pub worker_id: WorkerId,
    pub worker_name: Option<String>,
    pub status: WorkerStatus,
    pub capabilities: CapabilitySet,
    pub performance_score: f64,
    pub avg_response_time: f64,
    pub total_requests: u64,
    pub success_rate: f64,
    pub gpu_memory_used: f64,
    pub gpu_memory_total: f64,
    pub last_heartbeat: DateTime<Utc>,
}

// --- Distribution periods ---

/// A calendar month, written `YYYY-MM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Result<Self, FleetError> {
        if !(1..=12).contains(&month) || !(1970..=9999).contains(&year) {
            return Err(FleetError::Validation(format!(
                "invalid period {year:04}-{month:02}"
            )));
        }
        Ok(Self { year, month })
    }

    pub fn of(ts: DateTime<Utc>) -> Self {
        Self { year: ts.year(), month: ts.month() }
    }

    pub fn current() -> Self {
        Self::of(Utc::now())
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self { year: self.year + 1, month: 1 }
        } else {
            Self { year: self.year, month: self.month + 1 }
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or_default()
    }

    pub fn last_day(&self) -> NaiveDate {
        self.next().first_day().pred_opt().unwrap_or_default()
    }

    /// Inclusive start instant
    pub fn start(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.first_day().and_hms_opt(0, 0, 0).unwrap_or_default())
    }

    /// Exclusive end instant
    pub fn end(&self) -> DateTime<Utc> {
        self.next().start()
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start() && ts < self.end()
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FleetError::Validation(format!("period '{s}' must be in YYYY-MM format"));
        let (y, m) = s.split_once('-').ok_or_else(invalid)?;
        if y.len() != 4 || m.len() != 2 {
            return Err(invalid());
        }
        let year = y.parse().map_err(|_| invalid())?;
        let month = m.parse().map_err(|_| invalid())?;
        Period::new(year, month)
    }
}

impl Serialize for Period {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// --- Revenue ---

/// A raw inbound donation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DonationSource {
    pub id: u64,
    pub source_type: String,
    pub amount: Cents,
    pub currency: String,
    #[serde(default)]
    pub donor_name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed: bool,
}

/// Donation as handed over by the revenue intake collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DonationIntake {
    pub source_type: String,
    /// Decimal string in major units, e.g. "25.00"
    pub amount: String,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub donor_name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Defaults to the time of intake
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

/// Immutable record of what one worker was paid for one period
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RevenueSharing {
    pub worker_id: WorkerId,
    pub period: Period,
    pub source_type: String,
    pub worker_share: Cents,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub processed_at: DateTime<Utc>,
}

/// Derived contribution of one worker to one period; recomputed on each run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerContribution {
    pub worker_id: WorkerId,
    pub period: Period,
    pub total_generations: u64,
    pub performance_score_avg: f64,
    /// Placeholder constant pending measured uptime
    pub uptime_score: f64,
    pub contribution_score: f64,
    pub share_percentage: f64,
}
