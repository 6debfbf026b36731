//! Contribution ledger and revenue allocation.
//!
//! Donations accumulate unprocessed until a monthly distribution settles them.
//! A distribution scores every active worker, splits the worker pool by score
//! and records one immutable [`RevenueSharing`] row per worker. The existence
//! of any such row for a period blocks a second run for it.
//!
//! The whole book lives behind one mutex held for the entire run. Changes are
//! made to a staged copy, persisted, and only then swapped in, so a failure at
//! any step leaves the previous book untouched.

use chrono::{DateTime, Months, Utc};
use fleet_protocol::{WorkerId, WorkerStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::config::RevenueConfig;
use crate::error::{FleetError, Result};
use crate::models::{DonationIntake, DonationSource, Period, RevenueSharing, Worker, WorkerContribution};
use crate::money::{apportion, Cents};
use crate::registry::WorkerRegistry;
use crate::storage;

pub const DISTRIBUTION_SOURCE_TYPE: &str = "monthly_distribution";
const DEFAULT_CURRENCY: &str = "USD";

const GENERATION_WEIGHT: f64 = 0.5;
const UPTIME_WEIGHT: f64 = 0.3;
const PERFORMANCE_WEIGHT: f64 = 0.2;
// TODO: replace with measured uptime once heartbeat history is retained
const UPTIME_SCORE: f64 = 100.0;

const MAX_LISTED_PERIODS: usize = 12;

/// Everything the allocator persists
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RevenueBook {
    pub next_donation_id: u64,
    pub donations: Vec<DonationSource>,
    pub sharing: Vec<RevenueSharing>,
    pub contributions: Vec<WorkerContribution>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Allocations {
    pub total_donations: Cents,
    pub worker_total: Cents,
    pub platform_maintenance: Cents,
    pub development_fund: Cents,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerAllocation {
    pub worker_id: WorkerId,
    pub worker_name: Option<String>,
    pub contribution_score: f64,
    pub share_percentage: f64,
    pub worker_share: Cents,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributionReport {
    pub period: Period,
    pub total_donations: Cents,
    pub allocations: Allocations,
    pub worker_count: usize,
    pub distributions: Vec<WorkerAllocation>,
}

/// Result of [`RevenueAllocator::run_distribution`]. Only `Distributed`
/// changes anything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DistributionOutcome {
    Distributed(DistributionReport),
    AlreadyDistributed { period: Period },
    NoDonations { period: Period },
    NoContributors { period: Period },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceTotal {
    pub source_type: String,
    pub total_amount: Cents,
    pub donation_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributionRow {
    pub worker_id: WorkerId,
    pub worker_name: Option<String>,
    pub worker_share: Cents,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransparencyReport {
    pub period: Period,
    pub total_donations: Cents,
    pub total_distributed_to_workers: Cents,
    pub platform_maintenance: Cents,
    pub development_fund: Cents,
    pub donation_sources: Vec<SourceTotal>,
    pub worker_distributions: Vec<DistributionRow>,
    pub worker_contributions: Vec<WorkerContribution>,
    pub active_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AllTimeStats {
    pub total_donations: Cents,
    pub total_count: usize,
    pub average_donation: Cents,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceStats {
    pub source_type: String,
    pub total_amount: Cents,
    pub donation_count: usize,
    pub avg_amount: Cents,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonthTotal {
    pub period: Period,
    pub total_amount: Cents,
    pub donation_count: usize,
}

/// Distribution ratios in percent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RatioView {
    pub worker_share: f64,
    pub platform_maintenance: f64,
    pub development_fund: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DonationStats {
    pub all_time: AllTimeStats,
    pub by_source: Vec<SourceStats>,
    pub monthly_trend: Vec<MonthTotal>,
    pub active_workers_count: usize,
    pub distribution_ratios: RatioView,
}

pub struct RevenueAllocator {
    config: RevenueConfig,
    registry: WorkerRegistry,
    /// `None` keeps the book in memory only
    snapshot_path: Option<PathBuf>,
    book: Mutex<RevenueBook>,
}

impl RevenueAllocator {
    pub fn new(config: RevenueConfig, registry: WorkerRegistry, snapshot_path: Option<PathBuf>) -> Self {
        Self { config, registry, snapshot_path, book: Mutex::new(RevenueBook::default()) }
    }

    pub fn config(&self) -> &RevenueConfig {
        &self.config
    }

    pub async fn restore(&self, book: RevenueBook) {
        tracing::info!(
            donations = book.donations.len(),
            distributions = book.sharing.len(),
            "Restored revenue book"
        );
        *self.book.lock().await = book;
    }

    pub async fn snapshot(&self) -> RevenueBook {
        self.book.lock().await.clone()
    }

    /// Accept a donation from the revenue intake collaborator
    pub async fn record_donation(&self, intake: DonationIntake) -> Result<DonationSource> {
        let amount = Cents::parse_decimal(&intake.amount)?;
        if amount.is_zero() {
            return Err(FleetError::Validation("donation amount must be positive".into()));
        }
        let source_type = intake.source_type.trim().to_string();
        if source_type.is_empty() {
            return Err(FleetError::Validation("source_type is required".into()));
        }
        let currency = match intake.currency.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_CURRENCY.to_string(),
            Some(c) if c.len() == 3 && c.bytes().all(|b| b.is_ascii_alphabetic()) => c.to_ascii_uppercase(),
            Some(c) => return Err(FleetError::Validation(format!("invalid currency '{c}'"))),
        };

        let mut book = self.book.lock().await;
        let mut staged = book.clone();
        staged.next_donation_id += 1;
        let donation = DonationSource {
            id: staged.next_donation_id,
            source_type,
            amount,
            currency,
            donor_name: intake.donor_name,
            message: intake.message,
            received_at: intake.received_at.unwrap_or_else(Utc::now),
            processed: false,
        };
        staged.donations.push(donation.clone());
        self.persist(&staged).await?;
        *book = staged;

        tracing::info!(
            source = %donation.source_type,
            amount = %donation.amount,
            currency = %donation.currency,
            "Donation added"
        );
        Ok(donation)
    }

    /// Settle all unprocessed donations received in `period`.
    ///
    /// All-or-nothing: either every row is written and every donation flipped
    /// to processed, or the book is left exactly as it was.
    pub async fn run_distribution(&self, period: Period) -> Result<DistributionOutcome> {
        tracing::info!(period = %period, "Starting monthly revenue distribution");
        let mut book = self.book.lock().await;

        if book.sharing.iter().any(|r| r.period == period) {
            tracing::info!(period = %period, "Distribution already ran for period");
            return Ok(DistributionOutcome::AlreadyDistributed { period });
        }

        let total: Cents = book
            .donations
            .iter()
            .filter(|d| !d.processed && period.contains(d.received_at))
            .map(|d| d.amount)
            .sum();
        if total.is_zero() {
            tracing::info!(period = %period, "No donations to distribute");
            return Ok(DistributionOutcome::NoDonations { period });
        }

        let allocations = self.split(total);
        let scored = score_workers(self.registry.snapshot().await);
        if scored.is_empty() {
            tracing::warn!(period = %period, "No worker contributions found");
            return Ok(DistributionOutcome::NoContributors { period });
        }

        let total_score: f64 = scored.iter().map(|(_, s)| s).sum();
        let weights: Vec<f64> = scored.iter().map(|(_, s)| *s).collect();
        let amounts = apportion(allocations.worker_total, &weights);

        let now = Utc::now();
        let mut staged = book.clone();
        let mut distributions = Vec::with_capacity(scored.len());
        for ((worker, score), amount) in scored.iter().zip(amounts) {
            let share_percentage = score / total_score;
            staged.sharing.push(RevenueSharing {
                worker_id: worker.worker_id.clone(),
                period,
                source_type: DISTRIBUTION_SOURCE_TYPE.to_string(),
                worker_share: amount,
                period_start: period.first_day(),
                period_end: period.last_day(),
                processed_at: now,
            });
            upsert_contribution(
                &mut staged.contributions,
                WorkerContribution {
                    worker_id: worker.worker_id.clone(),
                    period,
                    total_generations: worker.successful_requests,
                    performance_score_avg: worker.performance_score,
                    uptime_score: UPTIME_SCORE,
                    contribution_score: *score,
                    share_percentage,
                },
            );
            distributions.push(WorkerAllocation {
                worker_id: worker.worker_id.clone(),
                worker_name: worker.worker_name.clone(),
                contribution_score: *score,
                share_percentage,
                worker_share: amount,
            });
        }
        for d in staged.donations.iter_mut() {
            if !d.processed && period.contains(d.received_at) {
                d.processed = true;
            }
        }

        if let Err(e) = self.persist(&staged).await {
            tracing::error!(period = %period, error = %e, "Monthly distribution failed, nothing committed");
            return Err(e);
        }
        *book = staged;

        tracing::info!(
            period = %period,
            total = %total,
            worker_total = %allocations.worker_total,
            workers = distributions.len(),
            "Monthly distribution completed"
        );
        Ok(DistributionOutcome::Distributed(DistributionReport {
            period,
            total_donations: total,
            allocations,
            worker_count: distributions.len(),
            distributions,
        }))
    }

    /// Processed donations and payouts for one period
    pub async fn transparency_report(&self, period: Period) -> TransparencyReport {
        let book = self.book.lock().await;
        let processed: Vec<&DonationSource> = book
            .donations
            .iter()
            .filter(|d| d.processed && period.contains(d.received_at))
            .collect();

        let mut sources: BTreeMap<&str, (Cents, usize)> = BTreeMap::new();
        for d in &processed {
            let entry = sources.entry(d.source_type.as_str()).or_default();
            entry.0 += d.amount;
            entry.1 += 1;
        }
        let donation_sources = sources
            .into_iter()
            .map(|(source_type, (total_amount, donation_count))| SourceTotal {
                source_type: source_type.to_string(),
                total_amount,
                donation_count,
            })
            .collect();

        let mut worker_distributions = Vec::new();
        for row in book.sharing.iter().filter(|r| r.period == period) {
            let worker_name = self.registry.get(&row.worker_id).await.and_then(|w| w.worker_name);
            worker_distributions.push(DistributionRow {
                worker_id: row.worker_id.clone(),
                worker_name,
                worker_share: row.worker_share,
            });
        }
        worker_distributions.sort_by(|a, b| b.worker_share.cmp(&a.worker_share));

        let mut worker_contributions: Vec<WorkerContribution> = book
            .contributions
            .iter()
            .filter(|c| c.period == period)
            .cloned()
            .collect();
        worker_contributions.sort_by(|a, b| b.contribution_score.total_cmp(&a.contribution_score));

        let total_donations: Cents = processed.iter().map(|d| d.amount).sum();
        let split = self.split(total_donations);
        TransparencyReport {
            period,
            total_donations,
            total_distributed_to_workers: worker_distributions.iter().map(|r| r.worker_share).sum(),
            platform_maintenance: split.platform_maintenance,
            development_fund: split.development_fund,
            donation_sources,
            worker_distributions,
            active_workers: worker_contributions.len(),
            worker_contributions,
        }
    }

    /// Distinct periods with processed donations, newest first
    pub async fn available_periods(&self) -> Vec<Period> {
        let book = self.book.lock().await;
        let periods: HashSet<Period> = book
            .donations
            .iter()
            .filter(|d| d.processed)
            .map(|d| Period::of(d.received_at))
            .collect();
        let mut periods: Vec<Period> = periods.into_iter().collect();
        periods.sort_by(|a, b| b.cmp(a));
        periods.truncate(MAX_LISTED_PERIODS);
        periods
    }

    pub async fn donation_stats(&self) -> DonationStats {
        self.donation_stats_at(Utc::now()).await
    }

    async fn donation_stats_at(&self, now: DateTime<Utc>) -> DonationStats {
        let book = self.book.lock().await;
        let processed: Vec<&DonationSource> = book.donations.iter().filter(|d| d.processed).collect();

        let total: Cents = processed.iter().map(|d| d.amount).sum();
        let all_time = AllTimeStats {
            total_donations: total,
            total_count: processed.len(),
            average_donation: average(total, processed.len()),
        };

        let mut sources: BTreeMap<&str, (Cents, usize)> = BTreeMap::new();
        for d in &processed {
            let entry = sources.entry(d.source_type.as_str()).or_default();
            entry.0 += d.amount;
            entry.1 += 1;
        }
        let mut by_source: Vec<SourceStats> = sources
            .into_iter()
            .map(|(source_type, (total_amount, donation_count))| SourceStats {
                source_type: source_type.to_string(),
                total_amount,
                donation_count,
                avg_amount: average(total_amount, donation_count),
            })
            .collect();
        by_source.sort_by(|a, b| b.total_amount.cmp(&a.total_amount));

        let trend_start = now.checked_sub_months(Months::new(6)).unwrap_or(now);
        let mut months: BTreeMap<Period, (Cents, usize)> = BTreeMap::new();
        for d in processed.iter().filter(|d| d.received_at >= trend_start) {
            let entry = months.entry(Period::of(d.received_at)).or_default();
            entry.0 += d.amount;
            entry.1 += 1;
        }
        let monthly_trend = months
            .into_iter()
            .rev()
            .map(|(period, (total_amount, donation_count))| MonthTotal { period, total_amount, donation_count })
            .collect();

        let active_since = now.checked_sub_months(Months::new(3)).unwrap_or(now);
        let active_workers_count = book
            .sharing
            .iter()
            .filter(|r| r.processed_at >= active_since)
            .map(|r| r.worker_id.as_str())
            .collect::<HashSet<_>>()
            .len();

        DonationStats {
            all_time,
            by_source,
            monthly_trend,
            active_workers_count,
            distribution_ratios: RatioView {
                worker_share: self.config.worker_share() * 100.0,
                platform_maintenance: self.config.platform_maintenance() * 100.0,
                development_fund: self.config.development_fund() * 100.0,
            },
        }
    }

    /// Worker and platform shares are rounded; the development fund takes the
    /// remainder so the three always add up to `total`.
    fn split(&self, total: Cents) -> Allocations {
        let worker_total = total.scale(self.config.worker_share());
        let platform_maintenance = total.scale(self.config.platform_maintenance());
        Allocations {
            total_donations: total,
            worker_total,
            platform_maintenance,
            development_fund: total - worker_total - platform_maintenance,
        }
    }

    async fn persist(&self, book: &RevenueBook) -> Result<()> {
        match &self.snapshot_path {
            Some(path) => storage::write_json(path, book).await,
            None => Ok(()),
        }
    }
}

/// Contribution score for each active worker, ordered by worker id
fn score_workers(workers: Vec<Worker>) -> Vec<(Worker, f64)> {
    let mut scored: Vec<(Worker, f64)> = workers
        .into_iter()
        .filter(|w| w.status != WorkerStatus::Offline && w.total_requests > 0)
        .map(|w| {
            let score = contribution_score(&w);
            (w, score)
        })
        .collect();
    scored.sort_by(|a, b| a.0.worker_id.cmp(&b.0.worker_id));
    scored
}

pub fn contribution_score(worker: &Worker) -> f64 {
    let generation = (worker.successful_requests as f64 * 2.0).min(100.0);
    generation * GENERATION_WEIGHT + UPTIME_SCORE * UPTIME_WEIGHT + worker.performance_score * PERFORMANCE_WEIGHT
}

fn upsert_contribution(rows: &mut Vec<WorkerContribution>, row: WorkerContribution) {
    match rows.iter_mut().find(|r| r.worker_id == row.worker_id && r.period == row.period) {
        Some(existing) => *existing = row,
        None => rows.push(row),
    }
}

fn average(total: Cents, count: usize) -> Cents {
    if count == 0 {
        Cents::ZERO
    } else {
        Cents((total.0 as f64 / count as f64).round() as u64)
    }
}
