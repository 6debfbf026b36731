//! Worker selection and reservation.
//!
//! Selection filters the available fleet down to workers able to serve a
//! request, applies a strategy, then reserves the pick with a compare-and-set
//! on the registry. Losing that race surfaces as [`FleetError::Contended`];
//! [`Dispatcher::dispatch`] re-runs selection a bounded number of times.

use chrono::Utc;
use fleet_protocol::{
    DispatchRequirements, FleetLoad, HealthReport, HealthStatus, SelectionStrategy,
    WorkerAssignment, WorkerStatus, CAP_LLM, CAP_STABLE_AUDIO, CAP_STEMS,
};
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::DispatchConfig;
use crate::error::{FleetError, Result};
use crate::models::Worker;
use crate::registry::WorkerRegistry;

/// GB of free GPU memory a default 6 s generation needs
const BASE_MEMORY_GB: f64 = 8.0;
/// Scores closer than this are treated as equal and decided by latency
const SCORE_TIE_EPSILON: f64 = 0.1;

#[derive(Clone)]
pub struct Dispatcher {
    registry: WorkerRegistry,
    config: DispatchConfig,
    /// Next round-robin slot, shared by every clone of the dispatcher
    cursor: Arc<Mutex<usize>>,
}

impl Dispatcher {
    pub fn new(registry: WorkerRegistry, config: DispatchConfig) -> Self {
        Self { registry, config, cursor: Arc::new(Mutex::new(0)) }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Pick and reserve one worker.
    ///
    /// `Ok(None)` means nobody can take the request right now. An idle pick
    /// is moved to busy atomically; if another caller got there first this
    /// returns `Contended` and the caller should select again.
    pub async fn select_worker(
        &self,
        requirements: &DispatchRequirements,
        strategy: SelectionStrategy,
    ) -> Result<Option<WorkerAssignment>> {
        let available = self.registry.list_available().await;
        if available.is_empty() {
            tracing::warn!("No available workers for request");
            return Ok(None);
        }

        let high_load = summarize(&available).idle_ratio() < self.config.high_load_idle_ratio;
        let candidates = filter_candidates(
            &available,
            requirements,
            high_load,
            self.config.min_performance_score,
        );
        if candidates.is_empty() {
            tracing::warn!(
                available = available.len(),
                high_load,
                "No suitable workers found for request requirements"
            );
            return Ok(None);
        }

        let chosen = match strategy {
            SelectionStrategy::Performance => select_by_performance(&candidates),
            SelectionStrategy::RoundRobin => self.select_round_robin(&candidates).await,
            SelectionStrategy::LeastLoaded => select_least_loaded(&candidates),
            SelectionStrategy::Random => select_random(&candidates),
        };
        let Some(chosen) = chosen else {
            return Ok(None);
        };

        if chosen.status == WorkerStatus::Idle && !self.registry.try_mark_busy(&chosen.worker_id).await? {
            return Err(FleetError::Contended(chosen.worker_id.clone()));
        }

        tracing::info!(
            worker_id = %chosen.worker_id,
            strategy = ?strategy,
            score = chosen.performance_score,
            "Selected worker"
        );
        Ok(Some(WorkerAssignment {
            worker_id: chosen.worker_id.clone(),
            ip_address: chosen.ip_address.clone(),
            port: chosen.port,
            performance_score: chosen.performance_score,
        }))
    }

    /// [`select_worker`](Self::select_worker), re-run on contention. No
    /// capacity becomes `CapacityExhausted`.
    pub async fn dispatch(
        &self,
        requirements: &DispatchRequirements,
        strategy: SelectionStrategy,
    ) -> Result<WorkerAssignment> {
        for attempt in 1..=self.config.max_selection_attempts.max(1) {
            match self.select_worker(requirements, strategy).await {
                Ok(Some(assignment)) => return Ok(assignment),
                Ok(None) => return Err(FleetError::CapacityExhausted),
                Err(FleetError::Contended(worker_id)) => {
                    tracing::debug!(worker_id = %worker_id, attempt, "Lost worker reservation, reselecting");
                }
                Err(e) => return Err(e),
            }
        }
        Err(FleetError::CapacityExhausted)
    }

    /// Hand a worker back to the pool. Call once per dispatch, whatever the outcome.
    pub async fn release_worker(&self, worker_id: &str) -> Result<()> {
        self.registry.mark_idle(worker_id).await?;
        tracing::debug!(worker_id = %worker_id, "Released worker");
        Ok(())
    }

    pub async fn worker_load(&self) -> FleetLoad {
        summarize(&self.registry.list_available().await)
    }

    /// Sweep stale workers, then grade the remaining fleet
    pub async fn health_check(&self) -> HealthReport {
        let removed = self.registry.sweep_offline(self.config.idle_threshold_secs).await;
        let load = self.worker_load().await;
        let health_score = health_score(&load);
        let status = if health_score > 70.0 {
            HealthStatus::Healthy
        } else if health_score > 30.0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        };
        HealthReport {
            status,
            health_score,
            load,
            removed_offline_workers: removed,
            timestamp: Utc::now(),
        }
    }

    async fn select_round_robin<'a>(&self, candidates: &[&'a Worker]) -> Option<&'a Worker> {
        let mut idle: Vec<&Worker> = candidates
            .iter()
            .copied()
            .filter(|w| w.status == WorkerStatus::Idle)
            .collect();
        if idle.is_empty() {
            return select_by_performance(candidates);
        }
        idle.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

        let mut cursor = self.cursor.lock().await;
        let index = *cursor % idle.len();
        *cursor = index + 1;
        Some(idle[index])
    }
}

fn summarize(workers: &[Worker]) -> FleetLoad {
    let mut load = FleetLoad { total_workers: workers.len(), ..Default::default() };
    if workers.is_empty() {
        return load;
    }
    for w in workers {
        match w.status {
            WorkerStatus::Idle => load.idle_workers += 1,
            WorkerStatus::Busy => load.busy_workers += 1,
            _ => {}
        }
    }
    let n = workers.len() as f64;
    load.avg_performance = round2(workers.iter().map(|w| w.performance_score).sum::<f64>() / n);
    load.avg_response_time = round2(workers.iter().map(|w| w.avg_response_time).sum::<f64>() / n);
    load
}

/// Free GPU memory (GB) a request is expected to need
pub fn estimate_memory_requirement(requirements: &DispatchRequirements) -> f64 {
    let duration_multiplier = (requirements.generation_duration / 6.0).min(2.0);
    let stems_multiplier = if requirements.wants_stems() { 1.5 } else { 1.0 };
    BASE_MEMORY_GB * duration_multiplier * stems_multiplier
}

/// Workers able to take the request. Busy workers only qualify under high load.
fn filter_candidates<'a>(
    workers: &'a [Worker],
    requirements: &DispatchRequirements,
    high_load: bool,
    min_score: f64,
) -> Vec<&'a Worker> {
    let needed_memory = estimate_memory_requirement(requirements);
    let mut required = vec![CAP_STABLE_AUDIO, CAP_LLM];
    if requirements.wants_stems() {
        required.push(CAP_STEMS);
    }

    workers
        .iter()
        .filter(|w| matches!(w.status, WorkerStatus::Idle | WorkerStatus::Busy))
        .filter(|w| w.status != WorkerStatus::Busy || high_load)
        .filter(|w| !w.gpu.is_empty() && w.gpu.free_memory() >= needed_memory)
        .filter(|w| w.capabilities.contains_all(required.iter().copied()))
        .filter(|w| w.performance_score >= min_score)
        .collect()
}

/// Highest score wins; near-ties go to the faster worker. Idle workers are
/// preferred over busy ones.
fn select_by_performance<'a>(candidates: &[&'a Worker]) -> Option<&'a Worker> {
    let idle: Vec<&Worker> = candidates
        .iter()
        .copied()
        .filter(|w| w.status == WorkerStatus::Idle)
        .collect();
    let pool: &[&Worker] = if idle.is_empty() { candidates } else { &idle };

    let top = pool.iter().map(|w| w.performance_score).reduce(f64::max)?;
    pool.iter()
        .copied()
        .filter(|w| top - w.performance_score < SCORE_TIE_EPSILON)
        .min_by(|a, b| a.avg_response_time.total_cmp(&b.avg_response_time))
}

fn select_least_loaded<'a>(candidates: &[&'a Worker]) -> Option<&'a Worker> {
    let load = |w: &Worker| w.gpu.gpu_memory_used + w.gpu.queue_size as f64 * 10.0;
    let mut sorted = candidates.to_vec();
    sorted.sort_by(|a, b| load(*a).total_cmp(&load(*b)));
    sorted
        .iter()
        .copied()
        .find(|w| w.status == WorkerStatus::Idle)
        .or_else(|| sorted.first().copied())
}

fn select_random<'a>(candidates: &[&'a Worker]) -> Option<&'a Worker> {
    let idle: Vec<&Worker> = candidates
        .iter()
        .copied()
        .filter(|w| w.status == WorkerStatus::Idle)
        .collect();
    let mut rng = rand::thread_rng();
    if idle.is_empty() {
        candidates.choose(&mut rng).copied()
    } else {
        idle.choose(&mut rng).copied()
    }
}

/// Fleet health in [0, 100]. Each factor has exclusive tiers: the harsher
/// multiplier applies below the lower bound, the milder one only between bounds.
fn health_score(load: &FleetLoad) -> f64 {
    if load.total_workers == 0 {
        return 0.0;
    }
    let mut score = 100.0;

    let idle_ratio = load.idle_ratio();
    if idle_ratio < 0.1 {
        score *= 0.3;
    } else if idle_ratio < 0.3 {
        score *= 0.7;
    }

    if load.avg_performance < 30.0 {
        score *= 0.5;
    } else if load.avg_performance < 50.0 {
        score *= 0.8;
    }

    if load.avg_response_time > 30_000.0 {
        score *= 0.6;
    } else if load.avg_response_time > 15_000.0 {
        score *= 0.8;
    }

    (f64::max(score, 0.0) * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::register_request;
    use chrono::Duration;
    use std::collections::HashSet;

    async fn fleet(specs: &[(&str, f64, f64)]) -> Dispatcher {
        let registry = WorkerRegistry::new(300);
        for (id, score, free_gb) in specs {
            registry.register(register_request(id, 24.0, 24.0 - free_gb)).await.unwrap();
            let score = *score;
            registry.with_worker(id, |w| w.performance_score = score).await;
        }
        Dispatcher::new(registry, DispatchConfig::default())
    }

    fn worker(id: &str, status: WorkerStatus, score: f64) -> Worker {
        let now = Utc::now();
        Worker {
            worker_id: id.into(),
            worker_name: None,
            ip_address: "10.0.0.9".into(),
            port: 8001,
            session_token: String::new(),
            status,
            capabilities: fleet_protocol::CapabilitySet::from_tags([CAP_STABLE_AUDIO, CAP_LLM]),
            gpu: fleet_protocol::GpuSnapshot {
                gpu_memory_total: 24.0,
                gpu_memory_used: 4.0,
                ..Default::default()
            },
            docker_image_hash: None,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            avg_response_time: 0.0,
            performance_score: score,
            registered_at: now,
            last_heartbeat: now,
        }
    }

    #[tokio::test]
    async fn test_performance_prefers_highest_score() {
        let d = fleet(&[("a", 95.0, 20.0), ("b", 60.0, 20.0)]).await;
        let pick = d
            .select_worker(&DispatchRequirements::default(), SelectionStrategy::Performance)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pick.worker_id, "a");
        assert_eq!(d.registry().get("a").await.unwrap().status, WorkerStatus::Busy);
        assert_eq!(d.registry().get("b").await.unwrap().status, WorkerStatus::Idle);
    }

    #[test]
    fn test_busy_workers_excluded_without_high_load() {
        let workers = vec![worker("a", WorkerStatus::Busy, 90.0), worker("b", WorkerStatus::Busy, 90.0)];
        // Fleet idle ratio of 0.5 is not high load
        let high_load = 0.5 < DispatchConfig::default().high_load_idle_ratio;
        let reqs = DispatchRequirements::default();
        assert!(filter_candidates(&workers, &reqs, high_load, 20.0).is_empty());
        assert_eq!(filter_candidates(&workers, &reqs, true, 20.0).len(), 2);
    }

    #[test]
    fn test_filter_drops_low_score_and_short_memory() {
        let mut low_mem = worker("mem", WorkerStatus::Idle, 90.0);
        low_mem.gpu.gpu_memory_used = 20.0;
        let mut no_gpu = worker("nogpu", WorkerStatus::Idle, 90.0);
        no_gpu.gpu = Default::default();
        let workers = vec![
            worker("ok", WorkerStatus::Idle, 20.0),
            worker("weak", WorkerStatus::Idle, 19.99),
            worker("gone", WorkerStatus::Offline, 90.0),
            low_mem,
            no_gpu,
        ];
        let ids: Vec<_> = filter_candidates(&workers, &DispatchRequirements::default(), true, 20.0)
            .into_iter()
            .map(|w| w.worker_id.as_str())
            .collect();
        assert_eq!(ids, vec!["ok"]);
    }

    #[test]
    fn test_stems_need_capability_and_more_memory() {
        let reqs = DispatchRequirements {
            generation_duration: 12.0,
            preferred_stems: vec!["drums".into()],
            ..Default::default()
        };
        assert_eq!(estimate_memory_requirement(&reqs), 24.0);
        assert_eq!(
            estimate_memory_requirement(&DispatchRequirements { generation_duration: 30.0, ..Default::default() }),
            16.0
        );

        let mut stems = worker("stems", WorkerStatus::Idle, 90.0);
        stems.capabilities = fleet_protocol::CapabilitySet::from_tags([CAP_STABLE_AUDIO, CAP_LLM, CAP_STEMS]);
        stems.gpu.gpu_memory_used = 0.0;
        let workers = vec![worker("plain", WorkerStatus::Idle, 90.0), stems];
        let reqs = DispatchRequirements { preferred_stems: vec!["bass".into()], ..Default::default() };
        let ids: Vec<_> = filter_candidates(&workers, &reqs, false, 20.0)
            .into_iter()
            .map(|w| w.worker_id.as_str())
            .collect();
        assert_eq!(ids, vec!["stems"]);
    }

    #[test]
    fn test_performance_tie_breaks_on_latency_and_prefers_idle() {
        let mut slow = worker("slow", WorkerStatus::Idle, 80.05);
        slow.avg_response_time = 5000.0;
        let mut fast = worker("fast", WorkerStatus::Idle, 80.0);
        fast.avg_response_time = 1000.0;
        let busy = worker("busy", WorkerStatus::Busy, 99.0);
        let all = [&slow, &fast, &busy];
        assert_eq!(select_by_performance(&all).unwrap().worker_id, "fast");
        assert_eq!(select_by_performance(&[&busy]).unwrap().worker_id, "busy");
    }

    #[test]
    fn test_least_loaded_prefers_idle() {
        let mut queued = worker("queued", WorkerStatus::Idle, 90.0);
        queued.gpu.gpu_memory_used = 1.0;
        queued.gpu.queue_size = 2;
        let mut light = worker("light", WorkerStatus::Idle, 90.0);
        light.gpu.gpu_memory_used = 6.0;
        let mut busy = worker("busy", WorkerStatus::Busy, 90.0);
        busy.gpu.gpu_memory_used = 0.0;
        assert_eq!(select_least_loaded(&[&queued, &light, &busy]).unwrap().worker_id, "light");
    }

    #[test]
    fn test_random_picks_idle_when_present() {
        let idle = worker("idle", WorkerStatus::Idle, 50.0);
        let busy = worker("busy", WorkerStatus::Busy, 90.0);
        for _ in 0..20 {
            assert_eq!(select_random(&[&busy, &idle]).unwrap().worker_id, "idle");
        }
        assert_eq!(select_random(&[&busy]).unwrap().worker_id, "busy");
    }

    #[tokio::test]
    async fn test_round_robin_visits_each_idle_worker_once_per_cycle() {
        let d = fleet(&[("c", 90.0, 20.0), ("a", 90.0, 20.0), ("b", 90.0, 20.0)]).await;
        let reqs = DispatchRequirements::default();
        let mut order = Vec::new();
        for _ in 0..6 {
            let pick = d
                .select_worker(&reqs, SelectionStrategy::RoundRobin)
                .await
                .unwrap()
                .unwrap();
            d.release_worker(&pick.worker_id).await.unwrap();
            order.push(pick.worker_id);
        }
        assert_eq!(order, vec!["a", "b", "c", "a", "b", "c"]);
        let first_cycle: HashSet<_> = order[..3].iter().collect();
        assert_eq!(first_cycle.len(), 3);
    }

    #[tokio::test]
    async fn test_round_robin_cursor_is_shared_between_clones() {
        let d = fleet(&[("a", 90.0, 20.0), ("b", 90.0, 20.0)]).await;
        let other = d.clone();
        let reqs = DispatchRequirements::default();
        let first = d.select_worker(&reqs, SelectionStrategy::RoundRobin).await.unwrap().unwrap();
        d.release_worker(&first.worker_id).await.unwrap();
        let second = other.select_worker(&reqs, SelectionStrategy::RoundRobin).await.unwrap().unwrap();
        assert_ne!(first.worker_id, second.worker_id);
    }

    #[tokio::test]
    async fn test_never_selects_offline_or_weak_workers() {
        let d = fleet(&[("weak", 10.0, 20.0), ("stale", 99.0, 20.0)]).await;
        d.registry()
            .with_worker("stale", |w| w.last_heartbeat = Utc::now() - Duration::seconds(400))
            .await;
        for strategy in [
            SelectionStrategy::Performance,
            SelectionStrategy::RoundRobin,
            SelectionStrategy::LeastLoaded,
            SelectionStrategy::Random,
        ] {
            let pick = d.select_worker(&DispatchRequirements::default(), strategy).await.unwrap();
            assert!(pick.is_none());
        }
        assert!(matches!(
            d.dispatch(&DispatchRequirements::default(), SelectionStrategy::Performance).await,
            Err(FleetError::CapacityExhausted)
        ));
    }

    #[tokio::test]
    async fn test_dispatch_reserves_distinct_workers() {
        let d = fleet(&[("a", 90.0, 20.0), ("b", 80.0, 20.0), ("c", 70.0, 20.0), ("d", 60.0, 20.0), ("e", 50.0, 20.0)])
            .await;
        let mut handles = Vec::new();
        for _ in 0..4 {
            let d = d.clone();
            handles.push(tokio::spawn(async move {
                d.dispatch(&DispatchRequirements::default(), SelectionStrategy::Performance).await
            }));
        }
        let mut picked = HashSet::new();
        for h in handles {
            if let Ok(assignment) = h.await.unwrap() {
                assert!(picked.insert(assignment.worker_id), "worker reserved twice");
            }
        }
        assert!(!picked.is_empty());
    }

    #[tokio::test]
    async fn test_busy_fallback_under_high_load() {
        let d = fleet(&[("a", 90.0, 20.0)]).await;
        let reqs = DispatchRequirements::default();
        let first = d.dispatch(&reqs, SelectionStrategy::Performance).await.unwrap();
        // The only worker is busy, so the idle ratio is 0 and it stays eligible
        let second = d.dispatch(&reqs, SelectionStrategy::Performance).await.unwrap();
        assert_eq!(first.worker_id, second.worker_id);
    }

    #[tokio::test]
    async fn test_health_check() {
        let empty = Dispatcher::new(WorkerRegistry::new(300), DispatchConfig::default());
        let report = empty.health_check().await;
        assert_eq!(report.health_score, 0.0);
        assert_eq!(report.status, HealthStatus::Critical);

        let d = fleet(&[("a", 40.0, 20.0), ("b", 40.0, 20.0), ("stale", 40.0, 20.0)]).await;
        d.registry()
            .with_worker("stale", |w| w.last_heartbeat = Utc::now() - Duration::seconds(400))
            .await;
        let report = d.health_check().await;
        assert_eq!(report.removed_offline_workers, 1);
        assert_eq!(report.load.total_workers, 2);
        // Average performance 40 costs 20%
        assert_eq!(report.health_score, 80.0);
        assert_eq!(report.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_health_score_tiers() {
        let load = FleetLoad {
            total_workers: 10,
            idle_workers: 2,
            busy_workers: 8,
            avg_performance: 25.0,
            avg_response_time: 20_000.0,
        };
        // 100 * 0.7 * 0.5 * 0.8
        assert_eq!(health_score(&load), 28.0);
    }
}
