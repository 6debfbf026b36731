use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;

use crate::attestation::AttestationService;
use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::generation::GenerationService;
use crate::ledger::RevenueAllocator;
use crate::registry::WorkerRegistry;
use crate::storage::REVENUE_FILE;
use crate::worker_client::WorkerClient;

pub struct AppState {
    pub config: ServerConfig,
    pub registry: WorkerRegistry,
    pub dispatcher: Dispatcher,
    pub revenue: RevenueAllocator,
    pub attestation: Arc<AttestationService>,
    pub generation: GenerationService,
    pub start_time: DateTime<Utc>,
}

impl AppState {
    /// Wire the services together. The attestation service is loaded by the
    /// caller so a missing key pair stops startup before anything else runs.
    pub fn new(config: ServerConfig, attestation: AttestationService) -> Arc<Self> {
        let registry = WorkerRegistry::new(config.dispatch.idle_threshold_secs);
        let dispatcher = Dispatcher::new(registry.clone(), config.dispatch.clone());
        let revenue = RevenueAllocator::new(
            config.revenue,
            registry.clone(),
            Some(Path::new(&config.data_dir).join(REVENUE_FILE)),
        );
        let attestation = Arc::new(attestation);
        let generation = GenerationService::new(
            dispatcher.clone(),
            WorkerClient::new(config.dispatch.worker_timeout),
            attestation.clone(),
        );
        Arc::new(Self {
            config,
            registry,
            dispatcher,
            revenue,
            attestation,
            generation,
            start_time: Utc::now(),
        })
    }
}
