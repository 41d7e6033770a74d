//! Shared state for the API server.

use crate::InstanceId;
use crate::config::RuntimeConfig;
use crate::coordinator::GlobalConcurrencyCoordinator;
use crate::llm::ProviderChain;
use crate::orchestrator::Orchestrator;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// State shared across all API handlers.
pub struct ApiState {
    pub started_at: Instant,
    pub runtime: Arc<RuntimeConfig>,
    pub chain: Arc<ProviderChain>,
    pub coordinator: Arc<GlobalConcurrencyCoordinator>,
    pub orchestrators: HashMap<InstanceId, Arc<Orchestrator>>,
}

impl ApiState {
    pub fn new(
        runtime: Arc<RuntimeConfig>,
        chain: Arc<ProviderChain>,
        coordinator: Arc<GlobalConcurrencyCoordinator>,
    ) -> Self {
        Self {
            started_at: Instant::now(),
            runtime,
            chain,
            coordinator,
            orchestrators: HashMap::new(),
        }
    }

    pub fn with_orchestrator(mut self, orchestrator: Arc<Orchestrator>) -> Self {
        self.orchestrators
            .insert(orchestrator.id().clone(), orchestrator);
        self
    }
}
