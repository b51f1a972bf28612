use std::sync::Arc;

use crate::detect::incident::IncidentManager;
use crate::ingest::Ingestor;
use crate::metrics::MemoryMetricStore;
use crate::rules::RuleRegistry;
use crate::storage::Pool;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub store: Arc<MemoryMetricStore>,
    pub ingestor: Arc<Ingestor>,
    pub registry: RuleRegistry,
    pub incidents: IncidentManager,
}

impl AppState {
    pub fn new(pool: Pool, store: Arc<MemoryMetricStore>, ingestor: Arc<Ingestor>) -> Self {
        Self {
            registry: RuleRegistry::new(pool.clone()),
            incidents: IncidentManager::new(pool.clone()),
            pool,
            store,
            ingestor,
        }
    }
}
