use crate::model::ModelRegistry;
use crate::planner::PlannerSettings;
use crate::routing::CostOracle;
use crate::store::ReadingStore;
use std::fmt;
use std::sync::Arc;

/// Shared, read-only dependencies of every request.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ReadingStore>,
    pub registry: Arc<ModelRegistry>,
    pub oracle: Arc<dyn CostOracle>,
    pub settings: Arc<PlannerSettings>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn ReadingStore>,
        registry: ModelRegistry,
        oracle: Arc<dyn CostOracle>,
        settings: PlannerSettings,
    ) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            oracle,
            settings: Arc::new(settings),
        }
    }

    pub fn models_loaded(&self) -> usize {
        self.registry.len()
    }
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("models_loaded", &self.registry.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
