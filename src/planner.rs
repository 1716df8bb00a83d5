//! Request-scoped orchestration: region sensors, urgency, then route.

use crate::error::SchedulerError;
use crate::forecast::ForecastSettings;
use crate::model::ModelRegistry;
use crate::routing::{Coordinate, CostOracle, DEFAULT_LINK_BASE, Route, Stop, sequence_route};
use crate::schedule::{ScheduleSettings, select_urgent_stops};
use crate::series::RegionId;
use crate::store::ReadingStore;
use time::OffsetDateTime;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct PlannerSettings {
    pub forecast: ForecastSettings,
    pub schedule: ScheduleSettings,
    pub link_base: String,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            forecast: ForecastSettings::default(),
            schedule: ScheduleSettings::default(),
            link_base: DEFAULT_LINK_BASE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionPlan {
    pub region_id: RegionId,
    pub next_collection: OffsetDateTime,
    pub urgent: Vec<Stop>,
    /// Absent when nothing in the region is urgent.
    pub route: Option<Route>,
}

/// Plan a collection run for one region starting at `origin`.
///
/// Per-sensor forecast failures only shrink the urgent set; routing
/// failures abort the whole plan.
pub async fn plan_collection(
    origin: Coordinate,
    region_id: RegionId,
    store: &dyn ReadingStore,
    registry: &ModelRegistry,
    oracle: &dyn CostOracle,
    settings: &PlannerSettings,
    now: OffsetDateTime,
) -> Result<CollectionPlan, SchedulerError> {
    let sensors = store.get_region_sensors(region_id).await?;
    let policy = settings.schedule.policy(now);
    let next_collection = policy.window.next_collection_time();

    let urgent =
        select_urgent_stops(&sensors, store, registry, &settings.forecast, &policy).await;
    info!(
        region_id,
        sensors = sensors.len(),
        urgent = urgent.len(),
        next_collection = %next_collection,
        "Urgent stops selected"
    );

    let route = if urgent.is_empty() {
        None
    } else {
        Some(sequence_route(origin, &urgent, oracle, &settings.link_base).await?)
    };

    Ok(CollectionPlan {
        region_id,
        next_collection,
        urgent,
        route,
    })
}
