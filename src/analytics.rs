//! Latest fill levels across a region.

use crate::error::SchedulerError;
use crate::series::{RegionId, SensorId};
use crate::store::ReadingStore;
use serde::Serialize;
use time::OffsetDateTime;

/// How far back to look for a usable level: one day of 15-minute readings.
pub const LATEST_LEVEL_WINDOW: usize = 96;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorLevel {
    pub sensor_id: SensorId,
    pub name: String,
    pub fill_level: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionLevels {
    pub region_id: RegionId,
    pub sensors: Vec<SensorLevel>,
    /// Mean of the latest levels; absent when no sensor has a reading.
    pub average_fill_level: Option<f64>,
}

/// Latest valid reading of every sensor in the region, searched within the
/// newest [`LATEST_LEVEL_WINDOW`] readings. Sensors without one are left out
/// of both the list and the average.
pub async fn region_levels(
    region_id: RegionId,
    store: &dyn ReadingStore,
) -> Result<RegionLevels, SchedulerError> {
    let mut sensors = Vec::new();
    for sensor in store.get_region_sensors(region_id).await? {
        let recent = store.get_recent(sensor.sensor_id, LATEST_LEVEL_WINDOW).await?;
        if let Some(latest) = recent.into_iter().find(|reading| reading.has_valid_level()) {
            sensors.push(SensorLevel {
                sensor_id: sensor.sensor_id,
                name: sensor.name,
                fill_level: latest.fill_level,
                timestamp: latest.timestamp,
            });
        }
    }
    let average_fill_level = (!sensors.is_empty())
        .then(|| sensors.iter().map(|s| s.fill_level).sum::<f64>() / sensors.len() as f64);
    Ok(RegionLevels {
        region_id,
        sensors,
        average_fill_level,
    })
}
