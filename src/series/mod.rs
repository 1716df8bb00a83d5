//! Fill-level time series: raw readings, the cleaned grid, and model features.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

pub mod features;
pub mod preprocess;

pub type SensorId = u32;
pub type RegionId = u32;

/// Grid cadence shared by cleaning, training, and the forecast rollout.
pub const DEFAULT_GRID_STEP: Duration = Duration::minutes(15);
pub const MIN_FILL_LEVEL: f64 = 0.0;
pub const MAX_FILL_LEVEL: f64 = 100.0;

/// A single fill-level observation as recorded by the reading store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub sensor_id: SensorId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub fill_level: f64,
}

impl Reading {
    pub fn new(sensor_id: SensorId, timestamp: OffsetDateTime, fill_level: f64) -> Self {
        Self {
            sensor_id,
            timestamp,
            fill_level,
        }
    }

    pub fn has_valid_level(&self) -> bool {
        self.fill_level.is_finite()
            && (MIN_FILL_LEVEL..=MAX_FILL_LEVEL).contains(&self.fill_level)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridPoint {
    pub timestamp: OffsetDateTime,
    pub fill_level: f64,
}

/// Readings resampled onto a uniform grid with every slot filled.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanedSeries {
    pub sensor_id: SensorId,
    pub step: Duration,
    pub points: Vec<GridPoint>,
}

impl CleanedSeries {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn levels(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().map(|point| point.fill_level)
    }

    /// Re-expose the grid as readings, e.g. to feed it back through cleaning.
    pub fn to_readings(&self) -> Vec<Reading> {
        self.points
            .iter()
            .map(|point| Reading::new(self.sensor_id, point.timestamp, point.fill_level))
            .collect()
    }
}
