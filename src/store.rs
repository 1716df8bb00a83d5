//! Reading store contract and an in-memory implementation.

use crate::error::SchedulerError;
use crate::series::{Reading, RegionId, SensorId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSensor {
    pub sensor_id: SensorId,
    pub region_id: RegionId,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub name: String,
}

#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Every reading of a sensor, oldest first.
    async fn get_history(&self, sensor_id: SensorId) -> Result<Vec<Reading>, SchedulerError>;

    /// Up to `n` most recent readings, newest first.
    async fn get_recent(&self, sensor_id: SensorId, n: usize)
    -> Result<Vec<Reading>, SchedulerError>;

    async fn get_region_sensors(&self, region_id: RegionId)
    -> Result<Vec<RegionSensor>, SchedulerError>;
}

/// Dataset file layout accepted by [`InMemoryReadingStore::load_from_path`].
#[derive(Debug, Default, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub sensors: Vec<RegionSensor>,
    #[serde(default)]
    pub readings: Vec<Reading>,
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read dataset: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse dataset: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Default)]
pub struct InMemoryReadingStore {
    readings: HashMap<SensorId, Vec<Reading>>,
    sensors: Vec<RegionSensor>,
}

impl InMemoryReadingStore {
    pub fn new(readings: Vec<Reading>, sensors: Vec<RegionSensor>) -> Self {
        let mut by_sensor: HashMap<SensorId, Vec<Reading>> = HashMap::new();
        for reading in readings {
            by_sensor.entry(reading.sensor_id).or_default().push(reading);
        }
        for history in by_sensor.values_mut() {
            history.sort_by_key(|reading| reading.timestamp);
        }
        Self {
            readings: by_sensor,
            sensors,
        }
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let contents = std::fs::read_to_string(path)?;
        let dataset: Dataset = serde_json::from_str(&contents)?;
        Ok(Self::new(dataset.readings, dataset.sensors))
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    pub fn reading_count(&self) -> usize {
        self.readings.values().map(Vec::len).sum()
    }

    /// Sensors with at least one reading, ascending.
    pub fn sensor_ids(&self) -> Vec<SensorId> {
        let mut ids: Vec<SensorId> = self.readings.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[async_trait]
impl ReadingStore for InMemoryReadingStore {
    async fn get_history(&self, sensor_id: SensorId) -> Result<Vec<Reading>, SchedulerError> {
        Ok(self.readings.get(&sensor_id).cloned().unwrap_or_default())
    }

    async fn get_recent(
        &self,
        sensor_id: SensorId,
        n: usize,
    ) -> Result<Vec<Reading>, SchedulerError> {
        let recent = self
            .readings
            .get(&sensor_id)
            .map(|history| history.iter().rev().take(n).cloned().collect())
            .unwrap_or_default();
        Ok(recent)
    }

    async fn get_region_sensors(
        &self,
        region_id: RegionId,
    ) -> Result<Vec<RegionSensor>, SchedulerError> {
        Ok(self
            .sensors
            .iter()
            .filter(|sensor| sensor.region_id == region_id)
            .cloned()
            .collect())
    }
}
