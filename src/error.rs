use crate::series::SensorId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no readings available for sensor {sensor_id}")]
    EmptyDataset { sensor_id: SensorId },
    #[error("insufficient history for sensor {sensor_id}: {available} rows, need {required}")]
    InsufficientHistory {
        sensor_id: SensorId,
        available: usize,
        required: usize,
    },
    #[error("no trained model for sensor {sensor_id}")]
    UntrainedModel { sensor_id: SensorId },
    #[error("route cost unavailable: {0}")]
    RouteCostUnavailable(String),
    #[error("invalid coordinate: {0}")]
    InvalidCoordinate(String),
    #[error("sensor {sensor_id} does not reach the threshold within {steps} steps")]
    HorizonExhausted { sensor_id: SensorId, steps: u32 },
    #[error("reading store error: {0}")]
    Store(String),
}

impl SchedulerError {
    /// Errors that only mean a sensor has no usable forecast right now.
    pub fn is_missing_forecast(&self) -> bool {
        matches!(
            self,
            Self::EmptyDataset { .. }
                | Self::InsufficientHistory { .. }
                | Self::UntrainedModel { .. }
                | Self::HorizonExhausted { .. }
        )
    }
}
