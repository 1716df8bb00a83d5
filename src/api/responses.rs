use crate::routing::RoutedStop;
use crate::series::{RegionId, SensorId};
use serde::{Deserialize, Serialize};

/// A coordinate sent either as a JSON number or as a numeric string.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CoordinateValue {
    Number(f64),
    Text(String),
}

impl CoordinateValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CoordinateValue::Number(value) => Some(*value),
            CoordinateValue::Text(text) => text.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteRequest {
    pub latitude: CoordinateValue,
    pub longitude: CoordinateValue,
    pub region_id: RegionId,
}

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    Routed,
    NothingUrgent,
    Error,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct RouteSuccessResponse {
    pub status: RouteStatus,
    /// Navigation link, or a note that nothing needs collecting.
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stops: Option<Vec<RoutedStop>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unreachable: Vec<SensorId>,
    pub next_collection: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct RouteErrorResponse {
    pub status: RouteStatus,
    pub message: String,
    pub error_code: ErrorCode,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ForecastSuccessResponse {
    pub sensor_id: SensorId,
    pub predicted_timestamp: String,
    pub hours_until_full: f64,
    pub predicted_level: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct SensorLevelResponse {
    pub sensor_id: SensorId,
    pub name: String,
    pub fill_level: f64,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct RegionLevelsResponse {
    pub region_id: RegionId,
    pub sensors: Vec<SensorLevelResponse>,
    pub average_fill_level: Option<f64>,
    pub timestamp: String,
}

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct HealthSuccessResponse {
    pub status: HealthStatus,
    pub models_loaded: usize,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ErrorResponse {
    pub error_code: ErrorCode,
    pub error_message: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    InvalidCoordinate,
    RouteCostUnavailable,
    UntrainedModel,
    InsufficientHistory,
    EmptyDataset,
    NoCrossingWithinHorizon,
    StoreUnavailable,
    InternalError,
}
