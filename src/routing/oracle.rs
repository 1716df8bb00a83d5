use crate::error::SchedulerError;
use crate::routing::Coordinate;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_MATRIX_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/distancematrix/json";
pub const DEFAULT_ORACLE_TIMEOUT: Duration = Duration::from_secs(10);
const STATUS_OK: &str = "OK";

/// Which travel cost orders the route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostMetric {
    #[default]
    Distance,
    Duration,
}

/// Square all-pairs cost table; `None` marks an unreachable leg.
#[derive(Debug, Clone, PartialEq)]
pub struct CostMatrix {
    rows: Vec<Vec<Option<f64>>>,
}

impl CostMatrix {
    pub fn new(rows: Vec<Vec<Option<f64>>>) -> Result<Self, SchedulerError> {
        let size = rows.len();
        if let Some(row) = rows.iter().find(|row| row.len() != size) {
            return Err(SchedulerError::RouteCostUnavailable(format!(
                "cost matrix row has {} elements, expected {size}",
                row.len()
            )));
        }
        Ok(Self { rows })
    }

    pub fn size(&self) -> usize {
        self.rows.len()
    }

    /// Cost from point `from` to point `to`, if the leg is usable.
    pub fn cost(&self, from: usize, to: usize) -> Option<f64> {
        self.rows
            .get(from)
            .and_then(|row| row.get(to))
            .copied()
            .flatten()
            .filter(|cost| cost.is_finite() && *cost >= 0.0)
    }
}

/// Source of pairwise travel costs for a point set.
#[async_trait]
pub trait CostOracle: Send + Sync {
    /// Costs between every pair of `points`, in the given order.
    async fn cost_matrix(&self, points: &[Coordinate]) -> Result<CostMatrix, SchedulerError>;
}

#[derive(Debug, Deserialize)]
struct MatrixResponse {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    rows: Vec<MatrixRow>,
}

#[derive(Debug, Deserialize)]
struct MatrixRow {
    #[serde(default)]
    elements: Vec<MatrixElement>,
}

#[derive(Debug, Deserialize)]
struct MatrixElement {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    distance: Option<MatrixValue>,
    #[serde(default)]
    duration: Option<MatrixValue>,
}

#[derive(Debug, Deserialize)]
struct MatrixValue {
    value: f64,
}

impl MatrixElement {
    fn cost(&self, metric: CostMetric) -> Option<f64> {
        if self.status.as_deref().is_some_and(|status| status != STATUS_OK) {
            return None;
        }
        let value = match metric {
            CostMetric::Distance => self.distance.as_ref(),
            CostMetric::Duration => self.duration.as_ref(),
        };
        value.map(|value| value.value)
    }
}

/// HTTP distance-matrix client issuing one all-pairs request per route.
#[derive(Debug, Clone)]
pub struct DistanceMatrixOracle {
    client: Client,
    endpoint: String,
    api_key: String,
    metric: CostMetric,
}

impl DistanceMatrixOracle {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        metric: CostMetric,
        timeout: Duration,
    ) -> Result<Self, SchedulerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| {
                SchedulerError::RouteCostUnavailable(format!("failed to create HTTP client: {err}"))
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            metric,
        })
    }

    pub fn metric(&self) -> CostMetric {
        self.metric
    }
}

#[async_trait]
impl CostOracle for DistanceMatrixOracle {
    async fn cost_matrix(&self, points: &[Coordinate]) -> Result<CostMatrix, SchedulerError> {
        let joined = points
            .iter()
            .map(Coordinate::to_string)
            .collect::<Vec<_>>()
            .join("|");
        debug!(points = points.len(), metric = ?self.metric, "Requesting cost matrix");

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("origins", joined.as_str()),
                ("destinations", joined.as_str()),
                ("key", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|err| {
                SchedulerError::RouteCostUnavailable(format!("cost oracle request failed: {err}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(%status, "Cost oracle returned HTTP error");
            return Err(SchedulerError::RouteCostUnavailable(format!(
                "cost oracle returned HTTP {status}"
            )));
        }

        let body: MatrixResponse = response.json().await.map_err(|err| {
            SchedulerError::RouteCostUnavailable(format!("cost oracle response unreadable: {err}"))
        })?;
        parse_matrix(body, self.metric, points.len())
    }
}

fn parse_matrix(
    body: MatrixResponse,
    metric: CostMetric,
    expected: usize,
) -> Result<CostMatrix, SchedulerError> {
    if body.status != STATUS_OK {
        let detail = body.error_message.unwrap_or_default();
        return Err(SchedulerError::RouteCostUnavailable(
            format!("cost oracle status {} {detail}", body.status)
                .trim_end()
                .to_string(),
        ));
    }
    if body.rows.len() != expected {
        return Err(SchedulerError::RouteCostUnavailable(format!(
            "cost oracle returned {} rows for {expected} points",
            body.rows.len()
        )));
    }
    let rows = body
        .rows
        .iter()
        .map(|row| row.elements.iter().map(|element| element.cost(metric)).collect())
        .collect();
    CostMatrix::new(rows)
}
