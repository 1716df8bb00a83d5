//! Greedy nearest-neighbour sequencing of collection stops.
//!
//! Costs come from a [`CostOracle`] queried once per route for the full
//! `{origin} ∪ stops` point set. The visiting order starts at the origin and
//! repeatedly moves to the cheapest unvisited stop; on equal cost the stop
//! listed first wins, which keeps routes reproducible. No backtracking is
//! done, so the tour is an approximation.

use crate::error::SchedulerError;
use crate::series::SensorId;
use crate::store::RegionSensor;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

pub mod mock;
pub mod oracle;

pub use oracle::{CostMatrix, CostMetric, CostOracle, DistanceMatrixOracle};

pub const DEFAULT_LINK_BASE: &str = "https://www.google.com/maps/dir/?api=1";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, SchedulerError> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(SchedulerError::InvalidCoordinate(format!(
                "latitude {latitude} is outside [-90, 90]"
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(SchedulerError::InvalidCoordinate(format!(
                "longitude {longitude} is outside [-180, 180]"
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.latitude, self.longitude)
    }
}

/// A receptacle selected for collection. Location fields may be absent in
/// the reading store; such stops are rejected when a route is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub sensor_id: SensorId,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl Stop {
    pub fn coordinate(&self) -> Result<Coordinate, SchedulerError> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Coordinate::new(latitude, longitude),
            _ => Err(SchedulerError::InvalidCoordinate(format!(
                "sensor {} has no location",
                self.sensor_id
            ))),
        }
    }
}

impl From<&RegionSensor> for Stop {
    fn from(sensor: &RegionSensor) -> Self {
        Self {
            sensor_id: sensor.sensor_id,
            latitude: sensor.latitude,
            longitude: sensor.longitude,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RoutedStop {
    pub sensor_id: SensorId,
    pub coordinate: Coordinate,
    /// Cost of the leg arriving at this stop.
    pub leg_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Route {
    pub origin: Coordinate,
    pub stops: Vec<RoutedStop>,
    /// Stops left out because no leg reached them.
    pub unreachable: Vec<SensorId>,
    pub link: Option<String>,
}

impl Route {
    pub fn total_cost(&self) -> f64 {
        self.stops.iter().map(|stop| stop.leg_cost).sum()
    }
}

/// Order stops by greedy nearest neighbour from `origin`.
///
/// Every stop must carry a valid location; this is checked before the
/// oracle is called. An empty stop list yields an empty route without a
/// link.
pub async fn sequence_route(
    origin: Coordinate,
    stops: &[Stop],
    oracle: &dyn CostOracle,
    link_base: &str,
) -> Result<Route, SchedulerError> {
    let coordinates = stops
        .iter()
        .map(Stop::coordinate)
        .collect::<Result<Vec<_>, _>>()?;
    if stops.is_empty() {
        return Ok(Route {
            origin,
            stops: Vec::new(),
            unreachable: Vec::new(),
            link: None,
        });
    }

    let mut points = Vec::with_capacity(coordinates.len() + 1);
    points.push(origin);
    points.extend_from_slice(&coordinates);
    let matrix = oracle.cost_matrix(&points).await?;
    if matrix.size() != points.len() {
        return Err(SchedulerError::RouteCostUnavailable(format!(
            "cost matrix covers {} points, expected {}",
            matrix.size(),
            points.len()
        )));
    }

    let order = nearest_neighbour_order(&matrix);
    if order.is_empty() {
        return Err(SchedulerError::RouteCostUnavailable(
            "no stop is reachable from the origin".to_string(),
        ));
    }

    let mut visited = vec![false; stops.len()];
    let mut routed = Vec::with_capacity(order.len());
    for &(index, leg_cost) in &order {
        visited[index] = true;
        routed.push(RoutedStop {
            sensor_id: stops[index].sensor_id,
            coordinate: coordinates[index],
            leg_cost,
        });
    }
    let unreachable: Vec<SensorId> = stops
        .iter()
        .zip(&visited)
        .filter(|(_, visited)| !**visited)
        .map(|(stop, _)| stop.sensor_id)
        .collect();
    if !unreachable.is_empty() {
        warn!(?unreachable, "Route is partial, some stops are unreachable");
    }

    let ordered: Vec<Coordinate> = routed.iter().map(|stop| stop.coordinate).collect();
    let link = render_link(link_base, origin, &ordered);
    debug!(stops = routed.len(), "Route sequenced");
    Ok(Route {
        origin,
        stops: routed,
        unreachable,
        link,
    })
}

/// Visiting order as `(stop index, leg cost)`, stop indices counted from
/// zero after the origin row.
fn nearest_neighbour_order(matrix: &CostMatrix) -> Vec<(usize, f64)> {
    let stop_count = matrix.size().saturating_sub(1);
    let mut visited = vec![false; stop_count];
    let mut order = Vec::with_capacity(stop_count);
    let mut current = 0;

    while order.len() < stop_count {
        let mut best: Option<(usize, f64)> = None;
        for (index, done) in visited.iter().enumerate() {
            if *done {
                continue;
            }
            let Some(cost) = matrix.cost(current, index + 1) else {
                continue;
            };
            // Strict comparison keeps the first stop among equal costs.
            if best.is_none_or(|(_, best_cost)| cost < best_cost) {
                best = Some((index, cost));
            }
        }
        let Some((index, cost)) = best else {
            break;
        };
        visited[index] = true;
        order.push((index, cost));
        current = index + 1;
    }
    order
}

/// Multi-stop navigation link: the last stop is the destination and the
/// ones before it are pipe-separated waypoints.
pub fn render_link(base: &str, origin: Coordinate, ordered: &[Coordinate]) -> Option<String> {
    let (destination, waypoints) = ordered.split_last()?;
    let mut link = format!("{base}&origin={origin}&destination={destination}");
    if !waypoints.is_empty() {
        let joined: Vec<String> = waypoints.iter().map(Coordinate::to_string).collect();
        link.push_str("&waypoints=");
        link.push_str(&joined.join("|"));
    }
    Some(link)
}
