use crate::error::SchedulerError;
use crate::routing::{Coordinate, CostMatrix, CostOracle};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone)]
pub enum MockCostBehavior {
    /// Return this matrix regardless of the points.
    Fixed(Vec<Vec<Option<f64>>>),
    /// Straight-line distance in degrees between the points.
    StraightLine,
    /// Fail as an oracle reporting this status would.
    Fail(String),
}

/// In-process cost oracle that counts how often it is queried.
#[derive(Debug)]
pub struct MockCostOracle {
    behavior: MockCostBehavior,
    calls: AtomicUsize,
}

impl MockCostOracle {
    pub fn new(matrix: Vec<Vec<Option<f64>>>) -> Self {
        Self::with_behavior(MockCostBehavior::Fixed(matrix))
    }

    pub fn straight_line() -> Self {
        Self::with_behavior(MockCostBehavior::StraightLine)
    }

    pub fn failing(status: &str) -> Self {
        Self::with_behavior(MockCostBehavior::Fail(status.to_string()))
    }

    pub fn with_behavior(behavior: MockCostBehavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CostOracle for MockCostOracle {
    async fn cost_matrix(&self, points: &[Coordinate]) -> Result<CostMatrix, SchedulerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            MockCostBehavior::Fixed(rows) => CostMatrix::new(rows.clone()),
            MockCostBehavior::StraightLine => CostMatrix::new(
                points
                    .iter()
                    .map(|from| {
                        points
                            .iter()
                            .map(|to| {
                                Some(
                                    (from.latitude - to.latitude)
                                        .hypot(from.longitude - to.longitude),
                                )
                            })
                            .collect()
                    })
                    .collect(),
            ),
            MockCostBehavior::Fail(status) => Err(SchedulerError::RouteCostUnavailable(format!(
                "cost oracle status {status}"
            ))),
        }
    }
}
