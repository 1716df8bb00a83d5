//! Autoregressive rollout estimating when a receptacle reaches its threshold.

use crate::error::SchedulerError;
use crate::model::{ModelRegistry, RegressionModel};
use crate::series::features::{CalendarFeatures, LAG_COUNT, Predictors};
use crate::series::{DEFAULT_GRID_STEP, Reading, SensorId};
use crate::store::ReadingStore;
use serde::Serialize;
use time::{Duration, OffsetDateTime, UtcOffset};
use tracing::debug;

pub const DEFAULT_THRESHOLD: f64 = 90.0;
/// Seven days of 15-minute steps.
pub const DEFAULT_STEP_CAP: u32 = 672;
/// Upper bound accepted from configuration.
pub const MAX_STEP_CAP: u32 = 10_000;
/// The current level plus three lags.
pub const RECENT_OBSERVATIONS: usize = LAG_COUNT + 1;

#[derive(Debug, Clone, PartialEq)]
pub struct ForecastSettings {
    pub threshold: f64,
    pub step_cap: u32,
    pub step: Duration,
}

impl Default for ForecastSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            step_cap: DEFAULT_STEP_CAP,
            step: DEFAULT_GRID_STEP,
        }
    }
}

impl ForecastSettings {
    fn hours_per_step(&self) -> f64 {
        self.step.as_seconds_f64() / 3600.0
    }
}

/// The four most recent levels carried from one rollout step to the next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LagState {
    pub current: f64,
    pub lag_1: f64,
    pub lag_2: f64,
    pub lag_3: f64,
}

impl LagState {
    /// Builds the state from readings ordered newest first.
    pub fn from_recent(
        sensor_id: SensorId,
        recent: &[Reading],
    ) -> Result<(Self, OffsetDateTime), SchedulerError> {
        let usable: Vec<&Reading> = recent
            .iter()
            .filter(|r| r.has_valid_level())
            .take(RECENT_OBSERVATIONS)
            .collect();
        if usable.len() < RECENT_OBSERVATIONS {
            return Err(SchedulerError::InsufficientHistory {
                sensor_id,
                available: usable.len(),
                required: RECENT_OBSERVATIONS,
            });
        }
        let state = Self {
            current: usable[0].fill_level,
            lag_1: usable[1].fill_level,
            lag_2: usable[2].fill_level,
            lag_3: usable[3].fill_level,
        };
        Ok((state, usable[0].timestamp.to_offset(UtcOffset::UTC)))
    }

    pub fn lags(&self) -> [f64; LAG_COUNT] {
        [self.lag_1, self.lag_2, self.lag_3]
    }

    /// Shift the chain so the prediction becomes the newest level.
    pub fn advance(self, prediction: f64) -> Self {
        Self {
            current: prediction,
            lag_1: prediction,
            lag_2: self.lag_1,
            lag_3: self.lag_2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Crossing {
    pub predicted_timestamp: OffsetDateTime,
    pub hours_until_full: f64,
    pub predicted_level: f64,
    pub steps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RolloutPhase {
    Ready,
    Stepping,
    Found(Crossing),
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RolloutOutcome {
    Found(Crossing),
    /// No crossing within the step cap; carries no timestamp on purpose.
    Exhausted { steps: u32, last_level: f64 },
}

/// Step-by-step rollout over one model and lag chain.
#[derive(Debug)]
pub struct Rollout<'a> {
    model: &'a dyn RegressionModel,
    settings: &'a ForecastSettings,
    anchor: OffsetDateTime,
    state: LagState,
    step: u32,
    phase: RolloutPhase,
}

impl<'a> Rollout<'a> {
    pub fn new(
        model: &'a dyn RegressionModel,
        state: LagState,
        anchor: OffsetDateTime,
        settings: &'a ForecastSettings,
    ) -> Self {
        Self {
            model,
            settings,
            anchor,
            state,
            step: 0,
            phase: RolloutPhase::Ready,
        }
    }

    pub fn phase(&self) -> RolloutPhase {
        self.phase
    }

    pub fn state(&self) -> LagState {
        self.state
    }

    pub fn steps_taken(&self) -> u32 {
        self.step
    }

    /// Advance by one step; terminal phases are returned unchanged.
    pub fn advance(&mut self) -> RolloutPhase {
        match self.phase {
            RolloutPhase::Found(_) | RolloutPhase::Exhausted => return self.phase,
            RolloutPhase::Ready if self.state.current >= self.settings.threshold => {
                self.phase = RolloutPhase::Found(Crossing {
                    predicted_timestamp: self.anchor,
                    hours_until_full: 0.0,
                    predicted_level: self.state.current,
                    steps: 0,
                });
                return self.phase;
            }
            RolloutPhase::Ready | RolloutPhase::Stepping => {}
        }

        if self.step >= self.settings.step_cap {
            self.phase = RolloutPhase::Exhausted;
            return self.phase;
        }

        // A step timestamp past the calendar's range ends the horizon.
        let next = self.step.saturating_add(1);
        let Some(timestamp) = i32::try_from(next)
            .ok()
            .and_then(|k| self.settings.step.checked_mul(k))
            .and_then(|offset| self.anchor.checked_add(offset))
        else {
            self.phase = RolloutPhase::Exhausted;
            return self.phase;
        };
        self.step = next;
        let predictors = Predictors::new(CalendarFeatures::at(timestamp), self.state.lags());
        let prediction = self.model.predict(&predictors);
        self.state = self.state.advance(prediction);

        self.phase = if prediction >= self.settings.threshold {
            RolloutPhase::Found(Crossing {
                predicted_timestamp: timestamp,
                hours_until_full: f64::from(self.step) * self.settings.hours_per_step(),
                predicted_level: prediction,
                steps: self.step,
            })
        } else if self.step >= self.settings.step_cap {
            RolloutPhase::Exhausted
        } else {
            RolloutPhase::Stepping
        };
        self.phase
    }

    pub fn run(mut self) -> RolloutOutcome {
        loop {
            match self.advance() {
                RolloutPhase::Found(crossing) => return RolloutOutcome::Found(crossing),
                RolloutPhase::Exhausted => {
                    return RolloutOutcome::Exhausted {
                        steps: self.step,
                        last_level: self.state.current,
                    };
                }
                RolloutPhase::Ready | RolloutPhase::Stepping => {}
            }
        }
    }
}

pub fn run_rollout(
    model: &dyn RegressionModel,
    state: LagState,
    anchor: OffsetDateTime,
    settings: &ForecastSettings,
) -> RolloutOutcome {
    Rollout::new(model, state, anchor, settings).run()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Forecast {
    pub sensor_id: SensorId,
    #[serde(with = "time::serde::rfc3339")]
    pub predicted_timestamp: OffsetDateTime,
    pub hours_until_full: f64,
    pub predicted_level: f64,
}

/// Forecast the threshold crossing for a sensor from its latest readings.
pub async fn forecast_sensor(
    sensor_id: SensorId,
    store: &dyn ReadingStore,
    registry: &ModelRegistry,
    settings: &ForecastSettings,
) -> Result<Forecast, SchedulerError> {
    let model = registry
        .get(sensor_id)
        .ok_or(SchedulerError::UntrainedModel { sensor_id })?;
    let recent = store.get_recent(sensor_id, RECENT_OBSERVATIONS).await?;
    let (state, anchor) = LagState::from_recent(sensor_id, &recent)?;

    match run_rollout(model.as_ref(), state, anchor, settings) {
        RolloutOutcome::Found(crossing) => {
            debug!(
                sensor_id,
                steps = crossing.steps,
                hours_until_full = crossing.hours_until_full,
                "Threshold crossing found"
            );
            Ok(Forecast {
                sensor_id,
                predicted_timestamp: crossing.predicted_timestamp,
                hours_until_full: crossing.hours_until_full,
                predicted_level: crossing.predicted_level,
            })
        }
        RolloutOutcome::Exhausted { steps, last_level } => {
            debug!(sensor_id, steps, last_level, "Rollout exhausted its horizon");
            Err(SchedulerError::HorizonExhausted { sensor_id, steps })
        }
    }
}
