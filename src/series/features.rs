use crate::error::SchedulerError;
use crate::series::CleanedSeries;
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset, Weekday};

pub const LAG_COUNT: usize = 3;
/// A feature row needs its own level plus three lagged levels.
pub const MIN_SERIES_ROWS: usize = LAG_COUNT + 1;
pub const PREDICTOR_COUNT: usize = 7;
pub const PREDICTOR_NAMES: [&str; PREDICTOR_COUNT] = [
    "hour",
    "day_of_week",
    "month",
    "is_weekend",
    "lag_1",
    "lag_2",
    "lag_3",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarFeatures {
    pub hour: u8,
    /// Monday is 0.
    pub day_of_week: u8,
    pub month: u8,
    pub is_weekend: bool,
}

impl CalendarFeatures {
    /// Calendar fields are read in UTC.
    pub fn at(timestamp: OffsetDateTime) -> Self {
        let timestamp = timestamp.to_offset(UtcOffset::UTC);
        let weekday = timestamp.weekday();
        Self {
            hour: timestamp.hour(),
            day_of_week: weekday.number_days_from_monday(),
            month: u8::from(timestamp.month()),
            is_weekend: matches!(weekday, Weekday::Saturday | Weekday::Sunday),
        }
    }
}

/// Model inputs, everything in a feature row except the target level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Predictors {
    pub hour: f64,
    pub day_of_week: f64,
    pub month: f64,
    pub is_weekend: f64,
    pub lag_1: f64,
    pub lag_2: f64,
    pub lag_3: f64,
}

impl Predictors {
    pub fn new(calendar: CalendarFeatures, lags: [f64; LAG_COUNT]) -> Self {
        Self {
            hour: f64::from(calendar.hour),
            day_of_week: f64::from(calendar.day_of_week),
            month: f64::from(calendar.month),
            is_weekend: if calendar.is_weekend { 1.0 } else { 0.0 },
            lag_1: lags[0],
            lag_2: lags[1],
            lag_3: lags[2],
        }
    }

    /// Column order follows [`PREDICTOR_NAMES`].
    pub fn to_array(&self) -> [f64; PREDICTOR_COUNT] {
        [
            self.hour,
            self.day_of_week,
            self.month,
            self.is_weekend,
            self.lag_1,
            self.lag_2,
            self.lag_3,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureRow {
    pub timestamp: OffsetDateTime,
    pub fill_level: f64,
    pub predictors: Predictors,
}

/// Derive calendar and lag features for every grid row with a full lag window.
pub fn extract_features(series: &CleanedSeries) -> Result<Vec<FeatureRow>, SchedulerError> {
    if series.len() < MIN_SERIES_ROWS {
        return Err(SchedulerError::InsufficientHistory {
            sensor_id: series.sensor_id,
            available: series.len(),
            required: MIN_SERIES_ROWS,
        });
    }

    let points = &series.points;
    let rows = (LAG_COUNT..points.len())
        .map(|i| {
            let point = points[i];
            let lags = [
                points[i - 1].fill_level,
                points[i - 2].fill_level,
                points[i - 3].fill_level,
            ];
            FeatureRow {
                timestamp: point.timestamp,
                fill_level: point.fill_level,
                predictors: Predictors::new(CalendarFeatures::at(point.timestamp), lags),
            }
        })
        .collect();
    Ok(rows)
}
