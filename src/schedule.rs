//! Collection schedule and urgency selection.

use crate::forecast::{Forecast, ForecastSettings, forecast_sensor};
use crate::model::ModelRegistry;
use crate::routing::Stop;
use crate::store::{ReadingStore, RegionSensor};
use futures::future::join_all;
use time::macros::datetime;
use time::{Duration, OffsetDateTime, PrimitiveDateTime};
use tracing::{debug, warn};

pub const DEFAULT_BUFFER_HOURS: f64 = 0.2;

/// Recurring pickup schedule evaluated against a reference "now".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollectionWindow {
    period: Duration,
    start_time: OffsetDateTime,
    reference_time: OffsetDateTime,
}

impl CollectionWindow {
    /// Returns `None` unless the frequency is positive and at least one second.
    pub fn new(
        frequency_hours: f64,
        start_time: OffsetDateTime,
        reference_time: OffsetDateTime,
    ) -> Option<Self> {
        if !frequency_hours.is_finite() || frequency_hours <= 0.0 {
            return None;
        }
        let seconds = (frequency_hours * 3600.0).round();
        if seconds < 1.0 || seconds > i64::MAX as f64 {
            return None;
        }
        Some(Self {
            period: Duration::seconds(seconds as i64),
            start_time,
            reference_time,
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn start_time(&self) -> OffsetDateTime {
        self.start_time
    }

    pub fn reference_time(&self) -> OffsetDateTime {
        self.reference_time
    }

    /// First instant `start_time + k * period` (k >= 0) not before the reference time.
    pub fn next_collection_time(&self) -> OffsetDateTime {
        let elapsed = self.reference_time - self.start_time;
        if elapsed <= Duration::ZERO {
            return self.start_time;
        }
        let period_ns = self.period.whole_nanoseconds();
        let cycles = (elapsed.whole_nanoseconds() + period_ns - 1) / period_ns;
        let offset = i64::try_from(cycles)
            .ok()
            .and_then(|cycles| self.period.whole_seconds().checked_mul(cycles))
            .map(Duration::seconds);
        match offset.and_then(|offset| self.start_time.checked_add(offset)) {
            Some(next) => next,
            None => PrimitiveDateTime::MAX.assume_utc(),
        }
    }

    /// Whether a receptacle full in `hours_until_full` overflows, less the
    /// buffer, no later than the next pickup.
    pub fn is_urgent(&self, hours_until_full: f64, buffer_hours: f64) -> bool {
        let Some(lead) = Duration::checked_seconds_f64((hours_until_full - buffer_hours) * 3600.0)
        else {
            return false;
        };
        match self.reference_time.checked_add(lead) {
            Some(adjusted_full_time) => adjusted_full_time <= self.next_collection_time(),
            None => false,
        }
    }
}

/// Configured pickup cadence. The reference time is pinned or taken from the
/// clock when a window is opened.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleSettings {
    template: CollectionWindow,
    pinned_reference: Option<OffsetDateTime>,
    pub buffer_hours: f64,
}

impl ScheduleSettings {
    pub fn new(
        frequency_hours: f64,
        start_time: OffsetDateTime,
        pinned_reference: Option<OffsetDateTime>,
        buffer_hours: f64,
    ) -> Option<Self> {
        if !buffer_hours.is_finite() {
            return None;
        }
        let template = CollectionWindow::new(frequency_hours, start_time, start_time)?;
        Some(Self {
            template,
            pinned_reference,
            buffer_hours,
        })
    }

    pub fn pinned_reference(&self) -> Option<OffsetDateTime> {
        self.pinned_reference
    }

    pub fn window(&self, now: OffsetDateTime) -> CollectionWindow {
        CollectionWindow {
            reference_time: self.pinned_reference.unwrap_or(now),
            ..self.template
        }
    }

    pub fn policy(&self, now: OffsetDateTime) -> UrgencyPolicy {
        UrgencyPolicy {
            window: self.window(now),
            buffer_hours: self.buffer_hours,
        }
    }
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            template: CollectionWindow {
                period: Duration::hours(24),
                start_time: datetime!(2024-01-01 08:00 UTC),
                reference_time: datetime!(2024-01-01 08:00 UTC),
            },
            pinned_reference: None,
            buffer_hours: DEFAULT_BUFFER_HOURS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UrgencyPolicy {
    pub window: CollectionWindow,
    pub buffer_hours: f64,
}

impl UrgencyPolicy {
    pub fn is_urgent(&self, forecast: &Forecast) -> bool {
        self.window
            .is_urgent(forecast.hours_until_full, self.buffer_hours)
    }
}

/// Forecast every region sensor concurrently and keep those that need a
/// visit before the next pickup, in region order.
///
/// Sensors without a forecast are logged and left out.
pub async fn select_urgent_stops(
    sensors: &[RegionSensor],
    store: &dyn ReadingStore,
    registry: &ModelRegistry,
    forecast: &ForecastSettings,
    policy: &UrgencyPolicy,
) -> Vec<Stop> {
    let forecasts = join_all(
        sensors
            .iter()
            .map(|sensor| forecast_sensor(sensor.sensor_id, store, registry, forecast)),
    )
    .await;

    let next_collection = policy.window.next_collection_time();
    let mut urgent = Vec::new();
    for (sensor, result) in sensors.iter().zip(forecasts) {
        match result {
            Ok(forecast) => {
                let is_urgent = policy.is_urgent(&forecast);
                debug!(
                    sensor_id = sensor.sensor_id,
                    hours_until_full = forecast.hours_until_full,
                    next_collection = %next_collection,
                    is_urgent,
                    "Urgency evaluated"
                );
                if is_urgent {
                    urgent.push(Stop::from(sensor));
                }
            }
            Err(err) if err.is_missing_forecast() => {
                warn!(sensor_id = sensor.sensor_id, error = %err, "No forecast, skipping sensor");
            }
            Err(err) => {
                warn!(sensor_id = sensor.sensor_id, error = %err, "Forecast failed, skipping sensor");
            }
        }
    }
    urgent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RegressionModel;
    use crate::series::Reading;
    use crate::series::features::Predictors;
    use crate::store::InMemoryReadingStore;
    use std::sync::Arc;

    fn daily_window() -> Option<CollectionWindow> {
        CollectionWindow::new(
            24.0,
            datetime!(2024-01-01 08:00 UTC),
            datetime!(2025-04-26 22:00 UTC),
        )
    }

    #[test]
    fn next_collection_advances_in_whole_periods() -> Result<(), Box<dyn std::error::Error>> {
        let window = daily_window().ok_or("invalid window")?;

        assert_eq!(window.next_collection_time(), datetime!(2025-04-27 08:00 UTC));
        Ok(())
    }

    #[test]
    fn reference_on_a_pickup_is_that_pickup() -> Result<(), Box<dyn std::error::Error>> {
        let window = CollectionWindow::new(
            24.0,
            datetime!(2024-01-01 08:00 UTC),
            datetime!(2024-01-03 08:00 UTC),
        )
        .ok_or("invalid window")?;

        assert_eq!(window.next_collection_time(), datetime!(2024-01-03 08:00 UTC));
        Ok(())
    }

    #[test]
    fn start_in_the_future_is_the_next_pickup() -> Result<(), Box<dyn std::error::Error>> {
        let window = CollectionWindow::new(
            6.0,
            datetime!(2025-05-01 06:00 UTC),
            datetime!(2025-04-26 22:00 UTC),
        )
        .ok_or("invalid window")?;

        assert_eq!(window.next_collection_time(), datetime!(2025-05-01 06:00 UTC));
        Ok(())
    }

    #[test]
    fn non_positive_frequency_is_rejected() {
        let start = datetime!(2024-01-01 08:00 UTC);

        assert!(CollectionWindow::new(0.0, start, start).is_none());
        assert!(CollectionWindow::new(-4.0, start, start).is_none());
        assert!(CollectionWindow::new(f64::NAN, start, start).is_none());
    }

    #[test]
    fn buffered_overflow_before_pickup_is_urgent() -> Result<(), Box<dyn std::error::Error>> {
        let window = daily_window().ok_or("invalid window")?;

        assert!(window.is_urgent(3.0, DEFAULT_BUFFER_HOURS));
        // 22:00 + 10.2h - 0.2h lands exactly on the 08:00 pickup.
        assert!(window.is_urgent(10.2, DEFAULT_BUFFER_HOURS));
        assert!(!window.is_urgent(10.5, DEFAULT_BUFFER_HOURS));
        Ok(())
    }

    #[test]
    fn pinned_reference_overrides_clock() -> Result<(), Box<dyn std::error::Error>> {
        let settings = ScheduleSettings::new(
            24.0,
            datetime!(2024-01-01 08:00 UTC),
            Some(datetime!(2025-04-26 22:00 UTC)),
            DEFAULT_BUFFER_HOURS,
        )
        .ok_or("invalid schedule")?;

        let window = settings.window(datetime!(2030-01-01 00:00 UTC));

        assert_eq!(window.reference_time(), datetime!(2025-04-26 22:00 UTC));
        assert_eq!(window.next_collection_time(), datetime!(2025-04-27 08:00 UTC));
        Ok(())
    }

    #[test]
    fn unpinned_reference_uses_clock() {
        let window = ScheduleSettings::default().window(datetime!(2025-04-27 09:30 UTC));

        assert_eq!(window.next_collection_time(), datetime!(2025-04-28 08:00 UTC));
    }

    #[derive(Debug)]
    struct Constant(f64);

    impl RegressionModel for Constant {
        fn predict(&self, _predictors: &Predictors) -> f64 {
            self.0
        }

        fn kind(&self) -> &'static str {
            "constant"
        }
    }

    fn sensor(sensor_id: u32) -> RegionSensor {
        RegionSensor {
            sensor_id,
            region_id: 1,
            latitude: Some(4.36 + f64::from(sensor_id) / 1000.0),
            longitude: Some(100.97),
            name: format!("bin-{sensor_id}"),
        }
    }

    fn readings(sensor_id: u32, levels: [f64; 4]) -> Vec<Reading> {
        let start = datetime!(2025-04-26 21:00 UTC);
        levels
            .iter()
            .enumerate()
            .map(|(i, level)| Reading::new(sensor_id, start + Duration::minutes(15 * i as i64), *level))
            .collect()
    }

    #[tokio::test]
    async fn only_sensors_filling_before_pickup_are_selected() -> Result<(), Box<dyn std::error::Error>> {
        let mut all = readings(1, [40.0, 50.0, 60.0, 70.0]);
        all.extend(readings(2, [10.0, 10.0, 10.0, 10.0]));
        all.extend(readings(3, [91.0, 92.0, 93.0, 95.0]));
        let store = InMemoryReadingStore::new(all, Vec::new());

        let mut registry = ModelRegistry::new();
        registry.insert(1, Arc::new(Constant(95.0)));
        registry.insert(2, Arc::new(Constant(12.0)));
        registry.insert(3, Arc::new(Constant(12.0)));
        // Sensor 4 has no model and no readings.
        let sensors = vec![sensor(1), sensor(2), sensor(3), sensor(4)];
        let policy = UrgencyPolicy {
            window: daily_window().ok_or("invalid window")?,
            buffer_hours: DEFAULT_BUFFER_HOURS,
        };

        let urgent = select_urgent_stops(
            &sensors,
            &store,
            &registry,
            &ForecastSettings::default(),
            &policy,
        )
        .await;

        let ids: Vec<u32> = urgent.iter().map(|stop| stop.sensor_id).collect();
        assert_eq!(ids, vec![1, 3]);
        Ok(())
    }
}
