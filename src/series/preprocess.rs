use crate::error::SchedulerError;
use crate::series::{CleanedSeries, GridPoint, Reading, SensorId};
use time::{Duration, OffsetDateTime, UtcOffset};
use tracing::debug;

const IQR_FENCE: f64 = 1.5;

/// Resample raw readings onto a uniform grid and repair outliers.
///
/// Readings with a missing or out-of-range level are ignored. Each grid slot
/// carries the latest reading at or before it; slots before the first
/// reading take the first reading's level. Values outside the Tukey fences
/// are replaced by linear interpolation between valid neighbours until none
/// remain, so cleaning an already cleaned series returns it unchanged.
pub fn clean_series(
    sensor_id: SensorId,
    readings: &[Reading],
    step: Duration,
) -> Result<CleanedSeries, SchedulerError> {
    let mut valid: Vec<&Reading> = readings.iter().filter(|r| r.has_valid_level()).collect();
    if valid.is_empty() {
        return Err(SchedulerError::EmptyDataset { sensor_id });
    }
    if valid.len() < readings.len() {
        debug!(
            sensor_id,
            dropped = readings.len() - valid.len(),
            "Ignoring readings without a usable fill level"
        );
    }

    // Stable: among equal timestamps the later input reading wins below.
    valid.sort_by_key(|reading| reading.timestamp);

    let step_secs = step.whole_seconds().max(1);
    let step = Duration::seconds(step_secs);
    let first = &valid[0];
    let last = &valid[valid.len() - 1];
    // Grid slots are UTC whatever offset the readings carry.
    let start = floor_to_step(first.timestamp.to_offset(UtcOffset::UTC), step_secs);
    let end = floor_to_step(last.timestamp, step_secs);
    let slot_count = ((end - start).whole_seconds() / step_secs) as usize + 1;

    let mut points = Vec::with_capacity(slot_count);
    let mut cursor = 0;
    let mut carried: Option<f64> = None;
    for slot in 0..slot_count {
        let timestamp = start + step * slot as i32;
        while cursor < valid.len() && valid[cursor].timestamp <= timestamp {
            carried = Some(valid[cursor].fill_level);
            cursor += 1;
        }
        points.push(GridPoint {
            timestamp,
            fill_level: carried.unwrap_or(first.fill_level),
        });
    }

    let mut levels: Vec<f64> = points.iter().map(|p| p.fill_level).collect();
    let replaced = repair_outliers(&mut levels);
    if replaced > 0 {
        debug!(sensor_id, replaced, "Replaced outlier fill levels");
    }
    for (point, level) in points.iter_mut().zip(levels) {
        point.fill_level = level;
    }

    Ok(CleanedSeries {
        sensor_id,
        step,
        points,
    })
}

fn floor_to_step(timestamp: OffsetDateTime, step_secs: i64) -> OffsetDateTime {
    let rem = timestamp.unix_timestamp().rem_euclid(step_secs);
    timestamp - Duration::seconds(rem) - Duration::nanoseconds(i64::from(timestamp.nanosecond()))
}

/// Returns the number of replacements made across all passes.
fn repair_outliers(levels: &mut [f64]) -> usize {
    let mut replaced = 0;
    for _ in 0..levels.len() {
        let Some((lower, upper)) = iqr_bounds(levels) else {
            break;
        };
        let outliers: Vec<bool> = levels.iter().map(|v| *v < lower || *v > upper).collect();
        let count = outliers.iter().filter(|o| **o).count();
        if count == 0 || count == levels.len() {
            break;
        }
        interpolate_masked(levels, &outliers);
        replaced += count;
    }
    replaced
}

pub(crate) fn iqr_bounds(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let q1 = quantile(&sorted, 0.25);
    let q3 = quantile(&sorted, 0.75);
    let iqr = q3 - q1;
    Some((q1 - IQR_FENCE * iqr, q3 + IQR_FENCE * iqr))
}

/// Linear interpolation between order statistics of an ascending slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lo = position.floor() as usize;
    let hi = position.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (position - lo as f64)
}

fn interpolate_masked(levels: &mut [f64], masked: &[bool]) {
    let anchors: Vec<usize> = (0..levels.len()).filter(|i| !masked[*i]).collect();
    if anchors.is_empty() {
        return;
    }
    let original = levels.to_vec();
    for index in (0..levels.len()).filter(|i| masked[*i]) {
        let after = anchors.partition_point(|a| *a < index);
        let previous = after.checked_sub(1).map(|k| anchors[k]);
        let next = anchors.get(after).copied();
        levels[index] = match (previous, next) {
            (Some(p), Some(n)) => {
                let fraction = (index - p) as f64 / (n - p) as f64;
                original[p] + (original[n] - original[p]) * fraction
            }
            (Some(p), None) => original[p],
            (None, Some(n)) => original[n],
            (None, None) => original[index],
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::DEFAULT_GRID_STEP;
    use time::macros::datetime;

    fn reading(minutes: i64, level: f64) -> Reading {
        Reading::new(7, datetime!(2024-02-14 07:00 UTC) + Duration::minutes(minutes), level)
    }

    #[test]
    fn empty_input_is_rejected() {
        let result = clean_series(7, &[], DEFAULT_GRID_STEP);

        assert!(matches!(result, Err(SchedulerError::EmptyDataset { sensor_id: 7 })));
    }

    #[test]
    fn readings_without_usable_level_count_as_empty() {
        let readings = vec![reading(0, f64::NAN), reading(15, 140.0)];

        let result = clean_series(7, &readings, DEFAULT_GRID_STEP);

        assert!(matches!(result, Err(SchedulerError::EmptyDataset { .. })));
    }

    #[test]
    fn gaps_are_forward_filled_on_a_uniform_grid() -> Result<(), SchedulerError> {
        let readings = vec![
            reading(0, 10.0),
            reading(15, 20.0),
            reading(45, 30.0),
            reading(60, 40.0),
        ];

        let series = clean_series(7, &readings, DEFAULT_GRID_STEP)?;

        let levels: Vec<f64> = series.levels().collect();
        assert_eq!(levels, vec![10.0, 20.0, 20.0, 30.0, 40.0]);
        for pair in series.points.windows(2) {
            assert_eq!(pair[1].timestamp - pair[0].timestamp, Duration::minutes(15));
        }
        Ok(())
    }

    #[test]
    fn unsorted_input_and_duplicates_are_normalised() -> Result<(), SchedulerError> {
        let readings = vec![
            reading(30, 40.0),
            reading(0, 10.0),
            reading(15, 20.0),
            reading(15, 25.0),
        ];

        let series = clean_series(7, &readings, DEFAULT_GRID_STEP)?;

        let levels: Vec<f64> = series.levels().collect();
        assert_eq!(levels, vec![10.0, 25.0, 40.0]);
        Ok(())
    }

    #[test]
    fn leading_gap_takes_first_known_level() -> Result<(), SchedulerError> {
        let readings = vec![reading(7, 12.0), reading(20, 14.0)];

        let series = clean_series(7, &readings, DEFAULT_GRID_STEP)?;

        assert_eq!(series.points[0].timestamp, datetime!(2024-02-14 07:00 UTC));
        assert_eq!(series.points[0].fill_level, 12.0);
        assert_eq!(series.points[1].fill_level, 12.0);
        Ok(())
    }

    #[test]
    fn grid_is_laid_out_in_utc() -> Result<(), SchedulerError> {
        let readings = vec![
            Reading::new(7, datetime!(2024-02-17 06:00 +08:00), 10.0),
            Reading::new(7, datetime!(2024-02-17 06:15 +08:00), 20.0),
        ];

        let series = clean_series(7, &readings, DEFAULT_GRID_STEP)?;

        assert_eq!(series.points.len(), 2);
        for point in &series.points {
            assert_eq!(point.timestamp.offset(), UtcOffset::UTC);
        }
        assert_eq!(series.points[0].timestamp, datetime!(2024-02-16 22:00 UTC));
        assert_eq!(series.points[0].timestamp.hour(), 22);
        Ok(())
    }

    #[test]
    fn outliers_are_interpolated_between_neighbours() -> Result<(), SchedulerError> {
        let levels = [10.0, 12.0, 14.0, 16.0, 95.0, 20.0, 22.0, 24.0, 26.0];
        let readings: Vec<Reading> = levels
            .iter()
            .enumerate()
            .map(|(i, level)| reading(i as i64 * 15, *level))
            .collect();

        let series = clean_series(7, &readings, DEFAULT_GRID_STEP)?;

        assert_eq!(series.points[4].fill_level, 18.0);
        Ok(())
    }

    #[test]
    fn edge_outlier_takes_nearest_valid_level() {
        let mut levels = vec![90.0, 10.0, 11.0, 12.0, 11.0, 10.0, 12.0, 11.0];

        let replaced = repair_outliers(&mut levels);

        assert!(replaced >= 1);
        assert_eq!(levels[0], 10.0);
    }

    #[test]
    fn cleaning_is_idempotent() -> Result<(), SchedulerError> {
        let raw = [5.0, 9.0, 99.0, 14.0, 18.0, 0.0, 23.0, 30.0, 35.0, 41.0, 47.0, 2.0];
        let readings: Vec<Reading> = raw
            .iter()
            .enumerate()
            .map(|(i, level)| reading(i as i64 * 17, *level))
            .collect();

        let once = clean_series(7, &readings, DEFAULT_GRID_STEP)?;
        let twice = clean_series(7, &once.to_readings(), DEFAULT_GRID_STEP)?;

        assert_eq!(once, twice);
        Ok(())
    }

    #[test]
    fn quantile_interpolates_between_order_statistics() {
        let sorted = [1.0, 2.0, 3.0, 4.0];

        assert_eq!(quantile(&sorted, 0.25), 1.75);
        assert_eq!(quantile(&sorted, 0.75), 3.25);
    }
}
