//! Offline per-sensor training: split, fit, evaluate, cross-validate, persist.

use crate::error::SchedulerError;
use crate::forecast::{ForecastSettings, LagState, RolloutOutcome, run_rollout};
use crate::model::forest::{ForestParams, RandomForest, Sample};
use crate::model::store::ModelStore;
use crate::model::{EvaluationMetrics, ModelArtifact, ModelStoreError};
use crate::series::features::{FeatureRow, extract_features};
use crate::series::preprocess::clean_series;
use crate::series::SensorId;
use crate::store::ReadingStore;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSettings {
    pub test_fraction: f64,
    pub seed: u64,
    pub forest: ForestParams,
    pub cv_folds: usize,
    pub cv_estimators: usize,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            test_fraction: 0.2,
            seed: 42,
            forest: ForestParams::default(),
            cv_folds: 5,
            cv_estimators: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CrossValidation {
    pub folds: usize,
    pub mean_mae: f64,
    pub std_mae: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingReport {
    pub sensor_id: SensorId,
    pub train_rows: usize,
    pub test_rows: usize,
    pub evaluation: EvaluationMetrics,
    pub cross_validation: CrossValidation,
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error(transparent)]
    Pipeline(#[from] SchedulerError),
    #[error(transparent)]
    Artifact(#[from] ModelStoreError),
}

struct Partition {
    train: Vec<usize>,
    test: Vec<usize>,
}

/// Training state for one sensor's feature rows.
#[derive(Debug)]
pub struct TrainingSession {
    sensor_id: SensorId,
    samples: Vec<Sample>,
    targets: Vec<f64>,
    settings: TrainingSettings,
    train: Vec<usize>,
    test: Vec<usize>,
    model: Option<RandomForest>,
}

impl TrainingSession {
    /// Partitions the rows into training and held-out sets with the configured seed.
    pub fn new(
        sensor_id: SensorId,
        rows: &[FeatureRow],
        settings: TrainingSettings,
    ) -> Result<Self, SchedulerError> {
        let samples: Vec<Sample> = rows.iter().map(|row| row.predictors.to_array()).collect();
        let targets: Vec<f64> = rows.iter().map(|row| row.fill_level).collect();
        let Partition { train, test } =
            split_indices(samples.len(), settings.test_fraction, settings.seed);
        if train.is_empty() || test.is_empty() {
            return Err(SchedulerError::InsufficientHistory {
                sensor_id,
                available: samples.len(),
                required: 2,
            });
        }
        Ok(Self {
            sensor_id,
            samples,
            targets,
            settings,
            train,
            test,
            model: None,
        })
    }

    pub fn train_rows(&self) -> usize {
        self.train.len()
    }

    pub fn test_rows(&self) -> usize {
        self.test.len()
    }

    pub fn fit(&mut self) -> &RandomForest {
        let samples: Vec<Sample> = self.train.iter().map(|i| self.samples[*i]).collect();
        let targets: Vec<f64> = self.train.iter().map(|i| self.targets[*i]).collect();
        self.model
            .insert(RandomForest::fit(&samples, &targets, &self.settings.forest))
    }

    pub fn model(&self) -> Result<&RandomForest, SchedulerError> {
        self.model.as_ref().ok_or(SchedulerError::UntrainedModel {
            sensor_id: self.sensor_id,
        })
    }

    pub fn into_model(self) -> Result<RandomForest, SchedulerError> {
        let sensor_id = self.sensor_id;
        self.model
            .ok_or(SchedulerError::UntrainedModel { sensor_id })
    }

    /// Error metrics of the fitted model on the held-out rows.
    pub fn evaluate(&self) -> Result<EvaluationMetrics, SchedulerError> {
        let model = self.model()?;
        let actual: Vec<f64> = self.test.iter().map(|i| self.targets[*i]).collect();
        let predicted: Vec<f64> = self
            .test
            .iter()
            .map(|i| model.predict_sample(&self.samples[*i]))
            .collect();
        Ok(regression_metrics(&actual, &predicted))
    }

    /// Shuffled k-fold cross-validation over every row, reporting MAE spread.
    ///
    /// Fold models are fully grown (no depth limit, one-row leaves) with
    /// `cv_estimators` trees, independent of the constrained production forest.
    pub fn cross_validate(&self) -> Result<CrossValidation, SchedulerError> {
        let n = self.samples.len();
        let folds = self.settings.cv_folds;
        if folds < 2 || n < folds {
            return Err(SchedulerError::InsufficientHistory {
                sensor_id: self.sensor_id,
                available: n,
                required: folds.max(2),
            });
        }

        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(&mut StdRng::seed_from_u64(self.settings.seed));
        let params = cross_validation_params(&self.settings);

        let mut scores = Vec::with_capacity(folds);
        let mut start = 0;
        for fold in 0..folds {
            let size = n / folds + usize::from(fold < n % folds);
            let held_out = &order[start..start + size];
            let (samples, targets): (Vec<Sample>, Vec<f64>) = order[..start]
                .iter()
                .chain(&order[start + size..])
                .map(|i| (self.samples[*i], self.targets[*i]))
                .unzip();
            let model = RandomForest::fit(&samples, &targets, &params);
            let actual: Vec<f64> = held_out.iter().map(|i| self.targets[*i]).collect();
            let predicted: Vec<f64> = held_out
                .iter()
                .map(|i| model.predict_sample(&self.samples[*i]))
                .collect();
            scores.push(mean_absolute_error(&actual, &predicted));
            start += size;
        }

        let mean_mae = scores.iter().sum::<f64>() / folds as f64;
        let variance = scores.iter().map(|s| (s - mean_mae).powi(2)).sum::<f64>() / folds as f64;
        Ok(CrossValidation {
            folds,
            mean_mae,
            std_mae: variance.sqrt(),
        })
    }
}

fn cross_validation_params(settings: &TrainingSettings) -> ForestParams {
    ForestParams {
        n_estimators: settings.cv_estimators,
        max_depth: None,
        min_samples_split: 2,
        min_samples_leaf: 1,
        seed: settings.forest.seed,
    }
}

fn split_indices(n: usize, test_fraction: f64, seed: u64) -> Partition {
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    let test_size = ((n as f64) * test_fraction.clamp(0.0, 1.0)).ceil() as usize;
    let test = order.split_off(n - test_size.min(n));
    Partition { train: order, test }
}

pub fn mean_absolute_error(actual: &[f64], predicted: &[f64]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).abs())
        .sum::<f64>()
        / actual.len() as f64
}

pub fn regression_metrics(actual: &[f64], predicted: &[f64]) -> EvaluationMetrics {
    let n = actual.len().max(1) as f64;
    let squared_error: f64 = actual.iter().zip(predicted).map(|(a, p)| (a - p).powi(2)).sum();
    let mean_actual = actual.iter().sum::<f64>() / n;
    let total_variance: f64 = actual.iter().map(|a| (a - mean_actual).powi(2)).sum();
    let r2 = if total_variance == 0.0 {
        if squared_error == 0.0 { 1.0 } else { 0.0 }
    } else {
        1.0 - squared_error / total_variance
    };
    EvaluationMetrics {
        mae: mean_absolute_error(actual, predicted),
        rmse: (squared_error / n).sqrt(),
        r2,
    }
}

/// Full pipeline for one sensor: history → features → model artifact.
pub async fn train_sensor(
    sensor_id: SensorId,
    readings: &dyn ReadingStore,
    models: &dyn ModelStore,
    settings: &TrainingSettings,
    forecast: &ForecastSettings,
) -> Result<TrainingReport, TrainingError> {
    let history = readings.get_history(sensor_id).await?;
    let series = clean_series(sensor_id, &history, forecast.step)?;
    let rows = extract_features(&series)?;

    let mut session = TrainingSession::new(sensor_id, &rows, settings.clone())?;
    session.fit();
    let evaluation = session.evaluate()?;
    info!(
        sensor_id,
        mae = evaluation.mae,
        rmse = evaluation.rmse,
        r2 = evaluation.r2,
        "Held-out evaluation"
    );
    let cross_validation = session.cross_validate()?;
    info!(
        sensor_id,
        folds = cross_validation.folds,
        mean_mae = cross_validation.mean_mae,
        std_mae = cross_validation.std_mae,
        "Cross-validation"
    );

    let report = TrainingReport {
        sensor_id,
        train_rows: session.train_rows(),
        test_rows: session.test_rows(),
        evaluation,
        cross_validation,
    };
    let model = session.into_model()?;
    log_sanity_forecast(sensor_id, &model, &rows, forecast);

    let artifact = ModelArtifact::from_forest(
        sensor_id,
        &model,
        Some(evaluation),
        OffsetDateTime::now_utc(),
    )?;
    models.save(&artifact)?;
    info!(sensor_id, "Model saved");
    Ok(report)
}

fn log_sanity_forecast(
    sensor_id: SensorId,
    model: &RandomForest,
    rows: &[FeatureRow],
    settings: &ForecastSettings,
) {
    let Some(last) = rows.last() else {
        return;
    };
    let state = LagState {
        current: last.fill_level,
        lag_1: last.predictors.lag_1,
        lag_2: last.predictors.lag_2,
        lag_3: last.predictors.lag_3,
    };
    match run_rollout(model, state, last.timestamp, settings) {
        RolloutOutcome::Found(crossing) => info!(
            sensor_id,
            predicted_timestamp = %crossing.predicted_timestamp,
            hours_until_full = crossing.hours_until_full,
            predicted_level = crossing.predicted_level,
            "Training-data forecast"
        ),
        RolloutOutcome::Exhausted { steps, .. } => {
            warn!(sensor_id, steps, "No full-level crossing within horizon")
        }
    }
}

/// Train sensors one after another; a failing sensor is logged and skipped.
pub async fn train_all(
    sensor_ids: &[SensorId],
    readings: &dyn ReadingStore,
    models: &dyn ModelStore,
    settings: &TrainingSettings,
    forecast: &ForecastSettings,
) -> Vec<TrainingReport> {
    let mut reports = Vec::with_capacity(sensor_ids.len());
    for &sensor_id in sensor_ids {
        info!(sensor_id, "Training sensor");
        match train_sensor(sensor_id, readings, models, settings, forecast).await {
            Ok(report) => reports.push(report),
            Err(err) => warn!(sensor_id, error = %err, "Skipping sensor"),
        }
    }
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::Reading;
    use crate::series::features::{CalendarFeatures, Predictors};
    use time::Duration;
    use time::macros::datetime;

    fn sawtooth_rows(count: usize) -> Vec<FeatureRow> {
        let start = datetime!(2024-02-14 07:00 UTC);
        let level = |i: usize| ((i % 20) * 5) as f64;
        (3..count + 3)
            .map(|i| {
                let timestamp = start + Duration::minutes(15 * i as i64);
                FeatureRow {
                    timestamp,
                    fill_level: level(i),
                    predictors: Predictors::new(
                        CalendarFeatures::at(timestamp),
                        [level(i - 1), level(i - 2), level(i - 3)],
                    ),
                }
            })
            .collect()
    }

    fn quick_settings() -> TrainingSettings {
        TrainingSettings {
            forest: ForestParams {
                n_estimators: 10,
                min_samples_split: 4,
                min_samples_leaf: 2,
                ..ForestParams::default()
            },
            cv_estimators: 5,
            ..TrainingSettings::default()
        }
    }

    #[test]
    fn split_holds_out_ceiling_of_fraction() {
        let partition = split_indices(11, 0.2, 42);

        assert_eq!(partition.test.len(), 3);
        assert_eq!(partition.train.len(), 8);
        let mut all: Vec<usize> = partition.train.iter().chain(&partition.test).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..11).collect::<Vec<_>>());
    }

    #[test]
    fn evaluation_before_fit_is_untrained() -> Result<(), SchedulerError> {
        let session = TrainingSession::new(2, &sawtooth_rows(40), quick_settings())?;

        assert!(matches!(
            session.evaluate(),
            Err(SchedulerError::UntrainedModel { sensor_id: 2 })
        ));
        assert!(matches!(
            session.into_model(),
            Err(SchedulerError::UntrainedModel { sensor_id: 2 })
        ));
        Ok(())
    }

    #[test]
    fn fitted_model_tracks_the_series() -> Result<(), SchedulerError> {
        let mut session = TrainingSession::new(2, &sawtooth_rows(200), quick_settings())?;

        session.fit();
        let metrics = session.evaluate()?;

        assert_eq!(session.test_rows(), 40);
        assert!(metrics.mae < 15.0, "mae {}", metrics.mae);
        assert!(metrics.r2 > 0.5, "r2 {}", metrics.r2);
        Ok(())
    }

    #[test]
    fn training_is_reproducible() -> Result<(), SchedulerError> {
        let rows = sawtooth_rows(120);
        let mut first = TrainingSession::new(2, &rows, quick_settings())?;
        let mut second = TrainingSession::new(2, &rows, quick_settings())?;

        first.fit();
        second.fit();

        assert_eq!(first.evaluate()?, second.evaluate()?);
        assert_eq!(first.cross_validate()?, second.cross_validate()?);
        Ok(())
    }

    #[test]
    fn cross_validation_grows_full_trees() {
        let params = cross_validation_params(&quick_settings());

        assert_eq!(params.n_estimators, 5);
        assert_eq!(params.max_depth, None);
        assert_eq!(params.min_samples_split, 2);
        assert_eq!(params.min_samples_leaf, 1);
        assert_eq!(params.seed, 42);
    }

    #[test]
    fn cross_validation_needs_a_row_per_fold() -> Result<(), SchedulerError> {
        let session = TrainingSession::new(2, &sawtooth_rows(4), quick_settings())?;

        assert!(matches!(
            session.cross_validate(),
            Err(SchedulerError::InsufficientHistory { required: 5, .. })
        ));
        Ok(())
    }

    #[test]
    fn single_row_cannot_be_split() {
        let result = TrainingSession::new(2, &sawtooth_rows(1), quick_settings());

        assert!(matches!(result, Err(SchedulerError::InsufficientHistory { .. })));
    }

    #[test]
    fn metrics_match_hand_computed_values() {
        let metrics = regression_metrics(&[1.0, 2.0, 3.0], &[1.0, 2.0, 5.0]);

        assert!((metrics.mae - 2.0 / 3.0).abs() < 1e-12);
        assert!((metrics.rmse - (4.0f64 / 3.0).sqrt()).abs() < 1e-12);
        assert!((metrics.r2 - (1.0 - 4.0 / 2.0)).abs() < 1e-12);
    }

    #[test]
    fn r2_of_constant_target() {
        assert_eq!(regression_metrics(&[4.0, 4.0], &[4.0, 4.0]).r2, 1.0);
        assert_eq!(regression_metrics(&[4.0, 4.0], &[3.0, 4.0]).r2, 0.0);
    }

    #[tokio::test]
    async fn batch_training_skips_sensors_without_data() -> Result<(), Box<dyn std::error::Error>> {
        use crate::model::store::FileModelStore;
        use crate::store::InMemoryReadingStore;
        use std::time::{SystemTime, UNIX_EPOCH};

        let start = datetime!(2024-02-14 07:00 UTC);
        let readings: Vec<Reading> = (0..160)
            .map(|i| Reading::new(1, start + Duration::minutes(15 * i), ((i % 20) * 5) as f64))
            .collect();
        let reading_store = InMemoryReadingStore::new(readings, Vec::new());
        let unique = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
        let model_store =
            FileModelStore::new(std::env::temp_dir().join(format!("planner-train-{unique}")));

        let reports = train_all(
            &[1, 2],
            &reading_store,
            &model_store,
            &quick_settings(),
            &ForecastSettings::default(),
        )
        .await;
        let listed = model_store.list()?;
        let _ = std::fs::remove_dir_all(model_store.dir());

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].sensor_id, 1);
        assert_eq!(reports[0].train_rows + reports[0].test_rows, 157);
        assert_eq!(listed, vec![1]);
        Ok(())
    }

    #[tokio::test]
    async fn training_grid_follows_forecast_step() -> Result<(), Box<dyn std::error::Error>> {
        use crate::model::store::FileModelStore;
        use crate::store::InMemoryReadingStore;
        use std::time::{SystemTime, UNIX_EPOCH};

        let start = datetime!(2024-02-14 07:00 UTC);
        let readings: Vec<Reading> = (0..160)
            .map(|i| Reading::new(1, start + Duration::minutes(15 * i), ((i % 20) * 5) as f64))
            .collect();
        let reading_store = InMemoryReadingStore::new(readings, Vec::new());
        let unique = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
        let model_store =
            FileModelStore::new(std::env::temp_dir().join(format!("planner-train-step-{unique}")));
        let forecast = ForecastSettings {
            step: Duration::minutes(30),
            ..ForecastSettings::default()
        };

        let result = train_sensor(1, &reading_store, &model_store, &quick_settings(), &forecast).await;
        let _ = std::fs::remove_dir_all(model_store.dir());
        let report = result?;

        // 80 half-hour slots over the 39h45m span, less three lag rows.
        assert_eq!(report.train_rows + report.test_rows, 77);
        Ok(())
    }
}
