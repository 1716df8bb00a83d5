//! Per-sensor regression models.
//!
//! A model is addressed by sensor identifier, persisted as a JSON
//! [`ModelArtifact`], and used at inference time only through the
//! [`RegressionModel`] trait. The artifact's `model` field selects the
//! implementation, in the same way new model kinds are added: implement the
//! trait and register the name in [`create_model`].

use crate::series::SensorId;
use crate::series::features::Predictors;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};

pub mod forest;
pub mod store;

use forest::RandomForest;
use store::ModelStore;

pub const RANDOM_FOREST_MODEL: &str = "random_forest";

/// A trained fill-level regressor.
pub trait RegressionModel: Send + Sync + std::fmt::Debug {
    /// Predict the fill level for one feature row.
    fn predict(&self, predictors: &Predictors) -> f64;

    /// Name stored in the artifact's `model` field.
    fn kind(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub mae: f64,
    pub rmse: f64,
    pub r2: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub sensor_id: SensorId,
    pub model: String,
    #[serde(with = "time::serde::rfc3339")]
    pub trained_at: OffsetDateTime,
    #[serde(default)]
    pub metrics: Option<EvaluationMetrics>,
    pub params: serde_json::Value,
}

impl ModelArtifact {
    pub fn from_forest(
        sensor_id: SensorId,
        forest: &RandomForest,
        metrics: Option<EvaluationMetrics>,
        trained_at: OffsetDateTime,
    ) -> Result<Self, ModelStoreError> {
        Ok(Self {
            sensor_id,
            model: RANDOM_FOREST_MODEL.to_string(),
            trained_at,
            metrics,
            params: serde_json::to_value(forest)?,
        })
    }
}

#[derive(Debug, Error)]
pub enum ModelStoreError {
    #[error("failed to access model artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse model artifact: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid model artifact: {0}")]
    Invalid(String),
}

// Model Factory
pub fn create_model(artifact: &ModelArtifact) -> Result<Arc<dyn RegressionModel>, ModelStoreError> {
    match artifact.model.as_str() {
        RANDOM_FOREST_MODEL => {
            let forest: RandomForest = serde_json::from_value(artifact.params.clone())?;
            forest.validate().map_err(|reason| {
                ModelStoreError::Invalid(format!("sensor {}: {reason}", artifact.sensor_id))
            })?;
            Ok(Arc::new(forest))
        }
        other => Err(ModelStoreError::Invalid(format!("unknown model: {other}"))),
    }
}

/// Loaded models keyed by sensor, built once and shared read-only.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<SensorId, Arc<dyn RegressionModel>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every artifact the store lists. Unreadable artifacts are skipped.
    pub fn load_all(store: &dyn ModelStore) -> Result<Self, ModelStoreError> {
        let mut registry = Self::new();
        for sensor_id in store.list()? {
            match store.load(sensor_id) {
                Ok(Some(model)) => registry.insert(sensor_id, model),
                Ok(None) => {}
                Err(err) => {
                    warn!(sensor_id, error = %err, "Skipping unreadable model artifact");
                }
            }
        }
        info!(count = registry.len(), "Model registry loaded");
        Ok(registry)
    }

    pub fn insert(&mut self, sensor_id: SensorId, model: Arc<dyn RegressionModel>) {
        self.models.insert(sensor_id, model);
    }

    pub fn get(&self, sensor_id: SensorId) -> Option<Arc<dyn RegressionModel>> {
        self.models.get(&sensor_id).cloned()
    }

    pub fn contains(&self, sensor_id: SensorId) -> bool {
        self.models.contains_key(&sensor_id)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
