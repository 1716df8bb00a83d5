use crate::model::{ModelArtifact, ModelStoreError, RegressionModel, create_model};
use crate::series::SensorId;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const ARTIFACT_PREFIX: &str = "sensor_";
const ARTIFACT_SUFFIX: &str = "_model.json";

/// Durable storage for trained models, keyed by sensor.
pub trait ModelStore: Send + Sync {
    fn save(&self, artifact: &ModelArtifact) -> Result<(), ModelStoreError>;

    /// Returns `Ok(None)` when no artifact exists for the sensor.
    fn load(&self, sensor_id: SensorId) -> Result<Option<Arc<dyn RegressionModel>>, ModelStoreError>;

    fn list(&self) -> Result<Vec<SensorId>, ModelStoreError>;
}

/// One JSON file per sensor in a directory.
///
/// Saves write a sibling temporary file and rename it into place, so a
/// concurrent reader sees either the old artifact or the new one.
#[derive(Debug, Clone)]
pub struct FileModelStore {
    dir: PathBuf,
}

impl FileModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, sensor_id: SensorId) -> PathBuf {
        self.dir
            .join(format!("{ARTIFACT_PREFIX}{sensor_id}{ARTIFACT_SUFFIX}"))
    }

    pub fn read_artifact(&self, sensor_id: SensorId) -> Result<Option<ModelArtifact>, ModelStoreError> {
        let contents = match fs::read_to_string(self.artifact_path(sensor_id)) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let artifact: ModelArtifact = serde_json::from_str(&contents)?;
        if artifact.sensor_id != sensor_id {
            return Err(ModelStoreError::Invalid(format!(
                "artifact for sensor {sensor_id} is labelled sensor {}",
                artifact.sensor_id
            )));
        }
        Ok(Some(artifact))
    }
}

impl ModelStore for FileModelStore {
    fn save(&self, artifact: &ModelArtifact) -> Result<(), ModelStoreError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.artifact_path(artifact.sensor_id);
        let staging = path.with_extension("json.tmp");
        let payload = serde_json::to_vec(artifact)?;
        fs::write(&staging, payload)?;
        if let Err(err) = fs::rename(&staging, &path) {
            let _ = fs::remove_file(&staging);
            return Err(err.into());
        }
        debug!(sensor_id = artifact.sensor_id, path = %path.display(), "Model artifact written");
        Ok(())
    }

    fn load(&self, sensor_id: SensorId) -> Result<Option<Arc<dyn RegressionModel>>, ModelStoreError> {
        match self.read_artifact(sensor_id)? {
            Some(artifact) => create_model(&artifact).map(Some),
            None => Ok(None),
        }
    }

    fn list(&self) -> Result<Vec<SensorId>, ModelStoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let id = name
                .strip_prefix(ARTIFACT_PREFIX)
                .and_then(|rest| rest.strip_suffix(ARTIFACT_SUFFIX))
                .and_then(|id| id.parse::<SensorId>().ok());
            if let Some(id) = id {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::forest::{ForestParams, RandomForest};
    use crate::model::{EvaluationMetrics, ModelRegistry};
    use crate::series::features::{CalendarFeatures, Predictors};
    use std::time::{SystemTime, UNIX_EPOCH};
    use time::macros::datetime;

    fn temp_store(label: &str) -> Result<FileModelStore, Box<dyn std::error::Error>> {
        let unique = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
        Ok(FileModelStore::new(
            std::env::temp_dir().join(format!("planner-models-{label}-{unique}")),
        ))
    }

    fn tiny_forest() -> RandomForest {
        let samples: Vec<_> = (0..30)
            .map(|i| [12.0, 2.0, 4.0, 0.0, i as f64, i as f64, i as f64])
            .collect();
        let targets: Vec<f64> = (0..30).map(|i| i as f64 + 1.0).collect();
        let params = ForestParams {
            n_estimators: 5,
            min_samples_split: 2,
            min_samples_leaf: 1,
            ..ForestParams::default()
        };
        RandomForest::fit(&samples, &targets, &params)
    }

    #[test]
    fn saved_artifact_loads_as_model() -> Result<(), Box<dyn std::error::Error>> {
        let store = temp_store("roundtrip")?;
        let forest = tiny_forest();
        let metrics = EvaluationMetrics {
            mae: 1.0,
            rmse: 1.5,
            r2: 0.9,
        };
        let artifact =
            ModelArtifact::from_forest(3, &forest, Some(metrics), datetime!(2025-04-26 22:00 UTC))?;

        store.save(&artifact)?;
        let model = store.load(3)?.ok_or("model missing after save")?;
        let stored = store.read_artifact(3)?.ok_or("artifact missing after save")?;
        let _ = fs::remove_dir_all(store.dir());

        let predictors = Predictors::new(
            CalendarFeatures::at(datetime!(2025-04-26 12:00 UTC)),
            [10.0, 10.0, 10.0],
        );
        assert_eq!(model.predict(&predictors), forest.predict_sample(&predictors.to_array()));
        assert_eq!(model.kind(), "random_forest");
        assert_eq!(stored.metrics, Some(metrics));
        Ok(())
    }

    #[test]
    fn missing_artifact_is_not_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let store = temp_store("missing")?;

        assert!(store.load(8)?.is_none());
        assert!(store.list()?.is_empty());
        Ok(())
    }

    #[test]
    fn retraining_replaces_artifact_without_leftovers() -> Result<(), Box<dyn std::error::Error>> {
        let store = temp_store("replace")?;
        let forest = tiny_forest();
        let first = ModelArtifact::from_forest(5, &forest, None, datetime!(2025-01-01 00:00 UTC))?;
        let second = ModelArtifact::from_forest(5, &forest, None, datetime!(2025-02-01 00:00 UTC))?;

        store.save(&first)?;
        store.save(&second)?;
        let stored = store.read_artifact(5)?.ok_or("artifact missing")?;
        let file_count = fs::read_dir(store.dir())?.count();
        let _ = fs::remove_dir_all(store.dir());

        assert_eq!(stored.trained_at, datetime!(2025-02-01 00:00 UTC));
        assert_eq!(file_count, 1);
        Ok(())
    }

    #[test]
    fn registry_loads_listed_artifacts_and_skips_corrupt_ones() -> Result<(), Box<dyn std::error::Error>> {
        let store = temp_store("registry")?;
        let forest = tiny_forest();
        store.save(&ModelArtifact::from_forest(1, &forest, None, datetime!(2025-01-01 00:00 UTC))?)?;
        store.save(&ModelArtifact::from_forest(2, &forest, None, datetime!(2025-01-01 00:00 UTC))?)?;
        fs::write(store.artifact_path(9), "{ not json")?;

        let listed = store.list()?;
        let registry = ModelRegistry::load_all(&store)?;
        let _ = fs::remove_dir_all(store.dir());

        assert_eq!(listed, vec![1, 2, 9]);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(1));
        assert!(!registry.contains(9));
        Ok(())
    }
}
