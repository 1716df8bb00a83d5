use crate::forecast::{DEFAULT_STEP_CAP, DEFAULT_THRESHOLD, ForecastSettings, MAX_STEP_CAP};
use crate::model::forest::ForestParams;
use crate::planner::PlannerSettings;
use crate::routing::oracle::{DEFAULT_MATRIX_ENDPOINT, DEFAULT_ORACLE_TIMEOUT};
use crate::routing::{CostMetric, DEFAULT_LINK_BASE};
use crate::schedule::{DEFAULT_BUFFER_HOURS, ScheduleSettings};
use crate::series::SensorId;
use crate::training::TrainingSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";
pub const DEFAULT_SERVER_HOST: &str = "0.0.0.0";
pub const DEFAULT_SERVER_PORT: u16 = 8080;
pub const DEFAULT_READINGS_PATH: &str = "data/readings.json";
pub const DEFAULT_MODEL_DIR: &str = "models";
pub const DEFAULT_STEP_MINUTES: i64 = 15;
/// One day.
pub const MAX_STEP_MINUTES: i64 = 24 * 60;
pub const DEFAULT_FREQUENCY_HOURS: f64 = 24.0;
pub const DEFAULT_START_TIME: &str = "2024-01-01 08:00:00";

const SCHEDULE_TIME_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub app: AppSection,
    pub logging: LoggingSection,
    #[serde(default)]
    pub server: Option<ServerSection>,
    #[serde(default)]
    pub storage: Option<StorageSection>,
    #[serde(default)]
    pub forecast: Option<ForecastSection>,
    #[serde(default)]
    pub schedule: Option<ScheduleSection>,
    #[serde(default)]
    pub training: Option<TrainingSection>,
    #[serde(default)]
    pub routing: Option<RoutingSection>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppSection {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSection {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSection {
    /// Address to bind (default: 0.0.0.0)
    pub host: Option<String>,
    /// Port to listen on (default: 8080)
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSection {
    /// JSON dataset with region sensors and readings
    pub readings_path: Option<PathBuf>,
    /// Directory holding one model artifact per sensor
    pub model_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ForecastSection {
    pub threshold: Option<f64>,
    pub step_cap: Option<u32>,
    pub step_minutes: Option<i64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleSection {
    pub frequency_hours: Option<f64>,
    /// `YYYY-MM-DD HH:MM:SS`, UTC
    pub start_time: Option<String>,
    /// Pins "now" for urgency checks; the clock is used when unset
    pub reference_time: Option<String>,
    pub buffer_hours: Option<f64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrainingSection {
    pub sensor_ids: Option<Vec<SensorId>>,
    pub test_fraction: Option<f64>,
    pub seed: Option<u64>,
    pub n_estimators: Option<usize>,
    /// 0 lets trees grow until the sample limits stop them
    pub max_depth: Option<usize>,
    pub min_samples_split: Option<usize>,
    pub min_samples_leaf: Option<usize>,
    pub cv_folds: Option<usize>,
    pub cv_estimators: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoutingSection {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: Option<u64>,
    pub metric: Option<CostMetric>,
    pub link_base: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

pub fn load_default() -> Result<Config, ConfigError> {
    load_from_path(DEFAULT_CONFIG_PATH)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

fn parse_schedule_time(field: &str, value: &str) -> Result<OffsetDateTime, ConfigError> {
    PrimitiveDateTime::parse(value, SCHEDULE_TIME_FORMAT)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|err| {
            ConfigError::Invalid(format!(
                "schedule.{field} `{value}` is not YYYY-MM-DD HH:MM:SS: {err}"
            ))
        })
}

impl Config {
    /// Checks every derived settings value once, so later accessors only
    /// fail on programming errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.forecast_settings()?;
        self.schedule_settings()?;
        self.training_settings()?;
        Ok(())
    }

    /// Returns the bind host (default: 0.0.0.0)
    pub fn server_host(&self) -> &str {
        self.server
            .as_ref()
            .and_then(|s| s.host.as_deref())
            .unwrap_or(DEFAULT_SERVER_HOST)
    }

    /// Returns the server port (default: 8080)
    pub fn server_port(&self) -> u16 {
        self.server
            .as_ref()
            .and_then(|s| s.port)
            .unwrap_or(DEFAULT_SERVER_PORT)
    }

    pub fn readings_path(&self) -> &Path {
        self.storage
            .as_ref()
            .and_then(|s| s.readings_path.as_deref())
            .filter(|path| !path.as_os_str().is_empty())
            .unwrap_or(Path::new(DEFAULT_READINGS_PATH))
    }

    pub fn model_dir(&self) -> &Path {
        self.storage
            .as_ref()
            .and_then(|s| s.model_dir.as_deref())
            .filter(|path| !path.as_os_str().is_empty())
            .unwrap_or(Path::new(DEFAULT_MODEL_DIR))
    }

    pub fn forecast_settings(&self) -> Result<ForecastSettings, ConfigError> {
        let section = self.forecast.as_ref();
        let threshold = section
            .and_then(|s| s.threshold)
            .unwrap_or(DEFAULT_THRESHOLD);
        if !threshold.is_finite() {
            return Err(ConfigError::Invalid(
                "forecast.threshold must be finite".to_string(),
            ));
        }
        let step_minutes = section
            .and_then(|s| s.step_minutes)
            .unwrap_or(DEFAULT_STEP_MINUTES);
        if !(1..=MAX_STEP_MINUTES).contains(&step_minutes) {
            return Err(ConfigError::Invalid(format!(
                "forecast.step_minutes must be within 1..={MAX_STEP_MINUTES}, got {step_minutes}"
            )));
        }
        let step_cap = section
            .and_then(|s| s.step_cap)
            .unwrap_or(DEFAULT_STEP_CAP);
        if step_cap > MAX_STEP_CAP {
            return Err(ConfigError::Invalid(format!(
                "forecast.step_cap must be at most {MAX_STEP_CAP}, got {step_cap}"
            )));
        }
        Ok(ForecastSettings {
            threshold,
            step_cap,
            step: time::Duration::minutes(step_minutes),
        })
    }

    pub fn schedule_settings(&self) -> Result<ScheduleSettings, ConfigError> {
        let section = self.schedule.as_ref();
        let frequency_hours = section
            .and_then(|s| s.frequency_hours)
            .unwrap_or(DEFAULT_FREQUENCY_HOURS);
        let start_time = parse_schedule_time(
            "start_time",
            section
                .and_then(|s| s.start_time.as_deref())
                .unwrap_or(DEFAULT_START_TIME),
        )?;
        let reference_time = section
            .and_then(|s| s.reference_time.as_deref())
            .filter(|value| !value.is_empty())
            .map(|value| parse_schedule_time("reference_time", value))
            .transpose()?;
        let buffer_hours = section
            .and_then(|s| s.buffer_hours)
            .unwrap_or(DEFAULT_BUFFER_HOURS);
        ScheduleSettings::new(frequency_hours, start_time, reference_time, buffer_hours).ok_or_else(
            || {
                ConfigError::Invalid(format!(
                    "schedule.frequency_hours must be positive (got {frequency_hours}) \
                     and schedule.buffer_hours finite (got {buffer_hours})"
                ))
            },
        )
    }

    pub fn training_settings(&self) -> Result<TrainingSettings, ConfigError> {
        let defaults = TrainingSettings::default();
        let Some(section) = self.training.as_ref() else {
            return Ok(defaults);
        };
        let forest_defaults = ForestParams::default();
        let seed = section.seed.unwrap_or(defaults.seed);
        let settings = TrainingSettings {
            test_fraction: section.test_fraction.unwrap_or(defaults.test_fraction),
            seed,
            forest: ForestParams {
                n_estimators: section.n_estimators.unwrap_or(forest_defaults.n_estimators),
                max_depth: match section.max_depth {
                    Some(0) => None,
                    Some(depth) => Some(depth),
                    None => forest_defaults.max_depth,
                },
                min_samples_split: section
                    .min_samples_split
                    .unwrap_or(forest_defaults.min_samples_split),
                min_samples_leaf: section
                    .min_samples_leaf
                    .unwrap_or(forest_defaults.min_samples_leaf),
                seed,
            },
            cv_folds: section.cv_folds.unwrap_or(defaults.cv_folds),
            cv_estimators: section.cv_estimators.unwrap_or(defaults.cv_estimators),
        };
        if !(settings.test_fraction > 0.0 && settings.test_fraction < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "training.test_fraction must be in (0, 1), got {}",
                settings.test_fraction
            )));
        }
        if settings.cv_folds < 2 {
            return Err(ConfigError::Invalid(format!(
                "training.cv_folds must be at least 2, got {}",
                settings.cv_folds
            )));
        }
        if settings.forest.n_estimators == 0 || settings.cv_estimators == 0 {
            return Err(ConfigError::Invalid(
                "training estimator counts must be positive".to_string(),
            ));
        }
        Ok(settings)
    }

    /// Sensors the training job covers; empty means every sensor in the dataset.
    pub fn training_sensor_ids(&self) -> &[SensorId] {
        self.training
            .as_ref()
            .and_then(|s| s.sensor_ids.as_deref())
            .unwrap_or(&[])
    }

    pub fn oracle_endpoint(&self) -> &str {
        self.routing
            .as_ref()
            .and_then(|s| s.endpoint.as_deref())
            .unwrap_or(DEFAULT_MATRIX_ENDPOINT)
    }

    /// Returns the oracle API key, or `None` if unset or empty.
    pub fn oracle_api_key(&self) -> Option<&str> {
        self.routing
            .as_ref()
            .and_then(|s| s.api_key.as_deref())
            .filter(|key| !key.is_empty())
    }

    pub fn oracle_timeout(&self) -> Duration {
        self.routing
            .as_ref()
            .and_then(|s| s.timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_ORACLE_TIMEOUT)
    }

    pub fn cost_metric(&self) -> CostMetric {
        self.routing
            .as_ref()
            .and_then(|s| s.metric)
            .unwrap_or_default()
    }

    pub fn link_base(&self) -> &str {
        self.routing
            .as_ref()
            .and_then(|s| s.link_base.as_deref())
            .unwrap_or(DEFAULT_LINK_BASE)
    }

    pub fn planner_settings(&self) -> Result<PlannerSettings, ConfigError> {
        Ok(PlannerSettings {
            forecast: self.forecast_settings()?,
            schedule: self.schedule_settings()?,
            link_base: self.link_base().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};
    use time::macros::datetime;

    fn write_temp(label: &str, contents: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let unique = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
        let path = std::env::temp_dir().join(format!("planner-config-{label}-{unique}.toml"));
        fs::write(&path, contents)?;
        Ok(path)
    }

    const MINIMAL: &str = r#"
[app]
name = "collection-planner"

[logging]
level = "info"
"#;

    #[test]
    fn default_config_pins_reference_time() -> Result<(), Box<dyn std::error::Error>> {
        let config = load_default()?;
        let schedule = config.schedule_settings()?;

        assert_eq!(schedule.pinned_reference(), Some(datetime!(2025-04-26 22:00 UTC)));
        assert_eq!(config.cost_metric(), CostMetric::Distance);
        Ok(())
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let path = write_temp("minimal", MINIMAL)?;

        let result = load_from_path(&path);
        let _ = fs::remove_file(&path);
        let config = result?;

        assert_eq!(config.server_port(), DEFAULT_SERVER_PORT);
        assert_eq!(config.model_dir(), Path::new(DEFAULT_MODEL_DIR));
        assert_eq!(config.forecast_settings()?, ForecastSettings::default());
        assert_eq!(config.training_settings()?, TrainingSettings::default());
        assert_eq!(config.schedule_settings()?, ScheduleSettings::default());
        assert_eq!(config.link_base(), DEFAULT_LINK_BASE);
        assert!(config.oracle_api_key().is_none());
        assert!(config.training_sensor_ids().is_empty());
        Ok(())
    }

    #[test]
    fn sections_override_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let contents = format!(
            r#"{MINIMAL}
[forecast]
threshold = 80.0
step_minutes = 30

[training]
sensor_ids = [1, 2]
seed = 7
max_depth = 0

[routing]
api_key = ""
metric = "duration"
timeout_secs = 3
"#
        );
        let path = write_temp("override", &contents)?;

        let result = load_from_path(&path);
        let _ = fs::remove_file(&path);
        let config = result?;

        let forecast = config.forecast_settings()?;
        assert_eq!(forecast.threshold, 80.0);
        assert_eq!(forecast.step, time::Duration::minutes(30));
        let training = config.training_settings()?;
        assert_eq!(training.forest.seed, 7);
        assert_eq!(training.forest.max_depth, None);
        assert_eq!(config.training_sensor_ids(), &[1, 2]);
        assert_eq!(config.cost_metric(), CostMetric::Duration);
        assert_eq!(config.oracle_timeout(), Duration::from_secs(3));
        assert!(config.oracle_api_key().is_none());
        Ok(())
    }

    #[test]
    fn unbounded_forecast_horizon_is_invalid() -> Result<(), Box<dyn std::error::Error>> {
        for (name, forecast) in [
            ("huge-step", "step_minutes = 9223372036854775807"),
            ("zero-step", "step_minutes = 0"),
            ("huge-cap", "step_cap = 3000000"),
        ] {
            let contents = format!("{MINIMAL}\n[forecast]\n{forecast}\n");
            let path = write_temp(name, &contents)?;

            let result = load_from_path(&path);
            let _ = fs::remove_file(&path);

            assert!(
                matches!(result, Err(ConfigError::Invalid(ref message)) if message.contains("forecast.step")),
                "{forecast} was accepted"
            );
        }
        Ok(())
    }

    #[test]
    fn malformed_start_time_is_invalid() -> Result<(), Box<dyn std::error::Error>> {
        let contents = format!("{MINIMAL}\n[schedule]\nstart_time = \"2024-01-01T08:00:00Z\"\n");
        let path = write_temp("bad-start", &contents)?;

        let result = load_from_path(&path);
        let _ = fs::remove_file(&path);

        assert!(matches!(result, Err(ConfigError::Invalid(message)) if message.contains("start_time")));
        Ok(())
    }

    #[test]
    fn zero_frequency_is_invalid() -> Result<(), Box<dyn std::error::Error>> {
        let contents = format!("{MINIMAL}\n[schedule]\nfrequency_hours = 0.0\n");
        let path = write_temp("zero-frequency", &contents)?;

        let result = load_from_path(&path);
        let _ = fs::remove_file(&path);

        assert!(matches!(result, Err(ConfigError::Invalid(_))));
        Ok(())
    }

    #[test]
    fn test_fraction_outside_unit_interval_is_invalid() -> Result<(), Box<dyn std::error::Error>> {
        let contents = format!("{MINIMAL}\n[training]\ntest_fraction = 1.0\n");
        let path = write_temp("fraction", &contents)?;

        let result = load_from_path(&path);
        let _ = fs::remove_file(&path);

        assert!(matches!(result, Err(ConfigError::Invalid(_))));
        Ok(())
    }

    #[test]
    fn missing_config_file_returns_read_error() -> Result<(), Box<dyn std::error::Error>> {
        let unique = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
        let path = std::env::temp_dir().join(format!("planner-config-missing-{unique}.toml"));

        let result = load_from_path(&path);

        assert!(matches!(result, Err(ConfigError::Read(_))));
        Ok(())
    }

    #[test]
    fn invalid_toml_returns_parse_error() -> Result<(), Box<dyn std::error::Error>> {
        let path = write_temp("invalid", "not = [valid")?;

        let result = load_from_path(&path);
        let _ = fs::remove_file(&path);

        assert!(matches!(result, Err(ConfigError::Parse(_))));
        Ok(())
    }
}
