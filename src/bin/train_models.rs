use collection_planner::config;
use collection_planner::model::store::FileModelStore;
use collection_planner::store::InMemoryReadingStore;
use collection_planner::training::train_all;
use tracing::Level;

fn init_tracing(level: Level) {
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(level)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = config::load_default()?;
    init_tracing(config.logging.level.parse::<Level>().unwrap_or(Level::INFO));

    let readings_path = config.readings_path();
    let readings = InMemoryReadingStore::load_from_path(readings_path)?;
    let models = FileModelStore::new(config.model_dir());
    let settings = config.training_settings()?;
    let forecast = config.forecast_settings()?;

    let sensor_ids = match config.training_sensor_ids() {
        [] => readings.sensor_ids(),
        ids => ids.to_vec(),
    };
    tracing::info!(
        path = %readings_path.display(),
        sensors = sensor_ids.len(),
        model_dir = %models.dir().display(),
        "Training started"
    );

    let reports = train_all(&sensor_ids, &readings, &models, &settings, &forecast).await;
    for report in &reports {
        tracing::info!(
            sensor_id = report.sensor_id,
            train_rows = report.train_rows,
            test_rows = report.test_rows,
            mae = report.evaluation.mae,
            rmse = report.evaluation.rmse,
            r2 = report.evaluation.r2,
            cv_mean_mae = report.cross_validation.mean_mae,
            cv_std_mae = report.cross_validation.std_mae,
            "Sensor trained"
        );
    }
    tracing::info!(
        trained = reports.len(),
        skipped = sensor_ids.len() - reports.len(),
        "Training finished"
    );
    Ok(())
}
