use collection_planner::model::ModelRegistry;
use collection_planner::model::store::FileModelStore;
use collection_planner::routing::DistanceMatrixOracle;
use collection_planner::store::InMemoryReadingStore;
use collection_planner::{api, config, state};
use std::sync::Arc;
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
    let level = config.logging.level.parse::<Level>().ok();
    init_tracing(level.unwrap_or(Level::INFO));
    if level.is_none() {
        tracing::warn!(level = %config.logging.level, "Unknown log level, using info");
    }
    tracing::info!(
        config_path = config::DEFAULT_CONFIG_PATH,
        app = %config.app.name,
        "collection planner starting"
    );

    let readings_path = config.readings_path();
    let store = match InMemoryReadingStore::load_from_path(readings_path) {
        Ok(store) => {
            tracing::info!(
                path = %readings_path.display(),
                sensors = store.sensor_count(),
                readings = store.reading_count(),
                "Reading dataset loaded"
            );
            store
        }
        Err(err) => {
            tracing::warn!(path = %readings_path.display(), error = %err, "Failed to load readings, starting empty");
            InMemoryReadingStore::default()
        }
    };

    let model_store = FileModelStore::new(config.model_dir());
    let registry = match ModelRegistry::load_all(&model_store) {
        Ok(registry) => registry,
        Err(err) => {
            tracing::warn!(dir = %model_store.dir().display(), error = %err, "Failed to load models");
            ModelRegistry::new()
        }
    };
    if registry.is_empty() {
        tracing::warn!("No trained models loaded, forecasts will be unavailable");
    }

    let api_key = config.oracle_api_key().unwrap_or_default();
    if api_key.is_empty() {
        tracing::warn!("No [routing].api_key configured, route requests will fail");
    }
    let oracle = DistanceMatrixOracle::new(
        config.oracle_endpoint(),
        api_key,
        config.cost_metric(),
        config.oracle_timeout(),
    )?;

    let state = Arc::new(state::AppState::new(
        Arc::new(store),
        registry,
        Arc::new(oracle),
        config.planner_settings()?,
    ));
    let app = api::router(state);
    let addr = format!("{}:{}", config.server_host(), config.server_port());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "API server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
