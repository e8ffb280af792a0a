// Weather Harvest v0.1
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::Instrument;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod db;
mod errors;
mod helpers;
mod services;

use config::AppConfig;
use db::models::Namespace;
use db::store::{MemoryRecordStore, PgRecordStore, RecordStore};
use errors::AppError;
use services::ingest::{IngestSettings, Ingestor};
use services::owm::OwmClient;
use services::tiles::{BrowserViewer, LogViewer, PollPolicy, TileViewer};

/// Maximum number of connections in the database pool.
const DB_POOL_MAX_CONNECTIONS: u32 = 5;
/// Minimum number of connections kept alive in the database pool.
const DB_POOL_MIN_CONNECTIONS: u32 = 1;

#[tokio::main]
async fn main() -> ExitCode {
    let config = AppConfig::from_env();
    init_tracing(config.as_ref().is_ok_and(|c| c.log_json));

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let pool = match &config.database_url {
        Some(url) => match connect(url).await {
            Ok(pool) => Some(pool),
            Err(e) => {
                tracing::error!("Failed to prepare database: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };

    let result = run(&config, pool.clone()).await;

    if let Some(pool) = pool {
        pool.close().await;
    }

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("Run aborted: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "weather_harvest=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn connect(url: &str) -> Result<PgPool, AppError> {
    let pool = PgPoolOptions::new()
        .max_connections(DB_POOL_MAX_CONNECTIONS)
        .min_connections(DB_POOL_MIN_CONNECTIONS)
        .connect(url)
        .await?;

    sqlx::migrate!().run(&pool).await?;
    tracing::info!("Database migrations completed");
    Ok(pool)
}

/// Ingest every location, then build the trend report.
/// Returns `Ok(false)` when any location failed but the report was still produced.
async fn run(config: &AppConfig, pool: Option<PgPool>) -> Result<bool, AppError> {
    let store: Arc<dyn RecordStore> = match pool {
        Some(pool) => Arc::new(PgRecordStore::new(pool)),
        None => {
            tracing::warn!("DATABASE_URL not set; forecasts are kept in memory for this run");
            Arc::new(MemoryRecordStore::new())
        }
    };

    if config.reset_store {
        for namespace in Namespace::ALL {
            let removed = store.clear_all(namespace).await?;
            tracing::info!("Cleared {} documents from {}", removed, namespace);
        }
    }

    let client = Arc::new(OwmClient::new(
        &config.api_key,
        &config.owm_api_url,
        &config.owm_tile_url,
    )?);
    let viewer: Arc<dyn TileViewer> = if config.open_tiles {
        Arc::new(BrowserViewer)
    } else {
        Arc::new(LogViewer)
    };

    let removed = services::tiles::reset_tile_directory(&config.tile_dir).await?;
    tracing::info!(
        "Tile directory {} ready ({} stale files removed)",
        config.tile_dir.display(),
        removed
    );

    let ingestor = Ingestor::new(
        store.clone(),
        client.clone(),
        client.clone(),
        client,
        viewer,
        IngestSettings {
            zoom: config.zoom_level,
            layers: config.map_layers.clone(),
            tile_dir: config.tile_dir.clone(),
            long_range_days: config.long_range_days,
            poll: PollPolicy {
                interval: config.tile_poll_interval,
                max_attempts: config.tile_poll_max_attempts,
            },
            location_pause: config.location_pause,
        },
    );

    let run_id = uuid::Uuid::new_v4();
    let span = tracing::info_span!("ingest", %run_id);
    let summary = async {
        tracing::info!(
            "Ingesting {} locations ({} map layers at zoom {})",
            config.locations.len(),
            config.map_layers.len(),
            config.zoom_level
        );
        ingestor.run(&config.locations).await
    }
    .instrument(span)
    .await;

    for (location, error) in &summary.failed {
        tracing::error!("{}: not ingested: {}", location, error);
    }
    tracing::info!(
        "Ingestion finished: {} locations ok, {} failed",
        summary.completed.len(),
        summary.failed.len()
    );

    let report = services::trend::build_trend_report(
        store.as_ref(),
        &config.locations,
        config.trend_points,
        Utc::now(),
    )
    .await?;
    services::trend::log_report(&report);
    services::trend::write_report(&report, &config.trend_output).await?;

    Ok(summary.is_clean())
}
