//! Per-location ingestion orchestrator.
//!
//! Architecture:
//! - Locations are processed one at a time, with a fixed pause after each
//! - Each location forks four jobs onto a `JoinSet` and joins all of them
//!   before moving on: short-range forecast, long-range forecast, tile fetch,
//!   latest-tile display
//! - `JobPolicy::Required` failures cancel the location's remaining jobs and
//!   fail the location; `JobPolicy::Optional` failures are logged and recorded
//! - Jobs that write tiles are never aborted, only drained, so no file write
//!   outlives `run_location`
//! - A failed location never stops the run; it is reported in `RunSummary`
//! - Job panics are caught per job and treated like that job's error

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{AbortHandle, JoinSet};
use tracing::Instrument;

use crate::db::models::{ForecastBundle, Location, Namespace, StorageKey};
use crate::db::store::RecordStore;
use crate::errors::AppError;
use crate::services::owm::{ForecastSource, Geocoder, TileSource};
use crate::services::tiles::{
    await_latest_tile, save_tile, tile_file_name, PollPolicy, TileCoords, TileViewer,
};

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Whether a job's failure fails the whole location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPolicy {
    Required,
    Optional,
}

/// The four jobs run for every location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    ShortRange,
    LongRange,
    TileFetch,
    TileDisplay,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::ShortRange,
        JobKind::LongRange,
        JobKind::TileFetch,
        JobKind::TileDisplay,
    ];

    /// Short-range data is the primary path; everything else is best effort.
    pub fn policy(&self) -> JobPolicy {
        match self {
            JobKind::ShortRange => JobPolicy::Required,
            JobKind::LongRange | JobKind::TileFetch | JobKind::TileDisplay => JobPolicy::Optional,
        }
    }

    /// Whether the job may be aborted mid-flight. Tile fetches hand their
    /// saves to blocking threads, which an abort cannot stop, so they are
    /// always drained instead.
    pub fn is_abortable(&self) -> bool {
        !matches!(self, JobKind::TileFetch)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ShortRange => "short-range forecast",
            JobKind::LongRange => "long-range forecast",
            JobKind::TileFetch => "tile fetch",
            JobKind::TileDisplay => "tile display",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum JobOutcome {
    Stored(usize),
    Tiles(TileFetchReport),
    Displayed(PathBuf),
}

/// Result of fetching every configured layer for one location.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TileFetchReport {
    pub saved: Vec<PathBuf>,
    /// Layers whose fetch or save failed.
    pub failed: Vec<String>,
}

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

/// What happened for one location whose required jobs succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationSummary {
    pub location: Location,
    pub short_range_stored: usize,
    /// `None` when the long-range job failed.
    pub long_range_stored: Option<usize>,
    pub tiles: Option<TileFetchReport>,
    pub displayed: Option<PathBuf>,
    pub optional_failures: Vec<(JobKind, String)>,
}

impl LocationSummary {
    fn new(location: Location) -> Self {
        Self {
            location,
            short_range_stored: 0,
            long_range_stored: None,
            tiles: None,
            displayed: None,
            optional_failures: Vec::new(),
        }
    }

    fn record(&mut self, kind: JobKind, outcome: JobOutcome) {
        match (kind, outcome) {
            (JobKind::ShortRange, JobOutcome::Stored(n)) => self.short_range_stored = n,
            (JobKind::LongRange, JobOutcome::Stored(n)) => self.long_range_stored = Some(n),
            (_, JobOutcome::Tiles(report)) => self.tiles = Some(report),
            (_, JobOutcome::Displayed(path)) => self.displayed = Some(path),
            (kind, JobOutcome::Stored(_)) => {
                tracing::debug!("Ignoring stored count from {} job", kind);
            }
        }
    }
}

/// Outcome of a full run over all configured locations.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub completed: Vec<LocationSummary>,
    pub failed: Vec<(Location, String)>,
}

impl RunSummary {
    /// True when every location's required jobs succeeded.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Knobs for the ingestion jobs.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub zoom: u8,
    pub layers: Vec<String>,
    pub tile_dir: PathBuf,
    pub long_range_days: u8,
    pub poll: PollPolicy,
    /// Pause after each location, throttling outbound requests.
    pub location_pause: Duration,
}

/// Runs the four jobs for each location against shared collaborators.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn RecordStore>,
    forecasts: Arc<dyn ForecastSource>,
    geocoder: Arc<dyn Geocoder>,
    tiles: Arc<dyn TileSource>,
    viewer: Arc<dyn TileViewer>,
    settings: Arc<IngestSettings>,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        forecasts: Arc<dyn ForecastSource>,
        geocoder: Arc<dyn Geocoder>,
        tiles: Arc<dyn TileSource>,
        viewer: Arc<dyn TileViewer>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            store,
            forecasts,
            geocoder,
            tiles,
            viewer,
            settings: Arc::new(settings),
        }
    }

    /// Ingest every location in order. Failures are isolated per location.
    pub async fn run(&self, locations: &[Location]) -> RunSummary {
        let mut summary = RunSummary::default();

        for location in locations {
            let started = Instant::now();
            let span = tracing::info_span!("location", location = %location);
            match self.run_location(location).instrument(span).await {
                Ok(result) => {
                    tracing::info!(
                        "{}: ingestion complete in {}ms ({} short-range records, {} tiles)",
                        location,
                        started.elapsed().as_millis(),
                        result.short_range_stored,
                        result.tiles.as_ref().map_or(0, |t| t.saved.len()),
                    );
                    summary.completed.push(result);
                }
                Err(e) => {
                    tracing::error!("{}: ingestion failed: {}", location, e);
                    summary.failed.push((location.clone(), e.to_string()));
                }
            }

            tokio::time::sleep(self.settings.location_pause).await;
        }

        summary
    }

    /// Fork the four jobs for `location` and wait for all of them.
    ///
    /// Every job has reached a terminal state when this returns, including
    /// on a required failure: abortable jobs are cancelled, the rest are
    /// drained.
    pub async fn run_location(&self, location: &Location) -> Result<LocationSummary, AppError> {
        let mut set = JoinSet::new();
        let mut handles: Vec<(JobKind, AbortHandle)> = Vec::with_capacity(JobKind::ALL.len());
        for kind in JobKind::ALL {
            let job = self.job(kind, location.clone());
            let handle = set.spawn(async move {
                let result = AssertUnwindSafe(job).catch_unwind().await.unwrap_or_else(|_| {
                    Err(AppError::InternalError(format!("{} job panicked", kind)))
                });
                (kind, result)
            });
            handles.push((kind, handle));
        }

        let mut summary = LocationSummary::new(location.clone());
        let mut required_failure: Option<AppError> = None;

        while let Some(joined) = set.join_next().await {
            let (kind, result) = match joined {
                Ok(pair) => pair,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    tracing::error!("{}: job task failed: {}", location, e);
                    abort_abortable(&handles);
                    required_failure.get_or_insert(e.into());
                    continue;
                }
            };

            match (result, kind.policy()) {
                (Ok(outcome), _) => summary.record(kind, outcome),
                (Err(e), JobPolicy::Optional) => {
                    if e.is_unauthorized() {
                        tracing::warn!(
                            "{}: {} job rejected by the provider; the API key may lack access to this endpoint",
                            location,
                            kind
                        );
                    }
                    tracing::warn!("{}: {} job failed: {}", location, kind, e);
                    summary.optional_failures.push((kind, e.to_string()));
                }
                (Err(e), JobPolicy::Required) => {
                    tracing::error!(
                        "{}: required {} job failed, cancelling remaining jobs: {}",
                        location,
                        kind,
                        e
                    );
                    abort_abortable(&handles);
                    required_failure.get_or_insert(e);
                }
            }
        }

        match required_failure {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn job(&self, kind: JobKind, location: Location) -> BoxFuture<'static, Result<JobOutcome, AppError>> {
        let this = self.clone();
        match kind {
            JobKind::ShortRange => async move {
                this.ingest_forecast(&location, Namespace::ShortRange)
                    .await
                    .map(JobOutcome::Stored)
            }
            .boxed(),
            JobKind::LongRange => async move {
                this.ingest_forecast(&location, Namespace::LongRange)
                    .await
                    .map(JobOutcome::Stored)
            }
            .boxed(),
            JobKind::TileFetch => async move {
                this.fetch_tiles(&location).await.map(JobOutcome::Tiles)
            }
            .boxed(),
            JobKind::TileDisplay => async move {
                this.display_latest_tile().await.map(JobOutcome::Displayed)
            }
            .boxed(),
        }
    }

    /// Fetch one forecast horizon, announce precipitation, store every record.
    async fn ingest_forecast(
        &self,
        location: &Location,
        namespace: Namespace,
    ) -> Result<usize, AppError> {
        let bundle = match namespace {
            Namespace::ShortRange => self.forecasts.fetch_short_range(location).await?,
            Namespace::LongRange => {
                self.forecasts
                    .fetch_long_range(location, self.settings.long_range_days)
                    .await?
            }
        };

        for alert in precipitation_alerts(&bundle) {
            tracing::info!("{}", alert);
        }
        store_bundle(self.store.as_ref(), &bundle).await
    }

    /// Geocode, then fetch and save every layer concurrently.
    async fn fetch_tiles(&self, location: &Location) -> Result<TileFetchReport, AppError> {
        let point = self.geocoder.geopoint_for(location).await?;
        let coords = TileCoords::for_point(point, self.settings.zoom);
        tracing::debug!(
            "{}: lat {:.4} lon {:.4} → tile {}/{}/{}",
            location,
            point.lat,
            point.lon,
            self.settings.zoom,
            coords.x,
            coords.y
        );

        let fetches = self.settings.layers.iter().map(|layer| async move {
            let result = self.fetch_layer(location, layer, coords).await;
            (layer, result)
        });

        let mut report = TileFetchReport::default();
        for (layer, result) in join_all(fetches).await {
            match result {
                Ok(path) => report.saved.push(path),
                Err(e) => {
                    tracing::warn!("{}: failed to fetch {} tile: {}", location, layer, e);
                    report.failed.push(layer.clone());
                }
            }
        }
        Ok(report)
    }

    async fn fetch_layer(
        &self,
        location: &Location,
        layer: &str,
        coords: TileCoords,
    ) -> Result<PathBuf, AppError> {
        let zoom = self.settings.zoom;
        let bytes = self.tiles.fetch_tile(layer, zoom, coords).await?;
        save_tile(
            &self.settings.tile_dir,
            &tile_file_name(location, zoom, layer),
            bytes,
        )
        .await
    }

    async fn display_latest_tile(&self) -> Result<PathBuf, AppError> {
        let path = await_latest_tile(&self.settings.tile_dir, &self.settings.poll).await?;
        self.viewer.show(&path)?;
        Ok(path)
    }
}

fn abort_abortable(handles: &[(JobKind, AbortHandle)]) {
    for (kind, handle) in handles {
        if kind.is_abortable() {
            handle.abort();
        }
    }
}

/// Upsert every record of `bundle` under its storage key. Stops at the first write error.
pub async fn store_bundle(store: &dyn RecordStore, bundle: &ForecastBundle) -> Result<usize, AppError> {
    for record in &bundle.records {
        let key = StorageKey::new(record.reference_time, &bundle.location);
        let data = serde_json::to_value(record)?;
        store.upsert(bundle.namespace, key.as_str(), &data).await?;
    }

    tracing::debug!(
        "{}: stored {} records in {}",
        bundle.location,
        bundle.records.len(),
        bundle.namespace
    );
    Ok(bundle.records.len())
}

/// At most one rain and one snow alert per bundle, however many records match.
fn precipitation_alerts(bundle: &ForecastBundle) -> Vec<String> {
    let mut alerts = Vec::new();
    if bundle.will_have_rain() {
        alerts.push(format!("{} will have rain", bundle.location));
    }
    if bundle.will_have_snow() {
        alerts.push(format!("{} will have snow", bundle.location));
    }
    alerts
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
