//! Map tile directory maintenance.
//!
//! The tile directory is shared by the tile-fetch job (producer) and the
//! tile-display job (consumer) of each location. There is no signalling
//! between them: the display job polls until a finished tile shows up.
//! Tiles are written to a `.part` file and renamed into place, so a poll never
//! sees a half-written image.

use image::ImageFormat;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::db::models::{GeoPoint, Location};
use crate::errors::AppError;

/// Web-Mercator latitude limit; tiles do not exist beyond it.
const MAX_MERCATOR_LAT: f64 = 85.051_128_78;

/// Extension of tiles still being written.
const PARTIAL_EXTENSION: &str = "part";

/// Slippy-map tile index at a given zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCoords {
    pub x: u32,
    pub y: u32,
}

impl TileCoords {
    /// Tile containing `point` at `zoom`.
    pub fn for_point(point: GeoPoint, zoom: u8) -> Self {
        let n = 2_f64.powi(i32::from(zoom));
        let lat_rad = point.lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT).to_radians();

        let x = ((point.lon + 180.0) / 360.0 * n).floor();
        let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / std::f64::consts::PI) / 2.0
            * n)
            .floor();

        let max = n - 1.0;
        Self {
            x: x.clamp(0.0, max) as u32,
            y: y.clamp(0.0, max) as u32,
        }
    }
}

/// `{city}_{country}_{zoom}_{layer}.png`
pub fn tile_file_name(location: &Location, zoom: u8, layer: &str) -> String {
    format!(
        "{}_{}_{}_{}.png",
        location.city_name, location.country_code, zoom, layer
    )
}

/// Decode `bytes` as an image and store it as PNG under `dir/file_name`.
pub async fn save_tile(dir: &Path, file_name: &str, bytes: Vec<u8>) -> Result<PathBuf, AppError> {
    let path = dir.join(file_name);
    let partial = path.with_extension(format!("png.{}", PARTIAL_EXTENSION));

    tokio::task::spawn_blocking(move || -> Result<PathBuf, AppError> {
        let img = image::load_from_memory(&bytes)?;
        img.save_with_format(&partial, ImageFormat::Png)?;
        std::fs::rename(&partial, &path)?;
        Ok(path)
    })
    .await?
}

/// Delete every top-level regular file in `dir`, creating the directory if needed.
///
/// Subdirectories and symlinks are left alone. A file that cannot be removed
/// is logged and skipped. Returns the number of files removed.
pub async fn reset_tile_directory(dir: &Path) -> Result<usize, AppError> {
    tokio::fs::create_dir_all(dir).await?;

    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        match entry.file_type().await {
            Ok(ft) if ft.is_file() => {}
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("Failed to inspect {}: {}", path.display(), e);
                continue;
            }
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!("Failed to delete tile {}: {}", path.display(), e),
        }
    }

    tracing::info!("Cleared {} tile(s) from {}", removed, dir.display());
    Ok(removed)
}

/// How the display job waits for the first tile.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    /// `None` polls until a tile appears, however long that takes.
    pub max_attempts: Option<u32>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_attempts: Some(40),
        }
    }
}

enum PollState {
    Polling { attempt: u32 },
    Done(PathBuf),
}

/// Wait until `dir` holds at least one finished tile and return the newest.
pub async fn await_latest_tile(dir: &Path, policy: &PollPolicy) -> Result<PathBuf, AppError> {
    let mut state = PollState::Polling { attempt: 1 };
    loop {
        state = match state {
            PollState::Done(path) => return Ok(path),
            PollState::Polling { attempt } => match latest_tile(dir).await? {
                Some(path) => PollState::Done(path),
                None => {
                    if let Some(max) = policy.max_attempts {
                        if attempt >= max {
                            return Err(AppError::Timeout(format!(
                                "no map tile appeared in {} after {} polls",
                                dir.display(),
                                attempt
                            )));
                        }
                    }
                    tracing::info!("Check back once the map files have been saved to disk");
                    tokio::time::sleep(policy.interval).await;
                    PollState::Polling {
                        attempt: attempt + 1,
                    }
                }
            },
        };
    }
}

/// Newest finished tile in `dir` by creation time, if any.
///
/// Falls back to modification time on filesystems that do not record
/// creation time. A missing directory counts as empty.
async fn latest_tile(dir: &Path) -> Result<Option<PathBuf>, AppError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == PARTIAL_EXTENSION) {
            continue;
        }
        // Tiles can be renamed or removed between listing and stat.
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let Ok(stamp) = metadata.created().or_else(|_| metadata.modified()) else {
            continue;
        };
        if newest.as_ref().map_or(true, |(best, _)| stamp >= *best) {
            newest = Some((stamp, path));
        }
    }

    Ok(newest.map(|(_, path)| path))
}

/// Presents the tile chosen by the display job.
pub trait TileViewer: Send + Sync {
    fn show(&self, path: &Path) -> Result<(), AppError>;
}

/// Reports the tile path in the log only.
#[derive(Debug, Default)]
pub struct LogViewer;

impl TileViewer for LogViewer {
    fn show(&self, path: &Path) -> Result<(), AppError> {
        tracing::info!("Latest map tile: {}", path.display());
        Ok(())
    }
}

/// Opens the tile with the desktop's default handler.
#[derive(Debug, Default)]
pub struct BrowserViewer;

impl TileViewer for BrowserViewer {
    fn show(&self, path: &Path) -> Result<(), AppError> {
        let absolute = std::fs::canonicalize(path)?;
        webbrowser::open(&format!("file://{}", absolute.display())).map_err(|e| {
            AppError::ExternalServiceError(format!("Failed to open {}: {}", absolute.display(), e))
        })?;
        tracing::info!("Opened map tile {}", absolute.display());
        Ok(())
    }
}
