use std::path::PathBuf;
use std::time::Duration;

use crate::db::models::Location;
use crate::errors::AppError;

const DEFAULT_ZOOM_LEVEL: u8 = 5;
const MAX_ZOOM_LEVEL: u8 = 20;
/// The daily endpoint serves at most 16 days.
const MAX_LONG_RANGE_DAYS: u8 = 16;
const MAX_TREND_POINTS: usize = 366;
const DEFAULT_MAP_LAYERS: &str = "clouds_new,precipitation_new,pressure_new,wind_new,temp_new";
const DEFAULT_LOCATIONS: &str = "London,GB;Moscow,RU;Paris,FR;New York,US;Tokyo,JP";
const DEFAULT_OWM_API_URL: &str = "https://api.openweathermap.org";
const DEFAULT_OWM_TILE_URL: &str = "https://tile.openweathermap.org";

/// Application configuration, parsed from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_key: String,
    /// Postgres URL; without one, records live in memory for the run.
    pub database_url: Option<String>,
    pub zoom_level: u8,
    pub map_layers: Vec<String>,
    pub locations: Vec<Location>,
    pub tile_dir: PathBuf,
    pub long_range_days: u8,
    pub trend_points: usize,
    pub trend_output: PathBuf,
    pub tile_poll_interval: Duration,
    /// `None` polls for a tile forever.
    pub tile_poll_max_attempts: Option<u32>,
    pub location_pause: Duration,
    pub open_tiles: bool,
    pub reset_store: bool,
    pub owm_api_url: String,
    pub owm_tile_url: String,
    pub log_json: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_vars<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let api_key = var("OWM_API_KEY")
            .ok_or_else(|| AppError::BadRequest("OWM_API_KEY must be set".to_string()))?;

        let zoom_level = in_range(
            parse_or(var("MAP_ZOOM_LEVEL"), "MAP_ZOOM_LEVEL", DEFAULT_ZOOM_LEVEL)?,
            "MAP_ZOOM_LEVEL",
            0,
            MAX_ZOOM_LEVEL,
        )?;
        let long_range_days = in_range(
            parse_or(var("LONG_RANGE_DAYS"), "LONG_RANGE_DAYS", MAX_LONG_RANGE_DAYS)?,
            "LONG_RANGE_DAYS",
            1,
            MAX_LONG_RANGE_DAYS,
        )?;
        let trend_points = in_range(
            parse_or(var("TREND_POINTS"), "TREND_POINTS", 5)?,
            "TREND_POINTS",
            1,
            MAX_TREND_POINTS,
        )?;

        let map_layers =
            parse_layers(&var("MAP_LAYERS").unwrap_or_else(|| DEFAULT_MAP_LAYERS.to_string()));
        let locations =
            parse_locations(&var("LOCATIONS").unwrap_or_else(|| DEFAULT_LOCATIONS.to_string()))?;

        let max_attempts: u32 = parse_or(var("TILE_POLL_MAX_ATTEMPTS"), "TILE_POLL_MAX_ATTEMPTS", 40)?;

        Ok(Self {
            api_key,
            database_url: var("DATABASE_URL"),
            zoom_level,
            map_layers,
            locations,
            tile_dir: PathBuf::from(var("TILE_DIR").unwrap_or_else(|| "map_tiles".to_string())),
            long_range_days,
            trend_points,
            trend_output: PathBuf::from(
                var("TREND_OUTPUT").unwrap_or_else(|| "trend_report.json".to_string()),
            ),
            tile_poll_interval: Duration::from_secs(parse_or(
                var("TILE_POLL_INTERVAL_SECS"),
                "TILE_POLL_INTERVAL_SECS",
                3,
            )?),
            tile_poll_max_attempts: (max_attempts > 0).then_some(max_attempts),
            location_pause: Duration::from_secs(parse_or(
                var("LOCATION_PAUSE_SECS"),
                "LOCATION_PAUSE_SECS",
                3,
            )?),
            open_tiles: parse_or(var("OPEN_TILES"), "OPEN_TILES", false)?,
            reset_store: parse_or(var("RESET_STORE"), "RESET_STORE", false)?,
            owm_api_url: var("OWM_API_URL").unwrap_or_else(|| DEFAULT_OWM_API_URL.to_string()),
            owm_tile_url: var("OWM_TILE_URL").unwrap_or_else(|| DEFAULT_OWM_TILE_URL.to_string()),
            log_json: var("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
        })
    }
}

/// Parse an optional variable, falling back to `default` when unset.
fn parse_or<T: std::str::FromStr>(
    value: Option<String>,
    name: &str,
    default: T,
) -> Result<T, AppError> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::BadRequest(format!("{} has an invalid value: {}", name, raw))),
    }
}

/// Reject `value` outside `min..=max`.
fn in_range<T>(value: T, name: &str, min: T, max: T) -> Result<T, AppError>
where
    T: PartialOrd + std::fmt::Display,
{
    if value < min || value > max {
        return Err(AppError::BadRequest(format!(
            "{} must be between {} and {}, got {}",
            name, min, max, value
        )));
    }
    Ok(value)
}

/// Split `"clouds_new, wind_new"` into layer names, dropping empty entries.
pub fn parse_layers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|layer| !layer.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `"London,GB;New York,US"` into locations.
pub fn parse_locations(raw: &str) -> Result<Vec<Location>, AppError> {
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (city, country) = entry.split_once(',').ok_or_else(|| {
                AppError::BadRequest(format!("Location '{}' must look like City,CC", entry))
            })?;
            let (city, country) = (city.trim(), country.trim());
            if city.is_empty() || country.is_empty() {
                return Err(AppError::BadRequest(format!(
                    "Location '{}' is missing a city or country code",
                    entry
                )));
            }
            Ok(Location::new(city, country))
        })
        .collect()
}
