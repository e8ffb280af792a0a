use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Timestamp layout shared by storage keys and report axis labels.
pub const KEY_TIME_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";

/// A configured place to ingest forecasts and tiles for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub city_name: String,
    pub country_code: String,
}

impl Location {
    pub fn new(city_name: &str, country_code: &str) -> Self {
        Self {
            city_name: city_name.to_string(),
            country_code: country_code.to_string(),
        }
    }

    /// Label used in logs and report legends, e.g. `London,GB`.
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.city_name, self.country_code)
    }
}

/// Logically separate storage areas sharing one key scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// 5 days / 3 hours forecasts.
    ShortRange,
    /// 16 days / daily forecasts.
    LongRange,
}

impl Namespace {
    pub const ALL: [Namespace; 2] = [Namespace::ShortRange, Namespace::LongRange];

    /// Collection name persisted in the `namespace` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::ShortRange => "5_days_per_3_hours",
            Namespace::LongRange => "16_days_daily",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic document id: `{YYYY-MM-DD_HH:MM:SS}_{country_code}_{city_name}` (UTC).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn new(reference_time: DateTime<Utc>, location: &Location) -> Self {
        Self(format!(
            "{}_{}_{}",
            reference_time.format(KEY_TIME_FORMAT),
            location.country_code,
            location.city_name
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Temperatures in Kelvin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Temperature {
    pub temp: f64,
    pub temp_min: Option<f64>,
    pub temp_max: Option<f64>,
    pub feels_like: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wind {
    pub speed: Option<f64>,
    pub deg: Option<f64>,
}

/// One forecast entry as stored in the `data` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub reference_time: DateTime<Utc>,
    /// Provider weather group, e.g. `Rain`, `Snow`, `Clouds`.
    pub status: String,
    pub detailed_status: String,
    pub weather_code: u32,
    pub temperature: Temperature,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub clouds: Option<f64>,
    pub wind: Wind,
    pub rain_mm: Option<f64>,
    pub snow_mm: Option<f64>,
}

/// All records returned by one forecast request for a location.
#[derive(Debug, Clone)]
pub struct ForecastBundle {
    pub location: Location,
    pub namespace: Namespace,
    pub records: Vec<ForecastRecord>,
}

impl ForecastBundle {
    pub fn will_have_rain(&self) -> bool {
        self.has_status("rain")
    }

    pub fn will_have_snow(&self) -> bool {
        self.has_status("snow")
    }

    fn has_status(&self, status: &str) -> bool {
        self.records
            .iter()
            .any(|r| r.status.eq_ignore_ascii_case(status))
    }
}

/// A persisted forecast document.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct StoredDocument {
    pub key: String,
    pub data: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Latitude/longitude in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}
