//! OpenWeatherMap client.
//!
//! Covers the three provider capabilities the ingestion jobs need:
//! forecasts (5 day / 3 hour and 16 day / daily), direct geocoding, and
//! weather map tiles. See: https://openweathermap.org/api
//!
//! No `units` parameter is sent, so every temperature comes back in Kelvin.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

use crate::db::models::{
    ForecastBundle, ForecastRecord, GeoPoint, Location, Namespace, Temperature, Wind,
};
use crate::errors::AppError;
use crate::services::tiles::TileCoords;

const REQUEST_TIMEOUT_SECS: u64 = 30;
const USER_AGENT: &str = "weather-harvest/0.1";

/// Source of dated forecast records for a location.
#[async_trait]
pub trait ForecastSource: Send + Sync {
    async fn fetch_short_range(&self, location: &Location) -> Result<ForecastBundle, AppError>;

    /// May fail with `AppError::Unauthorized` on accounts without daily forecast access.
    async fn fetch_long_range(
        &self,
        location: &Location,
        horizon_days: u8,
    ) -> Result<ForecastBundle, AppError>;
}

/// City/country → coordinates lookup.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geopoint_for(&self, location: &Location) -> Result<GeoPoint, AppError>;
}

/// Raw weather map tile images.
#[async_trait]
pub trait TileSource: Send + Sync {
    async fn fetch_tile(&self, layer: &str, zoom: u8, coords: TileCoords)
        -> Result<Vec<u8>, AppError>;
}

/// Client for the OpenWeatherMap data, geocoding and tile APIs.
#[derive(Debug, Clone)]
pub struct OwmClient {
    client: reqwest::Client,
    api_key: String,
    api_url: String,
    tile_url: String,
}

// --- OpenWeatherMap JSON response types ---

#[derive(Debug, Deserialize)]
struct ThreeHourResponse {
    list: Vec<ThreeHourEntry>,
}

#[derive(Debug, Deserialize)]
struct ThreeHourEntry {
    dt: i64,
    main: MainBlock,
    #[serde(default)]
    weather: Vec<WeatherCondition>,
    clouds: Option<CloudsBlock>,
    wind: Option<WindBlock>,
    rain: Option<VolumeBlock>,
    snow: Option<VolumeBlock>,
}

#[derive(Debug, Deserialize)]
struct MainBlock {
    temp: f64,
    temp_min: Option<f64>,
    temp_max: Option<f64>,
    feels_like: Option<f64>,
    pressure: Option<f64>,
    humidity: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WeatherCondition {
    id: u32,
    main: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct CloudsBlock {
    all: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WindBlock {
    speed: Option<f64>,
    deg: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct VolumeBlock {
    #[serde(rename = "3h")]
    three_hours: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DailyResponse {
    list: Vec<DailyEntry>,
}

#[derive(Debug, Deserialize)]
struct DailyEntry {
    dt: i64,
    temp: DailyTemperature,
    feels_like: Option<DailyFeelsLike>,
    pressure: Option<f64>,
    humidity: Option<f64>,
    #[serde(default)]
    weather: Vec<WeatherCondition>,
    speed: Option<f64>,
    deg: Option<f64>,
    clouds: Option<f64>,
    rain: Option<f64>,
    snow: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DailyTemperature {
    day: f64,
    min: Option<f64>,
    max: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DailyFeelsLike {
    day: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct GeocodeEntry {
    lat: f64,
    lon: f64,
}

impl OwmClient {
    pub fn new(api_key: &str, api_url: &str, tile_url: &str) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| AppError::InternalError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_key: api_key.to_string(),
            api_url: api_url.trim_end_matches('/').to_string(),
            tile_url: tile_url.trim_end_matches('/').to_string(),
        })
    }

    /// `GET` a URL and map provider status codes onto `AppError`.
    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<reqwest::Response, AppError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .query(&[("appid", self.api_key.as_str())])
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AppError::Unauthorized(format!(
                "OpenWeatherMap rejected the API key for {}",
                url
            )));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::NotFound(format!("OpenWeatherMap returned 404 for {}", url)));
        }
        if !status.is_success() {
            return Err(AppError::ExternalServiceError(format!(
                "OpenWeatherMap returned HTTP {} for {}",
                status, url
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl ForecastSource for OwmClient {
    async fn fetch_short_range(&self, location: &Location) -> Result<ForecastBundle, AppError> {
        let url = format!("{}/data/2.5/forecast", self.api_url);
        let body: ThreeHourResponse = self
            .get(&url, &[("q", location.to_string())])
            .await?
            .json()
            .await
            .map_err(|e| {
                AppError::ExternalServiceError(format!("Forecast JSON parse error: {}", e))
            })?;

        let records = body
            .list
            .into_iter()
            .map(three_hour_record)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ForecastBundle {
            location: location.clone(),
            namespace: Namespace::ShortRange,
            records,
        })
    }

    async fn fetch_long_range(
        &self,
        location: &Location,
        horizon_days: u8,
    ) -> Result<ForecastBundle, AppError> {
        let url = format!("{}/data/2.5/forecast/daily", self.api_url);
        let body: DailyResponse = self
            .get(
                &url,
                &[("q", location.to_string()), ("cnt", horizon_days.to_string())],
            )
            .await?
            .json()
            .await
            .map_err(|e| {
                AppError::ExternalServiceError(format!("Daily forecast JSON parse error: {}", e))
            })?;

        let records = body
            .list
            .into_iter()
            .map(daily_record)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ForecastBundle {
            location: location.clone(),
            namespace: Namespace::LongRange,
            records,
        })
    }
}

#[async_trait]
impl Geocoder for OwmClient {
    async fn geopoint_for(&self, location: &Location) -> Result<GeoPoint, AppError> {
        let url = format!("{}/geo/1.0/direct", self.api_url);
        let entries: Vec<GeocodeEntry> = self
            .get(&url, &[("q", location.to_string()), ("limit", "1".to_string())])
            .await?
            .json()
            .await
            .map_err(|e| AppError::ExternalServiceError(format!("Geocode JSON parse error: {}", e)))?;

        entries
            .first()
            .map(|e| GeoPoint { lat: e.lat, lon: e.lon })
            .ok_or_else(|| AppError::NotFound(format!("No coordinates found for {}", location)))
    }
}

#[async_trait]
impl TileSource for OwmClient {
    async fn fetch_tile(
        &self,
        layer: &str,
        zoom: u8,
        coords: TileCoords,
    ) -> Result<Vec<u8>, AppError> {
        let url = format!(
            "{}/map/{}/{}/{}/{}.png",
            self.tile_url, layer, zoom, coords.x, coords.y
        );
        let bytes = self.get(&url, &[]).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

fn timestamp(dt: i64) -> Result<DateTime<Utc>, AppError> {
    DateTime::from_timestamp(dt, 0).ok_or_else(|| {
        AppError::ExternalServiceError(format!("Forecast entry has invalid timestamp {}", dt))
    })
}

/// The first listed condition is the primary one.
fn primary_condition(weather: &[WeatherCondition]) -> (String, String, u32) {
    weather
        .first()
        .map(|w| (w.main.clone(), w.description.clone(), w.id))
        .unwrap_or_else(|| ("Unknown".to_string(), "unknown".to_string(), 0))
}

fn three_hour_record(entry: ThreeHourEntry) -> Result<ForecastRecord, AppError> {
    let (status, detailed_status, weather_code) = primary_condition(&entry.weather);
    Ok(ForecastRecord {
        reference_time: timestamp(entry.dt)?,
        status,
        detailed_status,
        weather_code,
        temperature: Temperature {
            temp: entry.main.temp,
            temp_min: entry.main.temp_min,
            temp_max: entry.main.temp_max,
            feels_like: entry.main.feels_like,
        },
        humidity: entry.main.humidity,
        pressure: entry.main.pressure,
        clouds: entry.clouds.and_then(|c| c.all),
        wind: Wind {
            speed: entry.wind.as_ref().and_then(|w| w.speed),
            deg: entry.wind.as_ref().and_then(|w| w.deg),
        },
        rain_mm: entry.rain.and_then(|r| r.three_hours),
        snow_mm: entry.snow.and_then(|s| s.three_hours),
    })
}

fn daily_record(entry: DailyEntry) -> Result<ForecastRecord, AppError> {
    let (status, detailed_status, weather_code) = primary_condition(&entry.weather);
    Ok(ForecastRecord {
        reference_time: timestamp(entry.dt)?,
        status,
        detailed_status,
        weather_code,
        temperature: Temperature {
            temp: entry.temp.day,
            temp_min: entry.temp.min,
            temp_max: entry.temp.max,
            feels_like: entry.feels_like.and_then(|f| f.day),
        },
        humidity: entry.humidity,
        pressure: entry.pressure,
        clouds: entry.clouds,
        wind: Wind {
            speed: entry.speed,
            deg: entry.deg,
        },
        rain_mm: entry.rain,
        snow_mm: entry.snow,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> OwmClient {
        OwmClient::new("test-key", &server.uri(), &server.uri()).unwrap()
    }

    fn three_hour_body() -> serde_json::Value {
        json!({
            "cod": "200",
            "list": [
                {
                    "dt": 1686819600,
                    "main": { "temp": 291.2, "temp_min": 290.0, "temp_max": 292.1,
                              "feels_like": 290.8, "pressure": 1012, "humidity": 71 },
                    "weather": [{ "id": 500, "main": "Rain", "description": "light rain", "icon": "10d" }],
                    "clouds": { "all": 75 },
                    "wind": { "speed": 4.1, "deg": 250 },
                    "rain": { "3h": 0.42 }
                },
                {
                    "dt": 1686830400,
                    "main": { "temp": 293.0 },
                    "weather": [{ "id": 800, "main": "Clear", "description": "clear sky", "icon": "01d" }]
                }
            ]
        })
    }

    #[tokio::test]
    async fn test_fetch_short_range_parses_records() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/2.5/forecast"))
            .and(query_param("q", "London,GB"))
            .and(query_param("appid", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(three_hour_body()))
            .mount(&server)
            .await;

        let bundle = client_for(&server)
            .fetch_short_range(&Location::new("London", "GB"))
            .await
            .unwrap();

        assert_eq!(bundle.namespace, Namespace::ShortRange);
        assert_eq!(bundle.records.len(), 2);
        let first = &bundle.records[0];
        assert_eq!(
            first.reference_time,
            "2023-06-15T09:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert_eq!(first.status, "Rain");
        assert_eq!(first.weather_code, 500);
        assert_eq!(first.temperature.temp, 291.2);
        assert_eq!(first.rain_mm, Some(0.42));
        assert_eq!(bundle.records[1].clouds, None);
        assert!(bundle.will_have_rain());
        assert!(!bundle.will_have_snow());
    }

    #[tokio::test]
    async fn test_fetch_long_range_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/2.5/forecast/daily"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "cod": 401,
                "message": "Invalid API key."
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .fetch_long_range(&Location::new("Paris", "FR"), 16)
            .await
            .unwrap_err();
        assert!(err.is_unauthorized(), "unexpected error: {}", err);
    }

    #[tokio::test]
    async fn test_fetch_long_range_parses_daily_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/2.5/forecast/daily"))
            .and(query_param("cnt", "16"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "list": [{
                    "dt": 1686826800,
                    "temp": { "day": 295.5, "min": 288.1, "max": 297.0, "night": 289.0 },
                    "feels_like": { "day": 295.0 },
                    "pressure": 1015,
                    "humidity": 60,
                    "weather": [{ "id": 601, "main": "Snow", "description": "snow" }],
                    "speed": 3.3,
                    "deg": 120,
                    "clouds": 40,
                    "snow": 1.2
                }]
            })))
            .mount(&server)
            .await;

        let bundle = client_for(&server)
            .fetch_long_range(&Location::new("Moscow", "RU"), 16)
            .await
            .unwrap();

        assert_eq!(bundle.namespace, Namespace::LongRange);
        let record = &bundle.records[0];
        assert_eq!(record.temperature.temp, 295.5);
        assert_eq!(record.temperature.feels_like, Some(295.0));
        assert_eq!(record.snow_mm, Some(1.2));
        assert!(bundle.will_have_snow());
    }

    #[tokio::test]
    async fn test_server_error_is_external_service_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .fetch_short_range(&Location::new("Tokyo", "JP"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ExternalServiceError(_)));
    }

    #[tokio::test]
    async fn test_geopoint_for() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/geo/1.0/direct"))
            .and(query_param("q", "New York,US"))
            .and(query_param("limit", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "name": "New York", "lat": 40.7128, "lon": -74.006, "country": "US" }
            ])))
            .mount(&server)
            .await;

        let point = client_for(&server)
            .geopoint_for(&Location::new("New York", "US"))
            .await
            .unwrap();
        assert_eq!(point, GeoPoint { lat: 40.7128, lon: -74.006 });
    }

    #[tokio::test]
    async fn test_geopoint_for_unknown_city() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/geo/1.0/direct"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .geopoint_for(&Location::new("Atlantis", "XX"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_fetch_tile_returns_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/map/clouds_new/5/15/10.png"))
            .and(query_param("appid", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .mount(&server)
            .await;

        let bytes = client_for(&server)
            .fetch_tile("clouds_new", 5, TileCoords { x: 15, y: 10 })
            .await
            .unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }
}
