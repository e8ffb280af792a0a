//! Temperature trend report built from stored short-range forecasts.
//!
//! The axis samples the same forecast slot on consecutive days: the current
//! UTC hour is rounded to the nearest 3-hour bucket and then stepped forward
//! 24 hours at a time. Every (location, tick) pair must already be stored;
//! a single missing document fails the whole report.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Serialize;
use std::path::Path;

use crate::db::models::{Location, Namespace, StorageKey, KEY_TIME_FORMAT};
use crate::db::store::RecordStore;
use crate::errors::AppError;
use crate::helpers::{kelvin_to_fahrenheit, round_to_cadence};

/// One sampled temperature.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    /// Axis label, `YYYY-MM-DD_HH:MM:SS`.
    pub timestamp: String,
    pub temperature_f: f64,
}

/// Ordered temperatures for one location.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendSeries {
    /// Legend label, `City,CC`.
    pub label: String,
    pub points: Vec<TrendPoint>,
}

/// Input for the external plotting step: a shared x-axis and one line per location.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendReport {
    pub generated_at: DateTime<Utc>,
    pub axis: Vec<String>,
    pub series: Vec<TrendSeries>,
}

/// First axis tick: `now` with the hour rounded to the 3-hour cadence and
/// minutes/seconds cleared. Hours that round to 24 roll over to midnight of
/// the next day.
pub fn rounded_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let rounded = round_to_cadence(f64::from(now.hour()));
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        .unwrap_or(now);
    midnight + Duration::hours(i64::from(rounded))
}

/// `num_points` ticks, 24 hours apart, starting at `start`.
///
/// Fails instead of wrapping when a tick falls outside chrono's date range.
pub fn trend_axis(start: DateTime<Utc>, num_points: usize) -> Result<Vec<DateTime<Utc>>, AppError> {
    (0..num_points)
        .map(|day| {
            i64::try_from(day)
                .ok()
                .and_then(Duration::try_days)
                .and_then(|offset| start.checked_add_signed(offset))
                .ok_or_else(|| {
                    AppError::BadRequest(format!(
                        "Trend axis of {} points from {} is out of range",
                        num_points, start
                    ))
                })
        })
        .collect()
}

/// Build one series per location from the short-range namespace.
pub async fn build_trend_report(
    store: &dyn RecordStore,
    locations: &[Location],
    num_points: usize,
    now: DateTime<Utc>,
) -> Result<TrendReport, AppError> {
    let ticks = trend_axis(rounded_start(now), num_points)?;
    let axis: Vec<String> = ticks
        .iter()
        .map(|t| t.format(KEY_TIME_FORMAT).to_string())
        .collect();

    let mut series = Vec::with_capacity(locations.len());
    for location in locations {
        let mut points = Vec::with_capacity(ticks.len());
        for (tick, label) in ticks.iter().zip(&axis) {
            let kelvin = stored_temperature(store, location, *tick).await?;
            points.push(TrendPoint {
                timestamp: label.clone(),
                temperature_f: kelvin_to_fahrenheit(kelvin),
            });
        }
        series.push(TrendSeries {
            label: location.label(),
            points,
        });
    }

    Ok(TrendReport {
        generated_at: now,
        axis,
        series,
    })
}

/// Stored Kelvin temperature for `location` at `time`.
async fn stored_temperature(
    store: &dyn RecordStore,
    location: &Location,
    time: DateTime<Utc>,
) -> Result<f64, AppError> {
    let key = StorageKey::new(time, location);
    let document = store
        .get(Namespace::ShortRange, key.as_str())
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "No {} forecast stored under {}",
                Namespace::ShortRange,
                key
            ))
        })?;

    document
        .data
        .get("temperature")
        .and_then(|t| t.get("temp"))
        .and_then(|t| t.as_f64())
        .ok_or_else(|| {
            AppError::InternalError(format!("Document {} has no temperature.temp field", key))
        })
}

/// Write the report as pretty-printed JSON.
pub async fn write_report(report: &TrendReport, path: &Path) -> Result<(), AppError> {
    let json = serde_json::to_vec_pretty(report)?;
    tokio::fs::write(path, json).await?;
    tracing::info!("Trend report written to {}", path.display());
    Ok(())
}

/// Log one line per series.
pub fn log_report(report: &TrendReport) {
    for series in &report.series {
        let readings: Vec<String> = series
            .points
            .iter()
            .map(|p| format!("{} {:.1}°F", p.timestamp, p.temperature_f))
            .collect();
        tracing::info!("{}: {}", series.label, readings.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::MemoryRecordStore;
    use serde_json::json;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse::<DateTime<Utc>>().unwrap()
    }

    async fn seed(store: &MemoryRecordStore, location: &Location, time: &str, kelvin: f64) {
        let key = StorageKey::new(at(time), location);
        store
            .upsert(
                Namespace::ShortRange,
                key.as_str(),
                &json!({ "temperature": { "temp": kelvin } }),
            )
            .await
            .unwrap();
    }

    #[test]
    fn test_rounded_start_10_rounds_down_to_9() {
        assert_eq!(
            rounded_start(at("2023-06-15T10:00:00Z")),
            at("2023-06-15T09:00:00Z")
        );
    }

    #[test]
    fn test_rounded_start_clears_minutes_and_seconds() {
        assert_eq!(
            rounded_start(at("2023-06-15T11:47:12Z")),
            at("2023-06-15T12:00:00Z")
        );
    }

    #[test]
    fn test_rounded_start_hour_23_rolls_to_next_day() {
        assert_eq!(
            rounded_start(at("2023-06-30T23:10:00Z")),
            at("2023-07-01T00:00:00Z")
        );
    }

    #[test]
    fn test_trend_axis_five_days() {
        let axis: Vec<String> = trend_axis(rounded_start(at("2023-06-15T10:00:00Z")), 5)
            .unwrap()
            .iter()
            .map(|t| t.format(KEY_TIME_FORMAT).to_string())
            .collect();
        assert_eq!(
            axis,
            vec![
                "2023-06-15_09:00:00",
                "2023-06-16_09:00:00",
                "2023-06-17_09:00:00",
                "2023-06-18_09:00:00",
                "2023-06-19_09:00:00",
            ]
        );
    }

    #[test]
    fn test_trend_axis_empty() {
        assert!(trend_axis(at("2023-06-15T09:00:00Z"), 0).unwrap().is_empty());
    }

    #[test]
    fn test_trend_axis_past_max_date_is_an_error() {
        let start = DateTime::<Utc>::MAX_UTC - Duration::days(1);
        let result = trend_axis(start, 3);
        assert!(matches!(result, Err(AppError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_build_trend_report() {
        let store = MemoryRecordStore::new();
        let london = Location::new("London", "GB");
        let paris = Location::new("Paris", "FR");
        for (day, kelvin) in [(15, 290.0), (16, 291.0), (17, 300.0)] {
            let time = format!("2023-06-{}T09:00:00Z", day);
            seed(&store, &london, &time, kelvin).await;
            seed(&store, &paris, &time, kelvin + 2.0).await;
        }

        let report = build_trend_report(
            &store,
            &[london.clone(), paris.clone()],
            3,
            at("2023-06-15T10:05:00Z"),
        )
        .await
        .unwrap();

        assert_eq!(report.axis.len(), 3);
        assert_eq!(report.series.len(), 2);
        assert_eq!(report.series[0].label, "London,GB");
        assert_eq!(report.series[1].label, "Paris,FR");

        let london_points = &report.series[0].points;
        assert_eq!(london_points[0].timestamp, "2023-06-15_09:00:00");
        assert_eq!(london_points[2].timestamp, "2023-06-17_09:00:00");
        assert!((london_points[2].temperature_f - 80.33).abs() < 0.01);
        assert!(london_points[0].temperature_f < london_points[1].temperature_f);
    }

    #[tokio::test]
    async fn test_missing_key_fails_report() {
        let store = MemoryRecordStore::new();
        let london = Location::new("London", "GB");
        for day in [15, 16, 17, 19] {
            seed(&store, &london, &format!("2023-06-{}T09:00:00Z", day), 290.0).await;
        }

        let err = build_trend_report(&store, &[london], 5, at("2023-06-15T10:00:00Z"))
            .await
            .unwrap_err();

        match err {
            AppError::NotFound(msg) => assert!(msg.contains("2023-06-18_09:00:00_GB_London")),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_long_range_documents_are_not_used() {
        let store = MemoryRecordStore::new();
        let tokyo = Location::new("Tokyo", "JP");
        let key = StorageKey::new(at("2023-06-15T09:00:00Z"), &tokyo);
        store
            .upsert(
                Namespace::LongRange,
                key.as_str(),
                &json!({ "temperature": { "temp": 300.0 } }),
            )
            .await
            .unwrap();

        let result = build_trend_report(&store, &[tokyo], 1, at("2023-06-15T09:00:00Z")).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_document_without_temperature_is_an_error() {
        let store = MemoryRecordStore::new();
        let moscow = Location::new("Moscow", "RU");
        let key = StorageKey::new(at("2023-06-15T09:00:00Z"), &moscow);
        store
            .upsert(Namespace::ShortRange, key.as_str(), &json!({ "status": "Clear" }))
            .await
            .unwrap();

        let result = build_trend_report(&store, &[moscow], 1, at("2023-06-15T09:00:00Z")).await;
        assert!(matches!(result, Err(AppError::InternalError(_))));
    }

    #[tokio::test]
    async fn test_write_report_round_trips_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trend.json");
        let report = TrendReport {
            generated_at: at("2023-06-15T10:00:00Z"),
            axis: vec!["2023-06-15_09:00:00".to_string()],
            series: vec![TrendSeries {
                label: "London,GB".to_string(),
                points: vec![TrendPoint {
                    timestamp: "2023-06-15_09:00:00".to_string(),
                    temperature_f: 80.33,
                }],
            }],
        };

        write_report(&report, &path).await.unwrap();

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["series"][0]["label"], "London,GB");
        assert_eq!(written["axis"][0], "2023-06-15_09:00:00");
    }
}
