//! Shared numeric helpers for temperatures and forecast cadence.
//!
//! OpenWeatherMap reports temperatures in Kelvin when no `units` parameter is
//! sent, which is how every record is stored. Conversions to reporting units
//! happen only when reading back.

/// Offset between Kelvin and Celsius.
const KELVIN_OFFSET: f64 = 273.15;

/// Forecast cadence of the short-range endpoint, in hours.
pub(crate) const FORECAST_CADENCE_HOURS: u32 = 3;

/// Convert a Kelvin temperature to Fahrenheit: `(K - 273.15) * 9/5 + 32`.
pub(crate) fn kelvin_to_fahrenheit(kelvin: f64) -> f64 {
    (kelvin - KELVIN_OFFSET) * 9.0 / 5.0 + 32.0
}

/// Round an hour of the day to the nearest multiple of the forecast cadence.
///
/// Uses round-half-up (`f64::round`). Integer hours never land on a tie, but
/// the rule is fixed so callers passing fractional hours get a stable answer.
/// The result can be 24 for hours past 22:30; callers add it as an offset
/// from midnight rather than setting it as a clock hour.
pub(crate) fn round_to_cadence(hour: f64) -> u32 {
    let cadence = f64::from(FORECAST_CADENCE_HOURS);
    ((hour / cadence).round() * cadence) as u32
}
