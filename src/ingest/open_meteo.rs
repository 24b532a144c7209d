/// Open-Meteo forecast API client (current conditions)
///
/// Retrieves the `current` block for a coordinate pair and turns it into a
/// `MeteoReading` for the site's virtual station. No API key is needed.
///
/// API Documentation: https://open-meteo.com/en/docs

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::model::{MeteoReading, ProviderError};
use crate::stations::clamp_coordinates;

pub const OPEN_METEO_BASE_URL: &str = "https://api.open-meteo.com/v1";

/// Fields requested in the `current=` parameter.
pub const CURRENT_FIELDS: &str = "temperature_2m,relative_humidity_2m,precipitation,rain,\
wind_speed_10m,wind_gusts_10m,wind_direction_10m,pressure_msl,weather_code";

// ============================================================================
// API Response Structures
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ForecastResponse {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub elevation: Option<f64>,
    pub timezone: Option<String>,
    /// Offset of the local `current.time` from UTC.
    #[serde(default)]
    pub utc_offset_seconds: i32,
    pub current: Option<CurrentBlock>,
}

#[derive(Debug, Deserialize)]
pub struct CurrentBlock {
    pub time: Option<String>,  // local time, "2025-12-28T16:15"
    pub temperature_2m: Option<f64>,
    pub relative_humidity_2m: Option<f64>,
    pub precipitation: Option<f64>,  // mm over the preceding hour
    pub rain: Option<f64>,
    pub wind_speed_10m: Option<f64>,  // km/h
    pub wind_gusts_10m: Option<f64>,
    pub wind_direction_10m: Option<f64>,
    pub pressure_msl: Option<f64>,  // hPa
    pub weather_code: Option<i64>,  // WMO code
}

/// A parsed current-conditions response.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentConditions {
    pub reading: MeteoReading,
    pub weather_code: Option<i64>,
    pub elevation_m: Option<f64>,
}

impl CurrentConditions {
    pub fn condition(&self) -> &'static str {
        self.weather_code.map(describe_weather_code).unwrap_or("Unknown")
    }
}

// ============================================================================
// API Client Functions
// ============================================================================

/// Current-conditions request URL, with coordinates clamped to
/// [-90, 90] x [-180, 180].
pub fn current_url(base_url: &str, latitude: f64, longitude: f64) -> String {
    let (latitude, longitude) = clamp_coordinates(latitude, longitude);
    format!(
        "{}/forecast?latitude={:.4}&longitude={:.4}&current={}&timezone=auto",
        base_url.trim_end_matches('/'),
        latitude,
        longitude,
        CURRENT_FIELDS
    )
}

/// Fetch current conditions for a coordinate pair
///
/// # Parameters
/// - `client`: HTTP client (timeout configured by the caller)
/// - `base_url`: usually `OPEN_METEO_BASE_URL`
/// - `station_code`: code the resulting reading is attached to
pub fn fetch_current(
    client: &reqwest::blocking::Client,
    base_url: &str,
    latitude: f64,
    longitude: f64,
    station_code: &str,
) -> Result<CurrentConditions, ProviderError> {
    let url = current_url(base_url, latitude, longitude);

    let response = client
        .get(&url)
        .header("Accept", "application/json")
        .send()?;

    if !response.status().is_success() {
        return Err(ProviderError::HttpError(response.status().as_u16()));
    }

    let body = response.text()?;
    parse_current_response(&body, station_code)
}

/// Parse a forecast response body into a reading.
///
/// Fails with `MissingCurrent` when the `current` block is absent, and with
/// `ParseError` for malformed JSON or a missing/unparseable `time`.
pub fn parse_current_response(
    body: &str,
    station_code: &str,
) -> Result<CurrentConditions, ProviderError> {
    let response: ForecastResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::ParseError(format!("Open-Meteo response: {}", e)))?;

    let current = response.current.ok_or(ProviderError::MissingCurrent)?;

    let local_time = current
        .time
        .as_deref()
        .ok_or_else(|| ProviderError::ParseError("current block has no time".to_string()))?;
    let observed_at = local_to_utc(local_time, response.utc_offset_seconds)?;

    let reading = MeteoReading {
        station_code: station_code.to_string(),
        observed_at,
        temperature_c: current.temperature_2m,
        humidity_pct: current.relative_humidity_2m,
        pressure_hpa: current.pressure_msl,
        precipitation_mm_h: current.precipitation.or(current.rain),
        wind_speed_kmh: current.wind_speed_10m,
        wind_gust_kmh: current.wind_gusts_10m,
        wind_direction_deg: current.wind_direction_10m,
    };

    Ok(CurrentConditions {
        reading,
        weather_code: current.weather_code,
        elevation_m: response.elevation,
    })
}

/// Open-Meteo reports `current.time` in the requested timezone without an
/// offset suffix; `utc_offset_seconds` says how to get back to UTC.
fn local_to_utc(local: &str, utc_offset_seconds: i32) -> Result<DateTime<Utc>, ProviderError> {
    let naive = NaiveDateTime::parse_from_str(local, "%Y-%m-%dT%H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(local, "%Y-%m-%dT%H:%M:%S"))
        .map_err(|e| ProviderError::ParseError(format!("bad time '{}': {}", local, e)))?;

    let offset = FixedOffset::east_opt(utc_offset_seconds).ok_or_else(|| {
        ProviderError::ParseError(format!("bad utc_offset_seconds {}", utc_offset_seconds))
    })?;

    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| ProviderError::ParseError(format!("ambiguous local time '{}'", local)))
}

/// Short description of a WMO weather code.
pub fn describe_weather_code(code: i64) -> &'static str {
    match code {
        0 => "Clear sky",
        1 => "Mainly clear",
        2 => "Partly cloudy",
        3 => "Overcast",
        45 => "Fog",
        48 => "Depositing rime fog",
        51 => "Light drizzle",
        53 => "Moderate drizzle",
        55 => "Dense drizzle",
        61 => "Slight rain",
        63 => "Moderate rain",
        65 => "Heavy rain",
        80 => "Slight rain showers",
        81 => "Moderate rain showers",
        82 => "Violent rain showers",
        95 => "Thunderstorm",
        96 => "Thunderstorm with slight hail",
        99 => "Thunderstorm with heavy hail",
        _ => "Unknown",
    }
}
