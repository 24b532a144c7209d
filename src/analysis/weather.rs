/// Meteorological group level.
///
/// Combines three independent rules over the principal station's data:
/// hourly rain, effective wind (gust or sustained, whichever is stronger)
/// and the persistence-based heat level. The group level is the worst of
/// the three.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::alert::stalenesses::{is_stale_at, window_start};
use crate::alert::thresholds::{worst_case, Candidate};
use crate::analysis::heat::{classify_heat, HeatAssessment};
use crate::logging::{self, DataSource};
use crate::model::{Configuration, Level, MeteoReading};
use crate::stations;
use crate::store::{ReadingStore, StationStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeatherAssessment {
    pub level: Level,
    pub rain_level: Level,
    pub wind_level: Level,
    pub heat_level: Level,
    pub station_code: Option<String>,
    pub observed_at: Option<DateTime<Utc>>,
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub pressure_hpa: Option<f64>,
    pub precipitation_mm_h: Option<f64>,
    pub wind_kmh: Option<f64>,
    pub wind_direction: Option<String>,
    pub heat: Option<HeatAssessment>,
    /// `false` when no reading was inside the tolerance window.
    pub data_available: bool,
    pub reasons: Vec<String>,
    pub reason: String,
}

impl WeatherAssessment {
    /// Level 1 with an explicit "no recent data" reason.
    pub fn no_recent_data(station_code: Option<String>, detail: &str) -> Self {
        WeatherAssessment {
            level: Level::NORMAL,
            rain_level: Level::NORMAL,
            wind_level: Level::NORMAL,
            heat_level: Level::NORMAL,
            station_code,
            observed_at: None,
            temperature_c: None,
            humidity_pct: None,
            pressure_hpa: None,
            precipitation_mm_h: None,
            wind_kmh: None,
            wind_direction: None,
            heat: None,
            data_available: false,
            reasons: Vec::new(),
            reason: format!("no recent data: {}", detail),
        }
    }
}

/// Classifies the most recent reading plus the heat window.
///
/// `latest` is ignored when it is older than the weather tolerance; in that
/// case the result is level 1 and `data_available` is false. `window` feeds
/// the heat rule and may include readings older than `latest`.
pub fn classify_weather(
    latest: Option<&MeteoReading>,
    window: &[MeteoReading],
    config: &Configuration,
    now: DateTime<Utc>,
) -> WeatherAssessment {
    let tolerance_hours = config.tolerances.weather_hours;
    let max_age_minutes = (tolerance_hours.max(0) as u64) * 60;

    let reading = match latest {
        Some(r) if !is_stale_at(r.observed_at, max_age_minutes, now) => r,
        Some(r) => {
            return WeatherAssessment::no_recent_data(
                Some(r.station_code.clone()),
                &format!("last reading at {} is older than {}h", r.observed_at.format("%Y-%m-%d %H:%M UTC"), tolerance_hours),
            );
        }
        None => {
            return WeatherAssessment::no_recent_data(
                None,
                &format!("no reading within {}h", tolerance_hours),
            );
        }
    };

    let precipitation = reading.precipitation_mm_h.map(|p| p.max(0.0));
    let wind = reading.effective_wind_kmh();
    let thresholds = &config.thresholds;

    let rain_candidate = precipitation.and_then(|p| {
        thresholds
            .rain_mm_h
            .candidate(p, |step| format!("rain {:.1} mm/h (>= {} mm/h)", p, step.at))
    });
    let wind_candidate = wind.and_then(|w| {
        thresholds
            .wind_kmh
            .candidate(w, |step| format!("wind {:.1} km/h (>= {} km/h)", w, step.at))
    });

    let heat = classify_heat(window, &config.heat, window_start(now, config.tolerances.heat_window_hours));

    let rain_level = rain_candidate.as_ref().map(|c| c.level).unwrap_or(Level::NORMAL);
    let wind_level = wind_candidate.as_ref().map(|c| c.level).unwrap_or(Level::NORMAL);
    let heat_level = heat.level;

    let combined = worst_case(
        rain_candidate
            .into_iter()
            .chain(wind_candidate)
            .chain(std::iter::once(Candidate::new(heat.level, heat.reason.clone()))),
    );

    WeatherAssessment {
        level: combined.level,
        rain_level,
        wind_level,
        heat_level,
        station_code: Some(reading.station_code.clone()),
        observed_at: Some(reading.observed_at),
        temperature_c: reading.temperature_c,
        humidity_pct: reading.humidity_pct,
        pressure_hpa: reading.pressure_hpa,
        precipitation_mm_h: precipitation,
        wind_kmh: wind,
        wind_direction: reading.wind_direction_cardinal().map(String::from),
        heat: Some(heat),
        data_available: true,
        reason: combined.reason_text("no significant weather"),
        reasons: combined.reasons,
    }
}

/// Reads the site's principal station data from the stores and classifies it.
///
/// Store failures degrade to level 1; they never propagate.
pub fn assess_weather(
    station_store: &dyn StationStore,
    readings: &dyn ReadingStore,
    site_id: &str,
    config: &Configuration,
    now: DateTime<Utc>,
) -> WeatherAssessment {
    let principal = match stations::resolve_principal(station_store, site_id) {
        Ok(Some(station)) => station,
        Ok(None) => {
            logging::warn(DataSource::Meteo, Some(site_id), "No principal weather station configured");
            return WeatherAssessment::no_recent_data(None, "no principal station configured");
        }
        Err(e) => {
            logging::warn(DataSource::Meteo, Some(site_id), &format!("Station lookup failed: {}", e));
            return WeatherAssessment::no_recent_data(None, &format!("station store unavailable ({})", e));
        }
    };

    let reading_since = window_start(now, config.tolerances.weather_hours);
    let heat_since = window_start(now, config.tolerances.heat_window_hours);

    let latest = readings.latest_reading_since(&principal.code, reading_since);
    let window = readings.readings_since(&principal.code, heat_since);

    match (latest, window) {
        (Ok(latest), Ok(window)) => classify_weather(latest.as_ref(), &window, config, now),
        (Err(e), _) | (_, Err(e)) => {
            logging::warn(DataSource::Meteo, Some(site_id), &format!("Reading lookup failed: {}", e));
            WeatherAssessment::no_recent_data(
                Some(principal.code),
                &format!("reading store unavailable ({})", e),
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 15, 0, 0).unwrap()
    }

    fn config() -> Configuration {
        toml::from_str(r#"
            id = "default"
            version = "1.0"
            active = true
        "#)
        .expect("minimal configuration should parse")
    }

    fn reading(minutes_ago: i64) -> MeteoReading {
        MeteoReading {
            station_code: "OPENMETEO_RIO".to_string(),
            observed_at: fixed_now() - Duration::minutes(minutes_ago),
            temperature_c: Some(24.0),
            humidity_pct: Some(70.0),
            pressure_hpa: Some(1012.0),
            precipitation_mm_h: Some(0.0),
            wind_speed_kmh: Some(10.0),
            wind_gust_kmh: Some(18.0),
            wind_direction_deg: Some(90.0),
        }
    }

    #[test]
    fn test_no_reading_is_normal_with_reason() {
        let result = classify_weather(None, &[], &config(), fixed_now());
        assert_eq!(result.level, Level::NORMAL);
        assert!(!result.data_available);
        assert!(result.reason.contains("no recent data"));
    }

    #[test]
    fn test_stale_reading_is_ignored() {
        let old = reading(181);
        let result = classify_weather(Some(&old), &[old.clone()], &config(), fixed_now());
        assert_eq!(result.level, Level::NORMAL);
        assert!(result.reason.contains("no recent data"));
        assert_eq!(result.station_code.as_deref(), Some("OPENMETEO_RIO"));
    }

    #[test]
    fn test_reading_at_tolerance_edge_is_used() {
        let mut edge = reading(180);
        edge.precipitation_mm_h = Some(12.0);
        let result = classify_weather(Some(&edge), &[], &config(), fixed_now());
        assert!(result.data_available);
        assert_eq!(result.rain_level, Level::ATTENTION);
        assert_eq!(result.level, Level::ATTENTION);
    }

    #[test]
    fn test_worst_of_rain_and_wind_wins() {
        let mut r = reading(10);
        r.precipitation_mm_h = Some(6.0);
        r.wind_gust_kmh = Some(75.0);
        let result = classify_weather(Some(&r), &[r.clone()], &config(), fixed_now());
        assert_eq!(result.rain_level, Level::MOBILIZATION);
        assert_eq!(result.wind_level, Level::ALERT);
        assert_eq!(result.level, Level::ALERT);
        assert_eq!(result.reasons.len(), 2);
        assert!(result.reason.contains("rain 6.0"));
        assert!(result.reason.contains("wind 75.0"));
    }

    #[test]
    fn test_negative_precipitation_is_treated_as_zero() {
        let mut r = reading(5);
        r.precipitation_mm_h = Some(-3.0);
        let result = classify_weather(Some(&r), &[], &config(), fixed_now());
        assert_eq!(result.precipitation_mm_h, Some(0.0));
        assert_eq!(result.rain_level, Level::NORMAL);
    }

    #[test]
    fn test_calm_weather_reports_fallback_reason() {
        let r = reading(5);
        let result = classify_weather(Some(&r), &[r.clone()], &config(), fixed_now());
        assert_eq!(result.level, Level::NORMAL);
        assert_eq!(result.reason, "no significant weather");
        assert_eq!(result.wind_direction.as_deref(), Some("E"));
    }
}
