/// Collection cycles: provider → parse → store.
///
/// Run by the binary (typically from cron): weather hourly, traffic every
/// 15 minutes. The weather cycle never fails on provider problems, since
/// classification falls back to whatever is already stored. The traffic
/// cycle reports them, because a site without a feed id is a configuration
/// problem someone has to fix.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;

use crate::alert::stalenesses::hour_bucket;
use crate::ingest::open_meteo::{self, CurrentConditions};
use crate::ingest::waze;
use crate::logging::{self, DataSource};
use crate::model::{MeteoReading, MobilitySnapshot, ProviderError, Site, StoreError};
use crate::stations::{ensure_virtual_station, virtual_station_code};
use crate::store::{ReadingStore, SnapshotStore, StationStore};

// ---------------------------------------------------------------------------
// Results and errors
// ---------------------------------------------------------------------------

/// Outcome of one weather collection for one site.
#[derive(Debug, Clone, PartialEq)]
pub enum WeatherFetch {
    Stored(MeteoReading),
    /// Provider failure; nothing was written.
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CollectError {
    /// The site has no traffic feed configured.
    MissingFeedId(String),
    Provider(ProviderError),
    Store(StoreError),
}

impl fmt::Display for CollectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectError::MissingFeedId(site) => write!(f, "Site '{}' has no traffic feed id configured", site),
            CollectError::Provider(e) => write!(f, "{}", e),
            CollectError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CollectError {}

impl From<ProviderError> for CollectError {
    fn from(err: ProviderError) -> Self {
        CollectError::Provider(err)
    }
}

impl From<StoreError> for CollectError {
    fn from(err: StoreError) -> Self {
        CollectError::Store(err)
    }
}

/// Tally of one cycle over all sites.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Weather
// ---------------------------------------------------------------------------

/// Fetch current conditions for `site` and store them on its virtual station.
pub fn collect_weather(
    client: &reqwest::blocking::Client,
    base_url: &str,
    site: &Site,
    stations: &dyn StationStore,
    readings: &dyn ReadingStore,
) -> Result<WeatherFetch, CollectError> {
    let code = virtual_station_code(&site.id);
    let fetched = open_meteo::fetch_current(client, base_url, site.latitude, site.longitude, &code);
    record_weather(fetched, site, stations, readings)
}

/// Stores a fetch result. Provider errors become `Unavailable`; only store
/// errors are returned as `Err`.
pub fn record_weather(
    fetched: Result<CurrentConditions, ProviderError>,
    site: &Site,
    stations: &dyn StationStore,
    readings: &dyn ReadingStore,
) -> Result<WeatherFetch, CollectError> {
    let conditions = match fetched {
        Ok(c) => c,
        Err(e) => {
            logging::log_provider_failure(DataSource::Meteo, &site.id, "Open-Meteo fetch", &e);
            return Ok(WeatherFetch::Unavailable(e.to_string()));
        }
    };

    let station = ensure_virtual_station(stations, site)?;
    let mut reading = conditions.reading.clone();
    reading.station_code = station.code;
    readings.upsert_reading(&reading)?;

    logging::info(
        DataSource::Meteo,
        Some(&site.id),
        &format!(
            "Stored reading {} ({}): {}°C, {}% RH, {} mm/h, wind {} km/h",
            reading.observed_at.format("%Y-%m-%d %H:%M UTC"),
            conditions.condition(),
            display_opt(reading.temperature_c),
            display_opt(reading.humidity_pct),
            display_opt(reading.precipitation_mm_h),
            display_opt(reading.effective_wind_kmh()),
        ),
    );
    Ok(WeatherFetch::Stored(reading))
}

fn display_opt(v: Option<f64>) -> String {
    v.map(|x| format!("{:.1}", x)).unwrap_or_else(|| "-".to_string())
}

/// Weather collection over every site. A site counts as failed when the
/// provider was unavailable or the store rejected the write.
pub fn weather_cycle(
    client: &reqwest::blocking::Client,
    base_url: &str,
    sites: &[Site],
    stations: &dyn StationStore,
    readings: &dyn ReadingStore,
) -> CycleReport {
    let mut report = CycleReport::default();
    for site in sites.iter().filter(|s| s.active) {
        report.total += 1;
        match collect_weather(client, base_url, site, stations, readings) {
            Ok(WeatherFetch::Stored(_)) => report.successful += 1,
            Ok(WeatherFetch::Unavailable(_)) => report.failed += 1,
            Err(e) => {
                report.failed += 1;
                logging::error(DataSource::Database, Some(&site.id), &format!("Weather write failed: {}", e));
            }
        }
    }
    logging::log_cycle_summary(DataSource::Meteo, report.total, report.successful, report.failed);
    report
}

// ---------------------------------------------------------------------------
// Mobility
// ---------------------------------------------------------------------------

/// Pull the traffic feed for `site`, summarize it and upsert the hour's snapshot.
pub fn collect_mobility(
    client: &reqwest::blocking::Client,
    base_url: &str,
    site: &Site,
    snapshots: &dyn SnapshotStore,
    now: DateTime<Utc>,
) -> Result<MobilitySnapshot, CollectError> {
    let feed_id = site
        .feed_id
        .as_deref()
        .ok_or_else(|| CollectError::MissingFeedId(site.id.clone()))?;

    let raw = waze::fetch_feed(client, base_url, feed_id)?;
    record_mobility(&site.id, raw, snapshots, now)
}

/// Summarize a raw payload and upsert it under the hour bucket of `now`.
/// A second collection within the same hour replaces the first.
pub fn record_mobility(
    site_id: &str,
    raw: Value,
    snapshots: &dyn SnapshotStore,
    now: DateTime<Utc>,
) -> Result<MobilitySnapshot, CollectError> {
    let summary = waze::summarize_feed(&raw);

    if summary.skipped_records > 0 {
        logging::warn(
            DataSource::Traffic,
            Some(site_id),
            &format!("{} malformed feed records skipped", summary.skipped_records),
        );
    }

    let snapshot = MobilitySnapshot {
        site_id: site_id.to_string(),
        hour_bucket: hour_bucket(now),
        collected_at: now,
        summary,
        raw,
    };
    snapshots.upsert_snapshot(&snapshot)?;

    let s = &snapshot.summary;
    logging::info(
        DataSource::Traffic,
        Some(site_id),
        &format!(
            "Snapshot {}: {} jams ({} severe), {} alerts ({} major accidents), {} irregularities ({} closures)",
            snapshot.hour_bucket.format("%Y-%m-%d %H:00"),
            s.total_jams, s.severe_jams, s.total_alerts, s.major_accidents,
            s.total_irregularities, s.closures
        ),
    );
    Ok(snapshot)
}

/// Traffic collection over every site.
pub fn mobility_cycle(
    client: &reqwest::blocking::Client,
    base_url: &str,
    sites: &[Site],
    snapshots: &dyn SnapshotStore,
    now: DateTime<Utc>,
) -> CycleReport {
    let mut report = CycleReport::default();
    for site in sites.iter().filter(|s| s.active) {
        report.total += 1;
        match collect_mobility(client, base_url, site, snapshots, now) {
            Ok(_) => report.successful += 1,
            Err(CollectError::Provider(e)) => {
                report.failed += 1;
                logging::log_provider_failure(DataSource::Traffic, &site.id, "Traffic feed fetch", &e);
            }
            Err(e) => {
                report.failed += 1;
                logging::error(DataSource::Traffic, Some(&site.id), &e.to_string());
            }
        }
    }
    logging::log_cycle_summary(DataSource::Traffic, report.total, report.successful, report.failed);
    report
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 15, 0, 0).unwrap()
    }

    fn site() -> Site {
        Site {
            id: "rio".to_string(),
            name: "Rio de Janeiro".to_string(),
            latitude: -22.9068,
            longitude: -43.1729,
            feed_id: Some("18577882871".to_string()),
            active: true,
        }
    }

    fn conditions() -> CurrentConditions {
        CurrentConditions {
            reading: MeteoReading {
                station_code: "ignored".to_string(),
                observed_at: fixed_now(),
                temperature_c: Some(30.0),
                humidity_pct: Some(60.0),
                pressure_hpa: Some(1010.0),
                precipitation_mm_h: Some(1.2),
                wind_speed_kmh: Some(12.0),
                wind_gust_kmh: Some(20.0),
                wind_direction_deg: Some(180.0),
            },
            weather_code: Some(61),
            elevation_m: Some(5.0),
        }
    }

    #[test]
    fn test_provider_failure_is_unavailable_not_error() {
        let store = MemoryStore::new();
        let result = record_weather(Err(ProviderError::Timeout), &site(), &store, &store).unwrap();
        assert!(matches!(result, WeatherFetch::Unavailable(_)));
        assert_eq!(store.reading_count(), 0);
        assert!(store.stations_for_site("rio").unwrap().is_empty());
    }

    #[test]
    fn test_successful_fetch_creates_virtual_station() {
        let store = MemoryStore::new();
        let result = record_weather(Ok(conditions()), &site(), &store, &store).unwrap();
        match result {
            WeatherFetch::Stored(r) => assert_eq!(r.station_code, "OPENMETEO_RIO"),
            other => panic!("expected Stored, got {:?}", other),
        }
        let stations = store.stations_for_site("rio").unwrap();
        assert_eq!(stations.len(), 1);
        assert!(stations[0].principal);
    }

    #[test]
    fn test_same_timestamp_is_upserted() {
        let store = MemoryStore::new();
        record_weather(Ok(conditions()), &site(), &store, &store).unwrap();
        record_weather(Ok(conditions()), &site(), &store, &store).unwrap();
        assert_eq!(store.reading_count(), 1);
    }

    #[test]
    fn test_snapshots_dedup_on_hour_bucket() {
        let store = MemoryStore::new();
        let first = fixed_now() + Duration::minutes(5);
        let second = fixed_now() + Duration::minutes(50);
        record_mobility("rio", json!({"alerts": []}), &store, first).unwrap();
        let latest = record_mobility(
            "rio",
            json!({"alerts": [{"type": "ACCIDENT", "subtype": "ACCIDENT_MAJOR"}]}),
            &store,
            second,
        )
        .unwrap();
        assert_eq!(store.snapshot_count(), 1);
        assert_eq!(latest.hour_bucket, fixed_now());

        let stored = store.latest_snapshot_since("rio", fixed_now()).unwrap().unwrap();
        assert_eq!(stored.summary.major_accidents, 1);

        record_mobility("rio", json!({}), &store, fixed_now() + Duration::minutes(65)).unwrap();
        assert_eq!(store.snapshot_count(), 2);
    }

    #[test]
    fn test_missing_feed_id_is_reported() {
        let store = MemoryStore::new();
        let mut s = site();
        s.feed_id = None;
        let client = reqwest::blocking::Client::new();
        let err = collect_mobility(&client, "http://127.0.0.1:9", &s, &store, fixed_now()).unwrap_err();
        assert_eq!(err, CollectError::MissingFeedId("rio".to_string()));
    }
}
