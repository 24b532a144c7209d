/// PostgreSQL persistence adapter.
///
/// Implements every store trait against the schema in
/// `sql/001_stage_schema.sql`. Stage records are written once and never
/// updated; their full structure is kept in a jsonb `payload` column next to
/// a few indexed scalar columns used for filtering.

use chrono::{DateTime, Utc};
use postgres::{Client, NoTls, Row};
use std::env;
use std::sync::{Mutex, MutexGuard};

use crate::model::{
    FeedSummary, IncidentCounts, Level, MeteoReading, MobilitySnapshot, StageRecord, Station,
    StoreError,
};
use crate::store::{IncidentSource, ReadingStore, SnapshotStore, StageHistory, StationStore};

/// Incident statuses that count as open.
pub const OPEN_STATUSES: [&str; 3] = ["open", "in_progress", "waiting"];

impl From<postgres::Error> for StoreError {
    fn from(err: postgres::Error) -> Self {
        if err.is_closed() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Database(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

pub struct PgStore {
    client: Mutex<Client>,
}

impl PgStore {
    pub fn new(client: Client) -> Self {
        PgStore { client: Mutex::new(client) }
    }

    fn client(&self) -> Result<MutexGuard<'_, Client>, StoreError> {
        self.client
            .lock()
            .map_err(|_| StoreError::Unavailable("database client lock poisoned".to_string()))
    }
}

/// Connect with an explicit connection string.
pub fn connect(database_url: &str) -> Result<PgStore, StoreError> {
    let client = Client::connect(database_url, NoTls)
        .map_err(|e| StoreError::Unavailable(format!("connect failed: {}", e)))?;
    Ok(PgStore::new(client))
}

/// Connect using the connection string in `var` (loaded from `.env` if present).
pub fn connect_from_env(var: &str) -> Result<PgStore, StoreError> {
    dotenv::dotenv().ok();
    let url = env::var(var)
        .map_err(|_| StoreError::Unavailable(format!("{} must be set in .env or the environment", var)))?;
    connect(&url)
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn station_from_row(row: &Row) -> Station {
    Station {
        code: row.get("code"),
        site_id: row.get("site_id"),
        name: row.get("name"),
        latitude: row.get("latitude"),
        longitude: row.get("longitude"),
        distance_km: row.get("distance_km"),
        principal: row.get("principal"),
        active: row.get("active"),
    }
}

fn reading_from_row(row: &Row) -> MeteoReading {
    MeteoReading {
        station_code: row.get("station_code"),
        observed_at: row.get("observed_at"),
        temperature_c: row.get("temperature_c"),
        humidity_pct: row.get("humidity_pct"),
        pressure_hpa: row.get("pressure_hpa"),
        precipitation_mm_h: row.get("precipitation_mm_h"),
        wind_speed_kmh: row.get("wind_speed_kmh"),
        wind_gust_kmh: row.get("wind_gust_kmh"),
        wind_direction_deg: row.get("wind_direction_deg"),
    }
}

fn snapshot_from_row(row: &Row) -> Result<MobilitySnapshot, StoreError> {
    let summary: serde_json::Value = row.get("summary");
    Ok(MobilitySnapshot {
        site_id: row.get("site_id"),
        hour_bucket: row.get("hour_bucket"),
        collected_at: row.get("collected_at"),
        summary: serde_json::from_value::<FeedSummary>(summary)?,
        raw: row.get("raw"),
    })
}

fn record_from_row(row: &Row) -> Result<StageRecord, StoreError> {
    let payload: serde_json::Value = row.get("payload");
    let mut record: StageRecord = serde_json::from_value(payload)?;
    record.id = Some(row.get("id"));
    Ok(record)
}

fn records_from_rows(rows: &[Row]) -> Result<Vec<StageRecord>, StoreError> {
    rows.iter().map(record_from_row).collect()
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// Store implementations
// ---------------------------------------------------------------------------

impl StationStore for PgStore {
    fn stations_for_site(&self, site_id: &str) -> Result<Vec<Station>, StoreError> {
        let rows = self.client()?.query(
            "SELECT code, site_id, name, latitude, longitude, distance_km, principal, active
             FROM stations
             WHERE site_id = $1
             ORDER BY principal DESC, distance_km ASC",
            &[&site_id],
        )?;
        Ok(rows.iter().map(station_from_row).collect())
    }

    fn upsert_station(&self, station: &Station) -> Result<(), StoreError> {
        self.client()?.execute(
            "INSERT INTO stations (code, site_id, name, latitude, longitude, distance_km, principal, active)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (code) DO UPDATE SET
                site_id = EXCLUDED.site_id,
                name = EXCLUDED.name,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                distance_km = EXCLUDED.distance_km,
                principal = EXCLUDED.principal,
                active = EXCLUDED.active",
            &[
                &station.code,
                &station.site_id,
                &station.name,
                &station.latitude,
                &station.longitude,
                &station.distance_km,
                &station.principal,
                &station.active,
            ],
        )?;
        Ok(())
    }
}

const READING_COLUMNS: &str = "station_code, observed_at, temperature_c, humidity_pct, pressure_hpa,
    precipitation_mm_h, wind_speed_kmh, wind_gust_kmh, wind_direction_deg";

impl ReadingStore for PgStore {
    fn upsert_reading(&self, r: &MeteoReading) -> Result<(), StoreError> {
        self.client()?.execute(
            "INSERT INTO meteo_readings (station_code, observed_at, temperature_c, humidity_pct,
                pressure_hpa, precipitation_mm_h, wind_speed_kmh, wind_gust_kmh, wind_direction_deg)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (station_code, observed_at) DO UPDATE SET
                temperature_c = EXCLUDED.temperature_c,
                humidity_pct = EXCLUDED.humidity_pct,
                pressure_hpa = EXCLUDED.pressure_hpa,
                precipitation_mm_h = EXCLUDED.precipitation_mm_h,
                wind_speed_kmh = EXCLUDED.wind_speed_kmh,
                wind_gust_kmh = EXCLUDED.wind_gust_kmh,
                wind_direction_deg = EXCLUDED.wind_direction_deg",
            &[
                &r.station_code,
                &r.observed_at,
                &r.temperature_c,
                &r.humidity_pct,
                &r.pressure_hpa,
                &r.precipitation_mm_h,
                &r.wind_speed_kmh,
                &r.wind_gust_kmh,
                &r.wind_direction_deg,
            ],
        )?;
        Ok(())
    }

    fn latest_reading_since(
        &self,
        station_code: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<MeteoReading>, StoreError> {
        let query = format!(
            "SELECT {} FROM meteo_readings
             WHERE station_code = $1 AND observed_at >= $2
             ORDER BY observed_at DESC LIMIT 1",
            READING_COLUMNS
        );
        let rows = self.client()?.query(query.as_str(), &[&station_code, &since])?;
        Ok(rows.first().map(reading_from_row))
    }

    fn readings_since(
        &self,
        station_code: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<MeteoReading>, StoreError> {
        let query = format!(
            "SELECT {} FROM meteo_readings
             WHERE station_code = $1 AND observed_at >= $2
             ORDER BY observed_at ASC",
            READING_COLUMNS
        );
        let rows = self.client()?.query(query.as_str(), &[&station_code, &since])?;
        Ok(rows.iter().map(reading_from_row).collect())
    }
}

impl SnapshotStore for PgStore {
    fn upsert_snapshot(&self, snapshot: &MobilitySnapshot) -> Result<(), StoreError> {
        let summary = serde_json::to_value(&snapshot.summary)?;
        self.client()?.execute(
            "INSERT INTO mobility_snapshots (site_id, hour_bucket, collected_at, summary, raw)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (site_id, hour_bucket) DO UPDATE SET
                collected_at = EXCLUDED.collected_at,
                summary = EXCLUDED.summary,
                raw = EXCLUDED.raw",
            &[
                &snapshot.site_id,
                &snapshot.hour_bucket,
                &snapshot.collected_at,
                &summary,
                &snapshot.raw,
            ],
        )?;
        Ok(())
    }

    fn latest_snapshot_since(
        &self,
        site_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<MobilitySnapshot>, StoreError> {
        let rows = self.client()?.query(
            "SELECT site_id, hour_bucket, collected_at, summary, raw
             FROM mobility_snapshots
             WHERE site_id = $1 AND collected_at >= $2
             ORDER BY collected_at DESC LIMIT 1",
            &[&site_id, &since],
        )?;
        rows.first().map(snapshot_from_row).transpose()
    }
}

impl IncidentSource for PgStore {
    fn open_counts(&self, since: DateTime<Utc>) -> Result<IncidentCounts, StoreError> {
        let statuses: Vec<&str> = OPEN_STATUSES.to_vec();
        let rows = self.client()?.query(
            "SELECT priority, COUNT(*) AS n
             FROM incidents
             WHERE opened_at >= $1 AND status = ANY($2)
             GROUP BY priority",
            &[&since, &statuses],
        )?;

        let mut counts = IncidentCounts::default();
        for row in rows {
            let priority: String = row.get("priority");
            let n = u32::try_from(row.get::<_, i64>("n")).unwrap_or(u32::MAX);
            match priority.as_str() {
                "low" => counts.low += n,
                "medium" => counts.medium += n,
                "high" => counts.high += n,
                "critical" => counts.critical += n,
                _ => {}
            }
        }
        Ok(counts)
    }
}

impl StageHistory for PgStore {
    fn append(&self, record: &StageRecord) -> Result<StageRecord, StoreError> {
        let payload = serde_json::to_value(record)?;
        let level = record.level.value() as i16;
        let row = self.client()?.query_one(
            "INSERT INTO stage_records (computed_at, site_id, configuration_id, configuration_version,
                level, combined_level, proximity, requested_by, payload)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING id",
            &[
                &record.computed_at,
                &record.site_id,
                &record.configuration_id,
                &record.configuration_version,
                &level,
                &record.combined_level,
                &record.proximity,
                &record.requested_by,
                &payload,
            ],
        )?;
        let mut stored = record.clone();
        stored.id = Some(row.get("id"));
        Ok(stored)
    }

    fn latest(&self) -> Result<Option<StageRecord>, StoreError> {
        Ok(self.recent(None, 1)?.into_iter().next())
    }

    fn recent(
        &self,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<StageRecord>, StoreError> {
        let rows = self.client()?.query(
            "SELECT id, payload FROM stage_records
             WHERE ($1::timestamptz IS NULL OR computed_at >= $1)
             ORDER BY computed_at DESC, id DESC
             LIMIT $2",
            &[&since, &limit_param(limit)],
        )?;
        records_from_rows(&rows)
    }

    fn by_level(&self, level: Level, limit: usize) -> Result<Vec<StageRecord>, StoreError> {
        let level = level.value() as i16;
        let rows = self.client()?.query(
            "SELECT id, payload FROM stage_records
             WHERE level = $1
             ORDER BY computed_at DESC, id DESC
             LIMIT $2",
            &[&level, &limit_param(limit)],
        )?;
        records_from_rows(&rows)
    }

    fn get(&self, id: i64) -> Result<Option<StageRecord>, StoreError> {
        let rows = self
            .client()?
            .query("SELECT id, payload FROM stage_records WHERE id = $1", &[&id])?;
        rows.first().map(record_from_row).transpose()
    }
}
