/// Persistence seams.
///
/// The sub-calculators and the decision engine only see these traits. Two
/// adapters implement them: `MemoryStore` here (tests and `--memory` dry
/// runs) and `db::PgStore` for PostgreSQL. All methods take `&self`; each
/// adapter does its own locking.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::model::{
    Configuration, IncidentCounts, Level, MeteoReading, MobilitySnapshot, StageRecord, Station,
    StoreError,
};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

pub trait StationStore {
    /// All stations for a site, principal first, then by distance.
    fn stations_for_site(&self, site_id: &str) -> Result<Vec<Station>, StoreError>;
    /// Insert or replace by station code.
    fn upsert_station(&self, station: &Station) -> Result<(), StoreError>;
}

pub trait ReadingStore {
    /// Insert or replace by (station, timestamp).
    fn upsert_reading(&self, reading: &MeteoReading) -> Result<(), StoreError>;
    /// Newest reading observed at or after `since`.
    fn latest_reading_since(
        &self,
        station_code: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<MeteoReading>, StoreError>;
    /// Readings observed at or after `since`, oldest first.
    fn readings_since(
        &self,
        station_code: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<MeteoReading>, StoreError>;
}

pub trait SnapshotStore {
    /// Insert or replace by (site, hour bucket).
    fn upsert_snapshot(&self, snapshot: &MobilitySnapshot) -> Result<(), StoreError>;
    /// Newest snapshot collected at or after `since`.
    fn latest_snapshot_since(
        &self,
        site_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<MobilitySnapshot>, StoreError>;
}

/// Read-only view of the external incident store.
pub trait IncidentSource {
    /// Open (open, in progress, waiting) incidents opened at or after `since`.
    fn open_counts(&self, since: DateTime<Utc>) -> Result<IncidentCounts, StoreError>;
}

/// Insert-only history of stage computations.
pub trait StageHistory {
    /// Appends a record and returns it with its assigned id.
    fn append(&self, record: &StageRecord) -> Result<StageRecord, StoreError>;
    fn latest(&self) -> Result<Option<StageRecord>, StoreError>;
    /// Newest first, optionally bounded below by `since`.
    fn recent(
        &self,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<StageRecord>, StoreError>;
    fn by_level(&self, level: Level, limit: usize) -> Result<Vec<StageRecord>, StoreError>;
    fn get(&self, id: i64) -> Result<Option<StageRecord>, StoreError>;
}

/// Source of decision configurations. The engine requires exactly one active.
pub trait ConfigurationRepository {
    fn active_configurations(&self) -> Result<Vec<Configuration>, StoreError>;
}

impl ConfigurationRepository for Vec<Configuration> {
    fn active_configurations(&self) -> Result<Vec<Configuration>, StoreError> {
        Ok(self.iter().filter(|c| c.active).cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// In-memory adapter
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    stations: BTreeMap<String, Station>,
    readings: BTreeMap<(String, DateTime<Utc>), MeteoReading>,
    snapshots: BTreeMap<(String, DateTime<Utc>), MobilitySnapshot>,
    incidents: Vec<(DateTime<Utc>, IncidentCounts)>,
    history: Vec<StageRecord>,
}

/// Process-local store. Open incidents are recorded directly as counts
/// tagged with their opening time, since there is no incident ticketing in
/// this service.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    pub fn record_incidents(&self, opened_at: DateTime<Utc>, counts: IncidentCounts) -> Result<(), StoreError> {
        self.lock()?.incidents.push((opened_at, counts));
        Ok(())
    }

    pub fn reading_count(&self) -> usize {
        self.lock().map(|s| s.readings.len()).unwrap_or(0)
    }

    pub fn snapshot_count(&self) -> usize {
        self.lock().map(|s| s.snapshots.len()).unwrap_or(0)
    }
}

impl StationStore for MemoryStore {
    fn stations_for_site(&self, site_id: &str) -> Result<Vec<Station>, StoreError> {
        let state = self.lock()?;
        let mut stations: Vec<Station> = state
            .stations
            .values()
            .filter(|s| s.site_id == site_id)
            .cloned()
            .collect();
        stations.sort_by(|a, b| {
            b.principal
                .cmp(&a.principal)
                .then(a.distance_km.total_cmp(&b.distance_km))
        });
        Ok(stations)
    }

    fn upsert_station(&self, station: &Station) -> Result<(), StoreError> {
        self.lock()?.stations.insert(station.code.clone(), station.clone());
        Ok(())
    }
}

impl ReadingStore for MemoryStore {
    fn upsert_reading(&self, reading: &MeteoReading) -> Result<(), StoreError> {
        let key = (reading.station_code.clone(), reading.observed_at);
        self.lock()?.readings.insert(key, reading.clone());
        Ok(())
    }

    fn latest_reading_since(
        &self,
        station_code: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<MeteoReading>, StoreError> {
        Ok(self.readings_since(station_code, since)?.pop())
    }

    fn readings_since(
        &self,
        station_code: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<MeteoReading>, StoreError> {
        let state = self.lock()?;
        // Keys sort by (station, time), so this is already oldest first
        Ok(state
            .readings
            .values()
            .filter(|r| r.station_code == station_code && r.observed_at >= since)
            .cloned()
            .collect())
    }
}

impl SnapshotStore for MemoryStore {
    fn upsert_snapshot(&self, snapshot: &MobilitySnapshot) -> Result<(), StoreError> {
        let key = (snapshot.site_id.clone(), snapshot.hour_bucket);
        self.lock()?.snapshots.insert(key, snapshot.clone());
        Ok(())
    }

    fn latest_snapshot_since(
        &self,
        site_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<MobilitySnapshot>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .snapshots
            .values()
            .filter(|s| s.site_id == site_id && s.collected_at >= since)
            .max_by_key(|s| s.collected_at)
            .cloned())
    }
}

impl IncidentSource for MemoryStore {
    fn open_counts(&self, since: DateTime<Utc>) -> Result<IncidentCounts, StoreError> {
        let state = self.lock()?;
        let mut total = IncidentCounts::default();
        for (_, counts) in state.incidents.iter().filter(|(opened_at, _)| *opened_at >= since) {
            total.low += counts.low;
            total.medium += counts.medium;
            total.high += counts.high;
            total.critical += counts.critical;
        }
        Ok(total)
    }
}

impl StageHistory for MemoryStore {
    fn append(&self, record: &StageRecord) -> Result<StageRecord, StoreError> {
        let mut state = self.lock()?;
        let mut stored = record.clone();
        stored.id = Some(state.history.len() as i64 + 1);
        state.history.push(stored.clone());
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
        let state = self.lock()?;
        let mut records: Vec<StageRecord> = state
            .history
            .iter()
            .filter(|r| since.is_none_or(|s| r.computed_at >= s))
            .cloned()
            .collect();
        // Newest first; ids break ties between records computed at the same instant
        records.sort_by(|a, b| b.computed_at.cmp(&a.computed_at).then(b.id.cmp(&a.id)));
        records.truncate(limit);
        Ok(records)
    }

    fn by_level(&self, level: Level, limit: usize) -> Result<Vec<StageRecord>, StoreError> {
        Ok(self
            .recent(None, usize::MAX)?
            .into_iter()
            .filter(|r| r.level == level)
            .take(limit)
            .collect())
    }

    fn get(&self, id: i64) -> Result<Option<StageRecord>, StoreError> {
        Ok(self.lock()?.history.iter().find(|r| r.id == Some(id)).cloned())
    }
}
