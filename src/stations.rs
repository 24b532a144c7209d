/// Weather station registry helpers.
///
/// Every site classifies its weather from exactly one *principal* station.
/// Stations come from the configuration file (with their distance to the
/// site computed here) or are created on the fly: the first successful
/// Open-Meteo collection for a site registers a virtual station at the
/// site's own coordinates and makes it the principal.

use crate::logging::{self, DataSource};
use crate::model::{Site, Station, StoreError};
use crate::store::StationStore;

/// Mean Earth radius used for great-circle distances.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Prefix of the synthetic station codes that hold Open-Meteo readings.
pub const VIRTUAL_STATION_PREFIX: &str = "OPENMETEO_";

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Great-circle distance between two WGS84 points, in km.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();

    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Clamps latitude to [-90, 90] and longitude to [-180, 180].
pub fn clamp_coordinates(latitude: f64, longitude: f64) -> (f64, f64) {
    (latitude.clamp(-90.0, 90.0), longitude.clamp(-180.0, 180.0))
}

/// Distance from a site to a station, rounded to 0.01 km.
pub fn distance_to_site(site: &Site, latitude: f64, longitude: f64) -> f64 {
    let (slat, slon) = clamp_coordinates(site.latitude, site.longitude);
    let (lat, lon) = clamp_coordinates(latitude, longitude);
    (haversine_km(slat, slon, lat, lon) * 100.0).round() / 100.0
}

/// Candidates within `radius_km` of the site, nearest first, at most `max`.
pub fn nearby<'a>(site: &Site, candidates: &'a [Station], radius_km: f64, max: usize) -> Vec<&'a Station> {
    let mut within: Vec<(&Station, f64)> = candidates
        .iter()
        .map(|s| (s, distance_to_site(site, s.latitude, s.longitude)))
        .filter(|(_, d)| *d <= radius_km)
        .collect();
    within.sort_by(|a, b| a.1.total_cmp(&b.1));
    within.into_iter().take(max).map(|(s, _)| s).collect()
}

// ---------------------------------------------------------------------------
// Principal selection
// ---------------------------------------------------------------------------

pub fn virtual_station_code(site_id: &str) -> String {
    format!("{}{}", VIRTUAL_STATION_PREFIX, site_id.to_uppercase())
}

/// Outcome of picking a principal among a site's stations.
#[derive(Debug, Clone, PartialEq)]
pub enum PrincipalChoice {
    /// Exactly one active principal.
    Existing(Station),
    /// No active principal; this is the nearest active station, flagged principal.
    Promoted(Station),
    /// Several active principals; the nearest one is used.
    Ambiguous(Station),
    /// No active station at all.
    NoneActive,
}

pub fn pick_principal(stations: &[Station]) -> PrincipalChoice {
    let nearest = |it: Vec<&Station>| -> Option<Station> {
        it.into_iter()
            .min_by(|a, b| a.distance_km.total_cmp(&b.distance_km))
            .cloned()
    };

    let active: Vec<&Station> = stations.iter().filter(|s| s.active).collect();
    let principals: Vec<&Station> = active.iter().copied().filter(|s| s.principal).collect();

    match principals.len() {
        1 => PrincipalChoice::Existing(principals[0].clone()),
        0 => match nearest(active) {
            Some(mut station) => {
                station.principal = true;
                PrincipalChoice::Promoted(station)
            }
            None => PrincipalChoice::NoneActive,
        },
        _ => match nearest(principals) {
            Some(station) => PrincipalChoice::Ambiguous(station),
            None => PrincipalChoice::NoneActive,
        },
    }
}

/// The site's principal station, promoting (and persisting) the nearest
/// active station when none is flagged.
pub fn resolve_principal(
    store: &dyn StationStore,
    site_id: &str,
) -> Result<Option<Station>, StoreError> {
    let stations = store.stations_for_site(site_id)?;
    match pick_principal(&stations) {
        PrincipalChoice::Existing(station) => Ok(Some(station)),
        PrincipalChoice::Promoted(station) => {
            store.upsert_station(&station)?;
            logging::info(
                DataSource::Meteo,
                Some(site_id),
                &format!("Promoted nearest station {} to principal", station.code),
            );
            Ok(Some(station))
        }
        PrincipalChoice::Ambiguous(station) => {
            logging::warn(
                DataSource::Meteo,
                Some(site_id),
                &format!("Several principal stations; using nearest ({})", station.code),
            );
            Ok(Some(station))
        }
        PrincipalChoice::NoneActive => Ok(None),
    }
}

/// Returns the site's virtual Open-Meteo station, creating it if needed.
///
/// The virtual station always ends up as the site's only active principal:
/// every other principal is demoted, and an existing virtual row that was
/// demoted or deactivated is restored.
pub fn ensure_virtual_station(store: &dyn StationStore, site: &Site) -> Result<Station, StoreError> {
    let code = virtual_station_code(&site.id);
    let stations = store.stations_for_site(&site.id)?;
    let others_principal = stations.iter().any(|s| s.principal && s.code != code);

    let (station, message) = match stations.iter().find(|s| s.code == code) {
        Some(existing) if existing.principal && existing.active && !others_principal => {
            return Ok(existing.clone());
        }
        Some(existing) => {
            let mut restored = existing.clone();
            restored.principal = true;
            restored.active = true;
            (restored, format!("Restored virtual station {} as principal", code))
        }
        None => {
            let (latitude, longitude) = clamp_coordinates(site.latitude, site.longitude);
            let created = Station {
                code: code.clone(),
                site_id: site.id.clone(),
                name: format!("Open-Meteo - {}", site.name),
                latitude,
                longitude,
                distance_km: 0.0,
                principal: true,
                active: true,
            };
            (created, format!("Registered virtual station {}", code))
        }
    };
    store.upsert_station(&station)?;

    for other in stations.iter().filter(|s| s.principal && s.code != code) {
        let mut demoted = other.clone();
        demoted.principal = false;
        store.upsert_station(&demoted)?;
    }

    logging::info(DataSource::Meteo, Some(&site.id), &message);
    Ok(station)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
