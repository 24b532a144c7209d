/// Service configuration file (`stagemon.toml`).
///
/// One file holds everything the binary needs: logging and provider
/// settings, the monitored sites with their weather stations, and the
/// versioned decision configurations the engine chooses from.
///
/// ```toml
/// [service]
/// log_level = "info"
///
/// [[sites]]
/// id = "rio"
/// name = "Rio de Janeiro"
/// latitude = -22.9068
/// longitude = -43.1729
/// feed_id = "18577882871"
///
/// [[configurations]]
/// id = "cor-default"
/// version = "2025.1"
/// active = true
/// ```

use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::logging::LogLevel;
use crate::model::{Configuration, Site, Station, StoreError};
use crate::stations::{clamp_coordinates, distance_to_site};
use crate::store::ConfigurationRepository;

pub const DEFAULT_CONFIG_PATH: &str = "stagemon.toml";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The file could not be read.
    Io(String),
    /// The file is not valid TOML for this schema.
    Parse(String),
    /// The file parsed but violates a rule (duplicate ids, bad tables, ...).
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "Config read error: {}", msg),
            ConfigError::Parse(msg) => write!(f, "Config parse error: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub log_level: String,
    pub log_file: Option<String>,
    pub console_timestamps: bool,
    /// Environment variable holding the PostgreSQL connection string.
    pub database_url_env: String,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        ServiceSettings {
            log_level: "info".to_string(),
            log_file: None,
            console_timestamps: true,
            database_url_env: "DATABASE_URL".to_string(),
        }
    }
}

impl ServiceSettings {
    pub fn min_log_level(&self) -> Result<LogLevel, ConfigError> {
        self.log_level.parse().map_err(ConfigError::Invalid)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub open_meteo_url: String,
    pub weather_timeout_secs: u64,
    pub waze_url: String,
    pub traffic_timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        ProviderSettings {
            open_meteo_url: crate::ingest::open_meteo::OPEN_METEO_BASE_URL.to_string(),
            weather_timeout_secs: 15,
            waze_url: crate::ingest::waze::WAZE_BASE_URL.to_string(),
            traffic_timeout_secs: 20,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct StationConfig {
    pub code: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub principal: bool,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub feed_id: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub stations: Vec<StationConfig>,
}

impl SiteConfig {
    /// The site with coordinates clamped to valid ranges.
    pub fn site(&self) -> Site {
        let (latitude, longitude) = clamp_coordinates(self.latitude, self.longitude);
        Site {
            id: self.id.clone(),
            name: self.name.clone(),
            latitude,
            longitude,
            feed_id: self.feed_id.clone().filter(|f| !f.trim().is_empty()),
            active: self.active,
        }
    }

    /// Configured stations with their distance to the site filled in.
    pub fn stations(&self) -> Vec<Station> {
        let site = self.site();
        self.stations
            .iter()
            .map(|s| {
                let (latitude, longitude) = clamp_coordinates(s.latitude, s.longitude);
                Station {
                    code: s.code.clone(),
                    site_id: site.id.clone(),
                    name: s.name.clone(),
                    latitude,
                    longitude,
                    distance_km: distance_to_site(&site, latitude, longitude),
                    principal: s.principal,
                    active: s.active,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub service: ServiceSettings,
    pub providers: ProviderSettings,
    pub sites: Vec<SiteConfig>,
    pub configurations: Vec<Configuration>,
}

impl ServiceConfig {
    pub fn site(&self, id: &str) -> Option<&SiteConfig> {
        self.sites.iter().find(|s| s.id == id)
    }

    pub fn active_sites(&self) -> impl Iterator<Item = &SiteConfig> {
        self.sites.iter().filter(|s| s.active)
    }
}

impl ConfigurationRepository for ServiceConfig {
    fn active_configurations(&self) -> Result<Vec<Configuration>, StoreError> {
        self.configurations.active_configurations()
    }
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

/// Read, parse and validate a configuration file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ServiceConfig, ConfigError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
    parse_config(&text)
}

pub fn parse_config(text: &str) -> Result<ServiceConfig, ConfigError> {
    let config: ServiceConfig =
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &ServiceConfig) -> Result<(), ConfigError> {
    config.service.min_log_level()?;

    let mut site_ids = HashSet::new();
    for site in &config.sites {
        if site.id.trim().is_empty() {
            return Err(ConfigError::Invalid("site with empty id".to_string()));
        }
        if !site_ids.insert(site.id.as_str()) {
            return Err(ConfigError::Invalid(format!("duplicate site id '{}'", site.id)));
        }
        let principals = site.stations.iter().filter(|s| s.principal && s.active).count();
        if principals > 1 {
            return Err(ConfigError::Invalid(format!(
                "site '{}' has {} principal stations; at most one is allowed",
                site.id, principals
            )));
        }
        let mut codes = HashSet::new();
        for station in &site.stations {
            if !codes.insert(station.code.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "site '{}': duplicate station code '{}'",
                    site.id, station.code
                )));
            }
        }
    }

    let mut keys = HashSet::new();
    for c in &config.configurations {
        let label = format!("configuration '{}' v{}", c.id, c.version);
        if !keys.insert((c.id.as_str(), c.version.as_str())) {
            return Err(ConfigError::Invalid(format!("duplicate {}", label)));
        }
        c.weights
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("{}: {}", label, e)))?;
        c.thresholds
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("{}: {}", label, e)))?;
        c.heat
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("{}: {}", label, e)))?;
        let t = &c.tolerances;
        if t.weather_hours < 0 || t.heat_window_hours < 0 || t.mobility_hours < 0 || t.incident_window_hours < 0 {
            return Err(ConfigError::Invalid(format!("{}: tolerances must not be negative", label)));
        }
        for action in &c.actions {
            if action.min_level > action.max_level {
                return Err(ConfigError::Invalid(format!(
                    "{}: action '{}' has min level {} above max level {}",
                    label,
                    action.title,
                    action.min_level.value(),
                    action.max_level.value()
                )));
            }
        }
    }

    let active = config.configurations.iter().filter(|c| c.active).count();
    if active > 1 {
        return Err(ConfigError::Invalid(format!(
            "{} configurations are marked active; exactly one may be",
            active
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AbsentPolicy, Level};

    const SAMPLE: &str = r#"
        [service]
        log_level = "debug"

        [providers]
        weather_timeout_secs = 10

        [[sites]]
        id = "rio"
        name = "Rio de Janeiro"
        latitude = -22.9068
        longitude = -43.1729
        feed_id = "18577882871"

        [[sites.stations]]
        code = "A652"
        name = "Forte de Copacabana"
        latitude = -22.9883
        longitude = -43.1903
        principal = true

        [[configurations]]
        id = "cor-default"
        version = "2025.1"
        active = true
        absent_policy = "exclude"

        [configurations.weights]
        meteorology = 3.0
        incidents = 2.0
        mobility = 1.0
        events = 1.0

        [[configurations.actions]]
        title = "ALERT - Activate crisis room"
        min_level = 4
        max_level = 5
        priority = "critical"
        deadline_hours = 1
        order = 1
    "#;

    #[test]
    fn test_sample_parses_with_defaults() {
        let config = parse_config(SAMPLE).expect("sample should be valid");
        assert_eq!(config.service.min_log_level().unwrap(), LogLevel::Debug);
        assert_eq!(config.providers.weather_timeout_secs, 10);
        assert_eq!(config.providers.traffic_timeout_secs, 20);

        let c = &config.configurations[0];
        assert_eq!(c.absent_policy, AbsentPolicy::Exclude);
        assert_eq!(c.weights.meteorology, 3.0);
        assert_eq!(c.tolerances.weather_hours, 3);
        assert_eq!(c.actions[0].min_level, Level::ALERT);
        assert!(c.actions[0].active);
    }

    #[test]
    fn test_station_distance_is_computed() {
        let config = parse_config(SAMPLE).unwrap();
        let stations = config.site("rio").unwrap().stations();
        assert_eq!(stations.len(), 1);
        assert!(stations[0].distance_km > 5.0 && stations[0].distance_km < 15.0);
        assert_eq!(stations[0].site_id, "rio");
    }

    #[test]
    fn test_repository_returns_active_only() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.active_configurations().unwrap().len(), 1);
    }

    #[test]
    fn test_two_principal_stations_rejected() {
        let text = SAMPLE.replace(
            "[[configurations]]",
            "[[sites.stations]]\ncode = \"B\"\nname = \"B\"\nlatitude = 0.0\nlongitude = 0.0\nprincipal = true\n\n[[configurations]]",
        );
        assert!(matches!(parse_config(&text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_weight_rejected() {
        let text = SAMPLE.replace("mobility = 1.0", "mobility = 0.0");
        assert!(matches!(parse_config(&text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_inverted_heat_bands_rejected() {
        let text = SAMPLE.replace(
            "[configurations.weights]",
            "[configurations.heat]\nelevated_c = 42.0\nhigh_c = 40.0\n\n[configurations.weights]",
        );
        match parse_config(&text) {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("heat bands"), "{}", msg),
            other => panic!("expected invalid config, got {:?}", other),
        }
    }

    #[test]
    fn test_inverted_action_range_rejected() {
        let text = SAMPLE.replace("min_level = 4", "min_level = 5").replace("max_level = 5", "max_level = 3");
        assert!(matches!(parse_config(&text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        assert!(matches!(parse_config("[[sites]\nid ="), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(load_config("/nonexistent/stagemon.toml"), Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_blank_feed_id_is_none() {
        let text = SAMPLE.replace("feed_id = \"18577882871\"", "feed_id = \"  \"");
        let config = parse_config(&text).unwrap();
        assert_eq!(config.site("rio").unwrap().site().feed_id, None);
    }
}
