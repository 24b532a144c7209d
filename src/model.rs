/// Core data types for the operational stage classification service.
///
/// This module defines the shared domain model imported by all other modules.
/// It holds types only, plus the small invariants that belong to them
/// (level clamping, weight validation, action range checks).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::alert::thresholds::{HeatRules, ThresholdSet, Tolerances};

// ---------------------------------------------------------------------------
// Operational levels
// ---------------------------------------------------------------------------

pub const MIN_LEVEL: u8 = 1;
pub const MAX_LEVEL: u8 = 5;

/// An operational stage, always in `[MIN_LEVEL, MAX_LEVEL]`.
///
/// Raw integers are clamped on the way in (`Level::clamped`, and serde
/// deserialization goes through the same path), so an out-of-range value
/// from a caller or a stored payload can never produce an invalid level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "u8")]
pub struct Level(u8);

impl Level {
    pub const NORMAL: Level = Level(1);
    pub const MOBILIZATION: Level = Level(2);
    pub const ATTENTION: Level = Level(3);
    pub const ALERT: Level = Level(4);
    pub const CRISIS: Level = Level(5);

    /// Clamps any integer into the valid range. Zero and negatives become 1.
    pub fn clamped(raw: i64) -> Level {
        Level(raw.clamp(MIN_LEVEL as i64, MAX_LEVEL as i64) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Raises the level by `steps`, capped at `MAX_LEVEL`.
    pub fn raised_by(self, steps: u8) -> Level {
        Level(self.0.saturating_add(steps).min(MAX_LEVEL))
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            1 => "Normal",
            2 => "Mobilization",
            3 => "Attention",
            4 => "Alert",
            _ => "Crisis",
        }
    }
}

impl Default for Level {
    fn default() -> Self {
        Level::NORMAL
    }
}

impl From<i64> for Level {
    fn from(raw: i64) -> Self {
        Level::clamped(raw)
    }
}

impl From<Level> for u8 {
    fn from(level: Level) -> Self {
        level.0
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{} ({})", self.0, self.name())
    }
}

// ---------------------------------------------------------------------------
// Groups and engine inputs
// ---------------------------------------------------------------------------

/// The four criteria groups combined by the decision engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Group {
    Meteorology,
    Incidents,
    Mobility,
    Events,
}

impl Group {
    pub const ALL: [Group; 4] = [
        Group::Meteorology,
        Group::Incidents,
        Group::Mobility,
        Group::Events,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Group::Meteorology => "Meteorology",
            Group::Incidents => "Incidents",
            Group::Mobility => "Mobility",
            Group::Events => "Events",
        }
    }
}

/// How the caller wants a group's level to be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupInput {
    /// Use this level as-is (already clamped by `Level`).
    Provided(Level),
    /// Run the group's sub-calculator against the most recent stored data.
    Computed,
    /// No value; handled according to the configuration's `AbsentPolicy`.
    Absent,
}

impl GroupInput {
    /// Builds an input from a raw caller value. `None` falls back to `default`.
    pub fn from_raw(raw: Option<i64>, default: GroupInput) -> GroupInput {
        match raw {
            Some(value) => GroupInput::Provided(Level::clamped(value)),
            None => default,
        }
    }
}

/// Where a group level in a stage record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    Provided,
    Computed,
    Absent,
}

/// What to do with a group that has no level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbsentPolicy {
    /// Count the group as level 1 at its full weight.
    #[default]
    TreatAsNormal,
    /// Drop the group from the weighted mean; its weight is redistributed.
    Exclude,
}

// ---------------------------------------------------------------------------
// Configuration ("matrix")
// ---------------------------------------------------------------------------

/// One positive weight per criteria group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupWeights {
    pub meteorology: f64,
    pub incidents: f64,
    pub mobility: f64,
    pub events: f64,
}

impl Default for GroupWeights {
    fn default() -> Self {
        GroupWeights {
            meteorology: 2.0,
            incidents: 2.0,
            mobility: 1.0,
            events: 1.0,
        }
    }
}

impl GroupWeights {
    pub fn weight(&self, group: Group) -> f64 {
        match group {
            Group::Meteorology => self.meteorology,
            Group::Incidents => self.incidents,
            Group::Mobility => self.mobility,
            Group::Events => self.events,
        }
    }

    pub fn total(&self) -> f64 {
        Group::ALL.iter().map(|g| self.weight(*g)).sum()
    }

    /// Every weight must be finite and strictly positive.
    pub fn validate(&self) -> Result<(), String> {
        for group in Group::ALL {
            let w = self.weight(group);
            if !w.is_finite() || w <= 0.0 {
                return Err(format!("{} weight must be positive, got {}", group.label(), w));
            }
        }
        if self.total() <= 0.0 {
            return Err("weights must not sum to zero".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionPriority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureRef {
    pub code: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgencyRef {
    pub acronym: String,
    pub name: String,
}

fn default_true() -> bool {
    true
}

/// An action recommended while the city is within `[min_level, max_level]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendedAction {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub min_level: Level,
    pub max_level: Level,
    pub priority: ActionPriority,
    #[serde(default)]
    pub deadline_hours: Option<u32>,
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub procedure: Option<ProcedureRef>,
    #[serde(default)]
    pub agencies: Vec<AgencyRef>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl RecommendedAction {
    /// Inclusive on both ends.
    pub fn applies_to(&self, level: Level) -> bool {
        self.active && self.min_level <= level && level <= self.max_level
    }
}

/// A versioned decision configuration. Exactly one may be active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub weights: GroupWeights,
    #[serde(default)]
    pub absent_policy: AbsentPolicy,
    #[serde(default)]
    pub thresholds: ThresholdSet,
    #[serde(default)]
    pub heat: HeatRules,
    #[serde(default)]
    pub tolerances: Tolerances,
    #[serde(default)]
    pub actions: Vec<RecommendedAction>,
}

// ---------------------------------------------------------------------------
// Sites, stations and readings
// ---------------------------------------------------------------------------

/// A monitored municipality (the "client" of the platform).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Traffic feed identifier. Missing means mobility cannot be collected.
    #[serde(default)]
    pub feed_id: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// A meteorological station attached to a site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub code: String,
    pub site_id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub distance_km: f64,
    pub principal: bool,
    pub active: bool,
}

/// One timestamped observation, unique per (station, timestamp).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeteoReading {
    pub station_code: String,
    pub observed_at: DateTime<Utc>,
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub pressure_hpa: Option<f64>,
    pub precipitation_mm_h: Option<f64>,
    pub wind_speed_kmh: Option<f64>,
    pub wind_gust_kmh: Option<f64>,
    pub wind_direction_deg: Option<f64>,
}

impl MeteoReading {
    /// The larger of gust and sustained speed, whichever are present.
    pub fn effective_wind_kmh(&self) -> Option<f64> {
        match (self.wind_gust_kmh, self.wind_speed_kmh) {
            (Some(g), Some(s)) => Some(g.max(s)),
            (g, s) => g.or(s),
        }
    }

    /// 16-point compass label for the wind direction.
    pub fn wind_direction_cardinal(&self) -> Option<&'static str> {
        const POINTS: [&str; 16] = [
            "N", "NNE", "NE", "ENE", "E", "ESE", "SE", "SSE",
            "S", "SSW", "SW", "WSW", "W", "WNW", "NW", "NNW",
        ];
        let deg = self.wind_direction_deg?.rem_euclid(360.0);
        let idx = ((deg / 22.5) + 0.5).floor() as usize % 16;
        Some(POINTS[idx])
    }
}

// ---------------------------------------------------------------------------
// Mobility
// ---------------------------------------------------------------------------

/// Aggregated counts extracted from one traffic-feed payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedSummary {
    pub total_jams: u32,
    pub severe_jams: u32,
    pub moderate_jams: u32,
    pub light_jams: u32,
    pub total_alerts: u32,
    pub major_accidents: u32,
    pub minor_accidents: u32,
    pub hazards: u32,
    pub total_irregularities: u32,
    pub closures: u32,
    pub works: u32,
    pub average_speed_kmh: Option<f64>,
    pub average_delay_s: Option<i64>,
    pub total_jam_length_m: f64,
    pub users_on_jams: u32,
    /// Feed records that could not be decoded and were skipped.
    pub skipped_records: u32,
}

/// A per-site snapshot, deduplicated on the hour bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MobilitySnapshot {
    pub site_id: String,
    /// `collected_at` floored to the hour; the deduplication key.
    pub hour_bucket: DateTime<Utc>,
    pub collected_at: DateTime<Utc>,
    pub summary: FeedSummary,
    pub raw: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Incidents
// ---------------------------------------------------------------------------

/// Count of open incidents per priority bucket over a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentCounts {
    pub low: u32,
    pub medium: u32,
    pub high: u32,
    pub critical: u32,
}

impl IncidentCounts {
    pub fn total(&self) -> u32 {
        self.low + self.medium + self.high + self.critical
    }
}

// ---------------------------------------------------------------------------
// Stage computation records
// ---------------------------------------------------------------------------

/// Per-group levels. `None` means the group was excluded from the mean.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupLevels {
    pub meteorology: Option<Level>,
    pub incidents: Option<Level>,
    pub mobility: Option<Level>,
    pub events: Option<Level>,
}

impl GroupLevels {
    pub fn get(&self, group: Group) -> Option<Level> {
        match group {
            Group::Meteorology => self.meteorology,
            Group::Incidents => self.incidents,
            Group::Mobility => self.mobility,
            Group::Events => self.events,
        }
    }

    pub fn set(&mut self, group: Group, level: Option<Level>) {
        match group {
            Group::Meteorology => self.meteorology = level,
            Group::Incidents => self.incidents = level,
            Group::Mobility => self.mobility = level,
            Group::Events => self.events = level,
        }
    }
}

/// Per-group detail payloads (raw readings plus reason text).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupDetails {
    pub meteorology: serde_json::Value,
    pub incidents: serde_json::Value,
    pub mobility: serde_json::Value,
    pub events: serde_json::Value,
}

impl GroupDetails {
    pub fn set(&mut self, group: Group, detail: serde_json::Value) {
        match group {
            Group::Meteorology => self.meteorology = detail,
            Group::Incidents => self.incidents = detail,
            Group::Mobility => self.mobility = detail,
            Group::Events => self.events = detail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub group: Group,
    pub source: InputSource,
    pub level: Option<Level>,
    pub weight: f64,
    /// `level × weight`, or 0 for an excluded group.
    pub contribution: f64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Justification {
    pub contributions: Vec<Contribution>,
    pub weighted_sum: f64,
    pub total_weight: f64,
    pub weighted_mean: f64,
    pub level: Level,
    pub proximity: f64,
    pub text: String,
}

/// Denormalized copy of a recommended action at computation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedAction {
    pub title: String,
    pub description: String,
    pub priority: ActionPriority,
    pub deadline_hours: Option<u32>,
    pub order: u32,
    pub procedure: Option<ProcedureRef>,
    pub agencies: Vec<AgencyRef>,
}

impl From<&RecommendedAction> for SelectedAction {
    fn from(action: &RecommendedAction) -> Self {
        SelectedAction {
            title: action.title.clone(),
            description: action.description.clone(),
            priority: action.priority,
            deadline_hours: action.deadline_hours,
            order: action.order,
            procedure: action.procedure.clone(),
            agencies: action.agencies.clone(),
        }
    }
}

/// Immutable result of one classification call.
///
/// `id` is `None` until the history store assigns one on append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub id: Option<i64>,
    /// Site whose weather and traffic fed the computation.
    #[serde(default)]
    pub site_id: Option<String>,
    pub configuration_id: String,
    pub configuration_version: String,
    pub levels: GroupLevels,
    /// Weighted mean, rounded to 3 decimals.
    pub combined_level: f64,
    pub level: Level,
    /// Fractional part of the weighted mean, rounded to 4 decimals.
    pub proximity: f64,
    pub details: GroupDetails,
    pub justification: Justification,
    pub actions: Vec<SelectedAction>,
    pub requested_by: Option<String>,
    pub computed_at: DateTime<Utc>,
    #[serde(default)]
    pub extras: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors from an upstream data provider (weather API, traffic feed).
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Non-2xx HTTP response.
    HttpError(u16),
    /// The request did not complete within the configured timeout.
    Timeout,
    /// Connection or other transport failure.
    Transport(String),
    /// The response body could not be deserialized.
    ParseError(String),
    /// The weather response had no usable `current` block.
    MissingCurrent,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::HttpError(code) => write!(f, "HTTP error: {}", code),
            ProviderError::Timeout => write!(f, "Request timeout"),
            ProviderError::Transport(msg) => write!(f, "Transport error: {}", msg),
            ProviderError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            ProviderError::MissingCurrent => write!(f, "No data: response has no current conditions"),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if let Some(status) = err.status() {
            ProviderError::HttpError(status.as_u16())
        } else if err.is_decode() {
            ProviderError::ParseError(err.to_string())
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

/// Errors from a persistence adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    Database(String),
    Serialization(String),
    /// The store could not be reached or its lock was poisoned.
    Unavailable(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Database(msg) => write!(f, "Database error: {}", msg),
            StoreError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            StoreError::Unavailable(msg) => write!(f, "Store unavailable: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// The only failures a classification call can surface.
#[derive(Debug, Clone, PartialEq)]
pub enum StageError {
    /// No active configuration, several active, or unusable weights.
    Configuration(String),
    /// The computation record could not be appended to history.
    Store(StoreError),
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            StageError::Store(err) => write!(f, "History write failed: {}", err),
        }
    }
}

impl std::error::Error for StageError {}

impl From<StoreError> for StageError {
    fn from(err: StoreError) -> Self {
        StageError::Store(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_clamps_out_of_range_values() {
        assert_eq!(Level::clamped(0), Level::NORMAL);
        assert_eq!(Level::clamped(-3), Level::NORMAL);
        assert_eq!(Level::clamped(6), Level::CRISIS);
        assert_eq!(Level::clamped(3).value(), 3);
    }

    #[test]
    fn test_level_deserializes_through_clamp() {
        let level: Level = serde_json::from_str("9").expect("integer should deserialize");
        assert_eq!(level, Level::CRISIS);
        let level: Level = serde_json::from_str("0").expect("integer should deserialize");
        assert_eq!(level, Level::NORMAL);
        assert_eq!(serde_json::to_string(&Level::ALERT).unwrap(), "4");
    }

    #[test]
    fn test_raised_by_caps_at_crisis() {
        assert_eq!(Level::ATTENTION.raised_by(1), Level::ALERT);
        assert_eq!(Level::CRISIS.raised_by(1), Level::CRISIS);
    }

    #[test]
    fn test_default_weights_are_valid() {
        let w = GroupWeights::default();
        assert!(w.validate().is_ok());
        assert_eq!(w.total(), 6.0);
    }

    #[test]
    fn test_zero_or_negative_weight_is_rejected() {
        let mut w = GroupWeights::default();
        w.mobility = 0.0;
        assert!(w.validate().is_err(), "zero weight should be rejected");
        w.mobility = -1.0;
        assert!(w.validate().is_err(), "negative weight should be rejected");
        w.mobility = f64::NAN;
        assert!(w.validate().is_err(), "NaN weight should be rejected");
    }

    #[test]
    fn test_effective_wind_prefers_stronger_of_gust_and_speed() {
        let mut reading = MeteoReading {
            station_code: "OPENMETEO_RIO".to_string(),
            observed_at: Utc::now(),
            temperature_c: None,
            humidity_pct: None,
            pressure_hpa: None,
            precipitation_mm_h: None,
            wind_speed_kmh: Some(45.0),
            wind_gust_kmh: Some(30.0),
            wind_direction_deg: Some(350.0),
        };
        assert_eq!(reading.effective_wind_kmh(), Some(45.0));
        reading.wind_speed_kmh = None;
        assert_eq!(reading.effective_wind_kmh(), Some(30.0));
        assert_eq!(reading.wind_direction_cardinal(), Some("N"));
    }

    #[test]
    fn test_action_range_is_inclusive() {
        let action = RecommendedAction {
            title: "ALERT - Field teams".to_string(),
            description: String::new(),
            min_level: Level::ATTENTION,
            max_level: Level::ALERT,
            priority: ActionPriority::High,
            deadline_hours: Some(2),
            order: 1,
            procedure: None,
            agencies: Vec::new(),
            active: true,
        };
        assert!(!action.applies_to(Level::MOBILIZATION));
        assert!(action.applies_to(Level::ATTENTION));
        assert!(action.applies_to(Level::ALERT));
        assert!(!action.applies_to(Level::CRISIS));
    }
}
