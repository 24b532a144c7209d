/// Decision engine: combines group levels into the city's operational stage.
///
/// ```text
///   level_i ∈ [1,5], weight_i > 0, over included groups
///   mean      = Σ(level_i × weight_i) / Σ(weight_i)
///   level     = floor(mean + 0.5), clamped to [1,5]
///   proximity = mean − floor(mean), or 0 at level 5
/// ```
///
/// Every call appends one immutable `StageRecord` to the history and returns
/// it. Only configuration problems and history write failures are errors;
/// every data problem inside a group degrades that group to level 1 with a
/// reason.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::analysis::incidents::assess_incidents;
use crate::analysis::mobility::{assess_mobility, MobilityAssessment};
use crate::analysis::weather::{assess_weather, WeatherAssessment};
use crate::logging::{self, DataSource};
use crate::model::{
    AbsentPolicy, Configuration, Contribution, Group, GroupDetails, GroupInput, GroupLevels,
    InputSource, Justification, Level, SelectedAction, StageError, StageRecord, MAX_LEVEL,
    MIN_LEVEL,
};
use crate::store::{
    ConfigurationRepository, IncidentSource, ReadingStore, SnapshotStore, StageHistory,
    StationStore,
};

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// The stores the engine reads from and appends to.
#[derive(Clone, Copy)]
pub struct Sources<'a> {
    pub stations: &'a dyn StationStore,
    pub readings: &'a dyn ReadingStore,
    pub snapshots: &'a dyn SnapshotStore,
    pub incidents: &'a dyn IncidentSource,
    pub history: &'a dyn StageHistory,
}

impl<'a> Sources<'a> {
    /// All sources backed by one adapter.
    pub fn from_store<S>(store: &'a S) -> Self
    where
        S: StationStore + ReadingStore + SnapshotStore + IncidentSource + StageHistory,
    {
        Sources {
            stations: store,
            readings: store,
            snapshots: store,
            incidents: store,
            history: store,
        }
    }
}

/// One classification call.
#[derive(Debug, Clone, PartialEq)]
pub struct StageRequest {
    /// Site for the weather and mobility sub-calculators. Without one, those
    /// groups fall back to level 1 when computed.
    pub site_id: Option<String>,
    pub meteorology: GroupInput,
    pub incidents: GroupInput,
    pub mobility: GroupInput,
    pub events: GroupInput,
    pub requested_by: Option<String>,
    pub extras: Value,
}

impl StageRequest {
    /// Computes every group that has a sub-calculator; events are absent.
    pub fn computed(site_id: &str) -> Self {
        StageRequest {
            site_id: Some(site_id.to_string()),
            meteorology: GroupInput::Computed,
            incidents: GroupInput::Computed,
            mobility: GroupInput::Computed,
            events: GroupInput::Absent,
            requested_by: None,
            extras: Value::Null,
        }
    }

    /// Every group supplied by the caller.
    pub fn provided(meteorology: i64, incidents: i64, mobility: i64, events: i64) -> Self {
        StageRequest {
            site_id: None,
            meteorology: GroupInput::Provided(Level::clamped(meteorology)),
            incidents: GroupInput::Provided(Level::clamped(incidents)),
            mobility: GroupInput::Provided(Level::clamped(mobility)),
            events: GroupInput::Provided(Level::clamped(events)),
            requested_by: None,
            extras: Value::Null,
        }
    }

    pub fn with_input(mut self, group: Group, input: GroupInput) -> Self {
        match group {
            Group::Meteorology => self.meteorology = input,
            Group::Incidents => self.incidents = input,
            Group::Mobility => self.mobility = input,
            Group::Events => self.events = input,
        }
        self
    }

    pub fn requested_by(mut self, user: &str) -> Self {
        self.requested_by = Some(user.to_string());
        self
    }

    pub fn with_extras(mut self, extras: Value) -> Self {
        self.extras = extras;
        self
    }

    pub fn input(&self, group: Group) -> GroupInput {
        match group {
            Group::Meteorology => self.meteorology,
            Group::Incidents => self.incidents,
            Group::Mobility => self.mobility,
            Group::Events => self.events,
        }
    }
}

// ---------------------------------------------------------------------------
// Weighted combination
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Combination {
    pub weighted_sum: f64,
    pub total_weight: f64,
    pub mean: f64,
    pub level: Level,
    pub proximity: f64,
}

/// Round half up, then clamp. 2.5 → 3, 2.4999 → 2.
pub fn round_level(mean: f64) -> Level {
    if !mean.is_finite() {
        return Level::NORMAL;
    }
    Level::clamped((mean + 0.5).floor() as i64)
}

/// Combines `(level, weight)` pairs; `None` levels are excluded from both sums.
///
/// With nothing included the mean is 1.0.
pub fn combine(inputs: &[(Option<Level>, f64)]) -> Combination {
    let (weighted_sum, total_weight) = inputs
        .iter()
        .filter_map(|(level, weight)| level.map(|l| (l.value() as f64 * weight, *weight)))
        .fold((0.0, 0.0), |(s, w), (ls, lw)| (s + ls, w + lw));

    let mean = if total_weight > 0.0 {
        (weighted_sum / total_weight).clamp(MIN_LEVEL as f64, MAX_LEVEL as f64)
    } else {
        MIN_LEVEL as f64
    };

    let level = round_level(mean);
    let proximity = if level == Level::CRISIS { 0.0 } else { mean - mean.floor() };

    Combination {
        weighted_sum,
        total_weight,
        mean,
        level,
        proximity,
    }
}

fn round_to(v: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (v * factor).round() / factor
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageStatistics {
    pub since: DateTime<Utc>,
    pub count: usize,
    pub mean_level: Option<f64>,
    pub min_level: Option<Level>,
    pub max_level: Option<Level>,
    /// Records per level, index 0 is level 1.
    pub per_level: [usize; 5],
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// A group after input resolution.
struct Resolved {
    source: InputSource,
    level: Option<Level>,
    reason: String,
    detail: Value,
}

pub struct DecisionEngine<'a> {
    configurations: &'a dyn ConfigurationRepository,
    sources: Sources<'a>,
}

impl<'a> DecisionEngine<'a> {
    pub fn new(configurations: &'a dyn ConfigurationRepository, sources: Sources<'a>) -> Self {
        DecisionEngine { configurations, sources }
    }

    /// The single active configuration, with usable weights, threshold
    /// tables and heat bands.
    pub fn active_configuration(&self) -> Result<Configuration, StageError> {
        let mut active = self.configurations.active_configurations().map_err(|e| {
            StageError::Configuration(format!("configuration repository unavailable: {}", e))
        })?;

        let config = match active.len() {
            0 => return Err(StageError::Configuration("no active configuration".to_string())),
            1 => active.remove(0),
            n => {
                let ids: Vec<String> = active.iter().map(|c| format!("{} v{}", c.id, c.version)).collect();
                return Err(StageError::Configuration(format!(
                    "{} active configurations ({}); exactly one is required",
                    n,
                    ids.join(", ")
                )));
            }
        };

        let invalid = |e: String| StageError::Configuration(format!("{} v{}: {}", config.id, config.version, e));
        config.weights.validate().map_err(invalid)?;
        config.thresholds.validate().map_err(invalid)?;
        config.heat.validate().map_err(invalid)?;
        Ok(config)
    }

    /// Classify the city and append the record to the history.
    pub fn classify(
        &self,
        request: &StageRequest,
        now: DateTime<Utc>,
    ) -> Result<StageRecord, StageError> {
        // Fail fast before touching any data source
        let config = self.active_configuration()?;

        let mut levels = GroupLevels::default();
        let mut details = GroupDetails::default();
        let mut contributions = Vec::with_capacity(Group::ALL.len());
        let mut inputs = Vec::with_capacity(Group::ALL.len());

        for group in Group::ALL {
            let resolved = self.resolve(group, request, &config, now);
            let weight = config.weights.weight(group);

            levels.set(group, resolved.level);
            details.set(group, resolved.detail);
            inputs.push((resolved.level, weight));
            contributions.push(Contribution {
                group,
                source: resolved.source,
                level: resolved.level,
                weight,
                contribution: resolved.level.map(|l| l.value() as f64 * weight).unwrap_or(0.0),
                reason: resolved.reason,
            });
        }

        let combination = combine(&inputs);

        let mut applicable: Vec<_> = config
            .actions
            .iter()
            .filter(|a| a.applies_to(combination.level))
            .collect();
        applicable.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.title.cmp(&b.title)));
        let actions: Vec<SelectedAction> = applicable.into_iter().map(SelectedAction::from).collect();

        let text = justification_text(&config, &contributions, &combination, actions.len());

        let record = StageRecord {
            id: None,
            site_id: request.site_id.clone(),
            configuration_id: config.id.clone(),
            configuration_version: config.version.clone(),
            levels,
            combined_level: round_to(combination.mean, 3),
            level: combination.level,
            proximity: round_to(combination.proximity, 4),
            details,
            justification: Justification {
                contributions,
                weighted_sum: combination.weighted_sum,
                total_weight: combination.total_weight,
                weighted_mean: combination.mean,
                level: combination.level,
                proximity: combination.proximity,
                text,
            },
            actions,
            requested_by: request.requested_by.clone(),
            computed_at: now,
            extras: request.extras.clone(),
        };

        let stored = self.sources.history.append(&record)?;

        logging::info(
            DataSource::Engine,
            request.site_id.as_deref(),
            &format!(
                "City level {} (mean {:.3}) - record #{} - by {}",
                stored.level,
                stored.combined_level,
                stored.id.unwrap_or_default(),
                stored.requested_by.as_deref().unwrap_or("system")
            ),
        );
        Ok(stored)
    }

    fn resolve(
        &self,
        group: Group,
        request: &StageRequest,
        config: &Configuration,
        now: DateTime<Utc>,
    ) -> Resolved {
        match request.input(group) {
            GroupInput::Provided(level) => Resolved {
                source: InputSource::Provided,
                level: Some(level),
                reason: "provided by caller".to_string(),
                detail: json!({ "level": level, "source": "provided" }),
            },
            // No sub-calculator for events
            GroupInput::Computed if group == Group::Events => absent(config.absent_policy),
            GroupInput::Computed => self.compute(group, request.site_id.as_deref(), config, now),
            GroupInput::Absent => absent(config.absent_policy),
        }
    }

    fn compute(
        &self,
        group: Group,
        site_id: Option<&str>,
        config: &Configuration,
        now: DateTime<Utc>,
    ) -> Resolved {
        let (level, reason, detail) = match group {
            Group::Meteorology => {
                let assessment = match site_id {
                    Some(site) => assess_weather(self.sources.stations, self.sources.readings, site, config, now),
                    None => WeatherAssessment::no_recent_data(None, "no site given"),
                };
                (assessment.level, assessment.reason.clone(), to_detail(&assessment))
            }
            Group::Mobility => {
                let tolerance = config.tolerances.mobility_hours;
                let assessment = match site_id {
                    Some(site) => assess_mobility(self.sources.snapshots, site, &config.thresholds, tolerance, now),
                    None => MobilityAssessment::no_recent_data("no site given"),
                };
                (assessment.level, assessment.reason.clone(), to_detail(&assessment))
            }
            Group::Incidents => {
                let assessment = assess_incidents(
                    self.sources.incidents,
                    &config.thresholds,
                    config.tolerances.incident_window_hours,
                    now,
                );
                (assessment.level, assessment.reason.clone(), to_detail(&assessment))
            }
            Group::Events => return absent(config.absent_policy),
        };

        Resolved {
            source: InputSource::Computed,
            level: Some(level),
            reason,
            detail,
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn latest(&self) -> Result<Option<StageRecord>, StageError> {
        Ok(self.sources.history.latest()?)
    }

    /// Records computed at or after `since`, newest first.
    pub fn history(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<StageRecord>, StageError> {
        Ok(self.sources.history.recent(Some(since), limit)?)
    }

    pub fn by_level(&self, level: Level, limit: usize) -> Result<Vec<StageRecord>, StageError> {
        Ok(self.sources.history.by_level(level, limit)?)
    }

    pub fn record(&self, id: i64) -> Result<Option<StageRecord>, StageError> {
        Ok(self.sources.history.get(id)?)
    }

    pub fn statistics(&self, since: DateTime<Utc>) -> Result<StageStatistics, StageError> {
        let records = self.sources.history.recent(Some(since), usize::MAX)?;
        Ok(statistics_of(&records, since))
    }
}

fn absent(policy: AbsentPolicy) -> Resolved {
    match policy {
        AbsentPolicy::TreatAsNormal => Resolved {
            source: InputSource::Absent,
            level: Some(Level::NORMAL),
            reason: "no input; counted as normal".to_string(),
            detail: json!({ "level": 1, "source": "absent" }),
        },
        AbsentPolicy::Exclude => Resolved {
            source: InputSource::Absent,
            level: None,
            reason: "no input; excluded from the mean".to_string(),
            detail: json!({ "level": null, "source": "absent" }),
        },
    }
}

fn to_detail<T: Serialize>(assessment: &T) -> Value {
    serde_json::to_value(assessment).unwrap_or_else(|e| {
        logging::warn(DataSource::Engine, None, &format!("Detail serialization failed: {}", e));
        Value::Null
    })
}

pub fn statistics_of(records: &[StageRecord], since: DateTime<Utc>) -> StageStatistics {
    let mut per_level = [0usize; 5];
    for r in records {
        per_level[(r.level.value() - MIN_LEVEL) as usize] += 1;
    }
    let count = records.len();
    let mean_level = if count > 0 {
        let sum: f64 = records.iter().map(|r| r.level.value() as f64).sum();
        Some(round_to(sum / count as f64, 2))
    } else {
        None
    };
    StageStatistics {
        since,
        count,
        mean_level,
        min_level: records.iter().map(|r| r.level).min(),
        max_level: records.iter().map(|r| r.level).max(),
        per_level,
    }
}

fn justification_text(
    config: &Configuration,
    contributions: &[Contribution],
    combination: &Combination,
    action_count: usize,
) -> String {
    let mut lines = vec![
        format!("Operational stage computation - configuration {} v{}", config.id, config.version),
        String::new(),
    ];

    for c in contributions {
        let source = match c.source {
            InputSource::Provided => "provided",
            InputSource::Computed => "computed",
            InputSource::Absent => "absent",
        };
        let line = match c.level {
            Some(level) => format!(
                "{:<12} level {} x weight {:.2} = {:.2}  [{}] {}",
                c.group.label(),
                level.value(),
                c.weight,
                c.contribution,
                source,
                c.reason
            ),
            None => format!(
                "{:<12} excluded (weight {:.2})  [{}] {}",
                c.group.label(),
                c.weight,
                source,
                c.reason
            ),
        };
        lines.push(line);
    }

    lines.push(String::new());
    lines.push(format!(
        "Weighted sum {:.2} / total weight {:.2} = mean {:.3}",
        combination.weighted_sum, combination.total_weight, combination.mean
    ));
    lines.push(format!(
        "City level: {}, proximity to next level {:.1}%",
        combination.level,
        combination.proximity * 100.0
    ));
    lines.push(format!("{} recommended action(s)", action_count));
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActionPriority, GroupWeights, RecommendedAction};
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 15, 0, 0).unwrap()
    }

    fn config() -> Configuration {
        Configuration {
            id: "cor-default".to_string(),
            version: "2025.1".to_string(),
            name: "Default matrix".to_string(),
            active: true,
            weights: GroupWeights::default(),
            absent_policy: AbsentPolicy::TreatAsNormal,
            thresholds: Default::default(),
            heat: Default::default(),
            tolerances: Default::default(),
            actions: vec![
                action("Monitor", 1, 2, 2),
                action("Notify agencies", 2, 3, 1),
                action("Activate crisis room", 4, 5, 1),
            ],
        }
    }

    fn action(title: &str, min: i64, max: i64, order: u32) -> RecommendedAction {
        RecommendedAction {
            title: title.to_string(),
            description: String::new(),
            min_level: Level::clamped(min),
            max_level: Level::clamped(max),
            priority: ActionPriority::Medium,
            deadline_hours: None,
            order,
            procedure: None,
            agencies: Vec::new(),
            active: true,
        }
    }

    #[test]
    fn test_round_level_is_half_up() {
        assert_eq!(round_level(2.5), Level::ATTENTION);
        assert_eq!(round_level(2.4999), Level::MOBILIZATION);
        assert_eq!(round_level(1.0), Level::NORMAL);
        assert_eq!(round_level(4.5), Level::CRISIS);
        assert_eq!(round_level(f64::NAN), Level::NORMAL);
    }

    #[test]
    fn test_combine_default_weights() {
        let c = combine(&[
            (Some(Level::ATTENTION), 2.0),
            (Some(Level::NORMAL), 2.0),
            (Some(Level::NORMAL), 1.0),
            (Some(Level::NORMAL), 1.0),
        ]);
        assert!((c.mean - 10.0 / 6.0).abs() < 1e-12);
        assert_eq!(c.level, Level::MOBILIZATION);
        assert!((c.proximity - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_combine_excludes_none_and_redistributes() {
        let c = combine(&[(Some(Level::ALERT), 2.0), (None, 2.0), (Some(Level::MOBILIZATION), 1.0)]);
        assert_eq!(c.total_weight, 3.0);
        assert!((c.mean - 10.0 / 3.0).abs() < 1e-12);
        assert_eq!(c.level, Level::ATTENTION);
    }

    #[test]
    fn test_combine_nothing_included_is_one() {
        let c = combine(&[(None, 2.0), (None, 1.0)]);
        assert_eq!(c.mean, 1.0);
        assert_eq!(c.level, Level::NORMAL);
        assert_eq!(c.proximity, 0.0);
    }

    #[test]
    fn test_proximity_is_zero_at_crisis() {
        let c = combine(&[(Some(Level::CRISIS), 1.0)]);
        assert_eq!(c.level, Level::CRISIS);
        assert_eq!(c.proximity, 0.0);
    }

    #[test]
    fn test_no_active_configuration_fails_fast() {
        let store = MemoryStore::new();
        let mut inactive = config();
        inactive.active = false;
        let repo = vec![inactive];
        let engine = DecisionEngine::new(&repo, Sources::from_store(&store));
        let err = engine.classify(&StageRequest::provided(3, 1, 1, 1), fixed_now()).unwrap_err();
        assert!(matches!(err, StageError::Configuration(_)));
        assert!(store.latest().unwrap().is_none());
    }

    #[test]
    fn test_two_active_configurations_fail() {
        let store = MemoryStore::new();
        let mut second = config();
        second.version = "2025.2".to_string();
        let repo = vec![config(), second];
        let engine = DecisionEngine::new(&repo, Sources::from_store(&store));
        match engine.classify(&StageRequest::provided(1, 1, 1, 1), fixed_now()) {
            Err(StageError::Configuration(msg)) => assert!(msg.contains("2 active")),
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_weight_fails() {
        let store = MemoryStore::new();
        let mut bad = config();
        bad.weights.events = 0.0;
        let repo = vec![bad];
        let engine = DecisionEngine::new(&repo, Sources::from_store(&store));
        assert!(matches!(
            engine.classify(&StageRequest::provided(1, 1, 1, 1), fixed_now()),
            Err(StageError::Configuration(_))
        ));
    }

    #[test]
    fn test_unsorted_threshold_table_fails() {
        let store = MemoryStore::new();
        let mut bad = config();
        bad.thresholds.rain_mm_h = serde_json::from_value(json!([
            { "at": 30.0, "level": 5 },
            { "at": 5.0, "level": 2 }
        ]))
        .unwrap();
        let repo = vec![bad];
        let engine = DecisionEngine::new(&repo, Sources::from_store(&store));
        match engine.classify(&StageRequest::computed("rio"), fixed_now()) {
            Err(StageError::Configuration(msg)) => assert!(msg.contains("rain_mm_h"), "{}", msg),
            other => panic!("expected configuration error, got {:?}", other),
        }
        assert!(store.latest().unwrap().is_none());
    }

    #[test]
    fn test_inverted_heat_bands_fail() {
        let store = MemoryStore::new();
        let mut bad = config();
        bad.heat.elevated_c = 45.0;
        let repo = vec![bad];
        let engine = DecisionEngine::new(&repo, Sources::from_store(&store));
        assert!(matches!(
            engine.classify(&StageRequest::provided(1, 1, 1, 1), fixed_now()),
            Err(StageError::Configuration(_))
        ));
    }

    #[test]
    fn test_actions_selected_by_inclusive_range_and_order() {
        let store = MemoryStore::new();
        let repo = vec![config()];
        let engine = DecisionEngine::new(&repo, Sources::from_store(&store));
        let record = engine.classify(&StageRequest::provided(3, 1, 1, 1), fixed_now()).unwrap();
        assert_eq!(record.level, Level::MOBILIZATION);
        let titles: Vec<&str> = record.actions.iter().map(|a| a.title.as_str()).collect();
        assert_eq!(titles, vec!["Notify agencies", "Monitor"]);
    }

    #[test]
    fn test_computed_events_behave_as_absent() {
        let store = MemoryStore::new();
        let mut excluding = config();
        excluding.absent_policy = AbsentPolicy::Exclude;
        let repo = vec![excluding];
        let engine = DecisionEngine::new(&repo, Sources::from_store(&store));
        let request = StageRequest::provided(5, 5, 5, 1).with_input(Group::Events, GroupInput::Computed);
        let record = engine.classify(&request, fixed_now()).unwrap();
        assert_eq!(record.levels.events, None);
        assert_eq!(record.level, Level::CRISIS);
        assert_eq!(record.justification.total_weight, 5.0);
    }

    #[test]
    fn test_justification_lists_every_group() {
        let store = MemoryStore::new();
        let repo = vec![config()];
        let engine = DecisionEngine::new(&repo, Sources::from_store(&store));
        let record = engine.classify(&StageRequest::provided(3, 1, 1, 1), fixed_now()).unwrap();
        for group in Group::ALL {
            assert!(record.justification.text.contains(group.label()));
        }
        assert!(record.justification.text.contains("mean 1.667"));
        assert_eq!(record.justification.contributions[0].contribution, 6.0);
    }

    #[test]
    fn test_statistics_over_records() {
        let store = MemoryStore::new();
        let repo = vec![config()];
        let engine = DecisionEngine::new(&repo, Sources::from_store(&store));
        engine.classify(&StageRequest::provided(1, 1, 1, 1), fixed_now()).unwrap();
        engine.classify(&StageRequest::provided(5, 5, 5, 5), fixed_now()).unwrap();
        let stats = engine.statistics(fixed_now() - chrono::Duration::hours(24)).unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.mean_level, Some(3.0));
        assert_eq!(stats.min_level, Some(Level::NORMAL));
        assert_eq!(stats.max_level, Some(Level::CRISIS));
        assert_eq!(stats.per_level, [1, 0, 0, 0, 1]);
    }
}
