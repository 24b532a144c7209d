//! Threshold tables and the worst-case combinator.
//!
//! Every sub-calculator turns a raw measurement (mm/h, km/h, a count) into a
//! level by scanning an ascending `(cutoff, level)` table from the top, and
//! then combines its independent rules by taking the maximum. Both pieces
//! live here so the boundary semantics are defined exactly once:
//!
//!   value >= cutoff  →  rule fires at that step's level
//!   value <  lowest  →  no rule fires (level 1)

use serde::{Deserialize, Serialize};

use crate::model::Level;

// ---------------------------------------------------------------------------
// Threshold tables
// ---------------------------------------------------------------------------

/// One step of a threshold table. Inclusive: `value >= at` fires.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub at: f64,
    pub level: Level,
}

/// An ordered list of steps, ascending by cutoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThresholdTable {
    steps: Vec<Step>,
}

impl ThresholdTable {
    /// Builds a table from `(cutoff, level)` pairs. Pairs are sorted by cutoff.
    pub fn new(pairs: &[(f64, i64)]) -> Self {
        let mut steps: Vec<Step> = pairs
            .iter()
            .map(|&(at, level)| Step { at, level: Level::clamped(level) })
            .collect();
        steps.sort_by(|a, b| a.at.total_cmp(&b.at));
        ThresholdTable { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Highest step whose cutoff is at or below `value`.
    ///
    /// NaN never fires.
    pub fn evaluate(&self, value: f64) -> Option<Step> {
        self.steps.iter().rev().find(|s| value >= s.at).copied()
    }

    pub fn level_for(&self, value: f64) -> Level {
        self.evaluate(value).map(|s| s.level).unwrap_or(Level::NORMAL)
    }

    /// Evaluates the table and, if a step fires, describes it as a candidate.
    pub fn candidate<F>(&self, value: f64, describe: F) -> Option<Candidate>
    where
        F: FnOnce(Step) -> String,
    {
        self.evaluate(value).map(|step| Candidate::new(step.level, describe(step)))
    }

    /// Cutoffs must be finite and strictly ascending; levels must not decrease.
    pub fn validate(&self) -> Result<(), String> {
        for pair in self.steps.windows(2) {
            if pair[1].at <= pair[0].at {
                return Err(format!(
                    "cutoffs must be strictly ascending ({} then {})",
                    pair[0].at, pair[1].at
                ));
            }
            if pair[1].level < pair[0].level {
                return Err(format!(
                    "levels must not decrease (cutoff {} maps below cutoff {})",
                    pair[1].at, pair[0].at
                ));
            }
        }
        if let Some(bad) = self.steps.iter().find(|s| !s.at.is_finite()) {
            return Err(format!("cutoff {} is not finite", bad.at));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Worst-case combinator
// ---------------------------------------------------------------------------

/// A level proposed by one rule, with the audit text explaining it.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub level: Level,
    pub reason: String,
}

impl Candidate {
    pub fn new(level: Level, reason: impl Into<String>) -> Self {
        Candidate { level, reason: reason.into() }
    }
}

/// Result of combining candidates: the maximum level plus every fired reason.
#[derive(Debug, Clone, PartialEq)]
pub struct WorstCase {
    pub level: Level,
    pub reasons: Vec<String>,
}

impl WorstCase {
    /// Reasons joined for display, or `fallback` when nothing fired.
    pub fn reason_text(&self, fallback: &str) -> String {
        if self.reasons.is_empty() {
            fallback.to_string()
        } else {
            self.reasons.join("; ")
        }
    }
}

/// Takes the maximum level across candidates.
///
/// Candidates at level 1 did not fire and contribute no reason. Reason order
/// follows candidate order, so the audit text lists rules as evaluated.
pub fn worst_case<I>(candidates: I) -> WorstCase
where
    I: IntoIterator<Item = Candidate>,
{
    let mut level = Level::NORMAL;
    let mut reasons = Vec::new();
    for candidate in candidates {
        if candidate.level > Level::NORMAL {
            reasons.push(candidate.reason);
        }
        level = level.max(candidate.level);
    }
    WorstCase { level, reasons }
}

// ---------------------------------------------------------------------------
// Per-configuration tables
// ---------------------------------------------------------------------------

/// All threshold tables used by the sub-calculators.
///
/// Fields missing from a configuration file keep their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdSet {
    /// Hourly precipitation, mm/h.
    pub rain_mm_h: ThresholdTable,
    /// max(gust, sustained), km/h.
    pub wind_kmh: ThresholdTable,
    pub severe_jams: ThresholdTable,
    pub major_accidents: ThresholdTable,
    pub minor_accidents: ThresholdTable,
    pub closures: ThresholdTable,
    /// Hazard count at which the mobility level is bumped by one.
    pub hazard_bonus_at: u32,
    pub incidents_high: ThresholdTable,
    pub incidents_medium: ThresholdTable,
    pub incidents_low: ThresholdTable,
    /// Critical incident count that forces level 5.
    pub critical_override_at: u32,
}

impl Default for ThresholdSet {
    fn default() -> Self {
        ThresholdSet {
            rain_mm_h: ThresholdTable::new(&[(5.0, 2), (10.0, 3), (20.0, 4), (30.0, 5)]),
            wind_kmh: ThresholdTable::new(&[(40.0, 2), (50.0, 3), (70.0, 4), (90.0, 5)]),
            severe_jams: ThresholdTable::new(&[(5.0, 2), (10.0, 3), (15.0, 4), (20.0, 5)]),
            major_accidents: ThresholdTable::new(&[(1.0, 3), (2.0, 4), (4.0, 5)]),
            minor_accidents: ThresholdTable::new(&[(2.0, 2), (5.0, 3)]),
            closures: ThresholdTable::new(&[(1.0, 3), (3.0, 4), (5.0, 5)]),
            hazard_bonus_at: 10,
            incidents_high: ThresholdTable::new(&[(2.0, 2), (3.0, 3), (5.0, 4), (7.0, 5)]),
            incidents_medium: ThresholdTable::new(&[(8.0, 2), (10.0, 3), (15.0, 4), (20.0, 5)]),
            incidents_low: ThresholdTable::new(&[(15.0, 2), (20.0, 3), (30.0, 4), (40.0, 5)]),
            critical_override_at: 1,
        }
    }
}

impl ThresholdSet {
    pub fn validate(&self) -> Result<(), String> {
        let tables = [
            ("rain_mm_h", &self.rain_mm_h),
            ("wind_kmh", &self.wind_kmh),
            ("severe_jams", &self.severe_jams),
            ("major_accidents", &self.major_accidents),
            ("minor_accidents", &self.minor_accidents),
            ("closures", &self.closures),
            ("incidents_high", &self.incidents_high),
            ("incidents_medium", &self.incidents_medium),
            ("incidents_low", &self.incidents_low),
        ];
        for (name, table) in tables {
            table.validate().map_err(|e| format!("{}: {}", name, e))?;
        }
        Ok(())
    }
}

/// Heat-index bands (°C) and the sample counts each band needs to fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatRules {
    pub elevated_c: f64,
    pub high_c: f64,
    pub extreme_c: f64,
    pub extreme_samples: u32,
    pub high_samples: u32,
    pub persistent_samples: u32,
    pub elevated_samples: u32,
}

impl Default for HeatRules {
    fn default() -> Self {
        HeatRules {
            elevated_c: 36.0,
            high_c: 40.0,
            extreme_c: 44.0,
            extreme_samples: 2,
            high_samples: 2,
            persistent_samples: 6,
            elevated_samples: 4,
        }
    }
}

impl HeatRules {
    /// Bands must be finite and strictly ascending: elevated < high < extreme.
    pub fn validate(&self) -> Result<(), String> {
        let bands = [
            ("elevated_c", self.elevated_c),
            ("high_c", self.high_c),
            ("extreme_c", self.extreme_c),
        ];
        if let Some((name, v)) = bands.iter().find(|(_, v)| !v.is_finite()) {
            return Err(format!("heat band {} = {} is not finite", name, v));
        }
        for pair in bands.windows(2) {
            if pair[1].1 <= pair[0].1 {
                return Err(format!(
                    "heat bands must be strictly ascending ({} = {} then {} = {})",
                    pair[0].0, pair[0].1, pair[1].0, pair[1].1
                ));
            }
        }
        Ok(())
    }
}

/// Staleness and look-back windows, in hours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerances {
    pub weather_hours: i64,
    pub heat_window_hours: i64,
    pub mobility_hours: i64,
    pub incident_window_hours: i64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Tolerances {
            weather_hours: 3,
            heat_window_hours: 6,
            mobility_hours: 1,
            incident_window_hours: 24,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
