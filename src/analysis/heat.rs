/// Heat-index sub-level.
///
/// Rain and wind are instantaneous hazards; heat is a persistence hazard.
/// A single hot hour is not a heat wave, so the level here is driven by how
/// many hourly samples in the look-back window fall into each heat-index band.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::alert::thresholds::HeatRules;
use crate::model::{Level, MeteoReading};

/// Below this air temperature the regression is not meaningful and the
/// apparent temperature is taken to be the air temperature.
pub const REGRESSION_FLOOR_C: f64 = 27.0;

/// Number of most recent samples returned as a series for charting.
pub const SERIES_LEN: usize = 12;

// ---------------------------------------------------------------------------
// Heat index formula
// ---------------------------------------------------------------------------

/// Apparent temperature in °C from air temperature (°C) and relative humidity (%).
///
/// NOAA Rothfusz regression, evaluated in °F, with the low-humidity
/// (RH < 13 %, 80–112 °F) and high-humidity (RH > 85 %, 80–87 °F) adjustments.
pub fn heat_index_c(temp_c: f64, humidity_pct: f64) -> f64 {
    if temp_c < REGRESSION_FLOOR_C {
        return temp_c;
    }

    let t = temp_c * 9.0 / 5.0 + 32.0;
    let rh = humidity_pct.clamp(0.0, 100.0);

    let mut hi = -42.379 + 2.04901523 * t + 10.14333127 * rh
        - 0.22475541 * t * rh
        - 6.83783e-3 * t * t
        - 5.481717e-2 * rh * rh
        + 1.22874e-3 * t * t * rh
        + 8.5282e-4 * t * rh * rh
        - 1.99e-6 * t * t * rh * rh;

    if rh < 13.0 && (80.0..=112.0).contains(&t) {
        hi -= ((13.0 - rh) / 4.0) * ((17.0 - (t - 95.0).abs()) / 17.0).sqrt();
    } else if rh > 85.0 && (80.0..=87.0).contains(&t) {
        hi += ((rh - 85.0) / 10.0) * ((87.0 - t) / 5.0);
    }

    (hi - 32.0) * 5.0 / 9.0
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ---------------------------------------------------------------------------
// Assessment
// ---------------------------------------------------------------------------

/// One point of the heat series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatSample {
    pub observed_at: DateTime<Utc>,
    pub temperature_c: f64,
    pub humidity_pct: f64,
    pub heat_index_c: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatAssessment {
    pub level: Level,
    pub max_index_c: Option<f64>,
    pub mean_index_c: Option<f64>,
    pub max_temperature_c: Option<f64>,
    pub mean_temperature_c: Option<f64>,
    pub mean_humidity_pct: Option<f64>,
    pub samples: usize,
    /// Samples in `[elevated_c, high_c)`.
    pub hours_elevated: usize,
    /// Samples in `[high_c, extreme_c)`.
    pub hours_high: usize,
    /// Samples at or above `extreme_c`.
    pub hours_extreme: usize,
    pub reason: String,
    /// Most recent samples first, at most `SERIES_LEN`.
    pub series: Vec<HeatSample>,
}

impl HeatAssessment {
    fn no_data(reason: &str) -> Self {
        HeatAssessment {
            level: Level::NORMAL,
            max_index_c: None,
            mean_index_c: None,
            max_temperature_c: None,
            mean_temperature_c: None,
            mean_humidity_pct: None,
            samples: 0,
            hours_elevated: 0,
            hours_high: 0,
            hours_extreme: 0,
            reason: reason.to_string(),
            series: Vec::new(),
        }
    }
}

/// Classifies heat stress from readings observed at or after `since`.
///
/// Readings without both temperature and humidity are ignored. Each sample
/// stands for roughly one hour of hourly collection. Index values are
/// rounded to 0.1 °C before banding, matching the published series.
pub fn classify_heat(
    readings: &[MeteoReading],
    rules: &HeatRules,
    since: DateTime<Utc>,
) -> HeatAssessment {
    let mut samples: Vec<HeatSample> = readings
        .iter()
        .filter(|r| r.observed_at >= since)
        .filter_map(|r| match (r.temperature_c, r.humidity_pct) {
            (Some(t), Some(h)) if t.is_finite() && h.is_finite() => Some(HeatSample {
                observed_at: r.observed_at,
                temperature_c: round1(t),
                humidity_pct: round1(h),
                heat_index_c: round1(heat_index_c(t, h)),
            }),
            _ => None,
        })
        .collect();

    if samples.is_empty() {
        return HeatAssessment::no_data("no recent temperature/humidity data");
    }

    samples.sort_by(|a, b| b.observed_at.cmp(&a.observed_at));

    let n = samples.len() as f64;
    let max_index = samples.iter().map(|s| s.heat_index_c).fold(f64::MIN, f64::max);
    let mean_index = samples.iter().map(|s| s.heat_index_c).sum::<f64>() / n;
    let max_temp = samples.iter().map(|s| s.temperature_c).fold(f64::MIN, f64::max);
    let mean_temp = samples.iter().map(|s| s.temperature_c).sum::<f64>() / n;
    let mean_humidity = samples.iter().map(|s| s.humidity_pct).sum::<f64>() / n;

    let band = |lo: f64, hi: f64| {
        samples
            .iter()
            .filter(|s| s.heat_index_c >= lo && s.heat_index_c < hi)
            .count()
    };
    let hours_elevated = band(rules.elevated_c, rules.high_c);
    let hours_high = band(rules.high_c, rules.extreme_c);
    let hours_extreme = band(rules.extreme_c, f64::INFINITY);

    // Severity order: the first rule that fires wins.
    let (level, reason) = if hours_extreme >= rules.extreme_samples as usize {
        (
            Level::CRISIS,
            format!(
                "extreme heat: index at or above {:.0}°C for {}h (max {:.1}°C)",
                rules.extreme_c, hours_extreme, max_index
            ),
        )
    } else if hours_high >= rules.high_samples as usize {
        (
            Level::ALERT,
            format!(
                "heat wave: index {:.0}-{:.0}°C for {}h (max {:.1}°C)",
                rules.high_c, rules.extreme_c, hours_high, max_index
            ),
        )
    } else if hours_elevated >= rules.persistent_samples as usize {
        (
            Level::ATTENTION,
            format!(
                "persistent heat: index {:.0}-{:.0}°C for {}h (max {:.1}°C)",
                rules.elevated_c, rules.high_c, hours_elevated, max_index
            ),
        )
    } else if hours_elevated >= rules.elevated_samples as usize {
        (
            Level::MOBILIZATION,
            format!(
                "elevated heat: index {:.0}-{:.0}°C for {}h (max {:.1}°C)",
                rules.elevated_c, rules.high_c, hours_elevated, max_index
            ),
        )
    } else if max_index >= rules.elevated_c {
        (
            Level::MOBILIZATION,
            format!("isolated heat peak: index {:.1}°C, not yet persistent", max_index),
        )
    } else {
        (Level::NORMAL, format!("normal temperatures (max index {:.1}°C)", max_index))
    };

    let count = samples.len();
    samples.truncate(SERIES_LEN);

    HeatAssessment {
        level,
        max_index_c: Some(max_index),
        mean_index_c: Some(round1(mean_index)),
        max_temperature_c: Some(max_temp),
        mean_temperature_c: Some(round1(mean_temp)),
        mean_humidity_pct: Some(round1(mean_humidity)),
        samples: count,
        hours_elevated,
        hours_high,
        hours_extreme,
        reason,
        series: samples,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
