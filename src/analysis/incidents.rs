/// Incident group level from open-incident counts per priority bucket.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::alert::stalenesses::window_start;
use crate::alert::thresholds::{worst_case, Candidate, ThresholdSet};
use crate::logging::{self, DataSource};
use crate::model::{IncidentCounts, Level};
use crate::store::IncidentSource;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncidentAssessment {
    pub level: Level,
    pub counts: IncidentCounts,
    pub total: u32,
    pub window_hours: i64,
    /// `false` when the incident store could not be read.
    pub data_available: bool,
    pub reasons: Vec<String>,
    pub reason: String,
}

/// Any critical incident forces level 5; otherwise each bucket has its own table.
pub fn classify_incidents(
    counts: &IncidentCounts,
    thresholds: &ThresholdSet,
    window_hours: i64,
) -> IncidentAssessment {
    let mut candidates: Vec<Candidate> = Vec::new();

    if counts.critical >= thresholds.critical_override_at.max(1) {
        candidates.push(Candidate::new(
            Level::CRISIS,
            format!("{} critical incident(s) open", counts.critical),
        ));
    }

    let buckets = [
        ("high", counts.high, &thresholds.incidents_high),
        ("medium", counts.medium, &thresholds.incidents_medium),
        ("low", counts.low, &thresholds.incidents_low),
    ];
    for (name, count, table) in buckets {
        if let Some(c) = table.candidate(count as f64, |_| {
            format!("{} {}-priority incidents", count, name)
        }) {
            candidates.push(c);
        }
    }

    let combined = worst_case(candidates);
    let reason = combined.reason_text(&format!(
        "{} open incident(s) in the last {}h, below every threshold",
        counts.total(),
        window_hours
    ));

    IncidentAssessment {
        level: combined.level,
        counts: *counts,
        total: counts.total(),
        window_hours,
        data_available: true,
        reasons: combined.reasons,
        reason,
    }
}

/// Counts open incidents in the window and classifies them.
///
/// An unreachable incident store degrades to level 1.
pub fn assess_incidents(
    source: &dyn IncidentSource,
    thresholds: &ThresholdSet,
    window_hours: i64,
    now: DateTime<Utc>,
) -> IncidentAssessment {
    match source.open_counts(window_start(now, window_hours)) {
        Ok(counts) => classify_incidents(&counts, thresholds, window_hours),
        Err(e) => {
            logging::warn(DataSource::Incidents, None, &format!("Incident count failed: {}", e));
            IncidentAssessment {
                level: Level::NORMAL,
                counts: IncidentCounts::default(),
                total: 0,
                window_hours,
                data_available: false,
                reasons: Vec::new(),
                reason: format!("incident store unavailable ({}); assuming normal", e),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
