/// Mobility group level from the latest traffic snapshot.
///
/// Rules, combined worst-case:
///   1. severe jam count
///   2. accidents (major first; minor only when no major rule fires)
///   3. road closures
///   4. hazard bonus: a busy hazard feed bumps the result by one level

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::alert::stalenesses::{is_stale_at, window_start};
use crate::alert::thresholds::{worst_case, ThresholdSet};
use crate::logging::{self, DataSource};
use crate::model::{FeedSummary, Level, MobilitySnapshot};
use crate::store::SnapshotStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MobilityAssessment {
    pub level: Level,
    /// Level before the hazard bonus.
    pub base_level: Level,
    pub jam_level: Level,
    pub accident_level: Level,
    pub closure_level: Level,
    pub hazard_bonus: bool,
    pub collected_at: Option<DateTime<Utc>>,
    pub hour_bucket: Option<DateTime<Utc>>,
    pub summary: Option<FeedSummary>,
    pub data_available: bool,
    pub reasons: Vec<String>,
    pub reason: String,
}

impl MobilityAssessment {
    pub fn no_recent_data(detail: &str) -> Self {
        MobilityAssessment {
            level: Level::NORMAL,
            base_level: Level::NORMAL,
            jam_level: Level::NORMAL,
            accident_level: Level::NORMAL,
            closure_level: Level::NORMAL,
            hazard_bonus: false,
            collected_at: None,
            hour_bucket: None,
            summary: None,
            data_available: false,
            reasons: Vec::new(),
            reason: format!("no recent data: {}", detail),
        }
    }
}

/// Classifies a snapshot if it was collected within `tolerance_hours` of `now`.
pub fn classify_mobility(
    snapshot: Option<&MobilitySnapshot>,
    thresholds: &ThresholdSet,
    tolerance_hours: i64,
    now: DateTime<Utc>,
) -> MobilityAssessment {
    let max_age_minutes = (tolerance_hours.max(0) as u64) * 60;
    let snapshot = match snapshot {
        Some(s) if !is_stale_at(s.collected_at, max_age_minutes, now) => s,
        Some(_) => {
            return MobilityAssessment::no_recent_data(&format!(
                "last traffic snapshot is older than {}h",
                tolerance_hours
            ));
        }
        None => {
            return MobilityAssessment::no_recent_data(&format!(
                "no traffic snapshot within {}h",
                tolerance_hours
            ));
        }
    };

    let summary = &snapshot.summary;

    let jam = thresholds.severe_jams.candidate(summary.severe_jams as f64, |_| {
        format!("{} severe jams", summary.severe_jams)
    });

    let accident = thresholds
        .major_accidents
        .candidate(summary.major_accidents as f64, |_| {
            format!("{} major accidents", summary.major_accidents)
        })
        .or_else(|| {
            thresholds
                .minor_accidents
                .candidate(summary.minor_accidents as f64, |_| {
                    format!("{} minor accidents", summary.minor_accidents)
                })
        });

    let closure = thresholds.closures.candidate(summary.closures as f64, |_| {
        format!("{} road closures", summary.closures)
    });

    let jam_level = jam.as_ref().map(|c| c.level).unwrap_or(Level::NORMAL);
    let accident_level = accident.as_ref().map(|c| c.level).unwrap_or(Level::NORMAL);
    let closure_level = closure.as_ref().map(|c| c.level).unwrap_or(Level::NORMAL);

    let combined = worst_case(jam.into_iter().chain(accident).chain(closure));
    let base_level = combined.level;
    let mut reasons = combined.reasons;

    let hazard_bonus = summary.hazards >= thresholds.hazard_bonus_at;
    let level = if hazard_bonus {
        reasons.push(format!("{} hazards reported on the road (+1)", summary.hazards));
        base_level.raised_by(1)
    } else {
        base_level
    };

    let reason = if reasons.is_empty() {
        "traffic flowing normally".to_string()
    } else {
        reasons.join("; ")
    };

    MobilityAssessment {
        level,
        base_level,
        jam_level,
        accident_level,
        closure_level,
        hazard_bonus,
        collected_at: Some(snapshot.collected_at),
        hour_bucket: Some(snapshot.hour_bucket),
        summary: Some(summary.clone()),
        data_available: true,
        reasons,
        reason,
    }
}

/// Loads the latest snapshot for `site_id` and classifies it.
///
/// A store failure degrades to level 1 with the error in the reason.
pub fn assess_mobility(
    snapshots: &dyn SnapshotStore,
    site_id: &str,
    thresholds: &ThresholdSet,
    tolerance_hours: i64,
    now: DateTime<Utc>,
) -> MobilityAssessment {
    match snapshots.latest_snapshot_since(site_id, window_start(now, tolerance_hours)) {
        Ok(snapshot) => classify_mobility(snapshot.as_ref(), thresholds, tolerance_hours, now),
        Err(e) => {
            logging::warn(DataSource::Traffic, Some(site_id), &format!("Snapshot lookup failed: {}", e));
            MobilityAssessment::no_recent_data(&format!("snapshot store unavailable ({})", e))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::stalenesses::hour_bucket;
    use chrono::{Duration, TimeZone};

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 15, 0, 0).unwrap()
    }

    fn snapshot(minutes_ago: i64, summary: FeedSummary) -> MobilitySnapshot {
        let collected_at = fixed_now() - Duration::minutes(minutes_ago);
        MobilitySnapshot {
            site_id: "rio".to_string(),
            hour_bucket: hour_bucket(collected_at),
            collected_at,
            summary,
            raw: serde_json::Value::Null,
        }
    }

    fn classify(summary: FeedSummary) -> MobilityAssessment {
        let snap = snapshot(15, summary);
        classify_mobility(Some(&snap), &ThresholdSet::default(), 1, fixed_now())
    }

    #[test]
    fn test_quiet_feed_is_normal() {
        let result = classify(FeedSummary::default());
        assert_eq!(result.level, Level::NORMAL);
        assert!(result.data_available);
        assert_eq!(result.reason, "traffic flowing normally");
    }

    #[test]
    fn test_missing_snapshot_is_normal_with_reason() {
        let result = classify_mobility(None, &ThresholdSet::default(), 1, fixed_now());
        assert_eq!(result.level, Level::NORMAL);
        assert!(result.reason.contains("no recent data"));
    }

    #[test]
    fn test_stale_snapshot_is_ignored() {
        let snap = snapshot(61, FeedSummary { severe_jams: 30, ..Default::default() });
        let result = classify_mobility(Some(&snap), &ThresholdSet::default(), 1, fixed_now());
        assert_eq!(result.level, Level::NORMAL);
        assert!(!result.data_available);
    }

    #[test]
    fn test_severe_jams_table() {
        assert_eq!(classify(FeedSummary { severe_jams: 4, ..Default::default() }).level, Level::NORMAL);
        assert_eq!(classify(FeedSummary { severe_jams: 5, ..Default::default() }).level, Level::MOBILIZATION);
        assert_eq!(classify(FeedSummary { severe_jams: 15, ..Default::default() }).level, Level::ALERT);
        assert_eq!(classify(FeedSummary { severe_jams: 20, ..Default::default() }).level, Level::CRISIS);
    }

    #[test]
    fn test_major_accident_outranks_minor() {
        let result = classify(FeedSummary {
            major_accidents: 1,
            minor_accidents: 6,
            ..Default::default()
        });
        assert_eq!(result.accident_level, Level::ATTENTION);
        assert_eq!(result.reasons, vec!["1 major accidents".to_string()]);
    }

    #[test]
    fn test_minor_accidents_alone() {
        let result = classify(FeedSummary { minor_accidents: 2, ..Default::default() });
        assert_eq!(result.level, Level::MOBILIZATION);
        let result = classify(FeedSummary { minor_accidents: 5, ..Default::default() });
        assert_eq!(result.level, Level::ATTENTION);
    }

    #[test]
    fn test_hazard_bonus_raises_by_one() {
        let result = classify(FeedSummary {
            closures: 1,
            hazards: 10,
            ..Default::default()
        });
        assert_eq!(result.base_level, Level::ATTENTION);
        assert_eq!(result.level, Level::ALERT);
        assert!(result.hazard_bonus);
    }

    #[test]
    fn test_hazard_bonus_is_capped_at_crisis() {
        let result = classify(FeedSummary {
            closures: 5,
            hazards: 12,
            ..Default::default()
        });
        assert_eq!(result.base_level, Level::CRISIS);
        assert_eq!(result.level, Level::CRISIS);
    }

    #[test]
    fn test_hazard_bonus_below_threshold_does_nothing() {
        let result = classify(FeedSummary { hazards: 9, ..Default::default() });
        assert_eq!(result.level, Level::NORMAL);
        assert!(!result.hazard_bonus);
    }
}
