/// Waze partner-hub traffic feed (TVT) client and summarizer
///
/// The TVT feed has no separate `jams` array. Congestion shows up as
/// `irregularities` of type DYNAMIC and as a per-route `jamLevel`; accidents
/// and hazards are `alerts`; closures and road works are other irregularity
/// types. `summarize_feed` reduces one payload to the counts the mobility
/// rules read.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::logging::{self, DataSource};
use crate::model::{FeedSummary, ProviderError};

pub const WAZE_BASE_URL: &str = "https://www.waze.com/row-partnerhub-api";

/// Delay thresholds (% over historic travel time) for DYNAMIC segments.
pub const SEVERE_DELAY_PCT: f64 = 50.0;
pub const MODERATE_DELAY_PCT: f64 = 20.0;

// ============================================================================
// Feed record structures
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Irregularity {
    #[serde(rename = "type", default)]
    kind: String,
    time: Option<f64>,
    historic_time: Option<f64>,
    length: Option<f64>,
    #[serde(default)]
    sub_routes: Vec<SubRoute>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubRoute {
    jam_level: Option<i64>,
    from_name: Option<String>,
    to_name: Option<String>,
    length: Option<f64>,
    time: Option<f64>,
    historic_time: Option<f64>,
    lead_alert: Option<LeadAlert>,
}

#[derive(Debug, Deserialize)]
struct LeadAlert {
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Route {
    jam_level: Option<i64>,
    name: Option<String>,
    from_name: Option<String>,
    to_name: Option<String>,
    length: Option<f64>,
    time: Option<f64>,
    historic_time: Option<f64>,
    #[serde(default)]
    sub_routes: Vec<SubRoute>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Alert {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    subtype: String,
    report_rating: Option<f64>,
    reliability: Option<f64>,
}

impl Alert {
    fn is_major_accident(&self) -> bool {
        self.subtype.contains("MAJOR")
            || self.report_rating.unwrap_or(0.0) >= 4.0
            || self.reliability.unwrap_or(0.0) >= 8.0
    }
}

// ============================================================================
// API Client Functions
// ============================================================================

/// Fetch the raw TVT feed for `feed_id`.
pub fn fetch_feed(
    client: &reqwest::blocking::Client,
    base_url: &str,
    feed_id: &str,
) -> Result<Value, ProviderError> {
    let url = format!("{}/feeds-tvt/?id={}", base_url.trim_end_matches('/'), feed_id);

    let response = client
        .get(&url)
        .header("Accept", "application/json")
        .header("Referer", "https://www.waze.com/live-map")
        .send()?;

    if !response.status().is_success() {
        return Err(ProviderError::HttpError(response.status().as_u16()));
    }

    let body = response.text()?;
    parse_feed(&body)
}

/// Parse a feed body. The top level must be a JSON object.
pub fn parse_feed(body: &str) -> Result<Value, ProviderError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| ProviderError::ParseError(format!("traffic feed: {}", e)))?;
    if !value.is_object() {
        return Err(ProviderError::ParseError(
            "traffic feed: top level is not an object".to_string(),
        ));
    }
    Ok(value)
}

// ============================================================================
// Summarizing
// ============================================================================

/// Decodes `data[key]` element by element. Elements that fail to decode are
/// counted in `skipped` and logged; a missing or non-array key is empty.
fn decode_records<T: DeserializeOwned>(data: &Value, key: &str, skipped: &mut u32) -> Vec<T> {
    let Some(items) = data.get(key).and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut records = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        match T::deserialize(item) {
            Ok(record) => records.push(record),
            Err(e) => {
                *skipped += 1;
                logging::warn(
                    DataSource::Traffic,
                    None,
                    &format!("Skipping malformed {} record #{}: {}", key, i, e),
                );
            }
        }
    }
    records
}

/// Sums `field` over an array of objects, or reads a scalar directly.
fn aggregate(value: Option<&Value>, field: &str) -> f64 {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.get(field).and_then(Value::as_f64))
            .sum(),
        Some(v) => v.as_f64().unwrap_or(0.0),
        None => 0.0,
    }
}

fn delay_pct(time: f64, historic: f64) -> f64 {
    (time - historic) / historic * 100.0
}

/// Reduce one TVT payload to the counts used by the mobility rules.
pub fn summarize_feed(data: &Value) -> FeedSummary {
    let mut summary = FeedSummary::default();
    let mut skipped = 0u32;

    let irregularities: Vec<Irregularity> = decode_records(data, "irregularities", &mut skipped);
    let routes: Vec<Route> = decode_records(data, "routes", &mut skipped);
    let alerts: Vec<Alert> = decode_records(data, "alerts", &mut skipped);

    // DYNAMIC irregularities are the live congestion segments
    let dynamic: Vec<&Irregularity> = irregularities.iter().filter(|i| i.kind == "DYNAMIC").collect();

    for segment in &dynamic {
        let historic = segment.historic_time.unwrap_or(0.0);
        let time = segment.time.unwrap_or(historic);
        if historic > 0.0 {
            let pct = delay_pct(time, historic);
            if pct >= SEVERE_DELAY_PCT {
                summary.severe_jams += 1;
            } else if pct >= MODERATE_DELAY_PCT {
                summary.moderate_jams += 1;
            } else {
                summary.light_jams += 1;
            }
        }
    }

    for route in &routes {
        let level = route.jam_level.unwrap_or(0);
        if level >= 4 {
            summary.severe_jams += 1;
        } else if level >= 2 {
            summary.moderate_jams += 1;
        }
    }

    summary.total_jams = dynamic.len() as u32;

    let dynamic_length: f64 = dynamic.iter().map(|s| s.length.unwrap_or(0.0)).sum();

    let speeds: Vec<f64> = dynamic
        .iter()
        .filter_map(|s| match (s.length, s.time) {
            (Some(len), Some(t)) if len > 0.0 && t > 0.0 => Some(len / t * 3.6),
            _ => None,
        })
        .collect();
    if !speeds.is_empty() {
        let mean = speeds.iter().sum::<f64>() / speeds.len() as f64;
        summary.average_speed_kmh = Some((mean * 100.0).round() / 100.0);
    }

    let delays: Vec<f64> = dynamic
        .iter()
        .filter_map(|s| match (s.time, s.historic_time) {
            (Some(t), Some(h)) if t > 0.0 && h > 0.0 => Some(t - h),
            _ => None,
        })
        .collect();
    if !delays.is_empty() {
        summary.average_delay_s = Some((delays.iter().sum::<f64>() / delays.len() as f64) as i64);
    }

    summary.total_alerts = alerts.len() as u32;
    for alert in &alerts {
        match alert.kind.as_str() {
            "ACCIDENT" if alert.is_major_accident() => summary.major_accidents += 1,
            "ACCIDENT" => summary.minor_accidents += 1,
            "HAZARD" | "WEATHERHAZARD" => summary.hazards += 1,
            _ => {}
        }
    }

    summary.total_irregularities = irregularities.len() as u32;
    for irregularity in &irregularities {
        match irregularity.kind.as_str() {
            "ROAD_CLOSED" => summary.closures += 1,
            "STATIC"
                if irregularity.sub_routes.iter().any(|s| {
                    s.lead_alert.as_ref().is_some_and(|a| a.kind == "ROAD_CLOSED")
                }) =>
            {
                summary.closures += 1
            }
            "CONSTRUCTION" => summary.works += 1,
            _ => {}
        }
    }

    // The feed's own aggregate wins when it is present and positive
    let feed_length = aggregate(data.get("lengthOfJams"), "jamLength");
    summary.total_jam_length_m = if feed_length > 0.0 { feed_length } else { dynamic_length };
    summary.users_on_jams = aggregate(data.get("usersOnJams"), "wazersCount").max(0.0) as u32;

    summary.skipped_records = skipped;
    summary
}

// ============================================================================
// Congested roads
// ============================================================================

/// A route or sub-route at or above a jam level, for display.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CongestedRoad {
    pub name: String,
    pub from: String,
    pub to: String,
    pub jam_level: i64,
    pub length_m: f64,
    pub historic_time_s: f64,
    pub current_time_s: f64,
    pub delay_pct: f64,
}

/// Routes and sub-routes with `jamLevel >= min_jam_level`, worst first
/// (by level, then by delay).
pub fn congested_roads(data: &Value, min_jam_level: i64) -> Vec<CongestedRoad> {
    let mut skipped = 0u32;
    let routes: Vec<Route> = decode_records(data, "routes", &mut skipped);

    let make = |name: String, from: &Option<String>, to: &Option<String>, level: i64,
                length: Option<f64>, time: Option<f64>, historic: Option<f64>| {
        let historic = historic.unwrap_or(0.0);
        let time = time.unwrap_or(0.0);
        let pct = if historic > 0.0 { delay_pct(time, historic) } else { 0.0 };
        CongestedRoad {
            name,
            from: from.clone().unwrap_or_default(),
            to: to.clone().unwrap_or_default(),
            jam_level: level,
            length_m: length.unwrap_or(0.0),
            historic_time_s: historic,
            current_time_s: time,
            delay_pct: (pct * 10.0).round() / 10.0,
        }
    };

    let mut roads = Vec::new();
    for route in &routes {
        let level = route.jam_level.unwrap_or(0);
        if level >= min_jam_level {
            let name = route.name.clone().unwrap_or_else(|| "Unnamed road".to_string());
            roads.push(make(name, &route.from_name, &route.to_name, level,
                            route.length, route.time, route.historic_time));
        }
    }
    for route in &routes {
        for sub in &route.sub_routes {
            let level = sub.jam_level.unwrap_or(0);
            if level >= min_jam_level {
                let name = format!(
                    "{} -> {}",
                    sub.from_name.as_deref().unwrap_or(""),
                    sub.to_name.as_deref().unwrap_or("")
                );
                roads.push(make(name, &sub.from_name, &sub.to_name, level,
                                sub.length, sub.time, sub.historic_time));
            }
        }
    }

    roads.sort_by(|a, b| {
        b.jam_level
            .cmp(&a.jam_level)
            .then(b.delay_pct.total_cmp(&a.delay_pct))
    });
    roads
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_feed() -> Value {
        json!({
            "routes": [
                { "name": "Av. Brasil", "jamLevel": 4, "time": 900, "historicTime": 300, "length": 5000,
                  "subRoutes": [ { "fromName": "Penha", "toName": "Caju", "jamLevel": 3,
                                   "time": 400, "historicTime": 200, "length": 2000 } ] },
                { "name": "Linha Amarela", "jamLevel": 2 },
                { "name": "Aterro", "jamLevel": 0 }
            ],
            "irregularities": [
                { "type": "DYNAMIC", "time": 300, "historicTime": 150, "length": 1000 },
                { "type": "DYNAMIC", "time": 130, "historicTime": 100, "length": 500 },
                { "type": "DYNAMIC", "time": 105, "historicTime": 100, "length": 700 },
                { "type": "DYNAMIC", "time": 50, "historicTime": 0, "length": 100 },
                { "type": "ROAD_CLOSED" },
                { "type": "STATIC", "subRoutes": [ { "leadAlert": { "type": "ROAD_CLOSED" } } ] },
                { "type": "STATIC", "subRoutes": [ { "leadAlert": { "type": "JAM" } } ] },
                { "type": "CONSTRUCTION" }
            ],
            "alerts": [
                { "type": "ACCIDENT", "subtype": "ACCIDENT_MAJOR" },
                { "type": "ACCIDENT", "subtype": "ACCIDENT_MINOR", "reportRating": 4 },
                { "type": "ACCIDENT", "subtype": "ACCIDENT_MINOR", "reliability": 9 },
                { "type": "ACCIDENT", "subtype": "ACCIDENT_MINOR", "reportRating": 2, "reliability": 5 },
                { "type": "HAZARD", "subtype": "HAZARD_ON_ROAD_POT_HOLE" },
                { "type": "WEATHERHAZARD", "subtype": "HAZARD_WEATHER_FLOOD" },
                { "type": "JAM" }
            ],
            "lengthOfJams": [ { "jamLevel": 1, "jamLength": 1200 }, { "jamLevel": 4, "jamLength": 800 } ],
            "usersOnJams": [ { "jamLevel": 1, "wazersCount": 40 }, { "jamLevel": 4, "wazersCount": 2 } ]
        })
    }

    #[test]
    fn test_jam_severity_from_delay_and_routes() {
        let s = summarize_feed(&sample_feed());
        // DYNAMIC: 100% severe, 30% moderate, 5% light, one unclassified
        // routes: jamLevel 4 severe, 2 moderate
        assert_eq!(s.total_jams, 4);
        assert_eq!(s.severe_jams, 2);
        assert_eq!(s.moderate_jams, 2);
        assert_eq!(s.light_jams, 1);
    }

    #[test]
    fn test_accident_split_and_hazards() {
        let s = summarize_feed(&sample_feed());
        assert_eq!(s.total_alerts, 7);
        assert_eq!(s.major_accidents, 3);
        assert_eq!(s.minor_accidents, 1);
        assert_eq!(s.hazards, 2);
    }

    #[test]
    fn test_closures_and_works() {
        let s = summarize_feed(&sample_feed());
        assert_eq!(s.total_irregularities, 8);
        assert_eq!(s.closures, 2);
        assert_eq!(s.works, 1);
    }

    #[test]
    fn test_feed_aggregates_take_precedence() {
        let s = summarize_feed(&sample_feed());
        assert_eq!(s.total_jam_length_m, 2000.0);
        assert_eq!(s.users_on_jams, 42);

        let mut feed = sample_feed();
        feed["lengthOfJams"] = json!(0);
        let s = summarize_feed(&feed);
        assert_eq!(s.total_jam_length_m, 2300.0);
    }

    #[test]
    fn test_scalar_length_of_jams() {
        let feed = json!({ "lengthOfJams": 3500, "usersOnJams": 12 });
        let s = summarize_feed(&feed);
        assert_eq!(s.total_jam_length_m, 3500.0);
        assert_eq!(s.users_on_jams, 12);
    }

    #[test]
    fn test_average_speed_and_delay() {
        let feed = json!({
            "irregularities": [
                { "type": "DYNAMIC", "time": 100, "historicTime": 50, "length": 1000 },
                { "type": "DYNAMIC", "time": 200, "historicTime": 150, "length": 1000 }
            ]
        });
        let s = summarize_feed(&feed);
        // 36 km/h and 18 km/h
        assert_eq!(s.average_speed_kmh, Some(27.0));
        assert_eq!(s.average_delay_s, Some(50));
    }

    #[test]
    fn test_malformed_record_is_skipped() {
        let feed = json!({
            "alerts": [
                { "type": "ACCIDENT", "subtype": "ACCIDENT_MAJOR" },
                { "type": "ACCIDENT", "reportRating": "very high" },
                "not an object"
            ]
        });
        let s = summarize_feed(&feed);
        assert_eq!(s.major_accidents, 1);
        assert_eq!(s.total_alerts, 1);
        assert_eq!(s.skipped_records, 2);
    }

    #[test]
    fn test_empty_feed_is_all_zero() {
        let s = summarize_feed(&json!({}));
        assert_eq!(s, FeedSummary::default());
    }

    #[test]
    fn test_parse_feed_rejects_non_object() {
        assert!(parse_feed("[1, 2, 3]").is_err());
        assert!(parse_feed("not json").is_err());
        assert!(parse_feed(r#"{"routes": []}"#).is_ok());
    }

    #[test]
    fn test_congested_roads_worst_first() {
        let roads = congested_roads(&sample_feed(), 2);
        let names: Vec<&str> = roads.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Av. Brasil", "Penha -> Caju", "Linha Amarela"]);
        assert_eq!(roads[0].delay_pct, 200.0);
    }
}
