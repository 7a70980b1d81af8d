//! Wire types for the upstream OSM API.
//!
//! OSM is loose with scalar types (ids and points arrive as strings or
//! numbers depending on endpoint age), so the deserializers normalize.

use chrono::NaiveDate;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use std::collections::HashMap;

/// `POST /oauth/token` response for both grant types.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// `GET /oauth/resource` envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileEnvelope {
    pub data: UserProfile,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserProfile {
    #[serde(alias = "userid", deserialize_with = "de_i64_flexible")]
    pub user_id: i64,
    #[serde(alias = "fullname", default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub sections: Vec<OsmSection>,
}

impl UserProfile {
    pub fn section(&self, section_id: i64) -> Option<&OsmSection> {
        self.sections.iter().find(|s| s.section_id == section_id)
    }

    /// The term covering `today` in the given section, preferring the most
    /// recently started when terms overlap.
    pub fn active_term(&self, section_id: i64, today: NaiveDate) -> Option<&OsmTerm> {
        self.section(section_id)?
            .terms
            .iter()
            .filter(|t| t.start_date <= today && today <= t.end_date)
            .max_by_key(|t| t.start_date)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OsmSection {
    #[serde(alias = "sectionid", deserialize_with = "de_i64_flexible")]
    pub section_id: i64,
    #[serde(alias = "sectionname")]
    pub section_name: String,
    #[serde(default)]
    pub terms: Vec<OsmTerm>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OsmTerm {
    #[serde(alias = "termid", deserialize_with = "de_string_flexible")]
    pub term_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(alias = "startdate")]
    pub start_date: NaiveDate,
    #[serde(alias = "enddate")]
    pub end_date: NaiveDate,
}

/// One entry of the `getPatrolsWithPeople` map.
#[derive(Debug, Clone, Deserialize)]
pub struct OsmPatrol {
    #[serde(alias = "patrolid", deserialize_with = "de_string_flexible")]
    pub patrol_id: String,
    pub name: String,
    #[serde(default, deserialize_with = "de_points")]
    pub points: i64,
    #[serde(default)]
    pub members: Vec<serde_json::Value>,
}

/// `getPatrolsWithPeople` response: a map keyed by patrol id.
pub type PatrolsResponse = HashMap<String, OsmPatrol>;

/// Accept a JSON string or number, produce a String.
pub fn de_string_flexible<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

/// Accept a JSON string or number, produce an i64.
pub fn de_i64_flexible<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| de::Error::custom("number out of i64 range")),
        serde_json::Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| de::Error::custom(format!("non-numeric string: {s}"))),
        other => Err(de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

/// Points arrive as `"42"`, `42`, `""`, or null; anything unparsable is 0.
fn de_points<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(serde_json::Value::String(s)) => s.trim().parse::<i64>().unwrap_or(0),
        _ => 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patrols_response_parses_osm_shapes() {
        let raw = r#"{
            "101": {"patrolid": "101", "name": "Eagles", "points": "42", "members": [{"scoutid": 1}]},
            "102": {"patrolid": 102, "name": "Hawks", "points": 7, "members": []},
            "-2": {"patrolid": -2, "name": "Leaders", "points": "", "members": [{"scoutid": 9}]}
        }"#;
        let parsed: PatrolsResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed["101"].points, 42);
        assert_eq!(parsed["102"].patrol_id, "102");
        assert_eq!(parsed["-2"].points, 0);
        assert!(parsed["102"].members.is_empty());
    }

    #[test]
    fn profile_parses_string_ids_and_finds_active_term() {
        let raw = r#"{
            "data": {
                "userid": "77",
                "fullname": "A Leader",
                "sections": [{
                    "sectionid": "1001",
                    "sectionname": "1st Example Scouts",
                    "terms": [
                        {"termid": "t-old", "startdate": "2025-01-01", "enddate": "2025-03-31"},
                        {"termid": "t-now", "startdate": "2025-04-01", "enddate": "2025-07-31"}
                    ]
                }]
            }
        }"#;
        let parsed: ProfileEnvelope = serde_json::from_str(raw).unwrap();
        let profile = parsed.data;
        assert_eq!(profile.user_id, 77);

        let today = NaiveDate::from_ymd_opt(2025, 5, 1).unwrap();
        let term = profile.active_term(1001, today).unwrap();
        assert_eq!(term.term_id, "t-now");

        let off_season = NaiveDate::from_ymd_opt(2025, 8, 15).unwrap();
        assert!(profile.active_term(1001, off_season).is_none());
        assert!(profile.active_term(9999, today).is_none());
    }

    #[test]
    fn overlapping_terms_prefer_latest_start() {
        let raw = r#"{
            "data": {
                "userid": 1,
                "sections": [{
                    "sectionid": 5,
                    "sectionname": "S",
                    "terms": [
                        {"termid": "year", "startdate": "2025-01-01", "enddate": "2025-12-31"},
                        {"termid": "summer", "startdate": "2025-06-01", "enddate": "2025-08-31"}
                    ]
                }]
            }
        }"#;
        let profile = serde_json::from_str::<ProfileEnvelope>(raw).unwrap().data;
        let today = NaiveDate::from_ymd_opt(2025, 7, 1).unwrap();
        assert_eq!(profile.active_term(5, today).unwrap().term_id, "summer");
    }
}
