//! Plant snapshot model, the transient payload behind one render.
//!
//! The broker retains a JSON document of the shape
//! `{"updateDate": "...", "plants": [{"name": "...", "moisture": 0-100}]}`.
//! Moisture is clamped into 0..=100 and at most six plants survive
//! parsing; everything past the grid is dropped.

use serde::Deserialize;

use crate::config::MAX_PLANTS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plant {
    pub name: String,
    /// Clamped to 0..=100.
    pub moisture: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlantSnapshot {
    /// Opaque timestamp string, shown verbatim in the header.
    pub update_date: String,
    pub plants: Vec<Plant>,
}

#[derive(Deserialize)]
struct RawSnapshot {
    #[serde(rename = "updateDate", default)]
    update_date: String,
    #[serde(default)]
    plants: Vec<RawPlant>,
}

#[derive(Deserialize)]
struct RawPlant {
    #[serde(default)]
    name: String,
    #[serde(default)]
    moisture: i64,
}

impl PlantSnapshot {
    /// Parse a retained payload. Returns `Err` on malformed JSON; the
    /// caller substitutes the [`json_error`](Self::json_error) placeholder.
    pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        let raw: RawSnapshot = serde_json::from_str(payload)?;
        let plants = raw
            .plants
            .into_iter()
            .take(MAX_PLANTS)
            .map(|p| Plant {
                name: p.name,
                moisture: i32::try_from(p.moisture.clamp(0, 100)).unwrap_or(0),
            })
            .collect();
        Ok(Self {
            update_date: raw.update_date,
            plants,
        })
    }

    /// Placeholder rendered when the payload fails to parse.
    pub fn json_error() -> Self {
        Self {
            update_date: "ERROR".to_owned(),
            plants: vec![Plant {
                name: "JSON Error".to_owned(),
                moisture: 0,
            }],
        }
    }

    /// Placeholder rendered when no retained message arrives.
    pub fn waiting() -> Self {
        Self {
            update_date: "Waiting...".to_owned(),
            plants: vec![Plant {
                name: "No Data".to_owned(),
                moisture: 0,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_normal_snapshot() {
        let payload = r#"{"updateDate":"2025-10-03 22:30",
            "plants":[{"name":"Basil","moisture":72},{"name":"Mint","moisture":12}]}"#;
        let snap = PlantSnapshot::parse(payload).unwrap();
        assert_eq!(snap.update_date, "2025-10-03 22:30");
        assert_eq!(snap.plants.len(), 2);
        assert_eq!(snap.plants[0].name, "Basil");
        assert_eq!(snap.plants[1].moisture, 12);
    }

    #[test]
    fn moisture_is_clamped() {
        let payload = r#"{"updateDate":"x","plants":[
            {"name":"a","moisture":-5},{"name":"b","moisture":140}]}"#;
        let snap = PlantSnapshot::parse(payload).unwrap();
        assert_eq!(snap.plants[0].moisture, 0);
        assert_eq!(snap.plants[1].moisture, 100);
    }

    #[test]
    fn seventh_plant_is_dropped() {
        let plants: Vec<String> = (0..7)
            .map(|i| format!(r#"{{"name":"p{i}","moisture":{}}}"#, i * 10))
            .collect();
        let payload = format!(
            r#"{{"updateDate":"x","plants":[{}]}}"#,
            plants.join(",")
        );
        let snap = PlantSnapshot::parse(&payload).unwrap();
        assert_eq!(snap.plants.len(), 6);
        assert_eq!(snap.plants[5].name, "p5");
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(PlantSnapshot::parse("not json").is_err());
        assert!(PlantSnapshot::parse("").is_err());
    }

    #[test]
    fn missing_fields_default() {
        let snap = PlantSnapshot::parse("{}").unwrap();
        assert_eq!(snap.update_date, "");
        assert!(snap.plants.is_empty());
    }

    #[test]
    fn placeholders_carry_the_expected_labels() {
        let err = PlantSnapshot::json_error();
        assert_eq!(err.update_date, "ERROR");
        assert_eq!(err.plants[0].name, "JSON Error");

        let waiting = PlantSnapshot::waiting();
        assert_eq!(waiting.update_date, "Waiting...");
        assert_eq!(waiting.plants[0].name, "No Data");
    }
}
