use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use smiley_core::{Rank, RANKS};

/// Feed element names for one ranked inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectionFields {
    pub result: String,
    pub date: String,
}

impl InspectionFields {
    fn new(result: &str, date: &str) -> Self {
        Self {
            result: result.to_string(),
            date: date.to_string(),
        }
    }
}

/// Maps the feed's native element names onto canonical fields.
///
/// Defaults match the Danish Veterinary and Food Administration smiley feed.
/// Any subset can be overridden from YAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMapping {
    pub record_element: String,
    pub id: String,
    pub name: String,
    pub street_address: String,
    pub postal_code: String,
    pub city: String,
    pub latitude: String,
    pub longitude: String,
    pub elite: String,
    /// Ordered most recent first.
    pub inspections: [InspectionFields; RANKS],
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            record_element: "row".to_string(),
            id: "navnelbnr".to_string(),
            name: "navn1".to_string(),
            street_address: "adresse1".to_string(),
            postal_code: "postnr".to_string(),
            city: "By".to_string(),
            latitude: "Geo_Lat".to_string(),
            longitude: "Geo_Lng".to_string(),
            elite: "Elite_Smiley".to_string(),
            inspections: [
                InspectionFields::new("seneste_kontrol", "seneste_kontrol_dato"),
                InspectionFields::new("naestseneste_kontrol", "naestseneste_kontrol_dato"),
                InspectionFields::new("tredjeseneste_kontrol", "tredjeseneste_kontrol_dato"),
                InspectionFields::new("fjerdeseneste_kontrol", "fjerdeseneste_kontrol_dato"),
            ],
        }
    }
}

impl FieldMapping {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing field mapping")
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn inspection(&self, rank: Rank) -> &InspectionFields {
        &self.inspections[rank.index()]
    }
}
