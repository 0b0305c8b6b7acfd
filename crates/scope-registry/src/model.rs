use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a telescope as tracked by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TelescopeStatus {
    #[serde(rename = "FREE")]
    Free,
    #[serde(rename = "LOCK", alias = "LOCKED")]
    Locked,
    #[serde(rename = "DAMAGED")]
    Damaged,
}

impl TelescopeStatus {
    /// Segment used in `POST /telescopes/{holder}/{id}/{status}`.
    pub fn as_path_segment(self) -> &'static str {
        match self {
            TelescopeStatus::Free => "FREE",
            TelescopeStatus::Locked => "LOCK",
            TelescopeStatus::Damaged => "DAMAGED",
        }
    }
}

impl fmt::Display for TelescopeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_path_segment())
    }
}

impl FromStr for TelescopeStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "FREE" => Ok(TelescopeStatus::Free),
            "LOCK" | "LOCKED" => Ok(TelescopeStatus::Locked),
            "DAMAGED" => Ok(TelescopeStatus::Damaged),
            other => Err(format!("unknown telescope status {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

/// A telescope as listed by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telescope {
    pub telescope_id: String,
    pub telescope_name: String,
    pub price_per_minute: f64,
    pub location: Location,
    pub status: TelescopeStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelescopeList {
    #[serde(default)]
    pub available_telescopes: u32,
    #[serde(default)]
    pub reserved_telescopes: u32,
    #[serde(default)]
    pub unavailable_telescopes: u32,
    #[serde(default)]
    pub telescopes: Vec<Telescope>,
}

impl TelescopeList {
    /// Builds a listing and derives the per-status counters from `telescopes`.
    pub fn from_telescopes(telescopes: Vec<Telescope>) -> Self {
        let count = |status: TelescopeStatus| {
            telescopes.iter().filter(|t| t.status == status).count() as u32
        };
        Self {
            available_telescopes: count(TelescopeStatus::Free),
            reserved_telescopes: count(TelescopeStatus::Locked),
            unavailable_telescopes: count(TelescopeStatus::Damaged),
            telescopes,
        }
    }

    pub fn find(&self, telescope_id: &str) -> Option<&Telescope> {
        self.telescopes
            .iter()
            .find(|t| t.telescope_id == telescope_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountType {
    #[serde(rename = "ALT_AZ")]
    AltAz,
    #[serde(rename = "EQUATORIAL")]
    Equatorial,
    #[serde(rename = "DOBSONIAN")]
    Dobsonian,
    #[serde(rename = "GOTO")]
    Goto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpticalDesign {
    Reflector,
    Refractor,
    Catadioptric,
    #[serde(rename = "Schmidt-Cassegrain")]
    SchmidtCassegrain,
    Maksutov,
    Combination,
}

/// Technical sheet returned by `GET /telescopes/{id}`. Lengths in mm, weight in kg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specifications {
    pub aperture: f64,
    pub focal_length: f64,
    pub focal_ratio: f64,
    pub weight: f64,
    pub length: f64,
    pub width: f64,
    pub height: f64,
    pub mount_type: MountType,
    pub optical_design: OpticalDesign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TelescopeKind {
    Mock,
    OpenSource,
    Professional,
}

/// Body of the create/update endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelescopeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telescope_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telescope_type: Option<TelescopeKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_per_minute: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub location: Location,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TelescopeStatus>,
    pub specifications: Specifications,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostTelescopeResponse {
    pub telescope_id: String,
    pub publish_token: String,
}

/// Result of a status transition; the token authorises the media session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateResponse {
    #[serde(default)]
    pub subscribe_token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Interests {
    pub interesting: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn status_accepts_both_lock_spellings() {
        let locked: TelescopeStatus = serde_json::from_str("\"LOCK\"").unwrap();
        let alias: TelescopeStatus = serde_json::from_str("\"LOCKED\"").unwrap();
        assert_eq!(locked, TelescopeStatus::Locked);
        assert_eq!(alias, TelescopeStatus::Locked);
        assert_eq!(serde_json::to_string(&locked).unwrap(), "\"LOCK\"");
        assert_eq!("damaged".parse::<TelescopeStatus>(), Ok(TelescopeStatus::Damaged));
        assert!("broken".parse::<TelescopeStatus>().is_err());
    }

    #[test_timeout::timeout]
    fn decodes_backend_listing() {
        let body = serde_json::json!({
            "available_telescopes": 1,
            "reserved_telescopes": 0,
            "unavailable_telescopes": 0,
            "telescopes": [{
                "telescope_id": "t-1",
                "telescope_name": "Kraków North",
                "price_per_minute": 0.5,
                "location": {"city": "Kraków", "country": "Poland", "latitude": 50.06, "longitude": 19.94},
                "status": "FREE"
            }]
        });
        let list: TelescopeList = serde_json::from_value(body).unwrap();
        assert_eq!(list.telescopes.len(), 1);
        assert_eq!(list.find("t-1").unwrap().price_per_minute, 0.5);
        assert!(list.find("t-2").is_none());
    }

    #[test_timeout::timeout]
    fn derives_counters_from_statuses() {
        let telescope = |id: &str, status| Telescope {
            telescope_id: id.into(),
            telescope_name: id.into(),
            price_per_minute: 1.0,
            location: Location {
                city: None,
                country: None,
                latitude: 0.0,
                longitude: 0.0,
            },
            status,
        };
        let list = TelescopeList::from_telescopes(vec![
            telescope("a", TelescopeStatus::Free),
            telescope("b", TelescopeStatus::Locked),
            telescope("c", TelescopeStatus::Free),
            telescope("d", TelescopeStatus::Damaged),
        ]);
        assert_eq!(list.available_telescopes, 2);
        assert_eq!(list.reserved_telescopes, 1);
        assert_eq!(list.unavailable_telescopes, 1);
    }

    #[test_timeout::timeout]
    fn specifications_use_backend_enum_spellings() {
        let specs: Specifications = serde_json::from_value(serde_json::json!({
            "aperture": 200.0,
            "focal_length": 1000.0,
            "focal_ratio": 5.0,
            "weight": 12.5,
            "length": 950.0,
            "width": 250.0,
            "height": 250.0,
            "mount_type": "ALT_AZ",
            "optical_design": "Schmidt-Cassegrain"
        }))
        .unwrap();
        assert_eq!(specs.mount_type, MountType::AltAz);
        assert_eq!(specs.optical_design, OpticalDesign::SchmidtCassegrain);
    }
}
