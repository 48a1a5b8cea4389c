//! Shared types, error enum, and the canonical report for flarm-core.

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors produced by flarm-core.
#[derive(Debug, Error)]
pub enum FlarmError {
    #[error("config error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlarmError>;

// ---------------------------------------------------------------------------
// Aircraft kind
// ---------------------------------------------------------------------------

/// Category of the other aircraft.
///
/// Both line protocols carry a one-digit hex code for this, but each has its own
/// code table (see `sentence::aircraft_kind` and `ogn::aircraft_kind`). The
/// serialized name is the human readable label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AircraftKind {
    #[serde(rename = "unknown")]
    Unknown,
    #[serde(rename = "glider / motor glider")]
    Glider,
    #[serde(rename = "tow / tug plane")]
    TowPlane,
    #[serde(rename = "helicopter / rotorcraft")]
    Helicopter,
    #[serde(rename = "skydiver")]
    Skydiver,
    #[serde(rename = "drop plane for skydivers")]
    DropPlane,
    #[serde(rename = "hang glider (hard)")]
    HangGlider,
    #[serde(rename = "paraglider (soft)")]
    Paraglider,
    #[serde(rename = "aircraft with reciprocating engine(s)")]
    Piston,
    #[serde(rename = "aircraft with jet/turboprop engine(s)")]
    Jet,
    #[serde(rename = "balloon")]
    Balloon,
    #[serde(rename = "airship")]
    Airship,
    #[serde(rename = "unmanned aerial vehicle (UAV)")]
    Uav,
    #[serde(rename = "static object")]
    StaticObject,
}

impl AircraftKind {
    pub fn label(&self) -> &'static str {
        match self {
            AircraftKind::Unknown => "unknown",
            AircraftKind::Glider => "glider / motor glider",
            AircraftKind::TowPlane => "tow / tug plane",
            AircraftKind::Helicopter => "helicopter / rotorcraft",
            AircraftKind::Skydiver => "skydiver",
            AircraftKind::DropPlane => "drop plane for skydivers",
            AircraftKind::HangGlider => "hang glider (hard)",
            AircraftKind::Paraglider => "paraglider (soft)",
            AircraftKind::Piston => "aircraft with reciprocating engine(s)",
            AircraftKind::Jet => "aircraft with jet/turboprop engine(s)",
            AircraftKind::Balloon => "balloon",
            AircraftKind::Airship => "airship",
            AircraftKind::Uav => "unmanned aerial vehicle (UAV)",
            AircraftKind::StaticObject => "static object",
        }
    }
}

impl std::fmt::Display for AircraftKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// Canonical report
// ---------------------------------------------------------------------------

/// One observation of another aircraft, the unit of distribution.
///
/// Built once per decoded proximity sentence (or received as-is over a relay link)
/// and never mutated afterwards. `id` is never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalReport {
    /// Aircraft identity after ID remapping.
    pub id: String,
    /// Degrees.
    pub lat: f64,
    /// Degrees.
    pub long: f64,
    /// Meters.
    pub altitude: f64,
    /// True track in degrees, 0-359.
    pub heading: u16,
    /// m/s
    pub ground_speed: f64,
    /// m/s, positive is climbing.
    pub climb_rate: f64,
    /// deg/s
    pub turn_rate: f64,
    pub aircraft_kind: AircraftKind,
    /// 0 = no alarm .. 3 = 0-8 seconds to impact.
    pub alarm_level: u8,
    /// Reception time in the station's time zone.
    pub timestamp: DateTime<FixedOffset>,
}

// ---------------------------------------------------------------------------
// Station reference
// ---------------------------------------------------------------------------

/// The fixed ground point the receiver sits on, plus per-generation settings
/// needed to build reports. Read-only once built.
#[derive(Debug, Clone, PartialEq)]
pub struct StationReference {
    pub lat: f64,
    pub long: f64,
    /// Meters.
    pub altitude: f64,
    pub time_zone: Tz,
    /// Raw device ID -> call-sign.
    pub id_map: HashMap<String, String>,
}

impl Default for StationReference {
    fn default() -> Self {
        StationReference {
            lat: 0.0,
            long: 0.0,
            altitude: 0.0,
            time_zone: Tz::UTC,
            id_map: HashMap::new(),
        }
    }
}

impl StationReference {
    /// Resolve a raw device ID through the ID map. Unmapped IDs, and IDs mapped to
    /// an empty string, pass through unchanged.
    pub fn map_id<'a>(&'a self, id: &'a str) -> &'a str {
        match self.id_map.get(id) {
            Some(mapped) if !mapped.is_empty() => mapped.as_str(),
            _ => id,
        }
    }

    /// Current time in the station's zone.
    pub fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.time_zone).fixed_offset()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
