//! Decode OGN receiver text output (line protocol B).
//!
//! An OGN decoder prints one line per received packet, e.g.:
//!
//! ```text
//! 0.802sec:916.200MHz:   1:2:DDFD1D 104436: [ +32.59657, +35.23525]deg    77m  +0.1m/s   0.4m/s 123.1deg  -1.2deg/s ...
//! ```
//!
//! Unlike protocol A the position is absolute. Only the leading fields up to the
//! turn rate are used; trailing diagnostic fields are ignored. Banner and status
//! lines that do not match are unrecognized.

use std::sync::LazyLock;

use regex::Regex;
use tracing::trace;

use crate::types::AircraftKind;

static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(\d+\.\d+)sec:(\d+\.\d+)MHz:\s+",
        r"([0-9A-Fa-f]+):(\d+):([A-F0-9]+)\s+",
        r"(\d+):\s+",
        r"\[\s*([+-]\d+\.\d+),\s*([+-]\d+\.\d+)\]deg\s+",
        r"(\d+)m\s+",
        r"([+-]\d+\.\d+)m/s\s+",
        r"(\d+\.\d+)m/s\s+",
        r"(\d+\.\d+)deg\s+",
        r"([+-]\d+\.\d+)deg",
    ))
    .expect("OGN line pattern is valid")
});

/// OGN aircraft type digit.
const AIRCRAFT_KIND_TABLE: &[(&str, AircraftKind)] = &[
    ("1", AircraftKind::Glider),
    ("2", AircraftKind::TowPlane),
    ("3", AircraftKind::Helicopter),
    ("4", AircraftKind::Skydiver),
    ("5", AircraftKind::DropPlane),
    ("6", AircraftKind::HangGlider),
    ("7", AircraftKind::Paraglider),
    ("8", AircraftKind::Piston),
    ("9", AircraftKind::Jet),
    ("B", AircraftKind::Balloon),
    ("C", AircraftKind::Airship),
    ("D", AircraftKind::Uav),
    ("F", AircraftKind::StaticObject),
];

/// Map an OGN aircraft-type code to its category.
pub fn aircraft_kind(code: &str) -> AircraftKind {
    AIRCRAFT_KIND_TABLE
        .iter()
        .find(|(c, _)| c.eq_ignore_ascii_case(code))
        .map(|(_, kind)| *kind)
        .unwrap_or(AircraftKind::Unknown)
}

/// One decoded OGN line with absolute position.
#[derive(Debug, Clone, PartialEq)]
pub struct OgnRecord {
    /// Seconds offset from the PPS edge.
    pub pps_offset: f64,
    pub frequency_mhz: f64,
    pub aircraft_kind: AircraftKind,
    pub address_type: u8,
    /// Raw hex address, before ID remapping.
    pub address: String,
    /// `HHMMSS` as printed.
    pub time_of_day: String,
    pub lat: f64,
    pub long: f64,
    /// Meters.
    pub altitude: f64,
    /// m/s
    pub climb_rate: f64,
    /// m/s
    pub ground_speed: f64,
    /// Degrees.
    pub track: f64,
    /// deg/s
    pub turn_rate: f64,
}

/// Decode one OGN output line. `None` if the line does not carry a packet.
pub fn decode(line: &str) -> Option<OgnRecord> {
    let Some(caps) = LINE_RE.captures(line) else {
        trace!(line, "not an OGN packet line");
        return None;
    };

    // Every numeric group is constrained by the pattern, so parsing cannot fail
    // except for pathological overflow; treat that as unrecognized.
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<f64>().ok());

    Some(OgnRecord {
        pps_offset: num(1)?,
        frequency_mhz: num(2)?,
        aircraft_kind: aircraft_kind(&caps[3]),
        address_type: caps[4].parse().ok()?,
        address: caps[5].to_string(),
        time_of_day: caps[6].to_string(),
        lat: num(7)?,
        long: num(8)?,
        altitude: num(9)?,
        climb_rate: num(10)?,
        ground_speed: num(11)?,
        track: num(12)?,
        turn_rate: num(13)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
