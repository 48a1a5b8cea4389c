//! Turn decoded records into canonical reports.
//!
//! Both decode paths end here: a protocol A proximity record is projected from
//! the station, an OGN record already carries its position. Either way the raw
//! ID goes through the station's ID map and an empty result drops the record.

use chrono::{DateTime, FixedOffset};
use tracing::debug;

use crate::geo;
use crate::ogn::OgnRecord;
use crate::sentence::{ProximityRecord, Sentence};
use crate::types::{CanonicalReport, StationReference};

/// Build a report from a PFLAA record. `None` if the aircraft has no identity.
pub fn from_proximity(
    station: &StationReference,
    record: &ProximityRecord,
    timestamp: DateTime<FixedOffset>,
) -> Option<CanonicalReport> {
    if record.id.trim().is_empty() {
        debug!("ignoring proximity record with empty id");
        return None;
    }
    let id = station.map_id(&record.id);

    let pos = geo::project(
        station,
        record.relative_north as f64,
        record.relative_east as f64,
        record.relative_vertical as f64,
    );

    Some(CanonicalReport {
        id: id.to_string(),
        lat: pos.lat,
        long: pos.long,
        altitude: pos.altitude,
        heading: heading(record.track as f64),
        ground_speed: record.ground_speed.max(0) as f64,
        climb_rate: record.climb_rate,
        turn_rate: record.turn_rate,
        aircraft_kind: record.aircraft_kind,
        alarm_level: record.alarm_level.clamp(0, 3) as u8,
        timestamp,
    })
}

/// Build a report from a decoded protocol A sentence. Only proximity records
/// carry a position; status and altitude sentences yield nothing.
pub fn from_sentence(
    station: &StationReference,
    sentence: &Sentence,
    timestamp: DateTime<FixedOffset>,
) -> Option<CanonicalReport> {
    match sentence {
        Sentence::Proximity(p) => from_proximity(station, p, timestamp),
        Sentence::Status(_) | Sentence::Altitude(_) => None,
    }
}

/// Build a report from an OGN record. OGN carries no alarm level.
pub fn from_ogn(
    station: &StationReference,
    record: &OgnRecord,
    timestamp: DateTime<FixedOffset>,
) -> Option<CanonicalReport> {
    if record.address.trim().is_empty() {
        debug!("ignoring OGN record with empty address");
        return None;
    }
    let id = station.map_id(&record.address);

    Some(CanonicalReport {
        id: id.to_string(),
        lat: record.lat,
        long: record.long,
        altitude: record.altitude,
        heading: heading(record.track),
        ground_speed: record.ground_speed.max(0.0),
        climb_rate: record.climb_rate,
        turn_rate: record.turn_rate,
        aircraft_kind: record.aircraft_kind,
        alarm_level: 0,
        timestamp,
    })
}

/// Whole degrees in 0..360.
fn heading(track: f64) -> u16 {
    let deg = track.trunc() as i64;
    deg.rem_euclid(360) as u16
}
