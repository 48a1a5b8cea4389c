//! Decode FLARM data-port sentences (line protocol A).
//!
//! Sentences are ASCII, comma separated, start with `$` and end with a `*HH`
//! XOR checksum. Three tags are recognized:
//! - `PFLAA`: data on one proximate aircraft, relative to own position
//! - `PFLAU`: operating status and priority intruder
//! - `PGRMZ`: barometric altitude
//!
//! The device delivers sentences on a best-effort basis and any field may be
//! empty, so decoding is tolerant: an empty or unparseable numeric field becomes
//! zero and decoding carries on. Anything structurally wrong (no `$`, bad
//! checksum, unknown tag) is unrecognized and yields `None`.

use tracing::{debug, trace};

use crate::types::AircraftKind;

/// Sentinel for enumerated codes missing from a lookup table.
pub const UNKNOWN: &str = "unknown";

// ---------------------------------------------------------------------------
// Lookup tables
// ---------------------------------------------------------------------------

/// PFLAA `<IDType>`.
const ID_TYPE_TABLE: &[(i64, &str)] = &[(1, "official"), (2, "flarm id"), (3, "anonymous")];

/// PFLAU `<TX>`.
const TX_STATUS_TABLE: &[(i64, &str)] = &[(0, "OK"), (1, "no transmission")];

/// PFLAU `<GPS>`.
const GPS_STATUS_TABLE: &[(i64, &str)] = &[
    (0, "no signal"),
    (1, "valid on ground"),
    (2, "valid airborne"),
];

/// PFLAU `<AlarmType>`, a hex value.
const ALARM_TYPE_TABLE: &[(&str, &str)] = &[
    ("0", "no alarm"),
    ("2", "aircraft"),
    ("3", "obstacle / zone"),
];

/// PFLAA `<AcftType>`. Codes A and E are "unknown" on the device as well.
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

fn lookup_int(table: &[(i64, &'static str)], code: i64) -> &'static str {
    table
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
        .unwrap_or(UNKNOWN)
}

fn lookup_str(table: &[(&str, &'static str)], code: &str) -> &'static str {
    table
        .iter()
        .find(|(c, _)| c.eq_ignore_ascii_case(code))
        .map(|(_, name)| *name)
        .unwrap_or(UNKNOWN)
}

/// Map a PFLAA aircraft-type code to its category.
pub fn aircraft_kind(code: &str) -> AircraftKind {
    AIRCRAFT_KIND_TABLE
        .iter()
        .find(|(c, _)| c.eq_ignore_ascii_case(code.trim()))
        .map(|(_, kind)| *kind)
        .unwrap_or(AircraftKind::Unknown)
}

// ---------------------------------------------------------------------------
// Decoded sentence types
// ---------------------------------------------------------------------------

/// PFLAA: one proximate aircraft as an offset from own position.
#[derive(Debug, Clone, PartialEq)]
pub struct ProximityRecord {
    /// 0-3.
    pub alarm_level: i64,
    /// Meters true north of own position.
    pub relative_north: i64,
    /// Meters true east of own position.
    pub relative_east: i64,
    /// Meters above own position.
    pub relative_vertical: i64,
    pub id_type: &'static str,
    /// 6 hex digits, empty when no identification is known.
    pub id: String,
    /// True ground track, degrees.
    pub track: i64,
    /// deg/s
    pub turn_rate: f64,
    /// m/s
    pub ground_speed: i64,
    /// m/s
    pub climb_rate: f64,
    pub aircraft_kind: AircraftKind,
}

/// PFLAU: receiver operating status and priority intruder.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRecord {
    /// Number of devices currently received.
    pub rx: i64,
    pub tx: &'static str,
    pub gps: &'static str,
    /// 1 OK, 0 under or over voltage.
    pub power: i64,
    pub alarm_level: i64,
    /// Degrees from own track, clockwise.
    pub relative_bearing: i64,
    pub alarm_type: &'static str,
    pub relative_vertical: i64,
    pub relative_distance: i64,
    /// Omitted before protocol version 4.
    pub id: String,
}

/// PGRMZ: barometric altitude.
#[derive(Debug, Clone, PartialEq)]
pub struct AltitudeRecord {
    /// Feet, may be negative.
    pub altitude_ft: i64,
}

/// Union of the recognized sentences.
#[derive(Debug, Clone, PartialEq)]
pub enum Sentence {
    Proximity(ProximityRecord),
    Status(StatusRecord),
    Altitude(AltitudeRecord),
}

// ---------------------------------------------------------------------------
// Checksum
// ---------------------------------------------------------------------------

/// XOR of all bytes between `$` and `*`.
pub fn checksum(body: &str) -> u8 {
    body.bytes().fold(0u8, |acc, b| acc ^ b)
}

/// Split `$BODY*HH` into BODY, verifying the checksum.
fn verified_body(line: &str) -> Option<&str> {
    let rest = line.strip_prefix('$')?;
    let (body, sum) = rest.rsplit_once('*')?;
    if sum.len() != 2 || !sum.bytes().all(|b| b.is_ascii_hexdigit()) {
        trace!(line, "malformed checksum field");
        return None;
    }
    let expected = u8::from_str_radix(sum, 16).ok()?;
    let actual = checksum(body);
    if expected != actual {
        debug!(line, expected, actual, "checksum mismatch");
        return None;
    }
    Some(body)
}

// ---------------------------------------------------------------------------
// Field access
// ---------------------------------------------------------------------------

/// Positional access to the data fields of a sentence (tag excluded).
/// Missing fields read as empty.
struct Fields<'a> {
    tag: &'a str,
    values: Vec<&'a str>,
}

impl<'a> Fields<'a> {
    fn new(tag: &'a str, values: Vec<&'a str>) -> Self {
        Fields { tag, values }
    }

    fn str(&self, i: usize) -> &'a str {
        self.values.get(i).map(|s| s.trim()).unwrap_or("")
    }

    fn int(&self, i: usize, name: &str) -> i64 {
        let raw = self.str(i);
        if raw.is_empty() {
            return 0;
        }
        raw.parse().unwrap_or_else(|_| {
            debug!(tag = self.tag, field = name, value = raw, "bad integer field");
            0
        })
    }

    fn float(&self, i: usize, name: &str) -> f64 {
        let raw = self.str(i);
        if raw.is_empty() {
            return 0.0;
        }
        raw.parse().unwrap_or_else(|_| {
            debug!(tag = self.tag, field = name, value = raw, "bad decimal field");
            0.0
        })
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode one line. Returns `None` for anything unrecognized.
///
/// Surrounding whitespace is ignored, so a frame carrying a stray `\n` from a
/// `\n\r` terminated stream still decodes.
pub fn decode(line: &str) -> Option<Sentence> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let body = verified_body(line)?;
    let mut parts = body.split(',');
    let tag = parts.next()?;
    let fields = Fields::new(tag, parts.collect());

    match tag {
        "PFLAA" => Some(Sentence::Proximity(decode_pflaa(&fields))),
        "PFLAU" => Some(Sentence::Status(decode_pflau(&fields))),
        "PGRMZ" => Some(Sentence::Altitude(decode_pgrmz(&fields))),
        _ => {
            trace!(tag, "ignoring sentence");
            None
        }
    }
}

/// `PFLAA,<AlarmLevel>,<RelativeNorth>,<RelativeEast>,<RelativeVertical>,<IDType>,
/// <ID>,<Track>,<TurnRate>,<GroundSpeed>,<ClimbRate>,<AcftType>`
fn decode_pflaa(f: &Fields) -> ProximityRecord {
    ProximityRecord {
        alarm_level: f.int(0, "alarm level"),
        relative_north: f.int(1, "relative north"),
        relative_east: f.int(2, "relative east"),
        relative_vertical: f.int(3, "relative vertical"),
        id_type: lookup_int(ID_TYPE_TABLE, f.int(4, "id type")),
        id: f.str(5).to_string(),
        track: f.int(6, "track"),
        turn_rate: f.float(7, "turn rate"),
        ground_speed: f.int(8, "ground speed"),
        climb_rate: f.float(9, "climb rate"),
        aircraft_kind: aircraft_kind(f.str(10)),
    }
}

/// `PFLAU,<RX>,<TX>,<GPS>,<Power>,<AlarmLevel>,<RelativeBearing>,<AlarmType>,
/// <RelativeVertical>,<RelativeDistance>,<ID>`
fn decode_pflau(f: &Fields) -> StatusRecord {
    StatusRecord {
        rx: f.int(0, "rx"),
        tx: lookup_int(TX_STATUS_TABLE, f.int(1, "tx")),
        gps: lookup_int(GPS_STATUS_TABLE, f.int(2, "gps")),
        power: f.int(3, "power"),
        alarm_level: f.int(4, "alarm level"),
        relative_bearing: f.int(5, "relative bearing"),
        alarm_type: lookup_str(ALARM_TYPE_TABLE, f.str(6)),
        relative_vertical: f.int(7, "relative vertical"),
        relative_distance: f.int(8, "relative distance"),
        id: f.str(9).to_string(),
    }
}

/// `PGRMZ,<Value>,F[,<2|3>]`
fn decode_pgrmz(f: &Fields) -> AltitudeRecord {
    AltitudeRecord {
        altitude_ft: f.int(0, "altitude"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
