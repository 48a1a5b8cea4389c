//! Relative offset to absolute position.
//!
//! FLARM reports other aircraft as meters north/east/above the receiver. This
//! converts the offset into latitude/longitude with a local equirectangular
//! approximation around the station:
//!
//! ```text
//! dlat = north / R
//! dlon = east / (R * cos(lat0))
//! ```
//!
//! Precision: the flat-earth error grows with the square of the offset over R.
//! At FLARM ranges (a few km, R = 6378 km) it stays well under a meter. Do not
//! use this for offsets of hundreds of kilometers or near the poles, where
//! `cos(lat0)` approaches zero.

use crate::types::StationReference;

/// WGS84 equatorial radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Absolute position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub long: f64,
    /// Meters.
    pub altitude: f64,
}

/// Project a north/east/vertical offset in meters from the station.
pub fn project(station: &StationReference, rel_north: f64, rel_east: f64, rel_vertical: f64) -> GeoPoint {
    let d_lat = rel_north / EARTH_RADIUS_M;
    let d_lon = rel_east / (EARTH_RADIUS_M * station.lat.to_radians().cos());

    GeoPoint {
        lat: station.lat + d_lat.to_degrees(),
        long: station.long + d_lon.to_degrees(),
        altitude: station.altitude + rel_vertical,
    }
}
