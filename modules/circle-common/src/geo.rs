//! Great-circle distance and coordinate helpers.
//!
//! Both the geofence engine and the safety-zone monitor measure through
//! `haversine_meters` so containment means the same thing everywhere.

use crate::error::LocationError;

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine great-circle distance between two lat/lon points in meters.
pub fn haversine_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let lat1_r = lat1.to_radians();
    let lat2_r = lat2.to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1_r.cos() * lat2_r.cos() * (d_lon / 2.0).sin().powi(2);
    // Rounding can push `a` a hair past 1.0 for antipodal points.
    let c = 2.0 * a.min(1.0).sqrt().asin();
    EARTH_RADIUS_M * c
}

/// Reject NaN/infinite values and out-of-range latitudes or longitudes.
pub fn validate_coordinate(lat: f64, lon: f64) -> Result<(), LocationError> {
    let valid = lat.is_finite()
        && lon.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lon);
    if valid {
        Ok(())
    } else {
        Err(LocationError::InvalidCoordinate { lat, lon })
    }
}

/// Move a point by a small north/east offset in meters.
///
/// Spherical approximation, good to well under a meter for offsets of a few
/// kilometers away from the poles. Used to place fixtures at known distances.
pub fn offset_meters(lat: f64, lon: f64, north_m: f64, east_m: f64) -> (f64, f64) {
    let d_lat = (north_m / EARTH_RADIUS_M).to_degrees();
    let d_lon = (east_m / (EARTH_RADIUS_M * lat.to_radians().cos())).to_degrees();
    (lat + d_lat, lon + d_lon)
}
