//! Great-circle distance
//!
//! Haversine over a sphere of mean Earth radius 6 371 000 m. Accurate to
//! well under a meter at anchor-watch scales.

use crate::config::defaults::EARTH_RADIUS_METERS;
use crate::types::Position;

/// Distance between two WGS-84 coordinates in meters.
pub fn haversine_distance(a: Position, b: Position) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().asin()
}
