//! Geographic utilities shared by the sampler and publisher.

use crate::GpsPoint;

/// Mean earth radius used for great-circle distances, in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two points in meters (haversine formula,
/// spherical earth).
///
/// # Example
/// ```
/// use travel_tracker::{geo_utils::haversine_distance, GpsPoint};
/// let london = GpsPoint::new(51.5074, -0.1278);
/// let paris = GpsPoint::new(48.8566, 2.3522);
/// let km = haversine_distance(&london, &paris) / 1000.0;
/// assert!((km - 343.5).abs() < 1.0);
/// ```
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let lat1 = p1.latitude.to_radians();
    let lat2 = p2.latitude.to_radians();
    let dlat = (p2.latitude - p1.latitude).to_radians();
    let dlng = (p2.longitude - p1.longitude).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Largest absolute per-axis difference between two points, in degrees.
pub fn max_axis_delta(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    (p1.latitude - p2.latitude)
        .abs()
        .max((p1.longitude - p2.longitude).abs())
}
