//! Geographic helpers shared by the filter, estimator and progress math.

use geo::{Distance, Haversine, Point};

use crate::LocationSample;

/// Haversine distance between two samples in meters.
pub fn haversine_distance(a: &LocationSample, b: &LocationSample) -> f64 {
    haversine_meters(a.latitude, a.longitude, b.latitude, b.longitude)
}

/// Haversine distance between two coordinates in meters.
pub fn haversine_meters(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let p1 = Point::new(lng1, lat1);
    let p2 = Point::new(lng2, lat2);
    Haversine::distance(p1, p2)
}

/// Convert meters per second to kilometers per hour.
#[inline]
pub fn mps_to_kmh(mps: f64) -> f64 {
    mps * 3.6
}
