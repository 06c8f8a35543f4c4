//! Local equirectangular projection between degrees and metres.
//!
//! The frame is anchored at a reference point: `x` grows east, `y` grows north.
//! Accuracy is fine for the tens-to-thousands of metres the shadow queries cover;
//! it degrades toward the poles and over large radii.

use crate::types::{GeoPoint, LocalPoint};

pub const METERS_PER_DEGREE_LAT: f64 = 111_132.0;
pub const METERS_PER_DEGREE_LON_EQUATOR: f64 = 111_320.0;

/// Metres per degree of longitude at `latitude` degrees.
pub fn meters_per_degree_lon(latitude: f64) -> f64 {
    METERS_PER_DEGREE_LON_EQUATOR * latitude.to_radians().cos()
}

pub fn project(anchor: GeoPoint, p: GeoPoint) -> LocalPoint {
    LocalPoint {
        x: (p.longitude - anchor.longitude) * meters_per_degree_lon(anchor.latitude),
        y: (p.latitude - anchor.latitude) * METERS_PER_DEGREE_LAT,
    }
}

pub fn unproject(anchor: GeoPoint, p: LocalPoint) -> GeoPoint {
    GeoPoint {
        longitude: anchor.longitude + p.x / meters_per_degree_lon(anchor.latitude),
        latitude: anchor.latitude + p.y / METERS_PER_DEGREE_LAT,
    }
}

pub fn project_ring(anchor: GeoPoint, ring: &[GeoPoint]) -> Vec<LocalPoint> {
    ring.iter().map(|&p| project(anchor, p)).collect()
}

/// Naive centroid: the plain mean of the ring's vertices.
///
/// This is not the area centroid. It is good enough to anchor a building's
/// local frame and pick the place where the sun is evaluated. A closed ring's
/// repeated last vertex is left out so it is not counted twice.
pub fn centroid(ring: &[GeoPoint]) -> GeoPoint {
    let vertices = match ring {
        [first, .., last] if first == last => &ring[..ring.len() - 1],
        _ => ring,
    };
    if vertices.is_empty() {
        return GeoPoint::new(0.0, 0.0);
    }

    let n = vertices.len() as f64;
    let sum_lon: f64 = vertices.iter().map(|p| p.longitude).sum();
    let sum_lat: f64 = vertices.iter().map(|p| p.latitude).sum();
    GeoPoint::new(sum_lon / n, sum_lat / n)
}
