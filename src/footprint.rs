//! Approximate shadow outlines for drawing on a map.
//!
//! The outline is a parallelogram spanned by the footprint's two silhouette
//! vertices (extremes across the shadow direction) and the same two points
//! pushed along the shadow by its length. It is a display aid; the shade test
//! does not use it.

use crate::geo_projection::{centroid, project_ring, unproject};
use crate::sun_position::compute_sun;
use crate::types::*;
use chrono::{DateTime, Utc};
use geo_types::{LineString, Polygon};
use serde::{Deserialize, Serialize};

/// Below this the shadow is longer than any map will show.
const MIN_TAN_ALTITUDE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowPolygon {
    pub building_id: BuildingId,
    /// Closed ring: silhouette start, silhouette end, far end, far start, start.
    pub ring: Vec<GeoPoint>,
    pub length_meters: f64,
}

impl ShadowPolygon {
    pub fn to_polygon(&self) -> Polygon<f64> {
        let exterior: LineString<f64> = self
            .ring
            .iter()
            .map(|&p| geo_types::Coord::from(p))
            .collect();
        Polygon::new(exterior, vec![])
    }
}

/// Shadow outline cast by `building` at `instant`, or `None` when the sun is
/// down at the building or the footprint is invalid.
pub fn project_shadow(building: &BuildingFootprint, instant: &DateTime<Utc>) -> Option<ShadowPolygon> {
    if let Err(e) = building.validate() {
        log::warn!("No shadow outline: {}", e);
        return None;
    }
    let center = centroid(&building.outer_ring);
    let sun = compute_sun(instant, center.latitude, center.longitude);
    project_shadow_with_sun(building, &sun)
}

pub fn project_shadow_with_sun(
    building: &BuildingFootprint,
    sun: &SolarPosition,
) -> Option<ShadowPolygon> {
    if !sun.is_above_horizon() {
        return None;
    }
    let tan_altitude = sun.altitude.tan();
    if !tan_altitude.is_finite() || tan_altitude < MIN_TAN_ALTITUDE {
        return None;
    }
    let length = building.height_meters / tan_altitude;
    if !length.is_finite() {
        return None;
    }

    let center = centroid(&building.outer_ring);
    let local = project_ring(center, &building.outer_ring);

    // Unit vectors in the east/north frame: along the shadow and across it.
    let bearing = sun.shadow_bearing.to_radians();
    let (along_x, along_y) = (bearing.sin(), bearing.cos());
    let (across_x, across_y) = (along_y, -along_x);

    let mut min_proj = f64::INFINITY;
    let mut max_proj = f64::NEG_INFINITY;
    let mut min_pt = LocalPoint::default();
    let mut max_pt = LocalPoint::default();
    for p in &local {
        let proj = p.x * across_x + p.y * across_y;
        if proj < min_proj {
            min_proj = proj;
            min_pt = *p;
        }
        if proj > max_proj {
            max_proj = proj;
            max_pt = *p;
        }
    }
    if !(min_proj.is_finite() && max_proj.is_finite()) {
        return None;
    }

    let dx = along_x * length;
    let dy = along_y * length;
    let tip_min = LocalPoint::new(min_pt.x + dx, min_pt.y + dy);
    let tip_max = LocalPoint::new(max_pt.x + dx, max_pt.y + dy);

    let ring = [min_pt, max_pt, tip_max, tip_min, min_pt]
        .iter()
        .map(|&p| unproject(center, p))
        .collect();

    Some(ShadowPolygon {
        building_id: building.id.clone(),
        ring,
        length_meters: length,
    })
}

/// Outlines for every building that casts one at `instant`.
pub fn project_shadows(buildings: &[BuildingFootprint], instant: &DateTime<Utc>) -> Vec<ShadowPolygon> {
    buildings
        .iter()
        .filter_map(|b| project_shadow(b, instant))
        .collect()
}
